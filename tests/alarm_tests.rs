mod common;

use common::*;
use monica_client::{AlarmHandle, AlarmRequest, AuthData, MonicaError};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn setup_transport() -> Arc<ScriptedTransport> {
        let transport = Arc::new(ScriptedTransport::new());
        transport.always("descriptions", json!({ "data": [] }));
        transport
    }

    fn counting_callback(engine: &monica_client::SyncEngine) -> Arc<AtomicUsize> {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        engine.add_alarm_callback(
            move |_: &AlarmHandle| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        hits
    }

    /// Callbacks run exactly once per poll whether the alarm is reported or not
    #[tokio::test]
    async fn test_alarm_lifecycle() {
        let transport = setup_transport();
        transport.reply("alarms", alarms_reply(vec![alarm("site.a", true)]));
        transport.reply("alarms", alarms_reply(vec![alarm("site.a", true)]));
        transport.reply("alarms", alarms_reply(vec![]));
        let engine = engine_with(transport.clone());
        let hits = counting_callback(&engine);

        let alarms = engine.immediate_alarm_poll().await.unwrap();
        assert_eq!(alarms.len(), 1);
        assert!(alarms[0].get_state().is_alarmed);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // The alarm's point is registered and described.
        let point = engine.get_point("site.a").remove(0);
        assert!(point.is_alarm());
        assert_eq!(transport.sent("descriptions", "points"), vec!["site.a".to_string()]);

        engine.immediate_alarm_poll().await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(engine.all_alarms().len(), 1);

        // Not reported any more, so it has cleared.
        engine.immediate_alarm_poll().await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(!engine.get_alarm("site.a").unwrap().get_state().is_alarmed);
    }

    /// Two alarms, then only one reported: the other clears and each fires once
    #[tokio::test]
    async fn test_unreported_alarm_clears() {
        let transport = setup_transport();
        transport.reply(
            "alarms",
            alarms_reply(vec![alarm("site.a", true), alarm("site.b", true)]),
        );
        transport.reply("alarms", alarms_reply(vec![alarm("site.a", true)]));
        let engine = engine_with(transport.clone());
        engine.immediate_alarm_poll().await.unwrap();

        let a = engine.get_alarm("site.a").unwrap();
        let b = engine.get_alarm("site.b").unwrap();
        let count = |alarm: &AlarmHandle| {
            let hits = Arc::new(AtomicUsize::new(0));
            let seen = hits.clone();
            alarm.add_callback(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
            hits
        };
        let a_hits = count(&a);
        let b_hits = count(&b);

        engine.immediate_alarm_poll().await.unwrap();

        assert!(a.get_state().is_alarmed);
        assert!(!b.get_state().is_alarmed);
        assert_eq!(a_hits.load(Ordering::SeqCst), 1);
        assert_eq!(b_hits.load(Ordering::SeqCst), 1);
    }

    /// A report missing fields cannot create an alarm
    #[tokio::test]
    async fn test_incomplete_alarm_is_skipped() {
        let transport = setup_transport();
        transport.reply(
            "alarms",
            alarms_reply(vec![
                json!({ "pointName": "site.b", "priority": 2 }),
                alarm("site.c", true),
            ]),
        );
        let engine = engine_with(transport.clone());

        let alarms = engine.immediate_alarm_poll().await.unwrap();

        assert_eq!(alarms.len(), 1);
        assert_eq!(alarms[0].name(), "site.c");
        assert!(engine.get_alarm("site.b").is_none());
    }

    /// A failed poll leaves every alarm as it was
    #[tokio::test]
    async fn test_failed_poll_keeps_state() {
        let transport = setup_transport();
        transport.reply("alarms", alarms_reply(vec![alarm("site.a", true)]));
        transport.fail("alarms");
        let engine = engine_with(transport.clone());

        engine.immediate_alarm_poll().await.unwrap();
        assert!(engine.immediate_alarm_poll().await.is_err());

        assert!(engine.get_alarm("site.a").unwrap().get_state().is_alarmed);
    }

    /// Updates to an existing alarm merge field by field
    #[tokio::test]
    async fn test_existing_alarm_is_updated() {
        let transport = setup_transport();
        transport.reply("alarms", alarms_reply(vec![alarm("site.a", true)]));
        transport.reply(
            "alarms",
            alarms_reply(vec![json!({
                "pointName": "site.a",
                "isAlarmed": true,
                "acknowledged": true,
                "acknowledgedBy": "observer",
                "priority": "3"
            })]),
        );
        let engine = engine_with(transport.clone());

        engine.immediate_alarm_poll().await.unwrap();
        engine.immediate_alarm_poll().await.unwrap();

        let state = engine.get_alarm("site.a").unwrap().get_state();
        assert!(state.acknowledged);
        assert_eq!(state.acknowledged_by, "observer");
        assert_eq!(state.priority, 3);
        assert_eq!(state.guidance, "Check the site");
    }

    /// Shelving forces one full poll, after which polls go back to alarmed-only
    #[tokio::test]
    async fn test_shelve_forces_full_poll() {
        let transport = setup_transport();
        transport.always("alarms", alarms_reply(vec![alarm("site.a", true)]));
        transport.always("allalarms", alarms_reply(vec![alarm("site.a", true)]));
        transport.always("alarmshelve", json!({}));
        let engine = engine_with(transport.clone());

        let alarm = engine.immediate_alarm_poll().await.unwrap().remove(0);
        alarm
            .shelve(Some(&AuthData::new("observer", "secret")))
            .await
            .unwrap();

        engine.immediate_alarm_poll().await.unwrap();
        engine.immediate_alarm_poll().await.unwrap();

        assert_eq!(transport.count("alarms"), 2);
        assert_eq!(transport.count("allalarms"), 1);
        assert_eq!(
            transport.sent("alarmshelve", "shelves"),
            vec!["site.a$true;observer$secret".to_string()]
        );
    }

    /// A failed full poll is retried as a full poll
    #[tokio::test]
    async fn test_failed_full_poll_is_retried() {
        let transport = setup_transport();
        transport.always("alarms", alarms_reply(vec![alarm("site.a", true)]));
        transport.fail("allalarms");
        transport.always("allalarms", alarms_reply(vec![alarm("site.a", true)]));
        transport.always("alarmshelve", json!({}));
        let engine = engine_with(transport.clone());

        let alarm = engine.immediate_alarm_poll().await.unwrap().remove(0);
        alarm.shelve(None).await.unwrap();

        assert!(engine.immediate_alarm_poll().await.is_err());
        engine.immediate_alarm_poll().await.unwrap();
        engine.immediate_alarm_poll().await.unwrap();

        assert_eq!(transport.count("allalarms"), 2);
        assert_eq!(transport.count("alarms"), 2);
    }

    /// Cached credentials reach new alarms, and empty fields keep the cached value
    #[tokio::test]
    async fn test_auth_propagation() {
        let transport = setup_transport();
        transport.always("alarms", alarms_reply(vec![alarm("site.a", true)]));
        transport.always("alarmack", json!({}));
        let engine = engine_with(transport.clone());

        engine.update_alarm_auth_data(AuthData::new("observer", "secret"), false);
        let alarm = engine.immediate_alarm_poll().await.unwrap().remove(0);
        assert_eq!(alarm.auth_data(), AuthData::new("observer", "secret"));

        engine.update_alarm_auth_data(AuthData::new("", "rotated"), true);
        assert_eq!(alarm.auth_data(), AuthData::new("observer", "rotated"));

        // The alarm is unacknowledged, so this acknowledges it.
        alarm.auto_acknowledge(None).await.unwrap();
        alarm
            .unacknowledge(Some(&AuthData::new("operator", "")))
            .await
            .unwrap();

        assert_eq!(
            transport.sent("alarmack", "acknowledgements"),
            vec![
                "site.a$true;observer$rotated".to_string(),
                "site.a$false;operator$rotated".to_string(),
            ]
        );
    }

    /// Incomplete alarm requests are refused before anything is sent
    #[tokio::test]
    async fn test_invalid_alarm_request_sends_nothing() {
        let transport = setup_transport();
        let engine = engine_with(transport.clone());

        let result = engine
            .acknowledge_alarm(AlarmRequest {
                point: Some("site.a".into()),
                value: Some("true".into()),
                user: None,
                pass: Some("secret".into()),
            })
            .await;

        assert!(matches!(result, Err(MonicaError::InvalidRequest { .. })));
        assert!(transport.requests().is_empty());
    }

    /// Engine-level callbacks can be applied to existing alarms and removed everywhere
    #[tokio::test]
    async fn test_alarm_callback_registration() {
        let transport = setup_transport();
        transport.always("alarms", alarms_reply(vec![alarm("site.a", true)]));
        let engine = engine_with(transport.clone());
        engine.immediate_alarm_poll().await.unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let id = engine.add_alarm_callback(
            move |_: &AlarmHandle| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );

        engine.immediate_alarm_poll().await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(engine.remove_alarm_callback(id));
        engine.immediate_alarm_poll().await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!engine.remove_alarm_callback(id));
    }

    /// The all-alarms callback sees the full list after every poll
    #[tokio::test]
    async fn test_all_alarm_callback() {
        let transport = setup_transport();
        transport.reply(
            "alarms",
            alarms_reply(vec![alarm("site.a", true), alarm("site.b", true)]),
        );
        transport.reply("alarms", alarms_reply(vec![]));
        let engine = engine_with(transport.clone());

        let sizes = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = sizes.clone();
        let id = engine.add_all_alarm_callback(move |alarms: &[AlarmHandle]| {
            let alarmed = alarms.iter().filter(|a| a.get_state().is_alarmed).count();
            seen.lock().push((alarms.len(), alarmed));
        });

        engine.immediate_alarm_poll().await.unwrap();
        engine.immediate_alarm_poll().await.unwrap();
        assert_eq!(*sizes.lock(), vec![(2, 2), (2, 0)]);

        assert!(engine.remove_all_alarm_callback(id));
    }

    /// A poll started while another is outstanding returns the known alarms untouched
    #[tokio::test]
    async fn test_overlapping_alarm_poll_is_skipped() {
        let (transport, gate) = ScriptedTransport::gated();
        let transport = Arc::new(transport);
        transport.always("alarms", alarms_reply(vec![]));
        transport.always("allalarms", alarms_reply(vec![]));
        let engine = engine_with(transport.clone());

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.immediate_alarm_poll().await })
        };
        while transport.count("alarms") == 0 {
            tokio::task::yield_now().await;
        }

        let skipped = engine.poll_all_alarms().await.unwrap();
        assert!(skipped.is_empty());
        assert_eq!(transport.count("allalarms"), 0);
        assert_eq!(engine.metrics().skipped_alarm_cycles, 1);

        gate.add_permits(1);
        first.await.unwrap().unwrap();

        // The skipped full poll is made up by the next one.
        gate.add_permits(2);
        engine.immediate_alarm_poll().await.unwrap();
        engine.immediate_alarm_poll().await.unwrap();
        assert_eq!(transport.count("allalarms"), 1);
        assert_eq!(transport.count("alarms"), 2);
    }

    /// Periodic polling runs at the configured period until stopped
    #[tokio::test(start_paused = true)]
    async fn test_alarm_polling_timer() {
        let transport = setup_transport();
        transport.always("alarms", alarms_reply(vec![]));
        let engine = engine_with(transport.clone());

        engine.start_alarm_polling(Some(Duration::ZERO));
        assert!(!engine.is_alarm_polling());

        engine.start_alarm_polling(Some(Duration::from_secs(5)));
        assert!(engine.is_alarm_polling());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(transport.count("alarms"), 2);

        engine.stop_alarm_polling();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(transport.count("alarms"), 2);
    }
}
