//! Alarm handles and their acknowledge/shelve workflow.

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Weak};

use crate::callbacks::{Callback, CallbackSet, SubscriptionId};
use crate::engine::{EngineInner, SyncEngine};
use crate::error::{MonicaError, Result};
use crate::point::PointHandle;
use crate::protocol::AlarmStateUpdate;
use crate::types::{AlarmRequest, AuthData};

/// A complete snapshot of an alarm's state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmState {
    pub point_name: String,
    pub priority: i64,
    pub is_alarmed: bool,
    pub acknowledged: bool,
    pub acknowledged_by: String,
    pub acknowledged_at: String,
    pub shelved: bool,
    pub shelved_by: String,
    pub shelved_at: String,
    pub guidance: String,
}

impl AlarmState {
    /// Builds a state from a server report, failing with the list of any absent fields.
    pub fn from_update(update: &AlarmStateUpdate) -> Result<Self> {
        let mut missing = Vec::new();
        macro_rules! take {
            ($field:ident, $name:literal) => {
                match &update.$field {
                    Some(v) => v.clone(),
                    None => {
                        missing.push($name);
                        Default::default()
                    }
                }
            };
        }

        let state = AlarmState {
            point_name: take!(point_name, "pointName"),
            priority: take!(priority, "priority") as i64,
            is_alarmed: take!(is_alarmed, "isAlarmed"),
            acknowledged: take!(acknowledged, "acknowledged"),
            acknowledged_by: take!(acknowledged_by, "acknowledgedBy"),
            acknowledged_at: take!(acknowledged_at, "acknowledgedAt"),
            shelved: take!(shelved, "shelved"),
            shelved_by: take!(shelved_by, "shelvedBy"),
            shelved_at: take!(shelved_at, "shelvedAt"),
            guidance: take!(guidance, "guidance"),
        };

        if missing.is_empty() {
            Ok(state)
        } else {
            Err(MonicaError::IncompleteAlarmState {
                point: update.point_name.clone().unwrap_or_default(),
                missing,
            })
        }
    }
}

#[derive(Clone)]
pub struct AlarmHandle {
    inner: Arc<AlarmInner>,
}

struct AlarmInner {
    engine: Weak<EngineInner>,
    point: PointHandle,
    state: Mutex<AlarmInnerState>,
}

struct AlarmInnerState {
    alarm: AlarmState,
    auth: AuthData,
    callbacks: CallbackSet<AlarmHandle>,
    /// Set once callbacks have run in the current poll cycle.
    fired: bool,
}

impl AlarmHandle {
    /// Registers the alarm's point with the engine and flags it as alarm-bearing.
    pub(crate) fn new(engine: &SyncEngine, alarm: AlarmState) -> Self {
        let point = match engine.add_points([alarm.point_name.as_str()]).pop() {
            Some(point) => point,
            None => PointHandle::plain(engine, &alarm.point_name),
        };
        point.set_alarm(true);

        Self {
            inner: Arc::new(AlarmInner {
                engine: engine.downgrade(),
                point,
                state: Mutex::new(AlarmInnerState {
                    alarm,
                    auth: AuthData::default(),
                    callbacks: CallbackSet::new(),
                    fired: false,
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, AlarmInnerState> {
        self.inner.state.lock()
    }

    pub fn name(&self) -> String {
        self.state().alarm.point_name.clone()
    }

    pub fn get_state(&self) -> AlarmState {
        self.state().alarm.clone()
    }

    pub fn point(&self) -> PointHandle {
        self.inner.point.clone()
    }

    /// Merges a report into the state. Reports for another point are ignored.
    pub fn update_state(&self, update: &AlarmStateUpdate) {
        {
            let mut state = self.state();
            let alarm = &mut state.alarm;
            if update.point_name.as_deref() != Some(alarm.point_name.as_str()) {
                return;
            }
            if let Some(priority) = update.priority {
                alarm.priority = priority as i64;
            }
            if let Some(v) = update.is_alarmed {
                alarm.is_alarmed = v;
            }
            if let Some(v) = update.acknowledged {
                alarm.acknowledged = v;
            }
            if let Some(v) = &update.acknowledged_by {
                alarm.acknowledged_by = v.clone();
            }
            if let Some(v) = &update.acknowledged_at {
                alarm.acknowledged_at = v.clone();
            }
            if let Some(v) = update.shelved {
                alarm.shelved = v;
            }
            if let Some(v) = &update.shelved_by {
                alarm.shelved_by = v.clone();
            }
            if let Some(v) = &update.shelved_at {
                alarm.shelved_at = v.clone();
            }
            if let Some(v) = &update.guidance {
                alarm.guidance = v.clone();
            }
        }
        self.fire_callbacks();
    }

    /// Runs the callbacks unless they already ran since the last `alarm_off`.
    pub fn fire_callbacks(&self) {
        let callbacks = {
            let mut state = self.state();
            if state.fired {
                return;
            }
            state.fired = true;
            state.callbacks.snapshot()
        };
        for callback in callbacks {
            callback(self);
        }
    }

    /// Clears the alarmed flag ahead of a new report and re-arms the callbacks.
    pub fn alarm_off(&self) {
        let mut state = self.state();
        state.alarm.is_alarmed = false;
        state.fired = false;
    }

    pub fn set_auth_data(&self, auth: &AuthData) -> &Self {
        self.state().auth = auth.clone();
        self
    }

    pub fn auth_data(&self) -> AuthData {
        self.state().auth.clone()
    }

    pub fn add_callback<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&AlarmHandle) + Send + Sync + 'static,
    {
        let callback: Callback<AlarmHandle> = Arc::new(callback);
        self.state().callbacks.add(callback)
    }

    pub(crate) fn insert_callback(&self, id: SubscriptionId, callback: Callback<AlarmHandle>) {
        self.state().callbacks.insert(id, callback);
    }

    pub fn remove_callback(&self, id: SubscriptionId) -> bool {
        self.state().callbacks.remove(id)
    }

    fn request(&self, value: bool, auth: Option<&AuthData>) -> Result<(SyncEngine, AlarmRequest)> {
        let engine = SyncEngine::upgrade(&self.inner.engine).ok_or(MonicaError::EngineGone)?;
        let state = self.state();
        let auth = match auth {
            Some(auth) => auth.clone().or(&state.auth),
            None => state.auth.clone(),
        };
        let request = AlarmRequest::new(&state.alarm.point_name, value, &auth);
        Ok((engine, request))
    }

    pub async fn acknowledge(&self, auth: Option<&AuthData>) -> Result<Value> {
        let (engine, request) = self.request(true, auth)?;
        engine.acknowledge_alarm(request).await
    }

    pub async fn unacknowledge(&self, auth: Option<&AuthData>) -> Result<Value> {
        let (engine, request) = self.request(false, auth)?;
        engine.acknowledge_alarm(request).await
    }

    /// Acknowledges an unacknowledged alarm and vice versa.
    pub async fn auto_acknowledge(&self, auth: Option<&AuthData>) -> Result<Value> {
        if self.state().alarm.acknowledged {
            self.unacknowledge(auth).await
        } else {
            self.acknowledge(auth).await
        }
    }

    pub async fn shelve(&self, auth: Option<&AuthData>) -> Result<Value> {
        let (engine, request) = self.request(true, auth)?;
        engine.shelve_alarm(request).await
    }

    pub async fn unshelve(&self, auth: Option<&AuthData>) -> Result<Value> {
        let (engine, request) = self.request(false, auth)?;
        engine.shelve_alarm(request).await
    }

    pub async fn auto_shelve(&self, auth: Option<&AuthData>) -> Result<Value> {
        if self.state().alarm.shelved {
            self.unshelve(auth).await
        } else {
            self.shelve(auth).await
        }
    }
}

impl PartialEq for AlarmHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for AlarmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlarmHandle")
            .field("state", &self.state().alarm)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn complete(name: &str, alarmed: bool) -> AlarmStateUpdate {
        AlarmStateUpdate {
            point_name: Some(name.to_string()),
            priority: Some(2.0),
            is_alarmed: Some(alarmed),
            acknowledged: Some(false),
            acknowledged_by: Some(String::new()),
            acknowledged_at: Some(String::new()),
            shelved: Some(false),
            shelved_by: Some(String::new()),
            shelved_at: Some(String::new()),
            guidance: Some("Call the duty astronomer".to_string()),
        }
    }

    #[test]
    fn test_complete_state() {
        let state = AlarmState::from_update(&complete("site.alarm", true)).unwrap();
        assert_eq!(state.point_name, "site.alarm");
        assert_eq!(state.priority, 2);
        assert!(state.is_alarmed);
    }

    #[test]
    fn test_incomplete_state_lists_missing_fields() {
        let update = AlarmStateUpdate {
            guidance: None,
            shelved_at: None,
            ..complete("site.alarm", true)
        };
        match AlarmState::from_update(&update) {
            Err(MonicaError::IncompleteAlarmState { point, missing }) => {
                assert_eq!(point, "site.alarm");
                assert_eq!(missing, vec!["shelvedAt", "guidance"]);
            }
            other => panic!("expected IncompleteAlarmState, got {:?}", other),
        }
    }

    #[test]
    fn test_state_serializes_camel_case() {
        let state = AlarmState::from_update(&complete("site.alarm", false)).unwrap();
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["pointName"], "site.alarm");
        assert_eq!(json["isAlarmed"], false);
    }
}
