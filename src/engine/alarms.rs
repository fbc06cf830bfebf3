// engine/alarms.rs

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::timer::{self, InFlight};
use super::SyncEngine;
use crate::alarm::{AlarmHandle, AlarmState};
use crate::callbacks::{Callback, SubscriptionId};
use crate::error::Result;
use crate::protocol::{self, Action};
use crate::types::{AuthData, EngineEvent};

impl SyncEngine {
    /// Starts periodic alarm polling, optionally with a new period. A zero period
    /// leaves polling off.
    pub fn start_alarm_polling(&self, period: Option<Duration>) {
        let period = {
            let mut state = self.state();
            if let Some(period) = period {
                state.alarm_poll_period = period;
            }
            state.alarm_timer = None;
            state.alarm_poll_period
        };
        if period.is_zero() {
            debug!("Alarm polling disabled for {}", self.server_name());
            return;
        }

        let weak = self.downgrade();
        let timer = timer::spawn_periodic(period, move || {
            let engine = SyncEngine::upgrade(&weak);
            async move {
                match engine {
                    Some(engine) => {
                        let _ = engine.immediate_alarm_poll().await;
                        true
                    }
                    None => false,
                }
            }
        });
        self.state().alarm_timer = timer;
    }

    pub fn stop_alarm_polling(&self) {
        self.state().alarm_timer = None;
    }

    pub fn is_alarm_polling(&self) -> bool {
        self.state().alarm_timer.is_some()
    }

    /// Polls now: every alarm if a shelve happened since the last poll, otherwise
    /// only the alarmed ones.
    pub async fn immediate_alarm_poll(&self) -> Result<Vec<AlarmHandle>> {
        self.alarm_cycle(false).await
    }

    /// Polls the full alarm set now.
    pub async fn poll_all_alarms(&self) -> Result<Vec<AlarmHandle>> {
        self.alarm_cycle(true).await
    }

    async fn alarm_cycle(&self, force_all: bool) -> Result<Vec<AlarmHandle>> {
        let _guard = match InFlight::acquire(&self.inner.alarms_in_flight) {
            Some(guard) => guard,
            None => {
                debug!("Alarm request still in flight; skipping alarm poll");
                self.inner.metrics.record_skipped_alarm_cycle();
                if force_all {
                    self.state().need_all_alarms = true;
                }
                return Ok(self.all_alarms());
            }
        };

        let all = {
            let mut state = self.state();
            let needed = std::mem::take(&mut state.need_all_alarms);
            force_all || needed
        };
        let action = if all { Action::AllAlarms } else { Action::Alarms };

        let result = match self
            .send(action, protocol::alarms_form(self.server_name(), all))
            .await
        {
            Ok(data) => protocol::parse_alarm_states(&data, action),
            Err(e) => Err(e),
        };
        let reports = match result {
            Ok(reports) => reports,
            Err(e) => {
                // The full set is still owed to the next poll.
                if all {
                    self.state().need_all_alarms = true;
                }
                return Err(e);
            }
        };

        // Only alarmed points are reported, so anything not mentioned has cleared.
        for alarm in self.all_alarms() {
            alarm.alarm_off();
        }

        let mut created = false;
        for report in &reports {
            let name = match report.point_name.as_deref() {
                Some(name) if !name.is_empty() => name,
                _ => {
                    warn!("Skipping alarm state without a point name");
                    continue;
                }
            };

            if let Some(existing) = self.get_alarm(name) {
                existing.update_state(report);
                continue;
            }

            let state = match AlarmState::from_update(report) {
                Ok(state) => state,
                Err(e) => {
                    warn!("{}", e);
                    continue;
                }
            };

            let alarm = AlarmHandle::new(self, state);
            let (auth, callbacks) = {
                let state = self.state();
                (state.alarm_auth.clone(), state.alarm_callbacks.entries())
            };
            alarm.set_auth_data(&auth);
            for (id, callback) in callbacks {
                alarm.insert_callback(id, callback);
            }
            self.state().alarms.push(alarm.clone());
            alarm.fire_callbacks();
            created = true;
        }

        if created {
            let _ = self.get_descriptions(None).await;
        }

        let alarms = self.all_alarms();
        for alarm in &alarms {
            alarm.fire_callbacks();
        }

        let all_alarm_callbacks = self.state().all_alarm_callbacks.snapshot();
        for callback in all_alarm_callbacks {
            callback(alarms.as_slice());
        }

        self.server_event(|server| EngineEvent::Alarms { server });
        Ok(alarms)
    }

    pub fn get_alarm(&self, name: &str) -> Option<AlarmHandle> {
        self.state()
            .alarms
            .iter()
            .find(|alarm| alarm.name() == name)
            .cloned()
    }

    pub fn get_alarms<I, S>(&self, names: I) -> Vec<Option<AlarmHandle>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .map(|name| self.get_alarm(name.as_ref()))
            .collect()
    }

    pub fn all_alarms(&self) -> Vec<AlarmHandle> {
        self.state().alarms.clone()
    }

    /// Registers a callback for every alarm created from now on, and optionally for
    /// the alarms already known.
    pub fn add_alarm_callback<F>(&self, callback: F, apply_to_existing: bool) -> SubscriptionId
    where
        F: Fn(&AlarmHandle) + Send + Sync + 'static,
    {
        let callback: Callback<AlarmHandle> = Arc::new(callback);
        let (id, existing) = {
            let mut state = self.state();
            let id = state.alarm_callbacks.add(callback.clone());
            (id, state.alarms.clone())
        };
        if apply_to_existing {
            for alarm in existing {
                alarm.insert_callback(id, callback.clone());
            }
        }
        id
    }

    /// Removes the callback from the engine and from every alarm it was given to.
    pub fn remove_alarm_callback(&self, id: SubscriptionId) -> bool {
        let (removed, alarms) = {
            let mut state = self.state();
            (state.alarm_callbacks.remove(id), state.alarms.clone())
        };
        let mut removed_any = removed;
        for alarm in alarms {
            removed_any |= alarm.remove_callback(id);
        }
        removed_any
    }

    /// Registers a callback that receives the whole alarm list after every poll.
    pub fn add_all_alarm_callback<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&[AlarmHandle]) + Send + Sync + 'static,
    {
        let callback: Callback<[AlarmHandle]> = Arc::new(callback);
        self.state().all_alarm_callbacks.add(callback)
    }

    pub fn remove_all_alarm_callback(&self, id: SubscriptionId) -> bool {
        self.state().all_alarm_callbacks.remove(id)
    }

    /// Updates the credentials given to new alarms. Empty fields keep their current
    /// value. With `apply_to_existing`, every known alarm is updated too.
    pub fn update_alarm_auth_data(&self, auth: AuthData, apply_to_existing: bool) {
        let (merged, alarms) = {
            let mut state = self.state();
            let merged = auth.or(&state.alarm_auth);
            state.alarm_auth = merged.clone();
            (merged, state.alarms.clone())
        };
        if apply_to_existing {
            for alarm in alarms {
                alarm.set_auth_data(&merged);
            }
        }
    }

    pub fn alarm_auth_data(&self) -> AuthData {
        self.state().alarm_auth.clone()
    }
}
