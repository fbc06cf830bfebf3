// Shared fixtures for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use monica_client::protocol::{form_action, form_value, Form};
use monica_client::{EngineConfig, MonicaError, Result, SyncEngine, Transport};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Semaphore;

pub const SERVER: &str = "monhost-test";

enum Reply {
    Json(Value),
    Fail,
}

/// An in-memory server: replies are queued per action, and a fallback reply per
/// action is used once the queue runs dry. Every request is logged before any
/// gating, so tests can see what went out while a reply is held back.
#[derive(Default)]
pub struct ScriptedTransport {
    queued: Mutex<HashMap<String, VecDeque<Reply>>>,
    fallback: Mutex<HashMap<String, Value>>,
    log: Mutex<Vec<Form>>,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every request waits for a permit from the returned semaphore.
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        (
            Self {
                gate: Some(gate.clone()),
                ..Default::default()
            },
            gate,
        )
    }

    pub fn reply(&self, action: &str, body: Value) -> &Self {
        self.queued
            .lock()
            .entry(action.to_string())
            .or_default()
            .push_back(Reply::Json(body));
        self
    }

    pub fn fail(&self, action: &str) -> &Self {
        self.queued
            .lock()
            .entry(action.to_string())
            .or_default()
            .push_back(Reply::Fail);
        self
    }

    pub fn always(&self, action: &str, body: Value) -> &Self {
        self.fallback.lock().insert(action.to_string(), body);
        self
    }

    pub fn requests(&self) -> Vec<Form> {
        self.log.lock().clone()
    }

    /// The payloads sent for `action`, in order.
    pub fn sent(&self, action: &str, key: &str) -> Vec<String> {
        self.log
            .lock()
            .iter()
            .filter(|form| form_action(form) == Some(action))
            .filter_map(|form| form_value(form, key).map(str::to_string))
            .collect()
    }

    pub fn count(&self, action: &str) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|form| form_action(form) == Some(action))
            .count()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn post(&self, form: Form) -> Result<Value> {
        let action = form_action(&form).unwrap_or_default().to_string();
        self.log.lock().push(form);

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let queued = self
            .queued
            .lock()
            .get_mut(&action)
            .and_then(|replies| replies.pop_front());
        match queued {
            Some(Reply::Json(body)) => Ok(body),
            Some(Reply::Fail) => Err(MonicaError::connection_error("scripted failure", "test")),
            None => match self.fallback.lock().get(&action) {
                Some(body) => Ok(body.clone()),
                None => Err(MonicaError::connection_error(
                    format!("no reply scripted for '{}'", action),
                    "test".to_string(),
                )),
            },
        }
    }
}

pub fn config() -> EngineConfig {
    EngineConfig::for_server(SERVER)
}

pub fn engine_with(transport: Arc<ScriptedTransport>) -> SyncEngine {
    engine_with_config(config(), transport)
}

pub fn engine_with_config(config: EngineConfig, transport: Arc<ScriptedTransport>) -> SyncEngine {
    let engine = SyncEngine::new(config, transport).unwrap();
    // Keep scripted failures out of the test output.
    engine.set_error_handler(|_| {});
    engine
}

pub fn slot(name: &str, value: Value, time: &str, ok: bool) -> Value {
    json!({ "pointName": name, "value": value, "time": time, "errorState": ok })
}

pub fn points_reply(slots: Vec<Value>) -> Value {
    json!({ "pointData": slots })
}

pub fn alarm(name: &str, alarmed: bool) -> Value {
    json!({
        "pointName": name,
        "priority": 1,
        "isAlarmed": alarmed,
        "acknowledged": false,
        "acknowledgedBy": "",
        "acknowledgedAt": "",
        "shelved": false,
        "shelvedBy": "",
        "shelvedAt": "",
        "guidance": "Check the site"
    })
}

pub fn alarms_reply(states: Vec<Value>) -> Value {
    json!({ "alarmStates": states })
}
