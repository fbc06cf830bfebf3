//! The per-server synchronisation engine.
//!
//! A [`SyncEngine`] owns every point and alarm handle for one MoniCA server. Handles
//! queue themselves for refresh; the engine batches the queue into one `points`
//! request per cycle and hands the results back by send order.

mod alarms;
mod poll;
pub(crate) mod timer;

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde_json::Value;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, warn};

use crate::alarm::AlarmHandle;
use crate::callbacks::CallbackSet;
use crate::config::EngineConfig;
use crate::crypto::RsaKey;
use crate::error::{MonicaError, Result};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::point::PointHandle;
use crate::protocol::{self, Action, Form};
use crate::transport::{HttpTransport, Transport};
use crate::types::{AlarmRequest, AuthData, EngineEvent, SetPointRequest, TimeSeriesSpec};

use self::timer::TimerTask;

const EVENT_CAPACITY: usize = 64;

pub type ErrorHandler = Arc<dyn Fn(&MonicaError) + Send + Sync>;

/// Cheaply cloneable handle to one engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    state: Mutex<EngineState>,
    metrics: EngineMetrics,
    events: broadcast::Sender<EngineEvent>,
    connected: watch::Sender<bool>,
    points_in_flight: AtomicBool,
    alarms_in_flight: AtomicBool,
    error_handler: RwLock<ErrorHandler>,
}

#[derive(Default)]
struct EngineState {
    catalog: Vec<String>,
    points: Vec<PointHandle>,
    pending: Vec<PointHandle>,
    alarms: Vec<AlarmHandle>,
    alarm_auth: AuthData,
    alarm_callbacks: CallbackSet<AlarmHandle>,
    all_alarm_callbacks: CallbackSet<[AlarmHandle]>,
    need_all_alarms: bool,
    alarm_poll_period: Duration,
    rsa_key: Option<RsaKey>,
    poll_timer: Option<TimerTask>,
    alarm_timer: Option<TimerTask>,
}

impl SyncEngine {
    pub fn new(config: EngineConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (connected, _) = watch::channel(false);
        let default_handler: ErrorHandler = Arc::new(|e: &MonicaError| error!("{}", e));

        let state = EngineState {
            alarm_auth: config.alarm_auth.clone(),
            alarm_poll_period: config.alarm_poll_period,
            ..Default::default()
        };

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                transport,
                state: Mutex::new(state),
                metrics: EngineMetrics::new(),
                events,
                connected,
                points_in_flight: AtomicBool::new(false),
                alarms_in_flight: AtomicBool::new(false),
                error_handler: RwLock::new(default_handler),
            }),
        })
    }

    /// An engine talking HTTP to the configured endpoint.
    pub fn with_http(config: EngineConfig) -> Result<Self> {
        let transport = HttpTransport::new(&config)?;
        Self::new(config, Arc::new(transport))
    }

    pub(crate) fn upgrade(weak: &Weak<EngineInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub(crate) fn downgrade(&self) -> Weak<EngineInner> {
        Arc::downgrade(&self.inner)
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.inner.state.lock()
    }

    pub fn server_name(&self) -> &str {
        &self.inner.config.server_name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub(crate) fn update_interval(&self) -> Duration {
        self.inner.config.update_interval
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Replaces the handler invoked for every failed request. The default logs it.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&MonicaError) + Send + Sync + 'static,
    {
        *self.inner.error_handler.write() = Arc::new(handler);
    }

    fn publish(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn server_event(&self, make: fn(String) -> EngineEvent) {
        self.publish(make(self.server_name().to_string()));
    }

    /// Sends one request, recording metrics and routing failures to the error handler.
    pub(crate) async fn send(&self, action: Action, form: Form) -> Result<Value> {
        let metrics = &self.inner.metrics;
        metrics.record_request();
        debug!("Sending '{}' to {}", action, self.server_name());

        let started = Instant::now();
        let result = self
            .inner
            .transport
            .post(form)
            .await
            .map_err(|e| e.with_context(action.as_str()));
        metrics.record_latency(started.elapsed());

        if let Err(e) = &result {
            metrics.record_error(action, e.to_string());
            let handler = self.inner.error_handler.read().clone();
            handler(e);
        }
        result
    }

    /// Fetches the point catalog (and the RSA key when encryption is required),
    /// then marks the engine connected.
    pub async fn connect(&self) -> Result<()> {
        let data = self
            .send(Action::Names, protocol::names_form(self.server_name()))
            .await?;
        let names = protocol::parse_names(&data)?;
        debug!("{} lists {} points", self.server_name(), names.len());
        self.state().catalog = names;

        if self.inner.config.require_encryption {
            match self.fetch_rsa_key().await {
                Ok(key) => self.state().rsa_key = Some(key),
                Err(e) => warn!("Could not retrieve the server RSA key: {}", e),
            }
        }

        self.server_event(|server| EngineEvent::Connected { server });
        self.inner.connected.send_replace(true);
        Ok(())
    }

    async fn fetch_rsa_key(&self) -> Result<RsaKey> {
        let data = self
            .send(Action::RsaKey, protocol::rsakey_form(self.server_name()))
            .await?;
        let (modulus, exponent) = protocol::parse_rsa_key(&data)?;
        RsaKey::from_decimal(&modulus, &exponent)
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Completes once `connect` has succeeded; immediately if it already has.
    pub async fn wait_connected(&self) {
        let mut receiver = self.inner.connected.subscribe();
        let _ = receiver.wait_for(|connected| *connected).await;
    }

    pub fn has_rsa_key(&self) -> bool {
        self.state().rsa_key.is_some()
    }

    pub fn points_list(&self) -> Vec<String> {
        self.state().catalog.clone()
    }

    pub fn is_point(&self, name: &str) -> bool {
        self.state().catalog.iter().any(|n| n == name)
    }

    /// Returns a handle per name, reusing an existing plain handle where there is one.
    /// New handles are queued for their first value.
    pub fn add_points<I, S>(&self, names: I) -> Vec<PointHandle>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut handles = Vec::new();
        let mut created = Vec::new();
        {
            let mut state = self.state();
            for name in names {
                let name = name.as_ref();
                let existing = state
                    .points
                    .iter()
                    .find(|p| p.name() == name && !p.is_time_series())
                    .cloned();
                let handle = match existing {
                    Some(handle) => handle,
                    None => {
                        let handle = PointHandle::plain(self, name);
                        state.points.push(handle.clone());
                        created.push(handle.clone());
                        handle
                    }
                };
                handles.push(handle);
            }
        }
        self.request_update(&created);
        handles
    }

    /// Always creates a new time-series handle, even when one exists for the name.
    pub fn add_time_series(&self, spec: TimeSeriesSpec) -> PointHandle {
        let handle = PointHandle::time_series(self, spec);
        self.state().points.push(handle.clone());
        self.request_update(std::slice::from_ref(&handle));
        handle
    }

    /// Stops and forgets the handles. Responses still in flight for them are dropped.
    pub fn remove_points(&self, handles: &[PointHandle]) {
        for handle in handles {
            handle.mark_removed();
        }
        let mut state = self.state();
        state.points.retain(|p| !handles.contains(p));
        state.pending.retain(|p| !handles.contains(p));
    }

    pub fn get_point(&self, name: &str) -> Vec<PointHandle> {
        self.state()
            .points
            .iter()
            .filter(|p| p.name() == name)
            .cloned()
            .collect()
    }

    pub fn get_points<I, S>(&self, names: I) -> Vec<Vec<PointHandle>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .map(|name| self.get_point(name.as_ref()))
            .collect()
    }

    pub fn all_points(&self) -> Vec<PointHandle> {
        self.state().points.clone()
    }

    /// Queues handles for the next poll; a handle already queued is not added twice.
    pub fn request_update(&self, handles: &[PointHandle]) {
        let mut state = self.state();
        for handle in handles {
            if handle.is_removed() || state.pending.contains(handle) {
                continue;
            }
            state.pending.push(handle.clone());
        }
    }

    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    /// Fetches descriptions for one handle's name, or for every handle still lacking
    /// one. Every registered handle with a returned name receives the description.
    pub async fn get_descriptions(&self, handle: Option<&PointHandle>) -> Result<()> {
        let names: Vec<String> = match handle {
            Some(handle) => vec![handle.name().to_string()],
            None => {
                let points = self.all_points();
                let mut names: Vec<String> = Vec::new();
                for point in points.iter().filter(|p| !p.has_description()) {
                    if !names.iter().any(|n| n == point.name()) {
                        names.push(point.name().to_string());
                    }
                }
                names
            }
        };

        if names.is_empty() {
            return Ok(());
        }

        let data = self
            .send(
                Action::Descriptions,
                protocol::descriptions_form(self.server_name(), &names),
            )
            .await?;
        let descriptions = protocol::parse_descriptions(&data)?;

        let points = self.all_points();
        for description in &descriptions {
            for point in points.iter().filter(|p| p.name() == description.point_name) {
                point.set_point_details(description);
            }
        }

        self.server_event(|server| EngineEvent::Descriptions { server });
        Ok(())
    }

    /// Runs one poll cycle now.
    pub async fn immediate_update(&self) -> Result<()> {
        self.poll_cycle().await
    }

    /// Starts polling every `update_interval`. Does nothing if already running.
    pub fn start_updating(&self) {
        if self.is_updating() {
            return;
        }

        let weak = self.downgrade();
        let timer = timer::spawn_periodic(self.update_interval(), move || {
            let engine = SyncEngine::upgrade(&weak);
            async move {
                match engine {
                    Some(engine) => {
                        // Failures were already reported by `send`.
                        let _ = engine.poll_cycle().await;
                        true
                    }
                    None => false,
                }
            }
        });
        self.state().poll_timer = timer;
    }

    pub fn stop_updating(&self) {
        self.state().poll_timer = None;
    }

    pub fn is_updating(&self) -> bool {
        self.state().poll_timer.is_some()
    }

    /// Asks the server to set a point. The raw response is returned.
    pub async fn set_point_value(&self, request: SetPointRequest) -> Result<Value> {
        let mut form = protocol::set_points_form(self.server_name(), &request)?;

        if self.inner.config.require_encryption && !request.prevent_encryption {
            let key = self.state().rsa_key.clone();
            match key {
                Some(key) => {
                    let encrypted = SetPointRequest {
                        user: request.user.as_deref().map(|u| key.encrypt(u)),
                        pass: request.pass.as_deref().map(|p| key.encrypt(p)),
                        ..request
                    };
                    form = protocol::set_points_form(self.server_name(), &encrypted)?;
                }
                None => warn!("Encryption required but no RSA key is known; sending credentials as given"),
            }
        }

        self.send(Action::SetPoints, form).await
    }

    pub async fn acknowledge_alarm(&self, request: AlarmRequest) -> Result<Value> {
        let form = protocol::alarm_form(self.server_name(), Action::AlarmAck, &request)?;
        self.send(Action::AlarmAck, form).await
    }

    /// Shelving changes the alarmed set, so the next alarm poll fetches every alarm.
    pub async fn shelve_alarm(&self, request: AlarmRequest) -> Result<Value> {
        let form = protocol::alarm_form(self.server_name(), Action::AlarmShelve, &request)?;
        self.state().need_all_alarms = true;
        self.send(Action::AlarmShelve, form).await
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("server", &self.server_name())
            .field("connected", &self.is_connected())
            .finish()
    }
}
