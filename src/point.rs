//! Handles for subscribed points.

use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::callbacks::{Callback, CallbackSet, SubscriptionId};
use crate::constants::SET_VALUE_FAILED;
use crate::engine::timer::{spawn_periodic, TimerTask};
use crate::engine::{EngineInner, SyncEngine};
use crate::error::{MonicaError, Result};
use crate::protocol::{parse_set_result, PointDescription};
use crate::types::{
    Datum, PointDetails, Reading, SetPointRequest, SetValueRequest, StartTime, TimeRepresentation,
    TimeSeriesOptions, TimeSeriesSpec, TimeSeriesUpdate,
};
use crate::value::{CellUpdate, OutputShape, ReadOptions, ValueCell};

/// One subscribed point, either a plain point holding a single value or a
/// time-series holding a bounded window of values.
///
/// Handles are cheap to clone; clones refer to the same point.
#[derive(Clone)]
pub struct PointHandle {
    inner: Arc<PointInner>,
}

struct PointInner {
    id: Uuid,
    name: String,
    server_name: String,
    time_series: bool,
    engine: Weak<EngineInner>,
    /// Used while the server's own update time is unknown.
    fallback_interval: Duration,
    interval_in_flight: AtomicBool,
    state: Mutex<PointState>,
}

struct PointState {
    description: String,
    units: String,
    update_time: Option<f64>,
    described: bool,
    options: TimeSeriesOptions,
    minimum_update_interval: Duration,
    initialised: bool,
    /// Bumped on every options change; an interval batch fetched under an older
    /// value is discarded.
    generation: u64,
    time_representation: TimeRepresentation,
    alarm: bool,
    removed: bool,
    cells: VecDeque<ValueCell>,
    callbacks: CallbackSet<PointHandle>,
    timer: Option<TimerTask>,
}

impl PointHandle {
    pub(crate) fn plain(engine: &SyncEngine, name: &str) -> Self {
        Self::build(engine, name, false, TimeSeriesOptions::default(), None)
    }

    pub(crate) fn time_series(engine: &SyncEngine, spec: TimeSeriesSpec) -> Self {
        Self::build(
            engine,
            &spec.point_name,
            true,
            spec.options,
            spec.minimum_update_interval,
        )
    }

    fn build(
        engine: &SyncEngine,
        name: &str,
        time_series: bool,
        options: TimeSeriesOptions,
        minimum_update_interval: Option<Duration>,
    ) -> Self {
        let mut cells = VecDeque::new();
        cells.push_back(ValueCell::new());

        Self {
            inner: Arc::new(PointInner {
                id: Uuid::new_v4(),
                name: name.to_string(),
                server_name: engine.server_name().to_string(),
                time_series,
                engine: engine.downgrade(),
                fallback_interval: engine.update_interval(),
                interval_in_flight: AtomicBool::new(false),
                state: Mutex::new(PointState {
                    description: String::new(),
                    units: String::new(),
                    update_time: None,
                    described: false,
                    options,
                    minimum_update_interval: minimum_update_interval.unwrap_or_default(),
                    initialised: false,
                    generation: 0,
                    time_representation: if time_series {
                        TimeRepresentation::UnixMs
                    } else {
                        TimeRepresentation::String
                    },
                    alarm: false,
                    removed: false,
                    cells,
                    callbacks: CallbackSet::new(),
                    timer: None,
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, PointState> {
        self.inner.state.lock()
    }

    fn engine(&self) -> Option<SyncEngine> {
        SyncEngine::upgrade(&self.inner.engine)
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_time_series(&self) -> bool {
        self.inner.time_series
    }

    pub fn get_point_details(&self) -> PointDetails {
        let state = self.state();
        PointDetails {
            name: self.inner.name.clone(),
            description: state.description.clone(),
            units: state.units.clone(),
            server_name: self.inner.server_name.clone(),
        }
    }

    pub fn has_description(&self) -> bool {
        self.state().described
    }

    /// Seconds between server-side updates, once a description has supplied it.
    pub fn update_time(&self) -> Option<f64> {
        self.state().update_time
    }

    /// Fills in whatever is still unset and starts the refresh timer.
    pub fn set_point_details(&self, details: &PointDescription) {
        {
            let mut state = self.state();
            if state.removed {
                return;
            }
            if let Some(description) = &details.description {
                if state.description.is_empty() {
                    state.description = description.clone();
                }
            }
            if let Some(units) = &details.units {
                if state.units.is_empty() {
                    state.units = units.clone();
                }
            }
            if state.update_time.is_none() {
                state.update_time = details.update_time.filter(|t| *t > 0.0);
            }
            state.described = true;
        }
        self.start_updating();
    }

    /// Forgets the description and asks the server for it again.
    pub async fn reset_point_details(&self) -> Result<()> {
        {
            let mut state = self.state();
            state.description.clear();
            state.units.clear();
            state.update_time = None;
            state.described = false;
        }
        let engine = self.engine().ok_or(MonicaError::EngineGone)?;
        engine.get_descriptions(Some(self)).await
    }

    pub fn time_series_options(&self) -> TimeSeriesOptions {
        self.state().options.clone()
    }

    pub fn time_series_initialised(&self) -> bool {
        self.state().initialised
    }

    pub fn time_representation(&self) -> TimeRepresentation {
        self.state().time_representation
    }

    pub fn is_alarm(&self) -> bool {
        self.state().alarm
    }

    pub fn set_alarm(&self, alarm: bool) {
        self.state().alarm = alarm;
    }

    pub fn is_removed(&self) -> bool {
        self.state().removed
    }

    pub(crate) fn mark_removed(&self) {
        let mut state = self.state();
        state.removed = true;
        state.timer = None;
    }

    /// The period of the refresh timer.
    pub fn refresh_interval(&self) -> Duration {
        let state = self.state();
        self.compute_interval(&state)
    }

    fn compute_interval(&self, state: &PointState) -> Duration {
        let seconds = if self.inner.time_series {
            let span = state.options.span_time * 60.0;
            let interval = if state.options.max_points > 0 {
                span / state.options.max_points as f64
            } else {
                span
            };
            interval.max(state.minimum_update_interval.as_secs_f64())
        } else {
            match state.update_time {
                Some(seconds) => seconds,
                None => return self.inner.fallback_interval,
            }
        };

        if seconds.is_finite() && seconds > 0.0 {
            Duration::from_secs_f64(seconds)
        } else {
            self.inner.fallback_interval
        }
    }

    pub fn is_updating(&self) -> bool {
        self.state().timer.is_some()
    }

    /// (Re)starts the refresh timer at the current interval.
    pub fn start_updating(&self) {
        let period = {
            let mut state = self.state();
            if state.removed {
                return;
            }
            state.timer = None;
            self.compute_interval(&state)
        };

        let weak = Arc::downgrade(&self.inner);
        let timer = spawn_periodic(period, move || {
            let alive = match weak.upgrade() {
                Some(inner) => {
                    let handle = PointHandle { inner };
                    handle.request_update(false);
                    !handle.is_removed() && handle.engine().is_some()
                }
                None => false,
            };
            async move { alive }
        });

        debug!("Point '{}' refreshing every {:?}", self.inner.name, period);
        self.state().timer = timer;
    }

    pub fn stop_updating(&self) {
        self.state().timer = None;
    }

    /// Asks the engine to include this point in its next poll. An uninitialised
    /// time-series only asks when forced; an initialised archival range never does.
    pub fn request_update(&self, force: bool) {
        let wanted = {
            let state = self.state();
            if state.removed {
                false
            } else if self.inner.time_series && !state.initialised {
                force
            } else {
                !(state.initialised && state.options.start_time != StartTime::Latest)
            }
        };

        if wanted {
            if let Some(engine) = self.engine() {
                engine.request_update(std::slice::from_ref(self));
            }
        }
    }

    /// Merges new time-series options, recomputes the refresh interval and refetches.
    pub fn set_time_series_options(&self, update: TimeSeriesUpdate) -> TimeSeriesOptions {
        let (options, restart) = {
            let mut state = self.state();
            if let Some(start_time) = update.start_time {
                state.options.start_time = start_time;
            }
            if let Some(span_time) = update.span_time {
                state.options.span_time = span_time;
            }
            if let Some(max_points) = update.max_points {
                state.options.max_points = max_points;
            }
            state.minimum_update_interval = update.minimum_update_interval.unwrap_or_default();
            state.initialised = false;
            state.generation += 1;
            (state.options.clone(), state.timer.is_some())
        };

        if restart && self.inner.time_series {
            self.start_updating();
        }
        self.request_update(true);
        options
    }

    /// Applies one value from a `points` response. Both `value` and `time` must be
    /// present for anything to be stored; callbacks fire either way.
    pub fn update_value(&self, update: &CellUpdate) {
        {
            let mut state = self.state();
            if state.removed {
                return;
            }
            if update.value.is_some() && update.time.is_some() {
                if !self.inner.time_series {
                    match state.cells.front_mut() {
                        Some(cell) => cell.set_value(update),
                        None => state.cells.push_back(ValueCell::from_update(update)),
                    }
                } else {
                    let is_new = state
                        .cells
                        .back()
                        .map_or(true, |cell| Some(cell.time()) != update.time.as_ref());
                    if is_new {
                        state.cells.push_back(ValueCell::from_update(update));
                        Self::evict(&mut state);
                    }
                }
            }
        }
        self.fire_callbacks();
    }

    /// Loads the rows of an `intervals` response, overwriting by position.
    pub fn set_time_series_values(&self, rows: &[Vec<Datum>]) {
        self.load_rows(rows, None);
    }

    /// The options to fetch with, and the generation they belong to.
    pub(crate) fn interval_request(&self) -> (TimeSeriesOptions, u64) {
        let state = self.state();
        (state.options.clone(), state.generation)
    }

    /// Loads a batch fetched under `generation`. Returns false, storing nothing,
    /// when the options have changed since.
    pub(crate) fn apply_interval_batch(&self, rows: &[Vec<Datum>], generation: u64) -> bool {
        self.load_rows(rows, Some(generation))
    }

    fn load_rows(&self, rows: &[Vec<Datum>], generation: Option<u64>) -> bool {
        if !self.inner.time_series {
            return false;
        }
        {
            let mut state = self.state();
            if state.removed {
                return false;
            }
            if generation.map_or(false, |g| g != state.generation) {
                return false;
            }
            for (i, row) in rows.iter().enumerate() {
                if i < state.cells.len() {
                    state.cells[i].set_row(row);
                } else {
                    state.cells.push_back(ValueCell::from_row(row));
                }
            }
            Self::evict(&mut state);
            state.initialised = true;
        }
        self.fire_callbacks();
        true
    }

    fn evict(state: &mut PointState) {
        let max_points = state.options.max_points;
        while max_points > 0 && state.cells.len() > max_points {
            state.cells.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.state().cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().cells.is_empty()
    }

    /// Every stored value of a time-series, pairs unless asked otherwise.
    /// Plain points have no series and return nothing.
    pub fn get_time_series(&self, options: Option<&ReadOptions>) -> Vec<Reading> {
        if !self.inner.time_series {
            return Vec::new();
        }
        let options = options
            .map(|o| o.with_default_shape(OutputShape::Pair))
            .unwrap_or_else(ReadOptions::pair);
        let range = options.time_range.unwrap_or_default();

        self.state()
            .cells
            .iter()
            .map(|cell| cell.get_value(Some(&options)))
            .filter(|reading| match reading.time().as_f64() {
                Some(x) => {
                    range.min.map_or(true, |min| x >= min) && range.max.map_or(true, |max| x <= max)
                }
                None => true,
            })
            .collect()
    }

    pub fn latest_value(&self, options: Option<&ReadOptions>) -> Reading {
        let options = if self.inner.time_series {
            Some(
                options
                    .map(|o| o.with_default_shape(OutputShape::Pair))
                    .unwrap_or_else(ReadOptions::pair),
            )
        } else {
            options.cloned()
        };

        let state = self.state();
        match state.cells.back() {
            Some(cell) => cell.get_value(options.as_ref()),
            None => ValueCell::new().get_value(options.as_ref()),
        }
    }

    /// Asks the server to set this point. The value type is inferred from the
    /// value when not given: `str` for text and `bool` for booleans.
    pub async fn set_value(&self, request: SetValueRequest) -> Result<bool> {
        let value_type = match (&request.value_type, &request.value) {
            (Some(value_type), _) => value_type.clone(),
            (None, Datum::Text(_)) => "str".to_string(),
            (None, Datum::Bool(_)) => "bool".to_string(),
            (None, other) => {
                return Err(MonicaError::invalid_request(
                    format!("Cannot infer a value type for {}", other),
                    self.inner.name.clone(),
                    vec!["type is required for non-text, non-boolean values".to_string()],
                ))
            }
        };

        let engine = self.engine().ok_or(MonicaError::EngineGone)?;
        let response = engine
            .set_point_value(SetPointRequest {
                point: Some(self.inner.name.clone()),
                value: Some(request.value.to_string()),
                value_type: Some(value_type),
                user: Some(request.auth.user),
                pass: Some(request.auth.pass),
                prevent_encryption: false,
            })
            .await;

        match response {
            Ok(data) => parse_set_result(&data).ok_or_else(|| MonicaError::rejected(SET_VALUE_FAILED)),
            Err(e) if e.is_client_error() => Err(e),
            Err(e) => {
                debug!("Setting '{}' failed: {}", self.inner.name, e);
                Err(MonicaError::rejected(SET_VALUE_FAILED))
            }
        }
    }

    pub fn add_callback<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&PointHandle) + Send + Sync + 'static,
    {
        let callback: Callback<PointHandle> = Arc::new(callback);
        self.state().callbacks.add(callback)
    }

    pub fn remove_callback(&self, id: SubscriptionId) -> bool {
        self.state().callbacks.remove(id)
    }

    fn fire_callbacks(&self) {
        let callbacks = self.state().callbacks.snapshot();
        for callback in callbacks {
            callback(self);
        }
    }
}

impl PartialEq for PointHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for PointHandle {}

impl fmt::Debug for PointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PointHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("time_series", &self.inner.time_series)
            .finish()
    }
}

pub(crate) fn interval_in_flight(handle: &PointHandle) -> &AtomicBool {
    &handle.inner.interval_in_flight
}
