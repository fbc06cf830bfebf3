//! Wire format of the MoniCA JSON web interface.
//!
//! Requests are form-encoded key/value pairs and always carry `server` and
//! `action`. Responses are decoded leniently: a malformed entry inside a list
//! is skipped on its own rather than failing the whole response.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::constants::{FIELD_SEPARATOR, INTERVAL_SEPARATOR, LIST_SEPARATOR};
use crate::error::{MonicaError, Result};
use crate::types::{deserialize_string_or_float, AlarmRequest, Datum, SetPointRequest, TimeSeriesOptions};
use crate::value::CellUpdate;

pub type Form = Vec<(String, String)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Names,
    Descriptions,
    Points,
    Intervals,
    Alarms,
    AllAlarms,
    SetPoints,
    AlarmAck,
    AlarmShelve,
    RsaKey,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Names => "names",
            Action::Descriptions => "descriptions",
            Action::Points => "points",
            Action::Intervals => "intervals",
            Action::Alarms => "alarms",
            Action::AllAlarms => "allalarms",
            Action::SetPoints => "setpoints",
            Action::AlarmAck => "alarmack",
            Action::AlarmShelve => "alarmshelve",
            Action::RsaKey => "rsakey",
        }
    }

    /// The form key carrying the payload of this action, if it has one.
    fn payload_key(&self) -> Option<&'static str> {
        match self {
            Action::Descriptions | Action::Points | Action::Intervals => Some("points"),
            Action::SetPoints => Some("settings"),
            Action::AlarmAck => Some("acknowledgements"),
            Action::AlarmShelve => Some("shelves"),
            _ => None,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reads the action back out of a form built by this module.
pub fn form_action(form: &Form) -> Option<&str> {
    form_value(form, "action")
}

pub fn form_value<'a>(form: &'a Form, key: &str) -> Option<&'a str> {
    form.iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn build(server: &str, action: Action, payload: Option<String>) -> Form {
    let mut form = vec![
        ("server".to_string(), server.to_string()),
        ("action".to_string(), action.as_str().to_string()),
    ];
    if let (Some(key), Some(payload)) = (action.payload_key(), payload) {
        form.push((key.to_string(), payload));
    }
    form
}

pub fn names_form(server: &str) -> Form {
    build(server, Action::Names, None)
}

pub fn rsakey_form(server: &str) -> Form {
    build(server, Action::RsaKey, None)
}

fn join_names(names: &[String]) -> String {
    names.join(&LIST_SEPARATOR.to_string())
}

pub fn descriptions_form(server: &str, names: &[String]) -> Form {
    build(server, Action::Descriptions, Some(join_names(names)))
}

/// `names` must already carry any time-representation suffix.
pub fn points_form(server: &str, names: &[String]) -> Form {
    build(server, Action::Points, Some(join_names(names)))
}

pub fn intervals_form(server: &str, name: &str, options: &TimeSeriesOptions) -> Form {
    let sep = INTERVAL_SEPARATOR;
    let payload = format!(
        "{name}{sep}{}{sep}{}{sep}{}",
        options.start_time, options.span_time, options.max_points
    );
    build(server, Action::Intervals, Some(payload))
}

pub fn alarms_form(server: &str, all: bool) -> Form {
    build(
        server,
        if all { Action::AllAlarms } else { Action::Alarms },
        None,
    )
}

fn require(
    errors: &mut Vec<String>,
    field: &str,
    value: &Option<String>,
    non_empty: bool,
) -> String {
    match value {
        None => {
            errors.push(format!("{} is required", field));
            String::new()
        }
        Some(v) if non_empty && v.is_empty() => {
            errors.push(format!("{} cannot be empty", field));
            String::new()
        }
        Some(v) => v.clone(),
    }
}

fn validation_result(action: Action, errors: Vec<String>) -> Result<()> {
    if errors.is_empty() {
        return Ok(());
    }
    debug!("Refusing to send '{}': {}", action, errors.join("; "));
    Err(MonicaError::invalid_request(
        format!("Incomplete '{}' request", action),
        action.as_str().to_string(),
        errors,
    ))
}

/// `point$value$type;user$pass`. Credentials are used as given; encrypt them first if needed.
pub fn set_points_form(server: &str, request: &SetPointRequest) -> Result<Form> {
    let mut errors = Vec::new();
    let point = require(&mut errors, "point", &request.point, true);
    let value = require(&mut errors, "value", &request.value, false);
    let value_type = require(&mut errors, "type", &request.value_type, true);
    let user = require(&mut errors, "user", &request.user, false);
    let pass = require(&mut errors, "pass", &request.pass, false);
    validation_result(Action::SetPoints, errors)?;

    let sep = FIELD_SEPARATOR;
    let payload = format!("{point}{sep}{value}{sep}{value_type};{user}{sep}{pass}");
    Ok(build(server, Action::SetPoints, Some(payload)))
}

/// `point$value;user$pass` for either `alarmack` or `alarmshelve`.
pub fn alarm_form(server: &str, action: Action, request: &AlarmRequest) -> Result<Form> {
    if !matches!(action, Action::AlarmAck | Action::AlarmShelve) {
        return Err(MonicaError::invalid_request(
            format!("'{}' is not an alarm action", action),
            action.as_str().to_string(),
            Vec::new(),
        ));
    }

    let mut errors = Vec::new();
    let point = require(&mut errors, "point", &request.point, true);
    let value = require(&mut errors, "value", &request.value, false);
    let user = require(&mut errors, "user", &request.user, false);
    let pass = require(&mut errors, "pass", &request.pass, false);
    validation_result(action, errors)?;

    let sep = FIELD_SEPARATOR;
    let payload = format!("{point}{sep}{value};{user}{sep}{pass}");
    Ok(build(server, action, Some(payload)))
}

// Response decoding

fn field<'a>(data: &'a Value, key: &str, action: Action) -> Result<&'a Value> {
    data.get(key).ok_or_else(|| {
        MonicaError::invalid_response(action.as_str().to_string(), format!("missing '{}'", key))
    })
}

fn list<'a>(data: &'a Value, key: &str, action: Action) -> Result<&'a Vec<Value>> {
    field(data, key, action)?.as_array().ok_or_else(|| {
        MonicaError::invalid_response(action.as_str().to_string(), format!("'{}' is not a list", key))
    })
}

pub fn parse_names(data: &Value) -> Result<Vec<String>> {
    Ok(list(data, "monitoringPointNames", Action::Names)?
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect())
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointDescription {
    pub point_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub units: Option<String>,
    /// Seconds between server-side updates.
    #[serde(default, deserialize_with = "deserialize_string_or_float")]
    pub update_time: Option<f64>,
}

pub fn parse_descriptions(data: &Value) -> Result<Vec<PointDescription>> {
    Ok(list(data, "data", Action::Descriptions)?
        .iter()
        .filter_map(|entry| match PointDescription::deserialize(entry) {
            Ok(description) => Some(description),
            Err(e) => {
                debug!("Skipping malformed description entry: {}", e);
                None
            }
        })
        .collect())
}

/// One entry of a `points` response. `update.error_state` is already in
/// the client convention (true = error).
#[derive(Debug, Clone, PartialEq)]
pub struct PointSlot {
    pub point_name: String,
    pub update: CellUpdate,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PointSlotWire {
    point_name: String,
    #[serde(default)]
    value: Option<Datum>,
    #[serde(default)]
    time: Option<Datum>,
    #[serde(default)]
    error_state: Option<bool>,
}

/// Decodes `pointData`, keeping positions: a blank or malformed slot is `None`.
pub fn parse_point_slots(data: &Value) -> Result<Vec<Option<PointSlot>>> {
    Ok(list(data, "pointData", Action::Points)?
        .iter()
        .map(|entry| match PointSlotWire::deserialize(entry) {
            Ok(wire) if wire.point_name.is_empty() => None,
            Ok(wire) => Some(PointSlot {
                point_name: wire.point_name,
                update: CellUpdate {
                    value: wire.value,
                    time: wire.time,
                    // The server reports "ok", so flip it to "in error".
                    error_state: wire.error_state.map(|ok| !ok),
                },
            }),
            Err(e) => {
                debug!("Skipping malformed point slot: {}", e);
                None
            }
        })
        .collect())
}

/// Rows of the first (only) `intervalData` batch.
pub fn parse_interval_batch(data: &Value) -> Result<Vec<Vec<Datum>>> {
    let batch = list(data, "intervalData", Action::Intervals)?
        .first()
        .ok_or_else(|| MonicaError::invalid_response("intervals", "empty 'intervalData'"))?;

    let rows = match batch.get("data").and_then(Value::as_array) {
        Some(rows) => rows,
        None => return Ok(Vec::new()),
    };

    Ok(rows
        .iter()
        .filter_map(|row| match Vec::<Datum>::deserialize(row) {
            Ok(row) => Some(row),
            Err(e) => {
                debug!("Skipping malformed interval row: {}", e);
                None
            }
        })
        .collect())
}

/// An alarm state as reported by the server. Every field is optional here;
/// completeness is checked when an alarm is constructed from it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmStateUpdate {
    #[serde(default)]
    pub point_name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_string_or_float")]
    pub priority: Option<f64>,
    #[serde(default)]
    pub is_alarmed: Option<bool>,
    #[serde(default)]
    pub acknowledged: Option<bool>,
    #[serde(default)]
    pub acknowledged_by: Option<String>,
    #[serde(default)]
    pub acknowledged_at: Option<String>,
    #[serde(default)]
    pub shelved: Option<bool>,
    #[serde(default)]
    pub shelved_by: Option<String>,
    #[serde(default)]
    pub shelved_at: Option<String>,
    #[serde(default)]
    pub guidance: Option<String>,
}

pub fn parse_alarm_states(data: &Value, action: Action) -> Result<Vec<AlarmStateUpdate>> {
    Ok(list(data, "alarmStates", action)?
        .iter()
        .filter_map(|entry| match AlarmStateUpdate::deserialize(entry) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("Skipping malformed alarm state: {}", e);
                None
            }
        })
        .collect())
}

/// First element of `setResult`, when it is a boolean.
pub fn parse_set_result(data: &Value) -> Option<bool> {
    data.get("setResult")?.as_array()?.first()?.as_bool()
}

/// `(modulus, exponent)` as decimal strings.
pub fn parse_rsa_key(data: &Value) -> Result<(String, String)> {
    let key = field(data, "rsaKey", Action::RsaKey)?;
    let part = |name: &str| -> Result<String> {
        match key.get(name) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(MonicaError::invalid_response(
                "rsakey".to_string(),
                format!("missing '{}'", name),
            )),
        }
    };
    Ok((part("modulus")?, part("exponent")?))
}
