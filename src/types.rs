use chrono::{DateTime, Utc};
use serde::de::Error;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::Duration;

use crate::constants::{DEFAULT_MAX_POINTS, DEFAULT_SPAN_MINUTES, LATEST_START_TIME};

/// A loosely typed scalar as it travels over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Datum {
    Number(f64),
    Bool(bool),
    Text(String),
    #[serde(skip_deserializing)]
    Instant(DateTime<Utc>),
}

impl Datum {
    pub fn blank() -> Self {
        Datum::Text(String::new())
    }

    /// Numeric view of the datum, accepting numeric strings.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Datum::Number(n) if n.is_finite() => Some(*n),
            Datum::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl Default for Datum {
    fn default() -> Self {
        Datum::blank()
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Number(n) => write!(f, "{}", n),
            Datum::Bool(b) => write!(f, "{}", b),
            Datum::Text(s) => f.write_str(s),
            Datum::Instant(t) => write!(f, "{}", t.to_rfc3339()),
        }
    }
}

impl From<&str> for Datum {
    fn from(s: &str) -> Self {
        Datum::Text(s.to_string())
    }
}

impl From<String> for Datum {
    fn from(s: String) -> Self {
        Datum::Text(s)
    }
}

impl From<f64> for Datum {
    fn from(n: f64) -> Self {
        Datum::Number(n)
    }
}

impl From<i64> for Datum {
    fn from(n: i64) -> Self {
        Datum::Number(n as f64)
    }
}

impl From<bool> for Datum {
    fn from(b: bool) -> Self {
        Datum::Bool(b)
    }
}

/// The stored triple of a value cell. `error_state == true` means the value is in error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CellValue {
    pub value: Datum,
    pub time: Datum,
    pub error_state: bool,
}

impl Default for CellValue {
    fn default() -> Self {
        Self {
            value: Datum::blank(),
            time: Datum::blank(),
            error_state: true,
        }
    }
}

/// A value read out of a cell, shaped as the caller asked.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reading {
    Cell(CellValue),
    Pair(Datum, Datum),
    Xy { x: Datum, y: Datum },
}

impl Reading {
    pub fn time(&self) -> &Datum {
        match self {
            Reading::Cell(c) => &c.time,
            Reading::Pair(t, _) => t,
            Reading::Xy { x, .. } => x,
        }
    }

    pub fn value(&self) -> &Datum {
        match self {
            Reading::Cell(c) => &c.value,
            Reading::Pair(_, v) => v,
            Reading::Xy { y, .. } => y,
        }
    }
}

/// How a point asks the server to express its timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TimeRepresentation {
    #[default]
    String,
    UnixMs,
}

/// Where a time-series range ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StartTime {
    /// The range ends now and keeps following new values.
    #[default]
    Latest,
    /// A fixed archival range, in the server's time format.
    At(String),
}

impl fmt::Display for StartTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartTime::Latest => f.write_str(LATEST_START_TIME),
            StartTime::At(t) => f.write_str(t),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesOptions {
    pub start_time: StartTime,
    /// Minutes covered by the series.
    pub span_time: f64,
    /// Zero means unbounded.
    pub max_points: usize,
}

impl Default for TimeSeriesOptions {
    fn default() -> Self {
        Self {
            start_time: StartTime::Latest,
            span_time: DEFAULT_SPAN_MINUTES,
            max_points: DEFAULT_MAX_POINTS,
        }
    }
}

/// Everything needed to open a new time-series on the engine.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TimeSeriesSpec {
    pub point_name: String,
    pub options: TimeSeriesOptions,
    pub minimum_update_interval: Option<Duration>,
}

impl TimeSeriesSpec {
    pub fn new(point_name: impl Into<String>, options: TimeSeriesOptions) -> Self {
        Self {
            point_name: point_name.into(),
            options,
            minimum_update_interval: None,
        }
    }
}

/// A partial change to a time-series; unset fields keep their current value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TimeSeriesUpdate {
    pub start_time: Option<StartTime>,
    pub span_time: Option<f64>,
    pub max_points: Option<usize>,
    pub minimum_update_interval: Option<Duration>,
}

/// Inclusive bounds on the x (time) value of a time-series read.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimeRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointDetails {
    pub name: String,
    pub description: String,
    pub units: String,
    pub server_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AuthData {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
}

impl AuthData {
    pub fn new(user: impl Into<String>, pass: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            pass: pass.into(),
        }
    }

    /// Fills empty fields of `self` from `fallback`.
    pub fn or(self, fallback: &AuthData) -> AuthData {
        AuthData {
            user: if self.user.is_empty() {
                fallback.user.clone()
            } else {
                self.user
            },
            pass: if self.pass.is_empty() {
                fallback.pass.clone()
            } else {
                self.pass
            },
        }
    }
}

/// A `setpoints` request. Every field except `prevent_encryption` is required.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SetPointRequest {
    pub point: Option<String>,
    pub value: Option<String>,
    pub value_type: Option<String>,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub prevent_encryption: bool,
}

/// An `alarmack` or `alarmshelve` request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AlarmRequest {
    pub point: Option<String>,
    pub value: Option<String>,
    pub user: Option<String>,
    pub pass: Option<String>,
}

impl AlarmRequest {
    pub fn new(point: &str, value: bool, auth: &AuthData) -> Self {
        Self {
            point: Some(point.to_string()),
            value: Some(value.to_string()),
            user: Some(auth.user.clone()),
            pass: Some(auth.pass.clone()),
        }
    }
}

/// A value a caller wants written to a point through its handle.
#[derive(Debug, Clone, PartialEq)]
pub struct SetValueRequest {
    pub value: Datum,
    pub auth: AuthData,
    /// Inferred from `value` when not given.
    pub value_type: Option<String>,
}

/// Notifications published by the engine after each kind of round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Connected { server: String },
    Descriptions { server: String },
    Values { server: String },
    TimeSeries { server: String },
    Alarms { server: String },
}

pub(crate) fn deserialize_string_or_float<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: serde_json::Value = Deserialize::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => s.trim().parse::<f64>().map(Some).map_err(D::Error::custom),
        serde_json::Value::Number(n) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| D::Error::custom("Invalid number")),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_datum_untagged_deserialize() {
        let values: Vec<Datum> = serde_json::from_str(r#"[1.5, "23.4", true]"#).unwrap();
        assert_eq!(
            values,
            vec![Datum::Number(1.5), Datum::Text("23.4".into()), Datum::Bool(true)]
        );
    }

    #[test]
    fn test_datum_numeric_view() {
        assert_eq!(Datum::from("23.4").as_f64(), Some(23.4));
        assert_eq!(Datum::from("abc").as_f64(), None);
        assert_eq!(Datum::from(true).as_f64(), None);
        assert_eq!(Datum::Number(f64::NAN).as_f64(), None);
    }

    #[test]
    fn test_auth_fallback() {
        let cached = AuthData::new("observer", "secret");
        let merged = AuthData::new("", "override").or(&cached);
        assert_eq!(merged, AuthData::new("observer", "override"));
    }

    #[test]
    fn test_reading_serializes_like_plot_input() {
        let pair = Reading::Pair(Datum::Number(1000.0), Datum::Number(2.0));
        assert_eq!(serde_json::to_string(&pair).unwrap(), "[1000.0,2.0]");

        let cell = Reading::Cell(CellValue::default());
        assert_eq!(
            serde_json::to_string(&cell).unwrap(),
            r#"{"value":"","time":"","errorState":true}"#
        );
    }

    #[test]
    fn test_start_time_wire_form() {
        assert_eq!(StartTime::Latest.to_string(), "-1");
        assert_eq!(
            StartTime::At("2024-01-01:00:00:00".into()).to_string(),
            "2024-01-01:00:00:00"
        );
    }
}
