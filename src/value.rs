//! A single timestamped value and the transforms applied when it is read.
//!
//! Stored state only changes through [`ValueCell::set_value`] and
//! [`ValueCell::set_row`]; every [`ReadOptions`] transform works on a copy.

use chrono::{TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::types::{CellValue, Datum, Reading, TimeRange};

static GARBAGE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[Â><]").unwrap());

static SERVER_TIMESTAMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4})-(\d{2})-(\d{2})_(\d{2}):(\d{2}):(\d{2})$").unwrap()
});

// d:m:s, d°m's, d?m's and XdYmZs, with optional seconds and sign.
static SEXAGESIMAL_DEGREES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^([+-])?\s*(\d+(?:\.\d*)?)\s*[:°?d]\s*(\d+(?:\.\d*)?)\s*(?:[:'m]\s*(\d+(?:\.\d*)?)\s*[s"]?)?$"#,
    )
    .unwrap()
});

static SEXAGESIMAL_HOURS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([+-])?\s*(\d+(?:\.\d*)?)\s*h\s*(\d+(?:\.\d*)?)\s*m\s*(?:(\d+(?:\.\d*)?)\s*s?)?$")
        .unwrap()
});

/// How a caller wants a reading laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputShape {
    /// The full `{value, time, errorState}` triple.
    Raw,
    /// `[time, value]`, as plotting libraries take it.
    Pair,
    /// `{x: time, y: value}`.
    Xy,
}

/// Read-time options. All default to off, and they combine freely.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadOptions {
    pub value_as_decimal_degrees: bool,
    pub time_as_seconds: bool,
    /// Takes precedence over `time_as_seconds`.
    pub time_as_date: bool,
    pub reference_value: Option<f64>,
    pub reference_time: Option<f64>,
    /// Unset means the reader's default: raw for a single cell, pair for time-series.
    pub shape: Option<OutputShape>,
    /// Only applied by time-series reads.
    pub time_range: Option<TimeRange>,
}

impl ReadOptions {
    pub fn pair() -> Self {
        Self {
            shape: Some(OutputShape::Pair),
            ..Default::default()
        }
    }

    pub fn xy() -> Self {
        Self {
            shape: Some(OutputShape::Xy),
            ..Default::default()
        }
    }

    pub(crate) fn with_default_shape(&self, shape: OutputShape) -> Self {
        let mut options = self.clone();
        if options.shape.is_none() {
            options.shape = Some(shape);
        }
        options
    }
}

/// A partial object-form update; absent fields leave the cell alone.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellUpdate {
    #[serde(default)]
    pub value: Option<Datum>,
    #[serde(default)]
    pub time: Option<Datum>,
    #[serde(default)]
    pub error_state: Option<bool>,
}

impl CellUpdate {
    pub fn new(value: impl Into<Datum>, time: impl Into<Datum>) -> Self {
        Self {
            value: Some(value.into()),
            time: Some(time.into()),
            error_state: None,
        }
    }

    pub fn with_error_state(mut self, error_state: bool) -> Self {
        self.error_state = Some(error_state);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueCell {
    value: CellValue,
}

impl ValueCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_update(update: &CellUpdate) -> Self {
        let mut cell = Self::new();
        cell.set_value(update);
        cell
    }

    pub fn from_row(row: &[Datum]) -> Self {
        let mut cell = Self::new();
        cell.set_row(row);
        cell
    }

    pub fn set_value(&mut self, update: &CellUpdate) {
        if let Some(value) = &update.value {
            self.value.value = strip_garbage(value);
        }
        if let Some(time) = &update.time {
            self.value.time = time.clone();
        }
        if let Some(error_state) = update.error_state {
            self.value.error_state = error_state;
        }
    }

    /// Applies an interval row `[time, value(, errorState)]`. Short rows are ignored.
    pub fn set_row(&mut self, row: &[Datum]) {
        if row.len() < 2 {
            return;
        }
        self.value.time = row[0].clone();
        self.value.value = strip_garbage(&row[1]);
        if let Some(Datum::Bool(error_state)) = row.get(2) {
            self.value.error_state = *error_state;
        }
    }

    pub fn raw(&self) -> &CellValue {
        &self.value
    }

    pub fn time(&self) -> &Datum {
        &self.value.time
    }

    pub fn get_value(&self, options: Option<&ReadOptions>) -> Reading {
        let options = match options {
            Some(options) => options,
            None => return Reading::Cell(self.value.clone()),
        };

        let mut altered = self.value.clone();

        if options.value_as_decimal_degrees {
            if let Datum::Text(text) = &altered.value {
                altered.value = sexagesimal_to_degrees(text)
                    .map(Datum::Number)
                    .unwrap_or_else(|| altered.value.clone());
            }
        }

        if options.time_as_seconds || options.time_as_date {
            if let Some(text) = altered.time.as_str() {
                if let Some(instant) = parse_server_timestamp(text) {
                    altered.time = if options.time_as_date {
                        Datum::Instant(instant)
                    } else {
                        Datum::Number(instant.timestamp() as f64)
                    };
                }
            }
        }

        if let Some(reference) = options.reference_value.filter(|r| r.is_finite()) {
            if let Some(value) = altered.value.as_f64() {
                altered.value = Datum::Number(value - reference);
            }
        }

        if let Some(reference) = options.reference_time.filter(|r| r.is_finite()) {
            if let Some(time) = altered.time.as_f64() {
                altered.time = Datum::Number(time - reference);
            }
        }

        match options.shape.unwrap_or(OutputShape::Raw) {
            OutputShape::Raw => Reading::Cell(altered),
            OutputShape::Pair => Reading::Pair(altered.time, altered.value),
            OutputShape::Xy => Reading::Xy {
                x: altered.time,
                y: altered.value,
            },
        }
    }
}

fn strip_garbage(datum: &Datum) -> Datum {
    match datum {
        Datum::Text(text) => Datum::Text(GARBAGE_CHARS.replace_all(text, "").into_owned()),
        other => other.clone(),
    }
}

/// Parses `YYYY-MM-DD_HH:MM:SS` as a UTC instant.
pub fn parse_server_timestamp(text: &str) -> Option<chrono::DateTime<Utc>> {
    let caps = SERVER_TIMESTAMP.captures(text)?;
    let field = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());
    let year = caps.get(1)?.as_str().parse::<i32>().ok()?;
    Utc.with_ymd_and_hms(year, field(2)?, field(3)?, field(4)?, field(5)?, field(6)?)
        .single()
}

/// Converts an angle written in degrees or hours (minutes, seconds) to decimal degrees.
/// Plain numbers pass through; anything else yields `None`.
pub fn sexagesimal_to_degrees(text: &str) -> Option<f64> {
    let text = GARBAGE_CHARS.replace_all(text.trim(), "");

    let (caps, scale) = if let Some(caps) = SEXAGESIMAL_HOURS.captures(&text) {
        (caps, 15.0)
    } else if let Some(caps) = SEXAGESIMAL_DEGREES.captures(&text) {
        (caps, 1.0)
    } else {
        return text.parse::<f64>().ok().filter(|n| n.is_finite());
    };

    let part = |i: usize| {
        caps.get(i)
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .unwrap_or(0.0)
    };
    let magnitude = part(2) + part(3) / 60.0 + part(4) / 3600.0;
    let sign = match caps.get(1).map(|m| m.as_str()) {
        Some("-") => -1.0,
        _ => 1.0,
    };
    Some(sign * magnitude * scale)
}
