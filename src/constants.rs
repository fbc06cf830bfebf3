use std::time::Duration;

// Connection defaults
pub const DEFAULT_SERVER_NAME: &str = "monhost-nar";
pub const DEFAULT_PROTOCOL: &str = "http";
pub const DEFAULT_WEBSERVER_NAME: &str = "www.narrabri.atnf.csiro.au";
pub const DEFAULT_WEBSERVER_PATH: &str = "cgi-bin/obstools/web_monica/monicainterface_json.pl";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// Scheduling defaults
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(10);
/// Zero disables periodic alarm polling.
pub const DEFAULT_ALARM_POLL_PERIOD: Duration = Duration::ZERO;

// Time-series defaults
pub const DEFAULT_SPAN_MINUTES: f64 = 60.0;
pub const DEFAULT_MAX_POINTS: usize = 500;

// Protocol constants
/// Appended to a point name to ask for the time as unix milliseconds.
pub const UNIX_MS_SUFFIX: &str = "...TD";
pub const LIST_SEPARATOR: char = ';';
pub const FIELD_SEPARATOR: char = '$';
pub const INTERVAL_SEPARATOR: char = ',';
/// Wire form of "end the range at the current time".
pub const LATEST_START_TIME: &str = "-1";

/// Messages surfaced to callers when the server gives nothing usable back.
pub const SET_VALUE_FAILED: &str = "Error while setting point value.";

/// Credentials are zero-padded to this many characters before encryption.
pub const MIN_ENCRYPTED_LENGTH: usize = 40;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
