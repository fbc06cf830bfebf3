// In src/lib.rs
pub mod alarm;
pub mod callbacks;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod point;
pub mod protocol;
pub mod transport;
pub mod types;
pub mod value;

pub use alarm::{AlarmHandle, AlarmState};
pub use callbacks::SubscriptionId;
pub use config::EngineConfig;
pub use engine::{ErrorHandler, SyncEngine};
pub use error::{MonicaError, Result};
pub use metrics::MetricsSnapshot;
pub use point::PointHandle;
pub use protocol::{AlarmStateUpdate, PointDescription};
pub use transport::{HttpTransport, Transport};
pub use types::{
    AlarmRequest, AuthData, CellValue, Datum, EngineEvent, PointDetails, Reading, SetPointRequest,
    SetValueRequest, StartTime, TimeRange, TimeRepresentation, TimeSeriesOptions, TimeSeriesSpec,
    TimeSeriesUpdate,
};
pub use value::{CellUpdate, OutputShape, ReadOptions, ValueCell};
