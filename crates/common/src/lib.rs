pub mod dto;
pub mod error;
pub mod telemetry;


pub use dto::*;
pub use error::{Error, ErrorDetail, ErrorResponse, Result};
pub use telemetry::TelemetryRecord;
