pub mod config;
pub mod error;
pub mod logging;

pub use config::{DispatchConfig, FeedbackSettings, HealthSettings, RoutingSettings};
pub use error::{DispatchError, ErrorCategory, Result};
