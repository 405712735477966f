pub mod deadline;
pub mod feedback;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod routing;
pub mod rules;
pub mod service;
pub mod store;
pub mod types;

// Re-export core types at crate root for convenience.
pub use deadline::Deadline;
pub use feedback::{FeedbackFailure, FeedbackStats, FeedbackWorker, SnapshotBuilder};
pub use health::{Classification, HealthMonitor, HttpProbe, ProviderProbe, classify};
pub use metrics::MetricsCollector;
pub use registry::Registry;
pub use routing::Router;
pub use rules::RuleBook;
pub use service::DispatchService;
pub use store::{DeleteOutcome, SqliteStore, Store};
pub use types::*;
