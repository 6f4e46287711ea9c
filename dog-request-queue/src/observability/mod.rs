pub mod layer;
pub mod metrics;
pub mod tracing;

pub use layer::ObservabilityLayer;
pub use metrics::{LiveMetrics, MetricsSnapshot};

#[cfg(feature = "tracing-basic")]
pub use self::tracing::{init_json_tracing, init_tracing};
