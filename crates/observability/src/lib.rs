//! Observability for the premium oracle
//!
//! - Structured logging via tracing
//! - Prometheus metrics for the price pipeline and the HTTP API
//!
//! ```ignore
//! use observability::{init_logging, LogFormat};
//!
//! init_logging("premium-oracle", LogFormat::Pretty)?;
//! observability::metrics::init_metrics(9187)?;
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, init_logging_from_str, LogFormat};
pub use self::metrics::{init_metrics, ApiMetrics, PipelineMetrics, RequestTimer};
