pub mod backend;
pub mod cli;
pub mod clock;
pub mod collector;
pub mod config;
pub mod error;
pub mod metrics;
pub mod sampler;

pub use backend::{select_backend, DeviceBackend, DeviceType};
pub use clock::{Clock, ManualClock, SystemClock};
pub use collector::AsyncMetricsCollector;
pub use config::CollectorConfig;
pub use error::{MetricsError, Result};
pub use metrics::SpecDecodeMetrics;
pub use sampler::SpecDecodeSampler;
