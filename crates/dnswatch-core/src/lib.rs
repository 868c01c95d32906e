//! dnswatch core - record types, capture traits, configuration and metrics
//!
//! - **Events**: decoded DNS send records
//! - **Capture**: the backend trait shared by the eBPF and synthetic sources
//! - **Config**: TOML configuration with env overrides
//! - **Metrics**: per-process counters in Prometheus text format

pub mod capture;
pub mod config;
pub mod events;
pub mod metrics;

pub use capture::{CaptureBackend, CaptureCounters, CaptureError, CaptureResult, CaptureStats};
pub use config::{AttachMode, ConfigLoader, DnswatchConfig, OutputFormat};
pub use events::{CmdlineSource, DnsSendRecord, Hook, RecordError};
pub use metrics::MetricsCollector;

/// dnswatch version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
