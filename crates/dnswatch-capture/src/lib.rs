//! Capture layer
//!
//! The in-process capture engine (host counterpart of the kernel programs),
//! record filtering, and the synthetic backend built on the engine.

pub mod engine;
pub mod filter;
pub mod synthetic;

pub use engine::{CaptureEngine, EngineConfig, EngineStats};
pub use filter::EventFilter;
pub use synthetic::{SyntheticCapture, SyntheticConfig};
