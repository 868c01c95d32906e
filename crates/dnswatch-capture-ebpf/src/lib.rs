//! Linux eBPF capture for dnswatch
//!
//! Loads the probe object, attaches the exec tracker and the send
//! interceptors (kprobe or fentry), and streams decoded records from the
//! kernel ring buffer.

pub mod linux_proc;
pub mod loader;
pub mod sample;

#[cfg(target_os = "linux")]
mod attach;
#[cfg(target_os = "linux")]
mod ebpf_capture;

#[cfg(target_os = "linux")]
pub use ebpf_capture::{EbpfCapture, EbpfCaptureConfig};

pub use loader::{resolve_interceptor, select_interceptor, Interceptor};

// Stub for non-Linux platforms
#[cfg(not(target_os = "linux"))]
mod unsupported {
    use async_trait::async_trait;
    use dnswatch_core::config::CaptureSettings;
    use dnswatch_core::{CaptureBackend, CaptureError, CaptureResult, DnsSendRecord};
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, Default)]
    pub struct EbpfCaptureConfig;

    impl EbpfCaptureConfig {
        pub fn from_settings(_settings: &CaptureSettings) -> Self {
            Self
        }
    }

    #[derive(Default)]
    pub struct EbpfCapture;

    impl EbpfCapture {
        pub fn new() -> Self {
            Self
        }

        pub fn with_config(_config: EbpfCaptureConfig) -> Self {
            Self
        }
    }

    #[async_trait]
    impl CaptureBackend for EbpfCapture {
        fn name(&self) -> &str {
            "ebpf"
        }

        async fn start(&mut self, _tx: mpsc::Sender<DnsSendRecord>) -> CaptureResult<()> {
            Err(CaptureError::Unsupported(
                "eBPF capture requires Linux".into(),
            ))
        }

        async fn stop(&mut self) -> CaptureResult<()> {
            Ok(())
        }

        fn is_running(&self) -> bool {
            false
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use unsupported::{EbpfCapture, EbpfCaptureConfig};
