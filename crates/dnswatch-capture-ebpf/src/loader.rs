//! Host capability checks and interceptor selection

use dnswatch_core::AttachMode;
use dnswatch_ebpf_common::FnId;
use std::fmt;
use std::path::Path;
use tracing::{debug, warn};

const BPF_FS: &str = "/sys/fs/bpf";
const VMLINUX_BTF: &str = "/sys/kernel/btf/vmlinux";

/// fentry trampolines landed in 5.5.
const FENTRY_MIN_KERNEL: (u32, u32, u32) = (5, 5, 0);

/// How the send interceptors are attached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interceptor {
    /// Dynamic kprobe at the function entry
    Kprobe,
    /// BTF fentry trampoline
    Fentry,
}

impl Interceptor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interceptor::Kprobe => "kprobe",
            Interceptor::Fentry => "fentry",
        }
    }

    /// Name of the program in the probe object for this hook
    pub fn program_name(&self, fn_id: FnId) -> String {
        format!("dnswatch_{}_{}", self.as_str(), fn_id.symbol())
    }
}

impl fmt::Display for Interceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exec tracepoints and their programs, as `(category, name, program)`
pub const EXEC_TRACEPOINTS: [(&str, &str, &str); 2] = [
    ("syscalls", "sys_enter_execve", "dnswatch_sys_enter_execve"),
    ("syscalls", "sys_enter_execveat", "dnswatch_sys_enter_execveat"),
];

/// Pick the interceptor for `requested`.
///
/// `Auto` prefers fentry when the kernel exposes BTF and is new enough,
/// falling back to kprobes otherwise. Explicit modes are honored as-is.
pub fn select_interceptor(
    requested: AttachMode,
    btf_available: bool,
    kernel: Option<(u32, u32, u32)>,
) -> Interceptor {
    match requested {
        AttachMode::Kprobe => Interceptor::Kprobe,
        AttachMode::Fentry => Interceptor::Fentry,
        AttachMode::Auto => {
            let kernel_ok = kernel.is_some_and(|v| v >= FENTRY_MIN_KERNEL);
            if btf_available && kernel_ok {
                Interceptor::Fentry
            } else {
                debug!(
                    "fentry unavailable (btf={}, kernel={:?}), using kprobes",
                    btf_available, kernel
                );
                Interceptor::Kprobe
            }
        }
    }
}

/// [`select_interceptor`] against the running kernel
pub fn resolve_interceptor(requested: AttachMode) -> Interceptor {
    select_interceptor(requested, has_btf(), get_kernel_version())
}

/// Check if eBPF is available on this system
pub fn check_ebpf_available() -> bool {
    if !Path::new(BPF_FS).exists() {
        warn!("BPF filesystem not mounted at {}", BPF_FS);
        return false;
    }

    if !has_btf() {
        warn!("BTF not available - fentry attachment disabled");
    }

    true
}

/// Kernel BTF is exposed
pub fn has_btf() -> bool {
    Path::new(VMLINUX_BTF).exists()
}

/// Check kernel version for eBPF feature support
pub fn get_kernel_version() -> Option<(u32, u32, u32)> {
    let release = std::fs::read_to_string("/proc/sys/kernel/osrelease").ok()?;
    parse_kernel_release(&release)
}

fn parse_kernel_release(release: &str) -> Option<(u32, u32, u32)> {
    let parts: Vec<&str> = release.trim().split('.').collect();

    if parts.len() >= 2 {
        let major = parts[0].parse().ok()?;
        let minor = parts[1].split('-').next()?.parse().ok()?;
        let patch = parts
            .get(2)
            .and_then(|p| p.split(['-', '+']).next())
            .and_then(|p| p.parse().ok())
            .unwrap_or(0);

        Some((major, minor, patch))
    } else {
        None
    }
}

/// Check if running as root
#[cfg(target_os = "linux")]
pub fn is_root() -> bool {
    unsafe { libc::getuid() == 0 }
}

#[cfg(not(target_os = "linux"))]
pub fn is_root() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kernel_release() {
        assert_eq!(parse_kernel_release("6.8.0-45-generic\n"), Some((6, 8, 0)));
        assert_eq!(parse_kernel_release("5.15.167+"), Some((5, 15, 167)));
        assert_eq!(parse_kernel_release("4.19"), Some((4, 19, 0)));
        assert_eq!(parse_kernel_release("garbage"), None);
    }

    #[test]
    fn test_explicit_modes_are_honored() {
        assert_eq!(
            select_interceptor(AttachMode::Kprobe, true, Some((6, 1, 0))),
            Interceptor::Kprobe
        );
        assert_eq!(
            select_interceptor(AttachMode::Fentry, false, None),
            Interceptor::Fentry
        );
    }

    #[test]
    fn test_auto_mode_selection() {
        assert_eq!(
            select_interceptor(AttachMode::Auto, true, Some((6, 1, 0))),
            Interceptor::Fentry
        );
        assert_eq!(
            select_interceptor(AttachMode::Auto, false, Some((6, 1, 0))),
            Interceptor::Kprobe
        );
        assert_eq!(
            select_interceptor(AttachMode::Auto, true, Some((5, 4, 0))),
            Interceptor::Kprobe
        );
        assert_eq!(
            select_interceptor(AttachMode::Auto, true, None),
            Interceptor::Kprobe
        );
    }

    #[test]
    fn test_program_names() {
        assert_eq!(
            Interceptor::Kprobe.program_name(FnId::UdpSendmsg),
            "dnswatch_kprobe_udp_sendmsg"
        );
        assert_eq!(
            Interceptor::Fentry.program_name(FnId::Udpv6Sendmsg),
            "dnswatch_fentry_udpv6_sendmsg"
        );
        assert_eq!(Interceptor::Fentry.to_string(), "fentry");
    }
}
