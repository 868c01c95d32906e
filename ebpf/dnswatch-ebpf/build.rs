//! Rebuild the probe object whenever the `bpf-linker` on PATH changes.
//!
//! cargo has no stable way to declare a binary tool as a build input, so the
//! resolved linker path is used as the cache key instead.

use which::which;

fn main() {
    match which("bpf-linker") {
        Ok(linker) => println!("cargo:rerun-if-changed={}", linker.display()),
        Err(e) => println!("cargo:warning=bpf-linker not found on PATH: {}", e),
    }
}
