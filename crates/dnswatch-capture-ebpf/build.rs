//! Build script for dnswatch-capture-ebpf
//!
//! On Linux, this embeds the prebuilt probe object. The object is built
//! separately in the `ebpf/` workspace for `bpfel-unknown-none`.

use std::env;
use std::path::{Path, PathBuf};

fn main() {
    // Tell cargo about our custom cfg flags
    println!("cargo::rustc-check-cfg=cfg(embedded_probe)");

    println!("cargo:rerun-if-env-changed=DNSWATCH_EBPF_OBJECT");

    // Only embed on Linux
    if env::var("CARGO_CFG_TARGET_OS").unwrap_or_default() != "linux" {
        return;
    }

    if let Err(e) = embed_probe() {
        println!(
            "cargo:warning=Failed to embed probe object: {}. \
             Set capture.ebpf_path in the config at runtime.",
            e
        );
    }
}

fn embed_probe() -> Result<(), String> {
    let out_dir = env::var("OUT_DIR").map_err(|e| format!("OUT_DIR not set: {}", e))?;
    let out_path = PathBuf::from(&out_dir).join("dnswatch");

    // Check for explicit path via environment variable
    if let Ok(path) = env::var("DNSWATCH_EBPF_OBJECT") {
        let src = PathBuf::from(&path);
        if !src.exists() {
            return Err(format!("DNSWATCH_EBPF_OBJECT points to missing file {}", path));
        }
        return copy_object(&src, &out_path, "DNSWATCH_EBPF_OBJECT");
    }

    let manifest_dir = env::var("CARGO_MANIFEST_DIR")
        .map_err(|e| format!("CARGO_MANIFEST_DIR not set: {}", e))?;
    let workspace_root = PathBuf::from(&manifest_dir)
        .parent() // crates/
        .and_then(|p| p.parent())
        .map(PathBuf::from)
        .ok_or("Failed to find workspace root")?;

    let built = workspace_root
        .join("ebpf")
        .join("target")
        .join("bpfel-unknown-none")
        .join("release")
        .join("dnswatch");
    println!("cargo:rerun-if-changed={}", built.display());
    if built.exists() {
        return copy_object(&built, &out_path, "ebpf/target");
    }

    Err(format!(
        "probe object not found. Looked in:\n  \
         - DNSWATCH_EBPF_OBJECT env var\n  \
         - {:?}\n\
         Build it with: cd ebpf && cargo +nightly build -p dnswatch-ebpf --release \\
         --target bpfel-unknown-none -Z build-std=core",
        built
    ))
}

fn copy_object(src: &Path, dst: &Path, origin: &str) -> Result<(), String> {
    std::fs::copy(src, dst)
        .map_err(|e| format!("Failed to copy probe object from {}: {}", src.display(), e))?;
    println!("cargo:rustc-cfg=embedded_probe");
    println!(
        "cargo:warning=Embedded probe object from {} ({} bytes)",
        origin,
        std::fs::metadata(dst).map(|m| m.len()).unwrap_or(0)
    );
    Ok(())
}
