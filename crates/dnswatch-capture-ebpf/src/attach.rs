//! Program attachment
//!
//! Links stay owned by the [`Ebpf`] object; dropping it detaches everything.

#![cfg(target_os = "linux")]

use crate::loader::{Interceptor, EXEC_TRACEPOINTS};
use aya::programs::{FEntry, KProbe, TracePoint};
use aya::{Btf, Ebpf};
use dnswatch_core::{CaptureError, CaptureResult};
use dnswatch_ebpf_common::FnId;
use tracing::info;

/// Attach the exec tracker. Must run before the send interceptors so that
/// processes exec'd during attachment are already tracked.
pub fn attach_exec_tracker(ebpf: &mut Ebpf) -> CaptureResult<()> {
    for (category, name, program) in EXEC_TRACEPOINTS {
        let tp: &mut TracePoint = ebpf
            .program_mut(program)
            .ok_or_else(|| CaptureError::attach(program, "program not found"))?
            .try_into()
            .map_err(|e| CaptureError::attach(program, e))?;
        tp.load().map_err(|e| CaptureError::attach(program, e))?;
        tp.attach(category, name)
            .map_err(|e| CaptureError::attach(program, e))?;
        info!("Attached tracepoint {}:{}", category, name);
    }
    Ok(())
}

/// Attach all three send interceptors in the given variant
pub fn attach_interceptors(ebpf: &mut Ebpf, interceptor: Interceptor) -> CaptureResult<()> {
    let btf = match interceptor {
        Interceptor::Fentry => Some(
            Btf::from_sys_fs().map_err(|e| CaptureError::attach("kernel BTF", e))?,
        ),
        Interceptor::Kprobe => None,
    };

    for fn_id in FnId::ALL {
        let program = interceptor.program_name(fn_id);
        let symbol = fn_id.symbol();
        let prog = ebpf
            .program_mut(&program)
            .ok_or_else(|| CaptureError::attach(&program, "program not found"))?;

        match &btf {
            None => {
                let kprobe: &mut KProbe = prog
                    .try_into()
                    .map_err(|e| CaptureError::attach(&program, e))?;
                kprobe.load().map_err(|e| CaptureError::attach(&program, e))?;
                kprobe
                    .attach(symbol, 0)
                    .map_err(|e| CaptureError::attach(&program, e))?;
            }
            Some(btf) => {
                let fentry: &mut FEntry = prog
                    .try_into()
                    .map_err(|e| CaptureError::attach(&program, e))?;
                fentry
                    .load(symbol, btf)
                    .map_err(|e| CaptureError::attach(&program, e))?;
                fentry
                    .attach()
                    .map_err(|e| CaptureError::attach(&program, e))?;
            }
        }
        info!("Attached {} to {}", interceptor, symbol);
    }
    Ok(())
}
