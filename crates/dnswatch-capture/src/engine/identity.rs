//! Direct-mapped process identity table
//!
//! One slot per `tgid % TABLE_SIZE`. Collisions overwrite; readers check the
//! slot owner. Slots are guarded by `try_*` locks only, so an exec racing a
//! send on the same slot costs one lost update or one missing command line,
//! never a wait.

use dnswatch_ebpf_common::{
    identity_key, IdentityStore, ProcessIdentity, CMDLINE_LEN, TABLE_SIZE,
};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct IdentityTable {
    slots: Box<[RwLock<ProcessIdentity>]>,
    contended: AtomicU64,
}

impl IdentityTable {
    pub fn new() -> Self {
        let slots = (0..TABLE_SIZE)
            .map(|_| RwLock::new(ProcessIdentity::zeroed()))
            .collect();
        Self {
            slots,
            contended: AtomicU64::new(0),
        }
    }

    /// Identity currently stored for `tgid`, if the slot belongs to it.
    pub fn lookup(&self, tgid: u32) -> Option<ProcessIdentity> {
        let slot = self.slots.get(identity_key(tgid) as usize)?;
        let identity = *slot.read();
        (identity.original_tgid == tgid).then_some(identity)
    }

    /// Stores and loads abandoned because the slot was busy.
    pub fn contended(&self) -> u64 {
        self.contended.load(Ordering::Relaxed)
    }
}

impl Default for IdentityTable {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityStore for IdentityTable {
    fn store(&self, key: u32, identity: &ProcessIdentity) {
        let Some(slot) = self.slots.get(key as usize) else {
            return;
        };
        match slot.try_write() {
            Some(mut guard) => *guard = *identity,
            None => {
                self.contended.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn load_cmdline(&self, key: u32, tgid: u32, dst: &mut [u8; CMDLINE_LEN]) -> bool {
        let Some(slot) = self.slots.get(key as usize) else {
            return false;
        };
        let Some(guard) = slot.try_read() else {
            self.contended.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        if guard.original_tgid != tgid {
            return false;
        }
        dst.copy_from_slice(&guard.cmdline);
        true
    }
}
