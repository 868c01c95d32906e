use crate::{ARG_COUNT, ARG_LEN, CMDLINE_LEN, ProcessIdentity, identity_key};

/// Access to the argv array of an exec, which lives in user memory.
pub trait ArgReader {
    /// Pointer stored at `argv[index]`, or `None` if the array itself could
    /// not be read. A NULL pointer (`Some(0)`) terminates the vector.
    fn arg_ptr(&self, index: usize) -> Option<u64>;

    /// Copy the NUL-terminated string at `ptr` into `dst`, truncating to fit.
    /// Returns `false` if the user memory could not be read.
    fn read_str(&self, ptr: u64, dst: &mut [u8]) -> bool;
}

/// Direct-mapped identity table keyed by [`identity_key`].
///
/// Implementations must never block: the kernel map is updated in place and
/// the host table gives up on contention.
pub trait IdentityStore {
    /// Overwrite slot `key` unconditionally.
    fn store(&self, key: u32, identity: &ProcessIdentity);

    /// Copy the command line held in slot `key` into `dst` if the slot is
    /// owned by `tgid`. Returns whether anything was copied.
    fn load_cmdline(&self, key: u32, tgid: u32, dst: &mut [u8; CMDLINE_LEN]) -> bool;
}

/// Capture the first `ARG_COUNT` arguments of an exec into the identity table.
///
/// Each argument lands in its own `ARG_LEN` slot with the last byte forced to
/// NUL. A failed read leaves that slot and every later one zeroed.
#[inline(always)]
pub fn record_exec<R: ArgReader, S: IdentityStore>(tgid: u32, argv: &R, store: &S) {
    let mut identity = ProcessIdentity::zeroed();
    identity.original_tgid = tgid;
    capture_args(argv, &mut identity.cmdline);
    store.store(identity_key(tgid), &identity);
}

#[inline(always)]
fn capture_args<R: ArgReader>(argv: &R, cmdline: &mut [u8; CMDLINE_LEN]) {
    for i in 0..ARG_COUNT {
        let ptr = match argv.arg_ptr(i) {
            Some(0) | None => break,
            Some(ptr) => ptr,
        };
        let start = i * ARG_LEN;
        let slot = &mut cmdline[start..start + ARG_LEN];
        if !argv.read_str(ptr, slot) {
            slot.fill(0);
            break;
        }
        slot[ARG_LEN - 1] = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct FakeArgv(Vec<Option<&'static [u8]>>);

    impl ArgReader for FakeArgv {
        fn arg_ptr(&self, index: usize) -> Option<u64> {
            Some(if index < self.0.len() { index as u64 + 1 } else { 0 })
        }

        fn read_str(&self, ptr: u64, dst: &mut [u8]) -> bool {
            match self.0[ptr as usize - 1] {
                Some(arg) => {
                    let len = arg.len().min(dst.len() - 1);
                    dst[..len].copy_from_slice(&arg[..len]);
                    dst[len] = 0;
                    true
                }
                None => {
                    dst[0] = 0xAA;
                    false
                }
            }
        }
    }

    #[derive(Default)]
    struct Slots(RefCell<Vec<(u32, ProcessIdentity)>>);

    impl IdentityStore for Slots {
        fn store(&self, key: u32, identity: &ProcessIdentity) {
            self.0.borrow_mut().push((key, *identity));
        }

        fn load_cmdline(&self, _key: u32, _tgid: u32, _dst: &mut [u8; CMDLINE_LEN]) -> bool {
            false
        }
    }

    fn slot(identity: &ProcessIdentity, index: usize) -> &[u8] {
        &identity.cmdline[index * ARG_LEN..(index + 1) * ARG_LEN]
    }

    #[test]
    fn test_record_exec_stores_args_in_slots() {
        let argv = FakeArgv(vec![Some(b"dig"), Some(b"example.com"), Some(b"@8.8.8.8")]);
        let slots = Slots::default();
        record_exec(4242, &argv, &slots);

        let stored = slots.0.borrow();
        let (key, identity) = &stored[0];
        assert_eq!(*key, 4242);
        assert_eq!(identity.original_tgid, 4242);
        assert_eq!(&slot(identity, 0)[..4], b"dig\0");
        assert_eq!(&slot(identity, 1)[..12], b"example.com\0");
        assert_eq!(&slot(identity, 2)[..9], b"@8.8.8.8\0");
        assert!(slot(identity, 3).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_record_exec_truncates_long_argument() {
        let long: &'static [u8] = b"a-very-long-argument-that-does-not-fit-in-a-slot";
        let argv = FakeArgv(vec![Some(long), Some(b"next")]);
        let slots = Slots::default();
        record_exec(1, &argv, &slots);

        let stored = slots.0.borrow();
        let identity = &stored[0].1;
        assert_eq!(&slot(identity, 0)[..ARG_LEN - 1], &long[..ARG_LEN - 1]);
        assert_eq!(slot(identity, 0)[ARG_LEN - 1], 0);
        assert_eq!(&slot(identity, 1)[..5], b"next\0");
    }

    #[test]
    fn test_record_exec_stops_at_first_failed_read() {
        let argv = FakeArgv(vec![Some(b"curl"), None, Some(b"never-read")]);
        let slots = Slots::default();
        record_exec(9, &argv, &slots);

        let stored = slots.0.borrow();
        let identity = &stored[0].1;
        assert_eq!(&slot(identity, 0)[..5], b"curl\0");
        assert!(identity.cmdline[ARG_LEN..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_record_exec_hashes_key() {
        let argv = FakeArgv(vec![]);
        let slots = Slots::default();
        record_exec(crate::TABLE_SIZE + 5, &argv, &slots);

        let stored = slots.0.borrow();
        assert_eq!(stored[0].0, 5);
        assert_eq!(stored[0].1.original_tgid, crate::TABLE_SIZE + 5);
        assert!(stored[0].1.cmdline.iter().all(|&b| b == 0));
    }
}
