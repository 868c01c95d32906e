//! Bounded multi-producer ring of DNS send records
//!
//! Slot-sequence ring: each slot carries a sequence number that tells
//! producers and the consumer whose turn it is. Producers claim a position by
//! CAS on the write cursor, fill the slot, then publish it with a release
//! store of the slot sequence. The consumer only reads slots whose sequence
//! says "published", so a record is never observed half-written. A full ring
//! fails the reservation; nothing ever waits.

use dnswatch_ebpf_common::{
    DnsSendEvent, EventSink, ReservedEvent, EVENTS_BYTE_SIZE, RINGBUF_HEADER_LEN,
};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Bytes one record occupies in a BPF ring buffer (header + 8-byte aligned body).
pub const RECORD_FOOTPRINT: usize =
    (std::mem::size_of::<DnsSendEvent>() + RINGBUF_HEADER_LEN + 7) & !7;

struct Slot {
    /// `pos` when free for the producer at `pos`, `pos + 1` once published.
    seq: AtomicUsize,
    discarded: AtomicBool,
    event: UnsafeCell<MaybeUninit<DnsSendEvent>>,
}

pub struct EventRing {
    slots: Box<[Slot]>,
    write: AtomicUsize,
    read: AtomicUsize,
    lost: AtomicU64,
}

// Slot contents are only touched by the thread that owns the slot per its
// sequence number.
unsafe impl Sync for EventRing {}
unsafe impl Send for EventRing {}

impl EventRing {
    /// Ring sized like a BPF ring buffer of `byte_size` bytes.
    pub fn with_byte_size(byte_size: usize) -> Self {
        Self::with_capacity(byte_size / RECORD_FOOTPRINT)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let slots = (0..capacity)
            .map(|i| Slot {
                seq: AtomicUsize::new(i),
                discarded: AtomicBool::new(false),
                event: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            slots,
            write: AtomicUsize::new(0),
            read: AtomicUsize::new(0),
            lost: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Reservations that failed because the ring was full.
    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    /// Positions reserved but not yet consumed (published or in flight).
    pub fn len(&self) -> usize {
        let write = self.write.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim a slot for one zeroed record. `None` if the ring is full.
    pub fn try_reserve(&self) -> Option<RingReservation<'_>> {
        let capacity = self.slots.len();
        let mut pos = self.write.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos % capacity];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq as isize - pos as isize;
            if diff == 0 {
                match self.write.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the CAS made this thread the sole owner of
                        // the slot until it stores `pos + 1`.
                        unsafe { (*slot.event.get()).write(DnsSendEvent::zeroed()) };
                        slot.discarded.store(false, Ordering::Relaxed);
                        return Some(RingReservation {
                            ring: self,
                            pos,
                            done: false,
                        });
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                // The slot still holds a record from one lap ago.
                self.lost.fetch_add(1, Ordering::Relaxed);
                return None;
            } else {
                pos = self.write.load(Ordering::Relaxed);
            }
        }
    }

    /// Take the oldest published record, skipping discarded reservations.
    ///
    /// Returns `None` when the ring is empty or the next record in
    /// reservation order is still being written.
    pub fn pop(&self) -> Option<DnsSendEvent> {
        let capacity = self.slots.len();
        let mut pos = self.read.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos % capacity];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq as isize - pos.wrapping_add(1) as isize;
            if diff == 0 {
                match self.read.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let discarded = slot.discarded.load(Ordering::Relaxed);
                        // SAFETY: published (seq == pos + 1) and claimed by the
                        // read CAS; initialized in `try_reserve`.
                        let event = unsafe { (*slot.event.get()).assume_init_read() };
                        slot.seq
                            .store(pos.wrapping_add(capacity), Ordering::Release);
                        if discarded {
                            pos = self.read.load(Ordering::Relaxed);
                            continue;
                        }
                        return Some(event);
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.read.load(Ordering::Relaxed);
            }
        }
    }

    /// Pop up to `max` records.
    pub fn drain(&self, max: usize) -> Vec<DnsSendEvent> {
        let mut events = Vec::new();
        while events.len() < max {
            match self.pop() {
                Some(event) => events.push(event),
                None => break,
            }
        }
        events
    }

    fn publish(&self, pos: usize, discarded: bool) {
        let slot = &self.slots[pos % self.slots.len()];
        slot.discarded.store(discarded, Ordering::Relaxed);
        slot.seq.store(pos.wrapping_add(1), Ordering::Release);
    }
}

impl Default for EventRing {
    fn default() -> Self {
        Self::with_byte_size(EVENTS_BYTE_SIZE as usize)
    }
}

/// A claimed slot. Dropping it without [`commit`](Self::commit) discards it.
pub struct RingReservation<'a> {
    ring: &'a EventRing,
    pos: usize,
    done: bool,
}

impl RingReservation<'_> {
    pub fn event_mut(&mut self) -> &mut DnsSendEvent {
        let slot = &self.ring.slots[self.pos % self.ring.slots.len()];
        // SAFETY: owned until published; initialized at reservation.
        unsafe { (*slot.event.get()).assume_init_mut() }
    }

    /// Make the record visible to the consumer.
    pub fn commit(mut self) {
        self.done = true;
        self.ring.publish(self.pos, false);
    }

    /// Release the slot without delivering it.
    pub fn discard(mut self) {
        self.done = true;
        self.ring.publish(self.pos, true);
    }
}

impl Drop for RingReservation<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.ring.publish(self.pos, true);
        }
    }
}

impl EventSink for EventRing {
    type Entry<'a> = RingReservation<'a>;

    fn reserve(&self) -> Option<RingReservation<'_>> {
        self.try_reserve()
    }
}

impl ReservedEvent for RingReservation<'_> {
    fn event_mut(&mut self) -> &mut DnsSendEvent {
        RingReservation::event_mut(self)
    }

    fn submit(self) {
        self.commit();
    }
}
