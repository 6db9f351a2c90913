use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use super::request::{DeqReq, EnqReq};
use super::segment::Segment;

/// Stable index of a handle inside the registry arena.
pub(crate) type HandleId = usize;

pub(crate) const NO_HAZARD: u64 = u64::MAX;

pub(crate) const ACTIVE: u8 = 1;
pub(crate) const RETIRED: u8 = 2;

pub(crate) struct EnqState {
    pub(crate) req: EnqReq,
    /// Next handle whose pending enqueue this thread will try to place.
    pub(crate) peer: AtomicUsize,
    /// Raw state of the peer request we failed to place last time, 0 if none.
    pub(crate) seen: AtomicU64,
}

pub(crate) struct DeqState {
    pub(crate) req: DeqReq,
    /// Next handle this thread helps after a successful dequeue.
    pub(crate) peer: AtomicUsize,
}

/// Per-thread record. Fields other than the cursors and the hazard are only
/// written by the owning thread; helpers read them through the registry.
#[repr(C, align(128))]
pub(crate) struct Handle {
    /// Enqueue-side segment cursor.
    pub(crate) tail: AtomicPtr<Segment>,
    /// Dequeue-side segment cursor.
    pub(crate) head: AtomicPtr<Segment>,
    // Owner's copies of the cursor ids. Reading them never dereferences a
    // segment that may already be reclaimed.
    pub(crate) tail_seg: AtomicU64,
    pub(crate) head_seg: AtomicU64,
    /// Oldest segment id this thread may dereference, or `NO_HAZARD`.
    pub(crate) hazard: AtomicU64,
    pub(crate) enq: EnqState,
    pub(crate) deq: DeqState,
    pub(crate) state: AtomicU8,
}

impl Handle {
    pub(crate) const fn new() -> Self {
        Self {
            tail: AtomicPtr::new(null_mut()),
            head: AtomicPtr::new(null_mut()),
            tail_seg: AtomicU64::new(0),
            head_seg: AtomicU64::new(0),
            hazard: AtomicU64::new(NO_HAZARD),
            enq: EnqState {
                req: EnqReq::new(),
                peer: AtomicUsize::new(0),
                seen: AtomicU64::new(0),
            },
            deq: DeqState {
                req: DeqReq::new(),
                peer: AtomicUsize::new(0),
            },
            state: AtomicU8::new(0),
        }
    }

    /// Prepares the handle for a new owner. `first` is the earliest retained
    /// segment; the caller holds the reclamation guard so it cannot be freed.
    ///
    /// # Safety
    /// `first` must point to a live segment and the caller must hold the
    /// reclamation guard.
    pub(crate) unsafe fn activate(&self, first: *mut Segment, peer: HandleId) {
        for (cursor, seg_id) in [(&self.tail, &self.tail_seg), (&self.head, &self.head_seg)] {
            let mut cur = cursor.load(Ordering::Acquire);
            if cur.is_null() {
                cursor.store(first, Ordering::Release);
                cur = first;
            }
            seg_id.store((*cur).id, Ordering::Relaxed);
        }
        self.enq.peer.store(peer, Ordering::Relaxed);
        self.enq.seen.store(0, Ordering::Relaxed);
        self.deq.peer.store(peer, Ordering::Relaxed);
        self.hazard.store(NO_HAZARD, Ordering::Release);
    }

    /// Publishes `seg_id` as this thread's hazard. The fence orders the
    /// publication before any later cursor load.
    #[inline]
    pub(crate) fn protect(&self, seg_id: u64) {
        self.hazard.store(seg_id, Ordering::SeqCst);
        std::sync::atomic::fence(Ordering::SeqCst);
    }

    /// Lowers the hazard to also cover a peer's segments.
    #[inline]
    pub(crate) fn protect_also(&self, seg_id: u64) {
        self.hazard.fetch_min(seg_id, Ordering::SeqCst);
        std::sync::atomic::fence(Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn release(&self) {
        self.hazard.store(NO_HAZARD, Ordering::Release);
    }
}
