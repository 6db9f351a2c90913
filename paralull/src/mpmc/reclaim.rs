//! Segment reclamation.
//!
//! The queue keeps `oldest`, the id of the earliest retained segment. A
//! thread that swaps it to `RECLAIMING` owns the front of the segment list
//! until it stores an id back; only that thread frees segments or registers
//! handles. Before freeing, every handle's cursors are pushed forward to the
//! new boundary and every published hazard pulls the boundary back.

use std::sync::atomic::{AtomicI64, AtomicPtr, AtomicU64, Ordering};

use crossbeam_utils::Backoff;

use super::handle::Handle;
use super::raw::RawQueue;
use super::segment::Segment;

pub(crate) const RECLAIMING: i64 = -1;
/// Segments that must pile up behind a dequeuer before it tries to reclaim.
pub(crate) const MAX_GARBAGE: i64 = 16;

/// Exclusive ownership of the front of the segment list.
pub(crate) struct ReclaimGuard<'a> {
    marker: &'a AtomicI64,
    restore: i64,
}

impl<'a> ReclaimGuard<'a> {
    /// Takes the guard if the marker still reads `oldest`.
    pub(crate) fn try_acquire(marker: &'a AtomicI64, oldest: i64) -> Option<Self> {
        if oldest == RECLAIMING {
            return None;
        }
        marker
            .compare_exchange(oldest, RECLAIMING, Ordering::AcqRel, Ordering::Relaxed)
            .ok()
            .map(|_| ReclaimGuard {
                marker,
                restore: oldest,
            })
    }

    /// Spins until the guard is free, then takes it.
    pub(crate) fn acquire(marker: &'a AtomicI64) -> Self {
        let backoff = Backoff::new();
        loop {
            let oldest = marker.load(Ordering::Acquire);
            if let Some(guard) = Self::try_acquire(marker, oldest) {
                return guard;
            }
            backoff.snooze();
        }
    }

    /// Releases the guard publishing `oldest` as the new earliest segment id.
    pub(crate) fn publish(mut self, oldest: i64) {
        self.restore = oldest;
    }
}

impl Drop for ReclaimGuard<'_> {
    fn drop(&mut self) {
        self.marker.store(self.restore, Ordering::Release);
    }
}

/// Pulls `cur` back to the segment a handle's hazard names, if older.
unsafe fn check(hazard: &AtomicU64, cur: *mut Segment, old: *mut Segment) -> *mut Segment {
    let hzd = hazard.load(Ordering::SeqCst);
    if hzd < (*cur).id {
        let mut tmp = old;
        while (*tmp).id < hzd {
            tmp = (*tmp).next.load(Ordering::Acquire);
        }
        return tmp;
    }
    cur
}

/// Pushes a lagging cursor forward to `cur`. If the owner moved it
/// concurrently, or holds a hazard behind `cur`, the boundary moves back.
unsafe fn update(
    cursor: &AtomicPtr<Segment>,
    mut cur: *mut Segment,
    hazard: &AtomicU64,
    old: *mut Segment,
) -> *mut Segment {
    let ptr = cursor.load(Ordering::SeqCst);
    if (*ptr).id < (*cur).id {
        if let Err(actual) =
            cursor.compare_exchange(ptr, cur, Ordering::SeqCst, Ordering::SeqCst)
        {
            if (*actual).id < (*cur).id {
                cur = actual;
            }
        }
        cur = check(hazard, cur, old);
    }
    cur
}

impl RawQueue {
    /// Opportunistic reclamation run at the end of each dequeue.
    ///
    /// # Safety
    /// `h` must be the caller's own handle and the caller must not hold a
    /// hazard.
    pub(crate) unsafe fn cleanup(&self, h: &Handle) {
        let oid = self.oldest.load(Ordering::Acquire);
        if oid == RECLAIMING {
            return;
        }
        if (h.head_seg.load(Ordering::Relaxed) as i64) - oid < MAX_GARBAGE {
            return;
        }
        let Some(guard) = ReclaimGuard::try_acquire(&self.oldest, oid) else {
            return;
        };

        let old = self.first.load(Ordering::Acquire);
        let mut new = h.head.load(Ordering::Acquire);
        let oid = oid as u64;

        let mut visited = 0;
        for (_, ph) in self.registry.iter() {
            new = check(&ph.hazard, new, old);
            new = update(&ph.tail, new, &ph.hazard, old);
            new = update(&ph.head, new, &ph.hazard, old);
            visited += 1;
            if (*new).id <= oid {
                break;
            }
        }
        // Hazards published while the first pass ran.
        for id in (0..visited).rev() {
            if (*new).id <= oid {
                break;
            }
            new = check(&self.registry.get(id).hazard, new, old);
        }

        let nid = (*new).id;
        if nid <= oid {
            return;
        }

        self.first.store(new, Ordering::Release);
        guard.publish(nid as i64);

        let mut freed = 0usize;
        let mut seg = old;
        while seg != new {
            let next = (*seg).next.load(Ordering::Acquire);
            Segment::free(seg);
            seg = next;
            freed += 1;
        }
        self.live_segments.fetch_sub(freed, Ordering::Relaxed);
        tracing::debug!(target: "paralull", freed, oldest = nid, "reclaimed queue segments");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_excludes_and_restores() {
        let marker = AtomicI64::new(3);
        let guard = ReclaimGuard::try_acquire(&marker, 3).unwrap();
        assert_eq!(marker.load(Ordering::Relaxed), RECLAIMING);
        assert!(ReclaimGuard::try_acquire(&marker, RECLAIMING).is_none());
        assert!(ReclaimGuard::try_acquire(&marker, 3).is_none());
        drop(guard);
        assert_eq!(marker.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn publish_moves_the_oldest_id() {
        let marker = AtomicI64::new(0);
        let guard = ReclaimGuard::acquire(&marker);
        guard.publish(17);
        assert_eq!(marker.load(Ordering::Relaxed), 17);
        assert!(ReclaimGuard::try_acquire(&marker, 0).is_none());
        assert!(ReclaimGuard::try_acquire(&marker, 17).is_some());
    }
}
