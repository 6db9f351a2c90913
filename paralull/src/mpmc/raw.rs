//! The wait-free queue on word-sized payloads.
//!
//! Enqueuers and dequeuers claim cell indices with fetch-and-add on `tail`
//! and `head`. The fast path is a single CAS on the claimed cell; after
//! `PATIENCE` failures the operation publishes a request record in its
//! handle and every other thread may finish it (`help_enq`, `help_deq`).

use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

use crate::error::{protocol_violation, QueueError};

use super::handle::{Handle, HandleId};
use super::reclaim::ReclaimGuard;
use super::registry::Registry;
use super::request::ReqState;
use super::segment::{segment_of, Cell, Claim, Payload, Segment, Value, SEGMENT_SIZE};

/// Fast-path attempts before falling back to the slow path.
pub(crate) const PATIENCE: usize = 42;
/// Loads spent waiting for a racing enqueuer before closing a cell.
const SPIN_LIMIT: usize = 100;

/// Outcome of `help_enq` for one cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Found {
    Item(Payload),
    /// Nothing here yet, but later enqueues may still linearize before it.
    Top,
    /// No enqueue can ever land at or before this index.
    Empty,
}

pub(crate) struct RawQueue {
    pub(super) head: CachePadded<AtomicU64>,
    pub(super) tail: CachePadded<AtomicU64>,
    /// Earliest retained segment.
    pub(super) first: AtomicPtr<Segment>,
    /// Id of `first`, or `RECLAIMING` while a thread owns the list front.
    pub(super) oldest: AtomicI64,
    pub(super) live_segments: AtomicUsize,
    pub(super) registry: Arc<Registry>,
}

impl RawQueue {
    pub(crate) fn new() -> Result<Self, QueueError> {
        let seg = Segment::alloc(0)?;
        Ok(Self {
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            first: AtomicPtr::new(seg.as_ptr()),
            oldest: AtomicI64::new(0),
            live_segments: AtomicUsize::new(1),
            registry: Arc::new(Registry::new()),
        })
    }

    pub(crate) fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub(crate) fn register(&self) -> Result<HandleId, QueueError> {
        let guard = ReclaimGuard::acquire(&self.oldest);
        let first = self.first.load(Ordering::Acquire);
        // SAFETY: `first` cannot be freed while the guard is held.
        let id = unsafe { self.registry.claim(&guard, first)? };
        drop(guard);
        tracing::trace!(target: "paralull", handle = id, "registered queue handle");
        Ok(id)
    }

    pub(crate) fn retained_segments(&self) -> usize {
        self.live_segments.load(Ordering::Relaxed)
    }

    /// Advisory: dequeues on an empty queue push `head` past `tail`.
    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) >= self.tail.load(Ordering::Acquire)
    }

    /// Walks `seg` forward to the segment holding `index`, linking new
    /// segments as needed, and returns that cell.
    ///
    /// `Err(next)` means the segment holding `index` was already reclaimed:
    /// `cleanup` moved the cursor past it because every dequeuer had settled
    /// those cells. `next` is the first index of the segment `*seg` names.
    ///
    /// # Safety
    /// `*seg` must be protected by the caller's hazard.
    unsafe fn find_cell<'a>(&self, seg: &mut *mut Segment, index: u64) -> Result<&'a Cell, u64> {
        let target = segment_of(index);
        let mut s = *seg;
        if (*s).id > target {
            return Err((*s).id * SEGMENT_SIZE as u64);
        }
        while (*s).id < target {
            let mut next = (*s).next.load(Ordering::Acquire);
            if next.is_null() {
                let fresh = Segment::alloc_or_abort((*s).id + 1);
                match (*s).next.compare_exchange(
                    ptr::null_mut(),
                    fresh.as_ptr(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.live_segments.fetch_add(1, Ordering::Relaxed);
                        next = fresh.as_ptr();
                    }
                    Err(winner) => {
                        Segment::free(fresh.as_ptr());
                        next = winner;
                    }
                }
            }
            s = next;
        }
        *seg = s;
        Ok((*s).cell(index))
    }

    /// `find_cell` on one of the handle's own cursors, moving it forward.
    unsafe fn find_own_cell<'a>(
        &self,
        cursor: &AtomicPtr<Segment>,
        index: u64,
    ) -> Result<&'a Cell, u64> {
        let mut seg = cursor.load(Ordering::Acquire);
        let cell = self.find_cell(&mut seg, index)?;
        let mut cur = cursor.load(Ordering::Acquire);
        while (*cur).id < (*seg).id {
            match cursor.compare_exchange_weak(cur, seg, Ordering::SeqCst, Ordering::Acquire) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
        Ok(cell)
    }

    /// Like `find_own_cell` for an index the caller knows is still retained.
    unsafe fn retained_own_cell<'a>(&self, cursor: &AtomicPtr<Segment>, index: u64) -> &'a Cell {
        match self.find_own_cell(cursor, index) {
            Ok(c) => c,
            Err(_) => protocol_violation("committed cell lies in a reclaimed segment"),
        }
    }

    #[inline]
    fn advance_end(end: &AtomicU64, to: u64) {
        end.fetch_max(to, Ordering::SeqCst);
    }

    pub(crate) fn enqueue(&self, hid: HandleId, v: Payload) {
        let h = self.registry.get(hid);
        h.protect(h.tail_seg.load(Ordering::Relaxed));
        // SAFETY: the hazard covers the tail cursor for the whole call.
        unsafe {
            let mut failed = None;
            for _ in 0..PATIENCE {
                match self.enq_fast(h, v) {
                    Ok(()) => {
                        failed = None;
                        break;
                    }
                    Err(i) => failed = Some(i),
                }
            }
            if let Some(i) = failed {
                self.enq_slow(hid, h, v, i);
            }
            h.tail_seg
                .store((*h.tail.load(Ordering::Acquire)).id, Ordering::Relaxed);
        }
        h.release();
    }

    unsafe fn enq_fast(&self, h: &Handle, v: Payload) -> Result<(), u64> {
        let i = self.tail.fetch_add(1, Ordering::SeqCst);
        let c = match self.find_own_cell(&h.tail, i) {
            Ok(c) => c,
            Err(next) => {
                // Every cell below `next` is closed; skip them in one step.
                Self::advance_end(&self.tail, next);
                return Err(i);
            }
        };
        match c.val.compare_exchange(Value::Empty, Value::Item(v)) {
            Ok(_) => Ok(()),
            Err(_) => Err(i),
        }
    }

    unsafe fn enq_slow(&self, hid: HandleId, h: &Handle, v: Payload, hint: u64) {
        let req = &h.enq.req;
        req.publish(v, hint);

        let mut tail = h.tail.load(Ordering::Acquire);
        loop {
            let i = self.tail.fetch_add(1, Ordering::SeqCst);
            let c = match self.find_cell(&mut tail, i) {
                Ok(c) => c,
                Err(next) => {
                    Self::advance_end(&self.tail, next);
                    if !req.state.load().is_pending() {
                        break;
                    }
                    continue;
                }
            };
            if c.enq.compare_exchange(Claim::Empty, Claim::Request(hid)).is_ok()
                && c.val.load(Ordering::SeqCst) != Value::Top
            {
                // Losing this claim means a helper already bound the request.
                req.try_claim(hint, i);
                break;
            }
            if !req.state.load().is_pending() {
                break;
            }
        }

        let state = req.state.load();
        if state.is_pending() {
            protocol_violation("enqueue request still pending after slow path");
        }
        let id = state.id();
        let c = self.retained_own_cell(&h.tail, id);
        Self::advance_end(&self.tail, id + 1);
        c.val.store(Value::Item(v), Ordering::Release);
    }

    /// Finds, or settles, the value of cell `i` on behalf of a dequeuer.
    unsafe fn help_enq(&self, h: &Handle, c: &Cell, i: u64) -> Found {
        let mut v = c.val.load(Ordering::Acquire);
        for _ in 0..SPIN_LIMIT {
            if v != Value::Empty {
                break;
            }
            std::hint::spin_loop();
            v = c.val.load(Ordering::Acquire);
        }
        match v {
            Value::Item(p) => return Found::Item(p),
            Value::Empty => {
                if let Err(Value::Item(p)) = c.val.compare_exchange(Value::Empty, Value::Top) {
                    return Found::Item(p);
                }
            }
            Value::Top => {}
        }

        let mut e = c.enq.load(Ordering::Acquire);
        if e == Claim::Empty {
            e = self.offer_peer_request(h, c, i);
            if e == Claim::Empty {
                e = match c.enq.compare_exchange(Claim::Empty, Claim::Top) {
                    Ok(_) => Claim::Top,
                    Err(actual) => actual,
                };
            }
        }

        let rid = match e {
            Claim::Top => {
                return if self.tail.load(Ordering::SeqCst) <= i {
                    Found::Empty
                } else {
                    Found::Top
                };
            }
            Claim::Request(rid) => rid,
            Claim::Empty => protocol_violation("enqueue slot reopened"),
        };

        let req = &self.registry.get(rid).enq.req;
        let state = req.state.load();
        let ev = req.payload();

        if state.is_pending() && state.id() > i {
            // The request cannot live here; it targets a later cell.
            if c.val.load(Ordering::SeqCst) == Value::Top
                && self.tail.load(Ordering::SeqCst) <= i
            {
                return Found::Empty;
            }
        } else if (state.is_pending() && req.try_claim(state.id(), i))
            || (state == ReqState::done(i) && c.val.load(Ordering::SeqCst) == Value::Top)
        {
            let Some(ev) = ev else {
                protocol_violation("claimed enqueue request without a value");
            };
            Self::advance_end(&self.tail, i + 1);
            c.val.store(Value::Item(ev), Ordering::Release);
        }

        match c.val.load(Ordering::Acquire) {
            Value::Item(p) => Found::Item(p),
            _ => Found::Top,
        }
    }

    /// Tries to reserve cell `i` for the pending enqueue of the current peer.
    /// Returns the enqueue slot as seen afterwards.
    unsafe fn offer_peer_request(&self, h: &Handle, c: &Cell, i: u64) -> Claim {
        let mut peer = h.enq.peer.load(Ordering::Relaxed);
        let mut state = self.registry.get(peer).enq.req.state.load();

        let seen = h.enq.seen.load(Ordering::Relaxed);
        if seen != 0 && seen != state.bits() {
            // The request we were waiting to place has moved on.
            h.enq.seen.store(0, Ordering::Relaxed);
            peer = self.registry.next(peer);
            h.enq.peer.store(peer, Ordering::Relaxed);
            state = self.registry.get(peer).enq.req.state.load();
        }

        let mut e = Claim::Empty;
        let stay = state.is_pending()
            && state.id() <= i
            && match c.enq.compare_exchange(Claim::Empty, Claim::Request(peer)) {
                Ok(_) => {
                    e = Claim::Request(peer);
                    false
                }
                Err(actual) => {
                    e = actual;
                    actual != Claim::Request(peer)
                }
            };

        if stay {
            h.enq.seen.store(state.bits(), Ordering::Relaxed);
        } else {
            h.enq.seen.store(0, Ordering::Relaxed);
            h.enq.peer.store(self.registry.next(peer), Ordering::Relaxed);
        }
        e
    }

    pub(crate) fn dequeue(&self, hid: HandleId) -> Option<Payload> {
        let h = self.registry.get(hid);
        h.protect(h.head_seg.load(Ordering::Relaxed));
        // SAFETY: the hazard covers the head cursor, and `help_deq` lowers it
        // further before touching a peer's segments.
        let v = unsafe {
            let mut outcome = Err(0);
            for _ in 0..PATIENCE {
                outcome = self.deq_fast(h);
                if outcome.is_ok() {
                    break;
                }
            }
            let v = match outcome {
                Ok(v) => v,
                Err(i) => self.deq_slow(hid, h, i),
            };

            if v.is_some() {
                let peer = h.deq.peer.load(Ordering::Relaxed);
                self.help_deq(h, peer);
                h.deq.peer.store(self.registry.next(peer), Ordering::Relaxed);
            }

            h.head_seg
                .store((*h.head.load(Ordering::Acquire)).id, Ordering::Relaxed);
            v
        };
        h.release();
        // SAFETY: `h` is the caller's handle and its hazard is released.
        unsafe { self.cleanup(h) };
        v
    }

    /// `Ok(Some)` on a value, `Ok(None)` on a proven-empty queue, `Err(i)`
    /// when cell `i` had to be skipped.
    unsafe fn deq_fast(&self, h: &Handle) -> Result<Option<Payload>, u64> {
        let i = self.head.fetch_add(1, Ordering::SeqCst);
        let Ok(c) = self.find_own_cell(&h.head, i) else {
            return Err(i);
        };
        match self.help_enq(h, c, i) {
            Found::Empty => Ok(None),
            Found::Item(v) if c.deq.compare_exchange(Claim::Empty, Claim::Top).is_ok() => {
                Ok(Some(v))
            }
            _ => Err(i),
        }
    }

    unsafe fn deq_slow(&self, hid: HandleId, h: &Handle, id: u64) -> Option<Payload> {
        let req = &h.deq.req;
        req.publish(id);

        self.help_deq(h, hid);

        let state = req.state.load();
        if state.is_pending() {
            protocol_violation("dequeue request still pending after helping");
        }
        let i = state.id();
        let c = self.retained_own_cell(&h.head, i);
        let v = c.val.load(Ordering::Acquire);
        Self::advance_end(&self.head, i + 1);
        match v {
            Value::Item(p) => Some(p),
            _ => None,
        }
    }

    /// Drives the pending dequeue request of handle `pid` to completion.
    unsafe fn help_deq(&self, h: &Handle, pid: HandleId) {
        let peer = self.registry.get(pid);
        let req = &peer.deq.req;
        let state = req.state.load();
        let id = req.generation();
        if !state.is_pending() || state.id() < id {
            return;
        }

        let mut ha = peer.head.load(Ordering::Acquire);
        h.protect_also(peer.hazard.load(Ordering::SeqCst));
        let mut state = req.state.load();

        let mut i = id + 1;
        let mut old = id;
        let mut cand: Option<u64> = None;

        loop {
            let mut hc = ha;
            while cand.is_none() && state == ReqState::pending(old) {
                let c = match self.find_cell(&mut hc, i) {
                    Ok(c) => c,
                    Err(next) => {
                        // Reclaimed cells hold nothing left to take.
                        i = next;
                        continue;
                    }
                };
                match self.help_enq(h, c, i) {
                    Found::Empty => cand = Some(i),
                    Found::Item(_) if c.deq.load(Ordering::SeqCst) == Claim::Empty => {
                        cand = Some(i)
                    }
                    _ => state = req.state.load(),
                }
                i += 1;
            }

            if let Some(n) = cand {
                state = req.try_announce(state, n);
                if state.id() >= n {
                    cand = None;
                }
            }

            if !state.is_pending() || req.generation() != id {
                return;
            }

            let idx = state.id();
            let Ok(c) = self.find_cell(&mut ha, idx) else {
                protocol_violation("announced cell lies in a reclaimed segment");
            };
            let claimed = c.val.load(Ordering::SeqCst) == Value::Top
                || match c.deq.compare_exchange(Claim::Empty, Claim::Request(pid)) {
                    Ok(_) => true,
                    Err(actual) => actual == Claim::Request(pid),
                };
            if claimed {
                req.try_complete(idx);
                return;
            }

            old = idx;
            if idx >= i {
                i = idx + 1;
            }
        }
    }

    /// Calls `f` on every committed value no dequeuer has claimed.
    pub(crate) fn drain_unclaimed(&mut self, mut f: impl FnMut(Payload)) {
        let mut seg = *self.first.get_mut();
        // SAFETY: `&mut self` rules out concurrent operations; every linked
        // segment from `first` on is live.
        unsafe {
            while !seg.is_null() {
                for c in (*seg).cells.iter() {
                    if let Value::Item(p) = c.val.load(Ordering::Relaxed) {
                        if c.deq.load(Ordering::Relaxed) == Claim::Empty {
                            f(p);
                        }
                    }
                }
                seg = (*seg).next.load(Ordering::Relaxed);
            }
        }
    }
}

impl Drop for RawQueue {
    fn drop(&mut self) {
        self.registry.close();
        let mut seg = *self.first.get_mut();
        while !seg.is_null() {
            // SAFETY: no handle can reach the segments once the queue is
            // dropped; each is freed exactly once.
            unsafe {
                let next = (*seg).next.load(Ordering::Relaxed);
                Segment::free(seg);
                seg = next;
            }
        }
    }
}
