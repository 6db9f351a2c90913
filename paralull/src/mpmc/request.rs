use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::segment::Payload;

const PENDING_BIT: u64 = 1 << 63;
const ID_MASK: u64 = !PENDING_BIT;

/// Pending flag and a 63-bit cell id packed into one word, so a single
/// CAS moves both together.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReqState(u64);

impl ReqState {
    pub(crate) const IDLE: ReqState = ReqState(0);

    #[inline]
    pub(crate) const fn pending(id: u64) -> Self {
        ReqState(PENDING_BIT | (id & ID_MASK))
    }

    #[inline]
    pub(crate) const fn done(id: u64) -> Self {
        ReqState(id & ID_MASK)
    }

    #[inline]
    pub(crate) const fn is_pending(self) -> bool {
        self.0 & PENDING_BIT != 0
    }

    #[inline]
    pub(crate) const fn id(self) -> u64 {
        self.0 & ID_MASK
    }

    #[inline]
    pub(crate) const fn bits(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ReqState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReqState")
            .field("pending", &self.is_pending())
            .field("id", &self.id())
            .finish()
    }
}

pub(crate) struct AtomicReqState(AtomicU64);

impl AtomicReqState {
    pub(crate) const fn new() -> Self {
        AtomicReqState(AtomicU64::new(ReqState::IDLE.0))
    }

    #[inline]
    pub(crate) fn load(&self) -> ReqState {
        ReqState(self.0.load(Ordering::SeqCst))
    }

    #[inline]
    pub(crate) fn store(&self, s: ReqState) {
        self.0.store(s.0, Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn compare_exchange(&self, current: ReqState, new: ReqState) -> Result<ReqState, ReqState> {
        self.0
            .compare_exchange(current.0, new.0, Ordering::SeqCst, Ordering::SeqCst)
            .map(ReqState)
            .map_err(ReqState)
    }
}

/// Slow-path enqueue request. Reused by its owner across calls.
pub(crate) struct EnqReq {
    val: AtomicUsize,
    pub(crate) state: AtomicReqState,
}

impl EnqReq {
    pub(crate) const fn new() -> Self {
        Self {
            val: AtomicUsize::new(0),
            state: AtomicReqState::new(),
        }
    }

    /// Announces `val` with the index of the last failed fast attempt as hint.
    pub(crate) fn publish(&self, val: Payload, hint: u64) {
        self.val.store(val.word(), Ordering::SeqCst);
        self.state.store(ReqState::pending(hint));
    }

    pub(crate) fn payload(&self) -> Option<Payload> {
        Payload::from_word(self.val.load(Ordering::SeqCst))
    }

    /// Binds the request to cell `index`. Only one claim ever succeeds per
    /// publication.
    #[inline]
    pub(crate) fn try_claim(&self, hint: u64, index: u64) -> bool {
        self.state
            .compare_exchange(ReqState::pending(hint), ReqState::done(index))
            .is_ok()
    }
}

/// Slow-path dequeue request. `id` names the generation (the index the
/// owner last failed on); `state` tracks the announced candidate cell.
pub(crate) struct DeqReq {
    pub(crate) id: AtomicU64,
    pub(crate) state: AtomicReqState,
}

impl DeqReq {
    pub(crate) const fn new() -> Self {
        Self {
            id: AtomicU64::new(0),
            state: AtomicReqState::new(),
        }
    }

    pub(crate) fn publish(&self, id: u64) {
        self.id.store(id, Ordering::SeqCst);
        self.state.store(ReqState::pending(id));
    }

    #[inline]
    pub(crate) fn generation(&self) -> u64 {
        self.id.load(Ordering::SeqCst)
    }

    /// Moves the announced candidate from `seen` to `cand`. Returns the state
    /// observed afterwards.
    pub(crate) fn try_announce(&self, seen: ReqState, cand: u64) -> ReqState {
        match self.state.compare_exchange(seen, ReqState::pending(cand)) {
            Ok(_) => ReqState::pending(cand),
            Err(actual) => actual,
        }
    }

    pub(crate) fn try_complete(&self, idx: u64) -> bool {
        self.state
            .compare_exchange(ReqState::pending(idx), ReqState::done(idx))
            .is_ok()
    }
}
