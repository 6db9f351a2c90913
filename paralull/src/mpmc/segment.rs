use std::alloc::{self, Layout};
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::error::QueueError;

use super::handle::HandleId;

pub(crate) const SEGMENT_SIZE: usize = 1024;

// Word encodings shared by every slot kind. Payload words are at least
// 4-byte aligned, so their low two bits are always clear.
const EMPTY_WORD: usize = 0;
const TOP_WORD: usize = 1;
const TAG_MASK: usize = 0b11;

/// An opaque word stored in a cell. Never null and never carrying tag bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Payload(NonZeroUsize);

impl Payload {
    pub(crate) fn from_word(word: usize) -> Option<Self> {
        if word & TAG_MASK != 0 {
            return None;
        }
        NonZeroUsize::new(word).map(Payload)
    }

    pub(crate) fn from_ptr<T>(ptr: NonNull<T>) -> Self {
        debug_assert!(std::mem::align_of::<T>() > TAG_MASK);
        match Self::from_word(ptr.as_ptr() as usize) {
            Some(p) => p,
            None => crate::error::protocol_violation("misaligned payload pointer"),
        }
    }

    #[inline]
    pub(crate) fn word(self) -> usize {
        self.0.get()
    }

    #[inline]
    pub(crate) fn as_ptr<T>(self) -> *mut T {
        self.0.get() as *mut T
    }
}

/// A value that lives in one atomic word of a cell.
pub(crate) trait SlotWord: Copy {
    fn into_word(self) -> usize;
    fn from_word(word: usize) -> Self;
}

/// Contents of a cell's value slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Value {
    Empty,
    /// Claimed by a dequeuer before any enqueuer wrote it.
    Top,
    Item(Payload),
}

impl SlotWord for Value {
    #[inline]
    fn into_word(self) -> usize {
        match self {
            Value::Empty => EMPTY_WORD,
            Value::Top => TOP_WORD,
            Value::Item(p) => p.word(),
        }
    }

    #[inline]
    fn from_word(word: usize) -> Self {
        match word {
            EMPTY_WORD => Value::Empty,
            TOP_WORD => Value::Top,
            w => match Payload::from_word(w) {
                Some(p) => Value::Item(p),
                None => crate::error::protocol_violation("corrupted value slot"),
            },
        }
    }
}

/// Contents of a cell's enqueue or dequeue slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Claim {
    Empty,
    /// Closed: enq side means no request will be placed here; deq side
    /// means a fast-path dequeuer took the value.
    Top,
    /// Reserved for the request record of the given handle.
    Request(HandleId),
}

impl SlotWord for Claim {
    #[inline]
    fn into_word(self) -> usize {
        match self {
            Claim::Empty => EMPTY_WORD,
            Claim::Top => TOP_WORD,
            Claim::Request(id) => id + 2,
        }
    }

    #[inline]
    fn from_word(word: usize) -> Self {
        match word {
            EMPTY_WORD => Claim::Empty,
            TOP_WORD => Claim::Top,
            w => Claim::Request(w - 2),
        }
    }
}

/// One atomic word holding a `SlotWord`. All-zero bits decode as `Empty`.
#[repr(transparent)]
pub(crate) struct AtomicSlot<S> {
    word: AtomicUsize,
    _kind: PhantomData<S>,
}

impl<S: SlotWord> AtomicSlot<S> {
    #[cfg(test)]
    pub(crate) fn new(s: S) -> Self {
        Self {
            word: AtomicUsize::new(s.into_word()),
            _kind: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn load(&self, order: Ordering) -> S {
        S::from_word(self.word.load(order))
    }

    #[inline]
    pub(crate) fn store(&self, s: S, order: Ordering) {
        self.word.store(s.into_word(), order)
    }

    #[inline]
    pub(crate) fn compare_exchange(&self, current: S, new: S) -> Result<S, S> {
        self.word
            .compare_exchange(
                current.into_word(),
                new.into_word(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map(S::from_word)
            .map_err(S::from_word)
    }
}

#[repr(C)]
pub(crate) struct Cell {
    pub(crate) val: AtomicSlot<Value>,
    pub(crate) enq: AtomicSlot<Claim>,
    pub(crate) deq: AtomicSlot<Claim>,
}

#[repr(C)]
pub(crate) struct Segment {
    pub(crate) id: u64,
    pub(crate) next: AtomicPtr<Segment>,
    pub(crate) cells: [Cell; SEGMENT_SIZE],
}

impl Segment {
    fn layout() -> Layout {
        Layout::new::<Self>()
    }

    /// Allocates an empty segment. Every cell starts as all-`Empty`.
    pub(crate) fn alloc(id: u64) -> Result<NonNull<Segment>, QueueError> {
        let layout = Self::layout();
        // SAFETY: zeroed memory is a valid `Segment`: atomics at zero decode as
        // `Empty` and a null `next`. Only `id` needs writing.
        unsafe {
            let raw = alloc::alloc_zeroed(layout) as *mut Segment;
            let seg = NonNull::new(raw).ok_or(QueueError::AllocFailed {
                what: "segment",
                layout,
            })?;
            ptr::addr_of_mut!((*seg.as_ptr()).id).write(id);
            Ok(seg)
        }
    }

    /// Allocates or aborts through the global allocation error handler.
    pub(crate) fn alloc_or_abort(id: u64) -> NonNull<Segment> {
        Self::alloc(id).unwrap_or_else(|e| e.abort())
    }

    /// # Safety
    /// `seg` must come from `Segment::alloc` and be unreachable by every thread.
    pub(crate) unsafe fn free(seg: *mut Segment) {
        alloc::dealloc(seg as *mut u8, Self::layout());
    }

    #[inline]
    pub(crate) fn cell(&self, index: u64) -> &Cell {
        &self.cells[(index % SEGMENT_SIZE as u64) as usize]
    }
}

#[inline]
pub(crate) fn segment_of(index: u64) -> u64 {
    index / SEGMENT_SIZE as u64
}
