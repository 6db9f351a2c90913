//! Arena of thread handles.
//!
//! Handles are addressed by a stable `HandleId` and are never freed while
//! the registry lives, so any id read from a cell or a peer pointer always
//! names valid memory. The ring order is the id order: the successor of
//! `id` is `(id + 1) % len`.
//!
//! Storage is a fixed array of buckets whose sizes double (8, 16, 32, ...),
//! so lookup is O(1) and growth never moves existing handles.

use std::alloc::{self, Layout};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crate::error::{protocol_violation, QueueError};

use super::handle::{Handle, HandleId, ACTIVE, RETIRED};
use super::reclaim::ReclaimGuard;
use super::segment::Segment;

const FIRST_BUCKET_BITS: u32 = 3;
const BUCKETS: usize = 40;

#[inline]
fn bucket_len(bucket: usize) -> usize {
    1 << (bucket as u32 + FIRST_BUCKET_BITS)
}

#[inline]
fn locate(id: HandleId) -> (usize, usize) {
    let n = id + (1 << FIRST_BUCKET_BITS);
    let top = usize::BITS - 1 - n.leading_zeros();
    let bucket = (top - FIRST_BUCKET_BITS) as usize;
    (bucket, n - (1 << top))
}

pub(crate) struct Registry {
    buckets: [AtomicPtr<Handle>; BUCKETS],
    len: AtomicUsize,
    /// Cleared when the owning queue is dropped.
    open: AtomicBool,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            len: AtomicUsize::new(0),
            open: AtomicBool::new(true),
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn next(&self, id: HandleId) -> HandleId {
        let len = self.len();
        if id + 1 >= len {
            0
        } else {
            id + 1
        }
    }

    /// Resolves an id handed out by this registry.
    #[inline]
    pub(crate) fn get(&self, id: HandleId) -> &Handle {
        if id >= self.len() {
            protocol_violation("handle id outside the registry");
        }
        let (bucket, slot) = locate(id);
        let base = self.buckets[bucket].load(Ordering::Acquire);
        if base.is_null() {
            protocol_violation("handle bucket missing");
        }
        // SAFETY: buckets are never freed before the registry and `slot` is
        // inside the bucket by construction of `locate`.
        unsafe { &*base.add(slot) }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Hands a handle to a new owner: a retired one if available, otherwise
    /// a fresh slot at the end of the ring.
    ///
    /// # Safety
    /// `first` must be the queue's earliest retained segment, read while
    /// holding `guard`.
    pub(crate) unsafe fn claim(
        &self,
        _guard: &ReclaimGuard<'_>,
        first: *mut Segment,
    ) -> Result<HandleId, QueueError> {
        let len = self.len();
        for id in 0..len {
            let h = self.get(id);
            if h
                .state
                .compare_exchange(RETIRED, ACTIVE, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                h.activate(first, self.next(id));
                return Ok(id);
            }
        }

        let id = len;
        let (bucket, slot) = locate(id);
        if bucket >= BUCKETS {
            protocol_violation("handle registry exhausted");
        }
        let mut base = self.buckets[bucket].load(Ordering::Acquire);
        if base.is_null() {
            base = alloc_bucket(bucket_len(bucket))?;
            self.buckets[bucket].store(base, Ordering::Release);
        }
        let h = &*base.add(slot);
        h.state.store(ACTIVE, Ordering::Release);
        self.len.store(id + 1, Ordering::Release);
        // The ring now ends at `id`, so its successor wraps to 0.
        h.activate(first, self.next(id));
        Ok(id)
    }

    /// Returns a handle to the pool. The owner must not be inside an operation.
    pub(crate) fn retire(&self, id: HandleId) {
        let h = self.get(id);
        h.release();
        h.state.store(RETIRED, Ordering::Release);
        tracing::trace!(target: "paralull", handle = id, "retired queue handle");
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (HandleId, &Handle)> + '_ {
        (0..self.len()).map(move |id| (id, self.get(id)))
    }
}

fn bucket_layout(len: usize) -> Result<Layout, QueueError> {
    Layout::array::<Handle>(len).map_err(|_| QueueError::AllocFailed {
        what: "handle bucket",
        layout: Layout::new::<Handle>(),
    })
}

fn alloc_bucket(len: usize) -> Result<*mut Handle, QueueError> {
    let layout = bucket_layout(len)?;
    // SAFETY: layout has non-zero size; every slot is initialised below.
    unsafe {
        let base = alloc::alloc(layout) as *mut Handle;
        if base.is_null() {
            return Err(QueueError::AllocFailed {
                what: "handle bucket",
                layout,
            });
        }
        for i in 0..len {
            ptr::write(base.add(i), Handle::new());
        }
        Ok(base)
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        for (bucket, slot) in self.buckets.iter_mut().enumerate() {
            let base = *slot.get_mut();
            if base.is_null() {
                continue;
            }
            let len = bucket_len(bucket);
            // SAFETY: allocated by `alloc_bucket` with the same length; no
            // other reference to the registry remains.
            unsafe {
                ptr::drop_in_place(ptr::slice_from_raw_parts_mut(base, len));
                if let Ok(layout) = bucket_layout(len) {
                    alloc::dealloc(base as *mut u8, layout);
                }
            }
        }
    }
}
