use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::error::QueueError;
use crate::MpmcQueue;

use super::handle::HandleId;
use super::local;
use super::raw::RawQueue;
use super::segment::Payload;

/// Heap cell for one queued value. The alignment keeps the low two bits of
/// its address free for the slot tags.
#[repr(align(4))]
struct Item<T>(T);

fn into_payload<T>(value: T) -> Payload {
    let item = Box::new(Item(value));
    // SAFETY: `Box::into_raw` never returns null.
    Payload::from_ptr(unsafe { NonNull::new_unchecked(Box::into_raw(item)) })
}

/// # Safety
/// `p` must come from `into_payload::<T>` and be claimed exactly once.
unsafe fn from_payload<T>(p: Payload) -> T {
    Box::from_raw(p.as_ptr::<Item<T>>()).0
}

/// Unbounded wait-free multi-producer multi-consumer FIFO queue.
///
/// Any number of threads may call [`enqueue`](Self::enqueue) and
/// [`dequeue`](Self::dequeue) concurrently. Each thread gets its own handle
/// on first use; the handle is retired when the thread exits. Threads that
/// prefer explicit control can take a [`QueueHandle`] with
/// [`register`](Self::register).
///
/// Values are returned in the order their cells were committed, which for a
/// single producer is the order it enqueued them.
///
/// ```
/// use paralull::WfQueue;
///
/// let q = WfQueue::new();
/// q.enqueue(1);
/// q.enqueue(2);
/// assert_eq!(q.dequeue(), Some(1));
/// assert_eq!(q.dequeue(), Some(2));
/// assert_eq!(q.dequeue(), None);
/// ```
pub struct WfQueue<T: Send> {
    raw: RawQueue,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for WfQueue<T> {}
unsafe impl<T: Send> Sync for WfQueue<T> {}

impl<T: Send> WfQueue<T> {
    /// Creates an empty queue, aborting if the first segment cannot be
    /// allocated.
    pub fn new() -> Self {
        Self::try_new().unwrap_or_else(|e| e.abort())
    }

    /// Creates an empty queue and registers the calling thread's handle.
    pub fn try_new() -> Result<Self, QueueError> {
        let queue = Self {
            raw: RawQueue::new()?,
            _marker: PhantomData,
        };
        local::attach(&queue.raw)?;
        Ok(queue)
    }

    /// Appends `value` at the tail. Never blocks and never fails.
    pub fn enqueue(&self, value: T) {
        let p = into_payload(value);
        local::with_handle(&self.raw, |id| self.raw.enqueue(id, p));
    }

    /// Removes the value at the head, or returns `None` if the queue was
    /// empty when the call linearized.
    pub fn dequeue(&self) -> Option<T> {
        local::with_handle(&self.raw, |id| self.raw.dequeue(id))
            // SAFETY: every payload was produced by `enqueue` and the winning
            // dequeuer is the only one handed it.
            .map(|p| unsafe { from_payload(p) })
    }

    /// Returns `true` if the last observed head index has caught up with the
    /// last observed tail index.
    ///
    /// This is a snapshot, not a linearizable emptiness check: under
    /// concurrent use the answer may be stale by the time it is returned.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Registers an explicit handle for the calling thread.
    pub fn register(&self) -> QueueHandle<'_, T> {
        self.try_register().unwrap_or_else(|e| e.abort())
    }

    pub fn try_register(&self) -> Result<QueueHandle<'_, T>, QueueError> {
        let id = self.raw.register()?;
        Ok(QueueHandle {
            queue: self,
            id,
            _not_sync: PhantomData,
        })
    }

    /// Number of segments currently linked into the queue.
    pub fn retained_segments(&self) -> usize {
        self.raw.retained_segments()
    }
}

impl<T: Send> Default for WfQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> fmt::Debug for WfQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WfQueue")
            .field("is_empty", &self.is_empty())
            .field("retained_segments", &self.retained_segments())
            .finish_non_exhaustive()
    }
}

impl<T: Send> Drop for WfQueue<T> {
    fn drop(&mut self) {
        // SAFETY: unclaimed payloads are owned by the queue.
        self.raw
            .drain_unclaimed(|p| drop(unsafe { from_payload::<T>(p) }));
    }
}

impl<T: Send> MpmcQueue<T> for WfQueue<T> {
    fn push(&self, item: T) {
        self.enqueue(item)
    }

    fn pop(&self) -> Option<T> {
        self.dequeue()
    }

    fn is_empty(&self) -> bool {
        WfQueue::is_empty(self)
    }
}

/// A registered per-thread handle on a [`WfQueue`].
///
/// The handle may move between threads but must not be shared: it carries
/// the caller's request records and hazard. Dropping it returns the slot to
/// the queue's pool.
pub struct QueueHandle<'q, T: Send> {
    queue: &'q WfQueue<T>,
    id: HandleId,
    _not_sync: PhantomData<Cell<()>>,
}

impl<T: Send> QueueHandle<'_, T> {
    /// Appends `value` at the tail through this handle.
    pub fn enqueue(&self, value: T) {
        self.queue.raw.enqueue(self.id, into_payload(value));
    }

    /// Removes the value at the head through this handle, or returns `None`
    /// if the queue was empty.
    pub fn dequeue(&self) -> Option<T> {
        self.queue
            .raw
            .dequeue(self.id)
            // SAFETY: as in `WfQueue::dequeue`.
            .map(|p| unsafe { from_payload(p) })
    }

    /// Same advisory snapshot as [`WfQueue::is_empty`].
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<T: Send> Drop for QueueHandle<'_, T> {
    fn drop(&mut self) {
        self.queue.raw.registry().retire(self.id);
    }
}

impl<T: Send> fmt::Debug for QueueHandle<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueHandle").field("id", &self.id).finish()
    }
}
