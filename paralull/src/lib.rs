//! Wait-free multi-producer multi-consumer FIFO queue.
//!
//! The queue stores values in a linked list of fixed-size segments. Each
//! operation first tries a single-CAS fast path; after a bounded number of
//! failures it publishes a request that any other thread can complete, which
//! bounds the number of steps every operation takes. Segments that every
//! thread has moved past are reclaimed under hazard protection.

pub mod error;
pub mod mpmc;

pub use error::QueueError;
pub use mpmc::{QueueHandle, WfQueue};

// Common interface for MPMC queues.
pub trait MpmcQueue<T: Send>: Send + Sync {
    fn push(&self, item: T);
    fn pop(&self) -> Option<T>;
    fn is_empty(&self) -> bool;
}
