//! Lazily registered per-thread handles.
//!
//! Each thread keeps one handle per queue it has touched. The entry holds
//! the queue's registry alive so the handle can be retired from the thread
//! destructor even after the queue itself is gone.

use std::cell::RefCell;
use std::sync::Arc;

use crate::error::QueueError;

use super::handle::HandleId;
use super::raw::RawQueue;
use super::registry::Registry;

struct LocalHandle {
    registry: Arc<Registry>,
    id: HandleId,
}

impl Drop for LocalHandle {
    fn drop(&mut self) {
        self.registry.retire(self.id);
    }
}

thread_local! {
    static HANDLES: RefCell<Vec<LocalHandle>> = const { RefCell::new(Vec::new()) };
}

fn cached_or_register(
    raw: &RawQueue,
    handles: &mut Vec<LocalHandle>,
) -> Result<HandleId, QueueError> {
    if let Some(local) = handles
        .iter()
        .find(|l| Arc::ptr_eq(&l.registry, raw.registry()))
    {
        return Ok(local.id);
    }
    // Entries of dropped queues are dead weight; retire them now.
    handles.retain(|l| l.registry.is_open());
    let id = raw.register()?;
    handles.push(LocalHandle {
        registry: Arc::clone(raw.registry()),
        id,
    });
    Ok(id)
}

/// Registers the calling thread's handle for `raw` ahead of its first use.
pub(crate) fn attach(raw: &RawQueue) -> Result<(), QueueError> {
    match HANDLES.try_with(|handles| cached_or_register(raw, &mut handles.borrow_mut())) {
        Ok(res) => res.map(|_| ()),
        // No thread-local storage left; handles will be one-shot.
        Err(_) => Ok(()),
    }
}

/// Runs `f` with this thread's handle for `raw`, registering one first if
/// needed.
pub(crate) fn with_handle<R>(raw: &RawQueue, f: impl FnOnce(HandleId) -> R) -> R {
    let cached = HANDLES
        .try_with(|handles| cached_or_register(raw, &mut handles.borrow_mut()))
        .ok();
    match cached {
        Some(Ok(id)) => f(id),
        Some(Err(e)) => e.abort(),
        None => {
            // Thread-local storage is being torn down: use a one-shot handle.
            let id = raw.register().unwrap_or_else(|e| e.abort());
            let out = f(id);
            raw.registry().retire(id);
            out
        }
    }
}
