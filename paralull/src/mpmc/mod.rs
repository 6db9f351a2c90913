mod handle;
mod local;
mod raw;
mod reclaim;
mod registry;
mod request;
mod segment;
pub mod wf_queue;

pub use wf_queue::{QueueHandle, WfQueue};
