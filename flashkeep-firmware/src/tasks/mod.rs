//! Embassy async tasks
//!
//! Tasks talk to each other through the channels in [`crate::channels`].

pub mod status;
pub mod storage;

pub use status::status_task;
pub use storage::{storage_task, Coordinator, Slots};
