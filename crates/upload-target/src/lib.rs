//! Upload target: turns dropped files and folders into queued transfers.
//!
//! # Pipeline
//!
//! 1. **Walk**: flatten the dropped items into a pre-order entry list
//! 2. **Validate**: ask the server about every entry, one at a time
//! 3. **Enqueue**: only if all passed, bind the tree to one session and
//!    push it into the [`FileTransferQueue`](bucketload_transfer::FileTransferQueue)

pub mod error;
pub mod target;
pub mod walk;

pub use error::UploadError;
pub use target::{Enqueued, UploadTarget};
pub use walk::{DropItem, TreeEntry, walk};
