//! The seam between the scheduler and the upload server.
//!
//! [`UploadService`] is implemented over HTTP by the upload client crate.
//! Using a trait keeps the scheduling logic decoupled from transport and
//! testable with mocks.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;

use crate::TransferError;

/// Boxed future returned by service calls.
pub type ServiceFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransferError>> + Send + 'a>>;

/// Receives `(loaded, total)` byte counts while a body is being sent.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// One per-entry transfer request.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Bucket allocated by the begin call.
    pub bucket_id: String,
    /// Repository folder, `""` or `/a/b`.
    pub target_path: String,
    /// Entry path inside the dropped tree, `/x/y`.
    pub upload_path: String,
    pub is_directory: bool,
    pub body: TransferBody,
}

/// Content of a [`TransferRequest`].
///
/// File bodies are opened by the transport when the request is sent and
/// streamed from disk; they are never buffered whole.
#[derive(Debug, Clone)]
pub enum TransferBody {
    /// Directory marker.
    Empty,
    Bytes(Bytes),
    /// A file on disk of `size` bytes as seen when the tree was walked.
    File { path: PathBuf, size: u64 },
}

impl TransferBody {
    /// Expected body length in bytes.
    pub fn len(&self) -> u64 {
        match self {
            Self::Empty => 0,
            Self::Bytes(data) => data.len() as u64,
            Self::File { size, .. } => *size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of a pre-flight entry check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryVerdict {
    Accepted,
    /// The server refused the entry; carries its reason.
    Rejected(String),
}

/// Upload server operations used by sessions, transfers and pre-flight.
pub trait UploadService: Send + Sync {
    /// Opens a bucket and returns its ID.
    fn begin_session<'a>(
        &'a self,
        upload_handler: &'a str,
        params: &'a BTreeMap<String, String>,
    ) -> ServiceFuture<'a, String>;

    /// Asks whether an entry with this path and size would be accepted.
    fn validate_entry<'a>(
        &'a self,
        upload_handler: &'a str,
        path: &'a str,
        size: u64,
    ) -> ServiceFuture<'a, EntryVerdict>;

    /// Sends one file body or directory marker into a bucket.
    fn transfer(&self, request: TransferRequest, progress: ProgressCallback)
    -> ServiceFuture<'_, ()>;

    /// Finalizes a bucket. Returns the `Location` of the result, if any.
    fn commit_session<'a>(&'a self, bucket_id: &'a str) -> ServiceFuture<'a, Option<String>>;
}
