//! Upload target error types.

use bucketload_transfer::TransferError;

/// Errors produced while preparing a dropped tree for upload.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("{path} rejected: {reason}")]
    Rejected { path: String, reason: String },

    #[error("nothing to upload")]
    Empty,
}
