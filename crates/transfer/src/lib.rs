//! Upload transfer scheduler.
//!
//! Groups a tree of file and directory transfers into server-side bucket
//! sessions, runs them under a global concurrency cap in dependency order
//! (directories before their contents) and commits each session once its
//! last transfer has drained.
//!
//! # Pieces
//!
//! - [`TransferSession`]: begin/commit protocol for one bucket
//! - [`FileTransfer`]: one file or directory placeholder bound to a session
//! - [`FileTransferQueue`]: admission control, eligibility, cascading abort
//! - [`UploadService`]: the wire seam, implemented over HTTP elsewhere

mod entry;
mod events;
mod file_transfer;
mod progress;
mod queue;
mod service;
mod session;
mod validation;

#[cfg(test)]
pub(crate) mod testing;

pub use entry::Entry;
pub use events::QueueEvent;
pub use file_transfer::{FileTransfer, TransferId, TransferState};
pub use progress::{QueueProgress, SpeedCalculator};
pub use queue::{FileTransferQueue, QueueConfig};
pub use service::{
    EntryVerdict, ProgressCallback, ServiceFuture, TransferBody, TransferRequest, UploadService,
};
pub use session::{SessionId, SessionState, TransferSession};
pub use validation::{normalize_target_path, normalize_upload_path};

/// Default cap on concurrently in-flight transfers, shared by all sessions.
pub const MAX_PENDING_SIZE: usize = 5;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: TransferState,
        to: TransferState,
    },

    #[error("session already started: {0}")]
    SessionAlreadyStarted(SessionId),

    #[error("session not started: {0}")]
    SessionNotStarted(SessionId),

    #[error("session already committed: {0}")]
    SessionAlreadyCommitted(SessionId),

    #[error("transfer already queued: {0}")]
    AlreadyQueued(TransferId),

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("cancelled")]
    Cancelled,
}

impl TransferError {
    /// Human-readable message for UI surfaces.
    ///
    /// Server errors yield the server's own text, everything else its
    /// display form.
    pub fn user_message(&self) -> String {
        match self {
            Self::Server { message, .. } if !message.is_empty() => message.clone(),
            other => other.to_string(),
        }
    }
}
