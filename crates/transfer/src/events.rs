//! Notifications emitted by the [`FileTransferQueue`](crate::FileTransferQueue).

use serde::Serialize;

use crate::file_transfer::TransferId;
use crate::session::SessionId;

/// Event emitted by the queue for GUI or CLI observers.
///
/// Serializes with an `event` tag (`"added"`, `"beginSessionStarted"`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum QueueEvent {
    /// A transfer entered the queue.
    Added { transfer: TransferId },
    /// A transfer was dispatched.
    Started { transfer: TransferId },
    Complete { transfer: TransferId },
    Error { transfer: TransferId, message: String },
    /// A caller resubmitted a finished transfer as `replacement`.
    Restart {
        transfer: TransferId,
        replacement: TransferId,
    },
    Progress {
        transfer: TransferId,
        loaded: u64,
        total: u64,
    },
    /// A transfer was removed by an abort (once per transfer in a cascade).
    Abort { transfer: TransferId },
    BeginSessionStarted { session: SessionId },
    BeginSessionFinished { session: SessionId, bucket_id: String },
    BeginSessionError { session: SessionId, message: String },
    CommitStart { session: SessionId },
    CommitComplete {
        session: SessionId,
        location: Option<String>,
    },
    CommitError { session: SessionId, message: String },
}
