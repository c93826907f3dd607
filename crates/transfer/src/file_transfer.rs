use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::entry::Entry;
use crate::service::{ProgressCallback, ServiceFuture, TransferRequest, UploadService};
use crate::session::TransferSession;
use crate::validation::{normalize_target_path, normalize_upload_path};
use crate::TransferError;

static NEXT_TRANSFER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a [`FileTransfer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TransferId(u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Lifecycle of a single transfer.
///
/// `New -> Started -> {Complete | Errored}`; `Aborted` is reachable from
/// `New` and `Started`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferState {
    New,
    Started,
    Complete,
    Errored,
    Aborted,
}

impl TransferState {
    /// Validates a transition and returns the new state.
    pub fn transition(self, to: TransferState) -> Result<TransferState, TransferError> {
        use TransferState::*;
        match (self, to) {
            (New, Started)
            | (Started, Complete)
            | (Started, Errored)
            | (New, Aborted)
            | (Started, Aborted) => Ok(to),
            (from, to) => Err(TransferError::InvalidTransition { from, to }),
        }
    }

    /// `true` for `Complete`, `Errored` and `Aborted`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Errored | Self::Aborted)
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Started => "started",
            Self::Complete => "complete",
            Self::Errored => "errored",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// One unit of upload work: a file body or a directory marker.
pub struct FileTransfer {
    id: TransferId,
    entry: Entry,
    target_path: String,
    upload_path: String,
    session: Arc<TransferSession>,
    requires: Vec<Arc<FileTransfer>>,
    inner: Mutex<TransferInner>,
}

struct TransferInner {
    state: TransferState,
    loaded: u64,
    total: u64,
    error: Option<String>,
    cancel: Option<CancellationToken>,
}

impl fmt::Debug for FileTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileTransfer")
            .field("id", &self.id)
            .field("upload_path", &self.upload_path)
            .field("session", &self.session.id())
            .field("state", &self.state())
            .finish()
    }
}

impl FileTransfer {
    /// Creates a new transfer bound to `session`.
    ///
    /// `target_path` is the repository folder (`""` for the root);
    /// `upload_path` is the entry's path inside the uploaded tree and is
    /// validated by [`normalize_upload_path`].
    pub fn new(
        session: Arc<TransferSession>,
        entry: Entry,
        target_path: &str,
        upload_path: &str,
    ) -> Result<Self, TransferError> {
        let upload_path = normalize_upload_path(upload_path)?;
        let total = entry.size_hint();
        Ok(Self {
            id: TransferId(NEXT_TRANSFER_ID.fetch_add(1, Ordering::Relaxed)),
            entry,
            target_path: normalize_target_path(target_path),
            upload_path,
            session,
            requires: Vec::new(),
            inner: Mutex::new(TransferInner {
                state: TransferState::New,
                loaded: 0,
                total,
                error: None,
                cancel: None,
            }),
        })
    }

    /// Adds prerequisites that must complete before this transfer starts.
    pub fn with_requires(mut self, requires: impl IntoIterator<Item = Arc<FileTransfer>>) -> Self {
        self.requires.extend(requires);
        self
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn target_path(&self) -> &str {
        &self.target_path
    }

    pub fn upload_path(&self) -> &str {
        &self.upload_path
    }

    pub fn session(&self) -> &Arc<TransferSession> {
        &self.session
    }

    pub fn requires(&self) -> &[Arc<FileTransfer>] {
        &self.requires
    }

    /// Returns `true` if `id` is one of this transfer's direct prerequisites.
    pub fn depends_on(&self, id: TransferId) -> bool {
        self.requires.iter().any(|r| r.id == id)
    }

    pub fn state(&self) -> TransferState {
        self.lock().state
    }

    pub fn is_complete(&self) -> bool {
        self.state() == TransferState::Complete
    }

    /// Returns `(loaded, total)` byte counters.
    pub fn progress(&self) -> (u64, u64) {
        let inner = self.lock();
        (inner.loaded, inner.total)
    }

    /// The failure message, if the transfer errored.
    pub fn error(&self) -> Option<String> {
        self.lock().error.clone()
    }

    /// `true` when the session has a bucket and every prerequisite completed.
    pub fn is_eligible(&self) -> bool {
        self.session.is_started() && self.requires.iter().all(|r| r.is_complete())
    }

    /// Moves `New -> Started` and returns the request future.
    ///
    /// The future sends the entry body and resolves to
    /// [`TransferError::Cancelled`] if [`abort`](Self::abort) is called
    /// while it is outstanding. Final state changes are applied by the
    /// caller through [`finish`](Self::finish).
    pub fn start(
        self: &Arc<Self>,
        service: Arc<dyn UploadService>,
        progress: ProgressCallback,
    ) -> Result<ServiceFuture<'static, ()>, TransferError> {
        let bucket_id = self
            .session
            .bucket_id()
            .ok_or(TransferError::SessionNotStarted(self.session.id()))?;

        let cancel = CancellationToken::new();
        {
            let mut inner = self.lock();
            inner.state = inner.state.transition(TransferState::Started)?;
            inner.cancel = Some(cancel.clone());
        }

        let transfer = Arc::clone(self);
        Ok(Box::pin(async move {
            let request = TransferRequest {
                bucket_id,
                target_path: transfer.target_path.clone(),
                upload_path: transfer.upload_path.clone(),
                is_directory: transfer.entry.is_directory(),
                body: transfer.entry.body(),
            };
            let send = service.transfer(request, progress);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(TransferError::Cancelled),
                result = send => result,
            }
        }))
    }

    /// Cancels an outstanding request and marks the transfer `Aborted`.
    ///
    /// Returns `true` if an in-flight request was cancelled. Terminal
    /// transfers are left untouched. A queue holding the transfer drops it
    /// on its next pass and reports the abort, cascading to dependents.
    pub fn abort(&self) -> bool {
        let mut inner = self.lock();
        let Ok(next) = inner.state.transition(TransferState::Aborted) else {
            return false;
        };
        inner.state = next;
        match inner.cancel.take() {
            Some(token) => {
                debug!(transfer = %self.id, "cancelling in-flight transfer");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Applies the outcome of the request future: `Started -> Complete`
    /// or `Started -> Errored`.
    pub(crate) fn finish(&self, result: &Result<(), TransferError>) -> Result<(), TransferError> {
        let mut inner = self.lock();
        let to = if result.is_ok() {
            TransferState::Complete
        } else {
            TransferState::Errored
        };
        inner.state = inner.state.transition(to)?;
        inner.cancel = None;
        match result {
            Ok(()) => inner.loaded = inner.total,
            Err(e) => inner.error = Some(e.user_message()),
        }
        Ok(())
    }

    /// Records transport progress. Counters never decrease.
    pub(crate) fn record_progress(&self, loaded: u64, total: u64) -> u64 {
        let mut inner = self.lock();
        if inner.state != TransferState::Started {
            return 0;
        }
        let delta = loaded.saturating_sub(inner.loaded);
        inner.loaded = inner.loaded.max(loaded);
        inner.total = inner.total.max(total);
        delta
    }

    /// Builds a fresh `New` transfer with the same entry, paths, session
    /// and prerequisites, for caller-driven retry.
    pub fn resubmit(&self) -> FileTransfer {
        FileTransfer {
            id: TransferId(NEXT_TRANSFER_ID.fetch_add(1, Ordering::Relaxed)),
            entry: self.entry.clone(),
            target_path: self.target_path.clone(),
            upload_path: self.upload_path.clone(),
            session: Arc::clone(&self.session),
            requires: self.requires.clone(),
            inner: Mutex::new(TransferInner {
                state: TransferState::New,
                loaded: 0,
                total: self.entry.size_hint(),
                error: None,
                cancel: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TransferInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
