use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::{info, warn};

use crate::service::{ServiceFuture, UploadService};
use crate::TransferError;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a [`TransferSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Lifecycle of a bucket session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing sent yet.
    Idle,
    /// Begin request in flight.
    Starting,
    /// Bucket allocated; transfers may run.
    Started { bucket_id: String },
    /// Begin request failed. Never retried.
    BeginFailed { message: String },
    /// Commit request in flight.
    Committing { bucket_id: String },
    Committed {
        bucket_id: String,
        location: Option<String>,
    },
    CommitFailed { bucket_id: String, message: String },
}

/// One server-side upload bucket and its begin/commit protocol.
///
/// Shared by reference among the [`FileTransfer`](crate::FileTransfer)s
/// bound to it.
pub struct TransferSession {
    id: SessionId,
    upload_handler: String,
    params: BTreeMap<String, String>,
    state: Mutex<SessionState>,
}

impl fmt::Debug for TransferSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferSession")
            .field("id", &self.id)
            .field("upload_handler", &self.upload_handler)
            .field("state", &self.state())
            .finish()
    }
}

impl TransferSession {
    /// Creates an idle session for the given server-side handler.
    pub fn new(upload_handler: impl Into<String>, params: BTreeMap<String, String>) -> Self {
        Self {
            id: SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)),
            upload_handler: upload_handler.into(),
            params,
            state: Mutex::new(SessionState::Idle),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn upload_handler(&self) -> &str {
        &self.upload_handler
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// Returns a snapshot of the current state.
    pub fn state(&self) -> SessionState {
        self.lock().clone()
    }

    /// Bucket ID, once the begin request succeeded.
    pub fn bucket_id(&self) -> Option<String> {
        match &*self.lock() {
            SessionState::Started { bucket_id }
            | SessionState::Committing { bucket_id }
            | SessionState::Committed { bucket_id, .. }
            | SessionState::CommitFailed { bucket_id, .. } => Some(bucket_id.clone()),
            _ => None,
        }
    }

    /// `true` once a bucket has been allocated.
    pub fn is_started(&self) -> bool {
        self.bucket_id().is_some()
    }

    /// `true` while the begin request is in flight.
    pub fn is_start_pending(&self) -> bool {
        matches!(*self.lock(), SessionState::Starting)
    }

    /// `true` once the commit succeeded.
    pub fn is_complete(&self) -> bool {
        matches!(*self.lock(), SessionState::Committed { .. })
    }

    /// Moves `Idle -> Starting` and returns the begin request future.
    ///
    /// The transition happens before this returns, so a second call fails
    /// with [`TransferError::SessionAlreadyStarted`] and only one begin
    /// request is ever issued.
    pub fn start(
        self: &Arc<Self>,
        service: Arc<dyn UploadService>,
    ) -> Result<ServiceFuture<'static, String>, TransferError> {
        {
            let mut state = self.lock();
            if *state != SessionState::Idle {
                return Err(TransferError::SessionAlreadyStarted(self.id));
            }
            *state = SessionState::Starting;
        }

        let session = Arc::clone(self);
        Ok(Box::pin(async move {
            info!(session = %session.id, handler = %session.upload_handler, "beginning upload session");
            let result = service
                .begin_session(&session.upload_handler, &session.params)
                .await;

            let next = match &result {
                Ok(bucket_id) => {
                    info!(session = %session.id, bucket = %bucket_id, "upload session started");
                    SessionState::Started {
                        bucket_id: bucket_id.clone(),
                    }
                }
                Err(e) => {
                    warn!(session = %session.id, error = %e, "begin request failed");
                    SessionState::BeginFailed {
                        message: e.user_message(),
                    }
                }
            };
            *session.lock() = next;
            result
        }))
    }

    /// Moves `Started -> Committing` and returns the commit request future.
    ///
    /// The future resolves to the `Location` of the committed result.
    pub fn commit(
        self: &Arc<Self>,
        service: Arc<dyn UploadService>,
    ) -> Result<ServiceFuture<'static, Option<String>>, TransferError> {
        let bucket_id = {
            let mut state = self.lock();
            match &*state {
                SessionState::Started { bucket_id } => {
                    let bucket_id = bucket_id.clone();
                    *state = SessionState::Committing {
                        bucket_id: bucket_id.clone(),
                    };
                    bucket_id
                }
                SessionState::Committing { .. }
                | SessionState::Committed { .. }
                | SessionState::CommitFailed { .. } => {
                    return Err(TransferError::SessionAlreadyCommitted(self.id));
                }
                _ => return Err(TransferError::SessionNotStarted(self.id)),
            }
        };

        let session = Arc::clone(self);
        Ok(Box::pin(async move {
            info!(session = %session.id, bucket = %bucket_id, "committing upload session");
            let result = service.commit_session(&bucket_id).await;

            let next = match &result {
                Ok(location) => SessionState::Committed {
                    bucket_id,
                    location: location.clone(),
                },
                Err(e) => {
                    warn!(session = %session.id, error = %e, "commit request failed");
                    SessionState::CommitFailed {
                        bucket_id,
                        message: e.user_message(),
                    }
                }
            };
            *session.lock() = next;
            result
        }))
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockService;

    fn session() -> Arc<TransferSession> {
        let mut params = BTreeMap::new();
        params.insert("collection".into(), "42".into());
        Arc::new(TransferSession::new("tree", params))
    }

    #[test]
    fn new_session_is_idle() {
        let s = session();
        assert_eq!(s.state(), SessionState::Idle);
        assert!(!s.is_started());
        assert!(!s.is_start_pending());
        assert!(!s.is_complete());
        assert!(s.bucket_id().is_none());
    }

    #[test]
    fn session_ids_are_unique() {
        let a = session();
        let b = session();
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn start_stores_bucket_id() {
        let mock = MockService::new();
        let s = session();

        let fut = s.start(mock.clone()).unwrap();
        assert!(s.is_start_pending());

        let bucket = fut.await.unwrap();
        assert_eq!(bucket, "bucket-1");
        assert_eq!(s.bucket_id().as_deref(), Some("bucket-1"));
        assert!(s.is_started());
        assert!(!s.is_start_pending());
        assert_eq!(mock.begin_calls(), vec![("tree".to_string(), "collection=42".to_string())]);
    }

    #[tokio::test]
    async fn concurrent_start_issues_one_begin() {
        let mock = MockService::new();
        let s = session();

        let first = s.start(mock.clone()).unwrap();
        let second = s.start(mock.clone());
        assert!(matches!(
            second,
            Err(TransferError::SessionAlreadyStarted(id)) if id == s.id()
        ));

        first.await.unwrap();
        assert!(s.start(mock.clone()).is_err());
        assert_eq!(mock.begin_count(), 1);
    }

    #[tokio::test]
    async fn failed_begin_is_terminal() {
        let mock = MockService::new();
        mock.fail_begin(500, "handler unavailable");
        let s = session();

        let err = s.start(mock.clone()).unwrap().await.unwrap_err();
        assert_eq!(err.user_message(), "handler unavailable");
        assert_eq!(
            s.state(),
            SessionState::BeginFailed {
                message: "handler unavailable".into()
            }
        );
        assert!(!s.is_started());
        assert!(!s.is_start_pending());
        // No retry.
        assert!(s.start(mock.clone()).is_err());
        assert_eq!(mock.begin_count(), 1);
    }

    #[tokio::test]
    async fn commit_before_start_is_refused() {
        let mock = MockService::new();
        let s = session();
        assert!(matches!(
            s.commit(mock.clone()),
            Err(TransferError::SessionNotStarted(_))
        ));
        assert_eq!(mock.commit_count(), 0);
    }

    #[tokio::test]
    async fn commit_marks_complete_once() {
        let mock = MockService::new();
        mock.set_commit_location("/items/17");
        let s = session();
        s.start(mock.clone()).unwrap().await.unwrap();

        let location = s.commit(mock.clone()).unwrap().await.unwrap();
        assert_eq!(location.as_deref(), Some("/items/17"));
        assert!(s.is_complete());
        assert!(s.is_started());

        assert!(matches!(
            s.commit(mock.clone()),
            Err(TransferError::SessionAlreadyCommitted(_))
        ));
        assert_eq!(mock.commit_count(), 1);
    }

    #[tokio::test]
    async fn failed_commit_keeps_message() {
        let mock = MockService::new();
        mock.fail_commit(409, "bucket already ingested");
        let s = session();
        s.start(mock.clone()).unwrap().await.unwrap();

        assert!(s.commit(mock.clone()).unwrap().await.is_err());
        assert!(!s.is_complete());
        assert!(matches!(
            s.state(),
            SessionState::CommitFailed { ref message, .. } if message == "bucket already ingested"
        ));
    }
}
