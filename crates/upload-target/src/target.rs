//! Upload target: validate a whole tree, then enqueue the whole tree.

use std::collections::BTreeMap;
use std::sync::Arc;

use bucketload_transfer::{
    EntryVerdict, FileTransfer, FileTransferQueue, TransferId, TransferSession, UploadService,
    normalize_target_path,
};
use futures_util::TryStreamExt;
use tracing::{debug, info, warn};

use crate::error::UploadError;
use crate::walk::{DropItem, TreeEntry, walk};

/// Result of a successful enqueue.
#[derive(Debug)]
pub struct Enqueued {
    /// Session every transfer of the tree is bound to.
    pub session: Arc<TransferSession>,
    /// Created transfers in walk order.
    pub transfers: Vec<TransferId>,
}

/// A repository folder that dropped items are uploaded into.
pub struct UploadTarget {
    service: Arc<dyn UploadService>,
    upload_handler: String,
    params: BTreeMap<String, String>,
    target_path: String,
}

impl UploadTarget {
    /// Creates a target for `target_path` (`""` or `/` for the root).
    pub fn new(
        service: Arc<dyn UploadService>,
        upload_handler: impl Into<String>,
        target_path: &str,
    ) -> Self {
        Self {
            service,
            upload_handler: upload_handler.into(),
            params: BTreeMap::new(),
            target_path: normalize_target_path(target_path),
        }
    }

    /// Sets the parameters sent with the session's begin request.
    pub fn with_params(mut self, params: BTreeMap<String, String>) -> Self {
        self.params = params;
        self
    }

    pub fn target_path(&self) -> &str {
        &self.target_path
    }

    pub fn upload_handler(&self) -> &str {
        &self.upload_handler
    }

    /// Walks, validates and enqueues `items`.
    ///
    /// Nothing reaches `queue` unless every entry passed validation.
    pub async fn upload(
        &self,
        queue: &mut FileTransferQueue,
        items: Vec<DropItem>,
    ) -> Result<Enqueued, UploadError> {
        let entries = self.prepare(items).await?;
        self.enqueue(queue, entries)
    }

    /// Walks `items` and validates every entry against the server.
    pub async fn prepare(&self, items: Vec<DropItem>) -> Result<Vec<TreeEntry>, UploadError> {
        let entries: Vec<TreeEntry> = walk(items).try_collect().await?;
        if entries.is_empty() {
            return Err(UploadError::Empty);
        }
        self.validate(&entries).await?;
        Ok(entries)
    }

    /// Pre-flights each entry in order; stops at the first rejection.
    pub async fn validate(&self, entries: &[TreeEntry]) -> Result<(), UploadError> {
        for e in entries {
            let path = self.destination(&e.upload_path);
            let verdict = self
                .service
                .validate_entry(&self.upload_handler, &path, e.entry.size_hint())
                .await?;

            if let EntryVerdict::Rejected(reason) = verdict {
                warn!(path = %path, reason = %reason, "entry rejected");
                return Err(UploadError::Rejected { path, reason });
            }
            debug!(path = %path, "entry accepted");
        }
        info!(entries = entries.len(), target = %self.target_path, "tree validated");
        Ok(())
    }

    /// Binds validated entries to a new session and pushes them into
    /// `queue`, directories before their contents.
    pub fn enqueue(
        &self,
        queue: &mut FileTransferQueue,
        entries: Vec<TreeEntry>,
    ) -> Result<Enqueued, UploadError> {
        if entries.is_empty() {
            return Err(UploadError::Empty);
        }
        let session = Arc::new(TransferSession::new(
            self.upload_handler.clone(),
            self.params.clone(),
        ));

        let mut transfers: Vec<Arc<FileTransfer>> = Vec::with_capacity(entries.len());
        for e in entries {
            let requires = e
                .parent
                .and_then(|p| transfers.get(p))
                .map(Arc::clone);
            let transfer = FileTransfer::new(
                Arc::clone(&session),
                e.entry,
                &self.target_path,
                &e.upload_path,
            )?
            .with_requires(requires);
            transfers.push(Arc::new(transfer));
        }

        let mut ids = Vec::with_capacity(transfers.len());
        for transfer in &transfers {
            match queue.add(Arc::clone(transfer)) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    for id in ids {
                        queue.abort(id);
                    }
                    return Err(e.into());
                }
            }
        }

        info!(session = %session.id(), transfers = ids.len(), "tree enqueued");
        Ok(Enqueued {
            session,
            transfers: ids,
        })
    }

    fn destination(&self, upload_path: &str) -> String {
        format!("{}{}", self.target_path, upload_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketload_transfer::{
        ProgressCallback, QueueConfig, QueueEvent, ServiceFuture, TransferError, TransferRequest,
    };
    use bytes::Bytes;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct MockService {
        validated: Mutex<Vec<(String, u64)>>,
        reject: Mutex<Option<(String, String)>>,
        transfers: Mutex<Vec<TransferRequest>>,
        commits: Mutex<Vec<String>>,
    }

    impl MockService {
        fn reject(&self, path: &str, reason: &str) {
            *self.reject.lock().unwrap() = Some((path.into(), reason.into()));
        }
    }

    impl UploadService for MockService {
        fn begin_session<'a>(
            &'a self,
            _upload_handler: &'a str,
            _params: &'a BTreeMap<String, String>,
        ) -> ServiceFuture<'a, String> {
            Box::pin(async { Ok("b-1".to_string()) })
        }

        fn validate_entry<'a>(
            &'a self,
            _upload_handler: &'a str,
            path: &'a str,
            size: u64,
        ) -> ServiceFuture<'a, EntryVerdict> {
            Box::pin(async move {
                self.validated.lock().unwrap().push((path.to_string(), size));
                match self.reject.lock().unwrap().as_ref() {
                    Some((p, reason)) if p == path => Ok(EntryVerdict::Rejected(reason.clone())),
                    _ => Ok(EntryVerdict::Accepted),
                }
            })
        }

        fn transfer(
            &self,
            request: TransferRequest,
            _progress: ProgressCallback,
        ) -> ServiceFuture<'_, ()> {
            Box::pin(async move {
                self.transfers.lock().unwrap().push(request);
                Ok(())
            })
        }

        fn commit_session<'a>(&'a self, bucket_id: &'a str) -> ServiceFuture<'a, Option<String>> {
            Box::pin(async move {
                self.commits.lock().unwrap().push(bucket_id.to_string());
                Ok(None)
            })
        }
    }

    fn create_test_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("letters");
        fs::create_dir_all(root.join("1901")).unwrap();
        fs::write(root.join("1901").join("jan.pdf"), b"PDF-JAN").unwrap();
        fs::write(root.join("readme.txt"), b"README").unwrap();
        dir
    }

    fn setup() -> (Arc<MockService>, FileTransferQueue, UploadTarget) {
        let mock = Arc::new(MockService::default());
        let service: Arc<dyn UploadService> = mock.clone();
        let queue = FileTransferQueue::new(Arc::clone(&service), QueueConfig::default());
        let target = UploadTarget::new(service, "tree", "/collection/c1/");
        (mock, queue, target)
    }

    #[tokio::test]
    async fn validates_full_destination_paths_in_walk_order() {
        let dir = create_test_tree();
        let (mock, mut queue, target) = setup();

        target
            .upload(&mut queue, vec![DropItem::Path(dir.path().join("letters"))])
            .await
            .unwrap();

        let validated = mock.validated.lock().unwrap().clone();
        assert_eq!(
            validated,
            vec![
                ("/collection/c1/letters".to_string(), 0),
                ("/collection/c1/letters/1901".to_string(), 0),
                ("/collection/c1/letters/1901/jan.pdf".to_string(), 7),
                ("/collection/c1/letters/readme.txt".to_string(), 6),
            ]
        );
    }

    #[tokio::test]
    async fn rejection_enqueues_nothing() {
        let dir = create_test_tree();
        let (mock, mut queue, target) = setup();
        let mut events = queue.take_events().unwrap();
        mock.reject("/collection/c1/letters/1901/jan.pdf", "PDF not allowed");

        let err = target
            .upload(&mut queue, vec![DropItem::Path(dir.path().join("letters"))])
            .await
            .unwrap_err();

        match err {
            UploadError::Rejected { path, reason } => {
                assert_eq!(path, "/collection/c1/letters/1901/jan.pdf");
                assert_eq!(reason, "PDF not allowed");
            }
            other => panic!("unexpected error: {other}"),
        }
        // Validation stopped at the rejected entry.
        assert_eq!(mock.validated.lock().unwrap().len(), 3);
        assert_eq!(queue.new_len() + queue.pending_len(), 0);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn children_require_their_directory() {
        let dir = create_test_tree();
        let (_mock, mut queue, target) = setup();

        let enqueued = target
            .upload(&mut queue, vec![DropItem::Path(dir.path().join("letters"))])
            .await
            .unwrap();
        assert_eq!(enqueued.transfers.len(), 4);

        let t: Vec<&Arc<FileTransfer>> = enqueued
            .transfers
            .iter()
            .map(|id| queue.get(*id).unwrap())
            .collect();
        assert!(t[0].requires().is_empty());
        assert_eq!(t[1].requires()[0].id(), t[0].id());
        assert_eq!(t[2].requires()[0].id(), t[1].id());
        assert_eq!(t[3].requires()[0].id(), t[0].id());
        assert!(t.iter().all(|x| Arc::ptr_eq(x.session(), &enqueued.session)));
        assert!(t.iter().all(|x| x.target_path() == "/collection/c1"));
    }

    #[tokio::test]
    async fn enqueued_tree_uploads_and_commits_once() {
        let dir = create_test_tree();
        let (mock, mut queue, target) = setup();
        let mut events = queue.take_events().unwrap();

        let enqueued = target
            .upload(
                &mut queue,
                vec![
                    DropItem::Path(dir.path().join("letters")),
                    DropItem::Bytes {
                        name: "cover.png".into(),
                        data: Bytes::from_static(b"PNG"),
                    },
                ],
            )
            .await
            .unwrap();
        queue.run().await;

        assert!(queue.is_idle());
        assert!(enqueued.session.is_complete());
        assert_eq!(mock.commits.lock().unwrap().as_slice(), ["b-1"]);

        let sent: Vec<String> = mock
            .transfers
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.upload_path.clone())
            .collect();
        let pos = |p: &str| sent.iter().position(|s| s == p).unwrap();
        assert_eq!(sent.len(), 5);
        assert!(pos("/letters") < pos("/letters/1901"));
        assert!(pos("/letters/1901") < pos("/letters/1901/jan.pdf"));

        let mut commits = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, QueueEvent::CommitComplete { .. }) {
                commits += 1;
            }
        }
        assert_eq!(commits, 1);
    }

    #[tokio::test]
    async fn empty_drop_is_an_error() {
        let (_mock, mut queue, target) = setup();
        assert!(matches!(
            target.upload(&mut queue, Vec::new()).await,
            Err(UploadError::Empty)
        ));
    }

    #[tokio::test]
    async fn invalid_name_fails_before_validation() {
        let (mock, mut queue, target) = setup();
        let err = target
            .upload(
                &mut queue,
                vec![DropItem::Bytes {
                    name: String::new(),
                    data: Bytes::new(),
                }],
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            UploadError::Transfer(TransferError::InvalidPath(_))
        ));
        assert!(mock.validated.lock().unwrap().is_empty());
        assert_eq!(queue.new_len(), 0);
    }

    #[test]
    fn root_target_path() {
        let service: Arc<dyn UploadService> = Arc::new(MockService::default());
        let target = UploadTarget::new(service, "tree", "/");
        assert_eq!(target.target_path(), "");
        assert_eq!(target.destination("/a.txt"), "/a.txt");
    }
}
