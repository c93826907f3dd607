//! In-memory [`UploadService`] for scheduler tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::service::{EntryVerdict, ProgressCallback, ServiceFuture, TransferRequest, UploadService};
use crate::TransferError;

#[derive(Default)]
pub(crate) struct MockService {
    begins: Mutex<Vec<(String, String)>>,
    begin_error: Mutex<Option<(u16, String)>>,
    commits: AtomicUsize,
    commit_location: Mutex<Option<String>>,
    commit_error: Mutex<Option<(u16, String)>>,
    transfers: Mutex<Vec<TransferRequest>>,
    transfer_errors: Mutex<HashMap<String, String>>,
    gated: AtomicBool,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    report_progress: AtomicBool,
}

impl MockService {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn fail_begin(&self, status: u16, message: &str) {
        *self.begin_error.lock().unwrap() = Some((status, message.into()));
    }

    pub(crate) fn fail_commit(&self, status: u16, message: &str) {
        *self.commit_error.lock().unwrap() = Some((status, message.into()));
    }

    pub(crate) fn set_commit_location(&self, location: &str) {
        *self.commit_location.lock().unwrap() = Some(location.into());
    }

    /// Fails the transfer whose upload path is `path`.
    pub(crate) fn fail_transfer(&self, path: &str, message: &str) {
        self.transfer_errors
            .lock()
            .unwrap()
            .insert(path.into(), message.into());
    }

    /// Holds every transfer until [`release`](Self::release) is called for its path.
    pub(crate) fn gate_transfers(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    pub(crate) fn release(&self, path: &str) {
        self.gate(path).notify_one();
    }

    /// Reports half and full progress before each transfer resolves.
    pub(crate) fn report_progress(&self) {
        self.report_progress.store(true, Ordering::SeqCst);
    }

    pub(crate) fn begin_count(&self) -> usize {
        self.begins.lock().unwrap().len()
    }

    pub(crate) fn begin_calls(&self) -> Vec<(String, String)> {
        self.begins.lock().unwrap().clone()
    }

    pub(crate) fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub(crate) fn transfer_requests(&self) -> Vec<TransferRequest> {
        self.transfers.lock().unwrap().clone()
    }

    /// Upload paths in the order their requests were issued.
    pub(crate) fn transfer_paths(&self) -> Vec<String> {
        self.transfer_requests()
            .into_iter()
            .map(|r| r.upload_path)
            .collect()
    }

    fn gate(&self, path: &str) -> Arc<Notify> {
        Arc::clone(self.gates.lock().unwrap().entry(path.into()).or_default())
    }
}

impl UploadService for MockService {
    fn begin_session<'a>(
        &'a self,
        upload_handler: &'a str,
        params: &'a BTreeMap<String, String>,
    ) -> ServiceFuture<'a, String> {
        Box::pin(async move {
            let query = params
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("&");
            let n = {
                let mut begins = self.begins.lock().unwrap();
                begins.push((upload_handler.to_string(), query));
                begins.len()
            };
            if let Some((status, message)) = self.begin_error.lock().unwrap().clone() {
                return Err(TransferError::Server { status, message });
            }
            Ok(format!("bucket-{n}"))
        })
    }

    fn validate_entry<'a>(
        &'a self,
        _upload_handler: &'a str,
        _path: &'a str,
        _size: u64,
    ) -> ServiceFuture<'a, EntryVerdict> {
        Box::pin(async { Ok(EntryVerdict::Accepted) })
    }

    fn transfer(
        &self,
        request: TransferRequest,
        progress: ProgressCallback,
    ) -> ServiceFuture<'_, ()> {
        Box::pin(async move {
            let path = request.upload_path.clone();
            let len = request.body.len();
            self.transfers.lock().unwrap().push(request);

            if self.gated.load(Ordering::SeqCst) {
                self.gate(&path).notified().await;
            }
            if self.report_progress.load(Ordering::SeqCst) {
                progress(len / 2, len);
                progress(len, len);
            }

            let error = self.transfer_errors.lock().unwrap().get(&path).cloned();
            match error {
                Some(message) => Err(TransferError::Server {
                    status: 500,
                    message,
                }),
                None => Ok(()),
            }
        })
    }

    fn commit_session<'a>(&'a self, _bucket_id: &'a str) -> ServiceFuture<'a, Option<String>> {
        Box::pin(async move {
            self.commits.fetch_add(1, Ordering::SeqCst);
            if let Some((status, message)) = self.commit_error.lock().unwrap().clone() {
                return Err(TransferError::Server { status, message });
            }
            Ok(self.commit_location.lock().unwrap().clone())
        })
    }
}
