//! Transfer scheduler.
//!
//! Holds every not-yet-dispatched (`new`) and in-flight (`pending`)
//! transfer, admits work under a global concurrency cap in dependency
//! order, lazily begins sessions, commits a session once none of its
//! transfers remain, and cascades aborts to dependents.
//!
//! Network operations run as spawned tasks that report back over an
//! internal channel; all state changes happen on the task that owns the
//! queue, inside [`FileTransferQueue::tick`].

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::MAX_PENDING_SIZE;
use crate::TransferError;
use crate::events::QueueEvent;
use crate::file_transfer::{FileTransfer, TransferId, TransferState};
use crate::progress::{QueueProgress, SpeedCalculator};
use crate::service::{ProgressCallback, UploadService};
use crate::session::{SessionId, SessionState, TransferSession};

/// Scheduler configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum transfers in flight at once, across all sessions.
    pub max_pending: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_pending: MAX_PENDING_SIZE,
        }
    }
}

/// Completion report from a spawned network task.
enum Signal {
    SessionBegun {
        session: Arc<TransferSession>,
        result: Result<String, TransferError>,
    },
    SessionCommitted {
        session: Arc<TransferSession>,
        result: Result<Option<String>, TransferError>,
    },
    TransferFinished {
        id: TransferId,
        result: Result<(), TransferError>,
    },
    TransferProgress {
        id: TransferId,
        loaded: u64,
        total: u64,
    },
}

/// Dependency-aware upload scheduler with bounded concurrency.
///
/// Must be used from within a Tokio runtime: admission spawns tasks.
pub struct FileTransferQueue {
    config: QueueConfig,
    service: Arc<dyn UploadService>,
    new: Vec<Arc<FileTransfer>>,
    pending: Vec<Arc<FileTransfer>>,
    /// Spawned tasks whose final signal has not been handled yet.
    outstanding: usize,
    signals_tx: mpsc::UnboundedSender<Signal>,
    signals_rx: mpsc::UnboundedReceiver<Signal>,
    events_tx: mpsc::UnboundedSender<QueueEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<QueueEvent>>,
    speed: SpeedCalculator,
}

impl FileTransferQueue {
    pub fn new(service: Arc<dyn UploadService>, config: QueueConfig) -> Self {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            service,
            new: Vec::new(),
            pending: Vec::new(),
            outstanding: 0,
            signals_tx,
            signals_rx,
            events_tx,
            events_rx: Some(events_rx),
            speed: SpeedCalculator::default(),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<QueueEvent>> {
        self.events_rx.take()
    }

    pub fn config(&self) -> QueueConfig {
        self.config
    }

    /// Number of transfers waiting for admission.
    pub fn new_len(&self) -> usize {
        self.new.len()
    }

    /// Number of transfers in flight.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// `true` if the transfer is still queued or in flight.
    pub fn contains(&self, id: TransferId) -> bool {
        self.get(id).is_some()
    }

    /// Looks up a live transfer.
    pub fn get(&self, id: TransferId) -> Option<&Arc<FileTransfer>> {
        self.new.iter().chain(self.pending.iter()).find(|t| t.id() == id)
    }

    /// `true` while any queued or in-flight transfer belongs to `session`.
    pub fn is_session_active(&self, session: SessionId) -> bool {
        self.new
            .iter()
            .chain(self.pending.iter())
            .any(|t| t.session().id() == session)
    }

    /// `true` when nothing is queued, in flight, or awaiting a server reply.
    pub fn is_idle(&self) -> bool {
        self.new.is_empty() && self.pending.is_empty() && self.outstanding == 0
    }

    /// Aggregate progress of the live transfers.
    pub fn progress(&self) -> QueueProgress {
        let mut progress = QueueProgress {
            in_flight: self.pending.len(),
            queued: self.new.len(),
            bytes_per_second: self.speed.bytes_per_second(),
            ..Default::default()
        };
        for t in &self.pending {
            let (loaded, total) = t.progress();
            progress.loaded += loaded;
            progress.total += total;
        }
        for t in &self.new {
            progress.total += t.entry().size_hint();
        }
        progress.eta = self
            .speed
            .eta(progress.total.saturating_sub(progress.loaded));
        progress
    }

    /// Enqueues a transfer and runs admission.
    ///
    /// Refused with [`TransferError::SessionAlreadyCommitted`] once the
    /// transfer's session is committing or committed. A transfer whose
    /// session failed to begin is accepted but never dispatched; it stays
    /// queued until aborted.
    pub fn add(&mut self, transfer: Arc<FileTransfer>) -> Result<TransferId, TransferError> {
        let id = transfer.id();
        if self.contains(id) {
            return Err(TransferError::AlreadyQueued(id));
        }
        let state = transfer.state();
        if state != TransferState::New {
            return Err(TransferError::InvalidTransition {
                from: state,
                to: TransferState::Started,
            });
        }
        ensure_session_open(transfer.session())?;

        debug!(transfer = %id, path = %transfer.upload_path(), session = %transfer.session().id(), "transfer added");
        self.new.push(transfer);
        self.emit(QueueEvent::Added { transfer: id });
        self.start_transfers();
        Ok(id)
    }

    /// Resubmits a failed or aborted transfer as a new one.
    ///
    /// Emits `Restart` followed by `Added` for the replacement. Transfers
    /// that required the original keep requiring it.
    pub fn restart(&mut self, transfer: &FileTransfer) -> Result<Arc<FileTransfer>, TransferError> {
        let state = transfer.state();
        if !matches!(state, TransferState::Errored | TransferState::Aborted) {
            return Err(TransferError::InvalidTransition {
                from: state,
                to: TransferState::New,
            });
        }
        ensure_session_open(transfer.session())?;

        let replacement = Arc::new(transfer.resubmit());
        self.emit(QueueEvent::Restart {
            transfer: transfer.id(),
            replacement: replacement.id(),
        });
        self.add(Arc::clone(&replacement))?;
        Ok(replacement)
    }

    /// Aborts a transfer and, recursively, everything that requires it.
    ///
    /// Emits one `Abort` per removed transfer. Returns `false` if `id` is
    /// neither queued nor in flight.
    pub fn abort(&mut self, id: TransferId) -> bool {
        if !self.abort_cascade(id) {
            return false;
        }
        self.start_transfers();
        true
    }

    fn abort_cascade(&mut self, id: TransferId) -> bool {
        let transfer = if let Some(index) = self.new.iter().position(|t| t.id() == id) {
            self.new.remove(index)
        } else if let Some(index) = self.pending.iter().position(|t| t.id() == id) {
            self.pending.remove(index)
        } else {
            return false;
        };

        let cancelled = transfer.abort();
        debug!(transfer = %id, cancelled, "transfer aborted");
        self.emit(QueueEvent::Abort { transfer: id });
        self.abort_dependents(id);
        true
    }

    fn abort_dependents(&mut self, id: TransferId) {
        let dependents: Vec<TransferId> = self
            .new
            .iter()
            .chain(self.pending.iter())
            .filter(|u| u.depends_on(id))
            .map(|u| u.id())
            .collect();
        for dependent in dependents {
            self.abort_cascade(dependent);
        }
    }

    /// Removes queued transfers that were aborted directly through
    /// [`FileTransfer::abort`] rather than through the queue.
    fn remove_aborted(&mut self) {
        let aborted: Vec<TransferId> = self
            .new
            .iter()
            .filter(|t| t.state().is_terminal())
            .map(|t| t.id())
            .collect();
        for id in aborted {
            self.abort_cascade(id);
        }
    }

    /// Handles the next report from a network task.
    ///
    /// Returns `false` without waiting when no task is outstanding.
    pub async fn tick(&mut self) -> bool {
        if self.outstanding == 0 {
            return false;
        }
        let Some(signal) = self.signals_rx.recv().await else {
            return false;
        };
        self.handle(signal);
        if self.is_idle() {
            self.speed.reset();
        }
        true
    }

    /// Drives the queue until every outstanding request has been handled.
    ///
    /// Transfers blocked on a failed session or a failed prerequisite stay
    /// queued; abort them to drain the queue.
    pub async fn run(&mut self) {
        while self.tick().await {}
    }

    fn handle(&mut self, signal: Signal) {
        match signal {
            Signal::SessionBegun { session, result } => {
                self.outstanding -= 1;
                match result {
                    Ok(bucket_id) => {
                        self.emit(QueueEvent::BeginSessionFinished {
                            session: session.id(),
                            bucket_id,
                        });
                    }
                    Err(e) => {
                        self.emit(QueueEvent::BeginSessionError {
                            session: session.id(),
                            message: e.user_message(),
                        });
                    }
                }
                self.start_transfers();
            }
            Signal::SessionCommitted { session, result } => {
                self.outstanding -= 1;
                let event = match result {
                    Ok(location) => QueueEvent::CommitComplete {
                        session: session.id(),
                        location,
                    },
                    Err(e) => QueueEvent::CommitError {
                        session: session.id(),
                        message: e.user_message(),
                    },
                };
                self.emit(event);
            }
            Signal::TransferFinished { id, result } => {
                self.outstanding -= 1;
                self.transfer_finished(id, result);
                self.start_transfers();
            }
            Signal::TransferProgress { id, loaded, total } => {
                let Some(transfer) = self.pending.iter().find(|t| t.id() == id) else {
                    return;
                };
                let delta = transfer.record_progress(loaded, total);
                let (loaded, total) = transfer.progress();
                if delta > 0 {
                    self.speed.add_sample(delta);
                }
                self.emit(QueueEvent::Progress {
                    transfer: id,
                    loaded,
                    total,
                });
            }
        }
    }

    fn transfer_finished(&mut self, id: TransferId, result: Result<(), TransferError>) {
        // Aborted transfers were already removed; their late reports are dropped.
        let Some(index) = self.pending.iter().position(|t| t.id() == id) else {
            debug!(transfer = %id, "ignoring report for removed transfer");
            return;
        };
        let transfer = self.pending.remove(index);
        let session = Arc::clone(transfer.session());

        if transfer.state() == TransferState::Aborted {
            // Aborted directly on the transfer while in flight.
            debug!(transfer = %id, "in-flight transfer was aborted");
            self.emit(QueueEvent::Abort { transfer: id });
            self.abort_dependents(id);
            return;
        }
        if let Err(e) = transfer.finish(&result) {
            warn!(transfer = %id, error = %e, "transfer finished in unexpected state");
        }

        match result {
            Ok(()) => {
                debug!(transfer = %id, path = %transfer.upload_path(), "transfer complete");
                self.emit(QueueEvent::Complete { transfer: id });
            }
            Err(e) => {
                warn!(transfer = %id, path = %transfer.upload_path(), error = %e, "transfer failed");
                self.emit(QueueEvent::Error {
                    transfer: id,
                    message: e.user_message(),
                });
            }
        }

        if !self.is_session_active(session.id()) {
            self.commit_session(&session);
        }
    }

    /// Admission loop: dispatches eligible transfers in insertion order
    /// until the cap is reached or nothing else is eligible.
    fn start_transfers(&mut self) {
        self.remove_aborted();
        let can_start = self
            .config
            .max_pending
            .saturating_sub(self.pending.len())
            .min(self.new.len());

        for _ in 0..can_start {
            let Some(index) = self.next_eligible() else {
                break;
            };
            let transfer = self.new.remove(index);
            self.dispatch(transfer);
        }
    }

    /// First eligible transfer in `new`, beginning idle sessions on the way.
    fn next_eligible(&mut self) -> Option<usize> {
        for index in 0..self.new.len() {
            let session = Arc::clone(self.new[index].session());
            match session.state() {
                SessionState::Idle => self.begin_session(&session),
                SessionState::Started { .. } if self.new[index].is_eligible() => {
                    return Some(index);
                }
                _ => {}
            }
        }
        None
    }

    fn dispatch(&mut self, transfer: Arc<FileTransfer>) {
        let id = transfer.id();
        let progress_tx = self.signals_tx.clone();
        let progress: ProgressCallback = Arc::new(move |loaded, total| {
            let _ = progress_tx.send(Signal::TransferProgress { id, loaded, total });
        });

        let request = match transfer.start(Arc::clone(&self.service), progress) {
            Ok(request) => request,
            Err(e) => {
                warn!(transfer = %id, error = %e, "transfer could not start");
                self.emit(QueueEvent::Error {
                    transfer: id,
                    message: e.user_message(),
                });
                return;
            }
        };

        debug!(transfer = %id, path = %transfer.upload_path(), "transfer started");
        self.pending.push(transfer);
        self.outstanding += 1;
        let signals_tx = self.signals_tx.clone();
        tokio::spawn(async move {
            let result = request.await;
            let _ = signals_tx.send(Signal::TransferFinished { id, result });
        });
        self.emit(QueueEvent::Started { transfer: id });
    }

    fn begin_session(&mut self, session: &Arc<TransferSession>) {
        let request = match session.start(Arc::clone(&self.service)) {
            Ok(request) => request,
            Err(e) => {
                debug!(session = %session.id(), error = %e, "session begin skipped");
                return;
            }
        };

        self.outstanding += 1;
        let signals_tx = self.signals_tx.clone();
        let session = Arc::clone(session);
        self.emit(QueueEvent::BeginSessionStarted {
            session: session.id(),
        });
        tokio::spawn(async move {
            let result = request.await;
            let _ = signals_tx.send(Signal::SessionBegun { session, result });
        });
    }

    fn commit_session(&mut self, session: &Arc<TransferSession>) {
        let request = match session.commit(Arc::clone(&self.service)) {
            Ok(request) => request,
            Err(e) => {
                debug!(session = %session.id(), error = %e, "session commit skipped");
                return;
            }
        };

        info!(session = %session.id(), "all transfers drained, committing");
        self.outstanding += 1;
        let signals_tx = self.signals_tx.clone();
        let session = Arc::clone(session);
        self.emit(QueueEvent::CommitStart {
            session: session.id(),
        });
        tokio::spawn(async move {
            let result = request.await;
            let _ = signals_tx.send(Signal::SessionCommitted { session, result });
        });
    }

    fn emit(&self, event: QueueEvent) {
        // Nobody listening is fine.
        let _ = self.events_tx.send(event);
    }
}

fn ensure_session_open(session: &TransferSession) -> Result<(), TransferError> {
    match session.state() {
        SessionState::Committing { .. }
        | SessionState::Committed { .. }
        | SessionState::CommitFailed { .. } => Err(TransferError::SessionAlreadyCommitted(session.id())),
        _ => Ok(()),
    }
}
