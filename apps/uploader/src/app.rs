//! Upload run: wires the client, the target and the queue together.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bucketload_transfer::{
    FileTransfer, FileTransferQueue, QueueConfig, QueueEvent, QueueProgress, SessionState,
    TransferId, TransferState, UploadService,
};
use bucketload_upload_client::HttpUploadService;
use bucketload_upload_target::{DropItem, UploadTarget};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::config::UploaderConfig;

/// How often overall progress is logged while transfers are in flight.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Outcome of one upload run.
#[derive(Debug)]
pub struct Report {
    pub total: usize,
    /// Transfers that did not complete.
    pub failed: usize,
    pub committed: bool,
    /// `Location` returned by the commit, if any.
    pub location: Option<String>,
}

impl Report {
    pub fn succeeded(&self) -> bool {
        self.committed && self.failed == 0
    }
}

/// Uploads `paths` and drives the queue until the session settles.
///
/// Ctrl-C aborts every transfer of the run.
pub async fn run(config: UploaderConfig, paths: Vec<PathBuf>, json: bool) -> anyhow::Result<Report> {
    let service: Arc<dyn UploadService> = Arc::new(HttpUploadService::new(&config.base_url)?);
    let mut queue = FileTransferQueue::new(
        Arc::clone(&service),
        QueueConfig {
            max_pending: config.max_pending.max(1),
        },
    );
    let events = queue.take_events().context("event receiver already taken")?;

    let target = UploadTarget::new(service, config.upload_handler, &config.target_path)
        .with_params(config.params);
    let items = paths.into_iter().map(DropItem::Path).collect();
    let enqueued = target
        .upload(&mut queue, items)
        .await
        .context("upload rejected")?;

    let transfers: Vec<Arc<FileTransfer>> = enqueued
        .transfers
        .iter()
        .filter_map(|id| queue.get(*id).cloned())
        .collect();
    let names = transfers
        .iter()
        .map(|t| (t.id(), t.upload_path().to_string()))
        .collect();
    let printer = tokio::spawn(print_events(events, names, json));

    drive(&mut queue, &enqueued.transfers).await;

    // Whatever is left is blocked on a failed begin or a failed prerequisite.
    for id in &enqueued.transfers {
        if queue.contains(*id) {
            queue.abort(*id);
        }
    }
    queue.run().await;
    drop(queue);
    printer.await?;

    let failed = transfers
        .iter()
        .filter(|t| t.state() != TransferState::Complete)
        .count();
    let (committed, location) = match enqueued.session.state() {
        SessionState::Committed { location, .. } => (true, location),
        _ => (false, None),
    };
    info!(
        session = %enqueued.session.id(),
        total = transfers.len(),
        failed,
        committed,
        "upload finished"
    );

    Ok(Report {
        total: transfers.len(),
        failed,
        committed,
        location,
    })
}

async fn drive(queue: &mut FileTransferQueue, transfers: &[TransferId]) {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    let mut report = tokio::time::interval_at(
        tokio::time::Instant::now() + PROGRESS_INTERVAL,
        PROGRESS_INTERVAL,
    );
    report.set_missed_tick_behavior(MissedTickBehavior::Delay);

    enum Step {
        Handled,
        Interrupted,
        Report,
    }

    loop {
        let step = tokio::select! {
            more = queue.tick() => {
                if !more {
                    break;
                }
                Step::Handled
            }
            _ = &mut ctrl_c, if !interrupted => Step::Interrupted,
            _ = report.tick() => Step::Report,
        };

        match step {
            Step::Handled => {}
            Step::Interrupted => {
                interrupted = true;
                warn!("interrupted, aborting transfers");
                for id in transfers {
                    queue.abort(*id);
                }
            }
            Step::Report => {
                let progress = queue.progress();
                if progress.in_flight > 0 {
                    info!("{}", progress_line(&progress));
                }
            }
        }
    }
}

/// One-line summary of overall progress, e.g.
/// `1.5 MiB / 4.0 MiB, 2 in flight, 3 queued, 512.0 KiB/s, eta 5s`.
fn progress_line(progress: &QueueProgress) -> String {
    let mut line = format!(
        "{} / {}, {} in flight, {} queued",
        human_bytes(progress.loaded as f64),
        human_bytes(progress.total as f64),
        progress.in_flight,
        progress.queued,
    );
    if progress.bytes_per_second > 0.0 {
        line.push_str(&format!(", {}/s", human_bytes(progress.bytes_per_second)));
    }
    if let Some(eta) = progress.eta {
        line.push_str(&format!(", eta {}s", eta.as_secs()));
    }
    line
}

fn human_bytes(bytes: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value:.0} {}", UNITS[unit])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

async fn print_events(
    mut events: mpsc::UnboundedReceiver<QueueEvent>,
    names: HashMap<TransferId, String>,
    json: bool,
) {
    while let Some(event) = events.recv().await {
        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "failed to encode event"),
            }
        } else if let Some(line) = describe(&event, &names) {
            println!("{line}");
        }
    }
}

/// Human-readable line for an event; `None` for events not worth a line.
fn describe(event: &QueueEvent, names: &HashMap<TransferId, String>) -> Option<String> {
    let name = |id: &TransferId| names.get(id).cloned().unwrap_or_else(|| id.to_string());

    let line = match event {
        QueueEvent::Started { transfer } => format!("uploading  {}", name(transfer)),
        QueueEvent::Complete { transfer } => format!("done       {}", name(transfer)),
        QueueEvent::Error { transfer, message } => {
            format!("failed     {}: {message}", name(transfer))
        }
        QueueEvent::Abort { transfer } => format!("aborted    {}", name(transfer)),
        QueueEvent::BeginSessionFinished { bucket_id, .. } => format!("bucket     {bucket_id}"),
        QueueEvent::BeginSessionError { message, .. } => format!("begin failed: {message}"),
        QueueEvent::CommitComplete { location, .. } => {
            format!("committed  {}", location.as_deref().unwrap_or("-"))
        }
        QueueEvent::CommitError { message, .. } => format!("commit failed: {message}"),
        _ => return None,
    };
    Some(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketload_transfer::{Entry, TransferSession};

    /// Builds a name table from fresh transfers.
    fn names_for(paths: &[&str]) -> (Vec<TransferId>, HashMap<TransferId, String>) {
        let session = Arc::new(TransferSession::new("h", Default::default()));
        let mut ids = Vec::new();
        let mut names = HashMap::new();
        for path in paths {
            let t = FileTransfer::new(
                Arc::clone(&session),
                Entry::Directory {
                    name: path.trim_start_matches('/').into(),
                },
                "",
                path,
            )
            .unwrap();
            ids.push(t.id());
            names.insert(t.id(), t.upload_path().to_string());
        }
        (ids, names)
    }

    #[test]
    fn describe_transfer_events() {
        let (ids, names) = names_for(&["/scans"]);
        let id = ids[0];

        assert_eq!(
            describe(&QueueEvent::Started { transfer: id }, &names).unwrap(),
            "uploading  /scans"
        );
        assert_eq!(
            describe(
                &QueueEvent::Error {
                    transfer: id,
                    message: "quota".into()
                },
                &names
            )
            .unwrap(),
            "failed     /scans: quota"
        );
        assert!(
            describe(
                &QueueEvent::Progress {
                    transfer: id,
                    loaded: 1,
                    total: 2
                },
                &names
            )
            .is_none()
        );
    }

    #[test]
    fn describe_unknown_transfer_uses_id() {
        let (ids, _) = names_for(&["/a"]);
        let line = describe(&QueueEvent::Complete { transfer: ids[0] }, &HashMap::new()).unwrap();
        assert_eq!(line, format!("done       {}", ids[0]));
    }

    #[test]
    fn describe_commit_without_location() {
        let session = TransferSession::new("h", Default::default()).id();
        let line = describe(
            &QueueEvent::CommitComplete {
                session,
                location: None,
            },
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(line, "committed  -");
    }

    #[test]
    fn progress_line_includes_rate_and_eta() {
        let progress = QueueProgress {
            loaded: 3 * 1024 * 1024 / 2,
            total: 4 * 1024 * 1024,
            in_flight: 2,
            queued: 3,
            bytes_per_second: 512.0 * 1024.0,
            eta: Some(Duration::from_secs(5)),
        };
        assert_eq!(
            progress_line(&progress),
            "1.5 MiB / 4.0 MiB, 2 in flight, 3 queued, 512.0 KiB/s, eta 5s"
        );
    }

    #[test]
    fn progress_line_without_rate() {
        let progress = QueueProgress {
            total: 900,
            in_flight: 1,
            ..Default::default()
        };
        assert_eq!(progress_line(&progress), "0 B / 900 B, 1 in flight, 0 queued");
    }

    #[test]
    fn report_success_requires_commit() {
        let report = Report {
            total: 3,
            failed: 0,
            committed: false,
            location: None,
        };
        assert!(!report.succeeded());

        let report = Report {
            committed: true,
            ..report
        };
        assert!(report.succeeded());
    }
}
