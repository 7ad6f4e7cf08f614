//! One sync attempt, end to end.
//!
//! The coordinator is the only writer of [`SyncStatus`]. Attempts are
//! single-flight: claiming the `InProgress` state is an atomic
//! check-and-set on the status channel, so manual and scheduled triggers
//! share one guard. Every failure becomes `SyncStatus::Error`; nothing
//! escapes `sync_once`.

use crate::config::Config;
use crate::core::archive::{create_unique, Archiver};
use crate::core::parser::RecordReader;
use crate::core::records::{Eda, HeartRate, Reading, Respiration, Temperature};
use crate::collector::types::SensorKind;
use crate::error::SyncError;
use crate::store::Store;
use crate::sync::retention::{sweep_archives, DEFAULT_ARCHIVE_KEEP};
use crate::sync::status::{SyncRole, SyncStatus};
use crate::sync::transport::{Transport, TransportPayload, DEFAULT_CHANNEL};
use crate::transparency::SharedPipelineLog;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

/// Directories an attempt works in.
#[derive(Debug, Clone)]
pub struct SyncPaths {
    /// Per-sensor logs packaged on the sending side.
    pub data_dir: PathBuf,
    /// Transient outgoing archives.
    pub staging_dir: PathBuf,
    /// Received archives, swept down to `archive_keep`.
    pub inbox_dir: PathBuf,
    /// Extraction scratch space, removed after every receive.
    pub work_dir: PathBuf,
    pub archive_keep: usize,
}

impl SyncPaths {
    /// Lay out all directories under one root.
    pub fn under(root: &Path) -> Self {
        Self {
            data_dir: root.join("logs"),
            staging_dir: root.join("staging"),
            inbox_dir: root.join("inbox"),
            work_dir: root.join("work"),
            archive_keep: DEFAULT_ARCHIVE_KEEP,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            staging_dir: config.staging_dir.clone(),
            inbox_dir: config.inbox_dir.clone(),
            work_dir: config.work_dir.clone(),
            archive_keep: config.archive_keep,
        }
    }
}

/// Outcome of a call to [`SyncCoordinator::sync_once`].
#[derive(Debug, Clone)]
pub enum SyncAttempt {
    /// The attempt ran; the status it ended in.
    Completed(SyncStatus),
    /// Another attempt was already in progress; nothing was done.
    Rejected,
}

impl SyncAttempt {
    pub fn status(&self) -> Option<&SyncStatus> {
        match self {
            SyncAttempt::Completed(status) => Some(status),
            SyncAttempt::Rejected => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, SyncAttempt::Completed(SyncStatus::Error { .. }))
    }
}

/// Orchestrates package/send and receive/ingest attempts.
pub struct SyncCoordinator {
    archiver: Archiver,
    store: Store,
    transport: Arc<dyn Transport>,
    paths: SyncPaths,
    channel: String,
    origin: String,
    status: watch::Sender<SyncStatus>,
    log: Option<SharedPipelineLog>,
}

impl SyncCoordinator {
    pub fn new(store: Store, transport: Arc<dyn Transport>, paths: SyncPaths) -> Self {
        let origin = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            archiver: Archiver::new(paths.staging_dir.clone()),
            store,
            transport,
            paths,
            channel: DEFAULT_CHANNEL.to_string(),
            origin,
            status: watch::Sender::new(SyncStatus::Idle),
            log: None,
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn with_log(mut self, log: SharedPipelineLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn paths(&self) -> &SyncPaths {
        &self.paths
    }

    /// Current status.
    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Observe every status transition.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Run one attempt for `role`, or reject it if one is already running.
    ///
    /// The attempt runs on its own task: dropping the returned future does
    /// not interrupt it, and a panic inside it is reported as an error
    /// status.
    pub async fn sync_once(self: &Arc<Self>, role: SyncRole) -> SyncAttempt {
        let claimed = self.status.send_if_modified(|status| {
            if status.is_in_progress() {
                false
            } else {
                *status = SyncStatus::InProgress;
                true
            }
        });
        if !claimed {
            warn!(%role, "sync already in progress, rejecting trigger");
            return SyncAttempt::Rejected;
        }

        let attempt = Uuid::new_v4();
        info!(%attempt, %role, "sync started");

        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let guard = InFlight::new(&this.status);
            let result = match role {
                SyncRole::Send => this.send_package().await,
                SyncRole::Receive => this.receive_package().await,
            };
            let status = this.finish(attempt, role, result);
            guard.disarm();
            status
        });

        match task.await {
            Ok(status) => SyncAttempt::Completed(status),
            Err(e) => SyncAttempt::Completed(self.finish(
                attempt,
                role,
                Err(SyncError::Task(e.to_string())),
            )),
        }
    }

    fn finish(&self, attempt: Uuid, role: SyncRole, result: Result<String, SyncError>) -> SyncStatus {
        let status = match result {
            Ok(message) => {
                info!(%attempt, %role, "sync succeeded: {message}");
                SyncStatus::Success { message }
            }
            Err(error) => {
                if error.is_path_traversal() {
                    warn!(%attempt, %role, "sync rejected a malicious package: {error}");
                } else {
                    warn!(%attempt, %role, "sync failed: {error}");
                }
                if let Some(log) = &self.log {
                    log.record_sync_failure();
                }
                SyncStatus::failed(error)
            }
        };
        self.status.send_replace(status.clone());
        status
    }

    async fn send_package(&self) -> Result<String, SyncError> {
        let archiver = self.archiver.clone();
        let data_dir = self.paths.data_dir.clone();
        let archive = run_blocking(move || Ok(archiver.create_archive(&data_dir)?))
            .await?
            .ok_or_else(|| SyncError::NothingToSend(self.paths.data_dir.clone()))?;

        let delivered = self.deliver(&archive).await;

        if let Err(e) = tokio::fs::remove_file(&archive).await {
            warn!(archive = %archive.display(), "could not remove sent archive: {e}");
        }

        let size = delivered?;
        if let Some(log) = &self.log {
            log.record_package_sent();
        }
        Ok(format!("sent {} ({size} bytes)", display_name(&archive)))
    }

    async fn deliver(&self, archive: &Path) -> Result<usize, SyncError> {
        let bytes = tokio::fs::read(archive).await?;
        let size = bytes.len();
        let payload = TransportPayload::new(self.channel.clone(), self.origin.clone(), bytes);
        self.transport.send(payload).await?;
        Ok(size)
    }

    async fn receive_package(&self) -> Result<String, SyncError> {
        let Some(payload) = self.transport.receive(&self.channel).await? else {
            return Ok("no pending package".to_string());
        };
        if let Some(log) = &self.log {
            log.record_package_received();
        }
        info!(origin = %payload.origin, sent_at = %payload.sent_at, bytes = payload.bytes.len(), "received package");

        let paths = self.paths.clone();
        let store = self.store.clone();
        let log = self.log.clone();
        run_blocking(move || ingest_payload(&paths, &store, log.as_ref(), payload)).await
    }
}

/// Resets the status if an attempt ends without reporting, for example
/// because it panicked.
struct InFlight<'a> {
    status: &'a watch::Sender<SyncStatus>,
    armed: bool,
}

impl<'a> InFlight<'a> {
    fn new(status: &'a watch::Sender<SyncStatus>) -> Self {
        Self {
            status,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.status.send_replace(SyncStatus::failed(SyncError::Aborted));
        }
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, SyncError>
where
    F: FnOnce() -> Result<T, SyncError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SyncError::Task(e.to_string()))?
}

/// Save, extract and ingest one received package. Runs on a blocking
/// worker.
fn ingest_payload(
    paths: &SyncPaths,
    store: &Store,
    log: Option<&SharedPipelineLog>,
    payload: TransportPayload,
) -> Result<String, SyncError> {
    fs::create_dir_all(&paths.inbox_dir)?;
    let (archive, mut file) = create_unique(&paths.inbox_dir, payload.sent_at)?;
    file.write_all(&payload.bytes)?;
    file.sync_all()?;
    drop(file);

    remove_dir_if_present(&paths.work_dir)?;
    let ingested = extract_and_ingest(&archive, &paths.work_dir, store);
    if let Err(e) = remove_dir_if_present(&paths.work_dir) {
        warn!(dir = %paths.work_dir.display(), "could not remove extraction directory: {e}");
    }

    if let Err(e) = sweep_archives(&paths.inbox_dir, paths.archive_keep) {
        warn!(dir = %paths.inbox_dir.display(), "inbox sweep failed: {e}");
    }

    let (records, skipped) = ingested?;
    if let Some(log) = log {
        log.record_ingested(records as u64, skipped as u64);
    }

    Ok(format!(
        "ingested {records} records from {}{}",
        display_name(&archive),
        if skipped > 0 {
            format!(" ({skipped} malformed lines skipped)")
        } else {
            String::new()
        }
    ))
}

fn extract_and_ingest(
    archive: &Path,
    work_dir: &Path,
    store: &Store,
) -> Result<(usize, usize), SyncError> {
    Archiver::extract_archive(archive, work_dir)?;

    let mut records = 0;
    let mut skipped = 0;
    for kind in SensorKind::ALL {
        let path = work_dir.join(kind.file_name());
        if !path.is_file() {
            continue;
        }
        let (inserted, dropped) = match kind {
            SensorKind::HeartRate => ingest_file::<HeartRate>(store, &path)?,
            SensorKind::Respiration => ingest_file::<Respiration>(store, &path)?,
            SensorKind::Eda => ingest_file::<Eda>(store, &path)?,
            SensorKind::Temperature => ingest_file::<Temperature>(store, &path)?,
        };
        records += inserted;
        skipped += dropped;
    }
    Ok((records, skipped))
}

fn ingest_file<R: Reading>(store: &Store, path: &Path) -> Result<(usize, usize), SyncError> {
    let mut reader = RecordReader::<R>::open(path)?;
    let records: Vec<R> = reader.by_ref().collect();
    if let Some(e) = reader.take_error() {
        return Err(e.into());
    }

    let skipped = reader.skipped();
    if skipped > 0 {
        warn!(kind = %R::KIND, skipped, "dropped malformed lines while ingesting");
    }

    let inserted = if records.is_empty() {
        0
    } else {
        store.insert_batch(&records)?
    };
    Ok((inserted, skipped))
}

fn remove_dir_if_present(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::transport::{LoopbackTransport, TransportError};
    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    fn write_hr_log(dir: &Path) {
        fs::create_dir_all(dir).unwrap();
        fs::write(
            dir.join("heart_rate.csv"),
            "timestamp,heart_rate,confidence_score\n\
             2024-01-01T10:00:00Z,72.5,0.95\n\
             BADLINE\n\
             2024-01-01T10:00:02Z,73.0,0.90\n",
        )
        .unwrap();
    }

    struct FailingTransport;

    #[async_trait]
    impl Transport for FailingTransport {
        async fn is_available(&self) -> bool {
            true
        }

        async fn send(&self, _payload: TransportPayload) -> Result<(), TransportError> {
            Err(TransportError::Delivery("peer did not ack".into()))
        }

        async fn receive(&self, _channel: &str) -> Result<Option<TransportPayload>, TransportError> {
            Err(TransportError::Delivery("link dropped".into()))
        }
    }

    /// Blocks every send until released.
    struct GatedTransport {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Transport for GatedTransport {
        async fn is_available(&self) -> bool {
            true
        }

        async fn send(&self, _payload: TransportPayload) -> Result<(), TransportError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }

        async fn receive(&self, _channel: &str) -> Result<Option<TransportPayload>, TransportError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_send_then_receive_success() {
        let tmp = TempDir::new().unwrap();
        let (a, b) = LoopbackTransport::pair();

        let sender_paths = SyncPaths::under(&tmp.path().join("watch"));
        write_hr_log(&sender_paths.data_dir);
        let sender = Arc::new(SyncCoordinator::new(
            Store::open_in_memory().unwrap(),
            Arc::new(a),
            sender_paths.clone(),
        ));

        let store = Store::open_in_memory().unwrap();
        let receiver_paths = SyncPaths::under(&tmp.path().join("phone"));
        let receiver = Arc::new(SyncCoordinator::new(
            store.clone(),
            Arc::new(b),
            receiver_paths.clone(),
        ));

        let mut states = sender.subscribe();
        assert!(matches!(*states.borrow_and_update(), SyncStatus::Idle));

        let sent = sender.sync_once(SyncRole::Send).await;
        assert!(matches!(sent, SyncAttempt::Completed(SyncStatus::Success { .. })));
        assert!(matches!(sender.status(), SyncStatus::Success { .. }));
        // Staged archive is removed after sending.
        assert_eq!(fs::read_dir(&sender_paths.staging_dir).unwrap().count(), 0);
        // Source logs are untouched.
        assert!(sender_paths.data_dir.join("heart_rate.csv").exists());

        let received = receiver.sync_once(SyncRole::Receive).await;
        match received {
            SyncAttempt::Completed(SyncStatus::Success { message }) => {
                assert!(message.contains("ingested 2 records"), "{message}");
                assert!(message.contains("1 malformed"), "{message}");
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        assert_eq!(store.count(SensorKind::HeartRate).unwrap(), 2);
        assert!(!receiver_paths.work_dir.exists());
        assert_eq!(fs::read_dir(&receiver_paths.inbox_dir).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_bytes_skip_only_their_line() {
        let tmp = TempDir::new().unwrap();
        let (a, b) = LoopbackTransport::pair();

        let sender_paths = SyncPaths::under(&tmp.path().join("watch"));
        fs::create_dir_all(&sender_paths.data_dir).unwrap();
        let mut log = b"timestamp,heart_rate,confidence_score\n\
                        2024-01-01T10:00:00Z,72.5,0.95\n"
            .to_vec();
        log.extend_from_slice(b"\xff\xfe garbage\n2024-01-01T10:00:02Z,73.0,0.90\n");
        fs::write(sender_paths.data_dir.join("heart_rate.csv"), log).unwrap();

        let sender = Arc::new(SyncCoordinator::new(
            Store::open_in_memory().unwrap(),
            Arc::new(a),
            sender_paths,
        ));
        assert!(!sender.sync_once(SyncRole::Send).await.is_error());

        let store = Store::open_in_memory().unwrap();
        let receiver = Arc::new(SyncCoordinator::new(
            store.clone(),
            Arc::new(b),
            SyncPaths::under(&tmp.path().join("phone")),
        ));
        match receiver.sync_once(SyncRole::Receive).await {
            SyncAttempt::Completed(SyncStatus::Success { message }) => {
                assert!(message.contains("ingested 2 records"), "{message}");
                assert!(message.contains("1 malformed"), "{message}");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(store.count(SensorKind::HeartRate).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_empty_receive_is_success() {
        let tmp = TempDir::new().unwrap();
        let (_a, b) = LoopbackTransport::pair();
        let coordinator = Arc::new(SyncCoordinator::new(
            Store::open_in_memory().unwrap(),
            Arc::new(b),
            SyncPaths::under(tmp.path()),
        ));

        match coordinator.sync_once(SyncRole::Receive).await {
            SyncAttempt::Completed(SyncStatus::Success { message }) => {
                assert_eq!(message, "no pending package")
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failing_transport_reports_error() {
        let tmp = TempDir::new().unwrap();
        let paths = SyncPaths::under(tmp.path());
        write_hr_log(&paths.data_dir);
        let coordinator = Arc::new(SyncCoordinator::new(
            Store::open_in_memory().unwrap(),
            Arc::new(FailingTransport),
            paths.clone(),
        ));

        let outcome = coordinator.sync_once(SyncRole::Send).await;
        assert!(outcome.is_error());
        match coordinator.status() {
            SyncStatus::Error { message, cause } => {
                assert!(message.contains("peer did not ack"));
                assert!(matches!(*cause, SyncError::Transport(_)));
            }
            other => panic!("unexpected status {other}"),
        }
        // Archive is deleted even though delivery failed.
        assert_eq!(fs::read_dir(&paths.staging_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_logs_is_error() {
        let tmp = TempDir::new().unwrap();
        let (a, _b) = LoopbackTransport::pair();
        let coordinator = Arc::new(SyncCoordinator::new(
            Store::open_in_memory().unwrap(),
            Arc::new(a),
            SyncPaths::under(tmp.path()),
        ));

        coordinator.sync_once(SyncRole::Send).await;
        match coordinator.status() {
            SyncStatus::Error { cause, .. } => {
                assert!(matches!(*cause, SyncError::NothingToSend(_)))
            }
            other => panic!("unexpected status {other}"),
        }
    }

    #[tokio::test]
    async fn test_second_trigger_rejected_while_in_flight() {
        let tmp = TempDir::new().unwrap();
        let paths = SyncPaths::under(tmp.path());
        write_hr_log(&paths.data_dir);
        let transport = Arc::new(GatedTransport {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let coordinator = Arc::new(SyncCoordinator::new(
            Store::open_in_memory().unwrap(),
            transport.clone(),
            paths,
        ));

        let first = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.sync_once(SyncRole::Send).await })
        };
        transport.entered.notified().await;
        assert!(coordinator.status().is_in_progress());

        let second = coordinator.sync_once(SyncRole::Receive).await;
        assert!(matches!(second, SyncAttempt::Rejected));
        assert!(coordinator.status().is_in_progress());

        transport.release.notify_one();
        let first = first.await.unwrap();
        assert!(matches!(first, SyncAttempt::Completed(SyncStatus::Success { .. })));
    }
}
