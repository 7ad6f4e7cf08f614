//! Point-to-point delivery of package bytes between two devices.
//!
//! A transport is opaque: it moves a [`TransportPayload`] and reports an
//! immediate ack or failure. It never retries on its own.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

/// Logical channel the sensor packages travel on.
pub const DEFAULT_CHANNEL: &str = "/sensor-data";

/// Subdirectory of a spool channel holding payloads that failed validation.
const REJECTED_DIR: &str = "rejected";

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport unavailable")]
    Unavailable,

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("payload envelope error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// One package in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportPayload {
    pub channel: String,
    pub sent_at: DateTime<Utc>,
    /// Host name of the sending device.
    pub origin: String,
    pub bytes: Vec<u8>,
}

impl TransportPayload {
    pub fn new(channel: impl Into<String>, origin: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            channel: channel.into(),
            sent_at: Utc::now(),
            origin: origin.into(),
            bytes,
        }
    }
}

/// Byte link between the origin and the destination device.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether a peer is currently reachable.
    async fn is_available(&self) -> bool;

    /// Deliver one payload. `Ok` is the peer's ack.
    async fn send(&self, payload: TransportPayload) -> Result<(), TransportError>;

    /// Take the oldest pending payload for `channel`, if any.
    async fn receive(&self, channel: &str) -> Result<Option<TransportPayload>, TransportError>;
}

#[derive(Debug, Default)]
struct Link {
    queues: [Mutex<VecDeque<TransportPayload>>; 2],
    available: AtomicBool,
}

/// In-process transport; the two ends of [`LoopbackTransport::pair`]
/// deliver to each other.
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    link: Arc<Link>,
    side: usize,
}

impl LoopbackTransport {
    /// Create two connected endpoints.
    pub fn pair() -> (Self, Self) {
        let link = Arc::new(Link {
            available: AtomicBool::new(true),
            ..Link::default()
        });
        (
            Self {
                link: Arc::clone(&link),
                side: 0,
            },
            Self { link, side: 1 },
        )
    }

    /// Simulate the peer going out of (or back into) range. Affects both ends.
    pub fn set_available(&self, available: bool) {
        self.link.available.store(available, Ordering::SeqCst);
    }

    /// Number of payloads waiting for this endpoint.
    pub fn pending(&self) -> usize {
        self.link.queues[self.side]
            .lock()
            .map(|q| q.len())
            .unwrap_or(0)
    }

    fn queue(&self, side: usize) -> Result<MutexGuard<'_, VecDeque<TransportPayload>>, TransportError> {
        self.link.queues[side]
            .lock()
            .map_err(|_| TransportError::Delivery("loopback queue poisoned".into()))
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn is_available(&self) -> bool {
        self.link.available.load(Ordering::SeqCst)
    }

    async fn send(&self, payload: TransportPayload) -> Result<(), TransportError> {
        if !self.is_available().await {
            return Err(TransportError::Unavailable);
        }
        self.queue(1 - self.side)?.push_back(payload);
        Ok(())
    }

    async fn receive(&self, channel: &str) -> Result<Option<TransportPayload>, TransportError> {
        if !self.is_available().await {
            return Err(TransportError::Unavailable);
        }
        let mut queue = self.queue(self.side)?;
        let position = queue.iter().position(|p| p.channel == channel);
        Ok(position.and_then(|i| queue.remove(i)))
    }
}

/// Envelope written next to each spooled archive.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    channel: String,
    sent_at: DateTime<Utc>,
    origin: String,
    archive: String,
    size: u64,
}

/// Transport over a directory both devices can reach (a mounted share, a
/// synced folder or a removable disk).
///
/// Each payload is stored as `<millis>_<uuid>.zip` plus a `.json`
/// envelope. The envelope is written last, so a payload is only visible
/// to the receiver once it is complete.
#[derive(Debug, Clone)]
pub struct DirectoryTransport {
    root: PathBuf,
}

impl DirectoryTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn channel_dir(&self, channel: &str) -> PathBuf {
        let name = channel.trim_matches('/').replace(['/', '\\'], "_");
        if name.is_empty() {
            self.root.join("default")
        } else {
            self.root.join(name)
        }
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".part");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await
}

#[async_trait]
impl Transport for DirectoryTransport {
    async fn is_available(&self) -> bool {
        fs::create_dir_all(&self.root).await.is_ok()
    }

    async fn send(&self, payload: TransportPayload) -> Result<(), TransportError> {
        let dir = self.channel_dir(&payload.channel);
        fs::create_dir_all(&dir).await.map_err(|e| {
            warn!(dir = %dir.display(), "spool directory unreachable: {e}");
            TransportError::Unavailable
        })?;

        let stem = format!(
            "{:013}_{}",
            payload.sent_at.timestamp_millis().max(0),
            Uuid::new_v4().simple()
        );
        let archive = dir.join(format!("{stem}.zip"));
        write_atomic(&archive, &payload.bytes).await?;

        let envelope = Envelope {
            channel: payload.channel,
            sent_at: payload.sent_at,
            origin: payload.origin,
            archive: format!("{stem}.zip"),
            size: payload.bytes.len() as u64,
        };
        let json = serde_json::to_vec_pretty(&envelope)?;
        if let Err(e) = write_atomic(&dir.join(format!("{stem}.json")), &json).await {
            let _ = fs::remove_file(&archive).await;
            return Err(e.into());
        }

        debug!(archive = %archive.display(), "spooled payload");
        Ok(())
    }

    async fn receive(&self, channel: &str) -> Result<Option<TransportPayload>, TransportError> {
        let dir = self.channel_dir(channel);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut envelopes = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                envelopes.push(path);
            }
        }
        envelopes.sort();

        for envelope_path in envelopes {
            match load_payload(&dir, &envelope_path).await {
                Ok((payload, archive_path)) => {
                    fs::remove_file(&envelope_path).await?;
                    fs::remove_file(&archive_path).await?;
                    return Ok(Some(payload));
                }
                Err(e) => {
                    warn!(envelope = %envelope_path.display(), "rejecting spooled payload: {e}");
                    reject(&dir, &envelope_path).await?;
                }
            }
        }
        Ok(None)
    }
}

/// Read and validate one envelope and the archive it names.
async fn load_payload(
    dir: &Path,
    envelope_path: &Path,
) -> Result<(TransportPayload, PathBuf), TransportError> {
    let envelope: Envelope = serde_json::from_slice(&fs::read(envelope_path).await?)?;
    let archive_path = dir.join(&envelope.archive);
    if archive_path.parent() != Some(dir) {
        return Err(TransportError::Delivery(format!(
            "envelope names an archive outside the spool: {}",
            envelope.archive
        )));
    }
    let bytes = fs::read(&archive_path).await?;
    if bytes.len() as u64 != envelope.size {
        return Err(TransportError::Delivery(format!(
            "archive {} is {} bytes, envelope says {}",
            archive_path.display(),
            bytes.len(),
            envelope.size
        )));
    }

    Ok((
        TransportPayload {
            channel: envelope.channel,
            sent_at: envelope.sent_at,
            origin: envelope.origin,
            bytes,
        },
        archive_path,
    ))
}

/// Move a bad envelope, and the archive sharing its stem if present, into
/// `rejected/` so later payloads are not blocked behind it.
async fn reject(dir: &Path, envelope_path: &Path) -> io::Result<()> {
    let rejected = dir.join(REJECTED_DIR);
    fs::create_dir_all(&rejected).await?;

    for path in [envelope_path.to_path_buf(), envelope_path.with_extension("zip")] {
        let Some(name) = path.file_name() else {
            continue;
        };
        match fs::rename(&path, rejected.join(name)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_loopback_delivers_to_peer() {
        let (a, b) = LoopbackTransport::pair();
        a.send(TransportPayload::new(DEFAULT_CHANNEL, "watch", vec![1, 2, 3]))
            .await
            .unwrap();

        assert!(a.receive(DEFAULT_CHANNEL).await.unwrap().is_none());
        assert_eq!(b.pending(), 1);

        let payload = b.receive(DEFAULT_CHANNEL).await.unwrap().unwrap();
        assert_eq!(payload.bytes, vec![1, 2, 3]);
        assert_eq!(payload.origin, "watch");
        assert!(b.receive(DEFAULT_CHANNEL).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_loopback_unavailable() {
        let (a, _b) = LoopbackTransport::pair();
        a.set_available(false);
        assert!(!a.is_available().await);
        let err = a
            .send(TransportPayload::new(DEFAULT_CHANNEL, "watch", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unavailable));
    }

    #[tokio::test]
    async fn test_loopback_filters_channel() {
        let (a, b) = LoopbackTransport::pair();
        a.send(TransportPayload::new("/other", "watch", vec![9]))
            .await
            .unwrap();
        assert!(b.receive(DEFAULT_CHANNEL).await.unwrap().is_none());
        assert!(b.receive("/other").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_directory_oldest_first() {
        let tmp = TempDir::new().unwrap();
        let transport = DirectoryTransport::new(tmp.path());

        let mut first = TransportPayload::new(DEFAULT_CHANNEL, "watch", b"first".to_vec());
        first.sent_at = DateTime::from_timestamp_millis(1_000).unwrap();
        let mut second = TransportPayload::new(DEFAULT_CHANNEL, "watch", b"second".to_vec());
        second.sent_at = DateTime::from_timestamp_millis(2_000).unwrap();

        transport.send(second).await.unwrap();
        transport.send(first.clone()).await.unwrap();

        let received = transport.receive(DEFAULT_CHANNEL).await.unwrap().unwrap();
        assert_eq!(received, first);
        let received = transport.receive(DEFAULT_CHANNEL).await.unwrap().unwrap();
        assert_eq!(received.bytes, b"second".to_vec());
        assert!(transport.receive(DEFAULT_CHANNEL).await.unwrap().is_none());

        let leftovers = std::fs::read_dir(tmp.path().join("sensor-data"))
            .unwrap()
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_directory_ignores_incomplete_payload() {
        let tmp = TempDir::new().unwrap();
        let transport = DirectoryTransport::new(tmp.path());
        let dir = tmp.path().join("sensor-data");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("0000000001000_abc.zip"), b"no envelope yet").unwrap();

        assert!(transport.receive(DEFAULT_CHANNEL).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_directory_bad_envelope_set_aside() {
        let tmp = TempDir::new().unwrap();
        let transport = DirectoryTransport::new(tmp.path());
        let dir = tmp.path().join("sensor-data");
        std::fs::create_dir_all(&dir).unwrap();

        // Sorts before every real payload.
        std::fs::write(dir.join("0000000000001_bad.json"), b"{ not json").unwrap();
        std::fs::write(
            dir.join("0000000000002_short.json"),
            serde_json::to_vec(&Envelope {
                channel: DEFAULT_CHANNEL.into(),
                sent_at: Utc::now(),
                origin: "watch".into(),
                archive: "0000000000002_short.zip".into(),
                size: 999,
            })
            .unwrap(),
        )
        .unwrap();
        std::fs::write(dir.join("0000000000002_short.zip"), b"tiny").unwrap();

        transport
            .send(TransportPayload::new(DEFAULT_CHANNEL, "watch", b"good".to_vec()))
            .await
            .unwrap();

        let received = transport.receive(DEFAULT_CHANNEL).await.unwrap().unwrap();
        assert_eq!(received.bytes, b"good".to_vec());
        assert!(transport.receive(DEFAULT_CHANNEL).await.unwrap().is_none());

        let rejected = dir.join(REJECTED_DIR);
        assert!(rejected.join("0000000000001_bad.json").exists());
        assert!(rejected.join("0000000000002_short.json").exists());
        assert!(rejected.join("0000000000002_short.zip").exists());
    }
}
