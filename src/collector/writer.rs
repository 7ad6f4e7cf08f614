//! Durable per-sensor append logs.
//!
//! Each sensor kind owns one log stream guarded by its own lock, so
//! concurrent callbacks for the same kind are serialized line by line
//! while different kinds never contend. Every line is flushed before
//! `record` returns.

use crate::collector::producer::{AlwaysGranted, PermissionGate, Produced, Producer};
use crate::collector::types::{Measurement, SensorKind};
use crate::transparency::SharedPipelineLog;
use chrono::Utc;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// How long a driver thread waits on its producer before rechecking
/// whether collection is still active.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors that can occur during collection.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("collection is already running")]
    AlreadyRunning,

    #[error("permission to read body sensors has not been granted")]
    PermissionDenied,

    #[error("collection is not running")]
    NotCollecting,

    #[error("sensor log I/O error: {0}")]
    Io(#[from] io::Error),
}

type Stream = BufWriter<File>;

struct WriterInner {
    data_dir: PathBuf,
    streams: [Mutex<Option<Stream>>; 4],
    active: AtomicBool,
    gate: Box<dyn PermissionGate>,
    log: Option<SharedPipelineLog>,
}

/// Locks are recovered after a panic: a poisoned stream at worst holds a
/// partially written line, which the parser drops.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl WriterInner {
    fn record(&self, measurement: &Measurement) -> Result<(), CollectorError> {
        let kind = measurement.kind();
        {
            let mut slot = lock(&self.streams[kind.index()]);
            let stream = slot.as_mut().ok_or(CollectorError::NotCollecting)?;
            // Timestamp is taken under the lock so lines are in time order.
            let line = measurement.to_csv_line(Utc::now());
            writeln!(stream, "{line}")?;
            stream.flush()?;
        }

        if let Some(log) = &self.log {
            log.record_reading(kind);
        }
        Ok(())
    }

    fn open_streams(&self) -> Result<(), CollectorError> {
        fs::create_dir_all(&self.data_dir)?;
        for kind in SensorKind::ALL {
            let stream = open_log(&self.data_dir.join(kind.file_name()), kind)?;
            *lock(&self.streams[kind.index()]) = Some(stream);
        }
        Ok(())
    }

    fn close_streams(&self) -> Result<(), CollectorError> {
        let mut first_error = None;
        for slot in &self.streams {
            if let Some(mut stream) = lock(slot).take() {
                let closed = stream.flush().and_then(|()| stream.get_ref().sync_all());
                if let Err(e) = closed {
                    warn!("failed to close sensor log: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

/// Open a log for appending, writing the header only into an empty file.
fn open_log(path: &Path, kind: SensorKind) -> io::Result<Stream> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let empty = file.metadata()?.len() == 0;
    let mut stream = BufWriter::new(file);
    if empty {
        writeln!(stream, "{}", kind.csv_header())?;
        stream.flush()?;
    }
    Ok(stream)
}

/// Appends readings to `heart_rate.csv`, `respiration_rate.csv`, `eda.csv`
/// and `temperature.csv` in a data directory.
pub struct SampleWriter {
    inner: Arc<WriterInner>,
    /// Driver threads; the lock also serializes start and stop.
    drivers: Mutex<Vec<JoinHandle<()>>>,
}

/// Builder for [`SampleWriter`].
pub struct SampleWriterBuilder {
    data_dir: PathBuf,
    gate: Box<dyn PermissionGate>,
    log: Option<SharedPipelineLog>,
}

impl SampleWriterBuilder {
    pub fn permission_gate(mut self, gate: impl PermissionGate + 'static) -> Self {
        self.gate = Box::new(gate);
        self
    }

    pub fn log(mut self, log: SharedPipelineLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn build(self) -> SampleWriter {
        SampleWriter {
            inner: Arc::new(WriterInner {
                data_dir: self.data_dir,
                streams: Default::default(),
                active: AtomicBool::new(false),
                gate: self.gate,
                log: self.log,
            }),
            drivers: Mutex::new(Vec::new()),
        }
    }
}

impl SampleWriter {
    pub fn builder(data_dir: impl Into<PathBuf>) -> SampleWriterBuilder {
        SampleWriterBuilder {
            data_dir: data_dir.into(),
            gate: Box::new(AlwaysGranted),
            log: None,
        }
    }

    /// Writer with no permission gate and no transparency log.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self::builder(data_dir).build()
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.data_dir
    }

    pub fn is_collecting(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Open the logs and start one driver thread per producer.
    ///
    /// Fails with `PermissionDenied` if the gate refuses and with
    /// `AlreadyRunning` if collection is active; neither changes any state.
    pub fn start_collection(&self, producers: Vec<Box<dyn Producer>>) -> Result<(), CollectorError> {
        let mut drivers = lock(&self.drivers);

        if !self.inner.gate.sensors_granted() {
            warn!("sensor permission not granted, collection not started");
            return Err(CollectorError::PermissionDenied);
        }

        if self
            .inner
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CollectorError::AlreadyRunning);
        }

        if let Err(e) = self.inner.open_streams() {
            let _ = self.inner.close_streams();
            self.inner.active.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let names: Vec<String> = producers.iter().map(|p| p.name().to_string()).collect();
        for producer in producers {
            let inner = Arc::clone(&self.inner);
            drivers.push(thread::spawn(move || drive(inner, producer)));
        }

        info!(
            data_dir = %self.inner.data_dir.display(),
            producers = ?names,
            "collection started"
        );
        Ok(())
    }

    /// Append one reading to its log. Used directly by sensor callbacks
    /// and by the driver threads.
    pub fn record(&self, measurement: Measurement) -> Result<(), CollectorError> {
        self.inner.record(&measurement)
    }

    /// Stop all producers, then flush and close every log.
    ///
    /// When this returns no further write can land in any log. Calling it
    /// while collection is stopped does nothing.
    pub fn stop_collection(&self) -> Result<(), CollectorError> {
        let mut drivers = lock(&self.drivers);

        if self
            .inner
            .active
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        for handle in drivers.drain(..) {
            if handle.join().is_err() {
                warn!("producer thread panicked");
            }
        }

        let closed = self.inner.close_streams();
        info!("collection stopped");
        closed
    }
}

impl Drop for SampleWriter {
    fn drop(&mut self) {
        if let Err(e) = self.stop_collection() {
            warn!("error while stopping collection: {e}");
        }
    }
}

fn drive(inner: Arc<WriterInner>, mut producer: Box<dyn Producer>) {
    debug!(producer = producer.name(), "producer thread started");

    'poll: while inner.active.load(Ordering::SeqCst) {
        match producer.produce(POLL_INTERVAL) {
            Produced::Readings(readings) => {
                for measurement in &readings {
                    match inner.record(measurement) {
                        Ok(()) => {}
                        Err(CollectorError::NotCollecting) => break 'poll,
                        Err(e) => warn!(producer = producer.name(), "dropped reading: {e}"),
                    }
                }
            }
            Produced::Idle => {}
            Produced::Exhausted => {
                info!(producer = producer.name(), "producer exhausted");
                break;
            }
        }
    }

    debug!(producer = producer.name(), "producer thread finished");
}
