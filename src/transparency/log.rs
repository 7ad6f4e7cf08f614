//! Pipeline transparency log.
//!
//! Counts what the pipeline has collected, shipped and ingested so a user
//! can audit it at any time. Only counters are kept, never sample values.

use crate::collector::types::SensorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Running pipeline counters for the current session.
#[derive(Debug)]
pub struct PipelineLog {
    /// Readings appended to each sensor log, indexed by `SensorKind::index`
    readings_written: [AtomicU64; 4],
    /// Packages handed to the transport
    packages_sent: AtomicU64,
    /// Packages taken from the transport
    packages_received: AtomicU64,
    /// Rows written to the store
    records_ingested: AtomicU64,
    /// Malformed log lines dropped by the parser
    lines_skipped: AtomicU64,
    /// Sync attempts that ended in an error
    sync_failures: AtomicU64,
    session_start: DateTime<Utc>,
    persist_path: Option<PathBuf>,
}

impl PipelineLog {
    pub fn new() -> Self {
        Self {
            readings_written: Default::default(),
            packages_sent: AtomicU64::new(0),
            packages_received: AtomicU64::new(0),
            records_ingested: AtomicU64::new(0),
            lines_skipped: AtomicU64::new(0),
            sync_failures: AtomicU64::new(0),
            session_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Create a log backed by a JSON file, picking up previous totals.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut log = Self::new();
        log.persist_path = Some(path);

        if let Err(e) = log.load() {
            warn!("could not load previous pipeline stats: {e}");
        }

        log
    }

    pub fn record_reading(&self, kind: SensorKind) {
        self.readings_written[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_package_sent(&self) {
        self.packages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_package_received(&self) {
        self.packages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ingested(&self, records: u64, skipped: u64) {
        self.records_ingested.fetch_add(records, Ordering::Relaxed);
        self.lines_skipped.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn record_sync_failure(&self) {
        self.sync_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> PipelineStats {
        let readings = |kind: SensorKind| self.readings_written[kind.index()].load(Ordering::Relaxed);
        PipelineStats {
            heart_rate_readings: readings(SensorKind::HeartRate),
            respiration_readings: readings(SensorKind::Respiration),
            eda_readings: readings(SensorKind::Eda),
            temperature_readings: readings(SensorKind::Temperature),
            packages_sent: self.packages_sent.load(Ordering::Relaxed),
            packages_received: self.packages_received.load(Ordering::Relaxed),
            records_ingested: self.records_ingested.load(Ordering::Relaxed),
            lines_skipped: self.lines_skipped.load(Ordering::Relaxed),
            sync_failures: self.sync_failures.load(Ordering::Relaxed),
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds().max(0) as u64,
        }
    }

    /// Human-readable summary for the `status` command.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        format!(
            "Pipeline Statistics:\n\
             - Heart rate readings logged: {}\n\
             - Respiration readings logged: {}\n\
             - EDA readings logged: {}\n\
             - Temperature readings logged: {}\n\
             - Packages sent: {}\n\
             - Packages received: {}\n\
             - Records ingested: {}\n\
             - Malformed lines skipped: {}\n\
             - Failed sync attempts: {}\n\
             - Session duration: {} seconds",
            stats.heart_rate_readings,
            stats.respiration_readings,
            stats.eda_readings,
            stats.temperature_readings,
            stats.packages_sent,
            stats.packages_received,
            stats.records_ingested,
            stats.lines_skipped,
            stats.sync_failures,
            stats.session_duration_secs
        )
    }

    /// Save counters to disk. A log without a backing file does nothing.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let persisted = PersistedStats {
                stats: self.stats(),
                last_updated: Utc::now(),
            };
            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;
            std::fs::write(path, json)?;
            debug!(path = %path.display(), "saved pipeline stats");
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let persisted: PersistedStats =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;
                let s = persisted.stats;

                for (kind, value) in [
                    (SensorKind::HeartRate, s.heart_rate_readings),
                    (SensorKind::Respiration, s.respiration_readings),
                    (SensorKind::Eda, s.eda_readings),
                    (SensorKind::Temperature, s.temperature_readings),
                ] {
                    self.readings_written[kind.index()].store(value, Ordering::Relaxed);
                }
                self.packages_sent.store(s.packages_sent, Ordering::Relaxed);
                self.packages_received
                    .store(s.packages_received, Ordering::Relaxed);
                self.records_ingested
                    .store(s.records_ingested, Ordering::Relaxed);
                self.lines_skipped.store(s.lines_skipped, Ordering::Relaxed);
                self.sync_failures.store(s.sync_failures, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    pub fn reset(&self) {
        for counter in &self.readings_written {
            counter.store(0, Ordering::Relaxed);
        }
        self.packages_sent.store(0, Ordering::Relaxed);
        self.packages_received.store(0, Ordering::Relaxed);
        self.records_ingested.store(0, Ordering::Relaxed);
        self.lines_skipped.store(0, Ordering::Relaxed);
        self.sync_failures.store(0, Ordering::Relaxed);
    }
}

impl Default for PipelineLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of the pipeline counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStats {
    pub heart_rate_readings: u64,
    pub respiration_readings: u64,
    pub eda_readings: u64,
    pub temperature_readings: u64,
    pub packages_sent: u64,
    pub packages_received: u64,
    pub records_ingested: u64,
    pub lines_skipped: u64,
    pub sync_failures: u64,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    #[serde(flatten)]
    stats: PipelineStats,
    last_updated: DateTime<Utc>,
}

/// Thread-safe shared pipeline log.
pub type SharedPipelineLog = Arc<PipelineLog>;

pub fn create_shared_log() -> SharedPipelineLog {
    Arc::new(PipelineLog::new())
}

pub fn create_shared_log_with_persistence(path: PathBuf) -> SharedPipelineLog {
    Arc::new(PipelineLog::with_persistence(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_log_counting() {
        let log = PipelineLog::new();

        log.record_reading(SensorKind::Eda);
        log.record_reading(SensorKind::Eda);
        log.record_reading(SensorKind::Respiration);
        log.record_ingested(10, 2);

        let stats = log.stats();
        assert_eq!(stats.eda_readings, 2);
        assert_eq!(stats.respiration_readings, 1);
        assert_eq!(stats.heart_rate_readings, 0);
        assert_eq!(stats.records_ingested, 10);
        assert_eq!(stats.lines_skipped, 2);
    }

    #[test]
    fn test_pipeline_log_reset() {
        let log = PipelineLog::new();

        log.record_package_sent();
        log.record_sync_failure();
        log.reset();

        let stats = log.stats();
        assert_eq!(stats.packages_sent, 0);
        assert_eq!(stats.sync_failures, 0);
    }

    #[test]
    fn test_persistence_round_trip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("stats").join("pipeline.json");

        let log = PipelineLog::with_persistence(path.clone());
        log.record_package_received();
        log.record_reading(SensorKind::Temperature);
        log.save().unwrap();

        let reloaded = PipelineLog::with_persistence(path);
        let stats = reloaded.stats();
        assert_eq!(stats.packages_received, 1);
        assert_eq!(stats.temperature_readings, 1);
    }

    #[test]
    fn test_summary_format() {
        let summary = PipelineLog::new().summary();
        assert!(summary.contains("Packages sent"));
        assert!(summary.contains("Malformed lines skipped"));
    }
}
