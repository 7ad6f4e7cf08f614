//! Time-series storage for ingested sensor records.
//!
//! One table per sensor kind, timestamps stored as UTC milliseconds. A
//! [`Store`] is an explicitly constructed handle: clone it to share the
//! same connection between the coordinator, retention and query consumers.
//! Writes are serialized through the connection lock and every batch is a
//! single transaction, so readers only ever observe complete batches.

use crate::collector::types::SensorKind;
use crate::core::records::{Eda, HeartRate, Reading, Respiration, SensorRecord, Temperature};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("batch mixes sensor kinds ({first} and {other})")]
    MixedKinds { first: SensorKind, other: SensorKind },

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store connection lock poisoned")]
    Lock,

    #[error("store closed")]
    Closed,
}

/// How to open the store.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Database file; `None` opens a private in-memory database.
    pub path: Option<PathBuf>,
    /// Enforce one row per (kind, timestamp); repeated readings are ignored.
    pub deduplicate: bool,
}

/// Capacity of each kind's change feed. A watcher that falls further
/// behind refreshes unconditionally.
const CHANGE_FEED_CAPACITY: usize = 64;

/// Time range touched by one committed write to one kind's table.
///
/// `None` bounds are open. Watchers compare it with their own range to
/// decide whether to refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSpan {
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
}

impl BatchSpan {
    fn overlaps(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        self.first.map_or(true, |first| first <= to) && self.last.map_or(true, |last| last >= from)
    }
}

struct Inner {
    conn: Mutex<Connection>,
    config: StoreConfig,
    spans: [broadcast::Sender<BatchSpan>; 4],
}

/// Shared handle to the sensor database.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Open (creating if needed) the database described by `config`.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let conn = match &config.path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                let conn = Connection::open(path)?;
                let _ = conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;");
                conn
            }
            None => Connection::open_in_memory()?,
        };

        create_schema(&conn, config.deduplicate)?;

        info!(
            path = %config.path.as_deref().map_or_else(|| ":memory:".into(), |p| p.display().to_string()),
            deduplicate = config.deduplicate,
            "opened sensor store"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                config,
                spans: std::array::from_fn(|_| broadcast::channel(CHANGE_FEED_CAPACITY).0),
            }),
        })
    }

    /// Open a file-backed store with default settings.
    pub fn open_path(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::open(StoreConfig {
            path: Some(path.into()),
            ..StoreConfig::default()
        })
    }

    /// Open a private in-memory store.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::open(StoreConfig::default())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.inner.conn.lock().map_err(|_| StoreError::Lock)
    }

    /// Insert one batch of records of a single kind atomically.
    ///
    /// Returns the number of rows written. Ids on the input are ignored;
    /// every row receives a fresh surrogate key.
    pub fn insert_batch<R: Reading>(&self, records: &[R]) -> Result<usize, StoreError> {
        self.insert_rows(
            R::KIND,
            records.iter().map(|r| (r.timestamp(), r.values())),
        )
    }

    /// Untyped variant of [`Store::insert_batch`]. All records must share
    /// one kind.
    pub fn insert_records(&self, records: &[SensorRecord]) -> Result<usize, StoreError> {
        let Some(first) = records.first().map(SensorRecord::kind) else {
            return Ok(0);
        };
        if let Some(other) = records.iter().map(SensorRecord::kind).find(|k| *k != first) {
            return Err(StoreError::MixedKinds { first, other });
        }
        self.insert_rows(first, records.iter().map(|r| (r.timestamp(), r.values())))
    }

    fn insert_rows(
        &self,
        kind: SensorKind,
        rows: impl Iterator<Item = (DateTime<Utc>, Vec<f64>)>,
    ) -> Result<usize, StoreError> {
        let verb = if self.inner.config.deduplicate {
            "INSERT OR IGNORE"
        } else {
            "INSERT"
        };
        let columns = kind.value_columns();
        let placeholders: Vec<String> = (1..=columns.len() + 1).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "{verb} INTO {} (timestamp, {}) VALUES ({})",
            kind.as_str(),
            columns.join(", "),
            placeholders.join(", ")
        );

        let mut span = BatchSpan::default();
        let mut inserted = 0;
        {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(&sql)?;
                for (timestamp, values) in rows {
                    span.first = Some(span.first.map_or(timestamp, |f| f.min(timestamp)));
                    span.last = Some(span.last.map_or(timestamp, |l| l.max(timestamp)));

                    let mut row = Vec::with_capacity(values.len() + 1);
                    row.push(Value::Integer(timestamp.timestamp_millis()));
                    row.extend(values.into_iter().map(Value::Real));
                    inserted += stmt.execute(params_from_iter(row.iter()))?;
                }
            }
            tx.commit()?;
        }

        if inserted > 0 {
            self.notify(kind, span);
        }
        debug!(%kind, inserted, "inserted batch");
        Ok(inserted)
    }

    /// Records of type `R` with `from <= timestamp <= to`, ascending.
    pub fn range<R: Reading>(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<R>, StoreError> {
        let kind = R::KIND;
        let sql = format!(
            "SELECT id, timestamp, {} FROM {} WHERE timestamp BETWEEN ?1 AND ?2 ORDER BY timestamp, id",
            kind.value_columns().join(", "),
            kind.as_str()
        );
        let width = kind.value_columns().len();

        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(
            params![from.timestamp_millis(), to.timestamp_millis()],
            |row| {
                let id: i64 = row.get(0)?;
                let millis: i64 = row.get(1)?;
                let timestamp = DateTime::from_timestamp_millis(millis)
                    .ok_or(rusqlite::Error::IntegralValueOutOfRange(1, millis))?;
                let mut values = Vec::with_capacity(width);
                for column in 0..width {
                    values.push(row.get::<_, f64>(column + 2)?);
                }
                Ok(R::from_values(Some(id), timestamp, &values))
            },
        )?;

        let records = rows
            .filter_map(Result::transpose)
            .collect::<Result<Vec<R>, _>>()?;
        Ok(records)
    }

    /// Untyped range query for a kind chosen at runtime.
    pub fn range_records(
        &self,
        kind: SensorKind,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SensorRecord>, StoreError> {
        fn untyped<R: Reading + Into<SensorRecord>>(
            store: &Store,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> Result<Vec<SensorRecord>, StoreError> {
            Ok(store
                .range::<R>(from, to)?
                .into_iter()
                .map(Into::into)
                .collect())
        }

        match kind {
            SensorKind::HeartRate => untyped::<HeartRate>(self, from, to),
            SensorKind::Respiration => untyped::<Respiration>(self, from, to),
            SensorKind::Eda => untyped::<Eda>(self, from, to),
            SensorKind::Temperature => untyped::<Temperature>(self, from, to),
        }
    }

    /// Delete every record of every kind older than `cutoff`, in one
    /// transaction. Returns the number of rows removed.
    pub fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let millis = cutoff.timestamp_millis();
        let mut removed = [0usize; 4];
        {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            for kind in SensorKind::ALL {
                removed[kind.index()] = tx.execute(
                    &format!("DELETE FROM {} WHERE timestamp < ?1", kind.as_str()),
                    params![millis],
                )?;
            }
            tx.commit()?;
        }

        for kind in SensorKind::ALL {
            if removed[kind.index()] > 0 {
                self.notify(
                    kind,
                    BatchSpan {
                        first: None,
                        last: Some(cutoff),
                    },
                );
            }
        }

        let total = removed.iter().sum();
        info!(cutoff = %cutoff, removed = total, "deleted aged records");
        Ok(total)
    }

    /// Number of stored records of `kind`.
    pub fn count(&self, kind: SensorKind) -> Result<u64, StoreError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", kind.as_str()),
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Live view over `[from, to]` for records of type `R`.
    pub fn watch_range<R: Reading>(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> RangeWatch<R> {
        let changes = self.inner.spans[R::KIND.index()].subscribe();
        RangeWatch {
            store: self.clone(),
            from,
            to,
            changes,
            _record: PhantomData,
        }
    }

    /// Release the connection. Other live clones keep the database open
    /// until they are dropped.
    pub fn close(self) -> Result<(), StoreError> {
        match Arc::try_unwrap(self.inner) {
            Ok(inner) => {
                let conn = inner.conn.into_inner().map_err(|_| StoreError::Lock)?;
                conn.close().map_err(|(_, e)| StoreError::Database(e))
            }
            Err(_) => Ok(()),
        }
    }

    fn notify(&self, kind: SensorKind, span: BatchSpan) {
        // No watchers is not an error.
        let _ = self.inner.spans[kind.index()].send(span);
    }
}

/// Create the per-kind tables and bring the unique timestamp index in
/// line with `deduplicate`.
///
/// Turning deduplication on over a database that already holds repeated
/// timestamps keeps the oldest row of each and deletes the rest; turning
/// it off drops the index so repeated readings are accepted again.
fn create_schema(conn: &Connection, deduplicate: bool) -> Result<(), StoreError> {
    for kind in SensorKind::ALL {
        let table = kind.as_str();
        let columns: Vec<String> = kind
            .value_columns()
            .iter()
            .map(|c| format!("{c} REAL NOT NULL"))
            .collect();
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
                id INTEGER PRIMARY KEY AUTOINCREMENT, \
                timestamp INTEGER NOT NULL, \
                {});\n\
             CREATE INDEX IF NOT EXISTS {table}_timestamp ON {table}(timestamp);",
            columns.join(", ")
        ))?;

        if deduplicate {
            let removed = conn.execute(
                &format!(
                    "DELETE FROM {table} WHERE id NOT IN \
                     (SELECT MIN(id) FROM {table} GROUP BY timestamp)"
                ),
                [],
            )?;
            if removed > 0 {
                info!(%kind, removed, "removed duplicate readings before enabling deduplication");
            }
            conn.execute_batch(&format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {table}_timestamp_unique ON {table}(timestamp);"
            ))?;
        } else {
            conn.execute_batch(&format!("DROP INDEX IF EXISTS {table}_timestamp_unique;"))?;
        }
    }
    Ok(())
}

/// A range query that refreshes when matching rows are written or deleted.
pub struct RangeWatch<R> {
    store: Store,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    changes: broadcast::Receiver<BatchSpan>,
    _record: PhantomData<fn() -> R>,
}

impl<R: Reading> RangeWatch<R> {
    /// Current contents of the range.
    pub fn snapshot(&self) -> Result<Vec<R>, StoreError> {
        self.store.range::<R>(self.from, self.to)
    }

    /// Wait for the next committed batch that touches the range, then
    /// return the refreshed contents.
    ///
    /// Every batch since the previous call is considered, so a matching
    /// write is never hidden by a later non-matching one.
    pub async fn changed(&mut self) -> Result<Vec<R>, StoreError> {
        loop {
            match self.changes.recv().await {
                Ok(span) if span.overlaps(self.from, self.to) => return self.snapshot(),
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    debug!(kind = %R::KIND, missed, "range watcher lagged, refreshing");
                    return self.snapshot();
                }
                Err(RecvError::Closed) => return Err(StoreError::Closed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn hr(secs: i64, rate: f64) -> HeartRate {
        HeartRate {
            id: None,
            timestamp: at(secs),
            rate,
            confidence: 1.0,
        }
    }

    #[test]
    fn test_range_inclusive_and_ordered() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_batch(&[hr(20, 3.0), hr(0, 1.0), hr(10, 2.0)])
            .unwrap();

        let records = store.range::<HeartRate>(at(0), at(10)).unwrap();
        let rates: Vec<f64> = records.iter().map(|r| r.rate).collect();
        assert_eq!(rates, vec![1.0, 2.0]);
        assert!(records.iter().all(|r| r.id.is_some()));
    }

    #[test]
    fn test_ids_increase_and_duplicates_accepted() {
        let store = Store::open_in_memory().unwrap();
        store.insert_batch(&[hr(0, 60.0)]).unwrap();
        store.insert_batch(&[hr(0, 60.0)]).unwrap();

        let records = store.range::<HeartRate>(at(0), at(0)).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].id < records[1].id);
    }

    #[test]
    fn test_deduplicate_ignores_repeats() {
        let store = Store::open(StoreConfig {
            path: None,
            deduplicate: true,
        })
        .unwrap();
        assert_eq!(store.insert_batch(&[hr(0, 60.0), hr(1, 61.0)]).unwrap(), 2);
        assert_eq!(store.insert_batch(&[hr(0, 60.0), hr(2, 62.0)]).unwrap(), 1);
        assert_eq!(store.count(SensorKind::HeartRate).unwrap(), 3);
    }

    #[test]
    fn test_deduplicate_can_be_toggled() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("sensors.db");
        let open = |deduplicate| {
            Store::open(StoreConfig {
                path: Some(path.clone()),
                deduplicate,
            })
            .unwrap()
        };

        let store = open(true);
        store.insert_batch(&[hr(0, 60.0)]).unwrap();
        store.close().unwrap();

        // Off: repeated timestamps are accepted again.
        let store = open(false);
        assert_eq!(store.insert_batch(&[hr(0, 60.0), hr(0, 61.0)]).unwrap(), 2);
        assert_eq!(store.count(SensorKind::HeartRate).unwrap(), 3);
        store.close().unwrap();

        // On again over existing duplicates: the oldest row survives.
        let store = open(true);
        let records = store.range::<HeartRate>(at(0), at(0)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].rate, 60.0);
        assert_eq!(store.insert_batch(&[hr(0, 62.0)]).unwrap(), 0);
    }

    #[test]
    fn test_delete_before_all_kinds() {
        let store = Store::open_in_memory().unwrap();
        store.insert_batch(&[hr(0, 60.0), hr(30, 61.0)]).unwrap();
        store
            .insert_batch(&[
                Eda {
                    id: None,
                    timestamp: at(5),
                    conductance: 1.0,
                },
                Eda {
                    id: None,
                    timestamp: at(30),
                    conductance: 2.0,
                },
            ])
            .unwrap();

        let removed = store.delete_before(at(30)).unwrap();
        assert_eq!(removed, 2);

        let hr_left = store.range::<HeartRate>(at(-100), at(100)).unwrap();
        let eda_left = store.range::<Eda>(at(-100), at(100)).unwrap();
        assert_eq!(hr_left.len(), 1);
        assert_eq!(eda_left.len(), 1);
        assert!(hr_left.iter().all(|r| r.timestamp >= at(30)));
        assert!(eda_left.iter().all(|r| r.timestamp >= at(30)));
    }

    #[test]
    fn test_mixed_kinds_rejected() {
        let store = Store::open_in_memory().unwrap();
        let records = vec![
            SensorRecord::from(hr(0, 60.0)),
            SensorRecord::from(Temperature {
                id: None,
                timestamp: at(0),
                value: 36.5,
            }),
        ];
        let err = store.insert_records(&records).unwrap_err();
        assert!(matches!(err, StoreError::MixedKinds { .. }));
        assert_eq!(store.count(SensorKind::HeartRate).unwrap(), 0);
    }

    #[test]
    fn test_range_records_untyped() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_records(&[SensorRecord::from(Respiration {
                id: None,
                timestamp: at(0),
                rate: 15.0,
                inter_beat_interval: 4.0,
            })])
            .unwrap();
        let records = store
            .range_records(SensorKind::Respiration, at(0), at(0))
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].values(), vec![15.0, 4.0]);
    }

    #[test]
    fn test_file_store_persists() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("db").join("sensors.db");
        {
            let store = Store::open_path(&path).unwrap();
            store.insert_batch(&[hr(0, 70.0)]).unwrap();
            store.close().unwrap();
        }
        let store = Store::open_path(&path).unwrap();
        assert_eq!(store.count(SensorKind::HeartRate).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_watch_sees_overlapping_inserts() {
        let store = Store::open_in_memory().unwrap();
        let mut watch = store.watch_range::<HeartRate>(at(0), at(60));
        assert!(watch.snapshot().unwrap().is_empty());

        // Outside the range: must not wake the watcher.
        store.insert_batch(&[hr(500, 80.0)]).unwrap();
        let woke = tokio::time::timeout(std::time::Duration::from_millis(50), watch.changed()).await;
        assert!(woke.is_err());

        let writer = store.clone();
        tokio::spawn(async move {
            writer.insert_batch(&[hr(30, 75.0)]).unwrap();
        });

        let records = watch.changed().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].rate, 75.0);
    }

    #[tokio::test]
    async fn test_watch_not_hidden_by_later_outside_insert() {
        let store = Store::open_in_memory().unwrap();
        let mut watch = store.watch_range::<HeartRate>(at(0), at(60));

        store.insert_batch(&[hr(30, 75.0)]).unwrap();
        store.insert_batch(&[hr(500, 80.0)]).unwrap();

        let records = tokio::time::timeout(std::time::Duration::from_millis(200), watch.changed())
            .await
            .expect("in-range insert was not observed")
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].rate, 75.0);
    }

    #[tokio::test]
    async fn test_lagging_watch_refreshes() {
        let store = Store::open_in_memory().unwrap();
        let mut watch = store.watch_range::<HeartRate>(at(0), at(60));

        store.insert_batch(&[hr(10, 70.0)]).unwrap();
        for i in 0..(CHANGE_FEED_CAPACITY as i64 + 8) {
            store.insert_batch(&[hr(1_000 + i, 80.0)]).unwrap();
        }

        let records = watch.changed().await.unwrap();
        assert_eq!(records.len(), 1);
    }
}
