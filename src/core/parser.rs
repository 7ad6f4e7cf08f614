//! Tolerant decoder for per-sensor CSV logs.
//!
//! The first line of a log is always treated as the header and skipped.
//! Every later line that is short, has an unparseable timestamp, or has a
//! non-numeric value is dropped on its own; the rest of the file is still
//! decoded.

use crate::collector::types::SensorKind;
use crate::core::records::{Eda, HeartRate, Reading, Respiration, SensorRecord, Temperature};
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::marker::PhantomData;
use std::path::Path;
use tracing::debug;

/// Field delimiter of the log format.
pub const DELIMITER: char = ',';

/// One-pass iterator over the records of a log.
///
/// A line that is not valid UTF-8 is skipped like any other malformed
/// line. A read error ends iteration early; it is kept and can be
/// retrieved with [`RecordReader::take_error`] so callers can tell
/// truncation from a clean end of file.
pub struct RecordReader<R, B = BufReader<File>> {
    source: B,
    buf: Vec<u8>,
    line_no: usize,
    skipped: usize,
    error: Option<io::Error>,
    _record: PhantomData<fn() -> R>,
}

impl<R: Reading> RecordReader<R> {
    /// Open a log file for decoding.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: Reading, B: BufRead> RecordReader<R, B> {
    /// Decode from any buffered source. The header line is consumed lazily
    /// on the first call to `next`.
    pub fn new(source: B) -> Self {
        Self {
            source,
            buf: Vec::new(),
            line_no: 0,
            skipped: 0,
            error: None,
            _record: PhantomData,
        }
    }

    /// Number of data lines dropped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// The read error that ended iteration, if any.
    pub fn take_error(&mut self) -> Option<io::Error> {
        self.error.take()
    }
}

impl<R: Reading, B: BufRead> Iterator for RecordReader<R, B> {
    type Item = R;

    fn next(&mut self) -> Option<R> {
        loop {
            self.buf.clear();
            match self.source.read_until(b'\n', &mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => {
                    self.error = Some(e);
                    return None;
                }
            }
            self.line_no += 1;

            if self.line_no == 1 {
                continue;
            }

            let parsed = std::str::from_utf8(&self.buf)
                .ok()
                .map(|line| line.trim_end_matches(['\n', '\r']))
                .and_then(parse_line::<R>);
            match parsed {
                Some(record) => return Some(record),
                None => {
                    self.skipped += 1;
                    debug!(
                        kind = %R::KIND,
                        line = self.line_no,
                        "skipping malformed log line"
                    );
                }
            }
        }
    }
}

/// Decode a single data line.
pub fn parse_line<R: Reading>(line: &str) -> Option<R> {
    let fields: Vec<&str> = line.split(DELIMITER).collect();
    let min_fields = R::KIND.min_fields();
    if fields.len() < min_fields {
        return None;
    }

    let timestamp = parse_timestamp(fields[0])?;
    let values = fields[1..min_fields]
        .iter()
        .map(|field| parse_value(field))
        .collect::<Option<Vec<f64>>>()?;

    R::from_values(None, timestamp, &values)
}

/// Parse an ISO-8601 instant into UTC.
pub fn parse_timestamp(field: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(field.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn parse_value(field: &str) -> Option<f64> {
    field
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

/// Decode a whole log of the given kind into untyped records.
///
/// Returns the records and the number of malformed lines skipped. A read
/// error part way through the file is returned rather than truncating
/// the result silently.
pub fn parse_records(path: &Path, kind: SensorKind) -> io::Result<(Vec<SensorRecord>, usize)> {
    fn decode<R: Reading + Into<SensorRecord>>(path: &Path) -> io::Result<(Vec<SensorRecord>, usize)> {
        let mut reader = RecordReader::<R>::open(path)?;
        let records: Vec<SensorRecord> = reader.by_ref().map(Into::into).collect();
        match reader.take_error() {
            Some(e) => Err(e),
            None => Ok((records, reader.skipped())),
        }
    }

    match kind {
        SensorKind::HeartRate => decode::<HeartRate>(path),
        SensorKind::Respiration => decode::<Respiration>(path),
        SensorKind::Eda => decode::<Eda>(path),
        SensorKind::Temperature => decode::<Temperature>(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Cursor;

    fn reader<R: Reading>(text: &str) -> RecordReader<R, Cursor<Vec<u8>>> {
        RecordReader::new(Cursor::new(text.as_bytes().to_vec()))
    }

    #[test]
    fn test_skips_malformed_line() {
        let text = "timestamp,heart_rate,confidence_score\n\
                    2024-01-01T10:00:00Z,72.5,0.95\n\
                    BADLINE\n\
                    2024-01-01T10:00:02Z,73.0,0.90";
        let mut reader = reader::<HeartRate>(text);
        let records: Vec<HeartRate> = reader.by_ref().collect();

        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0].timestamp,
            Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(records[0].rate, 72.5);
        assert_eq!(records[1].confidence, 0.90);
        assert_eq!(reader.skipped(), 1);
        assert!(reader.take_error().is_none());
    }

    #[test]
    fn test_header_skipped_unconditionally() {
        // A data-looking first line is still treated as the header.
        let text = "2024-01-01T10:00:00Z,1.5\n2024-01-01T10:00:01Z,1.6\n";
        let records: Vec<Eda> = reader::<Eda>(text).collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].conductance, 1.6);
    }

    #[test]
    fn test_field_count_minimum() {
        let text = "timestamp,respiration_rate,ibi\n\
                    2024-01-01T10:00:00Z,14.0\n\
                    2024-01-01T10:00:01Z,15.0,4.0\n";
        let mut reader = reader::<Respiration>(text);
        let records: Vec<Respiration> = reader.by_ref().collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].inter_beat_interval, 4.0);
        assert_eq!(reader.skipped(), 1);
    }

    #[test]
    fn test_bad_timestamp_and_value() {
        let text = "timestamp,temp_value\n\
                    yesterday,36.5\n\
                    2024-01-01T10:00:00Z,warm\n\
                    2024-01-01T10:00:01Z,NaN\n\
                    2024-01-01T10:00:02Z,36.7\n";
        let records: Vec<Temperature> = reader::<Temperature>(text).collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, 36.7);
    }

    #[test]
    fn test_extra_fields_and_whitespace() {
        let text = "timestamp,eda_value\r\n 2024-01-01T10:00:00.250Z , 2.25 ,extra\r\n";
        let records: Vec<Eda> = reader::<Eda>(text).collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].conductance, 2.25);
        assert_eq!(records[0].timestamp.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn test_offset_timestamp_normalized_to_utc() {
        let line = "2024-01-01T12:00:00+02:00,20.0";
        let record = parse_line::<Temperature>(line).unwrap();
        assert_eq!(
            record.timestamp,
            Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_records_untyped() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("heart_rate.csv");
        std::fs::write(
            &path,
            "timestamp,heart_rate,confidence_score\n2024-01-01T10:00:00Z,60,1\n",
        )
        .unwrap();

        let (records, skipped) = parse_records(&path, SensorKind::HeartRate).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(skipped, 0);
        assert_eq!(records[0].kind(), SensorKind::HeartRate);
    }

    #[test]
    fn test_invalid_utf8_line_skipped() {
        let mut bytes = b"timestamp,heart_rate,confidence_score\n\
                          2024-01-01T10:00:00Z,72.5,0.95\n"
            .to_vec();
        bytes.extend_from_slice(b"\xff\xfe garbage\n");
        bytes.extend_from_slice(b"2024-01-01T10:00:02Z,73.0,0.90\n");

        let mut reader = RecordReader::<HeartRate, _>::new(Cursor::new(bytes));
        let records: Vec<HeartRate> = reader.by_ref().collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].rate, 73.0);
        assert_eq!(reader.skipped(), 1);
        assert!(reader.take_error().is_none());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = RecordReader::<Eda>::open(Path::new("/nonexistent/eda.csv"));
        assert!(result.is_err());
    }
}
