//! Sensor kinds and the raw readings produced for them.
//!
//! A [`Measurement`] is the value part of one reading. The timestamp is
//! assigned by the writer at the moment the reading is appended to its log.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The four physiological streams collected on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    HeartRate,
    Respiration,
    Eda,
    Temperature,
}

impl SensorKind {
    /// Every kind, in log/archive order.
    pub const ALL: [SensorKind; 4] = [
        SensorKind::HeartRate,
        SensorKind::Respiration,
        SensorKind::Eda,
        SensorKind::Temperature,
    ];

    /// Dense index, usable for per-kind arrays.
    pub fn index(self) -> usize {
        match self {
            SensorKind::HeartRate => 0,
            SensorKind::Respiration => 1,
            SensorKind::Eda => 2,
            SensorKind::Temperature => 3,
        }
    }

    /// Name of the per-sensor log file, also used as the archive entry name.
    pub fn file_name(self) -> &'static str {
        match self {
            SensorKind::HeartRate => "heart_rate.csv",
            SensorKind::Respiration => "respiration_rate.csv",
            SensorKind::Eda => "eda.csv",
            SensorKind::Temperature => "temperature.csv",
        }
    }

    /// Header line written once at the top of an empty log.
    pub fn csv_header(self) -> &'static str {
        match self {
            SensorKind::HeartRate => "timestamp,heart_rate,confidence_score",
            SensorKind::Respiration => "timestamp,respiration_rate,ibi",
            SensorKind::Eda => "timestamp,eda_value",
            SensorKind::Temperature => "timestamp,temp_value",
        }
    }

    /// Names of the numeric columns, in log order (the header minus `timestamp`).
    pub fn value_columns(self) -> &'static [&'static str] {
        match self {
            SensorKind::HeartRate => &["heart_rate", "confidence_score"],
            SensorKind::Respiration => &["respiration_rate", "ibi"],
            SensorKind::Eda => &["eda_value"],
            SensorKind::Temperature => &["temp_value"],
        }
    }

    /// Minimum number of delimited fields a log line needs to be decodable.
    pub fn min_fields(self) -> usize {
        1 + self.value_columns().len()
    }

    /// Stable lower_snake_case name, also the store table name.
    pub fn as_str(self) -> &'static str {
        match self {
            SensorKind::HeartRate => "heart_rate",
            SensorKind::Respiration => "respiration_rate",
            SensorKind::Eda => "eda",
            SensorKind::Temperature => "temperature",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "heart_rate" | "heartrate" | "hr" => Ok(SensorKind::HeartRate),
            "respiration" | "respiration_rate" | "resp" => Ok(SensorKind::Respiration),
            "eda" => Ok(SensorKind::Eda),
            "temperature" | "temp" => Ok(SensorKind::Temperature),
            other => Err(format!(
                "unknown sensor kind '{other}' (expected heart_rate, respiration, eda or temperature)"
            )),
        }
    }
}

/// The values of a single reading, without its timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Measurement {
    HeartRate { rate: f64, confidence: f64 },
    Respiration { rate: f64, inter_beat_interval: f64 },
    Eda { conductance: f64 },
    Temperature { value: f64 },
}

impl Measurement {
    /// Build a heart-rate reading from raw hardware values.
    ///
    /// The first value is the rate; the optional second is the sensor's
    /// confidence, which defaults to 1.0 when the hardware omits it.
    pub fn heart_rate_from_values(values: &[f64]) -> Option<Self> {
        let rate = *values.first()?;
        let confidence = values.get(1).copied().unwrap_or(1.0);
        Some(Measurement::HeartRate { rate, confidence })
    }

    /// Build a temperature reading from raw hardware values.
    pub fn temperature_from_values(values: &[f64]) -> Option<Self> {
        values
            .first()
            .map(|&value| Measurement::Temperature { value })
    }

    /// Which log stream this reading belongs to.
    pub fn kind(&self) -> SensorKind {
        match self {
            Measurement::HeartRate { .. } => SensorKind::HeartRate,
            Measurement::Respiration { .. } => SensorKind::Respiration,
            Measurement::Eda { .. } => SensorKind::Eda,
            Measurement::Temperature { .. } => SensorKind::Temperature,
        }
    }

    /// Numeric fields in log column order.
    pub fn values(&self) -> Vec<f64> {
        match *self {
            Measurement::HeartRate { rate, confidence } => vec![rate, confidence],
            Measurement::Respiration {
                rate,
                inter_beat_interval,
            } => vec![rate, inter_beat_interval],
            Measurement::Eda { conductance } => vec![conductance],
            Measurement::Temperature { value } => vec![value],
        }
    }

    /// Format as one comma-delimited log line (no trailing newline).
    pub fn to_csv_line(&self, at: DateTime<Utc>) -> String {
        let mut line = format_timestamp(at);
        for value in self.values() {
            line.push(',');
            line.push_str(&value.to_string());
        }
        line
    }
}

/// ISO-8601 instant with millisecond precision and a `Z` suffix.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_min_fields_per_kind() {
        assert_eq!(SensorKind::HeartRate.min_fields(), 3);
        assert_eq!(SensorKind::Respiration.min_fields(), 3);
        assert_eq!(SensorKind::Eda.min_fields(), 2);
        assert_eq!(SensorKind::Temperature.min_fields(), 2);
    }

    #[test]
    fn test_header_matches_columns() {
        for kind in SensorKind::ALL {
            let expected = format!("timestamp,{}", kind.value_columns().join(","));
            assert_eq!(kind.csv_header(), expected);
        }
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("hr".parse::<SensorKind>(), Ok(SensorKind::HeartRate));
        assert_eq!(
            "respiration_rate".parse::<SensorKind>(),
            Ok(SensorKind::Respiration)
        );
        assert_eq!("EDA".parse::<SensorKind>(), Ok(SensorKind::Eda));
        assert!("pressure".parse::<SensorKind>().is_err());
    }

    #[test]
    fn test_csv_line_format() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let line = Measurement::HeartRate {
            rate: 72.5,
            confidence: 0.95,
        }
        .to_csv_line(at);
        assert_eq!(line, "2024-01-01T10:00:00.000Z,72.5,0.95");
    }

    #[test]
    fn test_heart_rate_confidence_default() {
        let m = Measurement::heart_rate_from_values(&[64.0]).unwrap();
        assert_eq!(
            m,
            Measurement::HeartRate {
                rate: 64.0,
                confidence: 1.0
            }
        );
        assert!(Measurement::heart_rate_from_values(&[]).is_none());
    }
}
