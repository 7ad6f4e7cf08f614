//! Typed sensor records as decoded from logs and persisted by the store.

use crate::collector::types::SensorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Shared shape of the four record types.
///
/// `values` and `from_values` use the column order of the sensor's log
/// header, which is also the store's column order.
pub trait Reading: Sized + Clone + Send + Sync + 'static {
    /// The sensor stream this record type belongs to.
    const KIND: SensorKind;

    /// Store-assigned surrogate id; `None` until persisted.
    fn id(&self) -> Option<i64>;

    /// Absolute instant of the reading.
    fn timestamp(&self) -> DateTime<Utc>;

    /// Numeric fields in column order.
    fn values(&self) -> Vec<f64>;

    /// Rebuild a record from its parts. Returns `None` if `values` has the
    /// wrong arity.
    fn from_values(id: Option<i64>, timestamp: DateTime<Utc>, values: &[f64]) -> Option<Self>;
}

/// Heart rate in beats per minute with the sensor's confidence score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartRate {
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub rate: f64,
    pub confidence: f64,
}

/// Respiration rate in breaths per minute with the inter-beat interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Respiration {
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub rate: f64,
    pub inter_beat_interval: f64,
}

/// Electrodermal activity (skin conductance, microsiemens).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Eda {
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub conductance: f64,
}

/// Skin or ambient temperature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Temperature {
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl Reading for HeartRate {
    const KIND: SensorKind = SensorKind::HeartRate;

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn values(&self) -> Vec<f64> {
        vec![self.rate, self.confidence]
    }

    fn from_values(id: Option<i64>, timestamp: DateTime<Utc>, values: &[f64]) -> Option<Self> {
        match *values {
            [rate, confidence] => Some(Self {
                id,
                timestamp,
                rate,
                confidence,
            }),
            _ => None,
        }
    }
}

impl Reading for Respiration {
    const KIND: SensorKind = SensorKind::Respiration;

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn values(&self) -> Vec<f64> {
        vec![self.rate, self.inter_beat_interval]
    }

    fn from_values(id: Option<i64>, timestamp: DateTime<Utc>, values: &[f64]) -> Option<Self> {
        match *values {
            [rate, inter_beat_interval] => Some(Self {
                id,
                timestamp,
                rate,
                inter_beat_interval,
            }),
            _ => None,
        }
    }
}

impl Reading for Eda {
    const KIND: SensorKind = SensorKind::Eda;

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn values(&self) -> Vec<f64> {
        vec![self.conductance]
    }

    fn from_values(id: Option<i64>, timestamp: DateTime<Utc>, values: &[f64]) -> Option<Self> {
        match *values {
            [conductance] => Some(Self {
                id,
                timestamp,
                conductance,
            }),
            _ => None,
        }
    }
}

impl Reading for Temperature {
    const KIND: SensorKind = SensorKind::Temperature;

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn values(&self) -> Vec<f64> {
        vec![self.value]
    }

    fn from_values(id: Option<i64>, timestamp: DateTime<Utc>, values: &[f64]) -> Option<Self> {
        match *values {
            [value] => Some(Self {
                id,
                timestamp,
                value,
            }),
            _ => None,
        }
    }
}

/// A record of any sensor kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SensorRecord {
    HeartRate(HeartRate),
    Respiration(Respiration),
    Eda(Eda),
    Temperature(Temperature),
}

impl SensorRecord {
    pub fn kind(&self) -> SensorKind {
        match self {
            SensorRecord::HeartRate(_) => SensorKind::HeartRate,
            SensorRecord::Respiration(_) => SensorKind::Respiration,
            SensorRecord::Eda(_) => SensorKind::Eda,
            SensorRecord::Temperature(_) => SensorKind::Temperature,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            SensorRecord::HeartRate(r) => r.timestamp,
            SensorRecord::Respiration(r) => r.timestamp,
            SensorRecord::Eda(r) => r.timestamp,
            SensorRecord::Temperature(r) => r.timestamp,
        }
    }

    pub fn id(&self) -> Option<i64> {
        match self {
            SensorRecord::HeartRate(r) => r.id,
            SensorRecord::Respiration(r) => r.id,
            SensorRecord::Eda(r) => r.id,
            SensorRecord::Temperature(r) => r.id,
        }
    }

    pub fn values(&self) -> Vec<f64> {
        match self {
            SensorRecord::HeartRate(r) => r.values(),
            SensorRecord::Respiration(r) => r.values(),
            SensorRecord::Eda(r) => r.values(),
            SensorRecord::Temperature(r) => r.values(),
        }
    }
}

impl From<HeartRate> for SensorRecord {
    fn from(r: HeartRate) -> Self {
        SensorRecord::HeartRate(r)
    }
}

impl From<Respiration> for SensorRecord {
    fn from(r: Respiration) -> Self {
        SensorRecord::Respiration(r)
    }
}

impl From<Eda> for SensorRecord {
    fn from(r: Eda) -> Self {
        SensorRecord::Eda(r)
    }
}

impl From<Temperature> for SensorRecord {
    fn from(r: Temperature) -> Self {
        SensorRecord::Temperature(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_values_arity() {
        let now = Utc::now();
        assert!(HeartRate::from_values(None, now, &[70.0, 0.9]).is_some());
        assert!(HeartRate::from_values(None, now, &[70.0]).is_none());
        assert!(Eda::from_values(None, now, &[1.5]).is_some());
        assert!(Eda::from_values(None, now, &[1.5, 2.0]).is_none());
    }

    #[test]
    fn test_sensor_record_kind() {
        let record: SensorRecord = Temperature {
            id: Some(4),
            timestamp: Utc::now(),
            value: 36.6,
        }
        .into();
        assert_eq!(record.kind(), SensorKind::Temperature);
        assert_eq!(record.id(), Some(4));
        assert_eq!(record.values(), vec![36.6]);
    }
}
