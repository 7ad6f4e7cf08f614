//! Sources of readings.
//!
//! Hardware sensors and the synthetic generator implement the same
//! [`Producer`] contract, so the writer drives them identically.

use crate::collector::types::Measurement;
use crossbeam_channel::{bounded, tick, Receiver, RecvTimeoutError, Sender};
use rand::Rng;
use std::time::Duration;

/// Result of one poll of a producer.
#[derive(Debug, Clone, PartialEq)]
pub enum Produced {
    /// One or more readings became available.
    Readings(Vec<Measurement>),
    /// Nothing within the poll timeout; poll again.
    Idle,
    /// The source is gone; the producer will never yield again.
    Exhausted,
}

/// A source of readings polled by the writer.
pub trait Producer: Send + 'static {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Wait up to `timeout` for the next readings.
    fn produce(&mut self, timeout: Duration) -> Produced;
}

/// Default synthetic generation rate.
pub const SYNTHETIC_RATE_HZ: u32 = 25;

/// Generates plausible respiration and EDA values for devices without
/// those sensors.
///
/// Each tick yields one respiration reading in 12-20 breaths/min (with
/// `ibi = 60 / rate`) and one EDA reading in 0.1-10 µS.
pub struct SyntheticProducer {
    ticker: Receiver<std::time::Instant>,
}

impl SyntheticProducer {
    pub fn new(rate_hz: u32) -> Self {
        let period = Duration::from_secs_f64(1.0 / f64::from(rate_hz.max(1)));
        Self {
            ticker: tick(period),
        }
    }

    /// One tick worth of readings.
    pub fn sample() -> Vec<Measurement> {
        let mut rng = rand::rng();
        let rate: f64 = rng.random_range(12.0..=20.0);
        vec![
            Measurement::Respiration {
                rate,
                inter_beat_interval: 60.0 / rate,
            },
            Measurement::Eda {
                conductance: rng.random_range(0.1..=10.0),
            },
        ]
    }
}

impl Default for SyntheticProducer {
    fn default() -> Self {
        Self::new(SYNTHETIC_RATE_HZ)
    }
}

impl Producer for SyntheticProducer {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn produce(&mut self, timeout: Duration) -> Produced {
        match self.ticker.recv_timeout(timeout) {
            Ok(_) => Produced::Readings(Self::sample()),
            Err(RecvTimeoutError::Timeout) => Produced::Idle,
            Err(RecvTimeoutError::Disconnected) => Produced::Exhausted,
        }
    }
}

/// Bridges a hardware callback into the producer contract.
///
/// The callback side pushes into the [`Sender`] returned by
/// [`ChannelProducer::new`]; the writer drains it.
pub struct ChannelProducer {
    name: String,
    receiver: Receiver<Measurement>,
}

impl ChannelProducer {
    pub fn new(name: impl Into<String>) -> (Sender<Measurement>, Self) {
        let (sender, receiver) = bounded(10_000);
        (
            sender,
            Self {
                name: name.into(),
                receiver,
            },
        )
    }
}

impl Producer for ChannelProducer {
    fn name(&self) -> &str {
        &self.name
    }

    fn produce(&mut self, timeout: Duration) -> Produced {
        match self.receiver.recv_timeout(timeout) {
            Ok(first) => {
                let mut readings = vec![first];
                readings.extend(self.receiver.try_iter());
                Produced::Readings(readings)
            }
            Err(RecvTimeoutError::Timeout) => Produced::Idle,
            Err(RecvTimeoutError::Disconnected) => Produced::Exhausted,
        }
    }
}

/// Whether the process may read body sensors.
pub trait PermissionGate: Send + Sync {
    fn sensors_granted(&self) -> bool;
}

impl<F> PermissionGate for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn sensors_granted(&self) -> bool {
        self()
    }
}

/// Gate for platforms without a sensor permission model.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysGranted;

impl PermissionGate for AlwaysGranted {
    fn sensors_granted(&self) -> bool {
        check_permission()
    }
}

/// Desktop hosts have no body-sensor permission gate.
pub fn check_permission() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_ranges() {
        for _ in 0..200 {
            for m in SyntheticProducer::sample() {
                match m {
                    Measurement::Respiration {
                        rate,
                        inter_beat_interval,
                    } => {
                        assert!((12.0..=20.0).contains(&rate));
                        assert!((inter_beat_interval - 60.0 / rate).abs() < 1e-9);
                    }
                    Measurement::Eda { conductance } => {
                        assert!((0.1..=10.0).contains(&conductance));
                    }
                    other => panic!("unexpected synthetic reading {other:?}"),
                }
            }
        }
    }

    #[test]
    fn test_synthetic_ticks() {
        let mut producer = SyntheticProducer::new(100);
        let produced = producer.produce(Duration::from_secs(1));
        assert!(matches!(produced, Produced::Readings(ref r) if r.len() == 2));
    }

    #[test]
    fn test_channel_producer_drains_burst() {
        let (sender, mut producer) = ChannelProducer::new("chest-strap");
        sender
            .send(Measurement::HeartRate {
                rate: 70.0,
                confidence: 1.0,
            })
            .unwrap();
        sender
            .send(Measurement::Temperature { value: 36.4 })
            .unwrap();

        match producer.produce(Duration::from_millis(10)) {
            Produced::Readings(readings) => assert_eq!(readings.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(producer.produce(Duration::from_millis(10)), Produced::Idle);

        drop(sender);
        assert_eq!(
            producer.produce(Duration::from_millis(10)),
            Produced::Exhausted
        );
    }

    #[test]
    fn test_closure_gate() {
        let denied = || false;
        assert!(!denied.sensors_granted());
        assert!(AlwaysGranted.sensors_granted());
    }
}
