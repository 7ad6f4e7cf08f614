//! Reading collection.
//!
//! Sensor kinds and raw readings, the producer contract shared by hardware
//! bridges and the synthetic generator, and the writer that turns readings
//! into per-sensor append logs.

pub mod producer;
pub mod types;
pub mod writer;

// Re-export commonly used types
pub use producer::{
    check_permission, AlwaysGranted, ChannelProducer, PermissionGate, Produced, Producer,
    SyntheticProducer, SYNTHETIC_RATE_HZ,
};
pub use types::{Measurement, SensorKind};
pub use writer::{CollectorError, SampleWriter, SampleWriterBuilder};
