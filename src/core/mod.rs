//! Core data path of the sync pipeline.
//!
//! This module contains:
//! - Typed sensor records shared by the parser and the store
//! - The tolerant CSV log parser
//! - Archive packaging and confined extraction

pub mod archive;
pub mod parser;
pub mod records;

// Re-export commonly used types
pub use archive::{ArchiveError, Archiver};
pub use parser::{parse_records, RecordReader};
pub use records::{Eda, HeartRate, Reading, Respiration, SensorRecord, Temperature};
