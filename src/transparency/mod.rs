//! Transparency module.
//!
//! Tracks what the pipeline collects and moves between devices, so users
//! can see exactly how much data left the device and when.

pub mod log;

// Re-export commonly used types
pub use log::{
    create_shared_log, create_shared_log_with_persistence, PipelineLog, PipelineStats,
    SharedPipelineLog,
};
