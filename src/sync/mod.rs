//! Device-to-device synchronization.
//!
//! This module contains:
//! - The transport contract and its loopback and spool-directory implementations
//! - The sync status state machine
//! - The single-flight coordinator that runs one attempt end to end
//! - Periodic scheduling with bounded retry
//! - Retention sweeps for the store and for received archives

pub mod coordinator;
pub mod retention;
pub mod scheduler;
pub mod status;
pub mod transport;

// Re-export commonly used types
pub use coordinator::{SyncAttempt, SyncCoordinator, SyncPaths};
pub use retention::{
    run_retention, sweep_archives, RetentionError, RetentionPolicy, RetentionReport,
    DEFAULT_ARCHIVE_KEEP,
};
pub use scheduler::{ScheduleConfig, ScheduleHandle, SyncScheduler};
pub use status::{SyncRole, SyncStatus};
pub use transport::{
    DirectoryTransport, LoopbackTransport, Transport, TransportError, TransportPayload,
    DEFAULT_CHANNEL,
};
