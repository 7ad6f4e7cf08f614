//! biosync - physiological sample sync between a wearable and its companion.
//!
//! A wearable logs time-stamped readings to per-sensor CSV files, bundles
//! them into an archive, and hands the archive to a transport. The
//! companion device extracts the archive inside a confined directory,
//! parses the logs tolerantly and ingests them into a time-series store.
//!
//! # Guarantees
//!
//! - **Durable logs**: every reading is flushed before it is acknowledged
//! - **Confined extraction**: an archive entry that resolves outside the
//!   extraction directory rejects the whole archive
//! - **Best-effort parsing**: a malformed line is skipped, never the file
//! - **Single-flight sync**: at most one sync attempt runs at a time
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────── origin ────────────────┐      ┌────────────── destination ──────────────┐
//! │ ┌──────────┐   ┌──────────┐  ┌────────┐│      │┌────────┐  ┌────────┐  ┌───────┐         │
//! │ │Producers │──▶│  Sample  │─▶│Archiver││─────▶││Archiver│─▶│ Parser │─▶│ Store │         │
//! │ │(sensor / │   │  Writer  │  │ (zip)  ││ Tx   ││extract │  │ (CSV)  │  │(SQLite│         │
//! │ │synthetic)│   └──────────┘  └────────┘│      │└────────┘  └────────┘  └───────┘         │
//! │ └──────────┘        SyncCoordinator    │      │        SyncCoordinator  ▲ retention      │
//! └────────────────────────────────────────┘      └─────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use biosync::{collector, store::Store, sync};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let writer = collector::SampleWriter::new("/tmp/biosync/logs");
//! writer.start_collection(vec![Box::new(collector::SyntheticProducer::default())])?;
//!
//! let (watch, phone) = sync::LoopbackTransport::pair();
//! let paths = sync::SyncPaths::under(std::path::Path::new("/tmp/biosync"));
//! let coordinator = Arc::new(sync::SyncCoordinator::new(
//!     Store::open_in_memory()?,
//!     Arc::new(watch),
//!     paths,
//! ));
//! coordinator.sync_once(sync::SyncRole::Send).await;
//! # drop(phone);
//! # Ok(())
//! # }
//! ```

pub mod collector;
pub mod config;
pub mod core;
pub mod error;
pub mod store;
pub mod sync;
pub mod transparency;

// Re-export key types at crate root for convenience
pub use collector::{CollectorError, Measurement, Producer, SampleWriter, SensorKind};
pub use config::Config;
pub use core::{parse_records, ArchiveError, Archiver, SensorRecord};
pub use error::SyncError;
pub use store::{Store, StoreConfig, StoreError};
pub use sync::{SyncAttempt, SyncCoordinator, SyncRole, SyncScheduler, SyncStatus};
pub use transparency::{PipelineLog, PipelineStats, SharedPipelineLog};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Data declaration that can be displayed to users.
pub const DATA_DECLARATION: &str = r#"
╔══════════════════════════════════════════════════════════════════╗
║                 BIOSYNC - DATA HANDLING DECLARATION               ║
╠══════════════════════════════════════════════════════════════════╣
║                                                                  ║
║  This device records physiological readings for your own use.    ║
║                                                                  ║
║  ✓ WHAT IS RECORDED:                                             ║
║    • Heart rate and sensor confidence                            ║
║    • Respiration rate and inter-beat interval                    ║
║    • Skin conductance (EDA) and temperature                      ║
║                                                                  ║
║  ✓ WHERE IT GOES:                                                ║
║    • Local log files on this device                              ║
║    • Your paired companion device, over the configured channel   ║
║                                                                  ║
║  ✗ WHAT NEVER HAPPENS:                                           ║
║    • Readings are never sent to any third device or service      ║
║    • Archives are never trusted to write outside their folder    ║
║                                                                  ║
║  You can view pipeline statistics anytime with:                  ║
║    biosync status                                                ║
║                                                                  ║
╚══════════════════════════════════════════════════════════════════╝
"#;
