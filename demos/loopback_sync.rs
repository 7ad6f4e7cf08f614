//! Collect synthetic readings for a few seconds, then move them from a
//! simulated wearable to a simulated companion over a loopback link.
//!
//! Run with: cargo run --example loopback_sync

use biosync::collector::{SampleWriter, SensorKind, SyntheticProducer};
use biosync::store::Store;
use biosync::sync::{LoopbackTransport, SyncCoordinator, SyncPaths, SyncRole};
use biosync::transparency::create_shared_log;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let root = tempfile::tempdir()?;
    let (watch_link, phone_link) = LoopbackTransport::pair();
    let log = create_shared_log();

    let watch_paths = SyncPaths::under(&root.path().join("watch"));
    let writer = SampleWriter::builder(&watch_paths.data_dir)
        .log(log.clone())
        .build();
    writer.start_collection(vec![Box::new(SyntheticProducer::new(50))])?;
    println!("Collecting for 2 seconds...");
    tokio::time::sleep(Duration::from_secs(2)).await;
    writer.stop_collection()?;

    let watch = Arc::new(
        SyncCoordinator::new(Store::open_in_memory()?, Arc::new(watch_link), watch_paths)
            .with_log(log.clone()),
    );
    let store = Store::open_in_memory()?;
    let phone = Arc::new(
        SyncCoordinator::new(
            store.clone(),
            Arc::new(phone_link),
            SyncPaths::under(&root.path().join("phone")),
        )
        .with_log(log.clone()),
    );

    println!("watch: {:?}", watch.sync_once(SyncRole::Send).await);
    println!("phone: {:?}", phone.sync_once(SyncRole::Receive).await);

    let now = Utc::now();
    for kind in SensorKind::ALL {
        let records = store.range_records(kind, now - ChronoDuration::minutes(5), now)?;
        println!("{kind}: {} records", records.len());
    }

    println!();
    println!("{}", log.summary());
    Ok(())
}
