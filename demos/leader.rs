//! A complete election round against the in-memory coordinator.
//!
//! Run with:
//! ```sh
//! cargo run --example leader
//! ```

use std::sync::Arc;
use std::time::Duration;

use ballot::client::memory::MemoryCluster;
use ballot::prelude::*;
use ballot::telemetry::{init_logging, LogFormat};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(LogFormat::Pretty).expect("failed to init logging");

    let cluster = MemoryCluster::new();
    let connector: Arc<MemoryCluster> = Arc::new(cluster.clone());

    let group = |_name: &str| -> Result<Group> {
        let config = GroupConfig::new("memory:0", "/elect")
            .with_session_timeout(Duration::from_secs(10));
        Group::new(connector.clone(), config)
    };

    // Two processes compete for leadership of /elect.
    let alice = LeaderContender::new(group("alice")?, "alice:5050");
    let alice_candidacy = alice.contend().await?;
    println!("alice is contending");

    let bob = LeaderContender::new(group("bob")?, "bob:5050");
    let _bob_candidacy = bob.contend().await?;
    println!("bob is contending");

    // An observer discovers the current leader.
    let detector = LeaderDetector::new(group("observer")?);
    let leader = detector.detect(Ok(None)).await?;
    println!("observed leader: {leader:?}");

    // The leader steps down; the observer sees the change. The withdrawn
    // candidacy was abandoned rather than lost, so it is simply dropped.
    let withdrew = alice.withdraw().await?;
    println!("alice withdrew: {withdrew}");
    drop(alice_candidacy);
    let leader = detector.detect(Ok(leader)).await?;
    println!("observed leader: {leader:?}");

    Ok(())
}
