//! Leader election demonstration
//!
//! Three candidates contend for one lease in a shared in-memory store. The
//! leader is cancelled halfway through and one of the followers takes over.

use leader_election::{
    CancellationToken, ElectionConfig, ElectionHandle, LeaderElector, MemoryLeaseStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

struct Running {
    handle: ElectionHandle,
    cancel: CancellationToken,
    task: JoinHandle<leader_election::Result<()>>,
}

fn start(identity: &str, store: &MemoryLeaseStore) -> Result<Running, Box<dyn std::error::Error>> {
    let config = ElectionConfig::new("demo-lock", "default", identity).with_timings(
        Duration::from_secs(3),
        Duration::from_secs(2),
        Duration::from_millis(500),
    );

    let id = identity.to_string();
    let elector = LeaderElector::builder(config)
        .store(Arc::new(store.clone()))
        .on_started_leading(move || println!("👑 {} started leading", id))
        .on_new_leader(|leader| println!("📣 new leader observed: {}", leader))
        .build()?;

    let handle = elector.handle();
    let cancel = CancellationToken::new();
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { elector.run(cancel).await })
    };

    Ok(Running {
        handle,
        cancel,
        task,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("🚀 Starting Leader Election Demo");

    let store = MemoryLeaseStore::new();
    let mut candidates = Vec::new();
    for identity in ["node-1", "node-2", "node-3"] {
        candidates.push(start(identity, &store)?);
        sleep(Duration::from_millis(200)).await;
    }

    sleep(Duration::from_secs(2)).await;
    print_status(&candidates);

    let leader = match candidates.iter().position(|c| c.handle.is_leader()) {
        Some(index) => candidates.remove(index),
        None => return Err("no leader elected".into()),
    };
    println!("🛑 Cancelling {}", leader.handle.identity());
    leader.cancel.cancel();
    leader.task.await??;

    sleep(Duration::from_secs(2)).await;
    print_status(&candidates);

    for candidate in candidates {
        candidate.cancel.cancel();
        candidate.task.await??;
    }

    println!("✅ Demo completed");
    Ok(())
}

fn print_status(candidates: &[Running]) {
    println!("📊 Election status:");
    for candidate in candidates {
        println!(
            "  {} leader={} observed={:?}",
            candidate.handle.identity(),
            candidate.handle.is_leader(),
            candidate.handle.current_leader()
        );
    }
}
