//! Two workers contending for one store, plus recovery of a claim left
//! behind by a worker that never came back.

use std::time::Duration;

use ninau::{ClaimantId, Client, JobStore, MemoryStore, TokioSpawner, WorkerBuilder, worker};
use serde_json::{Value, json};

async fn crunch(input: Value) -> Result<Value, Box<dyn std::error::Error + Send + Sync>> {
    let value = input.get("value").and_then(Value::as_i64).unwrap_or(0);
    tokio::time::sleep(Duration::from_millis(300)).await;
    Ok(json!(value * value))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .compact()
        .with_max_level(tracing::Level::INFO)
        .init();

    let store = MemoryStore::new();
    let client = Client::new(store.clone());

    // Simulate a process that claimed a job and died before finishing it.
    let dead = ClaimantId::generate();
    let orphan = client
        .dispatch("crunch", json!({"value": 7}))
        .await
        .expect("dispatch");
    store
        .claim(&["crunch".to_owned()], dead)
        .await
        .expect("claim");
    tracing::info!(job_id = %orphan.id, claimant = %dead, "job claimed by a process about to die");

    // Its exit hook runs the reaper; the job returns to the pending pool.
    worker::reap(&store, dead, Duration::from_secs(1)).await;

    for n in 0..6 {
        client
            .dispatch("crunch", json!({"value": n}))
            .await
            .expect("dispatch");
    }

    let (stop_a, rx_a) = tokio::sync::oneshot::channel::<()>();
    let (stop_b, rx_b) = tokio::sync::oneshot::channel::<()>();
    let mut handles = Vec::new();
    for (label, rx) in [("a", rx_a), ("b", rx_b)] {
        let worker = WorkerBuilder::new(store.clone())
            .register("crunch", crunch)
            .claimant(ClaimantId::generate())
            .concurrency(2)
            .delay(Duration::from_millis(100))
            .job_spawner(TokioSpawner)
            .build()
            .expect("worker configuration");
        tracing::info!(worker = label, claimant = %worker.claimant(), "worker starting");
        handles.push(tokio::spawn(
            worker
                .with_graceful_shutdown(async move {
                    let _ = rx.await;
                })
                .run(),
        ));
    }

    // Wait for the whole backlog, orphan included, to be worked off.
    loop {
        let pending = client.count_pending().await.expect("count");
        let processing = client.count_processing().await.expect("count");
        tracing::info!(pending, processing, "queue state");
        if pending == 0 && processing == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let recovered = client.get(orphan.id).await.expect("get").expect("record");
    tracing::info!(
        job_id = %recovered.id,
        abandoned_at = ?recovered.abandoned_at,
        output = ?recovered.output(),
        "orphaned job was recovered and completed"
    );

    let _ = stop_a.send(());
    let _ = stop_b.send(());
    for handle in handles {
        let _ = handle.await;
    }
}
