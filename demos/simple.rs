use std::time::Duration;

use ninau::{Client, MemoryStore, TokioSpawner, WorkerBuilder};
use serde_json::{Value, json};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .compact()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let store = MemoryStore::new();

    let worker = WorkerBuilder::new(store.clone())
        .register("times-five", |input: Value| async move {
            let value = input.get("value").and_then(Value::as_i64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(json!(value * 5))
        })
        .concurrency(4)
        .delay(Duration::from_millis(250))
        .job_spawner(TokioSpawner)
        .build()
        .expect("worker configuration");

    let client = Client::new(store.clone());
    let producer = {
        let client = client.clone();
        async move {
            let mut n = 0;
            loop {
                match client.dispatch("times-five", json!({"value": n})).await {
                    Ok(job) => {
                        tracing::info!(job_id = %job.id, n, "dispatched");
                        match client.poll_by_id_every(job.id, "100ms").await {
                            Ok(done) => tracing::info!(output = ?done.output(), "job finished"),
                            Err(error) => tracing::error!(error = %error, "poll failed"),
                        }
                        n += 1;
                    }
                    Err(error) => tracing::error!(error = %error, "dispatch failed"),
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    };

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    tokio::select! {
        _ = producer => {}
        _ = worker.with_graceful_shutdown(shutdown).run() => {}
    }
}
