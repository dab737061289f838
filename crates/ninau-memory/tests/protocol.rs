//! Full-protocol tests: client and worker coordinating through the memory
//! adapter, the way separate processes coordinate through a shared store.

use std::time::Duration;

use ninau_core::job::{ClaimantId, JobState};
use ninau_core::store::JobStore;
use ninau_core::worker::reap;
use ninau_core::{Client, WorkerBuilder};
use ninau_memory::MemoryStore;
use serde_json::{Value, json};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn names(name: &str) -> Vec<String> {
    vec![name.to_owned()]
}

#[tokio::test]
async fn duplicate_dispatch_collapses_while_pending_only() {
    let store = MemoryStore::new();
    let client = Client::new(store.clone());
    let input = json!({"w": 100});

    let first = client.dispatch("resize", input.clone()).await.unwrap();
    let duplicate = client.dispatch("resize", input.clone()).await.unwrap();
    assert_eq!(first.id, duplicate.id);

    let claimant = ClaimantId::generate();
    store.claim(&names("resize"), claimant).await.unwrap();
    store.succeed(first.id, json!(null)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(2)).await;
    let fresh = client.dispatch("resize", input.clone()).await.unwrap();
    assert_ne!(fresh.id, first.id);

    let latest = client.latest("resize", &input).await.unwrap().unwrap();
    assert_eq!(latest.id, fresh.id);
}

#[tokio::test]
async fn handler_output_reaches_the_poller() {
    let store = MemoryStore::new();
    let client = Client::new(store.clone());
    let job = client
        .dispatch("times-five", json!({"value": 1}))
        .await
        .unwrap();

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let worker = WorkerBuilder::new(store.clone())
        .register("times-five", |input: Value| async move {
            let value = input.get("value").and_then(Value::as_i64).unwrap_or(0);
            Ok::<_, BoxError>(json!(value * 5))
        })
        .delay(Duration::from_millis(10))
        .build()
        .unwrap();
    let handle = tokio::spawn(
        worker
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            })
            .run(),
    );

    let done = tokio::time::timeout(
        Duration::from_secs(5),
        client.poll_by_id_every(job.id, Duration::from_millis(10)),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(done.output(), Some(&json!(5)));
    assert!(done.error().is_none());

    let _ = stop_tx.send(());
    handle.await.unwrap();
}

#[tokio::test]
async fn handler_failure_is_recorded_not_fatal() {
    let store = MemoryStore::new();
    let client = Client::new(store.clone());
    let failing = client.dispatch("job", json!({"n": 1})).await.unwrap();

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let worker = WorkerBuilder::new(store.clone())
        .register("job", |input: Value| async move {
            match input.get("n").and_then(Value::as_i64) {
                Some(1) => Err::<Value, BoxError>("boom".into()),
                _ => Ok(json!("fine")),
            }
        })
        .delay(Duration::from_millis(10))
        .build()
        .unwrap();
    let handle = tokio::spawn(
        worker
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            })
            .run(),
    );

    let done = tokio::time::timeout(
        Duration::from_secs(5),
        client.poll_by_id_every(failing.id, Duration::from_millis(10)),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(done.error().map(|e| e.message.as_str()), Some("boom"));
    assert!(done.output().is_none());

    // The loop survived the failure and keeps executing later work.
    let healthy = client.dispatch("job", json!({"n": 2})).await.unwrap();
    let done = tokio::time::timeout(
        Duration::from_secs(5),
        client.poll_by_id_every(healthy.id, Duration::from_millis(10)),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(done.output(), Some(&json!("fine")));

    let _ = stop_tx.send(());
    handle.await.unwrap();
}

#[tokio::test]
async fn sequence_outputs_round_trip_in_order() {
    let store = MemoryStore::new();
    let client = Client::new(store.clone());
    client.dispatch_default(json!({})).await.unwrap();

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let worker = WorkerBuilder::new(store.clone())
        .register_default(|_input: Value| async move { Ok::<_, BoxError>(json!([1, 2, 3])) })
        .delay(Duration::from_millis(10))
        .build()
        .unwrap();
    let handle = tokio::spawn(
        worker
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            })
            .run(),
    );

    let done = tokio::time::timeout(
        Duration::from_secs(5),
        client.poll_latest_every("default", &json!({}), Duration::from_millis(10)),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(done.output(), Some(&json!([1, 2, 3])));

    let _ = stop_tx.send(());
    handle.await.unwrap();
}

#[tokio::test]
async fn dispose_leaves_no_record_behind() {
    let store = MemoryStore::new();
    let client = Client::new(store.clone());
    let job = client.dispatch("job", json!({})).await.unwrap();

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let worker = WorkerBuilder::new(store.clone())
        .register("job", |_input: Value| async move {
            Ok::<_, BoxError>(json!("gone"))
        })
        .delay(Duration::from_millis(10))
        .dispose()
        .build()
        .unwrap();
    let handle = tokio::spawn(
        worker
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            })
            .run(),
    );

    // Polling cannot observe a terminal state here; the record disappears
    // instead. Watch for eventual absence.
    let absent = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if client.get(job.id).await.unwrap().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(absent.is_ok(), "record was never disposed");

    let _ = stop_tx.send(());
    handle.await.unwrap();
}

#[tokio::test]
async fn counts_track_the_state_markers() {
    let store = MemoryStore::new();
    let client = Client::new(store.clone());

    for n in 0..3 {
        client.dispatch("job", json!({"n": n})).await.unwrap();
    }
    assert_eq!(client.count_pending().await.unwrap(), 3);
    assert_eq!(client.count_processing().await.unwrap(), 0);

    store
        .claim(&names("job"), ClaimantId::generate())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(client.count_pending().await.unwrap(), 2);
    assert_eq!(client.count_processing().await.unwrap(), 1);
}

#[tokio::test]
async fn reaped_claims_are_claimable_by_a_new_process() {
    let store = MemoryStore::new();
    let client = Client::new(store.clone());
    let job = client.dispatch("job", json!({"value": 4})).await.unwrap();

    // A process claims the job and dies without finishing it.
    let dead = ClaimantId::generate();
    store.claim(&names("job"), dead).await.unwrap().unwrap();
    reap(&store, dead, Duration::from_secs(1)).await;

    let recovered = client.get(job.id).await.unwrap().unwrap();
    assert!(matches!(recovered.state, JobState::Pending));
    assert!(recovered.abandoned_at.is_some());

    // A fresh worker picks the job up and completes it.
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let worker = WorkerBuilder::new(store.clone())
        .register("job", |input: Value| async move {
            let value = input.get("value").and_then(Value::as_i64).unwrap_or(0);
            Ok::<_, BoxError>(json!(value * 5))
        })
        .delay(Duration::from_millis(10))
        .build()
        .unwrap();
    let handle = tokio::spawn(
        worker
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            })
            .run(),
    );

    let done = tokio::time::timeout(
        Duration::from_secs(5),
        client.poll_by_id_every(job.id, Duration::from_millis(10)),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(done.output(), Some(&json!(20)));

    let _ = stop_tx.send(());
    handle.await.unwrap();
}

#[tokio::test]
async fn poll_blocks_until_terminal_then_returns_promptly() {
    let store = MemoryStore::new();
    let client = Client::new(store.clone());
    let job = client.dispatch("job", json!({})).await.unwrap();

    let poller = Client::new(store.clone());
    let id = job.id;
    let handle = tokio::spawn(async move {
        poller
            .poll_by_id_every(id, Duration::from_millis(25))
            .await
            .unwrap()
    });

    // Nothing terminal yet, so the poll must still be blocked.
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(!handle.is_finished());

    store
        .claim(&names("job"), ClaimantId::generate())
        .await
        .unwrap()
        .unwrap();
    store.succeed(job.id, json!("done")).await.unwrap();

    // One interval to notice, one of slack.
    let done = tokio::time::timeout(Duration::from_millis(200), handle)
        .await
        .expect("poll did not return after completion")
        .unwrap();
    assert_eq!(done.output(), Some(&json!("done")));
}

#[tokio::test]
async fn shutdown_drains_claimed_work_before_reaping() {
    let store = MemoryStore::new();
    let client = Client::new(store.clone());
    let job = client.dispatch("slow", json!({})).await.unwrap();

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let worker = WorkerBuilder::new(store.clone())
        .register("slow", |_input: Value| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, BoxError>(json!("finished anyway"))
        })
        .delay(Duration::from_millis(10))
        .build()
        .unwrap();
    let handle = tokio::spawn(
        worker
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            })
            .run(),
    );

    // Wait for the claim, then close while the handler is mid-flight.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if client.count_processing().await.unwrap() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    let _ = stop_tx.send(());
    handle.await.unwrap();

    // Closing stopped new claims but not the claimed handler.
    let done = client.get(job.id).await.unwrap().unwrap();
    assert_eq!(done.output(), Some(&json!("finished anyway")));
    assert_eq!(client.count_processing().await.unwrap(), 0);
}

#[tokio::test]
async fn worker_respects_the_concurrency_ceiling() {
    let store = MemoryStore::new();
    let client = Client::new(store.clone());
    for n in 0..4 {
        client.dispatch("slow", json!({"n": n})).await.unwrap();
    }

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let worker = WorkerBuilder::new(store.clone())
        .register("slow", |_input: Value| async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            Ok::<_, BoxError>(json!(null))
        })
        .concurrency(2)
        .delay(Duration::from_millis(10))
        .build()
        .unwrap();
    let handle = tokio::spawn(
        worker
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            })
            .run(),
    );

    // While the first pair runs, no third claim may exist.
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(client.count_processing().await.unwrap(), 2);

    // Eventually all four finish.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let pending = client.count_pending().await.unwrap();
            let processing = client.count_processing().await.unwrap();
            if pending == 0 && processing == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let _ = stop_tx.send(());
    handle.await.unwrap();
}
