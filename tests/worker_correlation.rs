// tests/worker_correlation.rs

mod common;
use crate::common::{TestResult, init_tracing, with_timeout};

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::{Value, json};
use statdag::errors::StatdagError;
use statdag::worker::WorkerRequest;
use statdag_test_utils::fake_worker::manual_worker;
use tokio::time::Instant;
use uuid::Uuid;

fn request_id(request: &Value) -> Uuid {
    Uuid::parse_str(request["id"].as_str().expect("string id")).expect("uuid id")
}

/// Index permutations of `2..8` in-flight calls.
fn response_orders() -> impl Strategy<Value = Vec<usize>> {
    (2..8usize).prop_flat_map(|n| Just((0..n).collect::<Vec<_>>()).prop_shuffle())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn responses_in_any_order_reach_their_own_callers(order in response_orders()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            init_tracing();

            let (worker, mut peer) = manual_worker(1, Duration::from_secs(20));
            let worker = Arc::new(worker);

            let calls: Vec<_> = (0..order.len())
                .map(|n| {
                    let worker = Arc::clone(&worker);
                    tokio::spawn(async move { worker.call(json!({ "n": n })).await })
                })
                .collect();

            let mut requests = Vec::new();
            for _ in 0..order.len() {
                requests.push(with_timeout(peer.next_request()).await);
            }

            // Each response echoes the `n` of the request it answers.
            for &i in &order {
                let request = &requests[i];
                peer.respond(&request["id"], json!({ "n": request["data"]["n"] })).await;
            }

            for (n, call) in calls.into_iter().enumerate() {
                let output = with_timeout(call).await.unwrap().unwrap();
                assert_eq!(output.results, json!({ "n": n }));
                assert_eq!(output.time, 0.5);
            }
            assert_eq!(worker.pending_requests(), 0);
        });
    }
}

#[tokio::test(start_paused = true)]
async fn timed_out_call_leaves_no_pending_entry_and_ignores_late_reply() -> TestResult {
    init_tracing();

    let (worker, mut peer) = manual_worker(1, Duration::from_secs(1));
    let worker = Arc::new(worker);

    let request = WorkerRequest::new(json!({ "slow": true }));
    let id = request.id;
    let started = Instant::now();
    let call = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.send(request).await })
    };

    let seen = peer.next_request().await;
    assert_eq!(request_id(&seen), id);
    assert!(worker.is_pending(&id));

    let result = call.await?;
    let elapsed = started.elapsed();
    assert!(matches!(result, Err(StatdagError::WorkerTimeout(ref rid)) if rid == &id.to_string()));
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_millis(1100));
    assert!(!worker.is_pending(&id));
    assert_eq!(worker.pending_requests(), 0);

    // The late answer is dropped and the worker keeps serving.
    peer.respond(&seen["id"], json!("late")).await;
    let next = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.call(json!("again")).await })
    };
    let request = peer.next_request().await;
    peer.respond(&request["id"], json!("fresh")).await;

    assert_eq!(next.await??.results, json!("fresh"));
    assert!(worker.is_running());
    Ok(())
}

#[tokio::test]
async fn worker_exit_rejects_every_pending_call() -> TestResult {
    init_tracing();

    let (worker, mut peer) = manual_worker(7, Duration::from_secs(20));
    let worker = Arc::new(worker);

    let first = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.call(json!(1)).await })
    };
    let second = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.call(json!(2)).await })
    };
    with_timeout(peer.next_request()).await;
    with_timeout(peer.next_request()).await;
    assert_eq!(worker.pending_requests(), 2);

    peer.close();

    let first = with_timeout(first).await?;
    let second = with_timeout(second).await?;
    assert!(matches!(first, Err(StatdagError::WorkerTerminated)));
    assert!(matches!(second, Err(StatdagError::WorkerTerminated)));
    assert!(!worker.is_running());
    assert_eq!(worker.pending_requests(), 0);

    let after = worker.call(json!(3)).await;
    assert!(matches!(after, Err(StatdagError::WorkerTerminated)));
    Ok(())
}

#[tokio::test]
async fn error_responses_and_noise_do_not_break_the_worker() -> TestResult {
    init_tracing();

    let (worker, mut peer) = manual_worker(2, Duration::from_secs(20));
    let worker = Arc::new(worker);

    let failing = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.call(json!("bad")).await })
    };
    let request = with_timeout(peer.next_request()).await;
    peer.respond_raw("numpy warning: something odd").await;
    peer.respond_raw("").await;
    peer.respond_error(&request["id"], "invalid input").await;

    match with_timeout(failing).await? {
        Err(StatdagError::WorkerError(message)) => assert_eq!(message, "invalid input"),
        other => panic!("expected worker error, got {other:?}"),
    }

    let ok = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.call(json!("good")).await })
    };
    let request = with_timeout(peer.next_request()).await;
    peer.respond(&request["id"], json!({ "p": 0.04 })).await;
    assert_eq!(with_timeout(ok).await??.results, json!({ "p": 0.04 }));
    assert!(worker.is_running());
    Ok(())
}
