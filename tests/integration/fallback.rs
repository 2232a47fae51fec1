//! Primary/secondary dispatch against real reference workers.

use std::time::{Duration, Instant};

use handoff::ledger::{AttemptOutcome, RequestState};
use handoff::medium::{keys, Namespace};
use handoff::orchestration::{DispatchEvent, Provider};
use handoff::{Error, FailureKind};

use crate::fixtures::*;

fn synthesis(primary_deadline: Duration) -> (Provider, Provider) {
    (
        Provider::new("qwen3", "synthesis", primary_deadline),
        Provider::new("vibevoice", "synthesis", Duration::from_secs(3)),
    )
}

/// Deadline 5.0 s, worker answers at 5.2 s, scaled down by 10.
#[tokio::test]
async fn test_late_primary_answer_is_discarded_after_fallback() {
    let backend = TestMedium::memory();
    let (primary, secondary) = synthesis(Duration::from_millis(500));
    let late = start_worker(
        &backend.medium,
        "qwen3",
        ScriptedHandler::answering_after(Duration::from_millis(520)),
        false,
    );
    let backup = start_worker(
        &backend.medium,
        "vibevoice",
        ScriptedHandler::answering_after(Duration::from_millis(150)),
        true,
    );
    let (dispatcher, mut rx) = dispatcher(&backend.medium, policy(primary, Some(secondary)));

    let started = Instant::now();
    let artifact = dispatcher
        .request(&rid("ep1-line1"), "synthesis", "/in/line1.txt")
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(500));

    let entry = dispatcher.coordinator().ledger().get(&rid("ep1-line1")).await.unwrap();
    assert_eq!(entry.state, RequestState::Completed);
    assert_eq!(entry.attempts.len(), 2);
    let (first, second) = (&entry.attempts[0], &entry.attempts[1]);
    assert_eq!(first.outcome, Some(AttemptOutcome::TimedOut));
    assert_eq!(second.provider, "vibevoice");
    assert_ne!(first.task_id, second.task_id);

    // The caller got the secondary's answer, never the ghost.
    assert_eq!(artifact.task_id, second.task_id);
    assert!(artifact.payload_ref.ends_with(".vibevoice.wav"));

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        DispatchEvent::FallbackTriggered { from_provider, to_provider, .. }
            if from_provider == "qwen3" && to_provider == "vibevoice"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        DispatchEvent::StaleDiscarded { task_id, .. } if *task_id == first.task_id
    )));
    assert!(backend.medium.get(&keys::result(&first.task_id)).await.unwrap().is_none());

    late.stop().await;
    backup.stop().await;
}

#[tokio::test]
async fn test_successful_primary_never_dispatches_secondary() {
    let backend = TestMedium::fs();
    let (primary, secondary) = synthesis(Duration::from_secs(3));
    let primary_handler = ScriptedHandler::answering_after(Duration::from_millis(10));
    let secondary_handler = ScriptedHandler::answering_after(Duration::ZERO);
    let w1 = start_worker(&backend.medium, "qwen3", primary_handler.clone(), true);
    let w2 = start_worker(&backend.medium, "vibevoice", secondary_handler.clone(), true);
    let (dispatcher, mut rx) = dispatcher(&backend.medium, policy(primary, Some(secondary)));

    dispatcher
        .request(&rid("ok-1"), "synthesis", "/in/ok.txt")
        .await
        .unwrap();

    assert_eq!(primary_handler.calls(), 1);
    assert_eq!(secondary_handler.calls(), 0);
    assert!(!drain(&mut rx)
        .iter()
        .any(|e| matches!(e, DispatchEvent::FallbackTriggered { .. })));
    w1.stop().await;
    w2.stop().await;
}

#[tokio::test]
async fn test_provider_error_falls_back_with_one_live_descriptor() {
    let backend = TestMedium::memory();
    let (primary, secondary) = synthesis(Duration::from_secs(3));
    let w1 = start_worker(&backend.medium, "qwen3", ScriptedHandler::failing(), true);
    let w2 = start_worker(
        &backend.medium,
        "vibevoice",
        ScriptedHandler::answering_after(Duration::from_millis(30)),
        true,
    );
    let (dispatcher, _rx) = dispatcher(&backend.medium, policy(primary, Some(secondary)));
    let monitor = PendingMonitor::start(&backend.medium);

    let artifact = dispatcher
        .request(&rid("err-1"), "synthesis", "/in/err.txt")
        .await
        .unwrap();

    assert!(artifact.is_ok());
    assert_eq!(monitor.finish().await, 1, "more than one live descriptor seen");
    let entry = dispatcher.coordinator().ledger().get(&rid("err-1")).await.unwrap();
    assert_eq!(entry.attempts[0].outcome, Some(AttemptOutcome::ProviderFailed));
    assert_eq!(entry.attempts[1].outcome, Some(AttemptOutcome::Succeeded));
    w1.stop().await;
    w2.stop().await;
}

#[tokio::test]
async fn test_both_providers_failing_reports_exhausted() {
    let backend = TestMedium::fs();
    let (primary, secondary) = synthesis(Duration::from_secs(3));
    let w1 = start_worker(&backend.medium, "qwen3", ScriptedHandler::failing(), true);
    let w2 = start_worker(&backend.medium, "vibevoice", ScriptedHandler::failing(), true);
    let (dispatcher, _rx) = dispatcher(&backend.medium, policy(primary, Some(secondary)));

    let err = dispatcher
        .request(&rid("bad-1"), "synthesis", "/in/bad.txt")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ProvidersExhausted { attempts: 2, .. }));
    assert_eq!(err.failure_kind(), FailureKind::ProvidersExhausted);
    let entry = dispatcher.coordinator().ledger().get(&rid("bad-1")).await.unwrap();
    assert_eq!(entry.state, RequestState::Failed);
    assert_eq!(backend.count(Namespace::Pending).await, 0);
    w1.stop().await;
    w2.stop().await;
}

#[tokio::test]
async fn test_batch_of_requests_all_served() {
    let backend = TestMedium::memory();
    let (primary, secondary) = synthesis(Duration::from_secs(3));
    let w1 = start_worker(
        &backend.medium,
        "qwen3",
        ScriptedHandler::answering_after(Duration::from_millis(5)),
        true,
    );
    let (dispatcher, _rx) = dispatcher(&backend.medium, policy(primary, Some(secondary)));

    let requests: Vec<_> = (0..4)
        .map(|i| {
            handoff::orchestration::DispatchRequest::new(
                rid(&format!("batch-{}", i)),
                "synthesis",
                &format!("/in/{}.txt", i),
            )
        })
        .collect();
    let outcomes = dispatcher.run_batch(&requests).await;

    assert_eq!(outcomes.len(), 4);
    assert!(outcomes.iter().all(|o| o.is_ok()));
    w1.stop().await;
}
