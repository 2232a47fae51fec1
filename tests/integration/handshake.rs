//! Publish/await cycles between the coordinator and reference workers.

use std::sync::Arc;
use std::time::Duration;

use handoff::core::ArtifactStatus;
use handoff::ledger::{AttemptOutcome, Ledger, RequestState};
use handoff::medium::Namespace;
use handoff::orchestration::{Coordinator, Provider};
use handoff::Error;
use tokio_util::sync::CancellationToken;

use crate::fixtures::*;

#[tokio::test]
async fn test_worker_round_trip_on_both_media() {
    for backend in TestMedium::both() {
        let handler = ScriptedHandler::answering_after(Duration::from_millis(20));
        let worker = start_worker(&backend.medium, "qwen3", handler.clone(), true);
        let coordinator = Coordinator::new(backend.medium.clone(), Arc::new(Ledger::new()), settings());

        let provider = Provider::new("qwen3", "synthesis", Duration::from_secs(3));
        let artifact = coordinator
            .dispatch(&rid("line-1"), &provider, "/in/line1.txt", provider.deadline)
            .await
            .unwrap();

        assert_eq!(artifact.status, ArtifactStatus::Ok);
        assert!(artifact.payload_ref.ends_with(".qwen3.wav"));
        assert_eq!(handler.calls(), 1);
        assert_eq!(backend.count(Namespace::Pending).await, 0);
        assert_eq!(backend.count(Namespace::Results).await, 0);

        let entry = coordinator.ledger().get(&rid("line-1")).await.unwrap();
        assert_eq!(entry.state, RequestState::Completed);
        assert_eq!(entry.attempts.len(), 1);
        assert_eq!(entry.attempts[0].outcome, Some(AttemptOutcome::Succeeded));
        worker.stop().await;
    }
}

#[tokio::test]
async fn test_silent_worker_times_out_and_withdraws() {
    let backend = TestMedium::fs();
    let coordinator = Coordinator::new(backend.medium.clone(), Arc::new(Ledger::new()), settings());
    let provider = Provider::new("qwen3", "synthesis", Duration::from_millis(80));

    let err = coordinator
        .dispatch(&rid("line-2"), &provider, "/in/line2.txt", provider.deadline)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Timeout { .. }));
    assert_eq!(backend.count(Namespace::Pending).await, 0);
    let entry = coordinator.ledger().get(&rid("line-2")).await.unwrap();
    assert_eq!(entry.state, RequestState::Abandoned);
    assert_eq!(entry.abandoned_task_ids().len(), 1);
}

#[tokio::test]
async fn test_cancel_withdraws_live_descriptor() {
    let backend = TestMedium::fs();
    let coordinator = Arc::new(Coordinator::new(
        backend.medium.clone(),
        Arc::new(Ledger::new()),
        settings(),
    ));
    let cancel = CancellationToken::new();
    let flow = {
        let (coordinator, cancel) = (coordinator.clone(), cancel.clone());
        tokio::spawn(async move {
            let provider = Provider::new("qwen3", "synthesis", Duration::from_secs(5));
            coordinator
                .dispatch_with_cancel(&rid("line-4"), &provider, "/in/4.txt", provider.deadline, &cancel)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.count(Namespace::Pending).await, 1);
    cancel.cancel();

    let err = flow.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(backend.count(Namespace::Pending).await, 0);
    let entry = coordinator.ledger().get(&rid("line-4")).await.unwrap();
    assert_eq!(entry.last_attempt().unwrap().outcome, Some(AttemptOutcome::Cancelled));
}

#[tokio::test]
async fn test_persistent_ledger_survives_restart() {
    let backend = TestMedium::fs();
    let worker = start_worker(
        &backend.medium,
        "qwen3",
        ScriptedHandler::answering_after(Duration::from_millis(10)),
        true,
    );
    {
        let ledger = Arc::new(Ledger::with_medium(backend.medium.clone()));
        let coordinator = Coordinator::new(backend.medium.clone(), ledger, settings());
        let provider = Provider::new("qwen3", "synthesis", Duration::from_secs(3));
        coordinator
            .dispatch(&rid("line-5"), &provider, "/in/5.txt", provider.deadline)
            .await
            .unwrap();
    }
    worker.stop().await;

    let restored = Ledger::load(backend.medium.clone()).await.unwrap();
    let entry = restored.get(&rid("line-5")).await.unwrap();
    assert_eq!(entry.state, RequestState::Completed);

    restored.archive(&rid("line-5")).await.unwrap();
    assert_eq!(backend.count(Namespace::Ledger).await, 0);
    assert_eq!(backend.count(Namespace::Archive).await, 1);
}
