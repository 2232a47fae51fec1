//! Recovering the medium after crashed orchestrators, workers and holders.

use std::time::Duration;

use chrono::Utc;

use handoff::cleanup::{SweepConfig, Sweeper};
use handoff::core::{ResultArtifact, TaskDescriptor};
use handoff::ledger::{Ledger, RequestState};
use handoff::lock::{HardwareLock, QueueTicket};
use handoff::medium::{keys, Namespace};

use crate::fixtures::*;

#[tokio::test]
async fn test_sweep_after_crashes_leaves_clean_medium() {
    let backend = TestMedium::fs();
    let medium = backend.medium.clone();

    // Orchestrator died while waiting: descriptor far past its deadline.
    let orphan = TaskDescriptor::new("synthesis", "qwen3", "/in/x.txt", Duration::ZERO);
    medium
        .put(&keys::pending(&orphan.task_id), orphan.to_bytes().unwrap())
        .await
        .unwrap();
    // A worker then answered it and left its claim.
    let ghost = ResultArtifact::ok(orphan.task_id, "/out/x.wav");
    medium
        .put(&keys::result(&orphan.task_id), ghost.to_bytes().unwrap())
        .await
        .unwrap();
    medium
        .put(&keys::claim(&orphan.task_id), b"{}".to_vec())
        .await
        .unwrap();
    // Lock holder died mid-lease; a waiter died in the queue.
    let lock = HardwareLock::new(medium.clone(), POLL);
    lock.acquire("accelerator", "dead-holder", Duration::from_millis(5), Duration::from_secs(1))
        .await
        .unwrap();
    let ticket = QueueTicket {
        holder_id: "dead-waiter".to_string(),
        enqueued_at: Utc::now(),
        heartbeat_expires_at: Utc::now() - chrono::Duration::seconds(1),
    };
    medium
        .put(
            &keys::ticket("accelerator", "00000000000000000042-dead-waiter-0badf00d"),
            ticket.to_bytes().unwrap(),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let sweeper = Sweeper::new(medium.clone(), SweepConfig { grace: Duration::ZERO });
    let first = sweeper.sweep(None).await.unwrap();
    assert_eq!(first.orphaned_descriptors.len(), 1);
    assert_eq!(first.expired_locks.len(), 1);
    assert_eq!(first.dead_tickets.len(), 1);
    assert_eq!(first.dangling_claims, Vec::<String>::new(), "claim judged before descriptor removal");
    assert!(first.is_success());

    // With the descriptor gone the result and claim are leftovers too.
    let second = sweeper.sweep(None).await.unwrap();
    assert_eq!(second.stale_results, vec![keys::result(&orphan.task_id)]);
    assert_eq!(second.dangling_claims, vec![keys::claim(&orphan.task_id)]);

    assert!(sweeper.scan(None).await.unwrap().is_clean());
    for ns in Namespace::ALL {
        if ns != Namespace::Ledger && ns != Namespace::Archive {
            assert_eq!(backend.count(ns).await, 0, "{} not empty", ns);
        }
    }
}

#[tokio::test]
async fn test_sweep_respects_live_requests() {
    let backend = TestMedium::memory();
    let medium = backend.medium.clone();
    let ledger = Ledger::new();
    let request = rid("live-1");
    ledger.create(&request).await.unwrap();

    let live = TaskDescriptor::new("synthesis", "qwen3", "/in/live.txt", Duration::from_secs(60));
    ledger
        .begin_attempt(&request, RequestState::Pending, RequestState::Dispatched, live.task_id, "qwen3")
        .await
        .unwrap();
    medium
        .put(&keys::pending(&live.task_id), live.to_bytes().unwrap())
        .await
        .unwrap();
    let stray = TaskDescriptor::new("synthesis", "qwen3", "/in/stray.txt", Duration::from_secs(60));
    medium
        .put(&keys::pending(&stray.task_id), stray.to_bytes().unwrap())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let sweeper = Sweeper::new(medium.clone(), SweepConfig { grace: Duration::ZERO });
    let report = sweeper.sweep(Some(&ledger)).await.unwrap();

    assert_eq!(report.orphaned_descriptors, vec![keys::pending(&stray.task_id)]);
    assert!(medium.get(&keys::pending(&live.task_id)).await.unwrap().is_some());
}

#[tokio::test]
async fn test_sweep_never_frees_a_held_lock() {
    let backend = TestMedium::fs();
    let lock = HardwareLock::new(backend.medium.clone(), POLL);
    let held = lock
        .acquire("accelerator", "busy", Duration::from_secs(30), Duration::from_secs(1))
        .await
        .unwrap();

    let report = Sweeper::with_defaults(backend.medium.clone()).sweep(None).await.unwrap();
    assert!(report.is_clean());
    assert_eq!(lock.holder("accelerator").await.unwrap(), Some(held));
}
