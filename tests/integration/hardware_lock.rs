//! Accelerator serialization across independent lock clients.
//!
//! Each `HardwareLock` here stands in for a separate process: they share
//! nothing but the medium.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;

use handoff::lock::HardwareLock;
use handoff::medium::Namespace;
use handoff::orchestration::{DispatchEvent, DispatchRequest, Provider};
use handoff::Error;

use crate::fixtures::*;

const RESOURCE: &str = "accelerator";

#[tokio::test]
async fn test_concurrent_acquirers_are_serialized() {
    for backend in TestMedium::both() {
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));
        let served = Arc::new(AtomicUsize::new(0));

        let flows = (0..6).map(|i| {
            let medium = backend.medium.clone();
            let (inside, max_inside, served) = (inside.clone(), max_inside.clone(), served.clone());
            async move {
                let lock = HardwareLock::new(medium, POLL);
                let token = lock
                    .acquire(RESOURCE, &format!("flow-{}", i), Duration::from_secs(5), Duration::from_secs(10))
                    .await
                    .unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(15)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                served.fetch_add(1, Ordering::SeqCst);
                lock.release(&token).await.unwrap();
            }
        });
        join_all(flows).await;

        assert_eq!(served.load(Ordering::SeqCst), 6);
        assert_eq!(max_inside.load(Ordering::SeqCst), 1, "two holders at once");
        assert_eq!(backend.count(Namespace::Locks).await, 0, "lock or tickets left behind");
    }
}

#[tokio::test]
async fn test_crashed_holder_recovered_at_lease_expiry() {
    for backend in TestMedium::both() {
        let crashed = HardwareLock::new(backend.medium.clone(), POLL);
        let stale = crashed
            .acquire(RESOURCE, "crashed", Duration::from_millis(300), Duration::from_secs(1))
            .await
            .unwrap();
        // Never renewed, never released.

        let waiter = HardwareLock::new(backend.medium.clone(), POLL);
        let token = waiter
            .acquire(RESOURCE, "survivor", Duration::from_secs(5), Duration::from_secs(3))
            .await
            .unwrap();
        let acquired_at = Utc::now();

        assert!(acquired_at >= stale.lease_expires_at, "taken before expiry");
        let lag = (acquired_at - stale.lease_expires_at).to_std().unwrap();
        assert!(lag < Duration::from_millis(200), "recovered {:?} late", lag);
        assert_eq!(token.generation, stale.generation + 1);

        // The crashed holder waking up must not free the survivor's lease.
        crashed.release(&stale).await.unwrap();
        assert_eq!(waiter.holder(RESOURCE).await.unwrap(), Some(token));
    }
}

#[tokio::test]
async fn test_waiter_gives_up_as_busy() {
    let backend = TestMedium::fs();
    let holder = HardwareLock::new(backend.medium.clone(), POLL);
    let _token = holder
        .acquire(RESOURCE, "long-job", Duration::from_secs(30), Duration::from_secs(1))
        .await
        .unwrap();

    let impatient = HardwareLock::new(backend.medium.clone(), POLL);
    let started = Instant::now();
    let err = impatient
        .acquire(RESOURCE, "impatient", Duration::from_secs(5), Duration::from_millis(100))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::LockTimeout { .. }));
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(impatient.waiters(RESOURCE).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_accelerator_bound_requests_run_back_to_back() {
    let backend = TestMedium::memory();
    let hold = Duration::from_millis(120);
    let primary = Provider::new("qwen3", "synthesis", Duration::from_secs(3)).with_accelerator();
    // Two workers, so only the lock keeps the tasks apart.
    let handler = ScriptedHandler::answering_after(hold);
    let workers = [
        start_worker(&backend.medium, "qwen3", handler.clone(), true),
        start_worker(&backend.medium, "qwen3", handler.clone(), true),
    ];
    let (dispatcher, mut rx) = dispatcher(&backend.medium, policy(primary, None));

    let requests = [
        DispatchRequest::new(rid("gpu-a"), "synthesis", "/in/a.txt"),
        DispatchRequest::new(rid("gpu-b"), "synthesis", "/in/b.txt"),
    ];
    let outcomes = dispatcher.run_batch(&requests).await;

    assert!(outcomes.iter().all(|o| o.is_ok()));
    assert_eq!(handler.calls(), 2);
    assert_eq!(handler.max_running(), 1, "tasks overlapped on the accelerator");

    let lock_events: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                DispatchEvent::LockAcquired { .. } | DispatchEvent::LockReleased { .. }
            )
        })
        .collect();
    assert_eq!(lock_events.len(), 4);
    let (first, second) = (lock_events[0].request_id(), lock_events[2].request_id());
    assert_ne!(first, second);
    assert!(matches!(&lock_events[0], DispatchEvent::LockAcquired { .. }));
    assert!(matches!(&lock_events[1], DispatchEvent::LockReleased { request_id, .. } if request_id == first));
    assert!(matches!(&lock_events[2], DispatchEvent::LockAcquired { .. }));
    assert!(matches!(&lock_events[3], DispatchEvent::LockReleased { request_id, .. } if request_id == second));

    assert!(dispatcher.coordinator().lock().holder(RESOURCE).await.unwrap().is_none());
    for worker in workers {
        worker.stop().await;
    }
}

#[tokio::test]
async fn test_fifo_order_is_arrival_order() {
    let backend = TestMedium::memory();
    let first = HardwareLock::new(backend.medium.clone(), POLL);
    let token = first
        .acquire(RESOURCE, "first", Duration::from_secs(5), Duration::from_secs(1))
        .await
        .unwrap();

    let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let mut joins = Vec::new();
    for name in ["second", "third", "fourth"] {
        let (medium, order) = (backend.medium.clone(), order.clone());
        joins.push(tokio::spawn(async move {
            let lock = HardwareLock::new(medium, POLL);
            let token = lock
                .acquire(RESOURCE, name, Duration::from_secs(5), Duration::from_secs(5))
                .await
                .unwrap();
            order.lock().await.push(name);
            tokio::time::sleep(Duration::from_millis(5)).await;
            lock.release(&token).await.unwrap();
        }));
        // Stagger arrivals so enqueue order is unambiguous.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(first.waiters(RESOURCE).await.unwrap().len(), 3);
    first.release(&token).await.unwrap();
    for join in joins {
        join.await.unwrap();
    }
    assert_eq!(*order.lock().await, vec!["second", "third", "fourth"]);
}
