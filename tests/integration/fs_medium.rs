//! Filesystem medium shared by several handles, as separate processes would.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use handoff::medium::{ChangeKind, ChangeWaiter, FsMedium, Medium, WaitOutcome};

fn open_pair() -> (TempDir, Arc<FsMedium>, Arc<FsMedium>) {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let a = Arc::new(FsMedium::open(dir.path()).unwrap());
    let b = Arc::new(FsMedium::open(dir.path()).unwrap());
    (dir, a, b)
}

#[tokio::test]
async fn test_writes_visible_across_handles() {
    let (_dir, a, b) = open_pair();
    a.put("pending/t1.task", b"descriptor".to_vec()).await.unwrap();

    assert_eq!(b.get("pending/t1.task").await.unwrap(), Some(b"descriptor".to_vec()));
    assert_eq!(b.list("pending/").await.unwrap(), vec!["pending/t1.task".to_string()]);
    assert!(b.delete("pending/t1.task").await.unwrap());
    assert!(a.get("pending/t1.task").await.unwrap().is_none());
}

#[tokio::test]
async fn test_exclusive_create_has_one_winner() {
    let (_dir, a, b) = open_pair();
    let attempts = (0..8).map(|i| {
        let medium = if i % 2 == 0 { a.clone() } else { b.clone() };
        async move {
            medium
                .create("claims/t1.claim", format!("worker-{}", i).into_bytes())
                .await
                .unwrap()
        }
    });
    let winners = join_all(attempts).await.into_iter().filter(|won| *won).count();
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_compare_and_swap_has_one_winner() {
    let (_dir, a, b) = open_pair();
    a.put("locks/gpu.lock", b"gen-1".to_vec()).await.unwrap();

    let swaps = (0..6).map(|i| {
        let medium = if i % 2 == 0 { a.clone() } else { b.clone() };
        async move {
            medium
                .compare_and_swap("locks/gpu.lock", b"gen-1", Some(format!("gen-2-{}", i).into_bytes()))
                .await
                .unwrap()
        }
    });
    let winners = join_all(swaps).await.into_iter().filter(|won| *won).count();
    assert_eq!(winners, 1);
    let stored = a.get("locks/gpu.lock").await.unwrap().unwrap();
    assert!(stored.starts_with(b"gen-2-"));
}

#[tokio::test]
async fn test_watch_wakes_waiter_before_poll_interval() {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let watched = FsMedium::open(dir.path()).unwrap().with_watch().unwrap();
    let writer = FsMedium::open(dir.path()).unwrap();

    let mut waiter = ChangeWaiter::new(&watched, Duration::from_secs(10));
    let cancel = CancellationToken::new();
    let write = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        writer.put("results/t9.result", b"{}".to_vec()).await.unwrap();
    });

    let started = Instant::now();
    let outcome = waiter
        .wait(Duration::from_secs(10), &cancel, |e| {
            e.key == "results/t9.result" && e.kind == ChangeKind::Written
        })
        .await;
    write.await.unwrap();

    assert_eq!(outcome, WaitOutcome::Changed);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_unwatched_medium_falls_back_to_polling() {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let medium = FsMedium::open(dir.path()).unwrap();
    assert!(medium.subscribe().is_none());

    let mut waiter = ChangeWaiter::new(&medium, Duration::from_millis(20));
    let outcome = waiter
        .wait(Duration::from_secs(1), &CancellationToken::new(), |_| true)
        .await;
    assert_eq!(outcome, WaitOutcome::Elapsed);
}
