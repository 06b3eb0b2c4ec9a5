// crates/flowcore/tests/broadcast_test.rs

use flowcore::{BroadcastJobError, BroadcastMetadata, BroadcastQueue};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test]
async fn test_jobs_run_one_at_a_time_in_arrival_order() {
    let queue = BroadcastQueue::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..10u64 {
        let order = order.clone();
        let active = active.clone();
        let max_active = max_active.clone();
        let handle = queue.enqueue(BroadcastMetadata::new(format!("job-{i}")), async move {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            max_active.fetch_max(now, Ordering::SeqCst);
            // Earlier jobs sleep longer; overlap would reorder them
            tokio::time::sleep(Duration::from_millis(20 - i)).await;
            order.lock().unwrap().push(i);
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(i)
        });
        handles.push(handle);
    }

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.wait().await, Ok(i as u64));
    }

    assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    assert_eq!(max_active.load(Ordering::SeqCst), 1, "jobs overlapped");
}

#[tokio::test]
async fn test_concurrent_submitters_never_overlap() {
    let queue = BroadcastQueue::new();
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));

    let mut submitters = Vec::new();
    for i in 0..8 {
        let queue = queue.clone();
        let active = active.clone();
        let max_active = max_active.clone();
        submitters.push(tokio::spawn(async move {
            let handle = queue.enqueue(BroadcastMetadata::new(format!("node-{i}")), async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
            handle.wait().await
        }));
    }

    for submitter in submitters {
        assert_eq!(submitter.await.unwrap(), Ok(()));
    }
    assert_eq!(max_active.load(Ordering::SeqCst), 1);
    assert!(queue.is_idle());
}

#[tokio::test]
async fn test_failing_job_does_not_block_later_jobs() {
    let queue = BroadcastQueue::new();

    let first = queue.enqueue(BroadcastMetadata::new("first"), async {
        Err::<(), _>(BroadcastJobError::Failed("transmitter busy".to_string()))
    });
    let second = queue.enqueue(BroadcastMetadata::new("second"), async { Ok("sent") });

    assert_eq!(
        first.wait().await,
        Err(BroadcastJobError::Failed("transmitter busy".to_string()))
    );
    assert_eq!(second.wait().await, Ok("sent"));

    let stats = queue.stats();
    assert_eq!(stats.enqueued, 2);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);
}

#[tokio::test]
async fn test_panicking_job_rejects_only_its_own_handle() {
    let queue = BroadcastQueue::new();

    let bad = queue.enqueue(BroadcastMetadata::new("bad"), async {
        if true {
            panic!("antenna fell off");
        }
        Ok(())
    });
    let good = queue.enqueue(BroadcastMetadata::new("good"), async { Ok(7) });

    match bad.wait().await {
        Err(BroadcastJobError::Panicked(message)) => assert!(message.contains("antenna fell off")),
        other => panic!("expected panic error, got {:?}", other),
    }
    assert_eq!(good.wait().await, Ok(7));
}

#[tokio::test]
async fn test_job_timeout_abandons_slow_job() {
    let queue = BroadcastQueue::with_job_timeout(Some(Duration::from_millis(20)));

    let slow = queue.enqueue(BroadcastMetadata::new("slow"), async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(())
    });
    let next = queue.enqueue(BroadcastMetadata::new("next"), async { Ok(()) });

    assert_eq!(
        slow.wait().await,
        Err(BroadcastJobError::TimedOut(Duration::from_millis(20)))
    );
    assert_eq!(next.wait().await, Ok(()));
}

#[tokio::test]
async fn test_queue_goes_idle_and_restarts() {
    let queue = BroadcastQueue::new();
    assert!(queue.is_idle());

    let handle = queue.enqueue(BroadcastMetadata::new("a").on_channel("146.52"), async { Ok(1) });
    assert_eq!(handle.metadata().channel.as_deref(), Some("146.52"));
    assert_eq!(handle.wait().await, Ok(1));

    // The drain clears its flag right after the last job settles
    for _ in 0..50 {
        if queue.is_idle() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(queue.is_idle());

    let again = queue.enqueue(BroadcastMetadata::new("b"), async { Ok(2) });
    assert_eq!(again.wait().await, Ok(2));
    assert_eq!(queue.stats().completed, 2);
}
