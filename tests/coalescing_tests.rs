use feedmetadb::{CoalescingKey, CoalescingQueue, FlushAction};
use futures::FutureExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::sleep;

fn counting_action(counter: Arc<AtomicUsize>) -> FlushAction {
    Arc::new(move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        .boxed()
    })
}

#[tokio::test]
async fn rapid_signals_coalesce_into_one_invocation() {
    let queue = CoalescingQueue::new("test", Duration::from_millis(100));
    let counter = Arc::new(AtomicUsize::new(0));
    let key = CoalescingKey::from_raw(7);

    queue.add(key, counting_action(counter.clone()));
    queue.add(key, counting_action(counter.clone()));
    queue.add(key, counting_action(counter.clone()));

    sleep(Duration::from_millis(400)).await;

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(queue.pending_count(), 0);
}

#[tokio::test]
async fn requests_in_separate_windows_fire_separately() {
    let queue = CoalescingQueue::new("test", Duration::from_millis(100));
    let counter = Arc::new(AtomicUsize::new(0));
    let key = CoalescingKey::from_raw(1);

    queue.add(key, counting_action(counter.clone()));
    sleep(Duration::from_millis(300)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    queue.add(key, counting_action(counter.clone()));
    sleep(Duration::from_millis(300)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn distinct_keys_flush_independently() {
    let queue = CoalescingQueue::new("test", Duration::from_millis(100));
    let counter = Arc::new(AtomicUsize::new(0));

    queue.add(CoalescingKey::from_raw(1), counting_action(counter.clone()));
    queue.add(CoalescingKey::from_raw(2), counting_action(counter.clone()));
    assert_eq!(queue.pending_count(), 2);

    sleep(Duration::from_millis(400)).await;

    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn no_invocation_without_a_request() {
    let queue = CoalescingQueue::new("test", Duration::from_millis(50));
    let counter = Arc::new(AtomicUsize::new(0));
    let _unused = counting_action(counter.clone());

    sleep(Duration::from_millis(200)).await;

    assert_eq!(counter.load(Ordering::SeqCst), 0);
    assert_eq!(queue.pending_count(), 0);
}

#[tokio::test]
async fn perform_pending_now_runs_actions_immediately() {
    let queue = CoalescingQueue::new("test", Duration::from_secs(60));
    let counter = Arc::new(AtomicUsize::new(0));

    queue.add(CoalescingKey::from_raw(1), counting_action(counter.clone()));
    queue.add(CoalescingKey::from_raw(2), counting_action(counter.clone()));

    queue.perform_pending_now().await;

    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(queue.pending_count(), 0);

    // The aborted timers must not fire a second time.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn add_during_a_running_window_is_coalesced_not_queued() {
    let queue = CoalescingQueue::new("test", Duration::from_millis(150));
    let counter = Arc::new(AtomicUsize::new(0));
    let key = CoalescingKey::from_raw(3);

    queue.add(key, counting_action(counter.clone()));
    sleep(Duration::from_millis(50)).await;
    queue.add(key, counting_action(counter.clone()));

    sleep(Duration::from_millis(400)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}
