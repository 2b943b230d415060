use super::*;
use crate::item::{Item, ItemRef};
use crate::testing::FakeUpstream;
use crate::upstream::ResolvedStream;
use std::time::Duration;

const CS: u64 = 4;

fn ctx(up: Arc<FakeUpstream>, max_retries: u32) -> LaneContext {
    LaneContext {
        upstream: up,
        policy: RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
        network_lock: NetworkLock::new(),
        chunk_size: CS,
    }
}

fn item(url: &str) -> ItemRef {
    let item = Item::new(url);
    item.record().apply_resolved(&ResolvedStream {
        redirect_url: "http://cdn.test/0".into(),
        content_length: 40,
        etag: None,
        expires: None,
        bitrate: None,
    });
    item
}

fn fetch(item: &ItemRef, chunk: u32) -> Task {
    Task::Fetch {
        item: ItemRef::clone(item),
        chunk,
    }
}

async fn next(rx: &mut mpsc::Receiver<LaneReport>) -> LaneReport {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("lane report")
        .expect("lane alive")
}

#[tokio::test]
async fn high_priority_jumps_the_queue() {
    let (up, release) = FakeUpstream::new((0..40).collect()).gated();
    let up = Arc::new(up);
    let (tx, mut rx) = mpsc::channel(16);
    let lane = WorkerLane::spawn("fetch", ctx(Arc::clone(&up), 0), tx);
    let it = item("http://x/a");

    lane.submit(fetch(&it, 0), Priority::Low).unwrap();
    // Let the first task reach the gate before queueing the rest.
    tokio::time::sleep(Duration::from_millis(50)).await;
    lane.submit(fetch(&it, 1), Priority::Low).unwrap();
    lane.submit(fetch(&it, 2), Priority::Low).unwrap();
    lane.submit(fetch(&it, 3), Priority::High).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    release.send(()).unwrap();

    for _ in 0..4 {
        assert!(matches!(next(&mut rx).await, LaneReport::Finished { .. }));
    }
    assert_eq!(up.log(), vec!["fetch:0", "fetch:12", "fetch:4", "fetch:8"]);
    lane.shutdown().await;
}

#[tokio::test]
async fn retries_then_succeeds() {
    let up = Arc::new(FakeUpstream::new((0..40).collect()));
    up.push_fetch_status(500);
    up.push_fetch_status(503);
    let (tx, mut rx) = mpsc::channel(16);
    let lane = WorkerLane::spawn("fetch", ctx(Arc::clone(&up), 3), tx);
    let it = item("http://x/a");

    lane.submit(fetch(&it, 1), Priority::High).unwrap();
    match next(&mut rx).await {
        LaneReport::Finished {
            outcome: TaskOutcome::Fetched(Some(data)),
            priority,
            ..
        } => {
            assert_eq!(data, vec![4, 5, 6, 7]);
            assert_eq!(priority, Priority::High);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(up.count("fetch"), 3);
    lane.shutdown().await;
}

#[tokio::test]
async fn gives_up_after_max_retries() {
    let up = Arc::new(FakeUpstream::new((0..40).collect()));
    for _ in 0..10 {
        up.push_fetch_status(500);
    }
    let (tx, mut rx) = mpsc::channel(16);
    let lane = WorkerLane::spawn("fetch", ctx(Arc::clone(&up), 2), tx);
    let it = item("http://x/a");

    lane.submit(fetch(&it, 0), Priority::Low).unwrap();
    match next(&mut rx).await {
        LaneReport::GaveUp { error, priority, .. } => {
            assert!(matches!(error, TaskError::Http(500)));
            assert_eq!(priority, Priority::Low);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(up.count("fetch"), 3);
    lane.shutdown().await;
}

#[tokio::test]
async fn unavailable_item_is_not_retried() {
    let up = Arc::new(FakeUpstream::new((0..40).collect()));
    up.push_fetch_status(500);
    let (tx, mut rx) = mpsc::channel(16);
    let lane = WorkerLane::spawn("fetch", ctx(Arc::clone(&up), 3), tx);
    let it = item("http://x/a");
    it.record().unavailable = true;

    lane.submit(fetch(&it, 0), Priority::High).unwrap();
    assert!(matches!(next(&mut rx).await, LaneReport::GaveUp { .. }));
    assert_eq!(up.count("fetch"), 1);
    lane.shutdown().await;
}

#[tokio::test]
async fn drop_low_priority_reports_dropped_tasks() {
    let (up, release) = FakeUpstream::new((0..40).collect()).gated();
    let up = Arc::new(up);
    let (tx, mut rx) = mpsc::channel(16);
    let lane = WorkerLane::spawn("fetch", ctx(Arc::clone(&up), 0), tx);
    let it = item("http://x/a");

    lane.submit(fetch(&it, 0), Priority::High).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    lane.submit(fetch(&it, 1), Priority::Low).unwrap();
    lane.submit(fetch(&it, 2), Priority::Low).unwrap();
    lane.submit(fetch(&it, 3), Priority::High).unwrap();
    assert!(lane.drop_low_priority());
    release.send(()).unwrap();

    let mut finished = 0;
    let mut dropped = 0;
    for _ in 0..3 {
        match next(&mut rx).await {
            LaneReport::Finished { .. } => finished += 1,
            LaneReport::Dropped { tasks } => dropped += tasks.len(),
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!((finished, dropped), (2, 2));
    assert_eq!(up.log(), vec!["fetch:0", "fetch:12"]);
    lane.shutdown().await;
}

#[tokio::test]
async fn network_lock_held_only_during_task() {
    let (up, release) = FakeUpstream::new((0..40).collect()).gated();
    let up = Arc::new(up);
    let (tx, mut rx) = mpsc::channel(16);
    let context = ctx(Arc::clone(&up), 0);
    let lock = Arc::clone(&context.network_lock);
    let lane = WorkerLane::spawn("fetch", context, tx);
    let it = item("http://x/a");

    assert!(!lock.is_held());
    lane.submit(fetch(&it, 0), Priority::High).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(lock.is_held());
    release.send(()).unwrap();
    next(&mut rx).await;
    assert!(!lock.is_held());
    lane.shutdown().await;
}
