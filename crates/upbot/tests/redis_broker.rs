//! Queue and schedule index against a live Redis. Run with
//! `REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored`.

use std::time::Duration;

use rand::Rng;
use upbot::queue::{JobQueue, Partition, QueueOptions, ReconnectPolicy, RedisBroker, RoutedJob};
use upbot::schedule::{Dispatch, ScheduleStore};
use upbot::{Endpoint, Job, PlanTier, Region, ScheduleEntry};

async fn broker(max_deliveries: u64) -> RedisBroker {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let options = QueueOptions { max_deliveries, ..QueueOptions::default() };
    RedisBroker::connect(&url, options, &ReconnectPolicy::default()).await.unwrap()
}

fn scratch_partition() -> Partition {
    let suffix: u64 = rand::thread_rng().gen();
    Partition::from_key(format!("upbot:test:{suffix:x}"))
}

fn job(endpoint_id: &str) -> Job {
    Job {
        endpoint_id: endpoint_id.into(),
        url: "https://example.com".into(),
        owner_id: "o1".into(),
        regions: vec![Region::new("r1", "SFO", "San Francisco")],
        timeout_ms: 10_000,
        scheduled_at_ms: 65_000,
    }
}

#[tokio::test]
#[ignore = "needs a running redis"]
async fn consumer_group_round_trip() {
    let broker = broker(5).await;
    let partition = scratch_partition();
    broker.ensure_group(&partition).await.unwrap();
    broker.ensure_group(&partition).await.unwrap();

    let jobs: Vec<_> =
        ["e1", "e2", "e3"].iter().map(|id| RoutedJob { partition: partition.clone(), job: job(id) }).collect();
    assert_eq!(broker.enqueue_bulk(&jobs).await.unwrap(), 3);

    let first = broker.read_next(&partition, "a", 2, Duration::ZERO).await.unwrap();
    let second = broker.read_next(&partition, "b", 10, Duration::from_millis(50)).await.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 1);
    assert_eq!(first[0].job, job("e1"));

    let ids: Vec<String> = first.iter().chain(&second).map(|m| m.id.clone()).collect();
    assert_eq!(broker.ack(&partition, &ids).await.unwrap(), 3);
    let stats = broker.stats(&partition).await.unwrap();
    assert_eq!((stats.length, stats.pending), (0, 0));
}

#[tokio::test]
#[ignore = "needs a running redis"]
async fn stale_entries_are_reclaimed_then_dead_lettered() {
    let broker = broker(2).await;
    let partition = scratch_partition();
    broker.ensure_group(&partition).await.unwrap();
    broker.enqueue_bulk(&[RoutedJob { partition: partition.clone(), job: job("e1") }]).await.unwrap();

    let idle = Duration::from_millis(100);
    assert_eq!(broker.read_next(&partition, "a", 10, Duration::ZERO).await.unwrap().len(), 1);
    assert!(broker.claim_stale(&partition, "b", Duration::from_secs(30), 10).await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(150)).await;
    let claimed = broker.claim_stale(&partition, "b", idle, 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].deliveries, 2);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(broker.claim_stale(&partition, "c", idle, 10).await.unwrap().is_empty());
    let stats = broker.stats(&partition).await.unwrap();
    assert_eq!((stats.length, stats.pending, stats.dead_lettered), (0, 0, 1));
}

#[tokio::test]
#[ignore = "needs a running redis"]
async fn missing_group_is_reported() {
    let broker = broker(5).await;
    let err = broker.read_next(&scratch_partition(), "a", 1, Duration::ZERO).await.unwrap_err();
    assert!(matches!(err, upbot::QueueError::NoGroup { .. }));
}

#[tokio::test]
#[ignore = "needs a running redis and clears the schedule index"]
async fn dispatch_applies_only_to_unmoved_entries() {
    let broker = broker(5).await;
    broker.clear().await.unwrap();
    let partition = scratch_partition();
    broker.ensure_group(&partition).await.unwrap();

    let endpoint = Endpoint::new("e1", "https://example.com", "o1", PlanTier::Pro, 60);
    let entry = ScheduleEntry::new(endpoint.clone(), 1_000);
    assert_eq!(broker.admit(&[entry.clone()]).await.unwrap(), 1);
    assert_eq!(broker.admit(&[ScheduleEntry::new(endpoint, 5)]).await.unwrap(), 0);

    let due = broker.due(2_000, 10).await.unwrap();
    assert_eq!(due, vec![entry.clone()]);

    let dispatch = Dispatch {
        expected_due_ms: 1_000,
        next: entry.rearmed(2_000),
        jobs: vec![RoutedJob { partition: partition.clone(), job: job("e1") }],
    };
    assert_eq!(broker.commit_dispatch(&[dispatch.clone()]).await.unwrap(), 1);
    // Replaying the same dispatch finds the entry moved.
    assert_eq!(broker.commit_dispatch(&[dispatch]).await.unwrap(), 0);

    assert_eq!(broker.stats(&partition).await.unwrap().length, 1);
    assert_eq!(broker.scheduled().await.unwrap()["e1"].due_at_ms, 62_000);
    broker.clear().await.unwrap();
}

#[tokio::test]
#[ignore = "needs a running redis"]
async fn dead_letter_stream_is_capped() {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let options = QueueOptions { max_deliveries: 1, dead_letter_max_len: 10, ..QueueOptions::default() };
    let broker = RedisBroker::connect(&url, options, &ReconnectPolicy::default()).await.unwrap();
    let partition = scratch_partition();
    broker.ensure_group(&partition).await.unwrap();

    let jobs: Vec<_> =
        (0..300).map(|i| RoutedJob { partition: partition.clone(), job: job(&format!("e{i}")) }).collect();
    broker.enqueue_bulk(&jobs).await.unwrap();
    assert_eq!(broker.read_next(&partition, "a", 300, Duration::ZERO).await.unwrap().len(), 300);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(broker.claim_stale(&partition, "b", Duration::from_millis(10), 300).await.unwrap().is_empty());

    let stats = broker.stats(&partition).await.unwrap();
    assert_eq!((stats.length, stats.pending), (0, 0));
    // `MAXLEN ~` trims whole macro nodes, so the cap is approximate.
    assert!(stats.dead_lettered < 300, "dead-letter stream not trimmed: {}", stats.dead_lettered);
}
