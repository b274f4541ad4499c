//! In-process broker with the same contract as [`RedisBroker`](super::RedisBroker).
//!
//! Holds the schedule index and every partition behind one mutex, so each
//! operation is atomic the same way a single Redis command or script is.
//! Delivery times come from an injected [`Clock`], which lets idle thresholds
//! be exercised without sleeping.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

use super::wire::{self, Fields};
use super::{
    DeadLetter, DeliveryState, JobQueue, Partition, QueueMessage, QueueOptions, QueueStats, RoutedJob,
    REASON_MALFORMED, REASON_MAX_DELIVERIES,
};
use crate::clock::{Clock, SystemClock};
use crate::error::QueueError;
use crate::model::{Endpoint, Job, ScheduleEntry};
use crate::schedule::{Dispatch, ScheduleStore};

#[derive(Debug, Clone)]
struct Pending {
    consumer: String,
    delivered_at_ms: i64,
    deliveries: u64,
}

#[derive(Debug, Default)]
struct Group {
    /// Index of the next never-delivered entry.
    cursor: usize,
    pending: BTreeMap<usize, Pending>,
    /// Entries acked or dead-lettered. Their fields are dropped, the same
    /// as an `XDEL`.
    acked: HashSet<usize>,
}

#[derive(Debug, Default)]
struct Stream {
    entries: Vec<(String, Fields)>,
    index: HashMap<String, usize>,
    group: Option<Group>,
    dead: Vec<DeadLetter>,
}

impl Stream {
    fn append(&mut self, id: String, fields: Fields) {
        self.index.insert(id.clone(), self.entries.len());
        self.entries.push((id, fields));
    }

    fn live(&self) -> usize {
        self.entries.len() - self.group.as_ref().map_or(0, |g| g.acked.len())
    }
}

/// Empty an acked entry's payload and hand it back.
fn retire(entries: &mut [(String, Fields)], idx: usize) -> Fields {
    std::mem::take(&mut entries[idx].1)
}

/// Append a dead letter, dropping the oldest ones beyond `cap`.
fn bury(dead: &mut Vec<DeadLetter>, letter: DeadLetter, cap: usize) {
    dead.push(letter);
    if dead.len() > cap {
        let excess = dead.len() - cap;
        dead.drain(..excess);
    }
}

#[derive(Debug, Default)]
struct State {
    streams: HashMap<Partition, Stream>,
    schedule: HashMap<String, ScheduleEntry>,
    seq: u64,
}

impl State {
    fn append(&mut self, partition: &Partition, fields: Fields, now_ms: i64) -> String {
        self.seq += 1;
        let id = format!("{now_ms}-{}", self.seq);
        self.streams.entry(partition.clone()).or_default().append(id.clone(), fields);
        id
    }
}

pub struct MemoryBroker {
    state: Mutex<State>,
    arrivals: Notify,
    clock: Arc<dyn Clock>,
    options: QueueOptions,
}

impl MemoryBroker {
    pub fn new(options: QueueOptions, clock: Arc<dyn Clock>) -> Self {
        Self { state: Mutex::new(State::default()), arrivals: Notify::new(), clock, options }
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Append raw fields, bypassing the codec.
    pub fn enqueue_raw(&self, partition: &Partition, fields: Fields) -> String {
        let now = self.clock.now_ms();
        let id = self.lock().append(partition, fields, now);
        self.arrivals.notify_waiters();
        id
    }

    pub fn delivery_state(&self, partition: &Partition, id: &str) -> Option<DeliveryState> {
        let state = self.lock();
        let stream = state.streams.get(partition)?;
        let idx = *stream.index.get(id)?;
        let Some(group) = stream.group.as_ref() else {
            return Some(DeliveryState::PendingDelivery);
        };

        if let Some(pending) = group.pending.get(&idx) {
            Some(DeliveryState::DeliveredUnacked {
                consumer: pending.consumer.clone(),
                deliveries: pending.deliveries,
            })
        } else if group.acked.contains(&idx) {
            Some(DeliveryState::Acknowledged)
        } else {
            Some(DeliveryState::PendingDelivery)
        }
    }

    pub fn dead_letters(&self, partition: &Partition) -> Vec<DeadLetter> {
        self.lock().streams.get(partition).map(|s| s.dead.clone()).unwrap_or_default()
    }

    /// Decodable jobs still held by `partition`, delivered or not. Acked
    /// entries are gone.
    pub fn jobs(&self, partition: &Partition) -> Vec<Job> {
        let state = self.lock();
        let Some(stream) = state.streams.get(partition) else {
            return Vec::new();
        };
        let acked = stream.group.as_ref().map(|g| &g.acked);
        stream
            .entries
            .iter()
            .enumerate()
            .filter(|(idx, _)| !acked.is_some_and(|acked| acked.contains(idx)))
            .filter_map(|(_, (_, fields))| wire::decode_pairs(fields).ok())
            .collect()
    }

    pub fn entry(&self, endpoint_id: &str) -> Option<ScheduleEntry> {
        self.lock().schedule.get(endpoint_id).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver_new(
        &self,
        partition: &Partition,
        consumer: &str,
        max_count: usize,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let now = self.clock.now_ms();
        let cap = self.options.dead_letter_max_len;
        let mut state = self.lock();
        let Stream { entries, group, dead, .. } =
            state.streams.get_mut(partition).ok_or_else(|| no_group(partition))?;
        let group = group.as_mut().ok_or_else(|| no_group(partition))?;

        let mut delivered = Vec::new();
        while delivered.len() < max_count && group.cursor < entries.len() {
            let idx = group.cursor;
            group.cursor += 1;
            let id = entries[idx].0.clone();

            match wire::decode_pairs(&entries[idx].1) {
                Ok(job) => {
                    group.pending.insert(
                        idx,
                        Pending { consumer: consumer.to_string(), delivered_at_ms: now, deliveries: 1 },
                    );
                    delivered.push(QueueMessage { id, partition: partition.clone(), job, deliveries: 1 });
                }
                Err(e) => {
                    warn!(partition = %partition, id = %id, error = %e, "quarantining malformed message");
                    group.acked.insert(idx);
                    let letter = DeadLetter {
                        source_id: id,
                        reason: REASON_MALFORMED.to_string(),
                        deliveries: 1,
                        fields: retire(entries, idx),
                    };
                    bury(dead, letter, cap);
                }
            }
        }

        Ok(delivered)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(QueueOptions::default(), Arc::new(SystemClock))
    }
}

fn no_group(partition: &Partition) -> QueueError {
    QueueError::NoGroup { partition: partition.to_string() }
}

#[async_trait]
impl JobQueue for MemoryBroker {
    async fn ensure_group(&self, partition: &Partition) -> Result<(), QueueError> {
        let mut state = self.lock();
        let stream = state.streams.entry(partition.clone()).or_default();
        if stream.group.is_none() {
            stream.group = Some(Group::default());
        }
        Ok(())
    }

    async fn enqueue_bulk(&self, jobs: &[RoutedJob]) -> Result<usize, QueueError> {
        let encoded = jobs
            .iter()
            .map(|routed| -> Result<_, QueueError> { Ok((&routed.partition, wire::encode(&routed.job)?)) })
            .collect::<Result<Vec<_>, QueueError>>()?;

        let now = self.clock.now_ms();
        {
            let mut state = self.lock();
            for (partition, fields) in encoded {
                state.append(partition, fields, now);
            }
        }
        self.arrivals.notify_waiters();
        Ok(jobs.len())
    }

    async fn read_next(
        &self,
        partition: &Partition,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let deadline = Instant::now() + block;
        loop {
            // Registered before looking so an append in between still wakes us.
            let arrived = self.arrivals.notified();

            let delivered = self.deliver_new(partition, consumer, max_count)?;
            if !delivered.is_empty() || block.is_zero() {
                return Ok(delivered);
            }

            if tokio::time::timeout_at(deadline, arrived).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn claim_stale(
        &self,
        partition: &Partition,
        consumer: &str,
        idle: Duration,
        max_count: usize,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let now = self.clock.now_ms();
        let idle_ms = i64::try_from(idle.as_millis()).unwrap_or(i64::MAX);
        let max_deliveries = self.options.max_deliveries;
        let cap = self.options.dead_letter_max_len;

        let mut state = self.lock();
        let Stream { entries, group, dead, .. } =
            state.streams.get_mut(partition).ok_or_else(|| no_group(partition))?;
        let group = group.as_mut().ok_or_else(|| no_group(partition))?;

        let stale: Vec<(usize, Pending)> = group
            .pending
            .iter()
            .filter(|(_, p)| now - p.delivered_at_ms >= idle_ms)
            .take(max_count)
            .map(|(idx, p)| (*idx, p.clone()))
            .collect();

        let mut claimed = Vec::new();
        for (idx, pending) in stale {
            let id = entries[idx].0.clone();

            let outcome = if pending.deliveries >= max_deliveries {
                Err(REASON_MAX_DELIVERIES)
            } else {
                wire::decode_pairs(&entries[idx].1).map_err(|e| {
                    warn!(partition = %partition, id = %id, error = %e, "quarantining malformed message");
                    REASON_MALFORMED
                })
            };

            match outcome {
                Ok(job) => {
                    let deliveries = pending.deliveries + 1;
                    group.pending.insert(
                        idx,
                        Pending { consumer: consumer.to_string(), delivered_at_ms: now, deliveries },
                    );
                    claimed.push(QueueMessage { id, partition: partition.clone(), job, deliveries });
                }
                Err(reason) => {
                    group.pending.remove(&idx);
                    group.acked.insert(idx);
                    let letter = DeadLetter {
                        source_id: id,
                        reason: reason.to_string(),
                        deliveries: pending.deliveries,
                        fields: retire(entries, idx),
                    };
                    bury(dead, letter, cap);
                }
            }
        }

        Ok(claimed)
    }

    async fn ack(&self, partition: &Partition, ids: &[String]) -> Result<u64, QueueError> {
        let mut state = self.lock();
        let Some(stream) = state.streams.get_mut(partition) else {
            return Ok(0);
        };
        let Some(group) = stream.group.as_mut() else {
            return Err(no_group(partition));
        };

        let mut acked = 0;
        for id in ids {
            if let Some(&idx) = stream.index.get(id) {
                if group.pending.remove(&idx).is_some() {
                    group.acked.insert(idx);
                    retire(&mut stream.entries, idx);
                    acked += 1;
                }
            }
        }
        Ok(acked)
    }

    async fn stats(&self, partition: &Partition) -> Result<QueueStats, QueueError> {
        let state = self.lock();
        Ok(state
            .streams
            .get(partition)
            .map(|s| QueueStats {
                length: s.live() as u64,
                pending: s.group.as_ref().map_or(0, |g| g.pending.len() as u64),
                dead_lettered: s.dead.len() as u64,
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl ScheduleStore for MemoryBroker {
    async fn admit(&self, entries: &[ScheduleEntry]) -> Result<usize, QueueError> {
        let mut state = self.lock();
        let mut admitted = 0;
        for entry in entries {
            if !state.schedule.contains_key(entry.endpoint_id()) {
                state.schedule.insert(entry.endpoint_id().to_string(), entry.clone());
                admitted += 1;
            }
        }
        Ok(admitted)
    }

    async fn due(&self, now_ms: i64, limit: usize) -> Result<Vec<ScheduleEntry>, QueueError> {
        let state = self.lock();
        let mut due: Vec<ScheduleEntry> = state.schedule.values().filter(|e| e.is_due(now_ms)).cloned().collect();
        due.sort_by(|a, b| a.due_at_ms.cmp(&b.due_at_ms).then_with(|| a.endpoint.id.cmp(&b.endpoint.id)));
        due.truncate(limit);
        Ok(due)
    }

    async fn commit_dispatch(&self, batch: &[Dispatch]) -> Result<usize, QueueError> {
        let mut encoded = Vec::with_capacity(batch.len());
        for dispatch in batch {
            let jobs = dispatch
                .jobs
                .iter()
                .map(|routed| -> Result<_, QueueError> {
                    Ok((routed.partition.clone(), wire::encode(&routed.job)?))
                })
                .collect::<Result<Vec<_>, QueueError>>()?;
            encoded.push((dispatch, jobs));
        }

        let now = self.clock.now_ms();
        let applied = {
            let mut state = self.lock();
            let mut applied = 0;
            for (dispatch, jobs) in encoded {
                let id = dispatch.next.endpoint_id();
                let current = state.schedule.get(id).map(|e| e.due_at_ms);
                if current != Some(dispatch.expected_due_ms) {
                    continue;
                }
                for (partition, fields) in jobs {
                    state.append(&partition, fields, now);
                }
                state.schedule.insert(id.to_string(), dispatch.next.clone());
                applied += 1;
            }
            applied
        };

        self.arrivals.notify_waiters();
        Ok(applied)
    }

    async fn replace_snapshots(&self, endpoints: &[Endpoint]) -> Result<usize, QueueError> {
        let mut state = self.lock();
        let mut replaced = 0;
        for endpoint in endpoints {
            if let Some(entry) = state.schedule.get_mut(&endpoint.id) {
                entry.endpoint = endpoint.clone();
                replaced += 1;
            }
        }
        Ok(replaced)
    }

    async fn remove(&self, endpoint_ids: &[String]) -> Result<usize, QueueError> {
        let mut state = self.lock();
        Ok(endpoint_ids.iter().filter(|id| state.schedule.remove(id.as_str()).is_some()).count())
    }

    async fn scheduled(&self) -> Result<HashMap<String, ScheduleEntry>, QueueError> {
        Ok(self.lock().schedule.clone())
    }

    async fn clear(&self) -> Result<(), QueueError> {
        self.lock().schedule.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{PlanTier, Region};

    fn broker() -> (MemoryBroker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        (MemoryBroker::new(QueueOptions::default(), clock.clone()), clock)
    }

    fn routed(endpoint_id: &str) -> RoutedJob {
        RoutedJob {
            partition: Partition::shared(),
            job: Job {
                endpoint_id: endpoint_id.into(),
                url: "https://example.com".into(),
                owner_id: "o1".into(),
                regions: vec![Region::new("r1", "SFO", "San Francisco")],
                timeout_ms: 10_000,
                scheduled_at_ms: 0,
            },
        }
    }

    #[tokio::test]
    async fn group_creation_is_idempotent() {
        let (broker, _) = broker();
        let p = Partition::shared();
        broker.ensure_group(&p).await.unwrap();
        broker.enqueue_bulk(&[routed("e1")]).await.unwrap();
        broker.ensure_group(&p).await.unwrap();

        let read = broker.read_next(&p, "w1", 10, Duration::ZERO).await.unwrap();
        assert_eq!(read.len(), 1);
    }

    #[tokio::test]
    async fn read_without_group_fails() {
        let (broker, _) = broker();
        let err = broker.read_next(&Partition::shared(), "w1", 10, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, QueueError::NoGroup { .. }));
    }

    #[tokio::test]
    async fn each_message_goes_to_one_consumer() {
        let (broker, _) = broker();
        let p = Partition::shared();
        broker.ensure_group(&p).await.unwrap();
        broker.enqueue_bulk(&[routed("e1"), routed("e2"), routed("e3")]).await.unwrap();

        let a = broker.read_next(&p, "w1", 2, Duration::ZERO).await.unwrap();
        let b = broker.read_next(&p, "w2", 2, Duration::ZERO).await.unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].job.endpoint_id, "e3");

        assert_eq!(
            broker.delivery_state(&p, &b[0].id),
            Some(DeliveryState::DeliveredUnacked { consumer: "w2".into(), deliveries: 1 })
        );
        assert_eq!(broker.ack(&p, &[b[0].id.clone()]).await.unwrap(), 1);
        assert_eq!(broker.ack(&p, &[b[0].id.clone()]).await.unwrap(), 0);
        assert_eq!(broker.delivery_state(&p, &b[0].id), Some(DeliveryState::Acknowledged));
    }

    #[tokio::test]
    async fn blocking_read_wakes_on_enqueue() {
        let broker = Arc::new(MemoryBroker::default());
        let p = Partition::shared();
        broker.ensure_group(&p).await.unwrap();

        let reader = {
            let broker = broker.clone();
            let p = p.clone();
            tokio::spawn(async move { broker.read_next(&p, "w1", 10, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        broker.enqueue_bulk(&[routed("e1")]).await.unwrap();

        let read = reader.await.unwrap().unwrap();
        assert_eq!(read.len(), 1);
    }

    #[tokio::test]
    async fn blocking_read_times_out_empty() {
        let broker = MemoryBroker::default();
        let p = Partition::shared();
        broker.ensure_group(&p).await.unwrap();
        let read = broker.read_next(&p, "w1", 10, Duration::from_millis(20)).await.unwrap();
        assert!(read.is_empty());
    }

    #[tokio::test]
    async fn exhausted_entries_are_dead_lettered() {
        let clock = Arc::new(ManualClock::new(0));
        let options = QueueOptions { max_deliveries: 2, ..QueueOptions::default() };
        let broker = MemoryBroker::new(options, clock.clone());
        let p = Partition::shared();
        broker.ensure_group(&p).await.unwrap();
        broker.enqueue_bulk(&[routed("e1")]).await.unwrap();

        let first = broker.read_next(&p, "w1", 10, Duration::ZERO).await.unwrap();
        clock.advance(31_000);
        let second = broker.claim_stale(&p, "w2", Duration::from_secs(30), 10).await.unwrap();
        assert_eq!(second[0].deliveries, 2);

        clock.advance(31_000);
        let third = broker.claim_stale(&p, "w3", Duration::from_secs(30), 10).await.unwrap();
        assert!(third.is_empty());

        let dead = broker.dead_letters(&p);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, REASON_MAX_DELIVERIES);
        assert_eq!(dead[0].source_id, first[0].id);
        assert_eq!(broker.delivery_state(&p, &first[0].id), Some(DeliveryState::Acknowledged));
        assert_eq!(broker.stats(&p).await.unwrap(), QueueStats { length: 0, pending: 0, dead_lettered: 1 });
    }

    #[tokio::test]
    async fn malformed_messages_are_quarantined() {
        let (broker, _) = broker();
        let p = Partition::shared();
        broker.ensure_group(&p).await.unwrap();
        let bad = broker.enqueue_raw(&p, vec![("v".into(), "7".into())]);
        broker.enqueue_bulk(&[routed("e1")]).await.unwrap();

        let read = broker.read_next(&p, "w1", 10, Duration::ZERO).await.unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].job.endpoint_id, "e1");

        let dead = broker.dead_letters(&p);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].source_id, bad);
        assert_eq!(dead[0].reason, REASON_MALFORMED);
        assert_eq!(broker.delivery_state(&p, &bad), Some(DeliveryState::Acknowledged));
    }

    #[tokio::test]
    async fn acked_entries_leave_the_stream() {
        let (broker, _) = broker();
        let p = Partition::shared();
        broker.ensure_group(&p).await.unwrap();

        for round in 0..50 {
            let batch: Vec<RoutedJob> = (0..20).map(|i| routed(&format!("e{round}-{i}"))).collect();
            broker.enqueue_bulk(&batch).await.unwrap();
            let read = broker.read_next(&p, "w1", 100, Duration::ZERO).await.unwrap();
            let ids: Vec<String> = read.iter().map(|m| m.id.clone()).collect();
            assert_eq!(broker.ack(&p, &ids).await.unwrap(), 20);
            assert_eq!(broker.stats(&p).await.unwrap().length, 0);
        }

        broker.enqueue_bulk(&[routed("tail")]).await.unwrap();
        assert_eq!(broker.stats(&p).await.unwrap(), QueueStats { length: 1, pending: 0, dead_lettered: 0 });
        let left: Vec<String> = broker.jobs(&p).into_iter().map(|j| j.endpoint_id).collect();
        assert_eq!(left, vec!["tail".to_string()]);
    }

    #[tokio::test]
    async fn dead_letters_keep_only_the_newest() {
        let clock = Arc::new(ManualClock::new(0));
        let options = QueueOptions { dead_letter_max_len: 3, ..QueueOptions::default() };
        let broker = MemoryBroker::new(options, clock);
        let p = Partition::shared();
        broker.ensure_group(&p).await.unwrap();

        let ids: Vec<String> = (0..5).map(|i| broker.enqueue_raw(&p, vec![("v".into(), i.to_string())])).collect();
        assert!(broker.read_next(&p, "w1", 10, Duration::ZERO).await.unwrap().is_empty());

        let kept: Vec<String> = broker.dead_letters(&p).into_iter().map(|d| d.source_id).collect();
        assert_eq!(kept, ids[2..].to_vec());
        assert_eq!(broker.stats(&p).await.unwrap(), QueueStats { length: 0, pending: 0, dead_lettered: 3 });
    }

    #[tokio::test]
    async fn dispatch_skips_entries_that_moved() {
        let (broker, _) = broker();
        let endpoint = Endpoint::new("e1", "https://example.com", "o1", PlanTier::Pro, 60);
        broker.admit(&[ScheduleEntry::new(endpoint.clone(), 1_000)]).await.unwrap();
        assert_eq!(broker.admit(&[ScheduleEntry::new(endpoint.clone(), 9)]).await.unwrap(), 0);

        let stale = Dispatch {
            expected_due_ms: 500,
            next: ScheduleEntry::new(endpoint.clone(), 61_000),
            jobs: vec![routed("e1")],
        };
        assert_eq!(broker.commit_dispatch(&[stale]).await.unwrap(), 0);
        assert!(broker.jobs(&Partition::shared()).is_empty());

        let fresh = Dispatch {
            expected_due_ms: 1_000,
            next: ScheduleEntry::new(endpoint, 61_000),
            jobs: vec![routed("e1")],
        };
        assert_eq!(broker.commit_dispatch(&[fresh]).await.unwrap(), 1);
        assert_eq!(broker.jobs(&Partition::shared()).len(), 1);
        assert_eq!(broker.entry("e1").map(|e| e.due_at_ms), Some(61_000));
    }
}
