//! Redis Streams broker.
//!
//! Every partition is a stream with one consumer group. The schedule index
//! lives next to it as a sorted set plus a snapshot hash, so one broker and
//! one connection serve both the scheduler and the workers.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::streams::{
    StreamClaimReply, StreamId, StreamMaxlen, StreamPendingCountReply, StreamPendingReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, RedisError, RedisResult, Script};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::scripts;
use super::wire::{self, Fields};
use super::{
    DeadLetter, JobQueue, Partition, QueueMessage, QueueOptions, QueueStats, RoutedJob, REASON_MALFORMED,
    REASON_MAX_DELIVERIES,
};
use crate::error::QueueError;
use crate::model::{Endpoint, ScheduleEntry};
use crate::schedule::{Dispatch, ScheduleStore};

pub const SCHEDULE_KEY: &str = "upbot:schedule";
pub const SNAPSHOT_KEY: &str = "upbot:schedule:endpoints";

/// Exponential backoff applied by the connection manager when the link drops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub retries: usize,
    pub exponent_base: u64,
    pub factor_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { retries: 6, exponent_base: 2, factor_ms: 100, max_delay_ms: 10_000 }
    }
}

#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    options: QueueOptions,
    admit_script: Script,
    dispatch_script: Script,
    replace_script: Script,
}

impl RedisBroker {
    pub async fn connect(url: &str, options: QueueOptions, reconnect: &ReconnectPolicy) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)?;
        let config = ConnectionManagerConfig::new()
            .set_number_of_retries(reconnect.retries)
            .set_exponent_base(reconnect.exponent_base)
            .set_factor(reconnect.factor_ms)
            .set_max_delay(reconnect.max_delay_ms);
        let conn = ConnectionManager::new_with_config(client, config).await?;

        info!(group = %options.group, max_deliveries = options.max_deliveries, "connected to redis");

        Ok(Self {
            conn,
            options,
            admit_script: Script::new(scripts::ADMIT),
            dispatch_script: Script::new(scripts::DISPATCH),
            replace_script: Script::new(scripts::REPLACE_SNAPSHOTS),
        })
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    /// Move entries to their partition's dead-letter stream, then ack and
    /// delete them from the partition. The dead-letter stream is trimmed to
    /// roughly `dead_letter_max_len` entries.
    async fn quarantine(&self, partition: &Partition, dead: &[DeadLetter]) -> Result<(), QueueError> {
        if dead.is_empty() {
            return Ok(());
        }

        let dead_key = partition.dead_letter_key();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for letter in dead {
            warn!(
                partition = %partition,
                id = %letter.source_id,
                reason = %letter.reason,
                deliveries = letter.deliveries,
                "moving message to dead-letter stream"
            );
            let source = std::slice::from_ref(&letter.source_id);
            let cap = StreamMaxlen::Approx(self.options.dead_letter_max_len);
            pipe.xadd_maxlen(&dead_key, cap, "*", letter.to_fields().as_slice()).ignore();
            pipe.xack(partition.key(), &self.options.group, source).ignore();
            pipe.xdel(partition.key(), source).ignore();
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

fn classify(partition: &Partition, error: RedisError) -> QueueError {
    if error.code() == Some("NOGROUP") {
        QueueError::NoGroup { partition: partition.to_string() }
    } else {
        QueueError::Redis(error)
    }
}

/// String fields of a stream entry, sorted by name. Non-string values are
/// dropped, which makes the entry fail decoding.
fn entry_fields(entry: &StreamId) -> Fields {
    let mut fields: Fields = entry
        .map
        .iter()
        .filter_map(|(k, v)| redis::from_redis_value::<String>(v).ok().map(|s| (k.clone(), s)))
        .collect();
    fields.sort();
    fields
}

fn snapshot(endpoint: &Endpoint) -> Result<String, QueueError> {
    serde_json::to_string(endpoint).map_err(|e| QueueError::Snapshot {
        endpoint_id: endpoint.id.clone(),
        reason: e.to_string(),
    })
}

/// Flatten a dispatch batch into the argument layout [`scripts::DISPATCH`]
/// expects.
pub(crate) fn dispatch_args(batch: &[Dispatch]) -> Result<Vec<String>, QueueError> {
    let mut args = Vec::new();
    for dispatch in batch {
        args.push(dispatch.next.endpoint_id().to_string());
        args.push(dispatch.expected_due_ms.to_string());
        args.push(dispatch.next.due_at_ms.to_string());
        args.push(snapshot(&dispatch.next.endpoint)?);
        args.push(dispatch.jobs.len().to_string());

        for routed in &dispatch.jobs {
            let fields = wire::encode(&routed.job)?;
            args.push(routed.partition.key().to_string());
            args.push((fields.len() * 2).to_string());
            for (name, value) in fields {
                args.push(name);
                args.push(value);
            }
        }
    }
    Ok(args)
}

#[async_trait]
impl JobQueue for RedisBroker {
    async fn ensure_group(&self, partition: &Partition) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let created: RedisResult<()> =
            conn.xgroup_create_mkstream(partition.key(), &self.options.group, "0").await;

        match created {
            Ok(()) => {
                info!(partition = %partition, group = %self.options.group, "created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn enqueue_bulk(&self, jobs: &[RoutedJob]) -> Result<usize, QueueError> {
        if jobs.is_empty() {
            return Ok(0);
        }

        let mut pipe = redis::pipe();
        for routed in jobs {
            let fields = wire::encode(&routed.job)?;
            pipe.xadd(routed.partition.key(), "*", fields.as_slice()).ignore();
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(jobs.len())
    }

    async fn read_next(
        &self,
        partition: &Partition,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let mut options = StreamReadOptions::default().group(&self.options.group, consumer).count(max_count);
        // BLOCK 0 means forever, so a zero wait is sent as no BLOCK at all.
        let block_ms = usize::try_from(block.as_millis()).unwrap_or(usize::MAX);
        if block_ms > 0 {
            options = options.block(block_ms);
        }

        let mut conn = self.conn.clone();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[partition.key()], &[">"], &options)
            .await
            .map_err(|e| classify(partition, e))?;
        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut delivered = Vec::new();
        let mut malformed = Vec::new();
        for entry in reply.keys.into_iter().flat_map(|key| key.ids) {
            let fields = entry_fields(&entry);
            match wire::decode_pairs(&fields) {
                Ok(job) => delivered.push(QueueMessage {
                    id: entry.id,
                    partition: partition.clone(),
                    job,
                    deliveries: 1,
                }),
                Err(e) => {
                    debug!(partition = %partition, id = %entry.id, error = %e, "undecodable message");
                    malformed.push(DeadLetter {
                        source_id: entry.id,
                        reason: REASON_MALFORMED.to_string(),
                        deliveries: 1,
                        fields,
                    });
                }
            }
        }

        self.quarantine(partition, &malformed).await?;
        Ok(delivered)
    }

    async fn claim_stale(
        &self,
        partition: &Partition,
        consumer: &str,
        idle: Duration,
        max_count: usize,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let idle_ms = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX);
        let mut conn = self.conn.clone();

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(partition.key())
            .arg(&self.options.group)
            .arg("IDLE")
            .arg(idle_ms)
            .arg("-")
            .arg("+")
            .arg(max_count)
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(partition, e))?;
        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        let previous: HashMap<String, u64> =
            pending.ids.iter().map(|p| (p.id.clone(), p.times_delivered as u64)).collect();
        let ids: Vec<&str> = pending.ids.iter().map(|p| p.id.as_str()).collect();

        // XCLAIM re-checks the idle time, so an entry another consumer grabbed
        // in the meantime is not returned here.
        let claimed: StreamClaimReply = conn
            .xclaim(partition.key(), &self.options.group, consumer, idle_ms, &ids)
            .await
            .map_err(|e| classify(partition, e))?;

        let mut messages = Vec::new();
        let mut dead = Vec::new();
        for entry in claimed.ids {
            let deliveries = previous.get(&entry.id).copied().unwrap_or_default();
            let fields = entry_fields(&entry);

            if deliveries >= self.options.max_deliveries {
                dead.push(DeadLetter {
                    source_id: entry.id,
                    reason: REASON_MAX_DELIVERIES.to_string(),
                    deliveries,
                    fields,
                });
                continue;
            }

            match wire::decode_pairs(&fields) {
                Ok(job) => messages.push(QueueMessage {
                    id: entry.id,
                    partition: partition.clone(),
                    job,
                    deliveries: deliveries + 1,
                }),
                Err(_) => dead.push(DeadLetter {
                    source_id: entry.id,
                    reason: REASON_MALFORMED.to_string(),
                    deliveries,
                    fields,
                }),
            }
        }

        self.quarantine(partition, &dead).await?;
        Ok(messages)
    }

    async fn ack(&self, partition: &Partition, ids: &[String]) -> Result<u64, QueueError> {
        if ids.is_empty() {
            return Ok(0);
        }
        // Acked entries are deleted in the same transaction so the stream
        // only holds work that is queued or in flight.
        let mut conn = self.conn.clone();
        let (acked, _deleted): (u64, u64) = redis::pipe()
            .atomic()
            .xack(partition.key(), &self.options.group, ids)
            .xdel(partition.key(), ids)
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(partition, e))?;
        Ok(acked)
    }

    async fn stats(&self, partition: &Partition) -> Result<QueueStats, QueueError> {
        let mut conn = self.conn.clone();
        let length: u64 = conn.xlen(partition.key()).await?;
        let dead_lettered: u64 = conn.xlen(partition.dead_letter_key()).await?;

        let reply: RedisResult<StreamPendingReply> = conn.xpending(partition.key(), &self.options.group).await;
        let pending = match reply {
            Ok(reply) => reply.count() as u64,
            Err(e) if e.code() == Some("NOGROUP") => 0,
            Err(e) => return Err(e.into()),
        };

        Ok(QueueStats { length, pending, dead_lettered })
    }
}

#[async_trait]
impl ScheduleStore for RedisBroker {
    async fn admit(&self, entries: &[ScheduleEntry]) -> Result<usize, QueueError> {
        if entries.is_empty() {
            return Ok(0);
        }

        let mut args = Vec::with_capacity(entries.len() * 3);
        for entry in entries {
            args.push(entry.endpoint_id().to_string());
            args.push(entry.due_at_ms.to_string());
            args.push(snapshot(&entry.endpoint)?);
        }

        let mut conn = self.conn.clone();
        let mut invocation = self.admit_script.prepare_invoke();
        invocation.key(SCHEDULE_KEY).key(SNAPSHOT_KEY).arg(args);
        let admitted: usize = invocation.invoke_async(&mut conn).await?;
        Ok(admitted)
    }

    async fn due(&self, now_ms: i64, limit: usize) -> Result<Vec<ScheduleEntry>, QueueError> {
        let mut conn = self.conn.clone();
        let count = isize::try_from(limit).unwrap_or(isize::MAX);
        let scored: Vec<(String, f64)> =
            conn.zrangebyscore_limit_withscores(SCHEDULE_KEY, "-inf", now_ms, 0, count).await?;
        if scored.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<&str> = scored.iter().map(|(id, _)| id.as_str()).collect();
        let snapshots: Vec<Option<String>> =
            redis::cmd("HMGET").arg(SNAPSHOT_KEY).arg(&ids).query_async(&mut conn).await?;

        let mut entries = Vec::with_capacity(scored.len());
        let mut unreadable = Vec::new();
        for ((id, score), raw) in scored.into_iter().zip(snapshots) {
            match raw.map(|raw| serde_json::from_str::<Endpoint>(&raw)) {
                Some(Ok(endpoint)) => entries.push(ScheduleEntry::new(endpoint, score as i64)),
                Some(Err(e)) => {
                    warn!(endpoint_id = %id, error = %e, "dropping schedule entry with corrupt snapshot");
                    unreadable.push(id);
                }
                None => {
                    warn!(endpoint_id = %id, "dropping schedule entry without snapshot");
                    unreadable.push(id);
                }
            }
        }

        if !unreadable.is_empty() {
            // The next refresh re-admits the endpoint if it still exists.
            self.remove(&unreadable).await?;
        }
        Ok(entries)
    }

    async fn commit_dispatch(&self, batch: &[Dispatch]) -> Result<usize, QueueError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let args = dispatch_args(batch)?;
        let mut conn = self.conn.clone();
        let mut invocation = self.dispatch_script.prepare_invoke();
        invocation.key(SCHEDULE_KEY).key(SNAPSHOT_KEY).arg(args);
        let applied: usize = invocation.invoke_async(&mut conn).await?;
        Ok(applied)
    }

    async fn replace_snapshots(&self, endpoints: &[Endpoint]) -> Result<usize, QueueError> {
        if endpoints.is_empty() {
            return Ok(0);
        }

        let mut args = Vec::with_capacity(endpoints.len() * 2);
        for endpoint in endpoints {
            args.push(endpoint.id.clone());
            args.push(snapshot(endpoint)?);
        }

        let mut conn = self.conn.clone();
        let mut invocation = self.replace_script.prepare_invoke();
        invocation.key(SCHEDULE_KEY).key(SNAPSHOT_KEY).arg(args);
        let replaced: usize = invocation.invoke_async(&mut conn).await?;
        Ok(replaced)
    }

    async fn remove(&self, endpoint_ids: &[String]) -> Result<usize, QueueError> {
        if endpoint_ids.is_empty() {
            return Ok(0);
        }

        let mut pipe = redis::pipe();
        pipe.atomic().zrem(SCHEDULE_KEY, endpoint_ids).hdel(SNAPSHOT_KEY, endpoint_ids);

        let mut conn = self.conn.clone();
        let (removed, _): (usize, usize) = pipe.query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn scheduled(&self) -> Result<HashMap<String, ScheduleEntry>, QueueError> {
        let mut conn = self.conn.clone();
        let scored: Vec<(String, f64)> = conn.zrange_withscores(SCHEDULE_KEY, 0, -1).await?;
        let mut snapshots: HashMap<String, String> = conn.hgetall(SNAPSHOT_KEY).await?;

        let mut entries = HashMap::with_capacity(scored.len());
        for (id, score) in scored {
            let Some(raw) = snapshots.remove(&id) else {
                warn!(endpoint_id = %id, "schedule entry without snapshot");
                continue;
            };
            match serde_json::from_str::<Endpoint>(&raw) {
                Ok(endpoint) => {
                    entries.insert(id, ScheduleEntry::new(endpoint, score as i64));
                }
                Err(e) => warn!(endpoint_id = %id, error = %e, "corrupt schedule snapshot"),
            }
        }
        Ok(entries)
    }

    async fn clear(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: usize = conn.del(vec![SCHEDULE_KEY, SNAPSHOT_KEY]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Job, PlanTier, Region};

    fn dispatch(jobs: usize) -> Dispatch {
        let endpoint = Endpoint::new("e1", "https://example.com", "o1", PlanTier::Pro, 60);
        let job = Job {
            endpoint_id: "e1".into(),
            url: endpoint.url.clone(),
            owner_id: "o1".into(),
            regions: vec![Region::new("r1", "SFO", "San Francisco")],
            timeout_ms: 10_000,
            scheduled_at_ms: 65_000,
        };
        Dispatch {
            expected_due_ms: 1_000,
            next: ScheduleEntry::new(endpoint, 125_000),
            jobs: (0..jobs).map(|_| RoutedJob { partition: Partition::shared(), job: job.clone() }).collect(),
        }
    }

    #[test]
    fn dispatch_args_layout() {
        let args = dispatch_args(&[dispatch(2)]).unwrap();
        assert_eq!(&args[..3], &["e1", "1000", "125000"]);
        let snapshot: Endpoint = serde_json::from_str(&args[3]).unwrap();
        assert_eq!(snapshot.id, "e1");
        assert_eq!(args[4], "2");

        // stream key, field count, then 7 name/value pairs per job
        assert_eq!(args[5], "upbot:jobs");
        assert_eq!(args[6], "14");
        assert_eq!(args[7], "v");
        assert_eq!(args[8], "1");
        assert_eq!(args[21], "upbot:jobs");
        assert_eq!(args.len(), 5 + 2 * (2 + 14));
    }

    #[test]
    fn dispatch_args_without_jobs() {
        let args = dispatch_args(&[dispatch(0), dispatch(0)]).unwrap();
        assert_eq!(args.len(), 10);
        assert_eq!(args[9], "0");
    }
}
