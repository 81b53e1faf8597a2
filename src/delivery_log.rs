//! The Delivery Log (spec §4.2): an append-only, ordered log per stream key
//! with named consumer groups, backed in production by Redis Streams.
//!
//! `DeliveryLog` is a trait so the Delivery Worker can be driven by a
//! deterministic in-memory fake in tests; `RedisDeliveryLog` is the only
//! production implementor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// A fan-out job: one message, the set of recipients still owed a push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub recipients: Vec<Uuid>,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// A job as read off the log, carrying the log-assigned entry id needed to
/// acknowledge or claim it.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub entry_id: String,
    pub job: DeliveryJob,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job: DeliveryJob,
    pub failed_at: DateTime<Utc>,
    pub reason: String,
}

#[async_trait]
pub trait DeliveryLog: Send + Sync {
    async fn enqueue(&self, job: DeliveryJob) -> CoreResult<()>;

    /// Reads up to `count` entries never delivered to this consumer group,
    /// blocking up to `block` for at least one.
    async fn read_new(&self, consumer: &str, count: usize, block: std::time::Duration) -> CoreResult<Vec<LogEntry>>;

    /// Lists pending (delivered-but-unacked) entries whose idle time is at
    /// least `min_idle`, claiming them for `consumer`.
    async fn claim_pending(&self, consumer: &str, min_idle: std::time::Duration, count: usize) -> CoreResult<Vec<LogEntry>>;

    async fn acknowledge(&self, entry_id: &str) -> CoreResult<()>;

    /// Re-enqueues `job` with `attempts` incremented and acknowledges `entry_id`.
    async fn requeue(&self, entry_id: &str, job: DeliveryJob) -> CoreResult<()>;

    async fn dead_letter(&self, entry_id: &str, job: DeliveryJob, reason: &str) -> CoreResult<()>;

    async fn len(&self) -> CoreResult<u64>;

    async fn dead_letter_len(&self) -> CoreResult<u64>;
}

pub struct RedisDeliveryLog {
    client: redis::Client,
    stream_key: String,
    dead_letter_key: String,
    group_name: String,
    max_entries: u64,
}

impl RedisDeliveryLog {
    pub async fn new(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;

        let stream_key = "chatcore:delivery".to_string();
        let dead_letter_key = "chatcore:delivery:dead".to_string();
        let group_name = "delivery_workers".to_string();

        for key in [&stream_key, &dead_letter_key] {
            let result: redis::RedisResult<()> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(key)
                .arg(&group_name)
                .arg("0")
                .arg("MKSTREAM")
                .query_async(&mut conn)
                .await;
            if let Err(err) = result {
                if !err.to_string().contains("BUSYGROUP") {
                    return Err(err.into());
                }
            }
        }

        Ok(Self {
            client,
            stream_key,
            dead_letter_key,
            group_name,
            max_entries: 1_000_000,
        })
    }

    async fn conn(&self) -> CoreResult<ConnectionManager> {
        self.client
            .get_connection_manager()
            .await
            .map_err(|e| CoreError::QueueUnavailable(e.to_string()))
    }

    fn parse_entries(value: redis::Value) -> Vec<(String, String)> {
        // [[stream_name, [[id, [field, value, ...]], ...]]] → (id, json) pairs
        let mut out = Vec::new();
        if let redis::Value::Bulk(streams) = value {
            for stream in streams {
                let redis::Value::Bulk(stream_data) = stream else { continue };
                if stream_data.len() < 2 {
                    continue;
                }
                let redis::Value::Bulk(entries) = &stream_data[1] else { continue };
                for entry in entries {
                    let redis::Value::Bulk(entry) = entry else { continue };
                    if entry.len() < 2 {
                        continue;
                    }
                    let id = match &entry[0] {
                        redis::Value::Data(bytes) => String::from_utf8_lossy(bytes).to_string(),
                        _ => continue,
                    };
                    let redis::Value::Bulk(fields) = &entry[1] else { continue };
                    let mut iter = fields.iter();
                    while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                        if let (redis::Value::Data(k), redis::Value::Data(v)) = (k, v) {
                            if k.as_slice() == b"data" {
                                out.push((id.clone(), String::from_utf8_lossy(v).to_string()));
                            }
                        }
                    }
                }
            }
        }
        out
    }

    async fn append(&self, conn: &mut ConnectionManager, key: &str, json: &str) -> CoreResult<()> {
        let _: String = redis::cmd("XADD")
            .arg(key)
            .arg("*")
            .arg("data")
            .arg(json)
            .query_async(conn)
            .await
            .map_err(|e| CoreError::QueueUnavailable(e.to_string()))?;
        let _: u64 = redis::cmd("XTRIM")
            .arg(key)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_entries)
            .query_async(conn)
            .await
            .map_err(|e| CoreError::QueueUnavailable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl DeliveryLog for RedisDeliveryLog {
    async fn enqueue(&self, job: DeliveryJob) -> CoreResult<()> {
        let mut conn = self.conn().await?;
        let json = serde_json::to_string(&job).map_err(|e| CoreError::Internal(e.into()))?;
        self.append(&mut conn, &self.stream_key, &json).await
    }

    async fn read_new(&self, consumer: &str, count: usize, block: std::time::Duration) -> CoreResult<Vec<LogEntry>> {
        let mut conn = self.conn().await?;
        let opts = redis::streams::StreamReadOptions::default()
            .group(&self.group_name, consumer)
            .count(count)
            .block(block.as_millis() as usize);

        let value: redis::Value = conn
            .xread_options(&[&self.stream_key], &[">"], &opts)
            .await
            .map_err(|e| CoreError::QueueUnavailable(e.to_string()))?;

        Self::parse_entries(value)
            .into_iter()
            .map(|(id, json)| {
                serde_json::from_str::<DeliveryJob>(&json)
                    .map(|job| LogEntry { entry_id: id, job })
                    .map_err(|e| CoreError::Internal(e.into()))
            })
            .collect()
    }

    async fn claim_pending(&self, consumer: &str, min_idle: std::time::Duration, count: usize) -> CoreResult<Vec<LogEntry>> {
        let mut conn = self.conn().await?;

        let pending: redis::streams::StreamPendingCountReply = conn
            .xpending_count(
                &self.stream_key,
                &self.group_name,
                "-",
                "+",
                count as isize,
            )
            .await
            .map_err(|e| CoreError::QueueUnavailable(e.to_string()))?;

        let stale_ids: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|p| p.last_delivered_ms >= min_idle.as_millis() as usize)
            .map(|p| p.id)
            .collect();

        if stale_ids.is_empty() {
            return Ok(Vec::new());
        }

        let claimed: redis::streams::StreamClaimReply = conn
            .xclaim(
                &self.stream_key,
                &self.group_name,
                consumer,
                min_idle.as_millis() as usize,
                &stale_ids,
            )
            .await
            .map_err(|e| CoreError::QueueUnavailable(e.to_string()))?;

        claimed
            .ids
            .into_iter()
            .map(|stream_id| {
                let json = stream_id
                    .map
                    .get("data")
                    .and_then(|v| match v {
                        redis::Value::Data(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
                        _ => None,
                    })
                    .ok_or_else(|| CoreError::Internal(anyhow::anyhow!("claimed entry missing data field")))?;
                serde_json::from_str::<DeliveryJob>(&json)
                    .map(|job| LogEntry { entry_id: stream_id.id.clone(), job })
                    .map_err(|e| CoreError::Internal(e.into()))
            })
            .collect()
    }

    async fn acknowledge(&self, entry_id: &str) -> CoreResult<()> {
        let mut conn = self.conn().await?;
        let _: u64 = conn
            .xack(&self.stream_key, &self.group_name, &[entry_id])
            .await
            .map_err(|e| CoreError::QueueUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn requeue(&self, entry_id: &str, mut job: DeliveryJob) -> CoreResult<()> {
        job.attempts += 1;
        let mut conn = self.conn().await?;
        let json = serde_json::to_string(&job).map_err(|e| CoreError::Internal(e.into()))?;
        self.append(&mut conn, &self.stream_key, &json).await?;
        let _: u64 = conn
            .xack(&self.stream_key, &self.group_name, &[entry_id])
            .await
            .map_err(|e| CoreError::QueueUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn dead_letter(&self, entry_id: &str, job: DeliveryJob, reason: &str) -> CoreResult<()> {
        let mut conn = self.conn().await?;
        let dead_letter = DeadLetter {
            job,
            failed_at: Utc::now(),
            reason: reason.to_string(),
        };
        let json = serde_json::to_string(&dead_letter).map_err(|e| CoreError::Internal(e.into()))?;
        self.append(&mut conn, &self.dead_letter_key, &json).await?;
        let _: u64 = conn
            .xack(&self.stream_key, &self.group_name, &[entry_id])
            .await
            .map_err(|e| CoreError::QueueUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn len(&self) -> CoreResult<u64> {
        let mut conn = self.conn().await?;
        conn.xlen(&self.stream_key)
            .await
            .map_err(|e| CoreError::QueueUnavailable(e.to_string()))
    }

    async fn dead_letter_len(&self) -> CoreResult<u64> {
        let mut conn = self.conn().await?;
        conn.xlen(&self.dead_letter_key)
            .await
            .map_err(|e| CoreError::QueueUnavailable(e.to_string()))
    }
}

#[cfg(test)]
pub mod fake {
    //! An in-memory `DeliveryLog` used by the Delivery Worker's unit tests.
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeDeliveryLog {
        inner: Mutex<FakeState>,
    }

    #[derive(Default)]
    struct FakeState {
        next_id: u64,
        new: Vec<LogEntry>,
        pending: Vec<(LogEntry, std::time::Instant)>,
        dead: Vec<DeadLetter>,
    }

    impl FakeDeliveryLog {
        pub fn dead_letters(&self) -> Vec<DeadLetter> {
            self.inner.lock().unwrap().dead.clone()
        }
    }

    #[async_trait]
    impl DeliveryLog for FakeDeliveryLog {
        async fn enqueue(&self, job: DeliveryJob) -> CoreResult<()> {
            let mut state = self.inner.lock().unwrap();
            let id = state.next_id;
            state.next_id += 1;
            state.new.push(LogEntry { entry_id: id.to_string(), job });
            Ok(())
        }

        async fn read_new(&self, _consumer: &str, count: usize, _block: std::time::Duration) -> CoreResult<Vec<LogEntry>> {
            let mut state = self.inner.lock().unwrap();
            let take = count.min(state.new.len());
            Ok(state.new.drain(..take).collect())
        }

        async fn claim_pending(&self, _consumer: &str, min_idle: std::time::Duration, count: usize) -> CoreResult<Vec<LogEntry>> {
            let mut state = self.inner.lock().unwrap();
            let mut claimed = Vec::new();
            let mut remaining = Vec::new();
            for (entry, since) in state.pending.drain(..) {
                if claimed.len() < count && since.elapsed() >= min_idle {
                    claimed.push(entry);
                } else {
                    remaining.push((entry, since));
                }
            }
            state.pending = remaining;
            Ok(claimed)
        }

        async fn acknowledge(&self, entry_id: &str) -> CoreResult<()> {
            let mut state = self.inner.lock().unwrap();
            state.pending.retain(|(e, _)| e.entry_id != entry_id);
            Ok(())
        }

        async fn requeue(&self, entry_id: &str, mut job: DeliveryJob) -> CoreResult<()> {
            job.attempts += 1;
            let mut state = self.inner.lock().unwrap();
            state.pending.retain(|(e, _)| e.entry_id != entry_id);
            state.pending.push((LogEntry { entry_id: entry_id.to_string(), job }, std::time::Instant::now()));
            Ok(())
        }

        async fn dead_letter(&self, entry_id: &str, job: DeliveryJob, reason: &str) -> CoreResult<()> {
            let mut state = self.inner.lock().unwrap();
            state.pending.retain(|(e, _)| e.entry_id != entry_id);
            state.dead.push(DeadLetter { job, failed_at: Utc::now(), reason: reason.to_string() });
            Ok(())
        }

        async fn len(&self) -> CoreResult<u64> {
            let state = self.inner.lock().unwrap();
            Ok((state.new.len() + state.pending.len()) as u64)
        }

        async fn dead_letter_len(&self) -> CoreResult<u64> {
            Ok(self.inner.lock().unwrap().dead.len() as u64)
        }
    }
}
