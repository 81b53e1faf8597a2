//! Delivery Worker (spec §4.4): the fan-out engine. Grounded on
//! `ScriptSmith-hadrian/src/dlq/worker.rs`'s loop shape (`process_batch` /
//! `is_ready_for_retry` / `prune_old_entries` / sleep, with pure-function
//! unit tests against literal queue entries), adapted from hadrian's
//! exponential backoff to this system's fixed `retryDelay`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::DeliveryPolicy;
use crate::delivery_log::{DeliveryJob, DeliveryLog, LogEntry};
use crate::error::CoreResult;
use crate::models::{DeliveryRecord, DeliveryStatus, Message};

/// A narrow, read-mostly view of the Store the worker needs: message
/// lookup, delivery-status inspection, and transition. Lets the fan-out
/// loop run in a unit test against a hand-written fake without a database.
#[async_trait]
pub trait StorePort: Send + Sync {
    async fn get_message(&self, message_id: Uuid) -> CoreResult<Option<Message>>;
    async fn get_delivery_record(&self, message_id: Uuid, recipient_id: Uuid) -> CoreResult<Option<DeliveryRecord>>;
    async fn transition_delivery(&self, message_id: Uuid, recipient_id: Uuid, target: DeliveryStatus) -> CoreResult<()>;
}

#[async_trait]
impl StorePort for crate::db::Store {
    async fn get_message(&self, message_id: Uuid) -> CoreResult<Option<Message>> {
        crate::db::Store::get_message(self, message_id).await
    }

    async fn get_delivery_record(&self, message_id: Uuid, recipient_id: Uuid) -> CoreResult<Option<DeliveryRecord>> {
        crate::db::Store::get_delivery_record(self, message_id, recipient_id).await
    }

    async fn transition_delivery(&self, message_id: Uuid, recipient_id: Uuid, target: DeliveryStatus) -> CoreResult<()> {
        crate::db::Store::transition_delivery(self, message_id, recipient_id, target).await
    }
}

/// A presence-query view of the Connection Fabric: `isOnline` and
/// `pushToUser` only. The worker never knows about sockets.
#[async_trait]
pub trait PresenceQuery: Send + Sync {
    async fn is_online(&self, user_id: Uuid) -> CoreResult<bool>;
    async fn push_to_user(&self, user_id: Uuid, event: &str, payload: serde_json::Value);
}

#[async_trait]
impl PresenceQuery for crate::realtime::ConnectionFabric {
    async fn is_online(&self, user_id: Uuid) -> CoreResult<bool> {
        crate::realtime::ConnectionFabric::is_online(self, user_id).await
    }

    async fn push_to_user(&self, user_id: Uuid, event: &str, payload: serde_json::Value) {
        crate::realtime::ConnectionFabric::push_to_user(self, user_id, event, payload).await
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DeliverySummary {
    pub delivered: usize,
    pub skipped: usize,
    pub offline: usize,
}

pub struct DeliveryWorker<L: DeliveryLog, S: StorePort, F: PresenceQuery> {
    log: Arc<L>,
    store: Arc<S>,
    fabric: Arc<F>,
    policy: DeliveryPolicy,
    consumer_name: String,
}

impl<L: DeliveryLog, S: StorePort, F: PresenceQuery> DeliveryWorker<L, S, F> {
    pub fn new(log: Arc<L>, store: Arc<S>, fabric: Arc<F>, policy: DeliveryPolicy) -> Self {
        Self {
            log,
            store,
            fabric,
            policy,
            consumer_name: format!("worker-{}", Uuid::new_v4()),
        }
    }

    /// Runs the main loop until `shutdown` resolves.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            let did_work = tokio::select! {
                result = self.run_once() => result,
                _ = shutdown.changed() => return,
            };

            if !did_work {
                tokio::time::sleep(self.policy.poll_interval).await;
            }
        }
    }

    /// One iteration: new-jobs pass then pending-retry pass. Returns
    /// whether any entry was processed (used to skip the pacing sleep).
    /// Public so integration tests can drive the worker deterministically
    /// instead of racing `run`'s background loop against a sleep.
    pub async fn run_once(&self) -> bool {
        let mut did_work = false;

        match self.log.read_new(&self.consumer_name, self.policy.batch_size, self.policy.poll_interval).await {
            Ok(entries) => {
                did_work |= !entries.is_empty();
                for entry in entries {
                    self.process_entry(entry).await;
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "delivery log read_new failed");
                tokio::time::sleep(self.policy.error_backoff).await;
                return false;
            }
        }

        match self.log.claim_pending(&self.consumer_name, self.policy.retry_delay, self.policy.batch_size).await {
            Ok(entries) => {
                did_work |= !entries.is_empty();
                for entry in entries {
                    self.process_entry(entry).await;
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "delivery log claim_pending failed");
                tokio::time::sleep(self.policy.error_backoff).await;
                return false;
            }
        }

        did_work
    }

    async fn process_entry(&self, entry: LogEntry) {
        if entry.job.attempts > self.policy.max_retries {
            if let Err(err) = self.log.dead_letter(&entry.entry_id, entry.job.clone(), "max_retries_exceeded").await {
                tracing::error!(error = %err, "failed to dead-letter job");
            } else {
                crate::metrics::record_message_dead_lettered();
            }
            return;
        }

        match self.deliver(&entry.job).await {
            Ok(summary) => {
                tracing::info!(
                    message_id = %entry.job.message_id,
                    delivered = summary.delivered,
                    skipped = summary.skipped,
                    offline = summary.offline,
                    "delivery pass complete"
                );
                if summary.offline == 0 {
                    if let Err(err) = self.log.acknowledge(&entry.entry_id).await {
                        tracing::error!(error = %err, "failed to acknowledge delivered job");
                    }
                } else if let Err(requeue_err) = self.log.requeue(&entry.entry_id, entry.job.clone()).await {
                    tracing::error!(error = %requeue_err, "failed to requeue job");
                }
            }
            Err(err) => {
                tracing::warn!(message_id = %entry.job.message_id, error = %err, "delivery attempt failed, requeueing");
                if let Err(requeue_err) = self.log.requeue(&entry.entry_id, entry.job.clone()).await {
                    tracing::error!(error = %requeue_err, "failed to requeue job");
                }
            }
        }
    }

    /// Deliver(job) per spec §4.4: re-read the message, skip recipients
    /// already delivered/read, push to online recipients and advance their
    /// status, leave offline recipients at `sent` for a later pass.
    async fn deliver(&self, job: &DeliveryJob) -> CoreResult<DeliverySummary> {
        let mut summary = DeliverySummary::default();

        let Some(message) = self.store.get_message(job.message_id).await? else {
            // Race with a hard-delete path possible only in tests: terminal success.
            return Ok(summary);
        };

        for recipient_id in &job.recipients {
            let record = self.store.get_delivery_record(job.message_id, *recipient_id).await?;
            if let Some(record) = &record {
                if record.status_rank() >= DeliveryStatus::Delivered as u8 {
                    summary.skipped += 1;
                    continue;
                }
            }

            if self.fabric.is_online(*recipient_id).await? {
                let payload = serde_json::to_value(&message).unwrap_or_default();
                self.fabric.push_to_user(*recipient_id, "message.new", payload).await;
                self.store.transition_delivery(job.message_id, *recipient_id, DeliveryStatus::Delivered).await?;
                crate::metrics::record_message_delivered();
                summary.delivered += 1;
            } else {
                summary.offline += 1;
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery_log::fake::FakeDeliveryLog;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        messages: Mutex<std::collections::HashMap<Uuid, Message>>,
        records: Mutex<std::collections::HashMap<(Uuid, Uuid), DeliveryRecord>>,
    }

    #[async_trait]
    impl StorePort for FakeStore {
        async fn get_message(&self, message_id: Uuid) -> CoreResult<Option<Message>> {
            Ok(self.messages.lock().unwrap().get(&message_id).cloned())
        }

        async fn get_delivery_record(&self, message_id: Uuid, recipient_id: Uuid) -> CoreResult<Option<DeliveryRecord>> {
            Ok(self.records.lock().unwrap().get(&(message_id, recipient_id)).cloned())
        }

        async fn transition_delivery(&self, message_id: Uuid, recipient_id: Uuid, target: DeliveryStatus) -> CoreResult<()> {
            let mut records = self.records.lock().unwrap();
            let record = records.entry((message_id, recipient_id)).or_insert_with(|| DeliveryRecord {
                message_id,
                recipient_id,
                status: "sent".into(),
                delivered_at: None,
                read_at: None,
                created_at: Utc::now(),
            });
            record.status = match target {
                DeliveryStatus::Sent => "sent",
                DeliveryStatus::Delivered => "delivered",
                DeliveryStatus::Read => "read",
            }.to_string();
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeFabric {
        online: Mutex<std::collections::HashSet<Uuid>>,
        pushed: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl PresenceQuery for FakeFabric {
        async fn is_online(&self, user_id: Uuid) -> CoreResult<bool> {
            Ok(self.online.lock().unwrap().contains(&user_id))
        }

        async fn push_to_user(&self, user_id: Uuid, _event: &str, _payload: serde_json::Value) {
            self.pushed.lock().unwrap().push(user_id);
        }
    }

    fn sample_message(id: Uuid, convo_id: Uuid) -> Message {
        Message {
            id,
            conversation_id: convo_id,
            sender_id: Some(Uuid::new_v4()),
            body: "hi".into(),
            kind: "text".into(),
            metadata: serde_json::json!({}),
            reply_to_id: None,
            is_edited: false,
            edited_at: None,
            is_deleted: false,
            deleted_at: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn delivers_to_online_recipient_and_skips_already_delivered() {
        let log = Arc::new(FakeDeliveryLog::default());
        let store = Arc::new(FakeStore::default());
        let fabric = Arc::new(FakeFabric::default());

        let msg_id = Uuid::new_v4();
        let convo_id = Uuid::new_v4();
        let online_recipient = Uuid::new_v4();
        let already_delivered = Uuid::new_v4();

        store.messages.lock().unwrap().insert(msg_id, sample_message(msg_id, convo_id));
        store.records.lock().unwrap().insert(
            (msg_id, already_delivered),
            DeliveryRecord { message_id: msg_id, recipient_id: already_delivered, status: "delivered".into(), delivered_at: Some(Utc::now()), read_at: None, created_at: Utc::now() },
        );
        fabric.online.lock().unwrap().insert(online_recipient);

        let worker = DeliveryWorker::new(log, store.clone(), fabric.clone(), DeliveryPolicy::default());
        let job = DeliveryJob { message_id: msg_id, conversation_id: convo_id, recipients: vec![online_recipient, already_delivered], attempts: 0, enqueued_at: Utc::now() };

        let summary = worker.deliver(&job).await.unwrap();
        assert_eq!(summary.delivered, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(fabric.pushed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn leaves_offline_recipient_at_sent() {
        let log = Arc::new(FakeDeliveryLog::default());
        let store = Arc::new(FakeStore::default());
        let fabric = Arc::new(FakeFabric::default());

        let msg_id = Uuid::new_v4();
        let convo_id = Uuid::new_v4();
        let offline_recipient = Uuid::new_v4();
        store.messages.lock().unwrap().insert(msg_id, sample_message(msg_id, convo_id));

        let worker = DeliveryWorker::new(log, store.clone(), fabric.clone(), DeliveryPolicy::default());
        let job = DeliveryJob { message_id: msg_id, conversation_id: convo_id, recipients: vec![offline_recipient], attempts: 0, enqueued_at: Utc::now() };

        let summary = worker.deliver(&job).await.unwrap();
        assert_eq!(summary.offline, 1);
        assert!(store.records.lock().unwrap().get(&(msg_id, offline_recipient)).is_none());
    }

    #[tokio::test]
    async fn job_exceeding_max_retries_is_dead_lettered() {
        let log = Arc::new(FakeDeliveryLog::default());
        let store = Arc::new(FakeStore::default());
        let fabric = Arc::new(FakeFabric::default());
        let policy = DeliveryPolicy { max_retries: 2, ..Default::default() };
        let worker = DeliveryWorker::new(log.clone(), store, fabric, policy);

        let job = DeliveryJob { message_id: Uuid::new_v4(), conversation_id: Uuid::new_v4(), recipients: vec![], attempts: 3, enqueued_at: Utc::now() };
        worker.process_entry(LogEntry { entry_id: "1".into(), job }).await;

        assert_eq!(log.dead_letters().len(), 1);
        assert_eq!(log.dead_letters()[0].reason, "max_retries_exceeded");
    }
}
