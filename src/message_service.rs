//! Message Service (spec §4.3): the transaction-of-record boundary for
//! message authorship. Thin orchestration over the Store, the Delivery Log,
//! and the Connection Fabric — it owns no state of its own.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::db::Store;
use crate::delivery_log::{DeliveryJob, DeliveryLog};
use crate::error::{CoreError, CoreResult};
use crate::models::Message;
use crate::realtime::ConnectionFabric;

pub struct MessageService<L: DeliveryLog> {
    store: Arc<Store>,
    delivery_log: Arc<L>,
    fabric: Arc<ConnectionFabric>,
}

impl<L: DeliveryLog> MessageService<L> {
    pub fn new(store: Arc<Store>, delivery_log: Arc<L>, fabric: Arc<ConnectionFabric>) -> Self {
        Self { store, delivery_log, fabric }
    }

    /// sendMessage(convId, senderId, dto) → Message (spec §4.3 steps 1-5).
    pub async fn send_message(
        &self,
        convo_id: Uuid,
        sender_id: Uuid,
        body: String,
        kind: &str,
        metadata: Value,
        reply_to: Option<Uuid>,
    ) -> CoreResult<Message> {
        let message = self
            .store
            .create_message(convo_id, sender_id, body, kind, metadata, reply_to)
            .await?;
        crate::metrics::record_message_sent();

        let recipients = self
            .store
            .list_active_participant_ids(convo_id)
            .await?
            .into_iter()
            .filter(|id| *id != sender_id)
            .collect::<Vec<_>>();

        if !recipients.is_empty() {
            let job = DeliveryJob {
                message_id: message.id,
                conversation_id: convo_id,
                recipients,
                attempts: 0,
                enqueued_at: chrono::Utc::now(),
            };
            // A failure to enqueue here is not a failure of sendMessage: the
            // Store write already committed and is authoritative. Recipients
            // catch up on next chat-list refresh if this is lost.
            if let Err(err) = self.delivery_log.enqueue(job).await {
                tracing::warn!(message_id = %message.id, error = %err, "failed to enqueue delivery job");
            }
        }

        Ok(message)
    }

    pub async fn edit_message(&self, msg_id: Uuid, editor_id: Uuid, new_body: String) -> CoreResult<Message> {
        let message = self.store.edit_message(msg_id, editor_id, new_body).await?;
        self.fabric
            .broadcast_to_conversation(message.conversation_id, "message.edited", serde_json::to_value(&message).unwrap_or_default())
            .await;
        Ok(message)
    }

    pub async fn delete_message(&self, msg_id: Uuid, actor_id: Uuid) -> CoreResult<()> {
        let message = self.store.get_message(msg_id).await?.ok_or(CoreError::NotFound)?;
        self.store.soft_delete_message(msg_id, actor_id).await?;
        self.fabric
            .broadcast_to_conversation(
                message.conversation_id,
                "message.deleted",
                serde_json::json!({ "messageId": msg_id }),
            )
            .await;
        Ok(())
    }

    pub async fn add_reaction(&self, msg_id: Uuid, user_id: Uuid, emoji: String) -> CoreResult<()> {
        let message = self.store.get_message(msg_id).await?.ok_or(CoreError::NotFound)?;
        let reaction = self.store.add_reaction(msg_id, user_id, emoji).await?;
        self.fabric
            .broadcast_to_conversation(message.conversation_id, "reaction.added", serde_json::to_value(&reaction).unwrap_or_default())
            .await;
        Ok(())
    }

    pub async fn remove_reaction(&self, msg_id: Uuid, user_id: Uuid, emoji: &str) -> CoreResult<()> {
        let message = self.store.get_message(msg_id).await?.ok_or(CoreError::NotFound)?;
        self.store.remove_reaction(msg_id, user_id, emoji).await?;
        self.fabric
            .broadcast_to_conversation(
                message.conversation_id,
                "reaction.removed",
                serde_json::json!({ "messageId": msg_id, "userId": user_id, "emoji": emoji }),
            )
            .await;
        Ok(())
    }

    pub async fn mark_read(&self, msg_id: Uuid, user_id: Uuid) -> CoreResult<()> {
        let message = self.store.get_message(msg_id).await?.ok_or(CoreError::NotFound)?;
        self.store
            .transition_delivery(msg_id, user_id, crate::models::DeliveryStatus::Read)
            .await?;

        let payload = serde_json::json!({ "messageId": msg_id, "userId": user_id });
        self.fabric
            .broadcast_to_conversation(message.conversation_id, "message.read", payload.clone())
            .await;
        if let Some(sender_id) = message.sender_id {
            self.fabric.push_to_user(sender_id, "message.read", payload).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery_log::fake::FakeDeliveryLog;

    // MessageService's orchestration logic (recipient computation, enqueue
    // tolerance) is exercised end-to-end in tests/ against a real database;
    // the pure recipient-filtering rule is covered directly here.
    #[test]
    fn sender_is_excluded_from_recipient_set() {
        let sender = Uuid::new_v4();
        let other = Uuid::new_v4();
        let participants = vec![sender, other];
        let recipients: Vec<_> = participants.into_iter().filter(|id| *id != sender).collect();
        assert_eq!(recipients, vec![other]);
    }

    #[tokio::test]
    async fn fake_delivery_log_round_trips_a_job() {
        let log = FakeDeliveryLog::default();
        let job = DeliveryJob {
            message_id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            recipients: vec![Uuid::new_v4()],
            attempts: 0,
            enqueued_at: chrono::Utc::now(),
        };
        log.enqueue(job.clone()).await.unwrap();
        let entries = log.read_new("worker-1", 10, std::time::Duration::from_millis(0)).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].job.message_id, job.message_id);
    }
}
