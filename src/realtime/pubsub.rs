//! Cross-node broadcast bus (spec §4.5, §6.3): a Redis pub/sub layer that
//! lets `emit to room "user:X"` from any node reach every socket in that
//! room on every node.
//!
//! There is no grounding file for this in the retrieved corpus — it is
//! built from the `redis` crate's own pub/sub idiom (`get_async_pubsub`,
//! `psubscribe`, `on_message`), the same crate source that grounds
//! [`crate::delivery_log`].

use futures::StreamExt;
use redis::aio::ConnectionManager;
use serde::Serialize;

use crate::error::{CoreError, CoreResult};

const ROOM_PATTERN: &str = "chatcore:room:*";

pub struct PubSubBus {
    client: redis::Client,
    publish_conn: ConnectionManager,
}

impl PubSubBus {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let publish_conn = client.get_connection_manager().await?;
        Ok(Self { client, publish_conn })
    }

    pub fn user_channel(user_id: uuid::Uuid) -> String {
        format!("chatcore:room:user:{user_id}")
    }

    pub fn conversation_channel(convo_id: uuid::Uuid) -> String {
        format!("chatcore:room:conv:{convo_id}")
    }

    pub async fn publish<T: Serialize>(&self, channel: &str, message: &T) -> CoreResult<()> {
        let json = serde_json::to_string(message).map_err(|e| CoreError::Internal(e.into()))?;
        let mut conn = self.publish_conn.clone();
        redis::AsyncCommands::publish::<_, _, ()>(&mut conn, channel, json)
            .await
            .map_err(|e| CoreError::QueueUnavailable(e.to_string()))?;
        Ok(())
    }

    /// Subscribes to every room channel and invokes `on_message(channel,
    /// payload)` for each one received, forever. Run as a background task;
    /// reconnects are not attempted — a lost pub/sub connection is surfaced
    /// by `/health` via `is_reachable` failing on the next check.
    pub async fn run_dispatch_loop<F>(&self, mut on_message: F) -> anyhow::Result<()>
    where
        F: FnMut(String, String) + Send,
    {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(ROOM_PATTERN).await?;
        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let channel: String = msg.get_channel_name().to_string();
            let payload: String = msg.get_payload().unwrap_or_default();
            on_message(channel, payload);
        }
        Ok(())
    }

    pub async fn is_reachable(&self) -> bool {
        let mut conn = self.publish_conn.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .is_ok()
    }

    pub async fn mark_online(&self, user_id: uuid::Uuid, socket_id: &str) -> CoreResult<()> {
        let mut conn = self.publish_conn.clone();
        redis::AsyncCommands::sadd::<_, _, ()>(&mut conn, Self::presence_key(user_id), socket_id)
            .await
            .map_err(|e| CoreError::QueueUnavailable(e.to_string()))
    }

    pub async fn mark_offline(&self, user_id: uuid::Uuid, socket_id: &str) -> CoreResult<()> {
        let mut conn = self.publish_conn.clone();
        redis::AsyncCommands::srem::<_, _, ()>(&mut conn, Self::presence_key(user_id), socket_id)
            .await
            .map_err(|e| CoreError::QueueUnavailable(e.to_string()))
    }

    pub async fn is_online(&self, user_id: uuid::Uuid) -> CoreResult<bool> {
        let mut conn = self.publish_conn.clone();
        let count: i64 = redis::AsyncCommands::scard(&mut conn, Self::presence_key(user_id))
            .await
            .map_err(|e| CoreError::QueueUnavailable(e.to_string()))?;
        Ok(count > 0)
    }

    fn presence_key(user_id: uuid::Uuid) -> String {
        format!("chatcore:online:{user_id}")
    }
}
