//! Connection Fabric (spec §4.5): room registries, presence, and the
//! typing-indicator map. Grounded on the teacher's
//! `realtime/websocket.rs` (`ConnectionTracker`'s `DashMap<String,
//! AtomicUsize>` slot-counting idiom) and `realtime/sse.rs` (`SseState`'s
//! `RwLock<HashMap<String, broadcast::Sender<_>>>` per-room channel
//! registry), generalized to per-user and per-conversation rooms and wired
//! to a cross-node [`PubSubBus`] instead of a single-process broadcast.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::db::Store;
use crate::error::CoreResult;
use crate::realtime::pubsub::PubSubBus;

const ROOM_BUFFER: usize = 256;
const TYPING_TTL: Duration = Duration::from_secs(3);

struct ConnectionSlots {
    counts: DashMap<Uuid, AtomicUsize>,
    max_per_user: usize,
    total: AtomicUsize,
}

impl ConnectionSlots {
    fn new(max_per_user: usize) -> Self {
        Self { counts: DashMap::new(), max_per_user, total: AtomicUsize::new(0) }
    }

    fn try_acquire(&self, user_id: Uuid) -> bool {
        let entry = self.counts.entry(user_id).or_insert_with(|| AtomicUsize::new(0));
        let current = entry.fetch_add(1, Ordering::SeqCst);
        if current >= self.max_per_user {
            entry.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        let total = self.total.fetch_add(1, Ordering::SeqCst) + 1;
        crate::metrics::set_active_connections(total as f64);
        true
    }

    fn release(&self, user_id: Uuid) {
        if let dashmap::mapref::entry::Entry::Occupied(entry) = self.counts.entry(user_id) {
            let prev = entry.get().fetch_sub(1, Ordering::SeqCst);
            if prev <= 1 {
                entry.remove();
            }
            let total = self.total.fetch_sub(1, Ordering::SeqCst) - 1;
            crate::metrics::set_active_connections(total as f64);
        }
    }

    fn local_count(&self, user_id: Uuid) -> usize {
        self.counts.get(&user_id).map(|c| c.load(Ordering::SeqCst)).unwrap_or(0)
    }
}

pub struct ConnectionFabric {
    store: Arc<Store>,
    pubsub: Arc<PubSubBus>,
    user_rooms: DashMap<Uuid, broadcast::Sender<Value>>,
    conversation_rooms: DashMap<Uuid, broadcast::Sender<Value>>,
    typing: DashMap<(Uuid, Uuid), Instant>,
    slots: ConnectionSlots,
}

impl ConnectionFabric {
    pub fn new(store: Arc<Store>, pubsub: Arc<PubSubBus>, max_connections_per_user: usize) -> Self {
        Self {
            store,
            pubsub,
            user_rooms: DashMap::new(),
            conversation_rooms: DashMap::new(),
            typing: DashMap::new(),
            slots: ConnectionSlots::new(max_connections_per_user),
        }
    }

    fn user_room(&self, user_id: Uuid) -> broadcast::Sender<Value> {
        self.user_rooms
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(ROOM_BUFFER).0)
            .clone()
    }

    fn conversation_room(&self, convo_id: Uuid) -> broadcast::Sender<Value> {
        self.conversation_rooms
            .entry(convo_id)
            .or_insert_with(|| broadcast::channel(ROOM_BUFFER).0)
            .clone()
    }

    /// Subscribes a freshly-`Active` socket to its per-user room and one
    /// per-conversation room for every active membership, resolved fresh
    /// from the Store (§9 open question 4 — never a cached list).
    pub async fn subscribe_active_rooms(
        &self,
        user_id: Uuid,
    ) -> CoreResult<(broadcast::Receiver<Value>, Vec<broadcast::Receiver<Value>>, Vec<Uuid>)> {
        let user_rx = self.user_room(user_id).subscribe();
        let conversations = self.store.get_user_conversations(user_id).await?;
        let conv_ids: Vec<Uuid> = conversations.iter().map(|c| c.conversation.id).collect();
        let conv_rxs = conv_ids.iter().map(|id| self.conversation_room(*id).subscribe()).collect();
        Ok((user_rx, conv_rxs, conv_ids))
    }

    pub fn try_acquire_slot(&self, user_id: Uuid) -> bool {
        self.slots.try_acquire(user_id)
    }

    pub fn release_slot(&self, user_id: Uuid) {
        self.slots.release(user_id)
    }

    pub async fn mark_online(&self, user_id: Uuid, socket_id: &str) -> CoreResult<()> {
        self.pubsub.mark_online(user_id, socket_id).await
    }

    /// On disconnect: if the user has no `Active` socket left cluster-wide,
    /// flips presence to `offline` and broadcasts `user.status`.
    pub async fn mark_offline_and_maybe_announce(&self, user_id: Uuid, socket_id: &str) -> CoreResult<()> {
        self.pubsub.mark_offline(user_id, socket_id).await?;
        if !self.pubsub.is_online(user_id).await? {
            self.broadcast_to_user(user_id, "user.status", serde_json::json!({ "userId": user_id, "status": "offline" })).await;
        }
        Ok(())
    }

    pub async fn is_online(&self, user_id: Uuid) -> CoreResult<bool> {
        self.pubsub.is_online(user_id).await
    }

    pub async fn broadcast_to_conversation(&self, convo_id: Uuid, event: &str, payload: Value) {
        let envelope = serde_json::json!({ "event": event, "payload": payload });
        let channel = PubSubBus::conversation_channel(convo_id);
        if let Err(err) = self.pubsub.publish(&channel, &envelope).await {
            tracing::warn!(%convo_id, %event, error = %err, "failed to publish conversation event");
        }
    }

    pub async fn broadcast_to_user(&self, user_id: Uuid, event: &str, payload: Value) {
        let envelope = serde_json::json!({ "event": event, "payload": payload });
        let channel = PubSubBus::user_channel(user_id);
        if let Err(err) = self.pubsub.publish(&channel, &envelope).await {
            tracing::warn!(%user_id, %event, error = %err, "failed to publish user event");
        }
    }

    /// Narrow port used by the Delivery Worker (spec §4.4's `pushToUser`).
    pub async fn push_to_user(&self, user_id: Uuid, event: &str, payload: Value) {
        self.broadcast_to_user(user_id, event, payload).await;
    }

    pub fn note_typing(&self, user_id: Uuid, convo_id: Uuid) {
        self.typing.insert((user_id, convo_id), Instant::now() + TYPING_TTL);
    }

    pub fn clear_typing(&self, user_id: Uuid, convo_id: Uuid) {
        self.typing.remove(&(user_id, convo_id));
    }

    pub fn is_typing(&self, user_id: Uuid, convo_id: Uuid) -> bool {
        match self.typing.get(&(user_id, convo_id)) {
            Some(expiry) => Instant::now() < *expiry,
            None => false,
        }
    }

    /// Dispatches a message received from the pub/sub bus into the
    /// matching local room, fanning it out to every socket subscribed on
    /// this node. No-ops for rooms with no local subscribers.
    pub fn dispatch_local(&self, channel: &str, envelope: Value) {
        if let Some(rest) = channel.strip_prefix("chatcore:room:user:") {
            if let Ok(user_id) = rest.parse::<Uuid>() {
                if let Some(sender) = self.user_rooms.get(&user_id) {
                    let _ = sender.send(envelope);
                }
            }
        } else if let Some(rest) = channel.strip_prefix("chatcore:room:conv:") {
            if let Ok(convo_id) = rest.parse::<Uuid>() {
                if let Some(sender) = self.conversation_rooms.get(&convo_id) {
                    let _ = sender.send(envelope);
                }
            }
        }
    }

    pub fn local_connection_count(&self, user_id: Uuid) -> usize {
        self.slots.local_count(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_slots_enforce_per_user_cap() {
        let slots = ConnectionSlots::new(2);
        let user = Uuid::new_v4();
        assert!(slots.try_acquire(user));
        assert!(slots.try_acquire(user));
        assert!(!slots.try_acquire(user));
        slots.release(user);
        assert!(slots.try_acquire(user));
    }

    #[test]
    fn typing_indicator_expires_after_ttl() {
        let typing: DashMap<(Uuid, Uuid), Instant> = DashMap::new();
        let key = (Uuid::new_v4(), Uuid::new_v4());
        typing.insert(key, Instant::now() - Duration::from_secs(1));
        let expired = typing.get(&key).map(|e| Instant::now() < *e).unwrap_or(false);
        assert!(!expired);
    }
}
