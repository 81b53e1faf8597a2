//! Seeded end-to-end scenarios against a real Postgres and Redis. Mirrors
//! the `#[ignore = "requires TEST_DATABASE_URL"]` convention already used
//! by `src/db.rs`'s in-crate integration tests, extended to also require
//! `TEST_REDIS_URL` since these scenarios exercise the Delivery Log,
//! pub/sub bus, and Connection Fabric together.

use std::sync::Arc;
use std::time::Duration;

use chatcore::config::DeliveryPolicy;
use chatcore::db::Store;
use chatcore::delivery_log::{DeliveryLog, RedisDeliveryLog};
use chatcore::delivery_worker::DeliveryWorker;
use chatcore::message_service::MessageService;
use chatcore::realtime::{ConnectionFabric, PubSubBus};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

async fn test_db() -> PgPool {
    let database_url = std::env::var("TEST_DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/chatcore_test".to_string());
    PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("failed to connect to test database")
}

fn test_redis_url() -> String {
    std::env::var("TEST_REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379/1".to_string())
}

async fn seed_user(pool: &PgPool, username: &str) -> Uuid {
    sqlx::query_scalar("INSERT INTO users (username, display_name) VALUES ($1, $1) RETURNING id")
        .bind(username)
        .fetch_one(pool)
        .await
        .expect("failed to seed user")
}

struct Harness {
    pool: PgPool,
    store: Arc<Store>,
    fabric: Arc<ConnectionFabric>,
    message_service: MessageService<RedisDeliveryLog>,
    delivery_log: Arc<RedisDeliveryLog>,
}

async fn harness() -> Harness {
    let pool = test_db().await;
    let store = Arc::new(Store::from_pool(pool.clone()));
    let pubsub = Arc::new(PubSubBus::connect(&test_redis_url()).await.expect("redis pubsub connect"));
    let fabric = Arc::new(ConnectionFabric::new(store.clone(), pubsub.clone(), 5));
    let delivery_log = Arc::new(RedisDeliveryLog::new(&test_redis_url()).await.expect("redis delivery log connect"));
    let message_service = MessageService::new(store.clone(), delivery_log.clone(), fabric.clone());

    // The dispatch loop is what turns a pubsub publish into a local room
    // broadcast; tests that assert on fabric broadcasts need it running.
    {
        let fabric = fabric.clone();
        let pubsub = pubsub.clone();
        tokio::spawn(async move {
            let _ = pubsub
                .run_dispatch_loop(move |channel, payload| {
                    if let Ok(envelope) = serde_json::from_str::<serde_json::Value>(&payload) {
                        fabric.dispatch_local(&channel, envelope);
                    }
                })
                .await;
        });
        // Give the psubscribe a moment to land before any publish happens.
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    Harness { pool, store, fabric, message_service, delivery_log }
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL and TEST_REDIS_URL"]
async fn basic_fan_out_to_online_recipient() {
    let h = harness().await;
    let a = seed_user(&h.pool, "alice_e2e_fanout").await;
    let b = seed_user(&h.pool, "bob_e2e_fanout").await;
    let convo = h.store.create_direct_conversation(a, b).await.unwrap();

    h.fabric.mark_online(b, "socket-b").await.unwrap();
    let (mut user_rx, _conv_rxs, _conv_ids) = h.fabric.subscribe_active_rooms(b).await.unwrap();

    let message = h.message_service.send_message(convo.id, a, "hello".into(), "text", serde_json::json!({}), None).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(1), user_rx.recv()).await;
    assert!(received.is_ok(), "B did not receive message.new within 1s");

    let membership = h.store.get_membership(convo.id, b).await.unwrap().unwrap();
    assert_eq!(membership.unread_count, 1);
    assert_eq!(message.body, "hello");
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL and TEST_REDIS_URL"]
async fn deferred_delivery_then_read_collapses_to_terminal() {
    let h = harness().await;
    let a = seed_user(&h.pool, "alice_e2e_deferred").await;
    let b = seed_user(&h.pool, "bob_e2e_deferred").await;
    let convo = h.store.create_direct_conversation(a, b).await.unwrap();

    // B is offline: sendMessage still enqueues, but no online push happens
    // until a Delivery Worker pass finds B online.
    let m1 = h.message_service.send_message(convo.id, a, "m1".into(), "text", serde_json::json!({}), None).await.unwrap();
    let m2 = h.message_service.send_message(convo.id, a, "m2".into(), "text", serde_json::json!({}), None).await.unwrap();
    let m3 = h.message_service.send_message(convo.id, a, "m3".into(), "text", serde_json::json!({}), None).await.unwrap();

    let membership = h.store.get_membership(convo.id, b).await.unwrap().unwrap();
    assert_eq!(membership.unread_count, 3);

    // B reconnects, then a worker pass delivers the backlog.
    h.fabric.mark_online(b, "socket-b").await.unwrap();
    let worker = DeliveryWorker::new(h.delivery_log.clone(), h.store.clone(), h.fabric.clone(), DeliveryPolicy::default());
    for _ in 0..3 {
        worker.run_once().await;
    }

    for message in [&m1, &m2, &m3] {
        let record = h.store.get_delivery_record(message.id, b).await.unwrap().unwrap();
        assert_eq!(record.status, "delivered");
    }

    // Scenario 3: marking only M3 as read does not cascade to M1/M2.
    h.message_service.mark_read(m3.id, b).await.unwrap();

    let record3 = h.store.get_delivery_record(m3.id, b).await.unwrap().unwrap();
    assert_eq!(record3.status, "read");
    let record1 = h.store.get_delivery_record(m1.id, b).await.unwrap().unwrap();
    assert_eq!(record1.status, "delivered");

    let membership = h.store.get_membership(convo.id, b).await.unwrap().unwrap();
    assert_eq!(membership.unread_count, 0);
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL and TEST_REDIS_URL"]
async fn exhausted_retries_land_in_dead_letter_stream() {
    let h = harness().await;
    let a = seed_user(&h.pool, "alice_e2e_deadletter").await;
    let b = seed_user(&h.pool, "bob_e2e_deadletter").await;
    let convo = h.store.create_direct_conversation(a, b).await.unwrap();

    // B never comes online: every delivery pass leaves the job pending.
    let message = h.message_service.send_message(convo.id, a, "never delivered".into(), "text", serde_json::json!({}), None).await.unwrap();

    let policy = DeliveryPolicy { max_retries: 1, retry_delay: Duration::from_millis(0), ..Default::default() };
    let worker = DeliveryWorker::new(h.delivery_log.clone(), h.store.clone(), h.fabric.clone(), policy);

    let before = h.delivery_log.dead_letter_len().await.unwrap();
    for _ in 0..4 {
        worker.run_once().await;
    }
    let after = h.delivery_log.dead_letter_len().await.unwrap();
    assert!(after > before, "expected at least one dead-lettered job");

    let record = h.store.get_delivery_record(message.id, b).await.unwrap().unwrap();
    assert_eq!(record.status, "sent");
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL and TEST_REDIS_URL"]
async fn edit_is_visible_on_next_list_and_broadcasts() {
    let h = harness().await;
    let a = seed_user(&h.pool, "alice_e2e_edit").await;
    let b = seed_user(&h.pool, "bob_e2e_edit").await;
    let convo = h.store.create_direct_conversation(a, b).await.unwrap();

    let (_user_rx, mut conv_rxs, _conv_ids) = h.fabric.subscribe_active_rooms(b).await.unwrap();
    let mut conv_rx = conv_rxs.pop().expect("B is a member of exactly one room");

    let message = h.message_service.send_message(convo.id, a, "hi".into(), "text", serde_json::json!({}), None).await.unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(1), conv_rx.recv()).await;

    let edited = h.message_service.edit_message(message.id, a, "hello".into()).await.unwrap();
    assert!(edited.is_edited);
    assert_eq!(edited.body, "hello");

    let broadcast = tokio::time::timeout(Duration::from_secs(1), conv_rx.recv()).await;
    assert!(broadcast.is_ok(), "message.edited did not reach conv:C within 1s");

    let (messages, _) = h.store.list_messages(convo.id, b, 10, None).await.unwrap();
    let refetched = messages.iter().find(|m| m.id == message.id).unwrap();
    assert_eq!(refetched.body, "hello");
}

#[tokio::test]
#[ignore = "requires TEST_DATABASE_URL"]
async fn group_conversation_caps_at_300_participants() {
    let pool = test_db().await;
    let store = Store::from_pool(pool.clone());

    let owner = seed_user(&pool, "owner_e2e_group").await;
    let mut members = Vec::with_capacity(299);
    for i in 0..299 {
        members.push(seed_user(&pool, &format!("member_e2e_group_{i}")).await);
    }

    let convo = store.create_group_conversation(owner, "big group".into(), &members).await.unwrap();
    assert_eq!(store.count_active_participants(convo.id).await.unwrap(), 300);

    let one_more = seed_user(&pool, "member_e2e_group_overflow").await;
    let mut over = members.clone();
    over.push(one_more);
    let result = store.create_group_conversation(owner, "too big".into(), &over).await;
    assert!(result.is_err(), "301st participant should be rejected");
}
