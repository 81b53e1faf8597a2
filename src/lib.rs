use std::sync::Arc;

use axum::extract::FromRef;
use metrics_exporter_prometheus::PrometheusHandle;

pub mod auth;
pub mod config;
pub mod db;
pub mod delivery_log;
pub mod delivery_worker;
pub mod error;
pub mod handlers;
pub mod health;
pub mod jobs;
pub mod message_service;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod realtime;
pub mod session;

use config::Config;
use db::Store;
use delivery_log::RedisDeliveryLog;
use message_service::MessageService;
use middleware::RateLimiter;
use realtime::{ConnectionFabric, PubSubBus};
use session::SessionService;

/// Everything an axum handler or extractor needs, built once at startup
/// and cheaply cloned per request (every field is an `Arc` or itself
/// internally `Arc`-backed, per §9's "explicit startup sequence that
/// builds dependencies leaf-first and injects them").
#[derive(Clone, FromRef)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub session_service: Arc<SessionService>,
    pub fabric: Arc<ConnectionFabric>,
    pub pubsub: Arc<PubSubBus>,
    pub message_service: Arc<MessageService<RedisDeliveryLog>>,
    pub rate_limiter: RateLimiter,
    pub metrics_handle: PrometheusHandle,
}
