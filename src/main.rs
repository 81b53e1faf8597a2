use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::HeaderValue;
use axum::routing::{get, patch, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use chatcore::config::Config;
use chatcore::db::Store;
use chatcore::delivery_log::RedisDeliveryLog;
use chatcore::delivery_worker::DeliveryWorker;
use chatcore::message_service::MessageService;
use chatcore::middleware::RateLimiter;
use chatcore::realtime::{ConnectionFabric, PubSubBus};
use chatcore::session::SessionService;
use chatcore::{handlers, health, jobs, metrics, realtime, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(node_env = ?config.node_env, "starting chatcore");

    let metrics_recorder = metrics::MetricsRecorder::new();
    let metrics_handle = metrics_recorder.handle().clone();

    let store = Store::connect(&config.database_url, config.database_replica_url.as_deref()).await?;
    if !store.health_check().await {
        anyhow::bail!("database health probe failed at startup; have migrations been applied?");
    }
    let store = Arc::new(store);
    tracing::info!("store connected");

    let delivery_log = Arc::new(RedisDeliveryLog::new(&config.redis_url).await?);
    tracing::info!("delivery log connected");

    let pubsub = Arc::new(PubSubBus::connect(&config.redis_url).await?);
    tracing::info!("pub/sub bus connected");

    let config = Arc::new(config);
    let fabric = Arc::new(ConnectionFabric::new(store.clone(), pubsub.clone(), config.max_connections_per_user));
    let session_service = Arc::new(SessionService::new(store.clone(), config.clone()));
    let message_service = Arc::new(MessageService::new(store.clone(), delivery_log.clone(), fabric.clone()));
    let rate_limiter = RateLimiter::new();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let delivery_worker = DeliveryWorker::new(delivery_log, store.clone(), fabric.clone(), config.delivery);
    let delivery_worker_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        delivery_worker.run(delivery_worker_shutdown).await;
    });
    tracing::info!("delivery worker started");

    {
        let fabric = fabric.clone();
        let pubsub = pubsub.clone();
        tokio::spawn(async move {
            if let Err(err) = pubsub
                .run_dispatch_loop(|channel, payload| {
                    if let Ok(envelope) = serde_json::from_str::<serde_json::Value>(&payload) {
                        fabric.dispatch_local(&channel, envelope);
                    }
                })
                .await
            {
                tracing::error!(error = %err, "pub/sub dispatch loop exited");
            }
        });
    }
    tracing::info!("pub/sub dispatch loop started");

    tokio::spawn(jobs::run_session_sweep(store.clone(), shutdown_rx.clone()));
    tokio::spawn(jobs::run_rate_limit_sweep(rate_limiter.clone(), shutdown_rx.clone()));
    tracing::info!("background jobs started");

    let enable_metrics = config.enable_metrics;

    let app_state = AppState {
        config: config.clone(),
        store,
        session_service,
        fabric,
        pubsub,
        message_service,
        rate_limiter,
        metrics_handle,
    };

    let mut router = Router::new()
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/health", get(health::health))
        .route("/auth/login", post(handlers::auth::login))
        .route("/auth/refresh", post(handlers::auth::refresh))
        .route("/auth/logout", post(handlers::auth::logout))
        .route("/auth/logout-all", post(handlers::auth::logout_all))
        .route("/conversations", get(handlers::conversations::list).post(handlers::conversations::create_direct))
        .route("/conversations/group", post(handlers::conversations::create_group))
        .route("/conversations/{id}", get(handlers::conversations::get))
        .route("/conversations/{id}/leave", post(handlers::conversations::leave))
        .route("/conversations/{id}/messages", get(handlers::messages::list).post(handlers::messages::send))
        .route("/messages/{id}", patch(handlers::messages::edit).delete(handlers::messages::delete))
        .route("/messages/{id}/read", post(handlers::messages::mark_read))
        .route("/messages/{id}/reactions", post(handlers::messages::add_reaction))
        .route("/messages/{id}/reactions/{emoji}", axum::routing::delete(handlers::messages::remove_reaction))
        .route("/ws", get(realtime::connect));

    // Only expose metrics when explicitly enabled, matching the teacher's
    // own opt-in gate for the Prometheus endpoint.
    if enable_metrics {
        router = router.route("/metrics", get(metrics::metrics_handler));
    }

    let cors = HeaderValue::from_str(&config.frontend_url)
        .map(|origin| {
            CorsLayer::new()
                .allow_credentials(true)
                .allow_methods(tower_http::cors::AllowMethods::mirror_request())
                .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
                .allow_origin(origin)
        })
        .unwrap_or_else(|_| {
            tracing::warn!(frontend_url = %config.frontend_url, "FRONTEND_URL is not a valid header value; falling back to permissive CORS");
            CorsLayer::permissive()
        });

    let app = router
        .layer(axum::middleware::from_fn_with_state(app_state.clone(), chatcore::middleware::rate_limit::rate_limit_middleware))
        .layer(axum::middleware::from_fn(metrics::track_request_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state);

    let port = config.server_port;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    Ok(())
}

/// Waits for `SIGINT`/`SIGTERM`, then flips the process-wide shutdown
/// broadcast so the delivery worker and background jobs can wind down
/// (spec §5's ambient shutdown-signal detail).
async fn shutdown_signal(shutdown_tx: tokio::sync::watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}
