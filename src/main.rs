//! RelayCast - cross-pod real-time messaging gateway
//!
//! One process is one pod. Pods share a presence directory, a relay channel,
//! the undelivered store and the notification bus through Redis.

use std::sync::Arc;

use clap::Parser;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use tracing::{error, info};

use relaycast::auth::TokenVerifier;
use relaycast::calls::CallEngine;
use relaycast::config::Config;
use relaycast::dispatch::InboundDispatcher;
use relaycast::gateway;
use relaycast::http::{self, AppState};
use relaycast::message::RelayPayload;
use relaycast::notify::{NotificationBus, NotificationPublisher, RedisStreamBus};
use relaycast::presence::{PresenceDirectory, RedisPresence};
use relaycast::profile::{HttpProfileLoader, ProfileCache};
use relaycast::registry::SessionRegistry;
use relaycast::relay::{RedisRelay, RelayBus, RelayCallback};
use relaycast::router::DeliveryRouter;
use relaycast::store::{RedisUndeliveredStore, UndeliveredStore};

#[derive(Parser, Debug)]
#[command(name = "relaycast")]
#[command(about = "Cross-pod real-time messaging gateway")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(&args.log_level)
        .init();

    info!("RelayCast v{}", env!("CARGO_PKG_VERSION"));

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {}", e);
            error!("Required env vars: REDIS_URL, JWT_SECRET");
            std::process::exit(1);
        }
    };

    info!(
        pod = %config.pod_name,
        addr = %config.bind_addr,
        relay_channel = %config.relay_channel,
        "Starting RelayCast"
    );

    let client = redis::Client::open(config.redis_url.as_str())?;
    let manager_config = ConnectionManagerConfig::new()
        .set_connection_timeout(config.redis_timeout())
        .set_response_timeout(config.redis_timeout());
    let conn = ConnectionManager::new_with_config(client.clone(), manager_config).await?;
    info!("Redis connected");

    let sessions = Arc::new(SessionRegistry::new());
    let presence: Arc<dyn PresenceDirectory> = Arc::new(RedisPresence::new(conn.clone()));
    let relay: Arc<dyn RelayBus> = Arc::new(RedisRelay::new(
        client,
        conn.clone(),
        &config.relay_channel,
    ));
    let store: Arc<dyn UndeliveredStore> = Arc::new(RedisUndeliveredStore::new(
        conn.clone(),
        config.message_ttl(),
    ));
    let bus: Arc<dyn NotificationBus> = Arc::new(RedisStreamBus::new(conn));

    let loader = Arc::new(HttpProfileLoader::new(
        &config.profile_service_url,
        config.profile_timeout(),
    )?);
    let profiles = Arc::new(ProfileCache::new(loader));
    let notifications = Arc::new(NotificationPublisher::new(bus, config.notification_channel));

    let router = Arc::new(DeliveryRouter::new(
        &config,
        sessions.clone(),
        presence.clone(),
        relay.clone(),
        profiles.clone(),
        store.clone(),
        notifications,
    ));
    let calls = Arc::new(CallEngine::new(router.clone(), profiles));
    let dispatcher = Arc::new(InboundDispatcher::new(router.clone(), calls));
    let verifier = Arc::new(TokenVerifier::new(&config.jwt_secret));

    // Relay consumer: every pod drains the shared channel and delivers the
    // payloads whose target happens to hold a socket here.
    {
        let relay = relay.clone();
        let router = router.clone();
        tokio::spawn(async move {
            info!("Starting relay consumer");
            let callback: RelayCallback = Arc::new(move |payload: RelayPayload| {
                let router = router.clone();
                tokio::spawn(async move {
                    router
                        .deliver_remote(&payload.target_user_id, &payload.message)
                        .await;
                });
            });
            if let Err(e) = relay.listen(callback).await {
                error!(error = %e, "Relay consumer failed");
            }
        });
    }

    let state = AppState {
        config: Arc::new(config.clone()),
        verifier,
        sessions,
        presence,
        store,
        router,
        dispatcher,
    };

    gateway::spawn_presence_sweep(state.clone());

    let app = http::build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "RelayCast listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("RelayCast shutdown");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}
