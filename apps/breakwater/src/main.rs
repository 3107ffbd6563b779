use std::sync::Arc;
use std::time::Duration;

use body_store::{BodyStore, MemoryBodyStore, RedisBodyStore};
use breakwater::{
    config::Config,
    dispatch::DispatchCoordinator,
    ingress::{router, AppState},
    statistics::{
        redis::RedisStatisticsStore,
        store::{MemoryStatisticsStore, StatisticsStore},
        HeartbeatBatcher, StatisticsTracker,
    },
};
use clap::Parser;
use relay_connector::{
    http_target::HttpTarget, ConnectorRuntime, RequestWorker, TargetRegistry, WorkerConfig,
};
use relay_link::{InProcessLink, TunnelLink};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "breakwater", about = "Reverse-tunnel HTTP relay server")]
struct Cli {
    /// Listen port; overrides BREAKWATER_PORT.
    #[arg(long)]
    port: Option<u16>,

    /// Use in-memory stores instead of Redis (single-process runs).
    #[arg(long)]
    memory: bool,

    /// Tenant served by the embedded connector.
    #[arg(long, env = "BREAKWATER_TENANT", default_value = "default")]
    tenant: String,

    /// Embedded connector target, KEY=URL; repeatable. Requests for
    /// /relay/<tenant>/<KEY>/... are forwarded to URL.
    #[arg(long = "target", value_name = "KEY=URL")]
    targets: Vec<String>,
}

#[tokio::main]
async fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    info!(port = config.port, "starting breakwater relay server");

    let (stats_store, body_store): (Arc<dyn StatisticsStore>, Arc<dyn BodyStore>) = if cli.memory {
        info!("using in-memory statistics and body stores");
        (
            Arc::new(MemoryStatisticsStore::new()),
            Arc::new(MemoryBodyStore::new()),
        )
    } else {
        info!(redis_url = %config.redis_url, "connecting to redis");
        let stats = match RedisStatisticsStore::new(&config.redis_url).await {
            Ok(store) => store,
            Err(err) => {
                error!(%err, "failed to connect the statistics store to redis");
                std::process::exit(1);
            }
        };
        let bodies = match RedisBodyStore::new(&config.redis_url, config.body_ttl_seconds).await {
            Ok(store) => store,
            Err(err) => {
                error!(%err, "failed to connect the body store to redis");
                std::process::exit(1);
            }
        };
        (Arc::new(stats), Arc::new(bodies))
    };

    let tracker = StatisticsTracker::new(stats_store, config.availability_window);

    // Process-wide origin identity: one row per server instance.
    let origin_id = Uuid::new_v4();
    tracker.record_origin_startup(origin_id).await;
    info!(%origin_id, "origin registered");

    spawn_origin_touch_loop(tracker.clone(), origin_id, config.stats_flush_interval);
    spawn_prune_loop(tracker.clone(), &config);

    let batcher = Arc::new(HeartbeatBatcher::new(tracker.clone()));
    let _flusher = Arc::clone(&batcher).spawn_flusher(config.stats_flush_interval);

    let link: Arc<dyn TunnelLink> = Arc::new(InProcessLink::new());
    let coordinator = Arc::new(DispatchCoordinator::new(
        Arc::clone(&link),
        config.relay_timeout,
        config.forced_delivery_policy,
    ));

    let embedded_connection_id = if cli.targets.is_empty() {
        warn!("no embedded targets configured; requests relay only once external connectors attach");
        None
    } else {
        match start_embedded_connector(
            &cli,
            &config,
            Arc::clone(&link),
            Arc::clone(&body_store),
            &tracker,
            origin_id,
            Arc::clone(&batcher),
        )
        .await
        {
            Ok(connection_id) => Some(connection_id),
            Err(err) => {
                error!(%err, "failed to start the embedded connector");
                std::process::exit(1);
            }
        }
    };

    let state = AppState {
        coordinator,
        tracker: tracker.clone(),
        body_store,
        interceptors: Arc::new(Vec::new()),
        inline_body_threshold: config.inline_body_threshold,
        acknowledge_mode: config.acknowledge_mode,
    };
    let app = router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%addr, %err, "failed to bind listener");
            std::process::exit(1);
        }
    };
    info!(%addr, "breakwater listening");

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(%err, "server error");
    }

    // Graceful teardown: close the embedded connection and the origin row.
    if let Some(connection_id) = embedded_connection_id {
        tracker.record_disconnect(&connection_id).await;
    }
    batcher.flush().await;
    tracker.record_origin_shutdown(origin_id).await;
    info!(%origin_id, "origin shut down");
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "failed to listen for shutdown signal");
    }
}

fn spawn_origin_touch_loop(tracker: StatisticsTracker, origin_id: Uuid, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // startup already recorded the first touch
        loop {
            ticker.tick().await;
            tracker.touch_origin(origin_id).await;
        }
    });
}

fn spawn_prune_loop(tracker: StatisticsTracker, config: &Config) {
    let prune_interval = config.prune_interval;
    let origin_max_age = config.origin_max_age;
    let connection_max_age = config.connection_max_age;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(prune_interval);
        loop {
            ticker.tick().await;
            tracker.prune_origins(origin_max_age).await;
            tracker.prune_connections(connection_max_age).await;
        }
    });
}

/// Runs a connector inside the server process over the in-process link,
/// forwarding registered keys to local HTTP services.
async fn start_embedded_connector(
    cli: &Cli,
    config: &Config,
    link: Arc<dyn TunnelLink>,
    body_store: Arc<dyn BodyStore>,
    tracker: &StatisticsTracker,
    origin_id: Uuid,
    batcher: Arc<HeartbeatBatcher>,
) -> anyhow::Result<String> {
    let registry = Arc::new(TargetRegistry::new());
    for spec in &cli.targets {
        let (key, url) = spec
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("invalid target spec {spec:?}, expected KEY=URL"))?;
        registry.register(key, Arc::new(HttpTarget::new(url)))?;
        info!(target_key = %key, %url, "registered embedded target");
    }

    let worker = RequestWorker::new(
        registry,
        body_store,
        WorkerConfig {
            target_timeout: config.target_timeout,
            inline_body_threshold: config.inline_body_threshold,
        },
    );
    let _runtime = ConnectorRuntime::new(cli.tenant.clone(), link, worker).spawn();

    let connection_id = format!("embedded-{}", Uuid::new_v4());
    tracker
        .record_connect(&connection_id, &cli.tenant, origin_id, None)
        .await;

    // The in-process connector has no transport to heartbeat over, so feed
    // the batcher directly to keep the tenant within the freshness window.
    let heartbeat_id = connection_id.clone();
    let heartbeat_interval = config.stats_flush_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        loop {
            ticker.tick().await;
            batcher.record(&heartbeat_id);
        }
    });

    info!(%connection_id, tenant = %cli.tenant, "embedded connector attached");
    Ok(connection_id)
}
