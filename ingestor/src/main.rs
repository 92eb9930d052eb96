use axum::{routing::get, Router};
use ingestor::commands::CommandPublisher;
use ingestor::config::Config;
use ingestor::forward::Forwarder;
use ingestor::handlers::Ingestor;
use ingestor::mqtt::{self, BrokerSession, MqttSession};
use ingestor::service::IrrigationHub;
use ingestor::store::DeviceStore;
use ingestor::{batching, db, metrics, rest};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env();

    info!("Starting irrigation hub");
    info!(
        "MQTT broker: {}://{}:{}",
        config.mqtt.protocol, config.mqtt.host, config.mqtt.port
    );
    info!("Default topics: {}", config.mqtt.default_topics.join(", "));
    info!("HTTP server: {}", config.http_addr);
    info!(
        "Database: {}",
        config.database_url.split('@').last().unwrap_or("***")
    );

    if let Err(e) = metrics::init_metrics() {
        error!("Failed to register metrics: {}", e);
        std::process::exit(1);
    }

    let pool = match db::make_pool(&config.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    info!("Forward channel capacity: {}", config.forward_channel_capacity);
    let (tx, rx) = mpsc::channel(config.forward_channel_capacity);
    let forwarder = Forwarder::new(tx);

    let batcher_pool = pool.clone();
    let (batch_size, batch_timeout_ms) = (config.batch_size, config.batch_timeout_ms);
    let batcher_handle = tokio::spawn(async move {
        batching::run_batcher(rx, batcher_pool, batch_size, batch_timeout_ms).await;
    });

    let store = Arc::new(DeviceStore::new());
    let (session, eventloop) = MqttSession::new(&config.mqtt);
    let session = Arc::new(session);
    let broker: Arc<dyn BrokerSession> = session.clone();

    let ingestor = Ingestor::new(Arc::clone(&store), forwarder.clone());
    let commands = CommandPublisher::new(broker.clone(), forwarder);
    let hub = Arc::new(IrrigationHub::new(Arc::clone(&store), broker, commands));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mqtt_config = config.mqtt.clone();
    let mut mqtt_handle = tokio::spawn(async move {
        if let Err(e) = mqtt::run_mqtt(
            session,
            eventloop,
            mqtt_config.default_topics,
            mqtt_config.reconnect_interval,
            ingestor,
            shutdown_rx,
        )
        .await
        {
            error!("MQTT task failed: {}", e);
        }
    });

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(hub))
        .merge(rest::records_router(pool));

    let listener = match tokio::net::TcpListener::bind(&config.http_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        }
    };

    info!("HTTP server listening on {}", config.http_addr);

    let server_shutdown = shutdown_tx.subscribe();
    let mut server_handle = tokio::spawn(async move {
        if let Err(e) = rest::serve(listener, app, server_shutdown).await {
            error!("HTTP server error: {}", e);
        }
    });

    let mut mqtt_running = true;
    let mut server_running = true;
    tokio::select! {
        _ = &mut mqtt_handle => {
            error!("MQTT task terminated");
            mqtt_running = false;
        }
        _ = &mut server_handle => {
            error!("HTTP server terminated");
            server_running = false;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");

    // Both tasks hold forwarders; once they are gone the batcher sees the
    // channel close and flushes what it has.
    let _ = shutdown_tx.send(true);
    if mqtt_running {
        let _ = mqtt_handle.await;
    }
    if server_running
        && tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, &mut server_handle)
            .await
            .is_err()
    {
        error!("Timed out draining HTTP connections");
        server_handle.abort();
    }

    if tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, batcher_handle)
        .await
        .is_err()
    {
        error!("Timed out flushing pending records");
    }
    info!("Shutdown complete");
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
