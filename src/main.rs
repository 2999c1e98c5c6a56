//! Movie Export Service - Main Entry Point
//!
//! Serves the export trigger and runs the queue consumer in one process.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use movie_export::api::{build_router, AppState};
use movie_export::clock::{Clock, TokioClock};
use movie_export::jobs::{ExportConsumer, ExportExecutor, ExportJobProducer};
use movie_export::messaging::{AmqpConnector, BrokerClient};
use movie_export::output::SmtpMailer;
use movie_export::repository::MySqlMovieSource;
use movie_export::types::ServiceConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    dotenvy::dotenv().ok();
    let config = ServiceConfig::from_env().context("invalid configuration")?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "movie_export=info,tower_http=debug".into()),
    );
    if config.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting Movie Export Service v{}", env!("CARGO_PKG_VERSION"));
    info!(
        broker = %config.broker.redacted_url(),
        queue = %config.topology.work_queue,
        "Broker settings"
    );

    // Collaborators
    let movies = Arc::new(MySqlMovieSource::connect_lazy(&config.database)?);
    let mailer = Arc::new(SmtpMailer::new(&config.smtp)?);
    let clock: Arc<dyn Clock> = Arc::new(TokioClock);

    // Broker client: a failed initial connect keeps retrying in the background
    let broker = BrokerClient::with_topology(
        Arc::new(AmqpConnector::new(config.broker.clone())),
        clock.clone(),
        config.reconnect,
        config.topology.clone(),
    );
    if let Err(e) = broker.start().await {
        warn!(error = %e, "Starting without RabbitMQ");
    }

    // Consumer supervisor
    let executor = Arc::new(ExportExecutor::new(
        movies,
        mailer,
        config.consumer.temp_dir.clone(),
        config.consumer.job_timeout,
    ));
    let consumer = Arc::new(ExportConsumer::new(
        broker.clone(),
        config.topology.clone(),
        executor,
        clock,
        config.consumer.clone(),
    ));
    let supervisor = {
        let consumer = consumer.clone();
        tokio::spawn(async move {
            match consumer.start().await {
                Ok(handle) => {
                    if let Err(e) = handle.await {
                        error!(error = %e, "Export consumer task panicked");
                    }
                }
                Err(e) => error!(error = %e, "Export consumer not running"),
            }
        })
    };

    // HTTP
    let state = Arc::new(AppState {
        producer: ExportJobProducer::new(broker.clone(), config.topology.clone()),
        broker: broker.clone(),
        jwt_secret: config.auth.jwt_secret.clone(),
    });
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain: stop consuming, then close channel and connection
    info!("Shutting down");
    consumer.shutdown();
    if let Err(e) = supervisor.await {
        error!(error = %e, "Consumer supervisor ended abnormally");
    }
    broker.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
}
