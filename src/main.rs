use std::sync::Arc;

use actix_web::{get, web, App, HttpResponse, HttpServer, Responder};
use tracing::{info, Level};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use transactional_outbox::clients::{setup_aws_clients, setup_db_pool};
use transactional_outbox::publisher::AwsPublisher;
use transactional_outbox::store::PgEventStore;
use transactional_outbox::{Config, Outbox};

type RelayOutbox = Outbox<PgEventStore, AwsPublisher>;

#[get("/health")]
async fn health_check(outbox: web::Data<RelayOutbox>) -> impl Responder {
    HttpResponse::Ok().body(format!("OK relay={}", outbox.message_relay().state()))
}

// Graceful shutdown signal future
async fn shutdown_signal() {
    use tokio::signal;
    let ctrl_c = signal::ctrl_c();
    #[cfg(unix)]
    let mut term_signal = signal::unix::signal(signal::unix::SignalKind::terminate()).expect("Failed to install SIGTERM handler");
    #[cfg(unix)]
    let terminate = term_signal.recv();
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received. Stopping outbox loops.");
}

fn init_tracing(config: &Config) -> Option<sentry::ClientInitGuard> {
    // Sentry only when a DSN is configured
    let guard = config.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(tracing_subscriber::fmt::layer())
        .with(guard.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // --- Configuration ---
    let config = Config::load().expect("Failed to load configuration");
    let _sentry = init_tracing(&config);
    info!("Configuration loaded.");
    let outbox_config = config.outbox_config()?;
    // --- End Configuration ---

    // 1. Connect to the Database
    info!("Connecting to database...");
    let db_pool = setup_db_pool(&config).await.expect("failed to create database connection.");
    info!("Database connection established.");

    // 2. Setup the AWS clients
    info!("Setting up AWS clients...");
    let (sqs_client, sns_client) = setup_aws_clients(&config).await;
    info!("AWS clients established.");

    // 3. Start the relay and garbage collector loops
    let outbox = Arc::new(Outbox::new(
        outbox_config,
        Arc::new(PgEventStore::new(db_pool)),
        Arc::new(AwsPublisher::new(sqs_client, sns_client)),
    )?);
    let handle = outbox.clone().start();

    // 4. Health check server
    let data = web::Data::from(outbox);
    let health_server = HttpServer::new(move || {
        App::new().app_data(data.clone()).service(health_check)
    })
    .disable_signals()
    .bind(("0.0.0.0", config.health_port))?
    .run();
    let server_handle = health_server.handle();
    info!(port = config.health_port, "Health check server running.");

    // Keep the server running until a shutdown signal stops both it and the loops
    let shutdown = async {
        shutdown_signal().await;
        server_handle.stop(true).await;
        handle.shutdown().await;
    };
    let (served, ()) = tokio::join!(health_server, shutdown);
    served?;

    info!("Outbox relay shut down.");
    Ok(())
}
