//! # homebusd: homebus agent daemon
//!
//! Composition root that wires the adapters together and runs the
//! `eventcontroller` agent.
//!
//! ## Responsibilities
//! - Parse configuration (env vars, config file)
//! - Initialize logging
//! - Select the broker transport and the uuid store
//! - Register the agent's devices and handlers, then start the bus loop
//! - Handle graceful shutdown (SIGTERM/SIGINT)
//!
//! ## Dependency rule
//! This is the **only** crate that depends on all other crates.
//! It is the wiring layer; no bus logic belongs here.

use std::sync::Arc;

use homebus_adapter_storage_json::JsonUuidStore;
use homebus_app::connection::Connection;
use homebusd::config::Config;
use homebusd::controller::EventController;
use homebusd::transport::BusTransport;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.logging.filter))
        .init();

    let transport = BusTransport::from_config(&config);
    let store = JsonUuidStore::new(config.uuid_map_path());
    tracing::info!(
        instance = %config.agent.instance,
        backend = ?transport.backend(),
        uuid_map = %store.path().display(),
        "starting homebusd"
    );

    let connection = Arc::new(Connection::new(
        config.agent.instance.clone(),
        transport,
        store,
    ));
    let _controller = EventController::install(&connection).await?;
    connection.start().await?;

    let runner = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move { connection.run().await })
    };

    shutdown_signal().await;
    connection.shutdown().await;
    runner.await?;
    tracing::info!("homebusd stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "unable to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
