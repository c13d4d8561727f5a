use std::sync::Arc;

use anyhow::Result;
use rumqttc::AsyncClient;
use tokio::{net::TcpListener, signal};
use tracing::{error, info};

use moisture_ingest::{
    api,
    bootstrap::{self, Running},
    config::Config,
    db::Store,
    dispatcher::Dispatcher,
    logging,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Env vars may be set externally; a missing .env is fine.
    let _ = dotenvy::dotenv();

    let config = Config::from_env()?;
    logging::init(config.log_format);

    let Running {
        store,
        dispatcher,
        client,
        eventloop,
    } = bootstrap::start(&config).await?;
    info!("Moisture consumer started");

    spawn_reload_on_hangup(dispatcher.clone(), client.clone());

    tokio::select! {
        _ = dispatcher.run(&client, eventloop) => {}
        res = serve_dashboard(&config, store) => res?,
        _ = shutdown_signal() => {}
    }

    if let Err(e) = client.disconnect().await {
        error!(error = %e, "Failed to send MQTT disconnect");
    }
    info!("Moisture consumer stopped");
    Ok(())
}

/// Serve the read-only dashboard API, or wait forever when it is disabled.
async fn serve_dashboard(config: &Config, store: Store) -> Result<()> {
    if !config.dashboard_enabled {
        info!("Dashboard API disabled");
        return std::future::pending().await;
    }

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Dashboard API listening");
    axum::serve(listener, api::router(store)).await?;
    Ok(())
}

/// Reload the topic registry from the store on every SIGHUP.
#[cfg(unix)]
fn spawn_reload_on_hangup(dispatcher: Arc<Dispatcher>, client: AsyncClient) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to install SIGHUP handler; registry reload disabled");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            info!("SIGHUP received, reloading device registry");
            match dispatcher.reload(&client).await {
                Ok(diff) => info!(
                    added = diff.added.len(),
                    removed = diff.removed.len(),
                    "Device registry reloaded"
                ),
                Err(e) => error!(error = %e, "Registry reload failed; keeping previous snapshot"),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(_dispatcher: Arc<Dispatcher>, _client: AsyncClient) {}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
