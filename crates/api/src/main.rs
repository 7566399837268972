use std::sync::Arc;

use anyhow::Context;

use microlearn_api::app::{build_app, services};
use microlearn_core::ProviderLimits;
use microlearn_infra::config::AppConfig;
use microlearn_infra::{Stores, db};
use microlearn_messaging::{CloudApiConfig, CloudApiGateway, LoggingGateway, MessagingGateway};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- Configuration + tracing ---
    let config = AppConfig::from_env().context("invalid configuration")?;
    microlearn_observability::init();
    tracing::info!(bind_addr = %config.bind_addr, "loaded configuration");

    // --- Stores ---
    let stores = match &config.database_url {
        Some(url) => {
            let pool = db::connect(url, config.database_max_connections)
                .await
                .context("failed to connect to database")?;
            db::ensure_schema(&pool)
                .await
                .context("failed to create database schema")?;
            tracing::info!("using postgres stores");
            Stores::postgres(pool)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory stores");
            Stores::in_memory()
        }
    };

    // --- Messaging gateway ---
    let gateway: Arc<dyn MessagingGateway> = match &config.whatsapp {
        Some(whatsapp) => Arc::new(
            CloudApiGateway::new(CloudApiConfig {
                base_url: whatsapp.base_url.clone(),
                phone_number_id: whatsapp.phone_number_id.clone(),
                access_token: whatsapp.access_token.clone(),
                timeout: config.send_timeout,
                limits: ProviderLimits::default(),
            })
            .context("failed to build WhatsApp client")?,
        ),
        None => {
            tracing::warn!("WhatsApp credentials not set; outbound messages are only logged");
            Arc::new(LoggingGateway::new())
        }
    };

    // --- Services + background work ---
    let services = Arc::new(services::build_services(&config, stores, gateway));
    let background = services
        .start_background(&config)
        .await
        .context("failed to start background tasks")?;

    // --- HTTP ---
    let app = build_app(services);
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("server stopped accepting connections, draining background work");
    background.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT, starting graceful shutdown"),
        () = terminate => tracing::info!("received SIGTERM, starting graceful shutdown"),
    }
}
