// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! gcal-invites server
//!
//! Receives Google Calendar push notifications for linked accounts, keeps
//! watch channels renewed, and sends invite notifications to chat users.

use gcal_invites::{
    config::{Config, StorageTarget},
    db::FirestoreDb,
    services::{ChatBridge, KmsService},
    AppState,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured JSON logging for GCP
    init_logging();

    // Load configuration from environment
    let config = Config::from_env().expect("Failed to load configuration");
    tracing::info!(port = config.port, "Starting gcal-invites");

    let (db, kms) = match &config.storage {
        StorageTarget::Firestore { project_id } => {
            let db = FirestoreDb::new(project_id)
                .await
                .expect("Failed to connect to Firestore");
            let kms = KmsService::new(project_id, &config.gcp_region, &config.kms_key_name)
                .await
                .expect("Failed to initialize KMS service");
            tracing::info!(project = %project_id, "Firestore and KMS initialized");
            (db, kms)
        }
        StorageTarget::Memory => memory_backend(),
    };

    // Outbound chat messages
    let (outbox, outbox_rx) = mpsc::unbounded_channel();
    let bridge = ChatBridge::new(config.chat_bridge_url.clone(), config.provider_timeout)
        .spawn(outbox_rx);

    let state = Arc::new(AppState::build(config.clone(), db, kms, outbox)?);
    let scheduler = state.scheduler.clone().start();

    // Build router
    let app = gcal_invites::routes::create_router(state);

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.stop().await;
    // Let queued chat messages drain once the last senders are gone
    if tokio::time::timeout(std::time::Duration::from_secs(5), bridge)
        .await
        .is_err()
    {
        tracing::warn!("Chat outbox did not drain before shutdown");
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(debug_assertions)]
fn memory_backend() -> (FirestoreDb, KmsService) {
    tracing::warn!("Using in-memory storage and mock KMS; data is lost on exit");
    (FirestoreDb::new_in_memory(), KmsService::new_mock())
}

#[cfg(not(debug_assertions))]
fn memory_backend() -> (FirestoreDb, KmsService) {
    panic!("memory:// storage is only available in debug builds");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
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
    tracing::info!("Shutdown signal received");
}

/// Initialize structured JSON logging (GCP-compliant).
fn init_logging() {
    let format = tracing_subscriber::fmt::layer()
        .json()
        .with_target(false)
        .with_current_span(true)
        .flatten_event(true);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gcal_invites=debug".parse().unwrap())
                .add_directive("info".parse().unwrap()),
        )
        .with(format)
        .init();
}
