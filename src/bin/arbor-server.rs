// ABOUTME: Server binary wiring configuration, database, pipeline, and HTTP transport together
// ABOUTME: Starts the axum server with graceful shutdown on ctrl-c or SIGTERM
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Arbor Chat

//! # Arbor Server Binary
//!
//! Starts the branching chat server: loads configuration from the
//! environment, opens the SQLite database, assembles the turn pipeline,
//! and serves the HTTP API.

use anyhow::Result;
use arbor_server::{
    config::ServerConfig,
    database::Database,
    llm::EnvProviderFactory,
    logging,
    moderation::{ModerationClient, ModerationProvider},
    pipeline::TurnPipeline,
    registry::TokenCallbackRegistry,
    routes::{self, AppState},
};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Command-line arguments for the server binary
#[derive(Parser)]
#[command(name = "arbor-server")]
#[command(about = "Arbor - branching LLM chat server")]
pub struct Args {
    /// Override HTTP port
    #[arg(long)]
    http_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration from environment
    let mut config = ServerConfig::from_env()?;
    if let Some(http_port) = args.http_port {
        config.http_port = http_port;
    }

    // Initialize production logging
    logging::init_from_env()?;

    info!("Starting Arbor chat server");
    info!("{}", config.summary());

    let database = Database::new(&config.database_url).await?;
    info!("Database initialized: {}", config.database_url);

    let registry = TokenCallbackRegistry::new();
    let factory = Arc::new(EnvProviderFactory);

    let moderation: Arc<dyn ModerationProvider> = if config.moderation_disabled {
        // The remote scorer never runs when moderation is disabled, so a
        // missing API key is tolerated here
        Arc::new(
            ModerationClient::from_env().unwrap_or_else(|_| ModerationClient::new(String::new())),
        )
    } else {
        Arc::new(ModerationClient::from_env()?)
    };

    let pipeline = TurnPipeline::new(
        database.clone(),
        &config,
        factory,
        moderation,
        registry.clone(),
    )?;

    let state = Arc::new(AppState {
        database,
        pipeline,
        registry,
    });
    let app = routes::router(state);

    let listener = TcpListener::bind(("0.0.0.0", config.http_port)).await?;
    info!("Server listening on port {}", config.http_port);
    display_available_endpoints(config.http_port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

/// Resolve when the process receives ctrl-c or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {err}");
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
                error!("Failed to install SIGTERM handler: {err}");
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

    info!("Shutdown signal received");
}

/// Display all available API endpoints with their ports
fn display_available_endpoints(port: u16) {
    let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_owned());

    info!("=== Available API Endpoints ===");
    info!("Turns:");
    info!("   Submit Turn:       POST http://{host}:{port}/api/turns");
    info!("Conversations:");
    info!("   List:              GET  http://{host}:{port}/api/conversations");
    info!("   Detail:            GET  http://{host}:{port}/api/conversations/{{conversation_id}}");
    info!("   Archive:           DELETE http://{host}:{port}/api/conversations/{{conversation_id}}");
    info!("=== End of Endpoint List ===");
}
