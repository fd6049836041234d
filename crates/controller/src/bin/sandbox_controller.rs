/*
 * 5D Labs Agent Platform - Sandbox Controller Service
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Sandbox Controller Service
//!
//! Runs the `AgentTask` reconciler, the orphan sweeper and the HTTP API
//! (task origination plus the worker-facing endpoints) in one process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use sandbox_controller::api::{router, AppState};
use sandbox_controller::tasks::assign::HttpAssignmentClient;
use sandbox_controller::tasks::credentials::{
    CredentialExchange, CredentialIssuer, GitHubAppExchange, GitHubAppSettings,
};
use sandbox_controller::tasks::sandbox::KubeSandboxProvisioner;
use sandbox_controller::tasks::store::KubeTaskStore;
use sandbox_controller::tasks::sweep::OrphanSweeper;
use sandbox_controller::tasks::{load_config, run_task_controller, ReconcilePolicy, Reconciler};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

fn credential_exchange(
    config: &sandbox_controller::ControllerConfig,
) -> Option<Arc<dyn CredentialExchange>> {
    let Some(settings) = GitHubAppSettings::from_env(
        &config.credentials.api_base,
        config.credentials.max_attempts,
        Duration::from_millis(config.credentials.initial_backoff_millis),
        Duration::from_secs(config.credentials.request_timeout_seconds),
    ) else {
        warn!("GITHUB_APP_* not set, credential requests will be refused");
        return None;
    };

    match GitHubAppExchange::new(settings) {
        Ok(exchange) => {
            info!(?exchange, "GitHub App credential exchange configured");
            Some(Arc::new(exchange))
        }
        Err(e) => {
            error!("Invalid GitHub App configuration, credential requests will be refused: {}", e);
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!(
        "Starting 5D Labs Sandbox Controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = Arc::new(load_config()?);
    let namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "agents".to_string());
    let listen_addr = std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let callback_api_address = std::env::var("CONTROLLER_API_ADDRESS")
        .unwrap_or_else(|_| format!("http://sandbox-controller.{namespace}.svc:8080"));

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    let store = Arc::new(KubeTaskStore::new(client.clone(), &namespace));
    let provisioner = Arc::new(KubeSandboxProvisioner::new(
        client.clone(),
        &namespace,
        config.sandbox_settings(),
    ));
    let assigner = Arc::new(HttpAssignmentClient::new(
        config.assignment.worker_port,
        Duration::from_secs(config.assignment.request_timeout_seconds),
    )?);
    let notifier = Arc::new(notify::Notifier::from_env(config.notify_policy()));

    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        provisioner.clone(),
        assigner,
        notifier,
        ReconcilePolicy::from_config(&config, &callback_api_address),
    ));

    let controller_handle = {
        let client = client.clone();
        let namespace = namespace.clone();
        let reconciler = reconciler.clone();
        tokio::spawn(async move {
            if let Err(e) = run_task_controller(client, namespace, reconciler).await {
                error!("Controller error: {}", e);
            }
        })
    };

    let sweeper_handle = tokio::spawn(
        OrphanSweeper::from_config(store.clone(), provisioner, &config).run(),
    );

    let state = AppState {
        store: store.clone(),
        reconciler,
        issuer: CredentialIssuer::new(store, credential_exchange(&config)),
    };

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    info!("Controller HTTP server listening on {}", listen_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    controller_handle.abort();
    sweeper_handle.abort();
    info!("Controller service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
