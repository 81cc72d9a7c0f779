//! astarte-operator - A Kubernetes operator for Astarte installations.
//!
//! Startup order:
//! - structured JSON logging
//! - Kubernetes client and process configuration
//! - health server (answers health checks before leadership is held)
//! - leader election; only the leader runs the controller
//! - controller, lease renewal, and the webhook server when certs are mounted

use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use astarte_operator::config::{LEASE_NAME, OperatorConfig};
use astarte_operator::health::{HealthState, run_health_server};
use astarte_operator::run_controller_scoped;
use astarte_operator::{WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, run_webhook_server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("astarte_operator=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .json()
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting astarte-operator");

    let client = Client::try_default().await?;
    let config = OperatorConfig::from_env();
    info!(
        holder_id = %config.holder_id,
        lease_namespace = %config.lease_namespace,
        watch_namespace = config.watch_namespace.as_deref().unwrap_or("<all>"),
        "Loaded configuration"
    );

    let health_state = Arc::new(HealthState::new());
    let health_handle = {
        let health_state = health_state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state).await {
                error!(error = %e, "Health server error");
            }
        })
    };

    acquire_leadership(&client, &config).await;
    let renewal_handle = spawn_lease_renewal(client.clone(), &config);

    let controller_handle = {
        let health_state = health_state.clone();
        let client = client.clone();
        let namespace = config.watch_namespace.clone();
        tokio::spawn(async move {
            if let Err(e) =
                run_controller_scoped(client, Some(health_state), namespace.as_deref()).await
            {
                error!(error = %e, "Controller failed to start");
            }
        })
    };

    let webhook_handle = if config.webhook_enabled() {
        info!("TLS certificates found, starting webhook server");
        Some(tokio::spawn(async move {
            if let Err(e) = run_webhook_server(WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH).await {
                error!(error = %e, "Webhook server error");
            }
        }))
    } else {
        info!("Webhook certificates not found, webhook server disabled");
        None
    };

    tokio::select! {
        result = controller_handle => log_task_exit("controller", result),
        result = health_handle => log_task_exit("health server", result),
        result = async {
            match webhook_handle {
                Some(handle) => handle.await,
                None => std::future::pending().await,
            }
        } => log_task_exit("webhook server", result),
        // Renewal only returns by panicking; losing the lease exits the process
        Err(e) = renewal_handle => error!(error = %e, "Lease renewal task panicked"),
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
            health_state.set_ready(false).await;
            info!(
                grace = ?config.shutdown_grace,
                "Waiting for in-flight reconciliations; an interrupted upgrade resumes on the next leader"
            );
            tokio::time::sleep(config.shutdown_grace).await;
        }
    }

    info!("Operator stopped");
    Ok(())
}

fn lease_lock(client: Client, config: &OperatorConfig) -> LeaseLock {
    LeaseLock::new(
        client,
        &config.lease_namespace,
        LeaseLockParams {
            holder_id: config.holder_id.clone(),
            lease_name: LEASE_NAME.to_string(),
            lease_ttl: config.lease.ttl,
        },
    )
}

/// Block until this instance holds the lease.
async fn acquire_leadership(client: &Client, config: &OperatorConfig) {
    let lock = lease_lock(client.clone(), config);
    info!(lease_name = LEASE_NAME, "Waiting to acquire leadership");
    loop {
        match lock.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                info!("Acquired leadership");
                return;
            }
            Ok(_) => info!("Another instance is leader, waiting"),
            Err(e) => warn!(error = %e, "Failed to acquire lease, retrying"),
        }
        tokio::time::sleep(config.lease.renew_interval).await;
    }
}

/// Renew the lease in the background. Exits the process once the lease is
/// lost so Kubernetes restarts the pod into a fresh election.
#[allow(clippy::exit)]
fn spawn_lease_renewal(client: Client, config: &OperatorConfig) -> JoinHandle<()> {
    let lock = lease_lock(client, config);
    let interval: Duration = config.lease.renew_interval;
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            match lock.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {}
                Ok(_) => {
                    error!("Lost leadership, shutting down");
                    std::process::exit(1);
                }
                Err(e) => {
                    error!(error = %e, "Failed to renew lease, shutting down");
                    std::process::exit(1);
                }
            }
        }
    })
}

fn log_task_exit(task: &str, result: Result<(), tokio::task::JoinError>) {
    match result {
        Ok(()) => warn!(task, "Task exited"),
        Err(e) => error!(task, error = %e, "Task panicked"),
    }
}

/// Wait for SIGTERM or SIGINT.
///
/// Signal handler setup failures are fatal: without them the operator cannot
/// shut down gracefully.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
