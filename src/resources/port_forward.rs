//! Port forwarding to pods in the cluster.
//!
//! Used to reach the RabbitMQ management API when the operator runs outside
//! the cluster. `PortForward::start` binds a local listener in a background
//! task and waits for that task to report readiness or failure on one-shot
//! channels, giving up after `READY_TIMEOUT`. There is no retry.
//!
//! When a `PortForward` goes out of scope the forwarding stops (RAII).

use std::net::TcpListener;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// How long to wait for the forwarding task to report readiness.
pub const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur during port forwarding
#[derive(Error, Debug)]
pub enum PortForwardError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("port forward did not become ready within {0:?}")]
    Timeout(Duration),

    #[error("no running pod found for selector: {0}")]
    NoPodsFound(String),

    #[error("port forward task failed: {0}")]
    TaskFailed(String),
}

/// RAII handle on a running port-forward.
#[derive(Debug)]
pub struct PortForward {
    local_port: u16,
    pod_name: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PortForward {
    /// Forward a local port to `remote_port` on a running pod matching `selector`.
    pub async fn start(
        client: Client,
        namespace: &str,
        selector: &str,
        remote_port: u16,
    ) -> Result<Self, PortForwardError> {
        let pod_name = resolve_selector_to_pod(&client, namespace, selector).await?;
        let local_port = get_available_port()?;

        tracing::debug!(
            namespace = namespace,
            pod = %pod_name,
            local_port = local_port,
            remote_port = remote_port,
            "Starting port-forward"
        );

        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let (error_tx, error_rx) = oneshot::channel::<PortForwardError>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let pods: Api<Pod> = Api::namespaced(client, namespace);
        let pod = pod_name.clone();
        let handle = tokio::spawn(async move {
            let listener =
                match tokio::net::TcpListener::bind(("127.0.0.1", local_port)).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        let _ = error_tx.send(e.into());
                        return;
                    }
                };
            let _ = ready_tx.send(());
            serve(listener, pods, pod, remote_port, shutdown_rx).await;
        });

        let mut forward = Self {
            local_port,
            pod_name,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        };

        let signal = tokio::time::timeout(READY_TIMEOUT, async {
            tokio::select! {
                ready = ready_rx => ready.map_err(|_| {
                    PortForwardError::TaskFailed("forwarding task exited before ready".to_string())
                }),
                error = error_rx => match error {
                    Ok(e) => Err(e),
                    Err(_) => Err(PortForwardError::TaskFailed(
                        "forwarding task exited before ready".to_string(),
                    )),
                },
            }
        })
        .await;

        match signal {
            Ok(Ok(())) => {
                tracing::info!(
                    local_port = forward.local_port,
                    pod = %forward.pod_name,
                    "Port-forward established"
                );
                Ok(forward)
            }
            Ok(Err(e)) => {
                forward.stop();
                Err(e)
            }
            Err(_) => {
                forward.stop();
                Err(PortForwardError::Timeout(READY_TIMEOUT))
            }
        }
    }

    /// Local port forwarding to the remote target.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Name of the pod traffic is forwarded to.
    pub fn pod_name(&self) -> &str {
        &self.pod_name
    }

    /// Stop forwarding. Idempotent.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            tracing::debug!(local_port = self.local_port, "Stopping port-forward");
            let _ = tx.send(());
        }
    }

    /// Stop forwarding and wait for the background task to exit.
    pub async fn close(mut self) {
        self.stop();
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            tracing::warn!(error = %e, "Port forward task did not exit cleanly");
        }
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Resolve a label selector to the name of a running pod
async fn resolve_selector_to_pod(
    client: &Client,
    namespace: &str,
    selector: &str,
) -> Result<String, PortForwardError> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);

    tracing::debug!(label_selector = %selector, "Resolving selector to pod");

    let pod_list = pods.list(&ListParams::default().labels(selector)).await?;

    pod_list
        .items
        .into_iter()
        .find(|p| {
            p.status
                .as_ref()
                .and_then(|s| s.phase.as_ref())
                .is_some_and(|phase| phase == "Running")
        })
        .and_then(|p| p.metadata.name)
        .ok_or_else(|| PortForwardError::NoPodsFound(selector.to_string()))
}

/// Accept local connections until shutdown is requested
async fn serve(
    listener: tokio::net::TcpListener,
    pods: Api<Pod>,
    pod_name: String,
    remote_port: u16,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                tracing::debug!("Port forward shutdown requested");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tracing::trace!(client_addr = %addr, "New port forward connection");
                    let pods = pods.clone();
                    let pod_name = pod_name.clone();
                    tokio::spawn(async move {
                        if let Err(e) = forward_connection(pods, &pod_name, remote_port, stream).await {
                            tracing::warn!(error = %e, "Port forward connection error");
                        }
                    });
                }
                Err(e) => tracing::warn!(error = %e, "Port forward accept error"),
            }
        }
    }
}

/// Pipe one local connection to the pod
async fn forward_connection(
    pods: Api<Pod>,
    pod_name: &str,
    remote_port: u16,
    mut local_stream: TcpStream,
) -> Result<(), PortForwardError> {
    let mut forwarder = pods.portforward(pod_name, &[remote_port]).await?;
    let mut upstream = forwarder.take_stream(remote_port).ok_or_else(|| {
        PortForwardError::TaskFailed(format!("no stream for port {remote_port}"))
    })?;

    tokio::io::copy_bidirectional(&mut local_stream, &mut upstream).await?;
    drop(upstream);

    forwarder
        .join()
        .await
        .map_err(|e| PortForwardError::TaskFailed(e.to_string()))
}

/// Find an available local port by binding to port 0
pub fn get_available_port() -> Result<u16, PortForwardError> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::get_unwrap
)]
mod tests {
    use super::*;

    #[test]
    fn test_get_available_port() {
        let port = get_available_port().expect("should find port");
        assert!(port > 0);
    }

    #[test]
    fn test_timeout_error_mentions_duration() {
        let err = PortForwardError::Timeout(READY_TIMEOUT);
        assert!(err.to_string().contains("10s"));
    }
}
