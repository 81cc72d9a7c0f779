//! RabbitMQ management API client.
//!
//! The upgrade engine drains the broker's data queue before migrating the
//! queue topology. Draining is observed through the management API:
//!
//! ```text
//! GET http://{host}:15672/api/queues/%2F/{queue}   (basic auth)
//! {"messages_ready": 0, ...}
//! ```
//!
//! Access is ephemeral: credentials are read from the installation's Secret
//! and, when the operator runs outside the cluster, a port-forward tunnel is
//! opened for the duration of one drain step.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client, ResourceExt};
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;

use crate::client::location::{LocationError, detect_location};
use crate::controller::error::{Error, Result};
use crate::crd::Astarte;
use crate::resources::common::{pod_selector_labels, selector_string};
use crate::resources::port_forward::PortForward;

/// Default management API port.
pub const MANAGEMENT_PORT: u16 = 15672;
/// Default virtual host.
pub const DEFAULT_VHOST: &str = "/";
/// Component label of in-cluster RabbitMQ pods.
pub const RABBITMQ_COMPONENT: &str = "rabbitmq";

const DEFAULT_USERNAME_KEY: &str = "admin-username";
const DEFAULT_PASSWORD_KEY: &str = "admin-password";
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Failure of a single queue depth read.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueStatsError {
    /// Network-level failure; the next read may succeed.
    #[error("management API unreachable: {0}")]
    Unreachable(String),

    /// Non-2xx response; the next read may succeed.
    #[error("management API returned HTTP {0}")]
    Status(u16),

    /// 2xx response that is not a queue description.
    #[error("incompatible management API response: {0}")]
    Decode(String),
}

impl QueueStatsError {
    /// Whether retrying cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(self, QueueStatsError::Decode(_))
    }
}

/// RabbitMQ admin credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Queue description returned by the management API (fields we use).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct QueueInfo {
    pub messages_ready: u64,
}

/// Parse a queue description body.
pub fn parse_queue_info(body: &[u8]) -> std::result::Result<QueueInfo, QueueStatsError> {
    serde_json::from_slice(body).map_err(|e| QueueStatsError::Decode(e.to_string()))
}

/// Ephemeral access to the management API.
///
/// Dropping it closes the tunnel; `close` also waits for the tunnel task.
#[derive(Debug)]
pub struct RabbitMqAccess {
    base_url: String,
    credentials: Credentials,
    tunnel: Option<PortForward>,
}

impl RabbitMqAccess {
    /// Direct access to `base_url` (e.g. `http://host:15672`).
    pub fn new(base_url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            base_url: base_url.into(),
            credentials,
            tunnel: None,
        }
    }

    /// Access through a local port-forward.
    pub fn through_tunnel(tunnel: PortForward, credentials: Credentials) -> Self {
        Self {
            base_url: format!("http://127.0.0.1:{}", tunnel.local_port()),
            credentials,
            tunnel: Some(tunnel),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn is_tunneled(&self) -> bool {
        self.tunnel.is_some()
    }

    /// URL of a queue in the default vhost. The vhost and queue are
    /// percent-encoded as single path segments (`/` becomes `%2F`).
    pub fn queue_url(&self, queue: &str) -> std::result::Result<Url, QueueStatsError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| QueueStatsError::Unreachable(format!("invalid base URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| QueueStatsError::Unreachable("base URL cannot have a path".to_string()))?
            .pop_if_empty()
            .extend(["api", "queues", DEFAULT_VHOST, queue]);
        Ok(url)
    }

    /// Tear down the tunnel, if any.
    pub async fn close(mut self) {
        if let Some(tunnel) = self.tunnel.take() {
            tunnel.close().await;
        }
    }
}

/// Queue observation used by the drain step.
#[async_trait]
pub trait QueueStats: Send + Sync {
    /// Open access to the management API of an installation.
    async fn connect(&self, astarte: &Astarte) -> Result<RabbitMqAccess>;

    /// Number of messages ready for delivery in `queue`.
    async fn messages_ready(
        &self,
        access: &RabbitMqAccess,
        queue: &str,
    ) -> std::result::Result<u64, QueueStatsError>;
}

/// External host configured in the spec, if any.
fn external_host(astarte: &Astarte) -> Option<&str> {
    astarte
        .spec
        .rabbitmq
        .connection
        .as_ref()
        .and_then(|c| c.host.as_deref())
        .filter(|h| !h.is_empty())
}

/// Host of the management API: the configured external host, else the
/// in-cluster service DNS name.
pub fn rabbitmq_host(astarte: &Astarte) -> String {
    match external_host(astarte) {
        Some(host) => host.to_string(),
        None => format!(
            "{}-rabbitmq.{}.svc.cluster.local",
            astarte.name_any(),
            astarte.namespace().unwrap_or_else(|| "default".to_string())
        ),
    }
}

/// Port of the management API.
pub fn management_port(astarte: &Astarte) -> u16 {
    astarte
        .spec
        .rabbitmq
        .connection
        .as_ref()
        .and_then(|c| c.management_port)
        .unwrap_or(MANAGEMENT_PORT)
}

/// Secret name and keys holding the admin credentials.
pub fn credentials_secret(astarte: &Astarte) -> (String, String, String) {
    match astarte
        .spec
        .rabbitmq
        .connection
        .as_ref()
        .and_then(|c| c.secret.as_ref())
    {
        Some(secret) => (
            secret.name.clone(),
            secret.username_key.clone(),
            secret.password_key.clone(),
        ),
        None => (
            format!("{}-rabbitmq-user-credentials", astarte.name_any()),
            DEFAULT_USERNAME_KEY.to_string(),
            DEFAULT_PASSWORD_KEY.to_string(),
        ),
    }
}

/// Read the admin credentials from the installation's Secret.
pub async fn resolve_credentials(client: &Client, astarte: &Astarte) -> Result<Credentials> {
    let namespace = astarte
        .namespace()
        .ok_or_else(|| Error::MissingField("metadata.namespace".to_string()))?;
    let (secret_name, username_key, password_key) = credentials_secret(astarte);

    let secret_api: Api<Secret> = Api::namespaced(client.clone(), &namespace);
    let secret = secret_api.get(&secret_name).await?;
    let data = secret.data.unwrap_or_default();

    let read_key = |key: &str| -> Result<String> {
        let bytes = data.get(key).ok_or_else(|| {
            Error::MissingField(format!("key '{key}' in Secret {secret_name}"))
        })?;
        String::from_utf8(bytes.0.clone()).map_err(|e| {
            Error::Validation(format!("Invalid encoding of '{key}' in Secret {secret_name}: {e}"))
        })
    };

    Ok(Credentials {
        username: read_key(&username_key)?,
        password: read_key(&password_key)?,
    })
}

/// `QueueStats` backed by the management API over HTTP.
#[derive(Clone)]
pub struct RabbitMqManagement {
    client: Client,
    http: reqwest::Client,
}

impl RabbitMqManagement {
    pub fn new(client: Client) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self { client, http })
    }

    async fn open_tunnel(&self, astarte: &Astarte) -> Result<PortForward> {
        let (namespace, selector, port) = tunnel_target(astarte)?;
        Ok(PortForward::start(self.client.clone(), &namespace, &selector, port).await?)
    }
}

/// Namespace, pod selector and management port a local tunnel forwards to.
fn tunnel_target(astarte: &Astarte) -> Result<(String, String, u16)> {
    let namespace = astarte
        .namespace()
        .ok_or_else(|| Error::MissingField("metadata.namespace".to_string()))?;
    let selector = selector_string(&pod_selector_labels(astarte, RABBITMQ_COMPONENT));
    Ok((namespace, selector, management_port(astarte)))
}

#[async_trait]
impl QueueStats for RabbitMqManagement {
    async fn connect(&self, astarte: &Astarte) -> Result<RabbitMqAccess> {
        let credentials = resolve_credentials(&self.client, astarte).await?;

        if external_host(astarte).is_some() {
            let url = format!("http://{}:{}", rabbitmq_host(astarte), management_port(astarte));
            return Ok(RabbitMqAccess::new(url, credentials));
        }

        match detect_location() {
            Ok(_) => {
                let url = format!("http://{}:{}", rabbitmq_host(astarte), management_port(astarte));
                Ok(RabbitMqAccess::new(url, credentials))
            }
            Err(LocationError::RunLocal) => {
                tracing::debug!("Running outside the cluster, tunneling to RabbitMQ");
                let tunnel = self.open_tunnel(astarte).await?;
                Ok(RabbitMqAccess::through_tunnel(tunnel, credentials))
            }
        }
    }

    async fn messages_ready(
        &self,
        access: &RabbitMqAccess,
        queue: &str,
    ) -> std::result::Result<u64, QueueStatsError> {
        let url = access.queue_url(queue)?;
        let response = self
            .http
            .get(url)
            .basic_auth(
                &access.credentials().username,
                Some(&access.credentials().password),
            )
            .send()
            .await
            .map_err(|e| QueueStatsError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(QueueStatsError::Status(status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| QueueStatsError::Unreachable(e.to_string()))?;
        Ok(parse_queue_info(&body)?.messages_ready)
    }
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
    use crate::crd::{AstarteSpec, LoginSecretRef, RabbitMqConnectionSpec};

    fn astarte() -> Astarte {
        let mut astarte = Astarte::new(
            "astarte",
            AstarteSpec {
                version: "0.11.0".to_string(),
                ..Default::default()
            },
        );
        astarte.metadata.namespace = Some("astarte-ns".to_string());
        astarte
    }

    fn credentials() -> Credentials {
        Credentials {
            username: "admin".to_string(),
            password: "secret".to_string(),
        }
    }

    #[test]
    fn test_queue_url_encodes_vhost() {
        let access = RabbitMqAccess::new("http://rabbit:15672", credentials());
        assert_eq!(
            access.queue_url("vmq_all").unwrap().as_str(),
            "http://rabbit:15672/api/queues/%2F/vmq_all"
        );
    }

    #[test]
    fn test_parse_queue_info() {
        let info = parse_queue_info(br#"{"name":"vmq_all","messages_ready":42,"messages":50}"#)
            .unwrap();
        assert_eq!(info.messages_ready, 42);

        let err = parse_queue_info(b"<html>proxy error</html>").unwrap_err();
        assert!(err.is_fatal());

        let err = parse_queue_info(br#"{"name":"vmq_all"}"#).unwrap_err();
        assert!(matches!(err, QueueStatsError::Decode(_)));
    }

    #[test]
    fn test_queue_error_classification() {
        assert!(!QueueStatsError::Status(503).is_fatal());
        assert!(!QueueStatsError::Unreachable("refused".to_string()).is_fatal());
    }

    #[test]
    fn test_default_host_and_secret() {
        let astarte = astarte();
        assert_eq!(
            rabbitmq_host(&astarte),
            "astarte-rabbitmq.astarte-ns.svc.cluster.local"
        );
        assert_eq!(management_port(&astarte), 15672);
        assert_eq!(
            credentials_secret(&astarte),
            (
                "astarte-rabbitmq-user-credentials".to_string(),
                "admin-username".to_string(),
                "admin-password".to_string()
            )
        );
    }

    #[test]
    fn test_external_connection_overrides() {
        let mut astarte = astarte();
        astarte.spec.rabbitmq.connection = Some(RabbitMqConnectionSpec {
            host: Some("rabbit.example.com".to_string()),
            management_port: Some(8443),
            secret: Some(LoginSecretRef {
                name: "rabbit-login".to_string(),
                username_key: "user".to_string(),
                password_key: "pass".to_string(),
            }),
        });

        assert_eq!(rabbitmq_host(&astarte), "rabbit.example.com");
        assert_eq!(management_port(&astarte), 8443);
        assert_eq!(credentials_secret(&astarte).0, "rabbit-login");
    }

    #[test]
    fn test_tunnel_uses_configured_management_port() {
        let mut astarte = astarte();
        let (namespace, selector, port) = tunnel_target(&astarte).unwrap();
        assert_eq!(namespace, "astarte-ns");
        assert!(selector.contains(RABBITMQ_COMPONENT), "{selector}");
        assert_eq!(port, MANAGEMENT_PORT);

        astarte.spec.rabbitmq.connection = Some(RabbitMqConnectionSpec {
            host: None,
            management_port: Some(15673),
            secret: None,
        });
        assert_eq!(tunnel_target(&astarte).unwrap().2, 15673);

        astarte.metadata.namespace = None;
        assert!(tunnel_target(&astarte).is_err());
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let output = format!("{:?}", credentials());
        assert!(output.contains("admin"));
        assert!(!output.contains("secret"));
    }
}
