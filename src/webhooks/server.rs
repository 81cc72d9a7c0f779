//! Admission webhook server.
//!
//! Provides HTTP endpoints for Kubernetes admission webhooks.
//!
//! To enable webhooks:
//! 1. Deploy cert-manager for TLS certificates
//! 2. Create a ValidatingWebhookConfiguration
//! 3. Mount the TLS certificate secret to the operator pod at /etc/webhook/certs/
//!
//! The webhook server starts automatically when certificates are present.

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::post};
use axum_server::tls_rustls::RustlsConfig;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::crd::Astarte;
use crate::webhooks::policies::{ValidationContext, validate_all};

/// Default path to webhook TLS certificate
pub const WEBHOOK_CERT_PATH: &str = "/etc/webhook/certs/tls.crt";
/// Default path to webhook TLS private key
pub const WEBHOOK_KEY_PATH: &str = "/etc/webhook/certs/tls.key";
/// Default webhook server port
pub const WEBHOOK_PORT: u16 = 9443;
/// Path of the Astarte validating webhook
pub const VALIDATE_PATH: &str = "/validate-astarte";

/// Errors that can occur when running the webhook server
#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("Webhook server error: {0}")]
    Server(#[from] std::io::Error),
}

/// Create the webhook router
pub fn create_webhook_router() -> Router {
    Router::new().route(VALIDATE_PATH, post(validate_astarte))
}

/// kube-rs `deny()` only sets status.message, so the reason is embedded as
/// `[reason] message`.
fn deny_with_reason(
    request: &AdmissionRequest<Astarte>,
    reason: &str,
    message: &str,
) -> AdmissionResponse {
    AdmissionResponse::from(request).deny(format!("[{}] {}", reason, message))
}

/// Decide an Astarte admission request.
pub fn review(request: &AdmissionRequest<Astarte>) -> AdmissionResponse {
    if request.operation == Operation::Delete {
        return AdmissionResponse::from(request);
    }

    let Some(resource) = request.object.as_ref() else {
        error!(uid = %request.uid, "Missing object in request");
        return deny_with_reason(request, "InvalidRequest", "Missing object in request");
    };

    let ctx = ValidationContext {
        resource,
        old_resource: request.old_object.as_ref(),
    };
    let result = validate_all(&ctx);

    if result.allowed {
        info!(
            uid = %request.uid,
            version = %resource.spec.version,
            "Admission request allowed"
        );
        return AdmissionResponse::from(request);
    }

    let reason = result
        .reason
        .unwrap_or_else(|| "ValidationFailed".to_string());
    let message = result
        .message
        .unwrap_or_else(|| "Validation failed".to_string());
    warn!(uid = %request.uid, reason = %reason, message = %message, "Admission request denied");
    deny_with_reason(request, &reason, &message)
}

async fn validate_astarte(
    Json(review_body): Json<AdmissionReview<Astarte>>,
) -> impl IntoResponse {
    let request: AdmissionRequest<Astarte> = match review_body.try_into() {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "Failed to extract admission request");
            return (
                StatusCode::BAD_REQUEST,
                Json(
                    AdmissionResponse::invalid(format!("Invalid AdmissionReview: {}", e))
                        .into_review(),
                ),
            );
        }
    };

    debug!(
        uid = %request.uid,
        operation = ?request.operation,
        namespace = ?request.namespace,
        name = ?request.name,
        "Processing admission request"
    );

    let response: AdmissionReview<DynamicObject> = review(&request).into_review();
    (StatusCode::OK, Json(response))
}

/// Serve `/validate-astarte` over TLS on port 9443.
///
/// Certificate and key are PEM files, usually mounted from a cert-manager
/// Secret.
pub async fn run_webhook_server(cert_path: &str, key_path: &str) -> Result<(), WebhookError> {
    let config = RustlsConfig::from_pem_file(PathBuf::from(cert_path), PathBuf::from(key_path))
        .await
        .map_err(|e| WebhookError::TlsConfig(e.to_string()))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], WEBHOOK_PORT));
    info!(port = WEBHOOK_PORT, path = VALIDATE_PATH, "Webhook server listening with TLS");

    axum_server::bind_rustls(addr, config)
        .serve(create_webhook_router().into_make_service())
        .await?;

    Ok(())
}
