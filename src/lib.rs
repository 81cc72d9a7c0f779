//! Kubernetes operator for Astarte installations.
//!
//! The controller drives each `Astarte` resource to its desired version,
//! running the version-transition upgrade procedures in
//! [`controller::upgrade_engine`] along the way.

pub mod client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;
pub mod webhooks;

pub use health::HealthState;
pub use webhooks::{
    WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, WEBHOOK_PORT, WebhookError, run_webhook_server,
};

use std::fmt::Debug;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{Controller, WatchStreamExt, metadata_watcher, predicates, reflector, watcher};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use controller::context::Context;
use controller::error::Result as ControllerResult;
use controller::reconciler::{error_policy, reconcile};
use crd::Astarte;

fn api<T>(client: &Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    T::DynamicType: Default,
{
    namespace.map_or_else(
        || Api::all(client.clone()),
        |ns| Api::namespaced(client.clone(), ns),
    )
}

/// Cached stream of `Astarte` objects whose generation changed.
///
/// Status patches do not bump the generation, so the operator's own writes
/// never retrigger a reconcile.
fn astarte_stream(
    api: Api<Astarte>,
    config: WatcherConfig,
) -> (
    reflector::Store<Astarte>,
    impl Stream<Item = Result<Astarte, watcher::Error>>,
) {
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, config))
        .default_backoff()
        .applied_objects()
        .predicate_filter(predicates::generation);
    (reader, stream)
}

/// Run the Astarte controller until its stream ends.
///
/// With `namespace` set only that namespace is watched. When `health_state`
/// is given the operator is marked ready and reconciles are recorded.
pub async fn run_controller_scoped(
    client: Client,
    health_state: Option<Arc<HealthState>>,
    namespace: Option<&str>,
) -> ControllerResult<()> {
    info!(
        scope = namespace.unwrap_or("cluster-wide"),
        "Starting Astarte controller"
    );

    let ctx = Arc::new(Context::new(client.clone(), health_state.clone())?);
    if let Some(state) = &health_state {
        state.set_ready(true).await;
    }

    let config = WatcherConfig::default().any_semantic();
    let (reader, astartes) = astarte_stream(api(&client, namespace), config.clone());
    let deployments = api::<Deployment>(&client, namespace);
    // The broker StatefulSet only triggers reconciles, metadata is enough.
    let brokers = metadata_watcher(api::<StatefulSet>(&client, namespace), config.clone())
        .touched_objects();

    Controller::for_stream(astartes, reader)
        .owns(deployments, config)
        .owns_stream(brokers)
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move { log_controller_result(result) })
        .await;

    error!("Controller stream ended unexpectedly");
    Ok(())
}

type ControllerOutcome = std::result::Result<
    (reflector::ObjectRef<Astarte>, kube::runtime::controller::Action),
    kube::runtime::controller::Error<controller::error::Error, watcher::Error>,
>;

/// Log one reconcile outcome. Not-found errors are expected when a watch
/// event arrives for an Astarte that was just deleted.
fn log_controller_result(result: ControllerOutcome) {
    use kube::runtime::controller::Error as ControllerError;

    match result {
        Ok((obj, action)) => debug!(name = %obj.name, ?action, "Reconciled"),
        Err(ControllerError::ObjectNotFound(obj)) => {
            debug!(name = %obj.name, "Astarte no longer exists");
        }
        Err(ControllerError::ReconcilerFailed(err, obj)) if err.is_not_found() => {
            debug!(name = %obj.name, "Astarte deleted during reconcile");
        }
        Err(e) => error!(error = ?e, "Reconciliation error"),
    }
}
