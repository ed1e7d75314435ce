//! Controllers for the three custom resources and the glue binding them to
//! the cluster watch streams.

mod backup;
mod exposure;
mod jobs;
mod manager;
mod prechecks;
mod pulp;
mod restore;
mod snapshot;

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::{
    apps::v1::{Deployment, StatefulSet},
    batch::v1::Job,
    core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service},
    networking::v1::Ingress,
};
use kube::{
    runtime::{controller::Action, reflector::ObjectRef, watcher, Controller},
    Api, Client, Resource, ResourceExt,
};
use pulp_common::settings::{get_config, Settings};
use tracing::{debug, info, warn};

use crate::capabilities::Capabilities;
use crate::crd::{Pulp, PulpBackup, PulpRestore, Route};
use crate::error::{ControllerError, ControllerResult};
use crate::store::{KubeExecutor, KubeStore, Managed, ObjectStore, PodExecutor, ReverseIndex};

pub use backup::reconcile as reconcile_backup;
pub use pulp::reconcile as reconcile_pulp;
pub use restore::reconcile as reconcile_restore;

/// Shared state handed to every reconcile.
pub struct Context<S, E> {
    pub store: S,
    pub executor: E,
    pub capabilities: Capabilities,
    pub settings: Settings,
    /// Referenced Secret/ConfigMap to the Pulp instances naming it.
    pub index: ReverseIndex,
}

impl<S: ObjectStore, E: PodExecutor> Context<S, E> {
    pub fn new(store: S, executor: E, capabilities: Capabilities, settings: Settings) -> Self {
        Self {
            store,
            executor,
            capabilities,
            settings,
            index: ReverseIndex::default(),
        }
    }
}

fn error_policy<K, S, E>(obj: Arc<K>, error: &ControllerError, ctx: Arc<Context<S, E>>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    warn!(
        kind = %K::kind(&()),
        name = %obj.name_any(),
        %error,
        "reconcile failed"
    );
    Action::requeue(ctx.settings.error_requeue())
}

/// Pulp instances to wake up when `obj` changes: the owner named in its
/// owner references and every instance whose spec references it by name.
fn dependents<K: Resource>(obj: &K, index: &ReverseIndex) -> Vec<ObjectRef<Pulp>> {
    let namespace = obj.namespace().unwrap_or_default();
    let mut refs: Vec<ObjectRef<Pulp>> = obj
        .owner_references()
        .iter()
        .filter(|o| o.kind == "Pulp")
        .map(|o| ObjectRef::new(&o.name).within(&namespace))
        .collect();
    refs.extend(
        index
            .owners_of(&namespace, &obj.name_any())
            .into_iter()
            .map(|(ns, name)| ObjectRef::new(&name).within(&ns)),
    );
    refs
}

fn api<K: Managed>(client: &Client, namespace: Option<&str>) -> Api<K> {
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Run the Pulp, PulpBackup and PulpRestore controllers until a shutdown
/// signal arrives. `namespace` overrides the configured watch namespace.
pub async fn run(namespace: Option<String>) -> ControllerResult<()> {
    let settings = get_config().cloned().unwrap_or_default();
    let namespace = namespace.or_else(|| settings.watch_namespace.clone());
    let ns = namespace.as_deref();

    let client = Client::try_default().await?;
    let capabilities = Capabilities::detect(&client).await?;
    let ctx = Arc::new(Context::new(
        KubeStore::new(client.clone()),
        KubeExecutor::new(client.clone()),
        capabilities,
        settings,
    ));
    info!(namespace = ns.unwrap_or("*"), "starting controllers");

    let wc = watcher::Config::default;
    let secret_index = ctx.index.clone();
    let configmap_index = ctx.index.clone();
    let mut pulps = Controller::new(api::<Pulp>(&client, ns), wc())
        .owns(api::<Deployment>(&client, ns), wc())
        .owns(api::<StatefulSet>(&client, ns), wc())
        .owns(api::<Service>(&client, ns), wc())
        .owns(api::<Job>(&client, ns), wc())
        .owns(api::<Ingress>(&client, ns), wc())
        .owns(api::<PersistentVolumeClaim>(&client, ns), wc())
        .watches(api::<Secret>(&client, ns), wc(), move |secret| {
            dependents(&secret, &secret_index)
        })
        .watches(api::<ConfigMap>(&client, ns), wc(), move |cm| {
            dependents(&cm, &configmap_index)
        });
    if capabilities.routes {
        pulps = pulps.owns(api::<Route>(&client, ns), wc());
    }
    let pulps = pulps
        .shutdown_on_signal()
        .run(
            reconcile_pulp::<KubeStore, KubeExecutor>,
            error_policy::<Pulp, KubeStore, KubeExecutor>,
            ctx.clone(),
        )
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!(name = %obj.name, "reconciled Pulp"),
                Err(e) => warn!(error = %e, "Pulp controller error"),
            }
        });

    let backups = Controller::new(api::<PulpBackup>(&client, ns), wc())
        .owns(api::<Pod>(&client, ns), wc())
        .shutdown_on_signal()
        .run(
            reconcile_backup::<KubeStore, KubeExecutor>,
            error_policy::<PulpBackup, KubeStore, KubeExecutor>,
            ctx.clone(),
        )
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!(name = %obj.name, "reconciled PulpBackup"),
                Err(e) => warn!(error = %e, "PulpBackup controller error"),
            }
        });

    let restores = Controller::new(api::<PulpRestore>(&client, ns), wc())
        .owns(api::<Pod>(&client, ns), wc())
        .shutdown_on_signal()
        .run(
            reconcile_restore::<KubeStore, KubeExecutor>,
            error_policy::<PulpRestore, KubeStore, KubeExecutor>,
            ctx,
        )
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!(name = %obj.name, "reconciled PulpRestore"),
                Err(e) => warn!(error = %e, "PulpRestore controller error"),
            }
        });

    tokio::join!(pulps, backups, restores);
    info!("controllers stopped");
    Ok(())
}
