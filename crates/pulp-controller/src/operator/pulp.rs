//! Reconciliation of a `Pulp` instance.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolumeClaim, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::Context;
use crate::crd::conditions::{self, FALSE, FINISHED};
use crate::crd::{pulp::non_empty, Pulp, PulpStatus};
use crate::deps;
use crate::drift::{self, Applied};
use crate::error::{ControllerError, ControllerResult};
use crate::generators::{
    cache, cluster, database, galaxy, needs_web, policy, pulpcore, rbac, secrets, services,
    storage, Resolved,
};
use crate::naming::{self, Component};
use crate::resolve;
use crate::status;
use crate::store::{Managed, ObjectStore, PodExecutor};

/// Delay after creating objects, so their first status shows up quickly.
const CREATED_REQUEUE: Duration = Duration::from_secs(1);

#[instrument(skip_all, fields(name = %obj.name_any(), namespace = %obj.namespace_or_default()))]
pub async fn reconcile<S: ObjectStore, E: PodExecutor>(
    obj: Arc<Pulp>,
    ctx: Arc<Context<S, E>>,
) -> ControllerResult<Action> {
    let namespace = obj.namespace_or_default();
    let name = obj.name_any();
    let key = (namespace.clone(), name.clone());

    let Some(pulp) = ctx.store.get::<Pulp>(&namespace, &name).await? else {
        debug!("instance is gone");
        ctx.index.remove(&key);
        return Ok(Action::await_change());
    };
    ctx.index.update(&key, resolve::references(&pulp));
    if pulp.spec.unmanaged {
        info!("instance is unmanaged, skipping");
        return Ok(Action::await_change());
    }

    let before = pulp.status_or_default();
    let mut reconciler = PulpReconciler::new(ctx.as_ref(), pulp);
    let result = match reconciler.run().await {
        Err(ControllerError::Precheck { reason, message }) => {
            warn!(%reason, %message, "precheck failed");
            reconciler.precheck_failed(&reason, &message);
            Ok(Action::await_change())
        }
        Err(error) => {
            reconciler.record_error(&error);
            Err(error)
        }
        ok => ok,
    };
    let persisted =
        status::update::<_, Pulp, _>(&ctx.store, &namespace, &name, &before, &reconciler.status)
            .await;
    let action = result?;
    persisted?;
    Ok(action)
}

/// One pass over an instance. Steps mutate `status` in place; the caller
/// persists it whatever the outcome.
pub(super) struct PulpReconciler<'a, S, E> {
    pub(super) ctx: &'a Context<S, E>,
    pub(super) pulp: Pulp,
    pub(super) status: PulpStatus,
    pub(super) namespace: String,
    pub(super) name: String,
    /// Deployment type condition names are derived from. Taken from status
    /// once recorded so a rejected change does not rename conditions.
    pub(super) deployment_type: String,
    /// Component being reconciled, blamed when a step fails.
    pub(super) current: Option<Component>,
    /// Something was created during this pass.
    pub(super) created: bool,
}

impl<'a, S: ObjectStore, E: PodExecutor> PulpReconciler<'a, S, E> {
    pub(super) fn new(ctx: &'a Context<S, E>, pulp: Pulp) -> Self {
        let status = pulp.status_or_default();
        let deployment_type = status
            .deployment_type
            .clone()
            .unwrap_or_else(|| pulp.spec.deployment_type.clone());
        Self {
            ctx,
            namespace: pulp.namespace_or_default(),
            name: pulp.name_any(),
            pulp,
            status,
            deployment_type,
            current: None,
            created: false,
        }
    }

    pub(super) fn condition_type(&self, suffix: &str) -> String {
        conditions::condition_type(&self.deployment_type, suffix)
    }

    pub(super) async fn apply<K: Managed>(&mut self, obj: K) -> ControllerResult<Applied> {
        let applied = drift::apply(&self.ctx.store, &self.namespace, obj).await?;
        self.created |= applied == Applied::Created;
        Ok(applied)
    }

    pub(super) async fn ensure<K: Managed>(&mut self, obj: K) -> ControllerResult<Applied> {
        let applied = drift::ensure(&self.ctx.store, &self.namespace, obj).await?;
        self.created |= applied == Applied::Created;
        Ok(applied)
    }

    pub(super) async fn create<K: Managed>(&mut self, obj: K) -> ControllerResult<K> {
        let created = self.ctx.store.create(&self.namespace, &obj).await?;
        info!(kind = %K::kind(&()), name = %created.name_any(), "created");
        self.created = true;
        Ok(created)
    }

    pub(super) async fn remove<K: Managed>(&self, name: &str) -> ControllerResult<bool> {
        drift::remove::<S, K>(&self.ctx.store, &self.namespace, name).await
    }

    /// Roll every pulpcore pod on the next apply of their deployments.
    pub(super) fn restart(&mut self, cause: &str) {
        let stamp = deps::restart_stamp();
        info!(%cause, %stamp, "restarting pulpcore pods");
        self.status.last_deployment_update = Some(stamp);
    }

    pub(super) async fn deployment_ready(&self, name: &str) -> ControllerResult<bool> {
        Ok(self
            .ctx
            .store
            .get::<Deployment>(&self.namespace, name)
            .await?
            .map(|d| status::deployment_ready(&d))
            .unwrap_or(false))
    }

    pub(super) fn precheck_failed(&mut self, reason: &str, message: &str) {
        let type_ = self.condition_type(FINISHED);
        conditions::set(&mut self.status.conditions, &type_, FALSE, reason, message);
    }

    pub(super) fn record_error(&mut self, error: &ControllerError) {
        if let Some(component) = self.current {
            status::set_component_error(
                &mut self.status.conditions,
                &self.deployment_type,
                component,
                &error.to_string(),
            );
        }
    }

    pub(super) async fn run(&mut self) -> ControllerResult<Action> {
        self.cluster_tasks().await?;
        self.prechecks().await?;
        self.record_applied_fields();
        self.rbac().await?;
        self.managed_secrets().await?;

        let mut resolved =
            resolve::resolve(&self.ctx.store, &self.pulp, self.ctx.capabilities).await?;
        resolved.restart_stamp = self.status.last_deployment_update.clone();

        self.database(&resolved).await?;
        self.cache(&resolved).await?;
        self.pulpcore(&mut resolved).await?;
        if let Some(action) = self.exposure(&mut resolved).await? {
            return Ok(action);
        }
        self.policies(&resolved).await?;
        self.galaxy(&resolved).await?;
        self.telemetry().await?;
        Ok(self.finish())
    }

    /// Pull secret and trusted CA bundle, only on OpenShift-like clusters.
    async fn cluster_tasks(&mut self) -> ControllerResult<()> {
        if !self.ctx.capabilities.is_openshift() {
            return Ok(());
        }
        self.ensure(cluster::pull_secret(&self.pulp)).await?;
        if self.pulp.spec.mount_trusted_ca {
            self.ensure(cluster::trusted_ca_configmap(&self.pulp)).await?;
            let name = naming::ca_configmap(&self.name);
            if deps::track::<S, ConfigMap>(&self.ctx.store, &self.namespace, &name).await? {
                self.restart("trusted CA bundle changed");
            }
        }
        Ok(())
    }

    /// Mirror the immutable fields into status the first time they are seen.
    fn record_applied_fields(&mut self) {
        let pulp = &self.pulp;
        let status = &mut self.status;
        status
            .deployment_type
            .get_or_insert_with(|| pulp.spec.deployment_type.clone());
        status
            .admin_password_secret
            .get_or_insert_with(|| pulp.admin_password_secret());
        status
            .db_fields_encryption_secret
            .get_or_insert_with(|| pulp.db_fields_encryption_secret());
        status
            .container_token_secret
            .get_or_insert_with(|| pulp.container_token_secret());
        if status.pulp_secret_key.is_none() {
            status.pulp_secret_key = Some(pulp.pulp_secret_key());
        }
        if status.object_storage_azure_secret.is_none() {
            status.object_storage_azure_secret =
                non_empty(&pulp.spec.object_storage_azure_secret).map(str::to_string);
        }
        if status.object_storage_s3_secret.is_none() {
            status.object_storage_s3_secret =
                non_empty(&pulp.spec.object_storage_s3_secret).map(str::to_string);
        }
        if status.external_cache_secret.is_none() {
            status.external_cache_secret = pulp.external_cache_secret().map(str::to_string);
        }
    }

    async fn rbac(&mut self) -> ControllerResult<()> {
        self.current = None;
        let registry_secret = match self
            .ctx
            .store
            .get::<ServiceAccount>(&self.namespace, &self.name)
            .await?
        {
            Some(sa) => rbac::internal_registry_secret(&sa)?,
            None => None,
        };
        self.apply(rbac::service_account(&self.pulp, registry_secret))
            .await?;
        self.apply(rbac::role(&self.pulp)).await?;
        self.apply(rbac::role_binding(&self.pulp)).await?;
        Ok(())
    }

    /// Credentials the operator generates once and never rotates.
    async fn managed_secrets(&mut self) -> ControllerResult<()> {
        if self.pulp.managed_database() {
            self.ensure(database::configuration_secret(&self.pulp))
                .await?;
        }
        self.ensure(secrets::admin_password(&self.pulp)).await?;
        self.ensure(secrets::db_fields_encryption(&self.pulp)?)
            .await?;
        self.ensure(secrets::container_auth(&self.pulp)?).await?;
        self.ensure(secrets::django_secret_key(&self.pulp)).await?;
        Ok(())
    }

    async fn database(&mut self, resolved: &Resolved) -> ControllerResult<()> {
        if !self.pulp.managed_database() {
            return Ok(());
        }
        self.current = Some(Component::Database);
        self.apply(database::statefulset(&self.pulp, resolved))
            .await?;
        self.apply(database::service(&self.pulp)).await?;
        let ready = self
            .ctx
            .store
            .get::<StatefulSet>(
                &self.namespace,
                &Component::Database.deployment_name(&self.name),
            )
            .await?
            .map(|s| status::statefulset_ready(&s))
            .unwrap_or(false);
        status::set_component(
            &mut self.status.conditions,
            &self.deployment_type,
            Component::Database,
            ready,
        );
        Ok(())
    }

    async fn cache(&mut self, resolved: &Resolved) -> ControllerResult<()> {
        if self.pulp.managed_cache() {
            self.current = Some(Component::Cache);
            if let Some(pvc) = cache::pvc(&self.pulp) {
                self.ensure(pvc).await?;
            }
            self.apply(cache::service(&self.pulp)).await?;
            self.apply(cache::deployment(&self.pulp, resolved)).await?;
            self.status.managed_cache_enabled = true;
        } else if self.status.managed_cache_enabled {
            info!("managed cache disabled, removing it");
            self.current = Some(Component::Cache);
            self.remove::<Deployment>(&Component::Cache.deployment_name(&self.name))
                .await?;
            self.remove::<Service>(&Component::Cache.service_name(&self.name))
                .await?;
            self.remove::<PersistentVolumeClaim>(&naming::cache_pvc(&self.name))
                .await?;
            self.status.managed_cache_enabled = false;
        }
        Ok(())
    }

    async fn pulpcore(&mut self, resolved: &mut Resolved) -> ControllerResult<()> {
        self.current = Some(Component::Api);
        if let Some(pvc) = storage::file_storage_pvc(&self.pulp) {
            self.ensure(pvc).await?;
        }

        self.apply(secrets::server(&self.pulp, resolved)).await?;
        let server = naming::server_secret(&self.name);
        if deps::track::<S, Secret>(&self.ctx.store, &self.namespace, &server).await? {
            self.restart("settings changed");
        }
        if let Some(signing) = non_empty(&self.pulp.spec.signing_secret).map(str::to_string) {
            if deps::track::<S, Secret>(&self.ctx.store, &self.namespace, &signing).await? {
                self.restart("signing key changed");
            }
        }
        let admin_changed = self.admin_password_changed().await?;
        if admin_changed {
            self.restart("admin password changed");
        }
        resolved.restart_stamp = self.status.last_deployment_update.clone();

        self.apply(pulpcore::deployment(&self.pulp, resolved, Component::Api))
            .await?;
        self.apply(services::api(&self.pulp)).await?;
        self.component_status(Component::Api).await?;

        self.migration(resolved).await?;
        self.signing_services(resolved).await?;

        self.current = Some(Component::Content);
        self.apply(pulpcore::deployment(&self.pulp, resolved, Component::Content))
            .await?;
        self.apply(services::content(&self.pulp)).await?;
        self.component_status(Component::Content).await?;

        self.current = Some(Component::Worker);
        self.apply(pulpcore::deployment(&self.pulp, resolved, Component::Worker))
            .await?;
        self.component_status(Component::Worker).await?;

        self.current = Some(Component::Api);
        self.reset_admin_password(resolved, admin_changed).await?;
        self.update_checksums(resolved).await?;
        Ok(())
    }

    pub(super) async fn component_status(&mut self, component: Component) -> ControllerResult<()> {
        let ready = self
            .deployment_ready(&component.deployment_name(&self.name))
            .await?;
        status::set_component(
            &mut self.status.conditions,
            &self.deployment_type,
            component,
            ready,
        );
        Ok(())
    }

    async fn policies(&mut self, resolved: &Resolved) -> ControllerResult<()> {
        let web = needs_web(&self.pulp, resolved);
        for component in Component::SCALABLE {
            self.current = Some(component);
            let name = component.deployment_name(&self.name);
            let wanted = component != Component::Web || web;

            match policy::pdb(&self.pulp, component).filter(|_| wanted) {
                Some(pdb) => {
                    self.apply(pdb).await?;
                }
                None => {
                    self.remove::<PodDisruptionBudget>(&name).await?;
                }
            }
            match policy::hpa(&self.pulp, component).filter(|_| wanted) {
                Some(hpa) => {
                    self.apply(hpa).await?;
                }
                None => {
                    self.remove::<HorizontalPodAutoscaler>(&name).await?;
                }
            }
        }
        Ok(())
    }

    /// Default execution environment sync for galaxy installs.
    async fn galaxy(&mut self, resolved: &Resolved) -> ControllerResult<()> {
        self.current = None;
        if !self.pulp.is_galaxy() {
            return Ok(());
        }
        let cronjob = naming::ee_defaults_cronjob(&self.name);
        if !self.pulp.spec.deploy_ee_defaults {
            self.remove::<CronJob>(&cronjob).await?;
            return Ok(());
        }
        if let Some(cm) = galaxy::ee_defaults_configmap(&self.pulp) {
            self.ensure(cm).await?;
        }
        self.apply(galaxy::ee_defaults_cronjob(&self.pulp, resolved))
            .await?;
        Ok(())
    }

    async fn telemetry(&mut self) -> ControllerResult<()> {
        if !self.status.telemetry_enabled || self.pulp.spec.telemetry.enabled {
            return Ok(());
        }
        info!("telemetry disabled, removing the collector");
        self.remove::<ConfigMap>(&naming::otel_configmap(&self.name))
            .await?;
        self.remove::<Service>(&naming::otel_service(&self.name))
            .await?;
        self.status.telemetry_enabled = false;
        Ok(())
    }

    fn finish(&mut self) -> Action {
        let done = status::set_finished(
            &mut self.status.conditions,
            &self.deployment_type,
            &self.name,
        );
        if self.created {
            Action::requeue(CREATED_REQUEUE)
        } else if !done {
            debug!("components not ready yet");
            Action::requeue(self.ctx.settings.requeue_after())
        } else {
            info!("all tasks finished");
            Action::await_change()
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capabilities::Capabilities;
    use crate::crd::conditions::is_true;
    use crate::crd::Route;
    use crate::generators::secrets::string_data;
    use crate::naming::tests::pulp_named;
    use crate::operator::tests::context;
    use crate::store::memory::{MemoryStore, Mutation};
    use crate::store::MockPodExecutor;
    use k8s_openapi::api::batch::v1::Job;
    use k8s_openapi::api::core::v1::{Pod, PodStatus};
    use k8s_openapi::api::networking::v1::Ingress;
    use kube::api::ObjectMeta;
    use serde_json::json;

    pub async fn reconcile_once(
        store: &MemoryStore,
        ctx: &Arc<Context<MemoryStore, MockPodExecutor>>,
        name: &str,
    ) -> ControllerResult<Action> {
        let pulp: Pulp = store.fetch("pulp", name).unwrap();
        reconcile(Arc::new(pulp), ctx.clone()).await
    }

    fn creates(mutations: &[Mutation], kind: &str) -> Vec<String> {
        mutations
            .iter()
            .filter(|m| m.verb == "create" && m.kind == kind)
            .map(|m| m.name.clone())
            .collect()
    }

    fn running_pod(pulp: &Pulp, component: Component) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(format!("{}-{}-abc", pulp.name_any(), component.label())),
                namespace: Some("pulp".into()),
                labels: Some(naming::component_labels(pulp, component)),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some("Running".into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn fresh_install_creates_every_component() {
        let store = MemoryStore::default();
        let mut pulp = pulp_named("example");
        pulp.spec.file_storage_storage_class = Some("standard".into());
        pulp.spec.file_storage_size = Some("2Gi".into());
        pulp.spec.file_storage_access_mode = Some("ReadWriteOnce".into());
        pulp.spec.ingress_type = Some("nodeport".into());
        store.put(&pulp);
        let ctx = context(&store, MockPodExecutor::new(), Capabilities::vanilla());

        let action = reconcile_once(&store, &ctx, "example").await.unwrap();
        assert_eq!(action, Action::requeue(CREATED_REQUEUE));

        let mutations = store.mutations();
        assert_eq!(creates(&mutations, "StatefulSet"), vec!["example-database"]);
        let mut deployments = creates(&mutations, "Deployment");
        deployments.sort();
        assert_eq!(
            deployments,
            vec!["example-api", "example-content", "example-web", "example-worker"]
        );
        assert_eq!(creates(&mutations, "PersistentVolumeClaim"), vec!["example-file-storage"]);
        assert_eq!(creates(&mutations, "Job").len(), 1);
        assert!(store.fetch::<Secret>("pulp", "example-server").is_some());

        let live: Pulp = store.fetch("pulp", "example").unwrap();
        let status = live.status.unwrap();
        assert_eq!(status.deployment_type.as_deref(), Some("pulp"));
        assert_eq!(status.ingress_type.as_deref(), Some("nodeport"));
        assert!(status.last_deployment_update.is_some());
        assert!(!is_true(&status.conditions, "Pulp-Operator-Finished-Execution"));
    }

    #[tokio::test]
    async fn second_pass_writes_nothing() {
        let store = MemoryStore::default();
        store.put(&pulp_named("example"));
        let ctx = context(&store, MockPodExecutor::new(), Capabilities::vanilla());

        reconcile_once(&store, &ctx, "example").await.unwrap();
        store.clear_mutations();
        let action = reconcile_once(&store, &ctx, "example").await.unwrap();

        assert_eq!(store.mutations(), vec![]);
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn unmanaged_instances_are_left_alone() {
        let store = MemoryStore::default();
        let mut pulp = pulp_named("example");
        pulp.spec.unmanaged = true;
        store.put(&pulp);
        let ctx = context(&store, MockPodExecutor::new(), Capabilities::vanilla());

        let action = reconcile_once(&store, &ctx, "example").await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(store.mutations().is_empty());
    }

    #[tokio::test]
    async fn admin_password_change_resets_and_restarts_once() {
        let store = MemoryStore::default();
        store.put(&pulp_named("example"));
        let ctx = context(&store, MockPodExecutor::new(), Capabilities::vanilla());
        reconcile_once(&store, &ctx, "example").await.unwrap();
        store
            .patch_status::<Pulp>(
                "pulp",
                "example",
                &json!({"last_deployment_update": "2000-01-01T00:00:00Z"}),
            )
            .await
            .unwrap();

        // same content: neither a job nor a restart
        let mut admin: Secret = store.fetch("pulp", "example-admin-password").unwrap();
        let original = admin.data.clone();
        store.put(&admin);
        store.clear_mutations();
        reconcile_once(&store, &ctx, "example").await.unwrap();
        assert!(creates(&store.mutations(), "Job").is_empty());
        let live: Pulp = store.fetch("pulp", "example").unwrap();
        assert_eq!(
            live.status.unwrap().last_deployment_update.as_deref(),
            Some("2000-01-01T00:00:00Z")
        );

        admin = store.fetch("pulp", "example-admin-password").unwrap();
        admin.data = Some(string_data([("password", "changed".to_string())]));
        assert_ne!(admin.data, original);
        store.put(&admin);
        store.clear_mutations();
        reconcile_once(&store, &ctx, "example").await.unwrap();

        let jobs = creates(&store.mutations(), "Job");
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].starts_with("example-reset-admin-password-"));
        let live: Pulp = store.fetch("pulp", "example").unwrap();
        assert_ne!(
            live.status.unwrap().last_deployment_update.as_deref(),
            Some("2000-01-01T00:00:00Z")
        );

        store.clear_mutations();
        reconcile_once(&store, &ctx, "example").await.unwrap();
        assert!(creates(&store.mutations(), "Job").is_empty());
    }

    #[tokio::test]
    async fn immutable_field_is_restored() {
        let store = MemoryStore::default();
        store.put(&pulp_named("example"));
        let ctx = context(&store, MockPodExecutor::new(), Capabilities::vanilla());
        reconcile_once(&store, &ctx, "example").await.unwrap();

        let mut live: Pulp = store.fetch("pulp", "example").unwrap();
        live.spec.deployment_type = "galaxy".into();
        store.put(&live);
        store.clear_mutations();

        let action = reconcile_once(&store, &ctx, "example").await.unwrap();
        assert_eq!(action, Action::await_change());

        let live: Pulp = store.fetch("pulp", "example").unwrap();
        assert_eq!(live.spec.deployment_type, "pulp");
        let status = live.status.unwrap();
        let finished =
            conditions::find(&status.conditions, "Pulp-Operator-Finished-Execution").unwrap();
        assert_eq!(finished.status, FALSE);
        assert_eq!(finished.reason, "immutable");
        assert!(creates(&store.mutations(), "Deployment").is_empty());
    }

    #[tokio::test]
    async fn missing_referenced_secret_blocks_reconcile() {
        let store = MemoryStore::default();
        let mut pulp = pulp_named("example");
        pulp.spec.object_storage_s3_secret = Some("example-s3".into());
        store.put(&pulp);
        let ctx = context(&store, MockPodExecutor::new(), Capabilities::vanilla());

        let action = reconcile_once(&store, &ctx, "example").await.unwrap();
        assert_eq!(action, Action::await_change());
        let mutations = store.mutations();
        assert!(mutations.iter().all(|m| m.verb == "status"));
        let live: Pulp = store.fetch("pulp", "example").unwrap();
        let status = live.status.unwrap();
        let finished =
            conditions::find(&status.conditions, "Pulp-Operator-Finished-Execution").unwrap();
        assert_eq!(finished.reason, "ErrorMissingSecret");
        assert_eq!(ctx.index.owners_of("pulp", "example-s3").len(), 1);
    }

    #[tokio::test]
    async fn route_to_ingress_removes_routes_first() {
        let store = MemoryStore::default();
        let mut pulp = pulp_named("example");
        pulp.spec.ingress_type = Some("route".into());
        pulp.spec.route_host = Some("pulp.example.com".into());
        store.put(&pulp);
        store.put(&running_pod(&pulp, Component::Worker));
        store.put(&running_pod(&pulp, Component::Content));

        let mut executor = MockPodExecutor::new();
        executor
            .expect_exec()
            .returning(|_, _, _, _, _| Ok("[]".to_string()));
        let capabilities = Capabilities {
            routes: true,
            openshift_config: false,
        };
        let ctx = context(&store, executor, capabilities);

        reconcile_once(&store, &ctx, "example").await.unwrap();
        let mut routes: Vec<String> = store
            .all::<Route>("pulp")
            .iter()
            .map(|r| r.name_any())
            .collect();
        routes.sort();
        assert_eq!(
            routes,
            vec!["example", "example-api-v3", "example-auth", "example-content"]
        );
        assert!(store.fetch::<Deployment>("pulp", "example-web").is_none());

        let mut live: Pulp = store.fetch("pulp", "example").unwrap();
        live.spec.ingress_type = Some("ingress".into());
        live.spec.ingress_class_name = Some("nginx".into());
        live.spec.ingress_host = Some("pulp.example.com".into());
        store.put(&live);
        store.clear_mutations();

        reconcile_once(&store, &ctx, "example").await.unwrap();
        let mutations = store.mutations();
        let deleted: Vec<&Mutation> = mutations
            .iter()
            .filter(|m| m.verb == "delete" && m.kind == "Route")
            .collect();
        assert_eq!(deleted.len(), 4);
        assert!(creates(&mutations, "Ingress").is_empty());

        reconcile_once(&store, &ctx, "example").await.unwrap();
        assert!(store.fetch::<Ingress>("pulp", "example").is_some());
        assert!(store.all::<Route>("pulp").is_empty());
        let status = store.fetch::<Pulp>("pulp", "example").unwrap().status.unwrap();
        assert_eq!(status.ingress_type.as_deref(), Some("ingress"));
        assert!(is_true(&status.conditions, "Pulp-Ingress-Ready"));
        assert!(conditions::find(&status.conditions, "Pulp-Route-Ready").is_none());
    }

    #[tokio::test]
    async fn disabled_cache_is_torn_down() {
        let store = MemoryStore::default();
        let mut pulp = pulp_named("example");
        pulp.spec.cache.enabled = true;
        store.put(&pulp);
        let ctx = context(&store, MockPodExecutor::new(), Capabilities::vanilla());
        reconcile_once(&store, &ctx, "example").await.unwrap();
        assert!(store.fetch::<Deployment>("pulp", "example-redis").is_some());

        let mut live: Pulp = store.fetch("pulp", "example").unwrap();
        assert!(live.status.as_ref().unwrap().managed_cache_enabled);
        live.spec.cache.enabled = false;
        store.put(&live);
        reconcile_once(&store, &ctx, "example").await.unwrap();

        assert!(store.fetch::<Deployment>("pulp", "example-redis").is_none());
        assert!(store.fetch::<Service>("pulp", "example-redis-svc").is_none());
        let live: Pulp = store.fetch("pulp", "example").unwrap();
        assert!(!live.status.unwrap().managed_cache_enabled);
    }

    #[tokio::test]
    async fn checksum_job_runs_once_per_list() {
        let store = MemoryStore::default();
        let mut pulp = pulp_named("example");
        pulp.spec.allowed_content_checksums = vec!["sha256".into(), "sha512".into()];
        store.put(&pulp);
        let ctx = context(&store, MockPodExecutor::new(), Capabilities::vanilla());

        reconcile_once(&store, &ctx, "example").await.unwrap();
        let jobs = store.all::<Job>("pulp");
        assert!(jobs
            .iter()
            .any(|j| j.name_any().starts_with("example-update-content-checksums-")));
        let live: Pulp = store.fetch("pulp", "example").unwrap();
        assert_eq!(
            live.status.unwrap().allowed_content_checksums.as_deref(),
            Some(r#"["sha256","sha512"]"#)
        );

        store.clear_mutations();
        reconcile_once(&store, &ctx, "example").await.unwrap();
        assert!(creates(&store.mutations(), "Job").is_empty());
    }
}
