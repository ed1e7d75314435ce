//! One-shot jobs run on behalf of a Pulp instance.

use anyhow::anyhow;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::pulp::PulpReconciler;
use crate::crd::pulp::non_empty;
use crate::deps::{self, DEPS_HASH_LABEL};
use crate::error::{ControllerError, ControllerResult};
use crate::generators::{jobs, Resolved};
use crate::store::{ObjectStore, PodExecutor};

impl<'a, S: ObjectStore, E: PodExecutor> PulpReconciler<'a, S, E> {
    /// Database migrations for the current image and storage backend.
    /// A finished run is remembered in status so it is not repeated.
    pub(super) async fn migration(&mut self, resolved: &Resolved) -> ControllerResult<()> {
        if self.pulp.spec.disable_migrations {
            debug!("migrations disabled");
            return Ok(());
        }
        let image = resolved.images.pulp.as_str();
        let storage = self.pulp.storage_kind().as_str();
        if self.status.image.as_deref() == Some(image)
            && self.status.storage_type.as_deref() == Some(storage)
        {
            return Ok(());
        }

        let labels = jobs::job_labels(&self.pulp, jobs::MIGRATION);
        let runs: Vec<Job> = self
            .ctx
            .store
            .list::<Job>(&self.namespace, &labels)
            .await?
            .into_iter()
            .filter(|j| jobs::job_image(j) == Some(image) && jobs::job_storage(j) == Some(storage))
            .collect();

        if runs.iter().any(jobs::succeeded) {
            info!(%image, %storage, "migrations applied");
            self.status.image = Some(image.to_string());
            self.status.storage_type = Some(storage.to_string());
            return Ok(());
        }
        if let Some(failed) = runs.iter().find(|j| jobs::failed(j)) {
            let name = failed.name_any();
            warn!(job = %name, "migration job failed, removing it for a retry");
            self.remove::<Job>(&name).await?;
            return Err(ControllerError::Runtime(anyhow!(
                "migration job {} failed",
                name
            )));
        }
        if runs.is_empty() {
            let job = self.create(jobs::migration(&self.pulp, resolved)).await?;
            info!(job = %job.name_any(), %image, "started migrations");
        }
        Ok(())
    }

    /// Register signing services whenever the scripts change.
    pub(super) async fn signing_services(&mut self, resolved: &Resolved) -> ControllerResult<()> {
        let Some(scripts) = non_empty(&self.pulp.spec.signing_scripts).map(str::to_string) else {
            return Ok(());
        };
        let Some(secret) = self
            .ctx
            .store
            .get::<Secret>(&self.namespace, &scripts)
            .await?
        else {
            return Ok(());
        };
        if !deps::changed(&secret) {
            return Ok(());
        }
        self.create(jobs::signing(&self.pulp, resolved)).await?;
        deps::track::<S, Secret>(&self.ctx.store, &self.namespace, &scripts).await?;
        Ok(())
    }

    /// Whether the admin password secret content moved since the last
    /// reset. A secret never tracked before is not a change.
    pub(super) async fn admin_password_changed(&self) -> ControllerResult<bool> {
        let name = self.pulp.admin_password_secret();
        let Some(secret) = self
            .ctx
            .store
            .get::<Secret>(&self.namespace, &name)
            .await?
        else {
            return Ok(false);
        };
        Ok(secret.labels().contains_key(DEPS_HASH_LABEL) && deps::changed(&secret))
    }

    pub(super) async fn reset_admin_password(
        &mut self,
        resolved: &Resolved,
        changed: bool,
    ) -> ControllerResult<()> {
        if changed {
            let job = self
                .create(jobs::reset_admin_password(&self.pulp, resolved))
                .await?;
            info!(job = %job.name_any(), "resetting admin password");
        }
        let name = self.pulp.admin_password_secret();
        deps::track::<S, Secret>(&self.ctx.store, &self.namespace, &name).await?;
        Ok(())
    }

    /// Recompute artifact checksums when the allowed list changes.
    pub(super) async fn update_checksums(&mut self, resolved: &Resolved) -> ControllerResult<()> {
        let allowed = &self.pulp.spec.allowed_content_checksums;
        if allowed.is_empty() {
            return Ok(());
        }
        let applied = serde_json::to_string(allowed)?;
        if self.status.allowed_content_checksums.as_deref() == Some(applied.as_str()) {
            return Ok(());
        }
        let job = self
            .create(jobs::update_checksums(&self.pulp, resolved))
            .await?;
        info!(job = %job.name_any(), checksums = %applied, "updating content checksums");
        self.status.allowed_content_checksums = Some(applied);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::Capabilities;
    use crate::crd::Pulp;
    use crate::generators::tests::resolved;
    use crate::naming::tests::pulp_named;
    use crate::operator::tests::context;
    use crate::store::memory::MemoryStore;
    use crate::store::MockPodExecutor;
    use k8s_openapi::api::batch::v1::JobStatus;

    fn finish(store: &MemoryStore, succeeded: bool) {
        let mut job = store.all::<Job>("pulp").pop().unwrap();
        job.status = Some(if succeeded {
            JobStatus {
                succeeded: Some(1),
                ..Default::default()
            }
        } else {
            serde_json::from_value(serde_json::json!({
                "conditions": [{"type": "Failed", "status": "True"}]
            }))
            .unwrap()
        });
        store.put(&job);
    }

    #[tokio::test]
    async fn migration_runs_once_per_image() {
        let store = MemoryStore::default();
        let pulp = pulp_named("example");
        store.put(&pulp);
        let ctx = context(&store, MockPodExecutor::new(), Capabilities::vanilla());
        let resolved = resolved();

        let mut reconciler = PulpReconciler::new(ctx.as_ref(), pulp.clone());
        reconciler.migration(&resolved).await.unwrap();
        reconciler.migration(&resolved).await.unwrap();
        assert_eq!(store.all::<Job>("pulp").len(), 1);
        assert_eq!(reconciler.status.image, None);

        finish(&store, true);
        reconciler.migration(&resolved).await.unwrap();
        assert_eq!(reconciler.status.image.as_deref(), Some(resolved.images.pulp.as_str()));
        assert_eq!(reconciler.status.storage_type.as_deref(), Some("emptyDir"));

        let mut upgraded = resolved.clone();
        upgraded.images.pulp = "quay.io/pulp/pulp-minimal:3.50".into();
        reconciler.migration(&upgraded).await.unwrap();
        assert_eq!(store.all::<Job>("pulp").len(), 2);
    }

    #[tokio::test]
    async fn failed_migration_is_removed_and_reported() {
        let store = MemoryStore::default();
        let pulp = pulp_named("example");
        store.put(&pulp);
        let ctx = context(&store, MockPodExecutor::new(), Capabilities::vanilla());
        let resolved = resolved();

        let mut reconciler = PulpReconciler::new(ctx.as_ref(), pulp);
        reconciler.migration(&resolved).await.unwrap();
        finish(&store, false);

        assert!(reconciler.migration(&resolved).await.is_err());
        assert!(store.all::<Job>("pulp").is_empty());
    }

    #[tokio::test]
    async fn disabled_migrations_create_nothing() {
        let store = MemoryStore::default();
        let mut pulp: Pulp = pulp_named("example");
        pulp.spec.disable_migrations = true;
        let ctx = context(&store, MockPodExecutor::new(), Capabilities::vanilla());

        let mut reconciler = PulpReconciler::new(ctx.as_ref(), pulp);
        reconciler.migration(&resolved()).await.unwrap();
        assert!(store.mutations().is_empty());
    }
}
