//! PulpRestore: recreate secrets, the Pulp resource, the database and the
//! file tree of an instance from a backup directory.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret};
use kube::api::ObjectMeta;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{info, instrument};

use super::backup::file_claim;
use super::manager::{self, ManagerPod, Shell, FILE_STORAGE_MOUNT};
use super::snapshot::{self, Snapshot, SnapshotKind};
use super::Context;
use crate::crd::conditions::{self, FALSE, RESTORE_COMPLETE, TRUE};
use crate::crd::pulp::non_empty;
use crate::crd::{Pulp, PulpBackup, PulpRestore, PulpRestoreStatus, PulpSpec};
use crate::error::{ControllerError, ControllerResult};
use crate::generators::secrets::string_data;
use crate::naming::{self, Component};
use crate::resolve;
use crate::status;
use crate::store::{ObjectStore, PodExecutor};

pub const LOCK_TIMESTAMP_KEY: &str = "last-restore-execution";

#[instrument(skip_all, fields(name = %obj.name_any(), namespace = %obj.namespace().unwrap_or_default()))]
pub async fn reconcile<S: ObjectStore, E: PodExecutor>(
    obj: Arc<PulpRestore>,
    ctx: Arc<Context<S, E>>,
) -> ControllerResult<Action> {
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let Some(restore) = ctx.store.get::<PulpRestore>(&namespace, &obj.name_any()).await? else {
        return Ok(Action::await_change());
    };
    if ctx
        .store
        .get::<ConfigMap>(&namespace, naming::RESTORE_LOCK)
        .await?
        .is_some()
    {
        info!("a restore already ran in this namespace, skipping");
        return Ok(Action::await_change());
    }
    let status = restore.status.clone().unwrap_or_default();
    if conditions::is_true(&status.conditions, RESTORE_COMPLETE) {
        return Ok(Action::await_change());
    }

    let mut run = RestoreRun {
        ctx: ctx.as_ref(),
        name: restore.name_any(),
        namespace,
        restore,
        persisted: status.clone(),
        status,
        reason: "StartingRestoreProcess".to_string(),
    };
    match run.execute().await {
        Ok(()) => Ok(Action::await_change()),
        Err(error) => {
            let reason = run.reason.clone();
            run.set_condition(FALSE, &reason, &error.to_string());
            run.persist().await?;
            Err(error)
        }
    }
}

struct RestoreRun<'a, S, E> {
    ctx: &'a Context<S, E>,
    restore: PulpRestore,
    name: String,
    namespace: String,
    status: PulpRestoreStatus,
    persisted: PulpRestoreStatus,
    reason: String,
}

impl<'a, S: ObjectStore, E: PodExecutor> RestoreRun<'a, S, E> {
    fn set_condition(&mut self, status: &str, reason: &str, message: &str) {
        conditions::set(&mut self.status.conditions, RESTORE_COMPLETE, status, reason, message);
    }

    async fn persist(&mut self) -> ControllerResult<()> {
        status::update::<_, PulpRestore, _>(
            &self.ctx.store,
            &self.namespace,
            &self.name,
            &self.persisted,
            &self.status,
        )
        .await?;
        self.persisted = self.status.clone();
        Ok(())
    }

    async fn progress(&mut self, reason: impl Into<String>, message: &str) -> ControllerResult<()> {
        self.reason = reason.into();
        info!(reason = %self.reason, "{}", message);
        let reason = self.reason.clone();
        self.set_condition(FALSE, &reason, message);
        self.persist().await
    }

    async fn execute(&mut self) -> ControllerResult<()> {
        let ctx = self.ctx;
        self.progress("StartingRestoreProcess", "Starting restore").await?;
        let dir = self.backup_directory().await?;

        self.reason = "PVCNotFound".to_string();
        let claim = self.restore.backup_pvc().ok_or_else(|| {
            ControllerError::precheck("PVCNotFound", "neither backup_pvc nor backup_name is set")
        })?;
        if self
            .ctx
            .store
            .get::<PersistentVolumeClaim>(&self.namespace, &claim)
            .await?
            .is_none()
        {
            return Err(ControllerError::NotFound {
                kind: "PersistentVolumeClaim".to_string(),
                name: claim,
            });
        }

        self.progress("CreatingPod", "Starting backup manager pod").await?;
        let mut manager = ManagerPod {
            name: format!("{}-backup-manager", self.name),
            namespace: self.namespace.clone(),
            image: ctx.settings.images.postgres(),
            backup_claim: claim,
            owner: self.restore.controller_owner_ref(&()),
            ..Default::default()
        };
        manager.start(&ctx.store, &ctx.settings).await?;

        {
            let shell = Shell::new(&ctx.executor, &manager.namespace, &manager.name);
            self.reason = "BackupDirNotFound".to_string();
            if !shell.exists("-d", &dir).await? {
                return Err(ControllerError::NotFound {
                    kind: "backup directory".to_string(),
                    name: dir,
                });
            }
            for snapshot in snapshot::ALL {
                self.restore_object(&shell, &dir, snapshot).await?;
            }
        }

        let deployment = self.restore.spec.deployment_name.clone();
        let backup_spec: PulpSpec = {
            let shell = Shell::new(&ctx.executor, &manager.namespace, &manager.name);
            serde_json::from_str(&shell.read(&format!("{}/{}", dir, snapshot::CR_FILE)).await?)?
        };
        self.progress("RestoringCR", &format!("Creating Pulp {}", deployment))
            .await?;
        let pulp = self.restore_pulp(&deployment, &backup_spec).await?;

        if pulp.managed_database() {
            self.progress("WaitingForDatabase", "Waiting for the database to be ready")
                .await?;
            let name = format!("{}-database", deployment);
            let (store, namespace) = (&ctx.store, self.namespace.clone());
            manager::wait_for(&ctx.settings, &format!("statefulset {}", name), move || {
                let (name, namespace) = (name.clone(), namespace.clone());
                async move {
                    Ok(store
                        .get::<StatefulSet>(&namespace, &name)
                        .await?
                        .map(|s| status::statefulset_ready(&s))
                        .unwrap_or(false))
                }
            })
            .await?;
        }

        self.progress("RestoringDB", "Restoring the database").await?;
        let db = resolve::database(&ctx.store, &pulp).await?;
        {
            let shell = Shell::new(&ctx.executor, &manager.namespace, &manager.name);
            let dump = format!("{}/{}", dir, snapshot::DB_FILE);
            shell
                .postgres(&db, "pg_restore", &["--clean", "--if-exists", &dump])
                .await?;
        }

        if let Some(files) = file_claim(&pulp) {
            self.progress("RestoringFiles", "Copying pulp files").await?;
            manager.stop(&ctx.store).await?;
            manager.file_claim = Some(files);
            manager.start(&ctx.store, &ctx.settings).await?;
            let shell = Shell::new(&ctx.executor, &manager.namespace, &manager.name);
            shell
                .run(&[
                    "cp",
                    "-fr",
                    &format!("{}/{}/.", dir, snapshot::FILES_DIR),
                    FILE_STORAGE_MOUNT,
                ])
                .await?;
        }

        self.progress("ScalingUp", "Scaling up deployments").await?;
        self.scale_up(&deployment, &backup_spec).await?;
        let api = Component::Api.deployment_name(&deployment);
        let (store, namespace) = (&ctx.store, self.namespace.clone());
        manager::wait_for(&ctx.settings, &format!("deployment {}", api), move || {
            let (api, namespace) = (api.clone(), namespace.clone());
            async move {
                Ok(store
                    .get::<Deployment>(&namespace, &api)
                    .await?
                    .map(|d| status::deployment_ready(&d))
                    .unwrap_or(false))
            }
        })
        .await?;

        self.progress("DeletingBkpPod", "Removing backup manager pod").await?;
        manager.stop(&ctx.store).await?;
        self.ctx
            .store
            .create(&self.namespace, &restore_lock(&self.namespace))
            .await?;

        self.set_condition(TRUE, "RestoreTasksFinished", "All Restore tasks ran successfully");
        self.persist().await?;
        info!(pulp = %deployment, "restore finished");
        Ok(())
    }

    /// `backup_dir`, else the directory the named PulpBackup recorded.
    async fn backup_directory(&mut self) -> ControllerResult<String> {
        if let Some(dir) = non_empty(&self.restore.spec.backup_dir) {
            return Ok(dir.to_string());
        }
        self.reason = "BackupDirNotFound".to_string();
        let backup = match non_empty(&self.restore.spec.backup_name) {
            Some(name) => self.ctx.store.get::<PulpBackup>(&self.namespace, name).await?,
            None => None,
        };
        backup
            .and_then(|b| b.status)
            .and_then(|s| s.backup_directory)
            .ok_or_else(|| {
                ControllerError::precheck(
                    "BackupDirNotFound",
                    "backup_dir is unset and no completed PulpBackup names one",
                )
            })
    }

    async fn restore_object(
        &mut self,
        shell: &Shell<'_, E>,
        dir: &str,
        snapshot: Snapshot,
    ) -> ControllerResult<()> {
        let path = snapshot.path(dir);
        if !shell.exists("-f", &path).await? {
            return Ok(());
        }
        let Some((name, data)) = snapshot.decode(&shell.read(&path).await?)? else {
            return Ok(());
        };
        self.progress(
            format!("Restoring{}Secret", snapshot.label),
            &format!("Restoring {}", name),
        )
        .await?;

        self.reason = format!("FailedCreate{}Secret", snapshot.label);
        let store = &self.ctx.store;
        match snapshot.kind {
            SnapshotKind::Secret => {
                if store.get::<Secret>(&self.namespace, &name).await?.is_none() {
                    let secret = Secret {
                        metadata: self.meta(&name),
                        data: Some(string_data(data.iter().map(|(k, v)| (k.as_str(), v.clone())))),
                        ..Default::default()
                    };
                    store.create(&self.namespace, &secret).await?;
                }
            }
            SnapshotKind::ConfigMap => {
                if store.get::<ConfigMap>(&self.namespace, &name).await?.is_none() {
                    let configmap = ConfigMap {
                        metadata: self.meta(&name),
                        data: Some(data),
                        ..Default::default()
                    };
                    store.create(&self.namespace, &configmap).await?;
                }
            }
        }
        if snapshot == snapshot::POSTGRES {
            self.status.postgres_secret = Some(name.clone());
        }
        self.progress(
            format!("{}SecretRestored", snapshot.label),
            &format!("{} restored", name),
        )
        .await
    }

    fn meta(&self, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.clone()),
            ..Default::default()
        }
    }

    /// Create the Pulp from the saved spec with every deployment scaled to
    /// zero and migrations off, unless it already exists.
    async fn restore_pulp(&self, name: &str, saved: &PulpSpec) -> ControllerResult<Pulp> {
        if let Some(pulp) = self.ctx.store.get::<Pulp>(&self.namespace, name).await? {
            return Ok(pulp);
        }
        let mut spec = saved.clone();
        for component in [&mut spec.api, &mut spec.content, &mut spec.worker, &mut spec.web] {
            component.replicas = 0;
        }
        spec.disable_migrations = true;
        let mut pulp = Pulp::new(name, spec);
        pulp.metadata.namespace = Some(self.namespace.clone());
        self.ctx.store.create(&self.namespace, &pulp).await
    }

    async fn scale_up(&self, name: &str, saved: &PulpSpec) -> ControllerResult<()> {
        let mut pulp = self
            .ctx
            .store
            .get::<Pulp>(&self.namespace, name)
            .await?
            .ok_or_else(|| ControllerError::NotFound {
                kind: "Pulp".to_string(),
                name: name.to_string(),
            })?;
        let keep = self.restore.spec.keep_replicas;
        let spec = &mut pulp.spec;
        for (component, saved) in [
            (&mut spec.api, &saved.api),
            (&mut spec.content, &saved.content),
            (&mut spec.worker, &saved.worker),
            (&mut spec.web, &saved.web),
        ] {
            component.replicas = if keep { saved.replicas } else { 1 };
        }
        spec.disable_migrations = false;
        self.ctx.store.replace(&self.namespace, &pulp).await?;
        Ok(())
    }
}

/// Marker stopping any further restore in the namespace.
fn restore_lock(namespace: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(naming::RESTORE_LOCK.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            LOCK_TIMESTAMP_KEY.to_string(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        )])),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::Capabilities;
    use crate::crd::PulpRestoreSpec;
    use crate::naming::tests::pulp_named;
    use crate::operator::backup::tests::ready_pod;
    use crate::operator::manager::tests::{fake_filesystem, fake_filesystem_failing, Files};
    use crate::operator::tests::context;
    use crate::store::memory::MemoryStore;
    use crate::store::MockPodExecutor;
    use k8s_openapi::api::apps::v1::{DeploymentStatus, StatefulSetStatus};
    use k8s_openapi::api::core::v1::Pod;
    use std::sync::Mutex;

    const DIR: &str = "/backup/example-2024-05-01-120000";

    fn meta(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("pulp".into()),
            ..Default::default()
        }
    }

    fn restore(keep_replicas: bool) -> PulpRestore {
        let mut restore = PulpRestore::new(
            "recover",
            PulpRestoreSpec {
                deployment_type: "pulp".into(),
                deployment_name: "example".into(),
                backup_pvc: Some("backup-claim".into()),
                backup_dir: Some(DIR.into()),
                keep_replicas,
                ..Default::default()
            },
        );
        restore.metadata.namespace = Some("pulp".into());
        restore.metadata.uid = Some("9012".into());
        restore
    }

    fn seed(store: &MemoryStore, keep_replicas: bool) -> Files {
        store.put(&restore(keep_replicas));
        store.put(&PersistentVolumeClaim {
            metadata: meta("backup-claim"),
            ..Default::default()
        });
        store.put(&ready_pod("recover-backup-manager"));
        store.put(&StatefulSet {
            metadata: meta("example-database"),
            status: Some(StatefulSetStatus {
                ready_replicas: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        });
        store.put(&Deployment {
            metadata: meta("example-api"),
            status: Some(DeploymentStatus {
                ready_replicas: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        });

        let mut saved = pulp_named("example").spec;
        saved.api.replicas = 3;
        let db = BTreeMap::from(
            [
                ("host", "example-database-svc"),
                ("port", "5432"),
                ("username", "pulp"),
                ("password", "dbpass"),
                ("database", "pulp"),
            ]
            .map(|(k, v)| (k.to_string(), v.to_string())),
        );
        let admin = BTreeMap::from([("password".to_string(), "admin".to_string())]);
        Arc::new(Mutex::new(BTreeMap::from([
            (format!("{}/", DIR), String::new()),
            (
                snapshot::ADMIN.path(DIR),
                snapshot::ADMIN.encode("example-admin-password", &admin).unwrap(),
            ),
            (
                snapshot::POSTGRES.path(DIR),
                snapshot::POSTGRES
                    .encode("example-postgres-configuration", &db)
                    .unwrap(),
            ),
            (
                format!("{}/cr_object", DIR),
                serde_json::to_string(&saved).unwrap(),
            ),
        ])))
    }

    #[tokio::test]
    async fn restore_rebuilds_the_instance_once() {
        let store = MemoryStore::default();
        let files = seed(&store, false);
        let log = Arc::new(Mutex::new(vec![]));
        let ctx = context(&store, fake_filesystem(files, log.clone()), Capabilities::vanilla());

        let action = reconcile(Arc::new(restore(false)), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());

        let admin: Secret = store.fetch("pulp", "example-admin-password").unwrap();
        assert_eq!(
            admin.data.unwrap()["password"].0,
            b"admin".to_vec()
        );
        assert!(store
            .fetch::<Secret>("pulp", "example-postgres-configuration")
            .is_some());

        let pulp: Pulp = store.fetch("pulp", "example").unwrap();
        assert_eq!(pulp.spec.api.replicas, 1);
        assert!(!pulp.spec.disable_migrations);

        let log = log.lock().unwrap();
        let pg_restore = log
            .iter()
            .find(|c| c.contains(&"pg_restore".to_string()))
            .unwrap();
        assert!(!pg_restore.iter().any(|a| a.contains("dbpass")));
        assert_eq!(
            pg_restore.last().unwrap(),
            &format!("{}/pulp.db", DIR)
        );
        drop(log);

        let lock: ConfigMap = store.fetch("pulp", naming::RESTORE_LOCK).unwrap();
        assert!(lock.data.unwrap().contains_key(LOCK_TIMESTAMP_KEY));
        assert!(store.fetch::<Pod>("pulp", "recover-backup-manager").is_none());

        let status = store
            .fetch::<PulpRestore>("pulp", "recover")
            .unwrap()
            .status
            .unwrap();
        assert_eq!(
            conditions::find(&status.conditions, RESTORE_COMPLETE).unwrap().reason,
            "RestoreTasksFinished"
        );
        assert_eq!(
            status.postgres_secret.as_deref(),
            Some("example-postgres-configuration")
        );

        store.clear_mutations();
        reconcile(Arc::new(restore(false)), ctx).await.unwrap();
        assert!(store.mutations().is_empty());
    }

    #[tokio::test]
    async fn keep_replicas_uses_saved_counts() {
        let store = MemoryStore::default();
        let files = seed(&store, true);
        let ctx = context(&store, fake_filesystem(files, Default::default()), Capabilities::vanilla());

        reconcile(Arc::new(restore(true)), ctx).await.unwrap();
        let pulp: Pulp = store.fetch("pulp", "example").unwrap();
        assert_eq!(pulp.spec.api.replicas, 3);
        assert_eq!(pulp.spec.worker.replicas, 1);
    }

    #[tokio::test]
    async fn failed_database_restore_keeps_credentials_out_of_status() {
        let store = MemoryStore::default();
        let files = seed(&store, false);
        let executor = fake_filesystem_failing(files, Default::default(), Some("pg_restore"));
        let ctx = context(&store, executor, Capabilities::vanilla());

        assert!(reconcile(Arc::new(restore(false)), ctx).await.is_err());
        let status = store
            .fetch::<PulpRestore>("pulp", "recover")
            .unwrap()
            .status
            .unwrap();
        let complete = conditions::find(&status.conditions, RESTORE_COMPLETE).unwrap();
        assert_eq!(complete.reason, "RestoringDB");
        assert!(complete.message.contains("pg_restore failed"));
        assert!(!complete.message.contains("dbpass"));
    }

    #[tokio::test]
    async fn lock_prevents_a_second_restore() {
        let store = MemoryStore::default();
        store.put(&restore(false));
        store.put(&restore_lock("pulp"));
        let ctx = context(&store, MockPodExecutor::new(), Capabilities::vanilla());

        let action = reconcile(Arc::new(restore(false)), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(store.mutations().is_empty());
    }

    #[tokio::test]
    async fn missing_directory_is_reported() {
        let store = MemoryStore::default();
        seed(&store, false);
        let ctx = context(
            &store,
            fake_filesystem(Files::default(), Default::default()),
            Capabilities::vanilla(),
        );

        assert!(reconcile(Arc::new(restore(false)), ctx).await.is_err());
        let status = store
            .fetch::<PulpRestore>("pulp", "recover")
            .unwrap()
            .status
            .unwrap();
        let complete = conditions::find(&status.conditions, RESTORE_COMPLETE).unwrap();
        assert_eq!(complete.status, FALSE);
        assert_eq!(complete.reason, "BackupDirNotFound");
        assert!(store.fetch::<Pulp>("pulp", "example").is_none());
    }
}
