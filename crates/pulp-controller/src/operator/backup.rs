//! PulpBackup: snapshot secrets, the Pulp spec, the database and the file
//! tree of an instance into a backup claim.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{info, instrument, warn};

use super::manager::{ManagerPod, Shell, BACKUP_MOUNT, FILE_STORAGE_MOUNT};
use super::snapshot::{self, Snapshot, SnapshotKind};
use super::Context;
use crate::crd::conditions::{self, BACKUP_COMPLETE, FALSE, TRUE};
use crate::crd::pulp::non_empty;
use crate::crd::{Pulp, PulpBackup, PulpBackupStatus, StorageKind};
use crate::error::{ControllerError, ControllerResult};
use crate::generators::DatabaseConnection;
use crate::naming;
use crate::resolve;
use crate::status;
use crate::store::{ObjectStore, PodExecutor};

pub const DEFAULT_STORAGE: &str = "5Gi";

#[instrument(skip_all, fields(name = %obj.name_any(), namespace = %obj.namespace().unwrap_or_default()))]
pub async fn reconcile<S: ObjectStore, E: PodExecutor>(
    obj: Arc<PulpBackup>,
    ctx: Arc<Context<S, E>>,
) -> ControllerResult<Action> {
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let Some(backup) = ctx.store.get::<PulpBackup>(&namespace, &obj.name_any()).await? else {
        return Ok(Action::await_change());
    };
    let status = backup.status.clone().unwrap_or_default();
    if conditions::is_true(&status.conditions, BACKUP_COMPLETE) {
        return Ok(Action::await_change());
    }

    let mut run = BackupRun {
        ctx: ctx.as_ref(),
        name: backup.name_any(),
        namespace,
        backup,
        persisted: status.clone(),
        status,
        reason: "StartingBackupProcess",
    };
    match run.execute().await {
        Ok(()) => Ok(Action::await_change()),
        Err(error) => {
            let reason = run.reason;
            run.set_condition(FALSE, reason, &error.to_string());
            run.persist().await?;
            Err(error)
        }
    }
}

struct BackupRun<'a, S, E> {
    ctx: &'a Context<S, E>,
    backup: PulpBackup,
    name: String,
    namespace: String,
    status: PulpBackupStatus,
    persisted: PulpBackupStatus,
    /// Reason of the stage in progress, reported if it fails.
    reason: &'static str,
}

impl<'a, S: ObjectStore, E: PodExecutor> BackupRun<'a, S, E> {
    fn set_condition(&mut self, status: &str, reason: &str, message: &str) {
        conditions::set(&mut self.status.conditions, BACKUP_COMPLETE, status, reason, message);
    }

    async fn persist(&mut self) -> ControllerResult<()> {
        status::update::<_, PulpBackup, _>(
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

    async fn progress(&mut self, reason: &'static str, message: &str) -> ControllerResult<()> {
        info!(%reason, "{}", message);
        self.reason = reason;
        self.set_condition(FALSE, reason, message);
        self.persist().await
    }

    async fn execute(&mut self) -> ControllerResult<()> {
        let ctx = self.ctx;
        self.progress("StartingBackupProcess", "Starting backup").await?;
        let deployment = self.backup.deployment_name();
        let pulp = self
            .ctx
            .store
            .get::<Pulp>(&self.namespace, &deployment)
            .await?
            .ok_or_else(|| ControllerError::NotFound {
                kind: "Pulp".to_string(),
                name: deployment.clone(),
            })?;

        self.progress("CreatingPVC", "Preparing backup claim").await?;
        self.reason = "FailedCreatingPVC";
        let (claim, claim_namespace) = self.claim().await?;
        self.status.deployment_name = Some(deployment.clone());
        self.status.backup_claim = Some(claim.clone());
        self.status.backup_namespace = Some(claim_namespace.clone());
        self.status.deployment_storage_type = Some(pulp.storage_kind().as_str().to_string());

        self.progress("CreatingPod", "Starting backup manager pod").await?;
        let manager = manager_pod(
            &self.backup,
            &pulp,
            ctx.settings.images.postgres(),
            claim,
            &claim_namespace,
        );
        manager.start(&ctx.store, &ctx.settings).await?;
        let shell = Shell::new(&ctx.executor, &manager.namespace, &manager.name);

        let dir = self
            .status
            .backup_directory
            .clone()
            .unwrap_or_else(|| backup_directory(&deployment));
        self.status.backup_directory = Some(dir.clone());
        self.progress("BackupDir", &format!("Creating {}", dir)).await?;
        shell.run(&["mkdir", "-p", &dir]).await?;

        self.progress("BackupSecrets", "Saving secrets").await?;
        for (snapshot, name) in self.secret_names(&pulp) {
            self.save(&shell, &dir, snapshot, &name).await?;
        }

        self.progress("BackupCR", "Saving the Pulp resource").await?;
        let cr = serde_json::to_string_pretty(&pulp.spec)?;
        shell.write(&format!("{}/{}", dir, snapshot::CR_FILE), &cr).await?;

        self.progress("BackupDB", "Dumping the database").await?;
        let db = reachable_from(
            resolve::database(&ctx.store, &pulp).await?,
            &self.namespace,
            &manager.namespace,
        );
        let dump = format!("{}/{}", dir, snapshot::DB_FILE);
        shell
            .postgres(&db, "pg_dump", &["--format=custom", "--clean", "--create", "-f", &dump])
            .await?;
        shell.run(&["chmod", "0600", &dump]).await?;

        if manager.file_claim.is_some() {
            let target = format!("{}/{}", dir, snapshot::FILES_DIR);
            shell.run(&["mkdir", "-p", &target]).await?;
            shell
                .run(&["cp", "-fr", &format!("{}/.", FILE_STORAGE_MOUNT), &target])
                .await?;
        } else if pulp.storage_kind().uses_file_storage() {
            warn!("file storage lives in another namespace than the backup claim, skipping files");
        }

        self.progress("DeletingBkpPod", "Removing backup manager pod").await?;
        manager.stop(&ctx.store).await?;

        self.set_condition(TRUE, "BackupTasksFinished", "All Backup tasks ran successfully");
        self.persist().await?;
        info!(directory = %dir, "backup finished");
        Ok(())
    }

    /// Claim receiving the backup and its namespace.
    async fn claim(&self) -> ControllerResult<(String, String)> {
        let spec = &self.backup.spec;
        if let Some(claim) = non_empty(&spec.backup_pvc) {
            let namespace = non_empty(&spec.backup_pvc_namespace)
                .unwrap_or(&self.namespace)
                .to_string();
            if self
                .ctx
                .store
                .get::<PersistentVolumeClaim>(&namespace, claim)
                .await?
                .is_none()
            {
                return Err(ControllerError::NotFound {
                    kind: "PersistentVolumeClaim".to_string(),
                    name: claim.to_string(),
                });
            }
            return Ok((claim.to_string(), namespace));
        }

        let name = format!("{}-backup-claim", self.name);
        if self
            .ctx
            .store
            .get::<PersistentVolumeClaim>(&self.namespace, &name)
            .await?
            .is_none()
        {
            info!(claim = %name, "creating backup claim");
            self.ctx
                .store
                .create(&self.namespace, &backup_claim(&self.backup, &name))
                .await?;
        }
        Ok((name, self.namespace.clone()))
    }

    /// Objects to snapshot with their names, in backup order.
    fn secret_names(&self, pulp: &Pulp) -> Vec<(Snapshot, String)> {
        let spec = &pulp.spec;
        let pulp_status = pulp.status_or_default();
        let admin = non_empty(&self.backup.spec.admin_password_secret)
            .map(str::to_string)
            .or(pulp_status.admin_password_secret)
            .unwrap_or_else(|| pulp.admin_password_secret());
        let postgres = non_empty(&self.backup.spec.postgres_configuration_secret)
            .or_else(|| pulp.external_db_secret())
            .map(str::to_string)
            .unwrap_or_else(|| naming::postgres_configuration(&pulp.name_any()));
        let mut names = vec![
            (snapshot::ADMIN, admin),
            (snapshot::POSTGRES, postgres),
            (
                snapshot::DB_FIELDS_ENCRYPTION,
                pulp.db_fields_encryption_secret(),
            ),
            (snapshot::CONTAINER_TOKEN, pulp.container_token_secret()),
        ];
        let optional = [
            (snapshot::SIGNING, non_empty(&spec.signing_secret)),
            (
                snapshot::OBJECT_STORAGE,
                non_empty(&spec.object_storage_s3_secret)
                    .or_else(|| non_empty(&spec.object_storage_azure_secret)),
            ),
            (snapshot::SSO, non_empty(&spec.sso_secret)),
            (snapshot::CUSTOM_SETTINGS, non_empty(&spec.custom_pulp_settings)),
        ];
        names.extend(
            optional
                .into_iter()
                .filter_map(|(s, name)| name.map(|n| (s, n.to_string()))),
        );
        names
    }

    async fn save(
        &mut self,
        shell: &Shell<'_, E>,
        dir: &str,
        snapshot: Snapshot,
        name: &str,
    ) -> ControllerResult<()> {
        let data = match snapshot.kind {
            SnapshotKind::Secret => resolve::secret_strings(&self.ctx.store, &self.namespace, name).await?,
            SnapshotKind::ConfigMap => self
                .ctx
                .store
                .get::<ConfigMap>(&self.namespace, name)
                .await?
                .ok_or_else(|| ControllerError::NotFound {
                    kind: "ConfigMap".to_string(),
                    name: name.to_string(),
                })?
                .data
                .unwrap_or_default(),
        };
        shell
            .write(&snapshot.path(dir), &snapshot.encode(name, &data)?)
            .await?;

        let name = Some(name.to_string());
        match snapshot {
            s if s == snapshot::ADMIN => self.status.admin_password_secret = name,
            s if s == snapshot::POSTGRES => self.status.database_config_secret = name,
            s if s == snapshot::DB_FIELDS_ENCRYPTION => self.status.db_fields_encryption_secret = name,
            s if s == snapshot::CONTAINER_TOKEN => self.status.container_token_secret = name,
            s if s == snapshot::OBJECT_STORAGE => self.status.storage_secret = name,
            _ => {}
        }
        Ok(())
    }
}

/// Manager pod in the claim namespace. Owner references cannot cross
/// namespaces, so a pod beside a foreign claim has none and only mounts
/// the backup claim.
fn manager_pod(
    backup: &PulpBackup,
    pulp: &Pulp,
    image: String,
    claim: String,
    claim_namespace: &str,
) -> ManagerPod {
    let local = backup.namespace().as_deref() == Some(claim_namespace);
    ManagerPod {
        name: format!("{}-backup-manager", backup.name_any()),
        namespace: claim_namespace.to_string(),
        image,
        backup_claim: claim,
        file_claim: file_claim(pulp).filter(|_| local),
        owner: backup.controller_owner_ref(&()).filter(|_| local),
        node_selector: backup.spec.node_selector.clone(),
        tolerations: backup.spec.tolerations.clone(),
        affinity: backup.spec.affinity.clone(),
    }
}

/// Short service names only resolve inside their own namespace.
fn reachable_from(
    mut db: DatabaseConnection,
    pulp_namespace: &str,
    pod_namespace: &str,
) -> DatabaseConnection {
    if pulp_namespace != pod_namespace && !db.host.contains('.') {
        db.host = format!("{}.{}.svc", db.host, pulp_namespace);
    }
    db
}

fn backup_directory(deployment: &str) -> String {
    format!(
        "{}/{}-{}",
        BACKUP_MOUNT,
        deployment,
        Utc::now().format("%Y-%m-%d-%H%M%S")
    )
}

/// Claim holding pulp files, if the instance keeps them on one.
pub(super) fn file_claim(pulp: &Pulp) -> Option<String> {
    match pulp.storage_kind() {
        StorageKind::StorageClass => Some(naming::file_storage_pvc(&pulp.name_any())),
        StorageKind::Pvc => non_empty(&pulp.spec.pvc).map(str::to_string),
        _ => None,
    }
}

/// Provisioned claim. It has no owner so the backup outlives the PulpBackup.
fn backup_claim(backup: &PulpBackup, name: &str) -> PersistentVolumeClaim {
    let size = non_empty(&backup.spec.backup_storage_requirements).unwrap_or(DEFAULT_STORAGE);
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: backup.namespace(),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: non_empty(&backup.spec.backup_storage_class).map(str::to_string),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(size.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capabilities::Capabilities;
    use crate::crd::PulpBackupSpec;
    use crate::generators::secrets::string_data;
    use crate::naming::tests::pulp_named;
    use crate::operator::manager::tests::{fake_filesystem, fake_filesystem_failing, Files};
    use crate::operator::tests::context;
    use crate::store::memory::MemoryStore;
    use crate::store::MockPodExecutor;
    use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus, Secret};
    use std::sync::Mutex;

    pub fn ready_pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("pulp".into()),
                ..Default::default()
            },
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".into(),
                    status: "True".into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn secret(name: &str, entries: &[(&str, &str)]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("pulp".into()),
                ..Default::default()
            },
            data: Some(string_data(entries.iter().map(|(k, v)| (*k, v.to_string())))),
            ..Default::default()
        }
    }

    fn seed(store: &MemoryStore) {
        store.put(&pulp_named("example"));
        store.put(&secret("example-admin-password", &[("password", "admin")]));
        store.put(&secret(
            "example-postgres-configuration",
            &[
                ("host", "example-database-svc"),
                ("port", "5432"),
                ("username", "pulp"),
                ("password", "dbpass"),
                ("database", "pulp"),
            ],
        ));
        store.put(&secret("example-db-fields-encryption", &[("database_fields.symmetric.key", "k")]));
        store.put(&secret("example-container-auth", &[("container_auth_public_key.pem", "pub")]));
        store.put(&ready_pod("nightly-backup-manager"));
        let mut backup = PulpBackup::new(
            "nightly",
            PulpBackupSpec {
                deployment_type: "pulp".into(),
                deployment_name: Some("example".into()),
                ..Default::default()
            },
        );
        backup.metadata.namespace = Some("pulp".into());
        backup.metadata.uid = Some("5678".into());
        store.put(&backup);
    }

    #[tokio::test]
    async fn backup_writes_every_artifact_once() {
        let store = MemoryStore::default();
        seed(&store);
        let files = Files::default();
        let log = Arc::new(Mutex::new(vec![]));
        let ctx = context(&store, fake_filesystem(files.clone(), log.clone()), Capabilities::vanilla());
        let backup: PulpBackup = store.fetch("pulp", "nightly").unwrap();

        let action = reconcile(Arc::new(backup), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());

        let live: PulpBackup = store.fetch("pulp", "nightly").unwrap();
        let status = live.status.unwrap();
        assert!(conditions::is_true(&status.conditions, BACKUP_COMPLETE));
        assert_eq!(
            conditions::find(&status.conditions, BACKUP_COMPLETE).unwrap().reason,
            "BackupTasksFinished"
        );
        assert_eq!(status.backup_claim.as_deref(), Some("nightly-backup-claim"));
        assert_eq!(status.admin_password_secret.as_deref(), Some("example-admin-password"));
        assert_eq!(
            status.database_config_secret.as_deref(),
            Some("example-postgres-configuration")
        );
        assert_eq!(status.deployment_storage_type.as_deref(), Some("emptyDir"));
        let dir = status.backup_directory.unwrap();
        assert!(dir.starts_with("/backup/example-"));

        let files = files.lock().unwrap();
        let (_, admin) = snapshot::ADMIN
            .decode(&files[&snapshot::ADMIN.path(&dir)])
            .unwrap()
            .unwrap();
        assert_eq!(admin["password"], "admin");
        assert!(files.contains_key(&snapshot::CONTAINER_TOKEN.path(&dir)));
        assert!(!files.contains_key(&snapshot::SSO.path(&dir)));
        let cr: crate::crd::PulpSpec =
            serde_json::from_str(&files[&format!("{}/cr_object", dir)]).unwrap();
        assert_eq!(cr.deployment_type, "pulp");

        let log = log.lock().unwrap();
        let pg_dump = log
            .iter()
            .find(|c| c.contains(&"pg_dump".to_string()))
            .unwrap();
        assert!(pg_dump.windows(2).any(|w| w == ["-h", "example-database-svc"]));
        assert!(!log.iter().flatten().any(|a| a.contains("dbpass")));
        assert!(!log.iter().any(|c| c[0] == "cp"));
        assert!(store.fetch::<Pod>("pulp", "nightly-backup-manager").is_none());
        assert!(store
            .fetch::<PersistentVolumeClaim>("pulp", "nightly-backup-claim")
            .is_some());
        drop(log);

        store.clear_mutations();
        let live: PulpBackup = store.fetch("pulp", "nightly").unwrap();
        reconcile(Arc::new(live), ctx).await.unwrap();
        assert!(store.mutations().is_empty());
    }

    #[tokio::test]
    async fn failed_dump_keeps_credentials_out_of_status() {
        let store = MemoryStore::default();
        seed(&store);
        let executor = fake_filesystem_failing(Files::default(), Default::default(), Some("pg_dump"));
        let ctx = context(&store, executor, Capabilities::vanilla());
        let backup: PulpBackup = store.fetch("pulp", "nightly").unwrap();

        assert!(reconcile(Arc::new(backup), ctx).await.is_err());
        let status = store.fetch::<PulpBackup>("pulp", "nightly").unwrap().status.unwrap();
        let complete = conditions::find(&status.conditions, BACKUP_COMPLETE).unwrap();
        assert_eq!(complete.reason, "BackupDB");
        assert!(complete.message.contains("pg_dump failed"));
        assert!(!complete.message.contains("dbpass"));
    }

    #[tokio::test]
    async fn backup_into_another_namespace() {
        let store = MemoryStore::default();
        seed(&store);
        let mut backup: PulpBackup = store.fetch("pulp", "nightly").unwrap();
        backup.spec.backup_pvc = Some("shared-backups".into());
        backup.spec.backup_pvc_namespace = Some("backups".into());
        store.put(&backup);
        store.put(&PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("shared-backups".into()),
                namespace: Some("backups".into()),
                ..Default::default()
            },
            ..Default::default()
        });
        let mut pod = ready_pod("nightly-backup-manager");
        pod.metadata.namespace = Some("backups".into());
        store.put(&pod);
        let log = Arc::new(Mutex::new(vec![]));
        let ctx = context(&store, fake_filesystem(Files::default(), log.clone()), Capabilities::vanilla());

        reconcile(Arc::new(backup), ctx).await.unwrap();
        let status = store.fetch::<PulpBackup>("pulp", "nightly").unwrap().status.unwrap();
        assert!(conditions::is_true(&status.conditions, BACKUP_COMPLETE));
        assert_eq!(status.backup_namespace.as_deref(), Some("backups"));
        let log = log.lock().unwrap();
        let pg_dump = log
            .iter()
            .find(|c| c.contains(&"pg_dump".to_string()))
            .unwrap();
        assert!(pg_dump
            .windows(2)
            .any(|w| w == ["-h", "example-database-svc.pulp.svc"]));
    }

    #[test]
    fn foreign_namespace_manager_has_no_owner() {
        let store = MemoryStore::default();
        seed(&store);
        let mut backup: PulpBackup = store.fetch("pulp", "nightly").unwrap();
        backup.spec.backup_pvc_namespace = Some("backups".into());
        let mut pulp = pulp_named("example");
        pulp.spec.pvc = Some("shared".into());

        let local = manager_pod(&backup, &pulp, "postgres:13".into(), "claim".into(), "pulp");
        assert!(local.owner.is_some());
        assert_eq!(local.file_claim.as_deref(), Some("shared"));

        let foreign = manager_pod(&backup, &pulp, "postgres:13".into(), "claim".into(), "backups");
        assert_eq!(foreign.namespace, "backups");
        assert!(foreign.owner.is_none());
        assert!(foreign.file_claim.is_none());
        assert!(foreign.pod().metadata.owner_references.is_none());
    }

    #[test]
    fn database_host_is_qualified_across_namespaces() {
        let db = DatabaseConnection {
            host: "example-database-svc".into(),
            ..Default::default()
        };
        assert_eq!(reachable_from(db.clone(), "pulp", "pulp").host, "example-database-svc");
        assert_eq!(
            reachable_from(db, "pulp", "backups").host,
            "example-database-svc.pulp.svc"
        );
        let external = DatabaseConnection {
            host: "db.example.com".into(),
            ..Default::default()
        };
        assert_eq!(reachable_from(external, "pulp", "backups").host, "db.example.com");
    }

    #[tokio::test]
    async fn missing_target_is_reported() {
        let store = MemoryStore::default();
        let mut backup = PulpBackup::new(
            "nightly",
            PulpBackupSpec {
                deployment_type: "pulp".into(),
                deployment_name: Some("absent".into()),
                ..Default::default()
            },
        );
        backup.metadata.namespace = Some("pulp".into());
        store.put(&backup);
        let ctx = context(&store, MockPodExecutor::new(), Capabilities::vanilla());

        assert!(reconcile(Arc::new(backup), ctx).await.is_err());
        let status = store.fetch::<PulpBackup>("pulp", "nightly").unwrap().status.unwrap();
        let complete = conditions::find(&status.conditions, BACKUP_COMPLETE).unwrap();
        assert_eq!(complete.status, FALSE);
        assert_eq!(complete.reason, "StartingBackupProcess");
        assert!(complete.message.contains("absent"));
    }

    #[test]
    fn file_claim_follows_storage() {
        let mut pulp = pulp_named("example");
        assert_eq!(file_claim(&pulp), None);
        pulp.spec.file_storage_storage_class = Some("standard".into());
        assert_eq!(file_claim(&pulp).as_deref(), Some("example-file-storage"));
        let mut pulp = pulp_named("example");
        pulp.spec.pvc = Some("shared".into());
        assert_eq!(file_claim(&pulp).as_deref(), Some("shared"));
    }
}
