//! The short-lived pod backup and restore run their commands in.

use std::collections::BTreeMap;
use std::future::Future;

use k8s_openapi::api::core::v1::{
    Affinity, Container, ExecAction, PersistentVolumeClaimVolumeSource, Pod, PodSpec, Probe,
    Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use pulp_common::settings::Settings;
use tracing::{debug, info};

use crate::error::{ControllerError, ControllerResult};
use crate::generators::DatabaseConnection;
use crate::store::{ObjectStore, PodExecutor};

pub const CONTAINER: &str = "manager";
pub const BACKUP_MOUNT: &str = "/backup";
pub const FILE_STORAGE_MOUNT: &str = "/var/lib/pulp";

/// Desired manager pod: the postgres image idling with the backup claim
/// and, when pulp keeps files on a claim, the file storage mounted.
#[derive(Debug, Clone, Default)]
pub struct ManagerPod {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub backup_claim: String,
    pub file_claim: Option<String>,
    pub owner: Option<OwnerReference>,
    pub node_selector: BTreeMap<String, String>,
    pub tolerations: Vec<Toleration>,
    pub affinity: Option<Affinity>,
}

fn claim_volume(name: &str, claim: &str) -> Volume {
    Volume {
        name: name.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim.to_string(),
            read_only: None,
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

impl ManagerPod {
    pub fn pod(&self) -> Pod {
        let mut volumes = vec![claim_volume("backup", &self.backup_claim)];
        let mut mounts = vec![mount("backup", BACKUP_MOUNT)];
        if let Some(claim) = &self.file_claim {
            volumes.push(claim_volume("file-storage", claim));
            mounts.push(mount("file-storage", FILE_STORAGE_MOUNT));
        }
        Pod {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([(
                    "app.kubernetes.io/component".to_string(),
                    "backup-manager".to_string(),
                )])),
                owner_references: self.owner.clone().map(|o| vec![o]),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: CONTAINER.to_string(),
                    image: Some(self.image.clone()),
                    command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
                    readiness_probe: Some(Probe {
                        exec: Some(ExecAction {
                            command: Some(vec!["ls".to_string(), BACKUP_MOUNT.to_string()]),
                        }),
                        initial_delay_seconds: Some(1),
                        period_seconds: Some(3),
                        ..Default::default()
                    }),
                    volume_mounts: Some(mounts),
                    ..Default::default()
                }],
                restart_policy: Some("Never".to_string()),
                volumes: Some(volumes),
                node_selector: (!self.node_selector.is_empty()).then(|| self.node_selector.clone()),
                tolerations: (!self.tolerations.is_empty()).then(|| self.tolerations.clone()),
                affinity: self.affinity.clone(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Get or create the pod and wait until it is ready.
    pub async fn start<S: ObjectStore>(&self, store: &S, settings: &Settings) -> ControllerResult<()> {
        if store.get::<Pod>(&self.namespace, &self.name).await?.is_none() {
            info!(pod = %self.name, "starting manager pod");
            store.create(&self.namespace, &self.pod()).await?;
        }
        let (namespace, name) = (self.namespace.as_str(), self.name.as_str());
        wait_for(settings, &format!("pod {}", name), move || async move {
            Ok(store
                .get::<Pod>(namespace, name)
                .await?
                .map(|p| pod_ready(&p))
                .unwrap_or(false))
        })
        .await
    }

    pub async fn stop<S: ObjectStore>(&self, store: &S) -> ControllerResult<()> {
        if store.delete::<Pod>(&self.namespace, &self.name).await? {
            info!(pod = %self.name, "removed manager pod");
        }
        Ok(())
    }
}

pub fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .iter()
        .flat_map(|s| s.conditions.iter().flatten())
        .any(|c| c.type_ == "Ready" && c.status == "True")
}

/// Poll `check` every `poll_interval` until it holds or `poll_timeout` passes.
pub async fn wait_for<F, Fut>(settings: &Settings, what: &str, mut check: F) -> ControllerResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ControllerResult<bool>>,
{
    let poll = async {
        loop {
            if check().await? {
                return Ok::<(), ControllerError>(());
            }
            debug!(%what, "waiting");
            tokio::time::sleep(settings.poll_interval()).await;
        }
    };
    match tokio::time::timeout(settings.poll_timeout(), poll).await {
        Ok(result) => result,
        Err(_) => Err(ControllerError::WaitTimeout {
            what: what.to_string(),
            secs: settings.poll_timeout_secs,
        }),
    }
}

/// Commands run in the manager container.
pub struct Shell<'a, E> {
    executor: &'a E,
    namespace: &'a str,
    pod: &'a str,
}

impl<'a, E: PodExecutor> Shell<'a, E> {
    pub fn new(executor: &'a E, namespace: &'a str, pod: &'a str) -> Self {
        Self {
            executor,
            namespace,
            pod,
        }
    }

    pub async fn run(&self, command: &[&str]) -> ControllerResult<String> {
        self.exec(command, None).await
    }

    /// Run `command` with `input` on its stdin.
    pub async fn run_with_input(&self, command: &[&str], input: &str) -> ControllerResult<String> {
        self.exec(command, Some(input.to_string())).await
    }

    async fn exec(&self, command: &[&str], stdin: Option<String>) -> ControllerResult<String> {
        self.executor
            .exec(
                self.namespace,
                self.pod,
                Some(CONTAINER.to_string()),
                command.iter().map(|c| c.to_string()).collect(),
                stdin,
            )
            .await
    }

    /// Write `content` to `path` through stdin. `head -c` stops at the
    /// byte count, the remote end never has to see stdin close.
    pub async fn write(&self, path: &str, content: &str) -> ControllerResult<()> {
        let len = content.len().to_string();
        self.run_with_input(&["sh", "-c", WRITE_SCRIPT, path, &len], content)
            .await?;
        Ok(())
    }

    /// Run a postgres client against `db`. Connection parameters go on the
    /// command line, the password reaches libpq as `PGPASSWORD` read from stdin.
    pub async fn postgres(
        &self,
        db: &DatabaseConnection,
        program: &str,
        args: &[&str],
    ) -> ControllerResult<String> {
        let command = postgres_command(db, program, args);
        let command: Vec<&str> = command.iter().map(String::as_str).collect();
        self.run_with_input(&command, &db.password).await
    }

    pub async fn read(&self, path: &str) -> ControllerResult<String> {
        self.run(&["cat", path]).await
    }

    /// `test <flag> <path>`. A failing test is `false`, not an error.
    pub async fn exists(&self, flag: &str, path: &str) -> ControllerResult<bool> {
        match self.run(&["test", flag, path]).await {
            Ok(_) => Ok(true),
            Err(ControllerError::Exec { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

const WRITE_SCRIPT: &str = "head -c \"$1\" > \"$0\"";

const POSTGRES_SCRIPT: &str =
    "export PGPASSWORD=\"$(head -c \"$0\")\" PGSSLMODE=\"$1\"; shift; exec \"$@\"";

/// Argv for `program` with the connection of `db`, minus the password.
pub fn postgres_command(db: &DatabaseConnection, program: &str, args: &[&str]) -> Vec<String> {
    let sslmode = if db.sslmode.is_empty() {
        "prefer"
    } else {
        db.sslmode.as_str()
    };
    let len = db.password.len().to_string();
    let mut command: Vec<String> = [
        "sh",
        "-c",
        POSTGRES_SCRIPT,
        len.as_str(),
        sslmode,
        program,
        "-h",
        db.host.as_str(),
        "-p",
        db.port.as_str(),
        "-U",
        db.user.as_str(),
        "-d",
        db.name.as_str(),
    ]
    .iter()
    .map(|a| a.to_string())
    .collect();
    command.extend(args.iter().map(|a| a.to_string()));
    command
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::MockPodExecutor;
    use std::sync::{Arc, Mutex};

    pub type Files = Arc<Mutex<BTreeMap<String, String>>>;

    pub type Log = Arc<Mutex<Vec<Vec<String>>>>;

    fn exec_error(command: &[String], message: &str) -> ControllerError {
        ControllerError::Exec {
            pod: "manager".into(),
            program: command[0].clone(),
            message: message.into(),
        }
    }

    /// Executor backed by an in-memory file map. Directories are entries
    /// ending in `/`. Every command is appended to `log`.
    pub fn fake_filesystem(files: Files, log: Log) -> MockPodExecutor {
        fake_filesystem_failing(files, log, None)
    }

    /// Like `fake_filesystem`, but the postgres client `failing` exits with
    /// an error.
    pub fn fake_filesystem_failing(
        files: Files,
        log: Log,
        failing: Option<&'static str>,
    ) -> MockPodExecutor {
        let mut executor = MockPodExecutor::new();
        executor.expect_exec().returning(move |_, _, _, command, stdin| {
            log.lock().unwrap().push(command.clone());
            let mut files = files.lock().unwrap();
            let args: Vec<&str> = command.iter().map(String::as_str).collect();
            match args.as_slice() {
                ["sh", "-c", WRITE_SCRIPT, path, _] => {
                    files.insert(path.to_string(), stdin.unwrap_or_default());
                    Ok(String::new())
                }
                ["sh", "-c", POSTGRES_SCRIPT, _, _, program, ..] if Some(*program) == failing => {
                    Err(exec_error(&command, "connection refused"))
                }
                ["cat", path] => files
                    .get(*path)
                    .cloned()
                    .ok_or_else(|| exec_error(&command, "no such file")),
                ["test", "-f", path] if files.contains_key(*path) => Ok(String::new()),
                ["test", "-d", path] if files.contains_key(&format!("{}/", path)) => {
                    Ok(String::new())
                }
                ["test", ..] => Err(exec_error(&command, "exit code 1")),
                ["mkdir", "-p", path] => {
                    files.insert(format!("{}/", path), String::new());
                    Ok(String::new())
                }
                _ => Ok(String::new()),
            }
        });
        executor
    }

    #[test]
    fn pod_mounts_file_storage_when_given() {
        let manager = ManagerPod {
            name: "nightly-backup-manager".into(),
            namespace: "pulp".into(),
            image: "postgres:13".into(),
            backup_claim: "nightly-backup-claim".into(),
            file_claim: Some("example-file-storage".into()),
            ..Default::default()
        };
        let pod = manager.pod();
        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        let container = &spec.containers[0];
        assert_eq!(container.name, CONTAINER);
        assert_eq!(
            container.command.clone().unwrap(),
            vec!["sleep".to_string(), "infinity".to_string()]
        );
        let mounts: Vec<String> = container
            .volume_mounts
            .clone()
            .unwrap()
            .into_iter()
            .map(|m| m.mount_path)
            .collect();
        assert_eq!(mounts, vec![BACKUP_MOUNT.to_string(), FILE_STORAGE_MOUNT.to_string()]);
    }

    fn connection(password: &str) -> DatabaseConnection {
        DatabaseConnection {
            host: "db.example.com".into(),
            port: "5432".into(),
            user: "pulp".into(),
            password: password.into(),
            name: "pulp".into(),
            sslmode: "require".into(),
        }
    }

    #[test]
    fn postgres_command_leaves_the_password_out() {
        let command = postgres_command(&connection("p@ss/w#rd"), "pg_dump", &["-f", "/backup/pulp.db"]);
        assert!(!command.iter().any(|a| a.contains("p@ss")));
        assert_eq!(command[3], "9");
        assert_eq!(
            command[4..].to_vec(),
            vec![
                "require", "pg_dump", "-h", "db.example.com", "-p", "5432", "-U", "pulp", "-d",
                "pulp", "-f", "/backup/pulp.db"
            ]
        );
    }

    #[tokio::test]
    async fn postgres_password_goes_through_stdin() {
        let mut executor = MockPodExecutor::new();
        executor
            .expect_exec()
            .withf(|_, _, _, command, stdin| {
                command[0] == "sh" && stdin.as_deref() == Some("p@ss/w#rd:?")
            })
            .returning(|_, _, _, _, _| Ok(String::new()));
        let shell = Shell::new(&executor, "pulp", "manager");
        shell
            .postgres(&connection("p@ss/w#rd:?"), "pg_restore", &["/backup/pulp.db"])
            .await
            .unwrap();
    }

    #[test]
    fn exec_errors_name_only_the_program() {
        let error = exec_error(
            &["pg_dump".to_string(), "postgresql://pulp:secret@db/pulp".to_string()],
            "connection refused",
        );
        let message = error.to_string();
        assert!(message.starts_with("pg_dump failed"));
        assert!(!message.contains("secret"));
    }

    #[tokio::test]
    async fn shell_round_trips_files() {
        let files = Files::default();
        let executor = fake_filesystem(files.clone(), Default::default());
        let shell = Shell::new(&executor, "pulp", "manager");

        assert!(!shell.exists("-f", "/backup/a.yaml").await.unwrap());
        shell.write("/backup/a.yaml", "kind: Secret\npassword: 'x y'").await.unwrap();
        assert!(shell.exists("-f", "/backup/a.yaml").await.unwrap());
        assert_eq!(
            shell.read("/backup/a.yaml").await.unwrap(),
            "kind: Secret\npassword: 'x y'"
        );
    }

    #[tokio::test]
    async fn wait_gives_up_after_timeout() {
        let settings = Settings {
            poll_interval_secs: 1,
            poll_timeout_secs: 1,
            ..Default::default()
        };
        let result = wait_for(&settings, "nothing", || async { Ok(false) }).await;
        assert!(matches!(result, Err(ControllerError::WaitTimeout { .. })));
    }
}
