//! Operator-managed PostgreSQL.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, ExecAction, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSecurityContext, PodSpec,
    PodTemplateSpec, Probe, Secret, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use super::pulpcore::{default_security_context, env, env_from_secret};
use super::secrets::{random_password, string_data};
use super::{Resolved, POSTGRES_PORT};
use crate::crd::{pulp::non_empty, Pulp};
use crate::naming::{self, Component};

pub const DEFAULT_DATA_PATH: &str = "/var/lib/postgresql/data/pgdata";
pub const DEFAULT_STORAGE: &str = "8Gi";

/// How the database keeps its data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseStorage {
    StorageClass(String),
    Pvc(String),
    EmptyDir,
}

impl DatabaseStorage {
    pub fn of(pulp: &Pulp) -> Self {
        if let Some(class) = pulp.postgres_storage_class() {
            DatabaseStorage::StorageClass(class.to_string())
        } else if let Some(pvc) = non_empty(&pulp.spec.database.pvc) {
            DatabaseStorage::Pvc(pvc.to_string())
        } else {
            DatabaseStorage::EmptyDir
        }
    }
}

pub fn port(pulp: &Pulp) -> i32 {
    pulp.spec.database.postgres_port.unwrap_or(POSTGRES_PORT)
}

/// `<name>-postgres-configuration`. Holds a generated password, so it is
/// created once and never rewritten.
pub fn configuration_secret(pulp: &Pulp) -> Secret {
    let name = pulp.name_any();
    let deployment_type = pulp.spec.deployment_type.clone();
    let sslmode = non_empty(&pulp.spec.database.postgres_ssl_mode)
        .unwrap_or("prefer")
        .to_string();
    Secret {
        metadata: naming::child_meta(
            pulp,
            &naming::postgres_configuration(&name),
            naming::common_labels(pulp),
        ),
        data: Some(string_data([
            ("password", random_password(32)),
            ("username", deployment_type.clone()),
            ("database", deployment_type),
            ("port", POSTGRES_PORT.to_string()),
            ("host", Component::Database.service_name(&name)),
            ("sslmode", sslmode),
            ("type", "managed".to_string()),
        ])),
        ..Default::default()
    }
}

fn pg_isready(pulp: &Pulp, initial_delay: i32) -> Probe {
    Probe {
        exec: Some(ExecAction {
            command: Some(vec![
                "/bin/sh".to_string(),
                "-i".to_string(),
                "-c".to_string(),
                format!(
                    "pg_isready -U {} -h 127.0.0.1 -p {}",
                    pulp.spec.deployment_type, POSTGRES_PORT
                ),
            ]),
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(10),
        timeout_seconds: Some(5),
        failure_threshold: Some(6),
        success_threshold: Some(1),
        ..Default::default()
    }
}

/// `<name>-database`, a single-replica StatefulSet.
pub fn statefulset(pulp: &Pulp, resolved: &Resolved) -> StatefulSet {
    let db = &pulp.spec.database;
    let name = pulp.name_any();
    let labels = naming::component_labels(pulp, Component::Database);
    let config_secret = naming::postgres_configuration(&name);
    let data_path = non_empty(&db.postgres_data_path).unwrap_or(DEFAULT_DATA_PATH);

    let mut vars: Vec<EnvVar> = [
        ("POSTGRESQL_DATABASE", "database"),
        ("POSTGRESQL_USER", "username"),
        ("POSTGRESQL_PASSWORD", "password"),
        ("POSTGRES_DB", "database"),
        ("POSTGRES_USER", "username"),
        ("POSTGRES_PASSWORD", "password"),
    ]
    .iter()
    .map(|(var, key)| env_from_secret(var, &config_secret, key))
    .collect();
    vars.push(env("PGDATA", data_path));
    vars.push(env(
        "POSTGRES_INITDB_ARGS",
        non_empty(&db.postgres_initdb_args).unwrap_or("--auth-host=scram-sha-256"),
    ));
    vars.push(env(
        "POSTGRES_HOST_AUTH_METHOD",
        non_empty(&db.postgres_host_auth_method).unwrap_or("scram-sha-256"),
    ));

    let volume_name = naming::database_pvc(&name);
    let mut volumes = vec![];
    let mut claim_templates = vec![];
    match DatabaseStorage::of(pulp) {
        DatabaseStorage::StorageClass(class) => {
            let size = non_empty(&db.postgres_storage_requirements).unwrap_or(DEFAULT_STORAGE);
            claim_templates.push(PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(volume_name.clone()),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                    resources: Some(VolumeResourceRequirements {
                        requests: Some(BTreeMap::from([(
                            "storage".to_string(),
                            Quantity(size.to_string()),
                        )])),
                        ..Default::default()
                    }),
                    storage_class_name: Some(class),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
        DatabaseStorage::Pvc(claim) => volumes.push(Volume {
            name: volume_name.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim,
                ..Default::default()
            }),
            ..Default::default()
        }),
        DatabaseStorage::EmptyDir => volumes.push(Volume {
            name: volume_name.clone(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }),
    }

    // mount the parent of PGDATA so initdb can create the directory itself
    let (mount_path, sub_path) = match data_path.rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => {
            let base = parent.rsplit('/').next().unwrap_or(parent);
            (parent.to_string(), Some(base.to_string()))
        }
        _ => (data_path.to_string(), None),
    };

    StatefulSet {
        metadata: naming::child_meta(pulp, &Component::Database.deployment_name(&name), labels.clone()),
        spec: Some(StatefulSetSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            service_name: Component::Database.service_name(&name),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    affinity: db.affinity.clone(),
                    node_selector: (!db.node_selector.is_empty()).then(|| db.node_selector.clone()),
                    tolerations: (!db.tolerations.is_empty()).then(|| db.tolerations.clone()),
                    service_account_name: Some(name.clone()),
                    security_context: Some(PodSecurityContext {
                        run_as_user: Some(999),
                        fs_group: Some(999),
                        ..Default::default()
                    }),
                    containers: vec![Container {
                        name: "postgres".to_string(),
                        image: Some(resolved.images.postgres.clone()),
                        args: (!db.postgres_extra_args.is_empty())
                            .then(|| db.postgres_extra_args.clone()),
                        env: Some(vars),
                        ports: Some(vec![ContainerPort {
                            name: Some("postgres".to_string()),
                            container_port: port(pulp),
                            ..Default::default()
                        }]),
                        liveness_probe: Some(
                            db.liveness_probe.clone().unwrap_or_else(|| pg_isready(pulp, 30)),
                        ),
                        readiness_probe: Some(
                            db.readiness_probe.clone().unwrap_or_else(|| pg_isready(pulp, 5)),
                        ),
                        volume_mounts: Some(vec![VolumeMount {
                            name: volume_name,
                            mount_path,
                            sub_path,
                            ..Default::default()
                        }]),
                        resources: db.postgres_resource_requirements.clone(),
                        security_context: Some(default_security_context()),
                        ..Default::default()
                    }],
                    volumes: (!volumes.is_empty()).then_some(volumes),
                    ..Default::default()
                }),
            },
            volume_claim_templates: (!claim_templates.is_empty()).then_some(claim_templates),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Headless `<name>-database-svc`.
pub fn service(pulp: &Pulp) -> Service {
    let labels = naming::component_labels(pulp, Component::Database);
    Service {
        metadata: naming::child_meta(
            pulp,
            &Component::Database.service_name(&pulp.name_any()),
            labels.clone(),
        ),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                port: port(pulp),
                protocol: Some("TCP".to_string()),
                target_port: Some(IntOrString::Int(port(pulp))),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generators::tests::resolved;
    use crate::naming::tests::pulp_named;

    #[test]
    fn configuration_secret_points_at_managed_service() {
        let secret = configuration_secret(&pulp_named("example"));
        assert_eq!(secret.name_any(), "example-postgres-configuration");
        let data = secret.data.unwrap();
        assert_eq!(data["host"].0, b"example-database-svc");
        assert_eq!(data["username"].0, b"pulp");
        assert_eq!(data["sslmode"].0, b"prefer");
        assert_eq!(data["password"].0.len(), 32);
    }

    #[test]
    fn storage_class_gets_default_claim_template() {
        let mut pulp = pulp_named("example");
        pulp.spec.database.postgres_storage_class = Some("standard".into());
        let sts = statefulset(&pulp, &resolved());
        assert_eq!(sts.name_any(), "example-database");
        let spec = sts.spec.unwrap();
        assert_eq!(spec.service_name, "example-database-svc");
        let claim = &spec.volume_claim_templates.unwrap()[0];
        assert_eq!(claim.metadata.name.as_deref(), Some("example-postgres"));
        let requests = claim.spec.as_ref().unwrap().resources.as_ref().unwrap().requests.clone().unwrap();
        assert_eq!(requests["storage"], Quantity("8Gi".into()));
        assert!(spec.template.spec.unwrap().volumes.is_none());
    }

    #[test]
    fn pgdata_parent_is_mounted() {
        let sts = statefulset(&pulp_named("example"), &resolved());
        let pod = sts.spec.unwrap().template.spec.unwrap();
        let mount = &pod.containers[0].volume_mounts.as_ref().unwrap()[0];
        assert_eq!(mount.mount_path, "/var/lib/postgresql/data");
        assert_eq!(mount.sub_path.as_deref(), Some("data"));
        assert!(pod.volumes.unwrap()[0].empty_dir.is_some());
        let env = pod.containers[0].env.clone().unwrap();
        assert!(env
            .iter()
            .any(|e| e.name == "POSTGRES_INITDB_ARGS" && e.value.as_deref() == Some("--auth-host=scram-sha-256")));
    }

    #[test]
    fn service_is_headless() {
        let svc = service(&pulp_named("example"));
        assert_eq!(svc.name_any(), "example-database-svc");
        assert_eq!(svc.spec.unwrap().cluster_ip.as_deref(), Some("None"));
    }
}
