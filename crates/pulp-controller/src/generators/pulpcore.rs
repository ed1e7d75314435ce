//! Pulpcore pods: the api, content and worker Deployments.
//!
//! All three share volumes, init containers and most of the environment. Jobs
//! reuse the same pieces through [`PodLayout`].

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Capabilities as LinuxCapabilities, ConfigMapVolumeSource, Container, ContainerPort,
    EmptyDirVolumeSource, EnvVar, EnvVarSource, ExecAction, HTTPGetAction, KeyToPath,
    PersistentVolumeClaimVolumeSource, PodSecurityContext, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, SeccompProfile, SecretKeySelector, SecretVolumeSource, SecurityContext,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use super::{Resolved, API_PORT, CONTENT_PORT, POSTGRES_PORT, REDIS_PORT};
use crate::crd::{pulp::non_empty, ComponentSpec, Pulp, StorageKind};
use crate::naming::{self, Component};
use crate::signing;

pub const RESTARTED_AT_ANNOTATION: &str = "repo-manager.pulpproject.org/restartedAt";
pub const DEFAULT_CONTAINER_ANNOTATION: &str = "kubectl.kubernetes.io/default-container";
pub const TRUSTED_CA_MOUNT: &str = "/etc/pki/ca-trust/extracted/pem/tls-ca-bundle.pem";

/// Differences between vanilla Kubernetes and OpenShift pod templates.
pub trait PlatformStrategy: Send + Sync {
    fn pod_security_context(&self) -> Option<PodSecurityContext>;

    /// Volume and mount for the injected trusted CA bundle, if supported.
    fn trusted_ca(&self, pulp: &Pulp) -> Option<(Volume, VolumeMount)>;
}

pub struct Vanilla;

impl PlatformStrategy for Vanilla {
    fn pod_security_context(&self) -> Option<PodSecurityContext> {
        Some(PodSecurityContext {
            run_as_user: Some(700),
            fs_group: Some(700),
            ..Default::default()
        })
    }

    fn trusted_ca(&self, _pulp: &Pulp) -> Option<(Volume, VolumeMount)> {
        None
    }
}

pub struct OpenShift;

impl PlatformStrategy for OpenShift {
    // security context constraints assign the uid
    fn pod_security_context(&self) -> Option<PodSecurityContext> {
        None
    }

    fn trusted_ca(&self, pulp: &Pulp) -> Option<(Volume, VolumeMount)> {
        if !pulp.spec.mount_trusted_ca {
            return None;
        }
        let volume = Volume {
            name: "trusted-ca".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: naming::ca_configmap(&pulp.name_any()),
                items: Some(vec![KeyToPath {
                    key: super::cluster::CA_BUNDLE_KEY.to_string(),
                    path: "tls-ca-bundle.pem".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mount = VolumeMount {
            name: "trusted-ca".to_string(),
            mount_path: TRUSTED_CA_MOUNT.to_string(),
            sub_path: Some("tls-ca-bundle.pem".to_string()),
            read_only: Some(true),
            ..Default::default()
        };
        Some((volume, mount))
    }
}

pub fn strategy(resolved: &Resolved) -> Box<dyn PlatformStrategy> {
    if resolved.is_openshift() {
        Box::new(OpenShift)
    } else {
        Box::new(Vanilla)
    }
}

pub fn component_spec(pulp: &Pulp, component: Component) -> &ComponentSpec {
    match component {
        Component::Api => &pulp.spec.api,
        Component::Content => &pulp.spec.content,
        Component::Worker => &pulp.spec.worker,
        _ => &pulp.spec.web,
    }
}

/// Restricted container security context.
pub fn default_security_context() -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        capabilities: Some(LinuxCapabilities {
            drop: Some(vec!["ALL".to_string()]),
            ..Default::default()
        }),
        run_as_non_root: Some(true),
        seccomp_profile: Some(SeccompProfile {
            type_: "RuntimeDefault".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

pub fn env_from_secret(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn secret_volume(name: &str, secret: &str, items: &[(&str, &str)], mode: Option<i32>) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            items: Some(
                items
                    .iter()
                    .map(|(key, path)| KeyToPath {
                        key: key.to_string(),
                        path: path.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            default_mode: mode,
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn claim(name: &str, claim: &str) -> Volume {
    Volume {
        name: name.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str, sub_path: Option<&str>, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        sub_path: sub_path.map(str::to_string),
        read_only: read_only.then_some(true),
        ..Default::default()
    }
}

/// `POSTGRES_SERVICE_*` variables for the managed or external database.
pub fn postgres_env(pulp: &Pulp) -> Vec<EnvVar> {
    match pulp.external_db_secret() {
        None => vec![
            env("POSTGRES_SERVICE_HOST", Component::Database.service_name(&pulp.name_any())),
            env(
                "POSTGRES_SERVICE_PORT",
                pulp.spec
                    .database
                    .postgres_port
                    .unwrap_or(POSTGRES_PORT)
                    .to_string(),
            ),
        ],
        Some(secret) => vec![
            env_from_secret("POSTGRES_SERVICE_HOST", secret, "POSTGRES_HOST"),
            env_from_secret("POSTGRES_SERVICE_PORT", secret, "POSTGRES_PORT"),
        ],
    }
}

pub fn redis_env(pulp: &Pulp) -> Vec<EnvVar> {
    if !pulp.spec.cache.enabled {
        return vec![];
    }
    match pulp.external_cache_secret() {
        None => vec![
            env(
                "REDIS_SERVICE_HOST",
                format!(
                    "{}.{}",
                    Component::Cache.service_name(&pulp.name_any()),
                    pulp.namespace_or_default()
                ),
            ),
            env(
                "REDIS_SERVICE_PORT",
                pulp.spec.cache.redis_port.unwrap_or(REDIS_PORT).to_string(),
            ),
        ],
        Some(secret) => vec![
            env_from_secret("REDIS_SERVICE_HOST", secret, "REDIS_HOST"),
            env_from_secret("REDIS_SERVICE_PORT", secret, "REDIS_PORT"),
            env_from_secret("REDIS_SERVICE_DB", secret, "REDIS_DB"),
            env_from_secret("REDIS_SERVICE_PASSWORD", secret, "REDIS_PASSWORD"),
        ],
    }
}

pub fn signing_env(pulp: &Pulp, resolved: &Resolved) -> Vec<EnvVar> {
    if non_empty(&pulp.spec.signing_secret).is_none() {
        return vec![];
    }
    vec![
        env(
            "PULP_SIGNING_KEY_FINGERPRINT",
            resolved.signing_fingerprint.clone().unwrap_or_default(),
        ),
        env("HOME", "/var/lib/pulp"),
    ]
}

/// Volumes, mounts and init containers shared by pulpcore pods and jobs.
pub struct PodLayout {
    pub volumes: Vec<Volume>,
    pub mounts: Vec<VolumeMount>,
    pub init_mounts: Vec<VolumeMount>,
}

impl PodLayout {
    pub fn new(pulp: &Pulp, resolved: &Resolved, component: Component) -> Self {
        let name = pulp.name_any();
        let server_volume = format!("{}-server", name);
        let db_fields_volume = format!("{}-db-fields-encryption", name);
        let storage = pulp.storage_kind();

        let mut volumes = vec![
            secret_volume(
                &server_volume,
                &naming::server_secret(&name),
                &[("settings.py", "settings.py")],
                None,
            ),
            secret_volume(
                &db_fields_volume,
                &pulp.db_fields_encryption_secret(),
                &[(super::secrets::DB_FIELDS_KEY, super::secrets::DB_FIELDS_KEY)],
                None,
            ),
        ];
        let mut mounts = vec![
            mount(&server_volume, "/etc/pulp/settings.py", Some("settings.py"), true),
            mount(
                &db_fields_volume,
                "/etc/pulp/keys/database_fields.symmetric.key",
                Some("database_fields.symmetric.key"),
                true,
            ),
        ];
        let mut init_mounts = mounts.clone();

        if component == Component::Worker {
            let ansible = format!("{}-ansible-tmp", name);
            volumes.push(empty_dir(&ansible));
            mounts.push(mount(&ansible, "/.ansible/tmp", None, false));
        }
        if component == Component::Api {
            let admin = pulp.admin_password_secret();
            volumes.push(secret_volume(&admin, &admin, &[("password", "admin-password")], None));
            mounts.push(mount(
                &admin,
                "/etc/pulp/pulp-admin-password",
                Some("admin-password"),
                true,
            ));
        }

        match storage {
            StorageKind::StorageClass | StorageKind::Pvc => {
                let claim_name = match storage {
                    StorageKind::Pvc => non_empty(&pulp.spec.pvc).unwrap_or_default().to_string(),
                    _ => naming::file_storage_pvc(&name),
                };
                volumes.push(claim("file-storage", &claim_name));
                let m = mount("file-storage", "/var/lib/pulp", None, false);
                mounts.push(m.clone());
                init_mounts.push(m);
            }
            StorageKind::EmptyDir => {
                volumes.push(empty_dir("tmp-file-storage"));
                let m = mount("tmp-file-storage", "/var/lib/pulp/tmp", None, false);
                mounts.push(m.clone());
                init_mounts.push(m);
                if component == Component::Api {
                    volumes.push(empty_dir("assets-file-storage"));
                    mounts.push(mount("assets-file-storage", "/var/lib/pulp/assets", None, false));
                }
            }
            StorageKind::Azure | StorageKind::S3 => {}
        }

        if let Some(signing_secret) = non_empty(&pulp.spec.signing_secret) {
            if !storage.uses_file_storage() {
                volumes.push(empty_dir("ephemeral-gpg"));
                mounts.push(mount("ephemeral-gpg", "/var/lib/pulp/.gnupg", None, false));
            }
            volumes.push(secret_volume(
                "gpg-keys",
                signing_secret,
                &[(signing::SIGNING_KEY, signing::SIGNING_KEY)],
                None,
            ));
            if let Some(scripts_secret) = non_empty(&pulp.spec.signing_scripts) {
                let scripts_volume = format!("{}-signing-scripts", name);
                let items: Vec<(&str, &str)> = resolved
                    .signing_scripts
                    .iter()
                    .map(|s| (s.as_str(), s.as_str()))
                    .collect();
                volumes.push(secret_volume(&scripts_volume, scripts_secret, &items, Some(0o755)));
                for script in &resolved.signing_scripts {
                    mounts.push(mount(
                        &scripts_volume,
                        &format!("{}/{}", signing::SCRIPTS_DIR, script),
                        Some(script.as_str()),
                        true,
                    ));
                }
            }
        }

        if component == Component::Api {
            let auth_volume = format!("{}-container-auth-certs", name);
            let private = pulp.container_auth_private_key_name();
            let public = pulp.container_auth_public_key_name();
            volumes.push(secret_volume(
                &auth_volume,
                &pulp.container_token_secret(),
                &[(public.as_str(), public.as_str()), (private.as_str(), private.as_str())],
                None,
            ));
            for key in [&private, &public] {
                mounts.push(mount(
                    &auth_volume,
                    &format!("/etc/pulp/keys/{}", key),
                    Some(key.as_str()),
                    true,
                ));
            }
        }

        if let (Some(ca), Some(path)) = (non_empty(&pulp.spec.ldap.ca), &resolved.ldap_ca_file) {
            volumes.push(secret_volume("ldap-cert", ca, &[("ca.crt", "ca.crt")], None));
            mounts.push(mount("ldap-cert", path, Some("ca.crt"), true));
        }

        if let Some((volume, m)) = strategy(resolved).trusted_ca(pulp) {
            volumes.push(volume);
            mounts.push(m);
        }

        Self {
            volumes,
            mounts,
            init_mounts,
        }
    }

    /// `init-container` waiting for the database, plus `gpg-config` when
    /// signing is configured.
    pub fn init_containers(
        &self,
        pulp: &Pulp,
        resolved: &Resolved,
        component: Component,
    ) -> Vec<Container> {
        let spec = component_spec(pulp, component);
        let init = spec.init_container.clone().unwrap_or_default();
        let mut script = String::new();
        if component == Component::Api {
            script.push_str("mkdir -p /var/lib/pulp/{media,assets,tmp}\n");
        }
        script.push_str("/usr/bin/wait_on_postgres.py\n/usr/bin/wait_on_database_migrations.sh");

        let mut env_vars = postgres_env(pulp);
        env_vars.extend(spec.env_vars.iter().cloned());

        let mut containers = vec![Container {
            name: "init-container".to_string(),
            image: Some(
                init.image
                    .filter(|i| !i.is_empty())
                    .unwrap_or_else(|| resolved.images.pulp.clone()),
            ),
            image_pull_policy: pulp.spec.image_pull_policy.clone(),
            env: Some(env_vars),
            command: Some(vec!["/bin/sh".to_string()]),
            args: Some(vec!["-c".to_string(), script]),
            volume_mounts: Some(self.init_mounts.clone()),
            resources: init.resource_requirements,
            security_context: Some(default_security_context()),
            ..Default::default()
        }];

        if non_empty(&pulp.spec.signing_secret).is_some() {
            let mut gpg_mounts = vec![mount(
                "gpg-keys",
                "/etc/pulp/keys/signing_service.gpg",
                Some(signing::SIGNING_KEY),
                true,
            )];
            if pulp.storage_kind().uses_file_storage() {
                gpg_mounts.push(mount("file-storage", "/var/lib/pulp", None, false));
            } else {
                gpg_mounts.push(mount("ephemeral-gpg", "/var/lib/pulp/.gnupg", None, false));
            }
            let small = BTreeMap::from([
                ("cpu".to_string(), Quantity("50m".to_string())),
                ("memory".to_string(), Quantity("128Mi".to_string())),
            ]);
            containers.push(Container {
                name: "gpg-config".to_string(),
                image: Some(resolved.images.pulp.clone()),
                image_pull_policy: pulp.spec.image_pull_policy.clone(),
                env: Some(signing_env(pulp, resolved)),
                command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
                args: Some(vec![
                    "gpg --batch --import /etc/pulp/keys/signing_service.gpg\necho \"${PULP_SIGNING_KEY_FINGERPRINT}:6\" | gpg --import-ownertrust\n"
                        .to_string(),
                ]),
                resources: Some(ResourceRequirements {
                    requests: Some(small.clone()),
                    limits: Some(small),
                    ..Default::default()
                }),
                volume_mounts: Some(gpg_mounts),
                security_context: Some(default_security_context()),
                ..Default::default()
            });
        }
        containers
    }
}

/// Container environment, user supplied variables first.
pub fn container_env(pulp: &Pulp, resolved: &Resolved, component: Component) -> Vec<EnvVar> {
    let spec = component_spec(pulp, component);
    let mut vars = spec.env_vars.clone();
    match component {
        Component::Api | Component::Content => {
            vars.push(env("PULP_GUNICORN_TIMEOUT", spec.gunicorn_timeout().to_string()));
            vars.push(env(
                &format!("PULP_{}_WORKERS", component.label().to_uppercase()),
                spec.gunicorn_workers().to_string(),
            ));
        }
        _ => {}
    }
    vars.extend(postgres_env(pulp));
    vars.extend(redis_env(pulp));
    vars.extend(signing_env(pulp, resolved));
    vars
}

fn exec_probe(command: &[&str], failure_threshold: i32, period: i32) -> Probe {
    Probe {
        exec: Some(ExecAction {
            command: Some(command.iter().map(|s| s.to_string()).collect()),
        }),
        failure_threshold: Some(failure_threshold),
        initial_delay_seconds: Some(3),
        period_seconds: Some(period),
        success_threshold: Some(1),
        timeout_seconds: Some(10),
        ..Default::default()
    }
}

pub fn readiness_probe(pulp: &Pulp, component: Component) -> Option<Probe> {
    if let Some(probe) = &component_spec(pulp, component).readiness_probe {
        return Some(probe.clone());
    }
    match component {
        Component::Api => {
            let path = format!("{}api/v3/status/", pulp.api_root());
            Some(exec_probe(&["/usr/bin/readyz.py", &path], 1, 10))
        }
        Component::Content => {
            let path = pulp.content_path_prefix();
            Some(exec_probe(&["/usr/bin/readyz.py", &path], 1, 10))
        }
        Component::Worker => Some(exec_probe(&["/usr/bin/wait_on_postgres.py"], 1, 10)),
        _ => None,
    }
}

pub fn liveness_probe(pulp: &Pulp, component: Component) -> Option<Probe> {
    if let Some(probe) = &component_spec(pulp, component).liveness_probe {
        return Some(probe.clone());
    }
    match component {
        Component::Api => Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some(format!("{}api/v3/status/", pulp.api_root())),
                port: IntOrString::Int(API_PORT),
                scheme: Some("HTTP".to_string()),
                ..Default::default()
            }),
            failure_threshold: Some(10),
            initial_delay_seconds: Some(3),
            period_seconds: Some(20),
            success_threshold: Some(1),
            timeout_seconds: Some(10),
            ..Default::default()
        }),
        Component::Worker => Some(exec_probe(&["/usr/bin/wait_on_postgres.py"], 10, 20)),
        _ => None,
    }
}

/// Entrypoint. Images without the `pulpcore-*` launchers fall back to gunicorn.
fn command(component: Component, pulp: &Pulp) -> Vec<String> {
    let spec = component_spec(pulp, component);
    let script = match component {
        Component::Api => format!(
            "if which pulpcore-api; then\n  PULP_API_ENTRYPOINT=(\"pulpcore-api\")\nelse\n  PULP_API_ENTRYPOINT=(\"gunicorn\" \"pulpcore.app.wsgi:application\" \"--bind\" \"[::]:{port}\" \"--name\" \"pulp-api\" \"--access-logformat\" \"pulp [%({{correlation-id}}o)s]: %(h)s %(l)s %(u)s %(t)s \\\"%(r)s\\\" %(s)s %(b)s \\\"%(f)s\\\" \\\"%(a)s\\\"\")\nfi\nexec \"${{PULP_API_ENTRYPOINT[@]}}\" \\\n--timeout \"{timeout}\" \\\n--workers \"{workers}\" \\\n--access-logfile -",
            port = API_PORT,
            timeout = spec.gunicorn_timeout(),
            workers = spec.gunicorn_workers(),
        ),
        Component::Content => format!(
            "if which pulpcore-content; then\n  PULP_CONTENT_ENTRYPOINT=(\"pulpcore-content\")\nelse\n  PULP_CONTENT_ENTRYPOINT=(\"gunicorn\" \"pulpcore.content:server\" \"--worker-class\" \"aiohttp.GunicornWebWorker\" \"--name\" \"pulp-content\" \"--bind\" \"[::]:{port}\")\nfi\nexec \"${{PULP_CONTENT_ENTRYPOINT[@]}}\" \\\n--timeout \"{timeout}\" \\\n--workers \"{workers}\" \\\n--access-logfile -",
            port = CONTENT_PORT,
            timeout = spec.gunicorn_timeout(),
            workers = spec.gunicorn_workers(),
        ),
        _ => "exec pulpcore-worker".to_string(),
    };
    vec!["/bin/sh".to_string(), "-c".to_string(), script]
}

/// Pod template shared by the pulpcore Deployment of `component`.
pub fn pod_template(pulp: &Pulp, resolved: &Resolved, component: Component) -> PodTemplateSpec {
    let spec = component_spec(pulp, component);
    let layout = PodLayout::new(pulp, resolved, component);
    let label = component.label();

    let ports = match component {
        Component::Api => Some(vec![ContainerPort {
            container_port: API_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        Component::Content => Some(vec![ContainerPort {
            container_port: CONTENT_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        _ => None,
    };

    let mut annotations = BTreeMap::from([(
        DEFAULT_CONTAINER_ANNOTATION.to_string(),
        label.to_string(),
    )]);
    if let Some(stamp) = &resolved.restart_stamp {
        annotations.insert(RESTARTED_AT_ANNOTATION.to_string(), stamp.clone());
    }

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(naming::component_labels(pulp, component)),
            annotations: Some(annotations),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            affinity: spec.affinity.clone(),
            security_context: strategy(resolved).pod_security_context(),
            node_selector: (!spec.node_selector.is_empty()).then(|| spec.node_selector.clone()),
            tolerations: (!spec.tolerations.is_empty()).then(|| spec.tolerations.clone()),
            topology_spread_constraints: (!spec.topology_spread_constraints.is_empty())
                .then(|| spec.topology_spread_constraints.clone()),
            service_account_name: Some(pulp.name_any()),
            image_pull_secrets: image_pull_secrets(pulp),
            init_containers: Some(layout.init_containers(pulp, resolved, component)),
            containers: vec![Container {
                name: label.to_string(),
                image: Some(resolved.images.pulp.clone()),
                image_pull_policy: pulp.spec.image_pull_policy.clone(),
                command: Some(command(component, pulp)),
                env: Some(container_env(pulp, resolved, component)),
                ports,
                liveness_probe: liveness_probe(pulp, component),
                readiness_probe: readiness_probe(pulp, component),
                resources: spec.resource_requirements.clone(),
                volume_mounts: Some(layout.mounts.clone()),
                security_context: Some(default_security_context()),
                ..Default::default()
            }],
            volumes: Some(layout.volumes),
            restart_policy: Some("Always".to_string()),
            termination_grace_period_seconds: Some(30),
            dns_policy: Some("ClusterFirst".to_string()),
            ..Default::default()
        }),
    }
}

pub fn image_pull_secrets(
    pulp: &Pulp,
) -> Option<Vec<k8s_openapi::api::core::v1::LocalObjectReference>> {
    let secrets = pulp.image_pull_secrets();
    (!secrets.is_empty()).then(|| {
        secrets
            .into_iter()
            .map(|name| k8s_openapi::api::core::v1::LocalObjectReference { name })
            .collect()
    })
}

/// `<name>-api`, `<name>-content` or `<name>-worker`.
pub fn deployment(pulp: &Pulp, resolved: &Resolved, component: Component) -> Deployment {
    let spec = component_spec(pulp, component);
    let labels = naming::component_labels(pulp, component);
    let mut meta = naming::child_meta(pulp, &component.deployment_name(&pulp.name_any()), labels.clone());
    let mut annotations = spec.deployment_annotations.clone();
    annotations.insert("email".to_string(), "pulp-dev@redhat.com".to_string());
    annotations.insert(
        "ignore-check.kube-linter.io/no-node-affinity".to_string(),
        "Do not check node affinity".to_string(),
    );
    meta.annotations = Some(annotations);

    let strategy = spec.strategy.clone().unwrap_or_else(|| DeploymentStrategy {
        type_: Some("RollingUpdate".to_string()),
        ..Default::default()
    });

    Deployment {
        metadata: meta,
        spec: Some(DeploymentSpec {
            // the HPA owns the replica count
            replicas: (!spec.hpa_enabled()).then_some(spec.replicas),
            strategy: Some(strategy),
            selector: LabelSelector {
                match_labels: Some(labels),
                ..Default::default()
            },
            template: pod_template(pulp, resolved, component),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::Capabilities;
    use crate::crd::HpaSpec;
    use crate::generators::tests::resolved;
    use crate::naming::tests::pulp_named;

    fn volume_names(template: &PodTemplateSpec) -> Vec<String> {
        template
            .spec
            .as_ref()
            .unwrap()
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .map(|v| v.name.clone())
            .collect()
    }

    #[test]
    fn api_deployment_basics() {
        let pulp = pulp_named("example");
        let dep = deployment(&pulp, &resolved(), Component::Api);
        assert_eq!(dep.name_any(), "example-api");
        let spec = dep.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.security_context.unwrap().run_as_user, Some(700));
        let container = &pod.containers[0];
        assert_eq!(container.name, "api");
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 24817);
        let env = container.env.as_ref().unwrap();
        assert!(env.iter().any(|e| e.name == "PULP_GUNICORN_TIMEOUT" && e.value.as_deref() == Some("90")));
        assert!(env.iter().any(|e| e.name == "PULP_API_WORKERS" && e.value.as_deref() == Some("2")));
        assert!(env
            .iter()
            .any(|e| e.name == "POSTGRES_SERVICE_HOST" && e.value.as_deref() == Some("example-database-svc")));
        let init = pod.init_containers.unwrap();
        assert_eq!(init.len(), 1);
        assert!(init[0].args.as_ref().unwrap()[1].starts_with("mkdir -p /var/lib/pulp/{media,assets,tmp}"));
    }

    #[test]
    fn openshift_leaves_security_context_to_scc() {
        let pulp = pulp_named("example");
        let mut resolved = resolved();
        resolved.capabilities = Capabilities::openshift();
        let dep = deployment(&pulp, &resolved, Component::Content);
        assert!(dep.spec.unwrap().template.spec.unwrap().security_context.is_none());
    }

    #[test]
    fn user_env_comes_first_and_external_db_uses_secret_refs() {
        let mut pulp = pulp_named("example");
        pulp.spec.worker.env_vars = vec![env("FOO", "bar")];
        pulp.spec.database.external_db_secret = Some("ext-pg".into());
        let vars = container_env(&pulp, &resolved(), Component::Worker);
        assert_eq!(vars[0].name, "FOO");
        let host = vars.iter().find(|e| e.name == "POSTGRES_SERVICE_HOST").unwrap();
        let selector = host.value_from.as_ref().unwrap().secret_key_ref.as_ref().unwrap();
        assert_eq!(selector.name, "ext-pg");
        assert_eq!(selector.key, "POSTGRES_HOST");
        assert!(!vars.iter().any(|e| e.name == "PULP_GUNICORN_TIMEOUT"));
    }

    #[test]
    fn storage_selects_volumes() {
        let mut pulp = pulp_named("example");
        let names = volume_names(&pod_template(&pulp, &resolved(), Component::Api));
        assert!(names.contains(&"tmp-file-storage".to_string()));
        assert!(names.contains(&"assets-file-storage".to_string()));

        pulp.spec.file_storage_storage_class = Some("standard".into());
        let template = pod_template(&pulp, &resolved(), Component::Worker);
        let names = volume_names(&template);
        assert!(names.contains(&"file-storage".to_string()));
        assert!(names.contains(&"example-ansible-tmp".to_string()));
        let volumes = template.spec.unwrap().volumes.unwrap();
        let fs = volumes.iter().find(|v| v.name == "file-storage").unwrap();
        assert_eq!(
            fs.persistent_volume_claim.as_ref().unwrap().claim_name,
            "example-file-storage"
        );

        pulp.spec.file_storage_storage_class = None;
        pulp.spec.object_storage_s3_secret = Some("s3".into());
        let names = volume_names(&pod_template(&pulp, &resolved(), Component::Content));
        assert!(!names.iter().any(|n| n.contains("file-storage")));
    }

    #[test]
    fn hpa_omits_replicas() {
        let mut pulp = pulp_named("example");
        pulp.spec.content.hpa = Some(HpaSpec {
            enabled: true,
            max_replicas: 4,
            ..Default::default()
        });
        let dep = deployment(&pulp, &resolved(), Component::Content);
        assert_eq!(dep.spec.unwrap().replicas, None);
    }

    #[test]
    fn restart_stamp_lands_on_template() {
        let pulp = pulp_named("example");
        let mut resolved = resolved();
        resolved.restart_stamp = Some("2024-01-01T00:00:00Z".into());
        let template = pod_template(&pulp, &resolved, Component::Api);
        let annotations = template.metadata.unwrap().annotations.unwrap();
        assert_eq!(annotations[RESTARTED_AT_ANNOTATION], "2024-01-01T00:00:00Z");
        assert_eq!(annotations[DEFAULT_CONTAINER_ANNOTATION], "api");
    }

    #[test]
    fn signing_adds_gpg_init_container_and_scripts() {
        let mut pulp = pulp_named("example");
        pulp.spec.signing_secret = Some("signing".into());
        pulp.spec.signing_scripts = Some("scripts".into());
        let mut resolved = resolved();
        resolved.signing_fingerprint = Some("ABCD".into());
        resolved.signing_scripts = vec![signing::COLLECTION_SCRIPT.to_string()];
        let pod = pod_template(&pulp, &resolved, Component::Worker).spec.unwrap();
        let init = pod.init_containers.unwrap();
        assert_eq!(init[1].name, "gpg-config");
        let mounts = pod.containers[0].volume_mounts.clone().unwrap();
        assert!(mounts
            .iter()
            .any(|m| m.mount_path == "/var/lib/pulp/scripts/collection_script.sh"));
        let env = pod.containers[0].env.clone().unwrap();
        assert!(env
            .iter()
            .any(|e| e.name == "PULP_SIGNING_KEY_FINGERPRINT" && e.value.as_deref() == Some("ABCD")));
    }
}
