use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::DeploymentStrategy;
use k8s_openapi::api::core::v1::{
    Affinity, EnvVar, Probe, ResourceRequirements, Toleration, TopologySpreadConstraint,
};
use k8s_openapi::api::policy::v1::PodDisruptionBudgetSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const GROUP: &str = "repo-manager.pulpproject.org";

/// Desired state of a Pulp installation.
#[derive(CustomResource, Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema, Default)]
#[kube(
    group = "repo-manager.pulpproject.org",
    version = "v1beta2",
    kind = "Pulp",
    plural = "pulps",
    derive = "PartialEq",
    derive = "Default",
    status = "PulpStatus",
    namespaced
)]
pub struct PulpSpec {
    /// Stop reconciling this instance.
    #[serde(default)]
    pub unmanaged: bool,

    /// `pulp` or `galaxy`. Cannot change after creation.
    #[serde(default = "default_deployment_type")]
    pub deployment_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_web: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_web_version: Option<String>,
    /// Allow pulpcore and pulp-web images of different versions.
    #[serde(default)]
    pub inhibit_version_constraint: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_storage_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_storage_access_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_storage_storage_class: Option<String>,
    /// Pre-created claim for pulp file storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_storage_azure_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_storage_s3_secret: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_fields_encryption_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_token_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_auth_public_key_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_auth_private_key_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_password_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_secret: Option<String>,
    #[serde(
        default,
        alias = "signing_scripts_configmap",
        skip_serializing_if = "Option::is_none"
    )]
    pub signing_scripts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sso_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulp_secret_key: Option<String>,

    /// One of `none`, `route`, `ingress`, `loadbalancer`, `nodeport`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ingress_annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class_name: Option<String>,
    #[serde(default)]
    pub is_nginx_ingress: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_tls_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_host: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub route_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub route_annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_tls_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodeport_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loadbalancer_protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loadbalancer_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub haproxy_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nginx_client_max_body_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nginx_proxy_body_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nginx_proxy_read_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nginx_proxy_connect_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nginx_proxy_send_timeout: Option<String>,

    #[serde(default)]
    pub api: ComponentSpec,
    #[serde(default)]
    pub content: ComponentSpec,
    #[serde(default)]
    pub worker: ComponentSpec,
    #[serde(default)]
    pub web: ComponentSpec,
    #[serde(default)]
    pub database: DatabaseSpec,
    #[serde(default)]
    pub cache: CacheSpec,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_content_checksums: Vec<String>,
    /// Free-form settings merged into settings.py.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub pulp_settings: Option<serde_json::Value>,
    /// ConfigMap whose keys are appended to settings.py verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_pulp_settings: Option<String>,
    #[serde(default)]
    pub mount_trusted_ca: bool,
    #[serde(default)]
    pub disable_migrations: bool,
    #[serde(default)]
    pub enable_debugging: bool,
    #[serde(default)]
    pub telemetry: TelemetrySpec,
    #[serde(default)]
    pub ldap: LdapSpec,

    #[serde(default)]
    pub deploy_ee_defaults: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ee_defaults: Option<String>,

    /// Deprecated: use `ingress_host`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Deprecated: use `database.external_db_secret`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres_configuration_secret: Option<String>,
    /// Deprecated: use `image_pull_secrets`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secret: Option<String>,
    /// Deprecated: use `cache.redis_storage_class`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_storage_class: Option<String>,
    /// Deprecated: use `database.postgres_storage_class`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres_storage_class: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
pub struct ComponentSpec {
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gunicorn_timeout: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gunicorn_workers: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_requirements: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topology_spread_constraints: Vec<TopologySpreadConstraint>,
    #[serde(
        default,
        alias = "readinessProbe",
        skip_serializing_if = "Option::is_none"
    )]
    pub readiness_probe: Option<Probe>,
    #[serde(
        default,
        alias = "livenessProbe",
        skip_serializing_if = "Option::is_none"
    )]
    pub liveness_probe: Option<Probe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdb: Option<PodDisruptionBudgetSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hpa: Option<HpaSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<DeploymentStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_container: Option<InitContainerSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_vars: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub deployment_annotations: BTreeMap<String, String>,
    /// Web only: extra annotations on `<name>-web-svc`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub service_annotations: BTreeMap<String, String>,
}

impl Default for ComponentSpec {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
            gunicorn_timeout: None,
            gunicorn_workers: None,
            resource_requirements: None,
            affinity: None,
            node_selector: BTreeMap::new(),
            tolerations: vec![],
            topology_spread_constraints: vec![],
            readiness_probe: None,
            liveness_probe: None,
            pdb: None,
            hpa: None,
            strategy: None,
            init_container: None,
            env_vars: vec![],
            deployment_annotations: BTreeMap::new(),
            service_annotations: BTreeMap::new(),
        }
    }
}

impl ComponentSpec {
    pub fn gunicorn_timeout(&self) -> i32 {
        self.gunicorn_timeout.unwrap_or(90)
    }

    pub fn gunicorn_workers(&self) -> i32 {
        self.gunicorn_workers.unwrap_or(2)
    }

    pub fn hpa_enabled(&self) -> bool {
        self.hpa.as_ref().map(|h| h.enabled).unwrap_or(false)
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema, Default)]
pub struct HpaSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,
    #[serde(default = "default_max_replicas")]
    pub max_replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_cpu_utilization_percentage: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_memory_utilization_percentage: Option<i32>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema, Default)]
pub struct InitContainerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_requirements: Option<ResourceRequirements>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema, Default)]
pub struct DatabaseSpec {
    /// Secret with `POSTGRES_*` keys for an externally managed database.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_db_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres_ssl_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres_image: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub postgres_extra_args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres_data_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres_initdb_args: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres_host_auth_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres_resource_requirements: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres_storage_requirements: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres_storage_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc: Option<String>,
    #[serde(
        default,
        alias = "readinessProbe",
        skip_serializing_if = "Option::is_none"
    )]
    pub readiness_probe: Option<Probe>,
    #[serde(
        default,
        alias = "livenessProbe",
        skip_serializing_if = "Option::is_none"
    )]
    pub liveness_probe: Option<Probe>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema, Default)]
pub struct CacheSpec {
    #[serde(default)]
    pub enabled: bool,
    /// Secret with `REDIS_*` keys for an externally managed cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_cache_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_storage_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_resource_requirements: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc: Option<String>,
    #[serde(
        default,
        alias = "readinessProbe",
        skip_serializing_if = "Option::is_none"
    )]
    pub readiness_probe: Option<Probe>,
    #[serde(
        default,
        alias = "livenessProbe",
        skip_serializing_if = "Option::is_none"
    )]
    pub liveness_probe: Option<Probe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<DeploymentStrategy>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema, Default)]
pub struct TelemetrySpec {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema, Default)]
pub struct LdapSpec {
    /// Secret holding `AUTH_LDAP_*` keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    /// Secret holding the LDAP server CA as `ca.crt`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
}

/// Last applied configuration. Each mirrored field is written once and then
/// compared against the spec to detect user-driven changes.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema, Default)]
pub struct PulpStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_storage_azure_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_storage_s3_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_fields_encryption_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_token_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_password_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_cache_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulp_secret_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_type: Option<String>,
    #[serde(default)]
    pub telemetry_enabled: bool,
    #[serde(default)]
    pub managed_cache_enabled: bool,
    /// RFC 3339 timestamp embedded in pulpcore pod templates; bumping it rolls the pods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_deployment_update: Option<String>,
    /// JSON array of the checksums the last update job applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_content_checksums: Option<String>,
}

fn default_deployment_type() -> String {
    "pulp".to_string()
}

fn default_replicas() -> i32 {
    1
}

fn default_max_replicas() -> i32 {
    5
}

fn preserve_unknown_fields(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    serde_json::from_value(serde_json::json!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    }))
    .unwrap_or(schemars::schema::Schema::Bool(true))
}

/// Non-empty value of an optional spec string.
pub(crate) fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

/// How pulp content is stored. At most one mechanism may be configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Azure,
    S3,
    StorageClass,
    Pvc,
    EmptyDir,
}

impl StorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Azure => "azure blob",
            StorageKind::S3 => "s3",
            StorageKind::StorageClass => "StorageClass",
            StorageKind::Pvc => "PVC",
            StorageKind::EmptyDir => "emptyDir",
        }
    }

    pub fn is_object_storage(&self) -> bool {
        matches!(self, StorageKind::Azure | StorageKind::S3)
    }

    pub fn uses_file_storage(&self) -> bool {
        matches!(self, StorageKind::StorageClass | StorageKind::Pvc)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressKind {
    None,
    Route,
    Ingress,
    LoadBalancer,
    NodePort,
}

impl IngressKind {
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.to_ascii_lowercase()).as_deref() {
            Some("route") => IngressKind::Route,
            Some("ingress") => IngressKind::Ingress,
            Some("loadbalancer") => IngressKind::LoadBalancer,
            Some("nodeport") => IngressKind::NodePort,
            _ => IngressKind::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IngressKind::None => "none",
            IngressKind::Route => "route",
            IngressKind::Ingress => "ingress",
            IngressKind::LoadBalancer => "loadbalancer",
            IngressKind::NodePort => "nodeport",
        }
    }
}

impl Pulp {
    pub fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_else(|| "default".to_string())
    }

    pub fn status_or_default(&self) -> PulpStatus {
        self.status.clone().unwrap_or_default()
    }

    pub fn is_galaxy(&self) -> bool {
        self.spec.deployment_type == "galaxy"
    }

    pub fn admin_password_secret(&self) -> String {
        non_empty(&self.spec.admin_password_secret)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}-admin-password", self.name_any()))
    }

    pub fn db_fields_encryption_secret(&self) -> String {
        non_empty(&self.spec.db_fields_encryption_secret)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}-db-fields-encryption", self.name_any()))
    }

    pub fn container_token_secret(&self) -> String {
        non_empty(&self.spec.container_token_secret)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}-container-auth", self.name_any()))
    }

    pub fn pulp_secret_key(&self) -> String {
        non_empty(&self.spec.pulp_secret_key)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}-secret-key", self.name_any()))
    }

    pub fn container_auth_private_key_name(&self) -> String {
        non_empty(&self.spec.container_auth_private_key_name)
            .unwrap_or("container_auth_private_key.pem")
            .to_string()
    }

    pub fn container_auth_public_key_name(&self) -> String {
        non_empty(&self.spec.container_auth_public_key_name)
            .unwrap_or("container_auth_public_key.pem")
            .to_string()
    }

    pub fn ingress_kind(&self) -> IngressKind {
        IngressKind::parse(non_empty(&self.spec.ingress_type))
    }

    pub fn ingress_class_name(&self) -> Option<&str> {
        non_empty(&self.spec.ingress_class_name)
    }

    pub fn ingress_host(&self) -> Option<&str> {
        non_empty(&self.spec.ingress_host).or_else(|| non_empty(&self.spec.hostname))
    }

    pub fn external_db_secret(&self) -> Option<&str> {
        non_empty(&self.spec.database.external_db_secret)
            .or_else(|| non_empty(&self.spec.postgres_configuration_secret))
    }

    pub fn external_cache_secret(&self) -> Option<&str> {
        non_empty(&self.spec.cache.external_cache_secret)
    }

    pub fn image_pull_secrets(&self) -> Vec<String> {
        let mut secrets = self.spec.image_pull_secrets.clone();
        if let Some(legacy) = non_empty(&self.spec.image_pull_secret) {
            if !secrets.iter().any(|s| s == legacy) {
                secrets.push(legacy.to_string());
            }
        }
        secrets
    }

    pub fn redis_storage_class(&self) -> Option<&str> {
        non_empty(&self.spec.cache.redis_storage_class)
            .or_else(|| non_empty(&self.spec.redis_storage_class))
    }

    pub fn postgres_storage_class(&self) -> Option<&str> {
        non_empty(&self.spec.database.postgres_storage_class)
            .or_else(|| non_empty(&self.spec.postgres_storage_class))
    }

    /// Deprecated fields set together with their replacement.
    pub fn deprecated_conflicts(&self) -> Vec<(&'static str, &'static str)> {
        let spec = &self.spec;
        let mut found = vec![];
        if non_empty(&spec.hostname).is_some() && non_empty(&spec.ingress_host).is_some() {
            found.push(("hostname", "ingress_host"));
        }
        if non_empty(&spec.postgres_configuration_secret).is_some()
            && non_empty(&spec.database.external_db_secret).is_some()
        {
            found.push(("postgres_configuration_secret", "database.external_db_secret"));
        }
        if non_empty(&spec.image_pull_secret).is_some() && !spec.image_pull_secrets.is_empty() {
            found.push(("image_pull_secret", "image_pull_secrets"));
        }
        if non_empty(&spec.redis_storage_class).is_some()
            && non_empty(&spec.cache.redis_storage_class).is_some()
        {
            found.push(("redis_storage_class", "cache.redis_storage_class"));
        }
        if non_empty(&spec.postgres_storage_class).is_some()
            && non_empty(&spec.database.postgres_storage_class).is_some()
        {
            found.push(("postgres_storage_class", "database.postgres_storage_class"));
        }
        found
    }

    /// Storage mechanisms configured for pulp content, in precedence order.
    pub fn storage_kinds(&self) -> Vec<StorageKind> {
        let spec = &self.spec;
        let mut kinds = vec![];
        if non_empty(&spec.object_storage_azure_secret).is_some() {
            kinds.push(StorageKind::Azure);
        }
        if non_empty(&spec.object_storage_s3_secret).is_some() {
            kinds.push(StorageKind::S3);
        }
        if non_empty(&spec.file_storage_storage_class).is_some() {
            kinds.push(StorageKind::StorageClass);
        }
        if non_empty(&spec.pvc).is_some() {
            kinds.push(StorageKind::Pvc);
        }
        kinds
    }

    pub fn storage_kind(&self) -> StorageKind {
        self.storage_kinds()
            .first()
            .copied()
            .unwrap_or(StorageKind::EmptyDir)
    }

    pub fn managed_database(&self) -> bool {
        self.external_db_secret().is_none()
    }

    pub fn managed_cache(&self) -> bool {
        self.spec.cache.enabled && self.external_cache_secret().is_none()
    }

    /// Value of a `pulp_settings` key, falling back to the operator defaults.
    pub fn pulp_setting(&self, key: &str) -> Option<String> {
        let settings = self.spec.pulp_settings.as_ref().and_then(|v| v.as_object());
        match settings.and_then(|s| s.get(key)) {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Null) | None => match key {
                "api_root" => Some("/pulp/".to_string()),
                "content_path_prefix" => {
                    let domain = settings
                        .and_then(|s| s.get("domain_enabled"))
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    if domain {
                        Some("/pulp/content/default/".to_string())
                    } else {
                        Some("/pulp/content/".to_string())
                    }
                }
                "galaxy_collection_signing_service" => Some("ansible-default".to_string()),
                "galaxy_container_signing_service" => Some("container-default".to_string()),
                _ => None,
            },
            Some(other) => Some(other.to_string()),
        }
    }

    pub fn api_root(&self) -> String {
        self.pulp_setting("api_root")
            .unwrap_or_else(|| "/pulp/".to_string())
    }

    pub fn content_path_prefix(&self) -> String {
        self.pulp_setting("content_path_prefix")
            .unwrap_or_else(|| "/pulp/content/".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pulp(spec: serde_json::Value) -> Pulp {
        serde_json::from_value(json!({
            "apiVersion": "repo-manager.pulpproject.org/v1beta2",
            "kind": "Pulp",
            "metadata": {"name": "example", "namespace": "pulp"},
            "spec": spec,
        }))
        .unwrap()
    }

    #[test]
    fn spec_defaults_apply_to_a_minimal_resource() {
        let p = pulp(json!({}));
        assert_eq!(p.spec.deployment_type, "pulp");
        assert_eq!(p.spec.api.replicas, 1);
        assert_eq!(p.spec.api.gunicorn_timeout(), 90);
        assert_eq!(p.spec.content.gunicorn_workers(), 2);
        assert_eq!(p.admin_password_secret(), "example-admin-password");
        assert_eq!(p.storage_kind(), StorageKind::EmptyDir);
        assert_eq!(p.ingress_kind(), IngressKind::None);
        assert_eq!(p.api_root(), "/pulp/");
        assert_eq!(p.content_path_prefix(), "/pulp/content/");
    }

    #[test]
    fn domain_enabled_changes_content_prefix() {
        let p = pulp(json!({"pulp_settings": {"domain_enabled": true}}));
        assert_eq!(p.content_path_prefix(), "/pulp/content/default/");
    }

    #[test]
    fn ingress_type_is_case_insensitive() {
        assert_eq!(pulp(json!({"ingress_type": "NodePort"})).ingress_kind(), IngressKind::NodePort);
        assert_eq!(pulp(json!({"ingress_type": "Route"})).ingress_kind(), IngressKind::Route);
    }

    #[test]
    fn multiple_storage_mechanisms_are_all_reported() {
        let p = pulp(json!({"pvc": "claim", "object_storage_s3_secret": "s3"}));
        assert_eq!(p.storage_kinds(), vec![StorageKind::S3, StorageKind::Pvc]);
    }

    #[test]
    fn deprecated_fields_fill_in_when_replacement_is_unset() {
        let p = pulp(json!({"hostname": "old.example.com", "image_pull_secret": "legacy"}));
        assert_eq!(p.ingress_host(), Some("old.example.com"));
        assert_eq!(p.image_pull_secrets(), vec!["legacy".to_string()]);
        assert!(p.deprecated_conflicts().is_empty());

        let p = pulp(json!({"hostname": "old.example.com", "ingress_host": "new.example.com"}));
        assert_eq!(p.ingress_host(), Some("new.example.com"));
        assert_eq!(p.deprecated_conflicts(), vec![("hostname", "ingress_host")]);
    }

    #[test]
    fn external_db_secret_prefers_database_block() {
        let p = pulp(json!({
            "postgres_configuration_secret": "legacy-pg",
            "database": {"external_db_secret": "ext-pg"}
        }));
        assert_eq!(p.external_db_secret(), Some("ext-pg"));
        assert!(!p.managed_database());
    }
}
