use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Affinity, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::pulp::non_empty;

/// Request to snapshot a running Pulp instance into a backup claim.
#[derive(CustomResource, Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema, Default)]
#[kube(
    group = "repo-manager.pulpproject.org",
    version = "v1beta2",
    kind = "PulpBackup",
    plural = "pulpbackups",
    derive = "PartialEq",
    status = "PulpBackupStatus",
    namespaced
)]
pub struct PulpBackupSpec {
    #[serde(default = "default_deployment_type")]
    pub deployment_type: String,
    /// Name of the Pulp resource to back up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_name: Option<String>,
    /// Older spelling of `deployment_name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
    /// Pre-created claim to write the backup to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_pvc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_pvc_namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_storage_requirements: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_storage_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_password_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres_configuration_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct PulpBackupStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_claim: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_storage_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_password_secret: Option<String>,
    #[serde(
        default,
        rename = "databaseConfigurationSecret",
        skip_serializing_if = "Option::is_none"
    )]
    pub database_config_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_fields_encryption_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_token_secret: Option<String>,
}

fn default_deployment_type() -> String {
    "pulp".to_string()
}

impl PulpBackup {
    /// Pulp resource this backup targets.
    pub fn deployment_name(&self) -> String {
        non_empty(&self.spec.deployment_name)
            .or_else(|| non_empty(&self.spec.instance_name))
            .unwrap_or(self.spec.deployment_type.as_str())
            .to_string()
    }
}
