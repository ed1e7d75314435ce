use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::pulp::non_empty;

/// Request to rehydrate a Pulp instance from a backup directory.
#[derive(CustomResource, Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema, Default)]
#[kube(
    group = "repo-manager.pulpproject.org",
    version = "v1beta2",
    kind = "PulpRestore",
    plural = "pulprestores",
    derive = "PartialEq",
    status = "PulpRestoreStatus",
    namespaced
)]
pub struct PulpRestoreSpec {
    #[serde(default = "default_deployment_type")]
    pub deployment_type: String,
    /// Name of the Pulp resource to restore.
    #[serde(default = "default_deployment_type")]
    pub deployment_name: String,
    /// PulpBackup resource the restore reads its directory from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_pvc: Option<String>,
    /// Directory inside the backup claim. Resolved from the PulpBackup status when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_dir: Option<String>,
    /// Restore with the replica counts recorded in the backup instead of 1 per component.
    #[serde(default)]
    pub keep_replicas: bool,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema, Default)]
pub struct PulpRestoreStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres_secret: Option<String>,
}

fn default_deployment_type() -> String {
    "pulp".to_string()
}

impl PulpRestore {
    pub fn backup_pvc(&self) -> Option<String> {
        non_empty(&self.spec.backup_pvc)
            .map(str::to_string)
            .or_else(|| non_empty(&self.spec.backup_name).map(|b| format!("{}-backup-claim", b)))
    }
}
