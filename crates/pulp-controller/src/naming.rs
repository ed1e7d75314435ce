//! Object names, labels and owner references shared by every generator.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{api::ObjectMeta, Resource, ResourceExt};

use crate::crd::Pulp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Component {
    Api,
    Content,
    Worker,
    Web,
    Database,
    Cache,
}

impl Component {
    pub const PULPCORE: [Component; 3] = [Component::Api, Component::Content, Component::Worker];
    pub const SCALABLE: [Component; 4] = [
        Component::Api,
        Component::Content,
        Component::Worker,
        Component::Web,
    ];

    /// Label value and name suffix.
    pub fn label(&self) -> &'static str {
        match self {
            Component::Api => "api",
            Component::Content => "content",
            Component::Worker => "worker",
            Component::Web => "web",
            Component::Database => "database",
            Component::Cache => "cache",
        }
    }

    pub fn deployment_name(&self, pulp: &str) -> String {
        match self {
            Component::Cache => format!("{}-redis", pulp),
            other => format!("{}-{}", pulp, other.label()),
        }
    }

    pub fn service_name(&self, pulp: &str) -> String {
        match self {
            Component::Cache => format!("{}-redis-svc", pulp),
            other => format!("{}-{}-svc", pulp, other.label()),
        }
    }

    /// Condition type suffix, e.g. `API-Ready`.
    pub fn condition_suffix(&self) -> &'static str {
        use crate::crd::conditions::*;
        match self {
            Component::Api => API_READY,
            Component::Content => CONTENT_READY,
            Component::Worker => WORKER_READY,
            Component::Web => WEB_READY,
            Component::Database => DATABASE_READY,
            Component::Cache => "Cache-Ready",
        }
    }

    /// Title used in condition reasons, e.g. `UpdatingApiDeployment`.
    pub fn reason_name(&self) -> &'static str {
        match self {
            Component::Api => "Api",
            Component::Content => "Content",
            Component::Worker => "Worker",
            Component::Web => "Web",
            Component::Database => "Database",
            Component::Cache => "Cache",
        }
    }
}

pub fn server_secret(pulp: &str) -> String {
    format!("{}-server", pulp)
}

pub fn postgres_configuration(pulp: &str) -> String {
    format!("{}-postgres-configuration", pulp)
}

pub fn database_pvc(pulp: &str) -> String {
    format!("{}-postgres", pulp)
}

pub fn file_storage_pvc(pulp: &str) -> String {
    format!("{}-file-storage", pulp)
}

pub fn cache_pvc(pulp: &str) -> String {
    format!("{}-redis-data", pulp)
}

pub fn web_configmap(pulp: &str) -> String {
    format!("{}-configmap", pulp)
}

pub fn ca_configmap(pulp: &str) -> String {
    format!("{}-user-ca-bundle", pulp)
}

pub fn pull_secret(pulp: &str) -> String {
    format!("{}-redhat-operators-pull-secret", pulp)
}

pub fn migration_job_prefix(pulp: &str) -> String {
    format!("{}-pulpcore-migration-", pulp)
}

pub fn reset_admin_job_prefix(pulp: &str) -> String {
    format!("{}-reset-admin-password-", pulp)
}

pub fn update_checksums_job_prefix(pulp: &str) -> String {
    format!("{}-update-content-checksums-", pulp)
}

pub fn signing_job_prefix(pulp: &str) -> String {
    format!("{}-signing-metadata-", pulp)
}

pub fn ee_defaults_configmap(pulp: &Pulp) -> String {
    crate::crd::pulp::non_empty(&pulp.spec.ee_defaults)
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}-ee-default-images", pulp.name_any()))
}

pub fn ee_defaults_cronjob(pulp: &str) -> String {
    format!("{}-ee-defaults", pulp)
}

pub fn otel_configmap(pulp: &str) -> String {
    format!("{}-otel-collector-config", pulp)
}

pub fn otel_service(pulp: &str) -> String {
    format!("{}-otel-collector-svc", pulp)
}

pub const RESTORE_LOCK: &str = "restore-lock";

/// `part-of`, `managed-by` and `pulp_cr`, present on every child.
pub fn common_labels(pulp: &Pulp) -> BTreeMap<String, String> {
    let deployment_type = &pulp.spec.deployment_type;
    BTreeMap::from([
        (
            "app.kubernetes.io/part-of".to_string(),
            deployment_type.clone(),
        ),
        (
            "app.kubernetes.io/managed-by".to_string(),
            format!("{}-operator", deployment_type),
        ),
        ("pulp_cr".to_string(), pulp.name_any()),
    ])
}

pub fn component_labels(pulp: &Pulp, component: Component) -> BTreeMap<String, String> {
    let deployment_type = &pulp.spec.deployment_type;
    let label = component.label();
    let mut labels = common_labels(pulp);
    labels.insert(
        "app.kubernetes.io/name".to_string(),
        format!("{}-{}", deployment_type, label),
    );
    labels.insert(
        "app.kubernetes.io/instance".to_string(),
        format!("{}-{}-{}", deployment_type, label, pulp.name_any()),
    );
    labels.insert("app.kubernetes.io/component".to_string(), label.to_string());
    labels.insert("app".to_string(), format!("pulp-{}", label));
    labels
}

pub fn owner_reference(pulp: &Pulp) -> Option<OwnerReference> {
    pulp.controller_owner_ref(&())
}

/// Metadata for a child of `pulp`.
pub fn child_meta(pulp: &Pulp, name: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: pulp.namespace(),
        labels: Some(labels),
        owner_references: owner_reference(pulp).map(|o| vec![o]),
        ..Default::default()
    }
}

/// Metadata for a generated-name child (jobs).
pub fn generated_meta(pulp: &Pulp, prefix: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        generate_name: Some(prefix.to_string()),
        namespace: pulp.namespace(),
        labels: Some(labels),
        owner_references: owner_reference(pulp).map(|o| vec![o]),
        ..Default::default()
    }
}
