use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{LocalObjectReference, ServiceAccount};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use kube::ResourceExt;
use regex::Regex;

use crate::crd::Pulp;
use crate::error::ControllerResult;
use crate::naming;

fn labels(pulp: &Pulp, suffix: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            format!("{}-{}", pulp.name_any(), suffix),
        ),
        (
            "app.kubernetes.io/part-of".to_string(),
            pulp.spec.deployment_type.clone(),
        ),
    ])
}

/// Pull secret OpenShift attaches to every service account
/// (`<sa>-dockercfg-xxxxx`). It has to survive updates of the account.
pub fn internal_registry_secret(sa: &ServiceAccount) -> ControllerResult<Option<String>> {
    let pattern = Regex::new(&format!(
        "^{}-dockercfg-[a-z0-9]{{5}}$",
        regex::escape(&sa.name_any())
    ))?;
    Ok(sa
        .image_pull_secrets
        .iter()
        .flatten()
        .map(|s| s.name.clone())
        .find(|name| pattern.is_match(name)))
}

/// `<name>` ServiceAccount used by every pod of the instance.
pub fn service_account(pulp: &Pulp, registry_secret: Option<String>) -> ServiceAccount {
    let mut pull_secrets: Vec<LocalObjectReference> = registry_secret
        .into_iter()
        .map(|name| LocalObjectReference { name })
        .collect();
    pull_secrets.extend(
        pulp.image_pull_secrets()
            .into_iter()
            .map(|name| LocalObjectReference { name }),
    );
    ServiceAccount {
        metadata: naming::child_meta(pulp, &pulp.name_any(), labels(pulp, "sa")),
        image_pull_secrets: (!pull_secrets.is_empty()).then_some(pull_secrets),
        ..Default::default()
    }
}

fn rule(resources: &str, verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![String::new()]),
        resources: Some(vec![resources.to_string()]),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

pub fn role(pulp: &Pulp) -> Role {
    Role {
        metadata: naming::child_meta(pulp, &pulp.name_any(), labels(pulp, "role")),
        rules: Some(vec![
            rule(
                "pods",
                &["get", "list", "watch", "create", "update", "patch", "delete"],
            ),
            rule("pods/log", &["get"]),
            rule("secrets", &["get", "create", "delete"]),
        ]),
    }
}

pub fn role_binding(pulp: &Pulp) -> RoleBinding {
    let name = pulp.name_any();
    RoleBinding {
        metadata: naming::child_meta(pulp, &name, labels(pulp, "rolebinding")),
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: name.clone(),
            namespace: pulp.namespace(),
            ..Default::default()
        }]),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name,
        },
    }
}
