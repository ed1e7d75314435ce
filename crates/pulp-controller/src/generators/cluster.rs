//! Objects only created on OpenShift-like clusters.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::ResourceExt;

use super::secrets::string_data;
use crate::crd::Pulp;
use crate::naming;

pub const INJECT_CA_LABEL: &str = "config.openshift.io/inject-trusted-cabundle";
pub const CA_BUNDLE_KEY: &str = "ca-bundle.crt";

/// Placeholder pull secret the cluster's operator tooling fills in.
pub fn pull_secret(pulp: &Pulp) -> Secret {
    Secret {
        metadata: naming::child_meta(
            pulp,
            &naming::pull_secret(&pulp.name_any()),
            naming::common_labels(pulp),
        ),
        data: Some(string_data([("operator", pulp.spec.deployment_type.clone())])),
        ..Default::default()
    }
}

/// Empty ConfigMap the cluster network operator fills with the trusted CA
/// bundle. Created once; the injected data must not be overwritten.
pub fn trusted_ca_configmap(pulp: &Pulp) -> ConfigMap {
    let mut labels = naming::common_labels(pulp);
    labels.insert(INJECT_CA_LABEL.to_string(), "true".to_string());
    ConfigMap {
        metadata: naming::child_meta(pulp, &naming::ca_configmap(&pulp.name_any()), labels),
        data: Some(BTreeMap::new()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::tests::pulp_named;

    #[test]
    fn ca_configmap_requests_injection() {
        let cm = trusted_ca_configmap(&pulp_named("example"));
        assert_eq!(cm.name_any(), "example-user-ca-bundle");
        assert_eq!(cm.labels()[INJECT_CA_LABEL], "true");
        assert_eq!(
            pull_secret(&pulp_named("example")).name_any(),
            "example-redhat-operators-pull-secret"
        );
    }
}
