//! Content tracking for Secrets and ConfigMaps consumed by pulpcore pods.
//!
//! The hash of a dependency's data is stored as a label on the dependency
//! itself. A mismatch between the label and the freshly computed hash means
//! the content changed since the operator last acted on it.

use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::ResourceExt;
use pulp_common::hash::hash_data_map;
use tracing::info;

use crate::error::ControllerResult;
use crate::store::{Managed, ObjectStore};

pub const DEPS_HASH_LABEL: &str = "deps-hash";

/// An object whose data map can be hashed.
pub trait Dependency: Managed {
    fn data_hash(&self) -> String;
}

impl Dependency for Secret {
    fn data_hash(&self) -> String {
        let data: BTreeMap<String, &[u8]> = self
            .data
            .iter()
            .flatten()
            .map(|(k, v)| (k.clone(), v.0.as_slice()))
            .collect();
        hash_data_map(&data)
    }
}

impl Dependency for ConfigMap {
    fn data_hash(&self) -> String {
        let mut data: BTreeMap<String, &[u8]> = self
            .data
            .iter()
            .flatten()
            .map(|(k, v)| (k.clone(), v.as_bytes()))
            .collect();
        for (k, v) in self.binary_data.iter().flatten() {
            data.insert(k.clone(), v.0.as_slice());
        }
        hash_data_map(&data)
    }
}

/// Whether the data no longer matches the recorded hash.
pub fn changed<D: Dependency>(dependency: &D) -> bool {
    dependency.labels().get(DEPS_HASH_LABEL) != Some(&dependency.data_hash())
}

/// Record the current data hash on the dependency named `name`.
/// Returns true when the hash moved. A missing dependency counts as unchanged.
pub async fn track<S: ObjectStore, D: Dependency>(
    store: &S,
    namespace: &str,
    name: &str,
) -> ControllerResult<bool> {
    let Some(mut dependency) = store.get::<D>(namespace, name).await? else {
        return Ok(false);
    };
    if !changed(&dependency) {
        return Ok(false);
    }
    let hash = dependency.data_hash();
    info!(kind = %D::kind(&()), %name, %hash, "dependency content changed");
    dependency
        .labels_mut()
        .insert(DEPS_HASH_LABEL.to_string(), hash);
    store.replace(namespace, &dependency).await?;
    Ok(true)
}

/// Timestamp written to `status.last_deployment_update`.
pub fn restart_stamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
