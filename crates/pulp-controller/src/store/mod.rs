//! Typed access to cluster objects.
//!
//! Reconcilers only talk to the cluster through [`ObjectStore`] so the whole
//! orchestration can be exercised against an in-memory store in tests.

mod exec;
mod index;
#[cfg(test)]
pub mod memory;

pub use exec::{KubeExecutor, PodExecutor};
#[cfg(test)]
pub use exec::MockPodExecutor;
pub use index::{ObjectKey, ReverseIndex};

use std::{collections::BTreeMap, fmt::Debug};

use async_trait::async_trait;
use kube::{
    api::{
        ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch,
        PatchParams, PostParams,
    },
    core::NamespaceResourceScope,
    Api, Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::ControllerResult;

/// Namespaced API objects the operator reads and writes.
pub trait Managed:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> Managed for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn get<K: Managed>(&self, namespace: &str, name: &str) -> ControllerResult<Option<K>>;

    /// Objects carrying every label in `labels`.
    async fn list<K: Managed>(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> ControllerResult<Vec<K>>;

    async fn create<K: Managed>(&self, namespace: &str, obj: &K) -> ControllerResult<K>;

    /// Full update. A stale `resourceVersion` on `obj` is a conflict.
    async fn replace<K: Managed>(&self, namespace: &str, obj: &K) -> ControllerResult<K>;

    /// Returns false when the object was already gone.
    async fn delete<K: Managed>(&self, namespace: &str, name: &str) -> ControllerResult<bool>;

    /// Merge `status` into the status subresource.
    async fn patch_status<K: Managed>(
        &self,
        namespace: &str,
        name: &str,
        status: &Value,
    ) -> ControllerResult<()>;

    /// Default ingress domain of an OpenShift cluster, if any.
    async fn cluster_ingress_domain(&self) -> ControllerResult<Option<String>>;
}

pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api<K: Managed>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: Managed>(&self, namespace: &str, name: &str) -> ControllerResult<Option<K>> {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn list<K: Managed>(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> ControllerResult<Vec<K>> {
        let params = ListParams::default().labels(&label_selector(labels));
        Ok(self.api::<K>(namespace).list(&params).await?.items)
    }

    async fn create<K: Managed>(&self, namespace: &str, obj: &K) -> ControllerResult<K> {
        debug!(kind = %K::kind(&()), name = %obj.name_any(), "creating");
        Ok(self
            .api::<K>(namespace)
            .create(&PostParams::default(), obj)
            .await?)
    }

    async fn replace<K: Managed>(&self, namespace: &str, obj: &K) -> ControllerResult<K> {
        debug!(kind = %K::kind(&()), name = %obj.name_any(), "replacing");
        Ok(self
            .api::<K>(namespace)
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await?)
    }

    async fn delete<K: Managed>(&self, namespace: &str, name: &str) -> ControllerResult<bool> {
        match self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => {
                debug!(kind = %K::kind(&()), name, "deleted");
                Ok(true)
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_status<K: Managed>(
        &self,
        namespace: &str,
        name: &str,
        status: &Value,
    ) -> ControllerResult<()> {
        let patch = json!({ "status": status });
        self.api::<K>(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn cluster_ingress_domain(&self) -> ControllerResult<Option<String>> {
        let gvk = GroupVersionKind::gvk("config.openshift.io", "v1", "Ingress");
        let resource = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        match api.get_opt("cluster").await? {
            Some(obj) => Ok(obj
                .data
                .pointer("/spec/domain")
                .and_then(Value::as_str)
                .map(str::to_string)),
            None => Ok(None),
        }
    }
}
