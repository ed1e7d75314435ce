//! In-memory [`ObjectStore`] used by reconcile tests. Every mutating call is
//! recorded so tests can assert on what a reconcile wrote.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use serde_json::Value;

use super::{Managed, ObjectStore};
use crate::drift::merge_patch;
use crate::error::{ControllerError, ControllerResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub verb: &'static str,
    pub kind: String,
    pub name: String,
}

type Key = (String, String, String);

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, Value>,
    mutations: Vec<Mutation>,
    version: u64,
    ingress_domain: Option<String>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

fn kind_of<K: Managed>() -> String {
    K::kind(&()).to_string()
}

fn key<K: Managed>(namespace: &str, name: &str) -> Key {
    (kind_of::<K>(), namespace.to_string(), name.to_string())
}

impl MemoryStore {
    pub fn with_ingress_domain(domain: &str) -> Self {
        let store = Self::default();
        store.inner.lock().unwrap().ingress_domain = Some(domain.to_string());
        store
    }

    /// Seed or overwrite an object without recording a mutation.
    pub fn put<K: Managed>(&self, obj: &K) {
        let mut value = serde_json::to_value(obj).unwrap();
        let namespace = value["metadata"]["namespace"]
            .as_str()
            .unwrap_or("default")
            .to_string();
        let name = value["metadata"]["name"].as_str().unwrap().to_string();
        let mut inner = self.inner.lock().unwrap();
        inner.version += 1;
        value["metadata"]["resourceVersion"] = Value::String(inner.version.to_string());
        inner.objects.insert(key::<K>(&namespace, &name), value);
    }

    pub fn fetch<K: Managed>(&self, namespace: &str, name: &str) -> Option<K> {
        let inner = self.inner.lock().unwrap();
        inner
            .objects
            .get(&key::<K>(namespace, name))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    pub fn all<K: Managed>(&self, namespace: &str) -> Vec<K> {
        let kind = kind_of::<K>();
        let inner = self.inner.lock().unwrap();
        inner
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .map(|(_, v)| serde_json::from_value(v.clone()).unwrap())
            .collect()
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.inner.lock().unwrap().mutations.clone()
    }

    pub fn clear_mutations(&self) {
        self.inner.lock().unwrap().mutations.clear();
    }

    fn record(inner: &mut Inner, verb: &'static str, kind: String, name: &str) {
        inner.mutations.push(Mutation {
            verb,
            kind,
            name: name.to_string(),
        });
    }
}

fn labels_match(value: &Value, labels: &BTreeMap<String, String>) -> bool {
    labels.iter().all(|(k, v)| {
        value
            .pointer("/metadata/labels")
            .and_then(|l| l.get(k))
            .and_then(Value::as_str)
            == Some(v.as_str())
    })
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get<K: Managed>(&self, namespace: &str, name: &str) -> ControllerResult<Option<K>> {
        let inner = self.inner.lock().unwrap();
        match inner.objects.get(&key::<K>(namespace, name)) {
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
            None => Ok(None),
        }
    }

    async fn list<K: Managed>(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> ControllerResult<Vec<K>> {
        let kind = kind_of::<K>();
        let inner = self.inner.lock().unwrap();
        inner
            .objects
            .iter()
            .filter(|((k, ns, _), v)| *k == kind && ns == namespace && labels_match(v, labels))
            .map(|(_, v)| Ok(serde_json::from_value(v.clone())?))
            .collect()
    }

    async fn create<K: Managed>(&self, namespace: &str, obj: &K) -> ControllerResult<K> {
        let mut value = serde_json::to_value(obj)?;
        let mut inner = self.inner.lock().unwrap();
        inner.version += 1;
        let version = inner.version;
        let name = match value["metadata"]["name"].as_str() {
            Some(name) => name.to_string(),
            None => {
                let prefix = value["metadata"]["generateName"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                format!("{}{:05}", prefix, version)
            }
        };
        let k = key::<K>(namespace, &name);
        if inner.objects.contains_key(&k) {
            return Err(ControllerError::AlreadyExists {
                kind: k.0,
                name,
            });
        }
        value["metadata"]["name"] = Value::String(name.clone());
        value["metadata"]["namespace"] = Value::String(namespace.to_string());
        value["metadata"]["resourceVersion"] = Value::String(version.to_string());
        value["metadata"]["uid"] = Value::String(format!("uid-{}", version));
        inner.objects.insert(k.clone(), value.clone());
        Self::record(&mut inner, "create", k.0, &name);
        Ok(serde_json::from_value(value)?)
    }

    async fn replace<K: Managed>(&self, namespace: &str, obj: &K) -> ControllerResult<K> {
        let mut value = serde_json::to_value(obj)?;
        let name = value["metadata"]["name"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let k = key::<K>(namespace, &name);
        let mut inner = self.inner.lock().unwrap();
        let current = inner
            .objects
            .get(&k)
            .cloned()
            .ok_or_else(|| ControllerError::NotFound {
                kind: k.0.clone(),
                name: name.clone(),
            })?;
        let expected_version = value["metadata"]["resourceVersion"].as_str();
        if expected_version.is_some()
            && expected_version != current["metadata"]["resourceVersion"].as_str()
        {
            return Err(ControllerError::Conflict {
                kind: k.0,
                name,
                message: "resourceVersion mismatch".to_string(),
            });
        }
        inner.version += 1;
        value["metadata"]["namespace"] = Value::String(namespace.to_string());
        value["metadata"]["resourceVersion"] = Value::String(inner.version.to_string());
        value["metadata"]["uid"] = current["metadata"]["uid"].clone();
        // status is a subresource
        if let Some(status) = current.get("status") {
            value["status"] = status.clone();
        }
        inner.objects.insert(k.clone(), value.clone());
        Self::record(&mut inner, "replace", k.0, &name);
        Ok(serde_json::from_value(value)?)
    }

    async fn delete<K: Managed>(&self, namespace: &str, name: &str) -> ControllerResult<bool> {
        let k = key::<K>(namespace, name);
        let mut inner = self.inner.lock().unwrap();
        if inner.objects.remove(&k).is_some() {
            Self::record(&mut inner, "delete", k.0, name);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn patch_status<K: Managed>(
        &self,
        namespace: &str,
        name: &str,
        status: &Value,
    ) -> ControllerResult<()> {
        let k = key::<K>(namespace, name);
        let mut inner = self.inner.lock().unwrap();
        inner.version += 1;
        let version = inner.version;
        let obj = inner
            .objects
            .get_mut(&k)
            .ok_or_else(|| ControllerError::NotFound {
                kind: k.0.clone(),
                name: name.to_string(),
            })?;
        if obj.get("status").map(Value::is_null).unwrap_or(true) {
            obj["status"] = Value::Object(Default::default());
        }
        merge_patch(&mut obj["status"], status);
        obj["metadata"]["resourceVersion"] = Value::String(version.to_string());
        Self::record(&mut inner, "status", k.0, name);
        Ok(())
    }

    async fn cluster_ingress_domain(&self) -> ControllerResult<Option<String>> {
        Ok(self.inner.lock().unwrap().ingress_domain.clone())
    }
}
