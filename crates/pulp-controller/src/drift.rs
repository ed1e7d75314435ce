//! Drift detection between generated and observed objects.

use std::fmt;

use kube::ResourceExt;
use pulp_common::{hash::label_safe, CryptoHash};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::ControllerResult;
use crate::store::{Managed, ObjectStore};

/// Label carrying the hash of the generated object an update was made from.
pub const SPEC_HASH_LABEL: &str = "pulp-operator-hash";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    Updated,
    Unchanged,
}

impl Applied {
    pub fn changed(&self) -> bool {
        !matches!(self, Applied::Unchanged)
    }
}

impl fmt::Display for Applied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Applied::Created => write!(f, "created"),
            Applied::Updated => write!(f, "updated"),
            Applied::Unchanged => write!(f, "unchanged"),
        }
    }
}

fn is_unset(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(m) => m.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Maps whose values are resource quantities.
const QUANTITY_MAPS: [&str; 3] = ["requests", "limits", "capacity"];

const QUANTITY_SUFFIXES: [(&str, f64); 15] = [
    ("Ki", 1024.0),
    ("Mi", 1048576.0),
    ("Gi", 1073741824.0),
    ("Ti", 1099511627776.0),
    ("Pi", 1125899906842624.0),
    ("Ei", 1152921504606846976.0),
    ("n", 1e-9),
    ("u", 1e-6),
    ("m", 1e-3),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
];

/// Numeric value of a quantity such as `500m`, `1.5Gi` or `1e3`.
fn quantity_value(quantity: &str) -> Option<f64> {
    let quantity = quantity.trim();
    let (number, scale) = QUANTITY_SUFFIXES
        .iter()
        .find_map(|(suffix, scale)| quantity.strip_suffix(suffix).map(|n| (n, *scale)))
        .unwrap_or((quantity, 1.0));
    number
        .parse::<f64>()
        .ok()
        .filter(|n| n.is_finite())
        .map(|n| n * scale)
}

/// The API server stores quantities canonicalised, `0.5` comes back as
/// `500m`, so they compare by value.
fn quantities_derivative(expected: &Value, observed: &Value) -> bool {
    let (Value::Object(e), Value::Object(o)) = (expected, observed) else {
        return is_derivative(expected, observed);
    };
    e.iter().all(|(k, ev)| match (ev, o.get(k)) {
        (Value::String(eq), Some(Value::String(oq))) => {
            eq == oq
                || matches!(
                    (quantity_value(eq), quantity_value(oq)),
                    (Some(a), Some(b)) if (a - b).abs() <= 1e-9 * a.abs().max(b.abs())
                )
        }
        (ev, Some(ov)) => is_derivative(ev, ov),
        (ev, None) => is_unset(ev),
    })
}

/// True when every field set in `expected` holds the same value in `observed`.
/// Fields only present in `observed` are ignored.
pub fn is_derivative(expected: &Value, observed: &Value) -> bool {
    if is_unset(expected) {
        return true;
    }
    match (expected, observed) {
        (Value::Object(e), Value::Object(o)) => e.iter().all(|(k, ev)| match o.get(k) {
            Some(ov) if QUANTITY_MAPS.contains(&k.as_str()) => quantities_derivative(ev, ov),
            Some(ov) => is_derivative(ev, ov),
            None => is_unset(ev),
        }),
        (Value::Array(e), Value::Array(o)) => {
            e.len() == o.len() && e.iter().zip(o).all(|(ev, ov)| is_derivative(ev, ov))
        }
        (Value::Number(e), Value::Number(o)) => e.as_f64() == o.as_f64(),
        (e, o) => e == o,
    }
}

/// Overlay `expected` onto `observed`, keeping fields `expected` leaves unset.
/// Arrays of equal length merge elementwise, otherwise `expected` wins.
pub fn merge_expected(observed: &mut Value, expected: &Value) {
    if expected.is_null() {
        return;
    }
    match (observed, expected) {
        (Value::Object(o), Value::Object(e)) => {
            for (k, ev) in e {
                match o.get_mut(k) {
                    Some(ov) => merge_expected(ov, ev),
                    None => {
                        o.insert(k.clone(), ev.clone());
                    }
                }
            }
        }
        (Value::Array(o), Value::Array(e)) if o.len() == e.len() => {
            for (ov, ev) in o.iter_mut().zip(e) {
                merge_expected(ov, ev);
            }
        }
        (o, e) => *o = e.clone(),
    }
}

/// JSON merge patch: objects merge recursively, `null` removes a key.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(p) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Value::Object(t) = target {
                for (k, v) in p {
                    if v.is_null() {
                        t.remove(k);
                    } else {
                        merge_patch(t.entry(k.clone()).or_insert(Value::Null), v);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

fn canonical(value: &Value) -> String {
    match value {
        Value::Object(m) => {
            let mut keys: Vec<&String> = m.keys().collect();
            keys.sort();
            let body = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical(&m[k])))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{}}}", body)
        }
        Value::Array(a) => format!(
            "[{}]",
            a.iter().map(canonical).collect::<Vec<_>>().join(",")
        ),
        other => other.to_string(),
    }
}

/// Hash of a generated object, ignoring its status and any previous hash label.
pub fn object_hash(value: &Value) -> String {
    let mut value = value.clone();
    if let Value::Object(m) = &mut value {
        m.remove("status");
    }
    if let Some(Value::Object(labels)) = value.pointer_mut("/metadata/labels") {
        labels.remove(SPEC_HASH_LABEL);
    }
    label_safe(&canonical(&value).crypto_hash())
}

fn preserve_controller_fields(kind: &str, body: &mut Value, observed: &Value) {
    body["metadata"]["resourceVersion"] = observed["metadata"]["resourceVersion"].clone();
    if kind == "Service" {
        for field in ["clusterIP", "clusterIPs"] {
            let current = &observed["spec"][field];
            if !current.is_null() && body["spec"].get(field).map(is_unset).unwrap_or(true) {
                body["spec"][field] = current.clone();
            }
        }
    }
}

/// Create `expected` when missing, otherwise bring the observed object back in
/// line with it.
pub async fn apply<S: ObjectStore, K: Managed>(
    store: &S,
    namespace: &str,
    expected: K,
) -> ControllerResult<Applied> {
    let kind = K::kind(&()).to_string();
    let name = expected.name_any();
    let mut expected = serde_json::to_value(&expected)?;
    if let Value::Object(m) = &mut expected {
        m.remove("status");
    }
    let hash = object_hash(&expected);
    if !expected["metadata"]["labels"].is_object() {
        expected["metadata"]["labels"] = Value::Object(Map::new());
    }
    expected["metadata"]["labels"][SPEC_HASH_LABEL] = Value::String(hash.clone());

    let Some(observed) = store.get::<K>(namespace, &name).await? else {
        info!(%kind, %name, "creating");
        store
            .create(namespace, &serde_json::from_value::<K>(expected)?)
            .await?;
        return Ok(Applied::Created);
    };
    let observed = serde_json::to_value(&observed)?;
    let previous_hash = observed
        .pointer(&format!("/metadata/labels/{}", SPEC_HASH_LABEL))
        .and_then(Value::as_str);

    let hash_changed = previous_hash != Some(hash.as_str());
    if !hash_changed && is_derivative(&expected, &observed) {
        debug!(%kind, %name, "in sync");
        return Ok(Applied::Unchanged);
    }

    let mut body = if hash_changed {
        let mut body = expected.clone();
        let mut metadata = observed["metadata"].clone();
        merge_expected(&mut metadata, &expected["metadata"]);
        body["metadata"] = metadata;
        body
    } else {
        let mut body = observed.clone();
        merge_expected(&mut body, &expected);
        body
    };
    if let Value::Object(m) = &mut body {
        m.remove("status");
    }
    preserve_controller_fields(&kind, &mut body, &observed);

    info!(%kind, %name, hash_changed, "reconciling drift");
    store
        .replace(namespace, &serde_json::from_value::<K>(body)?)
        .await?;
    Ok(Applied::Updated)
}

/// Create `expected` only when nothing of that name exists. Generated
/// credentials go through here so a later reconcile never rotates them.
pub async fn ensure<S: ObjectStore, K: Managed>(
    store: &S,
    namespace: &str,
    expected: K,
) -> ControllerResult<Applied> {
    let name = expected.name_any();
    if store.get::<K>(namespace, &name).await?.is_some() {
        return Ok(Applied::Unchanged);
    }
    info!(kind = %K::kind(&()), %name, "creating");
    store.create(namespace, &expected).await?;
    Ok(Applied::Created)
}

/// Delete an object if present.
pub async fn remove<S: ObjectStore, K: Managed>(
    store: &S,
    namespace: &str,
    name: &str,
) -> ControllerResult<bool> {
    let deleted = store.delete::<K>(namespace, name).await?;
    if deleted {
        info!(kind = %K::kind(&()), %name, "deleted");
    }
    Ok(deleted)
}
