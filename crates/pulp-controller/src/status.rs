//! Readiness of workloads and status subresource updates.

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::crd::conditions::{self, FALSE, FINISHED, TRUE};
use crate::error::ControllerResult;
use crate::naming::Component;
use crate::store::{Managed, ObjectStore};

/// `readyReplicas` has caught up with the desired replica count.
pub fn deployment_ready(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let ready = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    ready == desired
}

pub fn statefulset_ready(statefulset: &StatefulSet) -> bool {
    let desired = statefulset
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let ready = statefulset
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    ready == desired
}

/// Record the readiness of `component` as `<Type>-<Component>-Ready`.
pub fn set_component(
    list: &mut Vec<Condition>,
    deployment_type: &str,
    component: Component,
    ready: bool,
) {
    let type_ = conditions::condition_type(deployment_type, component.condition_suffix());
    let name = component.reason_name();
    if ready {
        conditions::set(
            list,
            &type_,
            TRUE,
            &format!("{}TasksFinished", name),
            &format!("All {} tasks ran successfully", name),
        );
    } else {
        conditions::set(
            list,
            &type_,
            FALSE,
            &format!("Updating{}Deployment", name),
            &format!("{} deployment not ready yet", name),
        );
    }
}

/// Mark `component` as failed to reconcile.
pub fn set_component_error(
    list: &mut Vec<Condition>,
    deployment_type: &str,
    component: Component,
    message: &str,
) {
    let type_ = conditions::condition_type(deployment_type, component.condition_suffix());
    conditions::set(
        list,
        &type_,
        FALSE,
        &format!("ErrorUpdating{}", component.reason_name()),
        message,
    );
}

/// Finished is true exactly when every other condition of the instance is.
/// Returns whether the instance is finished.
pub fn set_finished(list: &mut Vec<Condition>, deployment_type: &str, name: &str) -> bool {
    let finished_type = conditions::condition_type(deployment_type, FINISHED);
    let done = list
        .iter()
        .filter(|c| c.type_ != finished_type)
        .all(|c| c.status == TRUE);
    if done {
        conditions::set(
            list,
            &finished_type,
            TRUE,
            "OperatorFinishedExecution",
            &format!("All tasks ran successfully for {}", name),
        );
    } else {
        conditions::set(
            list,
            &finished_type,
            FALSE,
            "OperatorRunning",
            &format!("{} operator tasks running", name),
        );
    }
    done
}

/// JSON merge patch turning `before` into `after`, or `None` when they are
/// equal. Fields dropped from `after` become `null`.
pub fn diff<T: Serialize>(before: &T, after: &T) -> ControllerResult<Option<Value>> {
    let before = serde_json::to_value(before)?;
    let after = serde_json::to_value(after)?;
    if before == after {
        return Ok(None);
    }
    let (before, after) = match (before, after) {
        (Value::Object(before), Value::Object(after)) => (before, after),
        (_, after) => return Ok(Some(after)),
    };
    let mut patch = Map::new();
    for key in before.keys() {
        if !after.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }
    for (key, value) in after {
        if before.get(&key) != Some(&value) {
            patch.insert(key, value);
        }
    }
    Ok(Some(Value::Object(patch)))
}

/// Patch the status subresource with the difference between `before` and
/// `after`. Returns whether anything was written.
pub async fn update<S: ObjectStore, K: Managed, T: Serialize>(
    store: &S,
    namespace: &str,
    name: &str,
    before: &T,
    after: &T,
) -> ControllerResult<bool> {
    match diff(before, after)? {
        Some(patch) => {
            debug!(kind = %K::kind(&()), name, "updating status");
            store.patch_status::<K>(namespace, name, &patch).await?;
            Ok(true)
        }
        None => Ok(false),
    }
}
