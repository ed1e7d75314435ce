use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

pub const TRUE: &str = "True";
pub const FALSE: &str = "False";
pub const UNKNOWN: &str = "Unknown";

pub const API_READY: &str = "API-Ready";
pub const CONTENT_READY: &str = "Content-Ready";
pub const WORKER_READY: &str = "Worker-Ready";
pub const WEB_READY: &str = "Web-Ready";
pub const DATABASE_READY: &str = "Database-Ready";
pub const ROUTE_READY: &str = "Route-Ready";
pub const INGRESS_READY: &str = "Ingress-Ready";
pub const FINISHED: &str = "Operator-Finished-Execution";

pub const BACKUP_COMPLETE: &str = "BackupComplete";
pub const RESTORE_COMPLETE: &str = "RestoreComplete";

/// `pulp` becomes `Pulp`, `galaxy` becomes `Galaxy`.
pub fn title_case(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
        None => String::new(),
    }
}

/// Fully qualified condition type, e.g. `Pulp-API-Ready`.
pub fn condition_type(deployment_type: &str, suffix: &str) -> String {
    format!("{}-{}", title_case(deployment_type), suffix)
}

pub fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    find(conditions, type_).map(|c| c.status == TRUE).unwrap_or(false)
}

/// Upsert a condition. The transition time only moves when the status flips.
/// Returns whether anything changed.
pub fn set(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status == status && existing.reason == reason && existing.message == message
            {
                return false;
            }
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = Time(Utc::now());
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            true
        }
        None => {
            conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: Time(Utc::now()),
                observed_generation: None,
            });
            true
        }
    }
}

pub fn remove(conditions: &mut Vec<Condition>, type_: &str) -> bool {
    let before = conditions.len();
    conditions.retain(|c| c.type_ != type_);
    before != conditions.len()
}
