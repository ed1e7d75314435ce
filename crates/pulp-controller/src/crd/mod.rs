pub mod backup;
pub mod conditions;
pub mod pulp;
pub mod restore;
pub mod route;

pub use backup::{PulpBackup, PulpBackupSpec, PulpBackupStatus};
pub use pulp::{
    CacheSpec, ComponentSpec, DatabaseSpec, HpaSpec, IngressKind, LdapSpec, Pulp, PulpSpec,
    PulpStatus, StorageKind, GROUP,
};
pub use restore::{PulpRestore, PulpRestoreSpec, PulpRestoreStatus};
pub use route::{Route, RouteSpec};

use kube::CustomResourceExt;

use crate::error::ControllerResult;

/// The operator's own CRDs as a multi-document YAML stream.
pub fn crds_yaml() -> ControllerResult<String> {
    let docs = [
        serde_yaml::to_string(&Pulp::crd())?,
        serde_yaml::to_string(&PulpBackup::crd())?,
        serde_yaml::to_string(&PulpRestore::crd())?,
    ];
    Ok(docs
        .iter()
        .map(|d| format!("---\n{}", d))
        .collect::<Vec<_>>()
        .join(""))
}
