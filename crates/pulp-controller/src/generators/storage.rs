use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;

use crate::crd::{pulp::non_empty, Pulp, StorageKind};
use crate::naming;

/// `<name>-file-storage`, provisioned from `file_storage_storage_class`.
/// Other storage kinds need no operator-owned claim.
pub fn file_storage_pvc(pulp: &Pulp) -> Option<PersistentVolumeClaim> {
    if pulp.storage_kind() != StorageKind::StorageClass {
        return None;
    }
    let spec = &pulp.spec;
    let size = non_empty(&spec.file_storage_size).unwrap_or("10Gi");
    let access_mode = non_empty(&spec.file_storage_access_mode).unwrap_or("ReadWriteMany");
    Some(PersistentVolumeClaim {
        metadata: naming::child_meta(
            pulp,
            &naming::file_storage_pvc(&pulp.name_any()),
            naming::common_labels(pulp),
        ),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![access_mode.to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(size.to_string()),
                )])),
                ..Default::default()
            }),
            storage_class_name: non_empty(&spec.file_storage_storage_class).map(str::to_string),
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::tests::pulp_named;

    #[test]
    fn claim_follows_storage_settings() {
        let mut pulp = pulp_named("example");
        assert!(file_storage_pvc(&pulp).is_none());

        pulp.spec.file_storage_storage_class = Some("standard".into());
        pulp.spec.file_storage_size = Some("2Gi".into());
        pulp.spec.file_storage_access_mode = Some("ReadWriteOnce".into());
        let claim = file_storage_pvc(&pulp).unwrap();
        assert_eq!(claim.name_any(), "example-file-storage");
        let spec = claim.spec.unwrap();
        assert_eq!(spec.access_modes.unwrap(), vec!["ReadWriteOnce".to_string()]);
        assert_eq!(spec.storage_class_name.as_deref(), Some("standard"));
        assert_eq!(spec.resources.unwrap().requests.unwrap()["storage"], Quantity("2Gi".into()));
    }
}
