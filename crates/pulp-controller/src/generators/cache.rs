//! Operator-managed Redis.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, ExecAction, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use super::pulpcore::default_security_context;
use super::{Resolved, REDIS_PORT};
use crate::crd::{pulp::non_empty, Pulp};
use crate::naming::{self, Component};

pub const DEFAULT_STORAGE: &str = "1Gi";

pub fn port(pulp: &Pulp) -> i32 {
    pulp.spec.cache.redis_port.unwrap_or(REDIS_PORT)
}

/// Requested storage size; a `storage` request in the resource
/// requirements overrides the default.
fn storage_size(pulp: &Pulp) -> Quantity {
    pulp.spec
        .cache
        .redis_resource_requirements
        .as_ref()
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"))
        .cloned()
        .unwrap_or_else(|| Quantity(DEFAULT_STORAGE.to_string()))
}

/// `<name>-redis-data`, only when a cache storage class is set.
pub fn pvc(pulp: &Pulp) -> Option<PersistentVolumeClaim> {
    let class = pulp.redis_storage_class()?;
    Some(PersistentVolumeClaim {
        metadata: naming::child_meta(
            pulp,
            &naming::cache_pvc(&pulp.name_any()),
            naming::component_labels(pulp, Component::Cache),
        ),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), storage_size(pulp))])),
                ..Default::default()
            }),
            storage_class_name: Some(class.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// `<name>-redis-svc`.
pub fn service(pulp: &Pulp) -> Service {
    let labels = naming::component_labels(pulp, Component::Cache);
    Service {
        metadata: naming::child_meta(
            pulp,
            &Component::Cache.service_name(&pulp.name_any()),
            labels.clone(),
        ),
        spec: Some(ServiceSpec {
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                name: Some("redis-6379".to_string()),
                port: port(pulp),
                protocol: Some("TCP".to_string()),
                target_port: Some(IntOrString::Int(REDIS_PORT)),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn redis_cli_probe() -> Probe {
    Probe {
        exec: Some(ExecAction {
            command: Some(vec![
                "/bin/sh".to_string(),
                "-i".to_string(),
                "-c".to_string(),
                format!("redis-cli -h 127.0.0.1 -p {}", REDIS_PORT),
            ]),
        }),
        initial_delay_seconds: Some(5),
        period_seconds: Some(5),
        timeout_seconds: Some(5),
        failure_threshold: Some(5),
        success_threshold: Some(1),
        ..Default::default()
    }
}

/// Resource requirements without the storage entries, which only size the PVC.
fn container_resources(pulp: &Pulp) -> Option<ResourceRequirements> {
    let mut resources = pulp.spec.cache.redis_resource_requirements.clone()?;
    for list in [&mut resources.requests, &mut resources.limits].into_iter().flatten() {
        list.remove("storage");
    }
    Some(resources)
}

/// `<name>-redis`.
pub fn deployment(pulp: &Pulp, resolved: &Resolved) -> Deployment {
    let cache = &pulp.spec.cache;
    let name = pulp.name_any();
    let labels = naming::component_labels(pulp, Component::Cache);
    let data_volume = naming::cache_pvc(&name);

    let volume = if pulp.redis_storage_class().is_some() {
        Volume {
            name: data_volume.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: naming::cache_pvc(&name),
                ..Default::default()
            }),
            ..Default::default()
        }
    } else if let Some(claim) = non_empty(&cache.pvc) {
        Volume {
            name: data_volume.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    } else {
        Volume {
            name: data_volume.clone(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }
    };

    let mut meta = naming::child_meta(pulp, &Component::Cache.deployment_name(&name), labels.clone());
    meta.annotations = Some(BTreeMap::from([
        ("email".to_string(), "pulp-dev@redhat.com".to_string()),
        (
            "ignore-check.kube-linter.io/unset-cpu-requirements".to_string(),
            "Temporarily disabled".to_string(),
        ),
    ]));

    Deployment {
        metadata: meta,
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            strategy: Some(cache.strategy.clone().unwrap_or_else(|| DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                ..Default::default()
            })),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    affinity: cache.affinity.clone(),
                    node_selector: (!cache.node_selector.is_empty())
                        .then(|| cache.node_selector.clone()),
                    tolerations: (!cache.tolerations.is_empty()).then(|| cache.tolerations.clone()),
                    service_account_name: Some(name.clone()),
                    containers: vec![Container {
                        name: "redis".to_string(),
                        image: Some(resolved.images.redis.clone()),
                        image_pull_policy: pulp.spec.image_pull_policy.clone(),
                        ports: Some(vec![ContainerPort {
                            container_port: REDIS_PORT,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        }]),
                        readiness_probe: Some(
                            cache.readiness_probe.clone().unwrap_or_else(redis_cli_probe),
                        ),
                        liveness_probe: Some(
                            cache.liveness_probe.clone().unwrap_or_else(redis_cli_probe),
                        ),
                        resources: container_resources(pulp),
                        volume_mounts: Some(vec![VolumeMount {
                            name: data_volume,
                            mount_path: "/data".to_string(),
                            ..Default::default()
                        }]),
                        security_context: Some(default_security_context()),
                        ..Default::default()
                    }],
                    volumes: Some(vec![volume]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
