//! PodDisruptionBudgets and HorizontalPodAutoscalers for the scalable components.

use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
    MetricSpec, MetricTarget, ResourceMetricSource,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;

use super::pulpcore::component_spec;
use crate::crd::Pulp;
use crate::naming::{self, Component};

/// `<name>-<component>` PDB, or `None` when `pdb` is absent or empty.
/// The selector always matches the component pods, whatever the spec says.
pub fn pdb(pulp: &Pulp, component: Component) -> Option<PodDisruptionBudget> {
    let spec = component_spec(pulp, component).pdb.clone()?;
    if spec == PodDisruptionBudgetSpec::default() {
        return None;
    }
    let labels = naming::component_labels(pulp, component);
    Some(PodDisruptionBudget {
        metadata: naming::child_meta(
            pulp,
            &component.deployment_name(&pulp.name_any()),
            labels.clone(),
        ),
        spec: Some(PodDisruptionBudgetSpec {
            selector: Some(LabelSelector {
                match_labels: Some(labels),
                ..Default::default()
            }),
            ..spec
        }),
        ..Default::default()
    })
}

fn utilization(resource: &str, percentage: i32) -> MetricSpec {
    MetricSpec {
        type_: "Resource".to_string(),
        resource: Some(ResourceMetricSource {
            name: resource.to_string(),
            target: MetricTarget {
                type_: "Utilization".to_string(),
                average_utilization: Some(percentage),
                ..Default::default()
            },
        }),
        ..Default::default()
    }
}

/// `<name>-<component>` HPA, or `None` when autoscaling is disabled.
/// Without explicit targets it scales on 50% CPU.
pub fn hpa(pulp: &Pulp, component: Component) -> Option<HorizontalPodAutoscaler> {
    let hpa = component_spec(pulp, component)
        .hpa
        .as_ref()
        .filter(|h| h.enabled)?;
    let name = component.deployment_name(&pulp.name_any());

    let mut metrics = vec![];
    if let Some(cpu) = hpa.target_cpu_utilization_percentage {
        metrics.push(utilization("cpu", cpu));
    }
    if let Some(memory) = hpa.target_memory_utilization_percentage {
        metrics.push(utilization("memory", memory));
    }
    if metrics.is_empty() {
        metrics.push(utilization("cpu", 50));
    }

    Some(HorizontalPodAutoscaler {
        metadata: naming::child_meta(pulp, &name, naming::component_labels(pulp, component)),
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".to_string()),
                kind: "Deployment".to_string(),
                name,
            },
            min_replicas: Some(hpa.min_replicas.unwrap_or(1)),
            max_replicas: hpa.max_replicas,
            metrics: Some(metrics),
            ..Default::default()
        }),
        ..Default::default()
    })
}
