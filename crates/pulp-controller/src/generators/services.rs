use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use super::{API_PORT, CONTENT_PORT};
use crate::crd::Pulp;
use crate::naming::{self, Component};

/// ClusterIP service selecting the pods of `component`.
pub fn cluster_service(
    pulp: &Pulp,
    component: Component,
    port_name: &str,
    port: i32,
    target_port: i32,
) -> Service {
    let labels = naming::component_labels(pulp, component);
    Service {
        metadata: naming::child_meta(
            pulp,
            &component.service_name(&pulp.name_any()),
            labels.clone(),
        ),
        spec: Some(ServiceSpec {
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                name: Some(port_name.to_string()),
                port,
                protocol: Some("TCP".to_string()),
                target_port: Some(IntOrString::Int(target_port)),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// `<name>-api-svc` on 24817.
pub fn api(pulp: &Pulp) -> Service {
    cluster_service(pulp, Component::Api, "api-24817", API_PORT, API_PORT)
}

/// `<name>-content-svc` on 24816.
pub fn content(pulp: &Pulp) -> Service {
    cluster_service(pulp, Component::Content, "content-24816", CONTENT_PORT, CONTENT_PORT)
}
