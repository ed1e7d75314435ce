//! The nginx proxy fronting api and content when no ingress controller does.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction,
    KeyToPath, ObjectFieldSelector, PodSpec, PodTemplateSpec, Probe, Service, ServicePort,
    ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use super::pulpcore::{self, default_security_context};
use super::{Resolved, API_PORT, CONTENT_PORT, WEB_PORT};
use crate::crd::{pulp::non_empty, IngressKind, Pulp};
use crate::naming::{self, Component};

pub const NGINX_PORT: i32 = 8080;
pub const NGINX_CONF: &str = "nginx.conf";

fn or_default<'a>(value: &'a Option<String>, default: &'a str) -> &'a str {
    non_empty(value).unwrap_or(default)
}

fn location(path: &str, upstream: &str) -> String {
    format!(
        r#"        location {path} {{
            proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
            proxy_set_header X-Forwarded-Proto $scheme;
            proxy_set_header Host $http_host;
            proxy_redirect off;
            proxy_pass http://{upstream};
        }}
"#
    )
}

/// Rendered `nginx.conf`.
pub fn nginx_conf(pulp: &Pulp) -> String {
    let name = pulp.name_any();
    let spec = &pulp.spec;
    let read_timeout = or_default(&spec.nginx_proxy_read_timeout, "120s");
    let connect_timeout = or_default(&spec.nginx_proxy_connect_timeout, "120s");
    let send_timeout = or_default(&spec.nginx_proxy_send_timeout, "120s");
    let max_body = or_default(&spec.nginx_client_max_body_size, "10m");

    let mut conf = format!(
        r#"error_log /dev/stdout info;
worker_processes 1;
events {{
    worker_connections 1024;
    accept_mutex off;
}}

http {{
    access_log /dev/stdout;
    include mime.types;
    default_type application/octet-stream;
    sendfile on;
    types_hash_max_size 4096;

    upstream pulp-content {{
        server {content}:{content_port};
    }}

    upstream pulp-api {{
        server {api}:{api_port};
    }}

    server {{
        listen {port} default_server deferred;
        listen [::]:{port} default_server deferred;
        server_name $hostname;

        proxy_read_timeout {read_timeout};
        proxy_connect_timeout {connect_timeout};
        proxy_send_timeout {send_timeout};

        # clients uploading larger files need to chunk them
        client_max_body_size {max_body};

        keepalive_timeout 5;
        root "/opt/app-root/src";

"#,
        content = Component::Content.service_name(&name),
        content_port = CONTENT_PORT,
        api = Component::Api.service_name(&name),
        api_port = API_PORT,
        port = NGINX_PORT,
    );
    conf.push_str(&location(&pulp.content_path_prefix(), "pulp-content"));
    conf.push('\n');
    conf.push_str(&location(&format!("{}api/v3/", pulp.api_root()), "pulp-api"));
    conf.push('\n');
    conf.push_str(&location("/auth/login/", "pulp-api"));
    conf.push('\n');
    conf.push_str("        include /opt/app-root/etc/nginx.default.d/*.conf;\n\n");
    conf.push_str(&location("/", "pulp-api"));
    conf.push_str("    }\n}\n");
    conf
}

/// `<name>-configmap` holding `nginx.conf`.
pub fn configmap(pulp: &Pulp) -> ConfigMap {
    ConfigMap {
        metadata: naming::child_meta(
            pulp,
            &naming::web_configmap(&pulp.name_any()),
            naming::common_labels(pulp),
        ),
        data: Some(BTreeMap::from([(NGINX_CONF.to_string(), nginx_conf(pulp))])),
        ..Default::default()
    }
}

pub fn deployment(pulp: &Pulp, resolved: &Resolved) -> Deployment {
    let spec = &pulp.spec.web;
    let name = pulp.name_any();
    let labels = naming::component_labels(pulp, Component::Web);
    let conf_volume = format!("{}-nginx-conf", name);

    let mut meta = naming::child_meta(pulp, &Component::Web.deployment_name(&name), labels.clone());
    if !spec.deployment_annotations.is_empty() {
        meta.annotations = Some(spec.deployment_annotations.clone());
    }

    let readiness = spec.readiness_probe.clone().unwrap_or_else(|| Probe {
        http_get: Some(HTTPGetAction {
            path: Some(format!("{}api/v3/status/", pulp.api_root())),
            port: IntOrString::Int(NGINX_PORT),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        failure_threshold: Some(2),
        initial_delay_seconds: Some(3),
        period_seconds: Some(10),
        success_threshold: Some(1),
        timeout_seconds: Some(10),
        ..Default::default()
    });

    let mut env = vec![EnvVar {
        name: "NODE_IP".to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: "status.hostIP".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }];
    env.extend(spec.env_vars.iter().cloned());

    Deployment {
        metadata: meta,
        spec: Some(DeploymentSpec {
            replicas: (!spec.hpa_enabled()).then_some(spec.replicas),
            strategy: Some(spec.strategy.clone().unwrap_or_else(|| DeploymentStrategy {
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
                    node_selector: (!spec.node_selector.is_empty())
                        .then(|| spec.node_selector.clone()),
                    tolerations: (!spec.tolerations.is_empty()).then(|| spec.tolerations.clone()),
                    affinity: spec.affinity.clone(),
                    service_account_name: Some(name.clone()),
                    image_pull_secrets: pulpcore::image_pull_secrets(pulp),
                    security_context: pulpcore::strategy(resolved).pod_security_context(),
                    containers: vec![Container {
                        name: "web".to_string(),
                        image: Some(resolved.images.web.clone()),
                        image_pull_policy: pulp.spec.image_pull_policy.clone(),
                        resources: spec.resource_requirements.clone(),
                        env: Some(env),
                        ports: Some(vec![ContainerPort {
                            container_port: NGINX_PORT,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        }]),
                        readiness_probe: Some(readiness),
                        liveness_probe: spec.liveness_probe.clone(),
                        volume_mounts: Some(vec![VolumeMount {
                            name: conf_volume.clone(),
                            mount_path: "/etc/nginx/nginx.conf".to_string(),
                            sub_path: Some(NGINX_CONF.to_string()),
                            read_only: Some(true),
                            ..Default::default()
                        }]),
                        security_context: Some(default_security_context()),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: conf_volume,
                        config_map: Some(ConfigMapVolumeSource {
                            name: naming::web_configmap(&name),
                            items: Some(vec![KeyToPath {
                                key: NGINX_CONF.to_string(),
                                path: NGINX_CONF.to_string(),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// `<name>-web-svc`. The type follows `ingress_type`.
pub fn service(pulp: &Pulp) -> Service {
    let spec = &pulp.spec;
    let labels = naming::component_labels(pulp, Component::Web);
    let https = non_empty(&spec.loadbalancer_protocol)
        .map(|p| p.eq_ignore_ascii_case("https"))
        .unwrap_or(false);

    let kind = pulp.ingress_kind();
    let port = match kind {
        IngressKind::LoadBalancer => ServicePort {
            name: Some(if https { "web-8443" } else { "web-8080" }.to_string()),
            port: spec
                .loadbalancer_port
                .filter(|p| *p != 0)
                .unwrap_or(if https { 443 } else { 80 }),
            protocol: Some("TCP".to_string()),
            target_port: Some(IntOrString::Int(NGINX_PORT)),
            ..Default::default()
        },
        _ => ServicePort {
            name: Some("web-8080".to_string()),
            port: WEB_PORT,
            protocol: Some("TCP".to_string()),
            target_port: Some(IntOrString::Int(NGINX_PORT)),
            node_port: match kind {
                IngressKind::NodePort => spec.nodeport_port.filter(|p| *p > 0),
                _ => None,
            },
            ..Default::default()
        },
    };
    let type_ = match kind {
        IngressKind::LoadBalancer => "LoadBalancer",
        IngressKind::NodePort => "NodePort",
        _ => "ClusterIP",
    };

    let mut svc = Service {
        metadata: naming::child_meta(
            pulp,
            &Component::Web.service_name(&pulp.name_any()),
            labels.clone(),
        ),
        spec: Some(ServiceSpec {
            selector: Some(labels),
            ports: Some(vec![port]),
            type_: Some(type_.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    };
    if !spec.web.service_annotations.is_empty() {
        svc.metadata.annotations = Some(spec.web.service_annotations.clone());
    }
    svc
}
