//! Routes and Ingresses publishing the api and content services.

use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use super::{Resolved, WEB_PORT};
use crate::crd::pulp::non_empty;
use crate::crd::route::{RoutePort, RouteTargetReference, TlsConfig};
use crate::crd::{Pulp, Route, RouteSpec};
use crate::error::ControllerResult;
use crate::naming::{self, Component};

pub const ROUTE_PATHS_SCRIPT: &str = "/usr/bin/route_paths.py";
pub const HAPROXY_TIMEOUT_ANNOTATION: &str = "haproxy.router.openshift.io/timeout";
pub const HAPROXY_REWRITE_ANNOTATION: &str = "haproxy.router.openshift.io/rewrite-target";
pub const NGINX_SNIPPET_ANNOTATION: &str = "nginx.ingress.kubernetes.io/configuration-snippet";
/// `"true"` when the Ingress forwards everything to the web proxy.
pub const WEB_ANNOTATION: &str = "web";

/// One published path, either a default or one reported by the
/// `route_paths.py` helper of a running pulpcore pod.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PluginPath {
    pub name: String,
    pub path: String,
    pub service_name: String,
    /// Named service port, e.g. `api-24817`.
    pub target_port: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite: Option<String>,
}

impl PluginPath {
    fn new(name: String, path: String, component: Component, pulp: &str, port: &str) -> Self {
        Self {
            name,
            path,
            service_name: component.service_name(pulp),
            target_port: port.to_string(),
            rewrite: None,
        }
    }

    fn rewrite(&self) -> Option<&str> {
        self.rewrite.as_deref().filter(|r| !r.is_empty())
    }
}

/// Paths every instance publishes: content, api, login and the root.
pub fn default_paths(pulp: &Pulp) -> Vec<PluginPath> {
    let name = pulp.name_any();
    vec![
        PluginPath::new(
            format!("{}-content", name),
            pulp.content_path_prefix(),
            Component::Content,
            &name,
            "content-24816",
        ),
        PluginPath::new(
            format!("{}-api-v3", name),
            format!("{}api/v3/", pulp.api_root()),
            Component::Api,
            &name,
            "api-24817",
        ),
        PluginPath::new(
            format!("{}-auth", name),
            "/auth/login/".to_string(),
            Component::Api,
            &name,
            "api-24817",
        ),
        PluginPath::new(name.clone(), "/".to_string(), Component::Api, &name, "api-24817"),
    ]
}

/// Parses the JSON array printed by the route helper. Blank output means no
/// plugin publishes extra paths.
pub fn parse_plugin_paths(output: &str) -> ControllerResult<Vec<PluginPath>> {
    if output.trim().is_empty() {
        return Ok(vec![]);
    }
    Ok(serde_json::from_str(output.trim())?)
}

fn all_paths(pulp: &Pulp, resolved: &Resolved) -> Vec<PluginPath> {
    let mut paths = default_paths(pulp);
    paths.extend(resolved.plugin_paths.iter().cloned());
    paths
}

pub fn is_nginx_controller(pulp: &Pulp) -> bool {
    pulp.spec.is_nginx_ingress
        || pulp
            .ingress_class_name()
            .map(|c| c.to_ascii_lowercase().contains("nginx"))
            .unwrap_or(false)
}

/// Selector shared by every Route of an instance.
pub fn route_selector(pulp: &Pulp) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("pulp_cr".to_string(), pulp.name_any()),
        ("owner".to_string(), "pulp-dev".to_string()),
    ])
}

pub fn ingress_labels(pulp: &Pulp) -> BTreeMap<String, String> {
    let mut labels = naming::common_labels(pulp);
    let name = pulp.name_any();
    labels.insert("app.kubernetes.io/name".to_string(), "ingress".to_string());
    labels.insert("app.kubernetes.io/instance".to_string(), format!("ingress-{}", name));
    labels.insert("app.kubernetes.io/component".to_string(), "ingress".to_string());
    labels.insert("owner".to_string(), "pulp-dev".to_string());
    labels
}

fn route(pulp: &Pulp, resolved: &Resolved, plugin: &PluginPath) -> Route {
    let spec = &pulp.spec;
    let mut annotations = BTreeMap::from([(
        HAPROXY_TIMEOUT_ANNOTATION.to_string(),
        non_empty(&spec.haproxy_timeout).unwrap_or("180s").to_string(),
    )]);
    if let Some(rewrite) = plugin.rewrite() {
        annotations.insert(HAPROXY_REWRITE_ANNOTATION.to_string(), rewrite.to_string());
    }
    annotations.extend(spec.route_annotations.clone());

    let mut labels = route_selector(pulp);
    labels.extend(spec.route_labels.clone());

    let mut meta = naming::child_meta(pulp, &plugin.name, labels);
    meta.annotations = Some(annotations);

    let tls = &resolved.route_tls;
    Route {
        metadata: meta,
        spec: RouteSpec {
            host: resolved.route_host.clone(),
            path: Some(plugin.path.clone()),
            to: RouteTargetReference {
                kind: "Service".to_string(),
                name: plugin.service_name.clone(),
                weight: Some(100),
            },
            port: Some(RoutePort {
                target_port: IntOrString::String(plugin.target_port.clone()),
            }),
            tls: Some(TlsConfig {
                termination: "edge".to_string(),
                insecure_edge_termination_policy: Some("Redirect".to_string()),
                certificate: tls.get("certificate").cloned(),
                key: tls.get("key").cloned(),
                ca_certificate: tls.get("caCertificate").cloned(),
            }),
            wildcard_policy: Some("None".to_string()),
        },
    }
}

/// One Route per published path, defaults first.
pub fn routes(pulp: &Pulp, resolved: &Resolved) -> Vec<Route> {
    all_paths(pulp, resolved)
        .iter()
        .map(|p| route(pulp, resolved, p))
        .collect()
}

fn ingress_path(path: &str, service: &str, port: ServiceBackendPort) -> HTTPIngressPath {
    HTTPIngressPath {
        path: Some(path.to_string()),
        path_type: "Prefix".to_string(),
        backend: IngressBackend {
            service: Some(IngressServiceBackend {
                name: service.to_string(),
                port: Some(port),
            }),
            ..Default::default()
        },
    }
}

fn named_port(name: &str) -> ServiceBackendPort {
    ServiceBackendPort {
        name: Some(name.to_string()),
        ..Default::default()
    }
}

fn nginx_annotations(pulp: &Pulp) -> BTreeMap<String, String> {
    let spec = &pulp.spec;
    let or = |value: &Option<String>, default: &str| non_empty(value).unwrap_or(default).to_string();
    BTreeMap::from([
        (
            "nginx.ingress.kubernetes.io/proxy-body-size".to_string(),
            or(&spec.nginx_proxy_body_size, "0"),
        ),
        (
            "nginx.org/client-max-body-size".to_string(),
            or(&spec.nginx_client_max_body_size, "10m"),
        ),
        (
            "nginx.ingress.kubernetes.io/proxy-read-timeout".to_string(),
            or(&spec.nginx_proxy_read_timeout, "120s"),
        ),
        (
            "nginx.ingress.kubernetes.io/proxy-connect-timeout".to_string(),
            or(&spec.nginx_proxy_connect_timeout, "120s"),
        ),
        (
            "nginx.ingress.kubernetes.io/proxy-send-timeout".to_string(),
            or(&spec.nginx_proxy_send_timeout, "120s"),
        ),
    ])
}

/// The `<name>` Ingress. With an nginx controller every path is routed
/// directly and plugin rewrites become a configuration snippet; any other
/// controller sends `/` to the web proxy.
pub fn ingress(pulp: &Pulp, resolved: &Resolved) -> Ingress {
    let name = pulp.name_any();
    let host = pulp.ingress_host().map(str::to_string);
    let mut annotations = BTreeMap::new();
    let mut paths = vec![];

    if is_nginx_controller(pulp) {
        annotations.insert(WEB_ANNOTATION.to_string(), "false".to_string());
        let mut snippets: Vec<String> = vec![];
        for plugin in all_paths(pulp, resolved) {
            match plugin.rewrite() {
                Some(rewrite) => {
                    let line = format!(
                        "rewrite ^{}* {};",
                        plugin.path.trim_end_matches('/'),
                        rewrite
                    );
                    if !snippets.contains(&line) {
                        snippets.push(line);
                    }
                }
                None => paths.push(ingress_path(
                    &plugin.path,
                    &plugin.service_name,
                    named_port(&plugin.target_port),
                )),
            }
        }
        if !snippets.is_empty() {
            annotations.insert(NGINX_SNIPPET_ANNOTATION.to_string(), snippets.join("\n"));
        }
        annotations.extend(nginx_annotations(pulp));
    } else {
        annotations.insert(WEB_ANNOTATION.to_string(), "true".to_string());
        paths.push(ingress_path(
            "/",
            &Component::Web.service_name(&name),
            ServiceBackendPort {
                number: Some(WEB_PORT),
                ..Default::default()
            },
        ));
    }
    annotations.extend(pulp.spec.ingress_annotations.clone());

    let tls = non_empty(&pulp.spec.ingress_tls_secret).map(|secret| {
        vec![IngressTLS {
            hosts: host.clone().map(|h| vec![h]),
            secret_name: Some(secret.to_string()),
        }]
    });

    let mut meta = naming::child_meta(pulp, &name, ingress_labels(pulp));
    meta.annotations = Some(annotations);
    Ingress {
        metadata: meta,
        spec: Some(IngressSpec {
            ingress_class_name: pulp.ingress_class_name().map(str::to_string),
            rules: Some(vec![IngressRule {
                host,
                http: Some(HTTPIngressRuleValue { paths }),
            }]),
            tls,
            ..Default::default()
        }),
        ..Default::default()
    }
}
