//! Desired state of every child object.
//!
//! Generators are pure: the same [`Pulp`] and [`Resolved`] always produce the
//! same object. Anything read from the cluster (external secrets, the signing
//! key fingerprint, the route domain) is gathered up front by
//! [`crate::resolve`] and handed in through [`Resolved`].

pub mod cache;
pub mod cluster;
pub mod database;
pub mod exposure;
pub mod galaxy;
pub mod jobs;
pub mod policy;
pub mod pulpcore;
pub mod rbac;
pub mod secrets;
pub mod services;
pub mod settings_py;
pub mod storage;
pub mod web;

use std::collections::BTreeMap;

use kube::ResourceExt;

use crate::capabilities::Capabilities;
use crate::crd::{IngressKind, Pulp};

pub const API_PORT: i32 = 24817;
pub const CONTENT_PORT: i32 = 24816;
pub const WEB_PORT: i32 = 24880;
pub const POSTGRES_PORT: i32 = 5432;
pub const REDIS_PORT: i32 = 6379;

/// Container images in use for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Images {
    pub pulp: String,
    pub web: String,
    pub postgres: String,
    pub redis: String,
}

impl Default for Images {
    fn default() -> Self {
        let defaults = pulp_common::settings::ImageDefaults::default();
        Self {
            pulp: defaults.pulp,
            web: defaults.web,
            postgres: defaults.postgres,
            redis: defaults.redis,
        }
    }
}

/// Connection data for the Postgres database, managed or external.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseConnection {
    pub host: String,
    pub port: String,
    pub user: String,
    pub password: String,
    pub name: String,
    pub sslmode: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheConnection {
    pub host: String,
    pub port: String,
    pub password: String,
    pub db: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectStorage {
    Azure {
        account_name: String,
        account_key: String,
        container: String,
        container_path: String,
        connection_string: String,
    },
    S3 {
        bucket: String,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        endpoint: Option<String>,
        region: Option<String>,
        addressing_style: String,
    },
}

/// Everything a generator needs beyond the `Pulp` resource itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolved {
    pub capabilities: Capabilities,
    pub images: Images,
    pub database: DatabaseConnection,
    /// Set when `cache.enabled`.
    pub cache: Option<CacheConnection>,
    pub object_storage: Option<ObjectStorage>,
    /// Django `SECRET_KEY`.
    pub secret_key: String,
    /// Keycloak settings, empty when SSO is not configured.
    pub sso: BTreeMap<String, String>,
    /// `AUTH_LDAP_*` entries of the LDAP config secret.
    pub ldap: BTreeMap<String, String>,
    /// Mount path of the LDAP CA certificate (`auth_ldap_ca_file`).
    pub ldap_ca_file: Option<String>,
    /// Data of the `custom_pulp_settings` ConfigMap.
    pub custom_settings: BTreeMap<String, String>,
    pub signing_fingerprint: Option<String>,
    /// Script keys present in the `signing_scripts` Secret.
    pub signing_scripts: Vec<String>,
    /// Host used by routes: `route_host` or `<name>.<cluster domain>`.
    pub route_host: Option<String>,
    /// `certificate`, `key` and `caCertificate` of `route_tls_secret`.
    pub route_tls: BTreeMap<String, String>,
    /// Extra paths reported by the route discovery helper.
    pub plugin_paths: Vec<exposure::PluginPath>,
    /// `status.last_deployment_update`, stamped on pulpcore pod templates.
    pub restart_stamp: Option<String>,
}

impl Resolved {
    pub fn is_openshift(&self) -> bool {
        self.capabilities.is_openshift()
    }
}

/// Public URL of the instance.
pub fn root_url(pulp: &Pulp, resolved: &Resolved) -> String {
    match pulp.ingress_kind() {
        IngressKind::Ingress => format!("https://{}", pulp.ingress_host().unwrap_or_default()),
        IngressKind::Route => format!(
            "https://{}",
            resolved.route_host.as_deref().unwrap_or_default()
        ),
        _ => format!(
            "http://{}-web-svc.{}.svc.cluster.local:{}",
            pulp.name_any(),
            pulp.namespace_or_default(),
            WEB_PORT
        ),
    }
}

pub fn token_server(pulp: &Pulp, resolved: &Resolved) -> String {
    match pulp.ingress_kind() {
        IngressKind::Route => format!("{}/token/", root_url(pulp, resolved)),
        IngressKind::Ingress => {
            let proto = if crate::crd::pulp::non_empty(&pulp.spec.ingress_tls_secret).is_some() {
                "https"
            } else {
                "http"
            };
            format!("{}://{}/token/", proto, pulp.ingress_host().unwrap_or_default())
        }
        _ => format!(
            "http://{}-api-svc.{}.svc.cluster.local:{}/token/",
            pulp.name_any(),
            pulp.namespace_or_default(),
            API_PORT
        ),
    }
}

/// Whether the nginx web proxy runs for this exposure choice.
pub fn needs_web(pulp: &Pulp, resolved: &Resolved) -> bool {
    match pulp.ingress_kind() {
        IngressKind::Route => !resolved.capabilities.routes,
        IngressKind::Ingress => !exposure::is_nginx_controller(pulp),
        IngressKind::None | IngressKind::LoadBalancer | IngressKind::NodePort => true,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::naming::tests::pulp_named;

    pub fn resolved() -> Resolved {
        Resolved {
            database: DatabaseConnection {
                host: "example-database-svc".into(),
                port: "5432".into(),
                user: "pulp".into(),
                password: "dbpass".into(),
                name: "pulp".into(),
                sslmode: "prefer".into(),
            },
            secret_key: "django-secret".into(),
            ..Default::default()
        }
    }

    #[test]
    fn token_server_follows_exposure() {
        let mut pulp = pulp_named("example");
        let mut resolved = resolved();
        assert_eq!(
            token_server(&pulp, &resolved),
            "http://example-api-svc.pulp.svc.cluster.local:24817/token/"
        );

        pulp.spec.ingress_type = Some("route".into());
        resolved.route_host = Some("pulp.example.com".into());
        assert_eq!(token_server(&pulp, &resolved), "https://pulp.example.com/token/");

        pulp.spec.ingress_type = Some("ingress".into());
        pulp.spec.ingress_host = Some("pulp.example.org".into());
        assert_eq!(token_server(&pulp, &resolved), "http://pulp.example.org/token/");
        pulp.spec.ingress_tls_secret = Some("tls".into());
        assert_eq!(token_server(&pulp, &resolved), "https://pulp.example.org/token/");
    }

    #[test]
    fn root_url_defaults_to_web_service() {
        let pulp = pulp_named("example");
        assert_eq!(
            root_url(&pulp, &resolved()),
            "http://example-web-svc.pulp.svc.cluster.local:24880"
        );
    }

    #[test]
    fn web_proxy_only_when_nothing_else_serves_traffic() {
        let mut pulp = pulp_named("example");
        let mut resolved = resolved();
        assert!(needs_web(&pulp, &resolved));
        pulp.spec.ingress_type = Some("nodeport".into());
        assert!(needs_web(&pulp, &resolved));

        pulp.spec.ingress_type = Some("route".into());
        resolved.capabilities = Capabilities::openshift();
        assert!(!needs_web(&pulp, &resolved));

        pulp.spec.ingress_type = Some("ingress".into());
        pulp.spec.ingress_class_name = Some("nginx".into());
        assert!(!needs_web(&pulp, &resolved));
        pulp.spec.ingress_class_name = Some("traefik".into());
        assert!(needs_web(&pulp, &resolved));
    }
}
