//! Gathers the cluster state generators depend on into a [`Resolved`].

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::ResourceExt;
use regex::Regex;
use tracing::{error, warn};

use crate::capabilities::Capabilities;
use crate::crd::{pulp::non_empty, IngressKind, Pulp, StorageKind};
use crate::error::{ControllerError, ControllerResult};
use crate::generators::{
    cache, secrets, CacheConnection, DatabaseConnection, Images, ObjectStorage, Resolved,
};
use crate::naming::{self, Component};
use crate::signing;
use crate::store::ObjectStore;

pub const SSO_REQUIRED: [&str; 7] = [
    "social_auth_keycloak_key",
    "social_auth_keycloak_secret",
    "social_auth_keycloak_public_key",
    "keycloak_host",
    "keycloak_protocol",
    "keycloak_port",
    "keycloak_realm",
];

pub const SSO_OPTIONAL: [&str; 4] = [
    "keycloak_admin_role",
    "keycloak_group_token_claim",
    "keycloak_role_token_claim",
    "keycloak_host_loopback",
];

/// Key of the LDAP config Secret naming the CA mount path.
pub const LDAP_CA_FILE_KEY: &str = "auth_ldap_ca_file";

const ROUTE_TLS_KEYS: [&str; 3] = ["certificate", "key", "caCertificate"];

/// Secret data as strings. A missing Secret is an error.
pub async fn secret_strings<S: ObjectStore>(
    store: &S,
    namespace: &str,
    name: &str,
) -> ControllerResult<BTreeMap<String, String>> {
    let secret = store
        .get::<Secret>(namespace, name)
        .await?
        .ok_or_else(|| ControllerError::MissingSecret(name.to_string()))?;
    let mut data: BTreeMap<String, String> = secret
        .data
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, String::from_utf8_lossy(&v.0).into_owned()))
        .collect();
    data.extend(secret.string_data.unwrap_or_default());
    Ok(data)
}

fn required(data: &BTreeMap<String, String>, secret: &str, key: &str) -> ControllerResult<String> {
    optional(data, key).ok_or_else(|| ControllerError::MissingSecretKey {
        secret: secret.to_string(),
        key: key.to_string(),
    })
}

fn optional(data: &BTreeMap<String, String>, key: &str) -> Option<String> {
    data.get(key).filter(|v| !v.is_empty()).cloned()
}

/// Tag of an image reference, `latest` when none is given.
pub fn image_tag(image: &str) -> &str {
    let name = image.rsplit('/').next().unwrap_or(image);
    match name.split_once('@') {
        Some((_, digest)) => digest,
        None => name.split_once(':').map(|(_, tag)| tag).unwrap_or("latest"),
    }
}

fn image_repository(image: &str) -> &str {
    let tag = image_tag(image);
    image
        .strip_suffix(tag)
        .and_then(|s| s.strip_suffix(':').or_else(|| s.strip_suffix('@')))
        .unwrap_or(image)
}

fn image(repository: &Option<String>, version: &Option<String>, default: String) -> String {
    match (non_empty(repository), non_empty(version)) {
        (Some(repository), Some(version)) => format!("{}:{}", repository, version),
        (Some(repository), None) => repository.to_string(),
        (None, Some(version)) => format!("{}:{}", image_repository(&default), version),
        (None, None) => default,
    }
}

/// Images from the spec, falling back to the operator defaults.
pub fn images(pulp: &Pulp) -> Images {
    let defaults = pulp_common::settings::get_config()
        .map(|c| c.images.clone())
        .unwrap_or_default();
    let spec = &pulp.spec;
    Images {
        pulp: image(&spec.image, &spec.image_version, defaults.pulp()),
        web: image(&spec.image_web, &spec.image_web_version, defaults.web()),
        postgres: non_empty(&spec.database.postgres_image)
            .map(str::to_string)
            .unwrap_or_else(|| defaults.postgres()),
        redis: non_empty(&spec.cache.redis_image)
            .map(str::to_string)
            .unwrap_or_else(|| defaults.redis()),
    }
}

pub async fn database<S: ObjectStore>(store: &S, pulp: &Pulp) -> ControllerResult<DatabaseConnection> {
    let namespace = pulp.namespace_or_default();
    match pulp.external_db_secret() {
        Some(secret) => {
            let data = secret_strings(store, &namespace, secret).await?;
            Ok(DatabaseConnection {
                host: required(&data, secret, "POSTGRES_HOST")?,
                port: required(&data, secret, "POSTGRES_PORT")?,
                user: required(&data, secret, "POSTGRES_USERNAME")?,
                password: required(&data, secret, "POSTGRES_PASSWORD")?,
                name: required(&data, secret, "POSTGRES_DB_NAME")?,
                sslmode: optional(&data, "POSTGRES_SSLMODE").unwrap_or_else(|| "prefer".to_string()),
            })
        }
        None => {
            let secret = naming::postgres_configuration(&pulp.name_any());
            let data = secret_strings(store, &namespace, &secret).await?;
            Ok(DatabaseConnection {
                host: required(&data, &secret, "host")?,
                port: required(&data, &secret, "port")?,
                user: required(&data, &secret, "username")?,
                password: required(&data, &secret, "password")?,
                name: required(&data, &secret, "database")?,
                sslmode: optional(&data, "sslmode").unwrap_or_else(|| "prefer".to_string()),
            })
        }
    }
}

pub async fn cache<S: ObjectStore>(store: &S, pulp: &Pulp) -> ControllerResult<Option<CacheConnection>> {
    if !pulp.spec.cache.enabled {
        return Ok(None);
    }
    let namespace = pulp.namespace_or_default();
    let connection = match pulp.external_cache_secret() {
        Some(secret) => {
            let data = secret_strings(store, &namespace, secret).await?;
            CacheConnection {
                host: required(&data, secret, "REDIS_HOST")?,
                port: required(&data, secret, "REDIS_PORT")?,
                password: optional(&data, "REDIS_PASSWORD").unwrap_or_default(),
                db: optional(&data, "REDIS_DB").unwrap_or_default(),
            }
        }
        None => CacheConnection {
            host: format!(
                "{}.{}",
                Component::Cache.service_name(&pulp.name_any()),
                namespace
            ),
            port: cache::port(pulp).to_string(),
            ..Default::default()
        },
    };
    Ok(Some(connection))
}

pub async fn object_storage<S: ObjectStore>(
    store: &S,
    pulp: &Pulp,
) -> ControllerResult<Option<ObjectStorage>> {
    let namespace = pulp.namespace_or_default();
    match pulp.storage_kind() {
        StorageKind::Azure => {
            let secret = non_empty(&pulp.spec.object_storage_azure_secret).unwrap_or_default();
            let data = secret_strings(store, &namespace, secret).await?;
            Ok(Some(ObjectStorage::Azure {
                account_name: required(&data, secret, "azure-account-name")?,
                account_key: required(&data, secret, "azure-account-key")?,
                container: required(&data, secret, "azure-container")?,
                container_path: required(&data, secret, "azure-container-path")?,
                connection_string: required(&data, secret, "azure-connection-string")?,
            }))
        }
        StorageKind::S3 => {
            let secret = non_empty(&pulp.spec.object_storage_s3_secret).unwrap_or_default();
            let data = secret_strings(store, &namespace, secret).await?;
            let endpoint = optional(&data, "s3-endpoint");
            let region = optional(&data, "s3-region");
            if endpoint.is_none() && region.is_none() {
                return Err(ControllerError::MissingSecretKey {
                    secret: secret.to_string(),
                    key: "s3-endpoint or s3-region".to_string(),
                });
            }
            Ok(Some(ObjectStorage::S3 {
                bucket: required(&data, secret, "s3-bucket-name")?,
                access_key_id: optional(&data, "s3-access-key-id"),
                secret_access_key: optional(&data, "s3-secret-access-key"),
                endpoint,
                region,
                addressing_style: optional(&data, "s3-addressing-style")
                    .unwrap_or_else(|| "path".to_string()),
            }))
        }
        _ => Ok(None),
    }
}

/// Keycloak settings. The whole section is skipped when a required key is
/// missing.
pub async fn sso<S: ObjectStore>(store: &S, pulp: &Pulp) -> ControllerResult<BTreeMap<String, String>> {
    let Some(secret) = non_empty(&pulp.spec.sso_secret) else {
        return Ok(BTreeMap::new());
    };
    let data = secret_strings(store, &pulp.namespace_or_default(), secret).await?;
    let missing: Vec<&str> = SSO_REQUIRED
        .iter()
        .copied()
        .filter(|k| optional(&data, k).is_none())
        .collect();
    if !missing.is_empty() {
        error!(secret, ?missing, "SSO secret is incomplete, skipping keycloak settings");
        return Ok(BTreeMap::new());
    }
    Ok(SSO_REQUIRED
        .iter()
        .chain(SSO_OPTIONAL.iter())
        .filter_map(|k| optional(&data, k).map(|v| (k.to_string(), v)))
        .collect())
}

/// `AUTH_LDAP_*` entries of the LDAP config Secret and the CA mount path.
pub async fn ldap<S: ObjectStore>(
    store: &S,
    pulp: &Pulp,
) -> ControllerResult<(BTreeMap<String, String>, Option<String>)> {
    let Some(secret) = non_empty(&pulp.spec.ldap.config) else {
        return Ok((BTreeMap::new(), None));
    };
    let data = secret_strings(store, &pulp.namespace_or_default(), secret).await?;
    let ca_file = optional(&data, LDAP_CA_FILE_KEY);
    Ok((filter_ldap(secret, data)?, ca_file))
}

fn filter_ldap(
    secret: &str,
    data: BTreeMap<String, String>,
) -> ControllerResult<BTreeMap<String, String>> {
    let pattern = Regex::new("(?i)^AUTH_LDAP_.*$")?;
    Ok(data
        .into_iter()
        .filter(|(key, _)| {
            let valid = pattern.is_match(key);
            if !valid {
                warn!(secret, %key, "ignoring invalid LDAP key");
            }
            valid
        })
        .collect())
}

pub async fn custom_settings<S: ObjectStore>(
    store: &S,
    pulp: &Pulp,
) -> ControllerResult<BTreeMap<String, String>> {
    let Some(name) = non_empty(&pulp.spec.custom_pulp_settings) else {
        return Ok(BTreeMap::new());
    };
    let cm = store
        .get::<ConfigMap>(&pulp.namespace_or_default(), name)
        .await?
        .ok_or_else(|| ControllerError::NotFound {
            kind: "ConfigMap".to_string(),
            name: name.to_string(),
        })?;
    Ok(cm.data.unwrap_or_default())
}

/// Fingerprint of the signing key and the scripts present.
pub async fn signing<S: ObjectStore>(
    store: &S,
    pulp: &Pulp,
) -> ControllerResult<(Option<String>, Vec<String>)> {
    let namespace = pulp.namespace_or_default();
    let fingerprint = match non_empty(&pulp.spec.signing_secret) {
        Some(secret) => {
            let data = secret_strings(store, &namespace, secret).await?;
            let key = required(&data, secret, signing::SIGNING_KEY)?;
            Some(signing::fingerprint(&key)?)
        }
        None => None,
    };
    let scripts = match non_empty(&pulp.spec.signing_scripts) {
        Some(secret) => {
            let data = secret_strings(store, &namespace, secret).await?;
            [signing::COLLECTION_SCRIPT, signing::CONTAINER_SCRIPT]
                .into_iter()
                .filter(|k| data.contains_key(*k))
                .map(str::to_string)
                .collect()
        }
        None => vec![],
    };
    Ok((fingerprint, scripts))
}

pub async fn secret_key<S: ObjectStore>(store: &S, pulp: &Pulp) -> ControllerResult<String> {
    let secret = pulp.pulp_secret_key();
    let data = secret_strings(store, &pulp.namespace_or_default(), &secret).await?;
    required(&data, &secret, secrets::SECRET_KEY_KEY)
}

/// `route_host`, else `<name>.<cluster ingress domain>`.
pub async fn route_host<S: ObjectStore>(store: &S, pulp: &Pulp) -> ControllerResult<Option<String>> {
    if pulp.ingress_kind() != IngressKind::Route {
        return Ok(None);
    }
    if let Some(host) = non_empty(&pulp.spec.route_host) {
        return Ok(Some(host.to_string()));
    }
    Ok(store
        .cluster_ingress_domain()
        .await?
        .map(|domain| format!("{}.{}", pulp.name_any(), domain)))
}

pub async fn route_tls<S: ObjectStore>(store: &S, pulp: &Pulp) -> ControllerResult<BTreeMap<String, String>> {
    let Some(secret) = non_empty(&pulp.spec.route_tls_secret) else {
        return Ok(BTreeMap::new());
    };
    let data = secret_strings(store, &pulp.namespace_or_default(), secret).await?;
    Ok(ROUTE_TLS_KEYS
        .iter()
        .filter_map(|k| optional(&data, k).map(|v| (k.to_string(), v)))
        .collect())
}

/// Everything the generators read from the cluster. Plugin paths are filled
/// in later by the exposure step since they need a running pod.
pub async fn resolve<S: ObjectStore>(
    store: &S,
    pulp: &Pulp,
    capabilities: Capabilities,
) -> ControllerResult<Resolved> {
    let (ldap, ldap_ca_file) = ldap(store, pulp).await?;
    let (signing_fingerprint, signing_scripts) = signing(store, pulp).await?;
    Ok(Resolved {
        capabilities,
        images: images(pulp),
        database: database(store, pulp).await?,
        cache: cache(store, pulp).await?,
        object_storage: object_storage(store, pulp).await?,
        secret_key: secret_key(store, pulp).await?,
        sso: sso(store, pulp).await?,
        ldap,
        ldap_ca_file,
        custom_settings: custom_settings(store, pulp).await?,
        signing_fingerprint,
        signing_scripts,
        route_host: route_host(store, pulp).await?,
        route_tls: route_tls(store, pulp).await?,
        plugin_paths: vec![],
        restart_stamp: pulp.status_or_default().last_deployment_update,
    })
}

/// Names of the Secrets and ConfigMaps `pulp` references but does not own.
/// Events on these objects are routed back to the instance.
pub fn references(pulp: &Pulp) -> Vec<String> {
    let spec = &pulp.spec;
    let mut names: Vec<String> = [
        &spec.object_storage_azure_secret,
        &spec.object_storage_s3_secret,
        &spec.sso_secret,
        &spec.signing_secret,
        &spec.signing_scripts,
        &spec.custom_pulp_settings,
        &spec.route_tls_secret,
        &spec.ingress_tls_secret,
        &spec.ldap.config,
        &spec.ldap.ca,
        &spec.ee_defaults,
    ]
    .into_iter()
    .filter_map(non_empty)
    .map(str::to_string)
    .collect();
    names.extend(pulp.external_db_secret().map(str::to_string));
    names.extend(pulp.external_cache_secret().map(str::to_string));
    names.push(pulp.admin_password_secret());
    names.sort();
    names.dedup();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generators::secrets::string_data;
    use crate::naming::tests::pulp_named;
    use crate::store::memory::MemoryStore;
    use kube::api::ObjectMeta;

    fn secret(name: &str, entries: &[(&str, &str)]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("pulp".into()),
                ..Default::default()
            },
            data: Some(string_data(entries.iter().map(|(k, v)| (*k, v.to_string())))),
            ..Default::default()
        }
    }

    #[test]
    fn image_coordinates_fall_back_to_defaults() {
        let mut pulp = pulp_named("example");
        let defaults = images(&pulp);
        assert_eq!(image_tag(&defaults.pulp), "stable");

        pulp.spec.image_version = Some("3.49".into());
        assert_eq!(images(&pulp).pulp, "quay.io/pulp/pulp-minimal:3.49");
        pulp.spec.image = Some("registry.local:5000/pulp".into());
        assert_eq!(images(&pulp).pulp, "registry.local:5000/pulp:3.49");
        assert_eq!(image_tag("registry.local:5000/pulp"), "latest");
    }

    #[tokio::test]
    async fn external_database_reads_connection_secret() {
        let store = MemoryStore::default();
        store.put(&secret(
            "ext-pg",
            &[
                ("POSTGRES_HOST", "db.example.com"),
                ("POSTGRES_PORT", "5432"),
                ("POSTGRES_USERNAME", "pulp"),
                ("POSTGRES_PASSWORD", "secret"),
                ("POSTGRES_DB_NAME", "pulp"),
            ],
        ));
        let mut pulp = pulp_named("example");
        pulp.spec.database.external_db_secret = Some("ext-pg".into());
        let db = database(&store, &pulp).await.unwrap();
        assert_eq!(db.host, "db.example.com");
        assert_eq!(db.sslmode, "prefer");
    }

    #[tokio::test]
    async fn missing_keys_and_secrets_are_reported() {
        let store = MemoryStore::default();
        let mut pulp = pulp_named("example");
        pulp.spec.database.external_db_secret = Some("ext-pg".into());
        assert!(matches!(
            database(&store, &pulp).await,
            Err(ControllerError::MissingSecret(name)) if name == "ext-pg"
        ));

        store.put(&secret("ext-pg", &[("POSTGRES_HOST", "db")]));
        assert!(matches!(
            database(&store, &pulp).await,
            Err(ControllerError::MissingSecretKey { key, .. }) if key == "POSTGRES_PORT"
        ));
    }

    #[tokio::test]
    async fn s3_needs_endpoint_or_region() {
        let store = MemoryStore::default();
        store.put(&secret("s3", &[("s3-bucket-name", "pulp")]));
        let mut pulp = pulp_named("example");
        pulp.spec.object_storage_s3_secret = Some("s3".into());
        assert!(object_storage(&store, &pulp).await.is_err());

        store.put(&secret("s3", &[("s3-bucket-name", "pulp"), ("s3-region", "eu-west-1")]));
        match object_storage(&store, &pulp).await.unwrap() {
            Some(ObjectStorage::S3 { region, addressing_style, .. }) => {
                assert_eq!(region.as_deref(), Some("eu-west-1"));
                assert_eq!(addressing_style, "path");
            }
            other => panic!("unexpected storage {:?}", other),
        }
    }

    #[tokio::test]
    async fn ldap_keeps_auth_ldap_keys_only() {
        let store = MemoryStore::default();
        store.put(&secret(
            "ldap",
            &[
                ("auth_ldap_server_uri", "ldap://ldap.example.com"),
                ("AUTH_LDAP_START_TLS", "true"),
                ("auth_ldap_ca_file", "/etc/pulp/ldap/ca.crt"),
                ("bind_password", "nope"),
            ],
        ));
        let mut pulp = pulp_named("example");
        pulp.spec.ldap.config = Some("ldap".into());
        let (entries, ca_file) = ldap(&store, &pulp).await.unwrap();
        assert!(entries.contains_key("auth_ldap_server_uri"));
        assert!(entries.contains_key("AUTH_LDAP_START_TLS"));
        assert!(!entries.contains_key("bind_password"));
        assert_eq!(ca_file.as_deref(), Some("/etc/pulp/ldap/ca.crt"));
    }

    #[tokio::test]
    async fn incomplete_sso_is_skipped() {
        let store = MemoryStore::default();
        store.put(&secret("sso", &[("keycloak_host", "kc.example.com")]));
        let mut pulp = pulp_named("example");
        pulp.spec.sso_secret = Some("sso".into());
        assert!(sso(&store, &pulp).await.unwrap().is_empty());

        let mut complete: Vec<(&str, &str)> = SSO_REQUIRED.iter().map(|k| (*k, "x")).collect();
        complete.push(("keycloak_admin_role", "admin"));
        complete.push(("unrelated", "y"));
        store.put(&secret("sso", &complete));
        let entries = sso(&store, &pulp).await.unwrap();
        assert_eq!(entries.len(), 8);
        assert!(!entries.contains_key("unrelated"));
    }

    #[tokio::test]
    async fn route_host_defaults_to_cluster_domain() {
        let store = MemoryStore::with_ingress_domain("apps.example.com");
        let mut pulp = pulp_named("example");
        assert_eq!(route_host(&store, &pulp).await.unwrap(), None);
        pulp.spec.ingress_type = Some("route".into());
        assert_eq!(
            route_host(&store, &pulp).await.unwrap().as_deref(),
            Some("example.apps.example.com")
        );
        pulp.spec.route_host = Some("pulp.example.com".into());
        assert_eq!(
            route_host(&store, &pulp).await.unwrap().as_deref(),
            Some("pulp.example.com")
        );
    }

    #[test]
    fn references_cover_external_objects() {
        let mut pulp = pulp_named("example");
        pulp.spec.object_storage_s3_secret = Some("s3".into());
        pulp.spec.postgres_configuration_secret = Some("legacy-pg".into());
        pulp.spec.custom_pulp_settings = Some("extra".into());
        assert_eq!(
            references(&pulp),
            vec!["example-admin-password", "extra", "legacy-pg", "s3"]
        );
    }
}
