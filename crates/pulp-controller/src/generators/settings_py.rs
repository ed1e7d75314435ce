//! Rendering of the `settings.py` file stored in the `<name>-server` Secret.
//!
//! The file is assembled as an ordered list of entries. Later sections may
//! replace an earlier setting of the same name, which drops the earlier line
//! instead of emitting the key twice. Every map is visited in sorted key order
//! so the rendered bytes only change when an input does.

use std::collections::BTreeSet;

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use super::{root_url, token_server, ObjectStorage, Resolved};
use crate::crd::{conditions::title_case, Pulp};

pub const HEADER: &str = "
# This file is managed by Pulp operator.
# DO NOT EDIT IT.
#
# To modify custom fields, use the pulp_settings from Pulp CR, for example:
# spec:
#   pulp_settings:
#     allowed_export_paths:
#     - /tmp

";

const LDAP_STRUCTURED: [&str; 6] = [
    "AUTH_LDAP_CACHE_TIMEOUT",
    "AUTH_LDAP_GROUP_SEARCH",
    "AUTH_LDAP_USER_SEARCH",
    "AUTH_LDAP_GROUP_TYPE",
    "AUTH_LDAP_GLOBAL_OPTIONS",
    "AUTH_LDAP_CONNECTION_OPTIONS",
];

const LDAP_BOOLEAN: [&str; 4] = [
    "AUTH_LDAP_MIRROR_GROUPS",
    "AUTH_LDAP_ALWAYS_UPDATE_USER",
    "AUTH_LDAP_FIND_GROUP_PERMS",
    "AUTH_LDAP_START_TLS",
];

lazy_static! {
    static ref TUPLE: Regex = Regex::new(r"\(.*\)").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Setting { key: String, value: String },
    Raw(String),
}

#[derive(Debug, Default)]
struct SettingsFile {
    entries: Vec<Entry>,
}

impl SettingsFile {
    fn set(&mut self, key: &str, value: impl Into<String>) {
        self.entries.push(Entry::Setting {
            key: key.to_string(),
            value: value.into(),
        });
    }

    fn quoted(&mut self, key: &str, value: &str) {
        self.set(key, format!("\"{}\"", value));
    }

    fn raw(&mut self, text: &str) {
        self.entries.push(Entry::Raw(text.to_string()));
    }

    /// Replace any earlier definition of `key`.
    fn replace(&mut self, key: &str, value: String) {
        self.entries
            .retain(|e| !matches!(e, Entry::Setting { key: k, .. } if k == key));
        self.set(key, value);
    }

    fn render(&self) -> String {
        let mut out = HEADER.to_string();
        for entry in &self.entries {
            match entry {
                Entry::Setting { key, value } => {
                    out.push_str(key);
                    out.push_str(" = ");
                    out.push_str(value);
                    out.push('\n');
                }
                Entry::Raw(text) => out.push_str(text),
            }
        }
        out
    }
}

/// Python literal for a boolean setting.
pub fn python_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

/// Python literal for one `pulp_settings` value.
pub fn python_value(value: &Value) -> String {
    match value {
        Value::String(s) if TUPLE.is_match(s) => s.clone(),
        Value::Object(_) => value.to_string().replace('"', "'"),
        Value::Array(_) => value.to_string(),
        Value::Bool(b) => python_bool(*b).to_string(),
        Value::String(s) => format!("\"{}\"", s),
        other => format!("\"{}\"", other),
    }
}

fn defaults(pulp: &Pulp, resolved: &Resolved, file: &mut SettingsFile, custom: &BTreeSet<String>) {
    let root = root_url(pulp, resolved);
    let fixed = [
        ("ANSIBLE_API_HOSTNAME", format!("\"{}\"", root)),
        ("ANSIBLE_CERTS_DIR", "\"/etc/pulp/keys/\"".to_string()),
        ("API_ROOT", format!("\"{}\"", pulp.api_root())),
        ("CONTENT_ORIGIN", format!("\"{}\"", root)),
        (
            "DB_ENCRYPTION_KEY",
            "\"/etc/pulp/keys/database_fields.symmetric.key\"".to_string(),
        ),
        (
            "GALAXY_COLLECTION_SIGNING_SERVICE",
            format!(
                "\"{}\"",
                pulp.pulp_setting("galaxy_collection_signing_service")
                    .unwrap_or_default()
            ),
        ),
        (
            "GALAXY_CONTAINER_SIGNING_SERVICE",
            format!(
                "\"{}\"",
                pulp.pulp_setting("galaxy_container_signing_service")
                    .unwrap_or_default()
            ),
        ),
        (
            "PRIVATE_KEY_PATH",
            format!("\"/etc/pulp/keys/{}\"", pulp.container_auth_private_key_name()),
        ),
        (
            "PUBLIC_KEY_PATH",
            format!("\"/etc/pulp/keys/{}\"", pulp.container_auth_public_key_name()),
        ),
        ("STATIC_ROOT", "\"/var/lib/operator/static/\"".to_string()),
        ("TOKEN_AUTH_DISABLED", "False".to_string()),
        ("TOKEN_SIGNATURE_ALGORITHM", "\"ES256\"".to_string()),
    ];
    for (key, value) in fixed {
        if !custom.contains(key) {
            file.set(key, value);
        }
    }
}

fn database(resolved: &Resolved, file: &mut SettingsFile) {
    let db = &resolved.database;
    file.set(
        "DATABASES",
        format!(
            "{{
  'default': {{
    'HOST': '{}',
    'ENGINE': 'django.db.backends.postgresql_psycopg2',
    'NAME': '{}',
    'USER': '{}',
    'PASSWORD': '{}',
    'PORT': '{}',
    'CONN_MAX_AGE': 0,
    'OPTIONS': {{ 'sslmode': '{}' }},
  }}
}}",
            db.host, db.name, db.user, db.password, db.port, db.sslmode
        ),
    );
}

fn cache(resolved: &Resolved, file: &mut SettingsFile) {
    let Some(cache) = &resolved.cache else {
        return;
    };
    file.set("CACHE_ENABLED", "True");
    file.quoted("REDIS_HOST", &cache.host);
    file.quoted("REDIS_PORT", &cache.port);
    file.quoted("REDIS_PASSWORD", &cache.password);
    file.quoted("REDIS_DB", &cache.db);
}

fn object_storage(resolved: &Resolved, file: &mut SettingsFile) {
    let Some(storage) = &resolved.object_storage else {
        return;
    };
    let (backend, options) = match storage {
        ObjectStorage::Azure {
            account_name,
            account_key,
            container,
            container_path,
            connection_string,
        } => (
            "storages.backends.azure_storage.AzureStorage",
            vec![
                format!("\"connection_string\": '{}'", connection_string),
                format!("\"account_name\": '{}'", account_name),
                format!("\"azure_container\": '{}'", container),
                format!("\"account_key\": '{}'", account_key),
                "\"expiration_secs\": 60".to_string(),
                "\"overwrite_files\": 'True'".to_string(),
                format!("\"location\": '{}'", container_path),
            ],
        ),
        ObjectStorage::S3 {
            bucket,
            access_key_id,
            secret_access_key,
            endpoint,
            region,
            addressing_style,
        } => {
            let mut options = vec![
                "\"signature_version\": \"s3v4\"".to_string(),
                format!("\"addressing_style\": \"{}\"", addressing_style),
                format!("\"bucket_name\": '{}'", bucket),
            ];
            let optional = [
                ("secret_key", secret_access_key),
                ("access_key", access_key_id),
                ("endpoint_url", endpoint),
                ("region_name", region),
            ];
            for (name, value) in optional {
                if let Some(value) = value {
                    options.push(format!("\"{}\": \"{}\"", name, value));
                }
            }
            ("storages.backends.s3boto3.S3Boto3Storage", options)
        }
    };
    let options = options
        .iter()
        .map(|o| format!("            {},\n", o))
        .collect::<String>();
    file.quoted("MEDIA_ROOT", "");
    file.set(
        "STORAGES",
        format!(
            "{{
    \"default\": {{
        \"BACKEND\": \"{}\",
        \"OPTIONS\": {{
{}        }},
    }},
    \"staticfiles\": {{\"BACKEND\": \"django.contrib.staticfiles.storage.StaticFilesStorage\"}},
}}",
            backend, options
        ),
    );
}

fn ldap(resolved: &Resolved, file: &mut SettingsFile) {
    if resolved.ldap.is_empty() {
        return;
    }
    file.raw(
        "
#### LDAP SETTINGS ####
import ldap
from django_auth_ldap.config import LDAPSearch, PosixGroupType
",
    );
    file.set(
        "AUTHENTICATION_BACKENDS",
        "[
  \"django_auth_ldap.backend.LDAPBackend\",
  \"django.contrib.auth.backends.ModelBackend\",
  \"pulpcore.backends.ObjectRolePermissionBackend\",
]",
    );
    for (key, value) in &resolved.ldap {
        let key = key.to_uppercase();
        if LDAP_STRUCTURED.contains(&key.as_str()) {
            file.set(&key, value.clone());
        } else if LDAP_BOOLEAN.contains(&key.as_str()) {
            file.set(&key, title_case(value));
        } else {
            file.quoted(&key, value);
        }
    }
    file.raw("#### END OF LDAP SETTINGS ####\n\n");
}

fn sso(resolved: &Resolved, file: &mut SettingsFile) {
    for (key, value) in &resolved.sso {
        file.quoted(&key.to_uppercase(), value);
    }
}

/// Render `settings.py`.
pub fn render(pulp: &Pulp, resolved: &Resolved) -> String {
    let mut file = SettingsFile::default();

    let custom: BTreeSet<String> = resolved
        .custom_settings
        .keys()
        .map(|k| k.to_uppercase())
        .collect();
    for (key, value) in &resolved.custom_settings {
        file.set(&key.to_uppercase(), value.clone());
    }
    defaults(pulp, resolved, &mut file, &custom);

    if pulp.spec.enable_debugging {
        file.set(
            "LOGGING",
            "{'dynaconf_merge': True, 'loggers': {'': {'handlers': ['console'], 'level': 'DEBUG'}}}",
        );
    }
    if !custom.contains("DATABASES") {
        database(resolved, &mut file);
    }
    cache(resolved, &mut file);
    if !custom.contains("STORAGES") {
        object_storage(resolved, &mut file);
    }
    if !custom.contains("TOKEN_SERVER") {
        file.quoted("TOKEN_SERVER", &token_server(pulp, resolved));
    }
    if !custom.contains("SECRET_KEY") {
        file.quoted("SECRET_KEY", &resolved.secret_key);
    }
    if !custom.contains("ALLOWED_CONTENT_CHECKSUMS") && !pulp.spec.allowed_content_checksums.is_empty()
    {
        file.set(
            "ALLOWED_CONTENT_CHECKSUMS",
            Value::from(pulp.spec.allowed_content_checksums.clone()).to_string(),
        );
    }
    ldap(resolved, &mut file);
    sso(resolved, &mut file);

    if let Some(Value::Object(overrides)) = &pulp.spec.pulp_settings {
        let mut keys: Vec<&String> = overrides.keys().collect();
        keys.sort();
        for key in keys {
            file.replace(&key.to_uppercase(), python_value(&overrides[key]));
        }
    }

    file.render()
}
