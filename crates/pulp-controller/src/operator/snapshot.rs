//! Secret and ConfigMap files written into a backup directory.
//!
//! Each file is a small YAML document naming the object and carrying its
//! data as plain strings, e.g.
//!
//! ```yaml
//! admin_password_secret: example-admin-password
//! data:
//!   password: hunter2
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ControllerResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    Secret,
    ConfigMap,
}

/// One object type a backup carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    /// Used in condition reasons, e.g. `RestoringAdminSecret`.
    pub label: &'static str,
    pub file: &'static str,
    /// YAML key holding the object name.
    pub name_key: &'static str,
    pub kind: SnapshotKind,
}

const fn secret(label: &'static str, file: &'static str, name_key: &'static str) -> Snapshot {
    Snapshot {
        label,
        file,
        name_key,
        kind: SnapshotKind::Secret,
    }
}

pub const ADMIN: Snapshot = secret("Admin", "admin_secret.yaml", "admin_password_secret");
pub const POSTGRES: Snapshot = secret(
    "Postgres",
    "postgres_configuration_secret.yaml",
    "postgres_secret",
);
pub const DB_FIELDS_ENCRYPTION: Snapshot = secret(
    "DBFieldsEncryption",
    "db_fields_encryption_secret.yaml",
    "db_fields_encryption_secret",
);
pub const CONTAINER_TOKEN: Snapshot = secret(
    "ContainerToken",
    "container_token_secret.yaml",
    "container_token_secret",
);
pub const SIGNING: Snapshot = secret("Signing", "signing_secret.yaml", "signing_secret");
pub const OBJECT_STORAGE: Snapshot = secret(
    "ObjectStorage",
    "objectstorage_secret.yaml",
    "storage_secret",
);
pub const SSO: Snapshot = secret("SSO", "sso_secret.yaml", "sso_secret");
pub const CUSTOM_SETTINGS: Snapshot = Snapshot {
    label: "CustomPulpSettings",
    file: "custom_pulp_settings.yaml",
    name_key: "custom_pulp_settings",
    kind: SnapshotKind::ConfigMap,
};

/// Backup order.
pub const ALL: [Snapshot; 8] = [
    ADMIN,
    POSTGRES,
    DB_FIELDS_ENCRYPTION,
    CONTAINER_TOKEN,
    SIGNING,
    OBJECT_STORAGE,
    SSO,
    CUSTOM_SETTINGS,
];

pub const CR_FILE: &str = "cr_object";
pub const DB_FILE: &str = "pulp.db";
pub const FILES_DIR: &str = "pulp";

#[derive(Serialize, Deserialize)]
struct Document {
    #[serde(flatten)]
    name: BTreeMap<String, String>,
    #[serde(default)]
    data: BTreeMap<String, String>,
}

impl Snapshot {
    pub fn path(&self, dir: &str) -> String {
        format!("{}/{}", dir, self.file)
    }

    pub fn encode(&self, name: &str, data: &BTreeMap<String, String>) -> ControllerResult<String> {
        let doc = Document {
            name: BTreeMap::from([(self.name_key.to_string(), name.to_string())]),
            data: data.clone(),
        };
        Ok(serde_yaml::to_string(&doc)?)
    }

    /// Object name and data, or `None` when the file does not name one.
    pub fn decode(
        &self,
        yaml: &str,
    ) -> ControllerResult<Option<(String, BTreeMap<String, String>)>> {
        let mut doc: Document = serde_yaml::from_str(yaml)?;
        Ok(doc
            .name
            .remove(self.name_key)
            .filter(|n| !n.is_empty())
            .map(|name| (name, doc.data)))
    }
}
