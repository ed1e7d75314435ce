//! Spec validation run before any child object is touched.

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use tracing::{info, warn};

use super::pulp::PulpReconciler;
use crate::crd::conditions::{self, FALSE, FINISHED};
use crate::crd::pulp::non_empty;
use crate::crd::{IngressKind, Pulp, PulpSpec, PulpStatus, StorageKind};
use crate::error::{ControllerError, ControllerResult};
use crate::generators::{needs_web, Resolved};
use crate::resolve::{self, LDAP_CA_FILE_KEY};
use crate::store::{ObjectStore, PodExecutor};

pub const SUPPORTED_CHECKSUMS: [&str; 6] = ["md5", "sha1", "sha224", "sha256", "sha384", "sha512"];
pub const DEPRECATED_CHECKSUMS: [&str; 2] = ["md5", "sha1"];

impl<'a, S: ObjectStore, E: PodExecutor> PulpReconciler<'a, S, E> {
    pub(super) async fn prechecks(&mut self) -> ControllerResult<()> {
        let finished = self.condition_type(FINISHED);
        if conditions::find(&self.status.conditions, &finished).is_none() {
            conditions::set(
                &mut self.status.conditions,
                &finished,
                FALSE,
                "OperatorRunning",
                &format!("{} operator tasks running", self.name),
            );
        }

        check_image_versions(&self.pulp, self.ctx.capabilities)?;
        check_ingress(&self.pulp, self.ctx.capabilities.routes)?;
        check_storage(&self.pulp)?;
        self.check_immutables().await?;
        self.check_references().await?;
        check_file_storage(&self.pulp)?;
        for deprecated in check_checksums(&self.pulp.spec.allowed_content_checksums)? {
            warn!(checksum = %deprecated, "deprecated checksum algorithm allowed");
        }
        self.check_ldap().await?;
        check_signing(&self.pulp)?;
        for (old, new) in self.pulp.deprecated_conflicts() {
            warn!(deprecated = old, replacement = new, "both fields set, using the replacement");
        }
        Ok(())
    }

    async fn check_immutables(&self) -> ControllerResult<()> {
        let Some((fields, spec)) = restore_immutables(&self.pulp, &self.status) else {
            return Ok(());
        };
        let fields = fields.join(", ");
        warn!(%fields, "immutable fields changed, restoring them");
        let mut restored = self.pulp.clone();
        restored.spec = spec;
        restored.status = None;
        self.ctx.store.replace(&self.namespace, &restored).await?;
        Err(ControllerError::precheck(
            "immutable",
            format!("{} cannot be changed once set", fields),
        ))
    }

    /// Every Secret and ConfigMap the spec names must exist before anything
    /// is rendered from them.
    async fn check_references(&self) -> ControllerResult<()> {
        for name in referenced_secrets(&self.pulp) {
            if self
                .ctx
                .store
                .get::<Secret>(&self.namespace, &name)
                .await?
                .is_none()
            {
                return Err(ControllerError::precheck(
                    "ErrorMissingSecret",
                    format!("Secret {} not found", name),
                ));
            }
        }
        if let Some(name) = non_empty(&self.pulp.spec.custom_pulp_settings) {
            if self
                .ctx
                .store
                .get::<ConfigMap>(&self.namespace, name)
                .await?
                .is_none()
            {
                return Err(ControllerError::precheck(
                    "ErrorMissingConfigMap",
                    format!("ConfigMap {} not found", name),
                ));
            }
        }
        Ok(())
    }

    async fn check_ldap(&self) -> ControllerResult<()> {
        let Some(config) = non_empty(&self.pulp.spec.ldap.config) else {
            return Ok(());
        };
        let data = resolve::secret_strings(&self.ctx.store, &self.namespace, config).await?;
        let ca_file = data.get(LDAP_CA_FILE_KEY).filter(|v| !v.is_empty());
        match (non_empty(&self.pulp.spec.ldap.ca), ca_file) {
            (Some(ca), None) => Err(ControllerError::precheck(
                "ErrorLdapCA",
                format!(
                    "ldap.ca is set to {} but {} has no {} key",
                    ca, config, LDAP_CA_FILE_KEY
                ),
            )),
            (None, Some(_)) => Err(ControllerError::precheck(
                "ErrorLdapCA",
                format!("{} sets {} but ldap.ca is empty", config, LDAP_CA_FILE_KEY),
            )),
            _ => Ok(()),
        }
    }
}

fn check_image_versions(pulp: &Pulp, capabilities: crate::Capabilities) -> ControllerResult<()> {
    let resolved = Resolved {
        capabilities,
        ..Default::default()
    };
    if !needs_web(pulp, &resolved) {
        return Ok(());
    }
    let images = resolve::images(pulp);
    let (core, web) = (resolve::image_tag(&images.pulp), resolve::image_tag(&images.web));
    if core == web {
        return Ok(());
    }
    if pulp.spec.inhibit_version_constraint {
        info!(%core, %web, "image versions differ, constraint inhibited");
        return Ok(());
    }
    Err(ControllerError::precheck(
        "ErrorImageVersion",
        format!(
            "pulpcore image version {} does not match pulp-web version {}",
            core, web
        ),
    ))
}

fn check_ingress(pulp: &Pulp, routes: bool) -> ControllerResult<()> {
    match pulp.ingress_kind() {
        IngressKind::Ingress => {
            if pulp.ingress_class_name().is_none() || pulp.ingress_host().is_none() {
                return Err(ControllerError::precheck(
                    "ErrorIngressConfig",
                    "ingress_type ingress requires ingress_class_name and ingress_host",
                ));
            }
        }
        IngressKind::Route if !routes => {
            return Err(ControllerError::precheck(
                "ErrorRouteUnsupported",
                "ingress_type route is only available on clusters serving route.openshift.io",
            ));
        }
        _ => {}
    }
    Ok(())
}

fn check_storage(pulp: &Pulp) -> ControllerResult<()> {
    let kinds = pulp.storage_kinds();
    if kinds.len() > 1 {
        let names: Vec<&str> = kinds.iter().map(StorageKind::as_str).collect();
        return Err(ControllerError::precheck(
            "ErrorMultipleStorage",
            format!("more than one storage type defined: {}", names.join(", ")),
        ));
    }
    if pulp.postgres_storage_class().is_some() && non_empty(&pulp.spec.database.pvc).is_some() {
        return Err(ControllerError::precheck(
            "ErrorMultipleStorage",
            "database defines both postgres_storage_class and pvc",
        ));
    }
    if pulp.redis_storage_class().is_some() && non_empty(&pulp.spec.cache.pvc).is_some() {
        return Err(ControllerError::precheck(
            "ErrorMultipleStorage",
            "cache defines both redis_storage_class and pvc",
        ));
    }
    Ok(())
}

/// A storage class alone cannot size or share the claim it provisions.
pub(super) fn check_file_storage(pulp: &Pulp) -> ControllerResult<()> {
    if pulp.storage_kind() != StorageKind::StorageClass {
        return Ok(());
    }
    let spec = &pulp.spec;
    if non_empty(&spec.file_storage_size).is_none()
        || non_empty(&spec.file_storage_access_mode).is_none()
    {
        return Err(ControllerError::precheck(
            "ErrorFileStorage",
            "file_storage_storage_class requires file_storage_size and file_storage_access_mode",
        ));
    }
    Ok(())
}

/// Validates the allowed checksum list and returns the deprecated entries.
pub(super) fn check_checksums(allowed: &[String]) -> ControllerResult<Vec<String>> {
    if allowed.is_empty() {
        return Ok(vec![]);
    }
    if let Some(unknown) = allowed
        .iter()
        .find(|c| !SUPPORTED_CHECKSUMS.contains(&c.as_str()))
    {
        return Err(ControllerError::precheck(
            "ErrorChecksums",
            format!("unsupported checksum algorithm {}", unknown),
        ));
    }
    if !allowed.iter().any(|c| c == "sha256") {
        return Err(ControllerError::precheck(
            "ErrorChecksums",
            "allowed_content_checksums must include sha256",
        ));
    }
    Ok(allowed
        .iter()
        .filter(|c| DEPRECATED_CHECKSUMS.contains(&c.as_str()))
        .cloned()
        .collect())
}

fn check_signing(pulp: &Pulp) -> ControllerResult<()> {
    let secret = non_empty(&pulp.spec.signing_secret).is_some();
    let scripts = non_empty(&pulp.spec.signing_scripts).is_some();
    if secret != scripts {
        return Err(ControllerError::precheck(
            "ErrorSigning",
            "signing_secret and signing_scripts must be set together",
        ));
    }
    Ok(())
}

fn referenced_secrets(pulp: &Pulp) -> Vec<String> {
    let spec = &pulp.spec;
    let mut names: Vec<String> = [
        &spec.object_storage_azure_secret,
        &spec.object_storage_s3_secret,
        &spec.sso_secret,
        &spec.signing_secret,
        &spec.signing_scripts,
        &spec.ldap.config,
        &spec.ldap.ca,
        &spec.route_tls_secret,
    ]
    .into_iter()
    .filter_map(non_empty)
    .map(str::to_string)
    .collect();
    names.extend(pulp.external_db_secret().map(str::to_string));
    names.extend(pulp.external_cache_secret().map(str::to_string));
    names
}

/// Fields whose live value departs from the one recorded in status, and the
/// spec with those fields put back.
pub(super) fn restore_immutables(
    pulp: &Pulp,
    status: &PulpStatus,
) -> Option<(Vec<&'static str>, PulpSpec)> {
    let mut spec = pulp.spec.clone();
    let mut changed = vec![];

    if let Some(recorded) = &status.deployment_type {
        if *recorded != spec.deployment_type {
            spec.deployment_type = recorded.clone();
            changed.push("deployment_type");
        }
    }
    let optional = [
        (
            "object_storage_azure_secret",
            &status.object_storage_azure_secret,
            non_empty(&pulp.spec.object_storage_azure_secret).map(str::to_string),
        ),
        (
            "object_storage_s3_secret",
            &status.object_storage_s3_secret,
            non_empty(&pulp.spec.object_storage_s3_secret).map(str::to_string),
        ),
        (
            "db_fields_encryption_secret",
            &status.db_fields_encryption_secret,
            Some(pulp.db_fields_encryption_secret()),
        ),
        (
            "container_token_secret",
            &status.container_token_secret,
            Some(pulp.container_token_secret()),
        ),
        (
            "admin_password_secret",
            &status.admin_password_secret,
            Some(pulp.admin_password_secret()),
        ),
        (
            "external_cache_secret",
            &status.external_cache_secret,
            pulp.external_cache_secret().map(str::to_string),
        ),
    ];
    for (field, recorded, live) in optional {
        let Some(recorded) = recorded else { continue };
        if live.as_ref() == Some(recorded) {
            continue;
        }
        let value = Some(recorded.clone());
        match field {
            "object_storage_azure_secret" => spec.object_storage_azure_secret = value,
            "object_storage_s3_secret" => spec.object_storage_s3_secret = value,
            "db_fields_encryption_secret" => spec.db_fields_encryption_secret = value,
            "container_token_secret" => spec.container_token_secret = value,
            "admin_password_secret" => spec.admin_password_secret = value,
            _ => spec.cache.external_cache_secret = value,
        }
        changed.push(field);
    }
    (!changed.is_empty()).then_some((changed, spec))
}
