//! One-shot Jobs. Names are generated from a per-kind prefix.

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use super::pulpcore::{
    self, default_security_context, image_pull_secrets, postgres_env, signing_env, PodLayout,
};
use super::Resolved;
use crate::crd::Pulp;
use crate::naming::{self, Component};
use crate::signing;

pub const BACKOFF_LIMIT: i32 = 2;
pub const TTL_SECONDS: i32 = 3600;

pub const MIGRATION: &str = "migration";
pub const RESET_ADMIN_PASSWORD: &str = "reset-admin-password";
pub const UPDATE_CHECKSUMS: &str = "allowed-content-checksums";
pub const SIGNING_METADATA: &str = "signing-metadata";

/// Storage kind a migration job was created for.
pub const STORAGE_ANNOTATION: &str = "repo-manager.pulpproject.org/storage-type";

const WAIT: &str = "/usr/bin/wait_on_postgres.py\n/usr/bin/wait_on_database_migrations.sh\n";

/// Labels of a job of `kind`, used both on the Job and to find earlier runs.
pub fn job_labels(pulp: &Pulp, kind: &str) -> std::collections::BTreeMap<String, String> {
    let mut labels = naming::common_labels(pulp);
    labels.insert("app.kubernetes.io/component".to_string(), kind.to_string());
    labels
}

fn job(
    pulp: &Pulp,
    prefix: &str,
    kind: &str,
    layout: &PodLayout,
    init_containers: Vec<Container>,
    container: Container,
) -> Job {
    let labels = job_labels(pulp, kind);
    Job {
        metadata: naming::generated_meta(pulp, prefix, labels.clone()),
        spec: Some(JobSpec {
            backoff_limit: Some(BACKOFF_LIMIT),
            ttl_seconds_after_finished: Some(TTL_SECONDS),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    service_account_name: Some(pulp.name_any()),
                    image_pull_secrets: image_pull_secrets(pulp),
                    init_containers: (!init_containers.is_empty()).then_some(init_containers),
                    containers: vec![container],
                    volumes: Some(layout.volumes.clone()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn shell_container(
    pulp: &Pulp,
    resolved: &Resolved,
    name: &str,
    script: String,
    layout: &PodLayout,
) -> Container {
    let mut env = postgres_env(pulp);
    env.extend(pulpcore::redis_env(pulp));
    Container {
        name: name.to_string(),
        image: Some(resolved.images.pulp.clone()),
        image_pull_policy: pulp.spec.image_pull_policy.clone(),
        env: Some(env),
        command: Some(vec!["/bin/sh".to_string()]),
        args: Some(vec!["-c".to_string(), script]),
        volume_mounts: Some(layout.mounts.clone()),
        security_context: Some(default_security_context()),
        ..Default::default()
    }
}

/// `pulpcore-manager migrate`. Carries no init container since those wait
/// for the very migrations this job applies.
pub fn migration(pulp: &Pulp, resolved: &Resolved) -> Job {
    let layout = PodLayout::new(pulp, resolved, Component::Worker);
    let container = shell_container(
        pulp,
        resolved,
        MIGRATION,
        "/usr/bin/wait_on_postgres.py\n/usr/local/bin/pulpcore-manager migrate --noinput".to_string(),
        &layout,
    );
    let mut job = job(
        pulp,
        &naming::migration_job_prefix(&pulp.name_any()),
        MIGRATION,
        &layout,
        vec![],
        container,
    );
    job.metadata.annotations = Some(std::collections::BTreeMap::from([(
        STORAGE_ANNOTATION.to_string(),
        pulp.storage_kind().as_str().to_string(),
    )]));
    job
}

pub fn reset_admin_password(pulp: &Pulp, resolved: &Resolved) -> Job {
    let layout = PodLayout::new(pulp, resolved, Component::Api);
    let script = format!(
        "{WAIT}ADMIN_PASSWORD_FILE=/etc/pulp/pulp-admin-password\n\
         if [ -f \"$ADMIN_PASSWORD_FILE\" ]; then\n  PULP_ADMIN_PASSWORD=$(cat $ADMIN_PASSWORD_FILE)\nfi\n\
         if [ -n \"${{PULP_ADMIN_PASSWORD}}\" ]; then\n  /usr/local/bin/pulpcore-manager reset-admin-password --password \"${{PULP_ADMIN_PASSWORD}}\"\nfi"
    );
    let container = shell_container(pulp, resolved, RESET_ADMIN_PASSWORD, script, &layout);
    job(
        pulp,
        &naming::reset_admin_job_prefix(&pulp.name_any()),
        RESET_ADMIN_PASSWORD,
        &layout,
        vec![],
        container,
    )
}

pub fn update_checksums(pulp: &Pulp, resolved: &Resolved) -> Job {
    let layout = PodLayout::new(pulp, resolved, Component::Worker);
    let container = shell_container(
        pulp,
        resolved,
        "update-checksum",
        format!("{WAIT}pulpcore-manager handle-artifact-checksums"),
        &layout,
    );
    job(
        pulp,
        &naming::update_checksums_job_prefix(&pulp.name_any()),
        UPDATE_CHECKSUMS,
        &layout,
        vec![],
        container,
    )
}

/// Shell lines registering one signing service per script in `scripts`.
pub fn signing_commands(pulp: &Pulp, scripts: &[String]) -> String {
    let mut lines = vec![];
    for script in scripts {
        let (class, setting) = match script.as_str() {
            signing::COLLECTION_SCRIPT => (
                "core:AsciiArmoredDetachedSigningService",
                "galaxy_collection_signing_service",
            ),
            signing::CONTAINER_SCRIPT => (
                "container:ManifestSigningService",
                "galaxy_container_signing_service",
            ),
            _ => continue,
        };
        let service = pulp.pulp_setting(setting).unwrap_or_default();
        lines.push(format!(
            "/usr/local/bin/pulpcore-manager add-signing-service --class {} {} {}/{} ${{PULP_SIGNING_KEY_FINGERPRINT}}",
            class,
            service,
            signing::SCRIPTS_DIR,
            script
        ));
    }
    lines.join("\n")
}

/// Registers the signing services found in the `signing_scripts` Secret.
/// The gpg keyring is prepared by the same init containers as the workers.
pub fn signing(pulp: &Pulp, resolved: &Resolved) -> Job {
    let layout = PodLayout::new(pulp, resolved, Component::Worker);
    let init = layout.init_containers(pulp, resolved, Component::Worker);
    let mut container = shell_container(
        pulp,
        resolved,
        SIGNING_METADATA,
        format!("{WAIT}{}", signing_commands(pulp, &resolved.signing_scripts)),
        &layout,
    );
    if let Some(env) = container.env.as_mut() {
        env.extend(signing_env(pulp, resolved));
    }
    job(
        pulp,
        &naming::signing_job_prefix(&pulp.name_any()),
        SIGNING_METADATA,
        &layout,
        init,
        container,
    )
}

/// Image of the first container of a job.
pub fn job_image(job: &Job) -> Option<&str> {
    job.spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()?
        .image
        .as_deref()
}

pub fn job_storage(job: &Job) -> Option<&str> {
    job.metadata
        .annotations
        .as_ref()?
        .get(STORAGE_ANNOTATION)
        .map(String::as_str)
}

pub fn succeeded(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.succeeded)
        .map(|n| n > 0)
        .unwrap_or(false)
}

/// The job gave up after exhausting its retries.
pub fn failed(job: &Job) -> bool {
    job.status
        .iter()
        .flat_map(|s| s.conditions.iter().flatten())
        .any(|c| c.type_ == "Failed" && c.status == "True")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generators::tests::resolved;
    use crate::naming::tests::pulp_named;

    fn container(job: &Job) -> Container {
        job.spec.clone().unwrap().template.spec.unwrap().containers[0].clone()
    }

    #[test]
    fn jobs_share_retry_policy_and_generated_names() {
        let pulp = pulp_named("example");
        let resolved = resolved();
        for job in [
            migration(&pulp, &resolved),
            reset_admin_password(&pulp, &resolved),
            update_checksums(&pulp, &resolved),
        ] {
            let spec = job.spec.clone().unwrap();
            assert_eq!(spec.backoff_limit, Some(2));
            assert_eq!(spec.ttl_seconds_after_finished, Some(3600));
            assert_eq!(spec.template.spec.unwrap().restart_policy.as_deref(), Some("Never"));
            assert!(job.metadata.name.is_none());
            assert!(job.metadata.generate_name.unwrap().starts_with("example-"));
        }
    }

    #[test]
    fn migration_runs_migrate_with_current_image() {
        let pulp = pulp_named("example");
        let mut resolved = resolved();
        resolved.images.pulp = "quay.io/pulp/pulp:3.50".into();
        let job = migration(&pulp, &resolved);
        assert_eq!(job_image(&job), Some("quay.io/pulp/pulp:3.50"));
        assert!(container(&job).args.unwrap()[1].contains("pulpcore-manager migrate --noinput"));
        assert_eq!(job.labels()["app.kubernetes.io/component"], "migration");
        assert_eq!(job_storage(&job), Some("emptyDir"));
    }

    #[test]
    fn reset_admin_mounts_password() {
        let job = reset_admin_password(&pulp_named("example"), &resolved());
        let mounts = container(&job).volume_mounts.unwrap();
        assert!(mounts.iter().any(|m| m.mount_path == "/etc/pulp/pulp-admin-password"));
        assert!(container(&job).args.unwrap()[1].contains("reset-admin-password --password"));
    }

    #[test]
    fn signing_registers_present_scripts_only() {
        let mut pulp = pulp_named("example");
        pulp.spec.signing_secret = Some("signing".into());
        pulp.spec.signing_scripts = Some("scripts".into());
        let commands = signing_commands(&pulp, &[signing::COLLECTION_SCRIPT.to_string()]);
        assert!(commands.contains("add-signing-service --class core:AsciiArmoredDetachedSigningService ansible-default /var/lib/pulp/scripts/collection_script.sh"));
        assert!(!commands.contains("container_script.sh"));

        let mut resolved = resolved();
        resolved.signing_scripts = vec![signing::CONTAINER_SCRIPT.to_string()];
        let job = signing(&pulp, &resolved);
        let pod = job.spec.unwrap().template.spec.unwrap();
        assert!(pod.init_containers.unwrap().iter().any(|c| c.name == "gpg-config"));
        assert!(pod.containers[0].args.as_ref().unwrap()[1].contains("container-default"));
    }
}
