//! Galaxy-only extras: periodic sync of default execution environment images.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, KeyToPath, PodSpec, PodTemplateSpec, Volume,
    VolumeMount,
};
use kube::ResourceExt;

use super::pulpcore::{default_security_context, env, env_from_secret};
use super::{root_url, Resolved};
use crate::crd::{pulp::non_empty, Pulp};
use crate::naming;

pub const SKOPEO_IMAGE: &str = "quay.io/skopeo/stable";
pub const IMAGES_KEY: &str = "images.yaml";
pub const SCHEDULE: &str = "*/2 * * * *";

const DEFAULT_IMAGES: &str = "quay.io:
  images-by-tag-regex:
    fedora/fedora-minimal: ^latest$
    fedora/fedora: ^latest$";

/// Default image list, only generated when `ee_defaults` does not name a
/// user ConfigMap. Users may edit it afterwards.
pub fn ee_defaults_configmap(pulp: &Pulp) -> Option<ConfigMap> {
    if non_empty(&pulp.spec.ee_defaults).is_some() {
        return None;
    }
    Some(ConfigMap {
        metadata: naming::child_meta(
            pulp,
            &naming::ee_defaults_configmap(pulp),
            naming::common_labels(pulp),
        ),
        data: Some(BTreeMap::from([(
            IMAGES_KEY.to_string(),
            DEFAULT_IMAGES.to_string(),
        )])),
        ..Default::default()
    })
}

/// `host[:port]` of the instance's public URL.
fn registry_host(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    rest.split('/').next().unwrap_or(rest)
}

/// `<name>-ee-defaults`, running `skopeo sync` into the instance registry.
pub fn ee_defaults_cronjob(pulp: &Pulp, resolved: &Resolved) -> CronJob {
    let name = naming::ee_defaults_cronjob(&pulp.name_any());
    let url = root_url(pulp, resolved);
    let destination = format!("{}/", registry_host(&url));
    let args = [
        "--debug",
        "sync",
        "--dest",
        "docker",
        "--src",
        "yaml",
        "--retry-times",
        "3",
        "--dest-creds",
        "$(USERNAME):$(PASSWORD)",
        "--dest-tls-verify=false",
        "--keep-going",
        "/images.yaml",
        destination.as_str(),
    ];

    CronJob {
        metadata: naming::child_meta(pulp, &name, naming::common_labels(pulp)),
        spec: Some(CronJobSpec {
            schedule: SCHEDULE.to_string(),
            successful_jobs_history_limit: Some(1),
            failed_jobs_history_limit: Some(2),
            job_template: JobTemplateSpec {
                spec: Some(JobSpec {
                    template: PodTemplateSpec {
                        spec: Some(PodSpec {
                            restart_policy: Some("Never".to_string()),
                            containers: vec![Container {
                                name: "skopeo".to_string(),
                                image: Some(SKOPEO_IMAGE.to_string()),
                                image_pull_policy: Some("Always".to_string()),
                                env: Some(vec![
                                    env("USERNAME", "admin"),
                                    env_from_secret(
                                        "PASSWORD",
                                        &pulp.admin_password_secret(),
                                        "password",
                                    ),
                                ]),
                                args: Some(args.iter().map(|a| a.to_string()).collect()),
                                volume_mounts: Some(vec![VolumeMount {
                                    name: "ee-default-images".to_string(),
                                    mount_path: "/images.yaml".to_string(),
                                    sub_path: Some(IMAGES_KEY.to_string()),
                                    read_only: Some(true),
                                    ..Default::default()
                                }]),
                                security_context: Some(default_security_context()),
                                ..Default::default()
                            }],
                            volumes: Some(vec![Volume {
                                name: "ee-default-images".to_string(),
                                config_map: Some(ConfigMapVolumeSource {
                                    name: naming::ee_defaults_configmap(pulp),
                                    items: Some(vec![KeyToPath {
                                        key: IMAGES_KEY.to_string(),
                                        path: IMAGES_KEY.to_string(),
                                        ..Default::default()
                                    }]),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generators::tests::resolved;
    use crate::naming::tests::pulp_named;

    #[test]
    fn registry_host_strips_scheme_and_path() {
        assert_eq!(registry_host("https://pulp.example.com"), "pulp.example.com");
        assert_eq!(
            registry_host("http://example-web-svc.pulp.svc.cluster.local:24880/x"),
            "example-web-svc.pulp.svc.cluster.local:24880"
        );
    }

    #[test]
    fn cronjob_syncs_into_instance() {
        let mut pulp = pulp_named("example");
        pulp.spec.deployment_type = "galaxy".into();
        pulp.spec.deploy_ee_defaults = true;
        let job = ee_defaults_cronjob(&pulp, &resolved());
        assert_eq!(job.name_any(), "example-ee-defaults");
        let spec = job.spec.unwrap();
        assert_eq!(spec.schedule, "*/2 * * * *");
        let pod = spec.job_template.spec.unwrap().template.spec.unwrap();
        let args = pod.containers[0].args.clone().unwrap();
        assert_eq!(
            args.last().map(String::as_str),
            Some("example-web-svc.pulp.svc.cluster.local:24880/")
        );
        let volume = &pod.volumes.unwrap()[0];
        assert_eq!(volume.config_map.as_ref().unwrap().name, "example-ee-default-images");
    }

    #[test]
    fn user_configmap_is_not_generated() {
        let mut pulp = pulp_named("example");
        assert!(ee_defaults_configmap(&pulp).is_some());
        pulp.spec.ee_defaults = Some("my-images".into());
        assert!(ee_defaults_configmap(&pulp).is_none());
        let job = ee_defaults_cronjob(&pulp, &resolved());
        let pod = job.spec.unwrap().job_template.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.volumes.unwrap()[0].config_map.as_ref().unwrap().name, "my-images");
    }
}
