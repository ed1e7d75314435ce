use std::{env, path::PathBuf, sync::OnceLock, time::Duration};

use config::{Environment, File};
use log::LevelFilter;
use serde::{Deserialize, Serialize};

pub static CONFIG_INSTANCE: OnceLock<Settings> = OnceLock::new();

use crate::error::{PulpError, PulpResult};

/// Fallback container images. A `RELATED_IMAGE_*` environment variable set on
/// the operator pod takes precedence over the configured value.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ImageDefaults {
    #[serde(default = "default_pulp_image")]
    pub pulp: String,
    #[serde(default = "default_web_image")]
    pub web: String,
    #[serde(default = "default_postgres_image")]
    pub postgres: String,
    #[serde(default = "default_redis_image")]
    pub redis: String,
}

impl Default for ImageDefaults {
    fn default() -> Self {
        Self {
            pulp: default_pulp_image(),
            web: default_web_image(),
            postgres: default_postgres_image(),
            redis: default_redis_image(),
        }
    }
}

impl ImageDefaults {
    pub fn pulp(&self) -> String {
        related_image("RELATED_IMAGE_PULP").unwrap_or_else(|| self.pulp.clone())
    }

    pub fn web(&self) -> String {
        related_image("RELATED_IMAGE_PULP_WEB").unwrap_or_else(|| self.web.clone())
    }

    pub fn postgres(&self) -> String {
        related_image("RELATED_IMAGE_PULP_POSTGRES").unwrap_or_else(|| self.postgres.clone())
    }

    pub fn redis(&self) -> String {
        related_image("RELATED_IMAGE_PULP_REDIS").unwrap_or_else(|| self.redis.clone())
    }
}

fn related_image(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Settings {
    #[serde(default = "default_log_level")]
    pub log_level: LevelFilter,

    /// Delay before re-checking components that are not ready yet.
    #[serde(default = "default_requeue_after_secs")]
    pub requeue_after_secs: u64,

    #[serde(default = "default_error_requeue_secs")]
    pub error_requeue_secs: u64,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,

    /// Restrict the controllers to one namespace. All namespaces when unset.
    #[serde(default)]
    pub watch_namespace: Option<String>,

    #[serde(default)]
    pub images: ImageDefaults,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            requeue_after_secs: default_requeue_after_secs(),
            error_requeue_secs: default_error_requeue_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            poll_timeout_secs: default_poll_timeout_secs(),
            watch_namespace: None,
            images: ImageDefaults::default(),
        }
    }
}

pub fn get_config() -> PulpResult<&'static Settings> {
    CONFIG_INSTANCE.get().ok_or(PulpError::ConfigNotInitialized)
}

impl Settings {
    /// Layer the optional config files found from `root` with
    /// `PULP_OPERATOR_*` environment overrides.
    pub fn from_root(root: Option<PathBuf>) -> PulpResult<Self> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "production".to_string());

        let mut s = config::Config::builder()
            .add_source(File::with_name("config").required(false))
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config.{}", run_mode)).required(false));

        if let Some(root) = root {
            if root.is_file() {
                s = s.add_source(File::from(root.as_path()));
            } else {
                s = s.add_source(File::from(root.join("config")).required(false));
            }
        }

        let s = s
            .add_source(
                Environment::with_prefix("PULP_OPERATOR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg = s.try_deserialize()?;
        Ok(cfg)
    }

    pub fn requeue_after(&self) -> Duration {
        Duration::from_secs(self.requeue_after_secs)
    }

    pub fn error_requeue(&self) -> Duration {
        Duration::from_secs(self.error_requeue_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

fn default_log_level() -> LevelFilter {
    LevelFilter::Info
}

fn default_requeue_after_secs() -> u64 {
    30
}

fn default_error_requeue_secs() -> u64 {
    5
}

fn default_poll_interval_secs() -> u64 {
    1
}

fn default_poll_timeout_secs() -> u64 {
    120
}

fn default_pulp_image() -> String {
    "quay.io/pulp/pulp-minimal:stable".to_string()
}

fn default_web_image() -> String {
    "quay.io/pulp/pulp-web:stable".to_string()
}

fn default_postgres_image() -> String {
    "docker.io/library/postgres:13".to_string()
}

fn default_redis_image() -> String {
    "docker.io/library/redis:latest".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.requeue_after(), Duration::from_secs(30));
        assert_eq!(settings.poll_timeout(), Duration::from_secs(120));
        assert_eq!(settings.images.postgres, "docker.io/library/postgres:13");
    }

    #[test]
    fn settings_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "requeue_after_secs: 10\nimages:\n  web: example.com/web:1").unwrap();

        let settings = Settings::from_root(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(settings.requeue_after_secs, 10);
        assert_eq!(settings.images.web, "example.com/web:1");
        assert_eq!(settings.images.pulp, "quay.io/pulp/pulp-minimal:stable");
        assert_eq!(settings.error_requeue_secs, 5);
    }
}
