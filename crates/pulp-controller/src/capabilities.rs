use kube::Client;
use tracing::info;

use crate::error::ControllerResult;

/// What the cluster offers beyond vanilla Kubernetes. Probed once at start-up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// `route.openshift.io` is served.
    pub routes: bool,
    /// `config.openshift.io` is served (pull secrets, trusted CA injection).
    pub openshift_config: bool,
}

impl Capabilities {
    pub fn vanilla() -> Self {
        Self::default()
    }

    pub fn openshift() -> Self {
        Self {
            routes: true,
            openshift_config: true,
        }
    }

    pub fn is_openshift(&self) -> bool {
        self.routes && self.openshift_config
    }

    pub fn from_groups<'a>(groups: impl IntoIterator<Item = &'a str>) -> Self {
        let mut caps = Self::default();
        for group in groups {
            match group {
                "route.openshift.io" => caps.routes = true,
                "config.openshift.io" => caps.openshift_config = true,
                _ => {}
            }
        }
        caps
    }

    pub async fn detect(client: &Client) -> ControllerResult<Self> {
        let groups = client.list_api_groups().await?;
        let caps = Self::from_groups(groups.groups.iter().map(|g| g.name.as_str()));
        info!(routes = caps.routes, openshift = caps.is_openshift(), "cluster capabilities");
        Ok(caps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openshift_needs_both_groups() {
        let caps = Capabilities::from_groups(["apps", "route.openshift.io"]);
        assert!(caps.routes);
        assert!(!caps.is_openshift());

        let caps = Capabilities::from_groups(["config.openshift.io", "route.openshift.io"]);
        assert!(caps.is_openshift());
    }
}
