//! Publishing the instance: OpenShift Routes, an Ingress, or the web proxy.

use std::collections::BTreeSet;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info};

use super::pulp::PulpReconciler;
use crate::crd::conditions::{self, INGRESS_READY, ROUTE_READY, TRUE};
use crate::crd::{IngressKind, Route};
use crate::error::ControllerResult;
use crate::generators::{exposure, needs_web, web, Resolved};
use crate::naming::{self, Component};
use crate::store::{ObjectStore, PodExecutor};

/// Delay after tearing down the previous exposure kind.
const SWITCH_REQUEUE: Duration = Duration::from_secs(1);
/// Delay while no pod can report plugin paths.
const NO_POD_REQUEUE: Duration = Duration::from_secs(5);

impl<'a, S: ObjectStore, E: PodExecutor> PulpReconciler<'a, S, E> {
    /// Returns an action when the reconcile has to stop here.
    pub(super) async fn exposure(
        &mut self,
        resolved: &mut Resolved,
    ) -> ControllerResult<Option<Action>> {
        self.current = None;
        let kind = self.pulp.ingress_kind();
        let class = self.pulp.ingress_class_name().map(str::to_string);

        if let Some(previous) = self.status.ingress_type.clone() {
            if previous != kind.as_str() || self.status.ingress_class_name != class {
                info!(from = %previous, to = %kind.as_str(), "exposure changed, removing old resources");
                self.teardown_exposure(resolved).await?;
                self.status.ingress_type = Some(kind.as_str().to_string());
                self.status.ingress_class_name = class;
                return Ok(Some(Action::requeue(SWITCH_REQUEUE)));
            }
        } else {
            self.status.ingress_type = Some(kind.as_str().to_string());
            self.status.ingress_class_name = class;
        }

        match kind {
            IngressKind::Route if self.ctx.capabilities.routes => {
                let Some(paths) = self.plugin_paths(Component::Worker).await? else {
                    return Ok(Some(Action::requeue(NO_POD_REQUEUE)));
                };
                resolved.plugin_paths = paths;
                self.routes(resolved).await?;
            }
            IngressKind::Ingress => {
                if exposure::is_nginx_controller(&self.pulp) {
                    let Some(paths) = self.plugin_paths(Component::Content).await? else {
                        return Ok(Some(Action::requeue(NO_POD_REQUEUE)));
                    };
                    resolved.plugin_paths = paths;
                }
                self.apply(exposure::ingress(&self.pulp, resolved)).await?;
                let type_ = self.condition_type(INGRESS_READY);
                conditions::set(
                    &mut self.status.conditions,
                    &type_,
                    TRUE,
                    "IngressTasksFinished",
                    "All Ingress tasks ran successfully",
                );
            }
            _ => {}
        }

        if needs_web(&self.pulp, resolved) {
            self.current = Some(Component::Web);
            self.apply(web::configmap(&self.pulp)).await?;
            self.apply(web::deployment(&self.pulp, resolved)).await?;
            self.apply(web::service(&self.pulp)).await?;
            self.component_status(Component::Web).await?;
        }
        Ok(None)
    }

    /// Extra paths reported by the route helper of a running pod, `None`
    /// when no such pod exists yet.
    async fn plugin_paths(
        &self,
        component: Component,
    ) -> ControllerResult<Option<Vec<exposure::PluginPath>>> {
        let labels = naming::component_labels(&self.pulp, component);
        let pods = self
            .ctx
            .store
            .list::<Pod>(&self.namespace, &labels)
            .await?;
        let Some(pod) = pods.iter().find(|p| {
            p.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
        }) else {
            debug!(component = component.label(), "no running pod to discover plugin paths");
            return Ok(None);
        };
        let output = self
            .ctx
            .executor
            .exec(
                &self.namespace,
                &pod.name_any(),
                Some(component.label().to_string()),
                vec![exposure::ROUTE_PATHS_SCRIPT.to_string(), self.name.clone()],
                None,
            )
            .await?;
        Ok(Some(exposure::parse_plugin_paths(&output)?))
    }

    async fn routes(&mut self, resolved: &Resolved) -> ControllerResult<()> {
        let routes = exposure::routes(&self.pulp, resolved);
        let wanted: BTreeSet<String> = routes.iter().map(|r| r.name_any()).collect();
        for route in routes {
            self.apply(route).await?;
        }
        let selector = exposure::route_selector(&self.pulp);
        for stale in self
            .ctx
            .store
            .list::<Route>(&self.namespace, &selector)
            .await?
            .into_iter()
            .filter(|r| !wanted.contains(&r.name_any()))
        {
            self.remove::<Route>(&stale.name_any()).await?;
        }
        let type_ = self.condition_type(ROUTE_READY);
        conditions::set(
            &mut self.status.conditions,
            &type_,
            TRUE,
            "RouteTasksFinished",
            "All Route tasks ran successfully",
        );
        Ok(())
    }

    /// Remove whatever a previous exposure kind created.
    async fn teardown_exposure(&mut self, resolved: &Resolved) -> ControllerResult<()> {
        if self.ctx.capabilities.routes {
            let selector = exposure::route_selector(&self.pulp);
            for route in self
                .ctx
                .store
                .list::<Route>(&self.namespace, &selector)
                .await?
            {
                self.remove::<Route>(&route.name_any()).await?;
            }
        }
        let route_type = self.condition_type(ROUTE_READY);
        conditions::remove(&mut self.status.conditions, &route_type);

        self.remove::<Ingress>(&self.name).await?;
        let ingress_type = self.condition_type(INGRESS_READY);
        conditions::remove(&mut self.status.conditions, &ingress_type);

        if !needs_web(&self.pulp, resolved) {
            self.remove::<Deployment>(&Component::Web.deployment_name(&self.name))
                .await?;
            self.remove::<Service>(&Component::Web.service_name(&self.name))
                .await?;
            self.remove::<ConfigMap>(&naming::web_configmap(&self.name))
                .await?;
            let web_type = self.condition_type(Component::Web.condition_suffix());
            conditions::remove(&mut self.status.conditions, &web_type);
        }
        Ok(())
    }
}
