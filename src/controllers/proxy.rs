use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::anyhow;
use chrono::Utc;
use futures_util::{FutureExt, StreamExt};
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            ConfigMap, ConfigMapVolumeSource, Container, PodSpec, PodTemplateSpec,
            ResourceRequirements, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{LabelSelector, OwnerReference},
    },
};
use kube::{
    api::{DeleteParams, ObjectMeta, PostParams},
    runtime::{
        controller::{Action, Config as ControllerConfig},
        finalizer,
        finalizer::Event as FinalizerEvent,
        watcher, Controller,
    },
    Api, CustomResource, Resource, ResourceExt,
};
use log::{debug, error, info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::error::{is_conflict, is_not_found, Error};
use crate::nginx;
use crate::OPERATOR_MANAGER;

pub const PROXY_FINALIZER: &str = "jaeger-nginx-proxy.platform-engineer.stream/cleanup";

/// Key under which the rendered configuration lands in the child ConfigMap.
pub const CONFIG_KEY: &str = "proxy.conf";

const CONFLICT_REQUEUE: Duration = Duration::from_secs(2);
const STEADY_REQUEUE: Duration = Duration::from_secs(60);

#[derive(Default, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Upstream {
    pub collector_host: String,
}

#[derive(Default, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PortSpec {
    pub name: String,
    pub port: i32,
    pub path: String,
}

#[derive(Default, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    pub repository: String,
    pub tag: String,
    pub pull_policy: String,
}

#[derive(Default, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    #[serde(rename = "type")]
    pub type_: String,
}

#[derive(Default, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceValues {
    pub cpu: String,
    pub memory: String,
}

#[derive(Default, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesSpec {
    pub limits: ResourceValues,
    pub requests: ResourceValues,
}

#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "jaeger-nginx-proxy.platform-engineer.stream",
    version = "v1alpha0",
    kind = "JaegerNginxProxy",
    plural = "jaegernginxproxies",
    namespaced,
    status = "JaegerNginxProxyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct JaegerNginxProxySpec {
    pub replica_count: i32,
    pub upstream: Upstream,
    pub container_port: i32,
    pub image: ImageSpec,
    pub ports: Vec<PortSpec>,
    pub service: ServiceSpec,
    pub resources: ResourcesSpec,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JaegerNginxProxyStatus {
    pub ready: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Build the child ConfigMap holding the rendered configuration.
///
/// Rendering runs through the syntactic self-check so a spec that slipped
/// past admission never materializes as a broken ConfigMap.
pub fn build_config_map(
    proxy: &JaegerNginxProxy,
    oref: &OwnerReference,
) -> Result<ConfigMap, Error> {
    let config = nginx::render(&proxy.spec);
    nginx::validate(&config)?;

    let mut data = BTreeMap::new();
    data.insert(CONFIG_KEY.to_string(), config);

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(proxy.name_any()),
            namespace: proxy.namespace(),
            owner_references: Some(vec![oref.clone()]),
            ..ObjectMeta::default()
        },
        data: Some(data),
        ..ConfigMap::default()
    })
}

/// Build the child Deployment: one `nginx` container, config mounted at
/// `/etc/nginx/conf.d`, selector `app=<name>`.
pub fn build_deployment(proxy: &JaegerNginxProxy, oref: &OwnerReference) -> Deployment {
    let name = proxy.name_any();
    let image = format!("{}:{}", proxy.spec.image.repository, proxy.spec.image.tag);

    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), name.clone());

    Deployment {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: proxy.namespace(),
            owner_references: Some(vec![oref.clone()]),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(proxy.spec.replica_count),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels), ..ObjectMeta::default() }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "nginx".to_string(),
                        image: Some(image),
                        resources: Some(ResourceRequirements {
                            limits: Some(quantities(&proxy.spec.resources.limits)),
                            requests: Some(quantities(&proxy.spec.resources.requests)),
                            ..ResourceRequirements::default()
                        }),
                        volume_mounts: Some(vec![VolumeMount {
                            name: "contents".to_string(),
                            mount_path: "/etc/nginx/conf.d".to_string(),
                            ..VolumeMount::default()
                        }]),
                        ..Container::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: "contents".to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: Some(name),
                            ..ConfigMapVolumeSource::default()
                        }),
                        ..Volume::default()
                    }]),
                    ..PodSpec::default()
                }),
                ..PodTemplateSpec::default()
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    }
}

fn post_params() -> PostParams {
    PostParams { dry_run: false, field_manager: Some(OPERATOR_MANAGER.to_string()) }
}

fn quantities(values: &ResourceValues) -> BTreeMap<String, Quantity> {
    let mut map = BTreeMap::new();
    map.insert("cpu".to_string(), Quantity(values.cpu.clone()));
    map.insert("memory".to_string(), Quantity(values.memory.clone()));
    map
}

fn first_image(dep: &Deployment) -> Option<String> {
    dep.spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()?
        .image
        .clone()
}

/// Status derived from the observed Deployment; `None` means it was not found.
pub(crate) fn deployment_status(dep: Option<&Deployment>) -> JaegerNginxProxyStatus {
    let Some(dep) = dep else {
        return JaegerNginxProxyStatus { ready: false, message: "Deployment not found".to_string() };
    };

    let desired = dep.spec.as_ref().and_then(|spec| spec.replicas).unwrap_or(1);
    let status = dep.status.clone().unwrap_or_default();
    let available = status.available_replicas.unwrap_or(0);

    if desired == 0 {
        if available == 0 {
            JaegerNginxProxyStatus {
                ready: true,
                message: "Deployment scaled to 0 replicas".to_string(),
            }
        } else {
            JaegerNginxProxyStatus {
                ready: false,
                message: format!("Scaling down: {available} pods still running, desired: 0"),
            }
        }
    } else if available == desired {
        JaegerNginxProxyStatus { ready: true, message: format!("All {desired} pods are running") }
    } else {
        JaegerNginxProxyStatus {
            ready: false,
            message: format!(
                "Available replicas: {}/{}, Ready replicas: {}, Unavailable replicas: {}",
                available,
                desired,
                status.ready_replicas.unwrap_or(0),
                status.unavailable_replicas.unwrap_or(0)
            ),
        }
    }
}

impl JaegerNginxProxy {
    /// One convergence pass: ConfigMap, then Deployment, then status.
    ///
    /// A failed ConfigMap step returns before the Deployment is touched so a
    /// new image is never rolled out against a stale configuration.
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action, Error> {
        let ns = self.namespace().unwrap_or_else(|| "default".to_string());
        let name = self.name_any();

        let proxy_api: Api<JaegerNginxProxy> = Api::namespaced(ctx.client.clone(), &ns);
        let cm_api: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &ns);
        let dep_api: Api<Deployment> = Api::namespaced(ctx.client.clone(), &ns);

        let oref = self
            .controller_owner_ref(&())
            .ok_or_else(|| anyhow!("missing object metadata for owner reference"))?;

        let cm = build_config_map(self, &oref).map_err(|err| {
            error!("failed to build ConfigMap for {ns}/{name}: {err}");
            err
        })?;

        debug!("reconciling ConfigMap {ns}/{name}");
        match cm_api.get(&name).await {
            Err(err) if is_not_found(&err) => {
                info!("creating ConfigMap {ns}/{name}");
                cm_api.create(&post_params(), &cm).await?;
            }
            Err(err) => return Err(err.into()),
            Ok(mut existing) => {
                if existing.data != cm.data {
                    info!("ConfigMap data changed, updating {ns}/{name}");
                    existing.data = cm.data.clone();
                    match cm_api.replace(&name, &post_params(), &existing).await {
                        Err(err) if is_conflict(&err) => {
                            debug!("ConfigMap update conflict, requeuing {ns}/{name}");
                            return Ok(Action::requeue(CONFLICT_REQUEUE));
                        }
                        Err(err) => return Err(err.into()),
                        Ok(_) => {}
                    }
                } else {
                    debug!("ConfigMap is up to date: {ns}/{name}");
                }
            }
        }

        let desired = build_deployment(self, &oref);

        debug!("reconciling Deployment {ns}/{name}");
        match dep_api.get(&name).await {
            Err(err) if is_not_found(&err) => {
                info!("creating Deployment {ns}/{name}");
                dep_api.create(&post_params(), &desired).await?;
            }
            Err(err) => return Err(err.into()),
            Ok(mut existing) => {
                // Only replicas and the container image are converged; other
                // fields stay untouched so the Deployment controller and
                // unrelated edits are not fought over.
                let mut updated = false;

                let desired_replicas = desired.spec.as_ref().and_then(|spec| spec.replicas);
                if let Some(spec) = existing.spec.as_mut() {
                    if spec.replicas != desired_replicas {
                        spec.replicas = desired_replicas;
                        updated = true;
                    }
                }

                let desired_image = first_image(&desired);
                if first_image(&existing) != desired_image {
                    if let Some(container) = existing
                        .spec
                        .as_mut()
                        .and_then(|spec| spec.template.spec.as_mut())
                        .and_then(|spec| spec.containers.first_mut())
                    {
                        container.image = desired_image;
                        updated = true;
                    }
                }

                if updated {
                    info!("Deployment drifted from spec, updating {ns}/{name}");
                    match dep_api.replace(&name, &post_params(), &existing).await {
                        Err(err) if is_conflict(&err) => {
                            debug!("Deployment update conflict, requeuing {ns}/{name}");
                            return Ok(Action::requeue(CONFLICT_REQUEUE));
                        }
                        Err(err) => return Err(err.into()),
                        Ok(_) => {}
                    }
                }
            }
        }

        let status = match dep_api.get(&name).await {
            Ok(dep) => deployment_status(Some(&dep)),
            Err(err) if is_not_found(&err) => deployment_status(None),
            Err(err) => return Err(err.into()),
        };

        info!(
            "setting status for {ns}/{name}: ready={} message={:?}",
            status.ready, status.message
        );

        let mut latest = self.clone();
        latest.status = Some(status);
        let payload =
            serde_json::to_vec(&latest).map_err(|err| anyhow!("serialize status: {err}"))?;
        match proxy_api.replace_status(&name, &post_params(), payload).await {
            Err(err) if is_conflict(&err) => {
                debug!("status update conflict, requeuing {ns}/{name}");
                return Ok(Action::requeue(CONFLICT_REQUEUE));
            }
            Err(err) => return Err(err.into()),
            Ok(_) => debug!("status updated for {ns}/{name}"),
        }

        Ok(Action::requeue(STEADY_REQUEUE))
    }

    /// Proactively remove both children. Owner references would garbage
    /// collect them eventually, but deletion notifications are not ordered,
    /// and Delete-NotFound is benign either way.
    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action, Error> {
        let ns = self.namespace().unwrap_or_else(|| "default".to_string());
        let name = self.name_any();

        info!("JaegerNginxProxy deleted: {ns}/{name}, removing children");

        let cm_api: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &ns);
        match cm_api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => debug!("deleted ConfigMap {ns}/{name}"),
            Err(err) if is_not_found(&err) => {}
            Err(err) => return Err(err.into()),
        }

        let dep_api: Api<Deployment> = Api::namespaced(ctx.client.clone(), &ns);
        match dep_api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => debug!("deleted Deployment {ns}/{name}"),
            Err(err) if is_not_found(&err) => {}
            Err(err) => return Err(err.into()),
        }

        Ok(Action::await_change())
    }
}

async fn reconcile(obj: Arc<JaegerNginxProxy>, ctx: Arc<Context>) -> Result<Action, Error> {
    ctx.diagnostics.write().await.last_event = Utc::now();
    let _measure = ctx.metrics.count_and_measure();

    let ns = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<JaegerNginxProxy> = Api::namespaced(ctx.client.clone(), &ns);

    finalizer(&api, PROXY_FINALIZER, obj, |event| async {
        match event {
            FinalizerEvent::Apply(proxy) => proxy.reconcile(ctx.clone()).await,
            FinalizerEvent::Cleanup(proxy) => proxy.cleanup(ctx.clone()).await,
        }
    })
    .await
    .map_err(|err| Error::FinalizerError(Box::new(err)))
}

fn error_policy(_obj: Arc<JaegerNginxProxy>, err: &Error, ctx: Arc<Context>) -> Action {
    error!("reconcile failed: {err}");
    ctx.metrics.reconcile_failure(err);
    Action::requeue(Duration::from_secs(15))
}

/// Run the proxy controller until the token fires.
///
/// Child Deployments and ConfigMaps are secondary watches: a change to
/// either enqueues the owning proxy. Concurrency is pinned to one so event
/// ordering in logs stays reproducible.
pub async fn run(
    ctx: Arc<Context>,
    target_namespace: Option<&str>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let client = ctx.client.clone();

    let proxy_api: Api<JaegerNginxProxy> = match target_namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let dep_api: Api<Deployment> = match target_namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let cm_api: Api<ConfigMap> = match target_namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        let _ = shutdown_tx.send(());
    });

    Controller::new(proxy_api, watcher::Config::default())
        .owns(dep_api, watcher::Config::default())
        .owns(cm_api, watcher::Config::default())
        .with_config(ControllerConfig::default().concurrency(1))
        .graceful_shutdown_on(shutdown_rx.map(|_| ()))
        .run(reconcile, error_policy, ctx.clone())
        .for_each(|res| async move {
            match res {
                Ok(o) => info!("reconciled proxy {:?}", o),
                Err(e) => warn!("reconcile proxy failed: {:?}", e),
            }
        })
        .await;

    Ok(())
}
