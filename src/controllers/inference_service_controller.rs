/*
* File: src/controllers/inference_service_controller.rs
*
* Reconciliation logic for the InferenceService custom resource. A service
* converges through ordered steps: TLS secret validation, resolution of the
* referenced CachedModel (whose resolved configuration is copied into this
* status), creation of the ClusterIP Service, the metrics scrape target and
* the autoscaler, and finally the worker-job fleet.
*
* The fleet step is where the serving capacity lives: a pool of ephemeral
* distributed AscendJob instances, grown and shrunk towards spec.replicas.
* The pure scaling primitives live in fleet.rs; this file wires them to the
* API server (list, create, delete, re-list after mutation) and folds the
* aggregated tally into status.
*
* As with the model controller, a pass buffers all status changes and
* persists them with one merge patch, even when a step failed.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
    MetricIdentifier, MetricSpec, MetricTarget, PodsMetricSource,
};
use k8s_openapi::api::core::v1::{EnvVar, Secret, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{
    ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, ObjectMeta, Patch,
    PatchParams, PostParams,
};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::{Api, Resource, ResourceExt};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::controllers::fleet::{self, FleetError, ScalePlan};
use crate::controllers::parser;
use crate::controllers::utils::{self, set_condition};
use crate::crds::{
    CachedModel, CachedModelState, Condition, InferenceService, InferenceServiceState,
    InferenceServiceStatus, MetricsType,
};
use crate::Context;

pub const FINALIZER: &str = "finalizer.inferenceservice.apps.ascend.com";

/// Serving container and its endpoint port names.
const SERVING_CONTAINER: &str = "ascend";
const JOB_PORT_NAME: &str = "ascendjob-port";
const SERVICE_PORT_NAME: &str = "service-port";
const METRICS_PORT_NAME: &str = "service-metrics-port";

/// Scrape path exposed by the serving runtime.
const METRICS_PATH: &str = "/v1/metrics";

/// Accelerator resource requested per worker card.
const ACCELERATOR_RESOURCE: &str = "huawei.com/ascend-1980";
/// Node label keying the target server profile.
const SERVER_TYPE_NODE_LABEL: &str = "mis.ascend.io/server-type";

/// Where the model cache PVC is mounted inside serving containers.
const MODEL_MOUNT_PATH: &str = "/opt/mis-management/";
/// Where the TLS secret is projected, and the env vars pointing into it.
const TLS_MOUNT_PATH: &str = "/etc/mis/tls";
const TLS_CERT_ENV: &str = "MIS_SSL_CERTFILE";
const TLS_KEY_ENV: &str = "MIS_SSL_KEYFILE";

/// Host environment never forwarded into serving containers.
const ENV_DENYLIST: &[&str] = &[
    "http_proxy",
    "https_proxy",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "TORCH_DEVICE_BACKEND_AUTOLOAD",
];

// Condition types attached to InferenceService status.
const CONDITION_TLS_SECRET_READY: &str = "MIS_SVC_TLS_SECRET_READY";
const CONDITION_MODEL_READY: &str = "MIS_SVC_MODEL_READY";
const CONDITION_SERVICE_CREATED: &str = "MIS_SVC_SERVICE_CREATED";
const CONDITION_SERVICE_MONITOR_CREATED: &str = "MIS_SVC_SERVICE_MONITOR_CREATED";
const CONDITION_HPA_CREATED: &str = "MIS_SVC_HPA_CREATED";
const CONDITION_JOB_RECONCILING: &str = "MIS_SVC_ACJOB_RECONCILING";
const CONDITION_JOB_READY: &str = "MIS_SVC_ACJOB_READY";
const CONDITION_JOB_FAILED: &str = "MIS_SVC_ACJOB_FAILED";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Fleet(#[from] FleetError),

    #[error("serializing sub-resource failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("InferenceService is missing {0}")]
    MissingMetadata(&'static str),

    #[error("tls secret is not usable: {0}")]
    InvalidTlsSecret(String),

    #[error("resolved model status is missing {0}")]
    IncompleteModelStatus(&'static str),

    #[error("finalizer processing failed: {0}")]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<Error>>),
}

pub async fn reconcile(svc: Arc<InferenceService>, ctx: Arc<Context>) -> Result<Action, Error> {
    let ns = svc.namespace().ok_or(Error::MissingMetadata("namespace"))?;
    let services: Api<InferenceService> = Api::namespaced(ctx.client.clone(), &ns);

    finalizer(&services, FINALIZER, svc, |event| async {
        match event {
            FinalizerEvent::Apply(s) => apply(s, ctx.clone()).await,
            FinalizerEvent::Cleanup(s) => cleanup(s, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

pub fn on_error(svc: Arc<InferenceService>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(service = %svc.name_any(), %error, "Reconcile InferenceService failed");
    Action::requeue(Duration::from_secs(15))
}

async fn apply(svc: Arc<InferenceService>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = svc.name_any();
    let ns = svc.namespace().ok_or(Error::MissingMetadata("namespace"))?;
    info!(service = %name, namespace = %ns, "Start reconciling");

    let mut status = svc.status.clone().unwrap_or_default();
    status.state = Some(InferenceServiceState::Started);

    let outcome = run_steps(&svc, &mut status, &ctx).await;

    let services: Api<InferenceService> = Api::namespaced(ctx.client.clone(), &ns);
    patch_status(&services, &name, &status).await?;

    match outcome {
        Ok(Some(requeue)) => Ok(requeue),
        Ok(None) => {
            info!(service = %name, "Reconciling succeeded");
            Ok(Action::await_change())
        }
        Err(e) => {
            ctx.publish_event(
                svc.object_ref(&()),
                EventType::Warning,
                "Reconcile",
                format!("Reconcile InferenceService failed with err: {}", e),
            )
            .await;
            Err(e)
        }
    }
}

/// Worker jobs, the Service, the monitor and the HPA all carry an owner
/// reference, so deletion cascades without explicit teardown here.
async fn cleanup(svc: Arc<InferenceService>, _ctx: Arc<Context>) -> Result<Action, Error> {
    info!(service = %svc.name_any(), "InferenceService deleted, releasing finalizer");
    Ok(Action::await_change())
}

async fn run_steps(
    svc: &InferenceService,
    status: &mut InferenceServiceStatus,
    ctx: &Context,
) -> Result<Option<Action>, Error> {
    check_tls_secret(svc, status, ctx).await?;
    if let Some(requeue) = check_model(svc, status, ctx).await? {
        return Ok(Some(requeue));
    }
    reconcile_service(svc, status, ctx).await?;
    reconcile_service_monitor(svc, status, ctx).await?;
    reconcile_hpa(svc, status, ctx).await?;
    reconcile_fleet(svc, status, ctx).await
}

/// Step 1: a referenced TLS secret must exist, be of the right type and
/// carry both the certificate and the key before it can be projected. Any
/// violation, including absence, is a hard error: the secret is operator
/// input and retrying cannot repair it.
async fn check_tls_secret(
    svc: &InferenceService,
    status: &mut InferenceServiceStatus,
    ctx: &Context,
) -> Result<(), Error> {
    let secret_name = match svc.spec.tls_secret.as_deref() {
        Some(name) if !name.is_empty() => name,
        _ => return Ok(()),
    };

    let ns = svc.namespace().ok_or(Error::MissingMetadata("namespace"))?;
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &ns);

    let secret = secrets.get_opt(secret_name).await?;
    evaluate_tls_secret(secret_name, secret.as_ref()).map_err(Error::InvalidTlsSecret)?;
    mark_tls_ready(status);
    Ok(())
}

fn evaluate_tls_secret(name: &str, secret: Option<&Secret>) -> Result<(), String> {
    let secret = secret.ok_or_else(|| format!("tls secret '{}' not found", name))?;
    if secret.type_.as_deref() != Some("kubernetes.io/tls") {
        return Err(format!(
            "tls secret has type '{}', want 'kubernetes.io/tls'",
            secret.type_.as_deref().unwrap_or("")
        ));
    }
    let data = secret.data.as_ref().ok_or("tls secret carries no data")?;
    for key in ["tls.crt", "tls.key"] {
        if !data.contains_key(key) {
            return Err(format!("tls secret is missing key '{}'", key));
        }
    }
    Ok(())
}

fn mark_tls_ready(status: &mut InferenceServiceStatus) {
    status.state = Some(InferenceServiceState::TlsSecretReady);
    set_condition(
        &mut status.conditions,
        Condition::new(CONDITION_TLS_SECRET_READY, true, "TLSSecretReady", "tls secret is valid"),
    );
}

/// Step 2: resolve the referenced CachedModel and copy its resolved
/// configuration through. The service waits until the model is `Ready`.
async fn check_model(
    svc: &InferenceService,
    status: &mut InferenceServiceStatus,
    ctx: &Context,
) -> Result<Option<Action>, Error> {
    let ns = svc.namespace().ok_or(Error::MissingMetadata("namespace"))?;
    let models: Api<CachedModel> = Api::namespaced(ctx.client.clone(), &ns);

    let model = match models.get_opt(&svc.spec.cached_model).await? {
        Some(model) => model,
        None => {
            set_condition(
                &mut status.conditions,
                Condition::new(CONDITION_MODEL_READY, false, "ModelNotFound", "cached model not found"),
            );
            return Ok(Some(Action::requeue(Duration::from_secs(60))));
        }
    };

    let model_status = model.status.clone().unwrap_or_default();
    if model_status.state != Some(CachedModelState::Ready) {
        set_condition(
            &mut status.conditions,
            Condition::new(CONDITION_MODEL_READY, false, "ModelNotReady", "cached model is not ready"),
        );
        return Ok(Some(Action::requeue(Duration::from_secs(60))));
    }

    status.model = model_status.model.clone();
    status.pvc = model_status.pvc.clone();
    status.envs = model.spec.envs.clone();
    status.image = Some(model.spec.image.clone());
    status.image_pull_secret = model.spec.image_pull_secret.clone();
    status.server_info = model_status.server_info;
    status.state = Some(InferenceServiceState::ModelReady);
    set_condition(
        &mut status.conditions,
        Condition::new(CONDITION_MODEL_READY, true, "ModelReady", "cached model is ready"),
    );
    Ok(None)
}

/// Environment handed to serving containers, derived at job-build time from
/// the verbatim copy-through in status: proxy settings and backend-autoload
/// overrides are stripped, and TLS paths are injected when serving over TLS.
fn effective_envs(envs: &[EnvVar], tls: bool) -> Vec<EnvVar> {
    let mut out: Vec<EnvVar> = envs
        .iter()
        .filter(|e| !ENV_DENYLIST.contains(&e.name.as_str()))
        .cloned()
        .collect();

    if tls {
        out.push(EnvVar {
            name: TLS_CERT_ENV.to_string(),
            value: Some(format!("{}/tls.crt", TLS_MOUNT_PATH)),
            value_from: None,
        });
        out.push(EnvVar {
            name: TLS_KEY_ENV.to_string(),
            value: Some(format!("{}/tls.key", TLS_MOUNT_PATH)),
            value_from: None,
        });
    }

    out
}

/// Step 3: the ClusterIP Service fronting the serving pods.
async fn reconcile_service(
    svc: &InferenceService,
    status: &mut InferenceServiceStatus,
    ctx: &Context,
) -> Result<(), Error> {
    let ns = svc.namespace().ok_or(Error::MissingMetadata("namespace"))?;
    let services: Api<Service> = Api::namespaced(ctx.client.clone(), &ns);

    if services.get_opt(&svc.spec.service_spec.name).await?.is_none() {
        let desired = desired_service(svc)?;
        services.create(&PostParams::default(), &desired).await?;
        info!(service = %svc.name_any(), endpoint = %svc.spec.service_spec.name, "Create service success");
        ctx.publish_event(
            svc.object_ref(&()),
            EventType::Normal,
            "CreateService",
            "Create service success".to_string(),
        )
        .await;
    }

    status.state = Some(InferenceServiceState::ServiceCreated);
    set_condition(
        &mut status.conditions,
        Condition::new(CONDITION_SERVICE_CREATED, true, "ServiceCreated", "service is created"),
    );
    Ok(())
}

/// Step 4: the metrics scrape target for the serving endpoint, only when an
/// autoscaling policy asks for metrics.
async fn reconcile_service_monitor(
    svc: &InferenceService,
    status: &mut InferenceServiceStatus,
    ctx: &Context,
) -> Result<(), Error> {
    if svc.spec.hpa.is_none() {
        return Ok(());
    }

    let ns = svc.namespace().ok_or(Error::MissingMetadata("namespace"))?;
    let resource = service_monitor_api_resource();
    let monitors: Api<DynamicObject> = Api::namespaced_with(ctx.client.clone(), &ns, &resource);

    if monitors.get_opt(&svc.service_monitor_name()).await?.is_none() {
        let desired = desired_service_monitor(svc)?;
        monitors.create(&PostParams::default(), &desired).await?;
        info!(service = %svc.name_any(), monitor = %svc.service_monitor_name(), "Create service monitor success");
        ctx.publish_event(
            svc.object_ref(&()),
            EventType::Normal,
            "CreateServiceMonitor",
            "Create service monitor success".to_string(),
        )
        .await;
    }

    status.state = Some(InferenceServiceState::ServiceMonitorCreated);
    set_condition(
        &mut status.conditions,
        Condition::new(
            CONDITION_SERVICE_MONITOR_CREATED,
            true,
            "ServiceMonitorCreated",
            "service monitor is created",
        ),
    );
    Ok(())
}

/// Step 5: the autoscaler, only when an HPA policy is declared.
async fn reconcile_hpa(
    svc: &InferenceService,
    status: &mut InferenceServiceStatus,
    ctx: &Context,
) -> Result<(), Error> {
    if svc.spec.hpa.is_none() {
        return Ok(());
    }

    let ns = svc.namespace().ok_or(Error::MissingMetadata("namespace"))?;
    let hpas: Api<HorizontalPodAutoscaler> = Api::namespaced(ctx.client.clone(), &ns);

    if hpas.get_opt(&svc.hpa_name()).await?.is_none() {
        let desired = desired_hpa(svc)?;
        hpas.create(&PostParams::default(), &desired).await?;
        info!(service = %svc.name_any(), hpa = %svc.hpa_name(), "Create hpa success");
        ctx.publish_event(
            svc.object_ref(&()),
            EventType::Normal,
            "CreateHPA",
            "Create hpa success".to_string(),
        )
        .await;
    }

    status.state = Some(InferenceServiceState::HpaCreated);
    set_condition(
        &mut status.conditions,
        Condition::new(CONDITION_HPA_CREATED, true, "HPACreated", "hpa is created"),
    );
    Ok(())
}

/// Step 6: converge the worker-job fleet towards spec.replicas and fold the
/// observed tally into status.
async fn reconcile_fleet(
    svc: &InferenceService,
    status: &mut InferenceServiceStatus,
    ctx: &Context,
) -> Result<Option<Action>, Error> {
    let name = svc.name_any();
    let ns = svc.namespace().ok_or(Error::MissingMetadata("namespace"))?;
    let resource = fleet::job_api_resource();
    let jobs_api: Api<DynamicObject> = Api::namespaced_with(ctx.client.clone(), &ns, &resource);

    let selector = utils::label_selector(&utils::standard_labels(&name, utils::SERVICE_LABEL_PART_OF));
    let list_params = ListParams::default().labels(&selector);

    let jobs = jobs_api.list(&list_params).await?.items;

    // Retire completed instances that have outlived the grace window.
    let (mut working, expired) = fleet::split_expired(jobs, chrono::Utc::now())?;
    let mut mutated = !expired.is_empty();
    for job in expired {
        info!(service = %name, job = %job.name_any(), "Retire completed job");
        jobs_api.delete(&job.name_any(), &DeleteParams::default()).await?;
    }

    let target = svc.spec.replicas.max(0) as usize;
    match fleet::scale_plan(target, &working)? {
        ScalePlan::Grow(count) => {
            for _ in 0..count {
                let desired = desired_worker_job(svc, status)?;
                info!(service = %name, job = %desired.name_any(), "Create worker job");
                jobs_api.create(&PostParams::default(), &desired).await?;
            }
            ctx.publish_event(
                svc.object_ref(&()),
                EventType::Normal,
                "ScaleUp",
                format!("created {} worker job(s)", count),
            )
            .await;
            mutated = true;
        }
        ScalePlan::Shrink(names) => {
            for doomed in &names {
                info!(service = %name, job = %doomed, "Delete worker job");
                jobs_api.delete(doomed, &DeleteParams::default()).await?;
            }
            ctx.publish_event(
                svc.object_ref(&()),
                EventType::Normal,
                "ScaleDown",
                format!("deleted {} worker job(s)", names.len()),
            )
            .await;
            mutated = true;
        }
        ScalePlan::Hold => {}
    }

    // Aggregate over the post-mutation fleet so status reflects this pass.
    if mutated {
        working = jobs_api.list(&list_params).await?.items;
    }

    let tally = fleet::aggregate(&working)?;
    status.selector = Some(utils::service_selector_string(&name));
    let settled = apply_fleet_status(status, tally, target);

    if settled {
        Ok(None)
    } else {
        Ok(Some(Action::requeue(Duration::from_secs(60))))
    }
}

/// Fold a fleet tally into status. The state checks run in a fixed order
/// with later results overriding earlier ones: pending instances make the
/// service Waiting, any running instance promotes it to Ready, and any
/// failed instance forces Failed. Returns whether the running count has
/// reached the target.
fn apply_fleet_status(
    status: &mut InferenceServiceStatus,
    tally: fleet::FleetTally,
    target: usize,
) -> bool {
    status.replicas = Some(tally.running as i32);
    status.running = Some(format!("{}/{}", tally.running, tally.total));

    set_condition(
        &mut status.conditions,
        Condition::new(
            CONDITION_JOB_RECONCILING,
            tally.pending > 0,
            "FleetReconciling",
            &format!("{} worker job(s) pending", tally.pending),
        ),
    );
    set_condition(
        &mut status.conditions,
        Condition::new(
            CONDITION_JOB_READY,
            tally.running > 0,
            "FleetRunning",
            &format!("{} worker job(s) running", tally.running),
        ),
    );
    set_condition(
        &mut status.conditions,
        Condition::new(
            CONDITION_JOB_FAILED,
            tally.failed > 0,
            "WorkerJobFailed",
            &format!("{} worker job(s) failed", tally.failed),
        ),
    );

    if tally.pending > 0 {
        status.state = Some(InferenceServiceState::Waiting);
    }
    if tally.running > 0 {
        status.state = Some(InferenceServiceState::Ready);
    }
    if tally.failed > 0 {
        status.state = Some(InferenceServiceState::Failed);
    }

    tally.running == target
}

pub fn service_monitor_api_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("monitoring.coreos.com", "v1", "ServiceMonitor"))
}

/// Prometheus metric name for a declared metric type.
fn metric_name(type_: MetricsType) -> &'static str {
    match type_ {
        MetricsType::RequestRate => "http_requests_per_second",
        MetricsType::WaitRequest => "http_requests_wait_num",
        MetricsType::CpuKvCacheUtilization => "kv_cache_utilization_cpu",
        MetricsType::AcceleratorKvCacheUtilization => "kv_cache_utilization_accelerator",
    }
}

fn desired_service(svc: &InferenceService) -> Result<Service, Error> {
    let owner = svc.controller_owner_ref(&()).ok_or(Error::MissingMetadata("uid"))?;
    let endpoint = &svc.spec.service_spec;

    let mut ports = vec![ServicePort {
        name: Some(SERVICE_PORT_NAME.to_string()),
        port: endpoint.port,
        target_port: Some(k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(
            endpoint.port,
        )),
        ..Default::default()
    }];
    // The metrics port is only exposed when autoscaling needs to scrape it.
    if svc.spec.hpa.is_some() {
        ports.push(ServicePort {
            name: Some(METRICS_PORT_NAME.to_string()),
            port: endpoint.metrics_port,
            target_port: Some(k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(
                endpoint.metrics_port,
            )),
            ..Default::default()
        });
    }

    Ok(Service {
        metadata: ObjectMeta {
            name: Some(endpoint.name.clone()),
            namespace: svc.namespace(),
            labels: Some(utils::standard_labels(&svc.name_any(), utils::SERVICE_LABEL_PART_OF)),
            annotations: endpoint.annotations.clone(),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: endpoint.type_.clone(),
            selector: Some(utils::service_selector_labels(&svc.name_any())),
            ports: Some(ports),
            ..Default::default()
        }),
        status: None,
    })
}

fn desired_service_monitor(svc: &InferenceService) -> Result<DynamicObject, Error> {
    let owner = svc.controller_owner_ref(&()).ok_or(Error::MissingMetadata("uid"))?;
    let ns = svc.namespace().ok_or(Error::MissingMetadata("namespace"))?;

    let mut monitor =
        DynamicObject::new(&svc.service_monitor_name(), &service_monitor_api_resource()).within(&ns);
    monitor.metadata.labels = Some(utils::standard_labels(&svc.name_any(), utils::SERVICE_LABEL_PART_OF));
    monitor.metadata.owner_references = Some(vec![owner]);
    monitor.data = serde_json::json!({
        "spec": {
            "selector": {
                "matchLabels": utils::standard_labels(&svc.name_any(), utils::SERVICE_LABEL_PART_OF),
            },
            "endpoints": [{
                "port": METRICS_PORT_NAME,
                "path": METRICS_PATH,
            }],
        }
    });
    Ok(monitor)
}

fn desired_hpa(svc: &InferenceService) -> Result<HorizontalPodAutoscaler, Error> {
    let owner = svc.controller_owner_ref(&()).ok_or(Error::MissingMetadata("uid"))?;
    let hpa = svc.spec.hpa.as_ref().ok_or(Error::MissingMetadata("spec.hpa"))?;

    let metrics = hpa.metrics.as_ref().map(|metrics| {
        metrics
            .iter()
            .map(|metric| {
                let threshold = if parser::is_valid_quantity(&metric.threshold) {
                    metric.threshold.clone()
                } else {
                    warn!(
                        service = %svc.name_any(),
                        metric = metric_name(metric.type_),
                        threshold = %metric.threshold,
                        "Metric threshold is not a valid quantity, using 0"
                    );
                    "0".to_string()
                };
                MetricSpec {
                    type_: "Pods".to_string(),
                    pods: Some(PodsMetricSource {
                        metric: MetricIdentifier {
                            name: metric_name(metric.type_).to_string(),
                            selector: None,
                        },
                        target: MetricTarget {
                            type_: "AverageValue".to_string(),
                            average_value: Some(Quantity(threshold)),
                            ..Default::default()
                        },
                    }),
                    ..Default::default()
                }
            })
            .collect()
    });

    Ok(HorizontalPodAutoscaler {
        metadata: ObjectMeta {
            name: Some(svc.hpa_name()),
            namespace: svc.namespace(),
            labels: Some(utils::standard_labels(&svc.name_any(), utils::SERVICE_LABEL_PART_OF)),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps.ascend.com/v1alpha1".to_string()),
                kind: "InferenceService".to_string(),
                name: svc.name_any(),
            },
            min_replicas: Some(hpa.min_replicas),
            max_replicas: hpa.max_replicas,
            metrics,
            behavior: hpa.behavior.clone(),
        }),
        status: None,
    })
}

/// Build one worker-job instance. The serving container mounts the model
/// cache, shared memory and host time, is pinned to the resolved server type
/// and requests one accelerator per card.
fn desired_worker_job(
    svc: &InferenceService,
    status: &InferenceServiceStatus,
) -> Result<DynamicObject, Error> {
    let owner = svc.controller_owner_ref(&()).ok_or(Error::MissingMetadata("uid"))?;
    let ns = svc.namespace().ok_or(Error::MissingMetadata("namespace"))?;
    let name = svc.name_any();

    let image = status.image.as_ref().ok_or(Error::IncompleteModelStatus("image"))?;
    let pvc = status.pvc.as_ref().ok_or(Error::IncompleteModelStatus("pvc"))?;
    let server_info = status
        .server_info
        .as_ref()
        .filter(|info| !info.server_type.is_empty())
        .ok_or(Error::IncompleteModelStatus("serverInfo"))?;

    let mut pod_labels = utils::standard_labels(&name, utils::SERVICE_LABEL_PART_OF);
    pod_labels.extend(utils::service_selector_labels(&name));

    // One accelerator resource entry per card, merged over the user's
    // resource requirements.
    let mut resources = svc.spec.resources.clone().unwrap_or_default();
    let cards = Quantity(server_info.card_num.to_string());
    resources
        .limits
        .get_or_insert_with(Default::default)
        .insert(ACCELERATOR_RESOURCE.to_string(), cards.clone());
    resources
        .requests
        .get_or_insert_with(Default::default)
        .insert(ACCELERATOR_RESOURCE.to_string(), cards);

    let tls = svc.spec.tls_secret.is_some();

    let mut volume_mounts = serde_json::json!([
        { "name": "model", "mountPath": MODEL_MOUNT_PATH },
        { "name": "dshm", "mountPath": "/dev/shm" },
        { "name": "localtime", "mountPath": "/etc/localtime", "readOnly": true },
    ]);
    let mut volumes = serde_json::json!([
        { "name": "model", "persistentVolumeClaim": { "claimName": pvc } },
        { "name": "dshm", "emptyDir": { "medium": "Memory" } },
        { "name": "localtime", "hostPath": { "path": "/etc/localtime" } },
    ]);
    if tls {
        let secret = svc.spec.tls_secret.as_ref().ok_or(Error::MissingMetadata("spec.tlsSecret"))?;
        volume_mounts
            .as_array_mut()
            .ok_or(Error::IncompleteModelStatus("volumeMounts"))?
            .push(serde_json::json!({ "name": "tls", "mountPath": TLS_MOUNT_PATH, "readOnly": true }));
        volumes
            .as_array_mut()
            .ok_or(Error::IncompleteModelStatus("volumes"))?
            .push(serde_json::json!({ "name": "tls", "secret": { "secretName": secret } }));
    }

    let mut container = serde_json::json!({
        "name": SERVING_CONTAINER,
        "image": image,
        "imagePullPolicy": "IfNotPresent",
        "stdin": true,
        "tty": true,
        "env": effective_envs(&status.envs, tls),
        "ports": [{ "name": JOB_PORT_NAME, "containerPort": svc.spec.service_spec.port }],
        "resources": resources,
        "volumeMounts": volume_mounts,
    });
    if let Some(probe) = &svc.spec.startup_probe {
        container["startupProbe"] = serde_json::to_value(probe)?;
    }
    if let Some(probe) = &svc.spec.readiness_probe {
        container["readinessProbe"] = serde_json::to_value(probe)?;
    }
    if let Some(probe) = &svc.spec.liveness_probe {
        container["livenessProbe"] = serde_json::to_value(probe)?;
    }

    let mut pod_spec = serde_json::json!({
        "schedulerName": "volcano",
        "terminationGracePeriodSeconds": 300,
        "nodeSelector": { (SERVER_TYPE_NODE_LABEL): server_info.server_type },
        "containers": [container],
        "volumes": volumes,
    });
    if let Some(secret) = &status.image_pull_secret {
        pod_spec["imagePullSecrets"] = serde_json::json!([{ "name": secret }]);
    }
    if svc.spec.user_id.is_some() || svc.spec.group_id.is_some() {
        let mut security = serde_json::Map::new();
        if let Some(uid) = svc.spec.user_id {
            security.insert("runAsUser".to_string(), uid.into());
        }
        if let Some(gid) = svc.spec.group_id {
            security.insert("runAsGroup".to_string(), gid.into());
        }
        pod_spec["securityContext"] = serde_json::Value::Object(security);
    }

    let mut job =
        DynamicObject::new(&fleet::job_instance_name(&name), &fleet::job_api_resource()).within(&ns);
    job.metadata.labels = Some(utils::standard_labels(&name, utils::SERVICE_LABEL_PART_OF));
    job.metadata.owner_references = Some(vec![owner]);
    job.data = serde_json::json!({
        "spec": {
            "schedulerName": "volcano",
            "successPolicy": "AllWorkers",
            "runPolicy": {
                "schedulingPolicy": { "minAvailable": 1, "queue": "default" },
            },
            "replicaSpecs": {
                (fleet::PRIMARY_ROLE): {
                    "replicas": 1,
                    "restartPolicy": "Never",
                    "template": {
                        "metadata": { "labels": pod_labels },
                        "spec": pod_spec,
                    },
                },
            },
        }
    });
    Ok(job)
}

async fn patch_status(
    services: &Api<InferenceService>,
    name: &str,
    status: &InferenceServiceStatus,
) -> Result<(), Error> {
    let patch = serde_json::json!({ "status": status });
    services
        .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::fleet::FleetTally;
    use crate::crds::{EndpointSpec, Hpa, InferenceServiceSpec, Metric, ServerInfo};
    use k8s_openapi::ByteString;

    fn test_service() -> InferenceService {
        InferenceService {
            metadata: ObjectMeta {
                name: Some("chat".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("svc-123".to_string()),
                ..Default::default()
            },
            spec: InferenceServiceSpec {
                cached_model: "llama".to_string(),
                replicas: 2,
                hpa: None,
                service_spec: EndpointSpec {
                    name: "chat-endpoint".to_string(),
                    port: 8000,
                    metrics_port: 8001,
                    type_: None,
                    annotations: None,
                },
                tls_secret: None,
                resources: None,
                startup_probe: None,
                readiness_probe: None,
                liveness_probe: None,
                user_id: Some(1000),
                group_id: Some(1000),
            },
            status: None,
        }
    }

    fn resolved_status() -> InferenceServiceStatus {
        InferenceServiceStatus {
            image: Some("mis:latest".to_string()),
            pvc: Some("llama-weights".to_string()),
            server_info: Some(ServerInfo {
                server_type: "atlas800ia2".to_string(),
                card_num: 4,
                card_memory: "32G".to_string(),
            }),
            ..Default::default()
        }
    }

    fn env(name: &str, value: &str) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            value_from: None,
        }
    }

    #[test]
    fn metric_names_follow_exporter_vocabulary() {
        assert_eq!(metric_name(MetricsType::RequestRate), "http_requests_per_second");
        assert_eq!(metric_name(MetricsType::WaitRequest), "http_requests_wait_num");
        assert_eq!(metric_name(MetricsType::CpuKvCacheUtilization), "kv_cache_utilization_cpu");
        assert_eq!(
            metric_name(MetricsType::AcceleratorKvCacheUtilization),
            "kv_cache_utilization_accelerator"
        );
    }

    #[test]
    fn effective_envs_strips_denylisted_names() {
        let envs = vec![
            env("MODEL_ARGS", "--foo"),
            env("http_proxy", "proxy:3128"),
            env("HTTPS_PROXY", "proxy:3128"),
            env("TORCH_DEVICE_BACKEND_AUTOLOAD", "1"),
        ];
        let out = effective_envs(&envs, false);
        let names: Vec<_> = out.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["MODEL_ARGS"]);
    }

    #[test]
    fn effective_envs_injects_tls_paths() {
        let out = effective_envs(&[], true);
        let names: Vec<_> = out.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["MIS_SSL_CERTFILE", "MIS_SSL_KEYFILE"]);
        assert_eq!(out[0].value.as_deref(), Some("/etc/mis/tls/tls.crt"));
        assert_eq!(out[1].value.as_deref(), Some("/etc/mis/tls/tls.key"));
    }

    #[test]
    fn tls_secret_violations_are_rejected() {
        // Absence is a violation like any other, not a waiting state.
        assert!(evaluate_tls_secret("chat-tls", None).unwrap_err().contains("not found"));

        let mut secret = Secret::default();
        assert!(evaluate_tls_secret("chat-tls", Some(&secret)).is_err());

        secret.type_ = Some("kubernetes.io/tls".to_string());
        secret.data = Some(
            [("tls.crt".to_string(), ByteString(b"cert".to_vec()))]
                .into_iter()
                .collect(),
        );
        assert!(evaluate_tls_secret("chat-tls", Some(&secret))
            .unwrap_err()
            .contains("tls.key"));

        secret
            .data
            .as_mut()
            .unwrap()
            .insert("tls.key".to_string(), ByteString(b"key".to_vec()));
        assert!(evaluate_tls_secret("chat-tls", Some(&secret)).is_ok());
    }

    #[test]
    fn tls_success_records_state_and_condition() {
        let mut status = InferenceServiceStatus::default();
        mark_tls_ready(&mut status);
        assert_eq!(status.state, Some(InferenceServiceState::TlsSecretReady));
        let condition = status
            .conditions
            .iter()
            .find(|c| c.type_ == "MIS_SVC_TLS_SECRET_READY")
            .unwrap();
        assert_eq!(condition.status, "True");
    }

    #[test]
    fn desired_service_has_stable_selector_and_serving_port() {
        let service = desired_service(&test_service()).unwrap();
        assert_eq!(service.metadata.name.as_deref(), Some("chat-endpoint"));
        let spec = service.spec.unwrap();
        assert_eq!(spec.selector.unwrap()["mis-service"], "chat");
        let ports = spec.ports.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].name.as_deref(), Some("service-port"));
        assert_eq!(ports[0].port, 8000);
    }

    #[test]
    fn desired_service_adds_metrics_port_when_autoscaling() {
        let mut svc = test_service();
        svc.spec.hpa = Some(Hpa {
            min_replicas: 1,
            max_replicas: 3,
            metrics: None,
            behavior: None,
        });
        let service = desired_service(&svc).unwrap();
        let ports = service.spec.unwrap().ports.unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[1].name.as_deref(), Some("service-metrics-port"));
        assert_eq!(ports[1].port, 8001);
    }

    #[test]
    fn desired_service_monitor_scrapes_metrics_path() {
        let monitor = desired_service_monitor(&test_service()).unwrap();
        assert_eq!(monitor.metadata.name.as_deref(), Some("chat-service-monitor"));
        let endpoint = &monitor.data["spec"]["endpoints"][0];
        assert_eq!(endpoint["port"], "service-metrics-port");
        assert_eq!(endpoint["path"], "/v1/metrics");
    }

    #[test]
    fn desired_hpa_maps_metrics_and_falls_back_on_bad_threshold() {
        let mut svc = test_service();
        svc.spec.hpa = Some(Hpa {
            min_replicas: 1,
            max_replicas: 5,
            metrics: Some(vec![
                Metric {
                    type_: MetricsType::RequestRate,
                    threshold: "100".to_string(),
                },
                Metric {
                    type_: MetricsType::WaitRequest,
                    threshold: "lots".to_string(),
                },
            ]),
            behavior: None,
        });

        let hpa = desired_hpa(&svc).unwrap();
        assert_eq!(hpa.metadata.name.as_deref(), Some("chat-horizontal-pod-autoscaling"));
        let spec = hpa.spec.unwrap();
        assert_eq!(spec.max_replicas, 5);
        let metrics = spec.metrics.unwrap();

        let first = metrics[0].pods.as_ref().unwrap();
        assert_eq!(first.metric.name, "http_requests_per_second");
        assert_eq!(first.target.average_value.as_ref().unwrap().0, "100");

        let second = metrics[1].pods.as_ref().unwrap();
        assert_eq!(second.metric.name, "http_requests_wait_num");
        assert_eq!(second.target.average_value.as_ref().unwrap().0, "0");
    }

    #[test]
    fn desired_worker_job_pins_profile_and_gang_scheduling() {
        let svc = test_service();
        let job = desired_worker_job(&svc, &resolved_status()).unwrap();

        assert!(job.metadata.name.as_deref().unwrap().starts_with("chat-"));
        let spec = &job.data["spec"];
        assert_eq!(spec["schedulerName"], "volcano");
        assert_eq!(spec["successPolicy"], "AllWorkers");
        assert_eq!(spec["runPolicy"]["schedulingPolicy"]["minAvailable"], 1);
        assert_eq!(spec["runPolicy"]["schedulingPolicy"]["queue"], "default");

        let master = &spec["replicaSpecs"]["Master"];
        assert_eq!(master["replicas"], 1);
        let pod = &master["template"]["spec"];
        assert_eq!(pod["terminationGracePeriodSeconds"], 300);
        assert_eq!(pod["nodeSelector"]["mis.ascend.io/server-type"], "atlas800ia2");
        assert_eq!(pod["securityContext"]["runAsUser"], 1000);

        let container = &pod["containers"][0];
        assert_eq!(container["name"], "ascend");
        assert_eq!(container["ports"][0]["name"], "ascendjob-port");
        assert_eq!(container["resources"]["limits"]["huawei.com/ascend-1980"], "4");
        assert_eq!(container["resources"]["requests"]["huawei.com/ascend-1980"], "4");

        let pod_labels = &master["template"]["metadata"]["labels"];
        assert_eq!(pod_labels["mis-service"], "chat");
    }

    #[test]
    fn worker_job_env_is_derived_at_build_time() {
        // Status carries the model environment verbatim; the denylist only
        // applies when the job is built.
        let svc = test_service();
        let mut status = resolved_status();
        status.envs = vec![env("MODEL_ARGS", "--foo"), env("http_proxy", "proxy:3128")];

        let job = desired_worker_job(&svc, &status).unwrap();
        let envs = job.data["spec"]["replicaSpecs"]["Master"]["template"]["spec"]["containers"][0]
            ["env"]
            .as_array()
            .unwrap();
        let names: Vec<_> = envs.iter().map(|e| e["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["MODEL_ARGS"]);

        assert_eq!(status.envs.len(), 2);
        assert_eq!(status.envs[1].name, "http_proxy");
    }

    #[test]
    fn desired_worker_job_projects_tls_secret() {
        let mut svc = test_service();
        svc.spec.tls_secret = Some("chat-tls".to_string());
        let status = resolved_status();

        let job = desired_worker_job(&svc, &status).unwrap();
        let pod = &job.data["spec"]["replicaSpecs"]["Master"]["template"]["spec"];

        let volumes = pod["volumes"].as_array().unwrap();
        let tls_volume = volumes.iter().find(|v| v["name"] == "tls").unwrap();
        assert_eq!(tls_volume["secret"]["secretName"], "chat-tls");

        let mounts = pod["containers"][0]["volumeMounts"].as_array().unwrap();
        assert!(mounts.iter().any(|m| m["mountPath"] == "/etc/mis/tls"));

        let envs = pod["containers"][0]["env"].as_array().unwrap();
        assert!(envs.iter().any(|e| e["name"] == "MIS_SSL_CERTFILE"));
    }

    #[test]
    fn desired_worker_job_requires_resolved_model() {
        let svc = test_service();
        assert!(matches!(
            desired_worker_job(&svc, &InferenceServiceStatus::default()),
            Err(Error::IncompleteModelStatus(_))
        ));
    }

    #[test]
    fn fleet_status_pending_only_is_waiting() {
        let mut status = InferenceServiceStatus::default();
        let settled = apply_fleet_status(
            &mut status,
            FleetTally { total: 2, running: 0, failed: 0, pending: 2 },
            2,
        );
        assert!(!settled);
        assert_eq!(status.state, Some(InferenceServiceState::Waiting));
        assert_eq!(status.running.as_deref(), Some("0/2"));
    }

    #[test]
    fn fleet_status_running_overrides_waiting() {
        let mut status = InferenceServiceStatus::default();
        let settled = apply_fleet_status(
            &mut status,
            FleetTally { total: 2, running: 1, failed: 0, pending: 1 },
            2,
        );
        // One running and one pending: Ready wins, but convergence has not
        // been reached so the pass still requeues.
        assert!(!settled);
        assert_eq!(status.state, Some(InferenceServiceState::Ready));
        assert_eq!(status.replicas, Some(1));

        let settled = apply_fleet_status(
            &mut status,
            FleetTally { total: 2, running: 2, failed: 0, pending: 0 },
            2,
        );
        assert!(settled);
        assert_eq!(status.state, Some(InferenceServiceState::Ready));
        assert_eq!(status.running.as_deref(), Some("2/2"));
    }

    #[test]
    fn fleet_status_failed_overrides_everything() {
        let mut status = InferenceServiceStatus::default();
        apply_fleet_status(
            &mut status,
            FleetTally { total: 3, running: 1, failed: 1, pending: 1 },
            2,
        );
        assert_eq!(status.state, Some(InferenceServiceState::Failed));
        let failed = status
            .conditions
            .iter()
            .find(|c| c.type_ == "MIS_SVC_ACJOB_FAILED")
            .unwrap();
        assert_eq!(failed.status, "True");
        let ready = status
            .conditions
            .iter()
            .find(|c| c.type_ == "MIS_SVC_ACJOB_READY")
            .unwrap();
        assert_eq!(ready.status, "True");
    }
}
