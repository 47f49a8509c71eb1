/*
* File: src/controllers/cached_model_controller.rs
*
* Reconciliation logic for the CachedModel custom resource. The controller
* converges each CachedModel through an ordered sequence of idempotent steps:
* image-pull-secret check, PVC provisioning, then the download-pod lifecycle.
* Once the download pod succeeds, the served model's name and server profile
* are extracted from its logs and the resource reaches `Ready`, at which point
* InferenceServices referencing it may proceed.
*
* Each step either completes (advancing `status.state` monotonically),
* requests a timed requeue (not-yet-ready conditions are not errors), or
* fails hard (store failures and malformed collaborator data). All status
* mutations of a pass are buffered on an in-memory status value and persisted
* with a single merge patch, attempted even when a step errored, so partial
* progress stays observable.
*
* Sub-resources (PVC, download pod) carry an owner reference to the
* CachedModel, so deleting the model cascades through the store's garbage
* collector; the finalizer only gates removal until that point.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{
    Container, LocalObjectReference, PersistentVolumeClaim, PersistentVolumeClaimSpec, Pod,
    PodSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{LogParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::{Api, Resource, ResourceExt};
use thiserror::Error;
use tracing::{error, info};

use crate::controllers::parser::{self, ParseError};
use crate::controllers::utils::{self, set_condition};
use crate::crds::{CachedModel, CachedModelState, CachedModelStatus, Condition};
use crate::Context;

pub const FINALIZER: &str = "finalizer.cachedmodel.apps.ascend.com";

/// Container name inside the download pod; also consulted when extracting
/// the terminated-state message on failure.
const DOWNLOAD_CONTAINER: &str = "downloader";
/// Fixed download command baked into the model image.
const DOWNLOAD_COMMAND: &str = "mis_download";
/// Volume name and cache path under which the PVC is mounted.
const MODEL_VOLUME: &str = "model-path";
const MODEL_MOUNT_PATH: &str = "/opt/mis-management/";

// Condition types attached to CachedModel status.
const CONDITION_SECRET_EXIST: &str = "MIS_MODEL_SECRET_EXIST";
const CONDITION_PVC_READY: &str = "MIS_MODEL_PVC_READY";
const CONDITION_POD_CREATE: &str = "MIS_MODEL_POD_CREATE";
const CONDITION_POD_RUNNING: &str = "MIS_MODEL_POD_RUNNING";
const CONDITION_POD_COMPLETE: &str = "MIS_MODEL_POD_COMPLETE";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("log parsing failed: {0}")]
    Parse(#[from] ParseError),

    #[error("CachedModel is missing {0}")]
    MissingMetadata(&'static str),

    #[error("download pod found in unknown status.phase '{0}'")]
    UnknownPodPhase(String),

    #[error("download pod has no terminated status for container '{DOWNLOAD_CONTAINER}'")]
    MissingTerminatedState,

    #[error("finalizer processing failed: {0}")]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<Error>>),
}

/// Main reconciliation entry point, driven by the controller runtime.
pub async fn reconcile(model: Arc<CachedModel>, ctx: Arc<Context>) -> Result<Action, Error> {
    let ns = model.namespace().ok_or(Error::MissingMetadata("namespace"))?;
    let models: Api<CachedModel> = Api::namespaced(ctx.client.clone(), &ns);

    finalizer(&models, FINALIZER, model, |event| async {
        match event {
            FinalizerEvent::Apply(m) => apply(m, ctx.clone()).await,
            FinalizerEvent::Cleanup(m) => cleanup(m, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

/// Error handler for the controller runtime: log and retry after a delay.
pub fn on_error(model: Arc<CachedModel>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(model = %model.name_any(), %error, "Reconcile CachedModel failed");
    Action::requeue(Duration::from_secs(15))
}

async fn apply(model: Arc<CachedModel>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = model.name_any();
    let ns = model.namespace().ok_or(Error::MissingMetadata("namespace"))?;
    info!(model = %name, namespace = %ns, "Start reconciling");

    let mut status = model.status.clone().unwrap_or_default();
    status.state = Some(CachedModelState::Started);

    let outcome = run_steps(&model, &mut status, &ctx).await;

    let models: Api<CachedModel> = Api::namespaced(ctx.client.clone(), &ns);
    patch_status(&models, &name, &status).await?;

    match outcome {
        Ok(Some(requeue)) => Ok(requeue),
        Ok(None) => {
            info!(model = %name, "Reconciling succeeded");
            Ok(Action::await_change())
        }
        Err(e) => {
            ctx.publish_event(
                model.object_ref(&()),
                EventType::Warning,
                "Reconcile",
                format!("Reconcile CachedModel failed with err: {}", e),
            )
            .await;
            Err(e)
        }
    }
}

/// Owned sub-resources are garbage collected through their owner references,
/// so releasing the finalizer is all that is left to do.
async fn cleanup(model: Arc<CachedModel>, _ctx: Arc<Context>) -> Result<Action, Error> {
    info!(model = %model.name_any(), "CachedModel deleted, releasing finalizer");
    Ok(Action::await_change())
}

/// Execute the convergence steps strictly in the declared order. A step that
/// reports "not ready" short-circuits all later steps in this pass.
async fn run_steps(
    model: &CachedModel,
    status: &mut CachedModelStatus,
    ctx: &Context,
) -> Result<Option<Action>, Error> {
    if let Some(requeue) = check_secret(model, status, ctx).await? {
        return Ok(Some(requeue));
    }
    if let Some(requeue) = reconcile_pvc(model, status, ctx).await? {
        return Ok(Some(requeue));
    }
    if let Some(requeue) = reconcile_download_pod(model, status, ctx).await? {
        return Ok(Some(requeue));
    }
    Ok(None)
}

/// Step 1: when an image pull secret is referenced it must exist before any
/// pod can be scheduled with it.
async fn check_secret(
    model: &CachedModel,
    status: &mut CachedModelStatus,
    ctx: &Context,
) -> Result<Option<Action>, Error> {
    let secret_name = match model.spec.image_pull_secret.as_deref() {
        Some(name) if !name.is_empty() => name,
        _ => return Ok(None),
    };

    let ns = model.namespace().ok_or(Error::MissingMetadata("namespace"))?;
    let secrets: Api<k8s_openapi::api::core::v1::Secret> = Api::namespaced(ctx.client.clone(), &ns);

    if secrets.get_opt(secret_name).await?.is_none() {
        set_condition(
            &mut status.conditions,
            Condition::new(CONDITION_SECRET_EXIST, false, "SecretNotExist", "secret not found"),
        );
        return Ok(Some(Action::requeue(Duration::from_secs(60))));
    }

    status.state = Some(CachedModelState::SecretOk);
    set_condition(
        &mut status.conditions,
        Condition::new(CONDITION_SECRET_EXIST, true, "SecretExist", "secret found"),
    );
    Ok(None)
}

/// Step 2: create the storage claim if absent and wait until it is bound.
async fn reconcile_pvc(
    model: &CachedModel,
    status: &mut CachedModelStatus,
    ctx: &Context,
) -> Result<Option<Action>, Error> {
    let ns = model.namespace().ok_or(Error::MissingMetadata("namespace"))?;
    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), &ns);

    let pvc = match pvcs.get_opt(model.pvc_name()).await? {
        Some(pvc) => pvc,
        None => {
            let desired = desired_pvc(model)?;
            pvcs.create(&PostParams::default(), &desired).await?;
            info!(model = %model.name_any(), pvc = %model.pvc_name(), "Create pvc success");
            ctx.publish_event(
                model.object_ref(&()),
                EventType::Normal,
                "CreatePVC",
                "Create pvc success".to_string(),
            )
            .await;
            set_condition(
                &mut status.conditions,
                Condition::new(CONDITION_PVC_READY, false, "PVCCreate", "pvc is create, waiting for ready"),
            );
            return Ok(Some(Action::requeue(Duration::from_secs(60))));
        }
    };

    let bound = pvc
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(|phase| phase == "Bound")
        .unwrap_or(false);
    if !bound {
        set_condition(
            &mut status.conditions,
            Condition::new(CONDITION_PVC_READY, false, "PVCPending", "pvc is not bound"),
        );
        return Ok(Some(Action::requeue(Duration::from_secs(60))));
    }

    status.state = Some(CachedModelState::PvcReady);
    status.pvc = Some(model.pvc_name().to_string());
    set_condition(
        &mut status.conditions,
        Condition::new(CONDITION_PVC_READY, true, "PVCReady", "pvc is bound"),
    );
    Ok(None)
}

/// Step 3: drive the download pod from creation to completion and harvest
/// the model name and server profile from its logs.
async fn reconcile_download_pod(
    model: &CachedModel,
    status: &mut CachedModelStatus,
    ctx: &Context,
) -> Result<Option<Action>, Error> {
    let ns = model.namespace().ok_or(Error::MissingMetadata("namespace"))?;
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &ns);
    let pod_name = model.download_pod_name();

    let pod = match pods.get_opt(&pod_name).await? {
        Some(pod) => pod,
        None => {
            let desired = desired_download_pod(model)?;
            pods.create(&PostParams::default(), &desired).await?;
            info!(model = %model.name_any(), pod = %pod_name, "Create download pod success");
            ctx.publish_event(
                model.object_ref(&()),
                EventType::Normal,
                "CreateDownloadPod",
                "Create download pod success".to_string(),
            )
            .await;
            status.state = Some(CachedModelState::PodCreate);
            set_condition(
                &mut status.conditions,
                Condition::new(CONDITION_POD_CREATE, true, "JobCreate", "job is create"),
            );
            return Ok(Some(Action::requeue(Duration::from_secs(1))));
        }
    };

    if let Some(failure) = apply_pod_phase(status, &pod)? {
        ctx.publish_event(
            model.object_ref(&()),
            EventType::Warning,
            "DownloadPodFailed",
            format!("download pod failed by: {}", failure),
        )
        .await;
        return Ok(None);
    }

    if status.state != Some(CachedModelState::Complete) {
        return Ok(None);
    }

    // First observation of completion: harvest metadata from the logs before
    // advancing to Ready. Later passes keep the stored profile.
    if status.server_info.as_ref().map(|i| i.server_type.is_empty()).unwrap_or(true) {
        let logs = pods
            .logs(
                &pod_name,
                &LogParams {
                    container: Some(DOWNLOAD_CONTAINER.to_string()),
                    ..Default::default()
                },
            )
            .await?;

        status.model = Some(parser::extract_model_name(&logs)?);
        let token = parser::extract_config_token(&logs)?;
        status.server_info = Some(parser::decode_server_info(&token)?);
    }

    status.state = Some(CachedModelState::Ready);
    Ok(None)
}

/// Map the download pod's phase onto state and conditions. Returns the
/// terminated-container message when the pod failed, `None` otherwise.
fn apply_pod_phase(status: &mut CachedModelStatus, pod: &Pod) -> Result<Option<String>, Error> {
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Pending");

    match phase {
        "Pending" => {
            status.state = Some(CachedModelState::PodCreate);
            set_condition(
                &mut status.conditions,
                Condition::new(CONDITION_POD_RUNNING, false, "PodPending", "Pod is pending"),
            );
            Ok(None)
        }
        "Running" => {
            status.state = Some(CachedModelState::InProgress);
            set_condition(
                &mut status.conditions,
                Condition::new(CONDITION_POD_RUNNING, true, "PodRunning", "Pod is running"),
            );
            set_condition(
                &mut status.conditions,
                Condition::new(CONDITION_POD_COMPLETE, false, "PodRunning", "Pod is running"),
            );
            Ok(None)
        }
        "Succeeded" => {
            status.state = Some(CachedModelState::Complete);
            set_condition(
                &mut status.conditions,
                Condition::new(CONDITION_POD_RUNNING, false, "PodSucceeded", "Pod is succeeded"),
            );
            set_condition(
                &mut status.conditions,
                Condition::new(CONDITION_POD_COMPLETE, true, "PodSucceeded", "Pod is succeeded"),
            );
            Ok(None)
        }
        "Failed" => {
            status.state = Some(CachedModelState::Failed);
            set_condition(
                &mut status.conditions,
                Condition::new(CONDITION_POD_RUNNING, false, "PodFailed", "Pod failed"),
            );
            set_condition(
                &mut status.conditions,
                Condition::new(CONDITION_POD_COMPLETE, false, "PodFailed", "Pod failed"),
            );
            terminated_message(pod).map(Some)
        }
        other => Err(Error::UnknownPodPhase(other.to_string())),
    }
}

/// Pull the terminated-state message of the downloader container out of a
/// failed pod. A failed pod without that status has an unexpected shape.
fn terminated_message(pod: &Pod) -> Result<String, Error> {
    let statuses = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .filter(|cs| !cs.is_empty())
        .ok_or(Error::MissingTerminatedState)?;

    let download_status = statuses
        .iter()
        .find(|cs| cs.name == DOWNLOAD_CONTAINER)
        .ok_or(Error::MissingTerminatedState)?;

    let terminated = download_status
        .state
        .as_ref()
        .and_then(|s| s.terminated.as_ref())
        .ok_or(Error::MissingTerminatedState)?;

    Ok(terminated.message.clone().unwrap_or_default())
}

fn desired_pvc(model: &CachedModel) -> Result<PersistentVolumeClaim, Error> {
    let owner = model
        .controller_owner_ref(&())
        .ok_or(Error::MissingMetadata("uid"))?;

    Ok(PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(model.pvc_name().to_string()),
            namespace: model.namespace(),
            labels: Some(utils::standard_labels(&model.name_any(), utils::MODEL_LABEL_PART_OF)),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![model.pvc_access_mode()]),
            storage_class_name: model.spec.storage.pvc.storage_class.clone(),
            resources: Some(k8s_openapi::api::core::v1::VolumeResourceRequirements {
                requests: Some(
                    [("storage".to_string(), Quantity(model.pvc_size()))]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    })
}

fn desired_download_pod(model: &CachedModel) -> Result<Pod, Error> {
    let owner = model
        .controller_owner_ref(&())
        .ok_or(Error::MissingMetadata("uid"))?;

    let image_pull_secrets = model
        .spec
        .image_pull_secret
        .as_ref()
        .filter(|s| !s.is_empty())
        .map(|name| vec![LocalObjectReference { name: name.clone() }]);

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(model.download_pod_name()),
            namespace: model.namespace(),
            labels: Some(utils::standard_labels(&model.name_any(), utils::MODEL_LABEL_PART_OF)),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            image_pull_secrets,
            containers: vec![Container {
                name: DOWNLOAD_CONTAINER.to_string(),
                image: Some(model.spec.image.clone()),
                image_pull_policy: Some("IfNotPresent".to_string()),
                command: Some(vec![DOWNLOAD_COMMAND.to_string()]),
                env: (!model.spec.envs.is_empty()).then(|| model.spec.envs.clone()),
                volume_mounts: Some(vec![VolumeMount {
                    name: MODEL_VOLUME.to_string(),
                    mount_path: MODEL_MOUNT_PATH.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: MODEL_VOLUME.to_string(),
                persistent_volume_claim: Some(
                    k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource {
                        claim_name: model.pvc_name().to_string(),
                        read_only: Some(false),
                    },
                ),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    })
}

async fn patch_status(
    models: &Api<CachedModel>,
    name: &str,
    status: &CachedModelStatus,
) -> Result<(), Error> {
    let patch = serde_json::json!({ "status": status });
    models
        .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}
