/*
* File: src/main.rs
*
* This file is the main entry point for the MIS Kubernetes Operator. It is
* responsible for setting up and running the controller manager, which in turn
* hosts and executes the reconciliation loops for both custom resources
* managed by this operator.
*
* Architecture:
* The program follows the standard `kube-rs` operator structure.
* 1.  **Initialization**: It begins by initializing `tracing` for structured
*     logging and a Kubernetes client.
* 2.  **Controller Manager**:
*     - The `CachedModel` controller owns the PVCs and download pods it
*       creates, so changes to those sub-resources re-trigger reconciliation
*       of their owner.
*     - The `InferenceService` controller owns its Service, its metrics
*       scrape target and its worker jobs (the latter two through dynamic
*       API resources, since neither kind ships typed bindings). It
*       additionally watches Secrets and CachedModels, mapping each change
*       back to the services referencing them through the controller's
*       reflector store.
* 3.  **Shared Context**: A shared `Context` object, containing the
*     Kubernetes client and an event recorder, is passed to both controllers.
* 4.  **Concurrent Execution**: Both controller tasks are run concurrently
*     using `tokio::join!`, so events for both resource types are handled
*     simultaneously and independently.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::sync::Arc;

use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::{
    ObjectReference, PersistentVolumeClaim, Pod, Secret, Service,
};
use kube::api::DynamicObject;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client, ResourceExt};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod crds;
mod controllers {
    pub mod cached_model_controller;
    pub mod fleet;
    pub mod inference_service_controller;
    pub mod parser;
    pub mod utils;
}

use controllers::{cached_model_controller, fleet, inference_service_controller};
use crds::{CachedModel, InferenceService};

/// The shared context struct passed to both controllers.
pub struct Context {
    pub client: Client,
    pub recorder: Recorder,
}

impl Context {
    /// Publish a Kubernetes event against the given object. Event delivery
    /// is best effort and never fails a reconcile pass.
    pub async fn publish_event(
        &self,
        reference: ObjectReference,
        type_: EventType,
        reason: &str,
        note: String,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: reason.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &reference).await {
            warn!(error = %e, reason, "Failed to publish event");
        }
    }
}

/// The main entry point of the operator.
#[tokio::main]
async fn main() -> Result<(), kube::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let client = Client::try_default().await?;

    let context = Arc::new(Context {
        client: client.clone(),
        recorder: Recorder::new(client.clone(), Reporter::from("mis-operator")),
    });

    info!("MIS Operator starting...");

    // --- CachedModel Controller ---
    let models = Api::<CachedModel>::all(client.clone());
    let model_controller = Controller::new(models, watcher::Config::default())
        .owns(
            Api::<PersistentVolumeClaim>::all(client.clone()),
            watcher::Config::default(),
        )
        .owns(Api::<Pod>::all(client.clone()), watcher::Config::default())
        .run(
            cached_model_controller::reconcile,
            cached_model_controller::on_error,
            context.clone(),
        )
        .for_each(|res| async move {
            match res {
                Ok(o) => info!("Reconciled CachedModel: {:?}", o),
                Err(e) => error!("CachedModel reconcile error: {}", e),
            }
        });

    // --- InferenceService Controller ---
    let services = Api::<InferenceService>::all(client.clone());
    let service_controller = Controller::new(services, watcher::Config::default());

    // Reflector snapshots used to map collaborator changes back to the
    // services referencing them.
    let services_by_secret = service_controller.store();
    let services_by_model = service_controller.store();

    let service_controller = service_controller
        .owns(Api::<Service>::all(client.clone()), watcher::Config::default())
        .owns_with(
            Api::<DynamicObject>::all_with(client.clone(), &fleet::job_api_resource()),
            fleet::job_api_resource(),
            watcher::Config::default(),
        )
        .owns_with(
            Api::<DynamicObject>::all_with(
                client.clone(),
                &inference_service_controller::service_monitor_api_resource(),
            ),
            inference_service_controller::service_monitor_api_resource(),
            watcher::Config::default(),
        )
        .watches(
            Api::<Secret>::all(client.clone()),
            watcher::Config::default(),
            move |secret: Secret| {
                let ns = secret.namespace();
                let name = secret.name_any();
                services_by_secret
                    .state()
                    .into_iter()
                    .filter(|svc| {
                        svc.namespace() == ns
                            && svc.spec.tls_secret.as_deref() == Some(name.as_str())
                    })
                    .map(|svc| ObjectRef::from_obj(svc.as_ref()))
                    .collect::<Vec<_>>()
            },
        )
        .watches(
            Api::<CachedModel>::all(client.clone()),
            watcher::Config::default(),
            move |model: CachedModel| {
                let ns = model.namespace();
                let name = model.name_any();
                services_by_model
                    .state()
                    .into_iter()
                    .filter(|svc| svc.namespace() == ns && svc.spec.cached_model == name)
                    .map(|svc| ObjectRef::from_obj(svc.as_ref()))
                    .collect::<Vec<_>>()
            },
        )
        .run(
            inference_service_controller::reconcile,
            inference_service_controller::on_error,
            context.clone(),
        )
        .for_each(|res| async move {
            match res {
                Ok(o) => info!("Reconciled InferenceService: {:?}", o),
                Err(e) => error!("InferenceService reconcile error: {}", e),
            }
        });

    tokio::join!(model_controller, service_controller);

    info!("MIS Operator shutting down.");

    Ok(())
}
