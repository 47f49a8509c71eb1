/*
* File: src/crds.rs
*
* This file defines the Rust data structures that correspond to our Custom
* Resource Definitions (CRDs). By using the `kube::CustomResource` derive macro,
* we create a strongly-typed representation of our custom APIs, enabling safe
* and idiomatic interaction with the Kubernetes API server.
*
* Architecture:
* - `CachedModel` describes a model weight cache: a PVC to hold the weights
*   and a downloader image that fills it. Its controller provisions the PVC,
*   runs the download pod and extracts the served model's name and server
*   profile from the downloader logs.
* - `InferenceService` describes a serving deployment backed by a fleet of
*   distributed worker jobs. It references a `CachedModel` by name and copies
*   that model's resolved configuration into its own status once the model is
*   ready.
* - The standard Kubernetes object structure is followed by separating the
*   user's desired state (`spec`) from the operator's observed state
*   (`status`).
* - `serde` attributes map between idiomatic Rust `snake_case` and idiomatic
*   Kubernetes `camelCase`.
* - `schemars` generates an OpenAPI v3 schema from the Rust types, which is
*   embedded into the CRD manifest for server-side validation. Fields that
*   embed `k8s-openapi` types (env vars, probes, resource requirements) are
*   marked `#[schemars(skip)]` since those types do not implement
*   `JsonSchema`.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::collections::BTreeMap;

use chrono::Utc;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscalerBehavior;
use k8s_openapi::api::core::v1::{EnvVar, Probe, ResourceRequirements};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::controllers::parser;

// --- Shared status types ---

/// A typed, timestamped boolean fact attached to a resource's status.
/// Mirrors the shape of `metav1.Condition`.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    /// "True" or "False".
    pub status: String,
    pub reason: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    pub fn new(type_: &str, status: bool, reason: &str, message: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: Some(Utc::now().to_rfc3339()),
        }
    }
}

/// Target server profile resolved from a deployment configuration token,
/// e.g. `atlas800ia2-1x32gb-...` -> type `atlas800ia2`, 1 card, "32G".
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    #[serde(default)]
    pub server_type: String,
    #[serde(default)]
    pub card_num: i64,
    #[serde(default)]
    pub card_memory: String,
}

// --- CachedModel Custom Resource Definition ---

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "apps.ascend.com",
    version = "v1alpha1",
    kind = "CachedModel",
    namespaced,
    status = "CachedModelStatus",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Model", "type":"string", "jsonPath":".status.model"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#,
    shortname = "cmod"
)]
#[serde(rename_all = "camelCase")]
pub struct CachedModelSpec {
    pub storage: StorageSpec,
    /// Image containing the model downloader.
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secret: Option<String>,
    /// Environment passed to the downloader and inherited by serving jobs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(skip)]
    pub envs: Vec<EnvVar>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    pub pvc: PvcSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PvcSpec {
    pub name: String,
    /// Requested storage size, e.g. "200Gi". Falls back to 100Gi when
    /// missing or unparsable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_access_mode: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum CachedModelState {
    Started,
    #[serde(rename = "SecretOK")]
    SecretOk,
    #[serde(rename = "PVCReady")]
    PvcReady,
    PodCreate,
    InProgress,
    Complete,
    Failed,
    Ready,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct CachedModelStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<CachedModelState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Name of the bound PVC holding the model weights.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pvc: Option<String>,
    /// Model name extracted from the downloader logs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
}

impl CachedModel {
    /// Deterministic name of the download pod for this model.
    pub fn download_pod_name(&self) -> String {
        format!("{}-download-pod", self.metadata.name.as_deref().unwrap_or_default())
    }

    pub fn pvc_name(&self) -> &str {
        &self.spec.storage.pvc.name
    }

    /// Requested PVC size, validated as a Kubernetes quantity. Unparsable or
    /// missing sizes fall back to 100Gi.
    pub fn pvc_size(&self) -> String {
        match &self.spec.storage.pvc.size {
            Some(size) if parser::is_valid_quantity(size) => size.clone(),
            _ => "100Gi".to_string(),
        }
    }

    pub fn pvc_access_mode(&self) -> String {
        self.spec
            .storage
            .pvc
            .volume_access_mode
            .clone()
            .unwrap_or_else(|| "ReadWriteOnce".to_string())
    }
}

// --- InferenceService Custom Resource Definition ---

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "apps.ascend.com",
    version = "v1alpha1",
    kind = "InferenceService",
    namespaced,
    status = "InferenceServiceStatus",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Replicas", "type":"string", "jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Running", "type":"string", "jsonPath":".status.running"}"#,
    shortname = "isvc"
)]
#[serde(rename_all = "camelCase")]
pub struct InferenceServiceSpec {
    /// Name of the CachedModel (same namespace) this service serves.
    pub cached_model: String,
    /// Desired number of worker-job instances.
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hpa: Option<Hpa>,
    pub service_spec: EndpointSpec,
    /// Name of a `kubernetes.io/tls` secret providing the serving cert/key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(skip)]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(skip)]
    pub startup_probe: Option<Probe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(skip)]
    pub readiness_probe: Option<Probe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(skip)]
    pub liveness_probe: Option<Probe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<i64>,
}

fn default_replicas() -> i32 {
    1
}

/// Autoscaling policy. When present, the controller also registers a metrics
/// scrape target and an HPA for this service.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Hpa {
    pub min_replicas: i32,
    pub max_replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Vec<Metric>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(skip)]
    pub behavior: Option<HorizontalPodAutoscalerBehavior>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    #[serde(rename = "type")]
    pub type_: MetricsType,
    /// Average-value target for the metric, as a Kubernetes quantity string.
    pub threshold: String,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum MetricsType {
    RequestRate,
    WaitRequest,
    #[serde(rename = "CpuKVCacheUtilization")]
    CpuKvCacheUtilization,
    #[serde(rename = "AcceleratorKVCacheUtilization")]
    AcceleratorKvCacheUtilization,
}

/// How to expose the inference endpoint.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSpec {
    pub name: String,
    #[serde(default = "default_service_port")]
    pub port: i32,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: i32,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

fn default_service_port() -> i32 {
    8000
}

fn default_metrics_port() -> i32 {
    8001
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum InferenceServiceState {
    Started,
    #[serde(rename = "TLSSecretReady")]
    TlsSecretReady,
    ModelReady,
    ServiceCreated,
    ServiceMonitorCreated,
    #[serde(rename = "HPACreated")]
    HpaCreated,
    Waiting,
    Ready,
    Failed,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct InferenceServiceStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<InferenceServiceState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Count of worker-job instances observed running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// "<running>/<total>" worker-job instances.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running: Option<String>,
    /// Label selector matching this service's pods, for scale consumers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    // Fields below are copied from the referenced CachedModel and are only
    // valid once the ModelReady condition is true.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pvc: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(skip)]
    pub envs: Vec<EnvVar>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_pull_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
}

impl InferenceService {
    pub fn service_monitor_name(&self) -> String {
        format!("{}-service-monitor", self.metadata.name.as_deref().unwrap_or_default())
    }

    pub fn hpa_name(&self) -> String {
        format!(
            "{}-horizontal-pod-autoscaling",
            self.metadata.name.as_deref().unwrap_or_default()
        )
    }
}
