//! Wire records for the CRI verb set and the container bootstrap protocol.
//!
//! Every request is decoded explicitly at the RPC boundary; a shape mismatch
//! is answered with an error reply naming the verb, never trusted blindly.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// The verbs mounted under the `cri/` path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, Display)]
#[strum(serialize_all = "camelCase")]
pub enum CriVerb {
    RunPodSandbox,
    StopPodSandbox,
    RemovePodSandbox,
    PodSandboxStatus,
    ListPodSandbox,
    CreateContainer,
    StartContainer,
    StopContainer,
    RemoveContainer,
    ListContainers,
    ContainerStatus,
    ListImages,
    PullImage,
    RemoveImage,
}

// ---------------------------------------------------------------------------
// Sandboxes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSandboxMetadata {
    pub name: String,
    pub uid: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodSandboxConfig {
    pub metadata: PodSandboxMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPodSandboxRequest {
    pub config: PodSandboxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPodSandboxResponse {
    pub pod_sandbox_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopPodSandboxRequest {
    pub pod_sandbox_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopPodSandboxResponse {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovePodSandboxRequest {
    pub pod_sandbox_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemovePodSandboxResponse {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSandboxStatusRequest {
    pub pod_sandbox_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSandboxStatusResponse {
    pub status: PodSandboxStatus,
    pub containers_statuses: Vec<ContainerStatus>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PodSandboxState {
    Ready,
    NotReady,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSandboxStatus {
    pub id: String,
    pub metadata: PodSandboxMetadata,
    pub state: PodSandboxState,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListPodSandboxRequest {
    #[serde(default)]
    pub filter: Option<PodSandboxFilter>,
}

/// Absent (or empty) fields constrain nothing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodSandboxFilter {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub state: Option<PodSandboxStateValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodSandboxStateValue {
    pub state: PodSandboxState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSandbox {
    pub id: String,
    pub metadata: PodSandboxMetadata,
    pub state: PodSandboxState,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListPodSandboxResponse {
    pub items: Vec<PodSandbox>,
}

// ---------------------------------------------------------------------------
// Containers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub metadata: ContainerMetadata,
    pub image: ImageSpec,
    #[serde(default)]
    pub runtime: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub envs: Vec<KeyValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateContainerRequest {
    pub pod_sandbox_id: String,
    pub config: ContainerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateContainerResponse {
    pub container_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartContainerRequest {
    pub container_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartContainerResponse {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopContainerRequest {
    pub container_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopContainerResponse {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveContainerRequest {
    pub container_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoveContainerResponse {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContainerState {
    Created,
    Running,
    Exited,
    Unknown,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListContainersRequest {
    #[serde(default)]
    pub filter: Option<ContainerFilter>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerFilter {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub state: Option<ContainerStateValue>,
    #[serde(default)]
    pub pod_sandbox_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStateValue {
    pub state: ContainerState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub id: String,
    pub pod_sandbox_id: String,
    pub metadata: ContainerMetadata,
    pub image: ImageSpec,
    pub image_ref: String,
    pub state: ContainerState,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListContainersResponse {
    pub containers: Vec<Container>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatusRequest {
    pub container_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStatusResponse {
    pub status: ContainerStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    pub id: String,
    pub metadata: ContainerMetadata,
    pub state: ContainerState,
    pub created_at: String,
    pub started_at: String,
    pub finished_at: String,
    pub exit_code: i32,
    pub image: ImageSpec,
    pub image_ref: String,
}

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListImagesRequest {
    #[serde(default)]
    pub filter: Option<ImageFilter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageFilter {
    pub image: ImageSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub spec: ImageSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListImagesResponse {
    pub images: Vec<Image>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullImageRequest {
    pub image: ImageSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullImageResponse {
    pub image_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveImageRequest {
    pub image: ImageSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoveImageResponse {}

// ---------------------------------------------------------------------------
// Container bootstrap (the `manager/` namespace on a per-container link)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadyRequest {}

/// Answer to `ready`: everything a freshly spawned context needs to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyResponse {
    pub name: String,
    pub image: Vec<u8>,
    pub args: Vec<String>,
    pub envs: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TermRequest {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TermResponse {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishedRequest {
    pub code: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinishedResponse {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn verb_names_are_camel_case() {
        assert_eq!(CriVerb::RunPodSandbox.to_string(), "runPodSandbox");
        assert_eq!(CriVerb::PullImage.as_ref(), "pullImage");
        let verb: CriVerb = "containerStatus".parse().unwrap();
        assert_eq!(verb, CriVerb::ContainerStatus);
    }

    #[test]
    fn create_container_request_decodes_with_defaults() {
        let req: CreateContainerRequest = serde_json::from_value(json!({
            "podSandboxId": "a1",
            "config": {
                "metadata": { "name": "main" },
                "image": { "image": "http://example.com/app.wasm" }
            }
        }))
        .unwrap();
        assert!(req.config.runtime.is_empty());
        assert!(req.config.args.is_empty());
        assert!(req.config.envs.is_empty());
    }

    #[test]
    fn filters_accept_missing_fields() {
        let req: ListContainersRequest = serde_json::from_value(json!({})).unwrap();
        assert!(req.filter.is_none());

        let req: ListContainersRequest = serde_json::from_value(json!({
            "filter": { "podSandboxId": "s1" }
        }))
        .unwrap();
        let filter = req.filter.unwrap();
        assert_eq!(filter.pod_sandbox_id.as_deref(), Some("s1"));
        assert!(filter.state.is_none());
    }
}
