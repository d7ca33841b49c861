//! The runtime object behind the CRI verb set.
//!
//! Owns the sandbox and container tables and the image registry. Every verb
//! is a plain method; the RPC surface in [`crate::cri::service`] is a thin
//! decode/dispatch layer over this type, so tests can drive it directly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use crosslink::{Crosslink, Handler};

use crate::config::RuntimeConfig;
use crate::cri::container::{Container, ContextSpawner};
use crate::cri::image::{ImageFetcher, ImageRegistry, ImageState};
use crate::cri::mint_hex_id;
use crate::cri::sandbox::Sandbox;
use crate::cri::service::NodePipe;
use crate::cri::types::{
    ContainerMetadata, ContainerStatus, ContainerStatusRequest, ContainerStatusResponse,
    CreateContainerRequest, CreateContainerResponse, Image, ImageSpec, ListContainersRequest,
    ListContainersResponse, ListImagesRequest, ListImagesResponse, ListPodSandboxRequest,
    ListPodSandboxResponse, PodSandbox, PodSandboxStatus, PodSandboxStatusRequest,
    PodSandboxStatusResponse, PullImageRequest, PullImageResponse, RemoveContainerRequest,
    RemoveContainerResponse, RemoveImageRequest, RemoveImageResponse, RemovePodSandboxRequest,
    RemovePodSandboxResponse, RunPodSandboxRequest, RunPodSandboxResponse, StartContainerRequest,
    StartContainerResponse, StopContainerRequest, StopContainerResponse, StopPodSandboxRequest,
    StopPodSandboxResponse,
};
use crate::error::{Error, Result};

pub struct Runtime {
    config: RuntimeConfig,
    images: ImageRegistry,
    spawner: Arc<dyn ContextSpawner>,
    node: Mutex<Option<Arc<Crosslink>>>,
    sandboxes: Mutex<HashMap<String, Arc<Sandbox>>>,
    containers: Mutex<HashMap<String, Arc<Container>>>,
}

fn matches(constraint: &Option<String>, value: &str) -> bool {
    match constraint.as_deref() {
        None | Some("") => true,
        Some(wanted) => wanted == value,
    }
}

impl Runtime {
    pub fn new(
        config: RuntimeConfig,
        fetcher: Arc<dyn ImageFetcher>,
        spawner: Arc<dyn ContextSpawner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            images: ImageRegistry::new(fetcher),
            spawner,
            node: Mutex::new(None),
            sandboxes: Mutex::new(HashMap::new()),
            containers: Mutex::new(HashMap::new()),
        })
    }

    /// Attach the link to the node-side controller. Containers started after
    /// this point can reach it through their `node/` pipe.
    pub fn set_node_link(&self, link: Arc<Crosslink>) {
        *self.node.lock().unwrap_or_else(|e| e.into_inner()) = Some(link);
    }

    pub(crate) fn node_link(&self) -> Option<Arc<Crosslink>> {
        self.node.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn container(&self, id: &str) -> Option<Arc<Container>> {
        self.containers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    // -- sandboxes ---------------------------------------------------------

    pub fn run_pod_sandbox(&self, request: RunPodSandboxRequest) -> Result<RunPodSandboxResponse> {
        let metadata = request.config.metadata;
        let mut sandboxes = self.sandboxes.lock().unwrap_or_else(|e| e.into_inner());
        for sandbox in sandboxes.values() {
            if sandbox.metadata().name == metadata.name
                && sandbox.metadata().namespace == metadata.namespace
            {
                return Err(Error::DuplicateSandboxName);
            }
            if sandbox.metadata().uid == metadata.uid {
                return Err(Error::DuplicateSandboxUid);
            }
        }

        let id = mint_hex_id(|candidate| sandboxes.contains_key(candidate));
        sandboxes.insert(id.clone(), Sandbox::new(id.clone(), metadata));
        Ok(RunPodSandboxResponse { pod_sandbox_id: id })
    }

    /// Idempotent: stopping an unknown sandbox is a no-op.
    pub fn stop_pod_sandbox(&self, request: StopPodSandboxRequest) -> Result<StopPodSandboxResponse> {
        let sandbox = self
            .sandboxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&request.pod_sandbox_id)
            .cloned();
        if let Some(sandbox) = sandbox {
            sandbox.stop(self.config.stop_grace_period());
        }
        Ok(StopPodSandboxResponse {})
    }

    /// Stop, remove every member container, then drop the sandbox itself.
    /// Idempotent like stop.
    pub fn remove_pod_sandbox(
        &self,
        request: RemovePodSandboxRequest,
    ) -> Result<RemovePodSandboxResponse> {
        let sandbox = self
            .sandboxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&request.pod_sandbox_id)
            .cloned();
        if let Some(sandbox) = sandbox {
            sandbox.stop(self.config.stop_grace_period());
            for container_id in sandbox.container_ids() {
                self.remove_container(RemoveContainerRequest {
                    container_id,
                })?;
            }
            self.sandboxes
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&request.pod_sandbox_id);
        }
        Ok(RemovePodSandboxResponse {})
    }

    pub fn pod_sandbox_status(
        &self,
        request: PodSandboxStatusRequest,
    ) -> Result<PodSandboxStatusResponse> {
        let sandbox = self
            .sandboxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&request.pod_sandbox_id)
            .cloned()
            .ok_or(Error::SandboxNotFound)?;

        let containers_statuses = sandbox
            .containers()
            .iter()
            .map(container_status_of)
            .collect();

        Ok(PodSandboxStatusResponse {
            status: PodSandboxStatus {
                id: sandbox.id().to_string(),
                metadata: sandbox.metadata().clone(),
                state: sandbox.state(),
                created_at: sandbox.created_at(),
            },
            containers_statuses,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        })
    }

    pub fn list_pod_sandbox(&self, request: ListPodSandboxRequest) -> Result<ListPodSandboxResponse> {
        let filter = request.filter.unwrap_or_default();
        let items = self
            .sandboxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|sandbox| matches(&filter.id, sandbox.id()))
            .filter(|sandbox| {
                filter
                    .state
                    .as_ref()
                    .is_none_or(|wanted| wanted.state == sandbox.state())
            })
            .map(|sandbox| PodSandbox {
                id: sandbox.id().to_string(),
                metadata: sandbox.metadata().clone(),
                state: sandbox.state(),
                created_at: sandbox.created_at(),
            })
            .collect();
        Ok(ListPodSandboxResponse { items })
    }

    // -- containers --------------------------------------------------------

    pub fn create_container(
        &self,
        request: CreateContainerRequest,
    ) -> Result<CreateContainerResponse> {
        let sandbox = self
            .sandboxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&request.pod_sandbox_id)
            .cloned()
            .ok_or(Error::SandboxNotFound)?;

        let config = request.config;
        let image = self
            .images
            .get(&config.image.image)
            .ok_or_else(|| Error::ImageNotFound(config.image.image.clone()))?;

        let envs = config
            .envs
            .into_iter()
            .map(|kv| (kv.key, kv.value))
            .collect();

        let mut containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        let id = mint_hex_id(|candidate| containers.contains_key(candidate));
        let container = Container::new(
            id.clone(),
            request.pod_sandbox_id,
            config.metadata.name,
            image,
            config.runtime,
            config.args,
            envs,
        );
        sandbox.add_container(container.clone())?;
        containers.insert(id.clone(), container);

        Ok(CreateContainerResponse { container_id: id })
    }

    pub async fn start_container(
        self: &Arc<Self>,
        request: StartContainerRequest,
    ) -> Result<StartContainerResponse> {
        let container = self
            .container(&request.container_id)
            .ok_or(Error::ContainerNotFound)?;

        let node_pipe: Option<Arc<dyn Handler>> = Some(Arc::new(NodePipe::new(
            Arc::downgrade(self),
            container.sandbox_id().to_string(),
            container.id().to_string(),
        )));

        container
            .start(
                &self.spawner,
                &self.config.supported_runtimes,
                self.config.stop_grace_period(),
                node_pipe,
            )
            .await?;
        Ok(StartContainerResponse {})
    }

    pub fn stop_container(&self, request: StopContainerRequest) -> Result<StopContainerResponse> {
        let container = self
            .container(&request.container_id)
            .ok_or(Error::ContainerNotFound)?;
        container.stop(self.config.stop_grace_period());
        Ok(StopContainerResponse {})
    }

    /// Idempotent: removing an unknown container is a no-op. A live container
    /// is stopped and torn down before its table entries go away.
    pub fn remove_container(
        &self,
        request: RemoveContainerRequest,
    ) -> Result<RemoveContainerResponse> {
        let container = self
            .containers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&request.container_id);
        let Some(container) = container else {
            return Ok(RemoveContainerResponse {});
        };

        container.stop(self.config.stop_grace_period());
        container.cleanup();

        let sandbox = self
            .sandboxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(container.sandbox_id())
            .cloned();
        if let Some(sandbox) = sandbox {
            sandbox.remove_container(container.id());
        }
        Ok(RemoveContainerResponse {})
    }

    pub fn list_containers(&self, request: ListContainersRequest) -> Result<ListContainersResponse> {
        let filter = request.filter.unwrap_or_default();
        let containers = self
            .containers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|container| matches(&filter.id, container.id()))
            .filter(|container| matches(&filter.pod_sandbox_id, container.sandbox_id()))
            .filter(|container| {
                filter
                    .state
                    .as_ref()
                    .is_none_or(|wanted| wanted.state == container.state())
            })
            .map(|container| super::types::Container {
                id: container.id().to_string(),
                pod_sandbox_id: container.sandbox_id().to_string(),
                metadata: ContainerMetadata {
                    name: container.name().to_string(),
                },
                image: ImageSpec {
                    image: container.image().url().to_string(),
                },
                image_ref: container.image().id().to_string(),
                state: container.state(),
                created_at: container.created_at(),
            })
            .collect();
        Ok(ListContainersResponse { containers })
    }

    pub fn container_status(&self, request: ContainerStatusRequest) -> Result<ContainerStatusResponse> {
        let container = self
            .container(&request.container_id)
            .ok_or(Error::ContainerNotFound)?;
        Ok(ContainerStatusResponse {
            status: container_status_of(&container),
        })
    }

    // -- images ------------------------------------------------------------

    pub fn list_images(&self, request: ListImagesRequest) -> Result<ListImagesResponse> {
        let wanted = request
            .filter
            .filter(|filter| !filter.image.image.is_empty())
            .map(|filter| filter.image.image);

        let instances = match wanted {
            Some(url) => self.images.get(&url).into_iter().collect::<Vec<_>>(),
            None => self.images.list_downloaded(),
        };

        let images = instances
            .into_iter()
            .filter(|image| image.state() == ImageState::Downloaded)
            .map(|image| Image {
                id: image.id().to_string(),
                spec: ImageSpec {
                    image: image.url().to_string(),
                },
            })
            .collect();
        Ok(ListImagesResponse { images })
    }

    pub async fn pull_image(&self, request: PullImageRequest) -> Result<PullImageResponse> {
        let image_ref = self.images.pull(&request.image.image).await?;
        Ok(PullImageResponse { image_ref })
    }

    /// Idempotent; an image still downloading survives until it settles.
    pub fn remove_image(&self, request: RemoveImageRequest) -> Result<RemoveImageResponse> {
        self.images.remove(&request.image.image);
        Ok(RemoveImageResponse {})
    }
}

fn container_status_of(container: &Arc<Container>) -> ContainerStatus {
    let (started_at, finished_at, exit_code) = container.status_fields();
    ContainerStatus {
        id: container.id().to_string(),
        metadata: ContainerMetadata {
            name: container.name().to_string(),
        },
        state: container.state(),
        created_at: container.created_at(),
        started_at,
        finished_at,
        exit_code,
        image: ImageSpec {
            image: container.image().url().to_string(),
        },
        image_ref: container.image().id().to_string(),
    }
}
