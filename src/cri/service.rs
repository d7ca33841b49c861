//! Crosslink-facing surface of the runtime.
//!
//! [`mount_cri`] hangs the 14 CRI verbs under `cri/` and the application
//! pipe under `application/` on a routing tree. Each verb handler decodes
//! its request explicitly and answers a malformed payload with an error
//! naming the verb.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use crosslink::{Handler, MultiPlexer, ResponseWriter, TAG_PATH, Tags};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::cri::runtime::Runtime;
use crate::cri::types::CriVerb;
use crate::error::Result;

/// Routing prefix of the CRI verb set.
pub const CRI_PATH: &str = "cri";
/// Routing prefix of calls forwarded into a container.
pub const APPLICATION_PATH: &str = "application";

/// Tag naming the sandbox a piped call belongs to.
pub const SANDBOX_TAG: &str = "sandbox";
/// Tag naming the container a piped call belongs to.
pub const CONTAINER_TAG: &str = "container";

/// Mount the verb set and the application pipe on `root`.
pub fn mount_cri(root: &MultiPlexer, runtime: &Arc<Runtime>) {
    let mpx = MultiPlexer::new();

    route(&mpx, runtime, CriVerb::RunPodSandbox, |rt, req| async move {
        rt.run_pod_sandbox(req)
    });
    route(&mpx, runtime, CriVerb::StopPodSandbox, |rt, req| async move {
        rt.stop_pod_sandbox(req)
    });
    route(&mpx, runtime, CriVerb::RemovePodSandbox, |rt, req| async move {
        rt.remove_pod_sandbox(req)
    });
    route(&mpx, runtime, CriVerb::PodSandboxStatus, |rt, req| async move {
        rt.pod_sandbox_status(req)
    });
    route(&mpx, runtime, CriVerb::ListPodSandbox, |rt, req| async move {
        rt.list_pod_sandbox(req)
    });
    route(&mpx, runtime, CriVerb::CreateContainer, |rt, req| async move {
        rt.create_container(req)
    });
    route(&mpx, runtime, CriVerb::StartContainer, |rt, req| async move {
        rt.start_container(req).await
    });
    route(&mpx, runtime, CriVerb::StopContainer, |rt, req| async move {
        rt.stop_container(req)
    });
    route(&mpx, runtime, CriVerb::RemoveContainer, |rt, req| async move {
        rt.remove_container(req)
    });
    route(&mpx, runtime, CriVerb::ListContainers, |rt, req| async move {
        rt.list_containers(req)
    });
    route(&mpx, runtime, CriVerb::ContainerStatus, |rt, req| async move {
        rt.container_status(req)
    });
    route(&mpx, runtime, CriVerb::ListImages, |rt, req| async move {
        rt.list_images(req)
    });
    route(&mpx, runtime, CriVerb::PullImage, |rt, req| async move {
        rt.pull_image(req).await
    });
    route(&mpx, runtime, CriVerb::RemoveImage, |rt, req| async move {
        rt.remove_image(req)
    });

    root.set_handler(CRI_PATH, Arc::new(mpx));
    root.set_handler(
        APPLICATION_PATH,
        Arc::new(ApplicationPipe {
            runtime: Arc::downgrade(runtime),
        }),
    );
}

/// Wire one verb: decode, apply, encode. A null payload decodes as `{}` so
/// request records whose fields all default can be called bare.
fn route<Req, Res, F, Fut>(mpx: &MultiPlexer, runtime: &Arc<Runtime>, verb: CriVerb, apply: F)
where
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
    F: Fn(Arc<Runtime>, Req) -> Fut + Copy + Send + Sync + 'static,
    Fut: Future<Output = Result<Res>> + Send + 'static,
{
    let runtime = runtime.clone();
    mpx.set_handler_fn(verb.as_ref(), move |data, _tags, writer| {
        let runtime = runtime.clone();
        async move {
            let data = if data.is_null() { json!({}) } else { data };
            let request: Req = match serde_json::from_value(data) {
                Ok(request) => request,
                Err(err) => {
                    writer
                        .reply_error(format!("malformed {verb} request: {err}"))
                        .await;
                    return Ok(());
                }
            };
            match apply(runtime, request).await {
                Ok(response) => writer.reply_success(serde_json::to_value(response)?).await,
                Err(err) => writer.reply_error(err.to_string()).await,
            }
            Ok(())
        }
    });
}

/// Forwards node-side calls under `application/` into the tagged container
/// over its private link.
pub struct ApplicationPipe {
    runtime: Weak<Runtime>,
}

#[async_trait]
impl Handler for ApplicationPipe {
    fn not_edge(&self) -> bool {
        true
    }

    async fn serve(&self, data: Value, tags: Tags, writer: ResponseWriter) -> anyhow::Result<()> {
        let Some(runtime) = self.runtime.upgrade() else {
            writer.reply_error("runtime is gone").await;
            return Ok(());
        };
        let Some(path) = tags.get(TAG_PATH).cloned() else {
            writer.reply_error("`path` tag should be set.").await;
            return Ok(());
        };
        let Some(container_id) = tags.get(CONTAINER_TAG).cloned() else {
            writer.reply_error("`container` tag should be set.").await;
            return Ok(());
        };
        let Some(container) = runtime.container(&container_id) else {
            writer
                .reply_error(format!("container isn't exist:{container_id}"))
                .await;
            return Ok(());
        };
        let Some(link) = container.link() else {
            writer
                .reply_error(format!("container isn't running:{container_id}"))
                .await;
            return Ok(());
        };

        match link.call(&path, data, &tags).await {
            Ok(response) => writer.reply_success(response).await,
            Err(err) => writer.reply_error(err.to_string()).await,
        }
        Ok(())
    }
}

/// Forwards container-side calls under `node/` to the node controller,
/// stamping the originating sandbox and container tags on the way out.
pub struct NodePipe {
    runtime: Weak<Runtime>,
    sandbox_id: String,
    container_id: String,
}

impl NodePipe {
    pub(crate) fn new(runtime: Weak<Runtime>, sandbox_id: String, container_id: String) -> Self {
        Self {
            runtime,
            sandbox_id,
            container_id,
        }
    }
}

#[async_trait]
impl Handler for NodePipe {
    fn not_edge(&self) -> bool {
        true
    }

    async fn serve(&self, data: Value, mut tags: Tags, writer: ResponseWriter) -> anyhow::Result<()> {
        let Some(runtime) = self.runtime.upgrade() else {
            writer.reply_error("runtime is gone").await;
            return Ok(());
        };
        let Some(path) = tags.get(TAG_PATH).cloned() else {
            writer.reply_error("`path` tag should be set.").await;
            return Ok(());
        };
        let Some(link) = runtime.node_link() else {
            writer.reply_error("node link is not set").await;
            return Ok(());
        };

        tags.insert(SANDBOX_TAG.to_string(), self.sandbox_id.clone());
        tags.insert(CONTAINER_TAG.to_string(), self.container_id.clone());

        match link.call(&path, data, &tags).await {
            Ok(response) => writer.reply_success(response).await,
            Err(err) => writer.reply_error(err.to_string()).await,
        }
        Ok(())
    }
}
