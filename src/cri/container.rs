//! Container entity: one runnable unit bound to an image, executed inside
//! its own isolated execution context behind a dedicated crosslink
//! connection.
//!
//! Lifecycle is derived from timestamps, never stored twice: no start
//! timestamp means `Created`, a start without a finish means `Running`,
//! both present means `Exited`. Start validation failure exits immediately
//! with the sentinel code without ever spawning a context; a stop that the
//! context ignores is force-settled with 137 when the grace period runs out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use crosslink::{Channel, Crosslink, Handler, MultiPlexer, Tags};
use serde_json::json;
use tracing::{debug, warn};

use crate::cri::types::{ContainerState, FinishedRequest, ReadyResponse};
use crate::error::{Error, Result};

/// Path prefix of the bootstrap namespace on the per-container link.
pub const MANAGER_PATH: &str = "manager";

/// Start validation failed; nothing was ever executed.
pub const SENTINEL_EXIT_CODE: i32 = -1;
/// 128 + SIGKILL: the context did not stop within the grace period.
pub const FORCED_EXIT_CODE: i32 = 137;

/// Teardown handle for a spawned execution context.
pub trait ContextHandle: Send + 'static {
    fn terminate(&mut self);
}

/// A freshly spawned isolated execution context, reachable only through its
/// channel endpoint.
pub struct SpawnedContext {
    pub channel: Arc<dyn Channel>,
    pub handle: Box<dyn ContextHandle>,
}

/// Spawns isolated execution contexts. The real collaborator is a worker
/// host; tests script one over an in-process channel pair.
#[async_trait]
pub trait ContextSpawner: Send + Sync + 'static {
    async fn spawn(&self) -> std::result::Result<SpawnedContext, String>;
}

struct Lifecycle {
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    link: Option<Arc<Crosslink>>,
    context: Option<Box<dyn ContextHandle>>,
}

pub struct Container {
    id: String,
    sandbox_id: String,
    name: String,
    image: Arc<crate::cri::image::ImageInstance>,
    runtime: Vec<String>,
    args: Vec<String>,
    envs: HashMap<String, String>,
    created_at: DateTime<Utc>,
    lifecycle: Mutex<Lifecycle>,
}

pub(crate) fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl Container {
    pub fn new(
        id: String,
        sandbox_id: String,
        name: String,
        image: Arc<crate::cri::image::ImageInstance>,
        runtime: Vec<String>,
        args: Vec<String>,
        envs: HashMap<String, String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            sandbox_id,
            name,
            image,
            runtime,
            args,
            envs,
            created_at: Utc::now(),
            lifecycle: Mutex::new(Lifecycle {
                started_at: None,
                finished_at: None,
                exit_code: None,
                link: None,
                context: None,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &Arc<crate::cri::image::ImageInstance> {
        &self.image
    }

    pub fn created_at(&self) -> String {
        rfc3339(self.created_at)
    }

    pub fn state(&self) -> ContainerState {
        let lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        if lifecycle.finished_at.is_some() {
            ContainerState::Exited
        } else if lifecycle.started_at.is_some() {
            ContainerState::Running
        } else {
            ContainerState::Created
        }
    }

    /// `(startedAt, finishedAt, exitCode)` as the status verbs report them:
    /// empty string / zero until set.
    pub fn status_fields(&self) -> (String, String, i32) {
        let lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        (
            lifecycle.started_at.map(rfc3339).unwrap_or_default(),
            lifecycle.finished_at.map(rfc3339).unwrap_or_default(),
            lifecycle.exit_code.unwrap_or(0),
        )
    }

    /// The private link to the running context, if any.
    pub fn link(&self) -> Option<Arc<Crosslink>> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .link
            .clone()
    }

    /// Start the container. On validation failure (image not downloaded, no
    /// supported runtime declared) the container exits immediately with the
    /// sentinel code and no context is spawned.
    ///
    /// `node_pipe`, when present, is mounted under `node/` on the private
    /// link so the context can reach the node-side controller.
    pub async fn start(
        self: &Arc<Self>,
        spawner: &Arc<dyn ContextSpawner>,
        supported_runtimes: &[String],
        grace: Duration,
        node_pipe: Option<Arc<dyn Handler>>,
    ) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            if lifecycle.started_at.is_some() {
                return Err(Error::ContainerAlreadyStarted);
            }
            lifecycle.started_at = Some(Utc::now());
        }

        if !self.check_startable(supported_runtimes) {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            lifecycle.exit_code = Some(SENTINEL_EXIT_CODE);
            lifecycle.finished_at = Some(Utc::now());
            return Ok(());
        }

        let context = match spawner.spawn().await {
            Ok(context) => context,
            Err(reason) => {
                let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
                lifecycle.exit_code = Some(SENTINEL_EXIT_CODE);
                lifecycle.finished_at = Some(Utc::now());
                return Err(Error::Spawn(reason));
            }
        };

        let root = MultiPlexer::new();
        root.set_handler(MANAGER_PATH, Arc::new(self.manager_namespace(grace)));
        if let Some(pipe) = node_pipe {
            root.set_handler("node", pipe);
        }

        let link = Arc::new(Crosslink::new(context.channel, Arc::new(root)));
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        lifecycle.link = Some(link);
        lifecycle.context = Some(context.handle);
        debug!(container = %self.id, "container started");
        Ok(())
    }

    /// Best-effort terminate plus a hard deadline: send `manager/term`, then
    /// force exit code 137 and tear the context down if the context has not
    /// self-reported by the time the grace period elapses.
    pub fn stop(self: &Arc<Self>, grace: Duration) {
        let link = self.link();
        let Some(link) = link else {
            // never started, already exited and cleaned, or bare validation
            // failure: nothing to terminate
            return;
        };

        tokio::spawn(async move {
            let _ = link.call("manager/term", json!({}), &Tags::new()).await;
        });

        let container = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            {
                let mut lifecycle = container
                    .lifecycle
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                if lifecycle.finished_at.is_none() {
                    lifecycle.exit_code = Some(FORCED_EXIT_CODE);
                    lifecycle.finished_at = Some(Utc::now());
                    warn!(container = %container.id, "grace period expired, force killing");
                }
            }
            container.cleanup();
        });
    }

    /// Tear down the execution context and drop the private link.
    pub fn cleanup(&self) {
        let (link, context) = {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            (lifecycle.link.take(), lifecycle.context.take())
        };
        if let Some(mut context) = context {
            context.terminate();
        }
        drop(link);
    }

    fn check_startable(&self, supported_runtimes: &[String]) -> bool {
        if self.image.bytes().is_none() {
            warn!(container = %self.id, "can not start container without the image");
            return false;
        }
        let satisfied = self
            .runtime
            .iter()
            .any(|required| supported_runtimes.iter().any(|have| have == required));
        if !satisfied {
            warn!(
                container = %self.id,
                runtime = ?self.runtime,
                "minimum required runtime is not specified"
            );
        }
        satisfied
    }

    /// Handlers for the `manager/` namespace on the private link: `ready`
    /// hands the context its image/args/envs, `finished` records the exit.
    fn manager_namespace(self: &Arc<Self>, grace: Duration) -> MultiPlexer {
        let namespace = MultiPlexer::new();

        let container = Arc::downgrade(self);
        namespace.set_handler_fn("ready", move |_, _, writer| {
            let container = container.clone();
            async move {
                let Some(container) = container.upgrade() else {
                    writer.reply_error("container is gone").await;
                    return Ok(());
                };
                let Some(bytes) = container.image.bytes() else {
                    anyhow::bail!("the image should be pulled");
                };
                let response = ReadyResponse {
                    name: container.image.url().to_string(),
                    image: bytes.as_ref().clone(),
                    args: container.args.clone(),
                    envs: container.envs.clone(),
                };
                writer.reply_success(serde_json::to_value(response)?).await;
                Ok(())
            }
        });

        let container = Arc::downgrade(self);
        namespace.set_handler_fn("finished", move |data, _, writer| {
            let container = container.clone();
            async move {
                let Some(container) = container.upgrade() else {
                    writer.reply_error("container is gone").await;
                    return Ok(());
                };
                let request: FinishedRequest = serde_json::from_value(data)?;
                container.on_finished(request.code, grace);
                writer.reply_success(json!({})).await;
                Ok(())
            }
        });

        namespace
    }

    fn on_finished(self: &Arc<Self>, code: i32, grace: Duration) {
        {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            if lifecycle.finished_at.is_some() {
                warn!(container = %self.id, "finished reported more than once");
                return;
            }
            lifecycle.exit_code = Some(code);
            lifecycle.finished_at = Some(Utc::now());
        }
        debug!(container = %self.id, code, "container finished");

        // the context gets the grace period to wind down before teardown
        let container = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            container.cleanup();
        });
    }
}
