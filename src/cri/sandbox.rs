//! Pod sandbox entity: a named grouping of containers with a one-way
//! `Ready → NotReady` state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::cri::container::{Container, rfc3339};
use crate::cri::types::{PodSandboxMetadata, PodSandboxState};
use crate::error::{Error, Result};

// State and membership share one lock: the Ready check before an insert and
// the NotReady transition with its member snapshot must each be atomic, or a
// create racing a stop could slip a container into a dead sandbox.
struct Inner {
    state: PodSandboxState,
    containers: HashMap<String, Arc<Container>>,
}

pub struct Sandbox {
    id: String,
    metadata: PodSandboxMetadata,
    created_at: DateTime<Utc>,
    inner: Mutex<Inner>,
}

impl Sandbox {
    pub fn new(id: String, metadata: PodSandboxMetadata) -> Arc<Self> {
        Arc::new(Self {
            id,
            metadata,
            created_at: Utc::now(),
            inner: Mutex::new(Inner {
                state: PodSandboxState::Ready,
                containers: HashMap::new(),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn metadata(&self) -> &PodSandboxMetadata {
        &self.metadata
    }

    pub fn created_at(&self) -> String {
        rfc3339(self.created_at)
    }

    pub fn state(&self) -> PodSandboxState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    /// Move to `NotReady` and stop every member container. Idempotent; there
    /// is no way back to `Ready`. The transition and the member snapshot are
    /// one atomic step, so a container is either stopped here or was never
    /// admitted.
    pub fn stop(&self, grace: Duration) {
        let members: Vec<Arc<Container>> = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.state = PodSandboxState::NotReady;
            inner.containers.values().cloned().collect()
        };
        for container in members {
            container.stop(grace);
        }
    }

    /// Register a container under this sandbox. Names are unique per
    /// sandbox; a sandbox that already stopped accepts nothing.
    pub fn add_container(&self, container: Arc<Container>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.state != PodSandboxState::Ready {
            return Err(Error::SandboxNotReady);
        }
        if inner
            .containers
            .values()
            .any(|existing| existing.name() == container.name())
        {
            return Err(Error::DuplicateContainerName);
        }
        inner.containers.insert(container.id().to_string(), container);
        Ok(())
    }

    pub fn remove_container(&self, container_id: &str) -> Option<Arc<Container>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .containers
            .remove(container_id)
    }

    pub fn containers(&self) -> Vec<Arc<Container>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .containers
            .values()
            .cloned()
            .collect()
    }

    pub fn container_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .containers
            .keys()
            .cloned()
            .collect()
    }
}
