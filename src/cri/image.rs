//! Image registry and the pull state machine.
//!
//! An [`ImageInstance`] is keyed by source URL and moves through
//! `Created → Downloading → {Downloaded | Error}`; `Error` may be retried.
//! Once `Downloaded` the artifact is shared read-only and never mutated.
//! A second pull of an in-flight URL never triggers a second fetch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error};

use crate::cri::mint_hex_id;
use crate::error::{Error, Result};

/// Where image bytes come from. The runtime only ever sees this seam, so
/// tests swap in an in-memory source and the production build uses HTTP.
#[async_trait]
pub trait ImageFetcher: Send + Sync + 'static {
    async fn fetch(&self, url: &str) -> std::result::Result<Vec<u8>, String>;
}

/// Fetches images over HTTP(S).
pub struct HttpImageFetcher {
    client: reqwest::Client,
}

impl HttpImageFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpImageFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> std::result::Result<Vec<u8>, String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        if !response.status().is_success() {
            return Err(response.status().to_string());
        }
        let bytes = response.bytes().await.map_err(|err| err.to_string())?;
        Ok(bytes.to_vec())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    Created,
    Downloading,
    Downloaded,
    Error,
}

impl ImageState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ImageState::Downloaded | ImageState::Error)
    }
}

struct ImageSlot {
    state: ImageState,
    bytes: Option<Arc<Vec<u8>>>,
}

/// One cached executable artifact, identified by source URL with a random
/// image-ref id exposed to callers.
pub struct ImageInstance {
    id: String,
    url: String,
    slot: Mutex<ImageSlot>,
    settled: watch::Sender<ImageState>,
}

impl ImageInstance {
    fn new(id: String, url: String) -> Arc<Self> {
        let (settled, _) = watch::channel(ImageState::Created);
        Arc::new(Self {
            id,
            url,
            slot: Mutex::new(ImageSlot {
                state: ImageState::Created,
                bytes: None,
            }),
            settled,
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(url: &str) -> Arc<Self> {
        Self::new("test-image".to_string(), url.to_string())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ImageState {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    /// The raw artifact, available once `Downloaded`.
    pub fn bytes(&self) -> Option<Arc<Vec<u8>>> {
        self.slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .bytes
            .clone()
    }

    /// Enter `Downloading` unless a fetch is already in flight. Returns
    /// whether the caller now owns the fetch.
    fn begin_download(&self) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        match slot.state {
            ImageState::Downloading | ImageState::Downloaded => false,
            ImageState::Created | ImageState::Error => {
                slot.state = ImageState::Downloading;
                let _ = self.settled.send(ImageState::Downloading);
                true
            }
        }
    }

    fn complete(&self, outcome: std::result::Result<Vec<u8>, String>) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        match outcome {
            Ok(bytes) => {
                slot.bytes = Some(Arc::new(bytes));
                slot.state = ImageState::Downloaded;
                debug!(url = %self.url, "image downloaded");
            }
            Err(reason) => {
                slot.state = ImageState::Error;
                error!(url = %self.url, %reason, "image download failed");
            }
        }
        let _ = self.settled.send(slot.state);
    }

    /// Wait until the instance reaches a terminal state.
    pub async fn settled(&self) -> ImageState {
        let mut rx = self.settled.subscribe();
        loop {
            let state = self.state();
            if state.is_terminal() {
                return state;
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }
}

/// Process-wide table of image instances, keyed by URL.
pub struct ImageRegistry {
    fetcher: Arc<dyn ImageFetcher>,
    images: Mutex<HashMap<String, Arc<ImageInstance>>>,
}

impl ImageRegistry {
    pub fn new(fetcher: Arc<dyn ImageFetcher>) -> Self {
        Self {
            fetcher,
            images: Mutex::new(HashMap::new()),
        }
    }

    /// Pull an image and wait for settlement. Idempotent per URL: a second
    /// pull returns the existing ref id and joins the in-flight fetch
    /// instead of starting another. A failed instance is retried.
    pub async fn pull(&self, url: &str) -> Result<String> {
        let image = self.ensure(url);
        match image.settled().await {
            ImageState::Downloaded => Ok(image.id().to_string()),
            _ => Err(Error::ImagePull(url.to_string())),
        }
    }

    fn ensure(&self, url: &str) -> Arc<ImageInstance> {
        let image = {
            let mut images = self.images.lock().unwrap_or_else(|e| e.into_inner());
            match images.get(url) {
                Some(existing) => existing.clone(),
                None => {
                    let id = mint_hex_id(|candidate| {
                        images.values().any(|image| image.id() == candidate)
                    });
                    let image = ImageInstance::new(id, url.to_string());
                    images.insert(url.to_string(), image.clone());
                    image
                }
            }
        };

        if image.begin_download() {
            let fetcher = self.fetcher.clone();
            let task_image = image.clone();
            tokio::spawn(async move {
                let outcome = fetcher.fetch(task_image.url()).await;
                task_image.complete(outcome);
            });
        }
        image
    }

    pub fn get(&self, url: &str) -> Option<Arc<ImageInstance>> {
        self.images
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(url)
            .cloned()
    }

    /// Remove an entry, but only in a terminal state and only when no
    /// container still holds a reference to it. Removing a `Downloading`
    /// instance is a no-op: the in-flight fetch completes into the orphaned
    /// instance and its result is silently discarded.
    pub fn remove(&self, url: &str) {
        let mut images = self.images.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(image) = images.get(url)
            && image.state().is_terminal()
            && Arc::strong_count(image) == 1
        {
            images.remove(url);
        }
    }

    /// All instances that finished downloading.
    pub fn list_downloaded(&self) -> Vec<Arc<ImageInstance>> {
        self.images
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|image| image.state() == ImageState::Downloaded)
            .cloned()
            .collect()
    }
}
