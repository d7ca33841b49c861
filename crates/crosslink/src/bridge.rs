//! Cross-runtime bridge: forwards crosslink traffic to and from a runtime
//! living behind a JSON-serialization boundary (e.g. a compiled module that
//! only exchanges plain strings).
//!
//! Only the envelope contract is fixed here: payloads cross the boundary as
//! JSON text, tag maps as JSON-encoded string dictionaries, correlation as a
//! plain integer id. How the far side marshals internally is its business.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::Rng;
use serde_json::Value;
use tracing::error;

use crate::{Channel, Crosslink, Handler, ResponseWriter, Tags};

/// The far end of the boundary.
pub trait FarRuntime: Send + Sync + 'static {
    /// A local call crossed the boundary; the far side must eventually
    /// complete it through [`Bridge::reply_from_far`] with the same id.
    fn serve_to_far(&self, id: u64, data: String, tags: String);

    /// A call issued by the far side settled locally; exactly one of
    /// `result`/`message` is meaningful (`message` empty means success).
    fn reply_to_far(&self, id: u64, result: String, message: String);
}

/// Channel adapter bridging one crosslink connection to a far runtime.
///
/// Inbound calls on the channel are parked by id and handed to the far side
/// as strings; far-side calls are forwarded onto the channel and answered
/// back by id.
pub struct Bridge {
    link: Arc<Crosslink>,
    far: Arc<dyn FarRuntime>,
    parked: DashMap<u64, ResponseWriter>,
}

struct BoundaryHandler {
    bridge: Weak<Bridge>,
}

#[async_trait]
impl Handler for BoundaryHandler {
    fn not_edge(&self) -> bool {
        true
    }

    async fn serve(&self, data: Value, tags: Tags, writer: ResponseWriter) -> anyhow::Result<()> {
        match self.bridge.upgrade() {
            Some(bridge) => bridge.park(data, tags, writer),
            None => writer.reply_error("bridge detached").await,
        }
        Ok(())
    }
}

impl Bridge {
    /// Attach a bridge to one end of a channel. Every inbound call is handed
    /// to `far`; local outbound traffic originates from `call_from_far`.
    pub fn connect(channel: Arc<dyn Channel>, far: Arc<dyn FarRuntime>) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let handler = Arc::new(BoundaryHandler {
                bridge: weak.clone(),
            });
            Bridge {
                link: Arc::new(Crosslink::new(channel, handler)),
                far,
                parked: DashMap::new(),
            }
        })
    }

    fn park(&self, data: Value, tags: Tags, writer: ResponseWriter) {
        let tags = match serde_json::to_string(&tags) {
            Ok(tags) => tags,
            Err(err) => {
                error!(%err, "unencodable tag map at bridge boundary");
                return;
            }
        };
        let data = data.to_string();

        let slot = writer;
        loop {
            let id = rand::rng().random::<u64>();
            match self.parked.entry(id) {
                Entry::Vacant(vacant) => {
                    vacant.insert(slot);
                    self.far.serve_to_far(id, data, tags);
                    return;
                }
                Entry::Occupied(_) => continue,
            }
        }
    }

    /// Completion of a call previously handed over via `serve_to_far`.
    /// An empty `message` means success and `result` carries JSON text.
    pub fn reply_from_far(&self, id: u64, result: String, message: String) {
        let Some((_, writer)) = self.parked.remove(&id) else {
            error!(id, "far runtime completed an unknown call, dropping");
            return;
        };

        tokio::spawn(async move {
            if !message.is_empty() {
                writer.reply_error(message).await;
                return;
            }
            match serde_json::from_str::<Value>(&result) {
                Ok(value) => writer.reply_success(value).await,
                Err(err) => {
                    writer
                        .reply_error(format!("malformed result at bridge boundary: {err}"))
                        .await
                }
            }
        });
    }

    /// A call originating on the far side, to be forwarded over the channel.
    /// The outcome is pushed back through `reply_to_far` under the same id.
    pub fn call_from_far(&self, id: u64, path: String, data: String, tags: String) {
        let far = self.far.clone();
        let link = self.link.clone();

        let tags: Tags = match serde_json::from_str(&tags) {
            Ok(tags) => tags,
            Err(err) => {
                far.reply_to_far(id, String::new(), format!("malformed tag map: {err}"));
                return;
            }
        };
        let data: Value = match serde_json::from_str(&data) {
            Ok(data) => data,
            Err(err) => {
                far.reply_to_far(id, String::new(), format!("malformed payload: {err}"));
                return;
            }
        };

        tokio::spawn(async move {
            match link.call(&path, data, &tags).await {
                Ok(result) => far.reply_to_far(id, result.to_string(), String::new()),
                Err(err) => far.reply_to_far(id, String::new(), err.to_string()),
            }
        });
    }
}
