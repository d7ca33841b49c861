//! Crosslink: a bidirectional, asynchronous request/response RPC engine that
//! runs over any ordered, reliable message channel.
//!
//! One [`Crosslink`] instance sits on each end of a [`Channel`]. Outbound
//! [`Crosslink::call`]s are correlated by a randomly drawn id and settle when
//! the peer answers with a reply or error envelope. Inbound calls are served
//! by the local root [`Handler`], usually a [`MultiPlexer`] routing on the
//! slash-delimited `path` tag.
//!
//! There is no retry and no transport-level timeout: a caller that needs a
//! deadline races the returned future against its own timer, and a vanished
//! peer leaves outstanding calls pending forever.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub mod bridge;
pub mod channel;
pub mod multiplexer;

pub use channel::{Channel, ChannelClosed, InProcessChannel};
pub use multiplexer::MultiPlexer;

/// Reserved tag: the full dispatch path, set once at the call site.
pub const TAG_PATH: &str = "path";
/// Reserved tag: the unresolved path suffix, rewritten at each routing hop.
pub const TAG_LEAF: &str = "leaf";

/// String tags carried with every call.
pub type Tags = HashMap<String, String>;

/// One unit on the wire: a call, a reply, or an error, correlated by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    Call {
        id: u32,
        #[serde(default)]
        tags: Tags,
        #[serde(default)]
        data: Value,
    },
    Reply {
        id: u32,
        result: Value,
    },
    Error {
        id: u32,
        message: String,
    },
}

/// Why a [`Crosslink::call`] did not resolve with a reply payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// The peer answered with an error envelope carrying this message.
    #[error("{0}")]
    Remote(String),
    /// The channel went away before the call could be posted or answered.
    #[error("channel closed before a reply arrived")]
    ChannelClosed,
}

/// One-shot reply handle bound to a single inbound call.
///
/// At most one of `reply_success`/`reply_error` takes effect; a second reply
/// is dropped with a local warning and never reaches the wire.
pub struct ResponseWriter {
    id: u32,
    channel: Arc<dyn Channel>,
    replied: Arc<AtomicBool>,
}

impl ResponseWriter {
    fn new(id: u32, channel: Arc<dyn Channel>) -> Self {
        Self {
            id,
            channel,
            replied: Arc::new(AtomicBool::new(false)),
        }
    }

    fn replied_flag(&self) -> Arc<AtomicBool> {
        self.replied.clone()
    }

    pub async fn reply_success(&self, result: Value) {
        if self.replied.swap(true, Ordering::SeqCst) {
            warn!(id = self.id, "response already replied, dropping");
            return;
        }
        let _ = self
            .channel
            .send(Envelope::Reply {
                id: self.id,
                result,
            })
            .await;
    }

    pub async fn reply_error(&self, message: impl Into<String>) {
        if self.replied.swap(true, Ordering::SeqCst) {
            warn!(id = self.id, "response already replied, dropping");
            return;
        }
        let _ = self
            .channel
            .send(Envelope::Error {
                id: self.id,
                message: message.into(),
            })
            .await;
    }

    pub fn is_replied(&self) -> bool {
        self.replied.load(Ordering::SeqCst)
    }
}

/// Anything that can answer an inbound call.
///
/// A handler returning `Err` without having replied gets its error converted
/// into an `exception: ...` error envelope by the engine, so a buggy handler
/// can never leave the caller without an answer it could have had.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Composite handlers (routers, pipes accepting a subtree) return true;
    /// terminal handlers keep the default and are only dispatched when the
    /// remaining path is empty.
    fn not_edge(&self) -> bool {
        false
    }

    async fn serve(&self, data: Value, tags: Tags, writer: ResponseWriter) -> anyhow::Result<()>;
}

type ServeFn =
    dyn Fn(Value, Tags, ResponseWriter) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// Terminal handler wrapping an async closure.
pub struct FnHandler(Box<ServeFn>);

impl FnHandler {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Value, Tags, ResponseWriter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self(Box::new(move |data, tags, writer| {
            f(data, tags, writer).boxed()
        }))
    }
}

#[async_trait]
impl Handler for FnHandler {
    async fn serve(&self, data: Value, tags: Tags, writer: ResponseWriter) -> anyhow::Result<()> {
        (self.0)(data, tags, writer).await
    }
}

type Waiting = oneshot::Sender<Result<Value, String>>;

// Correlation ids are drawn from the 31-bit range.
const ID_RANGE: u32 = 1 << 31;
// Bounded rejection sampling before falling back to a counter scan.
const MAX_ID_DRAWS: u32 = 64;

/// The per-channel RPC engine.
pub struct Crosslink {
    channel: Arc<dyn Channel>,
    pending: Arc<DashMap<u32, Waiting>>,
    fallback_id: AtomicU32,
    reader: JoinHandle<()>,
}

impl Crosslink {
    /// Attach an engine to one end of a channel, serving inbound calls with
    /// `handler`. The reader task runs until the channel drains or the
    /// engine is dropped.
    pub fn new(channel: Arc<dyn Channel>, handler: Arc<dyn Handler>) -> Self {
        let pending: Arc<DashMap<u32, Waiting>> = Arc::new(DashMap::new());

        let reader = tokio::spawn({
            let channel = channel.clone();
            let pending = pending.clone();
            async move {
                while let Some(envelope) = channel.recv().await {
                    match envelope {
                        Envelope::Call { id, tags, data } => {
                            Self::dispatch(&channel, &handler, id, tags, data);
                        }
                        Envelope::Reply { id, result } => Self::settle(&pending, id, Ok(result)),
                        Envelope::Error { id, message } => {
                            Self::settle(&pending, id, Err(message))
                        }
                    }
                }
                debug!("channel drained, crosslink reader stopped");
            }
        });

        Self {
            channel,
            pending,
            fallback_id: AtomicU32::new(0),
            reader,
        }
    }

    /// Post a call and wait for the matching reply or error.
    ///
    /// The caller's tag map is copied, never mutated; the `path` tag is
    /// stamped on the copy. Resolves with the peer's reply payload or fails
    /// with the peer's error message.
    pub async fn call(&self, path: &str, data: Value, tags: &Tags) -> Result<Value, CallError> {
        let mut tags = tags.clone();
        tags.insert(TAG_PATH.to_string(), path.to_string());

        let (tx, rx) = oneshot::channel();
        let id = self.register(tx);

        if self
            .channel
            .send(Envelope::Call { id, tags, data })
            .await
            .is_err()
        {
            self.pending.remove(&id);
            return Err(CallError::ChannelClosed);
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(message)) => Err(CallError::Remote(message)),
            Err(_) => Err(CallError::ChannelClosed),
        }
    }

    /// Claim an id unique among currently pending calls.
    fn register(&self, tx: Waiting) -> u32 {
        let slot = tx;
        for _ in 0..MAX_ID_DRAWS {
            let id = rand::rng().random_range(0..ID_RANGE);
            match self.pending.entry(id) {
                Entry::Vacant(vacant) => {
                    vacant.insert(slot);
                    return id;
                }
                Entry::Occupied(_) => continue,
            }
        }
        // Practically unreachable unless the pending table is saturated;
        // scan from a monotonic counter instead of looping on rand.
        loop {
            let id = self.fallback_id.fetch_add(1, Ordering::Relaxed) % ID_RANGE;
            match self.pending.entry(id) {
                Entry::Vacant(vacant) => {
                    vacant.insert(slot);
                    return id;
                }
                Entry::Occupied(_) => continue,
            }
        }
    }

    fn dispatch(channel: &Arc<dyn Channel>, handler: &Arc<dyn Handler>, id: u32, tags: Tags, data: Value) {
        let writer = ResponseWriter::new(id, channel.clone());
        let replied = writer.replied_flag();
        let handler = handler.clone();
        let channel = channel.clone();
        // Served on its own task so a slow handler never stalls the reader,
        // and so a handler may call back over this same link before replying.
        // Panics are caught too: an unanswered failure of any kind must reach
        // the caller as an error envelope, never as a silent hang.
        tokio::spawn(async move {
            let outcome = std::panic::AssertUnwindSafe(handler.serve(data, tags, writer))
                .catch_unwind()
                .await;
            let message = match outcome {
                Ok(Ok(())) => return,
                Ok(Err(err)) => {
                    error!(id, %err, "handler failed");
                    format!("exception: {err}")
                }
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "handler panicked".to_string());
                    error!(id, %reason, "handler panicked");
                    format!("exception: {reason}")
                }
            };
            if !replied.load(Ordering::SeqCst) {
                let _ = channel.send(Envelope::Error { id, message }).await;
            }
        });
    }

    fn settle(pending: &DashMap<u32, Waiting>, id: u32, outcome: Result<Value, String>) {
        match pending.remove(&id) {
            Some((_, tx)) => {
                // The caller may have given up waiting; nothing to do then.
                let _ = tx.send(outcome);
            }
            None => {
                // A peer bug, not ours: log it and keep the reader running.
                error!(id, "reply for unknown or already settled call, dropping");
            }
        }
    }
}

impl Drop for Crosslink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
