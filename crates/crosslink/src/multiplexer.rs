//! Hierarchical path routing over one crosslink connection.
//!
//! A [`MultiPlexer`] is itself a [`Handler`], so routers nest to form a
//! tree: each hop strips one segment off the `leaf` tag and forwards the
//! remainder. Terminal (edge) handlers only match when they consume the
//! whole remaining path; composite handlers accept any suffix. Everything
//! else lands on the default handler, which answers "handler not found".

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::{FnHandler, Handler, ResponseWriter, TAG_LEAF, TAG_PATH, Tags};

struct NotFoundHandler;

#[async_trait]
impl Handler for NotFoundHandler {
    async fn serve(&self, _: Value, tags: Tags, writer: ResponseWriter) -> anyhow::Result<()> {
        let path = tags.get(TAG_PATH).cloned().unwrap_or_default();
        writer
            .reply_error(format!("handler not found. path:{path}"))
            .await;
        Ok(())
    }
}

pub struct MultiPlexer {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
    default_handler: RwLock<Arc<dyn Handler>>,
}

impl MultiPlexer {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            default_handler: RwLock::new(Arc::new(NotFoundHandler)),
        }
    }

    pub fn set_handler(&self, pattern: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pattern.into(), handler);
    }

    pub fn set_handler_fn<F, Fut>(&self, pattern: impl Into<String>, f: F)
    where
        F: Fn(Value, Tags, ResponseWriter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.set_handler(pattern, Arc::new(FnHandler::new(f)));
    }

    pub fn set_default_handler(&self, handler: Arc<dyn Handler>) {
        *self
            .default_handler
            .write()
            .unwrap_or_else(|e| e.into_inner()) = handler;
    }

    fn lookup(&self, segment: &str) -> Option<Arc<dyn Handler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(segment)
            .cloned()
    }

    fn default(&self) -> Arc<dyn Handler> {
        self.default_handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Default for MultiPlexer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for MultiPlexer {
    fn not_edge(&self) -> bool {
        true
    }

    async fn serve(&self, data: Value, mut tags: Tags, writer: ResponseWriter) -> anyhow::Result<()> {
        let Some(path) = tags.get(TAG_PATH).cloned() else {
            writer.reply_error("`path` tag should be set.").await;
            return Ok(());
        };

        // first hop: the unresolved suffix is the whole path
        let leaf = tags.get(TAG_LEAF).cloned().unwrap_or_else(|| path.clone());
        let leaf = leaf.strip_prefix('/').unwrap_or(&leaf);
        let (segment, rest) = match leaf.split_once('/') {
            Some((segment, rest)) => (segment.to_string(), rest.to_string()),
            None => (leaf.to_string(), String::new()),
        };

        tags.insert(TAG_LEAF.to_string(), rest.clone());

        let handler = match self.lookup(&segment) {
            Some(named) if named.not_edge() => named,
            Some(named) if rest.is_empty() => {
                // an edge handler consumed the path exactly
                tags.remove(TAG_LEAF);
                named
            }
            _ => self.default(),
        };

        handler.serve(data, tags, writer).await
    }
}
