//! Named-channel message passing between the host and an engine.
//!
//! Every provisioned engine owns one [`Messenger`]. Host-side capabilities
//! register a [`MessageHandler`] per channel; code running inside the engine
//! calls [`Messenger::send`] with a channel, a method name and JSON arguments.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use crate::error::BridgeError;

/// Host-side implementation behind one channel.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, method: &str, args: Value) -> Result<Value, BridgeError>;

    /// Release engine-bound resources. Called best-effort during teardown.
    fn detach(&self) -> Result<(), BridgeError> {
        Ok(())
    }
}

/// Cloneable handle to an engine's channel table.
#[derive(Clone, Default)]
pub struct Messenger {
    handlers: Arc<DashMap<String, Arc<dyn MessageHandler>>>,
}

impl Messenger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` on `channel`, replacing any previous handler.
    pub fn set_handler(&self, channel: &str, handler: Arc<dyn MessageHandler>) {
        if self
            .handlers
            .insert(channel.to_string(), handler)
            .is_some()
        {
            debug!(%channel, "handler replaced");
        }
    }

    pub fn remove_handler(&self, channel: &str) -> bool {
        self.handlers.remove(channel).is_some()
    }

    pub fn has_handler(&self, channel: &str) -> bool {
        self.handlers.contains_key(channel)
    }

    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Drop every handler. Further sends fail with `ChannelNotFound`.
    pub fn clear(&self) {
        self.handlers.clear();
    }

    /// Invoke `method` on the handler registered for `channel`.
    pub async fn send(&self, channel: &str, method: &str, args: Value) -> Result<Value, BridgeError> {
        // Clone the Arc out so no map guard is held across the await.
        let handler = self
            .handlers
            .get(channel)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| BridgeError::ChannelNotFound {
                channel: channel.to_string(),
            })?;
        handler.handle(method, args).await
    }
}
