//! The fixed capability surface attached to every engine.
//!
//! Foreground and background engines receive the same [`BridgeSet`], so code
//! running inside an engine sees identical channels whatever started it. The
//! capability implementations themselves live with the host.

use std::sync::Arc;

use tracing::warn;

use crate::messenger::{MessageHandler, Messenger};

pub const SYNC_CHANNEL: &str = "memwake.NativeSyncApi";
pub const THUMBNAIL_CHANNEL: &str = "memwake.ThumbnailApi";
pub const CONNECTIVITY_CHANNEL: &str = "memwake.ConnectivityApi";
pub const LOCK_CHANNEL: &str = "memwake.BackgroundWorkerLockApi";
pub const FOREGROUND_HOST_CHANNEL: &str = "memwake.BackgroundWorkerFgHostApi";

/// One handler per capability. Every field is required.
#[derive(Clone)]
pub struct BridgeSet {
    pub sync: Arc<dyn MessageHandler>,
    pub thumbnail: Arc<dyn MessageHandler>,
    pub connectivity: Arc<dyn MessageHandler>,
    pub lock: Arc<dyn MessageHandler>,
    pub foreground_host: Arc<dyn MessageHandler>,
}

impl BridgeSet {
    /// Channel names in registration order.
    pub const CHANNELS: [&'static str; 5] = [
        LOCK_CHANNEL,
        SYNC_CHANNEL,
        THUMBNAIL_CHANNEL,
        FOREGROUND_HOST_CHANNEL,
        CONNECTIVITY_CHANNEL,
    ];

    fn entries(&self) -> [(&'static str, &Arc<dyn MessageHandler>); 5] {
        [
            (LOCK_CHANNEL, &self.lock),
            (SYNC_CHANNEL, &self.sync),
            (THUMBNAIL_CHANNEL, &self.thumbnail),
            (FOREGROUND_HOST_CHANNEL, &self.foreground_host),
            (CONNECTIVITY_CHANNEL, &self.connectivity),
        ]
    }

    /// Attach every capability to `messenger`.
    pub fn register_all(&self, messenger: &Messenger) {
        for (channel, handler) in self.entries() {
            messenger.set_handler(channel, Arc::clone(handler));
        }
    }

    /// Detach every capability. Failures are logged and skipped.
    pub fn detach_all(&self) {
        for (channel, handler) in self.entries() {
            if let Err(e) = handler.detach() {
                warn!(%channel, "bridge detach failed: {e}");
            }
        }
    }
}
