//! Capability bridges this daemon can back itself. Sync, thumbnail and
//! foreground-host capabilities live in the full application and are
//! registered here as explicit "unsupported" stubs so the channel surface
//! stays complete.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use memwake_core::config::ConnectivityConfig;
use memwake_engine::{
    bridge::{
        CONNECTIVITY_CHANNEL, FOREGROUND_HOST_CHANNEL, LOCK_CHANNEL, SYNC_CHANNEL,
        THUMBNAIL_CHANNEL,
    },
    BridgeError, BridgeSet, MessageHandler,
};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tracing::{debug, info};

pub const METHOD_LOCK: &str = "lock";
pub const METHOD_UNLOCK: &str = "unlock";
pub const METHOD_IS_LOCKED: &str = "isLocked";
pub const METHOD_GET_CAPABILITIES: &str = "getCapabilities";

/// In-process exclusive lock shared by every engine this daemon provisions.
#[derive(Default)]
pub struct EngineLockBridge {
    locked: AtomicBool,
}

impl EngineLockBridge {
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }
}

#[async_trait]
impl MessageHandler for EngineLockBridge {
    async fn handle(&self, method: &str, _args: Value) -> Result<Value, BridgeError> {
        match method {
            // true when this call took the lock
            METHOD_LOCK => {
                let acquired = !self.locked.swap(true, Ordering::AcqRel);
                debug!(acquired, "engine lock requested");
                Ok(Value::Bool(acquired))
            }
            METHOD_UNLOCK => {
                self.locked.store(false, Ordering::Release);
                Ok(Value::Null)
            }
            METHOD_IS_LOCKED => Ok(Value::Bool(self.is_locked())),
            other => Err(BridgeError::MethodNotImplemented {
                channel: LOCK_CHANNEL.to_string(),
                method: other.to_string(),
            }),
        }
    }

    /// A torn-down engine can no longer release the lock itself.
    fn detach(&self) -> Result<(), BridgeError> {
        if self.locked.swap(false, Ordering::AcqRel) {
            info!("engine lock released on detach");
        }
        Ok(())
    }
}

/// Reports `internet` when a TCP connection to the probe address succeeds.
pub struct ConnectivityBridge {
    probe_addr: String,
    timeout: Duration,
}

impl ConnectivityBridge {
    pub fn new(cfg: &ConnectivityConfig) -> Self {
        Self {
            probe_addr: cfg.probe_addr.clone(),
            timeout: Duration::from_millis(cfg.probe_timeout_ms),
        }
    }

    async fn probe(&self) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(self.probe_addr.as_str())).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(addr = %self.probe_addr, "connectivity probe failed: {e}");
                false
            }
            Err(_) => {
                debug!(addr = %self.probe_addr, "connectivity probe timed out");
                false
            }
        }
    }
}

#[async_trait]
impl MessageHandler for ConnectivityBridge {
    async fn handle(&self, method: &str, _args: Value) -> Result<Value, BridgeError> {
        match method {
            METHOD_GET_CAPABILITIES => {
                let caps: Vec<&str> = if self.probe().await {
                    vec!["internet"]
                } else {
                    Vec::new()
                };
                Ok(json!(caps))
            }
            other => Err(BridgeError::MethodNotImplemented {
                channel: CONNECTIVITY_CHANNEL.to_string(),
                method: other.to_string(),
            }),
        }
    }
}

/// Placeholder for a capability implemented outside this daemon.
pub struct UnsupportedBridge {
    channel: &'static str,
}

impl UnsupportedBridge {
    pub fn new(channel: &'static str) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl MessageHandler for UnsupportedBridge {
    async fn handle(&self, _method: &str, _args: Value) -> Result<Value, BridgeError> {
        Err(BridgeError::Unsupported {
            channel: self.channel.to_string(),
        })
    }
}

/// The daemon's full bridge set.
pub fn build_bridge_set(connectivity: &ConnectivityConfig) -> BridgeSet {
    BridgeSet {
        sync: Arc::new(UnsupportedBridge::new(SYNC_CHANNEL)),
        thumbnail: Arc::new(UnsupportedBridge::new(THUMBNAIL_CHANNEL)),
        connectivity: Arc::new(ConnectivityBridge::new(connectivity)),
        lock: Arc::new(EngineLockBridge::default()),
        foreground_host: Arc::new(UnsupportedBridge::new(FOREGROUND_HOST_CHANNEL)),
    }
}
