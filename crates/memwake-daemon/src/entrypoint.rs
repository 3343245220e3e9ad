//! The memory-notification entry point run inside each provisioned engine.

use futures_util::FutureExt;
use memwake_engine::{
    bridge::{CONNECTIVITY_CHANNEL, LOCK_CHANNEL},
    BgHostClient, BridgeError, Entrypoint, EntrypointRegistry, Messenger,
};
use serde_json::Value;
use tracing::{info, warn};

use crate::bridges::{METHOD_GET_CAPABILITIES, METHOD_LOCK, METHOD_UNLOCK};

pub fn register(registry: &EntrypointRegistry, entrypoint: Entrypoint) {
    registry.register(entrypoint, |messenger| run(messenger).boxed());
}

/// Always ends with `close`, whatever happened before it.
pub async fn run(messenger: Messenger) {
    let host = BgHostClient::new(messenger.clone());
    if let Err(e) = host.on_initialized().await {
        warn!("onInitialized failed: {e}");
    }

    match notify(&messenger).await {
        Ok(true) => {}
        Ok(false) => info!("engine lock held elsewhere; skipping memory notification"),
        Err(e) => warn!("memory notification failed: {e}"),
    }

    if let Err(e) = host.close().await {
        warn!("close failed: {e}");
    }
}

/// Returns `false` when the engine lock could not be taken.
async fn notify(messenger: &Messenger) -> Result<bool, BridgeError> {
    let acquired = messenger.send(LOCK_CHANNEL, METHOD_LOCK, Value::Null).await?;
    if acquired != Value::Bool(true) {
        return Ok(false);
    }

    let result = messenger
        .send(CONNECTIVITY_CHANNEL, METHOD_GET_CAPABILITIES, Value::Null)
        .await;
    if let Err(e) = messenger.send(LOCK_CHANNEL, METHOD_UNLOCK, Value::Null).await {
        warn!("engine unlock failed: {e}");
    }

    let online = result?
        .as_array()
        .is_some_and(|caps| caps.iter().any(|c| c == "internet"));
    info!(online, "memory notification triggered");
    Ok(true)
}
