//! Completion Bridge: how code inside an engine reports lifecycle events.
//!
//! The host registers a [`CompletionBridge`] on [`BG_HOST_CHANNEL`] before
//! invoking the entry point. `close` and the host's external stop feed the
//! same [`CompletionSignal`], whose latch lets only the first trigger through.

use async_trait::async_trait;
use memwake_scheduler::WorkCompleter;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{
    error::BridgeError,
    messenger::{MessageHandler, Messenger},
};

pub const BG_HOST_CHANNEL: &str = "memwake.BackgroundWorkerBgHostApi";
pub const METHOD_ON_INITIALIZED: &str = "onInitialized";
pub const METHOD_CLOSE: &str = "close";

/// What moved a session into `Completing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The entry point called `close`.
    Close,
    /// The queue asked the worker to stop.
    Stop,
}

/// Shared latch + wake-up for one session.
#[derive(Clone)]
pub struct CompletionSignal {
    latch: WorkCompleter,
    tx: mpsc::UnboundedSender<Trigger>,
}

impl CompletionSignal {
    pub fn new(latch: WorkCompleter, tx: mpsc::UnboundedSender<Trigger>) -> Self {
        Self { latch, tx }
    }

    /// Returns `true` when this call was the first trigger.
    pub fn fire(&self, trigger: Trigger) -> bool {
        if !self.latch.claim() {
            debug!(?trigger, "completion already triggered; ignoring");
            return false;
        }
        info!(?trigger, "completion triggered");
        // The session task owns the receiver until it has torn down.
        let _ = self.tx.send(trigger);
        true
    }

    pub fn is_fired(&self) -> bool {
        self.latch.is_claimed()
    }
}

/// Host side of the background host API.
pub struct CompletionBridge {
    signal: CompletionSignal,
}

impl CompletionBridge {
    pub fn new(signal: CompletionSignal) -> Self {
        Self { signal }
    }
}

#[async_trait]
impl MessageHandler for CompletionBridge {
    async fn handle(&self, method: &str, _args: Value) -> Result<Value, BridgeError> {
        match method {
            // Informational only for this worker.
            METHOD_ON_INITIALIZED => {
                debug!("engine reported initialized");
                Ok(Value::Null)
            }
            METHOD_CLOSE => {
                self.signal.fire(Trigger::Close);
                Ok(Value::Null)
            }
            other => Err(BridgeError::MethodNotImplemented {
                channel: BG_HOST_CHANNEL.to_string(),
                method: other.to_string(),
            }),
        }
    }
}

/// Engine-side convenience wrapper around the completion channel.
#[derive(Clone)]
pub struct BgHostClient {
    messenger: Messenger,
}

impl BgHostClient {
    pub fn new(messenger: Messenger) -> Self {
        Self { messenger }
    }

    pub async fn on_initialized(&self) -> Result<(), BridgeError> {
        self.messenger
            .send(BG_HOST_CHANNEL, METHOD_ON_INITIALIZED, Value::Null)
            .await
            .map(|_| ())
    }

    pub async fn close(&self) -> Result<(), BridgeError> {
        self.messenger
            .send(BG_HOST_CHANNEL, METHOD_CLOSE, Value::Null)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memwake_scheduler::{completion_pair, WorkHandle, WorkOutcome};
    use std::sync::Arc;

    fn wired() -> (
        BgHostClient,
        CompletionSignal,
        mpsc::UnboundedReceiver<Trigger>,
        WorkCompleter,
        WorkHandle,
    ) {
        let (latch, handle) = completion_pair();
        let (tx, rx) = mpsc::unbounded_channel();
        let signal = CompletionSignal::new(latch.clone(), tx);
        let messenger = Messenger::new();
        messenger.set_handler(
            BG_HOST_CHANNEL,
            Arc::new(CompletionBridge::new(signal.clone())),
        );
        (BgHostClient::new(messenger), signal, rx, latch, handle)
    }

    #[tokio::test]
    async fn close_fires_once() {
        let (client, signal, mut rx, _latch, _handle) = wired();
        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(signal.is_fired());
        assert_eq!(rx.recv().await, Some(Trigger::Close));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stop_then_late_close_is_ignored() {
        let (client, signal, mut rx, _latch, _handle) = wired();
        assert!(signal.fire(Trigger::Stop));
        client.close().await.unwrap();
        assert_eq!(rx.recv().await, Some(Trigger::Stop));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn on_initialized_has_no_effect() {
        let (client, signal, mut rx, latch, handle) = wired();
        client.on_initialized().await.unwrap();
        assert!(!signal.is_fired());
        assert!(!latch.is_claimed());
        assert!(rx.try_recv().is_err());
        // The latch is still free for the real trigger.
        assert!(latch.complete(WorkOutcome::Success));
        assert_eq!(handle.await, WorkOutcome::Success);
    }

    #[tokio::test]
    async fn close_outcome_reaches_the_handle() {
        let (client, _signal, mut rx, latch, handle) = wired();
        client.close().await.unwrap();
        assert_eq!(rx.recv().await, Some(Trigger::Close));
        // The trigger only claims; the session resolves after teardown.
        assert!(latch.is_claimed());
        assert!(latch.resolve(WorkOutcome::Success));
        assert_eq!(handle.await, WorkOutcome::Success);
    }

    #[tokio::test]
    async fn unknown_method_rejected() {
        let (client, ..) = wired();
        let err = client
            .messenger
            .send(BG_HOST_CHANNEL, "restart", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::MethodNotImplemented { .. }));
    }
}
