//! `memwake-engine`: provisions an isolated engine per job firing, wires the
//! capability bridges into it, runs one entry point and tears everything down
//! exactly once when the entry point (or the queue) says it is done.

pub mod bridge;
pub mod completion;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod local;
pub mod messenger;

pub use bridge::BridgeSet;
pub use completion::{BgHostClient, CompletionBridge, CompletionSignal, Trigger};
pub use engine::{Engine, EngineFactory, EngineLoader, EngineSlot, Entrypoint};
pub use error::{BridgeError, LifecycleError, Result};
pub use lifecycle::{EngineSession, LifecycleManager, LifecycleState};
pub use local::{EntrypointRegistry, LocalEngine, LocalEngineFactory, LocalLoader};
pub use messenger::{MessageHandler, Messenger};
