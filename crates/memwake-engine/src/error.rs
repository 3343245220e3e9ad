//! Error types for the memwake-engine crate.

use thiserror::Error;

/// Failures on the host/engine message channel.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Nothing is registered under the channel name.
    #[error("No handler on channel {channel}")]
    ChannelNotFound { channel: String },

    /// The handler exists but does not know the method.
    #[error("Method {method} not implemented on {channel}")]
    MethodNotImplemented { channel: String, method: String },

    /// Arguments did not match what the method expects.
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    /// The capability is not available in this host.
    #[error("Capability {channel} is unsupported in this host")]
    Unsupported { channel: String },

    /// The handler ran and failed.
    #[error("{channel} failed: {reason}")]
    Failed { channel: String, reason: String },
}

/// Failures while provisioning or tearing down an engine.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// `ensure_initialization_complete` was awaited before `start_initialization`.
    #[error("Engine loader initialization was never started")]
    LoaderNotStarted,

    /// The loader reported a failure.
    #[error("Engine loader initialization failed: {0}")]
    InitFailed(String),

    /// The loader did not become ready within the configured bound.
    #[error("Engine loader initialization timed out after {ms}ms")]
    InitTimeout { ms: u64 },

    /// The engine could not be created.
    #[error("Engine provisioning failed: {0}")]
    Provision(String),

    /// No entry point is registered under the requested name.
    #[error("Entry point not found: {library}::{name}")]
    EntrypointNotFound { library: String, name: String },

    /// An engine runs exactly one entry point per lifecycle.
    #[error("Entry point already invoked on this engine")]
    EntrypointAlreadyRunning,

    /// Destroying the engine failed.
    #[error("Engine teardown failed: {0}")]
    Teardown(String),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, LifecycleError>;
