//! `memwake-core`: configuration, shared types and the top-level error for
//! the memwake workspace.

pub mod config;
pub mod error;
pub mod types;

pub use config::MemwakeConfig;
pub use error::{MemwakeError, Result};
pub use types::HourWindow;
