use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemwakeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid hour window: start {start} must be below end {end} (max 24)")]
    InvalidWindow { start: u32, end: u32 },
}

impl MemwakeError {
    /// Short error code string used in structured log fields.
    pub fn code(&self) -> &'static str {
        match self {
            MemwakeError::Config(_) => "CONFIG_ERROR",
            MemwakeError::InvalidWindow { .. } => "INVALID_WINDOW",
        }
    }
}

pub type Result<T> = std::result::Result<T, MemwakeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_cover_every_variant() {
        assert_eq!(MemwakeError::Config("bad toml".into()).code(), "CONFIG_ERROR");
        let err = MemwakeError::InvalidWindow { start: 22, end: 8 };
        assert_eq!(err.code(), "INVALID_WINDOW");
        assert!(err.to_string().contains("start 22"));
    }
}
