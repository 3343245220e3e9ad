use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{MemwakeError, Result};

/// Daily wake window `[start_hour, end_hour)` in local wall-clock hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourWindow {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl HourWindow {
    pub const fn new(start_hour: u32, end_hour: u32) -> Self {
        Self {
            start_hour,
            end_hour,
        }
    }

    /// Reject empty or inverted windows and hours past midnight.
    ///
    /// The window scheduler assumes a validated window; callers run this once
    /// when the configuration is loaded.
    pub fn validate(&self) -> Result<()> {
        if self.start_hour >= self.end_hour || self.end_hour > 24 {
            return Err(MemwakeError::InvalidWindow {
                start: self.start_hour,
                end: self.end_hour,
            });
        }
        Ok(())
    }

    pub fn contains_hour(&self, hour: u32) -> bool {
        (self.start_hour..self.end_hour).contains(&hour)
    }
}

impl Default for HourWindow {
    fn default() -> Self {
        Self::new(9, 21)
    }
}

impl fmt::Display for HourWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:00-{:02}:00", self.start_hour, self.end_hour)
    }
}
