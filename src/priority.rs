//! Priority levels shared by tasks, queue entries and messages
//!
//! Higher values sort first in the broker queue.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Priority class (0 = lowest, 4 = emergency)
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Urgent = 3,
    Emergency = 4,
}

impl Priority {
    /// All levels from lowest to highest
    pub const ALL: [Priority; 5] = [
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Urgent,
        Priority::Emergency,
    ];

    /// Numeric rank as stored in the database
    pub fn rank(self) -> i64 {
        self as u8 as i64
    }

    /// Inverse of [`Priority::rank`], clamping unknown values
    pub fn from_rank(rank: i64) -> Self {
        match rank {
            i64::MIN..=0 => Self::Low,
            1 => Self::Normal,
            2 => Self::High,
            3 => Self::Urgent,
            _ => Self::Emergency,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
            Self::Emergency => "emergency",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str().to_uppercase())
    }
}

impl FromStr for Priority {
    type Err = crate::ConclaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" | "0" => Ok(Self::Low),
            "normal" | "1" => Ok(Self::Normal),
            "high" | "2" => Ok(Self::High),
            "urgent" | "3" => Ok(Self::Urgent),
            "emergency" | "4" => Ok(Self::Emergency),
            other => Err(crate::ConclaveError::Other(format!(
                "Invalid priority '{}'. Must be one of: low, normal, high, urgent, emergency",
                other
            ))),
        }
    }
}
