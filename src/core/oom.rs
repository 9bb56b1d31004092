//! OOM score adjustments applied to application processes

use serde::{Deserialize, Serialize};

use super::error::{Error, Result};

/// Lowest value the kernel accepts for `oom_score_adj`
pub const OOM_SCORE_MIN: i32 = -1000;
/// Highest value the kernel accepts for `oom_score_adj`
pub const OOM_SCORE_MAX: i32 = 1000;

/// A labelled `oom_score_adj` value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OomScore {
    value: i32,
    label: String,
}

impl OomScore {
    /// Score for an application that is paused in the background
    pub fn paused() -> Self {
        Self {
            value: 900,
            label: "paused".to_string(),
        }
    }

    /// Score for the application the user is looking at
    pub fn focused() -> Self {
        Self {
            value: 100,
            label: "focused".to_string(),
        }
    }

    /// Any value inside the kernel's range
    pub fn custom(value: i32) -> Result<Self> {
        if !(OOM_SCORE_MIN..=OOM_SCORE_MAX).contains(&value) {
            return Err(Error::InvalidArgument(format!(
                "OOM score {} outside [{}, {}]",
                value, OOM_SCORE_MIN, OOM_SCORE_MAX
            )));
        }
        Ok(Self {
            value,
            label: "custom".to_string(),
        })
    }

    pub fn value(&self) -> i32 {
        self.value
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Default for OomScore {
    fn default() -> Self {
        Self {
            value: 0,
            label: "default".to_string(),
        }
    }
}
