//! Machine configuration

use pane_core::logging::{LogConfig, LogFilterError};
use serde::{Deserialize, Serialize};

use crate::ppu::DOTS_PER_FRAME;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NesConfig {
    /// Picture-unit steps run before each CPU cycle
    pub ppu_steps_per_cpu_step: u32,
    /// Picture-unit steps per frame
    pub frame_dots: u64,
    /// Log filter, e.g. "info,cpu=trace"
    pub log: Option<String>,
}

impl Default for NesConfig {
    fn default() -> Self {
        Self {
            ppu_steps_per_cpu_step: 3,
            frame_dots: DOTS_PER_FRAME,
            log: None,
        }
    }
}

impl NesConfig {
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Reason this configuration cannot drive a machine, if any.
    pub fn problem(&self) -> Option<&'static str> {
        if self.ppu_steps_per_cpu_step == 0 {
            Some("ppu_steps_per_cpu_step must be at least 1")
        } else if self.frame_dots == 0 {
            Some("frame_dots must be at least 1")
        } else {
            None
        }
    }

    /// Apply `log` to the global logging configuration.
    pub fn apply_logging(&self) -> Result<(), LogFilterError> {
        match &self.log {
            Some(filter) => LogConfig::global().apply_filter(filter),
            None => Ok(()),
        }
    }
}
