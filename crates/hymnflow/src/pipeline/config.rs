use std::time::Duration;

use crate::config::Config;

pub struct PipelineConfig {
    pub stage_timeout: Duration,
    pub default_duration_secs: u32,
}

impl PipelineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            stage_timeout: config.stage_timeout(),
            default_duration_secs: config.default_duration_secs,
        }
    }
}
