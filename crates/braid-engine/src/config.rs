use std::time::Duration;

use braid_core::settings::{BraidSettings, ToolSettings};

/// Engine knobs resolved from settings once at startup.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub master_name: String,
    pub max_steps: u32,
    pub flush_interval: Duration,
    pub max_depth: usize,
    pub approval_timeout: Duration,
    pub tools: ToolSettings,
}

impl EngineConfig {
    pub fn from_settings(settings: &BraidSettings) -> Self {
        Self {
            master_name: settings.orchestrator.master_name.clone(),
            max_steps: settings.orchestrator.max_steps.max(1),
            flush_interval: settings.orchestrator.flush_interval(),
            max_depth: settings.delegation.max_depth.max(1),
            approval_timeout: settings.delegation.approval_timeout(),
            tools: settings.tools.clone(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_settings(&BraidSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_settings() {
        let config = EngineConfig::default();
        assert_eq!(config.master_name, "master");
        assert_eq!(config.max_steps, 16);
        assert_eq!(config.max_depth, 4);
        assert_eq!(config.approval_timeout, Duration::from_secs(60));
        assert_eq!(config.flush_interval, Duration::from_millis(250));
    }

    #[test]
    fn zero_limits_are_clamped() {
        let mut settings = BraidSettings::default();
        settings.orchestrator.max_steps = 0;
        settings.delegation.max_depth = 0;
        let config = EngineConfig::from_settings(&settings);
        assert_eq!(config.max_steps, 1);
        assert_eq!(config.max_depth, 1);
    }
}
