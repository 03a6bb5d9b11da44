//! Layered runtime configuration.
//!
//! Loaded from three layers, lowest priority first:
//! 1. compiled defaults ([`BraidSettings::default()`])
//! 2. a JSON file, deep-merged over the defaults
//! 3. `BRAID_*` environment variables
//!
//! The core consumes these knobs; it never writes them back.

pub mod loader;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tools::ToolCategory;

pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BraidSettings {
    pub server: ServerSettings,
    pub orchestrator: OrchestratorSettings,
    pub producer: ProducerSettings,
    pub delegation: DelegationSettings,
    pub tools: ToolSettings,
    pub broker: BrokerSettings,
    pub thread_cache: ThreadCacheSettings,
    pub logging: LoggingSettings,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// SQLite database path. Relative paths resolve against `~/.braid`.
    pub db_path: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9091,
            db_path: "braid.db".to_string(),
        }
    }
}

impl ServerSettings {
    pub fn resolved_db_path(&self) -> PathBuf {
        let path = PathBuf::from(&self.db_path);
        if path.is_absolute() {
            path
        } else {
            braid_home().join(path)
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorSettings {
    /// Upper bound on producer steps (tool round trips) per generation.
    pub max_steps: u32,
    /// Minimum spacing between in-flight upserts of the assistant node.
    pub flush_interval_ms: u64,
    pub master_name: String,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_steps: 16,
            flush_interval_ms: 250,
            master_name: "master".to_string(),
        }
    }
}

impl OrchestratorSettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Upstream model service speaking newline-delimited fragment JSON.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProducerSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub model: String,
    /// Error out a step when the upstream goes quiet this long.
    pub idle_timeout_ms: u64,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            model: "default".to_string(),
            idle_timeout_ms: 90_000,
        }
    }
}

impl ProducerSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DelegationSettings {
    pub max_depth: usize,
    pub approval_timeout_ms: u64,
    /// The closed set of sub-agents the master may delegate to.
    pub agents: Vec<AgentSettings>,
}

impl Default for DelegationSettings {
    fn default() -> Self {
        Self {
            max_depth: 4,
            approval_timeout_ms: 60_000,
            agents: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    pub name: String,
    pub description: String,
    /// Falls back to `producer.model`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Falls back to `producer.endpoint`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Tools this agent may call; every master tool when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exclude_tools: Vec<String>,
}

impl DelegationSettings {
    pub fn approval_timeout(&self) -> Duration {
        Duration::from_millis(self.approval_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolSettings {
    pub control_timeout_ms: u64,
    pub default_timeout_ms: u64,
    pub media_timeout_ms: u64,
    /// External agent CLI bound to sessions through the thread cache.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_cli: Option<ExternalCliSettings>,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            control_timeout_ms: 10_000,
            default_timeout_ms: 120_000,
            media_timeout_ms: 600_000,
            external_cli: None,
        }
    }
}

impl ToolSettings {
    pub fn timeout_for(&self, category: ToolCategory) -> Duration {
        let ms = match category {
            ToolCategory::Control => self.control_timeout_ms,
            ToolCategory::Standard => self.default_timeout_ms,
            ToolCategory::Media => self.media_timeout_ms,
        };
        Duration::from_millis(ms)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExternalCliSettings {
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerSettings {
    /// Live-chunk capacity of each subscriber channel beyond its replay.
    pub subscriber_queue: usize,
    /// How long a finalized stream stays resumable.
    pub retention_grace_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            subscriber_queue: 256,
            retention_grace_ms: 300_000,
            sweep_interval_ms: 30_000,
        }
    }
}

impl BrokerSettings {
    pub fn retention_grace(&self) -> Duration {
        Duration::from_millis(self.retention_grace_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThreadCacheSettings {
    pub ttl_secs: u64,
    pub max_entries: u64,
}

impl Default for ThreadCacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            max_entries: 512,
        }
    }
}

impl ThreadCacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

/// `~/.braid`, falling back to `/tmp/.braid` without a HOME.
pub fn braid_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".braid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_knobs() {
        let s = BraidSettings::default();
        assert_eq!(s.delegation.max_depth, 4);
        assert_eq!(s.delegation.approval_timeout(), Duration::from_secs(60));
        assert_eq!(s.server.port, 9091);
        assert_eq!(s.broker.subscriber_queue, 256);
        assert!(s.tools.external_cli.is_none());
        assert!(s.producer.endpoint.is_none());
        assert!(s.delegation.agents.is_empty());
    }

    #[test]
    fn agents_parse_with_fallbacks() {
        let s: BraidSettings = serde_json::from_str(
            r#"{"delegation": {"agents": [{"name": "researcher", "description": "finds things"}]}}"#,
        )
        .unwrap();
        assert_eq!(s.delegation.agents.len(), 1);
        assert_eq!(s.delegation.agents[0].name, "researcher");
        assert!(s.delegation.agents[0].model.is_none());
        assert!(s.delegation.agents[0].tools.is_none());
        assert!(s.delegation.agents[0].exclude_tools.is_empty());
        assert_eq!(s.delegation.max_depth, 4);
    }

    #[test]
    fn timeouts_per_category() {
        let t = ToolSettings::default();
        assert_eq!(t.timeout_for(ToolCategory::Control), Duration::from_secs(10));
        assert_eq!(t.timeout_for(ToolCategory::Standard), Duration::from_secs(120));
        assert_eq!(t.timeout_for(ToolCategory::Media), Duration::from_secs(600));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: BraidSettings =
            serde_json::from_str(r#"{"delegation": {"maxDepth": 2}}"#).unwrap();
        assert_eq!(s.delegation.max_depth, 2);
        assert_eq!(s.delegation.approval_timeout_ms, 60_000);
        assert_eq!(s.orchestrator.max_steps, 16);
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(BraidSettings::default()).unwrap();
        assert!(json["threadCache"]["ttlSecs"].is_u64());
        assert!(json["broker"]["retentionGraceMs"].is_u64());
    }

    #[test]
    fn absolute_db_path_kept() {
        let s = ServerSettings {
            db_path: "/var/lib/braid.db".into(),
            ..Default::default()
        };
        assert_eq!(s.resolved_db_path(), PathBuf::from("/var/lib/braid.db"));
        assert!(ServerSettings::default().resolved_db_path().ends_with(".braid/braid.db"));
    }
}
