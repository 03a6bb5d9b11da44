use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use super::{braid_home, BraidSettings, SettingsError};

/// `~/.braid/settings.json`.
pub fn settings_path() -> PathBuf {
    braid_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<BraidSettings, SettingsError> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<BraidSettings, SettingsError> {
    let defaults = serde_json::to_value(BraidSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: BraidSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    Ok(settings)
}

/// Objects merge recursively, arrays and scalars are replaced, nulls in
/// `source` leave `target` untouched.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `BRAID_*` overrides read through `lookup`. Invalid values are
/// ignored with a warning.
pub fn apply_env_overrides<F>(settings: &mut BraidSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = read_parsed::<u16, _>(&lookup, "BRAID_PORT", 0, u16::MAX) {
        settings.server.port = v;
    }
    if let Some(v) = lookup("BRAID_HOST").filter(|v| !v.is_empty()) {
        settings.server.host = v;
    }
    if let Some(v) = lookup("BRAID_DB_PATH").filter(|v| !v.is_empty()) {
        settings.server.db_path = v;
    }
    if let Some(v) = read_parsed::<usize, _>(&lookup, "BRAID_MAX_DEPTH", 1, 64) {
        settings.delegation.max_depth = v;
    }
    if let Some(v) = read_parsed::<u64, _>(&lookup, "BRAID_APPROVAL_TIMEOUT_MS", 1, 86_400_000) {
        settings.delegation.approval_timeout_ms = v;
    }
    if let Some(v) = lookup("BRAID_PRODUCER_URL").filter(|v| !v.is_empty()) {
        settings.producer.endpoint = Some(v);
    }
    if let Some(v) = lookup("BRAID_LOG_LEVEL").filter(|v| !v.is_empty()) {
        settings.logging.level = v;
    }
}

fn read_parsed<T, F>(lookup: &F, name: &str, min: T, max: T) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Copy,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    let parsed = raw.parse::<T>().ok().filter(|n| *n >= min && *n <= max);
    if parsed.is_none() {
        warn!(key = name, value = %raw, "invalid env override, ignoring");
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn merge_nested_override() {
        let merged = deep_merge(
            json!({"server": {"port": 8080, "host": "localhost"}}),
            json!({"server": {"port": 9090}}),
        );
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "localhost");
    }

    #[test]
    fn merge_array_replace() {
        let merged = deep_merge(json!({"items": [1, 2, 3]}), json!({"items": [4]}));
        assert_eq!(merged["items"], json!([4]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(json!({"a": 1}), json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn env_overrides_apply() {
        let mut s = BraidSettings::default();
        apply_env_overrides(
            &mut s,
            env(&[("BRAID_PORT", "7000"), ("BRAID_MAX_DEPTH", "2"), ("BRAID_LOG_LEVEL", "debug")]),
        );
        assert_eq!(s.server.port, 7000);
        assert_eq!(s.delegation.max_depth, 2);
        assert_eq!(s.logging.level, "debug");
    }

    #[test]
    fn invalid_env_values_ignored() {
        let mut s = BraidSettings::default();
        apply_env_overrides(
            &mut s,
            env(&[("BRAID_PORT", "not-a-port"), ("BRAID_MAX_DEPTH", "0")]),
        );
        assert_eq!(s.server.port, 9091);
        assert_eq!(s.delegation.max_depth, 4);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let path =
            std::env::temp_dir().join(format!("braid-missing-{}.json", uuid::Uuid::now_v7()));
        let s = load_settings_from_path(&path).unwrap();
        assert_eq!(s.orchestrator.max_steps, 16);
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = std::env::temp_dir().join(format!("braid-settings-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        std::fs::write(
            &path,
            r#"{"broker": {"subscriberQueue": 8}, "tools": {"mediaTimeoutMs": 5}}"#,
        )
        .unwrap();

        let s = load_settings_from_path(&path).unwrap();
        assert_eq!(s.broker.subscriber_queue, 8);
        assert_eq!(s.broker.retention_grace_ms, 300_000);
        assert_eq!(s.tools.media_timeout_ms, 5);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn invalid_json_is_error() {
        let dir = std::env::temp_dir().join(format!("braid-settings-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_settings_from_path(&path), Err(SettingsError::Json(_))));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
