//! Configuration loading.
//!
//! Resolution order for the config file:
//! 1. explicit `--config` path (with `~` / `$VAR` expansion)
//! 2. `$ROADWATCH_CONFIG`
//! 3. `<platform config dir>/roadwatch/config.toml`
//!
//! A missing file at a default location yields [`Config::default`]; a missing
//! explicit path is an error.

pub mod schema;

pub use schema::{BackoffConfig, BrokerConfig, Config, PositionConfig, SyncConfig, TopicConfig};

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const CONFIG_ENV: &str = "ROADWATCH_CONFIG";
const CONFIG_FILE: &str = "config.toml";

/// Default config path under the platform config directory.
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "roadwatch", "roadwatch")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

/// Expand `~` and environment variables in a user-supplied path.
pub fn expand_path(raw: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(raw)
        .with_context(|| format!("Failed to expand config path '{raw}'"))?;
    Ok(PathBuf::from(expanded.as_ref()))
}

/// Parse a TOML document into a validated [`Config`].
pub fn parse(contents: &str) -> Result<Config> {
    let config: Config =
        toml::from_str(contents).map_err(|e| anyhow::anyhow!("Failed to parse config: {e}"))?;
    validate(&config)?;
    Ok(config)
}

/// Load configuration, honouring the resolution order above.
pub fn load(explicit: Option<&str>) -> Result<Config> {
    if let Some(raw) = explicit {
        let path = expand_path(raw)?;
        return load_file(&path);
    }
    if let Ok(raw) = std::env::var(CONFIG_ENV) {
        if !raw.trim().is_empty() {
            let path = expand_path(&raw)?;
            return load_file(&path);
        }
    }
    match default_config_path() {
        Some(path) if path.exists() => load_file(&path),
        _ => {
            tracing::debug!("No config file found, using defaults");
            Ok(Config::default())
        }
    }
}

fn load_file(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config = parse(&contents).with_context(|| format!("Invalid config {}", path.display()))?;
    tracing::debug!(path = %path.display(), "Loaded config");
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.broker.host.trim().is_empty() {
        anyhow::bail!("broker.host cannot be empty");
    }
    if config.topics.new_marker.trim().is_empty() || config.topics.approval.trim().is_empty() {
        anyhow::bail!("topics.new_marker and topics.approval must both be set");
    }
    if config.topics.new_marker == config.topics.approval {
        anyhow::bail!(
            "topics.new_marker and topics.approval must differ (both are '{}')",
            config.topics.approval
        );
    }
    if config.sync.backoff.initial_ms == 0 || config.sync.backoff.max_ms < config.sync.backoff.initial_ms
    {
        anyhow::bail!("sync.backoff requires 0 < initial_ms <= max_ms");
    }
    match (config.position.latitude, config.position.longitude) {
        (Some(lat), Some(lon)) if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) => {
            anyhow::bail!("position ({lat}, {lon}) is out of range")
        }
        _ => Ok(()),
    }
}

/// JSON schema of the config file, for editors and docs.
pub fn json_schema() -> Result<String> {
    let schema = schemars::schema_for!(Config);
    Ok(serde_json::to_string_pretty(&schema)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ReconcilePolicy;
    use tempfile::TempDir;

    #[test]
    fn empty_document_yields_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.topics.new_marker, "WORLD");
        assert_eq!(config.topics.approval, "ApproveWORLD");
        assert_eq!(config.sync.policy, ReconcilePolicy::LastWriteWins);
        assert_eq!(config.broker.port, 1883);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = parse(
            r#"
            [broker]
            host = "broker.example.com"

            [sync]
            policy = "max_approvals"
            dedup_window_secs = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.broker.host, "broker.example.com");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.sync.policy, ReconcilePolicy::MaxApprovals);
        assert_eq!(config.sync.dedup_window_secs, 5);
        assert_eq!(config.sync.publish_retries, 2);
    }

    #[test]
    fn rejects_identical_topics() {
        let err = parse(
            r#"
            [topics]
            new_marker = "same"
            approval = "same"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("must differ"));
    }

    #[test]
    fn rejects_bad_backoff_and_position() {
        assert!(parse("[sync.backoff]\ninitial_ms = 0").is_err());
        assert!(parse("[sync.backoff]\ninitial_ms = 100\nmax_ms = 10").is_err());
        assert!(parse("[position]\nlatitude = 95.0\nlongitude = 0.0").is_err());
    }

    #[test]
    fn rejects_unknown_policy() {
        let err = parse("[sync]\npolicy = \"first_write_wins\"").unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn load_explicit_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[broker]\nport = 8883\n").unwrap();

        let config = load(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(config.broker.port, 8883);
    }

    #[test]
    fn load_missing_explicit_path_fails() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("absent.toml");
        let err = load(Some(path.to_str().unwrap())).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn schema_export_mentions_sections() {
        let schema = json_schema().unwrap();
        assert!(schema.contains("broker"));
        assert!(schema.contains("topics"));
        assert!(schema.contains("max_approvals"));
    }
}
