//! Hub configuration loaded from `config.json` in the data directory.
//!
//! The file is strongly typed: required fields are checked up front and every
//! missing one is reported in a single error, instead of failing on the first.
//! Top-level keys that are not part of the hub schema are kept verbatim as
//! per-core config subtrees and distributed over the bus at startup.

use crate::error::{HubError, HubResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

fn default_stage_timeout_secs() -> u64 {
    30
}

/// Connection parameters for the message bus, also handed to launched Cores
/// as `--host`/`--port` (and `--user`/`--pass` when both are set).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

impl BusConfig {
    /// True when both credentials are present.
    pub fn authenticated(&self) -> bool {
        !self.user.is_empty() && !self.password.is_empty()
    }
}

/// A Core that runs somewhere else but is reachable over the bus. It joins
/// the roster and receives a central config, but is never launched locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalCore {
    pub id: String,
}

/// Orchestrator-specific settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    /// Mirror log lines published by other Cores to local output.
    #[serde(default)]
    pub show_remote_logs: bool,
    /// Cores registered without a local process handle.
    #[serde(default)]
    pub external_cores: Vec<ExternalCore>,
    /// How long a pipeline stage may wait for its bus event before the
    /// session is forcibly reset to idle.
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            show_remote_logs: false,
            external_cores: Vec::new(),
            stage_timeout_secs: default_stage_timeout_secs(),
        }
    }
}

/// The hub-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    pub instance_name: String,
    pub device_id: String,
    pub bus: BusConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    /// Everything else in the file, keyed by Core id. Distributed as each
    /// Core's central config.
    #[serde(flatten)]
    pub core_sections: Map<String, Value>,
}

/// Mirror of [`HubConfig`] with every field optional, so validation can see
/// the whole file before rejecting it.
#[derive(Debug, Deserialize)]
struct RawHubConfig {
    instance_name: Option<String>,
    device_id: Option<String>,
    bus: Option<RawBusConfig>,
    orchestrator: Option<OrchestratorSection>,
    #[serde(flatten)]
    core_sections: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawBusConfig {
    host: Option<String>,
    port: Option<u16>,
    #[serde(default)]
    user: String,
    #[serde(default)]
    password: String,
}

impl HubConfig {
    /// Parse and validate a config file's contents.
    pub fn from_json(raw: &str) -> HubResult<Self> {
        let raw: RawHubConfig = serde_json::from_str(raw)?;
        let mut missing = Vec::new();

        if raw.instance_name.is_none() {
            missing.push("instance_name".to_string());
        }
        if raw.device_id.is_none() {
            missing.push("device_id".to_string());
        }
        match &raw.bus {
            None => missing.push("bus".to_string()),
            Some(bus) => {
                if bus.host.is_none() {
                    missing.push("bus.host".to_string());
                }
                if bus.port.is_none() {
                    missing.push("bus.port".to_string());
                }
            }
        }

        if !missing.is_empty() {
            return Err(HubError::MissingConfigFields(missing));
        }

        let bus = raw.bus.unwrap_or(RawBusConfig {
            host: None,
            port: None,
            user: String::new(),
            password: String::new(),
        });
        Ok(Self {
            instance_name: raw.instance_name.unwrap_or_default(),
            device_id: raw.device_id.unwrap_or_default(),
            bus: BusConfig {
                host: bus.host.unwrap_or_default(),
                port: bus.port.unwrap_or_default(),
                user: bus.user,
                password: bus.password,
            },
            orchestrator: raw.orchestrator.unwrap_or_default(),
            core_sections: raw.core_sections,
        })
    }

    /// Load the config from `path`, writing a default file first if none
    /// exists. An unreadable or invalid file is fatal to startup.
    pub fn load_or_default(path: &Path) -> HubResult<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "No config found, writing a default one");
            let default = Self::default();
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, serde_json::to_string_pretty(&default)?)?;
            return Ok(default);
        }
        let raw = fs::read_to_string(path).map_err(|e| {
            HubError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    /// The central-config subtree for a Core, or an empty object when the
    /// file has no section for it.
    pub fn core_section(&self, core_id: &str) -> Value {
        self.core_sections
            .get(core_id)
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()))
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            instance_name: "Chime".to_string(),
            device_id: "default".to_string(),
            bus: BusConfig {
                host: "localhost".to_string(),
                port: 1883,
                user: String::new(),
                password: String::new(),
            },
            orchestrator: OrchestratorSection::default(),
            core_sections: Map::new(),
        }
    }
}

/// The hub's data directory: `$CHIME_DATA_DIR` or `~/.config/chime`.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CHIME_DATA_DIR") {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".config").join("chime")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_config_parses() {
        let config = HubConfig::from_json(
            r#"{
                "instance_name": "Living Room",
                "device_id": "abc123",
                "bus": {"host": "localhost", "port": 1883},
                "orchestrator": {"show_remote_logs": true},
                "wled": {"ips": ["10.0.0.2"]}
            }"#,
        )
        .unwrap();

        assert_eq!(config.device_id, "abc123");
        assert!(config.orchestrator.show_remote_logs);
        assert_eq!(config.orchestrator.stage_timeout_secs, 30);
        assert_eq!(config.core_section("wled")["ips"][0], "10.0.0.2");
        assert_eq!(config.core_section("nonexistent"), serde_json::json!({}));
    }

    #[test]
    fn missing_fields_are_all_reported_at_once() {
        let err = HubConfig::from_json(r#"{"bus": {"host": "localhost"}}"#).unwrap_err();
        match err {
            HubError::MissingConfigFields(fields) => {
                assert_eq!(fields, vec!["instance_name", "device_id", "bus.port"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn default_config_validates() {
        let default = HubConfig::default();
        let json = serde_json::to_string(&default).unwrap();
        let reloaded = HubConfig::from_json(&json).unwrap();
        assert_eq!(reloaded.bus.port, 1883);
        assert!(!reloaded.bus.authenticated());
    }
}
