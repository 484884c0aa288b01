//! Configuration data model and discovery/persistence (`ConfigStore`).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::codec::ReturnType;
use crate::error::ConfigError;

const CONFIG_FILE_NAME: &str = "eplumber.json";

fn default_window() -> usize {
    crate::sensor::DEFAULT_WINDOW
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub recipients: Vec<String>,
}

fn default_mqtt_port() -> u16 {
    1883
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// A sensor descriptor exactly as it appears in the configuration file.
/// `type` decides which variant the registry constructs; `json_path` is
/// only meaningful when `type == "http"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSensorDescriptor {
    pub r#type: String,
    pub name: String,
    #[serde(default)]
    pub route: String,
    pub return_type: ReturnType,
    #[serde(default)]
    pub json_path: Option<String>,
    #[serde(default = "default_window")]
    pub value_list_length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDescriptor {
    pub name: String,
    pub route: String,
}

/// One rule as it appears in the configuration file: `tests` is a list of
/// `[sensor_name, op, value]` triples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDescriptor {
    pub name: String,
    pub tests: Vec<(String, String, serde_json::Value)>,
    pub action: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub global: GlobalConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub sensors: Vec<RawSensorDescriptor>,
    #[serde(default)]
    pub actions: Vec<ActionDescriptor>,
    #[serde(default)]
    pub rules: Vec<RuleDescriptor>,
}

/// Loads configuration from disk and writes it back. Discovery order: the
/// current working directory first, then the user config directory.
/// No schema versioning.
pub struct ConfigStore {
    /// Explicit override (e.g. `--config`), checked before the discovery order.
    override_path: Option<PathBuf>,
}

impl ConfigStore {
    pub fn new(override_path: Option<PathBuf>) -> Self {
        Self { override_path }
    }

    fn candidate_paths(&self) -> Vec<PathBuf> {
        if let Some(p) = &self.override_path {
            return vec![p.clone()];
        }
        let mut candidates = vec![PathBuf::from(CONFIG_FILE_NAME)];
        if let Some(dir) = dirs::config_dir() {
            candidates.push(dir.join("eplumber").join(CONFIG_FILE_NAME));
        }
        candidates
    }

    /// Locate and load the configuration, returning the path it was read from.
    pub fn load(&self) -> Result<(Configuration, PathBuf), ConfigError> {
        for path in self.candidate_paths() {
            if path.is_file() {
                return self.load_from(&path).map(|cfg| (cfg, path));
            }
        }
        Err(ConfigError::NotFound)
    }

    fn load_from(&self, path: &Path) -> Result<Configuration, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let cfg: Configuration = serde_json::from_str(&text)?;
        Ok(cfg)
    }

    /// Validate that `text` parses as a well-formed `Configuration` value
    /// (used by `PUT /api/config` before persisting anything to disk).
    pub fn parse(text: &str) -> Result<Configuration, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Persist `config` to `path`, pretty-printed with 2-space indent.
    pub fn save(config: &Configuration, path: &Path) -> Result<(), ConfigError> {
        let mut buf = Vec::new();
        let mut ser = serde_json::Serializer::with_formatter(
            &mut buf,
            serde_json::ser::PrettyFormatter::with_indent(b"  "),
        );
        config.serialize(&mut ser).map_err(ConfigError::Parse)?;
        fs::write(path, buf).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn sample_json() -> &'static str {
        r#"{
            "mqtt": {"host": "localhost"},
            "sensors": [
                {"type": "mqtt", "name": "temp", "route": "temp/topic", "return_type": "float", "value_list_length": 3}
            ],
            "actions": [{"name": "cool", "route": "http://x/on"}],
            "rules": [
                {"name": "r1", "tests": [["temp", ">", 25]], "action": "cool"}
            ]
        }"#
    }

    #[test]
    fn parses_minimal_config() {
        let cfg = ConfigStore::parse(sample_json()).unwrap();
        assert_eq!(cfg.mqtt.host, "localhost");
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.sensors.len(), 1);
        assert_eq!(cfg.rules[0].tests.len(), 1);
        assert!(cfg.rules[0].active);
    }

    #[test]
    fn round_trips_through_save_and_load() {
        let cfg = ConfigStore::parse(sample_json()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eplumber.json");
        ConfigStore::save(&cfg, &path).unwrap();

        let mut contents = String::new();
        std::fs::File::open(&path)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert!(contents.starts_with("{\n  "));

        let store = ConfigStore::new(Some(path));
        let (reloaded, _) = store.load().unwrap();
        assert_eq!(reloaded.mqtt.host, cfg.mqtt.host);
        assert_eq!(reloaded.rules.len(), cfg.rules.len());
    }
}
