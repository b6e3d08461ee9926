//! Runtime configuration.
//!
//! Defaults live in code. JSON files in the system and user configuration
//! directories override them key by key, the user file winning, and `ACCEL_*`
//! environment variables override both. Keys missing from every file keep
//! their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::Preset;

/// File name looked up in each configuration directory.
const CONFIG_FILE: &str = "accel.json";

/// System-wide configuration directory.
const SYSTEM_CONFIG_DIR: &str = "/etc/accelcodec";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
}

/// Tunables for device selection, negotiation and sessions.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AccelConfig {
    /// Preferred device ordinal.
    pub device_id: Option<u32>,
    /// Preferred device, by substring of its name.
    pub device_name: Option<String>,
    /// Devices to skip, by substring of "name @ pci-bus-id".
    pub blacklist: Vec<String>,
    pub ignore_blacklist: bool,
    /// Contexts per device counted as full load.
    pub max_contexts_per_device: u32,
    pub failure_window_ms: u64,
    pub cooldown_ms: u64,
    /// Minimum quality for the 4:4:4 layout.
    pub yuv444_threshold: u8,
    /// Minimum quality for lossless mode.
    pub lossless_threshold: u8,
    /// Largest quality change applied by one reconfigure.
    pub quality_step: u8,
    /// Preset ranked first whenever it is usable.
    pub preset_override: Option<Preset>,
    /// Minimum compute capability for encode sessions.
    pub min_compute: (u32, u32),
    /// Decoder output surfaces.
    pub decoder_surfaces: usize,
}

impl Default for AccelConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            device_name: None,
            blacklist: Vec::new(),
            ignore_blacklist: false,
            max_contexts_per_device: 32,
            failure_window_ms: 10_000,
            cooldown_ms: 2_000,
            yuv444_threshold: 85,
            lossless_threshold: 100,
            quality_step: 10,
            preset_override: None,
            min_compute: (3, 0),
            decoder_surfaces: 2,
        }
    }
}

impl AccelConfig {
    /// Load from the standard locations, then apply the environment.
    ///
    /// Missing files are skipped; unreadable or malformed ones are errors.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_files(&config_paths())?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Merge `paths` in increasing order of precedence. A key set in a later
    /// file replaces the same key from an earlier one; other keys carry over.
    pub fn load_files(paths: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut merged = Map::new();
        let mut last = None;
        for path in paths {
            if let Some(keys) = Self::read_keys(path)? {
                debug!("loaded configuration from {}", path.display());
                merged.extend(keys);
                last = Some(path);
            }
        }
        match last {
            None => Ok(Self::default()),
            Some(path) => serde_json::from_value(Value::Object(merged)).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            }),
        }
    }

    /// Load a single file; `None` if it does not exist.
    pub fn read_file(path: &Path) -> Result<Option<Self>, ConfigError> {
        Self::read_keys(path)?
            .map(|keys| serde_json::from_value::<Self>(Value::Object(keys)))
            .transpose()
            .map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })
    }

    /// The top-level keys of one file, validated against the schema.
    fn read_keys(path: &Path) -> Result<Option<Map<String, Value>>, ConfigError> {
        let json = match std::fs::read_to_string(path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let parse_error = |source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        };
        let keys: Map<String, Value> = serde_json::from_str(&json).map_err(parse_error)?;
        Self::deserialize(Value::Object(keys.clone())).map_err(parse_error)?;
        Ok(Some(keys))
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Apply `ACCEL_*` overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
            value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key,
                value: value.to_string(),
            })
        }

        if let Some(v) = lookup("ACCEL_DEVICE_ID") {
            self.device_id = Some(parse("ACCEL_DEVICE_ID", &v)?);
        }
        if let Some(v) = lookup("ACCEL_DEVICE_NAME") {
            self.device_name = Some(v);
        }
        if let Some(v) = lookup("ACCEL_BLACKLIST") {
            self.blacklist = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("ACCEL_IGNORE_BLACKLIST") {
            self.ignore_blacklist = match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "ACCEL_IGNORE_BLACKLIST",
                        value: v,
                    })
                }
            };
        }
        if let Some(v) = lookup("ACCEL_MAX_CONTEXTS") {
            self.max_contexts_per_device = parse("ACCEL_MAX_CONTEXTS", &v)?;
        }
        if let Some(v) = lookup("ACCEL_YUV444_THRESHOLD") {
            self.yuv444_threshold = parse("ACCEL_YUV444_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("ACCEL_LOSSLESS_THRESHOLD") {
            self.lossless_threshold = parse("ACCEL_LOSSLESS_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("ACCEL_PRESET") {
            self.preset_override = Some(parse("ACCEL_PRESET", &v)?);
        }
        if self.max_contexts_per_device == 0 {
            warn!("max_contexts_per_device of 0 treated as 1");
            self.max_contexts_per_device = 1;
        }
        Ok(())
    }

    #[must_use]
    pub fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }

    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Configuration files in increasing order of precedence.
fn config_paths() -> Vec<PathBuf> {
    let mut paths = vec![Path::new(SYSTEM_CONFIG_DIR).join(CONFIG_FILE)];
    let user_dir = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")));
    if let Some(dir) = user_dir {
        paths.push(dir.join("accelcodec").join(CONFIG_FILE));
    }
    paths
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = AccelConfig::from_json(r#"{"yuv444_threshold": 70, "blacklist": ["GT 710"]}"#).unwrap();
        assert_eq!(config.yuv444_threshold, 70);
        assert_eq!(config.blacklist, vec!["GT 710".to_string()]);
        assert_eq!(config.lossless_threshold, 100);
        assert_eq!(config.quality_step, 10);
    }

    #[test]
    fn test_preset_from_file() {
        let config = AccelConfig::from_json(r#"{"preset_override": "ll-hq"}"#).unwrap();
        assert_eq!(config.preset_override, Some(Preset::LowLatencyQuality));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = AccelConfig::from_json(r#"{"device_id": 1, "ignore_blacklist": false}"#).unwrap();
        config
            .apply_env(env(&[
                ("ACCEL_DEVICE_ID", "2"),
                ("ACCEL_IGNORE_BLACKLIST", "yes"),
                ("ACCEL_BLACKLIST", "Quadro, ,GT 710"),
                ("ACCEL_PRESET", "lossless"),
            ]))
            .unwrap();
        assert_eq!(config.device_id, Some(2));
        assert!(config.ignore_blacklist);
        assert_eq!(config.blacklist, vec!["Quadro".to_string(), "GT 710".to_string()]);
        assert_eq!(config.preset_override, Some(Preset::Lossless));
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = AccelConfig::default();
        let err = config
            .apply_env(env(&[("ACCEL_YUV444_THRESHOLD", "high")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "ACCEL_YUV444_THRESHOLD", .. }));
    }

    fn write_config(name: &str, json: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("accelcodec-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, json).unwrap();
        path
    }

    #[test]
    fn test_user_file_merges_over_system_file() {
        let system = write_config("system.json", r#"{"blacklist": ["GT 710"], "cooldown_ms": 500, "device_id": 1}"#);
        let user = write_config("user.json", r#"{"device_id": 0, "yuv444_threshold": 60}"#);
        let missing = PathBuf::from("/nonexistent/accelcodec/accel.json");

        let config = AccelConfig::load_files(&[system.clone(), missing, user.clone()]).unwrap();
        assert_eq!(config.device_id, Some(0));
        assert_eq!(config.yuv444_threshold, 60);
        assert_eq!(config.blacklist, vec!["GT 710".to_string()]);
        assert_eq!(config.cooldown_ms, 500);
        assert_eq!(config.quality_step, 10);

        // Reversed precedence
        let config = AccelConfig::load_files(&[user, system]).unwrap();
        assert_eq!(config.device_id, Some(1));
        assert_eq!(config.yuv444_threshold, 60);
    }

    #[test]
    fn test_bad_file_names_its_path() {
        let good = write_config("good.json", r#"{"cooldown_ms": 500}"#);
        let bad = write_config("bad.json", r#"{"cooldown_ms": "soon"}"#);
        match AccelConfig::load_files(&[good, bad.clone()]).unwrap_err() {
            ConfigError::Parse { path, .. } => assert_eq!(path, bad),
            other => panic!("unexpected error {other}"),
        }
        let list = write_config("list.json", "[1, 2]");
        assert!(matches!(AccelConfig::read_file(&list), Err(ConfigError::Parse { .. })));
        assert_eq!(AccelConfig::load_files(&[]).unwrap(), AccelConfig::default());
    }

    #[test]
    fn test_missing_file_is_skipped() {
        let path = Path::new("/nonexistent/accelcodec/accel.json");
        assert!(AccelConfig::read_file(path).unwrap().is_none());
    }
}
