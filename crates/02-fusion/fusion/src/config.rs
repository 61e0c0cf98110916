//! Process-wide configuration for entering worlds.
//!
//! Defaults come from [`FusionConfig::default`]; a TOML file and `FUSION_*`
//! environment variables may override them. Layout parameters (`call_slots`,
//! `reply_capacity`, `inbox_capacity`, `main_pool_size`) only matter to the
//! member that creates a world: later members read them from the segment.

use crate::{FusionError, FusionResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How a caller reaches a handler registered in its own process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallMode {
    /// Run the handler inline in the calling thread.
    #[default]
    Direct,
    /// Always go through the inbox and a dispatcher worker.
    Indirect,
}

/// What survivors do when the master dies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MasterRecovery {
    /// The lowest surviving fusion id becomes master.
    #[default]
    Promote,
    /// The world is marked destroyed; every later operation fails.
    Destroy,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Directory holding world and pool files.
    pub shm_dir: PathBuf,
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,
    pub call_mode: CallMode,
    pub master_recovery: MasterRecovery,
    /// Reply slots shared by all synchronous callers.
    pub call_slots: u32,
    /// Largest reply payload, in bytes.
    pub reply_capacity: usize,
    /// Bytes per member inbox ring.
    pub inbox_capacity: usize,
    /// Bound applied to synchronous calls without an explicit timeout.
    #[serde(with = "opt_millis")]
    pub call_timeout: Option<Duration>,
    /// Initial size of the world's main pool.
    pub main_pool_size: u64,
    /// Track allocations in every pool this process creates.
    pub debug_shm: bool,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            shm_dir: default_shm_dir(),
            heartbeat_interval: Duration::from_millis(250),
            call_mode: CallMode::Direct,
            master_recovery: MasterRecovery::Promote,
            call_slots: 64,
            reply_capacity: 4096,
            inbox_capacity: 64 * 1024,
            call_timeout: None,
            main_pool_size: 4 * 1024 * 1024,
            debug_shm: false,
        }
    }
}

fn default_shm_dir() -> PathBuf {
    let dev_shm = Path::new("/dev/shm");
    if dev_shm.is_dir() {
        dev_shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

impl FusionConfig {
    /// Defaults overridden by `FUSION_*` environment variables.
    pub fn from_env() -> FusionResult<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parses a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> FusionResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|err| FusionError::config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML file, then applies environment overrides.
    pub fn load(path: &Path) -> FusionResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| FusionError::config(format!("{}: {err}", path.display())))?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> FusionResult<()> {
        if let Some(dir) = var("FUSION_SHM_DIR") {
            self.shm_dir = PathBuf::from(dir);
        }
        if let Some(ms) = var("FUSION_HEARTBEAT_MS") {
            self.heartbeat_interval = Duration::from_millis(parse_num("FUSION_HEARTBEAT_MS", &ms)?);
        }
        if let Some(mode) = var("FUSION_CALL_MODE") {
            self.call_mode = match mode.to_ascii_lowercase().as_str() {
                "direct" => CallMode::Direct,
                "indirect" => CallMode::Indirect,
                other => {
                    return Err(FusionError::config(format!(
                        "FUSION_CALL_MODE: unknown mode {other:?}"
                    )))
                }
            };
        }
        if let Some(policy) = var("FUSION_MASTER_RECOVERY") {
            self.master_recovery = match policy.to_ascii_lowercase().as_str() {
                "promote" => MasterRecovery::Promote,
                "destroy" => MasterRecovery::Destroy,
                other => {
                    return Err(FusionError::config(format!(
                        "FUSION_MASTER_RECOVERY: unknown policy {other:?}"
                    )))
                }
            };
        }
        if let Some(ms) = var("FUSION_CALL_TIMEOUT_MS") {
            let ms = parse_num("FUSION_CALL_TIMEOUT_MS", &ms)?;
            self.call_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(flag) = var("FUSION_DEBUG_SHM") {
            self.debug_shm = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        self.validate()
    }

    /// Rejects zero sizes and intervals.
    pub fn validate(&self) -> FusionResult<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(FusionError::config("heartbeat_interval must be non-zero"));
        }
        if self.call_slots == 0 {
            return Err(FusionError::config("call_slots must be non-zero"));
        }
        if self.reply_capacity == 0 {
            return Err(FusionError::config("reply_capacity must be non-zero"));
        }
        if self.inbox_capacity < 1024 {
            return Err(FusionError::config("inbox_capacity must be at least 1024 bytes"));
        }
        if self.main_pool_size < 4096 {
            return Err(FusionError::config("main_pool_size must be at least 4096 bytes"));
        }
        if self.call_timeout.is_some_and(|t| t.is_zero()) {
            return Err(FusionError::config("call_timeout must be non-zero when set"));
        }
        Ok(())
    }
}

fn parse_num(key: &str, value: &str) -> FusionResult<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| FusionError::config(format!("{key}: expected an integer, got {value:?}")))
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_u64(value.as_millis() as u64),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_validate() {
        FusionConfig::default().validate().expect("defaults are valid");
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("FUSION_SHM_DIR", "/tmp/fusion-test"),
            ("FUSION_HEARTBEAT_MS", "40"),
            ("FUSION_CALL_MODE", "Indirect"),
            ("FUSION_MASTER_RECOVERY", "destroy"),
            ("FUSION_CALL_TIMEOUT_MS", "1500"),
            ("FUSION_DEBUG_SHM", "1"),
        ]
        .into_iter()
        .collect();
        let mut config = FusionConfig::default();
        config
            .apply_env(|key| vars.get(key).map(|v| v.to_string()))
            .expect("apply env");
        assert_eq!(config.shm_dir, PathBuf::from("/tmp/fusion-test"));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(40));
        assert_eq!(config.call_mode, CallMode::Indirect);
        assert_eq!(config.master_recovery, MasterRecovery::Destroy);
        assert_eq!(config.call_timeout, Some(Duration::from_millis(1500)));
        assert!(config.debug_shm);
    }

    #[test]
    fn bad_env_values_are_rejected() {
        let mut config = FusionConfig::default();
        let err = config
            .apply_env(|key| (key == "FUSION_HEARTBEAT_MS").then(|| "soon".to_string()))
            .expect_err("non-numeric heartbeat");
        assert!(err.to_string().contains("FUSION_HEARTBEAT_MS"));

        let err = config
            .apply_env(|key| (key == "FUSION_HEARTBEAT_MS").then(|| "0".to_string()))
            .expect_err("zero heartbeat");
        assert!(err.to_string().contains("heartbeat_interval"));
    }

    #[test]
    fn toml_keeps_defaults_for_missing_keys() {
        let config = FusionConfig::from_toml_str(
            r#"
            shm_dir = "/tmp/worlds"
            heartbeat_interval = 100
            call_mode = "indirect"
            call_timeout = 2000
            "#,
        )
        .expect("parse");
        assert_eq!(config.shm_dir, PathBuf::from("/tmp/worlds"));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(100));
        assert_eq!(config.call_mode, CallMode::Indirect);
        assert_eq!(config.call_timeout, Some(Duration::from_millis(2000)));
        assert_eq!(config.call_slots, FusionConfig::default().call_slots);
    }
}
