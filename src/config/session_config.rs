use std::path::Path;
use std::time::Duration;

use anyhow::{Result, bail};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    DEFAULT_COMMAND_TIMEOUT_MS, DEFAULT_CONNECTION_TIMEOUT_MS, DEFAULT_PRE_DISCOVERY_DELAY_MS,
    DEFAULT_RECONNECT_DELAY_MS, DEFAULT_SCAN_TIMEOUT_MS,
};
use crate::utils::ensure_directory_exists;

/// Settings of one BLE session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Service the target peripherals advertise. Scans are filtered to it.
    pub service_uuid: Uuid,
    /// Subscribe to `notify_characteristic_uuid` as soon as the link is ready
    pub auto_enable_notify: bool,
    /// Characteristic within `service_uuid` to auto-subscribe to
    pub notify_characteristic_uuid: Option<Uuid>,
    pub scan_timeout_ms: u64,
    /// Bounds connecting, service discovery and disconnecting, each on its own
    pub connection_timeout_ms: u64,
    /// Pause between link establishment and service discovery. 0 disables it.
    pub pre_discovery_delay_ms: u64,
    /// Deadline of a single read or acknowledged write
    pub command_timeout_ms: u64,
    pub auto_reconnect: bool,
    pub reconnect_delay_ms: u64,
    pub debug_logging: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            service_uuid: Uuid::nil(),
            auto_enable_notify: false,
            notify_characteristic_uuid: None,
            scan_timeout_ms: DEFAULT_SCAN_TIMEOUT_MS,
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
            pre_discovery_delay_ms: DEFAULT_PRE_DISCOVERY_DELAY_MS,
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            auto_reconnect: false,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            debug_logging: false,
        }
    }
}

impl SessionConfig {
    pub fn new(service_uuid: Uuid) -> Self {
        Self {
            service_uuid,
            ..Self::default()
        }
    }

    pub fn with_auto_notify(mut self, characteristic: Uuid) -> Self {
        self.auto_enable_notify = true;
        self.notify_characteristic_uuid = Some(characteristic);
        self
    }

    pub fn with_auto_reconnect(mut self, delay: Duration) -> Self {
        self.auto_reconnect = true;
        self.reconnect_delay_ms = millis(delay);
        self
    }

    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout_ms = millis(timeout);
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout_ms = millis(timeout);
        self
    }

    pub fn with_pre_discovery_delay(mut self, delay: Duration) -> Self {
        self.pre_discovery_delay_ms = millis(delay);
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_ms = millis(timeout);
        self
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn pre_discovery_delay(&self) -> Duration {
        Duration::from_millis(self.pre_discovery_delay_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Rejects settings a session cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.service_uuid.is_nil() {
            bail!("service_uuid must be set");
        }
        for (name, value) in [
            ("scan_timeout_ms", self.scan_timeout_ms),
            ("connection_timeout_ms", self.connection_timeout_ms),
            ("command_timeout_ms", self.command_timeout_ms),
        ] {
            if value == 0 {
                bail!("{} must be greater than zero", name);
            }
        }
        if self.auto_reconnect && self.reconnect_delay_ms == 0 {
            bail!("reconnect_delay_ms must be greater than zero when auto_reconnect is enabled");
        }
        if self.auto_enable_notify && self.notify_characteristic_uuid.is_none() {
            bail!("auto_enable_notify requires notify_characteristic_uuid");
        }
        Ok(())
    }

    /// Loads the config from a JSON file. A missing file yields the defaults.
    pub async fn load_config(path: impl AsRef<Path>) -> Result<Self> {
        let file_path = path.as_ref();

        if !file_path.exists() {
            warn!("Session config file not found at {:?}, using default.", file_path);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(file_path).await?;
        let config: Self = serde_json::from_str(&config_json)?;

        info!("Session config loaded from {:?}", file_path);
        Ok(config)
    }

    /// Saves the config as pretty-printed JSON, creating parent directories as needed.
    pub async fn save_config(&self, path: impl AsRef<Path>) -> Result<()> {
        let file_path = path.as_ref();
        if let Some(parent) = file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            ensure_directory_exists(parent).await?;
        }

        let config_json = match serde_json::to_string_pretty(&self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize session config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(file_path, config_json).await?;
        info!("Session config saved to {:?}", file_path);
        Ok(())
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVICE: Uuid = Uuid::from_u128(0x4f63756c_7573_2054_6872_65656d6f7465);

    #[test]
    fn defaults_match_documented_values() {
        let config = SessionConfig::new(SERVICE);
        assert_eq!(config.scan_timeout(), Duration::from_secs(10));
        assert_eq!(config.connection_timeout(), Duration::from_secs(10));
        assert_eq!(config.pre_discovery_delay(), Duration::ZERO);
        assert_eq!(config.command_timeout(), Duration::from_secs(5));
        assert_eq!(config.reconnect_delay(), Duration::from_secs(3));
        assert!(!config.auto_reconnect);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_unusable_settings() {
        assert!(SessionConfig::default().validate().is_err());

        let mut config = SessionConfig::new(SERVICE);
        config.command_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = SessionConfig::new(SERVICE);
        config.auto_enable_notify = true;
        assert!(config.validate().is_err());

        let config = SessionConfig::new(SERVICE).with_auto_notify(Uuid::from_u128(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn oversized_durations_saturate() {
        let config = SessionConfig::new(SERVICE)
            .with_scan_timeout(Duration::MAX)
            .with_command_timeout(Duration::from_millis(250));

        assert_eq!(config.scan_timeout_ms, u64::MAX);
        assert_eq!(config.command_timeout_ms, 250);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let json = format!(r#"{{"service_uuid":"{}","auto_reconnect":true}}"#, SERVICE);
        let config: SessionConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.service_uuid, SERVICE);
        assert!(config.auto_reconnect);
        assert_eq!(config.scan_timeout_ms, DEFAULT_SCAN_TIMEOUT_MS);
    }

    #[tokio::test]
    async fn save_then_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.json");
        let config = SessionConfig::new(SERVICE)
            .with_auto_notify(Uuid::from_u128(2))
            .with_auto_reconnect(Duration::from_millis(1500));

        config.save_config(&path).await.unwrap();
        let loaded = SessionConfig::load_config(&path).await.unwrap();

        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = SessionConfig::load_config(dir.path().join("absent.json")).await.unwrap();
        assert_eq!(loaded, SessionConfig::default());
    }
}
