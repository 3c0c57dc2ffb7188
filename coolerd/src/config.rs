/*
 * Coolerd - monitor and control your cooling devices
 * Copyright (c) 2022-2024  Coolerd contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::device::{ChannelName, DeviceUID};
use crate::setting::{CoolerdSettings, Mode, Setting};

const CONFIG_DIR_NAME: &str = "coolerd";
const CONFIG_FILE_NAME: &str = "config.json";
const STARTUP_DELAY_MAX: Duration = Duration::from_secs(10);

/// The persisted shape of the configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct ConfigFile {
    settings: CoolerdSettings,

    /// The last applied setting per device channel, for replay at boot.
    device_settings: HashMap<DeviceUID, HashMap<ChannelName, Setting>>,

    /// Saved named bundles of settings.
    modes: Vec<Mode>,

    /// Cooling-lib device ids the user has confirmed to be Legacy690 devices.
    legacy690_ids: Vec<u8>,
}

pub struct Config {
    path: PathBuf,
    document: RwLock<ConfigFile>,
}

impl Config {
    /// Loads the configuration file data into memory, creating a default
    /// config when none exists yet.
    pub async fn load_config_file() -> Result<Self> {
        let config_dir = Self::config_dir_path()?;
        if !config_dir.exists() {
            warn!("config directory doesn't exist. Attempting to create it: {config_dir:?}");
            tokio::fs::create_dir_all(&config_dir).await?;
        }
        let path = config_dir.join(CONFIG_FILE_NAME);
        let document = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str::<ConfigFile>(&contents)
                .with_context(|| format!("Parsing configuration file {path:?}"))?,
            Err(err) => {
                warn!("Error trying to read configuration file: {err}");
                warn!("Attempting to write a new configuration file");
                ConfigFile::default()
            }
        };
        let config = Self {
            path,
            document: RwLock::new(document),
        };
        config.verify_writeability().await?;
        info!("Configuration file check successful");
        Ok(config)
    }

    /// The platform-conventional user config dir.
    fn config_dir_path() -> Result<PathBuf> {
        if let Ok(xdg_config_dir) = std::env::var("XDG_CONFIG_HOME") {
            return Ok(Path::new(&xdg_config_dir).join(CONFIG_DIR_NAME));
        }
        let home_dir = std::env::var("HOME").map_err(|_| {
            anyhow!("Neither XDG_CONFIG_HOME nor HOME are set, can not locate the config dir")
        })?;
        Ok(Path::new(&home_dir).join(".config").join(CONFIG_DIR_NAME))
    }

    /// A config directory we can not write to is a fatal startup error.
    async fn verify_writeability(&self) -> Result<()> {
        self.save_config_file().await
    }

    /// saves any changes to the configuration file
    pub async fn save_config_file(&self) -> Result<()> {
        let serialized = serde_json::to_string_pretty(&*self.document.read().await)?;
        tokio::fs::write(&self.path, serialized)
            .await
            .with_context(|| format!("Saving configuration file: {:?}", &self.path))
    }

    pub async fn get_settings(&self) -> CoolerdSettings {
        let mut settings = self.document.read().await.settings.clone();
        // the startup delay is bounded to keep the daemon responsive:
        settings.startup_delay = settings.startup_delay.min(STARTUP_DELAY_MAX);
        settings
    }

    pub async fn set_settings(&self, settings: &CoolerdSettings) {
        let mut document = self.document.write().await;
        document.settings = settings.clone();
        document.settings.startup_delay = settings.startup_delay.min(STARTUP_DELAY_MAX);
    }

    /// Stores the given setting as the last-applied setting for its channel.
    pub async fn set_device_setting(&self, device_uid: &DeviceUID, setting: &Setting) {
        let mut document = self.document.write().await;
        let channel_settings = document
            .device_settings
            .entry(device_uid.clone())
            .or_default();
        if setting.reset_to_default == Some(true) {
            channel_settings.remove(&setting.channel_name);
        } else {
            channel_settings.insert(setting.channel_name.clone(), setting.clone());
        }
    }

    /// Returns the stored settings for the given device, for boot replay.
    pub async fn get_device_settings(&self, device_uid: &DeviceUID) -> Vec<Setting> {
        self.document
            .read()
            .await
            .device_settings
            .get(device_uid)
            .map(|channel_settings| channel_settings.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn get_all_device_settings(
        &self,
    ) -> HashMap<DeviceUID, HashMap<ChannelName, Setting>> {
        self.document.read().await.device_settings.clone()
    }

    pub async fn legacy690_ids(&self) -> Vec<u8> {
        self.document.read().await.legacy690_ids.clone()
    }

    pub async fn set_legacy690_id(&self, device_id: u8) {
        let mut document = self.document.write().await;
        if !document.legacy690_ids.contains(&device_id) {
            document.legacy690_ids.push(device_id);
        }
    }

    pub async fn get_modes(&self) -> Vec<Mode> {
        self.document.read().await.modes.clone()
    }

    pub async fn get_mode(&self, mode_name: &str) -> Option<Mode> {
        self.document
            .read()
            .await
            .modes
            .iter()
            .find(|mode| mode.name == mode_name)
            .cloned()
    }

    pub async fn save_mode(&self, mode: Mode) {
        let mut document = self.document.write().await;
        document.modes.retain(|existing| existing.name != mode.name);
        document.modes.push(mode);
    }

    pub async fn delete_mode(&self, mode_name: &str) -> bool {
        let mut document = self.document.write().await;
        let mode_count = document.modes.len();
        document.modes.retain(|mode| mode.name != mode_name);
        document.modes.len() != mode_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use uuid::Uuid;

    fn test_runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    fn setup_config_env() -> PathBuf {
        let test_config_dir = PathBuf::from(format!("/tmp/coolerd-config-test-{}", Uuid::new_v4()));
        std::env::set_var("XDG_CONFIG_HOME", &test_config_dir);
        test_config_dir
    }

    #[test]
    #[serial]
    fn creates_default_config_when_missing() {
        test_runtime().block_on(async {
            // given:
            let test_config_dir = setup_config_env();

            // when:
            let config = Config::load_config_file().await.unwrap();
            let settings = config.get_settings().await;

            // then:
            assert!(settings.load_applied_at_boot);
            assert!(settings.enable_hwmon_filter);
            assert!(!settings.enable_hwmon_temps);
            assert_eq!(settings.startup_delay, Duration::from_secs(0));
            assert!(test_config_dir
                .join(CONFIG_DIR_NAME)
                .join(CONFIG_FILE_NAME)
                .exists());
            std::fs::remove_dir_all(&test_config_dir).unwrap();
        });
    }

    #[test]
    #[serial]
    fn device_settings_roundtrip_through_the_file() {
        test_runtime().block_on(async {
            // given:
            let test_config_dir = setup_config_env();
            let config = Config::load_config_file().await.unwrap();
            let setting = Setting {
                channel_name: "fan1".to_string(),
                speed_fixed: Some(60),
                ..Default::default()
            };

            // when:
            config
                .set_device_setting(&"hwmon1".to_string(), &setting)
                .await;
            config.save_config_file().await.unwrap();
            let reloaded = Config::load_config_file().await.unwrap();

            // then:
            let settings = reloaded.get_device_settings(&"hwmon1".to_string()).await;
            assert_eq!(settings.len(), 1);
            assert_eq!(settings[0].speed_fixed, Some(60));
            std::fs::remove_dir_all(&test_config_dir).unwrap();
        });
    }

    #[test]
    #[serial]
    fn reset_to_default_clears_the_stored_setting() {
        test_runtime().block_on(async {
            // given:
            let test_config_dir = setup_config_env();
            let config = Config::load_config_file().await.unwrap();
            let device_uid = "liquidctl1".to_string();
            config
                .set_device_setting(
                    &device_uid,
                    &Setting {
                        channel_name: "pump".to_string(),
                        speed_fixed: Some(80),
                        ..Default::default()
                    },
                )
                .await;

            // when:
            config
                .set_device_setting(
                    &device_uid,
                    &Setting {
                        channel_name: "pump".to_string(),
                        reset_to_default: Some(true),
                        ..Default::default()
                    },
                )
                .await;

            // then:
            assert!(config.get_device_settings(&device_uid).await.is_empty());
            std::fs::remove_dir_all(&test_config_dir).unwrap();
        });
    }

    #[test]
    #[serial]
    fn startup_delay_is_clamped() {
        test_runtime().block_on(async {
            let test_config_dir = setup_config_env();
            let config = Config::load_config_file().await.unwrap();
            let mut settings = config.get_settings().await;
            settings.startup_delay = Duration::from_secs(60);
            config.set_settings(&settings).await;
            assert_eq!(
                config.get_settings().await.startup_delay,
                STARTUP_DELAY_MAX
            );
            std::fs::remove_dir_all(&test_config_dir).unwrap();
        });
    }
}
