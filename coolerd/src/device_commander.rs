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

use std::sync::Arc;

use anyhow::{anyhow, Result};
use log::{error, info, warn};

use crate::config::Config;
use crate::device::{DeviceType, Duty, UID};
use crate::setting::Setting;
use crate::speed_scheduler::SpeedScheduler;
use crate::{AllDevices, ReposByType};

/// Routes user settings to the speed scheduler or the responsible repository
/// and translates failures into the short user-visible responses.
pub struct DeviceCommander {
    all_devices: AllDevices,
    repos: ReposByType,
    speed_scheduler: Arc<SpeedScheduler>,
    config: Arc<Config>,
}

impl DeviceCommander {
    pub fn new(
        all_devices: AllDevices,
        repos: ReposByType,
        speed_scheduler: Arc<SpeedScheduler>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            all_devices,
            repos,
            speed_scheduler,
            config,
        }
    }

    /// Applies the given setting and returns the device display name on
    /// success, or a short string beginning with `ERROR ` plus the reason.
    pub async fn set_setting(&self, device_uid: &UID, setting: &Setting) -> String {
        match self.apply_setting(device_uid, setting).await {
            Ok(device_name) => device_name,
            Err(err) => {
                error!("Error applying setting to {device_uid}: {err:#}");
                format!("ERROR {}", Self::error_reason(&err))
            }
        }
    }

    fn error_reason(err: &anyhow::Error) -> String {
        let message = format!("{err:#}");
        if message.contains("Permission denied") {
            "Permission denied".to_string()
        } else if message.contains("unknown channel") {
            "unknown channel".to_string()
        } else if message.contains("hwmon") {
            "applying hwmon settings".to_string()
        } else if message.contains("backend") {
            "backend communication error".to_string()
        } else {
            "Setting not applied".to_string()
        }
    }

    pub async fn apply_setting(&self, device_uid: &UID, setting: &Setting) -> Result<String> {
        let (device_name, device_type) = {
            let device = self
                .all_devices
                .get(device_uid)
                .ok_or_else(|| anyhow!("Device not found: {device_uid}"))?
                .read()
                .await;
            if !device.info.channels.contains_key(&setting.channel_name) {
                return Err(anyhow!("unknown channel: {}", setting.channel_name));
            }
            (device.name.clone(), device.d_type)
        };
        let repo = self
            .repos
            .get(&device_type)
            .ok_or_else(|| anyhow!("Repository for device type not found: {device_type}"))?;
        if let Some(speed_profile) = &setting.speed_profile {
            self.apply_speed_profile(device_uid, setting, speed_profile, repo)
                .await?;
        } else {
            // anything else stops a running software profile on this channel:
            self.speed_scheduler
                .clear_channel_setting(device_uid, &setting.channel_name)
                .await;
            if setting.reset_to_default == Some(true) {
                repo.apply_setting_reset(device_uid, &setting.channel_name)
                    .await?;
            } else {
                let mut setting = setting.clone();
                if let Some(duty) = setting.speed_fixed {
                    setting.speed_fixed = Some(self.clamp_duty(device_uid, setting.channel_name.as_str(), duty).await);
                }
                repo.apply_setting(device_uid, &setting).await?;
            }
        }
        self.config.set_device_setting(device_uid, setting).await;
        if let Err(err) = self.config.save_config_file().await {
            warn!("Could not save applied setting to the config file: {err}");
        }
        Ok(device_name)
    }

    /// Device-internal profiles go to the repository when the device and its
    /// own temp source support them; everything else is evaluated in
    /// software by the speed scheduler.
    async fn apply_speed_profile(
        &self,
        device_uid: &UID,
        setting: &Setting,
        _speed_profile: &[(f64, Duty)],
        repo: &Arc<dyn crate::repositories::repository::Repository>,
    ) -> Result<()> {
        let internal_profile_supported = {
            let device = self
                .all_devices
                .get(device_uid)
                .ok_or_else(|| anyhow!("Device not found: {device_uid}"))?
                .read()
                .await;
            let profiles_enabled = device
                .info
                .channels
                .get(&setting.channel_name)
                .and_then(|channel| channel.speed_options.as_ref())
                .is_some_and(|options| options.profiles_enabled);
            let temp_source_is_internal = setting
                .temp_source
                .as_ref()
                .map_or(true, |source| &source.device_uid == device_uid);
            profiles_enabled && temp_source_is_internal
        };
        if internal_profile_supported {
            self.speed_scheduler
                .clear_channel_setting(device_uid, &setting.channel_name)
                .await;
            repo.apply_setting(device_uid, setting).await
        } else {
            info!(
                "Scheduling software speed profile for {device_uid}:{}",
                setting.channel_name
            );
            self.speed_scheduler.schedule_setting(device_uid, setting).await
        }
    }

    async fn clamp_duty(&self, device_uid: &UID, channel_name: &str, duty: Duty) -> Duty {
        let Some(device) = self.all_devices.get(device_uid) else {
            return duty.min(100);
        };
        let device = device.read().await;
        let Some(speed_options) = device
            .info
            .channels
            .get(channel_name)
            .and_then(|channel| channel.speed_options.as_ref())
        else {
            return duty.min(100);
        };
        duty.clamp(speed_options.min_duty, speed_options.max_duty)
    }

    /// Re-applies all settings saved in the config. Used at boot when
    /// enabled and after waking from sleep.
    pub async fn apply_saved_device_settings(&self) {
        for (device_uid, channel_settings) in self.config.get_all_device_settings().await {
            if !self.all_devices.contains_key(&device_uid) {
                warn!("Saved settings exist for a device that is not present: {device_uid}");
                continue;
            }
            for setting in channel_settings.values() {
                info!(
                    "Applying saved setting for {device_uid}:{}",
                    setting.channel_name
                );
                if let Err(err) = self.apply_setting(&device_uid, setting).await {
                    error!("Error applying saved setting: {err:#}");
                }
            }
        }
    }

    /// Re-initializes devices after waking from sleep.
    pub async fn reinitialize_devices(&self) {
        if let Some(repo) = self.repos.get(&DeviceType::Liquidctl) {
            repo.reinitialize_devices().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serial_test::serial;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::RwLock;

    use crate::device::{ChannelInfo, Device, DeviceInfo, SpeedOptions, UID};
    use crate::repositories::repository::{DeviceList, DeviceLock, Repository};

    struct StubRepo {
        applied: Mutex<Vec<Setting>>,
    }

    #[async_trait]
    impl Repository for StubRepo {
        fn device_type(&self) -> DeviceType {
            DeviceType::Hwmon
        }
        async fn initialize_devices(&mut self) -> Result<()> {
            Ok(())
        }
        async fn devices(&self) -> DeviceList {
            vec![]
        }
        async fn update_statuses(&self) -> Result<()> {
            Ok(())
        }
        async fn apply_setting(&self, _device_uid: &UID, setting: &Setting) -> Result<()> {
            self.applied.lock().unwrap().push(setting.clone());
            Ok(())
        }
        async fn apply_setting_reset(&self, _device_uid: &UID, _channel_name: &str) -> Result<()> {
            Ok(())
        }
        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
    }

    fn test_runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    async fn setup_commander() -> (DeviceCommander, Arc<StubRepo>, UID) {
        let test_config_dir = format!("/tmp/coolerd-commander-test-{}", uuid::Uuid::new_v4());
        std::env::set_var("XDG_CONFIG_HOME", &test_config_dir);
        let config = Arc::new(crate::config::Config::load_config_file().await.unwrap());
        let mut info = DeviceInfo::default();
        info.channels.insert(
            "fan1".to_string(),
            ChannelInfo {
                speed_options: Some(SpeedOptions {
                    min_duty: 20,
                    max_duty: 100,
                    fixed_enabled: true,
                    manual_profiles_enabled: true,
                    profiles_enabled: false,
                }),
                ..Default::default()
            },
        );
        let device = Device::new("Test Fan".to_string(), DeviceType::Hwmon, 1, None, info);
        let device_uid = device.uid.clone();
        let mut devices = HashMap::new();
        devices.insert(device_uid.clone(), Arc::new(RwLock::new(device)) as DeviceLock);
        let all_devices: AllDevices = Arc::new(devices);
        let repo = Arc::new(StubRepo {
            applied: Mutex::new(Vec::new()),
        });
        let mut repos: HashMap<DeviceType, Arc<dyn Repository>> = HashMap::new();
        repos.insert(DeviceType::Hwmon, repo.clone() as Arc<dyn Repository>);
        let repos: ReposByType = Arc::new(repos);
        let speed_scheduler = Arc::new(SpeedScheduler::new(
            all_devices.clone(),
            repos.clone(),
            config.clone(),
        ));
        let commander = DeviceCommander::new(all_devices, repos, speed_scheduler, config);
        (commander, repo, device_uid)
    }

    #[test]
    #[serial]
    fn successful_setting_returns_the_device_name() {
        test_runtime().block_on(async {
            let (commander, repo, device_uid) = setup_commander().await;
            let setting = Setting {
                channel_name: "fan1".to_string(),
                speed_fixed: Some(60),
                ..Default::default()
            };
            let response = commander.set_setting(&device_uid, &setting).await;
            assert_eq!(response, "Test Fan");
            assert_eq!(repo.applied.lock().unwrap().len(), 1);
        });
    }

    #[test]
    #[serial]
    fn unknown_channel_is_reported() {
        test_runtime().block_on(async {
            let (commander, repo, device_uid) = setup_commander().await;
            let setting = Setting {
                channel_name: "fan9".to_string(),
                speed_fixed: Some(60),
                ..Default::default()
            };
            let response = commander.set_setting(&device_uid, &setting).await;
            assert_eq!(response, "ERROR unknown channel");
            assert!(repo.applied.lock().unwrap().is_empty());
        });
    }

    #[test]
    #[serial]
    fn fixed_duty_is_clamped_to_channel_limits() {
        test_runtime().block_on(async {
            let (commander, repo, device_uid) = setup_commander().await;
            let setting = Setting {
                channel_name: "fan1".to_string(),
                speed_fixed: Some(5), // below the channel's min_duty of 20
                ..Default::default()
            };
            let response = commander.set_setting(&device_uid, &setting).await;
            assert_eq!(response, "Test Fan");
            let applied = repo.applied.lock().unwrap();
            assert_eq!(applied[0].speed_fixed, Some(20));
        });
    }

    #[test]
    #[serial]
    fn external_temp_source_profiles_go_to_the_scheduler() {
        test_runtime().block_on(async {
            let (commander, repo, device_uid) = setup_commander().await;
            let setting = Setting {
                channel_name: "fan1".to_string(),
                speed_profile: Some(vec![(30.0, 30), (60.0, 100)]),
                temp_source: Some(crate::setting::TempSource {
                    temp_name: "temp1".to_string(),
                    device_uid: device_uid.clone(),
                }),
                ..Default::default()
            };
            let response = commander.set_setting(&device_uid, &setting).await;
            // profiles on channels without device-internal support are
            // evaluated in software, nothing is forwarded to the repo:
            assert_eq!(response, "Test Fan");
            assert!(repo.applied.lock().unwrap().is_empty());
        });
    }
}
