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
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, trace};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::config::Config;
use crate::device::{
    ChannelInfo, Device, DeviceInfo, DeviceType, SpeedOptions, Status, TypeIndex, UID,
};
use crate::repositories::coolerod_client::CoolerodClient;
use crate::repositories::hwmon::{devices, fans, temps};
use crate::repositories::repository::{DeviceList, DeviceLock, Repository};
use crate::setting::Setting;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
pub enum HwmonChannelType {
    Fan,
    Temp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HwmonChannelInfo {
    pub hwmon_type: HwmonChannelType,
    pub number: u8,
    pub pwm_enable_default: Option<u8>,
    pub name: String,
    pub label: Option<String>,
    pub pwm_mode_supported: bool,
}

impl Default for HwmonChannelInfo {
    fn default() -> Self {
        Self {
            hwmon_type: HwmonChannelType::Fan,
            number: 1,
            pwm_enable_default: None,
            name: String::new(),
            label: None,
            pwm_mode_supported: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HwmonDriverInfo {
    pub name: String,
    pub path: PathBuf,
    pub model: Option<String>,
    pub channels: Vec<HwmonChannelInfo>,
}

/// A Repository for Hwmon Devices. Reads are direct sysfs reads, writes are
/// mediated by the privileged coolerod daemon. Without a coolerod connection
/// the repository runs in read-only mode.
pub struct HwmonRepo {
    config: Arc<Config>,
    coolerod: Option<Arc<CoolerodClient>>,
    devices: HashMap<UID, (DeviceLock, Arc<HwmonDriverInfo>)>,
}

impl HwmonRepo {
    pub fn new(config: Arc<Config>, coolerod: Option<Arc<CoolerodClient>>) -> Self {
        Self {
            config,
            coolerod,
            devices: HashMap::new(),
        }
    }

    /// Maps driver infos to our Devices
    async fn map_into_our_device_model(&mut self, hwmon_drivers: Vec<HwmonDriverInfo>) {
        for (index, driver) in hwmon_drivers.into_iter().enumerate() {
            let mut channels = HashMap::new();
            for channel in &driver.channels {
                if channel.hwmon_type != HwmonChannelType::Fan {
                    continue; // only Fan channels currently have controls
                }
                let channel_info = ChannelInfo {
                    speed_options: Some(SpeedOptions {
                        profiles_enabled: false,
                        fixed_enabled: true,
                        manual_profiles_enabled: true,
                        ..Default::default()
                    }),
                    ..Default::default()
                };
                channels.insert(channel.name.clone(), channel_info);
            }
            let device_info = DeviceInfo {
                channels,
                temp_min: 0,
                temp_max: 100,
                profile_max_length: 21,
                model: driver.model.clone(),
                temp_ext_available: true,
                ..Default::default()
            };
            let type_index = (index + 1) as TypeIndex;
            let mut device = Device::new(
                driver.name.clone(),
                DeviceType::Hwmon,
                type_index,
                None,
                device_info,
            );
            let status = Status {
                channels: fans::extract_fan_statuses(&driver).await,
                temps: temps::extract_temp_statuses(&driver, type_index).await,
                ..Default::default()
            };
            device.initialize_status_history_with(status);
            self.devices.insert(
                device.uid.clone(),
                (Arc::new(RwLock::new(device)), Arc::new(driver)),
            );
        }
    }

    /// Gets the info necessary to apply a setting to the device channel
    fn get_hwmon_info(
        &self,
        device_uid: &UID,
        channel_name: &str,
    ) -> Result<(&Arc<HwmonDriverInfo>, &HwmonChannelInfo)> {
        let (_, hwmon_driver) = self
            .devices
            .get(device_uid)
            .with_context(|| format!("Device UID not found! {device_uid}"))?;
        let channel_info = hwmon_driver
            .channels
            .iter()
            .find(|channel| {
                channel.hwmon_type == HwmonChannelType::Fan && channel.name == channel_name
            })
            .with_context(|| format!("Searching for channel name: {channel_name}"))?;
        Ok((hwmon_driver, channel_info))
    }

    fn coolerod(&self) -> Result<&Arc<CoolerodClient>> {
        self.coolerod.as_ref().ok_or_else(|| {
            anyhow!("Permission denied: no connection to the privileged coolerod daemon")
        })
    }

    async fn apply_speed_fixed(
        &self,
        device_uid: &UID,
        channel_name: &str,
        speed_fixed: u8,
        pwm_mode: Option<u8>,
    ) -> Result<()> {
        let (hwmon_driver, channel_info) = self.get_hwmon_info(device_uid, channel_name)?;
        let coolerod = self.coolerod()?;
        debug!(
            "Applying HWMON device: {device_uid} channel: {channel_name}; Fixed Speed: {speed_fixed}"
        );
        if speed_fixed > 100 {
            return Err(anyhow!("Invalid fixed_speed: {speed_fixed}"));
        }
        fans::set_pwm_mode(coolerod, &hwmon_driver.path, channel_info, pwm_mode).await?;
        if speed_fixed == 100
            && hwmon_driver.name == devices::THINKPAD_DEVICE_NAME
            && self.config.get_settings().await.thinkpad_full_speed
        {
            fans::set_thinkpad_to_full_speed(coolerod, &hwmon_driver.path, channel_info).await
        } else {
            fans::set_pwm_duty(coolerod, &hwmon_driver.path, channel_info, speed_fixed).await
        }
    }
}

#[async_trait]
impl Repository for HwmonRepo {
    fn device_type(&self) -> DeviceType {
        DeviceType::Hwmon
    }

    async fn initialize_devices(&mut self) -> Result<()> {
        debug!("Starting Device Initialization");
        let start_initialization = Instant::now();
        let settings = self.config.get_settings().await;

        let base_paths = devices::find_all_hwmon_device_paths();
        if base_paths.is_empty() {
            return Err(anyhow!(
                "No HWMon devices were found, try running sensors-detect"
            ));
        }
        let mut hwmon_drivers: Vec<HwmonDriverInfo> = Vec::new();
        for path in base_paths {
            let device_name = devices::get_device_name(&path).await;
            if devices::is_already_used_by_other_repo(&device_name) {
                continue;
            }
            let mut channels = vec![];
            match fans::init_fans(
                &path,
                &device_name,
                self.coolerod.as_deref(),
                settings.enable_hwmon_filter,
            )
            .await
            {
                Ok(fans) => channels.extend(fans),
                Err(err) => error!("Error initializing Hwmon Fans: {err}"),
            };
            match temps::init_temps(&path, &device_name, settings.enable_hwmon_temps).await {
                Ok(temps) => channels.extend(temps),
                Err(err) => error!("Error initializing Hwmon Temps: {err}"),
            };
            if channels.is_empty() {
                // we only add hwmon drivers that have usable data
                continue;
            }
            let model = devices::get_device_model_name(&path).await;
            hwmon_drivers.push(HwmonDriverInfo {
                name: device_name,
                path,
                model,
                channels,
            });
        }
        devices::handle_duplicate_device_names(&mut hwmon_drivers).await;
        // re-sorted by name to help keep some semblance of order after reboots & device changes.
        hwmon_drivers.sort_by(|d1, d2| d1.name.cmp(&d2.name));

        self.map_into_our_device_model(hwmon_drivers).await;

        let mut device_names = Vec::new();
        for (device, _) in self.devices.values() {
            device_names.push(device.read().await.name.clone());
        }
        info!("Initialized Hwmon Devices: {device_names:?}");
        trace!(
            "Time taken to initialize all Hwmon devices: {:?}",
            start_initialization.elapsed()
        );
        debug!("HWMON Repository initialized");
        Ok(())
    }

    async fn devices(&self) -> DeviceList {
        self.devices
            .values()
            .map(|(device, _)| device.clone())
            .collect()
    }

    async fn update_statuses(&self) -> Result<()> {
        let start_update = Instant::now();
        for (device, driver) in self.devices.values() {
            let type_index = device.read().await.type_index;
            let status = Status {
                channels: fans::extract_fan_statuses(driver).await,
                temps: temps::extract_temp_statuses(driver, type_index).await,
                ..Default::default()
            };
            device.write().await.set_status(status);
        }
        trace!(
            "STATUS SNAPSHOT Time taken for all HWMON devices: {:?}",
            start_update.elapsed()
        );
        Ok(())
    }

    async fn apply_setting(&self, device_uid: &UID, setting: &Setting) -> Result<()> {
        if setting.reset_to_default == Some(true) {
            return self
                .apply_setting_reset(device_uid, &setting.channel_name)
                .await;
        }
        if let Some(speed_fixed) = setting.speed_fixed {
            return self
                .apply_speed_fixed(
                    device_uid,
                    &setting.channel_name,
                    speed_fixed,
                    setting.pwm_mode,
                )
                .await;
        }
        if setting.speed_profile.is_some() {
            // hwmon fans have no device-internal profiles, those are
            // evaluated by the speed scheduler into fixed duties
            return Err(anyhow!(
                "Applying Speed Profiles directly is not supported for HWMON devices"
            ));
        }
        if setting.lighting.is_some() || setting.lcd.is_some() {
            return Err(anyhow!(
                "Applying Lighting and LCD settings is not supported for HWMON devices"
            ));
        }
        if let Some(pwm_mode) = setting.pwm_mode {
            let (hwmon_driver, channel_info) =
                self.get_hwmon_info(device_uid, &setting.channel_name)?;
            info!(
                "Applying HWMON device: {device_uid} channel: {}; PWM Mode: {pwm_mode}",
                setting.channel_name
            );
            return fans::set_pwm_mode(
                self.coolerod()?,
                &hwmon_driver.path,
                channel_info,
                Some(pwm_mode),
            )
            .await;
        }
        Err(anyhow!("Setting not applicable to HWMON devices: {setting:?}"))
    }

    async fn apply_setting_reset(&self, device_uid: &UID, channel_name: &str) -> Result<()> {
        let (hwmon_driver, channel_info) = self.get_hwmon_info(device_uid, channel_name)?;
        debug!(
            "Applying HWMON device: {device_uid} channel: {channel_name}; \
            Resetting to original fan control mode"
        );
        fans::set_pwm_enable_to_default(self.coolerod()?, &hwmon_driver.path, channel_info).await
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(coolerod) = &self.coolerod {
            for (_, hwmon_driver) in self.devices.values() {
                for channel_info in &hwmon_driver.channels {
                    if channel_info.hwmon_type != HwmonChannelType::Fan {
                        continue;
                    }
                    if let Err(err) =
                        fans::set_pwm_enable_to_default(coolerod, &hwmon_driver.path, channel_info)
                            .await
                    {
                        error!("Error resetting hwmon pwm_enable to default: {err}");
                    }
                }
            }
            coolerod.close_connection().await;
        }
        info!("HWMON Repository shutdown");
        Ok(())
    }
}
