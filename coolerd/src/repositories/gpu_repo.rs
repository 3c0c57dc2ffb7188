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
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{debug, error, info, trace, warn};
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::Nvml;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::config::Config;
use crate::device::{
    ChannelInfo, ChannelStatus, Device, DeviceInfo, DeviceType, SpeedOptions, Status, TempStatus,
    TypeIndex, UID,
};
use crate::repositories::coolerod_client::CoolerodClient;
use crate::repositories::hwmon::hwmon_repo::{HwmonChannelType, HwmonDriverInfo};
use crate::repositories::hwmon::{devices, fans, temps};
use crate::repositories::repository::{DeviceList, DeviceLock, Repository};
use crate::setting::Setting;

pub const GPU_TEMP_NAME: &str = "GPU Temp";
const GPU_LOAD_NAME: &str = "GPU Load";
const GPU_FAN_NAME: &str = "fan1";
const AMD_DEVICE_NAME: &str = "amdgpu";

enum GpuDriver {
    Nvidia { nvml_index: u32 },
    Amd { driver: Arc<HwmonDriverInfo> },
}

/// A Repository for GPU devices. NVIDIA cards are reached through NVML, AMD
/// cards through the amdgpu hwmon interface. AMD fan control goes through the
/// privileged coolerod daemon like any other hwmon write; NVIDIA fan control
/// is not supported.
pub struct GpuRepo {
    #[allow(dead_code)] // carried for uniformity with the other repositories
    config: Arc<Config>,
    coolerod: Option<Arc<CoolerodClient>>,
    nvml: Option<Nvml>,
    devices: HashMap<UID, (DeviceLock, GpuDriver)>,
    gpu_count: usize,
}

impl GpuRepo {
    pub fn new(config: Arc<Config>, coolerod: Option<Arc<CoolerodClient>>) -> Self {
        Self {
            config,
            coolerod,
            nvml: None,
            devices: HashMap::new(),
            gpu_count: 0,
        }
    }

    fn external_temp_name(&self, type_index: TypeIndex) -> String {
        if self.gpu_count > 1 {
            format!("GPU#{type_index} Temp")
        } else {
            GPU_TEMP_NAME.to_string()
        }
    }

    async fn init_nvidia_devices(&mut self, next_type_index: &mut TypeIndex) {
        match Nvml::init() {
            Ok(nvml) => self.nvml = Some(nvml),
            Err(err) => {
                debug!("NVML not available, no NVIDIA devices will be used: {err}");
                return;
            }
        }
        let device_count = self
            .nvml
            .as_ref()
            .and_then(|nvml| nvml.device_count().ok())
            .unwrap_or(0);
        for nvml_index in 0..device_count {
            let name = self
                .nvml
                .as_ref()
                .and_then(|nvml| nvml.device_by_index(nvml_index).ok())
                .and_then(|nvml_device| nvml_device.name().ok())
                .unwrap_or_else(|| "Nvidia GPU".to_string());
            let type_index = *next_type_index;
            *next_type_index += 1;
            let mut channels = HashMap::new();
            // the fan speed is display-only for nvidia:
            channels.insert(GPU_FAN_NAME.to_string(), ChannelInfo::default());
            let device_info = DeviceInfo {
                channels,
                temp_max: 100,
                temp_ext_available: true,
                ..Default::default()
            };
            let mut device = Device::new(name, DeviceType::GPU, type_index, None, device_info);
            let status = self.nvidia_status(nvml_index, type_index);
            device.initialize_status_history_with(status);
            self.devices.insert(
                device.uid.clone(),
                (Arc::new(RwLock::new(device)), GpuDriver::Nvidia { nvml_index }),
            );
        }
    }

    fn nvidia_status(&self, nvml_index: u32, type_index: TypeIndex) -> Status {
        let mut temps = Vec::new();
        let mut channels = Vec::new();
        if let Some(nvml) = &self.nvml {
            if let Ok(nvml_device) = nvml.device_by_index(nvml_index) {
                if let Ok(temp) = nvml_device.temperature(TemperatureSensor::Gpu) {
                    temps.push(TempStatus {
                        name: GPU_TEMP_NAME.to_string(),
                        temp: f64::from(temp),
                        frontend_name: GPU_TEMP_NAME.to_string(),
                        external_name: self.external_temp_name(type_index),
                    });
                }
                if let Ok(utilization) = nvml_device.utilization_rates() {
                    channels.push(ChannelStatus {
                        name: GPU_LOAD_NAME.to_string(),
                        duty: Some(f64::from(utilization.gpu)),
                        ..Default::default()
                    });
                }
                if let Ok(fan_duty) = nvml_device.fan_speed(0) {
                    channels.push(ChannelStatus {
                        name: GPU_FAN_NAME.to_string(),
                        duty: Some(f64::from(fan_duty)),
                        ..Default::default()
                    });
                }
            }
        }
        Status {
            temps,
            channels,
            ..Default::default()
        }
    }

    async fn init_amd_devices(&mut self, next_type_index: &mut TypeIndex) {
        for path in devices::find_all_hwmon_device_paths() {
            let device_name = devices::get_device_name(&path).await;
            if device_name != AMD_DEVICE_NAME {
                continue;
            }
            let mut channels = vec![];
            match fans::init_fans(&path, &device_name, self.coolerod.as_deref(), false).await {
                Ok(fans) => channels.extend(fans),
                Err(err) => error!("Error initializing AMD Hwmon Fans: {err}"),
            }
            match temps::init_temps(&path, &device_name, true).await {
                Ok(temps) => channels.extend(temps),
                Err(err) => error!("Error initializing AMD Hwmon Temps: {err}"),
            }
            if channels.is_empty() {
                continue;
            }
            let model = devices::get_device_model_name(&path).await;
            let driver = Arc::new(HwmonDriverInfo {
                name: device_name,
                path,
                model,
                channels,
            });
            let type_index = *next_type_index;
            *next_type_index += 1;
            let mut info_channels = HashMap::new();
            for channel in &driver.channels {
                if channel.hwmon_type != HwmonChannelType::Fan {
                    continue;
                }
                info_channels.insert(
                    channel.name.clone(),
                    ChannelInfo {
                        speed_options: Some(SpeedOptions {
                            fixed_enabled: true,
                            manual_profiles_enabled: true,
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                );
            }
            let device_info = DeviceInfo {
                channels: info_channels,
                temp_max: 100,
                temp_ext_available: true,
                model: driver.model.clone(),
                ..Default::default()
            };
            let mut device = Device::new(
                "Radeon Graphics".to_string(),
                DeviceType::GPU,
                type_index,
                None,
                device_info,
            );
            let status = self.amd_status(&driver, type_index).await;
            device.initialize_status_history_with(status);
            self.devices.insert(
                device.uid.clone(),
                (Arc::new(RwLock::new(device)), GpuDriver::Amd { driver }),
            );
        }
    }

    async fn amd_status(&self, driver: &HwmonDriverInfo, type_index: TypeIndex) -> Status {
        let mut channels = fans::extract_fan_statuses(driver).await;
        if let Some(load) = Self::amd_load(driver).await {
            channels.push(load);
        }
        let temps = temps::extract_temp_statuses(driver, type_index)
            .await
            .into_iter()
            .map(|mut temp| {
                temp.external_name = format!("{} {}", self.external_temp_name(type_index), temp.frontend_name);
                temp
            })
            .collect();
        Status {
            temps,
            channels,
            ..Default::default()
        }
    }

    /// The amdgpu driver exposes the gpu load as a percent in its device dir.
    async fn amd_load(driver: &HwmonDriverInfo) -> Option<ChannelStatus> {
        let load_path = driver.path.join("device").join("gpu_busy_percent");
        tokio::fs::read_to_string(load_path)
            .await
            .ok()
            .and_then(|contents| contents.trim().parse::<f64>().ok())
            .map(|load| ChannelStatus {
                name: GPU_LOAD_NAME.to_string(),
                duty: Some(load),
                ..Default::default()
            })
    }

    fn get_amd_driver(&self, device_uid: &UID) -> Result<&Arc<HwmonDriverInfo>> {
        match self.devices.get(device_uid) {
            Some((_, GpuDriver::Amd { driver })) => Ok(driver),
            Some((_, GpuDriver::Nvidia { .. })) => Err(anyhow!(
                "Fan control is not supported for NVIDIA devices"
            )),
            None => Err(anyhow!("Device UID not found! {device_uid}")),
        }
    }

    fn coolerod(&self) -> Result<&Arc<CoolerodClient>> {
        self.coolerod.as_ref().ok_or_else(|| {
            anyhow!("Permission denied: no connection to the privileged coolerod daemon")
        })
    }
}

#[async_trait]
impl Repository for GpuRepo {
    fn device_type(&self) -> DeviceType {
        DeviceType::GPU
    }

    async fn initialize_devices(&mut self) -> Result<()> {
        debug!("Starting Device Initialization");
        let start_initialization = Instant::now();
        let mut next_type_index: TypeIndex = 1;
        self.init_nvidia_devices(&mut next_type_index).await;
        self.init_amd_devices(&mut next_type_index).await;
        self.gpu_count = self.devices.len();
        let mut device_names = Vec::new();
        for (device, _) in self.devices.values() {
            device_names.push(device.read().await.name.clone());
        }
        info!("Initialized GPU Devices: {device_names:?}");
        trace!(
            "Time taken to initialize all GPU devices: {:?}",
            start_initialization.elapsed()
        );
        debug!("GPU Repository initialized");
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
            let status = match driver {
                GpuDriver::Nvidia { nvml_index } => self.nvidia_status(*nvml_index, type_index),
                GpuDriver::Amd { driver } => self.amd_status(driver, type_index).await,
            };
            device.write().await.set_status(status);
        }
        trace!(
            "STATUS SNAPSHOT Time taken for all GPU devices: {:?}",
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
        let Some(speed_fixed) = setting.speed_fixed else {
            return Err(anyhow!("Only fixed speeds are supported for GPU devices"));
        };
        if speed_fixed > 100 {
            return Err(anyhow!("Invalid fixed_speed: {speed_fixed}"));
        }
        let driver = self.get_amd_driver(device_uid)?;
        let channel_info = driver
            .channels
            .iter()
            .find(|channel| {
                channel.hwmon_type == HwmonChannelType::Fan
                    && channel.name == setting.channel_name
            })
            .ok_or_else(|| anyhow!("Searching for channel name: {}", setting.channel_name))?;
        debug!(
            "Applying GPU device: {device_uid} channel: {}; Fixed Speed: {speed_fixed}",
            setting.channel_name
        );
        fans::set_pwm_duty(self.coolerod()?, &driver.path, channel_info, speed_fixed).await
    }

    async fn apply_setting_reset(&self, device_uid: &UID, channel_name: &str) -> Result<()> {
        let driver = self.get_amd_driver(device_uid)?;
        let channel_info = driver
            .channels
            .iter()
            .find(|channel| {
                channel.hwmon_type == HwmonChannelType::Fan && channel.name == channel_name
            })
            .ok_or_else(|| anyhow!("Searching for channel name: {channel_name}"))?;
        fans::set_pwm_enable_to_default(self.coolerod()?, &driver.path, channel_info).await
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(coolerod) = &self.coolerod {
            for (_, driver) in self.devices.values() {
                let GpuDriver::Amd { driver } = driver else {
                    continue;
                };
                for channel_info in &driver.channels {
                    if channel_info.hwmon_type != HwmonChannelType::Fan {
                        continue;
                    }
                    if let Err(err) =
                        fans::set_pwm_enable_to_default(coolerod, &driver.path, channel_info).await
                    {
                        warn!("Error resetting AMD gpu pwm_enable to default: {err}");
                    }
                }
            }
        }
        info!("GPU Repository shutdown");
        Ok(())
    }
}
