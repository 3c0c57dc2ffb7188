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
use async_trait::async_trait;
use log::{debug, error, info, trace, warn};
use psutil::cpu::CpuPercentCollector;
use psutil::sensors::TemperatureSensor;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::config::Config;
use crate::device::{
    ChannelStatus, Device, DeviceInfo, DeviceType, Status, TempStatus, UID,
};
use crate::repositories::repository::{DeviceList, DeviceLock, Repository};
use crate::setting::Setting;

pub const CPU_TEMP_NAME: &str = "CPU Temp";
pub const CPU_LOAD_NAME: &str = "CPU Load";
// sensor names have a priority and we want to use the first match:
pub const CPU_DEVICE_NAMES_ORDERED: [&str; 4] = ["thinkpad", "k10temp", "coretemp", "zenpower"];
pub const CPU_TEMP_BASE_LABEL_NAMES_ORDERED: [&str; 5] =
    ["cpu", "tctl", "physical", "package", "tdie"];

/// A CPU Repository for CPU status. Temperatures come from the standard
/// sensor enumeration, the load percent from the kernel's cpu accounting.
pub struct CpuRepo {
    #[allow(dead_code)] // carried for uniformity with the other repositories
    config: Arc<Config>,
    device: Option<DeviceLock>,
    cpu_percent_collector: RwLock<CpuPercentCollector>,
    /// The detected preferred sensor: (sensor unit name, sensor label)
    preferred_sensor: Option<(String, Option<String>)>,
}

impl CpuRepo {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        Ok(Self {
            config,
            device: None,
            cpu_percent_collector: RwLock::new(CpuPercentCollector::new()?),
            preferred_sensor: None,
        })
    }

    async fn cpu_model_name() -> String {
        let Ok(cpu_info) = tokio::fs::read_to_string("/proc/cpuinfo").await else {
            return "CPU".to_string();
        };
        cpu_info
            .lines()
            .find(|line| line.starts_with("model name"))
            .and_then(|line| line.split(':').nth(1))
            .map_or_else(|| "CPU".to_string(), |name| name.trim().to_string())
    }

    /// Finds the sensor to use for the CPU temp, using the device-name and
    /// label allowlists in priority order.
    fn detect_preferred_sensor() -> Option<(String, Option<String>)> {
        let sensors: Vec<TemperatureSensor> = psutil::sensors::temperatures()
            .into_iter()
            .filter_map(Result::ok)
            .collect();
        for device_name in CPU_DEVICE_NAMES_ORDERED {
            let device_sensors: Vec<&TemperatureSensor> = sensors
                .iter()
                .filter(|sensor| sensor.unit() == device_name)
                .collect();
            if device_sensors.is_empty() {
                continue;
            }
            for base_label in CPU_TEMP_BASE_LABEL_NAMES_ORDERED {
                for sensor in &device_sensors {
                    let label_matches = sensor
                        .label()
                        .is_some_and(|label| label.to_lowercase().contains(base_label));
                    if label_matches {
                        return Some((
                            device_name.to_string(),
                            sensor.label().map(ToString::to_string),
                        ));
                    }
                }
            }
            // no label matched, the device itself is already an allowlisted
            // cpu sensor, take its first reading:
            return Some((
                device_name.to_string(),
                device_sensors[0].label().map(ToString::to_string),
            ));
        }
        None
    }

    fn read_preferred_temp(&self) -> Option<f64> {
        let (unit, label) = self.preferred_sensor.as_ref()?;
        psutil::sensors::temperatures()
            .into_iter()
            .filter_map(Result::ok)
            .find(|sensor| {
                sensor.unit() == unit && sensor.label().map(ToString::to_string) == *label
            })
            .map(|sensor| sensor.current().celsius())
    }

    async fn collect_load(&self) -> Option<ChannelStatus> {
        match self.cpu_percent_collector.write().await.cpu_percent() {
            Ok(load) => Some(ChannelStatus {
                name: CPU_LOAD_NAME.to_string(),
                duty: Some(f64::from(load)),
                ..Default::default()
            }),
            Err(err) => {
                warn!("Could not read cpu load percent: {err}");
                None
            }
        }
    }

    async fn collect_status(&self) -> Status {
        let mut temps = Vec::new();
        if let Some(temp) = self.read_preferred_temp() {
            temps.push(TempStatus {
                name: CPU_TEMP_NAME.to_string(),
                temp: (temp * 100.).round() / 100.,
                frontend_name: CPU_TEMP_NAME.to_string(),
                external_name: CPU_TEMP_NAME.to_string(),
            });
        }
        let channels = self.collect_load().await.into_iter().collect();
        Status {
            temps,
            channels,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Repository for CpuRepo {
    fn device_type(&self) -> DeviceType {
        DeviceType::CPU
    }

    async fn initialize_devices(&mut self) -> Result<()> {
        debug!("Starting Device Initialization");
        let start_initialization = Instant::now();
        self.preferred_sensor = Self::detect_preferred_sensor();
        if self.preferred_sensor.is_none() {
            return Err(anyhow!("No CPU temperature sensors found on this system"));
        }
        let cpu_name = Self::cpu_model_name().await;
        let device_info = DeviceInfo {
            temp_min: 0,
            temp_max: 100,
            temp_ext_available: true,
            profile_max_length: 21,
            model: Some(cpu_name.clone()),
            ..Default::default()
        };
        let mut device = Device::new(cpu_name, DeviceType::CPU, 1, None, device_info);
        device.initialize_status_history_with(self.collect_status().await);
        info!(
            "Initialized CPU device: {} with sensor: {:?}",
            device.name, self.preferred_sensor
        );
        self.device = Some(Arc::new(RwLock::new(device)));
        trace!(
            "Time taken to initialize CPU device: {:?}",
            start_initialization.elapsed()
        );
        debug!("CPU Repository initialized");
        Ok(())
    }

    async fn devices(&self) -> DeviceList {
        self.device.iter().cloned().collect()
    }

    async fn update_statuses(&self) -> Result<()> {
        let Some(device) = &self.device else {
            return Ok(());
        };
        let start_update = Instant::now();
        let status = self.collect_status().await;
        if status.temps.is_empty() {
            error!("CPU temp could not be read from the preferred sensor");
        }
        device.write().await.set_status(status);
        trace!(
            "STATUS SNAPSHOT Time taken for CPU device: {:?}",
            start_update.elapsed()
        );
        Ok(())
    }

    async fn apply_setting(&self, _device_uid: &UID, _setting: &Setting) -> Result<()> {
        Err(anyhow!("Applying settings is not supported for CPU devices"))
    }

    async fn apply_setting_reset(&self, _device_uid: &UID, _channel_name: &str) -> Result<()> {
        Err(anyhow!("Applying settings is not supported for CPU devices"))
    }

    async fn shutdown(&self) -> Result<()> {
        info!("CPU Repository shutdown");
        Ok(())
    }
}
