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
use log::{debug, info, trace};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::config::Config;
use crate::device::{Device, DeviceInfo, DeviceType, Status, TempStatus, UID};
use crate::repositories::repository::{DeviceList, DeviceLock, Repository};
use crate::setting::Setting;

const AVG_ALL: &str = "Average All";
const LIQUID_TEMP_NAMES: [&str; 2] = ["Liquid", "Water"];

type AllTemps = Vec<(String, f64)>;

/// A Repository for Composite Temperatures of the other repositories,
/// synthesizing averages and deltas when enabled by the user.
pub struct CompositeRepo {
    #[allow(dead_code)] // carried for uniformity with the other repositories
    config: Arc<Config>,
    composite_device: DeviceLock,
    other_devices: DeviceList,
    should_compose: bool,
}

impl CompositeRepo {
    pub fn new(config: Arc<Config>, devices_for_composite: DeviceList, enabled: bool) -> Self {
        Self {
            config,
            composite_device: Arc::new(RwLock::new(Device::new(
                "Composite".to_string(),
                DeviceType::Composite,
                1,
                None,
                DeviceInfo {
                    temp_min: 0,
                    temp_max: 100,
                    temp_ext_available: true,
                    profile_max_length: 21,
                    ..Default::default()
                },
            ))),
            should_compose: enabled && devices_for_composite.len() > 1,
            other_devices: devices_for_composite,
        }
    }

    async fn collect_all_temps(&self) -> AllTemps {
        let mut all_temps = Vec::new();
        for device in &self.other_devices {
            if let Some(status) = device.read().await.status_current() {
                for temp_status in &status.temps {
                    all_temps.push((temp_status.external_name.clone(), temp_status.temp));
                }
            }
        }
        all_temps
    }

    fn get_avg_all_temps(all_temps: &AllTemps) -> Vec<TempStatus> {
        let total_all_temps: f64 = all_temps.iter().map(|(_, temp)| temp).sum();
        let average = (total_all_temps / all_temps.len() as f64 * 100.0).round() / 100.0;
        vec![TempStatus {
            name: AVG_ALL.to_string(),
            temp: average,
            frontend_name: AVG_ALL.to_string(),
            external_name: AVG_ALL.to_string(),
        }]
    }

    /// Deltas between the given sources (CPU or GPU) and any liquid temps,
    /// helpful to drive pumps by coolant effectiveness.
    fn get_delta_liquid_temps(all_temps: &AllTemps, source_name: &str) -> Vec<TempStatus> {
        let mut deltas = Vec::new();
        let source_temps = all_temps
            .iter()
            .filter(|(external_name, _)| external_name.contains(source_name))
            .collect::<Vec<&(String, f64)>>();
        all_temps
            .iter()
            .filter(|(name, _)| {
                LIQUID_TEMP_NAMES
                    .iter()
                    .any(|liquid_temp_name| name.contains(liquid_temp_name))
            })
            .for_each(|(liquid_name, liquid_temp)| {
                for (source_temp_name, source_temp) in &source_temps {
                    let delta_temp_name = format!("Δ {source_temp_name} {liquid_name}");
                    deltas.push(TempStatus {
                        name: delta_temp_name.clone(),
                        temp: ((source_temp - liquid_temp).abs() * 100.0).round() / 100.0,
                        frontend_name: delta_temp_name.clone(),
                        external_name: delta_temp_name,
                    });
                }
            });
        deltas
    }
}

#[async_trait]
impl Repository for CompositeRepo {
    fn device_type(&self) -> DeviceType {
        DeviceType::Composite
    }

    async fn initialize_devices(&mut self) -> Result<()> {
        debug!("Starting Device Initialization");
        let start_initialization = Instant::now();
        self.update_statuses().await?;
        trace!(
            "Time taken to initialize COMPOSITE device: {:?}",
            start_initialization.elapsed()
        );
        info!("COMPOSITE Repository initialized");
        Ok(())
    }

    async fn devices(&self) -> DeviceList {
        if self.should_compose {
            vec![self.composite_device.clone()]
        } else {
            vec![]
        }
    }

    async fn update_statuses(&self) -> Result<()> {
        if !self.should_compose {
            return Ok(());
        }
        let start_update = Instant::now();
        let all_temps = self.collect_all_temps().await;
        if all_temps.len() > 1 {
            let mut composite_temps = Vec::new();
            composite_temps.append(&mut Self::get_avg_all_temps(&all_temps));
            composite_temps.append(&mut Self::get_delta_liquid_temps(&all_temps, "CPU"));
            composite_temps.append(&mut Self::get_delta_liquid_temps(&all_temps, "GPU"));
            self.composite_device.write().await.set_status(Status {
                temps: composite_temps,
                ..Default::default()
            });
        }
        trace!(
            "STATUS SNAPSHOT Time taken for COMPOSITE device: {:?}",
            start_update.elapsed()
        );
        Ok(())
    }

    async fn apply_setting(&self, _device_uid: &UID, _setting: &Setting) -> Result<()> {
        Err(anyhow!(
            "Applying settings is not supported for COMPOSITE devices"
        ))
    }

    async fn apply_setting_reset(&self, _device_uid: &UID, _channel_name: &str) -> Result<()> {
        Err(anyhow!(
            "Applying settings is not supported for COMPOSITE devices"
        ))
    }

    async fn shutdown(&self) -> Result<()> {
        info!("COMPOSITE Repository shutdown");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_of_all_temps() {
        let all_temps: AllTemps = vec![
            ("CPU Temp".to_string(), 60.0),
            ("LC#1 Liquid".to_string(), 30.0),
        ];
        let avg = CompositeRepo::get_avg_all_temps(&all_temps);
        assert_eq!(avg.len(), 1);
        assert_eq!(avg[0].name, AVG_ALL);
        assert_eq!(avg[0].temp, 45.0);
    }

    #[test]
    fn cpu_liquid_delta_temps() {
        let all_temps: AllTemps = vec![
            ("CPU Temp".to_string(), 62.5),
            ("LC#1 Liquid".to_string(), 31.25),
        ];
        let deltas = CompositeRepo::get_delta_liquid_temps(&all_temps, "CPU");
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].temp, 31.25);
        assert!(deltas[0].name.starts_with('Δ'));
    }

    #[test]
    fn no_deltas_without_liquid_temps() {
        let all_temps: AllTemps = vec![
            ("CPU Temp".to_string(), 62.5),
            ("GPU Temp".to_string(), 55.0),
        ];
        assert!(CompositeRepo::get_delta_liquid_temps(&all_temps, "CPU").is_empty());
    }
}
