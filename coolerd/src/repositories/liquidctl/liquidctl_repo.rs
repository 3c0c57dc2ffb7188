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
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, trace, warn};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::config::Config;
use crate::device::{Device, DeviceType, LcInfo, TypeIndex, UID};
use crate::repositories::liquidctl::backend_client::{BackendClient, DeviceResponse, LCStatus};
use crate::repositories::liquidctl::base_driver::BaseDriver;
use crate::repositories::liquidctl::device_mapper::DeviceMapper;
use crate::repositories::liquidctl::supported_devices::device_support::StatusMap;
use crate::repositories::repository::{DeviceList, DeviceLock, Repository};
use crate::setting::Setting;

/// Kraken2 devices with a legacy 2.x firmware do not support speed profiles.
const KRAKEN2_LEGACY_FIRMWARE_PREFIX: &str = "2.";

/// The Repository for cooling-lib devices, speaking to the backend service
/// over its local socket.
pub struct LiquidctlRepo {
    config: Arc<Config>,
    backend_client: BackendClient,
    device_mapper: DeviceMapper,
    devices: HashMap<UID, DeviceLock>,
    device_ids: HashMap<UID, u8>,
}

impl LiquidctlRepo {
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let backend_client = BackendClient::new()
            .await
            .with_context(|| "Connecting to the backend service")?;
        backend_client.handshake().await?;
        info!("Established connection to the backend service");
        Ok(Self {
            config,
            backend_client,
            device_mapper: DeviceMapper::new(),
            devices: HashMap::new(),
            device_ids: HashMap::new(),
        })
    }

    fn map_driver_type(device_response: &DeviceResponse) -> Option<BaseDriver> {
        BaseDriver::from_str(&device_response.device_type).ok()
    }

    /// Applies the user's already-confirmed Legacy690 choices before the
    /// devices are mapped into our model.
    async fn handle_legacy690s(&self, device_responses: &mut Vec<DeviceResponse>) {
        let legacy690_ids = self.config.legacy690_ids().await;
        for device_response in device_responses {
            if device_response.device_type == BaseDriver::Modern690Lc.to_string()
                && legacy690_ids.contains(&device_response.id)
            {
                match self.backend_client.put_legacy690(device_response.id).await {
                    Ok(legacy_response) => {
                        info!(
                            "Device #{} successfully set as Legacy690Lc",
                            device_response.id
                        );
                        *device_response = legacy_response;
                    }
                    Err(err) => error!(
                        "Error setting device #{} as Legacy690Lc: {err}",
                        device_response.id
                    ),
                }
            }
        }
    }

    fn map_into_our_device_model(&mut self, device_responses: Vec<DeviceResponse>) {
        for device_response in device_responses {
            let Some(driver_type) = Self::map_driver_type(&device_response) else {
                warn!(
                    "Device is currently not supported: {}",
                    device_response.device_type
                );
                continue;
            };
            if !self.device_mapper.is_device_supported(&driver_type) {
                warn!("Device is currently not supported: {driver_type}");
                continue;
            }
            let device_info = self.device_mapper.extract_info(
                &driver_type,
                device_response.id,
                &device_response.properties,
            );
            // the user must confirm which 690LC variant is connected before
            // we can safely talk to it:
            let unknown_asetek = driver_type == BaseDriver::Modern690Lc;
            let device = Device::new(
                device_response.description.clone(),
                DeviceType::Liquidctl,
                device_response.id as TypeIndex,
                Some(LcInfo {
                    driver_type: driver_type.clone(),
                    firmware_version: None,
                    unknown_asetek,
                }),
                device_info,
            );
            self.device_ids
                .insert(device.uid.clone(), device_response.id);
            self.devices
                .insert(device.uid.clone(), Arc::new(RwLock::new(device)));
        }
    }

    async fn call_initialize_per_device(&self) {
        for (uid, device_id) in &self.device_ids {
            match self.backend_client.initialize_device(*device_id, None).await {
                Ok(status_response) => {
                    let init_map = Self::status_map_from(status_response.status);
                    self.update_firmware_version(uid, &init_map).await;
                }
                Err(err) => error!("Error initializing device #{device_id}: {err}"),
            }
        }
    }

    async fn update_firmware_version(&self, device_uid: &UID, status_map: &StatusMap) {
        let firmware_version = status_map.get("firmware version").cloned();
        if firmware_version.is_none() {
            return;
        }
        if let Some(device) = self.devices.get(device_uid) {
            let mut device = device.write().await;
            if let Some(lc_info) = device.lc_info.as_mut() {
                lc_info.firmware_version = firmware_version;
            }
        }
    }

    fn status_map_from(lc_statuses: LCStatus) -> StatusMap {
        let mut status_map = HashMap::new();
        for lc_status in lc_statuses {
            status_map.insert(lc_status.0.to_lowercase(), lc_status.1);
        }
        status_map
    }

    fn get_device_id(&self, device_uid: &UID) -> Result<u8> {
        self.device_ids
            .get(device_uid)
            .copied()
            .with_context(|| format!("Device UID not found! {device_uid}"))
    }

    async fn get_driver_type(&self, device_uid: &UID) -> Result<BaseDriver> {
        let device = self
            .devices
            .get(device_uid)
            .with_context(|| format!("Device UID not found! {device_uid}"))?;
        let driver_type = device
            .read()
            .await
            .lc_info
            .as_ref()
            .map(|info| info.driver_type.clone())
            .with_context(|| format!("LcInfo must be present for device: {device_uid}"))?;
        Ok(driver_type)
    }

    /// The user has confirmed this is a legacy 690 variant. The choice is
    /// persisted and the backend re-binds the device handle.
    pub async fn set_device_as_legacy690(&self, device_uid: &UID) -> Result<()> {
        let device_id = self.get_device_id(device_uid)?;
        let device_response = self.backend_client.put_legacy690(device_id).await?;
        self.config.set_legacy690_id(device_id).await;
        self.config.save_config_file().await?;
        if let Some(device) = self.devices.get(device_uid) {
            let mut device = device.write().await;
            device.name = device_response.description.clone();
            if let Some(info) = device.lc_info.as_mut() {
                info.driver_type = BaseDriver::Legacy690Lc;
                info.unknown_asetek = false;
            }
        }
        info!("Device {device_uid} set as Legacy690Lc");
        Ok(())
    }

    /// The user has confirmed the connected device is the modern variant, so
    /// regular communication with it is safe.
    pub async fn confirm_device_as_modern690(&self, device_uid: &UID) -> Result<()> {
        let device = self
            .devices
            .get(device_uid)
            .with_context(|| format!("Device UID not found! {device_uid}"))?;
        if let Some(info) = device.write().await.lc_info.as_mut() {
            info.unknown_asetek = false;
        }
        info!("Device {device_uid} confirmed as Modern690Lc");
        Ok(())
    }

    async fn check_firmware_profile_support(&self, device_uid: &UID) -> Result<()> {
        if self.get_driver_type(device_uid).await? != BaseDriver::Kraken2 {
            return Ok(());
        }
        let device = self
            .devices
            .get(device_uid)
            .with_context(|| format!("Device UID not found! {device_uid}"))?;
        let firmware_version = device
            .read()
            .await
            .lc_info
            .as_ref()
            .and_then(|info| info.firmware_version.clone());
        if let Some(firmware) = firmware_version {
            if firmware.starts_with(KRAKEN2_LEGACY_FIRMWARE_PREFIX) {
                warn!(
                    "Speed profiles are not supported on legacy Kraken2 firmware {firmware} \
                    for device {device_uid}"
                );
                return Err(anyhow!(
                    "Speed profiles are not supported on legacy 2.x firmware"
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Repository for LiquidctlRepo {
    fn device_type(&self) -> DeviceType {
        DeviceType::Liquidctl
    }

    async fn initialize_devices(&mut self) -> Result<()> {
        debug!("Starting Device Initialization");
        let start_initialization = Instant::now();
        let mut devices_response = self
            .backend_client
            .get_all_devices()
            .await
            .with_context(|| "Getting all devices from the backend service")?
            .devices;
        self.handle_legacy690s(&mut devices_response).await;
        self.map_into_our_device_model(devices_response);
        self.call_initialize_per_device().await;
        self.update_statuses().await?;
        let mut device_names = Vec::new();
        for device in self.devices.values() {
            device_names.push(device.read().await.name.clone());
        }
        info!("Initialized Liquidctl Devices: {device_names:?}");
        trace!(
            "Time taken to initialize all Liquidctl devices: {:?}",
            start_initialization.elapsed()
        );
        debug!("LIQUIDCTL Repository initialized");
        Ok(())
    }

    async fn devices(&self) -> DeviceList {
        self.devices.values().cloned().collect()
    }

    async fn update_statuses(&self) -> Result<()> {
        let start_update = Instant::now();
        for (uid, device) in &self.devices {
            let device_id = self.get_device_id(uid)?;
            let driver_type = self.get_driver_type(uid).await?;
            // the user hasn't confirmed the 690LC variant yet, talking to it
            // with the wrong protocol can hang the device:
            if device
                .read()
                .await
                .lc_info
                .as_ref()
                .is_some_and(|info| info.unknown_asetek)
            {
                continue;
            }
            match self.backend_client.get_status(device_id).await {
                Ok(status_response) => {
                    let status_map = Self::status_map_from(status_response.status);
                    let mut status =
                        self.device_mapper
                            .extract_status(&driver_type, &status_map, device_id);
                    let mut device = device.write().await;
                    if status.firmware_version.is_none() {
                        status.firmware_version = device
                            .lc_info
                            .as_ref()
                            .and_then(|info| info.firmware_version.clone());
                    }
                    device.set_status(status);
                }
                Err(err) => error!("Error updating status for device #{device_id}: {err}"),
            }
        }
        trace!(
            "STATUS SNAPSHOT Time taken for all LIQUIDCTL devices: {:?}",
            start_update.elapsed()
        );
        Ok(())
    }

    async fn apply_setting(&self, device_uid: &UID, setting: &Setting) -> Result<()> {
        let device_id = self.get_device_id(device_uid)?;
        debug!("Applying LIQUIDCTL device: {device_uid} settings: {setting:?}");
        if let Some(fixed_speed) = setting.speed_fixed {
            if fixed_speed > 100 {
                return Err(anyhow!("Invalid fixed_speed: {fixed_speed}"));
            }
            return self
                .backend_client
                .put_fixed_speed(device_id, &setting.channel_name, fixed_speed)
                .await;
        }
        if let Some(speed_profile) = &setting.speed_profile {
            self.check_firmware_profile_support(device_uid).await?;
            let profile: Vec<(f64, u8)> = speed_profile
                .iter()
                .map(|(temp, duty)| (*temp, *duty))
                .collect();
            return self
                .backend_client
                .put_speed_profile(device_id, &setting.channel_name, &profile, None)
                .await;
        }
        if let Some(lighting) = &setting.lighting {
            let time_per_color = None;
            let direction = lighting.backward.unwrap_or_default().then(|| "backward".to_string());
            return self
                .backend_client
                .put_color(
                    device_id,
                    &setting.channel_name,
                    &lighting.mode,
                    lighting.colors.clone(),
                    time_per_color,
                    lighting.speed.clone(),
                    direction,
                )
                .await;
        }
        if let Some(lcd) = &setting.lcd {
            if let Some(brightness) = lcd.brightness {
                self.backend_client
                    .put_screen(
                        device_id,
                        &setting.channel_name,
                        "brightness",
                        Some(brightness.to_string()),
                    )
                    .await?;
            }
            if let Some(orientation) = lcd.orientation {
                self.backend_client
                    .put_screen(
                        device_id,
                        &setting.channel_name,
                        "orientation",
                        Some(orientation.to_string()),
                    )
                    .await?;
            }
            if let Some(image_file) = &lcd.image_file {
                self.backend_client
                    .put_screen(
                        device_id,
                        &setting.channel_name,
                        &lcd.mode,
                        Some(image_file.clone()),
                    )
                    .await?;
            }
            if lcd.mode == "liquid" {
                self.backend_client
                    .put_screen(device_id, &setting.channel_name, "liquid", None)
                    .await?;
            }
            return Ok(());
        }
        Err(anyhow!(
            "Setting not applicable to LIQUIDCTL devices: {setting:?}"
        ))
    }

    async fn apply_setting_reset(&self, _device_uid: &UID, _channel_name: &str) -> Result<()> {
        // cooling-lib devices have no automatic fallback mode to restore;
        // firmware takes over after disconnect
        Ok(())
    }

    /// This is helpful/necessary after waking from sleep
    async fn reinitialize_devices(&self) {
        info!("Re-initializing all Liquidctl devices");
        self.call_initialize_per_device().await;
    }

    async fn shutdown(&self) -> Result<()> {
        // the backend hands fan control back to firmware where needed and
        // disconnects all devices on quit
        if let Err(err) = self.backend_client.post_quit().await {
            warn!("Error shutting down the backend service: {err}");
        }
        self.backend_client.shutdown().await;
        info!("LIQUIDCTL Repository shutdown");
        Ok(())
    }
}
