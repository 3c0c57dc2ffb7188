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

use anyhow::Result;
use async_trait::async_trait;
use log::error;
use tokio::sync::RwLock;

use crate::device::{Device, DeviceType, UID};
use crate::setting::Setting;

pub type DeviceLock = Arc<RwLock<Device>>;
pub type DeviceList = Vec<DeviceLock>;

/// A Repository is the adapter for one device family and the boundary
/// between the uniform device model and the device-specific protocols.
#[async_trait]
pub trait Repository: Send + Sync {
    fn device_type(&self) -> DeviceType;

    async fn initialize_devices(&mut self) -> Result<()>;

    /// Returns a reference to all the devices in this repository
    async fn devices(&self) -> DeviceList;

    /// Refreshes the status of every owned device in place. Called by the
    /// status poller on every tick.
    async fn update_statuses(&self) -> Result<()>;

    /// Applies the given setting to the device channel. Statuses aren't
    /// updated until the next poll tick.
    async fn apply_setting(&self, device_uid: &UID, setting: &Setting) -> Result<()>;

    /// Sets the channel back to its default, typically the hardware's own
    /// automatic control mode.
    async fn apply_setting_reset(&self, device_uid: &UID, channel_name: &str) -> Result<()>;

    /// This is helpful/necessary after waking from sleep
    async fn reinitialize_devices(&self) {
        error!("Reinitializing Devices is not supported for this Repository");
    }

    async fn shutdown(&self) -> Result<()>;
}
