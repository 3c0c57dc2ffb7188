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
use log::{error, info};

use crate::config::Config;
use crate::device_commander::DeviceCommander;
use crate::setting::Mode;

/// Handles named bundles of device settings. A mode snapshot is taken from
/// the currently applied settings and can later be re-applied as a whole.
pub struct ModeController {
    config: Arc<Config>,
    device_commander: Arc<DeviceCommander>,
}

impl ModeController {
    pub fn new(config: Arc<Config>, device_commander: Arc<DeviceCommander>) -> Self {
        Self {
            config,
            device_commander,
        }
    }

    pub async fn get_modes(&self) -> Vec<Mode> {
        self.config.get_modes().await
    }

    /// Saves the currently applied device settings as a named mode.
    pub async fn save_mode_from_current_settings(&self, mode_name: &str) -> Result<Mode> {
        let mut device_settings = HashMap::new();
        for (device_uid, channel_settings) in self.config.get_all_device_settings().await {
            device_settings.insert(
                device_uid,
                channel_settings.into_values().collect::<Vec<_>>(),
            );
        }
        let mode = Mode {
            name: mode_name.to_string(),
            device_settings,
        };
        self.config.save_mode(mode.clone()).await;
        self.config.save_config_file().await?;
        info!("Saved mode: {mode_name}");
        Ok(mode)
    }

    /// Applies every setting contained in the mode. A failing channel is
    /// reported but does not stop the rest of the bundle.
    pub async fn apply_mode(&self, mode_name: &str) -> Result<()> {
        let mode = self
            .config
            .get_mode(mode_name)
            .await
            .ok_or_else(|| anyhow!("Mode not found: {mode_name}"))?;
        info!("Applying mode: {mode_name}");
        for (device_uid, settings) in &mode.device_settings {
            for setting in settings {
                if let Err(err) = self
                    .device_commander
                    .apply_setting(device_uid, setting)
                    .await
                {
                    error!(
                        "Error applying mode setting for {device_uid}:{}: {err:#}",
                        setting.channel_name
                    );
                }
            }
        }
        Ok(())
    }

    pub async fn delete_mode(&self, mode_name: &str) -> Result<()> {
        if self.config.delete_mode(mode_name).await {
            self.config.save_config_file().await?;
            info!("Deleted mode: {mode_name}");
            Ok(())
        } else {
            Err(anyhow!("Mode not found: {mode_name}"))
        }
    }
}
