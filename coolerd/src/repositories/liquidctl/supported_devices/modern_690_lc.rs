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

use crate::device::{ChannelInfo, DeviceInfo, LightingMode, SpeedOptions};
use crate::repositories::liquidctl::backend_client::DeviceProperties;
use crate::repositories::liquidctl::base_driver::BaseDriver;
use crate::repositories::liquidctl::supported_devices::device_support::{ColorMode, DeviceSupport};

/// The modern Asetek 690LC AIOs (EVGA CLC, NZXT Kraken X31-X61 etc.).
/// This driver shares its vendor/product id with the legacy variant; the
/// user confirms which one is actually connected.
#[derive(Debug)]
pub struct Modern690LcSupport;

impl Modern690LcSupport {
    pub fn new() -> Self {
        Self {}
    }
}

impl DeviceSupport for Modern690LcSupport {
    fn supported_driver(&self) -> BaseDriver {
        BaseDriver::Modern690Lc
    }

    fn extract_info(&self, _device_index: u8, _device_props: &DeviceProperties) -> DeviceInfo {
        let mut channels = HashMap::new();
        for channel_name in ["fan".to_string(), "pump".to_string()] {
            channels.insert(
                channel_name,
                ChannelInfo {
                    speed_options: Some(SpeedOptions {
                        min_duty: 0,
                        max_duty: 100,
                        profiles_enabled: true,
                        fixed_enabled: true,
                        manual_profiles_enabled: true,
                    }),
                    ..Default::default()
                },
            );
        }
        let lighting_modes = self.get_color_channel_modes(None);
        channels.insert(
            "logo".to_string(),
            ChannelInfo {
                lighting_modes,
                ..Default::default()
            },
        );
        DeviceInfo {
            channels,
            temp_min: 20,
            temp_max: 60,
            temp_ext_available: true,
            profile_max_length: 6,
            ..Default::default()
        }
    }

    fn get_color_channel_modes(&self, _channel_name: Option<&str>) -> Vec<LightingMode> {
        let color_modes = vec![
            ColorMode::new("blackout", 0, 0, false, false),
            ColorMode::new("fixed", 1, 1, false, false),
            ColorMode::new("fading", 2, 2, true, false),
            ColorMode::new("blinking", 1, 1, true, false),
        ];
        self.convert_to_channel_lighting_modes(color_modes)
    }
}
