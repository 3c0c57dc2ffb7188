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

/// The Corsair Commander Pro fan/RGB controller. Fan channels are reported
/// per detected mode; temp probes appear in the status as connected.
#[derive(Debug)]
pub struct CommanderProSupport;

impl CommanderProSupport {
    pub fn new() -> Self {
        Self {}
    }
}

impl DeviceSupport for CommanderProSupport {
    fn supported_driver(&self) -> BaseDriver {
        BaseDriver::CommanderPro
    }

    fn extract_info(&self, _device_index: u8, device_props: &DeviceProperties) -> DeviceInfo {
        let mut channels = HashMap::new();
        for channel_name in &device_props.speed_channels {
            channels.insert(
                channel_name.clone(),
                ChannelInfo {
                    speed_options: Some(SpeedOptions {
                        min_duty: 0,
                        max_duty: 100,
                        // the device supports profiles only with its own temp probes:
                        profiles_enabled: true,
                        fixed_enabled: true,
                        manual_profiles_enabled: true,
                    }),
                    ..Default::default()
                },
            );
        }
        for channel_name in &device_props.color_channels {
            let lighting_modes = self.get_color_channel_modes(None);
            channels.insert(
                channel_name.clone(),
                ChannelInfo {
                    lighting_modes,
                    ..Default::default()
                },
            );
        }
        let lighting_speeds = vec![
            "slow".to_string(),
            "medium".to_string(),
            "fast".to_string(),
        ];
        DeviceInfo {
            channels,
            lighting_speeds,
            temp_min: 20,
            temp_max: 60,
            temp_ext_available: true,
            profile_max_length: 6,
            ..Default::default()
        }
    }

    fn get_color_channel_modes(&self, _channel_name: Option<&str>) -> Vec<LightingMode> {
        let color_modes = vec![
            ColorMode::new("off", 0, 0, false, false),
            ColorMode::new("fixed", 1, 1, false, false),
            ColorMode::new("color_shift", 2, 2, true, true),
            ColorMode::new("color_pulse", 2, 2, true, true),
            ColorMode::new("color_wave", 2, 2, true, true),
            ColorMode::new("visor", 2, 2, true, false),
            ColorMode::new("blink", 2, 2, true, false),
            ColorMode::new("marquee", 1, 1, true, false),
            ColorMode::new("sequential", 1, 1, true, true),
            ColorMode::new("rainbow", 0, 0, true, false),
            ColorMode::new("rainbow2", 0, 0, true, false),
        ];
        self.convert_to_channel_lighting_modes(color_modes)
    }
}
