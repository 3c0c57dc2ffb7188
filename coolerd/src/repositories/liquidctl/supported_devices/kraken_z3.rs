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

use crate::device::{
    ChannelInfo, DeviceInfo, LcdInfo, LcdMode, LcdModeType, LightingMode, SpeedOptions,
};
use crate::repositories::liquidctl::backend_client::DeviceProperties;
use crate::repositories::liquidctl::base_driver::BaseDriver;
use crate::repositories::liquidctl::supported_devices::device_support::{ColorMode, DeviceSupport};

const DEFAULT_LCD_RESOLUTION: (u32, u32) = (320, 320);
// the Z3 firmware limit for uploaded images:
const MAX_IMAGE_SIZE_BYTES: u32 = 24_320 * 1024;

/// The Kraken Z3 generation with an LCD screen instead of the infinity ring.
#[derive(Debug)]
pub struct KrakenZ3Support;

impl KrakenZ3Support {
    pub fn new() -> Self {
        Self {}
    }
}

impl DeviceSupport for KrakenZ3Support {
    fn supported_driver(&self) -> BaseDriver {
        BaseDriver::KrakenZ3
    }

    fn extract_info(&self, _device_index: u8, device_props: &DeviceProperties) -> DeviceInfo {
        let mut channels = HashMap::new();
        for channel_name in ["fan".to_string(), "pump".to_string()] {
            channels.insert(
                channel_name,
                ChannelInfo {
                    speed_options: Some(SpeedOptions {
                        min_duty: 20,
                        max_duty: 100,
                        profiles_enabled: true,
                        fixed_enabled: true,
                        manual_profiles_enabled: true,
                    }),
                    ..Default::default()
                },
            );
        }
        let (screen_width, screen_height) = device_props
            .lcd_resolution
            .unwrap_or(DEFAULT_LCD_RESOLUTION);
        channels.insert(
            "lcd".to_string(),
            ChannelInfo {
                lcd_modes: self.get_lcd_modes(),
                lcd_info: Some(LcdInfo {
                    screen_width,
                    screen_height,
                    max_image_size_bytes: MAX_IMAGE_SIZE_BYTES,
                }),
                ..Default::default()
            },
        );
        let lighting_modes = self.get_color_channel_modes(None);
        channels.insert(
            "external".to_string(),
            ChannelInfo {
                lighting_modes,
                ..Default::default()
            },
        );
        let lighting_speeds = vec![
            "slowest".to_string(),
            "slower".to_string(),
            "normal".to_string(),
            "faster".to_string(),
            "fastest".to_string(),
        ];
        DeviceInfo {
            channels,
            lighting_speeds,
            temp_min: 20,
            temp_max: 60,
            temp_ext_available: true,
            profile_max_length: 9,
            ..Default::default()
        }
    }

    fn get_color_channel_modes(&self, _channel_name: Option<&str>) -> Vec<LightingMode> {
        let color_modes = vec![
            ColorMode::new("off", 0, 0, false, false),
            ColorMode::new("fixed", 1, 1, false, false),
            ColorMode::new("fading", 1, 8, true, false),
            ColorMode::new("super-fixed", 1, 40, false, false),
            ColorMode::new("spectrum-wave", 0, 0, true, true),
            ColorMode::new("covering-marquee", 1, 8, true, true),
            ColorMode::new("breathing", 1, 8, true, false),
            ColorMode::new("pulse", 1, 8, true, false),
            ColorMode::new("rainbow-flow", 0, 0, true, true),
            ColorMode::new("super-rainbow", 0, 0, true, true),
            ColorMode::new("rainbow-pulse", 0, 0, true, true),
        ];
        self.convert_to_channel_lighting_modes(color_modes)
    }
}

impl KrakenZ3Support {
    fn get_lcd_modes(&self) -> Vec<LcdMode> {
        vec![
            LcdMode {
                name: "liquid".to_string(),
                frontend_name: "Liquid".to_string(),
                brightness: true,
                orientation: true,
                image: false,
                colors_min: 0,
                colors_max: 0,
                type_: LcdModeType::Liquidctl,
            },
            LcdMode {
                name: "static".to_string(),
                frontend_name: "Static Image".to_string(),
                brightness: true,
                orientation: true,
                image: true,
                colors_min: 0,
                colors_max: 0,
                type_: LcdModeType::Liquidctl,
            },
            LcdMode {
                name: "gif".to_string(),
                frontend_name: "Gif".to_string(),
                brightness: true,
                orientation: true,
                image: true,
                colors_min: 0,
                colors_max: 0,
                type_: LcdModeType::Liquidctl,
            },
        ]
    }
}
