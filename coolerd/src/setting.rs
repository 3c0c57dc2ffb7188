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

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::{ChannelName, DeviceUID, Duty, Temp, TempName};

pub type R = u8;
pub type G = u8;
pub type B = u8;

/// Setting is a passed struct used to apply changes to a device channel.
/// Exactly one of the setting fields is used at a time.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Setting {
    pub channel_name: ChannelName,

    /// The fixed duty speed to set. eg: 20 (%)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_fixed: Option<Duty>,

    /// The profile temp/duty speeds to set. eg: [(20, 50), (25, 80)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_profile: Option<Vec<(Temp, Duty)>>,

    /// Settings for lighting
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lighting: Option<LightingSettings>,

    /// Settings for LCD screens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lcd: Option<LcdSettings>,

    /// The temperature source for speed profiles, which may live on another device
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_source: Option<TempSource>,

    /// the pwm_mode to set for hwmon devices, eg: 1
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pwm_mode: Option<u8>,

    /// Used to set hwmon & nvidia channels back to their default 'automatic' values.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_to_default: Option<bool>,
}

impl PartialEq for Setting {
    fn eq(&self, other: &Self) -> bool {
        self.channel_name == other.channel_name
            && self.speed_fixed == other.speed_fixed
            && self.speed_profile == other.speed_profile
            && self.lighting == other.lighting
            && self.lcd == other.lcd
            && self.temp_source == other.temp_source
            && self.pwm_mode == other.pwm_mode
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightingSettings {
    /// The lighting mode name
    pub mode: String,

    /// The speed to set
    pub speed: Option<String>,

    /// run backwards or not
    pub backward: Option<bool>,

    /// a list of RGB tuple values, eg [(20,20,120), (0,0,255)]
    pub colors: Vec<(R, G, B)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempSource {
    /// The internal name for this Temperature Source. Not the frontend label.
    pub temp_name: TempName,

    /// The associated device uid containing current temp values
    pub device_uid: DeviceUID,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LcdSettings {
    /// The Lcd mode name
    pub mode: String,

    /// The LCD brightness (0-100%)
    pub brightness: Option<u8>,

    /// The LCD Image orientation (0,90,180,270)
    pub orientation: Option<u16>,

    /// The LCD image file path, where the preprocessed image is located
    pub image_file: Option<String>,

    /// a list of RGB tuple values, eg [(20,20,120), (0,0,255)]
    pub colors: Vec<(R, G, B)>,
}

/// General daemon settings, the recognized user options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoolerdSettings {
    /// Apply the saved device settings at boot and after waking from sleep
    pub load_applied_at_boot: bool,

    /// Delay (seconds, 0-10) before talking to devices on startup and resume
    #[serde(with = "duration_secs")]
    pub startup_delay: Duration,

    /// Also use hwmon temps that are covered by the CPU repository
    pub enable_hwmon_temps: bool,

    /// Filter out fans that are most likely not connected
    pub enable_hwmon_filter: bool,

    /// Smooth dynamic temp sources (CPU/GPU) with a moving average
    pub enable_dynamic_temp_handling: bool,

    /// Synthesize composite temps (averages, deltas) from other devices
    pub enable_composite_temps: bool,

    pub desktop_notifications: bool,

    /// Whether full-speed mode is allowed for ThinkPad fans
    pub thinkpad_full_speed: bool,
}

/// A named bundle of device settings that can be applied together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mode {
    pub name: String,
    pub device_settings: std::collections::HashMap<DeviceUID, Vec<Setting>>,
}

/// The config file stores the startup delay as plain seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

impl Default for CoolerdSettings {
    fn default() -> Self {
        Self {
            load_applied_at_boot: true,
            startup_delay: Duration::from_secs(0),
            enable_hwmon_temps: false,
            enable_hwmon_filter: true,
            enable_dynamic_temp_handling: true,
            enable_composite_temps: false,
            desktop_notifications: true,
            thinkpad_full_speed: false,
        }
    }
}
