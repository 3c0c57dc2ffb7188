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

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::repositories::liquidctl::base_driver::BaseDriver;

/// only store the last ~31 min. of recorded data at 1Hz
pub const STATUS_SIZE: usize = 1860;

pub type UID = String;
pub type DeviceUID = UID;
pub type DeviceName = String;
pub type ChannelName = String;
pub type TempName = String;
pub type TypeIndex = u8;
pub type Temp = f64;
pub type Duty = u8;
pub type RPM = u32;

/// The device display colors are assigned per channel on discovery, cycling
/// through this fixed palette.
pub const CHANNEL_COLOR_PALETTE: [&str; 8] = [
    "#568af2", "#ff6363", "#4bc485", "#f1ae42", "#a54ef2", "#36c5d4", "#e361b9", "#93b1a7",
];

#[derive(Serialize, Deserialize, Clone)]
pub struct Device {
    pub name: DeviceName,

    /// The DeviceType combined with the type_index is the device identity.
    pub d_type: DeviceType,

    /// The 1-based index from the type's device list.
    pub type_index: TypeIndex,

    /// A unique identifier derived from the device identity alone.
    pub uid: DeviceUID,

    /// A double-sided Vector of statuses
    pub status_history: VecDeque<Status>,

    /// Display colors per channel, assigned once on discovery.
    pub colors: HashMap<ChannelName, String>,

    /// Specific cooling-lib device information
    pub lc_info: Option<LcInfo>,

    /// General Device information
    pub info: DeviceInfo,
}

/// Equality and hashing use the identity only.
impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.d_type == other.d_type && self.type_index == other.type_index
    }
}

impl Eq for Device {}

impl Hash for Device {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.d_type.hash(state);
        self.type_index.hash(state);
    }
}

impl Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Device: {{ name: {}, type: {}, type_index: {}, status: {:?}, lc_info: {:?}, info: {:?} }}",
            self.name,
            self.d_type,
            self.type_index,
            self.status_current(),
            self.lc_info,
            self.info,
        )
    }
}

impl Device {
    /// This should be used every time to create a new device struct
    pub fn new(
        name: DeviceName,
        d_type: DeviceType,
        type_index: TypeIndex,
        lc_info: Option<LcInfo>,
        info: DeviceInfo,
    ) -> Self {
        let uid = Self::create_uid_from(&d_type, type_index);
        let mut device = Device {
            name,
            d_type,
            type_index,
            uid,
            status_history: VecDeque::with_capacity(STATUS_SIZE),
            colors: HashMap::new(),
            lc_info,
            info,
        };
        device.assign_channel_colors();
        device
    }

    /// The UID is stable across boots as long as the device list for the
    /// type doesn't change order. That is what settings are keyed by.
    fn create_uid_from(d_type: &DeviceType, type_index: TypeIndex) -> UID {
        format!("{}{type_index}", d_type.to_string().to_lowercase())
    }

    fn assign_channel_colors(&mut self) {
        let mut channel_names: Vec<&String> = self.info.channels.keys().collect();
        channel_names.sort_unstable();
        for (color_index, channel_name) in channel_names.into_iter().enumerate() {
            self.colors.insert(
                channel_name.clone(),
                CHANNEL_COLOR_PALETTE[color_index % CHANNEL_COLOR_PALETTE.len()].to_string(),
            );
        }
    }

    /// Returns the most recent status in the status history, if it exists.
    pub fn status_current(&self) -> Option<Status> {
        self.status_history.back().cloned()
    }

    /// Adds a new status to the history, dropping the oldest when the
    /// capacity is reached. The status is replaced, never mutated in place.
    pub fn set_status(&mut self, status: Status) {
        if self.status_history.len() >= STATUS_SIZE {
            self.status_history.pop_front();
        }
        self.status_history.push_back(status);
    }

    /// Clears the history and starts fresh from the given status. Used on
    /// startup and when waking from sleep, so stale pre-sleep samples don't
    /// feed the moving averages.
    pub fn initialize_status_history_with(&mut self, status: Status) {
        self.status_history.clear();
        self.status_history.push_back(status);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempStatus {
    pub name: TempName,
    pub temp: Temp,

    /// The display name used by frontends, e.g. "Liquid"
    pub frontend_name: String,

    /// The display name used by frontends externally to the device, i.e. it
    /// is globally unique, e.g. "LC#1 Liquid"
    pub external_name: String,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub name: ChannelName,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpm: Option<RPM>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pwm_mode: Option<u8>,
}

/// A Model which contains various applicable device statuses at a moment in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub timestamp: DateTime<Local>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub temps: Vec<TempStatus>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub channels: Vec<ChannelStatus>,
}

impl Default for Status {
    fn default() -> Self {
        Status {
            timestamp: Local::now(),
            firmware_version: None,
            temps: vec![],
            channels: vec![],
        }
    }
}

impl PartialOrd for Status {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.timestamp.partial_cmp(&other.timestamp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
pub enum DeviceType {
    CPU,
    GPU,
    Liquidctl,
    Hwmon,
    Composite,
}

/// Needed Device info per device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub channels: HashMap<ChannelName, ChannelInfo>,
    pub lighting_speeds: Vec<String>,
    pub temp_min: u8,
    pub temp_max: u8,
    pub profile_max_length: u8,
    pub profile_min_length: u8,
    pub model: Option<String>,

    /// Whether this device's temps may be used as a source for other
    /// devices' channels.
    pub temp_ext_available: bool,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        DeviceInfo {
            channels: HashMap::new(),
            lighting_speeds: vec![],
            temp_min: 20,
            temp_max: 100,
            // reasonable default, one control point every 5 degrees for 20-100:
            profile_max_length: 17,
            profile_min_length: 2,
            model: None,
            temp_ext_available: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ChannelInfo {
    pub speed_options: Option<SpeedOptions>,
    pub lighting_modes: Vec<LightingMode>,
    pub lcd_modes: Vec<LcdMode>,
    pub lcd_info: Option<LcdInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedOptions {
    pub min_duty: Duty,
    pub max_duty: Duty,
    /// If (temp, duty) profiles are supported by the device natively (device-internal temps)
    pub profiles_enabled: bool,
    pub fixed_enabled: bool,
    /// This enables software-profiles for device-internal temperatures.
    /// External temperatures are always software-profiles and are not handled
    /// by this property.
    pub manual_profiles_enabled: bool,
}

impl Default for SpeedOptions {
    fn default() -> Self {
        SpeedOptions {
            min_duty: 0,
            max_duty: 100,
            profiles_enabled: false,
            fixed_enabled: true,
            manual_profiles_enabled: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
pub enum LightingModeType {
    None,
    Liquidctl,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightingMode {
    pub name: String,
    pub frontend_name: String,
    pub min_colors: u8,
    pub max_colors: u8,
    pub speed_enabled: bool,
    pub backward_enabled: bool,
    #[serde(rename(serialize = "type"))]
    pub type_: LightingModeType,
}

#[derive(Debug, Clone, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
pub enum LcdModeType {
    None,
    Liquidctl,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LcdMode {
    pub name: String,
    pub frontend_name: String,
    pub brightness: bool,
    pub orientation: bool,
    pub image: bool,
    pub colors_min: u8,
    pub colors_max: u8,
    #[serde(rename(serialize = "type"))]
    pub type_: LcdModeType,
}

/// Specific LCD Screen info
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LcdInfo {
    pub screen_width: u32,
    pub screen_height: u32,
    pub max_image_size_bytes: u32,
}

/// Specific cooling-lib device information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LcInfo {
    /// An Enum representation of the various cooling-lib driver classes
    pub driver_type: BaseDriver,
    /// The detected firmware version at initialization
    pub firmware_version: Option<String>,
    /// An indicator for needed user input to determine the actual asetek690lc variant
    pub unknown_asetek: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_with_temp(temp: f64) -> Status {
        Status {
            temps: vec![TempStatus {
                name: "liquid".to_string(),
                temp,
                frontend_name: "Liquid".to_string(),
                external_name: "LC#1 Liquid".to_string(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn equality_and_hash_use_identity_only() {
        let device_a = Device::new(
            "Kraken X53".to_string(),
            DeviceType::Liquidctl,
            1,
            None,
            DeviceInfo::default(),
        );
        let mut device_b = Device::new(
            "Completely different name".to_string(),
            DeviceType::Liquidctl,
            1,
            None,
            DeviceInfo::default(),
        );
        device_b.set_status(status_with_temp(33.3));
        assert_eq!(device_a, device_b);
        assert_ne!(
            device_a,
            Device::new(
                "Kraken X53".to_string(),
                DeviceType::Liquidctl,
                2,
                None,
                DeviceInfo::default(),
            )
        );
    }

    #[test]
    fn uid_derives_from_identity() {
        let device = Device::new(
            "whatever".to_string(),
            DeviceType::Hwmon,
            3,
            None,
            DeviceInfo::default(),
        );
        assert_eq!(device.uid, "hwmon3");
    }

    #[test]
    fn status_history_is_bounded_oldest_drops_first() {
        let mut device = Device::new(
            "Test".to_string(),
            DeviceType::CPU,
            1,
            None,
            DeviceInfo::default(),
        );
        for n in 0..(STATUS_SIZE + 10) {
            device.set_status(status_with_temp(n as f64));
        }
        assert_eq!(device.status_history.len(), STATUS_SIZE);
        // the oldest 10 samples were dropped:
        assert_eq!(device.status_history.front().unwrap().temps[0].temp, 10.0);
        assert_eq!(
            device.status_current().unwrap().temps[0].temp,
            (STATUS_SIZE + 9) as f64
        );
    }

    #[test]
    fn history_counts_match_polls_until_capacity() {
        let mut device = Device::new(
            "Test".to_string(),
            DeviceType::CPU,
            1,
            None,
            DeviceInfo::default(),
        );
        for n in 0..100 {
            device.set_status(status_with_temp(f64::from(n)));
        }
        assert_eq!(device.status_history.len(), 100);
    }

    #[test]
    fn channel_colors_are_assigned_on_creation() {
        let mut info = DeviceInfo::default();
        info.channels
            .insert("fan1".to_string(), ChannelInfo::default());
        info.channels
            .insert("pump".to_string(), ChannelInfo::default());
        let device = Device::new("Test".to_string(), DeviceType::Liquidctl, 1, None, info);
        assert_eq!(device.colors.len(), 2);
        assert!(device.colors.values().all(|color| color.starts_with('#')));
    }
}
