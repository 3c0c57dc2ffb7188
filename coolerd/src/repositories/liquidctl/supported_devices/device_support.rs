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
use std::fmt::Debug;

use heck::ToTitleCase;
use lazy_static::lazy_static;
use regex::Regex;

use crate::device::{
    ChannelStatus, DeviceInfo, LightingMode, LightingModeType, Status, TempStatus,
};
use crate::repositories::liquidctl::backend_client::DeviceProperties;
use crate::repositories::liquidctl::base_driver::BaseDriver;

pub type StatusMap = HashMap<String, String>;

fn parse_float(value: &str) -> Option<f64> {
    value.parse::<f64>().ok()
}

fn parse_u32(value: &str) -> Option<u32> {
    value.parse::<u32>().ok()
}

/// A description of a driver's lighting mode, converted into the generic
/// `LightingMode` model.
pub struct ColorMode {
    pub name: String,
    pub min_colors: u8,
    pub max_colors: u8,
    pub speed_enabled: bool,
    pub backward_enabled: bool,
}

impl ColorMode {
    pub fn new(
        name: &str,
        min_colors: u8,
        max_colors: u8,
        speed_enabled: bool,
        backward_enabled: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            min_colors,
            max_colors,
            speed_enabled,
            backward_enabled,
        }
    }
}

/// The normalization layer over the driver quirks of the cooling-lib. Each
/// supported device struct implements this trait; many of the default methods
/// cover all use cases, but it is advisable to override them for increased
/// efficiency.
pub trait DeviceSupport: Debug + Sync + Send {
    fn supported_driver(&self) -> BaseDriver;

    fn extract_info(&self, device_index: u8, device_props: &DeviceProperties) -> DeviceInfo;

    fn get_color_channel_modes(&self, channel_name: Option<&str>) -> Vec<LightingMode>;

    fn extract_status(&self, status_map: &StatusMap, device_index: u8) -> Status {
        Status {
            firmware_version: self.get_firmware_ver(status_map),
            temps: self.get_temperatures(status_map, device_index),
            channels: self.get_channel_statuses(status_map, device_index),
            ..Default::default()
        }
    }

    fn get_firmware_ver(&self, status_map: &StatusMap) -> Option<String> {
        status_map.get("firmware version").cloned()
    }

    /// It's possible to override this method and use only the needed sub-functions per device
    fn get_temperatures(&self, status_map: &StatusMap, device_index: u8) -> Vec<TempStatus> {
        let mut temps = vec![];
        self.add_liquid_temp(status_map, &mut temps, device_index);
        self.add_water_temp(status_map, &mut temps, device_index);
        self.add_temp(status_map, &mut temps, device_index);
        self.add_vrm_temp(status_map, &mut temps, device_index);
        self.add_case_temp(status_map, &mut temps, device_index);
        self.add_temp_probes(status_map, &mut temps, device_index);
        temps.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        temps
    }

    fn add_liquid_temp(
        &self,
        status_map: &StatusMap,
        temps: &mut Vec<TempStatus>,
        device_index: u8,
    ) {
        if let Some(temp) = status_map.get("liquid temperature").and_then(|s| parse_float(s)) {
            temps.push(TempStatus {
                name: "liquid".to_string(),
                temp,
                frontend_name: "Liquid".to_string(),
                external_name: format!("LC#{device_index} Liquid"),
            });
        }
    }

    fn add_water_temp(
        &self,
        status_map: &StatusMap,
        temps: &mut Vec<TempStatus>,
        device_index: u8,
    ) {
        if let Some(temp) = status_map.get("water temperature").and_then(|s| parse_float(s)) {
            temps.push(TempStatus {
                name: "water".to_string(),
                temp,
                frontend_name: "Water".to_string(),
                external_name: format!("LC#{device_index} Water"),
            });
        }
    }

    fn add_temp(&self, status_map: &StatusMap, temps: &mut Vec<TempStatus>, device_index: u8) {
        if let Some(temp) = status_map.get("temperature").and_then(|s| parse_float(s)) {
            temps.push(TempStatus {
                name: "temp".to_string(),
                temp,
                frontend_name: "Temp".to_string(),
                external_name: format!("LC#{device_index} Temp"),
            });
        }
    }

    /// Voltage regulator temp for PSUs
    fn add_vrm_temp(&self, status_map: &StatusMap, temps: &mut Vec<TempStatus>, device_index: u8) {
        if let Some(temp) = status_map.get("vrm temperature").and_then(|s| parse_float(s)) {
            temps.push(TempStatus {
                name: "vrm".to_string(),
                temp,
                frontend_name: "VRM".to_string(),
                external_name: format!("LC#{device_index} VRM"),
            });
        }
    }

    fn add_case_temp(&self, status_map: &StatusMap, temps: &mut Vec<TempStatus>, device_index: u8) {
        if let Some(temp) = status_map.get("case temperature").and_then(|s| parse_float(s)) {
            temps.push(TempStatus {
                name: "case".to_string(),
                temp,
                frontend_name: "Case".to_string(),
                external_name: format!("LC#{device_index} Case"),
            });
        }
    }

    fn add_temp_probes(
        &self,
        status_map: &StatusMap,
        temps: &mut Vec<TempStatus>,
        device_index: u8,
    ) {
        lazy_static! {
            static ref TEMP_PROBE_PATTERN: Regex = Regex::new(r"temperature \d+").unwrap();
            static ref NUMBER_PATTERN: Regex = Regex::new(r"\d+").unwrap();
        }
        for (probe_name, value) in status_map {
            if TEMP_PROBE_PATTERN.is_match(probe_name) {
                if let Some(temp) = parse_float(value) {
                    if let Some(probe_number) =
                        NUMBER_PATTERN.find_at(probe_name, probe_name.len() - 2)
                    {
                        let name = format!("temp{}", probe_number.as_str());
                        temps.push(TempStatus {
                            temp,
                            frontend_name: name.to_title_case(),
                            external_name: format!("LC#{device_index} {}", name.to_title_case()),
                            name,
                        });
                    }
                }
            }
        }
    }

    /// It's possible to override this method and use only the needed sub-functions per device
    fn get_channel_statuses(&self, status_map: &StatusMap, _device_index: u8) -> Vec<ChannelStatus> {
        let mut channel_statuses = vec![];
        self.add_single_fan_status(status_map, &mut channel_statuses);
        self.add_single_pump_status(status_map, &mut channel_statuses);
        self.add_multiple_fans_status(status_map, &mut channel_statuses);
        channel_statuses.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        channel_statuses
    }

    fn add_single_fan_status(
        &self,
        status_map: &StatusMap,
        channel_statuses: &mut Vec<ChannelStatus>,
    ) {
        let fan_rpm = status_map.get("fan speed").and_then(|s| parse_u32(s));
        let fan_duty = status_map.get("fan duty").and_then(|s| parse_float(s));
        if fan_rpm.is_some() || fan_duty.is_some() {
            channel_statuses.push(ChannelStatus {
                name: "fan".to_string(),
                rpm: fan_rpm,
                duty: fan_duty,
                pwm_mode: None,
            });
        }
    }

    fn add_single_pump_status(
        &self,
        status_map: &StatusMap,
        channel_statuses: &mut Vec<ChannelStatus>,
    ) {
        let pump_rpm = status_map.get("pump speed").and_then(|s| parse_u32(s));
        let pump_duty = status_map.get("pump duty").and_then(|s| parse_float(s));
        if pump_rpm.is_some() || pump_duty.is_some() {
            channel_statuses.push(ChannelStatus {
                name: "pump".to_string(),
                rpm: pump_rpm,
                duty: pump_duty,
                pwm_mode: None,
            });
        }
    }

    fn add_multiple_fans_status(
        &self,
        status_map: &StatusMap,
        channel_statuses: &mut Vec<ChannelStatus>,
    ) {
        lazy_static! {
            static ref NUMBER_PATTERN: Regex = Regex::new(r"\d+").unwrap();
            static ref MULTIPLE_FAN_SPEED: Regex = Regex::new(r"fan \d+ speed").unwrap();
            static ref MULTIPLE_FAN_SPEED_CORSAIR: Regex = Regex::new(r"fan speed \d+").unwrap();
            static ref MULTIPLE_FAN_DUTY: Regex = Regex::new(r"fan \d+ duty").unwrap();
        }
        let mut fans_map: HashMap<String, (Option<u32>, Option<f64>)> = HashMap::new();
        for (name, value) in status_map {
            if let Some(fan_number) = NUMBER_PATTERN
                .find_at(name, 3)
                .and_then(|number| parse_u32(number.as_str()))
            {
                let fan_name = format!("fan{fan_number}");
                if MULTIPLE_FAN_SPEED.is_match(name) || MULTIPLE_FAN_SPEED_CORSAIR.is_match(name) {
                    let (rpm, _) = fans_map.entry(fan_name).or_insert((None, None));
                    *rpm = parse_u32(value);
                } else if MULTIPLE_FAN_DUTY.is_match(name) {
                    let (_, duty) = fans_map.entry(fan_name).or_insert((None, None));
                    *duty = parse_float(value);
                }
            }
        }
        for (name, (rpm, duty)) in fans_map {
            channel_statuses.push(ChannelStatus {
                name,
                rpm,
                duty,
                pwm_mode: None,
            });
        }
    }

    fn convert_to_channel_lighting_modes(&self, color_modes: Vec<ColorMode>) -> Vec<LightingMode> {
        color_modes
            .into_iter()
            .map(|color_mode| LightingMode {
                frontend_name: self.channel_to_frontend_name(&color_mode.name),
                name: color_mode.name,
                min_colors: color_mode.min_colors,
                max_colors: color_mode.max_colors,
                speed_enabled: color_mode.speed_enabled,
                backward_enabled: color_mode.backward_enabled,
                type_: LightingModeType::Liquidctl,
            })
            .collect()
    }

    fn channel_to_frontend_name(&self, lighting_channel: &str) -> String {
        lighting_channel.replace(['-', '_'], " ").to_title_case()
    }
}

/// Tests
#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::liquidctl::supported_devices::kraken_x3::KrakenX3Support;

    /// Using KrakenX3Support to test the trait's default functions
    #[test]
    fn get_firmware() {
        let device_support = KrakenX3Support::new();
        let given_expected = vec![
            (
                HashMap::from([("firmware version".to_string(), "1.0.0".to_string())]),
                Some("1.0.0".to_string()),
            ),
            (
                HashMap::from([("firmware".to_string(), "1.0.0".to_string())]),
                None,
            ),
        ];
        for (given, expected) in given_expected {
            assert_eq!(device_support.get_firmware_ver(&given), expected);
        }
    }

    #[test]
    fn get_temperatures() {
        let device_support = KrakenX3Support::new();
        let status_map = HashMap::from([
            ("liquid temperature".to_string(), "30.4".to_string()),
            ("fan speed".to_string(), "500".to_string()),
        ]);
        let temps = device_support.get_temperatures(&status_map, 1);
        assert_eq!(temps.len(), 1);
        assert_eq!(temps[0].name, "liquid");
        assert_eq!(temps[0].temp, 30.4);
        assert_eq!(temps[0].frontend_name, "Liquid");
        assert_eq!(temps[0].external_name, "LC#1 Liquid");
    }

    #[test]
    fn get_temperatures_unparsable() {
        let device_support = KrakenX3Support::new();
        let status_map =
            HashMap::from([("liquid temperature".to_string(), "whatever".to_string())]);
        assert!(device_support.get_temperatures(&status_map, 1).is_empty());
    }

    #[test]
    fn get_channel_statuses_single_fan_and_pump() {
        let device_support = KrakenX3Support::new();
        let status_map = HashMap::from([
            ("fan speed".to_string(), "1200".to_string()),
            ("fan duty".to_string(), "40.0".to_string()),
            ("pump speed".to_string(), "2400".to_string()),
        ]);
        let channels = device_support.get_channel_statuses(&status_map, 1);
        assert_eq!(channels.len(), 2);
        let fan = channels.iter().find(|c| c.name == "fan").unwrap();
        assert_eq!(fan.rpm, Some(1200));
        assert_eq!(fan.duty, Some(40.0));
        let pump = channels.iter().find(|c| c.name == "pump").unwrap();
        assert_eq!(pump.rpm, Some(2400));
        assert_eq!(pump.duty, None);
    }

    #[test]
    fn get_channel_statuses_multiple_fans() {
        let device_support = KrakenX3Support::new();
        let status_map = HashMap::from([
            ("fan 1 speed".to_string(), "1000".to_string()),
            ("fan 1 duty".to_string(), "33.0".to_string()),
            ("fan 2 speed".to_string(), "1100".to_string()),
        ]);
        let channels = device_support.get_channel_statuses(&status_map, 1);
        assert_eq!(channels.len(), 2);
        let fan1 = channels.iter().find(|c| c.name == "fan1").unwrap();
        assert_eq!(fan1.rpm, Some(1000));
        assert_eq!(fan1.duty, Some(33.0));
        let fan2 = channels.iter().find(|c| c.name == "fan2").unwrap();
        assert_eq!(fan2.rpm, Some(1100));
    }

    #[test]
    fn temp_probes_are_numbered() {
        let device_support = KrakenX3Support::new();
        let status_map = HashMap::from([
            ("temperature 1".to_string(), "27.8".to_string()),
            ("temperature 2".to_string(), "28.2".to_string()),
        ]);
        let temps = device_support.get_temperatures(&status_map, 2);
        assert_eq!(temps.len(), 2);
        assert!(temps.iter().any(|t| t.name == "temp1" && t.temp == 27.8));
        assert!(temps
            .iter()
            .any(|t| t.name == "temp2" && t.external_name == "LC#2 Temp2"));
    }
}
