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

use std::io::{Error, ErrorKind};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use heck::ToTitleCase;
use lazy_static::lazy_static;
use log::{debug, info, trace};
use regex::Regex;

use crate::device::{TempStatus, TypeIndex};
use crate::repositories::cpu_repo::CPU_DEVICE_NAMES_ORDERED;
use crate::repositories::hwmon::hwmon_repo::{HwmonChannelInfo, HwmonChannelType, HwmonDriverInfo};

const PATTERN_TEMP_INPUT_NUMBER: &str = r"^temp(?P<number>\d+)_input$";
// Unreasonable readings are ignored. Sensors come in millidegrees,
// i.e. 35.0C == 35000
const TEMP_SANITY_MIN: f64 = 0.0;
const TEMP_SANITY_MAX: f64 = 100.0;
const NVME_DEVICE_NAME_PREFIX: &str = "nvme";
const NVME_COMPOSITE_LABEL: &str = "Composite";

lazy_static! {
    static ref REGEX_TEMP_INPUT: Regex = Regex::new(PATTERN_TEMP_INPUT_NUMBER).unwrap();
}

/// Initialize all applicable temp sensors
pub async fn init_temps(
    base_path: &PathBuf,
    device_name: &str,
    include_cpu_covered_temps: bool,
) -> Result<Vec<HwmonChannelInfo>> {
    if temps_used_by_another_repo(device_name) && !include_cpu_covered_temps {
        return Ok(vec![]);
    }
    let mut temps = vec![];
    let dir_entries = std::fs::read_dir(base_path)?;
    for entry in dir_entries {
        let os_file_name = entry?.file_name();
        let file_name = os_file_name.to_str().context("File Name should be a str")?;
        let Some(captures) = REGEX_TEMP_INPUT.captures(file_name) else {
            continue;
        };
        let channel_number: u8 = captures
            .name("number")
            .context("Number Group should exist")?
            .as_str()
            .parse()?;
        if !sensor_is_usable(base_path, channel_number).await {
            continue;
        }
        let channel_name = get_temp_channel_name(channel_number);
        let label = get_temp_channel_label(base_path, channel_number).await;
        temps.push(HwmonChannelInfo {
            hwmon_type: HwmonChannelType::Temp,
            number: channel_number,
            name: channel_name,
            label,
            ..Default::default()
        });
    }
    temps.sort_by(|t1, t2| t1.number.cmp(&t2.number));
    handle_nvme_composite(device_name, &mut temps);
    trace!("Hwmon Temps detected: {temps:?} for {base_path:?}");
    Ok(temps)
}

/// Return the temp statuses for all channels.
/// Defaults to 0 for all temps to handle temporary issues,
/// as they were correctly detected on startup.
pub async fn extract_temp_statuses(
    driver: &HwmonDriverInfo,
    type_index: TypeIndex,
) -> Vec<TempStatus> {
    let mut temps = vec![];
    for channel in &driver.channels {
        if channel.hwmon_type != HwmonChannelType::Temp {
            continue;
        }
        let temp =
            tokio::fs::read_to_string(driver.path.join(format!("temp{}_input", channel.number)))
                .await
                .map_err(anyhow::Error::from)
                .and_then(check_parsing_32)
                // hwmon temps are in millidegrees:
                .map(|degrees| f64::from(degrees) / 1000.0f64)
                .unwrap_or(0f64);
        let frontend_name = channel
            .label
            .clone()
            .unwrap_or_else(|| channel.name.to_title_case());
        temps.push(TempStatus {
            name: channel.name.clone(),
            temp,
            external_name: format!("HW#{type_index} {frontend_name}"),
            frontend_name,
        });
    }
    temps
}

/// This is used to remove cpu temps by default, as the CPU repo covers those.
fn temps_used_by_another_repo(device_name: &str) -> bool {
    CPU_DEVICE_NAMES_ORDERED.contains(&device_name)
}

/// Whether the temperature sensor is returning valid and sane values
async fn sensor_is_usable(base_path: &Path, channel_number: u8) -> bool {
    let temp_path = base_path.join(format!("temp{channel_number}_input"));
    let possible_degrees = tokio::fs::read_to_string(&temp_path)
        .await
        .map_err(anyhow::Error::from)
        .and_then(check_parsing_32)
        .map(|degrees| f64::from(degrees) / 1000.0f64)
        .inspect_err(|err| {
            debug!("Error reading temperature value from: {temp_path:?} ; {err}");
        })
        .ok();
    if let Some(degrees) = possible_degrees {
        let has_sane_value = degrees > TEMP_SANITY_MIN && degrees <= TEMP_SANITY_MAX;
        if !has_sane_value {
            debug!(
                "Ignoring temperature sensor at {temp_path:?} as value: {degrees} \
                is outside of the usable range"
            );
        }
        return has_sane_value;
    }
    false
}

/// NVMe drives report several internal sensors, but the `Composite` channel
/// is the one that represents the drive. When present, the others are hidden.
fn handle_nvme_composite(device_name: &str, temps: &mut Vec<HwmonChannelInfo>) {
    if !device_name.starts_with(NVME_DEVICE_NAME_PREFIX) {
        return;
    }
    let has_composite = temps
        .iter()
        .any(|channel| channel.label.as_deref() == Some(NVME_COMPOSITE_LABEL));
    if has_composite {
        temps.retain(|channel| channel.label.as_deref() == Some(NVME_COMPOSITE_LABEL));
    }
}

fn check_parsing_32(content: String) -> Result<i32> {
    match content.trim().parse::<i32>() {
        Ok(value) => Ok(value),
        Err(err) => Err(Error::new(ErrorKind::InvalidData, err.to_string()).into()),
    }
}

async fn get_temp_channel_label(base_path: &Path, channel_number: u8) -> Option<String> {
    tokio::fs::read_to_string(base_path.join(format!("temp{channel_number}_label")))
        .await
        .ok()
        .and_then(|label| {
            let temp_label = label.trim();
            if temp_label.is_empty() {
                info!("Temp label is empty: {base_path:?}/temp{channel_number}_label");
                None
            } else {
                Some(temp_label.to_string())
            }
        })
}

fn get_temp_channel_name(channel_number: u8) -> String {
    format!("temp{channel_number}")
}

/// Tests
#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use uuid::Uuid;

    fn test_runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    fn setup() -> PathBuf {
        let test_base_path = PathBuf::from(format!("/tmp/coolerd-tests-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&test_base_path).unwrap();
        test_base_path
    }

    #[test]
    #[serial]
    fn find_temp_dir_not_exist() {
        test_runtime().block_on(async {
            // given:
            let test_base_path = PathBuf::from("/tmp/does_not_exist");

            // when:
            let temps_result = init_temps(&test_base_path, "Test Driver", false).await;

            // then:
            assert!(temps_result.is_err());
        });
    }

    #[test]
    #[serial]
    fn find_temp() {
        test_runtime().block_on(async {
            // given:
            let test_base_path = setup();
            std::fs::write(test_base_path.join("temp1_input"), b"30000").unwrap();
            std::fs::write(test_base_path.join("temp1_label"), b"Temp 1").unwrap();

            // when:
            let temps_result = init_temps(&test_base_path, "Test Driver", false).await;

            // then:
            std::fs::remove_dir_all(&test_base_path).unwrap();
            let temps = temps_result.unwrap();
            assert_eq!(temps.len(), 1);
            assert_eq!(temps[0].hwmon_type, HwmonChannelType::Temp);
            assert_eq!(temps[0].name, "temp1");
            assert_eq!(temps[0].label, Some("Temp 1".to_string()));
            assert_eq!(temps[0].number, 1);
        });
    }

    #[test]
    #[serial]
    fn unreasonable_temps_are_filtered() {
        test_runtime().block_on(async {
            // given: one frozen sensor, one on fire, one sane
            let test_base_path = setup();
            std::fs::write(test_base_path.join("temp1_input"), b"0").unwrap();
            std::fs::write(test_base_path.join("temp2_input"), b"128000").unwrap();
            std::fs::write(test_base_path.join("temp3_input"), b"44000").unwrap();

            // when:
            let temps_result = init_temps(&test_base_path, "Test Driver", false).await;

            // then:
            std::fs::remove_dir_all(&test_base_path).unwrap();
            let temps = temps_result.unwrap();
            assert_eq!(temps.len(), 1);
            assert_eq!(temps[0].name, "temp3");
        });
    }

    #[test]
    #[serial]
    fn nvme_composite_hides_other_sensors() {
        test_runtime().block_on(async {
            // given:
            let test_base_path = setup();
            std::fs::write(test_base_path.join("temp1_input"), b"35000").unwrap();
            std::fs::write(test_base_path.join("temp1_label"), b"Composite").unwrap();
            std::fs::write(test_base_path.join("temp2_input"), b"37000").unwrap();
            std::fs::write(test_base_path.join("temp2_label"), b"Sensor 1").unwrap();

            // when:
            let temps_result = init_temps(&test_base_path, "nvme", false).await;

            // then:
            std::fs::remove_dir_all(&test_base_path).unwrap();
            let temps = temps_result.unwrap();
            assert_eq!(temps.len(), 1);
            assert_eq!(temps[0].label, Some("Composite".to_string()));
        });
    }

    #[test]
    #[serial]
    fn cpu_covered_temps_are_skipped_unless_opted_in() {
        test_runtime().block_on(async {
            // given:
            let test_base_path = setup();
            std::fs::write(test_base_path.join("temp1_input"), b"52000").unwrap();

            // when:
            let skipped = init_temps(&test_base_path, "k10temp", false).await.unwrap();
            let included = init_temps(&test_base_path, "k10temp", true).await.unwrap();

            // then:
            std::fs::remove_dir_all(&test_base_path).unwrap();
            assert!(skipped.is_empty());
            assert_eq!(included.len(), 1);
        });
    }

    #[test]
    #[serial]
    fn temp_statuses_have_unique_external_names() {
        test_runtime().block_on(async {
            // given:
            let test_base_path = setup();
            std::fs::write(test_base_path.join("temp1_input"), b"30000").unwrap();
            let driver = HwmonDriverInfo {
                name: "Test Driver".to_string(),
                path: test_base_path.clone(),
                model: None,
                channels: vec![HwmonChannelInfo {
                    hwmon_type: HwmonChannelType::Temp,
                    number: 1,
                    name: "temp1".to_string(),
                    label: None,
                    ..Default::default()
                }],
            };

            // when:
            let temps = extract_temp_statuses(&driver, 2).await;

            // then:
            std::fs::remove_dir_all(&test_base_path).unwrap();
            assert_eq!(temps.len(), 1);
            assert_eq!(temps[0].temp, 30.0);
            assert_eq!(temps[0].frontend_name, "Temp1");
            assert_eq!(temps[0].external_name, "HW#2 Temp1");
        });
    }
}
