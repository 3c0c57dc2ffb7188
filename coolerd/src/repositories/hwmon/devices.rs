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

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use log::warn;
use nu_glob::{glob, GlobResult};
use regex::Regex;

use crate::repositories::hwmon::hwmon_repo::HwmonDriverInfo;

const GLOB_PWM_PATH: &str = "/sys/class/hwmon/hwmon*/pwm*";
const GLOB_TEMP_PATH: &str = "/sys/class/hwmon/hwmon*/temp*_input";
// CentOS has an intermediate /device directory:
const GLOB_PWM_PATH_CENTOS: &str = "/sys/class/hwmon/hwmon*/device/pwm*";
const GLOB_TEMP_PATH_CENTOS: &str = "/sys/class/hwmon/hwmon*/device/temp*_input";
const PATTERN_PWM_PATH_NUMBER: &str = r".*/pwm\d+$";
const PATTERN_HWMON_PATH_NUMBER: &str = r"/(?P<hwmon>hwmon)(?P<number>\d+)";

// these are devices that are handled by other repos (cooling-lib/gpu) and need not be duplicated
const HWMON_DEVICE_NAME_BLACKLIST: [&str; 5] = [
    "amdgpu", // GPU repo handles this
    // cooling-lib covered kernel drivers:
    "nzxt-smart2",
    "nzxt-kraken2",
    "nzxt-kraken3",
    "corsair-cpro",
];
const LAPTOP_DEVICE_NAMES: [&str; 3] = ["thinkpad", "asus-nb-wmi", "asus_fan"];
pub const THINKPAD_DEVICE_NAME: &str = "thinkpad";

lazy_static! {
    static ref REGEX_PWM_PATH: Regex = Regex::new(PATTERN_PWM_PATH_NUMBER).unwrap();
    static ref REGEX_HWMON_PATH: Regex = Regex::new(PATTERN_HWMON_PATH_NUMBER).unwrap();
}

/// Get distinct sorted hwmon paths that have either fan controls or temps.
/// We additionally need to check for `CentOS` style paths.
pub fn find_all_hwmon_device_paths() -> Vec<PathBuf> {
    let pwm_glob_results = glob(GLOB_PWM_PATH)
        .expect("glob pattern is valid")
        .chain(glob(GLOB_PWM_PATH_CENTOS).expect("glob pattern is valid"))
        .collect::<Vec<GlobResult>>();
    let mut base_paths = pwm_glob_results
        .into_iter()
        .filter_map(Result::ok)
        .filter(|path| path.is_absolute())
        // search for only pwm\d+ files (no _mode, _enable, etc):
        .filter(|path| {
            path.to_str()
                .is_some_and(|path_str| REGEX_PWM_PATH.is_match(path_str))
        })
        .filter_map(|path| path.parent().map(Path::to_path_buf))
        .collect::<Vec<PathBuf>>();
    let temp_glob_results = glob(GLOB_TEMP_PATH)
        .expect("glob pattern is valid")
        .chain(glob(GLOB_TEMP_PATH_CENTOS).expect("glob pattern is valid"))
        .collect::<Vec<GlobResult>>();
    base_paths.append(
        &mut temp_glob_results
            .into_iter()
            .filter_map(Result::ok)
            .filter(|path| path.is_absolute())
            .filter_map(|path| path.parent().map(Path::to_path_buf))
            .collect::<Vec<PathBuf>>(),
    );
    deduplicate_and_sort_paths(base_paths)
}

fn deduplicate_and_sort_paths(base_paths: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut sorted_path_list = base_paths
        .into_iter()
        .collect::<HashSet<PathBuf>>()
        .into_iter()
        .collect::<Vec<PathBuf>>();
    sorted_path_list.sort();
    sorted_path_list
}

/// Returns the found device "name" or if not found, the hwmon number
pub async fn get_device_name(base_path: &Path) -> String {
    if let Ok(contents) = tokio::fs::read_to_string(base_path.join("name")).await {
        contents.trim().to_string()
    } else {
        // hwmon\d+ should always exist in the path (from the previous search)
        let hwmon_name = REGEX_HWMON_PATH
            .captures(&base_path.to_string_lossy())
            .and_then(|captures| captures.name("number"))
            .map_or_else(
                || "Hwmon#?".to_string(),
                |number| format!("Hwmon#{}", number.as_str()),
            );
        warn!("Hwmon driver at location: {base_path:?} has no name set, using default: {hwmon_name}");
        hwmon_name
    }
}

/// Whether the device family is already covered by another repository.
pub fn is_already_used_by_other_repo(device_name: &str) -> bool {
    HWMON_DEVICE_NAME_BLACKLIST.contains(&device_name)
}

/// Some laptop drivers should have an automatic fallback for safety reasons,
/// regardless of the current pwm_enable value.
pub fn device_needs_pwm_fallback(device_name: &str) -> bool {
    LAPTOP_DEVICE_NAMES.contains(&device_name)
}

pub fn is_laptop_device(device_name: &str) -> bool {
    LAPTOP_DEVICE_NAMES.contains(&device_name)
}

/// Returns the device model name if it exists.
/// This is common for some hardware, like hard drives, and helps differentiate
/// similar devices.
pub async fn get_device_model_name(base_path: &Path) -> Option<String> {
    tokio::fs::read_to_string(device_path(base_path).join("model"))
        .await
        .map(|model| model.trim().to_string())
        .ok()
}

/// Returns the sysfs device path for a given `base_path`.
/// A `base_path` already ending in "device" is a `CentOS` style path and is
/// returned as is.
fn device_path(base_path: &Path) -> PathBuf {
    if base_path.ends_with("device") {
        base_path.to_path_buf()
    } else {
        base_path.join("device")
    }
}

/// The kernel's uevent metadata for the underlying device.
pub async fn get_device_uevent_details(base_path: &Path) -> HashMap<String, String> {
    let mut details = HashMap::new();
    if let Ok(contents) = tokio::fs::read_to_string(device_path(base_path).join("uevent")).await {
        for line in contents.lines() {
            if let Some((key, value)) = line.split_once('=') {
                details.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
    }
    details
}

/// Checks if there are duplicate device names but different device paths,
/// and adjusts them as necessary. i.e. nvme drivers.
pub async fn handle_duplicate_device_names(hwmon_drivers: &mut [HwmonDriverInfo]) {
    let mut name_counts: HashMap<String, usize> = HashMap::new();
    for driver in hwmon_drivers.iter() {
        *name_counts.entry(driver.name.clone()).or_default() += 1;
    }
    for driver in hwmon_drivers.iter_mut() {
        if name_counts.get(&driver.name).copied().unwrap_or_default() > 1 {
            driver.name = get_alternative_device_name(driver).await;
        }
    }
}

/// Searches for the best alternative name to use in case of a duplicate device name
async fn get_alternative_device_name(driver: &HwmonDriverInfo) -> String {
    let device_details = get_device_uevent_details(&driver.path).await;
    if let Some(dev_name) = device_details.get("DEVNAME") {
        dev_name.to_string()
    } else if let Some(minor_num) = device_details.get("MINOR") {
        format!("{}{}", driver.name, minor_num)
    } else if let Some(model) = driver.model.clone() {
        model
    } else {
        driver.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blacklisted_names_are_skipped() {
        assert!(is_already_used_by_other_repo("amdgpu"));
        assert!(is_already_used_by_other_repo("nzxt-smart2"));
        assert!(!is_already_used_by_other_repo("nct6775"));
    }

    #[test]
    fn laptop_devices_need_pwm_fallback() {
        assert!(device_needs_pwm_fallback("thinkpad"));
        assert!(device_needs_pwm_fallback("asus-nb-wmi"));
        assert!(!device_needs_pwm_fallback("nct6775"));
    }

    #[test]
    fn fallback_device_name_uses_hwmon_number() {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(async {
                let name =
                    get_device_name(Path::new("/non/existent/hwmon/hwmon7")).await;
                assert_eq!(name, "Hwmon#7");
            });
    }
}
