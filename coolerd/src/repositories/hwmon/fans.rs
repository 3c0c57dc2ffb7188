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

//! Hwmon fan handling. Reading sysfs is done directly as those files are
//! world-readable, but every write goes through the privileged coolerod
//! daemon, as this daemon runs unprivileged.

use std::io::{Error, ErrorKind};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use lazy_static::lazy_static;
use log::{debug, error, info, trace, warn};
use regex::Regex;

use crate::device::ChannelStatus;
use crate::repositories::coolerod_client::CoolerodClient;
use crate::repositories::hwmon::devices;
use crate::repositories::hwmon::hwmon_repo::{HwmonChannelInfo, HwmonChannelType, HwmonDriverInfo};

const PATTERN_PWM_FILE_NUMBER: &str = r"^pwm(?P<number>\d+)$";
const PATTERN_FAN_INPUT_FILE_NUMBER: &str = r"^fan(?P<number>\d+)_input$";
const PWM_ENABLE_MANUAL_VALUE: u8 = 1;
const PWM_ENABLE_AUTOMATIC_VALUE: u8 = 2;
const PWM_ENABLE_THINKPAD_FULL_SPEED: u8 = 0;
// a stopped fan with a substantial duty is most likely not connected:
const FILTER_DUTY_THRESHOLD: f64 = 25.0;

lazy_static! {
    static ref REGEX_PWM_FILE: Regex = Regex::new(PATTERN_PWM_FILE_NUMBER).unwrap();
    static ref REGEX_FAN_INPUT_FILE: Regex = Regex::new(PATTERN_FAN_INPUT_FILE_NUMBER).unwrap();
}

macro_rules! format_fan_input { ($($arg:tt)*) => {{ format!("fan{}_input", $($arg)*) }}; }
macro_rules! format_fan_label { ($($arg:tt)*) => {{ format!("fan{}_label", $($arg)*) }}; }
macro_rules! format_pwm { ($($arg:tt)*) => {{ format!("pwm{}", $($arg)*) }}; }
macro_rules! format_pwm_mode { ($($arg:tt)*) => {{ format!("pwm{}_mode", $($arg)*) }}; }
macro_rules! format_pwm_enable { ($($arg:tt)*) => {{ format!("pwm{}_enable", $($arg)*) }}; }

/// Initialize all applicable fans
pub async fn init_fans(
    base_path: &PathBuf,
    device_name: &str,
    coolerod: Option<&CoolerodClient>,
    filter_enabled: bool,
) -> Result<Vec<HwmonChannelInfo>> {
    let mut fans = vec![];
    let dir_entries = std::fs::read_dir(base_path)?;
    for entry in dir_entries {
        let os_file_name = entry?.file_name();
        let file_name = os_file_name.to_str().context("File Name should be a str")?;
        init_pwm_fan(base_path, file_name, &mut fans, device_name, coolerod).await?;
        init_rpm_only_fan(base_path, file_name, &mut fans, device_name).await?;
    }
    if filter_enabled {
        filter_likely_unconnected_fans(base_path, &mut fans, device_name).await;
    }
    fans.sort_by(|c1, c2| c1.number.cmp(&c2.number));
    trace!("Hwmon pwm fans detected: {fans:?} for {base_path:?}");
    Ok(fans)
}

/// Initialize a PWM fan if certain conditions are met.
/// Most all fans that are controllable have a pwm file.
async fn init_pwm_fan(
    base_path: &PathBuf,
    file_name: &str,
    fans: &mut Vec<HwmonChannelInfo>,
    device_name: &str,
    coolerod: Option<&CoolerodClient>,
) -> Result<()> {
    let Some(captures) = REGEX_PWM_FILE.captures(file_name) else {
        return Ok(()); // skip if not a pwm file
    };
    let channel_number: u8 = captures
        .name("number")
        .context("Number Group should exist")?
        .as_str()
        .parse()?;
    if get_pwm_duty(base_path, channel_number, true).await.is_none() {
        return Ok(()); // skip if pwm file isn't readable
    }
    let current_pwm_enable = get_current_pwm_enable(base_path, channel_number).await;
    let pwm_enable_default = adjusted_pwm_default(current_pwm_enable, device_name);
    let channel_name = get_fan_channel_name(channel_number);
    let label = get_fan_channel_label(base_path, channel_number).await;
    let pwm_mode_supported = match coolerod {
        Some(client) => determine_pwm_mode_support(client, base_path, channel_number).await,
        // without the privileged daemon the probe write would fail anyway:
        None => false,
    };
    fans.push(HwmonChannelInfo {
        hwmon_type: HwmonChannelType::Fan,
        number: channel_number,
        pwm_enable_default,
        name: channel_name,
        label,
        pwm_mode_supported,
    });
    Ok(())
}

/// Initialize an RPM-only fan.
/// Some fans are RPM only (display-only), and do not have a pwm file for controlling.
async fn init_rpm_only_fan(
    base_path: &PathBuf,
    file_name: &str,
    fans: &mut Vec<HwmonChannelInfo>,
    device_name: &str,
) -> Result<()> {
    let Some(captures) = REGEX_FAN_INPUT_FILE.captures(file_name) else {
        return Ok(()); // skip if not a fan input file
    };
    let channel_number: u8 = captures
        .name("number")
        .context("Number Group should exist")?
        .as_str()
        .parse()?;
    if get_pwm_duty(base_path, channel_number, false).await.is_some() {
        return Ok(()); // skip if this has a pwm file (it's a pwm fan w/ rpm)
    }
    if get_fan_rpm(base_path, channel_number, true).await.is_none() {
        return Ok(()); // skip if rpm file isn't readable
    }
    let current_pwm_enable = get_current_pwm_enable(base_path, channel_number).await;
    let pwm_enable_default = adjusted_pwm_default(current_pwm_enable, device_name);
    let channel_name = get_fan_channel_name(channel_number);
    let label = get_fan_channel_label(base_path, channel_number).await;
    info!("Uncontrollable RPM-only fan found at {base_path:?}/{file_name}");
    fans.push(HwmonChannelInfo {
        hwmon_type: HwmonChannelType::Fan,
        number: channel_number,
        pwm_enable_default,
        name: channel_name,
        label,
        pwm_mode_supported: false,
    });
    Ok(())
}

/// A fan that reports no rotation while a substantial duty is applied is most
/// likely not connected to a header and only adds noise to the UI. Laptop
/// drivers misreport rpm in some power states, so they are exempt.
async fn filter_likely_unconnected_fans(
    base_path: &Path,
    fans: &mut Vec<HwmonChannelInfo>,
    device_name: &str,
) {
    if devices::is_laptop_device(device_name) {
        return;
    }
    let mut connected_fans = Vec::with_capacity(fans.len());
    for fan in fans.drain(..) {
        let rpm = get_fan_rpm(base_path, fan.number, false).await;
        let duty = get_pwm_duty(base_path, fan.number, false).await;
        if rpm == Some(0) && duty.is_some_and(|duty| duty > FILTER_DUTY_THRESHOLD) {
            info!(
                "Filtering out fan#{} at {base_path:?} as it appears to not be connected",
                fan.number
            );
            continue;
        }
        connected_fans.push(fan);
    }
    *fans = connected_fans;
}

/// Return the fan statuses for all channels.
/// Defaults to 0 for rpm and duty to handle temporary issues,
/// as they were correctly detected on startup.
pub async fn extract_fan_statuses(driver: &HwmonDriverInfo) -> Vec<ChannelStatus> {
    let mut fans = vec![];
    for channel in &driver.channels {
        if channel.hwmon_type != HwmonChannelType::Fan {
            continue;
        }
        let fan_rpm = get_fan_rpm(&driver.path, channel.number, false).await;
        let fan_duty = get_pwm_duty(&driver.path, channel.number, false).await;
        let fan_pwm_mode = if channel.pwm_mode_supported {
            read_sysfs_value(&driver.path.join(format_pwm_mode!(channel.number)))
                .await
                .ok()
        } else {
            None
        };
        fans.push(ChannelStatus {
            name: channel.name.clone(),
            rpm: fan_rpm,
            duty: fan_duty,
            pwm_mode: fan_pwm_mode,
        });
    }
    fans
}

async fn get_pwm_duty(base_path: &Path, channel_number: u8, log_error: bool) -> Option<f64> {
    let pwm_path = base_path.join(format_pwm!(channel_number));
    read_sysfs_value(&pwm_path)
        .await
        .map(pwm_value_to_duty)
        .inspect_err(|err| {
            if log_error {
                warn!("Could not read fan pwm value at {pwm_path:?} ; {err}");
            }
        })
        .ok()
}

async fn get_fan_rpm(base_path: &Path, channel_number: u8, log_error: bool) -> Option<u32> {
    let fan_input_path = base_path.join(format_fan_input!(channel_number));
    tokio::fs::read_to_string(&fan_input_path)
        .await
        .map_err(anyhow::Error::from)
        .and_then(check_parsing_32)
        // Edge case where on spin-up the output is max value until it begins moving
        .map(|rpm| if rpm >= u32::from(u16::MAX) { 0 } else { rpm })
        .inspect_err(|err| {
            if log_error {
                warn!("Could not read fan rpm value at {fan_input_path:?}: {err}");
            }
        })
        .ok()
}

/// Not all drivers have `pwm_enable` for their fans. In that case there is no
/// "automatic" mode available.
///  `pwm_enable` setting options:
///  - 0 : full speed / off (not used/recommended)
///  - 1 : manual control (setting pwm* will adjust fan speed)
///  - 2 : automatic (primarily used by on-board/chip fan control, like laptops or mobos without smart fan control)
///  - 3 : "Fan Speed Cruise" mode (?)
///  - 4 : "Smart Fan III" mode (NCT6775F only)
///  - 5 : "Smart Fan IV" mode (modern `MoBo`'s with build-in smart fan control probably use this)
async fn get_current_pwm_enable(base_path: &Path, channel_number: u8) -> Option<u8> {
    let pwm_enable_path = base_path.join(format_pwm_enable!(channel_number));
    let current_pwm_enable = read_sysfs_value(&pwm_enable_path).await.ok();
    if current_pwm_enable.is_none() {
        warn!("No pwm_enable found for fan#{channel_number} at location:{pwm_enable_path:?}");
    }
    current_pwm_enable
}

/// We save the existing `pwm_enable` setting; applying the channel default or
/// shutting the daemon down reverts to that setting, which is usually 'auto'
/// set by the bios on boot, but not necessarily, and not all devices support
/// an auto setting. That means we can not safely apply 'auto' to `pwm_enable`
/// indiscriminately and therefore use whatever the initial setting was as the
/// default.
///
/// Laptop drivers get an automatic fallback for safety reasons, regardless of
/// the current value.
fn adjusted_pwm_default(current_pwm_enable: Option<u8>, device_name: &str) -> Option<u8> {
    current_pwm_enable.map(|original_value| {
        if devices::device_needs_pwm_fallback(device_name) {
            PWM_ENABLE_AUTOMATIC_VALUE
        } else {
            original_value
        }
    })
}

async fn get_fan_channel_label(base_path: &Path, channel_number: u8) -> Option<String> {
    tokio::fs::read_to_string(base_path.join(format_fan_label!(channel_number)))
        .await
        .ok()
        .and_then(|label| {
            let fan_label = label.trim();
            if fan_label.is_empty() {
                warn!("Fan label is empty for {base_path:?}/fan{channel_number}_label");
                None
            } else {
                Some(fan_label.to_string())
            }
        })
}

fn get_fan_channel_name(channel_number: u8) -> String {
    format!("fan{channel_number}")
}

/// We need to verify that setting this option is indeed supported (per pwm channel)
///  0 = DC mode, 1 = PWM Mode. Not every device may have this option.
/// The probe round-trips the current value through the privileged daemon.
async fn determine_pwm_mode_support(
    coolerod: &CoolerodClient,
    base_path: &Path,
    channel_number: u8,
) -> bool {
    let pwm_mode_path = base_path.join(format_pwm_mode!(channel_number));
    let Ok(current_pwm_mode) = read_sysfs_value(&pwm_mode_path).await else {
        debug!("PWM Mode not found for fan #{channel_number} from {base_path:?}");
        return false;
    };
    let dc_mode_supported = coolerod.apply_setting(&pwm_mode_path, "0").await.is_ok();
    let pwm_mode_supported = coolerod.apply_setting(&pwm_mode_path, "1").await.is_ok();
    if let Err(err) = coolerod
        .apply_setting(&pwm_mode_path, &current_pwm_mode.to_string())
        .await
    {
        warn!(
            "PWM Modes are not writable: original pwm_mode: {current_pwm_mode} for \
            {pwm_mode_path:?}. Reason: {err}"
        );
    }
    dc_mode_supported && pwm_mode_supported
}

pub async fn set_pwm_mode(
    coolerod: &CoolerodClient,
    base_path: &Path,
    channel_info: &HwmonChannelInfo,
    pwm_mode: Option<u8>,
) -> Result<()> {
    if channel_info.pwm_mode_supported {
        if let Some(pwm_mode) = pwm_mode {
            coolerod
                .apply_setting(
                    &base_path.join(format_pwm_mode!(channel_info.number)),
                    &pwm_mode.to_string(),
                )
                .await?;
        }
    }
    Ok(())
}

/// Restores `pwm_enable` to the value recorded at startup, when it differs
/// from the current value.
pub async fn set_pwm_enable_to_default(
    coolerod: &CoolerodClient,
    base_path: &Path,
    channel_info: &HwmonChannelInfo,
) -> Result<()> {
    let Some(default_value) = channel_info.pwm_enable_default else {
        return Ok(());
    };
    let path_pwm_enable = base_path.join(format_pwm_enable!(channel_info.number));
    let current_pwm_enable: u8 = read_sysfs_value(&path_pwm_enable).await?;
    if current_pwm_enable != default_value {
        coolerod
            .apply_setting(&path_pwm_enable, &default_value.to_string())
            .await
            .with_context(|| {
                let msg = "Not able to reset pwm_enable. Most likely because of a \
                    permissions issue or driver limitation.";
                error!("{msg}");
                msg
            })?;
        info!(
            "Hwmon value at {base_path:?}/pwm{}_enable reset to starting default value of {default_value}",
            channel_info.number
        );
    }
    Ok(())
}

/// This sets `pwm_enable` to 0. The effect is device dependent, but it is
/// primarily used for `ThinkPads` where this means "full-speed". See:
/// <https://www.kernel.org/doc/html/latest/admin-guide/laptops/thinkpad-acpi.html#fan-control-and-monitoring-fan-speed-fan-enable-disable>
pub async fn set_thinkpad_to_full_speed(
    coolerod: &CoolerodClient,
    base_path: &Path,
    channel_info: &HwmonChannelInfo,
) -> Result<()> {
    let path_pwm_enable = base_path.join(format_pwm_enable!(channel_info.number));
    let current_pwm_enable: u8 = read_sysfs_value(&path_pwm_enable).await?;
    if current_pwm_enable != PWM_ENABLE_THINKPAD_FULL_SPEED {
        coolerod
            .apply_setting(
                &path_pwm_enable,
                &PWM_ENABLE_THINKPAD_FULL_SPEED.to_string(),
            )
            .await
            .with_context(|| {
                let msg = "Not able to set pwm_enable to 0. Most likely because of a \
                    permissions issue or driver limitation.";
                error!("{msg}");
                msg
            })?;
    }
    Ok(())
}

/// Applies a fixed duty. When the channel has a `pwm_enable`, manual control
/// is ensured before the duty value is written.
pub async fn set_pwm_duty(
    coolerod: &CoolerodClient,
    base_path: &Path,
    channel_info: &HwmonChannelInfo,
    speed_duty: u8,
) -> Result<()> {
    let pwm_value = duty_to_pwm_value(speed_duty);
    if channel_info.pwm_enable_default.is_some() {
        let path_pwm_enable = base_path.join(format_pwm_enable!(channel_info.number));
        let current_pwm_enable: u8 = read_sysfs_value(&path_pwm_enable).await?;
        if current_pwm_enable != PWM_ENABLE_MANUAL_VALUE {
            coolerod
                .apply_setting(&path_pwm_enable, &PWM_ENABLE_MANUAL_VALUE.to_string())
                .await
                .with_context(|| {
                    let msg = format!(
                        "Unable to set manual fan control for {path_pwm_enable:?}. \
                        Most likely because of a limitation set by the driver or a BIOS setting."
                    );
                    error!("{msg}");
                    msg
                })?;
        }
    }
    let pwm_path = base_path.join(format_pwm!(channel_info.number));
    coolerod
        .apply_setting(&pwm_path, &pwm_value.to_string())
        .await
        .map_err(|err| anyhow!("Unable to set PWM value {pwm_value} for {pwm_path:?} Reason: {err}"))
}

async fn read_sysfs_value(path: &Path) -> Result<u8> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(anyhow::Error::from)
        .and_then(check_parsing_8)
}

fn check_parsing_8(content: String) -> Result<u8> {
    match content.trim().parse::<u8>() {
        Ok(value) => Ok(value),
        Err(err) => Err(Error::new(ErrorKind::InvalidData, err.to_string()).into()),
    }
}

fn check_parsing_32(content: String) -> Result<u32> {
    match content.trim().parse::<u32>() {
        Ok(value) => Ok(value),
        Err(err) => Err(Error::new(ErrorKind::InvalidData, err.to_string()).into()),
    }
}

/// Converts a pwm value (0-255) to a duty value (0-100%)
fn pwm_value_to_duty(pwm_value: u8) -> f64 {
    ((f64::from(pwm_value) / 0.255).round() / 10.0).round()
}

/// Converts a duty value (0-100%) to a pwm value (0-255).
/// Fractional pwm steps are truncated, a fan can't be driven by half a step.
fn duty_to_pwm_value(speed_duty: u8) -> u8 {
    let clamped_duty = f64::from(speed_duty.clamp(0, 100));
    (clamped_duty * 2.55) as u8
}

/// Tests
#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;
    use tokio::sync::Mutex;
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

    type WriteLog = Arc<Mutex<Vec<(String, String)>>>;

    /// A minimal stand-in for the privileged daemon: speaks the framed
    /// protocol, applies writes directly and records their order.
    async fn spawn_stub_coolerod(runtime_dir: &Path) -> WriteLog {
        let socket_dir = runtime_dir.join("coolerd");
        std::fs::create_dir_all(&socket_dir).unwrap();
        let listener = UnixListener::bind(socket_dir.join("coolerod.sock")).unwrap();
        let write_log: WriteLog = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&write_log);
        tokio::task::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let log = Arc::clone(&log);
                tokio::task::spawn(async move {
                    loop {
                        let Ok(frame_size) = stream.read_u64().await else {
                            return;
                        };
                        let mut buffer = vec![0u8; frame_size as usize];
                        if stream.read_exact(&mut buffer).await.is_err() {
                            return;
                        }
                        let msg: serde_json::Value = serde_json::from_slice(&buffer).unwrap();
                        let response = if msg.get("version").is_some() {
                            "version supported".to_string()
                        } else if let (Some(path), Some(value)) = (
                            msg.get("path").and_then(|v| v.as_str()),
                            msg.get("value").and_then(|v| v.as_str()),
                        ) {
                            log.lock().await.push((path.to_string(), value.to_string()));
                            match std::fs::write(path, value) {
                                Ok(()) => "setting success".to_string(),
                                Err(_) => "setting failure".to_string(),
                            }
                        } else {
                            "bye".to_string()
                        };
                        let body =
                            serde_json::to_vec(&serde_json::json!({"response": response})).unwrap();
                        stream.write_u64(body.len() as u64).await.unwrap();
                        stream.write_all(&body).await.unwrap();
                    }
                });
            }
        });
        write_log
    }

    #[test]
    #[serial]
    fn find_fan() {
        test_runtime().block_on(async {
            // given:
            let test_base_path = setup();
            std::fs::write(test_base_path.join("pwm1"), b"127").unwrap();
            std::fs::write(test_base_path.join("fan1_input"), b"3000").unwrap();

            // when:
            let fans_result = init_fans(&test_base_path, "Test Driver", None, false).await;

            // then:
            std::fs::remove_dir_all(&test_base_path).unwrap();
            let fans = fans_result.unwrap();
            assert_eq!(fans.len(), 1);
            assert_eq!(fans[0].hwmon_type, HwmonChannelType::Fan);
            assert_eq!(fans[0].name, "fan1");
            assert!(!fans[0].pwm_mode_supported);
            assert_eq!(fans[0].pwm_enable_default, None);
            assert_eq!(fans[0].number, 1);
        });
    }

    #[test]
    #[serial]
    fn find_fan_rpm_only() {
        test_runtime().block_on(async {
            // given:
            let test_base_path = setup();
            std::fs::write(test_base_path.join("fan1_input"), b"3000").unwrap();

            // when:
            let fans_result = init_fans(&test_base_path, "Test Driver", None, false).await;

            // then:
            std::fs::remove_dir_all(&test_base_path).unwrap();
            let fans = fans_result.unwrap();
            assert_eq!(fans.len(), 1);
            assert!(!fans[0].pwm_mode_supported);
        });
    }

    #[test]
    #[serial]
    fn filter_suppresses_probably_unconnected_fans() {
        test_runtime().block_on(async {
            // given: a fan not spinning at 50% duty and a healthy one
            let test_base_path = setup();
            std::fs::write(test_base_path.join("pwm1"), b"127").unwrap();
            std::fs::write(test_base_path.join("fan1_input"), b"0").unwrap();
            std::fs::write(test_base_path.join("pwm2"), b"127").unwrap();
            std::fs::write(test_base_path.join("fan2_input"), b"1400").unwrap();

            // when:
            let fans = init_fans(&test_base_path, "nct6775", None, true)
                .await
                .unwrap();

            // then:
            std::fs::remove_dir_all(&test_base_path).unwrap();
            assert_eq!(fans.len(), 1);
            assert_eq!(fans[0].name, "fan2");
        });
    }

    #[test]
    #[serial]
    fn filter_keeps_laptop_fans() {
        test_runtime().block_on(async {
            // given: a thinkpad fan that isn't currently spinning
            let test_base_path = setup();
            std::fs::write(test_base_path.join("pwm1"), b"127").unwrap();
            std::fs::write(test_base_path.join("fan1_input"), b"0").unwrap();

            // when:
            let fans = init_fans(&test_base_path, "thinkpad", None, true)
                .await
                .unwrap();

            // then:
            std::fs::remove_dir_all(&test_base_path).unwrap();
            assert_eq!(fans.len(), 1);
        });
    }

    #[test]
    #[serial]
    fn laptop_pwm_enable_default_is_forced_to_automatic() {
        test_runtime().block_on(async {
            // given: a thinkpad currently in manual mode
            let test_base_path = setup();
            std::fs::write(test_base_path.join("pwm1"), b"127").unwrap();
            std::fs::write(test_base_path.join("pwm1_enable"), b"1").unwrap();

            // when:
            let fans = init_fans(&test_base_path, "thinkpad", None, false)
                .await
                .unwrap();

            // then: the default used for restore is the automatic mode
            std::fs::remove_dir_all(&test_base_path).unwrap();
            assert_eq!(fans[0].pwm_enable_default, Some(2));
        });
    }

    #[test]
    #[serial]
    fn set_pwm_duty_enables_manual_mode_first() {
        test_runtime().block_on(async {
            // given: a channel in automatic mode
            let test_base_path = setup();
            std::env::set_var("XDG_RUNTIME_DIR", &test_base_path);
            let write_log = spawn_stub_coolerod(&test_base_path).await;
            std::fs::write(test_base_path.join("pwm1"), b"255").unwrap();
            std::fs::write(test_base_path.join("pwm1_enable"), b"2").unwrap();
            let coolerod = CoolerodClient::connect().await.unwrap();
            let channel_info = HwmonChannelInfo {
                hwmon_type: HwmonChannelType::Fan,
                number: 1,
                pwm_enable_default: Some(2),
                name: "fan1".to_string(),
                label: None,
                pwm_mode_supported: false,
            };

            // when:
            let result = set_pwm_duty(&coolerod, &test_base_path, &channel_info, 50).await;

            // then: manual mode first, then the duty, in that order
            let writes = write_log.lock().await.clone();
            let enable_content = std::fs::read_to_string(test_base_path.join("pwm1_enable")).unwrap();
            let pwm_content = std::fs::read_to_string(test_base_path.join("pwm1")).unwrap();
            std::env::remove_var("XDG_RUNTIME_DIR");
            std::fs::remove_dir_all(&test_base_path).unwrap();
            assert!(result.is_ok());
            assert_eq!(writes.len(), 2);
            assert!(writes[0].0.ends_with("pwm1_enable"));
            assert_eq!(writes[0].1, "1");
            assert!(writes[1].0.ends_with("pwm1"));
            assert_eq!(writes[1].1, "127");
            assert_eq!(enable_content, "1");
            assert_eq!(pwm_content, "127");
        });
    }

    #[test]
    #[serial]
    fn set_pwm_enable_to_default_restores_recorded_value() {
        test_runtime().block_on(async {
            // given: manual mode now, automatic recorded at startup
            let test_base_path = setup();
            std::env::set_var("XDG_RUNTIME_DIR", &test_base_path);
            let _write_log = spawn_stub_coolerod(&test_base_path).await;
            std::fs::write(test_base_path.join("pwm1_enable"), b"1").unwrap();
            let coolerod = CoolerodClient::connect().await.unwrap();
            let channel_info = HwmonChannelInfo {
                hwmon_type: HwmonChannelType::Fan,
                number: 1,
                pwm_enable_default: Some(2),
                name: "fan1".to_string(),
                label: None,
                pwm_mode_supported: false,
            };

            // when:
            let result =
                set_pwm_enable_to_default(&coolerod, &test_base_path, &channel_info).await;

            // then:
            let enable_content = std::fs::read_to_string(test_base_path.join("pwm1_enable")).unwrap();
            std::env::remove_var("XDG_RUNTIME_DIR");
            std::fs::remove_dir_all(&test_base_path).unwrap();
            assert!(result.is_ok());
            assert_eq!(enable_content, "2");
        });
    }

    #[test]
    fn duty_pwm_conversions() {
        assert_eq!(duty_to_pwm_value(50), 127);
        assert_eq!(duty_to_pwm_value(0), 0);
        assert_eq!(duty_to_pwm_value(100), 255);
        assert_eq!(duty_to_pwm_value(120), 255); // clamped
        assert_eq!(pwm_value_to_duty(127), 50.0);
        assert_eq!(pwm_value_to_duty(255), 100.0);
        assert_eq!(pwm_value_to_duty(0), 0.0);
    }
}
