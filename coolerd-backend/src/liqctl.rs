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

//! The seam to the third-party cooling-device library.
//!
//! The library is Python and its calls block on native HID/USB I/O, so every
//! method here must only ever be called from a device worker thread, never
//! from the async runtime. The rest of the service speaks to devices solely
//! through the [`CoolingDevice`] trait, which also keeps the timeout/cache
//! protocol testable without hardware.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyList, PyTuple};

use crate::models::{DeviceProperties, Statuses};

/// The uniform, object-safe surface of a single device handle. All methods
/// are blocking.
pub trait CoolingDevice: Send + Sync {
    fn description(&self) -> String;
    /// The library's driver class name, e.g. "KrakenX3" or "Legacy690Lc".
    fn device_type(&self) -> String;
    fn serial_number(&self) -> Option<String>;
    fn hid_address(&self) -> Option<String>;
    fn hwmon_address(&self) -> Option<String>;
    fn properties(&self) -> DeviceProperties;
    fn connect(&self) -> Result<()>;
    fn initialize(&self, pump_mode: Option<String>) -> Result<Statuses>;
    fn get_status(&self) -> Result<Statuses>;
    fn set_fixed_speed(&self, channel: &str, duty: u8) -> Result<()>;
    fn set_speed_profile(
        &self,
        channel: &str,
        profile: &[(f64, u8)],
        temperature_sensor: Option<u8>,
    ) -> Result<()>;
    fn set_color(
        &self,
        channel: &str,
        mode: &str,
        colors: &[(u8, u8, u8)],
        time_per_color: Option<u8>,
        speed: Option<String>,
        direction: Option<String>,
    ) -> Result<()>;
    fn set_screen(&self, channel: &str, mode: &str, value: Option<String>) -> Result<()>;
    fn disconnect(&self) -> Result<()>;
}

pub struct LiquidctlLib {
    version: String,
}

impl LiquidctlLib {
    /// Initializes the embedded interpreter and verifies the library is
    /// importable. Must be called once before anything else, from a blocking
    /// context so the Python logger integrates with ours.
    pub fn init() -> Result<Self> {
        debug!("Verifying Python environment for the cooling library...");
        pyo3::prepare_freethreaded_python();
        let version = Python::with_gil(|py| -> PyResult<String> {
            pyo3_pylogger::setup_logging(py, "coolerd-backend")?;
            let liquidctl = py.import("liquidctl")?;
            liquidctl.getattr("__version__")?.extract::<String>()
        })
        .map_err(|err| anyhow!("The liquidctl python package is required: {err}"))?;
        info!("Using liquidctl version: {version}");
        Ok(Self { version })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Runs device discovery and returns one handle per found device.
    pub fn find_devices(&self) -> Result<Vec<Arc<dyn CoolingDevice>>> {
        Python::with_gil(|py| {
            let liquidctl = py.import("liquidctl")?;
            let found = liquidctl.call_method0("find_liquidctl_devices")?;
            let mut devices: Vec<Arc<dyn CoolingDevice>> = Vec::new();
            for lc_device in found.try_iter()? {
                devices.push(Arc::new(PyDevice {
                    handle: lc_device?.unbind(),
                }));
            }
            Ok(devices)
        })
    }

    /// Runs discovery restricted to the legacy Asetek 690 driver. Used when
    /// the user confirms their device is the legacy variant of the shared
    /// vendor/product id.
    pub fn find_legacy690_devices(&self) -> Result<Vec<Arc<dyn CoolingDevice>>> {
        Python::with_gil(|py| {
            let asetek = py.import("liquidctl.driver.asetek")?;
            let legacy_class = asetek.getattr("Legacy690Lc")?;
            let found = legacy_class.call_method0("find_supported_devices")?;
            let mut devices: Vec<Arc<dyn CoolingDevice>> = Vec::new();
            for lc_device in found.try_iter()? {
                devices.push(Arc::new(PyDevice {
                    handle: lc_device?.unbind(),
                }));
            }
            Ok(devices)
        })
    }
}

/// A handle to one device instance held by the Python library.
struct PyDevice {
    handle: Py<PyAny>,
}

impl PyDevice {
    fn getattr_string(&self, py: Python, name: &str) -> Option<String> {
        self.handle
            .bind(py)
            .getattr(name)
            .ok()
            .and_then(|attr| attr.extract::<Option<String>>().ok())
            .flatten()
    }

    fn getattr_bool(&self, py: Python, name: &str) -> Option<bool> {
        self.handle
            .bind(py)
            .getattr(name)
            .ok()
            .and_then(|attr| attr.extract::<bool>().ok())
    }

    /// Keys of an internal dict attribute, e.g. `_speed_channels`.
    fn getattr_dict_keys(&self, py: Python, name: &str) -> Vec<String> {
        self.handle
            .bind(py)
            .getattr(name)
            .ok()
            .and_then(|attr| attr.downcast_into::<PyDict>().ok())
            .map(|dict| {
                dict.keys()
                    .iter()
                    .filter_map(|key| key.extract::<String>().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn getattr_string_list(&self, py: Python, name: &str) -> Vec<String> {
        self.handle
            .bind(py)
            .getattr(name)
            .ok()
            .and_then(|attr| attr.extract::<Vec<String>>().ok())
            .unwrap_or_default()
    }

    /// Converts the library's `[(name, value, unit), ...]` status response,
    /// stringifying each value for a stable wire format.
    fn extract_statuses(status_response: &Bound<PyAny>) -> Result<Statuses> {
        let status_list = status_response
            .downcast::<PyList>()
            .map_err(|err| anyhow!("Status response should be a list: {err}"))?;
        let mut statuses = Vec::with_capacity(status_list.len());
        for status_entry in status_list {
            let triple = status_entry
                .downcast::<PyTuple>()
                .map_err(|err| anyhow!("Status entry should be a tuple: {err}"))?;
            if triple.len() < 3 {
                continue;
            }
            statuses.push((
                triple.get_item(0)?.str()?.to_string(),
                triple.get_item(1)?.str()?.to_string(),
                triple.get_item(2)?.str()?.to_string(),
            ));
        }
        Ok(statuses)
    }
}

impl CoolingDevice for PyDevice {
    fn description(&self) -> String {
        Python::with_gil(|py| self.getattr_string(py, "description").unwrap_or_default())
    }

    fn device_type(&self) -> String {
        Python::with_gil(|py| {
            self.handle
                .bind(py)
                .get_type()
                .name()
                .map(|name| name.to_string())
                .unwrap_or_default()
        })
    }

    fn serial_number(&self) -> Option<String> {
        Python::with_gil(|py| {
            // Aquacomputer devices read their serial number into _serial_number:
            self.getattr_string(py, "_serial_number").or_else(|| {
                self.getattr_string(py, "serial_number").or_else(|| {
                    warn!("No serial number found for {}", self.description());
                    None
                })
            })
        })
    }

    fn hid_address(&self) -> Option<String> {
        Python::with_gil(|py| self.getattr_string(py, "address"))
    }

    fn hwmon_address(&self) -> Option<String> {
        Python::with_gil(|py| {
            self.handle
                .bind(py)
                .getattr("_hwmon")
                .ok()
                .filter(|hwmon| !hwmon.is_none())
                .and_then(|hwmon| hwmon.getattr("path").ok())
                .and_then(|path| path.str().ok())
                .map(|path| path.to_string())
        })
    }

    /// Device instance attributes determine the specific configuration of a
    /// given device. Which attributes exist varies per driver class.
    fn properties(&self) -> DeviceProperties {
        Python::with_gil(|py| {
            let mut speed_channels = self.getattr_dict_keys(py, "_speed_channels");
            if speed_channels.is_empty() {
                speed_channels = self.getattr_string_list(py, "_fan_names");
            }
            if speed_channels.is_empty() {
                // aquacomputer keeps its controllable channels in _device_info:
                speed_channels = self
                    .handle
                    .bind(py)
                    .getattr("_device_info")
                    .ok()
                    .and_then(|info| info.get_item("fan_ctrl").ok())
                    .and_then(|ctrl| ctrl.downcast_into::<PyDict>().ok())
                    .map(|dict| {
                        dict.keys()
                            .iter()
                            .filter_map(|key| key.extract::<String>().ok())
                            .collect()
                    })
                    .unwrap_or_default();
            }
            let mut color_channels = self.getattr_dict_keys(py, "_color_channels");
            if color_channels.is_empty() {
                color_channels = self.getattr_string_list(py, "_led_names");
            }
            let led_count = self
                .handle
                .bind(py)
                .getattr("_led_count")
                .ok()
                .and_then(|attr| attr.extract::<u8>().ok());
            if led_count.is_some() && color_channels.is_empty() {
                color_channels = vec!["led".to_string()];
            }
            let lcd_resolution = self
                .handle
                .bind(py)
                .getattr("_lcd_resolution")
                .ok()
                .and_then(|attr| attr.extract::<(u32, u32)>().ok());
            DeviceProperties {
                speed_channels,
                color_channels,
                supports_cooling: self.getattr_bool(py, "supports_cooling"),
                // requires connect() to already have been called:
                supports_cooling_profiles: self.getattr_bool(py, "supports_cooling_profiles"),
                supports_lighting: self.getattr_bool(py, "supports_lighting"),
                led_count,
                lcd_resolution,
            }
        })
    }

    fn connect(&self) -> Result<()> {
        Python::with_gil(|py| {
            self.handle
                .bind(py)
                .call_method0("connect")
                .map(|_| ())
                .with_context(|| format!("connect() for {}", self.description()))
        })
    }

    fn initialize(&self, pump_mode: Option<String>) -> Result<Statuses> {
        Python::with_gil(|py| {
            let kwargs = PyDict::new(py);
            if let Some(pump_mode) = pump_mode {
                kwargs.set_item("pump_mode", pump_mode)?;
            }
            let response = self
                .handle
                .bind(py)
                .call_method("initialize", (), Some(&kwargs))
                .with_context(|| format!("initialize() for {}", self.description()))?;
            if response.is_none() {
                return Ok(Vec::new());
            }
            Self::extract_statuses(&response)
        })
    }

    fn get_status(&self) -> Result<Statuses> {
        Python::with_gil(|py| {
            let response = self
                .handle
                .bind(py)
                .call_method0("get_status")
                .with_context(|| format!("get_status() for {}", self.description()))?;
            Self::extract_statuses(&response)
        })
    }

    fn set_fixed_speed(&self, channel: &str, duty: u8) -> Result<()> {
        Python::with_gil(|py| {
            let kwargs = PyDict::new(py);
            kwargs.set_item("channel", channel)?;
            kwargs.set_item("duty", duty)?;
            self.handle
                .bind(py)
                .call_method("set_fixed_speed", (), Some(&kwargs))
                .map(|_| ())
                .with_context(|| format!("set_fixed_speed() for {}", self.description()))
        })
    }

    fn set_speed_profile(
        &self,
        channel: &str,
        profile: &[(f64, u8)],
        temperature_sensor: Option<u8>,
    ) -> Result<()> {
        Python::with_gil(|py| {
            let kwargs = PyDict::new(py);
            kwargs.set_item("channel", channel)?;
            kwargs.set_item("profile", profile.to_vec())?;
            if let Some(sensor) = temperature_sensor {
                kwargs.set_item("temperature_sensor", sensor)?;
            }
            self.handle
                .bind(py)
                .call_method("set_speed_profile", (), Some(&kwargs))
                .map(|_| ())
                .with_context(|| format!("set_speed_profile() for {}", self.description()))
        })
    }

    fn set_color(
        &self,
        channel: &str,
        mode: &str,
        colors: &[(u8, u8, u8)],
        time_per_color: Option<u8>,
        speed: Option<String>,
        direction: Option<String>,
    ) -> Result<()> {
        Python::with_gil(|py| {
            let kwargs = PyDict::new(py);
            kwargs.set_item("channel", channel)?;
            kwargs.set_item("mode", mode)?;
            kwargs.set_item("colors", colors.to_vec())?;
            if let Some(time_per_color) = time_per_color {
                kwargs.set_item("time_per_color", time_per_color)?;
            }
            if let Some(speed) = speed {
                kwargs.set_item("speed", speed)?;
            }
            if let Some(direction) = direction {
                kwargs.set_item("direction", direction)?;
            }
            self.handle
                .bind(py)
                .call_method("set_color", (), Some(&kwargs))
                .map(|_| ())
                .with_context(|| format!("set_color() for {}", self.description()))
        })
    }

    fn set_screen(&self, channel: &str, mode: &str, value: Option<String>) -> Result<()> {
        Python::with_gil(|py| {
            let kwargs = PyDict::new(py);
            kwargs.set_item("channel", channel)?;
            kwargs.set_item("mode", mode)?;
            if let Some(value) = value {
                kwargs.set_item("value", value)?;
            }
            self.handle
                .bind(py)
                .call_method("set_screen", (), Some(&kwargs))
                .map(|_| ())
                .with_context(|| format!("set_screen() for {}", self.description()))
        })
    }

    fn disconnect(&self) -> Result<()> {
        Python::with_gil(|py| {
            self.handle
                .bind(py)
                .call_method0("disconnect")
                .map(|_| ())
                .with_context(|| format!("disconnect() for {}", self.description()))
        })
    }
}
