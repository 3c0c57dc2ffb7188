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

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A stringified status triple: (name, value, unit)
pub type Statuses = Vec<(String, String, String)>;

pub type DeviceId = u8;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Device with id:{0} not found")]
    DeviceNotFound(DeviceId),

    #[error("Unknown route: {0}")]
    RouteNotFound(String),

    #[error("Malformed request: {0}")]
    BadRequest(String),

    /// An operation that is not applicable to the device's current state.
    #[error("{0}")]
    InvalidState(String),

    /// The underlying device library reported a communication failure.
    #[error("Unexpected device communication error: {0}")]
    Liquidctl(String),

    #[error("{0}")]
    Internal(String),
}

impl BackendError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::DeviceNotFound(_) | Self::RouteNotFound(_) => 404,
            Self::BadRequest(_) => 400,
            Self::InvalidState(_) => 417,
            Self::Liquidctl(_) => 502,
            Self::Internal(_) => 500,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::DeviceNotFound(_) => "device_not_found",
            Self::RouteNotFound(_) => "route_not_found",
            Self::BadRequest(_) => "bad_request",
            Self::InvalidState(_) => "invalid_state",
            Self::Liquidctl(_) => "device_communication_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub shake: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicesResponse {
    pub devices: Vec<DeviceResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceResponse {
    pub id: DeviceId,
    pub description: String,
    pub device_type: String,
    pub serial_number: Option<String>,
    pub properties: DeviceProperties,
    pub liquidctl_version: String,
    pub hid_address: Option<String>,
    pub hwmon_address: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceProperties {
    pub speed_channels: Vec<String>,
    pub color_channels: Vec<String>,
    pub supports_cooling: Option<bool>,
    pub supports_cooling_profiles: Option<bool>,
    pub supports_lighting: Option<bool>,
    pub led_count: Option<u8>,
    pub lcd_resolution: Option<(u32, u32)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: Statuses,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitializeRequest {
    pub pump_mode: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixedSpeedRequest {
    pub channel: String,
    pub duty: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeedProfileRequest {
    pub channel: String,
    // some liquidctl device drivers cast temps to int, the wire keeps floats
    pub profile: Vec<(f64, u8)>,
    pub temperature_sensor: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColorRequest {
    pub channel: String,
    pub mode: String,
    pub colors: Vec<(u8, u8, u8)>,
    pub time_per_color: Option<u8>,
    pub speed: Option<String>,
    pub direction: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenRequest {
    pub channel: String,
    pub mode: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuitResponse {
    pub quit: bool,
}
