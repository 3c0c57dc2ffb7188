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

use anyhow::{anyhow, bail, Result};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use log::{debug, error, trace, warn};
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::UnixStream;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::sleep;

const BACKEND_MAX_POOL_SIZE: usize = 10;
const BACKEND_MAX_POOL_RETRIES: usize = 7;
const BACKEND_SOCKET: &str = "/run/coolerd-backend.sock";
const BACKEND_HOST: &str = "127.0.0.1";
const BACKEND_CONNECT_RETRIES: usize = 5;
const BACKEND_HANDSHAKE: &str = "/handshake";
const BACKEND_DEVICES: &str = "/devices";
const BACKEND_LEGACY690: &str = "/devices/{}/legacy690";
const BACKEND_INITIALIZE: &str = "/devices/{}/initialize";
const BACKEND_STATUS: &str = "/devices/{}/status";
const BACKEND_FIXED_SPEED: &str = "/devices/{}/speed/fixed";
const BACKEND_SPEED_PROFILE: &str = "/devices/{}/speed/profile";
const BACKEND_COLOR: &str = "/devices/{}/color";
const BACKEND_SCREEN: &str = "/devices/{}/screen";
const BACKEND_QUIT: &str = "/quit";

pub type LCStatus = Vec<(String, String, String)>;
type SocketConnectionLock = Arc<RwLock<SocketConnection>>;
type ConnectionIndex = usize;

/// A client for the cooling-lib backend service, holding a small pool of
/// socket connections so device requests don't serialize behind each other.
pub struct BackendClient {
    connection_pool: RwLock<Vec<SocketConnectionLock>>,
}

impl BackendClient {
    /// Establishes the first socket connection to the backend service,
    /// retrying while the service comes up.
    pub async fn new() -> Result<Self> {
        let connection = Self::create_connection().await?;
        let mut connection_pool = Vec::with_capacity(BACKEND_MAX_POOL_SIZE);
        connection_pool.push(Arc::new(RwLock::new(connection)));
        Ok(Self {
            connection_pool: RwLock::new(connection_pool),
        })
    }

    async fn create_connection() -> Result<SocketConnection> {
        let mut retry_count = 0;
        while retry_count < BACKEND_CONNECT_RETRIES {
            let unix_stream = match UnixStream::connect(BACKEND_SOCKET).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(
                        "Could not establish socket connection to the backend service, \
                        retry #{} - {err}",
                        retry_count + 1
                    );
                    Self::handle_retry(&mut retry_count).await;
                    continue;
                }
            };
            let io_stream = TokioIo::new(unix_stream);
            let (sender, connection) = match hyper::client::conn::http1::handshake(io_stream).await
            {
                Ok((sender, connection)) => (sender, connection),
                Err(err) => {
                    error!(
                        "Could not handshake with the backend socket connection, \
                        retry #{} - {err}",
                        retry_count + 1
                    );
                    Self::handle_retry(&mut retry_count).await;
                    continue;
                }
            };
            // keeps the connection open and drives http requests
            let connection_handle = tokio::task::spawn(async move {
                if let Err(err) = connection.await {
                    error!("Unexpected Error: Connection to socket failed: {err:?}");
                }
            });
            return Ok(SocketConnection {
                sender,
                connection_handle,
            });
        }
        bail!("Failed to connect to the backend service after {retry_count} tries");
    }

    async fn handle_retry(retry_count: &mut usize) {
        sleep(Duration::from_secs(1)).await;
        *retry_count += 1;
    }

    /// Retrieves a free socket connection from the pool, creating a new
    /// connection when all are busy and the pool has room.
    async fn get_socket_connection(&self) -> Result<(ConnectionIndex, SocketConnectionLock)> {
        let mut retries = 0;
        while retries < BACKEND_MAX_POOL_RETRIES {
            for (i, s_lock) in self.connection_pool.read().await.iter().enumerate() {
                if s_lock.try_write().is_err() {
                    trace!("The #{i} socket connection is busy, trying another.");
                    continue;
                }
                trace!("Found #{i} free socket connection.");
                return Ok((i, s_lock.clone()));
            }
            let mut pool_size = self.connection_pool.read().await.len();
            if pool_size < BACKEND_MAX_POOL_SIZE {
                let connection = Self::create_connection().await?;
                let connection_lock = Arc::new(RwLock::new(connection));
                self.connection_pool
                    .write()
                    .await
                    .push(connection_lock.clone());
                pool_size += 1;
                trace!("Created a new socket connection, pool now at {pool_size}.");
                return Ok((pool_size - 1, connection_lock));
            }
            warn!("Socket connection pool full & busy, waiting for a connection to become available.");
            sleep(Duration::from_millis(100)).await;
            retries += 1;
        }
        bail!("Failed to get a free backend connection after {} tries", retries + 1);
    }

    /// Sends a request over a pooled connection, pruning connections the
    /// backend has closed, and returns the deserialized response.
    async fn make_request<T>(&self, request: Request<String>) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        loop {
            // If we run out of connections or timeout, this will return Err:
            let (c_index, c_lock) = self.get_socket_connection().await?;
            let mut c_write_lock = c_lock.write().await;
            let response = match c_write_lock.sender.send_request(request.clone()).await {
                Ok(res) => res,
                Err(_) => {
                    debug!("Socket Connection no longer valid. Closing.");
                    c_write_lock.connection_handle.abort();
                    self.connection_pool.write().await.remove(c_index);
                    continue;
                }
            };
            let response_body = Self::collect_response_body(response).await?;
            return Ok(serde_json::from_str(&response_body)?);
        }
    }

    async fn collect_response_body(response: Response<Incoming>) -> Result<String> {
        let (head, body_incoming) = response.into_parts();
        let body = String::from_utf8(body_incoming.collect().await?.to_bytes().into())?;
        trace!("Response Head: {head:?}");
        trace!("Response Body: {body:#?}");
        if !head.status.is_success() {
            return Err(anyhow!(
                "Backend request failed with status:{} - Body: {body}",
                head.status,
            ));
        }
        Ok(body)
    }

    fn get_request(uri: String) -> Result<Request<String>> {
        Ok(Request::builder()
            .header("Host", BACKEND_HOST)
            .uri(uri)
            .method("GET")
            .body(String::new())?)
    }

    // public

    /// Sends a handshake request to the backend service to verify requests
    /// are functioning within normal parameters.
    pub async fn handshake(&self) -> Result<()> {
        let request = Self::get_request(BACKEND_HANDSHAKE.to_string())?;
        self.make_request::<IgnoredAny>(request).await?;
        Ok(())
    }

    /// Gets a list of all devices connected to the system. The first call
    /// triggers discovery in the backend.
    pub async fn get_all_devices(&self) -> Result<DevicesResponse> {
        let request = Self::get_request(BACKEND_DEVICES.to_string())?;
        self.make_request(request).await
    }

    pub async fn get_status(&self, device_index: u8) -> Result<StatusResponse> {
        let request =
            Self::get_request(BACKEND_STATUS.replace("{}", &device_index.to_string()))?;
        self.make_request(request).await
    }

    pub async fn initialize_device(
        &self,
        device_index: u8,
        pump_mode: Option<String>,
    ) -> Result<StatusResponse> {
        let request_body = serde_json::to_string(&InitializeRequest { pump_mode })?;
        let request = Request::builder()
            .header("Host", BACKEND_HOST)
            .uri(BACKEND_INITIALIZE.replace("{}", &device_index.to_string()))
            .method("POST")
            .body(request_body)?;
        self.make_request(request).await
    }

    /// Sets a particular device to legacy 690 mode. (Old Krakens/EVGA CLC)
    pub async fn put_legacy690(&self, device_index: u8) -> Result<DeviceResponse> {
        let request = Request::builder()
            .header("Host", BACKEND_HOST)
            .uri(BACKEND_LEGACY690.replace("{}", &device_index.to_string()))
            .method("PUT")
            .body(String::new())?;
        self.make_request(request).await
    }

    pub async fn put_fixed_speed(
        &self,
        device_index: u8,
        channel_name: &str,
        fixed_speed: u8,
    ) -> Result<()> {
        let request_body = serde_json::to_string(&FixedSpeedRequest {
            channel: channel_name.to_string(),
            duty: fixed_speed,
        })?;
        let request = Request::builder()
            .header("Host", BACKEND_HOST)
            .uri(BACKEND_FIXED_SPEED.replace("{}", &device_index.to_string()))
            .method("PUT")
            .body(request_body)?;
        self.make_request::<IgnoredAny>(request).await?;
        Ok(())
    }

    pub async fn put_speed_profile(
        &self,
        device_index: u8,
        channel_name: &str,
        profile: &[(f64, u8)],
        temperature_sensor: Option<u8>,
    ) -> Result<()> {
        let request_body = serde_json::to_string(&SpeedProfileRequest {
            channel: channel_name.to_string(),
            profile: profile.to_vec(),
            temperature_sensor,
        })?;
        let request = Request::builder()
            .header("Host", BACKEND_HOST)
            .uri(BACKEND_SPEED_PROFILE.replace("{}", &device_index.to_string()))
            .method("PUT")
            .body(request_body)?;
        self.make_request::<IgnoredAny>(request).await?;
        Ok(())
    }

    pub async fn put_color(
        &self,
        device_index: u8,
        channel_name: &str,
        mode: &str,
        colors: Vec<(u8, u8, u8)>,
        time_per_color: Option<u8>,
        speed: Option<String>,
        direction: Option<String>,
    ) -> Result<()> {
        let request_body = serde_json::to_string(&ColorRequest {
            channel: channel_name.to_string(),
            mode: mode.to_string(),
            colors,
            time_per_color,
            speed,
            direction,
        })?;
        let request = Request::builder()
            .header("Host", BACKEND_HOST)
            .uri(BACKEND_COLOR.replace("{}", &device_index.to_string()))
            .method("PUT")
            .body(request_body)?;
        self.make_request::<IgnoredAny>(request).await?;
        Ok(())
    }

    /// Sets a particular device channel to the given screen settings.
    /// Current modes are "liquid", "static", "gif", "orientation" and "brightness".
    pub async fn put_screen(
        &self,
        device_index: u8,
        channel_name: &str,
        mode: &str,
        value: Option<String>,
    ) -> Result<()> {
        let request_body = serde_json::to_string(&ScreenRequest {
            channel: channel_name.to_string(),
            mode: mode.to_string(),
            value,
        })?;
        let request = Request::builder()
            .header("Host", BACKEND_HOST)
            .uri(BACKEND_SCREEN.replace("{}", &device_index.to_string()))
            .method("PUT")
            .body(request_body)?;
        self.make_request::<IgnoredAny>(request).await?;
        Ok(())
    }

    /// This shuts the backend service down.
    pub async fn post_quit(&self) -> Result<()> {
        let request = Request::builder()
            .header("Host", BACKEND_HOST)
            .uri(BACKEND_QUIT)
            .method("POST")
            .body(String::new())?;
        self.make_request::<IgnoredAny>(request).await?;
        Ok(())
    }

    /// Shuts down all connections in the pool and clears it.
    pub async fn shutdown(&self) {
        let mut pool = self.connection_pool.write().await;
        for connection in pool.iter() {
            let connection = connection.write().await;
            connection.connection_handle.abort();
        }
        pool.clear();
    }
}

struct SocketConnection {
    sender: SendRequest<String>,
    connection_handle: JoinHandle<()>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicesResponse {
    pub devices: Vec<DeviceResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceResponse {
    pub id: u8,
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
    pub status: LCStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeRequest {
    pump_mode: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FixedSpeedRequest {
    channel: String,
    duty: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SpeedProfileRequest {
    channel: String,
    // some liquidctl device drivers cast temps to int, the wire keeps floats
    profile: Vec<(f64, u8)>,
    temperature_sensor: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ColorRequest {
    channel: String,
    mode: String,
    colors: Vec<(u8, u8, u8)>,
    time_per_color: Option<u8>,
    speed: Option<String>,
    direction: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScreenRequest {
    channel: String,
    mode: String,
    value: Option<String>,
}
