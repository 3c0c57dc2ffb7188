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

//! The local IPC plane for the GUI client: HTTP/1.1 over a Unix socket,
//! protected by filesystem permissions only.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use log::{debug, error, info};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::UnixListener;

use crate::config::Config;
use crate::device::{Device, DeviceInfo, DeviceType, LcInfo, Status, UID};
use crate::device_commander::DeviceCommander;
use crate::modes::ModeController;
use crate::repositories::liquidctl::liquidctl_repo::LiquidctlRepo;
use crate::setting::{CoolerdSettings, Setting};
use crate::AllDevices;

const SOCKET_NAME: &str = "coolerd.sock";
const SYSTEM_RUN_PATH: &str = "/run/coolerd";
const PATTERN_DEVICE_PATH: &str = r"^/devices/(?P<uid>[a-z0-9]+)(?P<op>/[a-z0-9/]+)$";
const PATTERN_MODE_PATH: &str = r"^/modes/(?P<name>[^/]+)(?P<op>/apply)?$";

lazy_static! {
    static ref REGEX_DEVICE_PATH: Regex = Regex::new(PATTERN_DEVICE_PATH).unwrap();
    static ref REGEX_MODE_PATH: Regex = Regex::new(PATTERN_MODE_PATH).unwrap();
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeviceDto {
    pub name: String,
    #[serde(rename = "type")]
    pub d_type: DeviceType,
    pub type_index: u8,
    pub uid: UID,
    pub colors: HashMap<String, String>,
    pub lc_info: Option<LcInfo>,
    pub info: DeviceInfo,
}

impl DeviceDto {
    fn from(device: &Device) -> Self {
        Self {
            name: device.name.clone(),
            d_type: device.d_type,
            type_index: device.type_index,
            uid: device.uid.clone(),
            colors: device.colors.clone(),
            lc_info: device.lc_info.clone(),
            info: device.info.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct StatusRequest {
    all: Option<bool>,
    since: Option<DateTime<Local>>,
}

#[derive(Debug, Clone, Serialize)]
struct DeviceStatusDto {
    #[serde(rename = "type")]
    d_type: DeviceType,
    type_index: u8,
    uid: UID,
    status_history: Vec<Status>,
}

#[derive(Debug, Clone, Deserialize)]
struct ModeCreateRequest {
    name: String,
}

pub struct GuiServer {
    all_devices: AllDevices,
    device_commander: Arc<DeviceCommander>,
    mode_controller: Arc<ModeController>,
    liquidctl_repo: Option<Arc<LiquidctlRepo>>,
    config: Arc<Config>,
}

impl GuiServer {
    pub fn new(
        all_devices: AllDevices,
        device_commander: Arc<DeviceCommander>,
        mode_controller: Arc<ModeController>,
        liquidctl_repo: Option<Arc<LiquidctlRepo>>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            all_devices,
            device_commander,
            mode_controller,
            liquidctl_repo,
            config,
        }
    }

    /// Binds the IPC socket and serves connections until the process ends.
    /// Failing to bind is a fatal startup error handled by the caller.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let socket_path = Self::socket_path();
        if let Some(socket_dir) = socket_path.parent() {
            tokio::fs::create_dir_all(socket_dir).await?;
        }
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)
                .with_context(|| format!("Removing stale socket file {socket_path:?}"))?;
        }
        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("Binding IPC socket {socket_path:?}"))?;
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;
        info!("IPC server listening on {socket_path:?}");
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let server = Arc::clone(&self);
                    tokio::task::spawn(async move {
                        let io_stream = TokioIo::new(stream);
                        let service = service_fn(move |request| {
                            let server = Arc::clone(&server);
                            async move { server.handle_request(request).await }
                        });
                        if let Err(err) = hyper::server::conn::http1::Builder::new()
                            .serve_connection(io_stream, service)
                            .await
                        {
                            debug!("IPC connection ended: {err}");
                        }
                    });
                }
                Err(err) => error!("Error accepting IPC connection: {err}"),
            }
        }
    }

    fn socket_path() -> PathBuf {
        match std::env::var("XDG_RUNTIME_DIR") {
            Ok(runtime_dir) => Path::new(&runtime_dir).join("coolerd").join(SOCKET_NAME),
            Err(_) => Path::new(SYSTEM_RUN_PATH).join(SOCKET_NAME),
        }
    }

    async fn handle_request(
        &self,
        request: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let method = request.method().clone();
        let path = request.uri().path().to_string();
        debug!("IPC Request: {method} {path}");
        let response = match (&method, path.as_str()) {
            (&Method::GET, "/handshake") => json_response(&json!({"shake": true})),
            (&Method::POST, "/shutdown") => {
                info!("Shutdown requested over IPC");
                if let Err(err) = signal::kill(Pid::this(), Signal::SIGQUIT) {
                    error!("Could not signal shutdown: {err}");
                }
                json_response(&json!({"shutdown": true}))
            }
            (&Method::GET, "/devices") => self.get_devices().await,
            (&Method::POST, "/status") => {
                let status_request: StatusRequest =
                    read_body_or_default(request).await.unwrap_or_default();
                self.get_statuses(&status_request).await
            }
            (&Method::GET, "/settings") => json_response(&self.config.get_settings().await),
            (&Method::POST, "/settings") => match read_body::<CoolerdSettings>(request).await {
                Ok(settings) => {
                    self.config.set_settings(&settings).await;
                    match self.config.save_config_file().await {
                        Ok(()) => json_response(&json!({"saved": true})),
                        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
                    }
                }
                Err(err) => error_response(StatusCode::BAD_REQUEST, &err),
            },
            (&Method::GET, "/modes") => json_response(&self.mode_controller.get_modes().await),
            (&Method::POST, "/modes") => match read_body::<ModeCreateRequest>(request).await {
                Ok(mode_request) => {
                    match self
                        .mode_controller
                        .save_mode_from_current_settings(&mode_request.name)
                        .await
                    {
                        Ok(mode) => json_response(&mode),
                        Err(err) => {
                            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
                        }
                    }
                }
                Err(err) => error_response(StatusCode::BAD_REQUEST, &err),
            },
            _ => self.handle_pattern_routes(&method, &path, request).await,
        };
        Ok(response)
    }

    async fn handle_pattern_routes(
        &self,
        method: &Method,
        path: &str,
        request: Request<Incoming>,
    ) -> Response<Full<Bytes>> {
        if let Some(captures) = REGEX_DEVICE_PATH.captures(path) {
            let device_uid = captures["uid"].to_string();
            let operation = captures["op"].to_string();
            return self
                .handle_device_routes(method, &device_uid, &operation, request)
                .await;
        }
        if let Some(captures) = REGEX_MODE_PATH.captures(path) {
            let mode_name = captures["name"].to_string();
            let apply = captures.name("op").is_some();
            return match (method, apply) {
                (&Method::POST, true) => match self.mode_controller.apply_mode(&mode_name).await {
                    Ok(()) => json_response(&json!({"applied": mode_name})),
                    Err(err) => error_response(StatusCode::NOT_FOUND, &err.to_string()),
                },
                (&Method::DELETE, false) => {
                    match self.mode_controller.delete_mode(&mode_name).await {
                        Ok(()) => json_response(&json!({"deleted": mode_name})),
                        Err(err) => error_response(StatusCode::NOT_FOUND, &err.to_string()),
                    }
                }
                _ => error_response(StatusCode::NOT_FOUND, "Unknown route"),
            };
        }
        error_response(StatusCode::NOT_FOUND, "Unknown route")
    }

    async fn handle_device_routes(
        &self,
        method: &Method,
        device_uid: &UID,
        operation: &str,
        request: Request<Incoming>,
    ) -> Response<Full<Bytes>> {
        match (method, operation) {
            (&Method::POST, "/settings") => match read_body::<Setting>(request).await {
                Ok(setting) => {
                    let result = self.device_commander.set_setting(device_uid, &setting).await;
                    json_response(&json!({"response": result}))
                }
                Err(err) => error_response(StatusCode::BAD_REQUEST, &err),
            },
            (&Method::POST, "/legacy690") => match &self.liquidctl_repo {
                Some(liquidctl_repo) => {
                    match liquidctl_repo.set_device_as_legacy690(device_uid).await {
                        Ok(()) => json_response(&json!({"response": "success"})),
                        Err(err) => {
                            error_response(StatusCode::EXPECTATION_FAILED, &err.to_string())
                        }
                    }
                }
                None => error_response(StatusCode::NOT_FOUND, "No cooling-lib devices present"),
            },
            (&Method::POST, "/modern690") => match &self.liquidctl_repo {
                Some(liquidctl_repo) => {
                    match liquidctl_repo.confirm_device_as_modern690(device_uid).await {
                        Ok(()) => json_response(&json!({"response": "success"})),
                        Err(err) => {
                            error_response(StatusCode::EXPECTATION_FAILED, &err.to_string())
                        }
                    }
                }
                None => error_response(StatusCode::NOT_FOUND, "No cooling-lib devices present"),
            },
            _ => error_response(StatusCode::NOT_FOUND, "Unknown route"),
        }
    }

    /// Returns a list of all detected devices and their associated
    /// information. Statuses are served by the more fine-grained /status.
    async fn get_devices(&self) -> Response<Full<Bytes>> {
        let mut all_devices_list = vec![];
        for device_lock in self.all_devices.values() {
            all_devices_list.push(DeviceDto::from(&*device_lock.read().await));
        }
        all_devices_list.sort_by_key(|device| device.uid.clone());
        json_response(&json!({"devices": all_devices_list}))
    }

    /// Returns status updates, by default only the most recent one per
    /// device. `all` returns the full in-memory history, `since` everything
    /// after the given timestamp.
    async fn get_statuses(&self, status_request: &StatusRequest) -> Response<Full<Bytes>> {
        let mut devices = vec![];
        for device_lock in self.all_devices.values() {
            let device = device_lock.read().await;
            let status_history: Vec<Status> = if status_request.all.unwrap_or_default() {
                device.status_history.iter().cloned().collect()
            } else if let Some(since) = status_request.since {
                device
                    .status_history
                    .iter()
                    .filter(|status| status.timestamp > since)
                    .cloned()
                    .collect()
            } else {
                device.status_current().into_iter().collect()
            };
            devices.push(DeviceStatusDto {
                d_type: device.d_type,
                type_index: device.type_index,
                uid: device.uid.clone(),
                status_history,
            });
        }
        json_response(&json!({"devices": devices}))
    }
}

async fn read_body<T: for<'de> Deserialize<'de>>(
    request: Request<Incoming>,
) -> Result<T, String> {
    let body_bytes = request
        .into_body()
        .collect()
        .await
        .map_err(|err| err.to_string())?
        .to_bytes();
    serde_json::from_slice(&body_bytes).map_err(|err| err.to_string())
}

async fn read_body_or_default<T: for<'de> Deserialize<'de> + Default>(
    request: Request<Incoming>,
) -> Result<T, String> {
    let body_bytes = request
        .into_body()
        .collect()
        .await
        .map_err(|err| err.to_string())?
        .to_bytes();
    if body_bytes.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(&body_bytes).map_err(|err| err.to_string())
}

fn json_response<T: Serialize>(body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(serialized) => Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(serialized)))
            .expect("Response should be buildable"),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(&json!({"error": message})).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("Response should be buildable")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_route_pattern_matches() {
        let captures = REGEX_DEVICE_PATH.captures("/devices/hwmon1/settings").unwrap();
        assert_eq!(&captures["uid"], "hwmon1");
        assert_eq!(&captures["op"], "/settings");

        let captures = REGEX_DEVICE_PATH
            .captures("/devices/liquidctl2/legacy690")
            .unwrap();
        assert_eq!(&captures["uid"], "liquidctl2");
        assert_eq!(&captures["op"], "/legacy690");
    }

    #[test]
    fn mode_route_pattern_matches() {
        let captures = REGEX_MODE_PATH.captures("/modes/quiet/apply").unwrap();
        assert_eq!(&captures["name"], "quiet");
        assert!(captures.name("op").is_some());

        let captures = REGEX_MODE_PATH.captures("/modes/quiet").unwrap();
        assert!(captures.name("op").is_none());
    }
}
