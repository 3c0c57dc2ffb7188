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

use std::sync::Arc;

use anyhow::Result;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use log::{debug, error, info};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tokio::net::UnixListener;
use tokio::sync::Notify;

use crate::device_service::DeviceService;
use crate::models::{
    BackendError, ColorRequest, DeviceId, DevicesResponse, ErrorResponse, FixedSpeedRequest,
    HandshakeResponse, InitializeRequest, QuitResponse, ScreenRequest, SpeedProfileRequest,
    StatusResponse,
};

const PATTERN_DEVICE_PATH: &str = r"^/devices/(?P<id>\d+)(?P<op>/[a-z/0-9]+)$";

lazy_static! {
    static ref REGEX_DEVICE_PATH: Regex = Regex::new(PATTERN_DEVICE_PATH).unwrap();
}

pub struct Server {
    device_service: Arc<DeviceService>,
    quit_notify: Arc<Notify>,
}

impl Server {
    pub fn new(device_service: Arc<DeviceService>) -> Self {
        Self {
            device_service,
            quit_notify: Arc::new(Notify::new()),
        }
    }

    /// Serves connections on the given listener until `POST /quit` or the
    /// notify is triggered externally (termination signal).
    pub async fn serve(&self, listener: UnixListener, term_notify: Arc<Notify>) -> Result<()> {
        info!("Backend server listening");
        loop {
            tokio::select! {
                () = self.quit_notify.notified() => break,
                () = term_notify.notified() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => self.spawn_connection_handler(stream),
                        Err(err) => error!("Error accepting connection: {err}"),
                    }
                }
            }
        }
        info!("Backend server shutting down");
        Ok(())
    }

    fn spawn_connection_handler(&self, stream: tokio::net::UnixStream) {
        let device_service = Arc::clone(&self.device_service);
        let quit_notify = Arc::clone(&self.quit_notify);
        tokio::task::spawn(async move {
            let io_stream = TokioIo::new(stream);
            let service = service_fn(move |request| {
                let device_service = Arc::clone(&device_service);
                let quit_notify = Arc::clone(&quit_notify);
                async move { handle_request(request, &device_service, &quit_notify).await }
            });
            if let Err(err) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io_stream, service)
                .await
            {
                debug!("Connection ended: {err}");
            }
        });
    }
}

async fn handle_request(
    request: Request<Incoming>,
    device_service: &Arc<DeviceService>,
    quit_notify: &Arc<Notify>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    debug!("Request: {method} {path}");
    let response = match (&method, path.as_str()) {
        (&Method::GET, "/handshake") => json_response(&HandshakeResponse { shake: true }),
        (&Method::GET, "/devices") => match device_service.get_devices().await {
            Ok(devices) => json_response(&DevicesResponse { devices }),
            Err(err) => error_response(&err),
        },
        (&Method::POST, "/quit") => {
            info!("Quit requested");
            quit_notify.notify_one();
            json_response(&QuitResponse { quit: true })
        }
        _ => match REGEX_DEVICE_PATH.captures(&path) {
            Some(captures) => {
                let device_id: DeviceId = match captures["id"].parse() {
                    Ok(id) => id,
                    Err(_) => {
                        return Ok(error_response(&BackendError::BadRequest(
                            "Invalid device id".to_string(),
                        )))
                    }
                };
                let operation = captures["op"].to_string();
                handle_device_request(&method, device_id, &operation, request, device_service)
                    .await
            }
            None => not_found_response(&path),
        },
    };
    Ok(response)
}

async fn handle_device_request(
    method: &Method,
    device_id: DeviceId,
    operation: &str,
    request: Request<Incoming>,
    device_service: &Arc<DeviceService>,
) -> Response<Full<Bytes>> {
    match (method, operation) {
        (&Method::GET, "/status") => match device_service.get_status(device_id).await {
            Ok(status) => json_response(&StatusResponse { status }),
            Err(err) => error_response(&err),
        },
        (&Method::PUT, "/legacy690") => {
            match device_service.set_device_as_legacy690(device_id).await {
                Ok(device) => json_response(&device),
                Err(err) => error_response(&err),
            }
        }
        (&Method::POST, "/initialize") => {
            let init_request: InitializeRequest = match read_body_or_default(request).await {
                Ok(body) => body,
                Err(err) => return error_response(&err),
            };
            match device_service
                .initialize_device(device_id, init_request.pump_mode)
                .await
            {
                Ok(status) => json_response(&StatusResponse { status }),
                Err(err) => error_response(&err),
            }
        }
        (&Method::PUT, "/speed/fixed") => {
            let speed_request: FixedSpeedRequest = match read_body(request).await {
                Ok(body) => body,
                Err(err) => return error_response(&err),
            };
            match device_service
                .set_fixed_speed(device_id, speed_request.channel, speed_request.duty)
                .await
            {
                Ok(()) => json_response(&json!({"set": "speed_fixed"})),
                Err(err) => error_response(&err),
            }
        }
        (&Method::PUT, "/speed/profile") => {
            let profile_request: SpeedProfileRequest = match read_body(request).await {
                Ok(body) => body,
                Err(err) => return error_response(&err),
            };
            match device_service
                .set_speed_profile(
                    device_id,
                    profile_request.channel,
                    profile_request.profile,
                    profile_request.temperature_sensor,
                )
                .await
            {
                Ok(()) => json_response(&json!({"set": "speed_profile"})),
                Err(err) => error_response(&err),
            }
        }
        (&Method::PUT, "/color") => {
            let color_request: ColorRequest = match read_body(request).await {
                Ok(body) => body,
                Err(err) => return error_response(&err),
            };
            match device_service
                .set_color(
                    device_id,
                    color_request.channel,
                    color_request.mode,
                    color_request.colors,
                    color_request.time_per_color,
                    color_request.speed,
                    color_request.direction,
                )
                .await
            {
                Ok(()) => json_response(&json!({"set": "color"})),
                Err(err) => error_response(&err),
            }
        }
        (&Method::PUT, "/screen") => {
            let screen_request: ScreenRequest = match read_body(request).await {
                Ok(body) => body,
                Err(err) => return error_response(&err),
            };
            match device_service
                .set_screen(
                    device_id,
                    screen_request.channel,
                    screen_request.mode,
                    screen_request.value,
                )
                .await
            {
                Ok(()) => json_response(&json!({"set": "screen"})),
                Err(err) => error_response(&err),
            }
        }
        _ => not_found_response(operation),
    }
}

async fn read_body<T: DeserializeOwned>(request: Request<Incoming>) -> Result<T, BackendError> {
    let body_bytes = request
        .into_body()
        .collect()
        .await
        .map_err(|err| BackendError::BadRequest(err.to_string()))?
        .to_bytes();
    serde_json::from_slice(&body_bytes).map_err(|err| BackendError::BadRequest(err.to_string()))
}

/// Like `read_body`, but an empty body deserializes to the default.
async fn read_body_or_default<T: DeserializeOwned + Default>(
    request: Request<Incoming>,
) -> Result<T, BackendError> {
    let body_bytes = request
        .into_body()
        .collect()
        .await
        .map_err(|err| BackendError::BadRequest(err.to_string()))?
        .to_bytes();
    if body_bytes.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(&body_bytes).map_err(|err| BackendError::BadRequest(err.to_string()))
}

fn json_response<T: Serialize>(body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(serialized) => Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(serialized)))
            .expect("Response should be buildable"),
        Err(err) => error_response(&BackendError::Internal(err.to_string())),
    }
}

fn error_response(err: &BackendError) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(&ErrorResponse {
        code: err.code().to_string(),
        message: err.to_string(),
    })
    .unwrap_or_default();
    Response::builder()
        .status(StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("Response should be buildable")
}

fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    error_response(&BackendError::RouteNotFound(path.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_path_routing_captures_id_and_operation() {
        let captures = REGEX_DEVICE_PATH.captures("/devices/3/speed/fixed").unwrap();
        assert_eq!(&captures["id"], "3");
        assert_eq!(&captures["op"], "/speed/fixed");

        let captures = REGEX_DEVICE_PATH.captures("/devices/12/legacy690").unwrap();
        assert_eq!(&captures["id"], "12");
        assert_eq!(&captures["op"], "/legacy690");

        assert!(REGEX_DEVICE_PATH.captures("/devices").is_none());
        assert!(REGEX_DEVICE_PATH.captures("/devices/abc/status").is_none());
    }
}
