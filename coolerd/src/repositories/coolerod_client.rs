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

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::Mutex;

const SOCKET_NAME: &str = "coolerod.sock";
const SYSTEM_RUN_PATH: &str = "/run/coolerd";
const CLIENT_VERSION: &str = "1";
const MAX_FRAME_SIZE: u64 = 10_240;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DaemonMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cmd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct DaemonResponse {
    response: String,
}

/// The client for the privileged coolerod daemon, which applies hwmon sysfs
/// writes on our behalf. The wire format is an 8-byte big-endian length
/// followed by UTF-8 JSON.
pub struct CoolerodClient {
    stream: Mutex<UnixStream>,
}

impl CoolerodClient {
    /// Connects to the running daemon and exchanges the version greeting.
    /// The session-scope socket is preferred when a user session runtime
    /// directory is available, matching where coolerod places it.
    pub async fn connect() -> Result<Self> {
        let socket_path = Self::socket_path();
        let stream = UnixStream::connect(&socket_path)
            .await
            .with_context(|| format!("Connecting to coolerod socket at {socket_path:?}"))?;
        let client = Self {
            stream: Mutex::new(stream),
        };
        client.greet_daemon().await?;
        Ok(client)
    }

    fn socket_path() -> PathBuf {
        match std::env::var("XDG_RUNTIME_DIR") {
            Ok(runtime_dir) => Path::new(&runtime_dir).join("coolerd").join(SOCKET_NAME),
            Err(_) => Path::new(SYSTEM_RUN_PATH).join(SOCKET_NAME),
        }
    }

    async fn greet_daemon(&self) -> Result<()> {
        let response = self
            .send_message(&DaemonMessage {
                version: Some(CLIENT_VERSION.to_string()),
                ..Default::default()
            })
            .await?;
        if response == "version supported" {
            info!("Client version supported by coolerod and greeting exchanged successfully");
            Ok(())
        } else {
            error!("Client version not supported by coolerod: {response}");
            Err(anyhow!("Client version not supported by coolerod"))
        }
    }

    /// Requests a validated write of the given value to the given hwmon path.
    pub async fn apply_setting(&self, path: &Path, value: &str) -> Result<()> {
        let response = self
            .send_message(&DaemonMessage {
                path: Some(path.to_string_lossy().to_string()),
                value: Some(value.to_string()),
                ..Default::default()
            })
            .await?;
        match response.as_str() {
            "setting success" => Ok(()),
            "invalid path" => Err(anyhow!("coolerod rejected the hwmon path: {path:?}")),
            _ => Err(anyhow!("coolerod could not apply the setting: {response}")),
        }
    }

    /// This will close the connection to the daemon
    pub async fn close_connection(&self) {
        match self
            .send_message(&DaemonMessage {
                cmd: Some("close connection".to_string()),
                ..Default::default()
            })
            .await
        {
            Ok(response) if response == "bye" => info!("coolerod connection closed"),
            Ok(response) => warn!("Unexpected response closing coolerod connection: {response}"),
            Err(err) => warn!("Error trying to close the coolerod connection: {err}"),
        }
    }

    async fn send_message(&self, message: &DaemonMessage) -> Result<String> {
        let body = serde_json::to_vec(message)?;
        let mut stream = self.stream.lock().await;
        stream.write_u64(body.len() as u64).await?;
        stream.write_all(&body).await?;
        stream.flush().await?;
        let frame_size = stream.read_u64().await?;
        if frame_size == 0 || frame_size > MAX_FRAME_SIZE {
            return Err(anyhow!("Invalid frame size from coolerod: {frame_size}"));
        }
        let mut buffer = vec![0u8; frame_size as usize];
        stream.read_exact(&mut buffer).await?;
        let response: DaemonResponse = serde_json::from_slice(&buffer)?;
        Ok(response.response)
    }
}
