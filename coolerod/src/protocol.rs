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

use std::path::Path;

use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use log::{error, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

// some basic path validation, anchored and length-bounded:
const PATTERN_HWMON_PATH: &str = r"^.{1,100}?/hwmon/hwmon\d{1,3}.{1,100}$";
const SUPPORTED_CLIENT_VERSIONS: [&str; 1] = ["1"];
// no legitimate message comes close to this size:
const MAX_FRAME_SIZE: u64 = 10_240;

lazy_static! {
    static ref REGEX_HWMON_PATH: Regex = Regex::new(PATTERN_HWMON_PATH).unwrap();
}

/// A single client request. All fields are optional, matching the loose
/// key-value wire format; the first recognized field wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub response: String,
}

/// What the connection loop should do after a message has been handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    CloseConnection,
    Shutdown,
}

/// Reads a single length-prefixed frame: 8-byte big-endian length, then UTF-8 JSON.
pub async fn read_message(stream: &mut UnixStream) -> Result<Message> {
    let frame_size = stream.read_u64().await?;
    if frame_size == 0 || frame_size > MAX_FRAME_SIZE {
        return Err(anyhow!("Invalid frame size: {frame_size}"));
    }
    let mut buffer = vec![0u8; frame_size as usize];
    stream.read_exact(&mut buffer).await?;
    Ok(serde_json::from_slice(&buffer)?)
}

pub async fn send_response(stream: &mut UnixStream, response: &str) -> Result<()> {
    let body = serde_json::to_vec(&Response {
        response: response.to_string(),
    })?;
    stream.write_u64(body.len() as u64).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

/// Handles a single decoded message and responds to the client.
pub async fn handle_message(stream: &mut UnixStream, msg: Message) -> Result<Disposition> {
    if let Some(version) = msg.version {
        if SUPPORTED_CLIENT_VERSIONS.contains(&version.as_str()) {
            send_response(stream, "version supported").await?;
            info!("Client version supported and greeting exchanged");
        } else {
            send_response(stream, "version NOT supported").await?;
            info!("Client version not supported: {version}");
        }
        Ok(Disposition::Continue)
    } else if let Some(cmd) = msg.cmd {
        match cmd.as_str() {
            "close connection" => {
                send_response(stream, "bye").await?;
                info!("Client closing connection");
                Ok(Disposition::CloseConnection)
            }
            "shutdown" => {
                send_response(stream, "bye").await?;
                info!("Client initiated daemon shutdown");
                Ok(Disposition::Shutdown)
            }
            _ => {
                send_response(stream, "unknown command").await?;
                warn!("Unknown command received: {cmd}");
                Ok(Disposition::Continue)
            }
        }
    } else if let (Some(path), Some(value)) = (msg.path, msg.value) {
        let response = apply_hwmon_setting(&path, &value);
        send_response(stream, response).await?;
        Ok(Disposition::Continue)
    } else {
        // A message without any recognized field is a protocol violation,
        // close the connection rather than leave the client hanging.
        error!("Invalid message sent, closing connection");
        Err(anyhow!("Invalid message"))
    }
}

/// Validates the requested path and applies the value with a single
/// synchronous write. Invalid paths are rejected without touching the
/// filesystem.
pub fn apply_hwmon_setting(path: &str, value: &str) -> &'static str {
    if !REGEX_HWMON_PATH.is_match(path) {
        error!("Invalid path: {path}");
        return "invalid path";
    }
    match std::fs::write(Path::new(path), value) {
        Ok(()) => {
            info!("Successfully applied hwmon setting: {path} = {value}");
            "setting success"
        }
        Err(err) => {
            error!("Error when trying to set hwmon value {path} = {value}: {err}");
            "setting failure"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::path::PathBuf;
    use uuid::Uuid;

    const TEST_BASE_PATH_STR: &str = "/tmp/coolerod-tests-";

    fn setup_hwmon_dir() -> PathBuf {
        let test_base_path = PathBuf::from(format!(
            "{TEST_BASE_PATH_STR}{}/hwmon/hwmon1",
            Uuid::new_v4()
        ));
        std::fs::create_dir_all(&test_base_path).unwrap();
        test_base_path
    }

    #[test]
    fn path_guard_accepts_hwmon_paths() {
        assert!(REGEX_HWMON_PATH.is_match("/sys/class/hwmon/hwmon0/pwm1"));
        assert!(REGEX_HWMON_PATH.is_match("/sys/class/hwmon/hwmon12/device/pwm2_enable"));
        assert!(REGEX_HWMON_PATH.is_match("/sys/class/hwmon/hwmon999/pwm3_mode"));
    }

    #[test]
    fn path_guard_rejects_other_paths() {
        assert!(!REGEX_HWMON_PATH.is_match("/etc/passwd"));
        assert!(!REGEX_HWMON_PATH.is_match("/sys/class/hwmon/hwmon1"));
        assert!(!REGEX_HWMON_PATH.is_match("/hwmon/hwmon1/pwm1")); // nothing before /hwmon
        assert!(!REGEX_HWMON_PATH.is_match("/sys/class/hwmon/hwmon1234/pwm1")); // number too long
        let too_long = format!("/sys{}/hwmon/hwmon1/pwm1", "a".repeat(101));
        assert!(!REGEX_HWMON_PATH.is_match(&too_long));
    }

    #[test]
    #[serial]
    fn apply_setting_writes_valid_path() {
        // given:
        let test_base_path = setup_hwmon_dir();
        let pwm_path = test_base_path.join("pwm1");
        std::fs::write(&pwm_path, "0").unwrap();

        // when:
        let response = apply_hwmon_setting(pwm_path.to_str().unwrap(), "127");

        // then:
        let written = std::fs::read_to_string(&pwm_path).unwrap();
        std::fs::remove_dir_all(test_base_path.ancestors().nth(2).unwrap()).unwrap();
        assert_eq!(response, "setting success");
        assert_eq!(written, "127");
    }

    #[test]
    #[serial]
    fn apply_setting_rejects_invalid_path_without_write() {
        // given:
        let test_base_path = setup_hwmon_dir();
        let outside_path = test_base_path
            .ancestors()
            .nth(2)
            .unwrap()
            .join("not_hwmon_file");

        // when:
        let response = apply_hwmon_setting(outside_path.to_str().unwrap(), "127");

        // then:
        let exists = outside_path.exists();
        std::fs::remove_dir_all(test_base_path.ancestors().nth(2).unwrap()).unwrap();
        assert_eq!(response, "invalid path");
        assert!(!exists);
    }

    #[test]
    #[serial]
    fn apply_setting_reports_write_failure() {
        // given: a valid-looking path that does not exist
        let response = apply_hwmon_setting("/tmp/does-not-exist/hwmon/hwmon1/pwm1", "127");

        // then:
        assert_eq!(response, "setting failure");
    }

    #[test]
    fn frame_codec_roundtrip() {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(async {
                // given:
                let (mut client, mut server) = UnixStream::pair().unwrap();
                let msg = Message {
                    version: Some("1".to_string()),
                    ..Default::default()
                };
                let body = serde_json::to_vec(&msg).unwrap();

                // when:
                client.write_u64(body.len() as u64).await.unwrap();
                client.write_all(&body).await.unwrap();
                let received = read_message(&mut server).await.unwrap();

                // then:
                assert_eq!(received.version.as_deref(), Some("1"));
                assert!(received.cmd.is_none());
            });
    }

    #[test]
    fn oversized_frame_is_rejected() {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(async {
                // given:
                let (mut client, mut server) = UnixStream::pair().unwrap();

                // when:
                client.write_u64(MAX_FRAME_SIZE + 1).await.unwrap();
                let result = read_message(&mut server).await;

                // then:
                assert!(result.is_err());
            });
    }
}
