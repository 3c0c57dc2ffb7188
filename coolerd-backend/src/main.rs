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

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, LevelFilter};
use tokio::net::UnixListener;
use tokio::sync::Notify;

use crate::device_service::{DeviceLibrary, DeviceService};
use crate::liqctl::{CoolingDevice, LiquidctlLib};
use crate::server::Server;

mod device_executor;
mod device_service;
mod liqctl;
mod models;
mod server;

const SOCKET_PATH: &str = "/run/coolerd-backend.sock";
const LOG_ENV: &str = "COOLERD_LOG";

/// Backend service giving the coolerd daemon access to cooling devices
/// through the third-party cooling-device library
#[derive(Parser, Debug)]
#[clap(author, about, long_about = None)]
struct Args {
    /// Enable debug output
    #[clap(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args);
    info!("Initializing...");
    // library verification integrates the Python logger, keep it off the runtime:
    let library = tokio::task::spawn_blocking(LiquidctlLib::init)
        .await
        .context("Joining library verification")??;
    let device_service = Arc::new(DeviceService::new(Arc::new(library)));
    let listener = bind_socket()?;
    let term_notify = setup_term_signal()?;

    let server = Server::new(Arc::clone(&device_service));
    server.serve(listener, term_notify).await?;

    device_service.shutdown().await;
    if let Err(err) = std::fs::remove_file(SOCKET_PATH) {
        log::warn!("Could not remove socket file: {err}");
    }
    info!("Shutdown complete");
    Ok(())
}

fn setup_logging(args: &Args) {
    let log_level = if args.debug {
        LevelFilter::Debug
    } else if let Ok(log_lvl) = std::env::var(LOG_ENV) {
        LevelFilter::from_str(&log_lvl).unwrap_or(LevelFilter::Info)
    } else {
        LevelFilter::Info
    };
    if systemd_journal_logger::connected_to_journal() {
        if let Ok(journal_log) = systemd_journal_logger::JournalLog::new() {
            if journal_log.install().is_ok() {
                log::set_max_level(log_level);
                return;
            }
        }
    }
    env_logger::Builder::new().filter_level(log_level).init();
}

/// Binds the backend socket, replacing any stale socket file from an
/// unclean shutdown. Only the owner may connect.
fn bind_socket() -> Result<UnixListener> {
    let socket_path = Path::new(SOCKET_PATH);
    if socket_path.exists() {
        std::fs::remove_file(socket_path)
            .with_context(|| format!("Removing stale socket file {SOCKET_PATH}"))?;
    }
    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("Binding backend socket {SOCKET_PATH}"))?;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}

fn setup_term_signal() -> Result<Arc<Notify>> {
    let term_notify = Arc::new(Notify::new());
    for signal in [
        tokio::signal::unix::SignalKind::terminate(),
        tokio::signal::unix::SignalKind::interrupt(),
        tokio::signal::unix::SignalKind::quit(),
    ] {
        let mut signal_stream = tokio::signal::unix::signal(signal)?;
        let notify = Arc::clone(&term_notify);
        tokio::task::spawn(async move {
            signal_stream.recv().await;
            notify.notify_one();
        });
    }
    Ok(term_notify)
}

impl DeviceLibrary for LiquidctlLib {
    fn version(&self) -> String {
        self.version().to_string()
    }

    fn find_devices(&self) -> Result<Vec<Arc<dyn CoolingDevice>>> {
        LiquidctlLib::find_devices(self)
    }

    fn find_legacy690_devices(&self) -> Result<Vec<Arc<dyn CoolingDevice>>> {
        LiquidctlLib::find_legacy690_devices(self)
    }
}
