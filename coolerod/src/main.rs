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

use std::os::fd::FromRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use nix::unistd::{chown, Uid, User};
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use tokio::net::{UnixListener, UnixStream};

use crate::protocol::Disposition;

mod protocol;

const SOCKET_NAME: &str = "coolerod.sock";
const SYSTEM_RUN_PATH: &str = "/run/coolerd";
const LOG_ENV: &str = "COOLERD_LOG";
// systemd passes activated sockets starting at fd 3:
const SYSTEMD_FIRST_SOCKET_FD: i32 = 3;
const ACCEPT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// System daemon applying hwmon settings on behalf of the unprivileged coolerd daemon
#[derive(Parser, Debug)]
#[clap(author, about, long_about = None)]
struct Args {
    /// The user to allow access to the daemon socket
    #[clap(value_name = "USER")]
    username: Option<String>,

    /// Enable debug output
    #[clap(long)]
    debug: bool,
}

enum SocketSource {
    /// We created the socket ourselves and must unlink it on shutdown.
    Owned(PathBuf),
    /// systemd handed us a pre-opened listening socket.
    Activated,
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args);
    if !Uid::effective().is_root() {
        error!("coolerod must be run with root permissions");
        std::process::exit(1);
    }
    let term_signal = setup_term_signal()?;
    let (listener, source) = match setup_socket(args.username.as_deref()) {
        Ok(setup) => setup,
        Err(err) => {
            error!("Could not set up daemon socket: {err:#}");
            std::process::exit(1);
        }
    };
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(run(&listener, &term_signal))?;
    drop(listener);
    if let SocketSource::Owned(socket_path) = source {
        if let Err(err) = std::fs::remove_file(&socket_path) {
            warn!("Could not remove socket file {socket_path:?}: {err}");
        }
    }
    info!("Daemon shutdown complete");
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

fn setup_term_signal() -> Result<Arc<AtomicBool>> {
    let term_signal = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGTERM, Arc::clone(&term_signal))?;
    signal_hook::flag::register(SIGINT, Arc::clone(&term_signal))?;
    signal_hook::flag::register(SIGQUIT, Arc::clone(&term_signal))?;
    Ok(term_signal)
}

/// Sets up the listening socket. When a username is given and no socket file
/// exists yet, we create and own the socket. Otherwise the socket must have
/// been set up by systemd socket activation and is taken over from fd 3.
fn setup_socket(username: Option<&str>) -> Result<(UnixListener, SocketSource)> {
    let run_path = socket_run_path();
    let socket_path = run_path.join(SOCKET_NAME);
    if let Some(username) = username {
        if !socket_path.exists() {
            let listener = init_standard_socket(&run_path, &socket_path, username)?;
            return Ok((listener, SocketSource::Owned(socket_path)));
        }
    }
    if !socket_path.exists() {
        return Err(anyhow!("systemd socket not found at {socket_path:?}"));
    }
    info!("Initializing systemd activated daemon socket");
    // Safety: fd 3 is guaranteed by systemd to be our listening socket.
    let std_listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(SYSTEMD_FIRST_SOCKET_FD) };
    std_listener.set_nonblocking(true)?;
    let listener = UnixListener::from_std(std_listener)?;
    Ok((listener, SocketSource::Activated))
}

/// The session scope is used when started from within a user session via
/// pkexec, the system scope when started as a standalone system service.
fn socket_run_path() -> PathBuf {
    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(runtime_dir) => Path::new(&runtime_dir).join("coolerd"),
        Err(_) => PathBuf::from(SYSTEM_RUN_PATH),
    }
}

fn init_standard_socket(
    run_path: &Path,
    socket_path: &Path,
    username: &str,
) -> Result<UnixListener> {
    info!("Initializing standard daemon socket at {socket_path:?}");
    let user = User::from_name(username)
        .with_context(|| format!("Looking up user {username}"))?
        .with_context(|| format!("User not found: {username}"))?;
    std::fs::create_dir_all(run_path)?;
    let listener = UnixListener::bind(socket_path)?;
    for path in [run_path, socket_path] {
        chown(path, None, Some(user.gid))?;
        // group-writable for the controlling user only:
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o770))?;
    }
    Ok(listener)
}

async fn run(listener: &UnixListener, term_signal: &Arc<AtomicBool>) -> Result<()> {
    info!("Daemon listening...");
    while !term_signal.load(Ordering::Relaxed) {
        // wake up regularly so termination signals are noticed:
        let accepted =
            match tokio::time::timeout(ACCEPT_POLL_TIMEOUT, listener.accept()).await {
                Ok(accepted) => accepted,
                Err(_) => continue,
            };
        match accepted {
            Ok((stream, _addr)) => {
                info!("Connection accepted");
                if handle_connection(stream, term_signal).await == Disposition::Shutdown {
                    break;
                }
            }
            Err(err) => error!("Error accepting connection: {err}"),
        }
    }
    Ok(())
}

/// Services a single connection until the client closes it, a shutdown is
/// requested, or a protocol violation occurs. Connections are handled one at
/// a time.
async fn handle_connection(mut stream: UnixStream, term_signal: &Arc<AtomicBool>) -> Disposition {
    loop {
        if term_signal.load(Ordering::Relaxed) {
            return Disposition::Shutdown;
        }
        let msg = match protocol::read_message(&mut stream).await {
            Ok(msg) => msg,
            Err(err) => {
                // EOF on a closed client connection is normal, anything else is not:
                info!("Closing connection: {err}");
                return Disposition::CloseConnection;
            }
        };
        match protocol::handle_message(&mut stream, msg).await {
            Ok(Disposition::Continue) => {}
            Ok(disposition) => return disposition,
            Err(err) => {
                error!("Unexpected socket error, closing connection: {err}");
                return Disposition::CloseConnection;
            }
        }
    }
}
