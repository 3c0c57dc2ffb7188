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

use std::collections::HashMap;
use std::ops::Add;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use clokwerk::{AsyncScheduler, Interval};
use env_logger::Logger;
use log::{error, info, warn, LevelFilter, Log, Metadata, Record, SetLoggerError};
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use systemd_journal_logger::{connected_to_journal, JournalLog};
use tokio::time::sleep;

use crate::config::Config;
use crate::device::{DeviceType, DeviceUID};
use crate::device_commander::DeviceCommander;
use crate::gui_server::GuiServer;
use crate::modes::ModeController;
use crate::repositories::composite_repo::CompositeRepo;
use crate::repositories::coolerod_client::CoolerodClient;
use crate::repositories::cpu_repo::CpuRepo;
use crate::repositories::gpu_repo::GpuRepo;
use crate::repositories::hwmon::hwmon_repo::HwmonRepo;
use crate::repositories::liquidctl::liquidctl_repo::LiquidctlRepo;
use crate::repositories::repository::{DeviceList, DeviceLock, Repository};
use crate::sleep_listener::SleepListener;
use crate::speed_scheduler::SpeedScheduler;
use crate::status_poller::StatusPoller;

mod config;
mod device;
mod device_commander;
mod gui_server;
mod modes;
mod repositories;
mod setting;
mod sleep_listener;
mod speed_scheduler;
mod status_poller;
mod utils;

const VERSION: Option<&str> = option_env!("CARGO_PKG_VERSION");
const LOG_ENV: &str = "COOLERD_LOG";
const LOG_ENV_SHORT: &str = "CC_LOG";
// USB devices aren't necessarily ready immediately after waking:
const WAKE_PAUSE_MINIMUM: Duration = Duration::from_secs(2);

pub type Repos = Arc<Vec<Arc<dyn Repository>>>;
pub type ReposByType = Arc<HashMap<DeviceType, Arc<dyn Repository>>>;
pub type AllDevices = Arc<HashMap<DeviceUID, DeviceLock>>;

/// A daemon to monitor and control your cooling devices
#[derive(Parser, Debug)]
#[clap(author, about, long_about = None)]
struct Args {
    /// Enable debug output
    #[clap(long)]
    debug: bool,

    /// Get current version info
    #[clap(long, short)]
    version: bool,

    /// Check config file validity
    #[clap(long)]
    config: bool,
}

/// Main Control Loop
#[tokio::main]
async fn main() -> Result<()> {
    let cmd_args: Args = Args::parse();
    setup_logging(&cmd_args)?;
    info!("Initializing...");
    let term_signal = setup_term_signal()?;
    let config = Arc::new(Config::load_config_file().await?);
    if cmd_args.config {
        std::process::exit(0);
    }
    let mut scheduler = AsyncScheduler::with_tz(Utc);

    pause_before_startup(&config).await;

    let coolerod_client = match CoolerodClient::connect().await {
        Ok(client) => Some(Arc::new(client)),
        Err(err) => {
            // read-only mode for hwmon/gpu writes, monitoring still works:
            warn!("Could not connect to the privileged coolerod daemon: {err:#}");
            None
        }
    };

    let mut init_repos: Vec<Arc<dyn Repository>> = vec![];
    // should be first as it's the slowest:
    let liquidctl_repo = match init_liquidctl_repo(config.clone()).await {
        Ok(repo) => {
            init_repos.push(Arc::clone(&repo) as Arc<dyn Repository>);
            Some(repo)
        }
        Err(err) => {
            error!("Error initializing LIQUIDCTL Repo: {err:#}");
            None
        }
    };
    match init_cpu_repo(config.clone()).await {
        Ok(repo) => init_repos.push(Arc::new(repo)),
        Err(err) => error!("Error initializing CPU Repo: {err:#}"),
    }
    match init_gpu_repo(config.clone(), coolerod_client.clone()).await {
        Ok(repo) => init_repos.push(Arc::new(repo)),
        Err(err) => error!("Error initializing GPU Repo: {err:#}"),
    }
    match init_hwmon_repo(config.clone(), coolerod_client.clone()).await {
        Ok(repo) => init_repos.push(Arc::new(repo)),
        Err(err) => error!("Error initializing HWMON Repo: {err:#}"),
    }
    // should be last as it uses all other device temps:
    let devices_for_composite = collect_all_devices(&init_repos).await;
    match init_composite_repo(config.clone(), devices_for_composite).await {
        Ok(repo) => init_repos.push(Arc::new(repo)),
        Err(err) => error!("Error initializing COMPOSITE Repo: {err:#}"),
    }
    let repos: Repos = Arc::new(init_repos);

    let mut all_devices = HashMap::new();
    let mut repos_by_type = HashMap::new();
    for repo in repos.iter() {
        repos_by_type.insert(repo.device_type(), Arc::clone(repo));
        for device_lock in repo.devices().await {
            let uid = device_lock.read().await.uid.clone();
            all_devices.insert(uid, Arc::clone(&device_lock));
        }
    }
    let all_devices: AllDevices = Arc::new(all_devices);
    let repos_by_type: ReposByType = Arc::new(repos_by_type);

    let speed_scheduler = Arc::new(SpeedScheduler::new(
        all_devices.clone(),
        repos_by_type.clone(),
        config.clone(),
    ));
    let device_commander = Arc::new(DeviceCommander::new(
        all_devices.clone(),
        repos_by_type.clone(),
        speed_scheduler.clone(),
        config.clone(),
    ));
    let mode_controller = Arc::new(ModeController::new(
        config.clone(),
        device_commander.clone(),
    ));

    if config.get_settings().await.load_applied_at_boot {
        info!("Applying saved device settings");
        device_commander.apply_saved_device_settings().await;
    }

    let status_poller = Arc::new(StatusPoller::new(repos.clone()));
    status_poller
        .register_observer(speed_scheduler.clone() as _)
        .await;

    let sleep_listener = SleepListener::new().await?;

    let gui_server = Arc::new(GuiServer::new(
        all_devices.clone(),
        device_commander.clone(),
        mode_controller,
        liquidctl_repo,
        config.clone(),
    ));
    tokio::task::spawn(async move {
        if let Err(err) = gui_server.serve().await {
            error!("Fatal IPC server error: {err:#}");
            std::process::exit(1);
        }
    });

    add_status_poll_job_into(&mut scheduler, &status_poller);

    // give concurrent services a moment to come up:
    sleep(Duration::from_millis(10)).await;
    info!("Daemon successfully initialized");
    // main loop:
    while !term_signal.load(Ordering::Relaxed) {
        if sleep_listener.is_resuming() {
            wake_from_sleep(&config, &device_commander, &speed_scheduler).await;
            sleep_listener.resuming(false);
            sleep_listener.preparing_to_sleep(false);
        } else if sleep_listener.is_preparing_to_sleep() {
            // poll and apply jobs stay paused until the system has resumed
            speed_scheduler.pause();
        } else {
            // this await will block future jobs if a scheduled job is long-running:
            scheduler.run_pending().await;
        }
        sleep(Duration::from_millis(100)).await;
    }
    sleep(Duration::from_millis(500)).await; // wait for already scheduled jobs to finish
    shutdown(repos).await
}

fn setup_logging(cmd_args: &Args) -> Result<()> {
    let version = VERSION.unwrap_or("unknown");
    let log_level = if cmd_args.debug {
        LevelFilter::Debug
    } else if let Ok(log_lvl) = std::env::var(LOG_ENV).or_else(|_| std::env::var(LOG_ENV_SHORT)) {
        LevelFilter::from_str(&log_lvl).unwrap_or(LevelFilter::Info)
    } else {
        LevelFilter::Info
    };
    CoolerdLogger::new(log_level, version)?.init()?;
    info!("Logging Level: {}", log::max_level());
    if log::max_level() == LevelFilter::Debug || cmd_args.version {
        info!("Coolerd v{version}");
    }
    if cmd_args.version {
        std::process::exit(0);
    }
    Ok(())
}

fn setup_term_signal() -> Result<Arc<AtomicBool>> {
    let term_signal = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGTERM, Arc::clone(&term_signal))?;
    signal_hook::flag::register(SIGINT, Arc::clone(&term_signal))?;
    signal_hook::flag::register(SIGQUIT, Arc::clone(&term_signal))?;
    Ok(term_signal)
}

/// Some hardware needs additional time to come up and be ready to
/// communicate. Additionally we always add a short pause to at least allow
/// the backend service to come up.
async fn pause_before_startup(config: &Arc<Config>) {
    let startup_delay = config.get_settings().await.startup_delay;
    sleep(startup_delay.add(Duration::from_secs(1))).await;
}

/// Cooling-lib devices should be first and require a bit of special handling.
async fn init_liquidctl_repo(config: Arc<Config>) -> Result<Arc<LiquidctlRepo>> {
    let mut lc_repo = LiquidctlRepo::new(config).await?;
    lc_repo.initialize_devices().await?;
    Ok(Arc::new(lc_repo))
}

async fn init_cpu_repo(config: Arc<Config>) -> Result<CpuRepo> {
    let mut cpu_repo = CpuRepo::new(config)?;
    cpu_repo.initialize_devices().await?;
    Ok(cpu_repo)
}

async fn init_gpu_repo(
    config: Arc<Config>,
    coolerod_client: Option<Arc<CoolerodClient>>,
) -> Result<GpuRepo> {
    let mut gpu_repo = GpuRepo::new(config, coolerod_client);
    gpu_repo.initialize_devices().await?;
    Ok(gpu_repo)
}

async fn init_hwmon_repo(
    config: Arc<Config>,
    coolerod_client: Option<Arc<CoolerodClient>>,
) -> Result<HwmonRepo> {
    let mut hwmon_repo = HwmonRepo::new(config, coolerod_client);
    hwmon_repo.initialize_devices().await?;
    Ok(hwmon_repo)
}

async fn init_composite_repo(
    config: Arc<Config>,
    devices_for_composite: DeviceList,
) -> Result<CompositeRepo> {
    let composite_enabled = config.get_settings().await.enable_composite_temps;
    let mut composite_repo =
        CompositeRepo::new(config, devices_for_composite, composite_enabled);
    composite_repo.initialize_devices().await?;
    Ok(composite_repo)
}

/// Create a separate list of devices to be used in the composite repository
async fn collect_all_devices(init_repos: &[Arc<dyn Repository>]) -> DeviceList {
    let mut devices_for_composite = Vec::new();
    for repo in init_repos {
        if repo.device_type() != DeviceType::Composite {
            for device_lock in repo.devices().await {
                devices_for_composite.push(Arc::clone(&device_lock));
            }
        }
    }
    devices_for_composite
}

/// The 1 Hz status tick. The poller itself guarantees that ticks never
/// overlap and that an overrunning tick causes the next one to be skipped.
fn add_status_poll_job_into(scheduler: &mut AsyncScheduler<Utc>, status_poller: &Arc<StatusPoller>) {
    let pass_poller = Arc::clone(status_poller);
    scheduler.every(Interval::Seconds(1)).run(move || {
        let moved_poller = Arc::clone(&pass_poller);
        Box::pin(async move {
            tokio::task::spawn(async move {
                moved_poller.tick().await;
            });
        })
    });
}

/// Handles the actions needed to properly wake the system from sleep mode:
/// wait for the hardware to fully power up, re-initialize and re-apply
/// device settings, then resume the speed scheduler.
async fn wake_from_sleep(
    config: &Arc<Config>,
    device_commander: &Arc<DeviceCommander>,
    speed_scheduler: &Arc<SpeedScheduler>,
) {
    let startup_delay = config
        .get_settings()
        .await
        .startup_delay
        .max(WAKE_PAUSE_MINIMUM);
    info!(
        "Waiting {}s before resuming after waking from sleep",
        startup_delay.as_secs()
    );
    sleep(startup_delay).await;
    info!("Re-initializing devices after waking from sleep");
    device_commander.reinitialize_devices().await;
    sleep(Duration::from_secs(1)).await;
    if config.get_settings().await.load_applied_at_boot {
        info!("Re-applying settings after waking from sleep");
        device_commander.apply_saved_device_settings().await;
    }
    speed_scheduler.resume();
}

async fn shutdown(repos: Repos) -> Result<()> {
    info!("Main process shutting down");
    for repo in repos.iter() {
        if let Err(err) = repo.shutdown().await {
            error!("Shutdown error: {err:#}");
        };
    }
    info!("Shutdown Complete");
    Ok(())
}

/// This is our own Logger, which handles appropriate logging dependent on
/// the environment.
struct CoolerdLogger {
    max_level: LevelFilter,
    log_filter: Logger,
    logger: Box<dyn Log>,
}

impl CoolerdLogger {
    fn new(max_level: LevelFilter, version: &str) -> Result<Self> {
        // set library logging levels to one level above the application's
        // to keep chatter down:
        let lib_log_level = if max_level == LevelFilter::Trace {
            LevelFilter::Debug
        } else if max_level == LevelFilter::Debug {
            LevelFilter::Info
        } else {
            LevelFilter::Warn
        };
        let timestamp_precision = if max_level == LevelFilter::Debug {
            env_logger::fmt::TimestampPrecision::Millis
        } else {
            env_logger::fmt::TimestampPrecision::Seconds
        };
        let logger: Box<dyn Log> = if connected_to_journal() {
            Box::new(JournalLog::new()?.with_extra_fields(vec![("VERSION", version)]))
        } else {
            Box::new(
                env_logger::Builder::new()
                    .filter_level(max_level)
                    .format_timestamp(Some(timestamp_precision))
                    .build(),
            )
        };
        Ok(Self {
            max_level,
            log_filter: env_logger::Builder::from_env(LOG_ENV)
                .filter_level(max_level)
                .filter_module("zbus", lib_log_level)
                .filter_module("tracing", lib_log_level)
                // hyper uses tracing, but doesn't seem to log as other "tracing crates" do:
                .filter_module("hyper", lib_log_level)
                .build(),
            logger,
        })
    }

    fn init(self) -> Result<(), SetLoggerError> {
        log::set_max_level(self.max_level);
        log::set_boxed_logger(Box::new(self))
    }
}

impl Log for CoolerdLogger {
    /// Whether this logger is enabled.
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.log_filter.enabled(metadata)
    }

    /// Logs the messages and filters them by matching against the `env_logger` filter
    fn log(&self, record: &Record) {
        if self.log_filter.matches(record) {
            self.logger.log(record);
        }
    }

    /// Flush log records.
    ///
    /// A no-op for this implementation.
    fn flush(&self) {}
}
