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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::config::Config;
use crate::device::{ChannelName, DeviceType, Duty, UID};
use crate::setting::{Setting, TempSource};
use crate::utils;
use crate::{AllDevices, ReposByType};

/// A new duty is applied on any integer change, but never faster than this
/// per channel.
const MIN_APPLY_INTERVAL: Duration = Duration::from_secs(2);

/// This enables the use of a scheduler to automatically set the speed on
/// devices in relation to temperature sources that are not supported on the
/// device itself. For ex. fan and pump controls based on CPU Temp, or
/// profile speed settings for devices that only support fixed speeds.
pub struct SpeedScheduler {
    all_devices: AllDevices,
    repos: ReposByType,
    config: Arc<Config>,
    scheduled_settings: RwLock<HashMap<UID, HashMap<ChannelName, ScheduledSetting>>>,
    paused: AtomicBool,
}

struct ScheduledSetting {
    normalized_profile: Vec<(u8, u8)>,
    temp_source: TempSource,
    pwm_mode: Option<u8>,
    last_applied_duty: Option<Duty>,
    last_applied_at: Option<Instant>,
}

impl SpeedScheduler {
    pub fn new(all_devices: AllDevices, repos: ReposByType, config: Arc<Config>) -> Self {
        Self {
            all_devices,
            repos,
            config,
            scheduled_settings: RwLock::new(HashMap::new()),
            paused: AtomicBool::new(false),
        }
    }

    /// Normalizes and stores the given profile setting for continuous
    /// evaluation against its temp source.
    pub async fn schedule_setting(&self, device_uid: &UID, setting: &Setting) -> Result<()> {
        let speed_profile = setting
            .speed_profile
            .as_ref()
            .ok_or_else(|| anyhow!("Not enough info to schedule a manual speed profile"))?;
        let temp_source = setting
            .temp_source
            .as_ref()
            .ok_or_else(|| anyhow!("Not enough info to schedule a manual speed profile"))?;
        let temp_source_device = self.all_devices.get(&temp_source.device_uid).with_context(|| {
            format!(
                "temp_source device must currently be present to schedule speed: {}",
                temp_source.device_uid
            )
        })?;
        let critical_temp = temp_source_device.read().await.info.temp_max;
        let device_to_schedule = self.all_devices.get(device_uid).with_context(|| {
            format!("Target device to schedule speed must be present: {device_uid}")
        })?;
        let (min_duty, max_duty) = {
            let device = device_to_schedule.read().await;
            let speed_options = device
                .info
                .channels
                .get(&setting.channel_name)
                .with_context(|| {
                    format!(
                        "Channel Info for channel: {} must be present for target device: {device_uid}",
                        setting.channel_name
                    )
                })?
                .speed_options
                .as_ref()
                .with_context(|| {
                    format!("Speed Options must be present for target device: {device_uid}")
                })?;
            (speed_options.min_duty, speed_options.max_duty)
        };
        let normalized_profile =
            utils::normalize_profile(speed_profile, critical_temp, min_duty, max_duty);
        self.scheduled_settings
            .write()
            .await
            .entry(device_uid.clone())
            .or_default()
            .insert(
                setting.channel_name.clone(),
                ScheduledSetting {
                    normalized_profile,
                    temp_source: temp_source.clone(),
                    pwm_mode: setting.pwm_mode,
                    last_applied_duty: None,
                    last_applied_at: None,
                },
            );
        Ok(())
    }

    pub async fn clear_channel_setting(&self, device_uid: &UID, channel_name: &str) {
        if let Some(device_channel_settings) =
            self.scheduled_settings.write().await.get_mut(device_uid)
        {
            device_channel_settings.remove(channel_name);
        }
    }

    /// Used by the sleep listener to stop applying duties while the system
    /// enters or leaves sleep.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Re-evaluates every scheduled profile against its temp source. Called
    /// on every status tick.
    pub async fn update_speed(&self) {
        if self.paused.load(Ordering::SeqCst) {
            return;
        }
        debug!("SPEED SCHEDULER triggered");
        let mut duties_to_apply: Vec<(UID, ChannelName, Duty, Option<u8>)> = Vec::new();
        {
            let scheduled_settings = self.scheduled_settings.read().await;
            for (device_uid, channel_settings) in scheduled_settings.iter() {
                for (channel_name, scheduled) in channel_settings {
                    let Some(current_source_temp) = self.get_source_temp(scheduled).await else {
                        error!(
                            "Temp sensor was not found in the temp source device: {}",
                            scheduled.temp_source.temp_name
                        );
                        continue;
                    };
                    let duty_to_set =
                        utils::interpolate_profile(&scheduled.normalized_profile, current_source_temp);
                    if Self::should_apply(scheduled, duty_to_set) {
                        duties_to_apply.push((
                            device_uid.clone(),
                            channel_name.clone(),
                            duty_to_set,
                            scheduled.pwm_mode,
                        ));
                    } else {
                        debug!("Duty unchanged or within the apply interval, skipping");
                    }
                }
            }
        }
        for (device_uid, channel_name, duty, pwm_mode) in duties_to_apply {
            self.set_speed(&device_uid, &channel_name, duty, pwm_mode)
                .await;
        }
    }

    /// Any integer change in duty is applied, but no channel is written to
    /// more often than the minimum apply interval. An unchanged duty is
    /// never re-applied.
    fn should_apply(scheduled: &ScheduledSetting, duty_to_set: Duty) -> bool {
        if scheduled.last_applied_duty == Some(duty_to_set) {
            return false;
        }
        match scheduled.last_applied_at {
            Some(last_applied_at) => last_applied_at.elapsed() >= MIN_APPLY_INTERVAL,
            None => true,
        }
    }

    /// Reads the current temp of the bound source, optionally damped with an
    /// exponential moving average for dynamic sources.
    async fn get_source_temp(&self, scheduled: &ScheduledSetting) -> Option<f64> {
        let temp_source_device_lock = self
            .all_devices
            .get(&scheduled.temp_source.device_uid)
            .or_else(|| {
                error!(
                    "Temperature source device is currently not present: {}",
                    scheduled.temp_source.device_uid
                );
                None
            })?;
        let temp_source_device = temp_source_device_lock.read().await;
        let mut temps = temp_source_device
            .status_history
            .iter()
            .rev()
            // we only need the last sample_size temps for the EMA:
            .take(utils::SAMPLE_SIZE as usize)
            .flat_map(|status| status.temps.as_slice())
            .filter(|temp_status| temp_status.name == scheduled.temp_source.temp_name)
            .map(|temp_status| temp_status.temp)
            .collect::<Vec<f64>>();
        temps.reverse(); // re-order temps so the most recent is last
        if temps.is_empty() {
            return None;
        }
        let device_type = temp_source_device.d_type;
        let settings = self.config.get_settings().await;
        if settings.enable_dynamic_temp_handling
            && (device_type == DeviceType::CPU
                || device_type == DeviceType::GPU
                || device_type == DeviceType::Composite)
        {
            Some(utils::current_temp_from_exponential_moving_average(&temps))
        } else {
            temps.last().copied()
        }
    }

    async fn set_speed(
        &self,
        device_uid: &UID,
        channel_name: &str,
        duty_to_set: Duty,
        pwm_mode: Option<u8>,
    ) {
        let fixed_setting = Setting {
            channel_name: channel_name.to_string(),
            speed_fixed: Some(duty_to_set),
            pwm_mode,
            ..Default::default()
        };
        let Some(device_type) = self.device_type_for(device_uid).await else {
            error!("Scheduled device is no longer present: {device_uid}");
            return;
        };
        let Some(repo) = self.repos.get(&device_type) else {
            error!("No repository found for device type: {device_type}");
            return;
        };
        info!("Applying scheduled speed setting of {duty_to_set}% to {device_uid}:{channel_name}");
        match repo.apply_setting(device_uid, &fixed_setting).await {
            Ok(()) => {
                if let Some(scheduled) = self
                    .scheduled_settings
                    .write()
                    .await
                    .get_mut(device_uid)
                    .and_then(|channels| channels.get_mut(channel_name))
                {
                    scheduled.last_applied_duty = Some(duty_to_set);
                    scheduled.last_applied_at = Some(Instant::now());
                }
            }
            // no metadata update, the apply is retried on the next tick:
            Err(err) => error!("Error applying scheduled speed setting: {err}"),
        }
    }

    async fn device_type_for(&self, device_uid: &UID) -> Option<DeviceType> {
        Some(self.all_devices.get(device_uid)?.read().await.d_type)
    }
}

#[async_trait::async_trait]
impl crate::status_poller::StatusObserver for SpeedScheduler {
    async fn on_statuses_updated(&self) {
        self.update_speed().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serial_test::serial;
    use std::sync::Mutex;

    use crate::device::{
        ChannelInfo, Device, DeviceInfo, SpeedOptions, Status, TempStatus,
    };
    use crate::repositories::repository::{DeviceList, DeviceLock, Repository};

    struct StubRepo {
        applied: Mutex<Vec<(UID, Setting)>>,
        fail_applies: bool,
    }

    impl StubRepo {
        fn new(fail_applies: bool) -> Self {
            Self {
                applied: Mutex::new(Vec::new()),
                fail_applies,
            }
        }
    }

    #[async_trait]
    impl Repository for StubRepo {
        fn device_type(&self) -> DeviceType {
            DeviceType::Hwmon
        }
        async fn initialize_devices(&mut self) -> Result<()> {
            Ok(())
        }
        async fn devices(&self) -> DeviceList {
            vec![]
        }
        async fn update_statuses(&self) -> Result<()> {
            Ok(())
        }
        async fn apply_setting(&self, device_uid: &UID, setting: &Setting) -> Result<()> {
            if self.fail_applies {
                return Err(anyhow!("device busy"));
            }
            self.applied
                .lock()
                .unwrap()
                .push((device_uid.clone(), setting.clone()));
            Ok(())
        }
        async fn apply_setting_reset(&self, _device_uid: &UID, _channel_name: &str) -> Result<()> {
            Ok(())
        }
        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
    }

    fn test_runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    fn fan_device(min_duty: u8, max_duty: u8) -> Device {
        let mut info = DeviceInfo {
            temp_max: 100,
            temp_ext_available: true,
            ..Default::default()
        };
        info.channels.insert(
            "fan1".to_string(),
            ChannelInfo {
                speed_options: Some(SpeedOptions {
                    min_duty,
                    max_duty,
                    fixed_enabled: true,
                    manual_profiles_enabled: true,
                    profiles_enabled: false,
                }),
                ..Default::default()
            },
        );
        let mut device = Device::new("Test Fan".to_string(), DeviceType::Hwmon, 1, None, info);
        device.set_status(Status::default());
        device
    }

    async fn push_temp(device: &DeviceLock, temp: f64) {
        device.write().await.set_status(Status {
            temps: vec![TempStatus {
                name: "temp1".to_string(),
                temp,
                frontend_name: "Temp 1".to_string(),
                external_name: "HW#1 Temp 1".to_string(),
            }],
            ..Default::default()
        });
    }

    struct TestContext {
        scheduler: SpeedScheduler,
        repo: Arc<StubRepo>,
        fan: DeviceLock,
    }

    async fn setup_scheduler(fail_applies: bool) -> TestContext {
        let test_config_dir = format!("/tmp/coolerd-scheduler-test-{}", uuid::Uuid::new_v4());
        std::env::set_var("XDG_CONFIG_HOME", &test_config_dir);
        let config = Arc::new(Config::load_config_file().await.unwrap());
        let mut settings = config.get_settings().await;
        // use the raw temp readings in tests:
        settings.enable_dynamic_temp_handling = false;
        config.set_settings(&settings).await;
        let fan: DeviceLock = Arc::new(RwLock::new(fan_device(20, 100)));
        let fan_uid = fan.read().await.uid.clone();
        let mut devices = HashMap::new();
        devices.insert(fan_uid, Arc::clone(&fan));
        let all_devices: AllDevices = Arc::new(devices);
        let repo = Arc::new(StubRepo::new(fail_applies));
        let mut repos: HashMap<DeviceType, Arc<dyn Repository>> = HashMap::new();
        repos.insert(DeviceType::Hwmon, repo.clone() as Arc<dyn Repository>);
        let scheduler = SpeedScheduler::new(all_devices, Arc::new(repos), config);
        TestContext {
            scheduler,
            repo,
            fan,
        }
    }

    fn profile_setting() -> Setting {
        Setting {
            channel_name: "fan1".to_string(),
            speed_profile: Some(vec![(30.0, 20), (50.0, 40), (70.0, 80), (100.0, 100)]),
            temp_source: Some(TempSource {
                temp_name: "temp1".to_string(),
                device_uid: "hwmon1".to_string(),
            }),
            ..Default::default()
        }
    }

    #[test]
    #[serial]
    fn evaluates_profile_and_applies_clamped_duty() {
        test_runtime().block_on(async {
            // given:
            let ctx = setup_scheduler(false).await;
            let fan_uid = ctx.fan.read().await.uid.clone();
            ctx.scheduler
                .schedule_setting(&fan_uid, &profile_setting())
                .await
                .unwrap();

            // when: 45 degrees interpolates to 35%
            push_temp(&ctx.fan, 45.0).await;
            ctx.scheduler.update_speed().await;

            // then:
            let applied = ctx.repo.applied.lock().unwrap().clone();
            assert_eq!(applied.len(), 1);
            assert_eq!(applied[0].1.speed_fixed, Some(35));
            // the duty respects the channel limits:
            assert!(applied[0].1.speed_fixed.unwrap() >= 20);
            assert!(applied[0].1.speed_fixed.unwrap() <= 100);
        });
    }

    #[test]
    #[serial]
    fn unchanged_duty_is_not_reapplied() {
        test_runtime().block_on(async {
            // given:
            let ctx = setup_scheduler(false).await;
            let fan_uid = ctx.fan.read().await.uid.clone();
            ctx.scheduler
                .schedule_setting(&fan_uid, &profile_setting())
                .await
                .unwrap();

            // when: the same temp is seen on several ticks
            for _ in 0..4 {
                push_temp(&ctx.fan, 45.0).await;
                ctx.scheduler.update_speed().await;
            }

            // then: only a single apply happened
            assert_eq!(ctx.repo.applied.lock().unwrap().len(), 1);
        });
    }

    #[test]
    #[serial]
    fn apply_interval_is_enforced() {
        test_runtime().block_on(async {
            // given: an applied duty within the last two seconds
            let ctx = setup_scheduler(false).await;
            let fan_uid = ctx.fan.read().await.uid.clone();
            ctx.scheduler
                .schedule_setting(&fan_uid, &profile_setting())
                .await
                .unwrap();
            push_temp(&ctx.fan, 45.0).await;
            ctx.scheduler.update_speed().await;

            // when: the temp changes immediately afterwards
            push_temp(&ctx.fan, 50.0).await;
            ctx.scheduler.update_speed().await;

            // then: the new duty is deferred to a later tick
            assert_eq!(ctx.repo.applied.lock().unwrap().len(), 1);
        });
    }

    #[test]
    #[serial]
    fn failed_apply_is_retried_on_the_next_tick() {
        test_runtime().block_on(async {
            // given: a repo that always fails
            let ctx = setup_scheduler(true).await;
            let fan_uid = ctx.fan.read().await.uid.clone();
            ctx.scheduler
                .schedule_setting(&fan_uid, &profile_setting())
                .await
                .unwrap();

            // when:
            push_temp(&ctx.fan, 45.0).await;
            ctx.scheduler.update_speed().await;
            ctx.scheduler.update_speed().await;

            // then: nothing was recorded as applied, and the scheduled
            // setting still has no last-applied metadata (it keeps retrying)
            assert!(ctx.repo.applied.lock().unwrap().is_empty());
            let scheduled = ctx.scheduler.scheduled_settings.read().await;
            let setting = &scheduled[&fan_uid]["fan1"];
            assert_eq!(setting.last_applied_duty, None);
        });
    }

    #[test]
    #[serial]
    fn paused_scheduler_applies_nothing() {
        test_runtime().block_on(async {
            // given:
            let ctx = setup_scheduler(false).await;
            let fan_uid = ctx.fan.read().await.uid.clone();
            ctx.scheduler
                .schedule_setting(&fan_uid, &profile_setting())
                .await
                .unwrap();
            push_temp(&ctx.fan, 45.0).await;

            // when:
            ctx.scheduler.pause();
            ctx.scheduler.update_speed().await;

            // then:
            assert!(ctx.repo.applied.lock().unwrap().is_empty());

            // and resuming applies again:
            ctx.scheduler.resume();
            ctx.scheduler.update_speed().await;
            assert_eq!(ctx.repo.applied.lock().unwrap().len(), 1);
        });
    }
}
