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
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::RwLock;

use crate::device_executor::{DeviceExecutor, JobError};
use crate::liqctl::CoolingDevice;
use crate::models::{BackendError, DeviceId, DeviceResponse, Statuses};

// maximum timeout for setting data on the device:
const DEVICE_TIMEOUT: Duration = Duration::from_millis(9500);
// status reads must stay snappy, longer stalls go through the cache protocol:
const DEVICE_READ_STATUS_TIMEOUT: Duration = Duration::from_millis(550);

const DRIVER_LEGACY_690: &str = "Legacy690Lc";
const DRIVER_MODERN_690: &str = "Modern690Lc";
// initialize() clears previously set lighting settings on these:
const INITIALIZE_SKIP_DRIVERS: [&str; 1] = ["AuraLed"];
// these need initialize() on shutdown to hand fan control back to firmware:
const SHUTDOWN_REINIT_DRIVERS: [&str; 1] = ["CorsairHidPsu"];

/// Abstracts device discovery so the service logic is testable without the
/// embedded library.
pub trait DeviceLibrary: Send + Sync {
    fn version(&self) -> String;
    fn find_devices(&self) -> anyhow::Result<Vec<Arc<dyn CoolingDevice>>>;
    fn find_legacy690_devices(&self) -> anyhow::Result<Vec<Arc<dyn CoolingDevice>>>;
}

/// Keeps track of all devices and handles all communication with them.
///
/// Per-device communication is serialized through the [`DeviceExecutor`];
/// nothing here ever calls the library directly from the async runtime.
pub struct DeviceService {
    library: Arc<dyn DeviceLibrary>,
    devices: RwLock<HashMap<DeviceId, Arc<dyn CoolingDevice>>>,
    executor: RwLock<DeviceExecutor>,
    // written by worker threads as part of status jobs, thus a std lock:
    status_cache: Arc<StdRwLock<HashMap<DeviceId, Statuses>>>,
}

impl DeviceService {
    pub fn new(library: Arc<dyn DeviceLibrary>) -> Self {
        Self {
            library,
            devices: RwLock::new(HashMap::new()),
            executor: RwLock::new(DeviceExecutor::new()),
            status_cache: Arc::new(StdRwLock::new(HashMap::new())),
        }
    }

    async fn device(&self, device_id: DeviceId) -> Result<Arc<dyn CoolingDevice>, BackendError> {
        self.devices
            .read()
            .await
            .get(&device_id)
            .cloned()
            .ok_or(BackendError::DeviceNotFound(device_id))
    }

    /// Finds and connects all devices on the first call; subsequent calls
    /// return the already-discovered device metadata.
    pub async fn get_devices(&self) -> Result<Vec<DeviceResponse>, BackendError> {
        info!("Getting device list");
        if !self.devices.read().await.is_empty() {
            let mut devices = Vec::new();
            for (device_id, device) in self.devices.read().await.iter() {
                devices.push(self.build_device_response(*device_id, device).await?);
            }
            devices.sort_by_key(|device| device.id);
            return Ok(devices);
        }
        let library = Arc::clone(&self.library);
        let found_devices = tokio::task::spawn_blocking(move || library.find_devices())
            .await
            .map_err(|err| BackendError::Internal(err.to_string()))?
            .map_err(|err| BackendError::Liquidctl(format!("{err:#}")))?;
        if found_devices.is_empty() {
            info!("No cooling-lib devices detected");
            return Ok(Vec::new());
        }
        self.executor
            .write()
            .await
            .set_number_of_devices(found_devices.len() as u8);
        let mut devices = Vec::new();
        for (index, device) in found_devices.into_iter().enumerate() {
            let device_id = index as DeviceId + 1;
            self.devices.write().await.insert(device_id, Arc::clone(&device));
            self.connect_device(device_id, &device).await?;
            devices.push(self.build_device_response(device_id, &device).await?);
        }
        let device_names: Vec<String> = devices
            .iter()
            .map(|device| device.description.clone())
            .collect();
        info!("Devices found: {device_names:?}");
        Ok(devices)
    }

    /// Device metadata is read through a worker job, as the attribute
    /// lookups go into the library.
    async fn build_device_response(
        &self,
        device_id: DeviceId,
        device: &Arc<dyn CoolingDevice>,
    ) -> Result<DeviceResponse, BackendError> {
        let metadata_device = Arc::clone(device);
        let metadata_job = self.executor.read().await.submit(device_id, move || {
            Ok((
                metadata_device.description(),
                metadata_device.device_type(),
                metadata_device.serial_number(),
                metadata_device.properties(),
                metadata_device.hid_address(),
                metadata_device.hwmon_address(),
            ))
        });
        let (description, device_type, serial_number, properties, hid_address, hwmon_address) =
            metadata_job
                .result(DEVICE_TIMEOUT)
                .await
                .map_err(|err| BackendError::Liquidctl(err.to_string()))?;
        Ok(DeviceResponse {
            id: device_id,
            description,
            device_type,
            serial_number,
            properties,
            liquidctl_version: self.library.version(),
            hid_address,
            hwmon_address,
        })
    }

    /// Connects to a device, tolerating handles that are already open.
    async fn connect_device(
        &self,
        device_id: DeviceId,
        device: &Arc<dyn CoolingDevice>,
    ) -> Result<(), BackendError> {
        debug!("LC #{device_id} connect()");
        let connect_device = Arc::clone(device);
        let connect_job = self
            .executor
            .read()
            .await
            .submit(device_id, move || connect_device.connect());
        match connect_job.result(DEVICE_TIMEOUT).await {
            Ok(()) => Ok(()),
            Err(JobError::Failed(msg)) if msg.contains("already open") => {
                warn!("Device #{device_id} already connected");
                Ok(())
            }
            Err(err) => Err(BackendError::Liquidctl(err.to_string())),
        }
    }

    /// Modern and legacy Asetek 690Lc devices share the same vendor/product
    /// id. The user confirms which device is connected, and we re-bind the
    /// handle to the legacy driver accordingly.
    pub async fn set_device_as_legacy690(
        &self,
        device_id: DeviceId,
    ) -> Result<DeviceResponse, BackendError> {
        let device = self.device(device_id).await?;
        let device_type = device.device_type();
        if device_type == DRIVER_LEGACY_690 {
            warn!("Device #{device_id} is already set as a Legacy690Lc device");
            return self.build_device_response(device_id, &device).await;
        }
        if device_type != DRIVER_MODERN_690 {
            let message =
                format!("Device #{device_id} is not applicable to be downgraded to a Legacy690Lc");
            warn!("{message}");
            return Err(BackendError::InvalidState(message));
        }
        info!("Setting device #{device_id} as legacy690");
        self.disconnect_device(device_id, &device).await?;
        let library = Arc::clone(&self.library);
        let legacy_job = self
            .executor
            .read()
            .await
            .submit(device_id, move || library.find_legacy690_devices());
        let asetek690s = legacy_job
            .result(DEVICE_TIMEOUT)
            .await
            .map_err(|err| BackendError::Liquidctl(err.to_string()))?;
        if asetek690s.is_empty() {
            error!("Could not find any Legacy690Lc devices. This shouldn't happen");
            return Err(BackendError::Liquidctl(
                "Could not find any Legacy690Lc devices".to_string(),
            ));
        }
        let replacement = if asetek690s.len() > 1 {
            // multiple asetek 690s, correlate by position among them:
            let mut asetek690_ids: Vec<DeviceId> = Vec::new();
            for (id, dev) in self.devices.read().await.iter() {
                let dev_type = dev.device_type();
                if dev_type == DRIVER_LEGACY_690 || dev_type == DRIVER_MODERN_690 {
                    asetek690_ids.push(*id);
                }
            }
            asetek690_ids.sort_unstable();
            let device_index = asetek690_ids
                .iter()
                .position(|id| *id == device_id)
                .unwrap_or(0);
            Arc::clone(asetek690s.get(device_index).unwrap_or(&asetek690s[0]))
        } else {
            Arc::clone(&asetek690s[0])
        };
        self.devices.write().await.insert(device_id, Arc::clone(&replacement));
        self.connect_device(device_id, &replacement).await?;
        self.build_device_response(device_id, &replacement).await
    }

    pub async fn initialize_device(
        &self,
        device_id: DeviceId,
        pump_mode: Option<String>,
    ) -> Result<Statuses, BackendError> {
        let device = self.device(device_id).await?;
        info!("Initializing device #{device_id} with pump_mode: {pump_mode:?}");
        if INITIALIZE_SKIP_DRIVERS.contains(&device.device_type().as_str()) {
            info!("Skipping initialization for device #{device_id}, not needed");
            return Ok(Vec::new());
        }
        let init_job = self
            .executor
            .read()
            .await
            .submit(device_id, move || device.initialize(pump_mode));
        init_job
            .result(DEVICE_TIMEOUT)
            .await
            .map_err(|err| BackendError::Liquidctl(err.to_string()))
    }

    /// Gets the device status with a short read timeout. On a timeout the
    /// per-device cache steps in:
    ///
    /// - queue empty (a single stalled call): a long-timeout job is queued
    ///   that refreshes the cache whenever it finishes. The cached value is
    ///   returned immediately when present, otherwise this blocks on the
    ///   long job this one time so the cache fills at least once.
    /// - queue non-empty: the cached value is returned when present,
    ///   otherwise the timeout surfaces.
    pub async fn get_status(&self, device_id: DeviceId) -> Result<Statuses, BackendError> {
        let device = self.device(device_id).await?;
        debug!("Getting status for device: {device_id}");
        let status_device = Arc::clone(&device);
        let status_job = self
            .executor
            .read()
            .await
            .submit(device_id, move || status_device.get_status());
        match status_job.result(DEVICE_READ_STATUS_TIMEOUT).await {
            Ok(status) => {
                self.status_cache
                    .write()
                    .expect("status cache lock should not be poisoned")
                    .insert(device_id, status.clone());
                Ok(status)
            }
            Err(JobError::Timeout) => self.handle_status_timeout(device_id, &device).await,
            Err(err) => Err(BackendError::Liquidctl(err.to_string())),
        }
    }

    async fn handle_status_timeout(
        &self,
        device_id: DeviceId,
        device: &Arc<dyn CoolingDevice>,
    ) -> Result<Statuses, BackendError> {
        debug!(
            "Timeout occurred while getting device status for #{device_id}. \
            Reusing last status if possible."
        );
        let cached_status = self
            .status_cache
            .read()
            .expect("status cache lock should not be poisoned")
            .get(&device_id)
            .cloned();
        if self.executor.read().await.device_queue_empty(device_id) {
            // a single stalled call, some devices legitimately stall for seconds
            debug!("Running long-lasting async get_status() call");
            let refresh_device = Arc::clone(device);
            let refresh_cache = Arc::clone(&self.status_cache);
            let long_job = self.executor.read().await.submit(device_id, move || {
                let status = refresh_device.get_status()?;
                refresh_cache
                    .write()
                    .expect("status cache lock should not be poisoned")
                    .insert(device_id, status.clone());
                Ok(status)
            });
            if let Some(cached) = cached_status {
                // return immediately, the job above refreshes the cache in the background
                return Ok(cached);
            }
            long_job.result(DEVICE_TIMEOUT).await.map_err(|err| {
                error!("No status cache yet filled for device #{device_id}");
                BackendError::Liquidctl(err.to_string())
            })
        } else {
            cached_status.ok_or_else(|| {
                error!("No status cache yet filled for device #{device_id}");
                BackendError::Liquidctl("Status read timed out with an empty cache".to_string())
            })
        }
    }

    pub async fn set_fixed_speed(
        &self,
        device_id: DeviceId,
        channel: String,
        duty: u8,
    ) -> Result<(), BackendError> {
        let device = self.device(device_id).await?;
        debug!("Setting fixed speed for device: {device_id}, channel: {channel}, duty: {duty}");
        let speed_job = self
            .executor
            .read()
            .await
            .submit(device_id, move || device.set_fixed_speed(&channel, duty));
        speed_job
            .result(DEVICE_TIMEOUT)
            .await
            .map_err(|err| BackendError::Liquidctl(err.to_string()))
    }

    pub async fn set_speed_profile(
        &self,
        device_id: DeviceId,
        channel: String,
        profile: Vec<(f64, u8)>,
        temperature_sensor: Option<u8>,
    ) -> Result<(), BackendError> {
        let device = self.device(device_id).await?;
        debug!("Setting speed profile for device: {device_id}, channel: {channel}");
        let profile_job = self.executor.read().await.submit(device_id, move || {
            device.set_speed_profile(&channel, &profile, temperature_sensor)
        });
        profile_job
            .result(DEVICE_TIMEOUT)
            .await
            .map_err(|err| BackendError::Liquidctl(err.to_string()))
    }

    pub async fn set_color(
        &self,
        device_id: DeviceId,
        channel: String,
        mode: String,
        colors: Vec<(u8, u8, u8)>,
        time_per_color: Option<u8>,
        speed: Option<String>,
        direction: Option<String>,
    ) -> Result<(), BackendError> {
        let device = self.device(device_id).await?;
        debug!("Setting color for device: {device_id}, channel: {channel}, mode: {mode}");
        let color_job = self.executor.read().await.submit(device_id, move || {
            device.set_color(&channel, &mode, &colors, time_per_color, speed, direction)
        });
        color_job
            .result(DEVICE_TIMEOUT)
            .await
            .map_err(|err| BackendError::Liquidctl(err.to_string()))
    }

    pub async fn set_screen(
        &self,
        device_id: DeviceId,
        channel: String,
        mode: String,
        value: Option<String>,
    ) -> Result<(), BackendError> {
        let device = self.device(device_id).await?;
        debug!("Setting screen for device: {device_id}, channel: {channel}, mode: {mode}");
        let screen_job = self.executor.read().await.submit(device_id, move || {
            device.set_screen(&channel, &mode, value)
        });
        // an immediate status request after a screen update can come back
        // with zeros, let the device settle before the next job
        let settle_job = self.executor.read().await.submit(device_id, || {
            std::thread::sleep(Duration::from_millis(10));
            Ok(())
        });
        screen_job
            .result(DEVICE_TIMEOUT)
            .await
            .map_err(|err| BackendError::Liquidctl(err.to_string()))?;
        settle_job
            .result(DEVICE_TIMEOUT)
            .await
            .map_err(|err| BackendError::Liquidctl(err.to_string()))
    }

    async fn disconnect_device(
        &self,
        device_id: DeviceId,
        device: &Arc<dyn CoolingDevice>,
    ) -> Result<(), BackendError> {
        debug!("LC #{device_id} disconnect()");
        let disconnect_device = Arc::clone(device);
        let disconnect_job = self
            .executor
            .read()
            .await
            .submit(device_id, move || disconnect_device.disconnect());
        disconnect_job
            .result(DEVICE_TIMEOUT)
            .await
            .map_err(|err| BackendError::Liquidctl(err.to_string()))
    }

    /// Hands fan control back to firmware where required, disconnects all
    /// devices and stops the workers.
    pub async fn shutdown(&self) {
        let devices: Vec<(DeviceId, Arc<dyn CoolingDevice>)> = self
            .devices
            .read()
            .await
            .iter()
            .map(|(id, device)| (*id, Arc::clone(device)))
            .collect();
        for (device_id, device) in &devices {
            if SHUTDOWN_REINIT_DRIVERS.contains(&device.device_type().as_str()) {
                let init_device = Arc::clone(device);
                let init_job = self
                    .executor
                    .read()
                    .await
                    .submit(*device_id, move || init_device.initialize(None));
                if let Err(err) = init_job.result(DEVICE_TIMEOUT).await {
                    error!("Error re-initializing device #{device_id} on shutdown: {err}");
                }
            }
        }
        for (device_id, device) in &devices {
            if let Err(err) = self.disconnect_device(*device_id, device).await {
                error!("Error disconnecting device #{device_id}: {err}");
            }
        }
        self.devices.write().await.clear();
        self.executor.write().await.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    use crate::models::DeviceProperties;

    struct StubDevice {
        device_type: String,
        status: Statuses,
        status_delay: Duration,
        initialize_calls: AtomicUsize,
    }

    impl StubDevice {
        fn new(device_type: &str, status_delay: Duration) -> Self {
            Self {
                device_type: device_type.to_string(),
                status: vec![(
                    "Liquid temperature".to_string(),
                    "30.4".to_string(),
                    "°C".to_string(),
                )],
                status_delay,
                initialize_calls: AtomicUsize::new(0),
            }
        }
    }

    impl CoolingDevice for StubDevice {
        fn description(&self) -> String {
            format!("Test {}", self.device_type)
        }
        fn device_type(&self) -> String {
            self.device_type.clone()
        }
        fn serial_number(&self) -> Option<String> {
            None
        }
        fn hid_address(&self) -> Option<String> {
            None
        }
        fn hwmon_address(&self) -> Option<String> {
            None
        }
        fn properties(&self) -> DeviceProperties {
            DeviceProperties::default()
        }
        fn connect(&self) -> anyhow::Result<()> {
            Ok(())
        }
        fn initialize(&self, _pump_mode: Option<String>) -> anyhow::Result<Statuses> {
            self.initialize_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
        fn get_status(&self) -> anyhow::Result<Statuses> {
            std::thread::sleep(self.status_delay);
            Ok(self.status.clone())
        }
        fn set_fixed_speed(&self, _channel: &str, _duty: u8) -> anyhow::Result<()> {
            Ok(())
        }
        fn set_speed_profile(
            &self,
            _channel: &str,
            _profile: &[(f64, u8)],
            _temperature_sensor: Option<u8>,
        ) -> anyhow::Result<()> {
            Ok(())
        }
        fn set_color(
            &self,
            _channel: &str,
            _mode: &str,
            _colors: &[(u8, u8, u8)],
            _time_per_color: Option<u8>,
            _speed: Option<String>,
            _direction: Option<String>,
        ) -> anyhow::Result<()> {
            Ok(())
        }
        fn set_screen(
            &self,
            _channel: &str,
            _mode: &str,
            _value: Option<String>,
        ) -> anyhow::Result<()> {
            Ok(())
        }
        fn disconnect(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct StubLibrary {
        devices: Vec<Arc<dyn CoolingDevice>>,
    }

    impl DeviceLibrary for StubLibrary {
        fn version(&self) -> String {
            "1.13.0".to_string()
        }
        fn find_devices(&self) -> anyhow::Result<Vec<Arc<dyn CoolingDevice>>> {
            Ok(self.devices.clone())
        }
        fn find_legacy690_devices(&self) -> anyhow::Result<Vec<Arc<dyn CoolingDevice>>> {
            Ok(vec![Arc::new(StubDevice::new(
                DRIVER_LEGACY_690,
                Duration::ZERO,
            ))])
        }
    }

    fn test_runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    fn service_with(devices: Vec<Arc<dyn CoolingDevice>>) -> DeviceService {
        DeviceService::new(Arc::new(StubLibrary { devices }))
    }

    #[test]
    fn status_timeout_with_nonempty_queue_returns_cache_unchanged() {
        test_runtime().block_on(async {
            // given: a device that stalls on every status read
            let service = service_with(vec![
                Arc::new(StubDevice::new("KrakenX3", Duration::ZERO)),
                Arc::new(StubDevice::new("KrakenX3", Duration::ZERO)),
                Arc::new(StubDevice::new("KrakenX3", Duration::from_secs(2))),
            ]);
            service.get_devices().await.unwrap();
            let cached: Statuses =
                vec![("fan rpm".to_string(), "1200".to_string(), "rpm".to_string())];
            service
                .status_cache
                .write()
                .unwrap()
                .insert(3, cached.clone());
            // occupy the worker and leave a job waiting in the queue:
            let _blocker = service.executor.read().await.submit(3, || {
                std::thread::sleep(Duration::from_secs(2));
                Ok(())
            });
            let _queued = service.executor.read().await.submit(3, || Ok(()));

            // when:
            let start = Instant::now();
            let status = service.get_status(3).await.unwrap();

            // then: the cached value is returned quickly and the cache is untouched
            assert!(start.elapsed() < Duration::from_millis(700));
            assert_eq!(status, cached);
            assert_eq!(
                service.status_cache.read().unwrap().get(&3).unwrap(),
                &cached
            );
        });
    }

    #[test]
    fn status_timeout_with_empty_queue_blocks_once_to_fill_cache() {
        test_runtime().block_on(async {
            // given: a single device stalling a bit past the read timeout
            let service = service_with(vec![Arc::new(StubDevice::new(
                "KrakenX3",
                Duration::from_millis(700),
            ))]);
            service.get_devices().await.unwrap();

            // when: no cache yet, the long read is awaited this one time
            let status = service.get_status(1).await.unwrap();

            // then:
            assert_eq!(status[0].0, "Liquid temperature");
            assert!(service.status_cache.read().unwrap().contains_key(&1));
        });
    }

    #[test]
    fn successful_status_read_refreshes_the_cache() {
        test_runtime().block_on(async {
            let service = service_with(vec![Arc::new(StubDevice::new("KrakenX3", Duration::ZERO))]);
            service.get_devices().await.unwrap();
            let status = service.get_status(1).await.unwrap();
            assert_eq!(
                service.status_cache.read().unwrap().get(&1).unwrap(),
                &status
            );
        });
    }

    #[test]
    fn legacy690_downgrade_rebinds_the_device() {
        test_runtime().block_on(async {
            // given: a modern 690 device
            let service = service_with(vec![Arc::new(StubDevice::new(
                DRIVER_MODERN_690,
                Duration::ZERO,
            ))]);
            service.get_devices().await.unwrap();

            // when:
            let response = service.set_device_as_legacy690(1).await.unwrap();

            // then:
            assert_eq!(response.device_type, DRIVER_LEGACY_690);

            // and a second call on the now-legacy device is answered with the
            // same body:
            let second_response = service.set_device_as_legacy690(1).await.unwrap();
            assert_eq!(second_response.device_type, DRIVER_LEGACY_690);
        });
    }

    #[test]
    fn legacy690_on_other_driver_is_an_invalid_state() {
        test_runtime().block_on(async {
            let service = service_with(vec![Arc::new(StubDevice::new("KrakenX3", Duration::ZERO))]);
            service.get_devices().await.unwrap();
            let result = service.set_device_as_legacy690(1).await;
            assert!(matches!(result, Err(BackendError::InvalidState(_))));
        });
    }

    #[test]
    fn unknown_device_id_is_not_found() {
        test_runtime().block_on(async {
            let service = service_with(vec![]);
            service.get_devices().await.unwrap();
            let result = service.get_status(8).await;
            assert!(matches!(result, Err(BackendError::DeviceNotFound(8))));
        });
    }

    #[test]
    fn shutdown_reinitializes_psu_devices() {
        test_runtime().block_on(async {
            // given:
            let psu = Arc::new(StubDevice::new("CorsairHidPsu", Duration::ZERO));
            let other = Arc::new(StubDevice::new("KrakenX3", Duration::ZERO));
            let service = service_with(vec![psu.clone(), other.clone()]);
            service.get_devices().await.unwrap();

            // when:
            service.shutdown().await;

            // then: only the PSU got its fan control handed back to firmware
            assert_eq!(psu.initialize_calls.load(Ordering::SeqCst), 1);
            assert_eq!(other.initialize_calls.load(Ordering::SeqCst), 0);
        });
    }
}
