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

use crate::device::{DeviceInfo, Status};
use crate::repositories::liquidctl::backend_client::DeviceProperties;
use crate::repositories::liquidctl::base_driver::BaseDriver;
use crate::repositories::liquidctl::supported_devices::commander_pro::CommanderProSupport;
use crate::repositories::liquidctl::supported_devices::corsair_hid_psu::CorsairHidPsuSupport;
use crate::repositories::liquidctl::supported_devices::device_support::{DeviceSupport, StatusMap};
use crate::repositories::liquidctl::supported_devices::kraken2::Kraken2Support;
use crate::repositories::liquidctl::supported_devices::kraken_x3::KrakenX3Support;
use crate::repositories::liquidctl::supported_devices::kraken_z3::KrakenZ3Support;
use crate::repositories::liquidctl::supported_devices::legacy_690_lc::Legacy690LcSupport;
use crate::repositories::liquidctl::supported_devices::modern_690_lc::Modern690LcSupport;
use crate::repositories::liquidctl::supported_devices::smart_device2::SmartDevice2Support;

/// Dispatches to the per-driver extractor for a given `BaseDriver`.
pub struct DeviceMapper {
    supported_devices: HashMap<BaseDriver, Box<dyn DeviceSupport>>,
}

impl DeviceMapper {
    pub fn new() -> Self {
        let supports: Vec<Box<dyn DeviceSupport>> = vec![
            Box::new(Kraken2Support::new()),
            Box::new(KrakenX3Support::new()),
            Box::new(KrakenZ3Support::new()),
            Box::new(SmartDevice2Support::new()),
            Box::new(CommanderProSupport::new()),
            Box::new(CorsairHidPsuSupport::new()),
            Box::new(Modern690LcSupport::new()),
            Box::new(Legacy690LcSupport::new()),
        ];
        let mut supported_devices = HashMap::new();
        for support in supports {
            supported_devices.insert(support.supported_driver(), support);
        }
        Self { supported_devices }
    }

    pub fn is_device_supported(&self, base_driver: &BaseDriver) -> bool {
        self.supported_devices.contains_key(base_driver)
    }

    pub fn extract_info(
        &self,
        driver_type: &BaseDriver,
        device_index: u8,
        device_props: &DeviceProperties,
    ) -> DeviceInfo {
        self.supported_devices
            .get(driver_type)
            .expect("driver support is verified before mapping")
            .extract_info(device_index, device_props)
    }

    pub fn extract_status(
        &self,
        driver_type: &BaseDriver,
        status_map: &StatusMap,
        device_index: u8,
    ) -> Status {
        self.supported_devices
            .get(driver_type)
            .expect("driver support is verified before mapping")
            .extract_status(status_map, device_index)
    }
}

impl Default for DeviceMapper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn all_base_drivers_have_an_extractor() {
        let mapper = DeviceMapper::new();
        for driver_name in [
            "Kraken2",
            "KrakenX3",
            "KrakenZ3",
            "SmartDevice2",
            "CommanderPro",
            "CorsairHidPsu",
            "Modern690Lc",
            "Legacy690Lc",
        ] {
            let driver = BaseDriver::from_str(driver_name).unwrap();
            assert!(mapper.is_device_supported(&driver), "missing: {driver_name}");
        }
    }

    #[test]
    fn unknown_drivers_are_not_supported() {
        assert!(BaseDriver::from_str("SomeFutureDevice").is_err());
    }
}
