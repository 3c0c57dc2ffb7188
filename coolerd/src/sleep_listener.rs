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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use log::{error, info};
use zbus::export::ordered_stream::OrderedStreamExt;
use zbus::{Connection, Proxy};

/// Subscribes to the system's sleep/wake signal and exposes the two state
/// flags the main loop acts upon.
pub struct SleepListener {
    preparing_to_sleep: Arc<AtomicBool>,
    resuming: Arc<AtomicBool>,
}

impl SleepListener {
    pub async fn new() -> Result<Self> {
        let listener = Self {
            preparing_to_sleep: Arc::new(AtomicBool::new(false)),
            resuming: Arc::new(AtomicBool::new(false)),
        };
        let conn = match Connection::system().await {
            Ok(conn) => conn,
            Err(err) => {
                // without DBus (containers, odd inits) we simply never pause
                error!("Could not connect to DBUS, the sleep listener will not work: {err}");
                return Ok(listener);
            }
        };
        let proxy = Proxy::new(
            &conn,
            "org.freedesktop.login1",
            "/org/freedesktop/login1",
            "org.freedesktop.login1.Manager",
        )
        .await?;
        let mut sleep_signal = proxy.receive_signal("PrepareForSleep").await?;
        let preparing_to_sleep = Arc::clone(&listener.preparing_to_sleep);
        let resuming = Arc::clone(&listener.resuming);
        tokio::task::spawn(async move {
            while let Some(msg) = sleep_signal.next().await {
                // true when entering sleep, false when waking:
                let to_sleep: bool = match msg.body().deserialize() {
                    Ok(to_sleep) => to_sleep,
                    Err(err) => {
                        error!("Unexpected PrepareForSleep signal body: {err}");
                        continue;
                    }
                };
                if to_sleep {
                    info!("System is going to sleep");
                    preparing_to_sleep.store(true, Ordering::SeqCst);
                } else {
                    info!("System is waking from sleep");
                    resuming.store(true, Ordering::SeqCst);
                }
            }
        });
        Ok(listener)
    }

    pub fn is_resuming(&self) -> bool {
        self.resuming.load(Ordering::SeqCst)
    }

    pub fn resuming(&self, is_resuming: bool) {
        self.resuming.store(is_resuming, Ordering::SeqCst);
    }

    pub fn is_preparing_to_sleep(&self) -> bool {
        self.preparing_to_sleep.load(Ordering::SeqCst)
    }

    pub fn preparing_to_sleep(&self, is_preparing: bool) {
        self.preparing_to_sleep.store(is_preparing, Ordering::SeqCst);
    }
}
