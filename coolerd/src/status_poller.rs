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

use async_trait::async_trait;
use log::{error, trace, warn};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::Repos;

/// Observers are notified after every completed poll tick.
#[async_trait]
pub trait StatusObserver: Send + Sync {
    async fn on_statuses_updated(&self);
}

/// Periodically refreshes the statuses of all repositories in a stable order
/// and notifies the registered observers. Ticks never overlap; when a tick
/// overruns its interval, the next tick is skipped rather than queued.
pub struct StatusPoller {
    repos: Repos,
    observers: RwLock<Vec<Arc<dyn StatusObserver>>>,
    tick_in_progress: AtomicBool,
}

impl StatusPoller {
    pub fn new(repos: Repos) -> Self {
        Self {
            repos,
            observers: RwLock::new(Vec::new()),
            tick_in_progress: AtomicBool::new(false),
        }
    }

    pub async fn register_observer(&self, observer: Arc<dyn StatusObserver>) {
        self.observers.write().await.push(observer);
    }

    pub async fn tick(&self) {
        if self.tick_in_progress.swap(true, Ordering::SeqCst) {
            warn!("Status tick overran its interval, skipping this tick");
            return;
        }
        let start_tick = Instant::now();
        for repo in self.repos.iter() {
            if let Err(err) = repo.update_statuses().await {
                error!(
                    "Error trying to update statuses for the {} repo: {err}",
                    repo.device_type()
                );
            }
        }
        for observer in self.observers.read().await.iter() {
            observer.on_statuses_updated().await;
        }
        trace!("STATUS SNAPSHOT time taken for all devices: {:?}", start_tick.elapsed());
        self.tick_in_progress.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use crate::device::DeviceType;
    use crate::repositories::repository::{DeviceList, Repository};
    use crate::setting::Setting;
    use crate::device::UID;

    struct SlowRepo {
        updates: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl Repository for SlowRepo {
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
            tokio::time::sleep(self.delay).await;
            self.updates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn apply_setting(&self, _device_uid: &UID, _setting: &Setting) -> Result<()> {
            Ok(())
        }
        async fn apply_setting_reset(&self, _device_uid: &UID, _channel_name: &str) -> Result<()> {
            Ok(())
        }
        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
    }

    struct CountingObserver {
        notifications: AtomicUsize,
    }

    #[async_trait]
    impl StatusObserver for CountingObserver {
        async fn on_statuses_updated(&self) {
            self.notifications.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn observers_are_notified_after_each_tick() {
        test_runtime().block_on(async {
            // given:
            let repo = Arc::new(SlowRepo {
                updates: AtomicUsize::new(0),
                delay: Duration::ZERO,
            });
            let poller = StatusPoller::new(Arc::new(vec![repo.clone() as _]));
            let observer = Arc::new(CountingObserver {
                notifications: AtomicUsize::new(0),
            });
            poller.register_observer(observer.clone()).await;

            // when:
            poller.tick().await;
            poller.tick().await;

            // then:
            assert_eq!(repo.updates.load(Ordering::SeqCst), 2);
            assert_eq!(observer.notifications.load(Ordering::SeqCst), 2);
        });
    }

    #[test]
    fn overrunning_tick_causes_the_next_to_be_skipped() {
        test_runtime().block_on(async {
            // given: a repo that takes longer than the tick interval
            let repo = Arc::new(SlowRepo {
                updates: AtomicUsize::new(0),
                delay: Duration::from_millis(300),
            });
            let poller = Arc::new(StatusPoller::new(Arc::new(vec![repo.clone() as _])));

            // when: a second tick fires while the first is still running
            let long_tick = {
                let poller = Arc::clone(&poller);
                tokio::task::spawn(async move { poller.tick().await })
            };
            tokio::time::sleep(Duration::from_millis(50)).await;
            poller.tick().await; // skipped
            long_tick.await.unwrap();

            // then: only the first tick updated the statuses
            assert_eq!(repo.updates.load(Ordering::SeqCst), 1);
        });
    }
}
