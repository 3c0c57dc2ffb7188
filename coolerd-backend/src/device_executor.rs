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
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;
use log::{debug, error};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::models::DeviceId;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Device job timed out")]
    Timeout,

    #[error("Device job was cancelled")]
    Cancelled,

    #[error("Device job panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Failed(String),
}

type JobFn = Box<dyn FnOnce() + Send + 'static>;

enum WorkerMessage {
    Job { run: JobFn, cancelled: Arc<AtomicBool> },
    Quit,
}

struct DeviceChannel {
    sender: Sender<WorkerMessage>,
    // jobs submitted but not yet picked up by the worker:
    queued: Arc<AtomicUsize>,
    worker: Option<JoinHandle<()>>,
}

/// A handle to a job submitted to a device worker.
///
/// The result is delivered through a oneshot; `result` waits for it with a
/// hard timeout and cancels the job when the timeout elapses, so the worker
/// never executes stale work. A late result of an already-running job is
/// simply discarded.
pub struct JobHandle<T> {
    receiver: oneshot::Receiver<Result<T, JobError>>,
    cancelled: Arc<AtomicBool>,
}

impl<T> JobHandle<T> {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub async fn result(self, timeout: Duration) -> Result<T, JobError> {
        match tokio::time::timeout(timeout, self.receiver).await {
            Ok(Ok(job_result)) => job_result,
            // sender dropped without a result means the executor shut down:
            Ok(Err(_)) => Err(JobError::Cancelled),
            Err(_) => {
                self.cancelled.store(true, Ordering::SeqCst);
                Err(JobError::Timeout)
            }
        }
    }
}

/// Simultaneous communication with a single device results in mangled data,
/// so each device gets its own job queue consumed by a dedicated worker
/// thread. Workers for different devices run in parallel, which is a big
/// speedup for people with multiple devices, while communication per device
/// stays strictly serialized in submission order.
#[derive(Default)]
pub struct DeviceExecutor {
    device_channels: HashMap<DeviceId, DeviceChannel>,
}

impl DeviceExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates one queue and one worker per device. Idempotent, called once
    /// after device discovery.
    pub fn set_number_of_devices(&mut self, number_of_devices: u8) {
        if number_of_devices < 1 || !self.device_channels.is_empty() {
            return;
        }
        for device_id in 1..=number_of_devices {
            let (sender, receiver) = std::sync::mpsc::channel::<WorkerMessage>();
            let queued = Arc::new(AtomicUsize::new(0));
            let worker_queued = Arc::clone(&queued);
            let worker = std::thread::Builder::new()
                .name(format!("device-worker-{device_id}"))
                .spawn(move || Self::queue_worker(&receiver, &worker_queued))
                .expect("OS should be able to spawn a thread");
            self.device_channels.insert(
                device_id,
                DeviceChannel {
                    sender,
                    queued,
                    worker: Some(worker),
                },
            );
        }
        debug!("Device workers started: {number_of_devices}");
    }

    fn queue_worker(receiver: &Receiver<WorkerMessage>, queued: &Arc<AtomicUsize>) {
        while let Ok(message) = receiver.recv() {
            match message {
                WorkerMessage::Job { run, cancelled } => {
                    queued.fetch_sub(1, Ordering::SeqCst);
                    if cancelled.load(Ordering::SeqCst) {
                        continue;
                    }
                    run();
                }
                WorkerMessage::Quit => return,
            }
        }
    }

    /// Enqueues a blocking function on the device's queue and returns a
    /// handle to await the result. Jobs on the same device execute strictly
    /// in submission order; a panic inside the job is captured into the
    /// handle and the worker continues.
    pub fn submit<T, F>(&self, device_id: DeviceId, job_fn: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = JobHandle {
            receiver: rx,
            cancelled: Arc::clone(&cancelled),
        };
        let run: JobFn = Box::new(move || {
            let job_result = match std::panic::catch_unwind(AssertUnwindSafe(job_fn)) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(JobError::Failed(format!("{err:#}"))),
                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(ToString::to_string)
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!("Panic in device job: {msg}");
                    Err(JobError::Panicked(msg))
                }
            };
            // receiver may be gone when the caller timed out, that's fine:
            let _ = tx.send(job_result);
        });
        let Some(channel) = self.device_channels.get(&device_id) else {
            // submission before set_number_of_devices is a programming error,
            // deliver it as a failed job instead of panicking the server
            error!("No worker exists for device: {device_id}");
            return handle;
        };
        channel.queued.fetch_add(1, Ordering::SeqCst);
        if channel.sender.send(WorkerMessage::Job { run, cancelled }).is_err() {
            channel.queued.fetch_sub(1, Ordering::SeqCst);
            error!("Device worker for device {device_id} is no longer running");
        }
        handle
    }

    /// Whether any jobs are waiting in the device's queue. Does not include
    /// the job the worker is currently executing.
    pub fn device_queue_empty(&self, device_id: DeviceId) -> bool {
        self.device_channels
            .get(&device_id)
            .map_or(true, |channel| channel.queued.load(Ordering::SeqCst) == 0)
    }

    /// Posts a poison message per queue and joins all workers.
    pub fn shutdown(&mut self) {
        for channel in self.device_channels.values() {
            let _ = channel.sender.send(WorkerMessage::Quit);
        }
        for channel in self.device_channels.values_mut() {
            if let Some(worker) = channel.worker.take() {
                if worker.join().is_err() {
                    error!("Device worker did not shut down cleanly");
                }
            }
        }
        self.device_channels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::Mutex;

    fn test_runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn jobs_execute_in_submission_order_per_device() {
        test_runtime().block_on(async {
            // given:
            let mut executor = DeviceExecutor::new();
            executor.set_number_of_devices(2);
            let order: Arc<Mutex<Vec<(u8, usize)>>> = Arc::new(Mutex::new(Vec::new()));

            // when:
            let mut handles = Vec::new();
            for job_number in 0..20 {
                for device_id in 1..=2 {
                    let order = Arc::clone(&order);
                    handles.push(executor.submit(device_id, move || {
                        order.lock().unwrap().push((device_id, job_number));
                        Ok(())
                    }));
                }
            }
            for handle in handles {
                handle.result(Duration::from_secs(5)).await.unwrap();
            }

            // then: each device observed its own jobs strictly in order
            let observed = order.lock().unwrap();
            for device_id in 1..=2 {
                let per_device: Vec<usize> = observed
                    .iter()
                    .filter(|(dev, _)| *dev == device_id)
                    .map(|(_, job)| *job)
                    .collect();
                assert_eq!(per_device, (0..20).collect::<Vec<usize>>());
            }
            executor.shutdown();
        });
    }

    #[test]
    fn job_timeout_cancels_and_worker_continues() {
        test_runtime().block_on(async {
            // given:
            let mut executor = DeviceExecutor::new();
            executor.set_number_of_devices(1);

            // when: a slow job times out
            let slow = executor.submit(1, || {
                std::thread::sleep(Duration::from_millis(500));
                Ok(1)
            });
            let result = slow.result(Duration::from_millis(50)).await;
            assert!(matches!(result, Err(JobError::Timeout)));

            // then: the worker still picks up the next job
            let next = executor.submit(1, || Ok(2));
            assert_eq!(next.result(Duration::from_secs(5)).await.unwrap(), 2);
            executor.shutdown();
        });
    }

    #[test]
    fn cancelled_queued_job_is_skipped() {
        test_runtime().block_on(async {
            // given: a busy worker with a queued job behind it
            let mut executor = DeviceExecutor::new();
            executor.set_number_of_devices(1);
            let executed = Arc::new(AtomicBool::new(false));
            let blocker = executor.submit(1, || {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            });
            let was_executed = Arc::clone(&executed);
            let queued = executor.submit(1, move || {
                was_executed.store(true, Ordering::SeqCst);
                Ok(())
            });
            assert!(!executor.device_queue_empty(1));

            // when:
            queued.cancel();
            blocker.result(Duration::from_secs(5)).await.unwrap();
            let result = queued.result(Duration::from_millis(500)).await;

            // then:
            assert!(result.is_err());
            assert!(!executed.load(Ordering::SeqCst));
            executor.shutdown();
        });
    }

    #[test]
    fn job_panic_is_captured_into_the_handle() {
        test_runtime().block_on(async {
            // given:
            let mut executor = DeviceExecutor::new();
            executor.set_number_of_devices(1);

            // when:
            let panicking = executor.submit::<(), _>(1, || panic!("device exploded"));
            let result = panicking.result(Duration::from_secs(5)).await;

            // then:
            assert!(matches!(result, Err(JobError::Panicked(msg)) if msg.contains("device exploded")));
            // and the worker survives:
            let next = executor.submit(1, || Ok(42));
            assert_eq!(next.result(Duration::from_secs(5)).await.unwrap(), 42);
            executor.shutdown();
        });
    }

    #[test]
    fn failed_job_propagates_the_error() {
        test_runtime().block_on(async {
            let mut executor = DeviceExecutor::new();
            executor.set_number_of_devices(1);
            let failing = executor.submit::<(), _>(1, || Err(anyhow!("no such channel")));
            let result = failing.result(Duration::from_secs(5)).await;
            assert!(matches!(result, Err(JobError::Failed(msg)) if msg.contains("no such channel")));
            executor.shutdown();
        });
    }

    #[test]
    fn device_queue_empty_reflects_waiting_jobs() {
        test_runtime().block_on(async {
            let mut executor = DeviceExecutor::new();
            executor.set_number_of_devices(1);
            assert!(executor.device_queue_empty(1));
            let blocker = executor.submit(1, || {
                std::thread::sleep(Duration::from_millis(100));
                Ok(())
            });
            let waiting = executor.submit(1, || Ok(()));
            assert!(!executor.device_queue_empty(1));
            blocker.result(Duration::from_secs(5)).await.unwrap();
            waiting.result(Duration::from_secs(5)).await.unwrap();
            assert!(executor.device_queue_empty(1));
            executor.shutdown();
        });
    }
}
