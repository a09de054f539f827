// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 NCAR EOL ISF

//! `SensorOpener`: a worker thread draining a condvar-protected retry
//! queue, calling each sensor's blocking `open()` with exponential backoff
//! (§4.6), following the `parking_lot::{Mutex,Condvar}`-guarded queue
//! pattern `hdds::core::rt::merger` uses for its reader list, applied here
//! to a work queue instead of a broadcast list.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::TransportError;

use super::handler::FailedSensor;

struct PendingOpen {
    sensor: FailedSensor,
    next_attempt_at: Instant,
    backoff: Duration,
}

struct Shared {
    queue: Mutex<VecDeque<PendingOpen>>,
    cv: Condvar,
    shutdown: AtomicBool,
    initial_backoff: Duration,
    max_backoff: Duration,
    /// Sensors whose `open()` returned `NonRetryable` and were therefore
    /// dropped here rather than requeued (§4.6: FAILED is terminal).
    permanently_failed: AtomicUsize,
}

/// Reopened sensors ready to be handed back to
/// [`super::handler::SensorHandler::register`].
pub struct ReopenedSensor {
    pub device: Box<dyn super::IODevice>,
    pub scanner: Box<dyn super::SampleScanner>,
    pub source: Arc<crate::source::SampleSource>,
}

/// Worker thread owning the reopen queue (§4.6). On success it pushes the
/// device onto `reopened` for the handler to re-register; on failure it
/// requeues with the backoff doubled, capped at `max_backoff`.
pub struct SensorOpener {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl SensorOpener {
    pub fn new(
        initial_backoff: Duration,
        max_backoff: Duration,
        reopened: crossbeam::channel::Sender<ReopenedSensor>,
        incoming: crossbeam::channel::Receiver<FailedSensor>,
    ) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            initial_backoff,
            max_backoff,
            permanently_failed: AtomicUsize::new(0),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("nidas-opener".into())
            .spawn(move || Self::run(worker_shared, reopened, incoming))
            .expect("failed to spawn opener worker thread");

        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Queues a failed sensor for an immediate first retry attempt.
    pub fn enqueue(&self, sensor: FailedSensor) {
        let pending = PendingOpen {
            sensor,
            next_attempt_at: Instant::now(),
            backoff: self.shared.initial_backoff,
        };
        self.shared.queue.lock().push_back(pending);
        self.shared.cv.notify_one();
    }

    pub fn pending_count(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Number of sensors whose `open()` returned a non-retryable error and
    /// were therefore moved to the terminal FAILED state instead of being
    /// requeued (§4.6).
    pub fn permanently_failed_count(&self) -> usize {
        self.shared.permanently_failed.load(Ordering::SeqCst)
    }

    pub fn shutdown(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.cv.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    fn run(
        shared: Arc<Shared>,
        reopened: crossbeam::channel::Sender<ReopenedSensor>,
        incoming: crossbeam::channel::Receiver<FailedSensor>,
    ) {
        loop {
            while let Ok(failed) = incoming.try_recv() {
                let pending = PendingOpen {
                    sensor: failed,
                    next_attempt_at: Instant::now(),
                    backoff: shared.initial_backoff,
                };
                shared.queue.lock().push_back(pending);
                shared.cv.notify_one();
            }

            let mut queue = shared.queue.lock();
            if shared.shutdown.load(Ordering::SeqCst) {
                return;
            }

            let now = Instant::now();
            let due_index = queue.iter().position(|p| p.next_attempt_at <= now);

            let Some(idx) = due_index else {
                shared.cv.wait_for(&mut queue, Duration::from_millis(100));
                continue;
            };

            let mut pending = queue.remove(idx).unwrap();
            drop(queue);

            match pending.sensor.device.open() {
                Ok(()) => {
                    let _ = reopened.send(ReopenedSensor {
                        device: pending.sensor.device,
                        scanner: pending.sensor.scanner,
                        source: pending.sensor.source,
                    });
                }
                Err(TransportError::NonRetryable(reason)) => {
                    log::error!("sensor permanently failed to open, transitioning to FAILED: {reason}");
                    shared.permanently_failed.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    log::warn!("sensor open failed, retrying: {e}");
                    pending.backoff = (pending.backoff * 2).min(shared.max_backoff);
                    pending.next_attempt_at = Instant::now() + pending.backoff;
                    shared.queue.lock().push_back(pending);
                }
            }
        }
    }
}

impl Drop for SensorOpener {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.cv.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::RawSample;
    use crate::sensor::{IODevice, SampleScanner};
    use crate::source::SampleSource;
    use std::sync::atomic::AtomicUsize;

    struct FlakyDevice {
        attempts: Arc<AtomicUsize>,
        succeed_on: usize,
    }

    impl IODevice for FlakyDevice {
        fn read_fd(&self) -> Option<std::os::unix::io::RawFd> {
            None
        }
        fn write_fd(&self) -> Option<std::os::unix::io::RawFd> {
            None
        }
        fn open(&mut self) -> Result<(), TransportError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.succeed_on {
                Ok(())
            } else {
                Err(TransportError::Recoverable("not yet".into()))
            }
        }
        fn close(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct AlwaysNonRetryableDevice {
        attempts: Arc<AtomicUsize>,
    }

    impl IODevice for AlwaysNonRetryableDevice {
        fn read_fd(&self) -> Option<std::os::unix::io::RawFd> {
            None
        }
        fn write_fd(&self) -> Option<std::os::unix::io::RawFd> {
            None
        }
        fn open(&mut self) -> Result<(), TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::NonRetryable("misconfigured device".into()))
        }
        fn close(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct NoopScanner;
    impl SampleScanner for NoopScanner {
        fn scan(&mut self, _buf: &[u8], _out: &mut Vec<RawSample>) -> usize {
            0
        }
    }

    #[test]
    fn retries_until_open_succeeds() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let (failed_tx, failed_rx) = crossbeam::channel::unbounded();
        let (reopened_tx, reopened_rx) = crossbeam::channel::unbounded();

        let mut opener = SensorOpener::new(
            Duration::from_millis(5),
            Duration::from_millis(50),
            reopened_tx,
            failed_rx,
        );

        failed_tx
            .send(FailedSensor {
                device: Box::new(FlakyDevice {
                    attempts: attempts.clone(),
                    succeed_on: 3,
                }),
                scanner: Box::new(NoopScanner),
                source: Arc::new(SampleSource::new()),
            })
            .unwrap();

        let reopened = reopened_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let _ = reopened.device;
        assert!(attempts.load(Ordering::SeqCst) >= 3);
        opener.shutdown();
    }

    #[test]
    fn non_retryable_open_error_reaches_failed_without_requeuing() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let (failed_tx, failed_rx) = crossbeam::channel::unbounded();
        let (reopened_tx, reopened_rx) = crossbeam::channel::unbounded();

        let mut opener = SensorOpener::new(
            Duration::from_millis(5),
            Duration::from_millis(50),
            reopened_tx,
            failed_rx,
        );

        failed_tx
            .send(FailedSensor {
                device: Box::new(AlwaysNonRetryableDevice {
                    attempts: attempts.clone(),
                }),
                scanner: Box::new(NoopScanner),
                source: Arc::new(SampleSource::new()),
            })
            .unwrap();

        // Give the worker time to observe and process the failure.
        std::thread::sleep(Duration::from_millis(200));

        assert_eq!(opener.permanently_failed_count(), 1);
        assert_eq!(opener.pending_count(), 0, "a non-retryable failure must not be requeued");
        assert_eq!(attempts.load(Ordering::SeqCst), 1, "FAILED is terminal, open() is never retried");
        assert!(reopened_rx.try_recv().is_err());
        opener.shutdown();
    }
}
