// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 NCAR EOL ISF

//! Publish/subscribe fan-out graph (§4.2): a [`SampleSource`] holds a
//! copy-on-iterate list of [`SampleClient`] subscribers, the way
//! `hdds::core::rt::merger::TopicMerger` holds its reader list behind a
//! `parking_lot::RwLock` — reconfiguration takes a short write lock, a
//! distribute takes a short read lock to clone the current `Arc` snapshot,
//! then runs lock-free against that snapshot.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::sample::Sample;
use crate::tag::SampleTag;

/// A subscriber to a [`SampleSource`]. `receive` must not block
/// indefinitely or panic across the call; a fatal condition is reported by
/// returning `false` after recording the error on the client's own side
/// (§4.2).
pub trait SampleClient: Send + Sync {
    /// Accepts a sample. Returns `true` on acceptance, `false` as a soft
    /// "transiently unavailable" signal.
    fn receive(&self, sample: &Sample) -> bool;

    /// Called by [`SampleSource::flush`] once all in-flight distributes have
    /// drained. Default no-op for clients with no internal queue.
    fn flush(&self) {}
}

/// How many consecutive `false` returns within how long a window escalate a
/// client to [`ClientStatus::Disconnected`] (§7: "repeated `false` within a
/// window escalates the client to DISCONNECTED").
const REJECTION_THRESHOLD: usize = 5;
const REJECTION_WINDOW: Duration = Duration::from_secs(5);

/// A client's connectivity as tracked by its owning [`SampleSource`] (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Connected,
    /// `receive` returned `false` at least [`REJECTION_THRESHOLD`] times
    /// within [`REJECTION_WINDOW`]; the client's own reconnection strategy
    /// (if any) is responsible for recovering from here.
    Disconnected,
}

/// Per-client rejection bookkeeping behind the source's client list. Reset
/// whenever `receive` returns `true`, or once the window since the first
/// rejection in the run has elapsed.
struct RejectionTracker {
    count: AtomicUsize,
    window_start: RwLock<Option<Instant>>,
    status: RwLock<ClientStatus>,
}

impl RejectionTracker {
    fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            window_start: RwLock::new(None),
            status: RwLock::new(ClientStatus::Connected),
        }
    }

    fn record(&self, accepted: bool) {
        if accepted {
            self.count.store(0, Ordering::Relaxed);
            *self.window_start.write() = None;
            *self.status.write() = ClientStatus::Connected;
            return;
        }

        let now = Instant::now();
        let mut window_start = self.window_start.write();
        let expired = window_start.map(|start| now.duration_since(start) > REJECTION_WINDOW).unwrap_or(true);
        if expired {
            *window_start = Some(now);
            self.count.store(1, Ordering::Relaxed);
        } else {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
        drop(window_start);

        if self.count.load(Ordering::Relaxed) >= REJECTION_THRESHOLD {
            *self.status.write() = ClientStatus::Disconnected;
        }
    }

    fn status(&self) -> ClientStatus {
        *self.status.read()
    }
}

/// A node in the connection graph that produces samples and fans them out
/// to zero or more clients (§4.2). Ordering of clients follows insertion
/// order; ties in delivery are irrelevant since delivery is synchronous.
pub struct SampleSource {
    tags: Vec<SampleTag>,
    clients: RwLock<Vec<Arc<dyn SampleClient>>>,
    rejections: RwLock<Vec<(Arc<dyn SampleClient>, Arc<RejectionTracker>)>>,
}

impl SampleSource {
    pub fn new() -> Self {
        Self {
            tags: Vec::new(),
            clients: RwLock::new(Vec::new()),
            rejections: RwLock::new(Vec::new()),
        }
    }

    pub fn add_tag(&mut self, tag: SampleTag) {
        self.tags.push(tag);
    }

    pub fn tags(&self) -> &[SampleTag] {
        &self.tags
    }

    /// Adds `client` to the end of the subscriber list. Idempotent only in
    /// the sense of `Arc::ptr_eq` — the same trait object added twice is
    /// delivered to twice, matching `TopicMerger::add_reader`'s semantics of
    /// "the caller controls handle identity".
    pub fn add_client(&self, client: Arc<dyn SampleClient>) {
        self.rejections.write().push((Arc::clone(&client), Arc::new(RejectionTracker::new())));
        self.clients.write().push(client);
    }

    /// Removes every client pointer-equal to `client`.
    pub fn remove_client(&self, client: &Arc<dyn SampleClient>) {
        self.clients
            .write()
            .retain(|c| !Arc::ptr_eq(c, client));
        self.rejections.write().retain(|(c, _)| !Arc::ptr_eq(c, client));
    }

    pub fn remove_all_clients(&self) {
        self.clients.write().clear();
        self.rejections.write().clear();
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Current connectivity of `client` as tracked from its `receive`
    /// return values (§7). Returns `None` if `client` isn't currently
    /// registered on this source.
    pub fn client_status(&self, client: &Arc<dyn SampleClient>) -> Option<ClientStatus> {
        self.rejections
            .read()
            .iter()
            .find(|(c, _)| Arc::ptr_eq(c, client))
            .map(|(_, tracker)| tracker.status())
    }

    /// Synchronously fans `sample` out to every current client, then drops
    /// the source's own reference (§4.1 `distribute`/§4.2). A client that
    /// wants to retain the sample past `receive` returning must have cloned
    /// its own `Sample` handle (`hold()`), since `Sample::clone` is cheap
    /// (`Arc` bump).
    ///
    /// The client list is snapshotted under a short read lock before the
    /// loop runs, so `add_client`/`remove_client` calls made concurrently by
    /// another thread never block or see a torn fan-out (§4.2: "copy-on-
    /// iterate").
    ///
    /// Every `receive` path that returns `false` is recorded against that
    /// client's rejection tracker; repeated `false` within a window
    /// escalates the client to [`ClientStatus::Disconnected`], queryable via
    /// [`SampleSource::client_status`] (§7).
    pub fn distribute(&self, sample: Sample) {
        let snapshot = self.rejections.read().clone();
        for (client, tracker) in &snapshot {
            let accepted = client.receive(&sample);
            tracker.record(accepted);
            if !accepted && tracker.status() == ClientStatus::Disconnected {
                log::warn!("sample client escalated to DISCONNECTED after repeated rejection");
            }
        }
    }

    /// Blocks until every client has observed the effects of all samples
    /// distributed so far. Clients with no internal queue (the common case)
    /// return immediately from their `flush` no-op.
    pub fn flush(&self) {
        let snapshot = self.clients.read().clone();
        for client in &snapshot {
            client.flush();
        }
    }
}

impl Default for SampleSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::SamplePool;
    use crate::sample::{SampleId, SampleType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingClient {
        count: AtomicUsize,
        accept: bool,
    }

    impl SampleClient for CountingClient {
        fn receive(&self, _sample: &Sample) -> bool {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.accept
        }
    }

    fn make_sample(pool: &Arc<SamplePool>) -> Sample {
        let mut raw = pool.get_sample(SampleType::I32, 4).unwrap();
        raw.set_id(SampleId::new(1, 1, 0).unwrap());
        raw.freeze()
    }

    #[test]
    fn distribute_reaches_every_client_in_insertion_order() {
        let source = SampleSource::new();
        let a = Arc::new(CountingClient { count: AtomicUsize::new(0), accept: true });
        let b = Arc::new(CountingClient { count: AtomicUsize::new(0), accept: false });
        source.add_client(a.clone());
        source.add_client(b.clone());

        let pool = Arc::new(SamplePool::new());
        source.distribute(make_sample(&pool));

        assert_eq!(a.count.load(Ordering::SeqCst), 1);
        assert_eq!(b.count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn repeated_rejection_escalates_client_to_disconnected() {
        let source = SampleSource::new();
        let rejecting: Arc<dyn SampleClient> =
            Arc::new(CountingClient { count: AtomicUsize::new(0), accept: false });
        source.add_client(rejecting.clone());

        let pool = Arc::new(SamplePool::new());
        assert_eq!(source.client_status(&rejecting), Some(ClientStatus::Connected));
        for _ in 0..REJECTION_THRESHOLD {
            source.distribute(make_sample(&pool));
        }
        assert_eq!(source.client_status(&rejecting), Some(ClientStatus::Disconnected));
    }

    #[test]
    fn accepted_sample_resets_rejection_tracking() {
        let source = SampleSource::new();
        let flaky = Arc::new(AtomicUsize::new(0));
        struct Flaky {
            calls: Arc<AtomicUsize>,
        }
        impl SampleClient for Flaky {
            fn receive(&self, _sample: &Sample) -> bool {
                // Accepts only the third call, rejecting the rest.
                self.calls.fetch_add(1, Ordering::SeqCst) == 2
            }
        }
        let client: Arc<dyn SampleClient> = Arc::new(Flaky { calls: flaky });
        source.add_client(client.clone());

        let pool = Arc::new(SamplePool::new());
        for _ in 0..REJECTION_THRESHOLD {
            source.distribute(make_sample(&pool));
        }
        assert_eq!(source.client_status(&client), Some(ClientStatus::Connected));
    }

    #[test]
    fn remove_client_drops_future_deliveries() {
        let source = SampleSource::new();
        let a: Arc<dyn SampleClient> = Arc::new(CountingClient { count: AtomicUsize::new(0), accept: true });
        source.add_client(a.clone());
        assert_eq!(source.client_count(), 1);
        source.remove_client(&a);
        assert_eq!(source.client_count(), 0);
    }

    #[test]
    fn sample_survives_past_distribute_if_client_holds_it() {
        let pool = Arc::new(SamplePool::new());
        struct Holder(parking_lot::Mutex<Option<Sample>>);
        impl SampleClient for Holder {
            fn receive(&self, sample: &Sample) -> bool {
                *self.0.lock() = Some(sample.clone());
                true
            }
        }
        let holder = Arc::new(Holder(parking_lot::Mutex::new(None)));
        let source = SampleSource::new();
        source.add_client(holder.clone());
        source.distribute(make_sample(&pool));

        let held = holder.0.lock();
        assert_eq!(held.as_ref().unwrap().strong_count(), 1);
    }
}
