// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 NCAR EOL ISF

//! Per-(type, size-bucket) free list with lock-free push/pop on the hot
//! path (§4.1). Bucket capacities double (1, 2, 4, ... elements), mirroring
//! `hdds::core::rt::slabpool::SlabPool`'s size-class bitmap allocator —
//! this version swaps the hand-rolled atomic bitmap for
//! `crossbeam::queue::ArrayQueue`, a bounded lock-free MPMC ring that gives
//! the same reserve/release guarantees without unsafe pointer arithmetic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use dashmap::DashMap;

use crate::error::PoolError;
use crate::sample::{bucket_index, RawSample, SampleId, SampleType};

/// Maximum number of buffers retained per bucket before surplus releases
/// go straight to the heap (§4.1: "a pool never grows unbounded").
const HIGH_WATER_MARK: usize = 64;

/// Sentinel bucket id for payloads too large to pool (the "wide variant"
/// heap-release path, §3/§4.1).
const UNPOOLED_BUCKET: u32 = u32::MAX;

struct Bucket {
    free: ArrayQueue<Vec<u8>>,
    cap_elems: usize,
    retained: AtomicUsize,
    high_water: AtomicUsize,
}

impl Bucket {
    fn new(cap_elems: usize) -> Self {
        Self {
            free: ArrayQueue::new(HIGH_WATER_MARK),
            cap_elems,
            retained: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
        }
    }
}

/// Process-wide (or per-test-instance) pool of reusable sample buffers.
pub struct SamplePool {
    buckets: DashMap<(SampleType, u32), Arc<Bucket>>,
}

impl SamplePool {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Returns a [`RawSample`] with capacity for at least `nelem` elements
    /// of `ty`, refcount implicitly 1 (it is not yet an `Arc`). Non-blocking
    /// and lock-free when the target bucket already has a free buffer.
    pub fn get_sample(
        self: &Arc<Self>,
        ty: SampleType,
        nelem: usize,
    ) -> Result<RawSample, PoolError> {
        self.get_sample_with_id(ty, nelem, SampleId(0), 0)
    }

    pub fn get_sample_with_id(
        self: &Arc<Self>,
        ty: SampleType,
        nelem: usize,
        id: SampleId,
        time: i64,
    ) -> Result<RawSample, PoolError> {
        let needed_bytes = nelem * ty.elem_size();

        if needed_bytes > crate::config::MAX_SMALL_PAYLOAD_BYTES {
            // Wide variant: never pooled, always heap-allocated/freed directly.
            let buf = vec![0u8; needed_bytes];
            return Ok(RawSample {
                time,
                id,
                ty,
                nelem,
                buf,
                bucket: UNPOOLED_BUCKET,
                pool: Arc::clone(self),
            });
        }

        let bucket_idx = bucket_index(nelem);
        let cap_elems = 1usize << bucket_idx;
        let bucket = self
            .buckets
            .entry((ty, bucket_idx))
            .or_insert_with(|| Arc::new(Bucket::new(cap_elems)))
            .clone();

        let buf = match bucket.free.pop() {
            Some(buf) => {
                bucket.retained.fetch_sub(1, Ordering::Relaxed);
                buf
            }
            None => vec![0u8; cap_elems * ty.elem_size()],
        };

        Ok(RawSample {
            time,
            id,
            ty,
            nelem,
            buf,
            bucket: bucket_idx,
            pool: Arc::clone(self),
        })
    }

    /// Called from [`crate::sample::SampleInner`]'s `Drop` impl when the
    /// last reference to a sample is released.
    pub(crate) fn release_buffer(&self, ty: SampleType, bucket_idx: u32, buf: Vec<u8>) {
        if bucket_idx == UNPOOLED_BUCKET {
            return; // heap release: drop does the work
        }
        if let Some(bucket) = self.buckets.get(&(ty, bucket_idx)) {
            if bucket.free.push(buf).is_ok() {
                let retained = bucket.retained.fetch_add(1, Ordering::Relaxed) + 1;
                bucket
                    .high_water
                    .fetch_max(retained, Ordering::Relaxed);
            }
            // queue full: buffer drops, pool stays bounded
        }
    }

    /// Number of buffers currently retained in a bucket (test/introspection
    /// use — backs the "pool conservation" testable property, §8).
    pub fn retained_count(&self, ty: SampleType, nelem: usize) -> usize {
        let bucket_idx = bucket_index(nelem);
        self.buckets
            .get(&(ty, bucket_idx))
            .map(|b| b.retained.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// High-water mark reached by a bucket so far.
    pub fn high_water_mark(&self, ty: SampleType, nelem: usize) -> usize {
        let bucket_idx = bucket_index(nelem);
        self.buckets
            .get(&(ty, bucket_idx))
            .map(|b| b.high_water.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl Default for SamplePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pool_acquisition_then_hit() {
        // Scenario 1: pool empty for bucket[1024 f32].
        let pool = Arc::new(SamplePool::new());
        let raw = pool.get_sample(SampleType::F32, 500).unwrap();
        assert!(raw.len() >= 500);
        let sample = raw.freeze();
        assert_eq!(sample.strong_count(), 1);
        drop(sample);

        // Second get_sample should reuse the just-released buffer.
        assert_eq!(pool.retained_count(SampleType::F32, 500), 1);
        let raw2 = pool.get_sample(SampleType::F32, 500).unwrap();
        assert!(raw2.len() >= 500);
        assert_eq!(pool.retained_count(SampleType::F32, 500), 0);
    }

    #[test]
    fn pool_conservation_after_many_acquire_release_pairs() {
        let pool = Arc::new(SamplePool::new());
        for _ in 0..1000 {
            let raw = pool.get_sample(SampleType::I32, 37).unwrap();
            let sample = raw.freeze();
            drop(sample);
        }
        assert!(pool.high_water_mark(SampleType::I32, 37) <= HIGH_WATER_MARK);
        assert_eq!(pool.retained_count(SampleType::I32, 37), 1);
    }

    #[test]
    fn oversized_payload_is_not_pooled() {
        let pool = Arc::new(SamplePool::new());
        let raw = pool
            .get_sample(SampleType::U8, crate::config::MAX_SMALL_PAYLOAD_BYTES + 1)
            .unwrap();
        let sample = raw.freeze();
        drop(sample);
        assert_eq!(pool.retained_count(SampleType::U8, 1), 0);
    }
}
