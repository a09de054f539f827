// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 NCAR EOL ISF

//! # nidas — NCAR In-situ Data Acquisition System core
//!
//! Sample pipeline, pooled buffers, time-ordered merge, clock mapping, and
//! framed transport for a distributed sensor data acquisition system.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! | IODevice (C6) -> SampleScanner -> raw Sample (C1)                  |
//! +--------------------------------------------------------------------+
//! | SampleSource / SampleClient fan-out (C2) -- SampleDater (C4)       |
//! +--------------------------------------------------------------------+
//! | SampleSorter (C3) -- time-ordered merge, bounded latency           |
//! +--------------------------------------------------------------------+
//! | Framed Transport (C5): IOChannel (FileSet/Socket/McSocket)         |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key types
//!
//! | Type | Module | Role |
//! |---|---|---|
//! | [`sample::Sample`] / [`sample::RawSample`] | [`sample`] | pooled, typed, time-tagged payload |
//! | [`pool::SamplePool`] | [`pool`] | per-(type,bucket) free list |
//! | [`source::SampleSource`] | [`source`] | pub/sub fan-out graph |
//! | [`sorter::SampleSorter`] | [`sorter`] | bounded-latency time-ordered merge |
//! | [`dater::SampleDater`] | [`dater`] | timetag to wall-clock mapping |
//! | [`transport::OutputStream`] / [`transport::InputStream`] | [`transport`] | framed stream over any [`transport::IOChannel`] |
//! | [`sensor::handler::SensorHandler`] / [`sensor::opener::SensorOpener`] | [`sensor`] | epoll readout + retrying open |

pub mod config;
pub mod dater;
pub mod error;
pub mod pool;
pub mod sample;
pub mod sensor;
pub mod sorter;
pub mod source;
pub mod tag;
pub mod transport;

pub use config::RuntimeConfig;
pub use dater::{DaterStatus, SampleDater};
pub use pool::SamplePool;
pub use sample::{RawSample, Sample, SampleId, SampleType};
pub use sorter::SampleSorter;
pub use source::{SampleClient, SampleSource};
pub use tag::{SampleTag, Variable};
