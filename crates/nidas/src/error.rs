// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 NCAR EOL ISF

//! Error types for the sample pipeline.
//!
//! Each fallible subsystem gets its own enum with a manual `Display`/`Error`
//! impl, the way `hdds::rpc::error::RpcError` is hand-rolled rather than
//! derived with `thiserror` — this crate has no `anyhow`/`thiserror`
//! dependency by design; daemons translate these at their `main()` boundary.

use std::fmt;

/// Errors raised by [`crate::sample`] construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleError {
    /// `dsm_id`, `sensor_id`, or `short_id` exceeded its bit-field range.
    IdOutOfRange { field: &'static str, value: u32, max: u32 },
    /// Requested element count exceeds the per-type maximum.
    LengthExceedsMax { requested: usize, max: usize },
}

impl fmt::Display for SampleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IdOutOfRange { field, value, max } => {
                write!(f, "{field}={value} exceeds maximum {max}")
            }
            Self::LengthExceedsMax { requested, max } => {
                write!(f, "length {requested} exceeds per-type maximum {max}")
            }
        }
    }
}

impl std::error::Error for SampleError {}

/// Errors raised while acquiring or releasing pool buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// No bucket covers the requested size and the heap allocation path
    /// was explicitly disabled (non-retryable path, §4.1 failure semantics).
    Exhausted { requested_bytes: usize },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted { requested_bytes } => {
                write!(f, "sample pool exhausted for {requested_bytes} byte request")
            }
        }
    }
}

impl std::error::Error for PoolError {}

/// Data faults in the on-wire frame format (§7, kind 2 — logged at WARNING,
/// triggers stream resynchronization).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Magic word did not match while scanning for the start of a frame.
    BadMagic { found: u32 },
    /// Declared `length` exceeds the maximum for the frame's `type` tag.
    LengthBoundExceeded { type_tag: u8, length: u32, max: u32 },
    /// `type` byte did not map to a known [`crate::sample::SampleType`].
    UnknownType { type_tag: u8 },
    /// Stream header failed to validate (missing sentinel, bad version).
    HeaderMismatch { reason: &'static str },
    /// Underlying I/O error while reading or writing a frame.
    Io(String),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic { found } => write!(f, "bad frame magic 0x{found:08x}"),
            Self::LengthBoundExceeded { type_tag, length, max } => write!(
                f,
                "frame length {length} exceeds max {max} for type tag {type_tag}"
            ),
            Self::UnknownType { type_tag } => write!(f, "unknown sample type tag {type_tag}"),
            Self::HeaderMismatch { reason } => write!(f, "stream header mismatch: {reason}"),
            Self::Io(msg) => write!(f, "frame I/O error: {msg}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Errors surfaced by [`crate::sorter::SampleSorter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SorterError {
    /// A downstream client returned `false` persistently; the sorter has
    /// stopped draining and memory will grow to its configured cap.
    DownstreamBlocked,
}

impl fmt::Display for SorterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DownstreamBlocked => {
                write!(f, "sorter downstream client persistently rejected samples")
            }
        }
    }
}

impl std::error::Error for SorterError {}

/// Errors surfaced by the framed transport (§4.5 / §4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Frame(FrameError),
    /// Recoverable I/O (§7 kind 1): EOF, refused connection, transient error.
    Recoverable(String),
    /// A device's `open()` returned a non-retryable error (sensor is FAILED).
    NonRetryable(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frame(e) => write!(f, "{e}"),
            Self::Recoverable(msg) => write!(f, "recoverable I/O error: {msg}"),
            Self::NonRetryable(msg) => write!(f, "non-retryable device error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<FrameError> for TransportError {
    fn from(e: FrameError) -> Self {
        Self::Frame(e)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Recoverable(e.to_string())
    }
}
