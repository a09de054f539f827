// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 NCAR EOL ISF

//! Abstract byte pipe (§4.5), grounded on
//! `original_source/dsm/class/IOChannel.cc` and `ConnectionRequester.h`:
//! one trait covering every concrete transport (`FileSet`, `Socket`,
//! `McSocket`), plus a connect/disconnect callback the owning stream
//! implements instead of polling.

use std::io;

/// Notified when an [`IOChannel`]'s underlying connection comes up or goes
/// down. The original's `dsm::ConnectionRequester` interface, carried
/// through as a Rust trait rather than a virtual base with empty defaults.
pub trait ConnectionRequester: Send + Sync {
    fn connected(&self) {}
    fn disconnected(&self) {}
}

/// Abstract byte pipe underlying a framed stream (§4.5). Implementors are
/// `FileSet`, `Socket`, and `McSocket`.
pub trait IOChannel: Send {
    /// Begins (re)establishing the channel's underlying connection,
    /// notifying `requester` asynchronously. For channels that are already
    /// connected (e.g. an accepted `Socket`) this may call back
    /// synchronously.
    fn request_connection(&mut self, requester: &dyn ConnectionRequester) -> io::Result<()>;

    /// Non-blocking best-effort read; `Ok(0)` means no data currently
    /// available, not EOF (callers distinguish via a separate `is_eof`
    /// check where the concrete channel exposes one).
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn close(&mut self) -> io::Result<()>;

    /// A short, human-readable identity for logging (path, peer address).
    fn name(&self) -> String;

    /// Produces a fresh, disconnected channel carrying the same
    /// configuration as `self` (§4.5: `{request_connection, read, write,
    /// close, clone}`) — the "virtual constructor" `IOChannel::clone()` /
    /// `FileSet::clone()` / `RawSampleOutputStream::clone()` supply in
    /// `original_source/dsm/class/`. A reconnecting stream calls this to
    /// retry with a new instance instead of the one that just failed.
    fn clone_channel(&self) -> Box<dyn IOChannel>;
}
