// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 NCAR EOL ISF

//! Framed input/output streams layered on any [`IOChannel`] (§4.5),
//! carrying the state diagram from
//! `hdds::transport::tcp::connection::ConnectionState` up a level: the
//! stream itself — not just its socket — tracks Idle/Connecting/Connected/
//! Reconnecting/Closing/Closed/Failed, since a `FileSet` or `McSocket`
//! channel reconnects by re-running its own connection procedure rather
//! than a raw TCP retry.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::config::HEADER_SENTINEL;
use crate::error::{FrameError, TransportError};
use crate::pool::SamplePool;
use crate::sample::Sample;

use super::frame::{encode_frame, find_next_magic, FrameHeader, FRAME_HEADER_LEN};
use super::iochannel::{ConnectionRequester, IOChannel};
use super::socket::ConnectionState;

/// Recognized keys for the stream header text block (§6). Unknown keys are
/// preserved and ignored, not rejected.
pub const RECOGNIZED_HEADER_KEYS: &[&str] = &[
    "archive-version",
    "software-version",
    "project",
    "system",
    "config",
    "config-version",
];

/// Key/value text block that opens every stream, terminated by a blank line
/// and the sentinel byte `\x04` (§3/§6).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    fields: BTreeMap<String, String>,
}

impl StreamHeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (k, v) in &self.fields {
            out.extend_from_slice(k.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(v.as_bytes());
            out.push(b'\n');
        }
        out.push(b'\n');
        out.push(HEADER_SENTINEL);
        out
    }

    /// Parses a header text block up to and including the sentinel byte.
    /// Returns the header plus the number of bytes consumed from `buf`, or
    /// `None` if the sentinel hasn't arrived yet.
    pub fn try_decode(buf: &[u8]) -> Result<Option<(Self, usize)>, FrameError> {
        let Some(sentinel_pos) = buf.iter().position(|&b| b == HEADER_SENTINEL) else {
            return Ok(None);
        };
        let text = std::str::from_utf8(&buf[..sentinel_pos])
            .map_err(|_| FrameError::HeaderMismatch { reason: "non-utf8 header text" })?;
        let mut fields = BTreeMap::new();
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                return Err(FrameError::HeaderMismatch { reason: "line missing ':' separator" });
            };
            fields.insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(Some((Self { fields }, sentinel_pos + 1)))
    }
}

/// How a bounded output buffers while its channel is reconnecting (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Block the caller once the buffer is full.
    Block,
    /// Drop the oldest buffered bytes to make room for new writes.
    DropOldest,
}

/// Framed writer over any [`IOChannel`] (§4.5). Writes the header exactly
/// once per connection, then frames thereafter.
pub struct OutputStream<C: IOChannel> {
    channel: C,
    state: ConnectionState,
    header: StreamHeader,
    header_written: bool,
    reconnect_buffer: VecDeque<u8>,
    reconnect_buffer_cap: usize,
    backpressure: BackpressurePolicy,
}

impl<C: IOChannel> OutputStream<C> {
    pub fn new(channel: C, header: StreamHeader, reconnect_buffer_cap: usize, backpressure: BackpressurePolicy) -> Self {
        Self {
            channel,
            state: ConnectionState::Idle,
            header,
            header_written: false,
            reconnect_buffer: VecDeque::new(),
            reconnect_buffer_cap,
            backpressure,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connect(&mut self, requester: &dyn ConnectionRequester) -> Result<(), TransportError> {
        self.state = ConnectionState::Connecting;
        self.channel.request_connection(requester)?;
        self.state = ConnectionState::Connected;
        self.header_written = false;
        self.flush_reconnect_buffer()?;
        Ok(())
    }

    fn flush_reconnect_buffer(&mut self) -> Result<(), TransportError> {
        while !self.reconnect_buffer.is_empty() {
            let chunk: Vec<u8> = self.reconnect_buffer.iter().copied().collect();
            let n = self.channel.write(&chunk)?;
            if n == 0 {
                break;
            }
            self.reconnect_buffer.drain(..n);
        }
        Ok(())
    }

    fn write_all_or_buffer(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.state != ConnectionState::Connected {
            self.buffer(data);
            return Ok(());
        }
        match self.channel.write(data) {
            Ok(n) if n == data.len() => Ok(()),
            Ok(n) => {
                self.buffer(&data[n..]);
                Ok(())
            }
            Err(_) => {
                self.state = ConnectionState::Reconnecting;
                self.buffer(data);
                Ok(())
            }
        }
    }

    fn buffer(&mut self, data: &[u8]) {
        self.reconnect_buffer.extend(data.iter().copied());
        while self.reconnect_buffer.len() > self.reconnect_buffer_cap {
            match self.backpressure {
                BackpressurePolicy::DropOldest => {
                    self.reconnect_buffer.pop_front();
                }
                BackpressurePolicy::Block => break,
            }
        }
    }

    /// Writes `sample`, emitting the header first if this is the first
    /// write since the last (re)connect (§4.5 Framed stream: "a header is
    /// emitted exactly once per connection").
    pub fn write_sample(&mut self, sample: &Sample) -> Result<(), TransportError> {
        if !self.header_written {
            let header_bytes = self.header.encode();
            self.write_all_or_buffer(&header_bytes)?;
            self.header_written = true;
        }
        let frame = encode_frame(sample);
        self.write_all_or_buffer(&frame)
    }

    pub fn close(&mut self) -> Result<(), TransportError> {
        self.state = ConnectionState::Closing;
        self.channel.close()?;
        self.state = ConnectionState::Closed;
        Ok(())
    }

    pub fn buffered_bytes(&self) -> usize {
        self.reconnect_buffer.len()
    }
}

/// Framed reader over any [`IOChannel`] (§4.5). Reassembles frames across
/// short reads and resynchronizes on a framing error by scanning forward
/// for the next magic word (§7 kind 2).
pub struct InputStream<C: IOChannel> {
    channel: C,
    pool: Arc<SamplePool>,
    recv_buf: Vec<u8>,
    header: Option<StreamHeader>,
}

impl<C: IOChannel> InputStream<C> {
    pub fn new(channel: C, pool: Arc<SamplePool>) -> Self {
        Self {
            channel,
            pool,
            recv_buf: Vec::new(),
            header: None,
        }
    }

    pub fn header(&self) -> Option<&StreamHeader> {
        self.header.as_ref()
    }

    fn fill(&mut self) -> Result<usize, TransportError> {
        let mut tmp = [0u8; 8192];
        let n = self.channel.read(&mut tmp)?;
        self.recv_buf.extend_from_slice(&tmp[..n]);
        Ok(n)
    }

    /// Reads and validates the stream header if it hasn't arrived yet.
    /// Must be called (and succeed) before the first [`InputStream::read_sample`]
    /// — a sample observed before a header is itself a framing error (§5).
    pub fn ensure_header(&mut self) -> Result<&StreamHeader, TransportError> {
        while self.header.is_none() {
            match StreamHeader::try_decode(&self.recv_buf)? {
                Some((header, consumed)) => {
                    self.recv_buf.drain(..consumed);
                    self.header = Some(header);
                }
                None => {
                    if self.fill()? == 0 {
                        return Err(TransportError::Recoverable("EOF before header completed".into()));
                    }
                }
            }
        }
        Ok(self.header.as_ref().unwrap())
    }

    /// Reads one sample, allocating its payload from `pool` using the
    /// frame's `type`+`length`. Resynchronizes automatically on a framing
    /// error.
    pub fn read_sample(&mut self) -> Result<Sample, TransportError> {
        self.ensure_header()?;
        loop {
            if self.recv_buf.len() < FRAME_HEADER_LEN {
                if self.fill()? == 0 {
                    return Err(TransportError::Recoverable("EOF awaiting frame header".into()));
                }
                continue;
            }

            match FrameHeader::decode(&self.recv_buf[..FRAME_HEADER_LEN]) {
                Ok(header) => {
                    let payload_len = header.length as usize * header.ty.elem_size();
                    let total = FRAME_HEADER_LEN + payload_len;
                    if self.recv_buf.len() < total {
                        if self.fill()? == 0 {
                            return Err(TransportError::Recoverable("EOF mid-frame".into()));
                        }
                        continue;
                    }

                    let mut raw = self
                        .pool
                        .get_sample_with_id(header.ty, header.length as usize, header.id, header.time)
                        .map_err(|_| TransportError::Frame(FrameError::Io("pool exhausted".into())))?;
                    raw.payload_mut()
                        .copy_from_slice(&self.recv_buf[FRAME_HEADER_LEN..total]);
                    self.recv_buf.drain(..total);
                    return Ok(raw.freeze());
                }
                Err(e) => {
                    log::warn!("framing error, resynchronizing: {e}");
                    match find_next_magic(&self.recv_buf[1..]) {
                        Some(offset) => {
                            self.recv_buf.drain(..offset + 1);
                        }
                        None => {
                            self.recv_buf.clear();
                            if self.fill()? == 0 {
                                return Err(TransportError::Frame(e));
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn close(&mut self) -> Result<(), TransportError> {
        self.channel.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{SampleId, SampleType};
    use std::io;

    /// An in-memory, non-reconnecting IOChannel used to exercise the
    /// stream framing logic in isolation from any real transport.
    struct MemChannel {
        inbound: VecDeque<u8>,
        outbound: Vec<u8>,
    }

    impl MemChannel {
        fn new(inbound: Vec<u8>) -> Self {
            Self {
                inbound: inbound.into(),
                outbound: Vec::new(),
            }
        }
    }

    impl IOChannel for MemChannel {
        fn request_connection(&mut self, requester: &dyn ConnectionRequester) -> io::Result<()> {
            requester.connected();
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.inbound.len().min(buf.len());
            for (slot, byte) in buf.iter_mut().zip(self.inbound.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.outbound.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn name(&self) -> String {
            "mem".into()
        }

        fn clone_channel(&self) -> Box<dyn IOChannel> {
            Box::new(MemChannel::new(Vec::new()))
        }
    }

    struct NoopRequester;
    impl ConnectionRequester for NoopRequester {}

    #[test]
    fn header_round_trips_with_sentinel() {
        let mut header = StreamHeader::new();
        header.set("project", "CSET");
        header.set("system", "ISFS");
        let encoded = header.encode();
        let (decoded, consumed) = StreamHeader::try_decode(&encoded).unwrap().unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.get("project"), Some("CSET"));
        assert_eq!(decoded.get("system"), Some("ISFS"));
    }

    #[test]
    fn output_then_input_round_trips_a_sample() {
        let pool = Arc::new(SamplePool::new());
        let mut raw = pool.get_sample(SampleType::I32, 2).unwrap();
        raw.set_time(42);
        raw.set_id(SampleId::new(1, 1, 0).unwrap());
        raw.payload_mut().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let sample = raw.freeze();

        let mut header = StreamHeader::new();
        header.set("project", "CSET");
        let mut out = OutputStream::new(MemChannel::new(Vec::new()), header, 1 << 16, BackpressurePolicy::Block);
        out.connect(&NoopRequester).unwrap();
        out.write_sample(&sample).unwrap();

        let wire = out.channel.outbound.clone();
        let mut input = InputStream::new(MemChannel::new(wire), Arc::clone(&pool));
        let read_back = input.read_sample().unwrap();
        assert_eq!(read_back.id(), sample.id());
        assert_eq!(read_back.time(), 42);
        assert_eq!(read_back.payload(), sample.payload());
    }

    #[test]
    fn resyncs_past_a_corrupted_frame() {
        let pool = Arc::new(SamplePool::new());
        let mut header = StreamHeader::new();
        header.set("project", "CSET");
        let mut wire = header.encode();

        // Garbage bytes that aren't a valid frame, then a real frame.
        wire.extend_from_slice(&[0xAA; 6]);

        let mut raw = pool.get_sample(SampleType::U8, 2).unwrap();
        raw.set_time(99);
        raw.set_id(SampleId::new(2, 2, 0).unwrap());
        raw.payload_mut().copy_from_slice(&[9, 8]);
        let sample = raw.freeze();
        wire.extend_from_slice(&encode_frame(&sample));

        let mut input = InputStream::new(MemChannel::new(wire), pool);
        let recovered = input.read_sample().unwrap();
        assert_eq!(recovered.time(), 99);
        assert_eq!(recovered.payload(), &[9, 8]);
    }
}
