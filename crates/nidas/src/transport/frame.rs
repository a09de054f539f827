// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 NCAR EOL ISF

//! Wire frame codec (§6): magic word, composite id, type tag, time, length,
//! payload, all little-endian, the way `hdds`'s `protocol` codecs use
//! `byteorder` directly rather than a serde-based framework for the hot
//! wire path.

use byteorder::{ByteOrder, LittleEndian};

use crate::config::FRAME_MAGIC;
use crate::error::FrameError;
use crate::sample::{Sample, SampleId, SampleType};

/// Fixed-size portion of a frame header (§6): magic + id + type + pad +
/// time + length.
pub const FRAME_HEADER_LEN: usize = 4 + 4 + 1 + 3 + 8 + 4;

/// Decoded frame header, payload bytes not yet consumed.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub id: SampleId,
    pub ty: SampleType,
    pub time: i64,
    pub length: u32,
}

impl FrameHeader {
    /// Parses a fixed [`FRAME_HEADER_LEN`]-byte header. Does not touch the
    /// payload.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(FrameError::Io("short header read".into()));
        }
        let magic = LittleEndian::read_u32(&buf[0..4]);
        if magic != FRAME_MAGIC {
            return Err(FrameError::BadMagic { found: magic });
        }
        let id = SampleId(LittleEndian::read_u32(&buf[4..8]));
        let type_tag = buf[8];
        let ty = SampleType::from_wire_tag(type_tag)
            .ok_or(FrameError::UnknownType { type_tag })?;
        let time = LittleEndian::read_i64(&buf[12..20]);
        let length = LittleEndian::read_u32(&buf[20..24]);

        let max = ty.max_elements(false) as u32;
        if length > max {
            return Err(FrameError::LengthBoundExceeded {
                type_tag,
                length,
                max,
            });
        }

        Ok(Self { id, ty, time, length })
    }

    /// Encodes the fixed header portion into `out` (payload follows,
    /// written separately by the caller to avoid an extra copy).
    pub fn encode(&self, out: &mut [u8; FRAME_HEADER_LEN]) {
        LittleEndian::write_u32(&mut out[0..4], FRAME_MAGIC);
        LittleEndian::write_u32(&mut out[4..8], self.id.0);
        out[8] = self.ty.wire_tag();
        out[9..12].fill(0);
        LittleEndian::write_i64(&mut out[12..20], self.time);
        LittleEndian::write_u32(&mut out[20..24], self.length);
    }
}

/// Encodes a full frame (header + payload) for `sample`.
pub fn encode_frame(sample: &Sample) -> Vec<u8> {
    let header = FrameHeader {
        id: sample.id(),
        ty: sample.sample_type(),
        time: sample.time(),
        length: sample.len() as u32,
    };
    let mut out = vec![0u8; FRAME_HEADER_LEN + sample.payload().len()];
    let mut head_buf = [0u8; FRAME_HEADER_LEN];
    header.encode(&mut head_buf);
    out[..FRAME_HEADER_LEN].copy_from_slice(&head_buf);
    out[FRAME_HEADER_LEN..].copy_from_slice(sample.payload());
    out
}

/// Scans `buf` for the next occurrence of [`FRAME_MAGIC`], used to
/// resynchronize a stream after a framing error (§7 kind 2). Returns the
/// byte offset of the match, if any.
pub fn find_next_magic(buf: &[u8]) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    let magic_bytes = FRAME_MAGIC.to_le_bytes();
    buf.windows(4).position(|w| w == magic_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::SamplePool;
    use std::sync::Arc;

    #[test]
    fn round_trips_header_fields() {
        let pool = Arc::new(SamplePool::new());
        let mut raw = pool.get_sample(SampleType::F32, 3).unwrap();
        raw.set_time(123_456);
        raw.set_id(SampleId::new(7, 9, 1).unwrap());
        raw.payload_mut().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
        let sample = raw.freeze();

        let encoded = encode_frame(&sample);
        let header = FrameHeader::decode(&encoded[..FRAME_HEADER_LEN]).unwrap();
        assert_eq!(header.id, sample.id());
        assert_eq!(header.time, 123_456);
        assert_eq!(header.length, 3);
        assert_eq!(&encoded[FRAME_HEADER_LEN..], sample.payload());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        LittleEndian::write_u32(&mut buf[0..4], 0xDEAD_BEEF);
        assert!(matches!(
            FrameHeader::decode(&buf),
            Err(FrameError::BadMagic { .. })
        ));
    }

    #[test]
    fn rejects_length_over_type_maximum() {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        LittleEndian::write_u32(&mut buf[0..4], FRAME_MAGIC);
        buf[8] = SampleType::F64.wire_tag();
        LittleEndian::write_u32(&mut buf[20..24], u32::MAX);
        assert!(matches!(
            FrameHeader::decode(&buf),
            Err(FrameError::LengthBoundExceeded { .. })
        ));
    }

    #[test]
    fn finds_magic_after_garbage_prefix() {
        let mut buf = vec![0xFFu8; 10];
        buf.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        assert_eq!(find_next_magic(&buf), Some(10));
    }
}
