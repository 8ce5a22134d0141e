//! Incremental MAVLink v2 framer.
//!
//! MAVLink v2 frames on the wire are laid out as:
//!
//! ```text
//! 0xFD len incompat compat seq sysid compid msgid[3] payload[len] crc[2] (signature[13])
//! ```
//!
//! The checksum is CRC-16/MCRF4XX over everything after the start marker, followed by
//! the per-message `CRC_EXTRA` byte. The framer can be fed arbitrary chunks and yields
//! whole frames once available. On garbage, unknown incompat flags or a checksum
//! mismatch it drops the leading byte and rescans for the next start marker.
use bytes::{Buf, BytesMut};
use crc::{Crc, CRC_16_MCRF4XX};

use crate::metrics;

/// MAVLink v2 start-of-frame marker.
pub const STX_V2: u8 = 0xFD;
/// Header length including the start marker.
pub const HEADER_LEN: usize = 10;
/// Trailing checksum length.
pub const CHECKSUM_LEN: usize = 2;
/// Signature block length when `IFLAG_SIGNED` is set.
pub const SIGNATURE_LEN: usize = 13;
/// The only incompatibility flag this implementation understands.
pub const IFLAG_SIGNED: u8 = 0x01;

const X25: Crc<u16> = Crc::<u16>::new(&CRC_16_MCRF4XX);

/// Lookup of the `CRC_EXTRA` seed for a message id (dialect specific).
pub type ExtraCrc = fn(u32) -> u8;

/// One checksum-verified frame with the signature (if any) stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sequence: u8,
    pub system_id: u8,
    pub component_id: u8,
    pub message_id: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FramerStats {
    pub frames: u64,
    pub crc_errors: u64,
    pub skipped_bytes: u64,
}

pub struct FrameDecoder {
    buf: BytesMut,
    extra_crc: ExtraCrc,
    stats: FramerStats,
}

impl FrameDecoder {
    pub fn new(extra_crc: ExtraCrc) -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
            extra_crc,
            stats: FramerStats::default(),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn stats(&self) -> FramerStats {
        self.stats
    }

    /// Bytes currently buffered waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Extract the next complete, checksum-valid frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            // Realign to a start marker
            match self.buf.iter().position(|&b| b == STX_V2) {
                Some(0) => {}
                Some(pos) => self.skip(pos),
                None => {
                    let len = self.buf.len();
                    self.skip(len);
                    return None;
                }
            }
            if self.buf.len() < HEADER_LEN {
                return None;
            }

            let payload_len = self.buf[1] as usize;
            let incompat = self.buf[2];
            if incompat & !IFLAG_SIGNED != 0 {
                self.skip(1);
                continue;
            }
            let signature_len = if incompat & IFLAG_SIGNED != 0 {
                SIGNATURE_LEN
            } else {
                0
            };
            let body_end = HEADER_LEN + payload_len;
            let total = body_end + CHECKSUM_LEN + signature_len;
            if self.buf.len() < total {
                return None;
            }

            let message_id = u32::from_le_bytes([self.buf[7], self.buf[8], self.buf[9], 0]);
            let mut digest = X25.digest();
            digest.update(&self.buf[1..body_end]);
            digest.update(&[(self.extra_crc)(message_id)]);
            let expected = digest.finalize();
            let received = u16::from_le_bytes([self.buf[body_end], self.buf[body_end + 1]]);
            if expected != received {
                self.stats.crc_errors += 1;
                metrics::inc_frames_dropped();
                self.skip(1);
                continue;
            }

            let frame = Frame {
                sequence: self.buf[4],
                system_id: self.buf[5],
                component_id: self.buf[6],
                message_id,
                payload: self.buf[HEADER_LEN..body_end].to_vec(),
            };
            self.buf.advance(total);
            self.stats.frames += 1;
            return Some(frame);
        }
    }

    fn skip(&mut self, n: usize) {
        self.buf.advance(n);
        self.stats.skipped_bytes += n as u64;
    }
}

/// Checksum a header+payload slice (without the start marker) as the framer does.
pub fn checksum(body: &[u8], extra: u8) -> u16 {
    let mut digest = X25.digest();
    digest.update(body);
    digest.update(&[extra]);
    digest.finalize()
}
