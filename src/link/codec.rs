//! Frame ⇄ message codec for the `common` dialect.
//!
//! Payload layouts, field scaling and `CRC_EXTRA` seeds come from the `mavlink` crate's
//! generated definitions; this module only glues them to [`FrameDecoder`] output and to
//! outbound byte buffers.
use mavlink::common::MavMessage;
use mavlink::{MavHeader, MavlinkVersion, Message};

use super::framer::{Frame, FrameDecoder};
use super::LinkError;

/// Largest possible v2 frame: header + 255 payload + checksum + signature.
pub const MAX_FRAME_LEN: usize = 280;

/// `CRC_EXTRA` seed for a `common` dialect message id.
pub fn extra_crc(message_id: u32) -> u8 {
    MavMessage::extra_crc(message_id)
}

/// A framer wired to the `common` dialect checksum seeds.
pub fn frame_decoder() -> FrameDecoder {
    FrameDecoder::new(extra_crc)
}

/// Decode a verified frame. Unknown ids and malformed payloads yield `None`.
pub fn decode(frame: &Frame) -> Option<MavMessage> {
    MavMessage::parse(MavlinkVersion::V2, frame.message_id, &frame.payload).ok()
}

/// Encode `message` as a single MAVLink v2 frame.
pub fn encode(header: MavHeader, message: &MavMessage) -> Result<Vec<u8>, LinkError> {
    let mut buf = Vec::with_capacity(MAX_FRAME_LEN);
    mavlink::write_v2_msg(&mut buf, header, message)
        .map_err(|e| LinkError::Encode(format!("{}: {}", message.message_name(), e)))?;
    Ok(buf)
}
