//! Framing: 1-byte packet code + 4-byte big-endian length + body.

use crate::packet::PacketCode;

const CODE_SIZE: usize = 1;
const LEN_SIZE: usize = 4;

/// Frame header size on the wire: code byte plus big-endian length.
pub const HEADER_SIZE: usize = CODE_SIZE + LEN_SIZE;

/// Largest body that still fits the 32-bit length field alongside the header.
pub const MAX_BODY_LEN: usize = u32::MAX as usize - HEADER_SIZE;

/// One length-prefixed unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: PacketCode,
    pub body: Vec<u8>,
}

/// Encode a frame: code byte, big-endian body length, body bytes.
pub fn encode_frame(code: PacketCode, body: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    if body.len() > MAX_BODY_LEN {
        return Err(FrameEncodeError::UnsupportedBodySize);
    }
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.push(code.as_u8());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

/// Error encoding a frame (body does not fit the length field).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame body too large for the 32-bit length field")]
    UnsupportedBodySize,
}

/// Decode one frame from the front of `bytes`. Returns the frame and the exact
/// number of bytes consumed so the caller can trim regardless of trailing data.
/// Call with a partial buffer; `NeedMore` means try again after more bytes.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameDecodeError> {
    if bytes.len() < HEADER_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let code =
        PacketCode::from_u8(bytes[0]).ok_or(FrameDecodeError::UnknownCode { code: bytes[0] })?;
    let len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
    if bytes.len() < HEADER_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let body = bytes[HEADER_SIZE..HEADER_SIZE + len].to_vec();
    Ok((Frame { code, body }, HEADER_SIZE + len))
}

/// Error decoding a frame (need more bytes, or the code byte is not a known
/// packet code).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("unrecognized frame code {code:#04x}")]
    UnknownCode { code: u8 },
}
