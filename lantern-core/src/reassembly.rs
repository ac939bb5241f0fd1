//! Stream reassembly: arbitrary byte chunks in, complete frames out.

use crate::frame::{decode_frame, Frame, FrameDecodeError};

/// An unrecognized code byte at a frame boundary. Framing sync past this
/// point is not guaranteed; the buffered bytes are retained so the caller
/// can trim (`skip`) and retry, or discard and disconnect.
#[derive(Debug, thiserror::Error)]
#[error("malformed frame: unrecognized code {code:#04x}")]
pub struct MalformedFrame {
    pub code: u8,
}

/// Accumulates partial frame bytes across reads and emits complete frames in
/// wire order. Bytes are never dropped or duplicated.
#[derive(Debug, Default)]
pub struct Reassembler {
    buf: Vec<u8>,
}

impl Reassembler {
    pub fn new() -> Reassembler {
        Reassembler::default()
    }

    /// Feed one delivery of bytes; complete frames are appended to `out` in
    /// order. An empty chunk is a no-op. When nothing is buffered, frames are
    /// decoded straight from `chunk` so intact back-to-back frames avoid a
    /// copy; only an unconsumed tail reaches the buffer.
    pub fn push(&mut self, chunk: &[u8], out: &mut Vec<Frame>) -> Result<(), MalformedFrame> {
        if chunk.is_empty() {
            return Ok(());
        }
        if self.buf.is_empty() {
            let mut rest = chunk;
            loop {
                match decode_frame(rest) {
                    Ok((frame, n)) => {
                        out.push(frame);
                        rest = &rest[n..];
                        if rest.is_empty() {
                            return Ok(());
                        }
                    }
                    Err(FrameDecodeError::NeedMore) => {
                        self.buf.extend_from_slice(rest);
                        return Ok(());
                    }
                    Err(FrameDecodeError::UnknownCode { code }) => {
                        self.buf.extend_from_slice(rest);
                        return Err(MalformedFrame { code });
                    }
                }
            }
        }
        self.buf.extend_from_slice(chunk);
        self.drain(out)
    }

    /// Decode every complete frame currently buffered. Used to attempt
    /// resynchronization after `skip`.
    pub fn resync(&mut self, out: &mut Vec<Frame>) -> Result<(), MalformedFrame> {
        self.drain(out)
    }

    /// Drop the first `n` buffered bytes.
    pub fn skip(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.drain(..n);
    }

    /// Discard all buffered bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Bytes held for a frame not yet fully received (or not yet trimmed
    /// after a malformed frame).
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    fn drain(&mut self, out: &mut Vec<Frame>) -> Result<(), MalformedFrame> {
        let mut consumed = 0;
        let result = loop {
            match decode_frame(&self.buf[consumed..]) {
                Ok((frame, n)) => {
                    out.push(frame);
                    consumed += n;
                    if consumed == self.buf.len() {
                        break Ok(());
                    }
                }
                Err(FrameDecodeError::NeedMore) => break Ok(()),
                Err(FrameDecodeError::UnknownCode { code }) => break Err(MalformedFrame { code }),
            }
        };
        if consumed > 0 {
            self.buf.drain(..consumed);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode_frame, HEADER_SIZE};
    use crate::packet::PacketCode;

    fn sample_stream() -> (Vec<Frame>, Vec<u8>) {
        let frames = vec![
            Frame {
                code: PacketCode::ClientHello,
                body: br#"{"app":"demo"}"#.to_vec(),
            },
            Frame {
                code: PacketCode::LogMessage,
                body: br#"{"msg":"one"}"#.to_vec(),
            },
            Frame {
                code: PacketCode::Ping,
                body: Vec::new(),
            },
            Frame {
                code: PacketCode::LogMessage,
                body: br#"{"msg":"two","n":2}"#.to_vec(),
            },
        ];
        let mut bytes = Vec::new();
        for f in &frames {
            bytes.extend_from_slice(&encode_frame(f.code, &f.body).unwrap());
        }
        (frames, bytes)
    }

    #[test]
    fn all_at_once() {
        let (frames, bytes) = sample_stream();
        let mut r = Reassembler::new();
        let mut out = Vec::new();
        r.push(&bytes, &mut out).unwrap();
        assert_eq!(out, frames);
        assert!(r.buffered().is_empty());
    }

    #[test]
    fn one_byte_at_a_time() {
        let (frames, bytes) = sample_stream();
        let mut r = Reassembler::new();
        let mut out = Vec::new();
        for b in &bytes {
            r.push(std::slice::from_ref(b), &mut out).unwrap();
        }
        assert_eq!(out, frames);
        assert!(r.buffered().is_empty());
    }

    #[test]
    fn every_split_point_yields_identical_frames() {
        let (frames, bytes) = sample_stream();
        for split in 0..=bytes.len() {
            let mut r = Reassembler::new();
            let mut out = Vec::new();
            r.push(&bytes[..split], &mut out).unwrap();
            r.push(&bytes[split..], &mut out).unwrap();
            assert_eq!(out, frames, "split at {split}");
            assert!(r.buffered().is_empty(), "split at {split}");
        }
    }

    #[test]
    fn complete_frames_plus_partial_tail() {
        let (frames, bytes) = sample_stream();
        let tail_start = bytes.len() - frames.last().unwrap().body.len() - HEADER_SIZE;
        // Everything plus half of the last frame's header in one chunk.
        let cut = tail_start + 2;
        let mut r = Reassembler::new();
        let mut out = Vec::new();
        r.push(&bytes[..cut], &mut out).unwrap();
        assert_eq!(out, frames[..3]);
        assert_eq!(r.buffered(), &bytes[tail_start..cut]);
        r.push(&bytes[cut..], &mut out).unwrap();
        assert_eq!(out, frames);
        assert!(r.buffered().is_empty());
    }

    #[test]
    fn no_frame_until_full_body_arrives() {
        let body = vec![b'x'; 64];
        let bytes = encode_frame(PacketCode::LogMessage, &body).unwrap();
        let mut r = Reassembler::new();
        let mut out = Vec::new();
        r.push(&bytes[..HEADER_SIZE], &mut out).unwrap();
        assert!(out.is_empty());
        // Body trickles in short of completion.
        r.push(&bytes[HEADER_SIZE..HEADER_SIZE + 32], &mut out).unwrap();
        assert!(out.is_empty());
        r.push(&bytes[HEADER_SIZE + 32..bytes.len() - 1], &mut out).unwrap();
        assert!(out.is_empty());
        r.push(&bytes[bytes.len() - 1..], &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].body, body);
    }

    #[test]
    fn empty_chunk_is_noop() {
        let mut r = Reassembler::new();
        let mut out = Vec::new();
        r.push(&[], &mut out).unwrap();
        assert!(out.is_empty());
        assert!(r.buffered().is_empty());
    }

    #[test]
    fn malformed_code_reported_frames_before_it_emitted() {
        let good = encode_frame(PacketCode::Ping, &[]).unwrap();
        let mut bytes = good.clone();
        bytes.push(0xff); // garbage byte where the next code should be
        bytes.extend_from_slice(&good);
        let mut r = Reassembler::new();
        let mut out = Vec::new();
        let err = r.push(&bytes, &mut out).unwrap_err();
        assert_eq!(err.code, 0xff);
        assert_eq!(out.len(), 1);
        // The bad byte and everything after it stay buffered.
        assert_eq!(r.buffered(), &bytes[good.len()..]);
    }

    #[test]
    fn skip_then_resync_recovers() {
        let good = encode_frame(PacketCode::Resume, &[]).unwrap();
        let mut bytes = vec![0xffu8];
        bytes.extend_from_slice(&good);
        let mut r = Reassembler::new();
        let mut out = Vec::new();
        assert!(r.push(&bytes, &mut out).is_err());
        assert!(out.is_empty());
        r.skip(1);
        r.resync(&mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].code, PacketCode::Resume);
        assert!(r.buffered().is_empty());
    }

    #[test]
    fn clear_discards_buffer() {
        let mut r = Reassembler::new();
        let mut out = Vec::new();
        assert!(r.push(&[0xff, 0x00], &mut out).is_err());
        r.clear();
        assert!(r.buffered().is_empty());
        let good = encode_frame(PacketCode::Ping, &[]).unwrap();
        r.push(&good, &mut out).unwrap();
        assert_eq!(out.len(), 1);
    }
}
