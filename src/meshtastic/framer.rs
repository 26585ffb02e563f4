//! Stream framer for the Meshtastic serial/TCP client API.
//!
//! Every protobuf on the stream is preceded by a 4 byte header:
//!
//!   `0x94 0xC3 <len_hi> <len_lo> <protobuf bytes>`
//!
//! The decoder can be fed arbitrary chunks and yields whole payloads when available. Bytes
//! that do not start a header (firmware debug text on serial, line noise) are skipped, and a
//! header with an implausible length is treated as noise by advancing a single byte.
use bytes::{Buf, BufMut, BytesMut};

pub const START1: u8 = 0x94;
pub const START2: u8 = 0xC3;
/// Largest payload the firmware will emit or accept.
pub const MAX_FRAME_SIZE: usize = 512;
/// Upper bound used when realigning on a declared length; looser than the firmware limit so a
/// newer radio with bigger packets does not desynchronize the reader.
const MAX_DECLARED: usize = 8192;

/// Wake sequence sent before the first frame so a sleeping serial radio switches to API mode.
pub fn wake_bytes() -> [u8; 32] {
    [START2; 32]
}

/// Prefix `payload` with the stream header.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(payload.len() + 4);
    out.put_u8(START1);
    out.put_u8(START2);
    out.put_u16(payload.len() as u16);
    out.put_slice(payload);
    out.to_vec()
}

#[derive(Default)]
pub struct StreamFramer {
    buf: BytesMut,
    skipped: usize,
}

impl StreamFramer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            skipped: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes discarded while hunting for a frame header since the last call.
    pub fn take_skipped(&mut self) -> usize {
        std::mem::take(&mut self.skipped)
    }

    /// Extract the next complete payload, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            if self.buf.len() < 4 {
                return None;
            }
            if self.buf[0] != START1 || self.buf[1] != START2 {
                // Keep a trailing START1 around: its partner may be in the next chunk.
                let pos = self.buf[1..]
                    .iter()
                    .position(|&b| b == START1)
                    .map(|p| p + 1)
                    .unwrap_or(self.buf.len());
                self.skipped += pos;
                self.buf.advance(pos);
                continue;
            }
            let declared = ((self.buf[2] as usize) << 8) | (self.buf[3] as usize);
            if declared == 0 || declared > MAX_DECLARED {
                self.skipped += 1;
                self.buf.advance(1);
                continue;
            }
            if self.buf.len() < 4 + declared {
                return None;
            }
            self.buf.advance(4);
            return Some(self.buf.split_to(declared).to_vec());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_frames_across_chunks() {
        let a = encode_frame(&[1, 2, 3]);
        let b = encode_frame(&[9; 10]);
        let mut stream = a.clone();
        stream.extend_from_slice(&b);
        let mut f = StreamFramer::new();
        f.push(&stream[..5]);
        assert!(f.next_frame().is_none());
        f.push(&stream[5..]);
        assert_eq!(f.next_frame(), Some(vec![1, 2, 3]));
        assert_eq!(f.next_frame(), Some(vec![9; 10]));
        assert!(f.next_frame().is_none());
    }

    #[test]
    fn skips_debug_text_between_frames() {
        let mut stream = b"INFO  | boot ok\r\n".to_vec();
        stream.extend_from_slice(&encode_frame(b"abc"));
        let mut f = StreamFramer::new();
        f.push(&stream);
        assert_eq!(f.next_frame(), Some(b"abc".to_vec()));
        assert_eq!(f.take_skipped(), 17);
    }

    #[test]
    fn lone_start_byte_followed_by_garbage_does_not_stall() {
        let mut stream = vec![START1, 0x00, 0x01, 0x02, 0x03];
        stream.extend_from_slice(&encode_frame(&[7]));
        let mut f = StreamFramer::new();
        f.push(&stream);
        assert_eq!(f.next_frame(), Some(vec![7]));
    }

    #[test]
    fn zero_length_header_is_noise() {
        let mut stream = vec![START1, START2, 0, 0];
        stream.extend_from_slice(&encode_frame(&[5, 5]));
        let mut f = StreamFramer::new();
        f.push(&stream);
        assert_eq!(f.next_frame(), Some(vec![5, 5]));
    }
}
