//! Length-prefixed message framing.
//!
//! Wire format: `[4-byte big-endian length][payload]`

use crate::error::{TalkError, TalkResult};

/// Size of the length prefix.
pub const LEN_PREFIX: usize = 4;

/// Prefix `payload` with its big-endian length.
pub fn frame_encode(payload: &[u8]) -> TalkResult<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| TalkError::Codec(format!("frame of {} bytes too large", payload.len())))?;
    let mut frame = Vec::with_capacity(LEN_PREFIX + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Streaming frame decoder: accumulates bytes and yields complete payloads.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_len,
        }
    }

    /// Append received bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pop the next complete payload, if one is buffered.
    ///
    /// A declared length above `max_frame_len` is an error; the stream
    /// cannot be resynchronised after it.
    pub fn next_frame(&mut self) -> TalkResult<Option<Vec<u8>>> {
        if self.buffer.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
            as usize;
        if len > self.max_frame_len {
            return Err(TalkError::Transport(format!(
                "frame of {len} bytes exceeds limit {}",
                self.max_frame_len
            )));
        }
        if self.buffer.len() < LEN_PREFIX + len {
            return Ok(None);
        }

        let payload = self.buffer[LEN_PREFIX..LEN_PREFIX + len].to_vec();
        self.buffer.drain(..LEN_PREFIX + len);
        Ok(Some(payload))
    }

    /// Reset internal buffer.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Number of bytes remaining in the internal buffer.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(decoder: &mut FrameDecoder) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(frame) = decoder.next_frame().unwrap() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn single_frame() {
        let frame = frame_encode(b"hello").unwrap();
        assert_eq!(&frame[..4], &[0, 0, 0, 5]);
        let mut decoder = FrameDecoder::new(1024);
        decoder.feed(&frame);
        assert_eq!(drain(&mut decoder), vec![b"hello".to_vec()]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn coalesced_frames_split_apart() {
        let mut combined = Vec::new();
        let payloads: [&[u8]; 3] = [b"a", b"", b"ccc"];
        for payload in payloads {
            combined.extend(frame_encode(payload).unwrap());
        }
        let mut decoder = FrameDecoder::new(1024);
        decoder.feed(&combined);
        assert_eq!(drain(&mut decoder), vec![b"a".to_vec(), Vec::new(), b"ccc".to_vec()]);
    }

    #[test]
    fn incremental_feed() {
        let frame = frame_encode(b"test").unwrap();
        let mut decoder = FrameDecoder::new(1024);

        for byte in &frame[..frame.len() - 1] {
            decoder.feed(std::slice::from_ref(byte));
            assert!(decoder.next_frame().unwrap().is_none());
        }
        decoder.feed(&frame[frame.len() - 1..]);
        assert_eq!(decoder.next_frame().unwrap(), Some(b"test".to_vec()));
    }

    #[test]
    fn oversized_frame_is_an_error() {
        let frame = frame_encode(&[0u8; 32]).unwrap();
        let mut decoder = FrameDecoder::new(16);
        decoder.feed(&frame);
        assert!(decoder.next_frame().is_err());
    }

    #[test]
    fn pending_bytes() {
        let frame = frame_encode(b"x").unwrap();
        let mut decoder = FrameDecoder::new(1024);
        decoder.feed(&frame[..3]);
        assert_eq!(decoder.pending(), 3);
        decoder.reset();
        assert_eq!(decoder.pending(), 0);
    }
}
