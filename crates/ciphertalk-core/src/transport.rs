//! Message-oriented halves over a byte stream.
//!
//! Every protocol step is one message. [`Framing::LengthPrefixed`] carries
//! the boundary on the wire; [`Framing::Raw`] is the legacy unframed format
//! where one `read()` is taken to be exactly one message.

use crate::codec::{frame_encode, FrameDecoder};
use crate::error::{TalkError, TalkResult};
use crate::keys::{MAX_PLAINTEXT_LEN, SEAL_OVERHEAD};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Largest sealed envelope, which is the default frame ceiling.
pub const DEFAULT_MAX_FRAME_LEN: usize = MAX_PLAINTEXT_LEN + SEAL_OVERHEAD;

/// How message boundaries are carried on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    #[default]
    LengthPrefixed,
    Raw,
}

impl FromStr for Framing {
    type Err = TalkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "length-prefixed" | "framed" => Ok(Framing::LengthPrefixed),
            "raw" => Ok(Framing::Raw),
            other => Err(TalkError::Config(format!(
                "unknown framing '{other}' (expected length-prefixed or raw)"
            ))),
        }
    }
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::LengthPrefixed => f.write_str("length-prefixed"),
            Framing::Raw => f.write_str("raw"),
        }
    }
}

/// Reads one message at a time.
pub struct FrameReader<R> {
    inner: R,
    framing: Framing,
    decoder: FrameDecoder,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, framing: Framing, max_frame_len: usize) -> Self {
        let buf_len = match framing {
            Framing::Raw => max_frame_len,
            Framing::LengthPrefixed => 8 * 1024,
        };
        Self {
            inner,
            framing,
            decoder: FrameDecoder::new(max_frame_len),
            buf: vec![0u8; buf_len.max(1)],
        }
    }

    /// Next message, or `None` once the peer has closed the stream.
    pub async fn read_frame(&mut self) -> TalkResult<Option<Vec<u8>>> {
        match self.framing {
            Framing::Raw => {
                let n = self.inner.read(&mut self.buf).await?;
                if n == 0 {
                    Ok(None)
                } else {
                    Ok(Some(self.buf[..n].to_vec()))
                }
            }
            Framing::LengthPrefixed => loop {
                if let Some(frame) = self.decoder.next_frame()? {
                    return Ok(Some(frame));
                }
                let n = self.inner.read(&mut self.buf).await?;
                if n == 0 {
                    if self.decoder.pending() > 0 {
                        return Err(TalkError::Transport("stream closed mid-frame".into()));
                    }
                    return Ok(None);
                }
                self.decoder.feed(&self.buf[..n]);
            },
        }
    }
}

/// Writes one message at a time, flushing after each.
pub struct FrameWriter<W> {
    inner: W,
    framing: Framing,
    max_frame_len: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, framing: Framing, max_frame_len: usize) -> Self {
        Self {
            inner,
            framing,
            max_frame_len,
        }
    }

    pub async fn write_frame(&mut self, payload: &[u8]) -> TalkResult<()> {
        if payload.len() > self.max_frame_len {
            return Err(TalkError::Transport(format!(
                "message of {} bytes exceeds limit {}",
                payload.len(),
                self.max_frame_len
            )));
        }
        match self.framing {
            Framing::Raw => self.inner.write_all(payload).await?,
            Framing::LengthPrefixed => self.inner.write_all(&frame_encode(payload)?).await?,
        }
        self.inner.flush().await?;
        Ok(())
    }

    /// Close the write half.
    pub async fn shutdown(&mut self) -> TalkResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Split a duplex stream into message reader and writer halves.
pub fn split_stream<S>(
    stream: S,
    framing: Framing,
    max_frame_len: usize,
) -> (FrameReader<ReadHalf<S>>, FrameWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (read, write) = tokio::io::split(stream);
    (
        FrameReader::new(read, framing, max_frame_len),
        FrameWriter::new(write, framing, max_frame_len),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn framed_messages_keep_boundaries() {
        let (a, b) = tokio::io::duplex(1024);
        let (_ra, mut wa) = split_stream(a, Framing::LengthPrefixed, 1024);
        let (mut rb, _wb) = split_stream(b, Framing::LengthPrefixed, 1024);

        wa.write_frame(b"first").await.unwrap();
        wa.write_frame(b"second").await.unwrap();

        assert_eq!(rb.read_frame().await.unwrap(), Some(b"first".to_vec()));
        assert_eq!(rb.read_frame().await.unwrap(), Some(b"second".to_vec()));
    }

    #[tokio::test]
    async fn close_yields_none() {
        let (a, b) = tokio::io::duplex(1024);
        let (mut rb, _wb) = split_stream(b, Framing::LengthPrefixed, 1024);
        drop(a);
        assert_eq!(rb.read_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn raw_read_is_one_message() {
        let (a, b) = tokio::io::duplex(1024);
        let (_ra, mut wa) = split_stream(a, Framing::Raw, 1024);
        let (mut rb, _wb) = split_stream(b, Framing::Raw, 1024);

        wa.write_frame(b"-1").await.unwrap();
        assert_eq!(rb.read_frame().await.unwrap(), Some(b"-1".to_vec()));
    }

    #[tokio::test]
    async fn oversized_write_is_refused() {
        let (a, _b) = tokio::io::duplex(1024);
        let (_ra, mut wa) = split_stream(a, Framing::LengthPrefixed, 8);
        assert!(wa.write_frame(&[0u8; 9]).await.is_err());
    }

    #[test]
    fn framing_parses_from_config_strings() {
        assert_eq!("raw".parse::<Framing>().unwrap(), Framing::Raw);
        assert_eq!("Length-Prefixed".parse::<Framing>().unwrap(), Framing::LengthPrefixed);
        assert!("cbor".parse::<Framing>().is_err());
        assert_eq!(Framing::default().to_string(), "length-prefixed");
    }
}
