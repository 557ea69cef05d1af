//! `Content-Length` framed reader/writer for any `AsyncRead`/`AsyncWrite`.
//!
//! Wire format, as used by language servers:
//!
//! ```text
//! Content-Length: <n>\r\n
//! \r\n
//! <n bytes of UTF-8 JSON>
//! ```

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const INITIAL_BUF_CAPACITY: usize = 8 * 1024;
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
/// Upper bound on a single message body.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Codec error.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Missing Content-Length header")]
    MissingLength,
    #[error("Invalid header: {0}")]
    InvalidHeader(String),
    #[error("Frame of {0} bytes exceeds limit")]
    TooLarge(usize),
    #[error("Frame body is not UTF-8")]
    InvalidUtf8,
    #[error("Connection closed with incomplete frame")]
    Truncated,
}

/// Encode one message body into a framed buffer.
#[must_use]
pub fn encode_frame(body: &str) -> Vec<u8> {
    let mut out = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    out.extend_from_slice(body.as_bytes());
    out
}

/// Try to split one frame off the front of `buf`.
///
/// Returns `(body, consumed)` when a full frame is buffered.
fn decode_frame(buf: &[u8]) -> Result<Option<(String, usize)>, CodecError> {
    let Some(header_end) = buf
        .windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
    else {
        return Ok(None);
    };

    let headers = std::str::from_utf8(&buf[..header_end])
        .map_err(|_| CodecError::InvalidHeader("non UTF-8 header".to_string()))?;

    let mut content_length = None;
    for line in headers.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            return Err(CodecError::InvalidHeader(line.to_string()));
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let len = value
                .trim()
                .parse::<usize>()
                .map_err(|_| CodecError::InvalidHeader(line.to_string()))?;
            content_length = Some(len);
        }
    }

    let len = content_length.ok_or(CodecError::MissingLength)?;
    if len > MAX_FRAME_SIZE {
        return Err(CodecError::TooLarge(len));
    }

    let body_start = header_end + HEADER_TERMINATOR.len();
    if buf.len() < body_start + len {
        return Ok(None);
    }

    let body = std::str::from_utf8(&buf[body_start..body_start + len])
        .map_err(|_| CodecError::InvalidUtf8)?
        .to_string();
    Ok(Some((body, body_start + len)))
}

/// Async frame reader over any `AsyncRead` stream.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a reader.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUF_CAPACITY),
        }
    }

    /// Read the next message body. Returns `None` on clean EOF.
    ///
    /// # Errors
    /// Returns error on I/O failure, malformed headers or a truncated frame.
    pub async fn read_frame(&mut self) -> Result<Option<String>, CodecError> {
        loop {
            if let Some((body, consumed)) = decode_frame(&self.buf)? {
                self.buf.advance(consumed);
                return Ok(Some(body));
            }

            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(CodecError::Truncated);
            }
        }
    }
}

/// Async frame writer over any `AsyncWrite` stream.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap a writer.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one framed message body and flush.
    ///
    /// # Errors
    /// Returns error if the write fails.
    pub async fn write_frame(&mut self, body: &str) -> Result<(), CodecError> {
        self.inner.write_all(&encode_frame(body)).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Serialize `value` as JSON and write it as one frame.
    ///
    /// # Errors
    /// Returns error if the write fails.
    pub async fn write_json<T: serde::Serialize>(&mut self, value: &T) -> Result<(), CodecError> {
        let body = serde_json::to_string(value).map_err(std::io::Error::other)?;
        self.write_frame(&body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reader_writer_roundtrip() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer.write_frame(r#"{"a":1}"#).await.unwrap();
        writer.write_frame("{}").await.unwrap();
        drop(writer);

        assert_eq!(reader.read_frame().await.unwrap().unwrap(), r#"{"a":1}"#);
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), "{}");
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let frame = encode_frame(r#"{"method":"x"}"#);
        assert!(decode_frame(&frame[..frame.len() - 1]).unwrap().is_none());
        assert!(decode_frame(&frame[..10]).unwrap().is_none());
        let (body, consumed) = decode_frame(&frame).unwrap().unwrap();
        assert_eq!(body, r#"{"method":"x"}"#);
        assert_eq!(consumed, frame.len());
    }

    #[test]
    fn test_extra_headers_are_ignored() {
        let raw = b"Content-Type: application/vscode-jsonrpc; charset=utf-8\r\ncontent-length: 2\r\n\r\n{}";
        let (body, _) = decode_frame(raw).unwrap().unwrap();
        assert_eq!(body, "{}");
    }

    #[test]
    fn test_missing_length_is_rejected() {
        let raw = b"Content-Type: text\r\n\r\n{}";
        assert!(matches!(decode_frame(raw), Err(CodecError::MissingLength)));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"Content-Length: 10\r\n\r\n{}").await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(server);
        assert!(matches!(reader.read_frame().await, Err(CodecError::Truncated)));
    }
}
