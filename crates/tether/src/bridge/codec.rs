//! Newline-delimited JSON framing.
//!
//! Each frame is one compact JSON document followed by `\n`. The decoder buffers
//! partial reads and splits coalesced frames. Works over any AsyncRead/AsyncWrite.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a single frame; a peer exceeding it is treated as a transport fault.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

/// A complete frame that did not parse.
///
/// Returned as a decoded *item* rather than a stream error so that one bad frame
/// does not terminate the connection.
#[derive(Debug, thiserror::Error)]
#[error("malformed frame ({len} bytes): {source}")]
pub struct FrameError {
    pub len: usize,
    #[source]
    pub source: serde_json::Error,
}

/// Codec that frames messages with `\n` and serializes with JSON.
pub struct JsonLinesCodec<T> {
    max_frame_length: usize,
    /// Bytes of the current buffer already scanned without finding `\n`.
    scanned: usize,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLinesCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLinesCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            max_frame_length,
            scanned: 0,
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonLinesCodec<T> {
    type Item = Result<T, FrameError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline = src[self.scanned..].iter().position(|b| *b == b'\n');
            let Some(offset) = newline else {
                self.scanned = src.len();
                if src.len() > self.max_frame_length {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("frame exceeds {} bytes", self.max_frame_length),
                    ));
                }
                return Ok(None);
            };

            let end = self.scanned + offset;
            self.scanned = 0;
            let line = src.split_to(end);
            src.advance(1);

            let trimmed = line.strip_suffix(b"\r").unwrap_or(&line[..]);
            if trimmed.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            tracing::trace!(frame_size_bytes = trimmed.len(), "Decoded frame");
            let item = serde_json::from_slice(trimmed).map_err(|source| FrameError {
                len: trimmed.len(),
                source,
            });
            return Ok(Some(item));
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonLinesCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}
