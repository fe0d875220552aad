//! Wire framing for the control socket.
//!
//! One complete JSON object per line, UTF-8, newline-terminated. The codec
//! is generic over the message type so the same implementation frames
//! requests on the write side and responses/events on the read side.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Serialize, de::DeserializeOwned};
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder};

/// Newline-delimited JSON codec.
///
/// Messages are separated by newlines. Each message is a single JSON object.
#[derive(Debug)]
pub struct LineCodec<T> {
    _phantom: PhantomData<T>,
    max_length: usize,
}

impl<T> LineCodec<T> {
    /// Create a new codec with default max length (16 MB).
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
            max_length: 16 * 1024 * 1024,
        }
    }

    /// Create a new codec with custom max length.
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            _phantom: PhantomData,
            max_length,
        }
    }

    /// Get the max frame length.
    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl<T> Default for LineCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for LineCodec<T> {
    fn clone(&self) -> Self {
        Self {
            _phantom: PhantomData,
            max_length: self.max_length,
        }
    }
}

impl<T: DeserializeOwned> Decoder for LineCodec<T> {
    type Item = T;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Self::Item>, Self::Error> {
        let newline_pos = src.iter().position(|&b| b == b'\n');

        match newline_pos {
            Some(pos) => {
                if pos > self.max_length {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("frame too large: {} > {}", pos, self.max_length),
                    ));
                }

                // Take the line, then skip the newline
                let line = src.split_to(pos);
                src.advance(1);

                serde_json::from_slice(&line)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, format!("JSON error: {}", e)))
            }
            None => {
                if src.len() > self.max_length {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("frame too large: {} > {}", src.len(), self.max_length),
                    ));
                }
                Ok(None)
            }
        }
    }
}

impl<T: Serialize> Encoder<T> for LineCodec<T> {
    type Error = std::io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        // Compact JSON contains no raw newlines, so the frame boundary holds
        let json = serde_json::to_vec(&item)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, format!("JSON error: {}", e)))?;

        if json.len() > self.max_length {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame too large: {} > {}", json.len(), self.max_length),
            ));
        }

        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');

        Ok(())
    }
}
