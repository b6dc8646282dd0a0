//! Newline-delimited JSON codec for the child's stdin/stdout.
//!
//! Frames on raw `\n` bytes and classifies each line with
//! [`decode`](super::protocol::decode). Lines that are not protocol messages,
//! including lines that are not valid UTF-8, are yielded as
//! [`Decoded::NotProtocol`] rather than as errors, so stray output on stdout
//! never tears down the stream or shifts the reply pairing.

use std::io;

use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, Encoder};

use super::protocol::{Decoded, ProtocolMessage, decode, encode};

#[derive(Debug)]
pub struct LineCodec {
    inner: AnyDelimiterCodec,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LineCodec {
    pub fn new() -> Self {
        Self {
            inner: AnyDelimiterCodec::new(b"\n".to_vec(), b"\n".to_vec()),
        }
    }
}

fn into_io(err: AnyDelimiterCodecError) -> io::Error {
    match err {
        AnyDelimiterCodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

fn classify(line: Bytes) -> Decoded {
    match std::str::from_utf8(&line) {
        Ok(text) => decode(text),
        Err(_) => Decoded::NotProtocol(String::from_utf8_lossy(&line).into_owned()),
    }
}

impl Decoder for LineCodec {
    type Item = Decoded;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.inner.decode(src).map_err(into_io)?.map(classify))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.inner.decode_eof(src).map_err(into_io)?.map(classify))
    }
}

impl Encoder<ProtocolMessage> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, item: ProtocolMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = encode(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(line_bytes = line.len(), "Encoding line");
        dst.extend_from_slice(line.as_bytes());
        Ok(())
    }
}
