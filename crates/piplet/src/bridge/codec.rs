//! Framed codec for worker communication.
//!
//! A data frame is a 4-byte big-endian signed length prefix followed by that
//! many payload bytes. Command markers reuse the prefix slot with reserved
//! negative values and carry no payload. Works over any AsyncRead/AsyncWrite
//! (pipes, sockets, in-memory duplexes).

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{Command, Frame};

/// Upper bound on a single data frame payload.
///
/// A prefix above this is treated as framing corruption, not a huge record.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

const PREFIX_LEN: usize = 4;

/// Codec multiplexing command markers and opaque data records on one stream.
#[derive(Debug, Default)]
pub struct RecordCodec;

impl RecordCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for RecordCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        if src.len() < PREFIX_LEN {
            return Ok(None);
        }

        let mut prefix_bytes = [0u8; PREFIX_LEN];
        prefix_bytes.copy_from_slice(&src[..PREFIX_LEN]);
        let prefix = i32::from_be_bytes(prefix_bytes);

        if prefix < 0 {
            let command = Command::from_opcode(prefix).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown command opcode {prefix}"),
                )
            })?;
            src.advance(PREFIX_LEN);
            return Ok(Some(Frame::Command(command)));
        }

        let len = prefix as usize;
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame length {len} exceeds maximum {MAX_FRAME_LEN}"),
            ));
        }

        if src.len() < PREFIX_LEN + len {
            src.reserve(PREFIX_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(PREFIX_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame::Data(payload)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("stream ended inside a frame ({} trailing bytes)", src.len()),
            )),
        }
    }
}

impl Encoder<Frame> for RecordCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), io::Error> {
        match item {
            Frame::Command(command) => {
                dst.reserve(PREFIX_LEN);
                dst.put_i32(command.opcode());
            }
            Frame::Data(payload) => {
                if payload.len() > MAX_FRAME_LEN {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "record of {} bytes exceeds maximum frame length {MAX_FRAME_LEN}",
                            payload.len()
                        ),
                    ));
                }
                dst.reserve(PREFIX_LEN + payload.len());
                dst.put_i32(payload.len() as i32);
                dst.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}
