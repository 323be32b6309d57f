//! Newline-delimited framing shared by the registration and device sockets.
//!
//! Frames are handed out as raw bytes so that a line which is not valid
//! UTF-8 or not valid JSON can be rejected by the caller without ending the
//! stream. A line longer than the configured limit is discarded up to its
//! terminating newline and reported as [`Frame::Oversized`]; the buffer never
//! grows past the limit.

use bytes::BytesMut;
use std::io;
use tokio_util::codec::Decoder;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// One line without its trailing `\n`.
    Line(BytesMut),
    /// A line that exceeded the limit and was dropped.
    Oversized,
}

#[derive(Debug, Clone)]
pub struct LineFrameCodec {
    max_length: usize,
    discarding: bool,
}

impl LineFrameCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            discarding: false,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Decoder for LineFrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match src.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                let mut line = src.split_to(pos + 1);
                if self.discarding {
                    self.discarding = false;
                    return Ok(Some(Frame::Oversized));
                }
                if pos > self.max_length {
                    return Ok(Some(Frame::Oversized));
                }
                line.truncate(pos);
                Ok(Some(Frame::Line(line)))
            }
            None => {
                if src.len() > self.max_length {
                    // Keep memory bounded; the rest of this line is dropped too.
                    src.clear();
                    self.discarding = true;
                }
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        // An unterminated trailing fragment is not a frame.
        src.clear();
        self.discarding = false;
        Ok(None)
    }
}
