// Copyright 2026 BadCompany
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! MCP Transport Codec.
//!
//! Newline-delimited JSON framing for child process stdio. A line that is
//! not valid JSON yields a [`Frame::Malformed`] item for that line only and
//! the stream carries on; only I/O errors end it. Lines longer than
//! [`limits::MAX_MESSAGE_SIZE_BYTES`] are discarded up to the next newline.

use bytes::{Buf, BytesMut};
use serde::Serialize;
use serde_json::Value;
use std::io;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, Encoder, FramedRead};
use tracing::trace;

use crate::engine_core::constants::limits;

/// Longest slice of a bad line kept for diagnostics
const PREVIEW_LEN: usize = 200;

/// One decoded record.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(Value),
    Malformed { preview: String, error: String },
}

pub struct McpCodec {
    // Offset already scanned for a newline in the current buffer.
    next_index: usize,
    discarding: bool,
    max_length: usize,
}

impl McpCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(limits::MAX_MESSAGE_SIZE_BYTES)
    }

    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            next_index: 0,
            discarding: false,
            max_length,
        }
    }

    fn parse_line(line: &[u8]) -> Option<Frame> {
        let line = trim_line_end(line);
        if line.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        match serde_json::from_slice::<Value>(line) {
            Ok(value) => {
                trace!("Decoded message: {:?}", value);
                Some(Frame::Message(value))
            }
            Err(e) => {
                let shown = &line[..line.len().min(PREVIEW_LEN)];
                Some(Frame::Malformed {
                    preview: String::from_utf8_lossy(shown).into_owned(),
                    error: e.to_string(),
                })
            }
        }
    }
}

impl Default for McpCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_line_end(mut line: &[u8]) -> &[u8] {
    while let [rest @ .., b'\n' | b'\r'] = line {
        line = rest;
    }
    line
}

impl Decoder for McpCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        loop {
            let read_to = self.max_length.saturating_add(1).min(src.len());
            let newline = src[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n');

            match (self.discarding, newline) {
                (false, Some(offset)) => {
                    let end = self.next_index + offset + 1;
                    self.next_index = 0;
                    let line = src.split_to(end);
                    if let Some(frame) = Self::parse_line(&line) {
                        return Ok(Some(frame));
                    }
                    // Blank line: keep scanning what is left.
                }
                (false, None) if src.len() > self.max_length => {
                    let preview = String::from_utf8_lossy(&src[..PREVIEW_LEN.min(src.len())])
                        .into_owned();
                    src.advance(read_to);
                    self.next_index = 0;
                    self.discarding = true;
                    return Ok(Some(Frame::Malformed {
                        preview,
                        error: format!("line exceeds {} bytes", self.max_length),
                    }));
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
                (true, Some(offset)) => {
                    src.advance(offset + 1);
                    self.discarding = false;
                }
                (true, None) => {
                    src.advance(read_to);
                    if src.is_empty() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        self.next_index = 0;
        if self.discarding {
            self.discarding = false;
            src.clear();
            return Ok(None);
        }
        // Final record without a trailing newline.
        let rest = src.split_to(src.len());
        Ok(Self::parse_line(&rest))
    }
}

impl<T: Serialize> Encoder<&T> for McpCodec {
    type Error = io::Error;

    fn encode(&mut self, item: &T, dst: &mut BytesMut) -> Result<(), io::Error> {
        let body = serde_json::to_vec(item)?;
        dst.reserve(body.len() + 1);
        dst.extend_from_slice(&body);
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}

/// Lazily decode frames from one byte stream. Each connection gets its own.
pub fn frames<R: AsyncRead>(reader: R) -> FramedRead<R, McpCodec> {
    FramedRead::new(reader, McpCodec::new())
}
