// Copyright 2025 bgplite Authors
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

//! Length-delimited reassembly of BGP wire messages. The transport hands us
//! arbitrary byte slices; [`BgpSink::pop`] yields complete frames (header
//! included) in arrival order, or signals that more bytes are needed.

use super::msg::{validate_length, validate_marker, BGP_HEADER_SIZE_BYTES};
use super::msg_notification::{BgpError, MessageHeaderError};
use super::utils::ParserError;

/// Upper bound on buffered bytes. Two maximum-size messages; anything more
/// means the peer is flooding us with garbage.
pub const SINK_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Default)]
pub struct BgpSink {
    buffer: Vec<u8>,
}

impl BgpSink {
    pub fn new() -> Self {
        BgpSink { buffer: Vec::new() }
    }

    /// Append raw bytes. Fails without buffering anything when the sink
    /// would exceed [`SINK_BUFFER_SIZE`].
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), ParserError> {
        if self.buffer.len() + bytes.len() > SINK_BUFFER_SIZE {
            return Err(ParserError::BgpError {
                error: BgpError::MessageHeaderError(MessageHeaderError::ConnectionNotSynchronized),
                data: Vec::new(),
            });
        }
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    /// Take one complete message (header included) off the front of the
    /// buffer. `Ok(None)` means more bytes are needed. A bad marker or a
    /// nonsense length is unrecoverable for the connection: the caller
    /// translates it to a NOTIFICATION and tears the session down.
    pub fn pop(&mut self) -> Result<Option<Vec<u8>>, ParserError> {
        if self.buffer.len() < BGP_HEADER_SIZE_BYTES {
            return Ok(None);
        }

        validate_marker(&self.buffer)?;

        let message_length = u16::from_be_bytes([self.buffer[16], self.buffer[17]]) as usize;
        let message_type = self.buffer[18];
        validate_length(message_length as u16, message_type)?;

        if self.buffer.len() < message_length {
            return Ok(None); // incomplete message, wait for more
        }

        let frame: Vec<u8> = self.buffer.drain(..message_length).collect();
        Ok(Some(frame))
    }

    /// Drop everything buffered. Used on session reset.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn bytes_buffered(&self) -> usize {
        self.buffer.len()
    }
}
