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

use super::msg_keepalive::KeepAliveMessage;
use super::msg_notification::{BgpError, MessageHeaderError, NotificationMessage};
use super::msg_open::OpenMessage;
use super::msg_update::UpdateMessage;
use super::utils::ParserError;

pub const BGP_HEADER_SIZE_BYTES: usize = 19;
pub const MAX_MESSAGE_SIZE: u16 = 4096;

// BGP header marker (16 bytes of 0xFF)
pub const BGP_MARKER: [u8; 16] = [0xff; 16];

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    OPEN = 1,
    UPDATE = 2,
    NOTIFICATION = 3,
    KEEPALIVE = 4,
}

impl MessageType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ParserError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::OPEN),
            2 => Ok(MessageType::UPDATE),
            3 => Ok(MessageType::NOTIFICATION),
            4 => Ok(MessageType::KEEPALIVE),
            _ => Err(ParserError::BgpError {
                error: BgpError::MessageHeaderError(MessageHeaderError::BadMessageType),
                data: vec![value],
            }),
        }
    }
}

/// Trait for BGP message types that can serialize themselves
pub trait Message {
    /// Returns the message type identifier
    fn kind(&self) -> MessageType;

    /// Serializes the message body (without BGP header)
    fn to_bytes(&self) -> Vec<u8>;

    /// Serializes the complete BGP message with header
    ///
    /// This method has a default implementation that uses to_bytes()
    /// and adds the BGP header automatically.
    fn serialize(&self) -> Vec<u8> {
        let body = self.to_bytes();
        let mut message = Vec::new();

        // BGP header marker (16 bytes of 0xFF)
        message.extend_from_slice(&BGP_MARKER);

        // Message length (header + body)
        let length = BGP_HEADER_SIZE_BYTES as u16 + body.len() as u16;
        message.extend_from_slice(&length.to_be_bytes());

        // Message type
        message.push(self.kind().as_u8());

        // Message body
        message.extend_from_slice(&body);

        message
    }
}

#[derive(Debug, PartialEq)]
pub enum BgpMessage {
    Open(OpenMessage),
    Update(UpdateMessage),
    KeepAlive(KeepAliveMessage),
    Notification(NotificationMessage),
}

impl BgpMessage {
    /// Parse one framed message (header included, as produced by the sink).
    ///
    /// `use_4b_asn` selects the on-wire ASN width for AS_PATH and
    /// AGGREGATOR in UPDATE bodies; OPEN is negotiated before the mode is
    /// known so it never depends on it.
    pub fn from_frame(frame: &[u8], use_4b_asn: bool) -> Result<Self, ParserError> {
        let message_type = MessageType::try_from(frame[18])?;
        let body = frame[BGP_HEADER_SIZE_BYTES..].to_vec();

        match message_type {
            MessageType::OPEN => {
                let message = OpenMessage::from_bytes(body)?;
                Ok(BgpMessage::Open(message))
            }
            MessageType::UPDATE => {
                let message = UpdateMessage::from_bytes(body, use_4b_asn)?;
                Ok(BgpMessage::Update(message))
            }
            MessageType::KEEPALIVE => Ok(BgpMessage::KeepAlive(KeepAliveMessage {})),
            MessageType::NOTIFICATION => {
                let message = NotificationMessage::from_bytes(body)?;
                Ok(BgpMessage::Notification(message))
            }
        }
    }

    pub fn kind(&self) -> MessageType {
        match self {
            BgpMessage::Open(_) => MessageType::OPEN,
            BgpMessage::Update(_) => MessageType::UPDATE,
            BgpMessage::KeepAlive(_) => MessageType::KEEPALIVE,
            BgpMessage::Notification(_) => MessageType::NOTIFICATION,
        }
    }
}

pub(crate) fn validate_marker(header: &[u8]) -> Result<(), ParserError> {
    if header[0..16] != BGP_MARKER {
        return Err(ParserError::BgpError {
            error: BgpError::MessageHeaderError(MessageHeaderError::ConnectionNotSynchronized),
            data: Vec::new(),
        });
    }
    Ok(())
}

pub(crate) fn validate_length(message_length: u16, message_type: u8) -> Result<(), ParserError> {
    if message_length < BGP_HEADER_SIZE_BYTES as u16 {
        return Err(ParserError::BgpError {
            error: BgpError::MessageHeaderError(MessageHeaderError::BadMessageLength),
            data: message_length.to_be_bytes().to_vec(),
        });
    }

    if message_length > MAX_MESSAGE_SIZE {
        return Err(ParserError::BgpError {
            error: BgpError::MessageHeaderError(MessageHeaderError::BadMessageLength),
            data: message_length.to_be_bytes().to_vec(),
        });
    }

    // Validate message-type-specific length
    if message_type == MessageType::KEEPALIVE.as_u8()
        && message_length != BGP_HEADER_SIZE_BYTES as u16
    {
        return Err(ParserError::BgpError {
            error: BgpError::MessageHeaderError(MessageHeaderError::BadMessageLength),
            data: message_length.to_be_bytes().to_vec(),
        });
    }

    // NOTIFICATION minimum length is 21 (19 header + 2 for error code/subcode)
    if message_type == MessageType::NOTIFICATION.as_u8() && message_length < 21 {
        return Err(ParserError::BgpError {
            error: BgpError::MessageHeaderError(MessageHeaderError::BadMessageLength),
            data: message_length.to_be_bytes().to_vec(),
        });
    }

    Ok(())
}
