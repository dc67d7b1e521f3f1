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

use super::msg::{Message, MessageType};
use super::utils::ParserError;

#[repr(u8)]
#[derive(Debug, PartialEq, Clone)]
pub enum MessageHeaderError {
    ConnectionNotSynchronized = 1,
    BadMessageLength = 2,
    BadMessageType = 3,
    Unknown(u8),
}

impl From<u8> for MessageHeaderError {
    fn from(value: u8) -> Self {
        match value {
            1 => MessageHeaderError::ConnectionNotSynchronized,
            2 => MessageHeaderError::BadMessageLength,
            3 => MessageHeaderError::BadMessageType,
            val => MessageHeaderError::Unknown(val),
        }
    }
}

#[repr(u8)]
#[derive(Debug, PartialEq, Clone)]
pub enum OpenMessageError {
    UnsupportedVersionNumber = 1,
    BadPeerAs = 2,
    BadBgpIdentifier = 3,
    UnsupportedOptionalParameter = 4,
    UnacceptedHoldTime = 6,
    Unknown(u8),
}

impl From<u8> for OpenMessageError {
    fn from(value: u8) -> Self {
        match value {
            1 => OpenMessageError::UnsupportedVersionNumber,
            2 => OpenMessageError::BadPeerAs,
            3 => OpenMessageError::BadBgpIdentifier,
            4 => OpenMessageError::UnsupportedOptionalParameter,
            6 => OpenMessageError::UnacceptedHoldTime,
            val => OpenMessageError::Unknown(val),
        }
    }
}

#[repr(u8)]
#[derive(Debug, PartialEq, Clone)]
pub enum UpdateMessageError {
    MalformedAttributeList = 1,
    UnrecognizedWellKnownAttribute = 2,
    MissingWellKnownAttribute = 3,
    AttributeFlagsError = 4,
    AttributeLengthError = 5,
    InvalidOriginAttribute = 6,
    // 7 is deprecated (was AS Routing Loop)
    InvalidNextHopAttribute = 8,
    OptionalAttributeError = 9,
    InvalidNetworkField = 10,
    MalformedASPath = 11,
    Unknown(u8),
}

impl From<u8> for UpdateMessageError {
    fn from(value: u8) -> Self {
        match value {
            1 => UpdateMessageError::MalformedAttributeList,
            2 => UpdateMessageError::UnrecognizedWellKnownAttribute,
            3 => UpdateMessageError::MissingWellKnownAttribute,
            4 => UpdateMessageError::AttributeFlagsError,
            5 => UpdateMessageError::AttributeLengthError,
            6 => UpdateMessageError::InvalidOriginAttribute,
            // 7 is deprecated
            8 => UpdateMessageError::InvalidNextHopAttribute,
            9 => UpdateMessageError::OptionalAttributeError,
            10 => UpdateMessageError::InvalidNetworkField,
            11 => UpdateMessageError::MalformedASPath,
            val => UpdateMessageError::Unknown(val),
        }
    }
}

/// RFC 6608 FSM error subcodes: which state the unexpected message arrived in.
#[repr(u8)]
#[derive(Debug, PartialEq, Clone)]
pub enum FsmErrorSubcode {
    Unspecified = 0,
    UnexpectedMessageInOpenSent = 1,
    UnexpectedMessageInOpenConfirm = 2,
    UnexpectedMessageInEstablished = 3,
    Unknown(u8),
}

impl From<u8> for FsmErrorSubcode {
    fn from(value: u8) -> Self {
        match value {
            0 => FsmErrorSubcode::Unspecified,
            1 => FsmErrorSubcode::UnexpectedMessageInOpenSent,
            2 => FsmErrorSubcode::UnexpectedMessageInOpenConfirm,
            3 => FsmErrorSubcode::UnexpectedMessageInEstablished,
            val => FsmErrorSubcode::Unknown(val),
        }
    }
}

/// RFC 4486 Cease subcodes (subset this speaker emits).
#[repr(u8)]
#[derive(Debug, PartialEq, Clone)]
pub enum CeaseSubcode {
    Unspecified = 0,
    AdministrativeShutdown = 2,
    AdministrativeReset = 4,
    ConnectionRejected = 5,
    ConnectionCollisionResolution = 7,
    Unknown(u8),
}

impl From<u8> for CeaseSubcode {
    fn from(value: u8) -> Self {
        match value {
            0 => CeaseSubcode::Unspecified,
            2 => CeaseSubcode::AdministrativeShutdown,
            4 => CeaseSubcode::AdministrativeReset,
            5 => CeaseSubcode::ConnectionRejected,
            7 => CeaseSubcode::ConnectionCollisionResolution,
            val => CeaseSubcode::Unknown(val),
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub enum BgpError {
    MessageHeaderError(MessageHeaderError),
    OpenMessageError(OpenMessageError),
    UpdateMessageError(UpdateMessageError),
    HoldTimerExpired,
    FiniteStateMachineError(FsmErrorSubcode),
    Cease(CeaseSubcode),
    Unknown,
}

#[repr(u8)]
enum ErrorCode {
    MessageHeaderError = 1,
    OpenMessageError = 2,
    UpdateMessageError = 3,
    HoldTimerExpired = 4,
    FiniteStateMachineError = 5,
    Cease = 6,
    Unknown,
}

impl From<u8> for ErrorCode {
    fn from(value: u8) -> Self {
        match value {
            1 => ErrorCode::MessageHeaderError,
            2 => ErrorCode::OpenMessageError,
            3 => ErrorCode::UpdateMessageError,
            4 => ErrorCode::HoldTimerExpired,
            5 => ErrorCode::FiniteStateMachineError,
            6 => ErrorCode::Cease,
            _ => ErrorCode::Unknown,
        }
    }
}

impl BgpError {
    fn new(err_code: u8, err_sub_code: u8) -> BgpError {
        match ErrorCode::from(err_code) {
            ErrorCode::MessageHeaderError => {
                BgpError::MessageHeaderError(MessageHeaderError::from(err_sub_code))
            }
            ErrorCode::OpenMessageError => {
                BgpError::OpenMessageError(OpenMessageError::from(err_sub_code))
            }
            ErrorCode::UpdateMessageError => {
                BgpError::UpdateMessageError(UpdateMessageError::from(err_sub_code))
            }
            ErrorCode::HoldTimerExpired => BgpError::HoldTimerExpired,
            ErrorCode::FiniteStateMachineError => {
                BgpError::FiniteStateMachineError(FsmErrorSubcode::from(err_sub_code))
            }
            ErrorCode::Cease => BgpError::Cease(CeaseSubcode::from(err_sub_code)),
            _ => BgpError::Unknown,
        }
    }

    pub fn error_code(&self) -> u8 {
        match self {
            BgpError::MessageHeaderError(_) => 1,
            BgpError::OpenMessageError(_) => 2,
            BgpError::UpdateMessageError(_) => 3,
            BgpError::HoldTimerExpired => 4,
            BgpError::FiniteStateMachineError(_) => 5,
            BgpError::Cease(_) => 6,
            BgpError::Unknown => 0,
        }
    }

    pub fn error_subcode(&self) -> u8 {
        match self {
            BgpError::MessageHeaderError(err) => match err {
                MessageHeaderError::ConnectionNotSynchronized => 1,
                MessageHeaderError::BadMessageLength => 2,
                MessageHeaderError::BadMessageType => 3,
                MessageHeaderError::Unknown(val) => *val,
            },
            BgpError::OpenMessageError(err) => match err {
                OpenMessageError::UnsupportedVersionNumber => 1,
                OpenMessageError::BadPeerAs => 2,
                OpenMessageError::BadBgpIdentifier => 3,
                OpenMessageError::UnsupportedOptionalParameter => 4,
                OpenMessageError::UnacceptedHoldTime => 6,
                OpenMessageError::Unknown(val) => *val,
            },
            BgpError::UpdateMessageError(err) => match err {
                UpdateMessageError::MalformedAttributeList => 1,
                UpdateMessageError::UnrecognizedWellKnownAttribute => 2,
                UpdateMessageError::MissingWellKnownAttribute => 3,
                UpdateMessageError::AttributeFlagsError => 4,
                UpdateMessageError::AttributeLengthError => 5,
                UpdateMessageError::InvalidOriginAttribute => 6,
                // 7 is deprecated
                UpdateMessageError::InvalidNextHopAttribute => 8,
                UpdateMessageError::OptionalAttributeError => 9,
                UpdateMessageError::InvalidNetworkField => 10,
                UpdateMessageError::MalformedASPath => 11,
                UpdateMessageError::Unknown(val) => *val,
            },
            BgpError::FiniteStateMachineError(err) => match err {
                FsmErrorSubcode::Unspecified => 0,
                FsmErrorSubcode::UnexpectedMessageInOpenSent => 1,
                FsmErrorSubcode::UnexpectedMessageInOpenConfirm => 2,
                FsmErrorSubcode::UnexpectedMessageInEstablished => 3,
                FsmErrorSubcode::Unknown(val) => *val,
            },
            BgpError::Cease(err) => match err {
                CeaseSubcode::Unspecified => 0,
                CeaseSubcode::AdministrativeShutdown => 2,
                CeaseSubcode::AdministrativeReset => 4,
                CeaseSubcode::ConnectionRejected => 5,
                CeaseSubcode::ConnectionCollisionResolution => 7,
                CeaseSubcode::Unknown(val) => *val,
            },
            _ => 0,
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct NotificationMessage {
    error: BgpError,
    data: Vec<u8>,
}

impl NotificationMessage {
    pub fn new(error: BgpError, data: Vec<u8>) -> Self {
        NotificationMessage { error, data }
    }

    pub fn from_parser_error(error: &ParserError) -> Option<Self> {
        match error {
            ParserError::BgpError { error, data } => {
                Some(NotificationMessage::new(error.clone(), data.clone()))
            }
            _ => None,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ParserError> {
        if bytes.len() < 2 {
            return Err(ParserError::BgpError {
                error: BgpError::MessageHeaderError(MessageHeaderError::BadMessageLength),
                data: Vec::new(),
            });
        }

        let err_code = bytes[0];
        let err_sub_code = bytes[1];

        Ok(NotificationMessage {
            error: BgpError::new(err_code, err_sub_code),
            data: bytes[2..].to_vec(),
        })
    }

    pub fn error(&self) -> &BgpError {
        &self.error
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Message for NotificationMessage {
    fn kind(&self) -> MessageType {
        MessageType::NOTIFICATION
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.push(self.error.error_code());
        bytes.push(self.error.error_subcode());
        bytes.extend_from_slice(&self.data);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! test_bgp_error_new {
        ($name: ident, $err_code: expr, $err_sub_code: expr, expected $expected:expr) => {
            #[test]
            fn $name() {
                let error = BgpError::new($err_code, $err_sub_code);
                assert_eq!(error, $expected)
            }
        };
    }

    test_bgp_error_new!(
        bgp_error_new_msg_header_1, 1, 1,
        expected BgpError::MessageHeaderError(MessageHeaderError::ConnectionNotSynchronized)
    );
    test_bgp_error_new!(
        bgp_error_new_open_message_1, 2, 1,
        expected BgpError::OpenMessageError(OpenMessageError::UnsupportedVersionNumber)
    );
    test_bgp_error_new!(
        bgp_error_new_update_message_1, 3, 1,
        expected BgpError::UpdateMessageError(UpdateMessageError::MalformedAttributeList)
    );
    test_bgp_error_new!(
        bgp_error_new_hold_timer, 4, 0,
        expected BgpError::HoldTimerExpired
    );
    test_bgp_error_new!(
        bgp_error_new_fsm_open_sent, 5, 1,
        expected BgpError::FiniteStateMachineError(FsmErrorSubcode::UnexpectedMessageInOpenSent)
    );
    test_bgp_error_new!(
        bgp_error_new_cease_shutdown, 6, 2,
        expected BgpError::Cease(CeaseSubcode::AdministrativeShutdown)
    );
    test_bgp_error_new!(
        bgp_error_new_cease_collision, 6, 7,
        expected BgpError::Cease(CeaseSubcode::ConnectionCollisionResolution)
    );
    test_bgp_error_new!(
        bgp_error_new_unknown, 99, 0,
        expected BgpError::Unknown
    );

    #[test]
    fn test_notification_message_from_bytes() {
        let input = vec![
            0x03, // Error code
            0x02, // Error subcode
            // Data
            // https://datatracker.ietf.org/doc/html/rfc4271#section-6.3
            0x00, 0xff, // Attribute type
            0x01, // Attribute length
            0x02, // Attribute Value
        ];
        let result = NotificationMessage::from_bytes(input).unwrap();

        assert_eq!(
            result,
            NotificationMessage {
                error: BgpError::UpdateMessageError(
                    UpdateMessageError::UnrecognizedWellKnownAttribute
                ),
                data: vec![0x00, 0xff, 0x01, 0x02],
            }
        )
    }

    #[test]
    fn test_notification_message_from_bytes_no_data() {
        let input = vec![
            0x02, // Error code
            0x04, // Error subcode
        ];
        let result = NotificationMessage::from_bytes(input).unwrap();

        assert_eq!(
            result,
            NotificationMessage {
                error: BgpError::OpenMessageError(OpenMessageError::UnsupportedOptionalParameter),
                data: vec![],
            }
        )
    }

    #[test]
    fn test_notification_message_from_bytes_truncated() {
        let result = NotificationMessage::from_bytes(vec![0x02]);
        assert!(result.is_err());
    }

    #[test]
    fn test_notification_message_new_encode_decode() {
        let error = BgpError::MessageHeaderError(MessageHeaderError::BadMessageLength);
        let data = vec![0x00, 0x12];

        let notif = NotificationMessage::new(error, data.clone());
        assert_eq!(notif.data(), &data);

        let bytes = notif.to_bytes();
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[1], 2);
        assert_eq!(&bytes[2..], &data);

        let decoded = NotificationMessage::from_bytes(bytes).unwrap();
        assert_eq!(decoded, notif);
    }

    #[test]
    fn test_cease_subcodes_round_trip() {
        for subcode in [
            CeaseSubcode::AdministrativeShutdown,
            CeaseSubcode::AdministrativeReset,
            CeaseSubcode::ConnectionCollisionResolution,
        ] {
            let notif = NotificationMessage::new(BgpError::Cease(subcode.clone()), vec![]);
            let decoded = NotificationMessage::from_bytes(notif.to_bytes()).unwrap();
            assert_eq!(decoded.error(), &BgpError::Cease(subcode));
        }
    }

    #[test]
    fn test_from_parser_error() {
        let parser_error = ParserError::BgpError {
            error: BgpError::MessageHeaderError(MessageHeaderError::BadMessageLength),
            data: vec![0x10, 0x01],
        };
        let notif = NotificationMessage::from_parser_error(&parser_error).unwrap();

        assert_eq!(
            notif.error(),
            &BgpError::MessageHeaderError(MessageHeaderError::BadMessageLength)
        );
        assert_eq!(notif.data(), &[0x10, 0x01]);
    }

    #[test]
    fn test_from_parser_error_none() {
        let parser_error = ParserError::IoError("connection reset".to_string());
        assert!(NotificationMessage::from_parser_error(&parser_error).is_none());
    }
}
