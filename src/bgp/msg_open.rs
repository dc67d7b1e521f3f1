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
use super::msg_notification::{BgpError, OpenMessageError};
use super::utils::{is_valid_unicast_ipv4, ParserError};

const BGP_VERSION: u8 = 4;

/// Reserved 2-octet ASN standing in for any 4-octet ASN on the wire
/// (RFC 6793 Section 9).
pub const AS_TRANS: u16 = 23456;

/// Capability code for Four-octet AS number support (RFC 6793).
pub const CAP_FOUR_OCTET_AS: u8 = 65;

// https://www.iana.org/assignments/bgp-parameters/bgp-parameters.xhtml#bgp-parameters-11
const PARAM_TYPE_CAPABILITIES: u8 = 2; // RFC 5492

#[derive(Debug, PartialEq)]
pub struct OpenMessage {
    pub version: u8,
    /// The 2-octet My Autonomous System field. Carries [`AS_TRANS`] when the
    /// sender's ASN does not fit; the true value then travels in the
    /// Four-octet AS capability.
    pub asn: u16,
    pub hold_time: u16,
    pub bgp_identifier: u32,
    pub optional_params: Vec<OptionalParam>,
}

#[derive(Debug, PartialEq, Clone)]
pub enum BgpCapability {
    /// RFC 6793: the sender's full 4-octet ASN.
    FourOctetAs(u32),
    /// Anything we don't implement is carried opaquely and ignored.
    Unknown { code: u8, value: Vec<u8> },
}

#[derive(Debug, PartialEq, Clone)]
pub enum OptionalParam {
    Capabilities(Vec<BgpCapability>),
    Unknown { param_type: u8, value: Vec<u8> },
}

impl BgpCapability {
    fn to_bytes(&self) -> Vec<u8> {
        match self {
            BgpCapability::FourOctetAs(asn) => {
                let mut bytes = vec![CAP_FOUR_OCTET_AS, 4];
                bytes.extend_from_slice(&asn.to_be_bytes());
                bytes
            }
            BgpCapability::Unknown { code, value } => {
                let mut bytes = vec![*code, value.len() as u8];
                bytes.extend_from_slice(value);
                bytes
            }
        }
    }
}

impl OptionalParam {
    fn to_bytes(&self) -> Vec<u8> {
        match self {
            OptionalParam::Capabilities(caps) => {
                let mut value = Vec::new();
                for cap in caps {
                    value.extend_from_slice(&cap.to_bytes());
                }
                let mut bytes = vec![PARAM_TYPE_CAPABILITIES, value.len() as u8];
                bytes.extend_from_slice(&value);
                bytes
            }
            OptionalParam::Unknown { param_type, value } => {
                let mut bytes = vec![*param_type, value.len() as u8];
                bytes.extend_from_slice(value);
                bytes
            }
        }
    }
}

/// A capability parameter holds a list of capability TLVs (RFC 5492).
fn read_capabilities(bytes: &[u8]) -> Result<Vec<BgpCapability>, ParserError> {
    let mut cursor = 0;
    let mut caps = Vec::new();

    while cursor < bytes.len() {
        if cursor + 2 > bytes.len() {
            return Err(malformed_open());
        }
        let code = bytes[cursor];
        let len = bytes[cursor + 1] as usize;
        cursor += 2;

        if cursor + len > bytes.len() {
            return Err(malformed_open());
        }
        let value = &bytes[cursor..cursor + len];
        cursor += len;

        let cap = match code {
            CAP_FOUR_OCTET_AS => {
                if len != 4 {
                    return Err(malformed_open());
                }
                BgpCapability::FourOctetAs(u32::from_be_bytes([
                    value[0], value[1], value[2], value[3],
                ]))
            }
            _ => BgpCapability::Unknown {
                code,
                value: value.to_vec(),
            },
        };
        caps.push(cap);
    }

    Ok(caps)
}

fn read_optional_parameters(bytes: &[u8]) -> Result<Vec<OptionalParam>, ParserError> {
    let mut cursor = 0;
    let mut params = Vec::new();

    while cursor < bytes.len() {
        if cursor + 2 > bytes.len() {
            return Err(malformed_open());
        }
        let param_type = bytes[cursor];
        let param_len = bytes[cursor + 1] as usize;
        cursor += 2;

        if cursor + param_len > bytes.len() {
            return Err(malformed_open());
        }
        let value = &bytes[cursor..cursor + param_len];
        cursor += param_len;

        let param = match param_type {
            PARAM_TYPE_CAPABILITIES => OptionalParam::Capabilities(read_capabilities(value)?),
            _ => OptionalParam::Unknown {
                param_type,
                value: value.to_vec(),
            },
        };
        params.push(param);
    }

    Ok(params)
}

// Malformed OPEN structure - use Unspecific subcode (0)
fn malformed_open() -> ParserError {
    ParserError::BgpError {
        error: BgpError::OpenMessageError(OpenMessageError::Unknown(0)),
        data: Vec::new(),
    }
}

/// Validate BGP version (RFC 4271 Section 6.2)
fn validate_version(version: u8) -> Result<(), ParserError> {
    if version != BGP_VERSION {
        // RFC 4271: Data field is a 2-octet unsigned integer indicating the largest
        // locally-supported version number (which is 4)
        return Err(ParserError::BgpError {
            error: BgpError::OpenMessageError(OpenMessageError::UnsupportedVersionNumber),
            data: (BGP_VERSION as u16).to_be_bytes().to_vec(),
        });
    }
    Ok(())
}

/// Validate Hold Time (RFC 4271 Section 6.2)
/// MUST reject Hold Time values of one or two seconds
fn validate_hold_time(hold_time: u16) -> Result<(), ParserError> {
    if hold_time == 1 || hold_time == 2 {
        return Err(ParserError::BgpError {
            error: BgpError::OpenMessageError(OpenMessageError::UnacceptedHoldTime),
            data: Vec::new(),
        });
    }
    Ok(())
}

/// Validate BGP Identifier (RFC 4271 Section 6.2)
/// Must be a valid unicast IP host address
/// Cannot be 0.0.0.0, 255.255.255.255, or multicast (224.0.0.0/4)
fn validate_bgp_identifier(bgp_identifier: u32) -> Result<(), ParserError> {
    if !is_valid_unicast_ipv4(bgp_identifier) {
        return Err(ParserError::BgpError {
            error: BgpError::OpenMessageError(OpenMessageError::BadBgpIdentifier),
            data: Vec::new(),
        });
    }
    Ok(())
}

impl OpenMessage {
    /// OPEN for a plain 2-octet speaker: no optional parameters.
    pub fn new(asn: u16, hold_time: u16, bgp_identifier: u32) -> Self {
        OpenMessage {
            version: BGP_VERSION,
            asn,
            hold_time,
            bgp_identifier,
            optional_params: vec![],
        }
    }

    /// OPEN advertising the Four-octet AS capability. The 2-octet field
    /// carries the low half, or [`AS_TRANS`] when the ASN does not fit.
    pub fn new_with_four_octet_as(asn: u32, hold_time: u16, bgp_identifier: u32) -> Self {
        let asn_2b = if asn >= 0xFFFF { AS_TRANS } else { asn as u16 };
        OpenMessage {
            version: BGP_VERSION,
            asn: asn_2b,
            hold_time,
            bgp_identifier,
            optional_params: vec![OptionalParam::Capabilities(vec![
                BgpCapability::FourOctetAs(asn),
            ])],
        }
    }

    /// The peer's Four-octet AS capability value, if advertised.
    pub fn four_octet_asn(&self) -> Option<u32> {
        self.optional_params.iter().find_map(|param| {
            if let OptionalParam::Capabilities(caps) = param {
                caps.iter().find_map(|cap| match cap {
                    BgpCapability::FourOctetAs(asn) => Some(*asn),
                    _ => None,
                })
            } else {
                None
            }
        })
    }

    /// The peer's effective ASN: the capability value when present,
    /// otherwise the 2-octet field.
    pub fn effective_asn(&self) -> u32 {
        self.four_octet_asn().unwrap_or(self.asn as u32)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ParserError> {
        if bytes.len() < 10 {
            return Err(malformed_open());
        }

        let version = bytes[0];
        let asn = u16::from_be_bytes([bytes[1], bytes[2]]);
        let hold_time = u16::from_be_bytes([bytes[3], bytes[4]]);
        let bgp_identifier = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);

        let optional_params_len = bytes[9] as usize;
        if optional_params_len != bytes.len() - 10 {
            return Err(malformed_open());
        }

        // RFC 4271 Section 6.2: Validate OPEN message fields
        validate_version(version)?;
        validate_hold_time(hold_time)?;
        validate_bgp_identifier(bgp_identifier)?;

        let optional_params = read_optional_parameters(&bytes[10..10 + optional_params_len])?;

        Ok(OpenMessage {
            version,
            asn,
            hold_time,
            bgp_identifier,
            optional_params,
        })
    }
}

impl Message for OpenMessage {
    fn kind(&self) -> MessageType {
        MessageType::OPEN
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();

        // Version
        bytes.push(self.version);

        // ASN
        bytes.extend_from_slice(&self.asn.to_be_bytes());

        // Hold time
        bytes.extend_from_slice(&self.hold_time.to_be_bytes());

        // BGP identifier
        bytes.extend_from_slice(&self.bgp_identifier.to_be_bytes());

        // Optional parameters
        let mut params = Vec::new();
        for param in &self.optional_params {
            params.extend_from_slice(&param.to_bytes());
        }
        bytes.push(params.len() as u8);
        bytes.extend_from_slice(&params);

        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPABILITY_FOUR_OCTET_AS_PARAM: &[u8] = &[
        0x02, // OptionalParam type (Capabilities)
        0x06, // OptionalParam length
        65,   // Capability code (Four-octet AS)
        0x04, // Capability length
        0x00, 0x01, 0x00, 0x00, // ASN 65536
    ];

    const CAPABILITY_UNKNOWN_PARAM: &[u8] = &[
        0x02, // OptionalParam type (Capabilities)
        0x08, // OptionalParam length
        0x02, // Capability code (Route Refresh, not implemented)
        0x00, // Capability length
        65,   // Capability code (Four-octet AS)
        0x04, // Capability length
        0x00, 0x00, 0xfd, 0xe9, // ASN 65001
    ];

    const UNKNOWN_TYPE_PARAM: &[u8] = &[
        200,  // OptionalParam type (Unassigned)
        0x03, // OptionalParam length
        0x01, 0x02, 0x03, // Param value
    ];

    #[test]
    fn test_from_bytes_no_params() {
        let message: &[u8] = &[
            0x04, // Version
            0x04, 0xd2, // ASN (1234)
            0x00, 0x0a, // Hold time (10)
            0x0a, 0x0a, 0x0a, 0x0a, // BGP identifier
            0x00, // Optional parameters length
        ];

        let open = OpenMessage::from_bytes(message.to_vec()).unwrap();
        assert_eq!(open.version, 4);
        assert_eq!(open.asn, 1234);
        assert_eq!(open.hold_time, 10);
        assert_eq!(open.bgp_identifier, 0x0a0a0a0a);
        assert_eq!(open.optional_params, vec![]);
        assert_eq!(open.four_octet_asn(), None);
        assert_eq!(open.effective_asn(), 1234);
    }

    #[test]
    fn test_from_bytes_four_octet_as() {
        let message = [
            &[
                0x04, // Version
                0x5b, 0xa0, // ASN (23456 = AS_TRANS)
                0x00, 0xb4, // Hold time (180)
                0x0a, 0x00, 0x00, 0x02, // BGP identifier
                0x08, // Optional parameters length
            ],
            CAPABILITY_FOUR_OCTET_AS_PARAM,
        ]
        .concat();

        let open = OpenMessage::from_bytes(message).unwrap();
        assert_eq!(open.asn, AS_TRANS);
        assert_eq!(open.four_octet_asn(), Some(65536));
        assert_eq!(open.effective_asn(), 65536);
    }

    #[test]
    fn test_from_bytes_multiple_capabilities_one_param() {
        let message = [
            &[
                0x04, // Version
                0xfd, 0xe9, // ASN (65001)
                0x00, 0xb4, // Hold time (180)
                0x0a, 0x00, 0x00, 0x02, // BGP identifier
                0x0a, // Optional parameters length
            ],
            CAPABILITY_UNKNOWN_PARAM,
        ]
        .concat();

        let open = OpenMessage::from_bytes(message).unwrap();
        assert_eq!(open.four_octet_asn(), Some(65001));
        match &open.optional_params[0] {
            OptionalParam::Capabilities(caps) => {
                assert_eq!(caps.len(), 2);
                assert_eq!(
                    caps[0],
                    BgpCapability::Unknown {
                        code: 2,
                        value: vec![]
                    }
                );
            }
            _ => panic!("Expected Capabilities param"),
        }
    }

    #[test]
    fn test_from_bytes_unknown_param_type() {
        let message = [
            &[
                0x04, // Version
                0xfd, 0xe9, // ASN (65001)
                0x00, 0xb4, // Hold time (180)
                0x0a, 0x00, 0x00, 0x02, // BGP identifier
                0x05, // Optional parameters length
            ],
            UNKNOWN_TYPE_PARAM,
        ]
        .concat();

        let open = OpenMessage::from_bytes(message).unwrap();
        assert_eq!(
            open.optional_params,
            vec![OptionalParam::Unknown {
                param_type: 200,
                value: vec![0x01, 0x02, 0x03],
            }]
        );
    }

    #[test]
    fn test_from_bytes_bad_version() {
        let message: &[u8] = &[
            0x05, // Version (unsupported)
            0x04, 0xd2, // ASN
            0x00, 0x0a, // Hold time
            0x0a, 0x0a, 0x0a, 0x0a, // BGP identifier
            0x00, // Optional parameters length
        ];

        match OpenMessage::from_bytes(message.to_vec()) {
            Err(ParserError::BgpError { error, data }) => {
                assert_eq!(
                    error,
                    BgpError::OpenMessageError(OpenMessageError::UnsupportedVersionNumber)
                );
                assert_eq!(data, vec![0x00, 0x04]); // Largest supported version
            }
            _ => panic!("Expected UnsupportedVersionNumber error"),
        }
    }

    #[test]
    fn test_from_bytes_bad_hold_time() {
        for hold in [1u16, 2] {
            let mut message = vec![
                0x04, // Version
                0x04, 0xd2, // ASN
            ];
            message.extend_from_slice(&hold.to_be_bytes());
            message.extend_from_slice(&[0x0a, 0x0a, 0x0a, 0x0a, 0x00]);

            match OpenMessage::from_bytes(message) {
                Err(ParserError::BgpError { error, .. }) => {
                    assert_eq!(
                        error,
                        BgpError::OpenMessageError(OpenMessageError::UnacceptedHoldTime)
                    );
                }
                _ => panic!("Expected UnacceptedHoldTime error for hold={}", hold),
            }
        }
    }

    #[test]
    fn test_from_bytes_bad_bgp_identifier() {
        let message: &[u8] = &[
            0x04, // Version
            0x04, 0xd2, // ASN
            0x00, 0x0a, // Hold time
            0x00, 0x00, 0x00, 0x00, // BGP identifier (0.0.0.0, invalid)
            0x00, // Optional parameters length
        ];

        match OpenMessage::from_bytes(message.to_vec()) {
            Err(ParserError::BgpError { error, .. }) => {
                assert_eq!(
                    error,
                    BgpError::OpenMessageError(OpenMessageError::BadBgpIdentifier)
                );
            }
            _ => panic!("Expected BadBgpIdentifier error"),
        }
    }

    #[test]
    fn test_from_bytes_bad_params_length() {
        let message: &[u8] = &[
            0x04, // Version
            0x04, 0xd2, // ASN
            0x00, 0x0a, // Hold time
            0x0a, 0x0a, 0x0a, 0x0a, // BGP identifier
            0x09, // Optional parameters length (claims 9, none present)
        ];

        assert!(OpenMessage::from_bytes(message.to_vec()).is_err());
    }

    #[test]
    fn test_new_with_four_octet_as_small_asn() {
        // ASN fits in 2 octets: the 2-octet field carries it directly
        let open = OpenMessage::new_with_four_octet_as(65001, 180, 0x0a000001);
        assert_eq!(open.asn, 65001);
        assert_eq!(open.four_octet_asn(), Some(65001));
    }

    #[test]
    fn test_new_with_four_octet_as_large_asn() {
        // ASN does not fit: 2-octet field carries AS_TRANS
        let open = OpenMessage::new_with_four_octet_as(395849, 180, 0x0a000001);
        assert_eq!(open.asn, AS_TRANS);
        assert_eq!(open.four_octet_asn(), Some(395849));
    }

    #[test]
    fn test_open_message_encode_decode() {
        let open = OpenMessage::new_with_four_octet_as(395849, 90, 0x0a000001);
        let bytes = open.to_bytes();
        let decoded = OpenMessage::from_bytes(bytes).unwrap();
        assert_eq!(decoded, open);
    }

    #[test]
    fn test_open_message_serialize_header() {
        let open = OpenMessage::new(65001, 180, 0x0a000001);
        let serialized = open.serialize();

        assert_eq!(&serialized[0..16], &[0xff; 16]);
        let length = u16::from_be_bytes([serialized[16], serialized[17]]);
        assert_eq!(length, serialized.len() as u16);
        assert_eq!(serialized[18], 1); // Message type: OPEN
    }
}
