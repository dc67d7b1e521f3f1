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

//! The UPDATE message: path attributes (RFC 4271 Section 4.3 plus the
//! RFC 6793 four-octet extensions), NLRI, withdrawn routes, and the
//! AS_PATH transforms a speaker needs when it straddles 2-octet and
//! 4-octet worlds.

use super::msg::{Message, MessageType};
use super::msg_notification::{BgpError, UpdateMessageError};
use super::msg_open::AS_TRANS;
use super::utils::{parse_nlri_list, read_u32, write_nlri_list, Ipv4Net, ParserError};
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;

const WITHDRAWN_ROUTES_LENGTH_SIZE: usize = 2;
const TOTAL_ATTR_LENGTH_SIZE: usize = 2;

/// An AS_SEQUENCE segment holds at most 255 ASNs (one-byte count field).
const MAX_SEGMENT_LEN: usize = 255;

pub mod attr_flags {
    pub const OPTIONAL: u8 = 1 << 7;
    pub const TRANSITIVE: u8 = 1 << 6;
    pub const PARTIAL: u8 = 1 << 5;
    pub const EXTENDED_LENGTH: u8 = 1 << 4;
}

pub mod attr_type_code {
    pub const ORIGIN: u8 = 1;
    pub const AS_PATH: u8 = 2;
    pub const NEXT_HOP: u8 = 3;
    pub const MULTI_EXIT_DISC: u8 = 4;
    pub const LOCAL_PREF: u8 = 5;
    pub const ATOMIC_AGGREGATE: u8 = 6;
    pub const AGGREGATOR: u8 = 7;
    pub const COMMUNITY: u8 = 8;
    pub const AS4_PATH: u8 = 17;
    pub const AS4_AGGREGATOR: u8 = 18;
}

fn extended_len(flags: u8) -> bool {
    flags & attr_flags::EXTENDED_LENGTH != 0
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Origin {
    IGP = 0,
    EGP = 1,
    INCOMPLETE = 2,
}

impl TryFrom<u8> for Origin {
    type Error = ParserError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Origin::IGP),
            1 => Ok(Origin::EGP),
            2 => Ok(Origin::INCOMPLETE),
            _ => Err(ParserError::BgpError {
                error: BgpError::UpdateMessageError(UpdateMessageError::InvalidOriginAttribute),
                data: Vec::new(),
            }),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum AsPathSegmentType {
    AsSet = 1,
    AsSequence = 2,
}

impl TryFrom<u8> for AsPathSegmentType {
    type Error = ParserError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(AsPathSegmentType::AsSet),
            2 => Ok(AsPathSegmentType::AsSequence),
            _ => Err(ParserError::BgpError {
                error: BgpError::UpdateMessageError(UpdateMessageError::MalformedASPath),
                data: Vec::new(),
            }),
        }
    }
}

/// One AS_PATH segment. ASNs are held as u32 regardless of mode;
/// `four_byte` records the on-wire width this segment uses.
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct AsPathSegment {
    pub segment_type: AsPathSegmentType,
    pub four_byte: bool,
    pub asn_list: Vec<u32>,
}

impl AsPathSegment {
    pub fn sequence(four_byte: bool, asn_list: Vec<u32>) -> Self {
        AsPathSegment {
            segment_type: AsPathSegmentType::AsSequence,
            four_byte,
            asn_list,
        }
    }

    pub fn set(four_byte: bool, asn_list: Vec<u32>) -> Self {
        AsPathSegment {
            segment_type: AsPathSegmentType::AsSet,
            four_byte,
            asn_list,
        }
    }
}

/// AS_PATH length for best-path selection per RFC 4271 Section 9.1.2.2:
/// AS_SEQUENCE counts each ASN, AS_SET counts as 1 regardless of size.
pub fn as_path_length(segments: &[AsPathSegment]) -> usize {
    segments
        .iter()
        .map(|segment| match segment.segment_type {
            AsPathSegmentType::AsSequence => segment.asn_list.len(),
            AsPathSegmentType::AsSet => 1,
        })
        .sum()
}

/// First ASN of the first AS_SEQUENCE segment: the neighboring AS per
/// RFC 4271 Section 9.1.2.2(c). None for locally originated routes.
pub fn neighboring_as(segments: &[AsPathSegment]) -> Option<u32> {
    for segment in segments {
        if segment.segment_type == AsPathSegmentType::AsSequence {
            if let Some(first) = segment.asn_list.first() {
                return Some(*first);
            }
        }
    }
    None
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct Aggregator {
    pub asn: u32,
    pub addr: Ipv4Addr,
    /// On-wire ASN width, mirrors the session mode it was parsed or built in.
    pub four_byte: bool,
}

#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub enum PathAttrValue {
    Origin(Origin),
    AsPath(Vec<AsPathSegment>),
    NextHop(Ipv4Addr),
    MultiExitDisc(u32),
    LocalPref(u32),
    AtomicAggregate,
    Aggregator(Aggregator),
    Community(Vec<u32>),
    As4Path(Vec<AsPathSegment>),
    As4Aggregator(Aggregator),
}

#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct PathAttribute {
    pub flags: u8,
    pub value: PathAttrValue,
}

impl PathAttribute {
    pub fn type_code(&self) -> u8 {
        match &self.value {
            PathAttrValue::Origin(_) => attr_type_code::ORIGIN,
            PathAttrValue::AsPath(_) => attr_type_code::AS_PATH,
            PathAttrValue::NextHop(_) => attr_type_code::NEXT_HOP,
            PathAttrValue::MultiExitDisc(_) => attr_type_code::MULTI_EXIT_DISC,
            PathAttrValue::LocalPref(_) => attr_type_code::LOCAL_PREF,
            PathAttrValue::AtomicAggregate => attr_type_code::ATOMIC_AGGREGATE,
            PathAttrValue::Aggregator(_) => attr_type_code::AGGREGATOR,
            PathAttrValue::Community(_) => attr_type_code::COMMUNITY,
            PathAttrValue::As4Path(_) => attr_type_code::AS4_PATH,
            PathAttrValue::As4Aggregator(_) => attr_type_code::AS4_AGGREGATOR,
        }
    }

    pub fn is_transitive(&self) -> bool {
        self.flags & attr_flags::TRANSITIVE != 0
    }

    // Constructors carrying the canonical flags for each attribute type.

    pub fn origin(origin: Origin) -> Self {
        PathAttribute {
            flags: attr_flags::TRANSITIVE,
            value: PathAttrValue::Origin(origin),
        }
    }

    pub fn as_path(segments: Vec<AsPathSegment>) -> Self {
        PathAttribute {
            flags: attr_flags::TRANSITIVE,
            value: PathAttrValue::AsPath(segments),
        }
    }

    pub fn next_hop(addr: Ipv4Addr) -> Self {
        PathAttribute {
            flags: attr_flags::TRANSITIVE,
            value: PathAttrValue::NextHop(addr),
        }
    }

    pub fn multi_exit_disc(med: u32) -> Self {
        PathAttribute {
            flags: attr_flags::OPTIONAL,
            value: PathAttrValue::MultiExitDisc(med),
        }
    }

    pub fn local_pref(pref: u32) -> Self {
        PathAttribute {
            flags: attr_flags::TRANSITIVE,
            value: PathAttrValue::LocalPref(pref),
        }
    }

    pub fn atomic_aggregate() -> Self {
        PathAttribute {
            flags: attr_flags::TRANSITIVE,
            value: PathAttrValue::AtomicAggregate,
        }
    }

    pub fn aggregator(aggregator: Aggregator) -> Self {
        PathAttribute {
            flags: attr_flags::OPTIONAL | attr_flags::TRANSITIVE,
            value: PathAttrValue::Aggregator(aggregator),
        }
    }

    pub fn community(communities: Vec<u32>) -> Self {
        PathAttribute {
            flags: attr_flags::OPTIONAL | attr_flags::TRANSITIVE,
            value: PathAttrValue::Community(communities),
        }
    }

    pub fn as4_path(segments: Vec<AsPathSegment>) -> Self {
        PathAttribute {
            flags: attr_flags::OPTIONAL | attr_flags::TRANSITIVE,
            value: PathAttrValue::As4Path(segments),
        }
    }

    pub fn as4_aggregator(aggregator: Aggregator) -> Self {
        PathAttribute {
            flags: attr_flags::OPTIONAL | attr_flags::TRANSITIVE,
            value: PathAttrValue::As4Aggregator(aggregator),
        }
    }
}

/// Errors from the AS_PATH width transforms. These are local semantic
/// failures, not wire errors: the caller logs and aborts the operation
/// without touching session state.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AsPathTransformError {
    /// prepend in 4-octet mode requires the message to be normalized first
    As4PathPresent,
    /// segment width does not match the requested mode
    WidthMismatch,
    /// restore called on a path that is already 4-octet
    AlreadyFourByte,
}

impl Display for AsPathTransformError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            AsPathTransformError::As4PathPresent => {
                write!(f, "AS4_PATH present, restore the AS_PATH first")
            }
            AsPathTransformError::WidthMismatch => {
                write!(f, "AS_PATH segment width does not match mode")
            }
            AsPathTransformError::AlreadyFourByte => {
                write!(f, "AS_PATH is already four-octet")
            }
        }
    }
}

impl std::error::Error for AsPathTransformError {}

#[repr(u8)]
enum AttrType {
    Origin = 1,
    AsPath = 2,
    NextHop = 3,
    MultiExitDisc = 4,
    LocalPref = 5,
    AtomicAggregate = 6,
    Aggregator = 7,
    Community = 8,
    As4Path = 17,
    As4Aggregator = 18,
}

impl AttrType {
    fn from_code(value: u8) -> Option<Self> {
        match value {
            1 => Some(AttrType::Origin),
            2 => Some(AttrType::AsPath),
            3 => Some(AttrType::NextHop),
            4 => Some(AttrType::MultiExitDisc),
            5 => Some(AttrType::LocalPref),
            6 => Some(AttrType::AtomicAggregate),
            7 => Some(AttrType::Aggregator),
            8 => Some(AttrType::Community),
            17 => Some(AttrType::As4Path),
            18 => Some(AttrType::As4Aggregator),
            _ => None,
        }
    }

    fn expected_flags(&self) -> u8 {
        match self {
            AttrType::Origin => attr_flags::TRANSITIVE,
            AttrType::AsPath => attr_flags::TRANSITIVE,
            AttrType::NextHop => attr_flags::TRANSITIVE,
            AttrType::MultiExitDisc => attr_flags::OPTIONAL,
            AttrType::LocalPref => attr_flags::TRANSITIVE,
            AttrType::AtomicAggregate => attr_flags::TRANSITIVE,
            AttrType::Aggregator => attr_flags::OPTIONAL | attr_flags::TRANSITIVE,
            AttrType::Community => attr_flags::OPTIONAL | attr_flags::TRANSITIVE,
            AttrType::As4Path => attr_flags::OPTIONAL | attr_flags::TRANSITIVE,
            AttrType::As4Aggregator => attr_flags::OPTIONAL | attr_flags::TRANSITIVE,
        }
    }

    fn is_well_known(&self) -> bool {
        matches!(
            self,
            AttrType::Origin
                | AttrType::AsPath
                | AttrType::NextHop
                | AttrType::LocalPref
                | AttrType::AtomicAggregate
        )
    }
}

fn attribute_flags_error(flags: u8, attr_type_code: u8, attr_len: u16) -> ParserError {
    let mut data = vec![flags, attr_type_code];
    if extended_len(flags) {
        data.extend_from_slice(&attr_len.to_be_bytes());
    } else {
        data.push(attr_len as u8);
    }
    ParserError::BgpError {
        error: BgpError::UpdateMessageError(UpdateMessageError::AttributeFlagsError),
        data,
    }
}

fn validate_attribute_flags(
    flags: u8,
    attr_type: &AttrType,
    attr_type_code: u8,
    attr_len: u16,
) -> Result<(), ParserError> {
    let mask = attr_flags::OPTIONAL | attr_flags::TRANSITIVE;

    // Validate Optional and Transitive bits match the attribute type
    if (flags & mask) != attr_type.expected_flags() {
        return Err(attribute_flags_error(flags, attr_type_code, attr_len));
    }

    // Partial bit must be 0 for well-known attributes
    if attr_type.is_well_known() && (flags & attr_flags::PARTIAL != 0) {
        return Err(attribute_flags_error(flags, attr_type_code, attr_len));
    }

    Ok(())
}

fn validate_attribute_length(
    attr_type: &AttrType,
    attr_len: u16,
    attr_bytes: &[u8],
    use_4b_asn: bool,
) -> Result<(), ParserError> {
    let valid = match attr_type {
        AttrType::Origin => attr_len == 1,
        AttrType::NextHop => attr_len == 4,
        AttrType::MultiExitDisc => attr_len == 4,
        AttrType::LocalPref => attr_len == 4,
        AttrType::AtomicAggregate => attr_len == 0,
        AttrType::Aggregator => attr_len == if use_4b_asn { 8 } else { 6 },
        AttrType::Community => attr_len % 4 == 0,
        AttrType::As4Aggregator => attr_len == 8,
        AttrType::AsPath | AttrType::As4Path => true, // Variable length
    };

    if !valid {
        return Err(ParserError::BgpError {
            error: BgpError::UpdateMessageError(UpdateMessageError::AttributeLengthError),
            data: attr_bytes.to_vec(),
        });
    }

    Ok(())
}

fn malformed_as_path() -> ParserError {
    ParserError::BgpError {
        error: BgpError::UpdateMessageError(UpdateMessageError::MalformedASPath),
        data: Vec::new(),
    }
}

fn read_attr_as_path(bytes: &[u8], four_byte: bool) -> Result<Vec<AsPathSegment>, ParserError> {
    let asn_size = if four_byte { 4 } else { 2 };
    let mut segments = vec![];
    let mut cursor = 0;

    while cursor < bytes.len() {
        // Calculate total bytes needed for this segment (header + ASN data)
        let count = bytes.get(cursor + 1).copied().unwrap_or(0) as usize;
        let segment_size = 2 + count * asn_size;

        if cursor + segment_size > bytes.len() {
            return Err(malformed_as_path());
        }

        let segment_type = AsPathSegmentType::try_from(bytes[cursor])?;

        let asn_list = (0..count)
            .map(|i| {
                let pos = cursor + 2 + i * asn_size;
                if four_byte {
                    u32::from_be_bytes([
                        bytes[pos],
                        bytes[pos + 1],
                        bytes[pos + 2],
                        bytes[pos + 3],
                    ])
                } else {
                    u16::from_be_bytes([bytes[pos], bytes[pos + 1]]) as u32
                }
            })
            .collect();

        segments.push(AsPathSegment {
            segment_type,
            four_byte,
            asn_list,
        });

        cursor += segment_size;
    }

    Ok(segments)
}

fn write_attr_as_path(segments: &[AsPathSegment]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for segment in segments {
        bytes.push(segment.segment_type as u8);
        bytes.push(segment.asn_list.len() as u8);
        for asn in &segment.asn_list {
            if segment.four_byte {
                bytes.extend_from_slice(&asn.to_be_bytes());
            } else {
                bytes.extend_from_slice(&(*asn as u16).to_be_bytes());
            }
        }
    }
    bytes
}

fn read_attr_aggregator(bytes: &[u8], four_byte: bool) -> Result<Aggregator, ParserError> {
    let expected = if four_byte { 8 } else { 6 };
    if bytes.len() != expected {
        return Err(ParserError::BgpError {
            error: BgpError::UpdateMessageError(UpdateMessageError::AttributeLengthError),
            data: Vec::new(),
        });
    }

    let (asn, addr_off) = if four_byte {
        (
            u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            4,
        )
    } else {
        (u16::from_be_bytes([bytes[0], bytes[1]]) as u32, 2)
    };
    let addr = Ipv4Addr::new(
        bytes[addr_off],
        bytes[addr_off + 1],
        bytes[addr_off + 2],
        bytes[addr_off + 3],
    );

    Ok(Aggregator {
        asn,
        addr,
        four_byte,
    })
}

fn write_attr_aggregator(aggregator: &Aggregator) -> Vec<u8> {
    let mut bytes = Vec::new();
    if aggregator.four_byte {
        bytes.extend_from_slice(&aggregator.asn.to_be_bytes());
    } else {
        bytes.extend_from_slice(&(aggregator.asn as u16).to_be_bytes());
    }
    bytes.extend_from_slice(&aggregator.addr.octets());
    bytes
}

fn read_attr_communities(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// One attribute off the wire. Unrecognized optional attributes are skipped
/// (None); an unrecognized well-known attribute is a session error.
fn read_path_attribute(
    bytes: &[u8],
    use_4b_asn: bool,
) -> Result<(Option<PathAttribute>, u8, usize), ParserError> {
    if bytes.len() < 3 {
        return Err(ParserError::BgpError {
            error: BgpError::UpdateMessageError(UpdateMessageError::MalformedAttributeList),
            data: Vec::new(),
        });
    }

    let flags = bytes[0];
    let attr_type_code = bytes[1];

    let (attr_len, header_len) = if extended_len(flags) {
        if bytes.len() < 4 {
            return Err(ParserError::BgpError {
                error: BgpError::UpdateMessageError(UpdateMessageError::MalformedAttributeList),
                data: Vec::new(),
            });
        }
        (u16::from_be_bytes([bytes[2], bytes[3]]), 4)
    } else {
        (bytes[2] as u16, 3)
    };

    let attr_total_len = header_len + attr_len as usize;
    if attr_total_len > bytes.len() {
        return Err(ParserError::BgpError {
            error: BgpError::UpdateMessageError(UpdateMessageError::AttributeLengthError),
            data: bytes.to_vec(),
        });
    }
    let attr_bytes = &bytes[..attr_total_len];
    let attr_data = &bytes[header_len..attr_total_len];

    let attr_type = match AttrType::from_code(attr_type_code) {
        Some(t) => t,
        None => {
            // RFC 4271 Section 6.3: unrecognized well-known attributes are a
            // session error; unrecognized optional attributes are not ours to
            // judge and are skipped.
            if flags & attr_flags::OPTIONAL == 0 {
                return Err(ParserError::BgpError {
                    error: BgpError::UpdateMessageError(
                        UpdateMessageError::UnrecognizedWellKnownAttribute,
                    ),
                    data: attr_bytes.to_vec(),
                });
            }
            return Ok((None, attr_type_code, attr_total_len));
        }
    };

    validate_attribute_flags(flags, &attr_type, attr_type_code, attr_len)?;
    validate_attribute_length(&attr_type, attr_len, attr_bytes, use_4b_asn)?;

    let value = match attr_type {
        AttrType::Origin => PathAttrValue::Origin(Origin::try_from(attr_data[0])?),
        AttrType::AsPath => PathAttrValue::AsPath(read_attr_as_path(attr_data, use_4b_asn)?),
        AttrType::NextHop => PathAttrValue::NextHop(Ipv4Addr::new(
            attr_data[0],
            attr_data[1],
            attr_data[2],
            attr_data[3],
        )),
        AttrType::MultiExitDisc => PathAttrValue::MultiExitDisc(read_u32(attr_data)?),
        AttrType::LocalPref => PathAttrValue::LocalPref(read_u32(attr_data)?),
        AttrType::AtomicAggregate => PathAttrValue::AtomicAggregate,
        AttrType::Aggregator => {
            PathAttrValue::Aggregator(read_attr_aggregator(attr_data, use_4b_asn)?)
        }
        AttrType::Community => PathAttrValue::Community(read_attr_communities(attr_data)),
        AttrType::As4Path => PathAttrValue::As4Path(read_attr_as_path(attr_data, true)?),
        AttrType::As4Aggregator => {
            PathAttrValue::As4Aggregator(read_attr_aggregator(attr_data, true)?)
        }
    };

    Ok((
        Some(PathAttribute { flags, value }),
        attr_type_code,
        attr_total_len,
    ))
}

fn read_path_attributes(
    bytes: &[u8],
    use_4b_asn: bool,
) -> Result<Vec<PathAttribute>, ParserError> {
    let mut cursor = 0;
    let mut path_attributes: Vec<PathAttribute> = Vec::new();
    let mut seen_codes: Vec<u8> = Vec::new();

    while cursor < bytes.len() {
        let (attribute, type_code, consumed) =
            read_path_attribute(&bytes[cursor..], use_4b_asn)?;
        cursor += consumed;

        // RFC 4271 Section 5: each attribute appears at most once
        if seen_codes.contains(&type_code) {
            return Err(ParserError::BgpError {
                error: BgpError::UpdateMessageError(UpdateMessageError::MalformedAttributeList),
                data: Vec::new(),
            });
        }
        seen_codes.push(type_code);

        if let Some(attribute) = attribute {
            path_attributes.push(attribute);
        }
    }

    Ok(path_attributes)
}

fn write_path_attribute(attr: &PathAttribute) -> Vec<u8> {
    // Serialize attribute value first to determine length
    let attr_value_bytes = match &attr.value {
        PathAttrValue::Origin(origin) => vec![*origin as u8],
        PathAttrValue::AsPath(segments) => write_attr_as_path(segments),
        PathAttrValue::NextHop(next_hop) => next_hop.octets().to_vec(),
        PathAttrValue::MultiExitDisc(value) => value.to_be_bytes().to_vec(),
        PathAttrValue::LocalPref(value) => value.to_be_bytes().to_vec(),
        PathAttrValue::AtomicAggregate => vec![],
        PathAttrValue::Aggregator(agg) => write_attr_aggregator(agg),
        PathAttrValue::Community(communities) => {
            let mut value = Vec::new();
            for community in communities {
                value.extend_from_slice(&community.to_be_bytes());
            }
            value
        }
        PathAttrValue::As4Path(segments) => write_attr_as_path(segments),
        PathAttrValue::As4Aggregator(agg) => write_attr_aggregator(agg),
    };

    let mut bytes = Vec::new();

    // Extended length is an encoding decision, not a property of the value
    let attr_len = attr_value_bytes.len();
    let flags = if attr_len > u8::MAX as usize {
        attr.flags | attr_flags::EXTENDED_LENGTH
    } else {
        attr.flags & !attr_flags::EXTENDED_LENGTH
    };

    bytes.push(flags);
    bytes.push(attr.type_code());

    if extended_len(flags) {
        bytes.extend_from_slice(&(attr_len as u16).to_be_bytes());
    } else {
        bytes.push(attr_len as u8);
    }

    bytes.extend_from_slice(&attr_value_bytes);

    bytes
}

/// Attributes go on the wire in ascending type-code order regardless of
/// their order in memory.
fn write_path_attributes(path_attributes: &[PathAttribute]) -> Vec<u8> {
    let mut ordered: Vec<&PathAttribute> = path_attributes.iter().collect();
    ordered.sort_by_key(|attr| attr.type_code());

    let mut bytes = Vec::new();
    for attr in ordered {
        bytes.extend_from_slice(&write_path_attribute(attr));
    }
    bytes
}

fn validate_update_message_lengths(
    withdrawn_routes_len: usize,
    total_path_attributes_len: usize,
    body_length: usize,
) -> Result<(), ParserError> {
    // RFC 4271 Section 6.3: If Withdrawn Routes Length + Total Attribute Length + 23
    // exceeds the message Length, then Error Subcode MUST be set to Malformed Attribute List.
    // Since we work with body (message_length - 19), check becomes:
    // withdrawn_routes_len + total_path_attributes_len + 4 > body_length
    let length_fields_size = WITHDRAWN_ROUTES_LENGTH_SIZE + TOTAL_ATTR_LENGTH_SIZE;
    let claimed_size = withdrawn_routes_len + total_path_attributes_len + length_fields_size;

    if claimed_size > body_length {
        return Err(ParserError::BgpError {
            error: BgpError::UpdateMessageError(UpdateMessageError::MalformedAttributeList),
            data: Vec::new(),
        });
    }

    Ok(())
}

#[derive(Debug, PartialEq, Clone)]
pub struct UpdateMessage {
    withdrawn_routes: Vec<Ipv4Net>,
    path_attributes: Vec<PathAttribute>,
    nlri_list: Vec<Ipv4Net>,
}

impl UpdateMessage {
    /// Announce `nlri_list` with the standard attribute set.
    pub fn new(
        origin: Origin,
        as_path_segments: Vec<AsPathSegment>,
        next_hop: Ipv4Addr,
        nlri_list: Vec<Ipv4Net>,
        local_pref: Option<u32>,
        med: Option<u32>,
        atomic_aggregate: bool,
    ) -> Self {
        let mut path_attributes = vec![
            PathAttribute::origin(origin),
            PathAttribute::as_path(as_path_segments),
            PathAttribute::next_hop(next_hop),
        ];

        if let Some(pref) = local_pref {
            path_attributes.push(PathAttribute::local_pref(pref));
        }

        if let Some(metric) = med {
            path_attributes.push(PathAttribute::multi_exit_disc(metric));
        }

        if atomic_aggregate {
            path_attributes.push(PathAttribute::atomic_aggregate());
        }

        UpdateMessage {
            withdrawn_routes: vec![],
            path_attributes,
            nlri_list,
        }
    }

    /// Announce `nlri_list` with a ready-made attribute list.
    pub fn from_attribs(path_attributes: Vec<PathAttribute>, nlri_list: Vec<Ipv4Net>) -> Self {
        UpdateMessage {
            withdrawn_routes: vec![],
            path_attributes,
            nlri_list,
        }
    }

    pub fn new_withdraw(withdrawn_routes: Vec<Ipv4Net>) -> Self {
        UpdateMessage {
            withdrawn_routes,
            path_attributes: vec![],
            nlri_list: vec![],
        }
    }

    pub fn nlri_list(&self) -> &[Ipv4Net] {
        &self.nlri_list
    }

    pub fn withdrawn_routes(&self) -> &[Ipv4Net] {
        &self.withdrawn_routes
    }

    pub fn path_attributes(&self) -> &[PathAttribute] {
        &self.path_attributes
    }

    pub fn add_nlri(&mut self, net: Ipv4Net) {
        self.nlri_list.push(net);
    }

    pub fn get_attrib(&self, type_code: u8) -> Option<&PathAttribute> {
        self.path_attributes
            .iter()
            .find(|attr| attr.type_code() == type_code)
    }

    pub fn has_attrib(&self, type_code: u8) -> bool {
        self.get_attrib(type_code).is_some()
    }

    /// Add an attribute; refuses duplicates.
    pub fn add_attrib(&mut self, attrib: PathAttribute) -> bool {
        if self.has_attrib(attrib.type_code()) {
            return false;
        }
        self.path_attributes.push(attrib);
        true
    }

    pub fn set_attribs(&mut self, attribs: Vec<PathAttribute>) {
        self.path_attributes = attribs;
    }

    /// Remove an attribute by type code. Returns true if one was removed.
    pub fn drop_attrib(&mut self, type_code: u8) -> bool {
        let before = self.path_attributes.len();
        self.path_attributes
            .retain(|attr| attr.type_code() != type_code);
        self.path_attributes.len() != before
    }

    /// Drop-then-add replacement.
    pub fn update_attribute(&mut self, attrib: PathAttribute) {
        self.drop_attrib(attrib.type_code());
        self.path_attributes.push(attrib);
    }

    pub fn set_next_hop(&mut self, next_hop: Ipv4Addr) {
        self.update_attribute(PathAttribute::next_hop(next_hop));
    }

    pub fn get_origin(&self) -> Option<Origin> {
        self.path_attributes.iter().find_map(|attr| {
            if let PathAttrValue::Origin(origin) = attr.value {
                Some(origin)
            } else {
                None
            }
        })
    }

    pub fn get_as_path(&self) -> Option<Vec<AsPathSegment>> {
        self.path_attributes.iter().find_map(|attr| {
            if let PathAttrValue::AsPath(ref segments) = attr.value {
                Some(segments.clone())
            } else {
                None
            }
        })
    }

    pub fn get_next_hop(&self) -> Option<Ipv4Addr> {
        self.path_attributes.iter().find_map(|attr| {
            if let PathAttrValue::NextHop(addr) = attr.value {
                Some(addr)
            } else {
                None
            }
        })
    }

    pub fn get_local_pref(&self) -> Option<u32> {
        self.path_attributes.iter().find_map(|attr| {
            if let PathAttrValue::LocalPref(pref) = attr.value {
                Some(pref)
            } else {
                None
            }
        })
    }

    pub fn get_med(&self) -> Option<u32> {
        self.path_attributes.iter().find_map(|attr| {
            if let PathAttrValue::MultiExitDisc(med) = attr.value {
                Some(med)
            } else {
                None
            }
        })
    }

    pub fn get_atomic_aggregate(&self) -> bool {
        self.path_attributes
            .iter()
            .any(|attr| attr.value == PathAttrValue::AtomicAggregate)
    }

    /// Mandatory well-known attributes must be present when the message
    /// announces routes (RFC 4271 Section 6.3).
    pub fn validate(&self) -> Result<(), ParserError> {
        if self.nlri_list.is_empty() {
            return Ok(());
        }
        for code in [
            attr_type_code::ORIGIN,
            attr_type_code::AS_PATH,
            attr_type_code::NEXT_HOP,
        ] {
            if !self.has_attrib(code) {
                return Err(ParserError::BgpError {
                    error: BgpError::UpdateMessageError(
                        UpdateMessageError::MissingWellKnownAttribute,
                    ),
                    data: vec![code],
                });
            }
        }
        Ok(())
    }

    fn as_path_segments_mut(&mut self) -> Option<&mut Vec<AsPathSegment>> {
        self.path_attributes.iter_mut().find_map(|attr| {
            if let PathAttrValue::AsPath(ref mut segments) = attr.value {
                Some(segments)
            } else {
                None
            }
        })
    }

    fn as4_path_segments_mut(&mut self) -> Option<&mut Vec<AsPathSegment>> {
        self.path_attributes.iter_mut().find_map(|attr| {
            if let PathAttrValue::As4Path(ref mut segments) = attr.value {
                Some(segments)
            } else {
                None
            }
        })
    }

    /// Prepend `asn` to the AS_PATH (RFC 4271 Section 5.1.2).
    ///
    /// In 2-octet mode, ASNs that do not fit are written as AS_TRANS and the
    /// true value is prepended to AS4_PATH when one is present. In 4-octet
    /// mode the message must not carry AS4_PATH; normalize with
    /// [`UpdateMessage::restore_as_path`] first.
    pub fn prepend(&mut self, asn: u32, use_4b_asn: bool) -> Result<(), AsPathTransformError> {
        if use_4b_asn {
            if self.has_attrib(attr_type_code::AS4_PATH) {
                return Err(AsPathTransformError::As4PathPresent);
            }
            if !self.has_attrib(attr_type_code::AS_PATH) {
                self.add_attrib(PathAttribute::as_path(vec![AsPathSegment::sequence(
                    true,
                    vec![asn],
                )]));
                return Ok(());
            }
            if let Some(segments) = self.as_path_segments_mut() {
                if segments.iter().any(|s| !s.four_byte) {
                    return Err(AsPathTransformError::WidthMismatch);
                }
                prepend_to_segments(segments, asn, true);
            }
            Ok(())
        } else {
            let prep_asn = if asn >= 0xFFFF { AS_TRANS as u32 } else { asn };
            if !self.has_attrib(attr_type_code::AS_PATH) {
                self.add_attrib(PathAttribute::as_path(vec![AsPathSegment::sequence(
                    false,
                    vec![prep_asn],
                )]));
            } else if let Some(segments) = self.as_path_segments_mut() {
                if segments.iter().any(|s| s.four_byte) {
                    return Err(AsPathTransformError::WidthMismatch);
                }
                prepend_to_segments(segments, prep_asn, false);
            }
            // Keep the 4-octet shadow in sync with the true value
            if let Some(segments) = self.as4_path_segments_mut() {
                prepend_to_segments(segments, asn, true);
            }
            Ok(())
        }
    }

    /// Reconstruct the 4-octet AS_PATH at a 4-octet-capable receiver
    /// (RFC 6793 Section 4.2.3).
    ///
    /// The AS_PATH is widened, then the trailing N sequence ASNs are
    /// replaced by the N ASNs carried in AS4_PATH. An AS4_PATH longer than
    /// the AS_PATH is ignored. AS4_PATH is dropped afterwards.
    pub fn restore_as_path(&mut self) -> Result<(), AsPathTransformError> {
        // Collect the shadow ASNs before taking the AS_PATH mutably
        let as4_asns: Vec<u32> = match self.get_attrib(attr_type_code::AS4_PATH) {
            None => Vec::new(),
            Some(attr) => {
                if let PathAttrValue::As4Path(ref segs) = attr.value {
                    segs.iter()
                        .filter(|s| s.segment_type == AsPathSegmentType::AsSequence)
                        .flat_map(|s| s.asn_list.iter().copied())
                        .collect()
                } else {
                    Vec::new()
                }
            }
        };

        let segments = match self.as_path_segments_mut() {
            None => return Ok(()),
            Some(segments) => segments,
        };

        if segments.iter().any(|s| s.four_byte) {
            return Err(AsPathTransformError::AlreadyFourByte);
        }

        for segment in segments.iter_mut() {
            segment.four_byte = true;
        }

        let seq_positions: usize = segments
            .iter()
            .filter(|s| s.segment_type == AsPathSegmentType::AsSequence)
            .map(|s| s.asn_list.len())
            .sum();

        if !as4_asns.is_empty() && as4_asns.len() <= seq_positions {
            // Overlay the trailing N sequence positions, back to front
            let mut replacement = as4_asns.iter().rev();
            'outer: for segment in segments.iter_mut().rev() {
                if segment.segment_type != AsPathSegmentType::AsSequence {
                    continue;
                }
                for asn in segment.asn_list.iter_mut().rev() {
                    match replacement.next() {
                        Some(value) => *asn = *value,
                        None => break 'outer,
                    }
                }
            }
        }

        self.drop_attrib(attr_type_code::AS4_PATH);
        Ok(())
    }

    /// Rewrite a 4-octet AS_PATH for a 2-octet-only peer (RFC 6793
    /// Section 4.2.2): AS_TRANS substitutes for wide ASNs and the true path
    /// travels alongside in AS4_PATH.
    pub fn downgrade_as_path(&mut self) -> Result<(), AsPathTransformError> {
        let segments = match self.as_path_segments_mut() {
            None => return Ok(()),
            Some(segments) => segments,
        };

        if segments.iter().all(|s| !s.four_byte) {
            return Ok(());
        }

        let original = segments.clone();

        for segment in segments.iter_mut() {
            segment.four_byte = false;
            for asn in segment.asn_list.iter_mut() {
                if *asn >= 0xFFFF {
                    *asn = AS_TRANS as u32;
                }
            }
        }

        let shadow: Vec<AsPathSegment> = original
            .into_iter()
            .map(|mut segment| {
                segment.four_byte = true;
                segment
            })
            .collect();
        self.update_attribute(PathAttribute::as4_path(shadow));

        Ok(())
    }

    /// 4-octet AGGREGATOR reconstruction (RFC 6793 Section 4.2.3): when the
    /// AGGREGATOR carries AS_TRANS, the AS4_AGGREGATOR value is
    /// authoritative. AS4_AGGREGATOR is dropped either way.
    pub fn restore_aggregator(&mut self) {
        let as4_aggregator = self.path_attributes.iter().find_map(|attr| {
            if let PathAttrValue::As4Aggregator(agg) = attr.value {
                Some(agg)
            } else {
                None
            }
        });

        let aggregator = self.path_attributes.iter_mut().find_map(|attr| {
            if let PathAttrValue::Aggregator(ref mut agg) = attr.value {
                Some(agg)
            } else {
                None
            }
        });

        if let Some(agg) = aggregator {
            if agg.asn == AS_TRANS as u32 {
                if let Some(shadow) = as4_aggregator {
                    agg.asn = shadow.asn;
                    agg.addr = shadow.addr;
                }
            }
            agg.four_byte = true;
        }

        self.drop_attrib(attr_type_code::AS4_AGGREGATOR);
    }

    /// 2-octet AGGREGATOR rewrite for a 2-octet-only peer.
    pub fn downgrade_aggregator(&mut self) {
        let mut shadow = None;

        if let Some(agg) = self.path_attributes.iter_mut().find_map(|attr| {
            if let PathAttrValue::Aggregator(ref mut agg) = attr.value {
                Some(agg)
            } else {
                None
            }
        }) {
            if agg.asn >= 0xFFFF {
                shadow = Some(Aggregator {
                    asn: agg.asn,
                    addr: agg.addr,
                    four_byte: true,
                });
                agg.asn = AS_TRANS as u32;
            }
            agg.four_byte = false;
        }

        if let Some(shadow) = shadow {
            self.update_attribute(PathAttribute::as4_aggregator(shadow));
        }
    }

    /// Strip attributes that must not cross an EBGP boundary.
    pub fn drop_non_transitive(&mut self) {
        self.path_attributes.retain(|attr| attr.is_transitive());
    }

    pub fn from_bytes(bytes: Vec<u8>, use_4b_asn: bool) -> Result<Self, ParserError> {
        let body_length = bytes.len();
        if body_length < WITHDRAWN_ROUTES_LENGTH_SIZE {
            return Err(ParserError::BgpError {
                error: BgpError::UpdateMessageError(UpdateMessageError::MalformedAttributeList),
                data: Vec::new(),
            });
        }

        let withdrawn_routes_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        let mut data = &bytes[WITHDRAWN_ROUTES_LENGTH_SIZE..];

        if data.len() < withdrawn_routes_len + TOTAL_ATTR_LENGTH_SIZE {
            return Err(ParserError::BgpError {
                error: BgpError::UpdateMessageError(UpdateMessageError::MalformedAttributeList),
                data: Vec::new(),
            });
        }
        let withdrawn_routes = parse_nlri_list(&data[..withdrawn_routes_len])?;
        data = &data[withdrawn_routes_len..];

        let total_path_attributes_len = u16::from_be_bytes([data[0], data[1]]) as usize;

        validate_update_message_lengths(
            withdrawn_routes_len,
            total_path_attributes_len,
            body_length,
        )?;

        data = &data[TOTAL_ATTR_LENGTH_SIZE..];

        let path_attributes =
            read_path_attributes(&data[..total_path_attributes_len], use_4b_asn)?;
        data = &data[total_path_attributes_len..];

        let nlri_list = parse_nlri_list(data)?;

        Ok(UpdateMessage {
            withdrawn_routes,
            path_attributes,
            nlri_list,
        })
    }
}

/// Push `asn` at the front of the path: into the leading AS_SEQUENCE when it
/// has room, otherwise as a fresh leading segment.
fn prepend_to_segments(segments: &mut Vec<AsPathSegment>, asn: u32, four_byte: bool) {
    if let Some(first) = segments.first_mut() {
        if first.segment_type == AsPathSegmentType::AsSequence
            && first.asn_list.len() < MAX_SEGMENT_LEN
        {
            first.asn_list.insert(0, asn);
            return;
        }
    }
    segments.insert(0, AsPathSegment::sequence(four_byte, vec![asn]));
}

impl Message for UpdateMessage {
    fn kind(&self) -> MessageType {
        MessageType::UPDATE
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();

        // Withdrawn routes
        let withdrawn_routes_bytes = write_nlri_list(&self.withdrawn_routes);
        bytes.extend_from_slice(&(withdrawn_routes_bytes.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&withdrawn_routes_bytes);

        // Path attributes
        let path_attributes_bytes = write_path_attributes(&self.path_attributes);
        bytes.extend_from_slice(&(path_attributes_bytes.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&path_attributes_bytes);

        // NLRI
        bytes.extend_from_slice(&write_nlri_list(&self.nlri_list));

        bytes
    }
}
