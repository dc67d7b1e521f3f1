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

use crate::bgp::msg_update::{
    as_path_length, neighboring_as, AsPathSegment, Origin, PathAttrValue, PathAttribute,
};
use crate::bgp::utils::Ipv4Net;
use crate::rib::types::RouteSource;
use std::cmp::Ordering;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// One RIB entry: a prefix as seen from one source.
///
/// The attribute list is shared because every entry that arrived in the
/// same UPDATE carries the identical set; entries grouped under one
/// `update_id` can be coalesced into a single outbound UPDATE.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rib4Entry {
    pub route: Ipv4Net,
    /// BGP id of the announcing speaker; 0 for locally originated routes.
    pub src_router_id: u32,
    /// Entries with the same update id arrived together and share attributes.
    pub update_id: u64,
    /// Administrative preference, local only, never advertised.
    pub weight: i32,
    pub source: RouteSource,
    pub attribs: Arc<Vec<PathAttribute>>,
}

impl Rib4Entry {
    pub fn is_local(&self) -> bool {
        self.src_router_id == 0
    }

    pub fn next_hop(&self) -> Option<Ipv4Addr> {
        self.attribs.iter().find_map(|attr| {
            if let PathAttrValue::NextHop(addr) = attr.value {
                Some(addr)
            } else {
                None
            }
        })
    }

    pub fn origin(&self) -> Option<Origin> {
        self.attribs.iter().find_map(|attr| {
            if let PathAttrValue::Origin(origin) = attr.value {
                Some(origin)
            } else {
                None
            }
        })
    }

    pub fn as_path(&self) -> Option<&Vec<AsPathSegment>> {
        self.attribs.iter().find_map(|attr| {
            if let PathAttrValue::AsPath(ref segments) = attr.value {
                Some(segments)
            } else {
                None
            }
        })
    }

    pub fn local_pref(&self) -> Option<u32> {
        self.attribs.iter().find_map(|attr| {
            if let PathAttrValue::LocalPref(pref) = attr.value {
                Some(pref)
            } else {
                None
            }
        })
    }

    pub fn med(&self) -> Option<u32> {
        self.attribs.iter().find_map(|attr| {
            if let PathAttrValue::MultiExitDisc(med) = attr.value {
                Some(med)
            } else {
                None
            }
        })
    }

    fn as_path_len(&self) -> usize {
        self.as_path().map(|s| as_path_length(s)).unwrap_or(0)
    }

    fn neighboring_as(&self) -> Option<u32> {
        self.as_path().and_then(|s| neighboring_as(s))
    }

    fn origin_rank(&self) -> u8 {
        self.origin().unwrap_or(Origin::INCOMPLETE) as u8
    }
}

impl PartialOrd for Rib4Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Rib4Entry {
    /// Best-path arbitration. Greater means preferred. In order:
    /// weight, locally-originated, LOCAL_PREF (absent = 100), AS_PATH
    /// length (AS_SET counts 1), ORIGIN, MED (same neighbor AS only),
    /// EBGP over IBGP, then lowest source router id as the deterministic
    /// tiebreaker.
    fn cmp(&self, other: &Self) -> Ordering {
        // Step 1: administrative weight, highest wins
        match self.weight.cmp(&other.weight) {
            Ordering::Equal => {}
            ord => return ord,
        }

        // Step 2: prefer the locally-originated entry
        match (self.is_local(), other.is_local()) {
            (true, false) => return Ordering::Greater,
            (false, true) => return Ordering::Less,
            _ => {}
        }

        // Step 3: highest LOCAL_PREF, absent treated as 100
        let self_local_pref = self.local_pref().unwrap_or(100);
        let other_local_pref = other.local_pref().unwrap_or(100);
        match self_local_pref.cmp(&other_local_pref) {
            Ordering::Equal => {}
            ord => return ord,
        }

        // Step 4: shortest AS_PATH, AS_SET counting as 1
        match other.as_path_len().cmp(&self.as_path_len()) {
            Ordering::Equal => {}
            ord => return ord,
        }

        // Step 5: lowest ORIGIN (IGP < EGP < INCOMPLETE)
        match other.origin_rank().cmp(&self.origin_rank()) {
            Ordering::Equal => {}
            ord => return ord,
        }

        // Step 6: lowest MED, only comparable between routes from the same
        // neighboring AS (RFC 4271 Section 9.1.2.2(c)); absent treated as 0
        if self.neighboring_as() == other.neighboring_as() {
            match other.med().unwrap_or(0).cmp(&self.med().unwrap_or(0)) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }

        // Step 7: prefer eBGP-learned over iBGP-learned
        match (&self.source, &other.source) {
            (RouteSource::Ebgp, RouteSource::Ibgp { .. }) => return Ordering::Greater,
            (RouteSource::Ibgp { .. }, RouteSource::Ebgp) => return Ordering::Less,
            _ => {}
        }

        // Step 8: lowest source router id
        other.src_router_id.cmp(&self.src_router_id)
    }
}
