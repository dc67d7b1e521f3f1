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

use crate::bgp::utils::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;

/// Declarative half of a peering session's configuration. Runtime
/// collaborators (RIB, event bus, clock, output sink, logger) are wired in
/// at FSM construction.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SessionConfig {
    /// Local ASN.
    pub asn: u32,
    /// Expected peer ASN; 0 accepts any.
    #[serde(default)]
    pub peer_asn: u32,
    /// Local BGP identifier.
    pub router_id: Ipv4Addr,
    /// Proposed hold interval in seconds: 0 disables, otherwise at least 3.
    #[serde(default = "default_hold_time")]
    pub hold_time_secs: u16,
    /// Advertise the RFC 6793 four-octet ASN capability.
    #[serde(default = "default_use_4b_asn")]
    pub use_4b_asn: bool,
    /// Administrative weight attached to routes learned on this session.
    #[serde(default)]
    pub weight: i32,
    /// Local egress address written into outbound NEXT_HOP when rewriting.
    #[serde(default = "default_nexthop")]
    pub nexthop: Ipv4Addr,
    /// Nexthops outside this prefix are invalid: ignored inbound, rewritten
    /// outbound. The default accepts and preserves everything.
    #[serde(default = "default_peering_lan")]
    pub peering_lan: Ipv4Net,
    /// Always rewrite outbound NEXT_HOP to `nexthop`.
    #[serde(default)]
    pub forced_default_nexthop: bool,
    /// Skip the inbound nexthop validity check.
    #[serde(default)]
    pub no_nexthop_check: bool,
    /// Skip collision detection on the event bus.
    #[serde(default)]
    pub no_collision_detection: bool,
}

fn default_hold_time() -> u16 {
    180
}

fn default_use_4b_asn() -> bool {
    true
}

fn default_nexthop() -> Ipv4Addr {
    Ipv4Addr::new(0, 0, 0, 0)
}

fn default_peering_lan() -> Ipv4Net {
    Ipv4Net::new(Ipv4Addr::new(0, 0, 0, 0), 0)
}

impl SessionConfig {
    /// Create a new configuration
    pub fn new(asn: u32, peer_asn: u32, router_id: Ipv4Addr, hold_time_secs: u16) -> Self {
        SessionConfig {
            asn,
            peer_asn,
            router_id,
            hold_time_secs,
            ..SessionConfig::default()
        }
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    /// Hold interval is 0 (disabled) or at least 3 seconds (RFC 4271
    /// Section 4.2).
    pub fn hold_time_valid(&self) -> bool {
        self.hold_time_secs == 0 || self.hold_time_secs >= 3
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            asn: 65000,
            peer_asn: 0,
            router_id: Ipv4Addr::new(1, 1, 1, 1),
            hold_time_secs: default_hold_time(),
            use_4b_asn: default_use_4b_asn(),
            weight: 0,
            nexthop: default_nexthop(),
            peering_lan: default_peering_lan(),
            forced_default_nexthop: false,
            no_nexthop_check: false,
            no_collision_detection: false,
        }
    }
}
