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

use super::entry::Rib4Entry;

/// Source of a route
#[derive(Debug, Clone, PartialEq, Eq, Hash, Copy)]
pub enum RouteSource {
    /// Route learned from an EBGP peer (external AS)
    Ebgp,
    /// Route learned from an IBGP peer; the peer's ASN is an arbitration input
    Ibgp { peer_asn: u32 },
    /// Route originated locally by this router
    Local,
}

impl RouteSource {
    /// Check if this route was learned via iBGP
    pub fn is_ibgp(&self) -> bool {
        matches!(self, RouteSource::Ibgp { .. })
    }

    /// Check if this route was learned via eBGP
    pub fn is_ebgp(&self) -> bool {
        matches!(self, RouteSource::Ebgp)
    }

    /// Check if this route was originated locally
    pub fn is_local(&self) -> bool {
        matches!(self, RouteSource::Local)
    }
}

/// What a withdraw did to the prefix's best entry.
#[derive(Debug, PartialEq)]
pub enum WithdrawOutcome {
    /// No entry with that (prefix, scope) existed.
    NotPresent,
    /// The entry was removed but was not best; nothing to re-advertise.
    BestUnchanged,
    /// The best entry was removed and this one replaced it.
    NewBest(Rib4Entry),
    /// The last entry for the prefix was removed.
    Unreachable,
}

impl WithdrawOutcome {
    /// True unless the (prefix, scope) pair was absent.
    pub fn was_present(&self) -> bool {
        !matches!(self, WithdrawOutcome::NotPresent)
    }
}
