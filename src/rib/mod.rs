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

//! Routing Information Base (RIB) module
//!
//! One table per address family; this crate carries the IPv4 variant.
//! Entries are keyed by (prefix, announcing speaker) and each prefix has
//! exactly one deterministically-selected best entry.

mod entry;
mod rib4;
mod types;

// Re-exports
pub use entry::Rib4Entry;
pub use rib4::BgpRib4;
pub use types::{RouteSource, WithdrawOutcome};
