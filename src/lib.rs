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

//! An embeddable BGP-4 speaker core: wire codec, per-peer finite state
//! machine, and a shared Routing Information Base with deterministic
//! best-path selection.
//!
//! The crate does no I/O of its own. Bytes from the transport go into
//! [`fsm::BgpFsm::run`]; outbound bytes leave through the injected
//! [`fsm::OutHandler`]; time comes from an injected [`clock::Clock`].
//! Multiple FSMs can share one [`rib::BgpRib4`] and exchange route and
//! collision events over an [`event::RouteEventBus`].

pub mod bgp;
pub mod clock;
pub mod config;
pub mod event;
pub mod fsm;
pub mod log;
pub mod rib;
