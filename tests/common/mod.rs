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

#![allow(dead_code)]

use bgplite::bgp::msg::{Message, MessageType};
use bgplite::bgp::msg_keepalive::KeepAliveMessage;
use bgplite::bgp::msg_open::OpenMessage;
use bgplite::bgp::msg_update::UpdateMessage;
use bgplite::clock::{Clock, ManualClock};
use bgplite::config::SessionConfig;
use bgplite::fsm::{BgpFsm, FsmConfig, OutHandler, SharedRib};
use bgplite::log::{LogLevel, Logger};
use bgplite::rib::BgpRib4;
use bgplite::event::RouteEventBus;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

/// Captures every frame an FSM writes, for inspection and for piping into
/// another FSM.
#[derive(Clone, Default)]
pub struct CaptureOut {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl CaptureOut {
    pub fn new() -> Self {
        CaptureOut::default()
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().clone()
    }

    /// Message type byte of every captured frame.
    pub fn types(&self) -> Vec<u8> {
        self.frames().iter().map(|f| f[18]).collect()
    }

    pub fn clear(&self) {
        self.frames.lock().unwrap().clear();
    }

    /// Drain captured frames as one contiguous byte stream.
    pub fn drain_stream(&self) -> Vec<u8> {
        let mut frames = self.frames.lock().unwrap();
        let stream = frames.concat();
        frames.clear();
        stream
    }

    pub fn last_notification(&self) -> Option<(u8, u8)> {
        self.frames()
            .iter()
            .rev()
            .find(|f| f[18] == MessageType::NOTIFICATION.as_u8())
            .map(|f| (f[19], f[20]))
    }

    pub fn updates(&self, use_4b_asn: bool) -> Vec<UpdateMessage> {
        self.frames()
            .iter()
            .filter(|f| f[18] == MessageType::UPDATE.as_u8())
            .map(|f| UpdateMessage::from_bytes(f[19..].to_vec(), use_4b_asn).unwrap())
            .collect()
    }
}

impl OutHandler for CaptureOut {
    fn write(&mut self, bytes: &[u8]) -> bool {
        self.frames.lock().unwrap().push(bytes.to_vec());
        true
    }
}

pub fn quiet_logger() -> Logger {
    Logger::new(LogLevel::Fatal)
}

pub fn shared_rib() -> SharedRib {
    Arc::new(Mutex::new(BgpRib4::with_logger(quiet_logger())))
}

pub fn session(asn: u32, router_id: [u8; 4], hold: u16) -> SessionConfig {
    SessionConfig {
        asn,
        router_id: Ipv4Addr::from(router_id),
        hold_time_secs: hold,
        ..SessionConfig::default()
    }
}

pub struct TestPeer {
    pub fsm: Arc<Mutex<BgpFsm>>,
    pub out: CaptureOut,
    pub clock: Arc<ManualClock>,
}

impl TestPeer {
    pub fn new(
        config: SessionConfig,
        rib: Option<SharedRib>,
        bus: Option<Arc<RouteEventBus>>,
    ) -> Self {
        let out = CaptureOut::new();
        let clock = Arc::new(ManualClock::new(0));
        let fsm = BgpFsm::attached(FsmConfig {
            session: config,
            out_handler: Box::new(out.clone()),
            logger: Some(quiet_logger()),
            clock: Some(Arc::clone(&clock) as Arc<dyn Clock>),
            rib,
            rev_bus: bus,
        });
        TestPeer { fsm, out, clock }
    }

    pub fn run(&self, bytes: &[u8]) -> i32 {
        self.fsm.lock().unwrap().run(bytes)
    }
}

pub fn peer_open_4b(asn: u32, hold: u16, bgp_id: u32) -> Vec<u8> {
    OpenMessage::new_with_four_octet_as(asn, hold, bgp_id).serialize()
}

pub fn peer_open_2b(asn: u16, hold: u16, bgp_id: u32) -> Vec<u8> {
    OpenMessage::new(asn, hold, bgp_id).serialize()
}

pub fn keepalive() -> Vec<u8> {
    KeepAliveMessage {}.serialize()
}

/// Shuttle buffered output between two connected FSMs until neither has
/// anything left to say.
pub fn pump(a: &TestPeer, b: &TestPeer) {
    loop {
        let a_to_b = a.out.drain_stream();
        let b_to_a = b.out.drain_stream();
        if a_to_b.is_empty() && b_to_a.is_empty() {
            break;
        }
        if !a_to_b.is_empty() {
            b.run(&a_to_b);
        }
        if !b_to_a.is_empty() {
            a.run(&b_to_a);
        }
    }
}
