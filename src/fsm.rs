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

//! The per-peer BGP finite state machine. Bytes in through [`BgpFsm::run`],
//! bytes out through the injected [`OutHandler`]; no sockets, no threads,
//! no wall clock of its own.

use crate::bgp::msg::{BgpMessage, Message, MessageType};
use crate::bgp::msg_keepalive::KeepAliveMessage;
use crate::bgp::msg_notification::{
    BgpError, CeaseSubcode, FsmErrorSubcode, NotificationMessage,
};
use crate::bgp::msg_open::{OpenMessage, AS_TRANS};
use crate::bgp::msg_update::{attr_type_code, PathAttribute, UpdateMessage};
use crate::bgp::sink::BgpSink;
use crate::bgp::utils::{Ipv4Net, ParserError};
use crate::clock::{Clock, SystemClock};
use crate::config::SessionConfig;
use crate::event::{RouteEvent, RouteEventBus, RouteEventReceiver, SubscriberId};
use crate::log::Logger;
use crate::rib::{BgpRib4, Rib4Entry, RouteSource, WithdrawOutcome};
use crate::{debug, error, fatal, info, warn};
use std::cmp::min;
use std::sync::{Arc, Mutex};

/// Where outbound wire bytes go. The transport owns buffering and the
/// socket; a false return is unrecoverable and breaks the FSM.
pub trait OutHandler: Send {
    fn write(&mut self, bytes: &[u8]) -> bool;
}

pub type SharedRib = Arc<Mutex<BgpRib4>>;

/// Everything a session needs at construction: the declarative
/// [`SessionConfig`] plus the runtime collaborators. Omitted collaborators
/// get private defaults (own RIB, wall clock, default logger).
pub struct FsmConfig {
    pub session: SessionConfig,
    pub out_handler: Box<dyn OutHandler>,
    pub logger: Option<Logger>,
    pub clock: Option<Arc<dyn Clock>>,
    pub rib: Option<SharedRib>,
    pub rev_bus: Option<Arc<RouteEventBus>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BgpState {
    Idle,
    OpenSent,
    OpenConfirm,
    Established,
    /// Unrecoverable internal fault; only a hard reset leaves this state.
    Broken,
}

pub struct BgpFsm {
    config: SessionConfig,
    state: BgpState,
    in_sink: BgpSink,
    out: Box<dyn OutHandler>,
    logger: Logger,
    clock: Arc<dyn Clock>,
    rib: SharedRib,
    rev_bus: Option<Arc<RouteEventBus>>,
    bus_id: Option<SubscriberId>,

    // negotiated session data
    hold_timer: u16,
    peer_bgp_id: u32,
    peer_asn: u32,
    use_4b_asn: bool,

    last_sent_ms: u64,
    last_recv_ms: u64,
}

impl BgpFsm {
    pub fn new(config: FsmConfig) -> Self {
        let logger = config.logger.unwrap_or_default();
        let clock = config
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let rib = config
            .rib
            .unwrap_or_else(|| Arc::new(Mutex::new(BgpRib4::with_logger(logger.clone()))));
        let now = clock.now_ms();

        BgpFsm {
            config: config.session,
            state: BgpState::Idle,
            in_sink: BgpSink::new(),
            out: config.out_handler,
            logger,
            clock,
            rib,
            rev_bus: config.rev_bus,
            bus_id: None,
            hold_timer: 0,
            peer_bgp_id: 0,
            peer_asn: 0,
            use_4b_asn: false,
            last_sent_ms: now,
            last_recv_ms: now,
        }
    }

    /// Construct and subscribe to the configured event bus in one step.
    /// Sessions sharing a RIB need this so routes fan out between them.
    pub fn attached(config: FsmConfig) -> Arc<Mutex<BgpFsm>> {
        let bus = config.rev_bus.clone();
        let fsm = Arc::new(Mutex::new(BgpFsm::new(config)));
        if let Some(bus) = bus {
            let id = bus.subscribe(&fsm);
            fsm.lock().unwrap().bus_id = Some(id);
        }
        fsm
    }

    pub fn state(&self) -> BgpState {
        self.state
    }

    pub fn asn(&self) -> u32 {
        self.config.asn
    }

    pub fn bgp_id(&self) -> u32 {
        u32::from(self.config.router_id)
    }

    pub fn peer_asn(&self) -> u32 {
        self.peer_asn
    }

    pub fn peer_bgp_id(&self) -> u32 {
        self.peer_bgp_id
    }

    pub fn hold_timer(&self) -> u16 {
        self.hold_timer
    }

    pub fn use_4b_asn(&self) -> bool {
        self.use_4b_asn
    }

    pub fn rib(&self) -> SharedRib {
        Arc::clone(&self.rib)
    }

    /// Open the session actively: send OPEN, go to OpenSent.
    /// Returns 1 on success, 0 when the FSM cannot start.
    pub fn start(&mut self) -> i32 {
        if self.state == BgpState::Broken {
            error!(self.logger, "fsm is broken, consider hard reset");
            return 0;
        }
        if self.state != BgpState::Idle {
            error!(self.logger, "start requires the Idle state", "state" => format!("{:?}", self.state));
            return 0;
        }
        if !self.config.hold_time_valid() {
            error!(self.logger, "configured hold time is invalid", "hold_time" => self.config.hold_time_secs);
            return 0;
        }

        let open = self.make_open(self.config.hold_time_secs);
        self.state = BgpState::OpenSent;
        if !self.write_message(&open) {
            return -1;
        }
        1
    }

    /// Close the session administratively. Returns 1 on success.
    pub fn stop(&mut self) -> i32 {
        if self.state == BgpState::Broken {
            error!(self.logger, "fsm is broken, consider hard reset");
            return 0;
        }
        if self.state == BgpState::Idle {
            return 1;
        }

        let notify = NotificationMessage::new(
            BgpError::Cease(CeaseSubcode::AdministrativeShutdown),
            Vec::new(),
        );
        self.state = BgpState::Idle;
        if !self.write_message(&notify) {
            return -1;
        }
        1
    }

    /// Feed received bytes and process every complete message.
    ///
    /// Returns -1 fatal (Broken), 0 protocol error (NOTIFICATION sent, now
    /// Idle), 1 success, 2 peer sent NOTIFICATION (now Idle), 3 incomplete
    /// (wait for more bytes).
    pub fn run(&mut self, buffer: &[u8]) -> i32 {
        if self.state == BgpState::Broken {
            error!(self.logger, "fsm is broken, consider hard reset");
            return -1;
        }

        if let Err(err) = self.in_sink.feed(buffer) {
            error!(self.logger, "input sink overflow, tearing session down");
            let sent = self.send_notification_for(&err);
            self.state = BgpState::Idle;
            self.in_sink.clear();
            return if sent { 0 } else { -1 };
        }

        // tick the clock
        let tick_ret = self.tick();
        if tick_ret <= 0 {
            return tick_ret;
        }
        self.last_recv_ms = self.clock.now_ms();

        let mut processed = false;
        let mut final_ret = 1;

        loop {
            let frame = match self.in_sink.pop() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    error!(self.logger, "framing error", "err" => err.to_string());
                    let sent = self.send_notification_for(&err);
                    self.state = BgpState::Idle;
                    self.in_sink.clear();
                    return if sent { 0 } else { -1 };
                }
            };
            processed = true;

            let message = match BgpMessage::from_frame(&frame, self.use_4b_asn) {
                Ok(message) => message,
                Err(err) => {
                    if frame[18] == MessageType::NOTIFICATION.as_u8() {
                        error!(self.logger, "got invalid NOTIFICATION message");
                        self.state = BgpState::Idle;
                        return 0;
                    }
                    error!(self.logger, "message parse failed", "err" => err.to_string());
                    let sent = self.send_notification_for(&err);
                    self.state = BgpState::Idle;
                    return if sent { 0 } else { -1 };
                }
            };

            if let BgpMessage::Notification(notify) = &message {
                error!(self.logger, "got NOTIFICATION",
                    "code" => notify.error().error_code(),
                    "subcode" => notify.error().error_subcode());
                self.state = BgpState::Idle;
                return 2;
            }

            let vald_ret = self.validate_state(message.kind());
            if vald_ret <= 0 {
                return vald_ret;
            }

            let ret = match (self.state, message) {
                (BgpState::Idle, BgpMessage::Open(open)) => self.fsm_eval_idle(&open),
                (BgpState::OpenSent, BgpMessage::Open(open)) => self.fsm_eval_open_sent(&open),
                (BgpState::OpenConfirm, BgpMessage::KeepAlive(_)) => self.fsm_eval_open_confirm(),
                (BgpState::Established, message) => self.fsm_eval_established(message),
                _ => 1,
            };

            if ret < 0 {
                return ret;
            }
            if ret == 0 {
                final_ret = 0;
            }
        }

        if !processed {
            return 3;
        }
        final_ret
    }

    /// Drive the hold and keepalive timers. Returns 0 when the hold timer
    /// expired (NOTIFICATION sent, now Idle), 2 when a KEEPALIVE was sent,
    /// 1 otherwise; -1 if the output handler failed.
    pub fn tick(&mut self) -> i32 {
        if self.state != BgpState::Established || self.hold_timer == 0 {
            return 1;
        }

        let now = self.clock.now_ms();
        let hold_ms = self.hold_timer as u64 * 1000;

        if now.saturating_sub(self.last_recv_ms) >= hold_ms {
            error!(self.logger, "peer hold timer expired");
            let notify = NotificationMessage::new(BgpError::HoldTimerExpired, Vec::new());
            self.state = BgpState::Idle;
            if !self.write_message(&notify) {
                return -1;
            }
            return 0;
        }

        if now.saturating_sub(self.last_sent_ms) >= hold_ms / 3 {
            if !self.write_message(&KeepAliveMessage {}) {
                return -1;
            }
            return 2;
        }

        1
    }

    /// Graceful reset: notify the peer, then reset state. Returns 0, or -1
    /// if the NOTIFICATION could not be written.
    pub fn reset_soft(&mut self) -> i32 {
        let notify = NotificationMessage::new(
            BgpError::Cease(CeaseSubcode::AdministrativeReset),
            Vec::new(),
        );
        let ok = self.write_message(&notify);
        self.reset_hard();
        if !ok {
            return -1;
        }
        0
    }

    /// Drop buffered input and return to Idle. The only way out of Broken.
    pub fn reset_hard(&mut self) {
        self.in_sink.clear();
        self.state = BgpState::Idle;
    }

    fn make_open(&self, hold_time: u16) -> OpenMessage {
        let bgp_id = u32::from(self.config.router_id);
        if self.config.use_4b_asn {
            OpenMessage::new_with_four_octet_as(self.config.asn, hold_time, bgp_id)
        } else {
            let asn_2b = if self.config.asn >= 0xFFFF {
                AS_TRANS
            } else {
                self.config.asn as u16
            };
            OpenMessage::new(asn_2b, hold_time, bgp_id)
        }
    }

    /// Validate and absorb a peer OPEN: ASN checks, hold negotiation,
    /// collision arbitration. Returns 1 to proceed, 0 when the OPEN was
    /// rejected (NOTIFICATION sent, now Idle).
    fn open_recv(&mut self, open: &OpenMessage) -> i32 {
        let peer_cap_asn = open.four_octet_asn();

        // A 4-octet-capable peer that also fits in 2 octets must advertise
        // consistently; when the 2-octet field is AS_TRANS the capability
        // value is authoritative (RFC 6793 Section 4.2.1)
        if let Some(cap_asn) = peer_cap_asn {
            if open.asn != AS_TRANS && open.asn as u32 != (cap_asn & 0xFFFF) {
                return self.reject_open(BgpError::OpenMessageError(
                    crate::bgp::msg_notification::OpenMessageError::BadPeerAs,
                ));
            }
        }

        let peer_asn = open.effective_asn();
        if self.config.peer_asn != 0 && peer_asn != self.config.peer_asn {
            error!(self.logger, "unexpected peer ASN",
                "got" => peer_asn, "want" => self.config.peer_asn);
            return self.reject_open(BgpError::OpenMessageError(
                crate::bgp::msg_notification::OpenMessageError::BadPeerAs,
            ));
        }

        let negotiated_hold = min(self.config.hold_time_secs, open.hold_time);
        if negotiated_hold != 0 && negotiated_hold < 3 {
            error!(self.logger, "unacceptable hold time", "hold_time" => negotiated_hold);
            return self.reject_open(BgpError::OpenMessageError(
                crate::bgp::msg_notification::OpenMessageError::UnacceptedHoldTime,
            ));
        }

        if open.bgp_identifier == u32::from(self.config.router_id) {
            error!(self.logger, "peer BGP id equals local BGP id");
            return self.reject_open(BgpError::OpenMessageError(
                crate::bgp::msg_notification::OpenMessageError::BadBgpIdentifier,
            ));
        }

        if !self.config.no_collision_detection {
            if let Some(bus) = self.rev_bus.clone() {
                let complaints = bus.publish(
                    self.bus_id,
                    &RouteEvent::Collision {
                        peer_bgp_id: open.bgp_identifier,
                    },
                );
                // A complaint means a live session to this speaker claimed
                // the right to survive; arbitrate our own fate
                if complaints > 0 {
                    match self.resolve_collision(open.bgp_identifier, true) {
                        0 => return 0,
                        -1 => return -1,
                        _ => {
                            fatal!(self.logger,
                                "collision: both sessions claim to survive, duplicated fsm?");
                            self.state = BgpState::Broken;
                            return -1;
                        }
                    }
                }
            }
        }

        self.hold_timer = negotiated_hold;
        self.peer_bgp_id = open.bgp_identifier;
        self.peer_asn = peer_asn;
        self.use_4b_asn = self.config.use_4b_asn && peer_cap_asn.is_some();

        info!(self.logger, "peer OPEN accepted",
            "peer_asn" => peer_asn,
            "peer_bgp_id" => std::net::Ipv4Addr::from(open.bgp_identifier).to_string(),
            "hold_timer" => self.hold_timer,
            "use_4b_asn" => self.use_4b_asn);
        1
    }

    fn reject_open(&mut self, error: BgpError) -> i32 {
        let notify = NotificationMessage::new(error, Vec::new());
        self.state = BgpState::Idle;
        if !self.write_message(&notify) {
            return -1;
        }
        0
    }

    /// RFC 4271 Section 6.8 connection collision resolution. The session
    /// whose side of the comparison loses sends Cease/Connection Collision
    /// Resolution and returns to Idle.
    ///
    /// Returns 1 when this FSM survives, 0 when it closed itself, -1 on
    /// write failure.
    fn resolve_collision(&mut self, peer_bgp_id: u32, is_new: bool) -> i32 {
        let local_wins = u32::from(self.config.router_id) > peer_bgp_id;

        // The existing session survives exactly when the local id wins; the
        // new session closes in that case, and vice versa
        let survive = if is_new { !local_wins } else { local_wins };

        if survive {
            return 1;
        }

        info!(self.logger, "closing for collision resolution",
            "peer_bgp_id" => std::net::Ipv4Addr::from(peer_bgp_id).to_string());
        let notify = NotificationMessage::new(
            BgpError::Cease(CeaseSubcode::ConnectionCollisionResolution),
            Vec::new(),
        );
        self.state = BgpState::Idle;
        if !self.write_message(&notify) {
            return -1;
        }
        0
    }

    fn validate_state(&mut self, kind: MessageType) -> i32 {
        let subcode = match self.state {
            BgpState::Idle => {
                if kind == MessageType::OPEN {
                    return 1;
                }
                debug!(self.logger, "dropping non-OPEN message in Idle state");
                return 0;
            }
            BgpState::OpenSent => {
                if kind == MessageType::OPEN {
                    return 1;
                }
                FsmErrorSubcode::UnexpectedMessageInOpenSent
            }
            BgpState::OpenConfirm => {
                if kind == MessageType::KEEPALIVE {
                    return 1;
                }
                FsmErrorSubcode::UnexpectedMessageInOpenConfirm
            }
            BgpState::Established => {
                if kind == MessageType::UPDATE || kind == MessageType::KEEPALIVE {
                    return 1;
                }
                FsmErrorSubcode::UnexpectedMessageInEstablished
            }
            BgpState::Broken => {
                error!(self.logger, "got message while broken, consider hard reset");
                return -1;
            }
        };

        error!(self.logger, "unexpected message for state",
            "state" => format!("{:?}", self.state), "type" => kind.as_u8());
        let notify =
            NotificationMessage::new(BgpError::FiniteStateMachineError(subcode), Vec::new());
        self.state = BgpState::Idle;
        if !self.write_message(&notify) {
            return -1;
        }
        0
    }

    /// Passive open: a peer opened the conversation while we were Idle.
    fn fsm_eval_idle(&mut self, open: &OpenMessage) -> i32 {
        let ret = self.open_recv(open);
        if ret != 1 {
            return ret;
        }

        let reply = self.make_open(self.hold_timer);
        self.state = BgpState::OpenConfirm;
        if !self.write_message(&reply) {
            return -1;
        }
        if !self.write_message(&KeepAliveMessage {}) {
            return -1;
        }
        1
    }

    fn fsm_eval_open_sent(&mut self, open: &OpenMessage) -> i32 {
        let ret = self.open_recv(open);
        if ret != 1 {
            return ret;
        }

        self.state = BgpState::OpenConfirm;
        if !self.write_message(&KeepAliveMessage {}) {
            return -1;
        }
        1
    }

    fn fsm_eval_open_confirm(&mut self) -> i32 {
        self.state = BgpState::Established;
        if !self.write_message(&KeepAliveMessage {}) {
            return -1;
        }
        info!(self.logger, "session established",
            "peer_bgp_id" => std::net::Ipv4Addr::from(self.peer_bgp_id).to_string());
        self.advertise_rib()
    }

    fn fsm_eval_established(&mut self, message: BgpMessage) -> i32 {
        match message {
            BgpMessage::KeepAlive(_) => 1,
            BgpMessage::Update(update) => self.handle_update(update),
            _ => 1,
        }
    }

    /// Feed the current table to a freshly established peer, one UPDATE per
    /// arrival cohort.
    fn advertise_rib(&mut self) -> i32 {
        let groups = {
            let rib = self.rib.lock().unwrap();
            let entries: Vec<Rib4Entry> = rib.best_entries().cloned().collect();
            group_by_cohort(&entries)
        };

        for (attribs, routes) in groups {
            let mut update = UpdateMessage::from_attribs((*attribs).clone(), routes);
            if !self.prepare_update_message(&mut update) {
                continue;
            }
            if !self.write_message(&update) {
                return -1;
            }
        }
        1
    }

    fn handle_update(&mut self, mut update: UpdateMessage) -> i32 {
        if let Err(err) = update.validate() {
            error!(self.logger, "invalid UPDATE", "err" => err.to_string());
            let sent = self.send_notification_for(&err);
            self.state = BgpState::Idle;
            return if sent { 0 } else { -1 };
        }

        if self.use_4b_asn {
            // RFC 6793 Section 6: AS4_PATH must not appear on a 4-octet
            // session; discard rather than tear down
            if update.drop_attrib(attr_type_code::AS4_PATH) {
                warn!(self.logger, "peer sent AS4_PATH on a 4-octet session, dropped");
            }
            update.drop_attrib(attr_type_code::AS4_AGGREGATOR);
        } else {
            if let Err(err) = update.restore_as_path() {
                error!(self.logger, "AS_PATH reconstruction failed", "err" => err.to_string());
                let notify = NotificationMessage::new(
                    BgpError::UpdateMessageError(
                        crate::bgp::msg_notification::UpdateMessageError::MalformedASPath,
                    ),
                    Vec::new(),
                );
                self.state = BgpState::Idle;
                if !self.write_message(&notify) {
                    return -1;
                }
                return 0;
            }
            update.restore_aggregator();
        }

        let withdrawn = update.withdrawn_routes().to_vec();
        let mut nlri = update.nlri_list().to_vec();

        if !nlri.is_empty() && !self.config.no_nexthop_check {
            let nexthop_valid = match update.get_next_hop() {
                Some(nexthop) => self.config.peering_lan.includes(nexthop),
                None => false,
            };
            if !nexthop_valid {
                warn!(self.logger, "ignoring routes with nexthop outside peering LAN");
                nlri.clear();
            }
        }

        let source = if self.peer_asn == self.config.asn {
            RouteSource::Ibgp {
                peer_asn: self.peer_asn,
            }
        } else {
            RouteSource::Ebgp
        };

        // Apply everything for this UPDATE before publishing: subscribers
        // re-enter the RIB, so the lock must be released first
        let mut unreachable: Vec<Ipv4Net> = Vec::new();
        let mut changed_bests: Vec<Rib4Entry> = Vec::new();
        {
            let mut rib = self.rib.lock().unwrap();
            for route in &withdrawn {
                match rib.withdraw(self.peer_bgp_id, *route) {
                    WithdrawOutcome::Unreachable => unreachable.push(*route),
                    WithdrawOutcome::NewBest(entry) => changed_bests.push(entry),
                    WithdrawOutcome::BestUnchanged | WithdrawOutcome::NotPresent => {}
                }
            }
            if !nlri.is_empty() {
                let attribs = Arc::new(update.path_attributes().to_vec());
                changed_bests.extend(rib.insert_many(
                    self.peer_bgp_id,
                    &nlri,
                    attribs,
                    self.config.weight,
                    source,
                ));
            }
        }

        if let Some(bus) = self.rev_bus.clone() {
            if !unreachable.is_empty() {
                bus.publish(
                    self.bus_id,
                    &RouteEvent::Withdraw {
                        routes: unreachable,
                    },
                );
            }
            for (attribs, routes) in group_by_cohort(&changed_bests) {
                bus.publish(self.bus_id, &RouteEvent::Add { routes, attribs });
            }
        }

        1
    }

    /// Rewrite a cloned attribute set for this peer: EBGP egress strips
    /// non-transitive attributes, prepends the local ASN and fixes the
    /// nexthop; 2-octet peers get the downgraded AS_PATH pair. Returns
    /// false when the outbound attempt must be abandoned.
    fn prepare_update_message(&mut self, update: &mut UpdateMessage) -> bool {
        let ebgp = self.peer_asn != self.config.asn;

        if ebgp {
            update.drop_non_transitive();

            let rewrite = self.config.forced_default_nexthop
                || match update.get_next_hop() {
                    Some(nexthop) => !self.config.peering_lan.includes(nexthop),
                    None => true,
                };
            if rewrite {
                update.set_next_hop(self.config.nexthop);
            }

            if let Err(err) = update.prepend(self.config.asn, true) {
                error!(self.logger, "cannot prepend local ASN", "err" => err.to_string());
                return false;
            }
        }

        if !self.use_4b_asn {
            if let Err(err) = update.downgrade_as_path() {
                error!(self.logger, "cannot downgrade AS_PATH", "err" => err.to_string());
                return false;
            }
            update.downgrade_aggregator();
        }

        true
    }

    fn handle_route_add_event(
        &mut self,
        routes: &[Ipv4Net],
        attribs: &Arc<Vec<PathAttribute>>,
    ) -> bool {
        if self.state != BgpState::Established {
            return false;
        }

        let mut update = UpdateMessage::from_attribs((**attribs).clone(), routes.to_vec());
        if !self.prepare_update_message(&mut update) {
            return false;
        }
        self.write_message(&update)
    }

    fn handle_route_withdraw_event(&mut self, routes: &[Ipv4Net]) -> bool {
        if self.state != BgpState::Established {
            return false;
        }

        let update = UpdateMessage::new_withdraw(routes.to_vec());
        self.write_message(&update)
    }

    fn handle_collision_event(&mut self, peer_bgp_id: u32) -> bool {
        if self.state != BgpState::OpenConfirm {
            return false;
        }
        if self.peer_bgp_id != peer_bgp_id {
            return false;
        }
        self.resolve_collision(peer_bgp_id, false) == 1
    }

    fn send_notification_for(&mut self, err: &ParserError) -> bool {
        match NotificationMessage::from_parser_error(err) {
            Some(notify) => self.write_message(&notify),
            None => true,
        }
    }

    fn write_message(&mut self, message: &dyn Message) -> bool {
        let bytes = message.serialize();
        self.last_sent_ms = self.clock.now_ms();

        if !self.out.write(&bytes) {
            fatal!(self.logger, "output handler failed, fsm is now broken");
            self.state = BgpState::Broken;
            return false;
        }
        true
    }
}

impl RouteEventReceiver for BgpFsm {
    fn handle_route_event(&mut self, event: &RouteEvent) -> bool {
        match event {
            RouteEvent::Add { routes, attribs } => self.handle_route_add_event(routes, attribs),
            RouteEvent::Withdraw { routes } => self.handle_route_withdraw_event(routes),
            RouteEvent::Collision { peer_bgp_id } => self.handle_collision_event(*peer_bgp_id),
        }
    }
}

impl Drop for BgpFsm {
    fn drop(&mut self) {
        if let (Some(bus), Some(id)) = (&self.rev_bus, self.bus_id) {
            bus.unsubscribe(id);
        }
    }
}

/// Group entries that arrived together so each cohort travels in one
/// outbound UPDATE with its shared attribute list.
fn group_by_cohort(entries: &[Rib4Entry]) -> Vec<(Arc<Vec<PathAttribute>>, Vec<Ipv4Net>)> {
    let mut groups: Vec<(u64, Arc<Vec<PathAttribute>>, Vec<Ipv4Net>)> = Vec::new();

    for entry in entries {
        match groups.iter_mut().find(|(id, _, _)| *id == entry.update_id) {
            Some((_, _, routes)) => routes.push(entry.route),
            None => groups.push((
                entry.update_id,
                Arc::clone(&entry.attribs),
                vec![entry.route],
            )),
        }
    }

    groups.sort_by_key(|(id, _, _)| *id);
    groups
        .into_iter()
        .map(|(_, attribs, routes)| (attribs, routes))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::msg_update::{AsPathSegment, Origin};
    use crate::clock::ManualClock;
    use crate::log::LogLevel;
    use std::net::Ipv4Addr;

    /// Captures every frame the FSM writes.
    #[derive(Clone, Default)]
    pub(crate) struct CaptureOut {
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl CaptureOut {
        pub fn new() -> Self {
            CaptureOut::default()
        }

        pub fn frames(&self) -> Vec<Vec<u8>> {
            self.frames.lock().unwrap().clone()
        }

        pub fn types(&self) -> Vec<u8> {
            self.frames().iter().map(|f| f[18]).collect()
        }

        pub fn clear(&self) {
            self.frames.lock().unwrap().clear();
        }

        pub fn last_notification(&self) -> Option<(u8, u8)> {
            self.frames()
                .iter()
                .rev()
                .find(|f| f[18] == MessageType::NOTIFICATION.as_u8())
                .map(|f| (f[19], f[20]))
        }
    }

    impl OutHandler for CaptureOut {
        fn write(&mut self, bytes: &[u8]) -> bool {
            self.frames.lock().unwrap().push(bytes.to_vec());
            true
        }
    }

    struct FailingOut;

    impl OutHandler for FailingOut {
        fn write(&mut self, _bytes: &[u8]) -> bool {
            false
        }
    }

    fn test_session(asn: u32, router_id: Ipv4Addr, hold: u16) -> SessionConfig {
        SessionConfig {
            asn,
            router_id,
            hold_time_secs: hold,
            ..SessionConfig::default()
        }
    }

    fn test_fsm(
        session: SessionConfig,
        out: CaptureOut,
        clock: Arc<ManualClock>,
    ) -> BgpFsm {
        BgpFsm::new(FsmConfig {
            session,
            out_handler: Box::new(out),
            logger: Some(Logger::new(LogLevel::Fatal)),
            clock: Some(clock),
            rib: None,
            rev_bus: None,
        })
    }

    fn peer_open(asn: u32, hold: u16, bgp_id: u32) -> Vec<u8> {
        OpenMessage::new_with_four_octet_as(asn, hold, bgp_id).serialize()
    }

    fn keepalive() -> Vec<u8> {
        KeepAliveMessage {}.serialize()
    }

    /// Drive an FSM to Established with the standard test peer.
    fn establish(fsm: &mut BgpFsm) {
        assert_eq!(fsm.start(), 1);
        assert_eq!(fsm.run(&peer_open(65002, 180, 0x0a000002)), 1);
        assert_eq!(fsm.run(&keepalive()), 1);
        assert_eq!(fsm.state(), BgpState::Established);
    }

    #[test]
    fn test_start_sends_open_with_capability() {
        let out = CaptureOut::new();
        let clock = Arc::new(ManualClock::new(0));
        let mut fsm = test_fsm(
            test_session(395849, Ipv4Addr::new(10, 0, 0, 1), 90),
            out.clone(),
            clock,
        );

        assert_eq!(fsm.start(), 1);
        assert_eq!(fsm.state(), BgpState::OpenSent);

        let frames = out.frames();
        assert_eq!(frames.len(), 1);
        let open = OpenMessage::from_bytes(frames[0][19..].to_vec()).unwrap();
        assert_eq!(open.asn, AS_TRANS);
        assert_eq!(open.four_octet_asn(), Some(395849));
        assert_eq!(open.hold_time, 90);
        assert_eq!(open.bgp_identifier, 0x0a000001);
    }

    #[test]
    fn test_start_twice_fails() {
        let out = CaptureOut::new();
        let clock = Arc::new(ManualClock::new(0));
        let mut fsm = test_fsm(
            test_session(65001, Ipv4Addr::new(10, 0, 0, 1), 90),
            out.clone(),
            clock,
        );

        assert_eq!(fsm.start(), 1);
        assert_eq!(fsm.start(), 0);
    }

    #[test]
    fn test_start_invalid_hold_time() {
        let out = CaptureOut::new();
        let clock = Arc::new(ManualClock::new(0));
        let mut fsm = test_fsm(
            test_session(65001, Ipv4Addr::new(10, 0, 0, 1), 2),
            out.clone(),
            clock,
        );

        assert_eq!(fsm.start(), 0);
        assert_eq!(fsm.state(), BgpState::Idle);
    }

    #[test]
    fn test_open_handshake_negotiation() {
        let out = CaptureOut::new();
        let clock = Arc::new(ManualClock::new(0));
        let mut fsm = test_fsm(
            test_session(65001, Ipv4Addr::new(10, 0, 0, 1), 90),
            out.clone(),
            clock,
        );

        fsm.start();
        assert_eq!(fsm.run(&peer_open(65002, 180, 0x0a000002)), 1);
        assert_eq!(fsm.state(), BgpState::OpenConfirm);
        assert_eq!(fsm.hold_timer(), 90); // min(90, 180)
        assert_eq!(fsm.peer_asn(), 65002);
        assert_eq!(fsm.peer_bgp_id(), 0x0a000002);
        assert!(fsm.use_4b_asn());

        assert_eq!(fsm.run(&keepalive()), 1);
        assert_eq!(fsm.state(), BgpState::Established);

        // OPEN out, then KEEPALIVE on OPEN receipt, then KEEPALIVE on
        // establishment
        assert_eq!(out.types(), vec![1, 4, 4]);
    }

    #[test]
    fn test_passive_open_from_idle() {
        let out = CaptureOut::new();
        let clock = Arc::new(ManualClock::new(0));
        let mut fsm = test_fsm(
            test_session(65001, Ipv4Addr::new(10, 0, 0, 1), 90),
            out.clone(),
            clock,
        );

        assert_eq!(fsm.run(&peer_open(65002, 180, 0x0a000002)), 1);
        assert_eq!(fsm.state(), BgpState::OpenConfirm);
        // Reply OPEN then KEEPALIVE
        assert_eq!(out.types(), vec![1, 4]);

        let reply = OpenMessage::from_bytes(out.frames()[0][19..].to_vec()).unwrap();
        assert_eq!(reply.hold_time, 90); // negotiated, not proposed
    }

    #[test]
    fn test_two_byte_peer_negotiates_2b_session() {
        let out = CaptureOut::new();
        let clock = Arc::new(ManualClock::new(0));
        let mut fsm = test_fsm(
            test_session(65001, Ipv4Addr::new(10, 0, 0, 1), 90),
            out.clone(),
            clock,
        );

        fsm.start();
        let open_2b = OpenMessage::new(65002, 180, 0x0a000002).serialize();
        assert_eq!(fsm.run(&open_2b), 1);
        assert!(!fsm.use_4b_asn());
        assert_eq!(fsm.peer_asn(), 65002);
    }

    #[test]
    fn test_bad_peer_asn_rejected() {
        let out = CaptureOut::new();
        let clock = Arc::new(ManualClock::new(0));
        let mut session = test_session(65001, Ipv4Addr::new(10, 0, 0, 1), 90);
        session.peer_asn = 65002;
        let mut fsm = test_fsm(session, out.clone(), clock);

        fsm.start();
        assert_eq!(fsm.run(&peer_open(65003, 180, 0x0a000002)), 0);
        assert_eq!(fsm.state(), BgpState::Idle);
        assert_eq!(out.last_notification(), Some((2, 2))); // OPEN error, Bad Peer AS
    }

    #[test]
    fn test_peer_id_equal_to_local_rejected() {
        let out = CaptureOut::new();
        let clock = Arc::new(ManualClock::new(0));
        let mut fsm = test_fsm(
            test_session(65001, Ipv4Addr::new(10, 0, 0, 1), 90),
            out.clone(),
            clock,
        );

        fsm.start();
        assert_eq!(fsm.run(&peer_open(65002, 180, 0x0a000001)), 0);
        assert_eq!(out.last_notification(), Some((2, 3))); // Bad BGP Identifier
    }

    #[test]
    fn test_unexpected_message_in_open_sent() {
        let out = CaptureOut::new();
        let clock = Arc::new(ManualClock::new(0));
        let mut fsm = test_fsm(
            test_session(65001, Ipv4Addr::new(10, 0, 0, 1), 90),
            out.clone(),
            clock,
        );

        fsm.start();
        assert_eq!(fsm.run(&keepalive()), 0);
        assert_eq!(fsm.state(), BgpState::Idle);
        assert_eq!(out.last_notification(), Some((5, 1))); // FSM error, OpenSent
    }

    #[test]
    fn test_notification_returns_2() {
        let out = CaptureOut::new();
        let clock = Arc::new(ManualClock::new(0));
        let mut fsm = test_fsm(
            test_session(65001, Ipv4Addr::new(10, 0, 0, 1), 90),
            out.clone(),
            clock,
        );

        fsm.start();
        let notify = NotificationMessage::new(
            BgpError::Cease(CeaseSubcode::AdministrativeShutdown),
            Vec::new(),
        )
        .serialize();
        assert_eq!(fsm.run(&notify), 2);
        assert_eq!(fsm.state(), BgpState::Idle);
    }

    #[test]
    fn test_run_incomplete_returns_3() {
        let out = CaptureOut::new();
        let clock = Arc::new(ManualClock::new(0));
        let mut fsm = test_fsm(
            test_session(65001, Ipv4Addr::new(10, 0, 0, 1), 90),
            out.clone(),
            clock,
        );

        fsm.start();
        let open = peer_open(65002, 180, 0x0a000002);
        assert_eq!(fsm.run(&open[..10]), 3);
        assert_eq!(fsm.run(&open[10..]), 1);
        assert_eq!(fsm.state(), BgpState::OpenConfirm);
    }

    #[test]
    fn test_bad_marker_tears_session_down() {
        let out = CaptureOut::new();
        let clock = Arc::new(ManualClock::new(0));
        let mut fsm = test_fsm(
            test_session(65001, Ipv4Addr::new(10, 0, 0, 1), 90),
            out.clone(),
            clock,
        );

        fsm.start();
        let mut open = peer_open(65002, 180, 0x0a000002);
        open[0] = 0x00;
        assert_eq!(fsm.run(&open), 0);
        assert_eq!(fsm.state(), BgpState::Idle);
        assert_eq!(out.last_notification(), Some((1, 1))); // Connection Not Synchronized
    }

    #[test]
    fn test_update_inserts_into_rib() {
        let out = CaptureOut::new();
        let clock = Arc::new(ManualClock::new(0));
        let mut fsm = test_fsm(
            test_session(65001, Ipv4Addr::new(10, 0, 0, 1), 90),
            out.clone(),
            clock,
        );
        establish(&mut fsm);

        let update = UpdateMessage::new(
            Origin::IGP,
            vec![AsPathSegment::sequence(true, vec![65002])],
            Ipv4Addr::new(10, 0, 0, 2),
            vec![Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 0), 8)],
            None,
            None,
            false,
        )
        .serialize();

        assert_eq!(fsm.run(&update), 1);

        let rib = fsm.rib();
        let rib = rib.lock().unwrap();
        let entry = rib.lookup(Ipv4Addr::new(10, 0, 0, 1)).unwrap();
        assert_eq!(entry.src_router_id, 0x0a000002);
        assert_eq!(entry.route, Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 0), 8));
        assert_eq!(entry.next_hop(), Some(Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[test]
    fn test_withdraw_removes_from_rib() {
        let out = CaptureOut::new();
        let clock = Arc::new(ManualClock::new(0));
        let mut fsm = test_fsm(
            test_session(65001, Ipv4Addr::new(10, 0, 0, 1), 90),
            out.clone(),
            clock,
        );
        establish(&mut fsm);

        let prefix = Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 0), 8);
        let update = UpdateMessage::new(
            Origin::IGP,
            vec![AsPathSegment::sequence(true, vec![65002])],
            Ipv4Addr::new(10, 0, 0, 2),
            vec![prefix],
            None,
            None,
            false,
        )
        .serialize();
        assert_eq!(fsm.run(&update), 1);

        let withdraw = UpdateMessage::new_withdraw(vec![prefix]).serialize();
        assert_eq!(fsm.run(&withdraw), 1);

        let rib = fsm.rib();
        assert_eq!(rib.lock().unwrap().lookup(Ipv4Addr::new(10, 0, 0, 1)), None);
    }

    #[test]
    fn test_update_missing_mandatory_attribute() {
        let out = CaptureOut::new();
        let clock = Arc::new(ManualClock::new(0));
        let mut fsm = test_fsm(
            test_session(65001, Ipv4Addr::new(10, 0, 0, 1), 90),
            out.clone(),
            clock,
        );
        establish(&mut fsm);

        // NLRI without NEXT_HOP
        let mut update = UpdateMessage::new_withdraw(vec![]);
        update.add_attrib(PathAttribute::origin(Origin::IGP));
        update.add_attrib(PathAttribute::as_path(vec![AsPathSegment::sequence(
            true,
            vec![65002],
        )]));
        update.add_nlri(Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 0), 8));

        assert_eq!(fsm.run(&update.serialize()), 0);
        assert_eq!(fsm.state(), BgpState::Idle);
        assert_eq!(out.last_notification(), Some((3, 3))); // UPDATE error, Missing Well-known
    }

    #[test]
    fn test_hold_timer_expiry() {
        let out = CaptureOut::new();
        let clock = Arc::new(ManualClock::new(0));
        let mut fsm = test_fsm(
            test_session(65001, Ipv4Addr::new(10, 0, 0, 1), 3),
            out.clone(),
            Arc::clone(&clock),
        );
        establish(&mut fsm);
        out.clear();

        clock.set(1000);
        assert_ne!(fsm.tick(), 0);
        clock.set(2000);
        assert_ne!(fsm.tick(), 0);

        clock.set(3000);
        assert_eq!(fsm.tick(), 0);
        assert_eq!(fsm.state(), BgpState::Idle);
        assert_eq!(out.last_notification(), Some((4, 0))); // Hold Timer Expired
    }

    #[test]
    fn test_keepalive_sent_at_one_third_hold() {
        let out = CaptureOut::new();
        let clock = Arc::new(ManualClock::new(0));
        let mut fsm = test_fsm(
            test_session(65001, Ipv4Addr::new(10, 0, 0, 1), 90),
            out.clone(),
            Arc::clone(&clock),
        );
        establish(&mut fsm);
        out.clear();

        clock.set(29_000);
        assert_eq!(fsm.tick(), 1);

        clock.set(30_000);
        assert_eq!(fsm.tick(), 2);
        assert_eq!(out.types(), vec![4]);

        // Idempotent with unchanged time
        assert_eq!(fsm.tick(), 1);
    }

    #[test]
    fn test_tick_noop_outside_established() {
        let out = CaptureOut::new();
        let clock = Arc::new(ManualClock::new(0));
        let mut fsm = test_fsm(
            test_session(65001, Ipv4Addr::new(10, 0, 0, 1), 3),
            out.clone(),
            Arc::clone(&clock),
        );

        clock.set(100_000);
        assert_eq!(fsm.tick(), 1);
        assert_eq!(fsm.state(), BgpState::Idle);
    }

    #[test]
    fn test_stop_sends_cease() {
        let out = CaptureOut::new();
        let clock = Arc::new(ManualClock::new(0));
        let mut fsm = test_fsm(
            test_session(65001, Ipv4Addr::new(10, 0, 0, 1), 90),
            out.clone(),
            clock,
        );
        establish(&mut fsm);

        assert_eq!(fsm.stop(), 1);
        assert_eq!(fsm.state(), BgpState::Idle);
        assert_eq!(out.last_notification(), Some((6, 2))); // Cease, Administrative Shutdown

        // Stop in Idle is a no-op success
        assert_eq!(fsm.stop(), 1);
    }

    #[test]
    fn test_reset_soft() {
        let out = CaptureOut::new();
        let clock = Arc::new(ManualClock::new(0));
        let mut fsm = test_fsm(
            test_session(65001, Ipv4Addr::new(10, 0, 0, 1), 90),
            out.clone(),
            clock,
        );
        establish(&mut fsm);

        assert_eq!(fsm.reset_soft(), 0);
        assert_eq!(fsm.state(), BgpState::Idle);
        assert_eq!(out.last_notification(), Some((6, 4))); // Cease, Administrative Reset
    }

    #[test]
    fn test_output_failure_breaks_fsm() {
        let clock = Arc::new(ManualClock::new(0));
        let mut fsm = BgpFsm::new(FsmConfig {
            session: test_session(65001, Ipv4Addr::new(10, 0, 0, 1), 90),
            out_handler: Box::new(FailingOut),
            logger: Some(Logger::new(LogLevel::Fatal)),
            clock: Some(clock),
            rib: None,
            rev_bus: None,
        });

        assert_eq!(fsm.start(), -1);
        assert_eq!(fsm.state(), BgpState::Broken);
        assert_eq!(fsm.run(&[]), -1);
        assert_eq!(fsm.start(), 0);

        fsm.reset_hard();
        assert_eq!(fsm.state(), BgpState::Idle);
    }

    #[test]
    fn test_group_by_cohort() {
        let attribs_a = crate::rib::test_helpers::test_attribs();
        let attribs_b = crate::rib::test_helpers::test_attribs();
        let entries = vec![
            crate::rib::test_helpers::test_entry(1, |e| {
                e.update_id = 7;
                e.attribs = Arc::clone(&attribs_a);
                e.route = Ipv4Net::new(Ipv4Addr::new(10, 0, 1, 0), 24);
            }),
            crate::rib::test_helpers::test_entry(1, |e| {
                e.update_id = 9;
                e.attribs = Arc::clone(&attribs_b);
                e.route = Ipv4Net::new(Ipv4Addr::new(10, 0, 2, 0), 24);
            }),
            crate::rib::test_helpers::test_entry(1, |e| {
                e.update_id = 7;
                e.attribs = Arc::clone(&attribs_a);
                e.route = Ipv4Net::new(Ipv4Addr::new(10, 0, 3, 0), 24);
            }),
        ];

        let groups = group_by_cohort(&entries);
        assert_eq!(groups.len(), 2);
        assert_eq!(
            groups[0].1,
            vec![
                Ipv4Net::new(Ipv4Addr::new(10, 0, 1, 0), 24),
                Ipv4Net::new(Ipv4Addr::new(10, 0, 3, 0), 24),
            ]
        );
        assert_eq!(groups[1].1, vec![Ipv4Net::new(Ipv4Addr::new(10, 0, 2, 0), 24)]);
    }
}
