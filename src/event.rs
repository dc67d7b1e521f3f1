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

//! In-process pub/sub between FSM instances sharing a RIB. Route
//! add/withdraw events fan out learned routes to the other peers;
//! collision events arbitrate duplicate sessions to the same speaker.
//!
//! The bus holds only weak references: subscribers own the bus, never the
//! other way around, so dropping an FSM cannot leak a cycle.

use crate::bgp::msg_update::PathAttribute;
use crate::bgp::utils::Ipv4Net;
use std::sync::{Arc, Mutex, Weak};

#[derive(Debug, Clone)]
pub enum RouteEvent {
    /// Routes became reachable (or changed attributes); one shared
    /// attribute list covers every route in the event.
    Add {
        routes: Vec<Ipv4Net>,
        attribs: Arc<Vec<PathAttribute>>,
    },
    /// Routes became unreachable.
    Withdraw { routes: Vec<Ipv4Net> },
    /// An OPEN arrived from a speaker another FSM is already mid-session
    /// with.
    Collision { peer_bgp_id: u32 },
}

pub trait RouteEventReceiver: Send {
    /// Returns true if the receiver acted on the event. Collision
    /// resolution counts the acting receivers to decide which session
    /// survives.
    fn handle_route_event(&mut self, event: &RouteEvent) -> bool;
}

pub type SubscriberId = u64;

type SharedReceiver = Weak<Mutex<dyn RouteEventReceiver>>;

struct BusInner {
    subscribers: Vec<(SubscriberId, SharedReceiver)>,
    next_id: SubscriberId,
}

#[derive(Default)]
pub struct RouteEventBus {
    inner: Mutex<BusInner>,
}

impl Default for BusInner {
    fn default() -> Self {
        BusInner {
            subscribers: Vec::new(),
            next_id: 1,
        }
    }
}

impl RouteEventBus {
    pub fn new() -> Self {
        RouteEventBus::default()
    }

    /// Register a receiver; the bus keeps only a weak reference. Returns
    /// the id to pass as `sender` when publishing.
    pub fn subscribe<R: RouteEventReceiver + 'static>(
        &self,
        receiver: &Arc<Mutex<R>>,
    ) -> SubscriberId {
        let receiver: Arc<Mutex<dyn RouteEventReceiver>> = receiver.clone();
        let weak: SharedReceiver = Arc::downgrade(&receiver);
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push((id, weak));
        id
    }

    /// Remove a subscription. Returns false if the id is unknown.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|(sub_id, _)| *sub_id != id);
        inner.subscribers.len() != before
    }

    /// Deliver `event` to every live subscriber except `sender`. Returns
    /// the number of receivers whose handler reported that it acted.
    ///
    /// Delivery is synchronous; the subscriber list is snapshotted first so
    /// handlers may subscribe or publish without deadlocking the bus.
    pub fn publish(&self, sender: Option<SubscriberId>, event: &RouteEvent) -> usize {
        let snapshot: Vec<(SubscriberId, SharedReceiver)> = {
            let inner = self.inner.lock().unwrap();
            inner
                .subscribers
                .iter()
                .map(|(id, weak)| (*id, Weak::clone(weak)))
                .collect()
        };

        let mut accepted = 0;
        let mut dead: Vec<SubscriberId> = Vec::new();

        for (id, weak) in snapshot {
            if Some(id) == sender {
                continue;
            }
            match weak.upgrade() {
                Some(receiver) => {
                    if receiver.lock().unwrap().handle_route_event(event) {
                        accepted += 1;
                    }
                }
                None => dead.push(id),
            }
        }

        if !dead.is_empty() {
            let mut inner = self.inner.lock().unwrap();
            inner.subscribers.retain(|(id, _)| !dead.contains(id));
        }

        accepted
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }
}
