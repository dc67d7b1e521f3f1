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

//! The IPv4 Routing Information Base: one entry per (prefix, source
//! speaker), exactly one best entry per prefix at all times.

use crate::bgp::msg_update::PathAttribute;
use crate::bgp::utils::Ipv4Net;
use crate::log::Logger;
use crate::rib::entry::Rib4Entry;
use crate::rib::types::{RouteSource, WithdrawOutcome};
use crate::{info, warn};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

pub struct BgpRib4 {
    // Per prefix, entries sorted best-first; the head is the designated best
    routes: HashMap<Ipv4Net, Vec<Rib4Entry>>,
    update_id: u64,
    logger: Logger,
}

impl Default for BgpRib4 {
    fn default() -> Self {
        Self::new()
    }
}

impl BgpRib4 {
    pub fn new() -> Self {
        Self::with_logger(Logger::default())
    }

    pub fn with_logger(logger: Logger) -> Self {
        BgpRib4 {
            routes: HashMap::new(),
            update_id: 0,
            logger,
        }
    }

    fn next_update_id(&mut self) -> u64 {
        let id = self.update_id;
        self.update_id += 1;
        id
    }

    /// Insert one learned route. Any previous entry with the same
    /// (prefix, scope) is replaced. Returns the prefix's best entry when it
    /// changed (by arrival cohort), None when the announcement does not
    /// affect what peers should see.
    pub fn insert(
        &mut self,
        src_router_id: u32,
        route: Ipv4Net,
        attribs: Arc<Vec<PathAttribute>>,
        weight: i32,
        source: RouteSource,
    ) -> Option<Rib4Entry> {
        let update_id = self.next_update_id();
        self.insert_with_id(update_id, src_router_id, route, attribs, weight, source)
    }

    /// Insert the routes of one UPDATE. All entries share one update id so
    /// outbound advertisement can coalesce them again. Returns the new best
    /// entry of every prefix whose best changed.
    pub fn insert_many(
        &mut self,
        src_router_id: u32,
        routes: &[Ipv4Net],
        attribs: Arc<Vec<PathAttribute>>,
        weight: i32,
        source: RouteSource,
    ) -> Vec<Rib4Entry> {
        let update_id = self.next_update_id();
        routes
            .iter()
            .filter_map(|route| {
                self.insert_with_id(
                    update_id,
                    src_router_id,
                    *route,
                    Arc::clone(&attribs),
                    weight,
                    source,
                )
            })
            .collect()
    }

    fn insert_with_id(
        &mut self,
        update_id: u64,
        src_router_id: u32,
        route: Ipv4Net,
        attribs: Arc<Vec<PathAttribute>>,
        weight: i32,
        source: RouteSource,
    ) -> Option<Rib4Entry> {
        let entry = Rib4Entry {
            route,
            src_router_id,
            update_id,
            weight,
            source,
            attribs,
        };

        let previous_best_id = self
            .routes
            .get(&route)
            .and_then(|entries| entries.first())
            .map(|best| best.update_id);

        let entries = self.routes.entry(route).or_default();
        entries.retain(|e| e.src_router_id != src_router_id);
        entries.push(entry);
        entries.sort_by(|a, b| b.cmp(a));

        info!(self.logger, "inserted route",
            "group" => update_id,
            "scope" => Ipv4Addr::from(src_router_id).to_string(),
            "route" => route.to_string());

        let best = &entries[0];
        match previous_best_id {
            Some(id) if id == best.update_id => None,
            _ => Some(best.clone()),
        }
    }

    /// Insert a locally-originated route (scope 0) with synthesized
    /// attributes. Local routes announced with the same nexthop share an
    /// update id so they travel in one UPDATE. Refuses duplicates.
    pub fn insert_local(
        &mut self,
        route: Ipv4Net,
        nexthop: Ipv4Addr,
        weight: i32,
    ) -> Option<Rib4Entry> {
        if self
            .routes
            .get(&route)
            .map(|entries| entries.iter().any(|e| e.is_local()))
            .unwrap_or(false)
        {
            warn!(self.logger, "local route exists", "route" => route.to_string());
            return None;
        }

        let reuse_id = self
            .routes
            .values()
            .flatten()
            .find(|e| e.is_local() && e.next_hop() == Some(nexthop))
            .map(|e| e.update_id);
        let update_id = match reuse_id {
            Some(id) => id,
            None => self.next_update_id(),
        };

        let attribs = Arc::new(vec![
            PathAttribute::origin(crate::bgp::msg_update::Origin::IGP),
            PathAttribute::as_path(vec![]),
            PathAttribute::next_hop(nexthop),
        ]);

        // A local entry that does not become best (an entry with higher
        // weight exists) still lands in the table; return it either way.
        match self.insert_with_id(update_id, 0, route, attribs, weight, RouteSource::Local) {
            Some(best) => Some(best),
            None => self
                .routes
                .get(&route)
                .and_then(|entries| entries.iter().find(|e| e.is_local()))
                .cloned(),
        }
    }

    /// Remove the entry with the given (prefix, scope).
    pub fn withdraw(&mut self, src_router_id: u32, route: Ipv4Net) -> WithdrawOutcome {
        let entries = match self.routes.get_mut(&route) {
            Some(entries) => entries,
            None => return WithdrawOutcome::NotPresent,
        };
        let position = match entries
            .iter()
            .position(|e| e.src_router_id == src_router_id)
        {
            Some(position) => position,
            None => return WithdrawOutcome::NotPresent,
        };

        let was_best = position == 0;
        entries.remove(position);

        info!(self.logger, "withdrawn route",
            "scope" => Ipv4Addr::from(src_router_id).to_string(),
            "route" => route.to_string());

        if entries.is_empty() {
            self.routes.remove(&route);
            return WithdrawOutcome::Unreachable;
        }
        if !was_best {
            return WithdrawOutcome::BestUnchanged;
        }
        WithdrawOutcome::NewBest(entries[0].clone())
    }

    /// Remove every entry announced by a speaker. Returns the prefixes
    /// whose best entry changed (including ones that became unreachable),
    /// for propagation to other peers.
    pub fn discard(&mut self, src_router_id: u32) -> Vec<Ipv4Net> {
        let mut changed = Vec::new();
        let logger = self.logger.clone();

        self.routes.retain(|route, entries| {
            if let Some(position) = entries
                .iter()
                .position(|e| e.src_router_id == src_router_id)
            {
                entries.remove(position);
                info!(logger, "discarded route",
                    "scope" => Ipv4Addr::from(src_router_id).to_string(),
                    "route" => route.to_string());
                if position == 0 {
                    changed.push(*route);
                }
            }
            !entries.is_empty()
        });

        changed.sort();
        changed
    }

    /// Longest-prefix match across best entries.
    pub fn lookup(&self, dest: Ipv4Addr) -> Option<&Rib4Entry> {
        self.routes
            .iter()
            .filter(|(prefix, _)| prefix.includes(dest))
            .max_by_key(|(prefix, _)| prefix.prefix_length())
            .and_then(|(_, entries)| entries.first())
    }

    /// Longest-prefix match restricted to one speaker's routes.
    pub fn lookup_from(&self, src_router_id: u32, dest: Ipv4Addr) -> Option<&Rib4Entry> {
        self.routes
            .iter()
            .filter(|(prefix, _)| prefix.includes(dest))
            .filter_map(|(_, entries)| {
                entries.iter().find(|e| e.src_router_id == src_router_id)
            })
            .max_by_key(|entry| entry.route.prefix_length())
    }

    /// Every entry, all sources.
    pub fn get(&self) -> impl Iterator<Item = &Rib4Entry> {
        self.routes.values().flatten()
    }

    /// The designated best entry of each prefix.
    pub fn best_entries(&self) -> impl Iterator<Item = &Rib4Entry> {
        self.routes.values().filter_map(|entries| entries.first())
    }

    /// Number of prefixes present.
    pub fn routes_len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
