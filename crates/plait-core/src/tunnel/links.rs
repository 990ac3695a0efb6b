//! The link set of a tunnel and the shared packet endpoint.
//!
//! At most one link exists per next-hop address. Links that expire or are
//! dropped leave their route behind as a backup, so a tunnel with no links
//! left can retry them later.

use crate::codec::PacketCodec;
use crate::config::TunnelConfig;
use crate::ids::{LinkId, Route, SessionId};
use crate::link::{Link, LinkWire};
use crate::substrate::Substrate;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

/// Tunnel-wide state every outgoing packet needs
pub(crate) struct Endpoint {
    pub codec: PacketCodec,
    pub substrate: Arc<dyn Substrate>,
    pub app_id: u32,
    pub bootstrap: Vec<u8>,
    pub local_session: SessionId,
    pub remote_session: SessionId,
    pub local_tunnel: u32,
    pub remote_tunnel: u32,
}

impl Endpoint {
    /// Borrow the endpoint as a link wire.
    ///
    /// The bootstrap rides along until the peer's tunnel id is known and the
    /// tunnel is connected.
    pub fn wire(&mut self, now_ms: u64, connected: bool) -> LinkWire<'_> {
        let bootstrap = (self.remote_tunnel == 0 || !connected)
            .then_some((self.app_id, self.bootstrap.as_slice()));
        LinkWire {
            codec: &mut self.codec,
            substrate: &*self.substrate,
            local_session: self.local_session,
            remote_session: self.remote_session,
            local_tunnel: self.local_tunnel,
            remote_tunnel: self.remote_tunnel,
            bootstrap,
            now_ms,
        }
    }
}

/// Links of one tunnel plus remembered backup routes
#[derive(Debug)]
pub(crate) struct LinkSet {
    links: Vec<Link>,
    next_id: u32,
    cursor: usize,
    direct_backups: VecDeque<Route>,
    bounced_backups: VecDeque<Route>,
    backup_cursor: usize,
    max_backups: usize,
}

impl LinkSet {
    pub fn new(max_backups: usize) -> Self {
        Self {
            links: Vec::new(),
            next_id: 1,
            cursor: 0,
            direct_backups: VecDeque::new(),
            bounced_backups: VecDeque::new(),
            backup_cursor: 0,
            max_backups: max_backups.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Link> {
        self.links.iter()
    }

    pub fn get(&self, idx: usize) -> &Link {
        &self.links[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Link {
        &mut self.links[idx]
    }

    pub fn connected_count(&self) -> usize {
        self.links.iter().filter(|l| l.is_connected()).count()
    }

    pub fn find_by_hop(&self, hop: SocketAddr) -> Option<usize> {
        self.links.iter().position(|l| l.route().next_hop() == hop)
    }

    /// Link for `route`, creating it unless one already uses the same next hop
    pub fn insert(&mut self, route: Route, config: &TunnelConfig, now_ms: u64) -> (usize, bool) {
        if let Some(idx) = self.find_by_hop(route.next_hop()) {
            return (idx, false);
        }
        let id = LinkId::from_u32(self.next_id);
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.links.push(Link::new(id, route, config, now_ms));
        self.forget_backup(&route);
        (self.links.len() - 1, true)
    }

    /// Remove a link, keeping its route as a backup
    pub fn remove(&mut self, idx: usize) -> Link {
        let link = self.links.swap_remove(idx);
        self.remember(link.route());
        if self.cursor >= self.links.len() {
            self.cursor = 0;
        }
        link
    }

    /// Remove every link, keeping their routes as backups
    pub fn clear(&mut self) -> Vec<Link> {
        let links: Vec<_> = self.links.drain(..).collect();
        for link in &links {
            self.remember(link.route());
        }
        self.cursor = 0;
        links
    }

    /// Next connected link in round-robin order
    pub fn next_connected(&mut self) -> Option<usize> {
        let n = self.links.len();
        for step in 0..n {
            let idx = (self.cursor + step) % n;
            if self.links[idx].is_connected() {
                self.cursor = (idx + 1) % n;
                return Some(idx);
            }
        }
        None
    }

    /// Connected link with the highest latency
    pub fn worst_connected(&self) -> Option<usize> {
        self.links
            .iter()
            .enumerate()
            .filter(|(_, l)| l.is_connected())
            .max_by_key(|(_, l)| l.latency_ms().unwrap_or(u32::MAX))
            .map(|(i, _)| i)
    }

    /// Lowest latency over connected links
    pub fn best_latency(&self) -> Option<u32> {
        self.links
            .iter()
            .filter(|l| l.is_connected())
            .filter_map(Link::latency_ms)
            .min()
    }

    /// Remember a route for later retries; the most recent ones are kept
    pub fn remember(&mut self, route: Route) {
        let max = self.max_backups;
        let list = if route.is_bounced() {
            &mut self.bounced_backups
        } else {
            &mut self.direct_backups
        };
        list.retain(|r| *r != route);
        if list.len() == max {
            list.pop_front();
        }
        list.push_back(route);
    }

    fn forget_backup(&mut self, route: &Route) {
        self.direct_backups.retain(|r| r != route);
        self.bounced_backups.retain(|r| r != route);
    }

    /// Next backup route in rotation
    pub fn next_backup(&mut self) -> Option<Route> {
        let total = self.direct_backups.len() + self.bounced_backups.len();
        if total == 0 {
            return None;
        }
        let i = self.backup_cursor % total;
        self.backup_cursor = self.backup_cursor.wrapping_add(1);
        self.direct_backups
            .iter()
            .chain(self.bounced_backups.iter())
            .nth(i)
            .copied()
    }

    /// All remembered backup routes
    pub fn backups(&self) -> Vec<Route> {
        self.direct_backups
            .iter()
            .chain(self.bounced_backups.iter())
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[test]
    fn test_one_link_per_next_hop() {
        let config = TunnelConfig::default();
        let mut set = LinkSet::new(4);
        let (a, created) = set.insert(Route::direct(addr(1)), &config, 0);
        assert!(created);
        let (b, created) = set.insert(Route::direct(addr(1)), &config, 0);
        assert!(!created);
        assert_eq!(a, b);
        let (_, created) = set.insert(Route::bounced(addr(2), addr(1)), &config, 0);
        assert!(!created);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_removed_routes_become_backups() {
        let config = TunnelConfig::default();
        let mut set = LinkSet::new(2);
        for port in 1..=3 {
            set.insert(Route::direct(addr(port)), &config, 0);
        }
        set.insert(Route::bounced(addr(9), addr(4)), &config, 0);
        set.clear();
        assert!(set.is_empty());
        let backups = set.backups();
        assert_eq!(
            backups,
            vec![
                Route::direct(addr(2)),
                Route::direct(addr(3)),
                Route::bounced(addr(9), addr(4)),
            ]
        );
        let rotation: Vec<_> = (0..4).filter_map(|_| set.next_backup()).collect();
        assert_eq!(rotation[0], backups[0]);
        assert_eq!(rotation[3], backups[0]);
    }

    #[test]
    fn test_reinserted_route_leaves_backups() {
        let config = TunnelConfig::default();
        let mut set = LinkSet::new(4);
        set.insert(Route::direct(addr(1)), &config, 0);
        set.remove(0);
        assert_eq!(set.backups().len(), 1);
        set.insert(Route::direct(addr(1)), &config, 10);
        assert!(set.backups().is_empty());
    }

    #[test]
    fn test_link_ids_are_not_reused() {
        let config = TunnelConfig::default();
        let mut set = LinkSet::new(4);
        let (i, _) = set.insert(Route::direct(addr(1)), &config, 0);
        let first = set.get(i).id();
        set.clear();
        let (i, _) = set.insert(Route::direct(addr(1)), &config, 0);
        assert_ne!(set.get(i).id(), first);
        assert_eq!(set.next_connected(), None);
    }
}
