//! Tunnel registry: the application-facing entry point of the engine.
//!
//! The registry owns every tunnel, routes inbound packets to them and fans
//! the periodic tick out.
//!
//! ```text
//! Inbound datagram
//!        │
//!        ▼
//! ┌──────────────────────┐   dest tunnel != 0   ┌───────────────────────┐
//! │ PacketHeader::parse  │─────────────────────▶│ arena slot by handle  │
//! └──────────┬───────────┘                      │ + CRC over unique id  │
//!            │ dest tunnel == 0 / stale         └───────────┬───────────┘
//!            ▼                                              │
//! ┌──────────────────────┐                                  │
//! │ (unique id, address) │  known pair ─────────────────────┤
//! │ index, then Acceptor │  new peer: create + Attached     │
//! └──────────────────────┘                                  ▼
//!                                               ┌───────────────────────┐
//!                                               │ Tunnel::on_packet     │
//!                                               └───────────────────────┘
//! ```
//!
//! # Locking
//!
//! The arena sits behind a `RwLock`: lookups take the read side, open and
//! close take the write side. Each tunnel has its own `Mutex`. The arena lock
//! is always released before a tunnel lock is taken, and events are delivered
//! through a channel, so an event consumer may call back into the registry
//! from any thread.

use crate::codec::PacketHeader;
use crate::config::RegistryConfig;
use crate::congestion::LinkQuality;
use crate::event::{Event, EventSink};
use crate::ids::{FileHash, PeerIdentity, PeerUniqueId, Route, TaskId, TunnelHandle};
use crate::substrate::{Acceptor, Substrate, Tick};
use crate::transfer::{FileCatalog, FileReader, FileWriter};
use crate::tunnel::{Tunnel, TunnelParams, TunnelStatus};
use crossbeam_channel::Receiver;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, trace};

type SharedTunnel = Arc<Mutex<Tunnel>>;
type IndexKey = (PeerUniqueId, SocketAddr);

struct Slot {
    generation: u16,
    entry: Option<SlotEntry>,
}

struct SlotEntry {
    unique_id: PeerUniqueId,
    key: IndexKey,
    tunnel: SharedTunnel,
}

/// Generation arena of tunnels plus the `(unique id, address)` index
#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<u16>,
    index: HashMap<IndexKey, TunnelHandle>,
}

impl Arena {
    fn get(&self, handle: TunnelHandle) -> Option<&SlotEntry> {
        let slot = self.slots.get(usize::from(handle.index()))?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.entry.as_ref()
    }

    /// Reserve a slot; `None` once every index is live
    fn reserve(&mut self) -> Option<TunnelHandle> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[usize::from(index)];
            return Some(TunnelHandle::new(index, slot.generation));
        }
        let index = u16::try_from(self.slots.len()).ok()?;
        self.slots.push(Slot {
            generation: 1,
            entry: None,
        });
        Some(TunnelHandle::new(index, 1))
    }

    fn fill(&mut self, handle: TunnelHandle, entry: SlotEntry) {
        self.index.insert(entry.key, handle);
        self.slots[usize::from(handle.index())].entry = Some(entry);
    }

    fn remove(&mut self, handle: TunnelHandle) -> Option<SlotEntry> {
        let slot = self.slots.get_mut(usize::from(handle.index()))?;
        if slot.generation != handle.generation() {
            return None;
        }
        let entry = slot.entry.take()?;
        // generation 0 is reserved for the invalid handle
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free.push(handle.index());
        if self.index.get(&entry.key) == Some(&handle) {
            self.index.remove(&entry.key);
        }
        Some(entry)
    }

    fn live(&self) -> Vec<SharedTunnel> {
        self.slots
            .iter()
            .filter_map(|s| s.entry.as_ref().map(|e| e.tunnel.clone()))
            .collect()
    }
}

/// Packet routing counters
#[derive(Debug, Default)]
pub struct RegistryStats {
    routed: AtomicU64,
    dropped: AtomicU64,
    accepted: AtomicU64,
}

impl RegistryStats {
    /// Packets handed to a tunnel
    #[must_use]
    pub fn routed(&self) -> u64 {
        self.routed.load(Ordering::Relaxed)
    }

    /// Packets that matched no tunnel or failed the header checks
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Tunnels created for inbound peers
    #[must_use]
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }
}

/// Owner of every tunnel in the process.
///
/// All methods take `&self`; the registry is meant to be shared behind an
/// `Arc` between the receive loop, the tick loop and the application.
pub struct Registry {
    config: RegistryConfig,
    substrate: Arc<dyn Substrate>,
    events: EventSink,
    catalog: Arc<FileCatalog>,
    acceptor: RwLock<Option<Arc<dyn Acceptor>>>,
    arena: RwLock<Arena>,
    now_ms: AtomicU64,
    stats: RegistryStats,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("app_id", &self.config.app_id)
            .field("tunnels", &self.tunnel_count())
            .field("shared_files", &self.catalog.len())
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Create a registry sending through `substrate`.
    ///
    /// Returns the receiving end of the event channel.
    pub fn new(config: RegistryConfig, substrate: Arc<dyn Substrate>) -> (Self, Receiver<Event>) {
        let (events, rx) = EventSink::channel();
        let registry = Self {
            config,
            substrate,
            events,
            catalog: Arc::new(FileCatalog::new()),
            acceptor: RwLock::new(None),
            arena: RwLock::new(Arena::default()),
            now_ms: AtomicU64::new(0),
            stats: RegistryStats::default(),
        };
        (registry, rx)
    }

    /// Install the acceptor consulted for packets from unknown peers
    pub fn set_acceptor(&self, acceptor: Arc<dyn Acceptor>) {
        *self.acceptor.write() = Some(acceptor);
    }

    /// Routing counters
    #[must_use]
    pub fn stats(&self) -> &RegistryStats {
        &self.stats
    }

    /// Timestamp of the latest tick
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::Acquire)
    }

    /// Number of live tunnels
    #[must_use]
    pub fn tunnel_count(&self) -> usize {
        self.arena
            .read()
            .slots
            .iter()
            .filter(|s| s.entry.is_some())
            .count()
    }

    /// Handles of every live tunnel
    #[must_use]
    pub fn handles(&self) -> Vec<TunnelHandle> {
        let arena = self.arena.read();
        arena
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.entry.is_some())
            .filter_map(|(i, s)| u16::try_from(i).ok().map(|i| TunnelHandle::new(i, s.generation)))
            .collect()
    }

    fn lookup(&self, handle: TunnelHandle) -> Option<SharedTunnel> {
        self.arena.read().get(handle).map(|e| e.tunnel.clone())
    }

    /// Run `f` on a live tunnel; the arena lock is released first
    fn with_tunnel<R>(&self, handle: TunnelHandle, f: impl FnOnce(&mut Tunnel, u64) -> R) -> Option<R> {
        let tunnel = self.lookup(handle)?;
        let now = self.now_ms();
        let mut guard = tunnel.lock();
        Some(f(&mut guard, now))
    }

    fn create(
        &self,
        identity: PeerIdentity,
        routes: Vec<Route>,
        bootstrap: Vec<u8>,
        key: IndexKey,
    ) -> Option<(TunnelHandle, SharedTunnel)> {
        let mut arena = self.arena.write();
        if let Some(&existing) = arena.index.get(&key) {
            let tunnel = arena.get(existing)?.tunnel.clone();
            return Some((existing, tunnel));
        }
        let handle = arena.reserve()?;
        let unique_id = identity.unique_id;
        let tunnel = Arc::new(Mutex::new(Tunnel::new(TunnelParams {
            handle,
            identity,
            routes,
            app_id: self.config.app_id,
            bootstrap,
            config: self.config.tunnel.clone(),
            substrate: self.substrate.clone(),
            catalog: self.catalog.clone(),
            events: self.events.clone(),
            advertised: self.config.advertised_routes.clone(),
            now_ms: self.now_ms(),
        })));
        arena.fill(
            handle,
            SlotEntry {
                unique_id,
                key,
                tunnel: tunnel.clone(),
            },
        );
        drop(arena);
        self.events.emit(Event::Attached { tunnel: handle });
        Some((handle, tunnel))
    }

    // ------------------------------------------------------------------
    // Application API
    // ------------------------------------------------------------------

    /// Open (or reuse) a tunnel to a peer reachable on `routes`.
    ///
    /// A tunnel already open for the same unique id and first address is
    /// returned with `routes` added to it. Returns
    /// [`TunnelHandle::INVALID`] when `routes` is empty or the arena is full.
    pub fn open_tunnel(&self, identity: PeerIdentity, routes: &[Route], bootstrap: &[u8]) -> TunnelHandle {
        let Some(first) = routes.first() else {
            return TunnelHandle::INVALID;
        };
        let key = (identity.unique_id, first.destination);
        let max_links = self.config.tunnel.max_links;
        let Some((handle, tunnel)) = self.create(
            identity,
            routes.iter().take(max_links).copied().collect(),
            bootstrap.to_vec(),
            key,
        ) else {
            return TunnelHandle::INVALID;
        };
        let now = self.now_ms();
        let mut tunnel = tunnel.lock();
        tunnel.add_routes(routes, now);
        tunnel.on_tick(now);
        info!(tunnel = %handle, routes = routes.len(), "tunnel opened");
        handle
    }

    /// Close a tunnel and remove it; `Detached` follows its teardown events
    pub fn close_tunnel(&self, handle: TunnelHandle) -> bool {
        let Some(entry) = self.arena.write().remove(handle) else {
            return false;
        };
        entry.tunnel.lock().close();
        self.events.emit(Event::Detached { tunnel: handle });
        true
    }

    /// Add routes to an open tunnel
    pub fn add_access_points(&self, handle: TunnelHandle, routes: &[Route]) -> bool {
        self.with_tunnel(handle, |t, now| t.add_routes(routes, now)).is_some()
    }

    /// Queue a message; the outcome arrives as `MessageSent { cookie, .. }`
    pub fn send_message(&self, handle: TunnelHandle, data: Vec<u8>, cookie: u64) -> bool {
        self.with_tunnel(handle, |t, now| {
            t.send_message(data, cookie, now);
        })
        .is_some()
    }

    /// Cancel a queued message by cookie
    pub fn cancel_message(&self, handle: TunnelHandle, cookie: u64) -> bool {
        self.with_tunnel(handle, |t, now| t.cancel_message(cookie, now))
            .unwrap_or(false)
    }

    /// Start (or resume) downloading `hash` into `writer`
    pub fn start_download(
        &self,
        handle: TunnelHandle,
        hash: FileHash,
        size: u64,
        writer: Box<dyn FileWriter>,
    ) -> Option<TaskId> {
        self.with_tunnel(handle, |t, now| t.start_download(hash, size, writer, now))
            .flatten()
    }

    /// Stop a download; the writer keeps its resume state
    pub fn stop_download(&self, handle: TunnelHandle, download: TaskId) -> bool {
        self.with_tunnel(handle, |t, now| t.stop_download(download, now))
            .unwrap_or(false)
    }

    /// `(downloaded, size)` of a download
    #[must_use]
    pub fn download_progress(&self, handle: TunnelHandle, download: TaskId) -> Option<(u64, u64)> {
        self.with_tunnel(handle, |t, _| t.download_progress(download))
            .flatten()
    }

    /// Offer a file to every peer
    pub fn share_file(&self, hash: FileHash, size: u64, reader: Arc<dyn FileReader>) {
        debug!(hash = %hex::encode(&hash[..8]), size, "file shared");
        self.catalog.share(hash, size, reader);
    }

    /// Withdraw a shared file; running uploads finish their current block
    pub fn unshare_file(&self, hash: &FileHash) -> bool {
        self.catalog.unshare(hash)
    }

    /// Status of a tunnel
    #[must_use]
    pub fn status(&self, handle: TunnelHandle) -> Option<TunnelStatus> {
        self.with_tunnel(handle, |t, _| t.status())
    }

    /// Milliseconds since the tunnel last heard from its peer
    #[must_use]
    pub fn idle_time(&self, handle: TunnelHandle) -> Option<u64> {
        self.with_tunnel(handle, |t, now| t.idle_time(now))
    }

    /// Latency and loss over the trailing `window_ms`
    #[must_use]
    pub fn link_quality(&self, handle: TunnelHandle, window_ms: u64) -> Option<LinkQuality> {
        self.with_tunnel(handle, |t, now| t.link_quality(now, window_ms))
    }

    /// Number of connected links of a tunnel
    #[must_use]
    pub fn connected_links(&self, handle: TunnelHandle) -> Option<usize> {
        self.with_tunnel(handle, |t, _| t.connected_links())
    }

    // ------------------------------------------------------------------
    // Substrate entry points
    // ------------------------------------------------------------------

    /// Route one inbound datagram
    pub fn on_packet(&self, data: &[u8], from: SocketAddr, bouncer: Option<SocketAddr>) {
        let header = match PacketHeader::parse(data) {
            Ok(h) => h,
            Err(e) => {
                trace!(%from, error = %e, "dropping malformed packet");
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let target = self
            .route_by_handle(&header)
            .or_else(|| self.route_by_bootstrap(&header, from));
        let Some(tunnel) = target else {
            trace!(%from, dest = header.dest_tunnel, "no tunnel for packet");
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        self.stats.routed.fetch_add(1, Ordering::Relaxed);
        let now = self.now_ms();
        tunnel.lock().on_packet(&header, from, bouncer, now);
    }

    fn route_by_handle(&self, header: &PacketHeader<'_>) -> Option<SharedTunnel> {
        if header.dest_tunnel == 0 {
            return None;
        }
        let arena = self.arena.read();
        let entry = arena.get(TunnelHandle::from_u32(header.dest_tunnel))?;
        header
            .verify_crc(&entry.unique_id)
            .then(|| entry.tunnel.clone())
    }

    fn route_by_bootstrap(&self, header: &PacketHeader<'_>, from: SocketAddr) -> Option<SharedTunnel> {
        let (app_id, bootstrap) = header.bootstrap?;

        let known = {
            let arena = self.arena.read();
            arena
                .index
                .iter()
                .filter(|((_, addr), _)| *addr == from)
                .find(|((uid, _), _)| header.verify_crc(uid))
                .and_then(|(_, handle)| arena.get(*handle))
                .map(|e| e.tunnel.clone())
        };
        if known.is_some() {
            return known;
        }

        let acceptor = self.acceptor.read().clone()?;
        let peer = acceptor.resolve(app_id, bootstrap, from)?;
        if !header.verify_crc(&peer.identity.unique_id) {
            trace!(%from, "bootstrap accepted but packet not bound to its identity");
            return None;
        }

        let same_peer = {
            let arena = self.arena.read();
            arena
                .slots
                .iter()
                .filter_map(|s| s.entry.as_ref())
                .find(|e| e.unique_id == peer.identity.unique_id)
                .map(|e| e.tunnel.clone())
        };
        if same_peer.is_some() {
            return same_peer;
        }

        let key = (peer.identity.unique_id, from);
        let (handle, tunnel) = self.create(peer.identity, Vec::new(), peer.bootstrap, key)?;
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        info!(tunnel = %handle, %from, app_id, "tunnel accepted");
        Some(tunnel)
    }

    /// Drive every tunnel's timers
    pub fn on_tick(&self, tick: Tick) {
        self.now_ms.fetch_max(tick.now_ms, Ordering::AcqRel);
        let now = self.now_ms();
        let tunnels = self.arena.read().live();
        for tunnel in tunnels {
            tunnel.lock().on_tick(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::StaticAcceptor;

    #[derive(Default)]
    struct Outbox(Mutex<Vec<(Vec<u8>, SocketAddr)>>);

    impl Substrate for Outbox {
        fn send(&self, packet: &[u8], destination: SocketAddr, _: Option<SocketAddr>) -> bool {
            self.0.lock().push((packet.to_vec(), destination));
            true
        }
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn registry() -> (Registry, Receiver<Event>, Arc<Outbox>) {
        let out = Arc::new(Outbox::default());
        let config = RegistryConfig {
            app_id: 7,
            ..RegistryConfig::default()
        };
        let (registry, rx) = Registry::new(config, out.clone());
        (registry, rx, out)
    }

    #[test]
    fn test_open_tunnel_attaches() {
        let (reg, rx, out) = registry();
        let id = PeerIdentity::from_passphrase("open");
        let handle = reg.open_tunnel(id.clone(), &[Route::direct(addr("10.0.0.2:1"))], b"hi");
        assert!(handle.is_valid());
        assert_eq!(rx.try_recv().unwrap(), Event::Attached { tunnel: handle });
        assert_eq!(reg.status(handle), Some(TunnelStatus::Disconnected));
        assert!(!out.0.lock().is_empty());

        let again = reg.open_tunnel(id, &[Route::direct(addr("10.0.0.2:1"))], b"hi");
        assert_eq!(again, handle);
        assert_eq!(reg.tunnel_count(), 1);
    }

    #[test]
    fn test_open_without_routes_is_invalid() {
        let (reg, _rx, _) = registry();
        let handle = reg.open_tunnel(PeerIdentity::from_passphrase("x"), &[], b"");
        assert_eq!(handle, TunnelHandle::INVALID);
    }

    #[test]
    fn test_closed_handle_is_stale() {
        let (reg, rx, _) = registry();
        let handle = reg.open_tunnel(
            PeerIdentity::from_passphrase("close"),
            &[Route::direct(addr("10.0.0.2:1"))],
            b"",
        );
        assert!(reg.close_tunnel(handle));
        assert!(!reg.close_tunnel(handle));
        assert!(!reg.send_message(handle, vec![1], 1));
        assert_eq!(reg.status(handle), None);
        assert!(rx.try_iter().any(|e| e == Event::Detached { tunnel: handle }));

        let reused = reg.open_tunnel(
            PeerIdentity::from_passphrase("other"),
            &[Route::direct(addr("10.0.0.3:1"))],
            b"",
        );
        assert_eq!(reused.index(), handle.index());
        assert_ne!(reused, handle);
    }

    #[test]
    fn test_bootstrap_creates_tunnel_via_acceptor() {
        let id = PeerIdentity::from_passphrase("accept");
        let (client, _crx, client_out) = registry();
        client.open_tunnel(id.clone(), &[Route::direct(addr("10.0.0.9:9"))], b"token");
        let (packet, _) = client_out.0.lock()[0].clone();

        let (server, srx, _) = registry();
        server.on_packet(&packet, addr("10.0.0.1:1"), None);
        assert_eq!(server.tunnel_count(), 0);
        assert_eq!(server.stats().dropped(), 1);

        server.set_acceptor(Arc::new(StaticAcceptor::new(7).with_peer(b"token".to_vec(), id)));
        server.on_packet(&packet, addr("10.0.0.1:1"), None);
        server.on_packet(&packet, addr("10.0.0.1:1"), None);
        assert_eq!(server.tunnel_count(), 1);
        assert_eq!(server.stats().accepted(), 1);
        assert!(matches!(srx.try_recv(), Ok(Event::Attached { .. })));
    }

    #[test]
    fn test_acceptor_identity_must_match_crc() {
        let (client, _crx, client_out) = registry();
        client.open_tunnel(
            PeerIdentity::from_passphrase("real"),
            &[Route::direct(addr("10.0.0.9:9"))],
            b"token",
        );
        let (packet, _) = client_out.0.lock()[0].clone();

        let (server, _srx, _) = registry();
        let wrong = PeerIdentity::from_passphrase("wrong");
        server.set_acceptor(Arc::new(StaticAcceptor::new(7).with_peer(b"token".to_vec(), wrong)));
        server.on_packet(&packet, addr("10.0.0.1:1"), None);
        assert_eq!(server.tunnel_count(), 0);
    }

    #[test]
    fn test_garbage_is_counted_and_dropped() {
        let (reg, _rx, _) = registry();
        reg.on_packet(&[0u8; 40], addr("10.0.0.1:1"), None);
        reg.on_packet(&[], addr("10.0.0.1:1"), None);
        assert_eq!(reg.stats().dropped(), 2);
        assert_eq!(reg.stats().routed(), 0);
    }

    #[test]
    fn test_tick_time_is_monotonic() {
        let (reg, _rx, _) = registry();
        reg.on_tick(Tick::new(1, 500));
        reg.on_tick(Tick::new(2, 400));
        assert_eq!(reg.now_ms(), 500);
    }
}
