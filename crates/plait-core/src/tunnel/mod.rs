//! Tunnel: the session state machine of one peer relationship.
//!
//! A tunnel owns a set of [`Link`]s, the reliable send/receive windows, the
//! congestion state and the message/file task queues. It is driven from two
//! directions: inbound packets routed by the registry, and the periodic tick.
//!
//! ```text
//!              first link connects
//!   Disconnected ─────────────────────▶ Connected
//!        ▲  ◀───────────────────────────    │
//!        │      last link disconnects       │
//!        │ awaken                   close   │
//!        └──────────── Closed ◀─────────────┘
//! ```
//!
//! Reliable tunnel messages consume a TPSN and a send-window slot; the
//! receiver answers with batch acks. Sending stops while the congestion
//! window or the ring is full, and a substrate refusal counts the unit as
//! lost without touching the congestion estimate.

mod links;
pub mod message;
pub mod session;
mod tasks;

pub use message::{Reliable, TunnelMessage};
pub use session::{SessionAction, SessionVerdict, TunnelStatus, classify};

use crate::codec::{PacketCodec, PacketHeader};
use crate::config::{TunnelConfig, millis};
use crate::congestion::{CongestionWindow, LinkQuality, QualityHistory, RttEstimator};
use crate::error::TransferError;
use crate::event::{Event, EventSink, FileInterruptReason};
use crate::ids::{FileHash, PeerIdentity, PeerUniqueId, Route, SessionId, TaskId, TunnelHandle};
use crate::link::{Link, LinkTick, LinkTransition};
use crate::substrate::Substrate;
use crate::transfer::{
    FileCatalog, FileWriter, IncomingFile, IncomingMessage, OutgoingFile, OutgoingMessage,
    SliceOutcome,
};
use crate::window::{Accept, AckBatch, RecvWindow, SendSlot, SendWindow, seq_diff, seq_lt};
use links::{Endpoint, LinkSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tasks::{SentUnit, Tasks};
use tracing::{debug, info, trace, warn};

/// Largest message a peer may announce
pub const MAX_MESSAGE_LEN: u32 = 64 * 1024 * 1024;

/// A missing TPSN is declared lost once this many later TPSNs were acked
const REORDER_THRESHOLD: i32 = 3;

/// Everything needed to build a tunnel
pub(crate) struct TunnelParams {
    pub handle: TunnelHandle,
    pub identity: PeerIdentity,
    pub routes: Vec<Route>,
    pub app_id: u32,
    pub bootstrap: Vec<u8>,
    pub config: TunnelConfig,
    pub substrate: Arc<dyn Substrate>,
    pub catalog: Arc<FileCatalog>,
    pub events: EventSink,
    pub advertised: Vec<Route>,
    pub now_ms: u64,
}

/// Session state machine of one peer relationship
pub struct Tunnel {
    handle: TunnelHandle,
    config: TunnelConfig,
    status: TunnelStatus,
    endpoint: Endpoint,
    links: LinkSet,
    send_window: SendWindow<SentUnit>,
    recv_window: RecvWindow,
    rtt: RttEstimator,
    cwnd: CongestionWindow,
    history: QualityHistory,
    tasks: Tasks,
    catalog: Arc<FileCatalog>,
    events: EventSink,
    advertised: Vec<Route>,
    created_ms: u64,
    last_recv_ms: Option<u64>,
    last_access_request_ms: Option<u64>,
    last_backup_retry_ms: Option<u64>,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("handle", &self.handle)
            .field("status", &self.status)
            .field("links", &self.links.len())
            .field("in_flight", &self.send_window.in_flight())
            .field("cwnd", &self.cwnd.cwnd())
            .finish_non_exhaustive()
    }
}

impl Tunnel {
    pub(crate) fn new(params: TunnelParams) -> Self {
        let TunnelParams {
            handle,
            identity,
            routes,
            app_id,
            bootstrap,
            config,
            substrate,
            catalog,
            events,
            advertised,
            now_ms,
        } = params;

        let endpoint = Endpoint {
            codec: PacketCodec::new(identity.unique_id, &identity.secret),
            substrate,
            app_id,
            bootstrap,
            local_session: SessionId::generate(now_ms),
            remote_session: SessionId::UNKNOWN,
            local_tunnel: handle.as_u32(),
            remote_tunnel: 0,
        };
        let mut links = LinkSet::new(config.backup_routes);
        for route in routes.into_iter().take(config.max_links) {
            links.insert(route, &config, now_ms);
        }
        debug!(tunnel = %handle, session = %endpoint.local_session, links = links.len(), "tunnel created");

        Self {
            handle,
            status: TunnelStatus::Disconnected,
            endpoint,
            links,
            send_window: SendWindow::new(config.window_capacity),
            recv_window: RecvWindow::new(config.window_capacity),
            rtt: RttEstimator::new(&config),
            cwnd: CongestionWindow::new(&config),
            history: QualityHistory::new(config.history_size),
            tasks: Tasks::new(&config),
            catalog,
            events,
            advertised,
            created_ms: now_ms,
            last_recv_ms: None,
            last_access_request_ms: None,
            last_backup_retry_ms: None,
            config,
        }
    }

    /// Registry handle, also the local tunnel id on the wire
    #[must_use]
    pub fn handle(&self) -> TunnelHandle {
        self.handle
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> TunnelStatus {
        self.status
    }

    /// Unique id the tunnel's packets are bound to
    #[must_use]
    pub fn unique_id(&self) -> &PeerUniqueId {
        self.endpoint.codec.unique_id()
    }

    /// Our session id
    #[must_use]
    pub fn local_session(&self) -> SessionId {
        self.endpoint.local_session
    }

    /// Last session id the peer announced
    #[must_use]
    pub fn remote_session(&self) -> SessionId {
        self.endpoint.remote_session
    }

    /// Number of links, connected or not
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Number of connected links
    #[must_use]
    pub fn connected_links(&self) -> usize {
        self.links.connected_count()
    }

    /// Current congestion window in slots
    #[must_use]
    pub fn congestion_window(&self) -> usize {
        self.cwnd.cwnd()
    }

    /// Sequence number the next reliable send will carry
    #[must_use]
    pub fn next_tpsn(&self) -> u32 {
        self.send_window.next_tpsn()
    }

    /// Time since the last inbound packet (or since creation)
    #[must_use]
    pub fn idle_time(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_recv_ms.unwrap_or(self.created_ms))
    }

    /// Whether any transfer is queued, in flight or being received
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.tasks.is_busy()
    }

    /// Latency and loss over the trailing `window_ms`
    #[must_use]
    pub fn link_quality(&self, now_ms: u64, window_ms: u64) -> LinkQuality {
        let mut quality = self.history.quality(now_ms, window_ms);
        if quality.latency_ms.is_none() {
            quality.latency_ms = self.links.best_latency();
        }
        quality
    }

    /// `(downloaded, size)` of a download
    #[must_use]
    pub fn download_progress(&self, download: TaskId) -> Option<(u64, u64)> {
        self.tasks
            .downloads
            .get(&download)
            .map(|d| (d.downloaded_bytes(), d.size()))
    }

    fn emit(&self, event: Event) {
        self.events.emit(event);
    }

    fn set_status(&mut self, next: TunnelStatus) {
        debug_assert!(self.status.can_transition_to(next), "{} -> {next}", self.status);
        self.status = next;
    }

    // ------------------------------------------------------------------
    // Application operations
    // ------------------------------------------------------------------

    /// Add routes the peer can be reached on
    pub fn add_routes(&mut self, routes: &[Route], now_ms: u64) {
        self.awaken(now_ms);
        for route in routes {
            self.add_route(*route, now_ms);
        }
    }

    fn add_route(&mut self, route: Route, now_ms: u64) {
        if self.links.find_by_hop(route.next_hop()).is_some() {
            return;
        }
        if self.links.len() >= self.config.max_links {
            self.links.remember(route);
            return;
        }
        let (idx, _) = self.links.insert(route, &self.config, now_ms);
        trace!(tunnel = %self.handle, route = %route, "route added");
        self.tick_link(idx, now_ms);
    }

    /// Queue a message; `MessageSent` reports the outcome
    pub fn send_message(&mut self, data: Vec<u8>, cookie: u64, now_ms: u64) -> TaskId {
        self.awaken(now_ms);
        let id = self.tasks.allocate_id();
        if data.len() > MAX_MESSAGE_LEN as usize {
            warn!(tunnel = %self.handle, id, len = data.len(), "message too large to send");
            self.emit(Event::MessageSent {
                tunnel: self.handle,
                cookie,
                success: false,
            });
            return id;
        }
        let msg = OutgoingMessage::new(id, cookie, data, self.config.message_slice_size);
        trace!(tunnel = %self.handle, id, slices = msg.slice_count(), "message queued");
        self.tasks.outgoing.insert(id, msg);
        self.pump(now_ms);
        id
    }

    /// Drop a queued message and tell the peer
    pub fn cancel_message(&mut self, cookie: u64, now_ms: u64) -> bool {
        let Some(id) = self
            .tasks
            .outgoing
            .iter()
            .find(|(_, m)| m.cookie() == cookie)
            .map(|(id, _)| *id)
        else {
            return false;
        };
        self.tasks.outgoing.remove(&id);
        self.send_unreliable(&TunnelMessage::MessageCancel { message: id }, None, now_ms);
        self.emit(Event::MessageSent {
            tunnel: self.handle,
            cookie,
            success: false,
        });
        true
    }

    /// Start or resume a download
    pub fn start_download(
        &mut self,
        hash: FileHash,
        size: u64,
        writer: Box<dyn FileWriter>,
        now_ms: u64,
    ) -> Option<TaskId> {
        self.awaken(now_ms);
        let id = self.tasks.allocate_id();
        match IncomingFile::new(id, hash, size, writer, &self.config, now_ms) {
            Ok(file) => {
                debug!(
                    tunnel = %self.handle,
                    id,
                    hash = %hex::encode(&hash[..8]),
                    resume_at = file.downloaded_bytes(),
                    "download started"
                );
                self.tasks.downloads.insert(id, file);
                self.pump(now_ms);
                Some(id)
            }
            Err(e) => {
                warn!(tunnel = %self.handle, error = %e, "cannot start download");
                None
            }
        }
    }

    /// Stop a download, keeping its resume state, and tell the peer
    pub fn stop_download(&mut self, download: TaskId, now_ms: u64) -> bool {
        let Some(file) = self.tasks.downloads.remove(&download) else {
            return false;
        };
        file.release();
        self.send_unreliable(&TunnelMessage::FileCancel { file: download }, None, now_ms);
        true
    }

    /// Tear the tunnel down in place; idempotent
    pub fn close(&mut self) {
        if self.status == TunnelStatus::Closed {
            return;
        }
        let was_connected = self.status.is_connected();
        self.set_status(TunnelStatus::Closed);
        info!(tunnel = %self.handle, "tunnel closed");

        for link in self.links.clear() {
            if link.is_connected() {
                self.emit(Event::LinkDisconnected {
                    tunnel: self.handle,
                    route: link.route(),
                });
            }
        }
        if was_connected {
            self.emit(Event::Disconnected {
                tunnel: self.handle,
            });
        }

        self.send_window.drain();
        for (_, msg) in std::mem::take(&mut self.tasks.outgoing) {
            self.emit(Event::MessageSent {
                tunnel: self.handle,
                cookie: msg.cookie(),
                success: false,
            });
        }
        for (id, file) in std::mem::take(&mut self.tasks.downloads) {
            let hash = *file.hash();
            file.release();
            self.emit(Event::FileInterrupted {
                tunnel: self.handle,
                download: id,
                hash,
                reason: FileInterruptReason::TunnelClosed,
            });
        }
        for (_, upload) in std::mem::take(&mut self.tasks.uploads) {
            self.emit(Event::FileUnrequested {
                tunnel: self.handle,
                hash: *upload.hash(),
            });
        }
        self.tasks.incoming.clear();
        self.tasks.message_acks.clear();
        self.tasks.file_done.clear();
    }

    /// Reopen a closed tunnel with its identity and sessions intact
    pub fn awaken(&mut self, now_ms: u64) {
        if self.status != TunnelStatus::Closed {
            return;
        }
        self.set_status(TunnelStatus::Disconnected);
        for route in self.links.backups().into_iter().take(self.config.max_links) {
            self.links.insert(route, &self.config, now_ms);
        }
        self.last_recv_ms = Some(now_ms);
        debug!(tunnel = %self.handle, links = self.links.len(), "tunnel awakened");
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Handle a packet whose header addressed this tunnel
    pub(crate) fn on_packet(
        &mut self,
        header: &PacketHeader<'_>,
        from: SocketAddr,
        bouncer: Option<SocketAddr>,
        now_ms: u64,
    ) {
        let body = match self.endpoint.codec.open(header) {
            Ok(body) => body,
            Err(e) => {
                trace!(tunnel = %self.handle, %from, error = %e, "dropping packet");
                return;
            }
        };

        let verdict = classify(
            self.endpoint.remote_session,
            self.endpoint.local_session,
            body.sender_session,
            body.recipient_session,
        );
        if verdict.action == SessionAction::Ignore {
            trace!(
                tunnel = %self.handle,
                sender = %body.sender_session,
                recipient = %body.recipient_session,
                "session mismatch, ignoring"
            );
            return;
        }

        self.awaken(now_ms);
        if verdict.adopt {
            self.adopt_session(body.sender_session);
        }
        self.last_recv_ms = Some(now_ms);
        if body.sender_tunnel != 0 {
            self.endpoint.remote_tunnel = body.sender_tunnel;
        }

        let route = match bouncer {
            Some(b) => Route::bounced(from, b),
            None => Route::direct(from),
        };
        let (idx, created) = self.links.insert(route, &self.config, now_ms);
        if created {
            debug!(tunnel = %self.handle, %route, "link created by peer");
        }

        let connected = self.status.is_connected();
        let recv = {
            let mut wire = self.endpoint.wire(now_ms, connected);
            self.links.get_mut(idx).on_recv(&mut wire, &body)
        };
        if let Some(transition) = recv.transition {
            self.on_link_transition(idx, transition);
        }

        match verdict.action {
            SessionAction::NotifyOnly if !recv.replied => {
                let connected = self.status.is_connected();
                let mut wire = self.endpoint.wire(now_ms, connected);
                self.links.get_mut(idx).send_empty(&mut wire);
            }
            SessionAction::Process if !recv.duplicate => {
                if let Some(data) = &body.data {
                    self.on_data(data, idx, now_ms);
                }
            }
            _ => {}
        }

        self.flush_acks(Some(idx), now_ms);
        self.pump(now_ms);
    }

    fn adopt_session(&mut self, sender: SessionId) {
        let previous = self.endpoint.remote_session;
        self.endpoint.remote_session = sender;
        if !previous.is_known() {
            debug!(tunnel = %self.handle, remote = %sender, "learned peer session");
            return;
        }
        info!(tunnel = %self.handle, old = %previous, new = %sender, "peer started a new session");

        self.recv_window = RecvWindow::new(self.config.window_capacity);
        self.send_window.drain();
        for link in self.links.clear() {
            if link.is_connected() {
                self.emit(Event::LinkDisconnected {
                    tunnel: self.handle,
                    route: link.route(),
                });
            }
        }
        if self.status.is_connected() {
            self.set_status(TunnelStatus::Disconnected);
            self.emit(Event::Disconnected {
                tunnel: self.handle,
            });
        }
        self.endpoint.remote_tunnel = 0;
        for upload in self.tasks.reset_for_new_session() {
            self.emit(Event::FileUnrequested {
                tunnel: self.handle,
                hash: *upload.hash(),
            });
        }
    }

    fn on_link_transition(&mut self, idx: usize, transition: LinkTransition) {
        let route = self.links.get(idx).route();
        match transition {
            LinkTransition::Connected => {
                self.emit(Event::LinkConnected {
                    tunnel: self.handle,
                    route,
                });
                if self.status == TunnelStatus::Disconnected {
                    self.set_status(TunnelStatus::Connected);
                    info!(tunnel = %self.handle, %route, "tunnel connected");
                    self.emit(Event::Connected {
                        tunnel: self.handle,
                    });
                }
            }
            LinkTransition::Disconnected => self.on_link_lost(route),
        }
    }

    /// A connected link went away or lost connectivity
    fn on_link_lost(&mut self, route: Route) {
        self.emit(Event::LinkDisconnected {
            tunnel: self.handle,
            route,
        });
        if self.status.is_connected() && self.links.connected_count() == 0 {
            self.set_status(TunnelStatus::Disconnected);
            self.endpoint.remote_tunnel = 0;
            info!(tunnel = %self.handle, "tunnel disconnected");
            self.emit(Event::Disconnected {
                tunnel: self.handle,
            });
        }
    }

    fn on_data(&mut self, data: &[u8], idx: usize, now_ms: u64) {
        let message = match TunnelMessage::decode(data) {
            Ok(m) => m,
            Err(e) => {
                trace!(tunnel = %self.handle, error = %e, "undecodable tunnel message");
                return;
            }
        };
        match message {
            TunnelMessage::Ack(batch) => self.on_ack(&batch, now_ms),
            TunnelMessage::Reliable { tpsn, payload } => {
                if self.recv_window.accept(tpsn, now_ms) == Accept::Fresh {
                    self.on_reliable(payload, idx, now_ms);
                }
            }
            TunnelMessage::MessageCancel { message } => {
                if self.tasks.incoming.remove(&message).is_some() {
                    debug!(tunnel = %self.handle, message, "peer cancelled message");
                }
            }
            TunnelMessage::FileCancel { file } => self.end_upload(file),
            TunnelMessage::FileReject { file, reason } => self.fail_download(file, reason, false, now_ms),
            TunnelMessage::AccessPointRequest => {
                let reply = TunnelMessage::AccessPoints {
                    routes: self.advertised.clone(),
                };
                self.send_unreliable(&reply, Some(idx), now_ms);
            }
            TunnelMessage::AccessPoints { routes } => {
                for route in routes {
                    self.add_route(route, now_ms);
                }
            }
        }
    }

    fn on_reliable(&mut self, payload: Reliable, idx: usize, now_ms: u64) {
        match payload {
            Reliable::MessageSlice {
                message,
                total_len,
                index,
                data,
            } => self.on_message_slice(message, total_len, index, &data),
            Reliable::MessageAck { message } => {
                if let Some((_, cookie)) = self.tasks.confirm_message(message) {
                    self.message_delivered(cookie);
                }
            }
            Reliable::FileRequest {
                file,
                hash,
                size,
                block,
                wanted,
            } => self.on_file_request(file, hash, size, block, wanted, idx, now_ms),
            Reliable::FileSlice {
                file,
                block,
                index,
                data,
            } => self.on_file_slice(file, block, u32::from(index), &data, now_ms),
            Reliable::FileDone { file } => self.end_upload(file),
        }
    }

    fn on_message_slice(&mut self, message: u32, total_len: u32, index: u32, data: &[u8]) {
        if self.tasks.delivered.contains(message) {
            self.tasks.queue_message_ack(message);
            return;
        }
        if total_len > MAX_MESSAGE_LEN {
            trace!(tunnel = %self.handle, message, total_len, "message too large");
            return;
        }
        let slice_size = self.config.message_slice_size;
        let incoming = self
            .tasks
            .incoming
            .entry(message)
            .or_insert_with(|| IncomingMessage::new(total_len, slice_size));
        if incoming.total_len() != total_len {
            trace!(tunnel = %self.handle, message, "message length changed mid-transfer");
            return;
        }
        if let Err(e) = incoming.accept(index, data) {
            trace!(tunnel = %self.handle, message, error = %e, "bad message slice");
            return;
        }
        if !incoming.is_done() {
            return;
        }
        if let Some(done) = self.tasks.incoming.remove(&message) {
            self.tasks.delivered.insert(message);
            self.tasks.queue_message_ack(message);
            self.emit(Event::MessageReceived {
                tunnel: self.handle,
                data: done.into_data(),
            });
        }
    }

    fn message_delivered(&self, cookie: u64) {
        self.emit(Event::MessageSent {
            tunnel: self.handle,
            cookie,
            success: true,
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn on_file_request(
        &mut self,
        file: u32,
        hash: FileHash,
        size: u64,
        block: u32,
        wanted: u64,
        idx: usize,
        now_ms: u64,
    ) {
        if self.tasks.finished_uploads.contains(file) {
            return;
        }
        if !self.tasks.uploads.contains_key(&file) {
            match self.catalog.get(&hash) {
                Some(shared) if shared.size == size => {
                    let upload = OutgoingFile::new(file, hash, size, shared.reader, &self.config);
                    self.tasks.uploads.insert(file, upload);
                    debug!(tunnel = %self.handle, file, hash = %hex::encode(&hash[..8]), "serving file");
                    self.emit(Event::FileRequested {
                        tunnel: self.handle,
                        hash,
                    });
                }
                _ => {
                    debug!(tunnel = %self.handle, file, hash = %hex::encode(&hash[..8]), "requested file not shared");
                    let reject = TunnelMessage::FileReject {
                        file,
                        reason: FileInterruptReason::NotFound,
                    };
                    self.send_unreliable(&reject, Some(idx), now_ms);
                    return;
                }
            }
        }
        let Some(upload) = self.tasks.uploads.get_mut(&file) else {
            return;
        };
        match upload.on_request(block, wanted) {
            Ok(()) => {}
            Err(TransferError::ReaderFailed) => {
                warn!(tunnel = %self.handle, file, block, "reading shared file failed");
                self.end_upload(file);
                let reject = TunnelMessage::FileReject {
                    file,
                    reason: FileInterruptReason::PeerReadFailed,
                };
                self.send_unreliable(&reject, Some(idx), now_ms);
            }
            Err(e) => trace!(tunnel = %self.handle, file, error = %e, "bad block request"),
        }
    }

    fn end_upload(&mut self, file: u32) {
        if let Some(upload) = self.tasks.uploads.remove(&file) {
            self.tasks.finished_uploads.insert(file);
            self.emit(Event::FileUnrequested {
                tunnel: self.handle,
                hash: *upload.hash(),
            });
        }
    }

    fn on_file_slice(&mut self, file: TaskId, block: u32, index: u32, data: &[u8], now_ms: u64) {
        let Some(download) = self.tasks.downloads.get_mut(&file) else {
            return;
        };
        match download.accept_slice(block, index, data, now_ms) {
            Ok(SliceOutcome::FileComplete) => self.finish_download(file, now_ms),
            Ok(_) => {}
            Err(TransferError::WriterFailed) => {
                self.fail_download(file, FileInterruptReason::DiskError, true, now_ms);
            }
            Err(TransferError::ControlCorrupt) => {
                self.fail_download(file, FileInterruptReason::ControlCorrupt, true, now_ms);
            }
            Err(e) => trace!(tunnel = %self.handle, file, error = %e, "bad file slice"),
        }
    }

    fn finish_download(&mut self, id: TaskId, now_ms: u64) {
        let Some(mut file) = self.tasks.downloads.remove(&id) else {
            return;
        };
        let hash = *file.hash();
        match file.finalize() {
            Ok(()) => {
                info!(tunnel = %self.handle, id, size = file.size(), "download complete");
                self.tasks.file_done.push_back(id);
                self.emit(Event::FileDownloaded {
                    tunnel: self.handle,
                    download: id,
                    hash,
                });
            }
            Err(e) => {
                warn!(tunnel = %self.handle, id, error = %e, "finalizing download failed");
                file.release();
                self.send_unreliable(&TunnelMessage::FileCancel { file: id }, None, now_ms);
                self.emit(Event::FileInterrupted {
                    tunnel: self.handle,
                    download: id,
                    hash,
                    reason: FileInterruptReason::DiskError,
                });
            }
        }
    }

    fn fail_download(&mut self, id: TaskId, reason: FileInterruptReason, notify_peer: bool, now_ms: u64) {
        let Some(file) = self.tasks.downloads.remove(&id) else {
            return;
        };
        let hash = *file.hash();
        file.release();
        debug!(tunnel = %self.handle, id, %reason, "download interrupted");
        if notify_peer {
            self.send_unreliable(&TunnelMessage::FileCancel { file: id }, None, now_ms);
        }
        self.emit(Event::FileInterrupted {
            tunnel: self.handle,
            download: id,
            hash,
            reason,
        });
    }

    // ------------------------------------------------------------------
    // Reliability
    // ------------------------------------------------------------------

    fn on_ack(&mut self, batch: &AckBatch, now_ms: u64) {
        let mut highest = None;
        for tpsn in batch.acked() {
            highest = Some(highest.map_or(tpsn, |h: u32| if seq_lt(h, tpsn) { tpsn } else { h }));
            let Some(slot) = self.send_window.ack(tpsn) else {
                continue;
            };
            let delay = if tpsn == batch.first.0 {
                Some(batch.first.1)
            } else if tpsn == batch.last.0 {
                Some(batch.last.1)
            } else {
                None
            };
            let sample = delay.map(|d| {
                now_ms
                    .saturating_sub(slot.sent_ms)
                    .saturating_sub(u64::from(d))
            });
            if let Some(rtt) = sample {
                self.rtt.update(rtt);
            }
            self.history
                .record_ack(now_ms, sample.map(|s| u32::try_from(s).unwrap_or(u32::MAX)));
            self.cwnd.on_packet_acked();
            if let Some((_, cookie)) = self.tasks.on_unit_acked(slot.unit) {
                self.message_delivered(cookie);
            }
        }

        let Some(highest) = highest else {
            return;
        };
        let lost: Vec<u32> = batch
            .missing()
            .filter(|t| seq_diff(highest, *t) >= REORDER_THRESHOLD)
            .collect();
        for tpsn in lost {
            if let Some(slot) = self.send_window.lose(tpsn) {
                self.count_loss(slot, now_ms);
            }
        }
    }

    fn count_loss(&mut self, slot: SendSlot<SentUnit>, now_ms: u64) {
        trace!(tunnel = %self.handle, tpsn = slot.tpsn, unit = ?slot.unit, "send lost");
        self.cwnd.on_packet_lost();
        self.history.record_loss(now_ms);
        self.tasks.on_unit_lost(slot.unit);
    }

    /// Drain queued units into the send window until it fills or a send fails
    fn pump(&mut self, now_ms: u64) {
        if !self.status.is_connected() {
            return;
        }
        loop {
            if self.cwnd.is_full(self.send_window.in_flight()) || self.send_window.is_ring_full() {
                if let Some(age) = self.send_window.oldest_age(now_ms) {
                    self.cwnd.on_window_full(self.rtt.rto_ms(), age);
                }
                break;
            }
            let Some((unit, payload)) = self.tasks.next_unit(now_ms) else {
                break;
            };
            let Some(tpsn) = self.send_window.push(now_ms, unit) else {
                self.tasks.on_unit_lost(unit);
                break;
            };
            let message = TunnelMessage::Reliable { tpsn, payload };
            if !self.send_reliable(&message, now_ms) {
                if let Some(slot) = self.send_window.lose(tpsn) {
                    self.tasks.on_unit_lost(slot.unit);
                }
                break;
            }
        }
    }

    fn send_reliable(&mut self, message: &TunnelMessage, now_ms: u64) -> bool {
        let Some(idx) = self.links.next_connected() else {
            return false;
        };
        self.send_on(idx, message, now_ms)
    }

    /// Send a message that consumes no window slot, preferring `link`
    fn send_unreliable(&mut self, message: &TunnelMessage, link: Option<usize>, now_ms: u64) -> bool {
        let idx = link
            .filter(|&i| i < self.links.len())
            .or_else(|| self.links.next_connected())
            .or_else(|| (!self.links.is_empty()).then_some(0));
        match idx {
            Some(idx) => self.send_on(idx, message, now_ms),
            None => {
                trace!(tunnel = %self.handle, "no link for control message");
                false
            }
        }
    }

    fn send_on(&mut self, idx: usize, message: &TunnelMessage, now_ms: u64) -> bool {
        let data = match message.encode() {
            Ok(data) => data,
            Err(e) => {
                warn!(tunnel = %self.handle, error = %e, "cannot encode tunnel message");
                return false;
            }
        };
        let connected = self.status.is_connected();
        let mut wire = self.endpoint.wire(now_ms, connected);
        self.links.get_mut(idx).send_data(&mut wire, data)
    }

    fn flush_acks(&mut self, link: Option<usize>, now_ms: u64) {
        while let Some(batch) = self.recv_window.take_ack(now_ms, self.config.max_ack_bits) {
            self.send_unreliable(&TunnelMessage::Ack(batch), link, now_ms);
        }
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    /// Periodic maintenance: timeouts, links, control blocks, queued sends
    pub(crate) fn on_tick(&mut self, now_ms: u64) {
        if self.status == TunnelStatus::Closed {
            return;
        }

        for slot in self.send_window.expire(now_ms, self.rtt.rto_ms()) {
            self.count_loss(slot, now_ms);
        }

        let mut idx = 0;
        while idx < self.links.len() {
            if self.tick_link(idx, now_ms) {
                idx += 1;
            }
        }
        self.maintain_links(now_ms);
        self.service_downloads(now_ms);
        self.flush_acks(None, now_ms);
        self.pump(now_ms);
        self.check_idle(now_ms);
    }

    /// Tick one link; returns `false` if it expired and was removed
    fn tick_link(&mut self, idx: usize, now_ms: u64) -> bool {
        let connected = self.status.is_connected();
        let tick = {
            let mut wire = self.endpoint.wire(now_ms, connected);
            self.links.get_mut(idx).on_tick(&mut wire)
        };
        match tick {
            LinkTick::Alive(transition) => {
                if let Some(t) = transition {
                    self.on_link_transition(idx, t);
                }
                true
            }
            LinkTick::Expired => {
                let link = self.links.remove(idx);
                debug!(tunnel = %self.handle, route = %link.route(), "link expired");
                if link.is_connected() {
                    self.on_link_lost(link.route());
                }
                false
            }
        }
    }

    fn maintain_links(&mut self, now_ms: u64) {
        while self.links.connected_count() > self.config.max_links {
            let Some(idx) = self.links.worst_connected() else {
                break;
            };
            let link: Link = self.links.remove(idx);
            debug!(tunnel = %self.handle, route = %link.route(), latency = ?link.latency_ms(), "dropping slowest link");
            self.on_link_lost(link.route());
        }

        let due = |last: Option<u64>, interval| last.is_none_or(|t| now_ms.saturating_sub(t) >= interval);
        if self.links.is_empty() {
            if due(self.last_backup_retry_ms, millis(self.config.backup_retry_interval)) {
                if let Some(route) = self.links.next_backup() {
                    self.last_backup_retry_ms = Some(now_ms);
                    debug!(tunnel = %self.handle, %route, "retrying backup route");
                    let (idx, _) = self.links.insert(route, &self.config, now_ms);
                    self.tick_link(idx, now_ms);
                }
            }
        } else if self.status.is_connected()
            && self.links.connected_count() < self.config.min_links
            && due(self.last_access_request_ms, millis(self.config.access_point_interval))
        {
            self.last_access_request_ms = Some(now_ms);
            self.send_unreliable(&TunnelMessage::AccessPointRequest, None, now_ms);
        }
    }

    fn service_downloads(&mut self, now_ms: u64) {
        let mut complete = Vec::new();
        let mut failed = Vec::new();
        for (&id, file) in &mut self.tasks.downloads {
            if file.is_complete() {
                complete.push(id);
            } else if file.flush_control(now_ms, false).is_err() {
                failed.push(id);
            }
        }
        for id in complete {
            self.finish_download(id, now_ms);
        }
        for id in failed {
            self.fail_download(id, FileInterruptReason::ControlCorrupt, true, now_ms);
        }
    }

    fn check_idle(&mut self, now_ms: u64) {
        let Some(timeout) = self.config.idle_timeout else {
            return;
        };
        if !self.tasks.is_busy() && self.idle_time(now_ms) >= millis(timeout) {
            debug!(tunnel = %self.handle, "idle teardown");
            self.close();
        }
    }
}
