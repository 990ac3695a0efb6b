//! Integration tests for whole-engine behavior.
//!
//! Two or more registries talk over the in-process loopback network, so
//! timing and loss are fully controlled by each test.

use plait_core::transfer::ControlBlock;
use plait_core::tunnel::{Reliable, TunnelMessage};
use plait_core::{
    Event, MemoryReader, MemoryWriter, PeerIdentity, Route, TunnelHandle, TunnelStatus,
};
use plait_integration_tests::fixtures::{LoopbackNetwork, decode_message};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const PASSPHRASE: &str = "integration";
const BOOTSTRAP: &[u8] = b"hello";
const CLIENT: &str = "10.0.0.1:1000";
const SERVER: &str = "10.0.0.2:2000";

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn identity() -> PeerIdentity {
    PeerIdentity::from_passphrase(PASSPHRASE)
}

fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Client and server with one connected tunnel between them
struct Setup {
    net: LoopbackNetwork,
    client: usize,
    server: usize,
    tunnel: TunnelHandle,
}

impl Setup {
    fn connected() -> Self {
        let mut net = LoopbackNetwork::new();
        let client = net.add_node(CLIENT);
        let server = net.add_listener(SERVER, PASSPHRASE, BOOTSTRAP);
        let tunnel = net.node(client).registry.open_tunnel(
            identity(),
            &[Route::direct(addr(SERVER))],
            BOOTSTRAP,
        );
        assert!(tunnel.is_valid());

        let up = net.run_until(200, 10, |n| {
            let server_up = n
                .node(server)
                .registry
                .handles()
                .first()
                .and_then(|h| n.node(server).registry.status(*h))
                == Some(TunnelStatus::Connected);
            server_up && n.node(client).registry.status(tunnel) == Some(TunnelStatus::Connected)
        });
        assert!(up, "tunnel did not connect");
        Self {
            net,
            client,
            server,
            tunnel,
        }
    }

    fn server_tunnel(&self) -> TunnelHandle {
        self.net.node(self.server).registry.handles()[0]
    }
}

fn count(events: &[Event], pred: impl Fn(&Event) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}

#[test]
fn test_handshake_connects_once() {
    let mut s = Setup::connected();
    s.net.run(10, 1_000);

    let client_events = s.net.node(s.client).drain_events();
    let server_events = s.net.node(s.server).drain_events();
    for events in [&client_events, &server_events] {
        assert_eq!(count(events, |e| matches!(e, Event::Connected { .. })), 1);
        assert_eq!(count(events, |e| matches!(e, Event::Disconnected { .. })), 0);
        assert_eq!(count(events, |e| matches!(e, Event::Attached { .. })), 1);
    }
    assert_eq!(s.net.node(s.server).registry.tunnel_count(), 1);
    assert_eq!(s.net.node(s.server).registry.stats().accepted(), 1);
    assert_eq!(s.net.node(s.client).registry.connected_links(s.tunnel), Some(1));
}

#[test]
fn test_unknown_identity_is_not_accepted() {
    let mut net = LoopbackNetwork::new();
    let client = net.add_node(CLIENT);
    let server = net.add_listener(SERVER, PASSPHRASE, BOOTSTRAP);
    let tunnel = net.node(client).registry.open_tunnel(
        PeerIdentity::from_passphrase("someone else"),
        &[Route::direct(addr(SERVER))],
        BOOTSTRAP,
    );
    net.run(20, 100);

    assert_eq!(net.node(server).registry.tunnel_count(), 0);
    assert!(net.node(server).registry.stats().dropped() > 0);
    assert_eq!(
        net.node(client).registry.status(tunnel),
        Some(TunnelStatus::Disconnected)
    );
}

#[test]
fn test_message_retransmitted_after_slice_loss() {
    let mut s = Setup::connected();
    s.net.node(s.client).drain_events();

    let id = identity();
    let from = addr(CLIENT);
    let mut dropped_once = false;
    s.net.set_drop_rule(move |d| {
        if dropped_once || d.from != from {
            return false;
        }
        let hit = matches!(
            decode_message(&id, &d.data),
            Some(TunnelMessage::Reliable {
                payload: Reliable::MessageSlice { index: 1, .. },
                ..
            })
        );
        dropped_once |= hit;
        hit
    });

    let data = content(5_000);
    assert!(s.net.node(s.client).registry.send_message(s.tunnel, data.clone(), 42));

    let client = s.client;
    let mut client_events = Vec::new();
    let delivered = s.net.run_until(600, 20, |n| {
        client_events.extend(n.node(client).drain_events());
        client_events
            .iter()
            .any(|e| matches!(e, Event::MessageSent { .. }))
    });
    assert!(delivered, "message was never confirmed");
    assert_eq!(s.net.dropped(), 1);

    s.net.run(20, 100);
    client_events.extend(s.net.node(s.client).drain_events());
    let sent: Vec<_> = client_events
        .iter()
        .filter(|e| matches!(e, Event::MessageSent { .. }))
        .cloned()
        .collect();
    assert_eq!(
        sent,
        vec![Event::MessageSent {
            tunnel: s.tunnel,
            cookie: 42,
            success: true
        }]
    );

    let received: Vec<_> = s
        .net
        .node(s.server)
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            Event::MessageReceived { data, .. } => Some(data),
            _ => None,
        })
        .collect();
    assert_eq!(received, vec![data]);
}

#[test]
fn test_message_confirmed_once_after_ack_loss() {
    let mut s = Setup::connected();
    s.net.node(s.client).drain_events();
    s.net.node(s.server).drain_events();

    let id = identity();
    let client_addr = addr(CLIENT);
    let server_addr = addr(SERVER);
    let slices_sent = Arc::new(AtomicUsize::new(0));
    let seen = slices_sent.clone();
    let mut dropped_once = false;
    s.net.set_drop_rule(move |d| {
        match decode_message(&id, &d.data) {
            Some(TunnelMessage::Reliable {
                payload: Reliable::MessageSlice { .. },
                ..
            }) if d.from == client_addr => {
                seen.fetch_add(1, Ordering::Relaxed);
                false
            }
            Some(TunnelMessage::Ack(_)) if d.from == server_addr && !dropped_once => {
                dropped_once = true;
                true
            }
            _ => false,
        }
    });

    assert!(s.net.node(s.client).registry.send_message(s.tunnel, content(600), 7));

    let client = s.client;
    let mut client_events = Vec::new();
    let confirmed = s.net.run_until(600, 20, |n| {
        client_events.extend(n.node(client).drain_events());
        client_events
            .iter()
            .any(|e| matches!(e, Event::MessageSent { .. }))
    });
    assert!(confirmed, "message was never confirmed");
    assert_eq!(s.net.dropped(), 1);
    assert_eq!(slices_sent.load(Ordering::Relaxed), 2);

    s.net.run(50, 100);
    client_events.extend(s.net.node(s.client).drain_events());
    assert_eq!(
        count(&client_events, |e| matches!(e, Event::MessageSent { .. })),
        1
    );
    assert!(client_events.contains(&Event::MessageSent {
        tunnel: s.tunnel,
        cookie: 7,
        success: true
    }));

    let server_events = s.net.node(s.server).drain_events();
    assert_eq!(
        count(&server_events, |e| matches!(e, Event::MessageReceived { .. })),
        1
    );
}

#[test]
fn test_close_ends_every_upload() {
    let mut s = Setup::connected();
    let size = 4 * 1024 * 1024;
    let files: Vec<_> = (0..2u8)
        .map(|seed| {
            let data: Vec<u8> = content(size).into_iter().map(|b| b ^ seed).collect();
            let hash = *blake3::hash(&data).as_bytes();
            s.net
                .node(s.server)
                .registry
                .share_file(hash, size as u64, Arc::new(MemoryReader::new(data)));
            hash
        })
        .collect();

    let writers: Vec<_> = files
        .iter()
        .map(|hash| {
            let writer = MemoryWriter::new();
            s.net
                .node(s.client)
                .registry
                .start_download(s.tunnel, *hash, size as u64, Box::new(writer.clone()))
                .unwrap();
            writer
        })
        .collect();

    let server = s.server;
    let mut server_events = Vec::new();
    let serving = s.net.run_until(100, 5, |n| {
        server_events.extend(n.node(server).drain_events());
        count(&server_events, |e| matches!(e, Event::FileRequested { .. })) == 2
    });
    assert!(serving, "uploads never started");

    let server_tunnel = s.server_tunnel();
    assert!(s.net.node(s.server).registry.close_tunnel(server_tunnel));
    server_events.extend(s.net.node(s.server).drain_events());
    assert_eq!(
        count(&server_events, |e| matches!(e, Event::FileUnrequested { .. })),
        2
    );
    assert!(server_events.contains(&Event::Detached {
        tunnel: server_tunnel
    }));

    // discard what was already on the wire, then watch for late slices
    s.net.set_drop_rule(|_| true);
    s.net.hop();
    let late = Arc::new(AtomicUsize::new(0));
    let seen = late.clone();
    let id = identity();
    let from = addr(SERVER);
    s.net.set_drop_rule(move |d| {
        if d.from == from
            && matches!(
                decode_message(&id, &d.data),
                Some(TunnelMessage::Reliable {
                    payload: Reliable::FileSlice { .. },
                    ..
                })
            )
        {
            seen.fetch_add(1, Ordering::Relaxed);
        }
        false
    });
    s.net.step(50, 10);

    assert_eq!(late.load(Ordering::Relaxed), 0);
    for writer in &writers {
        assert!(!writer.snapshot().finalized);
    }
}

#[test]
fn test_download_resumes_after_stop() {
    let mut s = Setup::connected();
    let data = content(300_000);
    let size = data.len() as u64;
    let hash = *blake3::hash(&data).as_bytes();
    s.net
        .node(s.server)
        .registry
        .share_file(hash, size, Arc::new(MemoryReader::new(data.clone())));

    let first = MemoryWriter::new();
    let registry = s.net.node(s.client).registry.clone();
    let first_id = registry
        .start_download(s.tunnel, hash, size, Box::new(first.clone()))
        .unwrap();

    let progress = |w: &MemoryWriter| {
        w.snapshot()
            .control
            .and_then(|c| ControlBlock::decode(&c).ok())
            .map_or(0, |cb| cb.block)
    };
    assert!(s.net.run_until(500, 5, |_| progress(&first) >= 2));
    assert!(registry.stop_download(s.tunnel, first_id));

    let saved = first.snapshot();
    assert!(saved.released);
    assert!(!saved.finalized);
    let cb = ControlBlock::decode(saved.control.as_deref().unwrap()).unwrap();
    let resumed_at = (u64::from(cb.block) * 64 + u64::from(cb.next_slice)) * 1024;

    let second = MemoryWriter::from_file(saved.clone());
    let second_id = registry
        .start_download(s.tunnel, hash, size, Box::new(second.clone()))
        .unwrap();
    assert_ne!(first_id, second_id);
    assert_eq!(
        registry.download_progress(s.tunnel, second_id),
        Some((resumed_at.min(size), size))
    );

    let client = s.client;
    let mut events = Vec::new();
    let done = s.net.run_until(1_000, 5, |n| {
        events.extend(n.node(client).drain_events());
        events.iter().any(|e| {
            matches!(e, Event::FileDownloaded { download, .. } if *download == second_id)
        })
    });
    assert!(done, "resumed download did not finish");

    let finished = second.snapshot();
    assert!(finished.finalized);
    assert_eq!(finished.data, data);
    let total_slices = size.div_ceil(1024) as usize;
    let skipped = (resumed_at / 1024) as usize;
    assert_eq!(finished.writes - saved.writes, total_slices - skipped);
}

#[test]
fn test_download_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.bin");
    let target = dir.path().join("target.bin");
    let data = content(200_000);
    std::fs::write(&source, &data).unwrap();

    let mut s = Setup::connected();
    let (info, reader) = plait_files::open_shared(&source).unwrap();
    s.net
        .node(s.server)
        .registry
        .share_file(info.hash, info.size, reader);

    let writer = plait_files::FsWriter::create(&target).unwrap();
    let sidecar = writer.sidecar().to_path_buf();
    let download = s
        .net
        .node(s.client)
        .registry
        .start_download(s.tunnel, info.hash, info.size, Box::new(writer))
        .unwrap();

    let client = s.client;
    let mut events = Vec::new();
    let done = s.net.run_until(1_000, 5, |n| {
        events.extend(n.node(client).drain_events());
        events
            .iter()
            .any(|e| matches!(e, Event::FileDownloaded { download: d, .. } if *d == download))
    });
    assert!(done, "download did not finish");

    let (hash, len) = plait_files::hash_file(&target).unwrap();
    assert_eq!(hash, info.hash);
    assert_eq!(len, info.size);
    assert!(!sidecar.exists());
}
