//! Receive and tick loops.
//!
//! The engine is synchronous; the driver owns the two tokio tasks that feed
//! it. One task reads the socket and routes every packet into the registry,
//! the other emits ticks at a fixed interval.

use crate::error::TransportError;
use crate::udp::UdpSubstrate;
use plait_core::{Registry, Tick};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Driver settings
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Time between ticks
    pub tick_interval: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(10),
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch
#[must_use]
pub fn network_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Running receive and tick tasks
#[derive(Debug)]
pub struct Driver {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Driver {
    /// Start feeding `registry` from `substrate`
    #[must_use]
    pub fn spawn(registry: Arc<Registry>, substrate: Arc<UdpSubstrate>, config: DriverConfig) -> Self {
        let (shutdown, rx) = watch::channel(false);
        registry.on_tick(Tick::new(0, network_time_ms()));

        let recv = tokio::spawn(recv_loop(registry.clone(), substrate, rx.clone()));
        let tick = tokio::spawn(tick_loop(registry, config.tick_interval, rx));
        Self {
            shutdown,
            tasks: vec![recv, tick],
        }
    }

    /// Stop both loops and wait for them
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "driver task failed");
            }
        }
        debug!("driver stopped");
    }
}

async fn recv_loop(registry: Arc<Registry>, substrate: Arc<UdpSubstrate>, mut stop: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            result = substrate.recv() => match result {
                Ok(inbound) => registry.on_packet(&inbound.data, inbound.from, inbound.bouncer),
                Err(TransportError::Closed) => break,
                Err(e) => warn!(error = %e, "receive failed"),
            },
        }
    }
}

async fn tick_loop(registry: Arc<Registry>, interval: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut counter = 0u64;
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {
                counter += 1;
                registry.on_tick(Tick::new(counter, network_time_ms()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::udp::UdpConfig;
    use crossbeam_channel::Receiver;
    use plait_core::{Event, PeerIdentity, RegistryConfig, Route, StaticAcceptor, TunnelStatus};

    async fn node(app_id: u32) -> (Arc<Registry>, Arc<UdpSubstrate>, Receiver<Event>) {
        let substrate = Arc::new(
            UdpSubstrate::bind("127.0.0.1:0".parse().unwrap(), &UdpConfig::default())
                .await
                .unwrap(),
        );
        let config = RegistryConfig {
            app_id,
            ..RegistryConfig::default()
        };
        let (registry, events) = Registry::new(config, substrate.clone());
        (Arc::new(registry), substrate, events)
    }

    #[tokio::test]
    async fn test_two_nodes_connect_and_exchange() {
        let identity = PeerIdentity::from_passphrase("driver test");
        let (server, server_sock, server_events) = node(3).await;
        server.set_acceptor(Arc::new(
            StaticAcceptor::new(3).with_peer(b"join".to_vec(), identity.clone()),
        ));
        let (client, client_sock, _client_events) = node(3).await;

        let server_addr = server_sock.local_addr().unwrap();
        let s_driver = Driver::spawn(server.clone(), server_sock, DriverConfig::default());
        let c_driver = Driver::spawn(client.clone(), client_sock, DriverConfig::default());

        let handle = client.open_tunnel(identity, &[Route::direct(server_addr)], b"join");
        let mut connected = false;
        for _ in 0..200 {
            if client.status(handle) == Some(TunnelStatus::Connected) {
                connected = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(connected);

        assert!(client.send_message(handle, b"over udp".to_vec(), 1));
        let mut received = None;
        for _ in 0..200 {
            if let Some(Event::MessageReceived { data, .. }) = server_events
                .try_iter()
                .find(|e| matches!(e, Event::MessageReceived { .. }))
            {
                received = Some(data);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(received.as_deref(), Some(&b"over udp"[..]));

        c_driver.shutdown().await;
        s_driver.shutdown().await;
    }
}
