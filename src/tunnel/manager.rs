//! Tunnel manager: the in-memory registry of active tunnels.
//!
//! Validates parameters (port range, non-empty host, no duplicate local
//! port, no re-registration of an id already in use) before binding a
//! listener, and guards the shared tunnel map with a
//! `tokio::sync::RwLock<HashMap<..>>`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};

use crate::error::LocalError;

#[derive(Debug, Clone)]
pub struct Tunnel {
    pub id: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub created_at: Instant,
    pub last_used: Instant,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub connections_handled: u64,
}

/// Handle kept by the manager for a registered tunnel: its metadata plus
/// a shutdown switch for the proxy accept loop serving it.
pub(crate) struct TunnelHandle {
    pub tunnel: Tunnel,
    pub shutdown: watch::Sender<bool>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TunnelStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub connections_handled: u64,
    pub age: Duration,
}

#[derive(Default)]
pub struct TunnelManager {
    tunnels: RwLock<HashMap<String, TunnelHandle>>,
}

impl TunnelManager {
    pub fn new() -> Self {
        Self {
            tunnels: RwLock::new(HashMap::new()),
        }
    }

    /// Validate, bind the local listener, and register a new tunnel. The
    /// bind is the one inline I/O this method performs, so that an OS-level
    /// bind failure (e.g. the port already held by an unrelated process)
    /// surfaces to the caller instead of only failing a detached accept
    /// task. Returns the bound listener and a shutdown receiver for the
    /// caller to hand to the spawned accept loop.
    pub async fn register(
        &self,
        id: String,
        bind_address: &str,
        local_port: u16,
        remote_host: String,
        remote_port: u16,
    ) -> Result<(TcpListener, watch::Receiver<bool>), LocalError> {
        validate_tunnel_params(local_port, &remote_host, remote_port)?;

        let mut tunnels = self.tunnels.write().await;
        if tunnels.contains_key(&id) {
            return Err(LocalError::DuplicateTunnelId(id));
        }
        if is_port_in_use(&tunnels, local_port) {
            return Err(LocalError::PortInUse(local_port));
        }

        let bind_addr = format!("{bind_address}:{local_port}");
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| LocalError::BindFailed(bind_addr, e.to_string()))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let now = Instant::now();
        tunnels.insert(
            id.clone(),
            TunnelHandle {
                tunnel: Tunnel {
                    id,
                    local_port,
                    remote_host,
                    remote_port,
                    created_at: now,
                    last_used: now,
                    bytes_in: 0,
                    bytes_out: 0,
                    connections_handled: 0,
                },
                shutdown: shutdown_tx,
            },
        );
        Ok((listener, shutdown_rx))
    }

    /// Refresh a tunnel's `last_used` timestamp. Called by the proxy accept
    /// loop as each connection comes in, per the rule that a tunnel's
    /// idleness clock resets on accept, not on the connection's eventual
    /// close.
    pub async fn mark_accepted(&self, id: &str) {
        let mut tunnels = self.tunnels.write().await;
        if let Some(handle) = tunnels.get_mut(id) {
            handle.tunnel.last_used = Instant::now();
        }
    }

    /// Signal the tunnel's accept loop to stop and drop it from the
    /// registry. A no-op (returns `false`) if `id` isn't registered.
    pub async fn unregister(&self, id: &str) -> bool {
        let mut tunnels = self.tunnels.write().await;
        if let Some(handle) = tunnels.remove(id) {
            let _ = handle.shutdown.send(true);
            true
        } else {
            false
        }
    }

    pub async fn list(&self) -> Vec<Tunnel> {
        self.tunnels.read().await.values().map(|h| h.tunnel.clone()).collect()
    }

    pub async fn stats(&self, id: &str) -> Option<TunnelStats> {
        let tunnels = self.tunnels.read().await;
        tunnels.get(id).map(|h| TunnelStats {
            bytes_in: h.tunnel.bytes_in,
            bytes_out: h.tunnel.bytes_out,
            connections_handled: h.tunnel.connections_handled,
            age: h.tunnel.created_at.elapsed(),
        })
    }

    /// Record bytes and a handled connection against a tunnel once it
    /// finishes. Does not touch `last_used`; that resets on accept, via
    /// [`TunnelManager::mark_accepted`].
    pub async fn record_transfer(&self, id: &str, bytes_in: u64, bytes_out: u64) {
        let mut tunnels = self.tunnels.write().await;
        if let Some(handle) = tunnels.get_mut(id) {
            handle.tunnel.bytes_in += bytes_in;
            handle.tunnel.bytes_out += bytes_out;
            handle.tunnel.connections_handled += 1;
        }
    }

    pub async fn unregister_all(&self) {
        let mut tunnels = self.tunnels.write().await;
        for (_, handle) in tunnels.drain() {
            let _ = handle.shutdown.send(true);
        }
    }

    /// Synchronous best-effort variant of [`TunnelManager::unregister_all`],
    /// used from `RelayTunnelClient`'s `Drop` impl where no executor is
    /// available to await the lock. Signals every accept loop to stop; if
    /// the lock is contended at the exact moment of drop, those tunnels are
    /// left to the caller's earlier explicit `close()`.
    pub(crate) fn unregister_all_sync(&self) {
        if let Ok(mut tunnels) = self.tunnels.try_write() {
            for (_, handle) in tunnels.drain() {
                let _ = handle.shutdown.send(true);
            }
        }
    }
}

fn validate_tunnel_params(local_port: u16, remote_host: &str, remote_port: u16) -> Result<(), LocalError> {
    if local_port == 0 {
        return Err(LocalError::InvalidConfig("local_port must be 1..=65535".into()));
    }
    if remote_port == 0 {
        return Err(LocalError::InvalidConfig("remote_port must be 1..=65535".into()));
    }
    if remote_host.trim().is_empty() {
        return Err(LocalError::InvalidConfig("remote_host must not be empty".into()));
    }
    Ok(())
}

fn is_port_in_use(tunnels: &HashMap<String, TunnelHandle>, local_port: u16) -> bool {
    tunnels.values().any(|h| h.tunnel.local_port == local_port)
}
