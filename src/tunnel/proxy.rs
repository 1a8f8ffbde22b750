//! Tunnel proxy: accept loop serving an already-bound local listener and
//! pumping raw bytes to/from the configured remote host:port.
//!
//! The listener is bound by [`crate::tunnel::manager::TunnelManager::register`]
//! before this loop starts, so a bind failure is reported to the caller of
//! `register`/`create_tunnel` rather than discovered here. Each accepted
//! connection dials the remote endpoint, then runs a pair of copy pumps
//! with byte accounting and half-close handling. Dial failures are logged
//! and do not stop the listener — only the one attempted connection fails.

use std::sync::Arc;
use std::time::Instant;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::metrics::{Direction, MetricsSink};
use crate::tunnel::manager::TunnelManager;

/// Serve `listener`, forwarding each accepted connection to
/// `remote_host:remote_port`, until `shutdown` fires or the manager drops
/// this tunnel's handle.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    tunnel_id: String,
    tenant_id: String,
    listener: TcpListener,
    remote_host: String,
    remote_port: u16,
    manager: Arc<TunnelManager>,
    metrics: Arc<dyn MetricsSink>,
    mut shutdown: watch::Receiver<bool>,
) {
    let local_addr = listener.local_addr().map(|a| a.to_string()).unwrap_or_default();
    info!(tunnel_id, local_addr, remote = %format!("{remote_host}:{remote_port}"), "tunnel listening");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!(tunnel_id, "tunnel proxy shutting down");
                return;
            }
            accepted = listener.accept() => {
                let (inbound, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(tunnel_id, error = %e, "accept failed");
                        continue;
                    }
                };
                debug!(tunnel_id, %peer, "accepted connection");
                manager.mark_accepted(&tunnel_id).await;

                let tunnel_id = tunnel_id.clone();
                let tenant_id = tenant_id.clone();
                let remote_host = remote_host.clone();
                let manager = manager.clone();
                let metrics = metrics.clone();

                tokio::spawn(async move {
                    metrics.active_connections(&tunnel_id, 1);
                    let started = Instant::now();
                    match pump(inbound, &remote_host, remote_port).await {
                        Ok((bytes_in, bytes_out)) => {
                            metrics.bytes_transferred(&tunnel_id, &tenant_id, Direction::Inbound, bytes_in);
                            metrics.bytes_transferred(&tunnel_id, &tenant_id, Direction::Outbound, bytes_out);
                            metrics.connection_handled(&tunnel_id, &tenant_id);
                            manager.record_transfer(&tunnel_id, bytes_in, bytes_out).await;
                        }
                        Err(e) => {
                            warn!(tunnel_id, error = %e, "proxied connection failed");
                            metrics.error("proxy_connection_failed", &tunnel_id, &tenant_id);
                        }
                    }
                    metrics.connection_duration(&tunnel_id, started.elapsed());
                    metrics.active_connections(&tunnel_id, -1);
                });
            }
        }
    }
}

/// Dial the remote and pump bytes both directions until one side closes.
/// Returns `(bytes_from_inbound, bytes_from_remote)`.
async fn pump(
    mut inbound: TcpStream,
    remote_host: &str,
    remote_port: u16,
) -> std::io::Result<(u64, u64)> {
    let mut outbound = TcpStream::connect((remote_host, remote_port)).await?;
    tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await
}
