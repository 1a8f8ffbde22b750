//! Heartbeat engine: client-initiated keepalive ticker with a
//! miss-counter that fatally ends the session after too many unanswered
//! beats.
//!
//! Runs a `tokio::select!` loop over a sleep timer, an incoming-ack
//! channel, and a shutdown signal; missed beats increment a counter that
//! ends the session once it exceeds the configured maximum.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{ApplicationError, ApplicationErrorCode};
use crate::message::Message;
use crate::metrics::MetricsSink;
use crate::session::ControlSession;

/// Runs for as long as the session is `Ready`. `start()` spawns the ticker
/// task; `stop()` is idempotent and safe to call even if the ticker was
/// never started. Restarting after a stop is only meaningful while the
/// session is still `Ready` — the caller (the client facade) is
/// responsible for not restarting a heartbeat on a dead session.
pub struct HeartbeatEngine {
    session: Arc<ControlSession>,
    metrics: Arc<dyn MetricsSink>,
    interval: Duration,
    response_timeout: Duration,
    max_missed: u32,
    missed: Arc<AtomicU32>,
    shutdown: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl HeartbeatEngine {
    pub fn new(
        session: Arc<ControlSession>,
        metrics: Arc<dyn MetricsSink>,
        interval: Duration,
        response_timeout: Duration,
        max_missed: u32,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        Self {
            session,
            metrics,
            interval,
            response_timeout,
            max_missed,
            missed: Arc::new(AtomicU32::new(0)),
            shutdown,
            shutdown_rx,
            handle: None,
        }
    }

    pub fn missed_count(&self) -> u32 {
        self.missed.load(Ordering::SeqCst)
    }

    /// Start the ticker task. No-op if already running.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let session = self.session.clone();
        let metrics = self.metrics.clone();
        let interval = self.interval;
        let response_timeout = self.response_timeout;
        let max_missed = self.max_missed;
        let missed = self.missed.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        // Reset for a fresh start so a previous stop/start cycle doesn't
        // carry over a stale miss count.
        let _ = self.shutdown.send(false);

        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("heartbeat engine stopping");
                            return;
                        }
                    }
                    _ = ticker.tick() => {
                        let started = tokio::time::Instant::now();
                        let outcome = beat(&session, response_timeout).await;
                        match outcome {
                            Ok(()) => {
                                missed.store(0, Ordering::SeqCst);
                                metrics.heartbeat_latency(started.elapsed());
                            }
                            Err(e) => {
                                let count = missed.fetch_add(1, Ordering::SeqCst) + 1;
                                warn!(error = %e, missed = count, max_missed, "heartbeat not acknowledged");
                                if count > max_missed {
                                    warn!("heartbeat miss count exceeded max_missed, closing session");
                                    session.close().await;
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        }));
    }

    /// Idempotent: signals the ticker task to stop and waits for it.
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for HeartbeatEngine {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn beat(session: &ControlSession, response_timeout: Duration) -> Result<(), ApplicationError> {
    let mut ack_rx = session.send_heartbeat().await.map_err(|e| {
        ApplicationError::new(ApplicationErrorCode::HeartbeatFailed, e.to_string())
    })?;

    let ack = tokio::time::timeout(response_timeout, ack_rx.recv())
        .await
        .map_err(|_| {
            ApplicationError::new(
                ApplicationErrorCode::HeartbeatFailed,
                format!("no heartbeat_response within {response_timeout:?}"),
            )
        })?
        .ok_or_else(|| {
            ApplicationError::new(
                ApplicationErrorCode::HeartbeatFailed,
                "heartbeat ack channel closed".to_string(),
            )
        })?;

    match ack {
        Message::HeartbeatResponse { .. } => Ok(()),
        other => Err(ApplicationError::new(
            ApplicationErrorCode::HeartbeatFailed,
            format!("unexpected response to heartbeat: {}", other.type_name()),
        )),
    }
}
