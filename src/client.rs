//! Client facade: composes the transport, session, heartbeat, and
//! tunnel manager behind `connect`/`authenticate`/
//! `create_tunnel`/`start_heartbeat`/`close`.
//!
//! A `Client` struct composes the auth strategy, tunnel manager, and
//! heartbeat engine behind a retry policy, with a background task that
//! drains session events (server-initiated tunnel registration, error
//! frames, session close) for as long as a session is live.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::auth::AuthStrategy;
use crate::config::ClientConfig;
use crate::error::{LocalError, RelayError, TransportError};
use crate::heartbeat::HeartbeatEngine;
use crate::message::ClientInfo;
use crate::metrics::MetricsSink;
use crate::retry::{RetryCounter, RetryPolicy};
use crate::session::{ControlSession, Phase, SessionEvent};
use crate::transport;
use crate::tunnel::manager::TunnelManager;
use crate::tunnel::proxy;

const FEATURES: &[&str] = &["tls", "heartbeat", "tunnel_info"];

/// Composes the whole client-side core behind a small facade surface.
/// Exactly one `ControlSession` is live at a time; reconnecting replaces
/// it and all tunnels it owned are gone with it — tunnels are owned by
/// the session they were registered under.
pub struct RelayTunnelClient {
    config: ClientConfig,
    metrics: Arc<dyn MetricsSink>,
    auth_strategy: Option<Arc<dyn AuthStrategy>>,
    retry_policy: RetryPolicy,
    session: RwLock<Option<Arc<ControlSession>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    tunnel_manager: Arc<TunnelManager>,
    heartbeat: Arc<Mutex<Option<HeartbeatEngine>>>,
    client_id: RwLock<Option<String>>,
    tenant_id: RwLock<Option<String>>,
    retry_connect: Mutex<RetryCounter>,
    retry_authenticate: Mutex<RetryCounter>,
    retry_create_tunnel: Mutex<RetryCounter>,
}

impl RelayTunnelClient {
    pub fn new(
        config: ClientConfig,
        auth_strategy: Option<Arc<dyn AuthStrategy>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let retry_policy = RetryPolicy::new(
            config.retry.max_retries,
            config.retry.initial_delay,
            config.retry.backoff_multiplier,
            config.retry.max_backoff,
        );
        Self {
            config,
            metrics,
            auth_strategy,
            retry_policy,
            session: RwLock::new(None),
            event_task: Mutex::new(None),
            tunnel_manager: Arc::new(TunnelManager::new()),
            heartbeat: Arc::new(Mutex::new(None)),
            client_id: RwLock::new(None),
            tenant_id: RwLock::new(None),
            retry_connect: Mutex::new(RetryCounter::new()),
            retry_authenticate: Mutex::new(RetryCounter::new()),
            retry_create_tunnel: Mutex::new(RetryCounter::new()),
        }
    }

    /// Dial the relay and drive the session through `hello`, retrying
    /// transport failures per the configured retry policy. Leaves the session in
    /// `Phase::HelloSent`; call [`RelayTunnelClient::authenticate`] next.
    pub async fn connect(&self) -> Result<(), RelayError> {
        if self.is_connected().await || self.session.read().await.is_some() {
            return Err(LocalError::AlreadyConnected.into());
        }
        self.retry_connect.lock().await.reset();

        loop {
            match self.dial_and_hello().await {
                Ok(session) => {
                    self.retry_connect.lock().await.reset();
                    *self.session.write().await = Some(session);
                    return Ok(());
                }
                Err(e) if e.retryable() => {
                    let mut counter = self.retry_connect.lock().await;
                    match counter.next_delay(&self.retry_policy) {
                        Some(delay) => {
                            drop(counter);
                            warn!(error = %e, delay_ms = delay.as_millis(), "connect failed, retrying");
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn dial_and_hello(&self) -> Result<Arc<ControlSession>, RelayError> {
        let relay = &self.config.relay;
        let addr = (relay.host.as_str(), relay.port);
        debug!(host = relay.host, port = relay.port, "dialing relay");

        let stream = tokio::time::timeout(relay.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout(relay.connect_timeout))?
            .map_err(|e| TransportError::Dial(e.to_string()))?;

        let limits = &self.config.limits;
        let (reader, writer) = if self.config.tls.enabled {
            let tls_config = crate::tls::build_client_config(&self.config.tls)?;
            let connector = TlsConnector::from(Arc::new(tls_config));
            let server_name =
                crate::tls::server_name(self.config.tls.server_name.as_deref(), &relay.host)?;
            let tls_stream = tokio::time::timeout(
                relay.connect_timeout,
                connector.connect(server_name, stream),
            )
            .await
            .map_err(|_| TransportError::Timeout(relay.connect_timeout))?
            .map_err(|e| TransportError::TlsHandshake(e.to_string()))?;
            transport::split_tls(
                tls_stream,
                limits.max_message_size,
                limits.read_deadline,
                limits.write_deadline,
            )
        } else {
            transport::split(
                stream,
                limits.max_message_size,
                limits.read_deadline,
                limits.write_deadline,
            )
        };

        let error_window = crate::error::ErrorWindow::new(Duration::from_secs(60), 3);
        let (session, events_rx) = ControlSession::new(reader, writer, error_window);
        let session = Arc::new(session);

        let handle = tokio::spawn(run_events(
            events_rx,
            session.clone(),
            self.tunnel_manager.clone(),
            self.heartbeat.clone(),
            self.metrics.clone(),
            self.config.tunnel_bind_address.clone(),
        ));
        *self.event_task.lock().await = Some(handle);

        session
            .hello(
                FEATURES.iter().map(|s| s.to_string()).collect(),
                relay.connect_timeout,
            )
            .await?;
        Ok(session)
    }

    /// Pre-validate (if an [`AuthStrategy`] is configured) and send `auth`,
    /// retrying retryable application errors per the retry policy. On success, records
    /// `client_id` and, if present, `tenant_id`.
    pub async fn authenticate(&self, token: String) -> Result<(), RelayError> {
        let client_info = ClientInfo {
            os: std::env::consts::OS.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            extra: Default::default(),
        };

        let mut claim_tenant_id = None;
        if let Some(strategy) = &self.auth_strategy {
            let claims = strategy.validate(&token)?;
            claim_tenant_id = claims.tenant_id;
        }

        self.retry_authenticate.lock().await.reset();
        loop {
            let session = self.active_session().await?;
            match session
                .authenticate(token.clone(), client_info.clone(), self.config.relay.connect_timeout)
                .await
            {
                Ok(outcome) => {
                    self.retry_authenticate.lock().await.reset();
                    *self.client_id.write().await = outcome.client_id;
                    *self.tenant_id.write().await = outcome.tenant_id.or(claim_tenant_id);
                    return Ok(());
                }
                Err(e) if e.retryable() => {
                    let mut counter = self.retry_authenticate.lock().await;
                    match counter.next_delay(&self.retry_policy) {
                        Some(delay) => {
                            drop(counter);
                            warn!(error = %e, delay_ms = delay.as_millis(), "authenticate failed, retrying");
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send `tunnel_info`, await `tunnel_response`, then register the
    /// tunnel with the manager and spawn its accept loop. Retries retryable
    /// errors from the request per the retry policy; a local registration failure
    /// (duplicate id, port in use) is never retried.
    pub async fn create_tunnel(
        &self,
        tunnel_id: String,
        local_port: u16,
        remote_host: String,
        remote_port: u16,
    ) -> Result<(), RelayError> {
        let tenant_id = self.tenant_id.read().await.clone();

        self.retry_create_tunnel.lock().await.reset();
        loop {
            let session = self.active_session().await?;
            match session
                .create_tunnel(
                    tunnel_id.clone(),
                    local_port,
                    remote_host.clone(),
                    remote_port,
                    tenant_id.clone(),
                    self.config.relay.connect_timeout,
                )
                .await
            {
                Ok(_) => {
                    self.retry_create_tunnel.lock().await.reset();
                    return self
                        .register_and_serve(tunnel_id, local_port, remote_host, remote_port)
                        .await;
                }
                Err(e) if e.retryable() => {
                    let mut counter = self.retry_create_tunnel.lock().await;
                    match counter.next_delay(&self.retry_policy) {
                        Some(delay) => {
                            drop(counter);
                            warn!(error = %e, delay_ms = delay.as_millis(), "create_tunnel failed, retrying");
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn register_and_serve(
        &self,
        tunnel_id: String,
        local_port: u16,
        remote_host: String,
        remote_port: u16,
    ) -> Result<(), RelayError> {
        let (listener, shutdown_rx) = self
            .tunnel_manager
            .register(
                tunnel_id.clone(),
                &self.config.tunnel_bind_address,
                local_port,
                remote_host.clone(),
                remote_port,
            )
            .await?;
        let tenant_id = self.tenant_id.read().await.clone().unwrap_or_default();
        tokio::spawn(proxy::run(
            tunnel_id,
            tenant_id,
            listener,
            remote_host,
            remote_port,
            self.tunnel_manager.clone(),
            self.metrics.clone(),
            shutdown_rx,
        ));
        Ok(())
    }

    /// Start the heartbeat ticker. No-op if already running. Only
    /// meaningful while `Ready`.
    pub async fn start_heartbeat(&self) -> Result<(), RelayError> {
        let session = self.active_session().await?;
        if session.phase().await != Phase::Ready {
            return Err(LocalError::InvalidConfig(
                "start_heartbeat requires the session to be Ready".to_string(),
            )
            .into());
        }
        let mut guard = self.heartbeat.lock().await;
        if guard.is_none() {
            *guard = Some(HeartbeatEngine::new(
                session,
                self.metrics.clone(),
                self.config.heartbeat.interval,
                self.config.heartbeat.response_timeout,
                self.config.heartbeat.max_missed,
            ));
        }
        if let Some(engine) = guard.as_mut() {
            engine.start();
        }
        Ok(())
    }

    /// Idempotent: stops the heartbeat ticker if running.
    pub async fn stop_heartbeat(&self) {
        if let Some(engine) = self.heartbeat.lock().await.as_mut() {
            engine.stop().await;
        }
    }

    /// Idempotent full shutdown: stop heartbeat, unregister all tunnels,
    /// close the transport, and cancel the event-dispatch task.
    pub async fn close(&self) {
        self.stop_heartbeat().await;
        self.tunnel_manager.unregister_all().await;

        let session = self.session.write().await.take();
        if let Some(session) = session {
            session.close().await;
        }
        if let Some(handle) = self.event_task.lock().await.take() {
            handle.abort();
        }
        *self.client_id.write().await = None;
        *self.tenant_id.write().await = None;
    }

    async fn active_session(&self) -> Result<Arc<ControlSession>, RelayError> {
        self.session
            .read()
            .await
            .clone()
            .ok_or_else(|| LocalError::InvalidConfig("not connected".to_string()).into())
    }

    pub async fn is_connected(&self) -> bool {
        match self.session.read().await.as_ref() {
            Some(session) => session.phase().await == Phase::Ready,
            None => false,
        }
    }

    pub async fn client_id(&self) -> Option<String> {
        self.client_id.read().await.clone()
    }

    pub async fn tenant_id(&self) -> Option<String> {
        self.tenant_id.read().await.clone()
    }

    pub fn retry_strategy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn tunnel_manager(&self) -> &Arc<TunnelManager> {
        &self.tunnel_manager
    }
}

/// Best-effort synchronous teardown for callers that drop the facade
/// without awaiting `close()` first. Drop can't await, so this uses
/// `try_lock`/`try_write` rather than the locks `close()` takes; the
/// `ControlSession` and `HeartbeatEngine` drop impls it triggers do their
/// own synchronous shutdown-signal-and-abort regardless.
impl Drop for RelayTunnelClient {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.heartbeat.try_lock() {
            guard.take();
        }
        if let Ok(mut guard) = self.event_task.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
        self.tunnel_manager.unregister_all_sync();
        if let Ok(mut guard) = self.session.try_write() {
            guard.take();
        }
    }
}

/// Drains [`SessionEvent`]s for the lifetime of one `ControlSession`:
/// serves server-initiated tunnel registration (register -> tunnel
/// manager register -> listen), tears the session down on a fatal
/// `ErrorThresholdExceeded`, and logs non-fatal error frames/session close.
async fn run_events(
    mut events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    session: Arc<ControlSession>,
    tunnel_manager: Arc<TunnelManager>,
    heartbeat: Arc<Mutex<Option<HeartbeatEngine>>>,
    metrics: Arc<dyn MetricsSink>,
    bind_address: String,
) {
    while let Some(event) = events_rx.recv().await {
        match event {
            SessionEvent::RegisterTunnel {
                tunnel_id,
                local_port,
                remote_host,
                remote_port,
                tenant_id,
            } => {
                let result = tunnel_manager
                    .register(tunnel_id.clone(), &bind_address, local_port, remote_host.clone(), remote_port)
                    .await;
                match result {
                    Ok((listener, shutdown_rx)) => {
                        tokio::spawn(proxy::run(
                            tunnel_id.clone(),
                            tenant_id.unwrap_or_default(),
                            listener,
                            remote_host,
                            remote_port,
                            tunnel_manager.clone(),
                            metrics.clone(),
                            shutdown_rx,
                        ));
                        let _ = session.reply_tunnel_response(Some(tunnel_id), None).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "server-initiated tunnel registration failed");
                        let _ = session
                            .reply_tunnel_response(Some(tunnel_id), Some(e.to_string()))
                            .await;
                    }
                }
            }
            SessionEvent::ServerError { code, message, threshold_exceeded } => {
                metrics.error(&code, "", "");
                if threshold_exceeded {
                    let err: RelayError =
                        LocalError::ErrorThresholdExceeded(code.clone()).into();
                    warn!(code, message, error = %err, "error threshold exceeded, terminating session");
                    if let Some(mut engine) = heartbeat.lock().await.take() {
                        engine.stop().await;
                    }
                    tunnel_manager.unregister_all().await;
                    session.close().await;
                    return;
                }
                warn!(code, message, "server reported error");
            }
            SessionEvent::Closed(reason) => {
                info!(reason = ?reason, "control session closed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AuthConfig, HeartbeatConfig, LimitsConfig, RelayConfig, RetryConfig, TlsConfig,
    };
    use crate::message::{Message, Status, PROTOCOL_VERSION};
    use crate::metrics::NoopMetrics;
    use crate::transport::{FrameReader, FrameWriter};
    use tokio::net::TcpListener;

    fn test_config(port: u16) -> ClientConfig {
        ClientConfig {
            relay: RelayConfig {
                host: "127.0.0.1".into(),
                port,
                connect_timeout: Duration::from_secs(2),
            },
            tls: TlsConfig {
                enabled: false,
                verify_cert: true,
                ca_cert: None,
                client_cert: None,
                client_key: None,
                server_name: None,
            },
            auth: AuthConfig::Hmac { secret: "s".into() },
            retry: RetryConfig {
                max_retries: 2,
                backoff_multiplier: 2.0,
                max_backoff: Duration::from_millis(50),
                initial_delay: Duration::from_millis(5),
            },
            heartbeat: HeartbeatConfig {
                interval: Duration::from_secs(30),
                response_timeout: Duration::from_secs(2),
                max_missed: 3,
            },
            limits: LimitsConfig::default(),
            tunnel_bind_address: "127.0.0.1".to_string(),
        }
    }

    async fn mock_relay() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn framed(stream: tokio::net::TcpStream) -> (FrameReader, FrameWriter) {
        transport::split(stream, 1024 * 1024, Duration::from_secs(2), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn connect_and_authenticate_happy_path() {
        let (listener, port) = mock_relay().await;
        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let (mut r, mut w) = framed(sock);
            r.read_message().await.unwrap();
            w.write_message(&Message::HelloResponse { version: PROTOCOL_VERSION.to_string() })
                .await
                .unwrap();
            r.read_message().await.unwrap();
            w.write_message(&Message::AuthResponse {
                status: Status::Ok,
                client_id: Some("c-1".into()),
                tenant_id: Some("t-1".into()),
                error: None,
            })
            .await
            .unwrap();
        });

        let client = RelayTunnelClient::new(test_config(port), None, Arc::new(NoopMetrics));
        client.connect().await.unwrap();
        client.authenticate("token".to_string()).await.unwrap();
        assert!(client.is_connected().await);
        assert_eq!(client.client_id().await.as_deref(), Some("c-1"));
        assert_eq!(client.tenant_id().await.as_deref(), Some("t-1"));
        server.await.unwrap();
        client.close().await;
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn connect_twice_is_rejected() {
        let (listener, port) = mock_relay().await;
        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let (mut r, mut w) = framed(sock);
            r.read_message().await.unwrap();
            w.write_message(&Message::HelloResponse { version: PROTOCOL_VERSION.to_string() })
                .await
                .unwrap();
            // Keep the connection open so the test can assert AlreadyConnected.
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let client = RelayTunnelClient::new(test_config(port), None, Arc::new(NoopMetrics));
        client.connect().await.unwrap();
        let err = client.connect().await.unwrap_err();
        assert!(!err.retryable());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn create_tunnel_before_connect_fails_locally() {
        let client = RelayTunnelClient::new(test_config(0), None, Arc::new(NoopMetrics));
        let err = client
            .create_tunnel("t1".into(), 19000, "127.0.0.1".into(), 19001)
            .await
            .unwrap_err();
        assert!(!err.retryable());
    }

    #[tokio::test]
    async fn dropping_the_facade_without_close_frees_the_tunnel_port() {
        let (listener, port) = mock_relay().await;
        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let (mut r, mut w) = framed(sock);
            r.read_message().await.unwrap();
            w.write_message(&Message::HelloResponse { version: PROTOCOL_VERSION.to_string() })
                .await
                .unwrap();
            r.read_message().await.unwrap();
            w.write_message(&Message::AuthResponse {
                status: Status::Ok,
                client_id: Some("c-1".into()),
                tenant_id: None,
                error: None,
            })
            .await
            .unwrap();
            r.read_message().await.unwrap();
            w.write_message(&Message::TunnelResponse {
                status: Status::Ok,
                tunnel_id: Some("t1".into()),
                config: None,
                error: None,
            })
            .await
            .unwrap();
        });

        let client = RelayTunnelClient::new(test_config(port), None, Arc::new(NoopMetrics));
        client.connect().await.unwrap();
        client.authenticate("token".to_string()).await.unwrap();
        let tunnel_manager = client.tunnel_manager().clone();
        client
            .create_tunnel("t1".into(), 19500, "127.0.0.1".into(), 19501)
            .await
            .unwrap();
        server.await.unwrap();
        assert_eq!(tunnel_manager.list().await.len(), 1);

        drop(client);
        // The listener's accept loop only notices the shutdown signal on its
        // next select! iteration, so give it a moment before rebinding.
        tokio::time::sleep(Duration::from_millis(50)).await;
        TcpListener::bind("127.0.0.1:19500")
            .await
            .expect("port must be free once the facade is dropped without close()");
    }

    #[tokio::test]
    async fn error_threshold_tears_down_heartbeat_and_tunnels() {
        let (listener, port) = mock_relay().await;
        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let (mut r, mut w) = framed(sock);
            r.read_message().await.unwrap();
            w.write_message(&Message::HelloResponse { version: PROTOCOL_VERSION.to_string() })
                .await
                .unwrap();
            r.read_message().await.unwrap();
            w.write_message(&Message::AuthResponse {
                status: Status::Ok,
                client_id: Some("c-1".into()),
                tenant_id: None,
                error: None,
            })
            .await
            .unwrap();
            r.read_message().await.unwrap();
            w.write_message(&Message::TunnelResponse {
                status: Status::Ok,
                tunnel_id: Some("t1".into()),
                config: None,
                error: None,
            })
            .await
            .unwrap();

            for _ in 0..3 {
                w.write_message(&Message::Error {
                    code: "rate_limit_exceeded".into(),
                    message: "slow down".into(),
                    details: None,
                })
                .await
                .unwrap();
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let client = RelayTunnelClient::new(test_config(port), None, Arc::new(NoopMetrics));
        client.connect().await.unwrap();
        client.authenticate("token".to_string()).await.unwrap();
        client.start_heartbeat().await.unwrap();
        client
            .create_tunnel("t1".into(), 19600, "127.0.0.1".into(), 19601)
            .await
            .unwrap();
        let tunnel_manager = client.tunnel_manager().clone();

        tokio::time::timeout(Duration::from_secs(1), async {
            while client.is_connected().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session must terminate once the error threshold trips");

        assert!(tunnel_manager.list().await.is_empty());
        TcpListener::bind("127.0.0.1:19600")
            .await
            .expect("tunnel listener must be released once the threshold tears the session down");

        server.await.unwrap();
        client.close().await;
    }
}
