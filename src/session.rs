//! Control session: the hello → auth → ready state machine and the
//! single reader task that drives it.
//!
//! The reader task is a `tokio::select!` loop over the framed socket and
//! a shutdown signal, dispatching each inbound frame either to a waiting
//! oneshot slot or to an event for the owning client. Correlation of
//! request/response pairs uses one oneshot slot per outstanding request
//! type, since this protocol issues at most one hello, one auth, and one
//! tunnel_info request at a time — there is no request id on the wire to
//! multiplex on.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ApplicationError, ApplicationErrorCode, ErrorWindow, ProtocolError, RelayError, TransportError};
use crate::message::{ClientInfo, Message, Status, PROTOCOL_VERSION};
use crate::transport::{FrameReader, FrameWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    HelloSent,
    Authenticating,
    Ready,
    Closing,
    Closed,
}

/// Emitted by the reader task for conditions the owner (the client facade)
/// needs to react to outside of a pending request/response call.
#[derive(Debug)]
pub enum SessionEvent {
    ServerError {
        code: String,
        message: String,
        threshold_exceeded: bool,
    },
    /// The relay asked this client to open a tunnel (server-initiated
    /// registration: register -> tunnel manager register -> listen), as
    /// opposed to the client-initiated `create_tunnel` path.
    RegisterTunnel {
        tunnel_id: String,
        local_port: u16,
        remote_host: String,
        remote_port: u16,
        tenant_id: Option<String>,
    },
    Closed(Option<String>),
}

pub struct AuthOutcome {
    pub client_id: Option<String>,
    pub tenant_id: Option<String>,
}

pub struct TunnelOutcome {
    pub tunnel_id: Option<String>,
    pub config: Option<Value>,
}

type Slot = Mutex<Option<oneshot::Sender<Message>>>;

struct Slots {
    hello: Slot,
    auth: Slot,
    tunnel: Slot,
    heartbeat_ack: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

/// Owns the framed connection's write half and the phase, and runs a
/// background task over the read half that dispatches incoming frames.
pub struct ControlSession {
    writer: Arc<Mutex<FrameWriter>>,
    phase: Arc<RwLock<Phase>>,
    slots: Arc<Slots>,
    shutdown: watch::Sender<bool>,
    reader_task: Option<JoinHandle<()>>,
}

impl ControlSession {
    /// Takes ownership of an already-dialed (and, if configured, already
    /// TLS-handshaken) transport and starts the reader task. The session
    /// starts in [`Phase::Connecting`]; callers drive it through
    /// [`ControlSession::hello`] and [`ControlSession::authenticate`].
    pub fn new(
        reader: FrameReader,
        writer: FrameWriter,
        error_window: ErrorWindow,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let writer = Arc::new(Mutex::new(writer));
        let phase = Arc::new(RwLock::new(Phase::Connecting));
        let slots = Arc::new(Slots {
            hello: Mutex::new(None),
            auth: Mutex::new(None),
            tunnel: Mutex::new(None),
            heartbeat_ack: Mutex::new(None),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let reader_task = tokio::spawn(run_reader(
            reader,
            writer.clone(),
            phase.clone(),
            slots.clone(),
            error_window,
            shutdown_rx,
            events_tx,
        ));

        (
            Self {
                writer,
                phase,
                slots,
                shutdown: shutdown_tx,
                reader_task: Some(reader_task),
            },
            events_rx,
        )
    }

    pub async fn phase(&self) -> Phase {
        *self.phase.read().await
    }

    async fn set_phase(&self, phase: Phase) {
        *self.phase.write().await = phase;
    }

    /// Send `hello` and await `hello_response`, validating the protocol
    /// version. Advances `Connecting` -> `HelloSent`.
    pub async fn hello(&self, features: Vec<String>, timeout: Duration) -> Result<(), RelayError> {
        let (tx, rx) = oneshot::channel();
        *self.slots.hello.lock().await = Some(tx);
        self.set_phase(Phase::HelloSent).await;

        self.write(&Message::hello(features)).await?;
        let response = await_slot(rx, timeout).await?;

        match response {
            Message::HelloResponse { version } if version == PROTOCOL_VERSION => Ok(()),
            Message::HelloResponse { version } => {
                Err(ProtocolError::UnsupportedVersion(version).into())
            }
            other => Err(ProtocolError::UnexpectedType {
                expected: "hello_response".into(),
                got: other.type_name().into(),
            }
            .into()),
        }
    }

    /// Send `auth` and await `auth_response`. Advances `HelloSent` ->
    /// `Authenticating` -> `Ready` on success.
    pub async fn authenticate(
        &self,
        token: String,
        client_info: ClientInfo,
        timeout: Duration,
    ) -> Result<AuthOutcome, RelayError> {
        let (tx, rx) = oneshot::channel();
        *self.slots.auth.lock().await = Some(tx);
        self.set_phase(Phase::Authenticating).await;

        self.write(&Message::Auth {
            token,
            version: PROTOCOL_VERSION.to_string(),
            client_info,
        })
        .await?;
        let response = await_slot(rx, timeout).await?;

        match response {
            Message::AuthResponse {
                status: Status::Ok,
                client_id,
                tenant_id,
                ..
            } => {
                self.set_phase(Phase::Ready).await;
                Ok(AuthOutcome { client_id, tenant_id })
            }
            Message::AuthResponse {
                status: Status::Error,
                error,
                ..
            } => Err(ApplicationError::new(
                ApplicationErrorCode::AuthenticationFailed,
                error.unwrap_or_else(|| "authentication rejected".to_string()),
            )
            .into()),
            other => Err(ProtocolError::UnexpectedType {
                expected: "auth_response".into(),
                got: other.type_name().into(),
            }
            .into()),
        }
    }

    /// Send `tunnel_info` and await `tunnel_response`. Only valid in
    /// `Ready`.
    pub async fn create_tunnel(
        &self,
        tunnel_id: String,
        local_port: u16,
        remote_host: String,
        remote_port: u16,
        tenant_id: Option<String>,
        timeout: Duration,
    ) -> Result<TunnelOutcome, RelayError> {
        let (tx, rx) = oneshot::channel();
        *self.slots.tunnel.lock().await = Some(tx);

        self.write(&Message::TunnelInfo {
            tunnel_id,
            local_port,
            remote_host,
            remote_port,
            tenant_id,
        })
        .await?;
        let response = await_slot(rx, timeout).await?;

        match response {
            Message::TunnelResponse {
                status: Status::Ok,
                tunnel_id,
                config,
                ..
            } => Ok(TunnelOutcome { tunnel_id, config }),
            Message::TunnelResponse {
                status: Status::Error,
                error,
                ..
            } => Err(ApplicationError::new(
                ApplicationErrorCode::TunnelCreationFailed,
                error.unwrap_or_else(|| "tunnel creation rejected".to_string()),
            )
            .into()),
            other => Err(ProtocolError::UnexpectedType {
                expected: "tunnel_response".into(),
                got: other.type_name().into(),
            }
            .into()),
        }
    }

    /// Send a client-initiated `heartbeat` and return a channel that
    /// resolves when the matching `heartbeat_response` arrives. Used by
    /// the heartbeat engine, which applies its own timeout.
    pub async fn send_heartbeat(&self) -> Result<mpsc::UnboundedReceiver<Message>, RelayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.slots.heartbeat_ack.lock().await = Some(tx);
        self.write(&Message::heartbeat()).await?;
        Ok(rx)
    }

    /// Reply to a server-initiated `tunnel_info` (see [`SessionEvent::RegisterTunnel`])
    /// with a `tunnel_response`, after the facade has driven the
    /// registration through the tunnel manager and its accept loop.
    pub async fn reply_tunnel_response(
        &self,
        tunnel_id: Option<String>,
        error: Option<String>,
    ) -> Result<(), TransportError> {
        let status = if error.is_none() { Status::Ok } else { Status::Error };
        self.write(&Message::TunnelResponse {
            status,
            tunnel_id,
            config: None,
            error,
        })
        .await
    }

    async fn write(&self, message: &Message) -> Result<(), TransportError> {
        self.writer.lock().await.write_message(message).await
    }

    /// Idempotent shutdown: signal the reader task to stop and mark the
    /// phase closed. Does not wait for in-flight writes.
    pub async fn close(&self) {
        if *self.phase.read().await == Phase::Closed {
            return;
        }
        self.set_phase(Phase::Closing).await;
        let _ = self.shutdown.send(true);
        self.set_phase(Phase::Closed).await;
    }
}

impl Drop for ControlSession {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

async fn await_slot(
    rx: oneshot::Receiver<Message>,
    timeout: Duration,
) -> Result<Message, RelayError> {
    tokio::time::timeout(timeout, rx)
        .await
        .map_err(|_| TransportError::Timeout(timeout))?
        .map_err(|_| TransportError::Closed)
        .map_err(RelayError::from)
}

#[allow(clippy::too_many_arguments)]
async fn run_reader(
    mut reader: FrameReader,
    writer: Arc<Mutex<FrameWriter>>,
    phase: Arc<RwLock<Phase>>,
    slots: Arc<Slots>,
    mut error_window: ErrorWindow,
    mut shutdown_rx: watch::Receiver<bool>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                debug!("control session reader shutting down");
                return;
            }
            result = reader.read_message() => {
                match result {
                    Ok(Some(message)) => {
                        let stop = dispatch(message, &writer, &phase, &slots, &mut error_window, &events_tx).await;
                        if stop {
                            debug!("control session reader stopping after fatal dispatch");
                            return;
                        }
                    }
                    Ok(None) => {
                        let _ = events_tx.send(SessionEvent::Closed(None));
                        return;
                    }
                    Err(e) => {
                        let _ = events_tx.send(SessionEvent::Closed(Some(e.to_string())));
                        return;
                    }
                }
            }
        }
    }
}

/// Dispatches one inbound frame. Returns `true` if the reader loop must
/// stop — currently only when the error-threshold is exceeded, per
/// spec.md §4.2/§8 scenario 5 ("session terminates... no further writes
/// occur").
async fn dispatch(
    message: Message,
    writer: &Arc<Mutex<FrameWriter>>,
    phase: &Arc<RwLock<Phase>>,
    slots: &Arc<Slots>,
    error_window: &mut ErrorWindow,
    events_tx: &mpsc::UnboundedSender<SessionEvent>,
) -> bool {
    match message {
        Message::HelloResponse { .. } => fulfil(&slots.hello, message).await,
        Message::AuthResponse { .. } => fulfil(&slots.auth, message).await,
        Message::TunnelResponse { .. } => fulfil(&slots.tunnel, message).await,
        Message::TunnelInfo {
            tunnel_id,
            local_port,
            remote_host,
            remote_port,
            tenant_id,
        } => {
            // The relay requesting a tunnel is only meaningful once Ready;
            // a Hello/Auth-phase peer sending this would be a protocol
            // violation, but we tolerate and ignore it rather than fail the
            // handshake over an out-of-order server-initiated message.
            if *phase.read().await == Phase::Ready {
                let _ = events_tx.send(SessionEvent::RegisterTunnel {
                    tunnel_id,
                    local_port,
                    remote_host,
                    remote_port,
                    tenant_id,
                });
            }
        }
        Message::HeartbeatResponse { .. } => {
            if let Some(tx) = slots.heartbeat_ack.lock().await.take() {
                let _ = tx.send(message);
            }
        }
        Message::Heartbeat { .. } => {
            // Server-initiated keepalive ping; only answered while Ready.
            if *phase.read().await == Phase::Ready {
                let now = rfc3339_now();
                let reply = Message::heartbeat_response_ok(now);
                let mut w = writer.lock().await;
                if let Err(e) = w.write_message(&reply).await {
                    warn!(error = %e, "failed to answer server heartbeat");
                }
            }
        }
        Message::Error { code, message: msg, .. } => {
            let threshold_exceeded = error_window.record(&code);
            if threshold_exceeded {
                *phase.write().await = Phase::Closing;
            }
            let _ = events_tx.send(SessionEvent::ServerError {
                code,
                message: msg,
                threshold_exceeded,
            });
            return threshold_exceeded;
        }
        Message::Unknown(value) => {
            debug!(?value, "ignoring message with unrecognized or malformed type");
        }
        other => {
            debug!(r#type = other.type_name(), "unexpected message outside handshake, ignoring");
        }
    }
    false
}

async fn fulfil(slot: &Slot, message: Message) {
    if let Some(tx) = slot.lock().await.take() {
        let _ = tx.send(message);
    }
}

/// RFC 3339 timestamp without pulling in `chrono` just for this one field;
/// uses only the system clock plus a fixed-width formatter.
fn rfc3339_now() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let days = secs / 86_400;
    let time_of_day = secs % 86_400;
    let (h, m, s) = (time_of_day / 3600, (time_of_day % 3600) / 60, time_of_day % 60);
    let (y, mo, d) = civil_from_days(days as i64);
    format!("{y:04}-{mo:02}-{d:02}T{h:02}:{m:02}:{s:02}Z")
}

/// Howard Hinnant's days-to-civil-date algorithm (proleptic Gregorian).
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connector = TcpStream::connect(addr);
        let (accepted, connected) = tokio::join!(listener.accept(), connector);
        (accepted.unwrap().0, connected.unwrap())
    }

    fn framed(stream: TcpStream) -> (FrameReader, FrameWriter) {
        crate::transport::split(
            stream,
            1024 * 1024,
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn hello_and_auth_happy_path() {
        let (server_sock, client_sock) = loopback_pair().await;
        let (mut server_r, mut server_w) = framed(server_sock);
        let (client_r, client_w) = framed(client_sock);

        let server = tokio::spawn(async move {
            let hello = server_r.read_message().await.unwrap().unwrap();
            assert!(matches!(hello, Message::Hello { .. }));
            server_w
                .write_message(&Message::HelloResponse {
                    version: PROTOCOL_VERSION.to_string(),
                })
                .await
                .unwrap();

            let auth = server_r.read_message().await.unwrap().unwrap();
            assert!(matches!(auth, Message::Auth { .. }));
            server_w
                .write_message(&Message::AuthResponse {
                    status: Status::Ok,
                    client_id: Some("c-1".into()),
                    tenant_id: Some("t-1".into()),
                    error: None,
                })
                .await
                .unwrap();
        });

        let (session, _events) = ControlSession::new(client_r, client_w, ErrorWindow::new(Duration::from_secs(60), 3));
        session
            .hello(vec!["tls".into()], Duration::from_secs(1))
            .await
            .unwrap();
        let outcome = session
            .authenticate("tok".into(), ClientInfo::default(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome.client_id.as_deref(), Some("c-1"));
        assert_eq!(session.phase().await, Phase::Ready);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn auth_rejection_surfaces_as_application_error() {
        let (server_sock, client_sock) = loopback_pair().await;
        let (mut server_r, mut server_w) = framed(server_sock);
        let (client_r, client_w) = framed(client_sock);

        let server = tokio::spawn(async move {
            server_r.read_message().await.unwrap();
            server_w
                .write_message(&Message::HelloResponse {
                    version: PROTOCOL_VERSION.to_string(),
                })
                .await
                .unwrap();
            server_r.read_message().await.unwrap();
            server_w
                .write_message(&Message::AuthResponse {
                    status: Status::Error,
                    client_id: None,
                    tenant_id: None,
                    error: Some("bad token".into()),
                })
                .await
                .unwrap();
        });

        let (session, _events) = ControlSession::new(client_r, client_w, ErrorWindow::new(Duration::from_secs(60), 3));
        session
            .hello(vec![], Duration::from_secs(1))
            .await
            .unwrap();
        let err = session
            .authenticate("tok".into(), ClientInfo::default(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(!err.retryable());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn server_heartbeat_ping_is_answered_automatically() {
        let (server_sock, client_sock) = loopback_pair().await;
        let (mut server_r, mut server_w) = framed(server_sock);
        let (client_r, client_w) = framed(client_sock);

        let (session, _events) = ControlSession::new(client_r, client_w, ErrorWindow::new(Duration::from_secs(60), 3));

        let server = tokio::spawn(async move {
            server_r.read_message().await.unwrap();
            server_w
                .write_message(&Message::HelloResponse { version: PROTOCOL_VERSION.to_string() })
                .await
                .unwrap();
            server_r.read_message().await.unwrap();
            server_w
                .write_message(&Message::AuthResponse {
                    status: Status::Ok,
                    client_id: Some("c".into()),
                    tenant_id: None,
                    error: None,
                })
                .await
                .unwrap();
            server_w.write_message(&Message::heartbeat()).await.unwrap();
            let reply = server_r.read_message().await.unwrap().unwrap();
            assert!(matches!(reply, Message::HeartbeatResponse { .. }));
        });

        session.hello(vec![], Duration::from_secs(1)).await.unwrap();
        session
            .authenticate("tok".into(), ClientInfo::default(), Duration::from_secs(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn error_threshold_moves_phase_to_closing() {
        let (server_sock, client_sock) = loopback_pair().await;
        let (mut server_r, mut server_w) = framed(server_sock);
        let (client_r, client_w) = framed(client_sock);

        let (session, mut events) =
            ControlSession::new(client_r, client_w, ErrorWindow::new(Duration::from_secs(60), 2));

        let server = tokio::spawn(async move {
            server_r.read_message().await.unwrap();
            server_w
                .write_message(&Message::HelloResponse { version: PROTOCOL_VERSION.to_string() })
                .await
                .unwrap();
            for _ in 0..2 {
                server_w
                    .write_message(&Message::Error {
                        code: "rate_limit_exceeded".into(),
                        message: "slow down".into(),
                        details: None,
                    })
                    .await
                    .unwrap();
            }
        });

        session.hello(vec![], Duration::from_secs(1)).await.unwrap();
        let mut saw_threshold = false;
        for _ in 0..2 {
            if let Some(SessionEvent::ServerError { threshold_exceeded, .. }) = events.recv().await {
                saw_threshold |= threshold_exceeded;
            }
        }
        assert!(saw_threshold);
        assert_eq!(session.phase().await, Phase::Closing);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn server_initiated_tunnel_info_emits_register_event() {
        let (server_sock, client_sock) = loopback_pair().await;
        let (mut server_r, mut server_w) = framed(server_sock);
        let (client_r, client_w) = framed(client_sock);

        let (session, mut events) =
            ControlSession::new(client_r, client_w, ErrorWindow::new(Duration::from_secs(60), 3));

        let server = tokio::spawn(async move {
            server_r.read_message().await.unwrap();
            server_w
                .write_message(&Message::HelloResponse { version: PROTOCOL_VERSION.to_string() })
                .await
                .unwrap();
            server_r.read_message().await.unwrap();
            server_w
                .write_message(&Message::AuthResponse {
                    status: Status::Ok,
                    client_id: Some("c".into()),
                    tenant_id: None,
                    error: None,
                })
                .await
                .unwrap();
            server_w
                .write_message(&Message::TunnelInfo {
                    tunnel_id: "srv-t1".into(),
                    local_port: 16000,
                    remote_host: "127.0.0.1".into(),
                    remote_port: 17000,
                    tenant_id: None,
                })
                .await
                .unwrap();
            let reply = server_r.read_message().await.unwrap().unwrap();
            assert!(matches!(reply, Message::TunnelResponse { .. }));
        });

        session.hello(vec![], Duration::from_secs(1)).await.unwrap();
        session
            .authenticate("tok".into(), ClientInfo::default(), Duration::from_secs(1))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            SessionEvent::RegisterTunnel { tunnel_id, local_port, .. } => {
                assert_eq!(tunnel_id, "srv-t1");
                assert_eq!(local_port, 16000);
            }
            other => panic!("expected RegisterTunnel, got {other:?}"),
        }
        session.reply_tunnel_response(Some("srv-t1".into()), None).await.unwrap();
        server.await.unwrap();
    }
}
