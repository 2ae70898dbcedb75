use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;

use grange_core::{
    CallError, DispatchMetrics, DispatchMetricsSnapshot, ErrorCode, GrainId, HeartbeatDisposition,
    InterfaceId, MessageId, MessageIdAllocator, ProtocolError, RuntimeConfig, Session,
    SessionMetrics, SessionMetricsSnapshot, SessionState, Transport, monotonic_micros,
};
use grange_registry::RemoteDirectory;
use grange_wire::{
    Disconnect, DisconnectReason, ErrorPayload, Handshake, Heartbeat, Message, PROTOCOL_VERSION,
    Request, RequestFlags, Response, ResponseStatus,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};

use crate::pending::{PendingEntry, PendingMap};

const OUTBOUND_QUEUE: usize = 256;

/// One live link to a server.
struct Connection {
    server_id: String,
    transport: Transport,
    session: Arc<Session>,
    outbound: mpsc::Sender<Message>,
}

pub(crate) struct ClientInner {
    client_id: String,
    config: RuntimeConfig,
    features: Mutex<BTreeSet<String>>,
    directory: RemoteDirectory,
    pending: PendingMap,
    allocator: MessageIdAllocator,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    metrics: DispatchMetrics,
    session_metrics: SessionMetrics,
    closed: AtomicBool,
}

/// Client runtime: owns per-server sessions and the dispatch engine.
///
/// Cloning is cheap; all clones share the same sessions, pending map, and
/// manifest directory. Must be created inside a tokio runtime (the
/// timeout sweeper is spawned at construction).
#[derive(Clone)]
pub struct GrainClient {
    inner: Arc<ClientInner>,
}

impl GrainClient {
    pub fn new(client_id: impl Into<String>, config: RuntimeConfig) -> Self {
        let inner = Arc::new(ClientInner {
            client_id: client_id.into(),
            config,
            features: Mutex::new(BTreeSet::new()),
            directory: RemoteDirectory::new(),
            pending: PendingMap::new(),
            allocator: MessageIdAllocator::new(),
            connections: RwLock::new(HashMap::new()),
            metrics: DispatchMetrics::default(),
            session_metrics: SessionMetrics::default(),
            closed: AtomicBool::new(false),
        });
        tokio::spawn(sweeper_task(inner.clone()));
        GrainClient { inner }
    }

    /// Adds a feature string advertised in subsequent handshakes.
    pub fn advertise_feature(&self, feature: impl Into<String>) {
        self.inner.features.lock().insert(feature.into());
    }

    /// Performs the handshake over an established transport and registers
    /// the resulting session. Returns the server's id.
    pub async fn connect(&self, transport: Transport) -> Result<String, CallError> {
        self.inner.clone().connect(transport).await
    }

    /// Gracefully closes the session to one server. Outstanding requests
    /// routed there fail with `ConnectionLost`.
    pub async fn disconnect(&self, server_id: &str) {
        let conn = self.inner.connections.read().get(server_id).cloned();
        if let Some(conn) = conn {
            self.inner
                .teardown_connection(
                    &conn,
                    CallError::ConnectionLost,
                    Some(DisconnectReason::Graceful),
                )
                .await;
        }
    }

    /// Tears down every session and stops the background sweeper.
    pub async fn shutdown(&self) {
        let conns: Vec<Arc<Connection>> =
            self.inner.connections.read().values().cloned().collect();
        for conn in conns {
            self.inner
                .teardown_connection(
                    &conn,
                    CallError::ConnectionLost,
                    Some(DisconnectReason::Graceful),
                )
                .await;
        }
        self.inner.closed.store(true, Ordering::Release);
        self.inner.pending.sweep_notify.notify_waiters();
    }

    /// Starts an invocation and returns a handle that resolves to the
    /// response. Dropping the handle cancels the call locally.
    pub async fn begin_invoke(
        &self,
        grain: &GrainId,
        interface: &InterfaceId,
        method: &str,
        args: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<InFlight, CallError> {
        self.inner
            .clone()
            .begin_invoke(grain, interface, method, args, timeout)
            .await
    }

    /// Invokes a grain method and awaits the raw result blob.
    pub async fn invoke_raw(
        &self,
        grain: &GrainId,
        interface: &InterfaceId,
        method: &str,
        args: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, CallError> {
        self.begin_invoke(grain, interface, method, args, timeout)
            .await?
            .await
    }

    /// Fire-and-forget invocation: no pending entry, no response.
    pub async fn invoke_one_way(
        &self,
        grain: &GrainId,
        interface: &InterfaceId,
        method: &str,
        args: Vec<u8>,
    ) -> Result<(), CallError> {
        self.inner.invoke_one_way(grain, interface, method, args).await
    }

    /// Cancels a pending invocation locally. No wire message is sent; the
    /// server discovers orphanage by its response being dropped.
    pub fn cancel(&self, id: MessageId) -> bool {
        match self.inner.pending.remove(id) {
            Some(entry) => {
                let _ = entry.tx.send(Err(CallError::Canceled));
                self.inner.metrics.cancellations.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn directory(&self) -> &RemoteDirectory {
        &self.inner.directory
    }

    pub fn session(&self, server_id: &str) -> Option<Arc<Session>> {
        self.inner
            .connections
            .read()
            .get(server_id)
            .map(|c| c.session.clone())
    }

    pub fn pending_for(&self, server_id: &str) -> u32 {
        self.inner.pending.count_for(server_id)
    }

    pub fn pending_total(&self) -> usize {
        self.inner.pending.total()
    }

    pub fn metrics(&self) -> DispatchMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn session_metrics(&self) -> SessionMetricsSnapshot {
        self.inner.session_metrics.snapshot()
    }
}

impl ClientInner {
    async fn connect(self: Arc<Self>, transport: Transport) -> Result<String, CallError> {
        let session = Arc::new(Session::client());

        let handshake = Message::Handshake(Handshake {
            client_id: self.client_id.clone(),
            protocol_version: PROTOCOL_VERSION,
            features: self.features.lock().clone(),
        });
        let frame = handshake.encode(self.config.max_frame_bytes)?;
        transport
            .send(frame)
            .await
            .map_err(|_| CallError::ConnectionLost)?;
        session
            .transition(SessionState::WaitingAck)
            .map_err(|e| CallError::Internal(e.to_string()))?;

        let ack = loop {
            let datagram =
                match tokio::time::timeout(self.config.handshake_timeout, transport.recv()).await {
                    Err(_) => {
                        session.close();
                        transport.close();
                        return Err(CallError::Timeout);
                    }
                    Ok(Err(_)) => {
                        session.close();
                        return Err(CallError::ConnectionLost);
                    }
                    Ok(Ok(d)) => d,
                };
            match Message::decode(&datagram, self.config.max_frame_bytes) {
                Ok(Message::HandshakeAck(ack)) => break ack,
                Ok(Message::Disconnect(bye)) => {
                    tracing::warn!(reason = %bye.reason, text = %bye.text, "server refused handshake");
                    session.close();
                    return Err(match bye.reason {
                        DisconnectReason::AuthFailure => CallError::Denied { reason: bye.text },
                        DisconnectReason::ProtocolVersionMismatch => {
                            CallError::Protocol(ProtocolError::VersionMismatch {
                                peer: PROTOCOL_VERSION,
                            })
                        }
                        _ => CallError::ConnectionLost,
                    });
                }
                Ok(other) => {
                    session.close();
                    transport.close();
                    return Err(CallError::Protocol(ProtocolError::Malformed(format!(
                        "unexpected {} frame before handshake completed",
                        other.kind()
                    ))));
                }
                Err(e) => {
                    session.close();
                    transport.close();
                    return Err(CallError::Protocol(e));
                }
            }
        };

        let server_id = ack.server_id.clone();

        // A reconnect replaces any previous session to the same server.
        let stale = self.connections.read().get(&server_id).cloned();
        if let Some(stale) = stale {
            self.teardown_connection(&stale, CallError::ConnectionLost, None)
                .await;
        }

        self.directory
            .apply_handshake(&server_id, &ack)
            .map_err(|e| {
                session.close();
                CallError::Protocol(ProtocolError::Malformed(e.to_string()))
            })?;

        session.set_peer_id(&server_id);
        session.set_zone(ack.zone);
        session
            .transition(SessionState::Ready)
            .map_err(|e| CallError::Internal(e.to_string()))?;

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let conn = Arc::new(Connection {
            server_id: server_id.clone(),
            transport,
            session,
            outbound: outbound_tx,
        });

        self.connections
            .write()
            .insert(server_id.clone(), conn.clone());

        tokio::spawn(writer_task(self.clone(), conn.clone(), outbound_rx));
        tokio::spawn(reader_task(self.clone(), conn.clone()));
        tokio::spawn(keeper_task(self.clone(), conn));

        tracing::debug!(server = %server_id, "session ready");
        Ok(server_id)
    }

    async fn begin_invoke(
        self: Arc<Self>,
        grain: &GrainId,
        interface: &InterfaceId,
        method: &str,
        args: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<InFlight, CallError> {
        let (ordinal, server_id) = self.route(grain, interface, method)?;
        let conn = self
            .connections
            .read()
            .get(&server_id)
            .cloned()
            .ok_or_else(|| CallError::NoProvider(interface.to_string()))?;

        let timeout = timeout.unwrap_or(self.config.request_timeout_default);
        let id = self.allocator.next();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingEntry {
                deadline: Instant::now() + timeout,
                server_id: server_id.clone(),
                interface: interface.to_string(),
                method: method.to_string(),
                tx,
            },
            self.config.max_pending_per_connection,
        )?;

        let request = Message::Request(Request {
            message_id: id.0,
            grain_type: grain.grain_type().to_string(),
            grain_key: grain.key().to_string(),
            interface_id: interface.to_string(),
            method_ordinal: ordinal.0,
            args,
            timeout_ms: timeout.as_millis().min(u32::MAX as u128) as u32,
            flags: 0,
        });
        if conn.outbound.send(request).await.is_err() {
            self.pending.remove(id);
            return Err(CallError::ConnectionLost);
        }
        self.metrics.requests_sent.fetch_add(1, Ordering::Relaxed);

        Ok(InFlight {
            id,
            rx,
            inner: self,
            finished: false,
        })
    }

    async fn invoke_one_way(
        &self,
        grain: &GrainId,
        interface: &InterfaceId,
        method: &str,
        args: Vec<u8>,
    ) -> Result<(), CallError> {
        let (ordinal, server_id) = self.route(grain, interface, method)?;
        let conn = self
            .connections
            .read()
            .get(&server_id)
            .cloned()
            .ok_or_else(|| CallError::NoProvider(interface.to_string()))?;

        let request = Message::Request(Request {
            message_id: self.allocator.next().0,
            grain_type: grain.grain_type().to_string(),
            grain_key: grain.key().to_string(),
            interface_id: interface.to_string(),
            method_ordinal: ordinal.0,
            args,
            timeout_ms: 0,
            flags: RequestFlags::ONE_WAY.bits(),
        });
        conn.outbound
            .send(request)
            .await
            .map_err(|_| CallError::ConnectionLost)?;
        self.metrics.requests_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Resolves the method ordinal and picks the target server: the zone
    /// route when the key encodes one and the owner is connected, the sole
    /// provider when unambiguous, round-robin otherwise.
    fn route(
        &self,
        grain: &GrainId,
        interface: &InterfaceId,
        method: &str,
    ) -> Result<(grange_core::MethodOrdinal, String), CallError> {
        let descriptor = self
            .directory
            .descriptor(interface)
            .ok_or_else(|| CallError::NoProvider(interface.to_string()))?;
        let ordinal = descriptor.ordinal_of(method).ok_or_else(|| {
            CallError::UnknownMethod {
                interface: interface.to_string(),
                method: method.to_string(),
            }
        })?;

        if let Some(zone) = grain.zone() {
            if let Some(server) = self.directory.server_for_zone(zone) {
                if self.connections.read().contains_key(&server) {
                    return Ok((ordinal, server));
                }
            }
        }

        let server = self
            .directory
            .select_provider(interface)
            .filter(|s| self.connections.read().contains_key(s))
            .ok_or_else(|| CallError::NoProvider(interface.to_string()))?;
        Ok((ordinal, server))
    }

    fn handle_response(&self, response: Response) {
        let id = MessageId(response.message_id);
        let Some(entry) = self.pending.remove(id) else {
            tracing::debug!(message_id = %id, "dropping late response");
            self.metrics
                .late_responses_dropped
                .fetch_add(1, Ordering::Relaxed);
            return;
        };

        let result = match response.status {
            ResponseStatus::Ok => Ok(response.payload),
            ResponseStatus::Timeout => Err(CallError::Timeout),
            ResponseStatus::Denied => {
                let payload = ErrorPayload::decode(&response.payload);
                Err(CallError::Denied {
                    reason: payload.message,
                })
            }
            ResponseStatus::Error => {
                let payload = ErrorPayload::decode(&response.payload);
                Err(match payload.code {
                    ErrorCode::UnknownInterface => CallError::NoProvider(entry.interface.clone()),
                    ErrorCode::UnknownMethod => CallError::UnknownMethod {
                        interface: entry.interface.clone(),
                        method: entry.method.clone(),
                    },
                    ErrorCode::InvalidArgument => CallError::InvalidArgument(payload.message),
                    ErrorCode::Internal => CallError::Internal(payload.message),
                    ErrorCode::Denied => CallError::Denied {
                        reason: payload.message,
                    },
                    ErrorCode::Overloaded => CallError::Overloaded,
                })
            }
        };

        if result.is_ok() {
            self.metrics
                .responses_matched
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.failures.fetch_add(1, Ordering::Relaxed);
        }
        let _ = entry.tx.send(result);
    }

    /// Removes a connection, failing its pendings before the session state
    /// becomes closed, optionally emitting a farewell frame, and purging
    /// the server's manifest contributions. Only the caller that wins the
    /// map removal does the work, and a stale handle from before a
    /// reconnect never tears down its replacement.
    async fn teardown_connection(
        &self,
        conn: &Arc<Connection>,
        err: CallError,
        bye: Option<DisconnectReason>,
    ) {
        let server_id = conn.server_id.as_str();
        {
            let mut connections = self.connections.write();
            match connections.get(server_id) {
                Some(current) if Arc::ptr_eq(current, conn) => {
                    connections.remove(server_id);
                }
                _ => return,
            }
        }

        let failed = self.pending.fail_server(server_id, err);
        if failed > 0 {
            tracing::debug!(server = %server_id, failed, "failed outstanding requests");
        }

        if let Some(reason) = bye {
            let farewell = Message::Disconnect(Disconnect {
                reason,
                text: String::new(),
            });
            if let Ok(frame) = farewell.encode(self.config.max_frame_bytes) {
                let _ = conn.transport.send(frame).await;
            }
        }

        conn.session.close();
        conn.transport.close();
        self.directory.purge_server(server_id);
        tracing::debug!(server = %server_id, "session closed");
    }
}

/// A pending invocation. Await it for the result; drop it to cancel
/// locally without observing the outcome.
pub struct InFlight {
    id: MessageId,
    rx: oneshot::Receiver<Result<Vec<u8>, CallError>>,
    inner: Arc<ClientInner>,
    finished: bool,
}

impl InFlight {
    /// The correlation id, usable with [`GrainClient::cancel`].
    pub fn message_id(&self) -> MessageId {
        self.id
    }
}

impl std::fmt::Debug for InFlight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlight")
            .field("message_id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Future for InFlight {
    type Output = Result<Vec<u8>, CallError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => {
                this.finished = true;
                Poll::Ready(result)
            }
            Poll::Ready(Err(_)) => {
                this.finished = true;
                Poll::Ready(Err(CallError::Canceled))
            }
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.finished && self.inner.pending.remove(self.id).is_some() {
            self.inner
                .metrics
                .cancellations
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn writer_task(
    inner: Arc<ClientInner>,
    conn: Arc<Connection>,
    mut outbound: mpsc::Receiver<Message>,
) {
    while let Some(msg) = outbound.recv().await {
        let frame = match msg.encode(inner.config.max_frame_bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "dropping unencodable outbound frame");
                continue;
            }
        };
        if conn.transport.send(frame).await.is_err() {
            break;
        }
        inner
            .session_metrics
            .frames_sent
            .fetch_add(1, Ordering::Relaxed);
    }
}

async fn reader_task(inner: Arc<ClientInner>, conn: Arc<Connection>) {
    let failure = loop {
        let datagram = match conn.transport.recv().await {
            Ok(d) => d,
            Err(_) => break CallError::ConnectionLost,
        };
        inner
            .session_metrics
            .frames_received
            .fetch_add(1, Ordering::Relaxed);
        conn.session.mark_seen();

        let msg = match Message::decode(&datagram, inner.config.max_frame_bytes) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(server = %conn.server_id, error = %e, "terminating session on codec error");
                break CallError::Protocol(e);
            }
        };

        match msg {
            Message::Response(response) => inner.handle_response(response),
            Message::Heartbeat(hb) => {
                inner
                    .session_metrics
                    .heartbeats_received
                    .fetch_add(1, Ordering::Relaxed);
                if let HeartbeatDisposition::Fresh =
                    conn.session.observe_heartbeat(hb.timestamp_micros)
                {
                    let echo = Message::Heartbeat(Heartbeat {
                        source_id: inner.client_id.clone(),
                        timestamp_micros: hb.timestamp_micros,
                    });
                    let _ = conn.outbound.try_send(echo);
                }
            }
            Message::Disconnect(bye) => {
                tracing::debug!(server = %conn.server_id, reason = %bye.reason, "server disconnected");
                break CallError::ConnectionLost;
            }
            Message::Request(req) => {
                // This runtime does not serve server-to-client calls, but a
                // request frame is legal traffic on a ready session.
                tracing::warn!(
                    server = %conn.server_id,
                    interface = %req.interface_id,
                    "dropping inbound request on client session"
                );
            }
            other @ (Message::Handshake(_) | Message::HandshakeAck(_)) => {
                break CallError::Protocol(ProtocolError::Malformed(format!(
                    "unexpected {} frame on ready session",
                    other.kind()
                )));
            }
        }
    };

    inner.teardown_connection(&conn, failure, None).await;
}

/// Emits heartbeats and enforces the idle deadline for one session.
async fn keeper_task(inner: Arc<ClientInner>, conn: Arc<Connection>) {
    let mut ticker = tokio::time::interval(inner.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if conn.session.is_closed() {
            break;
        }
        if conn.session.idle_for() > inner.config.idle_disconnect {
            tracing::warn!(server = %conn.server_id, "session idle past deadline");
            inner
                .teardown_connection(
                    &conn,
                    CallError::ConnectionLost,
                    Some(DisconnectReason::IdleTimeout),
                )
                .await;
            break;
        }
        let ts = monotonic_micros();
        conn.session.note_heartbeat_sent(ts);
        let beat = Message::Heartbeat(Heartbeat {
            source_id: inner.client_id.clone(),
            timestamp_micros: ts,
        });
        if conn.outbound.send(beat).await.is_err() {
            break;
        }
        inner
            .session_metrics
            .heartbeats_sent
            .fetch_add(1, Ordering::Relaxed);
    }
}

/// Expires pending deadlines. Sleeps until the earliest deadline and is
/// woken early whenever an insert may have produced a new earliest, so the
/// effective resolution is never worse than half the smallest timeout.
async fn sweeper_task(inner: Arc<ClientInner>) {
    loop {
        if inner.closed.load(Ordering::Acquire) {
            break;
        }
        let notified = inner.pending.sweep_notify.notified();
        let mut notified = std::pin::pin!(notified);
        notified.as_mut().enable();

        match inner.pending.next_deadline() {
            None => notified.await,
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        let expired = inner.pending.expire(Instant::now());
                        if expired > 0 {
                            inner.metrics.timeouts.fetch_add(expired as u64, Ordering::Relaxed);
                        }
                    }
                    _ = notified => {}
                }
            }
        }
    }
}
