use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use grange_core::{
    CallError, DefaultPolicy, ErrorCode, GrainId, HeartbeatDisposition, InterfaceId,
    MethodOrdinal, RuntimeConfig, Session, SessionMetrics, SessionMetricsSnapshot, SessionState,
    Transport, UserIdentity, Zone, monotonic_micros,
};
use grange_registry::{LocalManifest, ManifestBuilder, RegistryError};
use grange_wire::{
    Disconnect, DisconnectReason, ErrorPayload, HandshakeAck, Heartbeat, Message,
    PROTOCOL_VERSION, Request, Response, ResponseStatus,
};
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::{
    AuthContext, AuthPipeline, Authorizer, Decision, Grain, GrainCatalog, GrainTypeEntry,
    GrainTypeRegistration, InterfaceTable, InvokeJob, PolicyAuthorizer, ServiceContainer,
};

const OUTBOUND_QUEUE: usize = 256;

/// One connected client.
struct PeerSession {
    connection_id: u64,
    transport: Transport,
    session: Arc<Session>,
    outbound: mpsc::Sender<Message>,
    in_flight: Arc<AtomicU32>,
}

struct ServerInner {
    server_id: String,
    config: RuntimeConfig,
    zone: Option<Zone>,
    zone_map: Vec<(Zone, String)>,
    manifest: LocalManifest,
    tables: HashMap<InterfaceId, (Arc<GrainTypeEntry>, Arc<InterfaceTable>)>,
    catalog: GrainCatalog,
    auth: AuthPipeline,
    container: ServiceContainer,
    sessions: RwLock<HashMap<u64, Arc<PeerSession>>>,
    next_connection_id: AtomicU64,
    session_metrics: SessionMetrics,
}

/// Assembles a [`ServerRuntime`]: grain type registrations, zone
/// placement, authorization configuration, and the service container.
pub struct ServerRuntimeBuilder {
    server_id: String,
    config: RuntimeConfig,
    zone: Option<Zone>,
    zone_map: Vec<(Zone, String)>,
    container: ServiceContainer,
    entries: Vec<GrainTypeEntry>,
    filters: Vec<Arc<dyn Authorizer>>,
    evaluator: Option<Arc<dyn Authorizer>>,
}

impl ServerRuntimeBuilder {
    pub fn new(server_id: impl Into<String>, config: RuntimeConfig) -> Self {
        ServerRuntimeBuilder {
            server_id: server_id.into(),
            config,
            zone: None,
            zone_map: Vec::new(),
            container: ServiceContainer::new(),
            entries: Vec::new(),
            filters: Vec::new(),
            evaluator: None,
        }
    }

    /// The zone this server hosts.
    pub fn zone(mut self, zone: Zone) -> Self {
        self.zone = Some(zone);
        self
    }

    /// Adds a cluster zone-ownership entry advertised to clients.
    pub fn zone_map_entry(mut self, zone: Zone, server_id: impl Into<String>) -> Self {
        self.zone_map.push((zone, server_id.into()));
        self
    }

    /// The service container grain factories resolve through.
    pub fn services(mut self, container: ServiceContainer) -> Self {
        self.container = container;
        self
    }

    pub fn register_grain_type<T: Grain>(
        mut self,
        registration: GrainTypeRegistration<T>,
    ) -> Result<Self, RegistryError> {
        self.entries.push(registration.build()?);
        Ok(self)
    }

    /// Prepends an authorization filter; any denial from a filter is
    /// final.
    pub fn add_authorization_filter(mut self, filter: impl Authorizer + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    /// Replaces the default declarative evaluator wholesale.
    pub fn set_authorizer(mut self, authorizer: impl Authorizer + 'static) -> Self {
        self.evaluator = Some(Arc::new(authorizer));
        self
    }

    /// Overrides the authorization knobs from the config.
    pub fn set_policy(
        mut self,
        default_policy: DefaultPolicy,
        enforce_client_accessible: bool,
    ) -> Self {
        self.config.default_policy = default_policy;
        self.config.enforce_client_accessible = enforce_client_accessible;
        self
    }

    pub fn build(self) -> Result<ServerRuntime, RegistryError> {
        let mut manifest_builder = ManifestBuilder::new();
        let mut tables = HashMap::new();

        for entry in self.entries {
            let entry = Arc::new(entry);
            manifest_builder.add_grain_type(entry.grain_type(), entry.properties().clone())?;
            for (interface_id, table) in entry.interfaces() {
                manifest_builder.add_interface(table.descriptor().as_ref().clone())?;
                manifest_builder.bind(interface_id.as_str(), entry.grain_type())?;
                tables.insert(interface_id.clone(), (entry.clone(), table.clone()));
            }
        }

        let mut zone_map = self.zone_map;
        if let Some(zone) = self.zone {
            if !zone_map.iter().any(|(z, _)| *z == zone) {
                zone_map.push((zone, self.server_id.clone()));
            }
        }

        let evaluator = self.evaluator.unwrap_or_else(|| {
            Arc::new(PolicyAuthorizer {
                default_policy: self.config.default_policy,
                enforce_client_accessible: self.config.enforce_client_accessible,
            })
        });

        let inner = Arc::new(ServerInner {
            server_id: self.server_id,
            zone: self.zone,
            zone_map,
            manifest: manifest_builder.build(),
            tables,
            catalog: GrainCatalog::new(),
            auth: AuthPipeline::new(evaluator, self.filters),
            container: self.container,
            sessions: RwLock::new(HashMap::new()),
            next_connection_id: AtomicU64::new(0),
            session_metrics: SessionMetrics::default(),
            config: self.config,
        });

        if let Some(idle) = inner.config.eviction_idle {
            tokio::spawn(eviction_task(Arc::downgrade(&inner), idle));
        }

        Ok(ServerRuntime { inner })
    }
}

/// Server runtime: accepts transports, drives per-client sessions, and
/// dispatches inbound requests through authorization to grain
/// activations.
#[derive(Clone)]
pub struct ServerRuntime {
    inner: Arc<ServerInner>,
}

impl ServerRuntime {
    pub fn builder(server_id: impl Into<String>, config: RuntimeConfig) -> ServerRuntimeBuilder {
        ServerRuntimeBuilder::new(server_id, config)
    }

    pub fn server_id(&self) -> &str {
        &self.inner.server_id
    }

    pub fn manifest(&self) -> &LocalManifest {
        &self.inner.manifest
    }

    pub fn catalog(&self) -> &GrainCatalog {
        &self.inner.catalog
    }

    pub fn auth_metrics(&self) -> grange_core::AuthMetricsSnapshot {
        self.inner.auth.metrics()
    }

    pub fn session_metrics(&self) -> SessionMetricsSnapshot {
        self.inner.session_metrics.snapshot()
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.read().len()
    }

    /// Takes ownership of an established transport and drives its session.
    ///
    /// `principal` is the verified identity the authenticating transport
    /// derived, if any; sessions without one are recorded as anonymous.
    /// Returns the session for observation; its state advances as the
    /// handshake proceeds.
    pub fn accept(&self, transport: Transport, principal: Option<UserIdentity>) -> Arc<Session> {
        let connection_id = self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;
        let session = Arc::new(Session::server());
        tokio::spawn(session_task(
            self.inner.clone(),
            transport,
            session.clone(),
            principal,
            connection_id,
        ));
        session
    }

    /// Gracefully disconnects every session.
    pub async fn shutdown(&self) {
        let ids: Vec<u64> = self.inner.sessions.read().keys().copied().collect();
        for id in ids {
            self.inner
                .close_session(id, Some(DisconnectReason::Graceful))
                .await;
        }
    }
}

impl ServerInner {
    async fn close_session(&self, connection_id: u64, reason: Option<DisconnectReason>) {
        let peer = self.sessions.write().remove(&connection_id);
        let Some(peer) = peer else { return };

        if let Some(reason) = reason {
            let bye = Message::Disconnect(Disconnect {
                reason,
                text: reason.to_string(),
            });
            if let Ok(frame) = bye.encode(self.config.max_frame_bytes) {
                let _ = peer.transport.send(frame).await;
            }
        }
        peer.session.close();
        peer.transport.close();
        tracing::debug!(connection = connection_id, "session closed");
    }

    /// Runs one decoded request through interface resolution,
    /// authorization, and the grain catalog.
    async fn handle_request(&self, peer: &Arc<PeerSession>, req: Request) {
        let one_way = req.is_one_way();
        let interface_id = InterfaceId::new(&req.interface_id);

        let Some((entry, table)) = self.tables.get(&interface_id) else {
            self.respond_failure(
                peer,
                &req,
                ResponseStatus::Error,
                ErrorCode::UnknownInterface,
                format!("no grain implements {}", req.interface_id),
            )
            .await;
            return;
        };

        let ordinal = MethodOrdinal(req.method_ordinal);
        let (Some(handler), Some(policy)) = (table.handler(ordinal), table.policy(ordinal))
        else {
            // An unrecognized ordinal never disturbs the activation.
            self.respond_failure(
                peer,
                &req,
                ResponseStatus::Error,
                ErrorCode::UnknownMethod,
                format!("{} has no method {}", interface_id, ordinal),
            )
            .await;
            return;
        };
        let method = table.descriptor().method_name(ordinal).unwrap_or("?");

        let identity = match peer.session.identity() {
            Some(identity) => identity,
            None => Arc::new(UserIdentity::anonymous(peer.connection_id)),
        };

        let decision = self.auth.authorize(&AuthContext {
            identity: &identity,
            grain_type: entry.grain_type(),
            interface_id: &interface_id,
            method,
            ordinal,
            policy,
        });
        if let Decision::Denied { reason } = decision {
            self.respond_failure(peer, &req, ResponseStatus::Denied, ErrorCode::Denied, reason)
                .await;
            return;
        }

        if peer.in_flight.load(Ordering::Relaxed) >= self.config.max_pending_per_connection {
            self.respond_failure(
                peer,
                &req,
                ResponseStatus::Error,
                ErrorCode::Overloaded,
                "connection has too many requests in flight",
            )
            .await;
            return;
        }

        let grain_id = GrainId::new(&req.grain_type, &req.grain_key);
        let activation = match self.catalog.get_or_activate(&grain_id, entry, &self.container) {
            Ok(activation) => activation,
            Err(e) => {
                tracing::warn!(grain = %grain_id, error = %e, "activation failed");
                self.respond_failure(
                    peer,
                    &req,
                    ResponseStatus::Error,
                    ErrorCode::Internal,
                    e.to_string(),
                )
                .await;
                return;
            }
        };

        peer.in_flight.fetch_add(1, Ordering::Relaxed);
        let respond = {
            let in_flight = peer.in_flight.clone();
            let outbound = peer.outbound.clone();
            let message_id = req.message_id;
            Box::new(move |result: Result<Vec<u8>, CallError>| {
                in_flight.fetch_sub(1, Ordering::Relaxed);
                if one_way {
                    if let Err(e) = result {
                        tracing::debug!(error = %e, "one-way handler failed");
                    }
                    return;
                }
                let response = match result {
                    Ok(payload) => Response {
                        message_id,
                        status: ResponseStatus::Ok,
                        payload,
                    },
                    Err(e) => failure_response(message_id, &e),
                };
                if outbound.try_send(Message::Response(response)).is_err() {
                    tracing::debug!("dropping response for closed or congested session");
                }
            }) as Box<dyn FnOnce(Result<Vec<u8>, CallError>) + Send>
        };

        let job = InvokeJob {
            handler: handler.clone(),
            args: req.args,
            identity,
            respond,
        };
        if let Err(job) = activation.enqueue(job) {
            // The worker is gone (failed activation or eviction race).
            self.catalog.deactivate(&grain_id);
            (job.respond)(Err(CallError::Internal("activation is gone".into())));
        }
    }

    async fn respond_failure(
        &self,
        peer: &Arc<PeerSession>,
        req: &Request,
        status: ResponseStatus,
        code: ErrorCode,
        message: impl Into<String>,
    ) {
        if req.is_one_way() {
            return;
        }
        let response = Message::Response(Response {
            message_id: req.message_id,
            status,
            payload: ErrorPayload::new(code, message).encode(),
        });
        let _ = peer.outbound.send(response).await;
    }
}

fn failure_response(message_id: u128, err: &CallError) -> Response {
    let (status, code) = match err {
        CallError::Denied { .. } => (ResponseStatus::Denied, ErrorCode::Denied),
        CallError::UnknownMethod { .. } => (ResponseStatus::Error, ErrorCode::UnknownMethod),
        CallError::NoProvider(_) => (ResponseStatus::Error, ErrorCode::UnknownInterface),
        CallError::InvalidArgument(_) => (ResponseStatus::Error, ErrorCode::InvalidArgument),
        CallError::Overloaded => (ResponseStatus::Error, ErrorCode::Overloaded),
        _ => (ResponseStatus::Error, ErrorCode::Internal),
    };
    Response {
        message_id,
        status,
        payload: ErrorPayload::new(code, err.to_string()).encode(),
    }
}

/// Sends a farewell frame outside the writer task, during handshake.
async fn refuse(
    inner: &ServerInner,
    transport: &Transport,
    session: &Session,
    reason: DisconnectReason,
    text: String,
) {
    let bye = Message::Disconnect(Disconnect { reason, text });
    if let Ok(frame) = bye.encode(inner.config.max_frame_bytes) {
        let _ = transport.send(frame).await;
    }
    session.close();
    transport.close();
}

async fn session_task(
    inner: Arc<ServerInner>,
    transport: Transport,
    session: Arc<Session>,
    principal: Option<UserIdentity>,
    connection_id: u64,
) {
    // Handshake phase: exactly one Handshake frame, in time, with a
    // version we speak.
    let handshake = match tokio::time::timeout(inner.config.handshake_timeout, transport.recv())
        .await
    {
        Err(_) => {
            tracing::debug!(connection = connection_id, "handshake timed out");
            session.close();
            transport.close();
            return;
        }
        Ok(Err(_)) => {
            session.close();
            return;
        }
        Ok(Ok(datagram)) => match Message::decode(&datagram, inner.config.max_frame_bytes) {
            Ok(Message::Handshake(handshake)) => handshake,
            Ok(other) => {
                tracing::warn!(
                    connection = connection_id,
                    kind = %other.kind(),
                    "expected handshake"
                );
                refuse(
                    &inner,
                    &transport,
                    &session,
                    DisconnectReason::ProtocolError,
                    format!("expected handshake, got {}", other.kind()),
                )
                .await;
                return;
            }
            Err(e) => {
                tracing::warn!(connection = connection_id, error = %e, "undecodable handshake");
                refuse(
                    &inner,
                    &transport,
                    &session,
                    DisconnectReason::ProtocolError,
                    e.to_string(),
                )
                .await;
                return;
            }
        },
    };

    if handshake.protocol_version != PROTOCOL_VERSION {
        tracing::warn!(
            connection = connection_id,
            client = %handshake.client_id,
            version = handshake.protocol_version,
            "refusing unknown protocol version"
        );
        refuse(
            &inner,
            &transport,
            &session,
            DisconnectReason::ProtocolVersionMismatch,
            format!("this server speaks version {}", PROTOCOL_VERSION),
        )
        .await;
        return;
    }

    // Bind the verified principal (or anonymous) for the session's
    // lifetime.
    let identity = Arc::new(match principal {
        Some(principal) => UserIdentity {
            connection_id,
            ..principal
        },
        None => UserIdentity::anonymous(connection_id),
    });
    if session.bind_identity(identity).is_err() {
        tracing::warn!(connection = connection_id, "identity already bound");
    }
    session.set_peer_id(&handshake.client_id);
    session.set_features(handshake.features);
    if let Err(e) = session.transition(SessionState::Ready) {
        tracing::warn!(connection = connection_id, error = %e, "handshake state error");
        session.close();
        transport.close();
        return;
    }

    let ack = Message::HandshakeAck(HandshakeAck {
        server_id: inner.server_id.clone(),
        manifest: inner.manifest.wire(),
        zone: inner.zone,
        zone_map: inner.zone_map.clone(),
    });
    let frame = match ack.encode(inner.config.max_frame_bytes) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!(error = %e, "manifest does not fit in a frame");
            session.close();
            transport.close();
            return;
        }
    };
    if transport.send(frame).await.is_err() {
        session.close();
        return;
    }

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let peer = Arc::new(PeerSession {
        connection_id,
        transport: transport.clone(),
        session: session.clone(),
        outbound: outbound_tx,
        in_flight: Arc::new(AtomicU32::new(0)),
    });
    inner.sessions.write().insert(connection_id, peer.clone());
    tokio::spawn(writer_task(inner.clone(), peer.clone(), outbound_rx));
    tokio::spawn(keeper_task(inner.clone(), peer.clone()));
    tracing::debug!(connection = connection_id, client = %handshake.client_id, "session ready");

    let farewell = loop {
        let datagram = match transport.recv().await {
            Ok(datagram) => datagram,
            Err(_) => break None,
        };
        inner
            .session_metrics
            .frames_received
            .fetch_add(1, Ordering::Relaxed);
        session.mark_seen();

        let msg = match Message::decode(&datagram, inner.config.max_frame_bytes) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(connection = connection_id, error = %e, "terminating session on codec error");
                break Some(DisconnectReason::ProtocolError);
            }
        };

        match msg {
            Message::Request(req) => inner.handle_request(&peer, req).await,
            Message::Heartbeat(hb) => {
                inner
                    .session_metrics
                    .heartbeats_received
                    .fetch_add(1, Ordering::Relaxed);
                if let HeartbeatDisposition::Fresh = session.observe_heartbeat(hb.timestamp_micros)
                {
                    let echo = Message::Heartbeat(Heartbeat {
                        source_id: inner.server_id.clone(),
                        timestamp_micros: hb.timestamp_micros,
                    });
                    let _ = peer.outbound.try_send(echo);
                }
            }
            Message::Disconnect(bye) => {
                tracing::debug!(connection = connection_id, reason = %bye.reason, "client disconnected");
                break None;
            }
            Message::Response(_) => {
                // Legal traffic on a ready session; this server issues no
                // outbound calls, so there is nothing to correlate.
                tracing::debug!(connection = connection_id, "dropping unsolicited response");
            }
            other @ (Message::Handshake(_) | Message::HandshakeAck(_)) => {
                tracing::warn!(
                    connection = connection_id,
                    kind = %other.kind(),
                    "handshake frame on ready session"
                );
                break Some(DisconnectReason::ProtocolError);
            }
        }
    };

    inner.close_session(connection_id, farewell).await;
}

async fn writer_task(
    inner: Arc<ServerInner>,
    peer: Arc<PeerSession>,
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
        if peer.transport.send(frame).await.is_err() {
            break;
        }
        inner
            .session_metrics
            .frames_sent
            .fetch_add(1, Ordering::Relaxed);
    }
}

async fn keeper_task(inner: Arc<ServerInner>, peer: Arc<PeerSession>) {
    let mut ticker = tokio::time::interval(inner.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if peer.session.is_closed() {
            break;
        }
        if peer.session.idle_for() > inner.config.idle_disconnect {
            tracing::warn!(connection = peer.connection_id, "session idle past deadline");
            inner
                .close_session(peer.connection_id, Some(DisconnectReason::IdleTimeout))
                .await;
            break;
        }
        let ts = monotonic_micros();
        peer.session.note_heartbeat_sent(ts);
        let beat = Message::Heartbeat(Heartbeat {
            source_id: inner.server_id.clone(),
            timestamp_micros: ts,
        });
        if peer.outbound.send(beat).await.is_err() {
            break;
        }
        inner
            .session_metrics
            .heartbeats_sent
            .fetch_add(1, Ordering::Relaxed);
    }
}

async fn eviction_task(inner: Weak<ServerInner>, max_idle: std::time::Duration) {
    let period = (max_idle / 2).max(std::time::Duration::from_millis(10));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else { break };
        inner.catalog.evict_idle(max_idle);
    }
}
