//! End-to-end scenarios over loopback transports: happy path, zone
//! routing, authorization, timeouts with late responses, and connection
//! loss.

use std::sync::Arc;
use std::time::Duration;

use grange_client::{GrainClient, GrainInterface};
use grange_core::{
    CallError, GrainId, InterfaceId, MethodOrdinal, Role, RuntimeConfig, Transport, UserIdentity,
    Zone, current_identity,
};
use grange_server::{Grain, GrainTypeRegistration, PolicyRule, ServerRuntime};
use grange_testkit::{FaultInjector, connect_loopback, linked_pair};
use grange_wire::{
    DisconnectReason, Handshake, Message, PROTOCOL_VERSION, encode_value,
};

struct EchoGrain;
impl Grain for EchoGrain {}

struct PingApi;
impl GrainInterface for PingApi {
    const INTERFACE_ID: &'static str = "I.Ping";
    const GRAIN_TYPE: &'static str = "Echo";
    const METHODS: &'static [&'static str] = &["ping", "pong"];
}

fn echo_server(server_id: &str, config: RuntimeConfig) -> ServerRuntime {
    let mut reg =
        GrainTypeRegistration::<EchoGrain>::new("Echo", |_, _| Ok(Arc::new(EchoGrain)));
    reg.interface("I.Ping")
        .method("ping", |_g, (s,): (String,)| async move {
            Ok((s.to_uppercase(),))
        })
        .method("pong", |_g, (s,): (String,)| async move { Ok((s,)) });
    ServerRuntime::builder(server_id, config)
        .register_grain_type(reg)
        .unwrap()
        .build()
        .unwrap()
}

struct SlowGrain;
impl Grain for SlowGrain {}

fn slow_server(server_id: &str, delay: Duration, config: RuntimeConfig) -> ServerRuntime {
    let mut reg =
        GrainTypeRegistration::<SlowGrain>::new("Slow", |_, _| Ok(Arc::new(SlowGrain)));
    reg.interface("I.Slow")
        .method("fast", |_g, (): ()| async move { Ok(("quick".to_string(),)) })
        .method("wait", move |_g, (): ()| async move {
            tokio::time::sleep(delay).await;
            Ok(("done".to_string(),))
        });
    ServerRuntime::builder(server_id, config)
        .register_grain_type(reg)
        .unwrap()
        .build()
        .unwrap()
}

#[tokio::test]
async fn happy_path_ping_uppercases() {
    let server = echo_server("server-a", RuntimeConfig::new());
    let client = GrainClient::new("client-1", RuntimeConfig::new());
    let server_id = connect_loopback(&server, &client, None).await.unwrap();
    assert_eq!(server_id, "server-a");

    // The manifest advertises ping at ordinal 0, and the local typed
    // binding agrees with it.
    let interface = InterfaceId::new("I.Ping");
    assert_eq!(
        client.directory().ordinal(&interface, "ping"),
        Some(MethodOrdinal(0))
    );
    assert_eq!(
        PingApi::descriptor().unwrap().ordinal_of("ping"),
        Some(MethodOrdinal(0))
    );

    let proxy = client.get_grain::<PingApi>("alice");
    let (reply,): (String,) = proxy.call("ping", &("hi".to_string(),)).await.unwrap();
    assert_eq!(reply, "HI");
    assert_eq!(client.pending_total(), 0);
    assert_eq!(client.metrics().responses_matched, 1);
}

#[tokio::test]
async fn zone_routing_picks_the_owning_server() {
    struct TagGrain {
        tag: String,
    }
    impl Grain for TagGrain {}

    fn zone_server(server_id: &str, zone: Zone, other: (Zone, &str)) -> ServerRuntime {
        let tag = server_id.to_string();
        let mut reg = GrainTypeRegistration::<TagGrain>::new("Region", move |_, _| {
            Ok(Arc::new(TagGrain { tag: tag.clone() }))
        });
        reg.interface("I.Region")
            .method("where_am_i", |g: Arc<TagGrain>, (): ()| {
                let tag = g.tag.clone();
                async move { Ok((tag,)) }
            });
        ServerRuntime::builder(server_id, RuntimeConfig::new())
            .zone(zone)
            .zone_map_entry(other.0, other.1)
            .register_grain_type(reg)
            .unwrap()
            .build()
            .unwrap()
    }

    let a = zone_server("server-a", Zone::new(0, 0), (Zone::new(1, 0), "server-b"));
    let b = zone_server("server-b", Zone::new(1, 0), (Zone::new(0, 0), "server-a"));
    let client = GrainClient::new("client-1", RuntimeConfig::new());
    connect_loopback(&a, &client, None).await.unwrap();
    connect_loopback(&b, &client, None).await.unwrap();

    let interface = InterfaceId::new("I.Region");

    // The key encodes zone (1,0), so the request must travel to B.
    let grain = GrainId::new("Region", "shard@1,0");
    let reply = client
        .invoke_raw(&grain, &interface, "where_am_i", encode_value(&()).unwrap(), None)
        .await
        .unwrap();
    let (tag,): (String,) = grange_wire::decode_value(&reply).unwrap();
    assert_eq!(tag, "server-b");
    assert_eq!(b.catalog().activation_count(), 1);
    assert_eq!(a.catalog().activation_count(), 0);

    // And the other zone routes to A.
    let grain = GrainId::new("Region", "shard@0,0");
    let reply = client
        .invoke_raw(&grain, &interface, "where_am_i", encode_value(&()).unwrap(), None)
        .await
        .unwrap();
    let (tag,): (String,) = grange_wire::decode_value(&reply).unwrap();
    assert_eq!(tag, "server-a");
    assert_eq!(a.catalog().activation_count(), 1);
}

#[tokio::test]
async fn authorization_denial_names_the_missing_role() {
    struct AdminGrain;
    impl Grain for AdminGrain {}

    let mut reg =
        GrainTypeRegistration::<AdminGrain>::new("Admin", |_, _| Ok(Arc::new(AdminGrain)));
    reg.interface("I.Admin")
        .method("backup", |_g, (): ()| async move { Ok(()) })
        .method("restart", |_g, (): ()| async move { Ok(()) })
        .method_with_policy(
            "shutdown",
            &[PolicyRule::RequireRole(Role::Admin)],
            |_g, (): ()| async move { Ok(()) },
        );
    let server = ServerRuntime::builder("server-a", RuntimeConfig::new())
        .register_grain_type(reg)
        .unwrap()
        .build()
        .unwrap();

    let client = GrainClient::new("client-1", RuntimeConfig::new());
    let principal = UserIdentity::new("u-42", "mallory", Role::User, 0);
    connect_loopback(&server, &client, Some(principal))
        .await
        .unwrap();

    let interface = InterfaceId::new("I.Admin");
    // shutdown sits at ordinal 2 behind backup and restart.
    assert_eq!(
        client.directory().ordinal(&interface, "shutdown"),
        Some(MethodOrdinal(2))
    );

    let grain = GrainId::new("Admin", "main");
    let err = client
        .invoke_raw(&grain, &interface, "shutdown", encode_value(&()).unwrap(), None)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CallError::Denied {
            reason: "role below Admin".to_string()
        }
    );

    // Denial happened before any activation was created.
    assert_eq!(server.catalog().activation_count(), 0);
    assert_eq!(server.auth_metrics().denied, 1);

    // The session survives: an allowed call on the same interface works.
    client
        .invoke_raw(&grain, &interface, "backup", encode_value(&()).unwrap(), None)
        .await
        .unwrap();
    assert_eq!(server.catalog().activation_count(), 1);
}

#[tokio::test]
async fn allow_anonymous_overrides_interface_authorize() {
    struct InfoGrain;
    impl Grain for InfoGrain {}

    let mut reg = GrainTypeRegistration::<InfoGrain>::new("Info", |_, _| Ok(Arc::new(InfoGrain)));
    reg.interface("I.Info")
        .policy(PolicyRule::Authorize)
        .method_with_policy(
            "version",
            &[PolicyRule::AllowAnonymous],
            |_g, (): ()| async move { Ok(("1.2.3".to_string(),)) },
        )
        .method("stats", |_g, (): ()| async move { Ok((0u32,)) });
    let server = ServerRuntime::builder("server-a", RuntimeConfig::new())
        .register_grain_type(reg)
        .unwrap()
        .build()
        .unwrap();

    let client = GrainClient::new("client-1", RuntimeConfig::new());
    // No verified principal: the session is anonymous.
    connect_loopback(&server, &client, None).await.unwrap();

    let interface = InterfaceId::new("I.Info");
    let grain = GrainId::new("Info", "singleton");

    let reply = client
        .invoke_raw(&grain, &interface, "version", encode_value(&()).unwrap(), None)
        .await
        .unwrap();
    let (version,): (String,) = grange_wire::decode_value(&reply).unwrap();
    assert_eq!(version, "1.2.3");

    // The interface-level Authorize still guards the other method.
    let err = client
        .invoke_raw(&grain, &interface, "stats", encode_value(&()).unwrap(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Denied { .. }));
}

#[tokio::test(start_paused = true)]
async fn timeout_then_late_response_is_dropped() {
    let server = slow_server("server-a", Duration::from_millis(200), RuntimeConfig::new());
    let client = GrainClient::new("client-1", RuntimeConfig::new());
    connect_loopback(&server, &client, None).await.unwrap();

    let grain = GrainId::new("Slow", "s1");
    let interface = InterfaceId::new("I.Slow");

    let started = tokio::time::Instant::now();
    let err = client
        .invoke_raw(
            &grain,
            &interface,
            "wait",
            encode_value(&()).unwrap(),
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    assert_eq!(err, CallError::Timeout);

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(100), "completed early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(200), "completed late: {:?}", elapsed);
    assert_eq!(client.pending_total(), 0);
    assert_eq!(client.metrics().timeouts, 1);

    // Let the server's delayed response arrive; it must be dropped
    // silently and nothing may fire.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.metrics().late_responses_dropped, 1);

    // The dispatcher is still healthy.
    let reply = client
        .invoke_raw(&grain, &interface, "fast", encode_value(&()).unwrap(), None)
        .await
        .unwrap();
    let (word,): (String,) = grange_wire::decode_value(&reply).unwrap();
    assert_eq!(word, "quick");
}

#[tokio::test]
async fn connection_loss_fails_all_pending() {
    let server = slow_server("server-a", Duration::from_secs(3600), RuntimeConfig::new());
    let client = GrainClient::new("client-1", RuntimeConfig::new());

    let (client_side, server_side, link) = linked_pair(Arc::new(FaultInjector::new()));
    server.accept(server_side, None);
    let server_id = client.connect(client_side).await.unwrap();

    let grain = GrainId::new("Slow", "s1");
    let interface = InterfaceId::new("I.Slow");
    let mut calls = Vec::new();
    for _ in 0..3 {
        calls.push(
            client
                .begin_invoke(&grain, &interface, "wait", encode_value(&()).unwrap(), None)
                .await
                .unwrap(),
        );
    }
    assert_eq!(client.pending_for(&server_id), 3);

    link.sever();

    for call in calls {
        assert_eq!(call.await.unwrap_err(), CallError::ConnectionLost);
    }
    assert_eq!(client.pending_for(&server_id), 0);
    assert_eq!(client.pending_total(), 0);

    // The dropped server's manifest contributions are purged.
    assert!(client.directory().providers(&interface).is_empty());
    assert!(client.session(&server_id).is_none());
    let err = client
        .invoke_raw(&grain, &interface, "fast", encode_value(&()).unwrap(), None)
        .await
        .unwrap_err();
    assert_eq!(err, CallError::NoProvider("I.Slow".to_string()));
}

#[tokio::test]
async fn unknown_protocol_version_is_refused_without_dispatch() {
    let server = echo_server("server-a", RuntimeConfig::new());
    let (client_side, server_side) = Transport::mem_pair();
    server.accept(server_side, None);

    let max = RuntimeConfig::new().max_frame_bytes;
    let handshake = Message::Handshake(Handshake {
        client_id: "old-client".into(),
        protocol_version: PROTOCOL_VERSION + 9,
        features: Default::default(),
    });
    client_side.send(handshake.encode(max).unwrap()).await.unwrap();

    let reply = Message::decode(&client_side.recv().await.unwrap(), max).unwrap();
    match reply {
        Message::Disconnect(bye) => {
            assert_eq!(bye.reason, DisconnectReason::ProtocolVersionMismatch);
        }
        other => panic!("expected disconnect, got {:?}", other),
    }
    assert_eq!(server.catalog().activation_count(), 0);
    assert_eq!(server.session_count(), 0);
}

#[tokio::test]
async fn identity_flows_into_handlers() {
    struct WhoGrain;
    impl Grain for WhoGrain {}

    let mut reg = GrainTypeRegistration::<WhoGrain>::new("Who", |_, _| Ok(Arc::new(WhoGrain)));
    reg.interface("I.Who")
        .method("whoami", |_g, (): ()| async move {
            let user_id = current_identity()
                .map(|identity| identity.user_id.clone())
                .unwrap_or_default();
            Ok((user_id,))
        });
    let server = ServerRuntime::builder("server-a", RuntimeConfig::new())
        .register_grain_type(reg)
        .unwrap()
        .build()
        .unwrap();

    let client = GrainClient::new("client-1", RuntimeConfig::new());
    let principal = UserIdentity::new("u-7", "alice", Role::User, 0);
    connect_loopback(&server, &client, Some(principal))
        .await
        .unwrap();

    let reply = client
        .invoke_raw(
            &GrainId::new("Who", "w1"),
            &InterfaceId::new("I.Who"),
            "whoami",
            encode_value(&()).unwrap(),
            None,
        )
        .await
        .unwrap();
    let (user_id,): (String,) = grange_wire::decode_value(&reply).unwrap();
    assert_eq!(user_id, "u-7");
}

#[tokio::test]
async fn overload_fails_fast_at_the_pending_ceiling() {
    let server = slow_server("server-a", Duration::from_secs(3600), RuntimeConfig::new());
    let mut config = RuntimeConfig::new();
    config.max_pending_per_connection = 2;
    let client = GrainClient::new("client-1", config);
    connect_loopback(&server, &client, None).await.unwrap();

    let grain = GrainId::new("Slow", "s1");
    let interface = InterfaceId::new("I.Slow");
    let _a = client
        .begin_invoke(&grain, &interface, "wait", encode_value(&()).unwrap(), None)
        .await
        .unwrap();
    let _b = client
        .begin_invoke(&grain, &interface, "wait", encode_value(&()).unwrap(), None)
        .await
        .unwrap();

    let err = client
        .begin_invoke(&grain, &interface, "wait", encode_value(&()).unwrap(), None)
        .await
        .unwrap_err();
    assert_eq!(err, CallError::Overloaded);
}

#[tokio::test]
async fn cancellation_is_local_and_resolves_canceled() {
    let server = slow_server("server-a", Duration::from_secs(3600), RuntimeConfig::new());
    let client = GrainClient::new("client-1", RuntimeConfig::new());
    connect_loopback(&server, &client, None).await.unwrap();

    let call = client
        .begin_invoke(
            &GrainId::new("Slow", "s1"),
            &InterfaceId::new("I.Slow"),
            "wait",
            encode_value(&()).unwrap(),
            None,
        )
        .await
        .unwrap();
    let id = call.message_id();

    assert!(client.cancel(id));
    assert_eq!(call.await.unwrap_err(), CallError::Canceled);
    assert_eq!(client.pending_total(), 0);
    // A second cancel finds nothing.
    assert!(!client.cancel(id));
}

#[tokio::test]
async fn unknown_ordinal_does_not_disturb_the_activation() {
    let server = echo_server("server-a", RuntimeConfig::new());
    let client = GrainClient::new("client-1", RuntimeConfig::new());
    connect_loopback(&server, &client, None).await.unwrap();

    let grain = GrainId::new("Echo", "alice");
    let interface = InterfaceId::new("I.Ping");

    // Activate with a good call first.
    client
        .invoke_raw(&grain, &interface, "ping", encode_value(&("x".to_string(),)).unwrap(), None)
        .await
        .unwrap();
    assert_eq!(server.catalog().activation_count(), 1);

    // An out-of-range ordinal cannot be produced through the proxy (name
    // resolution refuses first), so the client reports the missing method
    // without touching the wire.
    let err = client
        .invoke_raw(&grain, &interface, "quux", encode_value(&()).unwrap(), None)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CallError::UnknownMethod {
            interface: "I.Ping".to_string(),
            method: "quux".to_string()
        }
    );
    assert_eq!(server.catalog().activation_count(), 1);
}

#[tokio::test]
async fn heartbeats_keep_sessions_alive_and_measure_rtt() {
    let mut config = RuntimeConfig::new();
    config.heartbeat_interval = Duration::from_millis(50);
    config.idle_disconnect = Duration::from_millis(400);

    let server = echo_server("server-a", config.clone());
    let client = GrainClient::new("client-1", config);
    let server_id = connect_loopback(&server, &client, None).await.unwrap();

    // No requests flow; heartbeats alone must keep the session up.
    tokio::time::sleep(Duration::from_millis(600)).await;

    let session = client.session(&server_id).expect("session should survive");
    assert!(session.is_ready());
    assert!(client.session_metrics().heartbeats_sent >= 2);
    assert!(session.rtt().is_some());
    assert_eq!(server.session_count(), 1);
}

#[tokio::test]
async fn idle_activations_are_evicted_and_reactivated() {
    let mut config = RuntimeConfig::new();
    config.eviction_idle = Some(Duration::from_millis(100));
    let server = echo_server("server-a", config);
    let client = GrainClient::new("client-1", RuntimeConfig::new());
    connect_loopback(&server, &client, None).await.unwrap();

    let grain = GrainId::new("Echo", "alice");
    let interface = InterfaceId::new("I.Ping");
    client
        .invoke_raw(&grain, &interface, "pong", encode_value(&("x".to_string(),)).unwrap(), None)
        .await
        .unwrap();
    assert_eq!(server.catalog().activation_count(), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.catalog().activation_count(), 0);
    assert_eq!(server.catalog().metrics().evictions, 1);

    // Transparent re-activation on the next call.
    client
        .invoke_raw(&grain, &interface, "pong", encode_value(&("y".to_string(),)).unwrap(), None)
        .await
        .unwrap();
    assert_eq!(server.catalog().activation_count(), 1);
}

#[tokio::test]
async fn graceful_disconnect_purges_manifest() {
    let server = echo_server("server-a", RuntimeConfig::new());
    let client = GrainClient::new("client-1", RuntimeConfig::new());
    let server_id = connect_loopback(&server, &client, None).await.unwrap();

    client.disconnect(&server_id).await;

    let interface = InterfaceId::new("I.Ping");
    assert!(client.directory().providers(&interface).is_empty());
    let err = client
        .invoke_raw(
            &GrainId::new("Echo", "alice"),
            &interface,
            "ping",
            encode_value(&("hi".to_string(),)).unwrap(),
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err, CallError::NoProvider("I.Ping".to_string()));
}

#[tokio::test]
async fn raw_request_with_unknown_ordinal_gets_unknown_method() {
    use grange_wire::{Request, Response, ResponseStatus};

    let server = echo_server("server-a", RuntimeConfig::new());
    let (client_side, server_side) = Transport::mem_pair();
    server.accept(server_side, None);

    let max = RuntimeConfig::new().max_frame_bytes;
    let handshake = Message::Handshake(Handshake {
        client_id: "raw-client".into(),
        protocol_version: PROTOCOL_VERSION,
        features: Default::default(),
    });
    client_side.send(handshake.encode(max).unwrap()).await.unwrap();
    match Message::decode(&client_side.recv().await.unwrap(), max).unwrap() {
        Message::HandshakeAck(_) => {}
        other => panic!("expected ack, got {:?}", other),
    }

    let request = Message::Request(Request {
        message_id: 7,
        grain_type: "Echo".into(),
        grain_key: "alice".into(),
        interface_id: "I.Ping".into(),
        method_ordinal: 99,
        args: encode_value(&()).unwrap(),
        timeout_ms: 1000,
        flags: 0,
    });
    client_side.send(request.encode(max).unwrap()).await.unwrap();

    let response: Response = loop {
        match Message::decode(&client_side.recv().await.unwrap(), max).unwrap() {
            Message::Response(response) => break response,
            Message::Heartbeat(_) => continue,
            other => panic!("unexpected frame {:?}", other),
        }
    };
    assert_eq!(response.message_id, 7);
    assert_eq!(response.status, ResponseStatus::Error);
    let payload = grange_wire::ErrorPayload::decode(&response.payload);
    assert_eq!(payload.code, grange_core::ErrorCode::UnknownMethod);

    // The bad ordinal never created an activation.
    assert_eq!(server.catalog().activation_count(), 0);
}

#[tokio::test]
async fn undecodable_arguments_fail_with_invalid_argument() {
    let server = echo_server("server-a", RuntimeConfig::new());
    let client = GrainClient::new("client-1", RuntimeConfig::new());
    connect_loopback(&server, &client, None).await.unwrap();

    let err = client
        .invoke_raw(
            &GrainId::new("Echo", "alice"),
            &InterfaceId::new("I.Ping"),
            "ping",
            vec![0xFF, 0xFF, 0xFF],
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::InvalidArgument(_)));

    // The activation survives the bad call.
    assert_eq!(server.catalog().activation_count(), 1);
    let reply = client
        .invoke_raw(
            &GrainId::new("Echo", "alice"),
            &InterfaceId::new("I.Ping"),
            "ping",
            encode_value(&("ok".to_string(),)).unwrap(),
            None,
        )
        .await
        .unwrap();
    let (word,): (String,) = grange_wire::decode_value(&reply).unwrap();
    assert_eq!(word, "OK");
}
