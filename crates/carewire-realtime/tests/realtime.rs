//! End-to-end tests driving a `ConnectionManager` against an in-memory server.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use carewire_core::retry::BackoffConfig;
use carewire_core::{
    ContextId, EntityId, EntityKind, EntityRecord, EntityRef, Identity, Profile, RealtimeError,
};
use carewire_realtime::{
    ClientConfig, CollectionStatus, ConnectionHandle, ConnectionManager, ConnectionState, Inbound,
    InboundKind, MemoryConnector, MemoryFetcher, MemoryServer, Outbound, ServerConn,
    SnapshotEntry, SyncState, TypingContext,
};
use serde_json::json;
use tokio::time::timeout;

const TIMEOUT: Duration = Duration::from_secs(30);

// ── Harness ──

struct Harness {
    manager: ConnectionManager,
    server: MemoryServer,
    connector: MemoryConnector,
    fetcher: MemoryFetcher,
}

fn config() -> ClientConfig {
    ClientConfig {
        reconnect: BackoffConfig {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_factor: 0.0,
            max_attempts: None,
        },
        ..ClientConfig::default()
    }
}

fn harness_with(config: ClientConfig) -> Harness {
    let (connector, server) = MemoryConnector::pair();
    let fetcher = MemoryFetcher::new();
    let manager = ConnectionManager::new(config, Arc::new(connector.clone()), Arc::new(fetcher.clone()));
    Harness {
        manager,
        server,
        connector,
        fetcher,
    }
}

fn harness() -> Harness {
    harness_with(config())
}

fn record(value: serde_json::Value) -> EntityRecord {
    EntityRecord::from_value(value).unwrap()
}

async fn accept(server: &mut MemoryServer) -> ServerConn {
    timeout(TIMEOUT, server.accept())
        .await
        .expect("no connection attempt")
        .expect("connector dropped")
}

async fn next(conn: &mut ServerConn) -> Outbound {
    timeout(TIMEOUT, conn.recv())
        .await
        .expect("client sent nothing")
        .expect("client closed the connection")
}

async fn ack(conn: &mut ServerConn, session: &str) {
    assert!(
        conn.send(&Inbound::ConnectionAck {
            session_id: Some(session.into()),
        })
        .await
    );
    assert_eq!(next(conn).await, Outbound::PresenceSync);
}

/// Open a connection for `identity` and complete the handshake.
async fn connect(h: &mut Harness, identity: &str) -> (ConnectionHandle, ServerConn) {
    let handle = h.manager.open(Identity::from(identity));
    let mut conn = accept(&mut h.server).await;
    assert_eq!(conn.identity().as_str(), identity);
    ack(&mut conn, "s-1").await;
    wait_state(&handle, |s| s.is_connected()).await;
    (handle, conn)
}

async fn wait_state(handle: &ConnectionHandle, pred: impl Fn(&ConnectionState) -> bool) {
    let mut rx = handle.subscribe_status();
    let _ = timeout(TIMEOUT, rx.wait_for(|s| pred(&s.state)))
        .await
        .expect("state never reached")
        .unwrap();
}

/// Wait until `pred` holds, re-checking after every change on `rx`.
///
/// `pred` reads through the handle, so it must not run while a watch
/// borrow is held.
async fn wait_until<T>(
    handle: &ConnectionHandle,
    mut rx: tokio::sync::watch::Receiver<T>,
    pred: impl Fn(&ConnectionHandle) -> bool,
) {
    timeout(TIMEOUT, async {
        while !pred(handle) {
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("condition never held");
}

async fn wait_presence(handle: &ConnectionHandle, pred: impl Fn(&ConnectionHandle) -> bool) {
    wait_until(handle, handle.subscribe_presence(), pred).await;
}

async fn wait_entities(handle: &ConnectionHandle, kind: EntityKind, pred: impl Fn(&ConnectionHandle) -> bool) {
    wait_until(handle, handle.subscribe_entities(kind), pred).await;
}

fn online(identity: &str, session: Option<&str>) -> Inbound {
    Inbound::PresenceOnline {
        identity: identity.into(),
        profile: Profile::new(identity.to_uppercase(), format!("{identity}@example.com")),
        session_id: session.map(Into::into),
    }
}

fn offline(identity: &str, session: Option<&str>) -> Inbound {
    Inbound::PresenceOffline {
        identity: identity.into(),
        session_id: session.map(Into::into),
    }
}

fn typing_started(identity: &str, patient: &str) -> Inbound {
    Inbound::TypingStarted {
        identity: identity.into(),
        context: TypingContext::Patient,
        context_id: patient.into(),
        profile: Profile::default(),
    }
}

fn typists(handle: &ConnectionHandle, patient: &str) -> Vec<String> {
    handle
        .typing_in(&TypingContext::Patient, &ContextId::from(patient))
        .into_iter()
        .map(|e| e.identity.into_inner())
        .collect()
}

// ── Handshake ──

#[tokio::test(start_paused = true)]
async fn ack_connects_and_requests_presence() {
    let mut h = harness();
    let (handle, _conn) = connect(&mut h, "u1").await;

    let status = handle.status();
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.session_id.as_deref(), Some("s-1"));
    assert_eq!(status.reconnect_attempt, 0);
    assert!(handle.presence_is_stale());
}

#[tokio::test(start_paused = true)]
async fn missing_ack_times_out_and_retries() {
    let mut h = harness_with(ClientConfig {
        handshake_timeout: Duration::from_secs(2),
        ..config()
    });
    let handle = h.manager.open(Identity::from("u1"));
    let _silent = accept(&mut h.server).await;

    wait_state(&handle, |s| matches!(s, ConnectionState::Error(m) if m.contains("handshake"))).await;
    let mut retry = accept(&mut h.server).await;
    ack(&mut retry, "s-2").await;
    wait_state(&handle, ConnectionState::is_connected).await;
    assert_eq!(handle.status().session_id.as_deref(), Some("s-2"));
}

#[tokio::test(start_paused = true)]
async fn rejected_identity_is_not_retried() {
    let h = harness();
    h.connector.fail_next(RealtimeError::auth("unknown identity"));
    let handle = h.manager.open(Identity::from("intruder"));

    wait_state(&handle, |s| matches!(s, ConnectionState::Error(m) if m.contains("unknown identity"))).await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn transport_failures_back_off_and_retry() {
    let mut h = harness();
    h.connector.fail_next(RealtimeError::transport("refused"));
    h.connector.fail_next(RealtimeError::transport("refused"));
    let handle = h.manager.open(Identity::from("u1"));

    let mut conn = accept(&mut h.server).await;
    assert_eq!(h.connector.attempts(), 3);
    assert_eq!(handle.status().reconnect_attempt, 2);
    ack(&mut conn, "s-1").await;
    wait_state(&handle, ConnectionState::is_connected).await;
    assert_eq!(handle.status().reconnect_attempt, 0);
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_max_attempts() {
    let mut cfg = config();
    cfg.reconnect.max_attempts = Some(2);
    let h = harness_with(cfg);
    for _ in 0..5 {
        h.connector.fail_next(RealtimeError::transport("refused"));
    }
    let handle = h.manager.open(Identity::from("u1"));

    wait_state(&handle, |s| matches!(s, ConnectionState::Error(m) if m.contains("gave up"))).await;
    assert_eq!(h.connector.attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn reopen_after_rejection_connects_again() {
    let mut h = harness();
    h.connector.fail_next(RealtimeError::auth("unknown identity"));
    let rejected = h.manager.open(Identity::from("u1"));
    wait_state(&rejected, |s| matches!(s, ConnectionState::Error(_))).await;
    assert!(rejected.is_stopped());
    assert!(!rejected.is_closed());

    let again = h.manager.open(Identity::from("u1"));
    assert!(rejected.is_closed());
    assert!(!again.is_stopped());
    let mut conn = accept(&mut h.server).await;
    ack(&mut conn, "s-2").await;
    wait_state(&again, ConnectionState::is_connected).await;
    assert_eq!(h.connector.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn set_identity_after_giving_up_connects_again() {
    let mut cfg = config();
    cfg.reconnect.max_attempts = Some(1);
    let mut h = harness_with(cfg);
    h.connector.fail_next(RealtimeError::transport("refused"));
    h.connector.fail_next(RealtimeError::transport("refused"));
    let exhausted = h.manager.set_identity(Some(Identity::from("u1"))).unwrap();
    wait_state(&exhausted, |s| matches!(s, ConnectionState::Error(m) if m.contains("gave up"))).await;
    assert!(exhausted.is_stopped());

    let again = h.manager.set_identity(Some(Identity::from("u1"))).unwrap();
    let mut conn = accept(&mut h.server).await;
    ack(&mut conn, "s-1").await;
    wait_state(&again, ConnectionState::is_connected).await;
    assert!(h.manager.current().is_some_and(|c| !c.is_stopped()));
}

#[tokio::test(start_paused = true)]
async fn connection_error_reconnects_without_waiting_for_heartbeat() {
    let mut h = harness();
    let (handle, conn) = connect(&mut h, "u1").await;
    let started = tokio::time::Instant::now();

    assert!(
        conn.send(&Inbound::ConnectionError {
            message: "overloaded".into(),
        })
        .await
    );
    wait_state(&handle, |s| *s == ConnectionState::Error("overloaded".into())).await;
    let mut again = accept(&mut h.server).await;
    assert!(started.elapsed() < h.manager.config().heartbeat_interval);
    ack(&mut again, "s-2").await;
    wait_state(&handle, ConnectionState::is_connected).await;
}

#[tokio::test(start_paused = true)]
async fn server_close_reports_reason_and_reconnects() {
    let mut h = harness();
    let (handle, conn) = connect(&mut h, "u1").await;

    assert!(
        conn.send(&Inbound::ConnectionClosed {
            reason: Some("maintenance".into()),
        })
        .await
    );
    wait_state(&handle, |s| {
        *s == ConnectionState::Disconnected {
            reason: Some("maintenance".into()),
        }
    })
    .await;
    let _again = accept(&mut h.server).await;
}

// ── Heartbeat ──

#[tokio::test(start_paused = true)]
async fn heartbeat_ack_records_round_trip() {
    let mut h = harness_with(ClientConfig {
        heartbeat_interval: Duration::from_secs(1),
        heartbeat_timeout: Duration::from_secs(3),
        ..config()
    });
    let (handle, mut conn) = connect(&mut h, "u1").await;

    assert_eq!(next(&mut conn).await, Outbound::Heartbeat);
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(conn.send(&Inbound::HeartbeatAck).await);

    let mut rx = handle.subscribe_status();
    let status = timeout(TIMEOUT, rx.wait_for(|s| s.last_rtt.is_some()))
        .await
        .unwrap()
        .unwrap()
        .clone();
    assert!(status.last_rtt.unwrap() >= Duration::from_millis(40));
    assert!(status.state.is_connected());
}

#[tokio::test(start_paused = true)]
async fn zero_heartbeat_interval_still_heartbeats() {
    let mut h = harness_with(ClientConfig {
        heartbeat_interval: Duration::ZERO,
        ..config()
    });
    let (handle, mut conn) = connect(&mut h, "u1").await;

    assert_eq!(next(&mut conn).await, Outbound::Heartbeat);
    assert!(conn.send(&Inbound::HeartbeatAck).await);
    wait_until(&handle, handle.subscribe_status(), |h| h.status().last_rtt.is_some()).await;
    assert!(handle.status().state.is_connected());
}

#[tokio::test(start_paused = true)]
async fn silent_server_times_out_and_reconnects() {
    let mut h = harness_with(ClientConfig {
        heartbeat_interval: Duration::from_secs(1),
        heartbeat_timeout: Duration::from_secs(3),
        ..config()
    });
    let (handle, _conn) = connect(&mut h, "u1").await;

    wait_state(&handle, |s| matches!(s, ConnectionState::Error(m) if m.contains("heartbeat"))).await;
    let mut conn = accept(&mut h.server).await;
    ack(&mut conn, "s-2").await;
    wait_state(&handle, ConnectionState::is_connected).await;
}

// ── Presence ──

#[tokio::test(start_paused = true)]
async fn sessions_are_counted_per_identity() {
    let mut h = harness();
    let (handle, conn) = connect(&mut h, "u1").await;
    let u9 = Identity::from("u9");

    assert!(conn.send(&online("u9", Some("a"))).await);
    assert!(conn.send(&online("u9", Some("b"))).await);
    wait_presence(&handle, |h| h.presence_of(&u9).is_some_and(|e| e.session_count() == 2)).await;
    assert_eq!(handle.presence_count(), 1);
    assert_eq!(handle.presence_of(&u9).unwrap().status_label(), "2 sessions");

    assert!(conn.send(&offline("u9", Some("a"))).await);
    wait_presence(&handle, |h| h.presence_of(&u9).is_some_and(|e| e.session_count() == 1)).await;

    assert!(conn.send(&offline("u9", Some("b"))).await);
    wait_presence(&handle, |h| h.presence_count() == 0).await;
    assert!(handle.presence_of(&u9).is_none());
}

#[tokio::test(start_paused = true)]
async fn snapshot_replaces_presence_and_clears_staleness() {
    let mut h = harness();
    let (handle, conn) = connect(&mut h, "u1").await;

    assert!(conn.send(&online("ghost", None)).await);
    let snapshot: Vec<SnapshotEntry> = serde_json::from_value(json!([
        {"userId": "u2", "user": {"name": "Dana", "email": "dana@example.com"}, "socketCount": 2},
        {"identity": "u3", "sessions": [{"sessionId": "x"}]},
        {"identity": "u4", "sessionCount": 0}
    ]))
    .unwrap();
    assert!(conn.send(&Inbound::PresenceSnapshot { entries: snapshot }).await);

    wait_presence(&handle, |h| !h.presence_is_stale()).await;
    assert_eq!(handle.presence_count(), 2);
    assert!(handle.presence_of(&Identity::from("ghost")).is_none());
    assert_eq!(handle.presence_of(&Identity::from("u2")).unwrap().session_count(), 2);

    let page = handle.presence_list(1);
    assert_eq!(page.entries.len(), 1);
    assert_eq!(page.total, 2);
    assert_eq!(page.remainder, 1);
}

#[tokio::test(start_paused = true)]
async fn listeners_see_state_after_effects() {
    let mut h = harness();
    let (handle, conn) = connect(&mut h, "u1").await;
    let seen = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&seen);
    let sub = handle
        .on(InboundKind::PresenceOnline, move |event: &Inbound, state: &mut SyncState| {
            if let Inbound::PresenceOnline { identity, .. } = event {
                assert!(state.presence().is_online(identity));
                let _ = counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

    assert!(conn.send(&online("u7", None)).await);
    wait_presence(&handle, |h| h.presence_count() == 1).await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    assert!(handle.off(sub));
    assert!(conn.send(&online("u8", None)).await);
    wait_presence(&handle, |h| h.presence_count() == 2).await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn bad_frames_are_skipped() {
    let mut h = harness();
    let (handle, conn) = connect(&mut h, "u1").await;

    assert!(conn.send_raw("{not json").await);
    assert!(conn.send_raw(r#"{"type": "weather_report"}"#).await);
    assert!(conn.send(&online("u2", None)).await);

    wait_presence(&handle, |h| h.presence_count() == 1).await;
    assert!(handle.status().state.is_connected());
}

// ── Typing ──

#[tokio::test(start_paused = true)]
async fn typing_tracks_each_identity_per_context() {
    let mut h = harness();
    let (handle, conn) = connect(&mut h, "u1").await;

    assert!(conn.send(&typing_started("u2", "p1")).await);
    assert!(conn.send(&typing_started("u3", "p1")).await);
    let mut rx = handle.subscribe_typing();
    let _ = timeout(TIMEOUT, rx.wait_for(|entries| entries.len() == 2)).await.unwrap().unwrap();

    assert!(
        conn.send(&Inbound::TypingStopped {
            identity: "u2".into(),
            context: TypingContext::Patient,
            context_id: "p1".into(),
        })
        .await
    );
    let _ = timeout(TIMEOUT, rx.wait_for(|entries| entries.len() == 1)).await.unwrap().unwrap();
    assert_eq!(typists(&handle, "p1"), ["u3"]);
    assert!(typists(&handle, "p2").is_empty());
}

#[tokio::test(start_paused = true)]
async fn stale_typing_expires_on_heartbeat() {
    let mut h = harness_with(ClientConfig {
        heartbeat_interval: Duration::from_secs(1),
        heartbeat_timeout: Duration::from_secs(30),
        typing_ttl: Some(Duration::from_secs(3)),
        ..config()
    });
    let (handle, conn) = connect(&mut h, "u1").await;

    assert!(conn.send(&typing_started("u2", "p1")).await);
    let mut rx = handle.subscribe_typing();
    let _ = timeout(TIMEOUT, rx.wait_for(|entries| entries.len() == 1)).await.unwrap().unwrap();
    let _ = timeout(TIMEOUT, rx.wait_for(|entries| entries.is_empty())).await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn local_typing_is_pending_until_echoed() {
    let mut h = harness();
    let (handle, mut conn) = connect(&mut h, "u1").await;
    let emitter = handle.emitter();

    assert!(emitter.start_typing(TypingContext::Patient, "p1"));
    assert_eq!(
        next(&mut conn).await,
        Outbound::TypingStarted {
            context: TypingContext::Patient,
            context_id: "p1".into(),
        }
    );
    let local = handle.typing_in(&TypingContext::Patient, &ContextId::from("p1"));
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].state, carewire_realtime::TypingState::Pending);

    assert!(emitter.stop_typing(TypingContext::Patient, "p1"));
    assert!(typists(&handle, "p1").is_empty());
}

// ── Reconnect ──

#[tokio::test(start_paused = true)]
async fn gap_discards_typing_and_resyncs() {
    let mut h = harness();
    let (handle, mut conn) = connect(&mut h, "u1").await;

    assert!(handle.emitter().join_room("ward-3"));
    assert_eq!(next(&mut conn).await, Outbound::JoinScope { scope_id: "ward-3".into() });
    assert!(conn.send(&Inbound::PresenceSnapshot { entries: Vec::new() }).await);
    assert!(conn.send(&typing_started("u2", "p1")).await);
    let mut rx = handle.subscribe_typing();
    let _ = timeout(TIMEOUT, rx.wait_for(|entries| entries.len() == 1)).await.unwrap().unwrap();
    assert!(!handle.presence_is_stale());

    drop(conn);
    let mut conn = accept(&mut h.server).await;
    assert!(typists(&handle, "p1").is_empty());
    assert!(handle.presence_is_stale());
    assert!(!handle.status().state.is_connected());

    ack(&mut conn, "s-2").await;
    assert_eq!(next(&mut conn).await, Outbound::JoinScope { scope_id: "ward-3".into() });
}

#[tokio::test(start_paused = true)]
async fn left_rooms_are_not_rejoined() {
    let mut h = harness();
    let (handle, mut conn) = connect(&mut h, "u1").await;
    let emitter = handle.emitter();

    assert!(emitter.join_room("ward-3"));
    assert!(emitter.join_room("ward-4"));
    assert!(emitter.leave_room("ward-3"));
    assert_eq!(next(&mut conn).await, Outbound::JoinScope { scope_id: "ward-3".into() });
    assert_eq!(next(&mut conn).await, Outbound::JoinScope { scope_id: "ward-4".into() });
    assert_eq!(next(&mut conn).await, Outbound::LeaveScope { scope_id: "ward-3".into() });

    drop(conn);
    let mut conn = accept(&mut h.server).await;
    ack(&mut conn, "s-2").await;
    assert_eq!(next(&mut conn).await, Outbound::JoinScope { scope_id: "ward-4".into() });
}

// ── Entities ──

#[tokio::test(start_paused = true)]
async fn collections_load_after_ack() {
    let mut h = harness();
    h.fetcher.set(EntityKind::Patient, vec![record(json!({"id": "p1", "name": "A"}))]);
    h.fetcher.fail(EntityKind::Tenant, "HTTP 500");
    let (handle, _conn) = connect(&mut h, "u1").await;

    wait_entities(&handle, EntityKind::Patient, |h| h.collection_status(EntityKind::Patient).is_fresh()).await;
    assert_eq!(handle.entities(EntityKind::Patient).len(), 1);
    wait_entities(&handle, EntityKind::Tenant, |h| {
        matches!(h.collection_status(EntityKind::Tenant), CollectionStatus::Failed(_))
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn pushed_record_replaces_existing() {
    let mut h = harness();
    h.fetcher.set(EntityKind::Patient, vec![record(json!({"id": "p1", "name": "A"}))]);
    let (handle, conn) = connect(&mut h, "u1").await;
    wait_entities(&handle, EntityKind::Patient, |h| h.collection_status(EntityKind::Patient).is_fresh()).await;

    assert!(
        conn.send(&Inbound::EntityUpdated {
            kind: EntityKind::Patient,
            record: record(json!({"id": "p1", "name": "B"})),
        })
        .await
    );
    let p1 = EntityId::from("p1");
    wait_entities(&handle, EntityKind::Patient, |h| {
        h.entity(EntityKind::Patient, &p1)
            .is_some_and(|r| r.get("name") == Some(&json!("B")))
    })
    .await;
    assert_eq!(handle.entities(EntityKind::Patient).len(), 1);

    assert!(
        conn.send(&Inbound::EntityRemoved {
            kind: EntityKind::Patient,
            id: p1.clone(),
        })
        .await
    );
    wait_entities(&handle, EntityKind::Patient, |h| h.entities(EntityKind::Patient).is_empty()).await;
}

#[tokio::test(start_paused = true)]
async fn pushes_during_fetch_survive_the_response() {
    let mut h = harness();
    h.fetcher.set(
        EntityKind::Patient,
        vec![
            record(json!({"id": "p1", "name": "fetched"})),
            record(json!({"id": "p3", "name": "fetched"})),
        ],
    );
    h.fetcher.hold();
    let (handle, conn) = connect(&mut h, "u1").await;
    assert_eq!(handle.collection_status(EntityKind::Patient), CollectionStatus::Loading);

    for (id, name) in [("p1", "pushed"), ("p2", "pushed")] {
        assert!(
            conn.send(&Inbound::EntityUpdated {
                kind: EntityKind::Patient,
                record: record(json!({"id": id, "name": name})),
            })
            .await
        );
    }
    wait_entities(&handle, EntityKind::Patient, |h| h.entities(EntityKind::Patient).len() == 2).await;

    h.fetcher.release();
    wait_entities(&handle, EntityKind::Patient, |h| h.collection_status(EntityKind::Patient).is_fresh()).await;

    let patients = handle.entities(EntityKind::Patient);
    assert_eq!(patients.len(), 3);
    assert_eq!(patients.get(&EntityId::from("p1")).unwrap().get("name"), Some(&json!("pushed")));
    assert!(patients.contains(&EntityId::from("p2")));
    assert!(patients.contains(&EntityId::from("p3")));
}

#[tokio::test(start_paused = true)]
async fn manual_refresh_reports_record_count() {
    let mut h = harness();
    let (handle, _conn) = connect(&mut h, "u1").await;
    h.fetcher.set(
        EntityKind::Organization,
        vec![record(json!({"id": "o1"})), record(json!({"id": "o2"}))],
    );
    assert_eq!(handle.refresh(EntityKind::Organization).await.unwrap(), 2);
    assert_eq!(handle.entities(EntityKind::Organization).len(), 2);
}

// ── Teardown ──

#[tokio::test(start_paused = true)]
async fn closed_connection_ignores_late_events() {
    let mut h = harness();
    let (handle, conn) = connect(&mut h, "u1").await;
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let _sub = handle.on(InboundKind::PresenceOnline, move |_: &Inbound, _: &mut SyncState| {
        let _ = counter.fetch_add(1, Ordering::SeqCst);
    });
    let mut presence = handle.subscribe_presence();
    let _ = presence.borrow_and_update();

    handle.close();
    let _ = conn.send(&online("u2", None)).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(seen.load(Ordering::SeqCst), 0);
    assert_eq!(handle.presence_count(), 0);
    assert!(!presence.has_changed().unwrap_or(false));
    assert!(!handle.emitter().join_room("ward-3"));
}

#[tokio::test(start_paused = true)]
async fn sign_out_flushes_then_closes() {
    let mut h = harness();
    let handle = h.manager.set_identity(Some(Identity::from("u1"))).unwrap();
    let mut conn = accept(&mut h.server).await;
    ack(&mut conn, "s-1").await;
    wait_state(&handle, ConnectionState::is_connected).await;

    assert!(handle.emitter().notify_viewed(EntityRef::new(EntityKind::Patient, "p1")));
    assert!(handle.emitter().sign_out());
    assert!(handle.is_closed());
    assert!(h.manager.current().is_none());

    assert_eq!(
        next(&mut conn).await,
        Outbound::EntityViewed {
            entity: EntityRef::new(EntityKind::Patient, "p1"),
        }
    );
    assert_eq!(next(&mut conn).await, Outbound::SignOut);
    assert_eq!(timeout(TIMEOUT, conn.recv()).await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn switching_identity_closes_previous_connection() {
    let mut h = harness();
    let first = h.manager.set_identity(Some(Identity::from("u1"))).unwrap();
    let mut first_conn = accept(&mut h.server).await;

    let second = h.manager.set_identity(Some(Identity::from("u2"))).unwrap();
    let second_conn = accept(&mut h.server).await;

    assert!(first.is_closed());
    assert!(!second.is_closed());
    assert_eq!(second_conn.identity().as_str(), "u2");
    assert_eq!(timeout(TIMEOUT, first_conn.recv()).await.unwrap(), None);
}
