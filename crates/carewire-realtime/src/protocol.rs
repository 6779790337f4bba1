//! Wire-format message types and the JSON codec.
//!
//! Every frame is a JSON object whose `type` field names the message kind;
//! the remaining fields are the payload, camelCase. The decoder accepts the
//! legacy `userId` / `user` / `socketCount` field names for presence payloads.

use std::fmt;

use carewire_core::{
    ContextId, EntityId, EntityKind, EntityRecord, EntityRef, Identity, Profile, ProtocolError,
    ScopeId, SessionId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::typing::TypingContext;

// ─────────────────────────────────────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────────────────────────────────────

/// Server-pushed message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    /// Handshake accepted.
    #[serde(rename_all = "camelCase")]
    ConnectionAck {
        /// Server-assigned ID of this physical session.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },
    /// The server closed the connection (or the transport reported a close).
    ConnectionClosed {
        /// Close reason, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// The server reported a connection-level failure.
    ConnectionError {
        /// Failure description.
        message: String,
    },
    /// Full presence state; supersedes everything known before it.
    PresenceSnapshot {
        /// One entry per online identity.
        entries: Vec<SnapshotEntry>,
    },
    /// A session for `identity` connected.
    #[serde(rename_all = "camelCase")]
    PresenceOnline {
        /// Identity that came online.
        #[serde(alias = "userId")]
        identity: Identity,
        /// Public profile.
        #[serde(default, alias = "user")]
        profile: Profile,
        /// Session that connected, when the server reports it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },
    /// A session for `identity` disconnected.
    #[serde(rename_all = "camelCase")]
    PresenceOffline {
        /// Identity that went offline.
        #[serde(alias = "userId")]
        identity: Identity,
        /// Session that disconnected, when the server reports it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },
    /// `identity` started typing in a context.
    #[serde(rename_all = "camelCase")]
    TypingStarted {
        /// Who is typing.
        #[serde(alias = "userId")]
        identity: Identity,
        /// Kind of record being edited.
        context: TypingContext,
        /// Record being edited.
        context_id: ContextId,
        /// Public profile.
        #[serde(default, alias = "user")]
        profile: Profile,
    },
    /// `identity` stopped typing in a context.
    #[serde(rename_all = "camelCase")]
    TypingStopped {
        /// Who stopped typing.
        #[serde(alias = "userId")]
        identity: Identity,
        /// Kind of record.
        context: TypingContext,
        /// Record.
        context_id: ContextId,
    },
    /// Reply to an outbound heartbeat.
    HeartbeatAck,
    /// A full record was created or changed.
    EntityUpdated {
        /// Collection.
        kind: EntityKind,
        /// The complete record.
        record: EntityRecord,
    },
    /// A record was deleted.
    EntityRemoved {
        /// Collection.
        kind: EntityKind,
        /// Deleted record's ID.
        id: EntityId,
    },
}

impl Inbound {
    /// The message kind, used to route to handlers.
    #[must_use]
    pub fn kind(&self) -> InboundKind {
        match self {
            Self::ConnectionAck { .. } => InboundKind::ConnectionAck,
            Self::ConnectionClosed { .. } => InboundKind::ConnectionClosed,
            Self::ConnectionError { .. } => InboundKind::ConnectionError,
            Self::PresenceSnapshot { .. } => InboundKind::PresenceSnapshot,
            Self::PresenceOnline { .. } => InboundKind::PresenceOnline,
            Self::PresenceOffline { .. } => InboundKind::PresenceOffline,
            Self::TypingStarted { .. } => InboundKind::TypingStarted,
            Self::TypingStopped { .. } => InboundKind::TypingStopped,
            Self::HeartbeatAck => InboundKind::HeartbeatAck,
            Self::EntityUpdated { .. } => InboundKind::EntityUpdated,
            Self::EntityRemoved { .. } => InboundKind::EntityRemoved,
        }
    }
}

/// Discriminant of [`Inbound`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InboundKind {
    /// `connection_ack`
    ConnectionAck,
    /// `connection_closed`
    ConnectionClosed,
    /// `connection_error`
    ConnectionError,
    /// `presence_snapshot`
    PresenceSnapshot,
    /// `presence_online`
    PresenceOnline,
    /// `presence_offline`
    PresenceOffline,
    /// `typing_started`
    TypingStarted,
    /// `typing_stopped`
    TypingStopped,
    /// `heartbeat_ack`
    HeartbeatAck,
    /// `entity_updated`
    EntityUpdated,
    /// `entity_removed`
    EntityRemoved,
}

impl InboundKind {
    /// Every inbound kind.
    pub const ALL: [Self; 11] = [
        Self::ConnectionAck,
        Self::ConnectionClosed,
        Self::ConnectionError,
        Self::PresenceSnapshot,
        Self::PresenceOnline,
        Self::PresenceOffline,
        Self::TypingStarted,
        Self::TypingStopped,
        Self::HeartbeatAck,
        Self::EntityUpdated,
        Self::EntityRemoved,
    ];

    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionAck => "connection_ack",
            Self::ConnectionClosed => "connection_closed",
            Self::ConnectionError => "connection_error",
            Self::PresenceSnapshot => "presence_snapshot",
            Self::PresenceOnline => "presence_online",
            Self::PresenceOffline => "presence_offline",
            Self::TypingStarted => "typing_started",
            Self::TypingStopped => "typing_stopped",
            Self::HeartbeatAck => "heartbeat_ack",
            Self::EntityUpdated => "entity_updated",
            Self::EntityRemoved => "entity_removed",
        }
    }

    /// Look up a kind by wire name.
    #[must_use]
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

impl fmt::Display for InboundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One identity in a `presence_snapshot`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    /// Online identity.
    #[serde(alias = "userId")]
    pub identity: Identity,
    /// Public profile.
    #[serde(default, alias = "user")]
    pub profile: Profile,
    /// Sessions the server knows about.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sessions: Vec<SnapshotSession>,
    /// Session count, for servers that do not list sessions individually.
    #[serde(default, alias = "socketCount", skip_serializing_if = "Option::is_none")]
    pub session_count: Option<usize>,
}

/// One session inside a [`SnapshotEntry`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSession {
    /// Session ID.
    pub session_id: SessionId,
    /// When the session connected, if reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────────────────────────

/// Client-emitted message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    /// Join a server-side room.
    #[serde(rename_all = "camelCase")]
    JoinScope {
        /// Room.
        scope_id: ScopeId,
    },
    /// Leave a server-side room.
    #[serde(rename_all = "camelCase")]
    LeaveScope {
        /// Room.
        scope_id: ScopeId,
    },
    /// The local identity started typing.
    #[serde(rename_all = "camelCase")]
    TypingStarted {
        /// Kind of record.
        context: TypingContext,
        /// Record.
        context_id: ContextId,
    },
    /// The local identity stopped typing.
    #[serde(rename_all = "camelCase")]
    TypingStopped {
        /// Kind of record.
        context: TypingContext,
        /// Record.
        context_id: ContextId,
    },
    /// The local identity opened an entity.
    EntityViewed {
        /// Entity opened.
        #[serde(rename = "ref")]
        entity: EntityRef,
    },
    /// Manual sign-out.
    SignOut,
    /// Liveness probe; answered with `heartbeat_ack`.
    Heartbeat,
    /// Ask the server for a fresh `presence_snapshot`.
    PresenceSync,
}

impl Outbound {
    /// Wire name, for logging.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JoinScope { .. } => "join_scope",
            Self::LeaveScope { .. } => "leave_scope",
            Self::TypingStarted { .. } => "typing_started",
            Self::TypingStopped { .. } => "typing_stopped",
            Self::EntityViewed { .. } => "entity_viewed",
            Self::SignOut => "sign_out",
            Self::Heartbeat => "heartbeat",
            Self::PresenceSync => "presence_sync",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Codec
// ─────────────────────────────────────────────────────────────────────────────

/// Decode one inbound text frame.
///
/// Unknown kinds are reported separately from malformed payloads so the
/// dispatcher can log them at different levels.
pub fn decode(text: &str) -> Result<Inbound, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingKind)?
        .to_owned();
    if InboundKind::from_wire(&kind).is_none() {
        return Err(ProtocolError::UnknownKind(kind));
    }
    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed {
        kind,
        message: e.to_string(),
    })
}

/// Encode one outbound message as a text frame.
pub fn encode(message: &Outbound) -> String {
    serde_json::to_string(message).unwrap_or_else(|e| {
        tracing::error!(kind = message.as_str(), error = %e, "failed to serialize outbound message");
        String::new()
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn decode_connection_ack_with_session() {
        let msg = decode(r#"{"type":"connection_ack","sessionId":"s-1"}"#).unwrap();
        assert_eq!(
            msg,
            Inbound::ConnectionAck {
                session_id: Some(SessionId::from("s-1"))
            }
        );
        assert_eq!(msg.kind(), InboundKind::ConnectionAck);
    }

    #[test]
    fn decode_heartbeat_ack_unit() {
        assert_eq!(decode(r#"{"type":"heartbeat_ack"}"#).unwrap(), Inbound::HeartbeatAck);
    }

    #[test]
    fn decode_presence_online_legacy_fields() {
        let msg = decode(
            r#"{"type":"presence_online","userId":"u1","user":{"name":"Ada","email":"ada@example.com"}}"#,
        )
        .unwrap();
        assert_matches!(msg, Inbound::PresenceOnline { identity, profile, session_id: None } => {
            assert_eq!(identity.as_str(), "u1");
            assert_eq!(profile.name.as_deref(), Some("Ada"));
        });
    }

    #[test]
    fn decode_snapshot_with_socket_count() {
        let msg = decode(
            r#"{"type":"presence_snapshot","entries":[{"userId":"u1","user":{"email":"a@b.c"},"socketCount":2}]}"#,
        )
        .unwrap();
        assert_matches!(msg, Inbound::PresenceSnapshot { entries } => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].session_count, Some(2));
            assert!(entries[0].sessions.is_empty());
        });
    }

    #[test]
    fn decode_typing_started() {
        let msg = decode(
            r#"{"type":"typing_started","identity":"u2","context":"patient","contextId":"p7"}"#,
        )
        .unwrap();
        assert_matches!(msg, Inbound::TypingStarted { identity, context, context_id, .. } => {
            assert_eq!(identity.as_str(), "u2");
            assert_eq!(context, TypingContext::Patient);
            assert_eq!(context_id.as_str(), "p7");
        });
    }

    #[test]
    fn decode_entity_updated() {
        let msg = decode(
            r#"{"type":"entity_updated","kind":"tenant","record":{"id":"t1","name":"North"}}"#,
        )
        .unwrap();
        assert_matches!(msg, Inbound::EntityUpdated { kind: EntityKind::Tenant, record } => {
            assert_eq!(record.id().as_str(), "t1");
        });
    }

    #[test]
    fn decode_unknown_kind() {
        let err = decode(r#"{"type":"users_updated","users":[]}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownKind("users_updated".into()));
    }

    #[test]
    fn decode_missing_kind() {
        assert_eq!(decode(r#"{"identity":"u1"}"#).unwrap_err(), ProtocolError::MissingKind);
        assert_eq!(decode(r#"{"type":7}"#).unwrap_err(), ProtocolError::MissingKind);
    }

    #[test]
    fn decode_invalid_json() {
        assert_matches!(decode("not json"), Err(ProtocolError::InvalidJson(_)));
    }

    #[test]
    fn decode_malformed_payload() {
        let err = decode(r#"{"type":"presence_offline"}"#).unwrap_err();
        assert_matches!(err, ProtocolError::Malformed { kind, .. } if kind == "presence_offline");
        let err = decode(r#"{"type":"entity_updated","kind":"user","record":{"name":"x"}}"#)
            .unwrap_err();
        assert_matches!(err, ProtocolError::Malformed { .. });
    }

    #[test]
    fn every_kind_round_trips_through_from_wire() {
        for kind in InboundKind::ALL {
            assert_eq!(InboundKind::from_wire(kind.as_str()), Some(kind));
        }
        assert_eq!(InboundKind::from_wire("pong"), None);
    }

    #[test]
    fn encode_unit_messages() {
        assert_eq!(encode(&Outbound::SignOut), r#"{"type":"sign_out"}"#);
        assert_eq!(encode(&Outbound::Heartbeat), r#"{"type":"heartbeat"}"#);
        assert_eq!(encode(&Outbound::PresenceSync), r#"{"type":"presence_sync"}"#);
    }

    #[test]
    fn encode_payload_field_names() {
        let typing: Value = serde_json::from_str(&encode(&Outbound::TypingStarted {
            context: TypingContext::Patient,
            context_id: ContextId::from("p7"),
        }))
        .unwrap();
        assert_eq!(typing, json!({"type": "typing_started", "context": "patient", "contextId": "p7"}));

        let join: Value = serde_json::from_str(&encode(&Outbound::JoinScope {
            scope_id: ScopeId::from("org-1"),
        }))
        .unwrap();
        assert_eq!(join, json!({"type": "join_scope", "scopeId": "org-1"}));

        let viewed: Value = serde_json::from_str(&encode(&Outbound::EntityViewed {
            entity: EntityRef::new(EntityKind::Patient, "p7"),
        }))
        .unwrap();
        assert_eq!(viewed, json!({"type": "entity_viewed", "ref": {"kind": "patient", "id": "p7"}}));
    }

    #[test]
    fn outbound_names_match_wire_tag() {
        let messages = [
            Outbound::SignOut,
            Outbound::Heartbeat,
            Outbound::PresenceSync,
            Outbound::LeaveScope {
                scope_id: ScopeId::from("o"),
            },
        ];
        for msg in messages {
            let value: Value = serde_json::from_str(&encode(&msg)).unwrap();
            assert_eq!(value["type"], msg.as_str());
        }
    }
}
