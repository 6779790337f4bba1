//! Branded ID newtypes for type safety.
//!
//! Every key that crosses the wire is a newtype wrapper around `String`. This
//! prevents accidentally passing an entity ID where an identity is expected.
//!
//! Keys minted by the server (identities, entity IDs, scope IDs) are opaque.
//! Only [`SessionId`] can be generated locally, as a UUID v7 (time-ordered)
//! via [`uuid::Uuid::now_v7`].

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Stable key of an authenticated actor, independent of how many
    /// sessions it has open.
    Identity
}

branded_id! {
    /// One physical connection (tab or device) of an identity.
    SessionId
}

branded_id! {
    /// Stable identifier of a user, organization, tenant or patient record.
    EntityId
}

branded_id! {
    /// Server-side room a connection can join (e.g. an organization).
    ScopeId
}

branded_id! {
    /// Record a typing indicator is attached to (e.g. a patient ID).
    ContextId
}

impl SessionId {
    /// Create a new random session ID (UUID v7, time-ordered).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
