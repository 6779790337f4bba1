//! Entity kinds, records, and identity profiles.
//!
//! Records are owned by the server and arrive either from a bulk fetch or
//! from an `entity_updated` push. The client never merges fields: a record
//! is always replaced wholesale, so it is kept as the raw JSON object the
//! server sent, indexed by its `id`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{EntityId, Identity};

/// The four entity collections mirrored by the console.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Console users (staff accounts).
    User,
    /// Organizations users belong to.
    Organization,
    /// Tenants, i.e. hospitals.
    Tenant,
    /// Patient records.
    Patient,
}

impl EntityKind {
    /// Every kind, in a fixed order.
    pub const ALL: [Self; 4] = [Self::User, Self::Organization, Self::Tenant, Self::Patient];

    /// Wire name (`user`, `organization`, ...).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Organization => "organization",
            Self::Tenant => "tenant",
            Self::Patient => "patient",
        }
    }

    /// Plural path segment used by the bulk-fetch endpoint.
    #[must_use]
    pub fn collection_path(self) -> &'static str {
        match self {
            Self::User => "users",
            Self::Organization => "organizations",
            Self::Tenant => "tenants",
            Self::Patient => "patients",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" | "users" => Ok(Self::User),
            "organization" | "organisation" | "organizations" => Ok(Self::Organization),
            "tenant" | "hospital" | "tenants" => Ok(Self::Tenant),
            "patient" | "patients" => Ok(Self::Patient),
            other => Err(format!("unknown entity kind: {other}")),
        }
    }
}

/// A full server record with a stable `id`.
///
/// Deserializes from any JSON object carrying a string or numeric `id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct EntityRecord {
    id: EntityId,
    fields: Map<String, Value>,
}

impl EntityRecord {
    /// Build a record from a JSON object.
    pub fn from_value(value: Value) -> Result<Self, String> {
        Self::try_from(value)
    }

    /// Stable identifier.
    #[must_use]
    pub fn id(&self) -> &EntityId {
        &self.id
    }

    /// Read a top-level field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// All fields, including `id`.
    #[must_use]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

impl TryFrom<Value> for EntityRecord {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Object(fields) = value else {
            return Err("entity record must be a JSON object".into());
        };
        let id = match fields.get("id") {
            Some(Value::String(s)) if !s.is_empty() => EntityId::from(s.as_str()),
            Some(Value::Number(n)) => EntityId::from_string(n.to_string()),
            _ => return Err("entity record is missing a string or numeric `id`".into()),
        };
        Ok(Self { id, fields })
    }
}

impl From<EntityRecord> for Value {
    fn from(record: EntityRecord) -> Self {
        Value::Object(record.fields)
    }
}

/// Pointer to a single entity, used by `entity_viewed`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    /// Collection the entity lives in.
    pub kind: EntityKind,
    /// Entity identifier.
    pub id: EntityId,
}

impl EntityRef {
    /// Create a reference.
    pub fn new(kind: EntityKind, id: impl Into<EntityId>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

/// Public profile attached to presence and typing events.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Display name, if the account has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Account email.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl Profile {
    /// Create a profile with both fields set.
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            email: Some(email.into()),
        }
    }

    /// Name, falling back to email, falling back to the identity itself.
    #[must_use]
    pub fn display_name<'a>(&'a self, identity: &'a Identity) -> &'a str {
        self.name
            .as_deref()
            .filter(|n| !n.is_empty())
            .or(self.email.as_deref().filter(|e| !e.is_empty()))
            .unwrap_or(identity.as_str())
    }

    /// Upper-cased first character of the display name, for avatars.
    #[must_use]
    pub fn initial(&self, identity: &Identity) -> Option<char> {
        self.display_name(identity)
            .chars()
            .next()
            .and_then(|c| c.to_uppercase().next())
    }
}
