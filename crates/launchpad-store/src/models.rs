//! Record structs persisted in the SQLite database.
//!
//! Messages are stored and returned as the canonical
//! [`launchpad_shared::types::Message`]; users carry more columns than the
//! messaging core needs, so they get their own record type.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use launchpad_shared::rows::UserRow;
use launchpad_shared::types::{placeholder_name, Participant, ParticipantId, Role};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A directory entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRecord {
    /// Integer row id, used for directory lookups.
    pub id: i64,
    /// Stable auth identity, used to address messages.
    pub uuid: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub role: Option<Role>,
    pub created_at: DateTime<Utc>,
}

impl UserRecord {
    /// Resolved directory view of this user.
    pub fn to_participant(&self) -> Participant {
        let id = self.id.to_string();
        let display_name = self
            .name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .or_else(|| self.email.clone().filter(|e| !e.trim().is_empty()))
            .unwrap_or_else(|| placeholder_name(&id));

        Participant {
            id,
            uuid: ParticipantId(self.uuid.clone()),
            display_name,
            role: self.role,
        }
    }
}

/// Input for [`crate::Database::upsert_user`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewUser {
    /// Explicit row id, when seeding from an external source.
    pub id: Option<i64>,
    pub uuid: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub role: Option<Role>,
}

impl NewUser {
    /// Build from a duck-typed backend row. Returns `None` when the row has
    /// neither a uuid nor an id to address the user by.
    pub fn from_row(row: UserRow) -> Option<Self> {
        let id = row.id.as_ref().and_then(|raw| match raw {
            launchpad_shared::rows::RawId::Int(n) => Some(*n),
            launchpad_shared::rows::RawId::Text(s) => s.trim().parse().ok(),
        });
        let name = [&row.name, &row.display_name, &row.display_name_camel]
            .into_iter()
            .flatten()
            .find(|n| !n.trim().is_empty())
            .cloned();
        let email = row.email.clone();
        let participant = row.normalize().ok()?;

        Some(Self {
            id,
            uuid: participant.uuid.0,
            name,
            email,
            role: participant.role,
        })
    }
}

/// Partial update applied by [`crate::Database::update_user`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct UserUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
}

impl UserUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.email.is_none() && self.role.is_none()
    }
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Fixed-width UTC form so that text ordering matches chronological ordering.
pub(crate) fn to_db_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn from_db_timestamp(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}
