//! Normalization of duck-typed backend rows.
//!
//! The hosted backend and older clients disagree on field names
//! (`message` vs `body`, `senderId` vs `sender_id`, numeric vs string ids).
//! Rows are mapped into the canonical [`Message`] / [`Participant`] types
//! exactly once, at the data-access edge.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::constants::MAX_MESSAGE_SIZE;
use crate::error::RowError;
use crate::types::{placeholder_name, Message, MessageId, Participant, ParticipantId, Role};

/// An id column that may be stored as a number or as text.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RawId {
    Int(i64),
    Text(String),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            Self::Int(n) => n.to_string(),
            Self::Text(s) => s,
        }
    }
}

/// A timestamp column stored either as text or as epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Millis(i64),
    Text(String),
}

/// A message row as any backend revision stored it.
///
/// Every alias is its own field so a row carrying two spellings of a
/// column still parses. The canonical spelling wins.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageRow {
    #[serde(default)]
    pub id: Option<RawId>,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default, rename = "senderId")]
    pub sender_id_camel: Option<String>,
    #[serde(default)]
    pub receiver_id: Option<String>,
    #[serde(default, rename = "receiverId")]
    pub receiver_id_camel: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub created_at: Option<RawTimestamp>,
    #[serde(default, rename = "createdAt")]
    pub created_at_camel: Option<RawTimestamp>,
}

impl MessageRow {
    pub fn normalize(self) -> Result<Message, RowError> {
        let id = parse_message_id(self.id.ok_or(RowError::MissingField("id"))?)?;
        let sender_id = non_empty(self.sender_id)
            .or_else(|| non_empty(self.sender_id_camel))
            .ok_or(RowError::MissingField("sender_id"))?;
        let receiver_id = non_empty(self.receiver_id)
            .or_else(|| non_empty(self.receiver_id_camel))
            .ok_or(RowError::MissingField("receiver_id"))?;
        if sender_id == receiver_id {
            return Err(RowError::SelfAddressed(sender_id));
        }

        let body = self
            .body
            .or(self.message)
            .or(self.content)
            .ok_or(RowError::MissingField("body"))?;
        validate_body(&body)?;

        let created_at =
            parse_timestamp(
                self.created_at
                    .or(self.created_at_camel)
                    .ok_or(RowError::MissingField("created_at"))?,
            )?;

        Ok(Message {
            id,
            sender_id: ParticipantId(sender_id),
            receiver_id: ParticipantId(receiver_id),
            body,
            created_at,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserRow {
    #[serde(default)]
    pub id: Option<RawId>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default, rename = "displayName")]
    pub display_name_camel: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

impl UserRow {
    pub fn normalize(self) -> Result<Participant, RowError> {
        let uuid = non_empty(self.uuid);
        let id = match self.id.map(RawId::into_string).filter(|s| !s.is_empty()) {
            Some(id) => id,
            None => uuid.clone().ok_or(RowError::MissingField("id"))?,
        };
        let uuid = uuid.unwrap_or_else(|| id.clone());

        let display_name = non_empty(self.name)
            .or_else(|| non_empty(self.display_name))
            .or_else(|| non_empty(self.display_name_camel))
            .or_else(|| non_empty(self.email))
            .unwrap_or_else(|| placeholder_name(&id));

        Ok(Participant {
            id,
            uuid: ParticipantId(uuid),
            display_name,
            role: non_empty(self.role).map(|r| Role::parse(&r)),
        })
    }
}

/// Check the body rules shared by every write path.
pub fn validate_body(body: &str) -> Result<(), RowError> {
    if body.trim().is_empty() {
        return Err(RowError::EmptyBody);
    }
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(RowError::BodyTooLarge {
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}

/// Normalize a batch of rows, splitting successes from rejected rows.
pub fn normalize_all<R, T>(
    rows: impl IntoIterator<Item = R>,
    normalize: impl Fn(R) -> Result<T, RowError>,
) -> (Vec<T>, Vec<RowError>) {
    let mut ok = Vec::new();
    let mut rejected = Vec::new();
    for row in rows {
        match normalize(row) {
            Ok(v) => ok.push(v),
            Err(e) => rejected.push(e),
        }
    }
    (ok, rejected)
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse_message_id(raw: RawId) -> Result<MessageId, RowError> {
    match raw {
        RawId::Int(n) => Ok(MessageId::Row(n)),
        RawId::Text(s) => {
            if let Ok(n) = s.trim().parse::<i64>() {
                return Ok(MessageId::Row(n));
            }
            Uuid::parse_str(s.trim())
                .map(MessageId::Local)
                .map_err(|_| RowError::InvalidId(s))
        }
    }
}

fn parse_timestamp(raw: RawTimestamp) -> Result<DateTime<Utc>, RowError> {
    match raw {
        RawTimestamp::Millis(ms) => {
            Utc.timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| RowError::InvalidTimestamp {
                    value: ms.to_string(),
                    reason: "out of range".into(),
                })
        }
        RawTimestamp::Text(s) => parse_timestamp_text(&s),
    }
}

fn parse_timestamp_text(s: &str) -> Result<DateTime<Utc>, RowError> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    // Postgres text form: "2024-05-01 10:00:00.123+00"
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Ok(dt.with_timezone(&Utc));
    }
    // Zone-less timestamps are UTC.
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc());
        }
    }
    Err(RowError::InvalidTimestamp {
        value: s.to_string(),
        reason: "unrecognized format".into(),
    })
}
