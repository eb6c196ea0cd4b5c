use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::PLACEHOLDER_NAME_PREFIX;

/// Auth-identity key used to address messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Message identifier.
///
/// Rows assigned by the persistent store carry an integer id. Messages the
/// client synthesizes before the store has echoed them carry a random UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Row(i64),
    Local(Uuid),
}

impl MessageId {
    pub fn new_local() -> Self {
        Self::Local(Uuid::new_v4())
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Row(id) => write!(f, "{id}"),
            Self::Local(id) => write!(f, "local:{id}"),
        }
    }
}

/// A single 1:1 message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: ParticipantId,
    pub receiver_id: ParticipantId,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn involves(&self, user: &ParticipantId) -> bool {
        &self.sender_id == user || &self.receiver_id == user
    }

    /// The other participant relative to `me`, or `None` if `me` is not
    /// part of this message.
    pub fn counterpart_of(&self, me: &ParticipantId) -> Option<&ParticipantId> {
        if &self.sender_id == me {
            Some(&self.receiver_id)
        } else if &self.receiver_id == me {
            Some(&self.sender_id)
        } else {
            None
        }
    }

    /// Whether this message belongs to the unordered pair `{a, b}`.
    pub fn is_between(&self, a: &ParticipantId, b: &ParticipantId) -> bool {
        (&self.sender_id == a && &self.receiver_id == b)
            || (&self.sender_id == b && &self.receiver_id == a)
    }

    pub fn is_optimistic(&self) -> bool {
        self.id.is_local()
    }

    /// Whether `self` is the persisted copy of the optimistic `other`.
    pub fn confirms(&self, other: &Message) -> bool {
        !self.is_optimistic()
            && other.is_optimistic()
            && self.sender_id == other.sender_id
            && self.receiver_id == other.receiver_id
            && self.body == other.body
    }
}

/// Portal role of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Role {
    Admin,
    Founder,
    Investor,
    Visitor,
}

impl Role {
    /// Lenient parse of the role strings stored by the backend.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Self::Admin,
            "founder" | "startup" => Self::Founder,
            "investor" => Self::Investor,
            _ => Self::Visitor,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Founder => "founder",
            Self::Investor => "investor",
            Self::Visitor => "visitor",
        }
    }

    /// Roles that can be offered as new conversation partners.
    pub fn is_messaging_eligible(&self) -> bool {
        matches!(self, Self::Founder | Self::Investor)
    }
}

impl From<String> for Role {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user as known to the directory.
///
/// `id` is the directory row id, `uuid` the auth identity used to address
/// messages. Rows without a separate auth identity use the same value for
/// both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub uuid: ParticipantId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

impl Participant {
    /// Participant synthesized for a key the directory does not know.
    pub fn placeholder(key: &str) -> Self {
        Self {
            id: key.to_string(),
            uuid: ParticipantId::new(key),
            display_name: placeholder_name(key),
            role: None,
        }
    }
}

pub fn placeholder_name(key: &str) -> String {
    format!("{PLACEHOLDER_NAME_PREFIX} {key}")
}

/// Derived per-counterpart summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub counterpart: Participant,
    pub last_message: Option<Message>,
}

impl Conversation {
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.last_message.as_ref().map(|m| m.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: i64, from: &str, to: &str) -> Message {
        Message {
            id: MessageId::Row(id),
            sender_id: from.into(),
            receiver_id: to.into(),
            body: "hello".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn counterpart_is_the_other_side() {
        let m = msg(1, "u", "a");
        assert_eq!(m.counterpart_of(&"u".into()), Some(&ParticipantId::from("a")));
        assert_eq!(m.counterpart_of(&"a".into()), Some(&ParticipantId::from("u")));
        assert_eq!(m.counterpart_of(&"b".into()), None);
    }

    #[test]
    fn pair_is_unordered() {
        let m = msg(1, "u", "a");
        assert!(m.is_between(&"a".into(), &"u".into()));
        assert!(m.is_between(&"u".into(), &"a".into()));
        assert!(!m.is_between(&"u".into(), &"b".into()));
    }

    #[test]
    fn message_id_accepts_numbers_and_uuids() {
        let row: MessageId = serde_json::from_str("42").unwrap();
        assert_eq!(row, MessageId::Row(42));

        let uuid = Uuid::new_v4();
        let local: MessageId = serde_json::from_str(&format!("\"{uuid}\"")).unwrap();
        assert_eq!(local, MessageId::Local(uuid));
    }

    #[test]
    fn persisted_copy_confirms_optimistic_entry() {
        let mut optimistic = msg(0, "u", "a");
        optimistic.id = MessageId::new_local();
        let echo = msg(7, "u", "a");

        assert!(echo.confirms(&optimistic));
        assert!(!optimistic.confirms(&echo));
    }

    #[test]
    fn role_parse_is_lenient() {
        assert_eq!(Role::parse("Founder"), Role::Founder);
        assert_eq!(Role::parse("startup"), Role::Founder);
        assert_eq!(Role::parse(" investor "), Role::Investor);
        assert_eq!(Role::parse("something"), Role::Visitor);

        let role: Role = serde_json::from_str("\"ADMIN\"").unwrap();
        assert_eq!(role, Role::Admin);
        assert_eq!(serde_json::to_string(&Role::Investor).unwrap(), "\"investor\"");
    }

    #[test]
    fn placeholder_uses_key_for_both_ids() {
        let p = Participant::placeholder("X");
        assert_eq!(p.display_name, "User X");
        assert_eq!(p.id, "X");
        assert_eq!(p.uuid, ParticipantId::from("X"));
    }
}
