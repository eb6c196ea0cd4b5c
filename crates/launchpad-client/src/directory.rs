//! Display-name resolution.

use std::collections::HashMap;

use launchpad_shared::types::{Participant, ParticipantId};

/// Lookup table over the user directory, indexed by both the auth uuid and
/// the directory row id.
///
/// Resolution never fails: unknown keys get a placeholder participant named
/// `"User {key}"`.
#[derive(Debug, Clone, Default)]
pub struct Directory {
    users: Vec<Participant>,
    by_uuid: HashMap<ParticipantId, usize>,
    by_id: HashMap<String, usize>,
}

impl Directory {
    pub fn new(users: Vec<Participant>) -> Self {
        let mut by_uuid = HashMap::with_capacity(users.len());
        let mut by_id = HashMap::with_capacity(users.len());
        // First entry wins on duplicate keys.
        for (idx, user) in users.iter().enumerate() {
            by_uuid.entry(user.uuid.clone()).or_insert(idx);
            by_id.entry(user.id.clone()).or_insert(idx);
        }
        Self {
            users,
            by_uuid,
            by_id,
        }
    }

    pub fn users(&self) -> &[Participant] {
        &self.users
    }

    /// Find a user by auth uuid, falling back to the directory row id.
    ///
    /// Only for keys typed or picked by the user. Message addresses go
    /// through [`Directory::find`].
    pub fn lookup(&self, key: &str) -> Option<&Participant> {
        self.by_uuid
            .get(&ParticipantId::from(key))
            .or_else(|| self.by_id.get(key))
            .map(|&idx| &self.users[idx])
    }

    /// Find a user by auth uuid only.
    pub fn find(&self, uuid: &ParticipantId) -> Option<&Participant> {
        self.by_uuid.get(uuid).map(|&idx| &self.users[idx])
    }

    /// Resolve a message address to a participant. The returned uuid is
    /// always `uuid`.
    pub fn resolve(&self, uuid: &ParticipantId) -> Participant {
        self.find(uuid)
            .cloned()
            .unwrap_or_else(|| Participant::placeholder(uuid.as_str()))
    }

    pub fn display_name(&self, uuid: &ParticipantId) -> String {
        self.resolve(uuid).display_name
    }
}
