//! Directory seeding from a JSON file of user rows.
//!
//! Accepts either a bare array or `{ "users": [...] }`, with the same field
//! aliases as the client (`displayName`, numeric or string ids, ...).

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use tracing::{info, warn};

use launchpad_shared::rows::UserRow;
use launchpad_store::{Database, NewUser};

#[derive(Deserialize)]
#[serde(untagged)]
enum SeedFile {
    Wrapped { users: Vec<UserRow> },
    Bare(Vec<UserRow>),
}

/// Parse seed rows, skipping rows without a usable id.
pub fn parse_seed(json: &str) -> anyhow::Result<Vec<NewUser>> {
    let rows = match serde_json::from_str::<SeedFile>(json).context("Invalid seed file")? {
        SeedFile::Wrapped { users } => users,
        SeedFile::Bare(users) => users,
    };
    let total = rows.len();
    let users: Vec<NewUser> = rows.into_iter().filter_map(NewUser::from_row).collect();
    if users.len() < total {
        warn!(skipped = total - users.len(), "Skipped seed rows without an id");
    }
    Ok(users)
}

/// Upsert every user in the seed file. Returns the number of users written.
pub fn seed_users(db: &Database, path: &Path) -> anyhow::Result<usize> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let users = parse_seed(&json)?;
    for user in &users {
        db.upsert_user(user)
            .with_context(|| format!("Failed to seed user {}", user.uuid))?;
    }
    info!(path = %path.display(), count = users.len(), "Seeded user directory");
    Ok(users.len())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use launchpad_shared::types::Role;

    use super::*;

    #[test]
    fn test_parse_both_shapes() {
        let wrapped = parse_seed(r#"{"users":[{"id":1,"uuid":"U","name":"Una"}]}"#).unwrap();
        assert_eq!(wrapped.len(), 1);
        assert_eq!(wrapped[0].id, Some(1));

        let bare = parse_seed(r#"[{"id":"7","displayName":"Ivo","role":"startup"},{"name":"x"}]"#)
            .unwrap();
        assert_eq!(bare.len(), 1);
        assert_eq!(bare[0].uuid, "7");
        assert_eq!(bare[0].role, Some(Role::Founder));
    }

    #[test]
    fn test_seed_users_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"id":1,"uuid":"U","name":"Una"}},{{"id":2,"uuid":"A","email":"a@example.org"}}]"#
        )
        .unwrap();

        let db = Database::open_in_memory().unwrap();
        assert_eq!(seed_users(&db, file.path()).unwrap(), 2);

        let users = db.list_users().unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[1].to_participant().display_name, "a@example.org");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let db = Database::open_in_memory().unwrap();
        assert!(seed_users(&db, Path::new("/nonexistent/users.json")).is_err());
    }
}
