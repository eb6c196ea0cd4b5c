//! Directory operations for [`UserRecord`] rows.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use launchpad_shared::types::Role;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{from_db_timestamp, to_db_timestamp, NewUser, UserRecord, UserUpdate};

const USER_COLUMNS: &str = "id, uuid, name, email, role, created_at";

impl Database {
    /// Insert a user, or update name/email/role of the user with the same uuid.
    pub fn upsert_user(&self, user: &NewUser) -> Result<UserRecord> {
        self.conn().execute(
            "INSERT INTO users (id, uuid, name, email, role, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(uuid) DO UPDATE SET
                 name  = excluded.name,
                 email = excluded.email,
                 role  = excluded.role",
            params![
                user.id,
                user.uuid,
                user.name,
                user.email,
                user.role.map(|r| r.as_str()),
                to_db_timestamp(&Utc::now()),
            ],
        )?;
        self.get_user_by_uuid(&user.uuid)
    }

    /// List every user, ordered by row id.
    pub fn list_users(&self) -> Result<Vec<UserRecord>> {
        let mut stmt = self
            .conn()
            .prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY id ASC"))?;

        let rows = stmt.query_map([], row_to_user)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    pub fn get_user_by_uuid(&self, uuid: &str) -> Result<UserRecord> {
        self.conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE uuid = ?1"),
                params![uuid],
                row_to_user,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Apply a partial update. Returns `None` if no user has this uuid.
    pub fn update_user(&self, uuid: &str, update: &UserUpdate) -> Result<Option<UserRecord>> {
        let exists = self
            .conn()
            .query_row("SELECT 1 FROM users WHERE uuid = ?1", params![uuid], |_| Ok(()))
            .optional()?
            .is_some();
        if !exists {
            return Ok(None);
        }

        self.conn().execute(
            "UPDATE users SET
                 name  = COALESCE(?2, name),
                 email = COALESCE(?3, email),
                 role  = COALESCE(?4, role)
             WHERE uuid = ?1",
            params![
                uuid,
                update.name,
                update.email,
                update.role.map(|r| r.as_str()),
            ],
        )?;

        self.get_user_by_uuid(uuid).map(Some)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    let role: Option<String> = row.get(4)?;
    let created_str: String = row.get(5)?;

    Ok(UserRecord {
        id: row.get(0)?,
        uuid: row.get(1)?,
        name: row.get(2)?,
        email: row.get(3)?,
        role: role.map(|r| Role::parse(&r)),
        created_at: from_db_timestamp(5, &created_str)?,
    })
}
