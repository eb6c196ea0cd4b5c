use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::params;

use launchpad_shared::error::RowError;
use launchpad_shared::rows::validate_body;
use launchpad_shared::types::{Message, MessageId, ParticipantId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{from_db_timestamp, to_db_timestamp};

const MESSAGE_COLUMNS: &str = "id, sender_id, receiver_id, body, created_at";

impl Database {
    /// Persist a new message stamped with the current time.
    pub fn insert_message(
        &self,
        sender: &ParticipantId,
        receiver: &ParticipantId,
        body: &str,
    ) -> Result<Message> {
        self.insert_message_at(sender, receiver, body, Utc::now())
    }

    /// Persist a new message with an explicit timestamp.
    pub fn insert_message_at(
        &self,
        sender: &ParticipantId,
        receiver: &ParticipantId,
        body: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Message> {
        if sender == receiver {
            return Err(RowError::SelfAddressed(sender.to_string()).into());
        }
        validate_body(body)?;
        // Stored with microsecond precision; echo what a later read returns.
        let created_at = created_at.trunc_subsecs(6);

        self.conn().execute(
            "INSERT INTO messages (sender_id, receiver_id, body, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                sender.as_str(),
                receiver.as_str(),
                body,
                to_db_timestamp(&created_at),
            ],
        )?;

        Ok(Message {
            id: MessageId::Row(self.conn().last_insert_rowid()),
            sender_id: sender.clone(),
            receiver_id: receiver.clone(),
            body: body.to_string(),
            created_at,
        })
    }

    /// Every message where `user` is sender or receiver, newest first.
    pub fn messages_for_participant(&self, user: &ParticipantId) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE sender_id = ?1 OR receiver_id = ?1
             ORDER BY created_at DESC, id DESC"
        ))?;

        let rows = stmt.query_map(params![user.as_str()], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// The thread between `a` and `b` in both directions, oldest first.
    pub fn messages_between(&self, a: &ParticipantId, b: &ParticipantId) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE (sender_id = ?1 AND receiver_id = ?2)
                OR (sender_id = ?2 AND receiver_id = ?1)
             ORDER BY created_at ASC, id ASC"
        ))?;

        let rows = stmt.query_map(params![a.as_str(), b.as_str()], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn get_message_by_id(&self, id: i64) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id: i64 = row.get(0)?;
    let sender: String = row.get(1)?;
    let receiver: String = row.get(2)?;
    let body: String = row.get(3)?;
    let ts_str: String = row.get(4)?;

    Ok(Message {
        id: MessageId::Row(id),
        sender_id: ParticipantId(sender),
        receiver_id: ParticipantId(receiver),
        body,
        created_at: from_db_timestamp(4, &ts_str)?,
    })
}
