//! Schema migrations, tracked with the `user_version` pragma.
//!
//! [`MIGRATIONS`] is applied in order on every open; entries at or below the
//! stored version are skipped.

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Migration = fn(&Connection) -> rusqlite::Result<()>;

/// `(version, name, up)` in ascending version order.
const MIGRATIONS: &[(u32, &str, Migration)] = &[(1, "v001_initial", v001_initial::up)];

pub fn current_version() -> u32 {
    MIGRATIONS.last().map_or(0, |(version, _, _)| *version)
}

/// Apply every migration newer than the database's `user_version`.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let applied: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    let target = current_version();

    if applied > target {
        return Err(StoreError::Migration(format!(
            "database schema v{applied} is newer than supported v{target}"
        )));
    }

    for (version, name, up) in MIGRATIONS.iter().filter(|(v, _, _)| *v > applied) {
        tracing::info!(version, migration = name, "applying migration");
        up(conn).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        conn.pragma_update(None, "user_version", version)?;
    }

    Ok(())
}
