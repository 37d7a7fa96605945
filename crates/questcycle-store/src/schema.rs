//! SQLite schema and migrations.
//!
//! The base tables are the legacy layout (single timestamp and reroll counter
//! per player). Later versions only add columns, so a fresh database is
//! created at the legacy version and migrated forward like any other.

use questcycle_common::{PersistenceError, PersistenceResult, SchemaVersion};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

/// Legacy layout.
pub const BASE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS schema_meta (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS player (
  player_uuid TEXT PRIMARY KEY,
  player_timestamp INTEGER,
  achieved_quests INTEGER NOT NULL DEFAULT 0,
  total_achieved_quests INTEGER NOT NULL DEFAULT 0,
  recent_rerolls INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS progression (
  player_uuid TEXT NOT NULL,
  player_quest_id INTEGER NOT NULL,
  quest_index INTEGER NOT NULL,
  category TEXT NOT NULL,
  advancement INTEGER NOT NULL,
  required_amount INTEGER NOT NULL,
  reward_amount REAL,
  is_achieved INTEGER NOT NULL,
  selected_required INTEGER,
  PRIMARY KEY (player_uuid, player_quest_id)
);

CREATE TABLE IF NOT EXISTS player_category_stats (
  player_uuid TEXT NOT NULL,
  category TEXT NOT NULL,
  total_achieved_quests INTEGER NOT NULL,
  PRIMARY KEY (player_uuid, category)
);
"#;

/// Legacy layout to per-group timestamps and reroll counters.
const MIGRATE_TO_GROUPS: &str = r#"
ALTER TABLE player ADD COLUMN group_timestamps TEXT NOT NULL DEFAULT '{}';
ALTER TABLE player ADD COLUMN group_rerolls TEXT NOT NULL DEFAULT '{}';
"#;

/// Brings the database at `conn` to [`SchemaVersion::PROGRESSION`].
///
/// Returns the version found before migrating. The whole migration runs in
/// one transaction.
pub fn migrate(conn: &mut Connection) -> PersistenceResult<SchemaVersion> {
    let connection_error = |e: rusqlite::Error| PersistenceError::Connection(e.to_string());

    let tx = conn.transaction().map_err(connection_error)?;
    tx.execute_batch(BASE_SCHEMA).map_err(connection_error)?;

    let stored: Option<u32> = tx
        .query_row("SELECT version FROM schema_meta WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()
        .map_err(connection_error)?;
    let found = stored.map_or(SchemaVersion::LEGACY_PROGRESSION, SchemaVersion::from_packed);
    let target = SchemaVersion::PROGRESSION;

    if found > target || !target.can_migrate_from(&found) {
        return Err(PersistenceError::VersionMismatch {
            expected: target.to_string(),
            found: found.to_string(),
        });
    }

    if found.major < 2 {
        tx.execute_batch(MIGRATE_TO_GROUPS).map_err(connection_error)?;
        if stored.is_some() {
            info!("Migrated progression schema {} -> {}", found, target);
        }
    }

    tx.execute(
        "INSERT OR REPLACE INTO schema_meta (id, version) VALUES (1, ?1)",
        params![target.to_packed()],
    )
    .map_err(connection_error)?;
    tx.commit().map_err(connection_error)?;

    Ok(found)
}
