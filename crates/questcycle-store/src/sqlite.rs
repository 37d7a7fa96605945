//! SQLite progression backend.

use crate::record::{StoredProgressionRecord, StoredQuestRow};
use crate::schema;
use crate::store::ProgressionBackend;
use parking_lot::Mutex;
use questcycle_common::{PersistenceError, PersistenceResult, PlayerId};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

const SELECT_PLAYER: &str = "SELECT player_timestamp, group_timestamps, achieved_quests, \
     total_achieved_quests, recent_rerolls, group_rerolls FROM player WHERE player_uuid = ?1";

const SELECT_ROWS: &str = "SELECT player_quest_id, quest_index, category, advancement, \
     required_amount, reward_amount, is_achieved, selected_required FROM progression \
     WHERE player_uuid = ?1 ORDER BY player_quest_id";

const SELECT_PLAYERS: &str = "SELECT player_uuid FROM player ORDER BY player_uuid";

const SELECT_STATS: &str =
    "SELECT category, total_achieved_quests FROM player_category_stats WHERE player_uuid = ?1";

const UPSERT_PLAYER: &str = "INSERT OR REPLACE INTO player (player_uuid, player_timestamp, \
     group_timestamps, achieved_quests, total_achieved_quests, recent_rerolls, group_rerolls) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";

const INSERT_ROW: &str = "INSERT INTO progression (player_uuid, player_quest_id, quest_index, \
     category, advancement, required_amount, reward_amount, is_achieved, selected_required) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";

const INSERT_STAT: &str = "INSERT INTO player_category_stats (player_uuid, category, \
     total_achieved_quests) VALUES (?1, ?2, ?3)";

/// Progression backend on a single SQLite connection.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteBackend").finish_non_exhaustive()
    }
}

impl SqliteBackend {
    /// Opens (and migrates) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> PersistenceResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn =
            Connection::open(path).map_err(|e| PersistenceError::Connection(e.to_string()))?;
        let backend = Self::from_connection(conn)?;
        info!("Opened progression database {:?}", path);
        Ok(backend)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> PersistenceResult<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| PersistenceError::Connection(e.to_string()))?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> PersistenceResult<Self> {
        schema::migrate(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

struct PlayerRow {
    legacy_timestamp: Option<i64>,
    group_timestamps: String,
    achieved_quests: u32,
    total_achieved_quests: u32,
    legacy_rerolls: u32,
    group_rerolls: String,
}

impl ProgressionBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn load_snapshot(
        &self,
        player: PlayerId,
    ) -> PersistenceResult<Option<StoredProgressionRecord>> {
        let uuid = player.to_string();
        let conn = self.conn.lock();
        let read_error =
            |e: rusqlite::Error| PersistenceError::Corrupted(format!("player {uuid}: {e}"));

        let Some(head) = conn
            .query_row(SELECT_PLAYER, params![uuid], |row| {
                Ok(PlayerRow {
                    legacy_timestamp: row.get(0)?,
                    group_timestamps: row.get(1)?,
                    achieved_quests: row.get(2)?,
                    total_achieved_quests: row.get(3)?,
                    legacy_rerolls: row.get(4)?,
                    group_rerolls: row.get(5)?,
                })
            })
            .optional()
            .map_err(read_error)?
        else {
            return Ok(None);
        };

        let mut stmt = conn.prepare_cached(SELECT_ROWS).map_err(read_error)?;
        let rows = stmt
            .query_map(params![uuid], |row| {
                Ok(StoredQuestRow {
                    sequence: row.get(0)?,
                    quest_index: row.get(1)?,
                    category: row.get(2)?,
                    advancement: row.get(3)?,
                    required_amount: row.get(4)?,
                    reward_amount: row.get(5)?,
                    achieved: row.get(6)?,
                    selected_required: row.get(7)?,
                })
            })
            .map_err(read_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(read_error)?;
        drop(stmt);

        let category_stats = read_stats(&conn, &uuid)?;

        let legacy_layout = head.group_timestamps == "{}";
        let record = StoredProgressionRecord {
            legacy_timestamp: head.legacy_timestamp,
            timestamps_by_group: decode_map(&head.group_timestamps, &uuid)?,
            achieved_quests: head.achieved_quests,
            total_achieved_quests: head.total_achieved_quests,
            legacy_rerolls: legacy_layout.then_some(head.legacy_rerolls),
            rerolls_by_group: decode_map(&head.group_rerolls, &uuid)?,
            rows,
            category_stats,
        };

        debug!(player = %player, rows = record.rows.len(), "Loaded progression snapshot");
        Ok(Some(record))
    }

    fn load_category_stats(&self, player: PlayerId) -> PersistenceResult<BTreeMap<String, u32>> {
        let conn = self.conn.lock();
        read_stats(&conn, &player.to_string())
    }

    fn save(&self, player: PlayerId, record: &StoredProgressionRecord) -> PersistenceResult<()> {
        let uuid = player.to_string();
        let failed = |e: rusqlite::Error| PersistenceError::Transaction {
            player: uuid.clone(),
            reason: e.to_string(),
        };

        let group_timestamps = encode_map(&record.timestamps_by_group)?;
        let group_rerolls = encode_map(&record.rerolls_by_group)?;

        let mut conn = self.conn.lock();
        // Dropping the transaction without commit rolls it back.
        let tx = conn.transaction().map_err(failed)?;

        tx.execute("DELETE FROM progression WHERE player_uuid = ?1", params![uuid])
            .map_err(failed)?;
        tx.execute("DELETE FROM player_category_stats WHERE player_uuid = ?1", params![uuid])
            .map_err(failed)?;
        tx.execute(
            UPSERT_PLAYER,
            params![
                uuid,
                record.legacy_timestamp,
                group_timestamps,
                record.achieved_quests,
                record.total_achieved_quests,
                record.legacy_rerolls.unwrap_or(0),
                group_rerolls,
            ],
        )
        .map_err(failed)?;

        {
            let mut insert = tx.prepare_cached(INSERT_ROW).map_err(failed)?;
            for row in &record.rows {
                insert
                    .execute(params![
                        uuid,
                        row.sequence,
                        row.quest_index,
                        row.category,
                        row.advancement,
                        row.required_amount,
                        row.reward_amount,
                        row.achieved,
                        row.selected_required,
                    ])
                    .map_err(failed)?;
            }

            let mut insert = tx.prepare_cached(INSERT_STAT).map_err(failed)?;
            for (category, total) in &record.category_stats {
                insert
                    .execute(params![uuid, category, total])
                    .map_err(failed)?;
            }
        }

        tx.commit().map_err(failed)?;
        debug!(player = %player, rows = record.rows.len(), "Saved progression");
        Ok(())
    }

    fn stored_players(&self) -> PersistenceResult<Vec<PlayerId>> {
        let conn = self.conn.lock();
        let read_error = |e: rusqlite::Error| PersistenceError::Corrupted(e.to_string());
        let mut stmt = conn.prepare_cached(SELECT_PLAYERS).map_err(read_error)?;
        let uuids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(read_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(read_error)?;
        uuids
            .iter()
            .map(|uuid| {
                uuid.parse()
                    .map_err(|e| PersistenceError::Corrupted(format!("player {uuid}: {e}")))
            })
            .collect()
    }
}

fn read_stats(conn: &Connection, uuid: &str) -> PersistenceResult<BTreeMap<String, u32>> {
    let read_error =
        |e: rusqlite::Error| PersistenceError::Corrupted(format!("player {uuid}: {e}"));
    let mut stmt = conn.prepare_cached(SELECT_STATS).map_err(read_error)?;
    let stats = stmt
        .query_map(params![uuid], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)))
        .map_err(read_error)?
        .collect::<Result<BTreeMap<_, _>, _>>()
        .map_err(read_error)?;
    Ok(stats)
}

fn encode_map<V: serde::Serialize>(map: &BTreeMap<String, V>) -> PersistenceResult<String> {
    serde_json::to_string(map).map_err(|e| PersistenceError::Serialization(e.to_string()))
}

fn decode_map<V: serde::de::DeserializeOwned>(
    raw: &str,
    uuid: &str,
) -> PersistenceResult<BTreeMap<String, V>> {
    serde_json::from_str(raw)
        .map_err(|e| PersistenceError::Corrupted(format!("player {uuid}: {e}")))
}
