//! JSON file progression backend.
//!
//! One file per player. Saves write a temp file and rename it over the old
//! one, so a reader sees either the old or the new snapshot.

use crate::record::StoredProgressionRecord;
use crate::store::ProgressionBackend;
use questcycle_common::{PersistenceError, PersistenceResult, PlayerId, SchemaVersion};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// On-disk envelope of a player file.
#[derive(Debug, Serialize, Deserialize)]
struct ProgressionFile {
    /// Packed [`SchemaVersion`].
    version: u32,
    record: StoredProgressionRecord,
}

/// Progression backend storing one JSON file per player.
#[derive(Debug)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Opens the backend, creating `dir` if needed.
    pub fn open(dir: impl AsRef<Path>) -> PersistenceResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
            info!("Created progression directory: {:?}", dir);
        }
        Ok(Self { dir })
    }

    /// Directory holding the player files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn player_path(&self, player: PlayerId) -> PathBuf {
        self.dir.join(format!("{player}.json"))
    }

    fn temp_path(&self, player: PlayerId) -> PathBuf {
        self.dir.join(format!("{player}.json.tmp"))
    }

    fn read(&self, player: PlayerId) -> PersistenceResult<Option<StoredProgressionRecord>> {
        let file = match File::open(self.player_path(player)) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let stored: ProgressionFile = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| PersistenceError::Corrupted(format!("player {player}: {e}")))?;

        let found = SchemaVersion::from_packed(stored.version);
        if !SchemaVersion::PROGRESSION.can_migrate_from(&found) {
            return Err(PersistenceError::VersionMismatch {
                expected: SchemaVersion::PROGRESSION.to_string(),
                found: found.to_string(),
            });
        }

        Ok(Some(stored.record))
    }
}

impl ProgressionBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn load_snapshot(
        &self,
        player: PlayerId,
    ) -> PersistenceResult<Option<StoredProgressionRecord>> {
        let record = self.read(player)?;
        if let Some(record) = &record {
            debug!(player = %player, rows = record.rows.len(), "Loaded progression file");
        }
        Ok(record)
    }

    fn load_category_stats(&self, player: PlayerId) -> PersistenceResult<BTreeMap<String, u32>> {
        Ok(self
            .read(player)?
            .map(|record| record.category_stats)
            .unwrap_or_default())
    }

    fn save(&self, player: PlayerId, record: &StoredProgressionRecord) -> PersistenceResult<()> {
        let temp_path = self.temp_path(player);
        let final_path = self.player_path(player);
        let failed = |reason: String| PersistenceError::Transaction {
            player: player.to_string(),
            reason,
        };

        let envelope = ProgressionFile {
            version: SchemaVersion::PROGRESSION.to_packed(),
            record: record.clone(),
        };

        let written = File::create(&temp_path)
            .map_err(|e| failed(e.to_string()))
            .and_then(|file| {
                let mut writer = BufWriter::new(file);
                serde_json::to_writer_pretty(&mut writer, &envelope)
                    .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
                writer.flush().map_err(|e| failed(e.to_string()))
            });

        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }

        fs::rename(&temp_path, &final_path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            failed(e.to_string())
        })?;

        debug!(player = %player, "Saved progression file");
        Ok(())
    }

    fn stored_players(&self) -> PersistenceResult<Vec<PlayerId>> {
        let mut players = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()).map(str::parse::<PlayerId>) {
                Some(Ok(player)) => players.push(player),
                _ => debug!("Skipping {:?}, not a player file", path),
            }
        }
        players.sort();
        Ok(players)
    }
}
