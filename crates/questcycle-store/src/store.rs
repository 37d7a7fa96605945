//! Progression store: backend contract and persistence workers.
//!
//! Backend calls run on dedicated worker threads. Each player is pinned to
//! one worker, so a player's loads and saves execute in submission order and
//! never overlap.

use crate::file::FileBackend;
use crate::record::StoredProgressionRecord;
use crate::sqlite::SqliteBackend;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use questcycle_common::{PersistenceError, PersistenceResult, PlayerId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Backend-agnostic persistence contract.
pub trait ProgressionBackend: Send + Sync + fmt::Debug {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Loads a player's snapshot, including category stats.
    /// `Ok(None)` means nothing was stored yet.
    fn load_snapshot(&self, player: PlayerId) -> PersistenceResult<Option<StoredProgressionRecord>>;

    /// Loads a player's lifetime achievements per category.
    fn load_category_stats(&self, player: PlayerId) -> PersistenceResult<BTreeMap<String, u32>>;

    /// Replaces the player's stored snapshot atomically. On error the
    /// previously stored snapshot is left intact.
    fn save(&self, player: PlayerId, record: &StoredProgressionRecord) -> PersistenceResult<()>;

    /// Players that have a stored snapshot.
    fn stored_players(&self) -> PersistenceResult<Vec<PlayerId>>;
}

/// Backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// SQLite database file.
    #[default]
    Sqlite,
    /// One JSON file per player.
    File,
}

/// Storage settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend to use.
    pub mode: StorageMode,
    /// Database file (sqlite) or directory (file).
    pub path: PathBuf,
    /// Number of persistence worker threads.
    pub workers: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: StorageMode::Sqlite,
            path: PathBuf::from("data/progression.db"),
            workers: 2,
        }
    }
}

impl StorageConfig {
    /// Opens the configured backend.
    pub fn open_backend(&self) -> PersistenceResult<Arc<dyn ProgressionBackend>> {
        Ok(match self.mode {
            StorageMode::Sqlite => Arc::new(SqliteBackend::open(&self.path)?),
            StorageMode::File => Arc::new(FileBackend::open(&self.path)?),
        })
    }
}

type Job = Box<dyn FnOnce(&dyn ProgressionBackend) + Send>;

/// Callback receiving the result of an asynchronous load.
pub type LoadCallback = Box<dyn FnOnce(PersistenceResult<Option<StoredProgressionRecord>>) + Send>;

/// A save handed to a worker whose outcome has not been collected yet.
#[derive(Debug)]
#[must_use = "the outcome of a pending save is only reported by `wait`"]
pub struct PendingSave(Pending);

#[derive(Debug)]
enum Pending {
    Done(PersistenceResult<()>),
    Queued(Receiver<PersistenceResult<()>>),
}

impl PendingSave {
    /// Blocks until the save has run and returns its outcome.
    pub fn wait(self) -> PersistenceResult<()> {
        match self.0 {
            Pending::Done(result) => result,
            Pending::Queued(result) => result
                .recv()
                .map_err(|_| PersistenceError::WorkerUnavailable)?,
        }
    }
}

/// Outcome of copying snapshots from another backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Conversion {
    /// Players copied
    pub converted: usize,
    /// Players whose snapshot could not be read or written
    pub failed: usize,
}

/// Persistence front end used by the rest of the system.
pub struct ProgressionStore {
    backend: Arc<dyn ProgressionBackend>,
    senders: RwLock<Vec<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for ProgressionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressionStore")
            .field("backend", &self.backend.name())
            .field("workers", &self.senders.read().len())
            .finish()
    }
}

impl ProgressionStore {
    /// Opens the configured backend and starts the workers.
    pub fn open(config: &StorageConfig) -> PersistenceResult<Self> {
        Self::with_backend(config.open_backend()?, config.workers)
    }

    /// Starts `workers` (at least one) worker threads over `backend`.
    pub fn with_backend(
        backend: Arc<dyn ProgressionBackend>,
        workers: usize,
    ) -> PersistenceResult<Self> {
        let workers = workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for index in 0..workers {
            let (sender, receiver) = unbounded::<Job>();
            let backend = Arc::clone(&backend);
            let handle = thread::Builder::new()
                .name(format!("questcycle-store-{index}"))
                .spawn(move || run_worker(index, backend, receiver))?;
            senders.push(sender);
            handles.push(handle);
        }

        info!(
            "Progression store started ({} backend, {} workers)",
            backend.name(),
            workers
        );

        Ok(Self {
            backend,
            senders: RwLock::new(senders),
            handles: Mutex::new(handles),
        })
    }

    /// Name of the backend in use.
    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Whether the workers are running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.senders.read().is_empty()
    }

    /// Loads a snapshot on the player's worker and hands it to `on_loaded`
    /// on that worker thread.
    pub fn load_async(&self, player: PlayerId, on_loaded: LoadCallback) -> PersistenceResult<()> {
        self.submit(
            player,
            Box::new(move |backend| {
                let result = backend.load_snapshot(player);
                if let Err(e) = &result {
                    error!(player = %player, "Failed to load progression: {}", e);
                }
                on_loaded(result);
            }),
        )
    }

    /// Loads a snapshot and waits for it.
    pub fn load_snapshot(
        &self,
        player: PlayerId,
    ) -> PersistenceResult<Option<StoredProgressionRecord>> {
        self.call(player, move |backend| backend.load_snapshot(player))
    }

    /// Loads a player's category stats and waits for them.
    pub fn load_category_stats(
        &self,
        player: PlayerId,
    ) -> PersistenceResult<BTreeMap<String, u32>> {
        self.call(player, move |backend| backend.load_category_stats(player))
    }

    /// Saves a player's snapshot.
    ///
    /// Asynchronous saves are queued on the player's worker and failures are
    /// logged there. Synchronous saves wait for completion and return the
    /// outcome; once the workers are stopped they run on the caller's thread.
    pub fn save_progression(
        &self,
        player: PlayerId,
        record: StoredProgressionRecord,
        synchronous: bool,
    ) -> PersistenceResult<()> {
        if synchronous {
            return self.queue_save(player, record)?.wait();
        }

        self.submit(
            player,
            Box::new(move |backend| {
                if let Err(e) = backend.save(player, &record) {
                    error!(player = %player, "Failed to save progression: {}", e);
                }
            }),
        )
    }

    /// Queues a save behind everything already queued for the player and
    /// returns without waiting for it. Once the workers are stopped the save
    /// runs on the caller's thread before this returns.
    pub fn queue_save(
        &self,
        player: PlayerId,
        record: StoredProgressionRecord,
    ) -> PersistenceResult<PendingSave> {
        if !self.is_running() {
            debug!(player = %player, "Workers stopped, saving inline");
            return Ok(PendingSave(Pending::Done(self.backend.save(player, &record))));
        }

        let (reply, result) = bounded(1);
        self.submit(
            player,
            Box::new(move |backend| {
                let _ = reply.send(backend.save(player, &record));
            }),
        )?;
        Ok(PendingSave(Pending::Queued(result)))
    }

    /// Copies every snapshot stored in `source` into this store. Each player
    /// is saved synchronously; players that fail are logged and counted.
    pub fn convert_from(&self, source: &dyn ProgressionBackend) -> PersistenceResult<Conversion> {
        let players = source.stored_players()?;
        info!(
            "Converting progression of {} players from {} to {}",
            players.len(),
            source.name(),
            self.backend_name()
        );

        let mut conversion = Conversion::default();
        for player in players {
            let copied = source.load_snapshot(player).and_then(|record| match record {
                Some(record) => self.save_progression(player, record, true).map(|()| true),
                None => Ok(false),
            });
            match copied {
                Ok(true) => conversion.converted += 1,
                Ok(false) => {},
                Err(e) => {
                    warn!(player = %player, "Failed to convert progression: {}", e);
                    conversion.failed += 1;
                },
            }
        }

        info!(
            "Converted {} players ({} failed)",
            conversion.converted, conversion.failed
        );
        Ok(conversion)
    }

    /// Waits until every job queued so far has run.
    pub fn flush(&self) {
        let senders = self.senders.read().clone();
        let waiters: Vec<Receiver<()>> = senders
            .iter()
            .filter_map(|sender| {
                let (done, wait) = bounded(1);
                let job: Job = Box::new(move |_| {
                    let _ = done.send(());
                });
                sender.send(job).ok().map(|()| wait)
            })
            .collect();

        for wait in waiters {
            let _ = wait.recv();
        }
    }

    /// Stops the workers after they drain their queues.
    pub fn shutdown(&self) {
        let senders = std::mem::take(&mut *self.senders.write());
        if senders.is_empty() {
            return;
        }
        drop(senders);

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                warn!("A persistence worker terminated abnormally");
            }
        }
        info!("Progression store stopped");
    }

    fn shard(&self, player: PlayerId, workers: usize) -> usize {
        let workers = workers.max(1) as u128;
        usize::try_from(player.uuid().as_u128() % workers).unwrap_or(0)
    }

    fn submit(&self, player: PlayerId, job: Job) -> PersistenceResult<()> {
        let senders = self.senders.read();
        let sender = senders
            .get(self.shard(player, senders.len()))
            .ok_or(PersistenceError::WorkerUnavailable)?;
        sender
            .send(job)
            .map_err(|_| PersistenceError::WorkerUnavailable)
    }

    /// Runs `f` on the player's worker and waits for the result, or inline
    /// when the workers are stopped.
    fn call<T, F>(&self, player: PlayerId, f: F) -> PersistenceResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ProgressionBackend) -> PersistenceResult<T> + Send + 'static,
    {
        if !self.is_running() {
            debug!(player = %player, "Workers stopped, running inline");
            return f(self.backend.as_ref());
        }

        let (reply, result) = bounded(1);
        self.submit(
            player,
            Box::new(move |backend| {
                let _ = reply.send(f(backend));
            }),
        )?;
        result
            .recv()
            .map_err(|_| PersistenceError::WorkerUnavailable)?
    }
}

impl Drop for ProgressionStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(index: usize, backend: Arc<dyn ProgressionBackend>, jobs: Receiver<Job>) {
    debug!("Persistence worker {} started", index);
    for job in jobs.iter() {
        if catch_unwind(AssertUnwindSafe(|| job(backend.as_ref()))).is_err() {
            error!("Persistence job panicked on worker {}", index);
        }
    }
    debug!("Persistence worker {} stopped", index);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::StoredQuestRow;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(advancement: u32) -> StoredProgressionRecord {
        StoredProgressionRecord {
            rows: vec![StoredQuestRow {
                sequence: 0,
                category: "easy".to_string(),
                quest_index: 0,
                advancement,
                required_amount: 100,
                reward_amount: Some(1.0),
                achieved: false,
                selected_required: None,
            }],
            ..StoredProgressionRecord::default()
        }
    }

    fn sqlite_store(workers: usize) -> ProgressionStore {
        let backend = Arc::new(SqliteBackend::open_in_memory().expect("open"));
        ProgressionStore::with_backend(backend, workers).expect("start")
    }

    #[test]
    fn test_async_saves_apply_in_order() {
        let store = sqlite_store(3);
        let player = PlayerId::random();

        for advancement in 0..20 {
            store
                .save_progression(player, record(advancement), false)
                .expect("queued");
        }
        let loaded = store.load_snapshot(player).expect("load").expect("present");
        assert_eq!(loaded.rows[0].advancement, 19);
    }

    #[test]
    fn test_load_async_callback() {
        let store = sqlite_store(2);
        let player = PlayerId::random();
        store.save_progression(player, record(4), true).expect("save");

        let (tx, rx) = bounded(1);
        store
            .load_async(
                player,
                Box::new(move |result| {
                    let _ = tx.send(result.map(|r| r.map(|r| r.rows[0].advancement)));
                }),
            )
            .expect("queued");
        assert_eq!(rx.recv().expect("callback ran").expect("loaded"), Some(4));

        assert!(store.load_snapshot(PlayerId::random()).expect("load").is_none());
    }

    #[test]
    fn test_file_backend_through_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = StorageConfig {
            mode: StorageMode::File,
            path: dir.path().to_path_buf(),
            workers: 1,
        };
        let store = ProgressionStore::open(&config).expect("open");
        assert_eq!(store.backend_name(), "file");

        let player = PlayerId::random();
        store.save_progression(player, record(7), false).expect("queued");
        store.flush();
        assert!(dir.path().join(format!("{player}.json")).exists());
    }

    #[test]
    fn test_sync_save_after_shutdown_runs_inline() {
        let store = sqlite_store(1);
        let player = PlayerId::random();
        store.shutdown();
        assert!(!store.is_running());

        store.save_progression(player, record(3), true).expect("inline save");
        assert_eq!(
            store.load_snapshot(player).expect("inline load").expect("present").rows[0].advancement,
            3
        );
        assert!(matches!(
            store.save_progression(player, record(4), false),
            Err(PersistenceError::WorkerUnavailable)
        ));
    }

    #[derive(Debug, Default)]
    struct FlakyBackend {
        calls: AtomicUsize,
    }

    impl ProgressionBackend for FlakyBackend {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn load_snapshot(&self, _: PlayerId) -> PersistenceResult<Option<StoredProgressionRecord>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first load explodes");
            }
            Ok(None)
        }

        fn load_category_stats(&self, _: PlayerId) -> PersistenceResult<BTreeMap<String, u32>> {
            Ok(BTreeMap::new())
        }

        fn save(&self, player: PlayerId, _: &StoredProgressionRecord) -> PersistenceResult<()> {
            Err(PersistenceError::Transaction {
                player: player.to_string(),
                reason: "disk full".to_string(),
            })
        }

        fn stored_players(&self) -> PersistenceResult<Vec<PlayerId>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_worker_survives_failures() {
        let store =
            ProgressionStore::with_backend(Arc::new(FlakyBackend::default()), 1).expect("start");
        let player = PlayerId::random();

        // The panicking job drops its reply sender.
        assert!(matches!(
            store.load_snapshot(player),
            Err(PersistenceError::WorkerUnavailable)
        ));
        assert!(matches!(
            store.save_progression(player, record(1), true),
            Err(PersistenceError::Transaction { .. })
        ));
        assert!(store.load_snapshot(player).expect("worker still alive").is_none());
    }

    #[test]
    fn test_storage_config_from_toml() {
        let config: StorageConfig = toml::from_str(
            r#"
            mode = "file"
            path = "progress"
            "#,
        )
        .expect("valid toml");
        assert_eq!(config.mode, StorageMode::File);
        assert_eq!(config.workers, 2);
    }

    #[test]
    fn test_queued_save_is_ordered_before_later_saves() {
        let store = sqlite_store(2);
        let player = PlayerId::random();

        let pending = store.queue_save(player, record(5)).expect("queued");
        store
            .save_progression(player, record(6), false)
            .expect("queued");
        pending.wait().expect("saved");
        store.flush();
        assert_eq!(
            store.load_snapshot(player).expect("load").expect("present").rows[0].advancement,
            6
        );
    }

    #[test]
    fn test_convert_file_progression_into_sqlite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let files = FileBackend::open(dir.path().join("progression")).expect("open files");
        let players = [PlayerId::random(), PlayerId::random()];
        for (advancement, player) in (3..).zip(players) {
            files.save(player, &record(advancement)).expect("save file");
        }
        // Not a player file.
        std::fs::write(dir.path().join("progression").join("notes.json"), "{}")
            .expect("write stray file");

        let store = ProgressionStore::open(&StorageConfig {
            mode: StorageMode::Sqlite,
            path: dir.path().join("progression.db"),
            workers: 1,
        })
        .expect("open sqlite");
        let conversion = store.convert_from(&files).expect("convert");
        assert_eq!(
            conversion,
            Conversion {
                converted: 2,
                failed: 0,
            }
        );

        for (advancement, player) in (3..).zip(players) {
            let stored = store.load_snapshot(player).expect("load").expect("converted");
            assert_eq!(stored.rows[0].advancement, advancement);
        }
    }
}
