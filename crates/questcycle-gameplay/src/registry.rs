//! In-memory registry of connected players' quests.
//!
//! Each player has a slot guarded by its own mutex. Loads run on the
//! persistence workers and carry an epoch so a completion that arrives after
//! the player left, or reconnected, is dropped. Saves are queued while the
//! slot is locked, so a player's snapshots reach the store in the order they
//! were taken. Reward dispatch and notifications happen after the slot is
//! unlocked.

use crate::catalog::{QuestCatalog, QuestDef};
use crate::hooks::{Notice, PlayerNotifier, RewardDispatcher};
use crate::progression::{ActiveQuest, Advance, LifetimeTotals, PlayerQuestSet};
use crate::reconcile::{Reconciler, Reconciliation};
use crate::scheduler::GroupRenewer;
use crate::selection::QuestSelector;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use questcycle_common::{PersistenceResult, PlayerId, SchedulingError};
use questcycle_schedule::{Clock, GroupRegistry, TimestampMode};
use questcycle_store::{PendingSave, ProgressionStore, StoredProgressionRecord};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// Errors returned by registry operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The player's quests are not loaded.
    #[error("Quests of this player are not loaded")]
    NotLoaded,
    /// No quest at this position.
    #[error("No quest at position {index}")]
    NoSuchQuest {
        /// Position in the quest list
        index: usize,
    },
    /// The quest was replaced since the caller looked at it.
    #[error("Quest at position {index} was replaced")]
    Superseded {
        /// Position in the quest list
        index: usize,
    },
    /// Achieved quests cannot be rerolled.
    #[error("Quest at position {index} is already achieved")]
    AlreadyAchieved {
        /// Position in the quest list
        index: usize,
    },
    /// The group's reroll allowance is used up.
    #[error("Reroll limit of {maximum} reached for group '{group}'")]
    RerollLimit {
        /// Group name
        group: String,
        /// Rerolls allowed per cycle
        maximum: u32,
    },
    /// No other quest of the category is available.
    #[error("No replacement quest available in category '{category}'")]
    NoReplacement {
        /// Category name
        category: String,
    },
    /// No group with this name.
    #[error("Unknown group '{0}'")]
    UnknownGroup(String),
    /// The quest's category belongs to no group.
    #[error("Category '{0}' belongs to no group")]
    NoGroup(String),
    /// The group has no usable schedule.
    #[error(transparent)]
    Scheduling(#[from] SchedulingError),
}

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Registry tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrySettings {
    /// How renewal timestamps are judged
    pub mode: TimestampMode,
    /// Wait between connect and load
    pub load_delay: Duration,
    /// Rerolls per group and cycle; 0 is unlimited
    pub reroll_maximum: u32,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            mode: TimestampMode::Anchored,
            load_delay: Duration::ZERO,
            reroll_maximum: 0,
        }
    }
}

/// Collaborators the registry works with.
#[derive(Clone)]
pub struct RegistryServices {
    /// Persistence front end
    pub store: Arc<ProgressionStore>,
    /// Live quest catalog
    pub catalog: Arc<dyn QuestCatalog>,
    /// Quest drawing
    pub selector: Arc<dyn QuestSelector>,
    /// Category groups
    pub groups: Arc<GroupRegistry>,
    /// Time source
    pub clock: Arc<dyn Clock>,
    /// Player notices
    pub notifier: Arc<dyn PlayerNotifier>,
    /// Reward payout
    pub rewards: Arc<dyn RewardDispatcher>,
}

enum PlayerSlot {
    Loading { epoch: u64 },
    Active(PlayerQuestSet),
    Closed,
}

#[derive(Default)]
struct Effects {
    notices: Vec<Notice>,
    rewards: Vec<(Arc<QuestDef>, Option<f64>)>,
    dirty: bool,
}

struct Inner {
    players: DashMap<PlayerId, Arc<Mutex<PlayerSlot>>>,
    epoch: AtomicU64,
    services: RegistryServices,
    reconciler: Reconciler,
    settings: RegistrySettings,
    runtime: Handle,
}

/// Connected players' quests.
#[derive(Clone)]
pub struct ActiveQuestRegistry {
    inner: Arc<Inner>,
}

impl fmt::Debug for ActiveQuestRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveQuestRegistry")
            .field("players", &self.inner.players.len())
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl ActiveQuestRegistry {
    /// Creates an empty registry. Delayed loads are spawned on `runtime`.
    #[must_use]
    pub fn new(services: RegistryServices, settings: RegistrySettings, runtime: Handle) -> Self {
        let reconciler = Reconciler::new(
            Arc::clone(&services.catalog),
            Arc::clone(&services.groups),
            settings.mode,
        );
        Self {
            inner: Arc::new(Inner {
                players: DashMap::new(),
                epoch: AtomicU64::new(0),
                services,
                reconciler,
                settings,
                runtime,
            }),
        }
    }

    /// Starts loading a player's quests after the configured delay.
    pub fn on_connect(&self, player: PlayerId) {
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner
            .players
            .insert(player, Arc::new(Mutex::new(PlayerSlot::Loading { epoch })));

        let delay = self.inner.settings.load_delay;
        if delay.is_zero() {
            Inner::begin_load(&self.inner, player, epoch);
            return;
        }

        let inner = Arc::downgrade(&self.inner);
        self.inner.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                Inner::begin_load(&inner, player, epoch);
            }
        });
    }

    /// Saves the player's quests synchronously and forgets them.
    pub fn on_disconnect(&self, player: PlayerId) -> PersistenceResult<()> {
        let Some((_, slot)) = self.inner.players.remove(&player) else {
            return Ok(());
        };

        let pending = {
            let mut guard = slot.lock();
            match std::mem::replace(&mut *guard, PlayerSlot::Closed) {
                PlayerSlot::Active(set) => {
                    Some(self.inner.services.store.queue_save(player, set.to_record())?)
                },
                PlayerSlot::Loading { .. } => {
                    debug!(player = %player, "Left before quests were loaded");
                    None
                },
                PlayerSlot::Closed => None,
            }
        };

        if let Some(pending) = pending {
            pending.wait()?;
            info!(player = %player, "Saved quests on disconnect");
        }
        Ok(())
    }

    /// Whether the player's quests are loaded.
    #[must_use]
    pub fn is_loaded(&self, player: PlayerId) -> bool {
        self.inner
            .slot(player)
            .is_some_and(|slot| matches!(*slot.lock(), PlayerSlot::Active(_)))
    }

    /// Players whose quests are loaded.
    #[must_use]
    pub fn loaded_players(&self) -> Vec<PlayerId> {
        let slots: Vec<_> = self
            .inner
            .players
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        slots
            .into_iter()
            .filter(|(_, slot)| matches!(*slot.lock(), PlayerSlot::Active(_)))
            .map(|(player, _)| player)
            .collect()
    }

    /// Copies of the player's quests, in order.
    pub fn quests(&self, player: PlayerId) -> RegistryResult<Vec<ActiveQuest>> {
        self.inner
            .with_active(player, |set, _| Ok(set.quests().to_vec()))
    }

    /// Copy of the player's whole quest set.
    pub fn snapshot(&self, player: PlayerId) -> RegistryResult<PlayerQuestSet> {
        self.inner.with_active(player, |set, _| Ok(set.clone()))
    }

    /// Adds progress to the quest at `index`. Completing the quest
    /// dispatches its reward once.
    pub fn record_progress(
        &self,
        player: PlayerId,
        index: usize,
        amount: u32,
    ) -> RegistryResult<Advance> {
        let inner = &self.inner;
        inner.with_active(player, |set, effects| {
            inner.advance(set, effects, index, amount)
        })
    }

    /// Adds progress to every unfinished quest matching `action` and
    /// `target`. Returns how many quests advanced.
    pub fn record_action(
        &self,
        player: PlayerId,
        action: &str,
        target: Option<&str>,
        amount: u32,
    ) -> RegistryResult<usize> {
        let inner = &self.inner;
        inner.with_active(player, |set, effects| {
            let matching: Vec<usize> = set
                .quests()
                .iter()
                .enumerate()
                .filter(|(_, quest)| !quest.progression().is_achieved())
                .filter(|(_, quest)| {
                    inner.services.catalog.resolve(quest.key()).is_some_and(|def| {
                        def.kind()
                            .matches(action, target, quest.progression().selected_required())
                    })
                })
                .map(|(index, _)| index)
                .collect();

            for &index in &matching {
                inner.advance(set, effects, index, amount)?;
            }
            Ok(matching.len())
        })
    }

    /// Replaces the quest at `index`, which the caller saw with `serial`.
    ///
    /// Fails with [`RegistryError::Superseded`] when the quest was replaced
    /// in the meantime, e.g. by a renewal.
    pub fn reroll(
        &self,
        player: PlayerId,
        index: usize,
        serial: u64,
    ) -> RegistryResult<ActiveQuest> {
        let inner = &self.inner;
        inner.with_active(player, |set, effects| {
            let quest = set.quest(index).ok_or(RegistryError::NoSuchQuest { index })?;
            if quest.serial() != serial {
                return Err(RegistryError::Superseded { index });
            }
            if quest.progression().is_achieved() {
                return Err(RegistryError::AlreadyAchieved { index });
            }

            let category = quest.key().category.clone();
            let group = inner
                .services
                .groups
                .group_for_category(&category)
                .ok_or_else(|| RegistryError::NoGroup(category.clone()))?;
            let maximum = inner.settings.reroll_maximum;
            if maximum > 0 && set.rerolls(group.name()) >= maximum {
                return Err(RegistryError::RerollLimit {
                    group: group.name().to_string(),
                    maximum,
                });
            }

            let replacement = inner
                .services
                .selector
                .select_replacement(player, &category, &set.keys())
                .ok_or(RegistryError::NoReplacement { category })?;
            let old = set
                .reroll(index, replacement, group.name())
                .ok_or(RegistryError::NoSuchQuest { index })?;
            let new = set
                .quest(index)
                .cloned()
                .ok_or(RegistryError::NoSuchQuest { index })?;

            debug!(player = %player, old = %old.key(), new = %new.key(), "Rerolled quest");
            effects.notices.push(Notice::QuestRerolled {
                old: old.key().clone(),
                new: new.key().clone(),
            });
            effects.dirty = true;
            Ok(new)
        })
    }

    /// Replaces the quests of one group. Returns `false` when the player's
    /// quests are not loaded.
    pub fn renew_group(&self, player: PlayerId, group: &str) -> RegistryResult<bool> {
        let inner = &self.inner;
        let group = inner
            .services
            .groups
            .group(group)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownGroup(group.to_string()))?;

        let renewed = inner.with_active(player, |set, effects| {
            let draw = inner
                .services
                .selector
                .select_random_quests_for_group(player, &group);
            set.replace_group(&group, draw, inner.services.clock.now());
            effects.notices.push(Notice::QuestsRenewed {
                group: Some(group.name().to_string()),
            });
            effects.dirty = true;
            Ok(())
        });
        not_loaded_is_false(renewed)
    }

    /// Replaces every quest. Returns `false` when the player's quests are
    /// not loaded.
    pub fn renew_all(&self, player: PlayerId) -> RegistryResult<bool> {
        let inner = &self.inner;
        let renewed = inner.with_active(player, |set, effects| {
            let draw = inner.services.selector.select_random_quests(player);
            set.replace_all(draw, &inner.services.groups, inner.services.clock.now());
            effects.notices.push(Notice::QuestsRenewed { group: None });
            effects.dirty = true;
            Ok(())
        });
        not_loaded_is_false(renewed)
    }

    /// Milliseconds until `group` renews for the player.
    pub fn time_until_renewal(&self, player: PlayerId, group: &str) -> RegistryResult<u64> {
        let inner = &self.inner;
        let settings = inner
            .services
            .groups
            .group(group)
            .ok_or_else(|| RegistryError::UnknownGroup(group.to_string()))?
            .settings()?;

        inner.with_active(player, |set, _| {
            Ok(settings.millis_until_renewal(
                inner.settings.mode,
                set.renewed_at(group),
                inner.services.clock.now(),
            ))
        })
    }

    /// Saves every loaded player. Returns the number of saves that
    /// succeeded (or were queued).
    pub fn save_all(&self, synchronous: bool) -> usize {
        let store = &self.inner.services.store;
        let mut saved = 0;
        for player in self.loaded_players() {
            let Some(slot) = self.inner.slot(player) else {
                continue;
            };
            let queued = {
                let guard = slot.lock();
                let PlayerSlot::Active(set) = &*guard else {
                    continue;
                };
                if synchronous {
                    store.queue_save(player, set.to_record()).map(Some)
                } else {
                    store
                        .save_progression(player, set.to_record(), false)
                        .map(|()| None)
                }
            };

            match queued.and_then(|pending| pending.map_or(Ok(()), PendingSave::wait)) {
                Ok(()) => saved += 1,
                Err(e) => error!(player = %player, "Failed to save quests: {}", e),
            }
        }
        info!("Saved quests of {} players", saved);
        saved
    }

    /// Saves everyone synchronously and empties the registry.
    pub fn shutdown(&self) {
        self.save_all(true);
        for entry in self.inner.players.iter() {
            *entry.value().lock() = PlayerSlot::Closed;
        }
        self.inner.players.clear();
    }
}

impl GroupRenewer for ActiveQuestRegistry {
    fn renew_group(&self, player: PlayerId, group: &str) -> Result<bool, RegistryError> {
        ActiveQuestRegistry::renew_group(self, player, group)
    }
}

fn not_loaded_is_false(result: RegistryResult<()>) -> RegistryResult<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(RegistryError::NotLoaded) => Ok(false),
        Err(e) => Err(e),
    }
}

impl Inner {
    fn slot(&self, player: PlayerId) -> Option<Arc<Mutex<PlayerSlot>>> {
        self.players.get(&player).map(|entry| Arc::clone(entry.value()))
    }

    fn is_current(&self, player: PlayerId, epoch: u64) -> bool {
        self.slot(player)
            .is_some_and(|slot| is_loading(&slot.lock(), epoch))
    }

    fn begin_load(this: &Arc<Self>, player: PlayerId, epoch: u64) {
        if !this.is_current(player, epoch) {
            debug!(player = %player, "Skipping load for a stale connection");
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(this);
        let queued = this.services.store.load_async(
            player,
            Box::new(move |loaded| {
                if let Some(inner) = weak.upgrade() {
                    inner.finish_load(player, epoch, loaded);
                }
            }),
        );

        if let Err(e) = queued {
            error!(player = %player, "Failed to queue quest load: {}", e);
            this.drop_loading(player, epoch);
        }
    }

    fn finish_load(
        &self,
        player: PlayerId,
        epoch: u64,
        loaded: PersistenceResult<Option<StoredProgressionRecord>>,
    ) {
        let Some(slot) = self.slot(player) else {
            debug!(player = %player, "Discarding load for a player who left");
            return;
        };

        let mut guard = slot.lock();
        if !is_loading(&guard, epoch) {
            debug!(player = %player, "Discarding stale load");
            return;
        }

        let stored = match loaded {
            Ok(stored) => stored,
            Err(e) => {
                error!(
                    player = %player,
                    "Quests could not be loaded and stay unavailable until reconnect: {}",
                    e
                );
                drop(guard);
                self.drop_loading(player, epoch);
                return;
            },
        };

        let now = self.services.clock.now();
        let (set, renewed) = match stored {
            None => {
                info!(player = %player, "No stored quests, drawing new ones");
                let set = self.fresh_set(player, LifetimeTotals::default(), now);
                (set, vec![Notice::QuestsRenewed { group: None }])
            },
            Some(record) => match self.reconciler.reconcile(player, &record, now) {
                Reconciliation::Adopt { mut set, due } => {
                    let renewed = self.renew_due(player, &mut set, &due, now);
                    (set, renewed)
                },
                Reconciliation::Regenerate { totals, .. } => {
                    let set = self.fresh_set(player, totals, now);
                    (set, vec![Notice::QuestsRenewed { group: None }])
                },
            },
        };

        if !renewed.is_empty() {
            self.queue_save(player, &set);
        }
        let count = set.quests().len();
        *guard = PlayerSlot::Active(set);
        drop(guard);

        for notice in &renewed {
            self.services.notifier.notify(player, notice);
        }
        info!(player = %player, quests = count, "Quests loaded");
    }

    /// Replaces the quests of the groups that fell due while the player was
    /// away, leaving the other groups as stored.
    fn renew_due(
        &self,
        player: PlayerId,
        set: &mut PlayerQuestSet,
        due: &[String],
        now: DateTime<Utc>,
    ) -> Vec<Notice> {
        let mut renewed = Vec::with_capacity(due.len());
        for name in due {
            let Some(group) = self.services.groups.group(name) else {
                continue;
            };
            let draw = self.services.selector.select_random_quests_for_group(player, group);
            set.replace_group(group, draw, now);
            debug!(player = %player, group = %name, "Renewed group on load");
            renewed.push(Notice::QuestsRenewed {
                group: Some(name.clone()),
            });
        }
        renewed
    }

    fn drop_loading(&self, player: PlayerId, epoch: u64) {
        self.players
            .remove_if(&player, |_, slot| is_loading(&slot.lock(), epoch));
    }

    fn fresh_set(
        &self,
        player: PlayerId,
        totals: LifetimeTotals,
        now: DateTime<Utc>,
    ) -> PlayerQuestSet {
        let draw = self.services.selector.select_random_quests(player);
        PlayerQuestSet::fresh(draw, &self.services.groups, totals, now)
    }

    /// Queues an asynchronous save. Callers hold the player's slot lock.
    fn queue_save(&self, player: PlayerId, set: &PlayerQuestSet) {
        if let Err(e) = self
            .services
            .store
            .save_progression(player, set.to_record(), false)
        {
            error!(player = %player, "Failed to queue quest save: {}", e);
        }
    }

    /// Runs `f` on the player's loaded set and queues a save if it changed
    /// anything. Rewards and notices go out once the slot is unlocked.
    fn with_active<R>(
        &self,
        player: PlayerId,
        f: impl FnOnce(&mut PlayerQuestSet, &mut Effects) -> RegistryResult<R>,
    ) -> RegistryResult<R> {
        let slot = self.slot(player).ok_or(RegistryError::NotLoaded)?;
        let mut effects = Effects::default();

        let result = {
            let mut guard = slot.lock();
            let PlayerSlot::Active(set) = &mut *guard else {
                return Err(RegistryError::NotLoaded);
            };
            if self.settings.mode == TimestampMode::Elapsed {
                self.renew_elapsed(player, set, &mut effects);
            }
            let result = f(set, &mut effects);
            if effects.dirty {
                self.queue_save(player, set);
            }
            result
        };

        self.apply(player, effects);
        result
    }

    fn renew_elapsed(&self, player: PlayerId, set: &mut PlayerQuestSet, effects: &mut Effects) {
        let now = self.services.clock.now();
        for group in self.services.groups.groups() {
            let Ok(settings) = group.settings() else {
                continue;
            };
            if !settings.is_due(TimestampMode::Elapsed, set.renewed_at(group.name()), now) {
                continue;
            }

            let draw = self
                .services
                .selector
                .select_random_quests_for_group(player, group);
            set.replace_group(group, draw, now);
            debug!(player = %player, group = %group.name(), "Renewed on access");
            effects.notices.push(Notice::QuestsRenewed {
                group: Some(group.name().to_string()),
            });
            effects.dirty = true;
        }
    }

    fn advance(
        &self,
        set: &mut PlayerQuestSet,
        effects: &mut Effects,
        index: usize,
        amount: u32,
    ) -> RegistryResult<Advance> {
        let advance = set
            .advance(index, amount)
            .ok_or(RegistryError::NoSuchQuest { index })?;
        if !advance.newly_achieved {
            return Ok(advance);
        }

        let quest = set.quest(index).ok_or(RegistryError::NoSuchQuest { index })?;
        let key = quest.key().clone();
        match self.services.catalog.resolve(&key) {
            Some(def) => effects.rewards.push((def, quest.progression().reward_amount())),
            None => warn!(quest = %key, "Completed quest is missing from the catalog, no reward"),
        }
        effects.notices.push(Notice::QuestCompleted { key });
        effects.dirty = true;
        Ok(advance)
    }

    fn apply(&self, player: PlayerId, effects: Effects) {
        for (def, amount) in &effects.rewards {
            self.services.rewards.dispatch(player, def, *amount);
        }
        for notice in &effects.notices {
            self.services.notifier.notify(player, notice);
        }
    }
}

fn is_loading(slot: &PlayerSlot, epoch: u64) -> bool {
    matches!(slot, PlayerSlot::Loading { epoch: e } if *e == epoch)
}
