//! Host-side collaborators: who is online, how players are told things, and
//! how rewards are paid out.

use crate::catalog::QuestDef;
use parking_lot::RwLock;
use questcycle_common::{PlayerId, QuestKey};
use std::collections::HashSet;
use std::fmt;
use tracing::info;

/// Knows which players are connected.
pub trait PlayerDirectory: Send + Sync + fmt::Debug {
    /// Connected players.
    fn online_players(&self) -> Vec<PlayerId>;

    /// Whether `player` is connected.
    fn is_online(&self, player: PlayerId) -> bool {
        self.online_players().contains(&player)
    }
}

/// A directory the host updates as players join and leave.
#[derive(Debug, Default)]
pub struct OnlinePlayers {
    players: RwLock<HashSet<PlayerId>>,
}

impl OnlinePlayers {
    /// An empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `player` as connected.
    pub fn join(&self, player: PlayerId) {
        self.players.write().insert(player);
    }

    /// Marks `player` as disconnected.
    pub fn leave(&self, player: PlayerId) {
        self.players.write().remove(&player);
    }

    /// Number of connected players.
    #[must_use]
    pub fn len(&self) -> usize {
        self.players.read().len()
    }

    /// Whether nobody is connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.players.read().is_empty()
    }
}

impl PlayerDirectory for OnlinePlayers {
    fn online_players(&self) -> Vec<PlayerId> {
        self.players.read().iter().copied().collect()
    }

    fn is_online(&self, player: PlayerId) -> bool {
        self.players.read().contains(&player)
    }
}

/// Something a player is told about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// A group's quests were renewed.
    QuestsRenewed {
        /// Group name, or `None` for a full renewal
        group: Option<String>,
    },
    /// A quest was completed.
    QuestCompleted {
        /// The quest
        key: QuestKey,
    },
    /// A quest was rerolled.
    QuestRerolled {
        /// Quest replaced
        old: QuestKey,
        /// Quest drawn instead
        new: QuestKey,
    },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QuestsRenewed { group: Some(group) } => {
                write!(f, "Your {group} quests have been renewed")
            },
            Self::QuestsRenewed { group: None } => write!(f, "Your quests have been renewed"),
            Self::QuestCompleted { key } => write!(f, "Quest {key} completed"),
            Self::QuestRerolled { old, new } => write!(f, "Quest {old} was replaced by {new}"),
        }
    }
}

/// Delivers notices to players.
pub trait PlayerNotifier: Send + Sync + fmt::Debug {
    /// Tells `player` about `notice`.
    fn notify(&self, player: PlayerId, notice: &Notice);
}

/// Notifier that writes notices to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl PlayerNotifier for LogNotifier {
    fn notify(&self, player: PlayerId, notice: &Notice) {
        info!(player = %player, "{}", notice);
    }
}

/// Pays out quest rewards.
pub trait RewardDispatcher: Send + Sync + fmt::Debug {
    /// Called once when `player` completes `quest`. `amount` is the cached
    /// reward amount, if the quest has one.
    fn dispatch(&self, player: PlayerId, quest: &QuestDef, amount: Option<f64>);
}

/// Dispatcher that writes rewards to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogRewards;

impl RewardDispatcher for LogRewards {
    fn dispatch(&self, player: PlayerId, quest: &QuestDef, amount: Option<f64>) {
        match amount {
            Some(amount) => info!(
                player = %player,
                quest = %quest.key(),
                "Reward of {} for '{}'",
                amount,
                quest.name()
            ),
            None => info!(
                player = %player,
                quest = %quest.key(),
                "'{}' has no reward",
                quest.name()
            ),
        }
    }
}
