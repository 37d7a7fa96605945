//! Line-based developer console.
//!
//! The `questcycle` binary has no game attached, so players, progress and
//! renewals are driven by typing commands. Player arguments accept a full
//! UUID or a unique prefix of a connected player's UUID.

use crate::context::QuestCycle;
use anyhow::{anyhow, bail, Context as _, Result};
use questcycle_common::PlayerId;
use questcycle_schedule::format_remaining;
use questcycle_store::{StorageConfig, StorageMode};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Text shown by `help`.
pub const HELP: &str = "\
Commands:
  join [uuid]                          connect a player (random id if omitted)
  quit <player>                        disconnect a player
  players                              list connected players
  quests <player>                      show a player's quests
  progress <player> <index> <amount>   add progress to one quest
  action <player> <ACTION> [target] [amount]
                                       add progress to every matching quest
  reroll <player> <index>              replace one quest
  renew <player> [group]               renew one group, or everything
  save                                 save every loaded player
  convert <sqlite|file> <path>         copy stored progression into the store
  reload                               reload config, catalog and storage
  help                                 show this text
  exit                                 save and stop";

/// A parsed console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Connect a player
    Join(Option<String>),
    /// Disconnect a player
    Quit(String),
    /// List connected players
    Players,
    /// Show a player's quests
    Quests(String),
    /// Add progress to one quest
    Progress {
        /// Player argument
        player: String,
        /// Quest position
        index: usize,
        /// Amount added
        amount: u32,
    },
    /// Add progress to every matching quest
    Action {
        /// Player argument
        player: String,
        /// Action tag
        action: String,
        /// Optional target
        target: Option<String>,
        /// Amount added
        amount: u32,
    },
    /// Replace one quest
    Reroll {
        /// Player argument
        player: String,
        /// Quest position
        index: usize,
    },
    /// Renew one group, or all of them
    Renew {
        /// Player argument
        player: String,
        /// Group, or `None` for all
        group: Option<String>,
    },
    /// Save every loaded player
    Save,
    /// Copy another backend's snapshots into the store
    Convert {
        /// Source backend
        mode: StorageMode,
        /// Source database file or directory, relative to the config file
        path: PathBuf,
    },
    /// Reload everything
    Reload,
    /// Show the command list
    Help,
    /// Stop
    Exit,
}

/// What the console loop should do after a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Print this and keep reading
    Output(String),
    /// Stop reading
    Exit,
}

fn arg<'a>(words: &[&'a str], i: usize, what: &str) -> Result<&'a str> {
    words
        .get(i)
        .copied()
        .ok_or_else(|| anyhow!("missing {what}"))
}

fn number<T: std::str::FromStr>(raw: &str, what: &str) -> Result<T> {
    raw.parse().map_err(|_| anyhow!("invalid {what} '{raw}'"))
}

impl Command {
    /// Parses one input line. Empty lines parse to `None`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&head, _)) = words.split_first() else {
            return Ok(None);
        };
        let player = |i| arg(&words, i, "player").map(str::to_string);

        let command = match head.to_ascii_lowercase().as_str() {
            "join" => Self::Join(words.get(1).map(|s| (*s).to_string())),
            "quit" => Self::Quit(player(1)?),
            "players" => Self::Players,
            "quests" => Self::Quests(player(1)?),
            "progress" => Self::Progress {
                player: player(1)?,
                index: number(arg(&words, 2, "index")?, "index")?,
                amount: number(arg(&words, 3, "amount")?, "amount")?,
            },
            "action" => {
                // `action <player> <ACTION> [target] [amount]`: a trailing
                // number is the amount.
                let mut rest: Vec<&str> = words.iter().skip(3).copied().collect();
                let amount = match rest.last().map(|s| s.parse::<u32>()) {
                    Some(Ok(amount)) => {
                        rest.pop();
                        amount
                    },
                    _ => 1,
                };
                if rest.len() > 1 {
                    bail!("too many arguments");
                }
                Self::Action {
                    player: player(1)?,
                    action: arg(&words, 2, "action")?.to_ascii_uppercase(),
                    target: rest.first().map(|s| s.to_ascii_uppercase()),
                    amount,
                }
            },
            "reroll" => Self::Reroll {
                player: player(1)?,
                index: number(arg(&words, 2, "index")?, "index")?,
            },
            "renew" => Self::Renew {
                player: player(1)?,
                group: words.get(2).map(|s| (*s).to_string()),
            },
            "save" => Self::Save,
            "convert" => Self::Convert {
                mode: match arg(&words, 1, "backend")?.to_ascii_lowercase().as_str() {
                    "sqlite" => StorageMode::Sqlite,
                    "file" => StorageMode::File,
                    other => bail!("unknown backend '{other}', expected sqlite or file"),
                },
                path: PathBuf::from(arg(&words, 2, "path")?),
            },
            "reload" => Self::Reload,
            "help" | "?" => Self::Help,
            "exit" | "stop" => Self::Exit,
            other => bail!("unknown command '{other}', try 'help'"),
        };
        Ok(Some(command))
    }
}

/// Finds a connected player by UUID or unique UUID prefix.
fn resolve_player(cycle: &QuestCycle, raw: &str) -> Result<PlayerId> {
    if let Ok(player) = raw.parse::<PlayerId>() {
        return Ok(player);
    }
    let matches: Vec<PlayerId> = cycle
        .online_players()
        .into_iter()
        .filter(|p| p.to_string().starts_with(raw))
        .collect();
    match matches.as_slice() {
        [player] => Ok(*player),
        [] => bail!("no connected player matches '{raw}'"),
        _ => bail!("'{raw}' matches {} players", matches.len()),
    }
}

fn describe_quests(cycle: &QuestCycle, player: PlayerId) -> Result<String> {
    let registry = cycle.registry();
    let set = registry.snapshot(player)?;
    let mut out = String::new();

    for (index, quest) in set.quests().iter().enumerate() {
        let progression = quest.progression();
        let name = cycle
            .catalog()
            .resolve(quest.key())
            .map_or_else(|| "<removed>".to_string(), |def| def.name().to_string());
        writeln!(
            out,
            "  [{index}] {} {name}: {}/{} ({:?})",
            quest.key(),
            progression.advancement(),
            progression.required_amount(),
            progression.state()
        )?;
    }

    for group in cycle.groups().group_names() {
        let remaining = registry.time_until_renewal(player, group)?;
        writeln!(
            out,
            "  {group}: renews in {}, {} rerolls used",
            format_remaining(remaining, "a few seconds"),
            set.rerolls(group)
        )?;
    }
    write!(
        out,
        "  achieved {} (lifetime {})",
        set.achieved_quests(),
        set.totals().total_achieved_quests
    )?;
    Ok(out)
}

/// Runs one command against `cycle`.
pub fn execute(cycle: &mut QuestCycle, command: Command) -> Result<Reply> {
    let output = match command {
        Command::Join(raw) => {
            let player = match raw {
                Some(raw) => raw
                    .parse::<PlayerId>()
                    .with_context(|| format!("invalid uuid '{raw}'"))?,
                None => PlayerId::random(),
            };
            cycle.player_join(player);
            format!("{player} joined")
        },
        Command::Quit(raw) => {
            let player = resolve_player(cycle, &raw)?;
            cycle.player_quit(player)?;
            format!("{player} left")
        },
        Command::Players => {
            let registry = cycle.registry();
            let mut out = String::new();
            for player in cycle.online_players() {
                let state = if registry.is_loaded(player) { "loaded" } else { "loading" };
                writeln!(out, "  {player} ({state})")?;
            }
            write!(out, "{} connected", cycle.online_players().len())?;
            out
        },
        Command::Quests(raw) => {
            let player = resolve_player(cycle, &raw)?;
            describe_quests(cycle, player)?
        },
        Command::Progress { player, index, amount } => {
            let player = resolve_player(cycle, &player)?;
            let advance = cycle.registry().record_progress(player, index, amount)?;
            let done = if advance.newly_achieved { ", completed" } else { "" };
            format!("quest {index}: {}/{}{done}", advance.advancement, advance.required_amount)
        },
        Command::Action {
            player,
            action,
            target,
            amount,
        } => {
            let player = resolve_player(cycle, &player)?;
            let advanced = cycle
                .registry()
                .record_action(player, &action, target.as_deref(), amount)?;
            format!("{advanced} quests advanced")
        },
        Command::Reroll { player, index } => {
            let player = resolve_player(cycle, &player)?;
            let registry = cycle.registry();
            let serial = registry
                .quests(player)?
                .get(index)
                .map(questcycle_gameplay::ActiveQuest::serial)
                .ok_or_else(|| anyhow!("no quest at index {index}"))?;
            let quest = registry.reroll(player, index, serial)?;
            format!("quest {index} is now {}", quest.key())
        },
        Command::Renew { player, group } => {
            let player = resolve_player(cycle, &player)?;
            let renewed = match &group {
                Some(group) => cycle.registry().renew_group(player, group)?,
                None => cycle.registry().renew_all(player)?,
            };
            if renewed {
                "renewed".to_string()
            } else {
                "player quests are not loaded".to_string()
            }
        },
        Command::Save => format!("{} players saved", cycle.registry().save_all(true)),
        Command::Convert { mode, path } => {
            let base = cycle.config_path().parent().unwrap_or_else(|| Path::new("."));
            let source = StorageConfig {
                mode,
                path: base.join(path),
                workers: 1,
            }
            .open_backend()?;
            let conversion = cycle.store().convert_from(source.as_ref())?;
            format!(
                "{} players converted, {} failed",
                conversion.converted, conversion.failed
            )
        },
        Command::Reload => {
            cycle.reload()?;
            "reloaded".to_string()
        },
        Command::Help => HELP.to_string(),
        Command::Exit => return Ok(Reply::Exit),
    };
    Ok(Reply::Output(output))
}
