//! Per-group renewal scheduler.
//!
//! One task per category group. Each task sleeps until its next tick,
//! renews the group for every connected player, then computes the following
//! tick from the current instant. Tasks never fire the same tick twice.

use crate::hooks::PlayerDirectory;
use crate::registry::RegistryError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use questcycle_common::PlayerId;
use questcycle_schedule::{
    format_interval, CategoryGroup, Clock, GroupRegistry, ScheduleSettings, TimestampMode,
};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Renews one group's quests for one player.
pub trait GroupRenewer: Send + Sync {
    /// Returns whether the player had quests to renew.
    fn renew_group(&self, player: PlayerId, group: &str) -> Result<bool, RegistryError>;
}

struct GroupTask {
    group: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    next: Arc<Mutex<Option<DateTime<Utc>>>>,
}

/// Runs one renewal task per category group.
pub struct GroupScheduler {
    runtime: Handle,
    clock: Arc<dyn Clock>,
    directory: Arc<dyn PlayerDirectory>,
    renewer: Arc<dyn GroupRenewer>,
    tasks: Mutex<Vec<GroupTask>>,
}

impl fmt::Debug for GroupScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupScheduler")
            .field("groups", &self.active_groups())
            .finish_non_exhaustive()
    }
}

impl GroupScheduler {
    /// Creates an idle scheduler whose tasks run on `runtime`.
    #[must_use]
    pub fn new(
        runtime: Handle,
        clock: Arc<dyn Clock>,
        directory: Arc<dyn PlayerDirectory>,
        renewer: Arc<dyn GroupRenewer>,
    ) -> Self {
        Self {
            runtime,
            clock,
            directory,
            renewer,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Starts a task for every group with a valid schedule. Groups with
    /// invalid schedules are logged and skipped. Nothing is scheduled in
    /// elapsed mode, where renewal happens on access.
    ///
    /// Returns the number of tasks started.
    pub fn start(&self, groups: &GroupRegistry, mode: TimestampMode) -> usize {
        if mode == TimestampMode::Elapsed {
            info!("Elapsed timestamp mode, quests renew on access; no renewal tasks started");
            return 0;
        }

        let mut tasks = self.tasks.lock();
        let before = tasks.len();
        for group in groups.groups() {
            let settings = match group.settings() {
                Ok(settings) => settings,
                Err(e) => {
                    error!(group = %group.name(), "Renewal disabled: {}", e);
                    continue;
                },
            };

            let cancel = CancellationToken::new();
            let next = Arc::new(Mutex::new(None));
            let handle = self.runtime.spawn(run_group(
                Arc::clone(group),
                settings,
                GroupContext {
                    clock: Arc::clone(&self.clock),
                    directory: Arc::clone(&self.directory),
                    renewer: Arc::clone(&self.renewer),
                    cancel: cancel.clone(),
                    next: Arc::clone(&next),
                },
            ));

            info!(
                group = %group.name(),
                "Renewal scheduled every {} from {} ({})",
                format_interval(settings.interval),
                settings.renew_time.format("%H:%M"),
                settings.zone
            );
            tasks.push(GroupTask {
                group: group.name().to_string(),
                cancel,
                handle,
                next,
            });
        }
        tasks.len() - before
    }

    /// Cancels every task. Returns the number cancelled.
    pub fn stop(&self) -> usize {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in &tasks {
            task.cancel.cancel();
            task.handle.abort();
            debug!(group = %task.group, "Renewal task cancelled");
        }
        tasks.len()
    }

    /// Cancels every task and starts new ones from `groups`.
    pub fn reload(&self, groups: &GroupRegistry, mode: TimestampMode) -> usize {
        let stopped = self.stop();
        let started = self.start(groups, mode);
        info!("Renewal tasks reloaded ({} stopped, {} started)", stopped, started);
        started
    }

    /// Next planned renewal of `group`, once its task has computed it.
    #[must_use]
    pub fn next_execution(&self, group: &str) -> Option<DateTime<Utc>> {
        self.tasks
            .lock()
            .iter()
            .find(|task| task.group == group)
            .and_then(|task| *task.next.lock())
    }

    /// Groups with a running task.
    #[must_use]
    pub fn active_groups(&self) -> Vec<String> {
        self.tasks
            .lock()
            .iter()
            .filter(|task| !task.handle.is_finished())
            .map(|task| task.group.clone())
            .collect()
    }
}

impl Drop for GroupScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

struct GroupContext {
    clock: Arc<dyn Clock>,
    directory: Arc<dyn PlayerDirectory>,
    renewer: Arc<dyn GroupRenewer>,
    cancel: CancellationToken,
    next: Arc<Mutex<Option<DateTime<Utc>>>>,
}

async fn run_group(group: Arc<CategoryGroup>, settings: ScheduleSettings, ctx: GroupContext) {
    let mut last_fired: Option<DateTime<Utc>> = None;

    loop {
        let now = ctx.clock.now();
        let next = match last_fired {
            None => settings.next_execution_at_or_after(now),
            Some(fired) => settings.next_execution_after(fired.max(now)),
        };
        *ctx.next.lock() = Some(next);
        debug!(group = %group.name(), "Next renewal at {}", next);

        // The clock may disagree with the timer, so wait until it agrees.
        loop {
            let wait = (next - ctx.clock.now()).to_std().unwrap_or(Duration::ZERO);
            if wait.is_zero() {
                break;
            }
            tokio::select! {
                biased;
                () = ctx.cancel.cancelled() => return,
                () = tokio::time::sleep(wait) => {},
            }
        }

        if ctx.cancel.is_cancelled() {
            return;
        }
        renew_online(&group, &ctx);
        last_fired = Some(next);
    }
}

fn renew_online(group: &CategoryGroup, ctx: &GroupContext) {
    let players = ctx.directory.online_players();
    let mut renewed = 0usize;

    for player in &players {
        if ctx.cancel.is_cancelled() {
            debug!(group = %group.name(), "Renewal cancelled midway");
            return;
        }
        match catch_unwind(AssertUnwindSafe(|| ctx.renewer.renew_group(*player, group.name()))) {
            Ok(Ok(true)) => renewed += 1,
            Ok(Ok(false)) => {},
            Ok(Err(e)) => warn!(player = %player, group = %group.name(), "Renewal failed: {}", e),
            Err(_) => error!(player = %player, group = %group.name(), "Renewal panicked"),
        }
    }

    info!(
        group = %group.name(),
        "Renewed quests for {} of {} online players",
        renewed,
        players.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::OnlinePlayers;
    use chrono::{NaiveTime, TimeDelta};
    use questcycle_schedule::RenewZone;

    #[derive(Debug)]
    struct TokioClock {
        base: DateTime<Utc>,
        start: tokio::time::Instant,
    }

    impl Clock for TokioClock {
        fn now(&self) -> DateTime<Utc> {
            self.base + TimeDelta::from_std(self.start.elapsed()).expect("in range")
        }
    }

    struct RecordingRenewer {
        clock: Arc<dyn Clock>,
        calls: Mutex<Vec<(PlayerId, String, DateTime<Utc>)>>,
        panic_for: Option<PlayerId>,
    }

    impl GroupRenewer for RecordingRenewer {
        fn renew_group(&self, player: PlayerId, group: &str) -> Result<bool, RegistryError> {
            if self.panic_for == Some(player) {
                panic!("renewal blew up");
            }
            self.calls
                .lock()
                .push((player, group.to_string(), self.clock.now()));
            Ok(true)
        }
    }

    struct Fixture {
        scheduler: GroupScheduler,
        renewer: Arc<RecordingRenewer>,
        players: Vec<PlayerId>,
        base: DateTime<Utc>,
    }

    fn fixture(panic_first: bool) -> Fixture {
        let base: DateTime<Utc> = "2026-05-11T10:30:00Z".parse().expect("valid timestamp");
        let clock: Arc<dyn Clock> = Arc::new(TokioClock {
            base,
            start: tokio::time::Instant::now(),
        });
        let directory = Arc::new(OnlinePlayers::new());
        let players = vec![PlayerId::random(), PlayerId::random()];
        for player in &players {
            directory.join(*player);
        }
        let renewer = Arc::new(RecordingRenewer {
            clock: Arc::clone(&clock),
            calls: Mutex::new(Vec::new()),
            panic_for: panic_first.then(|| players[0]),
        });
        let scheduler = GroupScheduler::new(
            Handle::current(),
            clock,
            directory,
            Arc::clone(&renewer) as Arc<dyn GroupRenewer>,
        );
        Fixture {
            scheduler,
            renewer,
            players,
            base,
        }
    }

    fn group(name: &str, interval: TimeDelta) -> CategoryGroup {
        CategoryGroup::new(
            name,
            vec![name.to_string()],
            ScheduleSettings::new(NaiveTime::MIN, interval, RenewZone::UTC),
        )
    }

    fn registry(groups: Vec<CategoryGroup>) -> GroupRegistry {
        GroupRegistry::from_groups(groups, false)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_renew_every_online_player() {
        let fx = fixture(false);
        let started = fx
            .scheduler
            .start(&registry(vec![group("hourly", TimeDelta::hours(1))]), TimestampMode::Anchored);
        assert_eq!(started, 1);

        tokio::time::sleep(Duration::from_secs(2 * 3600 + 60)).await;

        let calls = fx.renewer.calls.lock().clone();
        assert_eq!(calls.len(), 4);
        let first_tick = fx.base + TimeDelta::minutes(30);
        for (i, (player, group, at)) in calls.iter().enumerate() {
            let tick = first_tick + TimeDelta::hours((i / 2) as i64);
            assert_eq!(group, "hourly");
            assert!(fx.players.contains(player));
            assert!(*at >= tick && *at < tick + TimeDelta::seconds(1), "tick {i} fired at {at}");
        }
        assert_eq!(
            fx.scheduler.next_execution("hourly"),
            Some(first_tick + TimeDelta::hours(2))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_group_is_skipped() {
        let fx = fixture(false);
        let groups = registry(vec![
            group("broken", TimeDelta::zero()),
            group("hourly", TimeDelta::hours(1)),
        ]);
        assert_eq!(fx.scheduler.start(&groups, TimestampMode::Anchored), 1);
        assert_eq!(fx.scheduler.active_groups(), vec!["hourly".to_string()]);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(fx
            .renewer
            .calls
            .lock()
            .iter()
            .all(|(_, group, _)| group == "hourly"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_prevents_further_renewals() {
        let fx = fixture(false);
        fx.scheduler
            .start(&registry(vec![group("hourly", TimeDelta::hours(1))]), TimestampMode::Anchored);
        assert_eq!(fx.scheduler.stop(), 1);

        tokio::time::sleep(Duration::from_secs(3 * 3600)).await;
        assert!(fx.renewer.calls.lock().is_empty());
        assert!(fx.scheduler.next_execution("hourly").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_replaces_tasks() {
        let fx = fixture(false);
        fx.scheduler
            .start(&registry(vec![group("hourly", TimeDelta::hours(1))]), TimestampMode::Anchored);

        let started = fx.scheduler.reload(
            &registry(vec![
                group("daily", TimeDelta::days(1)),
                group("weekly", TimeDelta::days(7)),
            ]),
            TimestampMode::Anchored,
        );
        assert_eq!(started, 2);
        tokio::time::sleep(Duration::from_secs(2 * 3600)).await;
        assert!(fx.renewer.calls.lock().is_empty());

        assert_eq!(fx.scheduler.reload(&registry(vec![]), TimestampMode::Elapsed), 0);
        assert!(fx.scheduler.active_groups().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_renewal_keeps_task_alive() {
        let fx = fixture(true);
        fx.scheduler
            .start(&registry(vec![group("hourly", TimeDelta::hours(1))]), TimestampMode::Anchored);

        tokio::time::sleep(Duration::from_secs(2 * 3600)).await;

        let calls = fx.renewer.calls.lock().clone();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|(player, _, _)| *player == fx.players[1]));
        assert_eq!(fx.scheduler.active_groups(), vec!["hourly".to_string()]);
    }
}
