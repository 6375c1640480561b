//! Cron-based dispatch for scheduled transactions.
//!
//! Each task owns a loop: sleep until the next fire, run the thunk to
//! completion, repeat. Fires that became due while the thunk was still
//! running are skipped, so runs of one task never overlap. Distinct tasks
//! run in parallel. Panics inside a thunk are contained and logged.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

use crate::error::SchedulerError;

/// A snapshot of a registered task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub id: u64,
    pub schedule: String,
}

/// A parsed schedule spec: `@every <duration>` or a cron expression.
///
/// Cron expressions take the seconds-resolution form; the plain 5-field form
/// is accepted and normalized to fire at second zero.
#[derive(Clone)]
enum Cadence {
    Every(Duration),
    Cron(Box<cron::Schedule>),
}

impl Cadence {
    fn parse(spec: &str) -> Result<Self, SchedulerError> {
        if let Some(interval) = spec.strip_prefix("@every") {
            let interval = humantime::parse_duration(interval.trim()).map_err(|e| {
                SchedulerError::InvalidSchedule {
                    spec: spec.to_string(),
                    message: e.to_string(),
                }
            })?;
            if interval.is_zero() {
                return Err(SchedulerError::InvalidSchedule {
                    spec: spec.to_string(),
                    message: "interval must be non-zero".to_string(),
                });
            }
            return Ok(Cadence::Every(interval));
        }

        let normalized = if spec.split_whitespace().count() == 5 {
            format!("0 {spec}")
        } else {
            spec.to_string()
        };

        let schedule =
            cron::Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidSchedule {
                spec: spec.to_string(),
                message: e.to_string(),
            })?;
        Ok(Cadence::Cron(Box::new(schedule)))
    }

    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Cadence::Every(interval) => {
                Some(after + chrono::Duration::from_std(*interval).ok()?)
            }
            Cadence::Cron(schedule) => schedule.after(&after).next(),
        }
    }
}

/// Validate a schedule spec without registering anything.
pub fn validate_spec(spec: &str) -> Result<(), SchedulerError> {
    Cadence::parse(spec).map(|_| ())
}

struct TaskEntry {
    id: u64,
    schedule: String,
    cancel: CancellationToken,
}

/// Scheduler for transaction tasks.
pub struct Scheduler {
    tasks: Mutex<HashMap<String, TaskEntry>>,
    next_id: AtomicU64,
    tracker: TaskTracker,
    root: CancellationToken,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            tracker: TaskTracker::new(),
            root: CancellationToken::new(),
        }
    }

    /// Register a task under `name` firing per `spec`.
    ///
    /// Fails with `TaskAlreadyExists` when the name is taken and
    /// `InvalidSchedule` when the spec does not parse.
    pub fn add_task<F, Fut>(&self, name: &str, spec: &str, thunk: F) -> Result<(), SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cadence = Cadence::parse(spec)?;

        let mut tasks = self.tasks.lock().expect("scheduler lock poisoned");
        if tasks.contains_key(name) {
            return Err(SchedulerError::TaskAlreadyExists(name.to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = self.root.child_token();
        tasks.insert(
            name.to_string(),
            TaskEntry {
                id,
                schedule: spec.to_string(),
                cancel: cancel.clone(),
            },
        );

        self.tracker
            .spawn(task_loop(name.to_string(), cadence, thunk, cancel));
        Ok(())
    }

    /// Unregister the task. Fails with `NoSuchTask` when absent. A run that
    /// is currently in flight finishes normally; no further fires happen.
    pub fn remove_task(&self, name: &str) -> Result<(), SchedulerError> {
        let mut tasks = self.tasks.lock().expect("scheduler lock poisoned");
        let entry = tasks
            .remove(name)
            .ok_or_else(|| SchedulerError::NoSuchTask(name.to_string()))?;
        entry.cancel.cancel();
        Ok(())
    }

    /// Snapshot of all registered tasks.
    pub fn entries(&self) -> Vec<Entry> {
        let tasks = self.tasks.lock().expect("scheduler lock poisoned");
        tasks
            .iter()
            .map(|(name, entry)| Entry {
                name: name.clone(),
                id: entry.id,
                schedule: entry.schedule.clone(),
            })
            .collect()
    }

    /// Prevent all further fires. The returned handle completes once every
    /// thunk that was running when `stop` was called has returned.
    pub fn stop(&self) -> StopHandle {
        self.root.cancel();
        self.tracker.close();
        StopHandle {
            tracker: self.tracker.clone(),
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Completion handle returned by [`Scheduler::stop`].
pub struct StopHandle {
    tracker: TaskTracker,
}

impl StopHandle {
    pub async fn wait(self) {
        self.tracker.wait().await;
    }
}

async fn task_loop<F, Fut>(name: String, cadence: Cadence, thunk: F, cancel: CancellationToken)
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        let now = Utc::now();
        let Some(fire_at) = cadence.next_after(now) else {
            debug!(task = %name, "schedule has no further fires");
            break;
        };
        let delay = (fire_at - now).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        // Spawned so a panicking thunk surfaces as a JoinError here instead
        // of tearing down the loop.
        let run = tokio::spawn(thunk());
        if let Err(join_error) = run.await
            && join_error.is_panic()
        {
            error!(task = %name, "recovered from panic in scheduled task");
        }

        if let Some(missed) = cadence.next_after(fire_at)
            && missed < Utc::now()
        {
            debug!(task = %name, "skipping fires missed while previous run was in flight");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn parses_interval_and_cron_specs() {
        assert!(validate_spec("@every 1s").is_ok());
        assert!(validate_spec("@every 500ms").is_ok());
        assert!(validate_spec("*/5 * * * * *").is_ok());
        assert!(validate_spec("0 8 * * *").is_ok());

        assert!(validate_spec("@every soon").is_err());
        assert!(validate_spec("@every 0s").is_err());
        assert!(validate_spec("not a cron").is_err());
    }

    #[test]
    fn five_field_cron_fires_at_second_zero() {
        let cadence = Cadence::parse("* * * * *").unwrap();
        let next = cadence
            .next_after(Utc::now())
            .expect("wildcard cron always has a next fire");
        assert_eq!(next.timestamp() % 60, 0);
    }

    #[tokio::test]
    async fn duplicate_task_rejected() {
        let scheduler = Scheduler::new();
        scheduler.add_task("a", "@every 1h", || async {}).unwrap();
        let err = scheduler.add_task("a", "@every 1h", || async {});
        assert!(matches!(err, Err(SchedulerError::TaskAlreadyExists(_))));
    }

    #[tokio::test]
    async fn remove_missing_task_rejected() {
        let scheduler = Scheduler::new();
        assert!(matches!(
            scheduler.remove_task("ghost"),
            Err(SchedulerError::NoSuchTask(_))
        ));
    }

    #[tokio::test]
    async fn entries_reflect_registration() {
        let scheduler = Scheduler::new();
        scheduler.add_task("a", "@every 1h", || async {}).unwrap();
        scheduler.add_task("b", "*/5 * * * * *", || async {}).unwrap();

        let mut entries = scheduler.entries();
        entries.sort_by(|x, y| x.name.cmp(&y.name));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a");
        assert_eq!(entries[0].schedule, "@every 1h");
        assert_ne!(entries[0].id, entries[1].id);

        scheduler.remove_task("a").unwrap();
        assert_eq!(scheduler.entries().len(), 1);
    }

    #[tokio::test]
    async fn interval_task_fires_repeatedly() {
        let scheduler = Scheduler::new();
        let fires = Arc::new(AtomicUsize::new(0));
        let counter = fires.clone();

        scheduler
            .add_task("tick", "@every 10ms", move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(fires.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn slow_thunk_never_overlaps_itself() {
        let scheduler = Scheduler::new();
        let in_flight = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));
        let fires = Arc::new(AtomicUsize::new(0));

        let (flag, seen, counter) = (in_flight.clone(), overlapped.clone(), fires.clone());
        scheduler
            .add_task("slow", "@every 10ms", move || {
                let (flag, seen, counter) = (flag.clone(), seen.clone(), counter.clone());
                async move {
                    if flag.swap(true, Ordering::SeqCst) {
                        seen.store(true, Ordering::SeqCst);
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    flag.store(false, Ordering::SeqCst);
                }
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        scheduler.stop().wait().await;

        assert!(!overlapped.load(Ordering::SeqCst));
        // 10ms cadence with a 50ms body: overlapping fires were skipped.
        assert!(fires.load(Ordering::SeqCst) <= 6);
    }

    #[tokio::test]
    async fn panicking_thunk_does_not_kill_the_task() {
        let scheduler = Scheduler::new();
        let fires = Arc::new(AtomicUsize::new(0));
        let counter = fires.clone();

        scheduler
            .add_task("explosive", "@every 10ms", move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    panic!("boom");
                }
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fires.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn stop_prevents_new_fires_and_waits() {
        let scheduler = Scheduler::new();
        let fires = Arc::new(AtomicUsize::new(0));
        let counter = fires.clone();

        scheduler
            .add_task("tick", "@every 10ms", move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.stop().wait().await;

        let after_stop = fires.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fires.load(Ordering::SeqCst), after_stop);
    }
}
