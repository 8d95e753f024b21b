//! Task registry: lifecycle, duplicate suppression, cancellation, cleanup.
//!
//! State machine:
//!
//! ```text
//! Pending ──start──▶ Running ──complete──▶ Completed
//!    │                  │
//!    │                  └──set_error──▶ Errored
//!    ├──set_error──▶ Errored
//!    └──cancel (from Pending or Running)──▶ Cancelled
//! ```
//!
//! Terminal states are final; late calls against them are no-ops. The map is
//! guarded by a `std::sync::Mutex` that is never held across an `.await`, and
//! hooks and session teardown run after the guard is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use studydeck_shared::{
    AppConfig, ContentFingerprint, OperationType, Result, TaskId, TaskResult, TaskStatus,
    TimingRecord,
};

use crate::estimator::Estimator;
use crate::service::GenerationSession;

/// Cleanup callback run when a task is cancelled.
pub type CancelHook = Box<dyn FnOnce() -> Result<()> + Send>;

/// Point-in-time view of a task.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub operation: OperationType,
    pub fingerprint: ContentFingerprint,
    pub status: TaskStatus,
    /// 0..=100
    pub progress_percent: u8,
    pub progress_message: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_seconds: Option<f64>,
    pub unit_count: u32,
    pub result: Option<TaskResult>,
    pub error: Option<String>,
}

/// Outcome of [`TaskRegistry::create_task`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(TaskId),
    /// An equivalent task is already pending or running.
    Duplicate(TaskId),
}

impl CreateOutcome {
    pub fn task_id(&self) -> &TaskId {
        match self {
            Self::Created(id) | Self::Duplicate(id) => id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

struct Entry {
    task: Task,
    token: CancellationToken,
    hooks: Vec<CancelHook>,
    sessions: Vec<Arc<dyn GenerationSession>>,
}

/// Resources detached from an entry, released outside the lock.
#[derive(Default)]
struct Teardown {
    hooks: Vec<CancelHook>,
    sessions: Vec<Arc<dyn GenerationSession>>,
}

impl Teardown {
    fn take(entry: &mut Entry) -> Self {
        Self {
            hooks: std::mem::take(&mut entry.hooks),
            sessions: std::mem::take(&mut entry.sessions),
        }
    }

    fn run_hooks(&mut self, task_id: &TaskId) {
        for hook in self.hooks.drain(..) {
            if let Err(e) = hook() {
                warn!(%task_id, error = %e, "cancel hook failed");
            }
        }
    }

    fn release(self) {
        for session in self.sessions {
            session.destroy();
        }
    }
}

struct Inner {
    tasks: HashMap<TaskId, Entry>,
    estimator: Estimator,
}

/// Tracks every task in the process. Shared by `Arc`.
pub struct TaskRegistry {
    inner: Mutex<Inner>,
    retention: chrono::Duration,
}

impl TaskRegistry {
    pub fn new(estimator: Estimator, retention: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                tasks: HashMap::new(),
                estimator,
            }),
            retention: chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            Estimator::new(config.estimator.clone()),
            Duration::from_secs(config.registry.retention_secs),
        )
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Register a new task unless one for the same operation and content is
    /// still pending or running.
    pub fn create_task(
        &self,
        operation: OperationType,
        fingerprint: &ContentFingerprint,
    ) -> CreateOutcome {
        let mut inner = self.lock();

        let existing = inner.tasks.values().find(|e| {
            e.task.operation == operation
                && &e.task.fingerprint == fingerprint
                && e.task.status.is_active()
        });
        if let Some(entry) = existing {
            debug!(task_id = %entry.task.id, %operation, "duplicate task rejected");
            return CreateOutcome::Duplicate(entry.task.id.clone());
        }

        let id = TaskId::new();
        let task = Task {
            id: id.clone(),
            operation,
            fingerprint: fingerprint.clone(),
            status: TaskStatus::Pending,
            progress_percent: 0,
            progress_message: String::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            estimated_seconds: None,
            unit_count: 0,
            result: None,
            error: None,
        };
        inner.tasks.insert(
            id.clone(),
            Entry {
                task,
                token: CancellationToken::new(),
                hooks: Vec::new(),
                sessions: Vec::new(),
            },
        );
        debug!(task_id = %id, %operation, "task created");
        CreateOutcome::Created(id)
    }

    /// Move a pending task to `Running`. Returns the duration estimate.
    pub fn start(&self, id: &TaskId, unit_count: u32) -> Option<f64> {
        let mut inner = self.lock();
        let Inner { tasks, estimator } = &mut *inner;
        let entry = tasks.get_mut(id)?;
        if entry.task.status != TaskStatus::Pending {
            return None;
        }

        let estimate = estimator.estimate(entry.task.operation, unit_count);
        let task = &mut entry.task;
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        task.unit_count = unit_count;
        task.estimated_seconds = Some(estimate);
        debug!(task_id = %id, unit_count, estimate, "task started");
        Some(estimate)
    }

    /// Update progress on an active task. `percent` is clamped to 0..=100.
    pub fn update_progress(&self, id: &TaskId, percent: f64, message: impl Into<String>) {
        let mut inner = self.lock();
        if let Some(entry) = inner.tasks.get_mut(id) {
            if entry.task.status.is_active() {
                let clamped = if percent.is_nan() {
                    0.0
                } else {
                    percent.clamp(0.0, 100.0)
                };
                entry.task.progress_percent = clamped.round() as u8;
                entry.task.progress_message = message.into();
            }
        }
    }

    /// Finish a running task. Returns the timing record fed to the estimator,
    /// or `None` if the task was not running (already cancelled, for example).
    pub fn complete(&self, id: &TaskId, result: TaskResult) -> Option<TimingRecord> {
        let (record, teardown) = {
            let mut inner = self.lock();
            let Inner { tasks, estimator } = &mut *inner;
            let entry = tasks.get_mut(id)?;
            if entry.task.status != TaskStatus::Running {
                debug!(task_id = %id, status = ?entry.task.status, "ignoring late completion");
                return None;
            }

            let now = Utc::now();
            let started = entry.task.started_at.unwrap_or(entry.task.created_at);
            let elapsed = (now - started).num_milliseconds().max(0) as f64 / 1000.0;

            let task = &mut entry.task;
            task.status = TaskStatus::Completed;
            task.completed_at = Some(now);
            task.progress_percent = 100;
            task.result = Some(result);

            let record = estimator.record(task.operation, task.unit_count, elapsed);
            (record, Teardown::take(entry))
        };

        info!(task_id = %id, seconds = record.actual_seconds, "task completed");
        teardown.release();
        Some(record)
    }

    /// Cancel an active task: trip its token, run its hooks, release its
    /// sessions. Returns `false` if the task is unknown or already terminal.
    pub fn cancel(&self, id: &TaskId) -> bool {
        let mut teardown = {
            let mut inner = self.lock();
            let Some(entry) = inner.tasks.get_mut(id) else {
                return false;
            };
            if entry.task.status.is_terminal() {
                return false;
            }
            entry.task.status = TaskStatus::Cancelled;
            entry.task.completed_at = Some(Utc::now());
            entry.token.cancel();
            Teardown::take(entry)
        };

        info!(task_id = %id, "task cancelled");
        teardown.run_hooks(id);
        teardown.release();
        true
    }

    /// Mark an active task as failed.
    pub fn set_error(&self, id: &TaskId, message: impl Into<String>) -> bool {
        let message = message.into();
        let teardown = {
            let mut inner = self.lock();
            let Some(entry) = inner.tasks.get_mut(id) else {
                return false;
            };
            if entry.task.status.is_terminal() {
                return false;
            }
            entry.task.status = TaskStatus::Errored;
            entry.task.completed_at = Some(Utc::now());
            entry.task.error = Some(message.clone());
            Teardown::take(entry)
        };

        warn!(task_id = %id, error = %message, "task errored");
        teardown.release();
        true
    }

    // -----------------------------------------------------------------------
    // Resources
    // -----------------------------------------------------------------------

    pub fn cancellation_token(&self, id: &TaskId) -> Option<CancellationToken> {
        self.lock().tasks.get(id).map(|e| e.token.clone())
    }

    /// Register cleanup to run if the task is cancelled. Dropped unrun when the
    /// task is unknown or already terminal.
    pub fn add_cancel_hook(&self, id: &TaskId, hook: CancelHook) -> bool {
        let mut inner = self.lock();
        match inner.tasks.get_mut(id) {
            Some(entry) if entry.task.status.is_active() => {
                entry.hooks.push(hook);
                true
            }
            _ => false,
        }
    }

    /// Tie a session's lifetime to the task. If the task is no longer active
    /// the session is destroyed immediately and `false` is returned.
    pub fn attach_session(&self, id: &TaskId, session: Arc<dyn GenerationSession>) -> bool {
        {
            let mut inner = self.lock();
            if let Some(entry) = inner.tasks.get_mut(id) {
                if entry.task.status.is_active() {
                    entry.sessions.push(session);
                    return true;
                }
            }
        }
        session.destroy();
        false
    }

    // -----------------------------------------------------------------------
    // Queries and eviction
    // -----------------------------------------------------------------------

    pub fn get(&self, id: &TaskId) -> Option<Task> {
        self.lock().tasks.get(id).map(|e| e.task.clone())
    }

    /// Pending and running tasks, oldest first.
    pub fn active_tasks(&self) -> Vec<Task> {
        let inner = self.lock();
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|e| e.task.status.is_active())
            .map(|e| e.task.clone())
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Evict a task now, cancelling it first if it is still active.
    pub fn remove(&self, id: &TaskId) -> Option<Task> {
        self.cancel(id);
        let mut teardown = Teardown::default();
        let removed = {
            let mut inner = self.lock();
            inner.tasks.remove(id).map(|mut entry| {
                teardown = Teardown::take(&mut entry);
                entry.task
            })
        };
        teardown.release();
        removed
    }

    /// Evict tasks that have been terminal for longer than the retention window.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.lock();
        let before = inner.tasks.len();
        let retention = self.retention;
        inner.tasks.retain(|_, e| match e.task.completed_at {
            Some(done) if e.task.status.is_terminal() => now - done < retention,
            _ => true,
        });
        let evicted = before - inner.tasks.len();
        if evicted > 0 {
            debug!(evicted, "swept finished tasks");
        }
        evicted
    }

    /// Run [`Self::sweep`] every `interval` until the registry is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                registry.sweep();
            }
        })
    }

    // -----------------------------------------------------------------------
    // Estimator access
    // -----------------------------------------------------------------------

    pub fn estimate(&self, operation: OperationType, units: u32) -> f64 {
        self.lock().estimator.estimate(operation, units)
    }

    /// Seed the estimator from persisted history.
    pub fn load_history(&self, records: impl IntoIterator<Item = TimingRecord>) {
        self.lock().estimator.load(records);
    }

    /// Drop estimator records past their maximum age.
    pub fn prune_history(&self, now: DateTime<Utc>) -> usize {
        self.lock().estimator.prune(now)
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use studydeck_shared::{CombineStrategy, StudyDeckError, SummaryResult};

    use super::*;

    fn fp(s: &str) -> ContentFingerprint {
        ContentFingerprint::of(s)
    }

    fn summary() -> TaskResult {
        TaskResult::Summary(SummaryResult {
            text: "done".into(),
            chunk_count: 1,
            strategy: CombineStrategy::Single,
        })
    }

    struct CountingSession(Arc<AtomicUsize>);

    #[async_trait]
    impl GenerationSession for CountingSession {
        async fn run(&self, _input: &str, _cancel: &CancellationToken) -> Result<String> {
            Ok(String::new())
        }

        fn destroy(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn duplicate_is_rejected_while_active() {
        let registry = TaskRegistry::default();
        let first = registry.create_task(OperationType::Summarize, &fp("a"));
        let second = registry.create_task(OperationType::Summarize, &fp("a"));

        assert!(!first.is_duplicate());
        assert_eq!(second, CreateOutcome::Duplicate(first.task_id().clone()));

        // different operation or content is independent
        assert!(
            !registry
                .create_task(OperationType::Flashcards, &fp("a"))
                .is_duplicate()
        );
        assert!(
            !registry
                .create_task(OperationType::Summarize, &fp("b"))
                .is_duplicate()
        );
    }

    #[test]
    fn readmitted_after_terminal_state() {
        let registry = TaskRegistry::default();
        for path in 0..3 {
            let id = registry
                .create_task(OperationType::Report, &fp("x"))
                .task_id()
                .clone();
            assert!(!registry.active_tasks().is_empty());
            registry.start(&id, 1);
            match path {
                0 => assert!(registry.complete(&id, summary()).is_some()),
                1 => assert!(registry.cancel(&id)),
                _ => assert!(registry.set_error(&id, "boom")),
            }
            assert!(registry.active_tasks().is_empty());
        }
        let again = registry.create_task(OperationType::Report, &fp("x"));
        assert!(!again.is_duplicate());
    }

    #[test]
    fn start_returns_estimate_once() {
        let registry = TaskRegistry::default();
        let id = registry
            .create_task(OperationType::Summarize, &fp("a"))
            .task_id()
            .clone();
        assert_eq!(registry.start(&id, 2), Some(10.0));
        assert_eq!(registry.start(&id, 2), None);

        let task = registry.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.unit_count, 2);
        assert_eq!(task.estimated_seconds, Some(10.0));
    }

    #[test]
    fn progress_is_clamped() {
        let registry = TaskRegistry::default();
        let id = registry
            .create_task(OperationType::Summarize, &fp("a"))
            .task_id()
            .clone();
        registry.update_progress(&id, 150.0, "over");
        assert_eq!(registry.get(&id).unwrap().progress_percent, 100);
        registry.update_progress(&id, -5.0, "under");
        let task = registry.get(&id).unwrap();
        assert_eq!(task.progress_percent, 0);
        assert_eq!(task.progress_message, "under");
    }

    #[test]
    fn cancel_then_complete_is_noop() {
        let registry = TaskRegistry::default();
        let id = registry
            .create_task(OperationType::Flashcards, &fp("a"))
            .task_id()
            .clone();
        registry.start(&id, 1);
        assert!(registry.cancel(&id));
        assert!(registry.complete(&id, summary()).is_none());
        assert!(!registry.set_error(&id, "late"));
        assert!(!registry.cancel(&id));

        let task = registry.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.result.is_none());
        assert!(task.error.is_none());
    }

    #[test]
    fn cancel_trips_token_and_runs_every_hook() {
        let registry = TaskRegistry::default();
        let id = registry
            .create_task(OperationType::Summarize, &fp("a"))
            .task_id()
            .clone();
        let token = registry.cancellation_token(&id).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        registry.add_cancel_hook(
            &id,
            Box::new(|| Err(StudyDeckError::Generation("hook failed".into()))),
        );
        let r = ran.clone();
        registry.add_cancel_hook(
            &id,
            Box::new(move || {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        assert!(registry.cancel(&id));
        assert!(token.is_cancelled());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sessions_destroyed_on_every_terminal_path() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let registry = TaskRegistry::default();

        for path in 0..3 {
            let id = registry
                .create_task(OperationType::Summarize, &fp(&path.to_string()))
                .task_id()
                .clone();
            registry.start(&id, 1);
            assert!(registry.attach_session(&id, Arc::new(CountingSession(destroyed.clone()))));
            match path {
                0 => {
                    registry.complete(&id, summary());
                }
                1 => {
                    registry.cancel(&id);
                }
                _ => {
                    registry.set_error(&id, "x");
                }
            }
        }
        assert_eq!(destroyed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn attach_after_terminal_destroys_immediately() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let registry = TaskRegistry::default();
        let id = registry
            .create_task(OperationType::Summarize, &fp("a"))
            .task_id()
            .clone();
        registry.cancel(&id);
        assert!(!registry.attach_session(&id, Arc::new(CountingSession(destroyed.clone()))));
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pending_can_error() {
        let registry = TaskRegistry::default();
        let id = registry
            .create_task(OperationType::Summarize, &fp("a"))
            .task_id()
            .clone();
        assert!(registry.set_error(&id, "service unavailable"));
        let task = registry.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Errored);
        assert_eq!(task.error.as_deref(), Some("service unavailable"));
    }

    #[test]
    fn complete_feeds_estimator() {
        let registry = TaskRegistry::default();
        for _ in 0..3 {
            let id = registry
                .create_task(OperationType::Report, &fp("a"))
                .task_id()
                .clone();
            registry.start(&id, 4);
            let record = registry.complete(&id, summary()).unwrap();
            assert_eq!(record.unit_count, 4);
            assert_eq!(record.operation, OperationType::Report);
        }
        // near-instant history replaces the 8 s/unit baseline
        assert!(registry.estimate(OperationType::Report, 4) < 8.0 * 4.0);
    }

    #[test]
    fn sweep_evicts_only_expired_terminal_tasks() {
        let registry = TaskRegistry::new(Estimator::default(), Duration::from_secs(300));
        let done = registry
            .create_task(OperationType::Summarize, &fp("done"))
            .task_id()
            .clone();
        registry.cancel(&done);
        let active = registry
            .create_task(OperationType::Summarize, &fp("active"))
            .task_id()
            .clone();

        assert_eq!(registry.sweep(), 0);
        assert_eq!(
            registry.sweep_at(Utc::now() + chrono::Duration::seconds(301)),
            1
        );
        assert!(registry.get(&done).is_none());
        assert!(registry.get(&active).is_some());
    }

    #[test]
    fn remove_cancels_active_task() {
        let registry = TaskRegistry::default();
        let id = registry
            .create_task(OperationType::Summarize, &fp("a"))
            .task_id()
            .clone();
        let token = registry.cancellation_token(&id).unwrap();
        let removed = registry.remove(&id).unwrap();
        assert_eq!(removed.status, TaskStatus::Cancelled);
        assert!(token.is_cancelled());
        assert!(registry.get(&id).is_none());
    }

    #[tokio::test]
    async fn sweeper_runs_periodically() {
        let registry = Arc::new(TaskRegistry::new(
            Estimator::default(),
            Duration::from_secs(0),
        ));
        let id = registry
            .create_task(OperationType::Summarize, &fp("a"))
            .task_id()
            .clone();
        registry.cancel(&id);

        let handle = registry.spawn_sweeper(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(registry.get(&id).is_none());
        handle.abort();
    }
}
