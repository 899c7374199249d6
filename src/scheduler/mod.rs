//! Per-session single-flight admission around workflow runs.
//!
//! [`UpdateScheduler::admit`] does an atomic check-and-set on the session's
//! slot. The first admission spawns a run; duplicates either join that run
//! or fall back to the last committed scenario, per [`DuplicatePolicy`].
//! Run tasks release their slot through a drop guard, so a failing,
//! timed-out or panicking run never leaves the session stuck.

mod handle;

pub use handle::RunHandle;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent_loop::{EventEmitter, FeedSubscription, RunFeed, RunId, RunStatus};
use crate::config::SchedulerConfig;
use crate::error::NarratorError;
use crate::session::{ScenarioState, SessionCatalog, SessionId};
use crate::store::TableStore;
use crate::types::ChatMessage;
use crate::workflow::{WorkflowEngine, WorkflowMode, WorkflowRun};

/// Slack on top of the engine's worst case before a blocking caller stops
/// waiting; covers the commit that follows the last stage.
const COMMIT_SLACK: Duration = Duration::from_secs(2);

/// Whether the caller waits for the run it admits.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AdmissionMode {
    #[default]
    Blocking,
    NonBlocking,
}

/// What a blocking admission does when the session already has a run.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Wait for the running run's result.
    #[default]
    Join,
    /// Return the last committed state immediately.
    FallBack,
}

/// How an admission was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AdmissionOutcome {
    /// A new run was started.
    Started,
    /// Attached to the session's running run.
    Joined,
    /// A run was already in flight; the last committed state was returned.
    FellBack,
    /// The workflow mode runs no stages.
    Skipped,
    /// Too many runs in flight across sessions.
    Refused,
}

/// Result of [`UpdateScheduler::admit`].
#[derive(Debug, Clone)]
pub struct Admission {
    /// Scenario to inject: fresh after a committed run, otherwise the last
    /// committed one.
    pub state: ScenarioState,
    pub outcome: AdmissionOutcome,
    pub run_id: Option<RunId>,
    /// Terminal status of the run the caller waited on, if it waited.
    pub status: Option<RunStatus>,
}

/// Result of [`UpdateScheduler::admit_streaming`].
#[derive(Debug)]
pub struct StreamingAdmission {
    /// Last committed state at admission time.
    pub state: ScenarioState,
    pub outcome: AdmissionOutcome,
    /// Ordered events of the started or joined run.
    pub feed: Option<FeedSubscription>,
    pub result: Option<RunHandle>,
}

#[derive(Debug)]
struct InFlight {
    run_id: RunId,
    progress: watch::Receiver<WorkflowRun>,
    feed: RunFeed,
    handle: RunHandle,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct SessionEntry {
    in_flight: Option<InFlight>,
    seq: Arc<AtomicU64>,
    runs: VecDeque<WorkflowRun>,
}

#[derive(Debug)]
struct Inner {
    engine: WorkflowEngine,
    catalog: SessionCatalog,
    policy: DuplicatePolicy,
    max_outstanding: usize,
    history_limit: usize,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    shutdown: CancellationToken,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clear the session's slot if `run_id` still owns it and file the
    /// finished record.
    fn release(&self, session: &str, run_id: RunId, record: WorkflowRun) {
        let mut sessions = self.lock();
        let Some(entry) = sessions.get_mut(session) else {
            return;
        };
        if entry
            .in_flight
            .as_ref()
            .is_some_and(|f| f.run_id == run_id)
        {
            entry.in_flight = None;
        }
        entry.runs.push_back(record);
        while entry.runs.len() > self.history_limit {
            entry.runs.pop_front();
        }
    }
}

/// Frees the session slot when the run task ends, however it ends.
struct SlotGuard {
    inner: Arc<Inner>,
    session: SessionId,
    emitter: EventEmitter,
    record: Option<WorkflowRun>,
}

impl SlotGuard {
    fn complete(mut self, record: WorkflowRun) {
        self.record = Some(record);
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let run_id = self.emitter.run_id();
        let record = match self.record.take() {
            Some(record) => record,
            None => {
                warn!(session = %self.session, %run_id, "run task ended without a result");
                self.emitter.finish(RunStatus::Failed);
                let mut record = WorkflowRun::start(run_id, self.session.clone());
                record.finish(RunStatus::Failed, Some("run task aborted".into()));
                record
            }
        };
        self.inner.release(&self.session, run_id, record);
    }
}

/// Admission control for workflow runs, one slot per session.
///
/// Cloning is cheap; clones share slots and stores.
#[derive(Debug, Clone)]
pub struct UpdateScheduler {
    inner: Arc<Inner>,
}

enum Claim {
    Started(InFlightView, Launch),
    Existing(InFlightView),
    Refused,
}

/// What callers need from an in-flight run outside the lock.
struct InFlightView {
    run_id: RunId,
    feed: RunFeed,
    handle: RunHandle,
}

/// What the run task needs; only the claim that starts a run gets one.
struct Launch {
    emitter: EventEmitter,
    sender: handle::ResultSender,
    progress: watch::Sender<WorkflowRun>,
    cancel: CancellationToken,
}

impl UpdateScheduler {
    pub fn new(engine: WorkflowEngine, catalog: SessionCatalog, config: &SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                catalog,
                policy: config.duplicate_policy,
                max_outstanding: config.max_outstanding_runs.max(1),
                history_limit: config.run_history_limit,
                sessions: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn catalog(&self) -> &SessionCatalog {
        &self.inner.catalog
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.inner.engine
    }

    /// Last committed scenario of `session` without touching its slot.
    pub async fn last_committed(&self, session: &str) -> Result<ScenarioState, NarratorError> {
        let store = self.inner.catalog.store(session).await?;
        Ok(ScenarioState::of(&store))
    }

    /// Admit a workflow run for `session`.
    ///
    /// Only store access can fail. A run that fails or times out still
    /// yields an admission carrying the previous state.
    pub async fn admit(
        &self,
        session: &str,
        messages: &[ChatMessage],
        mode: AdmissionMode,
    ) -> Result<Admission, NarratorError> {
        let store = self.inner.catalog.store(session).await?;
        let committed = |run_id, outcome, status| Admission {
            state: ScenarioState::of(&store),
            outcome,
            run_id,
            status,
        };

        if self.inner.engine.mode() == WorkflowMode::ForwardOnly {
            return Ok(committed(None, AdmissionOutcome::Skipped, None));
        }

        let (view, outcome) = match self.claim(session) {
            Claim::Refused => return Ok(committed(None, AdmissionOutcome::Refused, None)),
            Claim::Started(view, launch) => {
                self.spawn(session, store.clone(), messages, launch);
                (view, AdmissionOutcome::Started)
            }
            Claim::Existing(view) => {
                let join =
                    mode == AdmissionMode::Blocking && self.inner.policy == DuplicatePolicy::Join;
                if !join {
                    debug!(session, run_id = %view.run_id, "duplicate admission falls back");
                    return Ok(committed(Some(view.run_id), AdmissionOutcome::FellBack, None));
                }
                (view, AdmissionOutcome::Joined)
            }
        };

        if mode == AdmissionMode::NonBlocking {
            return Ok(committed(Some(view.run_id), outcome, None));
        }

        let limit = self.inner.engine.max_run_time() + COMMIT_SLACK;
        let status = match view.handle.wait_for(limit).await {
            Some(result) => Some(result.status),
            None => {
                warn!(session, run_id = %view.run_id, ?limit, "gave up waiting for run");
                None
            }
        };
        Ok(committed(Some(view.run_id), outcome, status))
    }

    /// Like [`admit`](Self::admit) without waiting, handing back the run's
    /// event feed. Joiners replay the feed from the run's first event.
    pub async fn admit_streaming(
        &self,
        session: &str,
        messages: &[ChatMessage],
    ) -> Result<StreamingAdmission, NarratorError> {
        let store = self.inner.catalog.store(session).await?;
        let state = ScenarioState::of(&store);
        let skipped = |outcome| StreamingAdmission {
            state: state.clone(),
            outcome,
            feed: None,
            result: None,
        };

        if self.inner.engine.mode() == WorkflowMode::ForwardOnly {
            return Ok(skipped(AdmissionOutcome::Skipped));
        }

        let (view, outcome) = match self.claim(session) {
            Claim::Refused => return Ok(skipped(AdmissionOutcome::Refused)),
            Claim::Started(view, launch) => {
                self.spawn(session, store.clone(), messages, launch);
                (view, AdmissionOutcome::Started)
            }
            Claim::Existing(view) if self.inner.policy == DuplicatePolicy::Join => {
                (view, AdmissionOutcome::Joined)
            }
            Claim::Existing(_) => return Ok(skipped(AdmissionOutcome::FellBack)),
        };

        Ok(StreamingAdmission {
            state,
            outcome,
            feed: Some(view.feed.subscribe()),
            result: Some(view.handle),
        })
    }

    /// Atomic check-and-set on the session slot.
    fn claim(&self, session: &str) -> Claim {
        let mut sessions = self.inner.lock();
        let outstanding = sessions.values().filter(|e| e.in_flight.is_some()).count();
        let entry = sessions.entry(session.to_string()).or_default();

        if let Some(running) = &entry.in_flight {
            return Claim::Existing(InFlightView {
                run_id: running.run_id,
                feed: running.feed.clone(),
                handle: running.handle.clone(),
            });
        }
        if outstanding >= self.inner.max_outstanding {
            warn!(session, outstanding, "admission refused; too many runs in flight");
            return Claim::Refused;
        }

        let run_id = uuid::Uuid::new_v4();
        let emitter = EventEmitter::new(session, run_id, entry.seq.clone());
        let (sender, handle) = RunHandle::channel(run_id);
        let cancel = self.inner.shutdown.child_token();
        let (progress, watcher) = watch::channel(WorkflowRun::start(run_id, session));
        entry.in_flight = Some(InFlight {
            run_id,
            progress: watcher,
            feed: emitter.feed().clone(),
            handle: handle.clone(),
            cancel: cancel.clone(),
        });
        let view = InFlightView {
            run_id,
            feed: emitter.feed().clone(),
            handle,
        };
        Claim::Started(
            view,
            Launch {
                emitter,
                sender,
                progress,
                cancel,
            },
        )
    }

    fn spawn(
        &self,
        session: &str,
        store: TableStore,
        messages: &[ChatMessage],
        launch: Launch,
    ) {
        let Launch {
            emitter,
            sender,
            progress,
            cancel,
        } = launch;
        let guard = SlotGuard {
            inner: self.inner.clone(),
            session: session.to_string(),
            emitter: emitter.clone(),
            record: None,
        };
        let messages = messages.to_vec();
        let engine = self.inner.engine.clone();
        info!(session, run_id = %emitter.run_id(), "workflow run admitted");

        tokio::spawn(async move {
            let result = engine
                .run_tracked(&store, &messages, &emitter, &cancel, &progress)
                .await;
            // Free the slot before waking waiters so a follow-up admission
            // can start a new run right away.
            guard.complete(result.run.clone());
            sender.send_replace(Some(Arc::new(result)));
        });
    }

    /// Id of the session's running run, if any.
    pub fn in_flight(&self, session: &str) -> Option<RunId> {
        self.inner
            .lock()
            .get(session)
            .and_then(|e| e.in_flight.as_ref())
            .map(|f| f.run_id)
    }

    /// Runs in flight across all sessions.
    pub fn outstanding(&self) -> usize {
        self.inner
            .lock()
            .values()
            .filter(|e| e.in_flight.is_some())
            .count()
    }

    /// Recent run records of `session`, oldest first; a running run is last.
    pub fn runs(&self, session: &str) -> Vec<WorkflowRun> {
        let sessions = self.inner.lock();
        let Some(entry) = sessions.get(session) else {
            return Vec::new();
        };
        let mut runs: Vec<WorkflowRun> = entry.runs.iter().cloned().collect();
        runs.extend(entry.in_flight.as_ref().map(|f| f.progress.borrow().clone()));
        runs
    }

    /// Cancel the session's running run. Its buffered changes are dropped.
    pub fn cancel(&self, session: &str) -> bool {
        let sessions = self.inner.lock();
        match sessions.get(session).and_then(|e| e.in_flight.as_ref()) {
            Some(running) => {
                running.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every running run.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}
