//! Result handoff between a spawned run and the callers waiting on it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::agent_loop::RunId;
use crate::workflow::ScenarioResult;

pub(crate) type ResultSender = watch::Sender<Option<Arc<ScenarioResult>>>;

/// Future side of a scheduled run.
///
/// Cloning is cheap; every clone sees the same result.
#[derive(Debug, Clone)]
pub struct RunHandle {
    run_id: RunId,
    rx: watch::Receiver<Option<Arc<ScenarioResult>>>,
}

impl RunHandle {
    pub(crate) fn channel(run_id: RunId) -> (ResultSender, Self) {
        let (tx, rx) = watch::channel(None);
        (tx, Self { run_id, rx })
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// The result if the run has finished.
    pub fn peek(&self) -> Option<Arc<ScenarioResult>> {
        self.rx.borrow().clone()
    }

    /// Wait for the run to finish. `None` if the run task died without
    /// reporting.
    pub async fn wait(mut self) -> Option<Arc<ScenarioResult>> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(result) => result.clone(),
            Err(_) => None,
        }
    }

    /// [`wait`](Self::wait) bounded by `limit`.
    pub async fn wait_for(self, limit: Duration) -> Option<Arc<ScenarioResult>> {
        tokio::time::timeout(limit, self.wait()).await.ok().flatten()
    }
}
