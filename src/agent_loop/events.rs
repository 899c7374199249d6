//! Run event types and the per-run event feed.
//!
//! An [`EventEmitter`] stamps events with the session's sequence counter and
//! appends them to a [`RunFeed`]. The feed keeps every event of the run so a
//! late subscriber (a joined request) replays the run from its start.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::types::{RunId, RunStatus};

/// Event category.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StreamEventKind {
    ToolInvoked,
    ToolResult,
    ThoughtToken,
    FinalChunk,
}

/// One execution event of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub session: String,
    pub run_id: RunId,
    /// Gapless and strictly increasing within the session.
    pub seq: u64,
    pub stage: String,
    pub kind: StreamEventKind,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Item delivered to feed subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum RunUpdate {
    Event(StreamEvent),
    /// Last item of every feed.
    Finished { status: RunStatus },
}

#[derive(Debug)]
struct FeedState {
    first_seq: u64,
    events: Vec<StreamEvent>,
    finished: Option<RunStatus>,
    subscribers: Vec<mpsc::UnboundedSender<RunUpdate>>,
}

/// Ordered, replayable record of one run's events.
#[derive(Debug, Clone)]
pub struct RunFeed {
    state: Arc<Mutex<FeedState>>,
}

/// A subscriber's view of a feed.
#[derive(Debug)]
pub struct FeedSubscription {
    /// Sequence number of the run's first event.
    pub first_seq: u64,
    pub updates: mpsc::UnboundedReceiver<RunUpdate>,
}

impl RunFeed {
    pub fn new(first_seq: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(FeedState {
                first_seq,
                events: Vec::new(),
                finished: None,
                subscribers: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe from the run's first event.
    pub fn subscribe(&self) -> FeedSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        for event in &state.events {
            let _ = tx.send(RunUpdate::Event(event.clone()));
        }
        match state.finished {
            Some(status) => {
                let _ = tx.send(RunUpdate::Finished { status });
            }
            None => state.subscribers.push(tx),
        }
        FeedSubscription {
            first_seq: state.first_seq,
            updates: rx,
        }
    }

    /// Events recorded so far.
    pub fn events(&self) -> Vec<StreamEvent> {
        self.lock().events.clone()
    }

    pub fn status(&self) -> Option<RunStatus> {
        self.lock().finished
    }

    fn publish(&self, build: impl FnOnce() -> StreamEvent) -> Option<u64> {
        let mut state = self.lock();
        if state.finished.is_some() {
            return None;
        }
        let event = build();
        let seq = event.seq;
        state
            .subscribers
            .retain(|tx| tx.send(RunUpdate::Event(event.clone())).is_ok());
        state.events.push(event);
        Some(seq)
    }

    /// Close the feed. Later calls are ignored.
    pub fn finish(&self, status: RunStatus) {
        let mut state = self.lock();
        if state.finished.is_some() {
            return;
        }
        state.finished = Some(status);
        for tx in state.subscribers.drain(..) {
            let _ = tx.send(RunUpdate::Finished { status });
        }
    }
}

/// Stamps and publishes events for one run.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    session: String,
    run_id: RunId,
    seq: Arc<AtomicU64>,
    feed: RunFeed,
}

impl EventEmitter {
    /// `seq` is the session's counter; it holds the next number to assign.
    pub fn new(session: impl Into<String>, run_id: RunId, seq: Arc<AtomicU64>) -> Self {
        let feed = RunFeed::new(seq.load(Ordering::SeqCst));
        Self {
            session: session.into(),
            run_id,
            seq,
            feed,
        }
    }

    /// An emitter with its own counter, for runs outside a scheduler.
    pub fn detached(session: impl Into<String>) -> Self {
        Self::new(session, uuid::Uuid::new_v4(), Arc::new(AtomicU64::new(0)))
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn feed(&self) -> &RunFeed {
        &self.feed
    }

    /// Publish one event; returns its sequence number, or `None` once the
    /// feed is finished.
    pub fn emit(
        &self,
        stage: &str,
        kind: StreamEventKind,
        payload: serde_json::Value,
    ) -> Option<u64> {
        // The counter is advanced under the feed lock so feed order matches
        // sequence order.
        self.feed.publish(|| StreamEvent {
            session: self.session.clone(),
            run_id: self.run_id,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            stage: stage.to_string(),
            kind,
            payload,
            timestamp: Utc::now(),
        })
    }

    pub fn finish(&self, status: RunStatus) {
        self.feed.finish(status);
    }
}
