//! Conversion of run feeds into client-facing frames.
//!
//! [`StreamEventConverter`] restores sequence order, applies the reasoning
//! filter and always ends with a [`Frame::Done`] sentinel.

pub mod frame;

pub use frame::{Frame, WORKFLOW_COMPLETE, WORKFLOW_MODEL};

use std::collections::BTreeMap;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::agent_loop::{FeedSubscription, RunStatus, RunUpdate, StreamEvent, StreamEventKind};

/// Trait for turning a stream of run updates into frames.
pub trait StreamTransform: Send + Sync {
    fn transform(&self, updates: BoxStream<'static, RunUpdate>) -> BoxStream<'static, Frame>;
}

/// Hands out events in sequence order.
///
/// Events that arrive early wait until the gap before them closes.
/// Duplicates and events older than the cursor are dropped.
#[derive(Debug, Clone)]
pub struct ReorderBuffer {
    next_seq: u64,
    pending: BTreeMap<u64, StreamEvent>,
}

impl ReorderBuffer {
    pub fn new(first_seq: u64) -> Self {
        Self {
            next_seq: first_seq,
            pending: BTreeMap::new(),
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Accept one event; returns every event now ready, in order.
    pub fn push(&mut self, event: StreamEvent) -> Vec<StreamEvent> {
        if event.seq < self.next_seq {
            debug!(seq = event.seq, next = self.next_seq, "dropping stale event");
            return Vec::new();
        }
        self.pending.insert(event.seq, event);

        let mut ready = Vec::new();
        while let Some(event) = self.pending.remove(&self.next_seq) {
            self.next_seq += 1;
            ready.push(event);
        }
        ready
    }

    /// Everything still buffered, in order, gaps and all.
    pub fn drain(&mut self) -> Vec<StreamEvent> {
        let rest = std::mem::take(&mut self.pending);
        if let Some(last) = rest.keys().next_back() {
            warn!(
                missing_from = self.next_seq,
                buffered = rest.len(),
                "feed ended with a sequence gap"
            );
            self.next_seq = last + 1;
        }
        rest.into_values().collect()
    }
}

/// Projects a run feed onto frames.
#[derive(Debug, Clone, Copy)]
pub struct StreamEventConverter {
    first_seq: u64,
    expose_reasoning: bool,
}

impl StreamEventConverter {
    pub fn new(first_seq: u64, expose_reasoning: bool) -> Self {
        Self {
            first_seq,
            expose_reasoning,
        }
    }

    /// Whether `kind` reaches the client.
    pub fn forwards(&self, kind: StreamEventKind) -> bool {
        self.expose_reasoning || kind == StreamEventKind::FinalChunk
    }

    /// Frames for a subscription, ready to be rendered.
    pub fn convert(
        subscription: FeedSubscription,
        expose_reasoning: bool,
    ) -> BoxStream<'static, Frame> {
        let converter = Self::new(subscription.first_seq, expose_reasoning);
        let updates = UnboundedReceiverStream::new(subscription.updates).boxed();
        converter.transform(updates)
    }
}

impl StreamTransform for StreamEventConverter {
    fn transform(&self, updates: BoxStream<'static, RunUpdate>) -> BoxStream<'static, Frame> {
        let converter = *self;
        let frames = async_stream::stream! {
            let mut buffer = ReorderBuffer::new(converter.first_seq);
            let mut updates = updates;
            let mut status = None;
            while let Some(update) = updates.next().await {
                match update {
                    RunUpdate::Event(event) => {
                        for event in buffer.push(event) {
                            if converter.forwards(event.kind) {
                                yield Frame::Event(event);
                            }
                        }
                    }
                    RunUpdate::Finished { status: terminal } => {
                        status = Some(terminal);
                        break;
                    }
                }
            }
            for event in buffer.drain() {
                if converter.forwards(event.kind) {
                    yield Frame::Event(event);
                }
            }
            // A feed that closes without a terminal status lost its run.
            yield Frame::Done { status: status.unwrap_or(RunStatus::Failed) };
        };
        Box::pin(frames)
    }
}

/// SSE lines for a frame stream, one string per frame.
pub fn sse_lines(
    frames: BoxStream<'static, Frame>,
    request_id: impl Into<String>,
    created: i64,
) -> BoxStream<'static, String> {
    let request_id = request_id.into();
    frames
        .map(move |frame| frame.to_sse(&request_id, created))
        .boxed()
}
