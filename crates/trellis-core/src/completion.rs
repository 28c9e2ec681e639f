//! Completion queues: tagged batch-completion delivery.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::batch::BatchOutcome;

/// One event per accepted batch: the submitter's tag, whether every op in
/// the batch succeeded, and whatever the batch received.
#[derive(Debug)]
pub struct CompletionEvent {
    pub tag: u64,
    pub success: bool,
    pub outcome: BatchOutcome,
}

struct CqState {
    tx: Option<mpsc::UnboundedSender<CompletionEvent>>,
    pending: usize,
    shutdown: bool,
}

/// Delivers batch completions to whoever polls it.
///
/// Every accepted batch calls `begin_op` exactly once and `end_op` exactly
/// once; `next` resolves to `None` only after `shutdown` has been requested
/// and every begun op has ended. That pairing is what guarantees the
/// application always observes a terminal event for each batch it
/// submitted.
pub struct CompletionQueue {
    state: parking_lot::Mutex<CqState>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<CompletionEvent>>,
}

impl CompletionQueue {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            state: parking_lot::Mutex::new(CqState {
                tx: Some(tx),
                pending: 0,
                shutdown: false,
            }),
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    /// Record that an event will eventually be delivered.
    pub fn begin_op(&self) {
        let mut state = self.state.lock();
        assert!(!state.shutdown, "begin_op on a shut-down completion queue");
        state.pending += 1;
    }

    /// Deliver the event paired with an earlier `begin_op`.
    pub fn end_op(&self, event: CompletionEvent) {
        let mut state = self.state.lock();
        debug_assert!(state.pending > 0, "end_op without matching begin_op");
        state.pending -= 1;
        if let Some(tx) = &state.tx {
            // The receiver half lives as long as the queue; delivery only
            // fails after shutdown already closed it.
            let _ = tx.send(event);
        }
        if state.shutdown && state.pending == 0 {
            state.tx = None;
        }
    }

    /// Retract an earlier `begin_op` without delivering an event. Used when
    /// a batch is rejected at submission, after the queue was already
    /// charged for it.
    pub(crate) fn abandon_op(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.pending > 0, "abandon_op without matching begin_op");
        state.pending -= 1;
        if state.shutdown && state.pending == 0 {
            state.tx = None;
        }
    }

    /// Stop accepting new ops. Queued and in-flight events still drain;
    /// `next` returns `None` once they have.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        if state.pending == 0 {
            state.tx = None;
        }
    }

    /// Await the next completion event.
    pub async fn next(&self) -> Option<CompletionEvent> {
        self.rx.lock().await.recv().await
    }

    /// Non-blocking poll for an already-delivered event.
    pub fn try_next(&self) -> Option<CompletionEvent> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}
