//! An in-process transport.
//!
//! Ops submitted by calls are recorded and can be inspected; inbound
//! traffic is injected with [`MemTransport::deliver`]. By default send
//! batches complete immediately and a cancel closes the stream, which is
//! enough to run whole calls without a wire.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::call::CallRef;
use crate::completion::CompletionQueue;
use crate::error::StatusCode;
use crate::stream_op::StreamOpBuffer;
use crate::transport::{
    SendBatch, SendDone, ServerTransportData, StreamId, StreamState, Transport, TransportEvent,
    TransportEventSink, TransportStreamOp,
};

/// Everything one `perform_op` submitted, for test assertions.
pub struct RecordedOp {
    pub stream: StreamId,
    pub send: Option<SendBatch>,
    pub recv_bytes: Option<usize>,
    pub bound_cq: Option<Arc<CompletionQueue>>,
    pub cancel: Option<(StatusCode, Option<String>)>,
}

struct StreamEntry {
    call: CallRef,
    state: StreamState,
}

struct MemState {
    next_stream: u64,
    streams: HashMap<u64, StreamEntry>,
    event_sink: Option<TransportEventSink>,
    recorded: Vec<RecordedOp>,
    pending_sends: Vec<(StreamId, SendDone)>,
    destroyed: Vec<StreamId>,
    auto_complete_sends: bool,
    auto_close_on_cancel: bool,
    closed: bool,
}

pub struct MemTransport {
    state: Mutex<MemState>,
}

impl MemTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MemState {
                next_stream: 1,
                streams: HashMap::new(),
                event_sink: None,
                recorded: Vec::new(),
                pending_sends: Vec::new(),
                destroyed: Vec::new(),
                auto_complete_sends: true,
                auto_close_on_cancel: true,
                closed: false,
            }),
        })
    }

    /// When false, send batches stay pending until
    /// [`complete_next_send`](Self::complete_next_send) is called.
    pub fn set_auto_complete_sends(&self, enabled: bool) {
        self.state.lock().auto_complete_sends = enabled;
    }

    /// When false, a cancel op is recorded but the stream stays open until
    /// closed explicitly.
    pub fn set_auto_close_on_cancel(&self, enabled: bool) {
        self.state.lock().auto_close_on_cancel = enabled;
    }

    /// Drain everything recorded so far.
    pub fn take_ops(&self) -> Vec<RecordedOp> {
        std::mem::take(&mut self.state.lock().recorded)
    }

    pub fn pending_send_count(&self) -> usize {
        self.state.lock().pending_sends.len()
    }

    /// Complete the oldest pending send batch.
    pub fn complete_next_send(&self, success: bool) {
        let done = {
            let mut state = self.state.lock();
            if state.pending_sends.is_empty() {
                panic!("no pending send to complete");
            }
            state.pending_sends.remove(0)
        };
        (done.1)(success);
    }

    /// Streams whose resources have been released.
    pub fn destroyed_streams(&self) -> Vec<StreamId> {
        self.state.lock().destroyed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Inject inbound stream ops, optionally advancing the stream state.
    pub fn deliver(&self, stream: StreamId, ops: StreamOpBuffer, state: StreamState, success: bool) {
        let call = {
            let mut guard = self.state.lock();
            let Some(entry) = guard.streams.get_mut(&stream.0) else {
                panic!("deliver to unknown stream {}", stream.0);
            };
            assert!(
                state >= entry.state,
                "stream state moved backwards: {:?} -> {:?}",
                entry.state,
                state
            );
            entry.state = state;
            entry.call.clone()
        };
        call.recv(ops, state, success);
    }

    /// Close a stream with no data attached.
    pub fn close_stream(&self, stream: StreamId) {
        self.deliver(stream, StreamOpBuffer::new(), StreamState::Closed, true);
    }

    /// Announce an accepted inbound stream; a server channel answers by
    /// creating a call that adopts it. Returns the token to pass when
    /// creating that call.
    pub fn accept_stream(&self) -> ServerTransportData {
        let data = {
            let mut state = self.state.lock();
            assert!(state.event_sink.is_some(), "no event sink registered");
            let data = ServerTransportData(state.next_stream);
            state.next_stream += 1;
            data
        };
        self.raise(TransportEvent::AcceptStream(data));
        data
    }

    pub fn raise_goaway(&self, status: StatusCode, debug: &str) {
        self.raise(TransportEvent::GoawayReceived {
            status,
            debug: debug.to_string(),
        });
    }

    pub fn raise_closed(&self) {
        self.raise(TransportEvent::Closed);
    }

    fn raise(&self, event: TransportEvent) {
        let sink = {
            let mut state = self.state.lock();
            state.event_sink.take()
        };
        if let Some(sink) = sink {
            sink.raise(event);
            self.state.lock().event_sink.get_or_insert(sink);
        }
    }
}

impl Transport for MemTransport {
    fn init_stream(&self, call: CallRef, server_data: Option<ServerTransportData>) -> StreamId {
        let mut state = self.state.lock();
        let id = match server_data {
            // Adopt the stream announced by accept_stream.
            Some(data) => data.0,
            None => {
                let id = state.next_stream;
                state.next_stream += 1;
                id
            }
        };
        state.streams.insert(
            id,
            StreamEntry {
                call,
                state: StreamState::Open,
            },
        );
        StreamId(id)
    }

    fn perform_op(&self, stream: StreamId, mut op: TransportStreamOp) {
        enum FollowUp {
            CompleteSend(SendDone),
            CloseStream(CallRef),
        }
        let mut follow_ups = Vec::new();
        {
            let mut state = self.state.lock();
            let cancel = op.cancel.clone();
            let recorded = RecordedOp {
                stream,
                send: op.send.take(),
                recv_bytes: op.recv.map(|r| r.max_recv_bytes),
                bound_cq: op.bind_cq.take(),
                cancel,
            };
            if recorded.send.is_some() {
                let done = op
                    .on_done_send
                    .take()
                    .unwrap_or_else(|| panic!("send batch without completion callback"));
                if state.auto_complete_sends {
                    follow_ups.push(FollowUp::CompleteSend(done));
                } else {
                    state.pending_sends.push((stream, done));
                }
            }
            if recorded.cancel.is_some() && state.auto_close_on_cancel {
                if let Some(entry) = state.streams.get_mut(&stream.0) {
                    if entry.state != StreamState::Closed {
                        entry.state = StreamState::Closed;
                        follow_ups.push(FollowUp::CloseStream(entry.call.clone()));
                    }
                }
            }
            state.recorded.push(recorded);
        }
        // Call back into the engine only after releasing our lock.
        for follow_up in follow_ups {
            match follow_up {
                FollowUp::CompleteSend(done) => done(true),
                FollowUp::CloseStream(call) => {
                    call.recv(StreamOpBuffer::new(), StreamState::Closed, true)
                }
            }
        }
    }

    fn destroy_stream(&self, stream: StreamId) {
        let mut state = self.state.lock();
        state.streams.remove(&stream.0);
        state.destroyed.push(stream);
    }

    fn set_event_sink(&self, sink: TransportEventSink) {
        self.state.lock().event_sink = Some(sink);
    }

    fn close(&self) {
        self.state.lock().closed = true;
    }
}
