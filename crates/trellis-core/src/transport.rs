//! Transport abstraction: how a call's batched stream operations reach the
//! wire, and how inbound data and stream lifecycle changes come back.

use std::sync::Arc;

use crate::call::CallRef;
use crate::completion::CompletionQueue;
use crate::error::StatusCode;
use crate::stream_op::StreamOpBuffer;

#[cfg(feature = "mem")]
pub mod mem;

/// Transport-assigned identifier for one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u64);

/// Lifecycle of a transport stream, as reported alongside inbound data.
/// States only advance: `Open` -> `ReadClosed` -> `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StreamState {
    Open,
    /// The peer will send no more data; writes may still be in flight.
    ReadClosed,
    /// Both directions are done. The stream is finished.
    Closed,
}

/// Opaque token identifying an accepted inbound stream on a server
/// transport. Handed back when creating the server-side call for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerTransportData(pub u64);

/// One outbound batch of stream ops.
pub struct SendBatch {
    pub ops: StreamOpBuffer,
    /// No further sends will follow on this stream.
    pub is_last: bool,
}

/// Ask the transport to deliver more inbound data.
#[derive(Debug, Clone, Copy)]
pub struct RecvRequest {
    /// Flow-control hint: how many payload bytes the call is prepared to
    /// buffer right now.
    pub max_recv_bytes: usize,
}

/// Invoked by the transport exactly once when a send batch has been written
/// out (or failed).
pub type SendDone = Box<dyn FnOnce(bool) + Send>;

/// A composite operation on one stream. Any subset of the fields may be
/// populated; the transport handles the populated ones together.
#[derive(Default)]
pub struct TransportStreamOp {
    pub send: Option<SendBatch>,
    /// Must accompany `send`; fired when the batch is fully written.
    pub on_done_send: Option<SendDone>,
    pub recv: Option<RecvRequest>,
    /// Bind the stream's readiness notifications to this queue.
    pub bind_cq: Option<Arc<CompletionQueue>>,
    /// Abort the stream with the given status.
    pub cancel: Option<(StatusCode, Option<String>)>,
}

impl TransportStreamOp {
    pub fn is_empty(&self) -> bool {
        self.send.is_none() && self.recv.is_none() && self.bind_cq.is_none() && self.cancel.is_none()
    }
}

impl std::fmt::Debug for TransportStreamOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportStreamOp")
            .field("send", &self.send.as_ref().map(|s| s.ops.len()))
            .field("recv", &self.recv)
            .field("bind_cq", &self.bind_cq.is_some())
            .field("cancel", &self.cancel)
            .finish()
    }
}

/// Events a transport raises about the connection as a whole, relayed up
/// through the filter stack.
#[derive(Debug)]
pub enum TransportEvent {
    /// The peer opened a new stream (server side).
    AcceptStream(ServerTransportData),
    /// The peer asked us to wind down; no new streams will be accepted.
    GoawayReceived { status: StatusCode, debug: String },
    /// The connection is gone.
    Closed,
}

/// Sink wired in by the terminal channel filter for connection-level events.
pub struct TransportEventSink(Box<dyn Fn(TransportEvent) + Send + Sync>);

impl TransportEventSink {
    pub fn new(f: impl Fn(TransportEvent) + Send + Sync + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn raise(&self, event: TransportEvent) {
        (self.0)(event)
    }
}

/// A byte transport multiplexing many call streams over one connection.
///
/// Inbound traffic is pushed into the owning call through the [`CallRef`]
/// captured at `init_stream`. Calls never block inside these methods; the
/// transport must not hold its own locks while re-entering a call.
pub trait Transport: Send + Sync + 'static {
    /// Create a stream and associate it with `call`. For server transports,
    /// `server_data` names the accepted inbound stream to adopt.
    fn init_stream(&self, call: CallRef, server_data: Option<ServerTransportData>) -> StreamId;

    /// Submit a composite operation on `stream`.
    fn perform_op(&self, stream: StreamId, op: TransportStreamOp);

    /// Release the transport's resources for `stream`. Called once, after
    /// the stream has fully closed.
    fn destroy_stream(&self, stream: StreamId);

    /// Register the sink for connection-level events. Called once during
    /// channel construction.
    fn set_event_sink(&self, sink: TransportEventSink);

    /// Begin an orderly connection shutdown.
    fn close(&self) {}
}
