//! The call engine.
//!
//! A [`Call`] tracks one RPC over a stream. Applications drive it by
//! submitting batches of well-typed I/O requests ([`IoReq`]); the engine
//! coalesces them into transport ops, routes inbound traffic back into the
//! pending requests, and delivers exactly one completion per accepted
//! batch.
//!
//! All mutable state lives behind one mutex. Every entry point follows the
//! same discipline: mutate under the lock, compute the follow-up work
//! (transport ops, completions, teardown) while still holding it, then
//! release the lock and perform that work. Nothing is ever called out to
//! with the lock held.

use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::byte_buffer::{ByteBuffer, ByteBufferQueue};
use crate::channel::Channel;
use crate::compression::CompressionAlgorithm;
use crate::error::{BatchError, FinalStatus, StatusCode};
use crate::filter::CallStack;
use crate::metadata::{is_legal_header_key, is_legal_header_value, MdElem, MdStr};
use crate::metadata_buffer::MetadataBuffer;
use crate::stream_op::{message_flags, StreamOp, StreamOpBuffer};
use crate::transport::{RecvRequest, SendBatch, StreamState, TransportStreamOp};

/// The kinds of I/O request a call tracks, one slot each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    SendInitialMetadata = 0,
    SendTrailingMetadata,
    SendMessage,
    SendStatus,
    SendClose,
    RecvInitialMetadata,
    RecvTrailingMetadata,
    RecvMessage,
    RecvStatus,
    RecvStatusDetails,
    RecvClose,
}

pub(crate) const IO_KIND_COUNT: usize = 11;

impl IoKind {
    pub(crate) const ALL: [IoKind; IO_KIND_COUNT] = [
        IoKind::SendInitialMetadata,
        IoKind::SendTrailingMetadata,
        IoKind::SendMessage,
        IoKind::SendStatus,
        IoKind::SendClose,
        IoKind::RecvInitialMetadata,
        IoKind::RecvTrailingMetadata,
        IoKind::RecvMessage,
        IoKind::RecvStatus,
        IoKind::RecvStatusDetails,
        IoKind::RecvClose,
    ];

    fn mask(self) -> u16 {
        1 << (self as u16)
    }

    /// Message ops may be issued again once finished; everything else is
    /// once per call.
    fn repeatable(self) -> bool {
        matches!(self, IoKind::SendMessage | IoKind::RecvMessage)
    }

    fn is_send(self) -> bool {
        matches!(
            self,
            IoKind::SendInitialMetadata
                | IoKind::SendTrailingMetadata
                | IoKind::SendMessage
                | IoKind::SendStatus
                | IoKind::SendClose
        )
    }
}

/// One I/O request. The payload travels with the kind, so a request can
/// never be paired with another kind's data.
pub enum IoReq {
    SendInitialMetadata(Vec<MdElem>),
    SendTrailingMetadata(Vec<MdElem>),
    SendMessage { buffer: ByteBuffer, flags: u32 },
    SendStatus { code: StatusCode, details: Option<MdStr> },
    SendClose,
    RecvInitialMetadata,
    RecvTrailingMetadata,
    RecvMessage,
    RecvStatus,
    RecvStatusDetails,
    RecvClose,
}

impl IoReq {
    pub fn kind(&self) -> IoKind {
        match self {
            IoReq::SendInitialMetadata(_) => IoKind::SendInitialMetadata,
            IoReq::SendTrailingMetadata(_) => IoKind::SendTrailingMetadata,
            IoReq::SendMessage { .. } => IoKind::SendMessage,
            IoReq::SendStatus { .. } => IoKind::SendStatus,
            IoReq::SendClose => IoKind::SendClose,
            IoReq::RecvInitialMetadata => IoKind::RecvInitialMetadata,
            IoReq::RecvTrailingMetadata => IoKind::RecvTrailingMetadata,
            IoReq::RecvMessage => IoKind::RecvMessage,
            IoReq::RecvStatus => IoKind::RecvStatus,
            IoReq::RecvStatusDetails => IoKind::RecvStatusDetails,
            IoReq::RecvClose => IoKind::RecvClose,
        }
    }
}

/// Lifecycle of a request slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Nothing pending; a new request of this kind is acceptable.
    Empty,
    /// In flight, owned by the batch anchored at `master`.
    Live { master: usize },
    /// Performed and not repeatable.
    Done,
}

/// Per-slot payload staging. Send data waits here until it is written into
/// a transport batch; receive data accumulates here until the slot
/// finishes.
#[derive(Default)]
enum ReqData {
    #[default]
    None,
    SendMetadata(Vec<MdElem>),
    SendMessage(ByteBuffer, u32),
    SendStatus {
        code: StatusCode,
        details: Option<MdStr>,
    },
    RecvMetadata(Vec<MdElem>),
    RecvMessage(Option<ByteBuffer>),
}

struct ReqSlot {
    state: SlotState,
    data: ReqData,
}

impl ReqSlot {
    const EMPTY: ReqSlot = ReqSlot {
        state: SlotState::Empty,
        data: ReqData::None,
    };
}

/// Everything a batch received, delivered with its completion.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub initial_metadata: Option<Vec<MdElem>>,
    /// `Some(None)` means end of stream: the peer will send no more
    /// messages.
    pub message: Option<Option<ByteBuffer>>,
    pub trailing_metadata: Option<Vec<MdElem>>,
    pub status: Option<FinalStatus>,
    /// For receive-close: whether the call ended abnormally.
    pub cancelled: Option<bool>,
}

/// Invoked exactly once when a batch finishes, with the overall success
/// flag and the received data.
pub type BatchCompletion = Box<dyn FnOnce(bool, BatchOutcome) + Send>;

/// Bookkeeping for one in-flight batch, anchored at the slot of its first
/// request.
struct Master {
    need_mask: u16,
    complete_mask: u16,
    success: bool,
    on_complete: Option<BatchCompletion>,
    outcome: BatchOutcome,
}

struct CompletedBatch {
    on_complete: BatchCompletion,
    success: bool,
    outcome: BatchOutcome,
}

/// Read side of the call; only ever advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ReadState {
    Initial,
    GotInitialMetadata,
    ReadClosed,
    StreamClosed,
}

/// Write side of the call; only ever advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum WriteState {
    Initial,
    Started,
    WriteClosed,
}

/// Where a terminal status came from, in decreasing precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusSource {
    /// An explicit local cancellation.
    ApiOverride = 0,
    /// The engine itself (deadline expiry, framing violations).
    Core,
    /// Status received from the peer.
    Wire,
    /// The status this server submitted for sending.
    ServerStatus,
}

const STATUS_SOURCE_COUNT: usize = 4;

const SOURCE_PRIORITY: [StatusSource; STATUS_SOURCE_COUNT] = [
    StatusSource::ApiOverride,
    StatusSource::Core,
    StatusSource::Wire,
    StatusSource::ServerStatus,
];

#[derive(Default)]
struct StatusRecord {
    code: Option<StatusCode>,
    details: Option<MdStr>,
}

/// A message being reassembled from framing ops.
struct IncomingMessage {
    length: u32,
    flags: u32,
    buf: BytesMut,
}

/// Deadline/cancellation inheritance for child calls.
#[derive(Debug, Clone, Copy)]
pub struct Propagation {
    pub deadline: bool,
    pub cancellation: bool,
}

impl Default for Propagation {
    fn default() -> Self {
        Self {
            deadline: true,
            cancellation: true,
        }
    }
}

pub(crate) struct CallInit {
    pub is_client: bool,
    pub cq: Arc<crate::completion::CompletionQueue>,
    pub path: Option<MdElem>,
    pub authority: Option<MdElem>,
    pub deadline: Option<Instant>,
    pub parent: Option<Arc<Call>>,
    pub propagation: Propagation,
    pub server_data: Option<crate::transport::ServerTransportData>,
}

struct CallInner {
    reqs: [ReqSlot; IO_KIND_COUNT],
    masters: [Option<Master>; IO_KIND_COUNT],
    completed: Vec<CompletedBatch>,
    /// A completion pass is running outside the lock.
    completing: bool,
    /// A send batch is in flight on the transport.
    sending: bool,
    /// A receive request is outstanding on the transport.
    receiving: bool,
    read_state: ReadState,
    /// Initial metadata was received at some point; distinguishes a closed
    /// read side that saw it from one that never did.
    saw_initial_metadata: bool,
    write_state: WriteState,
    /// The stream is still open; teardown waits on it.
    stream_open: bool,
    destroy_called: bool,
    torn_down: bool,
    /// A cancellation waiting to ride the next transport op.
    cancel_pending: Option<(StatusCode, Option<String>)>,
    status: [StatusRecord; STATUS_SOURCE_COUNT],
    /// Messages that arrived before anyone asked for them.
    incoming: ByteBufferQueue,
    assembling: Option<IncomingMessage>,
    /// Metadata received before the matching receive request existed.
    buffered_initial_md: Vec<MdElem>,
    buffered_trailing_md: Vec<MdElem>,
    compression: Option<CompressionAlgorithm>,
    peer_accept_encodings: Vec<CompressionAlgorithm>,
    /// Routing headers, consumed when initial metadata goes out.
    path: Option<MdElem>,
    authority: Option<MdElem>,
    deadline: Option<Instant>,
    alarm: Option<tokio::task::AbortHandle>,
    /// Children that opted into cancellation inheritance.
    children: Vec<Weak<Call>>,
    pending_child_cancels: Vec<Weak<Call>>,
    cq_bound: bool,
}

/// Work computed under the lock, performed after releasing it.
#[derive(Default)]
struct Actions {
    op: Option<TransportStreamOp>,
    completions: Vec<CompletedBatch>,
    cancel_children: Vec<Arc<Call>>,
    destroy: bool,
}

impl Actions {
    fn is_empty(&self) -> bool {
        self.op.is_none() && self.completions.is_empty() && self.cancel_children.is_empty()
            && !self.destroy
    }
}

/// One RPC in flight on a channel.
pub struct Call {
    channel: Arc<Channel>,
    is_client: bool,
    cq: Arc<crate::completion::CompletionQueue>,
    call_stack: CallStack,
    inner: Mutex<CallInner>,
}

/// Weak handle a transport holds to push inbound traffic into a call.
#[derive(Clone)]
pub struct CallRef(Weak<Call>);

impl CallRef {
    pub fn upgrade(&self) -> Option<Arc<Call>> {
        self.0.upgrade()
    }

    /// Deliver inbound stream ops together with the stream's new state.
    pub fn recv(&self, ops: StreamOpBuffer, state: StreamState, success: bool) {
        if let Some(call) = self.0.upgrade() {
            call.transport_recv(ops, state, success);
        }
    }
}

impl Call {
    pub(crate) fn create(channel: Arc<Channel>, init: CallInit) -> Arc<Call> {
        let deadline = match (&init.parent, init.propagation.deadline) {
            (Some(parent), true) => match (parent.deadline(), init.deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
            _ => init.deadline,
        };
        let call = Arc::new_cyclic(|weak: &Weak<Call>| {
            let call_stack = channel
                .stack()
                .init_call(CallRef(weak.clone()), init.server_data);
            let mut reqs = [ReqSlot::EMPTY; IO_KIND_COUNT];
            if init.is_client {
                // Clients never send a status; those slots start used up.
                reqs[IoKind::SendTrailingMetadata as usize].state = SlotState::Done;
                reqs[IoKind::SendStatus as usize].state = SlotState::Done;
            }
            Call {
                channel,
                is_client: init.is_client,
                cq: init.cq,
                call_stack,
                inner: Mutex::new(CallInner {
                    reqs,
                    masters: Default::default(),
                    completed: Vec::new(),
                    completing: false,
                    sending: false,
                    receiving: false,
                    read_state: ReadState::Initial,
                    saw_initial_metadata: false,
                    write_state: WriteState::Initial,
                    stream_open: true,
                    destroy_called: false,
                    torn_down: false,
                    cancel_pending: None,
                    status: Default::default(),
                    incoming: ByteBufferQueue::new(),
                    assembling: None,
                    buffered_initial_md: Vec::new(),
                    buffered_trailing_md: Vec::new(),
                    compression: None,
                    peer_accept_encodings: Vec::new(),
                    path: init.path,
                    authority: init.authority,
                    deadline,
                    alarm: None,
                    children: Vec::new(),
                    pending_child_cancels: Vec::new(),
                    cq_bound: false,
                }),
            }
        });
        if let Some(parent) = &init.parent {
            if init.propagation.cancellation {
                parent.inner.lock().children.push(Arc::downgrade(&call));
            }
        }
        if let Some(deadline) = deadline {
            let mut inner = call.inner.lock();
            call.arm_alarm(&mut inner, deadline);
        }
        // One planning pass right away: servers issue their queue binding
        // and first read here, before any batch is submitted.
        call.with_inner(|_, _| {});
        tracing::debug!(client = init.is_client, "call created");
        call
    }

    pub fn is_client(&self) -> bool {
        self.is_client
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.lock().deadline
    }

    pub fn completion_queue(&self) -> &Arc<crate::completion::CompletionQueue> {
        &self.cq
    }

    pub(crate) fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Compression algorithm announced by the peer for its messages.
    pub fn incoming_compression(&self) -> Option<CompressionAlgorithm> {
        self.inner.lock().compression
    }

    /// Algorithms the peer said it can decode.
    pub fn peer_accept_encodings(&self) -> Vec<CompressionAlgorithm> {
        self.inner.lock().peer_accept_encodings.clone()
    }

    /// Cancel the call with `Cancelled`.
    pub fn cancel(self: &Arc<Self>) {
        self.cancel_with_status(StatusCode::Cancelled, None);
    }

    /// Cancel the call, dictating the status the application will observe.
    /// This outranks every other status source.
    pub fn cancel_with_status(self: &Arc<Self>, code: StatusCode, details: Option<&str>) {
        tracing::debug!(?code, details, "call cancelled locally");
        self.with_inner(|call, inner| {
            let details = details.map(|d| call.channel.metadata_context().intern_str(d));
            inner.status[StatusSource::ApiOverride as usize] = StatusRecord {
                code: Some(code),
                details: details.clone(),
            };
            inner.cancel_pending = Some((code, details.map(|d| d.to_string_lossy())));
        });
    }

    /// Release the application's interest in the call. If the stream is
    /// still open this cancels it first; transport resources are freed once
    /// the stream has fully closed.
    pub fn destroy(self: &Arc<Self>) {
        self.with_inner(|_, inner| {
            if inner.destroy_called {
                return;
            }
            inner.destroy_called = true;
            if let Some(alarm) = inner.alarm.take() {
                alarm.abort();
            }
            if inner.read_state != ReadState::StreamClosed {
                let record = &mut inner.status[StatusSource::ApiOverride as usize];
                if record.code.is_none() {
                    record.code = Some(StatusCode::Cancelled);
                }
                inner.cancel_pending = Some((StatusCode::Cancelled, None));
            }
        });
    }

    // ---- lock/act discipline ----------------------------------------

    fn with_inner<R>(self: &Arc<Self>, f: impl FnOnce(&Arc<Self>, &mut CallInner) -> R) -> R {
        let (result, actions) = {
            let mut inner = self.inner.lock();
            let result = f(self, &mut inner);
            let actions = self.plan(&mut inner);
            (result, actions)
        };
        self.act(actions);
        result
    }

    /// Decide what must happen outside the lock: the next transport op,
    /// completions ready to fire, child cancellations, teardown.
    fn plan(self: &Arc<Self>, inner: &mut CallInner) -> Actions {
        let mut actions = Actions::default();
        if !inner.torn_down {
            let mut op = TransportStreamOp::default();
            let cancel = inner.cancel_pending.take();
            let cancel_pending = cancel.is_some();
            if let Some((code, msg)) = cancel {
                op.cancel = Some((code, msg));
            }
            if !inner.receiving && self.need_more_data(inner, cancel_pending) {
                inner.receiving = true;
                op.recv = Some(RecvRequest {
                    max_recv_bytes: self.channel.config().read_ahead_bytes,
                });
            }
            if !inner.sending {
                if let Some((batch, mask)) = self.fill_send_batch(inner) {
                    inner.sending = true;
                    let call = self.clone();
                    op.send = Some(batch);
                    op.on_done_send = Some(Box::new(move |success| {
                        call.finished_send(mask, success);
                    }));
                }
            }
            // Servers bind their completion queue up front; clients
            // piggyback the binding on their first op.
            let must_bind = !inner.cq_bound && !self.is_client;
            if !op.is_empty() || must_bind {
                if !inner.cq_bound {
                    inner.cq_bound = true;
                    op.bind_cq = Some(self.cq.clone());
                }
                actions.op = Some(op);
            }
        }
        if !inner.completing && !inner.completed.is_empty() {
            inner.completing = true;
            actions.completions = std::mem::take(&mut inner.completed);
        }
        for weak in inner.pending_child_cancels.drain(..) {
            if let Some(child) = weak.upgrade() {
                actions.cancel_children.push(child);
            }
        }
        if inner.destroy_called && !inner.stream_open && !inner.torn_down {
            inner.torn_down = true;
            actions.destroy = true;
        }
        actions
    }

    fn act(self: &Arc<Self>, mut actions: Actions) {
        loop {
            if let Some(op) = actions.op.take() {
                tracing::trace!(?op, "starting transport op");
                self.channel.stack().start_op(&self.call_stack, op);
            }
            for child in actions.cancel_children.drain(..) {
                child.cancel();
            }
            let completions = std::mem::take(&mut actions.completions);
            let completed_any = !completions.is_empty();
            for batch in completions {
                (batch.on_complete)(batch.success, batch.outcome);
            }
            if actions.destroy {
                tracing::debug!("call torn down");
                self.channel.stack().destroy_call(&self.call_stack);
            }
            let mut inner = self.inner.lock();
            if completed_any {
                inner.completing = false;
            }
            let next = self.plan(&mut inner);
            drop(inner);
            if next.is_empty() {
                break;
            }
            actions = next;
        }
    }

    // ---- request intake ---------------------------------------------

    /// Submit a batch of requests. Either every request is accepted and the
    /// batch will complete exactly once, or the whole batch is rejected
    /// with no state changed.
    pub(crate) fn start_ioreq(
        self: &Arc<Self>,
        reqs: Vec<IoReq>,
        on_complete: BatchCompletion,
    ) -> Result<(), BatchError> {
        assert!(!reqs.is_empty(), "empty request batch");
        self.with_inner(|call, inner| {
            if inner.destroy_called {
                return Err(BatchError::AlreadyShutdown);
            }
            // Validate everything before touching any slot, so rejection
            // leaves the call exactly as it was.
            let mut claimed: u16 = 0;
            for req in &reqs {
                let kind = req.kind();
                if claimed & kind.mask() != 0 {
                    return Err(BatchError::TooManyOperations);
                }
                match inner.reqs[kind as usize].state {
                    SlotState::Live { .. } => return Err(BatchError::TooManyOperations),
                    SlotState::Done => return Err(BatchError::AlreadyInvoked),
                    SlotState::Empty => {}
                }
                if let IoReq::SendInitialMetadata(md) | IoReq::SendTrailingMetadata(md) = req {
                    for elem in md {
                        if !is_legal_header_key(elem.key().as_bytes())
                            || !is_legal_header_value(elem.key().as_bytes(), elem.value().as_bytes())
                        {
                            return Err(BatchError::InvalidMetadata);
                        }
                    }
                }
                claimed |= kind.mask();
            }

            let master_idx = reqs[0].kind() as usize;
            for req in reqs {
                let kind = req.kind();
                let slot = &mut inner.reqs[kind as usize];
                slot.state = SlotState::Live { master: master_idx };
                slot.data = match req {
                    IoReq::SendInitialMetadata(md) | IoReq::SendTrailingMetadata(md) => {
                        ReqData::SendMetadata(md)
                    }
                    IoReq::SendMessage { buffer, flags } => ReqData::SendMessage(buffer, flags),
                    IoReq::SendStatus { code, details } => ReqData::SendStatus { code, details },
                    IoReq::RecvInitialMetadata => {
                        ReqData::RecvMetadata(std::mem::take(&mut inner.buffered_initial_md))
                    }
                    IoReq::RecvTrailingMetadata => {
                        ReqData::RecvMetadata(std::mem::take(&mut inner.buffered_trailing_md))
                    }
                    IoReq::RecvMessage => ReqData::RecvMessage(None),
                    _ => ReqData::None,
                };
            }
            inner.masters[master_idx] = Some(Master {
                need_mask: claimed,
                complete_mask: 0,
                success: true,
                on_complete: Some(on_complete),
                outcome: BatchOutcome::default(),
            });

            // Anything already satisfiable finishes right now.
            for kind in IoKind::ALL {
                if claimed & kind.mask() == 0 {
                    continue;
                }
                call.satisfy_on_submit(inner, kind);
            }
            Ok(())
        })
    }

    fn satisfy_on_submit(self: &Arc<Self>, inner: &mut CallInner, kind: IoKind) {
        if !matches!(inner.reqs[kind as usize].state, SlotState::Live { .. }) {
            // An earlier step of this pass already finished it.
            return;
        }
        let stream_closed = inner.read_state == ReadState::StreamClosed;
        match kind {
            IoKind::SendStatus => {
                if let ReqData::SendStatus { code, details } = &inner.reqs[kind as usize].data {
                    // The submitted status becomes a terminal-status source
                    // immediately, before anything reaches the wire.
                    inner.status[StatusSource::ServerStatus as usize] = StatusRecord {
                        code: Some(*code),
                        details: details.clone(),
                    };
                }
                if stream_closed || inner.write_state == WriteState::WriteClosed {
                    self.finish_ioreq(inner, kind, false);
                }
            }
            IoKind::SendClose => {
                // No further messages once close is requested.
                if inner.reqs[IoKind::SendMessage as usize].state == SlotState::Empty {
                    inner.reqs[IoKind::SendMessage as usize].state = SlotState::Done;
                }
                if stream_closed || inner.write_state == WriteState::WriteClosed {
                    self.finish_ioreq(inner, kind, false);
                }
            }
            IoKind::SendInitialMetadata | IoKind::SendTrailingMetadata | IoKind::SendMessage => {
                if stream_closed || inner.write_state == WriteState::WriteClosed {
                    self.finish_ioreq(inner, kind, false);
                }
            }
            IoKind::RecvInitialMetadata => {
                if inner.saw_initial_metadata {
                    self.finish_ioreq(inner, kind, true);
                } else if inner.read_state >= ReadState::ReadClosed {
                    // The read side ended without initial metadata ever
                    // arriving.
                    self.finish_ioreq(inner, kind, false);
                }
            }
            IoKind::RecvTrailingMetadata | IoKind::RecvStatus | IoKind::RecvStatusDetails => {
                if inner.read_state >= ReadState::ReadClosed {
                    self.finish_ioreq(inner, kind, true);
                }
            }
            IoKind::RecvMessage => {
                if let Some(buffer) = inner.incoming.pop() {
                    inner.reqs[kind as usize].data = ReqData::RecvMessage(Some(buffer));
                    self.finish_ioreq(inner, kind, true);
                    if stream_closed && inner.incoming.is_empty() {
                        self.finish_ioreq(inner, IoKind::RecvClose, true);
                    }
                } else if inner.read_state >= ReadState::ReadClosed {
                    // End of stream: deliver the "no more messages" marker.
                    self.finish_ioreq(inner, kind, true);
                }
            }
            IoKind::RecvClose => {
                if stream_closed && inner.incoming.is_empty() {
                    self.finish_ioreq(inner, kind, true);
                }
            }
        }
    }

    /// Record that one request finished. When its batch has no unfinished
    /// requests left (or any request failed), the batch completes.
    fn finish_ioreq(self: &Arc<Self>, inner: &mut CallInner, kind: IoKind, ok: bool) {
        let master_idx = match inner.reqs[kind as usize].state {
            SlotState::Live { master } => master,
            _ => return,
        };
        let data = std::mem::take(&mut inner.reqs[kind as usize].data);
        inner.reqs[kind as usize].state = if kind.repeatable() {
            SlotState::Empty
        } else {
            SlotState::Done
        };
        let Some(master) = inner.masters[master_idx].as_mut() else {
            panic!("live request slot points at a vacant batch record");
        };
        master.complete_mask |= kind.mask();
        if !ok {
            master.success = false;
        }
        match (kind, data) {
            (IoKind::RecvInitialMetadata, ReqData::RecvMetadata(md)) => {
                master.outcome.initial_metadata = Some(md);
            }
            (IoKind::RecvTrailingMetadata, ReqData::RecvMetadata(md)) => {
                master.outcome.trailing_metadata = Some(md);
            }
            (IoKind::RecvMessage, ReqData::RecvMessage(message)) => {
                master.outcome.message = Some(message);
            }
            _ => {}
        }

        if master.complete_mask == master.need_mask || !ok {
            let Some(mut master) = inner.masters[master_idx].take() else {
                unreachable!()
            };
            // On early failure, requests of this batch that never ran go
            // back to empty.
            for other in IoKind::ALL {
                if let SlotState::Live { master: m } = inner.reqs[other as usize].state {
                    if m == master_idx {
                        inner.reqs[other as usize].state = SlotState::Empty;
                        inner.reqs[other as usize].data = ReqData::None;
                    }
                }
            }
            if master.need_mask & (IoKind::RecvStatus.mask() | IoKind::RecvStatusDetails.mask()) != 0
            {
                master.outcome.status = Some(self.final_status_locked(inner));
            }
            if master.need_mask & IoKind::RecvClose.mask() != 0 {
                let status = self.final_status_locked(inner);
                master.outcome.cancelled = Some(status.code != StatusCode::Ok);
            }
            if let Some(on_complete) = master.on_complete.take() {
                inner.completed.push(CompletedBatch {
                    on_complete,
                    success: master.success,
                    outcome: master.outcome,
                });
            }
        }
    }

    // ---- send path ---------------------------------------------------

    fn is_live(inner: &CallInner, kind: IoKind) -> bool {
        matches!(inner.reqs[kind as usize].state, SlotState::Live { .. })
    }

    /// More inbound data is wanted while anything that consumes it is
    /// pending. A pending cancel or destroy also keeps reads going so the
    /// stream's closure is observed.
    fn need_more_data(&self, inner: &CallInner, cancel_pending: bool) -> bool {
        if inner.read_state == ReadState::StreamClosed {
            return false;
        }
        Self::is_live(inner, IoKind::RecvInitialMetadata)
            || (Self::is_live(inner, IoKind::RecvMessage) && inner.incoming.is_empty())
            || Self::is_live(inner, IoKind::RecvTrailingMetadata)
            || Self::is_live(inner, IoKind::RecvStatus)
            || Self::is_live(inner, IoKind::RecvStatusDetails)
            || (Self::is_live(inner, IoKind::RecvClose) && inner.incoming.is_empty())
            || (inner.write_state == WriteState::Initial && !self.is_client)
            || cancel_pending
            || inner.destroy_called
    }

    /// Assemble the next outbound batch from the live send requests, or
    /// `None` when nothing can make progress. Returns the mask of request
    /// kinds the batch carries.
    fn fill_send_batch(&self, inner: &mut CallInner) -> Option<(SendBatch, u16)> {
        let mut ops = StreamOpBuffer::new();
        let mut mask: u16 = 0;
        let mut is_last = false;

        if inner.write_state == WriteState::Initial {
            if !Self::is_live(inner, IoKind::SendInitialMetadata) {
                // Nothing may precede initial metadata.
                return None;
            }
            let mut buffer = MetadataBuffer::new();
            if let Some(path) = inner.path.take() {
                buffer.queue(path);
            }
            if let Some(authority) = inner.authority.take() {
                buffer.queue(authority);
            }
            let slot = &mut inner.reqs[IoKind::SendInitialMetadata as usize];
            if let ReqData::SendMetadata(md) = std::mem::take(&mut slot.data) {
                for elem in md {
                    buffer.queue(elem);
                }
            }
            let mut batch = buffer.flush();
            if self.is_client {
                if let Some(deadline) = inner.deadline {
                    batch.set_deadline(deadline);
                }
            }
            ops.put_metadata(batch);
            mask |= IoKind::SendInitialMetadata.mask();
            inner.write_state = WriteState::Started;
        }

        if inner.write_state == WriteState::Started {
            if Self::is_live(inner, IoKind::SendMessage) {
                let slot = &mut inner.reqs[IoKind::SendMessage as usize];
                if let ReqData::SendMessage(buffer, flags) = std::mem::take(&mut slot.data) {
                    let mut flags = flags;
                    if buffer
                        .compression()
                        .is_some_and(|a| a != CompressionAlgorithm::Identity)
                    {
                        flags |= message_flags::COMPRESSED;
                    }
                    ops.put_message(buffer.len() as u32, flags, buffer.slices().iter().cloned());
                    mask |= IoKind::SendMessage.mask();
                }
            }
            if Self::is_live(inner, IoKind::SendClose) {
                if self.is_client {
                    mask |= IoKind::SendClose.mask();
                    is_last = true;
                    inner.write_state = WriteState::WriteClosed;
                } else if Self::is_live(inner, IoKind::SendStatus) {
                    let mut buffer = MetadataBuffer::new();
                    if Self::is_live(inner, IoKind::SendTrailingMetadata) {
                        let slot = &mut inner.reqs[IoKind::SendTrailingMetadata as usize];
                        if let ReqData::SendMetadata(md) = std::mem::take(&mut slot.data) {
                            for elem in md {
                                buffer.queue(elem);
                            }
                        }
                        mask |= IoKind::SendTrailingMetadata.mask();
                    }
                    let slot = &mut inner.reqs[IoKind::SendStatus as usize];
                    if let ReqData::SendStatus { code, details } = std::mem::take(&mut slot.data) {
                        buffer.queue(self.channel.status_elem(code));
                        if let Some(details) = details {
                            buffer.queue(
                                self.channel
                                    .metadata_context()
                                    .elem_from_strings(self.channel.keys().message.clone(), details),
                            );
                        }
                    }
                    ops.put_metadata(buffer.flush());
                    mask |= IoKind::SendStatus.mask() | IoKind::SendClose.mask();
                    is_last = true;
                    inner.write_state = WriteState::WriteClosed;
                }
                // A server close waits until the status has been submitted.
            }
        }

        if mask == 0 {
            return None;
        }
        Some((SendBatch { ops, is_last }, mask))
    }

    /// Transport callback: the in-flight send batch has been written out.
    fn finished_send(self: &Arc<Self>, mask: u16, success: bool) {
        tracing::trace!(mask, success, "send batch finished");
        self.with_inner(|call, inner| {
            inner.sending = false;
            for kind in IoKind::ALL {
                if mask & kind.mask() != 0 {
                    call.finish_ioreq(inner, kind, success);
                }
            }
            if !success {
                inner.write_state = WriteState::WriteClosed;
                for kind in IoKind::ALL {
                    if kind.is_send() && Self::is_live(inner, kind) {
                        call.finish_ioreq(inner, kind, false);
                    }
                }
            }
        });
    }

    // ---- receive path -------------------------------------------------

    fn transport_recv(self: &Arc<Self>, ops: StreamOpBuffer, state: StreamState, success: bool) {
        self.with_inner(|call, inner| {
            inner.receiving = false;
            if success {
                for op in ops.drain() {
                    // A framing violation cancels the call; nothing after
                    // the offending op is looked at.
                    if inner.cancel_pending.is_some() {
                        break;
                    }
                    match op {
                        StreamOp::NoOp => {}
                        StreamOp::Metadata(batch) => call.recv_metadata_batch(inner, batch),
                        StreamOp::BeginMessage { length, flags } => {
                            call.begin_message(inner, length, flags)
                        }
                        StreamOp::Slice(slice) => call.recv_slice(inner, slice),
                    }
                }
            } else {
                for kind in [
                    IoKind::RecvInitialMetadata,
                    IoKind::RecvTrailingMetadata,
                    IoKind::RecvMessage,
                    IoKind::RecvStatus,
                    IoKind::RecvStatusDetails,
                    IoKind::RecvClose,
                ] {
                    if Self::is_live(inner, kind) {
                        call.finish_ioreq(inner, kind, false);
                    }
                }
            }
            if state >= StreamState::ReadClosed && inner.read_state < ReadState::ReadClosed {
                call.mark_read_closed(inner);
            }
            if state == StreamState::Closed && inner.read_state < ReadState::StreamClosed {
                call.mark_stream_closed(inner);
            }
        });
    }

    /// Split a received metadata batch into machinery headers (consumed
    /// here) and application headers (routed to the live or buffered
    /// destination). Which destination is initial vs trailing depends on
    /// how far the read side has advanced.
    fn recv_metadata_batch(self: &Arc<Self>, inner: &mut CallInner, batch: crate::metadata::MetadataBatch) {
        let keys = self.channel.keys();
        let deadline = batch.deadline();
        let is_initial = inner.read_state < ReadState::GotInitialMetadata;
        for elem in batch.drain() {
            if *elem.key() == keys.status {
                let record = &mut inner.status[StatusSource::Wire as usize];
                record.code = Some(elem.decoded_status());
            } else if *elem.key() == keys.message {
                let record = &mut inner.status[StatusSource::Wire as usize];
                record.details = Some(elem.value().clone());
            } else if *elem.key() == keys.encoding {
                match CompressionAlgorithm::from_wire(elem.value().as_bytes()) {
                    Some(algorithm) => inner.compression = Some(algorithm),
                    None => {
                        tracing::warn!(value = ?elem.value(), "unknown message encoding announced");
                        inner.compression = None;
                    }
                }
            } else if *elem.key() == keys.accept_encoding {
                inner.peer_accept_encodings = elem
                    .value()
                    .as_bytes()
                    .split(|&b| b == b',')
                    .filter_map(CompressionAlgorithm::from_wire)
                    .collect();
            } else {
                let live_kind = if is_initial {
                    IoKind::RecvInitialMetadata
                } else {
                    IoKind::RecvTrailingMetadata
                };
                if matches!(inner.reqs[live_kind as usize].state, SlotState::Live { .. }) {
                    if let ReqData::RecvMetadata(md) = &mut inner.reqs[live_kind as usize].data {
                        md.push(elem);
                    }
                } else if is_initial {
                    inner.buffered_initial_md.push(elem);
                } else {
                    inner.buffered_trailing_md.push(elem);
                }
            }
        }
        if is_initial {
            inner.saw_initial_metadata = true;
            inner.read_state = ReadState::GotInitialMetadata;
            self.finish_ioreq(inner, IoKind::RecvInitialMetadata, true);
            if !self.is_client {
                if let Some(deadline) = deadline {
                    inner.deadline = Some(deadline);
                    self.arm_alarm(inner, deadline);
                }
            }
        }
    }

    fn begin_message(self: &Arc<Self>, inner: &mut CallInner, length: u32, flags: u32) {
        if inner.assembling.is_some() {
            self.protocol_error(
                inner,
                StatusCode::InvalidArgument,
                "begin-message while a message is in progress".to_string(),
            );
            return;
        }
        let max = self.channel.config().max_message_length;
        if length as usize > max {
            self.protocol_error(
                inner,
                StatusCode::InvalidArgument,
                format!("message of {length} bytes exceeds maximum of {max}"),
            );
            return;
        }
        if flags & message_flags::COMPRESSED != 0 && inner.compression.is_none() {
            self.protocol_error(
                inner,
                StatusCode::Internal,
                "compressed message without a negotiated algorithm".to_string(),
            );
            return;
        }
        inner.assembling = Some(IncomingMessage {
            length,
            flags,
            buf: BytesMut::with_capacity(length as usize),
        });
        if length == 0 {
            self.end_message(inner);
        }
    }

    fn recv_slice(self: &Arc<Self>, inner: &mut CallInner, slice: Bytes) {
        let Some(assembling) = inner.assembling.as_mut() else {
            self.protocol_error(
                inner,
                StatusCode::InvalidArgument,
                "payload slice outside a message".to_string(),
            );
            return;
        };
        if assembling.buf.len() + slice.len() > assembling.length as usize {
            let declared = assembling.length;
            self.protocol_error(
                inner,
                StatusCode::InvalidArgument,
                format!("message length overflow: declared {declared} bytes"),
            );
            return;
        }
        assembling.buf.extend_from_slice(&slice);
        if assembling.buf.len() == assembling.length as usize {
            self.end_message(inner);
        }
    }

    fn end_message(self: &Arc<Self>, inner: &mut CallInner) {
        let Some(message) = inner.assembling.take() else {
            return;
        };
        let payload = message.buf.freeze();
        let buffer = if message.flags & message_flags::COMPRESSED != 0 {
            match inner.compression {
                Some(algorithm) => ByteBuffer::compressed(vec![payload], algorithm),
                // begin_message rejected this combination already.
                None => ByteBuffer::from_bytes(payload),
            }
        } else {
            ByteBuffer::from_bytes(payload)
        };
        if Self::is_live(inner, IoKind::RecvMessage) {
            inner.reqs[IoKind::RecvMessage as usize].data = ReqData::RecvMessage(Some(buffer));
            self.finish_ioreq(inner, IoKind::RecvMessage, true);
        } else {
            inner.incoming.push(buffer);
        }
    }

    fn protocol_error(self: &Arc<Self>, inner: &mut CallInner, code: StatusCode, message: String) {
        tracing::warn!(?code, message, "protocol violation, cancelling call");
        let details = self.channel.metadata_context().intern_str(&message);
        inner.status[StatusSource::Core as usize] = StatusRecord {
            code: Some(code),
            details: Some(details),
        };
        inner.cancel_pending = Some((code, Some(message)));
        inner.assembling = None;
    }

    /// The peer is done sending. Every pending receive can resolve.
    fn mark_read_closed(self: &Arc<Self>, inner: &mut CallInner) {
        inner.read_state = ReadState::ReadClosed;
        self.finish_ioreq(inner, IoKind::RecvInitialMetadata, inner.saw_initial_metadata);
        self.finish_ioreq(inner, IoKind::RecvMessage, true);
        self.finish_ioreq(inner, IoKind::RecvTrailingMetadata, true);
        self.finish_ioreq(inner, IoKind::RecvStatus, true);
        self.finish_ioreq(inner, IoKind::RecvStatusDetails, true);
    }

    /// The stream is gone in both directions.
    fn mark_stream_closed(self: &Arc<Self>, inner: &mut CallInner) {
        inner.read_state = ReadState::StreamClosed;
        if inner.incoming.is_empty() {
            self.finish_ioreq(inner, IoKind::RecvClose, true);
        }
        inner.write_state = WriteState::WriteClosed;
        for kind in IoKind::ALL {
            if kind.is_send() && Self::is_live(inner, kind) {
                self.finish_ioreq(inner, kind, false);
            }
        }
        if let Some(alarm) = inner.alarm.take() {
            alarm.abort();
        }
        inner.stream_open = false;
        inner.pending_child_cancels = std::mem::take(&mut inner.children);
        tracing::debug!("stream closed");
    }

    // ---- status -------------------------------------------------------

    /// Resolve the terminal status: the highest-precedence source that
    /// recorded one wins; a call that ends without any recorded status is
    /// `Unknown`.
    fn final_status_locked(&self, inner: &CallInner) -> FinalStatus {
        for source in SOURCE_PRIORITY {
            let record = &inner.status[source as usize];
            if let Some(code) = record.code {
                return FinalStatus {
                    code,
                    details: record.details.as_ref().map(MdStr::to_string_lossy),
                };
            }
        }
        FinalStatus {
            code: StatusCode::Unknown,
            details: None,
        }
    }

    // ---- deadline -----------------------------------------------------

    fn arm_alarm(self: &Arc<Self>, inner: &mut CallInner, deadline: Instant) {
        assert!(inner.alarm.is_none(), "deadline alarm armed twice");
        if inner.read_state == ReadState::StreamClosed {
            return;
        }
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            if let Some(call) = weak.upgrade() {
                call.deadline_expired();
            }
        });
        inner.alarm = Some(handle.abort_handle());
    }

    fn deadline_expired(self: &Arc<Self>) {
        tracing::debug!("deadline expired");
        self.with_inner(|call, inner| {
            inner.alarm = None;
            if inner.read_state == ReadState::StreamClosed {
                return;
            }
            let details = call
                .channel
                .metadata_context()
                .intern_str("deadline exceeded");
            inner.status[StatusSource::Core as usize] = StatusRecord {
                code: Some(StatusCode::DeadlineExceeded),
                details: Some(details),
            };
            inner.cancel_pending = Some((
                StatusCode::DeadlineExceeded,
                Some("deadline exceeded".to_string()),
            ));
        });
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(alarm) = inner.alarm.take() {
            alarm.abort();
        }
        if !inner.torn_down {
            inner.torn_down = true;
            self.channel.stack().destroy_call(&self.call_stack);
        }
    }
}
