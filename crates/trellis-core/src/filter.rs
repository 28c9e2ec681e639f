//! The channel filter chain.
//!
//! A channel is a fixed stack of filters ending in a terminal filter that
//! binds the transport. Stream ops flow top-down through the stack; each
//! filter may observe or rewrite an op before forwarding it. Connection
//! events raised by the transport flow bottom-up and exit at the channel.

use std::any::Any;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::call::CallRef;
use crate::config::ChannelArgs;
use crate::transport::{ServerTransportData, TransportEvent, TransportStreamOp};

pub mod connected;

/// Per-channel or per-call filter state. Filters downcast to their own type.
pub type FilterState = Box<dyn Any + Send>;

/// Operations that travel through the channel stack outside any one call.
#[derive(Debug)]
pub enum ChannelOp {
    /// Tear the connection down. Flows top-down.
    Disconnect,
    /// A transport-originated event. Flows bottom-up.
    Transport(TransportEvent),
}

/// One element of the channel stack.
pub trait Filter: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Terminal filters bind the transport and must sit last in the stack.
    fn is_terminal(&self) -> bool {
        false
    }

    /// Build this filter's channel-wide state. `stack` and `index` locate
    /// the filter within the (not yet fully constructed) stack, for filters
    /// that need to raise ops later.
    fn init_channel_state(
        &self,
        args: &ChannelArgs,
        stack: &Weak<ChannelStack>,
        index: usize,
    ) -> FilterState;

    fn destroy_channel_state(&self, _state: FilterState) {}

    /// Build this filter's state for one call.
    fn init_call_state(
        &self,
        channel_state: &Mutex<FilterState>,
        call: &CallRef,
        server_data: Option<ServerTransportData>,
    ) -> FilterState;

    fn destroy_call_state(&self, _state: FilterState) {}

    /// Handle a stream op for one call. Non-terminal filters forward via
    /// [`FilterContext::forward`]; the terminal filter consumes the op.
    fn start_stream_op(&self, ctx: &FilterContext<'_>, op: TransportStreamOp);

    /// Handle a channel-level op. The default passes it along unchanged.
    fn channel_op(&self, ctx: &FilterContext<'_>, op: ChannelOp) {
        ctx.forward_channel_op(op)
    }
}

struct Slot {
    filter: Arc<dyn Filter>,
    channel_state: Mutex<FilterState>,
}

/// The constructed filter stack for one channel.
pub struct ChannelStack {
    slots: Vec<Slot>,
    /// Receives bottom-up ops that pass the topmost filter.
    event_sink: Mutex<Option<Box<dyn Fn(TransportEvent) + Send + Sync>>>,
}

impl ChannelStack {
    /// Build the stack. Panics unless exactly the last filter is terminal;
    /// the layout is a construction-time decision, not a runtime condition.
    pub fn new(filters: Vec<Arc<dyn Filter>>, args: &ChannelArgs) -> Arc<Self> {
        assert!(!filters.is_empty(), "channel stack requires a terminal filter");
        for (i, f) in filters.iter().enumerate() {
            let last = i == filters.len() - 1;
            assert_eq!(
                f.is_terminal(),
                last,
                "filter {:?} at index {i} breaks the terminal-last layout",
                f.name()
            );
        }
        Arc::new_cyclic(|weak: &Weak<ChannelStack>| {
            let slots = filters
                .into_iter()
                .enumerate()
                .map(|(index, filter)| {
                    let channel_state = Mutex::new(filter.init_channel_state(args, weak, index));
                    Slot {
                        filter,
                        channel_state,
                    }
                })
                .collect();
            ChannelStack {
                slots,
                event_sink: Mutex::new(None),
            }
        })
    }

    pub fn set_event_sink(&self, sink: impl Fn(TransportEvent) + Send + Sync + 'static) {
        *self.event_sink.lock() = Some(Box::new(sink));
    }

    pub fn filter_count(&self) -> usize {
        self.slots.len()
    }

    /// Build the per-call state column for a new call.
    pub fn init_call(&self, call: CallRef, server_data: Option<ServerTransportData>) -> CallStack {
        let states = self
            .slots
            .iter()
            .map(|slot| {
                Mutex::new(Some(slot.filter.init_call_state(
                    &slot.channel_state,
                    &call,
                    server_data,
                )))
            })
            .collect();
        CallStack { call, states }
    }

    /// Tear down a call's filter states (reverse order) after its stream has
    /// fully closed.
    pub fn destroy_call(&self, call_stack: &CallStack) {
        for (slot, state) in self.slots.iter().zip(&call_stack.states).rev() {
            if let Some(state) = state.lock().take() {
                slot.filter.destroy_call_state(state);
            }
        }
    }

    /// Enter the stack at the top with a stream op for `call_stack`.
    pub fn start_op(&self, call_stack: &CallStack, op: TransportStreamOp) {
        self.dispatch_op(call_stack, 0, op)
    }

    fn dispatch_op(&self, call_stack: &CallStack, index: usize, op: TransportStreamOp) {
        let slot = &self.slots[index];
        let ctx = FilterContext {
            stack: self,
            call_stack: Some(call_stack),
            index,
        };
        slot.filter.start_stream_op(&ctx, op);
    }

    /// Enter the stack at the top with a channel op flowing down.
    pub fn channel_op(&self, op: ChannelOp) {
        self.dispatch_channel_op(0, op)
    }

    /// Raise a transport event from the filter at `from` upward.
    pub fn raise_transport_event(&self, from: usize, event: TransportEvent) {
        if from == 0 {
            self.deliver_event(event);
        } else {
            self.dispatch_channel_op(from - 1, ChannelOp::Transport(event));
        }
    }

    fn dispatch_channel_op(&self, index: usize, op: ChannelOp) {
        let slot = &self.slots[index];
        let ctx = FilterContext {
            stack: self,
            call_stack: None,
            index,
        };
        slot.filter.channel_op(&ctx, op);
    }

    fn deliver_event(&self, event: TransportEvent) {
        let sink = self.event_sink.lock();
        match &*sink {
            Some(sink) => sink(event),
            None => tracing::debug!(?event, "transport event dropped, no sink registered"),
        }
    }
}

impl Drop for ChannelStack {
    fn drop(&mut self) {
        for slot in self.slots.drain(..).rev() {
            let state = slot.channel_state.into_inner();
            slot.filter.destroy_channel_state(state);
        }
    }
}

/// Per-call filter states, one per stack slot. Slots are `None` once the
/// call has been torn down.
pub struct CallStack {
    call: CallRef,
    states: Vec<Mutex<Option<FilterState>>>,
}

impl CallStack {
    pub fn call(&self) -> &CallRef {
        &self.call
    }
}

/// Handed to a filter for the duration of one op dispatch.
pub struct FilterContext<'a> {
    stack: &'a ChannelStack,
    call_stack: Option<&'a CallStack>,
    index: usize,
}

impl<'a> FilterContext<'a> {
    /// The call this op belongs to. Only valid during stream-op dispatch.
    pub fn call(&self) -> &CallRef {
        self.call_stack
            .map(CallStack::call)
            .unwrap_or_else(|| panic!("channel op dispatch has no call"))
    }

    /// This filter's channel-wide state.
    pub fn channel_state(&self) -> &Mutex<FilterState> {
        &self.stack.slots[self.index].channel_state
    }

    /// Run `f` with this filter's state for the current call.
    pub fn with_call_state<R>(&self, f: impl FnOnce(&mut FilterState) -> R) -> R {
        let call_stack = self
            .call_stack
            .unwrap_or_else(|| panic!("channel op dispatch has no call state"));
        let mut guard = call_stack.states[self.index].lock();
        let state = guard
            .as_mut()
            .unwrap_or_else(|| panic!("stream op on a destroyed call state"));
        f(state)
    }

    /// Pass a stream op to the next filter down.
    pub fn forward(&self, op: TransportStreamOp) {
        let call_stack = self
            .call_stack
            .unwrap_or_else(|| panic!("channel op dispatch cannot forward stream ops"));
        assert!(
            self.index + 1 < self.stack.slots.len(),
            "terminal filter tried to forward a stream op"
        );
        self.stack.dispatch_op(call_stack, self.index + 1, op);
    }

    /// Pass a channel op along in its direction of travel.
    pub fn forward_channel_op(&self, op: ChannelOp) {
        match op {
            ChannelOp::Disconnect => {
                assert!(
                    self.index + 1 < self.stack.slots.len(),
                    "terminal filter tried to forward a disconnect"
                );
                self.stack.dispatch_channel_op(self.index + 1, op);
            }
            ChannelOp::Transport(event) => {
                self.stack.raise_transport_event(self.index, event);
            }
        }
    }
}
