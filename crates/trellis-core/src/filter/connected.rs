//! The terminal filter: hands stream ops to the transport and relays
//! transport events back up the stack.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::call::CallRef;
use crate::config::ChannelArgs;
use crate::filter::{ChannelOp, ChannelStack, Filter, FilterContext, FilterState};
use crate::transport::{
    ServerTransportData, StreamId, Transport, TransportEventSink, TransportStreamOp,
};

pub struct ConnectedFilter {
    transport: Arc<dyn Transport>,
}

impl ConnectedFilter {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self { transport })
    }
}

impl Filter for ConnectedFilter {
    fn name(&self) -> &'static str {
        "connected"
    }

    fn is_terminal(&self) -> bool {
        true
    }

    fn init_channel_state(
        &self,
        _args: &ChannelArgs,
        stack: &Weak<ChannelStack>,
        index: usize,
    ) -> FilterState {
        let stack = stack.clone();
        self.transport
            .set_event_sink(TransportEventSink::new(move |event| {
                if let Some(stack) = stack.upgrade() {
                    stack.raise_transport_event(index, event);
                }
            }));
        Box::new(())
    }

    fn init_call_state(
        &self,
        _channel_state: &Mutex<FilterState>,
        call: &CallRef,
        server_data: Option<ServerTransportData>,
    ) -> FilterState {
        let id = self.transport.init_stream(call.clone(), server_data);
        tracing::debug!(stream = id.0, server = server_data.is_some(), "stream created");
        Box::new(id)
    }

    fn destroy_call_state(&self, state: FilterState) {
        if let Ok(id) = state.downcast::<StreamId>() {
            tracing::debug!(stream = id.0, "stream destroyed");
            self.transport.destroy_stream(*id);
        }
    }

    fn start_stream_op(&self, ctx: &FilterContext<'_>, op: TransportStreamOp) {
        let id = ctx.with_call_state(|state| {
            *state
                .downcast_ref::<StreamId>()
                .unwrap_or_else(|| panic!("connected filter call state is not a stream id"))
        });
        self.transport.perform_op(id, op);
    }

    fn channel_op(&self, ctx: &FilterContext<'_>, op: ChannelOp) {
        match op {
            ChannelOp::Disconnect => self.transport.close(),
            // Transport events originate here; anything arriving from above
            // just continues upward.
            ChannelOp::Transport(_) => ctx.forward_channel_op(op),
        }
    }
}
