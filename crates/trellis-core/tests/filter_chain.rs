//! Filter stack mechanics: op flow, per-call state and event relay.

#![cfg(feature = "mem")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use trellis_core::filter::{ChannelStack, FilterContext, FilterState};
use trellis_core::transport::mem::MemTransport;
use trellis_core::{
    BatchOp, CallRef, Channel, ChannelArgs, CompletionQueue, Filter, ServerTransportData,
    StatusCode, TransportEvent, TransportStreamOp,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Counts the stream ops that pass through, per call and channel-wide.
struct CountingFilter {
    channel_ops: AtomicUsize,
}

impl CountingFilter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            channel_ops: AtomicUsize::new(0),
        })
    }

    fn total(&self) -> usize {
        self.channel_ops.load(Ordering::Relaxed)
    }
}

impl Filter for CountingFilter {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn init_channel_state(
        &self,
        _args: &ChannelArgs,
        _stack: &Weak<ChannelStack>,
        _index: usize,
    ) -> FilterState {
        Box::new(())
    }

    fn init_call_state(
        &self,
        _channel_state: &Mutex<FilterState>,
        _call: &CallRef,
        _server_data: Option<ServerTransportData>,
    ) -> FilterState {
        Box::new(0usize)
    }

    fn start_stream_op(&self, ctx: &FilterContext<'_>, op: TransportStreamOp) {
        self.channel_ops.fetch_add(1, Ordering::Relaxed);
        ctx.with_call_state(|state| {
            if let Some(count) = state.downcast_mut::<usize>() {
                *count += 1;
            }
        });
        ctx.forward(op);
    }
}

#[tokio::test]
async fn ops_traverse_every_filter_before_the_transport() {
    init_logging();
    let transport = MemTransport::new();
    let counter = CountingFilter::new();
    let channel = Channel::new(
        transport.clone(),
        vec![counter.clone() as Arc<dyn Filter>],
        &ChannelArgs::new(),
    );
    let cq = CompletionQueue::new();
    let call = channel.create_call(cq.clone(), "/test.Svc/M", None, None);

    call.start_batch(
        vec![BatchOp::SendInitialMetadata {
            metadata: Vec::new(),
            flags: 0,
        }],
        1,
    )
    .unwrap();
    cq.next().await.unwrap();

    // The filter saw the op, and the terminal filter still delivered it.
    assert_eq!(counter.total(), 1);
    assert_eq!(transport.take_ops().len(), 1);
}

#[tokio::test]
async fn transport_events_are_relayed_to_the_channel() {
    init_logging();
    let transport = MemTransport::new();
    let counter = CountingFilter::new();
    let channel = Channel::new(
        transport.clone(),
        vec![counter as Arc<dyn Filter>],
        &ChannelArgs::new(),
    );
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        channel.set_event_handler(move |event| {
            seen.lock().push(match event {
                TransportEvent::AcceptStream(_) => "accept".to_string(),
                TransportEvent::GoawayReceived { status, .. } => format!("goaway:{status:?}"),
                TransportEvent::Closed => "closed".to_string(),
            });
        });
    }

    transport.raise_goaway(StatusCode::Unavailable, "maintenance");
    transport.raise_closed();
    assert_eq!(
        *seen.lock(),
        vec!["goaway:Unavailable".to_string(), "closed".to_string()]
    );
}

#[tokio::test]
async fn disconnect_reaches_the_transport() {
    init_logging();
    let transport = MemTransport::new();
    let channel = Channel::new(transport.clone(), Vec::new(), &ChannelArgs::new());
    assert!(!transport.is_closed());
    channel.disconnect();
    assert!(transport.is_closed());
}
