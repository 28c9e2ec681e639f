//! Server-side call flows: stream adoption, wire deadlines and terminal
//! status emission.

#![cfg(feature = "mem")]

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use trellis_core::transport::mem::MemTransport;
use trellis_core::{
    AppMetadata, BatchOp, Call, Channel, ChannelArgs, CompletionQueue, MetadataBatch, StatusCode,
    StreamId, StreamOp, StreamOpBuffer, StreamState, TransportEvent,
};

struct ServerHarness {
    transport: Arc<MemTransport>,
    channel: Arc<Channel>,
    cq: Arc<CompletionQueue>,
    accepted: Arc<Mutex<Vec<Arc<Call>>>>,
}

fn server() -> ServerHarness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let transport = MemTransport::new();
    let channel = Channel::new(transport.clone(), Vec::new(), &ChannelArgs::new());
    let cq = CompletionQueue::new();
    let accepted: Arc<Mutex<Vec<Arc<Call>>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let weak = Arc::downgrade(&channel);
        let cq = cq.clone();
        let accepted = accepted.clone();
        channel.set_event_handler(move |event| {
            if let TransportEvent::AcceptStream(data) = event {
                if let Some(channel) = weak.upgrade() {
                    accepted
                        .lock()
                        .push(channel.create_server_call(cq.clone(), data));
                }
            }
        });
    }
    ServerHarness {
        transport,
        channel,
        cq,
        accepted,
    }
}

impl ServerHarness {
    fn accept(&self) -> (Arc<Call>, StreamId) {
        let data = self.transport.accept_stream();
        let call = self
            .accepted
            .lock()
            .pop()
            .expect("accept handler created a call");
        assert!(!call.is_client());
        (call, StreamId(data.0))
    }

    fn deliver_initial_metadata(&self, stream: StreamId, deadline: Option<Instant>) {
        let ctx = self.channel.metadata_context();
        let mut batch = MetadataBatch::new();
        batch.add_tail(ctx.elem(b":path", b"/test.Svc/Method"));
        batch.add_tail(ctx.elem(b"x-request", b"abc"));
        if let Some(deadline) = deadline {
            batch.set_deadline(deadline);
        }
        let mut ops = StreamOpBuffer::new();
        ops.put_metadata(batch);
        self.transport.deliver(stream, ops, StreamState::Open, true);
    }
}

#[tokio::test]
async fn server_calls_bind_their_queue_at_creation() {
    let harness = server();
    let (_call, stream) = harness.accept();

    // Before any batch is submitted, the queue binding and first read have
    // already gone down to the transport.
    let recorded = harness.transport.take_ops();
    let op = recorded
        .iter()
        .find(|op| op.stream == stream)
        .expect("an op at call creation");
    assert!(op.bound_cq.is_some());
    assert!(op.recv_bytes.is_some());
}

#[tokio::test]
async fn server_receives_initial_metadata_and_sends_status() {
    let harness = server();
    let (call, stream) = harness.accept();

    call.start_batch(vec![BatchOp::RecvInitialMetadata], 1).unwrap();
    harness.deliver_initial_metadata(stream, None);
    let event = harness.cq.next().await.unwrap();
    assert_eq!(event.tag, 1);
    let initial = event.outcome.initial_metadata.unwrap();
    let keys: Vec<_> = initial.iter().map(|e| e.key().as_bytes().to_vec()).collect();
    assert!(keys.contains(&b":path".to_vec()));
    assert!(keys.contains(&b"x-request".to_vec()));

    harness.transport.take_ops();
    call.start_batch(
        vec![
            BatchOp::SendInitialMetadata {
                metadata: vec![AppMetadata::new("x-server", "1")],
                flags: 0,
            },
            BatchOp::SendStatusFromServer {
                trailing_metadata: vec![AppMetadata::new("x-took", "2ms")],
                code: StatusCode::Ok,
                details: Some("done".to_string()),
            },
        ],
        2,
    )
    .unwrap();
    let event = harness.cq.next().await.unwrap();
    assert_eq!(event.tag, 2);
    assert!(event.success);

    // One transport batch: initial metadata, then trailing metadata closing
    // with the machinery status headers.
    let recorded = harness.transport.take_ops();
    let send = recorded
        .iter()
        .find_map(|op| op.send.as_ref())
        .expect("a send batch");
    assert!(send.is_last);
    let metadata_batches: Vec<_> = send
        .ops
        .iter()
        .filter_map(|op| match op {
            StreamOp::Metadata(md) => Some(md),
            _ => None,
        })
        .collect();
    assert_eq!(metadata_batches.len(), 2);
    let trailing_keys: Vec<_> = metadata_batches[1]
        .iter()
        .map(|e| e.key().as_bytes().to_vec())
        .collect();
    assert!(trailing_keys.contains(&b"x-took".to_vec()));
    assert!(trailing_keys.contains(&b"trellis-status".to_vec()));
    assert!(trailing_keys.contains(&b"trellis-message".to_vec()));
}

#[tokio::test]
async fn server_close_waits_for_submitted_status() {
    let harness = server();
    let (call, stream) = harness.accept();
    harness.deliver_initial_metadata(stream, None);
    harness.transport.take_ops();

    // Initial metadata alone: the write side opens but cannot finish yet.
    call.start_batch(
        vec![BatchOp::SendInitialMetadata {
            metadata: Vec::new(),
            flags: 0,
        }],
        1,
    )
    .unwrap();
    harness.cq.next().await.unwrap();
    let recorded = harness.transport.take_ops();
    assert!(recorded.iter().all(|op| op
        .send
        .as_ref()
        .map_or(true, |send| !send.is_last)));

    call.start_batch(
        vec![BatchOp::SendStatusFromServer {
            trailing_metadata: Vec::new(),
            code: StatusCode::NotFound,
            details: None,
        }],
        2,
    )
    .unwrap();
    let event = harness.cq.next().await.unwrap();
    assert_eq!(event.tag, 2);
    let recorded = harness.transport.take_ops();
    let send = recorded
        .iter()
        .find_map(|op| op.send.as_ref())
        .expect("closing send batch");
    assert!(send.is_last);
}

#[tokio::test]
async fn wire_deadline_arms_and_expires_on_the_server() {
    let harness = server();
    let (call, stream) = harness.accept();
    harness.deliver_initial_metadata(stream, Some(Instant::now() + Duration::from_millis(20)));
    assert!(call.deadline().is_some());

    tokio::time::sleep(Duration::from_millis(80)).await;

    // The expired deadline cancelled the call; receive-close reports it.
    call.start_batch(vec![BatchOp::RecvCloseOnServer], 1).unwrap();
    let event = harness.cq.next().await.unwrap();
    assert_eq!(event.tag, 1);
    assert_eq!(event.outcome.cancelled, Some(true));
}

#[tokio::test]
async fn recv_close_reports_clean_end() {
    let harness = server();
    let (call, stream) = harness.accept();
    harness.deliver_initial_metadata(stream, None);

    call.start_batch(vec![BatchOp::RecvCloseOnServer], 1).unwrap();
    call.start_batch(
        vec![
            BatchOp::SendInitialMetadata {
                metadata: Vec::new(),
                flags: 0,
            },
            BatchOp::SendStatusFromServer {
                trailing_metadata: Vec::new(),
                code: StatusCode::Ok,
                details: None,
            },
        ],
        2,
    )
    .unwrap();
    harness.cq.next().await.unwrap();

    harness.transport.close_stream(stream);
    let event = harness.cq.next().await.unwrap();
    assert_eq!(event.tag, 1);
    assert_eq!(event.outcome.cancelled, Some(false));
}
