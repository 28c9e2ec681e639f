//! Terminal status resolution when several sources disagree.

#![cfg(feature = "mem")]

use std::sync::Arc;

use trellis_core::transport::mem::MemTransport;
use trellis_core::{
    BatchOp, Call, Channel, ChannelArgs, CompletionQueue, FinalStatus, MetadataBatch, StatusCode,
    StreamId, StreamOpBuffer, StreamState,
};

fn client_call() -> (Arc<MemTransport>, Arc<Channel>, Arc<CompletionQueue>, Arc<Call>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let transport = MemTransport::new();
    let channel = Channel::new(transport.clone(), Vec::new(), &ChannelArgs::new());
    let cq = CompletionQueue::new();
    let call = channel.create_call(cq.clone(), "/test.Svc/Method", None, None);
    (transport, channel, cq, call)
}

fn deliver_wire_status(
    transport: &MemTransport,
    channel: &Channel,
    stream: StreamId,
    code: u32,
    message: &str,
) {
    let ctx = channel.metadata_context();
    let mut batch = MetadataBatch::new();
    batch.add_tail(ctx.elem(b"trellis-status", code.to_string().as_bytes()));
    batch.add_tail(ctx.elem(b"trellis-message", message.as_bytes()));
    let mut ops = StreamOpBuffer::new();
    ops.put_metadata(batch);
    transport.deliver(stream, ops, StreamState::Closed, true);
}

async fn final_status(cq: &CompletionQueue, call: &Arc<Call>) -> FinalStatus {
    call.start_batch(vec![BatchOp::RecvStatusOnClient], 99).unwrap();
    let event = cq.next().await.unwrap();
    assert_eq!(event.tag, 99);
    event.outcome.status.unwrap()
}

#[tokio::test]
async fn wire_status_applies_when_nothing_outranks_it() {
    let (transport, channel, cq, call) = client_call();
    call.start_batch(
        vec![BatchOp::SendInitialMetadata {
            metadata: Vec::new(),
            flags: 0,
        }],
        1,
    )
    .unwrap();
    let stream = transport.take_ops()[0].stream;
    cq.next().await.unwrap();

    // Initial metadata first, so the status batch counts as trailing.
    transport.deliver(
        stream,
        StreamOpBuffer::from_iter([trellis_core::StreamOp::Metadata(MetadataBatch::new())]),
        StreamState::Open,
        true,
    );
    assert!(cq.try_next().is_none());
    deliver_wire_status(&transport, &channel, stream, 5, "missing");

    let status = final_status(&cq, &call).await;
    assert_eq!(status.code, StatusCode::NotFound);
    assert_eq!(status.details.as_deref(), Some("missing"));
}

#[tokio::test]
async fn local_cancellation_outranks_the_wire() {
    let (transport, channel, cq, call) = client_call();
    transport.set_auto_close_on_cancel(false);
    call.start_batch(
        vec![BatchOp::SendInitialMetadata {
            metadata: Vec::new(),
            flags: 0,
        }],
        1,
    )
    .unwrap();
    let stream = transport.take_ops()[0].stream;
    cq.next().await.unwrap();

    call.cancel_with_status(StatusCode::PermissionDenied, Some("not for you"));
    // The peer still reports success before the stream ends.
    deliver_wire_status(&transport, &channel, stream, 0, "server says ok");

    let status = final_status(&cq, &call).await;
    assert_eq!(status.code, StatusCode::PermissionDenied);
    assert_eq!(status.details.as_deref(), Some("not for you"));
}

#[tokio::test]
async fn plain_cancel_reports_cancelled() {
    let (transport, _channel, cq, call) = client_call();
    call.start_batch(
        vec![BatchOp::SendInitialMetadata {
            metadata: Vec::new(),
            flags: 0,
        }],
        1,
    )
    .unwrap();
    let _ = transport.take_ops();
    cq.next().await.unwrap();

    // Auto-close on cancel: the stream dies as soon as the cancel lands.
    call.cancel();

    let status = final_status(&cq, &call).await;
    assert_eq!(status.code, StatusCode::Cancelled);
}

#[tokio::test]
async fn unresolved_calls_end_as_unknown() {
    let (transport, _channel, cq, call) = client_call();
    call.start_batch(
        vec![BatchOp::SendInitialMetadata {
            metadata: Vec::new(),
            flags: 0,
        }],
        1,
    )
    .unwrap();
    let stream = transport.take_ops()[0].stream;
    cq.next().await.unwrap();

    // The stream closes without the peer ever reporting a status.
    transport.close_stream(stream);

    let status = final_status(&cq, &call).await;
    assert_eq!(status.code, StatusCode::Unknown);
    assert!(status.details.is_none());
}
