//! End-to-end call flows over the in-memory transport.

#![cfg(feature = "mem")]

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use trellis_core::transport::mem::MemTransport;
use trellis_core::{
    AppMetadata, BatchOp, ByteBuffer, Channel, ChannelArgs, CompletionQueue, MetadataBatch,
    StatusCode, StreamId, StreamOp, StreamOpBuffer, StreamState,
};

fn setup() -> (Arc<MemTransport>, Arc<Channel>, Arc<CompletionQueue>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let transport = MemTransport::new();
    let channel = Channel::new(transport.clone(), Vec::new(), &ChannelArgs::new());
    let cq = CompletionQueue::new();
    (transport, channel, cq)
}

fn metadata_ops(channel: &Channel, pairs: &[(&[u8], &[u8])]) -> StreamOpBuffer {
    let ctx = channel.metadata_context();
    let mut batch = MetadataBatch::new();
    for (key, value) in pairs {
        batch.add_tail(ctx.elem(key, value));
    }
    let mut ops = StreamOpBuffer::new();
    ops.put_metadata(batch);
    ops
}

fn message_ops(payload: &[u8]) -> StreamOpBuffer {
    let mut ops = StreamOpBuffer::new();
    ops.put_message(
        payload.len() as u32,
        0,
        [Bytes::copy_from_slice(payload)],
    );
    ops
}

fn sent_stream(transport: &MemTransport) -> StreamId {
    let ops = transport.take_ops();
    assert!(!ops.is_empty(), "no transport op recorded");
    ops[0].stream
}

#[tokio::test]
async fn client_unary_round_trip() {
    let (transport, channel, cq) = setup();
    let call = channel.create_call(cq.clone(), "/echo.Echo/Ping", Some("example.com"), None);

    call.start_batch(
        vec![
            BatchOp::SendInitialMetadata {
                metadata: vec![AppMetadata::new("x-client", "hi")],
                flags: 0,
            },
            BatchOp::SendMessage {
                buffer: ByteBuffer::from_bytes(Bytes::from_static(b"ping")),
                flags: 0,
            },
            BatchOp::SendCloseFromClient,
            BatchOp::RecvInitialMetadata,
        ],
        1,
    )
    .unwrap();

    // Everything sendable went out as one batch: routing headers, the
    // framed message, and the half-close.
    let recorded = transport.take_ops();
    assert_eq!(recorded.len(), 1);
    let stream = recorded[0].stream;
    let send = recorded[0].send.as_ref().expect("send batch");
    assert!(send.is_last);
    let ops: Vec<_> = send.ops.iter().collect();
    match &ops[0] {
        StreamOp::Metadata(md) => {
            let keys: Vec<_> = md.iter().map(|e| e.key().as_bytes().to_vec()).collect();
            assert!(keys.contains(&b":path".to_vec()));
            assert!(keys.contains(&b":authority".to_vec()));
            assert!(keys.contains(&b"x-client".to_vec()));
        }
        other => panic!("expected metadata first, got {other:?}"),
    }
    assert!(matches!(
        ops[1],
        StreamOp::BeginMessage { length: 4, flags: 0 }
    ));
    assert!(matches!(ops[2], StreamOp::Slice(_)));

    // The send half of the batch finished; it waits on initial metadata.
    assert!(cq.try_next().is_none());

    transport.deliver(
        stream,
        metadata_ops(&channel, &[(b"x-server", b"yo")]),
        StreamState::Open,
        true,
    );
    let event = cq.next().await.unwrap();
    assert_eq!(event.tag, 1);
    assert!(event.success);
    let initial = event.outcome.initial_metadata.unwrap();
    assert_eq!(initial.len(), 1);
    assert_eq!(initial[0].key().as_bytes(), b"x-server");

    call.start_batch(vec![BatchOp::RecvMessage], 2).unwrap();
    transport.deliver(stream, message_ops(b"pong"), StreamState::Open, true);
    let event = cq.next().await.unwrap();
    assert_eq!(event.tag, 2);
    let message = event.outcome.message.unwrap().expect("a message");
    assert_eq!(&message.concat()[..], b"pong");

    // Trailing metadata carries the terminal status, then the stream ends.
    transport.deliver(
        stream,
        metadata_ops(&channel, &[(b"trellis-status", b"0")]),
        StreamState::ReadClosed,
        true,
    );
    transport.deliver(stream, StreamOpBuffer::new(), StreamState::Closed, true);

    call.start_batch(vec![BatchOp::RecvStatusOnClient], 3).unwrap();
    let event = cq.next().await.unwrap();
    assert_eq!(event.tag, 3);
    assert!(event.success);
    let status = event.outcome.status.unwrap();
    assert_eq!(status.code, StatusCode::Ok);

    call.destroy();
    assert_eq!(transport.destroyed_streams(), vec![stream]);
}

#[tokio::test]
async fn message_longer_than_declared_cancels_before_delivery() {
    let (transport, channel, cq) = setup();
    transport.set_auto_close_on_cancel(false);
    let call = channel.create_call(cq.clone(), "/echo.Echo/Ping", None, None);

    call.start_batch(
        vec![
            BatchOp::SendInitialMetadata {
                metadata: Vec::new(),
                flags: 0,
            },
            BatchOp::RecvMessage,
        ],
        1,
    )
    .unwrap();
    let stream = sent_stream(&transport);

    // Declared ten bytes, deliver twelve.
    let mut ops = StreamOpBuffer::new();
    ops.push(StreamOp::BeginMessage {
        length: 10,
        flags: 0,
    });
    ops.push(StreamOp::Slice(Bytes::from_static(b"abcdef")));
    ops.push(StreamOp::Slice(Bytes::from_static(b"ghijkl")));
    transport.deliver(stream, ops, StreamState::Open, true);

    let recorded = transport.take_ops();
    let cancel = recorded
        .iter()
        .find_map(|op| op.cancel.as_ref())
        .expect("a cancel op");
    assert_eq!(cancel.0, StatusCode::InvalidArgument);
    assert!(cancel.1.as_deref().unwrap().contains("overflow"));

    // No message was delivered from the bad frame.
    transport.close_stream(stream);
    let event = cq.next().await.unwrap();
    assert_eq!(event.tag, 1);
    assert!(matches!(event.outcome.message, Some(None)));

    call.start_batch(vec![BatchOp::RecvStatusOnClient], 2).unwrap();
    let event = cq.next().await.unwrap();
    let status = event.outcome.status.unwrap();
    assert_eq!(status.code, StatusCode::InvalidArgument);
    assert!(status.details.unwrap().contains("overflow"));
}

#[tokio::test]
async fn deadline_expiry_cancels_with_deadline_exceeded() {
    let (transport, channel, cq) = setup();
    let call = channel.create_call(
        cq.clone(),
        "/echo.Echo/Slow",
        None,
        Some(Instant::now() + Duration::from_millis(20)),
    );

    call.start_batch(
        vec![BatchOp::SendInitialMetadata {
            metadata: Vec::new(),
            flags: 0,
        }],
        1,
    )
    .unwrap();
    let event = cq.next().await.unwrap();
    assert_eq!(event.tag, 1);
    assert!(event.success);

    // Let the alarm fire; the transport closes the stream on cancel.
    tokio::time::sleep(Duration::from_millis(80)).await;

    call.start_batch(vec![BatchOp::RecvStatusOnClient], 2).unwrap();
    let event = cq.next().await.unwrap();
    let status = event.outcome.status.unwrap();
    assert_eq!(status.code, StatusCode::DeadlineExceeded);
    assert_eq!(status.details.as_deref(), Some("deadline exceeded"));
}

#[tokio::test]
async fn destroy_with_open_stream_cancels_then_tears_down() {
    let (transport, channel, cq) = setup();
    transport.set_auto_close_on_cancel(false);
    let call = channel.create_call(cq.clone(), "/echo.Echo/Ping", None, None);

    call.start_batch(
        vec![BatchOp::SendInitialMetadata {
            metadata: Vec::new(),
            flags: 0,
        }],
        1,
    )
    .unwrap();
    let stream = sent_stream(&transport);
    cq.next().await.unwrap();

    call.destroy();

    // The implicit cancellation went out, but transport resources are held
    // until the stream has actually closed.
    let recorded = transport.take_ops();
    let cancel = recorded
        .iter()
        .find_map(|op| op.cancel.as_ref())
        .expect("a cancel op");
    assert_eq!(cancel.0, StatusCode::Cancelled);
    assert!(transport.destroyed_streams().is_empty());

    transport.close_stream(stream);
    assert_eq!(transport.destroyed_streams(), vec![stream]);
}

#[tokio::test]
async fn recv_initial_metadata_fails_when_stream_closed_without_it() {
    let (transport, channel, cq) = setup();
    let call = channel.create_call(cq.clone(), "/echo.Echo/Ping", None, None);

    call.start_batch(
        vec![BatchOp::SendInitialMetadata {
            metadata: Vec::new(),
            flags: 0,
        }],
        1,
    )
    .unwrap();
    let stream = sent_stream(&transport);
    cq.next().await.unwrap();

    // The stream dies before the peer ever sent its headers.
    transport.close_stream(stream);

    call.start_batch(vec![BatchOp::RecvInitialMetadata], 2).unwrap();
    let event = cq.next().await.unwrap();
    assert_eq!(event.tag, 2);
    assert!(!event.success);

    // Same outcome when the request was already pending at close time.
    let call = channel.create_call(cq.clone(), "/echo.Echo/Ping", None, None);
    call.start_batch(
        vec![
            BatchOp::SendInitialMetadata {
                metadata: Vec::new(),
                flags: 0,
            },
            BatchOp::RecvInitialMetadata,
        ],
        3,
    )
    .unwrap();
    let stream = sent_stream(&transport);
    transport.close_stream(stream);
    let event = cq.next().await.unwrap();
    assert_eq!(event.tag, 3);
    assert!(!event.success);
}

#[tokio::test]
async fn messages_arriving_early_are_buffered_in_order() {
    let (transport, channel, cq) = setup();
    let call = channel.create_call(cq.clone(), "/echo.Echo/Stream", None, None);

    call.start_batch(
        vec![
            BatchOp::SendInitialMetadata {
                metadata: Vec::new(),
                flags: 0,
            },
            BatchOp::RecvInitialMetadata,
        ],
        1,
    )
    .unwrap();
    let stream = sent_stream(&transport);
    transport.deliver(stream, metadata_ops(&channel, &[]), StreamState::Open, true);
    cq.next().await.unwrap();

    // Two messages land before anyone asks for them.
    transport.deliver(stream, message_ops(b"one"), StreamState::Open, true);
    transport.deliver(stream, message_ops(b"two"), StreamState::Open, true);

    call.start_batch(vec![BatchOp::RecvMessage], 2).unwrap();
    let event = cq.next().await.unwrap();
    assert_eq!(event.tag, 2);
    assert_eq!(
        &event.outcome.message.unwrap().unwrap().concat()[..],
        b"one"
    );

    call.start_batch(vec![BatchOp::RecvMessage], 3).unwrap();
    let event = cq.next().await.unwrap();
    assert_eq!(
        &event.outcome.message.unwrap().unwrap().concat()[..],
        b"two"
    );
}
