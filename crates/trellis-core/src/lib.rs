//! Core call engine: channels, calls, batched I/O requests, and completion
//! queues over a pluggable transport.
//!
//! A [`Channel`] owns a filter stack terminated by a transport; a [`Call`]
//! is one RPC on it. Applications submit [`BatchOp`] batches and collect
//! one tagged [`CompletionEvent`] per batch from a [`CompletionQueue`].

#![forbid(unsafe_op_in_unsafe_fn)]

pub mod batch;
pub mod byte_buffer;
pub mod call;
pub mod channel;
pub mod completion;
pub mod compression;
pub mod config;
pub mod error;
pub mod filter;
pub mod metadata;
pub mod metadata_buffer;
pub mod stream_op;
pub mod transport;

pub use batch::{AppMetadata, BatchOp, BatchOutcome, MAX_BATCH_OPS};
pub use byte_buffer::{ByteBuffer, ByteBufferQueue};
pub use call::{Call, CallRef, IoKind, IoReq, Propagation};
pub use channel::{Channel, RegisteredMethod};
pub use completion::{CompletionEvent, CompletionQueue};
pub use compression::CompressionAlgorithm;
pub use config::{ChannelArgs, ChannelConfig};
pub use error::{BatchError, FinalStatus, StatusCode};
pub use filter::{ChannelOp, ChannelStack, Filter, FilterContext, FilterState};
pub use metadata::{MdElem, MdStr, MetadataBatch, MetadataContext};
pub use stream_op::{StreamOp, StreamOpBuffer};
pub use transport::{
    RecvRequest, SendBatch, ServerTransportData, StreamId, StreamState, Transport, TransportEvent,
    TransportStreamOp,
};
