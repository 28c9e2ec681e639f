//! trellis: an RPC runtime core built around a filtered call-execution
//! engine.
//!
//! This crate re-exports the engine from `trellis-core`. Most applications
//! only need the [`prelude`]:
//!
//! ```no_run
//! use trellis::prelude::*;
//!
//! # async fn demo(transport: std::sync::Arc<dyn Transport>) {
//! let channel = Channel::new(transport, Vec::new(), &ChannelArgs::new());
//! let cq = CompletionQueue::new();
//! let call = channel.create_call(cq.clone(), "/pkg.Service/Method", None, None);
//! call.start_batch(
//!     vec![BatchOp::SendInitialMetadata {
//!         metadata: Vec::new(),
//!         flags: 0,
//!     }],
//!     1,
//! )
//! .unwrap();
//! let event = cq.next().await.unwrap();
//! assert_eq!(event.tag, 1);
//! # }
//! ```

#![forbid(unsafe_op_in_unsafe_fn)]

pub use trellis_core::*;

/// The handful of types almost every user touches.
pub mod prelude {
    pub use trellis_core::{
        AppMetadata, BatchError, BatchOp, BatchOutcome, ByteBuffer, Call, Channel, ChannelArgs,
        CompletionEvent, CompletionQueue, FinalStatus, StatusCode, Transport,
    };
}
