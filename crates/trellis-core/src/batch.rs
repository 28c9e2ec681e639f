//! The application-facing batch API.
//!
//! A batch is a set of distinct ops submitted together against a call;
//! it completes as a unit with exactly one event on the call's completion
//! queue, tagged by the submitter.

use std::sync::Arc;

use bytes::Bytes;

use crate::byte_buffer::ByteBuffer;
use crate::call::{Call, IoReq};
pub use crate::call::BatchOutcome;
use crate::completion::CompletionEvent;
use crate::error::{BatchError, StatusCode};
use crate::metadata::{is_legal_header_key, is_legal_header_value};
use crate::stream_op::message_flags;

/// Most ops accepted in a single batch: one of each public kind.
pub const MAX_BATCH_OPS: usize = 8;

/// Application-supplied metadata, converted to interned elements at
/// submission.
#[derive(Debug, Clone)]
pub struct AppMetadata {
    pub key: String,
    pub value: Bytes,
}

impl AppMetadata {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// One op in a batch.
pub enum BatchOp {
    SendInitialMetadata {
        metadata: Vec<AppMetadata>,
        flags: u32,
    },
    SendMessage {
        buffer: ByteBuffer,
        flags: u32,
    },
    /// Client only: no more messages will be sent.
    SendCloseFromClient,
    /// Server only: finish the call with this status and trailing metadata.
    SendStatusFromServer {
        trailing_metadata: Vec<AppMetadata>,
        code: StatusCode,
        details: Option<String>,
    },
    RecvInitialMetadata,
    RecvMessage,
    /// Client only: wait for the call's terminal status and trailing
    /// metadata.
    RecvStatusOnClient,
    /// Server only: wait for the peer to finish sending (or the call to
    /// die).
    RecvCloseOnServer,
}

impl Call {
    /// Submit a batch of ops with `tag`. On success the batch will produce
    /// exactly one [`CompletionEvent`] carrying `tag`; on error nothing was
    /// changed and no event will be produced.
    pub fn start_batch(self: &Arc<Self>, ops: Vec<BatchOp>, tag: u64) -> Result<(), BatchError> {
        if ops.len() > MAX_BATCH_OPS {
            return Err(BatchError::BatchTooBig {
                count: ops.len(),
                max: MAX_BATCH_OPS,
            });
        }
        let cq = self.completion_queue().clone();
        if ops.is_empty() {
            // An empty batch succeeds trivially, but still produces its
            // event.
            cq.begin_op();
            cq.end_op(CompletionEvent {
                tag,
                success: true,
                outcome: BatchOutcome::default(),
            });
            return Ok(());
        }

        let mut reqs = Vec::with_capacity(ops.len() + 3);
        for op in ops {
            self.translate_op(op, &mut reqs)?;
        }

        cq.begin_op();
        let completion_cq = cq.clone();
        let result = self.start_ioreq(
            reqs,
            Box::new(move |success, outcome| {
                tracing::debug!(tag, success, "batch complete");
                completion_cq.end_op(CompletionEvent {
                    tag,
                    success,
                    outcome,
                });
            }),
        );
        if let Err(err) = result {
            cq.abandon_op();
            return Err(err);
        }
        Ok(())
    }

    fn translate_op(
        self: &Arc<Self>,
        op: BatchOp,
        reqs: &mut Vec<IoReq>,
    ) -> Result<(), BatchError> {
        let mdctx = self.channel().metadata_context();
        match op {
            BatchOp::SendInitialMetadata { metadata, flags } => {
                if flags != 0 {
                    return Err(BatchError::InvalidFlags);
                }
                let elems = intern_app_metadata(mdctx, metadata)?;
                reqs.push(IoReq::SendInitialMetadata(elems));
            }
            BatchOp::SendMessage { buffer, flags } => {
                if flags & !message_flags::ALL != 0 {
                    return Err(BatchError::InvalidFlags);
                }
                if buffer.len() > u32::MAX as usize {
                    return Err(BatchError::InvalidMessage);
                }
                reqs.push(IoReq::SendMessage { buffer, flags });
            }
            BatchOp::SendCloseFromClient => {
                if !self.is_client() {
                    return Err(BatchError::WrongCallRole);
                }
                reqs.push(IoReq::SendClose);
            }
            BatchOp::SendStatusFromServer {
                trailing_metadata,
                code,
                details,
            } => {
                if self.is_client() {
                    return Err(BatchError::WrongCallRole);
                }
                let elems = intern_app_metadata(mdctx, trailing_metadata)?;
                reqs.push(IoReq::SendTrailingMetadata(elems));
                reqs.push(IoReq::SendStatus {
                    code,
                    details: details.map(|d| mdctx.intern_str(&d)),
                });
                reqs.push(IoReq::SendClose);
            }
            BatchOp::RecvInitialMetadata => reqs.push(IoReq::RecvInitialMetadata),
            BatchOp::RecvMessage => reqs.push(IoReq::RecvMessage),
            BatchOp::RecvStatusOnClient => {
                if !self.is_client() {
                    return Err(BatchError::WrongCallRole);
                }
                reqs.push(IoReq::RecvTrailingMetadata);
                reqs.push(IoReq::RecvStatus);
                reqs.push(IoReq::RecvStatusDetails);
                reqs.push(IoReq::RecvClose);
            }
            BatchOp::RecvCloseOnServer => {
                if self.is_client() {
                    return Err(BatchError::WrongCallRole);
                }
                reqs.push(IoReq::RecvClose);
            }
        }
        Ok(())
    }
}

fn intern_app_metadata(
    mdctx: &crate::metadata::MetadataContext,
    metadata: Vec<AppMetadata>,
) -> Result<Vec<crate::metadata::MdElem>, BatchError> {
    let mut elems = Vec::with_capacity(metadata.len());
    for md in metadata {
        if !is_legal_header_key(md.key.as_bytes())
            || !is_legal_header_value(md.key.as_bytes(), &md.value)
        {
            return Err(BatchError::InvalidMetadata);
        }
        elems.push(mdctx.elem(md.key.as_bytes(), &md.value));
    }
    Ok(elems)
}
