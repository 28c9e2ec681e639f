//! The stream-op vocabulary flowing through the filter stack.

use bytes::Bytes;

use crate::metadata::MetadataBatch;

/// Flags carried by a begin-message op.
pub mod message_flags {
    /// Payload is compressed with the call's negotiated algorithm.
    pub const COMPRESSED: u32 = 1 << 0;

    pub const ALL: u32 = COMPRESSED;
}

/// A primitive unit of data flowing through the filter stack.
#[derive(Debug)]
pub enum StreamOp {
    /// Placeholder; filters may neutralize an op in place instead of
    /// re-packing the buffer.
    NoOp,
    /// Start of a message: the exact number of payload bytes that will
    /// follow as slices, plus per-message flags.
    BeginMessage { length: u32, flags: u32 },
    /// A chunk of message payload. Slices alias refcounted storage; they
    /// are never copied on the way down.
    Slice(Bytes),
    /// A metadata batch for this direction of the call.
    Metadata(MetadataBatch),
}

/// An ordered, growable sequence of stream ops.
///
/// The buffer is append-only while being assembled; consumers drain it in
/// order. Total slice bytes for one message must equal the length declared
/// by the preceding begin-message op before the message is complete — the
/// call engine enforces that on receive, and `put_message` guarantees it
/// on send.
#[derive(Debug, Default)]
pub struct StreamOpBuffer {
    ops: Vec<StreamOp>,
}

impl StreamOpBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn push(&mut self, op: StreamOp) {
        self.ops.push(op);
    }

    pub fn put_metadata(&mut self, batch: MetadataBatch) {
        self.ops.push(StreamOp::Metadata(batch));
    }

    /// Append a begin-message op followed by its payload slices.
    pub fn put_message(&mut self, length: u32, flags: u32, slices: impl IntoIterator<Item = Bytes>) {
        self.ops.push(StreamOp::BeginMessage { length, flags });
        let mut total = 0u64;
        for slice in slices {
            total += slice.len() as u64;
            self.ops.push(StreamOp::Slice(slice));
        }
        debug_assert_eq!(total, u64::from(length), "message slices disagree with declared length");
    }

    pub fn iter(&self) -> std::slice::Iter<'_, StreamOp> {
        self.ops.iter()
    }

    /// Consume the buffer in order.
    pub fn drain(self) -> std::vec::IntoIter<StreamOp> {
        self.ops.into_iter()
    }

    /// Move every op out, leaving this buffer empty and reusable.
    pub fn take(&mut self) -> StreamOpBuffer {
        StreamOpBuffer {
            ops: std::mem::take(&mut self.ops),
        }
    }
}

impl FromIterator<StreamOp> for StreamOpBuffer {
    fn from_iter<T: IntoIterator<Item = StreamOp>>(iter: T) -> Self {
        Self {
            ops: iter.into_iter().collect(),
        }
    }
}
