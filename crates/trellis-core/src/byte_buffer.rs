//! Refcounted payload buffers and the incoming-message queue.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::compression::CompressionAlgorithm;

/// A message payload as a sequence of refcounted slices.
///
/// Slices alias their storage: putting a `ByteBuffer` on the wire clones
/// `Bytes` handles, never the bytes themselves. A buffer assembled from a
/// compressed stream carries the algorithm it was compressed with.
#[derive(Debug, Clone, Default)]
pub struct ByteBuffer {
    slices: Vec<Bytes>,
    compression: Option<CompressionAlgorithm>,
}

impl ByteBuffer {
    pub fn new(slices: Vec<Bytes>) -> Self {
        Self {
            slices,
            compression: None,
        }
    }

    pub fn from_bytes(bytes: Bytes) -> Self {
        Self::new(vec![bytes])
    }

    pub fn compressed(slices: Vec<Bytes>, algorithm: CompressionAlgorithm) -> Self {
        Self {
            slices,
            compression: Some(algorithm),
        }
    }

    pub fn compression(&self) -> Option<CompressionAlgorithm> {
        self.compression
    }

    /// Total payload length in bytes.
    pub fn len(&self) -> usize {
        self.slices.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn slices(&self) -> &[Bytes] {
        &self.slices
    }

    /// Flatten into one contiguous `Bytes`, copying only when the buffer
    /// holds more than one slice.
    pub fn concat(&self) -> Bytes {
        match self.slices.as_slice() {
            [] => Bytes::new(),
            [one] => one.clone(),
            many => {
                let mut out = Vec::with_capacity(self.len());
                for slice in many {
                    out.extend_from_slice(slice);
                }
                Bytes::from(out)
            }
        }
    }
}

impl From<Bytes> for ByteBuffer {
    fn from(bytes: Bytes) -> Self {
        Self::from_bytes(bytes)
    }
}

/// FIFO queue of fully assembled incoming messages.
#[derive(Debug, Default)]
pub struct ByteBufferQueue {
    queue: VecDeque<ByteBuffer>,
}

impl ByteBufferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, buffer: ByteBuffer) {
        self.queue.push_back(buffer);
    }

    pub fn pop(&mut self) -> Option<ByteBuffer> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}
