//! Accumulator for queued send-metadata.

use crate::metadata::{MdElem, MetadataBatch};

/// Accumulates metadata elements until they are flushed downstream as one
/// batch. The send filler uses it to chain application metadata with
/// call-injected elements; filters that stage metadata across ops can use
/// it the same way.
#[derive(Debug, Default)]
pub struct MetadataBuffer {
    queued: Vec<MdElem>,
}

impl MetadataBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&mut self, elem: MdElem) {
        self.queued.push(elem);
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    /// Flush everything queued so far into a batch, preserving queue
    /// order. The buffer is empty and reusable afterwards.
    pub fn flush(&mut self) -> MetadataBatch {
        let mut batch = MetadataBatch::new();
        for elem in self.queued.drain(..) {
            batch.add_tail(elem);
        }
        batch
    }
}
