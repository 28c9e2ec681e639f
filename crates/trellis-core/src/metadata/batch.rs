//! Ordered metadata batches.

use std::time::Instant;

use super::MdElem;

#[derive(Debug)]
struct Link {
    elem: MdElem,
    prev: Option<usize>,
    next: Option<usize>,
}

/// A doubly-linked, ordered collection of metadata elements flowing in one
/// direction of one call, plus a garbage list of elements filtered out but
/// not yet released, plus an optional deadline.
///
/// Links are indices into a slab rather than pointers; the linkage
/// invariants (`head == None ⟺ tail == None`, mutually consistent
/// `prev`/`next`) still hold and are checked after every mutation in debug
/// builds. An inconsistent batch is a contract violation and panics.
#[derive(Debug, Default)]
pub struct MetadataBatch {
    slab: Vec<Option<Link>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
    garbage: Vec<MdElem>,
    deadline: Option<Instant>,
}

impl MetadataBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    fn alloc(&mut self, link: Link) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.slab[idx] = Some(link);
                idx
            }
            None => {
                self.slab.push(Some(link));
                self.slab.len() - 1
            }
        }
    }

    fn release(&mut self, idx: usize) -> Link {
        self.free.push(idx);
        self.slab[idx].take().expect("metadata link already released")
    }

    /// Prepend an element.
    pub fn add_head(&mut self, elem: MdElem) {
        let idx = self.alloc(Link {
            elem,
            prev: None,
            next: self.head,
        });
        match self.head {
            Some(old) => self.link_mut(old).prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
        self.len += 1;
        self.debug_check();
    }

    /// Append an element.
    pub fn add_tail(&mut self, elem: MdElem) {
        let idx = self.alloc(Link {
            elem,
            prev: self.tail,
            next: None,
        });
        match self.tail {
            Some(old) => self.link_mut(old).next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.len += 1;
        self.debug_check();
    }

    /// Append every element of `other`, preserving order. `other`'s
    /// garbage and deadline (if this batch has none) move across too.
    pub fn merge_tail(&mut self, mut other: MetadataBatch) {
        let mut cursor = other.head;
        while let Some(idx) = cursor {
            let link = other.release(idx);
            cursor = link.next;
            self.add_tail(link.elem);
        }
        self.garbage.append(&mut other.garbage);
        if self.deadline.is_none() {
            self.deadline = other.deadline;
        }
        self.debug_check();
    }

    /// Keep elements for which `keep` returns true; unlink the rest into
    /// the garbage list (they are released when the batch drops).
    pub fn filter(&mut self, mut keep: impl FnMut(&MdElem) -> bool) {
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let next = self.link(idx).next;
            if !keep(&self.link(idx).elem) {
                self.unlink(idx);
            }
            cursor = next;
        }
        self.debug_check();
    }

    fn unlink(&mut self, idx: usize) {
        let link = self.release(idx);
        match link.prev {
            Some(prev) => self.link_mut(prev).next = link.next,
            None => self.head = link.next,
        }
        match link.next {
            Some(next) => self.link_mut(next).prev = link.prev,
            None => self.tail = link.prev,
        }
        self.len -= 1;
        self.garbage.push(link.elem);
    }

    /// Iterate elements head to tail.
    pub fn iter(&self) -> impl Iterator<Item = &MdElem> {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let idx = cursor?;
            let link = self.link(idx);
            cursor = link.next;
            Some(&link.elem)
        })
    }

    /// Consume the batch, yielding elements in order. Garbage is dropped.
    pub fn drain(mut self) -> Vec<MdElem> {
        let mut out = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let link = self.release(idx);
            cursor = link.next;
            out.push(link.elem);
        }
        self.head = None;
        self.tail = None;
        self.len = 0;
        out
    }

    fn link(&self, idx: usize) -> &Link {
        self.slab[idx].as_ref().expect("dangling metadata link")
    }

    fn link_mut(&mut self, idx: usize) -> &mut Link {
        self.slab[idx].as_mut().expect("dangling metadata link")
    }

    fn debug_check(&self) {
        #[cfg(debug_assertions)]
        self.check();
    }

    /// Validate the linkage invariants. Panics on violation: a corrupted
    /// batch means some collaborator broke the contract and continuing
    /// would operate on corrupted shared state.
    pub fn check(&self) {
        assert_eq!(
            self.head.is_none(),
            self.tail.is_none(),
            "metadata batch: head/tail disagree"
        );
        let mut count = 0;
        let mut prev = None;
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let link = self.link(idx);
            assert_eq!(link.prev, prev, "metadata batch: prev link mismatch");
            prev = Some(idx);
            cursor = link.next;
            count += 1;
        }
        assert_eq!(self.tail, prev, "metadata batch: tail mismatch");
        assert_eq!(self.len, count, "metadata batch: length mismatch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataContext;

    fn keys(batch: &MetadataBatch) -> Vec<String> {
        batch.iter().map(|e| e.key().to_string_lossy()).collect()
    }

    #[test]
    fn add_head_and_tail_keep_order() {
        let ctx = MetadataContext::new();
        let mut batch = MetadataBatch::new();
        batch.add_tail(ctx.elem(b"b", b"2"));
        batch.add_head(ctx.elem(b"a", b"1"));
        batch.add_tail(ctx.elem(b"c", b"3"));
        batch.check();
        assert_eq!(keys(&batch), ["a", "b", "c"]);
    }

    #[test]
    fn filter_moves_to_garbage_and_stays_consistent() {
        let ctx = MetadataContext::new();
        let mut batch = MetadataBatch::new();
        for key in [&b"a"[..], b"b", b"c", b"d"] {
            batch.add_tail(ctx.elem(key, b"v"));
        }
        batch.filter(|e| e.key().as_bytes() != b"b" && e.key().as_bytes() != b"d");
        batch.check();
        assert_eq!(keys(&batch), ["a", "c"]);
        assert_eq!(batch.garbage.len(), 2);

        // Filtering everything empties the list without breaking linkage.
        batch.filter(|_| false);
        batch.check();
        assert!(batch.is_empty());
        assert_eq!(batch.head, None);
        assert_eq!(batch.tail, None);
    }

    #[test]
    fn merge_preserves_both_orders() {
        let ctx = MetadataContext::new();
        let mut a = MetadataBatch::new();
        a.add_tail(ctx.elem(b"a", b"1"));
        let mut b = MetadataBatch::new();
        b.add_tail(ctx.elem(b"b", b"2"));
        b.add_tail(ctx.elem(b"c", b"3"));
        b.set_deadline(Instant::now());
        a.merge_tail(b);
        a.check();
        assert_eq!(keys(&a), ["a", "b", "c"]);
        assert!(a.deadline().is_some());
    }

    #[test]
    fn drain_yields_in_order() {
        let ctx = MetadataContext::new();
        let mut batch = MetadataBatch::new();
        batch.add_tail(ctx.elem(b"x", b"1"));
        batch.add_tail(ctx.elem(b"y", b"2"));
        let elems = batch.drain();
        assert_eq!(elems.len(), 2);
        assert_eq!(elems[0].key().as_bytes(), b"x");
    }
}
