//! Interned metadata strings and elements.
//!
//! Keys and values are interned in a [`MetadataContext`] and handed around
//! as cheaply cloneable [`MdStr`] handles; a key/value pair is an
//! [`MdElem`]. Ownership is Arc-based: cloning a handle is the "ref" and
//! dropping it is the "unref", so the balance the engine needs (every
//! element exactly one drop away from the ref it arrived with) is enforced
//! by the type system rather than by discipline.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::StatusCode;

mod batch;
pub use batch::MetadataBatch;

/// Suffix marking a key whose value is arbitrary binary data.
pub const BINARY_SUFFIX: &str = "-bin";

/// An interned metadata string.
///
/// Two `MdStr`s from the same context with equal bytes share one
/// allocation, so equality is usually a pointer compare.
#[derive(Clone)]
pub struct MdStr(Arc<Bytes>);

impl MdStr {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lossy UTF-8 view, for logging and status details.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PartialEq for MdStr {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || *self.0 == *other.0
    }
}

impl Eq for MdStr {}

impl fmt::Debug for MdStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.0))
    }
}

#[derive(Debug)]
struct ElemInner {
    key: MdStr,
    value: MdStr,
    /// Cached decoded status value for this element, offset by one: zero
    /// means "not decoded yet", since zero is itself a valid decoded code.
    decoded_status: AtomicU32,
}

/// A reference-counted metadata element (one key/value pair).
#[derive(Clone, Debug)]
pub struct MdElem(Arc<ElemInner>);

impl MdElem {
    pub fn key(&self) -> &MdStr {
        &self.0.key
    }

    pub fn value(&self) -> &MdStr {
        &self.0.value
    }

    /// Decode the element's value as a numeric status code, caching the
    /// result on the element so repeated receptions of the same element
    /// parse only once. Unparseable values decode as `Unknown`.
    pub fn decoded_status(&self) -> StatusCode {
        let cached = self.0.decoded_status.load(Ordering::Relaxed);
        if cached != 0 {
            return StatusCode::from_u32(cached - 1).unwrap_or(StatusCode::Unknown);
        }
        let code = std::str::from_utf8(self.0.value.as_bytes())
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .and_then(StatusCode::from_u32)
            .unwrap_or(StatusCode::Unknown);
        self.0
            .decoded_status
            .store(code as u32 + 1, Ordering::Relaxed);
        code
    }
}

impl PartialEq for MdElem {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
            || (self.0.key == other.0.key && self.0.value == other.0.value)
    }
}

impl Eq for MdElem {}

/// String interning table shared by a channel and its calls.
///
/// Interned strings live as long as the context; calls and batches hold
/// `MdStr`/`MdElem` clones and never touch the table directly.
pub struct MetadataContext {
    strings: Mutex<HashMap<Bytes, MdStr>>,
}

impl MetadataContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            strings: Mutex::new(HashMap::new()),
        })
    }

    /// Intern a byte string.
    pub fn intern(&self, bytes: &[u8]) -> MdStr {
        let mut strings = self.strings.lock();
        if let Some(existing) = strings.get(bytes) {
            return existing.clone();
        }
        let owned = Bytes::copy_from_slice(bytes);
        let md = MdStr(Arc::new(owned.clone()));
        strings.insert(owned, md.clone());
        md
    }

    /// Intern a string slice.
    pub fn intern_str(&self, s: &str) -> MdStr {
        self.intern(s.as_bytes())
    }

    /// Create an element from raw key/value bytes, interning both.
    pub fn elem(&self, key: &[u8], value: &[u8]) -> MdElem {
        self.elem_from_strings(self.intern(key), self.intern(value))
    }

    /// Create an element from already-interned strings.
    pub fn elem_from_strings(&self, key: MdStr, value: MdStr) -> MdElem {
        MdElem(Arc::new(ElemInner {
            key,
            value,
            decoded_status: AtomicU32::new(0),
        }))
    }
}

/// True if `key` is a legal header name: lowercase tokens, digits and
/// `-_.`, with a single optional leading `:` for pseudo-headers.
pub fn is_legal_header_key(key: &[u8]) -> bool {
    let body = match key {
        [] => return false,
        [b':', rest @ ..] => {
            if rest.is_empty() {
                return false;
            }
            rest
        }
        other => other,
    };
    body.iter()
        .all(|&b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'-' | b'_' | b'.'))
}

/// True if `value` is legal for `key`: anything goes for `-bin` suffixed
/// keys, printable ASCII otherwise.
pub fn is_legal_header_value(key: &[u8], value: &[u8]) -> bool {
    if key.ends_with(BINARY_SUFFIX.as_bytes()) {
        return true;
    }
    value.iter().all(|&b| (0x20..0x7f).contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interned_strings_share_storage() {
        let ctx = MetadataContext::new();
        let a = ctx.intern(b"content-type");
        let b = ctx.intern(b"content-type");
        assert!(Arc::ptr_eq(&a.0, &b.0));
        assert_eq!(a, b);
    }

    #[test]
    fn decoded_status_caches_with_sentinel() {
        let ctx = MetadataContext::new();
        let ok = ctx.elem(b"trellis-status", b"0");
        // Zero is a valid decoded value; the sentinel must not confuse it
        // with "not yet decoded".
        assert_eq!(ok.decoded_status(), StatusCode::Ok);
        assert_eq!(ok.decoded_status(), StatusCode::Ok);

        let junk = ctx.elem(b"trellis-status", b"not-a-number");
        assert_eq!(junk.decoded_status(), StatusCode::Unknown);
    }

    #[test]
    fn header_legality() {
        assert!(is_legal_header_key(b"user-agent"));
        assert!(is_legal_header_key(b":path"));
        assert!(!is_legal_header_key(b""));
        assert!(!is_legal_header_key(b":"));
        assert!(!is_legal_header_key(b"Upper-Case"));
        assert!(!is_legal_header_key(b"sp ace"));

        assert!(is_legal_header_value(b"k", b"plain ascii"));
        assert!(!is_legal_header_value(b"k", b"\x01"));
        assert!(is_legal_header_value(b"k-bin", b"\x00\xff"));
    }
}
