//! Comparators over raw record bytes.

use std::cmp::Ordering;
use std::fmt;

/// Orders two raw records without deserializing them.
pub trait RawComparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Lexicographic byte order over the whole record.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytewiseComparator;

impl RawComparator for BytewiseComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Lexicographic order over the first `key_len` bytes; the rest is payload.
#[derive(Debug, Clone, Copy)]
pub struct KeyPrefixComparator {
    pub key_len: usize,
}

impl KeyPrefixComparator {
    pub fn new(key_len: usize) -> Self {
        Self { key_len }
    }
}

impl RawComparator for KeyPrefixComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let a = &a[..a.len().min(self.key_len)];
        let b = &b[..b.len().min(self.key_len)];
        a.cmp(b)
    }
}

/// Comparator backed by a closure, for deserializing comparisons.
pub struct FnComparator<F>(pub F);

impl<F> RawComparator for FnComparator<F>
where
    F: Fn(&[u8], &[u8]) -> Ordering + Send + Sync,
{
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        (self.0)(a, b)
    }
}

impl<F> fmt::Debug for FnComparator<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnComparator")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_prefix_ignores_payload() {
        let cmp = KeyPrefixComparator::new(2);
        assert_eq!(cmp.compare(b"abZZ", b"abAA"), Ordering::Equal);
        assert_eq!(cmp.compare(b"aa", b"ab"), Ordering::Less);
        assert_eq!(cmp.compare(b"a", b"ab"), Ordering::Less);
    }

    #[test]
    fn test_fn_comparator_decodes() {
        let cmp = FnComparator(|a: &[u8], b: &[u8]| {
            let a = u32::from_le_bytes(a[..4].try_into().unwrap());
            let b = u32::from_le_bytes(b[..4].try_into().unwrap());
            a.cmp(&b)
        });
        assert_eq!(
            cmp.compare(&256u32.to_le_bytes(), &1u32.to_le_bytes()),
            Ordering::Greater
        );
    }
}
