//! Server-side object naming.
//!
//! Prepared statements get generated names so they outlive one round trip.
//! Portals stay unnamed: every extended query rebinds the unnamed portal
//! and the server discards it at Sync.
use std::sync::atomic::{AtomicU32, Ordering};

use crate::common::ByteStr;

/// The unnamed portal, selected by the empty string on the wire.
pub(crate) const UNNAMED_PORTAL: &str = "";

/// A fresh prepared-statement name, `s17`-style.
///
/// Names only have to be unique within one connection; a process-wide
/// counter also keeps them unique across connections, which makes server
/// logs easier to correlate.
pub(crate) fn next_statement_name() -> ByteStr {
    static COUNTER: AtomicU32 = AtomicU32::new(1);

    let mut digits = itoa::Buffer::new();
    let digits = digits.format(COUNTER.fetch_add(1, Ordering::Relaxed));

    let mut name = String::with_capacity(1 + digits.len());
    name.push('s');
    name.push_str(digits);
    ByteStr::from(name)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn statement_names_are_distinct_and_prefixed() {
        let a = next_statement_name();
        let b = next_statement_name();
        assert_ne!(a, b);
        assert!(a.starts_with('s'));
        assert!(a.as_str()[1..].chars().all(|c| c.is_ascii_digit()));
    }
}
