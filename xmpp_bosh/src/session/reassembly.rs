//! Out-of-order response buffer.
//!
//! With `hold > 0` several requests are outstanding at once and their
//! responses may complete in any order. A response that arrives ahead of
//! the next expected rid is parked here until the gap closes.

use std::collections::BTreeMap;

use super::Rid;
use crate::body::ResponseBody;

/// Responses received ahead of the expected rid, keyed by rid.
#[derive(Debug, Clone)]
pub struct ReassemblyBuffer {
    slack: u64,
    parked: BTreeMap<Rid, ResponseBody>,
}

impl ReassemblyBuffer {
    /// Create an empty buffer whose window extends `hold + slack` past the
    /// expected rid.
    #[must_use]
    pub const fn new(slack: u64) -> Self {
        Self {
            slack,
            parked: BTreeMap::new(),
        }
    }

    /// Whether `rid` is ahead of `expected` but still inside the window.
    #[must_use]
    pub fn in_window(&self, expected: Rid, rid: Rid, hold: u32) -> bool {
        rid.distance_from(expected)
            .is_some_and(|d| d < u64::from(hold) + self.slack)
    }

    /// Park a response. A second response for the same rid replaces the first.
    pub fn park(&mut self, rid: Rid, body: ResponseBody) {
        if self.parked.insert(rid, body).is_some() {
            tracing::debug!(%rid, "replaced duplicate buffered response");
        }
    }

    /// Remove and return the response for `rid`, if parked.
    pub fn take(&mut self, rid: Rid) -> Option<ResponseBody> {
        self.parked.remove(&rid)
    }

    /// Number of parked responses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.parked.len()
    }

    /// Whether nothing is parked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.parked.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body() -> ResponseBody {
        ResponseBody::parse(b"<body/>").expect("parse")
    }

    #[test]
    fn window_is_hold_plus_slack() {
        let buf = ReassemblyBuffer::new(2);
        let expected = Rid::new(10);

        assert!(!buf.in_window(expected, Rid::new(10), 1));
        assert!(buf.in_window(expected, Rid::new(11), 1));
        assert!(buf.in_window(expected, Rid::new(12), 1));
        assert!(!buf.in_window(expected, Rid::new(13), 1));
        assert!(!buf.in_window(expected, Rid::new(9), 1));
    }

    #[test]
    fn zero_hold_still_allows_one_ahead() {
        let buf = ReassemblyBuffer::new(2);
        assert!(buf.in_window(Rid::new(1), Rid::new(2), 0));
        assert!(!buf.in_window(Rid::new(1), Rid::new(3), 0));
    }

    #[test]
    fn park_and_take() {
        let mut buf = ReassemblyBuffer::new(2);
        buf.park(Rid::new(5), body());
        buf.park(Rid::new(5), body());
        assert_eq!(buf.len(), 1);
        assert!(buf.take(Rid::new(4)).is_none());
        assert!(buf.take(Rid::new(5)).is_some());
        assert!(buf.is_empty());
    }
}
