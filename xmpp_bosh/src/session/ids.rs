//! Request and session identifiers.

use core::fmt;

/// Largest request id a client may use (XEP-0124 §14: 2^53 - 1).
pub const MAX_RID: u64 = (1 << 53) - 1;

/// Upper bound on a freshly seeded rid, leaving headroom below [`MAX_RID`]
/// for any realistic session length.
const SEED_CEILING: u64 = 1 << 32;

/// A BOSH request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rid(u64);

impl Rid {
    /// Wrap a raw request id.
    #[must_use]
    pub const fn new(rid: u64) -> Self {
        Self(rid)
    }

    /// The raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// How far `self` is ahead of `earlier`, or `None` if it is not ahead.
    #[must_use]
    pub const fn distance_from(self, earlier: Self) -> Option<u64> {
        match self.0.checked_sub(earlier.0) {
            Some(0) | None => None,
            Some(d) => Some(d),
        }
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The rid counter for one session.
///
/// Seeded randomly so that a new session never replays request ids a proxy
/// may still associate with an old one.
#[derive(Debug, Clone)]
pub struct RidSequence {
    next: u64,
}

impl RidSequence {
    /// Seed a new sequence at a random starting point.
    #[must_use]
    pub fn random() -> Self {
        Self {
            next: 1 + rand::random::<u64>() % SEED_CEILING,
        }
    }

    /// Start a sequence at a known value.
    #[must_use]
    pub const fn starting_at(first: u64) -> Self {
        Self { next: first }
    }

    /// The rid the next request will carry.
    #[must_use]
    pub const fn peek(&self) -> Rid {
        Rid(self.next)
    }

    /// Take the next rid.
    pub const fn next_rid(&mut self) -> Rid {
        let rid = Rid(self.next);
        self.next += 1;
        rid
    }
}

/// A server-assigned session id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sid(String);

impl Sid {
    /// Wrap a session id, rejecting the empty string.
    #[must_use]
    pub fn new(sid: impl Into<String>) -> Option<Self> {
        let sid = sid.into();
        (!sid.is_empty()).then_some(Self(sid))
    }

    /// The session id as sent on the wire.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_rid_increments() {
        let mut rids = RidSequence::starting_at(10);
        assert_eq!(rids.peek(), Rid::new(10));
        assert_eq!(rids.next_rid(), Rid::new(10));
        assert_eq!(rids.next_rid(), Rid::new(11));
        assert_eq!(rids.peek(), Rid::new(12));
    }

    #[test]
    fn random_seed_leaves_headroom() {
        for _ in 0..64 {
            let rid = RidSequence::random().peek().get();
            assert!(rid >= 1);
            assert!(rid <= SEED_CEILING);
            assert!(rid < MAX_RID);
        }
    }

    #[test]
    fn distance_is_only_forward() {
        assert_eq!(Rid::new(7).distance_from(Rid::new(4)), Some(3));
        assert_eq!(Rid::new(4).distance_from(Rid::new(4)), None);
        assert_eq!(Rid::new(3).distance_from(Rid::new(4)), None);
    }

    #[test]
    fn empty_sid_is_rejected() {
        assert!(Sid::new("").is_none());
        assert_eq!(Sid::new("abc").map(|s| s.to_string()).as_deref(), Some("abc"));
    }

    #[cfg(feature = "bolero")]
    mod proptests {
        use super::*;

        #[test]
        fn prop_rids_strictly_increase() {
            bolero::check!()
                .with_type::<(u32, u8)>()
                .for_each(|(start, count)| {
                    let mut rids = RidSequence::starting_at(u64::from(*start));
                    let mut last: Option<Rid> = None;
                    for _ in 0..*count {
                        let rid = rids.next_rid();
                        if let Some(prev) = last {
                            assert!(rid > prev);
                        }
                        last = Some(rid);
                    }
                });
        }
    }
}
