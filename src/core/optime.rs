//! Log position primitives.
//!
//! `Timestamp` is the storage-level commit position, `OpTime` pairs it with
//! the election term. Both order lexicographically; terms never decrease.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Storage commit position: seconds since epoch plus an ordinal for writes
/// within the same second.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: u32,
    pub inc: u32,
}

impl Timestamp {
    pub const NULL: Timestamp = Timestamp { secs: 0, inc: 0 };

    pub fn new(secs: u32, inc: u32) -> Self {
        Self { secs, inc }
    }

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    /// The wall-clock date the seconds component denotes. Used by the
    /// batcher's delayed-apply cutoff, never for ordering.
    pub fn as_wall_time(self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(u64::from(self.secs))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}:{})", self.secs, self.inc)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.secs, self.inc)
    }
}

/// Global log position: `(timestamp, term)`, totally ordered.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpTime {
    pub ts: Timestamp,
    #[serde(rename = "t")]
    pub term: i64,
}

impl OpTime {
    /// The null optime, ordered before every real log position.
    pub const NULL: OpTime = OpTime {
        ts: Timestamp::NULL,
        term: -1,
    };

    pub fn new(ts: Timestamp, term: i64) -> Self {
        Self { ts, term }
    }

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }
}

impl Default for OpTime {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Debug for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpTime({}, t{})", self.ts, self.term)
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.ts, self.term)
    }
}

/// An optime paired with the producing node's wall clock at write time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpTimeAndWall {
    pub optime: OpTime,
    pub wall: SystemTime,
}

impl OpTimeAndWall {
    pub fn new(optime: OpTime, wall: SystemTime) -> Self {
        Self { optime, wall }
    }
}

impl Default for OpTimeAndWall {
    fn default() -> Self {
        Self {
            optime: OpTime::NULL,
            wall: UNIX_EPOCH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_order_lexicographically() {
        let a = Timestamp::new(5, 9);
        let b = Timestamp::new(6, 0);
        let c = Timestamp::new(6, 1);
        assert!(a < b);
        assert!(b < c);
        assert!(Timestamp::NULL < a);
    }

    #[test]
    fn optime_orders_by_timestamp_then_term() {
        let lo = OpTime::new(Timestamp::new(10, 0), 3);
        let hi = OpTime::new(Timestamp::new(10, 0), 4);
        let later = OpTime::new(Timestamp::new(11, 0), 3);
        assert!(lo < hi);
        assert!(hi < later);
        assert!(OpTime::NULL < lo);
    }

    #[test]
    fn null_optime_roundtrips_through_serde() {
        let json = serde_json::to_string(&OpTime::NULL).expect("encode");
        let back: OpTime = serde_json::from_str(&json).expect("decode");
        assert!(back.is_null());
    }
}
