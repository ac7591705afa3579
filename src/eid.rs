use std::fmt::Display;

use chrono::{DateTime, Utc};
use rusty_ulid::Ulid;

/// Time-ordered unique id for live subscribers and in-flight temp files.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Eid(Ulid);

impl Eid {
    #[inline]
    pub fn new() -> Eid {
        Eid(Ulid::generate())
    }

    /// Wall-clock time the id was generated, millisecond precision.
    pub fn issued_at(&self) -> DateTime<Utc> {
        self.0.datetime()
    }

    /// Milliseconds elapsed since the id was generated.
    pub fn age_ms(&self) -> i64 {
        (Utc::now() - self.issued_at()).num_milliseconds().max(0)
    }
}

impl Default for Eid {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for Eid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
