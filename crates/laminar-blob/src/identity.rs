//! Stream and session identities.
//!
//! A [`StreamId`] names one independently addressable byte stream. Identities
//! are assigned by the central manager, monotonically from 1; the value 0 is
//! reserved as the null stream and is never handed out.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BlobError;

/// Opaque, totally ordered handle of a BLOB stream.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct StreamId(u64);

impl StreamId {
    /// The null stream. Never returned by a manager.
    pub const NULL: StreamId = StreamId(0);

    /// Wraps a raw identity value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw identity value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns `true` for the null stream.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns `self` unless it is the null stream.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError::InvalidArgument`] for the null stream.
    pub fn non_null(self) -> Result<Self, BlobError> {
        if self.is_null() {
            Err(BlobError::InvalidArgument("null stream identity".into()))
        } else {
            Ok(self)
        }
    }

    /// Returns the identity following this one, or `None` once the identity
    /// space is exhausted.
    pub(crate) fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StreamId {
    type Err = BlobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(Self)
            .map_err(|e| BlobError::InvalidArgument(format!("stream identity '{s}': {e}")))
    }
}

impl From<StreamId> for u64 {
    fn from(id: StreamId) -> Self {
        id.0
    }
}

/// Identity of the session that opened a stream.
///
/// The central manager counts opens per tag so a session can release
/// everything it opened in one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OwnerTag(pub u64);

impl fmt::Display for OwnerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_identity() {
        assert!(StreamId::NULL.is_null());
        assert!(StreamId::default().is_null());
        assert!(StreamId::NULL.non_null().is_err());
        assert_eq!(StreamId::new(7).non_null().unwrap(), StreamId::new(7));
    }

    #[test]
    fn test_ordering_follows_raw_value() {
        let mut ids = vec![StreamId::new(3), StreamId::new(1), StreamId::new(2)];
        ids.sort();
        assert_eq!(ids, vec![StreamId::new(1), StreamId::new(2), StreamId::new(3)]);
        assert_eq!(StreamId::new(1).next(), StreamId::new(2));
    }

    #[test]
    fn test_next_stops_at_max() {
        assert_eq!(StreamId::NULL.next(), Some(StreamId::new(1)));
        assert_eq!(StreamId::new(u64::MAX).next(), None);
    }

    #[test]
    fn test_decimal_text_form() {
        let id: StreamId = "18446744073709551615".parse().unwrap();
        assert_eq!(id.get(), u64::MAX);
        assert_eq!(StreamId::new(42).to_string(), "42");

        assert!(matches!(
            "-1".parse::<StreamId>(),
            Err(BlobError::InvalidArgument(_))
        ));
        assert!("abc".parse::<StreamId>().is_err());
    }

    #[test]
    fn test_serde_is_transparent() {
        let json = serde_json::to_string(&StreamId::new(9)).unwrap();
        assert_eq!(json, "9");
        let back: StreamId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, StreamId::new(9));
    }
}
