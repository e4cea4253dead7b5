use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of a visitor record: the owning user (report suite) plus the
/// 128-bit visitor id split in two halves.
///
/// Immutable for the life of a record and used as the store key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VisitorId {
    pub user_id: u32,
    pub visitor_high: u64,
    pub visitor_low: u64,
}

impl VisitorId {
    pub fn new(user_id: u32, visitor_high: u64, visitor_low: u64) -> Self {
        Self {
            user_id,
            visitor_high,
            visitor_low,
        }
    }
}

/// Key form used by the file and database backends: `user:high:low`, with both
/// visitor halves as fixed-width hex.
impl fmt::Display for VisitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{:016x}:{:016x}",
            self.user_id, self.visitor_high, self.visitor_low
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid visitor id key: {0:?}")]
pub struct ParseVisitorIdError(pub String);

impl FromStr for VisitorId {
    type Err = ParseVisitorIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseVisitorIdError(s.to_string());

        let mut parts = s.split(':');
        let (Some(user), Some(high), Some(low), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(err());
        };

        Ok(Self {
            user_id: user.parse().map_err(|_| err())?,
            visitor_high: u64::from_str_radix(high, 16).map_err(|_| err())?,
            visitor_low: u64::from_str_radix(low, 16).map_err(|_| err())?,
        })
    }
}
