//! Header fields shared by every gateway request.
//!
//! This module defines regions, invoke IDs, the ack/nack result of a send and
//! the header stamped on each outbound request.

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ProtocolError;

/// Number of NPAC regions
pub const REGION_COUNT: usize = 8;

/// Session ID carried by a session that has not been established
pub const UNINITIALIZED_SESSION_ID: &str = "0";

const REGION_LABELS: [&str; REGION_COUNT] = [
    "Midwest",
    "Mid-Atlantic",
    "Northeast",
    "Southeast",
    "Southwest",
    "Western",
    "West Coast",
    "Canada",
];

/// NPAC region index (0..8)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Region(u8);

impl Region {
    /// Build a region, rejecting indices outside 0..8
    pub fn new(index: u8) -> Result<Self, ProtocolError> {
        if (index as usize) < REGION_COUNT {
            Ok(Region(index))
        } else {
            Err(ProtocolError::Region(index as i64))
        }
    }

    /// Zero-based index
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Human-readable region name
    pub fn label(self) -> &'static str {
        REGION_LABELS[self.index()]
    }

    /// The region after this one, if any
    pub fn next(self) -> Option<Region> {
        Region::new(self.0 + 1).ok()
    }

    /// All regions in ascending order
    pub fn all() -> impl Iterator<Item = Region> {
        (0..REGION_COUNT as u8).map(Region)
    }
}

impl TryFrom<u8> for Region {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Region::new(value)
    }
}

impl TryFrom<i64> for Region {
    type Error = ProtocolError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u8::try_from(value)
            .map_err(|_| ProtocolError::Region(value))
            .and_then(Region::new)
    }
}

impl From<Region> for u8 {
    fn from(region: Region) -> u8 {
        region.0
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

bitflags! {
    /// Regions a customer SPID needs an association in
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct RegionSet: u8 {
        /// Midwest
        const MIDWEST = 1 << 0;
        /// Mid-Atlantic
        const MID_ATLANTIC = 1 << 1;
        /// Northeast
        const NORTHEAST = 1 << 2;
        /// Southeast
        const SOUTHEAST = 1 << 3;
        /// Southwest
        const SOUTHWEST = 1 << 4;
        /// Western
        const WESTERN = 1 << 5;
        /// West Coast
        const WEST_COAST = 1 << 6;
        /// Canada
        const CANADA = 1 << 7;
    }
}

impl RegionSet {
    /// Set containing a single region
    pub fn of(region: Region) -> Self {
        RegionSet::from_bits_truncate(1 << region.index())
    }

    /// Whether the region is supported
    pub fn supports(&self, region: Region) -> bool {
        self.contains(RegionSet::of(region))
    }

    /// Build from region indices, ignoring out-of-range values
    pub fn from_indices<I: IntoIterator<Item = u8>>(indices: I) -> Self {
        indices
            .into_iter()
            .filter_map(|i| Region::new(i).ok())
            .fold(RegionSet::empty(), |set, region| set | RegionSet::of(region))
    }
}

/// Correlation key of a request and its reply
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvokeId(String);

impl InvokeId {
    /// Wrap a raw invoke ID
    pub fn new(id: impl Into<String>) -> Self {
        InvokeId(id.into())
    }

    /// Raw string form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for InvokeId {
    fn from(value: u64) -> Self {
        InvokeId(value.to_string())
    }
}

impl fmt::Display for InvokeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of handing a message to the peer, or of processing one from it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ack {
    /// Accepted
    Ack,
    /// Rejected
    Nack,
}

impl Ack {
    /// Wire code: 0 for ACK, -1 for NACK
    pub fn code(self) -> i32 {
        match self {
            Ack::Ack => 0,
            Ack::Nack => -1,
        }
    }

    /// Whether this is an ACK
    pub fn is_ack(self) -> bool {
        self == Ack::Ack
    }

    /// ACK when the condition holds, NACK otherwise
    pub fn from_bool(ok: bool) -> Self {
        if ok {
            Ack::Ack
        } else {
            Ack::Nack
        }
    }
}

impl fmt::Display for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ack::Ack => f.write_str("ACK"),
            Ack::Nack => f.write_str("NACK"),
        }
    }
}

/// Header stamped on each outbound request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Gateway session ID
    pub session_id: String,
    /// Correlation key for the reply
    pub invoke_id: InvokeId,
    /// Region the request addresses, if any
    pub region: Option<Region>,
    /// Customer (SPID) the request is sent on behalf of
    pub customer_id: String,
    /// Creation time
    #[serde(with = "crate::timestamp::utc")]
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_bounds() {
        assert_eq!(Region::new(7).map(Region::label), Ok("Canada"));
        assert_eq!(Region::new(8), Err(ProtocolError::Region(8)));
        assert_eq!(Region::try_from(-1i64), Err(ProtocolError::Region(-1)));
        assert_eq!(Region::new(7).ok().and_then(Region::next), None);
    }

    #[test]
    fn test_region_set_support() {
        let set = RegionSet::from_indices([0, 3, 9]);
        assert!(set.supports(Region::new(0).unwrap()));
        assert!(set.supports(Region::new(3).unwrap()));
        assert!(!set.supports(Region::new(1).unwrap()));
        assert_eq!(set, RegionSet::MIDWEST | RegionSet::SOUTHEAST);
    }

    #[test]
    fn test_ack_codes() {
        assert_eq!(Ack::Ack.code(), 0);
        assert_eq!(Ack::Nack.code(), -1);
        assert_eq!(Ack::from_bool(false), Ack::Nack);
    }
}
