use std::fmt::{Display, Formatter};
use std::ops::{Add, AddAssign};

/// Sequence number of a DATA packet in one connection's stream. Both directions start at 1.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PacketId(u64);

impl Display for PacketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PacketId {
    pub const FIRST: PacketId = PacketId(1);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }

    /// the number of ids from `other` (incl) up to `self` (excl), or None if `other` is bigger
    pub fn distance_from(&self, other: PacketId) -> Option<u64> {
        self.0.checked_sub(other.0)
    }
}

impl Add<u64> for PacketId {
    type Output = PacketId;

    fn add(self, rhs: u64) -> Self::Output {
        PacketId(self.0.saturating_add(rhs))
    }
}

impl AddAssign<u64> for PacketId {
    fn add_assign(&mut self, rhs: u64) {
        self.0 = self.0.saturating_add(rhs);
    }
}
