//! Polygon references and flags

/// Reference to a polygon of the navigation mesh
///
/// Zero is reserved as the null reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct PolyRef(u32);

impl PolyRef {
    /// The null polygon reference
    pub const NULL: PolyRef = PolyRef(0);

    /// Creates a new polygon reference
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw id of the reference
    pub const fn id(&self) -> u32 {
        self.0
    }

    /// Checks whether the reference is not the null reference
    pub const fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl From<u32> for PolyRef {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for PolyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "poly#{}", self.0)
    }
}

bitflags::bitflags! {
    /// Flags describing how a polygon may be traversed
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
    pub struct PolyFlags: u16 {
        /// Ground that can be walked on
        const WALK = 0x01;
        /// Water that can be swum through
        const SWIM = 0x02;
        /// Door that can be passed when open
        const DOOR = 0x04;
        /// Link that requires jumping
        const JUMP = 0x08;
        /// Polygon that is temporarily disabled
        const DISABLED = 0x10;
    }
}

/// Kind of polygon a reference points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolyType {
    /// Regular walkable surface polygon
    Ground,
    /// Point-to-point link traversed by a scripted animation
    OffMeshConnection,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_reference() {
        assert!(!PolyRef::NULL.is_valid());
        assert!(!PolyRef::default().is_valid());
        assert!(PolyRef::new(7).is_valid());
        assert_eq!(PolyRef::from(7).id(), 7);
    }
}
