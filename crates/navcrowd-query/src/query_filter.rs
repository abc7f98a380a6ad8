//! Polygon filtering and traversal cost

use crate::PolyFlags;
use glam::Vec3;

/// Maximum number of area types
pub const MAX_AREAS: usize = 64;

/// Decides which polygons a query may visit and what traversing them costs
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFilter {
    /// Polygons must have at least one of these flags
    pub include_flags: PolyFlags,
    /// Polygons must have none of these flags
    pub exclude_flags: PolyFlags,
    /// Cost multiplier per area type
    pub area_cost: [f32; MAX_AREAS],
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            include_flags: PolyFlags::all(),
            exclude_flags: PolyFlags::empty(),
            area_cost: [1.0; MAX_AREAS],
        }
    }
}

impl QueryFilter {
    /// Creates a filter with the given include and exclude flags and unit area costs
    pub fn new(include_flags: PolyFlags, exclude_flags: PolyFlags) -> Self {
        Self {
            include_flags,
            exclude_flags,
            ..Default::default()
        }
    }

    /// Checks whether a polygon with the given flags may be visited
    pub fn pass_filter(&self, flags: PolyFlags) -> bool {
        flags.intersects(self.include_flags) && !flags.intersects(self.exclude_flags)
    }

    /// Cost of moving from `pa` to `pb` inside a polygon of the given area
    pub fn get_cost(&self, pa: Vec3, pb: Vec3, area: u8) -> f32 {
        pa.distance(pb) * self.get_area_cost(area)
    }

    /// Gets the cost multiplier of an area, 1.0 for out of range areas
    pub fn get_area_cost(&self, area: u8) -> f32 {
        self.area_cost.get(area as usize).copied().unwrap_or(1.0)
    }

    /// Sets the cost multiplier of an area
    pub fn set_area_cost(&mut self, area: u8, cost: f32) {
        if let Some(slot) = self.area_cost.get_mut(area as usize) {
            *slot = cost;
        }
    }

    /// Sets the include flags
    pub fn set_include_flags(&mut self, flags: PolyFlags) {
        self.include_flags = flags;
    }

    /// Sets the exclude flags
    pub fn set_exclude_flags(&mut self, flags: PolyFlags) {
        self.exclude_flags = flags;
    }
}
