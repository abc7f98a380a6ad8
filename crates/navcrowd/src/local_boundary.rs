//! Local wall boundary cached around an agent

use glam::Vec3;
use navcrowd_common::{dist_point_segment_sqr_2d, Result};
use navcrowd_query::{NavMeshQuery, PolyRef, QueryFilter};

/// Maximum number of wall segments kept per agent
pub const MAX_LOCAL_SEGS: usize = 8;
/// Maximum number of polygons searched for walls
pub const MAX_LOCAL_POLYS: usize = 16;

#[derive(Debug, Clone, Copy)]
struct Segment {
    start: Vec3,
    end: Vec3,
    /// Squared distance to the boundary center, used for pruning
    d: f32,
}

impl Default for LocalBoundary {
    fn default() -> Self {
        Self::new()
    }
}

/// Nearest navmesh wall segments around a point
///
/// The boundary is a cache: it is rebuilt when the agent has moved far enough
/// from [`LocalBoundary::get_center`] or when one of the polygons it was built
/// from becomes invalid.
#[derive(Debug, Clone)]
pub struct LocalBoundary {
    center: Vec3,
    segs: Vec<Segment>,
    polys: Vec<PolyRef>,
}

impl LocalBoundary {
    pub fn new() -> Self {
        Self {
            center: Vec3::splat(f32::MAX),
            segs: Vec::with_capacity(MAX_LOCAL_SEGS),
            polys: Vec::with_capacity(MAX_LOCAL_POLYS),
        }
    }

    /// Empties the boundary so that the next validity check fails
    pub fn reset(&mut self) {
        self.center = Vec3::splat(f32::MAX);
        self.segs.clear();
        self.polys.clear();
    }

    /// Rebuilds the boundary around `pos` from walls within `collision_query_range`
    pub fn update<Q: NavMeshQuery>(
        &mut self,
        poly_ref: PolyRef,
        pos: Vec3,
        collision_query_range: f32,
        navquery: &Q,
        filter: &QueryFilter,
    ) -> Result<()> {
        if !poly_ref.is_valid() {
            self.reset();
            return Ok(());
        }

        self.center = pos;
        self.segs.clear();
        self.polys = navquery.find_local_neighbourhood(
            poly_ref,
            pos,
            collision_query_range,
            filter,
            MAX_LOCAL_POLYS,
        )?;

        let range_sqr = collision_query_range * collision_query_range;
        for &poly in &self.polys {
            for (start, end) in navquery.get_poly_wall_segments(poly, filter)? {
                let (dist_sqr, _) = dist_point_segment_sqr_2d(pos, start, end);
                if dist_sqr > range_sqr {
                    continue;
                }
                Self::add_segment(&mut self.segs, dist_sqr, start, end);
            }
        }

        Ok(())
    }

    /// Inserts a segment keeping the list sorted by distance and capped
    fn add_segment(segs: &mut Vec<Segment>, d: f32, start: Vec3, end: Vec3) {
        let seg = Segment { start, end, d };
        match segs.last() {
            None => segs.push(seg),
            Some(last) if d >= last.d => {
                if segs.len() >= MAX_LOCAL_SEGS {
                    return;
                }
                segs.push(seg);
            }
            Some(_) => {
                let i = segs.iter().position(|s| d <= s.d).unwrap_or(segs.len());
                segs.insert(i, seg);
                segs.truncate(MAX_LOCAL_SEGS);
            }
        }
    }

    /// Checks whether every polygon the boundary was built from is still valid
    pub fn is_valid<Q: NavMeshQuery>(&self, navquery: &Q, filter: &QueryFilter) -> bool {
        !self.polys.is_empty()
            && self
                .polys
                .iter()
                .all(|&poly| navquery.is_valid_poly_ref(poly, filter))
    }

    /// Position the boundary was built around
    pub fn get_center(&self) -> Vec3 {
        self.center
    }

    pub fn get_segment_count(&self) -> usize {
        self.segs.len()
    }

    /// Gets a segment as `(start, end)`, nearest first
    pub fn get_segment(&self, i: usize) -> Option<(Vec3, Vec3)> {
        self.segs.get(i).map(|s| (s.start, s.end))
    }

    /// Iterates over the segments, nearest first
    pub fn segments(&self) -> impl Iterator<Item = (Vec3, Vec3)> + '_ {
        self.segs.iter().map(|s| (s.start, s.end))
    }
}
