//! Path corridor implementation
//!
//! This module contains the PathCorridor structure, which is used to
//! represent and maintain a path corridor for smooth path following.
//!
//! The corridor is a list of polygons from the agent position to the target.
//! Moving the agent or the target only adjusts the ends of the list, so the
//! path stays usable without replanning while the agent follows it.

use bitflags::bitflags;
use glam::Vec3;
use navcrowd_common::{
    dist_2d, dist_point_segment_sqr_2d, dist_sqr_2d, tri_area_2d, vequal, Error, Result,
};
use navcrowd_query::{NavMeshQuery, PolyRef, PolyType, QueryFilter};

/// Corners closer than this to the agent are dropped
const MIN_TARGET_DIST: f32 = 0.01;

/// Maximum polygons visited by a surface move
const MAX_VISITED: usize = 16;

/// Maximum polygons collected by a shortcut raycast or local search
const MAX_RES: usize = 32;

/// Search iterations spent on one topology optimization
const MAX_TOPOLOGY_ITER: usize = 32;

bitflags! {
    /// Flags of a straight path corner
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
    pub struct StraightPathFlags: u8 {
        /// The corner is the start position of the path
        const START = 0x01;
        /// The corner is the end position of the path
        const END = 0x02;
        /// The corner is the start of an off-mesh connection
        const OFFMESH_CONNECTION = 0x04;
    }
}

/// A corner of the straight path through a corridor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Corner {
    pub pos: Vec3,
    pub flags: StraightPathFlags,
    /// Polygon entered at this corner, null for the end corner
    pub poly: PolyRef,
}

/// Path corridor for smooth path following
#[derive(Debug, Clone)]
pub struct PathCorridor {
    /// Current position in the corridor
    pos: Vec3,
    /// Target position in the corridor
    target: Vec3,
    /// Path polygon references
    path: Vec<PolyRef>,
    max_path: usize,
}

impl Default for PathCorridor {
    fn default() -> Self {
        Self::new()
    }
}

impl PathCorridor {
    /// Creates a new path corridor
    pub fn new() -> Self {
        Self {
            pos: Vec3::ZERO,
            target: Vec3::ZERO,
            path: Vec::new(),
            max_path: 0,
        }
    }

    /// Allocates the corridor's path buffer
    pub fn init(&mut self, max_path: usize) {
        self.max_path = max_path;
        self.path = Vec::with_capacity(max_path);
    }

    /// Resets the corridor to a single polygon at `pos`
    pub fn reset(&mut self, poly: PolyRef, pos: Vec3) {
        self.pos = pos;
        self.target = pos;
        self.path.clear();
        if poly.is_valid() {
            self.path.push(poly);
        }
    }

    /// Loads a new path and target into the corridor
    ///
    /// The path is expected to start at the polygon containing the current
    /// position.
    pub fn set_corridor(&mut self, target: Vec3, path: &[PolyRef]) {
        self.target = target;
        self.path.clear();
        self.path.extend_from_slice(&path[..path.len().min(self.max_path)]);
    }

    /// Finds up to `max_corners` corners from the position toward the target
    ///
    /// Corners too close to the position are dropped and the list ends at the
    /// first off-mesh connection.
    pub fn find_corners<Q: NavMeshQuery>(
        &self,
        max_corners: usize,
        navquery: &Q,
    ) -> Result<Vec<Corner>> {
        self.ensure_path()?;

        let mut corners = match find_straight_path(navquery, self.pos, self.target, &self.path, max_corners) {
            Ok(corners) => corners,
            Err(_) => return Ok(Vec::new()),
        };

        // Prune points in the beginning of the path which are too close
        let skip = corners
            .iter()
            .take_while(|c| {
                !c.flags.contains(StraightPathFlags::OFFMESH_CONNECTION)
                    && dist_sqr_2d(c.pos, self.pos) <= MIN_TARGET_DIST * MIN_TARGET_DIST
            })
            .count();
        corners.drain(..skip);

        // Prune points after an off-mesh connection
        if let Some(i) = corners
            .iter()
            .position(|c| c.flags.contains(StraightPathFlags::OFFMESH_CONNECTION))
        {
            corners.truncate(i + 1);
        }

        Ok(corners)
    }

    /// Shortcuts the start of the corridor if `next` is directly visible
    ///
    /// The ray is cast from the current position toward `next`, extended to
    /// `path_optimization_range`.
    pub fn optimize_path_visibility<Q: NavMeshQuery>(
        &mut self,
        next: Vec3,
        path_optimization_range: f32,
        navquery: &Q,
        filter: &QueryFilter,
    ) -> Result<()> {
        let first = self.ensure_path()?;

        // Clamp the ray to max distance
        let mut dist = dist_2d(self.pos, next);

        // If too close to the goal, do not try to optimize
        if dist < 0.01 {
            return Ok(());
        }

        // Overshoot a little. This helps to optimize open fields in tiled meshes.
        dist = (dist + 0.01).min(path_optimization_range);

        // Adjust ray length
        let delta = next - self.pos;
        let goal = self.pos + delta * (path_optimization_range / dist);

        let Ok(hit) = navquery.raycast(first, self.pos, goal, filter) else {
            return Ok(());
        };

        let res = &hit.path[..hit.path.len().min(MAX_RES)];
        if res.len() > 1 && hit.t > 0.99 {
            merge_corridor_start_shortcut(&mut self.path, self.max_path, res);
        }

        Ok(())
    }

    /// Replaces the start of the corridor with the result of a short local search
    ///
    /// Returns true when the corridor was changed.
    pub fn optimize_path_topology<Q: NavMeshQuery>(
        &mut self,
        navquery: &mut Q,
        filter: &QueryFilter,
    ) -> Result<bool> {
        self.ensure_path()?;
        if self.path.len() < 3 {
            return Ok(false);
        }

        let status = navquery.init_sliced_find_path(
            self.path[0],
            self.get_last_poly(),
            self.pos,
            self.target,
            filter,
        );
        if status.is_failure() {
            return Ok(false);
        }
        navquery.update_sliced_find_path(MAX_TOPOLOGY_ITER);
        let (status, res) = navquery.finalize_sliced_find_path_partial(&self.path, MAX_RES);

        if status.is_success() && !res.is_empty() {
            merge_corridor_start_shortcut(&mut self.path, self.max_path, &res);
            return Ok(true);
        }

        Ok(false)
    }

    /// Advances the corridor over an off-mesh connection
    ///
    /// Returns the polygon before the connection and the connection itself,
    /// together with the connection end points. The corridor position is moved
    /// to the end point. Returns `None` when the connection is not part of the
    /// corridor or has nothing after it.
    pub fn move_over_offmesh_connection<Q: NavMeshQuery>(
        &mut self,
        offmesh_con_ref: PolyRef,
        navquery: &Q,
    ) -> Result<Option<([PolyRef; 2], Vec3, Vec3)>> {
        self.ensure_path()?;

        // Advance the path up to and over the off-mesh connection
        let Some(idx) = self.path.iter().position(|&p| p == offmesh_con_ref) else {
            return Ok(None);
        };
        if idx + 1 >= self.path.len() {
            return Ok(None);
        }

        let prev_ref = if idx > 0 { self.path[idx - 1] } else { PolyRef::NULL };

        // Prune path
        self.path.drain(..=idx);

        let refs = [prev_ref, offmesh_con_ref];
        match navquery.get_off_mesh_connection_end_points(prev_ref, offmesh_con_ref) {
            Ok((start_pos, end_pos)) => {
                self.pos = end_pos;
                Ok(Some((refs, start_pos, end_pos)))
            }
            Err(_) => Ok(None),
        }
    }

    /// Puts the corridor start back onto `safe_ref` at `safe_pos`
    ///
    /// Only the head of the path is replaced. The rest of the corridor is kept
    /// for the replan that follows.
    pub fn fix_path_start(&mut self, safe_ref: PolyRef, safe_pos: Vec3) -> bool {
        self.pos = safe_pos;
        match self.path.first_mut() {
            Some(first) => *first = safe_ref,
            None => self.path.push(safe_ref),
        }
        self.path.dedup();
        true
    }

    /// Cuts the corridor at the first polygon that is no longer valid
    ///
    /// When the first polygon is invalid the corridor restarts at the safe
    /// location. The target is clamped onto the new last polygon.
    pub fn trim_invalid_path<Q: NavMeshQuery>(
        &mut self,
        safe_ref: PolyRef,
        safe_pos: Vec3,
        navquery: &Q,
        filter: &QueryFilter,
    ) -> Result<bool> {
        // Keep valid path as far as possible
        let n = self
            .path
            .iter()
            .take_while(|&&p| navquery.is_valid_poly_ref(p, filter))
            .count();

        if n == self.path.len() && n > 0 {
            // All valid, no need to fix
            return Ok(true);
        } else if n == 0 {
            // The first polyref is bad, use current safe values
            self.pos = safe_pos;
            self.path.clear();
            self.path.push(safe_ref);
        } else {
            // The path is partially usable
            self.path.truncate(n);
        }

        // Clamp target pos to last poly
        if let Ok(target) = navquery.closest_point_on_poly_boundary(self.get_last_poly(), self.target) {
            self.target = target;
        }

        Ok(true)
    }

    /// Checks that the first `max_look_ahead` polygons are still valid
    pub fn is_valid<Q: NavMeshQuery>(
        &self,
        max_look_ahead: usize,
        navquery: &Q,
        filter: &QueryFilter,
    ) -> bool {
        self.path
            .iter()
            .take(max_look_ahead)
            .all(|&p| navquery.is_valid_poly_ref(p, filter))
    }

    /// Moves the position along the navigation surface toward `npos`
    ///
    /// Polygons passed on the way are removed from the start of the corridor
    /// and the height is snapped to the first polygon. Returns false when the
    /// surface move fails.
    pub fn move_position<Q: NavMeshQuery>(
        &mut self,
        npos: Vec3,
        navquery: &Q,
        filter: &QueryFilter,
    ) -> Result<bool> {
        let first = self.ensure_path()?;

        let Ok((mut result, visited)) =
            navquery.move_along_surface(first, self.pos, npos, filter, MAX_VISITED)
        else {
            return Ok(false);
        };

        merge_corridor_start_moved(&mut self.path, self.max_path, &visited);

        // Adjust the position to stay on top of the navmesh
        if let Ok((closest, _)) = navquery.closest_point_on_poly(self.path[0], result) {
            result.y = closest.y;
        }
        self.pos = result;

        Ok(true)
    }

    /// Moves the target along the navigation surface toward `npos`
    ///
    /// Polygons entered on the way are appended to the corridor.
    pub fn move_target_position<Q: NavMeshQuery>(
        &mut self,
        npos: Vec3,
        navquery: &Q,
        filter: &QueryFilter,
    ) -> Result<bool> {
        self.ensure_path()?;

        let Ok((result, visited)) =
            navquery.move_along_surface(self.get_last_poly(), self.target, npos, filter, MAX_VISITED)
        else {
            return Ok(false);
        };

        merge_corridor_end_moved(&mut self.path, self.max_path, &visited);
        self.target = result;

        Ok(true)
    }

    /// Gets the current position
    pub fn get_pos(&self) -> Vec3 {
        self.pos
    }

    /// Gets the target position
    pub fn get_target(&self) -> Vec3 {
        self.target
    }

    /// Gets the path polygons
    pub fn get_path(&self) -> &[PolyRef] {
        &self.path
    }

    /// Gets the length of the path
    pub fn get_path_count(&self) -> usize {
        self.path.len()
    }

    /// Gets the first polygon in the corridor
    pub fn get_first_poly(&self) -> PolyRef {
        self.path.first().copied().unwrap_or(PolyRef::NULL)
    }

    /// Gets the last polygon in the corridor
    pub fn get_last_poly(&self) -> PolyRef {
        self.path.last().copied().unwrap_or(PolyRef::NULL)
    }

    fn ensure_path(&self) -> Result<PolyRef> {
        self.path
            .first()
            .copied()
            .ok_or_else(|| Error::InvariantViolation("path corridor is empty".to_string()))
    }
}

/// Appends a corner, merging it into the previous one when they coincide
///
/// Returns false once the path is complete or full.
fn append_vertex(
    corners: &mut Vec<Corner>,
    pos: Vec3,
    flags: StraightPathFlags,
    poly: PolyRef,
    max_corners: usize,
) -> bool {
    if let Some(last) = corners.last_mut() {
        if vequal(last.pos, pos) {
            // The vertices are equal, update flags and poly
            last.flags = flags;
            last.poly = poly;
            return true;
        }
    }

    corners.push(Corner { pos, flags, poly });

    // If reached end of path or there is no space to append more vertices, return
    !(flags == StraightPathFlags::END || corners.len() >= max_corners)
}

/// String pulls a polygon path into a list of corners using the funnel algorithm
fn find_straight_path<Q: NavMeshQuery>(
    navquery: &Q,
    start_pos: Vec3,
    end_pos: Vec3,
    path: &[PolyRef],
    max_corners: usize,
) -> Result<Vec<Corner>> {
    let mut corners = Vec::with_capacity(max_corners);
    let (Some(&first), Some(&last)) = (path.first(), path.last()) else {
        return Err(Error::InvalidParam("empty polygon path".to_string()));
    };
    if max_corners == 0 {
        return Err(Error::InvalidParam("no room for corners".to_string()));
    }

    let closest_start_pos = navquery.closest_point_on_poly_boundary(first, start_pos)?;
    let closest_end_pos = navquery.closest_point_on_poly_boundary(last, end_pos)?;

    // Add start point
    if !append_vertex(&mut corners, closest_start_pos, StraightPathFlags::START, first, max_corners) {
        return Ok(corners);
    }

    if path.len() > 1 {
        let mut portal_apex = closest_start_pos;
        let mut portal_left = portal_apex;
        let mut portal_right = portal_apex;
        let mut apex_index = 0;
        let mut left_index = 0;
        let mut right_index = 0;

        let mut left_poly_type = PolyType::Ground;
        let mut right_poly_type = PolyType::Ground;
        let mut left_poly_ref = first;
        let mut right_poly_ref = first;

        let mut i = 0;
        while i < path.len() {
            let (left, right, to_type) = if i + 1 < path.len() {
                // Next portal
                let portal = match navquery.get_portal_points(path[i], path[i + 1]) {
                    Ok(portal) => portal,
                    Err(_) => {
                        // Failed to get portal points, path[i] is the last reachable polygon
                        let end = navquery.closest_point_on_poly_boundary(path[i], end_pos)?;
                        append_vertex(&mut corners, end, StraightPathFlags::empty(), path[i], max_corners);
                        return Ok(corners);
                    }
                };
                let to_type = navquery.poly_type(path[i + 1])?;

                // If starting really close to the portal, advance
                if i == 0 {
                    let (d, _) = dist_point_segment_sqr_2d(portal_apex, portal.left, portal.right);
                    if d < 0.001 * 0.001 {
                        i += 1;
                        continue;
                    }
                }

                (portal.left, portal.right, to_type)
            } else {
                // End of the path
                (closest_end_pos, closest_end_pos, PolyType::Ground)
            };

            let next_ref = path.get(i + 1).copied().unwrap_or(PolyRef::NULL);

            // Right vertex
            if tri_area_2d(portal_apex, portal_right, right) <= 0.0 {
                if vequal(portal_apex, portal_right) || tri_area_2d(portal_apex, portal_left, right) > 0.0 {
                    portal_right = right;
                    right_poly_ref = next_ref;
                    right_poly_type = to_type;
                    right_index = i;
                } else {
                    // Right over left, insert left to path and restart scan from portal left point
                    portal_apex = portal_left;
                    apex_index = left_index;

                    let flags = corner_flags(left_poly_ref, left_poly_type);
                    if !append_vertex(&mut corners, portal_apex, flags, left_poly_ref, max_corners) {
                        return Ok(corners);
                    }

                    portal_left = portal_apex;
                    portal_right = portal_apex;
                    left_index = apex_index;
                    right_index = apex_index;

                    // Restart
                    i = apex_index + 1;
                    continue;
                }
            }

            // Left vertex
            if tri_area_2d(portal_apex, portal_left, left) >= 0.0 {
                if vequal(portal_apex, portal_left) || tri_area_2d(portal_apex, portal_right, left) < 0.0 {
                    portal_left = left;
                    left_poly_ref = next_ref;
                    left_poly_type = to_type;
                    left_index = i;
                } else {
                    // Left over right, insert right to path and restart scan from portal right point
                    portal_apex = portal_right;
                    apex_index = right_index;

                    let flags = corner_flags(right_poly_ref, right_poly_type);
                    if !append_vertex(&mut corners, portal_apex, flags, right_poly_ref, max_corners) {
                        return Ok(corners);
                    }

                    portal_left = portal_apex;
                    portal_right = portal_apex;
                    left_index = apex_index;
                    right_index = apex_index;

                    // Restart
                    i = apex_index + 1;
                    continue;
                }
            }

            i += 1;
        }
    }

    append_vertex(&mut corners, closest_end_pos, StraightPathFlags::END, PolyRef::NULL, max_corners);

    Ok(corners)
}

fn corner_flags(poly: PolyRef, poly_type: PolyType) -> StraightPathFlags {
    if !poly.is_valid() {
        StraightPathFlags::END
    } else if poly_type == PolyType::OffMeshConnection {
        StraightPathFlags::OFFMESH_CONNECTION
    } else {
        StraightPathFlags::empty()
    }
}

/// Finds the furthest polygon of `path` that also appears in `visited`
///
/// Returns the path index and the lowest matching visited index.
fn furthest_common_from_end(path: &[PolyRef], visited: &[PolyRef]) -> Option<(usize, usize)> {
    path.iter().enumerate().rev().find_map(|(i, p)| {
        visited.iter().position(|v| v == p).map(|j| (i, j))
    })
}

/// Merges a corridor path when the start position has moved
///
/// The visited polygons, from the furthest common one, replace the head of
/// the path.
pub fn merge_corridor_start_moved(path: &mut Vec<PolyRef>, max_path: usize, visited: &[PolyRef]) {
    // If no intersection found just return current path
    let Some((furthest_path, furthest_visited)) = furthest_common_from_end(path, visited) else {
        return;
    };

    // Store visited in reverse order, then the rest of the path
    let mut merged: Vec<PolyRef> = visited[furthest_visited..].iter().rev().copied().collect();
    merged.extend_from_slice(&path[(furthest_path + 1).min(path.len())..]);
    merged.truncate(max_path.max(1));
    *path = merged;
}

/// Merges a corridor path when the end position has moved
///
/// The visited polygons past the furthest common one are appended.
pub fn merge_corridor_end_moved(path: &mut Vec<PolyRef>, max_path: usize, visited: &[PolyRef]) {
    // Find furthest common polygon, searching from the start of the path
    let Some((furthest_path, furthest_visited)) = path.iter().enumerate().find_map(|(i, p)| {
        visited.iter().position(|v| v == p).map(|j| (i, j))
    }) else {
        return;
    };

    let ppos = furthest_path + 1;
    let vpos = furthest_visited + 1;
    let count = (visited.len() - vpos).min(max_path.saturating_sub(ppos));

    path.truncate(ppos);
    path.extend_from_slice(&visited[vpos..vpos + count]);
}

/// Merges a corridor path after finding a shortcut
///
/// The shortcut polygons before the furthest common one replace the head of
/// the path.
pub fn merge_corridor_start_shortcut(path: &mut Vec<PolyRef>, max_path: usize, visited: &[PolyRef]) {
    let Some((furthest_path, furthest_visited)) = furthest_common_from_end(path, visited) else {
        return;
    };

    let req = furthest_visited;
    if req == 0 {
        return;
    }

    let mut merged = visited[..req].to_vec();
    merged.extend_from_slice(&path[furthest_path..]);
    merged.truncate(max_path.max(1));
    *path = merged;
}

#[cfg(test)]
mod tests {
    use super::*;
    use navcrowd_query::{GridNavMesh, GridNavQuery, PolyFlags};
    use std::sync::Arc;

    fn query(rows: &[&str]) -> GridNavQuery {
        let mesh = GridNavMesh::from_ascii(Vec3::ZERO, 1.0, rows).unwrap();
        GridNavQuery::new(Arc::new(mesh), 256)
    }

    fn refs(q: &GridNavQuery, cells: &[(usize, usize)]) -> Vec<PolyRef> {
        cells.iter().map(|&(x, z)| q.mesh().poly_ref_at(x, z)).collect()
    }

    fn corridor(q: &GridNavQuery, start: Vec3, target: Vec3, cells: &[(usize, usize)]) -> PathCorridor {
        let path = refs(q, cells);
        let mut corridor = PathCorridor::new();
        corridor.init(256);
        corridor.reset(path[0], start);
        corridor.set_corridor(target, &path);
        corridor
    }

    fn assert_near(a: Vec3, b: Vec3) {
        assert!(a.distance(b) < 1e-4, "{a} != {b}");
    }

    #[test]
    fn test_create_corridor() {
        let corridor = PathCorridor::new();

        assert_eq!(corridor.get_pos(), Vec3::ZERO);
        assert_eq!(corridor.get_target(), Vec3::ZERO);
        assert_eq!(corridor.get_path_count(), 0);
        assert_eq!(corridor.get_first_poly(), PolyRef::NULL);
    }

    #[test]
    fn test_reset_corridor() {
        let mut corridor = PathCorridor::new();
        corridor.init(16);

        let start_pos = Vec3::new(10.0, 5.0, 10.0);
        let start_ref = PolyRef::new(42);

        corridor.reset(start_ref, start_pos);

        assert_eq!(corridor.get_pos(), start_pos);
        assert_eq!(corridor.get_target(), start_pos);
        assert_eq!(corridor.get_path(), &[start_ref]);
    }

    #[test]
    fn test_empty_corridor_is_an_error() {
        let q = query(&["..."]);
        let corridor = PathCorridor::new();
        assert!(matches!(
            corridor.find_corners(4, &q),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_find_corners_around_wall() {
        let q = query(&[".....", "####.", "....."]);
        let cells = [(0, 0), (1, 0), (2, 0), (3, 0), (4, 0), (4, 1), (4, 2), (3, 2), (2, 2), (1, 2), (0, 2)];
        let c = corridor(&q, Vec3::new(0.5, 0.0, 0.5), Vec3::new(0.5, 0.0, 2.5), &cells);

        let corners = c.find_corners(4, &q).unwrap();
        assert_eq!(corners.len(), 3);
        assert_near(corners[0].pos, Vec3::new(4.0, 0.0, 1.0));
        assert_near(corners[1].pos, Vec3::new(4.0, 0.0, 2.0));
        assert_near(corners[2].pos, Vec3::new(0.5, 0.0, 2.5));
        assert_eq!(corners[2].flags, StraightPathFlags::END);
        assert_eq!(corners[2].poly, PolyRef::NULL);
    }

    #[test]
    fn test_find_corners_stops_at_offmesh_connection() {
        let mut mesh = GridNavMesh::from_ascii(Vec3::ZERO, 1.0, &["..#.."]).unwrap();
        let con = mesh
            .add_off_mesh_connection(Vec3::new(1.5, 0.0, 0.5), Vec3::new(3.5, 0.0, 0.5), 0.5, true)
            .unwrap();
        let q = GridNavQuery::new(Arc::new(mesh), 256);

        let path = vec![
            q.mesh().poly_ref_at(0, 0),
            q.mesh().poly_ref_at(1, 0),
            con,
            q.mesh().poly_ref_at(3, 0),
            q.mesh().poly_ref_at(4, 0),
        ];
        let mut c = PathCorridor::new();
        c.init(256);
        c.reset(path[0], Vec3::new(0.5, 0.0, 0.5));
        c.set_corridor(Vec3::new(4.5, 0.0, 0.5), &path);

        let corners = c.find_corners(4, &q).unwrap();
        assert_eq!(corners.len(), 1);
        assert!(corners[0].flags.contains(StraightPathFlags::OFFMESH_CONNECTION));
        assert_eq!(corners[0].poly, con);
        assert_near(corners[0].pos, Vec3::new(1.5, 0.0, 0.5));

        let (link_refs, start, end) = c.move_over_offmesh_connection(con, &q).unwrap().unwrap();
        assert_eq!(link_refs, [path[1], con]);
        assert_near(start, Vec3::new(1.5, 0.0, 0.5));
        assert_near(end, Vec3::new(3.5, 0.0, 0.5));
        assert_eq!(c.get_path(), &path[3..]);
        assert_eq!(c.get_pos(), end);
    }

    #[test]
    fn test_move_position_advances_corridor() {
        let q = query(&[".....", "####."]);
        let filter = QueryFilter::default();
        let cells = [(0, 0), (1, 0), (2, 0), (3, 0)];
        let mut c = corridor(&q, Vec3::new(0.5, 0.0, 0.5), Vec3::new(3.5, 0.0, 0.5), &cells);

        assert!(c.move_position(Vec3::new(1.5, 0.0, 0.5), &q, &filter).unwrap());
        assert_near(c.get_pos(), Vec3::new(1.5, 0.0, 0.5));
        assert_eq!(c.get_path(), &refs(&q, &cells[1..])[..]);

        // Blocked by the wall
        assert!(c.move_position(Vec3::new(1.5, 0.0, 1.5), &q, &filter).unwrap());
        assert!(c.get_pos().z <= 1.0 + 1e-4);
        assert_eq!(c.get_first_poly(), q.mesh().poly_ref_at(1, 0));
    }

    #[test]
    fn test_move_target_position_extends_corridor() {
        let q = query(&["....."]);
        let filter = QueryFilter::default();
        let cells = [(0, 0), (1, 0)];
        let mut c = corridor(&q, Vec3::new(0.5, 0.0, 0.5), Vec3::new(1.5, 0.0, 0.5), &cells);

        assert!(c.move_target_position(Vec3::new(3.5, 0.0, 0.5), &q, &filter).unwrap());
        assert_near(c.get_target(), Vec3::new(3.5, 0.0, 0.5));
        assert_eq!(c.get_path(), &refs(&q, &[(0, 0), (1, 0), (2, 0), (3, 0)])[..]);
    }

    #[test]
    fn test_optimize_path_visibility_shortcuts_bend() {
        let q = query(&["...", "..."]);
        let filter = QueryFilter::default();
        let cells = [(0, 0), (0, 1), (1, 1), (2, 1), (2, 0)];
        let target = Vec3::new(2.5, 0.0, 0.5);
        let mut c = corridor(&q, Vec3::new(0.5, 0.0, 0.5), target, &cells);

        c.optimize_path_visibility(target, 2.0, &q, &filter).unwrap();
        assert_eq!(c.get_path(), &refs(&q, &[(0, 0), (1, 0), (2, 0)])[..]);
    }

    #[test]
    fn test_optimize_path_topology_finds_shorter_route() {
        let mut q = query(&["...", "..."]);
        let filter = QueryFilter::default();
        let cells = [(0, 0), (0, 1), (1, 1), (2, 1), (2, 0)];
        let mut c = corridor(&q, Vec3::new(0.5, 0.0, 0.5), Vec3::new(2.5, 0.0, 0.5), &cells);

        assert!(c.optimize_path_topology(&mut q, &filter).unwrap());
        assert_eq!(c.get_path(), &refs(&q, &[(0, 0), (1, 0), (2, 0)])[..]);

        let mut short = corridor(&q, Vec3::new(0.5, 0.0, 0.5), Vec3::new(1.5, 0.0, 0.5), &cells[..2]);
        assert!(!short.optimize_path_topology(&mut q, &filter).unwrap());
    }

    #[test]
    fn test_trim_invalid_path_at_closed_door() {
        let q = query(&["..D.."]);
        let mut filter = QueryFilter::default();
        let cells = [(0, 0), (1, 0), (2, 0), (3, 0), (4, 0)];
        let mut c = corridor(&q, Vec3::new(0.5, 0.0, 0.5), Vec3::new(4.5, 0.0, 0.5), &cells);

        assert!(c.is_valid(10, &q, &filter));
        filter.set_exclude_flags(PolyFlags::DOOR);
        assert!(!c.is_valid(10, &q, &filter));
        assert!(c.is_valid(2, &q, &filter));

        assert!(c.trim_invalid_path(PolyRef::NULL, Vec3::ZERO, &q, &filter).unwrap());
        assert_eq!(c.get_path(), &refs(&q, &cells[..2])[..]);
        assert_near(c.get_target(), Vec3::new(2.0, 0.0, 0.5));
    }

    #[test]
    fn test_fix_path_start() {
        let q = query(&["....."]);
        let cells = [(1, 0), (2, 0), (3, 0)];
        let mut c = corridor(&q, Vec3::new(1.5, 0.0, 0.5), Vec3::new(3.5, 0.0, 0.5), &cells);

        let safe = q.mesh().poly_ref_at(0, 0);
        assert!(c.fix_path_start(safe, Vec3::new(0.5, 0.0, 0.5)));
        assert_eq!(c.get_first_poly(), safe);
        assert_eq!(c.get_path_count(), 3);
        assert_eq!(c.get_pos(), Vec3::new(0.5, 0.0, 0.5));

        // Replacing the head with its successor collapses the duplicate
        let next = q.mesh().poly_ref_at(2, 0);
        c.fix_path_start(next, Vec3::new(2.5, 0.0, 0.5));
        assert_eq!(c.get_path(), &refs(&q, &cells[1..])[..]);
    }

    #[test]
    fn test_merge_corridor_start_moved() {
        let p = |v: &[u32]| v.iter().map(|&r| PolyRef::new(r)).collect::<Vec<_>>();

        let mut path = p(&[1, 2, 3, 4]);
        merge_corridor_start_moved(&mut path, 16, &p(&[1, 2, 3]));
        assert_eq!(path, p(&[3, 4]));

        // Moved backwards off the corridor
        let mut path = p(&[2, 3, 4]);
        merge_corridor_start_moved(&mut path, 16, &p(&[2, 9]));
        assert_eq!(path, p(&[9, 2, 3, 4]));

        // No common polygon
        let mut path = p(&[2, 3]);
        merge_corridor_start_moved(&mut path, 16, &p(&[7, 8]));
        assert_eq!(path, p(&[2, 3]));
    }

    #[test]
    fn test_merge_corridor_start_shortcut() {
        let p = |v: &[u32]| v.iter().map(|&r| PolyRef::new(r)).collect::<Vec<_>>();

        let mut path = p(&[1, 2, 3, 4, 5]);
        merge_corridor_start_shortcut(&mut path, 16, &p(&[1, 6, 4]));
        assert_eq!(path, p(&[1, 6, 4, 5]));

        // Shortcut ending on the first polygon changes nothing
        let mut path = p(&[1, 2, 3]);
        merge_corridor_start_shortcut(&mut path, 16, &p(&[1, 9]));
        assert_eq!(path, p(&[1, 2, 3]));
    }
}
