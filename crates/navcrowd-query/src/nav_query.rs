//! Navigation query interface consumed by the crowd

use crate::{PolyRef, PolyType, QueryFilter};
use glam::Vec3;
use navcrowd_common::{Result, Status};

/// Edge shared by two neighbouring polygons
///
/// `left` and `right` are given relative to travelling from the first polygon
/// into the second. Portals into or out of an off-mesh connection collapse to
/// the connection end point (`left == right`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Portal {
    pub left: Vec3,
    pub right: Vec3,
}

impl Portal {
    /// Midpoint of the portal edge
    pub fn mid(&self) -> Vec3 {
        (self.left + self.right) * 0.5
    }
}

/// Result of a raycast along the navigation mesh surface
#[derive(Debug, Clone, PartialEq)]
pub struct RaycastHit {
    /// Hit parameter along the segment, `f32::MAX` when the end was reached
    pub t: f32,
    /// Normal of the wall that was hit
    pub hit_normal: Vec3,
    /// Polygons visited by the ray, starting with the start polygon
    pub path: Vec<PolyRef>,
}

impl RaycastHit {
    /// Checks whether the ray reached its end point without hitting a wall
    pub fn reached_end(&self) -> bool {
        self.t == f32::MAX
    }
}

/// Queries against a navigation mesh
///
/// Implementations are cheap to clone and share the underlying mesh; every
/// clone owns its own sliced path search state so that several consumers can
/// run incremental searches independently.
pub trait NavMeshQuery {
    /// Finds the polygon nearest to `center` inside the box `center ± half_extents`
    ///
    /// Returns the polygon and the closest point on it.
    fn find_nearest_poly(
        &self,
        center: Vec3,
        half_extents: Vec3,
        filter: &QueryFilter,
    ) -> Option<(PolyRef, Vec3)>;

    /// Checks whether a polygon exists and passes the filter
    fn is_valid_poly_ref(&self, poly: PolyRef, filter: &QueryFilter) -> bool;

    /// Gets the kind of polygon
    fn poly_type(&self, poly: PolyRef) -> Result<PolyType>;

    /// Finds the closest point on a polygon
    ///
    /// The returned flag is true when `pos` lies over the polygon.
    fn closest_point_on_poly(&self, poly: PolyRef, pos: Vec3) -> Result<(Vec3, bool)>;

    /// Finds the closest point on the boundary of a polygon, or `pos` itself when inside
    fn closest_point_on_poly_boundary(&self, poly: PolyRef, pos: Vec3) -> Result<Vec3>;

    /// Gets the portal edge between two neighbouring polygons
    fn get_portal_points(&self, from: PolyRef, to: PolyRef) -> Result<Portal>;

    /// Casts a ray along the surface from `start_pos` towards `end_pos`
    fn raycast(
        &self,
        start_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
    ) -> Result<RaycastHit>;

    /// Moves from `start_pos` towards `end_pos` while staying on the surface
    ///
    /// Returns the reached position and the visited polygons from the start
    /// polygon to the polygon containing the result.
    fn move_along_surface(
        &self,
        start_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
        max_visited: usize,
    ) -> Result<(Vec3, Vec<PolyRef>)>;

    /// Collects polygons connected to `start_ref` within `radius` of `center`
    fn find_local_neighbourhood(
        &self,
        start_ref: PolyRef,
        center: Vec3,
        radius: f32,
        filter: &QueryFilter,
        max_result: usize,
    ) -> Result<Vec<PolyRef>>;

    /// Gets the edges of a polygon that cannot be crossed under the filter
    fn get_poly_wall_segments(&self, poly: PolyRef, filter: &QueryFilter)
        -> Result<Vec<(Vec3, Vec3)>>;

    /// Gets the end points of an off-mesh connection, ordered from the side of `prev_ref`
    fn get_off_mesh_connection_end_points(
        &self,
        prev_ref: PolyRef,
        connection: PolyRef,
    ) -> Result<(Vec3, Vec3)>;

    /// Starts an incremental path search
    fn init_sliced_find_path(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
    ) -> Status;

    /// Runs at most `max_iter` search iterations, returning the iterations used
    fn update_sliced_find_path(&mut self, max_iter: usize) -> (usize, Status);

    /// Ends the search and returns the best path found
    ///
    /// A search that has not reached its goal yields the path to the polygon
    /// closest to the goal with a `PartialResult` status.
    fn finalize_sliced_find_path(&mut self, max_path: usize) -> (Status, Vec<PolyRef>);

    /// Ends the search, returning a path to the furthest polygon of `existing`
    /// that the search visited
    fn finalize_sliced_find_path_partial(
        &mut self,
        existing: &[PolyRef],
        max_path: usize,
    ) -> (Status, Vec<PolyRef>);
}
