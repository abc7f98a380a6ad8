//! Grid navigation query that records sliced search work

use std::cell::Cell;
use std::rc::Rc;

use glam::Vec3;
use navcrowd_common::{Result, Status};
use navcrowd_query::{
    GridNavMesh, GridNavQuery, NavMeshQuery, PolyRef, PolyType, Portal, QueryFilter, RaycastHit,
};

/// Wraps [`GridNavQuery`], counting search iterations and optionally failing
/// searches in progress
///
/// Clones share the counter and the failure switch, so a crowd and its path
/// queue can be observed through one handle.
#[derive(Debug, Clone)]
pub(crate) struct InstrumentedQuery {
    inner: GridNavQuery,
    iterations: Rc<Cell<usize>>,
    fail_searches: Rc<Cell<bool>>,
}

impl InstrumentedQuery {
    pub(crate) fn new(inner: GridNavQuery) -> Self {
        Self {
            inner,
            iterations: Rc::new(Cell::new(0)),
            fail_searches: Rc::new(Cell::new(false)),
        }
    }

    pub(crate) fn mesh(&self) -> &GridNavMesh {
        self.inner.mesh()
    }

    /// Search iterations run so far by this query and its clones
    pub(crate) fn iterations(&self) -> usize {
        self.iterations.get()
    }

    /// Makes every following search update report `Failure`
    pub(crate) fn set_fail_searches(&self, fail: bool) {
        self.fail_searches.set(fail);
    }
}

impl NavMeshQuery for InstrumentedQuery {
    fn find_nearest_poly(
        &self,
        center: Vec3,
        half_extents: Vec3,
        filter: &QueryFilter,
    ) -> Option<(PolyRef, Vec3)> {
        self.inner.find_nearest_poly(center, half_extents, filter)
    }

    fn is_valid_poly_ref(&self, poly: PolyRef, filter: &QueryFilter) -> bool {
        self.inner.is_valid_poly_ref(poly, filter)
    }

    fn poly_type(&self, poly: PolyRef) -> Result<PolyType> {
        self.inner.poly_type(poly)
    }

    fn closest_point_on_poly(&self, poly: PolyRef, pos: Vec3) -> Result<(Vec3, bool)> {
        self.inner.closest_point_on_poly(poly, pos)
    }

    fn closest_point_on_poly_boundary(&self, poly: PolyRef, pos: Vec3) -> Result<Vec3> {
        self.inner.closest_point_on_poly_boundary(poly, pos)
    }

    fn get_portal_points(&self, from: PolyRef, to: PolyRef) -> Result<Portal> {
        self.inner.get_portal_points(from, to)
    }

    fn raycast(
        &self,
        start_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
    ) -> Result<RaycastHit> {
        self.inner.raycast(start_ref, start_pos, end_pos, filter)
    }

    fn move_along_surface(
        &self,
        start_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
        max_visited: usize,
    ) -> Result<(Vec3, Vec<PolyRef>)> {
        self.inner
            .move_along_surface(start_ref, start_pos, end_pos, filter, max_visited)
    }

    fn find_local_neighbourhood(
        &self,
        start_ref: PolyRef,
        center: Vec3,
        radius: f32,
        filter: &QueryFilter,
        max_result: usize,
    ) -> Result<Vec<PolyRef>> {
        self.inner
            .find_local_neighbourhood(start_ref, center, radius, filter, max_result)
    }

    fn get_poly_wall_segments(
        &self,
        poly: PolyRef,
        filter: &QueryFilter,
    ) -> Result<Vec<(Vec3, Vec3)>> {
        self.inner.get_poly_wall_segments(poly, filter)
    }

    fn get_off_mesh_connection_end_points(
        &self,
        prev_ref: PolyRef,
        connection: PolyRef,
    ) -> Result<(Vec3, Vec3)> {
        self.inner
            .get_off_mesh_connection_end_points(prev_ref, connection)
    }

    fn init_sliced_find_path(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
    ) -> Status {
        self.inner
            .init_sliced_find_path(start_ref, end_ref, start_pos, end_pos, filter)
    }

    fn update_sliced_find_path(&mut self, max_iter: usize) -> (usize, Status) {
        if self.fail_searches.get() {
            return (0, Status::Failure);
        }
        let (iters, status) = self.inner.update_sliced_find_path(max_iter);
        self.iterations.set(self.iterations.get() + iters);
        (iters, status)
    }

    fn finalize_sliced_find_path(&mut self, max_path: usize) -> (Status, Vec<PolyRef>) {
        self.inner.finalize_sliced_find_path(max_path)
    }

    fn finalize_sliced_find_path_partial(
        &mut self,
        existing: &[PolyRef],
        max_path: usize,
    ) -> (Status, Vec<PolyRef>) {
        self.inner.finalize_sliced_find_path_partial(existing, max_path)
    }
}
