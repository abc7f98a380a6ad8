//! Grid navigation mesh
//!
//! A navigation mesh made of square polygons laid out on a regular grid at a
//! constant height. Cells can be blocked, flagged and assigned areas, and
//! off-mesh connections link arbitrary cells. [`GridNavQuery`] answers all
//! [`NavMeshQuery`] requests against a shared mesh.

use crate::sliced_search::SlicedSearch;
use crate::{NavMeshQuery, PolyFlags, PolyRef, PolyType, Portal, QueryFilter, RaycastHit};
use glam::Vec3;
use log::{debug, trace};
use navcrowd_common::{dist_point_segment_sqr_2d, Error, Result, Status};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Maximum number of polygons explored by a single surface move
const MAX_MOVE_NODES: usize = 48;

/// Neighbour offset across each cell edge, in vertex order
const EDGE_OFFSETS: [(i64, i64); 4] = [(-1, 0), (0, 1), (1, 0), (0, -1)];

/// Normal of each cell edge pointing back into the cell
const EDGE_NORMALS: [Vec3; 4] = [Vec3::X, Vec3::NEG_Z, Vec3::NEG_X, Vec3::Z];

#[derive(Debug, Clone, Copy, PartialEq)]
struct Cell {
    walkable: bool,
    flags: PolyFlags,
    area: u8,
}

/// Point-to-point link between two cells
#[derive(Debug, Clone, PartialEq)]
pub struct OffMeshConnection {
    /// Entry point of the link
    pub start: Vec3,
    /// Exit point of the link
    pub end: Vec3,
    /// Radius around the end points at which the link can be taken
    pub radius: f32,
    /// Whether the link can also be traversed from end to start
    pub bidirectional: bool,
    pub flags: PolyFlags,
    pub area: u8,
    start_cell: usize,
    end_cell: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Poly {
    Cell(usize),
    Connection(usize),
}

/// Navigation mesh of square cells on the XZ plane
#[derive(Debug, Clone)]
pub struct GridNavMesh {
    origin: Vec3,
    cell_size: f32,
    width: usize,
    depth: usize,
    cells: Vec<Cell>,
    connections: Vec<OffMeshConnection>,
}

impl GridNavMesh {
    /// Creates a fully walkable grid of `width` x `depth` cells with its minimum corner at `origin`
    pub fn new(origin: Vec3, cell_size: f32, width: usize, depth: usize) -> Result<Self> {
        if cell_size <= 0.0 || width == 0 || depth == 0 {
            return Err(Error::InvalidParam(format!(
                "grid of {width}x{depth} cells of size {cell_size}"
            )));
        }

        let cell = Cell {
            walkable: true,
            flags: PolyFlags::WALK,
            area: 0,
        };

        Ok(Self {
            origin,
            cell_size,
            width,
            depth,
            cells: vec![cell; width * depth],
            connections: Vec::new(),
        })
    }

    /// Builds a grid from text rows
    ///
    /// Row `z` of the grid is `rows[z]`, column `x` its `x`-th character.
    /// `#` marks a blocked cell, `D` a walkable door cell; anything else is
    /// plain walkable ground. Short rows are padded with blocked cells.
    pub fn from_ascii(origin: Vec3, cell_size: f32, rows: &[&str]) -> Result<Self> {
        let depth = rows.len();
        let width = rows.iter().map(|r| r.chars().count()).max().unwrap_or(0);
        let mut mesh = Self::new(origin, cell_size, width, depth)?;

        for (z, row) in rows.iter().enumerate() {
            let chars: Vec<char> = row.chars().collect();
            for x in 0..width {
                match chars.get(x).copied().unwrap_or('#') {
                    '#' => mesh.set_walkable(x, z, false)?,
                    'D' => mesh.set_cell_flags(x, z, PolyFlags::WALK | PolyFlags::DOOR)?,
                    _ => {}
                }
            }
        }

        Ok(mesh)
    }

    /// Minimum corner of the grid
    pub fn origin(&self) -> Vec3 {
        self.origin
    }

    /// Edge length of a cell
    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Number of cells along X
    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of cells along Z
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Off-mesh connections of the mesh
    pub fn connections(&self) -> &[OffMeshConnection] {
        &self.connections
    }

    fn cell_index(&self, x: usize, z: usize) -> Result<usize> {
        if x >= self.width || z >= self.depth {
            return Err(Error::InvalidParam(format!(
                "cell ({x}, {z}) outside {}x{} grid",
                self.width, self.depth
            )));
        }
        Ok(z * self.width + x)
    }

    /// Marks a cell as walkable or blocked
    pub fn set_walkable(&mut self, x: usize, z: usize, walkable: bool) -> Result<()> {
        let idx = self.cell_index(x, z)?;
        self.cells[idx].walkable = walkable;
        Ok(())
    }

    /// Sets the polygon flags of a cell
    pub fn set_cell_flags(&mut self, x: usize, z: usize, flags: PolyFlags) -> Result<()> {
        let idx = self.cell_index(x, z)?;
        self.cells[idx].flags = flags;
        Ok(())
    }

    /// Sets the area type of a cell
    pub fn set_cell_area(&mut self, x: usize, z: usize, area: u8) -> Result<()> {
        let idx = self.cell_index(x, z)?;
        self.cells[idx].area = area;
        Ok(())
    }

    /// Gets the polygon of a cell, or the null reference for blocked or missing cells
    pub fn poly_ref_at(&self, x: usize, z: usize) -> PolyRef {
        match self.cell_index(x, z) {
            Ok(idx) if self.cells[idx].walkable => Self::cell_ref(idx),
            _ => PolyRef::NULL,
        }
    }

    /// Center of a cell on the mesh surface
    pub fn cell_center(&self, x: usize, z: usize) -> Vec3 {
        let half = self.cell_size * 0.5;
        Vec3::new(
            self.origin.x + x as f32 * self.cell_size + half,
            self.origin.y,
            self.origin.z + z as f32 * self.cell_size + half,
        )
    }

    /// Finds the cell containing a position
    pub fn locate(&self, pos: Vec3) -> Option<(usize, usize)> {
        let x = ((pos.x - self.origin.x) / self.cell_size).floor();
        let z = ((pos.z - self.origin.z) / self.cell_size).floor();
        if x < 0.0 || z < 0.0 || x >= self.width as f32 || z >= self.depth as f32 {
            return None;
        }
        Some((x as usize, z as usize))
    }

    /// Adds a link from `start` to `end`; both must lie over walkable cells
    pub fn add_off_mesh_connection(
        &mut self,
        start: Vec3,
        end: Vec3,
        radius: f32,
        bidirectional: bool,
    ) -> Result<PolyRef> {
        let start_cell = self.walkable_cell_at(start)?;
        let end_cell = self.walkable_cell_at(end)?;

        self.connections.push(OffMeshConnection {
            start,
            end,
            radius,
            bidirectional,
            flags: PolyFlags::JUMP,
            area: 0,
            start_cell,
            end_cell,
        });

        let con = self.connection_ref(self.connections.len() - 1);
        debug!("Added off-mesh connection {} from {:?} to {:?}", con, start, end);
        Ok(con)
    }

    /// Gets an off-mesh connection by reference
    pub fn connection(&self, poly: PolyRef) -> Option<&OffMeshConnection> {
        match self.decode(poly)? {
            Poly::Connection(k) => self.connections.get(k),
            Poly::Cell(_) => None,
        }
    }

    fn walkable_cell_at(&self, pos: Vec3) -> Result<usize> {
        self.locate(pos)
            .map(|(x, z)| z * self.width + x)
            .filter(|&idx| self.cells[idx].walkable)
            .ok_or_else(|| Error::InvalidParam(format!("no walkable cell at {pos}")))
    }

    fn cell_ref(idx: usize) -> PolyRef {
        PolyRef::new(idx as u32 + 1)
    }

    fn connection_ref(&self, k: usize) -> PolyRef {
        PolyRef::new((self.cells.len() + k) as u32 + 1)
    }

    fn decode(&self, poly: PolyRef) -> Option<Poly> {
        let id = (poly.id() as usize).checked_sub(1)?;
        if id < self.cells.len() {
            Some(Poly::Cell(id))
        } else if id - self.cells.len() < self.connections.len() {
            Some(Poly::Connection(id - self.cells.len()))
        } else {
            None
        }
    }

    /// Checks whether the reference names an existing, walkable polygon
    pub(crate) fn contains(&self, poly: PolyRef) -> bool {
        match self.decode(poly) {
            Some(Poly::Cell(idx)) => self.cells[idx].walkable,
            Some(Poly::Connection(_)) => true,
            None => false,
        }
    }

    pub(crate) fn is_passable(&self, poly: PolyRef, filter: &QueryFilter) -> bool {
        match self.decode(poly) {
            Some(Poly::Cell(idx)) => {
                self.cells[idx].walkable && filter.pass_filter(self.cells[idx].flags)
            }
            Some(Poly::Connection(k)) => filter.pass_filter(self.connections[k].flags),
            None => false,
        }
    }

    pub(crate) fn poly_area(&self, poly: PolyRef) -> u8 {
        match self.decode(poly) {
            Some(Poly::Cell(idx)) => self.cells[idx].area,
            Some(Poly::Connection(k)) => self.connections[k].area,
            None => 0,
        }
    }

    fn cell_bounds(&self, idx: usize) -> (Vec3, Vec3) {
        let x = (idx % self.width) as f32;
        let z = (idx / self.width) as f32;
        let min = Vec3::new(
            self.origin.x + x * self.cell_size,
            self.origin.y,
            self.origin.z + z * self.cell_size,
        );
        (min, min + Vec3::new(self.cell_size, 0.0, self.cell_size))
    }

    /// Cell corners in edge order; edge `i` runs from vertex `i` to `i + 1`
    fn cell_verts(&self, idx: usize) -> [Vec3; 4] {
        let (min, max) = self.cell_bounds(idx);
        [
            Vec3::new(min.x, self.origin.y, min.z),
            Vec3::new(min.x, self.origin.y, max.z),
            Vec3::new(max.x, self.origin.y, max.z),
            Vec3::new(max.x, self.origin.y, min.z),
        ]
    }

    fn cell_contains_2d(&self, idx: usize, pos: Vec3) -> bool {
        let (min, max) = self.cell_bounds(idx);
        pos.x >= min.x && pos.x <= max.x && pos.z >= min.z && pos.z <= max.z
    }

    /// Walkable cell across the given edge
    fn cell_neighbour(&self, idx: usize, edge: usize) -> Option<usize> {
        let (dx, dz) = EDGE_OFFSETS[edge];
        let x = (idx % self.width) as i64 + dx;
        let z = (idx / self.width) as i64 + dz;
        if x < 0 || z < 0 || x >= self.width as i64 || z >= self.depth as i64 {
            return None;
        }
        let n = z as usize * self.width + x as usize;
        self.cells[n].walkable.then_some(n)
    }

    fn passable_neighbour(&self, idx: usize, edge: usize, filter: &QueryFilter) -> Option<usize> {
        self.cell_neighbour(idx, edge)
            .filter(|&n| filter.pass_filter(self.cells[n].flags))
    }

    /// Polygons linked to `poly`, cells first, then off-mesh connections
    pub(crate) fn neighbours(&self, poly: PolyRef) -> Vec<PolyRef> {
        let mut result = Vec::new();
        match self.decode(poly) {
            Some(Poly::Cell(idx)) => {
                for edge in 0..4 {
                    if let Some(n) = self.cell_neighbour(idx, edge) {
                        result.push(Self::cell_ref(n));
                    }
                }
                for (k, con) in self.connections.iter().enumerate() {
                    if con.start_cell == idx || (con.bidirectional && con.end_cell == idx) {
                        result.push(self.connection_ref(k));
                    }
                }
            }
            Some(Poly::Connection(k)) => {
                let con = &self.connections[k];
                if self.cells[con.end_cell].walkable {
                    result.push(Self::cell_ref(con.end_cell));
                }
                if con.bidirectional && self.cells[con.start_cell].walkable {
                    result.push(Self::cell_ref(con.start_cell));
                }
            }
            None => {}
        }
        result
    }

    pub(crate) fn portal(&self, from: PolyRef, to: PolyRef) -> Option<Portal> {
        match (self.decode(from)?, self.decode(to)?) {
            (Poly::Cell(a), Poly::Cell(b)) => {
                let edge = (0..4).find(|&e| self.cell_neighbour(a, e) == Some(b))?;
                let verts = self.cell_verts(a);
                Some(Portal {
                    left: verts[edge],
                    right: verts[(edge + 1) % 4],
                })
            }
            (Poly::Cell(a), Poly::Connection(k)) => {
                let con = &self.connections[k];
                let p = if con.start_cell == a {
                    con.start
                } else if con.bidirectional && con.end_cell == a {
                    con.end
                } else {
                    return None;
                };
                Some(Portal { left: p, right: p })
            }
            (Poly::Connection(k), Poly::Cell(b)) => {
                let con = &self.connections[k];
                let p = if con.end_cell == b {
                    con.end
                } else if con.bidirectional && con.start_cell == b {
                    con.start
                } else {
                    return None;
                };
                Some(Portal { left: p, right: p })
            }
            (Poly::Connection(_), Poly::Connection(_)) => None,
        }
    }
}

/// Query object over a shared [`GridNavMesh`]
#[derive(Debug, Clone)]
pub struct GridNavQuery {
    mesh: Arc<GridNavMesh>,
    search: SlicedSearch,
}

impl GridNavQuery {
    /// Creates a query whose path searches may allocate up to `max_nodes` nodes
    pub fn new(mesh: Arc<GridNavMesh>, max_nodes: usize) -> Self {
        Self {
            mesh,
            search: SlicedSearch::new(max_nodes),
        }
    }

    /// The mesh being queried
    pub fn mesh(&self) -> &GridNavMesh {
        &self.mesh
    }

    /// Runs a complete path search in one call
    pub fn find_path(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
        max_path: usize,
    ) -> (Status, Vec<PolyRef>) {
        let status = self.init_sliced_find_path(start_ref, end_ref, start_pos, end_pos, filter);
        if status.is_failure() {
            trace!("Path search from {} to {} rejected: {}", start_ref, end_ref, status);
            return (status, Vec::new());
        }
        let (iters, status) = self.update_sliced_find_path(usize::MAX);
        if status.is_failure() {
            return (status, Vec::new());
        }
        trace!("Path search from {} to {} finished after {} iterations", start_ref, end_ref, iters);
        self.finalize_sliced_find_path(max_path)
    }

    fn decode(&self, poly: PolyRef) -> Result<Poly> {
        self.mesh
            .decode(poly)
            .filter(|_| self.mesh.contains(poly))
            .ok_or(Error::Query(Status::InvalidParam))
    }

    fn decode_cell(&self, poly: PolyRef) -> Result<usize> {
        match self.decode(poly)? {
            Poly::Cell(idx) => Ok(idx),
            Poly::Connection(_) => Err(Error::Query(Status::InvalidParam)),
        }
    }

    fn closest_on_connection(&self, k: usize, pos: Vec3) -> Vec3 {
        let con = &self.mesh.connections[k];
        let (_, t) = dist_point_segment_sqr_2d(pos, con.start, con.end);
        con.start.lerp(con.end, t)
    }

    fn clamp_to_cell(&self, idx: usize, pos: Vec3) -> Vec3 {
        let (min, max) = self.mesh.cell_bounds(idx);
        Vec3::new(
            pos.x.clamp(min.x, max.x),
            self.mesh.origin.y,
            pos.z.clamp(min.z, max.z),
        )
    }
}

impl NavMeshQuery for GridNavQuery {
    fn find_nearest_poly(
        &self,
        center: Vec3,
        half_extents: Vec3,
        filter: &QueryFilter,
    ) -> Option<(PolyRef, Vec3)> {
        let mesh = &self.mesh;
        if (center.y - mesh.origin.y).abs() > half_extents.y {
            return None;
        }

        let to_cell = |v: f32, o: f32| ((v - o) / mesh.cell_size).floor() as i64;
        let lo = center - half_extents;
        let hi = center + half_extents;
        let x0 = to_cell(lo.x, mesh.origin.x).max(0);
        let x1 = to_cell(hi.x, mesh.origin.x).min(mesh.width as i64 - 1);
        let z0 = to_cell(lo.z, mesh.origin.z).max(0);
        let z1 = to_cell(hi.z, mesh.origin.z).min(mesh.depth as i64 - 1);
        if x0 > x1 || z0 > z1 {
            return None;
        }

        let mut nearest = None;
        let mut nearest_dist = f32::MAX;
        for z in z0..=z1 {
            for x in x0..=x1 {
                let idx = z as usize * mesh.width + x as usize;
                let cell = &mesh.cells[idx];
                if !cell.walkable || !filter.pass_filter(cell.flags) {
                    continue;
                }
                let closest = self.clamp_to_cell(idx, center);
                let d = closest.distance_squared(center);
                if d < nearest_dist {
                    nearest_dist = d;
                    nearest = Some((GridNavMesh::cell_ref(idx), closest));
                }
            }
        }
        nearest
    }

    fn is_valid_poly_ref(&self, poly: PolyRef, filter: &QueryFilter) -> bool {
        self.mesh.is_passable(poly, filter)
    }

    fn poly_type(&self, poly: PolyRef) -> Result<PolyType> {
        Ok(match self.decode(poly)? {
            Poly::Cell(_) => PolyType::Ground,
            Poly::Connection(_) => PolyType::OffMeshConnection,
        })
    }

    fn closest_point_on_poly(&self, poly: PolyRef, pos: Vec3) -> Result<(Vec3, bool)> {
        match self.decode(poly)? {
            Poly::Cell(idx) => Ok((
                self.clamp_to_cell(idx, pos),
                self.mesh.cell_contains_2d(idx, pos),
            )),
            Poly::Connection(k) => Ok((self.closest_on_connection(k, pos), false)),
        }
    }

    fn closest_point_on_poly_boundary(&self, poly: PolyRef, pos: Vec3) -> Result<Vec3> {
        match self.decode(poly)? {
            Poly::Cell(idx) if self.mesh.cell_contains_2d(idx, pos) => Ok(pos),
            Poly::Cell(idx) => Ok(self.clamp_to_cell(idx, pos)),
            Poly::Connection(k) => Ok(self.closest_on_connection(k, pos)),
        }
    }

    fn get_portal_points(&self, from: PolyRef, to: PolyRef) -> Result<Portal> {
        self.mesh
            .portal(from, to)
            .ok_or(Error::Query(Status::InvalidParam))
    }

    fn raycast(
        &self,
        start_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
    ) -> Result<RaycastHit> {
        let mut cur = self.decode_cell(start_ref)?;
        let dir = end_pos - start_pos;
        let mut hit = RaycastHit {
            t: f32::MAX,
            hit_normal: Vec3::ZERO,
            path: vec![start_ref],
        };

        let exit_time = |d: f32, s: f32, min: f32, max: f32| {
            if d > 0.0 {
                (max - s) / d
            } else if d < 0.0 {
                (min - s) / d
            } else {
                f32::INFINITY
            }
        };

        for _ in 0..self.mesh.cells.len() {
            let (min, max) = self.mesh.cell_bounds(cur);
            let tx = exit_time(dir.x, start_pos.x, min.x, max.x);
            let tz = exit_time(dir.z, start_pos.z, min.z, max.z);
            let t_exit = tx.min(tz);
            if t_exit >= 1.0 {
                return Ok(hit);
            }

            let edge = if tx <= tz {
                if dir.x > 0.0 {
                    2
                } else {
                    0
                }
            } else if dir.z > 0.0 {
                1
            } else {
                3
            };

            match self.mesh.passable_neighbour(cur, edge, filter) {
                Some(next) => {
                    cur = next;
                    hit.path.push(GridNavMesh::cell_ref(next));
                }
                None => {
                    hit.t = t_exit.max(0.0);
                    hit.hit_normal = EDGE_NORMALS[edge];
                    return Ok(hit);
                }
            }
        }

        Ok(hit)
    }

    fn move_along_surface(
        &self,
        start_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
        max_visited: usize,
    ) -> Result<(Vec3, Vec<PolyRef>)> {
        let start = self.decode_cell(start_ref)?;
        let mesh = &self.mesh;

        // Only search polygons touching the circle spanned by the move
        let search_pos = start_pos.lerp(end_pos, 0.5);
        let search_rad_sqr = (start_pos.distance(end_pos) * 0.5 + 0.001).powi(2);

        let mut parents: HashMap<usize, Option<usize>> = HashMap::new();
        parents.insert(start, None);
        let mut queue = VecDeque::from([start]);

        let mut best = start;
        let mut best_pos = start_pos;
        let mut best_dist = f32::MAX;

        while let Some(cur) = queue.pop_front() {
            if mesh.cell_contains_2d(cur, end_pos) {
                best = cur;
                best_pos = end_pos;
                break;
            }

            let verts = mesh.cell_verts(cur);
            for edge in 0..4 {
                let va = verts[edge];
                let vb = verts[(edge + 1) % 4];
                match mesh.passable_neighbour(cur, edge, filter) {
                    None => {
                        let (d, t) = dist_point_segment_sqr_2d(end_pos, va, vb);
                        if d < best_dist {
                            best_dist = d;
                            best_pos = va.lerp(vb, t);
                            best = cur;
                        }
                    }
                    Some(next) => {
                        if parents.contains_key(&next) || parents.len() >= MAX_MOVE_NODES {
                            continue;
                        }
                        if dist_point_segment_sqr_2d(search_pos, va, vb).0 > search_rad_sqr {
                            continue;
                        }
                        parents.insert(next, Some(cur));
                        queue.push_back(next);
                    }
                }
            }
        }

        let mut visited = Vec::new();
        let mut node = Some(best);
        while let Some(idx) = node {
            visited.push(GridNavMesh::cell_ref(idx));
            node = parents.get(&idx).copied().flatten();
        }
        visited.reverse();
        visited.truncate(max_visited);

        Ok((best_pos, visited))
    }

    fn find_local_neighbourhood(
        &self,
        start_ref: PolyRef,
        center: Vec3,
        radius: f32,
        filter: &QueryFilter,
        max_result: usize,
    ) -> Result<Vec<PolyRef>> {
        let start = self.decode_cell(start_ref)?;
        let mesh = &self.mesh;
        let radius_sqr = radius * radius;

        let mut result = vec![start_ref];
        let mut visited = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);

        while let Some(cur) = queue.pop_front() {
            let verts = mesh.cell_verts(cur);
            for edge in 0..4 {
                let Some(next) = mesh.passable_neighbour(cur, edge, filter) else {
                    continue;
                };
                if visited.contains(&next) {
                    continue;
                }
                let (d, _) = dist_point_segment_sqr_2d(center, verts[edge], verts[(edge + 1) % 4]);
                if d > radius_sqr {
                    continue;
                }
                if result.len() >= max_result {
                    return Ok(result);
                }
                visited.insert(next);
                result.push(GridNavMesh::cell_ref(next));
                queue.push_back(next);
            }
        }

        Ok(result)
    }

    fn get_poly_wall_segments(
        &self,
        poly: PolyRef,
        filter: &QueryFilter,
    ) -> Result<Vec<(Vec3, Vec3)>> {
        match self.decode(poly)? {
            Poly::Cell(idx) => {
                let verts = self.mesh.cell_verts(idx);
                Ok((0..4)
                    .filter(|&edge| self.mesh.passable_neighbour(idx, edge, filter).is_none())
                    .map(|edge| (verts[edge], verts[(edge + 1) % 4]))
                    .collect())
            }
            Poly::Connection(_) => Ok(Vec::new()),
        }
    }

    fn get_off_mesh_connection_end_points(
        &self,
        prev_ref: PolyRef,
        connection: PolyRef,
    ) -> Result<(Vec3, Vec3)> {
        let Poly::Connection(k) = self.decode(connection)? else {
            return Err(Error::Query(Status::InvalidParam));
        };
        let con = &self.mesh.connections[k];
        if con.start_cell != con.end_cell && self.mesh.decode(prev_ref) == Some(Poly::Cell(con.end_cell))
        {
            Ok((con.end, con.start))
        } else {
            Ok((con.start, con.end))
        }
    }

    fn init_sliced_find_path(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: &QueryFilter,
    ) -> Status {
        self.search
            .init(&self.mesh, start_ref, end_ref, start_pos, end_pos, filter)
    }

    fn update_sliced_find_path(&mut self, max_iter: usize) -> (usize, Status) {
        self.search.update(&self.mesh, max_iter)
    }

    fn finalize_sliced_find_path(&mut self, max_path: usize) -> (Status, Vec<PolyRef>) {
        self.search.finalize(max_path)
    }

    fn finalize_sliced_find_path_partial(
        &mut self,
        existing: &[PolyRef],
        max_path: usize,
    ) -> (Status, Vec<PolyRef>) {
        self.search.finalize_partial(existing, max_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use navcrowd_common::tri_area_2d;

    fn corridor_mesh() -> Arc<GridNavMesh> {
        Arc::new(
            GridNavMesh::from_ascii(
                Vec3::ZERO,
                1.0,
                &[
                    "..........",
                    ".########.",
                    "..........",
                ],
            )
            .expect("valid grid"),
        )
    }

    #[test]
    fn test_find_nearest_poly() {
        let query = GridNavQuery::new(corridor_mesh(), 256);
        let filter = QueryFilter::default();

        let (poly, pos) = query
            .find_nearest_poly(Vec3::new(2.5, 0.0, 0.5), Vec3::new(1.0, 1.0, 1.0), &filter)
            .expect("walkable cell");
        assert_eq!(poly, query.mesh().poly_ref_at(2, 0));
        assert_eq!(pos, Vec3::new(2.5, 0.0, 0.5));

        // Blocked cell snaps to the nearest walkable neighbour
        let (poly, _) = query
            .find_nearest_poly(Vec3::new(4.5, 0.0, 1.5), Vec3::new(1.0, 1.0, 1.0), &filter)
            .expect("neighbouring cell");
        assert!(poly.is_valid());
        assert_ne!(poly, query.mesh().poly_ref_at(4, 1));

        // Too far above the surface
        assert!(query
            .find_nearest_poly(Vec3::new(2.5, 5.0, 0.5), Vec3::new(1.0, 1.0, 1.0), &filter)
            .is_none());
    }

    #[test]
    fn test_portal_orientation() {
        let query = GridNavQuery::new(corridor_mesh(), 256);
        let mesh = query.mesh();
        let from = mesh.poly_ref_at(0, 0);
        let to = mesh.poly_ref_at(1, 0);
        let portal = query.get_portal_points(from, to).expect("adjacent cells");

        // Right must lie to the right of the apex-left line
        let apex = mesh.cell_center(0, 0);
        assert!(tri_area_2d(apex, portal.left, portal.right) > 0.0);

        assert!(query
            .get_portal_points(from, mesh.poly_ref_at(5, 2))
            .is_err());
    }

    #[test]
    fn test_raycast_hits_wall() {
        let query = GridNavQuery::new(corridor_mesh(), 256);
        let filter = QueryFilter::default();
        let start_ref = query.mesh().poly_ref_at(2, 0);

        let hit = query
            .raycast(start_ref, Vec3::new(2.5, 0.0, 0.5), Vec3::new(2.5, 0.0, 2.5), &filter)
            .expect("valid start");
        assert!((hit.t - 0.25).abs() < 1e-5);
        assert_eq!(hit.hit_normal, Vec3::NEG_Z);
        assert_eq!(hit.path, vec![start_ref]);

        let clear = query
            .raycast(start_ref, Vec3::new(2.5, 0.0, 0.5), Vec3::new(8.5, 0.0, 0.5), &filter)
            .expect("valid start");
        assert!(clear.reached_end());
        assert_eq!(clear.path.len(), 7);
    }

    #[test]
    fn test_move_along_surface_slides_on_wall() {
        let query = GridNavQuery::new(corridor_mesh(), 256);
        let filter = QueryFilter::default();
        let start_ref = query.mesh().poly_ref_at(2, 0);

        let (pos, visited) = query
            .move_along_surface(
                start_ref,
                Vec3::new(2.5, 0.0, 0.5),
                Vec3::new(3.5, 0.0, 1.5),
                &filter,
                16,
            )
            .expect("valid start");
        assert!((pos.z - 1.0).abs() < 1e-5);
        assert!((pos.x - 3.5).abs() < 1e-5);
        assert_eq!(visited.first(), Some(&start_ref));
        assert_eq!(visited.last(), Some(&query.mesh().poly_ref_at(3, 0)));
    }

    #[test]
    fn test_sliced_find_path_around_wall() {
        let mut query = GridNavQuery::new(corridor_mesh(), 256);
        let filter = QueryFilter::default();
        let mesh = Arc::clone(&query.mesh);
        let start = mesh.poly_ref_at(4, 0);
        let end = mesh.poly_ref_at(4, 2);

        let status = query.init_sliced_find_path(
            start,
            end,
            mesh.cell_center(4, 0),
            mesh.cell_center(4, 2),
            &filter,
        );
        assert_eq!(status, Status::InProgress);

        let mut total = 0;
        loop {
            let (iters, status) = query.update_sliced_find_path(2);
            assert!(iters <= 2);
            total += iters;
            if !status.is_in_progress() {
                assert_eq!(status, Status::Success);
                break;
            }
            assert!(total < 100, "search must converge");
        }

        let (status, path) = query.finalize_sliced_find_path(256);
        assert_eq!(status, Status::Success);
        assert_eq!(path.first(), Some(&start));
        assert_eq!(path.last(), Some(&end));
        // Around the wall through the shorter west side
        assert_eq!(path.len(), 11);
    }

    #[test]
    fn test_unreachable_goal_gives_partial_path() {
        let mesh = Arc::new(
            GridNavMesh::from_ascii(Vec3::ZERO, 1.0, &["...#..", "...#.."]).expect("valid grid"),
        );
        let mut query = GridNavQuery::new(Arc::clone(&mesh), 256);
        let filter = QueryFilter::default();

        let (status, path) = query.find_path(
            mesh.poly_ref_at(0, 0),
            mesh.poly_ref_at(5, 0),
            mesh.cell_center(0, 0),
            mesh.cell_center(5, 0),
            &filter,
            64,
        );
        assert_eq!(status, Status::PartialResult);
        // Ends next to the wall, as close to the goal as the search got
        let last = path.last().copied().unwrap_or_default();
        assert!(last == mesh.poly_ref_at(2, 0) || last == mesh.poly_ref_at(2, 1));
        assert_eq!(path.first(), Some(&mesh.poly_ref_at(0, 0)));
    }

    #[test]
    fn test_off_mesh_connection() {
        let mut grid =
            GridNavMesh::from_ascii(Vec3::ZERO, 1.0, &["...#...", "...#..."]).expect("valid grid");
        let con = grid
            .add_off_mesh_connection(
                Vec3::new(2.5, 0.0, 0.5),
                Vec3::new(4.5, 0.0, 0.5),
                0.5,
                false,
            )
            .expect("both ends walkable");
        let mesh = Arc::new(grid);
        let mut query = GridNavQuery::new(Arc::clone(&mesh), 256);
        let filter = QueryFilter::default();

        assert_eq!(query.poly_type(con).ok(), Some(PolyType::OffMeshConnection));

        let (status, path) = query.find_path(
            mesh.poly_ref_at(0, 0),
            mesh.poly_ref_at(6, 0),
            mesh.cell_center(0, 0),
            mesh.cell_center(6, 0),
            &filter,
            64,
        );
        assert_eq!(status, Status::Success);
        assert!(path.contains(&con));

        let (start, end) = query
            .get_off_mesh_connection_end_points(mesh.poly_ref_at(2, 0), con)
            .expect("connection");
        assert_eq!(start, Vec3::new(2.5, 0.0, 0.5));
        assert_eq!(end, Vec3::new(4.5, 0.0, 0.5));
    }

    #[test]
    fn test_wall_segments_respect_filter() {
        let grid = GridNavMesh::from_ascii(Vec3::ZERO, 1.0, &[".D."]).expect("valid grid");
        let mesh = Arc::new(grid);
        let query = GridNavQuery::new(Arc::clone(&mesh), 64);

        let open = QueryFilter::default();
        let walls = query
            .get_poly_wall_segments(mesh.poly_ref_at(0, 0), &open)
            .expect("valid poly");
        assert_eq!(walls.len(), 3);

        let closed = QueryFilter::new(PolyFlags::all(), PolyFlags::DOOR);
        let walls = query
            .get_poly_wall_segments(mesh.poly_ref_at(0, 0), &closed)
            .expect("valid poly");
        assert_eq!(walls.len(), 4);
        assert!(!query.is_valid_poly_ref(mesh.poly_ref_at(1, 0), &closed));
    }
}
