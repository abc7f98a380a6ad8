//! Proximity grid for neighbour queries in crowd simulation
//!
//! Agents are registered once per tick by their bounding rectangle on the XZ
//! plane. Queries return every item whose rectangle shares a grid cell with
//! the query rectangle; callers refine by exact distance afterwards.

use std::collections::HashMap;

/// Grid cell coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct GridCoord {
    x: i32,
    z: i32,
}

impl GridCoord {
    fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }
}

/// Items registered in one cell, in insertion order
#[derive(Debug, Clone, Default)]
struct GridCell {
    items: Vec<usize>,
}

/// Sparse uniform grid mapping cells to item ids
#[derive(Debug)]
pub struct ProximityGrid {
    /// Grid cells indexed by coordinates
    cells: HashMap<GridCoord, GridCell>,
    /// Cell size in world units
    cell_size: f32,
    inv_cell_size: f32,
    /// Maximum number of cell entries across the whole grid
    max_items: usize,
    /// Current number of cell entries
    item_count: usize,
    /// Bounds of the occupied cells
    bounds: Option<(GridCoord, GridCoord)>,
}

impl ProximityGrid {
    /// Creates a new proximity grid holding at most `max_items` cell entries
    pub fn new(max_items: usize, cell_size: f32) -> Self {
        // Minimum cell size to avoid division by zero
        let cell_size = cell_size.max(0.01);
        Self {
            cells: HashMap::new(),
            cell_size,
            inv_cell_size: 1.0 / cell_size,
            max_items,
            item_count: 0,
            bounds: None,
        }
    }

    /// Removes all items
    pub fn clear(&mut self) {
        self.cells.clear();
        self.item_count = 0;
        self.bounds = None;
    }

    fn coord(&self, x: f32, z: f32) -> GridCoord {
        GridCoord::new(
            (x * self.inv_cell_size).floor() as i32,
            (z * self.inv_cell_size).floor() as i32,
        )
    }

    /// Registers an item in every cell overlapped by the rectangle
    ///
    /// Returns false when the entry pool ran out before all cells were filled.
    pub fn add_item(&mut self, id: usize, min_x: f32, min_z: f32, max_x: f32, max_z: f32) -> bool {
        let lo = self.coord(min_x, min_z);
        let hi = self.coord(max_x, max_z);

        for z in lo.z..=hi.z {
            for x in lo.x..=hi.x {
                if self.item_count >= self.max_items {
                    return false;
                }
                let coord = GridCoord::new(x, z);
                self.cells.entry(coord).or_default().items.push(id);
                self.item_count += 1;

                self.bounds = Some(match self.bounds {
                    None => (coord, coord),
                    Some((min, max)) => (
                        GridCoord::new(min.x.min(x), min.z.min(z)),
                        GridCoord::new(max.x.max(x), max.z.max(z)),
                    ),
                });
            }
        }

        true
    }

    /// Collects the distinct items overlapping the rectangle, at most `max_items`
    pub fn query_items(
        &self,
        min_x: f32,
        min_z: f32,
        max_x: f32,
        max_z: f32,
        max_items: usize,
    ) -> Vec<usize> {
        let lo = self.coord(min_x, min_z);
        let hi = self.coord(max_x, max_z);
        let mut result = Vec::new();

        for z in lo.z..=hi.z {
            for x in lo.x..=hi.x {
                let Some(cell) = self.cells.get(&GridCoord::new(x, z)) else {
                    continue;
                };
                for &id in &cell.items {
                    if result.contains(&id) {
                        continue;
                    }
                    if result.len() >= max_items {
                        return result;
                    }
                    result.push(id);
                }
            }
        }

        result
    }

    /// Number of items registered in the cell containing the point
    pub fn get_item_count_at(&self, x: f32, z: f32) -> usize {
        self.cells
            .get(&self.coord(x, z))
            .map_or(0, |cell| cell.items.len())
    }

    /// Occupied cell bounds as `(min_x, min_z, max_x, max_z)` cell coordinates
    pub fn get_bounds(&self) -> Option<(i32, i32, i32, i32)> {
        self.bounds.map(|(min, max)| (min.x, min.z, max.x, max.z))
    }

    /// Cell size in world units
    pub fn get_cell_size(&self) -> f32 {
        self.cell_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_query() {
        let mut grid = ProximityGrid::new(64, 2.0);
        assert!(grid.add_item(0, -0.5, -0.5, 0.5, 0.5));
        assert!(grid.add_item(1, 10.0, 10.0, 11.0, 11.0));

        let near = grid.query_items(-1.0, -1.0, 1.0, 1.0, 8);
        assert_eq!(near, vec![0]);

        let all = grid.query_items(-5.0, -5.0, 15.0, 15.0, 8);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_query_deduplicates_items_spanning_cells() {
        let mut grid = ProximityGrid::new(64, 1.0);
        // Spans four cells
        grid.add_item(7, -0.5, -0.5, 0.5, 0.5);
        assert_eq!(grid.get_item_count_at(-0.25, -0.25), 1);
        assert_eq!(grid.get_item_count_at(0.25, 0.25), 1);

        let found = grid.query_items(-1.0, -1.0, 1.0, 1.0, 8);
        assert_eq!(found, vec![7]);
    }

    #[test]
    fn test_query_respects_max_items() {
        let mut grid = ProximityGrid::new(64, 4.0);
        for id in 0..5 {
            grid.add_item(id, 0.0, 0.0, 1.0, 1.0);
        }
        assert_eq!(grid.query_items(0.0, 0.0, 1.0, 1.0, 3), vec![0, 1, 2]);
    }

    #[test]
    fn test_clear_and_bounds() {
        let mut grid = ProximityGrid::new(64, 1.0);
        grid.add_item(0, -2.5, 0.5, -2.0, 3.5);
        assert_eq!(grid.get_bounds(), Some((-3, 0, -2, 3)));

        grid.clear();
        assert_eq!(grid.get_bounds(), None);
        assert!(grid.query_items(-5.0, -5.0, 5.0, 5.0, 8).is_empty());
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut grid = ProximityGrid::new(2, 1.0);
        // Needs four entries
        assert!(!grid.add_item(0, 0.5, 0.5, 1.5, 1.5));
        assert!(!grid.add_item(1, 0.5, 0.5, 0.6, 0.6));
        assert_eq!(grid.query_items(0.0, 0.0, 2.0, 2.0, 8), vec![0]);
    }
}
