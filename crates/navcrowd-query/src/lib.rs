//! Navigation mesh query interface for the navcrowd crowd simulation
//!
//! The crowd never owns navigation geometry. Everything it needs to know about
//! the walkable surface goes through the [`NavMeshQuery`] trait: nearest
//! polygon lookups, portals between polygons, raycasts, surface-constrained
//! moves, wall segments and a time-sliced path search.
//!
//! # Features
//!
//! - Polygon references, polygon flags and per-area traversal costs
//! - The [`NavMeshQuery`] trait implemented by navigation backends
//! - [`GridNavMesh`]: a tile grid of square polygons with off-mesh
//!   connections, useful for tests and prototyping
//! - [`GridNavQuery`]: a query object over a shared grid mesh with an
//!   incremental A* search
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use navcrowd_query::{GridNavMesh, GridNavQuery, NavMeshQuery, QueryFilter};
//! use glam::Vec3;
//!
//! let mesh = GridNavMesh::from_ascii(Vec3::ZERO, 1.0, &[
//!     "..........",
//!     "....##....",
//!     "..........",
//! ])?;
//! let query = GridNavQuery::new(Arc::new(mesh), 2048);
//! let filter = QueryFilter::default();
//! let nearest = query.find_nearest_poly(Vec3::new(0.5, 0.0, 0.5), Vec3::splat(1.0), &filter);
//! ```

mod grid_mesh;
mod nav_query;
mod poly_ref;
mod query_filter;
mod sliced_search;

pub use grid_mesh::*;
pub use nav_query::*;
pub use poly_ref::*;
pub use query_filter::*;
