//! Common utilities shared by the navcrowd crates
//!
//! Provides the error type, the status codes returned by navigation queries
//! and the 2D geometry helpers used by the crowd simulation. All 2D helpers
//! operate on the XZ plane (Y-up coordinate system).

mod geometry;
mod status;

pub use geometry::*;
pub use status::*;

/// Represents a 3D position or velocity
pub type Vec3 = glam::Vec3;

/// Error types for the library
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("navigation query failed: {0}")]
    Query(#[from] Status),

    #[error("pathfinding failed: {0}")]
    Pathfinding(String),

    #[error("crowd invariant violated: {0}")]
    InvariantViolation(String),
}

/// Result type for navcrowd operations
pub type Result<T> = std::result::Result<T, Error>;
