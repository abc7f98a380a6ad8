//! Multi-agent crowd simulation on navigation meshes
//!
//! This crate moves many agents over a shared navigation mesh. Each agent
//! follows a path corridor toward its move target, steers around the corners
//! of that corridor, avoids its neighbours and nearby walls by sampling
//! velocities, and is pushed apart from overlapping agents.
//!
//! # Features
//!
//! - **Agent Management**: Fixed pool of agents with reusable slots
//! - **Asynchronous Path Planning**: Long searches run through a budgeted path queue
//! - **Path Following**: Path corridors with visibility and topology shortcuts
//! - **Obstacle Avoidance**: Grid and adaptive velocity sampling
//! - **Proximity Queries**: Spatial hash grid for neighbour lookups
//! - **Off-Mesh Connections**: Animated traversal of mesh links
//!
//! # Example
//!
//! ```rust,ignore
//! use navcrowd::{AgentParams, Crowd};
//! use navcrowd_query::{GridNavMesh, GridNavQuery};
//!
//! let mesh = Arc::new(GridNavMesh::new(Vec3::ZERO, 1.0, 32, 32)?);
//! let mut crowd = Crowd::new(64, 0.6, GridNavQuery::new(mesh.clone(), 2048))?;
//!
//! // Add an agent
//! let agent = crowd
//!     .add_agent(Vec3::new(1.5, 0.0, 1.5), AgentParams::default())?
//!     .expect("crowd has room");
//!
//! // Set agent target
//! crowd.request_move_target(agent, mesh.poly_ref_at(20, 20), Vec3::new(20.5, 0.0, 20.5));
//!
//! // Update simulation
//! crowd.update(delta_time, None)?;
//! ```
//!
//! # Architecture
//!
//! The crowd system consists of several components:
//!
//! - [`Crowd`]: Main simulation manager
//! - [`PathCorridor`]: Manages agent path state
//! - [`PathQueue`]: Budgeted asynchronous path searches
//! - [`LocalBoundary`]: Wall segments around an agent
//! - [`ObstacleAvoidanceQuery`]: Velocity sampling obstacle avoidance
//! - [`ProximityGrid`]: Spatial indexing for neighbor queries

mod config;
mod crowd;
mod crowd_agent;
mod debug;
mod local_boundary;
mod obstacle_avoidance;
mod path_corridor;
mod path_queue;
mod proximity_grid;

pub use config::*;
pub use crowd::*;
pub use crowd_agent::*;
pub use debug::*;
pub use local_boundary::*;
pub use obstacle_avoidance::*;
pub use path_corridor::*;
pub use path_queue::*;
pub use proximity_grid::*;

#[cfg(test)]
mod test_query;
