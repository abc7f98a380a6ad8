//! Crowd agent data and per-agent steering helpers

use bitflags::bitflags;
use glam::Vec3;
use navcrowd_common::{dist_2d, dist_sqr_2d, Error, Result};
use navcrowd_query::PolyRef;

use crate::{Corner, LocalBoundary, PathCorridor, PathQueueRef, StraightPathFlags, PATHQ_INVALID};

/// The maximum number of neighbors that a crowd agent can take into account
/// for steering decisions.
pub const CROWDAGENT_MAX_NEIGHBOURS: usize = 6;

/// The maximum number of corners a crowd agent will look ahead in the path.
/// Due to the behavior of the crowd manager, the actual number of useful
/// corners will be one less than this number.
pub const CROWDAGENT_MAX_CORNERS: usize = 4;

/// Default radius of an agent
const DEFAULT_AGENT_RADIUS: f32 = 0.6;

/// Default height of an agent
const DEFAULT_AGENT_HEIGHT: f32 = 2.0;

/// Default max acceleration of an agent
const DEFAULT_AGENT_MAX_ACCELERATION: f32 = 8.0;

/// Default max speed of an agent
const DEFAULT_AGENT_MAX_SPEED: f32 = 3.5;

bitflags! {
    /// Crowd behaviors applied to an agent
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
    pub struct UpdateFlags: u8 {
        /// Smooth the path toward the second corner
        const ANTICIPATE_TURNS = 1;
        /// Pick velocities with obstacle avoidance
        const OBSTACLE_AVOIDANCE = 2;
        /// Keep a distance from neighbours
        const SEPARATION = 4;
        /// Shortcut the corridor along visible corners
        const OPTIMIZE_VIS = 8;
        /// Periodically replan the start of the corridor
        const OPTIMIZE_TOPO = 16;
    }
}

impl Default for UpdateFlags {
    fn default() -> Self {
        UpdateFlags::ANTICIPATE_TURNS | UpdateFlags::OBSTACLE_AVOIDANCE | UpdateFlags::SEPARATION
    }
}

/// The type of navigation mesh polygon the agent is currently traversing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrowdAgentState {
    /// The agent is not in a valid state.
    #[default]
    Invalid,
    /// The agent is traversing a normal navigation mesh polygon.
    Walking,
    /// The agent is traversing an off-mesh connection.
    OffMesh,
}

/// State of an agent's move request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MoveRequestState {
    #[default]
    None,
    Failed,
    Valid,
    Requesting,
    WaitingForQueue,
    WaitingForPath,
    Velocity,
}

/// Agent parameters for crowd
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct AgentParams {
    /// Radius of the agent
    pub radius: f32,
    /// Height of the agent
    pub height: f32,
    /// Maximum acceleration of the agent
    pub max_acceleration: f32,
    /// Maximum speed of the agent
    pub max_speed: f32,
    /// Range within which neighbours and walls are considered for steering
    pub collision_query_range: f32,
    /// Range of the visibility shortcut
    pub path_optimization_range: f32,
    /// How strongly the agent keeps away from neighbours
    pub separation_weight: f32,
    /// Update flags for the agent
    pub update_flags: UpdateFlags,
    /// Index of the obstacle avoidance parameter set
    pub obstacle_avoidance_type: u8,
    /// Index of the query filter
    pub query_filter_type: u8,
    /// User data for the agent
    pub user_data: Option<usize>,
}

impl Default for AgentParams {
    fn default() -> Self {
        Self {
            radius: DEFAULT_AGENT_RADIUS,
            height: DEFAULT_AGENT_HEIGHT,
            max_acceleration: DEFAULT_AGENT_MAX_ACCELERATION,
            max_speed: DEFAULT_AGENT_MAX_SPEED,
            collision_query_range: 12.0,
            path_optimization_range: 30.0,
            separation_weight: 2.0,
            update_flags: UpdateFlags::default(),
            obstacle_avoidance_type: 0,
            query_filter_type: 0,
            user_data: None,
        }
    }
}

impl AgentParams {
    /// Validates the agent parameters
    pub fn validate(&self) -> Result<()> {
        if self.radius.is_nan() || self.radius <= 0.0 {
            return Err(Error::InvalidParam("Invalid agent radius".to_string()));
        }

        if self.height.is_nan() || self.height <= 0.0 {
            return Err(Error::InvalidParam("Invalid agent height".to_string()));
        }

        if self.max_speed.is_nan() || self.max_speed <= 0.0 {
            return Err(Error::InvalidParam("Invalid agent max speed".to_string()));
        }

        if self.max_acceleration.is_nan() || self.max_acceleration < 0.0 {
            return Err(Error::InvalidParam("Invalid agent max acceleration".to_string()));
        }

        if self.collision_query_range.is_nan() || self.collision_query_range <= 0.0 {
            return Err(Error::InvalidParam("Invalid agent collision query range".to_string()));
        }

        Ok(())
    }
}

/// A neighbour of an agent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrowdNeighbour {
    /// Index of the neighbour in the crowd
    pub idx: usize,
    /// Squared 2D distance to the neighbour
    pub dist: f32,
}

/// Progress of an off-mesh connection traversal
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CrowdAgentAnimation {
    pub active: bool,
    /// Position when the traversal started
    pub init_pos: Vec3,
    pub start_pos: Vec3,
    pub end_pos: Vec3,
    /// The off-mesh connection being traversed
    pub poly_ref: PolyRef,
    pub t: f32,
    pub tmax: f32,
}

/// Agent in the crowd
#[derive(Debug, Clone)]
pub struct CrowdAgent {
    pub(crate) active: bool,
    pub(crate) state: CrowdAgentState,
    /// The path does not lead all the way to the target
    pub(crate) partial: bool,
    pub(crate) corridor: PathCorridor,
    pub(crate) boundary: LocalBoundary,
    /// Time since the last topology optimization
    pub(crate) topology_opt_time: f32,
    pub(crate) neis: Vec<CrowdNeighbour>,
    pub(crate) desired_speed: f32,

    /// Current position
    pub(crate) npos: Vec3,
    /// Displacement accumulated by collision resolution
    pub(crate) disp: Vec3,
    /// Desired velocity from steering
    pub(crate) dvel: Vec3,
    /// Velocity picked by obstacle avoidance
    pub(crate) nvel: Vec3,
    /// Actual velocity after acceleration limits
    pub(crate) vel: Vec3,

    pub(crate) params: AgentParams,
    pub(crate) corners: Vec<Corner>,

    pub(crate) target_state: MoveRequestState,
    pub(crate) target_ref: PolyRef,
    /// Target position, or the requested velocity in velocity mode
    pub(crate) target_pos: Vec3,
    pub(crate) target_path_queue_ref: PathQueueRef,
    pub(crate) target_replan: bool,
    /// Time since the target was last planned
    pub(crate) target_replan_time: f32,

    pub(crate) anim: CrowdAgentAnimation,
}

impl CrowdAgent {
    pub(crate) fn new(max_path: usize) -> Self {
        let mut corridor = PathCorridor::new();
        corridor.init(max_path);
        Self {
            active: false,
            state: CrowdAgentState::Invalid,
            partial: false,
            corridor,
            boundary: LocalBoundary::new(),
            topology_opt_time: 0.0,
            neis: Vec::with_capacity(CROWDAGENT_MAX_NEIGHBOURS),
            desired_speed: 0.0,
            npos: Vec3::ZERO,
            disp: Vec3::ZERO,
            dvel: Vec3::ZERO,
            nvel: Vec3::ZERO,
            vel: Vec3::ZERO,
            params: AgentParams::default(),
            corners: Vec::with_capacity(CROWDAGENT_MAX_CORNERS),
            target_state: MoveRequestState::None,
            target_ref: PolyRef::NULL,
            target_pos: Vec3::ZERO,
            target_path_queue_ref: PATHQ_INVALID,
            target_replan: false,
            target_replan_time: 0.0,
            anim: CrowdAgentAnimation::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn get_state(&self) -> CrowdAgentState {
        self.state
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }

    pub fn get_params(&self) -> &AgentParams {
        &self.params
    }

    /// Gets the agent's position
    pub fn get_pos(&self) -> Vec3 {
        self.npos
    }

    /// Gets the agent's velocity
    pub fn get_vel(&self) -> Vec3 {
        self.vel
    }

    /// Gets the velocity requested by steering
    pub fn get_desired_vel(&self) -> Vec3 {
        self.dvel
    }

    /// Gets the velocity chosen by obstacle avoidance
    pub fn get_new_vel(&self) -> Vec3 {
        self.nvel
    }

    pub fn get_displacement(&self) -> Vec3 {
        self.disp
    }

    pub fn get_desired_speed(&self) -> f32 {
        self.desired_speed
    }

    pub fn get_corridor(&self) -> &PathCorridor {
        &self.corridor
    }

    pub fn get_boundary(&self) -> &LocalBoundary {
        &self.boundary
    }

    pub fn get_neighbours(&self) -> &[CrowdNeighbour] {
        &self.neis
    }

    pub fn get_corners(&self) -> &[Corner] {
        &self.corners
    }

    pub fn get_target_state(&self) -> MoveRequestState {
        self.target_state
    }

    pub fn get_target_ref(&self) -> PolyRef {
        self.target_ref
    }

    pub fn get_target_pos(&self) -> Vec3 {
        self.target_pos
    }

    pub fn get_target_replan_time(&self) -> f32 {
        self.target_replan_time
    }

    pub fn get_topology_opt_time(&self) -> f32 {
        self.topology_opt_time
    }

    pub fn get_animation(&self) -> &CrowdAgentAnimation {
        &self.anim
    }

    /// Applies the acceleration limited change toward `nvel` and moves
    pub(crate) fn integrate(&mut self, dt: f32) {
        // Fake dynamic constraint
        let max_delta = self.params.max_acceleration * dt;
        let mut dv = self.nvel - self.vel;
        let ds = dv.length();
        if ds > max_delta {
            dv *= max_delta / ds;
        }
        self.vel += dv;

        // Integrate
        if self.vel.length() > 0.0001 {
            self.npos += self.vel * dt;
        } else {
            self.vel = Vec3::ZERO;
        }
    }

    /// Checks whether the agent is about to enter an off-mesh connection
    pub(crate) fn over_offmesh_connection(&self, radius: f32) -> bool {
        let Some(last) = self.corners.last() else {
            return false;
        };

        last.flags.contains(StraightPathFlags::OFFMESH_CONNECTION)
            && dist_sqr_2d(self.npos, last.pos) < radius * radius
    }

    /// Distance to the end of the path, capped at `range`
    pub(crate) fn get_distance_to_goal(&self, range: f32) -> f32 {
        match self.corners.last() {
            Some(last) if last.flags.contains(StraightPathFlags::END) => {
                dist_2d(self.npos, last.pos).min(range)
            }
            _ => range,
        }
    }

    /// Direction toward the first corner, bent toward the second one
    pub(crate) fn calc_smooth_steer_direction(&self) -> Vec3 {
        let Some(first) = self.corners.first() else {
            return Vec3::ZERO;
        };
        let second = self.corners.get(1).unwrap_or(first);

        let mut dir0 = first.pos - self.npos;
        let mut dir1 = second.pos - self.npos;
        dir0.y = 0.0;
        dir1.y = 0.0;

        let len0 = dir0.length();
        let len1 = dir1.length();
        if len1 > 0.001 {
            dir1 *= 1.0 / len1;
        }

        Vec3::new(
            dir0.x - dir1.x * len0 * 0.5,
            0.0,
            dir0.z - dir1.z * len0 * 0.5,
        )
        .normalize_or_zero()
    }

    /// Direction toward the first corner
    pub(crate) fn calc_straight_steer_direction(&self) -> Vec3 {
        let Some(first) = self.corners.first() else {
            return Vec3::ZERO;
        };

        let mut dir = first.pos - self.npos;
        dir.y = 0.0;
        dir.normalize_or_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corner(x: f32, z: f32, flags: StraightPathFlags) -> Corner {
        Corner {
            pos: Vec3::new(x, 0.0, z),
            flags,
            poly: PolyRef::new(1),
        }
    }

    #[test]
    fn test_integrate_limits_acceleration() {
        let mut agent = CrowdAgent::new(16);
        agent.params.max_acceleration = 2.0;
        agent.nvel = Vec3::new(10.0, 0.0, 0.0);

        agent.integrate(0.5);
        assert!((agent.vel.x - 1.0).abs() < 1e-5);
        assert!((agent.npos.x - 0.5).abs() < 1e-5);

        // Tiny velocities are snapped to rest
        let mut idle = CrowdAgent::new(16);
        idle.nvel = Vec3::new(0.00001, 0.0, 0.0);
        idle.integrate(0.1);
        assert_eq!(idle.vel, Vec3::ZERO);
        assert_eq!(idle.npos, Vec3::ZERO);
    }

    #[test]
    fn test_distance_to_goal() {
        let mut agent = CrowdAgent::new(16);
        assert_eq!(agent.get_distance_to_goal(5.0), 5.0);

        agent.corners.push(corner(3.0, 4.0, StraightPathFlags::END));
        assert!((agent.get_distance_to_goal(10.0) - 5.0).abs() < 1e-5);
        assert_eq!(agent.get_distance_to_goal(2.0), 2.0);

        agent.corners[0].flags = StraightPathFlags::empty();
        assert_eq!(agent.get_distance_to_goal(10.0), 10.0);
    }

    #[test]
    fn test_over_offmesh_connection() {
        let mut agent = CrowdAgent::new(16);
        agent
            .corners
            .push(corner(1.0, 0.0, StraightPathFlags::OFFMESH_CONNECTION));
        assert!(agent.over_offmesh_connection(1.5));
        assert!(!agent.over_offmesh_connection(0.5));

        agent.corners[0].flags = StraightPathFlags::empty();
        assert!(!agent.over_offmesh_connection(1.5));
    }

    #[test]
    fn test_steer_directions() {
        let mut agent = CrowdAgent::new(16);
        assert_eq!(agent.calc_straight_steer_direction(), Vec3::ZERO);

        agent.corners.push(corner(2.0, 0.0, StraightPathFlags::empty()));
        agent.corners.push(corner(2.0, 2.0, StraightPathFlags::END));

        let straight = agent.calc_straight_steer_direction();
        assert!((straight - Vec3::X).length() < 1e-5);

        // Anticipating the turn bends away from the second corner's direction
        let smooth = agent.calc_smooth_steer_direction();
        assert!((smooth.length() - 1.0).abs() < 1e-5);
        assert!(smooth.x > 0.0);
        assert!(smooth.z < 0.0);
    }

    #[test]
    fn test_agent_params_validation() {
        assert!(AgentParams::default().validate().is_ok());

        let zero_speed = AgentParams {
            max_speed: 0.0,
            ..Default::default()
        };
        assert!(matches!(zero_speed.validate(), Err(Error::InvalidParam(_))));

        let zero_radius = AgentParams {
            radius: 0.0,
            ..Default::default()
        };
        assert!(matches!(zero_radius.validate(), Err(Error::InvalidParam(_))));

        let nan_range = AgentParams {
            collision_query_range: f32::NAN,
            ..Default::default()
        };
        assert!(nan_range.validate().is_err());

        // Agents may stand still
        let no_acceleration = AgentParams {
            max_acceleration: 0.0,
            ..Default::default()
        };
        assert!(no_acceleration.validate().is_ok());
    }
}
