//! Crowd management
//!
//! This module contains the crowd manager, which moves many agents over a
//! shared navigation mesh. Every call to [`Crowd::update`] runs the whole
//! pipeline for one tick: path validation, path requests, corridor
//! optimization, neighbour gathering, steering, obstacle avoidance,
//! integration, collision resolution and off-mesh connection animation.

use glam::Vec3;
use log::{debug, trace, warn};
use navcrowd_common::{dist_2d, dist_sqr_2d, tri_area_2d, tween, Error, Result};
use navcrowd_query::{NavMeshQuery, PolyRef, QueryFilter};

use crate::{
    AgentParams, CrowdAgent, CrowdAgentState, CrowdConfig, CrowdDebugSink, CrowdNeighbour,
    MoveRequestState, ObstacleAvoidanceParams, ObstacleAvoidanceQuery, PathQueue, ProximityGrid,
    SamplingMode, UpdateFlags, CROWDAGENT_MAX_CORNERS, CROWDAGENT_MAX_NEIGHBOURS, PATHQ_INVALID,
};

/// The maximum number of crowd avoidance configurations supported by the
/// crowd manager.
pub const CROWD_MAX_OBSTAVOIDANCE_PARAMS: usize = 8;

/// The maximum number of query filter types supported by the crowd manager.
pub const CROWD_MAX_QUERY_FILTER_TYPE: usize = 16;

/// Maximum agents returned by one proximity grid query
const MAX_NEIS: usize = 32;

/// Maximum polygons of the path found by the quick search of a move request
const MAX_QUICK_PATH: usize = 32;

fn filter_index(params: &AgentParams) -> usize {
    (params.query_filter_type as usize).min(CROWD_MAX_QUERY_FILTER_TYPE - 1)
}

fn avoidance_index(params: &AgentParams) -> usize {
    (params.obstacle_avoidance_type as usize).min(CROWD_MAX_OBSTAVOIDANCE_PARAMS - 1)
}

/// Crowd manager
///
/// Owns a fixed pool of agents. The navigation query is cloned for the path
/// queue so that queued searches and the crowd's own quick searches keep
/// independent search state.
pub struct Crowd<Q: NavMeshQuery + Clone> {
    config: CrowdConfig,
    agents: Vec<CrowdAgent>,
    path_queue: PathQueue<Q>,
    obstacle_query_params: [ObstacleAvoidanceParams; CROWD_MAX_OBSTAVOIDANCE_PARAMS],
    obstacle_query: ObstacleAvoidanceQuery,
    grid: ProximityGrid,
    /// Search extents used to place agents and targets on the mesh
    ext: Vec3,
    filters: [QueryFilter; CROWD_MAX_QUERY_FILTER_TYPE],
    velocity_sample_count: usize,
    navquery: Q,
}

impl<Q: NavMeshQuery + Clone> Crowd<Q> {
    /// Creates a crowd for `max_agents` agents no larger than `max_agent_radius`
    pub fn new(max_agents: usize, max_agent_radius: f32, navquery: Q) -> Result<Self> {
        Self::with_config(CrowdConfig::new(max_agents, max_agent_radius), navquery)
    }

    /// Creates a crowd with explicit tuning
    pub fn with_config(config: CrowdConfig, navquery: Q) -> Result<Self> {
        config.validate()?;

        let r = config.max_agent_radius;
        let path_queue = PathQueue::new(
            navquery.clone(),
            config.path_queue_size,
            config.max_path_result,
            config.max_iters_per_request,
        );

        Ok(Self {
            agents: (0..config.max_agents)
                .map(|_| CrowdAgent::new(config.max_path_result))
                .collect(),
            path_queue,
            obstacle_query_params: [ObstacleAvoidanceParams::default(); CROWD_MAX_OBSTAVOIDANCE_PARAMS],
            obstacle_query: ObstacleAvoidanceQuery::new(
                config.max_obstacle_circles,
                config.max_obstacle_segments,
            ),
            grid: ProximityGrid::new(config.max_agents * 4, r * 3.0),
            ext: Vec3::new(r * 2.0, r * 1.5, r * 2.0),
            filters: std::array::from_fn(|_| QueryFilter::default()),
            velocity_sample_count: 0,
            navquery,
            config,
        })
    }

    pub fn get_config(&self) -> &CrowdConfig {
        &self.config
    }

    /// Sets the shared avoidance configuration for the specified index
    pub fn set_obstacle_avoidance_params(&mut self, idx: usize, params: ObstacleAvoidanceParams) {
        if let Some(slot) = self.obstacle_query_params.get_mut(idx) {
            *slot = params;
        }
    }

    /// Gets the shared avoidance configuration for the specified index
    pub fn get_obstacle_avoidance_params(&self, idx: usize) -> Option<&ObstacleAvoidanceParams> {
        self.obstacle_query_params.get(idx)
    }

    /// Gets the filter used by agents with the given query filter type
    pub fn get_filter(&self, idx: usize) -> Option<&QueryFilter> {
        self.filters.get(idx)
    }

    pub fn get_editable_filter(&mut self, idx: usize) -> Option<&mut QueryFilter> {
        self.filters.get_mut(idx)
    }

    /// Gets the agent in slot `idx`, active or not
    pub fn get_agent(&self, idx: usize) -> Option<&CrowdAgent> {
        self.agents.get(idx)
    }

    /// Number of agent slots
    pub fn get_agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Indices of the active agents in ascending order
    pub fn get_active_agents(&self) -> Vec<usize> {
        self.agents
            .iter()
            .enumerate()
            .filter(|(_, ag)| ag.active)
            .map(|(i, _)| i)
            .collect()
    }

    /// Search extents used to find the polygon under an agent or target
    pub fn get_query_extents(&self) -> Vec3 {
        self.ext
    }

    /// Velocity samples evaluated during the last update
    pub fn get_velocity_sample_count(&self) -> usize {
        self.velocity_sample_count
    }

    pub fn get_grid(&self) -> &ProximityGrid {
        &self.grid
    }

    pub fn get_path_queue(&self) -> &PathQueue<Q> {
        &self.path_queue
    }

    pub fn get_nav_query(&self) -> &Q {
        &self.navquery
    }

    fn check_agent_params(&self, params: &AgentParams) -> Result<()> {
        params.validate()?;

        // Larger agents would overflow the proximity grid cells
        if params.radius > self.config.max_agent_radius {
            return Err(Error::InvalidParam(format!(
                "Agent radius {} exceeds the crowd's max agent radius {}",
                params.radius, self.config.max_agent_radius
            )));
        }

        Ok(())
    }

    /// Updates the parameters of an agent
    pub fn update_agent_parameters(&mut self, idx: usize, params: AgentParams) -> Result<()> {
        self.check_agent_params(&params)?;
        if let Some(ag) = self.agents.get_mut(idx) {
            ag.params = params;
        }
        Ok(())
    }

    /// Adds an agent at the point on the mesh nearest to `pos`
    ///
    /// Returns `Ok(None)` when every slot is taken and an error when the
    /// parameters are invalid. An agent placed where no polygon can be found
    /// is added in the invalid state.
    pub fn add_agent(&mut self, pos: Vec3, params: AgentParams) -> Result<Option<usize>> {
        self.check_agent_params(&params)?;

        // Find empty slot
        let Some(idx) = self.agents.iter().position(|ag| !ag.active) else {
            debug!("Crowd is full, cannot add agent");
            return Ok(None);
        };

        let filter = &self.filters[filter_index(&params)];

        // Find nearest position on navmesh and place the agent there
        let (poly, nearest) = self
            .navquery
            .find_nearest_poly(pos, self.ext, filter)
            .unwrap_or((PolyRef::NULL, pos));

        let ag = &mut self.agents[idx];
        ag.params = params;
        ag.corridor.reset(poly, nearest);
        ag.boundary.reset();
        ag.partial = false;

        ag.topology_opt_time = 0.0;
        ag.target_replan_time = 0.0;
        ag.neis.clear();
        ag.corners.clear();

        ag.dvel = Vec3::ZERO;
        ag.nvel = Vec3::ZERO;
        ag.vel = Vec3::ZERO;
        ag.npos = nearest;
        ag.disp = Vec3::ZERO;

        ag.desired_speed = 0.0;
        ag.anim.active = false;

        ag.state = if poly.is_valid() {
            CrowdAgentState::Walking
        } else {
            debug!("Agent {} added off the navigation mesh", idx);
            CrowdAgentState::Invalid
        };

        ag.target_state = MoveRequestState::None;
        ag.target_ref = PolyRef::NULL;
        ag.target_path_queue_ref = PATHQ_INVALID;
        ag.target_replan = false;

        ag.active = true;

        Ok(Some(idx))
    }

    /// Removes an agent; its slot is reused by a later [`Crowd::add_agent`]
    pub fn remove_agent(&mut self, idx: usize) {
        if let Some(ag) = self.agents.get_mut(idx) {
            ag.active = false;
            trace!("Removed agent {}", idx);
        }
    }

    fn request_move_target_with(
        &mut self,
        idx: usize,
        poly: PolyRef,
        pos: Vec3,
        replan: bool,
    ) -> bool {
        let Some(ag) = self.agents.get_mut(idx) else {
            return false;
        };
        if !ag.active {
            return false;
        }

        // Initialize request
        ag.target_ref = poly;
        ag.target_pos = pos;
        ag.target_path_queue_ref = PATHQ_INVALID;
        ag.target_replan = replan;
        ag.target_state = if poly.is_valid() {
            MoveRequestState::Requesting
        } else {
            MoveRequestState::Failed
        };

        true
    }

    fn request_move_target_replan(&mut self, idx: usize, poly: PolyRef, pos: Vec3) -> bool {
        self.request_move_target_with(idx, poly, pos, true)
    }

    /// Submits a new move request for the agent
    ///
    /// Returns false when the agent is unknown or inactive or the target
    /// polygon is null. The path is planned during following updates.
    pub fn request_move_target(&mut self, idx: usize, poly: PolyRef, pos: Vec3) -> bool {
        if !poly.is_valid() {
            return false;
        }
        self.request_move_target_with(idx, poly, pos, false)
    }

    /// Moves the agent with a fixed velocity, bypassing path planning
    pub fn request_move_velocity(&mut self, idx: usize, vel: Vec3) -> bool {
        let Some(ag) = self.agents.get_mut(idx) else {
            return false;
        };
        if !ag.active {
            return false;
        }

        // Initialize request
        ag.target_ref = PolyRef::NULL;
        ag.target_pos = vel;
        ag.target_path_queue_ref = PATHQ_INVALID;
        ag.target_replan = false;
        ag.target_state = MoveRequestState::Velocity;

        true
    }

    /// Cancels the agent's move request
    pub fn reset_move_target(&mut self, idx: usize) -> bool {
        let Some(ag) = self.agents.get_mut(idx) else {
            return false;
        };

        // Initialize request
        ag.target_ref = PolyRef::NULL;
        ag.target_pos = Vec3::ZERO;
        ag.dvel = Vec3::ZERO;
        ag.target_path_queue_ref = PATHQ_INVALID;
        ag.target_replan = false;
        ag.target_state = MoveRequestState::None;

        true
    }

    /// Advances the simulation by `dt` seconds
    ///
    /// Agents that lose the mesh become invalid and search failures fail the
    /// move request; neither is an error. An error is returned when a walking
    /// agent's corridor is found empty.
    pub fn update(&mut self, dt: f32, mut debug: Option<&mut dyn CrowdDebugSink>) -> Result<()> {
        self.velocity_sample_count = 0;

        let debug_idx = debug.as_ref().map(|d| d.agent_index());
        let agents = self.get_active_agents();

        // Check that all agents still have valid paths
        self.check_path_validity(&agents, dt);

        // Update async move request and path finder
        self.update_move_request(&agents)?;

        // Optimize path topology
        self.update_topology_optimization(&agents, dt)?;

        // Register agents to proximity grid
        self.grid.clear();
        for &i in &agents {
            let ag = &self.agents[i];
            let p = ag.npos;
            let r = ag.params.radius;
            if !self.grid.add_item(i, p.x - r, p.z - r, p.x + r, p.z + r) {
                warn!("Proximity grid is full, agent {} is missing from neighbour queries", i);
            }
        }

        // Get nearby navmesh segments and agents to collide with
        self.update_neighbourhood(&agents);

        // Find next corner to steer to
        self.update_corners(&agents, debug_idx, &mut debug)?;

        // Trigger off-mesh connections (depends on corners)
        self.trigger_offmesh_connections(&agents)?;

        // Calculate steering
        self.calculate_steering(&agents);

        // Velocity planning
        self.plan_velocities(&agents, debug_idx, &mut debug);

        // Integrate
        for &i in &agents {
            let ag = &mut self.agents[i];
            if ag.state != CrowdAgentState::Walking {
                continue;
            }
            ag.integrate(dt);
        }

        // Handle collisions
        self.resolve_collisions(&agents);

        // Move along navmesh
        self.move_agents(&agents)?;

        // Update agents using off-mesh connection
        self.update_offmesh_animations(&agents, dt);

        Ok(())
    }

    fn check_path_validity(&mut self, agents: &[usize], dt: f32) {
        let lookahead = self.config.check_lookahead;
        let replan_delay = self.config.target_replan_delay;
        let mut replans = Vec::new();

        for &idx in agents {
            let ag = &mut self.agents[idx];
            if ag.state != CrowdAgentState::Walking {
                continue;
            }

            ag.target_replan_time += dt;

            let filter = &self.filters[filter_index(&ag.params)];
            let mut replan = false;

            // First check that the current location is valid
            let mut agent_ref = ag.corridor.get_first_poly();
            let mut agent_pos = ag.npos;
            if !self.navquery.is_valid_poly_ref(agent_ref, filter) {
                // Current location is not valid, try to reposition
                match self.navquery.find_nearest_poly(ag.npos, self.ext, filter) {
                    Some((poly, nearest)) => {
                        agent_ref = poly;
                        agent_pos = nearest;
                    }
                    None => {
                        // Could not find location in navmesh, set state to invalid
                        ag.corridor.reset(PolyRef::NULL, agent_pos);
                        ag.partial = false;
                        ag.boundary.reset();
                        ag.state = CrowdAgentState::Invalid;
                        debug!("Agent {} lost the navigation mesh", idx);
                        continue;
                    }
                }

                // Make sure the first polygon is valid, but leave other valid
                // polygons in the path so that replanner can adjust the path better
                ag.corridor.fix_path_start(agent_ref, agent_pos);
                ag.boundary.reset();
                ag.npos = agent_pos;

                replan = true;
            }

            // If the agent does not have move target or is controlled by velocity,
            // no need to recover the target nor replan
            if matches!(
                ag.target_state,
                MoveRequestState::None | MoveRequestState::Velocity
            ) {
                continue;
            }

            // Try to recover move request position
            if ag.target_state != MoveRequestState::Failed {
                if !self.navquery.is_valid_poly_ref(ag.target_ref, filter) {
                    // Current target is not valid, try to reposition
                    let (target_ref, target_pos) = self
                        .navquery
                        .find_nearest_poly(ag.target_pos, self.ext, filter)
                        .unwrap_or((PolyRef::NULL, ag.target_pos));
                    ag.target_ref = target_ref;
                    ag.target_pos = target_pos;
                    replan = true;
                }
                if !ag.target_ref.is_valid() {
                    // Failed to reposition target, fail moverequest
                    ag.corridor.reset(agent_ref, agent_pos);
                    ag.partial = false;
                    ag.target_state = MoveRequestState::None;
                    debug!("Agent {} lost its move target", idx);
                }
            }

            // If nearby corridor is not valid, replan
            if !ag.corridor.is_valid(lookahead, &self.navquery, filter) {
                replan = true;
            }

            // If the end of the path is near and it is not the requested location, replan
            if ag.target_state == MoveRequestState::Valid
                && ag.target_replan_time > replan_delay
                && ag.corridor.get_path_count() < lookahead
                && ag.corridor.get_last_poly() != ag.target_ref
            {
                replan = true;
            }

            // Try to replan path to goal
            if replan && ag.target_state != MoveRequestState::None {
                replans.push((idx, ag.target_ref, ag.target_pos));
            }
        }

        for (idx, target_ref, target_pos) in replans {
            trace!("Replanning path of agent {}", idx);
            self.request_move_target_replan(idx, target_ref, target_pos);
        }
    }

    fn update_move_request(&mut self, agents: &[usize]) -> Result<()> {
        let mut queue: Vec<usize> = Vec::new();

        // Fire off new requests
        for &idx in agents {
            let ag = &mut self.agents[idx];
            if ag.state == CrowdAgentState::Invalid {
                continue;
            }
            if matches!(
                ag.target_state,
                MoveRequestState::None | MoveRequestState::Velocity
            ) {
                continue;
            }

            if ag.target_state == MoveRequestState::Requesting {
                let filter = &self.filters[filter_index(&ag.params)];
                let path = ag.corridor.get_path();
                let Some(&first) = path.first() else {
                    warn!("Agent {} requested a move with an empty corridor", idx);
                    return Err(Error::InvariantViolation(format!(
                        "agent {idx} has an empty path corridor"
                    )));
                };

                // Quick search towards the goal
                let init = self.navquery.init_sliced_find_path(
                    first,
                    ag.target_ref,
                    ag.npos,
                    ag.target_pos,
                    filter,
                );
                if !init.is_failure() {
                    self.navquery
                        .update_sliced_find_path(self.config.quick_search_iters);
                }
                let (status, mut req_path) = if ag.target_replan {
                    // Try to use existing steady path during replan if possible
                    self.navquery
                        .finalize_sliced_find_path_partial(path, MAX_QUICK_PATH)
                } else {
                    // Try to move towards target when goal changes
                    self.navquery.finalize_sliced_find_path(MAX_QUICK_PATH)
                };

                let mut req_pos = ag.target_pos;
                if status.is_failure() {
                    req_path.clear();
                } else if let Some(&last) = req_path.last() {
                    if last != ag.target_ref {
                        // Partial path, constrain target position inside the last polygon
                        match self.navquery.closest_point_on_poly(last, ag.target_pos) {
                            Ok((closest, _)) => req_pos = closest,
                            Err(_) => req_path.clear(),
                        }
                    }
                }

                if req_path.is_empty() {
                    // Could not find path, start the request from current location
                    req_pos = ag.npos;
                    req_path.push(first);
                }

                ag.corridor.set_corridor(req_pos, &req_path);
                ag.boundary.reset();
                ag.partial = false;

                if req_path.last() == Some(&ag.target_ref) {
                    ag.target_state = MoveRequestState::Valid;
                    ag.target_replan_time = 0.0;
                } else {
                    // The path is longer or potentially unreachable, full plan
                    ag.target_state = MoveRequestState::WaitingForQueue;
                }
            }

            if ag.target_state == MoveRequestState::WaitingForQueue {
                queue.push(idx);
            }
        }

        // Agents that have waited the longest go first
        queue.sort_by(|&a, &b| {
            self.agents[b]
                .target_replan_time
                .total_cmp(&self.agents[a].target_replan_time)
        });
        queue.truncate(self.config.path_request_batch);

        for idx in queue {
            let ag = &mut self.agents[idx];
            ag.target_path_queue_ref = self.path_queue.request(
                ag.corridor.get_last_poly(),
                ag.target_ref,
                ag.corridor.get_target(),
                ag.target_pos,
                &self.filters[filter_index(&ag.params)],
            );
            if ag.target_path_queue_ref != PATHQ_INVALID {
                ag.target_state = MoveRequestState::WaitingForPath;
            }
        }

        // Update requests
        self.path_queue.update(self.config.max_iters_per_update);

        // Process path results
        for &idx in agents {
            let ag = &mut self.agents[idx];
            if ag.target_state != MoveRequestState::WaitingForPath {
                continue;
            }

            // Poll path queue
            let status = self.path_queue.get_request_status(ag.target_path_queue_ref);
            if status.is_failure() {
                // Path find failed, retry if the target location is still valid
                ag.target_path_queue_ref = PATHQ_INVALID;
                ag.target_state = if ag.target_ref.is_valid() {
                    MoveRequestState::Requesting
                } else {
                    MoveRequestState::Failed
                };
                ag.target_replan_time = 0.0;
                debug!("Path request of agent {} failed", idx);
            } else if status.is_success() {
                let path = ag.corridor.get_path();
                let Some(&old_last) = path.last() else {
                    return Err(Error::InvariantViolation(format!(
                        "agent {idx} has an empty path corridor"
                    )));
                };

                // Apply results
                let mut target_pos = ag.target_pos;
                let (status, mut res) = self
                    .path_queue
                    .get_path_result(ag.target_path_queue_ref, self.config.max_path_result);
                let mut valid = !status.is_failure() && !res.is_empty();
                ag.partial = status.is_partial();

                // Merge result and existing path. The agent might have moved whilst
                // the request was processed, but the end of the old path is where
                // the request was issued.
                if valid && res[0] != old_last {
                    valid = false;
                }

                if valid {
                    // Put the old path infront of the new one
                    if path.len() > 1 {
                        let keep = path.len() - 1;
                        res.truncate(self.config.max_path_result.saturating_sub(keep));
                        let mut merged = Vec::with_capacity(keep + res.len());
                        merged.extend_from_slice(&path[..keep]);
                        merged.extend_from_slice(&res);
                        res = merged;
                        remove_trackbacks(&mut res);
                    }

                    // Check for partial path
                    if let Some(&last) = res.last() {
                        if last != ag.target_ref {
                            // Partial path, constrain target position inside the last polygon
                            match self.navquery.closest_point_on_poly(last, target_pos) {
                                Ok((nearest, _)) => target_pos = nearest,
                                Err(_) => valid = false,
                            }
                        }
                    }
                }

                if valid {
                    // Set current corridor
                    ag.corridor.set_corridor(target_pos, &res);
                    // Force to update boundary
                    ag.boundary.reset();
                    ag.target_state = MoveRequestState::Valid;
                    trace!("Agent {} received a path of {} polygons", idx, res.len());
                } else {
                    // Something went wrong
                    ag.target_state = MoveRequestState::Failed;
                    debug!("Agent {} could not use its path result", idx);
                }

                ag.target_replan_time = 0.0;
            }
        }

        Ok(())
    }

    fn update_topology_optimization(&mut self, agents: &[usize], dt: f32) -> Result<()> {
        let mut queue: Vec<usize> = Vec::new();

        for &idx in agents {
            let ag = &mut self.agents[idx];
            if ag.state != CrowdAgentState::Walking {
                continue;
            }
            if matches!(
                ag.target_state,
                MoveRequestState::None | MoveRequestState::Velocity
            ) {
                continue;
            }
            if !ag.params.update_flags.contains(UpdateFlags::OPTIMIZE_TOPO) {
                continue;
            }

            ag.topology_opt_time += dt;
            if ag.topology_opt_time >= self.config.topology_opt_time_threshold {
                queue.push(idx);
            }
        }

        // Agents that have waited the longest go first
        queue.sort_by(|&a, &b| {
            self.agents[b]
                .topology_opt_time
                .total_cmp(&self.agents[a].topology_opt_time)
        });
        queue.truncate(self.config.topology_opt_quota);

        for idx in queue {
            let ag = &mut self.agents[idx];
            let filter = &self.filters[filter_index(&ag.params)];
            if ag.corridor.optimize_path_topology(&mut self.navquery, filter)? {
                trace!("Optimized path topology of agent {}", idx);
            }
            ag.topology_opt_time = 0.0;
        }

        Ok(())
    }

    fn update_neighbourhood(&mut self, agents: &[usize]) {
        for &idx in agents {
            if self.agents[idx].state != CrowdAgentState::Walking {
                continue;
            }

            let ag = &mut self.agents[idx];
            let filter = &self.filters[filter_index(&ag.params)];
            let range = ag.params.collision_query_range;

            // Update the collision boundary after certain distance has been passed or
            // if it has become invalid
            let update_thr = range * 0.25;
            if dist_sqr_2d(ag.npos, ag.boundary.get_center()) > update_thr * update_thr
                || !ag.boundary.is_valid(&self.navquery, filter)
            {
                let first = ag.corridor.get_first_poly();
                if let Err(err) = ag.boundary.update(first, ag.npos, range, &self.navquery, filter)
                {
                    trace!("Boundary update of agent {} failed: {}", idx, err);
                    ag.boundary.reset();
                }
            }

            // Query neighbour agents
            let ag = &self.agents[idx];
            let neis = get_neighbours(
                ag.npos,
                ag.params.height,
                range,
                idx,
                &self.agents,
                &self.grid,
            );
            self.agents[idx].neis = neis;
        }
    }

    fn update_corners(
        &mut self,
        agents: &[usize],
        debug_idx: Option<usize>,
        debug: &mut Option<&mut dyn CrowdDebugSink>,
    ) -> Result<()> {
        for &idx in agents {
            let ag = &mut self.agents[idx];
            if ag.state != CrowdAgentState::Walking {
                continue;
            }
            if matches!(
                ag.target_state,
                MoveRequestState::None | MoveRequestState::Velocity
            ) {
                continue;
            }

            // Find corners for steering
            ag.corners = ag
                .corridor
                .find_corners(CROWDAGENT_MAX_CORNERS, &self.navquery)?;

            // Check to see if the corner after the next corner is directly visible,
            // and short cut to there
            let sink = debug.as_deref_mut().filter(|_| debug_idx == Some(idx));
            if ag.params.update_flags.contains(UpdateFlags::OPTIMIZE_VIS) && !ag.corners.is_empty()
            {
                let target = ag.corners[1.min(ag.corners.len() - 1)].pos;
                let filter = &self.filters[filter_index(&ag.params)];
                ag.corridor.optimize_path_visibility(
                    target,
                    ag.params.path_optimization_range,
                    &self.navquery,
                    filter,
                )?;

                // Copy data for debug purposes
                if let Some(sink) = sink {
                    sink.record_visibility_optimization(ag.corridor.get_pos(), target);
                }
            } else if let Some(sink) = sink {
                sink.record_visibility_optimization(Vec3::ZERO, Vec3::ZERO);
            }
        }

        Ok(())
    }

    fn trigger_offmesh_connections(&mut self, agents: &[usize]) -> Result<()> {
        for &idx in agents {
            let ag = &mut self.agents[idx];
            if ag.state != CrowdAgentState::Walking {
                continue;
            }
            if matches!(
                ag.target_state,
                MoveRequestState::None | MoveRequestState::Velocity
            ) {
                continue;
            }

            // Check
            let trigger_radius = ag.params.radius * 2.25;
            if !ag.over_offmesh_connection(trigger_radius) {
                continue;
            }

            // Adjust the path over the off-mesh connection
            let Some(con) = ag.corners.last().map(|c| c.poly) else {
                continue;
            };
            match ag.corridor.move_over_offmesh_connection(con, &self.navquery)? {
                Some((refs, start_pos, end_pos)) => {
                    let anim = &mut ag.anim;
                    anim.init_pos = ag.npos;
                    anim.poly_ref = refs[1];
                    anim.active = true;
                    anim.t = 0.0;
                    anim.tmax = (dist_2d(start_pos, end_pos) / ag.params.max_speed) * 0.5;
                    anim.start_pos = start_pos;
                    anim.end_pos = end_pos;

                    ag.state = CrowdAgentState::OffMesh;
                    ag.corners.clear();
                    ag.neis.clear();
                    debug!("Agent {} entered off-mesh connection {}", idx, con);
                }
                None => {
                    // Path validity check will ensure that bad/blocked connections will be replanned
                }
            }
        }

        Ok(())
    }

    fn calculate_steering(&mut self, agents: &[usize]) {
        for &idx in agents {
            let ag = &self.agents[idx];
            if ag.state != CrowdAgentState::Walking {
                continue;
            }
            if ag.target_state == MoveRequestState::None {
                continue;
            }

            let desired_speed;
            let mut dvel = if ag.target_state == MoveRequestState::Velocity {
                desired_speed = ag.target_pos.length();
                ag.target_pos
            } else {
                // Calculate steering direction
                let dir = if ag.params.update_flags.contains(UpdateFlags::ANTICIPATE_TURNS) {
                    ag.calc_smooth_steer_direction()
                } else {
                    ag.calc_straight_steer_direction()
                };

                // Calculate speed scale, which tells the agent to slowdown at the end of the path
                let slow_down_radius = ag.params.radius * 2.0;
                let speed_scale = ag.get_distance_to_goal(slow_down_radius) / slow_down_radius;

                desired_speed = ag.params.max_speed;
                dir * (desired_speed * speed_scale)
            };

            // Separation
            if ag.params.update_flags.contains(UpdateFlags::SEPARATION) {
                let separation_dist = ag.params.collision_query_range;
                let inv_separation_dist = 1.0 / separation_dist;
                let separation_weight = ag.params.separation_weight;

                let mut w = 0.0;
                let mut disp = Vec3::ZERO;

                for nei in &ag.neis {
                    let other = &self.agents[nei.idx];

                    let mut diff = ag.npos - other.npos;
                    diff.y = 0.0;

                    let dist_sqr = diff.length_squared();
                    if dist_sqr < 0.00001 {
                        continue;
                    }
                    if dist_sqr > separation_dist * separation_dist {
                        continue;
                    }
                    let dist = dist_sqr.sqrt();
                    let weight = separation_weight
                        * (1.0 - (dist * inv_separation_dist) * (dist * inv_separation_dist));

                    disp += diff * (weight / dist);
                    w += 1.0;
                }

                if w > 0.0001 {
                    // Adjust desired velocity
                    dvel += disp * (1.0 / w);
                    // Clamp desired velocity to desired speed
                    let speed = dvel.length();
                    if speed > desired_speed {
                        dvel *= desired_speed / speed;
                    }
                }
            }

            let ag = &mut self.agents[idx];
            ag.dvel = dvel;
            ag.desired_speed = desired_speed;
        }
    }

    fn plan_velocities(
        &mut self,
        agents: &[usize],
        debug_idx: Option<usize>,
        debug: &mut Option<&mut dyn CrowdDebugSink>,
    ) {
        for &idx in agents {
            let ag = &self.agents[idx];
            if ag.state != CrowdAgentState::Walking {
                continue;
            }

            if !ag.params.update_flags.contains(UpdateFlags::OBSTACLE_AVOIDANCE) {
                // If not using velocity planning, new velocity is directly the desired velocity
                let dvel = ag.dvel;
                self.agents[idx].nvel = dvel;
                continue;
            }

            self.obstacle_query.reset();

            // Add neighbours as obstacles
            for nei in &ag.neis {
                let other = &self.agents[nei.idx];
                self.obstacle_query
                    .add_circle(other.npos, other.params.radius, other.vel, other.dvel);
            }

            // Append neighbour segments as obstacles
            for (s0, s1) in ag.boundary.segments() {
                if tri_area_2d(ag.npos, s0, s1) < 0.0 {
                    continue;
                }
                self.obstacle_query.add_segment(s0, s1);
            }

            let vod = debug
                .as_deref_mut()
                .filter(|_| debug_idx == Some(idx))
                .and_then(|sink| sink.avoidance_debug_data());

            // Sample new safe velocity
            let params = &self.obstacle_query_params[avoidance_index(&ag.params)];
            let (nvel, ns) = match self.config.sampling_mode {
                SamplingMode::Adaptive => self.obstacle_query.sample_velocity_adaptive(
                    ag.npos,
                    ag.params.radius,
                    ag.desired_speed,
                    ag.vel,
                    ag.dvel,
                    params,
                    vod,
                ),
                SamplingMode::Grid => self.obstacle_query.sample_velocity_grid(
                    ag.npos,
                    ag.params.radius,
                    ag.desired_speed,
                    ag.vel,
                    ag.dvel,
                    params,
                    vod,
                ),
            };
            self.velocity_sample_count += ns;
            self.agents[idx].nvel = nvel;
        }
    }

    fn resolve_collisions(&mut self, agents: &[usize]) {
        let resolve_factor = self.config.collision_resolve_factor;

        for _ in 0..self.config.collision_iterations {
            for &idx0 in agents {
                let ag = &self.agents[idx0];
                if ag.state != CrowdAgentState::Walking {
                    continue;
                }

                let mut disp = Vec3::ZERO;
                let mut w = 0.0;

                for nei in &ag.neis {
                    let idx1 = nei.idx;
                    let other = &self.agents[idx1];

                    let mut diff = ag.npos - other.npos;
                    diff.y = 0.0;

                    let combined_radius = ag.params.radius + other.params.radius;
                    let dist_sqr = diff.length_squared();
                    if dist_sqr > combined_radius * combined_radius {
                        continue;
                    }
                    let dist = dist_sqr.sqrt();
                    let mut pen = combined_radius - dist;
                    if dist < 0.0001 {
                        // Agents on top of each other, try to choose diverging separation directions
                        diff = if idx0 > idx1 {
                            Vec3::new(-ag.dvel.z, 0.0, ag.dvel.x)
                        } else {
                            Vec3::new(ag.dvel.z, 0.0, -ag.dvel.x)
                        };
                        pen = 0.01;
                    } else {
                        pen = (1.0 / dist) * (pen * 0.5) * resolve_factor;
                    }

                    disp += diff * pen;
                    w += 1.0;
                }

                if w > 0.0001 {
                    disp *= 1.0 / w;
                }

                self.agents[idx0].disp = disp;
            }

            for &idx in agents {
                let ag = &mut self.agents[idx];
                if ag.state != CrowdAgentState::Walking {
                    continue;
                }
                ag.npos += ag.disp;
            }
        }
    }

    fn move_agents(&mut self, agents: &[usize]) -> Result<()> {
        for &idx in agents {
            let ag = &mut self.agents[idx];
            if ag.state != CrowdAgentState::Walking {
                continue;
            }

            // Move along navmesh
            let filter = &self.filters[filter_index(&ag.params)];
            ag.corridor.move_position(ag.npos, &self.navquery, filter)?;

            // Get valid constrained position back
            ag.npos = ag.corridor.get_pos();

            // If not using path, truncate the corridor to just one poly
            if matches!(
                ag.target_state,
                MoveRequestState::None | MoveRequestState::Velocity
            ) {
                let first = ag.corridor.get_first_poly();
                ag.corridor.reset(first, ag.npos);
                ag.partial = false;
            }
        }

        Ok(())
    }

    fn update_offmesh_animations(&mut self, agents: &[usize], dt: f32) {
        for &idx in agents {
            let ag = &mut self.agents[idx];
            if !ag.anim.active {
                continue;
            }

            ag.anim.t += dt;
            if ag.anim.t > ag.anim.tmax {
                // Reset animation
                ag.anim.active = false;
                // Prepare agent for walking
                ag.state = CrowdAgentState::Walking;
                ag.npos = ag.anim.end_pos;
                ag.vel = Vec3::ZERO;
                ag.dvel = Vec3::ZERO;
                debug!("Agent {} left off-mesh connection {}", idx, ag.anim.poly_ref);
                continue;
            }

            // Update position
            let anim = &ag.anim;
            let ta = anim.tmax * 0.15;
            let tb = anim.tmax;
            ag.npos = if anim.t < ta {
                let u = tween(anim.t, 0.0, ta);
                anim.init_pos.lerp(anim.start_pos, u)
            } else {
                let u = tween(anim.t, ta, tb);
                anim.start_pos.lerp(anim.end_pos, u)
            };

            // Update velocity
            ag.vel = Vec3::ZERO;
            ag.dvel = Vec3::ZERO;
        }
    }
}

/// Collects the agents around `pos` sorted by distance
fn get_neighbours(
    pos: Vec3,
    height: f32,
    range: f32,
    skip: usize,
    agents: &[CrowdAgent],
    grid: &ProximityGrid,
) -> Vec<CrowdNeighbour> {
    let mut result: Vec<CrowdNeighbour> = Vec::with_capacity(CROWDAGENT_MAX_NEIGHBOURS);

    let ids = grid.query_items(pos.x - range, pos.z - range, pos.x + range, pos.z + range, MAX_NEIS);
    for id in ids {
        if id == skip {
            continue;
        }
        let Some(ag) = agents.get(id) else {
            continue;
        };

        // Check for overlap
        let mut diff = pos - ag.npos;
        if diff.y.abs() >= (height + ag.params.height) / 2.0 {
            continue;
        }
        diff.y = 0.0;
        let dist_sqr = diff.length_squared();
        if dist_sqr > range * range {
            continue;
        }

        add_neighbour(&mut result, id, dist_sqr, CROWDAGENT_MAX_NEIGHBOURS);
    }

    result
}

fn add_neighbour(neis: &mut Vec<CrowdNeighbour>, idx: usize, dist: f32, max_neis: usize) {
    let pos = neis
        .iter()
        .position(|nei| dist <= nei.dist)
        .unwrap_or(neis.len());
    if pos >= max_neis {
        return;
    }
    neis.insert(pos, CrowdNeighbour { idx, dist });
    neis.truncate(max_neis);
}

/// Removes back-and-forth steps `A B A` left by joining two paths
fn remove_trackbacks(path: &mut Vec<PolyRef>) {
    let mut j: isize = 0;
    while (j as usize) < path.len() {
        let ju = j as usize;
        if ju >= 1 && ju + 1 < path.len() && path[ju - 1] == path[ju + 1] {
            path.drain(ju - 1..ju + 1);
            j -= 2;
        }
        j += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use navcrowd_query::{GridNavMesh, GridNavQuery};
    use std::sync::Arc;

    fn open_crowd(max_agents: usize) -> Crowd<GridNavQuery> {
        let rows = vec![".........."; 10];
        let mesh = GridNavMesh::from_ascii(Vec3::ZERO, 1.0, &rows).unwrap();
        Crowd::new(max_agents, 0.6, GridNavQuery::new(Arc::new(mesh), 1024)).unwrap()
    }

    fn still_params() -> AgentParams {
        AgentParams {
            radius: 0.5,
            update_flags: UpdateFlags::empty(),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_crowd() {
        let crowd = open_crowd(8);
        assert_eq!(crowd.get_agent_count(), 8);
        assert!(crowd.get_active_agents().is_empty());
        assert!((crowd.get_query_extents() - Vec3::new(1.2, 0.9, 1.2)).length() < 1e-5);
        assert!(crowd.get_filter(15).is_some());
        assert!(crowd.get_filter(16).is_none());
        assert!(crowd.get_obstacle_avoidance_params(7).is_some());
        assert!(crowd.get_obstacle_avoidance_params(8).is_none());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mesh = GridNavMesh::from_ascii(Vec3::ZERO, 1.0, &["..."]).unwrap();
        let navquery = GridNavQuery::new(Arc::new(mesh), 64);
        assert!(Crowd::new(0, 0.6, navquery).is_err());
    }

    #[test]
    fn test_add_agent_snaps_to_mesh() {
        let mut crowd = open_crowd(4);
        let idx = crowd.add_agent(Vec3::new(2.5, 0.3, 2.5), still_params()).unwrap().unwrap();
        let ag = crowd.get_agent(idx).unwrap();
        assert!(ag.is_active());
        assert_eq!(ag.get_state(), CrowdAgentState::Walking);
        assert_eq!(ag.get_pos(), Vec3::new(2.5, 0.0, 2.5));
        assert_eq!(ag.get_corridor().get_path_count(), 1);

        // Far away from any polygon
        let lost = crowd.add_agent(Vec3::new(50.0, 0.0, 50.0), still_params()).unwrap().unwrap();
        assert_eq!(crowd.get_agent(lost).unwrap().get_state(), CrowdAgentState::Invalid);
        assert_eq!(crowd.get_active_agents(), vec![idx, lost]);
    }

    #[test]
    fn test_invalid_agent_params_are_rejected() {
        let mut crowd = open_crowd(2);

        let stopped = AgentParams {
            max_speed: 0.0,
            ..still_params()
        };
        assert!(matches!(
            crowd.add_agent(Vec3::new(1.5, 0.0, 1.5), stopped),
            Err(Error::InvalidParam(_))
        ));

        let point = AgentParams {
            radius: 0.0,
            ..still_params()
        };
        assert!(crowd.add_agent(Vec3::new(1.5, 0.0, 1.5), point).is_err());

        // Wider than the crowd was built for
        let wide = AgentParams {
            radius: 1.0,
            ..still_params()
        };
        assert!(crowd.add_agent(Vec3::new(1.5, 0.0, 1.5), wide.clone()).is_err());
        assert!(crowd.get_active_agents().is_empty());

        let idx = crowd.add_agent(Vec3::new(1.5, 0.0, 1.5), still_params()).unwrap().unwrap();
        assert!(crowd.update_agent_parameters(idx, wide).is_err());
        assert_eq!(crowd.get_agent(idx).unwrap().get_params().radius, 0.5);

        let faster = AgentParams {
            max_speed: 5.0,
            ..still_params()
        };
        crowd.update_agent_parameters(idx, faster).unwrap();
        assert_eq!(crowd.get_agent(idx).unwrap().get_params().max_speed, 5.0);
    }

    #[test]
    fn test_request_validation() {
        let mut crowd = open_crowd(2);
        let idx = crowd.add_agent(Vec3::new(1.5, 0.0, 1.5), still_params()).unwrap().unwrap();
        let target = crowd.get_nav_query().mesh().poly_ref_at(5, 5);

        assert!(!crowd.request_move_target(idx, PolyRef::NULL, Vec3::ZERO));
        assert_eq!(crowd.get_agent(idx).unwrap().get_target_state(), MoveRequestState::None);

        assert!(!crowd.request_move_target(1, target, Vec3::ZERO));
        assert!(!crowd.request_move_target(7, target, Vec3::ZERO));

        assert!(crowd.request_move_target(idx, target, Vec3::new(5.5, 0.0, 5.5)));
        assert_eq!(
            crowd.get_agent(idx).unwrap().get_target_state(),
            MoveRequestState::Requesting
        );

        assert!(crowd.reset_move_target(idx));
        assert_eq!(crowd.get_agent(idx).unwrap().get_target_state(), MoveRequestState::None);
    }

    #[test]
    fn test_collision_resolution_separates_overlapping_agents() {
        let mut crowd = open_crowd(4);
        let a = crowd.add_agent(Vec3::new(5.0, 0.0, 5.0), still_params()).unwrap().unwrap();
        let b = crowd.add_agent(Vec3::new(5.1, 0.0, 5.0), still_params()).unwrap().unwrap();

        let before = crowd.get_agent(a).unwrap().get_pos().distance(crowd.get_agent(b).unwrap().get_pos());
        crowd.update(0.1, None).unwrap();
        let after = crowd.get_agent(a).unwrap().get_pos().distance(crowd.get_agent(b).unwrap().get_pos());

        assert!(after > before);
        assert_eq!(crowd.get_agent(a).unwrap().get_neighbours()[0].idx, b);
    }

    #[test]
    fn test_neighbours_sorted_and_capped() {
        let mut crowd = open_crowd(10);
        let center = crowd.add_agent(Vec3::new(5.0, 0.0, 5.0), still_params()).unwrap().unwrap();
        for i in 0..8 {
            let x = 5.0 + 0.5 * (i + 1) as f32;
            let z = if i % 2 == 0 { 3.0 } else { 7.0 };
            crowd.add_agent(Vec3::new(x.min(9.5), 0.0, z), still_params()).unwrap().unwrap();
        }

        crowd.update(0.01, None).unwrap();
        let neis = crowd.get_agent(center).unwrap().get_neighbours();
        assert_eq!(neis.len(), CROWDAGENT_MAX_NEIGHBOURS);
        assert!(neis.windows(2).all(|w| w[0].dist <= w[1].dist));
        assert!(neis.iter().all(|n| n.idx != center));
    }

    #[test]
    fn test_add_neighbour_keeps_closest() {
        let mut neis = Vec::new();
        for (idx, dist) in [(1, 4.0), (2, 1.0), (3, 9.0), (4, 2.0)] {
            add_neighbour(&mut neis, idx, dist, 3);
        }
        let order: Vec<usize> = neis.iter().map(|n| n.idx).collect();
        assert_eq!(order, vec![2, 4, 1]);
    }

    #[test]
    fn test_remove_trackbacks() {
        let p = |v: &[u32]| v.iter().map(|&r| PolyRef::new(r)).collect::<Vec<_>>();

        let mut path = p(&[1, 2, 3, 2, 4]);
        remove_trackbacks(&mut path);
        assert_eq!(path, p(&[1, 2, 4]));

        let mut path = p(&[1, 2, 1, 2, 3]);
        remove_trackbacks(&mut path);
        assert_eq!(path, p(&[1, 2, 3]));

        let mut path = p(&[1, 2, 3]);
        remove_trackbacks(&mut path);
        assert_eq!(path, p(&[1, 2, 3]));
    }
}
