use navcrowd_common::{Error, Result};

/// Velocity sampling strategy used by obstacle avoidance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum SamplingMode {
    /// Rings of samples refined around the best candidate
    #[default]
    Adaptive,
    /// Regular grid of samples inside the speed disk
    Grid,
}

/// Tuning of a crowd
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct CrowdConfig {
    pub max_agents: usize,
    pub max_agent_radius: f32,
    /// Maximum number of polygons in a path result
    pub max_path_result: usize,
    /// Request slots of the path queue
    pub path_queue_size: usize,
    /// Path queue search iterations per tick
    pub max_iters_per_update: usize,
    /// Search iterations after which a queued request yields a partial path
    pub max_iters_per_request: usize,
    /// Iterations of the quick search run when a move request is made
    pub quick_search_iters: usize,
    /// Requests handed to the path queue per tick
    pub path_request_batch: usize,
    /// Seconds between topology optimizations of an agent
    pub topology_opt_time_threshold: f32,
    /// Topology optimizations per tick
    pub topology_opt_quota: usize,
    /// Corridor polygons checked for validity each tick
    pub check_lookahead: usize,
    /// Seconds before a path that ends short of its target is replanned
    pub target_replan_delay: f32,
    pub collision_iterations: usize,
    /// Share of the penetration resolved per collision pass
    pub collision_resolve_factor: f32,
    pub max_obstacle_circles: usize,
    pub max_obstacle_segments: usize,
    pub sampling_mode: SamplingMode,
}

impl CrowdConfig {
    pub fn new(max_agents: usize, max_agent_radius: f32) -> Self {
        CrowdConfig {
            max_agents,
            max_agent_radius,
            max_path_result: 256,
            path_queue_size: 32,
            max_iters_per_update: 100,
            max_iters_per_request: 2048,
            quick_search_iters: 20,
            path_request_batch: 8,
            topology_opt_time_threshold: 0.5,
            topology_opt_quota: 1,
            check_lookahead: 10,
            target_replan_delay: 1.0,
            collision_iterations: 4,
            collision_resolve_factor: 0.7,
            max_obstacle_circles: 6,
            max_obstacle_segments: 8,
            sampling_mode: SamplingMode::Adaptive,
        }
    }

    pub fn with_max_path_result(mut self, max_path_result: usize) -> Self {
        self.max_path_result = max_path_result;
        self
    }

    pub fn with_path_queue_size(mut self, path_queue_size: usize) -> Self {
        self.path_queue_size = path_queue_size;
        self
    }

    pub fn with_max_iters_per_update(mut self, max_iters_per_update: usize) -> Self {
        self.max_iters_per_update = max_iters_per_update;
        self
    }

    pub fn with_max_iters_per_request(mut self, max_iters_per_request: usize) -> Self {
        self.max_iters_per_request = max_iters_per_request;
        self
    }

    pub fn with_quick_search_iters(mut self, quick_search_iters: usize) -> Self {
        self.quick_search_iters = quick_search_iters;
        self
    }

    pub fn with_path_request_batch(mut self, path_request_batch: usize) -> Self {
        self.path_request_batch = path_request_batch;
        self
    }

    pub fn with_topology_optimization(mut self, time_threshold: f32, quota: usize) -> Self {
        self.topology_opt_time_threshold = time_threshold;
        self.topology_opt_quota = quota;
        self
    }

    pub fn with_check_lookahead(mut self, check_lookahead: usize) -> Self {
        self.check_lookahead = check_lookahead;
        self
    }

    pub fn with_target_replan_delay(mut self, target_replan_delay: f32) -> Self {
        self.target_replan_delay = target_replan_delay;
        self
    }

    pub fn with_collision_resolution(mut self, iterations: usize, resolve_factor: f32) -> Self {
        self.collision_iterations = iterations;
        self.collision_resolve_factor = resolve_factor;
        self
    }

    pub fn with_obstacle_capacity(mut self, max_circles: usize, max_segments: usize) -> Self {
        self.max_obstacle_circles = max_circles;
        self.max_obstacle_segments = max_segments;
        self
    }

    pub fn with_sampling_mode(mut self, sampling_mode: SamplingMode) -> Self {
        self.sampling_mode = sampling_mode;
        self
    }

    /// Validates the configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.max_agents == 0 {
            return Err(Error::InvalidParam("Crowd needs room for at least one agent".to_string()));
        }

        if self.max_agent_radius.is_nan() || self.max_agent_radius <= 0.0 {
            return Err(Error::InvalidParam("Invalid max agent radius".to_string()));
        }

        if self.max_path_result == 0 || self.path_queue_size == 0 {
            return Err(Error::InvalidParam("Invalid path buffer sizes".to_string()));
        }

        if self.max_iters_per_update == 0 || self.max_iters_per_request == 0 {
            return Err(Error::InvalidParam("Invalid path search budgets".to_string()));
        }

        if !(0.0..=1.0).contains(&self.collision_resolve_factor) {
            return Err(Error::InvalidParam("Invalid collision resolve factor".to_string()));
        }

        Ok(())
    }
}

impl Default for CrowdConfig {
    fn default() -> Self {
        Self::new(128, 0.6)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CrowdConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.path_queue_size, 32);
        assert_eq!(config.sampling_mode, SamplingMode::Adaptive);
    }

    #[test]
    fn test_builder_and_validation() {
        let config = CrowdConfig::new(10, 0.5)
            .with_path_queue_size(4)
            .with_collision_resolution(2, 0.5)
            .with_sampling_mode(SamplingMode::Grid);
        assert_eq!(config.path_queue_size, 4);
        assert_eq!(config.collision_iterations, 2);
        assert!(config.validate().is_ok());

        assert!(CrowdConfig::new(0, 0.5).validate().is_err());
        assert!(CrowdConfig::new(10, 0.0).validate().is_err());
        assert!(CrowdConfig::new(10, 0.5)
            .with_collision_resolution(4, 2.0)
            .validate()
            .is_err());
    }
}
