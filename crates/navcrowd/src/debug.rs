//! Per-agent debug recording during a crowd update

use glam::Vec3;

use crate::ObstacleAvoidanceDebugData;

/// Receives internal data about one agent while the crowd updates
pub trait CrowdDebugSink {
    /// Index of the agent being observed
    fn agent_index(&self) -> usize;

    /// Called with the ray used by the visibility shortcut
    fn record_visibility_optimization(&mut self, start: Vec3, end: Vec3);

    /// Recorder for the velocity samples of the observed agent
    fn avoidance_debug_data(&mut self) -> Option<&mut ObstacleAvoidanceDebugData>;
}

/// Debug data of one agent
#[derive(Debug, Default)]
pub struct CrowdAgentDebugInfo {
    pub idx: usize,
    pub opt_start: Vec3,
    pub opt_end: Vec3,
    pub vod: ObstacleAvoidanceDebugData,
}

impl CrowdAgentDebugInfo {
    /// Observes agent `idx`, keeping up to `max_samples` avoidance samples
    pub fn new(idx: usize, max_samples: usize) -> Self {
        let mut vod = ObstacleAvoidanceDebugData::new();
        vod.init(max_samples);
        Self {
            idx,
            opt_start: Vec3::ZERO,
            opt_end: Vec3::ZERO,
            vod,
        }
    }
}

impl CrowdDebugSink for CrowdAgentDebugInfo {
    fn agent_index(&self) -> usize {
        self.idx
    }

    fn record_visibility_optimization(&mut self, start: Vec3, end: Vec3) {
        self.opt_start = start;
        self.opt_end = end;
    }

    fn avoidance_debug_data(&mut self) -> Option<&mut ObstacleAvoidanceDebugData> {
        Some(&mut self.vod)
    }
}
