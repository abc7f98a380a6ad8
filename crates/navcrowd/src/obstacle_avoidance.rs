//! Velocity-space obstacle avoidance
//!
//! Candidate velocities are scored against nearby agents (circles) and walls
//! (segments). The penalty combines deviation from the desired and current
//! velocity, a side bias that makes agents pass each other consistently, and
//! the time to the first impact within a time horizon.

use glam::Vec3;
use navcrowd_common::{
    dist_point_segment_sqr_2d, dist_2d, dot_2d, intersect_ray_segment_2d, normalize_2d,
    rotate_2d, sweep_circle_circle, tri_area_2d,
};
use std::f32::consts::PI;

pub const MAX_PATTERN_DIVS: usize = 32;
pub const MAX_PATTERN_RINGS: usize = 4;

#[derive(Debug, Clone, Copy, Default)]
pub struct ObstacleCircle {
    pub p: Vec3,    // Position of the obstacle
    pub vel: Vec3,  // Velocity of the obstacle
    pub dvel: Vec3, // Desired velocity of the obstacle
    pub rad: f32,   // Radius of the obstacle
    pub dp: Vec3,   // Use for side selection during sampling
    pub np: Vec3,   // Use for side selection during sampling
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ObstacleSegment {
    pub p: Vec3, // Start point of the obstacle segment
    pub q: Vec3, // End point of the obstacle segment
    pub touch: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct ObstacleAvoidanceParams {
    pub vel_bias: f32,       // Velocity bias
    pub weight_des_vel: f32, // Weight for desired velocity
    pub weight_cur_vel: f32, // Weight for current velocity
    pub weight_side: f32,    // Weight for side preference
    pub weight_toi: f32,     // Weight for time of impact
    pub horiz_time: f32,     // Horizon time
    pub grid_size: u8,       // Grid size for grid-based sampling
    pub adaptive_divs: u8,   // Adaptive divisions for adaptive sampling
    pub adaptive_rings: u8,  // Adaptive rings for adaptive sampling
    pub adaptive_depth: u8,  // Adaptive depth for adaptive sampling
}

impl Default for ObstacleAvoidanceParams {
    fn default() -> Self {
        Self {
            vel_bias: 0.4,
            weight_des_vel: 2.0,
            weight_cur_vel: 0.75,
            weight_side: 0.75,
            weight_toi: 2.5,
            horiz_time: 2.5,
            grid_size: 33,
            adaptive_divs: 7,
            adaptive_rings: 2,
            adaptive_depth: 5,
        }
    }
}

/// One scored velocity sample
#[derive(Debug, Clone, Copy)]
struct Sample {
    vel: Vec3,
    ssize: f32,
    pen: f32,
    vpen: f32,
    vcpen: f32,
    spen: f32,
    tpen: f32,
}

/// Recorder for the samples evaluated by one avoidance query
#[derive(Debug, Default)]
pub struct ObstacleAvoidanceDebugData {
    samples: Vec<Sample>,
    max_samples: usize,
}

impl ObstacleAvoidanceDebugData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init(&mut self, max_samples: usize) {
        self.max_samples = max_samples;
        self.samples = Vec::with_capacity(max_samples);
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_sample(
        &mut self,
        vel: Vec3,
        ssize: f32,
        pen: f32,
        vpen: f32,
        vcpen: f32,
        spen: f32,
        tpen: f32,
    ) {
        if self.samples.len() >= self.max_samples {
            return;
        }
        self.samples.push(Sample {
            vel,
            ssize,
            pen,
            vpen,
            vcpen,
            spen,
            tpen,
        });
    }

    /// Rescales every penalty term to `[0, 1]` across the recorded samples
    pub fn normalize_samples(&mut self) {
        normalize_by(&mut self.samples, |s| &mut s.pen);
        normalize_by(&mut self.samples, |s| &mut s.vpen);
        normalize_by(&mut self.samples, |s| &mut s.vcpen);
        normalize_by(&mut self.samples, |s| &mut s.spen);
        normalize_by(&mut self.samples, |s| &mut s.tpen);
    }

    pub fn get_sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn get_sample_velocity(&self, i: usize) -> Option<Vec3> {
        self.samples.get(i).map(|s| s.vel)
    }

    pub fn get_sample_size(&self, i: usize) -> Option<f32> {
        self.samples.get(i).map(|s| s.ssize)
    }

    pub fn get_sample_penalty(&self, i: usize) -> Option<f32> {
        self.samples.get(i).map(|s| s.pen)
    }

    pub fn get_sample_desired_velocity_penalty(&self, i: usize) -> Option<f32> {
        self.samples.get(i).map(|s| s.vpen)
    }

    pub fn get_sample_current_velocity_penalty(&self, i: usize) -> Option<f32> {
        self.samples.get(i).map(|s| s.vcpen)
    }

    pub fn get_sample_preferred_side_penalty(&self, i: usize) -> Option<f32> {
        self.samples.get(i).map(|s| s.spen)
    }

    pub fn get_sample_collision_time_penalty(&self, i: usize) -> Option<f32> {
        self.samples.get(i).map(|s| s.tpen)
    }
}

/// Scores candidate velocities against registered circles and segments
#[derive(Debug, Default)]
pub struct ObstacleAvoidanceQuery {
    params: ObstacleAvoidanceParams,
    inv_horiz_time: f32,
    inv_vmax: f32,

    max_circles: usize,
    circles: Vec<ObstacleCircle>,

    max_segments: usize,
    segments: Vec<ObstacleSegment>,
}

impl ObstacleAvoidanceQuery {
    pub fn new(max_circles: usize, max_segments: usize) -> Self {
        Self {
            params: ObstacleAvoidanceParams::default(),
            inv_horiz_time: 0.0,
            inv_vmax: 0.0,
            max_circles,
            circles: Vec::with_capacity(max_circles),
            max_segments,
            segments: Vec::with_capacity(max_segments),
        }
    }

    /// Removes all obstacles
    pub fn reset(&mut self) {
        self.circles.clear();
        self.segments.clear();
    }

    /// Adds a moving circle; ignored once the circle capacity is reached
    pub fn add_circle(&mut self, pos: Vec3, rad: f32, vel: Vec3, dvel: Vec3) {
        if self.circles.len() >= self.max_circles {
            return;
        }
        self.circles.push(ObstacleCircle {
            p: pos,
            vel,
            dvel,
            rad,
            ..Default::default()
        });
    }

    /// Adds a wall segment; ignored once the segment capacity is reached
    pub fn add_segment(&mut self, p: Vec3, q: Vec3) {
        if self.segments.len() >= self.max_segments {
            return;
        }
        self.segments.push(ObstacleSegment { p, q, touch: false });
    }

    pub fn get_obstacle_circle_count(&self) -> usize {
        self.circles.len()
    }

    pub fn get_obstacle_circle(&self, i: usize) -> Option<&ObstacleCircle> {
        self.circles.get(i)
    }

    pub fn get_obstacle_segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn get_obstacle_segment(&self, i: usize) -> Option<&ObstacleSegment> {
        self.segments.get(i)
    }

    fn begin(&mut self, pos: Vec3, vmax: f32, dvel: Vec3, params: &ObstacleAvoidanceParams) {
        self.prepare(pos, dvel);
        self.params = *params;
        self.inv_horiz_time = 1.0 / params.horiz_time;
        self.inv_vmax = if vmax > 0.0 { 1.0 / vmax } else { f32::MAX };
    }

    /// Samples a regular grid of velocities centered on the biased desired velocity
    ///
    /// Returns the chosen velocity and the number of samples evaluated.
    #[allow(clippy::too_many_arguments)]
    pub fn sample_velocity_grid(
        &mut self,
        pos: Vec3,
        rad: f32,
        vmax: f32,
        vel: Vec3,
        dvel: Vec3,
        params: &ObstacleAvoidanceParams,
        mut debug: Option<&mut ObstacleAvoidanceDebugData>,
    ) -> (Vec3, usize) {
        self.begin(pos, vmax, dvel, params);

        if let Some(debug_data) = debug.as_deref_mut() {
            debug_data.reset();
        }

        if params.grid_size < 2 {
            return (Vec3::ZERO, 0);
        }

        let cvx = dvel.x * params.vel_bias;
        let cvz = dvel.z * params.vel_bias;
        let cs = vmax * 2.0 * (1.0 - params.vel_bias) / (params.grid_size as f32 - 1.0);
        let half = (params.grid_size as f32 - 1.0) * cs * 0.5;

        let mut nvel = Vec3::ZERO;
        let mut min_penalty = f32::MAX;
        let mut ns = 0;

        for y in 0..params.grid_size {
            for x in 0..params.grid_size {
                let vcand = Vec3::new(cvx + x as f32 * cs - half, 0.0, cvz + y as f32 * cs - half);
                if vcand.x * vcand.x + vcand.z * vcand.z > (vmax + cs / 2.0).powi(2) {
                    continue;
                }

                let penalty = self.process_sample(
                    vcand,
                    cs,
                    pos,
                    rad,
                    vel,
                    dvel,
                    min_penalty,
                    debug.as_deref_mut(),
                );
                ns += 1;
                if penalty < min_penalty {
                    min_penalty = penalty;
                    nvel = vcand;
                }
            }
        }

        (clamp_speed(nvel, vmax), ns)
    }

    /// Samples rings of velocities around the best candidate, refining the
    /// search radius by half at each depth level
    ///
    /// Returns the chosen velocity and the number of samples evaluated.
    #[allow(clippy::too_many_arguments)]
    pub fn sample_velocity_adaptive(
        &mut self,
        pos: Vec3,
        rad: f32,
        vmax: f32,
        vel: Vec3,
        dvel: Vec3,
        params: &ObstacleAvoidanceParams,
        mut debug: Option<&mut ObstacleAvoidanceDebugData>,
    ) -> (Vec3, usize) {
        self.begin(pos, vmax, dvel, params);

        if let Some(debug_data) = debug.as_deref_mut() {
            debug_data.reset();
        }

        let pattern = sampling_pattern(dvel, params);

        let mut cr = vmax * (1.0 - params.vel_bias);
        let mut res = Vec3::new(dvel.x * params.vel_bias, 0.0, dvel.z * params.vel_bias);
        let mut ns = 0;

        for _ in 0..params.adaptive_depth {
            let mut min_penalty = f32::MAX;
            let mut bvel = Vec3::ZERO;

            for &(px, pz) in &pattern {
                let vcand = Vec3::new(res.x + px * cr, 0.0, res.z + pz * cr);
                if vcand.x * vcand.x + vcand.z * vcand.z > (vmax + 0.001).powi(2) {
                    continue;
                }

                let penalty = self.process_sample(
                    vcand,
                    cr / 10.0,
                    pos,
                    rad,
                    vel,
                    dvel,
                    min_penalty,
                    debug.as_deref_mut(),
                );
                ns += 1;
                if penalty < min_penalty {
                    min_penalty = penalty;
                    bvel = vcand;
                }
            }

            res = bvel;
            cr *= 0.5;
        }

        (clamp_speed(res, vmax), ns)
    }

    fn prepare(&mut self, pos: Vec3, dvel: Vec3) {
        for cir in &mut self.circles {
            // Side
            cir.dp = normalize_2d(cir.p - pos);
            cir.dp.y = 0.0;
            let dv = cir.dvel - dvel;

            let a = tri_area_2d(Vec3::ZERO, cir.dp, dv);
            cir.np = if a < 0.01 {
                Vec3::new(-cir.dp.z, 0.0, cir.dp.x)
            } else {
                Vec3::new(cir.dp.z, 0.0, -cir.dp.x)
            };
        }

        for seg in &mut self.segments {
            // Precalc if the agent is really close to the segment
            const R: f32 = 0.01;
            let (dist_sqr, _) = dist_point_segment_sqr_2d(pos, seg.p, seg.q);
            seg.touch = dist_sqr < R * R;
        }
    }

    /// Calculates the penalty of a candidate velocity
    ///
    /// Bails out with `min_penalty` as soon as the candidate cannot beat it.
    #[allow(clippy::too_many_arguments)]
    fn process_sample(
        &self,
        vcand: Vec3,
        cs: f32,
        pos: Vec3,
        rad: f32,
        vel: Vec3,
        dvel: Vec3,
        min_penalty: f32,
        debug: Option<&mut ObstacleAvoidanceDebugData>,
    ) -> f32 {
        let params = &self.params;

        // Penalty for straying away from the desired and current velocities
        let vpen = params.weight_des_vel * (dist_2d(vcand, dvel) * self.inv_vmax);
        let vcpen = params.weight_cur_vel * (dist_2d(vcand, vel) * self.inv_vmax);

        // Hit time below which the candidate can no longer win
        let min_pen = min_penalty - vpen - vcpen;
        let t_threshold = (params.weight_toi / min_pen - 0.1) * params.horiz_time;
        if t_threshold - params.horiz_time > -f32::EPSILON {
            return min_penalty;
        }

        // Find min time of impact and exit amongst all obstacles
        let mut tmin = params.horiz_time;
        let mut side = 0.0;
        let mut nside = 0;

        for cir in &self.circles {
            // RVO
            let vab = vcand * 2.0 - vel - cir.vel;

            side += (dot_2d(cir.dp, vab) * 0.5 + 0.5)
                .min(dot_2d(cir.np, vab) * 2.0)
                .clamp(0.0, 1.0);
            nside += 1;

            let Some((mut htmin, htmax)) = sweep_circle_circle(pos, rad, vab, cir.p, cir.rad)
            else {
                continue;
            };

            // Handle overlapping obstacles
            if htmin < 0.0 && htmax > 0.0 {
                // Avoid more when overlapped
                htmin = -htmin * 0.5;
            }

            if htmin >= 0.0 && htmin < tmin {
                tmin = htmin;
                if tmin < t_threshold {
                    return min_penalty;
                }
            }
        }

        for seg in &self.segments {
            let htmin = if seg.touch {
                // Special case when the agent is very close to the segment
                let sdir = seg.q - seg.p;
                let snorm = Vec3::new(-sdir.z, 0.0, sdir.x);
                // If the velocity is pointing towards the segment, no collision
                if dot_2d(snorm, vcand) < 0.0 {
                    continue;
                }
                // Else immediate collision
                0.0
            } else {
                match intersect_ray_segment_2d(pos, vcand, seg.p, seg.q) {
                    Some(t) => t,
                    None => continue,
                }
            };

            // Avoid less when facing walls
            let htmin = htmin * 2.0;

            if htmin < tmin {
                tmin = htmin;
                if tmin < t_threshold {
                    return min_penalty;
                }
            }
        }

        // Normalize side bias, to prevent it dominating too much
        if nside > 0 {
            side /= nside as f32;
        }

        let spen = params.weight_side * side;
        let tpen = params.weight_toi * (1.0 / (0.1 + tmin * self.inv_horiz_time));

        let penalty = vpen + vcpen + spen + tpen;

        if let Some(debug_data) = debug {
            debug_data.add_sample(vcand, cs, penalty, vpen, vcpen, spen, tpen);
        }

        penalty
    }
}

/// Unit sampling pattern: the origin plus rings of points aligned to the
/// desired velocity, alternate rings rotated by half a division
fn sampling_pattern(dvel: Vec3, params: &ObstacleAvoidanceParams) -> Vec<(f32, f32)> {
    let nd = (params.adaptive_divs as usize).clamp(1, MAX_PATTERN_DIVS);
    let nr = (params.adaptive_rings as usize).clamp(1, MAX_PATTERN_RINGS);
    let da = (1.0 / nd as f32) * PI * 2.0;
    let (sa, ca) = da.sin_cos();

    let ddir0 = normalize_2d(Vec3::new(dvel.x, 0.0, dvel.z));
    let ddir1 = rotate_2d(ddir0, da * 0.5);

    let rotate_cw = |p: (f32, f32)| (p.0 * ca + p.1 * sa, -p.0 * sa + p.1 * ca);
    let rotate_ccw = |p: (f32, f32)| (p.0 * ca - p.1 * sa, p.0 * sa + p.1 * ca);

    let mut pattern = Vec::with_capacity(nd * nr + 1);
    pattern.push((0.0, 0.0));

    for j in 0..nr {
        let r = (nr - j) as f32 / nr as f32;
        let dir = if j % 2 == 0 { ddir0 } else { ddir1 };
        let first = (dir.x * r, dir.z * r);
        pattern.push(first);

        let mut last_right = first;
        let mut last_left = first;
        for _ in (1..nd.saturating_sub(1)).step_by(2) {
            last_right = rotate_cw(last_right);
            last_left = rotate_ccw(last_left);
            pattern.push(last_right);
            pattern.push(last_left);
        }

        if nd % 2 == 0 {
            pattern.push(rotate_ccw(last_left));
        }
    }

    pattern
}

fn clamp_speed(v: Vec3, vmax: f32) -> Vec3 {
    let speed_sqr = v.x * v.x + v.z * v.z;
    if vmax > 0.0 && speed_sqr > vmax * vmax {
        v * (vmax / speed_sqr.sqrt())
    } else {
        v
    }
}

fn normalize_by<F>(samples: &mut [Sample], field: F)
where
    F: Fn(&mut Sample) -> &mut f32,
{
    let mut min_pen = f32::MAX;
    let mut max_pen = -f32::MAX;
    for s in samples.iter_mut() {
        let v = *field(s);
        min_pen = min_pen.min(v);
        max_pen = max_pen.max(v);
    }
    let pen_range = max_pen - min_pen;
    let s = if pen_range > 0.001 { 1.0 / pen_range } else { 1.0 };
    for sample in samples.iter_mut() {
        let v = field(sample);
        *v = ((*v - min_pen) * s).clamp(0.0, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_space_follows_desired_velocity() {
        let mut query = ObstacleAvoidanceQuery::new(6, 8);
        let params = ObstacleAvoidanceParams::default();
        let dvel = Vec3::new(1.0, 0.0, 0.0);

        let (nvel, ns) =
            query.sample_velocity_adaptive(Vec3::ZERO, 0.5, 1.0, dvel, dvel, &params, None);
        assert!(ns > 0);
        assert!(nvel.distance(dvel) < 0.1);
        assert!(nvel.length() <= 1.0 + 1e-4);
    }

    #[test]
    fn test_head_on_obstacle_changes_velocity() {
        let mut query = ObstacleAvoidanceQuery::new(6, 8);
        let params = ObstacleAvoidanceParams::default();
        let dvel = Vec3::new(1.0, 0.0, 0.0);
        query.add_circle(Vec3::new(1.5, 0.0, 0.0), 0.5, Vec3::ZERO, Vec3::ZERO);

        let (nvel, _) =
            query.sample_velocity_adaptive(Vec3::ZERO, 0.5, 1.0, dvel, dvel, &params, None);
        assert!(nvel.distance(dvel) > 0.1);
        assert!(nvel.length() <= 1.0 + 1e-4);

        let (gvel, ns) =
            query.sample_velocity_grid(Vec3::ZERO, 0.5, 1.0, dvel, dvel, &params, None);
        assert!(ns > 0);
        assert!(gvel.distance(dvel) > 0.1);
        assert!(gvel.length() <= 1.0 + 1e-4);
    }

    #[test]
    fn test_sampling_is_deterministic() {
        let params = ObstacleAvoidanceParams::default();
        let run = || {
            let mut query = ObstacleAvoidanceQuery::new(6, 8);
            query.add_circle(
                Vec3::new(1.0, 0.0, 0.3),
                0.4,
                Vec3::new(-0.5, 0.0, 0.0),
                Vec3::new(-0.5, 0.0, 0.0),
            );
            query.add_segment(Vec3::new(-2.0, 0.0, 1.0), Vec3::new(2.0, 0.0, 1.0));
            query.sample_velocity_adaptive(
                Vec3::ZERO,
                0.4,
                2.0,
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(2.0, 0.0, 0.0),
                &params,
                None,
            )
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_capacity_limits() {
        let mut query = ObstacleAvoidanceQuery::new(2, 1);
        for i in 0..4 {
            query.add_circle(Vec3::new(i as f32, 0.0, 0.0), 0.5, Vec3::ZERO, Vec3::ZERO);
            query.add_segment(Vec3::ZERO, Vec3::X);
        }
        assert_eq!(query.get_obstacle_circle_count(), 2);
        assert_eq!(query.get_obstacle_segment_count(), 1);

        query.reset();
        assert_eq!(query.get_obstacle_circle_count(), 0);
        assert!(query.get_obstacle_circle(0).is_none());
    }

    #[test]
    fn test_sampling_pattern_size() {
        let params = ObstacleAvoidanceParams::default();
        let pattern = sampling_pattern(Vec3::X, &params);
        assert_eq!(pattern.len(), 1 + 7 * 2);

        let even = ObstacleAvoidanceParams {
            adaptive_divs: 8,
            ..params
        };
        assert_eq!(sampling_pattern(Vec3::X, &even).len(), 1 + 8 * 2);
    }

    #[test]
    fn test_debug_samples_normalized() {
        let mut query = ObstacleAvoidanceQuery::new(6, 8);
        let params = ObstacleAvoidanceParams::default();
        query.add_circle(Vec3::new(1.5, 0.0, 0.0), 0.5, Vec3::ZERO, Vec3::ZERO);

        let mut debug = ObstacleAvoidanceDebugData::new();
        debug.init(512);
        let dvel = Vec3::new(1.0, 0.0, 0.0);
        query.sample_velocity_adaptive(Vec3::ZERO, 0.5, 1.0, dvel, dvel, &params, Some(&mut debug));
        assert!(debug.get_sample_count() > 0);

        debug.normalize_samples();
        for i in 0..debug.get_sample_count() {
            let pen = debug.get_sample_penalty(i).unwrap_or(-1.0);
            assert!((0.0..=1.0).contains(&pen));
        }
    }
}
