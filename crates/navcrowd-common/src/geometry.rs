//! 2D geometry operations on the XZ plane
//!
//! The crowd treats the world as a height field: steering, avoidance and
//! string pulling all ignore the Y component. These helpers make that
//! explicit.

use glam::Vec3;

/// Squared tolerance used when comparing positions for equality.
const EQUAL_THRESHOLD_SQR: f32 = (1.0 / 16384.0) * (1.0 / 16384.0);

/// Calculate twice the signed area of a 2D triangle on the XZ plane.
///
/// The sign indicates on which side of the directed line `a -> b` the
/// point `c` lies:
/// - Positive: `c` is to the right (clockwise turn when looking down Y)
/// - Negative: `c` is to the left
/// - Zero: degenerate (collinear points)
#[inline]
pub fn tri_area_2d(a: Vec3, b: Vec3, c: Vec3) -> f32 {
    let abx = b.x - a.x;
    let abz = b.z - a.z;
    let acx = c.x - a.x;
    let acz = c.z - a.z;
    acx * abz - abx * acz
}

/// Calculate squared distance between two points on the XZ plane.
#[inline]
pub fn dist_sqr_2d(a: Vec3, b: Vec3) -> f32 {
    let dx = b.x - a.x;
    let dz = b.z - a.z;
    dx * dx + dz * dz
}

/// Calculate distance between two points on the XZ plane.
#[inline]
pub fn dist_2d(a: Vec3, b: Vec3) -> f32 {
    dist_sqr_2d(a, b).sqrt()
}

/// Dot product ignoring the Y component.
#[inline]
pub fn dot_2d(a: Vec3, b: Vec3) -> f32 {
    a.x * b.x + a.z * b.z
}

/// 2D perpendicular product (cross product magnitude on XZ plane).
#[inline]
pub fn perp_2d(u: Vec3, v: Vec3) -> f32 {
    u.z * v.x - u.x * v.z
}

/// Length of a vector ignoring the Y component.
#[inline]
pub fn length_2d(v: Vec3) -> f32 {
    (v.x * v.x + v.z * v.z).sqrt()
}

/// Normalizes the XZ part of a vector, returning zero for degenerate input.
#[inline]
pub fn normalize_2d(v: Vec3) -> Vec3 {
    let d = length_2d(v);
    if d == 0.0 {
        return Vec3::new(0.0, v.y, 0.0);
    }
    Vec3::new(v.x / d, v.y, v.z / d)
}

/// Rotates a vector around the Y axis by `ang` radians.
#[inline]
pub fn rotate_2d(v: Vec3, ang: f32) -> Vec3 {
    let (s, c) = ang.sin_cos();
    Vec3::new(v.x * c - v.z * s, v.y, v.x * s + v.z * c)
}

/// Checks whether two points are equal within a small tolerance.
#[inline]
pub fn vequal(a: Vec3, b: Vec3) -> bool {
    a.distance_squared(b) < EQUAL_THRESHOLD_SQR
}

/// Calculate the squared distance from a point to a segment on the XZ plane.
///
/// Returns the squared distance and the parametric position of the closest
/// point along the segment, clamped to `[0, 1]`.
pub fn dist_point_segment_sqr_2d(p: Vec3, a: Vec3, b: Vec3) -> (f32, f32) {
    let dx = b.x - a.x;
    let dz = b.z - a.z;
    let d = dx * dx + dz * dz;
    let mut t = dx * (p.x - a.x) + dz * (p.z - a.z);
    if d > 0.0 {
        t /= d;
    }
    t = t.clamp(0.0, 1.0);

    let px = a.x + t * dx - p.x;
    let pz = a.z + t * dz - p.z;
    (px * px + pz * pz, t)
}

/// Intersects a ray `ap + u * t` with the segment `bp..bq` on the XZ plane.
///
/// Returns the ray parameter `t` when the intersection lies within the unit
/// ray length and on the segment.
pub fn intersect_ray_segment_2d(ap: Vec3, u: Vec3, bp: Vec3, bq: Vec3) -> Option<f32> {
    let v = bq - bp;
    let w = ap - bp;
    let d = perp_2d(u, v);
    if d.abs() < 1e-6 {
        return None;
    }
    let inv = 1.0 / d;
    let t = perp_2d(v, w) * inv;
    if !(0.0..=1.0).contains(&t) {
        return None;
    }
    let s = perp_2d(u, w) * inv;
    if !(0.0..=1.0).contains(&s) {
        return None;
    }
    Some(t)
}

/// Sweeps a moving circle against a static circle on the XZ plane.
///
/// Returns the entry and exit times `(tmin, tmax)` in units of `v`, or `None`
/// when the circle does not move or never touches the obstacle.
pub fn sweep_circle_circle(c0: Vec3, r0: f32, v: Vec3, c1: Vec3, r1: f32) -> Option<(f32, f32)> {
    const EPS: f32 = 0.0001;
    let s = c1 - c0;
    let r = r0 + r1;
    let c = dot_2d(s, s) - r * r;
    let a = dot_2d(v, v);
    if a < EPS {
        return None;
    }
    let b = dot_2d(v, s);
    let d = b * b - a * c;
    if d < 0.0 {
        return None;
    }
    let inv_a = 1.0 / a;
    let rd = d.sqrt();
    Some(((b - rd) * inv_a, (b + rd) * inv_a))
}

/// Calculates the tween factor of `t` between `t0` and `t1`, clamped to `[0, 1]`.
#[inline]
pub fn tween(t: f32, t0: f32, t1: f32) -> f32 {
    if t1 - t0 <= f32::EPSILON {
        return 1.0;
    }
    ((t - t0) / (t1 - t0)).clamp(0.0, 1.0)
}
