//! Querying the compiled track at arbitrary track positions.
//!
//! Elements only store the pose at their start.
//! Everything in between is reconstructed here from the element's curve radius,
//!     the same way a train running along the track would see it.

use crate::events::TrackElement;
use geometry::Vector3;

/// Where the track is and how it is oriented at one track position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: Vector3,
    pub direction: Vector3,
    pub up: Vector3,
    pub side: Vector3,
    pub curve_radius: f64,
    pub curve_cant: f64,
    pub adhesion_multiplier: f64,
}

impl Default for Pose {
    fn default() -> Self {
        Pose {
            position: Vector3::ZERO,
            direction: Vector3::FORWARD,
            up: Vector3::UP,
            side: Vector3::RIGHT,
            curve_radius: 0.0,
            curve_cant: 0.0,
            adhesion_multiplier: 1.0,
        }
    }
}

/// Walks along a list of track elements.
///
/// The follower remembers the element it was last on, so a sequence of nearby
///     queries only ever looks at a few elements.
/// The elements are passed to every call rather than borrowed for the follower's
///     lifetime so that callers can edit the track between queries.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackFollower {
    element: usize,
    track_position: f64,
}

impl TrackFollower {
    pub fn new() -> Self {
        Default::default()
    }

    /// Index of the element the follower is on.
    pub fn element(&self) -> usize {
        self.element
    }

    pub fn track_position(&self) -> f64 {
        self.track_position
    }

    /// Moves the follower to a track position and returns the pose there.
    ///
    /// Positions before the first element are extrapolated from the first element.
    pub fn update(&mut self, elements: &[TrackElement], track_position: f64) -> Pose {
        self.track_position = track_position;
        if elements.is_empty() {
            self.element = 0;
            return Pose::default();
        }
        let mut i = self.element.min(elements.len() - 1);
        while i > 0 && track_position < elements[i].starting_track_position {
            i -= 1;
        }
        while i + 1 < elements.len() && track_position >= elements[i + 1].starting_track_position {
            i += 1;
        }
        self.element = i;
        pose_in_element(elements, i, track_position)
    }
}

fn pose_in_element(elements: &[TrackElement], i: usize, track_position: f64) -> Pose {
    let e = &elements[i];
    let db = track_position - e.starting_track_position;
    let mut pose = Pose {
        position: e.world_position,
        direction: e.world_direction,
        up: e.world_up,
        side: e.world_side,
        curve_radius: e.curve_radius,
        curve_cant: e.curve_cant,
        adhesion_multiplier: e.adhesion_multiplier,
    };
    if db == 0.0 {
        return pose;
    }
    let r = e.curve_radius;
    if r != 0.0 {
        let d = e.world_direction;
        let p = d.y / (d.x * d.x + d.z * d.z).sqrt();
        let s = db / (1.0 + p * p).sqrt();
        let h = s * p;
        let b = s / r.abs();
        let f = 2.0 * r * r * (1.0 - b.cos());
        let c = db.signum() * f.max(0.0).sqrt();
        let a = 0.5 * r.signum() * b;
        let (sin_a, cos_a) = a.sin_cos();
        let mut heading = Vector3::new(d.x, 0.0, d.z).normalize();
        heading = heading.rotate_about(Vector3::UP, cos_a, sin_a);
        pose.position = e.world_position + Vector3::new(c * heading.x, h, c * heading.z);
        heading = heading.rotate_about(Vector3::UP, cos_a, sin_a);
        pose.direction = Vector3::new(heading.x, p, heading.z).normalize();
        let (sin_2a, cos_2a) = (2.0 * a).sin_cos();
        pose.side = e.world_side.rotate_about(Vector3::UP, cos_2a, sin_2a);
        pose.up = pose.direction.cross(pose.side);
    } else {
        pose.position = e.world_position + e.world_direction * db;
        pose.curve_radius = 0.0;
    }
    if let Some(next) = elements.get(i + 1) {
        let span = next.starting_track_position - e.starting_track_position;
        let t = if span > 0.0 { (db / span).clamp(0.0, 1.0) } else { 0.0 };
        pose.curve_cant = hermite(
            t,
            e.curve_cant,
            e.curve_cant_tangent,
            next.curve_cant,
            next.curve_cant_tangent,
        );
    }
    pose
}

/// Cubic Hermite interpolation on `[0,1]` between two values with the given tangents.
pub fn hermite(t: f64, p0: f64, m0: f64, p1: f64, m1: f64) -> f64 {
    let t2 = t * t;
    let t3 = t2 * t;
    (2.0 * t3 - 3.0 * t2 + 1.0) * p0 + (t3 - 2.0 * t2 + t) * m0 + (-2.0 * t3 + 3.0 * t2) * p1 + (t3 - t2) * m1
}
