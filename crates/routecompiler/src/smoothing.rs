//! Post-processing of the compiled track.
//!
//! The block pass produces a polyline: `Track.Turn` bends the track at a single
//!     point and cant jumps from one element to the next.
//! This module subdivides the track, replaces every sharp bend with a circular arc
//!     fitted through its neighbours, and computes the tangents that make cant change
//!     smoothly along the track.

use crate::events::TrackElement;
use crate::follower::{Pose, TrackFollower};
use geometry::Vector3;
use std::f64::consts::PI;

/// Squared change in horizontal direction above which a subdivision point is a bend.
const TURN_THRESHOLD: f64 = 0.0001;

/// Number of steps the fitted arc is shortened in while searching for the best end.
const SEARCH_STEPS: usize = 1000;

/// Bound on the normalized cant tangents of a segment, which keeps the
///     interpolated cant monotonic.
const MAXIMUM_TANGENT_NORM: f64 = 3.0;

/// Computes the cant tangents used by the follower to interpolate cant.
///
/// Tangents are the average of the neighbouring cant differences, limited so that
///     the cubic interpolation between two elements never overshoots.
pub fn compute_cant_tangents(elements: &mut [TrackElement]) {
    let n = elements.len();
    if n == 0 {
        return;
    }
    if n == 1 {
        elements[0].curve_cant_tangent = 0.0;
        return;
    }
    let deltas: Vec<f64> = elements.windows(2).map(|w| w[1].curve_cant - w[0].curve_cant).collect();
    let mut tangents = vec![0.0; n];
    tangents[0] = deltas[0];
    tangents[n - 1] = deltas[n - 2];
    for i in 1..n - 1 {
        tangents[i] = 0.5 * (deltas[i - 1] + deltas[i]);
    }
    for (i, delta) in deltas.iter().copied().enumerate() {
        if delta == 0.0 {
            tangents[i] = 0.0;
            tangents[i + 1] = 0.0;
            continue;
        }
        let a = tangents[i] / delta;
        let b = tangents[i + 1] / delta;
        let norm_squared = a * a + b * b;
        if norm_squared > MAXIMUM_TANGENT_NORM * MAXIMUM_TANGENT_NORM {
            let t = MAXIMUM_TANGENT_NORM / norm_squared.sqrt();
            tangents[i] = t * a * delta;
            tangents[i + 1] = t * b * delta;
        }
    }
    for (element, tangent) in elements.iter_mut().zip(tangents) {
        element.curve_cant_tangent = tangent;
    }
}

/// Subdivides every element and replaces bends with circular arcs.
///
/// Fitting an arc shortens the track, so the starting positions of all later
///     elements move back. Events keep their offsets and are moved to the next
///     element if they end up beyond the end of their own.
pub fn smooth_turns(elements: &mut Vec<TrackElement>, subdivisions: usize) {
    if subdivisions < 2 || elements.len() < 2 {
        return;
    }
    subdivide(elements, subdivisions);
    let turns = find_turns(elements, subdivisions);
    let mut shortage = 0.0;
    let mut fitted = 0;
    for (i, is_turn) in turns.iter().enumerate() {
        if *is_turn {
            if let Some(s) = fit_arc(elements, i) {
                shortage += s;
                fitted += 1;
            }
        }
    }
    log::debug!(
        "smoothing: {} elements, {fitted} arcs fitted, track shortened by {shortage:.3}m",
        elements.len()
    );
    relocate_events(elements);
}

/// Inserts `subdivisions - 1` interpolated elements after every element but the last.
///
/// The new elements copy the parameters of the element they split and have no events.
fn subdivide(elements: &mut Vec<TrackElement>, subdivisions: usize) {
    let length = elements.len();
    let mut follower = TrackFollower::new();
    let mut result = Vec::with_capacity((length - 1) * subdivisions + 1);
    for q in 0..length {
        result.push(elements[q].clone());
        let Some(next) = elements.get(q + 1) else {
            break;
        };
        let (start, end) = (elements[q].starting_track_position, next.starting_track_position);
        for m in 1..subdivisions {
            let r = m as f64 / subdivisions as f64;
            let p = (1.0 - r) * start + r * end;
            let pose = follower.update(elements, p);
            let mut midpoint = TrackElement {
                events: vec![],
                ..elements[q]
            };
            midpoint.starting_track_position = p;
            set_pose(&mut midpoint, &pose);
            midpoint.curve_cant = pose.curve_cant;
            midpoint.curve_cant_tangent = 0.0;
            result.push(midpoint);
        }
    }
    *elements = result;
}

/// Marks the original element boundaries where the direction changes abruptly.
fn find_turns(elements: &[TrackElement], subdivisions: usize) -> Vec<bool> {
    let mut turns = vec![false; elements.len()];
    let mut follower = TrackFollower::new();
    let last = elements.len() - 1;
    for i in (subdivisions..last).step_by(subdivisions) {
        let pose = follower.update(elements, just_before(elements, i));
        let d = elements[i].world_direction - pose.direction;
        turns[i] = d.x * d.x + d.z * d.z > TURN_THRESHOLD;
    }
    turns
}

/// Track position a hair before the start of element `i`.
fn just_before(elements: &[TrackElement], i: usize) -> f64 {
    0.00000001 * elements[i - 1].starting_track_position + 0.99999999 * elements[i].starting_track_position
}

/// Moves the follower to a position from slightly behind it.
fn settle(follower: &mut TrackFollower, elements: &[TrackElement], p: f64) -> Pose {
    follower.update(elements, p - 1.0);
    follower.update(elements, p)
}

fn set_pose(element: &mut TrackElement, pose: &Pose) {
    element.world_position = pose.position;
    element.world_direction = pose.direction;
    element.world_up = pose.up;
    element.world_side = pose.side;
}

/// Estimates the radius of the arc through the neighbours of a bend.
///
/// Each horizontal axis gives an estimate; if both do they must roughly agree.
fn estimate_radius(before: &TrackElement, after: &TrackElement) -> Option<f64> {
    let s = before.world_side - after.world_side;
    let d = after.world_position - before.world_position;
    let rx = if s.x * s.x > 0.000001 { d.x / s.x } else { 0.0 };
    let rz = if s.z * s.z > 0.000001 { d.z / s.z } else { 0.0 };
    let r = match (rx != 0.0, rz != 0.0) {
        (true, true) => {
            if rx.signum() != rz.signum() {
                return None;
            }
            let f = rx / rz;
            if (f > -1.1 && f < -0.9) || (f > 0.9 && f < 1.1) {
                (rx * rz).abs().sqrt() * rx.signum()
            } else {
                return None;
            }
        }
        (true, false) => rx,
        (false, true) => rz,
        (false, false) => return None,
    };
    (r * r > 1.0).then_some(r)
}

/// Replaces the bend at element `i` by an arc; returns how much the track was shortened.
fn fit_arc(elements: &mut [TrackElement], i: usize) -> Option<f64> {
    let r = estimate_radius(&elements[i - 1], &elements[i + 1])?;
    let mut follower = TrackFollower::new();
    elements[i - 1].curve_radius = r;
    let pose = settle(&mut follower, elements, just_before(elements, i));
    elements[i].curve_radius = r;
    set_pose(&mut elements[i], &pose);
    let mut shortage = shorten(elements, i, &mut follower);

    // Turn element i about the vertical so that its arc ends as close as possible to element i + 1.
    let pose = settle(&mut follower, elements, just_before(elements, i + 1));
    let target = elements[i + 1].world_position;
    let origin = elements[i].world_position;
    let sa = horizontal_norm(pose.position - origin);
    let sb = horizontal_norm(target - origin);
    let sc = horizontal_norm(target - pose.position);
    let denominator = 2.0 * sa * sb;
    if denominator != 0.0 {
        let value = (sa * sa + sb * sb - sc * sc) / denominator;
        let angle = if value < -1.0 {
            PI
        } else if value > 1.0 {
            0.0
        } else {
            value.acos()
        };
        let original = elements[i].clone();
        let mut best = (f64::MAX, 0);
        for j in -1..=1 {
            rotate_about_vertical(&mut elements[i], &original, j as f64 * angle);
            let pose = settle(&mut follower, elements, just_before(elements, i + 1));
            let t = (elements[i + 1].world_position - pose.position).norm_squared();
            if t < best.0 {
                best = (t, j);
            }
        }
        rotate_about_vertical(&mut elements[i], &original, best.1 as f64 * angle);
        shortage += shorten(elements, i, &mut follower);
    }

    // Tilt element i so that its arc reaches the height of element i + 1.
    let pose = settle(&mut follower, elements, just_before(elements, i + 1));
    let origin = elements[i].world_position;
    let b = elevation(pose.position - origin) - elevation(elements[i + 1].world_position - origin);
    if b * b > 0.00000001 {
        let (sin, cos) = b.sin_cos();
        let side = elements[i].world_side;
        elements[i].world_direction = elements[i].world_direction.rotate_about(side, cos, sin);
        elements[i].world_up = elements[i].world_up.rotate_about(side, cos, sin);
    }
    Some(shortage)
}

/// Moves the end of element `i` back to where its arc passes closest to element `i + 1`.
fn shorten(elements: &mut [TrackElement], i: usize, follower: &mut TrackFollower) -> f64 {
    let target = elements[i + 1].world_position;
    let end = elements[i + 1].starting_track_position;
    let pose = settle(follower, elements, just_before(elements, i + 1));
    let mut best = (target - pose.position).norm_squared();
    let mut best_j = 0;
    let step = (end - elements[i].starting_track_position) / SEARCH_STEPS as f64;
    for j in 1..SEARCH_STEPS - 1 {
        let pose = follower.update(elements, end - j as f64 * step);
        let t = (target - pose.position).norm_squared();
        if t < best {
            best = t;
            best_j = j;
        } else {
            break;
        }
    }
    let s = best_j as f64 * step;
    for element in &mut elements[i + 1..] {
        element.starting_track_position -= s;
    }
    s
}

fn rotate_about_vertical(element: &mut TrackElement, original: &TrackElement, angle: f64) {
    let (sin, cos) = angle.sin_cos();
    element.world_direction = original.world_direction.rotate_about(Vector3::UP, cos, sin);
    element.world_up = original.world_up.rotate_about(Vector3::UP, cos, sin);
    element.world_side = original.world_side.rotate_about(Vector3::UP, cos, sin);
}

fn horizontal_norm(v: Vector3) -> f64 {
    (v.x * v.x + v.z * v.z).sqrt()
}

fn elevation(v: Vector3) -> f64 {
    (v.y / horizontal_norm(v)).atan()
}

/// Moves events that lie beyond the end of their element to the following element.
///
/// The absolute track position of every event is unchanged.
pub fn relocate_events(elements: &mut [TrackElement]) {
    for i in 0..elements.len().saturating_sub(1) {
        let start = elements[i].starting_track_position;
        let end = elements[i + 1].starting_track_position;
        let (stay, moved): (Vec<_>, Vec<_>) = std::mem::take(&mut elements[i].events)
            .into_iter()
            .partition(|e| start + e.delta < end);
        elements[i].events = stay;
        for mut event in moved {
            event.delta += start - end;
            elements[i + 1].events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, TrackEvent};
    use approx::assert_relative_eq;

    fn with_cants(cants: &[f64]) -> Vec<TrackElement> {
        cants
            .iter()
            .enumerate()
            .map(|(i, c)| TrackElement {
                starting_track_position: 25.0 * i as f64,
                world_position: Vector3::new(0.0, 0.0, 25.0 * i as f64),
                curve_cant: *c,
                ..Default::default()
            })
            .collect()
    }

    fn tangents(elements: &[TrackElement]) -> Vec<f64> {
        elements.iter().map(|e| e.curve_cant_tangent).collect()
    }

    #[test]
    fn cant_tangents_average_neighbours() {
        let mut elements = with_cants(&[0.0, 0.1, 0.1, 0.0]);
        compute_cant_tangents(&mut elements);
        let got = tangents(&elements);
        let want = [0.1, 0.0, 0.0, -0.1];
        for (g, w) in got.iter().zip(want) {
            assert_relative_eq!(*g, w, epsilon = 1e-12);
        }
    }

    #[test]
    fn cant_tangents_single_element() {
        let mut elements = with_cants(&[0.2]);
        elements[0].curve_cant_tangent = 4.0;
        compute_cant_tangents(&mut elements);
        assert_eq!(tangents(&elements), vec![0.0]);
    }

    #[test]
    fn cant_tangents_are_bounded() {
        let mut elements = with_cants(&[0.0, 10.0, 10.1, 3.0, 3.0]);
        compute_cant_tangents(&mut elements);
        for i in 0..elements.len() - 1 {
            let delta = elements[i + 1].curve_cant - elements[i].curve_cant;
            if delta == 0.0 {
                assert_eq!(elements[i].curve_cant_tangent, 0.0);
                continue;
            }
            let a = elements[i].curve_cant_tangent / delta;
            let b = elements[i + 1].curve_cant_tangent / delta;
            assert!(a * a + b * b <= 9.0 + 1e-9, "segment {i}: {a} {b}");
        }
    }

    #[test]
    fn relocation_keeps_absolute_positions() {
        let mut elements = with_cants(&[0.0, 0.0, 0.0]);
        elements[0].push(60.0, Event::PointSound);
        elements[0].push(10.0, Event::StationPassAlarm);
        elements[1].push(30.0, Event::TrackEnd(25.0));
        relocate_events(&mut elements);
        assert_eq!(elements[0].events, vec![TrackEvent::new(10.0, Event::StationPassAlarm)]);
        assert!(elements[1].events.is_empty());
        assert_eq!(
            elements[2].events,
            vec![
                TrackEvent::new(5.0, Event::TrackEnd(25.0)),
                TrackEvent::new(10.0, Event::PointSound),
            ]
        );
    }

    /// Four straight elements with a bend of `angle` to the right at the third.
    fn bent_track(angle: f64) -> Vec<TrackElement> {
        let (sin, cos) = angle.sin_cos();
        let bent = |p: Vector3| TrackElement {
            world_position: p,
            world_direction: Vector3::new(sin, 0.0, cos),
            world_side: Vector3::new(cos, 0.0, -sin),
            ..Default::default()
        };
        let mut elements = vec![
            TrackElement::default(),
            TrackElement {
                world_position: Vector3::new(0.0, 0.0, 25.0),
                ..Default::default()
            },
            bent(Vector3::new(0.0, 0.0, 50.0)),
            bent(Vector3::new(25.0 * sin, 0.0, 50.0 + 25.0 * cos)),
        ];
        for (i, e) in elements.iter_mut().enumerate() {
            e.starting_track_position = 25.0 * i as f64;
        }
        elements
    }

    #[test]
    fn straight_track_is_only_subdivided() {
        let mut elements = with_cants(&[0.0, 0.0, 0.0]);
        smooth_turns(&mut elements, 5);
        assert_eq!(elements.len(), 11);
        for (i, e) in elements.iter().enumerate() {
            assert_relative_eq!(e.starting_track_position, 5.0 * i as f64, epsilon = 1e-9);
            assert_relative_eq!(e.world_position.z, 5.0 * i as f64, epsilon = 1e-9);
            assert_eq!(e.curve_radius, 0.0);
        }
    }

    #[test]
    fn bend_becomes_an_arc() {
        let angle: f64 = 0.1;
        let mut elements = bent_track(angle);
        elements[1].push(20.0, Event::StationPassAlarm);
        elements[3].push(0.0, Event::PointSound);
        smooth_turns(&mut elements, 5);
        assert_eq!(elements.len(), 16);

        let radius = 5.0 / (0.5 * angle).tan();
        assert_relative_eq!(elements[9].curve_radius, radius, epsilon = 1e-6);
        assert_relative_eq!(elements[10].curve_radius, radius, epsilon = 1e-6);

        let events: usize = elements.iter().map(|e| e.events.len()).sum();
        assert_eq!(events, 2);
        assert_eq!(elements[9].events.len(), 1);
        assert_relative_eq!(elements[9].events[0].delta, 0.0, epsilon = 1e-9);
        assert_eq!(elements[15].events, vec![TrackEvent::new(0.0, Event::PointSound)]);

        for w in elements.windows(2) {
            assert!(w[0].starting_track_position < w[1].starting_track_position);
        }
    }
}
