//! Built-in objects
//!
//! Old routes rely on a handful of objects that the route never defines:
//!     signals for `Track.Signal` without a matching `Signal(n)`,
//!     speed limit and stop posts, the default ATS beacons and overhead line poles.
//! These are generated here as simple untextured boxes.
//! Speed limit numerals are the exception: their digits are textures registered
//!     from the compatibility folder while the route is compiled.

use crate::assets::{Material, StaticObject, UnifiedObject};
use crate::structures::{SignalDefinition, StructureTables, Table};
use geometry::Vector3;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Aspect numbers of the built-in signals.
///
/// Index 8 is the repeating signal used by `Track.Relay`.
const SIGNAL_ASPECTS: [&[i32]; 9] = [
    &[0, 2],
    &[0, 4],
    &[0, 2, 4],
    &[0, 1, 2, 4],
    &[0, 2, 3, 4],
    &[0, 1, 2, 3, 4],
    &[0, 2, 3, 4, 5],
    &[0, 1, 2, 3, 4, 5],
    &[0, 2, 4],
];

/// Index of the relay signal in [CompatibilityObjects::signals].
pub const RELAY_SIGNAL: usize = 8;

/// Kinds of the built-in ATS beacons, in the order of their default objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconObject {
    /// ATS-S uncontrolled.
    S = 0,
    /// ATS-SN controlled.
    Sn = 1,
    /// Departure signal check.
    FalseStart = 2,
    /// ATS-P pattern origin.
    POrigin = 3,
    /// ATS-P immediate stop.
    PStop = 4,
}

#[derive(Debug, Clone)]
pub struct CompatibilityObjects {
    pub signals: Vec<Rc<SignalDefinition>>,
    pub signal_post: Rc<UnifiedObject>,
    pub limit_post_straight: Rc<UnifiedObject>,
    pub limit_post_left: Rc<UnifiedObject>,
    pub limit_post_right: Rc<UnifiedObject>,
    pub limit_post_infinite: Rc<UnifiedObject>,
    /// Numeral plates; material `k` shows digit `k`.
    pub limit_one_digit: StaticObject,
    pub limit_two_digits: StaticObject,
    pub limit_three_digits: StaticObject,
    pub stop_post: Rc<UnifiedObject>,
    /// Default beacon objects, indexed by [BeaconObject].
    pub beacons: [Rc<UnifiedObject>; 5],
    /// Overhead line poles spanning 0 to 3 additional rails.
    pub poles: [Rc<UnifiedObject>; 4],
    pub limit_graphics_folder: PathBuf,
}

impl CompatibilityObjects {
    pub fn new(compatibility_folder: &Path) -> CompatibilityObjects {
        let shared = |o: StaticObject| Rc::new(UnifiedObject::Static(o));
        let plate = |x: f64| cuboid(Vector3::new(x - 0.15, 2.0, 0.0), 0.3, 0.4, 0.02);
        let post = |x: f64| cuboid(Vector3::new(x - 0.03, 0.0, 0.0), 0.06, 2.0, 0.06);
        let limit_post = |arrow: Option<f64>| {
            let mut object = post(0.0);
            object.join(cuboid(Vector3::new(-0.2, 2.4, 0.0), 0.4, 0.3, 0.02));
            if let Some(x) = arrow {
                object.join(cuboid(Vector3::new(x, 2.7, 0.0), 0.1, 0.1, 0.02));
            }
            object
        };
        let numerals = |n: usize| {
            let mut object = StaticObject::default();
            for k in 0..n {
                object.join(plate(0.3 * (k as f64 - 0.5 * (n as f64 - 1.0))));
            }
            object
        };
        let beacon = |length: f64, width: f64| cuboid(Vector3::new(-0.5 * width, 0.0, 0.0), width, 0.05, length);
        let pole = |mode: i32| {
            let mut object = cuboid(Vector3::new(-0.1, 0.0, -0.1), 0.2, 7.0, 0.2);
            if mode > 0 {
                let span = 3.8 * mode as f64;
                object.join(cuboid(Vector3::new(-span, 6.5, -0.05), span + 0.5, 0.1, 0.1));
                object.join(cuboid(Vector3::new(-span - 0.1, 0.0, -0.1), 0.2, 7.0, 0.2));
            } else {
                object.join(cuboid(Vector3::new(-2.5, 6.5, -0.05), 2.6, 0.1, 0.1));
            }
            object
        };
        CompatibilityObjects {
            signals: SIGNAL_ASPECTS
                .iter()
                .map(|aspects| {
                    Rc::new(SignalDefinition::Compatibility {
                        numbers: aspects.to_vec(),
                        objects: (0..aspects.len()).map(|lamp| signal_head(aspects.len(), lamp)).collect(),
                    })
                })
                .collect(),
            signal_post: shared(post(0.0)),
            limit_post_straight: shared(limit_post(None)),
            limit_post_left: shared(limit_post(Some(-0.3))),
            limit_post_right: shared(limit_post(Some(0.2))),
            limit_post_infinite: shared(cuboid(Vector3::new(-0.2, 2.0, 0.0), 0.4, 0.4, 0.02)),
            limit_one_digit: numerals(1),
            limit_two_digits: numerals(2),
            limit_three_digits: numerals(3),
            stop_post: shared({
                let mut object = post(0.0);
                object.join(cuboid(Vector3::new(-0.25, 2.0, 0.0), 0.5, 0.25, 0.02));
                object
            }),
            beacons: [
                shared(beacon(0.3, 0.2)),
                shared(beacon(0.5, 0.2)),
                shared(beacon(0.3, 0.4)),
                shared(beacon(0.5, 0.4)),
                shared(beacon(0.7, 0.4)),
            ],
            poles: [shared(pole(0)), shared(pole(1)), shared(pole(2)), shared(pole(3))],
            limit_graphics_folder: compatibility_folder.join("Limits").join("Graphics"),
        }
    }

    /// Built-in signal for a `Track.Signal` type, with the section aspects it uses.
    pub fn signal_for_type(&self, num: i32) -> (Vec<i32>, Rc<SignalDefinition>) {
        let (aspects, index): (&[i32], usize) = match num {
            1 => (&[0, 2, 3], 4),
            2 => (&[0, 2], 0),
            -2 => (&[0, 4], 1),
            3 | -3 => (&[0, 2, 4], 2),
            4 => (&[0, 1, 2, 4], 3),
            -4 => (&[0, 2, 3, 4], 4),
            5 => (&[0, 1, 2, 3, 4], 5),
            -5 => (&[0, 2, 3, 4, 5], 6),
            6 => (&[0, 1, 2, 3, 4, 5], 7),
            _ => (&[0, 2], 0),
        };
        (aspects.to_vec(), self.signals[index].clone())
    }

    /// Registers the built-in poles as type 0 of each pole mode, unless the route
    ///     already defines them.
    pub fn install_poles(&self, structures: &mut StructureTables) {
        for (mode, pole) in self.poles.iter().enumerate() {
            let table: &mut Table<Rc<UnifiedObject>> = structures.poles.entry_or_default(mode as i32);
            if !table.contains(0) {
                table.define(0, pole.clone());
            }
        }
    }

    pub fn beacon(&self, kind: BeaconObject) -> Rc<UnifiedObject> {
        self.beacons[kind as usize].clone()
    }
}

/// A signal head with one lit lamp.
fn signal_head(lamps: usize, lit: usize) -> StaticObject {
    let height = 0.3 * lamps as f64;
    let mut object = cuboid(Vector3::new(-0.2, 0.0, 0.0), 0.4, height, 0.2);
    object.join(cuboid(Vector3::new(-0.1, 0.05 + 0.3 * lit as f64, -0.02), 0.2, 0.2, 0.02));
    object
}

/// An axis aligned box with its lowest corner at `origin` and one material.
fn cuboid(origin: Vector3, width: f64, height: f64, depth: f64) -> StaticObject {
    let mut vertices = Vec::with_capacity(8);
    for y in [0.0, height] {
        for (x, z) in [(0.0, 0.0), (0.0, depth), (width, depth), (width, 0.0)] {
            vertices.push(origin + Vector3::new(x, y, z));
        }
    }
    StaticObject {
        vertices,
        materials: vec![Material::default()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_states_match_aspects() {
        let objects = CompatibilityObjects::new(Path::new("compat"));
        for (i, signal) in objects.signals.iter().enumerate() {
            match signal.as_ref() {
                SignalDefinition::Compatibility { numbers, objects } => {
                    assert_eq!(numbers.as_slice(), SIGNAL_ASPECTS[i]);
                    assert_eq!(objects.len(), numbers.len());
                }
                other => panic!("unexpected signal {other:?}"),
            }
        }
    }

    #[test]
    fn numerals_have_one_material_per_digit() {
        let objects = CompatibilityObjects::new(Path::new("compat"));
        assert_eq!(objects.limit_one_digit.materials.len(), 1);
        assert_eq!(objects.limit_two_digits.materials.len(), 2);
        assert_eq!(objects.limit_three_digits.materials.len(), 3);
        assert_eq!(objects.limit_graphics_folder, Path::new("compat/Limits/Graphics"));
    }

    #[test]
    fn install_poles_keeps_route_poles() {
        let objects = CompatibilityObjects::new(Path::new("compat"));
        let mut structures = StructureTables::default();
        let own = Rc::new(UnifiedObject::Static(StaticObject::default()));
        structures.poles.entry_or_default(1).define(0, own.clone());
        objects.install_poles(&mut structures);
        assert_eq!(structures.poles.len(), 4);
        assert_eq!(structures.poles.get(1).and_then(|t| t.get(0)), Some(&own));
        assert!(structures.poles.get(3).is_some_and(|t| t.contains(0)));
    }

    #[test]
    fn signal_for_type_falls_back_to_two_aspects() {
        let objects = CompatibilityObjects::new(Path::new("compat"));
        let (aspects, _) = objects.signal_for_type(9);
        assert_eq!(aspects, vec![0, 2]);
        let (aspects, signal) = objects.signal_for_type(-4);
        assert_eq!(aspects, vec![0, 2, 3, 4]);
        assert_eq!(signal, objects.signals[4]);
    }
}
