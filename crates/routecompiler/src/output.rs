//! The compiled route.
//!
//! Everything in this module is produced by [crate::compile] and handed to the
//!     consumer unchanged: the track element timeline plus the route wide tables
//!     of stations, sections, backgrounds and scenery placements.

use crate::assets::{SoundHandle, TextureHandle, UnifiedObject};
use crate::events::TrackElement;
use geometry::{Transformation, Vector3};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::Rc;

/// An opaque RGB color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Color24 {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color24 {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Color24 { r, g, b }
    }

    pub const GREY: Color24 = Color24::new(128, 128, 128);
    pub const WHITE: Color24 = Color24::new(255, 255, 255);
}

/// Distance at which fog starts when a route does not define any.
pub const NO_FOG_START: f64 = 800.0;

/// Distance at which fog is total when a route does not define any.
pub const NO_FOG_END: f64 = 1600.0;

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Fog {
    pub start: f64,
    pub end: f64,
    pub color: Color24,
    /// Track position at which this fog is fully in effect.
    pub track_position: f64,
}

impl Default for Fog {
    fn default() -> Self {
        Fog {
            start: NO_FOG_START,
            end: NO_FOG_END,
            color: Color24::GREY,
            track_position: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StopMode {
    #[default]
    AllStop,
    AllPass,
    PlayerStop,
    PlayerPass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StationKind {
    #[default]
    Normal,
    ChangeEnds,
    Terminal,
    /// The train is moved to the station with the given index after departure.
    Jump(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SafetySystem {
    #[default]
    Ats,
    Atc,
}

/// A stop point within a station.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StationStop {
    pub track_position: f64,
    pub forward_tolerance: f64,
    pub backward_tolerance: f64,
    /// Number of cars the stop point applies to, or 0 for every train.
    pub cars: i32,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Station {
    pub name: String,
    /// Arrival time in seconds after midnight.
    pub arrival_time: Option<f64>,
    /// Departure time in seconds after midnight.
    pub departure_time: Option<f64>,
    pub stop_mode: StopMode,
    pub kind: StationKind,
    /// Minimum halt in seconds.
    pub stop_time: f64,
    pub open_left_doors: bool,
    pub open_right_doors: bool,
    /// Whether the departure signal stays red until the train is ready to leave.
    pub force_stop_signal: bool,
    pub safety_system: SafetySystem,
    pub arrival_sound: Option<SoundHandle>,
    pub departure_sound: Option<SoundHandle>,
    /// Passenger load as a fraction of capacity.
    pub passenger_ratio: f64,
    pub timetable_day: Option<TextureHandle>,
    pub timetable_night: Option<TextureHandle>,
    pub reopen_door: f64,
    pub reopen_station_limit: i32,
    pub interference_in_door: f64,
    pub max_interfering_object_rate: i32,
    /// Track position of the command that defined the station.
    pub default_track_position: f64,
    pub stops: Vec<StationStop>,
    /// Where station sounds are played from.
    pub sound_origin: Vector3,
    /// Placeholder stations, e.g. signal control points, are not shown to the player.
    pub dummy: bool,
}

impl Default for Station {
    fn default() -> Self {
        Station {
            name: String::new(),
            arrival_time: None,
            departure_time: None,
            stop_mode: StopMode::AllStop,
            kind: StationKind::Normal,
            stop_time: 15.0,
            open_left_doors: true,
            open_right_doors: true,
            force_stop_signal: false,
            safety_system: SafetySystem::Ats,
            arrival_sound: None,
            departure_sound: None,
            passenger_ratio: 1.0,
            timetable_day: None,
            timetable_night: None,
            reopen_door: 0.0,
            reopen_station_limit: 0,
            interference_in_door: 0.0,
            max_interfering_object_rate: 10,
            default_track_position: 0.0,
            stops: vec![],
            sound_origin: Vector3::ZERO,
            dummy: false,
        }
    }
}

impl Station {
    /// Index of the stop point that applies to a train with the given number of cars.
    ///
    /// The first stop point that is long enough for the train, or that applies to every
    ///     train, is used. If none is, the last stop point is used.
    pub fn stop_index(&self, cars: i32) -> Option<usize> {
        self.stops
            .iter()
            .position(|stop| cars <= stop.cars || stop.cars == 0)
            .or(self.stops.len().checked_sub(1))
    }

    /// Whether the player's train stops at this station.
    pub fn player_stops(&self) -> bool {
        matches!(self.stop_mode, StopMode::AllStop | StopMode::PlayerStop)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SectionKind {
    /// The aspect is the one at the position given by the number of free sections ahead.
    #[default]
    IndexBased,
    /// The aspect is the smallest one that is at least the number of free sections ahead.
    ValueBased,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SectionAspect {
    pub number: i32,
    /// Speed limit in meters per second; infinite for no restriction.
    pub speed: f64,
}

/// A signalling block.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Section {
    pub track_position: f64,
    pub aspects: Vec<SectionAspect>,
    pub kind: SectionKind,
    pub previous: Option<usize>,
    pub next: Option<usize>,
    /// Station whose departure this section's signal controls.
    pub station: Option<usize>,
    /// Whether the section has no visible signal.
    pub invisible: bool,
}

impl Section {
    /// The section that exists before any `Track.Section` command.
    pub fn initial() -> Section {
        Section {
            track_position: 0.0,
            aspects: vec![
                SectionAspect { number: 0, speed: 0.0 },
                SectionAspect {
                    number: 4,
                    speed: f64::INFINITY,
                },
            ],
            kind: SectionKind::ValueBased,
            previous: None,
            next: None,
            station: None,
            invisible: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PointOfInterest {
    pub track_position: f64,
    /// Camera offset from the rail, in the rail's coordinates.
    pub offset: Vector3,
    pub yaw: f64,
    pub pitch: f64,
    pub roll: f64,
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Background {
    pub texture: Option<TextureHandle>,
    /// Number of times the texture repeats around the horizon.
    pub repetitions: i32,
    /// Whether the texture keeps its aspect ratio instead of filling the view height.
    pub keep_aspect_ratio: bool,
}

impl Background {
    pub fn new(texture: Option<TextureHandle>) -> Self {
        Background {
            texture,
            repetitions: 6,
            keep_aspect_ratio: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MessageColor {
    Black,
    Gray,
    #[default]
    White,
    Red,
    Orange,
    Green,
    Blue,
    Magenta,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MarkerMessage {
    Image(TextureHandle),
    Text { text: String, color: MessageColor },
}

/// A message shown to the driver over a span of track.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Marker {
    pub start: f64,
    pub end: f64,
    pub message: MarkerMessage,
}

/// A point of the preceding train's schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PreTrainPoint {
    /// Seconds after midnight.
    pub time: f64,
    pub track_position: f64,
}

/// A point from which the sound of passing trains is picked up.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Microphone {
    pub position: Vector3,
    pub track_position: f64,
    pub backward_tolerance: f64,
    pub forward_tolerance: f64,
}

/// A sound looping at a fixed place in the world.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WorldSound {
    pub buffer: SoundHandle,
    pub position: Vector3,
    pub track_position: f64,
}

/// A scenery object placed in the world.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ObjectPlacement {
    pub object: Rc<UnifiedObject>,
    pub position: Vector3,
    /// Orientation of the track at the placement.
    pub base: Transformation,
    /// Orientation of the object relative to the track.
    pub aux: Transformation,
    /// The object is only visible while the camera is between these track positions.
    pub starting_distance: f64,
    pub ending_distance: f64,
    pub track_position: f64,
    /// Brightness of the placement's daytime texture, in `[0,1]`.
    pub brightness: f64,
    /// Section whose aspect drives an animated object, e.g. a signal.
    pub section: Option<usize>,
}

/// Values set with the `Route` namespace.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Environment {
    /// Track gauge in meters.
    pub gauge: f64,
    /// Initial mode of the train's safety systems: -1, 0 or 1.
    pub initial_safety_mode: i32,
    pub acceleration_due_to_gravity: f64,
    /// Start time of the simulation in seconds after midnight.
    pub start_time: Option<f64>,
    pub elevation: f64,
    /// Temperature in kelvin.
    pub temperature: f64,
    /// Pressure in pascal.
    pub pressure: f64,
    pub ambient_light: Color24,
    pub directional_light: Color24,
    /// Direction the directional light shines from.
    pub light_direction: Vector3,
    /// Camera mode at the start of the simulation.
    pub initial_viewpoint: i32,
    pub developer_id: Option<String>,
}

impl Default for Environment {
    fn default() -> Self {
        let theta = 60.0_f64.to_radians();
        let phi = (-26.565051177078_f64).to_radians();
        Environment {
            gauge: 1.435,
            initial_safety_mode: 0,
            acceleration_due_to_gravity: 9.80665,
            start_time: None,
            elevation: 0.0,
            temperature: 293.15,
            pressure: 101325.0,
            ambient_light: Color24::new(160, 160, 160),
            directional_light: Color24::new(160, 160, 160),
            light_direction: light_direction(theta, phi),
            initial_viewpoint: 0,
            developer_id: None,
        }
    }
}

/// Direction a light at the given altitude and azimuth, in radians, shines from.
pub fn light_direction(theta: f64, phi: f64) -> Vector3 {
    let dx = theta.cos() * phi.sin();
    let dy = -theta.sin();
    let dz = theta.cos() * phi.cos();
    Vector3::new(-dx, -dy, -dz)
}

/// Values set with the `Train` namespace.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrainSettings {
    /// Folder of the default train.
    pub folder: Option<String>,
    /// Seconds between preceding trains.
    pub intervals: Vec<f64>,
    /// Maximum speed of preceding trains in meters per second.
    pub velocity: Option<f64>,
    /// Destination shown by the player's train at the start.
    pub initial_destination: Option<i32>,
}

/// The result of compiling a route.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CompiledRoute {
    pub elements: Vec<TrackElement>,
    pub stations: Vec<Station>,
    pub sections: Vec<Section>,
    /// Speed for each signal aspect in meters per second.
    pub signal_speeds: Vec<f64>,
    pub backgrounds: BTreeMap<i32, Background>,
    /// Background shown at the start of the route; [None] for the plain sky.
    pub initial_background: Option<i32>,
    /// Fog in effect at the start of the route.
    pub initial_fog: Fog,
    pub points_of_interest: Vec<PointOfInterest>,
    /// Track positions of buffer stops.
    pub buffers: Vec<f64>,
    pub pretrain: Vec<PreTrainPoint>,
    pub placements: Vec<ObjectPlacement>,
    pub sounds: Vec<WorldSound>,
    pub microphones: Vec<Microphone>,
    pub markers: Vec<Marker>,
    pub comment: String,
    pub image: Option<PathBuf>,
    pub loading_screen: Option<PathBuf>,
    pub timetable: String,
    pub environment: Environment,
    pub train: TrainSettings,
    /// The first track position set in the route file.
    pub minimum_jump_position: Option<f64>,
    /// Factors converting the route's length units to meters.
    pub unit_of_length: Vec<f64>,
    pub block_interval: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn station_with_stops(cars: &[i32]) -> Station {
        Station {
            stops: cars
                .iter()
                .enumerate()
                .map(|(i, cars)| StationStop {
                    track_position: i as f64,
                    forward_tolerance: 5.0,
                    backward_tolerance: 5.0,
                    cars: *cars,
                })
                .collect(),
            ..Default::default()
        }
    }

    macro_rules! stop_index_tests {
        ( $( ($name: ident, $cars: expr, $train: expr, $want: expr), )+ ) => {
            $(
                #[test]
                fn $name() {
                    let station = station_with_stops(&$cars);
                    assert_eq!(station.stop_index($train), $want);
                }
            )+
        };
    }

    stop_index_tests!(
        (stop_index_no_stops, [], 4, None),
        (stop_index_single_any, [0], 4, Some(0)),
        (stop_index_first_long_enough, [2, 6, 4], 3, Some(1)),
        (stop_index_any_train, [2, 0, 4], 3, Some(1)),
        (stop_index_too_long_uses_last, [2, 4], 6, Some(1)),
    );

    #[test]
    fn initial_section_has_two_aspects() {
        let section = Section::initial();
        assert_eq!(section.aspects.len(), 2);
        assert_eq!(section.aspects[1].speed, f64::INFINITY);
        assert_eq!(section.previous, None);
    }
}
