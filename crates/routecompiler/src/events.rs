//! Track elements and the events attached to them.

use crate::assets::SoundHandle;
use crate::output::{Fog, MarkerMessage};
use geometry::Vector3;

/// What a transponder tells the train that passes over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransponderKind {
    /// A beacon of the given type, read by the train's safety system plugin.
    ///
    /// Types 0 to 4 are the built-in ATS-SN and ATS-P beacons.
    Beacon(i32),
    /// Switches between ATS and ATC territory; the data is the track status.
    AtcTrackStatus,
    /// An ATC speed limit, packed as `speed | position << 12`.
    AtcSpeedLimit,
    /// An ATS-P speed limit pattern, packed as `speed | position << 12`.
    AtsPTemporarySpeedLimit,
    /// An ATS-P permanent speed limit in km/h.
    AtsPPermanentSpeedLimit,
    /// A temporary ATS-P pattern that is converted to [TransponderKind::AtsPTemporarySpeedLimit]
    ///     once the whole route is compiled.
    InternalAtsPTemporarySpeedLimit,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Transponder {
    pub kind: TransponderKind,
    pub data: i32,
    /// The section the transponder reports on.
    pub section: Option<usize>,
    /// Whether the transponder only reports up to the first section showing red.
    pub clip_to_first_red_section: bool,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Event {
    BackgroundChange {
        previous: i32,
        next: i32,
    },
    /// A brightness breakpoint.
    ///
    /// The brightness between breakpoints is interpolated linearly,
    ///     so every breakpoint knows its neighbours.
    BrightnessChange {
        current: f64,
        previous: f64,
        previous_distance: f64,
        next: f64,
        next_distance: f64,
    },
    FogChange {
        previous: Fog,
        current: Fog,
        next: Fog,
    },
    RailSoundsChange {
        previous_run: i32,
        previous_flange: i32,
        next_run: i32,
        next_flange: i32,
    },
    /// The wheels cross a set of points.
    PointSound,
    StationStart(usize),
    /// The driver is warned that the train should stop at the next station.
    StationPassAlarm,
    StationEnd(usize),
    /// Speed limits in meters per second.
    LimitChange {
        previous: f64,
        next: f64,
    },
    MarkerStart(MarkerMessage),
    MarkerEnd(MarkerMessage),
    /// A sound played in the train.
    ///
    /// A dynamic sound is only played if the train passes at the given speed,
    ///     in meters per second, or faster.
    TrainSound {
        buffer: SoundHandle,
        dynamic: bool,
        speed: f64,
        all_trains: bool,
    },
    /// The train enters section `next`; the first section has no predecessor.
    SectionChange {
        previous: Option<usize>,
        next: usize,
    },
    Transponder(Transponder),
    DestinationChange {
        kind: i32,
        next: i32,
        previous: i32,
        trigger_once: bool,
    },
    /// The end of the track; carries the length of the last element.
    TrackEnd(f64),
}

/// An event positioned relative to the start of its element.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrackEvent {
    pub delta: f64,
    pub event: Event,
}

impl TrackEvent {
    pub fn new(delta: f64, event: Event) -> Self {
        TrackEvent { delta, event }
    }
}

/// One piece of compiled track, starting at a track position and running to the
///     start of the next element.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrackElement {
    pub starting_track_position: f64,
    pub world_position: Vector3,
    pub world_direction: Vector3,
    pub world_up: Vector3,
    pub world_side: Vector3,
    /// Rise per meter.
    pub pitch: f64,
    /// Signed curve radius in meters; 0 for straight track.
    pub curve_radius: f64,
    /// Signed cant in meters.
    pub curve_cant: f64,
    /// Rate of change of cant used to interpolate cant between elements.
    pub curve_cant_tangent: f64,
    pub adhesion_multiplier: f64,
    pub accuracy: f64,
    pub events: Vec<TrackEvent>,
}

impl Default for TrackElement {
    fn default() -> Self {
        TrackElement {
            starting_track_position: 0.0,
            world_position: Vector3::ZERO,
            world_direction: Vector3::FORWARD,
            world_up: Vector3::UP,
            world_side: Vector3::RIGHT,
            pitch: 0.0,
            curve_radius: 0.0,
            curve_cant: 0.0,
            curve_cant_tangent: 0.0,
            adhesion_multiplier: 1.0,
            accuracy: 2.0,
            events: vec![],
        }
    }
}

impl TrackElement {
    pub fn push(&mut self, delta: f64, event: Event) {
        self.events.push(TrackEvent::new(delta, event));
    }
}
