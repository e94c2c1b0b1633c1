//! The block model.
//!
//! A route is divided into blocks of equal length.
//! Track commands write into the block that contains the most recent track position.
//! Blocks that no command addresses are synthesized from their predecessor:
//!     persistent state such as the rail layout carries over,
//!     while transient state such as signals starts out empty.

use crate::assets::SoundHandle;
use crate::events::TransponderKind;
use crate::output::{Fog, SectionKind};
use crate::structures::{SignalDefinition, StructureTables};
use routelang::Dialect;
use std::rc::Rc;

/// A parallel track at a fixed lateral offset from the main track.
///
/// Rail 0 is the main track and is always started.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rail {
    pub started: bool,
    /// Whether the rail was (re)started in this block.
    pub refreshed: bool,
    /// Whether the rail ends in this block.
    pub ended: bool,
    pub start_x: f64,
    pub start_y: f64,
    /// Offset the rail arrives at from the previous block.
    pub end_x: f64,
    pub end_y: f64,
}

/// Position in a rail cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RailCycle {
    /// Key of the cycle in [StructureTables::rail_cycles].
    pub cycle: Option<i32>,
    pub current: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    Left,
    Right,
    #[default]
    Both,
}

impl Direction {
    pub fn includes_left(self) -> bool {
        matches!(self, Direction::Left | Direction::Both)
    }

    pub fn includes_right(self) -> bool {
        matches!(self, Direction::Right | Direction::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Pole {
    pub exists: bool,
    /// Number of additional rails the pole spans.
    pub mode: i32,
    /// Side of the rail the pole stands on; positive values mirror the pole.
    pub location: f64,
    /// Distance between consecutive poles.
    pub interval: f64,
    pub kind: i32,
}

/// A wall or a dike.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WallDike {
    pub exists: bool,
    pub kind: i32,
    pub direction: Direction,
}

/// The far side of a platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormSecondary {
    /// The platform ends at the primary rail.
    Stub,
    Left,
    Right,
    Rail(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Form {
    pub primary: usize,
    pub secondary: FormSecondary,
    pub form: i32,
    /// Roof structure; 0 for no roof.
    pub roof: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crack {
    pub primary: usize,
    pub secondary: usize,
    pub kind: i32,
}

/// Lateral and vertical offset from a rail plus an orientation, in radians.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Offset {
    pub x: f64,
    pub y: f64,
    pub yaw: f64,
    pub pitch: f64,
    pub roll: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FreeObject {
    pub track_position: f64,
    pub kind: i32,
    pub offset: Offset,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalPlacement {
    pub track_position: f64,
    pub section: usize,
    pub definition: Rc<SignalDefinition>,
    pub offset: Offset,
    pub show_object: bool,
    pub show_post: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SectionDefinition {
    pub track_position: f64,
    pub aspects: Vec<i32>,
    pub kind: SectionKind,
    /// Station whose departure signal this section is.
    pub departure_station: Option<usize>,
    pub invisible: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SoundKind {
    /// Looping sound at a fixed place next to the track.
    World(SoundHandle),
    /// Sound played in the train as it passes.
    ///
    /// A speed of [None] plays the sound whatever the train's speed.
    Train {
        buffer: SoundHandle,
        speed: Option<f64>,
        all_trains: bool,
    },
    Microphone {
        backward_tolerance: f64,
        forward_tolerance: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoundDefinition {
    pub track_position: f64,
    pub kind: SoundKind,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransponderDefinition {
    pub track_position: f64,
    pub kind: TransponderKind,
    pub data: i32,
    pub section: Option<usize>,
    pub clip_to_first_red_section: bool,
    /// Whether one of the built-in beacon objects is shown.
    pub show_default_object: bool,
    /// Beacon structure shown instead of the default object.
    pub beacon: Option<i32>,
    pub offset: Offset,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DestinationDefinition {
    pub track_position: f64,
    pub kind: i32,
    pub beacon: Option<i32>,
    pub next: i32,
    pub previous: i32,
    pub trigger_once: bool,
    pub offset: Offset,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limit {
    pub track_position: f64,
    /// Meters per second; infinite for no limit.
    pub speed: f64,
    /// Side of the track the post stands on: -1, 0 (no post) or 1.
    pub direction: i32,
    /// Direction the limit applies to: -1 left, 0 straight, 1 right.
    pub course: i32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stop {
    pub track_position: f64,
    pub station: usize,
    /// Side of the track the post stands on: -1, 0 (no post) or 1.
    pub direction: i32,
    pub forward_tolerance: f64,
    pub backward_tolerance: f64,
    pub cars: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoiDefinition {
    pub track_position: f64,
    pub rail: usize,
    pub offset: Offset,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrightnessChange {
    pub track_position: f64,
    /// In `[0,1]`.
    pub value: f64,
}

/// Route state for one block.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub background: Option<i32>,
    pub brightness: Vec<BrightnessChange>,
    pub fog: Fog,
    pub fog_defined: bool,
    /// Ground structures used in consecutive blocks.
    ///
    /// [None] until a `Track.Ground` command; the route's first ground cycle, or ground 0, is used then.
    pub ground_cycle: Option<Vec<i32>>,
    /// Height of the rails above the ground; gaps are interpolated after parsing.
    pub height: Option<f64>,
    pub rails: Vec<Rail>,
    pub rail_types: Vec<i32>,
    pub rail_cycles: Vec<RailCycle>,
    pub poles: Vec<Pole>,
    pub walls: Vec<WallDike>,
    pub dikes: Vec<WallDike>,
    pub forms: Vec<Form>,
    pub cracks: Vec<Crack>,
    pub ground_free_objects: Vec<FreeObject>,
    /// Free objects by rail.
    pub rail_free_objects: Vec<Vec<FreeObject>>,
    pub signals: Vec<SignalPlacement>,
    pub sections: Vec<SectionDefinition>,
    pub sounds: Vec<SoundDefinition>,
    pub transponders: Vec<TransponderDefinition>,
    pub destinations: Vec<DestinationDefinition>,
    pub points_of_interest: Vec<PoiDefinition>,
    pub limits: Vec<Limit>,
    pub stops: Vec<Stop>,
    pub station: Option<usize>,
    pub station_pass_alarm: bool,
    pub curve_radius: f64,
    pub curve_cant: f64,
    pub pitch: f64,
    /// Tangent of the angle the track turns by at the start of the block.
    pub turn: f64,
    pub accuracy: f64,
    pub adhesion: f64,
}

impl Block {
    /// The block at the start of the route.
    pub fn initial(dialect: Dialect, block_interval: f64) -> Block {
        Block {
            background: Some(0),
            brightness: vec![],
            fog: Fog::default(),
            fog_defined: false,
            ground_cycle: None,
            height: Some(match dialect {
                Dialect::Rw => 0.3,
                Dialect::Csv => 0.0,
            }),
            rails: vec![Rail {
                started: true,
                ..Default::default()
            }],
            rail_types: vec![0],
            rail_cycles: vec![RailCycle::default()],
            poles: vec![Pole {
                exists: true,
                mode: 0,
                location: 0.0,
                interval: 2.0 * block_interval,
                kind: 0,
            }],
            walls: vec![],
            dikes: vec![],
            forms: vec![],
            cracks: vec![],
            ground_free_objects: vec![],
            rail_free_objects: vec![],
            signals: vec![],
            sections: vec![],
            sounds: vec![],
            transponders: vec![],
            destinations: vec![],
            points_of_interest: vec![],
            limits: vec![],
            stops: vec![],
            station: None,
            station_pass_alarm: false,
            curve_radius: 0.0,
            curve_cant: 0.0,
            pitch: 0.0,
            turn: 0.0,
            accuracy: 2.0,
            adhesion: 1.0,
        }
    }

    /// Synthesizes the block that follows this one.
    ///
    /// In preview mode rail cycles do not advance.
    pub fn next(&self, structures: &StructureTables, preview_only: bool) -> Block {
        let mut rail_types = self.rail_types.clone();
        let mut rail_cycles = self.rail_cycles.clone();
        if !preview_only {
            for (j, rail_cycle) in rail_cycles.iter_mut().enumerate() {
                let Some(cycle) = rail_cycle.cycle.and_then(|c| structures.rail_cycles.get(c)) else {
                    continue;
                };
                if cycle.len() > 1 {
                    rail_cycle.current = (rail_cycle.current + 1) % cycle.len();
                    if let Some(t) = rail_types.get_mut(j) {
                        *t = cycle[rail_cycle.current];
                    }
                }
            }
        }
        let rails = self
            .rails
            .iter()
            .map(|r| Rail {
                started: r.started,
                refreshed: false,
                ended: false,
                start_x: r.start_x,
                start_y: r.start_y,
                end_x: r.start_x,
                end_y: r.start_y,
            })
            .collect();
        Block {
            background: None,
            brightness: vec![],
            fog: self.fog,
            fog_defined: false,
            ground_cycle: self.ground_cycle.clone(),
            height: None,
            rails,
            rail_types,
            rail_cycles,
            poles: self.poles.clone(),
            walls: self.walls.clone(),
            dikes: self.dikes.clone(),
            forms: vec![],
            cracks: vec![],
            ground_free_objects: vec![],
            rail_free_objects: vec![],
            signals: vec![],
            sections: vec![],
            sounds: vec![],
            transponders: vec![],
            destinations: vec![],
            points_of_interest: vec![],
            limits: vec![],
            stops: vec![],
            station: None,
            station_pass_alarm: false,
            curve_radius: self.curve_radius,
            curve_cant: self.curve_cant,
            pitch: self.pitch,
            turn: 0.0,
            accuracy: self.accuracy,
            adhesion: self.adhesion,
        }
    }

    /// Returns the rail with the given index, adding stopped rails as needed.
    pub fn rail_mut(&mut self, index: usize) -> &mut Rail {
        grow(&mut self.rails, index);
        &mut self.rails[index]
    }

    pub fn rail(&self, index: usize) -> Rail {
        self.rails.get(index).copied().unwrap_or_default()
    }

    pub fn is_rail_started(&self, index: usize) -> bool {
        self.rails.get(index).map(|r| r.started).unwrap_or(false)
    }

    /// Sets the structure of a rail, starting a rail cycle if the structure has one.
    pub fn set_rail_type(&mut self, rail: usize, structure: i32, structures: &StructureTables) {
        grow(&mut self.rail_types, rail);
        grow(&mut self.rail_cycles, rail);
        match structures.rail_cycles.get(structure).and_then(|c| c.first()) {
            Some(first) => {
                self.rail_types[rail] = *first;
                self.rail_cycles[rail] = RailCycle {
                    cycle: Some(structure),
                    current: 0,
                };
            }
            None => {
                self.rail_types[rail] = structure;
                self.rail_cycles[rail] = RailCycle::default();
            }
        }
    }

    pub fn rail_type(&self, rail: usize) -> i32 {
        self.rail_types.get(rail).copied().unwrap_or(0)
    }

    /// Returns the pole of a rail; poles added here are absent and repeat at the given interval.
    pub fn pole_mut(&mut self, rail: usize, interval: f64) -> &mut Pole {
        if self.poles.len() <= rail {
            self.poles.resize(
                rail + 1,
                Pole {
                    interval,
                    ..Default::default()
                },
            );
        }
        &mut self.poles[rail]
    }

    pub fn wall_mut(&mut self, rail: usize) -> &mut WallDike {
        grow(&mut self.walls, rail);
        &mut self.walls[rail]
    }

    pub fn dike_mut(&mut self, rail: usize) -> &mut WallDike {
        grow(&mut self.dikes, rail);
        &mut self.dikes[rail]
    }

    pub fn push_rail_free_object(&mut self, rail: usize, object: FreeObject) {
        grow(&mut self.rail_free_objects, rail);
        self.rail_free_objects[rail].push(object);
    }
}

fn grow<T: Default>(v: &mut Vec<T>, index: usize) {
    if v.len() <= index {
        v.resize_with(index + 1, Default::default);
    }
}

/// Index of the block containing a track position.
pub fn block_index(track_position: f64, block_interval: f64) -> usize {
    let i = (track_position / block_interval + 0.001).floor();
    if i > 0.0 {
        i as usize
    } else {
        0
    }
}
