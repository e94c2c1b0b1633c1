//! Turning blocks into the compiled route.
//!
//! The compiler walks the blocks in order and integrates their curves, pitches and turns
//!     into a position and heading in the world.
//! Every block becomes one track element carrying the block's events,
//!     and the scenery of the block is placed relative to the element's rails.
//! Once every block has been walked a few route wide passes finish the stations,
//!     add the ATC beacons and smooth the track.

use crate::assets::{AnimatedObject, StaticObject, TextureHandle, TextureOptions, UnifiedObject};
use crate::block::{self, Block, Form, FormSecondary, Offset, SoundKind, TransponderDefinition};
use crate::context::Context;
use crate::events::{Event, TrackElement, Transponder, TransponderKind};
use crate::output::{
    Fog, Microphone, ObjectPlacement, PointOfInterest, SafetySystem, Section, SectionAspect, StationKind,
    StationStop, StopMode, WorldSound,
};
use crate::smoothing;
use crate::structures::{SignalDefinition, StructureTables};
use geometry::{Transformation, Vector2, Vector3};
use rand::Rng;
use routelang::{CancellationToken, Cancelled, DiagnosticKind};
use std::rc::Rc;

/// Length of track added after the last command so that trains can overrun it.
const TRACK_OVERRUN: f64 = 600.0;

/// Radius below which a curve in the last block is straightened.
const MINIMUM_FINAL_RADIUS: f64 = 300.0;

/// Blocks compiled between checks for cancellation.
const CHECKPOINT_BLOCKS: usize = 16;

/// Track positions of station end events are measured from the last stop point.
const STATION_END_MARGIN_BLOCKS: f64 = 1.0;

/// Distance into a block at which the wheels run over a set of points, whatever the block length.
const POINT_SOUND_DELTA: f64 = 12.5;

/// Blocks before a station at which the pass alarm sounds.
const PASS_ALARM_BLOCKS: usize = 6;

/// Lateral offsets of the default posts, in meters per unit of direction.
const LIMIT_POST_OFFSET: f64 = 2.2;
const STOP_POST_OFFSET: f64 = 1.8;

/// Distance between the rails spanned by an overhead line pole.
const POLE_SPACING: f64 = 3.8;

/// Largest values that fit the packed beacon data.
const MAXIMUM_PACKED_SPEED: f64 = 4095.0;
const MAXIMUM_PACKED_DISTANCE: f64 = 1048575.0;

/// Compiles the blocks of a parsed route into track elements, placements and events.
///
/// The blocks are extended past the last command, walked, and then removed from the
///     context's scenery tables into [crate::output::CompiledRoute].
pub fn compile(ctx: &mut Context, cancel: &CancellationToken) -> Result<(), Cancelled> {
    let preview = ctx.preview_only();
    let interval = ctx.options.block_interval;
    let first_used = ctx.first_used_block.unwrap_or(0);
    let last_block = ((ctx.track_position + TRACK_OVERRUN) / interval + 0.001).floor().max(0.0) as usize + 1;
    if let Some(last) = ctx.blocks.last_mut() {
        if last.curve_radius < MINIMUM_FINAL_RADIUS {
            last.curve_radius = 0.0;
        }
    }
    ctx.ensure_blocks(last_block.max(first_used));
    if !preview {
        interpolate_heights(&mut ctx.blocks);
        ctx.route.sections.push(Section::initial());
        ctx.route.backgrounds = std::mem::take(&mut ctx.structures.backgrounds).into_map();
        ctx.route.initial_background = ctx.blocks[0]
            .background
            .filter(|b| ctx.route.backgrounds.contains_key(b));
    }
    log::debug!(
        "compiling {} blocks of {interval} m starting at block {first_used}",
        ctx.blocks.len() - first_used
    );

    let blocks = std::mem::take(&mut ctx.blocks);
    let walked = Walk::new(ctx, &blocks, first_used).run(cancel);
    ctx.blocks = blocks;
    let mut elements = walked?;

    add_station_ends(ctx, &mut elements, first_used);
    add_default_points_of_interest(ctx);
    propagate_cant(&mut elements);
    finish_stations(ctx);
    if let Some(last) = elements.last_mut() {
        last.push(0.0, Event::TrackEnd(interval));
    }
    if !preview {
        add_atc_beacons(ctx, &mut elements);
        smoothing::compute_cant_tangents(&mut elements);
        let subdivisions = (interval / 5.0).floor() as usize;
        if subdivisions >= 2 {
            smoothing::smooth_turns(&mut elements, subdivisions);
            smoothing::compute_cant_tangents(&mut elements);
        }
    }
    log::debug!(
        "compiled {} track elements and {} placements",
        elements.len(),
        ctx.route.placements.len()
    );
    ctx.route.elements = elements;
    Ok(())
}

/// Fills in the heights of blocks between two `Track.Height` commands by linear interpolation.
///
/// Blocks after the last command keep its height.
fn interpolate_heights(blocks: &mut [Block]) {
    let mut last: Option<(usize, f64)> = None;
    for i in 0..blocks.len() {
        let Some(height) = blocks[i].height else {
            continue;
        };
        if let Some((j, previous)) = last {
            let step = (height - previous) / (i - j) as f64;
            let mut value = previous;
            for block in &mut blocks[j + 1..i] {
                value += step;
                block.height = Some(value);
            }
        }
        last = Some((i, height));
    }
    if let Some((j, height)) = last {
        for block in &mut blocks[j + 1..] {
            block.height = Some(height);
        }
    }
}

/// The horizontal angle turned halfway through a block, the chord length and the rise.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Chord {
    half_angle: f64,
    length: f64,
    rise: f64,
}

fn chord(radius: f64, pitch: f64, interval: f64) -> Chord {
    let arc = |s: f64| {
        let b = s / radius.abs();
        let length = (2.0 * radius * radius * (1.0 - b.cos())).max(0.0).sqrt();
        (0.5 * radius.signum() * b, length)
    };
    if radius != 0.0 && pitch != 0.0 {
        let s = interval / (1.0 + pitch * pitch).sqrt();
        let (half_angle, length) = arc(s);
        Chord {
            half_angle,
            length,
            rise: s * pitch,
        }
    } else if radius != 0.0 {
        let (half_angle, length) = arc(interval);
        Chord {
            half_angle,
            length,
            rise: 0.0,
        }
    } else if pitch != 0.0 {
        let length = interval / (1.0 + pitch * pitch).sqrt();
        Chord {
            half_angle: 0.0,
            length,
            rise: length * pitch,
        }
    } else {
        Chord {
            half_angle: 0.0,
            length: interval,
            rise: 0.0,
        }
    }
}

/// Sign of a number, with zero as its own sign.
fn sign(x: f64) -> i32 {
    if x > 0.0 {
        1
    } else if x < 0.0 {
        -1
    } else {
        0
    }
}

/// Extent of an object along the track, over every state of an animated object.
fn z_extent(object: &UnifiedObject) -> Option<(f64, f64)> {
    let mut extent: Option<(f64, f64)> = None;
    let mut include = |state: &StaticObject| {
        for v in &state.vertices {
            extent = Some(match extent {
                None => (v.z, v.z),
                Some((near, far)) => (near.min(v.z), far.max(v.z)),
            });
        }
    };
    match object {
        UnifiedObject::Static(state) => include(state),
        UnifiedObject::Animated(objects) => objects.iter().flat_map(|o| &o.states).for_each(&mut include),
    }
    extent
}

/// Where and how an object is placed.
#[derive(Debug, Clone, Copy)]
struct Site {
    position: Vector3,
    base: Transformation,
    aux: Transformation,
    track_position: f64,
}

impl Site {
    fn new(position: Vector3, base: Transformation, track_position: f64) -> Site {
        Site {
            position,
            base,
            aux: Transformation::IDENTITY,
            track_position,
        }
    }

    fn turned(self, offset: &Offset) -> Site {
        Site {
            aux: Transformation::new(offset.yaw, offset.pitch, offset.roll),
            ..self
        }
    }
}

/// The orientation of one rail over the current block.
#[derive(Debug, Clone, Copy)]
struct RailFrame {
    position: Vector3,
    transformation: Transformation,
    /// Horizontal angle of the rail relative to the track.
    planar: f64,
    /// Vertical angle of the rail relative to the track.
    updown: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

/// How the centre pieces of a platform or roof are placed.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Center {
    Omitted,
    Plain,
    /// Stretched to reach the secondary rail, see [StaticObject::stretched].
    Stretched(f64, f64),
}

/// The objects of one side of a platform, and the names used to report missing ones.
struct Platform {
    form: Option<Rc<UnifiedObject>>,
    form_center: Option<Rc<StaticObject>>,
    roof: Option<Rc<UnifiedObject>>,
    roof_center: Option<Rc<StaticObject>>,
    names: [&'static str; 4],
}

impl Platform {
    fn new(structures: &StructureTables, form: &Form, side: Side) -> Platform {
        let s = structures;
        match side {
            Side::Left => Platform {
                form: s.form_left.get(form.form).cloned(),
                form_center: s.form_center_left.get(form.form).cloned(),
                roof: s.roof_left.get(form.roof).cloned(),
                roof_center: s.roof_center_left.get(form.roof).cloned(),
                names: ["FormL", "FormCL", "RoofL", "RoofCL"],
            },
            Side::Right => Platform {
                form: s.form_right.get(form.form).cloned(),
                form_center: s.form_center_right.get(form.form).cloned(),
                roof: s.roof_right.get(form.roof).cloned(),
                roof_center: s.roof_center_right.get(form.roof).cloned(),
                names: ["FormR", "FormCR", "RoofR", "RoofCR"],
            },
        }
    }
}

fn center_piece(object: Option<Rc<StaticObject>>, center: Center) -> Option<Rc<UnifiedObject>> {
    object.map(|o| {
        Rc::new(UnifiedObject::Static(match center {
            Center::Stretched(near, far) => o.stretched(near, far),
            Center::Plain | Center::Omitted => (*o).clone(),
        }))
    })
}

/// Lateral offsets of rail `secondary` from rail `primary` at the start and end of a block.
fn spread(block: &Block, next: Option<&Block>, primary: usize, secondary: usize) -> (f64, f64) {
    let end_x = |rail: usize, start: f64| {
        next.filter(|n| n.rails.len() > rail)
            .map(|n| n.rail(rail).end_x)
            .unwrap_or(start)
    };
    let (p0, p1) = if primary > 0 {
        let p0 = block.rail(primary).start_x;
        (p0, end_x(primary, p0))
    } else {
        (0.0, 0.0)
    };
    let s0 = block.rail(secondary).start_x;
    let s1 = end_x(secondary, s0);
    (s0 - p0, s1 - p1)
}

/// Postfix state function of a signal built from the legacy signal objects.
///
/// State `l` is shown while the section's aspect is at most `numbers[l]`;
///     the last state is shown otherwise.
pub fn compatibility_state_function(numbers: &[i32]) -> String {
    let n = numbers.len();
    let mut function = String::new();
    for (l, number) in numbers.iter().take(n.saturating_sub(1)).enumerate() {
        function.push_str(&format!["section {number} <= {l} "]);
    }
    function.push_str(&format!["{}", n.saturating_sub(1)]);
    for _ in 1..n {
        function.push_str(" ?");
    }
    function
}

fn compatibility_signal(numbers: &[i32], objects: &[StaticObject], refresh_rate: f64) -> Option<Rc<UnifiedObject>> {
    if numbers.is_empty() {
        return None;
    }
    Some(Rc::new(UnifiedObject::Animated(vec![AnimatedObject {
        states: objects.to_vec(),
        state_function: Some(compatibility_state_function(numbers)),
        refresh_rate,
    }])))
}

/// Builds a signal from a base and glow object and a texture per aspect.
///
/// Aspects with neither texture are skipped.
fn raw_signal(
    base: Option<&StaticObject>,
    glow: Option<&StaticObject>,
    signal_textures: &[Option<TextureHandle>],
    glow_textures: &[Option<TextureHandle>],
) -> Option<Rc<UnifiedObject>> {
    if signal_textures.is_empty() {
        return None;
    }
    let mut states = vec![];
    let mut aspects = vec![];
    for l in 0..signal_textures.len().max(glow_textures.len()) {
        let signal_texture = signal_textures.get(l).copied().flatten();
        let glow_texture = glow_textures.get(l).copied().flatten();
        if signal_texture.is_none() && glow_texture.is_none() {
            continue;
        }
        let mut state = StaticObject::default();
        if let (Some(texture), Some(base)) = (signal_texture, base) {
            state.join(base.with_texture(texture));
        }
        if let (Some(texture), Some(glow)) = (glow_texture, glow) {
            state.join(glow.with_texture(texture));
        }
        states.push(state);
        aspects.push(l);
    }
    let n = states.len();
    let mut function = String::new();
    for (i, l) in aspects.iter().enumerate() {
        if i + 1 < n {
            function.push_str(&format!["section {l} <= {i} "]);
        } else {
            function.push_str(&format!["{i}"]);
        }
    }
    for _ in 1..n {
        function.push_str(" ?");
    }
    Some(Rc::new(UnifiedObject::Animated(vec![AnimatedObject {
        states,
        state_function: Some(function),
        refresh_rate: 0.0,
    }])))
}

/// Where the brightness is anchored while walking.
#[derive(Debug, Clone, Copy)]
struct BrightnessCursor {
    value: f64,
    track_position: f64,
    /// Element and event index of the last breakpoint, whose next value is patched later.
    event: Option<(usize, usize)>,
}

#[derive(Debug, Clone, Copy)]
struct FogCursor {
    previous: Fog,
    current: Fog,
    event: Option<(usize, usize)>,
}

/// The state carried from block to block.
struct Walk<'c, 'a> {
    ctx: &'c mut Context<'a>,
    blocks: &'c [Block],
    first_used: usize,
    interval: f64,
    preview: bool,
    elements: Vec<TrackElement>,
    position: Vector3,
    direction: Vector2,
    block_start: f64,
    speed_limit: f64,
    rail_sounds: (i32, i32),
    /// Every brightness breakpoint of the route, as `(track position, value)`.
    brightness_points: Vec<(f64, f64)>,
    brightness: BrightnessCursor,
    fog: FogCursor,
    /// Transponders per block that have not been turned into events yet.
    transponders: Vec<Vec<Option<TransponderDefinition>>>,
}

impl<'c, 'a> Walk<'c, 'a> {
    fn new(ctx: &'c mut Context<'a>, blocks: &'c [Block], first_used: usize) -> Walk<'c, 'a> {
        let preview = ctx.preview_only();
        let interval = ctx.options.block_interval;
        let brightness_points: Vec<(f64, f64)> = blocks
            .iter()
            .flat_map(|b| b.brightness.iter().map(|c| (c.track_position, c.value)))
            .collect();
        let mut brightness = BrightnessCursor {
            value: 1.0,
            track_position: first_used as f64 * interval,
            event: None,
        };
        if !preview {
            if let Some(first) = blocks[first_used.min(blocks.len())..]
                .iter()
                .find_map(|b| b.brightness.first())
            {
                brightness.value = first.value;
                brightness.track_position = first.track_position;
            }
        }
        let fog = FogCursor {
            previous: Fog {
                track_position: -interval,
                ..Default::default()
            },
            current: Fog::default(),
            event: None,
        };
        let transponders = blocks
            .iter()
            .map(|b| b.transponders.iter().copied().map(Some).collect())
            .collect();
        Walk {
            ctx,
            blocks,
            first_used,
            interval,
            preview,
            elements: Vec::with_capacity(blocks.len().saturating_sub(first_used)),
            position: Vector3::ZERO,
            direction: Vector2::FORWARD,
            block_start: 0.0,
            speed_limit: f64::INFINITY,
            rail_sounds: (0, 0),
            brightness_points,
            brightness,
            fog,
            transponders,
        }
    }

    fn run(mut self, cancel: &CancellationToken) -> Result<Vec<TrackElement>, Cancelled> {
        for i in self.first_used..self.blocks.len() {
            if i % CHECKPOINT_BLOCKS == 0 {
                cancel.checkpoint()?;
            }
            self.block(i);
        }
        if !self.preview {
            self.orphan_transponders();
            self.destination_events();
        }
        Ok(self.elements)
    }

    fn report(&mut self, kind: DiagnosticKind) {
        self.ctx.diagnostics.report(kind, None);
    }

    fn last_element(&mut self) -> &mut TrackElement {
        let n = self.elements.len() - 1;
        &mut self.elements[n]
    }

    /// Linear interpolation between the brightness breakpoints around a track position.
    fn brightness_at(&self, track_position: f64) -> f64 {
        let mut below: Option<(f64, f64)> = None;
        let mut above: Option<(f64, f64)> = None;
        for &(t, b) in &self.brightness_points {
            if t <= track_position {
                below = Some((t, b));
            }
            if t >= track_position && above.is_none() {
                above = Some((t, b));
            }
        }
        match (below, above) {
            (None, None) => 1.0,
            (None, Some((t1, b1))) => {
                if t1 == 0.0 {
                    b1
                } else {
                    (b1 - 1.0) * track_position / t1 + 1.0
                }
            }
            (Some((_, b0)), None) => b0,
            (Some((t0, b0)), Some((t1, b1))) => {
                if t0 == t1 {
                    0.5 * (b0 + b1)
                } else {
                    let r = (track_position - t0) / (t1 - t0);
                    (1.0 - r) * b0 + r * b1
                }
            }
        }
    }

    fn place(&mut self, object: Rc<UnifiedObject>, site: Site, brightness: f64, section: Option<usize>) {
        let (starting_distance, ending_distance) = if self.ctx.options.accurate_object_disposal {
            let (near, far) = z_extent(&object).unwrap_or((0.0, 0.0));
            (site.track_position + near, site.track_position + far)
        } else {
            (self.block_start, self.block_start + self.interval)
        };
        self.ctx.route.placements.push(ObjectPlacement {
            object,
            position: site.position,
            base: site.base,
            aux: site.aux,
            starting_distance,
            ending_distance,
            track_position: site.track_position,
            brightness,
            section,
        });
    }

    fn place_or_report(&mut self, object: Option<Rc<UnifiedObject>>, command: &str, what: &'static str, index: i32, site: Site) {
        match object {
            Some(object) => self.place(object, site, 1.0, None),
            None => self.report(DiagnosticKind::UndefinedReference {
                command: command.into(),
                what,
                index,
            }),
        }
    }

    fn block(&mut self, i: usize) {
        let blocks = self.blocks;
        let block = &blocks[i];
        let start = i as f64 * self.interval;
        self.block_start = start;
        self.direction = self.direction.normalize();

        let world_direction = Vector3::from_heading(self.direction, block.pitch);
        let world_side = Vector3::new(self.direction.y, 0.0, -self.direction.x);
        self.elements.push(TrackElement {
            starting_track_position: start,
            world_position: self.position,
            world_direction,
            world_up: world_direction.cross(world_side),
            world_side,
            pitch: block.pitch,
            curve_radius: block.curve_radius,
            curve_cant: block.curve_cant,
            curve_cant_tangent: 0.0,
            adhesion_multiplier: block.adhesion,
            accuracy: block.accuracy,
            events: vec![],
        });

        if !self.preview {
            self.background_event(i);
            self.brightness_events(block);
            self.fog_event(i, block);
            self.rail_sounds_event(block);
            self.point_sound_event(block, blocks.get(i + 1));
        }
        self.station_events(i, block);
        for limit in &block.limits {
            let previous = self.speed_limit;
            self.last_element().push(
                limit.track_position - start,
                Event::LimitChange {
                    previous,
                    next: limit.speed,
                },
            );
            self.speed_limit = limit.speed;
        }
        if !self.preview {
            self.marker_events(start);
            for sound in &block.sounds {
                if let SoundKind::Train {
                    buffer,
                    speed,
                    all_trains,
                } = sound.kind
                {
                    self.last_element().push(
                        sound.track_position - start,
                        Event::TrainSound {
                            buffer,
                            dynamic: speed.is_some(),
                            speed: speed.unwrap_or(0.0),
                            all_trains,
                        },
                    );
                }
            }
        }

        if block.turn != 0.0 {
            let (sin, cos) = (-block.turn.atan()).sin_cos();
            self.direction = self.direction.rotate(cos, sin);
            let element = self.last_element();
            element.world_direction = element.world_direction.rotate_plane(cos, sin);
            element.world_side = element.world_side.rotate_plane(cos, sin);
            element.world_up = element.world_direction.cross(element.world_side);
        }

        let chord = chord(block.curve_radius, block.pitch, self.interval);
        if chord.half_angle != 0.0 {
            self.direction = self.direction.rotate_by(-chord.half_angle);
        }
        let yaw = self.direction.x.atan2(self.direction.y);
        let ground = Transformation::new(yaw, 0.0, 0.0);
        let track = Transformation::new(yaw, block.pitch.atan(), 0.0);

        if !self.preview {
            self.ground(i, block, ground);
            for j in 0..block.rails.len() {
                if j > 0 && !block.rails[j].started {
                    continue;
                }
                let frame = self.rail_frame(block, blocks.get(i + 1), j, chord, track);
                self.rail(i, j, frame);
            }
        }

        self.position += Vector3::new(self.direction.x * chord.length, chord.rise, self.direction.y * chord.length);
        if chord.half_angle != 0.0 {
            self.direction = self.direction.rotate_by(-chord.half_angle);
        }
    }

    fn background_event(&mut self, i: usize) {
        let Some(next) = self.blocks[i].background else {
            return;
        };
        let backgrounds = &self.ctx.route.backgrounds;
        let previous = if i == self.first_used {
            next
        } else {
            self.blocks[self.first_used..i]
                .iter()
                .rev()
                .find_map(|b| b.background)
                .unwrap_or(if backgrounds.is_empty() { -1 } else { 0 })
        };
        if backgrounds.contains_key(&previous) && backgrounds.contains_key(&next) {
            self.last_element().push(0.0, Event::BackgroundChange { previous, next });
        }
    }

    fn brightness_events(&mut self, block: &Block) {
        for change in &block.brightness {
            let n = self.elements.len() - 1;
            let m = self.elements[n].events.len();
            let distance = change.track_position - self.brightness.track_position;
            self.elements[n].push(
                change.track_position - self.block_start,
                Event::BrightnessChange {
                    current: change.value,
                    previous: self.brightness.value,
                    previous_distance: distance,
                    next: change.value,
                    next_distance: 0.0,
                },
            );
            if let Some((e, k)) = self.brightness.event {
                if let Event::BrightnessChange {
                    next, next_distance, ..
                } = &mut self.elements[e].events[k].event
                {
                    *next = change.value;
                    *next_distance = distance;
                }
            }
            self.brightness = BrightnessCursor {
                value: change.value,
                track_position: change.track_position,
                event: Some((n, m)),
            };
        }
    }

    fn fog_event(&mut self, i: usize, block: &Block) {
        let start = self.block_start;
        let n = self.elements.len() - 1;
        if self.ctx.options.fog_transitions {
            if !block.fog_defined {
                return;
            }
            let mut fog = block.fog;
            if i == 0 && start == 0.0 {
                self.fog.previous = fog;
            }
            fog.track_position = start;
            let previous = self.fog.previous;
            let m = self.elements[n].events.len();
            self.elements[n].push(
                0.0,
                Event::FogChange {
                    previous,
                    current: fog,
                    next: fog,
                },
            );
            match self.fog.event {
                Some((e, k)) => {
                    if let Event::FogChange { next, .. } = &mut self.elements[e].events[k].event {
                        *next = fog;
                    }
                }
                None => self.ctx.route.initial_fog = previous,
            }
            self.fog.previous = fog;
            self.fog.event = Some((n, m));
        } else if i == 0 && start == 0.0 {
            self.fog.previous = block.fog;
            self.fog.current = block.fog;
            self.ctx.route.initial_fog = block.fog;
        } else {
            let mut next = block.fog;
            next.track_position = start + self.interval;
            self.elements[n].push(
                0.0,
                Event::FogChange {
                    previous: self.fog.previous,
                    current: self.fog.current,
                    next,
                },
            );
            self.fog.previous = self.fog.current;
            self.fog.current = next;
        }
    }

    fn rail_sounds_event(&mut self, block: &Block) {
        let structures = &self.ctx.structures;
        let kind = block.rail_type(0);
        let run = structures.run_sounds.get(kind).copied().unwrap_or(0);
        let flange = structures.flange_sounds.get(kind).copied().unwrap_or(0);
        let (previous_run, previous_flange) = self.rail_sounds;
        self.last_element().push(
            0.0,
            Event::RailSoundsChange {
                previous_run,
                previous_flange,
                next_run: run,
                next_flange: flange,
            },
        );
        self.rail_sounds = (run, flange);
    }

    /// A rail that crosses over to the other side of the main rail within the block
    ///     runs over a set of points.
    fn point_sound_event(&mut self, block: &Block, next: Option<&Block>) {
        let Some(next) = next else {
            return;
        };
        let crosses = block.rails.iter().enumerate().any(|(j, rail)| {
            if !rail.started || next.rails.len() <= j {
                return false;
            }
            let end = next.rails[j];
            sign(rail.start_x) != sign(end.end_x) && rail.start_y * end.end_y <= 0.0
        });
        if crosses {
            self.last_element().push(POINT_SOUND_DELTA, Event::PointSound);
        }
    }

    fn station_events(&mut self, i: usize, block: &Block) {
        if let Some(s) = block.station {
            self.last_element().push(0.0, Event::StationStart(s));
            self.set_sound_origin(s, 3.0);
            if !self.preview && block.station_pass_alarm && i >= self.first_used + PASS_ALARM_BLOCKS {
                self.elements[i - PASS_ALARM_BLOCKS - self.first_used].push(0.0, Event::StationPassAlarm);
            }
        }
        for stop in &block.stops {
            if let Some(station) = self.ctx.route.stations.get_mut(stop.station) {
                station.stops.push(StationStop {
                    track_position: stop.track_position,
                    forward_tolerance: stop.forward_tolerance,
                    backward_tolerance: stop.backward_tolerance,
                    cars: stop.cars,
                });
            }
            self.set_sound_origin(stop.station, 2.0);
        }
    }

    /// Station sounds are played from the side of the doors, above the track.
    fn set_sound_origin(&mut self, station: usize, height: f64) {
        let n = self.elements.len() - 1;
        let (side, up) = (self.elements[n].world_side, self.elements[n].world_up);
        let position = self.position;
        let Some(station) = self.ctx.route.stations.get_mut(station) else {
            return;
        };
        let dx = match (station.open_left_doors, station.open_right_doors) {
            (true, false) => -5.0,
            (false, true) => 5.0,
            _ => 0.0,
        };
        station.sound_origin = position + side * dx + up * height;
    }

    fn marker_events(&mut self, start: f64) {
        let end = start + self.interval;
        let n = self.elements.len() - 1;
        for marker in &self.ctx.route.markers {
            if marker.start >= start && marker.start < end {
                self.elements[n].push(marker.start - start, Event::MarkerStart(marker.message.clone()));
            }
            if marker.end >= start && marker.end < end {
                self.elements[n].push(marker.end - start, Event::MarkerEnd(marker.message.clone()));
            }
        }
    }

    fn ground(&mut self, i: usize, block: &Block, ground: Transformation) {
        let height = block.height.unwrap_or(0.0);
        let cycle: &[i32] = match &block.ground_cycle {
            Some(cycle) => cycle,
            None => match self.ctx.structures.cycles.get(0) {
                Some(cycle) => cycle,
                None => &[0],
            },
        };
        let kind = (!cycle.is_empty()).then(|| cycle[i % cycle.len()]);
        if let Some(object) = kind
            .filter(|k| *k >= 0)
            .and_then(|k| self.ctx.structures.ground.get(k))
            .cloned()
        {
            let site = Site::new(self.position + Vector3::new(0.0, -height, 0.0), ground, self.block_start);
            self.place(object, site, 1.0, None);
        }
        let d = self.direction;
        for free in &block.ground_free_objects {
            let Some(object) = self.ctx.structures.free_objects.get(free.kind).cloned() else {
                continue;
            };
            let dz = free.track_position - self.block_start;
            let (dx, dy) = (free.offset.x, free.offset.y);
            let position = self.position + Vector3::new(d.x * dz + d.y * dx, dy - height, d.y * dz - d.x * dx);
            let site = Site::new(position, ground, free.track_position).turned(&free.offset);
            self.place(object, site, 1.0, None);
        }
    }

    /// Position and orientation of rail `j` at the start of the block.
    ///
    /// Rails other than the main rail point straight at where they are at the start of
    ///     the next block.
    fn rail_frame(&self, block: &Block, next: Option<&Block>, j: usize, chord: Chord, track: Transformation) -> RailFrame {
        let d = self.direction;
        if j == 0 {
            return RailFrame {
                position: self.position,
                transformation: track,
                planar: 0.0,
                updown: 0.0,
            };
        }
        let rail = block.rails[j];
        let position = self.position + Vector3::new(d.y * rail.start_x, rail.start_y, -d.x * rail.start_x);
        let Some(next) = next.filter(|n| n.rails.len() > j) else {
            return RailFrame {
                position,
                transformation: track,
                planar: 0.0,
                updown: 0.0,
            };
        };
        let end_of_block = self.position + Vector3::new(d.x * chord.length, chord.rise, d.y * chord.length);
        let mut d2 = d;
        if chord.half_angle != 0.0 {
            d2 = d2.rotate_by(-chord.half_angle);
        }
        if next.turn != 0.0 {
            d2 = d2.rotate_by(-next.turn.atan());
        }
        let half_angle = chord_of(next, self.interval).half_angle;
        if half_angle != 0.0 {
            d2 = d2.rotate_by(-half_angle);
        }
        let end = next.rails[j];
        let position2 = end_of_block + Vector3::new(d2.y * end.end_x, end.end_y, -d2.x * end.end_x);
        RailFrame {
            position,
            transformation: Transformation::looking_along(position2 - position),
            planar: ((end.end_x - rail.start_x) / chord.length).atan(),
            updown: ((end.end_y - rail.start_y) / chord.length).atan(),
        }
    }

    /// The horizontal direction of a rail, the track's side vector and the rail's up vector.
    fn rail_axes(&self, frame: &RailFrame) -> (Vector3, Vector3, Vector3) {
        let d = self.direction;
        let angle = d.y.atan2(d.x) - frame.planar;
        let forward = Vector3::new(angle.cos(), frame.updown.tan(), angle.sin()).normalize();
        let side = Vector3::new(d.y, 0.0, -d.x);
        (forward, side, forward.cross(side))
    }

    fn rail(&mut self, i: usize, j: usize, frame: RailFrame) {
        let blocks = self.blocks;
        let block = &blocks[i];
        let next = blocks.get(i + 1);
        let start = self.block_start;
        let pos = frame.position;
        let rail_t = frame.transformation;
        let on_rail = Site::new(pos, rail_t, start);

        if let Some(object) = self.ctx.structures.rail.get(block.rail_type(j)).cloned() {
            self.place(object, on_rail, 1.0, None);
        }
        self.points_of_interest(block, next, j, &frame);
        self.pole(block, j, &frame);
        let structures = &self.ctx.structures;
        let mut sides = vec![];
        for (wall, left, right) in [
            (block.walls.get(j), &structures.wall_left, &structures.wall_right),
            (block.dikes.get(j), &structures.dike_left, &structures.dike_right),
        ] {
            let Some(wall) = wall.filter(|w| w.exists) else {
                continue;
            };
            if wall.direction.includes_left() {
                sides.extend(left.get(wall.kind).cloned());
            }
            if wall.direction.includes_right() {
                sides.extend(right.get(wall.kind).cloned());
            }
        }
        for object in sides {
            self.place(object, on_rail, 1.0, None);
        }
        if j == 0 {
            self.world_sounds(block, &frame);
        }
        self.forms(block, next, j, on_rail);
        self.cracks(block, next, j, on_rail);
        if let Some(objects) = block.rail_free_objects.get(j) {
            for free in objects {
                let Some(object) = self.ctx.structures.free_objects.get(free.kind).cloned() else {
                    continue;
                };
                let dz = free.track_position - start;
                let position = pos + rail_t.apply(free.offset.x, free.offset.y, dz);
                let site = Site::new(position, rail_t, free.track_position).turned(&free.offset);
                self.place(object, site, 1.0, None);
            }
        }
        if j == 0 {
            self.transponder_objects(block, pos, rail_t);
            self.signals(block, pos, rail_t);
            self.sections(i, block);
            self.posts(block, pos, rail_t);
        }
    }

    fn points_of_interest(&mut self, block: &Block, next: Option<&Block>, j: usize, frame: &RailFrame) {
        let rail = block.rail(j);
        let end = next.filter(|n| n.rails.len() > j).map(|n| n.rails[j]);
        for poi in block.points_of_interest.iter().filter(|p| p.rail == j) {
            let d = poi.track_position - self.block_start;
            let (x, y) = match end {
                Some(end) => {
                    let r = d / self.interval;
                    (
                        rail.start_x + r * (end.end_x - rail.start_x),
                        rail.start_y + r * (end.end_y - rail.start_y),
                    )
                }
                None => (rail.start_x, rail.start_y),
            };
            self.ctx.route.points_of_interest.push(PointOfInterest {
                track_position: poi.track_position,
                offset: Vector3::new(poi.offset.x + x, poi.offset.y + y, 0.0),
                yaw: poi.offset.yaw + frame.planar,
                pitch: poi.offset.pitch + frame.updown,
                roll: poi.offset.roll,
                text: poi.text.clone(),
            });
        }
    }

    fn pole(&mut self, block: &Block, j: usize, frame: &RailFrame) {
        let Some(pole) = block.poles.get(j).filter(|p| p.exists) else {
            return;
        };
        let phase = self.block_start / pole.interval;
        let dz = phase - (phase + 0.5).floor();
        if !(-0.01..=0.01).contains(&dz) {
            return;
        }
        let Some(object) = self
            .ctx
            .structures
            .poles
            .get(pole.mode)
            .and_then(|t| t.get(pole.kind))
            .cloned()
        else {
            return;
        };
        let site = if pole.mode == 0 {
            let site = Site::new(frame.position, frame.transformation, self.block_start);
            if pole.location > 0.0 {
                self.place(Rc::new(object.mirrored()), site, 1.0, None);
                return;
            }
            site
        } else {
            let dx = -pole.location * POLE_SPACING;
            let (forward, side, _) = self.rail_axes(frame);
            Site::new(
                frame.position + side * dx + forward * dz,
                frame.transformation,
                self.block_start,
            )
        };
        self.place(object, site, 1.0, None);
    }

    fn world_sounds(&mut self, block: &Block, frame: &RailFrame) {
        let (forward, side, up) = self.rail_axes(frame);
        for sound in &block.sounds {
            let d = sound.track_position - self.block_start;
            let position = frame.position + side * sound.x + up * sound.y + forward * d;
            match sound.kind {
                SoundKind::World(buffer) => self.ctx.route.sounds.push(WorldSound {
                    buffer,
                    position,
                    track_position: sound.track_position,
                }),
                SoundKind::Microphone {
                    backward_tolerance,
                    forward_tolerance,
                } => self.ctx.route.microphones.push(Microphone {
                    position,
                    track_position: sound.track_position,
                    backward_tolerance,
                    forward_tolerance,
                }),
                SoundKind::Train { .. } => {}
            }
        }
    }

    fn forms(&mut self, block: &Block, next: Option<&Block>, j: usize, site: Site) {
        for form in &block.forms {
            if form.primary == j {
                match form.secondary {
                    FormSecondary::Stub => self.platform(form, Side::Left, Center::Omitted, site),
                    FormSecondary::Left => self.platform(form, Side::Left, Center::Plain, site),
                    FormSecondary::Right => self.platform(form, Side::Right, Center::Plain, site),
                    FormSecondary::Rail(s) => {
                        if !block.is_rail_started(s) {
                            self.report(DiagnosticKind::RailNotStarted {
                                command: "Track.Form".into(),
                                rail: s as i32,
                            });
                            continue;
                        }
                        let (d0, d1) = spread(block, next, j, s);
                        if d0 < 0.0 {
                            self.platform(form, Side::Left, Center::Stretched(d0, d1), site);
                        } else if d0 > 0.0 {
                            self.platform(form, Side::Right, Center::Stretched(d0, d1), site);
                        }
                    }
                }
            } else if form.secondary == FormSecondary::Rail(j) {
                let primary = if form.primary > 0 {
                    block.rail(form.primary).start_x
                } else {
                    0.0
                };
                let side = if primary - block.rail(j).start_x < 0.0 {
                    Side::Left
                } else {
                    Side::Right
                };
                self.platform(form, side, Center::Omitted, site);
            }
        }
    }

    fn platform(&mut self, form: &Form, side: Side, center: Center, site: Site) {
        let platform = Platform::new(&self.ctx.structures, form, side);
        let [form_name, form_center_name, roof_name, roof_center_name] = platform.names;
        self.place_or_report(platform.form, "Track.Form", form_name, form.form, site);
        if center != Center::Omitted {
            self.place_or_report(
                center_piece(platform.form_center, center),
                "Track.Form",
                form_center_name,
                form.form,
                site,
            );
        }
        if form.roof > 0 {
            self.place_or_report(platform.roof, "Track.Form", roof_name, form.roof, site);
            if center != Center::Omitted {
                self.place_or_report(
                    center_piece(platform.roof_center, center),
                    "Track.Form",
                    roof_center_name,
                    form.roof,
                    site,
                );
            }
        }
    }

    fn cracks(&mut self, block: &Block, next: Option<&Block>, j: usize, site: Site) {
        for crack in block.cracks.iter().filter(|c| c.primary == j) {
            if !block.is_rail_started(crack.secondary) {
                self.report(DiagnosticKind::RailNotStarted {
                    command: "Track.Crack".into(),
                    rail: crack.secondary as i32,
                });
                continue;
            }
            let (d0, d1) = spread(block, next, j, crack.secondary);
            let structures = &self.ctx.structures;
            let (object, what) = if d0 < 0.0 {
                (structures.crack_left.get(crack.kind).cloned(), "CrackL")
            } else if d0 > 0.0 {
                (structures.crack_right.get(crack.kind).cloned(), "CrackR")
            } else {
                continue;
            };
            let object = center_piece(object, Center::Stretched(d0, d1));
            self.place_or_report(object, "Track.Crack", what, crack.kind, site);
        }
    }

    fn transponder_objects(&mut self, block: &Block, pos: Vector3, rail_t: Transformation) {
        for t in &block.transponders {
            let object = if t.show_default_object {
                match t.kind {
                    TransponderKind::Beacon(k @ 0..=4) => Some((
                        self.ctx.compat.beacons[k as usize].clone(),
                        0.25 + 0.75 * self.brightness_at(t.track_position),
                    )),
                    _ => None,
                }
            } else {
                t.beacon
                    .and_then(|b| self.ctx.structures.beacon.get(b))
                    .map(|o| (o.clone(), 1.0))
            };
            if let Some((object, brightness)) = object {
                let dz = t.track_position - self.block_start;
                let site = Site::new(pos + rail_t.apply(t.offset.x, t.offset.y, dz), rail_t, t.track_position)
                    .turned(&t.offset);
                self.place(object, site, brightness, None);
            }
        }
        for destination in &block.destinations {
            let Some(object) = destination
                .beacon
                .and_then(|b| self.ctx.structures.beacon.get(b))
                .cloned()
            else {
                continue;
            };
            let dz = destination.track_position - self.block_start;
            let offset = &destination.offset;
            let site = Site::new(pos + rail_t.apply(offset.x, offset.y, dz), rail_t, destination.track_position)
                .turned(offset);
            self.place(object, site, 1.0, None);
        }
    }

    fn signals(&mut self, block: &Block, pos: Vector3, rail_t: Transformation) {
        for signal in &block.signals {
            let dz = signal.track_position - self.block_start;
            let brightness = 0.25 + 0.75 * self.brightness_at(signal.track_position);
            if signal.show_post {
                let post = self.ctx.compat.signal_post.clone();
                let site = Site::new(pos + rail_t.apply(signal.offset.x, 0.0, dz), rail_t, signal.track_position);
                self.place(post, site, brightness, None);
            }
            if !signal.show_object {
                continue;
            }
            let object = match &*signal.definition {
                SignalDefinition::Animated(object) => Some((object.clone(), 1.0)),
                SignalDefinition::Compatibility { numbers, objects } => {
                    let refresh_rate = 1.0 + 0.01 * self.ctx.rng.gen::<f64>();
                    compatibility_signal(numbers, objects, refresh_rate).map(|o| (o, brightness))
                }
                SignalDefinition::RawObjectPair {
                    base,
                    glow,
                    signal_textures,
                    glow_textures,
                } => raw_signal(base.as_ref(), glow.as_ref(), signal_textures, glow_textures).map(|o| (o, 1.0)),
            };
            if let Some((object, brightness)) = object {
                let offset = &signal.offset;
                let site = Site::new(pos + rail_t.apply(offset.x, offset.y, dz), rail_t, signal.track_position)
                    .turned(offset);
                self.place(object, site, brightness, Some(signal.section));
            }
        }
    }

    fn transponder_event(t: &TransponderDefinition, section: Option<usize>) -> Event {
        Event::Transponder(Transponder {
            kind: t.kind,
            data: t.data,
            section,
            clip_to_first_red_section: t.clip_to_first_red_section,
        })
    }

    /// Creates the sections of the block.
    ///
    /// Transponders that report on a section are only emitted once the section exists,
    ///     which may be some blocks after the transponder.
    fn sections(&mut self, i: usize, block: &Block) {
        let first_used = self.first_used;
        for definition in &block.sections {
            let m = self.ctx.route.sections.len();
            for g in first_used..=i {
                let block_start = g as f64 * self.interval;
                for slot in &mut self.transponders[g] {
                    let Some(t) = slot.filter(|t| t.section == Some(m)) else {
                        continue;
                    };
                    *slot = None;
                    self.elements[g - first_used].push(
                        t.track_position - block_start,
                        Self::transponder_event(&t, Some(m)),
                    );
                }
            }
            let signal_speeds = &self.ctx.route.signal_speeds;
            let aspects = definition
                .aspects
                .iter()
                .map(|&number| SectionAspect {
                    number,
                    speed: usize::try_from(number)
                        .ok()
                        .and_then(|k| signal_speeds.get(k))
                        .copied()
                        .unwrap_or(f64::INFINITY),
                })
                .collect();
            let previous = m.checked_sub(1);
            if let Some(p) = previous {
                self.ctx.route.sections[p].next = Some(m);
            }
            self.ctx.route.sections.push(Section {
                track_position: definition.track_position,
                aspects,
                kind: definition.kind,
                previous,
                next: None,
                station: definition.departure_station,
                invisible: definition.invisible,
            });
            let delta = definition.track_position - self.block_start;
            self.last_element().push(delta, Event::SectionChange { previous, next: m });
        }
        let sections = self.ctx.route.sections.len();
        let n = self.elements.len() - 1;
        for slot in &mut self.transponders[i] {
            let Some(t) = slot.filter(|t| t.section.is_some_and(|s| s < sections)) else {
                continue;
            };
            *slot = None;
            self.elements[n].push(t.track_position - self.block_start, Self::transponder_event(&t, t.section));
        }
    }

    fn posts(&mut self, block: &Block, pos: Vector3, rail_t: Transformation) {
        for limit in block.limits.iter().filter(|l| l.direction != 0) {
            let dz = limit.track_position - self.block_start;
            let dx = LIMIT_POST_OFFSET * limit.direction as f64;
            let site = Site::new(pos + rail_t.apply(dx, 0.0, dz), rail_t, limit.track_position);
            let compat = &self.ctx.compat;
            if limit.speed <= 0.0 || limit.speed >= 1000.0 {
                let post = compat.limit_post_infinite.clone();
                self.place(post, site, 1.0, None);
                continue;
            }
            let post = match limit.course.signum() {
                -1 => compat.limit_post_left.clone(),
                1 => compat.limit_post_right.clone(),
                _ => compat.limit_post_straight.clone(),
            };
            self.place(post, site, 1.0, None);
            let value = (limit.speed / self.ctx.options.unit_of_speed).round() as i64;
            let numerals = self.limit_numerals(value);
            self.place(numerals, site, 1.0, None);
        }
        for stop in block.stops.iter().filter(|s| s.direction != 0) {
            let dz = stop.track_position - self.block_start;
            let dx = STOP_POST_OFFSET * stop.direction as f64;
            let post = self.ctx.compat.stop_post.clone();
            let site = Site::new(pos + rail_t.apply(dx, 0.0, dz), rail_t, stop.track_position);
            self.place(post, site, 1.0, None);
        }
    }

    /// The numeral plate of a speed limit post, with a digit texture per material.
    fn limit_numerals(&mut self, value: i64) -> Rc<UnifiedObject> {
        let compat = &self.ctx.compat;
        let (mut object, digits) = match value {
            i64::MIN..=9 => (compat.limit_one_digit.clone(), vec![value.max(0)]),
            10..=99 => (compat.limit_two_digits.clone(), vec![value / 10, value % 10]),
            _ => (
                compat.limit_three_digits.clone(),
                vec![value / 100 % 10, value / 10 % 10, value % 10],
            ),
        };
        for (k, digit) in digits.into_iter().enumerate() {
            let path = self.ctx.compat.limit_graphics_folder.join(format!["limit_{digit}.png"]);
            match self.ctx.assets.register_texture(&path, TextureOptions::default()) {
                Ok(texture) => {
                    if let Some(material) = object.materials.get_mut(k) {
                        material.daytime_texture = Some(texture);
                    }
                }
                Err(err) => self.report(DiagnosticKind::FileNotLoaded {
                    file: path.display().to_string(),
                    reason: err.to_string(),
                }),
            }
        }
        Rc::new(UnifiedObject::Static(object))
    }

    /// Emits the transponders whose section was never created; they report on no section.
    fn orphan_transponders(&mut self) {
        for g in self.first_used..self.transponders.len() {
            let block_start = g as f64 * self.interval;
            for slot in &mut self.transponders[g] {
                if let Some(t) = slot.take() {
                    self.elements[g - self.first_used]
                        .push(t.track_position - block_start, Self::transponder_event(&t, None));
                }
            }
        }
    }

    fn destination_events(&mut self) {
        for (element, block) in self.elements.iter_mut().zip(&self.blocks[self.first_used..]) {
            for destination in &block.destinations {
                element.push(
                    destination.track_position - element.starting_track_position,
                    Event::DestinationChange {
                        kind: destination.kind,
                        next: destination.next,
                        previous: destination.previous,
                        trigger_once: destination.trigger_once,
                    },
                );
            }
        }
    }
}

fn chord_of(block: &Block, interval: f64) -> Chord {
    chord(block.curve_radius, block.pitch, interval)
}

/// A station ends one block after the forward tolerance of its last stop point.
fn add_station_ends(ctx: &mut Context, elements: &mut [TrackElement], first_used: usize) {
    let interval = ctx.options.block_interval;
    for (s, station) in ctx.route.stations.iter().enumerate() {
        let Some(stop) = station.stops.last() else {
            continue;
        };
        let p = stop.track_position + stop.forward_tolerance + STATION_END_MARGIN_BLOCKS * interval;
        let k = block::block_index(p, interval) as i64 - first_used as i64;
        let Some(element) = usize::try_from(k).ok().and_then(|k| elements.get_mut(k)) else {
            continue;
        };
        let delta = p - (k as f64 + first_used as f64) * interval;
        element.push(delta, Event::StationEnd(s));
    }
}

/// A route without points of interest gets one at the first stop point of every station.
fn add_default_points_of_interest(ctx: &mut Context) {
    if !ctx.route.points_of_interest.is_empty() {
        return;
    }
    let points: Vec<PointOfInterest> = ctx
        .route
        .stations
        .iter()
        .filter_map(|station| {
            let stop = station.stops.first()?;
            let x = match (station.open_left_doors, station.open_right_doors) {
                (true, false) => -2.5,
                (false, true) => 2.5,
                _ => 0.0,
            };
            Some(PointOfInterest {
                track_position: stop.track_position,
                offset: Vector3::new(x, 2.8, 0.0),
                yaw: 0.0,
                pitch: 0.0,
                roll: 0.0,
                text: Some(station.name.clone()),
            })
        })
        .collect();
    ctx.route.points_of_interest = points;
}

/// Spreads cant backwards over straight elements and resolves cant on adjacent curves.
fn propagate_cant(elements: &mut [TrackElement]) {
    for i in (1..elements.len()).rev() {
        let previous = elements[i - 1].curve_cant;
        let current = &mut elements[i].curve_cant;
        if *current == 0.0 {
            *current = previous;
        } else if previous != 0.0 {
            if current.signum() == previous.signum() {
                if previous.abs() > current.abs() {
                    *current = previous;
                }
            } else {
                *current = 0.5 * (*current + previous);
            }
        }
    }
}

fn finish_stations(ctx: &mut Context) {
    let n = ctx.route.stations.len();
    for i in 0..n {
        let station = &mut ctx.route.stations[i];
        if station.stops.is_empty() && station.stop_mode != StopMode::AllPass {
            let name = station.name.clone();
            station.stop_mode = StopMode::AllPass;
            ctx.diagnostics
                .report(DiagnosticKind::StationWithoutStops { station: name }, None);
        }
        if ctx.route.stations[i].kind != StationKind::ChangeEnds {
            continue;
        }
        let name = ctx.route.stations[i].name.clone();
        match ctx.route.stations.get_mut(i + 1) {
            Some(next) => {
                if next.stop_mode != StopMode::AllStop {
                    next.stop_mode = StopMode::AllStop;
                    let next = next.name.clone();
                    ctx.diagnostics.report(
                        DiagnosticKind::ChangeEndsBeforePassStation { station: name, next },
                        None,
                    );
                }
            }
            None => {
                ctx.route.stations[i].kind = StationKind::Terminal;
                ctx.diagnostics
                    .report(DiagnosticKind::ChangeEndsWithoutNextStop { station: name }, None);
            }
        }
    }
    if let Some(last) = ctx.route.stations.last_mut() {
        last.kind = StationKind::Terminal;
    }
}

fn atc_track_status(data: i32) -> Event {
    Event::Transponder(Transponder {
        kind: TransponderKind::AtcTrackStatus,
        data,
        section: Some(0),
        clip_to_first_red_section: false,
    })
}

fn packed(kind: TransponderKind, speed: f64, distance: f64) -> Event {
    let speed = speed.min(MAXIMUM_PACKED_SPEED).round().max(0.0) as u32;
    let distance = distance.min(MAXIMUM_PACKED_DISTANCE).round().max(0.0) as u32;
    Event::Transponder(Transponder {
        kind,
        data: (speed | distance << 12) as i32,
        section: None,
        clip_to_first_red_section: false,
    })
}

/// Adds the beacons that switch the train between ATS and ATC territory at stations
///     and that carry speed limits to the train's safety systems.
fn add_atc_beacons(ctx: &mut Context, elements: &mut [TrackElement]) {
    let stations = &ctx.route.stations;
    let system = |s: usize| stations.get(s).map(|s| s.safety_system);
    let mut atc = false;
    let mut collected = vec![];
    for element in elements.iter_mut() {
        let start = element.starting_track_position;
        let mut statuses = vec![];
        for event in &element.events {
            match (&event.event, atc) {
                (Event::StationStart(s), false) if system(*s) == Some(SafetySystem::Atc) => {
                    statuses.extend([0, 1]);
                    atc = true;
                }
                (Event::StationStart(s), true) if system(*s) == Some(SafetySystem::Ats) => {
                    statuses.extend([2, 3]);
                }
                (Event::StationEnd(s), true) if system(*s) == Some(SafetySystem::Atc) => {
                    statuses.extend([1, 2]);
                }
                (Event::StationEnd(s), true) if system(*s) == Some(SafetySystem::Ats) => {
                    statuses.extend([3, 0]);
                    atc = false;
                }
                (Event::LimitChange { next, .. }, true) => {
                    collected.push(packed(TransponderKind::AtcSpeedLimit, 3.6 * next, start + event.delta));
                }
                (Event::Transponder(t), _) if t.kind == TransponderKind::InternalAtsPTemporarySpeedLimit => {
                    collected.push(packed(
                        TransponderKind::AtsPTemporarySpeedLimit,
                        t.data as f64,
                        start + event.delta,
                    ));
                }
                _ => {}
            }
        }
        for data in statuses {
            element.push(0.0, atc_track_status(data));
        }
    }
    if let Some(first) = elements.first_mut() {
        for event in collected {
            first.push(0.0, event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::MemoryAssets;
    use crate::options::CompileOptions;
    use crate::output::CompiledRoute;
    use crate::testing::{compile, compile_csv, compile_with_assets};
    use approx::assert_relative_eq;
    use routelang::{Diagnostic, DiagnosticKind};

    fn events(route: &CompiledRoute) -> impl Iterator<Item = (f64, &Event)> {
        route
            .elements
            .iter()
            .flat_map(|e| e.events.iter().map(move |ev| (e.starting_track_position + ev.delta, &ev.event)))
    }

    fn element_at(route: &CompiledRoute, track_position: f64) -> &TrackElement {
        route
            .elements
            .iter()
            .find(|e| (e.starting_track_position - track_position).abs() < 1e-6)
            .expect("element at track position")
    }

    fn has_kind(diagnostics: &[Diagnostic], f: impl Fn(&DiagnosticKind) -> bool) -> bool {
        diagnostics.iter().any(|d| f(&d.kind))
    }

    #[test]
    fn chord_of_straight_track() {
        let c = chord(0.0, 0.0, 25.0);
        assert_eq!(
            c,
            Chord {
                half_angle: 0.0,
                length: 25.0,
                rise: 0.0
            }
        );
    }

    #[test]
    fn chord_of_gradient() {
        let c = chord(0.0, 0.01, 25.0);
        assert_relative_eq!(c.length * c.length + c.rise * c.rise, 625.0, epsilon = 1e-9);
        assert_relative_eq!(c.rise / c.length, 0.01, epsilon = 1e-12);
    }

    #[test]
    fn chord_of_curve() {
        let c = chord(-300.0, 0.0, 25.0);
        assert_relative_eq!(c.half_angle, -0.5 * 25.0 / 300.0, epsilon = 1e-12);
        assert_relative_eq!(c.length, 2.0 * 300.0 * (12.5_f64 / 300.0).sin(), epsilon = 1e-9);
    }

    macro_rules! state_function_tests {
        ( $( ($name: ident, $numbers: expr, $want: expr), )+ ) => {
            $(
                #[test]
                fn $name() {
                    assert_eq!(compatibility_state_function(&$numbers), $want);
                }
            )+
        };
    }

    state_function_tests!(
        (state_function_single_state, [0], "0"),
        (state_function_two_states, [0, 4], "section 0 <= 0 1 ?"),
        (state_function_three_states, [0, 2, 4], "section 0 <= 0 section 2 <= 1 2 ? ?"),
    );

    #[test]
    fn raw_signal_skips_aspects_without_textures() {
        let base = crate::assets::placeholder_object();
        let textures = [Some(TextureHandle(0)), None, Some(TextureHandle(2))];
        let object = raw_signal(Some(&base), None, &textures, &[]).unwrap();
        let UnifiedObject::Animated(objects) = &*object else {
            panic!("signal is not animated");
        };
        assert_eq!(objects[0].states.len(), 2);
        assert_eq!(objects[0].state_function.as_deref(), Some("section 0 <= 0 1 ?"));
        assert_eq!(
            objects[0].states[1].materials[0].daytime_texture,
            Some(TextureHandle(2))
        );
    }

    #[test]
    fn heights_are_interpolated() {
        let mut blocks: Vec<Block> = (0..5).map(|_| Block::initial(routelang::Dialect::Csv, 25.0)).collect();
        for block in &mut blocks {
            block.height = None;
        }
        blocks[0].height = Some(1.0);
        blocks[3].height = Some(4.0);
        interpolate_heights(&mut blocks);
        let heights: Vec<Option<f64>> = blocks.iter().map(|b| b.height).collect();
        assert_eq!(heights, vec![Some(1.0), Some(2.0), Some(3.0), Some(4.0), Some(4.0)]);
    }

    #[test]
    fn cant_spreads_backwards() {
        let mut elements: Vec<TrackElement> = [0.0, 0.1, 0.0, -0.1, 0.05]
            .iter()
            .map(|c| TrackElement {
                curve_cant: *c,
                ..Default::default()
            })
            .collect();
        propagate_cant(&mut elements);
        let cants: Vec<f64> = elements.iter().map(|e| e.curve_cant).collect();
        assert_eq!(cants[1], 0.1);
        assert_eq!(cants[2], 0.1);
        assert_eq!(cants[3], -0.1);
        assert_relative_eq!(cants[4], -0.025, epsilon = 1e-12);
    }

    #[test]
    fn two_stations() {
        let (route, diagnostics) = compile_csv("0,Track.Sta,A\n25,Track.Sta,B");
        assert_eq!(route.stations.len(), 2);
        assert!(element_at(&route, 0.0)
            .events
            .iter()
            .any(|e| e.event == Event::StationStart(0)));
        assert!(element_at(&route, 25.0)
            .events
            .iter()
            .any(|e| e.event == Event::StationStart(1)));
        assert_eq!(route.stations[0].stop_mode, StopMode::AllPass);
        assert_eq!(route.stations[1].kind, StationKind::Terminal);
        let without_stops = diagnostics
            .iter()
            .filter(|d| matches!(d.kind, DiagnosticKind::StationWithoutStops { .. }))
            .count();
        assert_eq!(without_stops, 2);
    }

    #[test]
    fn curve_turns_the_heading() {
        let (route, _) = compile_csv("0,Track.Curve 300\n25,Track.Curve 0");
        let before = element_at(&route, 0.0).world_direction;
        let after = element_at(&route, 25.0).world_direction;
        assert_relative_eq!(before.x.atan2(before.z), 0.0, epsilon = 1e-12);
        assert_relative_eq!(after.x.atan2(after.z), 25.0 / 300.0, epsilon = 1e-9);
    }

    #[test]
    fn preview_does_not_place_scenery() {
        let options = CompileOptions {
            preview_only: true,
            ..Default::default()
        };
        let (route, _) = compile("0,Track.Sta,A\n25,Track.Stop 1", options);
        // The track runs 600 m past the last command.
        assert_eq!(route.elements.len(), 27);
        assert!(route.placements.is_empty());
        assert!(route.sections.is_empty());
        assert_eq!(route.stations[0].stops.len(), 1);
    }

    #[test]
    fn long_blocks_are_subdivided() {
        let (route, _) = compile_csv("0,Track.Sta,A\n25,Track.Stop 1");
        assert_eq!(route.elements.len(), 26 * 5 + 1);
        assert!(route
            .elements
            .windows(2)
            .all(|w| w[0].starting_track_position < w[1].starting_track_position));
    }

    #[test]
    fn track_ends_with_the_last_element() {
        let (route, _) = compile_csv("0,Track.Sta,A");
        let last = route.elements.last().unwrap();
        assert!(last.events.iter().any(|e| matches!(e.event, Event::TrackEnd(_))));
    }

    #[test]
    fn point_sound_where_a_rail_crosses_the_main_track() {
        let (route, _) = compile_csv("Options.BlockLength 50\n0,Track.RailStart 1;-2\n50,Track.Rail 1;2");
        let positions: Vec<f64> = events(&route)
            .filter(|(_, e)| **e == Event::PointSound)
            .map(|(p, _)| p)
            .collect();
        assert_eq!(positions.len(), 1, "{positions:?}");
        assert_relative_eq!(positions[0], 12.5, epsilon = 1e-9);
    }

    #[test]
    fn no_point_sound_for_a_rail_on_one_side() {
        let (route, _) = compile_csv("Options.BlockLength 50\n0,Track.RailStart 1;-2\n50,Track.Rail 1;-3");
        assert!(!events(&route).any(|(_, e)| *e == Event::PointSound));
    }

    #[test]
    fn station_end_just_before_a_block_boundary() {
        let (route, _) = compile_csv("0,Track.Sta A\n0,Track.Stop 1;5;24.9999");
        let element = route
            .elements
            .iter()
            .find(|e| e.events.iter().any(|ev| ev.event == Event::StationEnd(0)))
            .expect("station end event");
        assert_relative_eq!(element.starting_track_position, 50.0);
    }

    #[test]
    fn station_ends_after_the_last_stop() {
        let (route, diagnostics) = compile_csv("0,Track.Sta A\n10,Track.Stop 1");
        let (position, _) = events(&route)
            .find(|(_, e)| **e == Event::StationEnd(0))
            .expect("station end event");
        // Stop point, forward tolerance and one block.
        assert_relative_eq!(position, 10.0 + 5.0 + 25.0, epsilon = 1e-9);
        assert_eq!(route.stations[0].stop_mode, StopMode::AllStop);
        assert_eq!(route.stations[0].kind, StationKind::Terminal);
        assert!(!has_kind(&diagnostics, |k| matches!(
            k,
            DiagnosticKind::StationWithoutStops { .. }
        )));
    }

    #[test]
    fn default_point_of_interest_at_each_station() {
        let (route, _) = compile_csv("0,Track.Sta A\n10,Track.Stop 1");
        assert_eq!(route.points_of_interest.len(), 1);
        let poi = &route.points_of_interest[0];
        assert_eq!(poi.text.as_deref(), Some("A"));
        assert_eq!(poi.track_position, 10.0);
        assert_eq!(poi.offset.y, 2.8);
    }

    #[test]
    fn sections_are_linked() {
        let (route, _) = compile_csv("0,Track.Section 0;2;4\n50,Track.Section 0;4");
        assert_eq!(route.sections.len(), 3);
        assert_eq!(route.sections[0].next, Some(1));
        assert_eq!(route.sections[1].previous, Some(0));
        assert_eq!(route.sections[1].next, Some(2));
        assert_eq!(route.sections[2].previous, Some(1));
        assert_eq!(route.sections[1].aspects.len(), 3);
        assert_eq!(route.sections[1].aspects[2].speed, f64::INFINITY);
        let changes: Vec<(f64, Option<usize>, usize)> = events(&route)
            .filter_map(|(p, e)| match e {
                Event::SectionChange { previous, next } => Some((p, *previous, *next)),
                _ => None,
            })
            .collect();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].1, Some(0));
        assert_eq!(changes[0].2, 1);
        assert_relative_eq!(changes[1].0, 50.0, epsilon = 1e-9);
    }

    #[test]
    fn beacon_without_section_reports_on_none() {
        let (route, _) = compile_csv("10,Track.Beacon 20;0;-1;7");
        let transponders: Vec<(f64, Transponder)> = events(&route)
            .filter_map(|(p, e)| match e {
                Event::Transponder(t) if t.kind == TransponderKind::Beacon(20) => Some((p, *t)),
                _ => None,
            })
            .collect();
        assert_eq!(transponders.len(), 1);
        assert_relative_eq!(transponders[0].0, 10.0, epsilon = 1e-9);
        assert_eq!(transponders[0].1.section, None);
        assert_eq!(transponders[0].1.data, 7);
    }

    #[test]
    fn limit_post_registers_digit_textures() {
        let mut assets = MemoryAssets::new();
        let (route, _) = compile_with_assets("0,Track.Limit 60;1", CompileOptions::default(), &mut assets);
        let registered: Vec<String> = assets
            .textures
            .iter()
            .filter_map(|(path, _)| path.file_name().map(|f| f.to_string_lossy().into_owned()))
            .collect();
        assert!(registered.contains(&"limit_6.png".to_string()));
        assert!(registered.contains(&"limit_0.png".to_string()));
        let change = events(&route).find_map(|(_, e)| match e {
            Event::LimitChange { previous, next } => Some((*previous, *next)),
            _ => None,
        });
        let (previous, next) = change.expect("limit change");
        assert_eq!(previous, f64::INFINITY);
        assert_relative_eq!(next, 60.0 / 3.6, epsilon = 1e-9);
    }

    #[test]
    fn atc_station_switches_track_status() {
        let (route, _) = compile_csv("0,Track.Sta A;;;;;;ATC\n10,Track.Stop 1");
        let statuses: Vec<i32> = events(&route)
            .filter_map(|(_, e)| match e {
                Event::Transponder(t) if t.kind == TransponderKind::AtcTrackStatus => Some(t.data),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![0, 1, 1, 2]);
    }

    #[test]
    fn change_ends_without_next_station_becomes_terminal() {
        let (route, diagnostics) = compile_csv("0,Track.Sta A;;C\n10,Track.Stop 1");
        assert_eq!(route.stations[0].kind, StationKind::Terminal);
        assert!(has_kind(&diagnostics, |k| matches!(
            k,
            DiagnosticKind::ChangeEndsWithoutNextStop { .. }
        )));
    }

    #[test]
    fn change_ends_makes_the_next_station_stop() {
        let (route, diagnostics) = compile_csv("0,Track.Sta A;;C\n10,Track.Stop 1\n100,Track.Sta B;P\n110,Track.Stop 1");
        assert_eq!(route.stations[0].kind, StationKind::ChangeEnds);
        assert_eq!(route.stations[1].stop_mode, StopMode::AllStop);
        assert_eq!(route.stations[1].kind, StationKind::Terminal);
        assert!(has_kind(&diagnostics, |k| matches!(
            k,
            DiagnosticKind::ChangeEndsBeforePassStation { .. }
        )));
    }
}
