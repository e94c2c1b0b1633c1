//! The `Track` namespace.
//!
//! Track commands write into the block containing the current track position.
//! Commands that change the shape of the track, speed limits and stations also run in
//!     preview mode; everything that only exists to be drawn, heard or read by the
//!     train's safety systems does not.

use super::BuiltIn;
use crate::assets::{SoundHandle, TextureHandle, TextureOptions};
use crate::block::{
    Block, BrightnessChange, Crack, DestinationDefinition, Direction, Form, FormSecondary, FreeObject, Limit,
    Offset, PoiDefinition, SectionDefinition, SignalPlacement, SoundDefinition, SoundKind, Stop,
    TransponderDefinition, WallDike,
};
use crate::compat::RELAY_SIGNAL;
use crate::context::Invocation;
use crate::events::TransponderKind;
use crate::output::{
    Color24, Fog, Marker, MarkerMessage, MessageColor, PreTrainPoint, SafetySystem, SectionKind, Station,
    StationKind, StopMode, NO_FOG_END, NO_FOG_START,
};
use crate::structures::{StructureTables, Table};
use rand::Rng;
use routelang::diagnostics::Fallback;
use routelang::{numbers, Dialect, DiagnosticKind};
use std::collections::HashMap;

pub fn commands() -> HashMap<&'static str, BuiltIn> {
    HashMap::from([
        ("track.railstart", BuiltIn::new(rail_start).in_preview()),
        ("track.rail", BuiltIn::new(rail).in_preview()),
        ("track.railend", BuiltIn::new(rail_end).in_preview()),
        ("track.railtype", BuiltIn::new(rail_type)),
        ("track.accuracy", BuiltIn::new(accuracy).in_preview()),
        ("track.pitch", BuiltIn::new(pitch).in_preview()),
        ("track.curve", BuiltIn::new(curve).in_preview()),
        ("track.turn", BuiltIn::new(turn).in_preview()),
        ("track.adhesion", BuiltIn::new(adhesion).in_preview()),
        ("track.brightness", BuiltIn::new(brightness)),
        ("track.fog", BuiltIn::new(fog)),
        ("track.section", BuiltIn::new(section)),
        ("track.sections", BuiltIn::new(section_value_based)),
        ("track.sigf", BuiltIn::new(signal_with_object)),
        ("track.signal", BuiltIn::new(signal)),
        ("track.sig", BuiltIn::new(signal)),
        ("track.relay", BuiltIn::new(relay)),
        ("track.destination", BuiltIn::new(destination)),
        ("track.beacon", BuiltIn::new(beacon)),
        ("track.transponder", BuiltIn::new(transponder)),
        ("track.tr", BuiltIn::new(transponder)),
        ("track.atssn", BuiltIn::new(ats_sn)),
        ("track.atsp", BuiltIn::new(ats_p)),
        ("track.pattern", BuiltIn::new(pattern)),
        ("track.plimit", BuiltIn::new(permanent_limit)),
        ("track.limit", BuiltIn::new(limit).in_preview()),
        ("track.stop", BuiltIn::new(stop).in_preview()),
        ("track.stoppos", BuiltIn::new(stop).in_preview()),
        ("track.sta", BuiltIn::new(sta).in_preview()),
        ("track.station", BuiltIn::new(station).in_preview()),
        ("track.buffer", BuiltIn::new(buffer)),
        ("track.form", BuiltIn::new(form)),
        ("track.pole", BuiltIn::new(pole)),
        ("track.poleend", BuiltIn::new(pole_end)),
        ("track.wall", BuiltIn::new(wall)),
        ("track.wallend", BuiltIn::new(wall_end)),
        ("track.dike", BuiltIn::new(dike)),
        ("track.dikeend", BuiltIn::new(dike_end)),
        ("track.marker", BuiltIn::new(marker)),
        ("track.textmarker", BuiltIn::new(text_marker)),
        ("track.height", BuiltIn::new(height)),
        ("track.ground", BuiltIn::new(ground)),
        ("track.crack", BuiltIn::new(crack)),
        ("track.freeobj", BuiltIn::new(free_object)),
        ("track.back", BuiltIn::new(background)),
        ("track.background", BuiltIn::new(background)),
        ("track.announce", BuiltIn::new(announce)),
        ("track.announceall", BuiltIn::new(announce_all)),
        ("track.doppler", BuiltIn::new(doppler)),
        ("track.dopplerall", BuiltIn::new(doppler)),
        ("track.micsound", BuiltIn::new(microphone)),
        ("track.pretrain", BuiltIn::new(pretrain)),
        ("track.pointofinterest", BuiltIn::new(point_of_interest)),
        ("track.poi", BuiltIn::new(point_of_interest)),
    ])
}

/// Radius in meters within which station arrival and departure sounds are audible.
const STATION_SOUND_RADIUS: f64 = 30.0;

/// Radius in meters within which announcements and world sounds are audible.
const TRACK_SOUND_RADIUS: f64 = 15.0;

/// Height of a signal head that is placed with a negative height, which also adds a post.
const SIGNAL_POST_HEIGHT: f64 = 4.8;

fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

fn strip_prefix_ignore_case<'s>(s: &'s str, prefix: &str) -> Option<&'s str> {
    s.get(..prefix.len())
        .filter(|head| head.eq_ignore_ascii_case(prefix))
        .map(|_| &s[prefix.len()..])
}

fn missing(inv: &mut Invocation, expected: usize) {
    inv.report(DiagnosticKind::MissingArguments {
        command: inv.name(),
        expected,
    });
}

/// Reads an offset from the rail starting at argument `first`:
///     x and y in the route's units of length, then yaw, pitch and roll in degrees.
fn offset(inv: &mut Invocation, first: usize) -> Offset {
    Offset {
        x: inv.length_arg(first, "X", 0.0),
        y: inv.length_arg(first + 1, "Y", 0.0),
        yaw: inv.f64_arg(first + 2, "Yaw", 0.0).to_radians(),
        pitch: inv.f64_arg(first + 3, "Pitch", 0.0).to_radians(),
        roll: inv.f64_arg(first + 4, "Roll", 0.0).to_radians(),
    }
}

/// Reads a rail index; an invalid or negative index ignores the command.
fn rail_index(inv: &mut Invocation, i: usize) -> Option<usize> {
    match inv.arg(i).map(numbers::parse_i32_lenient) {
        None => Some(0),
        Some(None) => {
            inv.invalid("RailIndex", Fallback::IgnoreCommand);
            None
        }
        Some(Some(r)) if r < 0 => {
            inv.out_of_range("RailIndex", "rail indices must be non-negative", Fallback::IgnoreCommand);
            None
        }
        Some(Some(r)) => Some(r as usize),
    }
}

/// Warns if a rail that a command decorates has not been started.
fn check_started(inv: &mut Invocation, rail: usize) {
    if !inv.block().is_rail_started(rail) {
        inv.report(DiagnosticKind::RailNotStarted {
            command: inv.name(),
            rail: rail as i32,
        });
    }
}

/// Index of the section `ahead` sections after the current one.
fn section_ahead(inv: &Invocation, ahead: i32) -> usize {
    (inv.ctx.current_section as i64 + ahead as i64).max(0) as usize
}

fn rail_start(inv: &mut Invocation) {
    start_rail(inv, true);
}

fn rail(inv: &mut Invocation) {
    start_rail(inv, false);
}

/// Starts a rail or moves a rail that is already running.
///
/// A rail moved twice within one block is marked as ending there,
///     so that the second offset only applies from the next block on.
fn start_rail(inv: &mut Invocation, must_be_new: bool) {
    let Some(index) = rail_index(inv, 0) else {
        return;
    };
    if index == 0 {
        inv.out_of_range("RailIndex", "rail 0 is the main track and is always started", Fallback::IgnoreCommand);
        return;
    }
    if must_be_new && inv.block().is_rail_started(index) {
        inv.report(DiagnosticKind::RailAlreadyStarted {
            command: inv.name(),
            rail: index as i32,
        });
    }
    let has_x = inv.num_args() >= 2;
    let has_y = inv.num_args() >= 3;
    let x = inv.arg(1).is_some().then(|| inv.length_arg(1, "X", 0.0));
    let y = inv.arg(2).is_some().then(|| inv.length_arg(2, "Y", 0.0));
    let rail = inv.block().rail_mut(index);
    if rail.refreshed {
        rail.ended = true;
    }
    rail.started = true;
    rail.refreshed = true;
    if let Some(x) = x {
        rail.start_x = x;
    }
    if has_x && !rail.ended {
        rail.end_x = rail.start_x;
    }
    if let Some(y) = y {
        rail.start_y = y;
    }
    if has_y && !rail.ended {
        rail.end_y = rail.start_y;
    }
    if !inv.preview_only() && inv.arg(3).is_some() {
        let structure = inv.i32_arg(3, "RailStructureIndex", 0);
        set_rail_type(inv, index, structure);
    }
}

fn rail_end(inv: &mut Invocation) {
    let Some(index) = rail_index(inv, 0) else {
        return;
    };
    if index == 0 {
        inv.out_of_range("RailIndex", "rail 0 is the main track and cannot end", Fallback::IgnoreCommand);
        return;
    }
    if !inv.block().is_rail_started(index) {
        inv.report(DiagnosticKind::RailNotStarted {
            command: inv.name(),
            rail: index as i32,
        });
        return;
    }
    let x = inv.arg(1).is_some().then(|| inv.length_arg(1, "X", 0.0));
    let y = inv.arg(2).is_some().then(|| inv.length_arg(2, "Y", 0.0));
    let rail = inv.block().rail_mut(index);
    rail.started = false;
    rail.refreshed = false;
    rail.ended = true;
    if let Some(x) = x {
        rail.end_x = x;
    }
    if let Some(y) = y {
        rail.end_y = y;
    }
}

fn rail_type(inv: &mut Invocation) {
    let Some(index) = rail_index(inv, 0) else {
        return;
    };
    check_started(inv, index);
    let structure = inv.i32_arg(1, "RailStructureIndex", 0);
    set_rail_type(inv, index, structure);
}

/// Sets the structure of a rail in the current block, if the structure is defined.
fn set_rail_type(inv: &mut Invocation, rail: usize, structure: i32) {
    if structure < 0 {
        inv.out_of_range(
            "RailStructureIndex",
            "structure indices must be non-negative",
            Fallback::IgnoreCommand,
        );
        return;
    }
    if !inv.ctx.structures.rail.contains(structure) {
        inv.undefined("RailStructureIndex", structure);
        return;
    }
    let ctx = &mut *inv.ctx;
    let block = ctx.block;
    ctx.ensure_blocks(block);
    ctx.blocks[block].set_rail_type(rail, structure, &ctx.structures);
}

fn accuracy(inv: &mut Invocation) {
    let value = inv.f64_arg(0, "Value", 2.0);
    if !(0.0..=4.0).contains(&value) {
        inv.out_of_range("Value", "accuracy ranges from 0 to 4", Fallback::value(value.clamp(0.0, 4.0)));
    }
    inv.block().accuracy = value.clamp(0.0, 4.0);
}

fn pitch(inv: &mut Invocation) {
    let rate = inv.f64_arg(0, "Rate", 0.0);
    inv.block().pitch = 0.001 * rate;
}

fn curve(inv: &mut Invocation) {
    let radius = inv.length_arg(0, "Radius", 0.0);
    let mut cant = 0.001 * inv.f64_arg(1, "CantInMillimeters", 0.0);
    if inv.ctx.options.signed_cant {
        if radius != 0.0 {
            cant *= sign(radius);
        }
    } else {
        cant = cant.abs() * sign(radius);
    }
    let block = inv.block();
    block.curve_radius = radius;
    block.curve_cant = cant;
}

fn turn(inv: &mut Invocation) {
    let ratio = inv.f64_arg(0, "Ratio", 0.0);
    inv.block().turn = ratio;
}

fn adhesion(inv: &mut Invocation) {
    let mut rate = inv.f64_arg(0, "Rate", 100.0);
    if rate < 0.0 {
        inv.out_of_range("Rate", "adhesion must be non-negative", Fallback::value(100));
        rate = 100.0;
    }
    inv.block().adhesion = 0.01 * rate;
}

fn brightness(inv: &mut Invocation) {
    let value = (inv.f64_arg(0, "Value", 255.0) / 255.0).clamp(0.0, 1.0);
    let track_position = inv.track_position();
    inv.block().brightness.push(BrightnessChange { track_position, value });
}

fn color_component(inv: &mut Invocation, i: usize, argument: &'static str) -> u8 {
    let v = inv.i32_arg(i, argument, 128);
    if !(0..=255).contains(&v) {
        let clamped = v.clamp(0, 255);
        inv.out_of_range(argument, "color components range from 0 to 255", Fallback::value(clamped));
        return clamped as u8;
    }
    v as u8
}

fn fog(inv: &mut Invocation) {
    let start = inv.f64_arg(0, "StartingDistance", 0.0);
    let end = inv.f64_arg(1, "EndingDistance", 0.0);
    let color = Color24::new(
        color_component(inv, 2, "RedValue"),
        color_component(inv, 3, "GreenValue"),
        color_component(inv, 4, "BlueValue"),
    );
    let (start, end) = if start < end {
        (start, end)
    } else {
        (NO_FOG_START, NO_FOG_END)
    };
    let track_position = inv.track_position();
    let block = inv.block();
    block.fog = Fog {
        start,
        end,
        color,
        track_position,
    };
    block.fog_defined = true;
}

/// The station whose departure signal the next section is, if any.
///
/// Only the first section after the last stop point of a station that holds its
///     departure signal at red counts.
fn departure_station(inv: &mut Invocation) -> Option<usize> {
    let ctx = &mut *inv.ctx;
    let station = ctx.current_station?;
    let forced = ctx.route.stations.get(station).is_some_and(|s| s.force_stop_signal);
    if forced && ctx.current_stop >= 0 && !ctx.departure_signal_used {
        ctx.departure_signal_used = true;
        Some(station)
    } else {
        None
    }
}

fn section(inv: &mut Invocation) {
    let value_based = inv.ctx.options.value_based_sections;
    add_section(inv, value_based);
}

fn section_value_based(inv: &mut Invocation) {
    add_section(inv, true);
}

fn add_section(inv: &mut Invocation, value_based: bool) {
    if inv.num_args() == 0 {
        missing(inv, 1);
        return;
    }
    let mut aspects = vec![];
    for argument in &inv.command.arguments {
        // A decimal point followed by a letter means the comma that should end the
        // section is missing; the rest of the fragment is another command.
        let (text, last) = match argument.find('.') {
            Some(p) if argument[p + 1..].starts_with(char::is_alphabetic) => (&argument[..p], true),
            _ => (argument.as_str(), false),
        };
        aspects.push(numbers::parse_i32_lenient(text).filter(|a| *a >= 0).unwrap_or(-1));
        if last {
            break;
        }
    }
    let kind = if value_based {
        aspects.sort_unstable();
        SectionKind::ValueBased
    } else {
        SectionKind::IndexBased
    };
    let departure_station = departure_station(inv);
    let track_position = inv.track_position();
    inv.block().sections.push(SectionDefinition {
        track_position,
        aspects,
        kind,
        departure_station,
        invisible: false,
    });
    inv.ctx.current_section += 1;
}

/// Shows a signal whose aspect follows a nearby section.
fn signal_with_object(inv: &mut Invocation) {
    let index = inv.i32_arg(0, "SignalIndex", 0);
    let defined = inv.ctx.structures.signals.get(index).cloned();
    let built_in = usize::try_from(index)
        .ok()
        .and_then(|i| inv.ctx.compat.signals.get(i))
        .cloned();
    let definition = match (defined, built_in) {
        (Some(definition), _) => definition,
        (None, Some(definition)) => {
            inv.report(DiagnosticKind::CompatibilitySignalUsed {
                command: inv.name(),
                index,
            });
            definition
        }
        (None, None) => {
            inv.undefined("SignalIndex", index);
            return;
        }
    };
    let ahead = inv.i32_arg(1, "Section", 0);
    let section = section_ahead(inv, ahead);
    let mut offset = offset(inv, 2);
    let show_post = offset.y < 0.0;
    if show_post {
        offset.y = SIGNAL_POST_HEIGHT;
    }
    let track_position = inv.track_position();
    inv.block().signals.push(SignalPlacement {
        track_position,
        section,
        definition,
        offset,
        show_object: true,
        show_post,
    });
}

/// Starts a value based section guarded by a built-in signal.
///
/// A signal at lateral offset 0 is not shown and its section is invisible.
fn signal(inv: &mut Invocation) {
    let mut aspects = inv.i32_arg(0, "Aspects", -2);
    if aspects == 0 && inv.ctx.dialect == Dialect::Rw {
        aspects = -2;
    }
    if ![1, -2, 2, -3, 3, -4, 4, -5, 5, 6].contains(&aspects) {
        let fallback = if matches!(aspects, -6 | -1) { -aspects } else { -4 };
        inv.out_of_range("Aspects", "the signal type is not supported", Fallback::value(fallback));
        aspects = fallback;
    }
    let mut offset = offset(inv, 2);
    let (numbers, definition) = inv.ctx.compat.signal_for_type(aspects);
    let departure_station = departure_station(inv);
    let track_position = inv.track_position();
    let visible = offset.x != 0.0;
    inv.block().sections.push(SectionDefinition {
        track_position,
        aspects: numbers,
        kind: SectionKind::ValueBased,
        departure_station,
        invisible: !visible,
    });
    inv.ctx.current_section += 1;
    let section = inv.ctx.current_section;
    let show_post = visible && offset.y < 0.0;
    if offset.y < 0.0 {
        offset.y = SIGNAL_POST_HEIGHT;
    }
    inv.block().signals.push(SignalPlacement {
        track_position,
        section,
        definition,
        offset,
        show_object: visible,
        show_post,
    });
}

/// Shows a repeating signal for the next section.
fn relay(inv: &mut Invocation) {
    let mut offset = offset(inv, 0);
    let definition = inv.ctx.compat.signals[RELAY_SIGNAL].clone();
    let section = section_ahead(inv, 1);
    let visible = offset.x != 0.0;
    let show_post = visible && offset.y < 0.0;
    if offset.y < 0.0 {
        offset.y = SIGNAL_POST_HEIGHT;
    }
    let track_position = inv.track_position();
    inv.block().signals.push(SignalPlacement {
        track_position,
        section,
        definition,
        offset,
        show_object: visible,
        show_post,
    });
}

/// Reads the beacon structure shown for a transponder; -1 shows nothing.
fn beacon_structure(inv: &mut Invocation, i: usize) -> Option<i32> {
    let structure = inv.i32_arg(i, "BeaconStructureIndex", 0);
    if structure < -1 {
        inv.out_of_range(
            "BeaconStructureIndex",
            "the index must be -1 or a beacon structure",
            Fallback::value(-1),
        );
        return None;
    }
    if structure == -1 {
        return None;
    }
    if !inv.ctx.structures.beacon.contains(structure) {
        inv.undefined("BeaconStructureIndex", structure);
        return None;
    }
    Some(structure)
}

fn destination(inv: &mut Invocation) {
    let kind = inv.i32_arg(0, "Type", 0);
    if !(-1..=1).contains(&kind) {
        inv.out_of_range("Type", "the type must be -1, 0 or 1", Fallback::IgnoreCommand);
        return;
    }
    let beacon = beacon_structure(inv, 1);
    let next = inv.i32_arg(2, "NextDestination", 0);
    let previous = inv.i32_arg(3, "PreviousDestination", 0);
    let trigger_once = inv.bool_arg(4, "TriggerOnce", false);
    let offset = offset(inv, 5);
    let track_position = inv.track_position();
    inv.block().destinations.push(DestinationDefinition {
        track_position,
        kind,
        beacon,
        next,
        previous,
        trigger_once,
        offset,
    });
}

fn beacon(inv: &mut Invocation) {
    let kind = inv.i32_arg(0, "Type", 0);
    if kind < 0 {
        inv.out_of_range("Type", "beacon types must be non-negative", Fallback::IgnoreCommand);
        return;
    }
    let beacon = beacon_structure(inv, 1);
    let section = match inv.i32_arg(2, "Section", 0) {
        -1 => None,
        s if s < 0 => Some(section_ahead(inv, 1)),
        s => Some(section_ahead(inv, s)),
    };
    let data = inv.i32_arg(3, "Data", 0);
    let offset = offset(inv, 4);
    let track_position = inv.track_position();
    inv.block().transponders.push(TransponderDefinition {
        track_position,
        kind: TransponderKind::Beacon(kind),
        data,
        section,
        clip_to_first_red_section: false,
        show_default_object: false,
        beacon,
        offset,
    });
}

/// Pushes one of the built-in ATS beacons for the section `ahead` sections on.
fn push_default_beacon(inv: &mut Invocation, kind: i32, data: i32, ahead: i32, offset: Offset) {
    let section = section_ahead(inv, ahead);
    let track_position = inv.track_position();
    inv.block().transponders.push(TransponderDefinition {
        track_position,
        kind: TransponderKind::Beacon(kind),
        data,
        section: Some(section),
        clip_to_first_red_section: true,
        show_default_object: true,
        beacon: None,
        offset,
    });
}

fn transponder(inv: &mut Invocation) {
    let kind = inv.i32_arg(0, "Type", 0);
    let mut signals_ahead = inv.i32_arg(1, "Signal", 0);
    if signals_ahead < 0 {
        inv.out_of_range("Signal", "the signal must be non-negative", Fallback::value(0));
        signals_ahead = 0;
    }
    let data = inv.i32_arg(2, "SwitchSystems", 0);
    let offset = offset(inv, 3);
    push_default_beacon(inv, kind, data, signals_ahead + 1, offset);
}

fn ats_sn(inv: &mut Invocation) {
    push_default_beacon(inv, 0, 0, 1, Offset::default());
}

fn ats_p(inv: &mut Invocation) {
    push_default_beacon(inv, 3, 0, 1, Offset::default());
}

/// Packs a speed in the route's unit of speed as whole km/h; 0 means no limit.
fn speed_data(inv: &Invocation, speed: f64) -> i32 {
    if speed == 0.0 {
        i32::MAX
    } else {
        (speed * inv.ctx.options.unit_of_speed * 3.6).round() as i32
    }
}

fn push_speed_transponder(inv: &mut Invocation, kind: TransponderKind, data: i32) {
    let track_position = inv.track_position();
    inv.block().transponders.push(TransponderDefinition {
        track_position,
        kind,
        data,
        section: None,
        clip_to_first_red_section: false,
        show_default_object: false,
        beacon: None,
        offset: Offset::default(),
    });
}

fn pattern(inv: &mut Invocation) {
    let kind = match inv.i32_arg(0, "Type", 0) {
        0 => TransponderKind::InternalAtsPTemporarySpeedLimit,
        _ => TransponderKind::AtsPPermanentSpeedLimit,
    };
    let speed = inv.f64_arg(1, "Speed", 0.0);
    let data = speed_data(inv, speed);
    push_speed_transponder(inv, kind, data);
}

fn permanent_limit(inv: &mut Invocation) {
    let speed = inv.f64_arg(0, "Speed", 0.0);
    let data = speed_data(inv, speed);
    push_speed_transponder(inv, TransponderKind::AtsPPermanentSpeedLimit, data);
}

fn limit(inv: &mut Invocation) {
    let speed = inv.f64_arg(0, "Speed", 0.0);
    let direction = inv.i32_arg(1, "Post", 0).signum();
    let course = inv.i32_arg(2, "Cource", 0).signum();
    if speed < 0.0 {
        inv.out_of_range("Speed", "the speed must be non-negative", Fallback::IgnoreCommand);
        return;
    }
    let speed = if speed == 0.0 {
        f64::INFINITY
    } else {
        speed * inv.ctx.options.unit_of_speed
    };
    let track_position = inv.track_position();
    inv.block().limits.push(Limit {
        track_position,
        speed,
        direction,
        course,
    });
}

/// Reads a stop tolerance; values that are not positive become 5 meters.
fn tolerance(inv: &mut Invocation, i: usize, argument: &'static str) -> f64 {
    let value = inv.length_arg(i, argument, 5.0);
    if value <= 0.0 {
        inv.out_of_range(argument, "tolerances must be positive", Fallback::value(5));
        return 5.0;
    }
    value
}

fn stop(inv: &mut Invocation) {
    let Some(station) = inv.ctx.current_station else {
        inv.report(DiagnosticKind::StopWithoutStation { command: inv.name() });
        return;
    };
    let direction = inv.i32_arg(0, "Direction", 0).signum();
    let backward_tolerance = tolerance(inv, 1, "BackwardTolerance");
    let forward_tolerance = tolerance(inv, 2, "ForwardTolerance");
    let cars = inv.i32_arg(3, "Cars", 0);
    let track_position = inv.track_position();
    inv.block().stops.push(Stop {
        track_position,
        station,
        direction,
        forward_tolerance,
        backward_tolerance,
        cars,
    });
    inv.ctx.current_stop = cars;
}

/// Reads a time; an invalid time leaves the station without one.
fn time(inv: &mut Invocation, text: &str, argument: &'static str) -> Option<f64> {
    let t = numbers::parse_time(text.trim_start());
    if t.is_none() {
        inv.invalid(argument, Fallback::value("no time"));
    }
    t
}

/// Reads the arrival argument: a time, a stop mode, or a stop mode and a time.
fn arrival(inv: &mut Invocation, station: &mut Station, full_syntax: bool) {
    let Some(a) = inv.arg(1) else {
        return;
    };
    let text = match a.to_ascii_uppercase().as_str() {
        "P" | "L" => {
            station.stop_mode = StopMode::AllPass;
            None
        }
        "B" => {
            station.stop_mode = StopMode::PlayerPass;
            None
        }
        "S" => {
            station.stop_mode = StopMode::PlayerStop;
            None
        }
        "." if full_syntax => None,
        "D" if full_syntax => {
            station.dummy = true;
            None
        }
        _ => {
            if let Some(t) = strip_prefix_ignore_case(a, "B:") {
                station.stop_mode = StopMode::PlayerPass;
                Some(t)
            } else if let Some(t) = strip_prefix_ignore_case(a, "S:") {
                station.stop_mode = StopMode::PlayerStop;
                Some(t)
            } else {
                Some(a)
            }
        }
    };
    if let Some(text) = text {
        station.arrival_time = time(inv, text, "ArrivalTime");
    }
}

/// Reads the departure argument: a time, a station kind, or a station kind and a time.
fn departure(inv: &mut Invocation, station: &mut Station, full_syntax: bool) {
    let Some(a) = inv.arg(2) else {
        return;
    };
    let text = match a.to_ascii_uppercase().as_str() {
        "T" | "=" => {
            station.kind = StationKind::Terminal;
            None
        }
        "C" => {
            station.kind = StationKind::ChangeEnds;
            None
        }
        "." if full_syntax => None,
        _ => {
            if let Some(t) = strip_prefix_ignore_case(a, "T:") {
                station.kind = StationKind::Terminal;
                Some(t)
            } else if let Some(t) = strip_prefix_ignore_case(a, "C:") {
                station.kind = StationKind::ChangeEnds;
                Some(t)
            } else if let Some(rest) = strip_prefix_ignore_case(a, "J:").filter(|_| full_syntax) {
                let mut parts = rest.split(':');
                match parts.next().and_then(|j| numbers::parse_i32_lenient(j.trim_start())) {
                    Some(j) => station.kind = StationKind::Jump(j),
                    None => inv.invalid("JumpIndex", Fallback::IgnoreCommand),
                }
                parts.next()
            } else {
                Some(a)
            }
        }
    };
    if let Some(text) = text {
        station.departure_time = time(inv, text, "DepartureTime");
    }
}

fn safety_system(inv: &mut Invocation, i: usize) -> SafetySystem {
    let Some(a) = inv.arg(i) else {
        return SafetySystem::Ats;
    };
    let lower = a.to_ascii_lowercase();
    let prefixes = inv.ctx.options.enable_hacks;
    if lower == "ats" || (prefixes && lower.starts_with("ats")) {
        return SafetySystem::Ats;
    }
    if lower == "atc" || (prefixes && lower.starts_with("atc")) {
        return SafetySystem::Atc;
    }
    match numbers::parse_i32_lenient(a) {
        Some(0) => SafetySystem::Ats,
        Some(1) => SafetySystem::Atc,
        _ => {
            inv.invalid("System", Fallback::value("ATS"));
            SafetySystem::Ats
        }
    }
}

fn station_sound(inv: &mut Invocation, i: usize) -> Option<SoundHandle> {
    let file = inv.arg(i)?;
    inv.register_sound(file, STATION_SOUND_RADIUS)
}

/// Adds a station at the current block and makes it the current station.
fn open_station(inv: &mut Invocation, station: Station, pass_alarm: bool) {
    let index = inv.ctx.route.stations.len();
    inv.ctx.route.stations.push(station);
    let block = inv.block();
    block.station = Some(index);
    block.station_pass_alarm = pass_alarm;
    inv.ctx.current_station = Some(index);
    inv.ctx.current_stop = -1;
    inv.ctx.departure_signal_used = false;
}

fn sta(inv: &mut Invocation) {
    let number = inv.ctx.route.stations.len() + 1;
    let mut station = Station {
        name: inv.arg(0).unwrap_or_default().to_string(),
        default_track_position: inv.track_position(),
        ..Default::default()
    };
    arrival(inv, &mut station, true);
    departure(inv, &mut station, true);
    let pass_alarm = inv.i32_arg(3, "PassAlarm", 0) == 1;
    let (left, right) = match inv.arg(4).map(str::to_ascii_lowercase) {
        None => (true, true),
        Some(doors) => match doors.as_str() {
            "l" | "left" | "-1" => (true, false),
            "r" | "right" | "1" => (false, true),
            "n" | "none" => (false, false),
            "b" | "both" | "0" => (true, true),
            _ => {
                inv.invalid("Doors", Fallback::value("both"));
                (true, true)
            }
        },
    };
    station.open_left_doors = left;
    station.open_right_doors = right;
    station.force_stop_signal = inv.i32_arg(5, "ForcedRedSignal", 0) == 1;
    station.safety_system = safety_system(inv, 6);
    let mut stop_time = inv.f64_arg(8, "StopDuration", 15.0);
    if stop_time < 0.0 {
        inv.out_of_range("StopDuration", "the stop duration must be non-negative", Fallback::value(15));
        stop_time = 15.0;
    }
    station.stop_time = stop_time.max(5.0);
    station.reopen_station_limit = 5;
    station.interference_in_door = inv.ctx.rng.gen::<f64>() * 30.0;
    station.max_interfering_object_rate = inv.ctx.rng.gen_range(1..99);
    if !inv.preview_only() {
        station.arrival_sound = station_sound(inv, 7);
        let jam = inv.f64_arg(9, "PassengerRatio", 100.0);
        station.passenger_ratio = 0.01 * if jam < 0.0 { 100.0 } else { jam };
        station.departure_sound = station_sound(inv, 10);
        let (day, night) = timetable(inv, number - 1);
        station.timetable_day = day;
        station.timetable_night = night;
        station.reopen_door = 0.01 * inv.f64_arg(12, "ReopenDoor", 0.0).max(0.0);
        station.reopen_station_limit = inv.i32_arg(13, "ReopenStationLimit", 5).max(0);
        if inv.arg(14).is_some() {
            let interference = inv.f64_arg(14, "InterferenceInDoor", station.interference_in_door);
            station.interference_in_door = interference.max(0.0);
        }
        if inv.arg(15).is_some() {
            let rate = inv.i32_arg(15, "MaxInterferingObjectRate", station.max_interfering_object_rate);
            if (1..100).contains(&rate) {
                station.max_interfering_object_rate = rate;
            }
        }
    }
    if station.name.is_empty() && station.player_stops() {
        if station.open_left_doors || station.open_right_doors {
            station.name = format!["Station {number}"];
        } else if station.force_stop_signal {
            station.dummy = true;
        }
    }
    open_station(inv, station, pass_alarm);
}

/// The timetable textures of a station.
///
/// Without a valid timetable index, a station uses the textures of the station before it.
fn timetable(
    inv: &mut Invocation,
    index: usize,
) -> (Option<TextureHandle>, Option<TextureHandle>) {
    let structures = &inv.ctx.structures;
    let given = inv.arg(11).map(numbers::parse_i32_lenient);
    if let Some(Some(t)) = given {
        if t >= 0 && (structures.timetable_day.contains(t) || structures.timetable_night.contains(t)) {
            return (
                structures.timetable_day.get(t).copied(),
                structures.timetable_night.get(t).copied(),
            );
        }
    }
    if let Some(t) = given {
        inv.undefined("TimetableIndex", t.unwrap_or(-1));
    }
    match index.checked_sub(1).and_then(|p| inv.ctx.route.stations.get(p)) {
        Some(previous) => (previous.timetable_day, previous.timetable_night),
        None => {
            let structures = &inv.ctx.structures;
            if structures.timetable_day.is_empty() || structures.timetable_night.is_empty() {
                (None, None)
            } else {
                (structures.timetable_day.get(0).copied(), structures.timetable_night.get(0).copied())
            }
        }
    }
}

/// The `Station` command of RW files, which has fewer parameters than `Sta`.
fn station(inv: &mut Invocation) {
    let number = inv.ctx.route.stations.len() + 1;
    let mut station = Station {
        name: inv.arg(0).unwrap_or_default().to_string(),
        default_track_position: inv.track_position(),
        ..Default::default()
    };
    arrival(inv, &mut station, false);
    departure(inv, &mut station, false);
    station.force_stop_signal = inv.i32_arg(3, "ForcedRedSignal", 0) == 1;
    station.safety_system = safety_system(inv, 4);
    if !inv.preview_only() {
        station.departure_sound = station_sound(inv, 5);
    }
    if station.name.is_empty() && station.player_stops() {
        station.name = format!["Station {number}"];
        // In RW files a nameless station with a red departure signal is a signal
        // control point.
        if station.force_stop_signal && inv.ctx.dialect == Dialect::Rw {
            station.dummy = true;
            station.name = String::new();
            station.open_left_doors = false;
            station.open_right_doors = false;
        }
    }
    open_station(inv, station, false);
}

fn buffer(inv: &mut Invocation) {
    let track_position = inv.track_position();
    inv.ctx.route.buffers.push(track_position);
}

fn form(inv: &mut Invocation) {
    let Some(primary) = rail_index(inv, 0) else {
        return;
    };
    let rw = inv.ctx.dialect == Dialect::Rw;
    let secondary = match inv.arg(1) {
        None => FormSecondary::Stub,
        Some(a) if a.eq_ignore_ascii_case("l") => FormSecondary::Left,
        Some(a) if a.eq_ignore_ascii_case("r") => FormSecondary::Right,
        Some(a) if rw && a.eq_ignore_ascii_case("9x") => FormSecondary::Rail(9),
        Some(_) => match inv.i32_arg(1, "RailIndex2", 0) {
            -9 if rw => FormSecondary::Left,
            9 if rw => FormSecondary::Right,
            0 => FormSecondary::Stub,
            -1 => FormSecondary::Left,
            -2 => FormSecondary::Right,
            r if r > 0 => FormSecondary::Rail(r as usize),
            _ => {
                inv.out_of_range(
                    "RailIndex2",
                    "the second rail must be a rail index, L or R",
                    Fallback::IgnoreCommand,
                );
                return;
            }
        },
    };
    check_started(inv, primary);
    if let FormSecondary::Rail(r) = secondary {
        check_started(inv, r);
    }
    let roof = inv.i32_arg(2, "RoofStructureIndex", 0);
    let form = inv.i32_arg(3, "FormStructureIndex", 0);
    let structures = &inv.ctx.structures;
    if roof != 0 && (roof < 0 || (!structures.roof_left.contains(roof) && !structures.roof_right.contains(roof))) {
        inv.undefined("RoofStructureIndex", roof);
    }
    let structures = &inv.ctx.structures;
    if form < 0 || (!structures.form_left.contains(form) && !structures.form_right.contains(form)) {
        inv.undefined("FormStructureIndex", form);
    }
    inv.block().forms.push(Form {
        primary,
        secondary,
        form,
        roof,
    });
}

fn pole(inv: &mut Invocation) {
    let Some(index) = rail_index(inv, 0) else {
        return;
    };
    check_started(inv, index);
    let block_interval = inv.ctx.options.block_interval;
    let current = *inv.block().pole_mut(index, 2.0 * block_interval);
    let mode = inv.i32_arg(1, "AdditionalRailsCovered", current.mode);
    if inv.arg(2).is_some() {
        let location = inv.f64_arg(2, "Location", 0.0);
        inv.block().pole_mut(index, 2.0 * block_interval).location = location;
    }
    if inv.arg(3).is_some() {
        let interval = inv.length_arg(3, "Interval", block_interval);
        inv.block().pole_mut(index, 2.0 * block_interval).interval = interval;
    }
    let kind = inv.i32_arg(4, "PoleStructureIndex", current.kind);
    let Some(poles) = inv.ctx.structures.poles.get(mode).filter(|_| mode >= 0) else {
        inv.undefined("AdditionalRailsCovered", mode);
        return;
    };
    if kind < 0 || !poles.contains(kind) {
        inv.undefined("PoleStructureIndex", kind);
        return;
    }
    let pole = inv.block().pole_mut(index, 2.0 * block_interval);
    pole.mode = mode;
    pole.kind = kind;
    pole.exists = true;
}

/// Warns if a rail is neither running nor ending in the current block.
fn check_started_or_ended(inv: &mut Invocation, index: usize) {
    let rail = inv.block().rail(index);
    if !rail.started && !rail.ended {
        inv.report(DiagnosticKind::RailNotStarted {
            command: inv.name(),
            rail: index as i32,
        });
    }
}

fn pole_end(inv: &mut Invocation) {
    let Some(index) = rail_index(inv, 0) else {
        return;
    };
    if index >= inv.block().poles.len() {
        inv.out_of_range("RailIndex", "the rail must have a pole", Fallback::IgnoreCommand);
        return;
    }
    check_started_or_ended(inv, index);
    inv.block().poles[index].exists = false;
}

/// Reads the side of a wall or dike; an invalid side ignores the command.
fn side(inv: &mut Invocation) -> Option<Direction> {
    let Some(a) = inv.arg(1) else {
        missing(inv, 2);
        return None;
    };
    match a.to_ascii_lowercase().as_str() {
        "l" | "left" | "-1" => Some(Direction::Left),
        "r" | "right" | "1" => Some(Direction::Right),
        "b" | "both" | "0" => Some(Direction::Both),
        _ => {
            inv.invalid("Direction", Fallback::IgnoreCommand);
            None
        }
    }
}

type Selector<T> = fn(&StructureTables) -> &Table<T>;

type Slot = fn(&mut Block, usize) -> &mut WallDike;

/// Starts or replaces a wall or dike along a rail.
///
/// If only one side of a structure exists, a wall on both sides becomes a wall on that side.
fn start_wall_or_dike<T>(inv: &mut Invocation, what: &'static str, left: Selector<T>, right: Selector<T>, slot: Slot) {
    let mut index = inv.i32_arg(0, "RailIndex", 0);
    if index < 0 {
        inv.out_of_range("RailIndex", "rail indices must be non-negative", Fallback::value(0));
        index = 0;
    }
    let index = index as usize;
    let Some(mut direction) = side(inv) else {
        return;
    };
    let mut kind = inv.i32_arg(2, what, 0);
    if kind < 0 {
        inv.out_of_range(what, "structure indices must be non-negative", Fallback::value(0));
        kind = 0;
    }
    let has_left = left(&inv.ctx.structures).contains(kind);
    let has_right = right(&inv.ctx.structures).contains(kind);
    let defined = match direction {
        Direction::Left => has_left,
        Direction::Right => has_right,
        Direction::Both => has_left || has_right,
    };
    if !defined {
        inv.undefined(what, kind);
        return;
    }
    if direction == Direction::Both {
        if !has_left {
            direction = Direction::Right;
        } else if !has_right {
            direction = Direction::Left;
        }
    }
    check_started(inv, index);
    *slot(inv.block(), index) = WallDike {
        exists: true,
        kind,
        direction,
    };
}

fn end_wall_or_dike(inv: &mut Invocation, rule: &'static str, slot: Slot) {
    let Some(index) = rail_index(inv, 0) else {
        return;
    };
    if !slot(inv.block(), index).exists {
        inv.out_of_range("RailIndex", rule, Fallback::IgnoreCommand);
        return;
    }
    check_started_or_ended(inv, index);
    slot(inv.block(), index).exists = false;
}

fn wall(inv: &mut Invocation) {
    start_wall_or_dike(inv, "WallStructureIndex", |s| &s.wall_left, |s| &s.wall_right, Block::wall_mut);
}

fn wall_end(inv: &mut Invocation) {
    end_wall_or_dike(inv, "the rail must have a wall", Block::wall_mut);
}

fn dike(inv: &mut Invocation) {
    start_wall_or_dike(inv, "DikeStructureIndex", |s| &s.dike_left, |s| &s.dike_right, Block::dike_mut);
}

fn dike_end(inv: &mut Invocation) {
    end_wall_or_dike(inv, "the rail must have a dike", Block::dike_mut);
}

/// The span of track over which a marker is shown: it ends at the current track
///     position, or starts there if the distance is negative.
fn marker_span(inv: &mut Invocation) -> (f64, f64) {
    let track_position = inv.track_position();
    let block_interval = inv.ctx.options.block_interval;
    let distance = inv.length_arg(1, "Distance", block_interval);
    let (start, end) = if distance < 0.0 {
        (track_position, track_position - distance)
    } else {
        (track_position - distance, track_position)
    };
    let (start, end) = (start.max(0.0), end.max(0.0));
    (start, if end <= start { start + 0.01 } else { end })
}

fn marker(inv: &mut Invocation) {
    let Some(file) = inv.arg(0) else {
        missing(inv, 1);
        return;
    };
    let folder = inv.ctx.compile_options.object_folder.clone();
    let Some(path) = inv.locate(&folder, file) else {
        return;
    };
    let (start, end) = marker_span(inv);
    // Old RW routes show markers on a black sidebar, where a transparent color looks wrong.
    let transparent_color = if inv.ctx.options.enable_hacks && inv.ctx.dialect == Dialect::Rw {
        None
    } else {
        Some(Color24::new(64, 64, 64))
    };
    let options = TextureOptions {
        transparent_color,
        repeat: false,
    };
    if let Some(texture) = inv.register_texture(&path, options) {
        inv.ctx.route.markers.push(Marker {
            start,
            end,
            message: MarkerMessage::Image(texture),
        });
    }
}

fn text_marker(inv: &mut Invocation) {
    let Some(text) = inv.arg(0) else {
        missing(inv, 1);
        return;
    };
    let (start, end) = marker_span(inv);
    let color = match inv.arg(2).map(str::to_ascii_lowercase).as_deref() {
        Some("black" | "1") => MessageColor::Black,
        Some("gray" | "2") => MessageColor::Gray,
        Some("red" | "4") => MessageColor::Red,
        Some("orange" | "5") => MessageColor::Orange,
        Some("green" | "6") => MessageColor::Green,
        Some("blue" | "7") => MessageColor::Blue,
        Some("magenta" | "8") => MessageColor::Magenta,
        _ => MessageColor::White,
    };
    inv.ctx.route.markers.push(Marker {
        start,
        end,
        message: MarkerMessage::Text {
            text: text.to_string(),
            color,
        },
    });
}

fn height(inv: &mut Invocation) {
    let mut h = inv.length_arg(0, "Height", 0.0);
    if inv.ctx.dialect == Dialect::Rw {
        h += 0.3;
    }
    inv.block().height = Some(h);
}

fn ground(inv: &mut Invocation) {
    let index = inv.i32_arg(0, "CycleIndex", 0);
    let cycle = match inv.ctx.structures.cycles.get(index) {
        Some(cycle) => cycle.clone(),
        None if inv.ctx.structures.ground.contains(index) => vec![index],
        None => {
            inv.undefined("GroundStructureIndex", index);
            return;
        }
    };
    inv.block().ground_cycle = Some(cycle);
}

fn crack(inv: &mut Invocation) {
    let Some(primary) = rail_index(inv, 0) else {
        return;
    };
    let Some(secondary) = rail_index(inv, 1) else {
        return;
    };
    let kind = inv.i32_arg(2, "CrackStructureIndex", 0);
    let structures = &inv.ctx.structures;
    if kind < 0 || !structures.crack_left.contains(kind) || !structures.crack_right.contains(kind) {
        inv.undefined("CrackStructureIndex", kind);
        return;
    }
    if primary == secondary {
        inv.out_of_range("RailIndex2", "a crack needs two different rails", Fallback::IgnoreCommand);
        return;
    }
    check_started(inv, primary);
    check_started(inv, secondary);
    inv.block().cracks.push(Crack {
        primary,
        secondary,
        kind,
    });
}

/// Places a free object along a rail, or along the ground for rail -1.
fn free_object(inv: &mut Invocation) {
    if inv.num_args() < 2 {
        missing(inv, 2);
        return;
    }
    let rail = inv.i32_arg(0, "RailIndex", 0);
    let kind = inv.i32_arg(1, "FreeObjStructureIndex", 0);
    if rail < -1 {
        inv.out_of_range("RailIndex", "the rail must be -1 or a rail index", Fallback::IgnoreCommand);
        return;
    }
    if kind < 0 {
        inv.out_of_range(
            "FreeObjStructureIndex",
            "structure indices must be non-negative",
            Fallback::IgnoreCommand,
        );
        return;
    }
    if rail >= 0 {
        check_started(inv, rail as usize);
    }
    if !inv.ctx.structures.free_objects.contains(kind) {
        inv.undefined("FreeObjStructureIndex", kind);
        return;
    }
    let object = FreeObject {
        track_position: inv.track_position(),
        kind,
        offset: offset(inv, 2),
    };
    let block = inv.block();
    match usize::try_from(rail) {
        Ok(rail) => block.push_rail_free_object(rail, object),
        Err(_) => block.ground_free_objects.push(object),
    }
}

fn background(inv: &mut Invocation) {
    let index = inv.i32_arg(0, "BackgroundTextureIndex", 0);
    let loaded = inv
        .ctx
        .structures
        .backgrounds
        .get(index)
        .is_some_and(|b| b.texture.is_some());
    if !loaded {
        inv.undefined("BackgroundTextureIndex", index);
        return;
    }
    inv.block().background = Some(index);
    // Block 0 always shows background 0. Routes that start with another background
    // and never define background 0 expect it to be shown from the start.
    let ctx = &mut *inv.ctx;
    if ctx.options.enable_hacks && ctx.blocks.len() == 2 && ctx.blocks[0].background == Some(0) {
        let zero_loaded = ctx.structures.backgrounds.get(0).is_some_and(|b| b.texture.is_some());
        if !zero_loaded {
            ctx.blocks[0].background = Some(index);
        }
    }
}

fn push_sound(inv: &mut Invocation, kind: SoundKind, x: f64, y: f64) {
    let track_position = inv.track_position();
    inv.block().sounds.push(SoundDefinition {
        track_position,
        kind,
        x,
        y,
    });
}

fn announce(inv: &mut Invocation) {
    add_announcement(inv, false);
}

fn announce_all(inv: &mut Invocation) {
    add_announcement(inv, true);
}

/// A sound played in passing trains; with a speed, only in trains going at least that fast.
fn add_announcement(inv: &mut Invocation, all_trains: bool) {
    let Some(file) = inv.arg(0) else {
        missing(inv, 1);
        return;
    };
    let Some(buffer) = inv.register_sound(file, TRACK_SOUND_RADIUS) else {
        return;
    };
    let speed = inv.f64_arg(1, "Speed", 0.0);
    let speed = (speed != 0.0).then(|| speed * inv.ctx.options.unit_of_speed);
    push_sound(
        inv,
        SoundKind::Train {
            buffer,
            speed,
            all_trains,
        },
        0.0,
        0.0,
    );
}

fn doppler(inv: &mut Invocation) {
    let Some(file) = inv.arg(0) else {
        missing(inv, 1);
        return;
    };
    let Some(buffer) = inv.register_sound(file, TRACK_SOUND_RADIUS) else {
        return;
    };
    let x = inv.length_arg(1, "X", 0.0);
    let y = inv.length_arg(2, "Y", 0.0);
    push_sound(inv, SoundKind::World(buffer), x, y);
}

fn microphone(inv: &mut Invocation) {
    let x = inv.length_arg(0, "X", 0.0);
    let y = inv.length_arg(1, "Y", 0.0);
    let backward_tolerance = inv.length_arg(2, "BackwardTolerance", 0.0).max(0.0);
    let forward_tolerance = inv.length_arg(3, "ForwardTolerance", 0.0).max(0.0);
    push_sound(
        inv,
        SoundKind::Microphone {
            backward_tolerance,
            forward_tolerance,
        },
        x,
        y,
    );
}

fn pretrain(inv: &mut Invocation) {
    let Some(a) = inv.arg(0) else {
        missing(inv, 1);
        return;
    };
    let time = match numbers::parse_time(a) {
        Some(t) => t,
        None => {
            inv.invalid("Time", Fallback::value(0));
            0.0
        }
    };
    if inv.ctx.route.pretrain.last().is_some_and(|p| p.time >= time) {
        inv.report(DiagnosticKind::NonAscendingPreTrainTime);
    }
    let track_position = inv.track_position();
    inv.ctx.route.pretrain.push(PreTrainPoint { time, track_position });
}

fn point_of_interest(inv: &mut Invocation) {
    let mut rail = inv.i32_arg(0, "RailIndex", 0);
    if rail < 0 {
        inv.out_of_range("RailIndex", "rail indices must be non-negative", Fallback::value(0));
        rail = 0;
    }
    let rail = rail as usize;
    check_started(inv, rail);
    let offset = offset(inv, 1);
    let text = inv.arg(6).map(str::to_string);
    let track_position = inv.track_position();
    inv.block().points_of_interest.push(PoiDefinition {
        track_position,
        rail,
        offset,
        text,
    });
}

#[cfg(test)]
mod tests {
    use crate::assets::MemoryAssets;
    use crate::block::{Direction, FormSecondary};
    use crate::events::TransponderKind;
    use crate::options::KMPH;
    use crate::output::{SafetySystem, SectionKind, StationKind, StopMode, NO_FOG_END};
    use crate::testing::{parse, parse_csv, parse_with_assets};
    use crate::CompileOptions;
    use approx::assert_relative_eq;
    use routelang::DiagnosticKind;

    fn kinds(diagnostics: &[routelang::Diagnostic]) -> Vec<DiagnosticKind> {
        diagnostics.iter().map(|d| d.kind.clone()).collect()
    }

    #[test]
    fn stations_are_assigned_to_blocks() {
        let (parsed, _) = parse_csv("0,Track.Sta,A\n25,Track.Sta,B");
        assert_eq!(parsed.route.stations.len(), 2);
        assert_eq!(parsed.blocks[0].station, Some(0));
        assert_eq!(parsed.blocks[1].station, Some(1));
        assert_eq!(parsed.route.stations[1].default_track_position, 25.0);
    }

    #[test]
    fn sta_arguments() {
        let (parsed, diagnostics) = parse_csv("Track.Sta Alpha;B:10.30;C:10.3045;1;L;1;atc;;3");
        assert!(diagnostics.is_empty(), "{diagnostics:?}");
        let station = &parsed.route.stations[0];
        assert_eq!(station.name, "Alpha");
        assert_eq!(station.stop_mode, StopMode::PlayerPass);
        assert_eq!(station.arrival_time, Some(37800.0));
        assert_eq!(station.kind, StationKind::ChangeEnds);
        assert_eq!(station.departure_time, Some(37845.0));
        assert!(station.open_left_doors);
        assert!(!station.open_right_doors);
        assert!(station.force_stop_signal);
        assert_eq!(station.safety_system, SafetySystem::Atc);
        assert_eq!(station.stop_time, 5.0);
        assert!(parsed.blocks[0].station_pass_alarm);
    }

    #[test]
    fn nameless_stations() {
        let (parsed, _) = parse_csv("Track.Sta\n25\nTrack.Sta ;;;;N;1\n50\nTrack.Sta ;P");
        let stations = &parsed.route.stations;
        assert_eq!(stations[0].name, "Station 1");
        assert!(stations[1].dummy);
        assert_eq!(stations[1].name, "");
        assert_eq!(stations[2].name, "");
        assert_eq!(stations[2].stop_mode, StopMode::AllPass);
    }

    #[test]
    fn jump_station() {
        let (parsed, _) = parse_csv("Track.Sta A;;J:2:11");
        let station = &parsed.route.stations[0];
        assert_eq!(station.kind, StationKind::Jump(2));
        assert_eq!(station.departure_time, Some(39600.0));
    }

    #[test]
    fn stop_needs_station() {
        let (parsed, diagnostics) = parse_csv("Track.Stop 1\nTrack.Sta A\n10\nTrack.Stop -1;0;3;4");
        assert_eq!(
            kinds(&diagnostics),
            vec![
                DiagnosticKind::StopWithoutStation {
                    command: "track.stop".into()
                },
                DiagnosticKind::ArgumentOutOfRange {
                    command: "track.stop".into(),
                    argument: "BackwardTolerance",
                    rule: "tolerances must be positive",
                    fallback: routelang::diagnostics::Fallback::value(5),
                }
            ]
        );
        let stops = &parsed.blocks[0].stops;
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].station, 0);
        assert_eq!(stops[0].direction, -1);
        assert_eq!(stops[0].backward_tolerance, 5.0);
        assert_eq!(stops[0].forward_tolerance, 3.0);
        assert_eq!(stops[0].cars, 4);
    }

    #[test]
    fn fog_in_conditional() {
        let (parsed, _) = parse_csv("$if 0\nTrack.Fog 0;100\n$else\nTrack.Fog 0;200\n$endif");
        assert!(parsed.blocks[0].fog_defined);
        assert_eq!(parsed.blocks[0].fog.end, 200.0);
        assert_eq!(parsed.blocks[0].fog.start, 0.0);
    }

    #[test]
    fn fog_without_range() {
        let (parsed, _) = parse_csv("Track.Fog 300;100;10;20;30");
        let fog = parsed.blocks[0].fog;
        assert_eq!(fog.end, NO_FOG_END);
        assert_eq!(fog.color, crate::output::Color24::new(10, 20, 30));
    }

    #[test]
    fn rails_start_and_end() {
        let (parsed, diagnostics) = parse_csv("Track.RailStart 1;3.8;0.5\n50\nTrack.RailEnd 1;4\nTrack.RailEnd 2");
        assert_eq!(
            kinds(&diagnostics),
            vec![DiagnosticKind::RailNotStarted {
                command: "track.railend".into(),
                rail: 2
            }]
        );
        let started = parsed.blocks[0].rail(1);
        assert!(started.started);
        assert_eq!((started.start_x, started.start_y), (3.8, 0.5));
        assert!(parsed.blocks[1].rail(1).started);
        let ended = parsed.blocks[2].rail(1);
        assert!(!ended.started);
        assert!(ended.ended);
        assert_eq!(ended.end_x, 4.0);
        assert_eq!(ended.end_y, 0.5);
    }

    #[test]
    fn rail_moved_twice_ends_in_block() {
        let (parsed, _) = parse_csv("Track.Rail 1;2\nTrack.Rail 1;3");
        let rail = parsed.blocks[0].rail(1);
        assert!(rail.ended);
        assert_eq!(rail.start_x, 3.0);
        assert_eq!(rail.end_x, 2.0);
    }

    #[test]
    fn rail_start_twice_warns() {
        let (_, diagnostics) = parse_csv("Track.RailStart 1\n25\nTrack.RailStart 1");
        assert_eq!(
            kinds(&diagnostics),
            vec![DiagnosticKind::RailAlreadyStarted {
                command: "track.railstart".into(),
                rail: 1
            }]
        );
    }

    macro_rules! curve_tests {
        ( $( ($name: ident, $input: expr, $signed: expr, $radius: expr, $cant: expr), )+ ) => {
            $(
                #[test]
                fn $name() {
                    let mut source = String::new();
                    if $signed {
                        source.push_str("Options.CantBehavior 1\n");
                    }
                    source.push_str($input);
                    let (parsed, _) = parse_csv(&source);
                    assert_relative_eq!(parsed.blocks[0].curve_radius, $radius);
                    assert_relative_eq!(parsed.blocks[0].curve_cant, $cant);
                }
            )+
        };
    }

    curve_tests!(
        (curve_cant_follows_radius, "Track.Curve -600;105", false, -600.0, -0.105),
        (curve_cant_sign_ignored, "Track.Curve 600;-105", false, 600.0, 0.105),
        (curve_signed_cant, "Track.Curve -600;-105", true, -600.0, 0.105),
        (curve_straight_has_no_cant, "Track.Curve 0;105", false, 0.0, 0.0),
        (curve_straight_signed_cant, "Track.Curve 0;105", true, 0.0, 0.105),
    );

    #[test]
    fn curve_persists_into_synthesized_blocks() {
        let (parsed, _) = parse_csv("Track.Curve 300\n75\nTrack.Pitch 2");
        assert_eq!(parsed.blocks[2].curve_radius, 300.0);
        assert_relative_eq!(parsed.blocks[3].pitch, 0.002);
    }

    #[test]
    fn accuracy_and_adhesion() {
        let (parsed, diagnostics) = parse_csv("Track.Accuracy 7\nTrack.Adhesion 85");
        assert_eq!(diagnostics.len(), 1, "{diagnostics:?}");
        assert_eq!(parsed.blocks[0].accuracy, 4.0);
        assert_relative_eq!(parsed.blocks[0].adhesion, 0.85);
    }

    #[test]
    fn sections_and_departure_signal() {
        let (parsed, _) = parse_csv("Track.Sta A;;;;;1\nTrack.Stop\nTrack.Section 0;2;4\nTrack.SectionS 4;0;2");
        let sections = &parsed.blocks[0].sections;
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].aspects, vec![0, 2, 4]);
        assert_eq!(sections[0].kind, SectionKind::IndexBased);
        assert_eq!(sections[0].departure_station, Some(0));
        assert_eq!(sections[1].aspects, vec![0, 2, 4]);
        assert_eq!(sections[1].kind, SectionKind::ValueBased);
        assert_eq!(sections[1].departure_station, None);
    }

    #[test]
    fn signal_starts_a_section() {
        let (parsed, diagnostics) = parse_csv("Track.Signal 3;;-3;-1\nTrack.Sig 2");
        assert!(diagnostics.is_empty(), "{diagnostics:?}");
        let block = &parsed.blocks[0];
        assert_eq!(block.sections.len(), 2);
        assert_eq!(block.sections[0].aspects, vec![0, 2, 4]);
        assert!(!block.sections[0].invisible);
        assert!(block.sections[1].invisible);
        let visible = &block.signals[0];
        assert_eq!(visible.section, 1);
        assert!(visible.show_object);
        assert!(visible.show_post);
        assert_eq!(visible.offset.y, 4.8);
        assert_eq!(block.signals[1].section, 2);
        assert!(!block.signals[1].show_object);
    }

    #[test]
    fn unsupported_signal_type() {
        let (parsed, diagnostics) = parse_csv("Track.Signal 9");
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(parsed.blocks[0].sections[0].aspects, vec![0, 2, 3, 4]);
    }

    #[test]
    fn signal_with_missing_definition_uses_built_in() {
        let (parsed, diagnostics) = parse_csv("Track.SigF 2;1\nTrack.SigF 40");
        assert_eq!(
            kinds(&diagnostics),
            vec![
                DiagnosticKind::CompatibilitySignalUsed {
                    command: "track.sigf".into(),
                    index: 2
                },
                DiagnosticKind::UndefinedReference {
                    command: "track.sigf".into(),
                    what: "SignalIndex",
                    index: 40
                },
            ]
        );
        assert_eq!(parsed.blocks[0].signals.len(), 1);
        assert_eq!(parsed.blocks[0].signals[0].section, 1);
    }

    #[test]
    fn transponders() {
        let (parsed, _) = parse_csv("Track.Section 0;4\nTrack.Tr 1;1;5\nTrack.Beacon 20;-1;-1;7\nTrack.AtsP\nTrack.PLimit 0");
        let transponders = &parsed.blocks[0].transponders;
        assert_eq!(transponders.len(), 4);
        assert_eq!(transponders[0].kind, TransponderKind::Beacon(1));
        assert_eq!(transponders[0].section, Some(3));
        assert_eq!(transponders[0].data, 5);
        assert!(transponders[0].show_default_object);
        assert_eq!(transponders[1].section, None);
        assert_eq!(transponders[1].beacon, None);
        assert!(!transponders[1].show_default_object);
        assert_eq!(transponders[2].kind, TransponderKind::Beacon(3));
        assert_eq!(transponders[2].section, Some(2));
        assert_eq!(transponders[3].kind, TransponderKind::AtsPPermanentSpeedLimit);
        assert_eq!(transponders[3].data, i32::MAX);
    }

    #[test]
    fn pattern_speeds_in_kmph() {
        let (parsed, _) = parse_csv("Track.Pattern 0;45");
        let transponder = &parsed.blocks[0].transponders[0];
        assert_eq!(transponder.kind, TransponderKind::InternalAtsPTemporarySpeedLimit);
        assert_eq!(transponder.data, 45);
    }

    #[test]
    fn limits() {
        let (parsed, diagnostics) = parse_csv("Track.Limit 60;-1;1\nTrack.Limit 0\nTrack.Limit -5");
        assert_eq!(diagnostics.len(), 1);
        let limits = &parsed.blocks[0].limits;
        assert_eq!(limits.len(), 2);
        assert_relative_eq!(limits[0].speed, 60.0 * KMPH);
        assert_eq!((limits[0].direction, limits[0].course), (-1, 1));
        assert_eq!(limits[1].speed, f64::INFINITY);
    }

    #[test]
    fn preview_skips_scenery() {
        let options = CompileOptions {
            preview_only: true,
            ..Default::default()
        };
        let (parsed, diagnostics) = parse(
            "Track.Sta A;;;;;;;arrive.wav\nTrack.Fog 0;100\nTrack.Curve 400\nTrack.Pole 0\nTrack.Limit 40",
            options,
        );
        assert!(diagnostics.is_empty(), "{diagnostics:?}");
        let block = &parsed.blocks[0];
        assert!(!block.fog_defined);
        assert_eq!(block.curve_radius, 400.0);
        assert_eq!(block.limits.len(), 1);
        assert_eq!(parsed.route.stations[0].arrival_sound, None);
    }

    #[test]
    fn walls_take_the_defined_side() {
        let mut assets = MemoryAssets::new();
        assets.insert_file("wall.csv", "");
        let (parsed, diagnostics) = parse_with_assets(
            "Structure.WallL(1) wall.csv\nTrack.Wall 0;0;1\nTrack.Wall 0;1;1\n25\nTrack.WallEnd 0\nTrack.WallEnd 0",
            CompileOptions::default(),
            &mut assets,
        );
        assert_eq!(diagnostics.len(), 2, "{diagnostics:?}");
        let wall = parsed.blocks[0].walls[0];
        assert!(wall.exists);
        assert_eq!(wall.direction, Direction::Left);
        assert!(!parsed.blocks[1].walls[0].exists);
    }

    #[test]
    fn forms_and_cracks() {
        let mut assets = MemoryAssets::new();
        assets.insert_file("form.csv", "");
        let (parsed, diagnostics) = parse_with_assets(
            "Structure.FormL(2) form.csv\nStructure.CrackL(0) form.csv\nStructure.CrackR(0) form.csv\n\
             Track.Rail 1;3.8\nTrack.Form 0;L;0;2\nTrack.Form 1;0;0;2\nTrack.Crack 0;1;0\nTrack.Crack 1;1;0",
            CompileOptions::default(),
            &mut assets,
        );
        assert_eq!(diagnostics.len(), 1, "{diagnostics:?}");
        let block = &parsed.blocks[0];
        assert_eq!(block.forms.len(), 2);
        assert_eq!(block.forms[0].secondary, FormSecondary::Left);
        assert_eq!(block.forms[1].secondary, FormSecondary::Stub);
        assert_eq!(block.cracks.len(), 1);
        assert_eq!((block.cracks[0].primary, block.cracks[0].secondary), (0, 1));
    }

    #[test]
    fn free_objects() {
        let mut assets = MemoryAssets::new();
        assets.insert_file("tree.csv", "");
        let (parsed, diagnostics) = parse_with_assets(
            "Structure.FreeObj(4) tree.csv\nTrack.FreeObj -1;4;5;0;90\nTrack.FreeObj 0;4\nTrack.FreeObj 0\nTrack.FreeObj 0;5",
            CompileOptions::default(),
            &mut assets,
        );
        assert_eq!(diagnostics.len(), 2, "{diagnostics:?}");
        let block = &parsed.blocks[0];
        assert_eq!(block.ground_free_objects.len(), 1);
        assert_eq!(block.ground_free_objects[0].offset.x, 5.0);
        assert_relative_eq!(block.ground_free_objects[0].offset.yaw, std::f64::consts::FRAC_PI_2);
        assert_eq!(block.rail_free_objects[0].len(), 1);
    }

    #[test]
    fn poles_use_built_in_structures() {
        let (parsed, diagnostics) = parse_csv("Track.Rail 1;4\nTrack.Pole 1;1;-1;50\nTrack.Pole 1;7");
        assert_eq!(diagnostics.len(), 1, "{diagnostics:?}");
        let pole = parsed.blocks[0].poles[1];
        assert!(pole.exists);
        assert_eq!(pole.mode, 1);
        assert_eq!(pole.location, -1.0);
        assert_eq!(pole.interval, 50.0);
    }

    #[test]
    fn height_in_rw_files_is_raised() {
        let options = CompileOptions {
            dialect: Some(routelang::Dialect::Rw),
            ..Default::default()
        };
        let (parsed, _) = parse("[Railway]\nHeight(2)", options);
        assert_relative_eq!(parsed.blocks[0].height.unwrap_or_default(), 2.3);
    }

    #[test]
    fn markers() {
        let (parsed, _) = parse_csv("100\nTrack.TextMarker Slow down;-50;red\nTrack.TextMarker Hello;200");
        let markers = &parsed.route.markers;
        assert_eq!(markers.len(), 2);
        assert_eq!((markers[0].start, markers[0].end), (100.0, 150.0));
        assert_eq!(
            markers[0].message,
            crate::output::MarkerMessage::Text {
                text: "Slow down".into(),
                color: crate::output::MessageColor::Red
            }
        );
        assert_eq!((markers[1].start, markers[1].end), (0.0, 100.0));
    }

    #[test]
    fn pretrain_must_ascend() {
        let (parsed, diagnostics) = parse_csv("Track.PreTrain 10.00\n100\nTrack.PreTrain 09.00");
        assert_eq!(kinds(&diagnostics), vec![DiagnosticKind::NonAscendingPreTrainTime]);
        assert_eq!(parsed.route.pretrain.len(), 2);
        assert_eq!(parsed.route.pretrain[1].track_position, 100.0);
    }

    #[test]
    fn points_of_interest() {
        let (parsed, _) = parse_csv("Track.POI 0;1;2;;;;Viewpoint");
        let poi = &parsed.blocks[0].points_of_interest[0];
        assert_eq!(poi.offset.x, 1.0);
        assert_eq!(poi.offset.y, 2.0);
        assert_eq!(poi.text.as_deref(), Some("Viewpoint"));
    }

    #[test]
    fn announcements_need_sounds() {
        let mut assets = MemoryAssets::new();
        assets.insert_file("bell.wav", "");
        let (parsed, diagnostics) = parse_with_assets(
            "Track.Announce bell.wav;40\nTrack.Doppler bell.wav;3\nTrack.Announce gone.wav",
            CompileOptions::default(),
            &mut assets,
        );
        assert_eq!(diagnostics.len(), 1, "{diagnostics:?}");
        let sounds = &parsed.blocks[0].sounds;
        assert_eq!(sounds.len(), 2);
        assert_eq!(sounds[1].x, 3.0);
        assert_eq!(assets.sounds.len(), 2);
        assert_eq!(assets.sounds[0].1, 15.0);
    }
}
