//! The `Train` namespace: preceding trains, rail sounds and timetable textures.

use super::BuiltIn;
use crate::assets::TextureOptions;
use crate::context::Invocation;
use routelang::diagnostics::Fallback;
use routelang::{numbers, source, DiagnosticKind};
use std::collections::HashMap;

pub fn commands() -> HashMap<&'static str, BuiltIn> {
    HashMap::from([
        ("train.interval", BuiltIn::new(interval)),
        ("train.velocity", BuiltIn::new(velocity)),
        ("train.folder", BuiltIn::new(folder).in_preview()),
        ("train.file", BuiltIn::new(folder).in_preview()),
        ("train.run", BuiltIn::new(run)),
        ("train.rail", BuiltIn::new(run)),
        ("train.flange", BuiltIn::new(flange)),
        ("train.timetable.day", BuiltIn::new(timetable_day)),
        ("train.timetable.night", BuiltIn::new(timetable_night)),
        ("train.destination", BuiltIn::new(destination)),
    ])
}

/// Intervals longer than this are dropped when compatibility fixes are enabled.
const MAXIMUM_INTERVAL: f64 = 43200.0;

/// Intervals shorter than this are raised when compatibility fixes are enabled.
const MINIMUM_INTERVAL: f64 = 120.0;

fn interval(inv: &mut Invocation) {
    let hacks = inv.ctx.options.enable_hacks;
    let mut intervals: Vec<f64> = inv
        .command
        .arguments
        .iter()
        .filter_map(|a| numbers::parse_f64_lenient(a))
        .filter(|o| *o != 0.0)
        .filter(|o| !hacks || o.abs() <= MAXIMUM_INTERVAL)
        .map(|o| {
            if hacks && o.abs() < MINIMUM_INTERVAL {
                MINIMUM_INTERVAL.copysign(o)
            } else {
                o
            }
        })
        .collect();
    intervals.sort_by(f64::total_cmp);
    if !intervals.is_empty() {
        inv.ctx.route.train.intervals = intervals;
    }
}

fn velocity(inv: &mut Invocation) {
    let limit = inv.f64_arg(0, "Speed", 0.0);
    inv.ctx.route.train.velocity = Some(if limit <= 0.0 {
        f64::INFINITY
    } else {
        limit * inv.ctx.options.unit_of_speed
    });
}

/// Folder prefixes that old routes use to reach the train folder from the route folder.
const LEGACY_TRAIN_PREFIXES: [&str; 2] = ["..\\..\\..\\BVE\\Train\\", "..\\..\\mackoy\\BVE4\\Train\\"];

fn folder(inv: &mut Invocation) {
    let Some(mut name) = inv.arg(0) else {
        inv.report(DiagnosticKind::MissingArguments {
            command: inv.name(),
            expected: 1,
        });
        return;
    };
    if inv.ctx.options.enable_hacks {
        for prefix in LEGACY_TRAIN_PREFIXES {
            if name.len() >= prefix.len() && name[..prefix.len()].eq_ignore_ascii_case(prefix) {
                name = &name[prefix.len()..];
            }
        }
    }
    inv.ctx.route.train.folder = Some(name.to_string());
}

/// Reads a sound index for a rail structure; invalid and negative values become 0.
fn rail_sound(inv: &mut Invocation) -> Option<(i32, i32)> {
    let index = inv.non_negative_index("RailTypeIndex")?;
    let value = inv.i32_arg(0, "SoundIndex", 0).max(0);
    Some((index, value))
}

fn run(inv: &mut Invocation) {
    if let Some((index, value)) = rail_sound(inv) {
        inv.ctx.structures.run_sounds.define(index, value);
    }
}

fn flange(inv: &mut Invocation) {
    if let Some((index, value)) = rail_sound(inv) {
        inv.ctx.structures.flange_sounds.define(index, value);
    }
}

fn timetable_day(inv: &mut Invocation) {
    if let Some((index, texture)) = timetable_texture(inv) {
        inv.ctx.structures.timetable_day.define(index, texture);
    }
}

fn timetable_night(inv: &mut Invocation) {
    if let Some((index, texture)) = timetable_texture(inv) {
        inv.ctx.structures.timetable_night.define(index, texture);
    }
}

/// Registers a timetable texture from the train folder, or else the object folder.
fn timetable_texture(inv: &mut Invocation) -> Option<(i32, crate::assets::TextureHandle)> {
    let index = inv.non_negative_index("TimetableIndex")?;
    let Some(file) = inv.arg(0) else {
        inv.report(DiagnosticKind::MissingArguments {
            command: inv.name(),
            expected: 1,
        });
        return None;
    };
    let options = inv.ctx.compile_options;
    let in_train_folder = source::resolve(&options.train_folder, file);
    let path = if !options.train_folder.as_os_str().is_empty() && inv.ctx.assets.exists(&in_train_folder) {
        in_train_folder
    } else {
        let folder = options.object_folder.clone();
        inv.locate(&folder, file)?
    };
    let texture = inv.register_texture(&path, TextureOptions::default())?;
    Some((index, texture))
}

fn destination(inv: &mut Invocation) {
    let Some(a) = inv.arg(0) else {
        inv.report(DiagnosticKind::MissingArguments {
            command: inv.name(),
            expected: 1,
        });
        return;
    };
    match numbers::parse_i32_lenient(a) {
        Some(d) => inv.ctx.route.train.initial_destination = Some(d),
        None => inv.invalid("Destination", Fallback::IgnoreCommand),
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::{parse, parse_csv};
    use crate::CompileOptions;

    #[test]
    fn intervals_are_sorted() {
        let (parsed, diagnostics) = parse_csv("Train.Interval 300;0;x;-60;120");
        assert!(diagnostics.is_empty(), "{diagnostics:?}");
        assert_eq!(parsed.route.train.intervals, vec![-60.0, 120.0, 300.0]);
    }

    #[test]
    fn intervals_with_hacks() {
        let options = CompileOptions {
            enable_hacks: true,
            ..Default::default()
        };
        let (parsed, _) = parse("Route.RunInterval 50000;30;-20;600", options);
        assert_eq!(parsed.route.train.intervals, vec![-120.0, 120.0, 600.0]);
    }

    #[test]
    fn velocity_zero_is_unlimited() {
        let (parsed, _) = parse_csv("Train.Velocity 0");
        assert_eq!(parsed.route.train.velocity, Some(f64::INFINITY));
    }

    #[test]
    fn rail_sounds() {
        let (parsed, diagnostics) = parse_csv("Train.Run(2) 5\nTrain.Flange(2) -1\nTrain.Rail(-1) 3");
        assert_eq!(diagnostics.len(), 1, "{diagnostics:?}");
        assert_eq!(parsed.structures.run_sounds.get(2), Some(&5));
        assert_eq!(parsed.structures.flange_sounds.get(2), Some(&0));
    }

    #[test]
    fn folder_in_preview() {
        let options = CompileOptions {
            preview_only: true,
            ..Default::default()
        };
        let (parsed, _) = parse("Train.Folder 103series\nTrain.Run(0) 1", options);
        assert_eq!(parsed.route.train.folder.as_deref(), Some("103series"));
        assert!(parsed.structures.run_sounds.is_empty());
    }
}
