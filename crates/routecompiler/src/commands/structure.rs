//! The `Structure`, `Signal` and `Cycle` namespaces.
//!
//! These commands fill the [StructureTables] that track commands refer to by index.
//! They never run in preview mode.

use super::BuiltIn;
use crate::assets::{StaticObject, TextureHandle, TextureOptions, UnifiedObject};
use crate::context::Invocation;
use crate::output::Background;
use crate::structures::{SignalDefinition, StructureTables, Table};
use routelang::diagnostics::Fallback;
use routelang::{numbers, source, Dialect, DiagnosticKind};
use std::collections::HashMap;
use std::rc::Rc;

pub fn commands() -> HashMap<&'static str, BuiltIn> {
    HashMap::from([
        ("structure.rail", BuiltIn::new(rail)),
        ("structure.beacon", BuiltIn::new(beacon)),
        ("structure.pole", BuiltIn::new(pole)),
        ("structure.ground", BuiltIn::new(ground)),
        ("structure.walll", BuiltIn::new(wall_left)),
        ("structure.wallr", BuiltIn::new(wall_right)),
        ("structure.dikel", BuiltIn::new(dike_left)),
        ("structure.diker", BuiltIn::new(dike_right)),
        ("structure.forml", BuiltIn::new(form_left)),
        ("structure.formr", BuiltIn::new(form_right)),
        ("structure.formcl", BuiltIn::new(form_center_left)),
        ("structure.formcr", BuiltIn::new(form_center_right)),
        ("structure.roofl", BuiltIn::new(roof_left)),
        ("structure.roofr", BuiltIn::new(roof_right)),
        ("structure.roofcl", BuiltIn::new(roof_center_left)),
        ("structure.roofcr", BuiltIn::new(roof_center_right)),
        ("structure.crackl", BuiltIn::new(crack_left)),
        ("structure.crackr", BuiltIn::new(crack_right)),
        ("structure.freeobj", BuiltIn::new(free_object)),
        ("structure.background", BuiltIn::new(background)),
        ("structure.back", BuiltIn::new(background)),
        ("texture.background.x", BuiltIn::new(background_repetitions)),
        ("texture.background.aspect", BuiltIn::new(background_aspect)),
        ("signal", BuiltIn::new(signal)),
        ("cycle.ground", BuiltIn::new(ground_cycle)),
        ("cycle.rail", BuiltIn::new(rail_cycle)),
    ])
}

type Selector<T> = fn(&mut StructureTables) -> &mut Table<T>;

/// Stores a definition, warning if it replaces an earlier one.
fn define<T>(inv: &mut Invocation, what: &'static str, index: i32, table: Selector<T>, value: T) {
    if table(&mut inv.ctx.structures).define(index, value) {
        inv.report(DiagnosticKind::Redefinition {
            command: inv.name(),
            what,
            index,
        });
    }
}

/// Returns the file argument, reporting if there is none.
fn file_argument<'c>(inv: &mut Invocation<'c, '_>) -> Option<&'c str> {
    let file = inv.arg(0);
    if file.is_none() {
        inv.report(DiagnosticKind::MissingArguments {
            command: inv.name(),
            expected: 1,
        });
    }
    file
}

fn load_into(inv: &mut Invocation, what: &'static str, index: i32, table: Selector<Rc<UnifiedObject>>) {
    let Some(file) = file_argument(inv) else {
        return;
    };
    if let Some(object) = inv.load_object(file) {
        define(inv, what, index, table, object);
    }
}

fn load_static_into(inv: &mut Invocation, what: &'static str, index: i32, table: Selector<Rc<StaticObject>>) {
    let Some(file) = file_argument(inv) else {
        return;
    };
    if let Some(object) = inv.load_static_object(file) {
        define(inv, what, index, table, Rc::new(object));
    }
}

macro_rules! object_commands {
    ( $( ($name: ident, $what: expr, $field: ident, $loader: ident), )+ ) => {
        $(
            fn $name(inv: &mut Invocation) {
                let Some(index) = inv.non_negative_index($what) else {
                    return;
                };
                $loader(inv, $what, index, |s| &mut s.$field);
            }
        )+
    };
}

object_commands!(
    (rail, "RailStructureIndex", rail, load_into),
    (beacon, "BeaconStructureIndex", beacon, load_into),
    (ground, "GroundStructureIndex", ground, load_into),
    (wall_left, "WallStructureIndex", wall_left, load_into),
    (wall_right, "WallStructureIndex", wall_right, load_into),
    (dike_left, "DikeStructureIndex", dike_left, load_into),
    (dike_right, "DikeStructureIndex", dike_right, load_into),
    (form_left, "FormStructureIndex", form_left, load_into),
    (form_right, "FormStructureIndex", form_right, load_into),
    (form_center_left, "FormStructureIndex", form_center_left, load_static_into),
    (form_center_right, "FormStructureIndex", form_center_right, load_static_into),
    (crack_left, "CrackStructureIndex", crack_left, load_static_into),
    (crack_right, "CrackStructureIndex", crack_right, load_static_into),
    (free_object, "FreeObjStructureIndex", free_objects, load_into),
);

/// Reads a roof index; roof 0 means no roof, so it is moved to 1.
fn roof_index(inv: &mut Invocation) -> Option<i32> {
    let index = inv.non_negative_index("RoofStructureIndex")?;
    if index == 0 {
        if inv.ctx.dialect == Dialect::Csv {
            inv.out_of_range(
                "RoofStructureIndex",
                "roof structure 0 is reserved for no roof",
                Fallback::value(1),
            );
        }
        return Some(1);
    }
    Some(index)
}

fn roof_left(inv: &mut Invocation) {
    if let Some(index) = roof_index(inv) {
        load_into(inv, "RoofStructureIndex", index, |s| &mut s.roof_left);
    }
}

fn roof_right(inv: &mut Invocation) {
    if let Some(index) = roof_index(inv) {
        load_into(inv, "RoofStructureIndex", index, |s| &mut s.roof_right);
    }
}

fn roof_center_left(inv: &mut Invocation) {
    if let Some(index) = roof_index(inv) {
        load_static_into(inv, "RoofStructureIndex", index, |s| &mut s.roof_center_left);
    }
}

fn roof_center_right(inv: &mut Invocation) {
    if let Some(index) = roof_index(inv) {
        load_static_into(inv, "RoofStructureIndex", index, |s| &mut s.roof_center_right);
    }
}

fn pole(inv: &mut Invocation) {
    let Some(mode) = inv.non_negative_index("AdditionalRailsCovered") else {
        return;
    };
    let kind = inv.command.second_index();
    if kind < 0 {
        inv.out_of_range("PoleStructureIndex", "the index must be non-negative", Fallback::IgnoreCommand);
        return;
    }
    let Some(file) = file_argument(inv) else {
        return;
    };
    let Some(object) = inv.load_object(file) else {
        return;
    };
    let built_in = inv.ctx.compat.poles.get(mode as usize);
    let table = inv.ctx.structures.poles.entry_or_default(mode);
    let replaces_built_in = match (table.get(kind), built_in) {
        (Some(old), Some(built_in)) => Rc::ptr_eq(old, built_in),
        _ => false,
    };
    if table.define(kind, object) && !replaces_built_in {
        inv.report(DiagnosticKind::Redefinition {
            command: inv.name(),
            what: "PoleStructureIndex",
            index: kind,
        });
    }
}

fn background(inv: &mut Invocation) {
    let Some(index) = inv.non_negative_index("BackgroundTextureIndex") else {
        return;
    };
    let Some(file) = file_argument(inv) else {
        return;
    };
    background_mut(inv, index);
    let folder = inv.ctx.compile_options.object_folder.clone();
    let Some(path) = inv.locate(&folder, file) else {
        return;
    };
    let texture = inv.register_texture(&path, TextureOptions::default());
    background_mut(inv, index).texture = texture;
}

fn background_mut<'s>(inv: &'s mut Invocation, index: i32) -> &'s mut Background {
    inv.ctx
        .structures
        .backgrounds
        .entry_or_insert_with(index, || Background::new(None))
}

fn background_repetitions(inv: &mut Invocation) {
    if inv.non_negative_index("BackgroundTextureIndex").is_none() {
        return;
    }
    let Some(a) = file_argument(inv) else {
        return;
    };
    let index = inv.command.first_index();
    match numbers::parse_i32_lenient(a) {
        None => inv.invalid("RepetitionCount", Fallback::IgnoreCommand),
        Some(0) => inv.out_of_range(
            "RepetitionCount",
            "the texture must repeat at least once",
            Fallback::IgnoreCommand,
        ),
        Some(x) => background_mut(inv, index).repetitions = x,
    }
}

fn background_aspect(inv: &mut Invocation) {
    if inv.non_negative_index("BackgroundTextureIndex").is_none() {
        return;
    }
    let Some(a) = file_argument(inv) else {
        return;
    };
    let index = inv.command.first_index();
    match numbers::parse_i32_lenient(a) {
        Some(aspect @ (0 | 1)) => background_mut(inv, index).keep_aspect_ratio = aspect == 1,
        Some(_) => inv.out_of_range("Mode", "the mode must be 0 or 1", Fallback::IgnoreCommand),
        None => inv.invalid("Mode", Fallback::IgnoreCommand),
    }
}

/// Number of per-aspect textures looked for next to a signal object.
const MAXIMUM_SIGNAL_TEXTURES: usize = 16;

fn signal(inv: &mut Invocation) {
    let Some(index) = inv.non_negative_index("SignalIndex") else {
        return;
    };
    let Some(file) = file_argument(inv) else {
        return;
    };
    let definition = if has_extension(file, "animated") {
        match inv.load_object(file) {
            Some(object) => SignalDefinition::Animated(object),
            None => return,
        }
    } else {
        let stem = strip_object_extension(file);
        let Some(base) = inv.load_static_object(stem) else {
            return;
        };
        let glow_stem = inv.arg(1).map(strip_object_extension);
        let glow = match glow_stem {
            None => None,
            Some(stem) => inv.load_static_object(stem),
        };
        let signal_textures = aspect_textures(inv, stem);
        let glow_textures = match (glow_stem, &glow) {
            (Some(stem), Some(_)) => aspect_textures(inv, stem),
            _ => vec![],
        };
        SignalDefinition::RawObjectPair {
            base: Some(base),
            glow,
            signal_textures,
            glow_textures,
        }
    };
    define(inv, "SignalIndex", index, |s| &mut s.signals, Rc::new(definition));
}

fn has_extension(file: &str, extension: &str) -> bool {
    std::path::Path::new(file)
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case(extension))
}

fn strip_object_extension(file: &str) -> &str {
    for extension in crate::context::OBJECT_EXTENSIONS {
        if has_extension(file, extension) {
            return &file[..file.len() - extension.len() - 1];
        }
    }
    file
}

/// Registers the textures `<stem><k>.bmp` or `<stem><k>.png` that exist, by aspect `k`.
fn aspect_textures(inv: &mut Invocation, stem: &str) -> Vec<Option<TextureHandle>> {
    let folder = inv.ctx.compile_options.object_folder.clone();
    let mut textures = Vec::with_capacity(MAXIMUM_SIGNAL_TEXTURES);
    for k in 0..MAXIMUM_SIGNAL_TEXTURES {
        let path = ["bmp", "png"]
            .iter()
            .map(|extension| source::resolve(&folder, &format!["{stem}{k}.{extension}"]))
            .find(|path| inv.ctx.assets.exists(path));
        textures.push(match path {
            None => None,
            Some(path) => inv.register_texture(&path, TextureOptions::default()),
        });
    }
    while textures.last() == Some(&None) {
        textures.pop();
    }
    textures
}

fn cycle(inv: &mut Invocation, table: Selector<Vec<i32>>) {
    let Some(index) = inv.non_negative_index("CycleIndex") else {
        return;
    };
    let mut entries = Vec::with_capacity(inv.num_args());
    for i in 0..inv.num_args() {
        let v = inv.i32_arg(i, "StructureIndex", 0);
        entries.push(if v < 0 {
            inv.out_of_range("StructureIndex", "the index must be non-negative", Fallback::value(0));
            0
        } else {
            v
        });
    }
    define(inv, "CycleIndex", index, table, entries);
}

fn ground_cycle(inv: &mut Invocation) {
    cycle(inv, |s| &mut s.cycles);
}

fn rail_cycle(inv: &mut Invocation) {
    cycle(inv, |s| &mut s.rail_cycles);
}

#[cfg(test)]
mod tests {
    use crate::assets::{placeholder_object, MemoryAssets, UnifiedObject};
    use crate::structures::SignalDefinition;
    use crate::testing::{parse_csv, parse_with_assets};
    use crate::CompileOptions;
    use routelang::DiagnosticKind;

    #[test]
    fn objects_are_loaded_by_index() {
        let mut assets = MemoryAssets::new();
        assets.insert_file("rail.csv", "");
        assets.insert_file("wall.b3d", "");
        let (parsed, diagnostics) = parse_with_assets(
            "Structure.Rail(3) rail.csv\nStructure.WallL(1) wall\nStructure.Ground(-1) rail.csv",
            CompileOptions::default(),
            &mut assets,
        );
        assert_eq!(diagnostics.len(), 1, "{diagnostics:?}");
        assert!(parsed.structures.rail.contains(3));
        assert!(parsed.structures.wall_left.contains(1));
        assert!(parsed.structures.ground.is_empty());
    }

    #[test]
    fn redefinition_overwrites() {
        let mut assets = MemoryAssets::new();
        assets.insert_file("a.csv", "");
        assets.insert_object("b.csv", UnifiedObject::Animated(vec![]));
        let (parsed, diagnostics) = parse_with_assets(
            "Structure.Rail(0) a.csv\nStructure.Rail(0) b.csv",
            CompileOptions::default(),
            &mut assets,
        );
        assert_eq!(
            diagnostics.iter().map(|d| d.kind.clone()).collect::<Vec<_>>(),
            vec![DiagnosticKind::Redefinition {
                command: "structure.rail".into(),
                what: "RailStructureIndex",
                index: 0
            }]
        );
        assert_eq!(
            parsed.structures.rail.get(0).map(|o| o.as_ref().clone()),
            Some(UnifiedObject::Animated(vec![]))
        );
    }

    #[test]
    fn missing_file_is_critical() {
        let (parsed, diagnostics) = parse_csv("Structure.Rail(0) nothing.csv");
        assert!(parsed.structures.rail.is_empty());
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].critical);
    }

    #[test]
    fn roof_zero_moves_to_one() {
        let mut assets = MemoryAssets::new();
        assets.insert_file("roof.csv", "");
        let (parsed, diagnostics) =
            parse_with_assets("Structure.RoofL(0) roof.csv", CompileOptions::default(), &mut assets);
        assert_eq!(diagnostics.len(), 1);
        assert!(parsed.structures.roof_left.contains(1));
        assert!(!parsed.structures.roof_left.contains(0));
    }

    #[test]
    fn backgrounds() {
        let mut assets = MemoryAssets::new();
        assets.insert_file("sky.png", "");
        let (parsed, diagnostics) = parse_with_assets(
            "Structure.Background(2) sky.png\nTexture.Background(2).X 4\nStructure.Back(3).Aspect 1",
            CompileOptions::default(),
            &mut assets,
        );
        assert!(diagnostics.is_empty(), "{diagnostics:?}");
        let b = parsed.structures.backgrounds.get(2).cloned().unwrap();
        assert!(b.texture.is_some());
        assert_eq!(b.repetitions, 4);
        let b = parsed.structures.backgrounds.get(3).cloned().unwrap();
        assert_eq!(b.texture, None);
        assert_eq!(b.repetitions, 6);
        assert!(b.keep_aspect_ratio);
    }

    #[test]
    fn raw_signal_textures() {
        let mut assets = MemoryAssets::new();
        assets.insert_file("sig/home.x", "");
        assets.insert_file("sig/glow.csv", "");
        assets.insert_file("sig/home0.bmp", "");
        assets.insert_file("sig/home2.png", "");
        assets.insert_file("sig/glow0.bmp", "");
        let (parsed, diagnostics) = parse_with_assets(
            "Signal(4).Load sig/home;sig/glow",
            CompileOptions::default(),
            &mut assets,
        );
        assert!(diagnostics.is_empty(), "{diagnostics:?}");
        match parsed.structures.signals.get(4).map(|s| s.as_ref()) {
            Some(SignalDefinition::RawObjectPair {
                base,
                glow,
                signal_textures,
                glow_textures,
            }) => {
                assert_eq!(base.as_ref(), Some(&placeholder_object()));
                assert!(glow.is_some());
                assert_eq!(signal_textures.len(), 3);
                assert!(signal_textures[0].is_some());
                assert!(signal_textures[1].is_none());
                assert_eq!(glow_textures.len(), 1);
            }
            other => panic!("unexpected signal {other:?}"),
        }
    }

    #[test]
    fn animated_signal() {
        let mut assets = MemoryAssets::new();
        assets.insert_file("sig.animated", "");
        let (parsed, _) = parse_with_assets("Signal(0) sig.animated", CompileOptions::default(), &mut assets);
        assert!(matches!(
            parsed.structures.signals.get(0).map(|s| s.as_ref()),
            Some(SignalDefinition::Animated(_))
        ));
    }

    #[test]
    fn cycles() {
        let (parsed, diagnostics) = parse_csv("Cycle.Ground(1) 2;3;-1\nCycle.Rail(0) 4;5");
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(parsed.structures.cycles.get(1), Some(&vec![2, 3, 0]));
        assert_eq!(parsed.structures.rail_cycles.get(0), Some(&vec![4, 5]));
    }
}
