//! Compiler from CSV and RW train route files to a track element timeline.
//!
//! Compiling a route runs these passes:
//!
//! 1. The [routelang] preprocessor and sorter turn the route file into expressions
//!     ordered by track position, and the `Options` commands are read up front.
//! 2. The commands are executed against a [context::Context], which fills the structure
//!     tables and builds one [block::Block] per block interval of track.
//! 3. The [compiler] walks the blocks and produces the [CompiledRoute]: track elements
//!     with their events, scenery placements, stations and sections.
//!
//! Files referenced by the route are loaded through the [Assets] collaborator,
//!     so the compiler itself never touches the file system.

pub mod assets;
pub mod block;
pub mod commands;
pub mod compat;
pub mod compiler;
pub mod context;
pub mod events;
pub mod follower;
pub mod options;
pub mod output;
pub mod smoothing;
pub mod structures;

pub use assets::{Assets, MemoryAssets};
pub use events::{Event, TrackElement, TrackEvent};
pub use follower::{Pose, TrackFollower};
pub use options::{CompileOptions, RouteOptions};
pub use output::CompiledRoute;

use block::Block;
use compat::CompatibilityObjects;
use context::Context;
use rand::rngs::StdRng;
use rand::SeedableRng;
use routelang::preprocess::Preprocessor;
use routelang::{sort, CancellationToken, Cancelled, Dialect, EmitDiagnostic, LoadError, SourceLoader};
use std::path::Path;
use structures::StructureTables;

/// The state of a route after its commands have run, before the blocks are compiled.
pub struct Parsed {
    pub dialect: Dialect,
    pub options: RouteOptions,
    pub structures: StructureTables,
    pub compat: CompatibilityObjects,
    pub blocks: Vec<Block>,
    pub first_used_block: Option<usize>,
    pub track_position: f64,
    /// Route wide data known after parsing: metadata, stations, markers.
    pub route: CompiledRoute,
}

/// Reads included route files through the assets collaborator.
struct Loader<'a>(&'a dyn Assets);

impl<'a> SourceLoader for Loader<'a> {
    fn read(&self, path: &Path) -> Result<String, LoadError> {
        self.0.read(path)
    }

    fn exists(&self, path: &Path) -> bool {
        self.0.exists(path)
    }
}

/// Runs `f` on a context that has executed every command of the route.
fn with_context<T>(
    path: &Path,
    source: &str,
    options: &CompileOptions,
    assets: &mut dyn Assets,
    diagnostics: &mut dyn EmitDiagnostic,
    cancel: &CancellationToken,
    f: impl FnOnce(&mut Context) -> Result<T, Cancelled>,
) -> Result<T, Cancelled> {
    let dialect = options.dialect.unwrap_or_else(|| Dialect::from_path(path));
    let mut rng = match options.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let preprocessed = Preprocessor {
        dialect,
        loader: &Loader(&*assets),
        rng: &mut rng,
        diagnostics: &mut *diagnostics,
    }
    .run(path, source);
    cancel.checkpoint()?;
    log::debug!(
        "preprocessed {} into {} expressions",
        path.display(),
        preprocessed.expressions.len()
    );

    let defaults = RouteOptions {
        enable_hacks: options.enable_hacks,
        ..Default::default()
    };
    let route_options = options::read_route_options(&preprocessed.expressions, dialect, defaults, &mut *diagnostics);
    let sorted = sort::sort_by_track_position(
        preprocessed.expressions,
        &route_options.unit_of_length,
        dialect,
        &mut *diagnostics,
    );
    cancel.checkpoint()?;

    let route_folder = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut ctx = Context::new(dialect, route_options, options, route_folder, &mut rng, assets, diagnostics);
    ctx.route.minimum_jump_position = sorted.minimum_jump_position;
    if !preprocessed.description.is_empty() {
        if !ctx.route.comment.is_empty() {
            ctx.route.comment.push('\n');
        }
        ctx.route.comment.push_str(&preprocessed.description);
    }
    ctx.run(&sorted.expressions, cancel)?;
    f(&mut ctx)
}

/// Runs the commands of a route file without compiling its blocks.
pub fn parse(
    path: &Path,
    source: &str,
    options: &CompileOptions,
    assets: &mut dyn Assets,
    diagnostics: &mut dyn EmitDiagnostic,
    cancel: &CancellationToken,
) -> Result<Parsed, Cancelled> {
    with_context(path, source, options, assets, diagnostics, cancel, |ctx| {
        Ok(Parsed {
            dialect: ctx.dialect,
            options: ctx.options.clone(),
            structures: std::mem::take(&mut ctx.structures),
            compat: ctx.compat.clone(),
            blocks: std::mem::take(&mut ctx.blocks),
            first_used_block: ctx.first_used_block,
            track_position: ctx.track_position,
            route: std::mem::take(&mut ctx.route),
        })
    })
}

/// Compiles a route file.
///
/// Problems in the route are reported to `diagnostics` and never stop the compilation;
///     the only error is cancellation through `cancel`.
pub fn compile(
    path: &Path,
    source: &str,
    options: &CompileOptions,
    assets: &mut dyn Assets,
    diagnostics: &mut dyn EmitDiagnostic,
    cancel: &CancellationToken,
) -> Result<CompiledRoute, Cancelled> {
    with_context(path, source, options, assets, diagnostics, cancel, |ctx| {
        compiler::compile(ctx, cancel)?;
        Ok(std::mem::take(&mut ctx.route))
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use routelang::Diagnostic;

    fn path(options: &CompileOptions) -> &'static Path {
        match options.dialect {
            Some(Dialect::Rw) => Path::new("route.rw"),
            _ => Path::new("route.csv"),
        }
    }

    fn seeded(options: CompileOptions) -> CompileOptions {
        CompileOptions {
            seed: options.seed.or(Some(0)),
            ..options
        }
    }

    pub fn parse_with_assets(
        source: &str,
        options: CompileOptions,
        assets: &mut MemoryAssets,
    ) -> (Parsed, Vec<Diagnostic>) {
        let options = seeded(options);
        let mut diagnostics = vec![];
        let parsed = super::parse(
            path(&options),
            source,
            &options,
            assets,
            &mut diagnostics,
            &CancellationToken::new(),
        )
        .expect("not cancelled");
        (parsed, diagnostics)
    }

    pub fn parse(source: &str, options: CompileOptions) -> (Parsed, Vec<Diagnostic>) {
        parse_with_assets(source, options, &mut MemoryAssets::new())
    }

    pub fn parse_csv(source: &str) -> (Parsed, Vec<Diagnostic>) {
        parse(source, CompileOptions::default())
    }

    pub fn compile_with_assets(
        source: &str,
        options: CompileOptions,
        assets: &mut MemoryAssets,
    ) -> (CompiledRoute, Vec<Diagnostic>) {
        let options = seeded(options);
        let mut diagnostics = vec![];
        let route = super::compile(
            path(&options),
            source,
            &options,
            assets,
            &mut diagnostics,
            &CancellationToken::new(),
        )
        .expect("not cancelled");
        (route, diagnostics)
    }

    pub fn compile(source: &str, options: CompileOptions) -> (CompiledRoute, Vec<Diagnostic>) {
        compile_with_assets(source, options, &mut MemoryAssets::new())
    }

    pub fn compile_csv(source: &str) -> (CompiledRoute, Vec<Diagnostic>) {
        compile(source, CompileOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{compile, compile_csv};
    use super::*;
    use routelang::DiagnosticKind;

    #[test]
    fn empty_route_has_track() {
        let (route, diagnostics) = compile_csv("");
        assert!(diagnostics.is_empty(), "{diagnostics:?}");
        assert!(!route.elements.is_empty());
        assert_eq!(route.sections.len(), 1);
    }

    #[test]
    fn rw_dialect_from_options() {
        let options = CompileOptions {
            dialect: Some(Dialect::Rw),
            ..Default::default()
        };
        let (route, _) = compile("[Railway]\nSta(A)", options);
        assert_eq!(route.stations.len(), 1);
        assert_eq!(route.stations[0].name, "A");
    }

    #[test]
    fn same_seed_same_route() {
        let source = "Track.Pitch $Rnd(1;1000)";
        let (a, _) = compile_csv(source);
        let (b, _) = compile_csv(source);
        assert_eq!(a.elements[0].pitch, b.elements[0].pitch);
    }

    #[test]
    fn cancelled_compilation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut diagnostics = vec![];
        let result = super::compile(
            Path::new("route.csv"),
            "Track.Sta A",
            &CompileOptions::default(),
            &mut MemoryAssets::new(),
            &mut diagnostics,
            &cancel,
        );
        assert_eq!(result, Err(Cancelled));
    }

    #[test]
    fn missing_include_is_reported() {
        let (_, diagnostics) = compile_csv("$Include(missing.csv)");
        assert!(diagnostics
            .iter()
            .any(|d| matches!(d.kind, DiagnosticKind::IncludeFileNotFound { .. })));
    }
}
