//! The state shared by every command handler.
//!
//! Commands are executed in two passes over the sorted expressions.
//! The first pass runs every command outside of the `Track` namespace,
//!     so that structure tables are complete before any track command refers to them.
//! The second pass runs the `Track` commands in track position order and builds the blocks.

use crate::assets::{Assets, SoundHandle, StaticObject, TextureHandle, TextureOptions, UnifiedObject};
use crate::block::{self, Block};
use crate::commands::{self, BuiltIn};
use crate::compat::CompatibilityObjects;
use crate::options::{CompileOptions, RouteOptions};
use crate::output::CompiledRoute;
use crate::structures::StructureTables;
use rand::rngs::StdRng;
use routelang::diagnostics::{Discard, Fallback};
use routelang::tokenize::{Command, Token, Tokenizer};
use routelang::{numbers, source, CancellationToken, Cancelled, Dialect, DiagnosticKind, EmitDiagnostic, Expression};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Default speeds of the signal aspects 0 to 5, in meters per second.
const DEFAULT_SIGNAL_SPEEDS: [f64; 6] = [
    0.0,
    6.94444444444444,
    15.2777777777778,
    20.8333333333333,
    f64::INFINITY,
    f64::INFINITY,
];

/// Extensions tried for object files named without one.
pub const OBJECT_EXTENSIONS: [&str; 4] = ["csv", "b3d", "x", "animated"];

pub struct Context<'a> {
    pub dialect: Dialect,
    pub options: RouteOptions,
    pub compile_options: &'a CompileOptions,
    /// Folder of the route file; route images are relative to it.
    pub route_folder: PathBuf,
    pub structures: StructureTables,
    pub compat: CompatibilityObjects,
    pub blocks: Vec<Block>,
    /// Block of the first track position in the file.
    pub first_used_block: Option<usize>,
    /// Block that track commands currently write to.
    pub block: usize,
    pub track_position: f64,
    /// Route wide results that are known while parsing: metadata, stations and so on.
    pub route: CompiledRoute,
    pub current_station: Option<usize>,
    /// Number of cars of the last stop point of the current station, or -1 before any.
    pub current_stop: i32,
    pub departure_signal_used: bool,
    /// Number of `Track.Section` commands so far.
    pub current_section: usize,
    pub rng: &'a mut StdRng,
    pub assets: &'a mut dyn Assets,
    pub diagnostics: &'a mut dyn EmitDiagnostic,
}

impl<'a> Context<'a> {
    pub fn new(
        dialect: Dialect,
        options: RouteOptions,
        compile_options: &'a CompileOptions,
        route_folder: PathBuf,
        rng: &'a mut StdRng,
        assets: &'a mut dyn Assets,
        diagnostics: &'a mut dyn EmitDiagnostic,
    ) -> Context<'a> {
        let compat = CompatibilityObjects::new(&compile_options.compatibility_folder);
        let mut structures = StructureTables::default();
        if !compile_options.preview_only {
            compat.install_poles(&mut structures);
        }
        let route = CompiledRoute {
            signal_speeds: DEFAULT_SIGNAL_SPEEDS.to_vec(),
            unit_of_length: options.unit_of_length.clone(),
            block_interval: options.block_interval,
            ..Default::default()
        };
        let blocks = vec![Block::initial(dialect, options.block_interval)];
        Context {
            dialect,
            options,
            compile_options,
            route_folder,
            structures,
            compat,
            blocks,
            first_used_block: None,
            block: 0,
            track_position: 0.0,
            route,
            current_station: None,
            current_stop: -1,
            departure_signal_used: false,
            current_section: 0,
            rng,
            assets,
            diagnostics,
        }
    }

    pub fn preview_only(&self) -> bool {
        self.compile_options.preview_only
    }

    /// Runs every command in the sorted expressions.
    pub fn run(&mut self, expressions: &[Expression], cancel: &CancellationToken) -> Result<(), Cancelled> {
        let built_ins = commands::built_in_commands();
        let mut tokenizer = Tokenizer::new(self.dialect);
        for (i, expression) in expressions.iter().enumerate() {
            if i % 256 == 0 {
                cancel.checkpoint()?;
            }
            let token = tokenizer.tokenize(expression, &self.options.unit_of_length, self.diagnostics);
            let Token::Command(command) = token else {
                continue;
            };
            if matches!(command.namespace.as_str(), "track" | "options") {
                continue;
            }
            self.dispatch(&built_ins, &command, expression);
        }
        log::debug!(
            "structure pass: {} rail, {} ground and {} signal definitions",
            self.structures.rail.len(),
            self.structures.ground.len(),
            self.structures.signals.len()
        );

        let mut tokenizer = Tokenizer::new(self.dialect);
        for (i, expression) in expressions.iter().enumerate() {
            if i % 256 == 0 {
                cancel.checkpoint()?;
            }
            match tokenizer.tokenize(expression, &self.options.unit_of_length, &mut Discard) {
                Token::TrackPosition { position, has_arguments } => {
                    if has_arguments {
                        self.diagnostics
                            .report(DiagnosticKind::TrackPositionWithArguments, expression.location.as_ref());
                    } else {
                        self.set_track_position(position);
                    }
                }
                Token::Command(command) if command.namespace == "track" => {
                    self.dispatch(&built_ins, &command, expression);
                }
                _ => {}
            }
        }
        log::debug!("track pass: {} blocks", self.blocks.len());
        Ok(())
    }

    fn dispatch(&mut self, built_ins: &HashMap<&'static str, BuiltIn>, command: &Command, expression: &Expression) {
        let name = command.qualified_name();
        match built_ins.get(name.as_str()) {
            None => {
                self.diagnostics
                    .report(DiagnosticKind::UnsupportedCommand { command: name }, expression.location.as_ref());
            }
            Some(built_in) => {
                if self.preview_only() && !built_in.runs_in_preview() {
                    return;
                }
                let mut invocation = Invocation {
                    ctx: self,
                    command,
                    expression,
                };
                built_in.call(&mut invocation);
            }
        }
    }

    /// Moves to a new track position, synthesizing any blocks up to it.
    pub fn set_track_position(&mut self, position: f64) {
        if position < 0.0 {
            return;
        }
        self.track_position = position;
        self.block = block::block_index(position, self.options.block_interval);
        self.first_used_block.get_or_insert(self.block);
        self.ensure_blocks(self.block);
    }

    /// Synthesizes blocks so that the block with the given index exists.
    pub fn ensure_blocks(&mut self, index: usize) {
        let preview_only = self.preview_only();
        while self.blocks.len() <= index {
            let next = match self.blocks.last() {
                Some(last) => last.next(&self.structures, preview_only),
                None => Block::initial(self.dialect, self.options.block_interval),
            };
            self.blocks.push(next);
        }
    }
}

/// A single command being executed.
pub struct Invocation<'c, 'a> {
    pub ctx: &'c mut Context<'a>,
    pub command: &'c Command,
    pub expression: &'c Expression,
}

impl<'c, 'a> Invocation<'c, 'a> {
    pub fn name(&self) -> String {
        self.command.qualified_name()
    }

    pub fn report(&mut self, kind: DiagnosticKind) {
        self.ctx.diagnostics.report(kind, self.expression.location.as_ref());
    }

    pub fn preview_only(&self) -> bool {
        self.ctx.preview_only()
    }

    pub fn block(&mut self) -> &mut Block {
        let index = self.ctx.block;
        self.ctx.ensure_blocks(index);
        &mut self.ctx.blocks[index]
    }

    pub fn track_position(&self) -> f64 {
        self.ctx.track_position
    }

    /// Returns the argument at the given index, if it exists and is not empty.
    pub fn arg(&self, i: usize) -> Option<&'c str> {
        let command: &'c Command = self.command;
        command.argument(i)
    }

    pub fn num_args(&self) -> usize {
        self.command.arguments.len()
    }

    pub fn invalid(&mut self, argument: &'static str, fallback: Fallback) {
        self.report(DiagnosticKind::InvalidArgument {
            command: self.name(),
            argument,
            fallback,
        });
    }

    pub fn out_of_range(&mut self, argument: &'static str, rule: &'static str, fallback: Fallback) {
        self.report(DiagnosticKind::ArgumentOutOfRange {
            command: self.name(),
            argument,
            rule,
            fallback,
        });
    }

    pub fn undefined(&mut self, what: &'static str, index: i32) {
        self.report(DiagnosticKind::UndefinedReference {
            command: self.name(),
            what,
            index,
        });
    }

    fn parse_or<T: Copy + std::fmt::Display>(
        &mut self,
        i: usize,
        argument: &'static str,
        default: T,
        parse: impl Fn(&str) -> Option<T>,
    ) -> T {
        match self.arg(i) {
            None => default,
            Some(a) => match parse(a) {
                Some(v) => v,
                None => {
                    self.invalid(argument, Fallback::value(default));
                    default
                }
            },
        }
    }

    /// Reads a number; a missing argument silently takes the default.
    pub fn f64_arg(&mut self, i: usize, argument: &'static str, default: f64) -> f64 {
        self.parse_or(i, argument, default, numbers::parse_f64_lenient)
    }

    pub fn i32_arg(&mut self, i: usize, argument: &'static str, default: i32) -> i32 {
        self.parse_or(i, argument, default, numbers::parse_i32_lenient)
    }

    /// Reads a length in the route's units of length.
    pub fn length_arg(&mut self, i: usize, argument: &'static str, default: f64) -> f64 {
        let factors = self.ctx.options.unit_of_length.clone();
        self.parse_or(i, argument, default, |a| numbers::parse_length_lenient(a, &factors))
    }

    /// Reads a `0|1` flag.
    pub fn bool_arg(&mut self, i: usize, argument: &'static str, default: bool) -> bool {
        match self.i32_arg(i, argument, default as i32) {
            0 => false,
            1 => true,
            _ => {
                self.out_of_range(argument, "the value must be 0 or 1", Fallback::value(default as i32));
                default
            }
        }
    }

    /// Reads the first index, which must be non-negative.
    pub fn non_negative_index(&mut self, what: &'static str) -> Option<i32> {
        let index = self.command.first_index();
        if index < 0 {
            self.out_of_range(what, "the index must be non-negative", Fallback::IgnoreCommand);
            return None;
        }
        Some(index)
    }

    /// Resolves a file name and checks that it exists.
    pub fn locate(&mut self, folder: &Path, file: &str) -> Option<PathBuf> {
        let path = source::resolve(folder, file);
        if self.ctx.assets.exists(&path) {
            Some(path)
        } else {
            self.report(DiagnosticKind::FileNotFound {
                command: self.name(),
                file: file.to_string(),
            });
            None
        }
    }

    /// Resolves an object file in the object folder.
    ///
    /// Old routes often leave out the extension, so if the file does not exist the
    ///     known object extensions are tried in turn.
    pub fn locate_object(&mut self, file: &str) -> Option<PathBuf> {
        let options: &'a CompileOptions = self.ctx.compile_options;
        let folder = &options.object_folder;
        let path = source::resolve(folder, file);
        if self.ctx.assets.exists(&path) {
            return Some(path);
        }
        for extension in OBJECT_EXTENSIONS {
            let candidate = source::resolve(folder, &format!["{file}.{extension}"]);
            if self.ctx.assets.exists(&candidate) {
                return Some(candidate);
            }
        }
        self.report(DiagnosticKind::FileNotFound {
            command: self.name(),
            file: file.to_string(),
        });
        None
    }

    fn not_loaded(&mut self, path: &Path, error: routelang::LoadError) {
        self.report(DiagnosticKind::FileNotLoaded {
            file: path.display().to_string(),
            reason: error.to_string(),
        });
    }

    /// Loads an object from the object folder.
    pub fn load_object(&mut self, file: &str) -> Option<Rc<UnifiedObject>> {
        let path = self.locate_object(file)?;
        match self.ctx.assets.load_object(&path) {
            Ok(object) => Some(Rc::new(object)),
            Err(err) => {
                self.not_loaded(&path, err);
                None
            }
        }
    }

    pub fn load_static_object(&mut self, file: &str) -> Option<StaticObject> {
        let path = self.locate_object(file)?;
        match self.ctx.assets.load_static_object(&path) {
            Ok(object) => Some(object),
            Err(err) => {
                self.not_loaded(&path, err);
                None
            }
        }
    }

    pub fn register_texture(&mut self, path: &Path, options: TextureOptions) -> Option<TextureHandle> {
        match self.ctx.assets.register_texture(path, options) {
            Ok(handle) => Some(handle),
            Err(err) => {
                self.not_loaded(path, err);
                None
            }
        }
    }

    /// Registers a sound from the sound folder.
    pub fn register_sound(&mut self, file: &str, radius: f64) -> Option<SoundHandle> {
        let folder = self.ctx.compile_options.sound_folder.clone();
        let path = self.locate(&folder, file)?;
        match self.ctx.assets.register_sound_buffer(&path, radius) {
            Ok(handle) => Some(handle),
            Err(err) => {
                self.not_loaded(&path, err);
                None
            }
        }
    }
}
