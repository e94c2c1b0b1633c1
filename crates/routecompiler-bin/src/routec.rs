use clap::Parser;
use colored::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use routecompiler::{CompileOptions, CompiledRoute, RouteOptions};
use routelang::diagnostics::AriadneSource;
use routelang::preprocess::Preprocessor;
use routelang::source::FileSystem;
use routelang::tokenize::{Token, Tokenizer};
use routelang::{sort, CancellationToken, Diagnostic, Dialect, EmitDiagnostic, Expression, Severity, SourceLoader};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

mod files;
use files::FileAssets;

fn main() {
    env_logger::init();
    if let Err(err) = Cli::parse().run() {
        if !err.is_empty() {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }
}

/// Tools for working with CSV and RW train route files.
#[derive(Debug, Parser)]
#[command(name = "routec", version = "0.1", about, long_about, max_term_width(100))]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn run(self) -> Result<(), String> {
        match self.command {
            Command::Preprocess(preprocess) => preprocess.run(),
            Command::Tokens(tokens) => tokens.run(),
            Command::Compile(compile) => compile.run(),
            Command::Check(check) => check.run(),
        }
    }
}

#[derive(Clone, Debug, clap::Subcommand)]
enum Command {
    /// Print the expressions of a route file sorted by track position.
    ///
    /// This is the input to the command tokenizer:
    ///     directives like $Include, $If and $Rnd have been expanded
    ///     and every command follows the track position it applies to.
    Preprocess(Preprocess),

    /// Print the tokenized commands of a route file.
    ///
    /// Each command is printed with its lowercase namespace and name,
    ///     its indices and its arguments.
    Tokens(Tokens),

    /// Compile a route file and print a summary of the result.
    ///
    /// Object files are checked for existence but not parsed.
    Compile(Compile),

    /// Check a route file for problems.
    ///
    /// Every problem found while compiling the route is printed.
    /// The command fails if any of them is an error.
    Check(Check),
}

#[derive(Clone, Debug, clap::Args)]
struct Input {
    /// Path to the .csv or .rw route file.
    path: PathBuf,

    /// Read the file as an RW route whatever its extension.
    #[arg(long)]
    rw: bool,

    /// Seed for $Rnd, weighted $Include and random station parameters.
    #[arg(long)]
    seed: Option<u64>,
}

impl Input {
    fn dialect(&self) -> Dialect {
        if self.rw {
            Dialect::Rw
        } else {
            Dialect::from_path(&self.path)
        }
    }

    fn read(&self) -> Result<String, String> {
        FileSystem
            .read(&self.path)
            .map_err(|err| format!["failed to read {}: {err}", self.path.display()])
    }

    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// Preprocesses and sorts the route, returning the expressions and the unit of length.
    fn sorted(&self, printer: &mut Printer) -> Result<(Vec<Expression>, Vec<f64>), String> {
        let source = self.read()?;
        let dialect = self.dialect();
        let mut rng = self.rng();
        let preprocessed = Preprocessor {
            dialect,
            loader: &FileSystem,
            rng: &mut rng,
            diagnostics: &mut *printer,
        }
        .run(&self.path, &source);
        let route_options = routecompiler::options::read_route_options(
            &preprocessed.expressions,
            dialect,
            RouteOptions::default(),
            &mut *printer,
        );
        let sorted = sort::sort_by_track_position(
            preprocessed.expressions,
            &route_options.unit_of_length,
            dialect,
            &mut *printer,
        );
        Ok((sorted.expressions, route_options.unit_of_length))
    }

    fn compile(&self, preview_only: bool, printer: &mut Printer) -> Result<CompiledRoute, String> {
        let source = self.read()?;
        let folder = self.path.parent().map(Path::to_path_buf).unwrap_or_default();
        let options = CompileOptions {
            dialect: Some(self.dialect()),
            preview_only,
            object_folder: folder.clone(),
            sound_folder: folder.clone(),
            train_folder: folder.clone(),
            compatibility_folder: folder,
            seed: self.seed,
            enable_hacks: false,
        };
        routecompiler::compile(
            &self.path,
            &source,
            &options,
            &mut FileAssets::default(),
            printer,
            &CancellationToken::new(),
        )
        .map_err(|_| "the compilation was cancelled".to_string())
    }
}

#[derive(Clone, Debug, Parser)]
struct Preprocess {
    #[command(flatten)]
    input: Input,
}

impl Preprocess {
    fn run(&self) -> Result<(), String> {
        let mut printer = Printer::default();
        let (expressions, _) = self.input.sorted(&mut printer)?;
        for expression in &expressions {
            match &expression.location {
                Some(location) => println!(
                    "{}:{}:{}\t{}",
                    location.file.display(),
                    location.line,
                    location.column,
                    expression.text
                ),
                None => println!("-\t{}", expression.text),
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Parser)]
struct Tokens {
    #[command(flatten)]
    input: Input,
}

impl Tokens {
    fn run(&self) -> Result<(), String> {
        let mut printer = Printer::default();
        let (expressions, unit_of_length) = self.input.sorted(&mut printer)?;
        let mut tokenizer = Tokenizer::new(self.input.dialect());
        for expression in &expressions {
            match tokenizer.tokenize(expression, &unit_of_length, &mut printer) {
                Token::Section(name) => println!("[{name}]"),
                Token::TrackPosition { position, .. } => println!("{position}"),
                Token::Command(command) => {
                    let mut line = format!["    {}", command.qualified_name()];
                    if command.index1.is_some() || command.index2.is_some() {
                        let indices: Vec<String> = [command.index1, command.index2]
                            .into_iter()
                            .flatten()
                            .map(|i| format!["{i}"])
                            .collect();
                        line.push_str(&format!["({})", indices.join(";")]);
                    }
                    if !command.arguments.is_empty() {
                        line.push(' ');
                        line.push_str(&command.arguments.join(";"));
                    }
                    println!("{line}");
                }
                Token::Nothing => {}
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Parser)]
struct Compile {
    #[command(flatten)]
    input: Input,

    /// Only read the route's metadata and stations, without placing any scenery.
    #[arg(long)]
    preview: bool,
}

impl Compile {
    fn run(&self) -> Result<(), String> {
        let mut printer = Printer::default();
        let route = self.input.compile(self.preview, &mut printer)?;
        let length = route
            .elements
            .last()
            .map(|e| e.starting_track_position)
            .unwrap_or_default();
        println!("elements:    {} ({length} m of track)", route.elements.len());
        println!("stations:    {}", route.stations.len());
        for station in &route.stations {
            println!(
                "    {:>10.1} m  {} ({} stops)",
                station.default_track_position,
                station.name,
                station.stops.len()
            );
        }
        println!("sections:    {}", route.sections.len());
        println!("placements:  {}", route.placements.len());
        println!("sounds:      {}", route.sounds.len());
        println!("diagnostics: {}", printer.summary());
        Ok(())
    }
}

#[derive(Clone, Debug, Parser)]
struct Check {
    #[command(flatten)]
    input: Input,
}

impl Check {
    fn run(&self) -> Result<(), String> {
        let mut printer = Printer::default();
        self.input.compile(false, &mut printer)?;
        if printer.errors > 0 {
            return Err(format!["{}: {}", self.input.path.display(), printer.summary()]);
        }
        println!("{}: {}", self.input.path.display(), printer.summary());
        Ok(())
    }
}

/// Prints diagnostics to stderr as they are emitted.
///
/// Diagnostics with a location in a readable file are printed as ariadne reports.
#[derive(Default)]
struct Printer {
    sources: HashMap<PathBuf, Option<AriadneSource>>,
    errors: usize,
    warnings: usize,
}

impl Printer {
    fn summary(&self) -> String {
        format!["{} error(s), {} warning(s)", self.errors, self.warnings]
    }

    fn print(&mut self, diagnostic: &Diagnostic) {
        if let (Some(location), Some(report)) = (&diagnostic.location, diagnostic.ariadne_report()) {
            let source = self
                .sources
                .entry(location.file.to_path_buf())
                .or_insert_with(|| {
                    FileSystem
                        .read(&location.file)
                        .ok()
                        .map(|source| AriadneSource::new(&location.file, &source))
                });
            if let Some(source) = source {
                if report.eprint(&*source).is_ok() {
                    return;
                }
            }
        }
        eprintln!("{}", plain(diagnostic));
    }
}

impl EmitDiagnostic for Printer {
    fn emit(&mut self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            Severity::Error => self.errors += 1,
            Severity::Warning => self.warnings += 1,
            Severity::Info => {}
        }
        self.print(&diagnostic);
    }
}

fn plain(diagnostic: &Diagnostic) -> String {
    let tag = match diagnostic.severity {
        Severity::Error => "error".color(Color::BrightRed).bold(),
        Severity::Warning => "warning".color(Color::BrightYellow).bold(),
        Severity::Info => "info".color(Color::BrightBlue).bold(),
    };
    let location = match &diagnostic.location {
        Some(location) => format!["{}:{}:{}: ", location.file.display(), location.line, location.column],
        None => String::new(),
    };
    let action = diagnostic.action();
    if action.is_empty() {
        format!["{tag}: {location}{}", diagnostic.problem()]
    } else {
        format!["{tag}: {location}{} ({action})", diagnostic.problem()]
    }
}
