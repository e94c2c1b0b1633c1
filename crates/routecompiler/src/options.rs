//! Compile options and the `Options` namespace.
//!
//! [CompileOptions] are chosen by the host.
//! [RouteOptions] are chosen by the route file itself through `Options.*` commands,
//!     which are read in a separate pass before expressions are sorted by track position.

use routelang::diagnostics::Fallback;
use routelang::tokenize::{Command, Token, Tokenizer};
use routelang::{numbers, Dialect, DiagnosticKind, EmitDiagnostic, Expression};
use std::path::PathBuf;

/// Options supplied by the host application.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CompileOptions {
    /// Surface syntax of the route file.
    ///
    /// If [None], the dialect follows from the file extension.
    pub dialect: Option<Dialect>,
    /// Only read the route's metadata and stations.
    ///
    /// No objects are loaded and no textures or sounds are registered.
    pub preview_only: bool,
    /// Folder that object file names are relative to.
    pub object_folder: PathBuf,
    /// Folder that sound file names are relative to.
    pub sound_folder: PathBuf,
    /// Folder of the player's train, used for timetable textures.
    pub train_folder: PathBuf,
    /// Folder with the built-in speed limit graphics, in `Limits/Graphics`.
    pub compatibility_folder: PathBuf,
    /// Seed for `$Rnd`, weighted `$Include` and random station parameters.
    ///
    /// If [None], the generator is seeded from the operating system.
    pub seed: Option<u64>,
    /// Apply fixes for known mistakes in old routes even if the route does not ask for them.
    pub enable_hacks: bool,
}

/// Km/h in meters per second.
pub const KMPH: f64 = 0.277777777777778;

/// Options set with the `Options` namespace.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RouteOptions {
    /// Factors converting lengths written `a:b:c` to meters.
    pub unit_of_length: Vec<f64>,
    /// Factor converting speeds in the route file to meters per second.
    pub unit_of_speed: f64,
    pub block_interval: f64,
    /// Whether objects are hidden based on their own extent rather than their block.
    pub accurate_object_disposal: bool,
    /// Whether every `Track.Section` behaves like `Track.SectionS`.
    pub value_based_sections: bool,
    /// Whether the sign of a cant is kept as written instead of following the curve.
    pub signed_cant: bool,
    /// Whether fog changes gradually between consecutive `Track.Fog` commands.
    pub fog_transitions: bool,
    pub enable_hacks: bool,
}

impl Default for RouteOptions {
    fn default() -> Self {
        RouteOptions {
            unit_of_length: vec![1.0],
            unit_of_speed: KMPH,
            block_interval: 25.0,
            accurate_object_disposal: false,
            value_based_sections: false,
            signed_cant: false,
            fog_transitions: false,
            enable_hacks: false,
        }
    }
}

/// Reads every `Options` command in the file.
///
/// Tokenizer diagnostics are not reported here;
///     they are reported when the expressions are tokenized again after sorting.
pub fn read_route_options(
    expressions: &[Expression],
    dialect: Dialect,
    defaults: RouteOptions,
    diagnostics: &mut dyn EmitDiagnostic,
) -> RouteOptions {
    let mut options = defaults;
    let mut tokenizer = Tokenizer::new(dialect);
    for expression in expressions {
        let token = tokenizer.tokenize(expression, &options.unit_of_length, &mut routelang::diagnostics::Discard);
        let Token::Command(command) = token else {
            continue;
        };
        if command.namespace != "options" {
            continue;
        }
        let mut context = OptionContext {
            command: &command,
            expression,
            diagnostics,
        };
        context.apply(&mut options);
    }
    log::debug!(
        "route options: block interval {}, unit of speed {}, {} length factors",
        options.block_interval,
        options.unit_of_speed,
        options.unit_of_length.len()
    );
    options
}

struct OptionContext<'a, 'b> {
    command: &'a Command,
    expression: &'a Expression,
    diagnostics: &'b mut dyn EmitDiagnostic,
}

impl<'a, 'b> OptionContext<'a, 'b> {
    fn report(&mut self, kind: DiagnosticKind) {
        self.diagnostics.report(kind, self.expression.location.as_ref());
    }

    fn apply(&mut self, options: &mut RouteOptions) {
        let name = self.command.qualified_name();
        if self.command.arguments.is_empty() {
            self.report(DiagnosticKind::MissingArguments {
                command: name,
                expected: 1,
            });
            return;
        }
        match self.command.name.as_str() {
            "unitoflength" => {
                options.unit_of_length = self.unit_of_length();
            }
            "unitofspeed" => {
                options.unit_of_speed = match self.command.argument(0).map(numbers::parse_f64_lenient) {
                    None => KMPH,
                    Some(None) => {
                        self.report(DiagnosticKind::InvalidArgument {
                            command: name,
                            argument: "FactorInKmph",
                            fallback: Fallback::value(1),
                        });
                        KMPH
                    }
                    Some(Some(f)) if f <= 0.0 => {
                        self.report(DiagnosticKind::ArgumentOutOfRange {
                            command: name,
                            argument: "FactorInKmph",
                            rule: "the factor must be positive",
                            fallback: Fallback::value(1),
                        });
                        KMPH
                    }
                    Some(Some(f)) => f * KMPH,
                };
            }
            "blocklength" => {
                let length = self
                    .command
                    .argument(0)
                    .map(|a| numbers::parse_length_lenient(a, &options.unit_of_length));
                options.block_interval = match length {
                    None => 25.0,
                    Some(Some(l)) if l > 0.0 => l,
                    _ => {
                        self.report(DiagnosticKind::ArgumentOutOfRange {
                            command: name,
                            argument: "Length",
                            rule: "the block length must be a positive number",
                            fallback: Fallback::value(25),
                        });
                        25.0
                    }
                };
            }
            "objectvisibility" => options.accurate_object_disposal = self.mode(),
            "sectionbehavior" => options.value_based_sections = self.mode(),
            "cantbehavior" => options.signed_cant = self.mode(),
            "fogbehavior" => options.fog_transitions = self.mode(),
            "enablehacks" => options.enable_hacks = options.enable_hacks || self.mode(),
            _ => self.report(DiagnosticKind::UnsupportedCommand { command: name }),
        }
    }

    fn unit_of_length(&mut self) -> Vec<f64> {
        let n = self.command.arguments.len();
        let mut factors = Vec::with_capacity(n);
        for (i, argument) in self.command.arguments.iter().enumerate() {
            let default = if i == n - 1 { 1.0 } else { 0.0 };
            if argument.is_empty() {
                factors.push(default);
                continue;
            }
            match numbers::parse_f64_lenient(argument) {
                None => {
                    let fallback = if i == 0 { 1.0 } else { 0.0 };
                    self.report(DiagnosticKind::InvalidArgument {
                        command: self.command.qualified_name(),
                        argument: "FactorInMeters",
                        fallback: Fallback::value(fallback),
                    });
                    factors.push(fallback);
                }
                Some(f) if f <= 0.0 => {
                    self.report(DiagnosticKind::ArgumentOutOfRange {
                        command: self.command.qualified_name(),
                        argument: "FactorInMeters",
                        rule: "unit factors must be positive",
                        fallback: Fallback::value(default),
                    });
                    factors.push(default);
                }
                Some(f) => factors.push(f),
            }
        }
        factors
    }

    /// Reads a `0|1` mode argument.
    fn mode(&mut self) -> bool {
        let Some(argument) = self.command.argument(0) else {
            return false;
        };
        match numbers::parse_i32_lenient(argument) {
            Some(0) => false,
            Some(1) => true,
            Some(_) => {
                self.report(DiagnosticKind::ArgumentOutOfRange {
                    command: self.command.qualified_name(),
                    argument: "Mode",
                    rule: "the mode must be 0 or 1",
                    fallback: Fallback::value(0),
                });
                false
            }
            None => {
                self.report(DiagnosticKind::InvalidArgument {
                    command: self.command.qualified_name(),
                    argument: "Mode",
                    fallback: Fallback::value(0),
                });
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use routelang::Diagnostic;

    fn read(source: &str, dialect: Dialect) -> (RouteOptions, Vec<Diagnostic>) {
        let expressions: Vec<Expression> = source.lines().map(Expression::synthesized).collect();
        let mut diagnostics = vec![];
        let options = read_route_options(&expressions, dialect, RouteOptions::default(), &mut diagnostics);
        (options, diagnostics)
    }

    macro_rules! route_options_tests {
        ( $( ($name: ident, $source: expr, $dialect: expr, $check: expr, $num_diagnostics: expr), )+ ) => {
            $(
                #[test]
                fn $name() {
                    let (options, diagnostics) = read($source, $dialect);
                    let check: fn(&RouteOptions) -> bool = $check;
                    assert!(check(&options), "{options:?}");
                    assert_eq!(diagnostics.len(), $num_diagnostics, "{diagnostics:?}");
                }
            )+
        };
    }

    route_options_tests!(
        (defaults, "Track.Curve 300", Dialect::Csv, |o| *o == RouteOptions::default(), 0),
        (
            unit_of_length,
            "Options.UnitOfLength 1000;1",
            Dialect::Csv,
            |o| o.unit_of_length == vec![1000.0, 1.0],
            0
        ),
        (
            unit_of_length_invalid_first,
            "Options.UnitOfLength x;0.5",
            Dialect::Csv,
            |o| o.unit_of_length == vec![1.0, 0.5],
            1
        ),
        (
            unit_of_length_negative_last,
            "Options.UnitOfLength 20;-1",
            Dialect::Csv,
            |o| o.unit_of_length == vec![20.0, 1.0],
            1
        ),
        (
            unit_of_speed,
            "Options.UnitOfSpeed 1.609344",
            Dialect::Csv,
            |o| (o.unit_of_speed - 1.609344 * KMPH).abs() < 1e-12,
            0
        ),
        (
            unit_of_speed_negative,
            "Options.UnitOfSpeed -2",
            Dialect::Csv,
            |o| o.unit_of_speed == KMPH,
            1
        ),
        (block_length, "Options.BlockLength 50", Dialect::Csv, |o| o.block_interval == 50.0, 0),
        (
            block_length_zero,
            "Options.BlockLength 0",
            Dialect::Csv,
            |o| o.block_interval == 25.0,
            1
        ),
        (
            behaviors,
            "With Options\n.SectionBehavior 1\n.CantBehavior 1\n.FogBehavior 1\n.ObjectVisibility 1",
            Dialect::Csv,
            |o| o.value_based_sections && o.signed_cant && o.fog_transitions && o.accurate_object_disposal,
            0
        ),
        (
            invalid_mode,
            "Options.FogBehavior 2",
            Dialect::Csv,
            |o| !o.fog_transitions,
            1
        ),
        (
            missing_argument,
            "Options.BlockLength",
            Dialect::Csv,
            |o| o.block_interval == 25.0,
            1
        ),
        (
            rw_section,
            "[Options]\nBlockLength = 20",
            Dialect::Rw,
            |o| o.block_interval == 20.0,
            0
        ),
        (
            unsupported,
            "Options.Foo 1",
            Dialect::Csv,
            |o| *o == RouteOptions::default(),
            1
        ),
    );

    #[test]
    fn enable_hacks_cannot_be_turned_off_by_route() {
        let expressions = vec![Expression::synthesized("Options.EnableHacks 0")];
        let defaults = RouteOptions {
            enable_hacks: true,
            ..Default::default()
        };
        let options = read_route_options(&expressions, Dialect::Csv, defaults, &mut vec![]);
        assert!(options.enable_hacks);
    }
}
