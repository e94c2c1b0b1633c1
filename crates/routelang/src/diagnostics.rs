//! Diagnostics emitted while reading and compiling a route
//!
//! None of the problems described here stop a compilation.
//! Each one is reported to an [EmitDiagnostic] sink,
//!     the offending command or value is skipped or replaced by a default,
//!     and processing continues.

use std::ops::Range;
use std::path::Path;
use std::rc::Rc;

/// Position of a fragment in a route source file.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct Location {
    pub file: Rc<Path>,
    /// Line number, starting at 1.
    pub line: usize,
    /// Index of the fragment within the line, starting at 1.
    pub column: usize,
    /// Location of the fragment in the source file.
    ///
    /// The span is in number of Unicode code points, not bytes.
    pub span: Range<usize>,
}

#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Diagnostic generated while processing a route.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct Diagnostic {
    /// Location of the fragment that generated this diagnostic.
    ///
    /// This is [None] for problems that are only detected once the whole route has been read,
    ///     like a station without stop points.
    pub location: Option<Location>,
    pub severity: Severity,
    /// Whether the problem is serious enough that a host may want to abort.
    ///
    /// The compiler itself never aborts; acting on this flag is up to the caller.
    pub critical: bool,
    pub kind: DiagnosticKind,
}

/// What happens to a command after an invalid argument.
#[derive(PartialEq, Eq, Debug, Clone)]
pub enum Fallback {
    /// The given value is used in place of the argument.
    UseValue(String),
    /// The whole command has no effect.
    IgnoreCommand,
}

impl Fallback {
    pub fn value(v: impl std::fmt::Display) -> Fallback {
        Fallback::UseValue(format!["{v}"])
    }

    fn action(&self) -> String {
        match self {
            Fallback::UseValue(v) => format!["{v} will be used instead"],
            Fallback::IgnoreCommand => "the command will be ignored".into(),
        }
    }
}

/// Kind of diagnostic.
#[derive(PartialEq, Eq, Debug, Clone)]
pub enum DiagnosticKind {
    /// A closing parenthesis was found before any opening parenthesis.
    UnexpectedClosingParenthesis,
    /// The parentheses after a `$` directive are not balanced.
    InvalidDirectiveParentheses { directive: String },
    /// A `$If` or `$Include` directive is preceded by other text in the same fragment.
    DirectiveNotAtStart { directive: String },
    /// The condition of a `$If` is not a number.
    NonNumericCondition { condition: String },
    /// The file ended inside a skipped `$If` block.
    EndIfMissing,
    /// A `$Else` has no matching `$If`.
    ElseWithoutIf,
    /// A `$If` block contains more than one `$Else`.
    DuplicateElse,
    /// A `$EndIf` has no matching `$If`.
    EndIfWithoutIf,
    /// A `$Include` directive does not name any file.
    IncludeWithoutFile,
    /// A file named in a `$Include` directive does not exist.
    IncludeFileNotFound { file: String },
    /// The track position offset after `file:` in a `$Include` is not a number.
    InvalidIncludeOffset { offset: String },
    /// A `$Include` weight is not a positive number.
    InvalidIncludeWeight { weight: String },
    /// The argument of `$Chr`, `$ChrAscii` or `$ChrUni` is not a valid character code.
    InvalidCharacterCode { directive: String, argument: String },
    /// The arguments of `$Rnd` are not two integers.
    InvalidRandomRange { arguments: String },
    /// The index of a `$Sub` is not a non-negative integer.
    InvalidSubstitutionIndex { argument: String },
    /// A `$Sub` is read before it has been assigned.
    UndefinedSubstitution { index: usize },
    /// A bare track position is negative.
    NegativeTrackPosition { text: String },
    /// A command name contains an opening parenthesis that cannot start an index.
    InvalidOpeningParenthesis,
    /// A command name has an opening parenthesis that is never closed.
    MissingClosingParenthesis,
    /// A command name contains a closing parenthesis that was never opened.
    InvalidClosingParenthesis,
    /// A command cannot be split into a name and arguments.
    InvalidCommandSyntax,
    /// A command name ends with a semicolon.
    TrailingSemicolon,
    /// The index part of a command name is not one or two integers.
    InvalidIndex { command: String, index: String },
    /// The command is not part of the route language.
    UnsupportedCommand { command: String },
    /// A bare track position is followed by arguments.
    TrackPositionWithArguments,
    /// Fewer arguments were given than the command requires.
    MissingArguments { command: String, expected: usize },
    /// An argument could not be parsed.
    InvalidArgument {
        command: String,
        argument: &'static str,
        fallback: Fallback,
    },
    /// An argument was parsed but is outside of its allowed range.
    ArgumentOutOfRange {
        command: String,
        argument: &'static str,
        rule: &'static str,
        fallback: Fallback,
    },
    /// A command refers to a table entry or rail that does not exist.
    UndefinedReference {
        command: String,
        what: &'static str,
        index: i32,
    },
    /// A table entry is defined a second time.
    Redefinition {
        command: String,
        what: &'static str,
        index: i32,
    },
    /// A file referenced by a command does not exist.
    FileNotFound { command: String, file: String },
    /// A file exists but could not be loaded.
    FileNotLoaded { file: String, reason: String },
    /// A station has no stop points and is not a pass station.
    StationWithoutStops { station: String },
    /// A station asks the train to change ends but no later station stops every train.
    ChangeEndsWithoutNextStop { station: String },
    /// A station asks the train to change ends but the next station lets some trains pass.
    ChangeEndsBeforePassStation { station: String, next: String },
    /// A command refers to a rail that has not been started.
    RailNotStarted { command: String, rail: i32 },
    /// A rail is started a second time without being ended first.
    RailAlreadyStarted { command: String, rail: i32 },
    /// A stop point is placed before any station has been defined.
    StopWithoutStation { command: String },
    /// A pretrain time is not later than the previous one.
    NonAscendingPreTrainTime,
    /// A signal index has no definition and a built-in compatibility signal is used.
    CompatibilitySignalUsed { command: String, index: i32 },
}

struct Data {
    severity: Severity,
    rule: String,
    problem: String,
    action: String,
}

impl DiagnosticKind {
    fn critical(&self) -> bool {
        matches!(self, DiagnosticKind::FileNotFound { .. })
    }

    fn data(&self) -> Data {
        use DiagnosticKind::*;
        use Severity::*;
        match self.clone() {
            UnexpectedClosingParenthesis => Data {
                severity: Warning,
                rule: "all closing parentheses must be balanced by a preceding opening parenthesis".into(),
                problem: "closing parenthesis was never opened".into(),
                action: "the closing parenthesis will not change the nesting depth".into(),
            },
            InvalidDirectiveParentheses { directive } => Data {
                severity: Error,
                rule: "directives take their arguments in balanced parentheses, e.g. $Chr(65)".into(),
                problem: format!["invalid parenthesis structure in {directive}"],
                action: "the rest of this fragment will not be preprocessed".into(),
            },
            DirectiveNotAtStart { directive } => Data {
                severity: Error,
                rule: format!["{directive} must be the first thing in its fragment"],
                problem: format!["{directive} appears within another statement"],
                action: "the rest of this fragment will not be preprocessed".into(),
            },
            NonNumericCondition { condition } => Data {
                severity: Error,
                rule: "the condition of $If must evaluate to a number".into(),
                problem: format!["the condition '{condition}' does not evaluate to a number"],
                action: "the rest of this fragment will not be preprocessed".into(),
            },
            EndIfMissing => Data {
                severity: Error,
                rule: "every $If must be closed by a $EndIf".into(),
                problem: "$EndIf missing at the end of the file".into(),
                action: "everything after the false condition was skipped".into(),
            },
            ElseWithoutIf => Data {
                severity: Error,
                rule: "$Else can only appear inside a $If block".into(),
                problem: "$Else without matching $If".into(),
                action: "the directive will be ignored".into(),
            },
            DuplicateElse => Data {
                severity: Error,
                rule: "a $If block can contain at most one $Else".into(),
                problem: "duplicate $Else".into(),
                action: "the second $Else will be ignored".into(),
            },
            EndIfWithoutIf => Data {
                severity: Error,
                rule: "$EndIf can only close a $If block".into(),
                problem: "$EndIf without matching $If".into(),
                action: "the directive will be ignored".into(),
            },
            IncludeWithoutFile => Data {
                severity: Error,
                rule: "$Include expects at least one file name".into(),
                problem: "$Include without a file".into(),
                action: "the directive will be removed".into(),
            },
            IncludeFileNotFound { file } => Data {
                severity: Error,
                rule: "included files are resolved relative to the including file".into(),
                problem: format!["the file {file} could not be found"],
                action: "the directive will be removed".into(),
            },
            InvalidIncludeOffset { offset } => Data {
                severity: Error,
                rule: "the track position offset after the colon must be a number".into(),
                problem: format!["invalid track position offset '{offset}'"],
                action: "the directive will be removed".into(),
            },
            InvalidIncludeWeight { weight } => Data {
                severity: Error,
                rule: "$Include weights must be positive numbers".into(),
                problem: format!["invalid weight '{weight}'"],
                action: "the directive will be removed".into(),
            },
            InvalidCharacterCode { directive, argument } => Data {
                severity: Error,
                rule: match directive.as_str() {
                    "$chr" => "$Chr takes a character code in the range [1,127]",
                    "$chrascii" => "$ChrAscii takes a character code in the range [0,127]",
                    _ => "$ChrUni takes a Unicode scalar value",
                }
                .into(),
                problem: format!["'{argument}' is not a valid character code for {directive}"],
                action: "the rest of this fragment will not be preprocessed".into(),
            },
            InvalidRandomRange { arguments } => Data {
                severity: Error,
                rule: "$Rnd expects two integers separated by a semicolon".into(),
                problem: format!["invalid $Rnd arguments '{arguments}'"],
                action: "the rest of this fragment will not be preprocessed".into(),
            },
            InvalidSubstitutionIndex { argument } => Data {
                severity: Error,
                rule: "$Sub indices must be non-negative integers".into(),
                problem: format!["invalid $Sub index '{argument}'"],
                action: "the rest of this fragment will not be preprocessed".into(),
            },
            UndefinedSubstitution { index } => Data {
                severity: Error,
                rule: "$Sub(n) can only be read after $Sub(n) = value".into(),
                problem: format!["$Sub({index}) has not been assigned"],
                action: "an empty string will be used instead".into(),
            },
            NegativeTrackPosition { text } => Data {
                severity: Error,
                rule: "track positions must be non-negative".into(),
                problem: format!["negative track position {text}"],
                action: "the current track position will not change".into(),
            },
            InvalidOpeningParenthesis => Data {
                severity: Error,
                rule: "command names can only contain one pair of parentheses holding the indices".into(),
                problem: "invalid opening parenthesis".into(),
                action: "".into(),
            },
            MissingClosingParenthesis => Data {
                severity: Error,
                rule: "all opening parentheses must be closed".into(),
                problem: "missing closing parenthesis".into(),
                action: "a closing parenthesis will be added".into(),
            },
            InvalidClosingParenthesis => Data {
                severity: Error,
                rule: "all closing parentheses must be balanced by a preceding opening parenthesis".into(),
                problem: "invalid closing parenthesis".into(),
                action: "".into(),
            },
            InvalidCommandSyntax => Data {
                severity: Error,
                rule: "commands have the form Name(indices) arguments".into(),
                problem: "invalid syntax".into(),
                action: "the command will be ignored".into(),
            },
            TrailingSemicolon => Data {
                severity: Error,
                rule: "command names cannot end with a semicolon".into(),
                problem: "invalid trailing semicolon".into(),
                action: "the semicolon will be removed".into(),
            },
            InvalidIndex { command, index } => Data {
                severity: Error,
                rule: "indices are one or two integers separated by a semicolon".into(),
                problem: format!["invalid index '{index}' in {command}"],
                action: "the command will be ignored".into(),
            },
            UnsupportedCommand { command } => Data {
                severity: Warning,
                rule: "".into(),
                problem: format!["the command {command} is not supported"],
                action: "the command will be ignored".into(),
            },
            TrackPositionWithArguments => Data {
                severity: Error,
                rule: "a track position must not be followed by any arguments".into(),
                problem: "arguments after a track position".into(),
                action: "the track position will be ignored".into(),
            },
            MissingArguments { command, expected } => Data {
                severity: Error,
                rule: format!["{command} expects at least {expected} argument{}", if expected == 1 { "" } else { "s" }],
                problem: format!["too few arguments for {command}"],
                action: "the command will be ignored".into(),
            },
            InvalidArgument { command, argument, fallback } => Data {
                severity: Error,
                rule: "".into(),
                problem: format!["{argument} is invalid in {command}"],
                action: fallback.action(),
            },
            ArgumentOutOfRange { command, argument, rule, fallback } => Data {
                severity: Error,
                rule: rule.into(),
                problem: format!["{argument} is out of range in {command}"],
                action: fallback.action(),
            },
            UndefinedReference { command, what, index } => Data {
                severity: Error,
                rule: format!["a {what} must be defined before it is used"],
                problem: format!["{command} references {what} {index} which has not been defined"],
                action: "the reference will be ignored".into(),
            },
            Redefinition { command, what, index } => Data {
                severity: Warning,
                rule: "".into(),
                problem: format!["{command} redefines {what} {index}"],
                action: "the previous definition will be replaced".into(),
            },
            FileNotFound { command, file } => Data {
                severity: Error,
                rule: "files are resolved relative to the object, sound or train folder".into(),
                problem: format!["the file {file} referenced in {command} could not be found"],
                action: "nothing will be loaded".into(),
            },
            FileNotLoaded { file, reason } => Data {
                severity: Error,
                rule: "".into(),
                problem: format!["the file {file} could not be loaded: {reason}"],
                action: "nothing will be loaded".into(),
            },
            StationWithoutStops { station } => Data {
                severity: Warning,
                rule: "stations where trains stop need at least one stop point".into(),
                problem: format!["station {station} has no stop point"],
                action: "all trains will pass the station".into(),
            },
            ChangeEndsWithoutNextStop { station } => Data {
                severity: Warning,
                rule: "a train can only change ends if a later station stops all trains".into(),
                problem: format!["station {station} changes ends but no later station stops all trains"],
                action: "the station will become a terminal station".into(),
            },
            ChangeEndsBeforePassStation { station, next } => Data {
                severity: Warning,
                rule: "the station after a change of ends must stop all trains".into(),
                problem: format!["station {station} changes ends but the next station {next} does not stop all trains"],
                action: format!["station {next} will stop all trains"],
            },
            RailNotStarted { command, rail } => Data {
                severity: Warning,
                rule: "".into(),
                problem: format!["{command} refers to rail {rail} which has not been started"],
                action: "".into(),
            },
            RailAlreadyStarted { command, rail } => Data {
                severity: Error,
                rule: "a rail must be ended with Track.RailEnd before it is started again".into(),
                problem: format!["{command} starts rail {rail} which is already running"],
                action: "the rail will be moved instead".into(),
            },
            StopWithoutStation { command } => Data {
                severity: Error,
                rule: "stop points belong to the most recently defined station".into(),
                problem: format!["{command} appears before any station"],
                action: "the command will be ignored".into(),
            },
            NonAscendingPreTrainTime => Data {
                severity: Error,
                rule: "pretrain times must be in ascending order".into(),
                problem: "the pretrain time is not later than the previous one".into(),
                action: "".into(),
            },
            CompatibilitySignalUsed { command, index } => Data {
                severity: Warning,
                rule: "".into(),
                problem: format!["{command} uses signal {index} which has not been defined"],
                action: "a built-in signal will be used instead".into(),
            },
        }
    }
}

impl Diagnostic {
    /// Creates a diagnostic whose severity and criticality follow from its kind.
    pub fn new(kind: DiagnosticKind, location: Option<Location>) -> Diagnostic {
        let severity = kind.data().severity;
        Diagnostic {
            location,
            severity,
            critical: kind.critical(),
            kind,
        }
    }

    /// A one line description of the problem.
    pub fn problem(&self) -> String {
        self.kind.data().problem
    }

    /// What the compiler does about the problem.
    pub fn action(&self) -> String {
        self.kind.data().action
    }

    /// The rule of the route language that was broken, if there is a succinct one.
    pub fn rule(&self) -> Option<String> {
        let rule = self.kind.data().rule;
        if rule.is_empty() {
            None
        } else {
            Some(rule)
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.kind.data();
        write!(f, "{}", data.problem)?;
        if let Some(location) = &self.location {
            write!(
                f,
                " at line {}, column {} in {}",
                location.line,
                location.column,
                location.file.display()
            )?;
        }
        if !data.action.is_empty() {
            write!(f, "; {}", data.action)?;
        }
        Ok(())
    }
}

/// A consumer of diagnostics.
pub trait EmitDiagnostic {
    fn emit(&mut self, diagnostic: Diagnostic);

    fn report(&mut self, kind: DiagnosticKind, location: Option<&Location>) {
        self.emit(Diagnostic::new(kind, location.cloned()));
    }
}

impl EmitDiagnostic for Vec<Diagnostic> {
    fn emit(&mut self, diagnostic: Diagnostic) {
        self.push(diagnostic);
    }
}

/// Sink that drops every diagnostic.
///
/// Used for repeated passes over the same fragments so that syntax problems are only reported once.
pub struct Discard;

impl EmitDiagnostic for Discard {
    fn emit(&mut self, _: Diagnostic) {}
}

impl Diagnostic {
    /// Builds an ariadne report for this diagnostic.
    ///
    /// Diagnostics without a location have no source to point at and return [None].
    #[cfg(feature = "ariadne")]
    pub fn ariadne_report(&self) -> Option<ariadne::Report> {
        use ariadne::*;
        let light_blue = Color::Fixed(81);

        let location = self.location.as_ref()?;
        let data = self.kind.data();
        let kind = match self.severity {
            Severity::Info => ReportKind::Advice,
            Severity::Warning => ReportKind::Warning,
            Severity::Error => ReportKind::Error,
        };
        let mut builder = Report::build(kind, (), location.span.start)
            .with_message(&data.problem)
            .with_label(
                Label::new(location.span.clone())
                    .with_message(&data.problem)
                    .with_color(light_blue),
            );
        if !data.action.is_empty() {
            builder = builder.with_note(data.action);
        }
        if !data.rule.is_empty() {
            builder = builder.with_help(data.rule);
        }
        Some(builder.finish())
    }
}

/// A route source file in the form ariadne needs to print reports.
#[cfg(feature = "ariadne")]
pub struct AriadneSource {
    source: ariadne::Source,
    path: std::path::PathBuf,
}

#[cfg(feature = "ariadne")]
impl AriadneSource {
    pub fn new(path: &Path, source: &str) -> Self {
        Self {
            source: source.into(),
            path: path.into(),
        }
    }
}

#[cfg(feature = "ariadne")]
impl ariadne::Cache<()> for &AriadneSource {
    fn fetch(&mut self, _: &()) -> Result<&ariadne::Source, Box<dyn std::fmt::Debug + '_>> {
        Ok(&self.source)
    }

    fn display<'a>(&self, _: &'a ()) -> Option<Box<dyn std::fmt::Display + 'a>> {
        Some(Box::new(format!["{}", self.path.display()]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_follows_kind() {
        let d = Diagnostic::new(DiagnosticKind::UnsupportedCommand { command: "track.foo".into() }, None);
        assert_eq!(d.severity, Severity::Warning);
        assert!(!d.critical);
        let d = Diagnostic::new(
            DiagnosticKind::FileNotFound {
                command: "structure.rail".into(),
                file: "rail.csv".into(),
            },
            None,
        );
        assert_eq!(d.severity, Severity::Error);
        assert!(d.critical);
    }

    #[test]
    fn display_includes_location_and_action() {
        let location = Location {
            file: Rc::from(Path::new("route.csv")),
            line: 3,
            column: 2,
            span: 10..20,
        };
        let d = Diagnostic::new(
            DiagnosticKind::InvalidArgument {
                command: "track.pitch".into(),
                argument: "Rate",
                fallback: Fallback::value(0),
            },
            Some(location),
        );
        assert_eq!(
            d.to_string(),
            "Rate is invalid in track.pitch at line 3, column 2 in route.csv; 0 will be used instead"
        );
    }

    #[test]
    fn vec_sink_collects() {
        let mut sink: Vec<Diagnostic> = vec![];
        sink.report(DiagnosticKind::EndIfMissing, None);
        assert_eq!(sink.len(), 1);
        assert_eq!(sink[0].kind, DiagnosticKind::EndIfMissing);
    }
}
