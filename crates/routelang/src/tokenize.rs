//! The command tokenizer
//!
//! Each expression is turned into a [Token].
//! Most expressions are commands of the form
//!
//! ```txt
//! Namespace.Name(index1;index2) argument1;argument2;...
//! ```
//!
//! The namespace may come from a preceding `[Section]` header or `With` command,
//!     and RW files may use the form `Name = arguments`.
//! Historical spellings of commands are rewritten to their canonical form before
//!     the indices are extracted.

use crate::diagnostics::{DiagnosticKind, EmitDiagnostic, Location};
use crate::numbers;
use crate::sort::section_name;
use crate::{Dialect, Expression};

/// A tokenized command.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Command {
    /// Lowercase namespace, e.g. `track`, or empty for signal definitions.
    pub namespace: String,
    /// Lowercase name within the namespace, e.g. `curve` or `background.x`.
    pub name: String,
    pub index1: Option<i32>,
    pub index2: Option<i32>,
    pub arguments: Vec<String>,
}

impl Command {
    /// The first index, or 0 if none was given.
    pub fn first_index(&self) -> i32 {
        self.index1.unwrap_or(0)
    }

    /// The second index, or 0 if none was given.
    pub fn second_index(&self) -> i32 {
        self.index2.unwrap_or(0)
    }

    /// The command name including its namespace, as used in diagnostics.
    pub fn qualified_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!["{}.{}", self.namespace, self.name]
        }
    }

    /// Returns the argument at the given index, if it exists and is not empty.
    pub fn argument(&self, i: usize) -> Option<&str> {
        self.arguments.get(i).map(String::as_str).filter(|a| !a.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// A `[Name]` section header.
    Section(String),
    /// A bare track position, in meters.
    TrackPosition { position: f64, has_arguments: bool },
    Command(Command),
    /// An expression with no effect of its own, like `With`, or a command dropped because
    ///     of an invalid index.
    Nothing,
}

/// Tokenizer for the expressions of one route file.
///
/// The tokenizer is stateful: section headers and `With` commands change the namespace
///     of subsequent commands.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    dialect: Dialect,
    section: String,
    section_always_prefix: bool,
}

impl Tokenizer {
    pub fn new(dialect: Dialect) -> Tokenizer {
        Tokenizer {
            dialect,
            section: String::new(),
            section_always_prefix: false,
        }
    }

    pub fn tokenize(
        &mut self,
        expression: &Expression,
        unit_factors: &[f64],
        diagnostics: &mut dyn EmitDiagnostic,
    ) -> Token {
        let location = expression.location.as_ref();
        if let Some(name) = section_name(&expression.text) {
            self.section = if name.eq_ignore_ascii_case("object") {
                "Structure".to_string()
            } else if name.eq_ignore_ascii_case("railway") {
                "Track".to_string()
            } else {
                name.to_string()
            };
            self.section_always_prefix = true;
            return Token::Section(self.section.clone());
        }
        let text = match self.dialect {
            Dialect::Csv => expression.text.clone(),
            Dialect::Rw => self.convert_equals_form(&expression.text),
        };
        let (command, argument_sequence) = separate(&text, location, diagnostics);
        let arguments = split_arguments(&argument_sequence);
        let number_check = self.dialect == Dialect::Csv || self.section.eq_ignore_ascii_case("track");
        if number_check {
            if let Some(x) = numbers::parse_length(&command, unit_factors) {
                return Token::TrackPosition {
                    position: x + expression.track_position_offset,
                    has_arguments: !arguments.is_empty(),
                };
            }
        }
        if command.eq_ignore_ascii_case("with") {
            self.section = arguments.first().cloned().unwrap_or_default();
            self.section_always_prefix = false;
            return Token::Nothing;
        }
        let command = if command.starts_with('.') {
            format!["{}{}", self.section, command]
        } else if self.section_always_prefix {
            format!["{}.{}", self.section, command]
        } else {
            command
        };
        let command = rewrite_legacy_spelling(&command.replace(".Void", ""));
        let Some((command, index1, index2)) = extract_indices(&command, location, diagnostics) else {
            return Token::Nothing;
        };
        if command.is_empty() {
            return Token::Nothing;
        }
        let (namespace, name) = match command.find('.') {
            None => (String::new(), command.to_lowercase()),
            Some(period) => (
                command[..period].to_lowercase(),
                command[period + 1..].to_lowercase(),
            ),
        };
        Token::Command(Command {
            namespace,
            name,
            index1,
            index2,
            arguments,
        })
    }

    /// Rewrites `key = value` to `key value`.
    ///
    /// In the `[Cycle]` and `[Signal]` sections a numeric key is the index of a ground cycle
    ///     or signal definition.
    fn convert_equals_form(&self, text: &str) -> String {
        let Some(equals) = text.find('=') else {
            return text.to_string();
        };
        let mut key = text[..equals].to_string();
        if self.section_always_prefix {
            let numeric = numbers::parse_f64_lenient(&key);
            if self.section.eq_ignore_ascii_case("cycle") {
                if let Some(b) = numeric {
                    key = format![".Ground({b})"];
                }
            } else if self.section.eq_ignore_ascii_case("signal") {
                if let Some(b) = numeric {
                    key = format![".Void({b})"];
                }
            }
        }
        format!["{} {}", key, &text[equals + 1..]]
    }
}

/// Splits an argument sequence on semicolons and on commas outside parentheses.
///
/// A trailing empty argument is dropped.
fn split_arguments(sequence: &str) -> Vec<String> {
    let mut arguments = vec![];
    let mut depth = 0;
    let mut start = 0;
    for (k, c) in sequence.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ';' => {
                arguments.push(sequence[start..k].trim().to_string());
                start = k + 1;
            }
            ',' if depth == 0 => {
                arguments.push(sequence[start..k].trim().to_string());
                start = k + 1;
            }
            _ => {}
        }
    }
    if start < sequence.len() {
        arguments.push(sequence[start..].trim().to_string());
    }
    arguments
}

/// Historical spellings of commands.
///
/// A command that starts with the prefix and ends with the suffix (ignoring case)
///     loses the suffix, and the prefix is replaced if a replacement is given.
/// The first matching rule is applied.
const LEGACY_SPELLINGS: &[(&str, &str, Option<&str>)] = &[
    ("structure", ".load", None),
    ("texture.background", ".load", None),
    ("texture.background", ".x", Some("texture.background.x")),
    ("texture.background", ".aspect", Some("texture.background.aspect")),
    ("structure.back", ".x", Some("texture.background.x")),
    ("structure.back", ".aspect", Some("texture.background.aspect")),
    ("cycle", ".params", None),
    ("signal", ".load", None),
    ("train.run", ".set", None),
    ("train.flange", ".set", None),
    ("train.timetable", ".day.load", Some("train.timetable.day")),
    ("train.timetable", ".night.load", Some("train.timetable.night")),
    ("train.timetable", ".day", Some("train.timetable.day")),
    ("train.timetable", ".night", Some("train.timetable.night")),
    ("route.signal", ".set", None),
    ("route.runinterval", "", Some("train.interval")),
    ("train.gauge", "", Some("route.gauge")),
    ("texture.", "", Some("structure.")),
];

fn rewrite_legacy_spelling(command: &str) -> String {
    for (prefix, suffix, replacement) in LEGACY_SPELLINGS {
        if command.len() < prefix.len() + suffix.len() {
            continue;
        }
        let suffix_start = command.len() - suffix.len();
        let (Some(p), Some(s)) = (command.get(..prefix.len()), command.get(suffix_start..)) else {
            continue;
        };
        if !p.eq_ignore_ascii_case(prefix) || !s.eq_ignore_ascii_case(suffix) {
            continue;
        }
        let Some(middle) = command.get(prefix.len()..suffix_start) else {
            continue;
        };
        return format!["{}{}", replacement.unwrap_or(p), middle].trim().to_string();
    }
    command.to_string()
}

/// Removes a trailing `(i)` or `(i;j)` from a command name.
///
/// Returns [None] if an index is present but not an integer.
fn extract_indices(
    command: &str,
    location: Option<&Location>,
    diagnostics: &mut dyn EmitDiagnostic,
) -> Option<(String, Option<i32>, Option<i32>)> {
    let Some(inner) = command.strip_suffix(')') else {
        return Some((command.to_string(), None, None));
    };
    let Some(k) = inner.rfind('(') else {
        return Some((command.to_string(), None, None));
    };
    let indices = inner[k + 1..].trim_start();
    let name = inner[..k].trim_end().to_string();
    let mut parse = |s: &str| -> Result<Option<i32>, ()> {
        if s.is_empty() {
            return Ok(None);
        }
        match numbers::parse_i32_lenient(s) {
            Some(i) => Ok(Some(i)),
            None => {
                diagnostics.report(
                    DiagnosticKind::InvalidIndex {
                        command: name.clone(),
                        index: s.to_string(),
                    },
                    location,
                );
                Err(())
            }
        }
    };
    let (index1, index2) = match indices.split_once(';') {
        None => (parse(indices), Ok(None)),
        Some((a, b)) => (parse(a.trim_end()), parse(b.trim_start())),
    };
    match (index1, index2) {
        (Ok(index1), Ok(index2)) => Some((name, index1, index2)),
        _ => None,
    }
}

/// Separates the command name from its argument sequence.
///
/// Some RW files put parentheses inside station names and file names;
///     these are temporarily replaced so they are not mistaken for index parentheses.
fn separate(text: &str, location: Option<&Location>, diagnostics: &mut dyn EmitDiagnostic) -> (String, String) {
    let lower = text.to_lowercase();
    let is_station = lower.starts_with("sta");
    let is_marker = lower.starts_with("marker") || lower.starts_with("announce");
    let loads_file = lower.contains(".load");
    let mut t: Vec<char> = text.chars().collect();
    let mut opening_error = false;
    let mut closing_error = false;
    let mut report_closing = |kind: DiagnosticKind, closing_error: &mut bool| {
        if !*closing_error {
            diagnostics.report(kind, location);
            *closing_error = true;
        }
    };
    let mut first_closing = 0;
    let mut i = 0;
    while i < t.len() {
        if t[i] == '(' {
            let mut found = false;
            let mut argument_index = 0;
            i += 1;
            while i < t.len() {
                let c = t[i];
                if c == ',' || c == ';' {
                    argument_index += 1;
                }
                if c == '(' {
                    if !opening_error {
                        match argument_index {
                            0 if is_station => t[i] = '[',
                            0 if is_marker || loads_file => t[i] = '<',
                            5 | 10 if is_station => t[i] = '<',
                            _ => {
                                report_closing(DiagnosticKind::InvalidOpeningParenthesis, &mut opening_error);
                            }
                        }
                    }
                } else if c == ')' {
                    let replacement = match argument_index {
                        0 if is_station => Some(']'),
                        0 if is_marker || (loads_file && t.contains(&'<') && i > 18 && i != t.len() - 1) => Some('>'),
                        5 | 10 if is_station => Some('>'),
                        _ => None,
                    };
                    if let Some(r) = replacement {
                        t[i] = r;
                        i += 1;
                        continue;
                    }
                    found = true;
                    first_closing = i;
                    break;
                }
                i += 1;
            }
            if !found {
                report_closing(DiagnosticKind::MissingClosingParenthesis, &mut closing_error);
                t.push(')');
                i = t.len() - 1;
            }
        } else if t[i] == ')' {
            report_closing(DiagnosticKind::InvalidClosingParenthesis, &mut closing_error);
        } else if t[i].is_whitespace() && (i + 1 >= t.len() || !t[i + 1].is_whitespace()) {
            break;
        }
        i += 1;
    }
    if first_closing != 0 && first_closing + 1 < t.len() {
        let next = t[first_closing + 1];
        if !next.is_whitespace() && next != '.' && next != ';' {
            t.insert(first_closing + 1, ' ');
            i = first_closing + 1;
        }
    }
    let sub = |a: usize, b: usize| -> String { t[a.min(t.len())..b.min(t.len())].iter().collect() };
    let len = t.len();
    let (command, arguments) = if i < len {
        let head = sub(0, i);
        if head.contains('(') && head.contains(')') {
            let arguments = sub(i + 1, len);
            (head.trim_end().to_string(), arguments.trim_start().to_string())
        } else if i + 1 < len && t[i + 1] == '(' {
            match t[i + 1..].iter().position(|c| *c == ')').map(|p| p + i + 1) {
                Some(j) if j == len - 1 => (head.trim_end().to_string(), sub(i + 2, j).trim().to_string()),
                Some(j) => {
                    let border = (j + 1..len).find(|k| t[*k].is_whitespace() || t[*k] == '(');
                    match border {
                        Some(k) if t[k] == '(' => (sub(0, k).trim_end().to_string(), sub(k, len).trim_start().to_string()),
                        Some(k) => (sub(0, k).trim_end().to_string(), sub(k + 1, len).trim_start().to_string()),
                        None => {
                            if !opening_error && !closing_error {
                                diagnostics.report(DiagnosticKind::InvalidCommandSyntax, location);
                                closing_error = true;
                            }
                            (sub(0, len), String::new())
                        }
                    }
                }
                None => {
                    if !closing_error {
                        diagnostics.report(DiagnosticKind::MissingClosingParenthesis, location);
                    }
                    (head.trim_end().to_string(), sub(i + 2, len).trim_start().to_string())
                }
            }
        } else {
            (head.trim_end().to_string(), sub(i + 1, len).trim_start().to_string())
        }
    } else {
        let whole = sub(0, len);
        if whole.ends_with(')') {
            match t.iter().rposition(|c| *c == '(') {
                Some(p) => {
                    let mut arguments = sub(p + 1, len - 1).trim().to_string();
                    if is_station || is_marker || loads_file {
                        arguments = arguments.replace('<', "(").replace('>', ")");
                        arguments = arguments.trim_end_matches(')').to_string();
                    }
                    (sub(0, p).trim_end().to_string(), arguments)
                }
                None => (whole, String::new()),
            }
        } else if let Some(p) = t.iter().position(|c| *c == '(') {
            if !closing_error {
                diagnostics.report(DiagnosticKind::MissingClosingParenthesis, location);
            }
            (sub(0, p).trim_end().to_string(), sub(p + 1, len).trim_start().to_string())
        } else {
            if whole.contains(')') && !closing_error {
                diagnostics.report(DiagnosticKind::InvalidClosingParenthesis, location);
            }
            (whole, String::new())
        }
    };
    let arguments = strip_enclosing_parentheses(arguments, closing_error, location, diagnostics);
    let mut command = command;
    if command.ends_with(';') {
        diagnostics.report(DiagnosticKind::TrailingSemicolon, location);
        command = command.trim_end_matches(';').to_string();
    }
    (command, arguments)
}

/// Handles argument sequences written as `(a;b;c)`.
fn strip_enclosing_parentheses(
    arguments: String,
    closing_error: bool,
    location: Option<&Location>,
    diagnostics: &mut dyn EmitDiagnostic,
) -> String {
    if arguments.len() >= 2 && arguments.starts_with('(') && arguments.ends_with(')') {
        arguments[1..arguments.len() - 1].trim().to_string()
    } else if let Some(rest) = arguments.strip_prefix('(') {
        if !closing_error {
            diagnostics.report(DiagnosticKind::MissingClosingParenthesis, location);
        }
        rest.trim_start().to_string()
    } else {
        arguments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Diagnostic;
    use std::path::Path;
    use std::rc::Rc;

    fn expression(text: &str) -> Expression {
        Expression::new(
            text,
            Location {
                file: Rc::from(Path::new("route.csv")),
                line: 1,
                column: 1,
                span: 0..text.chars().count(),
            },
            0.0,
        )
    }

    fn run(dialect: Dialect, inputs: &[&str]) -> (Vec<Token>, Vec<DiagnosticKind>) {
        let mut tokenizer = Tokenizer::new(dialect);
        let mut diagnostics: Vec<Diagnostic> = vec![];
        let tokens = inputs
            .iter()
            .map(|i| tokenizer.tokenize(&expression(i), &[1.0], &mut diagnostics))
            .collect();
        (tokens, diagnostics.into_iter().map(|d| d.kind).collect())
    }

    fn command(namespace: &str, name: &str, index1: Option<i32>, index2: Option<i32>, arguments: &[&str]) -> Token {
        Token::Command(Command {
            namespace: namespace.into(),
            name: name.into(),
            index1,
            index2,
            arguments: arguments.iter().map(|a| a.to_string()).collect(),
        })
    }

    macro_rules! tokenize_tests {
        ( $( ($name: ident, $dialect: expr, $input: expr, $want: expr, $want_errors: expr), )+ ) => {
            $(
                #[test]
                fn $name() {
                    let (got, errors) = run($dialect, &$input);
                    let want: Vec<Token> = $want;
                    assert_eq!(got, want);
                    let want_errors: Vec<DiagnosticKind> = $want_errors;
                    assert_eq!(errors, want_errors);
                }
            )+
        };
    }

    tokenize_tests!(
        (
            two_indices,
            Dialect::Csv,
            ["Command(3;7) a;b;c"],
            vec![command("", "command", Some(3), Some(7), &["a", "b", "c"])],
            vec![]
        ),
        (
            no_indices,
            Dialect::Csv,
            ["Command a;b;c"],
            vec![command("", "command", None, None, &["a", "b", "c"])],
            vec![]
        ),
        (
            namespaced,
            Dialect::Csv,
            ["Track.Curve 300;0"],
            vec![command("track", "curve", None, None, &["300", "0"])],
            vec![]
        ),
        (
            track_position,
            Dialect::Csv,
            ["125.5"],
            vec![Token::TrackPosition { position: 125.5, has_arguments: false }],
            vec![]
        ),
        (
            track_position_with_arguments,
            Dialect::Csv,
            ["100 5"],
            vec![Token::TrackPosition { position: 100.0, has_arguments: true }],
            vec![]
        ),
        (
            with_namespace,
            Dialect::Csv,
            ["With Track", ".Pitch 5", "Route.Gauge 1067"],
            vec![
                Token::Nothing,
                command("track", "pitch", None, None, &["5"]),
                command("route", "gauge", None, None, &["1067"]),
            ],
            vec![]
        ),
        (
            trailing_empty_argument_dropped,
            Dialect::Csv,
            ["Track.Fog 0;100;"],
            vec![command("track", "fog", None, None, &["0", "100"])],
            vec![]
        ),
        (
            empty_middle_argument_kept,
            Dialect::Csv,
            ["Track.Sta A;;10.30"],
            vec![command("track", "sta", None, None, &["A", "", "10.30"])],
            vec![]
        ),
        (
            legacy_structure_load,
            Dialect::Csv,
            ["Structure.Rail(0).Load rail.csv"],
            vec![command("structure", "rail", Some(0), None, &["rail.csv"])],
            vec![]
        ),
        (
            legacy_background_x,
            Dialect::Csv,
            ["Texture.Background(1).X 3"],
            vec![command("texture", "background.x", Some(1), None, &["3"])],
            vec![]
        ),
        (
            legacy_back_aspect,
            Dialect::Csv,
            ["Structure.Back(2).Aspect 1"],
            vec![command("texture", "background.aspect", Some(2), None, &["1"])],
            vec![]
        ),
        (
            legacy_train_run_set,
            Dialect::Csv,
            ["Train.Run(2).Set 1"],
            vec![command("train", "run", Some(2), None, &["1"])],
            vec![]
        ),
        (
            legacy_timetable,
            Dialect::Csv,
            ["Train.Timetable(0).Day.Load tt.png"],
            vec![command("train", "timetable.day", Some(0), None, &["tt.png"])],
            vec![]
        ),
        (
            legacy_run_interval,
            Dialect::Csv,
            ["Route.RunInterval 120"],
            vec![command("train", "interval", None, None, &["120"])],
            vec![]
        ),
        (
            legacy_signal_load,
            Dialect::Csv,
            ["Signal(3).Load signals\\red"],
            vec![command("", "signal", Some(3), None, &["signals\\red"])],
            vec![]
        ),
        (
            invalid_index,
            Dialect::Csv,
            ["Structure.Rail(x) a"],
            vec![Token::Nothing],
            vec![DiagnosticKind::InvalidIndex { command: "Structure.Rail".into(), index: "x".into() }]
        ),
        (
            empty_index_part,
            Dialect::Csv,
            ["Structure.Pole(;2) a"],
            vec![command("structure", "pole", None, Some(2), &["a"])],
            vec![]
        ),
        (
            arguments_in_parentheses,
            Dialect::Csv,
            ["Track.Pitch (5)"],
            vec![command("track", "pitch", None, None, &["5"])],
            vec![]
        ),
        (
            arguments_without_space,
            Dialect::Csv,
            ["Track.Rail(1)2;3"],
            vec![command("track", "rail", Some(1), None, &["2", "3"])],
            vec![]
        ),
        (
            call_form,
            Dialect::Csv,
            ["Track.Pitch(5)"],
            vec![command("track", "pitch", None, None, &["5"])],
            vec![]
        ),
        (
            trailing_semicolon,
            Dialect::Csv,
            ["Track.Pitch; 5"],
            vec![command("track", "pitch", None, None, &["5"])],
            vec![DiagnosticKind::TrailingSemicolon]
        ),
        (
            missing_closing_parenthesis,
            Dialect::Csv,
            ["Structure.Rail(0 rail.csv"],
            vec![command("structure", "rail", None, None, &["0 rail.csv"])],
            vec![DiagnosticKind::MissingClosingParenthesis]
        ),
        (
            rw_sections,
            Dialect::Rw,
            ["[Railway]", "100", "Curve(300,0)", "Pitch 5", "[Object]", "Rail(0) = rail.csv"],
            vec![
                Token::Section("Track".into()),
                Token::TrackPosition { position: 100.0, has_arguments: false },
                command("track", "curve", None, None, &["300", "0"]),
                command("track", "pitch", None, None, &["5"]),
                Token::Section("Structure".into()),
                command("structure", "rail", Some(0), None, &["rail.csv"]),
            ],
            vec![]
        ),
        (
            rw_numbers_outside_railway_are_commands,
            Dialect::Rw,
            ["[Options]", "100"],
            vec![Token::Section("Options".into()), command("options", "100", None, None, &[])],
            vec![]
        ),
        (
            rw_cycle,
            Dialect::Rw,
            ["[Cycle]", "0 = 1, 2, 3"],
            vec![
                Token::Section("Cycle".into()),
                command("cycle", "ground", Some(0), None, &["1", "2", "3"]),
            ],
            vec![]
        ),
        (
            rw_signal,
            Dialect::Rw,
            ["[Signal]", "3 = signals\\home"],
            vec![
                Token::Section("Signal".into()),
                command("", "signal", Some(3), None, &["signals\\home"]),
            ],
            vec![]
        ),
        (
            rw_station_with_parentheses,
            Dialect::Rw,
            ["[Railway]", "Sta(Central (East);10.00)"],
            vec![
                Token::Section("Track".into()),
                command("track", "sta", None, None, &["Central [East]", "10.00"]),
            ],
            vec![]
        ),
        (
            rw_fog_with_commas,
            Dialect::Rw,
            ["Track.Fog 0,200"],
            vec![command("track", "fog", None, None, &["0", "200"])],
            vec![]
        ),
    );

    #[test]
    fn accessors_default_to_zero() {
        let (tokens, _) = run(Dialect::Csv, &["Command a;b;c", "Command(3;7) a;b;c"]);
        let Token::Command(c) = &tokens[0] else { panic!() };
        assert_eq!((c.first_index(), c.second_index()), (0, 0));
        assert_eq!(c.qualified_name(), "command");
        let Token::Command(c) = &tokens[1] else { panic!() };
        assert_eq!((c.first_index(), c.second_index()), (3, 7));
        assert_eq!(c.argument(2), Some("c"));
        assert_eq!(c.argument(3), None);
    }

    #[test]
    fn track_position_units() {
        let mut tokenizer = Tokenizer::new(Dialect::Csv);
        let mut diagnostics: Vec<Diagnostic> = vec![];
        let got = tokenizer.tokenize(&expression("1:50"), &[1000.0, 1.0], &mut diagnostics);
        assert_eq!(got, Token::TrackPosition { position: 1050.0, has_arguments: false });
    }
}
