//! The macro preprocessor
//!
//! The preprocessor splits a route file into [Expression]s
//!     and then expands the `$` directives in them.
//! Directives are expanded right to left within each expression,
//!     so `$Chr($Rnd(65;70))` first draws the random number and then converts it.
//!
//! | Directive | Effect |
//! |---|---|
//! | `$If(x)`, `$Else()`, `$EndIf()` | conditional blocks; a zero condition skips to the `$Else` |
//! | `$Include(file[:offset][;weight]...)` | splices in one of the files, chosen at random by weight |
//! | `$Chr(n)`, `$ChrAscii(n)`, `$ChrUni(n)` | the character with code `n` |
//! | `$Rnd(a;b)` | a random integer in `[a,b]` |
//! | `$Sub(n) = value`, `$Sub(n)` | stores and reads a substitution slot |
//!
//! The conditional directives may also be written without parentheses, e.g. `$If 0`.

use crate::diagnostics::{DiagnosticKind, EmitDiagnostic, Location};
use crate::numbers;
use crate::source::{self, SourceLoader};
use crate::{Dialect, Expression};
use rand::rngs::StdRng;
use rand::Rng;
use std::path::Path;
use std::rc::Rc;

/// Output of the preprocessor.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Preprocessed {
    pub expressions: Vec<Expression>,
    /// Free text before the first section of an RW file.
    pub description: String,
}

/// The macro preprocessor.
pub struct Preprocessor<'a> {
    pub dialect: Dialect,
    pub loader: &'a dyn SourceLoader,
    pub rng: &'a mut StdRng,
    pub diagnostics: &'a mut dyn EmitDiagnostic,
}

impl<'a> Preprocessor<'a> {
    /// Preprocesses the root route file.
    pub fn run(&mut self, path: &Path, source: &str) -> Preprocessed {
        let file: Rc<Path> = Rc::from(path);
        let mut description = String::new();
        let expressions = split(
            &file,
            source,
            self.dialect,
            0.0,
            Some(&mut description),
            self.diagnostics,
        );
        log::debug!("split {} into {} expressions", path.display(), expressions.len());
        let expressions = self.expand(expressions);
        log::debug!("{} expressions after preprocessing", expressions.len());
        Preprocessed {
            expressions,
            description: description.trim().to_string(),
        }
    }

    fn expand(&mut self, mut expressions: Vec<Expression>) -> Vec<Expression> {
        let mut state = State::default();
        let mut i = 0;
        while i < expressions.len() {
            i = self.expand_expression(&mut expressions, i, &mut state);
        }
        expressions
            .into_iter()
            .filter_map(|mut e| {
                e.text = e.text.trim().to_string();
                if e.text.is_empty() || e.text.starts_with(';') {
                    None
                } else {
                    Some(e)
                }
            })
            .collect()
    }

    /// Expands the directives in the expression at index `i` and returns the index of the
    ///     next expression to process.
    fn expand_expression(&mut self, expressions: &mut Vec<Expression>, i: usize, state: &mut State) -> usize {
        let location = expressions[i].location.clone();
        let location = location.as_ref();
        let mut j = expressions[i].text.len();
        while j > 0 {
            j -= 1;
            let text = &expressions[i].text;
            if text.as_bytes()[j] != b'$' {
                continue;
            }
            let Some(directive) = Directive::parse(text, j) else {
                continue;
            };
            let Directive { name, argument, end } = match directive {
                Ok(directive) => directive,
                Err(name) => {
                    self.diagnostics.report(
                        DiagnosticKind::InvalidDirectiveParentheses { directive: name },
                        location,
                    );
                    return i + 1;
                }
            };
            let lower = name.to_lowercase();
            match lower.as_str() {
                "$if" => {
                    if j != 0 {
                        self.diagnostics
                            .report(DiagnosticKind::DirectiveNotAtStart { directive: name }, location);
                        return i + 1;
                    }
                    let Some(condition) = numbers::parse_f64(&argument) else {
                        self.diagnostics.report(
                            DiagnosticKind::NonNumericCondition { condition: argument },
                            location,
                        );
                        return i + 1;
                    };
                    state.open_ifs += 1;
                    expressions[i].text.clear();
                    if condition != 0.0 {
                        return i + 1;
                    }
                    return self.skip_branch(expressions, i + 1, state, true, location) + 1;
                }
                "$else" => {
                    expressions[i].text.clear();
                    if state.open_ifs == 0 {
                        self.diagnostics.report(DiagnosticKind::ElseWithoutIf, location);
                        return i + 1;
                    }
                    return self.skip_branch(expressions, i + 1, state, false, location) + 1;
                }
                "$endif" => {
                    expressions[i].text.clear();
                    if state.open_ifs == 0 {
                        self.diagnostics.report(DiagnosticKind::EndIfWithoutIf, location);
                    } else {
                        state.open_ifs -= 1;
                    }
                    return i + 1;
                }
                "$include" => {
                    if j != 0 {
                        self.diagnostics
                            .report(DiagnosticKind::DirectiveNotAtStart { directive: name }, location);
                        return i + 1;
                    }
                    match self.include(&expressions[i], &argument) {
                        None => {
                            expressions.remove(i);
                        }
                        Some(included) => {
                            expressions.splice(i..i + 1, included);
                        }
                    }
                    return i;
                }
                "$chr" | "$chrascii" | "$chruni" => {
                    let c = numbers::parse_i32_lenient(&argument).and_then(|x| {
                        let valid = match lower.as_str() {
                            "$chr" => (1..=127).contains(&x),
                            "$chrascii" => (0..=127).contains(&x),
                            _ => x >= 0,
                        };
                        if valid {
                            char::from_u32(x as u32)
                        } else {
                            None
                        }
                    });
                    let Some(c) = c else {
                        self.diagnostics.report(
                            DiagnosticKind::InvalidCharacterCode { directive: lower.clone(), argument },
                            location,
                        );
                        return i + 1;
                    };
                    expressions[i].text.replace_range(j..end, c.encode_utf8(&mut [0; 4]));
                }
                "$rnd" => {
                    let range = argument.split_once(';').and_then(|(a, b)| {
                        Some((numbers::parse_i32_lenient(a)?, numbers::parse_i32_lenient(b)?))
                    });
                    let Some((low, high)) = range else {
                        self.diagnostics.report(
                            DiagnosticKind::InvalidRandomRange { arguments: argument },
                            location,
                        );
                        return i + 1;
                    };
                    let span = high as f64 - low as f64 + 1.0;
                    let z = low as i64 + (self.rng.gen::<f64>() * span).floor() as i64;
                    expressions[i].text.replace_range(j..end, &z.to_string());
                }
                "$sub" => {
                    let text = &expressions[i].text;
                    let index = numbers::parse_i32_lenient(&argument)
                        .filter(|x| *x >= 0)
                        .map(|x| x as usize);
                    match assignment(text, end) {
                        Some((value, assignment_end)) => {
                            let Some(index) = index else {
                                self.diagnostics.report(
                                    DiagnosticKind::InvalidSubstitutionIndex { argument },
                                    location,
                                );
                                return i + 1;
                            };
                            if state.subs.len() <= index {
                                state.subs.resize(index + 1, None);
                            }
                            state.subs[index] = Some(value);
                            expressions[i].text.replace_range(j..assignment_end, "");
                        }
                        None => {
                            let value = match index {
                                None => {
                                    self.diagnostics.report(
                                        DiagnosticKind::InvalidSubstitutionIndex { argument },
                                        location,
                                    );
                                    None
                                }
                                Some(index) => {
                                    let value = state.subs.get(index).cloned().flatten();
                                    if value.is_none() {
                                        self.diagnostics
                                            .report(DiagnosticKind::UndefinedSubstitution { index }, location);
                                    }
                                    value
                                }
                            };
                            let failed = value.is_none();
                            expressions[i]
                                .text
                                .replace_range(j..end, &value.unwrap_or_default());
                            if failed {
                                return i + 1;
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        i + 1
    }

    /// Blanks expressions from index `i` until the end of the current conditional branch.
    ///
    /// When `stop_at_else` is true the branch also ends at a `$Else` of the same level.
    /// Returns the index of the expression that ended the branch.
    fn skip_branch(
        &mut self,
        expressions: &mut [Expression],
        mut i: usize,
        state: &mut State,
        stop_at_else: bool,
        location: Option<&Location>,
    ) -> usize {
        let mut level = 1;
        while i < expressions.len() {
            let directive = conditional_directive(&expressions[i].text);
            expressions[i].text.clear();
            match directive {
                Some(Conditional::If) => level += 1,
                Some(Conditional::Else) if level == 1 => {
                    if stop_at_else {
                        return i;
                    }
                    self.diagnostics.report(
                        DiagnosticKind::DuplicateElse,
                        expressions[i].location.as_ref(),
                    );
                }
                Some(Conditional::EndIf) => {
                    level -= 1;
                    if level == 0 {
                        state.open_ifs -= 1;
                        return i;
                    }
                }
                _ => {}
            }
            i += 1;
        }
        self.diagnostics.report(DiagnosticKind::EndIfMissing, location);
        i
    }

    /// Chooses and splits the included file.
    ///
    /// Returns [None] if the directive is invalid; in this case it should be removed.
    fn include(&mut self, expression: &Expression, argument: &str) -> Option<Vec<Expression>> {
        let location = expression.location.as_ref();
        let folder = expression
            .file()
            .and_then(|f| f.parent())
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let args: Vec<&str> = argument.split(';').map(str::trim).collect();
        let mut candidates: Vec<(std::path::PathBuf, f64, f64)> = vec![];
        for pair in args.chunks(2) {
            let (file, offset) = match pair[0].split_once(':') {
                None => (pair[0], 0.0),
                Some((file, offset)) => {
                    let offset = offset.trim_start();
                    let Some(offset) = numbers::parse_f64(offset) else {
                        self.diagnostics.report(
                            DiagnosticKind::InvalidIncludeOffset { offset: offset.to_string() },
                            location,
                        );
                        return None;
                    };
                    (file.trim_end(), offset)
                }
            };
            if file.is_empty() {
                self.diagnostics.report(DiagnosticKind::IncludeWithoutFile, location);
                return None;
            }
            let path = source::resolve(&folder, file);
            if !self.loader.exists(&path) {
                self.diagnostics.report(
                    DiagnosticKind::IncludeFileNotFound { file: file.to_string() },
                    location,
                );
                return None;
            }
            let weight = match pair.get(1) {
                None => 1.0,
                Some(weight) => match numbers::parse_f64_lenient(weight) {
                    Some(w) if w > 0.0 => w,
                    _ => {
                        self.diagnostics.report(
                            DiagnosticKind::InvalidIncludeWeight { weight: weight.to_string() },
                            location,
                        );
                        return None;
                    }
                },
            };
            candidates.push((path, offset, weight));
        }
        let total: f64 = candidates.iter().map(|c| c.2).sum();
        let number = self.rng.gen::<f64>() * total;
        let mut cumulative = 0.0;
        let mut chosen = 0;
        for (k, candidate) in candidates.iter().enumerate() {
            cumulative += candidate.2;
            if cumulative > number {
                chosen = k;
                break;
            }
        }
        let (path, offset, _) = candidates.swap_remove(chosen);
        let text = match self.loader.read(&path) {
            Ok(text) => text,
            Err(err) => {
                self.diagnostics.report(
                    DiagnosticKind::FileNotLoaded {
                        file: path.display().to_string(),
                        reason: err.to_string(),
                    },
                    location,
                );
                return None;
            }
        };
        log::trace!("including {}", path.display());
        let file: Rc<Path> = Rc::from(path.as_path());
        Some(split(
            &file,
            &text,
            self.dialect,
            offset + expression.track_position_offset,
            None,
            self.diagnostics,
        ))
    }
}

#[derive(Default)]
struct State {
    subs: Vec<Option<String>>,
    open_ifs: usize,
}

/// A `$` directive found in an expression.
struct Directive {
    name: String,
    argument: String,
    /// Byte index just past the directive.
    end: usize,
}

impl Directive {
    /// Parses the directive starting at byte index `j`, which holds a `$`.
    ///
    /// Returns [None] if the `$` does not start a directive and an error containing the
    ///     directive name if its parentheses are not balanced.
    fn parse(text: &str, j: usize) -> Option<Result<Directive, String>> {
        let bytes = text.as_bytes();
        let mut k = j + 1;
        while k < bytes.len() && bytes[k] != b'(' {
            if bytes[k] == b'/' || bytes[k] == b'\\' {
                return None;
            }
            k += 1;
        }
        if k == bytes.len() {
            return Some(Directive::parse_bare(text, j));
        }
        let name = text[j..k].trim_end().to_string();
        let mut level = 1;
        let mut h = k + 1;
        while h < bytes.len() {
            match bytes[h] {
                b'(' => level += 1,
                b')' => level -= 1,
                _ => {}
            }
            if level <= 0 {
                break;
            }
            h += 1;
        }
        if level != 0 {
            return Some(Err(name));
        }
        Some(Ok(Directive {
            name,
            argument: text[k + 1..h].trim().to_string(),
            end: h + 1,
        }))
    }

    /// Parses a conditional directive written without parentheses, like `$If 1`.
    fn parse_bare(text: &str, j: usize) -> Result<Directive, String> {
        let rest = &text[j..];
        let name_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let name = &rest[..name_end];
        match name.to_lowercase().as_str() {
            "$if" | "$else" | "$endif" => Ok(Directive {
                name: name.to_string(),
                argument: rest[name_end..].trim().to_string(),
                end: text.len(),
            }),
            _ => Err(name.to_string()),
        }
    }
}

enum Conditional {
    If,
    Else,
    EndIf,
}

fn conditional_directive(text: &str) -> Option<Conditional> {
    let lower: String = text.chars().take(6).collect::<String>().to_lowercase();
    if lower.starts_with("$if") {
        Some(Conditional::If)
    } else if lower.starts_with("$else") {
        Some(Conditional::Else)
    } else if lower.starts_with("$endif") {
        Some(Conditional::EndIf)
    } else {
        None
    }
}

/// Checks whether the `$Sub(n)` ending at byte `end` is followed by `= value`.
///
/// Returns the trimmed value and the byte index just past it.
fn assignment(text: &str, end: usize) -> Option<(String, usize)> {
    let bytes = text.as_bytes();
    let mut level = 0;
    let mut m = end;
    loop {
        if m >= bytes.len() {
            return None;
        }
        match bytes[m] {
            b'(' => level += 1,
            b')' => level -= 1,
            b'=' if level == 0 => break,
            b'=' => {}
            b if (b as char).is_ascii_whitespace() => {}
            _ => return None,
        }
        if level < 0 {
            return None;
        }
        m += 1;
    }
    let mut level = 0;
    let mut n = m + 1;
    while n < bytes.len() {
        match bytes[n] {
            b'(' => level += 1,
            b')' => level -= 1,
            _ => {}
        }
        if level < 0 {
            break;
        }
        n += 1;
    }
    Some((text[m + 1..n].trim().to_string(), n))
}

/// Removes comments from a single line.
///
/// Block comments `/* */` may span lines; `in_block_comment` carries this state between calls.
/// Everything after `//` is removed.
/// In the RW dialect everything after a `;` outside parentheses is removed too,
///     unless an `=` outside parentheses comes first.
pub fn strip_comments(line: &str, dialect: Dialect, in_block_comment: &mut bool) -> String {
    let mut out = String::with_capacity(line.len());
    let mut depth = 0;
    let mut chars = line.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if *in_block_comment {
            if c == '*' && matches!(chars.peek(), Some((_, '/'))) {
                chars.next();
                *in_block_comment = false;
            }
            continue;
        }
        match c {
            '/' if matches!(chars.peek(), Some((_, '*'))) => {
                chars.next();
                *in_block_comment = true;
            }
            '/' if matches!(chars.peek(), Some((_, '/'))) => break,
            ';' if dialect == Dialect::Rw && depth == 0 => break,
            '=' if dialect == Dialect::Rw && depth == 0 => {
                out.push_str(&line[i..]);
                break;
            }
            _ => {
                match c {
                    '(' => depth += 1,
                    ')' => depth -= 1,
                    _ => {}
                }
                out.push(c);
            }
        }
    }
    out.truncate(out.trim_end().len());
    out
}

/// Splits route source text into expressions, without expanding directives.
///
/// If `description` is provided and the dialect is RW,
///     lines before the first section header or directive are appended to it.
pub fn split(
    file: &Rc<Path>,
    source: &str,
    dialect: Dialect,
    track_position_offset: f64,
    mut description: Option<&mut String>,
    diagnostics: &mut dyn EmitDiagnostic,
) -> Vec<Expression> {
    let separator = match dialect {
        Dialect::Csv => ',',
        Dialect::Rw => '@',
    };
    let mut in_description = dialect == Dialect::Rw && description.is_some();
    let mut in_block_comment = false;
    let mut expressions = vec![];
    let mut line_offset = 0;
    for (i, raw_line) in source.split('\n').enumerate() {
        let line_start = line_offset;
        line_offset += raw_line.chars().count() + 1;
        let line: String = raw_line.trim_end_matches('\r').chars().filter(|c| *c != '\0').collect();
        let line = strip_comments(&line, dialect, &mut in_block_comment);
        if in_description {
            if (line.starts_with('[') && line.find(']').is_some_and(|p| p > 0)) || line.starts_with('$') {
                in_description = false;
            } else {
                if let Some(d) = description.as_deref_mut() {
                    if !d.is_empty() {
                        d.push('\n');
                    }
                    d.push_str(&line);
                }
                continue;
            }
        }
        let mut depth = 0;
        let mut start = 0;
        let mut column = 0;
        let mut push = |start: usize, end: usize, column: usize| {
            let raw = &line[start..end];
            let t = raw.trim();
            if t.is_empty() || t.starts_with(';') {
                return;
            }
            let leading = raw.len() - raw.trim_start().len();
            let span_start = line_start + line[..start + leading].chars().count();
            expressions.push(Expression::new(
                t,
                Location {
                    file: file.clone(),
                    line: i + 1,
                    column: column + 1,
                    span: span_start..span_start + t.chars().count(),
                },
                track_position_offset,
            ));
        };
        for (j, c) in line.char_indices() {
            match c {
                '(' => depth += 1,
                ')' => {
                    if depth > 0 {
                        depth -= 1;
                    } else {
                        diagnostics.report(
                            DiagnosticKind::UnexpectedClosingParenthesis,
                            Some(&Location {
                                file: file.clone(),
                                line: i + 1,
                                column: column + 1,
                                span: line_start + j..line_start + j + 1,
                            }),
                        );
                    }
                }
                c if c == separator && depth == 0 => {
                    push(start, j, column);
                    start = j + 1;
                    column += 1;
                }
                _ => {}
            }
        }
        push(start, line.len(), column);
    }
    expressions
}
