//! Front end for the CSV and RW train route languages.
//!
//! A route file goes through three passes before any route data is built:
//!
//! 1. [preprocess] splits the file into [Expression]s and expands the
//!     `$if`, `$include`, `$chr`, `$rnd` and `$sub` directives.
//! 2. [sort] reorders the expressions by track position.
//! 3. [tokenize] turns each expression into a [tokenize::Command].
//!
//! Problems are never fatal.
//! They are reported through an [EmitDiagnostic] sink and processing continues.

pub mod cancel;
pub mod diagnostics;
pub mod numbers;
pub mod preprocess;
pub mod sort;
pub mod source;
pub mod tokenize;

pub use cancel::{CancellationToken, Cancelled};
pub use diagnostics::{Diagnostic, DiagnosticKind, EmitDiagnostic, Location, Severity};
pub use source::{LoadError, SourceLoader};

use std::rc::Rc;

/// The surface syntax of a route file.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Dialect {
    /// Comma separated commands with explicit namespaces, e.g. `Track.Curve 300,0`.
    #[default]
    Csv,
    /// Line oriented commands grouped under `[Section]` headers, with `@` separators.
    Rw,
}

impl Dialect {
    /// Returns the dialect implied by the file extension: `.rw` files use [Dialect::Rw].
    pub fn from_path(path: &std::path::Path) -> Dialect {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("rw") => Dialect::Rw,
            _ => Dialect::Csv,
        }
    }
}

/// A fragment of route source text.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    pub text: String,
    /// Where the fragment came from.
    ///
    /// Position markers synthesized by the sorter have no location.
    pub location: Option<Location>,
    /// Offset added to every track position in this fragment.
    ///
    /// This is non-zero for fragments that come from a `$include` with an offset.
    pub track_position_offset: f64,
}

impl Expression {
    pub fn new(text: impl Into<String>, location: Location, track_position_offset: f64) -> Self {
        Expression {
            text: text.into(),
            location: Some(location),
            track_position_offset,
        }
    }

    /// Creates a fragment that does not correspond to any source text.
    pub fn synthesized(text: impl Into<String>) -> Self {
        Expression {
            text: text.into(),
            location: None,
            track_position_offset: 0.0,
        }
    }

    pub(crate) fn file(&self) -> Option<&Rc<std::path::Path>> {
        self.location.as_ref().map(|l| &l.file)
    }
}

impl std::fmt::Display for Expression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.location {
            None => write!(f, "{}", self.text),
            Some(l) => write!(f, "{}:{}:{}: {}", l.file.display(), l.line, l.column, self.text),
        }
    }
}
