//! Sorting expressions by track position.
//!
//! Route files may jump back and forth along the track.
//! The sorter removes bare track positions, orders all other expressions by the
//!     position in effect when they appear, and inserts synthesized position markers
//!     so that the next pass sees a non-decreasing sequence of positions.

use crate::diagnostics::{DiagnosticKind, EmitDiagnostic};
use crate::numbers;
use crate::{Dialect, Expression};

/// Output of the sorter.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Sorted {
    pub expressions: Vec<Expression>,
    /// The first track position set explicitly in the file, in meters.
    pub minimum_jump_position: Option<f64>,
}

/// Track position of expressions that appear before the first position marker.
const PREAMBLE: f64 = -1.0;

/// Sorts expressions by track position.
///
/// In the RW dialect only expressions in the `[Railway]` section can be positions.
pub fn sort_by_track_position(
    expressions: Vec<Expression>,
    unit_factors: &[f64],
    dialect: Dialect,
    diagnostics: &mut dyn EmitDiagnostic,
) -> Sorted {
    let last_factor = unit_factors.last().copied().unwrap_or(1.0);
    let mut positioned: Vec<(f64, Expression)> = Vec::with_capacity(expressions.len());
    let mut minimum_jump_position = None;
    let mut position = PREAMBLE;
    let mut marked = PREAMBLE;
    let mut number_check = dialect == Dialect::Csv;
    for expression in expressions {
        if dialect == Dialect::Rw {
            if let Some(section) = section_name(&expression.text) {
                number_check = section.eq_ignore_ascii_case("railway") || section.eq_ignore_ascii_case("track");
            }
        }
        let x = if number_check {
            numbers::parse_length(&expression.text, unit_factors)
        } else {
            None
        };
        match x {
            Some(x) => {
                let x = x + expression.track_position_offset;
                if x >= 0.0 {
                    position = x;
                    minimum_jump_position.get_or_insert(x);
                } else {
                    diagnostics.report(
                        DiagnosticKind::NegativeTrackPosition {
                            text: expression.text.clone(),
                        },
                        expression.location.as_ref(),
                    );
                }
            }
            None => {
                if marked != position {
                    let marker = Expression::synthesized(format!["{}", position / last_factor]);
                    positioned.push((position, marker));
                    marked = position;
                }
                positioned.push((position, expression));
            }
        }
    }
    // Vec::sort_by is stable, so expressions at the same position keep their file order.
    positioned.sort_by(|a, b| a.0.total_cmp(&b.0));
    log::debug!("sorted {} expressions by track position", positioned.len());
    Sorted {
        expressions: positioned.into_iter().map(|(_, e)| e).collect(),
        minimum_jump_position,
    }
}

/// Returns the name of a `[Section]` header.
pub fn section_name(text: &str) -> Option<&str> {
    text.strip_prefix('[')?.strip_suffix(']').map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Location;
    use crate::Diagnostic;
    use std::path::Path;
    use std::rc::Rc;

    fn expressions(texts: &[&str]) -> Vec<Expression> {
        let file: Rc<Path> = Rc::from(Path::new("route.csv"));
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| {
                Expression::new(
                    *t,
                    Location {
                        file: file.clone(),
                        line: i + 1,
                        column: 1,
                        span: 0..0,
                    },
                    0.0,
                )
            })
            .collect()
    }

    macro_rules! sort_tests {
        ( $( ($name: ident, $dialect: expr, $factors: expr, $input: expr, $want: expr), )+ ) => {
            $(
                #[test]
                fn $name() {
                    let mut diagnostics: Vec<Diagnostic> = vec![];
                    let factors: &[f64] = &$factors;
                    let got = sort_by_track_position(expressions(&$input), factors, $dialect, &mut diagnostics);
                    let got: Vec<String> = got.expressions.into_iter().map(|e| e.text).collect();
                    let want: Vec<&str> = $want;
                    assert_eq!(got, want);
                }
            )+
        };
    }

    sort_tests!(
        (
            already_sorted,
            Dialect::Csv,
            [1.0],
            ["Route.Gauge 1067", "0", "a", "25", "b"],
            vec!["Route.Gauge 1067", "0", "a", "25", "b"]
        ),
        (
            jump_back,
            Dialect::Csv,
            [1.0],
            ["100", "a", "50", "b", "100", "c"],
            vec!["50", "b", "100", "a", "100", "c"]
        ),
        (
            same_position_keeps_file_order,
            Dialect::Csv,
            [1.0],
            ["10", "a", "0", "b", "10", "c", "d"],
            vec!["0", "b", "10", "a", "10", "c", "d"]
        ),
        (
            marker_uses_input_units,
            Dialect::Csv,
            [0.5],
            ["40", "a"],
            vec!["40", "a"]
        ),
        (
            mixed_units,
            Dialect::Csv,
            [1000.0, 1.0],
            ["1:250", "a"],
            vec!["1250", "a"]
        ),
        (
            rw_positions_only_in_railway,
            Dialect::Rw,
            [1.0],
            ["[Cycle]", "5", "[Railway]", "50", "a", "0", "b"],
            vec!["[Cycle]", "5", "[Railway]", "0", "b", "50", "a"]
        ),
    );

    #[test]
    fn negative_position_is_reported() {
        let mut diagnostics: Vec<Diagnostic> = vec![];
        let got = sort_by_track_position(expressions(&["10", "-5", "a"]), &[1.0], Dialect::Csv, &mut diagnostics);
        let texts: Vec<String> = got.expressions.into_iter().map(|e| e.text).collect();
        assert_eq!(texts, vec!["10", "a"]);
        assert_eq!(
            diagnostics.into_iter().map(|d| d.kind).collect::<Vec<_>>(),
            vec![DiagnosticKind::NegativeTrackPosition { text: "-5".into() }]
        );
    }

    #[test]
    fn include_offset_is_added() {
        let mut input = expressions(&["10", "a"]);
        input[0].track_position_offset = 90.0;
        let mut diagnostics: Vec<Diagnostic> = vec![];
        let got = sort_by_track_position(input, &[1.0], Dialect::Csv, &mut diagnostics);
        assert_eq!(got.expressions[0].text, "100");
        assert_eq!(got.minimum_jump_position, Some(100.0));
    }

    #[test]
    fn stability_over_many_positions() {
        let mut texts = vec![];
        for i in 0..20 {
            texts.push(format!["{}", (i * 7) % 5]);
            texts.push(format!["e{i}"]);
        }
        let input: Vec<&str> = texts.iter().map(String::as_str).collect();
        let mut diagnostics: Vec<Diagnostic> = vec![];
        let got = sort_by_track_position(expressions(&input), &[1.0], Dialect::Csv, &mut diagnostics);
        let mut last_position = -1.0;
        let mut last_index_at_position = -1;
        for e in got.expressions {
            if let Ok(p) = e.text.parse::<f64>() {
                assert!(p >= last_position);
                if p != last_position {
                    last_index_at_position = -1;
                }
                last_position = p;
            } else {
                let index: i32 = e.text[1..].parse().unwrap();
                assert!(index > last_index_at_position);
                last_index_at_position = index;
            }
        }
    }
}
