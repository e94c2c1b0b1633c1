//! Parsing of numeric arguments.
//!
//! Route files are parsed leniently:
//!     most arguments accept any text that *starts* with a number,
//!     and whitespace anywhere inside the number is ignored.
//! Track positions and a handful of directives use the strict parser instead.

/// Parses a floating point number.
///
/// Leading and trailing whitespace, a sign, a decimal point and an exponent are allowed.
/// Infinities and NaN are rejected.
pub fn parse_f64(s: &str) -> Option<f64> {
    let s = s.trim();
    if !is_float_literal(s) {
        return None;
    }
    s.parse::<f64>().ok().filter(|f| f.is_finite())
}

fn is_float_literal(s: &str) -> bool {
    let b = s.as_bytes();
    let mut i = 0;
    if i < b.len() && (b[i] == b'+' || b[i] == b'-') {
        i += 1;
    }
    let mut digits = 0;
    while i < b.len() && b[i].is_ascii_digit() {
        i += 1;
        digits += 1;
    }
    if i < b.len() && b[i] == b'.' {
        i += 1;
        while i < b.len() && b[i].is_ascii_digit() {
            i += 1;
            digits += 1;
        }
    }
    if digits == 0 {
        return false;
    }
    if i < b.len() && (b[i] == b'e' || b[i] == b'E') {
        i += 1;
        if i < b.len() && (b[i] == b'+' || b[i] == b'-') {
            i += 1;
        }
        let start = i;
        while i < b.len() && b[i].is_ascii_digit() {
            i += 1;
        }
        if i == start {
            return false;
        }
    }
    i == b.len()
}

/// Parses an integer, rejecting anything that is not a whole number in range.
pub fn parse_i32(s: &str) -> Option<i32> {
    let s = s.trim();
    let digits = s.strip_prefix(['+', '-']).unwrap_or(s);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse::<i32>().ok()
}

/// Parses the longest prefix of the argument that is a number, after removing all whitespace.
///
/// For example `" 12 .5abc"` parses as `12.5`.
pub fn parse_f64_lenient(s: &str) -> Option<f64> {
    let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    let mut ends: Vec<usize> = compact.char_indices().map(|(i, c)| i + c.len_utf8()).collect();
    ends.reverse();
    ends.into_iter().find_map(|end| parse_f64(&compact[..end]))
}

/// Like [parse_f64_lenient], with the result rounded to the nearest integer.
///
/// Ties round to the even integer.
pub fn parse_i32_lenient(s: &str) -> Option<i32> {
    let f = parse_f64_lenient(s)?.round_ties_even();
    if f < i32::MIN as f64 || f > i32::MAX as f64 {
        return None;
    }
    Some(f as i32)
}

/// Parses a length written in mixed units, e.g. `1:200` with factors `[1000, 1]`.
///
/// A plain number is scaled by the last factor.
/// A colon separated number uses the last factors, so `a:b` is `a*f[n-2] + b*f[n-1]`.
pub fn parse_length(s: &str, unit_factors: &[f64]) -> Option<f64> {
    parse_length_with(s, unit_factors, parse_f64)
}

/// Like [parse_length], but each colon separated part is parsed leniently.
pub fn parse_length_lenient(s: &str, unit_factors: &[f64]) -> Option<f64> {
    parse_length_with(s, unit_factors, parse_f64_lenient)
}

fn parse_length_with(s: &str, unit_factors: &[f64], parse: fn(&str) -> Option<f64>) -> Option<f64> {
    let last = *unit_factors.last()?;
    if let Some(f) = parse_f64(s) {
        return Some(f * last);
    }
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() > unit_factors.len() {
        return None;
    }
    let first_factor = unit_factors.len() - parts.len();
    let mut total = 0.0;
    for (i, part) in parts.iter().enumerate() {
        total += parse(part)? * unit_factors[first_factor + i];
    }
    Some(total)
}

/// Parses a time of day in the route file formats `h`, `h.mm` or `h.mmss`, returning seconds.
pub fn parse_time(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (hours, rest) = match s.find('.') {
        None => (s, ""),
        Some(i) => (&s[..i], &s[i + 1..]),
    };
    let h = parse_i32(hours)? as f64;
    if rest.is_empty() {
        return Some(3600.0 * h);
    }
    if !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let (minutes, seconds) = match rest.len() {
        1 => (rest.parse::<f64>().ok()? * 10.0, 0.0),
        2 => (rest.parse::<f64>().ok()?, 0.0),
        3 => (rest[..2].parse::<f64>().ok()?, rest[2..].parse::<f64>().ok()? * 10.0),
        _ => (
            rest[..2].parse::<f64>().ok()?,
            format!["{}.{}", &rest[2..4], &rest[4..]]
                .trim_end_matches('.')
                .parse::<f64>()
                .ok()?,
        ),
    };
    Some(3600.0 * h + 60.0 * minutes + seconds)
}
