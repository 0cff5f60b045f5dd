//! Unit conversions into the canonical metric schema, plus the lenient numeric
//! parser every raw numeric field goes through before conversion.

use serde_json::Value;

const INHG_TO_HPA: f64 = 33.8638866667;
const MPH_TO_KMH: f64 = 1.609344;
const INCH_TO_MM: f64 = 25.4;

/// Tokens treated as "no value" by [`parse_lenient_str`] (compared lowercased).
const NULL_LIKE: &[&str] = &["", "n/a", "na", "-", "--", "—", "none", "null", "nan"];

/// 16-point compass rose, clockwise from north.
const COMPASS_POINTS: [(&str, &str, f64); 16] = [
    ("north", "n", 0.0),
    ("nne", "nne", 22.5),
    ("ne", "ne", 45.0),
    ("ene", "ene", 67.5),
    ("east", "e", 90.0),
    ("ese", "ese", 112.5),
    ("se", "se", 135.0),
    ("sse", "sse", 157.5),
    ("south", "s", 180.0),
    ("ssw", "ssw", 202.5),
    ("sw", "sw", 225.0),
    ("wsw", "wsw", 247.5),
    ("west", "w", 270.0),
    ("wnw", "wnw", 292.5),
    ("nw", "nw", 315.0),
    ("nnw", "nnw", 337.5),
];

pub fn fahrenheit_to_celsius(f: f64) -> f64 {
    (f - 32.0) * 5.0 / 9.0
}

pub fn inhg_to_hpa(inhg: f64) -> f64 {
    inhg * INHG_TO_HPA
}

pub fn mph_to_kmh(mph: f64) -> f64 {
    mph * MPH_TO_KMH
}

pub fn inches_to_mm(inches: f64) -> f64 {
    inches * INCH_TO_MM
}

/// Convert a compass direction ("NNE", "North", "w") to degrees.
///
/// Unknown text, including "Calm" and "Variable", yields `None`.
pub fn compass_to_degrees(text: &str) -> Option<f64> {
    let key = text.trim().to_lowercase();
    if key.is_empty() {
        return None;
    }
    COMPASS_POINTS
        .iter()
        .find(|(name, abbrev, _)| *name == key || *abbrev == key)
        .map(|(_, _, degrees)| *degrees)
}

/// Parse a raw JSON value into a finite number.
///
/// Numbers pass through, strings go through [`parse_lenient_str`], anything
/// else (null, booleans, arrays, objects) is `None`.
pub fn parse_lenient(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => parse_lenient_str(s),
        _ => None,
    }
}

/// Same as [`parse_lenient`] for an optional map lookup.
pub fn parse_lenient_opt(value: Option<&Value>) -> Option<f64> {
    value.and_then(parse_lenient)
}

/// Parse exported text like `"57.7\u{a0}°F"`, `"< 0.1"`, `"29,92 in"`.
///
/// Non-breaking spaces, leading comparison operators and trailing unit
/// suffixes are stripped and a comma decimal separator is accepted. Null-like
/// tokens and anything without a leading number yield `None`.
pub fn parse_lenient_str(raw: &str) -> Option<f64> {
    let cleaned = raw.replace('\u{a0}', " ");
    let cleaned = cleaned.trim();
    if NULL_LIKE.contains(&cleaned.to_lowercase().as_str()) {
        return None;
    }

    let cleaned = cleaned
        .trim_start_matches(|c: char| matches!(c, '<' | '>' | '=' | '~' | '≤' | '≥') || c.is_whitespace());

    let mantissa_len = cleaned
        .find(|c: char| !(c.is_ascii_digit() || matches!(c, '.' | ',' | '-' | '+')))
        .unwrap_or(cleaned.len());
    if mantissa_len == 0 {
        return None;
    }
    let mut numeric = cleaned[..mantissa_len].replace(',', ".");

    // Scientific notation only when the exponent carries digits
    let rest = &cleaned[mantissa_len..];
    if let Some(exponent) = rest.strip_prefix(['e', 'E']) {
        let unsigned = exponent.trim_start_matches(['+', '-']);
        let sign_len = exponent.len() - unsigned.len();
        let digits = unsigned
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(unsigned.len());
        if sign_len <= 1 && digits > 0 {
            numeric.push('e');
            numeric.push_str(&exponent[..sign_len + digits]);
        }
    }

    numeric.parse::<f64>().ok().filter(|v| v.is_finite())
}
