//! Content fingerprint used as the de-duplication key of an observation.
//!
//! The digest covers `source`, `station_id`, `obs_datetime` and the
//! discriminating measurements `temperature_c`, `humidity_pct` and
//! `pressure_hpa`. The key is rendered as
//! `source|station_id|obs_datetime|temperature_c|humidity_pct|pressure_hpa`
//! with the instant in RFC 3339 (seconds, `Z`), numbers in shortest
//! round-trip form and absent values as `null`, then hashed with SHA-256.

use chrono::{DateTime, SecondsFormat, Utc};
use hex::ToHex;
use sha2::Digest;

/// Fields the record hash is computed from.
#[derive(Debug, Clone, Copy)]
pub struct IdentityBasis<'a> {
    pub source: &'a str,
    pub station_id: &'a str,
    pub obs_datetime: DateTime<Utc>,
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub pressure_hpa: Option<f64>,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    hasher.finalize().encode_hex::<String>()
}

pub fn is_sha256_hex(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 64 {
        return false;
    }
    bytes.iter().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

pub fn identity_key(basis: &IdentityBasis<'_>) -> String {
    format!(
        "{}|{}|{}|{}|{}|{}",
        basis.source,
        basis.station_id,
        basis.obs_datetime.to_rfc3339_opts(SecondsFormat::Secs, true),
        render_number(basis.temperature_c),
        render_number(basis.humidity_pct),
        render_number(basis.pressure_hpa),
    )
}

pub fn record_hash(basis: &IdentityBasis<'_>) -> String {
    sha256_hex(identity_key(basis).as_bytes())
}

fn render_number(value: Option<f64>) -> String {
    match value {
        // -0.0 and 0.0 are the same reading
        Some(v) if v == 0.0 => "0".to_string(),
        Some(v) => v.to_string(),
        None => "null".to_string(),
    }
}
