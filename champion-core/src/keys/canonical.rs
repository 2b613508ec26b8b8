//! Normalization and canonical encoding of [`ConfigValue`] trees.
//!
//! Two inputs with the same semantic content must encode to the same bytes:
//! - map keys are sorted (the tree stores maps as `BTreeMap`)
//! - floats are rounded to a fixed number of significant digits
//! - floats with an exact integral value collapse to integers, so `1.0` and `1` agree
//! - keys listed as non-identity-affecting are dropped at every depth

use std::collections::BTreeSet;
use std::fmt::Write as _;

use super::value::ConfigValue;

/// Default significant digits kept for floats.
pub const DEFAULT_FLOAT_DIGITS: u32 = 12;

/// Largest magnitude at which every integer is exactly representable as `f64`.
const MAX_EXACT_INT: f64 = 9_007_199_254_740_992.0;

/// Keys that never affect identity by default.
pub const DEFAULT_EXCLUDED_KEYS: &[&str] = &[
    "output_dir",
    "output_directory",
    "logging_dir",
    "checkpoint_dir",
    "cache_dir",
    "run_name",
    "overwrite_output_dir",
];

/// Applies the normalization rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalizer {
    float_digits: u32,
    excluded_keys: BTreeSet<String>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(
            DEFAULT_FLOAT_DIGITS,
            DEFAULT_EXCLUDED_KEYS.iter().map(|k| k.to_string()),
        )
    }
}

impl Normalizer {
    pub fn new(float_digits: u32, excluded_keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            float_digits: float_digits.clamp(1, 17),
            excluded_keys: excluded_keys.into_iter().collect(),
        }
    }

    pub fn float_digits(&self) -> u32 {
        self.float_digits
    }

    pub fn is_excluded(&self, key: &str) -> bool {
        self.excluded_keys.contains(key)
    }

    /// Normalize a tree. Lists keep their order; maps drop excluded keys.
    pub fn normalize(&self, value: &ConfigValue) -> ConfigValue {
        match value {
            ConfigValue::Null => ConfigValue::Null,
            ConfigValue::Bool(b) => ConfigValue::Bool(*b),
            ConfigValue::Int(i) => ConfigValue::Int(*i),
            ConfigValue::Float(f) => self.normalize_float(*f),
            ConfigValue::String(s) => ConfigValue::String(s.clone()),
            ConfigValue::List(items) => {
                ConfigValue::List(items.iter().map(|v| self.normalize(v)).collect())
            }
            ConfigValue::Map(entries) => ConfigValue::Map(
                entries
                    .iter()
                    .filter(|(k, _)| !self.is_excluded(k))
                    .map(|(k, v)| (k.clone(), self.normalize(v)))
                    .collect(),
            ),
        }
    }

    fn normalize_float(&self, v: f64) -> ConfigValue {
        let rounded = round_significant(v, self.float_digits);
        if rounded.fract() == 0.0 && rounded.abs() <= MAX_EXACT_INT {
            ConfigValue::Int(rounded as i64)
        } else {
            ConfigValue::Float(rounded)
        }
    }
}

/// Round to `digits` significant decimal digits.
///
/// Goes through scientific formatting, which is exact and platform independent,
/// unlike `powi`-based scaling.
pub fn round_significant(v: f64, digits: u32) -> f64 {
    if v == 0.0 || !v.is_finite() {
        return if v == 0.0 { 0.0 } else { v };
    }
    let precision = digits.saturating_sub(1) as usize;
    let formatted = format!("{v:.precision$e}");
    formatted.parse::<f64>().unwrap_or(v)
}

/// Encode a normalized tree as compact JSON with sorted keys.
///
/// Written by hand rather than through `serde_json` so the output cannot change with
/// `serde_json` feature flags such as `preserve_order`.
pub fn canonical_string(value: &ConfigValue) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &ConfigValue) {
    match value {
        ConfigValue::Null => out.push_str("null"),
        ConfigValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        ConfigValue::Int(i) => {
            let _ = write!(out, "{i}");
        }
        ConfigValue::Float(f) => {
            let _ = write!(out, "{f}");
        }
        ConfigValue::String(s) => write_string(out, s),
        ConfigValue::List(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        ConfigValue::Map(entries) => {
            out.push('{');
            for (idx, (k, v)) in entries.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_string(out, k);
                out.push(':');
                write_value(out, v);
            }
            out.push('}');
        }
    }
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}
