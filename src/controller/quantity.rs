//! Kubernetes resource quantity parsing for storage comparisons

use std::cmp::Ordering;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::error::{Error, Result};

const SUFFIXES: &[(&str, f64)] = &[
    ("Ki", 1024.0),
    ("Mi", 1024.0 * 1024.0),
    ("Gi", 1024.0 * 1024.0 * 1024.0),
    ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("Pi", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("Ei", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("m", 1e-3),
    ("k", 1e3),
    ("K", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
];

/// Parse a quantity string such as "20Gi", "500M" or "1e3" into its base value
pub fn parse_quantity(s: &str) -> Result<f64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::ValidationError("empty quantity".to_string()));
    }

    // Binary suffixes first so "Mi" is not read as "M" followed by garbage.
    for (suffix, factor) in SUFFIXES {
        if let Some(number) = s.strip_suffix(suffix) {
            return number
                .parse::<f64>()
                .map(|n| n * factor)
                .map_err(|_| Error::ValidationError(format!("invalid quantity {s:?}")));
        }
    }

    s.parse::<f64>()
        .map_err(|_| Error::ValidationError(format!("invalid quantity {s:?}")))
}

/// Compare two quantities by value. Unparseable input is an error.
pub fn compare(a: &Quantity, b: &Quantity) -> Result<Ordering> {
    let a = parse_quantity(&a.0)?;
    let b = parse_quantity(&b.0)?;
    Ok(a.partial_cmp(&b).unwrap_or(Ordering::Equal))
}
