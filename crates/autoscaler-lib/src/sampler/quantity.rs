//! Kubernetes resource quantity parsing
//!
//! Handles the subset of the quantity grammar that node status and the
//! metrics API actually emit: decimal numbers with an optional binary
//! (`Ki`..`Ei`) or decimal (`n`, `u`, `m`, `k`..`E`) suffix.

use anyhow::{bail, Context, Result};

/// Split "250m" into ("250", "m")
fn split_quantity(raw: &str) -> (&str, &str) {
    let raw = raw.trim();
    let idx = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(raw.len());
    raw.split_at(idx)
}

fn suffix_multiplier(suffix: &str) -> Option<f64> {
    let m = match suffix {
        "" => 1.0,
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024.0_f64.powi(2),
        "Gi" => 1024.0_f64.powi(3),
        "Ti" => 1024.0_f64.powi(4),
        "Pi" => 1024.0_f64.powi(5),
        "Ei" => 1024.0_f64.powi(6),
        _ => return None,
    };
    Some(m)
}

/// Parse a quantity into its base unit (cores for CPU, bytes for memory)
fn parse_base(raw: &str) -> Result<f64> {
    // Plain numbers, including exponent notation such as "1e3"
    if let Ok(v) = raw.trim().parse::<f64>() {
        return Ok(v);
    }

    let (number, suffix) = split_quantity(raw);
    if number.is_empty() {
        bail!("quantity {:?} has no numeric part", raw);
    }
    let value: f64 = number
        .parse()
        .with_context(|| format!("invalid quantity {:?}", raw))?;
    let multiplier = suffix_multiplier(suffix)
        .with_context(|| format!("unknown suffix {:?} in quantity {:?}", suffix, raw))?;

    Ok(value * multiplier)
}

/// Parse a CPU quantity ("2", "1500m", "250000000n") into millicores
pub fn parse_cpu_millis(raw: &str) -> Result<i64> {
    Ok((parse_base(raw)? * 1000.0).round() as i64)
}

/// Parse a memory quantity ("16Gi", "2048Ki", "1e9") into bytes
pub fn parse_bytes(raw: &str) -> Result<i64> {
    Ok(parse_base(raw)?.round() as i64)
}
