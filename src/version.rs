use crate::error::FgError;
use std::cmp::Ordering;

/// Accepts exactly `MAJOR.MINOR.PATCH` with decimal digits only.
pub fn validate_version(raw: &str) -> Result<(), FgError> {
    let parts: Vec<&str> = raw.split('.').collect();
    let well_formed = parts.len() == 3
        && parts
            .iter()
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()));
    if well_formed {
        Ok(())
    } else {
        Err(FgError::InvalidVersionFormat(raw.to_string()))
    }
}

pub fn parse_version_key(version: &str) -> Option<Vec<u64>> {
    let mut values = Vec::new();
    for part in version.split('.') {
        values.push(part.parse::<u64>().ok()?);
    }
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (parse_version_key(a), parse_version_key(b)) {
        (Some(left), Some(right)) => left.cmp(&right),
        _ => a.cmp(b),
    }
}

/// Pulls the quoted version out of `java -version` output, e.g.
/// `openjdk version "17.0.2" 2022-01-18`.
pub fn extract_runtime_version(output: &str) -> Option<String> {
    let mut parts = output.split('"');
    parts.next()?;
    let quoted = parts.next()?.trim();
    if quoted.is_empty() {
        None
    } else {
        Some(quoted.to_string())
    }
}

/// Numeric components of a runtime version. Each component keeps only its
/// leading digits (`0_312` -> 0, `17-ea` -> 17) and the legacy `1.x` scheme
/// is folded so that `1.8.0_312` reads as `8.0`.
pub fn runtime_version_key(raw: &str) -> Vec<u64> {
    let mut values: Vec<u64> = raw
        .split('.')
        .map(|part| {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<u64>().unwrap_or(0)
        })
        .collect();
    if values.len() > 1 && values[0] == 1 {
        values.remove(0);
    }
    values
}

pub fn compare_runtime_versions(found: &str, required: &str) -> Ordering {
    let mut left = runtime_version_key(found);
    let mut right = runtime_version_key(required);
    let width = left.len().max(right.len());
    left.resize(width, 0);
    right.resize(width, 0);
    left.cmp(&right)
}

pub fn runtime_major(raw: &str) -> u64 {
    runtime_version_key(raw).first().copied().unwrap_or(0)
}

/// Major-version window check used for the configured java bounds; empty
/// bounds are open.
pub fn runtime_within_bounds(found: &str, min: &str, max: &str) -> bool {
    let major = runtime_major(found);
    if !min.trim().is_empty() && major < runtime_major(min) {
        return false;
    }
    if !max.trim().is_empty() && major > runtime_major(max) {
        return false;
    }
    true
}
