//! Resource quantities as written in container requests: `"500m"` CPU,
//! `"256Mi"` memory.

use crate::error::ConfigError;

/// CPU quantity in cores.
pub fn parse_cpu(text: &str) -> Result<f64, ConfigError> {
  let input = text.trim();
  let (number, scale) = match input.strip_suffix('m') {
    Some(milli) => (milli, 1e-3),
    None => (input, 1.0),
  };
  number
    .parse::<f64>()
    .ok()
    .filter(|v| v.is_finite() && *v >= 0.0)
    .map(|v| v * scale)
    .ok_or_else(|| ConfigError::InvalidQuantity(text.to_string()))
}

/// Memory quantity in bytes.
pub fn parse_memory(text: &str) -> Result<f64, ConfigError> {
  const SUFFIXES: &[(&str, f64)] = &[
    ("Ki", 1024.0),
    ("Mi", 1024.0 * 1024.0),
    ("Gi", 1024.0 * 1024.0 * 1024.0),
    ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
  ];

  let input = text.trim();
  let (number, scale) = SUFFIXES
    .iter()
    .find_map(|(suffix, scale)| input.strip_suffix(suffix).map(|n| (n, *scale)))
    .unwrap_or((input, 1.0));
  number
    .parse::<f64>()
    .ok()
    .filter(|v| v.is_finite() && *v >= 0.0)
    .map(|v| v * scale)
    .ok_or_else(|| ConfigError::InvalidQuantity(text.to_string()))
}
