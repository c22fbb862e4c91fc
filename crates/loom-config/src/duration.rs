//! Humane duration strings: `"500ms"`, `"10s"`, `"1m30s"`, `"2h"`, `"1d"`.
//! A bare number is read as seconds.

use std::time::Duration;

use crate::error::ConfigError;

pub fn parse_duration(text: &str) -> Result<Duration, ConfigError> {
  let invalid = || ConfigError::InvalidDuration(text.to_string());
  let input = text.trim();
  if input.is_empty() {
    return Err(invalid());
  }
  if let Ok(secs) = input.parse::<u64>() {
    return Ok(Duration::from_secs(secs));
  }

  let mut total = 0f64;
  let mut rest = input;
  while !rest.is_empty() {
    let number_len = rest
      .find(|c: char| !(c.is_ascii_digit() || c == '.'))
      .ok_or_else(invalid)?;
    if number_len == 0 {
      return Err(invalid());
    }
    let value: f64 = rest[..number_len].parse().map_err(|_| invalid())?;
    rest = &rest[number_len..];

    let unit_len = rest
      .find(|c: char| c.is_ascii_digit() || c == '.')
      .unwrap_or(rest.len());
    let scale = match &rest[..unit_len] {
      "ns" => 1e-9,
      "us" | "µs" => 1e-6,
      "ms" => 1e-3,
      "s" => 1.0,
      "m" => 60.0,
      "h" => 3600.0,
      "d" => 86400.0,
      _ => return Err(invalid()),
    };
    rest = &rest[unit_len..];
    total += value * scale;
  }

  if !total.is_finite() || total < 0.0 {
    return Err(invalid());
  }
  Ok(Duration::from_secs_f64(total))
}

/// Render a duration in the same notation [`parse_duration`] accepts.
pub fn format_duration(duration: Duration) -> String {
  let total_ms = duration.as_millis();
  if total_ms == 0 {
    return "0s".to_string();
  }

  let hours = total_ms / 3_600_000;
  let minutes = (total_ms / 60_000) % 60;
  let seconds = (total_ms / 1000) % 60;
  let millis = total_ms % 1000;

  let mut out = String::new();
  if hours > 0 {
    out.push_str(&format!("{hours}h"));
  }
  if minutes > 0 {
    out.push_str(&format!("{minutes}m"));
  }
  if seconds > 0 {
    out.push_str(&format!("{seconds}s"));
  }
  if millis > 0 {
    out.push_str(&format!("{millis}ms"));
  }
  out
}

/// `#[serde(with = "loom_config::duration::humane")]` for `Duration` fields.
pub mod humane {
  use std::time::Duration;

  use serde::{Deserialize, Deserializer, Serializer, de::Error};
  use serde_json::Value;

  pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&super::format_duration(*duration))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    match Value::deserialize(deserializer)? {
      Value::String(s) => super::parse_duration(&s).map_err(D::Error::custom),
      Value::Number(n) => n
        .as_f64()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(Duration::from_secs_f64)
        .ok_or_else(|| D::Error::custom(format!("invalid duration {n}"))),
      other => Err(D::Error::custom(format!("invalid duration {other}"))),
    }
  }
}

/// Same as [`humane`] for `Option<Duration>` fields.
pub mod humane_opt {
  use std::time::Duration;

  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(
    duration: &Option<Duration>,
    serializer: S,
  ) -> Result<S::Ok, S::Error> {
    match duration {
      Some(d) => super::humane::serialize(d, serializer),
      None => serializer.serialize_none(),
    }
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(
    deserializer: D,
  ) -> Result<Option<Duration>, D::Error> {
    #[derive(Deserialize)]
    struct Wrapper(#[serde(with = "super::humane")] Duration);

    Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|w| w.0))
  }
}
