//! Terminal output for `strata build`.
//!
//! Every line starts with a [`Status`] marker. Progress goes to stdout,
//! warnings and errors to stderr. Colors are applied only when the stream
//! supports them.

use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use owo_colors::{AnsiColors, OwoColorize, Stream};

use strata_lib::StepKind;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
  Success,
  Cached,
  Pending,
  Info,
  Warning,
  Error,
}

impl Status {
  pub fn symbol(self) -> &'static str {
    match self {
      Status::Success => "✓",
      Status::Cached => "≡",
      Status::Pending => "○",
      Status::Info => "•",
      Status::Warning => "⚠",
      Status::Error => "✗",
    }
  }

  fn color(self) -> AnsiColors {
    match self {
      Status::Success => AnsiColors::Green,
      Status::Cached => AnsiColors::Cyan,
      Status::Pending | Status::Warning => AnsiColors::Yellow,
      Status::Info => AnsiColors::Blue,
      Status::Error => AnsiColors::Red,
    }
  }

  fn stream(self) -> Stream {
    match self {
      Status::Warning | Status::Error => Stream::Stderr,
      _ => Stream::Stdout,
    }
  }
}

/// Print `message` behind the status marker. Warning and error text is
/// colored as a whole; cached lines get a dimmed `(cached)` suffix.
pub fn print_status(status: Status, message: &str) {
  let stream = status.stream();
  let color = status.color();
  let sym = status.symbol();
  let symbol = sym.if_supports_color(stream, |s| s.color(color));

  match status {
    Status::Warning | Status::Error => {
      eprintln!("{} {}", symbol, message.if_supports_color(stream, |s| s.color(color)));
    }
    Status::Cached => {
      println!("{} {} {}", symbol, message, "(cached)".if_supports_color(stream, |s| s.dimmed()));
    }
    _ => println!("{} {}", symbol, message),
  }
}

pub fn print_error(message: &str) {
  print_status(Status::Error, message);
}

/// Indented `label: value` line used in summaries.
pub fn print_stat(label: &str, value: &str) {
  println!("  {}: {}", label.if_supports_color(Stream::Stdout, |s| s.dimmed()), value);
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", json);
  Ok(())
}

/// First 12 characters of a snapshot key.
pub fn short_key(key: &str) -> &str {
  key.get(..12).unwrap_or(key)
}

/// Millisecond-precision duration, e.g. `1s 250ms` or `2m 5s`.
pub fn format_duration(duration: Duration) -> String {
  let duration = if duration >= Duration::from_secs(60) {
    Duration::from_secs(duration.as_secs())
  } else {
    Duration::from_millis(duration.as_millis() as u64)
  };
  humantime::format_duration(duration).to_string()
}

/// `[3] install_packages`
pub fn step_label(ordinal: usize, kind: StepKind) -> String {
  format!("[{}] {}", ordinal, kind)
}
