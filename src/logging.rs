//! Tracing subscriber setup.

use std::path::Path;
use std::str::FromStr;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

/// Build the filter from `RUST_LOG`, falling back to the crate default.
pub fn env_filter(verbose: bool) -> EnvFilter {
    let default = if verbose { "autoctf=debug,info" } else { "autoctf=info,warn" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber. Logs go to stderr and, when `log_dir` is
/// set, to a daily-rolling file. Keep the returned guard alive until exit so
/// buffered file output is flushed.
pub fn init(verbose: bool, format: LogFormat, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let (file_writer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "autoctf.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(env_filter(verbose));

    let result = match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(file_writer.map(|w| fmt::layer().json().with_ansi(false).with_writer(w)))
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .with(file_writer.map(|w| fmt::layer().json().with_ansi(false).with_writer(w)))
            .try_init(),
    };
    if let Err(e) = result {
        anyhow::bail!("Failed to install tracing subscriber: {}", e);
    }

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parses_known_values() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("Pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
