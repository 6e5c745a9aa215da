//! Logging setup
//!
//! Console output in the form `2025-12-02T00:50:44.809512Z [INFO] message`.
//! The level comes from `RUST_LOG` when set, otherwise from the `verbose`
//! setting, and can be changed at runtime so a configuration reload that flips
//! `verbose` takes effect without restarting.

use std::fmt::Write as _;
use std::sync::OnceLock;

use tracing::Level;
use tracing_subscriber::{
    fmt::{
        self,
        format::Writer,
        FmtContext, FormatEvent, FormatFields,
    },
    layer::SubscriberExt,
    registry::LookupSpan,
    reload,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::error::{RelayError, RelayResult};

type FilterHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

static FILTER_HANDLE: OnceLock<FilterHandle> = OnceLock::new();

fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Event formatter: `timestamp [LEVEL] message`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m",
                Level::DEBUG => "\x1b[34m",
                Level::INFO => "\x1b[32m",
                Level::WARN => "\x1b[33m",
                Level::ERROR => "\x1b[31m",
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Default filter directive for the given verbosity
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "info"
    }
}

/// Install the global subscriber. Later calls only adjust the level.
pub fn init(verbose: bool) {
    if FILTER_HANDLE.get().is_some() {
        let _ = set_verbose(verbose);
        return;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));
    let (filter, handle) = reload::Layer::new(filter);

    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .event_format(BracketedLevelFormat);

    if tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .try_init()
        .is_ok()
    {
        let _ = FILTER_HANDLE.set(handle);
    }
}

/// Switch between the `info` and `debug` levels.
///
/// A `RUST_LOG` set in the environment keeps precedence.
pub fn set_verbose(verbose: bool) -> RelayResult<()> {
    if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        return Ok(());
    }
    let Some(handle) = FILTER_HANDLE.get() else {
        return Ok(());
    };
    handle
        .reload(EnvFilter::new(default_directive(verbose)))
        .map_err(|e| RelayError::config(format!("Failed to reload log filter: {}", e)))
}

/// Render a frame as space-separated hex bytes for packet tracing
pub fn hex_frame(frame: &[u8]) -> String {
    let mut out = String::with_capacity(frame.len() * 3);
    for (i, byte) in frame.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02X}", byte);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_frame() {
        assert_eq!(hex_frame(&[0x01, 0x03, 0xAB]), "01 03 AB");
        assert_eq!(hex_frame(&[]), "");
    }

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(true), "debug");
        assert_eq!(default_directive(false), "info");
    }
}
