//! Logging infrastructure for circuit-sidecar.
//!
//! This module wires the tracing ecosystem for the sidecar. Output goes to
//! stdout, a file, or syslog, filtered by a configured [`LogLevel`] that the
//! `RUST_LOG` environment variable can override.
//!
//! # Log Levels
//!
//! | Level | Description | Use Case |
//! |-------|-------------|----------|
//! | [`Debug`](crate::LogLevel::Debug) | Reply framing, per-lookup detail | Development only |
//! | [`Info`](crate::LogLevel::Info) | Cache cycles, rebuild steps | Verbose operation |
//! | [`Notice`](crate::LogLevel::Notice) | Connects, rebuild outcomes | Default level |
//! | [`Warn`](crate::LogLevel::Warn) | Swallowed failures worth seeing | Potential issues |
//! | [`Error`](crate::LogLevel::Error) | Failed rebuilds, bad config | Failures |
//!
//! # Example
//!
//! ```rust,no_run
//! use circuit_sidecar::{LogLevel, logger};
//!
//! logger::init(LogLevel::Notice, None).unwrap();
//! logger::plog(LogLevel::Notice, "sidecar started");
//! ```
//!
//! # Output Destinations
//!
//! ```rust,no_run
//! use circuit_sidecar::{LogLevel, logger};
//!
//! // Log to a file (appends)
//! logger::init(LogLevel::Debug, Some("/var/log/circuit-sidecar.log")).unwrap();
//!
//! // Log to syslog
//! logger::init(LogLevel::Notice, Some(":syslog:")).unwrap();
//! ```

use std::io::Write;
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, error, info, warn};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;
use crate::error::{Error, Result};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize the logging system.
///
/// Subsequent calls are no-ops.
///
/// # Arguments
///
/// * `level` - The minimum log level to output
/// * `logfile` - `None` for stdout, `Some(":syslog:")` for syslog, or a file path
///
/// # Errors
///
/// Returns [`Error::Io`] if the log file cannot be opened, or
/// [`Error::Config`] if no syslog socket exists or a global subscriber is
/// already installed.
pub fn init(level: LogLevel, logfile: Option<&str>) -> Result<()> {
    if LOGGER_INITIALIZED.get().is_some() {
        return Ok(());
    }

    let filter = match level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Notice => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match logfile {
        None => {
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_thread_ids(false)
                .with_span_events(FmtSpan::NONE)
                .with_ansi(true)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))?;
        }
        Some(":syslog:") => {
            init_syslog(env_filter)?;
        }
        Some(path) => {
            init_file_logger(path, env_filter)?;
        }
    }

    LOGGER_INITIALIZED.get_or_init(|| ());
    Ok(())
}

fn init_syslog(env_filter: EnvFilter) -> Result<()> {
    let syslog_path = if Path::new("/dev/log").exists() {
        "/dev/log"
    } else if Path::new("/var/run/syslog").exists() {
        "/var/run/syslog"
    } else {
        return Err(Error::Config("no syslog socket found".to_string()));
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_ansi(false)
        .with_writer(move || SyslogWriter {
            socket: UnixDatagram::unbound()
                .and_then(|sock| sock.connect(syslog_path).map(|()| sock))
                .ok(),
        })
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))?;

    Ok(())
}

/// Writes each formatted event as one syslog datagram.
///
/// A writer whose socket could not be connected drops its output.
struct SyslogWriter {
    socket: Option<UnixDatagram>,
}

impl Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(ref socket) = self.socket {
            let msg = format!("circuit-sidecar: {}", String::from_utf8_lossy(buf));
            socket.send(msg.as_bytes())?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn init_file_logger(path: &str, env_filter: EnvFilter) -> Result<()> {
    let path = Path::new(path);
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::Config(format!("invalid log file path: {}", path.display())))?;
    let directory = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    // Surface permission problems here rather than on the first event.
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;

    let appender = tracing_appender::rolling::never(directory, file_name);

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_ansi(false)
        .with_writer(appender)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))?;

    Ok(())
}

/// Log a message at the specified level.
///
/// | LogLevel | tracing macro |
/// |----------|---------------|
/// | Debug | `debug!` |
/// | Info | `info!` |
/// | Notice | `info!` |
/// | Warn | `warn!` |
/// | Error | `error!` |
pub fn plog(level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => debug!("{}", message),
        LogLevel::Info => info!("{}", message),
        LogLevel::Notice => info!("{}", message),
        LogLevel::Warn => warn!("{}", message),
        LogLevel::Error => error!("{}", message),
    }
}

/// Log a formatted message at the specified level.
///
/// ```rust
/// use circuit_sidecar::{LogLevel, plog_fmt};
///
/// plog_fmt!(LogLevel::Info, "cache refreshed; {} circuits", 3);
/// ```
#[macro_export]
macro_rules! plog_fmt {
    ($level:expr, $($arg:tt)*) => {
        $crate::logger::plog($level, &format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syslog_writer_without_socket_swallows_output() {
        let mut writer = SyslogWriter { socket: None };
        assert_eq!(writer.write(b"hello").unwrap(), 5);
        assert!(writer.flush().is_ok());
    }

    #[test]
    fn test_plog_without_subscriber_does_not_panic() {
        plog(LogLevel::Debug, "debug");
        plog(LogLevel::Notice, "notice");
        plog_fmt!(LogLevel::Error, "{} {}", "formatted", 1);
    }
}
