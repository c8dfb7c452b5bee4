use std::backtrace::{Backtrace, BacktraceStatus};
use std::io::{self, Write};
use std::panic::PanicHookInfo;
use std::sync::{Once, OnceLock};

use cdc_config::Environment;
use thiserror::Error;
use tracing::subscriber::{SetGlobalDefaultError, set_global_default};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{self, InitError};
use tracing_log::{LogTracer, log_tracer::SetLoggerError};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, FmtSubscriber, Registry, fmt, layer::SubscriberExt};

/// JSON field carrying the run identifier in production logs.
const RUN_ID_KEY_IN_LOG: &str = "run_id";

/// JSON field carrying the warehouse project in production logs.
const PROJECT_KEY_IN_LOG: &str = "project";

/// Directory receiving production log files.
const LOG_DIR: &str = "logs";

/// Number of daily log files kept on disk.
const MAX_LOG_FILES: usize = 5;

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to build rolling file appender: {0}")]
    InitAppender(#[from] InitError),

    #[error("failed to init log tracer: {0}")]
    InitLogTracer(#[from] SetLoggerError),

    #[error("failed to set global default subscriber: {0}")]
    SetGlobalDefault(#[from] SetGlobalDefaultError),

    #[error("an io error occurred: {0}")]
    Io(#[from] io::Error),
}

/// Keeps buffered log lines alive until the process exits.
///
/// Production logging writes through a background worker which flushes when the guard drops,
/// so the value returned by [`init_tracing`] must be held for the lifetime of `main`.
#[must_use]
pub enum LogFlusher {
    Flusher(WorkerGuard),
    NullFlusher,
}

/// Identifiers injected into every production log line.
#[derive(Debug, Clone, Default)]
pub struct TopLevelFields {
    pub run_id: Option<String>,
    pub project: Option<String>,
}

static TOP_LEVEL_FIELDS: OnceLock<TopLevelFields> = OnceLock::new();

static INIT_TEST_TRACING: Once = Once::new();

/// Initializes tracing for tests when `ENABLE_TRACING` is set.
///
/// ENABLE_TRACING=1 cargo test <test_name>
pub fn init_test_tracing() {
    INIT_TEST_TRACING.call_once(|| {
        if std::env::var("ENABLE_TRACING").is_ok() {
            // Production logs go to files, tests want the terminal.
            Environment::Dev.set();
            let _log_flusher =
                init_tracing("test").expect("Failed to initialize tracing for tests");
        }
    });
}

/// Initializes tracing for the application.
pub fn init_tracing(app_name: &str) -> Result<LogFlusher, TracingError> {
    init_tracing_with_top_level_fields(app_name, TopLevelFields::default())
}

/// Initializes tracing and injects `fields` into every JSON log line.
///
/// `RUST_LOG` selects the filter, defaulting to `info`. Production writes JSON to daily rotated
/// files under `logs/`, development pretty-prints to the terminal.
pub fn init_tracing_with_top_level_fields(
    app_name: &str,
    fields: TopLevelFields,
) -> Result<LogFlusher, TracingError> {
    let _ = TOP_LEVEL_FIELDS.set(fields);

    LogTracer::init()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_flusher = if Environment::load()?.is_prod() {
        configure_prod_tracing(filter, app_name)?
    } else {
        configure_dev_tracing(filter)?
    };

    set_tracing_panic_hook();

    Ok(log_flusher)
}

fn configure_prod_tracing(filter: EnvFilter, app_name: &str) -> Result<LogFlusher, TracingError> {
    let file_appender = rolling::Builder::new()
        .filename_prefix(app_name)
        .filename_suffix("log")
        .rotation(rolling::Rotation::DAILY)
        .max_log_files(MAX_LOG_FILES)
        .build(LOG_DIR)?;

    let (file_appender, guard) = tracing_appender::non_blocking(file_appender);

    let format = fmt::format()
        .with_level(true)
        .with_ansi(false)
        .with_target(false);

    let subscriber = Registry::default().with(filter).with(
        fmt::layer()
            .event_format(format)
            .with_writer(move || FieldInjectingWriter::new(file_appender.make_writer()))
            .json()
            .with_current_span(true)
            .with_span_list(true),
    );

    set_global_default(subscriber)?;

    Ok(LogFlusher::Flusher(guard))
}

fn configure_dev_tracing(filter: EnvFilter) -> Result<LogFlusher, TracingError> {
    let format = fmt::format()
        .with_level(true)
        .with_ansi(true)
        .pretty()
        .with_line_number(false)
        .with_file(false)
        .with_target(true);

    let subscriber = FmtSubscriber::builder()
        .event_format(format)
        .with_env_filter(filter)
        .finish();

    set_global_default(subscriber)?;

    Ok(LogFlusher::NullFlusher)
}

/// Adds the [`TopLevelFields`] to JSON log lines that do not carry them yet.
struct FieldInjectingWriter<W> {
    inner: W,
}

impl<W> FieldInjectingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Write for FieldInjectingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match inject_fields(buf, TOP_LEVEL_FIELDS.get()) {
            Some(output) => self.inner.write_all(output.as_bytes()).map(|_| buf.len()),
            None => self.inner.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Returns the rewritten line, or `None` when nothing had to be injected.
fn inject_fields(buf: &[u8], fields: Option<&TopLevelFields>) -> Option<String> {
    let fields = fields?;
    let line = std::str::from_utf8(buf).ok()?;
    let serde_json::Value::Object(mut map) = serde_json::from_str::<serde_json::Value>(line).ok()?
    else {
        return None;
    };

    let mut modified = false;
    for (key, value) in [
        (RUN_ID_KEY_IN_LOG, &fields.run_id),
        (PROJECT_KEY_IN_LOG, &fields.project),
    ] {
        if let Some(value) = value
            && !map.contains_key(key)
        {
            map.insert(key.to_string(), serde_json::Value::String(value.clone()));
            modified = true;
        }
    }

    if !modified {
        return None;
    }

    let rendered = serde_json::to_string(&map).ok()?;
    if line.ends_with('\n') {
        Some(format!("{rendered}\n"))
    } else {
        Some(rendered)
    }
}

/// Routes panics through `tracing` before running the previous hook.
fn set_tracing_panic_hook() {
    let prev_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        panic_hook(info);
        prev_hook(info);
    }));
}

fn panic_hook(panic_info: &PanicHookInfo) {
    let backtrace = Backtrace::capture();
    let (backtrace, note) = match backtrace.status() {
        BacktraceStatus::Captured => (Some(backtrace), None),
        BacktraceStatus::Disabled => (
            None,
            Some("run with RUST_BACKTRACE=1 to display backtraces"),
        ),
        _ => (None, Some("backtraces are not available on this platform")),
    };

    let payload = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
        s
    } else {
        "unknown panic payload"
    };

    let location = panic_info.location().map(|location| location.to_string());

    tracing::error!(
        panic.payload = payload,
        panic.location = location,
        panic.backtrace = backtrace.map(tracing::field::display),
        panic.note = note,
        "a panic occurred",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> TopLevelFields {
        TopLevelFields {
            run_id: Some("run-1".to_string()),
            project: None,
        }
    }

    #[test]
    fn injects_missing_fields_and_keeps_newline() {
        let output = inject_fields(b"{\"message\":\"hi\"}\n", Some(&fields())).unwrap();

        assert!(output.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(output.trim_end()).unwrap();
        assert_eq!(value["run_id"], "run-1");
        assert!(value.get("project").is_none());
    }

    #[test]
    fn leaves_existing_fields_and_non_json_untouched() {
        assert!(inject_fields(b"{\"run_id\":\"other\"}", Some(&fields())).is_none());
        assert!(inject_fields(b"plain text", Some(&fields())).is_none());
        assert!(inject_fields(b"{}", None).is_none());
    }
}
