//! File logging for keel.
//!
//! Log levels:
//! - ERROR: Storage failures and phases that abort a run
//! - WARN: Soft signals (stalls, plateaus) and rejected inputs
//! - INFO: Run-level notifications (plan executing, run finished)
//! - DEBUG: Component lifecycle (monitor start/stop, checkpoint upserts)
//! - TRACE: Per-sweep and per-sample internals
//!
//! Debug mode can be enabled with `--debug` flag or `KEEL_DEBUG=1` env var.
//! Until a sink is installed every log call is a no-op, so the library costs
//! nothing for embedders that never call [`init`].

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

static SINK: Mutex<Option<File>> = Mutex::new(None);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

/// Log to `~/.keel/keel.log` at INFO (DEBUG if `KEEL_DEBUG` is set).
pub fn init() {
    init_with_debug(false);
}

/// Log to `~/.keel/keel.log`, truncating it. `debug` or `KEEL_DEBUG=1`
/// lowers the level to DEBUG.
pub fn init_with_debug(debug: bool) {
    let env_debug = std::env::var("KEEL_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let level = if debug || env_debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // A missing home directory or unwritable log leaves logging disabled.
    if let Some(keel_dir) = dirs::home_dir().map(|h| h.join(".keel")) {
        if std::fs::create_dir_all(&keel_dir).is_ok() {
            let _ = init_at(&keel_dir.join("keel.log"), level);
        }
    }
}

/// Log to an explicit file, truncating it.
pub fn init_at(path: &Path, level: LogLevel) -> std::io::Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    if let Ok(mut sink) = SINK.lock() {
        *sink = Some(file);
    }
    set_level(level);
    Ok(())
}

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

pub fn level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

fn format_line(level: LogLevel, msg: &str) -> String {
    format!(
        "[{}] [{}] {}",
        chrono::Local::now().format("%H:%M:%S%.3f"),
        level.as_str(),
        msg
    )
}

pub fn log_at(level: LogLevel, msg: &str) {
    if level > self::level() {
        return;
    }
    // Lines are written under the lock so concurrent tasks never interleave.
    if let Ok(mut sink) = SINK.lock() {
        if let Some(file) = sink.as_mut() {
            let _ = writeln!(file, "{}", format_line(level, msg));
        }
    }
}

pub fn error(msg: &str) {
    log_at(LogLevel::Error, msg);
}

pub fn warn(msg: &str) {
    log_at(LogLevel::Warn, msg);
}

pub fn info(msg: &str) {
    log_at(LogLevel::Info, msg);
}

pub fn debug(msg: &str) {
    log_at(LogLevel::Debug, msg);
}

pub fn trace(msg: &str) {
    log_at(LogLevel::Trace, msg);
}

/// Log at INFO.
#[macro_export]
macro_rules! klog {
    ($($arg:tt)*) => {
        $crate::log::info(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_error {
    ($($arg:tt)*) => {
        $crate::log::error(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_warn {
    ($($arg:tt)*) => {
        $crate::log::warn(&format!($($arg)*))
    };
}

/// Log at DEBUG (only written in debug mode).
#[macro_export]
macro_rules! klog_debug {
    ($($arg:tt)*) => {
        $crate::log::debug(&format!($($arg)*))
    };
}

/// Log at TRACE (only written when the level is raised to TRACE).
#[macro_export]
macro_rules! klog_trace {
    ($($arg:tt)*) => {
        $crate::log::trace(&format!($($arg)*))
    };
}
