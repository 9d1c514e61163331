//! File logging for ralph.
//!
//! Every process appends to `~/.ralph/ralph.log`. Several processes can share
//! the file (a `cancel` or `status` next to a running wave), so each line
//! carries the writer's pid:
//!
//! ```text
//! [14:03:11.482] [41233] [INFO] Wave wave-1a2b3c4d start: 8 tasks in 3 layers
//! ```
//!
//! Only commands that drive a wave start a fresh file.
//!
//! Levels:
//! - ERROR: a wave or worker could not continue
//! - WARN: retained workspaces, tracker sync failures, teardown problems
//! - INFO: wave, batch and attempt lifecycle, lease reclaims, cancellation
//! - DEBUG: git, lease and HTTP traces (`--debug` or `RALPH_DEBUG=1`)
//! - TRACE: everything (`RALPH_LOG=trace`)

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
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

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level {:?}", other)),
        }
    }
}

/// Whether `init` starts a fresh log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    /// Start over; used by commands that drive a wave.
    Truncate,
    /// Add to whatever is there.
    Append,
}

/// Level from the `--debug` flag and environment. `RALPH_LOG` wins over
/// `RALPH_DEBUG`, which wins over the flag's absence.
fn resolve_level(debug: bool, env_debug: Option<&str>, env_level: Option<&str>) -> LogLevel {
    if let Some(level) = env_level.and_then(|v| v.parse().ok()) {
        return level;
    }
    let env_debug = env_debug
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if debug || env_debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// Initialize logging to `~/.ralph/ralph.log`.
pub fn init(debug: bool, mode: LogMode) {
    let env_debug = std::env::var("RALPH_DEBUG").ok();
    let env_level = std::env::var("RALPH_LOG").ok();
    let level = resolve_level(debug, env_debug.as_deref(), env_level.as_deref());

    if let Some(path) = dirs::home_dir().map(|h| h.join(".ralph").join("ralph.log")) {
        init_at(&path, level, mode);
    }
}

/// Initialize logging to an explicit file.
pub fn init_at(path: &Path, level: LogLevel, mode: LogMode) {
    set_level(level);
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if mode == LogMode::Truncate {
        let _ = std::fs::write(path, "");
    }
    LOG_PATH.set(path.to_path_buf()).ok();
}

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

pub fn get_level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

fn format_line(level: LogLevel, msg: &str) -> String {
    format!(
        "[{}] [{}] [{}] {}",
        chrono::Local::now().format("%H:%M:%S%.3f"),
        std::process::id(),
        level.as_str(),
        msg
    )
}

/// Log a message at the specified level.
///
/// Messages are dropped until a log path is set, so library users and tests
/// never touch the filesystem unless they opt in.
pub fn log_at(level: LogLevel, msg: &str) {
    if level > get_level() {
        return;
    }
    if let Some(path) = LOG_PATH.get() {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
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

/// INFO.
#[macro_export]
macro_rules! rlog {
    ($($arg:tt)*) => {
        $crate::log::info(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! rlog_error {
    ($($arg:tt)*) => {
        $crate::log::error(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! rlog_warn {
    ($($arg:tt)*) => {
        $crate::log::warn(&format!($($arg)*))
    };
}

/// DEBUG; dropped unless debug logging is on.
#[macro_export]
macro_rules! rlog_debug {
    ($($arg:tt)*) => {
        $crate::log::debug(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! rlog_trace {
    ($($arg:tt)*) => {
        $crate::log::trace(&format!($($arg)*))
    };
}
