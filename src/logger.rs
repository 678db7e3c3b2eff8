//! Session logger: engine output goes to one file in the OS data directory.
//!
//! The file is **truncated at each launch**, so it only holds the
//! most-recent session.
//!
//! Log location:
//!   Windows:  `%APPDATA%\LumaEdit\lumaedit.log`
//!   Linux:    `$XDG_DATA_HOME/LumaEdit/lumaedit.log` (else `~/.local/share/...`)
//!   macOS:    `~/Library/Application Support/LumaEdit/lumaedit.log`
//!
//! Use the `log_info!` / `log_warn!` / `log_err!` / `log_debug!` macros
//! anywhere in the crate.  Before [`init`] they are no-ops (unless stderr
//! echo was switched on), so library users and unit tests need no setup.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    fn from_u8(v: u8) -> Level {
        match v {
            0 => Level::Debug,
            1 => Level::Info,
            2 => Level::Warn,
            _ => Level::Error,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        })
    }
}

struct Sink {
    file: File,
    path: PathBuf,
}

static SINK: OnceLock<Mutex<Sink>> = OnceLock::new();
static ECHO: AtomicBool = AtomicBool::new(false);
static MIN_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);

/// Path of the current session log, once [`init`] succeeded.
pub fn log_path() -> Option<PathBuf> {
    let sink = SINK.get()?.lock().ok()?;
    Some(sink.path.clone())
}

/// Mirror log lines to stderr (CLI `--verbose`).
pub fn set_echo(enabled: bool) {
    ECHO.store(enabled, Ordering::Relaxed);
}

/// Drop messages below `level`.  Defaults to [`Level::Info`].
pub fn set_level(level: Level) {
    MIN_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn enabled(level: Level) -> bool {
    level >= Level::from_u8(MIN_LEVEL.load(Ordering::Relaxed))
        && (SINK.get().is_some() || ECHO.load(Ordering::Relaxed))
}

fn emit(line: &str) {
    if ECHO.load(Ordering::Relaxed) {
        eprintln!("{}", line);
    }
    // I/O errors are swallowed: logging never fails an edit.
    if let Some(mutex) = SINK.get()
        && let Ok(mut sink) = mutex.lock()
    {
        let _ = writeln!(sink.file, "{}", line);
    }
}

/// Write a timestamped, level-tagged line.
pub fn write(level: Level, msg: fmt::Arguments<'_>) {
    if enabled(level) {
        emit(&format!("[{}] [{}] {}", timestamp(), level, msg));
    }
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logger::write($crate::logger::Level::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logger::write($crate::logger::Level::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_err {
    ($($arg:tt)*) => {
        $crate::logger::write($crate::logger::Level::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logger::write($crate::logger::Level::Debug, format_args!($($arg)*))
    };
}

/// Start the session log at the default location.
pub fn init() {
    init_at(&data_dir().join("LumaEdit").join("lumaedit.log"));
}

/// Start the session log at `path`.
///
/// * Creates (or truncates) the file.
/// * Installs a panic hook that records the panic before handing over to
///   the previous hook.
///
/// Only the first successful call takes effect.
pub fn init_at(path: &Path) {
    if SINK.get().is_some() {
        return;
    }
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }

    let file = match OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
    {
        Ok(f) => f,
        Err(e) => {
            eprintln!("[logger] Failed to open log file {}: {}", path.display(), e);
            return;
        }
    };
    let _ = SINK.set(Mutex::new(Sink {
        file,
        path: path.to_path_buf(),
    }));

    emit(&format!(
        "=== LumaEdit {} session started (unix {}) ===",
        env!("CARGO_PKG_VERSION"),
        unix_seconds().unwrap_or_default()
    ));
    emit(&format!("Log file: {}", path.display()));
    emit("");

    // Worker panics are caught by the task runner; the hook still sees them.
    let prev = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        emit(&format!("[{}] [PANIC] {}", timestamp(), info));
        prev(info);
    }));
}

/// Platform data directory (without the app sub-folder).
fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata);
        }
    }
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join("Library").join("Application Support");
        }
    }
    std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local").join("share")))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn unix_seconds() -> Option<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs())
}

/// HH:MM:SS.mmm within the current UTC day.
fn timestamp() -> String {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => {
            let secs = d.as_secs();
            format!(
                "{:02}:{:02}:{:02}.{:03}",
                (secs % 86400) / 3600,
                (secs % 3600) / 60,
                secs % 60,
                d.subsec_millis()
            )
        }
        Err(_) => "??:??:??".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered() {
        assert!(Level::Debug < Level::Info);
        assert!(Level::Warn < Level::Error);
        for level in [Level::Debug, Level::Info, Level::Warn, Level::Error] {
            assert_eq!(Level::from_u8(level as u8), level);
        }
        assert_eq!(Level::Warn.to_string(), "WARN");
    }

    #[test]
    fn timestamp_shape() {
        let ts = timestamp();
        assert_eq!(ts.len(), 12);
        assert_eq!(&ts[2..3], ":");
        assert_eq!(&ts[8..9], ".");
    }
}
