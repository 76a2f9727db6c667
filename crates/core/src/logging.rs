//! Centralized logging configuration for the emulator.
//!
//! # Architecture
//!
//! - **LogConfig**: Thread-safe global configuration using atomic operations
//! - **LogLevel**: Hierarchical log levels (Off < Error < Warn < Info < Debug < Trace)
//! - **LogCategory**: Logging categories (CPU, Bus, PPU, Interrupts)
//! - **log()**: Common logging function for all output with async file I/O
//!
//! Levels can be set programmatically or from a filter string such as
//! `"info,cpu=trace"`, either passed to [`LogConfig::apply_filter`] or read from
//! the `PANE_LOG` environment variable by [`LogConfig::apply_env`].
//!
//! # Performance
//!
//! File output is written by a background thread fed through a channel, so
//! emulation never blocks on disk I/O. The message closure is never called
//! when its category and level are disabled.
//!
//! # Usage
//!
//! ```rust
//! use pane_core::logging::{log, LogLevel, LogCategory};
//!
//! log(LogCategory::CPU, LogLevel::Debug, || {
//!     format!("CPU: BRK at PC={:04X}", 0x1234)
//! });
//! ```

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Mutex, OnceLock};
use std::thread;

use thiserror::Error;

/// Environment variable read by [`LogConfig::apply_env`].
pub const LOG_ENV_VAR: &str = "PANE_LOG";

/// Stored in a category slot that follows the global level.
const UNSET: u8 = u8::MAX;

/// Errors from parsing a log filter string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogFilterError {
    #[error("unknown log level '{0}'")]
    UnknownLevel(String),
    #[error("unknown log category '{0}'")]
    UnknownCategory(String),
}

/// Log level for controlling verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    fn from_u8(val: u8) -> Self {
        match val {
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            5 => LogLevel::Trace,
            _ => LogLevel::Off,
        }
    }
}

impl FromStr for LogLevel {
    type Err = LogFilterError;

    /// Case-insensitive; accepts names and digits 0-5.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "off" | "0" => Ok(LogLevel::Off),
            "error" | "err" | "1" => Ok(LogLevel::Error),
            "warn" | "warning" | "2" => Ok(LogLevel::Warn),
            "info" | "3" => Ok(LogLevel::Info),
            "debug" | "4" => Ok(LogLevel::Debug),
            "trace" | "5" => Ok(LogLevel::Trace),
            _ => Err(LogFilterError::UnknownLevel(s.to_string())),
        }
    }
}

/// Log category for different emulator components
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogCategory {
    /// CPU execution (instruction trace, decode errors)
    CPU,
    /// Bus/memory (teardown, cartridge loads)
    Bus,
    /// Picture unit (frame completion)
    PPU,
    /// Interrupts (IRQ, NMI, reset, BRK)
    Interrupts,
}

impl LogCategory {
    pub const ALL: [LogCategory; 4] = [
        LogCategory::CPU,
        LogCategory::Bus,
        LogCategory::PPU,
        LogCategory::Interrupts,
    ];

    fn index(self) -> usize {
        match self {
            LogCategory::CPU => 0,
            LogCategory::Bus => 1,
            LogCategory::PPU => 2,
            LogCategory::Interrupts => 3,
        }
    }
}

impl FromStr for LogCategory {
    type Err = LogFilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cpu" => Ok(LogCategory::CPU),
            "bus" | "mem" | "memory" => Ok(LogCategory::Bus),
            "ppu" => Ok(LogCategory::PPU),
            "int" | "irq" | "interrupts" => Ok(LogCategory::Interrupts),
            _ => Err(LogFilterError::UnknownCategory(s.to_string())),
        }
    }
}

/// Global logging configuration
pub struct LogConfig {
    /// Applies to every category without a level of its own
    global_level: AtomicU8,
    category_levels: [AtomicU8; 4],
    /// Channel to the background file writer
    log_sender: Mutex<Option<Sender<String>>>,
    file_logging_enabled: AtomicBool,
}

impl LogConfig {
    /// Create a new LogConfig with all logging disabled
    fn new() -> Self {
        Self {
            global_level: AtomicU8::new(LogLevel::Off as u8),
            category_levels: [
                AtomicU8::new(UNSET),
                AtomicU8::new(UNSET),
                AtomicU8::new(UNSET),
                AtomicU8::new(UNSET),
            ],
            log_sender: Mutex::new(None),
            file_logging_enabled: AtomicBool::new(false),
        }
    }

    /// Get the global singleton instance
    pub fn global() -> &'static Self {
        static INSTANCE: OnceLock<LogConfig> = OnceLock::new();
        INSTANCE.get_or_init(LogConfig::new)
    }

    pub fn set_global_level(&self, level: LogLevel) {
        self.global_level.store(level as u8, Ordering::Relaxed);
    }

    pub fn get_global_level(&self) -> LogLevel {
        LogLevel::from_u8(self.global_level.load(Ordering::Relaxed))
    }

    pub fn set_level(&self, category: LogCategory, level: LogLevel) {
        self.category_levels[category.index()].store(level as u8, Ordering::Relaxed);
    }

    /// Make `category` follow the global level again.
    pub fn clear_level(&self, category: LogCategory) {
        self.category_levels[category.index()].store(UNSET, Ordering::Relaxed);
    }

    /// The category's own level, or `None` when it follows the global level.
    pub fn get_level(&self, category: LogCategory) -> Option<LogLevel> {
        match self.category_levels[category.index()].load(Ordering::Relaxed) {
            UNSET => None,
            val => Some(LogLevel::from_u8(val)),
        }
    }

    /// A category with its own level uses it, including Off; otherwise the
    /// global level applies.
    pub fn should_log(&self, category: LogCategory, level: LogLevel) -> bool {
        if level == LogLevel::Off {
            return false;
        }
        let limit = self
            .get_level(category)
            .unwrap_or_else(|| self.get_global_level());
        level <= limit
    }

    /// Turn all logging off and drop every category override
    pub fn reset(&self) {
        self.set_global_level(LogLevel::Off);
        for category in LogCategory::ALL {
            self.clear_level(category);
        }
    }

    /// Apply a comma-separated filter: bare entries set the global level,
    /// `category=level` entries set one category. The whole string is
    /// validated before anything is applied.
    pub fn apply_filter(&self, filter: &str) -> Result<(), LogFilterError> {
        let mut global = None;
        let mut per_category = Vec::new();

        for entry in filter.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            match entry.split_once('=') {
                Some((category, level)) => {
                    per_category.push((
                        category.parse::<LogCategory>()?,
                        level.parse::<LogLevel>()?,
                    ));
                }
                None => global = Some(entry.parse::<LogLevel>()?),
            }
        }

        if let Some(level) = global {
            self.set_global_level(level);
        }
        for (category, level) in per_category {
            self.set_level(category, level);
        }
        Ok(())
    }

    /// Apply the filter in `PANE_LOG`, if set. Returns whether it was set.
    pub fn apply_env(&self) -> Result<bool, LogFilterError> {
        match std::env::var(LOG_ENV_VAR) {
            Ok(filter) => self.apply_filter(&filter).map(|_| true),
            Err(_) => Ok(false),
        }
    }

    /// Send output to `path` (appending) through a background writer thread.
    /// Replaces any previous log file.
    pub fn set_log_file(&self, path: PathBuf) -> std::io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let (sender, receiver) = channel::<String>();

        thread::Builder::new()
            .name("log-writer".to_string())
            .spawn(move || {
                let mut file = file;
                while let Ok(message) = receiver.recv() {
                    let _ = writeln!(file, "{}", message);
                    let _ = file.flush();
                }
            })?;

        if let Ok(mut log_sender) = self.log_sender.lock() {
            *log_sender = Some(sender);
            self.file_logging_enabled.store(true, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Stop logging to file; the writer thread exits once the sender drops.
    pub fn clear_log_file(&self) {
        if let Ok(mut log_sender) = self.log_sender.lock() {
            *log_sender = None;
        }
        self.file_logging_enabled.store(false, Ordering::Relaxed);
    }

    fn write_message(&self, message: String) {
        if self.file_logging_enabled.load(Ordering::Relaxed) {
            if let Ok(log_sender) = self.log_sender.lock() {
                if let Some(sender) = log_sender.as_ref() {
                    // Falls back to stderr if the writer thread is gone.
                    if let Err(err) = sender.send(message) {
                        eprintln!("{}", err.0);
                    }
                    return;
                }
            }
        }
        eprintln!("{}", message);
    }
}

/// Log a message with the specified category and level
///
/// The message is lazily evaluated via a closure, so formatting only occurs
/// when logging is enabled for the given category and level.
///
/// ```rust
/// use pane_core::logging::{log, LogCategory, LogLevel};
///
/// log(LogCategory::Interrupts, LogLevel::Debug, || {
///     format!("CPU: NMI at PC={:04X}", 0xC000)
/// });
/// ```
pub fn log<F>(category: LogCategory, level: LogLevel, message_fn: F)
where
    F: FnOnce() -> String,
{
    let config = LogConfig::global();
    if config.should_log(category, level) {
        config.write_message(message_fn());
    }
}
