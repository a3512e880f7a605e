//! Leveled stderr logging with macros.

use std::fmt::Display;
use std::io::Write;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

/// Log level for filtering messages.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Level::Info => write!(f, "INFO"),
            Level::Warn => write!(f, "WARN"),
            Level::Error => write!(f, "ERROR"),
        }
    }
}

/// Internal logging function. Use the `info!`, `warn!`, or `error!` macros instead.
#[doc(hidden)]
pub fn log(level: Level, message: &str) {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = now.as_secs();
    let hours = (secs / 3600) % 24;
    let mins = (secs / 60) % 60;
    let s = secs % 60;
    let millis = now.subsec_millis();

    let mut stderr = StandardStream::stderr(ColorChoice::Auto);
    let mut spec = ColorSpec::new();
    match level {
        Level::Warn => {
            spec.set_fg(Some(Color::Yellow)).set_bold(true);
        }
        Level::Error => {
            spec.set_fg(Some(Color::Red)).set_bold(true);
        }
        Level::Info => {
            spec.clear();
        }
    }
    let _ = stderr.set_color(&spec);
    let _ = write!(stderr, "{:02}:{:02}:{:02}.{:03} ", hours, mins, s, millis);
    let _ = write!(stderr, "[{:5}] ", level);
    let _ = writeln!(stderr, "{}", message);
    let _ = stderr.reset();
}

/// Logs an info-level message.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {{
        if cfg!(not(test)) {
            $crate::utils::log::log($crate::utils::log::Level::Info, &format!($($arg)*));
        }
    }};
}

/// Logs a warning-level message.
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {{
        if cfg!(not(test)) {
            $crate::utils::log::log($crate::utils::log::Level::Warn, &format!($($arg)*));
        }
    }};
}

/// Logs an error-level message.
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {{
        if cfg!(not(test)) {
            $crate::utils::log::log($crate::utils::log::Level::Error, &format!($($arg)*));
        }
    }};
}
