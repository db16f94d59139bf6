//! Structured logging for debugging maestro.
//!
//! Events are written with the `tracing` macros and collected in
//! `~/.maestro/maestro.log`, truncated at startup so terminal output stays
//! reserved for the run summary.
//!
//! Log levels:
//! - WARN: failed attempts, retries, abandoned invocations
//! - INFO: run and task lifecycle
//! - DEBUG: dispatch detail, config and definition loading
//! - TRACE: individual context writes
//!
//! Debug mode can be enabled with the `--debug` flag or `MAESTRO_DEBUG=1`.
//! `RUST_LOG` overrides both.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Initialize logging to ~/.maestro/maestro.log with explicit debug mode.
///
/// Only the first call installs a subscriber; later calls are ignored.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_debug();
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let Some(path) = dirs::home_dir().map(|h| h.join(".maestro").join("maestro.log")) else {
        return;
    };
    if let Some(dir) = path.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    // Truncate file on startup
    let Ok(file) = File::create(&path) else {
        return;
    };
    LOG_PATH.set(path).ok();

    tracing_subscriber::registry()
        .with(filter(debug_enabled))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .ok();
}

fn env_debug() -> bool {
    std::env::var("MAESTRO_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn default_level(debug: bool) -> Level {
    if debug {
        Level::DEBUG
    } else {
        Level::INFO
    }
}

fn filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level(debug).as_str()))
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Path of the log file, once logging is initialized.
pub fn log_path() -> Option<&'static PathBuf> {
    LOG_PATH.get()
}
