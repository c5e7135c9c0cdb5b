use std::fmt;

use thiserror::Error;

/// Rejected runtime configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("worker_threads must be > 0")]
    NoWorkers,
    #[error("worker_threads must be at most {max}, got {requested}")]
    TooManyWorkers { requested: usize, max: usize },
    #[error("batch_bytes must be > 0")]
    EmptyBatch,
}

/// Terminates the process after a coordination protocol violation.
///
/// A violated protocol means the heap can no longer be trusted, so this
/// aborts instead of unwinding: `catch_unwind` cannot recover from it.
#[cold]
#[inline(never)]
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    log::error!("fatal: {args}");
    eprintln!("gc_sync fatal: {args}");
    std::process::abort()
}

/// `fatal!("...", args)` formats a diagnostic and aborts.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::fatal(format_args!($($arg)*))
    };
}
