use std::{num::NonZeroUsize, thread};

use crate::SettingsError;

/// Upper bound on collector worker threads.
pub const MAX_WORKER_THREADS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    /// Collector worker threads in the task pool.
    pub worker_threads: usize,
    /// Bytes per dispatcher batch during parallel phases (typ. 32KB).
    pub batch_bytes: usize,
    /// Whether `request_gc` reaches the collector at startup.
    pub gc_enabled: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        let cores =
            thread::available_parallelism().map_or(1, NonZeroUsize::get);
        Self {
            // leave a core for the mutators
            worker_threads: cores.saturating_sub(1).clamp(1, 8),
            batch_bytes: 32_768,
            gc_enabled: true,
        }
    }
}

impl RuntimeSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.worker_threads == 0 {
            return Err(SettingsError::NoWorkers);
        }
        if self.worker_threads > MAX_WORKER_THREADS {
            return Err(SettingsError::TooManyWorkers {
                requested: self.worker_threads,
                max: MAX_WORKER_THREADS,
            });
        }
        if self.batch_bytes == 0 {
            return Err(SettingsError::EmptyBatch);
        }
        Ok(())
    }
}
