use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

/// Why a collection was asked for. Carries no behavior at this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcReason {
    User,
    Oom,
    Backup,
    Heuristic,
    Young,
    Native,
    Force,
    AppSpawn,
}

impl GcReason {
    pub const ALL: [GcReason; 8] = [
        GcReason::User,
        GcReason::Oom,
        GcReason::Backup,
        GcReason::Heuristic,
        GcReason::Young,
        GcReason::Native,
        GcReason::Force,
        GcReason::AppSpawn,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for GcReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GcReason::User => "user",
            GcReason::Oom => "oom",
            GcReason::Backup => "backup",
            GcReason::Heuristic => "heuristic",
            GcReason::Young => "young",
            GcReason::Native => "native",
            GcReason::Force => "force",
            GcReason::AppSpawn => "appspawn",
        };
        f.write_str(name)
    }
}

/// The kind of collection the VM asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerGcType {
    Young,
    Old,
    Full,
    SharedGc,
    SharedFull,
    AppSpawnFull,
    AppSpawnSharedFull,
}

impl TriggerGcType {
    fn is_full(self) -> bool {
        matches!(
            self,
            TriggerGcType::Full
                | TriggerGcType::SharedFull
                | TriggerGcType::AppSpawnFull
                | TriggerGcType::AppSpawnSharedFull
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerCause {
    Other,
    AllocationFailed,
    Idle,
}

/// Whatever runs collection cycles.
pub trait CollectorDriver: Send + Sync {
    fn request_gc(&self, reason: GcReason, synchronous: bool);
}

/// Single entry point for collection requests.
pub struct HeapManager {
    enabled: AtomicBool,
    driver: Arc<dyn CollectorDriver>,
}

impl fmt::Debug for HeapManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapManager")
            .field("enabled", &self.is_gc_enabled())
            .finish_non_exhaustive()
    }
}

impl HeapManager {
    pub fn new(driver: Arc<dyn CollectorDriver>, enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            driver,
        }
    }

    pub fn is_gc_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_gc_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        log::debug!("gc {}", if enabled { "enabled" } else { "disabled" });
    }

    /// Hands the request to the driver unless collection is disabled, in
    /// which case nothing happens.
    pub fn request_gc(&self, reason: GcReason, synchronous: bool) {
        if !self.is_gc_enabled() {
            log::trace!("gc disabled, dropping {reason} request");
            return;
        }
        self.driver.request_gc(reason, synchronous);
    }

    /// VM-level trigger. Full collections and allocation failures block the
    /// caller; everything else is a background user request.
    pub fn collect_garbage(&self, gc_type: TriggerGcType, cause: TriggerCause) {
        if gc_type.is_full() || cause == TriggerCause::AllocationFailed {
            self.request_gc(GcReason::Backup, true);
        } else {
            self.request_gc(GcReason::User, false);
        }
    }
}
