mod error;

mod barrier;
mod collector;
mod dispatcher;
mod evacuate;
mod heap_manager;
mod mutator;
mod object;
mod registry;
mod runtime;
mod settings;
pub mod sync;
mod taskpool;

pub use barrier::SuspendBarrier;
pub use collector::{CollectionContext, Collector, GcPhase, GcStats};
pub use dispatcher::{ArrayTaskDispatcher, BatchConsumer};
pub use error::{SettingsError, fatal};
pub use evacuate::{EvacuationStats, ObjectSpace};
pub use heap_manager::{
    CollectorDriver, GcReason, HeapManager, TriggerCause, TriggerGcType,
};
pub use mutator::{
    Mutator, MutatorFlags, MutatorId, MutatorState, NativeScope, ThreadState,
};
pub use object::{
    ForwardState, ObjectHeader, Resolved, ScopedObjectLock, StateWord,
};
pub use registry::{MutatorRegistry, SuspendScope};
pub use runtime::{Runtime, RuntimeCreateInfo, RuntimeProxy, RuntimeShared};
pub use settings::{MAX_WORKER_THREADS, RuntimeSettings};
pub use taskpool::{
    Task, TaskContext, TaskId, TaskPool, TaskPoolCreateInfo, WorkerHook,
    WorkerId, current_worker,
};
