pub mod backoff;
pub mod conflict;
pub mod engine;
pub mod queue;

pub use conflict::{ConflictDecision, ConflictResolver};
pub use engine::{EngineError, SyncEngine, SyncPhase, SyncReport};
pub use queue::{DurableQueue, OperationType, Priority, QueueError, QueueStats, SyncOperation};
