mod orchestrator;
mod state;

pub use orchestrator::{
    AUTHENTICATION_REQUIRED, CANCELLED_BY_USER, MigrationError, MigrationOrchestrator,
    RollbackReport,
};
pub use state::{
    MigrationItemKind, MigrationStage, MigrationState, MigrationStateStore, MigrationStatus,
};
