mod migration;
mod workflow;

pub use migration::{CURRENT_VERSION, LEGACY_VERSION, MigrationRegistry, stored_version};
pub use workflow::{
    Checkpoint, MigrationProgress, STATE_FILE, Stage, TaskRecord, WorkflowState,
    WorkflowStateManager, validate_state,
};
