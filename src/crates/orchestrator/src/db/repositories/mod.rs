//! Repository pattern implementations for database access

pub mod automation_repo;
pub mod checkpoint_repo;
pub mod preference_repo;
pub mod task_repo;

pub use automation_repo::AutomationRepository;
pub use checkpoint_repo::CheckpointRepository;
pub use preference_repo::PreferenceRepository;
pub use task_repo::TaskRepository;
