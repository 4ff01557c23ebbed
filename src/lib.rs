// Clippy allows for reasonable defaults
// These suppress warnings where the suggested change doesn't improve
// readability
#![allow(clippy::new_without_default)] // Default not always appropriate for stateful types
#![allow(clippy::field_reassign_with_default)] // Builder pattern is clearer
#![allow(clippy::collapsible_if)] // Separate ifs can be more readable

// Module declarations
pub mod agents;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod file_storage;
pub mod models;
mod utils;

// Re-export the data model and the engine surface
pub use config::{ConfigManager, CoordinatorConfig, ForemanConfig};
pub use coordinator::locks::{LockAcquire, LockManager};
pub use coordinator::{Coordinator, CoordinatorError, CoordinatorHandle, CoordinatorStats};
pub use events::{CoordinatorEvent, EventBus};
pub use models::*;
