// Worker agent pool membership and assignment bookkeeping

pub mod registry;

// Re-export for convenience
pub use registry::{AgentRegistry, Assignment, RegisteredAgent};
