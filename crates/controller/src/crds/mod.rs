pub mod agent_task;
pub mod sandbox_claim;

pub use agent_task::*;
pub use sandbox_claim::*;
