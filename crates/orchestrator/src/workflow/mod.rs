pub mod context;
pub mod engine;
pub mod graph;
pub mod progress;

pub use context::{EmployeeContext, EmployeeDirectory, InMemoryDirectory};
pub use engine::{WorkflowDetail, WorkflowEngine};
