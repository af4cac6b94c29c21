//! Transfer task engine: task descriptors and the runner that executes them

mod runner;
mod types;
mod worker;

pub use runner::{TaskRunner, TaskSnapshot};
pub use types::{TaskDescriptor, TaskId, TaskKind, TaskStatus};
