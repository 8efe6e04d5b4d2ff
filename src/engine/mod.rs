//! Invocation of external recognition tools.

pub mod container;
pub mod process;
pub mod types;

pub use container::ContainerInvocation;
pub use process::run_tool;
pub use types::{ScriptDirection, TextEquivLevel};
