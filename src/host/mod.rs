//! Script-side implementations of [`ScriptRuntime`](crate::runtime::ScriptRuntime)

pub mod memory;

pub use memory::{HostMetrics, MemoryFile, MemoryHostConfig, MemoryScriptHost};
