//! Host resource sampling and governed execution.

pub mod isolate;
pub mod sample;
pub mod sampler;
pub mod supervisor;

pub use isolate::{IsolatedProcess, WorkerReply, write_reply};
pub use sample::{
    DiskUsage, MemoryUsage, ProcessFilter, ProcessInfo, ResourceProbe, ResourceSample, SystemProbe,
};
pub use sampler::ResourceSampler;
pub use supervisor::{BreachHooks, GovernedWork, ResourceSupervisor, required_headroom};
