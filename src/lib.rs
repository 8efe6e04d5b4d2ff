pub mod batch;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod job;
pub mod pipeline;
pub mod postprocess;
pub mod probe;
pub mod report;
pub mod resources;
pub mod scoring;
pub mod util;
pub mod workflow;
