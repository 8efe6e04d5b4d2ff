use crate::util::format_bytes;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A resource ceiling was (or would be) crossed. Always fatal to the batch.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResourceExceeded {
    #[error(
        "not enough disk space on {}: need {}, free {} of {}",
        path.display(),
        format_bytes(*bytes_needed),
        format_bytes(*bytes_free),
        format_bytes(*bytes_total)
    )]
    NotEnoughDiskSpace {
        path: PathBuf,
        bytes_needed: u64,
        bytes_free: u64,
        bytes_total: u64,
    },
    #[error(
        "virtual memory exceeded: {percent:.1}% used ({} used, {} free, {} total)",
        format_bytes(*used),
        format_bytes(*free),
        format_bytes(*total)
    )]
    VirtualMemoryExceeded {
        used: u64,
        free: u64,
        total: u64,
        percent: f64,
    },
}

/// Failure of a single step for a single page. Caught at the job boundary.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("step {step} failed: {message}")]
    Failed { step: String, message: String },
    #[error("step {step} timed out after {seconds}s")]
    Timeout { step: String, seconds: u64 },
    #[error("scoring service unavailable at {url}: {message}")]
    ServiceUnavailable { url: String, message: String },
}

impl StepError {
    pub fn failed(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            step: step.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Parallel,
    Sequential,
}

impl ExecutionMode {
    pub fn for_workers(workers: usize) -> Self {
        if workers > 1 {
            Self::Parallel
        } else {
            Self::Sequential
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parallel => f.write_str("parallel"),
            Self::Sequential => f.write_str("sequential"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    ResourceExceeded(#[from] ResourceExceeded),
    #[error(transparent)]
    Step(#[from] StepError),
    #[error("{context}: {source}")]
    Infrastructure {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{mode} batch failed: {source}")]
    Batch {
        mode: ExecutionMode,
        #[source]
        source: Box<Error>,
    },
    #[error("isolated worker failed: {0}")]
    Isolation(String),
}

impl Error {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Infrastructure {
            context: context.into(),
            source,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Step failures and scoring outages only cost the page they happened on.
    pub fn is_job_recoverable(&self) -> bool {
        matches!(self, Error::Step(_))
    }

    pub fn resource_exceeded(&self) -> Option<&ResourceExceeded> {
        match self {
            Error::ResourceExceeded(r) => Some(r),
            Error::Batch { source, .. } => source.resource_exceeded(),
            _ => None,
        }
    }
}
