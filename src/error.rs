use std::fmt;

use thiserror::Error;

/// Pipeline stage a remote failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Discovery,
    Catalog,
    Fetch,
}

impl Stage {
    /// Label value used in self-metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Catalog => "catalog",
            Self::Fetch => "fetch",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the monitor pipeline.
///
/// Configuration variants are fatal at startup. `Remote` and `Cancelled`
/// only end the affected job's contribution to one scrape.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("unknown service type {0:?}")]
    UnknownService(String),

    #[error("invalid dimension pattern {pattern:?} for {namespace}: {source}")]
    InvalidPattern {
        namespace: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid search tag filter {key}={value:?}: {source}")]
    InvalidTagFilter {
        key: String,
        value: String,
        #[source]
        source: regex::Error,
    },

    #[error("{stage} failed for job {job}")]
    Remote {
        job: String,
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },

    #[error("{stage} task for job {job} did not complete")]
    Cancelled {
        job: String,
        stage: Stage,
        #[source]
        source: tokio::task::JoinError,
    },
}

impl MonitorError {
    pub fn remote(job: &str, stage: Stage, source: anyhow::Error) -> Self {
        Self::Remote {
            job: job.to_string(),
            stage,
            source,
        }
    }

    pub fn cancelled(job: &str, stage: Stage, source: tokio::task::JoinError) -> Self {
        Self::Cancelled {
            job: job.to_string(),
            stage,
            source,
        }
    }

    /// Stage of a per-job failure, if this is one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Remote { stage, .. } | Self::Cancelled { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
