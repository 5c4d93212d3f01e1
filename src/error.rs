#![forbid(unsafe_code)]

//! Error taxonomy shared by the job pipeline.

use std::time::Duration;

use thiserror::Error;

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Error)]
pub enum JobError {
    /// Missing or malformed caller input.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Metadata lookup or media transfer failed inside the external tool.
    #[error("{context}: {source}")]
    ExternalTool {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    /// The transfer ran past the configured limit and was killed.
    #[error("download timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// Reading or writing the metadata document failed.
    #[error("{context}: {source}")]
    Persistence {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    /// A single subscriber could not be reached.
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

impl JobError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn external(context: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::ExternalTool {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn persistence(context: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Persistence {
            context: context.into(),
            source: source.into(),
        }
    }

    /// HTTP status code the API layer reports for this failure.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) => 400,
            Self::ExternalTool { .. } | Self::Timeout(_) => 502,
            Self::Persistence { .. } | Self::Delivery(_) => 500,
        }
    }

    /// Renders the error followed by every cause, one per line.
    pub fn chain(&self) -> String {
        let mut out = self.to_string();
        let mut current = std::error::Error::source(self);
        while let Some(cause) = current {
            out.push_str("\nCaused by: ");
            out.push_str(&cause.to_string());
            current = cause.source();
        }
        out
    }
}
