//! Error taxonomy for the ingestion pipeline.
//!
//! Only [`IngestError::Validation`] is recovered by the orchestrator (the record
//! is skipped). [`IngestError::Conflict`] is normally absorbed inside
//! classification resolution and only escapes when the winning row cannot be
//! re-read. Everything else aborts the run.

use std::panic::Location;

use thiserror::Error;

use crate::models::ClassificationKind;

/// Per-record validation failures raised by the normalizer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("item body missing or empty")]
    MissingItem,

    #[error("mandatory external id `productid` missing")]
    MissingExternalId,
}

#[derive(Debug, Error)]
pub enum IngestError {
    /// Network failure or timeout while talking to the catalog API.
    #[error("transport error: {context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: reqwest::Error,
    },

    /// Non-success status or undecodable response body.
    #[error("payload error: {0}")]
    Payload(String),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("classification conflict on {kind} `{key}` could not be resolved by re-read")]
    Conflict {
        kind: ClassificationKind,
        key: String,
    },

    #[error("persistence error: {context}: {message} (at {location})")]
    Persistence {
        context: String,
        message: String,
        location: &'static Location<'static>,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl IngestError {
    pub fn transport(context: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Transport {
            context: context.into(),
            source,
        }
    }

    /// Wraps a storage failure, remembering the call site that raised it.
    #[track_caller]
    pub fn persistence(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Persistence {
            context: context.into(),
            message: err.to_string(),
            location: Location::caller(),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Short label used in structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::Payload(_) => "payload",
            Self::Validation(_) => "validation",
            Self::Conflict { .. } => "conflict",
            Self::Persistence { .. } => "persistence",
            Self::Config(_) => "config",
        }
    }

    /// Source file/line for persistence failures.
    pub fn location(&self) -> Option<String> {
        match self {
            Self::Persistence { location, .. } => {
                Some(format!("{}:{}", location.file(), location.line()))
            }
            _ => None,
        }
    }
}
