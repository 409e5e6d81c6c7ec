//! Error types for the update orchestrator.
//!
//! Subsystems carry their own error enums ([`StoreError`], [`ArtifactError`],
//! [`ModuleError`]); the orchestrator composes them into [`Error`]. Failure
//! paths frequently accumulate more than one error (an install fails, then
//! the rollback fails, then the cleanup fails) -- [`Error::followed_by`]
//! aggregates those into a single value in causal order instead of dropping
//! all but the last.

use std::fmt;

use crate::artifact::ArtifactError;
use crate::module::ModuleError;
use crate::store::StoreError;

/// Errors produced while driving an update.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Key-value store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Artifact could not be read or is malformed.
    #[error("artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    /// Failure reported by an update module verb.
    #[error("update module error: {0}")]
    Module(#[from] ModuleError),

    /// Malformed structured text in a stored value.
    #[error("could not parse stored data: {0}")]
    Parse(#[from] serde_json::Error),

    /// A stored value had an unexpected shape.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// I/O failure outside the store and artifact layers.
    #[error("{context}: {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// State record written by an incompatible client version.
    #[error("state data has a version which is not supported by this client: {version}")]
    UnsupportedVersion {
        /// The version found in the record.
        version: u64,
    },

    /// State record present but violating its schema.
    #[error("invalid state data: {0}")]
    InvalidStateData(String),

    /// Requested operation is recognized but not supported.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Another update is already in progress.
    #[error("operation in progress: {0}")]
    OperationInProgress(String),

    /// Commit or rollback invoked without an active update.
    #[error("no update in progress: {0}")]
    NoUpdateInProgress(String),

    /// Device configuration is missing or malformed.
    #[error("invalid device configuration: {0}")]
    Config(String),

    /// An impossible branch was taken. This is a bug.
    #[error("programming error: {0}")]
    Programming(String),

    /// Several errors collected along one failure path, oldest first.
    #[error("{0}")]
    Chain(ErrorChain),
}

impl Error {
    /// Wraps an I/O error with a description of what was being attempted.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Appends `next` to this error, preserving causal order.
    ///
    /// Chains flatten: `a.followed_by(b).followed_by(c)` renders as
    /// `a; followed by: b; followed by: c`.
    #[must_use]
    pub fn followed_by(self, next: Error) -> Error {
        let mut chain = match self {
            Error::Chain(ErrorChain(errors)) => errors,
            other => vec![other],
        };
        match next {
            Error::Chain(ErrorChain(errors)) => chain.extend(errors),
            other => chain.push(other),
        }
        Error::Chain(ErrorChain(chain))
    }
}

/// Appends `next` to an optional accumulated error.
pub(crate) fn follow(acc: Option<Error>, next: Error) -> Option<Error> {
    Some(match acc {
        Some(err) => err.followed_by(next),
        None => next,
    })
}

/// An ordered list of errors collected along a single failure path.
///
/// The first element is the original failure; later elements are failures
/// of the recovery steps that followed it.
#[derive(Debug)]
pub struct ErrorChain(pub(crate) Vec<Error>);

impl ErrorChain {
    /// The collected errors, oldest first.
    #[must_use]
    pub fn errors(&self) -> &[Error] {
        &self.0
    }
}

impl fmt::Display for ErrorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; followed by: ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}
