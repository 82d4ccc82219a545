// SPDX-License-Identifier: Apache-2.0

//! Orchestrator error type.
//!
//! Every failure carries an [`ErrorKind`] so that callers can classify it
//! without parsing messages. Wrapping an error with operation context via
//! [`OrchestratorError::wrap`] preserves the kind; only the message gains the
//! session name and operation. Agent-reported errors are surfaced verbatim.

use std::fmt;

use crate::datamodel::{BrickHostName, PoolName, SessionActionType, SessionName};

/// Categorizes errors into a fixed set of standard kinds.
///
/// Consumers inspect the kind to decide what action to take; only
/// [`ErrorKind::Conflict`] is ever retried internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Pool unknown, empty name, or malformed volume request.
    InvalidSession,
    /// The pool cannot supply the requested number of bricks.
    InsufficientCapacity,
    /// Transport or consensus failure of the registry.
    RegistryUnavailable,
    /// A registry mutex was not acquired before the deadline.
    LockTimeout,
    /// Optimistic update rejected because the revision was stale.
    Conflict,
    /// The primary brick host has no live lease in the registry.
    HostUnreachable,
    /// A brick-host agent returned an error on an action.
    AgentFailure,
    /// The caller's context was cancelled.
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidSession => "InvalidSession",
            ErrorKind::InsufficientCapacity => "InsufficientCapacity",
            ErrorKind::RegistryUnavailable => "RegistryUnavailable",
            ErrorKind::LockTimeout => "LockTimeout",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::HostUnreachable => "HostUnreachable",
            ErrorKind::AgentFailure => "AgentFailure",
            ErrorKind::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

/// The error type returned by every fallible orchestrator operation.
#[derive(Debug)]
pub struct OrchestratorError {
    kind: ErrorKind,
    message: String,
    source: Option<anyhow::Error>,
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

impl OrchestratorError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(kind: ErrorKind, message: impl Into<String>, source: anyhow::Error) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Add operation context without changing the kind.
    pub fn wrap(self, operation: &str, session: &SessionName) -> Self {
        Self {
            kind: self.kind,
            message: format!("{operation} failed for session {session}: {}", self.message),
            source: self.source,
        }
    }

    pub fn invalid_session(session: &SessionName, reason: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::InvalidSession,
            format!("session {session}: {}", reason.into()),
        )
    }

    pub fn insufficient_capacity(pool: &PoolName, required: usize, available: usize) -> Self {
        Self::new(
            ErrorKind::InsufficientCapacity,
            format!("pool {pool} cannot supply {required} bricks, {available} available"),
        )
    }

    pub fn registry(source: anyhow::Error) -> Self {
        Self::with_source(ErrorKind::RegistryUnavailable, source.to_string(), source)
    }

    pub fn lock_timeout(name: impl fmt::Display) -> Self {
        Self::new(ErrorKind::LockTimeout, format!("mutex {name} not acquired"))
    }

    pub fn conflict(session: &SessionName) -> Self {
        Self::new(
            ErrorKind::Conflict,
            format!("stale revision for session {session}"),
        )
    }

    pub fn host_unreachable(host: &BrickHostName) -> Self {
        Self::new(
            ErrorKind::HostUnreachable,
            format!("brick host {host} has no live lease"),
        )
    }

    /// The agent-reported message is passed through unchanged.
    pub fn agent_failure(
        session: &SessionName,
        action: SessionActionType,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorKind::AgentFailure,
            format!("{action} on session {session}: {}", message.into()),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "operation cancelled")
    }

    pub fn is_conflict(&self) -> bool {
        self.kind == ErrorKind::Conflict
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for OrchestratorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| &**e as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_preserves_kind() {
        let name = SessionName::from("job42");
        let err = OrchestratorError::conflict(&name).wrap("update", &name);
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.to_string().contains("update failed for session job42"));
    }

    #[test]
    fn registry_errors_keep_their_cause() {
        let err = OrchestratorError::registry(anyhow::anyhow!("connection refused"));
        assert_eq!(err.kind(), ErrorKind::RegistryUnavailable);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn agent_failure_is_verbatim() {
        let name = SessionName::from("job42");
        let err = OrchestratorError::agent_failure(
            &name,
            SessionActionType::Mount,
            "mount.lustre exited 2",
        );
        assert!(err.to_string().contains("mount.lustre exited 2"));
    }
}
