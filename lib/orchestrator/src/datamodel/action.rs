// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::SessionName;

/// Lifecycle action a brick-host agent can be asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionActionType {
    CreateVolume,
    Delete,
    Mount,
    Unmount,
    CopyIn,
    CopyOut,
}

impl fmt::Display for SessionActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionActionType::CreateVolume => "create_volume",
            SessionActionType::Delete => "delete",
            SessionActionType::Mount => "mount",
            SessionActionType::Unmount => "unmount",
            SessionActionType::CopyIn => "copy_in",
            SessionActionType::CopyOut => "copy_out",
        };
        f.write_str(name)
    }
}

/// Envelope posted by the coordinator into a brick host's mailbox and echoed
/// back, with `error` filled in, as the single response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAction {
    pub correlation: Uuid,
    pub action: SessionActionType,
    pub session: SessionName,
    /// Revision of the session record the action was issued against.
    pub revision: i64,
    /// Empty on requests; set by the agent on failure.
    pub error: Option<String>,
}

impl SessionAction {
    pub fn request(action: SessionActionType, session: SessionName, revision: i64) -> Self {
        Self {
            correlation: Uuid::new_v4(),
            action,
            session,
            revision,
            error: None,
        }
    }

    /// Build the terminal response for this request.
    pub fn into_response(self, error: Option<String>) -> Self {
        Self { error, ..self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_type_wire_names() {
        let json = serde_json::to_string(&SessionActionType::CreateVolume).unwrap();
        assert_eq!(json, "\"create_volume\"");
        let json = serde_json::to_string(&SessionActionType::CopyOut).unwrap();
        assert_eq!(json, "\"copy_out\"");
    }

    #[test]
    fn response_keeps_correlation() {
        let request = SessionAction::request(SessionActionType::Delete, "job9".into(), 4);
        let correlation = request.correlation;
        let response = request.into_response(Some("teardown failed".to_string()));
        assert_eq!(response.correlation, correlation);
        assert_eq!(response.error.as_deref(), Some("teardown failed"));
    }
}
