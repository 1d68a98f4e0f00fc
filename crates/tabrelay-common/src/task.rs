//! Remote task server payloads and the node identity record.

use crate::protocol::TargetId;
use serde::{Deserialize, Serialize};

/// Stable identity of this coordinator node, persisted by the identity store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeIdentity {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(rename = "type")]
    pub node_type: String,
}

impl NodeIdentity {
    /// Copy without the credential, for payloads that leave the node.
    pub fn public(&self) -> Self {
        Self {
            token: None,
            ..self.clone()
        }
    }

    pub fn apply(&mut self, patch: &IdentityPatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(node_type) = &patch.node_type {
            self.node_type = node_type.clone();
        }
        if patch.clear_token {
            self.token = None;
        } else if let Some(token) = &patch.token {
            self.token = Some(token.clone());
        }
    }
}

/// Partial update; `clear_token` wins over `token`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub clear_token: bool,
}

impl IdentityPatch {
    pub fn token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Self::default()
        }
    }

    pub fn clear_token() -> Self {
        Self {
            clear_token: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub identity: NodeIdentity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
}

/// A target the node currently knows about, sent with every fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSummary {
    pub target: TargetId,
    pub index: u32,
    pub url: String,
    pub pending: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub identity: NodeIdentity,
    pub targets: Vec<TargetSummary>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchResponse {
    #[serde(default)]
    pub tasks: Vec<CoordinatorTask>,
    #[serde(default)]
    pub instructions: Vec<TargetInstructions>,
}

/// Instructions destined for one target. Payloads stay opaque JSON on the
/// dispatcher side; only the execution context parses them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetInstructions {
    pub target: TargetId,
    #[serde(default)]
    pub instructions: Vec<serde_json::Value>,
}

/// Work the coordinator performs itself instead of forwarding to a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorTask {
    #[serde(default)]
    pub id: String,
    #[serde(flatten)]
    pub kind: TaskKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TaskKind {
    /// Open a context for `target` unless one is already connected.
    SpawnTarget { target: TargetId, url: String },
    ClearQueue { target: TargetId },
    SweepExpired {
        #[serde(default, rename = "maxAgeMs")]
        max_age_ms: Option<u64>,
    },
    ReportConnections,
}

impl TaskKind {
    pub fn target(&self) -> Option<&TargetId> {
        match self {
            TaskKind::SpawnTarget { target, .. } | TaskKind::ClearQueue { target } => Some(target),
            TaskKind::SweepExpired { .. } | TaskKind::ReportConnections => None,
        }
    }
}

/// Body of `/instructions/reply` and `/tasks/reply`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyRequest {
    pub identity: NodeIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetId>,
    pub payload: serde_json::Value,
}
