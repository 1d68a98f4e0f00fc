//! Messages exchanged between the dispatcher and execution contexts.
//!
//! Every frame is an [`Envelope`]: requests carry an `action` tag, responses
//! carry `replyTo` with the id of the request they answer.
//!
//! ```json
//! {"id": 4, "action": "getSingleInstruction"}
//! {"id": 9, "replyTo": 4, "ok": true, "data": {"type": "click", "id": "c1", "elementName": "go"}}
//! ```

use crate::result::{ExecutionResult, ExecutionStats};
use crate::task::IdentityPatch;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coordinator-side identity of an execution context (tab index or tab id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(pub String);

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TargetId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ContextRequest {
    // dispatcher -> context
    /// Liveness probe.
    Ping,
    /// Drain-queue signal.
    Notify,
    /// Run an explicit batch and answer with results and statistics.
    ExecuteInstructions {
        instructions: Vec<serde_json::Value>,
    },

    // context -> dispatcher
    /// Register or refresh the sender's connection record.
    ContextReady {
        target: TargetId,
        index: u32,
        url: String,
    },
    /// The context's document moved to a new location.
    ContextNavigated { url: String },
    GetSingleInstruction,
    GetInstructions,
    GetInstructionsCount,
    GetNodeProfile,
    UpdateNodeProfile { profile: IdentityPatch },
    ReportResults {
        results: Vec<ExecutionResult>,
        stats: ExecutionStats,
    },
}

impl ContextRequest {
    pub fn action(&self) -> &'static str {
        match self {
            ContextRequest::Ping => "ping",
            ContextRequest::Notify => "notify",
            ContextRequest::ExecuteInstructions { .. } => "executeInstructions",
            ContextRequest::ContextReady { .. } => "contextReady",
            ContextRequest::ContextNavigated { .. } => "contextNavigated",
            ContextRequest::GetSingleInstruction => "getSingleInstruction",
            ContextRequest::GetInstructions => "getInstructions",
            ContextRequest::GetInstructionsCount => "getInstructionsCount",
            ContextRequest::GetNodeProfile => "getNodeProfile",
            ContextRequest::UpdateNodeProfile { .. } => "updateNodeProfile",
            ContextRequest::ReportResults { .. } => "reportResults",
        }
    }
}

/// Every failure is encoded here; neither side raises across the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ContextResponse {
    pub fn ok(data: Option<serde_json::Value>) -> Self {
        Self {
            ok: true,
            data,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }

    /// The data payload, treating JSON `null` as absent.
    pub fn into_data(self) -> Option<serde_json::Value> {
        self.data.filter(|v| !v.is_null())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Body {
    Request(ContextRequest),
    Response(ContextResponse),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<u64>,
    #[serde(flatten)]
    pub body: Body,
}

impl Envelope {
    pub fn request(id: u64, request: ContextRequest) -> Self {
        Self {
            id,
            reply_to: None,
            body: Body::Request(request),
        }
    }

    pub fn response(id: u64, reply_to: u64, response: ContextResponse) -> Self {
        Self {
            id,
            reply_to: Some(reply_to),
            body: Body::Response(response),
        }
    }
}
