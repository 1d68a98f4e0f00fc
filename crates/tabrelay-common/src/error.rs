use thiserror::Error;

/// Failures raised by a host document.
#[derive(Debug, Clone, Error)]
pub enum DocumentError {
    #[error("Script error: {0}")]
    Script(String),

    #[error("Document detached")]
    Detached,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not supported: {0}")]
    NotSupported(String),
}

impl From<serde_json::Error> for DocumentError {
    fn from(err: serde_json::Error) -> Self {
        DocumentError::Serialization(err.to_string())
    }
}

/// Failures of a single instruction. These never cross the instruction
/// boundary; they are folded into a failed `ExecutionResult`.
#[derive(Debug, Error)]
pub enum InstructionError {
    #[error("Invalid instruction: {0}")]
    Validation(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Element is not editable: {0}")]
    NotEditable(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Instruction panicked: {0}")]
    Panicked(String),
}

/// Failures on the messaging channel between dispatcher and contexts.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("No receiver for target {0}")]
    NoReceiver(String),

    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    #[error("Connection closed")]
    Closed,

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Serialization(err.to_string())
    }
}
