//! Error types for flow loading and execution

use thiserror::Error;

/// A problem found while validating a flow. The last two variants are
/// reported as warnings and do not block loading.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("start_node_id is required")]
    MissingStartNode,

    #[error("start_node_id '{0}' does not exist in nodes")]
    UnknownStartNode(String),

    #[error("node id '{0}' is defined more than once")]
    DuplicateNodeId(String),

    #[error("node '{node_id}' has edge '{edge_id}' to non-existent node '{target}'")]
    DanglingEdge {
        node_id: String,
        edge_id: String,
        target: String,
    },

    #[error("fallback_node_id '{0}' does not exist")]
    UnknownFallbackNode(String),

    #[error("node '{node_id}' edge '{edge_id}' has an invalid equation: {message}")]
    InvalidCondition {
        node_id: String,
        edge_id: String,
        message: String,
    },

    #[error("invalid VAD settings: {0}")]
    InvalidVadSettings(String),
}

/// Failure to turn a document into a [`crate::FlowDefinition`].
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("malformed flow document: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid flow definition: {}", join_errors(.0))]
    Invalid(Vec<ValidationError>),
}

impl LoadError {
    /// Validation errors carried by this failure, if any.
    pub fn validation_errors(&self) -> &[ValidationError] {
        match self {
            LoadError::Invalid(errors) => errors,
            _ => &[],
        }
    }
}

impl From<serde_json::Error> for LoadError {
    fn from(e: serde_json::Error) -> Self {
        LoadError::Parse(e.to_string())
    }
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failure of an external collaborator (generation, transcription, callables).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CapabilityError {
    #[error("generation failed: {0}")]
    Generation(String),

    #[error("transcription failed: {0}")]
    Transcription(String),

    #[error("function not found: {0}")]
    FunctionNotFound(String),

    #[error("function '{name}' failed: {message}")]
    Function { name: String, message: String },
}

impl From<parley_voice::VoiceError> for CapabilityError {
    fn from(e: parley_voice::VoiceError) -> Self {
        CapabilityError::Transcription(e.to_string())
    }
}

/// Runtime failures inside a session. These are turned into error-kind
/// [`crate::NodeResult`]s before leaving the engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FlowError {
    #[error("no flow loaded with id '{0}'")]
    UnknownFlow(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error("retry budget of {max_retries} exhausted on node '{node_id}'")]
    RetryExhausted { node_id: String, max_retries: u32 },

    #[error("more than {0} automatic transitions in one turn")]
    ContinuationLimit(u32),
}

pub type FlowResult<T> = Result<T, FlowError>;
