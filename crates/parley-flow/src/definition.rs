//! Flow documents: nodes, edges, global settings, loading and validation.
//!
//! A flow is authored as JSON. Every optional field has an engine default, so a
//! partially specified document still loads; only structural and referential
//! problems are errors, and all of them are reported together.

use crate::condition::Condition;
use crate::error::{LoadError, ValidationError};
use parley_voice::VadConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{error, info, warn};

// -----------------------------------------------------------------------------
// Edges and conditions
// -----------------------------------------------------------------------------

/// How a transition condition is judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    /// Boolean expression over variables.
    Equation,
    /// Natural-language condition judged by the generation capability.
    #[default]
    Prompt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionCondition {
    #[serde(rename = "type", default)]
    pub kind: ConditionKind,
    #[serde(default)]
    pub condition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TransitionCondition {
    pub fn equation(condition: impl Into<String>) -> Self {
        Self {
            kind: ConditionKind::Equation,
            condition: condition.into(),
            description: None,
        }
    }

    pub fn prompt(condition: impl Into<String>) -> Self {
        Self {
            kind: ConditionKind::Prompt,
            condition: condition.into(),
            description: None,
        }
    }
}

/// Directed, conditioned transition. Lower `priority` is evaluated first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub target_node_id: String,
    #[serde(default)]
    pub conditions: Vec<TransitionCondition>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub priority: i32,
}

impl Edge {
    pub fn equation_conditions(&self) -> impl Iterator<Item = &TransitionCondition> {
        self.conditions
            .iter()
            .filter(|c| c.kind == ConditionKind::Equation)
    }

    pub fn prompt_conditions(&self) -> impl Iterator<Item = &TransitionCondition> {
        self.conditions
            .iter()
            .filter(|c| c.kind == ConditionKind::Prompt)
    }
}

// -----------------------------------------------------------------------------
// Nodes
// -----------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

/// A sample exchange shown to the generator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Example {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub agent: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationNode {
    #[serde(default)]
    pub instruction: String,
    #[serde(default)]
    pub extract_variables: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_template: Option<String>,
    /// Speak the template/instruction directly on entry.
    #[serde(default = "default_true")]
    pub auto_respond: bool,
    #[serde(default)]
    pub examples: Vec<Example>,
}

impl Default for ConversationNode {
    fn default() -> Self {
        Self {
            instruction: String::new(),
            extract_variables: Vec::new(),
            response_template: None,
            auto_respond: true,
            examples: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionNode {
    #[serde(default)]
    pub function_name: String,
    /// String values are interpolated before the call.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_variable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_message: Option<String>,
    /// Supports `{{result}}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

/// Routes on variable state; carries no fields of its own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogicSplitNode {}

fn default_end_message() -> String {
    "Thank you for using our service. Goodbye!".to_string()
}

fn default_end_reason() -> String {
    "completed".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndNode {
    #[serde(default = "default_end_message")]
    pub message: String,
    #[serde(default = "default_end_reason")]
    pub end_reason: String,
}

impl Default for EndNode {
    fn default() -> Self {
        Self {
            message: default_end_message(),
            end_reason: default_end_reason(),
        }
    }
}

fn default_transfer_message() -> String {
    "Let me connect you with a human agent.".to_string()
}

fn default_transfer_reason() -> String {
    "user_request".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferNode {
    #[serde(default = "default_transfer_message")]
    pub message: String,
    /// Phone number, queue name, ...
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default = "default_transfer_reason")]
    pub transfer_reason: String,
}

impl Default for TransferNode {
    fn default() -> Self {
        Self {
            message: default_transfer_message(),
            destination: None,
            transfer_reason: default_transfer_reason(),
        }
    }
}

fn default_value_type() -> String {
    "string".to_string()
}

/// A variable an extraction node asks for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// `string`, `number`, `boolean`, `date`, `time`
    #[serde(rename = "type", default = "default_value_type")]
    pub value_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractVariableNode {
    #[serde(default)]
    pub variables: Vec<VariableSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_prompt: Option<String>,
}

/// Type-specific part of a node, tagged by `type` in the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Conversation(ConversationNode),
    Function(FunctionNode),
    LogicSplit(LogicSplitNode),
    End(EndNode),
    Transfer(TransferNode),
    ExtractVariable(ExtractVariableNode),
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Conversation(_) => "conversation",
            NodeKind::Function(_) => "function",
            NodeKind::LogicSplit(_) => "logic_split",
            NodeKind::End(_) => "end",
            NodeKind::Transfer(_) => "transfer",
            NodeKind::ExtractVariable(_) => "extract_variable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Per-node override of the flow's model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            description: None,
            edges: Vec::new(),
            llm_model: None,
            temperature: None,
            kind,
        }
    }

    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    /// Edges in evaluation order (ascending priority, stable for ties).
    pub fn edges_by_priority(&self) -> Vec<&Edge> {
        let mut edges: Vec<&Edge> = self.edges.iter().collect();
        edges.sort_by_key(|e| e.priority);
        edges
    }
}

// -----------------------------------------------------------------------------
// Global settings
// -----------------------------------------------------------------------------

/// Flow-wide settings. Threaded into every execution as an immutable reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    pub system_prompt: String,
    pub llm_model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub voice: String,
    pub language: String,

    /// Consecutive failed turns on one node before falling back.
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_node_id: Option<String>,

    pub vad_enabled: bool,
    pub allow_interruptions: bool,
    #[serde(flatten)]
    pub vad: VadConfig,

    pub initial_variables: HashMap<String, Value>,

    /// Spoken when a turn fails and the node has no message of its own.
    pub error_message: String,
    /// Spoken when the session ends because retries ran out.
    pub handoff_message: String,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            system_prompt: "You are a helpful voice assistant.".to_string(),
            llm_model: "gemini-1.5-flash".to_string(),
            temperature: 0.7,
            max_tokens: 500,
            voice: "default".to_string(),
            language: "en".to_string(),
            max_retries: 3,
            fallback_node_id: None,
            vad_enabled: true,
            allow_interruptions: true,
            vad: VadConfig::default(),
            initial_variables: HashMap::new(),
            error_message: "I'm sorry, something went wrong. Could you say that again?"
                .to_string(),
            handoff_message:
                "I'm sorry, I'm having trouble helping with this. Let's end here for now."
                    .to_string(),
        }
    }
}

// -----------------------------------------------------------------------------
// Document and definition
// -----------------------------------------------------------------------------

fn default_version() -> String {
    "1.0.0".to_string()
}

/// The declarative document as authored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDocument {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub global_settings: GlobalSettings,
    #[serde(default)]
    pub start_node_id: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl FlowDocument {
    /// Parse a JSON value. Nodes without a `type` are conversation nodes.
    pub fn from_value(mut value: Value) -> Result<Self, LoadError> {
        if let Some(nodes) = value.get_mut("nodes").and_then(Value::as_array_mut) {
            for node in nodes.iter_mut() {
                if let Some(obj) = node.as_object_mut() {
                    obj.entry("type")
                        .or_insert_with(|| Value::String("conversation".to_string()));
                }
            }
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn from_json(text: &str) -> Result<Self, LoadError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Every structural and referential violation, in document order.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                errors.push(ValidationError::DuplicateNodeId(node.id.clone()));
            }
        }
        collect_errors(
            &self.start_node_id,
            self.global_settings.fallback_node_id.as_deref(),
            &self.nodes.iter().collect::<Vec<_>>(),
            &ids,
            &mut errors,
        );
        errors
    }

    /// Content problems that do not block loading: equations the condition
    /// parser rejects and out-of-range VAD settings.
    pub fn warnings(&self) -> Vec<ValidationError> {
        collect_warnings(&self.nodes.iter().collect::<Vec<_>>(), &self.global_settings)
    }
}

fn collect_errors(
    start_node_id: &str,
    fallback_node_id: Option<&str>,
    nodes: &[&Node],
    ids: &HashSet<&str>,
    errors: &mut Vec<ValidationError>,
) {
    if start_node_id.is_empty() {
        errors.push(ValidationError::MissingStartNode);
    } else if !ids.contains(start_node_id) {
        errors.push(ValidationError::UnknownStartNode(start_node_id.to_string()));
    }

    for node in nodes {
        for edge in &node.edges {
            if !ids.contains(edge.target_node_id.as_str()) {
                errors.push(ValidationError::DanglingEdge {
                    node_id: node.id.clone(),
                    edge_id: edge.id.clone(),
                    target: edge.target_node_id.clone(),
                });
            }
        }
    }

    if let Some(fallback) = fallback_node_id {
        if !ids.contains(fallback) {
            errors.push(ValidationError::UnknownFallbackNode(fallback.to_string()));
        }
    }
}

fn collect_warnings(nodes: &[&Node], settings: &GlobalSettings) -> Vec<ValidationError> {
    let mut warnings = Vec::new();
    for node in nodes {
        for edge in &node.edges {
            for condition in edge.equation_conditions() {
                if let Err(e) = Condition::parse(&condition.condition) {
                    warnings.push(ValidationError::InvalidCondition {
                        node_id: node.id.clone(),
                        edge_id: edge.id.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
    }
    if let Err(e) = settings.vad.validate() {
        warnings.push(ValidationError::InvalidVadSettings(e.to_string()));
    }
    warnings
}

/// A validated flow graph. Never mutated after load.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowDefinition {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub global_settings: GlobalSettings,
    pub start_node_id: String,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    nodes: HashMap<String, Node>,
    // document order, for serialisation
    order: Vec<String>,
}

impl FlowDefinition {
    /// Validate a document and build the graph. All violations are reported at once.
    pub fn from_document(doc: FlowDocument) -> Result<Self, LoadError> {
        let errors = doc.validate();
        if !errors.is_empty() {
            error!(
                flow_id = %doc.id,
                error_count = errors.len(),
                errors = ?errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "Flow validation failed"
            );
            return Err(LoadError::Invalid(errors));
        }
        // Unreadable equations evaluate false at runtime
        for warning in doc.warnings() {
            warn!(flow_id = %doc.id, %warning, "Flow loaded with a content problem");
        }

        let order: Vec<String> = doc.nodes.iter().map(|n| n.id.clone()).collect();
        let nodes = doc
            .nodes
            .into_iter()
            .map(|n| (n.id.clone(), n))
            .collect::<HashMap<_, _>>();

        info!(
            flow_id = %doc.id,
            flow_name = %doc.name,
            node_count = nodes.len(),
            "Flow loaded"
        );

        Ok(Self {
            id: doc.id,
            name: doc.name,
            version: doc.version,
            description: doc.description,
            global_settings: doc.global_settings,
            start_node_id: doc.start_node_id,
            created_at: doc.created_at,
            updated_at: doc.updated_at,
            nodes,
            order,
        })
    }

    pub fn from_value(value: Value) -> Result<Self, LoadError> {
        Self::from_document(FlowDocument::from_value(value)?)
    }

    pub fn from_json(text: &str) -> Result<Self, LoadError> {
        Self::from_document(FlowDocument::from_json(text)?)
    }

    /// Read and load a JSON flow document from disk.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn start_node(&self) -> Option<&Node> {
        self.nodes.get(&self.start_node_id)
    }

    /// Nodes in document order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Re-run validation. Always empty for a definition built by `from_document`.
    pub fn validate(&self) -> Vec<ValidationError> {
        let ids: HashSet<&str> = self.nodes.keys().map(String::as_str).collect();
        let mut errors = Vec::new();
        collect_errors(
            &self.start_node_id,
            self.global_settings.fallback_node_id.as_deref(),
            &self.nodes().collect::<Vec<_>>(),
            &ids,
            &mut errors,
        );
        errors
    }

    pub fn warnings(&self) -> Vec<ValidationError> {
        collect_warnings(&self.nodes().collect::<Vec<_>>(), &self.global_settings)
    }

    /// Back to the document shape, nodes in load order.
    pub fn to_document(&self) -> FlowDocument {
        FlowDocument {
            id: self.id.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
            description: self.description.clone(),
            global_settings: self.global_settings.clone(),
            start_node_id: self.start_node_id.clone(),
            nodes: self.nodes().cloned().collect(),
            created_at: self.created_at.clone(),
            updated_at: self.updated_at.clone(),
        }
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self.to_document())
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.to_document())
    }
}
