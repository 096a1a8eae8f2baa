//! Node execution: one handler per node kind plus the shared edge evaluation.
//!
//! Every handler returns a [`NodeResult`]. Capability failures are caught here
//! and turned into error-kind results; nothing escapes as a panic or an `Err`.

use crate::capability::{ChatMessage, FunctionRegistry, GenerationContext, Generator};
use crate::definition::{
    ConversationNode, ExtractVariableNode, FunctionNode, GlobalSettings, Node, NodeKind,
    VariableSpec,
};
use crate::error::{CapabilityError, FlowError};
use crate::observer::ObserverSet;
use crate::variables::VariableStore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What kind of outcome a node produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    /// Something to say.
    Response,
    /// Nothing to say; move on.
    Continue,
    /// Conversation ended.
    End,
    /// Hand-off to a human.
    Transfer,
    Error,
    WaitForInput,
}

/// Uniform result of executing a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub kind: ResultKind,
    pub response_text: Option<String>,
    pub next_node_id: Option<String>,
    pub extracted_variables: HashMap<String, Value>,
    pub should_wait_for_input: bool,
    pub error_message: Option<String>,
    pub metadata: Map<String, Value>,
}

impl NodeResult {
    pub fn new(kind: ResultKind) -> Self {
        Self {
            kind,
            response_text: None,
            next_node_id: None,
            extracted_variables: HashMap::new(),
            should_wait_for_input: true,
            error_message: None,
            metadata: Map::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::new(ResultKind::Error)
        }
    }

    pub fn wait_for_input() -> Self {
        Self::new(ResultKind::WaitForInput)
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.response_text = Some(text.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn is_error(&self) -> bool {
        self.kind == ResultKind::Error
    }
}

/// Per-call inputs that are not owned by the executor.
pub struct ExecutionContext<'a> {
    pub session_id: &'a str,
    pub settings: &'a GlobalSettings,
    pub history: &'a [ChatMessage],
    pub observers: &'a ObserverSet,
}

/// Runs nodes against a session's variables.
#[derive(Clone)]
pub struct NodeExecutor {
    generator: Arc<dyn Generator>,
    functions: Arc<FunctionRegistry>,
}

impl NodeExecutor {
    pub fn new(generator: Arc<dyn Generator>, functions: Arc<FunctionRegistry>) -> Self {
        Self {
            generator,
            functions,
        }
    }

    /// Execute `node`. `user_input` is `None` when the node is entered without new input.
    pub async fn execute(
        &self,
        node: &Node,
        user_input: Option<&str>,
        vars: &mut VariableStore,
        ctx: &ExecutionContext<'_>,
    ) -> NodeResult {
        info!(
            session_id = ctx.session_id,
            node_id = %node.id,
            node_type = node.type_name(),
            has_user_input = user_input.is_some(),
            "Executing node"
        );

        let outcome = match &node.kind {
            NodeKind::Conversation(conv) => {
                self.execute_conversation(node, conv, user_input, vars, ctx).await
            }
            NodeKind::Function(func) => Ok(self.execute_function(node, func, vars, ctx).await),
            NodeKind::LogicSplit(_) => {
                let next = self.evaluate_edges(node, None, vars).await;
                Ok(NodeResult {
                    next_node_id: next,
                    should_wait_for_input: false,
                    ..NodeResult::new(ResultKind::Continue)
                })
            }
            NodeKind::End(end) => Ok(NodeResult {
                should_wait_for_input: false,
                ..NodeResult::new(ResultKind::End)
                    .with_text(vars.interpolate(&end.message))
                    .with_metadata("end_reason", Value::String(end.end_reason.clone()))
            }),
            NodeKind::Transfer(transfer) => Ok(NodeResult {
                should_wait_for_input: false,
                ..NodeResult::new(ResultKind::Transfer)
                    .with_text(vars.interpolate(&transfer.message))
                    .with_metadata(
                        "transfer_reason",
                        Value::String(transfer.transfer_reason.clone()),
                    )
                    .with_metadata(
                        "destination",
                        transfer
                            .destination
                            .clone()
                            .map(Value::String)
                            .unwrap_or(Value::Null),
                    )
            }),
            NodeKind::ExtractVariable(extract) => {
                Ok(self.execute_extract(node, extract, user_input, vars).await)
            }
        };

        outcome.unwrap_or_else(|e| {
            error!(
                session_id = ctx.session_id,
                node_id = %node.id,
                error = %e,
                "Node execution failed"
            );
            NodeResult::error(e.to_string())
        })
    }

    // -------------------------------------------------------------------------
    // Conversation
    // -------------------------------------------------------------------------

    async fn execute_conversation(
        &self,
        node: &Node,
        conv: &ConversationNode,
        user_input: Option<&str>,
        vars: &mut VariableStore,
        ctx: &ExecutionContext<'_>,
    ) -> Result<NodeResult, FlowError> {
        if user_input.is_none() && conv.auto_respond {
            let template = conv.response_template.as_deref().unwrap_or(&conv.instruction);
            return Ok(NodeResult::new(ResultKind::Response).with_text(vars.interpolate(template)));
        }

        let mut extracted = HashMap::new();
        if let Some(input) = user_input {
            if !conv.extract_variables.is_empty() {
                extracted = self.extract_batch(input, &conv.extract_variables).await;
                for (name, value) in &extracted {
                    vars.set(name.clone(), value.clone(), &node.id);
                }
            }
        }

        let prompt = build_conversation_prompt(conv, user_input, vars);
        let context = generation_context(node, ctx);
        let response = self.generator.generate(&prompt, Some(&context)).await?;

        let next = self.evaluate_edges(node, user_input, vars).await;
        let wait = next.is_none();
        Ok(NodeResult {
            next_node_id: next,
            extracted_variables: extracted,
            should_wait_for_input: wait,
            ..NodeResult::new(ResultKind::Response).with_text(response.trim())
        })
    }

    /// One extraction call for several variables. Failures yield nothing.
    async fn extract_batch(&self, input: &str, names: &[String]) -> HashMap<String, Value> {
        let prompt = format!(
            "Extract the following information from the user's message.\n\
             Variables to extract: {}\n\n\
             User said: \"{}\"\n\n\
             For each variable, return the extracted value. If a variable is not found, return null.\n\
             Return as JSON object with variable names as keys.\n\
             Only return the JSON, no explanation.",
            names.join(", "),
            input
        );

        let response = match self.generator.generate(&prompt, None).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Variable extraction failed");
                return HashMap::new();
            }
        };

        let parsed: Value = match serde_json::from_str(strip_code_fence(&response)) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, response = %response, "Extraction response is not JSON");
                return HashMap::new();
            }
        };

        let Some(object) = parsed.as_object() else {
            warn!(response = %response, "Extraction response is not a JSON object");
            return HashMap::new();
        };

        let result: HashMap<String, Value> = names
            .iter()
            .filter_map(|name| match object.get(name) {
                Some(v) if !v.is_null() => Some((name.clone(), v.clone())),
                _ => None,
            })
            .collect();

        info!(
            extracted_count = result.len(),
            variables = ?result.keys().collect::<Vec<_>>(),
            "Variables extracted"
        );
        result
    }

    // -------------------------------------------------------------------------
    // Function
    // -------------------------------------------------------------------------

    async fn execute_function(
        &self,
        node: &Node,
        func: &FunctionNode,
        vars: &mut VariableStore,
        ctx: &ExecutionContext<'_>,
    ) -> NodeResult {
        let failure_text = |vars: &VariableStore| {
            func.failure_message.as_deref().map(|m| vars.interpolate(m))
        };

        if !self.functions.contains(&func.function_name) {
            error!(function_name = %func.function_name, "Function not found");
            let mut result = NodeResult::error(
                CapabilityError::FunctionNotFound(func.function_name.clone()).to_string(),
            );
            result.response_text = failure_text(vars);
            return result;
        }

        let params: Map<String, Value> = func
            .parameters
            .iter()
            .map(|(k, v)| {
                let v = match v {
                    Value::String(s) => Value::String(vars.interpolate(s)),
                    other => other.clone(),
                };
                (k.clone(), v)
            })
            .collect();

        let mut metadata = Map::new();
        if let Some(pending) = &func.pending_message {
            let text = vars.interpolate(pending);
            ctx.observers.response(ctx.session_id, &node.id, &text).await;
            metadata.insert("pending_message".to_string(), Value::String(text));
        }

        match self.functions.invoke(&func.function_name, params).await {
            Ok(value) => {
                let mut extracted = HashMap::new();
                if let Some(name) = &func.result_variable {
                    vars.set(name.clone(), value.clone(), &node.id);
                    extracted.insert(name.clone(), value.clone());
                }

                let overlay = HashMap::from([("result".to_string(), value.clone())]);
                let response_text = func
                    .success_message
                    .as_deref()
                    .map(|m| vars.interpolate_with(m, &overlay));

                let next = self.evaluate_edges(node, None, vars).await;
                metadata.insert("function_result".to_string(), value);

                let kind = if response_text.is_some() {
                    ResultKind::Response
                } else {
                    ResultKind::Continue
                };
                NodeResult {
                    kind,
                    response_text,
                    next_node_id: next,
                    extracted_variables: extracted,
                    should_wait_for_input: false,
                    error_message: None,
                    metadata,
                }
            }
            Err(err) => {
                let detail = match &err {
                    CapabilityError::Function { message, .. } => message.clone(),
                    other => other.to_string(),
                };
                error!(function_name = %func.function_name, error = %detail, "Function execution failed");
                let text = failure_text(vars)
                    .unwrap_or_else(|| format!("Sorry, I encountered an error: {}", detail));
                NodeResult {
                    metadata,
                    ..NodeResult::error(err.to_string()).with_text(text)
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Extract variable
    // -------------------------------------------------------------------------

    async fn execute_extract(
        &self,
        node: &Node,
        extract: &ExtractVariableNode,
        user_input: Option<&str>,
        vars: &mut VariableStore,
    ) -> NodeResult {
        let Some(input) = user_input.filter(|s| !s.trim().is_empty()) else {
            return NodeResult::wait_for_input();
        };

        let preamble = extract.extraction_prompt.as_deref().map(|p| vars.interpolate(p));
        let mut extracted = HashMap::new();
        for spec in &extract.variables {
            if let Some(value) = self.extract_single(input, spec, preamble.as_deref()).await {
                vars.set(spec.name.clone(), value.clone(), &node.id);
                extracted.insert(spec.name.clone(), value);
            }
        }

        let next = self.evaluate_edges(node, Some(input), vars).await;
        NodeResult {
            next_node_id: next,
            extracted_variables: extracted,
            should_wait_for_input: false,
            ..NodeResult::new(ResultKind::Continue)
        }
    }

    async fn extract_single(
        &self,
        input: &str,
        spec: &VariableSpec,
        preamble: Option<&str>,
    ) -> Option<Value> {
        let description = if spec.description.is_empty() {
            spec.name.as_str()
        } else {
            spec.description.as_str()
        };
        let mut prompt = String::new();
        if let Some(p) = preamble {
            prompt.push_str(p);
            prompt.push_str("\n\n");
        }
        prompt.push_str(&format!(
            "Extract the {} from this text.\n\
             Expected type: {}\n\
             Text: \"{}\"\n\n\
             Return only the extracted value, nothing else.\n\
             If not found, return exactly \"null\".",
            description, spec.value_type, input
        ));

        match self.generator.generate(&prompt, None).await {
            Ok(response) => {
                let value = coerce_extracted(response.trim(), &spec.value_type);
                debug!(variable = %spec.name, found = value.is_some(), "Single variable extraction");
                value
            }
            Err(e) => {
                warn!(variable = %spec.name, error = %e, "Single variable extraction failed");
                None
            }
        }
    }

    // -------------------------------------------------------------------------
    // Edges
    // -------------------------------------------------------------------------

    /// Pick the outgoing edge: equations by priority, then prompt judgments
    /// (only with user input), then the first default edge.
    pub async fn evaluate_edges(
        &self,
        node: &Node,
        user_input: Option<&str>,
        vars: &VariableStore,
    ) -> Option<String> {
        let edges = node.edges_by_priority();
        if edges.is_empty() {
            return None;
        }

        for edge in &edges {
            let mut equations = edge.equation_conditions().peekable();
            if equations.peek().is_none() {
                continue;
            }
            if equations.all(|c| vars.evaluate_equation(&c.condition)) {
                debug!(edge_id = %edge.id, target = %edge.target_node_id, "Equation transition matched");
                return Some(edge.target_node_id.clone());
            }
        }

        if let Some(input) = user_input.filter(|s| !s.trim().is_empty()) {
            for edge in &edges {
                let conditions: Vec<String> = edge
                    .prompt_conditions()
                    .map(|c| format!("- {}", vars.interpolate(&c.condition)))
                    .collect();
                if conditions.is_empty() {
                    continue;
                }
                let prompt = format!(
                    "Determine if the user's message matches these conditions:\n{}\n\n\
                     User said: \"{}\"\n\n\
                     Does the user's message satisfy ALL of these conditions?\n\
                     Reply with only \"yes\" or \"no\".",
                    conditions.join("\n"),
                    input
                );
                match self.generator.generate(&prompt, None).await {
                    Ok(answer) if answer.trim().to_lowercase().starts_with("yes") => {
                        debug!(edge_id = %edge.id, target = %edge.target_node_id, "Prompt transition matched");
                        return Some(edge.target_node_id.clone());
                    }
                    Ok(_) => {}
                    Err(e) => warn!(edge_id = %edge.id, error = %e, "Transition evaluation failed"),
                }
            }
        }

        let default = edges.iter().find(|e| e.is_default)?;
        debug!(edge_id = %default.id, target = %default.target_node_id, "Using default transition");
        Some(default.target_node_id.clone())
    }
}

fn generation_context(node: &Node, ctx: &ExecutionContext<'_>) -> GenerationContext {
    GenerationContext {
        system_prompt: ctx.settings.system_prompt.clone(),
        history: ctx.history.to_vec(),
        model: Some(
            node.llm_model
                .clone()
                .unwrap_or_else(|| ctx.settings.llm_model.clone()),
        ),
        temperature: Some(node.temperature.unwrap_or(ctx.settings.temperature)),
        max_tokens: Some(ctx.settings.max_tokens),
    }
}

fn build_conversation_prompt(
    conv: &ConversationNode,
    user_input: Option<&str>,
    vars: &VariableStore,
) -> String {
    let mut prompt = vars.interpolate(&conv.instruction);
    if !conv.examples.is_empty() {
        prompt.push_str("\n\nExamples:\n");
        for ex in &conv.examples {
            prompt.push_str(&format!("User: {}\nAgent: {}\n\n", ex.user, ex.agent));
        }
    }
    match user_input {
        Some(input) => prompt.push_str(&format!("\n\nUser: {}\n\n", input)),
        None => prompt.push_str("\n\nOpen the conversation.\n\n"),
    }
    prompt.push_str("Respond appropriately based on the instruction. Keep response concise for voice.");
    prompt
}

/// Strip a surrounding markdown code fence (optionally tagged `json`).
fn strip_code_fence(text: &str) -> &str {
    let text = text.trim();
    if !text.starts_with("```") {
        return text;
    }
    let inner = text.split("```").nth(1).unwrap_or("");
    inner.strip_prefix("json").unwrap_or(inner).trim()
}

/// Typed coercion of a one-shot extraction answer. `None` means not found.
fn coerce_extracted(response: &str, value_type: &str) -> Option<Value> {
    let response = response.trim().trim_matches('"');
    if response.is_empty() || response.eq_ignore_ascii_case("null") {
        return None;
    }
    let value = match value_type {
        "number" => {
            let parsed = if response.contains('.') {
                response
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
            } else {
                response.parse::<i64>().ok().map(Value::from)
            };
            parsed.unwrap_or_else(|| Value::String(response.to_string()))
        }
        "boolean" => Value::Bool(matches!(
            response.to_lowercase().as_str(),
            "true" | "yes" | "1"
        )),
        _ => Value::String(response.to_string()),
    };
    Some(value)
}
