//! Flow Engine - the turn-taking orchestrator
//!
//! This module ties together loaded flows, per-session state, node execution
//! and voice activity detection. A turn runs the current node, follows any
//! zero-wait transitions in a bounded loop, and applies the retry/fallback
//! policy when a node fails or cannot move on.
//!
//! Public turn operations never return `Err`; every failure is reported as an
//! error-kind [`NodeResult`].

use crate::capability::{FlowFunction, FunctionRegistry, Generator};
use crate::config::EngineConfig;
use crate::definition::{FlowDefinition, GlobalSettings, Node};
use crate::error::{CapabilityError, FlowError, FlowResult, LoadError};
use crate::executor::{ExecutionContext, NodeExecutor, NodeResult, ResultKind};
use crate::observer::{FlowObserver, ObserverSet};
use crate::session::{Role, SessionState};
use crate::variables::VariableStore;
use dashmap::DashMap;
use parley_voice::{transcribe_utterance, Transcriber, VadProcessor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const CONVERSATION_ENDED: &str = "The conversation has ended.";

/// Short description of a loaded flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSummary {
    pub id: String,
    pub name: String,
    pub version: String,
    pub node_count: usize,
    pub start_node: String,
    pub vad_enabled: bool,
}

/// Drives sessions through loaded flows.
///
/// Flows and registered functions are shared by every session; sessions are
/// owned by the host and passed in by `&mut` one turn at a time.
pub struct FlowEngine {
    flows: DashMap<String, Arc<FlowDefinition>>,
    functions: Arc<FunctionRegistry>,
    transcriber: Option<Arc<dyn Transcriber>>,
    observers: ObserverSet,
    config: EngineConfig,
    executor: NodeExecutor,
}

impl FlowEngine {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        info!("🎭 Initializing Flow Engine");
        let functions = Arc::new(FunctionRegistry::new());
        let executor = NodeExecutor::new(generator, Arc::clone(&functions));
        Self {
            flows: DashMap::new(),
            functions,
            transcriber: None,
            observers: ObserverSet::default(),
            config: EngineConfig::default(),
            executor,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Transcribe completed utterances inside [`process_audio_frame`](Self::process_audio_frame).
    pub fn with_transcriber(mut self, transcriber: Arc<dyn Transcriber>) -> Self {
        self.transcriber = Some(transcriber);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn FlowObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Functions callable from Function nodes.
    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    pub fn register_function(&self, name: impl Into<String>, function: Arc<dyn FlowFunction>) {
        self.functions.register(name, function);
    }

    // -------------------------------------------------------------------------
    // Flows
    // -------------------------------------------------------------------------

    /// Validate and register a flow document. Replaces a flow with the same id.
    pub fn load_flow(&self, document: Value) -> Result<Arc<FlowDefinition>, LoadError> {
        Ok(self.add_flow(FlowDefinition::from_value(document)?))
    }

    pub fn load_flow_json(&self, text: &str) -> Result<Arc<FlowDefinition>, LoadError> {
        Ok(self.add_flow(FlowDefinition::from_json(text)?))
    }

    pub fn load_flow_file(&self, path: impl AsRef<Path>) -> Result<Arc<FlowDefinition>, LoadError> {
        Ok(self.add_flow(FlowDefinition::load_file(path)?))
    }

    pub fn add_flow(&self, flow: FlowDefinition) -> Arc<FlowDefinition> {
        let flow = Arc::new(flow);
        if self
            .flows
            .insert(flow.id.clone(), Arc::clone(&flow))
            .is_some()
        {
            warn!(flow_id = %flow.id, "Replacing previously loaded flow");
        }
        flow
    }

    pub fn flow(&self, flow_id: &str) -> Option<Arc<FlowDefinition>> {
        self.flows.get(flow_id).map(|f| Arc::clone(f.value()))
    }

    pub fn summary(&self, flow_id: &str) -> Option<FlowSummary> {
        self.flow(flow_id).map(|flow| FlowSummary {
            id: flow.id.clone(),
            name: flow.name.clone(),
            version: flow.version.clone(),
            node_count: flow.node_count(),
            start_node: flow.start_node_id.clone(),
            vad_enabled: flow.global_settings.vad_enabled,
        })
    }

    /// The node the session currently sits on.
    pub fn current_node(&self, session: &SessionState) -> Option<Node> {
        self.flow(&session.flow_id)?
            .node(&session.current_node_id)
            .cloned()
    }

    // -------------------------------------------------------------------------
    // Sessions
    // -------------------------------------------------------------------------

    /// Create a session with a fresh id, positioned on the start node.
    pub fn create_session(
        &self,
        flow_id: &str,
        initial_variables: HashMap<String, Value>,
    ) -> FlowResult<SessionState> {
        self.create_session_with_id(flow_id, Uuid::new_v4().to_string(), initial_variables)
    }

    pub fn create_session_with_id(
        &self,
        flow_id: &str,
        session_id: impl Into<String>,
        initial_variables: HashMap<String, Value>,
    ) -> FlowResult<SessionState> {
        let flow = self
            .flow(flow_id)
            .ok_or_else(|| FlowError::UnknownFlow(flow_id.to_string()))?;
        let session_id = session_id.into();
        let settings = &flow.global_settings;

        let mut variables = VariableStore::with_initial(settings.initial_variables.clone());
        for (name, value) in initial_variables {
            variables.set(name, value, "initial");
        }

        let vad = if settings.vad_enabled {
            match VadProcessor::new(settings.vad.clone()) {
                Ok(vad) => Some(vad),
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "VAD disabled for session");
                    None
                }
            }
        } else {
            None
        };

        info!(
            session_id = %session_id,
            flow_id = %flow.id,
            start_node = %flow.start_node_id,
            "Session created"
        );

        Ok(SessionState::new(
            flow.id.clone(),
            session_id,
            flow.start_node_id.clone(),
            variables,
            vad,
        ))
    }

    /// Enter the start node and produce the opening response.
    pub async fn start(&self, session: &mut SessionState) -> NodeResult {
        if session.is_complete {
            debug!(session_id = %session.session_id, "Start after completion ignored");
            return ended();
        }
        let Some(flow) = self.flow(&session.flow_id) else {
            return unknown_flow(session);
        };
        info!(session_id = %session.session_id, node_id = %session.current_node_id, "🚀 Starting session");
        self.observers
            .state_change(&session.session_id, None, &session.current_node_id)
            .await;
        self.drive(&flow, session, None).await
    }

    /// Process one user utterance as text.
    pub async fn process_text_input(&self, session: &mut SessionState, text: &str) -> NodeResult {
        self.handle_input(session, text, Map::new()).await
    }

    async fn handle_input(
        &self,
        session: &mut SessionState,
        text: &str,
        metadata: Map<String, Value>,
    ) -> NodeResult {
        if session.is_complete {
            debug!(session_id = %session.session_id, "Input after completion ignored");
            return ended();
        }
        let Some(flow) = self.flow(&session.flow_id) else {
            return unknown_flow(session);
        };

        info!(
            session_id = %session.session_id,
            node_id = %session.current_node_id,
            input_len = text.len(),
            "User input"
        );
        session.add_turn_with_metadata(Role::User, text, None, metadata);
        self.drive(&flow, session, Some(text.to_string())).await
    }

    /// Feed one PCM frame through the session's VAD.
    ///
    /// Returns `None` until an utterance completes. With a transcriber the
    /// utterance is transcribed and processed as text; without one it is parked
    /// on the session and a wait-for-input result is returned.
    pub async fn process_audio_frame(
        &self,
        session: &mut SessionState,
        frame: &[u8],
    ) -> Option<NodeResult> {
        if session.is_complete {
            return None;
        }
        let Some(flow) = self.flow(&session.flow_id) else {
            return Some(unknown_flow(session));
        };
        let settings = &flow.global_settings;

        let Some(vad) = session.vad.as_mut().filter(|_| settings.vad_enabled) else {
            return Some(NodeResult::error("voice activity detection is not enabled for this session"));
        };
        let outcome = vad.process_frame(frame);

        if outcome.speech_started && settings.allow_interruptions && session.playback.interrupt() {
            info!(session_id = %session.session_id, "User barged in");
            self.observers.interruption(&session.session_id).await;
        }

        let utterance = outcome.utterance?;
        info!(
            session_id = %session.session_id,
            speech_duration_ms = utterance.speech_duration.as_millis() as u64,
            audio_bytes = utterance.audio.len(),
            "Utterance complete"
        );

        let mut metadata = Map::new();
        metadata.insert(
            "speech_duration_ms".to_string(),
            Value::from(utterance.speech_duration.as_millis() as u64),
        );
        metadata.insert("audio_bytes".to_string(), Value::from(utterance.audio.len()));

        let Some(transcriber) = self.transcriber.clone() else {
            session.pending_utterance = Some(utterance);
            let mut result = NodeResult::wait_for_input();
            result.metadata = metadata;
            return Some(result);
        };

        let language = if settings.language.is_empty() {
            self.config.default_language.as_str()
        } else {
            settings.language.as_str()
        };

        match transcribe_utterance(transcriber.as_ref(), &utterance, self.config.channels, language).await {
            Ok(Some(text)) => Some(self.handle_input(session, &text, metadata).await),
            Ok(None) => {
                debug!(session_id = %session.session_id, "Empty transcription");
                None
            }
            Err(e) => {
                let e = CapabilityError::from(e);
                error!(session_id = %session.session_id, error = %e, "Transcription failed");
                let text = settings.error_message.clone();
                let node_id = session.current_node_id.clone();
                session.add_turn(Role::Agent, &text, Some(&node_id));
                self.observers.response(&session.session_id, &node_id, &text).await;
                Some(NodeResult::error(e.to_string()).with_text(text))
            }
        }
    }

    // -------------------------------------------------------------------------
    // Turn loop
    // -------------------------------------------------------------------------

    /// Execute the current node, then keep following zero-wait transitions.
    async fn drive(
        &self,
        flow: &FlowDefinition,
        session: &mut SessionState,
        mut input: Option<String>,
    ) -> NodeResult {
        let settings = &flow.global_settings;
        let mut spoken: Vec<String> = Vec::new();
        let mut continuations = 0u32;

        loop {
            let Some(node) = flow.node(&session.current_node_id) else {
                let e = FlowError::NodeNotFound(session.current_node_id.clone());
                error!(session_id = %session.session_id, error = %e, "Current node missing");
                return joined(NodeResult::error(e.to_string()), spoken);
            };

            let history = session.history_for_generation(self.config.history_window);
            let ctx = ExecutionContext {
                session_id: &session.session_id,
                settings,
                history: &history,
                observers: &self.observers,
            };
            let mut result = self
                .executor
                .execute(node, input.take().as_deref(), &mut session.variables, &ctx)
                .await;

            // Already delivered to observers by the function node
            if let Some(pending) = result.metadata.get("pending_message").and_then(Value::as_str) {
                session.add_turn(Role::Agent, pending, Some(&node.id));
                spoken.push(pending.to_string());
            }

            if matches!(result.kind, ResultKind::End | ResultKind::Transfer) {
                self.speak(session, &node.id, result.response_text.as_deref(), &mut spoken)
                    .await;
                let reason = match result.kind {
                    ResultKind::End => result
                        .metadata
                        .get("end_reason")
                        .and_then(Value::as_str)
                        .unwrap_or("completed")
                        .to_string(),
                    _ => "transfer".to_string(),
                };
                info!(session_id = %session.session_id, node_id = %node.id, reason = %reason, "🏁 Flow completed");
                session.complete(reason);
                return joined(result, spoken);
            }

            let unmatched = result.next_node_id.is_none() && !result.should_wait_for_input;
            if result.is_error() || unmatched {
                session.retry_count += 1;
                warn!(
                    session_id = %session.session_id,
                    node_id = %node.id,
                    retry_count = session.retry_count,
                    max_retries = settings.max_retries,
                    error = result.error_message.as_deref().unwrap_or("no transition matched"),
                    "Turn failed"
                );
                self.speak(session, &node.id, result.response_text.as_deref(), &mut spoken)
                    .await;

                if session.retry_count < settings.max_retries {
                    if result.response_text.is_none() {
                        self.speak(session, &node.id, Some(&settings.error_message), &mut spoken)
                            .await;
                    }
                    result.should_wait_for_input = true;
                    return joined(result, spoken);
                }

                let exhausted = FlowError::RetryExhausted {
                    node_id: node.id.clone(),
                    max_retries: settings.max_retries,
                };
                match settings.fallback_node_id.as_deref().filter(|f| flow.node(f).is_some()) {
                    Some(fallback) => {
                        warn!(session_id = %session.session_id, error = %exhausted, fallback = %fallback, "Moving to fallback node");
                        self.transition(session, fallback).await;
                        if let Some(limited) = self.count_continuation(&mut continuations, session, settings, &mut spoken).await {
                            return limited;
                        }
                        continue;
                    }
                    None => {
                        error!(session_id = %session.session_id, error = %exhausted, "Ending session");
                        return self.hand_off(session, settings, exhausted, "max_retries", spoken).await;
                    }
                }
            }

            self.speak(session, &node.id, result.response_text.as_deref(), &mut spoken)
                .await;

            let Some(next) = result.next_node_id.clone() else {
                return joined(result, spoken);
            };
            if flow.node(&next).is_none() {
                let e = FlowError::NodeNotFound(next);
                error!(session_id = %session.session_id, node_id = %node.id, error = %e, "Transition target missing");
                return joined(NodeResult::error(e.to_string()), spoken);
            }
            self.transition(session, &next).await;

            if result.should_wait_for_input {
                return joined(result, spoken);
            }
            if let Some(limited) = self
                .count_continuation(&mut continuations, session, settings, &mut spoken)
                .await
            {
                return limited;
            }
        }
    }

    async fn transition(&self, session: &mut SessionState, to: &str) {
        let from = std::mem::replace(&mut session.current_node_id, to.to_string());
        session.retry_count = 0;
        info!(session_id = %session.session_id, from = %from, to = %to, "Node transition");
        self.observers
            .state_change(&session.session_id, Some(&from), to)
            .await;
    }

    /// Count one automatic continuation; past the cap the session is ended.
    async fn count_continuation(
        &self,
        continuations: &mut u32,
        session: &mut SessionState,
        settings: &GlobalSettings,
        spoken: &mut Vec<String>,
    ) -> Option<NodeResult> {
        *continuations += 1;
        if *continuations <= self.config.max_auto_continuations {
            return None;
        }
        let e = FlowError::ContinuationLimit(self.config.max_auto_continuations);
        error!(session_id = %session.session_id, node_id = %session.current_node_id, error = %e, "Runaway auto-continuation");
        Some(
            self.hand_off(session, settings, e, "continuation_limit", std::mem::take(spoken))
                .await,
        )
    }

    /// End the session with `reason`, speaking the hand-off message.
    async fn hand_off(
        &self,
        session: &mut SessionState,
        settings: &GlobalSettings,
        error: FlowError,
        reason: &str,
        mut spoken: Vec<String>,
    ) -> NodeResult {
        let node_id = session.current_node_id.clone();
        self.speak(session, &node_id, Some(&settings.handoff_message), &mut spoken)
            .await;
        session.complete(reason);
        let mut result = NodeResult::error(error.to_string()).with_metadata("end_reason", Value::from(reason));
        result.should_wait_for_input = false;
        joined(result, spoken)
    }

    /// Record an agent utterance and tell observers about it.
    async fn speak(
        &self,
        session: &mut SessionState,
        node_id: &str,
        text: Option<&str>,
        spoken: &mut Vec<String>,
    ) {
        let Some(text) = text.filter(|t| !t.trim().is_empty()) else {
            return;
        };
        session.add_turn(Role::Agent, text, Some(node_id));
        self.observers
            .response(&session.session_id, node_id, text)
            .await;
        spoken.push(text.to_string());
    }
}

/// Attach everything spoken during the turn to the final result.
fn joined(mut result: NodeResult, spoken: Vec<String>) -> NodeResult {
    if !spoken.is_empty() {
        result.response_text = Some(spoken.join(" "));
    }
    result
}

fn ended() -> NodeResult {
    NodeResult {
        should_wait_for_input: false,
        ..NodeResult::new(ResultKind::End).with_text(CONVERSATION_ENDED)
    }
}

fn unknown_flow(session: &SessionState) -> NodeResult {
    let e = FlowError::UnknownFlow(session.flow_id.clone());
    error!(session_id = %session.session_id, error = %e, "Session refers to an unloaded flow");
    NodeResult::error(e.to_string())
}
