//! Per-conversation state.
//!
//! A session exclusively owns its variables, history, current-node pointer and
//! audio state. The host owns the session and hands it to the engine one turn
//! at a time, so turns within a session are strictly sequential and sessions
//! never share mutable state.

use crate::capability::ChatMessage;
use crate::variables::VariableStore;
use chrono::{DateTime, Utc};
use parley_voice::{
    PlaybackHandle, SpeechClassifier, Utterance, VadConfig, VadProcessor, VoiceResult,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Agent => "agent",
        }
    }
}

/// A single turn in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Serialisable view of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub flow_id: String,
    pub session_id: String,
    pub current_node_id: String,
    pub variables: HashMap<String, Value>,
    pub turn_count: usize,
    pub retry_count: u32,
    pub is_complete: bool,
    pub end_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct SessionState {
    pub(crate) flow_id: String,
    pub(crate) session_id: String,
    pub(crate) current_node_id: String,
    pub(crate) variables: VariableStore,
    pub(crate) history: Vec<ConversationTurn>,
    pub(crate) retry_count: u32,
    pub(crate) is_complete: bool,
    pub(crate) end_reason: Option<String>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,

    pub(crate) vad: Option<VadProcessor>,
    pub(crate) playback: PlaybackHandle,
    pub(crate) pending_utterance: Option<Utterance>,
}

impl SessionState {
    pub(crate) fn new(
        flow_id: String,
        session_id: String,
        start_node_id: String,
        variables: VariableStore,
        vad: Option<VadProcessor>,
    ) -> Self {
        let now = Utc::now();
        Self {
            flow_id,
            session_id,
            current_node_id: start_node_id,
            variables,
            history: Vec::new(),
            retry_count: 0,
            is_complete: false,
            end_reason: None,
            created_at: now,
            updated_at: now,
            vad,
            playback: PlaybackHandle::new(),
            pending_utterance: None,
        }
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn current_node_id(&self) -> &str {
        &self.current_node_id
    }

    pub fn variables(&self) -> &VariableStore {
        &self.variables
    }

    /// Hosts may seed or correct variables between turns.
    pub fn variables_mut(&mut self) -> &mut VariableStore {
        &mut self.variables
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.history
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn is_complete(&self) -> bool {
        self.is_complete
    }

    pub fn end_reason(&self) -> Option<&str> {
        self.end_reason.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Shared flag for the agent's audio output; interrupted on barge-in.
    pub fn playback_handle(&self) -> PlaybackHandle {
        self.playback.clone()
    }

    /// Completed utterance waiting for the host to transcribe it.
    pub fn take_utterance(&mut self) -> Option<Utterance> {
        self.pending_utterance.take()
    }

    pub fn has_vad(&self) -> bool {
        self.vad.is_some()
    }

    /// Replace the energy-only detector with a model-backed one.
    pub fn install_classifier(&mut self, classifier: Box<dyn SpeechClassifier>) -> VoiceResult<()> {
        let config = self
            .vad
            .as_ref()
            .map(|v| v.config().clone())
            .unwrap_or_else(VadConfig::default);
        self.vad = Some(VadProcessor::with_classifier(config, classifier)?);
        Ok(())
    }

    pub fn add_turn(&mut self, role: Role, text: impl Into<String>, node_id: Option<&str>) {
        self.add_turn_with_metadata(role, text, node_id, Map::new());
    }

    pub fn add_turn_with_metadata(
        &mut self,
        role: Role,
        text: impl Into<String>,
        node_id: Option<&str>,
        metadata: Map<String, Value>,
    ) {
        let now = Utc::now();
        self.history.push(ConversationTurn {
            role,
            text: text.into(),
            node_id: node_id.unwrap_or(&self.current_node_id).to_string(),
            timestamp: now,
            metadata,
        });
        self.updated_at = now;
    }

    /// The most recent `max_turns` turns as role/content pairs.
    pub fn history_for_generation(&self, max_turns: usize) -> Vec<ChatMessage> {
        let skip = self.history.len().saturating_sub(max_turns);
        self.history[skip..]
            .iter()
            .map(|turn| ChatMessage {
                role: turn.role.as_str().to_string(),
                content: turn.text.clone(),
            })
            .collect()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            flow_id: self.flow_id.clone(),
            session_id: self.session_id.clone(),
            current_node_id: self.current_node_id.clone(),
            variables: self.variables.get_all(),
            turn_count: self.history.len(),
            retry_count: self.retry_count,
            is_complete: self.is_complete,
            end_reason: self.end_reason.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub(crate) fn complete(&mut self, reason: impl Into<String>) {
        self.is_complete = true;
        self.end_reason = Some(reason.into());
        self.updated_at = Utc::now();
    }
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("flow_id", &self.flow_id)
            .field("session_id", &self.session_id)
            .field("current_node_id", &self.current_node_id)
            .field("variables", &self.variables)
            .field("turns", &self.history.len())
            .field("retry_count", &self.retry_count)
            .field("is_complete", &self.is_complete)
            .field("end_reason", &self.end_reason)
            .finish()
    }
}
