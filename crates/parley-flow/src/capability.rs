//! Contracts for the external collaborators a flow calls into: text generation
//! and registered functions.
//!
//! Every registered function is asynchronous. Synchronous closures are wrapped
//! into ready futures at registration time so Function nodes invoke both kinds
//! the same way.

use crate::error::CapabilityError;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Boxed error returned by registered functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// One message of conversation history handed to the generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Context for a generation call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerationContext {
    pub system_prompt: String,
    pub history: Vec<ChatMessage>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

/// Text generation backend. Used for replies, yes/no judgments and extraction.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        context: Option<&GenerationContext>,
    ) -> Result<String, CapabilityError>;
}

// -----------------------------------------------------------------------------
// ScriptedGenerator
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    reply: Result<String, String>,
    remaining: Option<usize>,
}

/// Answers prompts by substring rules, in registration order, and records
/// every prompt it receives. Useful for tests and offline demos.
#[derive(Debug)]
pub struct ScriptedGenerator {
    rules: Mutex<Vec<Rule>>,
    default_reply: String,
    prompts: Mutex<Vec<String>>,
}

impl Default for ScriptedGenerator {
    fn default() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            default_reply: "OK".to_string(),
            prompts: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `reply` whenever the prompt contains `pattern`.
    pub fn on(self, pattern: impl Into<String>, reply: impl Into<String>) -> Self {
        self.rule(pattern.into(), Ok(reply.into()), None)
    }

    /// Like [`on`](Self::on) but only for the first matching prompt.
    pub fn once(self, pattern: impl Into<String>, reply: impl Into<String>) -> Self {
        self.rule(pattern.into(), Ok(reply.into()), Some(1))
    }

    /// Fail whenever the prompt contains `pattern`.
    pub fn fail_on(self, pattern: impl Into<String>, message: impl Into<String>) -> Self {
        self.rule(pattern.into(), Err(message.into()), None)
    }

    /// Reply used when no rule matches.
    pub fn with_default(mut self, reply: impl Into<String>) -> Self {
        self.default_reply = reply.into();
        self
    }

    fn rule(self, pattern: String, reply: Result<String, String>, remaining: Option<usize>) -> Self {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(Rule {
                pattern,
                reply,
                remaining,
            });
        }
        self
    }

    /// Every prompt received so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Number of received prompts containing `pattern`.
    pub fn count_matching(&self, pattern: &str) -> usize {
        self.prompts().iter().filter(|p| p.contains(pattern)).count()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(
        &self,
        prompt: &str,
        _context: Option<&GenerationContext>,
    ) -> Result<String, CapabilityError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }

        let mut rules = self
            .rules
            .lock()
            .map_err(|_| CapabilityError::Generation("rule table poisoned".to_string()))?;

        let Some(rule) = rules
            .iter_mut()
            .find(|r| r.remaining != Some(0) && prompt.contains(&r.pattern))
        else {
            return Ok(self.default_reply.clone());
        };

        if let Some(n) = rule.remaining.as_mut() {
            *n -= 1;
        }
        debug!(pattern = %rule.pattern, "scripted generation");
        rule.reply.clone().map_err(CapabilityError::Generation)
    }
}

// -----------------------------------------------------------------------------
// Callable registry
// -----------------------------------------------------------------------------

/// A function a Function node can call.
#[async_trait]
pub trait FlowFunction: Send + Sync {
    async fn call(&self, params: Map<String, Value>) -> Result<Value, BoxError>;
}

struct AsyncFunction<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> FlowFunction for AsyncFunction<F>
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, BoxError>> + Send,
{
    async fn call(&self, params: Map<String, Value>) -> Result<Value, BoxError> {
        (self.f)(params).await
    }
}

struct SyncFunction<F> {
    f: F,
}

#[async_trait]
impl<F> FlowFunction for SyncFunction<F>
where
    F: Fn(Map<String, Value>) -> Result<Value, BoxError> + Send + Sync,
{
    async fn call(&self, params: Map<String, Value>) -> Result<Value, BoxError> {
        (self.f)(params)
    }
}

/// Name → function table shared by every session of an engine.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: DashMap<String, Arc<dyn FlowFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, function: Arc<dyn FlowFunction>) {
        let name = name.into();
        info!(name = %name, "Function registered");
        self.functions.insert(name, function);
    }

    /// Register a closure returning a future.
    pub fn register_async<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        self.register(name, Arc::new(AsyncFunction { f }));
    }

    /// Register a plain closure; it runs inside a ready future.
    pub fn register_sync<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Map<String, Value>) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        self.register(name, Arc::new(SyncFunction { f }));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn FlowFunction>> {
        self.functions.get(name).map(|f| Arc::clone(f.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Look up and call `name`.
    pub async fn invoke(&self, name: &str, params: Map<String, Value>) -> Result<Value, CapabilityError> {
        let function = self
            .get(name)
            .ok_or_else(|| CapabilityError::FunctionNotFound(name.to_string()))?;
        function
            .call(params)
            .await
            .map_err(|e| CapabilityError::Function {
                name: name.to_string(),
                message: e.to_string(),
            })
    }
}
