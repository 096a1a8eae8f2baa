//! Per-session variable store with change history, `{{name}}` interpolation
//! and equation evaluation.

use crate::condition::{Condition, VariableLookup};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{([^}]+)\}\}").expect("placeholder pattern is valid"));

/// One entry of the append-only audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableChange {
    pub variable_name: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    /// Node that made the change (`initial`, `delete`, or a node id).
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

/// Named session state. Owned by exactly one session.
#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    variables: HashMap<String, Value>,
    history: Vec<VariableChange>,
}

impl VariableLookup for VariableStore {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store without recording history (flow-level initial variables).
    pub fn with_initial(initial: HashMap<String, Value>) -> Self {
        debug!(initial_count = initial.len(), "Variable store initialized");
        Self {
            variables: initial,
            history: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Value of `name`, or `default` when absent.
    pub fn get_or(&self, name: &str, default: Value) -> Value {
        self.variables.get(name).cloned().unwrap_or(default)
    }

    /// Set a variable and record the change.
    pub fn set(&mut self, name: impl Into<String>, value: Value, source: &str) {
        let name = name.into();
        debug!(name = %name, value = %value, source, "Variable set");
        let old_value = self.variables.insert(name.clone(), value.clone());
        self.history.push(VariableChange {
            variable_name: name,
            old_value,
            new_value: Some(value),
            source: source.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Remove a variable, recording the deletion when it existed.
    pub fn delete(&mut self, name: &str) -> Option<Value> {
        let old = self.variables.remove(name)?;
        self.history.push(VariableChange {
            variable_name: name.to_string(),
            old_value: Some(old.clone()),
            new_value: None,
            source: "delete".to_string(),
            timestamp: Utc::now(),
        });
        Some(old)
    }

    /// True only when the variable is present and not null.
    pub fn exists(&self, name: &str) -> bool {
        matches!(self.variables.get(name), Some(v) if !v.is_null())
    }

    /// Copy of every variable.
    pub fn get_all(&self) -> HashMap<String, Value> {
        self.variables.clone()
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Drop all variables and the history.
    pub fn clear(&mut self) {
        self.variables.clear();
        self.history.clear();
    }

    /// Change history, optionally for a single variable.
    pub fn history(&self, name: Option<&str>) -> Vec<&VariableChange> {
        self.history
            .iter()
            .filter(|c| name.map_or(true, |n| c.variable_name == n))
            .collect()
    }

    /// Replace every `{{name}}` with the variable's text. Unknown or null
    /// variables are left verbatim.
    pub fn interpolate(&self, template: &str) -> String {
        self.interpolate_with(template, &HashMap::new())
    }

    /// Like [`interpolate`](Self::interpolate), with `overlay` consulted first.
    pub fn interpolate_with(&self, template: &str, overlay: &HashMap<String, Value>) -> String {
        if !template.contains("{{") {
            return template.to_string();
        }
        PLACEHOLDER
            .replace_all(template, |caps: &Captures| {
                let name = caps[1].trim();
                match overlay.get(name).or_else(|| self.variables.get(name)) {
                    Some(v) if !v.is_null() => display_value(v),
                    _ => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    /// Evaluate an equation condition. Blank is true; an unparseable equation is
    /// logged and evaluates to false.
    pub fn evaluate_equation(&self, equation: &str) -> bool {
        match Condition::parse(equation) {
            Ok(condition) => condition.evaluate(self),
            Err(e) => {
                warn!(equation, error = %e, "Equation could not be parsed");
                false
            }
        }
    }
}

/// Text form of a value for templates: strings unquoted, everything else as JSON.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
