//! # Parley Flow - declarative voice conversations
//!
//! Loads conversation flows authored as JSON graphs of nodes and conditioned
//! edges, and runs sessions through them one turn at a time.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                          FlowEngine                            │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐     │
//! │  │ audio frames │→ │ VadProcessor │→ │   Transcriber    │     │
//! │  │              │  │ (per session)│  │                  │     │
//! │  └──────────────┘  └──────────────┘  └──────────────────┘     │
//! │                                         ↓ text                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐     │
//! │  │ VariableStore│← │ NodeExecutor │← │ turn loop, retry │     │
//! │  │  conditions  │  │  Generator   │  │ fallback, caps   │     │
//! │  └──────────────┘  └──────────────┘  └──────────────────┘     │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use parley_flow::{FlowEngine, ScriptedGenerator};
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = FlowEngine::new(Arc::new(ScriptedGenerator::new()));
//! engine.load_flow_file("flows/booking.json")?;
//!
//! let mut session = engine.create_session("booking", HashMap::new())?;
//! let opening = engine.start(&mut session).await;
//! println!("{:?}", opening.response_text);
//!
//! let reply = engine.process_text_input(&mut session, "My name is Sam").await;
//! println!("{:?}", reply.response_text);
//! # Ok(())
//! # }
//! ```

pub mod capability;
pub mod condition;
pub mod config;
pub mod definition;
pub mod engine;
pub mod error;
pub mod executor;
pub mod observer;
pub mod session;
pub mod variables;

pub use capability::{
    BoxError, ChatMessage, FlowFunction, FunctionRegistry, GenerationContext, Generator,
    ScriptedGenerator,
};
pub use condition::{Condition, ConditionError, VariableLookup};
pub use config::EngineConfig;
pub use definition::{
    ConditionKind, ConversationNode, Edge, EndNode, Example, ExtractVariableNode,
    FlowDefinition, FlowDocument, FunctionNode, GlobalSettings, LogicSplitNode, Node, NodeKind,
    TransferNode, TransitionCondition, VariableSpec,
};
pub use engine::{FlowEngine, FlowSummary};
pub use error::{CapabilityError, FlowError, FlowResult, LoadError, ValidationError};
pub use executor::{ExecutionContext, NodeExecutor, NodeResult, ResultKind};
pub use observer::{ChannelObserver, FlowEvent, FlowObserver, ObserverSet};
pub use session::{ConversationTurn, Role, SessionSnapshot, SessionState};
pub use variables::{display_value, VariableChange, VariableStore};
