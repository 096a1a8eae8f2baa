//! Integration tests for the flow engine turn loop

use async_trait::async_trait;
use parley_flow::{
    CapabilityError, ChannelObserver, EngineConfig, FlowDefinition, FlowEngine, FlowEvent,
    GenerationContext, Generator, LoadError, ResultKind, ScriptedGenerator, ValidationError,
    VariableStore,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn booking_flow() -> Value {
    json!({
        "id": "booking",
        "name": "Table booking",
        "version": "2.1.0",
        "start_node_id": "greeting",
        "global_settings": {"vad_enabled": false},
        "nodes": [
            {
                "id": "greeting",
                "type": "conversation",
                "instruction": "Greet the caller and ask for their name",
                "response_template": "Hello! What's your name?",
                "extract_variables": ["name"],
                "edges": [{
                    "id": "has_name",
                    "target_node_id": "collect_date",
                    "conditions": [{"type": "equation", "condition": "{{name}} exists"}]
                }]
            },
            {
                "id": "collect_date",
                "instruction": "Ask {{name}} which date they would like",
                "response_template": "Thanks {{name}}, which date works for you?",
                "extract_variables": ["date"],
                "edges": [{
                    "id": "has_date",
                    "target_node_id": "end",
                    "conditions": [{"type": "equation", "condition": "{{date}} exists"}]
                }]
            },
            {"id": "end", "type": "end"}
        ]
    })
}

fn booking_generator() -> ScriptedGenerator {
    ScriptedGenerator::new()
        .on("Variables to extract: name", r#"{"name": "Sam"}"#)
        .on(
            "Variables to extract: date",
            "```json\n{\"date\": \"2024-06-01\"}\n```",
        )
        .on("User: My name is Sam", "Nice to meet you, Sam.")
        .on("User: tomorrow", "Great, you're booked.")
}

#[tokio::test]
async fn test_end_to_end_booking() {
    init_tracing();
    let (observer, mut events) = ChannelObserver::new();
    let engine = FlowEngine::new(Arc::new(booking_generator())).with_observer(Arc::new(observer));
    engine.load_flow(booking_flow()).expect("valid flow");

    let mut session = engine
        .create_session("booking", HashMap::new())
        .expect("session");

    let opening = engine.start(&mut session).await;
    assert_eq!(opening.kind, ResultKind::Response);
    assert_eq!(opening.response_text.as_deref(), Some("Hello! What's your name?"));
    assert!(opening.should_wait_for_input);

    let second = engine.process_text_input(&mut session, "My name is Sam").await;
    assert_eq!(session.current_node_id(), "collect_date");
    assert_eq!(session.variables().get("name"), Some(&json!("Sam")));
    assert_eq!(
        second.response_text.as_deref(),
        Some("Nice to meet you, Sam. Thanks Sam, which date works for you?")
    );

    let last = engine.process_text_input(&mut session, "tomorrow").await;
    assert_eq!(last.kind, ResultKind::End);
    assert!(session.is_complete());
    assert_eq!(session.end_reason(), Some("completed"));
    assert_eq!(session.variables().get("date"), Some(&json!("2024-06-01")));
    assert!(last.response_text.unwrap().contains("Goodbye"));

    let name_history = session.variables().history(Some("name"));
    assert_eq!(name_history.len(), 1);
    assert_eq!(name_history[0].source, "greeting");

    let mut transitions = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let FlowEvent::StateChanged { from, to, .. } = event {
            transitions.push((from, to));
        }
    }
    assert_eq!(
        transitions,
        vec![
            (None, "greeting".to_string()),
            (Some("greeting".to_string()), "collect_date".to_string()),
            (Some("collect_date".to_string()), "end".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_history_records_both_sides() {
    let engine = FlowEngine::new(Arc::new(booking_generator()));
    engine.load_flow(booking_flow()).unwrap();
    let mut session = engine.create_session("booking", HashMap::new()).unwrap();

    engine.start(&mut session).await;
    engine.process_text_input(&mut session, "My name is Sam").await;

    let texts: Vec<_> = session.history().iter().map(|t| t.text.as_str()).collect();
    assert_eq!(
        texts,
        vec![
            "Hello! What's your name?",
            "My name is Sam",
            "Nice to meet you, Sam.",
            "Thanks Sam, which date works for you?",
        ]
    );
    assert_eq!(session.history()[3].node_id, "collect_date");

    let snapshot = session.snapshot();
    assert_eq!(snapshot.turn_count, 4);
    assert!(!snapshot.is_complete);
}

fn retry_flow(max_retries: u32, fallback: Option<&str>) -> Value {
    let mut settings = json!({"vad_enabled": false, "max_retries": max_retries});
    if let Some(f) = fallback {
        settings["fallback_node_id"] = json!(f);
    }
    json!({
        "id": "retry",
        "start_node_id": "ask",
        "global_settings": settings,
        "nodes": [
            {"id": "ask", "instruction": "Ask how we can help",
             "response_template": "How can I help?",
             "edges": [{"id": "e", "target_node_id": "done",
                        "conditions": [{"type": "prompt", "condition": "user asks for billing"}]}]},
            {"id": "recover", "response_template": "Let's start over."},
            {"id": "done", "type": "end"}
        ]
    })
}

#[tokio::test]
async fn test_retries_then_fallback() {
    init_tracing();
    let generator = ScriptedGenerator::new().fail_on("Respond appropriately", "backend down");
    let engine = FlowEngine::new(Arc::new(generator));
    engine.load_flow(retry_flow(2, Some("recover"))).unwrap();
    let mut session = engine.create_session("retry", HashMap::new()).unwrap();
    engine.start(&mut session).await;

    let first = engine.process_text_input(&mut session, "hello").await;
    assert!(first.is_error());
    assert_eq!(session.retry_count(), 1);
    assert_eq!(session.current_node_id(), "ask");
    assert_eq!(
        first.response_text.as_deref(),
        Some("I'm sorry, something went wrong. Could you say that again?")
    );

    let second = engine.process_text_input(&mut session, "hello again").await;
    assert_eq!(session.current_node_id(), "recover");
    assert_eq!(session.retry_count(), 0);
    assert!(second.response_text.unwrap().ends_with("Let's start over."));
    assert!(!session.is_complete());
}

#[tokio::test]
async fn test_retries_without_fallback_end_the_session() {
    let generator = ScriptedGenerator::new().fail_on("Respond appropriately", "backend down");
    let engine = FlowEngine::new(Arc::new(generator));
    engine.load_flow(retry_flow(1, None)).unwrap();
    let mut session = engine.create_session("retry", HashMap::new()).unwrap();
    engine.start(&mut session).await;

    let result = engine.process_text_input(&mut session, "hello").await;
    assert!(result.is_error());
    assert!(session.is_complete());
    assert_eq!(session.end_reason(), Some("max_retries"));
    assert_eq!(
        result.response_text.as_deref(),
        Some("I'm sorry, I'm having trouble helping with this. Let's end here for now.")
    );
}

/// Fails the first `failures` calls, then answers "yes".
struct Flaky {
    failures: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl Generator for Flaky {
    async fn generate(
        &self,
        _prompt: &str,
        _context: Option<&GenerationContext>,
    ) -> Result<String, CapabilityError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(CapabilityError::Generation("rate limited".to_string()));
        }
        Ok("yes".to_string())
    }
}

#[tokio::test]
async fn test_retry_counter_resets_after_transition() {
    let engine = FlowEngine::new(Arc::new(Flaky {
        failures: 1,
        calls: AtomicUsize::new(0),
    }));
    engine.load_flow(retry_flow(3, None)).unwrap();
    let mut session = engine.create_session("retry", HashMap::new()).unwrap();
    engine.start(&mut session).await;

    engine.process_text_input(&mut session, "billing please").await;
    assert_eq!(session.retry_count(), 1);

    let result = engine.process_text_input(&mut session, "billing please").await;
    assert_eq!(result.kind, ResultKind::End);
    assert_eq!(session.retry_count(), 0);
    assert_eq!(session.current_node_id(), "done");
}

#[tokio::test]
async fn test_lowest_priority_edge_is_taken() {
    let engine = FlowEngine::new(Arc::new(ScriptedGenerator::new()));
    engine
        .load_flow(json!({
            "id": "routing",
            "start_node_id": "route",
            "global_settings": {
                "vad_enabled": false,
                "initial_variables": {"tier": "gold", "spend": 500}
            },
            "nodes": [
                {"id": "route", "type": "logic_split", "edges": [
                    {"id": "gold", "target_node_id": "gold_desk", "priority": 1,
                     "conditions": [{"type": "equation", "condition": "{{tier}} == 'gold'"}]},
                    {"id": "vip", "target_node_id": "vip_desk", "priority": 0,
                     "conditions": [{"type": "equation", "condition": "{{spend}} >> 100"}]}
                ]},
                {"id": "gold_desk", "type": "end", "message": "Gold desk."},
                {"id": "vip_desk", "type": "transfer", "message": "Connecting you to the VIP desk.",
                 "destination": "vip-queue"}
            ]
        }))
        .unwrap();

    let mut session = engine.create_session("routing", HashMap::new()).unwrap();
    let result = engine.start(&mut session).await;
    assert_eq!(result.kind, ResultKind::Transfer);
    assert_eq!(session.current_node_id(), "vip_desk");
    assert_eq!(session.end_reason(), Some("transfer"));
    assert_eq!(result.metadata["destination"], json!("vip-queue"));
}

#[tokio::test]
async fn test_unreadable_equation_loads_and_never_matches() {
    init_tracing();
    let engine = FlowEngine::new(Arc::new(ScriptedGenerator::new()));
    engine
        .load_flow(json!({
            "id": "legacy",
            "start_node_id": "route",
            "global_settings": {"vad_enabled": false, "initial_variables": {"name": "Sam"}},
            "nodes": [
                {"id": "route", "type": "logic_split", "edges": [
                    {"id": "named", "target_node_id": "known", "priority": 0,
                     "conditions": [{"type": "equation", "condition": "{{name}} is not empty"}]},
                    {"id": "other", "target_node_id": "unknown", "priority": 1, "is_default": true}
                ]},
                {"id": "known", "type": "end", "message": "Known caller."},
                {"id": "unknown", "type": "end", "message": "Unknown caller."}
            ]
        }))
        .unwrap();

    let mut session = engine.create_session("legacy", HashMap::new()).unwrap();
    let result = engine.start(&mut session).await;
    assert_eq!(result.kind, ResultKind::End);
    assert_eq!(session.current_node_id(), "unknown");
}

#[tokio::test]
async fn test_cyclic_default_edges_hit_the_continuation_cap() {
    let engine = FlowEngine::new(Arc::new(ScriptedGenerator::new())).with_config(EngineConfig {
        max_auto_continuations: 5,
        ..Default::default()
    });
    engine
        .load_flow(json!({
            "id": "loop",
            "start_node_id": "a",
            "global_settings": {"vad_enabled": false},
            "nodes": [
                {"id": "a", "type": "logic_split",
                 "edges": [{"id": "ab", "target_node_id": "b", "is_default": true}]},
                {"id": "b", "type": "logic_split",
                 "edges": [{"id": "ba", "target_node_id": "a", "is_default": true}]}
            ]
        }))
        .unwrap();

    let mut session = engine.create_session("loop", HashMap::new()).unwrap();
    let result = engine.start(&mut session).await;
    assert!(result.is_error());
    assert!(session.is_complete());
    assert_eq!(session.end_reason(), Some("continuation_limit"));
    assert!(result.error_message.unwrap().contains("5"));
}

fn function_flow() -> Value {
    json!({
        "id": "calendar",
        "start_node_id": "book",
        "global_settings": {"vad_enabled": false, "initial_variables": {"date": "Friday"}},
        "nodes": [
            {"id": "book", "type": "function", "function_name": "book_table",
             "parameters": {"day": "{{date}}"},
             "result_variable": "confirmation",
             "pending_message": "One moment while I check.",
             "success_message": "Booked, reference {{result}}.",
             "failure_message": "I couldn't book {{date}}.",
             "edges": [{"id": "ok", "target_node_id": "bye", "is_default": true}]},
            {"id": "bye", "type": "end", "message": "See you {{date}}!"}
        ]
    })
}

#[tokio::test]
async fn test_function_node_speaks_pending_then_success() {
    let (observer, mut events) = ChannelObserver::new();
    let engine = FlowEngine::new(Arc::new(ScriptedGenerator::new())).with_observer(Arc::new(observer));
    engine.functions().register_async("book_table", |params| async move {
        let day = params.get("day").and_then(Value::as_str).unwrap_or_default().to_string();
        Ok(json!(format!("{}-42", day.to_uppercase())))
    });
    engine.load_flow(function_flow()).unwrap();

    let mut session = engine.create_session("calendar", HashMap::new()).unwrap();
    let result = engine.start(&mut session).await;
    assert_eq!(result.kind, ResultKind::End);
    assert_eq!(
        result.response_text.as_deref(),
        Some("One moment while I check. Booked, reference FRIDAY-42. See you Friday!")
    );
    assert_eq!(session.variables().get("confirmation"), Some(&json!("FRIDAY-42")));

    let mut spoken = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let FlowEvent::Response { text, .. } = event {
            spoken.push(text);
        }
    }
    assert_eq!(
        spoken,
        vec![
            "One moment while I check.".to_string(),
            "Booked, reference FRIDAY-42.".to_string(),
            "See you Friday!".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_function_failure_speaks_failure_message_and_stays() {
    let engine = FlowEngine::new(Arc::new(ScriptedGenerator::new()));
    engine
        .functions()
        .register_sync("book_table", |_| Err("calendar offline".into()));
    engine.load_flow(function_flow()).unwrap();

    let mut session = engine.create_session("calendar", HashMap::new()).unwrap();
    let result = engine.start(&mut session).await;
    assert!(result.is_error());
    assert_eq!(session.current_node_id(), "book");
    assert_eq!(session.retry_count(), 1);
    assert_eq!(
        result.response_text.as_deref(),
        Some("One moment while I check. I couldn't book Friday.")
    );
}

#[tokio::test]
async fn test_missing_function_is_an_error_result() {
    let engine = FlowEngine::new(Arc::new(ScriptedGenerator::new()));
    engine.load_flow(function_flow()).unwrap();
    let mut session = engine.create_session("calendar", HashMap::new()).unwrap();

    let result = engine.start(&mut session).await;
    assert!(result.is_error());
    assert!(result.error_message.unwrap().contains("book_table"));
    assert_eq!(result.response_text.as_deref(), Some("I couldn't book Friday."));
}

#[test]
fn test_validation_reports_every_problem() {
    let err = FlowDefinition::from_value(json!({
        "id": "broken",
        "global_settings": {"fallback_node_id": "nowhere"},
        "nodes": [
            {"id": "a", "edges": [{"id": "e1", "target_node_id": "ghost"}]},
            {"id": "a"}
        ]
    }))
    .unwrap_err();

    let errors = err.validation_errors();
    assert_eq!(errors.len(), 4);
    assert!(errors.contains(&ValidationError::DuplicateNodeId("a".into())));
    assert!(errors.contains(&ValidationError::MissingStartNode));
    assert!(errors.contains(&ValidationError::UnknownFallbackNode("nowhere".into())));
    assert!(errors.iter().any(|e| matches!(
        e,
        ValidationError::DanglingEdge { target, .. } if target == "ghost"
    )));
}

#[test]
fn test_malformed_document_is_parse_error() {
    assert!(matches!(
        FlowDefinition::from_json("{ not json"),
        Err(LoadError::Parse(_))
    ));
}

#[test]
fn test_serialise_and_reload_preserves_structure() {
    let original = FlowDefinition::from_value(booking_flow()).unwrap();
    let text = original.to_json_pretty().unwrap();
    let reloaded = FlowDefinition::from_json(&text).unwrap();
    assert_eq!(reloaded, original);
    assert!(reloaded.validate().is_empty());
}

#[test]
fn test_load_flow_file_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("booking.json");
    std::fs::write(&path, booking_flow().to_string()).unwrap();

    let engine = FlowEngine::new(Arc::new(ScriptedGenerator::new()));
    let flow = engine.load_flow_file(&path).unwrap();
    assert_eq!(flow.version, "2.1.0");
    assert!(engine.flow("booking").is_some());
    assert!(matches!(
        engine.load_flow_file(dir.path().join("missing.json")),
        Err(LoadError::Io(_))
    ));
}

#[test]
fn test_equation_examples() {
    let mut vars = VariableStore::new();
    vars.set("a", json!(20), "test");
    vars.set("b", json!("y"), "test");

    assert!(vars.evaluate_equation("{{a}} >> 18"));
    assert!(!vars.evaluate_equation("{{a}} >> 18 AND {{b}} == 'x'"));
    assert!(!vars.evaluate_equation("{{n}} exists"));
    assert!(vars.evaluate_equation(""));
    assert_eq!(VariableStore::new().interpolate("Hi {{x}}"), "Hi {{x}}");
}
