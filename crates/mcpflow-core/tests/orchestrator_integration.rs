use async_trait::async_trait;
use mcpflow_core::config::WorkflowSpec;
use mcpflow_core::conversation::{ConversationState, Part, Role, ToolOutput, Turn};
use mcpflow_core::errors::FlowError;
use mcpflow_core::llm::{GatewayResponse, LlmGateway};
use mcpflow_core::orchestrator::{Orchestrator, Termination};
use mcpflow_core::schema::{FunctionDeclaration, ToolDescriptor};
use mcpflow_core::session::WorkflowSession;
use mcpflow_core::tools::{BackendService, ToolRegistry};
use mcpflow_core::trace::{QueryEvent, QueryObserver};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
struct MockGateway {
    responses: Arc<Mutex<Vec<Result<GatewayResponse, FlowError>>>>,
    calls: Arc<AtomicUsize>,
    offered_tools: Arc<Mutex<Vec<Option<Vec<String>>>>>,
    fallback: Option<Turn>,
}

impl MockGateway {
    fn new(responses: Vec<Result<GatewayResponse, FlowError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            ..Default::default()
        }
    }

    /// Keeps answering with `turn` once the scripted responses run out.
    fn repeating(turn: Turn) -> Self {
        Self {
            fallback: Some(turn),
            ..Default::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn offered_tools(&self) -> Vec<Option<Vec<String>>> {
        self.offered_tools.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmGateway for MockGateway {
    async fn generate(
        &self,
        _conversation: &ConversationState,
        tools: Option<&[FunctionDeclaration]>,
    ) -> Result<GatewayResponse, FlowError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.offered_tools
            .lock()
            .unwrap()
            .push(tools.map(|decls| decls.iter().map(|d| d.name.clone()).collect()));

        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            match &self.fallback {
                Some(turn) => Ok(GatewayResponse::single(turn.clone())),
                None => Ok(GatewayResponse::single(Turn::model(vec![Part::text("OK")]))),
            }
        } else {
            responses.remove(0)
        }
    }
}

struct MockService {
    name: String,
    tools: Vec<ToolDescriptor>,
    results: HashMap<String, Result<ToolOutput, FlowError>>,
    calls: Mutex<Vec<(String, Map<String, Value>)>>,
    list_fails: bool,
    shut_down: AtomicBool,
}

impl MockService {
    fn new(name: &str, tools: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            tools: tools
                .iter()
                .map(|t| {
                    ToolDescriptor::new(
                        *t,
                        format!("{} from {}", t, name),
                        json!({"type": "object", "properties": {"q": {"type": "string"}}}),
                    )
                })
                .collect(),
            results: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            list_fails: false,
            shut_down: AtomicBool::new(false),
        }
    }

    fn with_result(mut self, tool: &str, result: Result<ToolOutput, FlowError>) -> Self {
        self.results.insert(tool.to_string(), result);
        self
    }

    fn failing_list(mut self) -> Self {
        self.list_fails = true;
        self
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendService for MockService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, FlowError> {
        if self.list_fails {
            return Err(FlowError::connection(&self.name, "not connected"));
        }
        Ok(self.tools.clone())
    }

    async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Map<String, Value>,
    ) -> Result<ToolOutput, FlowError> {
        self.calls
            .lock()
            .unwrap()
            .push((tool_name.to_string(), arguments));
        self.results
            .get(tool_name)
            .cloned()
            .unwrap_or_else(|| Ok(ToolOutput::Text(format!("{} via {}", tool_name, self.name))))
    }

    async fn shutdown(&self) -> Result<(), FlowError> {
        self.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Gateway whose replies never arrive; signals `started` once a call is in flight.
#[derive(Default)]
struct StalledGateway {
    started: Arc<Notify>,
    calls: AtomicUsize,
}

#[async_trait]
impl LlmGateway for StalledGateway {
    async fn generate(
        &self,
        _conversation: &ConversationState,
        _tools: Option<&[FunctionDeclaration]>,
    ) -> Result<GatewayResponse, FlowError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        std::future::pending().await
    }
}

/// Service whose tool calls never complete.
struct StalledService {
    started: Arc<Notify>,
    tools: Vec<ToolDescriptor>,
}

impl StalledService {
    fn new(tool: &str) -> Self {
        Self {
            started: Arc::new(Notify::new()),
            tools: vec![ToolDescriptor::new(tool, "never finishes", json!({"type": "object"}))],
        }
    }
}

#[async_trait]
impl BackendService for StalledService {
    fn name(&self) -> &str {
        "stalled"
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, FlowError> {
        Ok(self.tools.clone())
    }

    async fn call_tool(
        &self,
        _tool_name: &str,
        _arguments: Map<String, Value>,
    ) -> Result<ToolOutput, FlowError> {
        self.started.notify_one();
        std::future::pending().await
    }

    async fn shutdown(&self) -> Result<(), FlowError> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<String>>,
}

impl QueryObserver for RecordingObserver {
    fn on_event(&self, event: &QueryEvent<'_>) {
        self.events.lock().unwrap().push(event.to_string());
    }
}

fn spec(max_turns: usize) -> WorkflowSpec {
    WorkflowSpec::new("gemini-test", "Please help with: {query}", max_turns)
}

fn text_turn(text: &str) -> Result<GatewayResponse, FlowError> {
    Ok(GatewayResponse::single(Turn::model(vec![Part::text(text)])))
}

fn call_turn(name: &str, args: Value) -> Result<GatewayResponse, FlowError> {
    let args = args.as_object().cloned().unwrap_or_default();
    Ok(GatewayResponse::single(Turn::model(vec![Part::function_call(name, args)])))
}

fn registry(services: Vec<Arc<MockService>>) -> ToolRegistry {
    ToolRegistry::build(
        services
            .into_iter()
            .map(|s| {
                let tools = s.tools.clone();
                (s as Arc<dyn BackendService>, tools)
            })
            .collect(),
    )
}

fn function_response(turn: &Turn) -> Option<(&str, &Map<String, Value>)> {
    turn.parts.iter().find_map(|p| match p {
        Part::FunctionResponse { name, response } => Some((name.as_str(), response)),
        _ => None,
    })
}

fn assert_responses_follow_calls(conversation: &ConversationState) {
    let turns = conversation.turns();
    for (i, turn) in turns.iter().enumerate() {
        if let Some((name, _)) = function_response(turn) {
            assert!(
                turns[..i].iter().any(|t| t.role == Role::Model && t.has_function_call(name)),
                "function response for '{}' at turn {} has no earlier call",
                name,
                i
            );
        }
    }
}

#[tokio::test]
async fn test_plain_text_answer_in_one_call() {
    let workflow = spec(3);
    let tools = ToolRegistry::empty();
    let gateway = MockGateway::new(vec![text_turn("hi")]);

    let run = Orchestrator::new(&workflow, &tools, &gateway)
        .run_query("hello")
        .await
        .unwrap();

    assert_eq!(run.answer, "hi");
    assert_eq!(run.llm_calls, 1);
    assert_eq!(run.termination, Termination::Completed);
    assert_eq!(gateway.calls(), 1);
    assert_eq!(gateway.offered_tools(), vec![None]);
    assert_eq!(
        run.conversation.turns()[0].parts[0].as_text(),
        Some("Please help with: hello")
    );
}

#[tokio::test]
async fn test_unknown_tool_is_reported_and_loop_continues() {
    let workflow = spec(3);
    let tools = ToolRegistry::empty();
    let gateway = MockGateway::new(vec![
        call_turn("teleport", json!({"to": "Mars"})),
        text_turn("I cannot do that."),
    ]);

    let run = Orchestrator::new(&workflow, &tools, &gateway)
        .run_query("take me to Mars")
        .await
        .unwrap();

    assert_eq!(run.llm_calls, 2);
    let turns = run.conversation.turns();
    assert_eq!(turns.len(), 4);
    let (name, payload) = function_response(&turns[2]).expect("function response after the call");
    assert_eq!(name, "teleport");
    assert_eq!(payload.get("error"), Some(&json!("tool not found")));
    assert_eq!(run.answer, "[Tool 'teleport' not found.]\nI cannot do that.");
}

#[tokio::test]
async fn test_gateway_failure_ends_query_after_one_call() {
    let workflow = spec(5);
    let tools = ToolRegistry::empty();
    let gateway = MockGateway::new(vec![Err(FlowError::GatewayError("503 unavailable".to_string()))]);

    let run = Orchestrator::new(&workflow, &tools, &gateway)
        .run_query("hello")
        .await
        .unwrap();

    assert_eq!(gateway.calls(), 1);
    assert_eq!(run.termination, Termination::GatewayFailed);
    assert!(run
        .answer
        .starts_with("[Error communicating with AI model:"));
    assert!(run.answer.contains("503 unavailable"));
}

#[tokio::test]
async fn test_single_turn_budget_with_tool_call() {
    let workflow = spec(1);
    let weather = Arc::new(MockService::new("weather", &["forecast"]));
    let tools = registry(vec![weather.clone()]);
    let gateway = MockGateway::new(vec![call_turn("forecast", json!({"q": "Oslo"}))]);

    let run = Orchestrator::new(&workflow, &tools, &gateway)
        .run_query("weather in Oslo")
        .await
        .unwrap();

    assert_eq!(gateway.calls(), 1);
    assert_eq!(weather.call_count(), 1);
    assert_eq!(run.termination, Termination::MaxTurnsReached);
    assert_eq!(run.conversation.len(), 3);
    assert_eq!(
        run.answer,
        "[Max interaction turns reached. No final text generated.]"
    );
}

#[tokio::test]
async fn test_tool_result_feeds_next_turn() {
    let workflow = spec(4);
    let weather = Arc::new(
        MockService::new("weather", &["forecast"])
            .with_result("forecast", Ok(ToolOutput::Text("sunny, 21C".to_string()))),
    );
    let tools = registry(vec![weather.clone()]);
    let gateway = MockGateway::new(vec![
        Ok(GatewayResponse::single(Turn::model(vec![
            Part::text("Let me check."),
            Part::function_call("forecast", json!({"q": "Oslo"}).as_object().cloned().unwrap()),
        ]))),
        text_turn("It is sunny and 21C in Oslo."),
    ]);

    let run = Orchestrator::new(&workflow, &tools, &gateway)
        .run_query("weather in Oslo")
        .await
        .unwrap();

    assert_eq!(run.answer, "Let me check.\nIt is sunny and 21C in Oslo.");
    let (_, payload) = function_response(&run.conversation.turns()[2]).unwrap();
    assert_eq!(payload.get("output"), Some(&json!("sunny, 21C")));
    let calls = weather.calls.lock().unwrap();
    assert_eq!(calls[0].1.get("q"), Some(&json!("Oslo")));
    assert_eq!(
        gateway.offered_tools(),
        vec![Some(vec!["forecast".to_string()]), Some(vec!["forecast".to_string()])]
    );
}

#[tokio::test]
async fn test_structured_output_passed_through() {
    let workflow = spec(3);
    let mut structured = Map::new();
    structured.insert("temperature".to_string(), json!(21));
    structured.insert("unit".to_string(), json!("C"));
    let weather = Arc::new(
        MockService::new("weather", &["forecast"])
            .with_result("forecast", Ok(ToolOutput::Structured(structured.clone()))),
    );
    let tools = registry(vec![weather]);
    let gateway = MockGateway::new(vec![call_turn("forecast", json!({})), text_turn("21C")]);

    let run = Orchestrator::new(&workflow, &tools, &gateway)
        .run_query("temp?")
        .await
        .unwrap();

    let (_, payload) = function_response(&run.conversation.turns()[2]).unwrap();
    assert_eq!(payload, &structured);
}

#[tokio::test]
async fn test_first_registered_service_handles_shared_tool() {
    let workflow = spec(3);
    let primary = Arc::new(MockService::new("primary", &["search"]));
    let secondary = Arc::new(MockService::new("secondary", &["search", "news"]));
    let tools = registry(vec![primary.clone(), secondary.clone()]);
    let gateway = MockGateway::new(vec![call_turn("search", json!({"q": "rust"})), text_turn("done")]);

    let run = Orchestrator::new(&workflow, &tools, &gateway)
        .run_query("search rust")
        .await
        .unwrap();

    assert_eq!(primary.call_count(), 1);
    assert_eq!(secondary.call_count(), 0);
    let (_, payload) = function_response(&run.conversation.turns()[2]).unwrap();
    assert_eq!(payload.get("output"), Some(&json!("search via primary")));
    assert_eq!(
        gateway.offered_tools()[0],
        Some(vec!["search".to_string(), "news".to_string()])
    );
}

#[tokio::test]
async fn test_tool_failure_is_reported_to_model() {
    let workflow = spec(3);
    let files = Arc::new(MockService::new("files", &["read_file"]).with_result(
        "read_file",
        Err(FlowError::tool("read_file", "permission denied")),
    ));
    let tools = registry(vec![files]);
    let gateway = MockGateway::new(vec![
        call_turn("read_file", json!({"q": "/etc/shadow"})),
        text_turn("I could not read that file."),
    ]);

    let run = Orchestrator::new(&workflow, &tools, &gateway)
        .run_query("read it")
        .await
        .unwrap();

    assert_eq!(run.llm_calls, 2);
    let (_, payload) = function_response(&run.conversation.turns()[2]).unwrap();
    let message = payload.get("error").and_then(Value::as_str).unwrap();
    assert!(message.contains("permission denied"));
    assert!(run.answer.contains("[Error calling tool 'read_file':"));
    assert!(run.answer.ends_with("I could not read that file."));
}

#[tokio::test]
async fn test_only_first_function_call_is_serviced() {
    let workflow = spec(3);
    let svc = Arc::new(MockService::new("svc", &["a", "b"]));
    let tools = registry(vec![svc.clone()]);
    let gateway = MockGateway::new(vec![
        Ok(GatewayResponse::single(Turn::model(vec![
            Part::function_call("a", Map::new()),
            Part::function_call("b", Map::new()),
            Part::text("ignored"),
        ]))),
        text_turn("finished"),
    ]);

    let run = Orchestrator::new(&workflow, &tools, &gateway)
        .run_query("go")
        .await
        .unwrap();

    let calls = svc.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "a");
    assert_eq!(run.answer, "finished");
    assert_responses_follow_calls(&run.conversation);
}

#[tokio::test]
async fn test_turn_budget_is_never_exceeded() {
    let workflow = spec(4);
    let svc = Arc::new(MockService::new("svc", &["loop"]));
    let tools = registry(vec![svc.clone()]);
    let gateway = MockGateway::repeating(Turn::model(vec![
        Part::text("again"),
        Part::function_call("loop", Map::new()),
    ]));

    let run = Orchestrator::new(&workflow, &tools, &gateway)
        .run_query("spin")
        .await
        .unwrap();

    assert_eq!(gateway.calls(), 4);
    assert_eq!(svc.call_count(), 4);
    assert_eq!(run.termination, Termination::MaxTurnsReached);
    assert!(run.answer.ends_with("[Max interaction turns reached.]"));
    assert_eq!(run.conversation.len(), 1 + 2 * 4);
    assert_responses_follow_calls(&run.conversation);
}

#[tokio::test]
async fn test_no_candidates_and_empty_replies() {
    let workflow = spec(3);
    let tools = ToolRegistry::empty();

    let gateway = MockGateway::new(vec![Ok(GatewayResponse::default())]);
    let run = Orchestrator::new(&workflow, &tools, &gateway)
        .run_query("hello")
        .await
        .unwrap();
    assert_eq!(run.termination, Termination::NoCandidates);
    assert_eq!(run.answer, "[AI model returned no response candidates.]");

    let gateway = MockGateway::new(vec![text_turn("   ")]);
    let run = Orchestrator::new(&workflow, &tools, &gateway)
        .run_query("hello")
        .await
        .unwrap();
    assert_eq!(run.termination, Termination::Completed);
    assert_eq!(run.answer, "[AI model provided no further text or actions.]");
}

#[tokio::test]
async fn test_cancelled_query_makes_no_calls() {
    let workflow = spec(3);
    let tools = ToolRegistry::empty();
    let gateway = MockGateway::new(vec![text_turn("hi")]);
    let observer = RecordingObserver::default();
    let token = CancellationToken::new();
    token.cancel();

    let run = Orchestrator::new(&workflow, &tools, &gateway)
        .with_observer(&observer)
        .with_cancellation(token)
        .run_query("hello")
        .await
        .unwrap();

    assert_eq!(gateway.calls(), 0);
    assert_eq!(run.termination, Termination::Cancelled);
    assert_eq!(run.answer, "[Query cancelled.]");
    assert_eq!(*observer.events.lock().unwrap(), vec!["[Query cancelled.]".to_string()]);
}

#[tokio::test]
async fn test_cancel_while_waiting_for_model() {
    let workflow = spec(3);
    let tools = ToolRegistry::empty();
    let gateway = StalledGateway::default();
    let token = CancellationToken::new();

    let orchestrator = Orchestrator::new(&workflow, &tools, &gateway).with_cancellation(token.clone());
    let (run, _) = tokio::join!(orchestrator.run_query("hello"), async {
        gateway.started.notified().await;
        token.cancel();
    });
    let run = run.unwrap();

    assert_eq!(gateway.calls.load(Ordering::SeqCst), 1);
    assert_eq!(run.llm_calls, 1);
    assert_eq!(run.termination, Termination::Cancelled);
    assert_eq!(run.answer, "[Query cancelled.]");
    assert_eq!(run.conversation.len(), 1);
}

#[tokio::test]
async fn test_cancel_while_tool_is_running() {
    let workflow = spec(3);
    let slow = Arc::new(StalledService::new("slow_scan"));
    let tools = ToolRegistry::build(vec![(
        slow.clone() as Arc<dyn BackendService>,
        slow.tools.clone(),
    )]);
    let gateway = MockGateway::new(vec![call_turn("slow_scan", json!({}))]);
    let token = CancellationToken::new();

    let orchestrator = Orchestrator::new(&workflow, &tools, &gateway).with_cancellation(token.clone());
    let (run, _) = tokio::join!(orchestrator.run_query("scan everything"), async {
        slow.started.notified().await;
        token.cancel();
    });
    let run = run.unwrap();

    assert_eq!(gateway.calls(), 1);
    assert_eq!(run.termination, Termination::Cancelled);
    assert_eq!(run.answer, "[Query cancelled.]");
    let turns = run.conversation.turns();
    assert_eq!(turns.len(), 3);
    let (name, payload) = function_response(&turns[2]).expect("cancelled call still gets a response");
    assert_eq!(name, "slow_scan");
    assert_eq!(payload.get("error"), Some(&json!("cancelled")));
    assert_responses_follow_calls(&run.conversation);
}

#[tokio::test]
async fn test_markers_do_not_count_as_final_text() {
    let workflow = spec(1);
    let tools = ToolRegistry::empty();
    let gateway = MockGateway::new(vec![call_turn("teleport", json!({}))]);

    let run = Orchestrator::new(&workflow, &tools, &gateway)
        .run_query("go to Mars")
        .await
        .unwrap();

    assert_eq!(run.termination, Termination::MaxTurnsReached);
    assert_eq!(
        run.answer,
        "[Tool 'teleport' not found.]\n[Max interaction turns reached. No final text generated.]"
    );
}

#[tokio::test]
async fn test_empty_reply_after_failed_tool_reports_no_output() {
    let workflow = spec(3);
    let tools = ToolRegistry::empty();
    let gateway = MockGateway::new(vec![
        call_turn("teleport", json!({})),
        Ok(GatewayResponse::single(Turn::model(vec![]))),
    ]);

    let run = Orchestrator::new(&workflow, &tools, &gateway)
        .run_query("go to Mars")
        .await
        .unwrap();

    assert_eq!(run.llm_calls, 2);
    assert_eq!(run.termination, Termination::Completed);
    assert_eq!(
        run.answer,
        "[Tool 'teleport' not found.]\n[AI model provided no further text or actions.]"
    );
}

#[tokio::test]
async fn test_observer_sees_events_in_order() {
    let workflow = spec(3);
    let svc = Arc::new(MockService::new("svc", &["lookup"]));
    let tools = registry(vec![svc]);
    let gateway = MockGateway::new(vec![call_turn("lookup", json!({})), text_turn("found it")]);
    let observer = RecordingObserver::default();

    Orchestrator::new(&workflow, &tools, &gateway)
        .with_observer(&observer)
        .process_query("find")
        .await
        .unwrap();

    let events = observer.events.lock().unwrap();
    assert_eq!(
        *events,
        vec![
            "Turn 1/3".to_string(),
            "LLM wants to call: lookup()".to_string(),
            "Tool lookup executed. Result snippet: lookup via svc".to_string(),
            "Turn 2/3".to_string(),
            "LLM: found it".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_bad_template_is_an_error() {
    let workflow = WorkflowSpec::new("gemini-test", "no slot here", 3);
    let tools = ToolRegistry::empty();
    let gateway = MockGateway::new(vec![]);

    let result = Orchestrator::new(&workflow, &tools, &gateway)
        .process_query("hello")
        .await;

    assert!(matches!(result, Err(FlowError::TemplateError(_))));
    assert_eq!(gateway.calls(), 0);
}

#[tokio::test]
async fn test_session_lifecycle() {
    let svc = Arc::new(MockService::new("svc", &["lookup"]));
    let session = WorkflowSession::from_parts(
        "demo",
        spec(3),
        Box::new(MockGateway::new(vec![text_turn("hi")])),
        vec![svc.clone() as Arc<dyn BackendService>],
    )
    .await
    .unwrap();
    let observer = RecordingObserver::default();

    assert_eq!(session.tool_names(), vec!["lookup"]);
    let empty = session
        .process_query("   ", &observer, CancellationToken::new())
        .await;
    assert!(empty.is_err());

    let answer = session
        .process_query("hello", &observer, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(answer, "hi");

    session.close().await;
    assert!(svc.is_shut_down());
    assert!(session.is_closed());
    let closed = session
        .process_query("hello", &observer, CancellationToken::new())
        .await;
    assert!(matches!(closed, Err(FlowError::NotInitialized(_))));
}

#[tokio::test]
async fn test_session_setup_failure_releases_services() {
    let good = Arc::new(MockService::new("good", &["a"]));
    let bad = Arc::new(MockService::new("bad", &["b"]).failing_list());

    let result = WorkflowSession::from_parts(
        "demo",
        spec(3),
        Box::new(MockGateway::new(vec![])),
        vec![
            good.clone() as Arc<dyn BackendService>,
            bad.clone() as Arc<dyn BackendService>,
        ],
    )
    .await;

    assert!(matches!(result, Err(FlowError::ConnectionError { .. })));
    assert!(good.is_shut_down());
    assert!(bad.is_shut_down());
}
