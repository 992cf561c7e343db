//! Integration tests for the bounded agent loop with scripted collaborators.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use agent_dialogue::config::AgentConfig;
use agent_dialogue::models::checkpoint::{AgentPhase, Checkpoint, ThreadScope, ASK_USER_QUESTION};
use agent_dialogue::models::message::{Message, ToolCall};
use agent_dialogue::models::payload::RawPayload;
use agent_dialogue::observability::projection::TraceProjector;
use agent_dialogue::orchestrator::agent_loop::{
    AgentLoop, ChatModel, ModelReply, ModelRequest, ModelStep, ToolExecutor, ToolOutcome,
    TurnOutcome,
};
use agent_dialogue::orchestrator::thread_run::CANCELLED_ANSWER;
use agent_dialogue::persistence::checkpoint_repo::CheckpointRepo;
use agent_dialogue::persistence::db::Database;
use agent_dialogue::persistence::trace_repo::TraceRepo;
use agent_dialogue::{AppError, Result};
use tokio::sync::mpsc;

use super::test_helpers::{fast_retry, memory_db, questions, scope};

/// Model that replays a fixed script and records what it was shown.
struct ScriptedModel {
    replies: Mutex<VecDeque<ModelReply>>,
    seen: Mutex<Vec<usize>>,
}

impl ScriptedModel {
    fn new(replies: Vec<ModelStep>) -> Arc<Self> {
        let replies = replies
            .into_iter()
            .enumerate()
            .map(|(idx, step)| ModelReply {
                step,
                response_id: Some(format!("resp-{}", idx + 1)),
            })
            .collect();
        Arc::new(Self {
            replies: Mutex::new(replies),
            seen: Mutex::new(Vec::new()),
        })
    }
}

impl ChatModel for ScriptedModel {
    fn generate<'a>(
        &'a self,
        request: ModelRequest<'a>,
        tokens: mpsc::Sender<String>,
    ) -> Pin<Box<dyn Future<Output = Result<ModelReply>> + Send + 'a>> {
        self.seen.lock().unwrap().push(request.messages.len());
        let reply = self.replies.lock().unwrap().pop_front();
        Box::pin(async move {
            let reply = reply.ok_or_else(|| AppError::Transport("script exhausted".into()))?;
            if let ModelStep::Answer { content, .. } = &reply.step {
                let _ = tokens.send(content.clone()).await;
            }
            Ok(reply)
        })
    }
}

/// Tool runtime that echoes arguments, defers `approve`, and fails `broken`.
struct EchoTools;

impl ToolExecutor for EchoTools {
    fn execute<'a>(
        &'a self,
        call: &'a ToolCall,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutcome>> + Send + 'a>> {
        Box::pin(async move {
            match call.name.as_str() {
                "approve" => Ok(ToolOutcome::Deferred),
                "broken" => Err(AppError::Transport("tool host unreachable".into())),
                name => Ok(ToolOutcome::Completed(format!("{name}:{}", call.arguments))),
            }
        })
    }
}

fn build_loop(db: &Arc<Database>, model: Arc<ScriptedModel>, max_steps: u32) -> AgentLoop {
    AgentLoop::new(
        model,
        Arc::new(EchoTools),
        CheckpointRepo::new(Arc::clone(db)),
        TraceProjector::new(TraceRepo::new(Arc::clone(db)), fast_retry()),
        AgentConfig { max_steps },
        fast_retry(),
    )
}

fn answer(content: &str) -> ModelStep {
    ModelStep::Answer {
        content: content.to_owned(),
        debug_trace: None,
    }
}

fn tool_calls(calls: Vec<ToolCall>) -> ModelStep {
    ModelStep::ToolCalls {
        content: String::new(),
        calls,
    }
}

async fn latest(db: &Arc<Database>, scope: &ThreadScope) -> Checkpoint {
    CheckpointRepo::new(Arc::clone(db))
        .latest(&scope.tenant_id, &scope.thread_id)
        .await
        .expect("latest")
        .expect("saved")
}

fn user(content: &str) -> Message {
    Message::user("session-1", content, Vec::new())
}

// ─── Turns ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn direct_answer_completes_turn_and_streams_tokens() {
    let db = memory_db().await;
    let agent = build_loop(&db, ScriptedModel::new(vec![answer("hi there")]), 5);
    let (tx, mut rx) = mpsc::channel(8);

    let outcome = agent
        .run_turn(&scope("t1"), "analyst", user("hello"), tx)
        .await
        .expect("turn");

    let TurnOutcome::Completed { answer } = outcome else {
        panic!("expected completion");
    };
    assert_eq!(answer.content(), "hi there");
    assert_eq!(rx.recv().await.as_deref(), Some("hi there"));

    let stored = latest(&db, &scope("t1")).await;
    assert_eq!(stored.messages.len(), 2);
    assert_eq!(stored.phase(), AgentPhase::Completed);
    assert_eq!(stored.previous_response_id.as_deref(), Some("resp-1"));
}

#[tokio::test]
async fn in_process_tools_run_before_next_model_call() {
    let db = memory_db().await;
    let model = ScriptedModel::new(vec![
        tool_calls(vec![
            ToolCall::new("c1", "search", "rust"),
            ToolCall::new("c2", "broken", "{}"),
        ]),
        answer("found it"),
    ]);
    let agent = build_loop(&db, Arc::clone(&model), 5);
    let (tx, _rx) = mpsc::channel(8);

    let outcome = agent
        .run_turn(&scope("t1"), "analyst", user("look it up"), tx)
        .await
        .expect("turn");
    assert!(matches!(outcome, TurnOutcome::Completed { .. }));

    let stored = latest(&db, &scope("t1")).await;
    // user, assistant(calls), tool c1, tool c2, final answer
    assert_eq!(stored.messages.len(), 5);
    assert_eq!(stored.messages[2].content(), "search:rust");
    assert!(stored.messages[3].content().contains("tool host unreachable"));
    assert_eq!(*model.seen.lock().unwrap(), vec![1, 4]);
}

#[tokio::test]
async fn deferred_tool_suspends_until_results_arrive() {
    let db = memory_db().await;
    let model = ScriptedModel::new(vec![
        tool_calls(vec![
            ToolCall::new("c1", "search", "q"),
            ToolCall::new("c2", "approve", "{}"),
        ]),
        answer("approved and done"),
    ]);
    let agent = build_loop(&db, model, 5);
    let (tx, _rx) = mpsc::channel(8);

    let outcome = agent
        .run_turn(&scope("t1"), "analyst", user("deploy"), tx.clone())
        .await
        .expect("turn");
    let TurnOutcome::ToolPending { calls, completed } = outcome else {
        panic!("expected tool pending");
    };
    assert_eq!(calls.len(), 2);
    assert_eq!(completed.get("c1").map(String::as_str), Some("search:q"));
    assert_eq!(latest(&db, &scope("t1")).await.phase(), AgentPhase::ToolPending);

    let mut results: BTreeMap<String, String> = completed;
    results.insert("c2".into(), "yes".into());
    let resumed = agent
        .resume_tools(&scope("t1"), "analyst", &results, tx)
        .await
        .expect("resume");
    assert!(matches!(resumed, TurnOutcome::Completed { .. }));
    assert_eq!(latest(&db, &scope("t1")).await.phase(), AgentPhase::Completed);
}

#[tokio::test]
async fn partial_tool_results_are_rejected() {
    let db = memory_db().await;
    let model = ScriptedModel::new(vec![tool_calls(vec![ToolCall::new("c1", "approve", "{}")])]);
    let agent = build_loop(&db, model, 5);
    let (tx, _rx) = mpsc::channel(8);

    agent
        .run_turn(&scope("t1"), "analyst", user("deploy"), tx.clone())
        .await
        .expect("turn");

    let results = BTreeMap::from([("c7".to_owned(), "yes".to_owned())]);
    let result = agent.resume_tools(&scope("t1"), "analyst", &results, tx).await;
    assert!(matches!(result, Err(AppError::InvalidTransition(_))));
}

#[tokio::test]
async fn step_budget_leaves_thread_running() {
    let db = memory_db().await;
    let model = ScriptedModel::new(vec![
        tool_calls(vec![ToolCall::new("c1", "search", "a")]),
        tool_calls(vec![ToolCall::new("c2", "search", "b")]),
        answer("never reached"),
    ]);
    let agent = build_loop(&db, model, 2);
    let (tx, _rx) = mpsc::channel(8);

    let outcome = agent
        .run_turn(&scope("t1"), "analyst", user("loop"), tx)
        .await
        .expect("turn");
    assert_eq!(outcome, TurnOutcome::StepLimitReached { steps: 2 });
    assert_eq!(latest(&db, &scope("t1")).await.phase(), AgentPhase::Running);
}

// ─── Questions ───────────────────────────────────────────────────────────────

fn ask(ids: &[&str]) -> ModelStep {
    ModelStep::AskUser {
        call: ToolCall::new("ask-1", ASK_USER_QUESTION, "{}"),
        questions: questions(ids),
    }
}

#[tokio::test]
async fn question_round_trip_through_loop() {
    let db = memory_db().await;
    let model = ScriptedModel::new(vec![ask(&["q1"]), answer("see you in 2024")]);
    let agent = build_loop(&db, model, 5);
    let (tx, _rx) = mpsc::channel(8);

    let outcome = agent
        .run_turn(&scope("t1"), "analyst", user("plan a trip"), tx.clone())
        .await
        .expect("turn");
    let TurnOutcome::Interrupted { interrupt } = outcome else {
        panic!("expected interrupt");
    };
    assert_eq!(interrupt.kind, ASK_USER_QUESTION);
    assert_eq!(interrupt.previous_response_id.as_deref(), Some("resp-1"));

    let answers = BTreeMap::from([("q1".to_owned(), "2024".to_owned())]);
    let resumed = agent
        .submit_answers(&scope("t1"), "analyst", &answers, tx.clone())
        .await
        .expect("submit");
    assert!(matches!(resumed, TurnOutcome::Completed { .. }));

    let stored = latest(&db, &scope("t1")).await;
    let reply = stored
        .messages
        .iter()
        .find(|m| m.tool_call_id() == Some("ask-1"))
        .expect("question answered");
    assert_eq!(reply.content(), r#"{"q1":"2024"}"#);

    let again = agent
        .submit_answers(&scope("t1"), "analyst", &answers, tx)
        .await;
    assert!(matches!(again, Err(AppError::AlreadyConsumed(_))));
}

#[tokio::test]
async fn new_turn_abandons_outstanding_question() {
    let db = memory_db().await;
    let model = ScriptedModel::new(vec![ask(&["q1"]), answer("ok, something else")]);
    let agent = build_loop(&db, model, 5);
    let (tx, _rx) = mpsc::channel(8);

    agent
        .run_turn(&scope("t1"), "analyst", user("plan a trip"), tx.clone())
        .await
        .expect("first turn");
    agent
        .run_turn(&scope("t1"), "analyst", user("forget it"), tx)
        .await
        .expect("second turn");

    let stored = latest(&db, &scope("t1")).await;
    let reply = stored
        .messages
        .iter()
        .find(|m| m.tool_call_id() == Some("ask-1"))
        .expect("question closed");
    assert_eq!(reply.content(), CANCELLED_ANSWER);
    assert_eq!(stored.phase(), AgentPhase::Completed);
}

#[tokio::test]
async fn cancel_interrupt_without_continuing() {
    let db = memory_db().await;
    let agent = build_loop(&db, ScriptedModel::new(vec![ask(&["q1"])]), 5);
    let (tx, _rx) = mpsc::channel(8);

    agent
        .run_turn(&scope("t1"), "analyst", user("plan a trip"), tx)
        .await
        .expect("turn");
    agent
        .cancel_interrupt(&scope("t1"), "analyst")
        .await
        .expect("cancel");

    let stored = latest(&db, &scope("t1")).await;
    assert!(stored.interrupt.is_none());
    assert!(matches!(
        agent.cancel_interrupt(&scope("t1"), "analyst").await,
        Err(AppError::AlreadyConsumed(_))
    ));
}

// ─── Trace projection ────────────────────────────────────────────────────────

#[tokio::test]
async fn final_answer_trace_is_projected() {
    let db = memory_db().await;
    let bundle = RawPayload::from_value(&serde_json::json!({
        "traceId": "tr-loop",
        "generationMs": 320,
        "tools": [{"callId": "c1", "name": "search"}],
    }))
    .expect("bundle");
    let model = ScriptedModel::new(vec![ModelStep::Answer {
        content: "traced".into(),
        debug_trace: Some(bundle),
    }]);
    let agent = build_loop(&db, model, 5);
    let (tx, _rx) = mpsc::channel(8);

    agent
        .run_turn(&scope("t1"), "analyst", user("go"), tx)
        .await
        .expect("turn");

    let trace = TraceRepo::new(Arc::clone(&db))
        .get_trace("tenant-a", "tr-loop")
        .await
        .expect("query")
        .expect("trace row");
    assert_eq!(trace.session_id, "session-1");
    assert_eq!(trace.generation_ms, 320);
}
