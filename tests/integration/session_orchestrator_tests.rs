//! Integration tests for the client session orchestrator over a fake transport.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_dialogue::client::session::{SendOutcome, SessionOrchestrator};
use agent_dialogue::client::transport::{
    ChatTransport, ChunkStream, PendingInterrupt, SendRequest, SessionSnapshot, StreamChunk,
};
use agent_dialogue::config::RateLimitConfig;
use agent_dialogue::models::message::Message;
use agent_dialogue::{AppError, Result};
use futures_util::stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type ChunkSender = mpsc::UnboundedSender<Result<StreamChunk>>;

/// How the fake answers the next `open_stream` call.
enum Reply {
    /// Yield these chunks and end.
    Script(Vec<StreamChunk>),
    /// Yield whatever the test pushes through the paired sender.
    Live(mpsc::UnboundedReceiver<Result<StreamChunk>>),
    /// Fail to open.
    Refuse(String),
}

struct FakeTransport {
    replies: Mutex<VecDeque<Reply>>,
    snapshot: Mutex<SessionSnapshot>,
    sent: Mutex<Vec<SendRequest>>,
    resolved: Mutex<Vec<String>>,
    reject_answers: bool,
}

impl FakeTransport {
    fn new(replies: Vec<Reply>) -> Arc<Self> {
        Self::with_snapshot(replies, Vec::new(), None, false)
    }

    fn with_snapshot(
        replies: Vec<Reply>,
        messages: Vec<Message>,
        interrupt: Option<PendingInterrupt>,
        reject_answers: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            snapshot: Mutex::new(SessionSnapshot {
                session_id: "s1".into(),
                messages,
                interrupt,
            }),
            sent: Mutex::new(Vec::new()),
            resolved: Mutex::new(Vec::new()),
            reject_answers,
        })
    }

    fn sent_contents(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.content.clone())
            .collect()
    }

    fn resolved_interrupts(&self) -> Vec<String> {
        self.resolved.lock().unwrap().clone()
    }
}

fn done() -> StreamChunk {
    StreamChunk::Done {
        session_id: "s1".into(),
    }
}

fn chunk(text: &str) -> StreamChunk {
    StreamChunk::Chunk {
        content: text.into(),
    }
}

fn live() -> (ChunkSender, Reply) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, Reply::Live(rx))
}

impl ChatTransport for FakeTransport {
    fn open_stream(
        &self,
        request: SendRequest,
        _cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<ChunkStream>> + Send + '_>> {
        self.sent.lock().unwrap().push(request);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Reply::Script(vec![done()]));
        Box::pin(async move {
            match reply {
                Reply::Script(chunks) => {
                    let items = chunks.into_iter().map(Ok::<_, AppError>);
                    let stream: ChunkStream = Box::pin(stream::iter(items));
                    Ok(stream)
                }
                Reply::Live(rx) => {
                    let stream: ChunkStream = Box::pin(stream::unfold(rx, |mut rx| async move {
                        rx.recv().await.map(|item| (item, rx))
                    }));
                    Ok(stream)
                }
                Reply::Refuse(reason) => Err(AppError::Transport(reason)),
            }
        })
    }

    fn load_session(
        &self,
        _session_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<SessionSnapshot>> + Send + '_>> {
        let snapshot = self.snapshot.lock().unwrap().clone();
        Box::pin(async move { Ok(snapshot) })
    }

    fn submit_answers(
        &self,
        _session_id: &str,
        interrupt_id: &str,
        _answers: &BTreeMap<String, String>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        self.resolved.lock().unwrap().push(interrupt_id.to_owned());
        let result = if self.reject_answers {
            Err(AppError::InvalidAnswers("missing answers for [\"q2\"]".into()))
        } else {
            self.snapshot.lock().unwrap().interrupt = None;
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn cancel_interrupt(
        &self,
        _session_id: &str,
        interrupt_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        self.resolved.lock().unwrap().push(interrupt_id.to_owned());
        self.snapshot.lock().unwrap().interrupt = None;
        Box::pin(async { Ok(()) })
    }
}

fn orchestrator(transport: &Arc<FakeTransport>) -> SessionOrchestrator {
    SessionOrchestrator::new(
        Arc::clone(transport) as Arc<dyn ChatTransport>,
        &RateLimitConfig::default(),
    )
}

/// Poll until `check` holds, failing the test after five seconds.
async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition reached in time");
}

// ─── Sending ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn completed_send_reconciles_with_backend() {
    let committed = vec![
        Message::user("s1", "hello", Vec::new()),
        Message::assistant("s1", "hi there"),
    ];
    let transport = FakeTransport::with_snapshot(
        vec![Reply::Script(vec![chunk("hi "), chunk("there"), done()])],
        committed.clone(),
        None,
        false,
    );
    let session = orchestrator(&transport);
    session.set_input("hello").await;

    let outcome = session.send("hello", Vec::new()).await;
    assert_eq!(outcome, SendOutcome::Completed);

    let view = session.view().await;
    assert_eq!(view.session_id.as_deref(), Some("s1"));
    assert_eq!(view.messages, committed);
    assert!(view.input.is_empty());
    assert!(view.streaming_content.is_empty());
    assert!(!view.is_loading);
    assert!(!view.is_streaming);
    assert!(view.error.is_none());
}

#[tokio::test]
async fn second_send_while_streaming_is_busy() {
    let (tx, reply) = live();
    let transport = FakeTransport::new(vec![reply]);
    let session = orchestrator(&transport);

    let in_flight = tokio::spawn({
        let session = session.clone();
        async move { session.send("first", Vec::new()).await }
    });
    let watched = &session;
    wait_until(move || watched.is_loading()).await;

    assert_eq!(session.send("second", Vec::new()).await, SendOutcome::Busy);
    assert_eq!(transport.sent_contents(), vec!["first".to_owned()]);

    tx.send(Ok(done())).expect("stream open");
    assert_eq!(in_flight.await.expect("join"), SendOutcome::Completed);
}

#[tokio::test]
async fn exhausted_budget_is_rate_limited_without_io() {
    let transport = FakeTransport::new(Vec::new());
    let session = SessionOrchestrator::new(
        Arc::clone(&transport) as Arc<dyn ChatTransport>,
        &RateLimitConfig {
            max_requests: 1,
            window_seconds: 60,
        },
    );

    assert_eq!(session.send("one", Vec::new()).await, SendOutcome::Completed);
    let SendOutcome::RateLimited { retry_after } = session.send("two", Vec::new()).await else {
        panic!("expected rate limit");
    };
    assert!(retry_after > Duration::ZERO);
    assert!(retry_after <= Duration::from_secs(60));
    assert_eq!(transport.sent_contents(), vec!["one".to_owned()]);
}

#[tokio::test]
async fn stream_error_rolls_back_and_restores_draft() {
    let transport = FakeTransport::new(vec![Reply::Script(vec![
        chunk("partial"),
        StreamChunk::Error {
            message: "backend unavailable".into(),
        },
    ])]);
    let session = orchestrator(&transport);
    session.set_input("what changed?").await;

    let outcome = session.send("what changed?", Vec::new()).await;
    assert_eq!(
        outcome,
        SendOutcome::Failed {
            error: "backend unavailable".into()
        }
    );

    let view = session.view().await;
    assert!(view.messages.is_empty());
    assert_eq!(view.input, "what changed?");
    assert_eq!(view.error.as_deref(), Some("backend unavailable"));
    assert!(!view.is_loading);
}

#[tokio::test]
async fn refused_stream_is_a_failure() {
    let transport = FakeTransport::new(vec![Reply::Refuse("connection reset".into())]);
    let session = orchestrator(&transport);

    let outcome = session.send("hello", Vec::new()).await;
    assert!(matches!(
        outcome,
        SendOutcome::Failed { ref error } if error.contains("connection reset")
    ));
    assert_eq!(session.input().await, "hello");
}

#[tokio::test]
async fn stream_ending_without_done_is_a_failure() {
    let transport = FakeTransport::new(vec![Reply::Script(vec![chunk("half")])]);
    let session = orchestrator(&transport);

    assert!(matches!(
        session.send("hello", Vec::new()).await,
        SendOutcome::Failed { .. }
    ));
    assert!(session.messages().await.is_empty());
}

#[tokio::test]
async fn cancel_after_three_chunks_keeps_optimistic_turn() {
    let (tx, reply) = live();
    let transport = FakeTransport::new(vec![reply]);
    let session = orchestrator(&transport);
    session.set_input("tell me a story").await;

    let in_flight = tokio::spawn({
        let session = session.clone();
        async move { session.send("tell me a story", Vec::new()).await }
    });

    for text in ["Once ", "upon ", "a time"] {
        tx.send(Ok(chunk(text))).expect("stream open");
    }
    let watched = &session;
    wait_until(move || async move {
        watched.streaming_content().await == "Once upon a time"
    })
    .await;

    assert!(session.cancel().await);
    assert_eq!(in_flight.await.expect("join"), SendOutcome::Cancelled);

    let view = session.view().await;
    assert_eq!(view.messages.len(), 1);
    assert_eq!(view.messages[0].content(), "tell me a story");
    assert!(view.input.is_empty());
    assert!(view.streaming_content.is_empty());
    assert!(!view.is_loading);
    assert!(view.error.is_none());
    assert!(!session.cancel().await);
}

#[tokio::test]
async fn user_message_chunk_assigns_session_id() {
    let transport = FakeTransport::new(vec![Reply::Script(vec![
        StreamChunk::UserMessage {
            session_id: "s1".into(),
        },
        StreamChunk::Error {
            message: "quota".into(),
        },
    ])]);
    let session = orchestrator(&transport);

    session.send("hello", Vec::new()).await;
    assert_eq!(session.view().await.session_id.as_deref(), Some("s1"));
}

// ─── Queue, regenerate, edit ─────────────────────────────────────────────────

#[tokio::test]
async fn queued_sends_drain_after_completion() {
    let (tx, reply) = live();
    let transport = FakeTransport::new(vec![reply]);
    let session = orchestrator(&transport);

    let in_flight = tokio::spawn({
        let session = session.clone();
        async move { session.enqueue("first", Vec::new()).await }
    });
    let watched = &session;
    wait_until(move || watched.is_loading()).await;

    assert_eq!(
        session.enqueue("second", Vec::new()).await,
        SendOutcome::Queued { position: 1 }
    );
    assert_eq!(session.view().await.queued, 1);

    tx.send(Ok(done())).expect("stream open");
    assert_eq!(in_flight.await.expect("join"), SendOutcome::Completed);
    assert_eq!(
        transport.sent_contents(),
        vec!["first".to_owned(), "second".to_owned()]
    );
}

#[tokio::test]
async fn rate_limited_queued_send_stays_queued() {
    let (tx, reply) = live();
    let transport = FakeTransport::new(vec![reply]);
    let session = SessionOrchestrator::new(
        Arc::clone(&transport) as Arc<dyn ChatTransport>,
        &RateLimitConfig {
            max_requests: 1,
            window_seconds: 60,
        },
    );

    let in_flight = tokio::spawn({
        let session = session.clone();
        async move { session.enqueue("first", Vec::new()).await }
    });
    let watched = &session;
    wait_until(move || watched.is_loading()).await;
    assert_eq!(
        session.enqueue("second", Vec::new()).await,
        SendOutcome::Queued { position: 1 }
    );

    tx.send(Ok(done())).expect("stream open");
    assert_eq!(in_flight.await.expect("join"), SendOutcome::Completed);

    let view = session.view().await;
    assert_eq!(transport.sent_contents(), vec!["first".to_owned()]);
    assert_eq!(view.queued, 1);
    assert!(view.error.expect("hold-back shown").contains("retry in"));

    assert!(matches!(
        session.flush_queue().await,
        Some(SendOutcome::RateLimited { .. })
    ));
    assert_eq!(session.view().await.queued, 1);
    assert_eq!(
        session.enqueue("third", Vec::new()).await,
        SendOutcome::Queued { position: 2 }
    );
}

#[tokio::test]
async fn regenerate_resends_preceding_user_turn() {
    let user = Message::user("s1", "summarize the report", Vec::new());
    let reply = Message::assistant("s1", "here is a summary");
    let transport =
        FakeTransport::with_snapshot(Vec::new(), vec![user.clone(), reply.clone()], None, false);
    let session = SessionOrchestrator::open(
        Arc::clone(&transport) as Arc<dyn ChatTransport>,
        &RateLimitConfig::default(),
        "s1",
    )
    .await
    .expect("open");

    let outcome = session.regenerate(reply.id()).await.expect("regenerate");
    assert_eq!(outcome, SendOutcome::Completed);
    assert_eq!(transport.sent_contents(), vec!["summarize the report".to_owned()]);

    assert!(matches!(
        session.regenerate("unknown").await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn edit_sends_new_content_for_user_turn_only() {
    let user = Message::user("s1", "draft", Vec::new());
    let reply = Message::assistant("s1", "ok");
    let transport =
        FakeTransport::with_snapshot(Vec::new(), vec![user.clone(), reply.clone()], None, false);
    let session = SessionOrchestrator::open(
        Arc::clone(&transport) as Arc<dyn ChatTransport>,
        &RateLimitConfig::default(),
        "s1",
    )
    .await
    .expect("open");

    assert!(matches!(
        session.edit(reply.id(), "nope").await,
        Err(AppError::NotFound(_))
    ));
    let outcome = session.edit(user.id(), "final wording").await.expect("edit");
    assert_eq!(outcome, SendOutcome::Completed);
    assert_eq!(transport.sent_contents(), vec!["final wording".to_owned()]);
}

// ─── Interrupts ──────────────────────────────────────────────────────────────

fn pending_interrupt() -> PendingInterrupt {
    PendingInterrupt {
        id: "int-1".into(),
        kind: "ask_user_question".into(),
        data: None,
    }
}

async fn interrupted_session(reject_answers: bool) -> (Arc<FakeTransport>, SessionOrchestrator) {
    let transport = FakeTransport::with_snapshot(
        Vec::new(),
        vec![Message::user("s1", "plan a trip", Vec::new())],
        Some(pending_interrupt()),
        reject_answers,
    );
    let session = SessionOrchestrator::open(
        Arc::clone(&transport) as Arc<dyn ChatTransport>,
        &RateLimitConfig::default(),
        "s1",
    )
    .await
    .expect("open");
    (transport, session)
}

#[tokio::test]
async fn accepted_answers_clear_interrupt() {
    let (_transport, session) = interrupted_session(false).await;
    assert_eq!(session.interrupt().await, Some(pending_interrupt()));

    let answers = BTreeMap::from([("q1".to_owned(), "2024".to_owned())]);
    session.submit_answers("int-1", &answers).await.expect("submit");
    assert!(session.interrupt().await.is_none());

    assert!(matches!(
        session.submit_answers("int-1", &answers).await,
        Err(AppError::AlreadyConsumed(_))
    ));
}

#[tokio::test]
async fn answers_for_another_interrupt_are_refused_without_io() {
    let (transport, session) = interrupted_session(false).await;

    let answers = BTreeMap::from([("q1".to_owned(), "2024".to_owned())]);
    let result = session.submit_answers("int-0", &answers).await;
    assert!(matches!(result, Err(AppError::AlreadyConsumed(_))));
    assert!(matches!(
        session.cancel_interrupt("int-0").await,
        Err(AppError::AlreadyConsumed(_))
    ));

    assert!(transport.resolved_interrupts().is_empty());
    assert_eq!(session.interrupt().await, Some(pending_interrupt()));
}

#[tokio::test]
async fn rejected_answers_restore_interrupt_and_surface_error() {
    let (_transport, session) = interrupted_session(true).await;

    let answers = BTreeMap::from([("q1".to_owned(), "2024".to_owned())]);
    let result = session.submit_answers("int-1", &answers).await;
    assert!(matches!(result, Err(AppError::InvalidAnswers(_))));

    let view = session.view().await;
    assert_eq!(view.interrupt, Some(pending_interrupt()));
    assert!(view.error.expect("error shown").contains("q2"));
}

#[tokio::test]
async fn cancel_interrupt_clears_it() {
    let (transport, session) = interrupted_session(false).await;
    session.cancel_interrupt("int-1").await.expect("cancel");
    assert_eq!(transport.resolved_interrupts(), vec!["int-1".to_owned()]);
    assert!(session.interrupt().await.is_none());
}
