//! End-to-end session flows against a mock server: execute + stream fold,
//! question/respond resume, deletion semantics, cancel idempotence, and the
//! pending-question poll fallback.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Mutex;

use tether::conversation::{Conversation, MessageKind, Status};
use tether::error::Error;
use tether::poller::QuestionPoller;
use tether::session::{EventFeed, SessionClient, SessionDriver, SessionRegistry};
use tether::transport::Transport;

mod common;
use common::{CannedResponse, ScriptedServer};

fn driver_for(base_url: &str) -> Arc<SessionDriver> {
    let transport = Arc::new(Transport::new(base_url));
    let client = Arc::new(SessionClient::new(transport));
    let registry = Arc::new(SessionRegistry::new());
    SessionDriver::new(client, registry)
}

async fn drain(mut feed: EventFeed) -> usize {
    let mut count = 0;
    while feed.next().await.is_some() {
        count += 1;
    }
    // Let the stream task run its teardown before asserting.
    tokio::time::sleep(Duration::from_millis(50)).await;
    count
}

fn sse(frames: &[&str]) -> String {
    frames
        .iter()
        .map(|frame| format!("data: {frame}\n\n"))
        .collect()
}

#[tokio::test]
async fn execute_folds_tool_stream_into_conversation() {
    let stream = ScriptedServer::start(vec![CannedResponse::sse(sse(&[
        r#"{"type":"started"}"#,
        r#"{"type":"tool_call_start","tool_call_id":"c1","tool_name":"bash","parameters":{"command":"ls"}}"#,
        r#"{"type":"tool_token","tool_call_id":"c1","content":"a.txt\n"}"#,
        r#"{"type":"tool_result","tool_call_id":"c1","result":{"result":"a.txt"}}"#,
        r#"{"type":"done"}"#,
    ]))])
    .await;

    let mut api = mockito::Server::new_async().await;
    api.mock("POST", "/chat")
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(r#"{"session_id":"s1","status":"streaming"}"#)
        .create_async()
        .await;
    api.mock("POST", "/execute/s1")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(format!(
            r#"{{"status":"started","events_url":"{}/events/s1"}}"#,
            stream.url()
        ))
        .create_async()
        .await;

    let driver = driver_for(&api.url());
    let feed = driver.send("list the files", "kimi-for-coding").await.unwrap();
    let events = drain(feed).await;
    assert_eq!(events, 5);

    let conversation = driver.conversation().lock().await;
    assert_eq!(conversation.status(), Status::Idle);
    let messages = conversation.messages();
    assert_eq!(messages.len(), 3);
    assert!(matches!(messages[0].kind, MessageKind::User { .. }));
    match &messages[1].kind {
        MessageKind::AssistantToolCall { tool_calls } => {
            assert_eq!(tool_calls[0].tool_call_id, "c1");
            assert_eq!(tool_calls[0].streaming_output, None);
        }
        other => panic!("expected tool call, got {other:?}"),
    }
    match &messages[2].kind {
        MessageKind::AssistantToolResult { tool_call_id, .. } => assert_eq!(tool_call_id, "c1"),
        other => panic!("expected tool result, got {other:?}"),
    }
    drop(conversation);

    assert!(!driver.registry().has_active("s1").await);
}

#[tokio::test]
async fn stream_closing_before_done_resets_to_idle_with_error() {
    let stream = ScriptedServer::start(vec![CannedResponse::sse(sse(&[
        r#"{"type":"started"}"#,
        r#"{"type":"text_delta","content":"partial"}"#,
    ]))])
    .await;

    let mut api = mockito::Server::new_async().await;
    api.mock("POST", "/chat")
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(r#"{"session_id":"s1","status":"streaming"}"#)
        .create_async()
        .await;
    api.mock("POST", "/execute/s1")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(format!(
            r#"{{"status":"started","events_url":"{}/events/s1"}}"#,
            stream.url()
        ))
        .create_async()
        .await;

    let driver = driver_for(&api.url());
    let feed = driver.send("hello", "kimi-for-coding").await.unwrap();
    drain(feed).await;

    let conversation = driver.conversation().lock().await;
    assert_eq!(conversation.status(), Status::Idle);
    assert!(conversation.pending_question().is_none());
    assert_eq!(conversation.last_error(), Some("stream ended before done"));
    drop(conversation);
    assert!(!driver.registry().has_active("s1").await);
}

#[tokio::test]
async fn question_pauses_and_respond_resumes_to_done() {
    let stream = ScriptedServer::start(vec![
        CannedResponse::sse(sse(&[
            r#"{"type":"started"}"#,
            r#"{"type":"question","question":"Pick A or B","options":["A","B"],"allow_custom":false}"#,
        ])),
        CannedResponse::sse(sse(&[
            r#"{"type":"started"}"#,
            r#"{"type":"text_delta","content":"Picked B."}"#,
            r#"{"type":"done"}"#,
        ])),
    ])
    .await;

    let mut api = mockito::Server::new_async().await;
    api.mock("POST", "/chat")
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(r#"{"session_id":"s1","status":"streaming"}"#)
        .create_async()
        .await;
    api.mock("POST", "/execute/s1")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(format!(
            r#"{{"status":"started","events_url":"{}/events/s1"}}"#,
            stream.url()
        ))
        .expect(2)
        .create_async()
        .await;
    let respond = api
        .mock("POST", "/respond/s1")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body("{}")
        .expect(1)
        .create_async()
        .await;

    let driver = driver_for(&api.url());
    let feed = driver.send("choose", "kimi-for-coding").await.unwrap();
    drain(feed).await;

    {
        let conversation = driver.conversation().lock().await;
        assert_eq!(conversation.status(), Status::AwaitingApproval);
        let question = conversation.pending_question().unwrap();
        assert_eq!(question.question, "Pick A or B");
        assert_eq!(question.options, vec!["A".to_string(), "B".to_string()]);
    }

    let feed = driver.respond("B").await.unwrap();
    drain(feed).await;
    respond.assert_async().await;

    let conversation = driver.conversation().lock().await;
    assert_eq!(conversation.status(), Status::Idle);
    assert!(conversation.pending_question().is_none());
    let last = conversation.messages().last().unwrap();
    assert_eq!(
        last.kind,
        MessageKind::AssistantText {
            content: "Picked B.".to_string()
        }
    );
}

#[tokio::test]
async fn send_without_provider_is_rejected_and_conversation_stays_usable() {
    let mut api = mockito::Server::new_async().await;
    api.mock("POST", "/chat")
        .with_status(400)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error":"no provider configured"}"#)
        .create_async()
        .await;

    let driver = driver_for(&api.url());
    let err = driver.send("hello", "kimi-for-coding").await.unwrap_err();
    assert_eq!(err, Error::ExecutionRejected("no provider configured".into()));

    let conversation = driver.conversation().lock().await;
    assert_eq!(conversation.status(), Status::Idle);
    assert!(conversation.last_error().is_some());
}

#[tokio::test]
async fn blank_model_never_reaches_the_wire() {
    // Nothing is mocked; a request would fail loudly.
    let driver = driver_for("http://127.0.0.1:9");
    let err = driver.send("hello", "   ").await.unwrap_err();
    assert!(matches!(err, Error::ExecutionRejected(_)));
}

#[tokio::test]
async fn delete_treats_404_as_already_deleted() {
    let mut api = mockito::Server::new_async().await;
    api.mock("DELETE", "/sessions/gone")
        .with_status(404)
        .create_async()
        .await;

    let transport = Arc::new(Transport::new(&api.url()));
    let client = SessionClient::new(transport);
    client.delete_session("gone").await.unwrap();
}

#[tokio::test]
async fn delete_failure_maps_to_session_deletion_failed() {
    let mut api = mockito::Server::new_async().await;
    api.mock("DELETE", "/sessions/s1")
        .with_status(500)
        .with_body("db unavailable")
        .expect(3)
        .create_async()
        .await;

    let transport = Arc::new(Transport::new(&api.url()));
    let client = SessionClient::new(transport);
    let err = client.delete_session("s1").await.unwrap_err();
    assert_eq!(
        err,
        Error::SessionDeletionFailed {
            status: 500,
            message: "db unavailable".to_string()
        }
    );
}

#[tokio::test]
async fn cancel_twice_is_not_an_error() {
    let mut api = mockito::Server::new_async().await;
    api.mock("POST", "/cancel/s1")
        .with_status(404)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error":"not running"}"#)
        .expect(2)
        .create_async()
        .await;

    let transport = Arc::new(Transport::new(&api.url()));
    let client = SessionClient::new(transport);
    client.cancel("s1").await.unwrap();
    client.cancel("s1").await.unwrap();
}

#[tokio::test]
async fn poller_surfaces_question_once_then_resumes_after_answer() {
    let server = ScriptedServer::start(vec![
        CannedResponse::json(200, r#"{"has_pending_question":false}"#),
        CannedResponse::json(200, r#"{"has_pending_question":false}"#),
        CannedResponse::json(200, r#"{"has_pending_question":false}"#),
        CannedResponse::json(200, r#"{"has_pending_question":false}"#),
        CannedResponse::json(
            200,
            r#"{"has_pending_question":true,"question":"Pick A or B","options":["A","B"],"allow_custom":false}"#,
        ),
        CannedResponse::json(
            200,
            r#"{"has_pending_question":true,"question":"Second question","options":[],"allow_custom":true}"#,
        ),
    ])
    .await;

    let transport = Arc::new(Transport::new(server.url()));
    let client = Arc::new(SessionClient::new(transport));
    let registry = Arc::new(SessionRegistry::new());
    let conversation = Arc::new(Mutex::new(Conversation::new()));

    let poller = QuestionPoller::new(
        Arc::clone(&client),
        Arc::clone(&registry),
        Arc::clone(&conversation),
        "s1",
    )
    .with_interval(Duration::from_millis(50));
    let task = poller.spawn();

    // Four empty polls, then the question lands on the fifth.
    tokio::time::sleep(Duration::from_millis(600)).await;
    {
        let conversation = conversation.lock().await;
        assert_eq!(conversation.status(), Status::AwaitingApproval);
        assert_eq!(
            conversation.pending_question().unwrap().question,
            "Pick A or B"
        );
    }
    let hits_when_surfaced = server.hits();
    assert_eq!(hits_when_surfaced, 5);

    // Suspended while the question is on screen.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.hits(), hits_when_surfaced);

    // Answer submitted; polling resumes and the next question in the chain
    // surfaces without a gap.
    conversation.lock().await.respond_submitted();
    tokio::time::sleep(Duration::from_millis(300)).await;
    {
        let conversation = conversation.lock().await;
        assert_eq!(
            conversation.pending_question().unwrap().question,
            "Second question"
        );
    }
    assert_eq!(server.hits(), hits_when_surfaced + 1);

    task.abort();
}
