use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::conversation::{Conversation, Status};
use crate::error::{Error, Result};
use crate::events::{PendingQuestion, PendingQuestionResponse, SessionEvent, SseFrameBuffer, decode_frame};
use crate::transport::Transport;

const EVENT_CHANNEL_CAPACITY: usize = 200;

/// Decoded events of one run, in arrival order.
pub type EventFeed = BroadcastStream<SessionEvent>;

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    model: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteResponse {
    pub status: String,
    pub events_url: String,
}

/// `model` is mandatory on every send; the server never infers a default.
#[derive(Debug, Clone, Serialize)]
pub struct SendMessageRequest {
    pub message: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageResponse {
    pub session_id: String,
    pub status: String,
    #[serde(default)]
    pub stream_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct RespondRequest<'a> {
    response: &'a str,
}

/// Issues the lifecycle calls for one server-tracked agent session.
pub struct SessionClient {
    transport: Arc<Transport>,
}

impl SessionClient {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Starts (or resumes) the agent run for a session. 4xx means the server
    /// refused the execution outright, e.g. no provider configured.
    pub async fn execute(&self, session_id: &str, model: &str) -> Result<ExecuteResponse> {
        let model = require_model(model)?;
        let body = serde_json::to_value(ExecuteRequest { model })?;
        self.transport
            .post(&format!("execute/{session_id}"), &body)
            .await
            .map_err(reject_on_client_error)?
            .json()
    }

    /// Composes a new session when `conversation_id` is absent, otherwise
    /// appends to the existing one.
    pub async fn send_message(&self, request: &SendMessageRequest) -> Result<SendMessageResponse> {
        require_model(&request.model)?;
        let body = serde_json::to_value(request)?;
        self.transport
            .post("chat", &body)
            .await
            .map_err(reject_on_client_error)?
            .json()
    }

    /// Submits the answer to a pending question. Must land before `execute`
    /// is reissued to continue the paused agent.
    pub async fn respond(&self, session_id: &str, response: &str) -> Result<()> {
        let body = serde_json::to_value(RespondRequest { response })?;
        self.transport
            .post(&format!("respond/{session_id}"), &body)
            .await?;
        Ok(())
    }

    /// Requests server-side termination. Idempotent: a session that already
    /// stopped (404/409) is not an error.
    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        let body = Value::Object(Default::default());
        match self
            .transport
            .post(&format!("cancel/{session_id}"), &body)
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::Client { status: 404, .. }) | Err(Error::Client { status: 409, .. }) => {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Removes server-side session state. 404 means already deleted.
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        match self
            .transport
            .delete(&format!("sessions/{session_id}"))
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::Client { status: 404, .. }) => Ok(()),
            Err(Error::Client { status, message }) | Err(Error::Server { status, message }) => {
                Err(Error::SessionDeletionFailed { status, message })
            }
            Err(err) => Err(err),
        }
    }

    pub async fn pending_question(&self, session_id: &str) -> Result<Option<PendingQuestion>> {
        let response: PendingQuestionResponse = self
            .transport
            .get(&format!("respond/{session_id}/pending"))
            .await?
            .json()?;
        Ok(response.into_pending())
    }

    /// Opens the event stream and invokes the callback once per decoded
    /// event, in arrival order. Malformed frames are logged and skipped.
    /// Runs until the server closes the stream or the task is aborted; the
    /// 30s request scope deliberately does not apply here.
    pub async fn stream_events<F, Fut>(&self, events_url: &str, mut on_event: F) -> Result<()>
    where
        F: FnMut(SessionEvent) -> Fut,
        Fut: Future<Output = ()>,
    {
        let url = if events_url.starts_with("http://") || events_url.starts_with("https://") {
            events_url.to_string()
        } else {
            self.transport.url(events_url)
        };

        let response = self.transport.http().get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return if status.is_server_error() {
                Err(Error::Server {
                    status: status.as_u16(),
                    message,
                })
            } else {
                Err(Error::Client {
                    status: status.as_u16(),
                    message,
                })
            };
        }

        let mut stream = response.bytes_stream();
        let mut frames = SseFrameBuffer::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            let chunk = String::from_utf8_lossy(&chunk);
            for payload in frames.push(&chunk) {
                match decode_frame(&payload) {
                    Ok(event) => {
                        let terminal = matches!(event, SessionEvent::Done);
                        on_event(event).await;
                        if terminal {
                            return Ok(());
                        }
                    }
                    Err(err) => tracing::warn!(%err, "dropping undecodable stream frame"),
                }
            }
        }

        Ok(())
    }
}

fn require_model(model: &str) -> Result<&str> {
    let model = model.trim();
    if model.is_empty() {
        return Err(Error::ExecutionRejected("model is required".to_string()));
    }
    Ok(model)
}

fn reject_on_client_error(err: Error) -> Error {
    match err {
        Error::Client { message, .. } => Error::ExecutionRejected(message),
        other => other,
    }
}

/// Handler set for `handle_event`. Every method defaults to a no-op so
/// callers implement only the arms they care about.
pub trait EventHandlers {
    fn on_started(&mut self) {}
    fn on_text_delta(&mut self, _content: &str) {}
    fn on_tool_call_start(&mut self, _tool_call_id: &str, _tool_name: &str, _parameters: &Value) {}
    fn on_tool_token(&mut self, _tool_call_id: &str, _content: &str) {}
    fn on_tool_result(&mut self, _tool_call_id: &str, _result: &Value) {}
    fn on_question(&mut self, _question: &PendingQuestion) {}
    fn on_error(&mut self, _message: &str) {}
    fn on_done(&mut self) {}
    fn on_unknown(&mut self) {}
}

/// Pure type-switch over the event sum: calls exactly one handler method
/// with no other side effect, so dispatch is testable without a stream.
pub fn handle_event(event: &SessionEvent, handlers: &mut impl EventHandlers) {
    match event {
        SessionEvent::Started => handlers.on_started(),
        SessionEvent::TextDelta { content } => handlers.on_text_delta(content),
        SessionEvent::ToolCallStart {
            tool_call_id,
            tool_name,
            parameters,
        } => handlers.on_tool_call_start(tool_call_id, tool_name, parameters),
        SessionEvent::ToolToken {
            tool_call_id,
            content,
        } => handlers.on_tool_token(tool_call_id, content),
        SessionEvent::ToolResult {
            tool_call_id,
            result,
        } => handlers.on_tool_result(tool_call_id, result),
        SessionEvent::Question {
            question,
            options,
            allow_custom,
            tool_call_id,
        } => handlers.on_question(&PendingQuestion {
            question: question.clone(),
            options: options.clone(),
            allow_custom: *allow_custom,
            tool_call_id: tool_call_id.clone(),
        }),
        SessionEvent::Error { message } => handlers.on_error(message),
        SessionEvent::Done => handlers.on_done(),
        SessionEvent::Unknown => handlers.on_unknown(),
    }
}

struct Subscription {
    task: JoinHandle<()>,
    events: broadcast::Sender<SessionEvent>,
}

/// Maps open sessionId → live stream subscription. Entries appear on attach
/// and disappear on stream end, cancel, or delete. `has_active` is the
/// explicit flag the poller consults; the poller must never run while a
/// stream is attached.
#[derive(Default)]
pub struct SessionRegistry {
    entries: Mutex<HashMap<String, Subscription>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn insert(&self, session_id: &str, subscription: Subscription) {
        let mut entries = self.entries.lock().await;
        if let Some(previous) = entries.insert(session_id.to_string(), subscription) {
            previous.task.abort();
        }
    }

    /// Entry removal by the stream task itself once the stream ends.
    async fn finish(&self, session_id: &str) {
        self.entries.lock().await.remove(session_id);
    }

    /// Abort the live stream (cancel/delete path). No-op when nothing is
    /// attached.
    pub async fn detach(&self, session_id: &str) {
        if let Some(subscription) = self.entries.lock().await.remove(session_id) {
            subscription.task.abort();
        }
    }

    pub async fn has_active(&self, session_id: &str) -> bool {
        self.entries
            .lock()
            .await
            .get(session_id)
            .map(|subscription| !subscription.task.is_finished())
            .unwrap_or(false)
    }

    /// Display-layer subscription to the decoded event feed.
    pub async fn subscribe(&self, session_id: &str) -> Option<BroadcastStream<SessionEvent>> {
        self.entries
            .lock()
            .await
            .get(session_id)
            .map(|subscription| BroadcastStream::new(subscription.events.subscribe()))
    }
}

/// Glue that sequences one conversation against the server: send, stream,
/// answer questions, cancel, regenerate. All state transitions fold under a
/// single lock, so no two events interleave.
pub struct SessionDriver {
    client: Arc<SessionClient>,
    registry: Arc<SessionRegistry>,
    conversation: Arc<Mutex<Conversation>>,
    session_id: Mutex<Option<String>>,
    last_model: Mutex<Option<String>>,
}

impl SessionDriver {
    pub fn new(client: Arc<SessionClient>, registry: Arc<SessionRegistry>) -> Arc<Self> {
        Arc::new(Self {
            client,
            registry,
            conversation: Arc::new(Mutex::new(Conversation::new())),
            session_id: Mutex::new(None),
            last_model: Mutex::new(None),
        })
    }

    pub fn conversation(&self) -> &Arc<Mutex<Conversation>> {
        &self.conversation
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn client(&self) -> &Arc<SessionClient> {
        &self.client
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session_id.lock().await.clone()
    }

    /// Sends a user message and starts execution, returning the decoded
    /// event feed for this run. `model` is mandatory; resolve it through
    /// settings before calling.
    pub async fn send(self: &Arc<Self>, message: &str, model: &str) -> Result<EventFeed> {
        let conversation_id = self.session_id().await;
        let request = SendMessageRequest {
            message: message.to_string(),
            model: model.to_string(),
            conversation_id,
        };

        let response = match self.client.send_message(&request).await {
            Ok(response) => response,
            Err(err) => {
                self.conversation.lock().await.fail(err.to_string());
                return Err(err);
            }
        };

        {
            let mut conversation = self.conversation.lock().await;
            conversation.push_user(message);
            conversation.begin_execution();
        }
        *self.session_id.lock().await = Some(response.session_id.clone());
        *self.last_model.lock().await = Some(model.to_string());

        self.start_execution(&response.session_id, model).await
    }

    async fn start_execution(self: &Arc<Self>, session_id: &str, model: &str) -> Result<EventFeed> {
        let execute = match self.client.execute(session_id, model).await {
            Ok(execute) => execute,
            Err(err) => {
                self.conversation.lock().await.fail(err.to_string());
                return Err(err);
            }
        };
        Ok(self.attach_stream(session_id, &execute.events_url).await)
    }

    /// Spawns the stream task: every decoded event is broadcast to display
    /// subscribers and folded into the conversation, one step per event.
    /// The returned feed is subscribed before the first frame can arrive.
    async fn attach_stream(self: &Arc<Self>, session_id: &str, events_url: &str) -> EventFeed {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let feed = BroadcastStream::new(events.subscribe());
        let sender = events.clone();
        let client = Arc::clone(&self.client);
        let registry = Arc::clone(&self.registry);
        let conversation = Arc::clone(&self.conversation);
        let sid = session_id.to_string();
        let url = events_url.to_string();

        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            // Stream only once the registry entry exists, so the finish()
            // below always has an entry to remove.
            let _ = ready_rx.await;
            let fold_conversation = Arc::clone(&conversation);
            let result = client
                .stream_events(&url, move |event| {
                    let conversation = Arc::clone(&fold_conversation);
                    let _ = sender.send(event.clone());
                    async move {
                        conversation.lock().await.apply(event);
                    }
                })
                .await;
            match result {
                Ok(()) => {
                    // A clean close without done/error means the run died
                    // mid-flight, unless it is paused on a question.
                    let mut conversation = conversation.lock().await;
                    if conversation.status() == Status::Thinking {
                        tracing::warn!(session_id = %sid, "stream ended before done");
                        conversation.fail("stream ended before done");
                    }
                }
                Err(err) => {
                    tracing::warn!(session_id = %sid, %err, "event stream failed");
                    conversation.lock().await.fail(err.to_string());
                }
            }
            registry.finish(&sid).await;
        });

        self.registry
            .insert(session_id, Subscription { task, events })
            .await;
        let _ = ready_tx.send(());
        feed
    }

    /// Answers the pending question, then reissues execute so the paused
    /// agent resumes.
    pub async fn respond(self: &Arc<Self>, answer: &str) -> Result<EventFeed> {
        let session_id = self
            .session_id()
            .await
            .ok_or_else(|| Error::ExecutionRejected("no active session".to_string()))?;
        let model = self
            .last_model
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::ExecutionRejected("model is required".to_string()))?;

        self.client.respond(&session_id, answer).await?;
        self.conversation.lock().await.respond_submitted();
        self.start_execution(&session_id, &model).await
    }

    /// Server-side cancel plus local teardown. Safe to call when nothing is
    /// running.
    pub async fn cancel(&self) -> Result<()> {
        let Some(session_id) = self.session_id().await else {
            return Ok(());
        };
        let outcome = self.client.cancel(&session_id).await;
        self.registry.detach(&session_id).await;
        self.conversation.lock().await.cancelled();
        outcome
    }

    /// Deletes the most recent user message and everything after it, then
    /// resubmits its content. `None` when there is no user message to retry.
    pub async fn regenerate(self: &Arc<Self>) -> Result<Option<EventFeed>> {
        let model = self
            .last_model
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::ExecutionRejected("model is required".to_string()))?;
        let content = {
            let mut conversation = self.conversation.lock().await;
            conversation.prepare_regenerate()
        };
        let Some(content) = content else {
            return Ok(None);
        };
        self.send(&content, &model).await.map(Some)
    }

    /// Removes server-side state and discards the local session identity.
    pub async fn delete(&self) -> Result<()> {
        let Some(session_id) = self.session_id().await else {
            return Ok(());
        };
        self.registry.detach(&session_id).await;
        self.client.delete_session(&session_id).await?;
        *self.session_id.lock().await = None;
        self.conversation.lock().await.cancelled();
        Ok(())
    }
}
