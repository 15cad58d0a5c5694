use std::collections::VecDeque;

use serde_json::Value;
use uuid::Uuid;

use crate::events::{PendingQuestion, SessionEvent};

/// Events buffered while a question is on screen. Oldest entries are dropped
/// past this bound; see DESIGN.md for the overflow policy.
const APPROVAL_BUFFER_LIMIT: usize = 256;

/// A single invocation of an agent tool, with streaming textual output.
/// `streaming_output` is `Some` only while output is still arriving; a
/// `tool_result` closes it.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub tool_call_id: String,
    pub tool_name: String,
    pub parameters: Value,
    pub streaming_output: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    User { content: String },
    AssistantText { content: String },
    AssistantToolCall { tool_calls: Vec<ToolCall> },
    AssistantToolResult { tool_call_id: String, result: Value },
    /// Local-only; composed into prompts but never sent on the wire.
    System { content: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub kind: MessageKind,
}

impl Message {
    fn new(kind: MessageKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self.kind, MessageKind::User { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Thinking,
    AwaitingApproval,
}

/// Snapshot of the client's current phase of engagement with a session.
#[derive(Debug, Clone, PartialEq)]
pub struct InteractionState {
    pub status: Status,
    pub streaming_message_id: Option<String>,
}

/// Ordered message list plus interaction state, folded from the event
/// sequence of one session. Events apply in arrival order, one synchronous
/// step each; nothing here reorders or batches.
#[derive(Debug)]
pub struct Conversation {
    messages: Vec<Message>,
    status: Status,
    pending: Option<PendingQuestion>,
    streaming_message_id: Option<String>,
    buffered: VecDeque<SessionEvent>,
    last_error: Option<String>,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            status: Status::Idle,
            pending: None,
            streaming_message_id: None,
            buffered: VecDeque::new(),
            last_error: None,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn pending_question(&self) -> Option<&PendingQuestion> {
        self.pending.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn interaction_state(&self) -> InteractionState {
        InteractionState {
            status: self.status,
            streaming_message_id: self.streaming_message_id.clone(),
        }
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.messages.push(Message::new(MessageKind::User {
            content: content.into(),
        }));
    }

    pub fn push_system(&mut self, content: impl Into<String>) {
        self.messages.push(Message::new(MessageKind::System {
            content: content.into(),
        }));
    }

    /// Execute was issued (first run, or resume after a response).
    pub fn begin_execution(&mut self) {
        self.status = Status::Thinking;
        self.last_error = None;
    }

    /// Fold one event. While a question is displayed, output events are
    /// buffered rather than discarded and replayed once a response is
    /// submitted; `question`, `error`, and `done` still apply immediately.
    pub fn apply(&mut self, event: SessionEvent) {
        if self.status == Status::AwaitingApproval && is_bufferable(&event) {
            if self.buffered.len() >= APPROVAL_BUFFER_LIMIT {
                tracing::warn!("approval buffer full, dropping oldest buffered event");
                self.buffered.pop_front();
            }
            self.buffered.push_back(event);
            return;
        }

        match event {
            SessionEvent::Started => {
                self.status = Status::Thinking;
                self.last_error = None;
            }
            SessionEvent::TextDelta { content } => self.fold_text_delta(&content),
            SessionEvent::ToolCallStart {
                tool_call_id,
                tool_name,
                parameters,
            } => {
                // Tool output streams under its own key; any text message
                // that was streaming is finished.
                self.streaming_message_id = None;
                self.messages
                    .push(Message::new(MessageKind::AssistantToolCall {
                        tool_calls: vec![ToolCall {
                            tool_call_id,
                            tool_name,
                            parameters,
                            streaming_output: Some(String::new()),
                        }],
                    }));
            }
            SessionEvent::ToolToken {
                tool_call_id,
                content,
            } => self.fold_tool_token(&tool_call_id, &content),
            SessionEvent::ToolResult {
                tool_call_id,
                result,
            } => self.fold_tool_result(tool_call_id, result),
            SessionEvent::Question {
                question,
                options,
                allow_custom,
                tool_call_id,
            } => {
                self.status = Status::AwaitingApproval;
                self.pending = Some(PendingQuestion {
                    question,
                    options,
                    allow_custom,
                    tool_call_id,
                });
            }
            SessionEvent::Error { message } => {
                tracing::warn!(%message, "session stream reported an error");
                self.last_error = Some(message);
                self.reset_to_idle();
            }
            SessionEvent::Done => {
                self.streaming_message_id = None;
                self.close_open_tool_output();
                // A run can end while its question is still unanswered; the
                // question survives the run.
                if self.pending.is_none() {
                    self.status = Status::Idle;
                }
            }
            SessionEvent::Unknown => {
                tracing::debug!("ignoring unrecognized stream event");
            }
        }
    }

    fn fold_text_delta(&mut self, content: &str) {
        if let Some(id) = self.streaming_message_id.clone() {
            if let Some(message) = self.messages.iter_mut().find(|m| m.id == id) {
                if let MessageKind::AssistantText { content: existing } = &mut message.kind {
                    existing.push_str(content);
                    return;
                }
            }
        }
        let message = Message::new(MessageKind::AssistantText {
            content: content.to_string(),
        });
        self.streaming_message_id = Some(message.id.clone());
        self.messages.push(message);
    }

    fn fold_tool_token(&mut self, tool_call_id: &str, content: &str) {
        match self.find_tool_call_mut(tool_call_id) {
            Some(call) => match &mut call.streaming_output {
                Some(buffer) => buffer.push_str(content),
                // Output after the result closed the call; the result already
                // carries the full text.
                None => tracing::debug!(tool_call_id, "token for closed tool call dropped"),
            },
            None => tracing::debug!(tool_call_id, "token for unknown tool call dropped"),
        }
    }

    fn fold_tool_result(&mut self, tool_call_id: String, result: Value) {
        match self.find_tool_call_mut(&tool_call_id) {
            Some(call) => {
                call.streaming_output = None;
                self.messages
                    .push(Message::new(MessageKind::AssistantToolResult {
                        tool_call_id,
                        result,
                    }));
            }
            // A result must reference an earlier tool call; anything else is
            // dropped rather than recorded dangling.
            None => tracing::warn!(%tool_call_id, "result for unknown tool call dropped"),
        }
    }

    fn find_tool_call_mut(&mut self, tool_call_id: &str) -> Option<&mut ToolCall> {
        self.messages.iter_mut().rev().find_map(|message| {
            if let MessageKind::AssistantToolCall { tool_calls } = &mut message.kind {
                tool_calls
                    .iter_mut()
                    .find(|call| call.tool_call_id == tool_call_id)
            } else {
                None
            }
        })
    }

    fn close_open_tool_output(&mut self) {
        for message in &mut self.messages {
            if let MessageKind::AssistantToolCall { tool_calls } = &mut message.kind {
                for call in tool_calls {
                    call.streaming_output = None;
                }
            }
        }
    }

    /// The user answered the pending question. Clears the slot, returns to
    /// `thinking`, and replays every event buffered while the question was
    /// on screen, in arrival order.
    pub fn respond_submitted(&mut self) {
        self.pending = None;
        self.status = Status::Thinking;
        let buffered: Vec<SessionEvent> = self.buffered.drain(..).collect();
        for event in buffered {
            self.apply(event);
        }
    }

    /// Cancel or terminal transport failure: back to `idle`, live tool
    /// buffers closed, buffered approval events discarded. Messages stay so
    /// a later regenerate has something to work from.
    pub fn cancelled(&mut self) {
        self.buffered.clear();
        self.reset_to_idle();
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
        self.buffered.clear();
        self.reset_to_idle();
    }

    fn reset_to_idle(&mut self) {
        self.status = Status::Idle;
        self.pending = None;
        self.streaming_message_id = None;
        self.close_open_tool_output();
    }

    /// Used by the poll fallback. Returns false when a question is already
    /// displayed so repeated polls never surface a duplicate.
    pub fn surface_pending(&mut self, question: PendingQuestion) -> bool {
        if self.pending.is_some() {
            return false;
        }
        self.pending = Some(question);
        self.status = Status::AwaitingApproval;
        true
    }

    /// Removes the most recent user message and everything after it,
    /// returning its content for resubmission. The only operation that
    /// removes messages.
    pub fn prepare_regenerate(&mut self) -> Option<String> {
        let idx = self.messages.iter().rposition(Message::is_user)?;
        let content = match &self.messages[idx].kind {
            MessageKind::User { content } => content.clone(),
            _ => unreachable!(),
        };
        self.messages.truncate(idx);
        self.streaming_message_id = None;
        self.buffered.clear();
        self.pending = None;
        self.last_error = None;
        Some(content)
    }
}

fn is_bufferable(event: &SessionEvent) -> bool {
    matches!(
        event,
        SessionEvent::TextDelta { .. }
            | SessionEvent::ToolToken { .. }
            | SessionEvent::ToolCallStart { .. }
            | SessionEvent::ToolResult { .. }
    )
}
