use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// One typed unit of the server-to-client execution stream.
///
/// Unrecognized `type` tags decode to `Unknown` instead of failing, so a
/// newer server does not break this client mid-stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Started,
    TextDelta {
        content: String,
    },
    ToolCallStart {
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        parameters: Value,
    },
    ToolToken {
        tool_call_id: String,
        content: String,
    },
    ToolResult {
        tool_call_id: String,
        result: Value,
    },
    Question {
        question: String,
        #[serde(default)]
        options: Vec<String>,
        #[serde(default)]
        allow_custom: bool,
        #[serde(default)]
        tool_call_id: Option<String>,
    },
    Error {
        message: String,
    },
    Done,
    #[serde(other)]
    Unknown,
}

/// A paused point in execution requiring a user-supplied answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingQuestion {
    pub question: String,
    pub options: Vec<String>,
    pub allow_custom: bool,
    pub tool_call_id: Option<String>,
}

/// Body of `GET respond/{sessionId}/pending`.
#[derive(Debug, Clone, Deserialize)]
pub struct PendingQuestionResponse {
    pub has_pending_question: bool,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub allow_custom: bool,
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

impl PendingQuestionResponse {
    pub fn into_pending(self) -> Option<PendingQuestion> {
        if !self.has_pending_question {
            return None;
        }
        Some(PendingQuestion {
            question: self.question.unwrap_or_default(),
            options: self.options,
            allow_custom: self.allow_custom,
            tool_call_id: self.tool_call_id,
        })
    }
}

/// Pure decode of one frame payload. No side effects; callers decide whether
/// a `MalformedEvent` ends anything (it never ends the stream).
pub fn decode_frame(data: &str) -> Result<SessionEvent> {
    serde_json::from_str(data)
        .map_err(|err| Error::MalformedEvent(format!("{err}: {}", truncate_for_log(data))))
}

fn truncate_for_log(data: &str) -> &str {
    let end = data
        .char_indices()
        .nth(120)
        .map(|(idx, _)| idx)
        .unwrap_or(data.len());
    &data[..end]
}

/// Accumulates raw SSE bytes and yields complete `data:` payloads.
///
/// Frames are separated by a blank line; multi-line data fields are joined
/// with `\n` per the SSE spec. CRLF is normalized on the way in.
#[derive(Debug, Default)]
pub struct SseFrameBuffer {
    buffer: String,
}

impl SseFrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        if chunk.contains('\r') {
            self.buffer.push_str(&chunk.replace("\r\n", "\n"));
        } else {
            self.buffer.push_str(chunk);
        }

        let mut payloads = Vec::new();
        while let Some(idx) = self.buffer.find("\n\n") {
            let raw_frame = self.buffer[..idx].to_string();
            self.buffer = self.buffer[idx + 2..].to_string();
            if let Some(data) = extract_sse_data(&raw_frame) {
                payloads.push(data);
            }
        }
        payloads
    }
}

fn extract_sse_data(raw: &str) -> Option<String> {
    let mut data_lines = Vec::new();
    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(data) = line.strip_prefix("data:") {
            data_lines.push(data.trim_start().to_string());
        }
    }

    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}
