use std::io::Write;

use serde_json::Value;

use crate::conversation::{Message, MessageKind};
use crate::events::PendingQuestion;
use crate::session::EventHandlers;

const TOOL_INPUT_LIMIT: usize = 200;
const TOOL_RESULT_LIMIT: usize = 300;

/// Plain-text lines for one reconstructed message. Layout and styling live
/// elsewhere; this is the whole display contract the engine depends on.
pub fn render_message(message: &Message) -> Vec<String> {
    match &message.kind {
        MessageKind::User { content } => with_header("You:", content),
        MessageKind::AssistantText { content } => with_header("Assistant:", content),
        MessageKind::AssistantToolCall { tool_calls } => {
            let mut lines = Vec::new();
            for call in tool_calls {
                lines.push(format!("tool: {}(", call.tool_name));
                let input = truncate(&call.parameters.to_string(), TOOL_INPUT_LIMIT, "...");
                for line in input.lines() {
                    lines.push(format!("  {line}"));
                }
                lines.push(")".to_string());
                if let Some(output) = &call.streaming_output {
                    for line in output.lines() {
                        lines.push(format!("  | {line}"));
                    }
                }
            }
            lines
        }
        MessageKind::AssistantToolResult { result, .. } => {
            let text = truncate(&render_result(result), TOOL_RESULT_LIMIT, "...\n[output truncated]");
            with_header("→ Result:", &text)
        }
        MessageKind::System { content } => with_header("system:", content),
    }
}

pub fn render_question(question: &PendingQuestion) -> Vec<String> {
    let mut lines = vec![format!("? {}", question.question)];
    for (idx, option) in question.options.iter().enumerate() {
        lines.push(format!("  {}. {}", idx + 1, option));
    }
    if question.allow_custom {
        lines.push("  (or type a custom answer)".to_string());
    }
    lines
}

fn render_result(result: &Value) -> String {
    match result {
        Value::String(text) => text.clone(),
        other => other
            .get("result")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| other.to_string()),
    }
}

fn with_header(header: &str, body: &str) -> Vec<String> {
    let mut lines = vec![header.to_string()];
    for line in body.lines() {
        lines.push(format!("  {line}"));
    }
    lines
}

fn truncate(text: &str, limit: usize, suffix: &str) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let truncated: String = text.chars().take(limit).collect();
    format!("{truncated}{suffix}")
}

/// Streams events straight to stdout as they arrive. Deltas and tool tokens
/// print inline; everything else gets its own line.
#[derive(Default)]
pub struct EventPrinter {
    mid_line: bool,
}

impl EventPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    fn break_line(&mut self) {
        if self.mid_line {
            println!();
            self.mid_line = false;
        }
    }
}

impl EventHandlers for EventPrinter {
    fn on_text_delta(&mut self, content: &str) {
        print!("{content}");
        let _ = std::io::stdout().flush();
        self.mid_line = !content.ends_with('\n');
    }

    fn on_tool_call_start(&mut self, _tool_call_id: &str, tool_name: &str, parameters: &Value) {
        self.break_line();
        let input = truncate(&parameters.to_string(), TOOL_INPUT_LIMIT, "...");
        println!("tool: {tool_name}({input})");
    }

    fn on_tool_token(&mut self, _tool_call_id: &str, content: &str) {
        print!("{content}");
        let _ = std::io::stdout().flush();
        self.mid_line = !content.ends_with('\n');
    }

    fn on_tool_result(&mut self, _tool_call_id: &str, result: &Value) {
        self.break_line();
        let text = truncate(&render_result(result), TOOL_RESULT_LIMIT, "...\n[output truncated]");
        println!("→ {text}");
    }

    fn on_question(&mut self, question: &PendingQuestion) {
        self.break_line();
        for line in render_question(question) {
            println!("{line}");
        }
    }

    fn on_error(&mut self, message: &str) {
        self.break_line();
        eprintln!("error: {message}");
    }

    fn on_done(&mut self) {
        self.break_line();
    }
}
