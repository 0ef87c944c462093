//! Canonical request/response shapes
//!
//! Every inbound dialect is parsed into these structures and every upstream
//! response is folded back through them. The dispatcher, the rate limiter
//! and the meter only ever see canonical shapes.

use futures_util::stream::BoxStream;
use serde_json::Value;

use crate::error::GatewayResult;

/// External request/response dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    OpenAi,
    Claude,
    Gemini,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::OpenAi => "openai",
            Dialect::Claude => "claude",
            Dialect::Gemini => "gemini",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" | "developer" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" | "model" => Some(Role::Assistant),
            "tool" | "function" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// One piece of message content.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text {
        text: String,
    },
    ImageRef {
        /// Either a URL or a base64 data blob, with its media type.
        media_type: String,
        data: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl Message {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![ContentPart::Text { text: text.into() }],
        }
    }

    /// Concatenated text parts; empty when the message is non-textual.
    pub fn joined_text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let ContentPart::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    None,
    Required,
}

/// The gateway-internal request shape.
#[derive(Debug, Clone)]
pub struct CanonicalRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
    pub stop: Vec<String>,
    pub tools: Vec<ToolSpec>,
    pub tool_choice: Option<ToolChoice>,
    /// Name of the single tool forced by the caller, when the dialect
    /// supports pinning one.
    pub forced_tool: Option<String>,
    pub stream: bool,
    /// Dialect the caller spoke; responses are re-serialized into it.
    pub dialect: Dialect,
}

impl CanonicalRequest {
    pub fn new(model: impl Into<String>, dialect: Dialect) -> Self {
        Self {
            model: model.into(),
            messages: Vec::new(),
            temperature: None,
            top_p: None,
            max_tokens: None,
            stop: Vec::new(),
            tools: Vec::new(),
            tool_choice: None,
            forced_tool: None,
            stream: false,
            dialect,
        }
    }
}

/// Token usage as reported (or estimated) for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

impl TokenUsage {
    pub fn new(prompt: i64, completion: i64) -> Self {
        Self {
            prompt_tokens: prompt,
            completion_tokens: completion,
        }
    }

    pub fn total(&self) -> i64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Fold an incremental report into the running totals. Providers report
    /// usage either cumulatively or once at the end; taking the max of each
    /// side is correct for both.
    pub fn merge(&mut self, other: &TokenUsage) {
        self.prompt_tokens = self.prompt_tokens.max(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.max(other.completion_tokens);
    }
}

/// Incremental tool-call fragment inside a streaming response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments_delta: String,
}

/// One canonical streaming chunk.
///
/// A chunk may carry a text delta, a tool-call delta, incremental usage,
/// a finish reason, or any combination. `done` marks the terminal chunk.
#[derive(Debug, Clone, Default)]
pub struct CanonicalChunk {
    pub text: Option<String>,
    pub tool_call: Option<ToolCallDelta>,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<String>,
    pub done: bool,
}

impl CanonicalChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn done_with(usage: Option<TokenUsage>, finish_reason: Option<String>) -> Self {
        Self {
            usage,
            finish_reason,
            done: true,
            ..Default::default()
        }
    }
}

/// Lazy, cancellable, ordered sequence of canonical chunks.
///
/// Dropping the stream drops the underlying upstream body, which closes the
/// connection within one round-trip.
pub type ChunkStream = BoxStream<'static, GatewayResult<CanonicalChunk>>;

/// Fully assembled non-streaming response.
#[derive(Debug, Clone)]
pub struct CanonicalResponse {
    pub id: String,
    pub model: String,
    pub parts: Vec<ContentPart>,
    pub stop_reason: Option<String>,
    pub usage: TokenUsage,
}

impl CanonicalResponse {
    /// Assemble a response from an ordered chunk sequence.
    pub fn from_chunks(id: String, model: String, chunks: &[CanonicalChunk]) -> Self {
        let mut text = String::new();
        let mut tool_calls: Vec<(String, String, String)> = Vec::new();
        let mut usage = TokenUsage::default();
        let mut stop_reason = None;

        for chunk in chunks {
            if let Some(t) = &chunk.text {
                text.push_str(t);
            }
            if let Some(delta) = &chunk.tool_call {
                while tool_calls.len() <= delta.index {
                    tool_calls.push((String::new(), String::new(), String::new()));
                }
                let slot = &mut tool_calls[delta.index];
                if let Some(id) = &delta.id {
                    slot.0 = id.clone();
                }
                if let Some(name) = &delta.name {
                    slot.1 = name.clone();
                }
                slot.2.push_str(&delta.arguments_delta);
            }
            if let Some(u) = &chunk.usage {
                usage.merge(u);
            }
            if chunk.finish_reason.is_some() {
                stop_reason = chunk.finish_reason.clone();
            }
        }

        let mut parts = Vec::new();
        if !text.is_empty() {
            parts.push(ContentPart::Text { text });
        }
        for (id, name, args) in tool_calls {
            if name.is_empty() {
                continue;
            }
            let arguments =
                serde_json::from_str(&args).unwrap_or(Value::String(args.clone()));
            parts.push(ContentPart::ToolCall { id, name, arguments });
        }

        Self {
            id,
            model,
            parts,
            stop_reason,
            usage,
        }
    }

    pub fn joined_text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let ContentPart::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }
}
