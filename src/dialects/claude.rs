//! Claude Messages dialect

use axum::body::Bytes;
use serde_json::{json, Value};

use crate::canonical::{
    CanonicalChunk, CanonicalRequest, CanonicalResponse, ContentPart, Dialect, Message, Role,
    ToolChoice, ToolSpec,
};
use crate::dialects::claude_stop_reason;
use crate::error::{ErrorKind, GatewayError, GatewayResult};

fn flatten_tool_result_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => {
            let mut out = String::new();
            for block in blocks {
                if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                    out.push_str(text);
                }
            }
            out
        }
        _ => String::new(),
    }
}

fn parse_blocks(content: &Value, parts: &mut Vec<ContentPart>) -> GatewayResult<()> {
    match content {
        Value::String(text) => {
            parts.push(ContentPart::Text { text: text.clone() });
            Ok(())
        }
        Value::Array(blocks) => {
            for block in blocks {
                let kind = block.get("type").and_then(|v| v.as_str()).unwrap_or("");
                match kind {
                    "text" => parts.push(ContentPart::Text {
                        text: block
                            .get("text")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                    }),
                    "image" => {
                        let source = block.get("source").ok_or_else(|| {
                            GatewayError::bad_request("image block without source")
                        })?;
                        match source.get("type").and_then(|v| v.as_str()) {
                            Some("base64") => parts.push(ContentPart::ImageRef {
                                media_type: source
                                    .get("media_type")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or("image/png")
                                    .to_string(),
                                data: source
                                    .get("data")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or_default()
                                    .to_string(),
                            }),
                            Some("url") => parts.push(ContentPart::ImageRef {
                                media_type: "image/url".to_string(),
                                data: source
                                    .get("url")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or_default()
                                    .to_string(),
                            }),
                            other => {
                                return Err(GatewayError::unsupported(format!(
                                    "unsupported image source '{}'",
                                    other.unwrap_or("missing")
                                )))
                            }
                        }
                    }
                    "tool_use" => parts.push(ContentPart::ToolCall {
                        id: block
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        name: block
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        arguments: block.get("input").cloned().unwrap_or(Value::Null),
                    }),
                    "tool_result" => parts.push(ContentPart::ToolResult {
                        tool_call_id: block
                            .get("tool_use_id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        content: block
                            .get("content")
                            .map(flatten_tool_result_content)
                            .unwrap_or_default(),
                    }),
                    other => {
                        return Err(GatewayError::unsupported(format!(
                            "unsupported content block type '{}'",
                            other
                        )))
                    }
                }
            }
            Ok(())
        }
        _ => Err(GatewayError::bad_request("message content must be a string or array")),
    }
}

pub fn parse_request(raw: &Value) -> GatewayResult<CanonicalRequest> {
    let model = raw
        .get("model")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GatewayError::bad_request("missing or empty 'model' field"))?;

    let mut request = CanonicalRequest::new(model, Dialect::Claude);

    // Top-level system folds into a leading canonical system message.
    match raw.get("system") {
        None | Some(Value::Null) => {}
        Some(Value::String(text)) => {
            request.messages.push(Message::text(Role::System, text.clone()));
        }
        Some(Value::Array(blocks)) => {
            let mut text = String::new();
            for block in blocks {
                if let Some(t) = block.get("text").and_then(|v| v.as_str()) {
                    text.push_str(t);
                }
            }
            request.messages.push(Message::text(Role::System, text));
        }
        _ => return Err(GatewayError::bad_request("invalid 'system' field")),
    }

    let messages = raw
        .get("messages")
        .and_then(|v| v.as_array())
        .filter(|m| !m.is_empty())
        .ok_or_else(|| GatewayError::bad_request("missing 'messages' array"))?;

    for message in messages {
        let role_raw = message
            .get("role")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GatewayError::bad_request("message without role"))?;
        let role = match role_raw {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            other => {
                return Err(GatewayError::bad_request(format!(
                    "unknown role '{}'",
                    other
                )))
            }
        };
        let mut parts = Vec::new();
        if let Some(content) = message.get("content") {
            parse_blocks(content, &mut parts)?;
        }
        request.messages.push(Message { role, parts });
    }

    request.temperature = raw.get("temperature").and_then(|v| v.as_f64());
    request.top_p = raw.get("top_p").and_then(|v| v.as_f64());
    request.max_tokens = raw.get("max_tokens").and_then(|v| v.as_u64()).map(|v| v as u32);
    request.stream = raw.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);

    if let Some(stops) = raw.get("stop_sequences").and_then(|v| v.as_array()) {
        for stop in stops {
            if let Some(s) = stop.as_str() {
                request.stop.push(s.to_string());
            }
        }
    }

    if let Some(tools) = raw.get("tools").and_then(|v| v.as_array()) {
        for tool in tools {
            request.tools.push(ToolSpec {
                name: tool
                    .get("name")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| GatewayError::bad_request("tool without name"))?
                    .to_string(),
                description: tool
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                parameters: tool.get("input_schema").cloned().unwrap_or(json!({})),
            });
        }
    }

    if let Some(choice) = raw.get("tool_choice") {
        match choice.get("type").and_then(|v| v.as_str()) {
            Some("auto") | None => request.tool_choice = Some(ToolChoice::Auto),
            Some("any") => request.tool_choice = Some(ToolChoice::Required),
            Some("none") => request.tool_choice = Some(ToolChoice::None),
            Some("tool") => {
                request.tool_choice = Some(ToolChoice::Required);
                request.forced_tool = choice
                    .get("name")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
            }
            Some(other) => {
                return Err(GatewayError::bad_request(format!(
                    "unknown tool_choice type '{}'",
                    other
                )))
            }
        }
    }

    Ok(request)
}

/// Render a canonical request onto the Claude Messages wire. Leading
/// system messages unfold back into the top-level `system` field.
pub fn render_request(request: &CanonicalRequest, upstream_model: &str, stream: bool) -> Value {
    let mut system = String::new();
    let mut messages = Vec::new();

    for message in &request.messages {
        match message.role {
            Role::System => system.push_str(&message.joined_text()),
            Role::Tool => {
                // Canonical tool results ride as user tool_result blocks.
                let mut blocks = Vec::new();
                for part in &message.parts {
                    if let ContentPart::ToolResult { tool_call_id, content } = part {
                        blocks.push(json!({
                            "type": "tool_result",
                            "tool_use_id": tool_call_id,
                            "content": content
                        }));
                    }
                }
                messages.push(json!({ "role": "user", "content": blocks }));
            }
            role => {
                let mut blocks = Vec::new();
                for part in &message.parts {
                    match part {
                        ContentPart::Text { text } => {
                            blocks.push(json!({ "type": "text", "text": text }))
                        }
                        ContentPart::ImageRef { media_type, data } => {
                            let source = if media_type == "image/url" {
                                json!({ "type": "url", "url": data })
                            } else {
                                json!({
                                    "type": "base64",
                                    "media_type": media_type,
                                    "data": data
                                })
                            };
                            blocks.push(json!({ "type": "image", "source": source }));
                        }
                        ContentPart::ToolCall { id, name, arguments } => blocks.push(json!({
                            "type": "tool_use",
                            "id": id,
                            "name": name,
                            "input": arguments
                        })),
                        ContentPart::ToolResult { tool_call_id, content } => {
                            blocks.push(json!({
                                "type": "tool_result",
                                "tool_use_id": tool_call_id,
                                "content": content
                            }))
                        }
                    }
                }
                let wire_role = if role == Role::Assistant { "assistant" } else { "user" };
                messages.push(json!({ "role": wire_role, "content": blocks }));
            }
        }
    }

    let mut body = json!({
        "model": upstream_model,
        "messages": messages,
        "max_tokens": request.max_tokens.unwrap_or(4096),
        "stream": stream
    });
    if !system.is_empty() {
        body["system"] = Value::String(system);
    }
    if let Some(t) = request.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = request.top_p {
        body["top_p"] = json!(p);
    }
    if !request.stop.is_empty() {
        body["stop_sequences"] = json!(request.stop);
    }
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(
            request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters
                    })
                })
                .collect(),
        );
    }
    if let Some(forced) = &request.forced_tool {
        body["tool_choice"] = json!({ "type": "tool", "name": forced });
    } else if let Some(choice) = request.tool_choice {
        body["tool_choice"] = match choice {
            ToolChoice::Auto => json!({ "type": "auto" }),
            ToolChoice::Required => json!({ "type": "any" }),
            ToolChoice::None => json!({ "type": "none" }),
        };
    }
    body
}

fn render_content_blocks(parts: &[ContentPart]) -> Vec<Value> {
    let mut blocks = Vec::new();
    for part in parts {
        match part {
            ContentPart::Text { text } => {
                blocks.push(json!({ "type": "text", "text": text }))
            }
            ContentPart::ToolCall { id, name, arguments } => blocks.push(json!({
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": arguments
            })),
            _ => {}
        }
    }
    blocks
}

pub fn render_unary(response: &CanonicalResponse) -> Value {
    let stop_reason = response
        .stop_reason
        .as_deref()
        .map(claude_stop_reason)
        .unwrap_or("end_turn");
    json!({
        "id": format!("msg_{}", response.id),
        "type": "message",
        "role": "assistant",
        "model": response.model,
        "content": render_content_blocks(&response.parts),
        "stop_reason": stop_reason,
        "stop_sequence": null,
        "usage": {
            "input_tokens": response.usage.prompt_tokens,
            "output_tokens": response.usage.completion_tokens
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    None,
    Text,
    ToolUse,
}

/// SSE encoder emitting the named Claude events in order:
/// message_start, content_block_start/delta/stop, message_delta,
/// message_stop.
pub struct ClaudeStreamEncoder {
    id: String,
    model: String,
    started: bool,
    block_index: usize,
    open_block: OpenBlock,
    stopped: bool,
    input_tokens: i64,
}

fn event(name: &str, data: Value) -> Bytes {
    Bytes::from(format!("event: {}\ndata: {}\n\n", name, data))
}

impl ClaudeStreamEncoder {
    pub fn new(request_id: &str, model: &str) -> Self {
        Self {
            id: format!("msg_{}", request_id),
            model: model.to_string(),
            started: false,
            block_index: 0,
            open_block: OpenBlock::None,
            stopped: false,
            input_tokens: 0,
        }
    }

    fn ensure_started(&mut self, frames: &mut Vec<Bytes>) {
        if self.started {
            return;
        }
        self.started = true;
        frames.push(event(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": self.id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": { "input_tokens": self.input_tokens, "output_tokens": 0 }
                }
            }),
        ));
    }

    fn close_block(&mut self, frames: &mut Vec<Bytes>) {
        if self.open_block == OpenBlock::None {
            return;
        }
        frames.push(event(
            "content_block_stop",
            json!({ "type": "content_block_stop", "index": self.block_index }),
        ));
        self.open_block = OpenBlock::None;
        self.block_index += 1;
    }

    pub fn encode_chunk(&mut self, chunk: &CanonicalChunk) -> Vec<Bytes> {
        let mut frames = Vec::new();

        if let Some(usage) = &chunk.usage {
            if usage.prompt_tokens > self.input_tokens {
                self.input_tokens = usage.prompt_tokens;
            }
        }

        if let Some(text) = &chunk.text {
            self.ensure_started(&mut frames);
            if self.open_block == OpenBlock::ToolUse {
                self.close_block(&mut frames);
            }
            if self.open_block == OpenBlock::None {
                frames.push(event(
                    "content_block_start",
                    json!({
                        "type": "content_block_start",
                        "index": self.block_index,
                        "content_block": { "type": "text", "text": "" }
                    }),
                ));
                self.open_block = OpenBlock::Text;
            }
            frames.push(event(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": self.block_index,
                    "delta": { "type": "text_delta", "text": text }
                }),
            ));
        }

        if let Some(call) = &chunk.tool_call {
            self.ensure_started(&mut frames);
            if call.name.is_some() || call.id.is_some() {
                // A new tool call begins a fresh block.
                self.close_block(&mut frames);
                frames.push(event(
                    "content_block_start",
                    json!({
                        "type": "content_block_start",
                        "index": self.block_index,
                        "content_block": {
                            "type": "tool_use",
                            "id": call.id.clone().unwrap_or_default(),
                            "name": call.name.clone().unwrap_or_default(),
                            "input": {}
                        }
                    }),
                ));
                self.open_block = OpenBlock::ToolUse;
            }
            if !call.arguments_delta.is_empty() {
                frames.push(event(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": self.block_index,
                        "delta": {
                            "type": "input_json_delta",
                            "partial_json": call.arguments_delta
                        }
                    }),
                ));
            }
        }

        if chunk.done && !self.stopped {
            self.ensure_started(&mut frames);
            self.close_block(&mut frames);
            self.stopped = true;
            let stop_reason = chunk
                .finish_reason
                .as_deref()
                .map(claude_stop_reason)
                .unwrap_or("end_turn");
            let output = chunk.usage.map(|u| u.completion_tokens).unwrap_or(0);
            frames.push(event(
                "message_delta",
                json!({
                    "type": "message_delta",
                    "delta": { "stop_reason": stop_reason, "stop_sequence": null },
                    "usage": { "output_tokens": output }
                }),
            ));
            frames.push(event(
                "message_stop",
                json!({ "type": "message_stop" }),
            ));
        }

        frames
    }

    pub fn finish(&mut self) -> Vec<Bytes> {
        let mut frames = Vec::new();
        if !self.stopped {
            self.ensure_started(&mut frames);
            self.close_block(&mut frames);
            self.stopped = true;
            frames.push(event(
                "message_delta",
                json!({
                    "type": "message_delta",
                    "delta": { "stop_reason": "end_turn", "stop_sequence": null },
                    "usage": { "output_tokens": 0 }
                }),
            ));
            frames.push(event("message_stop", json!({ "type": "message_stop" })));
        }
        frames
    }

    pub fn encode_error(&mut self, kind: ErrorKind, message: &str) -> Vec<Bytes> {
        self.stopped = true;
        vec![event(
            "error",
            json!({
                "type": "error",
                "error": { "type": kind.code(), "message": message }
            }),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{TokenUsage, ToolCallDelta};

    fn sample_request() -> Value {
        json!({
            "model": "claude-3-5-sonnet",
            "system": "be brief",
            "max_tokens": 512,
            "messages": [
                {"role": "user", "content": [{"type": "text", "text": "hi"}]}
            ],
            "stop_sequences": ["END"],
            "stream": true
        })
    }

    #[test]
    fn system_folds_into_leading_message() {
        let req = parse_request(&sample_request()).unwrap();
        assert_eq!(req.messages[0].role, Role::System);
        assert_eq!(req.messages[0].joined_text(), "be brief");
        assert_eq!(req.messages[1].role, Role::User);
        assert_eq!(req.max_tokens, Some(512));
        assert!(req.stream);
    }

    #[test]
    fn tool_use_and_result_blocks_parse() {
        let raw = json!({
            "model": "claude-3-5-sonnet",
            "max_tokens": 16,
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "tu_1", "name": "lookup", "input": {"q": "x"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "tu_1",
                     "content": [{"type": "text", "text": "found"}]}
                ]}
            ]
        });
        let req = parse_request(&raw).unwrap();
        match &req.messages[0].parts[0] {
            ContentPart::ToolCall { name, arguments, .. } => {
                assert_eq!(name, "lookup");
                assert_eq!(arguments["q"], "x");
            }
            other => panic!("unexpected part: {:?}", other),
        }
        match &req.messages[1].parts[0] {
            ContentPart::ToolResult { tool_call_id, content } => {
                assert_eq!(tool_call_id, "tu_1");
                assert_eq!(content, "found");
            }
            other => panic!("unexpected part: {:?}", other),
        }
    }

    #[test]
    fn unknown_block_type_is_unsupported() {
        let raw = json!({
            "model": "m",
            "max_tokens": 16,
            "messages": [{"role": "user", "content": [{"type": "document"}]}]
        });
        let err = parse_request(&raw).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnsupportedRequestFeature);
    }

    #[test]
    fn request_render_parse_round_trip() {
        let req = parse_request(&sample_request()).unwrap();
        let wire = render_request(&req, "claude-3-5-sonnet", true);
        let back = parse_request(&wire).unwrap();
        assert_eq!(back.messages, req.messages);
        assert_eq!(back.max_tokens, req.max_tokens);
        assert_eq!(back.stop, req.stop);
        assert_eq!(wire["system"], "be brief");
    }

    #[test]
    fn unary_render_uses_claude_shapes() {
        let response = CanonicalResponse {
            id: "abc".to_string(),
            model: "claude-3-5-sonnet".to_string(),
            parts: vec![ContentPart::Text { text: "hello".to_string() }],
            stop_reason: Some("length".to_string()),
            usage: TokenUsage::new(11, 7),
        };
        let rendered = render_unary(&response);
        assert_eq!(rendered["type"], "message");
        assert_eq!(rendered["stop_reason"], "max_tokens");
        assert_eq!(rendered["content"][0]["text"], "hello");
        assert_eq!(rendered["usage"]["input_tokens"], 11);
        assert_eq!(rendered["usage"]["output_tokens"], 7);
    }

    fn event_names(frames: &[Bytes]) -> Vec<String> {
        frames
            .iter()
            .map(|f| {
                String::from_utf8(f.to_vec())
                    .unwrap()
                    .lines()
                    .next()
                    .unwrap()
                    .trim_start_matches("event: ")
                    .to_string()
            })
            .collect()
    }

    #[test]
    fn stream_event_order_is_canonical() {
        let mut enc = ClaudeStreamEncoder::new("r", "claude-3-5-sonnet");
        let mut frames = Vec::new();
        frames.extend(enc.encode_chunk(&CanonicalChunk {
            usage: Some(TokenUsage::new(9, 0)),
            ..CanonicalChunk::text("Hel")
        }));
        frames.extend(enc.encode_chunk(&CanonicalChunk::text("lo")));
        frames.extend(enc.encode_chunk(&CanonicalChunk::done_with(
            Some(TokenUsage::new(9, 2)),
            Some("stop".to_string()),
        )));
        frames.extend(enc.finish());

        assert_eq!(
            event_names(&frames),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
    }

    #[test]
    fn tool_call_opens_its_own_block() {
        let mut enc = ClaudeStreamEncoder::new("r", "m");
        let mut frames = Vec::new();
        frames.extend(enc.encode_chunk(&CanonicalChunk::text("thinking")));
        frames.extend(enc.encode_chunk(&CanonicalChunk {
            tool_call: Some(ToolCallDelta {
                index: 0,
                id: Some("tu_1".to_string()),
                name: Some("lookup".to_string()),
                arguments_delta: "{\"q\":\"x\"}".to_string(),
            }),
            ..Default::default()
        }));
        frames.extend(enc.encode_chunk(&CanonicalChunk::done_with(
            None,
            Some("tool_calls".to_string()),
        )));

        let names = event_names(&frames);
        assert!(names.contains(&"content_block_stop".to_string()));
        let last_delta = frames
            .iter()
            .map(|f| String::from_utf8(f.to_vec()).unwrap())
            .find(|f| f.contains("input_json_delta"))
            .unwrap();
        assert!(last_delta.contains("partial_json"));
        // stop_reason mapped into Claude vocabulary
        let message_delta = frames
            .iter()
            .map(|f| String::from_utf8(f.to_vec()).unwrap())
            .find(|f| f.starts_with("event: message_delta"))
            .unwrap();
        assert!(message_delta.contains("tool_use"));
    }
}
