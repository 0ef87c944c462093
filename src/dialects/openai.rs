//! OpenAI chat-completions dialect

use axum::body::Bytes;
use serde_json::{json, Value};

use crate::canonical::{
    CanonicalChunk, CanonicalRequest, CanonicalResponse, ContentPart, Dialect, Message, Role,
    ToolChoice, ToolSpec,
};
use crate::error::{ErrorKind, GatewayError, GatewayResult};

fn parse_content(content: &Value, parts: &mut Vec<ContentPart>) -> GatewayResult<()> {
    match content {
        Value::Null => Ok(()),
        Value::String(text) => {
            parts.push(ContentPart::Text { text: text.clone() });
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                let kind = item.get("type").and_then(|v| v.as_str()).unwrap_or("");
                match kind {
                    "text" => parts.push(ContentPart::Text {
                        text: item
                            .get("text")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                    }),
                    "image_url" => {
                        let url = item
                            .pointer("/image_url/url")
                            .and_then(|v| v.as_str())
                            .ok_or_else(|| {
                                GatewayError::bad_request("image_url part without url")
                            })?;
                        parts.push(ContentPart::ImageRef {
                            media_type: "image/url".to_string(),
                            data: url.to_string(),
                        });
                    }
                    other => {
                        return Err(GatewayError::unsupported(format!(
                            "unsupported content part type '{}'",
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

fn parse_tool_arguments(raw: &Value) -> Value {
    match raw {
        Value::String(s) => serde_json::from_str(s).unwrap_or(Value::String(s.clone())),
        other => other.clone(),
    }
}

pub fn parse_request(raw: &Value) -> GatewayResult<CanonicalRequest> {
    let model = raw
        .get("model")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GatewayError::bad_request("missing or empty 'model' field"))?;

    let mut request = CanonicalRequest::new(model, Dialect::OpenAi);

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
        let role = Role::parse(role_raw)
            .ok_or_else(|| GatewayError::bad_request(format!("unknown role '{}'", role_raw)))?;

        let mut parts = Vec::new();
        if role == Role::Tool {
            let tool_call_id = message
                .get("tool_call_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let content = message
                .get("content")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            parts.push(ContentPart::ToolResult {
                tool_call_id,
                content,
            });
        } else {
            if let Some(content) = message.get("content") {
                parse_content(content, &mut parts)?;
            }
            if let Some(calls) = message.get("tool_calls").and_then(|v| v.as_array()) {
                for call in calls {
                    parts.push(ContentPart::ToolCall {
                        id: call
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        name: call
                            .pointer("/function/name")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        arguments: call
                            .pointer("/function/arguments")
                            .map(parse_tool_arguments)
                            .unwrap_or(Value::Null),
                    });
                }
            }
        }
        request.messages.push(Message { role, parts });
    }

    request.temperature = raw.get("temperature").and_then(|v| v.as_f64());
    request.top_p = raw.get("top_p").and_then(|v| v.as_f64());
    request.max_tokens = raw
        .get("max_tokens")
        .or_else(|| raw.get("max_completion_tokens"))
        .and_then(|v| v.as_u64())
        .map(|v| v as u32);
    request.stream = raw.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);

    match raw.get("stop") {
        Some(Value::String(s)) => request.stop.push(s.clone()),
        Some(Value::Array(items)) => {
            for item in items {
                if let Some(s) = item.as_str() {
                    request.stop.push(s.to_string());
                }
            }
        }
        _ => {}
    }

    if let Some(tools) = raw.get("tools").and_then(|v| v.as_array()) {
        for tool in tools {
            let kind = tool.get("type").and_then(|v| v.as_str()).unwrap_or("function");
            if kind != "function" {
                return Err(GatewayError::unsupported(format!(
                    "unsupported tool type '{}'",
                    kind
                )));
            }
            let function = tool
                .get("function")
                .ok_or_else(|| GatewayError::bad_request("tool without function object"))?;
            request.tools.push(ToolSpec {
                name: function
                    .get("name")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| GatewayError::bad_request("tool function without name"))?
                    .to_string(),
                description: function
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                parameters: function.get("parameters").cloned().unwrap_or(json!({})),
            });
        }
    }

    match raw.get("tool_choice") {
        None | Some(Value::Null) => {}
        Some(Value::String(s)) => {
            request.tool_choice = match s.as_str() {
                "auto" => Some(ToolChoice::Auto),
                "none" => Some(ToolChoice::None),
                "required" => Some(ToolChoice::Required),
                other => {
                    return Err(GatewayError::bad_request(format!(
                        "unknown tool_choice '{}'",
                        other
                    )))
                }
            };
        }
        Some(choice) => {
            let name = choice
                .pointer("/function/name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| GatewayError::bad_request("tool_choice without function name"))?;
            request.tool_choice = Some(ToolChoice::Required);
            request.forced_tool = Some(name.to_string());
        }
    }

    Ok(request)
}

/// Render a canonical request onto the OpenAI wire, substituting the
/// upstream model name.
pub fn render_request(request: &CanonicalRequest, upstream_model: &str, stream: bool) -> Value {
    let mut messages = Vec::new();
    for message in &request.messages {
        match message.role {
            Role::Tool => {
                for part in &message.parts {
                    if let ContentPart::ToolResult { tool_call_id, content } = part {
                        messages.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_call_id,
                            "content": content
                        }));
                    }
                }
            }
            role => {
                let mut tool_calls = Vec::new();
                let mut content_parts = Vec::new();
                let mut has_image = false;
                for part in &message.parts {
                    match part {
                        ContentPart::Text { text } => {
                            content_parts.push(json!({ "type": "text", "text": text }))
                        }
                        ContentPart::ImageRef { media_type, data } => {
                            has_image = true;
                            let url = if media_type == "image/url" {
                                data.clone()
                            } else {
                                format!("data:{};base64,{}", media_type, data)
                            };
                            content_parts
                                .push(json!({ "type": "image_url", "image_url": { "url": url } }));
                        }
                        ContentPart::ToolCall { id, name, arguments } => tool_calls.push(json!({
                            "id": id,
                            "type": "function",
                            "function": { "name": name, "arguments": arguments.to_string() }
                        })),
                        ContentPart::ToolResult { tool_call_id, content } => {
                            messages.push(json!({
                                "role": "tool",
                                "tool_call_id": tool_call_id,
                                "content": content
                            }));
                        }
                    }
                }
                let mut entry = json!({ "role": role.as_str() });
                if has_image {
                    entry["content"] = Value::Array(content_parts);
                } else {
                    let text = message.joined_text();
                    if text.is_empty() && !tool_calls.is_empty() {
                        entry["content"] = Value::Null;
                    } else {
                        entry["content"] = Value::String(text);
                    }
                }
                if !tool_calls.is_empty() {
                    entry["tool_calls"] = Value::Array(tool_calls);
                }
                messages.push(entry);
            }
        }
    }

    let mut body = json!({
        "model": upstream_model,
        "messages": messages,
        "stream": stream
    });
    if let Some(t) = request.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = request.top_p {
        body["top_p"] = json!(p);
    }
    if let Some(m) = request.max_tokens {
        body["max_tokens"] = json!(m);
    }
    if !request.stop.is_empty() {
        body["stop"] = json!(request.stop);
    }
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(
            request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters
                        }
                    })
                })
                .collect(),
        );
    }
    if let Some(forced) = &request.forced_tool {
        body["tool_choice"] = json!({ "type": "function", "function": { "name": forced } });
    } else if let Some(choice) = request.tool_choice {
        body["tool_choice"] = Value::String(
            match choice {
                ToolChoice::Auto => "auto",
                ToolChoice::None => "none",
                ToolChoice::Required => "required",
            }
            .to_string(),
        );
    }
    if stream {
        body["stream_options"] = json!({ "include_usage": true });
    }
    body
}

fn render_tool_calls(parts: &[ContentPart]) -> Vec<Value> {
    parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::ToolCall { id, name, arguments } => Some(json!({
                "id": id,
                "type": "function",
                "function": {
                    "name": name,
                    "arguments": arguments.to_string()
                }
            })),
            _ => None,
        })
        .collect()
}

pub fn render_unary(response: &CanonicalResponse) -> Value {
    let text = response.joined_text();
    let tool_calls = render_tool_calls(&response.parts);

    let mut message = json!({ "role": "assistant" });
    if text.is_empty() && !tool_calls.is_empty() {
        message["content"] = Value::Null;
    } else {
        message["content"] = Value::String(text);
    }
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
    }

    let finish_reason = response.stop_reason.clone().unwrap_or_else(|| "stop".to_string());

    json!({
        "id": format!("chatcmpl-{}", response.id),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": response.model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason
        }],
        "usage": {
            "prompt_tokens": response.usage.prompt_tokens,
            "completion_tokens": response.usage.completion_tokens,
            "total_tokens": response.usage.total()
        }
    })
}

/// SSE encoder: `data: {chunk}\n\n` frames terminated by `data: [DONE]`.
pub struct OpenAiStreamEncoder {
    id: String,
    model: String,
    created: i64,
    sent_role: bool,
    finished: bool,
}

impl OpenAiStreamEncoder {
    pub fn new(request_id: &str, model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", request_id),
            model: model.to_string(),
            created: chrono::Utc::now().timestamp(),
            sent_role: false,
            finished: false,
        }
    }

    fn frame(&self, delta: Value, finish_reason: Option<&str>, usage: Option<Value>) -> Bytes {
        let mut body = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason
            }]
        });
        if let Some(usage) = usage {
            body["usage"] = usage;
        }
        Bytes::from(format!("data: {}\n\n", body))
    }

    pub fn encode_chunk(&mut self, chunk: &CanonicalChunk) -> Vec<Bytes> {
        let mut frames = Vec::new();

        if let Some(text) = &chunk.text {
            let mut delta = json!({ "content": text });
            if !self.sent_role {
                delta["role"] = Value::String("assistant".to_string());
                self.sent_role = true;
            }
            frames.push(self.frame(delta, None, None));
        }

        if let Some(call) = &chunk.tool_call {
            let mut function = json!({ "arguments": call.arguments_delta });
            if let Some(name) = &call.name {
                function["name"] = Value::String(name.clone());
            }
            let mut entry = json!({
                "index": call.index,
                "type": "function",
                "function": function
            });
            if let Some(id) = &call.id {
                entry["id"] = Value::String(id.clone());
            }
            let mut delta = json!({ "tool_calls": [entry] });
            if !self.sent_role {
                delta["role"] = Value::String("assistant".to_string());
                self.sent_role = true;
            }
            frames.push(self.frame(delta, None, None));
        }

        if chunk.done {
            let finish = chunk.finish_reason.as_deref().unwrap_or("stop");
            let usage = chunk.usage.map(|u| {
                json!({
                    "prompt_tokens": u.prompt_tokens,
                    "completion_tokens": u.completion_tokens,
                    "total_tokens": u.total()
                })
            });
            frames.push(self.frame(json!({}), Some(finish), usage));
        }

        frames
    }

    pub fn finish(&mut self) -> Vec<Bytes> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        vec![Bytes::from_static(b"data: [DONE]\n\n")]
    }

    pub fn encode_error(&mut self, kind: ErrorKind, message: &str) -> Vec<Bytes> {
        let body = json!({
            "error": {
                "message": message,
                "type": kind.code(),
                "code": kind.code()
            }
        });
        let mut frames = vec![Bytes::from(format!("data: {}\n\n", body))];
        frames.extend(self.finish());
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::TokenUsage;

    fn sample_request() -> Value {
        json!({
            "model": "gpt-4o-mini",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"}
            ],
            "temperature": 0.4,
            "max_tokens": 128,
            "stop": ["END"],
            "stream": false
        })
    }

    #[test]
    fn parse_basic_request() {
        let req = parse_request(&sample_request()).unwrap();
        assert_eq!(req.model, "gpt-4o-mini");
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, Role::System);
        assert_eq!(req.messages[1].joined_text(), "hi");
        assert_eq!(req.temperature, Some(0.4));
        assert_eq!(req.max_tokens, Some(128));
        assert_eq!(req.stop, vec!["END"]);
        assert!(!req.stream);
    }

    #[test]
    fn parse_rejects_missing_model() {
        let err = parse_request(&json!({"messages": [{"role": "user", "content": "x"}]}))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadRequest);
    }

    #[test]
    fn parse_rejects_unknown_content_part() {
        let raw = json!({
            "model": "m",
            "messages": [{"role": "user", "content": [{"type": "audio", "data": "..."}]}]
        });
        let err = parse_request(&raw).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnsupportedRequestFeature);
    }

    #[test]
    fn parse_tools_and_forced_choice() {
        let raw = json!({
            "model": "m",
            "messages": [{"role": "user", "content": "x"}],
            "tools": [{
                "type": "function",
                "function": {
                    "name": "lookup",
                    "description": "find things",
                    "parameters": {"type": "object"}
                }
            }],
            "tool_choice": {"type": "function", "function": {"name": "lookup"}}
        });
        let req = parse_request(&raw).unwrap();
        assert_eq!(req.tools.len(), 1);
        assert_eq!(req.tools[0].name, "lookup");
        assert_eq!(req.forced_tool.as_deref(), Some("lookup"));
    }

    #[test]
    fn parse_tool_messages() {
        let raw = json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "x"},
                {"role": "assistant", "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": {"name": "lookup", "arguments": "{\"q\":1}"}
                }]},
                {"role": "tool", "tool_call_id": "call_1", "content": "found"}
            ]
        });
        let req = parse_request(&raw).unwrap();
        match &req.messages[1].parts[0] {
            ContentPart::ToolCall { name, arguments, .. } => {
                assert_eq!(name, "lookup");
                assert_eq!(arguments["q"], 1);
            }
            other => panic!("unexpected part: {:?}", other),
        }
        match &req.messages[2].parts[0] {
            ContentPart::ToolResult { tool_call_id, content } => {
                assert_eq!(tool_call_id, "call_1");
                assert_eq!(content, "found");
            }
            other => panic!("unexpected part: {:?}", other),
        }
    }

    #[test]
    fn request_render_parse_round_trip() {
        let req = parse_request(&sample_request()).unwrap();
        let wire = render_request(&req, "gpt-4o-mini", false);
        let back = parse_request(&wire).unwrap();
        assert_eq!(back.model, req.model);
        assert_eq!(back.messages, req.messages);
        assert_eq!(back.temperature, req.temperature);
        assert_eq!(back.max_tokens, req.max_tokens);
        assert_eq!(back.stop, req.stop);
    }

    #[test]
    fn unary_round_trip_preserves_semantics() {
        let req = parse_request(&sample_request()).unwrap();
        let response = CanonicalResponse {
            id: "abc".to_string(),
            model: req.model.clone(),
            parts: vec![ContentPart::Text { text: "hello".to_string() }],
            stop_reason: Some("stop".to_string()),
            usage: TokenUsage::new(3, 2),
        };
        let rendered = render_unary(&response);
        assert_eq!(rendered["object"], "chat.completion");
        assert_eq!(rendered["model"], "gpt-4o-mini");
        assert_eq!(rendered["choices"][0]["message"]["content"], "hello");
        assert_eq!(rendered["choices"][0]["finish_reason"], "stop");
        assert_eq!(rendered["usage"]["total_tokens"], 5);
    }

    #[test]
    fn stream_encoder_framing() {
        let mut enc = OpenAiStreamEncoder::new("req1", "gpt-4o-mini");
        let frames = enc.encode_chunk(&CanonicalChunk::text("Hel"));
        assert_eq!(frames.len(), 1);
        let first = String::from_utf8(frames[0].to_vec()).unwrap();
        assert!(first.starts_with("data: "));
        assert!(first.ends_with("\n\n"));
        let body: Value =
            serde_json::from_str(first.trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(body["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(body["choices"][0]["delta"]["content"], "Hel");

        let frames = enc.encode_chunk(&CanonicalChunk::done_with(
            Some(TokenUsage::new(1, 2)),
            Some("stop".to_string()),
        ));
        let last: Value = serde_json::from_str(
            String::from_utf8(frames[0].to_vec())
                .unwrap()
                .trim_start_matches("data: ")
                .trim(),
        )
        .unwrap();
        assert_eq!(last["choices"][0]["finish_reason"], "stop");
        assert_eq!(last["usage"]["total_tokens"], 3);

        let done = enc.finish();
        assert_eq!(done.len(), 1);
        assert_eq!(&done[0][..], b"data: [DONE]\n\n");
        assert!(enc.finish().is_empty());
    }

    #[test]
    fn stream_error_envelope_ends_stream() {
        let mut enc = OpenAiStreamEncoder::new("req1", "m");
        let frames = enc.encode_error(ErrorKind::Upstream5xx, "upstream died");
        assert_eq!(frames.len(), 2);
        let body: Value = serde_json::from_str(
            String::from_utf8(frames[0].to_vec())
                .unwrap()
                .trim_start_matches("data: ")
                .trim(),
        )
        .unwrap();
        assert_eq!(body["error"]["type"], "upstream_5xx");
    }
}
