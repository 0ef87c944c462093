//! Gemini generateContent dialect
//!
//! The model name and the streaming mode arrive in the URL path
//! (`models/{model}:generateContent` vs `:streamGenerateContent`), so the
//! parser takes both alongside the body.

use axum::body::Bytes;
use serde_json::{json, Value};

use crate::canonical::{
    CanonicalChunk, CanonicalRequest, CanonicalResponse, ContentPart, Dialect, Message, Role,
    ToolChoice, ToolSpec,
};
use crate::dialects::gemini_finish_reason;
use crate::error::{ErrorKind, GatewayError, GatewayResult};

fn parse_parts(raw_parts: &Value, parts: &mut Vec<ContentPart>) -> GatewayResult<()> {
    let Some(items) = raw_parts.as_array() else {
        return Err(GatewayError::bad_request("'parts' must be an array"));
    };
    for item in items {
        if let Some(text) = item.get("text").and_then(|v| v.as_str()) {
            parts.push(ContentPart::Text { text: text.to_string() });
        } else if let Some(blob) = item.get("inlineData").or_else(|| item.get("inline_data")) {
            parts.push(ContentPart::ImageRef {
                media_type: blob
                    .get("mimeType")
                    .or_else(|| blob.get("mime_type"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("application/octet-stream")
                    .to_string(),
                data: blob
                    .get("data")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            });
        } else if let Some(call) = item.get("functionCall") {
            parts.push(ContentPart::ToolCall {
                id: String::new(),
                name: call
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                arguments: call.get("args").cloned().unwrap_or(Value::Null),
            });
        } else if let Some(result) = item.get("functionResponse") {
            parts.push(ContentPart::ToolResult {
                tool_call_id: result
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                content: result
                    .get("response")
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            });
        } else {
            return Err(GatewayError::unsupported(
                "unsupported part in 'contents'",
            ));
        }
    }
    Ok(())
}

pub fn parse_request(
    raw: &Value,
    path_model: Option<&str>,
    force_stream: bool,
) -> GatewayResult<CanonicalRequest> {
    let model = raw
        .get("model")
        .and_then(|v| v.as_str())
        .or(path_model)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GatewayError::bad_request("missing model"))?;

    let mut request = CanonicalRequest::new(model, Dialect::Gemini);
    request.stream = force_stream;

    if let Some(system) = raw
        .get("systemInstruction")
        .or_else(|| raw.get("system_instruction"))
    {
        let mut parts = Vec::new();
        if let Some(raw_parts) = system.get("parts") {
            parse_parts(raw_parts, &mut parts)?;
        }
        let text = parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<String>();
        request.messages.push(Message::text(Role::System, text));
    }

    let contents = raw
        .get("contents")
        .and_then(|v| v.as_array())
        .filter(|c| !c.is_empty())
        .ok_or_else(|| GatewayError::bad_request("missing 'contents' array"))?;

    for content in contents {
        let role = match content.get("role").and_then(|v| v.as_str()) {
            Some("model") => Role::Assistant,
            Some("user") | None => Role::User,
            Some(other) => {
                return Err(GatewayError::bad_request(format!(
                    "unknown role '{}'",
                    other
                )))
            }
        };
        let mut parts = Vec::new();
        if let Some(raw_parts) = content.get("parts") {
            parse_parts(raw_parts, &mut parts)?;
        }
        request.messages.push(Message { role, parts });
    }

    if let Some(cfg) = raw
        .get("generationConfig")
        .or_else(|| raw.get("generation_config"))
    {
        request.temperature = cfg.get("temperature").and_then(|v| v.as_f64());
        request.top_p = cfg
            .get("topP")
            .or_else(|| cfg.get("top_p"))
            .and_then(|v| v.as_f64());
        request.max_tokens = cfg
            .get("maxOutputTokens")
            .or_else(|| cfg.get("max_output_tokens"))
            .and_then(|v| v.as_u64())
            .map(|v| v as u32);
        if let Some(stops) = cfg
            .get("stopSequences")
            .or_else(|| cfg.get("stop_sequences"))
            .and_then(|v| v.as_array())
        {
            for stop in stops {
                if let Some(s) = stop.as_str() {
                    request.stop.push(s.to_string());
                }
            }
        }
    }

    if let Some(tools) = raw.get("tools").and_then(|v| v.as_array()) {
        for tool in tools {
            let Some(decls) = tool
                .get("functionDeclarations")
                .or_else(|| tool.get("function_declarations"))
                .and_then(|v| v.as_array())
            else {
                return Err(GatewayError::unsupported(
                    "only functionDeclarations tools are supported",
                ));
            };
            for decl in decls {
                request.tools.push(ToolSpec {
                    name: decl
                        .get("name")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| GatewayError::bad_request("tool without name"))?
                        .to_string(),
                    description: decl
                        .get("description")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    parameters: decl.get("parameters").cloned().unwrap_or(json!({})),
                });
            }
        }
    }

    if let Some(mode) = raw
        .pointer("/toolConfig/functionCallingConfig/mode")
        .or_else(|| raw.pointer("/tool_config/function_calling_config/mode"))
        .and_then(|v| v.as_str())
    {
        request.tool_choice = match mode {
            "AUTO" => Some(ToolChoice::Auto),
            "ANY" => Some(ToolChoice::Required),
            "NONE" => Some(ToolChoice::None),
            other => {
                return Err(GatewayError::bad_request(format!(
                    "unknown function calling mode '{}'",
                    other
                )))
            }
        };
    }

    Ok(request)
}

/// Render a canonical request onto the Gemini wire. The model name rides
/// in the URL, not the body.
pub fn render_request(request: &CanonicalRequest) -> Value {
    let mut contents = Vec::new();
    let mut system_text = String::new();

    for message in &request.messages {
        if message.role == Role::System {
            system_text.push_str(&message.joined_text());
            continue;
        }
        let role = if message.role == Role::Assistant { "model" } else { "user" };
        let mut parts = Vec::new();
        for part in &message.parts {
            match part {
                ContentPart::Text { text } => parts.push(json!({ "text": text })),
                ContentPart::ImageRef { media_type, data } => parts.push(json!({
                    "inlineData": { "mimeType": media_type, "data": data }
                })),
                ContentPart::ToolCall { name, arguments, .. } => parts.push(json!({
                    "functionCall": { "name": name, "args": arguments }
                })),
                ContentPart::ToolResult { tool_call_id, content } => {
                    let response: Value = serde_json::from_str(content)
                        .unwrap_or_else(|_| json!({ "content": content }));
                    parts.push(json!({
                        "functionResponse": { "name": tool_call_id, "response": response }
                    }));
                }
            }
        }
        contents.push(json!({ "role": role, "parts": parts }));
    }

    let mut body = json!({ "contents": contents });
    if !system_text.is_empty() {
        body["systemInstruction"] = json!({ "parts": [{ "text": system_text }] });
    }

    let mut generation = serde_json::Map::new();
    if let Some(t) = request.temperature {
        generation.insert("temperature".to_string(), json!(t));
    }
    if let Some(p) = request.top_p {
        generation.insert("topP".to_string(), json!(p));
    }
    if let Some(m) = request.max_tokens {
        generation.insert("maxOutputTokens".to_string(), json!(m));
    }
    if !request.stop.is_empty() {
        generation.insert("stopSequences".to_string(), json!(request.stop));
    }
    if !generation.is_empty() {
        body["generationConfig"] = Value::Object(generation);
    }

    if !request.tools.is_empty() {
        body["tools"] = json!([{
            "functionDeclarations": request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters
                    })
                })
                .collect::<Vec<_>>()
        }]);
    }
    if let Some(choice) = request.tool_choice {
        let mode = match choice {
            ToolChoice::Auto => "AUTO",
            ToolChoice::Required => "ANY",
            ToolChoice::None => "NONE",
        };
        body["toolConfig"] = json!({ "functionCallingConfig": { "mode": mode } });
    }
    body
}

fn render_parts(parts: &[ContentPart]) -> Vec<Value> {
    let mut out = Vec::new();
    for part in parts {
        match part {
            ContentPart::Text { text } => out.push(json!({ "text": text })),
            ContentPart::ToolCall { name, arguments, .. } => out.push(json!({
                "functionCall": { "name": name, "args": arguments }
            })),
            _ => {}
        }
    }
    out
}

pub fn render_unary(response: &CanonicalResponse) -> Value {
    let finish = response
        .stop_reason
        .as_deref()
        .map(gemini_finish_reason)
        .unwrap_or("STOP");
    json!({
        "candidates": [{
            "content": {
                "role": "model",
                "parts": render_parts(&response.parts)
            },
            "finishReason": finish,
            "index": 0
        }],
        "usageMetadata": {
            "promptTokenCount": response.usage.prompt_tokens,
            "candidatesTokenCount": response.usage.completion_tokens,
            "totalTokenCount": response.usage.total()
        },
        "modelVersion": response.model
    })
}

/// Streaming encoder: newline-separated JSON objects in an
/// `application/json` stream, one object per delta.
pub struct GeminiStreamEncoder {
    model: String,
    finished: bool,
}

impl GeminiStreamEncoder {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            finished: false,
        }
    }

    fn frame(&self, parts: Vec<Value>, finish: Option<&str>, usage: Option<Value>) -> Bytes {
        let mut candidate = json!({
            "content": { "role": "model", "parts": parts },
            "index": 0
        });
        if let Some(reason) = finish {
            candidate["finishReason"] = Value::String(reason.to_string());
        }
        let mut body = json!({
            "candidates": [candidate],
            "modelVersion": self.model
        });
        if let Some(usage) = usage {
            body["usageMetadata"] = usage;
        }
        Bytes::from(format!("{}\n", body))
    }

    pub fn encode_chunk(&mut self, chunk: &CanonicalChunk) -> Vec<Bytes> {
        let mut frames = Vec::new();

        if let Some(text) = &chunk.text {
            frames.push(self.frame(vec![json!({ "text": text })], None, None));
        }

        if let Some(call) = &chunk.tool_call {
            // Gemini function calls are not token-streamed; emit the
            // fragment as it arrives and let the client accumulate.
            let args: Value = serde_json::from_str(&call.arguments_delta)
                .unwrap_or(Value::String(call.arguments_delta.clone()));
            frames.push(self.frame(
                vec![json!({
                    "functionCall": {
                        "name": call.name.clone().unwrap_or_default(),
                        "args": args
                    }
                })],
                None,
                None,
            ));
        }

        if chunk.done && !self.finished {
            self.finished = true;
            let finish = chunk
                .finish_reason
                .as_deref()
                .map(gemini_finish_reason)
                .unwrap_or("STOP");
            let usage = chunk.usage.map(|u| {
                json!({
                    "promptTokenCount": u.prompt_tokens,
                    "candidatesTokenCount": u.completion_tokens,
                    "totalTokenCount": u.total()
                })
            });
            frames.push(self.frame(Vec::new(), Some(finish), usage));
        }

        frames
    }

    pub fn finish(&mut self) -> Vec<Bytes> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        vec![self.frame(Vec::new(), Some("STOP"), None)]
    }

    pub fn encode_error(&mut self, kind: ErrorKind, message: &str) -> Vec<Bytes> {
        self.finished = true;
        let body = json!({
            "error": {
                "code": kind.status().as_u16(),
                "message": message,
                "status": kind.code()
            }
        });
        vec![Bytes::from(format!("{}\n", body))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::TokenUsage;

    fn sample_request() -> Value {
        json!({
            "contents": [
                {"role": "user", "parts": [{"text": "hi"}]}
            ],
            "systemInstruction": {"parts": [{"text": "be brief"}]},
            "generationConfig": {
                "temperature": 0.3,
                "topP": 0.9,
                "maxOutputTokens": 64,
                "stopSequences": ["END"]
            }
        })
    }

    #[test]
    fn parse_pulls_model_from_path() {
        let req = parse_request(&sample_request(), Some("gemini-1.5-pro"), true).unwrap();
        assert_eq!(req.model, "gemini-1.5-pro");
        assert!(req.stream);
        assert_eq!(req.messages[0].role, Role::System);
        assert_eq!(req.messages[0].joined_text(), "be brief");
        assert_eq!(req.messages[1].joined_text(), "hi");
        assert_eq!(req.temperature, Some(0.3));
        assert_eq!(req.top_p, Some(0.9));
        assert_eq!(req.max_tokens, Some(64));
        assert_eq!(req.stop, vec!["END"]);
    }

    #[test]
    fn parse_function_call_round() {
        let raw = json!({
            "contents": [
                {"role": "model", "parts": [
                    {"functionCall": {"name": "lookup", "args": {"q": "x"}}}
                ]},
                {"role": "user", "parts": [
                    {"functionResponse": {"name": "lookup", "response": {"answer": 42}}}
                ]}
            ]
        });
        let req = parse_request(&raw, Some("gemini-1.5-pro"), false).unwrap();
        match &req.messages[0].parts[0] {
            ContentPart::ToolCall { name, arguments, .. } => {
                assert_eq!(name, "lookup");
                assert_eq!(arguments["q"], "x");
            }
            other => panic!("unexpected part: {:?}", other),
        }
        assert!(matches!(
            &req.messages[1].parts[0],
            ContentPart::ToolResult { .. }
        ));
    }

    #[test]
    fn missing_contents_is_bad_request() {
        let err = parse_request(&json!({}), Some("gemini-1.5-pro"), false).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadRequest);
    }

    #[test]
    fn unary_render_has_gemini_shape() {
        let response = CanonicalResponse {
            id: "abc".to_string(),
            model: "gemini-1.5-pro".to_string(),
            parts: vec![ContentPart::Text { text: "hello".to_string() }],
            stop_reason: Some("length".to_string()),
            usage: TokenUsage::new(4, 6),
        };
        let rendered = render_unary(&response);
        assert_eq!(rendered["candidates"][0]["content"]["parts"][0]["text"], "hello");
        assert_eq!(rendered["candidates"][0]["finishReason"], "MAX_TOKENS");
        assert_eq!(rendered["usageMetadata"]["totalTokenCount"], 10);
    }

    #[test]
    fn stream_frames_are_newline_separated_json() {
        let mut enc = GeminiStreamEncoder::new("gemini-1.5-pro");
        let mut frames = Vec::new();
        frames.extend(enc.encode_chunk(&CanonicalChunk::text("Hel")));
        frames.extend(enc.encode_chunk(&CanonicalChunk::text("lo")));
        frames.extend(enc.encode_chunk(&CanonicalChunk::done_with(
            Some(TokenUsage::new(2, 3)),
            Some("stop".to_string()),
        )));
        frames.extend(enc.finish());
        assert_eq!(frames.len(), 3);
        for frame in &frames {
            let text = String::from_utf8(frame.to_vec()).unwrap();
            assert!(text.ends_with('\n'));
            let parsed: Value = serde_json::from_str(text.trim()).unwrap();
            assert!(parsed.get("candidates").is_some());
        }
        let last: Value = serde_json::from_str(
            String::from_utf8(frames[2].to_vec()).unwrap().trim(),
        )
        .unwrap();
        assert_eq!(last["candidates"][0]["finishReason"], "STOP");
        assert_eq!(last["usageMetadata"]["totalTokenCount"], 5);
    }
}
