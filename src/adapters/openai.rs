//! OpenAI-compatible upstream adapter (also used for glm)

use std::time::Duration;

use async_stream::try_stream;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Client;
use serde_json::Value;

use crate::canonical::{CanonicalChunk, ChunkStream, TokenUsage, ToolCallDelta};
use crate::config::GatewayConfig;
use crate::dialects::openai as wire;
use crate::error::{ErrorKind, GatewayError, GatewayResult};
use crate::pool::Credential;

use super::{
    apply_extra_headers, drain_sse_lines, parse_sse_data, send_upstream, AdapterImpl,
    CallContext,
};

pub struct OpenAiAdapter;

fn build_headers(ctx: &CallContext) -> GatewayResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    match ctx.account.credential() {
        Credential::ApiKey(key) => {
            let value = HeaderValue::from_str(&format!("Bearer {}", key)).map_err(|_| {
                GatewayError::new(ErrorKind::UpstreamAuthFailed, "malformed account key")
            })?;
            headers.insert("authorization", value);
        }
        Credential::Bundle(_) => {
            return Err(GatewayError::internal(
                "openai-compatible account with a credential bundle",
            ))
        }
    }
    apply_extra_headers(&mut headers, &ctx.provider);
    Ok(headers)
}

/// Usage object from either a full response or a stream chunk.
fn parse_usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    if usage.is_null() {
        return None;
    }
    Some(TokenUsage::new(
        usage.get("prompt_tokens").and_then(|v| v.as_i64()).unwrap_or(0),
        usage
            .get("completion_tokens")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
    ))
}

/// Canonical chunk from one `chat.completion.chunk` payload.
pub fn chunk_from_stream_data(data: &Value) -> CanonicalChunk {
    let mut chunk = CanonicalChunk::default();
    if let Some(choice) = data.pointer("/choices/0") {
        if let Some(text) = choice.pointer("/delta/content").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                chunk.text = Some(text.to_string());
            }
        }
        if let Some(call) = choice.pointer("/delta/tool_calls/0") {
            chunk.tool_call = Some(ToolCallDelta {
                index: call.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize,
                id: call.get("id").and_then(|v| v.as_str()).map(|s| s.to_string()),
                name: call
                    .pointer("/function/name")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
                arguments_delta: call
                    .pointer("/function/arguments")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            });
        }
        if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            chunk.finish_reason = Some(reason.to_string());
        }
    }
    chunk.usage = parse_usage(data);
    chunk
}

/// Canonical chunk sequence from a complete (non-streamed) response body.
pub fn chunks_from_unary(body: &Value) -> Vec<CanonicalChunk> {
    let mut chunks = Vec::new();
    if let Some(text) = body.pointer("/choices/0/message/content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            chunks.push(CanonicalChunk::text(text));
        }
    }
    if let Some(calls) = body
        .pointer("/choices/0/message/tool_calls")
        .and_then(|v| v.as_array())
    {
        for (index, call) in calls.iter().enumerate() {
            chunks.push(CanonicalChunk {
                tool_call: Some(ToolCallDelta {
                    index,
                    id: call.get("id").and_then(|v| v.as_str()).map(|s| s.to_string()),
                    name: call
                        .pointer("/function/name")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string()),
                    arguments_delta: call
                        .pointer("/function/arguments")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                }),
                ..Default::default()
            });
        }
    }
    let finish = body
        .pointer("/choices/0/finish_reason")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    chunks.push(CanonicalChunk::done_with(parse_usage(body), finish));
    chunks
}

impl AdapterImpl for OpenAiAdapter {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn execute(
        &self,
        http: &Client,
        ctx: &CallContext,
        cfg: &GatewayConfig,
    ) -> GatewayResult<ChunkStream> {
        let headers = build_headers(ctx)?;
        let url = format!("{}/chat/completions", ctx.base_url().trim_end_matches('/'));
        let body = wire::render_request(&ctx.request, &ctx.request.model, ctx.request.stream);

        let response = send_upstream(http, &url, headers, &body, cfg, "openai").await?;

        if !ctx.request.stream {
            let body: Value = tokio::time::timeout(
                Duration::from_secs(cfg.between_chunks_timeout_secs.max(1)),
                response.json(),
            )
            .await
            .map_err(|_| {
                GatewayError::new(ErrorKind::UpstreamTimeout, "timed out reading response body")
            })?
            .map_err(|e| super::classify_transport(&e))?;
            let chunks = chunks_from_unary(&body);
            return Ok(Box::pin(futures_util::stream::iter(
                chunks.into_iter().map(Ok),
            )));
        }

        Ok(sse_chunk_stream(
            response,
            Duration::from_secs(cfg.between_chunks_timeout_secs.max(1)),
        ))
    }
}

/// Turn an OpenAI-style SSE response into a canonical chunk stream. Shared
/// with the kiro adapter, whose upstream speaks the same wire.
pub(crate) fn sse_chunk_stream(
    response: reqwest::Response,
    between_chunks: Duration,
) -> ChunkStream {
    let stream = try_stream! {
        let mut bytes = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut usage: Option<TokenUsage> = None;
        let mut finish: Option<String> = None;

        'read: loop {
            let next = tokio::time::timeout(between_chunks, bytes.next())
                .await
                .map_err(|_| GatewayError::new(
                    ErrorKind::UpstreamTimeout,
                    "stream stalled past the between-chunks timeout",
                ))?;
            let Some(item) = next else { break };
            let data = item.map_err(|e| super::classify_transport(&e))?;

            for line in drain_sse_lines(&mut buffer, &data) {
                let Some(payload) = parse_sse_data(&line) else { continue };
                if payload.trim() == "[DONE]" {
                    break 'read;
                }
                let Ok(json) = serde_json::from_str::<Value>(payload) else { continue };
                let chunk = chunk_from_stream_data(&json);
                if let Some(u) = chunk.usage {
                    usage = Some(u);
                }
                if let Some(reason) = &chunk.finish_reason {
                    finish = Some(reason.clone());
                }
                if chunk.text.is_some() || chunk.tool_call.is_some() {
                    yield CanonicalChunk { usage: None, finish_reason: None, ..chunk };
                }
            }
        }

        yield CanonicalChunk::done_with(usage, finish);
    };

    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stream_chunk_text_delta() {
        let data = json!({
            "object": "chat.completion.chunk",
            "choices": [{"index": 0, "delta": {"content": "Hel"}, "finish_reason": null}]
        });
        let chunk = chunk_from_stream_data(&data);
        assert_eq!(chunk.text.as_deref(), Some("Hel"));
        assert!(chunk.tool_call.is_none());
        assert!(chunk.finish_reason.is_none());
    }

    #[test]
    fn stream_chunk_tool_call_delta() {
        let data = json!({
            "choices": [{"index": 0, "delta": {"tool_calls": [{
                "index": 0,
                "id": "call_1",
                "function": {"name": "lookup", "arguments": "{\"q\":"}
            }]}}]
        });
        let chunk = chunk_from_stream_data(&data);
        let call = chunk.tool_call.unwrap();
        assert_eq!(call.id.as_deref(), Some("call_1"));
        assert_eq!(call.name.as_deref(), Some("lookup"));
        assert_eq!(call.arguments_delta, "{\"q\":");
    }

    #[test]
    fn stream_chunk_usage_and_finish() {
        let data = json!({
            "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 9}
        });
        let chunk = chunk_from_stream_data(&data);
        assert_eq!(chunk.finish_reason.as_deref(), Some("stop"));
        assert_eq!(chunk.usage, Some(TokenUsage::new(5, 9)));
    }

    #[test]
    fn unary_body_becomes_chunks() {
        let body = json!({
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hello"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2}
        });
        let chunks = chunks_from_unary(&body);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text.as_deref(), Some("hello"));
        assert!(chunks[1].done);
        assert_eq!(chunks[1].usage, Some(TokenUsage::new(3, 2)));
        assert_eq!(chunks[1].finish_reason.as_deref(), Some("stop"));
    }
}
