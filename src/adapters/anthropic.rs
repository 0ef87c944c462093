//! Anthropic Messages upstream adapter

use std::collections::HashMap;
use std::time::Duration;

use async_stream::try_stream;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Client;
use serde_json::Value;

use crate::canonical::{CanonicalChunk, ChunkStream, TokenUsage, ToolCallDelta};
use crate::config::GatewayConfig;
use crate::dialects::{canonical_stop_from_claude, claude as wire};
use crate::error::{ErrorKind, GatewayError, GatewayResult};
use crate::pool::Credential;

use super::{
    apply_extra_headers, drain_sse_lines, parse_sse_data, send_upstream, AdapterImpl,
    CallContext,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter;

fn build_headers(ctx: &CallContext) -> GatewayResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    headers.insert(
        "anthropic-version",
        HeaderValue::from_static(ANTHROPIC_VERSION),
    );
    match ctx.account.credential() {
        Credential::ApiKey(key) => {
            let value = HeaderValue::from_str(&key).map_err(|_| {
                GatewayError::new(ErrorKind::UpstreamAuthFailed, "malformed account key")
            })?;
            headers.insert("x-api-key", value);
        }
        Credential::Bundle(_) => {
            return Err(GatewayError::internal(
                "anthropic account with a credential bundle",
            ))
        }
    }
    apply_extra_headers(&mut headers, &ctx.provider);
    Ok(headers)
}

fn parse_unary_usage(body: &Value) -> Option<TokenUsage> {
    let usage = body.get("usage")?;
    Some(TokenUsage::new(
        usage.get("input_tokens").and_then(|v| v.as_i64()).unwrap_or(0),
        usage.get("output_tokens").and_then(|v| v.as_i64()).unwrap_or(0),
    ))
}

/// Canonical chunk sequence from a complete Messages response body.
pub fn chunks_from_unary(body: &Value) -> Vec<CanonicalChunk> {
    let mut chunks = Vec::new();
    let mut tool_index = 0usize;
    if let Some(blocks) = body.get("content").and_then(|v| v.as_array()) {
        for block in blocks {
            match block.get("type").and_then(|v| v.as_str()) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                        if !text.is_empty() {
                            chunks.push(CanonicalChunk::text(text));
                        }
                    }
                }
                Some("tool_use") => {
                    chunks.push(CanonicalChunk {
                        tool_call: Some(ToolCallDelta {
                            index: tool_index,
                            id: block.get("id").and_then(|v| v.as_str()).map(|s| s.to_string()),
                            name: block
                                .get("name")
                                .and_then(|v| v.as_str())
                                .map(|s| s.to_string()),
                            arguments_delta: block
                                .get("input")
                                .map(|v| v.to_string())
                                .unwrap_or_default(),
                        }),
                        ..Default::default()
                    });
                    tool_index += 1;
                }
                _ => {}
            }
        }
    }
    let finish = body
        .get("stop_reason")
        .and_then(|v| v.as_str())
        .map(|s| canonical_stop_from_claude(s).to_string());
    chunks.push(CanonicalChunk::done_with(parse_unary_usage(body), finish));
    chunks
}

/// Per-stream decode state for the named Anthropic events.
#[derive(Default)]
pub struct StreamState {
    input_tokens: i64,
    output_tokens: i64,
    finish: Option<String>,
    tool_blocks: HashMap<u64, usize>,
    next_tool_index: usize,
    done: bool,
}

impl StreamState {
    /// Decode one SSE data payload into zero-or-one canonical chunks.
    pub fn decode(&mut self, event: &Value) -> Option<CanonicalChunk> {
        match event.get("type").and_then(|v| v.as_str()) {
            Some("message_start") => {
                self.input_tokens = event
                    .pointer("/message/usage/input_tokens")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
                None
            }
            Some("content_block_start") => {
                let index = event.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                let block = event.get("content_block")?;
                if block.get("type").and_then(|v| v.as_str()) == Some("tool_use") {
                    let tool_index = self.next_tool_index;
                    self.next_tool_index += 1;
                    self.tool_blocks.insert(index, tool_index);
                    return Some(CanonicalChunk {
                        tool_call: Some(ToolCallDelta {
                            index: tool_index,
                            id: block.get("id").and_then(|v| v.as_str()).map(|s| s.to_string()),
                            name: block
                                .get("name")
                                .and_then(|v| v.as_str())
                                .map(|s| s.to_string()),
                            arguments_delta: String::new(),
                        }),
                        ..Default::default()
                    });
                }
                None
            }
            Some("content_block_delta") => {
                let index = event.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                let delta = event.get("delta")?;
                match delta.get("type").and_then(|v| v.as_str()) {
                    Some("text_delta") => {
                        let text = delta.get("text").and_then(|v| v.as_str())?;
                        Some(CanonicalChunk::text(text))
                    }
                    Some("input_json_delta") => {
                        let partial = delta.get("partial_json").and_then(|v| v.as_str())?;
                        let tool_index = *self.tool_blocks.get(&index)?;
                        Some(CanonicalChunk {
                            tool_call: Some(ToolCallDelta {
                                index: tool_index,
                                id: None,
                                name: None,
                                arguments_delta: partial.to_string(),
                            }),
                            ..Default::default()
                        })
                    }
                    _ => None,
                }
            }
            Some("message_delta") => {
                if let Some(reason) = event.pointer("/delta/stop_reason").and_then(|v| v.as_str())
                {
                    self.finish = Some(canonical_stop_from_claude(reason).to_string());
                }
                if let Some(output) =
                    event.pointer("/usage/output_tokens").and_then(|v| v.as_i64())
                {
                    self.output_tokens = output;
                }
                None
            }
            Some("message_stop") => {
                self.done = true;
                None
            }
            _ => None,
        }
    }

    pub fn terminal_chunk(&self) -> CanonicalChunk {
        CanonicalChunk::done_with(
            Some(TokenUsage::new(self.input_tokens, self.output_tokens)),
            self.finish.clone(),
        )
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

impl AdapterImpl for AnthropicAdapter {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn execute(
        &self,
        http: &Client,
        ctx: &CallContext,
        cfg: &GatewayConfig,
    ) -> GatewayResult<ChunkStream> {
        let headers = build_headers(ctx)?;
        let url = format!("{}/v1/messages", ctx.base_url().trim_end_matches('/'));
        let body = wire::render_request(&ctx.request, &ctx.request.model, ctx.request.stream);

        let response = send_upstream(http, &url, headers, &body, cfg, "anthropic").await?;

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

        let between_chunks = Duration::from_secs(cfg.between_chunks_timeout_secs.max(1));
        let stream = try_stream! {
            let mut bytes = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            let mut state = StreamState::default();

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
                    let Ok(json) = serde_json::from_str::<Value>(payload) else { continue };
                    if let Some(chunk) = state.decode(&json) {
                        yield chunk;
                    }
                    if state.is_done() {
                        break 'read;
                    }
                }
            }

            yield state.terminal_chunk();
        };

        Ok(Box::pin(stream))
    }
}
