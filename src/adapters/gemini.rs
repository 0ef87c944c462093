//! Gemini generateContent upstream adapter

use std::time::Duration;

use async_stream::try_stream;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Client;
use serde_json::Value;

use crate::canonical::{CanonicalChunk, ChunkStream, TokenUsage, ToolCallDelta};
use crate::config::GatewayConfig;
use crate::dialects::{canonical_stop_from_gemini, gemini as wire};
use crate::error::{ErrorKind, GatewayError, GatewayResult};
use crate::pool::Credential;

use super::{
    apply_extra_headers, drain_sse_lines, parse_sse_data, send_upstream, AdapterImpl,
    CallContext,
};

pub struct GeminiAdapter;

fn build_headers(ctx: &CallContext) -> GatewayResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    match ctx.account.credential() {
        Credential::ApiKey(key) => {
            let value = HeaderValue::from_str(&key).map_err(|_| {
                GatewayError::new(ErrorKind::UpstreamAuthFailed, "malformed account key")
            })?;
            headers.insert("x-goog-api-key", value);
        }
        Credential::Bundle(_) => {
            return Err(GatewayError::internal(
                "gemini account with a credential bundle",
            ))
        }
    }
    apply_extra_headers(&mut headers, &ctx.provider);
    Ok(headers)
}

fn parse_usage(body: &Value) -> Option<TokenUsage> {
    let usage = body.get("usageMetadata")?;
    Some(TokenUsage::new(
        usage
            .get("promptTokenCount")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
        usage
            .get("candidatesTokenCount")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
    ))
}

/// Decode one GenerateContentResponse payload into canonical chunks.
///
/// The same shape arrives as a whole unary body and as each streamed
/// object, so one decoder serves both paths.
pub fn chunks_from_payload(body: &Value, tool_index: &mut usize) -> Vec<CanonicalChunk> {
    let mut chunks = Vec::new();
    if let Some(parts) = body
        .pointer("/candidates/0/content/parts")
        .and_then(|v| v.as_array())
    {
        for part in parts {
            if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    chunks.push(CanonicalChunk::text(text));
                }
            } else if let Some(call) = part.get("functionCall") {
                chunks.push(CanonicalChunk {
                    tool_call: Some(ToolCallDelta {
                        index: *tool_index,
                        id: None,
                        name: call
                            .get("name")
                            .and_then(|v| v.as_str())
                            .map(|s| s.to_string()),
                        arguments_delta: call
                            .get("args")
                            .map(|v| v.to_string())
                            .unwrap_or_default(),
                    }),
                    ..Default::default()
                });
                *tool_index += 1;
            }
        }
    }

    let finish = body
        .pointer("/candidates/0/finishReason")
        .and_then(|v| v.as_str())
        .map(|s| canonical_stop_from_gemini(s).to_string());
    let usage = parse_usage(body);
    if finish.is_some() || usage.is_some() {
        chunks.push(CanonicalChunk {
            usage,
            finish_reason: finish,
            ..Default::default()
        });
    }
    chunks
}

impl AdapterImpl for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn execute(
        &self,
        http: &Client,
        ctx: &CallContext,
        cfg: &GatewayConfig,
    ) -> GatewayResult<ChunkStream> {
        let headers = build_headers(ctx)?;
        let base = ctx.base_url();
        let base = base.trim_end_matches('/');
        let url = if ctx.request.stream {
            format!(
                "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
                base, ctx.request.model
            )
        } else {
            format!("{}/v1beta/models/{}:generateContent", base, ctx.request.model)
        };
        let body = wire::render_request(&ctx.request);

        let response = send_upstream(http, &url, headers, &body, cfg, "gemini").await?;

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

            let mut tool_index = 0usize;
            let mut chunks = chunks_from_payload(&body, &mut tool_index);
            let usage = parse_usage(&body);
            let finish = body
                .pointer("/candidates/0/finishReason")
                .and_then(|v| v.as_str())
                .map(|s| canonical_stop_from_gemini(s).to_string());
            // The trailer produced by the decoder is not terminal; replace
            // it with an explicit done marker.
            chunks.retain(|c| c.text.is_some() || c.tool_call.is_some());
            chunks.push(CanonicalChunk::done_with(usage, finish));
            return Ok(Box::pin(futures_util::stream::iter(
                chunks.into_iter().map(Ok),
            )));
        }

        let between_chunks = Duration::from_secs(cfg.between_chunks_timeout_secs.max(1));
        let stream = try_stream! {
            let mut bytes = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            let mut tool_index = 0usize;
            let mut usage: Option<TokenUsage> = None;
            let mut finish: Option<String> = None;

            loop {
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
                    for chunk in chunks_from_payload(&json, &mut tool_index) {
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
            }

            yield CanonicalChunk::done_with(usage, finish);
        };

        Ok(Box::pin(stream))
    }
}
