//! Format translation
//!
//! Pairs of parse/render functions per dialect plus the streaming encoders.
//! Cross-translation is composition: caller dialect -> canonical on the way
//! in, canonical delta events -> caller dialect on the way out. Translators
//! are pure; encoders hold only per-stream framing state and are restarted
//! per request.

pub mod claude;
pub mod gemini;
pub mod openai;

use axum::body::Bytes;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::Value;

use crate::canonical::{CanonicalChunk, CanonicalRequest, CanonicalResponse, Dialect};
use crate::error::{ErrorKind, GatewayResult};

/// Parse a raw request body into the canonical shape.
///
/// `path_model` and `force_stream` carry the URL-derived pieces of the
/// Gemini dialect, where model and streaming mode live in the path.
pub fn parse_request(
    dialect: Dialect,
    raw: &Value,
    path_model: Option<&str>,
    force_stream: bool,
) -> GatewayResult<CanonicalRequest> {
    match dialect {
        Dialect::OpenAi => openai::parse_request(raw),
        Dialect::Claude => claude::parse_request(raw),
        Dialect::Gemini => gemini::parse_request(raw, path_model, force_stream),
    }
}

/// Render a complete response in the caller's dialect.
pub fn render_unary(dialect: Dialect, response: &CanonicalResponse) -> Value {
    match dialect {
        Dialect::OpenAi => openai::render_unary(response),
        Dialect::Claude => claude::render_unary(response),
        Dialect::Gemini => gemini::render_unary(response),
    }
}

/// Streaming encoder, one per in-flight request.
pub enum StreamEncoder {
    OpenAi(openai::OpenAiStreamEncoder),
    Claude(claude::ClaudeStreamEncoder),
    Gemini(gemini::GeminiStreamEncoder),
}

impl StreamEncoder {
    pub fn new(dialect: Dialect, request_id: &str, model: &str) -> Self {
        match dialect {
            Dialect::OpenAi => {
                StreamEncoder::OpenAi(openai::OpenAiStreamEncoder::new(request_id, model))
            }
            Dialect::Claude => {
                StreamEncoder::Claude(claude::ClaudeStreamEncoder::new(request_id, model))
            }
            Dialect::Gemini => {
                StreamEncoder::Gemini(gemini::GeminiStreamEncoder::new(model))
            }
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            StreamEncoder::OpenAi(_) | StreamEncoder::Claude(_) => "text/event-stream",
            StreamEncoder::Gemini(_) => "application/json",
        }
    }

    /// Translate one canonical chunk into zero-or-more wire frames,
    /// preserving delta order.
    pub fn encode_chunk(&mut self, chunk: &CanonicalChunk) -> Vec<Bytes> {
        match self {
            StreamEncoder::OpenAi(e) => e.encode_chunk(chunk),
            StreamEncoder::Claude(e) => e.encode_chunk(chunk),
            StreamEncoder::Gemini(e) => e.encode_chunk(chunk),
        }
    }

    /// Terminal frames after the last chunk.
    pub fn finish(&mut self) -> Vec<Bytes> {
        match self {
            StreamEncoder::OpenAi(e) => e.finish(),
            StreamEncoder::Claude(e) => e.finish(),
            StreamEncoder::Gemini(e) => e.finish(),
        }
    }

    /// Mid-stream error envelope in the caller's dialect.
    pub fn encode_error(&mut self, kind: ErrorKind, message: &str) -> Vec<Bytes> {
        match self {
            StreamEncoder::OpenAi(e) => e.encode_error(kind, message),
            StreamEncoder::Claude(e) => e.encode_error(kind, message),
            StreamEncoder::Gemini(e) => e.encode_error(kind, message),
        }
    }
}

/// Error body in the dialect's native shape.
pub fn error_body(dialect: Dialect, kind: ErrorKind, message: &str) -> Value {
    match dialect {
        Dialect::OpenAi => serde_json::json!({
            "error": {
                "message": message,
                "type": kind.code(),
                "code": kind.code()
            }
        }),
        Dialect::Claude => serde_json::json!({
            "type": "error",
            "error": {
                "type": kind.code(),
                "message": message
            }
        }),
        Dialect::Gemini => serde_json::json!({
            "error": {
                "code": kind.status().as_u16(),
                "message": message,
                "status": kind.code()
            }
        }),
    }
}

/// Full terminal error response for a failed request.
pub fn error_response(
    dialect: Dialect,
    kind: ErrorKind,
    message: &str,
    retry_after_secs: Option<u64>,
) -> Response {
    let mut response = (
        kind.status(),
        axum::Json(error_body(dialect, kind, message)),
    )
        .into_response();
    if kind == ErrorKind::RateLimited {
        if let Some(secs) = retry_after_secs {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
    }
    if response.status() == StatusCode::TOO_MANY_REQUESTS
        && !response.headers().contains_key("retry-after")
    {
        response
            .headers_mut()
            .insert("retry-after", axum::http::HeaderValue::from_static("1"));
    }
    response
}

/// Canonical stop reasons use the OpenAI vocabulary internally.
pub fn claude_stop_reason(canonical: &str) -> &'static str {
    match canonical {
        "length" => "max_tokens",
        "tool_calls" => "tool_use",
        _ => "end_turn",
    }
}

pub fn canonical_stop_from_claude(reason: &str) -> &'static str {
    match reason {
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        _ => "stop",
    }
}

pub fn gemini_finish_reason(canonical: &str) -> &'static str {
    match canonical {
        "length" => "MAX_TOKENS",
        _ => "STOP",
    }
}

pub fn canonical_stop_from_gemini(reason: &str) -> &'static str {
    match reason {
        "MAX_TOKENS" => "length",
        _ => "stop",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_bodies_match_dialect_shapes() {
        let openai = error_body(Dialect::OpenAi, ErrorKind::RateLimited, "slow down");
        assert_eq!(openai["error"]["type"], "rate_limited");

        let claude = error_body(Dialect::Claude, ErrorKind::InvalidKey, "bad key");
        assert_eq!(claude["type"], "error");
        assert_eq!(claude["error"]["type"], "invalid_key");

        let gemini = error_body(Dialect::Gemini, ErrorKind::ModelNotPermitted, "no");
        assert_eq!(gemini["error"]["code"], 403);
    }

    #[test]
    fn rate_limit_response_carries_retry_after() {
        let resp = error_response(Dialect::OpenAi, ErrorKind::RateLimited, "limit", Some(7));
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get("retry-after").unwrap(), "7");
    }

    #[test]
    fn stop_reason_maps_round_trip() {
        assert_eq!(claude_stop_reason("tool_calls"), "tool_use");
        assert_eq!(canonical_stop_from_claude("tool_use"), "tool_calls");
        assert_eq!(gemini_finish_reason("length"), "MAX_TOKENS");
        assert_eq!(canonical_stop_from_gemini("MAX_TOKENS"), "length");
    }
}
