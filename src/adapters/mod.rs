//! Provider adapters
//!
//! One adapter per provider type, dispatched through an enum so the
//! dispatcher never type-tests. `execute` returns a `ChunkStream`: a lazy,
//! cancellable sequence of canonical chunks. Dropping the stream drops the
//! upstream body and closes the connection.

pub mod anthropic;
pub mod gemini;
pub mod kiro;
pub mod openai;

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use serde_json::Value;

use crate::canonical::{CanonicalRequest, ChunkStream};
use crate::catalog::{Provider, ProviderKind};
use crate::config::GatewayConfig;
use crate::error::{ErrorKind, GatewayError, GatewayResult};
use crate::logger;
use crate::pool::Account;

/// Everything an adapter needs for one upstream call.
pub struct CallContext {
    pub provider: Arc<Provider>,
    pub account: Arc<Account>,
    pub request: CanonicalRequest,
}

impl CallContext {
    /// Upstream base URL: provider override or the type default.
    pub fn base_url(&self) -> String {
        self.provider
            .base_url
            .clone()
            .unwrap_or_else(|| default_base_url(self.provider.kind).to_string())
    }
}

pub fn default_base_url(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::OpenAi => "https://api.openai.com/v1",
        ProviderKind::Anthropic => "https://api.anthropic.com",
        ProviderKind::Google => "https://generativelanguage.googleapis.com",
        ProviderKind::Kiro => "https://codewhisperer.us-east-1.amazonaws.com",
        ProviderKind::Glm => "https://open.bigmodel.cn/api/paas/v4",
    }
}

/// Trait implemented by each provider adapter.
pub trait AdapterImpl: Send + Sync {
    fn name(&self) -> &'static str;

    fn execute(
        &self,
        http: &Client,
        ctx: &CallContext,
        cfg: &GatewayConfig,
    ) -> impl std::future::Future<Output = GatewayResult<ChunkStream>> + Send;
}

pub enum Adapter {
    OpenAi(openai::OpenAiAdapter),
    Anthropic(anthropic::AnthropicAdapter),
    Gemini(gemini::GeminiAdapter),
    Kiro(kiro::KiroAdapter),
}

/// Adapter for a provider type. `glm` shares the OpenAI-compatible wire.
pub fn adapter_for(kind: ProviderKind) -> Adapter {
    match kind {
        ProviderKind::OpenAi | ProviderKind::Glm => Adapter::OpenAi(openai::OpenAiAdapter),
        ProviderKind::Anthropic => Adapter::Anthropic(anthropic::AnthropicAdapter),
        ProviderKind::Google => Adapter::Gemini(gemini::GeminiAdapter),
        ProviderKind::Kiro => Adapter::Kiro(kiro::KiroAdapter),
    }
}

impl Adapter {
    pub fn name(&self) -> &'static str {
        match self {
            Adapter::OpenAi(a) => a.name(),
            Adapter::Anthropic(a) => a.name(),
            Adapter::Gemini(a) => a.name(),
            Adapter::Kiro(a) => a.name(),
        }
    }

    pub async fn execute(
        &self,
        http: &Client,
        ctx: &CallContext,
        cfg: &GatewayConfig,
    ) -> GatewayResult<ChunkStream> {
        match self {
            Adapter::OpenAi(a) => a.execute(http, ctx, cfg).await,
            Adapter::Anthropic(a) => a.execute(http, ctx, cfg).await,
            Adapter::Gemini(a) => a.execute(http, ctx, cfg).await,
            Adapter::Kiro(a) => a.execute(http, ctx, cfg).await,
        }
    }
}

/// Map an upstream HTTP status into the canonical failure taxonomy.
pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        401 | 403 => ErrorKind::UpstreamAuthFailed,
        429 => ErrorKind::RateLimited,
        500..=599 => ErrorKind::Upstream5xx,
        408 => ErrorKind::UpstreamTimeout,
        _ => ErrorKind::BadRequest,
    }
}

/// Map a transport error into the canonical failure taxonomy.
pub fn classify_transport(err: &reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::new(ErrorKind::UpstreamTimeout, "upstream request timed out")
    } else {
        GatewayError::new(
            ErrorKind::Upstream5xx,
            format!("upstream connection failed: {}", err),
        )
    }
}

/// Merge provider-level header overrides into a request header map.
pub fn apply_extra_headers(headers: &mut HeaderMap, provider: &Provider) {
    for (name, value) in &provider.extra_headers {
        let Ok(name) = name.parse::<HeaderName>() else {
            logger::warn("adapter", &format!("invalid override header '{}'", name));
            continue;
        };
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(name, value);
        }
    }
}

/// Send one upstream POST, enforcing the first-byte timeout and folding
/// transport failures into the canonical taxonomy. Error statuses are
/// consumed here so upstream bodies never leak to the caller.
pub async fn send_upstream(
    http: &Client,
    url: &str,
    headers: HeaderMap,
    body: &Value,
    cfg: &GatewayConfig,
    tag: &'static str,
) -> GatewayResult<reqwest::Response> {
    logger::debug(tag, &format!("POST {}", url));
    let send = http.post(url).headers(headers).json(body).send();
    let response = tokio::time::timeout(
        Duration::from_secs(cfg.first_byte_timeout_secs.max(1)),
        send,
    )
    .await
    .map_err(|_| GatewayError::new(ErrorKind::UpstreamTimeout, "no response before first-byte timeout"))?
    .map_err(|e| classify_transport(&e))?;

    let status = response.status().as_u16();
    if !(200..300).contains(&status) {
        let kind = classify_status(status);
        let body = response.text().await.unwrap_or_default();
        let preview: String = body.chars().take(300).collect();
        logger::warn(tag, &format!("upstream returned {}: {}", status, preview));
        return Err(GatewayError::new(kind, format!("upstream returned {}", status)));
    }
    Ok(response)
}

/// Drain complete SSE lines from a byte buffer; handles frames split
/// across reads and CRLF endings.
pub fn drain_sse_lines(buffer: &mut Vec<u8>, chunk: &[u8]) -> Vec<String> {
    if !chunk.is_empty() {
        buffer.extend_from_slice(chunk);
    }
    let mut lines = Vec::new();
    loop {
        let Some(pos) = buffer.iter().position(|&b| b == b'\n') else {
            break;
        };
        let mut line = buffer.drain(..=pos).collect::<Vec<u8>>();
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        lines.push(String::from_utf8_lossy(&line).to_string());
    }
    lines
}

/// Extract the payload of an SSE `data:` line.
pub fn parse_sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:")
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(401), ErrorKind::UpstreamAuthFailed);
        assert_eq!(classify_status(403), ErrorKind::UpstreamAuthFailed);
        assert_eq!(classify_status(429), ErrorKind::RateLimited);
        assert_eq!(classify_status(500), ErrorKind::Upstream5xx);
        assert_eq!(classify_status(503), ErrorKind::Upstream5xx);
        assert_eq!(classify_status(408), ErrorKind::UpstreamTimeout);
        assert_eq!(classify_status(404), ErrorKind::BadRequest);
    }

    #[test]
    fn sse_line_draining_handles_partials() {
        let mut buffer = Vec::new();
        assert!(drain_sse_lines(&mut buffer, b"data: {\"id\":").is_empty());
        assert_eq!(drain_sse_lines(&mut buffer, b"1}\n"), vec!["data: {\"id\":1}"]);
        assert!(buffer.is_empty());
        assert_eq!(drain_sse_lines(&mut buffer, b"data: ok\r\n"), vec!["data: ok"]);
    }

    #[test]
    fn sse_data_prefix() {
        assert_eq!(parse_sse_data("data: x"), Some("x"));
        assert_eq!(parse_sse_data("data:x"), Some("x"));
        assert_eq!(parse_sse_data("event: message"), None);
    }
}
