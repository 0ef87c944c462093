//! HTTP edge
//!
//! Routes the three dialect surfaces plus the model listing into the
//! dispatcher. Authorization rides in `Authorization: Bearer`, `X-Api-Key`
//! or `x-goog-api-key`; the client address comes from the socket, with
//! `X-Forwarded-For` taking precedence when present.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::canonical::Dialect;
use crate::dialects;
use crate::dispatch::{self, Gateway};
use crate::error::ErrorKind;
use crate::logger;

fn header_value(headers: &HeaderMap, key: &str) -> Option<String> {
    headers
        .get(key)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Extract the access-token key from the request headers.
///
/// Priority: Authorization Bearer, then X-Api-Key, then x-goog-api-key.
pub fn bearer_key(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
    {
        let token = auth.trim().to_string();
        if !token.is_empty() {
            return Some(token);
        }
    }
    header_value(headers, "x-api-key").or_else(|| header_value(headers, "x-goog-api-key"))
}

/// Client address: first X-Forwarded-For hop, else the socket peer.
pub fn client_ip(headers: &HeaderMap, addr: SocketAddr) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.split(',').next())
        .and_then(|s| s.trim().parse::<IpAddr>().ok())
        .unwrap_or_else(|| addr.ip())
}

async fn openai_chat(
    State(gw): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    dispatch::handle(
        gw,
        Dialect::OpenAi,
        payload,
        bearer_key(&headers),
        client_ip(&headers, addr),
        None,
        false,
    )
    .await
}

async fn claude_messages(
    State(gw): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    dispatch::handle(
        gw,
        Dialect::Claude,
        payload,
        bearer_key(&headers),
        client_ip(&headers, addr),
        None,
        false,
    )
    .await
}

/// Split a Gemini path segment like `gemini-1.5-pro:streamGenerateContent`
/// into the model and the operation.
pub fn split_gemini_call(segment: &str) -> Option<(String, bool)> {
    let (model, op) = segment.split_once(':')?;
    let model = model.trim();
    if model.is_empty() {
        return None;
    }
    match op {
        "generateContent" => Some((model.to_string(), false)),
        "streamGenerateContent" => Some((model.to_string(), true)),
        _ => None,
    }
}

async fn gemini_generate(
    State(gw): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(model_call): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    let Some((model, stream)) = split_gemini_call(&model_call) else {
        return dialects::error_response(
            Dialect::Gemini,
            ErrorKind::BadRequest,
            &format!("unknown operation '{}'", model_call),
            None,
        );
    };
    dispatch::handle(
        gw,
        Dialect::Gemini,
        payload,
        bearer_key(&headers),
        client_ip(&headers, addr),
        Some(model),
        stream,
    )
    .await
}

async fn list_models(
    State(gw): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let Some(key) = bearer_key(&headers) else {
        return dialects::error_response(
            Dialect::OpenAi,
            ErrorKind::InvalidKey,
            "missing access token",
            None,
        );
    };
    let key_hash = gw.secrets.key_hash(key.trim());
    let grant = match gw
        .tokens
        .authorize_basic(&key_hash, client_ip(&headers, addr))
    {
        Ok(grant) => grant,
        Err(err) => {
            return dialects::error_response(Dialect::OpenAi, err.kind, &err.message, None)
        }
    };

    let models: Vec<Value> = gw
        .catalog
        .models_union(&grant.token.model_whitelist)
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": 1700000000,
                "owned_by": "llm-gateway"
            })
        })
        .collect();

    Json(json!({ "object": "list", "data": models })).into_response()
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

pub fn router(gw: Arc<Gateway>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(openai_chat))
        .route("/v1/messages", post(claude_messages))
        .route("/v1beta/models/*model_call", post(gemini_generate))
        .route("/v1/models", get(list_models))
        .route("/healthz", get(healthz))
        .layer(CorsLayer::permissive())
        .with_state(gw)
}

/// Bind and serve until the shutdown signal resolves.
pub async fn serve(
    gw: Arc<Gateway>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = gw.config.snapshot().listen_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    logger::info("server", &format!("listening on {}", addr));
    axum::serve(
        listener,
        router(gw).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(key: &str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            key.parse::<axum::http::HeaderName>().unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
        headers
    }

    #[test]
    fn bearer_extraction_priority() {
        let headers = headers_with("authorization", "Bearer sk-abc");
        assert_eq!(bearer_key(&headers).as_deref(), Some("sk-abc"));

        let headers = headers_with("x-api-key", "sk-xyz");
        assert_eq!(bearer_key(&headers).as_deref(), Some("sk-xyz"));

        let headers = headers_with("x-goog-api-key", "sk-goog");
        assert_eq!(bearer_key(&headers).as_deref(), Some("sk-goog"));

        assert_eq!(bearer_key(&HeaderMap::new()), None);
    }

    #[test]
    fn forwarded_for_wins_over_socket() {
        let addr: SocketAddr = "10.0.0.1:9999".parse().unwrap();
        let headers = headers_with("x-forwarded-for", "203.0.113.9, 10.0.0.2");
        assert_eq!(
            client_ip(&headers, addr),
            "203.0.113.9".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            client_ip(&HeaderMap::new(), addr),
            "10.0.0.1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn gemini_call_splitting() {
        assert_eq!(
            split_gemini_call("gemini-1.5-pro:generateContent"),
            Some(("gemini-1.5-pro".to_string(), false))
        );
        assert_eq!(
            split_gemini_call("gemini-1.5-pro:streamGenerateContent"),
            Some(("gemini-1.5-pro".to_string(), true))
        );
        assert_eq!(split_gemini_call("gemini-1.5-pro:countTokens"), None);
        assert_eq!(split_gemini_call("no-colon"), None);
    }
}
