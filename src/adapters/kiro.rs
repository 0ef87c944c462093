//! Kiro device-flow upstream adapter
//!
//! Kiro accounts carry a credential bundle instead of a plain API key: a
//! short-lived access token, a refresh token and an expiry stamp. The
//! adapter refreshes the bundle in place when the access token is near
//! expiry and signs each request with an HMAC-SHA256 chain over the date
//! and payload hash, alongside the bearer header. The upstream speaks the
//! OpenAI-compatible wire.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Client;
use serde_json::Value;

use crate::canonical::ChunkStream;
use crate::config::GatewayConfig;
use crate::dialects::openai as oai_wire;
use crate::error::{ErrorKind, GatewayError, GatewayResult};
use crate::logger;
use crate::pool::{Account, Credential, CredentialBundle};
use crate::secrets::{hmac_sha256, sha256_hex};

use super::{apply_extra_headers, send_upstream, AdapterImpl, CallContext};

pub struct KiroAdapter;

const SIGNING_PREFIX: &[u8] = b"KIRO4";

fn bundle_of(account: &Account) -> GatewayResult<CredentialBundle> {
    match account.credential() {
        Credential::Bundle(bundle) => Ok(bundle),
        Credential::ApiKey(_) => Err(GatewayError::internal(
            "kiro account without a credential bundle",
        )),
    }
}

/// Signature chain: kDate = HMAC(prefix || refresh_token, date);
/// signature = hex(HMAC(kDate, payload_hash)).
fn sign(bundle: &CredentialBundle, amz_date: &str, payload_hash: &str) -> String {
    let mut signing_key = Vec::with_capacity(SIGNING_PREFIX.len() + bundle.refresh_token.len());
    signing_key.extend_from_slice(SIGNING_PREFIX);
    signing_key.extend_from_slice(bundle.refresh_token.as_bytes());
    let k_date = hmac_sha256(&signing_key, amz_date.as_bytes());
    hex::encode(hmac_sha256(&k_date, payload_hash.as_bytes()))
}

fn build_headers(
    ctx: &CallContext,
    bundle: &CredentialBundle,
    body: &Value,
) -> GatewayResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("application/json"));

    let bearer = HeaderValue::from_str(&format!("Bearer {}", bundle.access_token))
        .map_err(|_| GatewayError::new(ErrorKind::UpstreamAuthFailed, "malformed access token"))?;
    headers.insert("authorization", bearer);

    let amz_date = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    let payload_hash = sha256_hex(body.to_string().as_bytes());
    let signature = sign(bundle, &amz_date, &payload_hash);
    if let Ok(value) = HeaderValue::from_str(&amz_date) {
        headers.insert("x-amz-date", value);
    }
    if let Ok(value) = HeaderValue::from_str(&payload_hash) {
        headers.insert("x-amz-content-sha256", value);
    }
    if let Ok(value) = HeaderValue::from_str(&signature) {
        headers.insert("x-amz-signature", value);
    }

    apply_extra_headers(&mut headers, &ctx.provider);
    Ok(headers)
}

/// Refresh the bundle through the device-flow token endpoint when the
/// access token is near expiry. The new bundle replaces the in-memory
/// credential; the periodic account task persists it.
pub async fn ensure_fresh_bundle(
    http: &Client,
    account: &Account,
    base_url: &str,
) -> GatewayResult<CredentialBundle> {
    let bundle = bundle_of(account)?;
    if !bundle.near_expiry(chrono::Utc::now().timestamp()) {
        return Ok(bundle);
    }

    let refresh_url = bundle
        .refresh_url
        .clone()
        .unwrap_or_else(|| format!("{}/oauth/token", base_url.trim_end_matches('/')));
    logger::info(
        "kiro",
        &format!("refreshing credentials for account {}", account.id),
    );

    let response = http
        .post(&refresh_url)
        .json(&serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": bundle.refresh_token
        }))
        .timeout(Duration::from_secs(30))
        .send()
        .await
        .map_err(|e| super::classify_transport(&e))?;

    if !response.status().is_success() {
        return Err(GatewayError::new(
            ErrorKind::UpstreamAuthFailed,
            format!("credential refresh returned {}", response.status().as_u16()),
        ));
    }

    let body: Value = response
        .json()
        .await
        .map_err(|e| super::classify_transport(&e))?;
    let access_token = body
        .get("access_token")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            GatewayError::new(ErrorKind::UpstreamAuthFailed, "refresh response without token")
        })?;
    let expires_in = body.get("expires_in").and_then(|v| v.as_i64()).unwrap_or(3600);

    let mut fresh = bundle.clone();
    fresh.access_token = access_token.to_string();
    if let Some(rt) = body.get("refresh_token").and_then(|v| v.as_str()) {
        fresh.refresh_token = rt.to_string();
    }
    fresh.expires_at = chrono::Utc::now().timestamp() + expires_in;
    account.set_credential(Credential::Bundle(fresh.clone()));
    Ok(fresh)
}

/// Best-effort poll of the account's tracked usage/limit pair.
pub async fn refresh_usage(http: &Client, account: &Account, base_url: &str) -> GatewayResult<()> {
    let bundle = bundle_of(account)?;
    let url = format!("{}/v1/usage", base_url.trim_end_matches('/'));
    let response = http
        .get(&url)
        .bearer_auth(&bundle.access_token)
        .timeout(Duration::from_secs(15))
        .send()
        .await
        .map_err(|e| super::classify_transport(&e))?;
    if !response.status().is_success() {
        return Err(GatewayError::new(
            ErrorKind::Upstream5xx,
            format!("usage endpoint returned {}", response.status().as_u16()),
        ));
    }
    let body: Value = response
        .json()
        .await
        .map_err(|e| super::classify_transport(&e))?;

    use std::sync::atomic::Ordering;
    if let Some(used) = body.get("used").and_then(|v| v.as_i64()) {
        account.usage.store(used, Ordering::Relaxed);
    }
    if let Some(limit) = body.get("limit").and_then(|v| v.as_i64()) {
        account.usage_limit.store(limit, Ordering::Relaxed);
    }
    Ok(())
}

impl AdapterImpl for KiroAdapter {
    fn name(&self) -> &'static str {
        "kiro"
    }

    async fn execute(
        &self,
        http: &Client,
        ctx: &CallContext,
        cfg: &GatewayConfig,
    ) -> GatewayResult<ChunkStream> {
        let base = ctx.base_url();
        let bundle = ensure_fresh_bundle(http, &ctx.account, &base).await?;

        let body = oai_wire::render_request(&ctx.request, &ctx.request.model, ctx.request.stream);
        let headers = build_headers(ctx, &bundle, &body)?;
        let url = format!("{}/v1/chat/completions", base.trim_end_matches('/'));

        let response = send_upstream(http, &url, headers, &body, cfg, "kiro").await?;

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
            let chunks = super::openai::chunks_from_unary(&body);
            return Ok(Box::pin(futures_util::stream::iter(
                chunks.into_iter().map(Ok),
            )));
        }

        Ok(super::openai::sse_chunk_stream(
            response,
            Duration::from_secs(cfg.between_chunks_timeout_secs.max(1)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle() -> CredentialBundle {
        CredentialBundle {
            access_token: "at".to_string(),
            refresh_token: "rt".to_string(),
            expires_at: 9_999_999_999,
            refresh_url: None,
            region: Some("us-east-1".to_string()),
            profile_arn: None,
        }
    }

    #[test]
    fn signature_is_deterministic_and_input_sensitive() {
        let b = bundle();
        let a = sign(&b, "20260801T000000Z", "abc");
        assert_eq!(a, sign(&b, "20260801T000000Z", "abc"));
        assert_ne!(a, sign(&b, "20260801T000001Z", "abc"));
        assert_ne!(a, sign(&b, "20260801T000000Z", "abd"));
        let mut other = bundle();
        other.refresh_token = "rt2".to_string();
        assert_ne!(a, sign(&other, "20260801T000000Z", "abc"));
    }

    #[test]
    fn api_key_account_is_rejected() {
        let account = Account::new(1, 1, true, Credential::ApiKey("sk".to_string()), 0, 0, -1);
        assert!(bundle_of(&account).is_err());
    }
}
