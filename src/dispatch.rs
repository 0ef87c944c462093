//! Request dispatcher
//!
//! The core state machine: authorize -> parse -> resolve -> attempt loop
//! (select account, rate-gate, execute) -> meter -> log. Retries walk the
//! candidate list emitted by the provider registry until a first chunk
//! reaches the client; after that the request is committed to its account
//! and later failures become mid-stream errors, never retries.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde_json::Value;

use crate::adapters::{adapter_for, CallContext};
use crate::canonical::{CanonicalChunk, CanonicalRequest, CanonicalResponse, Dialect, TokenUsage};
use crate::catalog::{Provider, ProviderRegistry};
use crate::config::{ConfigHandle, GatewayConfig};
use crate::db::Db;
use crate::dialects::{self, StreamEncoder};
use crate::error::{AppResult, ErrorKind, GatewayError, Outcome};
use crate::estimate;
use crate::health::HealthMonitor;
use crate::logger;
use crate::metering::{LogRow, UsageMeter};
use crate::pool::{Account, AccountPool, SelectionStrategy};
use crate::ratelimit::{AccountLimits, LimitLayer, Precharge, RateLimitManager, TokenLimits};
use crate::secrets::SecretStore;
use crate::tokens::{AccessTokenStore, AuthGrant};

/// HTTP status recorded for a client that went away mid-stream.
const STATUS_CLIENT_CLOSED: u16 = 499;

/// Root context owning every named service. Created once at process start
/// and passed by reference into request tasks.
pub struct Gateway {
    pub config: ConfigHandle,
    pub secrets: SecretStore,
    pub db: Arc<Db>,
    pub health: HealthMonitor,
    pub limits: RateLimitManager,
    pub catalog: ProviderRegistry,
    pub pool: AccountPool,
    pub tokens: AccessTokenStore,
    pub meter: Arc<UsageMeter>,
    pub http: reqwest::Client,
}

impl Gateway {
    /// Assemble the root context: seed SQLite from the settings file, load
    /// the registries, and build the shared upstream client.
    pub fn bootstrap(cfg: GatewayConfig, db: Arc<Db>, secrets: SecretStore) -> AppResult<Arc<Self>> {
        db.init()?;
        db.seed_from_config(&cfg, &secrets)?;

        let providers = db.load_providers()?;
        let accounts = db.load_accounts(&secrets)?;
        let tokens = db.load_tokens()?;
        let users = db.load_users()?;
        logger::info(
            "gateway",
            &format!(
                "loaded {} providers, {} accounts, {} tokens, {} users",
                providers.len(),
                accounts.len(),
                tokens.len(),
                users.len()
            ),
        );

        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(cfg.connect_timeout_secs.max(1)))
            .build()
            .map_err(|e| {
                crate::error::AppError::Config(format!("http client build failed: {}", e))
            })?;

        let meter = Arc::new(UsageMeter::new(
            cfg.log_queue_high_water,
            cfg.log_queue_hard_cap,
        ));

        Ok(Arc::new(Self {
            config: ConfigHandle::new(cfg),
            secrets,
            db: db.clone(),
            health: HealthMonitor::new(),
            limits: RateLimitManager::new(),
            catalog: ProviderRegistry::new(providers),
            pool: AccountPool::new(accounts),
            tokens: AccessTokenStore::new(tokens, users, Some(db)),
            meter,
            http,
        }))
    }
}

/// Next (provider, account) pair in registry order with health ranking.
fn next_candidate(
    gw: &Gateway,
    providers: &[Arc<Provider>],
    tried: &HashSet<i64>,
    strategy: SelectionStrategy,
    allow_unhealthy: bool,
) -> Option<(Arc<Provider>, Arc<Account>)> {
    for provider in providers {
        let candidates: Vec<_> = gw
            .pool
            .list_for_provider(provider.id)
            .into_iter()
            .filter(|a| !tried.contains(&a.id))
            .collect();
        if candidates.is_empty() {
            continue;
        }
        if let Some(account) = gw.pool.pick(&candidates, strategy, &gw.health, allow_unhealthy) {
            return Some((provider.clone(), account));
        }
    }
    None
}

fn record_failure(gw: &Gateway, cfg: &GatewayConfig, account: &Account, err: &GatewayError) {
    let outcome = Outcome::from_error(err);
    gw.health.record(account.id, outcome, cfg);
    account.record_outcome(outcome);
    if let Err(e) = gw.db.persist_account_counters(account) {
        logger::warn("dispatch", &format!("counter persist failed: {}", e));
    }
}

fn record_success(gw: &Gateway, cfg: &GatewayConfig, account: &Account) {
    gw.health.record(account.id, Outcome::Success, cfg);
    account.record_outcome(Outcome::Success);
    if let Err(e) = gw.db.persist_account_counters(account) {
        logger::warn("dispatch", &format!("counter persist failed: {}", e));
    }
}

/// Accumulated per-request accounting, shared by the unary path, the
/// streaming path and the cancellation path.
struct RequestLedger {
    gw: Arc<Gateway>,
    cfg: Arc<GatewayConfig>,
    request_id: String,
    model: String,
    token_id: i64,
    user_id: i64,
    provider_id: i64,
    account_id: i64,
    started: Instant,
    estimated_prompt: i64,
    usage: TokenUsage,
    completion_estimate: i64,
    precharge: Option<Precharge>,
    settled: bool,
}

impl RequestLedger {
    fn absorb(&mut self, chunk: &CanonicalChunk) {
        if let Some(usage) = &chunk.usage {
            self.usage.merge(usage);
        }
        if let Some(text) = &chunk.text {
            self.completion_estimate +=
                estimate::estimate_text(text, &self.cfg.token_estimator, &self.model);
        }
    }

    /// Final usage: reported counts where the upstream gave them, the
    /// deterministic estimate where it did not.
    fn final_usage(&self) -> TokenUsage {
        let prompt = if self.usage.prompt_tokens > 0 {
            self.usage.prompt_tokens
        } else {
            self.estimated_prompt
        };
        let completion = if self.usage.completion_tokens > 0 {
            self.usage.completion_tokens
        } else {
            self.completion_estimate
        };
        TokenUsage::new(prompt, completion)
    }

    fn append_row(&self, status: u16, usage: TokenUsage, error_kind: Option<&str>) {
        self.gw.meter.append(LogRow {
            created_at: chrono::Utc::now().timestamp(),
            request_id: self.request_id.clone(),
            user_id: self.user_id,
            token_id: self.token_id,
            provider_id: self.provider_id,
            account_id: self.account_id,
            model: self.model.clone(),
            status,
            duration_ms: self.started.elapsed().as_millis() as i64,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            error_kind: error_kind.map(|s| s.to_string()),
        });
    }

    fn settle(&mut self, status: u16, error_kind: Option<&str>) {
        if self.settled {
            return;
        }
        self.settled = true;
        let usage = self.final_usage();
        if let Some(precharge) = self.precharge.take() {
            precharge.reconcile(usage.total());
        }
        if let Err(e) = self
            .gw
            .tokens
            .commit_usage(self.token_id, usage.prompt_tokens, usage.completion_tokens)
        {
            logger::error("dispatch", &format!("usage commit failed: {}", e));
        }
        self.append_row(status, usage, error_kind);
    }
}

impl Drop for RequestLedger {
    // Client disconnects drop the body stream before completion; the
    // partial counts observed so far are still committed.
    fn drop(&mut self) {
        if !self.settled {
            logger::info(
                "dispatch",
                &format!("request {} cancelled by client", self.request_id),
            );
            self.settle(STATUS_CLIENT_CLOSED, Some(ErrorKind::ClientCancelled.code()));
        }
    }
}

/// Outcome of the attempt loop: a committed upstream stream plus its
/// already-delivered first chunk.
struct Committed {
    account: Arc<Account>,
    stream: crate::canonical::ChunkStream,
    first_chunk: CanonicalChunk,
}

enum AttemptError {
    Terminal(GatewayError, Option<u64>),
    Exhausted(GatewayError),
}

/// Run the attempt loop until an upstream yields its first chunk.
async fn acquire_stream(
    gw: &Arc<Gateway>,
    cfg: &Arc<GatewayConfig>,
    request: &CanonicalRequest,
    grant: &AuthGrant,
    estimated_prompt: i64,
    ledger: &mut RequestLedger,
) -> Result<Committed, AttemptError> {
    let providers =
        gw.catalog
            .resolve_for_token(&request.model, &grant.token.group, grant.token.cross_group_retry);
    if providers.is_empty() {
        return Err(AttemptError::Terminal(
            GatewayError::new(
                ErrorKind::NoProviderAvailable,
                format!("no enabled provider serves '{}'", request.model),
            ),
            None,
        ));
    }

    let strategy = SelectionStrategy::parse(&cfg.account_strategy);
    let mut tried: HashSet<i64> = HashSet::new();
    let mut last_err =
        GatewayError::new(ErrorKind::NoProviderAvailable, "no selectable account");
    let mut attempts = 0u32;

    while attempts < cfg.max_attempts.max(1) {
        let Some((provider, account)) =
            next_candidate(gw, &providers, &tried, strategy, cfg.allow_unhealthy_fallback)
        else {
            break;
        };
        attempts += 1;
        tried.insert(account.id);

        let precharge = match gw.limits.check(
            cfg,
            AccountLimits {
                id: account.id,
                rpm: account.rpm_limit,
                tpm: account.tpm_limit,
            },
            TokenLimits {
                id: grant.token.id,
                rpm: grant.token.rpm_limit,
                tpm: grant.token.tpm_limit,
            },
            estimated_prompt,
        ) {
            Ok(precharge) => precharge,
            Err(denial) if denial.layer == LimitLayer::Account => {
                // Account-layer refusal: skip the account, not a health
                // failure.
                logger::debug(
                    "dispatch",
                    &format!("account {} rate-gated, skipping", account.id),
                );
                last_err = GatewayError::new(
                    ErrorKind::RateLimited,
                    "all candidate accounts are rate limited",
                );
                continue;
            }
            Err(denial) => {
                return Err(AttemptError::Terminal(
                    GatewayError::new(
                        ErrorKind::RateLimited,
                        format!("{} rate limit exceeded", denial.layer.as_str()),
                    ),
                    Some(denial.retry_after_secs),
                ));
            }
        };

        let adapter = adapter_for(provider.kind);
        let ctx = CallContext {
            provider: provider.clone(),
            account: account.clone(),
            request: request.clone(),
        };

        let attempt = async {
            let mut stream = adapter.execute(&gw.http, &ctx, cfg).await?;
            match stream.next().await {
                Some(Ok(chunk)) => Ok((stream, chunk)),
                Some(Err(e)) => Err(e),
                None => Ok((
                    stream,
                    CanonicalChunk::done_with(None, None),
                )),
            }
        };

        match attempt.await {
            Ok((stream, first_chunk)) => {
                ledger.provider_id = provider.id;
                ledger.account_id = account.id;
                ledger.precharge = Some(precharge);
                return Ok(Committed {
                    account,
                    stream,
                    first_chunk,
                });
            }
            Err(err) => {
                precharge.refund();
                record_failure(gw, cfg, &account, &err);
                logger::warn(
                    "dispatch",
                    &format!(
                        "attempt {} on account {} failed: {}",
                        attempts, account.id, err
                    ),
                );
                let retryable = err.kind.retryable();
                last_err = err;
                if !retryable {
                    return Err(AttemptError::Terminal(last_err, None));
                }
            }
        }
    }

    Err(AttemptError::Exhausted(last_err))
}

/// Handle one inbound request end to end and produce the HTTP response.
#[allow(clippy::too_many_arguments)]
pub async fn handle(
    gw: Arc<Gateway>,
    dialect: Dialect,
    raw: Value,
    auth_key: Option<String>,
    client_ip: IpAddr,
    path_model: Option<String>,
    force_stream: bool,
) -> Response {
    let cfg = gw.config.snapshot();
    let request_id = uuid::Uuid::new_v4().simple().to_string();
    let started = Instant::now();

    let Some(key) = auth_key else {
        return dialects::error_response(
            dialect,
            ErrorKind::InvalidKey,
            "missing access token",
            None,
        );
    };

    // Parse before authorize: the authorization contract consumes the
    // canonical model and the prompt estimate, both outputs of the parse.
    let request = match dialects::parse_request(
        dialect,
        &raw,
        path_model.as_deref(),
        force_stream,
    ) {
        Ok(mut request) => {
            request.stream = request.stream || force_stream;
            request
        }
        Err(err) => {
            logger::warn("dispatch", &format!("parse failed: {}", err));
            return dialects::error_response(dialect, err.kind, &err.message, None);
        }
    };

    let estimated_prompt = estimate::estimate_request(&request, &cfg.token_estimator);

    let key_hash = gw.secrets.key_hash(key.trim());
    let grant = match gw
        .tokens
        .authorize(&key_hash, client_ip, &request.model, estimated_prompt)
    {
        Ok(grant) => grant,
        Err(err) => {
            logger::warn("dispatch", &format!("authorize failed: {}", err));
            gw.meter.append(LogRow {
                created_at: chrono::Utc::now().timestamp(),
                request_id: request_id.clone(),
                user_id: 0,
                token_id: 0,
                provider_id: 0,
                account_id: 0,
                model: request.model.clone(),
                status: err.kind.status().as_u16(),
                duration_ms: started.elapsed().as_millis() as i64,
                prompt_tokens: 0,
                completion_tokens: 0,
                error_kind: Some(err.kind.code().to_string()),
            });
            return dialects::error_response(dialect, err.kind, &err.message, None);
        }
    };

    let mut ledger = RequestLedger {
        gw: gw.clone(),
        cfg: cfg.clone(),
        request_id: request_id.clone(),
        model: request.model.clone(),
        token_id: grant.token.id,
        user_id: grant.user.id,
        provider_id: 0,
        account_id: 0,
        started,
        estimated_prompt,
        usage: TokenUsage::default(),
        completion_estimate: 0,
        precharge: None,
        settled: false,
    };

    let committed = match acquire_stream(&gw, &cfg, &request, &grant, estimated_prompt, &mut ledger)
        .await
    {
        Ok(committed) => committed,
        Err(AttemptError::Terminal(err, retry_after)) => {
            ledger.settled = true; // nothing executed, nothing to commit
            ledger.append_row(err.kind.status().as_u16(), TokenUsage::default(), Some(err.kind.code()));
            return dialects::error_response(dialect, err.kind, &err.message, retry_after);
        }
        Err(AttemptError::Exhausted(err)) => {
            // Retryable kinds exhausted the loop: surface them as 502 per
            // the upstream taxonomy; account-layer rate starvation keeps
            // its 429, never-selectable pools keep their 503.
            ledger.settled = true;
            ledger.append_row(
                err.kind.status().as_u16(),
                TokenUsage::default(),
                Some(err.kind.code()),
            );
            return dialects::error_response(dialect, err.kind, &err.message, Some(1));
        }
    };

    if request.stream {
        stream_response(gw, cfg, dialect, request, committed, ledger, request_id)
    } else {
        unary_response(gw, cfg, dialect, request, committed, ledger, request_id).await
    }
}

/// Drain the upstream and answer with the dialect's unary body.
async fn unary_response(
    gw: Arc<Gateway>,
    cfg: Arc<GatewayConfig>,
    dialect: Dialect,
    request: CanonicalRequest,
    committed: Committed,
    mut ledger: RequestLedger,
    request_id: String,
) -> Response {
    let Committed {
        account,
        mut stream,
        first_chunk,
    } = committed;

    let mut chunks = vec![first_chunk.clone()];
    ledger.absorb(&first_chunk);
    let mut failure: Option<GatewayError> = None;

    if !first_chunk.done {
        loop {
            match stream.next().await {
                Some(Ok(chunk)) => {
                    ledger.absorb(&chunk);
                    let done = chunk.done;
                    chunks.push(chunk);
                    if done {
                        break;
                    }
                }
                Some(Err(err)) => {
                    failure = Some(err);
                    break;
                }
                None => break,
            }
        }
    }

    if let Some(err) = failure {
        // Nothing was delivered to the client; the attempt failed whole.
        record_failure(&gw, &cfg, &account, &err);
        ledger.settle(err.kind.status().as_u16(), Some(err.kind.code()));
        return dialects::error_response(dialect, err.kind, &err.message, None);
    }

    record_success(&gw, &cfg, &account);
    let usage = ledger.final_usage();
    ledger.usage = usage;
    ledger.settle(200, None);

    let mut response =
        CanonicalResponse::from_chunks(request_id, request.model.clone(), &chunks);
    response.usage = usage;
    axum::Json(dialects::render_unary(dialect, &response)).into_response()
}

/// Stream translated chunks to the client, settling the ledger on
/// completion, mid-stream failure, or client disconnect (drop).
fn stream_response(
    gw: Arc<Gateway>,
    cfg: Arc<GatewayConfig>,
    dialect: Dialect,
    request: CanonicalRequest,
    committed: Committed,
    mut ledger: RequestLedger,
    request_id: String,
) -> Response {
    let Committed {
        account,
        mut stream,
        first_chunk,
    } = committed;

    let mut encoder = StreamEncoder::new(dialect, &request_id, &request.model);
    let content_type = encoder.content_type();

    let body_stream = async_stream::stream! {
        let mut upstream_failed = false;

        ledger.absorb(&first_chunk);
        for frame in encoder.encode_chunk(&first_chunk) {
            yield Ok::<_, std::io::Error>(frame);
        }
        let mut finished = first_chunk.done;

        while !finished {
            match stream.next().await {
                Some(Ok(chunk)) => {
                    ledger.absorb(&chunk);
                    finished = chunk.done;
                    for frame in encoder.encode_chunk(&chunk) {
                        yield Ok(frame);
                    }
                }
                Some(Err(err)) => {
                    // Mid-stream failure after commit: no retry, close with
                    // the dialect's error envelope and keep partial usage.
                    upstream_failed = true;
                    record_failure(&gw, &cfg, &account, &err);
                    for frame in encoder.encode_error(err.kind, &err.message) {
                        yield Ok(frame);
                    }
                    ledger.settle(err.kind.status().as_u16(), Some(err.kind.code()));
                    break;
                }
                None => break,
            }
        }

        if !upstream_failed {
            for frame in encoder.finish() {
                yield Ok(frame);
            }
            record_success(&gw, &cfg, &account);
            ledger.settle(200, None);
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", content_type)
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|e| {
            logger::error("dispatch", &format!("stream response build failed: {}", e));
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccountSeed, GatewayConfig, ProviderSeed, TokenSeed, UserSeed};

    fn test_gateway(mut cfg: GatewayConfig) -> Arc<Gateway> {
        cfg.users.push(UserSeed {
            id: 1,
            email: "o@example.com".to_string(),
            role: "user".to_string(),
            total_quota: -1,
            enabled: true,
        });
        cfg.providers.push(ProviderSeed {
            id: 1,
            name: "p1".to_string(),
            kind: "openai".to_string(),
            enabled: true,
            priority: 10,
            weight: 1,
            group: "default".to_string(),
            models: vec!["gpt-4o-mini".to_string()],
            base_url: Some("http://127.0.0.1:1".to_string()),
            extra_headers: Vec::new(),
        });
        cfg.accounts.push(AccountSeed {
            id: 1,
            provider_id: 1,
            enabled: true,
            api_key: Some("sk-a1".to_string()),
            credential_bundle: None,
            rpm_limit: 0,
            tpm_limit: 0,
            usage_limit: -1,
        });
        cfg.accounts.push(AccountSeed {
            id: 2,
            provider_id: 1,
            enabled: true,
            api_key: Some("sk-a2".to_string()),
            credential_bundle: None,
            rpm_limit: 0,
            tpm_limit: 0,
            usage_limit: -1,
        });
        cfg.access_tokens.push(TokenSeed {
            id: 1,
            user_id: 1,
            key: "sk-caller".to_string(),
            name: "t".to_string(),
            group: "default".to_string(),
            cross_group_retry: false,
            expires_at: -1,
            quota: -1,
            models: vec![],
            allowed_ips: vec![],
            rpm_limit: 0,
            tpm_limit: 0,
        });

        let db = Arc::new(Db::open_in_memory().unwrap());
        Gateway::bootstrap(cfg, db, SecretStore::from_bytes([5u8; 32])).unwrap()
    }

    #[test]
    fn candidate_iteration_skips_tried_accounts() {
        let gw = test_gateway(GatewayConfig::default());
        let providers = gw.catalog.resolve_for_token("gpt-4o-mini", "default", false);
        assert_eq!(providers.len(), 1);

        let mut tried = HashSet::new();
        let (_, first) = next_candidate(
            &gw,
            &providers,
            &tried,
            SelectionStrategy::LeastUsed,
            false,
        )
        .unwrap();
        tried.insert(first.id);
        let (_, second) = next_candidate(
            &gw,
            &providers,
            &tried,
            SelectionStrategy::LeastUsed,
            false,
        )
        .unwrap();
        assert_ne!(first.id, second.id);
        tried.insert(second.id);
        assert!(next_candidate(
            &gw,
            &providers,
            &tried,
            SelectionStrategy::LeastUsed,
            false
        )
        .is_none());
    }

    #[test]
    fn ledger_prefers_reported_usage_over_estimates() {
        let gw = test_gateway(GatewayConfig::default());
        let cfg = gw.config.snapshot();
        let mut ledger = RequestLedger {
            gw: gw.clone(),
            cfg: cfg.clone(),
            request_id: "r".to_string(),
            model: "gpt-4o-mini".to_string(),
            token_id: 1,
            user_id: 1,
            provider_id: 1,
            account_id: 1,
            started: Instant::now(),
            estimated_prompt: 40,
            usage: TokenUsage::default(),
            completion_estimate: 0,
            precharge: None,
            settled: false,
        };

        ledger.absorb(&CanonicalChunk::text("hello world, a few tokens"));
        assert!(ledger.completion_estimate > 0);
        // No reported counts yet: estimates win.
        let usage = ledger.final_usage();
        assert_eq!(usage.prompt_tokens, 40);
        assert_eq!(usage.completion_tokens, ledger.completion_estimate);

        // Reported counts arrive: they win.
        ledger.absorb(&CanonicalChunk::done_with(
            Some(TokenUsage::new(37, 12)),
            None,
        ));
        let usage = ledger.final_usage();
        assert_eq!(usage, TokenUsage::new(37, 12));
        ledger.settled = true;
    }

    #[test]
    fn ledger_drop_commits_partial_usage_as_cancelled() {
        let gw = test_gateway(GatewayConfig::default());
        let cfg = gw.config.snapshot();
        {
            let mut ledger = RequestLedger {
                gw: gw.clone(),
                cfg,
                request_id: "r".to_string(),
                model: "gpt-4o-mini".to_string(),
                token_id: 1,
                user_id: 1,
                provider_id: 1,
                account_id: 1,
                started: Instant::now(),
                estimated_prompt: 10,
                usage: TokenUsage::default(),
                completion_estimate: 0,
                precharge: None,
                settled: false,
            };
            ledger.absorb(&CanonicalChunk::text("partial output before disconnect"));
            // Dropped without settle(): the cancellation path runs.
        }
        let token = gw.tokens.get(1).unwrap();
        assert!(token.used_quota > 0);
        gw.meter.flush_to(&gw.db);
        assert_eq!(gw.db.log_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_key_is_invalid_key() {
        let gw = test_gateway(GatewayConfig::default());
        let response = handle(
            gw,
            Dialect::OpenAi,
            serde_json::json!({"model": "gpt-4o-mini", "messages": [{"role": "user", "content": "hi"}]}),
            None,
            "127.0.0.1".parse().unwrap(),
            None,
            false,
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn whitelist_violation_touches_no_account() {
        let mut cfg = GatewayConfig::default();
        cfg.access_tokens.push(TokenSeed {
            id: 9,
            user_id: 1,
            key: "sk-limited".to_string(),
            models: vec!["gpt-4o-mini".to_string()],
            quota: -1,
            expires_at: -1,
            ..Default::default()
        });
        let gw = test_gateway(cfg);
        let response = handle(
            gw.clone(),
            Dialect::OpenAi,
            serde_json::json!({"model": "claude-3-opus", "messages": [{"role": "user", "content": "hi"}]}),
            Some("sk-limited".to_string()),
            "127.0.0.1".parse().unwrap(),
            None,
            false,
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        // No account was selected or charged.
        for account in gw.pool.all() {
            assert_eq!(
                account
                    .total_requests
                    .load(std::sync::atomic::Ordering::Relaxed),
                0
            );
        }
        // The log row carries zero tokens.
        gw.meter.flush_to(&gw.db);
        assert_eq!(gw.db.log_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn unreachable_upstream_exhausts_and_returns_502() {
        let mut cfg = GatewayConfig::default();
        cfg.max_attempts = 2;
        cfg.connect_timeout_secs = 1;
        cfg.first_byte_timeout_secs = 1;
        let gw = test_gateway(cfg);
        let response = handle(
            gw.clone(),
            Dialect::OpenAi,
            serde_json::json!({"model": "gpt-4o-mini", "messages": [{"role": "user", "content": "hi"}]}),
            Some("sk-caller".to_string()),
            "127.0.0.1".parse().unwrap(),
            None,
            false,
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        // Both accounts were tried and recorded a failure.
        let total_failures: i64 = gw
            .pool
            .all()
            .iter()
            .map(|a| a.failed_requests.load(std::sync::atomic::Ordering::Relaxed))
            .sum();
        assert_eq!(total_failures, 2);
    }
}
