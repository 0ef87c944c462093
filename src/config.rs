//! Gateway configuration
//!
//! Settings are loaded from a TOML file at startup and exposed through a
//! copy-on-write handle: request tasks take an `Arc` snapshot at entry and
//! use it for the whole request, so a hot reload never changes behavior
//! mid-request.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::{fs, path::Path};

use crate::error::{AppError, AppResult};

#[derive(serde::Serialize, serde::Deserialize, Clone)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listen address for the HTTP edge.
    pub listen_addr: String,
    /// Optional explicit SQLite path; empty uses the platform data dir.
    pub db_path: Option<String>,

    /// Dispatcher retry cap across accounts.
    pub max_attempts: u32,
    /// Account selection strategy: "weighted_random", "least_recently_used",
    /// or "least_used".
    pub account_strategy: String,

    /// Global bucket limits, 0 = disabled.
    pub global_rpm: u32,
    pub global_tpm: u32,
    /// Fallback limits for access tokens whose own limits are 0.
    pub default_user_rpm: u32,
    pub default_user_tpm: u32,

    /// Consecutive-failure thresholds.
    pub degrade_after: u32,
    pub unhealthy_after: u32,
    pub ban_after: u32,
    /// Rate-limit errors per minute that degrade an account.
    pub rate_limit_degrade_threshold: u32,
    pub rate_limit_cooldown_secs: u64,
    pub auth_ban_secs: u64,
    pub failure_ban_secs: u64,
    /// Health-sweep cadence.
    pub health_sweep_secs: u64,
    /// Consider unhealthy accounts when nothing better remains.
    pub allow_unhealthy_fallback: bool,

    /// Network timeouts, all distinct.
    pub connect_timeout_secs: u64,
    pub first_byte_timeout_secs: u64,
    pub between_chunks_timeout_secs: u64,

    /// Log sink queue tuning.
    pub log_flush_interval_ms: u64,
    pub log_queue_high_water: usize,
    pub log_queue_hard_cap: usize,

    /// Best-effort usage/limit refresh cadence for device-flow accounts.
    pub usage_refresh_secs: u64,

    pub token_estimator: EstimatorConfig,

    /// Seed tables, upserted into SQLite at boot.
    pub users: Vec<UserSeed>,
    pub providers: Vec<ProviderSeed>,
    pub accounts: Vec<AccountSeed>,
    pub access_tokens: Vec<TokenSeed>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8787".to_string(),
            db_path: None,
            max_attempts: 3,
            account_strategy: "weighted_random".to_string(),
            global_rpm: 0,
            global_tpm: 0,
            default_user_rpm: 60,
            default_user_tpm: 100_000,
            degrade_after: 3,
            unhealthy_after: 6,
            ban_after: 10,
            rate_limit_degrade_threshold: 5,
            rate_limit_cooldown_secs: 60,
            auth_ban_secs: 1800,
            failure_ban_secs: 600,
            health_sweep_secs: 30,
            allow_unhealthy_fallback: false,
            connect_timeout_secs: 10,
            first_byte_timeout_secs: 30,
            between_chunks_timeout_secs: 60,
            log_flush_interval_ms: 1000,
            log_queue_high_water: 256,
            log_queue_hard_cap: 4096,
            usage_refresh_secs: 300,
            token_estimator: EstimatorConfig::default(),
            users: Vec::new(),
            providers: Vec::new(),
            accounts: Vec::new(),
            access_tokens: Vec::new(),
        }
    }
}

/// Per-character-class weights for the deterministic token estimator.
///
/// The table is snapshot-captured per request so authorize-time and
/// commit-time estimates agree.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct EstimatorConfig {
    pub ascii_word: f64,
    pub digit: f64,
    pub whitespace: f64,
    pub punctuation: f64,
    pub cjk: f64,
    pub other: f64,
    /// Multipliers applied by canonical-model-name prefix.
    pub model_calibration: Vec<ModelCalibration>,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            ascii_word: 0.25,
            digit: 0.45,
            whitespace: 0.08,
            punctuation: 0.3,
            cjk: 0.62,
            other: 0.4,
            model_calibration: Vec::new(),
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct ModelCalibration {
    pub model_prefix: String,
    pub multiplier: f64,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct UserSeed {
    pub id: i64,
    pub email: String,
    /// "super_admin", "admin" or "user".
    pub role: String,
    /// -1 = unlimited.
    pub total_quota: i64,
    pub enabled: bool,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct ProviderSeed {
    pub id: i64,
    pub name: String,
    /// Provider type: openai / anthropic / google / kiro / glm.
    pub kind: String,
    pub enabled: bool,
    pub priority: i32,
    pub weight: u32,
    pub group: String,
    pub models: Vec<String>,
    pub base_url: Option<String>,
    /// Extra headers merged into every upstream request for this provider.
    pub extra_headers: Vec<HeaderOverride>,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct HeaderOverride {
    pub name: String,
    pub value: String,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct AccountSeed {
    pub id: i64,
    pub provider_id: i64,
    pub enabled: bool,
    /// Plain API key; stored as-is (the upstream needs it back).
    pub api_key: Option<String>,
    /// Device-flow credential bundle as JSON; encrypted at rest on insert.
    pub credential_bundle: Option<String>,
    /// Per-account limits, 0 = unlimited.
    pub rpm_limit: u32,
    pub tpm_limit: u32,
    /// Tracked free quota, -1 = provider exposes none.
    pub usage_limit: i64,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct TokenSeed {
    pub id: i64,
    pub user_id: i64,
    /// Plaintext key (`sk-...`); only the salted hash is persisted.
    pub key: String,
    pub name: String,
    pub group: String,
    pub cross_group_retry: bool,
    /// Epoch-seconds, -1 = never expires.
    pub expires_at: i64,
    /// Quota units, -1 = unlimited.
    pub quota: i64,
    /// Canonical model whitelist, empty = all.
    pub models: Vec<String>,
    /// CIDRs or literal addresses, empty = any.
    pub allowed_ips: Vec<String>,
    /// 0 = inherit user defaults.
    pub rpm_limit: u32,
    pub tpm_limit: u32,
}

fn default_path() -> PathBuf {
    let mut p = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("llm-gateway");
    fs::create_dir_all(&p).ok();
    p.push("gateway.toml");
    p
}

pub fn load(path: Option<&Path>) -> AppResult<GatewayConfig> {
    let p = path.map(Path::to_path_buf).unwrap_or_else(default_path);
    if !p.exists() {
        return Ok(GatewayConfig::default());
    }
    let raw = fs::read_to_string(&p)?;
    toml::from_str(&raw).map_err(|e| AppError::Config(format!("{}: {}", p.display(), e)))
}

pub fn save(cfg: &GatewayConfig, path: Option<&Path>) -> AppResult<()> {
    let p = path.map(Path::to_path_buf).unwrap_or_else(default_path);
    if let Some(parent) = p.parent() {
        fs::create_dir_all(parent)?;
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| AppError::Config(format!("serialize settings: {}", e)))?;
    fs::write(&p, raw)?;
    Ok(())
}

/// Copy-on-write handle; `snapshot` is cheap and readers never block a
/// reload for longer than the pointer swap.
pub struct ConfigHandle {
    inner: RwLock<Arc<GatewayConfig>>,
}

impl ConfigHandle {
    pub fn new(cfg: GatewayConfig) -> Self {
        Self {
            inner: RwLock::new(Arc::new(cfg)),
        }
    }

    pub fn snapshot(&self) -> Arc<GatewayConfig> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn replace(&self, cfg: GatewayConfig) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(cfg);
    }

    /// Re-read the settings file and publish the new snapshot.
    pub fn reload(&self, path: Option<&Path>) -> AppResult<()> {
        let cfg = load(path)?;
        self.replace(cfg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.max_attempts, 3);
        assert!(cfg.degrade_after < cfg.unhealthy_after);
        assert!(cfg.unhealthy_after < cfg.ban_after);
        assert!(cfg.global_rpm == 0 && cfg.global_tpm == 0);
    }

    #[test]
    fn snapshot_is_stable_across_replace() {
        let handle = ConfigHandle::new(GatewayConfig::default());
        let before = handle.snapshot();
        let mut next = GatewayConfig::default();
        next.max_attempts = 9;
        handle.replace(next);
        assert_eq!(before.max_attempts, 3);
        assert_eq!(handle.snapshot().max_attempts, 9);
    }

    #[test]
    fn parses_seed_tables() {
        let raw = r#"
            max_attempts = 5

            [[providers]]
            id = 1
            name = "main-openai"
            kind = "openai"
            enabled = true
            priority = 10
            weight = 3
            models = ["gpt-4o-mini"]

            [[accounts]]
            id = 1
            provider_id = 1
            enabled = true
            api_key = "sk-upstream"
            usage_limit = -1

            [[access_tokens]]
            id = 1
            user_id = 1
            key = "sk-caller"
            quota = -1
            expires_at = -1
        "#;
        let cfg: GatewayConfig = toml::from_str(raw).unwrap();
        assert_eq!(cfg.max_attempts, 5);
        assert_eq!(cfg.providers.len(), 1);
        assert_eq!(cfg.providers[0].models, vec!["gpt-4o-mini"]);
        assert_eq!(cfg.accounts[0].api_key.as_deref(), Some("sk-upstream"));
        assert_eq!(cfg.access_tokens[0].expires_at, -1);
    }
}
