//! Account pool
//!
//! One account is one set of upstream credentials, owned by exactly one
//! provider. The pool keeps accounts in memory with atomic counters and an
//! atomic last-used stamp; selection ranks by health first and breaks ties
//! by strategy. Counter mirrors are persisted to SQLite best-effort.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use rand::Rng;

use crate::error::Outcome;
use crate::health::{HealthMonitor, HealthStatus};

/// Secret material for one account.
#[derive(Debug, Clone)]
pub enum Credential {
    ApiKey(String),
    Bundle(CredentialBundle),
}

/// Opaque credential bundle for device-flow providers.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CredentialBundle {
    pub access_token: String,
    pub refresh_token: String,
    /// Epoch-seconds; refresh when within the renewal window.
    pub expires_at: i64,
    pub refresh_url: Option<String>,
    pub region: Option<String>,
    pub profile_arn: Option<String>,
}

impl CredentialBundle {
    /// Whether the access token needs a refresh before use.
    pub fn near_expiry(&self, now_epoch: i64) -> bool {
        self.expires_at > 0 && now_epoch >= self.expires_at - 120
    }
}

pub struct Account {
    pub id: i64,
    pub provider_id: i64,
    enabled: AtomicBool,
    credential: Mutex<Credential>,
    /// Epoch-milliseconds of the last selection; atomic so concurrent
    /// dispatches racing on LRU prefer distinct accounts.
    pub last_used_at: AtomicI64,
    pub total_requests: AtomicI64,
    pub failed_requests: AtomicI64,
    pub consecutive_failures: AtomicI64,
    pub rate_limit_errors: AtomicI64,
    pub auth_errors: AtomicI64,
    /// Per-account bucket limits, 0 = unlimited.
    pub rpm_limit: u32,
    pub tpm_limit: u32,
    /// Tracked free-quota pair for providers that expose one; -1 = none.
    pub usage: AtomicI64,
    pub usage_limit: AtomicI64,
}

impl Account {
    pub fn new(
        id: i64,
        provider_id: i64,
        enabled: bool,
        credential: Credential,
        rpm_limit: u32,
        tpm_limit: u32,
        usage_limit: i64,
    ) -> Self {
        Self {
            id,
            provider_id,
            enabled: AtomicBool::new(enabled),
            credential: Mutex::new(credential),
            last_used_at: AtomicI64::new(0),
            total_requests: AtomicI64::new(0),
            failed_requests: AtomicI64::new(0),
            consecutive_failures: AtomicI64::new(0),
            rate_limit_errors: AtomicI64::new(0),
            auth_errors: AtomicI64::new(0),
            rpm_limit,
            tpm_limit,
            usage: AtomicI64::new(0),
            usage_limit: AtomicI64::new(usage_limit),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn credential(&self) -> Credential {
        self.credential
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_credential(&self, credential: Credential) {
        *self.credential.lock().unwrap_or_else(|e| e.into_inner()) = credential;
    }

    /// Mirror one request outcome into the account counters. The reset of
    /// `consecutive_failures` on success is an invariant shared with the
    /// health monitor.
    pub fn record_outcome(&self, outcome: Outcome) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        match outcome {
            Outcome::Success => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            Outcome::RateLimited => {
                self.failed_requests.fetch_add(1, Ordering::Relaxed);
                self.rate_limit_errors.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::AuthFailed => {
                self.failed_requests.fetch_add(1, Ordering::Relaxed);
                self.auth_errors.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Upstream5xx | Outcome::Timeout => {
                self.failed_requests.fetch_add(1, Ordering::Relaxed);
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::ClientError => {
                self.failed_requests.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    WeightedRandom,
    LeastRecentlyUsed,
    LeastUsed,
}

impl SelectionStrategy {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "least_recently_used" | "lru" => SelectionStrategy::LeastRecentlyUsed,
            "least_used" => SelectionStrategy::LeastUsed,
            _ => SelectionStrategy::WeightedRandom,
        }
    }
}

pub struct AccountPool {
    by_provider: RwLock<HashMap<i64, Vec<Arc<Account>>>>,
}

impl AccountPool {
    pub fn new(accounts: Vec<Account>) -> Self {
        let mut by_provider: HashMap<i64, Vec<Arc<Account>>> = HashMap::new();
        for account in accounts {
            by_provider
                .entry(account.provider_id)
                .or_default()
                .push(Arc::new(account));
        }
        Self {
            by_provider: RwLock::new(by_provider),
        }
    }

    /// Enabled accounts of a provider.
    pub fn list_for_provider(&self, provider_id: i64) -> Vec<Arc<Account>> {
        self.by_provider
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&provider_id)
            .map(|accounts| accounts.iter().filter(|a| a.enabled()).cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, account_id: i64) -> Option<Arc<Account>> {
        self.by_provider
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .flatten()
            .find(|a| a.id == account_id)
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<Account>> {
        self.by_provider
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    /// Select one account from a candidate list.
    ///
    /// Health ranking is applied first: healthy before degraded; unhealthy
    /// only when nothing better exists and fallback is allowed; banned never
    /// while its cooldown runs. Ties inside the chosen tier break by
    /// strategy, and the last-used stamp is claimed with a compare-and-swap
    /// so concurrent LRU picks diverge.
    pub fn pick(
        &self,
        candidates: &[Arc<Account>],
        strategy: SelectionStrategy,
        health: &HealthMonitor,
        allow_unhealthy: bool,
    ) -> Option<Arc<Account>> {
        let mut healthy = Vec::new();
        let mut degraded = Vec::new();
        let mut unhealthy = Vec::new();
        for account in candidates.iter().filter(|a| a.enabled()) {
            if !health.selectable(account.id, allow_unhealthy) {
                continue;
            }
            match health.status_of(account.id) {
                HealthStatus::Healthy => healthy.push(account.clone()),
                HealthStatus::Degraded => degraded.push(account.clone()),
                _ => unhealthy.push(account.clone()),
            }
        }

        let tier = if !healthy.is_empty() {
            healthy
        } else if !degraded.is_empty() {
            degraded
        } else if allow_unhealthy && !unhealthy.is_empty() {
            unhealthy
        } else {
            return None;
        };

        loop {
            let chosen = match strategy {
                SelectionStrategy::WeightedRandom => {
                    // Weight lives on the owning provider; inside one
                    // provider's candidate list that makes picks uniform.
                    let idx = rand::thread_rng().gen_range(0..tier.len());
                    tier[idx].clone()
                }
                SelectionStrategy::LeastRecentlyUsed => tier
                    .iter()
                    .min_by_key(|a| a.last_used_at.load(Ordering::Acquire))
                    .cloned()?,
                SelectionStrategy::LeastUsed => tier
                    .iter()
                    .min_by_key(|a| a.total_requests.load(Ordering::Acquire))
                    .cloned()?,
            };

            let seen = chosen.last_used_at.load(Ordering::Acquire);
            let now = chrono::Utc::now().timestamp_millis();
            if chosen
                .last_used_at
                .compare_exchange(seen, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(chosen);
            }
            // Lost the race: another dispatch claimed this account. Re-rank.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;

    fn account(id: i64, provider_id: i64) -> Account {
        Account::new(
            id,
            provider_id,
            true,
            Credential::ApiKey(format!("sk-{}", id)),
            0,
            0,
            -1,
        )
    }

    fn pool_of(ids: &[i64]) -> AccountPool {
        AccountPool::new(ids.iter().map(|id| account(*id, 1)).collect())
    }

    #[test]
    fn list_skips_disabled() {
        let pool = pool_of(&[1, 2]);
        pool.get(2).unwrap().set_enabled(false);
        let listed = pool.list_for_provider(1);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, 1);
    }

    #[test]
    fn pick_prefers_healthy_over_degraded() {
        let pool = pool_of(&[1, 2]);
        let health = HealthMonitor::new();
        let mut cfg = GatewayConfig::default();
        cfg.degrade_after = 1;
        health.record(1, Outcome::Upstream5xx, &cfg);
        let candidates = pool.list_for_provider(1);
        for _ in 0..10 {
            let chosen = pool
                .pick(&candidates, SelectionStrategy::WeightedRandom, &health, false)
                .unwrap();
            assert_eq!(chosen.id, 2);
        }
    }

    #[test]
    fn banned_account_never_picked_during_cooldown() {
        let pool = pool_of(&[1]);
        let health = HealthMonitor::new();
        let cfg = GatewayConfig::default();
        health.record(1, Outcome::AuthFailed, &cfg);
        let candidates = pool.list_for_provider(1);
        assert!(pool
            .pick(&candidates, SelectionStrategy::WeightedRandom, &health, true)
            .is_none());
    }

    #[test]
    fn unhealthy_only_with_fallback() {
        let pool = pool_of(&[1]);
        let health = HealthMonitor::new();
        let mut cfg = GatewayConfig::default();
        cfg.degrade_after = 1;
        cfg.unhealthy_after = 2;
        cfg.ban_after = 99;
        health.record(1, Outcome::Upstream5xx, &cfg);
        health.record(1, Outcome::Upstream5xx, &cfg);
        let candidates = pool.list_for_provider(1);
        assert!(pool
            .pick(&candidates, SelectionStrategy::LeastUsed, &health, false)
            .is_none());
        assert!(pool
            .pick(&candidates, SelectionStrategy::LeastUsed, &health, true)
            .is_some());
    }

    #[test]
    fn lru_picks_diverge() {
        let pool = pool_of(&[1, 2]);
        let health = HealthMonitor::new();
        let candidates = pool.list_for_provider(1);
        let first = pool
            .pick(&candidates, SelectionStrategy::LeastRecentlyUsed, &health, false)
            .unwrap();
        let second = pool
            .pick(&candidates, SelectionStrategy::LeastRecentlyUsed, &health, false)
            .unwrap();
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn least_used_follows_counters() {
        let pool = pool_of(&[1, 2]);
        let health = HealthMonitor::new();
        pool.get(1).unwrap().total_requests.store(10, Ordering::Relaxed);
        let candidates = pool.list_for_provider(1);
        let chosen = pool
            .pick(&candidates, SelectionStrategy::LeastUsed, &health, false)
            .unwrap();
        assert_eq!(chosen.id, 2);
    }

    #[test]
    fn outcome_counters_follow_invariant() {
        let acct = account(1, 1);
        acct.record_outcome(Outcome::Upstream5xx);
        acct.record_outcome(Outcome::Upstream5xx);
        assert_eq!(acct.consecutive_failures.load(Ordering::Relaxed), 2);
        acct.record_outcome(Outcome::Success);
        assert_eq!(acct.consecutive_failures.load(Ordering::Relaxed), 0);
        assert_eq!(acct.total_requests.load(Ordering::Relaxed), 3);
        assert_eq!(acct.failed_requests.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn bundle_near_expiry_window() {
        let bundle = CredentialBundle {
            expires_at: 1_000,
            ..Default::default()
        };
        assert!(!bundle.near_expiry(500));
        assert!(bundle.near_expiry(900));
        assert!(bundle.near_expiry(1_001));
    }
}
