//! Rate limiting: token buckets and the layered manager
//!
//! One bucket per (scope, kind) pair, refilled by elapsed monotonic time at
//! `limit / 60` units per second with capacity `limit`. The manager composes
//! three layers in order: global, provider-account, access-token. All three
//! must admit a call; the denying layer decides whether the dispatcher skips
//! the account (account layer) or fails the request (global/token layer).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::GatewayConfig;

/// A single RPM or TPM bucket.
#[derive(Debug)]
pub struct TokenBucket {
    limit: u32,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            state: Mutex::new(BucketState {
                tokens: limit as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    fn rate_per_sec(&self) -> f64 {
        self.limit as f64 / 60.0
    }

    fn refill(&self, state: &mut BucketState) {
        // Instant is monotonic, so elapsed can never be negative.
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            state.tokens =
                (state.tokens + elapsed * self.rate_per_sec()).min(self.limit as f64);
            state.last_refill = Instant::now();
        }
    }

    /// Refill, then take `n` tokens if available.
    pub fn try_consume(&self, n: f64) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut state);
        if state.tokens >= n {
            state.tokens -= n;
            true
        } else {
            false
        }
    }

    pub fn available(&self) -> f64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut state);
        state.tokens
    }

    /// Seconds until `n` tokens will be available, rounded up.
    pub fn time_to_available(&self, n: f64) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut state);
        if state.tokens >= n {
            return 0;
        }
        let missing = n - state.tokens;
        (missing / self.rate_per_sec()).ceil() as u64
    }

    /// Post-hoc adjustment: positive consumes extra, negative refunds.
    /// The level is clamped to `[0, limit]` in both directions.
    pub fn adjust(&self, delta: f64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut state);
        state.tokens = (state.tokens - delta).clamp(0.0, self.limit as f64);
    }
}

/// Which composed layer refused a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitLayer {
    Global,
    Account,
    AccessToken,
}

impl LimitLayer {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitLayer::Global => "global",
            LimitLayer::Account => "account",
            LimitLayer::AccessToken => "access_token",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateDenial {
    pub layer: LimitLayer,
    pub retry_after_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum BucketKey {
    GlobalRpm,
    GlobalTpm,
    AccountRpm(i64),
    AccountTpm(i64),
    TokenRpm(i64),
    TokenTpm(i64),
}

/// Per-account limits as resolved by the caller (0 = unlimited).
#[derive(Debug, Clone, Copy)]
pub struct AccountLimits {
    pub id: i64,
    pub rpm: u32,
    pub tpm: u32,
}

/// Per-access-token limits before user-default fallback (0 = inherit).
#[derive(Debug, Clone, Copy)]
pub struct TokenLimits {
    pub id: i64,
    pub rpm: u32,
    pub tpm: u32,
}

/// Pre-charge receipt. RPM buckets were charged 1 and TPM buckets the
/// prompt estimate; the receipt can refund everything (attempt failed
/// before execution) or reconcile TPM against the actual count.
#[derive(Debug)]
pub struct Precharge {
    rpm: Vec<Arc<TokenBucket>>,
    tpm: Vec<(Arc<TokenBucket>, f64)>,
}

impl Precharge {
    /// Return every charged unit. Used when the attempt never executed.
    pub fn refund(self) {
        for bucket in &self.rpm {
            bucket.adjust(-1.0);
        }
        for (bucket, amount) in &self.tpm {
            bucket.adjust(-*amount);
        }
    }

    /// Settle the TPM buckets against the actual total token count,
    /// charging or refunding the delta. Never drives a bucket negative.
    pub fn reconcile(self, actual_tokens: i64) {
        for (bucket, charged) in &self.tpm {
            let delta = actual_tokens as f64 - charged;
            if delta != 0.0 {
                bucket.adjust(delta);
            }
        }
    }
}

pub struct RateLimitManager {
    buckets: Mutex<HashMap<BucketKey, Arc<TokenBucket>>>,
}

impl Default for RateLimitManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitManager {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the bucket for a key, rebuilding it when its configured limit
    /// changed (hot reload).
    fn bucket(&self, key: BucketKey, limit: u32) -> Arc<TokenBucket> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        match buckets.get(&key) {
            Some(bucket) if bucket.limit() == limit => bucket.clone(),
            _ => {
                let bucket = Arc::new(TokenBucket::new(limit));
                buckets.insert(key, bucket.clone());
                bucket
            }
        }
    }

    /// Run the three layers in order, pre-charging as each admits.
    ///
    /// On denial all charges taken so far are refunded and the denying
    /// layer plus its shortest time-to-token is reported.
    pub fn check(
        &self,
        cfg: &GatewayConfig,
        account: AccountLimits,
        token: TokenLimits,
        estimated_prompt_tokens: i64,
    ) -> Result<Precharge, RateDenial> {
        let estimate = estimated_prompt_tokens.max(0) as f64;
        let mut charge = Precharge {
            rpm: Vec::new(),
            tpm: Vec::new(),
        };

        let token_rpm = if token.rpm > 0 { token.rpm } else { cfg.default_user_rpm };
        let token_tpm = if token.tpm > 0 { token.tpm } else { cfg.default_user_tpm };

        let layers: [(LimitLayer, BucketKey, u32, BucketKey, u32); 3] = [
            (
                LimitLayer::Global,
                BucketKey::GlobalRpm,
                cfg.global_rpm,
                BucketKey::GlobalTpm,
                cfg.global_tpm,
            ),
            (
                LimitLayer::Account,
                BucketKey::AccountRpm(account.id),
                account.rpm,
                BucketKey::AccountTpm(account.id),
                account.tpm,
            ),
            (
                LimitLayer::AccessToken,
                BucketKey::TokenRpm(token.id),
                token_rpm,
                BucketKey::TokenTpm(token.id),
                token_tpm,
            ),
        ];

        for (layer, rpm_key, rpm_limit, tpm_key, tpm_limit) in layers {
            if rpm_limit > 0 {
                let bucket = self.bucket(rpm_key, rpm_limit);
                if !bucket.try_consume(1.0) {
                    let retry = bucket.time_to_available(1.0).max(1);
                    charge.refund();
                    return Err(RateDenial {
                        layer,
                        retry_after_secs: retry,
                    });
                }
                charge.rpm.push(bucket);
            }
            if tpm_limit > 0 && estimate > 0.0 {
                let bucket = self.bucket(tpm_key, tpm_limit);
                if !bucket.try_consume(estimate) {
                    let retry = bucket.time_to_available(estimate).max(1);
                    charge.refund();
                    return Err(RateDenial {
                        layer,
                        retry_after_secs: retry,
                    });
                }
                charge.tpm.push((bucket, estimate));
            }
        }

        Ok(charge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn bucket_consumes_down_to_zero() {
        let bucket = TokenBucket::new(3);
        assert!(bucket.try_consume(1.0));
        assert!(bucket.try_consume(1.0));
        assert!(bucket.try_consume(1.0));
        assert!(!bucket.try_consume(1.0));
    }

    #[test]
    fn bucket_refills_by_elapsed_time() {
        // 600 rpm = 10 tokens per second.
        let bucket = TokenBucket::new(600);
        assert!(bucket.try_consume(600.0));
        assert!(!bucket.try_consume(1.0));
        std::thread::sleep(Duration::from_millis(250));
        let available = bucket.available();
        assert!(available >= 1.5 && available <= 5.0, "got {}", available);
    }

    #[test]
    fn bucket_capacity_is_capped() {
        let bucket = TokenBucket::new(10);
        std::thread::sleep(Duration::from_millis(50));
        assert!(bucket.available() <= 10.0);
    }

    #[test]
    fn time_to_available_rounds_up() {
        let bucket = TokenBucket::new(60); // 1 token per second
        assert!(bucket.try_consume(60.0));
        let wait = bucket.time_to_available(3.0);
        assert!(wait >= 2 && wait <= 4, "got {}", wait);
        assert_eq!(TokenBucket::new(60).time_to_available(1.0), 0);
    }

    #[test]
    fn adjust_refund_never_exceeds_capacity() {
        let bucket = TokenBucket::new(10);
        assert!(bucket.try_consume(4.0));
        bucket.adjust(-100.0);
        assert!(bucket.available() <= 10.0);
    }

    #[test]
    fn adjust_charge_never_goes_negative() {
        let bucket = TokenBucket::new(10);
        bucket.adjust(1000.0);
        assert!(bucket.available() >= 0.0);
        assert!(bucket.try_consume(0.0));
    }

    fn cfg_with(global_rpm: u32, default_rpm: u32) -> GatewayConfig {
        let mut cfg = GatewayConfig::default();
        cfg.global_rpm = global_rpm;
        cfg.global_tpm = 0;
        cfg.default_user_rpm = default_rpm;
        cfg.default_user_tpm = 0;
        cfg
    }

    fn account() -> AccountLimits {
        AccountLimits { id: 1, rpm: 0, tpm: 0 }
    }

    #[test]
    fn token_layer_denial_reports_access_token() {
        let manager = RateLimitManager::new();
        let cfg = cfg_with(0, 2);
        let token = TokenLimits { id: 7, rpm: 0, tpm: 0 };

        assert!(manager.check(&cfg, account(), token, 10).is_ok());
        assert!(manager.check(&cfg, account(), token, 10).is_ok());
        let denial = manager.check(&cfg, account(), token, 10).unwrap_err();
        assert_eq!(denial.layer, LimitLayer::AccessToken);
        assert!(denial.retry_after_secs >= 1);
    }

    #[test]
    fn account_layer_denial_reports_account() {
        let manager = RateLimitManager::new();
        let cfg = cfg_with(0, 0);
        let limited = AccountLimits { id: 3, rpm: 1, tpm: 0 };
        let token = TokenLimits { id: 1, rpm: 0, tpm: 0 };

        assert!(manager.check(&cfg, limited, token, 1).is_ok());
        let denial = manager.check(&cfg, limited, token, 1).unwrap_err();
        assert_eq!(denial.layer, LimitLayer::Account);
    }

    #[test]
    fn denial_refunds_earlier_layers() {
        let manager = RateLimitManager::new();
        let mut cfg = cfg_with(5, 0);
        cfg.default_user_rpm = 0;
        let limited = AccountLimits { id: 4, rpm: 1, tpm: 0 };
        let token = TokenLimits { id: 2, rpm: 0, tpm: 0 };

        assert!(manager.check(&cfg, limited, token, 1).is_ok());
        // Account bucket is now empty; the global charge must be refunded.
        for _ in 0..4 {
            assert!(manager.check(&cfg, limited, token, 1).is_err());
        }
        // All four denials refunded their global pre-charge: a fifth
        // request against a fresh account still fits under global_rpm=5.
        let fresh = AccountLimits { id: 5, rpm: 0, tpm: 0 };
        assert!(manager.check(&cfg, fresh, token, 1).is_ok());
    }

    #[test]
    fn reconcile_settles_tpm_delta() {
        let manager = RateLimitManager::new();
        let mut cfg = cfg_with(0, 0);
        cfg.default_user_tpm = 1000;
        let token = TokenLimits { id: 9, rpm: 0, tpm: 0 };

        let charge = manager.check(&cfg, account(), token, 400).unwrap();
        charge.reconcile(100); // refund 300
        let charge = manager.check(&cfg, account(), token, 800).unwrap();
        charge.refund();
        // After refund, the full (refilled) budget is usable again.
        assert!(manager.check(&cfg, account(), token, 900).is_ok());
    }
}
