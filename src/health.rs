//! Account health monitor
//!
//! Owns the authoritative `account_id -> health` map; accounts themselves
//! only carry their id. Status walks healthy -> degraded -> unhealthy ->
//! banned on failures and back down the same ladder through the scheduled
//! sweep once cooldowns lapse and the sliding failure window decays.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::config::GatewayConfig;
use crate::error::Outcome;
use crate::logger;

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Banned,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Banned => "banned",
        }
    }

    /// Risk is derived from status, never stored.
    pub fn risk(&self) -> RiskLevel {
        match self {
            HealthStatus::Healthy => RiskLevel::Low,
            HealthStatus::Degraded => RiskLevel::Medium,
            HealthStatus::Unhealthy => RiskLevel::High,
            HealthStatus::Banned => RiskLevel::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

#[derive(Debug)]
struct AccountHealth {
    status: HealthStatus,
    consecutive_failures: u32,
    rate_limit_errors: u64,
    auth_errors: u64,
    client_errors: u64,
    /// 5xx/timeout instants inside the sliding window.
    failure_window: VecDeque<Instant>,
    /// rate-limited instants inside the sliding window.
    rate_limit_window: VecDeque<Instant>,
    last_error_kind: Option<&'static str>,
    last_transition: Instant,
    cooldown_until: Option<Instant>,
}

impl Default for AccountHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            rate_limit_errors: 0,
            auth_errors: 0,
            client_errors: 0,
            failure_window: VecDeque::new(),
            rate_limit_window: VecDeque::new(),
            last_error_kind: None,
            last_transition: Instant::now(),
            cooldown_until: None,
        }
    }
}

impl AccountHealth {
    fn prune(&mut self) {
        let cutoff = Instant::now() - WINDOW;
        while matches!(self.failure_window.front(), Some(ts) if *ts < cutoff) {
            self.failure_window.pop_front();
        }
        while matches!(self.rate_limit_window.front(), Some(ts) if *ts < cutoff) {
            self.rate_limit_window.pop_front();
        }
    }

    fn cooldown_elapsed(&self) -> bool {
        self.cooldown_until
            .map(|until| Instant::now() >= until)
            .unwrap_or(true)
    }

    fn transition(&mut self, id: i64, next: HealthStatus) {
        if self.status == next {
            return;
        }
        logger::info(
            "health",
            &format!(
                "account {} {} -> {}",
                id,
                self.status.as_str(),
                next.as_str()
            ),
        );
        self.status = next;
        self.last_transition = Instant::now();
    }
}

/// Read-only view used for candidate ranking and stats.
#[derive(Debug, Clone, Copy)]
pub struct HealthView {
    pub status: HealthStatus,
    pub risk: RiskLevel,
    pub consecutive_failures: u32,
    pub cooldown_remaining_secs: u64,
}

pub struct HealthMonitor {
    accounts: RwLock<HashMap<i64, AccountHealth>>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
        }
    }

    /// Record one request outcome and apply the transition rules.
    pub fn record(&self, account_id: i64, outcome: Outcome, cfg: &GatewayConfig) {
        let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
        let health = accounts.entry(account_id).or_default();
        health.prune();

        match outcome {
            Outcome::Success => {
                health.consecutive_failures = 0;
                if health.status == HealthStatus::Degraded
                    && (health.failure_window.len() as u32) < cfg.degrade_after
                    && (health.rate_limit_window.len() as u32) < cfg.rate_limit_degrade_threshold
                {
                    health.transition(account_id, HealthStatus::Healthy);
                    health.cooldown_until = None;
                }
            }
            Outcome::RateLimited => {
                health.rate_limit_errors += 1;
                health.rate_limit_window.push_back(Instant::now());
                health.last_error_kind = Some(outcome.as_str());
                if health.rate_limit_window.len() as u32 >= cfg.rate_limit_degrade_threshold
                    && health.status == HealthStatus::Healthy
                {
                    health.transition(account_id, HealthStatus::Degraded);
                }
                health.cooldown_until =
                    Some(Instant::now() + Duration::from_secs(cfg.rate_limit_cooldown_secs));
            }
            Outcome::AuthFailed => {
                health.auth_errors += 1;
                health.last_error_kind = Some(outcome.as_str());
                health.transition(account_id, HealthStatus::Banned);
                health.cooldown_until =
                    Some(Instant::now() + Duration::from_secs(cfg.auth_ban_secs));
            }
            Outcome::Upstream5xx | Outcome::Timeout => {
                health.consecutive_failures += 1;
                health.failure_window.push_back(Instant::now());
                health.last_error_kind = Some(outcome.as_str());
                if health.consecutive_failures >= cfg.ban_after {
                    health.transition(account_id, HealthStatus::Banned);
                    health.cooldown_until =
                        Some(Instant::now() + Duration::from_secs(cfg.failure_ban_secs));
                } else if health.consecutive_failures >= cfg.unhealthy_after {
                    health.transition(account_id, HealthStatus::Unhealthy);
                } else if health.consecutive_failures >= cfg.degrade_after {
                    health.transition(account_id, HealthStatus::Degraded);
                }
            }
            Outcome::ClientError => {
                health.client_errors += 1;
                health.last_error_kind = Some(outcome.as_str());
            }
        }
    }

    pub fn view(&self, account_id: i64) -> HealthView {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        match accounts.get(&account_id) {
            Some(health) => HealthView {
                status: health.status,
                risk: health.status.risk(),
                consecutive_failures: health.consecutive_failures,
                cooldown_remaining_secs: health
                    .cooldown_until
                    .and_then(|until| until.checked_duration_since(Instant::now()))
                    .map(|d| d.as_secs())
                    .unwrap_or(0),
            },
            None => HealthView {
                status: HealthStatus::Healthy,
                risk: RiskLevel::Low,
                consecutive_failures: 0,
                cooldown_remaining_secs: 0,
            },
        }
    }

    pub fn status_of(&self, account_id: i64) -> HealthStatus {
        self.view(account_id).status
    }

    /// Whether the account may appear in a candidate set right now.
    ///
    /// Banned accounts stay out until their timer elapses; once it has,
    /// they are treated like unhealthy until the sweep walks them back.
    pub fn selectable(&self, account_id: i64, allow_unhealthy: bool) -> bool {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        match accounts.get(&account_id) {
            None => true,
            Some(health) => match health.status {
                HealthStatus::Healthy | HealthStatus::Degraded => true,
                HealthStatus::Unhealthy => allow_unhealthy,
                HealthStatus::Banned => allow_unhealthy && health.cooldown_elapsed(),
            },
        }
    }

    /// Scheduled recovery pass: one ladder step per sweep, and only when
    /// the cooldown has lapsed and the sliding window has gone quiet.
    pub fn sweep(&self, cfg: &GatewayConfig) {
        let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
        for (id, health) in accounts.iter_mut() {
            health.prune();
            if !health.cooldown_elapsed() {
                continue;
            }
            let quiet = health.failure_window.is_empty()
                && (health.rate_limit_window.len() as u32) < cfg.rate_limit_degrade_threshold;
            match health.status {
                HealthStatus::Banned => {
                    health.transition(*id, HealthStatus::Unhealthy);
                    health.cooldown_until = None;
                }
                HealthStatus::Unhealthy if quiet => {
                    health.transition(*id, HealthStatus::Degraded);
                }
                HealthStatus::Degraded if quiet => {
                    health.transition(*id, HealthStatus::Healthy);
                    health.consecutive_failures = 0;
                }
                _ => {}
            }
        }
    }

    /// Administrative override: force a status, optionally with a cooldown.
    pub fn force(&self, account_id: i64, status: HealthStatus, cooldown_secs: Option<u64>) {
        let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
        let health = accounts.entry(account_id).or_default();
        health.transition(account_id, status);
        health.cooldown_until = cooldown_secs.map(|s| Instant::now() + Duration::from_secs(s));
        if status == HealthStatus::Healthy {
            health.consecutive_failures = 0;
            health.failure_window.clear();
            health.rate_limit_window.clear();
            health.cooldown_until = None;
        }
    }
}
