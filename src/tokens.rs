//! Access-token store
//!
//! Caller-facing API keys with quota, expiry, whitelists and per-token
//! limits. Authorization runs a fixed check order; quota commits are
//! serialized per token behind its own mutex so concurrent requests can
//! never over-debit. Reads outside the commit may be stale by one in-flight
//! request; the commit is the source of truth.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};

use crate::db::Db;
use crate::error::{ErrorKind, GatewayError, GatewayResult};
use crate::logger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    Active,
    Disabled,
    Exhausted,
    Expired,
}

impl TokenStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenStatus::Active => "active",
            TokenStatus::Disabled => "disabled",
            TokenStatus::Exhausted => "exhausted",
            TokenStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(TokenStatus::Active),
            "disabled" => Some(TokenStatus::Disabled),
            "exhausted" => Some(TokenStatus::Exhausted),
            "expired" => Some(TokenStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    SuperAdmin,
    Admin,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::SuperAdmin => "super_admin",
            Role::Admin => "admin",
            Role::User => "user",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "super_admin" => Role::SuperAdmin,
            "admin" => Role::Admin,
            _ => Role::User,
        }
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub role: Role,
    /// -1 = unlimited.
    pub total_quota: i64,
    pub used_quota: i64,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub id: i64,
    pub user_id: i64,
    pub key_hash: String,
    pub name: String,
    pub status: TokenStatus,
    /// Epoch-seconds.
    pub created_at: i64,
    /// Epoch-seconds, -1 = never.
    pub expires_at: i64,
    /// Quota units, -1 = unlimited.
    pub remaining_quota: i64,
    pub used_quota: i64,
    pub group: String,
    pub cross_group_retry: bool,
    /// Canonical model names, empty = all.
    pub model_whitelist: Vec<String>,
    /// CIDRs or literal addresses, empty = any.
    pub ip_allowlist: Vec<String>,
    /// 0 = inherit user defaults.
    pub rpm_limit: u32,
    pub tpm_limit: u32,
}

/// Result of a successful authorization: stable snapshots of the token and
/// its owning user, taken at request entry.
#[derive(Debug, Clone)]
pub struct AuthGrant {
    pub token: AccessToken,
    pub user: User,
}

/// Match a client address against one allowlist entry (literal or CIDR).
fn entry_matches(entry: &str, ip: IpAddr) -> bool {
    let entry = entry.trim();
    if entry.is_empty() {
        return false;
    }
    if let Some((base, prefix)) = entry.split_once('/') {
        let Ok(prefix) = prefix.parse::<u32>() else {
            return false;
        };
        let Ok(base) = base.trim().parse::<IpAddr>() else {
            return false;
        };
        return match (base, ip) {
            (IpAddr::V4(base), IpAddr::V4(ip)) => {
                if prefix > 32 {
                    return false;
                }
                let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
                (u32::from(base) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(base), IpAddr::V6(ip)) => {
                if prefix > 128 {
                    return false;
                }
                let mask = if prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - prefix)
                };
                (u128::from(base) & mask) == (u128::from(ip) & mask)
            }
            _ => false,
        };
    }
    entry.parse::<IpAddr>().map(|e| e == ip).unwrap_or(false)
}

pub struct AccessTokenStore {
    by_hash: RwLock<HashMap<String, Arc<Mutex<AccessToken>>>>,
    by_id: RwLock<HashMap<i64, String>>,
    users: RwLock<HashMap<i64, Arc<Mutex<User>>>>,
    db: Option<Arc<Db>>,
}

impl AccessTokenStore {
    pub fn new(tokens: Vec<AccessToken>, users: Vec<User>, db: Option<Arc<Db>>) -> Self {
        let mut by_hash = HashMap::new();
        let mut by_id = HashMap::new();
        for token in tokens {
            by_id.insert(token.id, token.key_hash.clone());
            by_hash.insert(token.key_hash.clone(), Arc::new(Mutex::new(token)));
        }
        let users = users
            .into_iter()
            .map(|u| (u.id, Arc::new(Mutex::new(u))))
            .collect();
        Self {
            by_hash: RwLock::new(by_hash),
            by_id: RwLock::new(by_id),
            users: RwLock::new(users),
            db,
        }
    }

    fn token_by_hash(&self, key_hash: &str) -> Option<Arc<Mutex<AccessToken>>> {
        self.by_hash
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key_hash)
            .cloned()
    }

    fn token_by_id(&self, id: i64) -> Option<Arc<Mutex<AccessToken>>> {
        let hash = self
            .by_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()?;
        self.token_by_hash(&hash)
    }

    fn user(&self, id: i64) -> Option<Arc<Mutex<User>>> {
        self.users
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    fn persist_token(&self, token: &AccessToken) {
        if let Some(db) = &self.db {
            if let Err(e) = db.update_token_state(token) {
                logger::error("tokens", &format!("persist token {}: {}", token.id, e));
            }
        }
    }

    fn persist_user(&self, user: &User) {
        if let Some(db) = &self.db {
            if let Err(e) = db.update_user_usage(user.id, user.used_quota) {
                logger::error("tokens", &format!("persist user {}: {}", user.id, e));
            }
        }
    }

    /// Authorization without the model and quota checks. Used by surfaces
    /// that have no model in hand, like the model listing.
    pub fn authorize_basic(&self, key_hash: &str, client_ip: IpAddr) -> GatewayResult<AuthGrant> {
        self.authorize_inner(key_hash, client_ip, None, 0)
    }

    /// Authorize a request. The checks run in a fixed order: lookup,
    /// status, expiry, IP allowlist, model whitelist, quota. Expiry is
    /// compared in epoch-seconds and strictly precedes the quota check.
    pub fn authorize(
        &self,
        key_hash: &str,
        client_ip: IpAddr,
        canonical_model: &str,
        estimated_prompt_tokens: i64,
    ) -> GatewayResult<AuthGrant> {
        self.authorize_inner(
            key_hash,
            client_ip,
            Some(canonical_model),
            estimated_prompt_tokens,
        )
    }

    fn authorize_inner(
        &self,
        key_hash: &str,
        client_ip: IpAddr,
        canonical_model: Option<&str>,
        estimated_prompt_tokens: i64,
    ) -> GatewayResult<AuthGrant> {
        let entry = self
            .token_by_hash(key_hash)
            .ok_or_else(|| GatewayError::new(ErrorKind::InvalidKey, "unknown access token"))?;

        let mut token = entry.lock().unwrap_or_else(|e| e.into_inner());

        match token.status {
            TokenStatus::Active => {}
            TokenStatus::Disabled => {
                return Err(GatewayError::new(
                    ErrorKind::TokenDisabled,
                    "access token is disabled",
                ))
            }
            TokenStatus::Exhausted => {
                return Err(GatewayError::new(
                    ErrorKind::TokenExhausted,
                    "access token quota is exhausted",
                ))
            }
            TokenStatus::Expired => {
                return Err(GatewayError::new(
                    ErrorKind::TokenExpired,
                    "access token has expired",
                ))
            }
        }

        let now = chrono::Utc::now().timestamp();
        if token.expires_at != -1 && now >= token.expires_at {
            token.status = TokenStatus::Expired;
            self.persist_token(&token);
            return Err(GatewayError::new(
                ErrorKind::TokenExpired,
                "access token has expired",
            ));
        }

        if !token.ip_allowlist.is_empty()
            && !token.ip_allowlist.iter().any(|e| entry_matches(e, client_ip))
        {
            return Err(GatewayError::new(
                ErrorKind::IpNotAllowed,
                format!("address {} is not on the token allowlist", client_ip),
            ));
        }

        if let Some(model) = canonical_model {
            if !token.model_whitelist.is_empty()
                && !token.model_whitelist.iter().any(|m| m == model)
            {
                return Err(GatewayError::new(
                    ErrorKind::ModelNotPermitted,
                    format!("model '{}' is not permitted for this token", model),
                ));
            }

            if token.remaining_quota != -1 && token.remaining_quota < estimated_prompt_tokens {
                return Err(GatewayError::new(
                    ErrorKind::QuotaInsufficient,
                    "remaining quota is below the estimated prompt size",
                ));
            }
        }

        let user_entry = self.user(token.user_id).ok_or_else(|| {
            GatewayError::new(ErrorKind::InvalidKey, "access token has no owner")
        })?;
        let user = user_entry.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if !user.enabled {
            return Err(GatewayError::new(
                ErrorKind::TokenDisabled,
                "owning user is disabled",
            ));
        }

        Ok(AuthGrant {
            token: token.clone(),
            user,
        })
    }

    /// Debit the observed usage. Serialized per token by its mutex; the
    /// final used-quota equals the sum of committed deltas regardless of
    /// interleaving. Reconciles the owning user's denormalized counter.
    pub fn commit_usage(
        &self,
        token_id: i64,
        prompt_tokens: i64,
        completion_tokens: i64,
    ) -> GatewayResult<()> {
        let total = (prompt_tokens + completion_tokens).max(0);
        let entry = self
            .token_by_id(token_id)
            .ok_or_else(|| GatewayError::internal("commit for unknown token"))?;

        let mut token = entry.lock().unwrap_or_else(|e| e.into_inner());
        token.used_quota += total;
        if token.remaining_quota != -1 {
            token.remaining_quota = (token.remaining_quota - total).max(0);
            if token.remaining_quota == 0 && token.status == TokenStatus::Active {
                token.status = TokenStatus::Exhausted;
                logger::info("tokens", &format!("token {} exhausted its quota", token.id));
            }
        }
        self.persist_token(&token);
        let user_id = token.user_id;
        drop(token);

        if let Some(user_entry) = self.user(user_id) {
            let mut user = user_entry.lock().unwrap_or_else(|e| e.into_inner());
            user.used_quota += total;
            self.persist_user(&user);
        }

        Ok(())
    }

    /// Token snapshot by id (stats and tests).
    pub fn get(&self, token_id: i64) -> Option<AccessToken> {
        self.token_by_id(token_id)
            .map(|t| t.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    pub fn get_user(&self, user_id: i64) -> Option<User> {
        self.user(user_id)
            .map(|u| u.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn token(key_hash: &str) -> AccessToken {
        AccessToken {
            id: 1,
            user_id: 1,
            key_hash: key_hash.to_string(),
            name: "test".to_string(),
            status: TokenStatus::Active,
            created_at: 0,
            expires_at: -1,
            remaining_quota: -1,
            used_quota: 0,
            group: String::new(),
            cross_group_retry: false,
            model_whitelist: Vec::new(),
            ip_allowlist: Vec::new(),
            rpm_limit: 0,
            tpm_limit: 0,
        }
    }

    fn user() -> User {
        User {
            id: 1,
            email: "owner@example.com".to_string(),
            role: Role::User,
            total_quota: -1,
            used_quota: 0,
            enabled: true,
        }
    }

    fn store(t: AccessToken) -> AccessTokenStore {
        AccessTokenStore::new(vec![t], vec![user()], None)
    }

    #[test]
    fn cidr_and_literal_matching() {
        assert!(entry_matches("10.0.0.0/8", ip("10.1.2.3")));
        assert!(!entry_matches("10.0.0.0/8", ip("11.1.2.3")));
        assert!(entry_matches("192.168.1.7", ip("192.168.1.7")));
        assert!(!entry_matches("192.168.1.7", ip("192.168.1.8")));
        assert!(entry_matches("::1", ip("::1")));
        assert!(entry_matches("2001:db8::/32", ip("2001:db8::42")));
        assert!(!entry_matches("2001:db8::/32", ip("2001:db9::42")));
        assert!(!entry_matches("bogus", ip("10.0.0.1")));
    }

    #[test]
    fn unknown_key_is_invalid() {
        let s = store(token("h1"));
        let err = s.authorize("nope", ip("127.0.0.1"), "m", 1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidKey);
    }

    #[test]
    fn expiry_at_exactly_now_expires() {
        let mut t = token("h1");
        t.expires_at = chrono::Utc::now().timestamp();
        let s = store(t);
        let err = s.authorize("h1", ip("127.0.0.1"), "m", 1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TokenExpired);
        // The status transition sticks.
        assert_eq!(s.get(1).unwrap().status, TokenStatus::Expired);
    }

    #[test]
    fn ip_allowlist_enforced() {
        let mut t = token("h1");
        t.ip_allowlist = vec!["10.0.0.0/24".to_string()];
        let s = store(t);
        assert!(s.authorize("h1", ip("10.0.0.9"), "m", 1).is_ok());
        let err = s.authorize("h1", ip("10.0.1.9"), "m", 1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::IpNotAllowed);
    }

    #[test]
    fn model_whitelist_enforced() {
        let mut t = token("h1");
        t.model_whitelist = vec!["gpt-4o-mini".to_string()];
        let s = store(t);
        assert!(s.authorize("h1", ip("127.0.0.1"), "gpt-4o-mini", 1).is_ok());
        let err = s
            .authorize("h1", ip("127.0.0.1"), "claude-3-opus", 1)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ModelNotPermitted);
    }

    #[test]
    fn quota_boundary_passes_at_exact_estimate() {
        let mut t = token("h1");
        t.remaining_quota = 100;
        let s = store(t);
        // Exactly equal passes; one more fails.
        assert!(s.authorize("h1", ip("127.0.0.1"), "m", 100).is_ok());
        let err = s.authorize("h1", ip("127.0.0.1"), "m", 101).unwrap_err();
        assert_eq!(err.kind, ErrorKind::QuotaInsufficient);
    }

    #[test]
    fn commit_drives_exhaustion() {
        let mut t = token("h1");
        t.remaining_quota = 10;
        let s = store(t);
        s.commit_usage(1, 6, 4).unwrap();
        let after = s.get(1).unwrap();
        assert_eq!(after.remaining_quota, 0);
        assert_eq!(after.used_quota, 10);
        assert_eq!(after.status, TokenStatus::Exhausted);
        let err = s.authorize("h1", ip("127.0.0.1"), "m", 1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TokenExhausted);
    }

    #[test]
    fn concurrent_commits_sum_exactly() {
        let s = Arc::new(store(token("h1")));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let s = s.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    s.commit_usage(1, 2, 3).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(s.get(1).unwrap().used_quota, 8 * 50 * 5);
        assert_eq!(s.get_user(1).unwrap().used_quota, 8 * 50 * 5);
    }

    #[test]
    fn disabled_user_blocks_token() {
        let t = token("h1");
        let mut u = user();
        u.enabled = false;
        let s = AccessTokenStore::new(vec![t], vec![u], None);
        let err = s.authorize("h1", ip("127.0.0.1"), "m", 1).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TokenDisabled);
    }
}
