//! SQLite persistence
//!
//! One table per entity plus the append-only request log. The connection is
//! held behind a mutex: writes are short, and the single writer doubles as
//! the serialization point for counter mirrors. Registries load once at
//! boot and own the hot state; the database is the durable copy.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection};

use crate::catalog::{Provider, ProviderKind};
use crate::config::GatewayConfig;
use crate::error::{AppError, AppResult};
use crate::metering::LogRow;
use crate::pool::{Account, Credential, CredentialBundle};
use crate::secrets::SecretStore;
use crate::tokens::{AccessToken, Role, TokenStatus, User};

pub struct Db {
    conn: Mutex<Connection>,
}

fn default_db_path() -> PathBuf {
    let mut p = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("llm-gateway");
    std::fs::create_dir_all(&p).ok();
    p.push("gateway.db");
    p
}

fn optimize(conn: &Connection) {
    conn.pragma_update(None, "journal_mode", "WAL").ok();
    conn.pragma_update(None, "synchronous", "NORMAL").ok();
    conn.pragma_update(None, "cache_size", "-16000").ok();
    conn.pragma_update(None, "temp_store", "MEMORY").ok();
}

impl Db {
    pub fn open(path: Option<&Path>) -> AppResult<Self> {
        let p = path.map(Path::to_path_buf).unwrap_or_else(default_db_path);
        let conn = Connection::open(p)?;
        optimize(&conn);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> AppResult<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn init(&self) -> AppResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(
            "create table if not exists users (
                id integer primary key,
                email text not null,
                role text not null default 'user',
                total_quota integer not null default -1,
                used_quota integer not null default 0,
                enabled integer not null default 1
            );
            create table if not exists access_tokens (
                id integer primary key,
                user_id integer not null,
                key_hash text not null unique,
                name text not null default '',
                status text not null default 'active',
                created_at integer not null default 0,
                expires_at integer not null default -1,
                remaining_quota integer not null default -1,
                used_quota integer not null default 0,
                grp text not null default '',
                cross_group_retry integer not null default 0,
                model_whitelist text not null default '[]',
                ip_allowlist text not null default '[]',
                rpm_limit integer not null default 0,
                tpm_limit integer not null default 0
            );
            create table if not exists providers (
                id integer primary key,
                name text not null,
                kind text not null,
                enabled integer not null default 1,
                priority integer not null default 0,
                weight integer not null default 1,
                grp text not null default '',
                models text not null default '[]',
                base_url text,
                extra_headers text not null default '[]'
            );
            create table if not exists accounts (
                id integer primary key,
                provider_id integer not null,
                enabled integer not null default 1,
                credential_kind text not null default 'api_key',
                credential text not null default '',
                last_used_at integer not null default 0,
                total_requests integer not null default 0,
                failed_requests integer not null default 0,
                consecutive_failures integer not null default 0,
                rate_limit_errors integer not null default 0,
                auth_errors integer not null default 0,
                rpm_limit integer not null default 0,
                tpm_limit integer not null default 0,
                usage integer not null default 0,
                usage_limit integer not null default -1
            );
            create table if not exists request_logs (
                id integer primary key autoincrement,
                created_at integer not null,
                request_id text not null default '',
                user_id integer not null,
                token_id integer not null,
                provider_id integer not null,
                account_id integer not null,
                model text not null,
                status integer not null,
                duration_ms integer not null default 0,
                prompt_tokens integer not null default 0,
                completion_tokens integer not null default 0,
                error_kind text
            );
            create index if not exists idx_request_logs_created
                on request_logs(created_at desc);
            create index if not exists idx_request_logs_token
                on request_logs(token_id, created_at desc);
            create index if not exists idx_request_logs_model
                on request_logs(model, created_at desc);",
        )?;
        Ok(())
    }

    /// Upsert the seed tables from the settings file. Usage counters and
    /// token status survive restarts; only configuration fields are
    /// overwritten.
    pub fn seed_from_config(&self, cfg: &GatewayConfig, secrets: &SecretStore) -> AppResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());

        for user in &cfg.users {
            conn.execute(
                "insert into users(id, email, role, total_quota, used_quota, enabled)
                 values (?1, ?2, ?3, ?4, 0, ?5)
                 on conflict(id) do update set
                    email = excluded.email,
                    role = excluded.role,
                    total_quota = excluded.total_quota,
                    enabled = excluded.enabled",
                params![
                    user.id,
                    user.email,
                    user.role,
                    user.total_quota,
                    user.enabled as i64
                ],
            )?;
        }

        for provider in &cfg.providers {
            let models = serde_json::to_string(&provider.models)?;
            let headers: Vec<(String, String)> = provider
                .extra_headers
                .iter()
                .map(|h| (h.name.clone(), h.value.clone()))
                .collect();
            let headers = serde_json::to_string(&headers)?;
            conn.execute(
                "insert into providers(id, name, kind, enabled, priority, weight, grp,
                                       models, base_url, extra_headers)
                 values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 on conflict(id) do update set
                    name = excluded.name,
                    kind = excluded.kind,
                    enabled = excluded.enabled,
                    priority = excluded.priority,
                    weight = excluded.weight,
                    grp = excluded.grp,
                    models = excluded.models,
                    base_url = excluded.base_url,
                    extra_headers = excluded.extra_headers",
                params![
                    provider.id,
                    provider.name,
                    provider.kind,
                    provider.enabled as i64,
                    provider.priority,
                    provider.weight,
                    provider.group,
                    models,
                    provider.base_url,
                    headers
                ],
            )?;
        }

        for account in &cfg.accounts {
            let (kind, credential) = match (&account.api_key, &account.credential_bundle) {
                (Some(key), _) => ("api_key".to_string(), key.clone()),
                (None, Some(bundle)) => ("bundle".to_string(), secrets.encrypt(bundle)?),
                (None, None) => {
                    return Err(AppError::Config(format!(
                        "account {} has no credential",
                        account.id
                    )))
                }
            };
            conn.execute(
                "insert into accounts(id, provider_id, enabled, credential_kind, credential,
                                      rpm_limit, tpm_limit, usage_limit)
                 values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 on conflict(id) do update set
                    provider_id = excluded.provider_id,
                    enabled = excluded.enabled,
                    credential_kind = excluded.credential_kind,
                    credential = excluded.credential,
                    rpm_limit = excluded.rpm_limit,
                    tpm_limit = excluded.tpm_limit,
                    usage_limit = excluded.usage_limit",
                params![
                    account.id,
                    account.provider_id,
                    account.enabled as i64,
                    kind,
                    credential,
                    account.rpm_limit,
                    account.tpm_limit,
                    account.usage_limit
                ],
            )?;
        }

        for token in &cfg.access_tokens {
            let key_hash = secrets.key_hash(&token.key);
            let whitelist = serde_json::to_string(&token.models)?;
            let allowlist = serde_json::to_string(&token.allowed_ips)?;
            conn.execute(
                "insert into access_tokens(id, user_id, key_hash, name, status, created_at,
                                           expires_at, remaining_quota, used_quota, grp,
                                           cross_group_retry, model_whitelist, ip_allowlist,
                                           rpm_limit, tpm_limit)
                 values (?1, ?2, ?3, ?4, 'active', ?5, ?6, ?7, 0, ?8, ?9, ?10, ?11, ?12, ?13)
                 on conflict(id) do update set
                    user_id = excluded.user_id,
                    key_hash = excluded.key_hash,
                    name = excluded.name,
                    expires_at = excluded.expires_at,
                    grp = excluded.grp,
                    cross_group_retry = excluded.cross_group_retry,
                    model_whitelist = excluded.model_whitelist,
                    ip_allowlist = excluded.ip_allowlist,
                    rpm_limit = excluded.rpm_limit,
                    tpm_limit = excluded.tpm_limit",
                params![
                    token.id,
                    token.user_id,
                    key_hash,
                    token.name,
                    chrono::Utc::now().timestamp(),
                    token.expires_at,
                    token.quota,
                    token.group,
                    token.cross_group_retry as i64,
                    whitelist,
                    allowlist,
                    token.rpm_limit,
                    token.tpm_limit
                ],
            )?;
        }

        Ok(())
    }

    pub fn load_users(&self) -> AppResult<Vec<User>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare_cached(
            "select id, email, role, total_quota, used_quota, enabled from users",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(User {
                id: r.get(0)?,
                email: r.get(1)?,
                role: Role::parse(&r.get::<_, String>(2)?),
                total_quota: r.get(3)?,
                used_quota: r.get(4)?,
                enabled: r.get::<_, i64>(5)? != 0,
            })
        })?;
        Ok(rows.filter_map(|x| x.ok()).collect())
    }

    pub fn load_tokens(&self) -> AppResult<Vec<AccessToken>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare_cached(
            "select id, user_id, key_hash, name, status, created_at, expires_at,
                    remaining_quota, used_quota, grp, cross_group_retry,
                    model_whitelist, ip_allowlist, rpm_limit, tpm_limit
             from access_tokens",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(AccessToken {
                id: r.get(0)?,
                user_id: r.get(1)?,
                key_hash: r.get(2)?,
                name: r.get(3)?,
                status: TokenStatus::parse(&r.get::<_, String>(4)?)
                    .unwrap_or(TokenStatus::Disabled),
                created_at: r.get(5)?,
                expires_at: r.get(6)?,
                remaining_quota: r.get(7)?,
                used_quota: r.get(8)?,
                group: r.get(9)?,
                cross_group_retry: r.get::<_, i64>(10)? != 0,
                model_whitelist: serde_json::from_str(&r.get::<_, String>(11)?)
                    .unwrap_or_default(),
                ip_allowlist: serde_json::from_str(&r.get::<_, String>(12)?)
                    .unwrap_or_default(),
                rpm_limit: r.get(13)?,
                tpm_limit: r.get(14)?,
            })
        })?;
        Ok(rows.filter_map(|x| x.ok()).collect())
    }

    pub fn load_providers(&self) -> AppResult<Vec<Provider>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare_cached(
            "select id, name, kind, enabled, priority, weight, grp, models,
                    base_url, extra_headers
             from providers",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, i32>(4)?,
                r.get::<_, u32>(5)?,
                r.get::<_, String>(6)?,
                r.get::<_, String>(7)?,
                r.get::<_, Option<String>>(8)?,
                r.get::<_, String>(9)?,
            ))
        })?;

        let mut providers = Vec::new();
        for row in rows.filter_map(|x| x.ok()) {
            let (id, name, kind, enabled, priority, weight, group, models, base_url, headers) =
                row;
            let Some(kind) = ProviderKind::parse(&kind) else {
                crate::logger::warn("db", &format!("provider {} has unknown kind '{}'", id, kind));
                continue;
            };
            providers.push(Provider {
                id,
                name,
                kind,
                enabled: enabled != 0,
                priority,
                weight,
                group,
                models: serde_json::from_str(&models).unwrap_or_default(),
                base_url,
                extra_headers: serde_json::from_str(&headers).unwrap_or_default(),
            });
        }
        Ok(providers)
    }

    pub fn load_accounts(&self, secrets: &SecretStore) -> AppResult<Vec<Account>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare_cached(
            "select id, provider_id, enabled, credential_kind, credential,
                    rpm_limit, tpm_limit, usage, usage_limit
             from accounts",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, u32>(5)?,
                r.get::<_, u32>(6)?,
                r.get::<_, i64>(7)?,
                r.get::<_, i64>(8)?,
            ))
        })?;

        let mut accounts = Vec::new();
        for row in rows.filter_map(|x| x.ok()) {
            let (id, provider_id, enabled, kind, raw, rpm, tpm, usage, usage_limit) = row;
            let credential = match kind.as_str() {
                "bundle" => {
                    let plaintext = secrets.decrypt(&raw)?;
                    let bundle: CredentialBundle = serde_json::from_str(&plaintext)?;
                    Credential::Bundle(bundle)
                }
                _ => Credential::ApiKey(raw),
            };
            let account =
                Account::new(id, provider_id, enabled != 0, credential, rpm, tpm, usage_limit);
            account
                .usage
                .store(usage, std::sync::atomic::Ordering::Relaxed);
            accounts.push(account);
        }
        Ok(accounts)
    }

    pub fn update_token_state(&self, token: &AccessToken) -> AppResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "update access_tokens
             set status = ?2, remaining_quota = ?3, used_quota = ?4
             where id = ?1",
            params![
                token.id,
                token.status.as_str(),
                token.remaining_quota,
                token.used_quota
            ],
        )?;
        Ok(())
    }

    pub fn update_user_usage(&self, user_id: i64, used_quota: i64) -> AppResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "update users set used_quota = ?2 where id = ?1",
            params![user_id, used_quota],
        )?;
        Ok(())
    }

    /// Best-effort mirror of the in-memory account counters.
    pub fn persist_account_counters(&self, account: &Account) -> AppResult<()> {
        use std::sync::atomic::Ordering;
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "update accounts
             set last_used_at = ?2, total_requests = ?3, failed_requests = ?4,
                 consecutive_failures = ?5, rate_limit_errors = ?6, auth_errors = ?7,
                 usage = ?8, usage_limit = ?9
             where id = ?1",
            params![
                account.id,
                account.last_used_at.load(Ordering::Relaxed),
                account.total_requests.load(Ordering::Relaxed),
                account.failed_requests.load(Ordering::Relaxed),
                account.consecutive_failures.load(Ordering::Relaxed),
                account.rate_limit_errors.load(Ordering::Relaxed),
                account.auth_errors.load(Ordering::Relaxed),
                account.usage.load(Ordering::Relaxed),
                account.usage_limit.load(Ordering::Relaxed)
            ],
        )?;
        Ok(())
    }

    pub fn persist_account_credential(
        &self,
        account_id: i64,
        credential: &Credential,
        secrets: &SecretStore,
    ) -> AppResult<()> {
        let (kind, raw) = match credential {
            Credential::ApiKey(key) => ("api_key", key.clone()),
            Credential::Bundle(bundle) => {
                ("bundle", secrets.encrypt(&serde_json::to_string(bundle)?)?)
            }
        };
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "update accounts set credential_kind = ?2, credential = ?3 where id = ?1",
            params![account_id, kind, raw],
        )?;
        Ok(())
    }

    pub fn append_log_rows(&self, rows: &[LogRow]) -> AppResult<()> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "insert into request_logs(created_at, request_id, user_id, token_id,
                                          provider_id, account_id, model, status,
                                          duration_ms, prompt_tokens, completion_tokens,
                                          error_kind)
                 values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.created_at,
                    row.request_id,
                    row.user_id,
                    row.token_id,
                    row.provider_id,
                    row.account_id,
                    row.model,
                    row.status,
                    row.duration_ms,
                    row.prompt_tokens,
                    row.completion_tokens,
                    row.error_kind
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn log_count(&self) -> AppResult<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare_cached("select count(*) from request_logs")?;
        Ok(stmt.query_row([], |r| r.get(0))?)
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccountSeed, ProviderSeed, TokenSeed, UserSeed};

    fn secrets() -> SecretStore {
        SecretStore::from_bytes([3u8; 32])
    }

    fn seeded_db() -> Db {
        let db = Db::open_in_memory().unwrap();
        db.init().unwrap();
        let mut cfg = GatewayConfig::default();
        cfg.users.push(UserSeed {
            id: 1,
            email: "owner@example.com".to_string(),
            role: "admin".to_string(),
            total_quota: -1,
            enabled: true,
        });
        cfg.providers.push(ProviderSeed {
            id: 1,
            name: "main".to_string(),
            kind: "openai".to_string(),
            enabled: true,
            priority: 10,
            weight: 2,
            group: "default".to_string(),
            models: vec!["gpt-4o-mini".to_string()],
            base_url: None,
            extra_headers: Vec::new(),
        });
        cfg.accounts.push(AccountSeed {
            id: 1,
            provider_id: 1,
            enabled: true,
            api_key: Some("sk-upstream".to_string()),
            credential_bundle: None,
            rpm_limit: 0,
            tpm_limit: 0,
            usage_limit: -1,
        });
        cfg.access_tokens.push(TokenSeed {
            id: 1,
            user_id: 1,
            key: "sk-caller".to_string(),
            name: "caller".to_string(),
            group: "default".to_string(),
            cross_group_retry: false,
            expires_at: -1,
            quota: 1000,
            models: vec![],
            allowed_ips: vec![],
            rpm_limit: 0,
            tpm_limit: 0,
        });
        db.seed_from_config(&cfg, &secrets()).unwrap();
        db
    }

    #[test]
    fn seed_and_load_round_trip() {
        let db = seeded_db();
        let users = db.load_users().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].role, Role::Admin);

        let providers = db.load_providers().unwrap();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].kind, ProviderKind::OpenAi);
        assert_eq!(providers[0].models, vec!["gpt-4o-mini"]);

        let accounts = db.load_accounts(&secrets()).unwrap();
        assert_eq!(accounts.len(), 1);
        match accounts[0].credential() {
            Credential::ApiKey(key) => assert_eq!(key, "sk-upstream"),
            other => panic!("unexpected credential: {:?}", other),
        }

        let tokens = db.load_tokens().unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].key_hash, secrets().key_hash("sk-caller"));
        assert_eq!(tokens[0].remaining_quota, 1000);
    }

    #[test]
    fn reseed_preserves_usage() {
        let db = seeded_db();
        let mut token = db.load_tokens().unwrap().remove(0);
        token.remaining_quota = 400;
        token.used_quota = 600;
        db.update_token_state(&token).unwrap();

        // Reseeding with the same config must not clobber usage.
        let mut cfg = GatewayConfig::default();
        cfg.access_tokens.push(TokenSeed {
            id: 1,
            user_id: 1,
            key: "sk-caller".to_string(),
            quota: 1000,
            expires_at: -1,
            ..Default::default()
        });
        db.seed_from_config(&cfg, &secrets()).unwrap();
        let token = db.load_tokens().unwrap().remove(0);
        assert_eq!(token.remaining_quota, 400);
        assert_eq!(token.used_quota, 600);
    }

    #[test]
    fn bundle_credentials_are_encrypted_at_rest() {
        let db = Db::open_in_memory().unwrap();
        db.init().unwrap();
        let mut cfg = GatewayConfig::default();
        cfg.accounts.push(AccountSeed {
            id: 7,
            provider_id: 1,
            enabled: true,
            api_key: None,
            credential_bundle: Some(
                r#"{"access_token":"at","refresh_token":"rt","expires_at":99}"#.to_string(),
            ),
            rpm_limit: 0,
            tpm_limit: 0,
            usage_limit: 1000,
        });
        db.seed_from_config(&cfg, &secrets()).unwrap();

        // The raw column must not contain the plaintext token.
        let raw: String = {
            let conn = db.conn.lock().unwrap();
            conn.query_row("select credential from accounts where id = 7", [], |r| {
                r.get(0)
            })
            .unwrap()
        };
        assert!(!raw.contains("refresh_token"));

        let accounts = db.load_accounts(&secrets()).unwrap();
        match accounts[0].credential() {
            Credential::Bundle(bundle) => {
                assert_eq!(bundle.access_token, "at");
                assert_eq!(bundle.expires_at, 99);
            }
            other => panic!("unexpected credential: {:?}", other),
        }
    }

    #[test]
    fn log_rows_append_and_count() {
        let db = seeded_db();
        let rows = vec![LogRow {
            created_at: chrono::Utc::now().timestamp(),
            request_id: "r1".to_string(),
            user_id: 1,
            token_id: 1,
            provider_id: 1,
            account_id: 1,
            model: "gpt-4o-mini".to_string(),
            status: 200,
            duration_ms: 42,
            prompt_tokens: 10,
            completion_tokens: 20,
            error_kind: None,
        }];
        db.append_log_rows(&rows).unwrap();
        assert_eq!(db.log_count().unwrap(), 1);
        let (model, prompt, completion): (String, i64, i64) = {
            let conn = db.conn.lock().unwrap();
            conn.query_row(
                "select model, prompt_tokens, completion_tokens from request_logs",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap()
        };
        assert_eq!(model, "gpt-4o-mini");
        assert_eq!(prompt, 10);
        assert_eq!(completion, 20);
    }
}
