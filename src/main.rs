use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use llm_gateway::adapters::kiro;
use llm_gateway::catalog::ProviderKind;
use llm_gateway::dispatch::Gateway;
use llm_gateway::{config, db::Db, logger, secrets::SecretStore, server};

/// Background loops: health sweep, log flusher, device-flow usage refresh.
/// All exit when the shutdown signal flips.
fn spawn_background_tasks(
    gw: &Arc<Gateway>,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    {
        let gw = gw.clone();
        let mut shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let secs = gw.config.snapshot().health_sweep_secs.max(1);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                    _ = shutdown.changed() => return,
                }
                let cfg = gw.config.snapshot();
                gw.health.sweep(&cfg);
            }
        }));
    }

    {
        let gw = gw.clone();
        let shutdown = shutdown.clone();
        let interval = gw.config.snapshot().log_flush_interval_ms;
        handles.push(tokio::spawn(
            gw.meter.clone().run_flusher(gw.db.clone(), interval, shutdown),
        ));
    }

    {
        let gw = gw.clone();
        let mut shutdown = shutdown;
        handles.push(tokio::spawn(async move {
            loop {
                // Jitter spreads refreshes so pooled accounts do not hit
                // the usage endpoint in lockstep.
                let base = gw.config.snapshot().usage_refresh_secs.max(30);
                let jitter = rand::thread_rng().gen_range(0..=60);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(base + jitter)) => {}
                    _ = shutdown.changed() => return,
                }
                for account in gw.pool.all() {
                    if !account.enabled() {
                        continue;
                    }
                    let Some(provider) = gw.catalog.get(account.provider_id) else {
                        continue;
                    };
                    if provider.kind != ProviderKind::Kiro {
                        continue;
                    }
                    let base_url = provider.base_url.clone().unwrap_or_else(|| {
                        llm_gateway::adapters::default_base_url(provider.kind).to_string()
                    });
                    if let Err(e) = kiro::refresh_usage(&gw.http, &account, &base_url).await {
                        logger::warn(
                            "usage-refresh",
                            &format!("account {}: {}", account.id, e),
                        );
                    }
                    if let Err(e) = gw.db.persist_account_counters(&account) {
                        logger::warn(
                            "usage-refresh",
                            &format!("persist account {}: {}", account.id, e),
                        );
                    }
                    if let Err(e) = gw.db.persist_account_credential(
                        account.id,
                        &account.credential(),
                        &gw.secrets,
                    ) {
                        logger::warn(
                            "usage-refresh",
                            &format!("persist credential {}: {}", account.id, e),
                        );
                    }
                }
            }
        }));
    }

    handles
}

#[tokio::main]
async fn main() {
    logger::init();

    let cfg = match config::load(None) {
        Ok(cfg) => cfg,
        Err(e) => {
            logger::error("main", &format!("settings load failed: {}", e));
            std::process::exit(1);
        }
    };

    let secrets = match SecretStore::load_or_create(None) {
        Ok(secrets) => secrets,
        Err(e) => {
            logger::error("main", &format!("secret store unavailable: {}", e));
            std::process::exit(1);
        }
    };

    let db = match Db::open(cfg.db_path.as_deref().map(std::path::Path::new)) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            logger::error("main", &format!("database open failed: {}", e));
            std::process::exit(1);
        }
    };

    let gw = match Gateway::bootstrap(cfg, db, secrets) {
        Ok(gw) => gw,
        Err(e) => {
            logger::error("main", &format!("bootstrap failed: {}", e));
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let tasks = spawn_background_tasks(&gw, shutdown_rx);

    let shutdown_signal = async {
        let _ = tokio::signal::ctrl_c().await;
        logger::info("main", "shutdown signal received");
    };

    if let Err(e) = server::serve(gw.clone(), shutdown_signal).await {
        logger::error("main", &format!("server error: {}", e));
    }

    // Stop background loops before releasing resources, then flush the
    // remaining log rows.
    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    gw.meter.flush_to(&gw.db);
    for account in gw.pool.all() {
        let _ = gw.db.persist_account_counters(&account);
    }
    logger::info("main", "gateway stopped");
}
