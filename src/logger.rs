//! Global logger
//!
//! Module-tagged logging with asynchronous batched persistence: callers hand
//! a `(source, message)` pair to a channel, a background thread batches rows
//! into SQLite and mirrors them to stderr. Logging must never block or fail
//! a request path, so every send is best-effort.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{mpsc, Once, RwLock};
use std::time::{Duration, Instant};

use rusqlite::{params, Connection};

static INIT: Once = Once::new();
static LOG_SENDER: RwLock<Option<mpsc::Sender<LogMessage>>> = RwLock::new(None);
static MIN_LEVEL: AtomicU8 = AtomicU8::new(1); // info

const BATCH_MAX: usize = 64;
const BATCH_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
struct LogMessage {
    timestamp: i64,
    level: LogLevel,
    source: String,
    message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

fn log_db_path() -> PathBuf {
    let mut p = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("llm-gateway");
    std::fs::create_dir_all(&p).ok();
    p.push("logs.db");
    p
}

fn open_log_db() -> Option<Connection> {
    let conn = Connection::open(log_db_path()).ok()?;
    conn.pragma_update(None, "journal_mode", "WAL").ok();
    conn.pragma_update(None, "synchronous", "NORMAL").ok();
    conn.execute(
        "create table if not exists gateway_logs (
            id integer primary key autoincrement,
            timestamp integer not null,
            level text not null,
            source text not null,
            message text not null
        )",
        [],
    )
    .ok()?;
    Some(conn)
}

fn flush(conn: &Connection, batch: &mut Vec<LogMessage>) {
    if batch.is_empty() {
        return;
    }
    let mut stmt = match conn
        .prepare_cached("insert into gateway_logs(timestamp, level, source, message) values (?,?,?,?)")
    {
        Ok(stmt) => stmt,
        Err(_) => {
            batch.clear();
            return;
        }
    };
    for msg in batch.drain(..) {
        let _ = stmt.execute(params![msg.timestamp, msg.level.as_str(), msg.source, msg.message]);
    }
}

/// Start the background writer. Safe to call more than once.
pub fn init() {
    INIT.call_once(|| {
        if let Ok(raw) = std::env::var("GATEWAY_LOG") {
            if let Some(level) = LogLevel::parse(&raw) {
                MIN_LEVEL.store(level as u8, Ordering::Relaxed);
            }
        }

        let (tx, rx) = mpsc::channel::<LogMessage>();
        *LOG_SENDER.write().unwrap_or_else(|e| e.into_inner()) = Some(tx);

        std::thread::Builder::new()
            .name("gateway-logger".to_string())
            .spawn(move || {
                let conn = open_log_db();
                let mut batch: Vec<LogMessage> = Vec::with_capacity(BATCH_MAX);
                let mut last_flush = Instant::now();
                loop {
                    match rx.recv_timeout(BATCH_INTERVAL) {
                        Ok(msg) => batch.push(msg),
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                    if batch.len() >= BATCH_MAX || last_flush.elapsed() >= BATCH_INTERVAL {
                        if let Some(conn) = conn.as_ref() {
                            flush(conn, &mut batch);
                        } else {
                            batch.clear();
                        }
                        last_flush = Instant::now();
                    }
                }
                if let Some(conn) = conn.as_ref() {
                    flush(conn, &mut batch);
                }
            })
            .ok();
    });
}

fn log(level: LogLevel, source: &str, message: &str) {
    if (level as u8) < MIN_LEVEL.load(Ordering::Relaxed) {
        return;
    }

    eprintln!("[{}] [{}] {}", level.as_str(), source, message);

    let msg = LogMessage {
        timestamp: chrono::Utc::now().timestamp(),
        level,
        source: source.to_string(),
        message: message.to_string(),
    };
    if let Ok(guard) = LOG_SENDER.read() {
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(msg);
        }
    }
}

pub fn debug(source: &str, message: &str) {
    log(LogLevel::Debug, source, message);
}

pub fn info(source: &str, message: &str) {
    log(LogLevel::Info, source, message);
}

pub fn warn(source: &str, message: &str) {
    log(LogLevel::Warn, source, message);
}

pub fn error(source: &str, message: &str) {
    log(LogLevel::Error, source, message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_parse_round_trip() {
        for level in [LogLevel::Debug, LogLevel::Info, LogLevel::Warn, LogLevel::Error] {
            assert_eq!(LogLevel::parse(level.as_str()), Some(level));
        }
        assert_eq!(LogLevel::parse("verbose"), None);
    }

    #[test]
    fn logging_without_init_is_harmless() {
        warn("test", "no sender installed yet");
    }
}
