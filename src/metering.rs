//! Usage meter and log sink
//!
//! One append-only row per request. Rows queue in a bounded in-memory
//! buffer flushed by a background task on a short timer or at high-water.
//! When the backlog exceeds the hard cap the oldest rows are degraded to
//! their billing-only form: non-billing fields are dropped, token counts
//! never are.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::db::Db;
use crate::logger;

/// Append-only request log row. Never mutated after the flush.
#[derive(Debug, Clone)]
pub struct LogRow {
    /// Epoch-seconds.
    pub created_at: i64,
    pub request_id: String,
    pub user_id: i64,
    pub token_id: i64,
    pub provider_id: i64,
    pub account_id: i64,
    pub model: String,
    pub status: u16,
    pub duration_ms: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    /// Set when status >= 400.
    pub error_kind: Option<String>,
}

impl LogRow {
    /// Drop everything that is not part of the billing trail.
    fn strip_non_billing(&mut self) {
        self.request_id.clear();
        self.error_kind = None;
    }
}

pub struct UsageMeter {
    queue: Mutex<VecDeque<LogRow>>,
    notify: Notify,
    high_water: usize,
    hard_cap: usize,
}

impl UsageMeter {
    pub fn new(high_water: usize, hard_cap: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            high_water: high_water.max(1),
            hard_cap: hard_cap.max(1),
        }
    }

    /// Queue one row. Never blocks and never fails.
    pub fn append(&self, row: LogRow) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.push_back(row);

        if queue.len() > self.hard_cap {
            // Over the cap: degrade the oldest overflow rows in place.
            let overflow = queue.len() - self.hard_cap;
            for row in queue.iter_mut().take(overflow) {
                row.strip_non_billing();
            }
        }

        let wake = queue.len() >= self.high_water;
        drop(queue);
        if wake {
            self.notify.notify_one();
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn drain(&self) -> Vec<LogRow> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.drain(..).collect()
    }

    /// Flush everything queued right now. Used by the background task and
    /// once more during shutdown.
    pub fn flush_to(&self, db: &Db) {
        let rows = self.drain();
        if rows.is_empty() {
            return;
        }
        if let Err(e) = db.append_log_rows(&rows) {
            logger::error("metering", &format!("flush of {} rows failed: {}", rows.len(), e));
        }
    }

    /// Background flush loop; exits when the shutdown signal flips.
    pub async fn run_flusher(
        self: Arc<Self>,
        db: Arc<Db>,
        interval_ms: u64,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let interval = Duration::from_millis(interval_ms.max(50));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.notify.notified() => {}
                _ = shutdown.changed() => {
                    self.flush_to(&db);
                    return;
                }
            }
            self.flush_to(&db);
        }
    }

    #[cfg(test)]
    fn peek(&self) -> Vec<LogRow> {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(i: i64) -> LogRow {
        LogRow {
            created_at: 1_700_000_000 + i,
            request_id: format!("req-{}", i),
            user_id: 1,
            token_id: 1,
            provider_id: 1,
            account_id: 1,
            model: "gpt-4o-mini".to_string(),
            status: 200,
            duration_ms: 120,
            prompt_tokens: 10 + i,
            completion_tokens: 20 + i,
            error_kind: Some("upstream_5xx".to_string()),
        }
    }

    #[test]
    fn append_keeps_rows_in_order() {
        let meter = UsageMeter::new(100, 1000);
        for i in 0..5 {
            meter.append(row(i));
        }
        let rows = meter.peek();
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[0].request_id, "req-0");
        assert_eq!(rows[4].request_id, "req-4");
    }

    #[test]
    fn hard_cap_degrades_but_keeps_token_counts() {
        let meter = UsageMeter::new(100, 3);
        for i in 0..5 {
            meter.append(row(i));
        }
        let rows = meter.peek();
        assert_eq!(rows.len(), 5);
        // The two oldest overflow rows lost their non-billing fields.
        assert!(rows[0].request_id.is_empty());
        assert!(rows[0].error_kind.is_none());
        assert!(rows[1].request_id.is_empty());
        // Token counts survive on every row.
        assert_eq!(rows[0].prompt_tokens, 10);
        assert_eq!(rows[0].completion_tokens, 20);
        // Newer rows are untouched.
        assert_eq!(rows[4].request_id, "req-4");
        assert!(rows[4].error_kind.is_some());
    }

    #[test]
    fn flush_drains_into_db() {
        let db = Db::open_in_memory().unwrap();
        db.init().unwrap();
        let meter = UsageMeter::new(100, 1000);
        for i in 0..3 {
            meter.append(row(i));
        }
        meter.flush_to(&db);
        assert_eq!(meter.pending(), 0);
        assert_eq!(db.log_count().unwrap(), 3);
    }
}
