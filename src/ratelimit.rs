// src/ratelimit.rs
//! Per-endpoint request budgets and the scheduler every provider call goes through.
//!
//! Each endpoint key owns one `RateBudget` behind its own async mutex, so callers
//! on different endpoints never contend and callers on the same endpoint queue in
//! FIFO order (tokio's mutex is fair). The budget is enforced over a rolling
//! window: a call is admitted only when fewer than `floor(limit * margin)` calls
//! started within the last `window`. Time comes from `tokio::time`, which tests
//! pause and advance deterministically.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::BudgetConfig;
use crate::error::{Error, Result};

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        metrics::describe_counter!(
            "scheduler_self_throttled_total",
            "Calls delayed by the scheduler to stay inside an endpoint budget."
        );
        metrics::describe_counter!(
            "scheduler_requests_total",
            "Calls admitted by the scheduler."
        );
    });
}

#[derive(Debug)]
pub struct RateBudget {
    endpoint_key: String,
    limit: u32,
    cap: u32,
    window: Duration,
    safety_margin: f64,
    /// Start instants of admitted calls still inside the window, oldest first.
    calls: VecDeque<Instant>,
}

impl RateBudget {
    pub fn new(endpoint_key: impl Into<String>, cfg: BudgetConfig) -> Self {
        let cfg = cfg.sanitized();
        Self {
            endpoint_key: endpoint_key.into(),
            limit: cfg.requests_per_window,
            cap: cfg.effective_cap(),
            window: cfg.window(),
            safety_margin: cfg.safety_margin,
            calls: VecDeque::new(),
        }
    }

    pub fn cap(&self) -> u32 {
        self.cap
    }

    /// Drop calls that fell out of the window ending at `now`.
    fn roll(&mut self, now: Instant) {
        while let Some(front) = self.calls.front() {
            if now.saturating_duration_since(*front) >= self.window {
                self.calls.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn count(&self) -> u32 {
        self.calls.len() as u32
    }

    pub fn window_start(&self) -> Option<Instant> {
        self.calls.front().copied()
    }

    /// Earliest instant at which one more call fits.
    fn next_slot(&self) -> Option<Instant> {
        self.window_start().map(|start| start + self.window)
    }

    fn is_exhausted(&self) -> bool {
        self.count() >= self.cap()
    }

    fn record(&mut self, now: Instant) {
        self.calls.push_back(now);
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BudgetSnapshot {
    pub endpoint_key: String,
    pub count: u32,
    pub cap: u32,
    pub limit: u32,
    pub window_ms: u64,
    pub safety_margin: f64,
    /// Milliseconds until the oldest call leaves the window.
    pub resets_in_ms: Option<u64>,
}

pub struct RateLimitScheduler {
    budgets: Mutex<HashMap<String, Arc<tokio::sync::Mutex<RateBudget>>>>,
    table: HashMap<String, BudgetConfig>,
    default_budget: BudgetConfig,
    max_wait: Duration,
    request_timeout: Duration,
}

impl RateLimitScheduler {
    pub fn new(default_budget: BudgetConfig) -> Self {
        Self {
            budgets: Mutex::new(HashMap::new()),
            table: HashMap::new(),
            default_budget: default_budget.sanitized(),
            max_wait: Duration::from_secs(120),
            request_timeout: Duration::from_secs(15),
        }
    }

    pub fn from_config(cfg: &crate::config::AppConfig) -> Self {
        let mut s = Self::new(cfg.default_budget)
            .with_max_wait(cfg.scheduler_max_wait())
            .with_request_timeout(cfg.request_timeout());
        for (key, budget) in &cfg.endpoints {
            s = s.with_endpoint(key.clone(), *budget);
        }
        s
    }

    pub fn with_endpoint(mut self, endpoint_key: impl Into<String>, budget: BudgetConfig) -> Self {
        self.table.insert(endpoint_key.into(), budget.sanitized());
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn budget_for(&self, endpoint_key: &str) -> Arc<tokio::sync::Mutex<RateBudget>> {
        let mut map = self.budgets.lock();
        map.entry(endpoint_key.to_string())
            .or_insert_with(|| {
                let cfg = self
                    .table
                    .get(endpoint_key)
                    .copied()
                    .unwrap_or(self.default_budget);
                Arc::new(tokio::sync::Mutex::new(RateBudget::new(endpoint_key, cfg)))
            })
            .clone()
    }

    /// Run `request_fn` once the endpoint budget allows it.
    ///
    /// Upstream failures (including 429) are returned unchanged and never retried.
    /// Fails with `SchedulerTimeout` when the self-imposed wait would exceed the
    /// configured ceiling, and `RequestTimeout` when the call itself hangs.
    pub async fn schedule_request<F, Fut, T>(&self, endpoint_key: &str, request_fn: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        ensure_metrics_described();
        self.acquire(endpoint_key).await?;
        counter!("scheduler_requests_total", "endpoint" => endpoint_key.to_string()).increment(1);

        match tokio::time::timeout(self.request_timeout, request_fn()).await {
            Ok(res) => res,
            Err(_) => Err(Error::RequestTimeout {
                endpoint: endpoint_key.to_string(),
                timeout_ms: self.request_timeout.as_millis() as u64,
            }),
        }
    }

    async fn acquire(&self, endpoint_key: &str) -> Result<()> {
        let deadline = Instant::now() + self.max_wait;
        let budget = self.budget_for(endpoint_key);

        let mut b = match tokio::time::timeout_at(deadline, budget.lock()).await {
            Ok(guard) => guard,
            Err(_) => return Err(self.timeout_error(endpoint_key, self.max_wait)),
        };

        let now = Instant::now();
        b.roll(now);
        if b.is_exhausted() {
            // The lock is held across the wait so later callers queue behind us.
            if let Some(slot) = b.next_slot() {
                if slot > deadline {
                    return Err(self.timeout_error(endpoint_key, slot.saturating_duration_since(now)));
                }
                let wait = slot.saturating_duration_since(now);
                tracing::info!(
                    target: "scheduler",
                    endpoint = endpoint_key,
                    wait_ms = wait.as_millis() as u64,
                    count = b.count(),
                    cap = b.cap(),
                    "self-throttling until window frees a slot"
                );
                counter!("scheduler_self_throttled_total", "endpoint" => endpoint_key.to_string())
                    .increment(1);
                tokio::time::sleep_until(slot).await;
                b.roll(Instant::now());
            }
        }

        b.record(Instant::now());
        tracing::trace!(
            target: "scheduler",
            endpoint = %b.endpoint_key,
            count = b.count(),
            cap = b.cap(),
            "request admitted"
        );
        Ok(())
    }

    fn timeout_error(&self, endpoint_key: &str, wait: Duration) -> Error {
        Error::SchedulerTimeout {
            endpoint: endpoint_key.to_string(),
            wait_ms: wait.as_millis() as u64,
            max_wait_ms: self.max_wait.as_millis() as u64,
        }
    }

    /// Current state of one endpoint budget; `None` if it has never been used or
    /// a caller is holding it while self-throttling.
    pub fn budget_snapshot(&self, endpoint_key: &str) -> Option<BudgetSnapshot> {
        let budget = self.budgets.lock().get(endpoint_key).cloned()?;
        let mut b = budget.try_lock().ok()?;
        let now = Instant::now();
        b.roll(now);
        Some(BudgetSnapshot {
            endpoint_key: b.endpoint_key.clone(),
            count: b.count(),
            cap: b.cap(),
            limit: b.limit,
            window_ms: b.window.as_millis() as u64,
            safety_margin: b.safety_margin,
            resets_in_ms: b
                .next_slot()
                .map(|slot| slot.saturating_duration_since(now).as_millis() as u64),
        })
    }

    pub fn known_endpoints(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.budgets.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}
