use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::{BurstMode, RateLimitConfig};
use crate::token_bucket::TokenBucket;

pub const HEADER_REMAINING_MINUTE: &str = "X-RateLimit-Remaining-Minute";
pub const HEADER_REMAINING_HOUR: &str = "X-RateLimit-Remaining-Hour";
pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_WINDOW: &str = "X-RateLimit-Window";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitWindow {
    Burst,
    Minute,
    Hour,
}

impl LimitWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitWindow::Burst => "burst",
            LimitWindow::Minute => "minute",
            LimitWindow::Hour => "hour",
        }
    }
}

impl fmt::Display for LimitWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub window: LimitWindow,
    pub limit: u32,
    pub retry_after: u64,
}

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub remaining_minute: u32,
    pub remaining_hour: u32,
    pub denial: Option<Denial>,
}

impl RateLimitDecision {
    pub fn allowed(&self) -> bool {
        self.denial.is_none()
    }

    pub fn retry_after(&self) -> Option<u64> {
        self.denial.as_ref().map(|d| d.retry_after)
    }

    /// Header pairs to attach to the response for this decision.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (HEADER_REMAINING_MINUTE, self.remaining_minute.to_string()),
            (HEADER_REMAINING_HOUR, self.remaining_hour.to_string()),
        ];
        if let Some(denial) = &self.denial {
            headers.push((HEADER_LIMIT, denial.limit.to_string()));
            headers.push((HEADER_WINDOW, denial.window.as_str().to_string()));
            headers.push((HEADER_RETRY_AFTER, denial.retry_after.to_string()));
        }
        headers
    }
}

struct ClientHistory {
    timestamps: VecDeque<Instant>,
    bucket: Option<TokenBucket>,
}

impl ClientHistory {
    fn new(config: &RateLimitConfig, now: Instant) -> Self {
        let bucket = match config.burst_mode {
            BurstMode::Window => None,
            BurstMode::Bucket => {
                let rate = config.burst_limit as f64 / config.burst_window_secs as f64;
                Some(TokenBucket::new_at(config.burst_limit, rate, now))
            }
        };
        Self {
            timestamps: VecDeque::new(),
            bucket,
        }
    }

    fn prune(&mut self, now: Instant) {
        while self
            .timestamps
            .front()
            .map_or(false, |&t| now.saturating_duration_since(t) > HOUR)
        {
            self.timestamps.pop_front();
        }
    }

    /// Oldest timestamp whose age is within `window`, plus the number of such entries.
    fn window_stats(&self, now: Instant, window: Duration) -> (usize, Option<Instant>) {
        let start = self
            .timestamps
            .partition_point(|&t| now.saturating_duration_since(t) > window);
        let count = self.timestamps.len() - start;
        (count, self.timestamps.get(start).copied())
    }
}

fn retry_after_secs(now: Instant, oldest: Option<Instant>, window: Duration) -> u64 {
    let Some(oldest) = oldest else {
        return 0;
    };
    let age = now.saturating_duration_since(oldest);
    ceil_secs(window.saturating_sub(age))
}

fn ceil_secs(d: Duration) -> u64 {
    if d == Duration::MAX {
        return u64::MAX;
    }
    d.as_secs().saturating_add(u64::from(d.subsec_nanos() > 0))
}

/// Per-client admission store combining the burst, minute and hour policies.
///
/// Client entries live in a sharded map; the check-count-append sequence for a
/// client runs under that client's shard lock, so two concurrent requests for the
/// same client can never both take the last slot. Unrelated clients only contend
/// when they hash to the same shard.
pub struct RateLimitStore {
    config: RateLimitConfig,
    clients: DashMap<String, ClientHistory>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimitStore {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            clients: DashMap::new(),
            cleanup_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn is_allowed(&self, client_id: &str) -> RateLimitDecision {
        self.check_at(client_id, Instant::now())
    }

    fn check_at(&self, client_id: &str, now: Instant) -> RateLimitDecision {
        let config = &self.config;
        let burst_window = Duration::from_secs(config.burst_window_secs);

        let mut entry = self
            .clients
            .entry(client_id.to_string())
            .or_insert_with(|| ClientHistory::new(config, now));
        let history = entry.value_mut();

        history.prune(now);

        let (count_minute, oldest_minute) = history.window_stats(now, MINUTE);
        let (count_hour, oldest_hour) = history.window_stats(now, HOUR);

        let burst_denial = match history.bucket.as_mut() {
            Some(bucket) => {
                bucket.refill(now);
                (bucket.tokens() < 1.0).then(|| Denial {
                    window: LimitWindow::Burst,
                    limit: config.burst_limit,
                    retry_after: ceil_secs(bucket.wait_time(1)),
                })
            }
            None => {
                let (count_burst, oldest_burst) = history.window_stats(now, burst_window);
                (count_burst >= config.burst_limit as usize).then(|| Denial {
                    window: LimitWindow::Burst,
                    limit: config.burst_limit,
                    retry_after: retry_after_secs(now, oldest_burst, burst_window),
                })
            }
        };

        let denial = burst_denial
            .or_else(|| {
                (count_minute >= config.requests_per_minute as usize).then(|| Denial {
                    window: LimitWindow::Minute,
                    limit: config.requests_per_minute,
                    retry_after: retry_after_secs(now, oldest_minute, MINUTE),
                })
            })
            .or_else(|| {
                (count_hour >= config.requests_per_hour as usize).then(|| Denial {
                    window: LimitWindow::Hour,
                    limit: config.requests_per_hour,
                    retry_after: retry_after_secs(now, oldest_hour, HOUR),
                })
            });

        let admitted = usize::from(denial.is_none());
        if denial.is_none() {
            history.timestamps.push_back(now);
            if let Some(bucket) = history.bucket.as_mut() {
                bucket.consume_at(1, now);
            }
        }

        RateLimitDecision {
            remaining_minute: remaining(config.requests_per_minute, count_minute + admitted),
            remaining_hour: remaining(config.requests_per_hour, count_hour + admitted),
            denial,
        }
    }

    /// Drops history older than an hour and forgets clients left with none.
    /// Returns the number of clients removed.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    fn cleanup_at(&self, now: Instant) -> usize {
        let before = self.clients.len();
        self.clients.retain(|_, history| {
            history.prune(now);
            !history.timestamps.is_empty()
        });
        before.saturating_sub(self.clients.len())
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Starts the periodic sweep. The task only holds a weak reference, so it
    /// ends on its own once the store is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>) {
        let period = Duration::from_secs(self.config.cleanup_interval);
        let weak: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else {
                    break;
                };
                let removed = store.cleanup();
                debug!(
                    removed,
                    tracked = store.client_count(),
                    "Rate limit cleanup sweep"
                );
            }
        });

        if let Some(previous) = self.cleanup_task.lock().replace(handle) {
            previous.abort();
        }
        info!("Rate limit cleanup running every {:?}", period);
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.cleanup_task.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for RateLimitStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn remaining(limit: u32, used: usize) -> u32 {
    (limit as usize).saturating_sub(used) as u32
}
