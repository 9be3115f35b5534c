use crate::config::RateLimitConfig;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(3600);

/// Idle keys are swept once every this many recorded actions.
const SWEEP_INTERVAL: usize = 256;

/// Sliding-window action tracker.
#[derive(Debug)]
pub struct ActionTracker {
    window: Duration,
    /// Timestamps of recent actions (kept within the window).
    actions: Mutex<Vec<Instant>>,
}

impl Default for ActionTracker {
    fn default() -> Self {
        Self::with_window(WINDOW)
    }
}

impl ActionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            actions: Mutex::new(Vec::new()),
        }
    }

    /// Record an action and return the current count within the window.
    pub fn record(&self) -> usize {
        let mut actions = self.actions.lock();
        prune(&mut actions, self.window);
        actions.push(Instant::now());
        actions.len()
    }

    /// Count of actions in the current window without recording.
    pub fn count(&self) -> usize {
        let mut actions = self.actions.lock();
        prune(&mut actions, self.window);
        actions.len()
    }

    pub fn reset(&self) {
        self.actions.lock().clear();
    }
}

impl Clone for ActionTracker {
    fn clone(&self) -> Self {
        Self {
            window: self.window,
            actions: Mutex::new(self.actions.lock().clone()),
        }
    }
}

fn prune(actions: &mut Vec<Instant>, window: Duration) {
    let cutoff = Instant::now().checked_sub(window).unwrap_or_else(Instant::now);
    actions.retain(|t| *t > cutoff);
}

/// Hourly action budget, one tracker per key (session or tool).
#[derive(Debug)]
pub struct RateLimiter {
    max_actions_per_hour: u32,
    window: Duration,
    trackers: dashmap::DashMap<String, ActionTracker>,
    recorded: AtomicUsize,
}

impl RateLimiter {
    pub fn new(max_actions_per_hour: u32) -> Self {
        Self {
            max_actions_per_hour,
            window: WINDOW,
            trackers: dashmap::DashMap::new(),
            recorded: AtomicUsize::new(0),
        }
    }

    /// Shorter windows are for tests; the budget still reads "per hour".
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_actions_per_hour)
    }

    pub fn max_actions_per_hour(&self) -> u32 {
        self.max_actions_per_hour
    }

    /// Record an action for `key`. Returns `true` if it is within budget.
    pub fn record_action(&self, key: &str) -> bool {
        let count = self
            .trackers
            .entry(key.to_string())
            .or_insert_with(|| ActionTracker::with_window(self.window))
            .record();
        // The entry guard is dropped above; retain would deadlock on its shard otherwise.
        if self.recorded.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            self.evict_idle();
        }
        count <= self.max_actions_per_hour as usize
    }

    /// Drop trackers with no action left in the window.
    pub fn evict_idle(&self) {
        self.trackers.retain(|_, tracker| tracker.count() > 0);
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.trackers.len()
    }

    /// Check if the budget is exhausted without recording.
    pub fn is_rate_limited(&self, key: &str) -> bool {
        self.count(key) >= self.max_actions_per_hour as usize
    }

    pub fn count(&self, key: &str) -> usize {
        self.trackers.get(key).map_or(0, |t| t.count())
    }

    pub fn reset(&self, key: &str) {
        self.trackers.remove(key);
    }
}
