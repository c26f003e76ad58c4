//! Sliding-window error-rate monitoring and the health tracker that feeds
//! it.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::error::Error;
use crate::host::Host;

/// A single eviction rule: fires when, within the trailing `duration`
/// seconds, the total error count exceeds `threshold`. After firing, the
/// rule is suppressed for the monitor's `suppress_window` and will not fire
/// again until `repeat` total firings have not yet been exhausted.
#[derive(Debug, Clone, Copy)]
pub struct ErrorRateRule {
    /// Error count that must be exceeded within `duration` for this rule to
    /// fire.
    pub threshold: u64,
    /// The trailing window, in seconds, this rule inspects.
    pub duration: Duration,
    /// How many times this rule may fire over the monitor's lifetime.
    pub repeat: u32,
}

impl ErrorRateRule {
    /// Construct a new rule.
    pub fn new(threshold: u64, duration: Duration, repeat: u32) -> Self {
        ErrorRateRule {
            threshold,
            duration,
            repeat,
        }
    }
}

/// Configuration for a host's [`ErrorRateMonitor`].
#[derive(Debug, Clone)]
pub struct ErrorRateConfig {
    /// How often `trackErrorRate` is expected to be invoked; informational,
    /// since this implementation evaluates on every call rather than on a
    /// separate timer.
    pub check_frequency: Duration,
    /// The size of the sliding window maintained in 1-second buckets.
    pub window: Duration,
    /// Debounce period after a rule fires before it can fire again.
    pub suppress_window: Duration,
    /// The rules evaluated on every tracked error.
    pub rules: Vec<ErrorRateRule>,
}

impl Default for ErrorRateConfig {
    fn default() -> Self {
        ErrorRateConfig {
            check_frequency: Duration::from_secs(1),
            window: Duration::from_secs(60),
            suppress_window: Duration::from_secs(10),
            rules: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    second: u64,
    count: u64,
}

#[derive(Debug)]
struct RuleState {
    rule: ErrorRateRule,
    fired_count: u32,
    last_fired: Option<Instant>,
}

/// A per-host sliding-window error counter.
///
/// Time is bucketed into 1-second slots over the last `window` seconds.
#[derive(Debug)]
pub struct ErrorRateMonitor {
    start: Instant,
    window_secs: u64,
    suppress_window: Duration,
    buckets: VecDeque<Bucket>,
    rules: Vec<RuleState>,
}

impl ErrorRateMonitor {
    /// Construct a new monitor from `config`, whose clock starts now.
    pub fn new(config: &ErrorRateConfig) -> Self {
        ErrorRateMonitor {
            start: Instant::now(),
            window_secs: config.window.as_secs().max(1),
            suppress_window: config.suppress_window,
            buckets: VecDeque::new(),
            rules: config
                .rules
                .iter()
                .map(|rule| RuleState {
                    rule: *rule,
                    fired_count: 0,
                    last_fired: None,
                })
                .collect(),
        }
    }

    fn current_bucket(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    fn record(&mut self, n: u64) {
        let bucket = self.current_bucket();
        match self.buckets.back_mut() {
            Some(b) if b.second == bucket => b.count += n,
            _ => self.buckets.push_back(Bucket { second: bucket, count: n }),
        }

        while let Some(front) = self.buckets.front() {
            if bucket.saturating_sub(front.second) >= self.window_secs {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    fn sum_within_buckets(buckets: &VecDeque<Bucket>, bucket: u64, duration: Duration) -> u64 {
        let span = duration.as_secs();
        buckets
            .iter()
            .filter(|b| bucket.saturating_sub(b.second) < span)
            .map(|b| b.count)
            .sum()
    }

    /// Record `n` errors against this host and evaluate every configured
    /// rule. Returns `true` if any rule fired on this call.
    pub fn track_error_rate(&mut self, n: u64) -> bool {
        self.record(n);

        let bucket = self.current_bucket();
        let now = Instant::now();
        let mut fired = false;

        for state in &mut self.rules {
            if let Some(last) = state.last_fired {
                if now.duration_since(last) < self.suppress_window {
                    continue;
                }
            }
            if state.fired_count >= state.rule.repeat {
                continue;
            }
            if Self::sum_within_buckets(&self.buckets, bucket, state.rule.duration) > state.rule.threshold {
                state.last_fired = Some(now);
                state.fired_count += 1;
                fired = true;
            }
        }

        fired
    }
}

/// Dispatches per-host fatal connection errors to a lazily created
/// [`ErrorRateMonitor`] and reports whether the host crossed its eviction
/// threshold.
///
/// Eviction itself is the caller's responsibility — this tracker only
/// answers "should this host be evicted", decoupled from whatever call
/// observed the error that tipped it over the threshold.
#[derive(Debug)]
pub struct ConnectionPoolHealthTracker {
    config: ErrorRateConfig,
    monitors: Mutex<HashMap<Host, ErrorRateMonitor>>,
}

impl ConnectionPoolHealthTracker {
    /// Build a tracker that creates a fresh [`ErrorRateMonitor`] per host on
    /// first use, configured via `config`.
    pub fn new(config: ErrorRateConfig) -> Self {
        ConnectionPoolHealthTracker {
            config,
            monitors: Mutex::new(HashMap::new()),
        }
    }

    /// Record a connection error observed on `host`. Only
    /// [`Error::is_fatal_connection`] errors count toward eviction;
    /// everything else is a no-op, since non-fatal errors are already
    /// handled by per-connection recycling inside the sub-pool.
    ///
    /// Returns `true` if `host` should now be evicted.
    pub async fn track_connection_error(&self, host: &Host, err: &Error) -> bool {
        if !err.is_fatal_connection() {
            return false;
        }

        let mut monitors = self.monitors.lock().await;
        let monitor = monitors
            .entry(host.clone())
            .or_insert_with(|| ErrorRateMonitor::new(&self.config));
        monitor.track_error_rate(1)
    }

    /// Drop any tracking state held for `host`, e.g. after it is removed
    /// from the pool.
    pub async fn forget(&self, host: &Host) {
        self.monitors.lock().await.remove(host);
    }
}
