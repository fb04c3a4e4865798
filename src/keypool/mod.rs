//! API key pool with sliding-window rate limiting.
//!
//! Every key tracks its own 60-second request and token windows. Selection
//! scores the whole pool and picks the least-loaded key; `acquire` then
//! paces the chosen key and blocks the calling worker until the request
//! fits under both ceilings. Keys enter a cooldown after quota errors and
//! are permanently retired after auth failures.

mod ledger;

pub use ledger::{KeyUsage, UsageLedger};

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::config::{RateLimitPolicy, PACING_FACTOR};

/// Width of the rate-limit windows
const WINDOW_SECS: f64 = 60.0;

/// Score offset that pushes keys whose ceilings would be violated behind
/// every non-violating key
const OVERLOAD_PENALTY: f64 = 1000.0;

/// Sliding-window state for one key
struct KeyWindows {
    /// Request timestamps (epoch seconds, ascending) within the window
    requests: Vec<f64>,
    /// (timestamp, token estimate) pairs within the window
    tokens: Vec<(f64, u64)>,
    /// Epoch seconds until which the key is cooling down
    cooldown_until: Option<f64>,
    /// Set permanently on auth failure
    exhausted: bool,
}

impl KeyWindows {
    fn new() -> Self {
        Self {
            requests: Vec::new(),
            tokens: Vec::new(),
            cooldown_until: None,
            exhausted: false,
        }
    }

    /// Drop entries older than the window. Must run before any load
    /// computation.
    fn prune(&mut self, now: f64) {
        self.requests.retain(|&t| t > now - WINDOW_SECS);
        self.tokens.retain(|&(t, _)| t > now - WINDOW_SECS);
    }

    fn token_sum(&self) -> u64 {
        self.tokens.iter().map(|&(_, n)| n).sum()
    }
}

struct KeySlot {
    key: String,
    windows: Mutex<KeyWindows>,
    /// Serializes the pacing/accounting step in `acquire` per key
    gate: Mutex<()>,
}

/// Schedules requests across the key pool.
pub struct KeyScheduler {
    slots: Vec<Arc<KeySlot>>,
    policy: RateLimitPolicy,
    /// Pool-wide lock, held only for the scoring pass in `select_key`
    pool: Mutex<()>,
    ledger: Mutex<UsageLedger>,
}

impl KeyScheduler {
    pub fn new(keys: Vec<String>, policy: RateLimitPolicy, ledger: UsageLedger) -> Self {
        let slots = keys
            .into_iter()
            .map(|key| {
                Arc::new(KeySlot {
                    key,
                    windows: Mutex::new(KeyWindows::new()),
                    gate: Mutex::new(()),
                })
            })
            .collect();
        Self {
            slots,
            policy,
            pool: Mutex::new(()),
            ledger: Mutex::new(ledger),
        }
    }

    /// Pick the least-loaded usable key for a request of `estimated_tokens`.
    ///
    /// Blocks while every non-exhausted key is cooling down, until the
    /// earliest cooldown expires. Returns `None` only when the pool is
    /// empty or every key has been exhausted.
    pub fn select_key(&self, estimated_tokens: u64) -> Option<String> {
        loop {
            let wait_secs;
            {
                let _scan = self.pool.lock().unwrap();
                let now = now_epoch();

                let mut eligible: Vec<Arc<KeySlot>> = Vec::new();
                let mut earliest_expiry = f64::INFINITY;
                let mut any_alive = false;

                for slot in &self.slots {
                    let mut windows = slot.windows.lock().unwrap();
                    if windows.exhausted {
                        continue;
                    }
                    any_alive = true;
                    if let Some(until) = windows.cooldown_until {
                        if now >= until {
                            windows.cooldown_until = None;
                        } else {
                            earliest_expiry = earliest_expiry.min(until);
                            continue;
                        }
                    }
                    eligible.push(slot.clone());
                }

                if !any_alive {
                    return None;
                }

                if !eligible.is_empty() {
                    // Randomize the scan order so equally loaded keys take
                    // turns instead of starving the later ones.
                    eligible.shuffle(&mut rand::thread_rng());

                    let mut best: Option<(f64, &Arc<KeySlot>)> = None;
                    for slot in &eligible {
                        let mut windows = slot.windows.lock().unwrap();
                        windows.prune(now);
                        let score =
                            load_score(&windows, estimated_tokens, self.policy);
                        if best.as_ref().map_or(true, |&(s, _)| score < s) {
                            best = Some((score, slot));
                        }
                    }
                    return best.map(|(_, slot)| slot.key.clone());
                }

                if !earliest_expiry.is_finite() {
                    return None;
                }
                wait_secs = earliest_expiry - now;
            }

            // Every key is cooling down. Wait out the earliest expiry with
            // the pool lock released, then re-evaluate.
            if wait_secs > 0.0 {
                info!("all keys in cooldown, waiting {:.2}s", wait_secs);
                std::thread::sleep(Duration::from_secs_f64(wait_secs + 0.1));
            }
        }
    }

    /// Reserve one request of `estimated_tokens` on `key`, sleeping as
    /// needed to honor pacing and the RPM/TPM windows, then record it.
    ///
    /// Call immediately before issuing the remote request. Only one
    /// `acquire` per key runs at a time.
    pub fn acquire(&self, key: &str, estimated_tokens: u64) {
        let Some(slot) = self.slot(key) else {
            warn!("acquire on unknown key {}", redact(key));
            return;
        };
        let _gate = slot.gate.lock().unwrap();

        // Pacing: keep a minimum gap since this key's last recorded use.
        if self.policy.rpm > 0 {
            let min_interval = (WINDOW_SECS / f64::from(self.policy.rpm)) * PACING_FACTOR;
            let last_used = self.ledger.lock().unwrap().usage(key).last_used;
            loop {
                let since_last = now_epoch() - last_used;
                if since_last >= min_interval {
                    break;
                }
                let wait = min_interval - since_last;
                debug!("pacing key {}, waiting {:.2}s", redact(key), wait);
                std::thread::sleep(Duration::from_secs_f64(wait));
            }
        }

        // Hard RPM ceiling: wait for the oldest request to age out.
        loop {
            let wait = {
                let mut windows = slot.windows.lock().unwrap();
                let now = now_epoch();
                windows.prune(now);
                rpm_wait(&windows.requests, now, self.policy.rpm)
            };
            match wait {
                None => break,
                Some(wait) => {
                    debug!("RPM limit on key {}, waiting {:.2}s", redact(key), wait.as_secs_f64());
                    std::thread::sleep(wait);
                }
            }
        }

        // Hard TPM ceiling: wait until enough token entries age out to
        // make room for this request.
        loop {
            let wait = {
                let mut windows = slot.windows.lock().unwrap();
                let now = now_epoch();
                windows.prune(now);
                tpm_wait(&windows.tokens, now, estimated_tokens, self.policy.tpm)
            };
            match wait {
                None => break,
                Some(wait) => {
                    debug!("TPM limit on key {}, waiting {:.2}s", redact(key), wait.as_secs_f64());
                    std::thread::sleep(wait);
                }
            }
        }

        let now = now_epoch();
        {
            let mut windows = slot.windows.lock().unwrap();
            windows.prune(now);
            windows.requests.push(now);
            windows.tokens.push((now, estimated_tokens));
        }
        self.ledger.lock().unwrap().record(key, estimated_tokens, now);
    }

    /// Suspend `key` until `now + seconds`. Used on transient quota errors.
    pub fn mark_cooldown(&self, key: &str, seconds: f64) {
        if let Some(slot) = self.slot(key) {
            let mut windows = slot.windows.lock().unwrap();
            windows.cooldown_until = Some(now_epoch() + seconds);
            warn!("key {} cooling down for {}s", redact(key), seconds);
        }
    }

    /// Permanently retire `key` for the rest of the process. Used on auth
    /// failures.
    pub fn mark_exhausted(&self, key: &str) {
        if let Some(slot) = self.slot(key) {
            slot.windows.lock().unwrap().exhausted = true;
            warn!("key {} marked as exhausted", redact(key));
        }
    }

    /// Cumulative usage counters recorded for `key`.
    pub fn usage(&self, key: &str) -> KeyUsage {
        self.ledger.lock().unwrap().usage(key)
    }

    fn slot(&self, key: &str) -> Option<&Arc<KeySlot>> {
        self.slots.iter().find(|slot| slot.key == key)
    }

    /// Push a request into a key's windows without pacing. Test hook for
    /// exercising selection against a pre-loaded pool.
    #[cfg(test)]
    pub(crate) fn push_usage(&self, key: &str, tokens: u64) {
        if let Some(slot) = self.slot(key) {
            let now = now_epoch();
            let mut windows = slot.windows.lock().unwrap();
            windows.requests.push(now);
            windows.tokens.push((now, tokens));
        }
    }
}

/// Load score for one key; lower is better. Keys whose ceilings would be
/// violated by this request score past `OVERLOAD_PENALTY` so that any
/// non-violating key wins over them.
fn load_score(windows: &KeyWindows, estimated_tokens: u64, policy: RateLimitPolicy) -> f64 {
    let request_count = windows.requests.len() as u32;
    let token_sum = windows.token_sum();

    let rpm_load = if policy.rpm > 0 {
        f64::from(request_count) / f64::from(policy.rpm)
    } else {
        1.0
    };
    let tpm_load = if policy.tpm > 0 {
        token_sum as f64 / policy.tpm as f64
    } else {
        1.0
    };

    if request_count >= policy.rpm || token_sum + estimated_tokens > policy.tpm {
        OVERLOAD_PENALTY + rpm_load + tpm_load
    } else {
        rpm_load.max(tpm_load)
    }
}

/// Time until the oldest request leaves the window, if the window is full.
fn rpm_wait(requests: &[f64], now: f64, rpm: u32) -> Option<Duration> {
    if (requests.len() as u32) < rpm {
        return None;
    }
    let oldest = requests.first()?;
    let wait = oldest + WINDOW_SECS - now;
    (wait > 0.0).then(|| Duration::from_secs_f64(wait))
}

/// Minimal wait until enough token entries age out of the window for a
/// request of `estimated` tokens to fit under `tpm`.
fn tpm_wait(tokens: &[(f64, u64)], now: f64, estimated: u64, tpm: u64) -> Option<Duration> {
    let current: u64 = tokens.iter().map(|&(_, n)| n).sum();
    if current + estimated <= tpm {
        return None;
    }
    let needed = current + estimated - tpm;
    let mut freed = 0u64;
    for &(ts, n) in tokens {
        freed += n;
        if freed >= needed {
            let wait = ts + WINDOW_SECS - now;
            return (wait > 0.0).then(|| Duration::from_secs_f64(wait));
        }
    }
    None
}

/// Display form of a key: only the last four characters.
fn redact(key: &str) -> String {
    let tail: String = key
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("...{tail}")
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn scheduler(keys: &[&str], policy: RateLimitPolicy) -> KeyScheduler {
        let dir = tempfile::tempdir().unwrap();
        let ledger = UsageLedger::open(dir.path().join("usage.json"));
        KeyScheduler::new(keys.iter().map(|k| k.to_string()).collect(), policy, ledger)
    }

    fn wide_open() -> RateLimitPolicy {
        RateLimitPolicy {
            rpm: 100_000,
            tpm: u64::MAX / 2,
        }
    }

    #[test]
    fn empty_pool_selects_nothing() {
        let sched = scheduler(&[], RateLimitPolicy::default());
        assert_eq!(sched.select_key(0), None);
    }

    #[test]
    fn exhausted_keys_are_never_selected() {
        let sched = scheduler(&["alpha", "beta"], wide_open());
        sched.mark_exhausted("alpha");
        for _ in 0..20 {
            assert_eq!(sched.select_key(0).as_deref(), Some("beta"));
        }
        sched.mark_exhausted("beta");
        assert_eq!(sched.select_key(0), None);
    }

    #[test]
    fn cooling_keys_are_skipped_while_others_remain() {
        let sched = scheduler(&["alpha", "beta", "gamma"], wide_open());
        sched.mark_cooldown("alpha", 120.0);
        sched.mark_cooldown("gamma", 120.0);
        for _ in 0..20 {
            assert_eq!(sched.select_key(0).as_deref(), Some("beta"));
        }
    }

    #[test]
    fn selection_waits_out_a_full_cooldown() {
        let sched = scheduler(&["solo"], wide_open());
        sched.mark_cooldown("solo", 0.3);
        let start = Instant::now();
        let picked = sched.select_key(0);
        assert_eq!(picked.as_deref(), Some("solo"));
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[test]
    fn selection_prefers_the_less_loaded_key() {
        let policy = RateLimitPolicy {
            rpm: 100,
            tpm: 1_000_000,
        };
        let sched = scheduler(&["busy", "idle"], policy);
        for _ in 0..10 {
            sched.push_usage("busy", 100);
        }
        for _ in 0..20 {
            assert_eq!(sched.select_key(0).as_deref(), Some("idle"));
        }
    }

    #[test]
    fn full_window_scores_behind_any_open_key() {
        let policy = RateLimitPolicy { rpm: 2, tpm: 1_000_000 };
        let sched = scheduler(&["full", "nearly"], policy);
        sched.push_usage("full", 0);
        sched.push_usage("full", 0);
        sched.push_usage("nearly", 0);
        for _ in 0..20 {
            assert_eq!(sched.select_key(0).as_deref(), Some("nearly"));
        }
    }

    #[test]
    fn rapid_requests_spread_across_the_pool() {
        // 3 keys at rpm=2: five requests must land at most twice per key.
        let policy = RateLimitPolicy { rpm: 2, tpm: 1_000_000 };
        let sched = scheduler(&["one", "two", "three"], policy);
        let mut counts = std::collections::HashMap::new();
        for _ in 0..5 {
            let key = sched.select_key(0).expect("pool has capacity");
            sched.push_usage(&key, 0);
            *counts.entry(key).or_insert(0u32) += 1;
        }
        for (key, count) in counts {
            assert!(count <= 2, "key {key} received {count} requests");
        }
    }

    #[test]
    fn acquire_paces_consecutive_requests() {
        // rpm=240 gives a minimum interval of (60/240)*1.3 = 0.325s.
        let policy = RateLimitPolicy {
            rpm: 240,
            tpm: 1_000_000,
        };
        let sched = scheduler(&["paced"], policy);
        sched.acquire("paced", 10);
        let start = Instant::now();
        sched.acquire("paced", 10);
        assert!(
            start.elapsed() >= Duration::from_millis(300),
            "second acquire returned after {:?}",
            start.elapsed()
        );
        let usage = sched.usage("paced");
        assert_eq!(usage.total_requests, 2);
        assert_eq!(usage.total_tokens, 20);
    }

    #[test]
    fn rpm_wait_is_zero_below_the_ceiling() {
        assert_eq!(rpm_wait(&[100.0], 101.0, 2), None);
        assert_eq!(rpm_wait(&[], 0.0, 1), None);
    }

    #[test]
    fn rpm_wait_covers_the_oldest_entry() {
        // Window holds rpm entries; the oldest is 10s old, so ~50s remain.
        let wait = rpm_wait(&[100.0, 105.0], 110.0, 2).unwrap();
        assert!((wait.as_secs_f64() - 50.0).abs() < 0.001);
    }

    #[test]
    fn tpm_wait_frees_just_enough_tokens() {
        // 900 in-window + 200 estimated vs tpm 1000: freeing the first
        // entry (500 tokens) is enough; it ages out at t=160.
        let tokens = vec![(100.0, 500), (130.0, 400)];
        let wait = tpm_wait(&tokens, 150.0, 200, 1000).unwrap();
        assert!((wait.as_secs_f64() - 10.0).abs() < 0.001);
    }

    #[test]
    fn tpm_wait_is_zero_when_the_request_fits() {
        let tokens = vec![(100.0, 500)];
        assert_eq!(tpm_wait(&tokens, 150.0, 400, 1000), None);
    }

    #[test]
    fn redact_shows_only_the_tail() {
        assert_eq!(redact("AIzaSyExample1234"), "...1234");
        assert_eq!(redact("abc"), "...abc");
    }
}
