//! Token-bucket rate control, per direction, composing a global budget with
//! a per-torrent budget (spec.md §4.7).
//!
//! The exact smoothing formula used by a production rate limiter to avoid
//! bursty refills is an external collaborator's concern (spec.md §1); this
//! is the plain token-bucket the spec's invariant 7 ("rate-limit never
//! exceeded over any 1-second window by more than one block") requires.

use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

/// How a torrent's transfers are gated against rate limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Follow only the handle's (global engine-wide) bucket.
    Global,
    /// Follow only this torrent's own bucket.
    Single,
    /// No limiting at all.
    Unlimited,
}

/// A single token bucket for one transfer direction.
struct Bucket {
    /// Tokens available, in bytes. Signed so consumption that slightly
    /// overdraws (a full block is always let through atomically) doesn't
    /// need a separate "insufficient" path; refill simply doesn't go below
    /// the configured cap.
    tokens: AtomicI64,
    /// Refill rate in bytes/sec. `None` means unlimited. A `RwLock` rather
    /// than a plain field so the rate can be changed through a shared
    /// `Arc<GlobalRateLimiter>` without requiring `&mut`.
    rate: std::sync::RwLock<Option<u64>>,
    last_refill: std::sync::Mutex<Instant>,
}

impl Bucket {
    fn new(rate: Option<u64>) -> Self {
        Self {
            tokens: AtomicI64::new(0),
            rate: std::sync::RwLock::new(rate),
            last_refill: std::sync::Mutex::new(Instant::now()),
        }
    }

    fn set_rate(&self, rate: Option<u64>) {
        *self.rate.write().unwrap() = rate;
    }

    fn rate(&self) -> Option<u64> {
        *self.rate.read().unwrap()
    }

    fn refill(&self) {
        let rate = match self.rate() {
            Some(r) => r,
            None => return,
        };
        let mut last = self.last_refill.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(*last);
        if elapsed < Duration::from_millis(1) {
            return;
        }
        *last = now;
        let added = (rate as f64 * elapsed.as_secs_f64()) as i64;
        if added > 0 {
            // cap the bucket at one second's worth of tokens so bursts after
            // an idle period don't let through more than ~1s of budget
            let cap = rate as i64;
            let prev = self.tokens.load(Ordering::Relaxed);
            let next = (prev + added).min(cap);
            self.tokens.store(next, Ordering::Relaxed);
        }
    }

    /// Returns true and debits `n` tokens iff at least `n` tokens are
    /// available (or the bucket is unlimited).
    fn try_consume(&self, n: i64) -> bool {
        if self.rate().is_none() {
            return true;
        }
        self.refill();
        let mut current = self.tokens.load(Ordering::Relaxed);
        loop {
            if current < n {
                return false;
            }
            match self.tokens.compare_exchange_weak(
                current,
                current - n,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

/// The global, engine-wide rate limiter shared by every torrent.
pub(crate) struct GlobalRateLimiter {
    down: Bucket,
    up: Bucket,
}

impl GlobalRateLimiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            down: Bucket::new(None),
            up: Bucket::new(None),
        })
    }

    pub fn set_download_limit(&self, bytes_per_sec: Option<u64>) {
        self.down.set_rate(bytes_per_sec);
    }

    pub fn set_upload_limit(&self, bytes_per_sec: Option<u64>) {
        self.up.set_rate(bytes_per_sec);
    }
}

/// Per-torrent rate control: composes the torrent's own bucket with the
/// shared global bucket according to `Mode` (spec.md §4.7: "A transfer of n
/// bytes is permitted iff both buckets have >= n tokens; consumption debits
/// both").
pub(crate) struct RateControl {
    global: Arc<GlobalRateLimiter>,
    torrent_down: Bucket,
    torrent_up: Bucket,
    download_mode: Mode,
    upload_mode: Mode,
}

impl RateControl {
    pub fn new(global: Arc<GlobalRateLimiter>) -> Self {
        Self {
            global,
            torrent_down: Bucket::new(None),
            torrent_up: Bucket::new(None),
            download_mode: Mode::Global,
            upload_mode: Mode::Global,
        }
    }

    pub fn set_download_mode(&mut self, mode: Mode) {
        self.download_mode = mode;
    }

    pub fn set_upload_mode(&mut self, mode: Mode) {
        self.upload_mode = mode;
    }

    pub fn set_torrent_download_limit(&mut self, bytes_per_sec: Option<u64>) {
        self.torrent_down.set_rate(bytes_per_sec);
    }

    pub fn set_torrent_upload_limit(&mut self, bytes_per_sec: Option<u64>) {
        self.torrent_up.set_rate(bytes_per_sec);
    }

    /// The torrent's own download limit, if any, for resume-data capture
    /// (spec.md §6: "Persisted state" includes "per-direction speed
    /// limits").
    pub fn torrent_download_limit(&self) -> Option<u64> {
        self.torrent_down.rate()
    }

    pub fn torrent_upload_limit(&self) -> Option<u64> {
        self.torrent_up.rate()
    }

    /// Returns true and debits `n` bytes from every bucket this mode
    /// involves, iff all of them have enough tokens. Per spec.md §4.7 this
    /// is all-or-nothing: a short-by-one-bucket transfer consumes nothing.
    pub fn try_consume_download(&self, n: usize) -> bool {
        Self::try_consume_mode(self.download_mode, &self.torrent_down, &self.global.down, n)
    }

    pub fn try_consume_upload(&self, n: usize) -> bool {
        Self::try_consume_mode(self.upload_mode, &self.torrent_up, &self.global.up, n)
    }

    fn try_consume_mode(mode: Mode, torrent: &Bucket, global: &Bucket, n: usize) -> bool {
        let n = n as i64;
        match mode {
            Mode::Unlimited => true,
            Mode::Single => torrent.try_consume(n),
            Mode::Global => {
                // both buckets must have room; to keep this all-or-nothing
                // without a distributed two-phase commit, check-then-consume
                // is acceptable here since only one thread (the torrent's
                // own task) ever draws from `torrent`, and the global bucket
                // uses a CAS loop, so the worst case is a transient
                // under-count that self-corrects on the next refill.
                torrent.refill();
                global.refill();
                let torrent_has_limit = torrent.rate().is_some();
                let torrent_tokens = torrent.tokens.load(Ordering::Relaxed);
                if torrent_has_limit && torrent_tokens < n {
                    return false;
                }
                if !global.try_consume(n) {
                    return false;
                }
                if torrent_has_limit {
                    torrent.tokens.fetch_sub(n, Ordering::Relaxed);
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_mode_always_permits() {
        let global = GlobalRateLimiter::new();
        let mut rc = RateControl::new(global);
        rc.set_download_mode(Mode::Unlimited);
        assert!(rc.try_consume_download(1_000_000));
    }

    #[test]
    fn test_single_mode_respects_torrent_bucket_only() {
        let global = GlobalRateLimiter::new();
        let mut rc = RateControl::new(global);
        rc.set_download_mode(Mode::Single);
        rc.set_torrent_download_limit(Some(16384));
        // bucket starts empty; nothing should be let through yet
        assert!(!rc.try_consume_download(16384));
    }

    #[test]
    fn test_global_mode_blocks_when_global_empty() {
        let global = GlobalRateLimiter::new();
        global.set_download_limit(Some(1));
        let mut rc = RateControl::new(global);
        rc.set_download_mode(Mode::Global);
        rc.set_torrent_download_limit(None);
        // global bucket starts with zero tokens regardless of its rate, so
        // a rate-limited global bucket still blocks the first request
        assert!(!rc.try_consume_download(16384));
    }

    #[test]
    fn test_global_limit_settable_through_shared_handle() {
        let global = GlobalRateLimiter::new();
        let handle = Arc::clone(&global);
        handle.set_download_limit(Some(16384));
        let mut rc = RateControl::new(global);
        rc.set_download_mode(Mode::Global);
        // global bucket still starts empty; confirms the rate was actually
        // applied (an unset rate would let this through unconditionally,
        // per `Bucket::try_consume`'s `rate().is_none()` fast path)
        assert!(!rc.try_consume_download(16384));
    }
}
