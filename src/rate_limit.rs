use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sliding window in-memory rate limiter (process local).
#[derive(Clone)]
pub struct InMemoryRateLimiter {
    store: Arc<DashMap<String, VecDeque<Instant>>>,
    pub enabled: bool,
}

impl InMemoryRateLimiter {
    pub fn new(enabled: bool) -> Self {
        Self { store: Arc::new(DashMap::new()), enabled }
    }

    /// Returns true if allowed, false if limited.
    pub fn check(&self, key: &str, limit: usize, window: Duration) -> bool {
        if !self.enabled { return true; }
        let now = Instant::now();
        let mut entry = self.store.entry(key.to_string()).or_default();
        while let Some(front) = entry.front() {
            if now.duration_since(*front) >= window { entry.pop_front(); } else { break; }
        }
        if entry.len() < limit {
            entry.push_back(now);
            true
        } else {
            false
        }
    }
}

/// Per-action limits.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub post_limit: usize,
    pub post_window: Duration,
    pub vote_limit: usize,
    pub vote_window: Duration,
    pub login_limit: usize,
    pub login_window: Duration,
    pub paper_limit: usize,
    pub paper_window: Duration,
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        fn usize_env(name: &str, default: usize) -> usize { std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default) }
        fn dur_env(name: &str, default: u64) -> Duration { Duration::from_secs(std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)) }
        Self {
            post_limit: usize_env("RL_POST_LIMIT", 10),
            post_window: dur_env("RL_POST_WINDOW", 60),
            vote_limit: usize_env("RL_VOTE_LIMIT", 30),
            vote_window: dur_env("RL_VOTE_WINDOW", 60),
            login_limit: usize_env("RL_LOGIN_LIMIT", 5),
            login_window: dur_env("RL_LOGIN_WINDOW", 300),
            paper_limit: usize_env("RL_PAPER_LIMIT", 20),
            paper_window: dur_env("RL_PAPER_WINDOW", 3600),
        }
    }
}

/// High level guard used by handlers. Keys are user ids for authenticated
/// actions and peer addresses for login.
#[derive(Clone)]
pub struct RateLimiterFacade {
    pub limiter: InMemoryRateLimiter,
    pub cfg: RateLimitConfig,
}

impl RateLimiterFacade {
    pub fn new(limiter: InMemoryRateLimiter, cfg: RateLimitConfig) -> Self { Self { limiter, cfg } }

    /// `None` unless `RL_ENABLED` is `1`/`true`.
    pub fn from_env() -> Option<Self> {
        let enabled = std::env::var("RL_ENABLED").map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        enabled.then(|| Self::new(InMemoryRateLimiter::new(true), RateLimitConfig::from_env()))
    }

    pub fn allow_post(&self, who: &str) -> bool { self.limiter.check(&format!("post:{who}"), self.cfg.post_limit, self.cfg.post_window) }
    pub fn allow_vote(&self, who: &str) -> bool { self.limiter.check(&format!("vote:{who}"), self.cfg.vote_limit, self.cfg.vote_window) }
    pub fn allow_login(&self, who: &str) -> bool { self.limiter.check(&format!("login:{who}"), self.cfg.login_limit, self.cfg.login_window) }
    pub fn allow_paper(&self, who: &str) -> bool { self.limiter.check(&format!("paper:{who}"), self.cfg.paper_limit, self.cfg.paper_window) }
}
