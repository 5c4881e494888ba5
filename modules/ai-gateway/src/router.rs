//! Failover routing across AI providers.
//!
//! The router owns all rotation and rate-limit bookkeeping: providers are
//! plain HTTP clients, and every completion request in the system flows
//! through `ProviderRouter::complete`. Model rotation happens within a
//! provider before the router moves down the priority list.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use tokio::time::{sleep, Duration, Instant};
use tracing::{info, warn};

use crate::traits::{AiProvider, Message};

/// Router tunables. Defaults carry the thresholds the system was tuned
/// with; tests shrink the durations.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Consecutive errors on one provider/model before switching away.
    pub error_threshold: u32,
    /// A provider erroring continuously for longer than this is treated as
    /// saturated and switched away from regardless of error count.
    pub high_traffic_window: Duration,
    /// Delay before retrying the same provider/model after an isolated
    /// non-rate-limit error.
    pub retry_delay: Duration,
    /// How long a rate-limited provider/model stays out of rotation.
    pub rate_limit_cooldown: Duration,
    /// Sleep after the full attempt budget is exhausted, before one reset
    /// cycle.
    pub exhaustion_backoff: Duration,
    /// Attempt budget multiplier: total attempts = providers × this.
    pub attempts_per_provider: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            error_threshold: 3,
            high_traffic_window: Duration::from_secs(30),
            retry_delay: Duration::from_secs(2),
            rate_limit_cooldown: Duration::from_secs(60),
            exhaustion_backoff: Duration::from_secs(60),
            attempts_per_provider: 5,
        }
    }
}

/// Per provider/model runtime state. Created lazily on first error,
/// removed on success or when a cooldown elapses.
#[derive(Debug, Default)]
struct ModelState {
    error_count: u32,
    last_error_at: Option<Instant>,
    first_error_in_window_at: Option<Instant>,
    rate_limited_until: Option<Instant>,
}

/// A registered provider plus its router-owned model rotation index.
struct ProviderEntry {
    provider: Arc<dyn AiProvider>,
    current_model: AtomicUsize,
}

impl ProviderEntry {
    fn new(provider: Arc<dyn AiProvider>) -> Self {
        Self {
            provider,
            current_model: AtomicUsize::new(0),
        }
    }

    fn current_model(&self) -> Option<&str> {
        self.provider
            .models()
            .get(self.current_model.load(Ordering::SeqCst))
            .map(|s| s.as_str())
    }

    /// Advance to the provider's next model. Returns false when there is
    /// no further model to rotate to.
    fn rotate_model(&self) -> bool {
        let len = self.provider.models().len();
        if len <= 1 {
            return false;
        }
        let cur = self.current_model.load(Ordering::SeqCst);
        if cur + 1 >= len {
            return false;
        }
        self.current_model
            .compare_exchange(cur, cur + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn reset_model_rotation(&self) {
        self.current_model.store(0, Ordering::SeqCst);
    }
}

pub struct ProviderRouter {
    entries: Vec<ProviderEntry>,
    /// Index of the provider currently receiving traffic. Moves forward on
    /// failover; reset only by explicit `reset` or full exhaustion.
    current: AtomicUsize,
    /// Runtime state per (provider, model) key. One lock is the single
    /// mutation point — many accounts classify concurrently.
    states: Mutex<HashMap<(String, String), ModelState>>,
    config: RouterConfig,
}

impl ProviderRouter {
    pub fn new(providers: Vec<Arc<dyn AiProvider>>) -> Self {
        Self::with_config(providers, RouterConfig::default())
    }

    pub fn with_config(providers: Vec<Arc<dyn AiProvider>>, config: RouterConfig) -> Self {
        Self {
            entries: providers.into_iter().map(ProviderEntry::new).collect(),
            current: AtomicUsize::new(0),
            states: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Run a completion, failing over across providers and models until one
    /// succeeds or the attempt budget is exhausted twice (once before and
    /// once after the exhaustion backoff). Callers must treat an error as
    /// "classification unavailable", not as fatal.
    pub async fn complete(&self, messages: &[Message]) -> Result<String> {
        if self.entries.is_empty() {
            return Err(anyhow!("No AI providers registered"));
        }

        match self.try_cycle(messages).await {
            Ok(text) => Ok(text),
            Err(e) => {
                warn!(
                    error = %e,
                    backoff_secs = self.config.exhaustion_backoff.as_secs(),
                    "All providers exhausted, backing off before reset cycle"
                );
                sleep(self.config.exhaustion_backoff).await;
                self.reset();
                self.try_cycle(messages).await
            }
        }
    }

    /// Reset rotation state: all providers back to their first model, the
    /// pointer back to the first available provider.
    pub fn reset(&self) {
        for entry in &self.entries {
            entry.reset_model_rotation();
        }
        let first_available = self
            .entries
            .iter()
            .position(|e| e.provider.is_available())
            .unwrap_or(0);
        self.current.store(first_available, Ordering::SeqCst);
        info!(provider_index = first_available, "Router rotation reset");
    }

    async fn try_cycle(&self, messages: &[Message]) -> Result<String> {
        let budget = self.entries.len() * self.config.attempts_per_provider as usize;
        let mut last_err: Option<anyhow::Error> = None;

        for _ in 0..budget {
            let idx = self.current.load(Ordering::SeqCst) % self.entries.len();
            let entry = &self.entries[idx];
            let provider = entry.provider.as_ref();

            let model = match entry.current_model() {
                Some(m) => m.to_string(),
                None => {
                    // Provider exposes no models at all.
                    self.advance(idx);
                    continue;
                }
            };

            if !provider.is_available() || self.is_limited(provider.name(), &model) {
                self.advance(idx);
                continue;
            }

            match provider.complete(&model, messages).await {
                Ok(text) => {
                    self.record_success(provider.name(), &model);
                    return Ok(text);
                }
                Err(e) => {
                    let rate_limited = is_rate_limit_error(&e);
                    let (error_count, erroring_for) =
                        self.record_error(provider.name(), &model, rate_limited);
                    warn!(
                        provider = provider.name(),
                        model = model.as_str(),
                        error_count,
                        rate_limited,
                        error = %e,
                        "Provider call failed"
                    );
                    last_err = Some(e);

                    let high_traffic = erroring_for > self.config.high_traffic_window;
                    if rate_limited || high_traffic || error_count >= self.config.error_threshold {
                        self.advance(idx);
                    } else {
                        // Isolated error: retry the same provider/model
                        // after a fixed delay.
                        sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("All AI providers unavailable or rate limited")))
    }

    /// Rotate within the provider first; only then move the pointer to the
    /// next provider in priority order.
    fn advance(&self, from: usize) {
        let entry = &self.entries[from];
        if entry.rotate_model() {
            return;
        }
        entry.reset_model_rotation();
        let next = (from + 1) % self.entries.len();
        let _ = self
            .current
            .compare_exchange(from, next, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Check the rate-limit window for a provider/model, clearing it (and
    /// the error window with it) once the cooldown has elapsed.
    fn is_limited(&self, provider: &str, model: &str) -> bool {
        let mut states = self.states.lock().unwrap();
        let Some(state) = states.get_mut(&(provider.to_string(), model.to_string())) else {
            return false;
        };
        match state.rate_limited_until {
            Some(until) if Instant::now() >= until => {
                *state = ModelState::default();
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    fn record_success(&self, provider: &str, model: &str) {
        let mut states = self.states.lock().unwrap();
        states.remove(&(provider.to_string(), model.to_string()));
    }

    /// Record one failure; returns the updated error count and how long
    /// this provider/model has been erroring continuously.
    fn record_error(&self, provider: &str, model: &str, rate_limited: bool) -> (u32, Duration) {
        let mut states = self.states.lock().unwrap();
        let state = states
            .entry((provider.to_string(), model.to_string()))
            .or_default();
        let now = Instant::now();

        // A long gap since the previous error means the streak was broken;
        // start a fresh window.
        if let Some(last) = state.last_error_at {
            if now.duration_since(last) > self.config.high_traffic_window {
                state.error_count = 0;
                state.first_error_in_window_at = None;
            }
        }

        state.error_count += 1;
        state.last_error_at = Some(now);
        let first = *state.first_error_in_window_at.get_or_insert(now);
        if rate_limited {
            state.rate_limited_until = Some(now + self.config.rate_limit_cooldown);
        }

        (state.error_count, now.duration_since(first))
    }
}

#[async_trait::async_trait]
impl crate::traits::Completions for ProviderRouter {
    async fn complete(&self, messages: &[Message]) -> Result<String> {
        ProviderRouter::complete(self, messages).await
    }
}

/// Rate-limit signatures across the supported providers: HTTP 429 or the
/// common quota phrasings, matched case-insensitively.
fn is_rate_limit_error(e: &anyhow::Error) -> bool {
    let msg = format!("{e:#}").to_lowercase();
    msg.contains("429") || msg.contains("rate limit") || msg.contains("quota exceeded")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;

    /// Scripted provider: pops one result per call, defaults to success
    /// once the script runs out.
    struct MockProvider {
        name: &'static str,
        models: Vec<String>,
        script: Mutex<VecDeque<Result<String, String>>>,
        calls: Mutex<Vec<String>>,
        available: AtomicBool,
    }

    impl MockProvider {
        fn new(name: &'static str, models: &[&str]) -> Self {
            Self {
                name,
                models: models.iter().map(|m| m.to_string()).collect(),
                script: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
                available: AtomicBool::new(true),
            }
        }

        fn push_err(&self, msg: &str) {
            self.script.lock().unwrap().push_back(Err(msg.to_string()));
        }

        fn push_ok(&self, text: &str) {
            self.script.lock().unwrap().push_back(Ok(text.to_string()));
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AiProvider for MockProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn models(&self) -> &[String] {
            &self.models
        }

        fn is_available(&self) -> bool {
            self.available.load(Ordering::SeqCst)
        }

        async fn complete(&self, model: &str, _messages: &[Message]) -> Result<String> {
            self.calls.lock().unwrap().push(model.to_string());
            match self.script.lock().unwrap().pop_front() {
                Some(Ok(text)) => Ok(text),
                Some(Err(msg)) => Err(anyhow!("{msg}")),
                None => Ok("ok".to_string()),
            }
        }
    }

    fn fast_config() -> RouterConfig {
        RouterConfig {
            error_threshold: 3,
            high_traffic_window: Duration::from_secs(30),
            retry_delay: Duration::from_millis(100),
            rate_limit_cooldown: Duration::from_secs(60),
            exhaustion_backoff: Duration::from_secs(60),
            attempts_per_provider: 5,
        }
    }

    #[tokio::test]
    async fn first_provider_handles_request() {
        let a = Arc::new(MockProvider::new("a", &["a-1"]));
        a.push_ok("hello");
        let router = ProviderRouter::with_config(vec![a.clone()], fast_config());

        let text = router.complete(&[Message::user("hi")]).await.unwrap();
        assert_eq!(text, "hello");
        assert_eq!(a.calls(), vec!["a-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_rotates_model_before_provider() {
        let a = Arc::new(MockProvider::new("a", &["a-1", "a-2"]));
        a.push_err("API error (429 Too Many Requests): slow down");
        a.push_err("API error (429 Too Many Requests): slow down");
        let b = Arc::new(MockProvider::new("b", &["b-1"]));
        b.push_ok("from b");

        let router =
            ProviderRouter::with_config(vec![a.clone(), b.clone()], fast_config());
        let text = router.complete(&[Message::user("hi")]).await.unwrap();

        assert_eq!(text, "from b");
        // Both of a's models tried before moving down the priority list.
        assert_eq!(a.calls(), vec!["a-1", "a-2"]);
        assert_eq!(b.calls(), vec!["b-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn isolated_error_retries_same_model() {
        let a = Arc::new(MockProvider::new("a", &["a-1"]));
        a.push_err("connection reset by peer");
        a.push_ok("recovered");
        let b = Arc::new(MockProvider::new("b", &["b-1"]));

        let router =
            ProviderRouter::with_config(vec![a.clone(), b.clone()], fast_config());
        let text = router.complete(&[Message::user("hi")]).await.unwrap();

        assert_eq!(text, "recovered");
        assert_eq!(a.calls(), vec!["a-1", "a-1"]);
        assert!(b.calls().is_empty(), "second provider should not be touched");
    }

    #[tokio::test(start_paused = true)]
    async fn third_error_switches_provider() {
        let a = Arc::new(MockProvider::new("a", &["a-1"]));
        a.push_err("boom");
        a.push_err("boom");
        a.push_err("boom");
        let b = Arc::new(MockProvider::new("b", &["b-1"]));
        b.push_ok("from b");

        let router =
            ProviderRouter::with_config(vec![a.clone(), b.clone()], fast_config());
        let text = router.complete(&[Message::user("hi")]).await.unwrap();

        assert_eq!(text, "from b");
        assert_eq!(a.calls(), vec!["a-1", "a-1", "a-1"]);
        assert_eq!(b.calls(), vec!["b-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_provider_is_skipped() {
        let a = Arc::new(MockProvider::new("a", &["a-1"]));
        a.available.store(false, Ordering::SeqCst);
        let b = Arc::new(MockProvider::new("b", &["b-1"]));
        b.push_ok("from b");

        let router =
            ProviderRouter::with_config(vec![a.clone(), b.clone()], fast_config());
        let text = router.complete(&[Message::user("hi")]).await.unwrap();

        assert_eq!(text, "from b");
        assert!(a.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_waits_one_reset_cycle_then_recovers() {
        let a = Arc::new(MockProvider::new("a", &["a-1"]));
        a.push_err("429 rate limit exceeded");
        a.push_ok("after cooldown");
        let b = Arc::new(MockProvider::new("b", &["b-1"]));
        b.push_err("quota exceeded for today");

        let router =
            ProviderRouter::with_config(vec![a.clone(), b.clone()], fast_config());
        let started = Instant::now();
        let text = router.complete(&[Message::user("hi")]).await.unwrap();

        assert_eq!(text, "after cooldown");
        // One exhaustion backoff was served before the reset cycle.
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert_eq!(a.calls(), vec!["a-1", "a-1"]);
        assert_eq!(b.calls(), vec!["b-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_errors_out_after_reset_cycle() {
        let a = Arc::new(MockProvider::new("a", &["a-1"]));
        // Enough scripted failures to cover both cycles.
        for _ in 0..12 {
            a.push_err("429 rate limit exceeded");
        }

        let router = ProviderRouter::with_config(vec![a.clone()], fast_config());
        let err = router.complete(&[Message::user("hi")]).await.unwrap_err();

        assert!(format!("{err:#}").to_lowercase().contains("rate limit"));
        // Terminates: one attempt per cycle once the model is limited.
        assert_eq!(a.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn success_clears_error_state() {
        let a = Arc::new(MockProvider::new("a", &["a-1"]));
        // Two isolated-error/success pairs: the success in between must
        // reset the count, so the provider is never switched away from.
        a.push_err("boom");
        a.push_ok("one");
        let b = Arc::new(MockProvider::new("b", &["b-1"]));

        let router =
            ProviderRouter::with_config(vec![a.clone(), b.clone()], fast_config());
        assert_eq!(router.complete(&[Message::user("1")]).await.unwrap(), "one");

        a.push_err("boom");
        a.push_err("boom");
        a.push_ok("two");
        assert_eq!(router.complete(&[Message::user("2")]).await.unwrap(), "two");

        assert!(b.calls().is_empty());
    }

    #[test]
    fn rate_limit_signatures() {
        assert!(is_rate_limit_error(&anyhow!("HTTP 429 from upstream")));
        assert!(is_rate_limit_error(&anyhow!("Rate Limit hit")));
        assert!(is_rate_limit_error(&anyhow!("monthly quota exceeded")));
        assert!(!is_rate_limit_error(&anyhow!("connection refused")));
    }
}
