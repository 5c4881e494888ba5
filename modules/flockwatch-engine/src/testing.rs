//! Mock infrastructure for deterministic tests: no network, no database,
//! no broker. Unit tests and the integration suite both build on these.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use ai_gateway::{Completions, Message, MessageRole};
use flockwatch_common::{
    Category, Classification, DiscoveredAccount, Job, Stage, TopicConfig,
};

use crate::content::{ContentSource, KeywordPage, PostItem};
use crate::queue::{JobHandler, JobQueue, JobState, QueueCounts, QueueError};
use crate::store::{AccountStore, ConfigStore};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn topic_config(keywords: &[&str]) -> TopicConfig {
    TopicConfig {
        id: Uuid::new_v4(),
        name: "test-topic".to_string(),
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
        primary_prompt: "Classify each account's stance on the topic.".to_string(),
        secondary_prompt: "Resolve each account into an engagement category.".to_string(),
        default_max_pages: 2,
    }
}

pub fn discovered(handle: &str) -> DiscoveredAccount {
    DiscoveredAccount {
        account_id: format!("id-{handle}"),
        handle: handle.to_string(),
        display_name: Some(handle.to_uppercase()),
        bio: None,
        followers: 100,
        discovered_at: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// MockContentSource
// ---------------------------------------------------------------------------

/// Scriptable content source: accounts per keyword, posts per handle.
#[derive(Default)]
pub struct MockContentSource {
    accounts_by_keyword: Mutex<HashMap<String, Vec<DiscoveredAccount>>>,
    timelines: Mutex<HashMap<String, Vec<String>>>,
    failing_timelines: Mutex<HashSet<String>>,
    timeline_calls: Mutex<HashMap<String, u32>>,
    /// Artificial latency per search call, for in-flight race tests.
    pub search_delay: Mutex<Option<Duration>>,
}

impl MockContentSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_keyword_accounts(&self, keyword: &str, accounts: Vec<DiscoveredAccount>) {
        self.accounts_by_keyword
            .lock()
            .unwrap()
            .insert(keyword.to_string(), accounts);
    }

    pub fn set_timeline(&self, handle: &str, posts: &[&str]) {
        self.timelines
            .lock()
            .unwrap()
            .insert(handle.to_string(), posts.iter().map(|p| p.to_string()).collect());
    }

    pub fn fail_timeline(&self, handle: &str) {
        self.failing_timelines
            .lock()
            .unwrap()
            .insert(handle.to_string());
    }

    pub fn timeline_calls(&self, handle: &str) -> u32 {
        self.timeline_calls
            .lock()
            .unwrap()
            .get(handle)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl ContentSource for MockContentSource {
    async fn search_by_keyword(
        &self,
        keyword: &str,
        _cursor: Option<&str>,
    ) -> Result<KeywordPage> {
        let delay = *self.search_delay.lock().unwrap();
        if let Some(delay) = delay {
            sleep(delay).await;
        }
        let accounts = self
            .accounts_by_keyword
            .lock()
            .unwrap()
            .get(keyword)
            .cloned()
            .unwrap_or_default();
        Ok(KeywordPage {
            accounts,
            next_cursor: None,
        })
    }

    async fn fetch_timeline(&self, handle: &str, max_items: u32) -> Result<Vec<PostItem>> {
        *self
            .timeline_calls
            .lock()
            .unwrap()
            .entry(handle.to_string())
            .or_insert(0) += 1;

        if self.failing_timelines.lock().unwrap().contains(handle) {
            return Err(anyhow!("timeline fetch refused for {handle}"));
        }

        let posts = self
            .timelines
            .lock()
            .unwrap()
            .get(handle)
            .cloned()
            .unwrap_or_default();
        Ok(posts
            .into_iter()
            .take(max_items as usize)
            .map(|text| PostItem {
                text,
                posted_at: Some(Utc::now()),
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-memory account/classification/config store.
#[derive(Default)]
pub struct MemoryStore {
    accounts: Mutex<HashMap<String, DiscoveredAccount>>,
    classifications: Mutex<HashMap<String, Classification>>,
    configs: Mutex<HashMap<Uuid, TopicConfig>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_config(&self, config: TopicConfig) {
        self.configs.lock().unwrap().insert(config.id, config);
    }

    pub fn classification_count(&self) -> usize {
        self.classifications.lock().unwrap().len()
    }

    pub fn classification(&self, account_id: &str) -> Option<Classification> {
        self.classifications.lock().unwrap().get(account_id).cloned()
    }

    pub fn all_classifications(&self) -> Vec<Classification> {
        self.classifications.lock().unwrap().values().cloned().collect()
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn upsert_account(&self, account: &DiscoveredAccount) -> Result<()> {
        let mut accounts = self.accounts.lock().unwrap();
        match accounts.get_mut(&account.account_id) {
            Some(existing) => {
                let discovered_at = existing.discovered_at;
                *existing = account.clone();
                existing.discovered_at = discovered_at;
            }
            None => {
                accounts.insert(account.account_id.clone(), account.clone());
            }
        }
        Ok(())
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<DiscoveredAccount>> {
        Ok(self.accounts.lock().unwrap().get(account_id).cloned())
    }

    async fn get_classification(&self, account_id: &str) -> Result<Option<Classification>> {
        Ok(self
            .classifications
            .lock()
            .unwrap()
            .get(account_id)
            .cloned())
    }

    async fn write_classification(&self, classification: &Classification) -> Result<()> {
        self.classifications
            .lock()
            .unwrap()
            .insert(classification.account_id.clone(), classification.clone());
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get_config(&self, id: Uuid) -> Result<Option<TopicConfig>> {
        Ok(self.configs.lock().unwrap().get(&id).cloned())
    }
}

// ---------------------------------------------------------------------------
// Completions mocks
// ---------------------------------------------------------------------------

/// Rule-driven completions: answers any batch request with one verdict per
/// account found in the prompt. Per-handle rules are consumed in order
/// (first pop serves the primary pass, the next the secondary pass);
/// handles without rules get the default category.
pub struct RuleCompletions {
    rules: Mutex<HashMap<String, VecDeque<Category>>>,
    default_category: Category,
    pub calls: AtomicU32,
}

impl RuleCompletions {
    pub fn new(default_category: Category) -> Self {
        Self {
            rules: Mutex::new(HashMap::new()),
            default_category,
            calls: AtomicU32::new(0),
        }
    }

    /// Queue one categorization for a handle.
    pub fn set_rule(&self, handle: &str, category: Category) {
        self.rules
            .lock()
            .unwrap()
            .entry(handle.to_lowercase())
            .or_default()
            .push_back(category);
    }
}

#[async_trait]
impl Completions for RuleCompletions {
    async fn complete(&self, messages: &[Message]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let user = messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .ok_or_else(|| anyhow!("no user message in request"))?;
        let payload: serde_json::Value = serde_json::from_str(&user.content)?;
        let accounts = payload
            .as_array()
            .ok_or_else(|| anyhow!("prompt payload was not an array"))?;

        let mut rules = self.rules.lock().unwrap();
        let mut verdicts = Vec::new();
        for account in accounts {
            let Some(handle) = account.get("handle").and_then(|h| h.as_str()) else {
                continue;
            };
            let key = handle.to_lowercase();
            let category = rules
                .get_mut(&key)
                .and_then(|queue| queue.pop_front())
                .unwrap_or(self.default_category);
            verdicts.push(json!({
                "handle": handle,
                "category": category.as_str(),
                "confidence": 0.9,
                "reasoning": "mock verdict",
            }));
        }

        Ok(serde_json::Value::Array(verdicts).to_string())
    }
}

/// Completions with a fixed response script; errors once the script runs
/// dry so tests notice unexpected calls.
pub struct ScriptedCompletions {
    script: Mutex<VecDeque<Result<String, String>>>,
    pub calls: AtomicU32,
}

impl ScriptedCompletions {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn push_ok(&self, response: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(Ok(response.to_string()));
    }

    pub fn push_err(&self, message: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
    }
}

impl Default for ScriptedCompletions {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Completions for ScriptedCompletions {
    async fn complete(&self, _messages: &[Message]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().unwrap().pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(anyhow!("{message}")),
            None => Err(anyhow!("no scripted response left")),
        }
    }
}

// ---------------------------------------------------------------------------
// Queues
// ---------------------------------------------------------------------------

#[derive(Default)]
struct QueueInner {
    waiting: HashMap<Stage, VecDeque<Job>>,
    states: HashMap<Uuid, (Stage, JobState)>,
}

/// In-memory queue with the same consume semantics as the Postgres
/// implementation.
#[derive(Default)]
pub struct InMemoryQueue {
    inner: Arc<Mutex<QueueInner>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn claim(&self, stage: Stage) -> Option<Job> {
        let mut inner = self.inner.lock().unwrap();
        let job = inner.waiting.get_mut(&stage)?.pop_front()?;
        inner.states.insert(job.id, (stage, JobState::Active));
        Some(job)
    }

    fn mark(&self, id: Uuid, stage: Stage, state: JobState) {
        self.inner
            .lock()
            .unwrap()
            .states
            .insert(id, (stage, state));
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn enqueue(&self, stage: Stage, payload: serde_json::Value) -> Result<Uuid, QueueError> {
        let job = Job {
            id: Uuid::new_v4(),
            stage,
            payload,
            enqueued_at: Utc::now(),
        };
        let id = job.id;
        let mut inner = self.inner.lock().unwrap();
        inner.states.insert(id, (stage, JobState::Waiting));
        inner.waiting.entry(stage).or_default().push_back(job);
        Ok(id)
    }

    async fn consume(
        &self,
        stage: Stage,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> Result<Vec<JoinHandle<()>>, QueueError> {
        let handles = (0..concurrency)
            .map(|_| {
                let queue = InMemoryQueue {
                    inner: self.inner.clone(),
                };
                let handler = handler.clone();
                tokio::spawn(async move {
                    loop {
                        match queue.claim(stage) {
                            Some(job) => {
                                let id = job.id;
                                let state = match handler.handle(job).await {
                                    Ok(()) => JobState::Completed,
                                    Err(_) => JobState::Failed,
                                };
                                queue.mark(id, stage, state);
                            }
                            None => sleep(Duration::from_millis(10)).await,
                        }
                    }
                })
            })
            .collect();
        Ok(handles)
    }

    async fn counts(&self, stage: Stage) -> Result<QueueCounts, QueueError> {
        let inner = self.inner.lock().unwrap();
        let mut counts = QueueCounts::default();
        for (job_stage, state) in inner.states.values() {
            if *job_stage != stage {
                continue;
            }
            match state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn job_state(&self, id: Uuid) -> Result<Option<JobState>, QueueError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .states
            .get(&id)
            .map(|(_, state)| *state))
    }
}

/// Queue whose broker connection is down: every call fails with the
/// connection-refused class error that flips the engine to fallback mode.
pub struct UnavailableQueue;

#[async_trait]
impl JobQueue for UnavailableQueue {
    async fn enqueue(
        &self,
        _stage: Stage,
        _payload: serde_json::Value,
    ) -> Result<Uuid, QueueError> {
        Err(QueueError::Unavailable("connection refused".to_string()))
    }

    async fn consume(
        &self,
        _stage: Stage,
        _concurrency: usize,
        _handler: Arc<dyn JobHandler>,
    ) -> Result<Vec<JoinHandle<()>>, QueueError> {
        Err(QueueError::Unavailable("connection refused".to_string()))
    }

    async fn counts(&self, _stage: Stage) -> Result<QueueCounts, QueueError> {
        Err(QueueError::Unavailable("connection refused".to_string()))
    }

    async fn job_state(&self, _id: Uuid) -> Result<Option<JobState>, QueueError> {
        Err(QueueError::Unavailable("connection refused".to_string()))
    }
}
