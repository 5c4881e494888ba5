//! Batch classification: N accounts in, exactly N results out.
//!
//! Accounts are grouped into fixed-size batches, each batch is one
//! completion request through the failover router, and the keyed response
//! is reconciled back to accounts by lowercased handle. Partial responses
//! retry the whole batch; whatever is still unmatched after the retry
//! budget gets an explicit fallback result instead of being dropped.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::json;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use ai_gateway::util::{strip_code_blocks, truncate_to_char_boundary};
use ai_gateway::{Completions, Message};
use flockwatch_common::Category;

/// Categories the primary pass may produce.
pub const PRIMARY_CATEGORIES: &[Category] = &[
    Category::Advocate,
    Category::Critic,
    Category::Neutral,
    Category::OffTopic,
    Category::Undetermined,
];

/// Disjoint set the secondary pass resolves `Undetermined` into.
pub const SECONDARY_CATEGORIES: &[Category] = &[
    Category::Peripheral,
    Category::Dormant,
    Category::Automated,
];

/// Cap on each post included in a prompt.
const MAX_POST_BYTES: usize = 500;
/// Cap on the content included per account.
const MAX_ACCOUNT_BYTES: usize = 4000;

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Accounts per AI request.
    pub batch_size: usize,
    /// Total attempts per batch, including the first.
    pub max_attempts: u32,
    /// Backoff between attempts grows linearly: `base_delay × attempt`.
    pub base_delay: Duration,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

/// Input to classification: one account plus its fetched posts.
#[derive(Debug, Clone)]
pub struct AccountContent {
    pub account_id: String,
    pub handle: String,
    pub posts: Vec<String>,
}

/// Output: every input account produces exactly one of these.
#[derive(Debug, Clone)]
pub struct ClassifiedAccount {
    pub account_id: String,
    pub handle: String,
    pub category: Category,
    pub confidence: f32,
    pub reasoning: Option<String>,
}

/// One entry of the model's JSON response.
#[derive(Debug, Deserialize)]
struct ModelVerdict {
    handle: String,
    category: String,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    reasoning: Option<String>,
}

pub struct BatchClassifier {
    completions: Arc<dyn Completions>,
    config: ClassifierConfig,
}

impl BatchClassifier {
    pub fn new(completions: Arc<dyn Completions>) -> Self {
        Self::with_config(completions, ClassifierConfig::default())
    }

    pub fn with_config(completions: Arc<dyn Completions>, config: ClassifierConfig) -> Self {
        Self {
            completions,
            config,
        }
    }

    /// Classify a set of accounts against the allowed category set.
    /// Returns exactly one result per input account, in input order for
    /// the short-circuited entries and batch order otherwise.
    pub async fn classify_batch(
        &self,
        system_prompt: &str,
        accounts: Vec<AccountContent>,
        allowed: &[Category],
    ) -> Vec<ClassifiedAccount> {
        let mut results = Vec::with_capacity(accounts.len());

        // Accounts with nothing to read are decided without an AI call.
        let (empty, nonempty): (Vec<_>, Vec<_>) =
            accounts.into_iter().partition(|a| a.posts.is_empty());
        for account in empty {
            results.push(ClassifiedAccount {
                account_id: account.account_id,
                handle: account.handle,
                category: Category::Undetermined,
                confidence: 0.0,
                reasoning: Some("insufficient data: no topic content fetched".to_string()),
            });
        }

        for chunk in nonempty.chunks(self.config.batch_size.max(1)) {
            results.extend(self.classify_chunk(system_prompt, chunk, allowed).await);
        }

        results
    }

    /// Single-account convenience path used by the analyze workers.
    pub async fn classify_one(
        &self,
        system_prompt: &str,
        account: AccountContent,
        allowed: &[Category],
    ) -> ClassifiedAccount {
        self.classify_batch(system_prompt, vec![account], allowed)
            .await
            .pop()
            .expect("classify_batch returns one result per input")
    }

    async fn classify_chunk(
        &self,
        system_prompt: &str,
        chunk: &[AccountContent],
        allowed: &[Category],
    ) -> Vec<ClassifiedAccount> {
        let mut pending: HashMap<String, &AccountContent> = chunk
            .iter()
            .map(|a| (a.handle.to_lowercase(), a))
            .collect();
        let mut out = Vec::with_capacity(chunk.len());
        let mut last_error: Option<String> = None;

        for attempt in 1..=self.config.max_attempts {
            match self.request_verdicts(system_prompt, chunk, allowed).await {
                Ok(verdicts) => {
                    for verdict in verdicts {
                        let key = verdict.handle.to_lowercase();
                        let Some(category) = Category::parse(&verdict.category) else {
                            warn!(
                                handle = verdict.handle.as_str(),
                                category = verdict.category.as_str(),
                                "Unknown category in AI response"
                            );
                            continue;
                        };
                        if !allowed.contains(&category) {
                            warn!(
                                handle = verdict.handle.as_str(),
                                category = %category,
                                "Category outside the allowed set, ignoring"
                            );
                            continue;
                        }
                        if let Some(account) = pending.remove(&key) {
                            out.push(ClassifiedAccount {
                                account_id: account.account_id.clone(),
                                handle: account.handle.clone(),
                                category,
                                confidence: verdict.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
                                reasoning: verdict.reasoning,
                            });
                        }
                    }

                    if pending.is_empty() {
                        return out;
                    }
                    warn!(
                        missing = pending.len(),
                        attempt,
                        "Batch response under-reported accounts, retrying whole batch"
                    );
                    last_error = Some(format!(
                        "missing from AI response after attempt {attempt}"
                    ));
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Batch classification call failed");
                    last_error = Some(format!("{e:#}"));
                }
            }

            if attempt < self.config.max_attempts {
                sleep(self.config.base_delay * attempt).await;
            }
        }

        // Retry budget exhausted: every remaining account gets an explicit
        // fallback result rather than disappearing.
        let marker = last_error.unwrap_or_else(|| "no response".to_string());
        for account in pending.values() {
            out.push(ClassifiedAccount {
                account_id: account.account_id.clone(),
                handle: account.handle.clone(),
                category: Category::Uncategorized,
                confidence: 0.0,
                reasoning: Some(format!("classification failed: {marker}")),
            });
        }
        out
    }

    async fn request_verdicts(
        &self,
        system_prompt: &str,
        chunk: &[AccountContent],
        allowed: &[Category],
    ) -> Result<Vec<ModelVerdict>> {
        let allowed_list = allowed
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let format_instructions = format!(
            "Respond with a JSON array only, one entry per account: \
             [{{\"handle\": string, \"category\": one of [{allowed_list}], \
             \"confidence\": number 0.0-1.0, \"reasoning\": short string}}]. \
             No other text."
        );

        let payload = serde_json::Value::Array(
            chunk
                .iter()
                .map(|account| {
                    let mut budget = MAX_ACCOUNT_BYTES;
                    let posts: Vec<&str> = account
                        .posts
                        .iter()
                        .map_while(|p| {
                            if budget == 0 {
                                return None;
                            }
                            let post = truncate_to_char_boundary(p, MAX_POST_BYTES.min(budget));
                            budget = budget.saturating_sub(post.len());
                            Some(post)
                        })
                        .collect();
                    json!({ "handle": account.handle.as_str(), "posts": posts })
                })
                .collect(),
        );

        let messages = [
            Message::system(format!("{system_prompt}\n\n{format_instructions}")),
            Message::user(payload.to_string()),
        ];

        debug!(accounts = chunk.len(), "Requesting batch classification");
        let raw = self.completions.complete(&messages).await?;
        parse_verdicts(&raw)
    }
}

/// Parse the model's verdict array, tolerating code fences and prose
/// around the JSON.
fn parse_verdicts(raw: &str) -> Result<Vec<ModelVerdict>> {
    let cleaned = strip_code_blocks(raw);
    if let Ok(verdicts) = serde_json::from_str(cleaned) {
        return Ok(verdicts);
    }

    let start = cleaned
        .find('[')
        .ok_or_else(|| anyhow!("No JSON array in AI response"))?;
    let end = cleaned
        .rfind(']')
        .ok_or_else(|| anyhow!("Unterminated JSON array in AI response"))?;
    if end < start {
        return Err(anyhow!("Malformed JSON array in AI response"));
    }
    serde_json::from_str(&cleaned[start..=end]).context("AI response was not a verdict array")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RuleCompletions, ScriptedCompletions};
    use std::sync::atomic::Ordering;

    fn account(handle: &str, posts: &[&str]) -> AccountContent {
        AccountContent {
            account_id: format!("id-{handle}"),
            handle: handle.to_string(),
            posts: posts.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn fast_config() -> ClassifierConfig {
        ClassifierConfig {
            batch_size: 10,
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn single_item_path_uses_rules() {
        let completions = Arc::new(RuleCompletions::new(Category::Neutral));
        completions.set_rule("alice", Category::Advocate);
        let classifier = BatchClassifier::with_config(completions, fast_config());

        let result = classifier
            .classify_one("prompt", account("alice", &["solar rocks"]), PRIMARY_CATEGORIES)
            .await;

        assert_eq!(result.category, Category::Advocate);
        assert_eq!(result.account_id, "id-alice");
    }

    #[tokio::test]
    async fn empty_content_short_circuits_without_ai_call() {
        let completions = Arc::new(ScriptedCompletions::new());
        let classifier = BatchClassifier::with_config(completions.clone(), fast_config());

        let results = classifier
            .classify_batch("prompt", vec![account("quiet", &[])], PRIMARY_CATEGORIES)
            .await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].category, Category::Undetermined);
        assert_eq!(completions.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn under_reported_batch_retries_then_falls_back() {
        let completions = Arc::new(ScriptedCompletions::new());
        // Every attempt only ever answers for alice and bob.
        let partial = r#"[
            {"handle": "Alice", "category": "advocate", "confidence": 0.9},
            {"handle": "bob", "category": "critic", "confidence": 0.8}
        ]"#;
        for _ in 0..3 {
            completions.push_ok(partial);
        }
        let classifier = BatchClassifier::with_config(completions.clone(), fast_config());

        let results = classifier
            .classify_batch(
                "prompt",
                vec![
                    account("alice", &["post"]),
                    account("bob", &["post"]),
                    account("carol", &["post"]),
                    account("dave", &["post"]),
                ],
                PRIMARY_CATEGORIES,
            )
            .await;

        assert_eq!(results.len(), 4, "every input must produce a result");
        assert_eq!(completions.calls.load(Ordering::SeqCst), 3);

        let by_handle: HashMap<&str, &ClassifiedAccount> =
            results.iter().map(|r| (r.handle.as_str(), r)).collect();
        assert_eq!(by_handle["alice"].category, Category::Advocate);
        assert_eq!(by_handle["bob"].category, Category::Critic);
        for missing in ["carol", "dave"] {
            let r = by_handle[missing];
            assert_eq!(r.category, Category::Uncategorized);
            assert_eq!(r.confidence, 0.0);
            assert!(r.reasoning.as_deref().unwrap().contains("classification failed"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn call_error_then_success_recovers() {
        let completions = Arc::new(ScriptedCompletions::new());
        completions.push_err("upstream timeout");
        completions.push_ok(r#"[{"handle": "alice", "category": "neutral"}]"#);
        let classifier = BatchClassifier::with_config(completions.clone(), fast_config());

        let results = classifier
            .classify_batch("prompt", vec![account("alice", &["post"])], PRIMARY_CATEGORIES)
            .await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].category, Category::Neutral);
        assert_eq!(results[0].confidence, 0.5);
        assert_eq!(completions.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn category_outside_allowed_set_is_ignored() {
        let completions = Arc::new(ScriptedCompletions::new());
        // "advocate" is not valid for the secondary pass.
        for _ in 0..3 {
            completions.push_ok(r#"[{"handle": "alice", "category": "advocate"}]"#);
        }
        let classifier = BatchClassifier::with_config(completions.clone(), fast_config());

        let results = classifier
            .classify_batch("prompt", vec![account("alice", &["post"])], SECONDARY_CATEGORIES)
            .await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].category, Category::Uncategorized);
    }

    #[test]
    fn parse_tolerates_fences_and_prose() {
        let fenced = "```json\n[{\"handle\": \"a\", \"category\": \"neutral\"}]\n```";
        assert_eq!(parse_verdicts(fenced).unwrap().len(), 1);

        let prose = "Here are the results:\n[{\"handle\": \"a\", \"category\": \"neutral\"}]\nDone.";
        assert_eq!(parse_verdicts(prose).unwrap().len(), 1);

        assert!(parse_verdicts("no array here").is_err());
    }
}
