//! End-to-end pipeline tests over the mock infrastructure: durable-mode
//! scenario, fallback single-flight semantics, and stage idempotency.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use uuid::Uuid;

use flockwatch_common::{AnalyzePayload, Category, Classification, FlockwatchError, Stage};
use flockwatch_engine::classifier::{BatchClassifier, ClassifierConfig};
use flockwatch_engine::limiter::FetchLimiter;
use flockwatch_engine::pipeline::{
    Pipeline, PrimaryJobHandler, SearchJobHandler, SecondaryJobHandler,
};
use flockwatch_engine::queue::{JobQueue, JobState};
use flockwatch_engine::stages::{PrimaryStage, SearchStage, SecondaryStage};
use flockwatch_engine::store::AccountStore;
use flockwatch_engine::testing::{
    discovered, topic_config, InMemoryQueue, MemoryStore, MockContentSource, RuleCompletions,
    UnavailableQueue,
};
use flockwatch_engine::{Engine, FallbackExecutor};

fn build_pipeline(
    queue: Arc<dyn JobQueue>,
    content: Arc<MockContentSource>,
    store: Arc<MemoryStore>,
    completions: Arc<RuleCompletions>,
) -> Arc<Pipeline> {
    let classifier = Arc::new(BatchClassifier::with_config(
        completions,
        ClassifierConfig {
            batch_size: 10,
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
        },
    ));
    let limiter = FetchLimiter::new(4);
    let search = SearchStage::new(content.clone(), store.clone());
    let primary = PrimaryStage::new(
        content.clone(),
        store.clone(),
        classifier.clone(),
        limiter.clone(),
        20,
    );
    let secondary = SecondaryStage::new(content, store.clone(), classifier, limiter, 20);
    Arc::new(Pipeline::new(queue, store, search, primary, secondary))
}

/// Poll until both analyze stages have drained to the expected completed
/// counts, or time out.
async fn wait_for_counts(queue: &InMemoryQueue, primary_done: u64, secondary_done: u64) {
    for _ in 0..500 {
        let primary = queue.counts(Stage::PrimaryAnalyze).await.unwrap();
        let secondary = queue.counts(Stage::SecondaryAnalyze).await.unwrap();
        if primary.completed == primary_done
            && primary.waiting + primary.active == 0
            && secondary.completed == secondary_done
            && secondary.waiting + secondary.active == 0
        {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for stage queues to drain");
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_ten_accounts_through_both_stages() {
    let content = Arc::new(MockContentSource::new());
    let store = Arc::new(MemoryStore::new());
    let completions = Arc::new(RuleCompletions::new(Category::Neutral));
    let queue: Arc<InMemoryQueue> = Arc::new(InMemoryQueue::new());

    let config = topic_config(&["foo", "bar"]);
    store.insert_config(config.clone());

    // Ten new accounts across the two keywords.
    let handles: Vec<String> = (0..10).map(|i| format!("acct{i}")).collect();
    content.add_keyword_accounts("foo", handles[..6].iter().map(|h| discovered(h)).collect());
    content.add_keyword_accounts("bar", handles[6..].iter().map(|h| discovered(h)).collect());
    for handle in &handles {
        content.set_timeline(handle, &["still talking about foo all day"]);
    }

    // Four classify terminally; six are undetermined until the secondary
    // pass resolves them.
    for handle in &handles[..4] {
        completions.set_rule(handle, Category::Advocate);
    }
    for handle in &handles[4..] {
        completions.set_rule(handle, Category::Undetermined);
        completions.set_rule(handle, Category::Peripheral);
    }

    let pipeline = build_pipeline(queue.clone(), content, store.clone(), completions);
    let mut workers = Vec::new();
    workers.extend(
        queue
            .consume(Stage::Search, 1, Arc::new(SearchJobHandler(pipeline.clone())))
            .await
            .unwrap(),
    );
    workers.extend(
        queue
            .consume(
                Stage::PrimaryAnalyze,
                5,
                Arc::new(PrimaryJobHandler(pipeline.clone())),
            )
            .await
            .unwrap(),
    );
    workers.extend(
        queue
            .consume(
                Stage::SecondaryAnalyze,
                5,
                Arc::new(SecondaryJobHandler(pipeline.clone())),
            )
            .await
            .unwrap(),
    );

    let fallback = FallbackExecutor::new(pipeline);
    let engine = Engine::builder()
        .queue(queue.clone() as Arc<dyn JobQueue>)
        .fallback(fallback)
        .build();

    let job_id = engine.trigger_search(config.id, None).await.unwrap();

    wait_for_counts(&queue, 10, 6).await;

    // Exactly ten primary jobs and exactly six secondary jobs ran.
    let primary_counts = queue.counts(Stage::PrimaryAnalyze).await.unwrap();
    assert_eq!(primary_counts.completed, 10);
    assert_eq!(primary_counts.failed, 0);
    let secondary_counts = queue.counts(Stage::SecondaryAnalyze).await.unwrap();
    assert_eq!(secondary_counts.completed, 6);
    assert_eq!(secondary_counts.failed, 0);

    assert_eq!(
        engine.job_status(job_id).await.unwrap(),
        Some(JobState::Completed)
    );

    let classifications = store.all_classifications();
    assert_eq!(classifications.len(), 10);
    let advocates = classifications
        .iter()
        .filter(|c| c.category == Category::Advocate)
        .count();
    let peripherals = classifications
        .iter()
        .filter(|c| c.category == Category::Peripheral && c.secondary_pass)
        .count();
    assert_eq!(advocates, 4);
    assert_eq!(peripherals, 6);

    for worker in workers {
        worker.abort();
    }
}

#[tokio::test]
async fn fallback_mode_is_single_flight() {
    let content = Arc::new(MockContentSource::new());
    let store = Arc::new(MemoryStore::new());
    let completions = Arc::new(RuleCompletions::new(Category::Advocate));

    let config = topic_config(&["foo"]);
    store.insert_config(config.clone());
    content.add_keyword_accounts(
        "foo",
        vec![discovered("ada"), discovered("grace"), discovered("edsger")],
    );
    for handle in ["ada", "grace", "edsger"] {
        content.set_timeline(handle, &["foo enthusiast content"]);
    }
    // Keep the run in flight long enough to observe the occupied slot.
    *content.search_delay.lock().unwrap() = Some(Duration::from_millis(200));

    let queue: Arc<dyn JobQueue> = Arc::new(UnavailableQueue);
    let pipeline = build_pipeline(queue.clone(), content, store.clone(), completions);
    let fallback = FallbackExecutor::new(pipeline);
    let engine = Engine::builder().queue(queue).fallback(fallback).build();

    let job_id = engine.trigger_search(config.id, None).await.unwrap();

    // A second trigger while the run is active reports the existing run.
    match engine.trigger_search(config.id, None).await {
        Err(FlockwatchError::SearchInProgress { job_id: existing }) => {
            assert_eq!(existing, job_id);
        }
        other => panic!("expected SearchInProgress, got {other:?}"),
    }

    assert_eq!(
        engine.job_status(job_id).await.unwrap(),
        Some(JobState::Active)
    );

    {
        let engine = &engine;
        for _ in 0..500 {
            if engine.job_status(job_id).await.unwrap() == Some(JobState::Completed) {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    }
    assert_eq!(
        engine.job_status(job_id).await.unwrap(),
        Some(JobState::Completed)
    );
    assert_eq!(store.classification_count(), 3);

    // Slot cleared: a new search can start and gets a fresh id.
    let second = engine.trigger_search(config.id, None).await.unwrap();
    assert_ne!(second, job_id);
}

#[tokio::test]
async fn fallback_run_tolerates_timeline_failures() {
    let content = Arc::new(MockContentSource::new());
    let store = Arc::new(MemoryStore::new());
    let completions = Arc::new(RuleCompletions::new(Category::Advocate));

    let config = topic_config(&["foo"]);
    store.insert_config(config.clone());
    content.add_keyword_accounts("foo", vec![discovered("broken")]);
    content.fail_timeline("broken");

    let queue: Arc<dyn JobQueue> = Arc::new(UnavailableQueue);
    let pipeline = build_pipeline(queue.clone(), content, store.clone(), completions);
    let fallback = FallbackExecutor::new(pipeline);
    let engine = Engine::builder()
        .queue(queue)
        .fallback(fallback.clone())
        .build();

    let job_id = engine.trigger_search(config.id, None).await.unwrap();
    for _ in 0..500 {
        if engine.job_status(job_id).await.unwrap() == Some(JobState::Completed) {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }

    let outcome = fallback.outcome(job_id).unwrap();
    assert_eq!(outcome.state, JobState::Completed);
    assert_eq!(outcome.summary.unwrap().accounts_discovered, 1);

    // Primary could not fetch content, secondary could not either: the
    // account ends annotated, not dropped.
    let classification = store.classification("id-broken").unwrap();
    assert_eq!(classification.category, Category::Uncategorized);
    assert!(classification.secondary_pass);
    assert!(classification
        .reasoning
        .unwrap()
        .contains("classification failed"));
}

#[tokio::test]
async fn secondary_job_is_idempotent_once_marker_is_set() {
    let content = Arc::new(MockContentSource::new());
    let store = Arc::new(MemoryStore::new());
    let completions = Arc::new(RuleCompletions::new(Category::Peripheral));
    let queue: Arc<dyn JobQueue> = Arc::new(InMemoryQueue::new());

    let config = topic_config(&["foo"]);
    store.insert_config(config.clone());

    let account = discovered("resolved");
    store.upsert_account(&account).await.unwrap();
    store
        .write_classification(&Classification {
            account_id: account.account_id.clone(),
            category: Category::Peripheral,
            confidence: 0.8,
            reasoning: None,
            classified_at: chrono::Utc::now(),
            secondary_pass: true,
        })
        .await
        .unwrap();

    let pipeline = build_pipeline(queue, content.clone(), store.clone(), completions.clone());
    pipeline
        .run_secondary_job(AnalyzePayload {
            config_id: config.id,
            account_id: account.account_id.clone(),
            handle: account.handle.clone(),
        })
        .await
        .unwrap();

    // No fetch, no AI call, state unchanged.
    assert_eq!(content.timeline_calls("resolved"), 0);
    assert_eq!(completions.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    let after = store.classification(&account.account_id).unwrap();
    assert_eq!(after.category, Category::Peripheral);
    assert!(after.secondary_pass);
}

#[tokio::test]
async fn primary_job_skips_already_classified_accounts() {
    let content = Arc::new(MockContentSource::new());
    let store = Arc::new(MemoryStore::new());
    let completions = Arc::new(RuleCompletions::new(Category::Advocate));
    let queue: Arc<dyn JobQueue> = Arc::new(InMemoryQueue::new());

    let config = topic_config(&["foo"]);
    store.insert_config(config.clone());

    let account = discovered("done");
    store.upsert_account(&account).await.unwrap();
    store
        .write_classification(&Classification {
            account_id: account.account_id.clone(),
            category: Category::Critic,
            confidence: 0.7,
            reasoning: None,
            classified_at: chrono::Utc::now(),
            secondary_pass: false,
        })
        .await
        .unwrap();

    let pipeline = build_pipeline(queue, content.clone(), store.clone(), completions.clone());
    pipeline
        .run_primary_job(AnalyzePayload {
            config_id: config.id,
            account_id: account.account_id.clone(),
            handle: account.handle.clone(),
        })
        .await
        .unwrap();

    assert_eq!(content.timeline_calls("done"), 0);
    assert_eq!(completions.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(
        store.classification(&account.account_id).unwrap().category,
        Category::Critic
    );
}

#[tokio::test]
async fn missing_config_completes_job_as_skipped() {
    let content = Arc::new(MockContentSource::new());
    let store = Arc::new(MemoryStore::new());
    let completions = Arc::new(RuleCompletions::new(Category::Advocate));
    let queue: Arc<dyn JobQueue> = Arc::new(InMemoryQueue::new());

    let pipeline = build_pipeline(queue, content, store, completions);
    // No config inserted: the job must complete (Ok), not error.
    pipeline
        .run_primary_job(AnalyzePayload {
            config_id: Uuid::new_v4(),
            account_id: "id-x".to_string(),
            handle: "x".to_string(),
        })
        .await
        .unwrap();
}
