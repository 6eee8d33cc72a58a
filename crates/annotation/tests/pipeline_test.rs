use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serpline_annotation::AnnotationPipeline;
use serpline_core::clock::{Clock, ManualClock, SystemClock};
use serpline_core::config::{AnnotationConfig, QueueConfig};
use serpline_core::errors::{ExecutionError, SerplineResult};
use serpline_core::events::AnnotationEvent;
use serpline_core::models::{
    AnnotationItem, AnnotationRequest, AnnotationResponse, CacheEntry, Fingerprint, JobPriority,
    QueueDisposition,
};
use serpline_core::traits::{AnnotationProvider, CacheEntryRepository};
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Default)]
struct FakeProvider {
    calls: AtomicUsize,
    /// 每次调用的批次大小
    batch_sizes: Mutex<Vec<usize>>,
    /// 非空时每次调用都返回这个错误
    fail_with: Option<ExecutionError>,
}

impl FakeProvider {
    fn failing(error: ExecutionError) -> Self {
        Self {
            fail_with: Some(error),
            ..Default::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }
}

#[async_trait]
impl AnnotationProvider for FakeProvider {
    async fn annotate(
        &self,
        batch: &[AnnotationRequest],
    ) -> Result<Vec<AnnotationResponse>, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes.lock().unwrap().push(batch.len());
        tokio::time::sleep(Duration::from_millis(20)).await;
        if let Some(error) = &self.fail_with {
            return Err(error.clone());
        }
        Ok(batch
            .iter()
            .map(|request| AnnotationResponse {
                fingerprint: request.fingerprint.clone(),
                annotation: serde_json::json!({"title": request.item.title}),
                model: Some("fake".to_string()),
            })
            .collect())
    }
}

#[derive(Default)]
struct MemoryCacheRepository {
    entries: Mutex<HashMap<Fingerprint, CacheEntry>>,
}

#[async_trait]
impl CacheEntryRepository for MemoryCacheRepository {
    async fn put(&self, entry: &CacheEntry) -> SerplineResult<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(entry.fingerprint.clone(), entry.clone());
        Ok(())
    }

    async fn find(&self, fingerprint: &Fingerprint) -> SerplineResult<Option<CacheEntry>> {
        Ok(self.entries.lock().unwrap().get(fingerprint).cloned())
    }

    async fn list_since(&self, since: DateTime<Utc>) -> SerplineResult<Vec<CacheEntry>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .values()
            .filter(|entry| entry.written_at >= since)
            .cloned()
            .collect())
    }

    async fn delete(&self, fingerprint: &Fingerprint) -> SerplineResult<bool> {
        Ok(self.entries.lock().unwrap().remove(fingerprint).is_some())
    }
}

fn annotation_config(cache_ttl_ms: u64) -> AnnotationConfig {
    AnnotationConfig {
        cache_ttl_ms,
        batch_size: 5,
        processing_interval_ms: 100,
        requests_per_minute: 1_000,
        tokens_per_minute: 1_000_000,
        estimated_tokens_per_item: 10,
        request_timeout_ms: 5_000,
        ..Default::default()
    }
}

fn queue_config() -> QueueConfig {
    QueueConfig {
        concurrency: 4,
        max_retries: 2,
        retry_delay_ms: 100,
        backoff_multiplier: 2.0,
        max_retry_delay_ms: 1_000,
        jitter_factor: 0.0,
        default_timeout_ms: 10_000,
    }
}

fn pipeline(
    provider: Arc<FakeProvider>,
    cache_ttl_ms: u64,
    clock: Arc<dyn Clock>,
) -> AnnotationPipeline {
    let pipeline =
        AnnotationPipeline::new(annotation_config(cache_ttl_ms), queue_config(), provider, clock);
    pipeline.start();
    pipeline
}

fn item(id: &str, title: &str) -> AnnotationItem {
    AnnotationItem::new(id, title, "a snippet", format!("https://example.com/{title}"))
}

async fn next_events(rx: &mut UnboundedReceiver<AnnotationEvent>, n: usize) -> Vec<AnnotationEvent> {
    let mut events = Vec::with_capacity(n);
    while events.len() < n {
        let event = tokio::time::timeout(Duration::from_secs(600), rx.recv())
            .await
            .expect("timed out waiting for annotation events")
            .expect("event bus closed");
        events.push(event);
    }
    events
}

#[tokio::test(start_paused = true)]
async fn test_same_fingerprint_submits_one_job() {
    let provider = Arc::new(FakeProvider::default());
    let pipeline = pipeline(provider.clone(), 60_000, Arc::new(SystemClock::new()));
    let mut events = pipeline.subscribe();

    // 只有大小写和空白差异，指纹相同
    let items = vec![
        item("a", "Tokio"),
        AnnotationItem::new("b", "  tokio ", "A  Snippet", "http://www.example.com/Tokio/"),
        item("c", "Tokio"),
    ];
    let queued = pipeline.enqueue(items, JobPriority::Normal).unwrap();
    assert!(matches!(queued[0].disposition, QueueDisposition::Submitted { .. }));
    assert!(matches!(queued[1].disposition, QueueDisposition::Joined { .. }));
    assert_eq!(queued[1].batch_id(), queued[0].batch_id());
    assert_eq!(queued[2].batch_id(), queued[0].batch_id());

    let received = next_events(&mut events, 3).await;
    let mut ids: Vec<&str> = received
        .iter()
        .map(|event| {
            assert!(matches!(event, AnnotationEvent::Processed { .. }));
            event.item_id()
        })
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert_eq!(provider.calls(), 1);

    let stats = pipeline.stats();
    assert_eq!(stats.processed, 3);
    assert_eq!(stats.deduplicated, 2);
    assert_eq!(stats.cache_misses, 3);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_annotate_calls_share_one_provider_call() {
    let provider = Arc::new(FakeProvider::default());
    let pipeline = pipeline(provider.clone(), 60_000, Arc::new(SystemClock::new()));

    let handles: Vec<_> = (0..5)
        .map(|i| {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                pipeline
                    .annotate(item(&format!("item-{i}"), "shared"), JobPriority::High)
                    .await
            })
        })
        .collect();
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert!(!outcome.cached);
        assert_eq!(outcome.result.annotation["title"], "shared");
    }
    assert_eq!(provider.calls(), 1);

    let cached = pipeline
        .annotate(item("later", "shared"), JobPriority::Normal)
        .await
        .unwrap();
    assert!(cached.cached);
    assert_eq!(provider.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cache_ttl_expiry_triggers_new_call() {
    let provider = Arc::new(FakeProvider::default());
    let clock = Arc::new(ManualClock::default());
    let pipeline = pipeline(provider.clone(), 1_000, clock.clone());
    let mut events = pipeline.subscribe();

    pipeline
        .enqueue(vec![item("1", "ttl")], JobPriority::Normal)
        .unwrap();
    next_events(&mut events, 1).await;
    assert_eq!(provider.calls(), 1);

    clock.advance(Duration::from_millis(500));
    let queued = pipeline
        .enqueue(vec![item("2", "ttl")], JobPriority::Normal)
        .unwrap();
    assert_eq!(queued[0].disposition, QueueDisposition::Cached);
    let cached = next_events(&mut events, 1).await;
    assert!(matches!(cached[0], AnnotationEvent::Cached { .. }));
    assert_eq!(provider.calls(), 1);

    clock.advance(Duration::from_millis(1_000));
    let queued = pipeline
        .enqueue(vec![item("3", "ttl")], JobPriority::Normal)
        .unwrap();
    assert!(matches!(queued[0].disposition, QueueDisposition::Submitted { .. }));
    next_events(&mut events, 1).await;
    assert_eq!(provider.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_emit_failed_with_attempts() {
    let provider = Arc::new(FakeProvider::failing(ExecutionError::transient("503")));
    let pipeline = pipeline(provider.clone(), 60_000, Arc::new(SystemClock::new()));
    let mut events = pipeline.subscribe();

    pipeline
        .enqueue(vec![item("x", "boom"), item("y", "boom")], JobPriority::Normal)
        .unwrap();

    let received = next_events(&mut events, 2).await;
    for event in &received {
        match event {
            AnnotationEvent::Failed {
                error, attempts, ..
            } => {
                assert_eq!(*error, ExecutionError::transient("503"));
                assert_eq!(*attempts, 3);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(provider.calls(), 3);
    assert_eq!(pipeline.stats().failed, 2);
    assert_eq!(pipeline.cache_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_validation_error_is_not_retried() {
    let provider = Arc::new(FakeProvider::failing(ExecutionError::validation(
        "bad response",
    )));
    let pipeline = pipeline(provider.clone(), 60_000, Arc::new(SystemClock::new()));

    let error = pipeline
        .annotate(item("v", "invalid"), JobPriority::Normal)
        .await
        .unwrap_err();
    assert!(matches!(error, ExecutionError::Validation(_)));
    assert_eq!(provider.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_write_through_and_warm_cache() {
    let repository = Arc::new(MemoryCacheRepository::default());

    let first_provider = Arc::new(FakeProvider::default());
    let first = pipeline(first_provider.clone(), 60_000, Arc::new(SystemClock::new()))
        .with_repository(repository.clone());
    first
        .annotate(item("1", "persisted"), JobPriority::Normal)
        .await
        .unwrap();
    first.stop().await;
    assert_eq!(repository.entries.lock().unwrap().len(), 1);

    let second_provider = Arc::new(FakeProvider::default());
    let second = pipeline(second_provider.clone(), 60_000, Arc::new(SystemClock::new()))
        .with_repository(repository.clone());
    assert_eq!(second.warm_cache().await.unwrap(), 1);

    let queued = second
        .enqueue(vec![item("2", "persisted")], JobPriority::Normal)
        .unwrap();
    assert_eq!(queued[0].disposition, QueueDisposition::Cached);
    assert_eq!(second_provider.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_rejects_new_items() {
    let provider = Arc::new(FakeProvider::default());
    let pipeline = pipeline(provider, 60_000, Arc::new(SystemClock::new()));
    pipeline.stop().await;

    let error = pipeline
        .annotate(item("late", "stopped"), JobPriority::Normal)
        .await
        .unwrap_err();
    assert_eq!(error, ExecutionError::Cancelled);
}

fn drain_events(rx: &mut UnboundedReceiver<AnnotationEvent>) -> Vec<AnnotationEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_items_wait_instead_of_failing() {
    let provider = Arc::new(FakeProvider::default());
    let config = AnnotationConfig {
        batch_size: 1,
        requests_per_minute: 1,
        ..annotation_config(60_000)
    };
    let queue_config = QueueConfig {
        max_retries: 0,
        ..queue_config()
    };
    let pipeline = AnnotationPipeline::new(
        config,
        queue_config,
        provider.clone(),
        Arc::new(SystemClock::new()),
    );
    pipeline.start();
    let mut events = pipeline.subscribe();

    let started = tokio::time::Instant::now();
    pipeline
        .enqueue(
            vec![item("1", "first"), item("2", "second"), item("3", "third")],
            JobPriority::Normal,
        )
        .unwrap();

    let received = next_events(&mut events, 3).await;
    assert!(received
        .iter()
        .all(|event| matches!(event, AnnotationEvent::Processed { .. })));
    assert_eq!(provider.calls(), 3);
    // 每分钟一次请求，第三次调用至少在两分钟后
    assert!(started.elapsed() >= Duration::from_secs(120));
    assert_eq!(pipeline.stats().failed, 0);
    assert_eq!(pipeline.queue_stats().failed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_misses_fill_batches_beyond_queue_concurrency() {
    let provider = Arc::new(FakeProvider::default());
    let config = AnnotationConfig {
        batch_size: 10,
        ..annotation_config(60_000)
    };
    let pipeline = AnnotationPipeline::new(
        config,
        queue_config(),
        provider.clone(),
        Arc::new(SystemClock::new()),
    );
    pipeline.start();
    let mut events = pipeline.subscribe();

    let started = tokio::time::Instant::now();
    let items: Vec<AnnotationItem> = (0..10)
        .map(|i| item(&format!("item-{i}"), &format!("title-{i}")))
        .collect();
    let queued = pipeline.enqueue(items, JobPriority::Normal).unwrap();
    assert!(queued
        .iter()
        .all(|queued| matches!(queued.disposition, QueueDisposition::Submitted { .. })));
    assert!(queued
        .windows(2)
        .all(|pair| pair[0].batch_id() == pair[1].batch_id()));

    next_events(&mut events, 10).await;
    assert_eq!(provider.batch_sizes(), vec![10]);
    // 满批立即提交，不等待攒批间隔
    assert!(started.elapsed() < Duration::from_millis(100));

    // 超过批次大小的条目拆成多个满批，余下的部分在间隔后提交
    let items: Vec<AnnotationItem> = (0..12)
        .map(|i| item(&format!("more-{i}"), &format!("more-{i}")))
        .collect();
    pipeline.enqueue(items, JobPriority::Normal).unwrap();
    next_events(&mut events, 12).await;
    assert_eq!(provider.batch_sizes(), vec![10, 10, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_pending_items_without_failures() {
    let provider = Arc::new(FakeProvider::default());
    let queue_config = QueueConfig {
        concurrency: 1,
        ..queue_config()
    };
    let pipeline = AnnotationPipeline::new(
        annotation_config(60_000),
        queue_config,
        provider.clone(),
        Arc::new(SystemClock::new()),
    );
    pipeline.start();
    let mut events = pipeline.subscribe();

    // 两个满批进入队列，再加两条尚未凑满的条目
    let items: Vec<AnnotationItem> = (0..12)
        .map(|i| item(&format!("item-{i}"), &format!("title-{i}")))
        .collect();
    pipeline.enqueue(items, JobPriority::Normal).unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(provider.calls(), 1);

    pipeline.stop().await;

    let received = drain_events(&mut events);
    assert_eq!(received.len(), 12);
    assert!(!received
        .iter()
        .any(|event| matches!(event, AnnotationEvent::Failed { .. })));
    let processed = received
        .iter()
        .filter(|event| matches!(event, AnnotationEvent::Processed { .. }))
        .count();
    let cancelled = received
        .iter()
        .filter(|event| matches!(event, AnnotationEvent::Cancelled { .. }))
        .count();
    assert_eq!(processed, 5);
    assert_eq!(cancelled, 7);

    let stats = pipeline.stats();
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(pipeline.queue_stats().cancelled, 1);
}
