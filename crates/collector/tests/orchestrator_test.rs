use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mockall::{mock, Sequence};
use serpline_collector::CollectionOrchestrator;
use serpline_core::clock::SystemClock;
use serpline_core::config::CollectionConfig;
use serpline_core::errors::{ExecutionError, SerplineError};
use serpline_core::events::CycleEvent;
use serpline_core::models::{CycleConfig, CycleStatus, Query, RotationStrategy, SearchResult};
use serpline_core::traits::{Collector, QuerySource};
use tokio::sync::mpsc::UnboundedReceiver;

mock! {
    pub Collector {}

    #[async_trait]
    impl Collector for Collector {
        async fn collect(&self, engine: &str, query: &Query) -> Result<Vec<SearchResult>, ExecutionError>;
    }
}

/// 固定的查询源，未知的源返回配置错误
struct StaticQuerySource {
    sources: HashMap<String, Vec<Query>>,
}

impl StaticQuerySource {
    fn with(source_id: &str, count: usize) -> Self {
        let queries = (0..count)
            .map(|i| Query::new(format!("q{i}"), format!("query {i}")))
            .collect();
        Self {
            sources: HashMap::from([(source_id.to_string(), queries)]),
        }
    }
}

#[async_trait]
impl QuerySource for StaticQuerySource {
    async fn load_queries(&self, source_id: &str) -> Result<Vec<Query>, ExecutionError> {
        self.sources
            .get(source_id)
            .cloned()
            .ok_or_else(|| ExecutionError::configuration(format!("unknown query source {source_id}")))
    }
}

/// 前 `failures` 次加载返回临时错误，之后返回固定的查询
struct FlakyQuerySource {
    failures: usize,
    calls: AtomicUsize,
}

impl FlakyQuerySource {
    fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl QuerySource for FlakyQuerySource {
    async fn load_queries(&self, _source_id: &str) -> Result<Vec<Query>, ExecutionError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(ExecutionError::transient("source connection reset"));
        }
        Ok(vec![Query::new("q0", "query 0")])
    }
}

/// 每次调用耗时 `latency`，`failing_engine` 上总是返回临时错误
struct FakeCollector {
    latency: Duration,
    failing_engine: Option<String>,
    calls: AtomicUsize,
}

impl FakeCollector {
    fn new(latency_ms: u64, failing_engine: Option<&str>) -> Self {
        Self {
            latency: Duration::from_millis(latency_ms),
            failing_engine: failing_engine.map(str::to_string),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Collector for FakeCollector {
    async fn collect(&self, engine: &str, query: &Query) -> Result<Vec<SearchResult>, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        if self.failing_engine.as_deref() == Some(engine) {
            return Err(ExecutionError::transient(format!("{engine} unavailable")));
        }
        Ok(vec![result(engine, query, 1), result(engine, query, 2)])
    }
}

fn result(engine: &str, query: &Query, rank: u32) -> SearchResult {
    SearchResult {
        engine: engine.to_string(),
        query_id: query.id.clone(),
        rank,
        title: format!("{} result {rank}", query.text),
        snippet: "snippet".to_string(),
        url: format!("https://{engine}.example/{}/{rank}", query.id),
    }
}

fn collection_config(max_concurrent: usize) -> CollectionConfig {
    CollectionConfig {
        max_concurrent_collections: max_concurrent,
        retry_delay_ms: 100,
        backoff_multiplier: 2.0,
        max_retry_delay_ms: 1_000,
        min_success_rate: None,
    }
}

fn cycle(engines: &[&str], query_count: usize, retry_attempts: u32) -> CycleConfig {
    CycleConfig {
        id: "daily".to_string(),
        name: "Daily SERP".to_string(),
        query_source_id: "seed".to_string(),
        engines: engines.iter().map(|e| e.to_string()).collect(),
        query_count,
        rotation_strategy: RotationStrategy::Sequential,
        priority: Default::default(),
        retry_attempts,
        per_engine_timeout_ms: 1_000,
    }
}

fn orchestrator(
    config: CollectionConfig,
    collector: Arc<dyn Collector>,
    queries: usize,
) -> CollectionOrchestrator {
    CollectionOrchestrator::new(
        config,
        collector,
        Arc::new(StaticQuerySource::with("seed", queries)),
        Arc::new(SystemClock::new()),
    )
}

fn drain(rx: &mut UnboundedReceiver<CycleEvent>) -> Vec<CycleEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(start_paused = true)]
async fn test_failing_engine_does_not_fail_cycle() {
    let collector = Arc::new(FakeCollector::new(10, Some("engine-b")));
    let orchestrator = orchestrator(collection_config(4), collector.clone(), 3);
    orchestrator
        .register_cycle(cycle(&["engine-a", "engine-b"], 3, 1))
        .unwrap();
    let mut events = orchestrator.subscribe();

    let id = orchestrator.execute_cycle("daily").await.unwrap();
    let execution = orchestrator.wait_for_execution(id).await.unwrap();

    assert_eq!(execution.status, CycleStatus::Completed);
    assert_eq!(execution.progress.total_queries, 6);
    assert_eq!(execution.progress.completed_queries, 3);
    assert_eq!(execution.progress.failed_queries, 3);
    assert_eq!(execution.progress.total_results, 6);
    assert_eq!(execution.errors.len(), 3);
    assert!(execution.errors.iter().all(|e| e.engine == "engine-b"));
    // engine-b 每个组合尝试两次
    assert_eq!(collector.calls.load(Ordering::SeqCst), 3 + 3 * 2);

    let events = drain(&mut events);
    let collected = events
        .iter()
        .filter(|e| matches!(e, CycleEvent::QueryCollected { .. }))
        .count();
    let failed = events
        .iter()
        .filter(|e| matches!(e, CycleEvent::QueryFailed { .. }))
        .count();
    assert_eq!((collected, failed), (3, 3));
    assert!(matches!(events.first(), Some(CycleEvent::Started { .. })));
    assert!(matches!(events.last(), Some(CycleEvent::Completed { .. })));

    let stats = orchestrator.collection_stats();
    assert_eq!(stats.completed_queries, 3);
    assert_eq!(stats.failed_queries, 3);
}

#[tokio::test(start_paused = true)]
async fn test_all_pairs_failing_fails_execution() {
    let collector = Arc::new(FakeCollector::new(10, Some("engine-b")));
    let orchestrator = orchestrator(collection_config(4), collector, 2);
    orchestrator.register_cycle(cycle(&["engine-b"], 2, 0)).unwrap();

    let id = orchestrator.execute_cycle("daily").await.unwrap();
    let execution = orchestrator.wait_for_execution(id).await.unwrap();
    assert_eq!(execution.status, CycleStatus::Failed);
    assert_eq!(execution.progress.failed_queries, 2);
    assert!(execution.error.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_min_success_rate_policy() {
    let collector = Arc::new(FakeCollector::new(10, Some("engine-b")));
    let config = CollectionConfig {
        min_success_rate: Some(0.8),
        ..collection_config(4)
    };
    let orchestrator = orchestrator(config, collector, 2);
    orchestrator
        .register_cycle(cycle(&["engine-a", "engine-b"], 2, 0))
        .unwrap();

    let id = orchestrator.execute_cycle("daily").await.unwrap();
    let execution = orchestrator.wait_for_execution(id).await.unwrap();
    assert_eq!(execution.status, CycleStatus::Failed);
    assert!(execution.error.unwrap().contains("50.0%"));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_new_dispatch() {
    let collector = Arc::new(FakeCollector::new(100, None));
    let orchestrator = orchestrator(collection_config(2), collector.clone(), 5);
    orchestrator.register_cycle(cycle(&["engine-a"], 5, 0)).unwrap();
    let mut events = orchestrator.subscribe();

    let id = orchestrator.execute_cycle("daily").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(orchestrator.cancel_collection_cycle(id).await);
    // 终态不能再次取消
    assert!(!orchestrator.cancel_collection_cycle(id).await);

    let execution = orchestrator.wait_for_execution(id).await.unwrap();
    assert_eq!(execution.status, CycleStatus::Cancelled);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(collector.calls.load(Ordering::SeqCst), 2);

    // 进行中的调用结果被丢弃
    let after = orchestrator.get_execution(id).unwrap();
    assert_eq!(after.status, CycleStatus::Cancelled);
    assert_eq!(after.progress.completed_queries, 0);

    let events = drain(&mut events);
    assert!(matches!(events.last(), Some(CycleEvent::Cancelled { .. })));
    assert!(!events
        .iter()
        .any(|e| matches!(e, CycleEvent::QueryCollected { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_query_source_records_failed_execution() {
    let collector = Arc::new(FakeCollector::new(10, None));
    let orchestrator = orchestrator(collection_config(2), collector.clone(), 3);
    let mut config = cycle(&["engine-a"], 3, 0);
    config.query_source_id = "missing".to_string();
    orchestrator.register_cycle(config).unwrap();
    let mut events = orchestrator.subscribe();

    let error = orchestrator.execute_cycle("daily").await.unwrap_err();
    assert!(matches!(error, SerplineError::Configuration(_)));

    let executions = orchestrator.list_executions(Some("daily"));
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, CycleStatus::Failed);
    assert!(matches!(
        drain(&mut events).as_slice(),
        [CycleEvent::Failed { .. }]
    ));
    assert_eq!(collector.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_query_source_error_is_retried() {
    let source = Arc::new(FlakyQuerySource::new(2));
    let collector = Arc::new(FakeCollector::new(10, None));
    let orchestrator = CollectionOrchestrator::new(
        collection_config(1),
        collector.clone(),
        source.clone(),
        Arc::new(SystemClock::new()),
    );
    orchestrator.register_cycle(cycle(&["engine-a"], 1, 2)).unwrap();

    let id = orchestrator.execute_cycle("daily").await.unwrap();
    let execution = orchestrator.wait_for_execution(id).await.unwrap();
    assert_eq!(execution.status, CycleStatus::Completed);
    assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    assert_eq!(collector.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_query_source_is_not_a_configuration_error() {
    let source = Arc::new(FlakyQuerySource::new(usize::MAX));
    let collector = Arc::new(FakeCollector::new(10, None));
    let orchestrator = CollectionOrchestrator::new(
        collection_config(1),
        collector.clone(),
        source.clone(),
        Arc::new(SystemClock::new()),
    );
    orchestrator.register_cycle(cycle(&["engine-a"], 1, 1)).unwrap();
    let mut events = orchestrator.subscribe();

    let error = orchestrator.execute_cycle("daily").await.unwrap_err();
    assert!(
        matches!(error, SerplineError::QuerySourceUnavailable { ref id, .. } if id == "seed"),
        "unexpected error: {error:?}"
    );
    // 首次加载 + 1 次重试
    assert_eq!(source.calls.load(Ordering::SeqCst), 2);

    let executions = orchestrator.list_executions(Some("daily"));
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, CycleStatus::Failed);
    assert!(matches!(
        drain(&mut events).as_slice(),
        [CycleEvent::Failed { .. }]
    ));
    assert_eq!(collector.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_cycle_and_invalid_config() {
    let collector = Arc::new(FakeCollector::new(10, None));
    let orchestrator = orchestrator(collection_config(2), collector, 3);

    let error = orchestrator.execute_cycle("nope").await.unwrap_err();
    assert!(matches!(error, SerplineError::CycleNotFound { .. }));

    let mut invalid = cycle(&["engine-a"], 3, 0);
    invalid.engines.clear();
    assert!(matches!(
        orchestrator.register_cycle(invalid),
        Err(SerplineError::Configuration(_))
    ));

    orchestrator.register_cycle(cycle(&["engine-a"], 3, 0)).unwrap();
    assert_eq!(orchestrator.list_cycles().len(), 1);
    assert!(orchestrator.unregister_cycle("daily"));
    assert!(orchestrator.get_cycle("daily").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_sequential_rotation_across_executions() {
    let collector = Arc::new(FakeCollector::new(1, None));
    let orchestrator = orchestrator(collection_config(2), collector, 4);
    orchestrator.register_cycle(cycle(&["engine-a"], 3, 0)).unwrap();
    let mut events = orchestrator.subscribe();

    for _ in 0..2 {
        let id = orchestrator.execute_cycle("daily").await.unwrap();
        orchestrator.wait_for_execution(id).await.unwrap();
    }

    let mut per_execution: HashMap<String, Vec<String>> = HashMap::new();
    for event in drain(&mut events) {
        if let CycleEvent::QueryCollected {
            execution, query, ..
        } = event
        {
            per_execution
                .entry(execution.id.to_string())
                .or_default()
                .push(query.id);
        }
    }
    let mut selections: Vec<Vec<String>> = per_execution
        .into_values()
        .map(|mut ids| {
            ids.sort();
            ids
        })
        .collect();
    selections.sort();
    assert_eq!(
        selections,
        vec![
            vec!["q0".to_string(), "q1".to_string(), "q2".to_string()],
            vec!["q0".to_string(), "q1".to_string(), "q3".to_string()],
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_transient_error_retried_then_collected() {
    let mut collector = MockCollector::new();
    let mut sequence = Sequence::new();
    collector
        .expect_collect()
        .times(1)
        .in_sequence(&mut sequence)
        .returning(|_, _| Err(ExecutionError::transient("rate limited")));
    collector
        .expect_collect()
        .times(1)
        .in_sequence(&mut sequence)
        .returning(|engine, query| Ok(vec![result(engine, query, 1)]));

    let orchestrator = orchestrator(collection_config(1), Arc::new(collector), 1);
    orchestrator.register_cycle(cycle(&["engine-a"], 1, 2)).unwrap();

    let id = orchestrator.execute_cycle("daily").await.unwrap();
    let execution = orchestrator.wait_for_execution(id).await.unwrap();
    assert_eq!(execution.status, CycleStatus::Completed);
    assert_eq!(execution.progress.completed_queries, 1);
    assert_eq!(execution.progress.total_results, 1);
}

#[tokio::test(start_paused = true)]
async fn test_validation_error_is_not_retried() {
    let mut collector = MockCollector::new();
    collector
        .expect_collect()
        .times(2)
        .returning(|engine, query| match engine {
            "engine-a" => Ok(vec![result(engine, query, 1)]),
            _ => Err(ExecutionError::validation("malformed page")),
        });

    let orchestrator = orchestrator(collection_config(2), Arc::new(collector), 1);
    orchestrator
        .register_cycle(cycle(&["engine-a", "engine-b"], 1, 3))
        .unwrap();

    let id = orchestrator.execute_cycle("daily").await.unwrap();
    let execution = orchestrator.wait_for_execution(id).await.unwrap();
    assert_eq!(execution.status, CycleStatus::Completed);
    assert_eq!(execution.progress.failed_queries, 1);
    assert!(execution.errors[0].message.contains("malformed page"));
}

#[tokio::test(start_paused = true)]
async fn test_slow_engine_times_out() {
    let collector = Arc::new(FakeCollector::new(5_000, None));
    let orchestrator = orchestrator(collection_config(2), collector.clone(), 1);
    orchestrator.register_cycle(cycle(&["engine-a"], 1, 1)).unwrap();

    let id = orchestrator.execute_cycle("daily").await.unwrap();
    let execution = orchestrator.wait_for_execution(id).await.unwrap();
    assert_eq!(execution.status, CycleStatus::Failed);
    assert_eq!(collector.calls.load(Ordering::SeqCst), 2);
    assert!(execution.errors[0].message.contains("1000"));
}
