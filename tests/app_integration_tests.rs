use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use serpline::core::config::{AnnotationConfig, AppConfig, CollectionConfig};
use serpline::core::errors::ExecutionError;
use serpline::core::models::{
    AlertFilter, AnnotationRequest, AnnotationResponse, CycleConfig, CycleStatus, HealthStatus,
    JobPriority, JobState, Query, RotationStrategy, SearchResult,
};
use serpline::core::traits::{
    AnnotationProvider, Collector, CycleExecutionRepository, JobRepository, QuerySource,
};
use serpline::infrastructure::{InMemoryCycleExecutionRepository, InMemoryJobRepository};
use serpline::{Application, Capabilities, Repositories};

/// 同一查询在不同引擎上返回相同内容
struct EchoCollector {
    latency: Duration,
    fail: bool,
    calls: AtomicUsize,
}

impl EchoCollector {
    fn new(latency_ms: u64, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            latency: Duration::from_millis(latency_ms),
            fail,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Collector for EchoCollector {
    async fn collect(
        &self,
        engine: &str,
        query: &Query,
    ) -> Result<Vec<SearchResult>, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        if self.fail {
            return Err(ExecutionError::validation("blocked by engine"));
        }
        Ok(vec![SearchResult {
            engine: engine.to_string(),
            query_id: query.id.clone(),
            rank: 1,
            title: format!("Result for {}", query.text),
            snippet: "shared snippet".to_string(),
            url: format!("https://example.com/{}", query.id),
        }])
    }
}

struct SeedQueries;

#[async_trait]
impl QuerySource for SeedQueries {
    async fn load_queries(&self, source_id: &str) -> Result<Vec<Query>, ExecutionError> {
        if source_id != "seed" {
            return Err(ExecutionError::configuration(format!(
                "unknown query source {source_id}"
            )));
        }
        Ok((0..3)
            .map(|i| Query::new(format!("q{i}"), format!("query {i}")))
            .collect())
    }
}

#[derive(Default)]
struct RecordingProvider {
    annotated: Mutex<Vec<String>>,
}

#[async_trait]
impl AnnotationProvider for RecordingProvider {
    async fn annotate(
        &self,
        batch: &[AnnotationRequest],
    ) -> Result<Vec<AnnotationResponse>, ExecutionError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut annotated = self.annotated.lock().unwrap();
        Ok(batch
            .iter()
            .map(|request| {
                annotated.push(request.fingerprint.as_str().to_string());
                AnnotationResponse {
                    fingerprint: request.fingerprint.clone(),
                    annotation: json!({"relevant": true}),
                    model: Some("fake".to_string()),
                }
            })
            .collect())
    }
}

fn app_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.annotation = AnnotationConfig {
        batch_size: 10,
        processing_interval_ms: 50,
        requests_per_minute: 1_000,
        tokens_per_minute: 1_000_000,
        estimated_tokens_per_item: 10,
        request_timeout_ms: 5_000,
        ..Default::default()
    };
    config.collection = CollectionConfig {
        max_concurrent_collections: 4,
        retry_delay_ms: 10,
        ..Default::default()
    };
    config
}

fn cycle(per_engine_timeout_ms: u64) -> CycleConfig {
    CycleConfig {
        id: "daily".to_string(),
        name: "Daily".to_string(),
        query_source_id: "seed".to_string(),
        engines: vec!["engine-a".to_string(), "engine-b".to_string()],
        query_count: 3,
        rotation_strategy: RotationStrategy::Sequential,
        priority: JobPriority::High,
        retry_attempts: 0,
        per_engine_timeout_ms,
    }
}

fn capabilities(collector: Arc<EchoCollector>, provider: Arc<RecordingProvider>) -> Capabilities {
    Capabilities {
        collector,
        query_source: Arc::new(SeedQueries),
        annotation_provider: Some(provider),
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test(start_paused = true)]
async fn test_collected_results_are_annotated_once_per_fingerprint() {
    let collector = EchoCollector::new(10, false);
    let provider = Arc::new(RecordingProvider::default());
    let jobs = Arc::new(InMemoryJobRepository::new());
    let executions = Arc::new(InMemoryCycleExecutionRepository::new());
    let app = Application::new(
        app_config(),
        capabilities(collector.clone(), provider.clone()),
        Repositories {
            jobs: Some(jobs.clone()),
            cycle_executions: Some(executions.clone()),
            ..Default::default()
        },
    )
    .unwrap();
    app.start().await.unwrap();

    app.orchestrator().register_cycle(cycle(1_000)).unwrap();
    let execution_id = app.orchestrator().execute_cycle("daily").await.unwrap();
    let execution = app
        .orchestrator()
        .wait_for_execution(execution_id)
        .await
        .unwrap();
    assert_eq!(execution.status, CycleStatus::Completed);
    assert_eq!(execution.progress.completed_queries, 6);
    assert_eq!(collector.calls.load(Ordering::SeqCst), 6);

    // 两个引擎返回相同内容，每个查询只标注一次
    let pipeline = app.pipeline().clone();
    wait_until(|| {
        let stats = pipeline.stats();
        stats.processed + stats.cache_hits == 6
    })
    .await;
    let annotated = provider.annotated.lock().unwrap().clone();
    assert_eq!(annotated.len(), 3);
    assert_eq!(annotated.iter().collect::<HashSet<_>>().len(), 3);

    // 三个指纹在同一个攒批间隔内到达，合成一个队列任务
    let mut records = Vec::new();
    for _ in 0..500 {
        records = jobs.list().await.unwrap();
        if records.len() == 1 && records.iter().all(|r| r.state == JobState::Succeeded) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(records.len(), 1);
    assert!(records.iter().all(|r| r.state == JobState::Succeeded));
    assert!(records.iter().all(|r| r.priority == JobPriority::High));

    let stored = executions.find(execution_id).await.unwrap().unwrap();
    assert_eq!(stored.status, CycleStatus::Completed);

    let alerts = app.sample_metrics().await;
    assert!(alerts.is_empty());
    let health = app.monitoring().get_system_health();
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.components.len(), 2);
    let latest = app.monitoring().latest_metrics().unwrap();
    assert_eq!(latest.collection.completed_queries, 6);
    assert_eq!(latest.scheduler.succeeded, 1);

    app.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_collection_raises_alert_on_sample() {
    let collector = EchoCollector::new(5, true);
    let app = Application::new(
        app_config(),
        capabilities(collector, Arc::new(RecordingProvider::default())),
        Repositories::default(),
    )
    .unwrap();
    app.start().await.unwrap();

    app.orchestrator().register_cycle(cycle(1_000)).unwrap();
    let execution_id = app.orchestrator().execute_cycle("daily").await.unwrap();
    let execution = app
        .orchestrator()
        .wait_for_execution(execution_id)
        .await
        .unwrap();
    assert_eq!(execution.status, CycleStatus::Failed);

    let created = app.sample_metrics().await;
    assert_eq!(created.len(), 1);
    let alerts = app.monitoring().get_alerts(&AlertFilter {
        source: Some("collection_metrics".to_string()),
        ..Default::default()
    });
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].message.contains("0.0%"));

    app.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_running_collection() {
    let collector = EchoCollector::new(10_000, false);
    let app = Application::new(
        app_config(),
        capabilities(collector, Arc::new(RecordingProvider::default())),
        Repositories::default(),
    )
    .unwrap();
    app.start().await.unwrap();

    app.orchestrator().register_cycle(cycle(60_000)).unwrap();
    let execution_id = app.orchestrator().execute_cycle("daily").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    app.shutdown().await;
    let execution = app.orchestrator().get_execution(execution_id).unwrap();
    assert_eq!(execution.status, CycleStatus::Cancelled);
    assert!(app.shutdown_manager().is_shutdown().await);

    // 重复关闭无效果
    app.shutdown().await;
}

#[test]
fn test_missing_annotation_provider_is_rejected() {
    let result = Application::new(
        AppConfig::default(),
        Capabilities {
            collector: EchoCollector::new(0, false),
            query_source: Arc::new(SeedQueries),
            annotation_provider: None,
        },
        Repositories::default(),
    );
    assert!(result.is_err());
}
