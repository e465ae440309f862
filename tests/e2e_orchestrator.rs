//! End-to-end tests for retry, fallback, dispatch and metrics.
//!
//! Providers are scripted `MockProvider`s registered under custom types, so
//! every scenario runs without network access.

use std::sync::Arc;
use std::time::Duration;

use docmeta_llm::{
    ChainStatus, CompletionRequest, DefaultsConfig, Dispatcher, ExtractionJob, FailureKind,
    FallbackChain, FallbackOrchestrator, LlmError, MemorySink, MetricsAggregator, MockProvider,
    MockReply, ModelSpec, OrchestratorConfig, ProviderConfig, ProviderRegistry, RetryConfig,
    RetryPolicy,
};

fn rate_limited() -> MockReply {
    MockReply::Fail(LlmError::RateLimited("HTTP 429: slow down".to_string()))
}

fn unavailable() -> MockReply {
    MockReply::Fail(LlmError::ProviderUnavailable("HTTP 503".to_string()))
}

/// Registry with `cloud-a` serving `m1` (cost 0.002/1k) and `local-b` serving `m2`.
fn registry(cloud: MockProvider, local: MockProvider) -> Arc<ProviderRegistry> {
    let config = OrchestratorConfig {
        max_workers: 5,
        retry: RetryConfig::default(),
        defaults: DefaultsConfig {
            provider: "cloud-a".to_string(),
            model: Some("m1".to_string()),
            fallback_provider: Some("local-b".to_string()),
            fallback_model: Some("m2".to_string()),
            fallbacks: Vec::new(),
        },
        providers: vec![
            ProviderConfig::new("cloud-a", "https://cloud.example/api/v1")
                .with_model(ModelSpec::new("m1").with_cost(0.002).with_max_tokens(2048)),
            ProviderConfig::new("local-b", "http://localhost:1234/v1")
                .with_model(ModelSpec::new("m2")),
        ],
    };

    let registry = ProviderRegistry::builder()
        .register("cloud-a", move |_| Ok(Arc::new(cloud.clone()) as _))
        .unwrap()
        .register("local-b", move |_| Ok(Arc::new(local.clone()) as _))
        .unwrap()
        .build(&config)
        .unwrap();
    Arc::new(registry)
}

fn orchestrator(
    registry: Arc<ProviderRegistry>,
    metrics: Arc<MetricsAggregator>,
    max_attempts: u32,
) -> FallbackOrchestrator {
    let retry = RetryPolicy::new()
        .silent()
        .with_max_attempts(max_attempts)
        .with_base_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(5));
    FallbackOrchestrator::new(registry, metrics, retry)
}

fn chain() -> FallbackChain {
    FallbackChain::new("cloud-a", "m1").then("local-b", "m2")
}

fn request() -> CompletionRequest {
    CompletionRequest::new("Invoice 2024-113 from ACME", "Return JSON with title and date")
}

#[tokio::test]
async fn test_rate_limited_twice_then_success_on_primary() {
    let cloud = MockProvider::new("cloud-a").with_script([rate_limited(), rate_limited()]);
    let local = MockProvider::new("local-b").local();
    let metrics = Arc::new(MetricsAggregator::new());
    let orchestrator = orchestrator(registry(cloud.clone(), local.clone()), metrics.clone(), 3);

    let outcome = orchestrator.complete(&chain(), &request(), None).await;

    assert!(outcome.is_success());
    assert_eq!(outcome.status, ChainStatus::Primary);
    assert_eq!(outcome.link, 1);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.result.provider, "cloud-a");
    assert_eq!(outcome.result.model, "m1");
    assert_eq!(cloud.calls(), 3);
    assert_eq!(local.calls(), 0);

    let snapshot = metrics.snapshot().await;
    let totals = snapshot.totals("cloud-a", "m1").unwrap();
    assert_eq!(totals.attempts, 3);
    assert_eq!(totals.successes, 1);
    // 150 tokens at 0.002 per 1k on the successful attempt only.
    assert!((totals.cost_estimate - 0.0003).abs() < 1e-12);
}

#[tokio::test]
async fn test_primary_unavailable_falls_back_to_local() {
    let cloud = MockProvider::new("cloud-a").with_default_reply(unavailable());
    let local = MockProvider::new("local-b").local();
    let metrics = Arc::new(MetricsAggregator::new());
    let orchestrator = orchestrator(registry(cloud.clone(), local.clone()), metrics.clone(), 3);

    let outcome = orchestrator.complete(&chain(), &request(), None).await;

    assert!(outcome.is_success());
    assert_eq!(outcome.status, ChainStatus::ViaFallback);
    assert_eq!(outcome.link, 2);
    assert_eq!(outcome.attempts, 4);
    assert_eq!(outcome.result.provider, "local-b");
    assert_eq!(outcome.result.model, "m2");

    let snapshot = metrics.snapshot().await;
    let cloud_totals = snapshot.totals("cloud-a", "m1").unwrap();
    assert_eq!(cloud_totals.attempts, 3);
    assert_eq!(cloud_totals.successes, 0);
    let local_totals = snapshot.totals("local-b", "m2").unwrap();
    assert_eq!(local_totals.attempts, 1);
    assert_eq!(local_totals.successes, 1);
    assert_eq!(local_totals.cost_estimate, 0.0);
}

#[tokio::test]
async fn test_both_links_exhausted_reports_fallback_kind() {
    let cloud = MockProvider::new("cloud-a").with_default_reply(unavailable());
    let local = MockProvider::new("local-b").with_default_reply(rate_limited());
    let metrics = Arc::new(MetricsAggregator::new());
    let orchestrator = orchestrator(registry(cloud, local), metrics.clone(), 2);

    let outcome = orchestrator.complete(&chain(), &request(), None).await;

    assert!(!outcome.is_success());
    assert_eq!(outcome.status, ChainStatus::Exhausted(FailureKind::RateLimit));
    assert_eq!(outcome.link, 2);
    assert_eq!(outcome.attempts, 4);
    assert_eq!(outcome.result.failure_kind(), Some(FailureKind::RateLimit));
    assert_eq!(metrics.total_attempts().await, 4);
}

#[tokio::test]
async fn test_always_rate_limited_uses_exactly_n_attempts_per_link() {
    for n in [1, 3, 5] {
        let cloud = MockProvider::new("cloud-a").with_default_reply(rate_limited());
        let local = MockProvider::new("local-b");
        let metrics = Arc::new(MetricsAggregator::new());
        let orchestrator = orchestrator(registry(cloud.clone(), local), metrics, n);

        let outcome = orchestrator.complete(&chain(), &request(), None).await;

        assert_eq!(cloud.calls(), n as usize);
        assert_eq!(outcome.status, ChainStatus::ViaFallback);
        assert_eq!(outcome.attempts, n + 1);
    }
}

#[tokio::test]
async fn test_auth_and_config_errors_are_not_retried() {
    for error in [
        LlmError::AuthError("HTTP 401: invalid key".to_string()),
        LlmError::ConfigError("model not served".to_string()),
    ] {
        let cloud = MockProvider::new("cloud-a").with_default_reply(MockReply::Fail(error));
        let local = MockProvider::new("local-b");
        let metrics = Arc::new(MetricsAggregator::new());
        let orchestrator = orchestrator(registry(cloud.clone(), local.clone()), metrics, 5);

        let outcome = orchestrator.complete(&chain(), &request(), None).await;

        assert_eq!(cloud.calls(), 1);
        assert_eq!(local.calls(), 1);
        assert_eq!(outcome.link, 2);
        assert!(outcome.is_success());
    }
}

#[tokio::test]
async fn test_validation_failure_charges_tokens_and_advances() {
    let cloud = MockProvider::new("cloud-a")
        .with_default_reply(MockReply::Content("I cannot help with that.".to_string()));
    let local = MockProvider::new("local-b");
    let metrics = Arc::new(MetricsAggregator::new());
    let orchestrator = orchestrator(registry(cloud.clone(), local), metrics.clone(), 3);

    let outcome = orchestrator.complete(&chain(), &request(), None).await;

    assert_eq!(cloud.calls(), 1);
    assert_eq!(outcome.status, ChainStatus::ViaFallback);

    let records = metrics.records().await;
    assert_eq!(records.len(), 2);
    assert!(!records[0].success);
    assert_eq!(records[0].failure_kind, Some(FailureKind::Validation));
    assert!(records[0].cost_estimate > 0.0);
}

#[tokio::test]
async fn test_unresolvable_link_is_skipped() {
    let cloud = MockProvider::new("cloud-a").with_default_reply(unavailable());
    let local = MockProvider::new("local-b");
    let metrics = Arc::new(MetricsAggregator::new());
    let orchestrator = orchestrator(registry(cloud, local), metrics, 1);

    let chain = FallbackChain::new("nowhere", "m0").then("local-b", "m2");
    let outcome = orchestrator.complete(&chain, &request(), None).await;

    assert_eq!(outcome.status, ChainStatus::ViaFallback);
    assert_eq!(outcome.link, 2);
    assert_eq!(outcome.attempts, 1);

    let chain = FallbackChain::new("local-b", "m2").then("nowhere", "m0");
    let outcome = orchestrator.complete(&chain, &request(), None).await;
    assert_eq!(outcome.status, ChainStatus::Primary);
}

#[tokio::test]
async fn test_unknown_model_link_is_skipped_without_recording() {
    let cloud = MockProvider::new("cloud-a");
    let local = MockProvider::new("local-b");
    let metrics = Arc::new(MetricsAggregator::new());
    let orchestrator = orchestrator(registry(cloud.clone(), local.clone()), metrics.clone(), 3);

    let outcome = orchestrator
        .complete(&FallbackChain::new("cloud-a", "not-a-model"), &request(), None)
        .await;

    assert_eq!(outcome.status, ChainStatus::Exhausted(FailureKind::Config));
    assert_eq!(outcome.attempts, 0);
    assert!(outcome.result.error().unwrap().to_string().contains("not-a-model"));
    assert_eq!(cloud.calls(), 0);

    let chain = FallbackChain::new("cloud-a", "not-a-model").then("local-b", "m2");
    let outcome = orchestrator.complete(&chain, &request(), None).await;
    assert_eq!(outcome.status, ChainStatus::ViaFallback);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(local.calls(), 1);

    let snapshot = metrics.snapshot().await;
    assert!(snapshot.totals("cloud-a", "not-a-model").is_none());
    assert_eq!(snapshot.total_attempts(), 1);
}

#[tokio::test]
async fn test_dispatcher_respects_worker_bound() {
    let cloud = MockProvider::new("cloud-a").with_delay(Duration::from_millis(25));
    let local = MockProvider::new("local-b");
    let metrics = Arc::new(MetricsAggregator::new());
    let orchestrator = Arc::new(orchestrator(
        registry(cloud.clone(), local),
        metrics.clone(),
        3,
    ));
    let dispatcher = Dispatcher::new(orchestrator).with_workers(2);
    let sink = MemorySink::new();

    let jobs: Vec<_> = (0..5)
        .map(|i| ExtractionJob::new(format!("file-{}.pdf", i), request()))
        .collect();
    let summary = dispatcher.run(jobs, &chain(), &sink, &sink).await;

    assert_eq!(cloud.max_in_flight(), 2);
    assert_eq!(summary.total, 5);
    assert_eq!(summary.succeeded, 5);
    assert_eq!(sink.results().await.len(), 5);
    assert!(sink.errors().await.is_empty());
}

#[tokio::test]
async fn test_one_result_per_job_with_mixed_outcomes() {
    // Every third cloud attempt fails permanently, the local fallback rate-limits
    // on its first two calls and succeeds afterwards.
    let cloud = MockProvider::new("cloud-a").with_script(
        (0..30).map(|i| {
            if i % 3 == 0 {
                MockReply::Fail(LlmError::AuthError("HTTP 403".to_string()))
            } else {
                MockReply::Json(serde_json::json!({"title": format!("doc {}", i)}))
            }
        }),
    );
    let local = MockProvider::new("local-b")
        .local()
        .with_script([rate_limited(), rate_limited()]);
    let metrics = Arc::new(MetricsAggregator::new());
    let orchestrator = Arc::new(orchestrator(
        registry(cloud.clone(), local.clone()),
        metrics.clone(),
        2,
    ));
    let dispatcher = Dispatcher::new(orchestrator).with_workers(4);
    let sink = MemorySink::new();

    let jobs: Vec<_> = (0..20)
        .map(|i| ExtractionJob::new(format!("doc-{}", i), request()))
        .collect();
    let summary = dispatcher.run(jobs, &chain(), &sink, &sink).await;

    let results = sink.results().await;
    assert_eq!(results.len(), 20);
    let mut ids: Vec<_> = results.iter().map(|(id, _)| id.clone()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 20);

    assert_eq!(summary.completed(), 20);
    assert_eq!(summary.succeeded + summary.failed, 20);
    assert_eq!(sink.errors().await.len(), summary.failed);
    for error in sink.errors().await {
        assert_eq!(error.failure_kind, FailureKind::RateLimit);
    }

    // Every attempt made by every job reached the aggregator.
    let snapshot = metrics.snapshot().await;
    assert_eq!(snapshot.total_attempts(), summary.attempts);
    assert_eq!(
        snapshot.total_attempts() as usize,
        cloud.calls() + local.calls()
    );
}

#[tokio::test]
async fn test_chain_from_defaults_drives_a_run() {
    let cloud = MockProvider::new("cloud-a").with_default_reply(unavailable());
    let local = MockProvider::new("local-b").local();
    let registry = registry(cloud, local);
    let defaults = DefaultsConfig {
        provider: "cloud-a".to_string(),
        model: None,
        fallback_provider: Some("local-b".to_string()),
        fallback_model: None,
        fallbacks: Vec::new(),
    };
    let chain = registry.chain_from_defaults(&defaults).await.unwrap();
    assert_eq!(chain, FallbackChain::new("cloud-a", "m1").then("local-b", "m2"));

    let metrics = Arc::new(MetricsAggregator::new());
    let dispatcher = Dispatcher::new(Arc::new(orchestrator(registry, metrics, 2)));
    let sink = MemorySink::new();
    let summary = dispatcher
        .run(
            vec![ExtractionJob::new("only.pdf", request())],
            &chain,
            &sink,
            &sink,
        )
        .await;

    assert_eq!(summary.via_fallback, 1);
    assert_eq!(summary.attempts, 3);
}
