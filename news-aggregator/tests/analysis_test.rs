mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{api_source, fast_settings, init_tracing, raw_item, ScriptedLlm, ANALYSIS_JSON, SUMMARY_JSON};
use interfaces::{Article, MemoryStore, SourceContext, Store};
use news_aggregator::normalizer::normalize;
use news_aggregator::{AggregatorError, AnalysisOrchestrator, AnalysisSettings, LlmError};
use uuid::Uuid;

async fn stored_article(store: &Arc<dyn Store>) -> Article {
    let ctx = SourceContext::for_source(&api_source("Wire"), Utc::now());
    let draft = normalize(&raw_item("Transformers get cheaper", "https://wire.example/t"), &ctx);
    store.insert_article(draft).await.unwrap().inserted().unwrap()
}

fn orchestrator(llm: ScriptedLlm, settings: AnalysisSettings) -> (Arc<dyn Store>, Arc<ScriptedLlm>, AnalysisOrchestrator) {
    init_tracing();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let llm = Arc::new(llm);
    let orchestrator = AnalysisOrchestrator::new(store.clone(), llm.clone(), settings);
    (store, llm, orchestrator)
}

#[tokio::test]
async fn summary_is_generated_once_per_language() {
    let (store, llm, orchestrator) = orchestrator(ScriptedLlm::always(Ok(SUMMARY_JSON.into())), fast_settings());
    let article = stored_article(&store).await;

    let first = orchestrator.generate_summary(article.id, "ja").await.unwrap();
    let again = orchestrator.generate_summary(article.id, " JA ").await.unwrap();
    assert_eq!(first, again);
    assert_eq!(first.summary, "要約です。");
    assert_eq!(first.key_points, vec!["one", "two"]);
    assert_eq!(first.llm_model, "scripted-model");
    assert_eq!(llm.calls(), 1);

    let english = orchestrator.generate_summary(article.id, "en").await.unwrap();
    assert_ne!(english.id, first.id);
    assert_eq!(llm.calls(), 2);
}

#[tokio::test]
async fn concurrent_summary_requests_share_one_call() {
    let (store, llm, orchestrator) = orchestrator(
        ScriptedLlm::always(Ok(SUMMARY_JSON.into())).with_delay(Duration::from_millis(100)),
        fast_settings(),
    );
    let article = stored_article(&store).await;

    let (a, b, c) = tokio::join!(
        orchestrator.generate_summary(article.id, "ja"),
        orchestrator.generate_summary(article.id, "ja"),
        orchestrator.generate_summary(article.id, "ja"),
    );
    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
    assert_eq!(a.id, b.id);
    assert_eq!(b.id, c.id);
    assert_eq!(llm.calls(), 1);
}

#[tokio::test]
async fn blank_language_is_rejected() {
    let (store, llm, orchestrator) = orchestrator(ScriptedLlm::always(Ok(SUMMARY_JSON.into())), fast_settings());
    let article = stored_article(&store).await;

    let err = orchestrator.generate_summary(article.id, "  ").await.unwrap_err();
    assert!(matches!(err, AggregatorError::Validation(_)));
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn unknown_article_never_reaches_the_model() {
    let (_store, llm, orchestrator) = orchestrator(ScriptedLlm::always(Ok(SUMMARY_JSON.into())), fast_settings());
    let id = Uuid::new_v4();

    assert_eq!(
        orchestrator.generate_summary(id, "ja").await.unwrap_err(),
        AggregatorError::ArticleNotFound { id }
    );
    assert_eq!(
        orchestrator.generate_analysis(id).await.unwrap_err(),
        AggregatorError::ArticleNotFound { id }
    );
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn analysis_is_one_time() {
    let (store, llm, orchestrator) = orchestrator(ScriptedLlm::always(Ok(ANALYSIS_JSON.into())), fast_settings());
    let article = stored_article(&store).await;

    let analysis = orchestrator.generate_analysis(article.id).await.unwrap();
    assert_eq!(
        analysis.vocabulary.get("transformer").map(String::as_str),
        Some("a neural network architecture")
    );
    assert_eq!(analysis.title_candidates.len(), 3);
    assert_eq!(store.get_analysis(article.id).await.unwrap(), Some(analysis));

    let err = orchestrator.generate_analysis(article.id).await.unwrap_err();
    assert_eq!(err, AggregatorError::AlreadyExists { article_id: article.id });
    assert_eq!(llm.calls(), 1);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let (store, llm, orchestrator) = orchestrator(
        ScriptedLlm::sequence(
            vec![
                Err(LlmError::Transient("429 rate limited".into())),
                Err(LlmError::Transient("503 overloaded".into())),
            ],
            Ok(SUMMARY_JSON.into()),
        ),
        fast_settings(),
    );
    let article = stored_article(&store).await;

    let summary = orchestrator.generate_summary(article.id, "ja").await.unwrap();
    assert_eq!(summary.key_points.len(), 2);
    assert_eq!(llm.calls(), 3);
}

#[tokio::test]
async fn retries_stop_at_the_attempt_limit() {
    let (store, llm, orchestrator) = orchestrator(
        ScriptedLlm::always(Err(LlmError::Transient("503 overloaded".into()))),
        fast_settings(),
    );
    let article = stored_article(&store).await;

    let err = orchestrator.generate_summary(article.id, "ja").await.unwrap_err();
    match err {
        AggregatorError::LlmGeneration(message) => assert!(message.contains("3 attempts")),
        other => panic!("expected generation failure, got {other:?}"),
    }
    assert_eq!(llm.calls(), 3);
    assert!(store.get_summary(article.id, "ja").await.unwrap().is_none());
}

#[tokio::test]
async fn permanent_and_auth_failures_are_not_retried() {
    let (store, llm, orchestrator) = orchestrator(
        ScriptedLlm::always(Err(LlmError::Permanent("400 bad request".into()))),
        fast_settings(),
    );
    let article = stored_article(&store).await;
    assert!(matches!(
        orchestrator.generate_analysis(article.id).await.unwrap_err(),
        AggregatorError::LlmGeneration(_)
    ));
    assert_eq!(llm.calls(), 1);

    let (store, llm, orchestrator) = orchestrator_with_auth_failure();
    let article = stored_article(&store).await;
    assert!(matches!(
        orchestrator.generate_summary(article.id, "ja").await.unwrap_err(),
        AggregatorError::Auth(_)
    ));
    assert_eq!(llm.calls(), 1);
}

fn orchestrator_with_auth_failure() -> (Arc<dyn Store>, Arc<ScriptedLlm>, AnalysisOrchestrator) {
    orchestrator(
        ScriptedLlm::always(Err(LlmError::Auth("invalid api key".into()))),
        fast_settings(),
    )
}

#[tokio::test]
async fn slow_calls_count_as_transient() {
    let settings = AnalysisSettings {
        max_attempts: 2,
        call_timeout: Duration::from_millis(30),
        ..fast_settings()
    };
    let (store, llm, orchestrator) = orchestrator(
        ScriptedLlm::always(Ok(SUMMARY_JSON.into())).with_delay(Duration::from_millis(500)),
        settings,
    );
    let article = stored_article(&store).await;

    let err = orchestrator.generate_summary(article.id, "ja").await.unwrap_err();
    assert!(matches!(err, AggregatorError::LlmGeneration(_)));
    assert_eq!(llm.calls(), 2);
}

#[tokio::test]
async fn unparsable_output_stores_nothing() {
    let (store, llm, orchestrator) = orchestrator(
        ScriptedLlm::sequence(vec![Ok("I cannot answer that.".into())], Ok(SUMMARY_JSON.into())),
        fast_settings(),
    );
    let article = stored_article(&store).await;

    assert!(matches!(
        orchestrator.generate_summary(article.id, "ja").await.unwrap_err(),
        AggregatorError::AnalysisParse(_)
    ));
    assert!(store.get_summary(article.id, "ja").await.unwrap().is_none());

    orchestrator.generate_summary(article.id, "ja").await.unwrap();
    assert_eq!(llm.calls(), 2);
}
