//! End-to-end pipeline behaviour against the in-memory store and mocked providers.

use std::sync::Arc;
use std::time::Duration;

use enrich_worker::domain::{Domain, DomainStatus, ResetScope};
use enrich_worker::inference::{
    ChainRetryPolicy, InferenceProvider, LlmSettings, ProviderChain, ProviderKind,
    ProviderSettings,
};
use enrich_worker::observability::Telemetry;
use enrich_worker::pipeline::{
    PipelineDriver, PipelineError, PipelineSettings, RunRequest, RunStatus, RunSummary,
    Vocabulary,
};
use enrich_worker::store::models::{NewCatalogRecord, ScoreFeatures};
use enrich_worker::store::{EnrichmentDao, MemoryEnrichmentDao};
use enrich_worker::util::retry::RetryConfig;
use serde_json::{Value, json};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn completion(content: &Value) -> Value {
    json!({ "choices": [{ "message": { "content": content.to_string() } }] })
}

fn provider(name: &str, server: &MockServer) -> Arc<InferenceProvider> {
    let settings = ProviderSettings {
        kind: ProviderKind::LmStudio,
        name: name.to_string(),
        base_url: server.uri(),
        model: "test-model".to_string(),
        api_key: None,
        min_interval: None,
    };
    Arc::new(InferenceProvider::from_settings(&settings, &LlmSettings::default()).expect("provider"))
}

fn composer_record(id: i64, composer: &str) -> NewCatalogRecord {
    NewCatalogRecord {
        id,
        title: format!("Piece {id}"),
        composer: Some(composer.to_string()),
        instruments: None,
        voicing: None,
        genre: None,
        tags: None,
        source: Some("test".to_string()),
        features: ScoreFeatures::default(),
    }
}

struct Harness {
    dao: Arc<MemoryEnrichmentDao>,
    driver: Arc<PipelineDriver>,
}

impl Harness {
    fn new(servers: &[(&str, &MockServer)]) -> Self {
        Self::with_settings(
            servers,
            PipelineSettings {
                inter_batch_delay: Duration::ZERO,
                ..PipelineSettings::default()
            },
        )
    }

    fn with_settings(servers: &[(&str, &MockServer)], settings: PipelineSettings) -> Self {
        let telemetry = Telemetry::detached().expect("telemetry");
        let providers = servers
            .iter()
            .map(|(name, server)| provider(name, server))
            .collect();
        let chain = ProviderChain::new(
            providers,
            ChainRetryPolicy {
                rate_limit: RetryConfig::new(2, 1, 2),
                malformed_max_attempts: 1,
            },
            telemetry.metrics_arc(),
        );
        let dao = Arc::new(MemoryEnrichmentDao::new());
        let driver = PipelineDriver::new(
            Arc::clone(&dao) as Arc<dyn EnrichmentDao>,
            chain,
            Arc::new(Vocabulary::builtin().expect("vocabulary")),
            settings,
            telemetry.metrics_arc(),
        )
        .expect("driver");
        Self {
            dao,
            driver: Arc::new(driver),
        }
    }

    async fn import(&self, records: &[NewCatalogRecord]) {
        self.dao.import_records(records).await.expect("import");
    }

    async fn run(&self, domain: Domain) -> RunSummary {
        self.driver
            .run(RunRequest {
                domain: Some(domain),
                ..RunRequest::default()
            })
            .await
            .expect("run succeeds")
    }

    async fn run_all(&self) -> RunSummary {
        self.driver
            .run(RunRequest::default())
            .await
            .expect("full run succeeds")
    }

    async fn status(&self, id: i64, domain: Domain) -> DomainStatus {
        self.dao
            .get_record(id)
            .await
            .expect("get")
            .expect("record exists")
            .status(domain)
    }

    async fn value(&self, id: i64, domain: Domain) -> Option<String> {
        self.dao
            .get_record(id)
            .await
            .expect("get")
            .expect("record exists")
            .normalized_value(domain)
            .map(ToString::to_string)
    }
}

#[tokio::test]
async fn js_bach_resolves_and_lands_in_the_cache() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("J.S. Bach"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion(&json!({ "value": "Bach, Johann Sebastian" }))),
        )
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new(&[("local", &server)]);
    harness.import(&[composer_record(1, "J.S. Bach")]).await;

    let summary = harness.run(Domain::Composer).await;

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.counts(Domain::Composer).normalized, 1);
    assert_eq!(harness.status(1, Domain::Composer).await, DomainStatus::Normalized);
    assert_eq!(
        harness.value(1, Domain::Composer).await.as_deref(),
        Some("Bach, Johann Sebastian")
    );
    let mapping = harness
        .dao
        .mapping(Domain::Composer, "J.S. Bach")
        .expect("mapping cached");
    assert_eq!(
        mapping.resolved_value.as_deref(),
        Some("Bach, Johann Sebastian")
    );
    assert!(!mapping.verified);
}

#[tokio::test]
async fn traditional_short_circuits_without_any_provider_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let harness = Harness::new(&[("local", &server)]);
    harness.import(&[composer_record(1, "Traditional")]).await;

    let summary = harness.run(Domain::Composer).await;

    assert_eq!(summary.counts(Domain::Composer).short_circuited, 1);
    assert_eq!(summary.counts(Domain::Composer).batches, 0);
    assert_eq!(
        harness.status(1, Domain::Composer).await,
        DomainStatus::NotApplicable
    );
}

#[tokio::test]
async fn resolved_raw_value_is_reused_without_another_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion(&json!({ "value": "Handel, George Frideric" }))),
        )
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new(&[("local", &server)]);
    harness
        .import(&[
            composer_record(1, "Handel"),
            composer_record(2, "Handel"),
            composer_record(3, "Handel"),
        ])
        .await;

    let first = harness
        .driver
        .run(RunRequest {
            domain: Some(Domain::Composer),
            limit: Some(1),
            provider: None,
        })
        .await
        .expect("first run");
    assert_eq!(first.counts(Domain::Composer).normalized, 1);
    assert_eq!(harness.status(2, Domain::Composer).await, DomainStatus::Pending);

    let second = harness.run(Domain::Composer).await;
    assert_eq!(second.counts(Domain::Composer).short_circuited, 2);

    for id in 1..=3 {
        assert_eq!(
            harness.value(id, Domain::Composer).await.as_deref(),
            Some("Handel, George Frideric")
        );
    }
}

#[tokio::test]
async fn three_item_batch_with_missing_middle_entry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(&json!({
            "items": [
                { "id": 1, "value": "Byrd, William" },
                { "id": 3, "value": null }
            ]
        }))))
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new(&[("local", &server)]);
    harness
        .import(&[
            composer_record(1, "W. Byrd"),
            composer_record(2, "Tallis"),
            composer_record(3, "The Choir"),
        ])
        .await;

    let summary = harness.run(Domain::Composer).await;
    let counts = summary.counts(Domain::Composer);

    assert_eq!(counts.normalized + counts.not_applicable + counts.failed, 3);
    assert_eq!(harness.status(1, Domain::Composer).await, DomainStatus::Normalized);
    assert_eq!(harness.status(2, Domain::Composer).await, DomainStatus::Failed);
    assert_eq!(
        harness.status(3, Domain::Composer).await,
        DomainStatus::NotApplicable
    );
    assert!(harness.dao.mapping(Domain::Composer, "Tallis").is_none());
}

#[tokio::test]
async fn genre_outside_the_vocabulary_is_not_applicable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(completion(&json!({ "value": "Shanty" }))),
        )
        .mount(&server)
        .await;

    let harness = Harness::new(&[("local", &server)]);
    let mut record = composer_record(1, "Traditional");
    record.genre = Some("sea song".to_string());
    harness.import(&[record]).await;

    let summary = harness.run(Domain::Genre).await;

    assert_eq!(summary.counts(Domain::Genre).failed, 0);
    assert_eq!(harness.status(1, Domain::Genre).await, DomainStatus::NotApplicable);
    assert_eq!(harness.value(1, Domain::Genre).await, None);
    assert!(harness.dao.mapping(Domain::Genre, "sea song").is_none());
}

#[tokio::test]
async fn quota_exhaustion_fails_over_to_the_next_provider() {
    let primary = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(402).set_body_string("payment required"))
        .expect(1)
        .mount(&primary)
        .await;
    let secondary = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion(&json!({ "value": "Purcell, Henry" }))),
        )
        .expect(2)
        .mount(&secondary)
        .await;

    // 1 件ずつ送り、枯渇したプロバイダが同じラン内で再び呼ばれないことを確かめる
    let harness = Harness::with_settings(
        &[("primary", &primary), ("secondary", &secondary)],
        PipelineSettings {
            batch_size: 1,
            inter_batch_delay: Duration::ZERO,
            ..PipelineSettings::default()
        },
    );
    harness
        .import(&[composer_record(1, "H. Purcell"), composer_record(2, "Purcell H.")])
        .await;

    let summary = harness.run(Domain::Composer).await;
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.exhausted_providers, vec!["primary".to_string()]);
    assert_eq!(summary.counts(Domain::Composer).batches, 2);

    for id in 1..=2 {
        assert_eq!(harness.status(id, Domain::Composer).await, DomainStatus::Normalized);
        assert_eq!(
            harness.value(id, Domain::Composer).await.as_deref(),
            Some("Purcell, Henry")
        );
    }
    let record = harness.dao.get_record(2).await.expect("get").expect("record");
    assert_eq!(
        record.state(Domain::Composer).resolved_by.as_deref(),
        Some("secondary")
    );
}

#[tokio::test]
async fn total_exhaustion_leaves_records_pending() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(402).set_body_string("quota"))
        .mount(&server)
        .await;

    let harness = Harness::new(&[("only", &server)]);
    harness.import(&[composer_record(1, "Monteverdi")]).await;

    let error = harness
        .driver
        .run(RunRequest {
            domain: Some(Domain::Composer),
            ..RunRequest::default()
        })
        .await
        .expect_err("run fails on exhaustion");

    match error {
        PipelineError::ProvidersExhausted { summary } => {
            assert_eq!(summary.status, RunStatus::Exhausted);
            assert_eq!(summary.exhausted_providers, vec!["only".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(harness.status(1, Domain::Composer).await, DomainStatus::Pending);
}

#[tokio::test]
async fn rerunning_a_finished_stage_is_a_no_op_until_reset() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion(&json!({ "value": "Victoria, Tomás Luis de" }))),
        )
        .expect(2)
        .mount(&server)
        .await;

    let harness = Harness::new(&[("local", &server)]);
    harness.import(&[composer_record(1, "T. L. de Victoria")]).await;

    harness.run(Domain::Composer).await;
    let again = harness.run(Domain::Composer).await;
    assert_eq!(again.totals().batches, 0);
    assert_eq!(again.counts(Domain::Composer).short_circuited, 0);

    let reset = harness
        .driver
        .reset(Domain::Composer, ResetScope::Normalized)
        .await
        .expect("reset");
    assert_eq!(reset, 1);
    harness
        .driver
        .clear_mappings(Domain::Composer)
        .await
        .expect("clear mappings");

    let after_reset = harness.run(Domain::Composer).await;
    assert_eq!(after_reset.counts(Domain::Composer).normalized, 1);
}

#[tokio::test]
async fn downstream_stage_waits_for_its_prerequisite() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let harness = Harness::new(&[("local", &server)]);
    harness.import(&[composer_record(1, "Palestrina")]).await;

    let summary = harness.run(Domain::Period).await;

    assert_eq!(summary.totals().batches, 0);
    assert_eq!(harness.status(1, Domain::Period).await, DomainStatus::Pending);
    assert_eq!(harness.status(1, Domain::Composer).await, DomainStatus::Pending);
}

#[tokio::test]
async fn unknown_provider_is_a_configuration_error() {
    let server = MockServer::start().await;
    let harness = Harness::new(&[("local", &server)]);

    let error = harness
        .driver
        .run(RunRequest {
            domain: Some(Domain::Composer),
            limit: None,
            provider: Some("missing".to_string()),
        })
        .await
        .expect_err("unknown provider");
    assert!(matches!(error, PipelineError::Configuration(_)));
}

const MOTET_DESCRIPTION: &str = "A serene Renaissance motet for unaccompanied mixed choir. \
    Its intermediate vocal lines move mostly by step and suit church and community choirs. \
    The Latin text is set clearly and the harmonies are warm.";

/// ステージ固有の指示文で振り分けるモック。
async fn mount_stage(server: &MockServer, marker: &str, content: Value, expected: u64) {
    Mock::given(method("POST"))
        .and(body_string_contains(marker))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(&content)))
        .expect(expected)
        .mount(server)
        .await;
}

const COMPOSER: &str = "Normalize the composer name";
const PERIOD: &str = "Classify the musical style period";
const VOCAL_FLAG: &str = "Decide whether the piece is written for voices";
const VOICING: &str = "Normalize the vocal scoring";
const INSTRUMENTS: &str = "List the instruments";
const GENRE: &str = "Classify the genre";
const GRADE: &str = "Estimate the pedagogical difficulty";
const SEARCH_TEXT: &str = "Write a search description";

fn motet_record() -> NewCatalogRecord {
    NewCatalogRecord {
        voicing: Some("mixed choir satb".to_string()),
        genre: Some("motet".to_string()),
        ..composer_record(1, "T. L. de Victoria")
    }
}

async fn mount_motet_stages(server: &MockServer, search_text_calls: u64) {
    mount_stage(server, COMPOSER, json!({ "value": "Victoria, Tomás Luis de" }), 1).await;
    mount_stage(server, PERIOD, json!({ "value": "Renaissance" }), 1).await;
    mount_stage(server, VOCAL_FLAG, json!({ "value": true }), 1).await;
    mount_stage(server, VOICING, json!({ "value": "SATB" }), 1).await;
    mount_stage(server, INSTRUMENTS, json!({ "value": ["Piano"] }), 0).await;
    mount_stage(server, GENRE, json!({ "value": "Motet" }), 1).await;
    mount_stage(
        server,
        GRADE,
        json!({ "value": "Grade 4", "secondary": "RCM Level 5" }),
        1,
    )
    .await;
    mount_stage(
        server,
        SEARCH_TEXT,
        json!({ "description": MOTET_DESCRIPTION }),
        search_text_calls,
    )
    .await;
}

#[tokio::test]
async fn failed_upstream_still_releases_the_downstream_stage() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains(COMPOSER))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "no structured answer here" } }]
        })))
        .expect(1)
        .mount(&server)
        .await;
    mount_stage(&server, PERIOD, json!({ "value": "Renaissance" }), 1).await;

    let harness = Harness::new(&[("local", &server)]);
    harness.import(&[composer_record(1, "Anerio?")]).await;

    let composer = harness.run(Domain::Composer).await;
    assert_eq!(composer.counts(Domain::Composer).failed, 1);
    assert_eq!(harness.status(1, Domain::Composer).await, DomainStatus::Failed);

    let period = harness.run(Domain::Period).await;
    assert_eq!(period.counts(Domain::Period).normalized, 1);
    assert_eq!(
        harness.value(1, Domain::Period).await.as_deref(),
        Some("Renaissance")
    );
}

#[tokio::test]
async fn full_run_walks_every_stage_in_dependency_order() {
    let server = MockServer::start().await;
    mount_motet_stages(&server, 1).await;

    let harness = Harness::new(&[("local", &server)]);
    harness.import(&[motet_record()]).await;

    let summary = harness.run_all().await;

    assert_eq!(summary.status, RunStatus::Completed);
    let planned: Vec<Domain> = summary.domains.keys().copied().collect();
    assert_eq!(planned.len(), 8);
    assert!(!planned.contains(&Domain::IndexStatus));

    for (domain, expected) in [
        (Domain::Composer, "Victoria, Tomás Luis de"),
        (Domain::Period, "Renaissance"),
        (Domain::VocalFlag, "true"),
        (Domain::Voicing, "SATB"),
        (Domain::Genre, "Motet"),
        (Domain::PedagogicalGrade, "Grade 4"),
        (Domain::SearchText, MOTET_DESCRIPTION),
    ] {
        assert_eq!(
            harness.value(1, domain).await.as_deref(),
            Some(expected),
            "{domain}"
        );
    }
    // 楽器の生値が無いので対象外のまま残る
    assert_eq!(harness.status(1, Domain::Instruments).await, DomainStatus::Pending);
    assert_eq!(harness.status(1, Domain::IndexStatus).await, DomainStatus::Pending);

    let feed = harness
        .dao
        .search_documents(0, 10, true)
        .await
        .expect("feed");
    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0].record_id, 1);
}

#[tokio::test]
async fn rewritten_search_text_is_redelivered_to_the_indexer() {
    let server = MockServer::start().await;
    mount_motet_stages(&server, 2).await;

    let harness = Harness::new(&[("local", &server)]);
    harness.import(&[motet_record()]).await;
    harness.run_all().await;

    assert_eq!(harness.dao.mark_indexed(&[1]).await.expect("ack"), 1);
    assert_eq!(
        harness.status(1, Domain::IndexStatus).await,
        DomainStatus::Normalized
    );

    harness
        .driver
        .reset(Domain::SearchText, ResetScope::Normalized)
        .await
        .expect("reset");
    let rerun = harness.run(Domain::SearchText).await;

    assert_eq!(rerun.counts(Domain::SearchText).normalized, 1);
    assert_eq!(harness.status(1, Domain::IndexStatus).await, DomainStatus::Pending);
    let feed = harness
        .dao
        .search_documents(0, 10, true)
        .await
        .expect("feed");
    assert_eq!(feed.len(), 1);
}

#[tokio::test]
async fn thin_coverage_short_circuits_search_text() {
    let server = MockServer::start().await;
    mount_stage(&server, COMPOSER, json!({ "value": "Byrd, William" }), 1).await;
    mount_stage(&server, PERIOD, json!({ "value": "Renaissance" }), 1).await;
    mount_stage(&server, VOCAL_FLAG, json!({ "value": true }), 1).await;
    mount_stage(&server, GRADE, json!({ "value": "Grade 3" }), 1).await;
    mount_stage(&server, SEARCH_TEXT, json!({ "description": MOTET_DESCRIPTION }), 0).await;

    let harness = Harness::with_settings(
        &[("local", &server)],
        PipelineSettings {
            inter_batch_delay: Duration::ZERO,
            search_text_min_coverage: 2,
            ..PipelineSettings::default()
        },
    );
    harness.import(&[composer_record(1, "W. Byrd")]).await;

    let summary = harness.run_all().await;

    let counts = summary.counts(Domain::SearchText);
    assert_eq!(counts.not_applicable, 1);
    assert_eq!(counts.short_circuited, 1);
    assert_eq!(counts.batches, 0);
    assert_eq!(
        harness.status(1, Domain::SearchText).await,
        DomainStatus::NotApplicable
    );
}

#[tokio::test]
async fn search_text_failing_quality_checks_is_failed() {
    let server = MockServer::start().await;
    mount_stage(&server, COMPOSER, json!({ "value": "Byrd, William" }), 1).await;
    mount_stage(&server, PERIOD, json!({ "value": "Renaissance" }), 1).await;
    mount_stage(&server, VOCAL_FLAG, json!({ "value": true }), 1).await;
    mount_stage(&server, GRADE, json!({ "value": "Grade 3" }), 1).await;
    mount_stage(
        &server,
        SEARCH_TEXT,
        json!({ "description": "- polyphonic density\n- ambitus of a tenth\n- short" }),
        1,
    )
    .await;

    let harness = Harness::new(&[("local", &server)]);
    harness.import(&[composer_record(1, "W. Byrd")]).await;

    let summary = harness.run_all().await;

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.counts(Domain::SearchText).failed, 1);
    assert_eq!(harness.status(1, Domain::SearchText).await, DomainStatus::Failed);
    assert_eq!(
        harness.status(1, Domain::Composer).await,
        DomainStatus::Normalized
    );
    assert_eq!(harness.status(1, Domain::IndexStatus).await, DomainStatus::Pending);
    assert!(
        harness
            .dao
            .search_documents(0, 10, false)
            .await
            .expect("feed")
            .is_empty()
    );
}

#[tokio::test]
async fn scheduled_run_retries_failed_records_only_when_asked() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "not json" } }]
        })))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    mount_stage(&server, COMPOSER, json!({ "value": "Josquin des Prez" }), 1).await;

    let harness = Harness::new(&[("local", &server)]);
    // タイトルが空なので作曲者以外のステージは対象外
    let mut record = composer_record(1, "Josquin");
    record.title = String::new();
    harness.import(&[record]).await;

    harness.run(Domain::Composer).await;
    assert_eq!(harness.status(1, Domain::Composer).await, DomainStatus::Failed);

    let untouched = harness
        .driver
        .run_scheduled(false)
        .await
        .expect("scheduled run");
    assert_eq!(untouched.totals().batches, 0);
    assert_eq!(harness.status(1, Domain::Composer).await, DomainStatus::Failed);

    let retried = harness
        .driver
        .run_scheduled(true)
        .await
        .expect("scheduled run");
    assert_eq!(retried.counts(Domain::Composer).normalized, 1);
    assert_eq!(
        harness.value(1, Domain::Composer).await.as_deref(),
        Some("Josquin des Prez")
    );
}

#[tokio::test]
async fn abort_mid_batch_commits_nothing_and_blocks_resets_while_running() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion(&json!({ "value": "Lassus, Orlande de" })))
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let harness = Harness::new(&[("local", &server)]);
    harness.import(&[composer_record(1, "O. di Lasso")]).await;

    let driver = Arc::clone(&harness.driver);
    let run = tokio::spawn(async move {
        driver
            .run(RunRequest {
                domain: Some(Domain::Composer),
                ..RunRequest::default()
            })
            .await
    });

    tokio::time::timeout(Duration::from_secs(5), async {
        while server
            .received_requests()
            .await
            .unwrap_or_default()
            .is_empty()
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("batch reached the provider");

    assert!(harness.driver.is_running());
    assert!(matches!(
        harness
            .driver
            .reset(Domain::Composer, ResetScope::All)
            .await,
        Err(PipelineError::Busy)
    ));
    assert!(matches!(
        harness.driver.clear_mappings(Domain::Composer).await,
        Err(PipelineError::Busy)
    ));

    assert!(harness.driver.abort());
    let summary = run
        .await
        .expect("run task joins")
        .expect("aborted run still reports");

    assert_eq!(summary.status, RunStatus::Aborted);
    assert_eq!(summary.totals().batches, 0);
    assert!(!harness.driver.is_running());
    assert_eq!(harness.status(1, Domain::Composer).await, DomainStatus::Pending);
    assert!(harness.dao.mapping(Domain::Composer, "O. di Lasso").is_none());
}

#[tokio::test]
async fn concurrent_batches_each_commit_their_own_records() {
    let server = MockServer::start().await;
    for (raw, resolved) in [
        ("Morley", "Morley, Thomas"),
        ("Weelkes", "Weelkes, Thomas"),
        ("Wilbye", "Wilbye, John"),
    ] {
        Mock::given(method("POST"))
            .and(body_string_contains(raw))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(completion(&json!({ "value": resolved }))),
            )
            .expect(1)
            .mount(&server)
            .await;
    }

    let harness = Harness::with_settings(
        &[("local", &server)],
        PipelineSettings {
            batch_size: 1,
            batch_concurrency: 3,
            inter_batch_delay: Duration::ZERO,
            ..PipelineSettings::default()
        },
    );
    harness
        .import(&[
            composer_record(1, "Morley"),
            composer_record(2, "Weelkes"),
            composer_record(3, "Wilbye"),
        ])
        .await;

    let summary = harness.run(Domain::Composer).await;

    assert_eq!(summary.counts(Domain::Composer).batches, 3);
    assert_eq!(summary.counts(Domain::Composer).normalized, 3);
    for (id, expected) in [(1, "Morley, Thomas"), (2, "Weelkes, Thomas"), (3, "Wilbye, John")] {
        assert_eq!(harness.value(id, Domain::Composer).await.as_deref(), Some(expected));
    }
}
