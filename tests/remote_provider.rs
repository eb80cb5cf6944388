//! Integration tests for the HTTP enrichment collaborator.
//!
//! Each test spins up an Axum stub on a random port and drives
//! `RemoteEnrichment` against it.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use chrono::{TimeZone, Utc};
use rust_decimal_macros::dec;
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use digest_enrich::clock::ManualClock;
use digest_enrich::config::EnrichmentConfig;
use digest_enrich::enrichment::{DecisionKind, EnrichmentCoordinator, PostCandidate, Strategy};
use digest_enrich::error::{FailureKind, SummaryError};
use digest_enrich::provider::{EnrichmentProvider, RemoteEnrichment, Summarizer, SummaryMode};
use digest_enrich::store::{FileStateStore, StateStore};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Serve `app` on a random port and return its base URL.
async fn start_server(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    format!("http://127.0.0.1:{port}")
}

fn candidate() -> PostCandidate {
    PostCandidate::from_post(
        "t3_remote",
        "We launched a thing",
        "a body that is long enough to not count as minimal text for scoring, describing the thing in detail",
        120,
        "SideProject",
        Some("https://i.redd.it/shot.png"),
    )
}

async fn enrich_ok(headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        == Some("Bearer test-token");
    if !authorized {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "no token"})));
    }
    let title = body["candidate"]["title"].as_str().unwrap_or_default();
    (
        StatusCode::OK,
        Json(json!({
            "summary": format!("Context for {title}"),
            "cost": "0.025",
            "web_search_used": true
        })),
    )
}

#[tokio::test]
async fn invoke_success_sends_bearer_token() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server(Router::new().route("/enrich", post(enrich_ok))).await;
        let remote =
            RemoteEnrichment::new(&base, Some(SecretString::from("test-token"))).unwrap();

        let out = remote
            .invoke(&candidate(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(out.summary, "Context for We launched a thing");
        assert_eq!(out.cost, dec!(0.025));
        assert!(out.web_search_used);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn missing_token_is_rejected() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server(Router::new().route("/enrich", post(enrich_ok))).await;
        let remote = RemoteEnrichment::new(&base, None).unwrap();

        let err = remote
            .invoke(&candidate(), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Rejected);
        assert!(err.reason.contains("401"));
        assert!(err.partial_cost.is_none());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn error_body_reports_partial_cost() {
    timeout(TEST_TIMEOUT, async {
        let app = Router::new().route(
            "/enrich",
            post(|| async {
                (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({"error": "search backend down", "partial_cost": "0.01"})),
                )
            }),
        );
        let base = start_server(app).await;
        let remote = RemoteEnrichment::new(&base, None).unwrap();

        let err = remote
            .invoke(&candidate(), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Rejected);
        assert!(err.reason.contains("search backend down"));
        assert_eq!(err.partial_cost, Some(dec!(0.01)));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn slow_provider_times_out() {
    timeout(TEST_TIMEOUT, async {
        let app = Router::new().route(
            "/enrich",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Json(json!({"summary": "late", "cost": "0.01"}))
            }),
        );
        let base = start_server(app).await;
        let remote = RemoteEnrichment::new(&base, None).unwrap();

        let err = remote
            .invoke(&candidate(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Timeout);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn malformed_response_is_invalid() {
    timeout(TEST_TIMEOUT, async {
        let app = Router::new().route("/enrich", post(|| async { "not json" }));
        let base = start_server(app).await;
        let remote = RemoteEnrichment::new(&base, None).unwrap();

        let err = remote
            .invoke(&candidate(), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::InvalidResponse);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn summarize_forwards_mode_and_images() {
    timeout(TEST_TIMEOUT, async {
        let app = Router::new().route(
            "/summarize",
            post(|Json(body): Json<Value>| async move {
                let images = body["images"].as_array().map(Vec::len).unwrap_or(0);
                let mode = body["mode"].as_str().unwrap_or("?").to_string();
                Json(json!({ "summary": format!("{mode} with {images} image(s)") }))
            }),
        );
        let base = start_server(app).await;
        let remote = RemoteEnrichment::new(&base, None).unwrap();

        let text = remote
            .summarize(&candidate(), SummaryMode::Multimodal)
            .await
            .unwrap();
        assert_eq!(text, "multimodal with 1 image(s)");

        let mut no_images = candidate();
        no_images.image_urls.clear();
        no_images.has_image = false;
        let err = remote
            .summarize(&no_images, SummaryMode::Multimodal)
            .await
            .unwrap_err();
        assert!(matches!(err, SummaryError::Unsupported(_)));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn coordinator_enriches_through_remote_and_persists_budget() {
    timeout(TEST_TIMEOUT, async {
        let app = Router::new().route("/enrich", post(enrich_ok)).route(
            "/summarize",
            post(|| async { Json(json!({"summary": "fallback"})) }),
        );
        let base = start_server(app).await;
        let remote = Arc::new(
            RemoteEnrichment::new(&base, Some(SecretString::from("test-token"))).unwrap(),
        );

        let tmp = tempfile::TempDir::new().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(tmp.path().to_path_buf()));
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap(),
        ));

        let mut config = EnrichmentConfig::default();
        config.scoring.target_communities = vec!["SideProject".into()];
        config.scoring.trigger_keywords = vec!["launched".into()];

        let coordinator = EnrichmentCoordinator::new(
            &config,
            Arc::clone(&store),
            clock,
            remote.clone(),
            Some(remote),
        )
        .await
        .unwrap();

        let result = coordinator.enrich(&candidate()).await;
        assert_eq!(result.decision, DecisionKind::Eligible);
        assert_eq!(result.strategy, Strategy::WebSearchEnhanced);
        assert_eq!(result.total_cost, dec!(0.025));

        let status = coordinator.status().await;
        let budget = status.budget.unwrap();
        assert_eq!(budget.count, 1);
        assert_eq!(budget.total_cost, dec!(0.025));
        assert!(tmp.path().join("enrichment_budget.json").exists());
    })
    .await
    .expect("test timed out");
}
