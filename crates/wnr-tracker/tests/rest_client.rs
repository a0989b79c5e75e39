use std::time::Duration;

use httpmock::prelude::*;
use serde_json::json;
use wnr_tracker::{BackoffPolicy, RestClientConfig, RestTrackerClient, TrackerClient, TransportError};

fn test_config(base_url: &str) -> RestClientConfig {
    RestClientConfig {
        base_url: base_url.to_string(),
        api_token: "token-123".to_string(),
        project_id: 9,
        page_size: 50,
        filter_id: None,
        timeout: Duration::from_secs(5),
        backoff: BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        },
    }
}

fn issue_record(id: u64) -> serde_json::Value {
    json!({
        "id": id,
        "created_at": "2024-01-01T10:00:00Z",
        "updated_at": "2024-01-01T10:00:00Z",
        "summary": format!("issue {id}"),
        "notes": []
    })
}

#[tokio::test]
async fn pagination_terminates_on_empty_page() {
    let server = MockServer::start();
    let page_one = server.mock(|when, then| {
        when.method(GET)
            .path("/api/rest/issues")
            .header("Authorization", "token-123")
            .query_param("project_id", "9")
            .query_param("page", "1");
        then.status(200)
            .json_body(json!({"issues": [issue_record(1), issue_record(2)]}));
    });
    let page_two = server.mock(|when, then| {
        when.method(GET)
            .path("/api/rest/issues")
            .query_param("page", "2");
        then.status(200).json_body(json!({"issues": []}));
    });

    let client = RestTrackerClient::new(test_config(&server.base_url())).expect("client");
    let issues = client.fetch_all_issues().await.expect("issues");

    page_one.assert();
    page_two.assert();
    let ids: Vec<u64> = issues.iter().map(|issue| issue.id).collect();
    assert_eq!(ids, [1, 2]);
}

#[tokio::test]
async fn server_errors_are_retried_then_surfaced() {
    let server = MockServer::start();
    let failing = server.mock(|when, then| {
        when.method(GET).path("/api/rest/issues");
        then.status(500).body("boom");
    });

    let client = RestTrackerClient::new(test_config(&server.base_url())).expect("client");
    let err = client.fetch_all_issues().await.expect_err("should fail");

    // max_retries = 2 means three attempts total.
    failing.assert_hits(3);
    match err {
        TransportError::HttpStatus { status, .. } => assert_eq!(status, 500),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start();
    let denied = server.mock(|when, then| {
        when.method(GET).path("/api/rest/issues");
        then.status(401).body("nope");
    });

    let client = RestTrackerClient::new(test_config(&server.base_url())).expect("client");
    let err = client.fetch_all_issues().await.expect_err("should fail");

    denied.assert_hits(1);
    match err {
        TransportError::HttpStatus { status, .. } => assert_eq!(status, 401),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn single_issue_fetch_unwraps_the_envelope() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/api/rest/issues/42");
        then.status(200).json_body(json!({"issues": [issue_record(42)]}));
    });

    let client = RestTrackerClient::new(test_config(&server.base_url())).expect("client");
    let issue = client.fetch_issue(42).await.expect("issue");
    assert_eq!(issue.id, 42);
    assert_eq!(issue.updated_at, "2024-01-01T10:00:00Z");
}

#[tokio::test]
async fn missing_issues_array_is_malformed() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/api/rest/issues");
        then.status(200).json_body(json!({"unexpected": true}));
    });

    let client = RestTrackerClient::new(test_config(&server.base_url())).expect("client");
    let err = client.fetch_all_issues().await.expect_err("should fail");
    assert!(matches!(err, TransportError::Malformed { .. }));
}
