//! Decision stream polling tests.

use std::time::Duration;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ub_common::Redacted;
use ub_config::LapiConfig;
use ub_lapi::{LapiClient, LapiError};

fn test_config(server: &MockServer) -> LapiConfig {
    LapiConfig {
        url: server.uri(),
        api_key: Redacted::new("lapi-key"),
        poll_interval: Duration::from_secs(10),
        metrics_interval: Duration::from_secs(1800),
        insecure_skip_verify: false,
    }
}

#[tokio::test]
async fn startup_flag_and_api_key_are_sent() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/decisions/stream"))
        .and(query_param("startup", "true"))
        .and(header("X-Api-Key", "lapi-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "new": [
                {"type": "ban", "scope": "ip", "value": "203.0.113.10",
                 "scenario": "crowdsecurity/ssh-bf", "origin": "crowdsec",
                 "duration": "3h59m"}
            ],
            "deleted": null,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = LapiClient::new(test_config(&server)).unwrap();
    let delta = client.poll_stream(true).await.unwrap();

    assert_eq!(delta.new.len(), 1);
    assert!(delta.deleted.is_empty());
    assert_eq!(delta.new[0].value, "203.0.113.10");
    assert!(client.last_poll_age().is_some());
}

#[tokio::test]
async fn null_arrays_deserialize_as_empty() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/decisions/stream"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "new": null,
            "deleted": null,
        })))
        .mount(&server)
        .await;

    let client = LapiClient::new(test_config(&server)).unwrap();
    let delta = client.poll_stream(false).await.unwrap();
    assert!(delta.new.is_empty());
    assert!(delta.deleted.is_empty());
}

#[tokio::test]
async fn forbidden_maps_to_unauthorized() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/decisions/stream"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let client = LapiClient::new(test_config(&server)).unwrap();
    let err = client.poll_stream(false).await.unwrap_err();
    assert!(matches!(err, LapiError::Unauthorized));
    assert!(client.last_poll_age().is_none());
}

#[tokio::test]
async fn usage_metrics_posts_payload() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/usage-metrics"))
        .and(header("X-Api-Key", "lapi-key"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let client = LapiClient::new(test_config(&server)).unwrap();
    let reporter = ub_lapi::UsageReporter::new();
    reporter.record_processed("CAPI", "ban");
    let payload = reporter.drain().unwrap();

    client.push_usage_metrics(&payload).await.unwrap();
}
