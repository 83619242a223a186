//! Integration tests for hawser

use std::collections::HashMap;
use std::time::Duration;

use hawser::{
    ApiClient, ClientConfig, ClientEvent, DownloadOptions, Error, RequestOptions, Result,
    UploadOptions,
};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn config(value: serde_json::Value) -> ClientConfig {
    ClientConfig::from_value(value).unwrap()
}

async fn drain_events(
    receiver: &mut tokio::sync::broadcast::Receiver<ClientEvent>,
) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn session_lifecycle_create_request_invalidate() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "up" })))
        .mount(&server)
        .await;

    let client = ApiClient::new();
    client.create_client_for(&server.uri(), ClientConfig::default())?;

    let response = client
        .get(&server.uri(), "/ok", RequestOptions::default())
        .await?;
    assert!(response.ok);
    assert_eq!(response.code, 200);
    assert_eq!(response.data.unwrap()["status"], json!("up"));
    assert_eq!(response.retries_exhausted, None);

    client.invalidate_client_for(&server.uri())?;
    let result = client
        .get(&server.uri(), "/ok", RequestOptions::default())
        .await;
    assert!(matches!(result, Err(Error::SessionNotFound { .. })));

    Ok(())
}

#[tokio::test]
async fn duplicate_session_is_rejected() -> Result<()> {
    let client = ApiClient::new();
    client.create_client_for("https://example.com/api", ClientConfig::default())?;

    let result = client.create_client_for("https://example.com/api/", ClientConfig::default());
    assert!(matches!(result, Err(Error::AlreadyExists { .. })));

    Ok(())
}

#[tokio::test]
async fn session_headers_apply_and_request_headers_override() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/check"))
        .and(header("X-App", "hawser"))
        .and(header("X-Mode", "request"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = ApiClient::new();
    client.create_client_for(
        &server.uri(),
        config(json!({ "headers": { "X-App": "hawser", "X-Mode": "session" } })),
    )?;

    let mut extra = HashMap::new();
    extra.insert("X-Mode".to_string(), "request".to_string());
    let response = client
        .get(
            &server.uri(),
            "/check",
            RequestOptions {
                headers: Some(extra),
                ..Default::default()
            },
        )
        .await?;
    assert!(response.ok);

    let stored = client.get_client_headers_for(&server.uri())?;
    assert_eq!(stored.get("X-Mode").unwrap(), "session");

    Ok(())
}

#[tokio::test]
async fn added_headers_reach_subsequent_requests() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/later"))
        .and(header("X-Added", "yes"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = ApiClient::new();
    client.create_client_for(&server.uri(), ClientConfig::default())?;

    let mut headers = HashMap::new();
    headers.insert("X-Added".to_string(), "yes".to_string());
    client.add_client_headers_for(&server.uri(), &headers)?;

    let response = client
        .get(&server.uri(), "/later", RequestOptions::default())
        .await?;
    assert!(response.ok);

    Ok(())
}

#[tokio::test]
async fn linear_retry_runs_to_exhaustion() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = ApiClient::new();
    client.create_client_for(
        &server.uri(),
        config(json!({
            "retryPolicyConfiguration": {
                "type": "linear",
                "retryLimit": 2,
                "retryInterval": 20,
            },
        })),
    )?;

    let response = client
        .get(&server.uri(), "/flaky", RequestOptions::default())
        .await?;
    assert_eq!(response.code, 503);
    assert!(!response.ok);
    assert_eq!(response.retries_exhausted, Some(true));

    // Initial attempt plus two retries
    assert_eq!(server.received_requests().await.unwrap().len(), 3);

    Ok(())
}

#[tokio::test]
async fn retry_stops_on_first_success() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/recovering"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/recovering"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = ApiClient::new();
    client.create_client_for(
        &server.uri(),
        config(json!({
            "retryPolicyConfiguration": {
                "type": "linear",
                "retryLimit": 5,
                "retryInterval": 20,
            },
        })),
    )?;

    let response = client
        .get(&server.uri(), "/recovering", RequestOptions::default())
        .await?;
    assert!(response.ok);
    assert_eq!(response.retries_exhausted, None);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);

    Ok(())
}

#[tokio::test]
async fn per_request_retry_policy_does_not_leak() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/submit"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = ApiClient::new();
    client.create_client_for(&server.uri(), ClientConfig::default())?;

    // The override makes this one POST retryable
    let options: RequestOptions = serde_json::from_value(json!({
        "retryPolicyConfiguration": {
            "type": "linear",
            "retryLimit": 1,
            "retryInterval": 20,
        },
    }))
    .unwrap();
    let response = client.post(&server.uri(), "/submit", options).await?;
    assert_eq!(response.retries_exhausted, Some(true));
    assert_eq!(server.received_requests().await.unwrap().len(), 2);

    server.reset().await;
    Mock::given(method("POST"))
        .and(path("/submit"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    // Without the override the session has no policy at all
    let response = client
        .post(&server.uri(), "/submit", RequestOptions::default())
        .await?;
    assert_eq!(response.retries_exhausted, None);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);

    Ok(())
}

#[tokio::test]
async fn upload_honors_session_retry_policy() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/files"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("retry.bin");
    std::fs::write(&source, vec![2u8; 1024]).unwrap();

    let client = ApiClient::new();
    client.create_client_for(
        &server.uri(),
        config(json!({
            "retryPolicyConfiguration": {
                "type": "linear",
                "retryLimit": 2,
                "retryInterval": 20,
            },
        })),
    )?;

    let options: UploadOptions = serde_json::from_value(json!({ "method": "PUT" })).unwrap();
    let response = client
        .upload(
            &server.uri(),
            "/files",
            source.to_str().unwrap(),
            "retry-upload-1",
            options,
        )
        .await?;
    assert_eq!(response.code, 503);
    assert_eq!(response.retries_exhausted, Some(true));

    // Initial attempt plus two retries, each carrying the full body
    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 3);
    assert!(received.iter().all(|r| r.body.len() == 1024));

    Ok(())
}

#[tokio::test]
async fn download_retries_with_request_override() -> Result<()> {
    let server = MockServer::start().await;
    let payload = vec![4u8; 2048];
    Mock::given(method("GET"))
        .and(path("/archive"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/archive"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("retried.bin");

    let client = ApiClient::new();
    client.create_client_for(&server.uri(), ClientConfig::default())?;

    let options: DownloadOptions = serde_json::from_value(json!({
        "retryPolicyConfiguration": {
            "type": "linear",
            "retryLimit": 3,
            "retryInterval": 20,
        },
    }))
    .unwrap();
    let response = client
        .download(
            &server.uri(),
            "/archive",
            destination.to_str().unwrap(),
            "retry-download-1",
            options,
        )
        .await?;
    assert!(response.ok);
    assert_eq!(response.retries_exhausted, None);
    assert_eq!(std::fs::read(&destination).unwrap(), payload);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);

    Ok(())
}

#[tokio::test]
async fn metrics_are_collected_when_the_session_opts_in() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/measured"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 4096]))
        .mount(&server)
        .await;

    let client = ApiClient::new();
    client.create_client_for(
        &server.uri(),
        config(json!({ "sessionConfiguration": { "collectMetrics": true } })),
    )?;

    let response = client
        .get(&server.uri(), "/measured", RequestOptions::default())
        .await?;
    let metrics = response.metrics.unwrap();
    assert_eq!(metrics.size, 4096);
    assert!(metrics.http_version.starts_with("HTTP/"));
    assert!(metrics.speed_in_mbps >= 0.0);

    // Sessions that did not opt in carry no measurements
    let plain = ApiClient::new();
    let other = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/measured"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&other)
        .await;
    plain.create_client_for(&other.uri(), ClientConfig::default())?;
    let response = plain
        .get(&other.uri(), "/measured", RequestOptions::default())
        .await?;
    assert!(response.metrics.is_none());

    Ok(())
}

#[tokio::test]
async fn per_request_timeout_overrides_session_default() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(400)))
        .mount(&server)
        .await;

    let client = ApiClient::new();
    client.create_client_for(&server.uri(), ClientConfig::default())?;

    let options: RequestOptions =
        serde_json::from_value(json!({ "timeoutInterval": 50 })).unwrap();
    let result = client.get(&server.uri(), "/slow", options).await;
    assert!(matches!(result, Err(Error::Timeout)));

    // The override applied to that call only
    let response = client
        .get(&server.uri(), "/slow", RequestOptions::default())
        .await?;
    assert!(response.ok);

    Ok(())
}

#[tokio::test]
async fn redirects_are_followed_and_recorded() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/old"))
        .respond_with(
            ResponseTemplate::new(302).insert_header("Location", format!("{}/new", server.uri())),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/new"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = ApiClient::new();
    client.create_client_for(&server.uri(), ClientConfig::default())?;

    let response = client
        .get(&server.uri(), "/old", RequestOptions::default())
        .await?;
    assert!(response.ok);
    assert!(response.last_requested_url.ends_with("/new"));
    let chain = response.redirect_urls.unwrap();
    assert_eq!(chain.len(), 2);
    assert!(chain[0].ends_with("/old"));
    assert!(chain[1].ends_with("/new"));

    Ok(())
}

#[tokio::test]
async fn disabled_redirects_return_the_raw_response() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/old"))
        .respond_with(
            ResponseTemplate::new(302).insert_header("Location", format!("{}/new", server.uri())),
        )
        .mount(&server)
        .await;

    let client = ApiClient::new();
    client.create_client_for(
        &server.uri(),
        config(json!({ "sessionConfiguration": { "followRedirects": false } })),
    )?;

    let response = client
        .get(&server.uri(), "/old", RequestOptions::default())
        .await?;
    assert_eq!(response.code, 302);
    assert!(response.redirect_urls.is_none());

    Ok(())
}

#[tokio::test]
async fn bearer_token_is_captured_then_attached() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).insert_header("Token", "abc123"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/me"))
        .and(header("Authorization", "Bearer abc123"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = ApiClient::new();
    client.create_client_for(
        &server.uri(),
        config(json!({
            "requestAdapterConfiguration": { "bearerAuthTokenResponseHeader": "Token" },
        })),
    )?;

    client
        .get(&server.uri(), "/login", RequestOptions::default())
        .await?;
    let response = client
        .get(&server.uri(), "/me", RequestOptions::default())
        .await?;
    assert!(response.ok);

    Ok(())
}

#[tokio::test]
async fn unauthorized_response_cancels_in_flight_requests() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/auth"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let client = ApiClient::new();
    client.create_client_for(
        &server.uri(),
        config(json!({ "sessionConfiguration": { "cancelRequestsOnUnauthorized": true } })),
    )?;

    let slow_client = client.clone();
    let slow_url = server.uri();
    let slow = tokio::spawn(async move {
        slow_client
            .get(&slow_url, "/slow", RequestOptions::default())
            .await
    });
    // Let the slow request reach the server before triggering the 401
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = client
        .get(&server.uri(), "/auth", RequestOptions::default())
        .await?;
    assert_eq!(response.code, 401);

    let result = slow.await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));

    Ok(())
}

#[tokio::test]
async fn upload_streams_file_with_progress() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/files"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "f1" })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("payload.bin");
    std::fs::write(&source, vec![9u8; 10_000]).unwrap();

    let client = ApiClient::new();
    client.create_client_for(&server.uri(), ClientConfig::default())?;
    let mut events = client.registry().events().subscribe();

    let response = client
        .upload(
            &server.uri(),
            "/files",
            source.to_str().unwrap(),
            "upload-1",
            UploadOptions::default(),
        )
        .await?;
    assert_eq!(response.code, 201);
    assert!(client.registry().tasks().is_empty());

    let fractions: Vec<f64> = drain_events(&mut events)
        .await
        .into_iter()
        .filter_map(|event| match event {
            ClientEvent::UploadProgress {
                task_id,
                fraction_completed,
                ..
            } if task_id == "upload-1" => Some(fraction_completed),
            _ => None,
        })
        .collect();
    assert!(!fractions.is_empty());
    assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(*fractions.last().unwrap(), 1.0);

    let received = &server.received_requests().await.unwrap()[0];
    assert_eq!(received.body.len(), 10_000);

    Ok(())
}

#[tokio::test]
async fn resumed_upload_skips_the_prefix() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/files"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("resume.bin");
    let mut content = vec![0u8; 400];
    content.extend(vec![7u8; 600]);
    std::fs::write(&source, &content).unwrap();

    let client = ApiClient::new();
    client.create_client_for(&server.uri(), ClientConfig::default())?;
    let mut events = client.registry().events().subscribe();

    let options: UploadOptions = serde_json::from_value(json!({ "skipBytes": 400 })).unwrap();
    client
        .upload(
            &server.uri(),
            "/files",
            source.to_str().unwrap(),
            "resume-1",
            options,
        )
        .await?;

    let received = &server.received_requests().await.unwrap()[0];
    assert_eq!(received.body, vec![7u8; 600]);

    // Progress counts from the skipped prefix
    let first_fraction = drain_events(&mut events)
        .await
        .into_iter()
        .find_map(|event| match event {
            ClientEvent::UploadProgress {
                fraction_completed, ..
            } => Some(fraction_completed),
            _ => None,
        })
        .unwrap();
    assert!(first_fraction >= 0.4);

    Ok(())
}

#[tokio::test]
async fn multipart_upload_carries_form_fields() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/files"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("photo.jpg");
    std::fs::write(&source, vec![1u8; 512]).unwrap();

    let client = ApiClient::new();
    client.create_client_for(&server.uri(), ClientConfig::default())?;

    let options: UploadOptions = serde_json::from_value(json!({
        "multipart": {
            "fileKey": "attachment",
            "data": { "channel": "town-square" },
        },
    }))
    .unwrap();
    let response = client
        .upload(
            &server.uri(),
            "/files",
            source.to_str().unwrap(),
            "multipart-1",
            options,
        )
        .await?;
    assert!(response.ok);

    let received: &Request = &server.received_requests().await.unwrap()[0];
    let content_type = received.headers.get("content-type").unwrap().to_str().unwrap();
    assert!(content_type.starts_with("multipart/form-data"));
    let body = String::from_utf8_lossy(&received.body);
    assert!(body.contains("name=\"attachment\""));
    assert!(body.contains("filename=\"photo.jpg\""));
    assert!(body.contains("name=\"channel\""));
    assert!(body.contains("town-square"));

    Ok(())
}

#[tokio::test]
async fn cancelled_upload_resolves_as_cancelled() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/files"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("large.bin");
    std::fs::write(&source, vec![3u8; 4096]).unwrap();

    let client = ApiClient::new();
    client.create_client_for(&server.uri(), ClientConfig::default())?;

    let upload_client = client.clone();
    let upload_url = server.uri();
    let upload_source = source.to_str().unwrap().to_string();
    let upload = tokio::spawn(async move {
        upload_client
            .upload(
                &upload_url,
                "/files",
                &upload_source,
                "cancel-1",
                UploadOptions::default(),
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    client.cancel_request("cancel-1");

    let result = upload.await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(client.registry().tasks().is_empty());

    Ok(())
}

#[tokio::test]
async fn download_writes_the_destination_file() -> Result<()> {
    let server = MockServer::start().await;
    let payload = vec![5u8; 20_000];
    Mock::given(method("GET"))
        .and(path("/archive"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("nested").join("archive.bin");

    let client = ApiClient::new();
    client.create_client_for(&server.uri(), ClientConfig::default())?;
    let mut events = client.registry().events().subscribe();

    let response = client
        .download(
            &server.uri(),
            "/archive",
            destination.to_str().unwrap(),
            "download-1",
            DownloadOptions::default(),
        )
        .await?;
    assert!(response.ok);
    assert_eq!(response.path.as_deref(), destination.to_str());
    assert_eq!(std::fs::read(&destination).unwrap(), payload);

    let fractions: Vec<f64> = drain_events(&mut events)
        .await
        .into_iter()
        .filter_map(|event| match event {
            ClientEvent::DownloadProgress {
                fraction_completed, ..
            } => Some(fraction_completed),
            _ => None,
        })
        .collect();
    assert_eq!(*fractions.last().unwrap(), 1.0);

    Ok(())
}

#[tokio::test]
async fn base_path_is_preserved_in_composed_urls() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v4/ping"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = ApiClient::new();
    let base = format!("{}/api", server.uri());
    client.create_client_for(&base, ClientConfig::default())?;

    let response = client.get(&base, "/v4/ping/", RequestOptions::default()).await?;
    assert!(response.ok);

    Ok(())
}

#[tokio::test]
async fn invalidation_cancels_running_transfers() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/archive"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("partial.bin");

    let client = ApiClient::new();
    client.create_client_for(&server.uri(), ClientConfig::default())?;

    let download_client = client.clone();
    let download_url = server.uri();
    let download_destination = destination.to_str().unwrap().to_string();
    let download = tokio::spawn(async move {
        download_client
            .download(
                &download_url,
                "/archive",
                &download_destination,
                "doomed-1",
                DownloadOptions::default(),
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    client.invalidate_client_for(&server.uri())?;

    let result = download.await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));

    Ok(())
}
