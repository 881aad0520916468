//! HTTP dispatch tests
//!
//! Runs the uploader over the reqwest dispatcher against a wiremock server
//! to check what actually goes on the wire.

mod common;

use charmfs::client::{
    ClientError, DispatchRequest, HttpDispatcher, HttpDispatcherConfig, RequestDispatcher,
};
use charmfs::crypto::{PassthroughEncryptor, PlainPathCipher};
use charmfs::upload::{StreamingUploader, UploadError, UploadOptions};
use common::{boundary_of, split_multipart};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn dispatcher(server: &MockServer, token: Option<&str>) -> HttpDispatcher {
    HttpDispatcher::new(HttpDispatcherConfig {
        base_url: server.uri(),
        token: token.map(str::to_string),
        timeout: Duration::from_secs(10),
    })
    .unwrap()
}

fn uploader(server: &MockServer) -> StreamingUploader {
    StreamingUploader::new(
        Arc::new(dispatcher(server, Some("test-token"))),
        Arc::new(PassthroughEncryptor),
        Arc::new(PlainPathCipher),
        UploadOptions {
            chunk_size: 3,
            pipe_capacity: 1,
            file_mode: 0o664,
        },
    )
}

#[tokio::test]
async fn test_upload_wire_format() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/fs/notes/a.txt"))
        .and(query_param("mode", "436"))
        .and(header("authorization", "Bearer test-token"))
        .and(header_exists("content-length"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = uploader(&server)
        .upload("notes/a.txt", &b"hello world"[..])
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];

    let content_type = request
        .headers
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(content_type.starts_with("multipart/form-data; boundary="));

    let content_length: u64 = request
        .headers
        .get("content-length")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(content_length, outcome.content_length);
    assert_eq!(request.body.len() as u64, content_length);

    // Declared length is used, not chunked transfer
    assert!(request.headers.get("transfer-encoding").is_none());

    let (headers, data) = split_multipart(&request.body, &boundary_of(content_type));
    assert!(headers.contains(r#"name="data"; filename="notes/a.txt""#));
    assert_eq!(data, b"hello world");
}

#[tokio::test]
async fn test_upload_server_error_is_transmission_failure() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("disk full"))
        .expect(1)
        .mount(&server)
        .await;

    let err = uploader(&server)
        .upload("notes/a.txt", &b"hello world"[..])
        .await
        .unwrap_err();

    match err {
        UploadError::Transmission(message) => {
            assert!(message.contains("500"), "message: {message}");
            assert!(message.contains("disk full"), "message: {message}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_upload_unreachable_server() {
    let server = MockServer::start().await;
    let uri = server.uri();
    drop(server);

    let uploader = StreamingUploader::new(
        Arc::new(
            HttpDispatcher::new(HttpDispatcherConfig {
                base_url: uri,
                token: None,
                timeout: Duration::from_secs(2),
            })
            .unwrap(),
        ),
        Arc::new(PassthroughEncryptor),
        Arc::new(PlainPathCipher),
        UploadOptions::default(),
    );

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        uploader.upload("a.txt", &b"data"[..]),
    )
    .await
    .expect("upload must not hang on a refused connection");

    assert!(matches!(result, Err(UploadError::Transmission(_))), "got {result:?}");
}

#[tokio::test]
async fn test_dispatch_without_token_sends_no_authorization() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/fs/x"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let response = dispatcher(&server, None)
        .dispatch(DispatchRequest::get("/v1/fs/x"))
        .await
        .unwrap();

    assert_eq!(&response.body[..], b"ok");
    let requests = server.received_requests().await.unwrap();
    assert!(requests[0].headers.get("authorization").is_none());
}

#[tokio::test]
async fn test_dispatch_maps_status_errors() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not found\n"))
        .mount(&server)
        .await;

    let err = dispatcher(&server, Some("t"))
        .dispatch(DispatchRequest::delete("/v1/fs/missing"))
        .await
        .unwrap_err();

    assert_eq!(err.status(), Some(reqwest::StatusCode::NOT_FOUND));
    match err {
        ClientError::Status { message, .. } => assert_eq!(message, "not found"),
        other => panic!("unexpected error: {other:?}"),
    }
}
