//! Shared test doubles for upload and filesystem tests
//!
//! - `RecordingDispatcher`: drains request bodies and records every call
//! - `FailingEncryptor`: accepts a fixed number of bytes, then errors
//! - `RejectingPathCipher`: refuses every path

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use charmfs::client::{
    ClientError, DispatchRequest, DispatchResponse, RequestBody, RequestDispatcher,
};
use charmfs::crypto::{CipherWriter, CryptoError, Encryptor, PathCipher};
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use std::time::Duration;

/// What the recording dispatcher does with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Read the whole body and answer 200
    Accept,
    /// Read one body chunk, then fail like a reset connection
    FailAfterFirstChunk,
    /// Hold the body without reading and never answer
    Hang,
    /// Hand the body to a task that never reads it, then reject the request
    RejectEarly,
}

/// One request as seen by the dispatcher
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub body_error: Option<String>,
}

impl RecordedCall {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.parse().ok())
    }
}

pub struct RecordingDispatcher {
    behavior: Behavior,
    calls: Mutex<Vec<RecordedCall>>,
}

impl RecordingDispatcher {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn accepting() -> Self {
        Self::new(Behavior::Accept)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl RequestDispatcher for RecordingDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchResponse, ClientError> {
        let mut body = Vec::new();
        let mut body_error = None;

        if let RequestBody::Stream(mut reader) = request.body {
            if self.behavior == Behavior::Hang {
                self.calls.lock().push(RecordedCall {
                    method: request.method,
                    path: request.path,
                    headers: request.headers,
                    body,
                    body_error,
                });
                let _held = reader;
                return futures::future::pending().await;
            }

            if self.behavior == Behavior::RejectEarly {
                self.calls.lock().push(RecordedCall {
                    method: request.method,
                    path: request.path,
                    headers: request.headers,
                    body,
                    body_error,
                });
                tokio::spawn(async move {
                    let _held = reader;
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                });
                tokio::time::sleep(Duration::from_millis(20)).await;
                return Err(ClientError::Status {
                    status: StatusCode::PAYLOAD_TOO_LARGE,
                    message: "rejected early".to_string(),
                });
            }

            while let Some(item) = reader.next().await {
                match item {
                    Ok(chunk) => {
                        body.extend_from_slice(&chunk);
                        if self.behavior == Behavior::FailAfterFirstChunk {
                            body_error = Some("connection reset by peer".to_string());
                            tokio::task::yield_now().await;
                            break;
                        }
                    }
                    Err(e) => {
                        body_error = Some(e.to_string());
                        break;
                    }
                }
            }
        }

        self.calls.lock().push(RecordedCall {
            method: request.method,
            path: request.path,
            headers: request.headers,
            body,
            body_error: body_error.clone(),
        });

        if let Some(message) = body_error {
            return Err(ClientError::RequestError(message));
        }

        Ok(DispatchResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        })
    }
}

/// Encryption filter that writes `limit` bytes of output, then fails
pub struct FailingEncryptor {
    pub limit: usize,
}

struct FailingWriter {
    limit: usize,
    out: Vec<u8>,
}

impl CipherWriter for FailingWriter {
    fn write(&mut self, plaintext: &[u8]) -> Result<(), CryptoError> {
        let room = self.limit - self.out.len();
        if plaintext.len() > room {
            self.out.extend_from_slice(&plaintext[..room]);
            return Err(CryptoError::Encryption(format!(
                "filter aborted after {} bytes",
                self.out.len()
            )));
        }
        self.out.extend_from_slice(plaintext);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<Bytes, CryptoError> {
        Ok(Bytes::from(self.out))
    }
}

impl Encryptor for FailingEncryptor {
    fn encrypting_writer(&self) -> Result<Box<dyn CipherWriter>, CryptoError> {
        Ok(Box::new(FailingWriter {
            limit: self.limit,
            out: Vec::new(),
        }))
    }

    fn decrypt(&self, ciphertext: Bytes) -> Result<Bytes, CryptoError> {
        Ok(ciphertext)
    }
}

/// Path cipher that rejects everything
pub struct RejectingPathCipher;

impl PathCipher for RejectingPathCipher {
    fn encrypt_path(&self, path: &str) -> Result<String, CryptoError> {
        Err(CryptoError::InvalidPath(format!("refusing {path}")))
    }

    fn decrypt_name(&self, name: &str) -> Result<String, CryptoError> {
        Err(CryptoError::Decryption(format!("refusing {name}")))
    }
}

/// Split a single-part multipart body into (part headers, data)
pub fn split_multipart(body: &[u8], boundary: &str) -> (String, Vec<u8>) {
    let header_end = body
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("part header terminator")
        + 4;
    let footer = format!("\r\n--{boundary}--\r\n");
    assert!(
        body.ends_with(footer.as_bytes()),
        "body must end with the closing boundary"
    );

    let headers = String::from_utf8(body[..header_end].to_vec()).expect("utf-8 headers");
    let data = body[header_end..body.len() - footer.len()].to_vec();
    (headers, data)
}

/// Boundary parameter of a multipart content type
pub fn boundary_of(content_type: &str) -> String {
    content_type
        .split("boundary=")
        .nth(1)
        .expect("boundary parameter")
        .trim_matches('"')
        .to_string()
}
