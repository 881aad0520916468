//! Upload module
//!
//! Encrypts a plaintext stream and posts it as a single multipart field
//! with an exact, precomputed `Content-Length`.
//!
//! # Flow
//!
//! 1. Encrypting: plaintext -> [`Encryptor`] -> in-memory ciphertext
//! 2. Framing: multipart header/footer computed from name and ciphertext size
//! 3. Streaming: a producer task writes header, ciphertext chunks and footer
//!    into a [`pipe`] while the calling task dispatches the request that
//!    reads it
//! 4. Join: both sides are awaited; the first recorded error wins
//!
//! # Example
//!
//! ```no_run
//! use charmfs::client::{HttpDispatcher, HttpDispatcherConfig};
//! use charmfs::crypto::{PassthroughEncryptor, PlainPathCipher};
//! use charmfs::upload::{StreamingUploader, UploadOptions};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let dispatcher = HttpDispatcher::new(HttpDispatcherConfig {
//!     base_url: "http://localhost:35354".to_string(),
//!     token: None,
//!     timeout: std::time::Duration::from_secs(30),
//! })?;
//! let uploader = StreamingUploader::new(
//!     Arc::new(dispatcher),
//!     Arc::new(PassthroughEncryptor),
//!     Arc::new(PlainPathCipher),
//!     UploadOptions::default(),
//! );
//!
//! let outcome = uploader.upload("notes/a.txt", &b"hello world"[..]).await?;
//! println!("sent {} bytes", outcome.content_length);
//! # Ok(())
//! # }
//! ```

use crate::client::{DispatchRequest, RequestBody, RequestDispatcher};
use crate::config::UploadConfig;
use crate::crypto::{CryptoError, Encryptor, PathCipher};
use crate::metrics;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::Method;
use std::io;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

pub mod framing;
pub mod pipe;

pub use framing::{FramingError, MultipartFramer, MultipartFraming, DATA_FIELD};
pub use pipe::{pipe, PipeReader, PipeWriter};

/// Default ciphertext bytes per pipe write (64MB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Plaintext read buffer used while encrypting
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Upload errors
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Encryption failed: {0}")]
    Encryption(#[source] CryptoError),

    #[error("Framing failed: {0}")]
    Framing(#[from] FramingError),

    #[error("Transmission failed: {0}")]
    Transmission(String),

    #[error("Path encoding failed: {0}")]
    PathEncoding(#[source] CryptoError),

    #[error("Upload cancelled")]
    Cancelled,
}

impl UploadError {
    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            UploadError::Encryption(_) => "encryption",
            UploadError::Framing(_) => "framing",
            UploadError::Transmission(_) => "transmission",
            UploadError::PathEncoding(_) => "path_encoding",
            UploadError::Cancelled => "cancelled",
        }
    }
}

/// Result of a completed upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub remote_path: String,
    pub encrypted_path: String,
    pub ciphertext_bytes: u64,
    pub content_length: u64,
}

/// Tunables for [`StreamingUploader`]
#[derive(Debug, Clone, Copy)]
pub struct UploadOptions {
    pub chunk_size: usize,
    pub pipe_capacity: usize,
    pub file_mode: u32,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self::from(&UploadConfig::default())
    }
}

impl From<&UploadConfig> for UploadOptions {
    fn from(config: &UploadConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            pipe_capacity: config.pipe_capacity.max(1),
            file_mode: config.file_mode,
        }
    }
}

/// Records the first failure from either side of an upload and cancels
/// the other side
///
/// A producer write that failed only because the request stopped reading
/// is a consequence, not a cause. It is kept as a fallback that a later
/// primary error replaces, and it does not cancel the request side.
struct JoinBarrier {
    first_error: Mutex<Option<(UploadError, bool)>>,
    cancel: CancellationToken,
}

impl JoinBarrier {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            first_error: Mutex::new(None),
            cancel,
        }
    }

    fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn record(&self, err: UploadError) {
        let mut slot = self.first_error.lock();
        match slot.as_ref() {
            None | Some((_, true)) => *slot = Some((err, false)),
            Some(_) => tracing::debug!(error = %err, "Ignoring later upload error"),
        }
        drop(slot);
        self.cancel.cancel();
    }

    fn record_consequence(&self, err: UploadError) {
        let mut slot = self.first_error.lock();
        if slot.is_none() {
            *slot = Some((err, true));
        }
    }

    fn finish(&self) -> Result<(), UploadError> {
        match self.first_error.lock().take() {
            Some((err, _)) => Err(err),
            None => Ok(()),
        }
    }
}

/// Encrypted streaming uploader
pub struct StreamingUploader {
    dispatcher: Arc<dyn RequestDispatcher>,
    encryptor: Arc<dyn Encryptor>,
    path_cipher: Arc<dyn PathCipher>,
    options: UploadOptions,
}

impl StreamingUploader {
    pub fn new(
        dispatcher: Arc<dyn RequestDispatcher>,
        encryptor: Arc<dyn Encryptor>,
        path_cipher: Arc<dyn PathCipher>,
        options: UploadOptions,
    ) -> Self {
        Self {
            dispatcher,
            encryptor,
            path_cipher,
            options: UploadOptions {
                chunk_size: options.chunk_size.max(1),
                pipe_capacity: options.pipe_capacity.max(1),
                file_mode: options.file_mode,
            },
        }
    }

    pub fn options(&self) -> &UploadOptions {
        &self.options
    }

    /// Encrypt `plaintext` and store it at `remote_path`
    pub async fn upload<R>(&self, remote_path: &str, plaintext: R) -> Result<UploadOutcome, UploadError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.upload_with_cancel(remote_path, plaintext, CancellationToken::new())
            .await
    }

    /// Like [`upload`](Self::upload), aborting both the producer and the
    /// request when `cancel` fires
    #[tracing::instrument(
        name = "upload.streaming",
        skip(self, plaintext, cancel),
        fields(
            remote.path = %remote_path,
            upload.ciphertext_bytes = tracing::field::Empty,
            upload.content_length = tracing::field::Empty
        ),
        err
    )]
    pub async fn upload_with_cancel<R>(
        &self,
        remote_path: &str,
        plaintext: R,
        cancel: CancellationToken,
    ) -> Result<UploadOutcome, UploadError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let start_time = Instant::now();
        let result = self.run(remote_path, plaintext, cancel).await;
        let duration = start_time.elapsed();
        metrics::record_upload_duration(duration.as_secs_f64());

        match &result {
            Ok(outcome) => {
                metrics::record_upload_success(outcome.content_length);

                let span = tracing::Span::current();
                span.record("upload.ciphertext_bytes", outcome.ciphertext_bytes);
                span.record("upload.content_length", outcome.content_length);

                tracing::info!(
                    encrypted_path = %outcome.encrypted_path,
                    content_length = outcome.content_length,
                    duration_ms = duration.as_millis(),
                    "Upload completed"
                );
            }
            Err(e) => {
                metrics::record_upload_failure(e.kind());

                tracing::error!(
                    error = %e,
                    duration_ms = duration.as_millis(),
                    "Upload failed"
                );
            }
        }

        result
    }

    async fn run<R>(
        &self,
        remote_path: &str,
        plaintext: R,
        cancel: CancellationToken,
    ) -> Result<UploadOutcome, UploadError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let ciphertext = self.encrypt(plaintext, &cancel).await?;
        let ciphertext_bytes = ciphertext.len() as u64;

        let framer = MultipartFramer::new();
        let framing = framer.frame(DATA_FIELD, remote_path, ciphertext_bytes)?;
        tracing::debug!(
            header_bytes = framing.header.len(),
            payload_bytes = framing.payload_len(),
            footer_bytes = framing.footer.len(),
            total_length = framing.total_length,
            "Computed multipart framing"
        );

        let encrypted_path = self
            .path_cipher
            .encrypt_path(remote_path)
            .map_err(UploadError::PathEncoding)?;

        let (writer, reader) = pipe(self.options.pipe_capacity);
        let barrier = Arc::new(JoinBarrier::new(cancel.child_token()));

        let producer = tokio::spawn(produce(
            writer,
            framing.clone(),
            ciphertext,
            self.options.chunk_size,
            Arc::clone(&barrier),
        ));

        if let Err(err) = self
            .dispatch(&encrypted_path, &framer, &framing, reader, barrier.token())
            .await
        {
            barrier.record(err);
        }

        if let Err(join_err) = producer.await {
            barrier.record(UploadError::Transmission(format!(
                "body producer task failed: {join_err}"
            )));
        }

        barrier.finish()?;

        Ok(UploadOutcome {
            remote_path: remote_path.to_string(),
            encrypted_path,
            ciphertext_bytes,
            content_length: framing.total_length,
        })
    }

    /// Run the whole plaintext through the encryption filter
    async fn encrypt<R>(&self, mut plaintext: R, cancel: &CancellationToken) -> Result<Bytes, UploadError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut writer = self
            .encryptor
            .encrypting_writer()
            .map_err(UploadError::Encryption)?;
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let n = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                read = plaintext.read(&mut buf) => read
                    .map_err(|e| UploadError::Encryption(CryptoError::Io(e)))?,
            };
            if n == 0 {
                break;
            }
            writer
                .write(&buf[..n])
                .map_err(UploadError::Encryption)?;
        }

        writer.finish().map_err(UploadError::Encryption)
    }

    /// Send the POST whose body is read from `reader`
    ///
    /// `reader` is dropped on every return path, which releases the producer.
    async fn dispatch(
        &self,
        encrypted_path: &str,
        framer: &MultipartFramer,
        framing: &MultipartFraming,
        reader: PipeReader,
        cancel: &CancellationToken,
    ) -> Result<(), UploadError> {
        let mut request = DispatchRequest::new(
            Method::POST,
            format!("/v1/fs/{}?mode={}", encrypted_path, self.options.file_mode),
        );
        let content_type = HeaderValue::from_str(&framer.content_type())
            .map_err(|e| FramingError::InvalidBoundary(e.to_string()))?;
        request.headers.insert(CONTENT_TYPE, content_type);
        request
            .headers
            .insert(CONTENT_LENGTH, HeaderValue::from(framing.total_length));
        request.body = RequestBody::Stream(reader);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(UploadError::Cancelled),
            response = self.dispatcher.dispatch(request) => {
                let response = response.map_err(|e| UploadError::Transmission(e.to_string()))?;
                tracing::debug!(status = %response.status, "Upload request accepted");
                Ok(())
            }
        }
    }
}

/// Producer task: header, ciphertext chunks, footer, then close
async fn produce(
    writer: PipeWriter,
    framing: MultipartFraming,
    ciphertext: Bytes,
    chunk_size: usize,
    barrier: Arc<JoinBarrier>,
) {
    let written = tokio::select! {
        biased;
        _ = barrier.token().cancelled() => None,
        written = write_body(&writer, &framing, &ciphertext, chunk_size) => Some(written),
    };

    let Some(written) = written else {
        barrier.record(UploadError::Cancelled);
        writer.close_with_error(io::Error::other("upload cancelled"));
        return;
    };

    match written {
        Ok(n) if n == framing.total_length => writer.close(),
        Ok(n) => {
            let err = UploadError::Transmission(format!(
                "wrote {} body bytes but declared {}",
                n, framing.total_length
            ));
            let message = err.to_string();
            barrier.record(err);
            writer.close_with_error(io::Error::other(message));
        }
        // The reader is gone; the request side reports why.
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
            barrier.record_consequence(UploadError::Transmission(format!(
                "request stopped reading the body: {e}"
            )));
        }
        Err(e) => {
            let message = format!("writing request body: {e}");
            barrier.record(UploadError::Transmission(message.clone()));
            writer.close_with_error(io::Error::other(message));
        }
    }
}

/// Write the framed body; iteration ends when the ciphertext is exhausted
async fn write_body(
    writer: &PipeWriter,
    framing: &MultipartFraming,
    ciphertext: &Bytes,
    chunk_size: usize,
) -> io::Result<u64> {
    writer.write(framing.header.clone()).await?;
    let mut written = framing.header.len() as u64;

    let mut offset = 0;
    while offset < ciphertext.len() {
        let end = ciphertext.len().min(offset + chunk_size);
        writer.write(ciphertext.slice(offset..end)).await?;
        written += (end - offset) as u64;
        offset = end;
    }

    writer.write(framing.footer.clone()).await?;
    written += framing.footer.len() as u64;

    Ok(written)
}
