//! Remote filesystem adapter
//!
//! Exposes the encrypted `/v1/fs` store as a small file interface: list,
//! stat, open, put, remove and directory semantics. Every remote path is
//! joined onto the configured root and encrypted before it leaves the
//! process; listings are decrypted name by name.
//!
//! # Example
//!
//! ```no_run
//! use charmfs::config::Config;
//! use charmfs::fs::RemoteFs;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load("charmfs.yaml")?;
//! let fs = RemoteFs::from_config(&config)?;
//!
//! fs.put("notes/a.txt", &b"hello world"[..]).await?;
//! for entry in fs.list("notes").await? {
//!     println!("{} ({} bytes)", entry.remote, entry.size);
//! }
//! # Ok(())
//! # }
//! ```

use crate::client::{
    ClientError, DispatchRequest, DispatchResponse, HttpDispatcher, HttpDispatcherConfig,
    RequestDispatcher,
};
use crate::config::Config;
use crate::crypto::{
    CryptoError, DeterministicPathCipher, Encryptor, KeyMaterial, PassthroughEncryptor,
    PathCipher, PlainPathCipher, StreamEncryptor,
};
use crate::metrics;
use crate::upload::{StreamingUploader, UploadError, UploadOptions};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, CONTENT_TYPE, LAST_MODIFIED};
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncRead;

/// Header carrying the permission bits of a stored file
pub const FILE_MODE_HEADER: &str = "x-file-mode";

/// Filesystem errors
#[derive(Error, Debug)]
pub enum FsError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Directory not found: {0}")]
    DirNotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("Operation not supported: {0}")]
    NotSupported(&'static str),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Metadata for a file or directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Path relative to the filesystem root
    pub remote: String,
    pub is_dir: bool,
    /// Stored (ciphertext) size; plaintext size is unknown without a download
    pub size: u64,
    pub mod_time: Option<DateTime<Utc>>,
    pub mode: u32,
}

/// Directory listing as served by the remote
#[derive(Debug, Deserialize)]
struct RemoteFileInfo {
    name: String,
    #[serde(default)]
    is_dir: bool,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    modtime: Option<DateTime<Utc>>,
    #[serde(default)]
    mode: u32,
    #[serde(default)]
    files: Vec<RemoteFileInfo>,
}

/// What a GET on a remote path returned
enum Fetched {
    Dir(RemoteFileInfo),
    File(DispatchResponse),
}

/// Encrypted remote filesystem
pub struct RemoteFs {
    root: String,
    dispatcher: Arc<dyn RequestDispatcher>,
    encryptor: Arc<dyn Encryptor>,
    path_cipher: Arc<dyn PathCipher>,
    uploader: StreamingUploader,
}

impl RemoteFs {
    pub fn new(
        root: impl Into<String>,
        dispatcher: Arc<dyn RequestDispatcher>,
        encryptor: Arc<dyn Encryptor>,
        path_cipher: Arc<dyn PathCipher>,
        options: UploadOptions,
    ) -> Self {
        let uploader = StreamingUploader::new(
            Arc::clone(&dispatcher),
            Arc::clone(&encryptor),
            Arc::clone(&path_cipher),
            options,
        );

        Self {
            root: root.into().trim_matches('/').to_string(),
            dispatcher,
            encryptor,
            path_cipher,
            uploader,
        }
    }

    /// Build an HTTP backed filesystem from configuration
    pub fn from_config(config: &Config) -> Result<Self, FsError> {
        let dispatcher = HttpDispatcher::new(HttpDispatcherConfig::from(&config.remote))?;
        tracing::debug!(url = %dispatcher.base_url(), "Created HTTP dispatcher");

        let (encryptor, path_cipher): (Arc<dyn Encryptor>, Arc<dyn PathCipher>) =
            if config.encryption.enabled {
                let key = config.encryption.key.as_deref().ok_or_else(|| {
                    FsError::Config("encryption.key is required when encryption is enabled".into())
                })?;
                let keys = KeyMaterial::from_base64(key)?;
                (
                    Arc::new(StreamEncryptor::from_keys(&keys)),
                    Arc::new(DeterministicPathCipher::from_keys(&keys)),
                )
            } else {
                tracing::warn!("Encryption disabled: contents and names are sent in the clear");
                (Arc::new(PassthroughEncryptor), Arc::new(PlainPathCipher))
            };

        Ok(Self::new(
            config.remote.root.clone(),
            Arc::new(dispatcher),
            encryptor,
            path_cipher,
            UploadOptions::from(&config.upload),
        ))
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Modification time precision of the remote
    pub fn precision(&self) -> Duration {
        Duration::from_secs(1)
    }

    /// The remote computes no content hashes
    pub fn hashes(&self) -> &'static [&'static str] {
        &[]
    }

    /// List the entries of `dir`
    ///
    /// The remote answers an empty listing for directories that do not
    /// exist, so an empty result is reported as [`FsError::DirNotFound`].
    #[tracing::instrument(name = "fs.list", skip(self), err)]
    pub async fn list(&self, dir: &str) -> Result<Vec<ObjectInfo>, FsError> {
        let result: Result<_, FsError> = async {
            let entries = self.read_dir(dir).await?;
            if entries.is_empty() {
                return Err(FsError::DirNotFound(dir.to_string()));
            }
            Ok(entries)
        }
        .await;
        observe("list", result)
    }

    /// Metadata for `remote`
    #[tracing::instrument(name = "fs.stat", skip(self), err)]
    pub async fn stat(&self, remote: &str) -> Result<ObjectInfo, FsError> {
        let result: Result<_, FsError> = async {
            let info = match self.fetch(remote).await? {
                Fetched::Dir(listing) => ObjectInfo {
                    remote: remote.trim_matches('/').to_string(),
                    is_dir: true,
                    size: listing.size.max(0) as u64,
                    mod_time: listing.modtime,
                    mode: listing.mode,
                },
                Fetched::File(response) => file_info(remote, &response),
            };
            Ok(info)
        }
        .await;
        observe("stat", result)
    }

    /// Download and decrypt `remote`
    #[tracing::instrument(name = "fs.open", skip(self), err)]
    pub async fn open(&self, remote: &str) -> Result<Bytes, FsError> {
        let result: Result<_, FsError> = async {
            match self.fetch(remote).await? {
                Fetched::Dir(_) => Err(FsError::NotFound(format!("{remote} is a directory"))),
                Fetched::File(response) => Ok(self.encryptor.decrypt(response.body)?),
            }
        }
        .await;
        observe("open", result)
    }

    /// Encrypt and upload `reader` to `remote`
    #[tracing::instrument(name = "fs.put", skip(self, reader), err)]
    pub async fn put<R>(&self, remote: &str, reader: R) -> Result<ObjectInfo, FsError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let result: Result<_, FsError> = async {
            let outcome = self.uploader.upload(&self.full_path(remote), reader).await?;
            Ok(ObjectInfo {
                remote: remote.trim_matches('/').to_string(),
                is_dir: false,
                size: outcome.ciphertext_bytes,
                mod_time: None,
                mode: self.uploader.options().file_mode,
            })
        }
        .await;
        observe("put", result)
    }

    /// Uploads of unknown size are not supported
    pub async fn put_stream<R>(&self, _remote: &str, _reader: R) -> Result<ObjectInfo, FsError>
    where
        R: AsyncRead + Unpin + Send,
    {
        Err(FsError::NotSupported("put_stream"))
    }

    /// Delete `remote`
    #[tracing::instrument(name = "fs.remove", skip(self), err)]
    pub async fn remove(&self, remote: &str) -> Result<(), FsError> {
        let result: Result<_, FsError> = async {
            let path = self.encrypted_path(remote)?;
            tracing::info!(remote = %remote, "Removing object");
            self.dispatcher
                .dispatch(DispatchRequest::delete(format!("/v1/fs/{path}")))
                .await
                .map_err(|e| not_found_as(e, FsError::NotFound(remote.to_string())))?;
            Ok(())
        }
        .await;
        observe("remove", result)
    }

    /// Directories are implicit on the remote
    pub async fn mkdir(&self, _dir: &str) -> Result<(), FsError> {
        Err(FsError::NotSupported("mkdir"))
    }

    /// Succeeds when `dir` has no entries; directories vanish with their
    /// last file
    #[tracing::instrument(name = "fs.rmdir", skip(self), err)]
    pub async fn rmdir(&self, dir: &str) -> Result<(), FsError> {
        let result: Result<_, FsError> = async {
            if !self.read_dir(dir).await?.is_empty() {
                return Err(FsError::DirectoryNotEmpty(dir.to_string()));
            }
            Ok(())
        }
        .await;
        observe("rmdir", result)
    }

    pub async fn set_mod_time(&self, _remote: &str, _mod_time: DateTime<Utc>) -> Result<(), FsError> {
        Err(FsError::NotSupported("set_mod_time"))
    }

    // ========================================================================
    // Private helpers
    // ========================================================================

    fn full_path(&self, remote: &str) -> String {
        join(&self.root, remote)
    }

    fn encrypted_path(&self, remote: &str) -> Result<String, FsError> {
        Ok(self.path_cipher.encrypt_path(&self.full_path(remote))?)
    }

    async fn fetch(&self, remote: &str) -> Result<Fetched, FsError> {
        let path = self.encrypted_path(remote)?;
        let response = self
            .dispatcher
            .dispatch(DispatchRequest::get(format!("/v1/fs/{path}")))
            .await
            .map_err(|e| not_found_as(e, FsError::NotFound(remote.to_string())))?;

        if is_json(&response.headers) {
            let listing: RemoteFileInfo = serde_json::from_slice(&response.body)
                .map_err(|e| FsError::InvalidResponse(format!("directory listing: {e}")))?;
            Ok(Fetched::Dir(listing))
        } else {
            Ok(Fetched::File(response))
        }
    }

    /// Entries of `dir`; missing directories read as empty
    async fn read_dir(&self, dir: &str) -> Result<Vec<ObjectInfo>, FsError> {
        let listing = match self.fetch(dir).await {
            Ok(Fetched::Dir(listing)) => listing,
            Ok(Fetched::File(_)) => return Err(FsError::NotADirectory(dir.to_string())),
            Err(FsError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        tracing::debug!(dir = %dir, listing = %listing.name, entries = listing.files.len(), "Read directory");

        listing
            .files
            .into_iter()
            .map(|entry| {
                let name = self.path_cipher.decrypt_name(&entry.name)?;
                Ok(ObjectInfo {
                    remote: join(dir, &name),
                    is_dir: entry.is_dir,
                    size: entry.size.max(0) as u64,
                    mod_time: entry.modtime,
                    mode: entry.mode,
                })
            })
            .collect()
    }
}

/// Join two `/`-separated paths, dropping empty segments at the seam
fn join(base: &str, rest: &str) -> String {
    let base = base.trim_matches('/');
    let rest = rest.trim_matches('/');
    match (base.is_empty(), rest.is_empty()) {
        (true, _) => rest.to_string(),
        (_, true) => base.to_string(),
        _ => format!("{base}/{rest}"),
    }
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false)
}

fn file_info(remote: &str, response: &DispatchResponse) -> ObjectInfo {
    let mod_time = response
        .headers
        .get(LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
        .map(|t| t.with_timezone(&Utc));
    let mode = response
        .headers
        .get(FILE_MODE_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    ObjectInfo {
        remote: remote.trim_matches('/').to_string(),
        is_dir: false,
        size: response.body.len() as u64,
        mod_time,
        mode,
    }
}

fn not_found_as(err: ClientError, not_found: FsError) -> FsError {
    match err.status() {
        Some(StatusCode::NOT_FOUND) => not_found,
        _ => FsError::Client(err),
    }
}

fn observe<T>(operation: &str, result: Result<T, FsError>) -> Result<T, FsError> {
    metrics::record_fs_operation(operation, result.is_ok());
    result
}
