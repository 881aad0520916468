//! charmfs Library
//!
//! Encrypted remote filesystem adapter for Charm-style `/v1/fs` storage.
//!
//! # Features
//!
//! - **Client-side Encryption**: contents sealed with XChaCha20-Poly1305 STREAM
//! - **Opaque Paths**: every path segment encrypted deterministically
//! - **Streaming Uploads**: multipart body with an exact `Content-Length`,
//!   fed through a pipe while the request is in flight
//! - **File Semantics**: list, stat, open, put, remove, rmdir
//!
//! # Example
//!
//! ```no_run
//! use charmfs::{config::Config, fs::RemoteFs};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("charmfs.yaml")?;
//!     let fs = RemoteFs::from_config(&config)?;
//!     fs.put("notes/a.txt", &b"hello world"[..]).await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod crypto;
pub mod fs;
pub mod metrics;
pub mod upload;

// Re-export commonly used types
pub use config::Config;
pub use fs::RemoteFs;
pub use upload::{StreamingUploader, UploadError, UploadOutcome};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
