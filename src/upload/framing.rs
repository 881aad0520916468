//! Multipart body framing
//!
//! Computes the bytes that surround the payload of a single-field
//! `multipart/form-data` body, so the exact `Content-Length` is known
//! before the payload is streamed.

use bytes::Bytes;
use thiserror::Error;

/// Boundary length allowed by RFC 2046
pub const MAX_BOUNDARY_LEN: usize = 70;

/// Characters that force a quoted boundary parameter
const BOUNDARY_TSPECIALS: &[char] = &[
    '(', ')', '<', '>', '@', ',', ';', ':', '\\', '"', '/', '[', ']', '?', '=', ' ',
];

/// Form field carrying the file contents
pub const DATA_FIELD: &str = "data";

/// Framing errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FramingError {
    #[error("Invalid boundary: {0}")]
    InvalidBoundary(String),

    #[error("Name cannot be framed: {0:?}")]
    UnframeableName(String),
}

/// Header and footer of one multipart body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartFraming {
    pub header: Bytes,
    pub footer: Bytes,
    pub total_length: u64,
}

impl MultipartFraming {
    /// Length of the payload this framing was computed for
    pub fn payload_len(&self) -> u64 {
        self.total_length - self.header.len() as u64 - self.footer.len() as u64
    }
}

/// Builds [`MultipartFraming`] around a payload of known size
#[derive(Debug, Clone)]
pub struct MultipartFramer {
    boundary: String,
}

impl MultipartFramer {
    /// Framer with a random 60 character boundary
    pub fn new() -> Self {
        let raw: [u8; 30] = rand::random();
        Self {
            boundary: hex::encode(raw),
        }
    }

    /// Framer with a caller supplied boundary
    pub fn with_boundary(boundary: impl Into<String>) -> Result<Self, FramingError> {
        let boundary = boundary.into();
        validate_boundary(&boundary)?;
        Ok(Self { boundary })
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Value for the request's `Content-Type` header
    ///
    /// Boundaries containing tspecials or spaces are sent quoted.
    pub fn content_type(&self) -> String {
        if self.boundary.contains(BOUNDARY_TSPECIALS) {
            format!("multipart/form-data; boundary=\"{}\"", self.boundary)
        } else {
            format!("multipart/form-data; boundary={}", self.boundary)
        }
    }

    /// Frame a single file part of `payload_size` bytes
    pub fn frame(
        &self,
        field_name: &str,
        file_name: &str,
        payload_size: u64,
    ) -> Result<MultipartFraming, FramingError> {
        let header = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"{field}\"; filename=\"{file}\"\r\n\
             Content-Type: application/octet-stream\r\n\
             \r\n",
            boundary = self.boundary,
            field = escape_quotes(field_name)?,
            file = escape_quotes(file_name)?,
        );
        let footer = format!("\r\n--{}--\r\n", self.boundary);

        let total_length = header.len() as u64 + payload_size + footer.len() as u64;

        Ok(MultipartFraming {
            header: Bytes::from(header),
            footer: Bytes::from(footer),
            total_length,
        })
    }
}

impl Default for MultipartFramer {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_boundary(boundary: &str) -> Result<(), FramingError> {
    if boundary.is_empty() || boundary.len() > MAX_BOUNDARY_LEN {
        return Err(FramingError::InvalidBoundary(format!(
            "length {} outside 1..={}",
            boundary.len(),
            MAX_BOUNDARY_LEN
        )));
    }

    let allowed = |c: char| {
        c.is_ascii_alphanumeric() || "'()+_,-./:=? ".contains(c)
    };
    if let Some(bad) = boundary.chars().find(|c| !allowed(*c)) {
        return Err(FramingError::InvalidBoundary(format!(
            "character {bad:?} not allowed"
        )));
    }

    if boundary.ends_with(' ') {
        return Err(FramingError::InvalidBoundary(
            "must not end with a space".into(),
        ));
    }

    Ok(())
}

/// Backslash-escape `\` and `"` for a quoted header parameter
fn escape_quotes(name: &str) -> Result<String, FramingError> {
    if name.contains(['\r', '\n', '\0']) {
        return Err(FramingError::UnframeableName(name.to_string()));
    }
    Ok(name.replace('\\', "\\\\").replace('"', "\\\""))
}
