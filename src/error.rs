//! Error types for OCR MCP Server

use crate::text::PageSpecError;
use thiserror::Error;

/// Result type alias for OCR MCP Server
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for OCR MCP Server
#[derive(Error, Debug)]
pub enum Error {
    /// Document file not found
    #[error("Document not found: {path}")]
    DocumentNotFound { path: String },

    /// File content is not a supported PDF or image format
    #[error("Unsupported document format: {reason}")]
    UnsupportedFormat { reason: String },

    /// Invalid page specification
    #[error("Invalid page specification: {0}")]
    PageSpec(#[from] PageSpecError),

    /// None of the requested pages exist in the document
    #[error("No requested pages exist (document has {total} pages)")]
    NoPagesSelected { total: u32 },

    /// Cache key not found
    #[error("Cache key not found: {key}")]
    CacheKeyNotFound { key: String },

    /// Source resolution error
    #[error("Failed to resolve source: {reason}")]
    SourceResolution { reason: String },

    /// Filesystem access requested in remote mode
    #[error("Filesystem access is not available: {operation}")]
    FilesystemUnavailable { operation: String },

    /// Path access denied (outside allowed resource directories)
    #[error("Path access denied: {path}")]
    PathAccessDenied { path: String },

    /// Document too large
    #[error("Document too large: {size} bytes (max: {max_size} bytes)")]
    DocumentTooLarge { size: u64, max_size: u64 },

    /// Filename filter is not a valid glob pattern
    #[error("Invalid file pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Extraction schema is not usable
    #[error("Invalid schema: {reason}")]
    InvalidSchema { reason: String },

    /// No OCR API key configured
    #[error("MISTRAL_API_KEY is not set")]
    MissingApiKey,

    /// OCR service rejected the credentials
    #[error("OCR authentication failed (status {status}): {message}")]
    OcrAuth { status: u16, message: String },

    /// OCR service returned an error response
    #[error("OCR API error (status {status}): {message}")]
    OcrApi { status: u16, message: String },

    /// OCR service kept rate limiting after all retries
    #[error("OCR API rate limit exceeded after {attempts} attempts")]
    RateLimited { attempts: u32 },

    /// Invalid configuration
    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    /// Base64 decode error
    #[error("Invalid base64 data: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Return a sanitized error message safe to send to clients.
    /// Internal details (paths, library errors, response bodies) are omitted.
    /// Full details should be logged via tracing before calling this.
    pub fn client_message(&self) -> String {
        match self {
            Error::DocumentNotFound { .. } => "Document not found".to_string(),
            Error::UnsupportedFormat { reason } => format!("Unsupported document format: {}", reason),
            Error::PageSpec(e) => format!("Invalid page specification: {}", e),
            Error::NoPagesSelected { total } => {
                format!("None of the requested pages exist (document has {} pages)", total)
            }
            Error::CacheKeyNotFound { .. } => "Cache key not found".to_string(),
            Error::SourceResolution { reason } => format!("Failed to resolve source: {}", reason),
            Error::FilesystemUnavailable { operation } => {
                format!("Filesystem access is not available: {}", operation)
            }
            Error::PathAccessDenied { .. } => "Access denied".to_string(),
            Error::DocumentTooLarge { max_size, .. } => {
                format!("Document exceeds maximum size of {} bytes", max_size)
            }
            Error::InvalidPattern { pattern, reason } => {
                format!("Invalid file pattern '{}': {}", pattern, reason)
            }
            Error::InvalidSchema { reason } => format!("Invalid schema: {}", reason),
            Error::MissingApiKey => "OCR service is not configured".to_string(),
            Error::OcrAuth { .. } => "OCR service authentication failed".to_string(),
            Error::OcrApi { status, .. } => format!("OCR service error (status {})", status),
            Error::RateLimited { .. } => "OCR service rate limit exceeded".to_string(),
            Error::Config { .. } => "Server configuration error".to_string(),
            Error::Base64Decode(_) => "Invalid base64 data".to_string(),
            Error::HttpRequest(_) => "HTTP request failed".to_string(),
            Error::Io(_) => "I/O error".to_string(),
            Error::Serialization(_) => "Serialization error".to_string(),
        }
    }

    /// Actionable hint for the client, when one exists.
    pub fn suggestion(&self) -> Option<String> {
        let hint = match self {
            Error::DocumentNotFound { .. } => "Check that the path exists and is readable",
            Error::UnsupportedFormat { .. } => {
                "Provide a PDF or an image (PNG, JPEG, GIF, WEBP, TIFF, BMP, AVIF)"
            }
            Error::PageSpec(_) => "Invalid page specification, use format like '1,5,10-15'",
            Error::NoPagesSelected { .. } => "Request pages within the document's page count",
            Error::CacheKeyNotFound { .. } => {
                "The cached result may have been evicted; resubmit the original source"
            }
            Error::FilesystemUnavailable { .. } => {
                "This server has no filesystem access; use a {\"url\": ...} or {\"base64\": ...} source"
            }
            Error::PathAccessDenied { .. } => {
                "Use a path inside one of the server's configured resource directories"
            }
            Error::DocumentTooLarge { .. } => "Split the document or pass it as a URL",
            Error::InvalidPattern { .. } => "Use a glob pattern like '*.pdf' or 'scan-??.png'",
            Error::InvalidSchema { .. } => {
                "Pass a JSON Schema object, e.g. {\"type\": \"object\", \"properties\": {...}}"
            }
            Error::MissingApiKey | Error::OcrAuth { .. } => {
                "Set MISTRAL_API_KEY to a valid Mistral API key"
            }
            Error::RateLimited { .. } => "Wait a moment and retry the request",
            Error::Base64Decode(_) => "Encode the document with standard base64",
            _ => return None,
        };
        Some(hint.to_string())
    }
}
