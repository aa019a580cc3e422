//! OCR MCP Server Library
//!
//! This crate provides MCP tools for document OCR:
//! - `process_document`: OCR PDFs and images into markdown or plain text
//! - `extract_tables`: Extract tables as JSON, markdown or CSV
//! - `extract_structured_data`: Extract data matching a JSON schema
//! - `clean_markdown`: Remove repeated headers/footers from markdown
//! - `list_documents`: List PDF and image files in a directory (local mode)

pub mod config;
pub mod error;
pub mod ocr;
pub mod server;
pub mod source;
pub mod text;

pub use config::{DeploymentMode, ServerConfig};
pub use error::{Error, Result};
pub use ocr::{MistralOcrClient, OcrEngine};
pub use server::{run_server, run_server_with_config, DocumentSource, OcrServer};
