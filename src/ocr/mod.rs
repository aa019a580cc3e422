//! OCR service layer
//!
//! [`OcrEngine`] is the seam between tool handlers and the OCR backend.
//! [`MistralOcrClient`] talks to the Mistral OCR API over HTTP.

mod client;
mod types;

pub use client::MistralOcrClient;
pub use types::{
    AnnotationFormat, JsonSchemaSpec, OcrImage, OcrInput, OcrPage, OcrRequest, OcrResponse,
    PageDimensions, UsageInfo,
};

use crate::error::Result;
use async_trait::async_trait;

/// Backend that turns a document into per-page markdown
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn process(&self, request: &OcrRequest) -> Result<OcrResponse>;
}
