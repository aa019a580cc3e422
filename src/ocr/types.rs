//! Wire types for the Mistral OCR endpoint

use crate::text::pages::MAX_PAGE_NUMBER;
use serde::{Deserialize, Serialize};

/// Document reference sent to the OCR service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OcrInput {
    /// PDF (or other document) by URL, including `data:` URLs
    DocumentUrl { document_url: String },
    /// Image by URL, including `data:` URLs
    ImageUrl { image_url: String },
}

impl OcrInput {
    /// Approximate in-memory size, used for cache accounting
    pub fn size_bytes(&self) -> usize {
        match self {
            OcrInput::DocumentUrl { document_url } => document_url.len(),
            OcrInput::ImageUrl { image_url } => image_url.len(),
        }
    }
}

/// Structured-output request attached to an OCR call
#[derive(Debug, Clone, Serialize)]
pub struct AnnotationFormat {
    #[serde(rename = "type")]
    pub format_type: &'static str,
    pub json_schema: JsonSchemaSpec,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonSchemaSpec {
    pub name: String,
    pub schema: serde_json::Value,
    pub strict: bool,
}

impl AnnotationFormat {
    pub fn json_schema(name: String, schema: serde_json::Value, strict: bool) -> Self {
        Self {
            format_type: "json_schema",
            json_schema: JsonSchemaSpec {
                name,
                schema,
                strict,
            },
        }
    }
}

/// Body of `POST /ocr`
#[derive(Debug, Clone, Serialize)]
pub struct OcrRequest {
    pub model: String,
    pub document: OcrInput,
    pub include_image_base64: bool,
    /// 0-based page indices; all pages when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pages: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_annotation_format: Option<AnnotationFormat>,
}

impl OcrRequest {
    pub fn new(model: impl Into<String>, document: OcrInput) -> Self {
        Self {
            model: model.into(),
            document,
            include_image_base64: false,
            pages: None,
            document_annotation_format: None,
        }
    }
}

/// Response of `POST /ocr`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OcrResponse {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub pages: Vec<OcrPage>,
    /// JSON text produced for `document_annotation_format`
    #[serde(default)]
    pub document_annotation: Option<String>,
    #[serde(default)]
    pub usage_info: Option<UsageInfo>,
}

impl OcrResponse {
    /// Number of pages in the processed document, never above [`MAX_PAGE_NUMBER`]
    pub fn total_pages(&self) -> u32 {
        let count = u32::try_from(self.pages.len()).unwrap_or(u32::MAX);
        self.pages
            .iter()
            .map(OcrPage::number)
            .max()
            .unwrap_or(0)
            .max(count)
            .min(MAX_PAGE_NUMBER)
    }

    /// Page by 1-indexed page number
    pub fn page(&self, number: u32) -> Option<&OcrPage> {
        self.pages.iter().find(|p| p.number() == number)
    }

    /// Approximate in-memory size, used for cache accounting
    pub fn size_bytes(&self) -> usize {
        self.pages
            .iter()
            .map(|p| {
                p.markdown.len()
                    + p.images
                        .iter()
                        .map(|i| i.image_base64.as_ref().map_or(0, String::len))
                        .sum::<usize>()
            })
            .sum::<usize>()
            + self.document_annotation.as_ref().map_or(0, String::len)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OcrPage {
    /// 0-based page index
    pub index: u32,
    #[serde(default)]
    pub markdown: String,
    #[serde(default)]
    pub images: Vec<OcrImage>,
    #[serde(default)]
    pub dimensions: Option<PageDimensions>,
}

impl OcrPage {
    /// 1-indexed page number
    pub fn number(&self) -> u32 {
        self.index.saturating_add(1)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OcrImage {
    pub id: String,
    #[serde(default)]
    pub top_left_x: Option<u32>,
    #[serde(default)]
    pub top_left_y: Option<u32>,
    #[serde(default)]
    pub bottom_right_x: Option<u32>,
    #[serde(default)]
    pub bottom_right_y: Option<u32>,
    #[serde(default)]
    pub image_base64: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PageDimensions {
    #[serde(default)]
    pub dpi: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub width: u32,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct UsageInfo {
    #[serde(default)]
    pub pages_processed: u32,
    #[serde(default)]
    pub doc_size_bytes: Option<u64>,
}
