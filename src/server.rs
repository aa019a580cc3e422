//! MCP Server implementation using rmcp

use crate::config::{DeploymentMode, ServerConfig};
use crate::error::Error;
use crate::ocr::{AnnotationFormat, MistralOcrClient, OcrEngine, OcrPage, OcrRequest, OcrResponse};
use crate::source::{
    resolve_base64, resolve_cache, resolve_path, resolve_url, CacheManager, CachedDocument,
    DocumentKind, ResolvedDocument,
};
use crate::text::{
    clean_repetitions_with_stats, extract_markdown_tables, markdown_to_plain_text, out_of_range,
    parse_page_spec, PageSet,
};
use anyhow::Result;
use rmcp::{
    handler::server::tool::ToolRouter, handler::server::wrapper::Parameters, model::*,
    schemars::JsonSchema, service::RequestContext, tool, tool_handler, tool_router, RoleServer,
    ServerHandler, ServiceExt,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Document source specification
#[derive(Debug, Clone, Serialize, JsonSchema)]
#[serde(untagged)]
pub enum DocumentSource {
    /// File path (local mode only)
    Path {
        /// Path to the PDF or image file
        path: String,
    },
    /// Base64 encoded document data
    Base64 {
        /// Base64 encoded PDF or image content, optionally as a data: URL
        base64: String,
    },
    /// URL the OCR service fetches the document from
    Url {
        /// URL of the PDF or image
        url: String,
    },
    /// Reference to a cached OCR result
    CacheRef {
        /// Cache key from previous operation
        cache_key: String,
    },
}

impl<'de> serde::Deserialize<'de> for DocumentSource {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;

        let Some(obj) = value.as_object() else {
            return Err(serde::de::Error::custom(format!(
                "Invalid source: expected an object with one of \"path\", \"base64\", \"url\", or \"cache_key\", but got {}",
                match &value {
                    serde_json::Value::Array(_) => "an array",
                    serde_json::Value::String(_) => "a string",
                    serde_json::Value::Number(_) => "a number",
                    serde_json::Value::Bool(_) => "a boolean",
                    serde_json::Value::Null => "null",
                    _ => "unknown type",
                }
            )));
        };

        for key in ["path", "base64", "url", "cache_key"] {
            let Some(v) = obj.get(key) else { continue };
            let Some(s) = v.as_str() else {
                return Err(serde::de::Error::custom(format!(
                    "\"{}\" must be a string",
                    key
                )));
            };
            let s = s.to_string();
            return Ok(match key {
                "path" => DocumentSource::Path { path: s },
                "base64" => DocumentSource::Base64 { base64: s },
                "url" => DocumentSource::Url { url: s },
                _ => DocumentSource::CacheRef { cache_key: s },
            });
        }

        let keys: Vec<&String> = obj.keys().collect();
        Err(serde::de::Error::custom(format!(
            "Invalid source: expected an object with one of \"path\", \"base64\", \"url\", or \"cache_key\", but got keys: {:?}",
            keys
        )))
    }
}

/// OCR MCP Server
#[derive(Clone)]
pub struct OcrServer {
    cache: Arc<CacheManager>,
    engine: Arc<dyn OcrEngine>,
    tool_router: ToolRouter<Self>,
    /// Server configuration
    config: Arc<ServerConfig>,
}

// ============================================================================
// Shared response types
// ============================================================================

/// Text format of returned content
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Markdown as produced by the OCR service
    #[default]
    Markdown,
    /// Plain text with markdown syntax stripped
    Text,
}

#[derive(Debug, Clone, Copy, Serialize, JsonSchema)]
pub struct UsageReport {
    pub pages_processed: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_size_bytes: Option<u64>,
}

/// Output of an OCR call shared by the document tools
struct ProcessedDocument {
    source_name: String,
    response: Arc<OcrResponse>,
    cache_key: Option<String>,
    warnings: Vec<String>,
}

impl ProcessedDocument {
    fn usage(&self) -> Option<UsageReport> {
        self.response.usage_info.map(|u| UsageReport {
            pages_processed: u.pages_processed,
            doc_size_bytes: u.doc_size_bytes,
        })
    }
}

// ============================================================================
// Request/Response types for process_document
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ProcessDocumentParams {
    /// Documents to process
    pub sources: Vec<DocumentSource>,
    /// Page selection (e.g., "1,5,10-15"). All pages when omitted.
    #[serde(default)]
    pub pages: Option<String>,
    /// Output format: "markdown" (default) or "text"
    #[serde(default)]
    pub format: OutputFormat,
    /// Remove running headers/footers and other repeated lines
    #[serde(default)]
    pub clean_repetitions: bool,
    /// Include extracted images (base64)
    #[serde(default)]
    pub include_images: bool,
    /// Save the content to this file (local mode only). With several sources,
    /// a numeric suffix is added per source.
    #[serde(default)]
    pub output_path: Option<String>,
    /// Cache the OCR result and return a cache key
    #[serde(default)]
    pub cache: bool,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct ImageInfo {
    /// Page number (1-indexed)
    pub page: u32,
    /// Image identifier as referenced in the markdown
    pub id: String,
    /// Bounding box [top_left_x, top_left_y, bottom_right_x, bottom_right_y]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[u32; 4]>,
    /// Base64 encoded image data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_base64: Option<String>,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct CleaningReport {
    /// Cleaning method label
    pub method: String,
    /// Number of lines removed
    pub lines_removed: usize,
}

#[derive(Debug, Default, Serialize, JsonSchema)]
pub struct ProcessDocumentResult {
    pub source: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    pub format: OutputFormat,
    pub content: String,
    /// Pages in the document
    pub total_pages: u32,
    /// Page numbers included in content
    pub pages: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<ImageInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleaning: Option<CleaningReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageReport>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

// ============================================================================
// Request/Response types for extract_tables
// ============================================================================

/// Rendering of extracted tables
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TableFormat {
    /// Headers and rows as JSON arrays
    #[default]
    Json,
    /// Original markdown table
    Markdown,
    /// Comma separated values
    Csv,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExtractTablesParams {
    /// Documents to process
    pub sources: Vec<DocumentSource>,
    /// Page selection (e.g., "1,5,10-15"). All pages when omitted.
    #[serde(default)]
    pub pages: Option<String>,
    /// Table format: "json" (default), "markdown" or "csv"
    #[serde(default)]
    pub format: TableFormat,
    /// Cache the OCR result and return a cache key
    #[serde(default)]
    pub cache: bool,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct TableInfo {
    /// Page number (1-indexed)
    pub page: u32,
    /// Table index within the page (0-indexed)
    pub index: u32,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    /// Markdown or CSV rendering, depending on the requested format
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Default, Serialize, JsonSchema)]
pub struct ExtractTablesResult {
    pub source: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    pub total_pages: u32,
    pub tables: Vec<TableInfo>,
    pub total_tables: u32,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

// ============================================================================
// Request/Response types for extract_structured_data
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExtractStructuredDataParams {
    /// Documents to process
    pub sources: Vec<DocumentSource>,
    /// JSON Schema describing the object to extract
    pub schema: serde_json::Value,
    /// Name of the schema (default: "document_schema")
    #[serde(default = "default_schema_name")]
    pub schema_name: String,
    /// Page selection (e.g., "1-3"). All pages when omitted.
    #[serde(default)]
    pub pages: Option<String>,
    /// Require output to match the schema exactly (default: true)
    #[serde(default = "default_true")]
    pub strict: bool,
}

fn default_schema_name() -> String {
    "document_schema".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Serialize, JsonSchema)]
pub struct ExtractStructuredDataResult {
    pub source: String,
    pub success: bool,
    pub schema_name: String,
    /// Extracted object
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub total_pages: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageReport>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

// ============================================================================
// Request/Response types for clean_markdown
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CleanMarkdownParams {
    /// Markdown text to clean
    pub markdown: String,
    /// Output format: "markdown" (default) or "text"
    #[serde(default)]
    pub format: OutputFormat,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct CleanMarkdownResult {
    pub success: bool,
    pub format: OutputFormat,
    pub content: String,
    /// Cleaning method label
    pub method: String,
    pub original_lines: usize,
    pub lines_removed: usize,
    pub warnings: Vec<String>,
}

// ============================================================================
// Request/Response types for list_documents
// ============================================================================

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListDocumentsParams {
    /// Directory to search for documents
    pub directory: String,
    /// Search subdirectories recursively (default: false)
    #[serde(default)]
    pub recursive: bool,
    /// Filename pattern to filter (e.g., "scan*.png"). Supports glob patterns.
    #[serde(default)]
    pub pattern: Option<String>,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct DocumentFileInfo {
    /// Full path to the file
    pub path: String,
    /// Filename only
    pub name: String,
    /// Format detected from the extension (pdf, png, jpeg, ...)
    pub kind: String,
    /// File size in bytes
    pub size: u64,
    /// Last modified time (ISO 8601 format)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct ListDocumentsResult {
    /// Directory that was searched
    pub directory: String,
    /// Documents found
    pub files: Vec<DocumentFileInfo>,
    /// Total number of files found
    pub total_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

// ============================================================================
// Tool implementations
// ============================================================================

const SOURCE_FORMAT_HELP: &str = "Source format: each element must be one of {\"path\": \"/absolute/path.pdf\"} (local mode only), {\"url\": \"https://...\"}, {\"base64\": \"...\"}, or {\"cache_key\": \"...\"}";

#[tool_router]
impl OcrServer {
    /// Create a server backed by the Mistral OCR API
    pub fn with_config(config: ServerConfig) -> crate::error::Result<Self> {
        let engine = MistralOcrClient::new(&config)?;
        Ok(Self::with_engine(config, Arc::new(engine)))
    }

    /// Create a server with a custom OCR engine
    pub fn with_engine(config: ServerConfig, engine: Arc<dyn OcrEngine>) -> Self {
        let cache = CacheManager::new(config.cache_max_entries, config.cache_max_bytes);
        Self {
            cache: Arc::new(cache),
            engine,
            tool_router: Self::tool_router(),
            config: Arc::new(config),
        }
    }

    /// OCR documents into markdown or plain text
    #[tool(
        description = "OCR PDF or image documents into markdown or plain text. Supports page selection (e.g. \"1,5,10-15\"), removal of repeated headers/footers, image extraction, caching and (local mode) saving to a file.

Source format: each element must be one of {\"path\": \"/absolute/path.pdf\"} (local mode only), {\"url\": \"https://...\"}, {\"base64\": \"...\"}, or {\"cache_key\": \"...\"}"
    )]
    async fn process_document(
        &self,
        Parameters(params): Parameters<ProcessDocumentParams>,
    ) -> String {
        let mut results = Vec::new();
        let total = params.sources.len();

        for (index, source) in params.sources.iter().enumerate() {
            let output_path = params
                .output_path
                .as_deref()
                .map(|p| numbered_output_path(p, index, total));
            let result = self
                .process_process_document(source, &params, output_path.as_deref())
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "process_document failed");
                    ProcessDocumentResult {
                        source: Self::source_name(source),
                        format: params.format,
                        error: Some(e.client_message()),
                        suggestion: e.suggestion(),
                        ..Default::default()
                    }
                });
            results.push(result);
        }

        let response = serde_json::json!({ "results": results });
        serde_json::to_string_pretty(&response).unwrap_or_default()
    }

    /// Extract tables from documents
    #[tool(
        description = "OCR PDF or image documents and extract the tables they contain, per page, as JSON rows, markdown or CSV.

Source format: each element must be one of {\"path\": \"/absolute/path.pdf\"} (local mode only), {\"url\": \"https://...\"}, {\"base64\": \"...\"}, or {\"cache_key\": \"...\"}"
    )]
    async fn extract_tables(&self, Parameters(params): Parameters<ExtractTablesParams>) -> String {
        let mut results = Vec::new();

        for source in &params.sources {
            let result = self
                .process_extract_tables(source, &params)
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "extract_tables failed");
                    ExtractTablesResult {
                        source: Self::source_name(source),
                        error: Some(e.client_message()),
                        suggestion: e.suggestion(),
                        ..Default::default()
                    }
                });
            results.push(result);
        }

        let response = serde_json::json!({ "results": results });
        serde_json::to_string_pretty(&response).unwrap_or_default()
    }

    /// Extract structured data matching a JSON schema
    #[tool(
        description = "OCR PDF or image documents and extract a JSON object matching the supplied JSON Schema (e.g. invoice fields, form values).

Source format: each element must be one of {\"path\": \"/absolute/path.pdf\"} (local mode only), {\"url\": \"https://...\"}, {\"base64\": \"...\"}, or {\"cache_key\": \"...\"}"
    )]
    async fn extract_structured_data(
        &self,
        Parameters(params): Parameters<ExtractStructuredDataParams>,
    ) -> String {
        let mut results = Vec::new();

        for source in &params.sources {
            let result = self
                .process_extract_structured_data(source, &params)
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "extract_structured_data failed");
                    ExtractStructuredDataResult {
                        source: Self::source_name(source),
                        schema_name: params.schema_name.clone(),
                        error: Some(e.client_message()),
                        suggestion: e.suggestion(),
                        ..Default::default()
                    }
                });
            results.push(result);
        }

        let response = serde_json::json!({ "results": results });
        serde_json::to_string_pretty(&response).unwrap_or_default()
    }

    /// Remove repeated boilerplate lines from markdown
    #[tool(
        description = "Clean OCR markdown by removing lines repeated 3 or more times (running headers, footers, bylines). Page markers, footnote markers, DOIs and bare page numbers are always kept. Optionally converts the result to plain text."
    )]
    async fn clean_markdown(&self, Parameters(params): Parameters<CleanMarkdownParams>) -> String {
        let result = Self::process_clean_markdown(&params);
        serde_json::to_string_pretty(&result).unwrap_or_default()
    }

    /// List OCR-able documents in a directory
    #[tool(
        description = "List PDF and image files in a directory. Local mode only. Supports recursive search and glob patterns."
    )]
    async fn list_documents(
        &self,
        Parameters(params): Parameters<ListDocumentsParams>,
    ) -> String {
        let result = self.process_list_documents(&params).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "list_documents failed");
            ListDocumentsResult {
                directory: params.directory.clone(),
                files: vec![],
                total_count: 0,
                error: Some(e.client_message()),
                suggestion: e.suggestion(),
            }
        });
        serde_json::to_string_pretty(&result).unwrap_or_default()
    }
}

impl OcrServer {
    fn source_name(source: &DocumentSource) -> String {
        match source {
            DocumentSource::Path { path } => path.clone(),
            DocumentSource::Base64 { .. } => "<base64>".to_string(),
            DocumentSource::Url { url } => url.clone(),
            DocumentSource::CacheRef { cache_key } => format!("<cache:{}>", cache_key),
        }
    }

    fn require_filesystem(&self, operation: &str) -> crate::error::Result<()> {
        if self.config.mode.has_filesystem() {
            Ok(())
        } else {
            Err(Error::FilesystemUnavailable {
                operation: operation.to_string(),
            })
        }
    }

    fn resolve_source(&self, source: &DocumentSource) -> crate::error::Result<ResolvedDocument> {
        match source {
            DocumentSource::Path { path } => {
                self.require_filesystem("path sources")?;
                let path = self.validate_path_access(path)?;
                resolve_path(path, self.config.max_file_bytes)
            }
            DocumentSource::Base64 { base64 } => resolve_base64(base64, self.config.max_file_bytes),
            DocumentSource::Url { url } => resolve_url(url),
            DocumentSource::CacheRef { cache_key } => resolve_cache(cache_key, &self.cache),
        }
    }

    /// Validate that a path is within allowed resource directories.
    /// If no resource_dirs are configured, all paths are allowed.
    fn validate_path_access(&self, path: &str) -> crate::error::Result<PathBuf> {
        if self.config.resource_dirs.is_empty() {
            return Ok(PathBuf::from(path));
        }

        let canonical = std::fs::canonicalize(path).map_err(|_| Error::PathAccessDenied {
            path: path.to_string(),
        })?;

        if self.within_resource_dirs(&canonical) {
            Ok(canonical)
        } else {
            Err(Error::PathAccessDenied {
                path: path.to_string(),
            })
        }
    }

    /// Validate that an output path is within allowed resource directories.
    /// Canonicalizes the parent directory since the output file may not exist yet.
    fn validate_output_path_access(&self, path: &str) -> crate::error::Result<PathBuf> {
        if self.config.resource_dirs.is_empty() {
            return Ok(PathBuf::from(path));
        }

        let path_obj = Path::new(path);
        let parent = path_obj
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));

        let canonical_parent = std::fs::canonicalize(parent).map_err(|_| Error::PathAccessDenied {
            path: path.to_string(),
        })?;

        let canonical_target =
            canonical_parent.join(path_obj.file_name().unwrap_or(std::ffi::OsStr::new("")));

        if self.within_resource_dirs(&canonical_target) {
            Ok(canonical_target)
        } else {
            Err(Error::PathAccessDenied {
                path: path.to_string(),
            })
        }
    }

    fn within_resource_dirs(&self, canonical: &Path) -> bool {
        self.config.resource_dirs.iter().any(|dir| {
            std::fs::canonicalize(dir)
                .map(|cd| canonical.starts_with(&cd))
                .unwrap_or(false)
        })
    }

    /// Write output data to a file path, with sandbox validation.
    fn write_output(&self, path_str: &str, data: &[u8]) -> crate::error::Result<String> {
        self.require_filesystem("saving output files")?;
        self.validate_output_path_access(path_str)?;

        let path = Path::new(path_str);

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        std::fs::write(path, data)?;
        tracing::info!(path = %path.display(), bytes = data.len(), "saved OCR output");
        Ok(path_str.to_string())
    }

    /// Resolve a source and run OCR on it, reusing a cached result when the
    /// source is a cache key.
    async fn ocr_document(
        &self,
        source: &DocumentSource,
        include_images: bool,
        cache: bool,
    ) -> crate::error::Result<ProcessedDocument> {
        let resolved = self.resolve_source(source)?;
        let mut warnings = Vec::new();

        if let Some(cached) = resolved.cached {
            tracing::debug!(source = %resolved.source_name, "using cached OCR result");
            let images_missing = cached
                .response
                .pages
                .iter()
                .flat_map(|p| p.images.iter())
                .any(|img| img.image_base64.is_none());
            if include_images && images_missing {
                warnings.push(
                    "Cached result was created without image data; resubmit the original source with include_images to get it"
                        .to_string(),
                );
            }
            let cache_key = match source {
                DocumentSource::CacheRef { cache_key } if cache => Some(cache_key.clone()),
                _ => None,
            };
            return Ok(ProcessedDocument {
                source_name: resolved.source_name,
                response: cached.response,
                cache_key,
                warnings,
            });
        }

        let mut request = OcrRequest::new(self.config.model.clone(), resolved.input.clone());
        request.include_image_base64 = include_images;

        tracing::info!(source = %resolved.source_name, model = %self.config.model, "running OCR");
        let response = Arc::new(self.engine.process(&request).await?);

        let cache_key = if cache {
            let key = self.cache.generate_unique_key();
            let entry = CachedDocument {
                input: resolved.input,
                response: Arc::clone(&response),
            };
            if self.cache.put(key.clone(), entry) {
                Some(key)
            } else {
                warnings.push("OCR result is too large to cache".to_string());
                None
            }
        } else {
            None
        };

        Ok(ProcessedDocument {
            source_name: resolved.source_name,
            response,
            cache_key,
            warnings,
        })
    }

    async fn process_process_document(
        &self,
        source: &DocumentSource,
        params: &ProcessDocumentParams,
        output_path: Option<&str>,
    ) -> crate::error::Result<ProcessDocumentResult> {
        // Validate everything cheap before paying for an OCR call
        let requested = parse_optional_page_spec(params.pages.as_deref())?;
        if let Some(path) = output_path {
            self.require_filesystem("saving output files")?;
            self.validate_output_path_access(path)?;
        }

        let doc = self
            .ocr_document(source, params.include_images, params.cache)
            .await?;
        let mut warnings = doc.warnings.clone();

        let total_pages = doc.response.total_pages();
        let (selected, page_warnings) = select_pages(requested.as_ref(), total_pages)?;
        warnings.extend(page_warnings);

        let pages: Vec<&OcrPage> = selected
            .iter()
            .filter_map(|&n| doc.response.page(n))
            .collect();

        let mut content = pages
            .iter()
            .map(|p| p.markdown.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let cleaning = if params.clean_repetitions {
            let outcome = clean_repetitions_with_stats(&content);
            tracing::debug!(lines_removed = outcome.lines_removed, "cleaned repeated lines");
            content = outcome.text;
            Some(CleaningReport {
                method: outcome.method.to_string(),
                lines_removed: outcome.lines_removed,
            })
        } else {
            None
        };

        if params.format == OutputFormat::Text {
            content = markdown_to_plain_text(&content);
        }

        let images = params.include_images.then(|| {
            pages
                .iter()
                .flat_map(|p| {
                    p.images.iter().map(move |img| ImageInfo {
                        page: p.number(),
                        id: img.id.clone(),
                        bbox: match (
                            img.top_left_x,
                            img.top_left_y,
                            img.bottom_right_x,
                            img.bottom_right_y,
                        ) {
                            (Some(a), Some(b), Some(c), Some(d)) => Some([a, b, c, d]),
                            _ => None,
                        },
                        data_base64: img.image_base64.clone(),
                    })
                })
                .collect::<Vec<_>>()
        });

        let saved_to = match output_path {
            Some(path) => Some(self.write_output(path, content.as_bytes())?),
            None => None,
        };

        Ok(ProcessDocumentResult {
            source: doc.source_name.clone(),
            success: true,
            cache_key: doc.cache_key.clone(),
            format: params.format,
            content,
            total_pages,
            pages: pages.iter().map(|p| p.number()).collect(),
            images,
            cleaning,
            saved_to,
            usage: doc.usage(),
            warnings,
            error: None,
            suggestion: None,
        })
    }

    async fn process_extract_tables(
        &self,
        source: &DocumentSource,
        params: &ExtractTablesParams,
    ) -> crate::error::Result<ExtractTablesResult> {
        let requested = parse_optional_page_spec(params.pages.as_deref())?;
        let doc = self.ocr_document(source, false, params.cache).await?;
        let mut warnings = doc.warnings.clone();

        let total_pages = doc.response.total_pages();
        let (selected, page_warnings) = select_pages(requested.as_ref(), total_pages)?;
        warnings.extend(page_warnings);

        let mut tables = Vec::new();
        for page in selected.iter().filter_map(|&n| doc.response.page(n)) {
            for (index, table) in extract_markdown_tables(&page.markdown).into_iter().enumerate() {
                let content = match params.format {
                    TableFormat::Json => None,
                    TableFormat::Markdown => Some(table.markdown.clone()),
                    TableFormat::Csv => Some(table.to_csv()),
                };
                tables.push(TableInfo {
                    page: page.number(),
                    index: index as u32,
                    headers: table.headers,
                    rows: table.rows,
                    content,
                });
            }
        }

        if tables.is_empty() {
            warnings.push("No tables found in the selected pages".to_string());
        }

        Ok(ExtractTablesResult {
            source: doc.source_name.clone(),
            success: true,
            cache_key: doc.cache_key.clone(),
            total_pages,
            total_tables: tables.len() as u32,
            tables,
            warnings,
            error: None,
            suggestion: None,
        })
    }

    async fn process_extract_structured_data(
        &self,
        source: &DocumentSource,
        params: &ExtractStructuredDataParams,
    ) -> crate::error::Result<ExtractStructuredDataResult> {
        validate_schema(&params.schema, &params.schema_name)?;
        let requested = parse_optional_page_spec(params.pages.as_deref())?;

        let resolved = self.resolve_source(source)?;
        let mut warnings = Vec::new();

        // Page numbers are only checkable up front when the document was seen before
        let pages = match (&requested, &resolved.cached) {
            (Some(requested), Some(cached)) => {
                let (selected, page_warnings) =
                    select_pages(Some(requested), cached.response.total_pages())?;
                warnings.extend(page_warnings);
                Some(selected)
            }
            (Some(requested), None) => Some(requested.iter().copied().collect()),
            (None, _) => None,
        };

        let mut request = OcrRequest::new(self.config.model.clone(), resolved.input);
        request.pages = pages.map(|p: Vec<u32>| p.into_iter().map(|n| n - 1).collect());
        request.document_annotation_format = Some(AnnotationFormat::json_schema(
            params.schema_name.trim().to_string(),
            params.schema.clone(),
            params.strict,
        ));

        tracing::info!(
            source = %resolved.source_name,
            schema = %params.schema_name,
            "running OCR with document annotation"
        );
        let response = self.engine.process(&request).await?;

        let annotation = response
            .document_annotation
            .as_deref()
            .ok_or_else(|| Error::OcrApi {
                status: 200,
                message: "response did not include a document annotation".to_string(),
            })?;

        let data = match serde_json::from_str::<serde_json::Value>(annotation) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "document annotation is not valid JSON");
                warnings.push(
                    "Extracted data is not valid JSON; returning the raw text".to_string(),
                );
                serde_json::Value::String(annotation.to_string())
            }
        };

        Ok(ExtractStructuredDataResult {
            source: resolved.source_name,
            success: true,
            schema_name: params.schema_name.clone(),
            data: Some(data),
            total_pages: response.total_pages(),
            usage: response.usage_info.map(|u| UsageReport {
                pages_processed: u.pages_processed,
                doc_size_bytes: u.doc_size_bytes,
            }),
            warnings,
            error: None,
            suggestion: None,
        })
    }

    fn process_clean_markdown(params: &CleanMarkdownParams) -> CleanMarkdownResult {
        let outcome = clean_repetitions_with_stats(&params.markdown);
        let content = match params.format {
            OutputFormat::Markdown => outcome.text,
            OutputFormat::Text => markdown_to_plain_text(&outcome.text),
        };

        let mut warnings = Vec::new();
        if outcome.lines_removed == 0 {
            warnings.push("No repeated lines found".to_string());
        }

        CleanMarkdownResult {
            success: true,
            format: params.format,
            content,
            method: outcome.method.to_string(),
            original_lines: outcome.original_lines,
            lines_removed: outcome.lines_removed,
            warnings,
        }
    }

    fn process_list_documents(
        &self,
        params: &ListDocumentsParams,
    ) -> crate::error::Result<ListDocumentsResult> {
        self.require_filesystem("listing directories")?;

        // Sandbox check: if resource_dirs are configured, directory must be within them
        if !self.config.resource_dirs.is_empty() {
            let canonical =
                std::fs::canonicalize(&params.directory).map_err(|_| Error::PathAccessDenied {
                    path: params.directory.clone(),
                })?;
            if !self.within_resource_dirs(&canonical) {
                return Err(Error::PathAccessDenied {
                    path: params.directory.clone(),
                });
            }
        }

        let dir_path = Path::new(&params.directory);

        if !dir_path.is_dir() {
            return Err(Error::DocumentNotFound {
                path: params.directory.clone(),
            });
        }

        let mut files = Vec::new();

        // Compile glob pattern if provided
        let pattern = params
            .pattern
            .as_deref()
            .map(|p| {
                glob::Pattern::new(p).map_err(|e| Error::InvalidPattern {
                    pattern: p.to_string(),
                    reason: e.msg.to_string(),
                })
            })
            .transpose()?;

        Self::collect_documents(dir_path, params.recursive, &pattern, &mut files)?;

        // Sort by path for consistent ordering
        files.sort_by(|a, b| a.path.cmp(&b.path));

        let total_count = files.len() as u32;

        Ok(ListDocumentsResult {
            directory: params.directory.clone(),
            files,
            total_count,
            error: None,
            suggestion: None,
        })
    }

    fn collect_documents(
        dir: &Path,
        recursive: bool,
        pattern: &Option<glob::Pattern>,
        files: &mut Vec<DocumentFileInfo>,
    ) -> crate::error::Result<()> {
        let entries = std::fs::read_dir(dir).map_err(Error::Io)?;

        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue, // Skip entries we can't read
            };

            let path = entry.path();

            if path.is_dir() {
                if recursive {
                    let _ = Self::collect_documents(&path, recursive, pattern, files);
                }
                continue;
            }

            let Some(kind) = path
                .extension()
                .and_then(|e| e.to_str())
                .and_then(DocumentKind::from_extension)
            else {
                continue;
            };

            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();

            if let Some(ref pat) = pattern {
                if !pat.matches(&name) {
                    continue;
                }
            }

            let metadata = std::fs::metadata(&path).ok();
            let size = metadata.as_ref().map(|m| m.len()).unwrap_or(0);
            let modified = metadata
                .as_ref()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .and_then(|d| chrono::DateTime::from_timestamp(d.as_secs() as i64, 0))
                .map(|dt| dt.to_rfc3339());

            files.push(DocumentFileInfo {
                path: path.to_string_lossy().to_string(),
                name,
                kind: kind.as_str().to_string(),
                size,
                modified,
            });
        }

        Ok(())
    }
}

/// Parse an optional page specification. Blank strings select all pages.
fn parse_optional_page_spec(spec: Option<&str>) -> crate::error::Result<Option<PageSet>> {
    match spec.map(str::trim).filter(|s| !s.is_empty()) {
        Some(spec) => Ok(Some(parse_page_spec(spec)?)),
        None => Ok(None),
    }
}

/// Reconcile requested pages with the document's page count.
/// Out-of-range pages become warnings; selecting no existing page is an error.
fn select_pages(
    requested: Option<&PageSet>,
    total_pages: u32,
) -> crate::error::Result<(Vec<u32>, Vec<String>)> {
    let Some(requested) = requested else {
        return Ok(((1..=total_pages).collect(), Vec::new()));
    };

    let mut warnings = Vec::new();
    let missing = out_of_range(requested, total_pages);
    if !missing.is_empty() {
        warnings.push(format!(
            "Requested pages out of range (document has {} pages): {}",
            total_pages,
            format_page_list(&missing)
        ));
    }

    let selected: Vec<u32> = requested
        .iter()
        .copied()
        .filter(|&p| p <= total_pages)
        .collect();

    if selected.is_empty() {
        return Err(Error::NoPagesSelected { total: total_pages });
    }

    Ok((selected, warnings))
}

/// Compact ascending page numbers into ranges, e.g. `[3, 4, 5, 9]` -> `"3-5, 9"`.
fn format_page_list(pages: &[u32]) -> String {
    let mut parts = Vec::new();
    let mut iter = pages.iter().copied().peekable();

    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{}-{}", start, end));
        }
    }

    parts.join(", ")
}

/// Output path for source `index` of `total`: unchanged for a single source,
/// otherwise `name-N.ext`.
fn numbered_output_path(path: &str, index: usize, total: usize) -> String {
    if total <= 1 {
        return path.to_string();
    }

    let p = Path::new(path);
    let stem = p
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let file_name = match p.extension() {
        Some(ext) => format!("{}-{}.{}", stem, index + 1, ext.to_string_lossy()),
        None => format!("{}-{}", stem, index + 1),
    };

    p.with_file_name(file_name).to_string_lossy().to_string()
}

fn validate_schema(schema: &serde_json::Value, name: &str) -> crate::error::Result<()> {
    let Some(obj) = schema.as_object() else {
        return Err(Error::InvalidSchema {
            reason: "schema must be a JSON object".to_string(),
        });
    };
    if obj.is_empty() {
        return Err(Error::InvalidSchema {
            reason: "schema must not be empty".to_string(),
        });
    }
    let name = name.trim();
    if name.is_empty()
        || name.len() > 64
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::InvalidSchema {
            reason: "schema_name must be 1-64 characters of letters, digits, '_' or '-'"
                .to_string(),
        });
    }
    Ok(())
}

#[tool_handler]
impl ServerHandler for OcrServer {
    fn get_info(&self) -> ServerInfo {
        let (capabilities, instructions) = match self.config.mode {
            DeploymentMode::Local => (
                ServerCapabilities::builder()
                    .enable_tools()
                    .enable_resources()
                    .build(),
                "OCR MCP Server converts PDFs and images to markdown or text, extracts tables and \
                 structured data, and cleans repeated headers/footers from markdown. Documents in \
                 configured directories are also exposed as resources.",
            ),
            DeploymentMode::Remote => (
                ServerCapabilities::builder().enable_tools().build(),
                "OCR MCP Server converts PDFs and images to markdown or text, extracts tables and \
                 structured data, and cleans repeated headers/footers from markdown. This server \
                 has no filesystem access: pass documents as url or base64 sources.",
            ),
        };

        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities,
            server_info: Implementation::from_build_env(),
            instructions: Some(format!("{} {}", instructions, SOURCE_FORMAT_HELP)),
        }
    }

    /// List documents from configured directories
    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, ErrorData> {
        let mut resources = Vec::new();

        if self.config.mode.has_filesystem() {
            for dir in self.config.resource_dirs.iter() {
                let params = ListDocumentsParams {
                    directory: dir.clone(),
                    recursive: true,
                    pattern: None,
                };

                let Ok(list_result) = self.process_list_documents(&params) else {
                    continue;
                };

                for file in list_result.files {
                    let uri = format!("file://{}", file.path);
                    let mut resource = RawResource::new(uri, file.name.clone());
                    resource.mime_type = DocumentKind::from_extension(&file.kind)
                        .map(|k| k.mime_type().to_string());
                    resource.description = Some(format!(
                        "{} document ({} bytes){}",
                        file.kind.to_uppercase(),
                        file.size,
                        file.modified
                            .as_ref()
                            .map(|m| format!(", modified: {}", m))
                            .unwrap_or_default()
                    ));
                    resource.size = Some(file.size as u32);

                    resources.push(Annotated {
                        raw: resource,
                        annotations: None,
                    });
                }
            }
        }

        Ok(ListResourcesResult {
            resources,
            next_cursor: None,
            meta: Default::default(),
        })
    }

    /// Read a document resource and return its OCR markdown
    async fn read_resource(
        &self,
        request: ReadResourceRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, ErrorData> {
        let uri = &request.uri;

        if !self.config.mode.has_filesystem() {
            return Err(ErrorData::invalid_params(
                "Resources are not available in remote mode",
                None,
            ));
        }

        let Some(path) = uri.strip_prefix("file://") else {
            return Err(ErrorData::invalid_params(
                "Only file:// URIs are supported",
                None,
            ));
        };

        // Resources are limited to configured directories even when tools are not
        let is_allowed = std::fs::canonicalize(path)
            .map(|canonical| self.within_resource_dirs(&canonical))
            .unwrap_or(false);

        if !is_allowed {
            return Err(ErrorData::invalid_params(
                "Resource not found in configured directories",
                None,
            ));
        }

        let source = DocumentSource::Path {
            path: path.to_string(),
        };

        match self.ocr_document(&source, false, false).await {
            Ok(doc) => {
                let text = doc
                    .response
                    .pages
                    .iter()
                    .map(|p| format!("--- Page {} ---\n{}", p.number(), p.markdown))
                    .collect::<Vec<_>>()
                    .join("\n\n");

                Ok(ReadResourceResult {
                    contents: vec![ResourceContents::TextResourceContents {
                        uri: uri.clone(),
                        mime_type: Some("text/markdown".to_string()),
                        text,
                        meta: Default::default(),
                    }],
                })
            }
            Err(e) => {
                tracing::warn!(error = %e, "read_resource failed");
                Err(ErrorData::internal_error(e.client_message(), None))
            }
        }
    }
}

/// Run the MCP server with configuration from the environment
pub async fn run_server() -> Result<()> {
    run_server_with_config(ServerConfig::from_env()?).await
}

/// Run the MCP server with full configuration.
/// Local mode serves over stdio; remote mode serves streamable HTTP at `/mcp`.
pub async fn run_server_with_config(config: ServerConfig) -> Result<()> {
    if config.api_key.is_none() {
        tracing::warn!("MISTRAL_API_KEY is not set; OCR tools will fail until it is configured");
    }

    match config.mode {
        DeploymentMode::Local => {
            let server = OcrServer::with_config(config)?;

            tracing::info!("OCR MCP Server ready on stdio, waiting for connections...");

            let service = server.serve(rmcp::transport::io::stdio()).await?;
            service.waiting().await?;
        }
        DeploymentMode::Remote => {
            use rmcp::transport::streamable_http_server::{
                session::local::LocalSessionManager, StreamableHttpServerConfig,
                StreamableHttpService,
            };

            let bind_addr = config.bind_addr;
            let server = OcrServer::with_config(config)?;
            let service = StreamableHttpService::new(
                move || Ok(server.clone()),
                LocalSessionManager::default().into(),
                StreamableHttpServerConfig::default(),
            );

            let router = axum::Router::new().nest_service("/mcp", service);
            let listener = tokio::net::TcpListener::bind(bind_addr).await?;

            tracing::info!(addr = %bind_addr, "OCR MCP Server ready on http://{}/mcp", bind_addr);

            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = tokio::signal::ctrl_c().await;
                    tracing::info!("shutting down");
                })
                .await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::{OcrImage, UsageInfo};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// "%PDF-1.4"
    const PDF_BASE64: &str = "JVBERi0xLjQ=";

    /// Engine returning a canned response and recording requests
    struct CannedEngine {
        response: OcrResponse,
        calls: AtomicUsize,
        requests: Mutex<Vec<OcrRequest>>,
    }

    impl CannedEngine {
        fn new(response: OcrResponse) -> Arc<Self> {
            Arc::new(Self {
                response,
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OcrEngine for CannedEngine {
        async fn process(&self, request: &OcrRequest) -> crate::error::Result<OcrResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().push(request.clone());
            Ok(self.response.clone())
        }
    }

    fn page(index: u32, markdown: &str) -> OcrPage {
        OcrPage {
            index,
            markdown: markdown.to_string(),
            ..OcrPage::default()
        }
    }

    fn three_page_response() -> OcrResponse {
        OcrResponse {
            model: "mistral-ocr-test".to_string(),
            pages: vec![
                page(0, "ACME Quarterly\n# Intro\nFirst page.\n1"),
                page(
                    1,
                    "ACME Quarterly\n## Figures\n| Item | Qty |\n|---|---|\n| Bolts | 40 |\n| Nuts | 12 |\n2",
                ),
                page(2, "ACME Quarterly\nSee [the site](https://acme.test) and **notes**.\n3"),
            ],
            document_annotation: None,
            usage_info: Some(UsageInfo {
                pages_processed: 3,
                doc_size_bytes: Some(1024),
            }),
        }
    }

    fn server_with(config: ServerConfig, engine: Arc<CannedEngine>) -> OcrServer {
        OcrServer::with_engine(config, engine)
    }

    fn base64_source() -> DocumentSource {
        DocumentSource::Base64 {
            base64: PDF_BASE64.to_string(),
        }
    }

    fn process_params(source: DocumentSource) -> ProcessDocumentParams {
        ProcessDocumentParams {
            sources: vec![source],
            pages: None,
            format: OutputFormat::Markdown,
            clean_repetitions: false,
            include_images: false,
            output_path: None,
            cache: false,
        }
    }

    fn remote_config() -> ServerConfig {
        ServerConfig {
            mode: DeploymentMode::Remote,
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_source_name() {
        assert_eq!(
            OcrServer::source_name(&DocumentSource::Path {
                path: "/scan.pdf".to_string()
            }),
            "/scan.pdf"
        );
        assert_eq!(OcrServer::source_name(&base64_source()), "<base64>");
        assert_eq!(
            OcrServer::source_name(&DocumentSource::Url {
                url: "https://example.com/scan.pdf".to_string()
            }),
            "https://example.com/scan.pdf"
        );
        assert_eq!(
            OcrServer::source_name(&DocumentSource::CacheRef {
                cache_key: "abc123".to_string()
            }),
            "<cache:abc123>"
        );
    }

    #[test]
    fn test_document_source_deserialization() {
        let source: DocumentSource = serde_json::from_str(r#"{"path": "/a.pdf"}"#).unwrap();
        assert!(matches!(source, DocumentSource::Path { .. }));

        let source: DocumentSource = serde_json::from_str(r#"{"base64": "JVBERi0="}"#).unwrap();
        assert!(matches!(source, DocumentSource::Base64 { .. }));

        let source: DocumentSource =
            serde_json::from_str(r#"{"url": "https://example.com/a.png"}"#).unwrap();
        assert!(matches!(source, DocumentSource::Url { .. }));

        let source: DocumentSource = serde_json::from_str(r#"{"cache_key": "abc"}"#).unwrap();
        assert!(matches!(source, DocumentSource::CacheRef { .. }));
    }

    #[test]
    fn test_document_source_deserialization_errors() {
        let err = serde_json::from_str::<DocumentSource>(r#"{"file": "/a.pdf"}"#).unwrap_err();
        assert!(err.to_string().contains("got keys"));

        let err = serde_json::from_str::<DocumentSource>(r#"{"path": 3}"#).unwrap_err();
        assert!(err.to_string().contains("\"path\" must be a string"));

        let err = serde_json::from_str::<DocumentSource>(r#""/a.pdf""#).unwrap_err();
        assert!(err.to_string().contains("a string"));
    }

    #[test]
    fn test_params_deserialization() {
        let json = r#"{
            "sources": [{"url": "https://example.com/a.pdf"}],
            "pages": "1-5",
            "format": "text"
        }"#;
        let params: ProcessDocumentParams = serde_json::from_str(json).unwrap();
        assert_eq!(params.pages, Some("1-5".to_string()));
        assert_eq!(params.format, OutputFormat::Text);
        assert!(!params.clean_repetitions);
        assert!(!params.cache);

        let json = r#"{"sources": [], "schema": {"type": "object"}}"#;
        let params: ExtractStructuredDataParams = serde_json::from_str(json).unwrap();
        assert_eq!(params.schema_name, "document_schema");
        assert!(params.strict);

        let json = r#"{"sources": [], "format": "csv"}"#;
        let params: ExtractTablesParams = serde_json::from_str(json).unwrap();
        assert_eq!(params.format, TableFormat::Csv);
    }

    #[test]
    fn test_format_page_list() {
        assert_eq!(format_page_list(&[3, 4, 5, 9]), "3-5, 9");
        assert_eq!(format_page_list(&[7]), "7");
        assert_eq!(format_page_list(&[1, 3, 5]), "1, 3, 5");
        assert_eq!(format_page_list(&[]), "");
    }

    #[test]
    fn test_numbered_output_path() {
        assert_eq!(numbered_output_path("/out/scan.md", 0, 1), "/out/scan.md");
        assert_eq!(numbered_output_path("/out/scan.md", 0, 3), "/out/scan-1.md");
        assert_eq!(numbered_output_path("/out/scan.md", 2, 3), "/out/scan-3.md");
        assert_eq!(numbered_output_path("scan", 1, 2), "scan-2");
    }

    #[test]
    fn test_select_pages() {
        let (pages, warnings) = select_pages(None, 3).unwrap();
        assert_eq!(pages, vec![1, 2, 3]);
        assert!(warnings.is_empty());

        let requested = parse_page_spec("2,5-6").unwrap();
        let (pages, warnings) = select_pages(Some(&requested), 3).unwrap();
        assert_eq!(pages, vec![2]);
        assert_eq!(
            warnings,
            vec!["Requested pages out of range (document has 3 pages): 5-6".to_string()]
        );

        let requested = parse_page_spec("7-9").unwrap();
        assert!(matches!(
            select_pages(Some(&requested), 3),
            Err(Error::NoPagesSelected { total: 3 })
        ));
    }

    #[test]
    fn test_parse_optional_page_spec_blank_means_all() {
        assert!(parse_optional_page_spec(None).unwrap().is_none());
        assert!(parse_optional_page_spec(Some("  ")).unwrap().is_none());
        assert!(parse_optional_page_spec(Some("1,,2")).is_err());
    }

    #[test]
    fn test_validate_schema() {
        let schema = serde_json::json!({"type": "object", "properties": {"total": {"type": "number"}}});
        assert!(validate_schema(&schema, "invoice").is_ok());
        assert!(matches!(
            validate_schema(&serde_json::json!("object"), "invoice"),
            Err(Error::InvalidSchema { .. })
        ));
        assert!(matches!(
            validate_schema(&serde_json::json!({}), "invoice"),
            Err(Error::InvalidSchema { .. })
        ));
        assert!(matches!(
            validate_schema(&schema, "bad name!"),
            Err(Error::InvalidSchema { .. })
        ));
    }

    #[tokio::test]
    async fn test_process_document_all_pages() {
        let engine = CannedEngine::new(three_page_response());
        let server = server_with(ServerConfig::default(), engine.clone());
        let params = process_params(base64_source());

        let result = server
            .process_process_document(&params.sources[0], &params, None)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.source, "<base64>");
        assert_eq!(result.total_pages, 3);
        assert_eq!(result.pages, vec![1, 2, 3]);
        assert!(result.content.starts_with("ACME Quarterly\n# Intro"));
        assert!(result.content.contains("First page.\n1\n\nACME Quarterly\n## Figures"));
        assert_eq!(result.usage.unwrap().pages_processed, 3);
        assert!(result.warnings.is_empty());
        assert_eq!(engine.calls(), 1);

        let request = engine.requests.lock()[0].clone();
        assert_eq!(request.model, "mistral-ocr-latest");
        assert!(!request.include_image_base64);
        assert!(request.pages.is_none());
    }

    #[tokio::test]
    async fn test_process_document_page_selection_warns_out_of_range() {
        let engine = CannedEngine::new(three_page_response());
        let server = server_with(ServerConfig::default(), engine);
        let mut params = process_params(base64_source());
        params.pages = Some("3,1,8-10".to_string());

        let result = server
            .process_process_document(&params.sources[0], &params, None)
            .await
            .unwrap();

        assert_eq!(result.pages, vec![1, 3]);
        assert!(!result.content.contains("## Figures"));
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("8-10"));
    }

    #[tokio::test]
    async fn test_process_document_invalid_pages_skip_ocr() {
        let engine = CannedEngine::new(three_page_response());
        let server = server_with(ServerConfig::default(), engine.clone());
        let mut params = process_params(base64_source());
        params.pages = Some("1,abc".to_string());

        let err = server
            .process_process_document(&params.sources[0], &params, None)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::PageSpec(_)));
        assert_eq!(
            err.suggestion().as_deref(),
            Some("Invalid page specification, use format like '1,5,10-15'")
        );
        assert_eq!(engine.calls(), 0);
    }

    #[tokio::test]
    async fn test_process_document_no_pages_selected() {
        let engine = CannedEngine::new(three_page_response());
        let server = server_with(ServerConfig::default(), engine);
        let mut params = process_params(base64_source());
        params.pages = Some("4-6".to_string());

        let result = server
            .process_process_document(&params.sources[0], &params, None)
            .await;
        assert!(matches!(result, Err(Error::NoPagesSelected { total: 3 })));
    }

    #[tokio::test]
    async fn test_process_document_clean_and_text() {
        let engine = CannedEngine::new(three_page_response());
        let server = server_with(ServerConfig::default(), engine);
        let mut params = process_params(base64_source());
        params.clean_repetitions = true;
        params.format = OutputFormat::Text;

        let result = server
            .process_process_document(&params.sources[0], &params, None)
            .await
            .unwrap();

        let cleaning = result.cleaning.unwrap();
        assert_eq!(cleaning.method, crate::text::CLEANING_METHOD);
        assert_eq!(cleaning.lines_removed, 3);
        assert!(!result.content.contains("ACME Quarterly"));
        assert!(!result.content.contains('#'));
        assert!(result.content.contains("See the site and notes."));
        // Bare page numbers are protected
        assert!(result.content.contains("\n2\n"));
        assert_eq!(result.format, OutputFormat::Text);
    }

    #[tokio::test]
    async fn test_process_document_images() {
        let mut response = three_page_response();
        response.pages[1].images.push(OcrImage {
            id: "img-0.jpeg".to_string(),
            top_left_x: Some(10),
            top_left_y: Some(20),
            bottom_right_x: Some(110),
            bottom_right_y: Some(220),
            image_base64: Some("data:image/jpeg;base64,AAAA".to_string()),
        });
        let engine = CannedEngine::new(response);
        let server = server_with(ServerConfig::default(), engine.clone());
        let mut params = process_params(base64_source());
        params.include_images = true;

        let result = server
            .process_process_document(&params.sources[0], &params, None)
            .await
            .unwrap();

        let images = result.images.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].page, 2);
        assert_eq!(images[0].bbox, Some([10, 20, 110, 220]));
        assert!(engine.requests.lock()[0].include_image_base64);
    }

    #[tokio::test]
    async fn test_process_document_cache_reuse() {
        let engine = CannedEngine::new(three_page_response());
        let server = server_with(ServerConfig::default(), engine.clone());
        let mut params = process_params(base64_source());
        params.cache = true;

        let first = server
            .process_process_document(&params.sources[0], &params, None)
            .await
            .unwrap();
        let cache_key = first.cache_key.expect("cache key");

        let cached_source = DocumentSource::CacheRef {
            cache_key: cache_key.clone(),
        };
        let mut params = process_params(cached_source.clone());
        params.pages = Some("2".to_string());
        let second = server
            .process_process_document(&cached_source, &params, None)
            .await
            .unwrap();

        assert_eq!(engine.calls(), 1);
        assert_eq!(second.source, format!("<cache:{}>", cache_key));
        assert_eq!(second.pages, vec![2]);
        assert!(second.content.contains("## Figures"));
    }

    #[tokio::test]
    async fn test_process_document_unknown_cache_key() {
        let engine = CannedEngine::new(three_page_response());
        let server = server_with(ServerConfig::default(), engine);
        let source = DocumentSource::CacheRef {
            cache_key: "missing".to_string(),
        };
        let params = process_params(source.clone());

        let result = server.process_process_document(&source, &params, None).await;
        assert!(matches!(result, Err(Error::CacheKeyNotFound { .. })));
    }

    #[tokio::test]
    async fn test_process_document_denied_output_path_skips_ocr() {
        let allowed = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let out = other.path().join("o.md");
        let engine = CannedEngine::new(three_page_response());
        let server = server_with(
            ServerConfig {
                resource_dirs: vec![allowed.path().to_string_lossy().to_string()],
                ..ServerConfig::default()
            },
            engine.clone(),
        );
        let mut params = process_params(base64_source());
        params.cache = true;

        let result = server
            .process_process_document(&params.sources[0], &params, Some(out.to_str().unwrap()))
            .await;

        assert!(matches!(result, Err(Error::PathAccessDenied { .. })));
        assert_eq!(engine.calls(), 0);
        assert!(server.cache.is_empty());
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn test_process_document_saves_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested/scan.md");
        let engine = CannedEngine::new(three_page_response());
        let server = server_with(ServerConfig::default(), engine);
        let params = process_params(base64_source());

        let result = server
            .process_process_document(&params.sources[0], &params, Some(out.to_str().unwrap()))
            .await
            .unwrap();

        assert_eq!(result.saved_to.as_deref(), out.to_str());
        assert_eq!(std::fs::read_to_string(&out).unwrap(), result.content);
    }

    #[tokio::test]
    async fn test_process_document_path_source() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("scan.pdf");
        std::fs::write(&file, b"%PDF-1.4 test").unwrap();

        let engine = CannedEngine::new(three_page_response());
        let server = server_with(
            ServerConfig {
                resource_dirs: vec![dir.path().to_string_lossy().to_string()],
                ..ServerConfig::default()
            },
            engine.clone(),
        );
        let source = DocumentSource::Path {
            path: file.to_string_lossy().to_string(),
        };
        let params = process_params(source.clone());

        let result = server
            .process_process_document(&source, &params, None)
            .await
            .unwrap();
        assert!(result.success);

        let request = engine.requests.lock()[0].clone();
        assert!(matches!(
            request.document,
            crate::ocr::OcrInput::DocumentUrl { ref document_url }
                if document_url.starts_with("data:application/pdf;base64,")
        ));
    }

    #[tokio::test]
    async fn test_remote_mode_rejects_filesystem() {
        let engine = CannedEngine::new(three_page_response());
        let server = server_with(remote_config(), engine.clone());

        let source = DocumentSource::Path {
            path: "/etc/hosts".to_string(),
        };
        let params = process_params(source.clone());
        let err = server
            .process_process_document(&source, &params, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FilesystemUnavailable { .. }));
        assert!(err.suggestion().unwrap().contains("url"));

        let params = process_params(base64_source());
        let err = server
            .process_process_document(&params.sources[0], &params, Some("/tmp/out.md"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FilesystemUnavailable { .. }));
        assert_eq!(engine.calls(), 0);

        let params = ListDocumentsParams {
            directory: "/tmp".to_string(),
            recursive: false,
            pattern: None,
        };
        assert!(matches!(
            server.process_list_documents(&params),
            Err(Error::FilesystemUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_remote_mode_accepts_url_and_base64() {
        let engine = CannedEngine::new(three_page_response());
        let server = server_with(remote_config(), engine.clone());

        let source = DocumentSource::Url {
            url: "https://example.com/scan.png".to_string(),
        };
        let params = process_params(source.clone());
        let result = server
            .process_process_document(&source, &params, None)
            .await
            .unwrap();
        assert!(result.success);

        let request = engine.requests.lock()[0].clone();
        assert!(matches!(
            request.document,
            crate::ocr::OcrInput::ImageUrl { .. }
        ));
    }

    #[tokio::test]
    async fn test_process_extract_tables() {
        let engine = CannedEngine::new(three_page_response());
        let server = server_with(ServerConfig::default(), engine);
        let params = ExtractTablesParams {
            sources: vec![base64_source()],
            pages: None,
            format: TableFormat::Csv,
            cache: false,
        };

        let result = server
            .process_extract_tables(&params.sources[0], &params)
            .await
            .unwrap();

        assert_eq!(result.total_tables, 1);
        let table = &result.tables[0];
        assert_eq!(table.page, 2);
        assert_eq!(table.index, 0);
        assert_eq!(table.headers, vec!["Item", "Qty"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.content.as_deref(), Some("Item,Qty\nBolts,40\nNuts,12"));
    }

    #[tokio::test]
    async fn test_process_extract_tables_none_found() {
        let engine = CannedEngine::new(three_page_response());
        let server = server_with(ServerConfig::default(), engine);
        let params = ExtractTablesParams {
            sources: vec![base64_source()],
            pages: Some("1,3".to_string()),
            format: TableFormat::Json,
            cache: false,
        };

        let result = server
            .process_extract_tables(&params.sources[0], &params)
            .await
            .unwrap();

        assert_eq!(result.total_tables, 0);
        assert_eq!(result.warnings, vec!["No tables found in the selected pages"]);
    }

    #[tokio::test]
    async fn test_process_extract_structured_data() {
        let mut response = three_page_response();
        response.document_annotation = Some(r#"{"company": "ACME", "items": 2}"#.to_string());
        let engine = CannedEngine::new(response);
        let server = server_with(ServerConfig::default(), engine.clone());
        let params = ExtractStructuredDataParams {
            sources: vec![base64_source()],
            schema: serde_json::json!({"type": "object", "properties": {"company": {"type": "string"}}}),
            schema_name: "report".to_string(),
            pages: Some("1-2".to_string()),
            strict: true,
        };

        let result = server
            .process_extract_structured_data(&params.sources[0], &params)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(
            result.data,
            Some(serde_json::json!({"company": "ACME", "items": 2}))
        );

        let request = engine.requests.lock()[0].clone();
        assert_eq!(request.pages, Some(vec![0, 1]));
        let format = request.document_annotation_format.unwrap();
        assert_eq!(format.json_schema.name, "report");
        assert!(format.json_schema.strict);
    }

    #[tokio::test]
    async fn test_process_extract_structured_data_raw_fallback() {
        let mut response = three_page_response();
        response.document_annotation = Some("not json".to_string());
        let engine = CannedEngine::new(response);
        let server = server_with(ServerConfig::default(), engine);
        let params = ExtractStructuredDataParams {
            sources: vec![base64_source()],
            schema: serde_json::json!({"type": "object"}),
            schema_name: default_schema_name(),
            pages: None,
            strict: false,
        };

        let result = server
            .process_extract_structured_data(&params.sources[0], &params)
            .await
            .unwrap();

        assert_eq!(result.data, Some(serde_json::json!("not json")));
        assert_eq!(result.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_process_extract_structured_data_missing_annotation() {
        let engine = CannedEngine::new(three_page_response());
        let server = server_with(ServerConfig::default(), engine);
        let params = ExtractStructuredDataParams {
            sources: vec![base64_source()],
            schema: serde_json::json!({"type": "object"}),
            schema_name: default_schema_name(),
            pages: None,
            strict: true,
        };

        let result = server
            .process_extract_structured_data(&params.sources[0], &params)
            .await;
        assert!(matches!(result, Err(Error::OcrApi { .. })));
    }

    #[tokio::test]
    async fn test_process_extract_structured_data_invalid_schema_skips_ocr() {
        let engine = CannedEngine::new(three_page_response());
        let server = server_with(ServerConfig::default(), engine.clone());
        let params = ExtractStructuredDataParams {
            sources: vec![base64_source()],
            schema: serde_json::json!(["not", "an", "object"]),
            schema_name: default_schema_name(),
            pages: None,
            strict: true,
        };

        let result = server
            .process_extract_structured_data(&params.sources[0], &params)
            .await;
        assert!(matches!(result, Err(Error::InvalidSchema { .. })));
        assert_eq!(engine.calls(), 0);
    }

    #[test]
    fn test_process_clean_markdown() {
        let params = CleanMarkdownParams {
            markdown: "Header\n# A\nHeader\n**b**\nHeader\nPage 3".to_string(),
            format: OutputFormat::Markdown,
        };
        let result = OcrServer::process_clean_markdown(&params);
        assert!(result.success);
        assert_eq!(result.content, "# A\n**b**\nPage 3");
        assert_eq!(result.lines_removed, 3);
        assert_eq!(result.original_lines, 6);
        assert!(result.warnings.is_empty());

        let params = CleanMarkdownParams {
            format: OutputFormat::Text,
            ..params
        };
        let result = OcrServer::process_clean_markdown(&params);
        assert_eq!(result.content, "A\nb\nPage 3");
    }

    #[test]
    fn test_process_clean_markdown_nothing_to_remove() {
        let params = CleanMarkdownParams {
            markdown: "one\ntwo".to_string(),
            format: OutputFormat::Markdown,
        };
        let result = OcrServer::process_clean_markdown(&params);
        assert_eq!(result.content, "one\ntwo");
        assert_eq!(result.warnings, vec!["No repeated lines found"]);
    }

    #[test]
    fn test_list_documents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.pdf"), b"%PDF").unwrap();
        std::fs::write(dir.path().join("b.PNG"), b"\x89PNG").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"text").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/c.jpg"), b"\xFF\xD8\xFF").unwrap();

        let server = server_with(
            ServerConfig::default(),
            CannedEngine::new(OcrResponse::default()),
        );

        let params = ListDocumentsParams {
            directory: dir.path().to_string_lossy().to_string(),
            recursive: false,
            pattern: None,
        };
        let result = server.process_list_documents(&params).unwrap();
        let names: Vec<&str> = result.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a.pdf", "b.PNG"]);
        assert_eq!(result.files[1].kind, "png");

        let params = ListDocumentsParams {
            recursive: true,
            pattern: Some("*.jpg".to_string()),
            ..params
        };
        let result = server.process_list_documents(&params).unwrap();
        assert_eq!(result.total_count, 1);
        assert_eq!(result.files[0].kind, "jpeg");
    }

    #[tokio::test]
    async fn test_list_documents_rejects_invalid_pattern() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.pdf"), b"%PDF").unwrap();
        let server = server_with(
            ServerConfig::default(),
            CannedEngine::new(OcrResponse::default()),
        );

        let params = ListDocumentsParams {
            directory: dir.path().to_string_lossy().to_string(),
            recursive: false,
            pattern: Some("[".to_string()),
        };
        let err = server.process_list_documents(&params).unwrap_err();
        assert!(matches!(err, Error::InvalidPattern { ref pattern, .. } if pattern == "["));
        assert!(err.suggestion().unwrap().contains("*.pdf"));

        let json = server.list_documents(Parameters(params)).await;
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["total_count"], 0);
        assert!(value["error"].as_str().unwrap().starts_with("Invalid file pattern '['"));
    }

    #[test]
    fn test_list_documents_sandbox_denied() {
        let allowed = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let server = server_with(
            ServerConfig {
                resource_dirs: vec![allowed.path().to_string_lossy().to_string()],
                ..ServerConfig::default()
            },
            CannedEngine::new(OcrResponse::default()),
        );

        let params = ListDocumentsParams {
            directory: other.path().to_string_lossy().to_string(),
            recursive: false,
            pattern: None,
        };
        assert!(matches!(
            server.process_list_documents(&params),
            Err(Error::PathAccessDenied { .. })
        ));
    }

    #[test]
    fn test_validate_path_access_sandbox() {
        let allowed = tempfile::tempdir().unwrap();
        let inside = allowed.path().join("doc.pdf");
        std::fs::write(&inside, b"%PDF").unwrap();

        let server = server_with(
            ServerConfig {
                resource_dirs: vec![allowed.path().to_string_lossy().to_string()],
                ..ServerConfig::default()
            },
            CannedEngine::new(OcrResponse::default()),
        );

        assert!(server
            .validate_path_access(&inside.to_string_lossy())
            .is_ok());

        let traversal = allowed.path().join("../../etc/hosts");
        assert!(matches!(
            server.validate_path_access(&traversal.to_string_lossy()),
            Err(Error::PathAccessDenied { .. })
        ));

        let outside_output = "/tmp/definitely-not-allowed/out.md";
        assert!(matches!(
            server.validate_output_path_access(outside_output),
            Err(Error::PathAccessDenied { .. })
        ));

        let inside_output = allowed.path().join("out.md");
        assert!(server
            .validate_output_path_access(&inside_output.to_string_lossy())
            .is_ok());
    }

    #[tokio::test]
    async fn test_tool_returns_envelope_on_error() {
        let engine = CannedEngine::new(three_page_response());
        let server = server_with(ServerConfig::default(), engine);
        let mut params = process_params(base64_source());
        params.pages = Some("0".to_string());

        let json = server.process_document(Parameters(params)).await;
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let result = &value["results"][0];
        assert_eq!(result["success"], false);
        assert_eq!(result["source"], "<base64>");
        assert!(result["error"].as_str().unwrap().contains("must be positive"));
        assert_eq!(
            result["suggestion"],
            "Invalid page specification, use format like '1,5,10-15'"
        );
        assert_eq!(result["warnings"], serde_json::json!([]));
    }
}
