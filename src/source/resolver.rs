//! Source resolution for OCR input

use crate::error::{Error, Result};
use crate::ocr::OcrInput;
use crate::source::{CacheManager, CachedDocument};
use base64::Engine;
use std::path::Path;
use std::sync::Arc;

/// Document formats accepted by the OCR service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Png,
    Jpeg,
    Gif,
    Webp,
    Tiff,
    Bmp,
    Avif,
}

impl DocumentKind {
    pub fn mime_type(&self) -> &'static str {
        match self {
            DocumentKind::Pdf => "application/pdf",
            DocumentKind::Png => "image/png",
            DocumentKind::Jpeg => "image/jpeg",
            DocumentKind::Gif => "image/gif",
            DocumentKind::Webp => "image/webp",
            DocumentKind::Tiff => "image/tiff",
            DocumentKind::Bmp => "image/bmp",
            DocumentKind::Avif => "image/avif",
        }
    }

    pub fn is_image(&self) -> bool {
        !matches!(self, DocumentKind::Pdf)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Pdf => "pdf",
            DocumentKind::Png => "png",
            DocumentKind::Jpeg => "jpeg",
            DocumentKind::Gif => "gif",
            DocumentKind::Webp => "webp",
            DocumentKind::Tiff => "tiff",
            DocumentKind::Bmp => "bmp",
            DocumentKind::Avif => "avif",
        }
    }

    /// Detect the format from leading magic bytes
    pub fn sniff(data: &[u8]) -> Option<Self> {
        if data.starts_with(b"%PDF") {
            Some(DocumentKind::Pdf)
        } else if data.starts_with(b"\x89PNG\r\n\x1a\n") {
            Some(DocumentKind::Png)
        } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(DocumentKind::Jpeg)
        } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
            Some(DocumentKind::Gif)
        } else if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
            Some(DocumentKind::Webp)
        } else if data.starts_with(b"II*\0") || data.starts_with(b"MM\0*") {
            Some(DocumentKind::Tiff)
        } else if data.starts_with(b"BM") {
            Some(DocumentKind::Bmp)
        } else if data.len() >= 12
            && &data[4..8] == b"ftyp"
            && matches!(&data[8..12], b"avif" | b"avis")
        {
            Some(DocumentKind::Avif)
        } else {
            None
        }
    }

    /// Detect the format from a file extension (case-insensitive)
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(DocumentKind::Pdf),
            "png" => Some(DocumentKind::Png),
            "jpg" | "jpeg" => Some(DocumentKind::Jpeg),
            "gif" => Some(DocumentKind::Gif),
            "webp" => Some(DocumentKind::Webp),
            "tif" | "tiff" => Some(DocumentKind::Tiff),
            "bmp" => Some(DocumentKind::Bmp),
            "avif" => Some(DocumentKind::Avif),
            _ => None,
        }
    }
}

/// Resolved OCR input
#[derive(Debug, Clone)]
pub struct ResolvedDocument {
    pub input: OcrInput,
    pub source_name: String,
    /// OCR result already available from the cache
    pub cached: Option<CachedDocument>,
}

impl ResolvedDocument {
    fn fresh(input: OcrInput, source_name: String) -> Self {
        Self {
            input,
            source_name,
            cached: None,
        }
    }
}

fn data_url_input(data: &[u8], kind: DocumentKind) -> OcrInput {
    let encoded = base64::engine::general_purpose::STANDARD.encode(data);
    let url = format!("data:{};base64,{}", kind.mime_type(), encoded);
    if kind.is_image() {
        OcrInput::ImageUrl { image_url: url }
    } else {
        OcrInput::DocumentUrl { document_url: url }
    }
}

/// Resolve a file path to OCR input
pub fn resolve_path<P: AsRef<Path>>(path: P, max_bytes: u64) -> Result<ResolvedDocument> {
    let path = path.as_ref();

    if !path.is_file() {
        return Err(Error::DocumentNotFound {
            path: path.display().to_string(),
        });
    }

    let size = std::fs::metadata(path)?.len();
    if size > max_bytes {
        return Err(Error::DocumentTooLarge {
            size,
            max_size: max_bytes,
        });
    }

    let data = std::fs::read(path)?;
    let kind = DocumentKind::sniff(&data)
        .or_else(|| {
            path.extension()
                .and_then(|e| e.to_str())
                .and_then(DocumentKind::from_extension)
        })
        .ok_or_else(|| Error::UnsupportedFormat {
            reason: "file is neither a PDF nor a supported image".to_string(),
        })?;

    tracing::debug!(path = %path.display(), kind = kind.as_str(), size, "resolved file source");

    Ok(ResolvedDocument::fresh(
        data_url_input(&data, kind),
        path.display().to_string(),
    ))
}

/// Resolve base64 encoded data (optionally a full `data:` URL) to OCR input
pub fn resolve_base64(base64_data: &str, max_bytes: u64) -> Result<ResolvedDocument> {
    let payload = match base64_data.trim().split_once(";base64,") {
        Some((header, payload)) if header.starts_with("data:") => payload,
        _ => base64_data.trim(),
    };

    let engine = base64::engine::general_purpose::STANDARD;
    let data = engine.decode(payload)?;

    if data.len() as u64 > max_bytes {
        return Err(Error::DocumentTooLarge {
            size: data.len() as u64,
            max_size: max_bytes,
        });
    }

    let kind = DocumentKind::sniff(&data).ok_or_else(|| Error::UnsupportedFormat {
        reason: "decoded data is neither a PDF nor a supported image".to_string(),
    })?;

    Ok(ResolvedDocument::fresh(
        data_url_input(&data, kind),
        "<base64>".to_string(),
    ))
}

/// Resolve a URL to OCR input. The OCR service fetches the document itself.
pub fn resolve_url(url: &str) -> Result<ResolvedDocument> {
    let parsed = url::Url::parse(url).map_err(|e| Error::SourceResolution {
        reason: format!("Invalid URL: {}", e),
    })?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(Error::SourceResolution {
            reason: format!("Unsupported URL scheme: {}", parsed.scheme()),
        });
    }

    let is_image = parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|name| name.rsplit_once('.'))
        .and_then(|(_, ext)| DocumentKind::from_extension(ext))
        .is_some_and(|kind| kind.is_image());

    let input = if is_image {
        OcrInput::ImageUrl {
            image_url: url.to_string(),
        }
    } else {
        OcrInput::DocumentUrl {
            document_url: url.to_string(),
        }
    };

    Ok(ResolvedDocument::fresh(input, url.to_string()))
}

/// Resolve a cache key to a previously processed document
pub fn resolve_cache(cache_key: &str, cache: &Arc<CacheManager>) -> Result<ResolvedDocument> {
    let cached = cache.get(cache_key).ok_or_else(|| Error::CacheKeyNotFound {
        key: cache_key.to_string(),
    })?;

    Ok(ResolvedDocument {
        input: cached.input.clone(),
        source_name: format!("<cache:{}>", cache_key),
        cached: Some(cached),
    })
}
