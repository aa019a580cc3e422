//! OCR result caching layer

use crate::ocr::{OcrInput, OcrResponse};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// A processed document: the input sent to the OCR service and its result
#[derive(Debug, Clone)]
pub struct CachedDocument {
    pub input: OcrInput,
    pub response: Arc<OcrResponse>,
}

impl CachedDocument {
    pub fn new(input: OcrInput, response: OcrResponse) -> Self {
        Self {
            input,
            response: Arc::new(response),
        }
    }

    /// Bytes charged against the cache budget
    pub fn size_bytes(&self) -> usize {
        self.input.size_bytes() + self.response.size_bytes()
    }
}

struct CacheInner {
    lru: LruCache<String, CachedDocument>,
    total_bytes: usize,
}

/// Cache manager for OCR results with entry count and byte budget limits
pub struct CacheManager {
    inner: Mutex<CacheInner>,
    max_bytes: usize,
}

impl CacheManager {
    /// Create a new cache manager with the specified entry capacity and byte budget
    pub fn new(capacity: usize, max_bytes: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(CacheInner {
                lru: LruCache::new(capacity),
                total_bytes: 0,
            }),
            max_bytes,
        }
    }

    /// Store a processed document.
    /// Returns false when the entry alone exceeds the byte budget and was not stored.
    /// Evicts LRU entries until the byte budget is satisfied.
    pub fn put(&self, key: String, doc: CachedDocument) -> bool {
        let new_size = doc.size_bytes();

        if new_size > self.max_bytes {
            tracing::debug!(size = new_size, max = self.max_bytes, "cache entry rejected");
            return false;
        }

        let mut inner = self.inner.lock();

        if let Some(old) = inner.lru.pop(&key) {
            inner.total_bytes = inner.total_bytes.saturating_sub(old.size_bytes());
        }

        while inner.total_bytes + new_size > self.max_bytes {
            match inner.lru.pop_lru() {
                Some((_, evicted)) => {
                    inner.total_bytes = inner.total_bytes.saturating_sub(evicted.size_bytes());
                }
                None => break,
            }
        }

        // Entry-count eviction inside LruCache::push must also release bytes
        if let Some((evicted_key, evicted)) = inner.lru.push(key.clone(), doc) {
            if evicted_key != key {
                inner.total_bytes = inner.total_bytes.saturating_sub(evicted.size_bytes());
            }
        }
        inner.total_bytes += new_size;
        true
    }

    /// Get a processed document from the cache
    pub fn get(&self, key: &str) -> Option<CachedDocument> {
        self.inner.lock().lru.get(key).cloned()
    }

    /// Check if a key exists in the cache
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().lru.contains(key)
    }

    /// Get the number of entries in the cache
    pub fn len(&self) -> usize {
        self.inner.lock().lru.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.inner.lock().lru.is_empty()
    }

    /// Get total bytes currently stored in cache
    pub fn total_bytes(&self) -> usize {
        self.inner.lock().total_bytes
    }

    /// Generate a new cache key that is guaranteed not to collide with existing keys.
    pub fn generate_unique_key(&self) -> String {
        let inner = self.inner.lock();
        loop {
            let key = uuid::Uuid::new_v4().to_string();
            if !inner.lru.contains(&key) {
                return key;
            }
        }
    }
}
