//! Content renderer
//!
//! Serves Things to the gateway: an in-memory LRU cache in front of a
//! peer-fetch callback, integrity verification on every miss, inclusive
//! byte-range slicing, chunked streaming, content-type sniffing, and the
//! HTML sanitizer. Cache and statistics sit behind separate locks so
//! stat reads never contend with the hot path.

use indexmap::IndexMap;
use std::sync::Mutex;

use crate::common::ContentHash;
use crate::error::{Error, Result};
use crate::sanitize::sanitize_html;
use crate::storage::verify_content;

/// Content types the gateway can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Html,
    Javascript,
    Css,
    ImagePng,
    ImageJpeg,
    ImageGif,
    ImageWebp,
    VideoMp4,
    VideoWebm,
    AudioMp3,
    AudioOgg,
    Json,
    Text,
    Binary,
}

impl ContentType {
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Html => "text/html; charset=utf-8",
            Self::Javascript => "application/javascript; charset=utf-8",
            Self::Css => "text/css; charset=utf-8",
            Self::ImagePng => "image/png",
            Self::ImageJpeg => "image/jpeg",
            Self::ImageGif => "image/gif",
            Self::ImageWebp => "image/webp",
            Self::VideoMp4 => "video/mp4",
            Self::VideoWebm => "video/webm",
            Self::AudioMp3 => "audio/mpeg",
            Self::AudioOgg => "audio/ogg",
            Self::Json => "application/json",
            Self::Text => "text/plain; charset=utf-8",
            Self::Binary => "application/octet-stream",
        }
    }
}

/// Sniff a content type: magic bytes, then filename extension, then a
/// printable-ASCII heuristic for small buffers
pub fn detect_content_type(data: &[u8], filename: Option<&str>) -> ContentType {
    if data.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return ContentType::ImagePng;
    }
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return ContentType::ImageJpeg;
    }
    if data.starts_with(b"GIF8") {
        return ContentType::ImageGif;
    }
    if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        return ContentType::ImageWebp;
    }

    if let Some(name) = filename {
        let lower = name.to_ascii_lowercase();
        let extension = lower.rsplit('.').next().unwrap_or("");
        match extension {
            "html" | "htm" => return ContentType::Html,
            "js" => return ContentType::Javascript,
            "css" => return ContentType::Css,
            "json" => return ContentType::Json,
            "txt" => return ContentType::Text,
            "mp4" => return ContentType::VideoMp4,
            "webm" => return ContentType::VideoWebm,
            "mp3" => return ContentType::AudioMp3,
            "ogg" => return ContentType::AudioOgg,
            _ => {}
        }
    }

    // Unambiguous HTML openers are recognized without a filename hint so
    // the sanitizer still runs on hash-only requests
    let head = data[..data.len().min(256)].to_ascii_lowercase();
    let mut start = 0;
    while start < head.len() && (head[start].is_ascii_whitespace() || head[start] >= 0x80) {
        start += 1;
    }
    let trimmed = &head[start..];
    if trimmed.starts_with(b"<!doctype html") || trimmed.starts_with(b"<html") {
        return ContentType::Html;
    }

    if !data.is_empty() && data.len() < 1024 {
        let printable = data
            .iter()
            .all(|&b| b >= 32 || b == b'\n' || b == b'\r' || b == b'\t');
        if printable {
            return ContentType::Text;
        }
    }
    ContentType::Binary
}

/// Metadata attached to rendered content
#[derive(Debug, Clone)]
pub struct ContentMetadata {
    pub content_hash: ContentHash,
    pub content_type: ContentType,
    pub size_bytes: usize,
    pub mime_type: &'static str,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    metadata: ContentMetadata,
    data: Vec<u8>,
    cached_at: u64,
    access_count: u64,
}

/// Renderer tuning knobs
#[derive(Debug, Clone)]
pub struct RendererConfig {
    pub max_cache_bytes: usize,
    pub max_cached_items: usize,
    pub cache_ttl_seconds: u64,
    pub chunk_size: usize,
    pub sanitize_html: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            max_cache_bytes: 100 * 1024 * 1024,
            max_cached_items: 1000,
            cache_ttl_seconds: 3600,
            chunk_size: 64 * 1024,
            sanitize_html: true,
        }
    }
}

/// Cache counters
#[derive(Debug, Clone, Default)]
pub struct CacheStatistics {
    pub total_items: usize,
    pub total_bytes: usize,
    pub hit_count: u64,
    pub miss_count: u64,
    pub hit_ratio: f64,
    pub eviction_count: u64,
}

/// Rendered output
#[derive(Debug, Clone)]
pub struct RenderResult {
    pub metadata: ContentMetadata,
    pub data: Vec<u8>,
    pub is_partial: bool,
    pub range_start: usize,
    pub range_end: usize,
}

/// One streamed chunk
#[derive(Debug, Clone)]
pub struct ContentChunk {
    pub offset: usize,
    pub length: usize,
    pub data: Vec<u8>,
    pub is_final: bool,
}

/// Fetches a Thing from the peer network on cache miss
pub type FetchCallback = Box<dyn Fn(&ContentHash) -> Option<Vec<u8>> + Send + Sync>;

/// Cached, range-aware content renderer
pub struct ContentRenderer {
    config: RendererConfig,
    fetch_callback: FetchCallback,
    // LRU order is the map's insertion order: hits reinsert at the back
    cache: Mutex<IndexMap<ContentHash, CacheEntry>>,
    stats: Mutex<CacheStatistics>,
}

impl ContentRenderer {
    pub fn new(config: RendererConfig, fetch_callback: FetchCallback) -> Self {
        Self {
            config,
            fetch_callback,
            cache: Mutex::new(IndexMap::new()),
            stats: Mutex::new(CacheStatistics::default()),
        }
    }

    /// Cache lookup, refreshing LRU position
    fn cache_get(&self, hash: &ContentHash) -> Option<CacheEntry> {
        let mut cache = self.cache.lock().unwrap();
        let mut entry = cache.shift_remove(hash)?;
        entry.access_count += 1;
        let clone = entry.clone();
        cache.insert(*hash, entry);
        Some(clone)
    }

    /// Insert with LRU eviction to stay under both caps
    fn cache_insert(&self, hash: ContentHash, entry: CacheEntry) {
        // Things bigger than the whole cache are served uncached
        if entry.data.len() > self.config.max_cache_bytes {
            return;
        }
        let mut cache = self.cache.lock().unwrap();
        let mut evictions = 0u64;
        cache.insert(hash, entry);
        loop {
            let total_bytes: usize = cache.values().map(|e| e.data.len()).sum();
            if cache.len() <= self.config.max_cached_items
                && total_bytes <= self.config.max_cache_bytes
            {
                break;
            }
            // Front of the map is the least recently used entry
            if cache.shift_remove_index(0).is_none() {
                break;
            }
            evictions += 1;
        }
        if evictions > 0 {
            self.stats.lock().unwrap().eviction_count += evictions;
            log::debug!("cache evicted {evictions} entr(ies)");
        }
    }

    fn record_hit(&self) {
        self.stats.lock().unwrap().hit_count += 1;
    }

    fn record_miss(&self) {
        self.stats.lock().unwrap().miss_count += 1;
    }

    /// Fetch-or-cache the full verified content
    fn obtain(&self, hash: &ContentHash, now: u64) -> Result<CacheEntry> {
        if let Some(entry) = self.cache_get(hash) {
            self.record_hit();
            return Ok(entry);
        }
        self.record_miss();

        let data = (self.fetch_callback)(hash)
            .ok_or_else(|| Error::ThingNotFound(hash.to_hex()))?;
        if !verify_content(&data, hash).is_valid {
            return Err(Error::ThingInvalidHash);
        }

        let content_type = detect_content_type(&data, None);
        let entry = CacheEntry {
            metadata: ContentMetadata {
                content_hash: *hash,
                content_type,
                size_bytes: data.len(),
                mime_type: content_type.mime_type(),
            },
            data,
            cached_at: now,
            access_count: 1,
        };
        self.cache_insert(*hash, entry.clone());
        Ok(entry)
    }

    /// Render content, optionally slicing an inclusive byte range
    pub fn render(
        &self,
        hash: &ContentHash,
        range: Option<(usize, usize)>,
        now: u64,
    ) -> Result<RenderResult> {
        let entry = self.obtain(hash, now)?;
        let size = entry.data.len();

        let (mut data, is_partial, range_start, range_end) = match range {
            Some((start, end)) => {
                if start > end || end >= size {
                    return Err(Error::OutOfRange(format!(
                        "range {start}..={end} outside content of {size} bytes"
                    )));
                }
                (entry.data[start..=end].to_vec(), true, start, end)
            }
            None => {
                let end = size.saturating_sub(1);
                (entry.data.clone(), false, 0, end)
            }
        };

        if entry.metadata.content_type == ContentType::Html && self.config.sanitize_html {
            data = sanitize_html(&data);
        }

        Ok(RenderResult {
            metadata: entry.metadata,
            data,
            is_partial,
            range_start,
            range_end,
        })
    }

    /// Stream content in configured chunk sizes
    pub fn stream<F>(&self, hash: &ContentHash, now: u64, mut on_chunk: F) -> Result<()>
    where
        F: FnMut(ContentChunk),
    {
        let entry = self.obtain(hash, now)?;
        let data = &entry.data;
        let mut offset = 0;
        while offset < data.len() {
            let length = self.config.chunk_size.min(data.len() - offset);
            on_chunk(ContentChunk {
                offset,
                length,
                data: data[offset..offset + length].to_vec(),
                is_final: offset + length >= data.len(),
            });
            offset += length;
        }
        Ok(())
    }

    /// Warm the cache without returning the data
    pub fn prefetch(&self, hash: &ContentHash, now: u64) -> bool {
        self.obtain(hash, now).is_ok()
    }

    pub fn is_cached(&self, hash: &ContentHash) -> bool {
        self.cache.lock().unwrap().contains_key(hash)
    }

    /// Drop one entry, or everything
    pub fn invalidate(&self, hash: Option<&ContentHash>) {
        let mut cache = self.cache.lock().unwrap();
        match hash {
            Some(hash) => {
                cache.shift_remove(hash);
            }
            None => cache.clear(),
        }
    }

    /// Remove entries past their TTL
    pub fn cleanup_expired(&self, now: u64) {
        let ttl = self.config.cache_ttl_seconds;
        self.cache
            .lock()
            .unwrap()
            .retain(|_, entry| now.saturating_sub(entry.cached_at) < ttl);
    }

    pub fn cache_stats(&self) -> CacheStatistics {
        let cache = self.cache.lock().unwrap();
        let mut stats = self.stats.lock().unwrap().clone();
        stats.total_items = cache.len();
        stats.total_bytes = cache.values().map(|e| e.data.len()).sum();
        let total = stats.hit_count + stats.miss_count;
        stats.hit_ratio = if total > 0 {
            stats.hit_count as f64 / total as f64
        } else {
            0.0
        };
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashMap;
    use std::sync::Arc;

    /// Renderer backed by a fixed set of blobs
    fn renderer_with(
        config: RendererConfig,
        blobs: Vec<Vec<u8>>,
    ) -> (ContentRenderer, Vec<ContentHash>) {
        let mut map = HashMap::new();
        let mut hashes = Vec::new();
        for blob in blobs {
            let hash = ContentHash::of(&blob);
            map.insert(hash, blob);
            hashes.push(hash);
        }
        let map = Arc::new(map);
        let fetch: FetchCallback = Box::new(move |hash| map.get(hash).cloned());
        (ContentRenderer::new(config, fetch), hashes)
    }

    #[test]
    fn test_render_full_content() {
        let (renderer, hashes) =
            renderer_with(RendererConfig::default(), vec![b"hello world".to_vec()]);
        let result = renderer.render(&hashes[0], None, 1000).unwrap();

        assert_eq!(result.data, b"hello world");
        assert!(!result.is_partial);
        assert_eq!(result.range_start, 0);
        assert_eq!(result.range_end, 10);
        assert_eq!(result.metadata.size_bytes, 11);
        assert_eq!(result.metadata.content_type, ContentType::Text);
    }

    #[test]
    fn test_range_request_inclusive() {
        let (renderer, hashes) =
            renderer_with(RendererConfig::default(), vec![b"0123456789".to_vec()]);
        let result = renderer.render(&hashes[0], Some((2, 5)), 1000).unwrap();

        assert!(result.is_partial);
        assert_eq!(result.data, b"2345");
        assert_eq!(result.data.len(), 5 - 2 + 1);
        assert_eq!((result.range_start, result.range_end), (2, 5));
    }

    #[test]
    fn test_invalid_ranges_rejected() {
        let (renderer, hashes) =
            renderer_with(RendererConfig::default(), vec![b"0123456789".to_vec()]);
        // end beyond content
        assert!(renderer.render(&hashes[0], Some((0, 10)), 1000).is_err());
        // start after end
        assert!(renderer.render(&hashes[0], Some((5, 2)), 1000).is_err());
    }

    #[test]
    fn test_cache_hit_miss_counters() {
        let (renderer, hashes) =
            renderer_with(RendererConfig::default(), vec![b"content".to_vec()]);

        renderer.render(&hashes[0], None, 1000).unwrap();
        renderer.render(&hashes[0], None, 1000).unwrap();
        renderer.render(&hashes[0], None, 1000).unwrap();

        let stats = renderer.cache_stats();
        assert_eq!(stats.miss_count, 1);
        assert_eq!(stats.hit_count, 2);
        assert_eq!(stats.hit_count + stats.miss_count, 3);
        assert!((stats.hit_ratio - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_lru_eviction_by_item_count() {
        let config = RendererConfig {
            max_cached_items: 2,
            ..RendererConfig::default()
        };
        let (renderer, hashes) = renderer_with(
            config,
            vec![b"aaa".to_vec(), b"bbb".to_vec(), b"ccc".to_vec()],
        );

        renderer.render(&hashes[0], None, 1000).unwrap();
        renderer.render(&hashes[1], None, 1000).unwrap();
        // Touch the first so the second is now least recently used
        renderer.render(&hashes[0], None, 1000).unwrap();
        renderer.render(&hashes[2], None, 1000).unwrap();

        assert!(renderer.is_cached(&hashes[0]));
        assert!(!renderer.is_cached(&hashes[1]), "LRU entry evicted");
        assert!(renderer.is_cached(&hashes[2]));
        assert_eq!(renderer.cache_stats().eviction_count, 1);
    }

    #[test]
    fn test_lru_eviction_by_bytes() {
        let config = RendererConfig {
            max_cache_bytes: 10,
            ..RendererConfig::default()
        };
        let (renderer, hashes) =
            renderer_with(config, vec![vec![1u8; 6], vec![2u8; 6]]);

        renderer.render(&hashes[0], None, 1000).unwrap();
        renderer.render(&hashes[1], None, 1000).unwrap();

        // 12 bytes exceed the cap: the older entry goes
        assert!(!renderer.is_cached(&hashes[0]));
        assert!(renderer.is_cached(&hashes[1]));
    }

    #[test]
    fn test_ttl_expiry() {
        let config = RendererConfig {
            cache_ttl_seconds: 100,
            ..RendererConfig::default()
        };
        let (renderer, hashes) = renderer_with(config, vec![b"data".to_vec()]);

        renderer.render(&hashes[0], None, 1000).unwrap();
        renderer.cleanup_expired(1099);
        assert!(renderer.is_cached(&hashes[0]));
        renderer.cleanup_expired(1100);
        assert!(!renderer.is_cached(&hashes[0]));
    }

    #[test]
    fn test_missing_content() {
        let (renderer, _) = renderer_with(RendererConfig::default(), vec![]);
        assert!(renderer
            .render(&ContentHash([9; 32]), None, 1000)
            .is_err());
    }

    #[test]
    fn test_corrupt_fetch_rejected() {
        // Callback returns bytes that do not hash to the requested id
        let fetch: FetchCallback = Box::new(|_| Some(b"evil".to_vec()));
        let renderer = ContentRenderer::new(RendererConfig::default(), fetch);
        assert!(matches!(
            renderer.render(&ContentHash([9; 32]), None, 1000),
            Err(Error::ThingInvalidHash)
        ));
    }

    #[test]
    fn test_stream_chunks() {
        let config = RendererConfig {
            chunk_size: 4,
            ..RendererConfig::default()
        };
        let (renderer, hashes) = renderer_with(config, vec![b"0123456789".to_vec()]);

        let mut chunks = Vec::new();
        renderer
            .stream(&hashes[0], 1000, |chunk| chunks.push(chunk))
            .unwrap();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].data, b"0123");
        assert_eq!(chunks[2].data, b"89");
        assert!(!chunks[0].is_final);
        assert!(chunks[2].is_final);
        let total: usize = chunks.iter().map(|c| c.length).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn test_prefetch_and_invalidate() {
        let (renderer, hashes) =
            renderer_with(RendererConfig::default(), vec![b"warm me".to_vec()]);

        assert!(renderer.prefetch(&hashes[0], 1000));
        assert!(renderer.is_cached(&hashes[0]));

        renderer.invalidate(Some(&hashes[0]));
        assert!(!renderer.is_cached(&hashes[0]));

        renderer.prefetch(&hashes[0], 1000);
        renderer.invalidate(None);
        assert_eq!(renderer.cache_stats().total_items, 0);
    }

    #[test]
    fn test_content_type_detection() {
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];
        assert_eq!(detect_content_type(&png, None), ContentType::ImagePng);

        let jpeg = [0xFF, 0xD8, 0xFF, 0xE0];
        assert_eq!(detect_content_type(&jpeg, None), ContentType::ImageJpeg);

        assert_eq!(detect_content_type(b"GIF89a...", None), ContentType::ImageGif);

        let mut webp = b"RIFF\x00\x00\x00\x00WEBP".to_vec();
        webp.extend_from_slice(&[0; 4]);
        assert_eq!(detect_content_type(&webp, None), ContentType::ImageWebp);

        assert_eq!(
            detect_content_type(b"<html></html>", Some("index.html")),
            ContentType::Html
        );
        assert_eq!(
            detect_content_type(b"{}", Some("data.json")),
            ContentType::Json
        );
        assert_eq!(detect_content_type(b"plain text", None), ContentType::Text);
        assert_eq!(
            detect_content_type(&[0u8, 1, 2, 3], None),
            ContentType::Binary
        );
    }

    #[test]
    fn test_html_sanitized_on_render() {
        let html = b"<html><body><script>alert(1)</script><p>ok</p></body></html>".to_vec();
        let (renderer, hashes) = renderer_with(RendererConfig::default(), vec![html]);

        let result = renderer.render(&hashes[0], None, 1000).unwrap();
        assert_eq!(result.metadata.content_type, ContentType::Html);
        let body = String::from_utf8(result.data).unwrap();
        assert!(!body.contains("script"));
        assert!(body.contains("<p>ok</p>"));
    }

    #[test]
    fn test_html_sniffed_without_filename() {
        assert_eq!(
            detect_content_type(b"<!DOCTYPE html><html></html>", None),
            ContentType::Html
        );
        assert_eq!(
            detect_content_type(b"  <html lang=\"en\">", None),
            ContentType::Html
        );
    }
}
