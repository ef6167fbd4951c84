//! File-backed cache for synthesized speech.
//!
//! Each entry is a `{key}.bin` payload next to a `{key}.json` metadata file.
//! The in-memory index is rebuilt from the metadata files when the cache is
//! opened. Unreadable or missing files are always treated as misses.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Every parameter that changes the synthesized audio.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisParams<'a> {
    pub text: &'a str,
    pub voice: &'a str,
    pub model: &'a str,
    pub provider: &'a str,
    pub speed: f32,
    pub pitch: f32,
    pub format: &'a str,
}

#[derive(Serialize)]
struct CanonicalParams<'a> {
    provider: String,
    model: String,
    voice: &'a str,
    speed: String,
    pitch: String,
    format: String,
    text: &'a str,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntryMeta {
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub size: u64,
    pub access_count: u64,
    pub last_accessed: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl CacheEntryMeta {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub data: Vec<u8>,
    pub meta: CacheEntryMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub evictions: u64,
    pub avg_entry_size: u64,
}

struct Indexed {
    meta: CacheEntryMeta,
    // Breaks ties between entries touched within the same clock tick.
    seq: u64,
}

pub struct ContentCache {
    dir: PathBuf,
    max_bytes: u64,
    ttl: Duration,
    index: HashMap<String, Indexed>,
    seq: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl ContentCache {
    /// Open (or create) a cache directory and rebuild the index from it.
    pub async fn open(dir: impl Into<PathBuf>, max_bytes: u64, ttl: Duration) -> io::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut metas = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = tokio::fs::read(&path)
                .await
                .ok()
                .and_then(|raw| serde_json::from_slice::<CacheEntryMeta>(&raw).ok());
            match parsed {
                Some(meta) if dir.join(format!("{}.bin", meta.key)).exists() => metas.push(meta),
                _ => {
                    warn!(path = %path.display(), "dropping corrupt cache entry");
                    let _ = tokio::fs::remove_file(&path).await;
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        let _ = tokio::fs::remove_file(dir.join(format!("{stem}.bin"))).await;
                    }
                }
            }
        }
        metas.sort_by_key(|m| m.last_accessed);

        let mut cache = Self {
            dir,
            max_bytes,
            ttl,
            index: HashMap::new(),
            seq: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        };
        for meta in metas {
            let seq = cache.next_seq();
            cache.index.insert(meta.key.clone(), Indexed { meta, seq });
        }
        debug!(entries = cache.index.len(), dir = %cache.dir.display(), "cache opened");
        Ok(cache)
    }

    /// Deterministic key over canonicalized synthesis parameters.
    ///
    /// Provider, model and format are case-insensitive; text and voice are
    /// kept exactly since providers treat them as case-sensitive.
    pub fn generate_key(params: &SynthesisParams<'_>) -> String {
        let canonical = CanonicalParams {
            provider: params.provider.trim().to_lowercase(),
            model: params.model.trim().to_lowercase(),
            voice: params.voice,
            speed: format!("{}", params.speed),
            pitch: format!("{}", params.pitch),
            format: params.format.trim().to_lowercase(),
            text: params.text,
        };
        // Serializing a struct keeps field order fixed and escapes separators.
        let encoded = serde_json::to_string(&canonical).unwrap_or_default();
        format!("{:x}", Sha256::digest(encoded.as_bytes()))
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn bin_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.bin"))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn total_size(&self) -> u64 {
        self.index.values().map(|e| e.meta.size).sum()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub async fn get(&mut self, key: &str) -> Option<CacheEntry> {
        let now = Utc::now();
        let expired = match self.index.get(key) {
            None => {
                self.misses += 1;
                return None;
            }
            Some(entry) => entry.meta.is_expired(now),
        };
        if expired {
            debug!(key, "cache entry expired");
            self.delete_files(key).await;
            self.index.remove(key);
            self.misses += 1;
            return None;
        }

        let data = match tokio::fs::read(self.bin_path(key)).await {
            Ok(data) => data,
            Err(e) => {
                warn!(key, error = %e, "cache payload unreadable, treating as miss");
                self.delete_files(key).await;
                self.index.remove(key);
                self.misses += 1;
                return None;
            }
        };

        let seq = self.next_seq();
        let entry = self.index.get_mut(key)?;
        entry.meta.access_count += 1;
        entry.meta.last_accessed = now;
        entry.seq = seq;
        let meta = entry.meta.clone();
        if let Err(e) = self.write_meta(&meta).await {
            debug!(key, error = %e, "could not refresh cache metadata");
        }
        self.hits += 1;
        Some(CacheEntry { data, meta })
    }

    /// Store a payload, evicting least recently accessed entries first.
    ///
    /// Returns `false` when the payload alone exceeds the byte budget and
    /// was therefore not stored.
    pub async fn set(
        &mut self,
        key: &str,
        data: &[u8],
        metadata: serde_json::Value,
    ) -> io::Result<bool> {
        let size = data.len() as u64;
        if size > self.max_bytes {
            debug!(key, size, budget = self.max_bytes, "payload larger than cache budget");
            return Ok(false);
        }
        if self.index.contains_key(key) {
            self.remove(key).await;
        }

        while self.total_size() + size > self.max_bytes {
            let Some(victim) = self
                .index
                .iter()
                .min_by_key(|(_, e)| (e.meta.last_accessed, e.seq))
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            debug!(key = %victim, "evicting cache entry");
            self.delete_files(&victim).await;
            self.index.remove(&victim);
            self.evictions += 1;
        }

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::days(3650));
        let meta = CacheEntryMeta {
            key: key.to_string(),
            created_at: now,
            expires_at: now + ttl,
            size,
            access_count: 0,
            last_accessed: now,
            metadata,
        };
        tokio::fs::write(self.bin_path(key), data).await?;
        if let Err(e) = self.write_meta(&meta).await {
            let _ = tokio::fs::remove_file(self.bin_path(key)).await;
            return Err(e);
        }
        let seq = self.next_seq();
        self.index.insert(key.to_string(), Indexed { meta, seq });
        Ok(true)
    }

    pub async fn remove(&mut self, key: &str) -> bool {
        let existed = self.index.remove(key).is_some();
        self.delete_files(key).await;
        existed
    }

    pub fn statistics(&self) -> CacheStats {
        let entries = self.index.len();
        let total_size = self.total_size();
        let lookups = self.hits + self.misses;
        let (hit_rate, miss_rate) = if lookups == 0 {
            (0.0, 0.0)
        } else {
            (
                self.hits as f64 / lookups as f64,
                self.misses as f64 / lookups as f64,
            )
        };
        CacheStats {
            entries,
            total_size,
            hits: self.hits,
            misses: self.misses,
            hit_rate,
            miss_rate,
            evictions: self.evictions,
            avg_entry_size: if entries == 0 {
                0
            } else {
                total_size / entries as u64
            },
        }
    }

    /// Remove every entry and reset the counters.
    pub async fn clear(&mut self) -> io::Result<()> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("bin" | "json")
            ) {
                tokio::fs::remove_file(&path).await?;
            }
        }
        self.index.clear();
        self.hits = 0;
        self.misses = 0;
        self.evictions = 0;
        Ok(())
    }

    /// Drop every expired entry, returning how many were removed.
    pub async fn purge_expired(&mut self) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = self
            .index
            .iter()
            .filter(|(_, e)| e.meta.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove(key).await;
        }
        expired.len()
    }

    async fn write_meta(&self, meta: &CacheEntryMeta) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(meta).map_err(io::Error::other)?;
        tokio::fs::write(self.meta_path(&meta.key), json).await
    }

    async fn delete_files(&self, key: &str) {
        let _ = tokio::fs::remove_file(self.bin_path(key)).await;
        let _ = tokio::fs::remove_file(self.meta_path(key)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const DAY: Duration = Duration::from_secs(86_400);

    fn params() -> SynthesisParams<'static> {
        SynthesisParams {
            text: "Breathe in slowly.",
            voice: "nova",
            model: "tts-1-hd",
            provider: "openai",
            speed: 1.0,
            pitch: 0.0,
            format: "mp3",
        }
    }

    #[test]
    fn key_is_deterministic() {
        let a = ContentCache::generate_key(&params());
        let b = ContentCache::generate_key(&params());
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn key_canonicalizes_case_of_provider_model_and_format() {
        let upper = SynthesisParams {
            provider: "OpenAI",
            model: "TTS-1-HD",
            format: "MP3",
            ..params()
        };
        assert_eq!(
            ContentCache::generate_key(&upper),
            ContentCache::generate_key(&params())
        );
    }

    #[test]
    fn key_changes_with_every_parameter() {
        let base = ContentCache::generate_key(&params());
        let variants = [
            SynthesisParams { text: "Breathe out slowly.", ..params() },
            SynthesisParams { voice: "alloy", ..params() },
            SynthesisParams { model: "tts-1", ..params() },
            SynthesisParams { provider: "elevenlabs", ..params() },
            SynthesisParams { speed: 1.05, ..params() },
            SynthesisParams { pitch: 0.5, ..params() },
            SynthesisParams { format: "wav", ..params() },
        ];
        let mut seen = std::collections::HashSet::new();
        for v in &variants {
            let key = ContentCache::generate_key(v);
            assert_ne!(key, base, "{v:?} collided with base");
            assert!(seen.insert(key), "{v:?} collided with another variant");
        }
    }

    #[test]
    fn field_boundaries_cannot_be_forged() {
        let a = SynthesisParams { voice: "a\"", text: "b", ..params() };
        let b = SynthesisParams { voice: "a", text: "\"b", ..params() };
        assert_ne!(ContentCache::generate_key(&a), ContentCache::generate_key(&b));
    }

    #[tokio::test]
    async fn set_then_get_returns_identical_payload_and_metadata() {
        let dir = TempDir::new().unwrap();
        let mut cache = ContentCache::open(dir.path(), 1024 * 1024, DAY).await.unwrap();
        let payload: Vec<u8> = (0..=255).collect();
        let meta = json!({"provider": "openai", "note": "ünïcode ✓"});

        assert!(cache.set("k1", &payload, meta.clone()).await.unwrap());
        let entry = cache.get("k1").await.unwrap();
        assert_eq!(entry.data, payload);
        assert_eq!(entry.meta.metadata, meta);
        assert_eq!(entry.meta.access_count, 1);
    }

    #[tokio::test]
    async fn index_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut cache = ContentCache::open(dir.path(), 1024, DAY).await.unwrap();
            cache.set("persist", b"abc", json!(null)).await.unwrap();
        }
        let mut cache = ContentCache::open(dir.path(), 1024, DAY).await.unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("persist").await.unwrap().data, b"abc");
    }

    #[tokio::test]
    async fn corrupt_metadata_is_dropped_on_open() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bad.json"), b"{not json").unwrap();
        std::fs::write(dir.path().join("bad.bin"), b"xyz").unwrap();
        let cache = ContentCache::open(dir.path(), 1024, DAY).await.unwrap();
        assert!(cache.is_empty());
        assert!(!dir.path().join("bad.bin").exists());
    }

    #[tokio::test]
    async fn missing_payload_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let mut cache = ContentCache::open(dir.path(), 1024, DAY).await.unwrap();
        cache.set("gone", b"data", json!({})).await.unwrap();
        std::fs::remove_file(dir.path().join("gone.bin")).unwrap();

        assert!(cache.get("gone").await.is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.statistics().misses, 1);
    }

    #[tokio::test]
    async fn expired_entries_are_deleted_on_get() {
        let dir = TempDir::new().unwrap();
        let mut cache = ContentCache::open(dir.path(), 1024, Duration::ZERO).await.unwrap();
        cache.set("old", b"data", json!({})).await.unwrap();
        assert!(cache.get("old").await.is_none());
        assert!(!dir.path().join("old.bin").exists());
        assert!(!dir.path().join("old.json").exists());
    }

    #[tokio::test]
    async fn purge_expired_counts_removals() {
        let dir = TempDir::new().unwrap();
        let mut cache = ContentCache::open(dir.path(), 1024, Duration::ZERO).await.unwrap();
        cache.set("a", b"1", json!({})).await.unwrap();
        cache.set("b", b"2", json!({})).await.unwrap();
        assert_eq!(cache.purge_expired().await, 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn eviction_removes_least_recently_accessed_first() {
        let dir = TempDir::new().unwrap();
        let mut cache = ContentCache::open(dir.path(), 30, DAY).await.unwrap();
        cache.set("a", &[0; 10], json!({})).await.unwrap();
        cache.set("b", &[0; 10], json!({})).await.unwrap();
        cache.set("c", &[0; 10], json!({})).await.unwrap();

        // Touch "a" so "b" becomes the oldest.
        assert!(cache.get("a").await.is_some());
        cache.set("d", &[0; 10], json!({})).await.unwrap();

        assert!(cache.get("b").await.is_none());
        assert!(cache.get("a").await.is_some());
        assert!(cache.get("c").await.is_some());
        assert!(cache.get("d").await.is_some());
        assert_eq!(cache.statistics().evictions, 1);
    }

    #[tokio::test]
    async fn total_size_never_exceeds_budget() {
        let dir = TempDir::new().unwrap();
        let budget = 100;
        let mut cache = ContentCache::open(dir.path(), budget, DAY).await.unwrap();
        for i in 0..40u64 {
            let size = ((i * 37) % 60 + 1) as usize;
            cache.set(&format!("k{i}"), &vec![i as u8; size], json!({"i": i})).await.unwrap();
            assert!(cache.total_size() <= budget);
            if i % 3 == 0 {
                cache.get(&format!("k{}", i / 2)).await;
            }
        }
    }

    #[tokio::test]
    async fn oversized_payload_is_not_stored() {
        let dir = TempDir::new().unwrap();
        let mut cache = ContentCache::open(dir.path(), 8, DAY).await.unwrap();
        cache.set("small", b"1234", json!({})).await.unwrap();
        assert!(!cache.set("huge", &[0; 9], json!({})).await.unwrap());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.statistics().evictions, 0);
    }

    #[tokio::test]
    async fn overwrite_replaces_entry_size() {
        let dir = TempDir::new().unwrap();
        let mut cache = ContentCache::open(dir.path(), 20, DAY).await.unwrap();
        cache.set("k", &[1; 15], json!({})).await.unwrap();
        cache.set("k", &[2; 15], json!({})).await.unwrap();
        assert_eq!(cache.total_size(), 15);
        assert_eq!(cache.get("k").await.unwrap().data, vec![2; 15]);
    }

    #[tokio::test]
    async fn statistics_and_clear() {
        let dir = TempDir::new().unwrap();
        let mut cache = ContentCache::open(dir.path(), 1024, DAY).await.unwrap();
        cache.set("a", &[0; 10], json!({})).await.unwrap();
        cache.set("b", &[0; 30], json!({})).await.unwrap();
        cache.get("a").await;
        cache.get("a").await;
        cache.get("zzz").await;

        let stats = cache.statistics();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.total_size, 40);
        assert_eq!(stats.avg_entry_size, 20);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((stats.miss_rate - 1.0 / 3.0).abs() < 1e-9);

        cache.clear().await.unwrap();
        assert_eq!(cache.statistics(), CacheStats::default());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
