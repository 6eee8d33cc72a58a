use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use serpline_core::clock::Clock;
use serpline_core::models::{AnnotationResponse, CacheEntry, Fingerprint};
use tracing::debug;

/// 缓存统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    /// 因容量被 LRU 淘汰的条目
    pub evictions: u64,
    /// 因 TTL 过期被删除的条目
    pub expirations: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheInner {
    entries: LruCache<Fingerprint, CacheEntry>,
    stats: CacheStats,
}

/// 按指纹缓存标注结果
///
/// TTL 和 LRU 两种淘汰方式相互独立：读到超过 TTL 的条目视为未命中并删除，
/// 写入超过容量时淘汰最久未使用的条目。
pub struct AnnotationCache {
    inner: Mutex<CacheInner>,
    ttl_ms: u64,
    clock: Arc<dyn Clock>,
}

impl AnnotationCache {
    pub fn new(max_size: usize, ttl_ms: u64, clock: Arc<dyn Clock>) -> Self {
        let capacity = NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(capacity),
                stats: CacheStats::default(),
            }),
            ttl_ms,
            clock,
        }
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<AnnotationResponse> {
        let now = self.clock.now();
        let mut guard = self.lock();
        let inner = &mut *guard;

        let expired = match inner.entries.get(fingerprint) {
            Some(entry) if !entry.is_expired(now) => {
                let result = entry.result.clone();
                inner.stats.hits += 1;
                return Some(result);
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            inner.entries.pop(fingerprint);
            inner.stats.expirations += 1;
            debug!(fingerprint = fingerprint.short(), "缓存条目已过期");
        }
        inner.stats.misses += 1;
        None
    }

    /// 写入结果，返回写入的条目
    pub fn put(&self, fingerprint: Fingerprint, result: AnnotationResponse) -> CacheEntry {
        let entry = CacheEntry {
            fingerprint: fingerprint.clone(),
            result,
            written_at: self.clock.now(),
            ttl_ms: self.ttl_ms,
        };
        self.insert(entry.clone());
        entry
    }

    /// 加载外部保存的条目，已过期的条目被跳过
    pub fn load(&self, entries: impl IntoIterator<Item = CacheEntry>) -> usize {
        let now = self.clock.now();
        let mut loaded = 0;
        for entry in entries {
            if entry.is_expired(now) {
                continue;
            }
            self.insert(entry);
            loaded += 1;
        }
        loaded
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        let now = self.clock.now();
        self.lock()
            .entries
            .peek(fingerprint)
            .map(|entry| !entry.is_expired(now))
            .unwrap_or(false)
    }

    /// 主动清除所有过期条目
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut inner = self.lock();
        let expired: Vec<Fingerprint> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(fingerprint, _)| fingerprint.clone())
            .collect();
        for fingerprint in &expired {
            inner.entries.pop(fingerprint);
        }
        inner.stats.expirations += expired.len() as u64;
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }

    fn insert(&self, entry: CacheEntry) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let fingerprint = entry.fingerprint.clone();
        if let Some((evicted, _)) = inner.entries.push(fingerprint.clone(), entry) {
            if evicted != fingerprint {
                inner.stats.evictions += 1;
                debug!(fingerprint = evicted.short(), "缓存已满，淘汰最久未使用的条目");
            }
        }
        inner.stats.sets += 1;
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
