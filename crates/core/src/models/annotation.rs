use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use uuid::Uuid;

/// 归一化后 (title, snippet, url) 的确定性哈希
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 日志中使用的短前缀，按字符截取
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(12) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 标注批次标识，批次关闭后对应一个队列任务
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// 待标注的一条搜索结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationItem {
    pub id: String,
    pub title: String,
    pub snippet: String,
    pub url: String,
    pub query: Option<String>,
    pub engine: Option<String>,
}

impl AnnotationItem {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        snippet: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            snippet: snippet.into(),
            url: url.into(),
            query: None,
            engine: None,
        }
    }
}

/// 发给标注服务的一条请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationRequest {
    pub fingerprint: Fingerprint,
    pub item: AnnotationItem,
}

/// 标注服务的返回
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationResponse {
    pub fingerprint: Fingerprint,
    /// 服务返回的标注内容，结构由提示词决定
    pub annotation: serde_json::Value,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub result: AnnotationResponse,
    pub written_at: DateTime<Utc>,
    pub ttl_ms: u64,
}

impl CacheEntry {
    /// 超过 TTL 的条目视为未命中
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        (now - self.written_at).num_milliseconds() > self.ttl_ms as i64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum QueueDisposition {
    /// 命中缓存，已直接产生结果事件
    Cached,
    /// 新指纹进入批次，批次关闭后作为一个队列任务提交
    Submitted { batch_id: BatchId },
    /// 加入了同一指纹已在批次或执行中的请求
    Joined { batch_id: BatchId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAnnotation {
    pub item_id: String,
    pub fingerprint: Fingerprint,
    pub disposition: QueueDisposition,
}

impl QueuedAnnotation {
    pub fn batch_id(&self) -> Option<BatchId> {
        match &self.disposition {
            QueueDisposition::Cached => None,
            QueueDisposition::Submitted { batch_id } | QueueDisposition::Joined { batch_id } => {
                Some(*batch_id)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationOutcome {
    pub item_id: String,
    pub fingerprint: Fingerprint,
    pub result: AnnotationResponse,
    pub cached: bool,
}
