//! 标注流水线
//!
//! 搜索结果先按内容指纹去重，命中缓存直接返回；未命中的指纹按优先级攒批，
//! 每个批次作为一个任务进入 [`serpline_dispatcher::TaskQueue`]，限流后调用标注服务。

pub mod batcher;
pub mod cache;
pub mod command_provider;
pub mod fingerprint;
pub mod pipeline;
pub mod rate_limiter;

pub use batcher::{Admission, BatchAccumulator, PendingBatch};
pub use cache::{AnnotationCache, CacheStats};
pub use command_provider::CommandAnnotationProvider;
pub use fingerprint::fingerprint;
pub use pipeline::{AnnotationJobHandler, AnnotationPipeline, PipelineStats};
pub use rate_limiter::{RateDecision, RateLimiter};
