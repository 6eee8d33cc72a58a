//! 外部能力接口
//!
//! 搜索采集、结果标注和查询加载由外部系统实现，核心只通过这几个 trait 调用它们。
//! 所有方法返回 [`ExecutionError`]，调用方据此决定重试还是放弃。

use async_trait::async_trait;

use crate::errors::ExecutionError;
use crate::models::{AnnotationRequest, AnnotationResponse, Query, SearchResult};

/// 搜索引擎采集器
#[async_trait]
pub trait Collector: Send + Sync {
    /// 在指定引擎上执行一次查询
    async fn collect(&self, engine: &str, query: &Query)
        -> Result<Vec<SearchResult>, ExecutionError>;
}

/// 标注服务
///
/// 一次调用处理一个批次，返回的响应按 `fingerprint` 与请求对应。
/// 批次中缺少响应的请求会被视为校验失败。
#[async_trait]
pub trait AnnotationProvider: Send + Sync {
    async fn annotate(
        &self,
        batch: &[AnnotationRequest],
    ) -> Result<Vec<AnnotationResponse>, ExecutionError>;

    /// 用于日志的服务名
    fn name(&self) -> &str {
        "annotation-provider"
    }
}

/// 查询源
#[async_trait]
pub trait QuerySource: Send + Sync {
    /// 加载指定查询源下的全部查询；未知的查询源返回 `Configuration` 错误
    async fn load_queries(&self, source_id: &str) -> Result<Vec<Query>, ExecutionError>;
}
