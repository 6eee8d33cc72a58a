//! 通过外部命令调用标注模型
//!
//! 每个条目启动一次配置的程序，stdin 写入 `{"model", "system", "prompt"}`，
//! stdout 读取 `{"annotation", "model"}`。程序输出的标注如果是文本，
//! 会尝试截取其中最外层的 JSON 对象，失败时保留为 `{"reasoning": 文本}`。

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serpline_core::config::CommandProviderConfig;
use serpline_core::errors::ExecutionError;
use serpline_core::models::{AnnotationItem, AnnotationRequest, AnnotationResponse};
use serpline_core::traits::AnnotationProvider;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

const DEFAULT_SYSTEM_PROMPT: &str = "You are an annotation assistant returning JSON.";

#[derive(Debug, Serialize)]
struct BridgeInput<'a> {
    model: &'a str,
    system: &'a str,
    prompt: String,
}

#[derive(Debug, Deserialize)]
struct BridgeOutput {
    annotation: Value,
    #[serde(default)]
    model: Option<String>,
}

pub struct CommandAnnotationProvider {
    config: CommandProviderConfig,
}

impl CommandAnnotationProvider {
    pub fn new(config: CommandProviderConfig) -> Self {
        Self { config }
    }

    #[instrument(skip(self, request), fields(item_id = %request.item.id, fingerprint = request.fingerprint.short()))]
    async fn annotate_one(
        &self,
        request: &AnnotationRequest,
    ) -> Result<AnnotationResponse, ExecutionError> {
        let system = if self.config.system_prompt.is_empty() {
            DEFAULT_SYSTEM_PROMPT
        } else {
            self.config.system_prompt.as_str()
        };
        let input = serde_json::to_vec(&BridgeInput {
            model: &self.config.model,
            system,
            prompt: build_prompt(&request.item),
        })
        .map_err(|e| ExecutionError::validation(format!("序列化标注请求失败: {e}")))?;

        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ExecutionError::configuration(format!(
                    "无法启动标注命令 {}: {e}",
                    self.config.program
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&input)
                .await
                .map_err(|e| ExecutionError::transient(format!("写入标注命令输入失败: {e}")))?;
        }

        let timeout_ms = self.config.timeout_ms;
        let output = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            child.wait_with_output(),
        )
        .await
        .map_err(|_| ExecutionError::Timeout { timeout_ms })?
        .map_err(|e| ExecutionError::transient(format!("等待标注命令失败: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(status = %output.status, stderr = %stderr.trim(), "标注命令返回非零状态");
            return Err(ExecutionError::transient(format!(
                "标注命令退出状态 {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let envelope: BridgeOutput = serde_json::from_str(stdout.trim())
            .map_err(|e| ExecutionError::validation(format!("无法解析标注命令输出: {e}")))?;

        let annotation = match envelope.annotation {
            Value::String(text) => extract_json_from_text(&text),
            other => other,
        };
        debug!("标注命令执行完成");

        Ok(AnnotationResponse {
            fingerprint: request.fingerprint.clone(),
            annotation,
            model: envelope.model.or_else(|| Some(self.config.model.clone())),
        })
    }
}

#[async_trait]
impl AnnotationProvider for CommandAnnotationProvider {
    async fn annotate(
        &self,
        batch: &[AnnotationRequest],
    ) -> Result<Vec<AnnotationResponse>, ExecutionError> {
        let mut responses = Vec::with_capacity(batch.len());
        for request in batch {
            responses.push(self.annotate_one(request).await?);
        }
        Ok(responses)
    }

    fn name(&self) -> &str {
        &self.config.program
    }
}

/// 为单个搜索结果构造标注提示词
pub fn build_prompt(item: &AnnotationItem) -> String {
    let mut prompt = String::new();
    if let Some(query) = &item.query {
        prompt.push_str(&format!("Query: {query}\n"));
    }
    if let Some(engine) = &item.engine {
        prompt.push_str(&format!("Engine: {engine}\n"));
    }
    prompt.push_str(&format!(
        "Title: {}\nSnippet: {}\nURL: {}\n\nReturn a JSON object annotating this search result.",
        item.title, item.snippet, item.url
    ));
    prompt
}

/// 从模型返回的文本中截取最外层的 JSON 对象
pub fn extract_json_from_text(text: &str) -> Value {
    if text.is_empty() {
        return Value::Object(Default::default());
    }
    let reasoning = || serde_json::json!({ "reasoning": text.trim() });
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => {
            serde_json::from_str(&text[start..=end]).unwrap_or_else(|_| reasoning())
        }
        _ => reasoning(),
    }
}
