//! 上游内容生成器 trait 定义

use async_trait::async_trait;
use errors::UpstreamError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 生成请求
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// 调用方主体（用户）ID
    pub principal_id: String,
    /// 生成对象 ID
    pub subject_id: String,
    /// 关键词集合（无序）
    #[serde(default)]
    pub keywords: Vec<String>,
    /// 其他影响结果的参数
    #[serde(default)]
    pub variant: Map<String, Value>,
}

impl GenerationRequest {
    pub fn new(principal_id: impl Into<String>, subject_id: impl Into<String>) -> Self {
        Self {
            principal_id: principal_id.into(),
            subject_id: subject_id.into(),
            ..Default::default()
        }
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_variant(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variant.insert(name.into(), value);
        self
    }
}

/// 慢速、限流且偶发失败的上游生成器
///
/// 返回的错误应尽量带上 `ErrorKind` 标注，分类器只在缺省时退回到消息匹配
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// 操作名称，同时作为熔断器的粒度
    fn operation_name(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest) -> Result<String, UpstreamError>;
}
