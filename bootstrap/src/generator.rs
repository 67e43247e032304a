//! 带缓存的生成入口
//!
//! 先查多级缓存，未命中时经重试执行器调用上游，结果写回所有缓存层

use std::sync::Arc;
use std::time::Duration;

use common::RequestId;
use errors::AppResult;
use ports::{ContentGenerator, GenerationRequest};
use resilience::ExecuteOptions;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::layer::ReliabilityLayer;

/// 结果来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationSource {
    Cache,
    Upstream,
}

/// 生成结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Generated {
    pub key: String,
    pub value: String,
    pub source: GenerationSource,
}

/// 单次生成选项
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// 跳过缓存读取，强制调用上游并覆盖缓存
    pub force_regenerate: bool,
    pub request_id: Option<RequestId>,
    /// 单次尝试超时
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    /// 写回缓存的 TTL，未设置时各层使用自己的默认值
    pub ttl: Option<Duration>,
}

impl GenerateOptions {
    pub fn force_regenerate(mut self) -> Self {
        self.force_regenerate = true;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<RequestId>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// 带缓存与重试的生成器
pub struct CachedGenerator {
    layer: Arc<ReliabilityLayer>,
    generator: Arc<dyn ContentGenerator>,
}

impl CachedGenerator {
    pub fn new(layer: Arc<ReliabilityLayer>, generator: Arc<dyn ContentGenerator>) -> Self {
        Self { layer, generator }
    }

    pub fn layer(&self) -> &Arc<ReliabilityLayer> {
        &self.layer
    }

    /// 生成内容
    ///
    /// 上游成功后缓存写回失败不影响返回值
    pub async fn generate(
        &self,
        request: &GenerationRequest,
        options: GenerateOptions,
    ) -> AppResult<Generated> {
        let operation = self.generator.operation_name().to_string();
        let key = self.layer.keys().key_for_request(&operation, request)?;

        if options.force_regenerate {
            debug!(key = %key, "Forced regeneration, skipping cache lookup");
        } else if let Some(value) = self.layer.cache().get(&key).await {
            return Ok(Generated {
                key,
                value,
                source: GenerationSource::Cache,
            });
        }

        let mut execute = ExecuteOptions::new(operation.as_str());
        if let Some(request_id) = options.request_id {
            execute = execute.with_request_id(request_id);
        }
        if let Some(timeout) = options.timeout {
            execute = execute.with_timeout(timeout);
        }
        if let Some(cancel) = options.cancel {
            execute = execute.with_cancel(cancel);
        }

        let generator: &dyn ContentGenerator = self.generator.as_ref();
        let value = self
            .layer
            .executor()
            .execute_with_retry(move || generator.generate(request), execute)
            .await?;

        if let Err(e) = self.layer.cache().set(&key, &value, options.ttl).await {
            warn!(key = %key, error = %e, "Generated value could not be cached");
        }

        Ok(Generated {
            key,
            value,
            source: GenerationSource::Upstream,
        })
    }

    /// 使某个请求的缓存失效
    pub async fn invalidate(&self, request: &GenerationRequest) -> AppResult<()> {
        let key = self
            .layer
            .keys()
            .key_for_request(self.generator.operation_name(), request)?;
        self.layer.cache().delete(&key).await
    }
}
