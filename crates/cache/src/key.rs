//! 缓存键生成
//!
//! 相同的逻辑请求必须得到相同的键，任何语义差异都必须得到不同的键。
//! 无序输入（关键词集合、参数对象）在哈希前先规范化。

use errors::{AppError, AppResult};
use ports::GenerationRequest;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// 缓存键参数
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheKeyParams {
    pub operation: String,
    pub principal_id: String,
    pub subject_id: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub variant: Map<String, Value>,
}

impl CacheKeyParams {
    pub fn new(
        operation: impl Into<String>,
        principal_id: impl Into<String>,
        subject_id: impl Into<String>,
    ) -> Self {
        Self {
            operation: operation.into(),
            principal_id: principal_id.into(),
            subject_id: subject_id.into(),
            ..Default::default()
        }
    }

    /// 从生成请求构造
    pub fn from_request(operation: impl Into<String>, request: &GenerationRequest) -> Self {
        Self {
            operation: operation.into(),
            principal_id: request.principal_id.clone(),
            subject_id: request.subject_id.clone(),
            keywords: request.keywords.clone(),
            variant: request.variant.clone(),
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

/// 参与哈希的规范化形式，字段顺序固定
#[derive(Serialize)]
struct CanonicalParams<'a> {
    operation: &'a str,
    principal_id: &'a str,
    subject_id: &'a str,
    keywords: Vec<&'a str>,
    variant: Value,
    schema_version: u32,
}

/// 缓存键管理器
#[derive(Debug, Clone)]
pub struct CacheKeyManager {
    namespace: String,
    schema_version: u32,
}

impl Default for CacheKeyManager {
    fn default() -> Self {
        Self {
            namespace: "tiergate".to_string(),
            schema_version: 1,
        }
    }
}

impl CacheKeyManager {
    pub fn new(namespace: impl Into<String>, schema_version: u32) -> Self {
        Self {
            namespace: namespace.into(),
            schema_version,
        }
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// 生成缓存键
    ///
    /// 格式：`{namespace}:{operation}:{principal}:{subject}:v{schema}:{sha256}`
    pub fn generate_key(&self, params: &CacheKeyParams) -> AppResult<String> {
        if self.schema_version == 0 {
            return Err(AppError::invalid_argument("schema version must be positive"));
        }
        validate_segment("namespace", &self.namespace)?;
        let operation = validate_segment("operation", &params.operation)?;
        let principal_id = validate_segment("principal_id", &params.principal_id)?;
        let subject_id = validate_segment("subject_id", &params.subject_id)?;
        let keywords = canonical_keywords(&params.keywords)?;

        let canonical = CanonicalParams {
            operation,
            principal_id,
            subject_id,
            keywords,
            variant: canonical_value(&Value::Object(params.variant.clone())),
            schema_version: self.schema_version,
        };
        let bytes = serde_json::to_vec(&canonical)?;
        let digest = hex::encode(Sha256::digest(&bytes));

        Ok(format!(
            "{}:{}:{}:{}:v{}:{}",
            self.namespace.trim(),
            operation,
            principal_id,
            subject_id,
            self.schema_version,
            digest
        ))
    }

    /// 为生成请求生成缓存键
    pub fn key_for_request(&self, operation: &str, request: &GenerationRequest) -> AppResult<String> {
        self.generate_key(&CacheKeyParams::from_request(operation, request))
    }
}

fn validate_segment<'a>(field: &str, value: &'a str) -> AppResult<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::invalid_argument(format!("{field} must not be empty")));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(AppError::invalid_argument(format!(
            "{field} must not contain control characters"
        )));
    }
    Ok(trimmed)
}

/// 关键词去空白、排序、去重
fn canonical_keywords(keywords: &[String]) -> AppResult<Vec<&str>> {
    let mut canonical = Vec::with_capacity(keywords.len());
    for keyword in keywords {
        canonical.push(validate_segment("keyword", keyword)?);
    }
    canonical.sort_unstable();
    canonical.dedup();
    Ok(canonical)
}

/// 递归地按键名排序对象，不依赖 `serde_json::Map` 的底层实现
fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k.clone(), canonical_value(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_value).collect()),
        other => other.clone(),
    }
}
