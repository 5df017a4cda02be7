//! HTTP 客户端模块 - 表格镜像服务的 checksum / 全量数据接口
//!
//! 远端是一个用 query 参数驱动的 GET 接口：
//! - `?action=getChecksum` → `{ checksum }`
//! - `?action=getFullData&checksum=<已知值或空>` → `{ changed, checksum, data?, timestamp? }`
//! - `?action=getMultiChecksum` → `{ checksums: { 范围名: checksum } }`
//!
//! 另有一个 CSV 文本接口提供原始行数据。同步层只依赖 [`SheetTransport`]，
//! 测试时可以替换成内存实现。

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{HandlogSDKError, Result};
use crate::sdk::HttpClientConfig;
use crate::version;

/// `getChecksum` 响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecksumResponse {
    pub checksum: String,
}

/// `getFullData` 响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullDataResponse {
    #[serde(default)]
    pub changed: bool,
    pub checksum: String,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// `getMultiChecksum` 响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiChecksumResponse {
    #[serde(default)]
    pub checksums: HashMap<String, String>,
}

/// 远端数据源抽象
///
/// `get` 返回响应体原文，由调用方负责 JSON 解码并统计字节数。
#[async_trait]
pub trait SheetTransport: Send + Sync {
    /// 以 query 参数请求 JSON 接口
    async fn get(&self, query: &[(&str, &str)]) -> Result<String>;

    /// 拉取 CSV 行数据原文
    async fn fetch_csv(&self) -> Result<String>;
}

/// 基于 reqwest 的 [`SheetTransport`] 实现
pub struct HttpSheetTransport {
    client: Client,
    endpoint_url: String,
    csv_url: Option<String>,
}

impl HttpSheetTransport {
    /// 创建新的 HTTP 传输
    pub fn new(
        config: &HttpClientConfig,
        endpoint_url: impl Into<String>,
        csv_url: Option<String>,
    ) -> Result<Self> {
        let mut builder = Client::builder().user_agent(version::user_agent());

        if let Some(timeout) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }

        if let Some(timeout) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }

        let client = builder
            .build()
            .map_err(|e| HandlogSDKError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        let endpoint_url = endpoint_url.into();
        info!("✅ HTTP 客户端已创建 (endpoint: {})", endpoint_url);

        Ok(Self {
            client,
            endpoint_url,
            csv_url,
        })
    }

    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    async fn get_text(&self, request: reqwest::RequestBuilder) -> Result<String> {
        // 等价于浏览器的 cache: 'no-cache'，避免中间代理返回旧的 checksum
        let response = request.header("Cache-Control", "no-cache").send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(HandlogSDKError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }

        let body = response.text().await?;
        debug!("HTTP 响应 {} bytes", body.len());
        Ok(body)
    }
}

#[async_trait]
impl SheetTransport for HttpSheetTransport {
    async fn get(&self, query: &[(&str, &str)]) -> Result<String> {
        self.get_text(self.client.get(&self.endpoint_url).query(query)).await
    }

    async fn fetch_csv(&self) -> Result<String> {
        let url = self.csv_url.as_deref().ok_or_else(|| {
            HandlogSDKError::Config("csv_url 未配置，无法拉取行数据".to_string())
        })?;
        self.get_text(self.client.get(url)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_full_data_response_optional_fields() {
        let resp: FullDataResponse =
            serde_json::from_str(r#"{"changed": false, "checksum": "abc"}"#).unwrap();
        assert!(!resp.changed);
        assert!(resp.data.is_none());
        assert!(resp.timestamp.is_none());

        let resp: FullDataResponse = serde_json::from_value(json!({
            "changed": true,
            "checksum": "def",
            "data": {"rows": [["", "138", "10:18"]]},
            "timestamp": "2025-09-17T10:18:00Z"
        }))
        .unwrap();
        assert!(resp.changed);
        assert!(resp.data.is_some());
    }

    #[test]
    fn test_checksum_response_requires_checksum() {
        assert!(serde_json::from_str::<ChecksumResponse>(r#"{"foo": 1}"#).is_err());
        let multi: MultiChecksumResponse =
            serde_json::from_str(r#"{"checksums": {"A1:E100": "x1"}}"#).unwrap();
        assert_eq!(multi.checksums.get("A1:E100").map(String::as_str), Some("x1"));
    }

    #[test]
    fn test_fetch_csv_without_url_is_config_error() {
        let transport =
            HttpSheetTransport::new(&HttpClientConfig::default(), "http://127.0.0.1:9/exec", None)
                .unwrap();
        assert_eq!(transport.endpoint_url(), "http://127.0.0.1:9/exec");
        let err = tokio_test::block_on(transport.fetch_csv()).unwrap_err();
        assert_eq!(err.kind(), "config");
    }
}
