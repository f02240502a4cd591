//! 糕点库存 HTTP 客户端
//!
//! 库存服务是只读目录，按名称返回商品及其可售状态。
//! 通过 PastryApi trait 抽象 HTTP 调用，便于测试时注入 mock 实现。

use std::time::Duration;

use async_trait::async_trait;
use bakery_shared::error::BakeryError;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

const SERVICE_NAME: &str = "pastry-api";

/// 唯一允许下单的库存状态
pub const STATUS_AVAILABLE: &str = "available";

/// 库存目录中的糕点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pastry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub price: f64,
    pub status: String,
}

impl Pastry {
    pub fn is_available(&self) -> bool {
        self.status == STATUS_AVAILABLE
    }
}

/// 库存服务的抽象接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PastryApi: Send + Sync {
    /// 按名称查询糕点
    async fn get_pastry(&self, name: &str) -> Result<Pastry, BakeryError>;

    /// 按尺寸列出糕点
    async fn list_pastries(&self, size: &str) -> Result<Vec<Pastry>, BakeryError>;
}

/// 基于 reqwest 的库存服务客户端
#[derive(Debug, Clone)]
pub struct PastryApiClient {
    http: reqwest::Client,
    base_url: Url,
}

impl PastryApiClient {
    /// 创建客户端
    ///
    /// 基础地址中的空格替换为 `+`，模拟服务的路径形如 `/rest/API+Pastries/0.0.1`。
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BakeryError> {
        let normalized = base_url.trim_end_matches('/').replace(' ', "+");
        let base_url = Url::parse(&normalized)
            .map_err(|e| BakeryError::Validation(format!("无效的库存服务地址 {normalized}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(BakeryError::Validation(format!(
                "库存服务地址不能作为基础路径: {normalized}"
            )));
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BakeryError::Internal(format!("创建 HTTP 客户端失败: {e}")))?;

        Ok(Self { http, base_url })
    }

    /// 在基础路径后追加路径段，段内的特殊字符会被百分号编码
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn fetch<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T, BakeryError> {
        debug!(%url, "请求库存服务");

        let response = self.http.get(url).send().await.map_err(map_transport_error)?;

        if response.status() != StatusCode::OK {
            return Err(BakeryError::ExternalService {
                service: SERVICE_NAME.to_string(),
                message: format!("unexpected status code: {}", response.status().as_u16()),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| BakeryError::ExternalService {
                service: SERVICE_NAME.to_string(),
                message: format!("failed to decode response body: {e}"),
            })
    }
}

#[async_trait]
impl PastryApi for PastryApiClient {
    async fn get_pastry(&self, name: &str) -> Result<Pastry, BakeryError> {
        self.fetch(self.endpoint(&["pastries", name])).await
    }

    async fn list_pastries(&self, size: &str) -> Result<Vec<Pastry>, BakeryError> {
        let mut url = self.endpoint(&["pastries"]);
        url.query_pairs_mut().append_pair("size", size);
        self.fetch(url).await
    }
}

fn map_transport_error(e: reqwest::Error) -> BakeryError {
    if e.is_timeout() {
        BakeryError::ExternalServiceTimeout {
            service: SERVICE_NAME.to_string(),
        }
    } else {
        BakeryError::ExternalService {
            service: SERVICE_NAME.to_string(),
            message: format!("failed to make GET request: {e}"),
        }
    }
}
