//! 计算引擎 REST 客户端
//!
//! [`ComputeClient`] 只暴露协调流程用到的四个调用。[`RestComputeClient`] 通过
//! Compute Engine v1 REST 接口实现它，HTTP 404 被映射为 [`ComputeError::NotFound`]。

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use civm_common::{ComputeError, Instance, Operation};

use crate::config::ComputeConfig;

/// 计算引擎调用结果
pub type ComputeResult<T> = std::result::Result<T, ComputeError>;

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// 计算引擎接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ComputeClient: Send + Sync {
    /// 查询实例
    async fn get_instance(&self, project: &str, zone: &str, name: &str)
        -> ComputeResult<Instance>;

    /// 创建实例，返回异步操作
    async fn insert_instance(
        &self,
        project: &str,
        zone: &str,
        instance: &Instance,
    ) -> ComputeResult<Operation>;

    /// 删除实例，返回异步操作
    async fn delete_instance(&self, project: &str, zone: &str, name: &str)
        -> ComputeResult<Operation>;

    /// 查询区域操作
    async fn get_zone_operation(
        &self,
        project: &str,
        zone: &str,
        operation: &str,
    ) -> ComputeResult<Operation>;
}

/// 缓存的访问令牌
#[derive(Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: i64,
}

/// 访问令牌来源
enum TokenSource {
    /// 配置中给定的固定令牌
    Static(String),
    /// 从实例元数据服务器获取并缓存
    MetadataServer(Arc<RwLock<Option<CachedToken>>>),
}

impl TokenSource {
    async fn access_token(&self, http: &reqwest::Client) -> ComputeResult<String> {
        let cache = match self {
            TokenSource::Static(token) => return Ok(token.clone()),
            TokenSource::MetadataServer(cache) => cache,
        };

        // 提前一分钟刷新
        let refresh_before = Utc::now() + ChronoDuration::seconds(60);
        if let Some(token) = cache.read().await.as_ref() {
            if token.expires_at > refresh_before {
                return Ok(token.access_token.clone());
            }
        }

        let mut guard = cache.write().await;
        if let Some(token) = guard.as_ref() {
            if token.expires_at > refresh_before {
                return Ok(token.access_token.clone());
            }
        }

        debug!("从元数据服务器获取访问令牌");
        let response = http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| ComputeError::Auth(format!("请求元数据服务器失败: {e}")))?;
        if !response.status().is_success() {
            return Err(ComputeError::Auth(format!(
                "元数据服务器返回 {}",
                response.status()
            )));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ComputeError::Auth(format!("解析访问令牌失败: {e}")))?;

        let cached = CachedToken {
            access_token: token.access_token,
            expires_at: Utc::now() + ChronoDuration::seconds(token.expires_in),
        };
        let access_token = cached.access_token.clone();
        *guard = Some(cached);
        Ok(access_token)
    }
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: String,
}

/// 从错误响应体中提取可读信息，无法解析时原样返回
fn api_error_message(body: &str) -> String {
    serde_json::from_str::<ApiErrorBody>(body)
        .map(|b| b.error.message)
        .ok()
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| body.trim().to_string())
}

/// 基于 REST 接口的计算引擎客户端
pub struct RestComputeClient {
    http: reqwest::Client,
    endpoint: String,
    token: TokenSource,
}

impl RestComputeClient {
    /// 根据配置创建客户端
    pub fn new(config: &ComputeConfig) -> ComputeResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| ComputeError::Transport(e.to_string()))?;

        let token = match config.access_token.as_deref() {
            Some(token) if !token.is_empty() => TokenSource::Static(token.to_string()),
            _ => TokenSource::MetadataServer(Arc::new(RwLock::new(None))),
        };

        info!("计算引擎端点: {}", config.endpoint);
        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn zone_url(&self, project: &str, zone: &str) -> String {
        format!("{}/projects/{}/zones/{}", self.endpoint, project, zone)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        resource: &str,
    ) -> ComputeResult<T> {
        let token = self.token.access_token(&self.http).await?;
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| ComputeError::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ComputeError::NotFound(resource.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ComputeError::Api {
                code: status.as_u16(),
                message: api_error_message(&body),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ComputeError::Transport(format!("解析响应失败: {e}")))
    }
}

#[async_trait]
impl ComputeClient for RestComputeClient {
    async fn get_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> ComputeResult<Instance> {
        let url = format!("{}/instances/{}", self.zone_url(project, zone), name);
        self.send(self.http.get(url), &format!("instances/{name}"))
            .await
    }

    async fn insert_instance(
        &self,
        project: &str,
        zone: &str,
        instance: &Instance,
    ) -> ComputeResult<Operation> {
        let url = format!("{}/instances", self.zone_url(project, zone));
        self.send(self.http.post(url).json(instance), &format!("zones/{zone}"))
            .await
    }

    async fn delete_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> ComputeResult<Operation> {
        let url = format!("{}/instances/{}", self.zone_url(project, zone), name);
        self.send(self.http.delete(url), &format!("instances/{name}"))
            .await
    }

    async fn get_zone_operation(
        &self,
        project: &str,
        zone: &str,
        operation: &str,
    ) -> ComputeResult<Operation> {
        let url = format!("{}/operations/{}", self.zone_url(project, zone), operation);
        self.send(self.http.get(url), &format!("operations/{operation}"))
            .await
    }
}
