//! 配置管理模块
//!
//! 该模块负责加载 Operator 的配置文件，支持 YAML/JSON 格式，并允许通过
//! `CIVM__` 前缀的环境变量覆盖单个字段（例如 `CIVM__ZONE`）。

use anyhow::{anyhow, Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Operator 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorConfig {
    /// 云项目 ID
    pub project: String,
    /// 实例所在区域，例如 us-east1-b
    pub zone: String,
    /// 异步操作轮询配置
    #[serde(default)]
    pub operation: OperationConfig,
    /// SSH 凭据配置
    #[serde(default)]
    pub ssh: SshConfig,
    /// 工作队列配置
    #[serde(default)]
    pub queue: QueueConfig,
    /// 计算引擎客户端配置
    #[serde(default)]
    pub compute: ComputeConfig,
}

/// 异步操作轮询配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationConfig {
    /// 轮询间隔（秒）
    pub poll_interval_seconds: u64,
    /// 总超时（秒）
    pub timeout_seconds: u64,
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 5,
            timeout_seconds: 600,
        }
    }
}

impl OperationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// SSH 凭据配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// 实例上的管理账号
    pub user: String,
    /// RSA 密钥长度
    pub key_bits: usize,
    /// 写入 Secret 后是否验证 SSH 连通性
    pub verify_connectivity: bool,
    /// 连通性检查的最大尝试次数
    pub retries: u32,
    /// 两次尝试之间的间隔（秒）
    pub delay_seconds: u64,
    /// 单次尝试的超时（秒）
    pub timeout_seconds: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            key_bits: 4096,
            verify_connectivity: false,
            retries: 10,
            delay_seconds: 5,
            timeout_seconds: 10,
        }
    }
}

/// 工作队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// 指数退避的初始延迟（毫秒）
    pub base_delay_millis: u64,
    /// 指数退避的最大延迟（秒）
    pub max_delay_seconds: u64,
    /// 全局令牌桶速率
    pub qps: f64,
    /// 全局令牌桶容量
    pub burst: u32,
    /// 单个资源的最大重试次数
    pub max_retries: u32,
    /// 周期性重新入队全部资源的间隔（秒），0 表示不启用
    pub resync_seconds: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_delay_millis: 5,
            max_delay_seconds: 1000,
            qps: 10.0,
            burst: 100,
            max_retries: 15,
            resync_seconds: 30,
        }
    }
}

/// 计算引擎客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    /// REST 端点
    pub endpoint: String,
    /// 固定访问令牌；为空时从元数据服务器获取
    pub access_token: Option<String>,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://compute.googleapis.com/compute/v1".to_string(),
            access_token: None,
        }
    }
}

impl OperatorConfig {
    /// 从文件加载配置
    pub fn load(config_path: &Path) -> Result<Self> {
        let config_file = config_path.to_str().ok_or_else(|| anyhow!("配置路径无效"))?;

        // 确定配置文件格式
        let format = match config_path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => FileFormat::Yaml,
            Some("json") => FileFormat::Json,
            _ => return Err(anyhow!("不支持的配置文件格式，仅支持 YAML 或 JSON")),
        };

        let config = Config::builder()
            .add_source(File::with_name(config_file).format(format))
            .add_source(Environment::with_prefix("CIVM").separator("__"))
            .build()
            .context("构建配置失败")?;

        let operator_config = config
            .try_deserialize::<OperatorConfig>()
            .context("配置格式错误")?;
        operator_config.validate()?;

        debug!("从 {} 加载配置成功", config_file);
        Ok(operator_config)
    }

    /// 校验必填字段
    pub fn validate(&self) -> Result<()> {
        if self.project.trim().is_empty() {
            return Err(anyhow!("project 不能为空"));
        }
        if self.zone.trim().is_empty() {
            return Err(anyhow!("zone 不能为空"));
        }
        if self.operation.poll_interval_seconds == 0 {
            return Err(anyhow!("operation.poll_interval_seconds 必须大于 0"));
        }
        Ok(())
    }
}
