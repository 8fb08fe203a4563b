//! 错误处理模块
//!
//! 该模块提供项目的统一错误处理机制。计算引擎返回的"资源不存在"被单独建模为
//! [`ComputeError::NotFound`]，集群写入的乐观并发冲突被建模为 [`Error::Conflict`]，
//! 调用方据此区分可幂等重试的"缺席"与真正的故障。

use std::io;
use std::time::Duration;
use thiserror::Error;

/// 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// Kubernetes API 错误
    #[error("Kubernetes API 错误: {0}")]
    Kube(#[source] kube::Error),

    /// 资源版本冲突（并发修改）
    #[error("资源版本冲突: {0}")]
    Conflict(String),

    /// 计算引擎调用错误
    #[error("计算引擎错误: {0}")]
    Compute(#[from] ComputeError),

    /// 异步操作以错误结束
    #[error("操作失败: {0}")]
    OperationFailed(String),

    /// 异步操作轮询超时
    #[error("操作 {operation} 在 {elapsed:?} 后超时")]
    OperationTimeout {
        /// 操作名称
        operation: String,
        /// 已等待时长
        elapsed: Duration,
    },

    /// 凭据生成或下发错误
    #[error("凭据错误: {0}")]
    Credential(String),

    /// 资源键格式错误
    #[error("无效的资源键: {0}")]
    InvalidKey(String),

    /// 序列化/反序列化错误
    #[error("序列化/反序列化错误: {0}")]
    Serialization(String),

    /// I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] io::Error),

    /// JSON 错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// 是否为乐观并发冲突
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 409 => Error::Conflict(resp.message),
            other => Error::Kube(other),
        }
    }
}

/// 计算引擎调用错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComputeError {
    /// 资源不存在（HTTP 404）
    #[error("资源不存在: {0}")]
    NotFound(String),

    /// API 返回的其他错误
    #[error("API 错误 ({code}): {message}")]
    Api {
        /// HTTP 状态码
        code: u16,
        /// 错误信息
        message: String,
    },

    /// 网络传输错误
    #[error("传输错误: {0}")]
    Transport(String),

    /// 访问令牌获取失败
    #[error("认证错误: {0}")]
    Auth(String),
}

impl ComputeError {
    /// 是否为结构化的"资源不存在"
    pub fn is_not_found(&self) -> bool {
        matches!(self, ComputeError::NotFound(_))
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, Error>;
