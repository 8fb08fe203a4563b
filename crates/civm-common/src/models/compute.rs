//! 计算引擎数据模型
//!
//! Compute Engine v1 REST 接口中实例与区域操作的 JSON 表示，只包含
//! 本项目读写的字段。

use serde::{Deserialize, Serialize};

/// 计算实例
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub machine_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,

    #[serde(default)]
    pub can_ip_forward: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_interfaces: Vec<NetworkInterface>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<AttachedDisk>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,

    /// 实例运行状态，例如 RUNNING
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl Instance {
    /// 第一块网卡上的外部 NAT 地址
    pub fn external_ip(&self) -> Option<&str> {
        self.network_interfaces
            .first()?
            .access_configs
            .first()?
            .nat_ip
            .as_deref()
    }
}

/// 实例元数据
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Metadata {
    #[serde(default)]
    pub items: Vec<MetadataItem>,
}

/// 元数据条目
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MetadataItem {
    pub key: String,
    pub value: String,
}

/// 网卡
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_configs: Vec<AccessConfig>,
}

/// 外部访问配置
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccessConfig {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub access_type: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(rename = "natIP", default, skip_serializing_if = "Option::is_none")]
    pub nat_ip: Option<String>,
}

/// 挂载到实例的磁盘
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttachedDisk {
    #[serde(default)]
    pub auto_delete: bool,

    #[serde(default)]
    pub boot: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialize_params: Option<AttachedDiskInitializeParams>,
}

/// 磁盘初始化参数
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttachedDiskInitializeParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_image: Option<String>,

    #[serde(default)]
    pub disk_size_gb: i64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub disk_type: String,
}

/// 区域异步操作
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub name: String,

    /// 区域 URL，末段为区域名
    #[serde(default)]
    pub zone: String,

    #[serde(default)]
    pub operation_type: String,

    #[serde(default)]
    pub status: OperationStatus,

    #[serde(default)]
    pub progress: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
}

/// 操作状态
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    #[default]
    Pending,
    Running,
    Done,
    #[serde(other)]
    Unknown,
}

/// 操作错误列表
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct OperationError {
    #[serde(default)]
    pub errors: Vec<OperationErrorItem>,
}

/// 单条操作错误
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct OperationErrorItem {
    #[serde(default)]
    pub code: String,

    #[serde(default)]
    pub message: String,
}

impl Operation {
    pub fn is_done(&self) -> bool {
        self.status == OperationStatus::Done
    }

    /// 操作携带的全部错误信息，没有错误时为空
    pub fn error_messages(&self) -> Vec<&str> {
        self.error
            .iter()
            .flat_map(|e| e.errors.iter())
            .map(|e| e.message.as_str())
            .collect()
    }

    /// 区域名（zone URL 的最后一段）
    pub fn zone_name(&self) -> &str {
        self.zone.rsplit('/').next().unwrap_or_default()
    }
}
