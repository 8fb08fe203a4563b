//! VirtualMachine 自定义资源
//!
//! 一个 VirtualMachine 资源对应云上的一台计算实例。Spec 在创建后不可修改，
//! 只有 Status 子资源会随协调过程变化。

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// 删除 finalizer，存在时集群不会真正删除资源
pub const VIRTUAL_MACHINE_FINALIZER: &str = "virtualmachines.civm.io";

/// 虚拟机规范
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(group = "civm.io", version = "v1alpha1", kind = "VirtualMachine", namespaced)]
#[kube(status = "VirtualMachineStatus")]
#[kube(printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.state.processingPhase"}"#)]
#[kube(printcolumn = r#"{"name":"Machine", "type":"string", "jsonPath":".spec.machineType"}"#)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    /// 机器规格，例如 n1-standard-1
    pub machine_type: String,

    /// 启动盘
    pub boot_disk: BootDiskSpec,

    /// 额外挂载的数据盘
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<DiskSpec>,
}

/// 启动盘定义
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BootDiskSpec {
    /// 镜像族的完整或部分路径
    pub image_family: String,

    #[serde(flatten)]
    pub disk: DiskSpec,
}

/// 磁盘初始化参数
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct DiskSpec {
    /// 容量（GB）
    #[serde(rename = "sizeGb")]
    pub size_gb: i64,

    /// 磁盘类型，例如 pd-standard、pd-ssd
    #[serde(rename = "type")]
    pub disk_type: String,
}

/// 虚拟机状态
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    /// 处理状态
    #[serde(default)]
    pub state: ProcessingState,

    /// 云实例的 selfLink
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,

    /// 保存 SSH 凭据的 Secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretReference>,
}

/// 处理状态
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingState {
    pub processing_phase: ProcessingPhase,

    /// 人类可读的状态说明
    #[serde(default)]
    pub message: String,
}

/// 处理阶段
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingPhase {
    #[default]
    Pending,
    Provisioning,
    Provisioned,
    Error,
}

/// Secret 引用
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct SecretReference {
    pub name: String,
    pub namespace: String,
}

impl VirtualMachineStatus {
    /// 构造一个仅包含阶段与消息的状态
    pub fn with_phase(phase: ProcessingPhase, message: impl Into<String>) -> Self {
        Self {
            state: ProcessingState {
                processing_phase: phase,
                message: message.into(),
            },
            ..Default::default()
        }
    }
}

impl VirtualMachine {
    /// 队列中使用的资源键（namespace/name）
    pub fn key(&self) -> String {
        object_key(self.namespace().as_deref(), &self.name_any())
    }

    /// 是否已请求删除
    pub fn deletion_requested(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// 是否带有删除 finalizer
    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == VIRTUAL_MACHINE_FINALIZER)
    }

    /// 移除删除 finalizer，返回是否发生了变化
    pub fn remove_finalizer(&mut self) -> bool {
        let Some(finalizers) = self.metadata.finalizers.as_mut() else {
            return false;
        };
        let before = finalizers.len();
        finalizers.retain(|f| f != VIRTUAL_MACHINE_FINALIZER);
        before != finalizers.len()
    }

    /// 当前处理阶段
    pub fn phase(&self) -> ProcessingPhase {
        self.status
            .as_ref()
            .map(|s| s.state.processing_phase)
            .unwrap_or_default()
    }
}

/// 由命名空间与名称生成资源键
pub fn object_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{ns}/{name}"),
        _ => name.to_string(),
    }
}

/// 将资源键拆分为命名空间与名称
pub fn split_key(key: &str) -> Result<(Option<&str>, &str)> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [name] if !name.is_empty() => Ok((None, name)),
        [ns, name] if !name.is_empty() => {
            let ns = if ns.is_empty() { None } else { Some(*ns) };
            Ok((ns, name))
        }
        _ => Err(Error::InvalidKey(key.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use rstest::rstest;

    fn sample() -> VirtualMachine {
        let mut vm = VirtualMachine::new(
            "vm-1",
            VirtualMachineSpec {
                machine_type: "small".into(),
                boot_disk: BootDiskSpec {
                    image_family: "fedora".into(),
                    disk: DiskSpec { size_gb: 20, disk_type: "standard".into() },
                },
                disks: vec![],
            },
        );
        vm.metadata.namespace = Some("ci".into());
        vm
    }

    #[test]
    fn test_spec_wire_format() {
        let vm = sample();
        let value = serde_json::to_value(&vm.spec).unwrap();
        assert_eq!(value["machineType"], "small");
        assert_eq!(value["bootDisk"]["imageFamily"], "fedora");
        assert_eq!(value["bootDisk"]["sizeGb"], 20);
        assert_eq!(value["bootDisk"]["type"], "standard");
        assert!(value.get("disks").is_none());
    }

    #[test]
    fn test_status_phase_wire_format() {
        let status = VirtualMachineStatus::with_phase(ProcessingPhase::Error, "boom");
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["state"]["processingPhase"], "error");
        assert_eq!(value["state"]["message"], "boom");
    }

    #[test]
    fn test_finalizer_helpers() {
        let mut vm = sample();
        assert!(!vm.has_finalizer());
        assert!(!vm.remove_finalizer());

        vm.metadata.finalizers = Some(vec![
            "other.io/keep".into(),
            VIRTUAL_MACHINE_FINALIZER.into(),
        ]);
        assert!(vm.has_finalizer());
        assert!(vm.remove_finalizer());
        assert_eq!(vm.finalizers(), &["other.io/keep".to_string()]);
    }

    #[test]
    fn test_deletion_requested() {
        let mut vm = sample();
        assert!(!vm.deletion_requested());
        vm.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(vm.deletion_requested());
        assert_eq!(vm.phase(), ProcessingPhase::Pending);
    }

    #[rstest]
    #[case("ci/vm-1", Some("ci"), "vm-1")]
    #[case("vm-1", None, "vm-1")]
    #[case("/vm-1", None, "vm-1")]
    fn test_split_key(#[case] key: &str, #[case] ns: Option<&str>, #[case] name: &str) {
        assert_eq!(split_key(key).unwrap(), (ns, name));
    }

    #[rstest]
    #[case("")]
    #[case("a/b/c")]
    #[case("ci/")]
    fn test_split_key_invalid(#[case] key: &str) {
        assert!(split_key(key).is_err());
    }

    #[test]
    fn test_key_round_trip() {
        let vm = sample();
        assert_eq!(vm.key(), "ci/vm-1");
        assert_eq!(object_key(None, "vm-1"), "vm-1");
    }
}
