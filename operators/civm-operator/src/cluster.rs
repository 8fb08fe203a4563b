//! 集群访问模块
//!
//! 协调器对 Kubernetes API 的全部读写都经过 [`ClusterClient`]，测试中以内存实现替换。

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    client::Client,
    ResourceExt,
};
use serde_json::json;
use tracing::debug;

use civm_common::{Error, Result, VirtualMachine, VirtualMachineStatus};

/// 集群读写接口
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// 读取 VirtualMachine，不存在时返回 `None`
    async fn get_virtual_machine(&self, namespace: &str, name: &str)
        -> Result<Option<VirtualMachine>>;

    /// 整体替换 VirtualMachine，resourceVersion 不一致时返回 [`Error::Conflict`]
    async fn replace_virtual_machine(&self, vm: &VirtualMachine) -> Result<VirtualMachine>;

    /// 合并更新 status 子资源
    async fn patch_virtual_machine_status(
        &self,
        namespace: &str,
        name: &str,
        status: &VirtualMachineStatus,
    ) -> Result<()>;

    /// 创建 Secret
    async fn create_secret(&self, secret: &Secret) -> Result<()>;
}

/// 基于 kube 客户端的实现
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_virtual_machine(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachine>> {
        let api: Api<VirtualMachine> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn replace_virtual_machine(&self, vm: &VirtualMachine) -> Result<VirtualMachine> {
        let namespace = vm.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<VirtualMachine> = Api::namespaced(self.client.clone(), &namespace);
        let replaced = api
            .replace(&vm.name_any(), &PostParams::default(), vm)
            .await?;
        debug!("更新虚拟机 {}/{} 成功", namespace, vm.name_any());
        Ok(replaced)
    }

    async fn patch_virtual_machine_status(
        &self,
        namespace: &str,
        name: &str,
        status: &VirtualMachineStatus,
    ) -> Result<()> {
        let api: Api<VirtualMachine> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(
            "更新虚拟机 {}/{} 状态为 {:?}",
            namespace, name, status.state.processing_phase
        );
        Ok(())
    }

    async fn create_secret(&self, secret: &Secret) -> Result<()> {
        let namespace = secret
            .namespace()
            .ok_or_else(|| Error::Credential("Secret 缺少命名空间".to_string()))?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), secret).await?;
        debug!("创建 Secret {}/{} 成功", namespace, secret.name_any());
        Ok(())
    }
}
