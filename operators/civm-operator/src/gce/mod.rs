//! 计算实例编排模块
//!
//! [`GceOrchestrator`] 把一个 VirtualMachine 资源落地为一台计算实例：查询实例是否
//! 已存在、生成 SSH 凭据、创建实例并等待操作完成、读取外部地址、写入凭据 Secret。
//! 删除时反向执行，实例已不存在视为成功。

pub mod client;
pub mod operation;

use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

use civm_common::{
    AccessConfig, AttachedDisk, AttachedDiskInitializeParams, DiskSpec, Error, Instance, Metadata,
    MetadataItem, NetworkInterface, Operation, ProcessingPhase, Result, SecretReference,
    VirtualMachine, VirtualMachineStatus,
};

use crate::cluster::ClusterClient;
use crate::config::OperatorConfig;
use crate::credentials::{self, SshKeypair};
use crate::metrics::MetricsSink;
use client::ComputeClient;

/// 创建后写入的实例信息
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionedInstance {
    /// 云实例的 selfLink
    pub self_link: Option<String>,
    /// 外部 NAT 地址
    pub address: String,
    /// 凭据 Secret
    pub secret: SecretReference,
}

/// ensure 的结果
#[derive(Debug, Clone, PartialEq)]
pub enum EnsureOutcome {
    /// 同名实例已存在，未做任何修改
    AlreadyExists,
    /// 新建了实例
    Created(ProvisionedInstance),
}

/// 实例生命周期接口
#[async_trait]
pub trait InstanceLifecycle: Send + Sync {
    /// 确保资源对应的实例存在
    async fn ensure(&self, vm: &VirtualMachine) -> Result<EnsureOutcome>;
    /// 确保资源对应的实例不存在
    async fn teardown(&self, vm: &VirtualMachine) -> Result<()>;
}

/// 基于计算引擎的实例编排器
pub struct GceOrchestrator {
    config: OperatorConfig,
    compute: Arc<dyn ComputeClient>,
    cluster: Arc<dyn ClusterClient>,
    metrics: Arc<dyn MetricsSink>,
}

impl GceOrchestrator {
    pub fn new(
        config: OperatorConfig,
        compute: Arc<dyn ComputeClient>,
        cluster: Arc<dyn ClusterClient>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            config,
            compute,
            cluster,
            metrics,
        }
    }

    /// 查询实例：存在、不存在或查询失败三种结果互不混淆
    async fn lookup(&self, name: &str) -> Result<Option<Instance>> {
        match self
            .compute
            .get_instance(&self.config.project, &self.config.zone, name)
            .await
        {
            Ok(instance) => Ok(Some(instance)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn wait(&self, operation: Operation) -> Result<Operation> {
        let operation_type = operation.operation_type.clone();
        let started = Instant::now();
        let result = operation::wait_for_operation(
            self.compute.as_ref(),
            &self.config.project,
            operation,
            self.config.operation.poll_interval(),
            self.config.operation.timeout(),
        )
        .await;
        self.metrics
            .operation_waited(&operation_type, started.elapsed());
        result
    }

    /// 记录 provisioning 状态，失败只告警
    async fn mark_provisioning(&self, vm: &VirtualMachine) {
        let namespace = vm.namespace().unwrap_or_else(|| "default".to_string());
        let status =
            VirtualMachineStatus::with_phase(ProcessingPhase::Provisioning, "正在创建计算实例");
        if let Err(e) = self
            .cluster
            .patch_virtual_machine_status(&namespace, &vm.name_any(), &status)
            .await
        {
            warn!("更新虚拟机 {} 状态失败: {}", vm.key(), e);
        }
    }

    /// 根据资源规范构造实例请求
    pub fn build_instance(&self, vm: &VirtualMachine, keypair: &SshKeypair) -> Instance {
        let project = &self.config.project;
        let zone = &self.config.zone;
        let disk_type = |disk: &DiskSpec| {
            format!("projects/{}/zones/{}/diskTypes/{}", project, zone, disk.disk_type)
        };

        let boot = &vm.spec.boot_disk;
        let mut disks = vec![AttachedDisk {
            auto_delete: true,
            boot: true,
            initialize_params: Some(AttachedDiskInitializeParams {
                source_image: Some(boot.image_family.clone()),
                disk_size_gb: boot.disk.size_gb,
                disk_type: disk_type(&boot.disk),
            }),
        }];
        disks.extend(vm.spec.disks.iter().map(|disk| AttachedDisk {
            auto_delete: true,
            boot: false,
            initialize_params: Some(AttachedDiskInitializeParams {
                source_image: None,
                disk_size_gb: disk.size_gb,
                disk_type: disk_type(disk),
            }),
        }));

        Instance {
            name: vm.name_any(),
            machine_type: format!("zones/{}/machineTypes/{}", zone, vm.spec.machine_type),
            metadata: Some(Metadata {
                items: vec![MetadataItem {
                    key: "ssh-keys".to_string(),
                    value: keypair.metadata_entry(&self.config.ssh.user),
                }],
            }),
            can_ip_forward: true,
            network_interfaces: vec![NetworkInterface {
                network: "global/networks/default".to_string(),
                access_configs: vec![AccessConfig {
                    access_type: "ONE_TO_ONE_NAT".to_string(),
                    name: "External NAT".to_string(),
                    nat_ip: None,
                }],
            }],
            disks,
            ..Default::default()
        }
    }
}

#[async_trait]
impl InstanceLifecycle for GceOrchestrator {
    async fn ensure(&self, vm: &VirtualMachine) -> Result<EnsureOutcome> {
        let name = vm.name_any();
        if self.lookup(&name).await?.is_some() {
            info!("跳过创建：计算实例 {} 已存在", name);
            return Ok(EnsureOutcome::AlreadyExists);
        }

        self.mark_provisioning(vm).await;

        info!("为虚拟机 {} 生成 SSH 密钥对", vm.key());
        let keypair = credentials::generate_keypair_blocking(self.config.ssh.key_bits).await?;

        info!("创建计算实例 {}", name);
        let instance = self.build_instance(vm, &keypair);
        let operation = self
            .compute
            .insert_instance(&self.config.project, &self.config.zone, &instance)
            .await?;
        self.wait(operation).await?;

        let created = self.lookup(&name).await?.ok_or_else(|| {
            Error::OperationFailed(format!("计算实例 {name} 创建完成后无法查询到"))
        })?;
        let address = created
            .external_ip()
            .ok_or_else(|| Error::OperationFailed(format!("计算实例 {name} 没有外部地址")))?
            .to_string();
        info!("计算实例 {} 创建完成，外部地址 {}", name, address);

        let secret = credentials::credential_secret(vm, &address, &self.config.ssh.user, &keypair)?;
        self.cluster.create_secret(&secret).await?;
        let secret = credentials::secret_reference(&secret);
        info!("凭据已写入 Secret {}/{}", secret.namespace, secret.name);

        if self.config.ssh.verify_connectivity {
            if let Err(e) =
                credentials::poll_for_ssh_connection(&self.config.ssh, &address, &keypair).await
            {
                warn!("计算实例 {} 的 SSH 连通性检查失败: {}", name, e);
            }
        }

        Ok(EnsureOutcome::Created(ProvisionedInstance {
            self_link: created.self_link,
            address,
            secret,
        }))
    }

    async fn teardown(&self, vm: &VirtualMachine) -> Result<()> {
        let name = vm.name_any();
        if self.lookup(&name).await?.is_none() {
            info!("计算实例 {} 不存在，无需删除", name);
            return Ok(());
        }

        info!("删除计算实例 {}", name);
        let operation = match self
            .compute
            .delete_instance(&self.config.project, &self.config.zone, &name)
            .await
        {
            Ok(operation) => operation,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        self.wait(operation).await?;
        info!("计算实例 {} 已删除", name);
        Ok(())
    }
}
