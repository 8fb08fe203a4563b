//! 协调逻辑模块
//!
//! 根据资源的两个事实决定动作：是否已请求删除、是否带有删除 finalizer。
//!
//! | 已请求删除 | 有 finalizer | 动作 |
//! |---|---|---|
//! | 否 | - | 确保实例存在 |
//! | 是 | 否 | 无需处理 |
//! | 是 | 是 | 删除实例后移除 finalizer |

use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use civm_common::{
    split_key, Error, ProcessingPhase, Result, VirtualMachine, VirtualMachineStatus,
};

use crate::cluster::ClusterClient;
use crate::gce::{EnsureOutcome, InstanceLifecycle};

/// 移除 finalizer 时遇到冲突的最大重试次数
const FINALIZER_UPDATE_ATTEMPTS: usize = 5;

/// 按资源键执行一次协调
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    async fn reconcile(&self, key: &str) -> Result<()>;
}

/// VirtualMachine 协调器
pub struct Reconciler {
    cluster: Arc<dyn ClusterClient>,
    lifecycle: Arc<dyn InstanceLifecycle>,
}

impl Reconciler {
    /// 创建新的协调器
    pub fn new(cluster: Arc<dyn ClusterClient>, lifecycle: Arc<dyn InstanceLifecycle>) -> Self {
        Self { cluster, lifecycle }
    }

    /// 确保实例存在；实例与凭据都已创建后，status 写入失败只告警
    async fn provision(&self, namespace: &str, vm: &VirtualMachine) -> Result<()> {
        match self.lifecycle.ensure(vm).await {
            Ok(EnsureOutcome::AlreadyExists) => Ok(()),
            Ok(EnsureOutcome::Created(created)) => {
                let mut status = VirtualMachineStatus::with_phase(
                    ProcessingPhase::Provisioned,
                    format!("计算实例已就绪，外部地址 {}", created.address),
                );
                status.self_link = created.self_link;
                status.secret_ref = Some(created.secret);
                if let Err(e) = self
                    .cluster
                    .patch_virtual_machine_status(namespace, &vm.name_any(), &status)
                    .await
                {
                    warn!("记录虚拟机 {} 的就绪状态失败: {}", vm.key(), e);
                }
                Ok(())
            }
            Err(e) => {
                self.record_error(namespace, vm, &e).await;
                Err(e)
            }
        }
    }

    async fn finalize(&self, namespace: &str, vm: VirtualMachine) -> Result<()> {
        if !vm.has_finalizer() {
            debug!("虚拟机 {} 已完成清理", vm.key());
            return Ok(());
        }

        if let Err(e) = self.lifecycle.teardown(&vm).await {
            self.record_error(namespace, &vm, &e).await;
            return Err(e);
        }

        self.remove_finalizer(namespace, vm).await
    }

    /// 移除 finalizer；遇到并发修改时重新读取最新版本再试
    async fn remove_finalizer(&self, namespace: &str, mut vm: VirtualMachine) -> Result<()> {
        let name = vm.name_any();
        for _ in 0..FINALIZER_UPDATE_ATTEMPTS {
            if !vm.remove_finalizer() {
                return Ok(());
            }

            match self.cluster.replace_virtual_machine(&vm).await {
                Ok(_) => {
                    info!("已移除虚拟机 {}/{} 的 finalizer", namespace, name);
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    debug!("虚拟机 {}/{} 已被修改，重新读取后重试", namespace, name);
                    match self.cluster.get_virtual_machine(namespace, &name).await? {
                        Some(latest) => vm = latest,
                        None => return Ok(()),
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Conflict(format!(
            "移除虚拟机 {namespace}/{name} 的 finalizer 时持续冲突"
        )))
    }

    /// 把失败信息写入 status，写入失败只告警
    async fn record_error(&self, namespace: &str, vm: &VirtualMachine, err: &Error) {
        let status = VirtualMachineStatus::with_phase(ProcessingPhase::Error, err.to_string());
        if let Err(e) = self
            .cluster
            .patch_virtual_machine_status(namespace, &vm.name_any(), &status)
            .await
        {
            warn!("记录虚拟机 {} 的错误状态失败: {}", vm.key(), e);
        }
    }
}

#[async_trait]
impl Reconcile for Reconciler {
    async fn reconcile(&self, key: &str) -> Result<()> {
        let (namespace, name) = split_key(key)?;
        let namespace = namespace.unwrap_or("default");

        let Some(vm) = self.cluster.get_virtual_machine(namespace, name).await? else {
            debug!("虚拟机 {} 已不存在", key);
            return Ok(());
        };

        if vm.deletion_requested() {
            self.finalize(namespace, vm).await
        } else {
            self.provision(namespace, &vm).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gce::client::MockComputeClient;
    use crate::gce::{GceOrchestrator, ProvisionedInstance};
    use crate::metrics::NoopMetrics;
    use crate::testing::{sample_vm, test_config, FakeCluster};
    use civm_common::{
        AccessConfig, ComputeError, Instance, NetworkInterface, Operation, OperationStatus,
        SecretReference, VIRTUAL_MACHINE_FINALIZER,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// 记录调用次数并返回预设结果的生命周期实现
    #[derive(Default)]
    struct FakeLifecycle {
        ensure_calls: AtomicUsize,
        teardown_calls: AtomicUsize,
        ensure_result: Mutex<Option<Result<EnsureOutcome>>>,
        teardown_error: Mutex<Option<Error>>,
    }

    #[async_trait]
    impl InstanceLifecycle for FakeLifecycle {
        async fn ensure(&self, _vm: &VirtualMachine) -> Result<EnsureOutcome> {
            self.ensure_calls.fetch_add(1, Ordering::SeqCst);
            self.ensure_result
                .lock()
                .unwrap()
                .take()
                .unwrap_or(Ok(EnsureOutcome::AlreadyExists))
        }

        async fn teardown(&self, _vm: &VirtualMachine) -> Result<()> {
            self.teardown_calls.fetch_add(1, Ordering::SeqCst);
            match self.teardown_error.lock().unwrap().take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    fn deleting_vm(with_finalizer: bool) -> VirtualMachine {
        let mut vm = sample_vm("ci", "vm-1");
        vm.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        if with_finalizer {
            vm.metadata.finalizers =
                Some(vec!["other.io/keep".into(), VIRTUAL_MACHINE_FINALIZER.into()]);
        }
        vm
    }

    fn setup(vm: VirtualMachine) -> (Arc<FakeCluster>, Arc<FakeLifecycle>, Reconciler) {
        let cluster = Arc::new(FakeCluster::default());
        cluster.insert(vm);
        let lifecycle = Arc::new(FakeLifecycle::default());
        let reconciler = Reconciler::new(cluster.clone(), lifecycle.clone());
        (cluster, lifecycle, reconciler)
    }

    #[tokio::test]
    async fn test_missing_resource_is_ignored() {
        let (_, lifecycle, reconciler) = setup(sample_vm("ci", "vm-1"));
        reconciler.reconcile("ci/vm-2").await.unwrap();
        assert_eq!(lifecycle.ensure_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_key_is_error() {
        let (_, _, reconciler) = setup(sample_vm("ci", "vm-1"));
        let err = reconciler.reconcile("a/b/c").await.unwrap_err();
        assert!(matches!(err, Error::InvalidKey(_)));
    }

    #[tokio::test]
    async fn test_created_instance_is_recorded_in_status() {
        let (cluster, lifecycle, reconciler) = setup(sample_vm("ci", "vm-1"));
        *lifecycle.ensure_result.lock().unwrap() =
            Some(Ok(EnsureOutcome::Created(ProvisionedInstance {
                self_link: Some("link/vm-1".into()),
                address: "10.0.0.5".into(),
                secret: SecretReference { name: "vm-1".into(), namespace: "ci".into() },
            })));

        reconciler.reconcile("ci/vm-1").await.unwrap();

        let status = cluster.status("ci", "vm-1").unwrap();
        assert_eq!(status.state.processing_phase, ProcessingPhase::Provisioned);
        assert_eq!(status.self_link.as_deref(), Some("link/vm-1"));
        assert_eq!(status.secret_ref.unwrap().name, "vm-1");
    }

    #[tokio::test]
    async fn test_status_write_failure_after_create_is_not_retried() {
        let (cluster, lifecycle, reconciler) = setup(sample_vm("ci", "vm-1"));
        *lifecycle.ensure_result.lock().unwrap() =
            Some(Ok(EnsureOutcome::Created(ProvisionedInstance {
                self_link: Some("link/vm-1".into()),
                address: "10.0.0.5".into(),
                secret: SecretReference { name: "vm-1".into(), namespace: "ci".into() },
            })));
        cluster.fail_next_status_patches(1);

        reconciler.reconcile("ci/vm-1").await.unwrap();
        assert_eq!(lifecycle.ensure_calls.load(Ordering::SeqCst), 1);
        assert!(cluster.status("ci", "vm-1").is_none());
    }

    #[tokio::test]
    async fn test_existing_instance_leaves_status_untouched() {
        let (cluster, lifecycle, reconciler) = setup(sample_vm("ci", "vm-1"));
        reconciler.reconcile("ci/vm-1").await.unwrap();
        assert_eq!(lifecycle.ensure_calls.load(Ordering::SeqCst), 1);
        assert!(cluster.status("ci", "vm-1").is_none());
    }

    #[tokio::test]
    async fn test_ensure_failure_is_recorded_and_propagated() {
        let (cluster, lifecycle, reconciler) = setup(sample_vm("ci", "vm-1"));
        *lifecycle.ensure_result.lock().unwrap() =
            Some(Err(Error::OperationFailed("quota exceeded".into())));

        let err = reconciler.reconcile("ci/vm-1").await.unwrap_err();
        assert!(matches!(err, Error::OperationFailed(_)));

        let status = cluster.status("ci", "vm-1").unwrap();
        assert_eq!(status.state.processing_phase, ProcessingPhase::Error);
        assert!(status.state.message.contains("quota exceeded"));
    }

    #[tokio::test]
    async fn test_deleted_without_finalizer_is_noop() {
        let (cluster, lifecycle, reconciler) = setup(deleting_vm(false));
        reconciler.reconcile("ci/vm-1").await.unwrap();
        assert_eq!(lifecycle.teardown_calls.load(Ordering::SeqCst), 0);
        assert_eq!(lifecycle.ensure_calls.load(Ordering::SeqCst), 0);
        assert_eq!(cluster.replace_calls(), 0);
    }

    #[tokio::test]
    async fn test_teardown_then_finalizer_removed() {
        let (cluster, lifecycle, reconciler) = setup(deleting_vm(true));
        reconciler.reconcile("ci/vm-1").await.unwrap();

        assert_eq!(lifecycle.teardown_calls.load(Ordering::SeqCst), 1);
        let vm = cluster.get("ci", "vm-1").unwrap();
        assert!(!vm.has_finalizer());
        assert_eq!(vm.finalizers(), &["other.io/keep".to_string()]);
    }

    #[tokio::test]
    async fn test_teardown_failure_keeps_finalizer() {
        let (cluster, lifecycle, reconciler) = setup(deleting_vm(true));
        *lifecycle.teardown_error.lock().unwrap() =
            Some(Error::Compute(ComputeError::Transport("connection reset".into())));

        assert!(reconciler.reconcile("ci/vm-1").await.is_err());
        assert!(cluster.get("ci", "vm-1").unwrap().has_finalizer());
        assert_eq!(cluster.replace_calls(), 0);
        assert_eq!(
            cluster.status("ci", "vm-1").unwrap().state.processing_phase,
            ProcessingPhase::Error
        );
    }

    #[tokio::test]
    async fn test_finalizer_removal_retries_on_conflict() {
        let (cluster, _, reconciler) = setup(deleting_vm(true));
        cluster.fail_next_replaces(2);

        reconciler.reconcile("ci/vm-1").await.unwrap();
        assert_eq!(cluster.replace_calls(), 3);
        assert!(!cluster.get("ci", "vm-1").unwrap().has_finalizer());
    }

    #[tokio::test]
    async fn test_finalizer_removal_gives_up_after_repeated_conflicts() {
        let (cluster, _, reconciler) = setup(deleting_vm(true));
        cluster.fail_next_replaces(FINALIZER_UPDATE_ATTEMPTS + 1);

        let err = reconciler.reconcile("ci/vm-1").await.unwrap_err();
        assert!(err.is_conflict());
        assert!(cluster.get("ci", "vm-1").unwrap().has_finalizer());
    }

    fn done_op(operation_type: &str) -> Operation {
        Operation {
            name: format!("{operation_type}-op"),
            zone: "projects/p/zones/us-east1-b".into(),
            operation_type: operation_type.into(),
            status: OperationStatus::Done,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_provision_vm_end_to_end() {
        let mut compute = MockComputeClient::new();
        let mut seq = mockall::Sequence::new();
        compute
            .expect_get_instance()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, name| Err(ComputeError::NotFound(name.to_string())));
        compute
            .expect_insert_instance()
            .withf(|_, _, instance: &Instance| {
                instance.disks.len() == 1
                    && instance.disks[0].boot
                    && instance.disks[0]
                        .initialize_params
                        .as_ref()
                        .map_or(false, |p| p.disk_size_gb == 20)
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(done_op("insert")));
        compute
            .expect_get_instance()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, name| {
                Ok(Instance {
                    name: name.to_string(),
                    network_interfaces: vec![NetworkInterface {
                        network: "global/networks/default".into(),
                        access_configs: vec![AccessConfig {
                            nat_ip: Some("10.0.0.5".into()),
                            ..Default::default()
                        }],
                    }],
                    ..Default::default()
                })
            });

        let cluster = Arc::new(FakeCluster::default());
        cluster.insert(sample_vm("ci", "vm-1"));
        let orchestrator = GceOrchestrator::new(
            test_config(),
            Arc::new(compute),
            cluster.clone(),
            Arc::new(NoopMetrics),
        );
        let reconciler = Reconciler::new(cluster.clone(), Arc::new(orchestrator));

        reconciler.reconcile("ci/vm-1").await.unwrap();

        let secret = cluster.secret("ci", "vm-1").unwrap();
        let data = secret.string_data.unwrap();
        assert_eq!(data.len(), 3);
        assert!(data["ssh_config"].contains("HostName 10.0.0.5"));
        let status = cluster.status("ci", "vm-1").unwrap();
        assert_eq!(status.state.processing_phase, ProcessingPhase::Provisioned);
    }

    #[tokio::test]
    async fn test_delete_vm_with_instance_already_gone() {
        let mut compute = MockComputeClient::new();
        compute
            .expect_get_instance()
            .returning(|_, _, name| Err(ComputeError::NotFound(name.to_string())));
        compute.expect_delete_instance().never();

        let cluster = Arc::new(FakeCluster::default());
        cluster.insert(deleting_vm(true));
        let orchestrator = GceOrchestrator::new(
            test_config(),
            Arc::new(compute),
            cluster.clone(),
            Arc::new(NoopMetrics),
        );
        let reconciler = Reconciler::new(cluster.clone(), Arc::new(orchestrator));

        reconciler.reconcile("ci/vm-1").await.unwrap();
        assert!(!cluster.get("ci", "vm-1").unwrap().has_finalizer());
    }
}
