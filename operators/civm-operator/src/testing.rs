//! 测试用的内存集群与样例数据

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use civm_common::{
    object_key, BootDiskSpec, DiskSpec, Error, Result, VirtualMachine, VirtualMachineSpec,
    VirtualMachineStatus,
};

use crate::cluster::ClusterClient;
use crate::config::{OperatorConfig, SshConfig};

pub fn test_config() -> OperatorConfig {
    OperatorConfig {
        project: "p".into(),
        zone: "us-east1-b".into(),
        operation: Default::default(),
        ssh: SshConfig {
            key_bits: 1024,
            ..Default::default()
        },
        queue: Default::default(),
        compute: Default::default(),
    }
}

pub fn sample_vm(namespace: &str, name: &str) -> VirtualMachine {
    let mut vm = VirtualMachine::new(
        name,
        VirtualMachineSpec {
            machine_type: "n1-standard-1".into(),
            boot_disk: BootDiskSpec {
                image_family: "projects/p/global/images/family/ci".into(),
                disk: DiskSpec {
                    size_gb: 20,
                    disk_type: "pd-standard".into(),
                },
            },
            disks: vec![],
        },
    );
    vm.metadata.namespace = Some(namespace.into());
    vm.metadata.uid = Some(format!("uid-{name}"));
    vm.metadata.resource_version = Some("1".into());
    vm
}

/// 内存中的集群
#[derive(Default)]
pub struct FakeCluster {
    vms: Mutex<HashMap<String, VirtualMachine>>,
    secrets: Mutex<HashMap<String, Secret>>,
    /// 接下来若干次 replace 返回冲突
    conflicts: AtomicUsize,
    replaces: AtomicUsize,
    /// 接下来若干次 status 写入失败
    status_failures: AtomicUsize,
}

impl FakeCluster {
    pub fn insert(&self, vm: VirtualMachine) {
        self.vms.lock().unwrap().insert(vm.key(), vm);
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<VirtualMachine> {
        self.vms
            .lock()
            .unwrap()
            .get(&object_key(Some(namespace), name))
            .cloned()
    }

    pub fn status(&self, namespace: &str, name: &str) -> Option<VirtualMachineStatus> {
        self.get(namespace, name).and_then(|vm| vm.status)
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.secrets
            .lock()
            .unwrap()
            .get(&object_key(Some(namespace), name))
            .cloned()
    }

    pub fn fail_next_replaces(&self, count: usize) {
        self.conflicts.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_status_patches(&self, count: usize) {
        self.status_failures.store(count, Ordering::SeqCst);
    }

    pub fn replace_calls(&self) -> usize {
        self.replaces.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_virtual_machine(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachine>> {
        Ok(self.get(namespace, name))
    }

    async fn replace_virtual_machine(&self, vm: &VirtualMachine) -> Result<VirtualMachine> {
        self.replaces.fetch_add(1, Ordering::SeqCst);
        let pending = self.conflicts.load(Ordering::SeqCst);
        if pending > 0 {
            self.conflicts.store(pending - 1, Ordering::SeqCst);
            return Err(Error::Conflict("the object has been modified".into()));
        }

        let mut vms = self.vms.lock().unwrap();
        let stored = vms
            .get_mut(&vm.key())
            .ok_or_else(|| Error::Conflict(format!("{} not found", vm.key())))?;
        let version: u64 = stored
            .resource_version()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let mut updated = vm.clone();
        updated.metadata.resource_version = Some((version + 1).to_string());
        updated.status = stored.status.clone();
        *stored = updated.clone();
        Ok(updated)
    }

    async fn patch_virtual_machine_status(
        &self,
        namespace: &str,
        name: &str,
        status: &VirtualMachineStatus,
    ) -> Result<()> {
        let pending = self.status_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.status_failures.store(pending - 1, Ordering::SeqCst);
            return Err(Error::Config("status update rejected".into()));
        }

        let mut vms = self.vms.lock().unwrap();
        let stored = vms
            .get_mut(&object_key(Some(namespace), name))
            .ok_or_else(|| Error::Config(format!("{namespace}/{name} not found")))?;
        stored.status = Some(status.clone());
        Ok(())
    }

    async fn create_secret(&self, secret: &Secret) -> Result<()> {
        let key = object_key(secret.namespace().as_deref(), &secret.name_any());
        self.secrets.lock().unwrap().insert(key, secret.clone());
        Ok(())
    }
}
