//! SSH 凭据模块
//!
//! 负责为新实例生成 RSA 密钥对、构造保存凭据的 Secret，以及可选的 SSH 连通性检查。

use k8s_openapi::api::core::v1::Secret;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use rand::rngs::OsRng;
use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use ssh_key::public::{KeyData, RsaPublicKey};
use ssh_key::PublicKey;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info};

use civm_common::{Error, Result, SecretReference, VirtualMachine};

use crate::config::SshConfig;

/// Secret 中的私钥字段
pub const PRIVATE_KEY_FIELD: &str = "id_rsa";
/// Secret 中的公钥字段
pub const PUBLIC_KEY_FIELD: &str = "id_rsa.pub";
/// Secret 中的 ssh_config 字段
pub const SSH_CONFIG_FIELD: &str = "ssh_config";

/// RSA 密钥对
#[derive(Clone)]
pub struct SshKeypair {
    /// PKCS#1 PEM 编码的私钥
    private_pem: String,
    /// authorized_keys 格式的公钥，以换行结尾
    public_key: String,
}

impl fmt::Debug for SshKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshKeypair")
            .field("private_pem", &"<redacted>")
            .field("public_key", &self.public_key.trim_end())
            .finish()
    }
}

impl SshKeypair {
    pub fn private_pem(&self) -> &str {
        &self.private_pem
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// 实例元数据 `ssh-keys` 的取值：`<user>:<公钥> <user>`
    pub fn metadata_entry(&self, user: &str) -> String {
        format!("{}:{} {}", user, self.public_key.trim_end(), user)
    }
}

/// 生成 RSA 密钥对
pub fn generate_keypair(bits: usize) -> Result<SshKeypair> {
    let private_key = RsaPrivateKey::new(&mut OsRng, bits)
        .map_err(|e| Error::Credential(format!("生成 RSA 私钥失败: {e}")))?;

    let private_pem = private_key
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| Error::Credential(format!("编码私钥失败: {e}")))?
        .to_string();

    let public = RsaPublicKey::try_from(private_key.to_public_key())
        .map_err(|e| Error::Credential(format!("转换公钥失败: {e}")))?;
    let public_key = PublicKey::from(KeyData::Rsa(public))
        .to_openssh()
        .map_err(|e| Error::Credential(format!("编码公钥失败: {e}")))?;

    Ok(SshKeypair {
        private_pem,
        public_key: format!("{public_key}\n"),
    })
}

/// 异步生成密钥对，计算在阻塞线程池中进行
pub async fn generate_keypair_blocking(bits: usize) -> Result<SshKeypair> {
    tokio::task::spawn_blocking(move || generate_keypair(bits))
        .await
        .map_err(|e| Error::Credential(format!("密钥生成任务失败: {e}")))?
}

/// 生成 ssh_config 片段
pub fn ssh_config(host: &str, address: &str, user: &str) -> String {
    format!(
        "Host {host}\n  HostName {address}\n  Port 22\n  User {user}\n  StrictHostKeyChecking no\n"
    )
}

/// 构造保存凭据的 Secret
///
/// Secret 与 VirtualMachine 同名同命名空间，并以其为 controller owner，
/// 因此会随资源一起被垃圾回收。
pub fn credential_secret(
    vm: &VirtualMachine,
    address: &str,
    user: &str,
    keypair: &SshKeypair,
) -> Result<Secret> {
    let name = vm.name_any();
    let namespace = vm.namespace().unwrap_or_else(|| "default".to_string());
    let owner = vm
        .controller_owner_ref(&())
        .ok_or_else(|| Error::Credential(format!("虚拟机 {name} 缺少 uid，无法设置 owner")))?;

    let mut data = BTreeMap::new();
    data.insert(PRIVATE_KEY_FIELD.to_string(), keypair.private_pem.clone());
    data.insert(PUBLIC_KEY_FIELD.to_string(), keypair.public_key.clone());
    data.insert(SSH_CONFIG_FIELD.to_string(), ssh_config(&name, address, user));

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        string_data: Some(data),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    })
}

/// Secret 的引用
pub fn secret_reference(secret: &Secret) -> SecretReference {
    SecretReference {
        name: secret.name_any(),
        namespace: secret.namespace().unwrap_or_default(),
    }
}

/// 反复尝试以私钥登录实例，直到成功或用尽重试次数
pub async fn poll_for_ssh_connection(
    config: &SshConfig,
    address: &str,
    keypair: &SshKeypair,
) -> Result<()> {
    let timeout = Duration::from_secs(config.timeout_seconds);
    let delay = Duration::from_secs(config.delay_seconds);
    let target = if address.contains(':') {
        address.to_string()
    } else {
        format!("{address}:22")
    };

    for attempt in 1..=config.retries {
        let target_clone = target.clone();
        let user = config.user.clone();
        let pem = keypair.private_pem.clone();
        let result =
            tokio::task::spawn_blocking(move || ssh_login(&target_clone, &user, &pem, timeout))
                .await
                .map_err(|e| Error::Credential(format!("连通性检查任务失败: {e}")))?;

        match result {
            Ok(()) => {
                info!("第 {} 次尝试通过 SSH 连接 {} 成功", attempt, target);
                return Ok(());
            }
            Err(e) => debug!("第 {} 次尝试通过 SSH 连接 {} 失败: {}", attempt, target, e),
        }

        if attempt < config.retries {
            tokio::time::sleep(delay).await;
        }
    }

    Err(Error::Credential(format!(
        "{} 次尝试后仍无法通过 SSH 连接 {}",
        config.retries, target
    )))
}

fn ssh_login(target: &str, user: &str, private_pem: &str, timeout: Duration) -> Result<()> {
    let socket_addr = target
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::Credential(format!("无法解析地址 {target}")))?;
    let tcp = TcpStream::connect_timeout(&socket_addr, timeout)?;

    let ssh_err = |e: ssh2::Error| Error::Credential(format!("SSH 错误: {e}"));
    let mut session = ssh2::Session::new().map_err(ssh_err)?;
    session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
    session.set_tcp_stream(tcp);
    session.handshake().map_err(ssh_err)?;
    session
        .userauth_pubkey_memory(user, None, private_pem, None)
        .map_err(ssh_err)?;
    if !session.authenticated() {
        return Err(Error::Credential("SSH 认证未通过".to_string()));
    }

    let _ = session.disconnect(None, "connectivity check", None);
    Ok(())
}
