//! civm-admission 可执行程序

use anyhow::{anyhow, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use civm_admission::server;

/// VirtualMachine 准入 Webhook
#[derive(Parser, Debug)]
#[command(name = "civm-admission", version, about, long_about = None)]
struct Cli {
    /// x509 证书文件（如有 CA 证书，拼接在服务证书之后）
    #[arg(long)]
    tls_cert_file: PathBuf,

    /// 与证书匹配的 x509 私钥文件
    #[arg(long)]
    tls_private_key_file: PathBuf,

    /// 日志级别，RUST_LOG 优先
    #[arg(long, default_value = "debug")]
    log_level: String,

    /// 监听地址
    #[arg(long, default_value = "0.0.0.0:8443")]
    listen_addr: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&cli.log_level))?;
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow!("初始化日志失败: {}", e))?;

    info!("启动 VirtualMachine 准入 Webhook");
    server::serve(
        cli.listen_addr,
        &cli.tls_cert_file,
        &cli.tls_private_key_file,
        shutdown_signal(),
    )
    .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("监听 Ctrl-C 失败: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("监听 SIGTERM 失败: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("收到关闭信号");
}
