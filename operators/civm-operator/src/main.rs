//! civm-operator 可执行程序

use anyhow::{anyhow, Result};
use clap::Parser;
use kube::CustomResourceExt;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use civm_common::VirtualMachine;
use civm_operator::config::OperatorConfig;
use civm_operator::VmOperator;

/// 将 VirtualMachine 资源协调为云上计算实例
#[derive(Parser, Debug)]
#[command(name = "civm-operator", version, about, long_about = None)]
struct Cli {
    /// 配置文件路径（YAML 或 JSON）
    #[arg(long, default_value = "/etc/civm/config.yaml")]
    config_file: PathBuf,

    /// 并发 worker 数量
    #[arg(long, default_value_t = 10)]
    num_workers: usize,

    /// 日志级别，RUST_LOG 优先
    #[arg(long, default_value = "debug")]
    log_level: String,

    /// 指标服务监听地址
    #[arg(long, default_value = "0.0.0.0:9090")]
    metrics_addr: SocketAddr,

    /// 输出 CRD 定义后退出
    #[arg(long)]
    print_crd: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    if cli.print_crd {
        println!("{}", serde_json::to_string_pretty(&VirtualMachine::crd())?);
        return Ok(());
    }

    let config = OperatorConfig::load(&cli.config_file)?;
    let operator = VmOperator::new(config).await?;

    let metrics = operator.metrics();
    let metrics_addr = cli.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = metrics.serve(metrics_addr).await {
            error!("指标服务器退出: {:#}", e);
        }
    });

    operator.run(cli.num_workers, shutdown_signal()).await?;
    info!("CIVM Operator 已退出");
    Ok(())
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow!("初始化日志失败: {}", e))
}

/// 第一次收到信号时开始优雅关闭，第二次直接退出
async fn shutdown_signal() {
    wait_for_signal().await;
    info!("收到关闭信号，开始优雅关闭");
    tokio::spawn(async {
        wait_for_signal().await;
        warn!("再次收到关闭信号，立即退出");
        std::process::exit(1);
    });
}

async fn wait_for_signal() {
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
}
