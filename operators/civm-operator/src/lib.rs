//! CIVM Operator - 将 VirtualMachine 资源协调为云上计算实例
//!
//! 该模块把各个组件装配为一个完整的 Operator：监听器把资源变更放入工作队列，
//! 控制器的 worker 从队列取出资源键交给协调器，协调器通过编排器创建或删除
//! 计算实例，并把结果写回资源状态。

pub mod cluster;
pub mod config;
pub mod controller;
pub mod credentials;
pub mod event_handler;
pub mod gce;
pub mod metrics;
pub mod queue;
pub mod rate_limit;
pub mod reconcile;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use kube::Client;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use cluster::KubeClusterClient;
use config::OperatorConfig;
use controller::Controller;
use event_handler::EventHandler;
use gce::client::RestComputeClient;
use gce::GceOrchestrator;
use metrics::PrometheusMetrics;
use queue::WorkQueue;
use reconcile::Reconciler;

/// Operator 主结构体
pub struct VmOperator {
    /// Kubernetes 客户端
    client: Client,
    /// Operator 配置
    config: OperatorConfig,
    /// 指标
    metrics: Arc<PrometheusMetrics>,
}

impl VmOperator {
    /// 创建新的 Operator 实例
    pub async fn new(config: OperatorConfig) -> Result<Self> {
        // 创建 Kubernetes 客户端
        let client = Client::try_default()
            .await
            .context("创建 Kubernetes 客户端失败")?;
        let metrics = Arc::new(PrometheusMetrics::new().context("注册指标失败")?);

        Ok(Self {
            client,
            config,
            metrics,
        })
    }

    pub fn metrics(&self) -> Arc<PrometheusMetrics> {
        self.metrics.clone()
    }

    /// 运行 Operator 直到 `shutdown` 完成
    pub async fn run<F>(self, workers: usize, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cluster = Arc::new(KubeClusterClient::new(self.client.clone()));
        let compute =
            Arc::new(RestComputeClient::new(&self.config.compute).context("创建计算引擎客户端失败")?);
        let orchestrator = Arc::new(GceOrchestrator::new(
            self.config.clone(),
            compute,
            cluster.clone(),
            self.metrics.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(cluster, orchestrator));

        let queue = Arc::new(WorkQueue::new(
            Box::new(rate_limit::default_controller_rate_limiter(&self.config.queue)),
            self.metrics.clone(),
        ));
        let controller = Arc::new(Controller::new(
            reconciler,
            queue.clone(),
            self.config.queue.max_retries,
            self.metrics.clone(),
        ));
        let (event_handler, synced) = EventHandler::new(
            queue,
            Duration::from_secs(self.config.queue.resync_seconds),
        );

        // 关闭信号同时通知监听器与控制器
        let (stop_tx, stop_rx) = watch::channel(false);
        let signal = tokio::spawn(async move {
            shutdown.await;
            let _ = stop_tx.send(true);
        });
        let watcher = tokio::spawn(event_handler.run(self.client, stopped(stop_rx.clone())));

        info!(
            "CIVM Operator 已启动，项目 {}，区域 {}",
            self.config.project, self.config.zone
        );
        let result = controller.run(workers, synced, stopped(stop_rx)).await;

        signal.abort();
        watcher.abort();
        let _ = watcher.await;
        result
    }
}

/// 等待关闭信号；发送端被丢弃也视为关闭
async fn stopped(mut stop: watch::Receiver<bool>) {
    while !*stop.borrow() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}
