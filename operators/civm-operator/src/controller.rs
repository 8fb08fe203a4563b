//! 控制器模块
//!
//! 控制器持有工作队列与协调器：等待缓存同步后启动固定数量的 worker，每个 worker
//! 循环从队列取出资源键并协调，失败时按限速策略重新入队，超过最大重试次数后丢弃。

use anyhow::{anyhow, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use civm_common::Error;

use crate::metrics::{MetricsSink, ReconcileOutcome};
use crate::queue::WorkQueue;
use crate::reconcile::Reconcile;

/// 控制器结构体
pub struct Controller<R: Reconcile> {
    /// 协调器
    reconciler: Arc<R>,
    /// 工作队列
    queue: Arc<WorkQueue>,
    /// 单个资源的最大重试次数
    max_retries: u32,
    metrics: Arc<dyn MetricsSink>,
}

impl<R: Reconcile> Controller<R> {
    /// 创建新的控制器
    pub fn new(
        reconciler: Arc<R>,
        queue: Arc<WorkQueue>,
        max_retries: u32,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            reconciler,
            queue,
            max_retries,
            metrics,
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        self.queue.clone()
    }

    /// 运行控制器直到 `shutdown` 完成
    ///
    /// 在 `synced` 变为 true 之前不会取出任何资源键。关闭时队列不再接受新的键，
    /// worker 处理完已排队的键后退出。
    pub async fn run<F>(
        self: Arc<Self>,
        workers: usize,
        mut synced: watch::Receiver<bool>,
        shutdown: F,
    ) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);

        info!("等待缓存同步");
        tokio::select! {
            res = wait_for_sync(&mut synced) => {
                if let Err(e) = res {
                    self.queue.shut_down();
                    return Err(e);
                }
            }
            _ = &mut shutdown => {
                info!("缓存同步前收到关闭信号");
                self.queue.shut_down();
                return Ok(());
            }
        }

        info!("启动 {} 个 worker", workers);
        let mut set = JoinSet::new();
        for id in 0..workers {
            let controller = self.clone();
            set.spawn(async move { controller.worker(id).await });
        }

        shutdown.await;
        info!("关闭控制器，等待 worker 退出");
        self.queue.shut_down();
        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                error!("worker 异常退出: {}", e);
            }
        }

        info!("控制器已停止");
        Ok(())
    }

    async fn worker(&self, id: usize) {
        debug!("worker {} 启动", id);
        while self.process_next_work_item().await {}
        debug!("worker {} 退出", id);
    }

    /// 处理一个资源键，队列关闭后返回 false
    async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let result = self.reconciler.reconcile(&key).await;
        self.handle_result(&key, result);
        self.queue.done(&key);
        true
    }

    fn handle_result(&self, key: &str, result: civm_common::Result<()>) {
        let err = match result {
            Ok(()) => {
                self.metrics.reconcile_finished(ReconcileOutcome::Success);
                self.queue.forget(key);
                return;
            }
            Err(err) => err,
        };

        self.metrics.reconcile_finished(ReconcileOutcome::Failure);
        if self.queue.num_requeues(key) < self.max_retries {
            warn!("同步虚拟机 {} 失败，稍后重试: {}", key, err);
            self.queue.add_rate_limited(key);
            return;
        }

        error!(
            "虚拟机 {} 重试 {} 次后仍失败，移出队列: {}",
            key, self.max_retries, err
        );
        self.metrics.dropped();
        self.queue.forget(key);
    }
}

async fn wait_for_sync(synced: &mut watch::Receiver<bool>) -> Result<()> {
    while !*synced.borrow() {
        synced
            .changed()
            .await
            .map_err(|_| anyhow!(Error::Config("缓存同步信号已关闭".to_string())))?;
    }
    info!("缓存同步完成");
    Ok(())
}
