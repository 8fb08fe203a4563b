//! 事件处理模块
//!
//! 该模块监听集群中的 VirtualMachine 资源，把 watch 事件翻译为新增、更新、删除
//! 三类通知，并把对应的资源键放入工作队列。第一次完整列举结束时发出缓存同步信号。
//! 此外按固定周期把所有已知资源作为更新通知重新入队。

use futures::{Stream, StreamExt};
use kube::{
    api::Api,
    client::Client,
    runtime::watcher::{self, watcher},
};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use civm_common::VirtualMachine;

use crate::queue::WorkQueue;

/// 监听出错后的重试间隔
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// 删除通知携带的最后状态
#[derive(Debug, Clone)]
pub enum DeletedState {
    /// 观察到的最后一个版本
    Final(VirtualMachine),
    /// 重新列举时发现资源已消失，只知道资源键
    Tombstone { key: String },
}

/// 资源变更通知
#[derive(Debug, Clone)]
pub enum Notification {
    /// 资源新增
    Added(VirtualMachine),
    /// 资源修改
    Updated(VirtualMachine),
    /// 资源删除
    Deleted(DeletedState),
}

impl Notification {
    /// 通知对应的资源键
    pub fn key(&self) -> String {
        match self {
            Notification::Added(vm) | Notification::Updated(vm) => vm.key(),
            Notification::Deleted(DeletedState::Final(vm)) => vm.key(),
            Notification::Deleted(DeletedState::Tombstone { key }) => key.clone(),
        }
    }
}

/// 三类通知统一按资源键入队
pub fn enqueue(queue: &WorkQueue, notification: &Notification) {
    let key = notification.key();
    debug!("资源 {} 变更，加入队列", key);
    queue.add(&key);
}

/// 事件处理器结构体
pub struct EventHandler {
    /// 工作队列
    queue: Arc<WorkQueue>,
    /// 已观察到的资源，按资源键保存最后一个版本
    known: HashMap<String, VirtualMachine>,
    /// 缓存同步信号
    synced: watch::Sender<bool>,
    /// 周期性重新入队的间隔，为零时不启用
    resync: Duration,
}

impl EventHandler {
    /// 创建新的事件处理器，同时返回缓存同步信号的接收端
    pub fn new(queue: Arc<WorkQueue>, resync: Duration) -> (Self, watch::Receiver<bool>) {
        let (synced, synced_rx) = watch::channel(false);
        let handler = Self {
            queue,
            known: HashMap::new(),
            synced,
            resync,
        };
        (handler, synced_rx)
    }

    /// 把一个 watch 事件翻译为通知
    pub fn translate(&mut self, event: watcher::Event<VirtualMachine>) -> Vec<Notification> {
        match event {
            watcher::Event::Applied(vm) => vec![self.observe(vm)],
            watcher::Event::Deleted(vm) => {
                self.known.remove(&vm.key());
                vec![Notification::Deleted(DeletedState::Final(vm))]
            }
            watcher::Event::Restarted(vms) => {
                let listed: HashSet<String> = vms.iter().map(|vm| vm.key()).collect();
                let mut gone: Vec<String> = self
                    .known
                    .keys()
                    .filter(|key| !listed.contains(*key))
                    .cloned()
                    .collect();
                gone.sort();

                let mut notifications: Vec<Notification> =
                    vms.into_iter().map(|vm| self.observe(vm)).collect();
                notifications.extend(gone.into_iter().map(|key| {
                    self.known.remove(&key);
                    Notification::Deleted(DeletedState::Tombstone { key })
                }));
                notifications
            }
        }
    }

    fn observe(&mut self, vm: VirtualMachine) -> Notification {
        match self.known.insert(vm.key(), vm.clone()) {
            None => Notification::Added(vm),
            Some(_) => Notification::Updated(vm),
        }
    }

    /// 把所有已知资源作为更新通知
    pub fn resync_notifications(&self) -> Vec<Notification> {
        let mut vms: Vec<&VirtualMachine> = self.known.values().collect();
        vms.sort_by_key(|vm| vm.key());
        vms.into_iter()
            .map(|vm| Notification::Updated(vm.clone()))
            .collect()
    }

    fn resync_all(&self) {
        let notifications = self.resync_notifications();
        debug!("周期性重新入队 {} 个 VirtualMachine", notifications.len());
        for notification in &notifications {
            enqueue(&self.queue, notification);
        }
    }

    /// 处理一个 watch 事件
    pub fn handle_event(&mut self, event: watcher::Event<VirtualMachine>) {
        let restarted = matches!(event, watcher::Event::Restarted(_));
        for notification in self.translate(event) {
            enqueue(&self.queue, &notification);
        }

        if restarted && !*self.synced.borrow() {
            info!("VirtualMachine 缓存同步完成，共 {} 个资源", self.known.len());
            self.synced.send_replace(true);
        }
    }

    /// 监听所有命名空间的 VirtualMachine，直到 `shutdown` 完成
    pub async fn run<F>(self, client: Client, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let api: Api<VirtualMachine> = Api::all(client);
        let stream = watcher(api, watcher::Config::default()).boxed();
        self.consume(stream, shutdown).await;
    }

    /// 消费 watch 事件流，同时按周期重新入队
    pub async fn consume<S, F>(mut self, mut stream: S, shutdown: F)
    where
        S: Stream<Item = watcher::Result<watcher::Event<VirtualMachine>>> + Unpin + Send,
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        let mut ticker = (!self.resync.is_zero()).then(|| {
            let mut ticker = interval_at(Instant::now() + self.resync, self.resync);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        info!("启动 VirtualMachine 监听器");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = next_tick(&mut ticker) => self.resync_all(),
                item = stream.next() => match item {
                    Some(Ok(event)) => self.handle_event(event),
                    Some(Err(e)) => {
                        warn!("监听 VirtualMachine 失败: {}", e);
                        tokio::select! {
                            _ = &mut shutdown => break,
                            _ = tokio::time::sleep(WATCH_RETRY_DELAY) => {}
                        }
                    }
                    None => break,
                }
            }
        }
        info!("VirtualMachine 监听器已停止");
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
