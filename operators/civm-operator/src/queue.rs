//! 工作队列模块
//!
//! 以资源键为单位去重的工作队列：同一个键在队列中最多出现一次，正在处理中的键
//! 再次入队时只做标记，等 [`WorkQueue::done`] 调用后才重新排队。因此同一个资源
//! 在任何时刻最多只有一个 worker 在处理。

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

use crate::metrics::MetricsSink;
use crate::rate_limit::RateLimiter;

#[derive(Default)]
struct QueueState {
    /// 待处理的键，按入队顺序
    queue: VecDeque<String>,
    /// 需要处理的键（含已排队和处理中被再次标记的）
    dirty: HashSet<String>,
    /// 正在被 worker 处理的键
    processing: HashSet<String>,
    shutting_down: bool,
}

/// 带限速的去重工作队列
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    rate_limiter: Box<dyn RateLimiter>,
    metrics: Arc<dyn MetricsSink>,
}

impl WorkQueue {
    /// 创建新的工作队列
    pub fn new(rate_limiter: Box<dyn RateLimiter>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            rate_limiter,
            metrics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 将键加入队列
    pub fn add(&self, key: &str) {
        let depth = {
            let mut state = self.lock();
            if state.shutting_down || state.dirty.contains(key) {
                return;
            }
            state.dirty.insert(key.to_string());
            if state.processing.contains(key) {
                return;
            }
            state.queue.push_back(key.to_string());
            state.queue.len()
        };

        self.metrics.queue_depth(depth);
        self.notify.notify_one();
    }

    /// 延迟一段时间后将键加入队列
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.is_shutting_down() {
            return;
        }

        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// 按限速器给出的延迟重新入队，并记一次失败
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = self.rate_limiter.when(key);
        debug!("资源 {} 将在 {:?} 后重新入队", key, delay);
        self.metrics.requeued();
        self.add_after(key, delay);
    }

    /// 清除键的失败记录
    pub fn forget(&self, key: &str) {
        self.rate_limiter.forget(key);
    }

    /// 键已经被限速重试的次数
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.rate_limiter.num_requeues(key)
    }

    /// 取出下一个键；队列关闭且已清空时返回 `None`
    pub async fn get(&self) -> Option<String> {
        loop {
            // 先登记等待者再检查状态，避免漏掉检查之后到达的通知
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let depth = state.queue.len();
                    drop(state);
                    self.metrics.queue_depth(depth);
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// 标记键处理完成；处理期间被再次加入的键会重新排队
    pub fn done(&self, key: &str) {
        let requeued = {
            let mut state = self.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.queue.push_back(key.to_string());
                Some(state.queue.len())
            } else {
                None
            }
        };

        if let Some(depth) = requeued {
            self.metrics.queue_depth(depth);
            self.notify.notify_one();
        }
    }

    /// 关闭队列，之后的入队请求会被忽略，已排队的键仍会被取出
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// 排队中的键数量
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
