//! 指标收集与导出模块
//!
//! 工作队列与编排器通过 [`MetricsSink`] 上报指标，具体实现在进程装配时注入。
//! [`PrometheusMetrics`] 在构造时一次性完成注册，并通过 `/metrics` 端点导出。

use anyhow::Result;
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// 协调结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Success,
    Failure,
}

impl ReconcileOutcome {
    fn as_label(self) -> &'static str {
        match self {
            ReconcileOutcome::Success => "success",
            ReconcileOutcome::Failure => "failure",
        }
    }
}

/// 指标上报接口
pub trait MetricsSink: Send + Sync {
    /// 当前排队中的资源数量
    fn queue_depth(&self, depth: usize);
    /// 一次协调结束
    fn reconcile_finished(&self, outcome: ReconcileOutcome);
    /// 资源被限速重新入队
    fn requeued(&self);
    /// 资源超过最大重试次数被丢弃
    fn dropped(&self);
    /// 等待一个云端异步操作所花费的时间
    fn operation_waited(&self, operation_type: &str, elapsed: Duration);
}

/// 不做任何事的指标实现
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn queue_depth(&self, _depth: usize) {}
    fn reconcile_finished(&self, _outcome: ReconcileOutcome) {}
    fn requeued(&self) {}
    fn dropped(&self) {}
    fn operation_waited(&self, _operation_type: &str, _elapsed: Duration) {}
}

/// Prometheus 指标实现
pub struct PrometheusMetrics {
    /// Prometheus 注册表
    registry: Registry,
    /// 队列深度
    queue_depth: IntGauge,
    /// 协调次数（按结果区分）
    reconcile_total: IntCounterVec,
    /// 重试次数
    retries_total: IntCounter,
    /// 丢弃次数
    dropped_total: IntCounter,
    /// 异步操作等待时长
    operation_wait_seconds: HistogramVec,
}

impl PrometheusMetrics {
    /// 创建并注册全部指标
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let queue_depth = IntGauge::new(
            "civm_workqueue_depth",
            "Number of virtual machine keys waiting in the work queue",
        )?;
        let reconcile_total = IntCounterVec::new(
            Opts::new("civm_reconcile_total", "Total number of reconcile passes"),
            &["result"],
        )?;
        let retries_total = IntCounter::new(
            "civm_workqueue_retries_total",
            "Total number of rate limited requeues",
        )?;
        let dropped_total = IntCounter::new(
            "civm_workqueue_dropped_total",
            "Total number of keys dropped after exhausting retries",
        )?;
        let operation_wait_seconds = HistogramVec::new(
            HistogramOpts::new(
                "civm_operation_wait_seconds",
                "Time spent waiting for compute operations",
            )
            .buckets(vec![5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
            &["operation_type"],
        )?;

        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(reconcile_total.clone()))?;
        registry.register(Box::new(retries_total.clone()))?;
        registry.register(Box::new(dropped_total.clone()))?;
        registry.register(Box::new(operation_wait_seconds.clone()))?;

        Ok(Self {
            registry,
            queue_depth,
            reconcile_total,
            retries_total,
            dropped_total,
            operation_wait_seconds,
        })
    }

    /// 获取 Prometheus 注册表
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// 启动 `/metrics` HTTP 服务，直到服务器出错才返回
    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let registry = self.registry.clone();

        let make_svc = make_service_fn(move |_| {
            let registry = registry.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let registry = registry.clone();
                    async move { Ok::<_, Infallible>(Self::render(&registry, req.uri().path())) }
                }))
            }
        });

        info!("指标服务器启动在 {}", addr);
        Server::try_bind(&addr)?.serve(make_svc).await?;
        Ok(())
    }

    fn render(registry: &Registry, path: &str) -> Response<Body> {
        let mut response = Response::new(Body::empty());
        if path != "/metrics" {
            *response.status_mut() = StatusCode::NOT_FOUND;
            return response;
        }

        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
            error!("编码指标失败: {}", e);
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            return response;
        }

        if let Ok(content_type) = encoder.format_type().parse() {
            response
                .headers_mut()
                .insert(hyper::header::CONTENT_TYPE, content_type);
        }
        *response.body_mut() = Body::from(buffer);
        response
    }
}

impl MetricsSink for PrometheusMetrics {
    fn queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    fn reconcile_finished(&self, outcome: ReconcileOutcome) {
        self.reconcile_total
            .with_label_values(&[outcome.as_label()])
            .inc();
    }

    fn requeued(&self) {
        self.retries_total.inc();
    }

    fn dropped(&self) {
        self.dropped_total.inc();
    }

    fn operation_waited(&self, operation_type: &str, elapsed: Duration) {
        self.operation_wait_seconds
            .with_label_values(&[operation_type])
            .observe(elapsed.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_registered_once() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.queue_depth(3);
        metrics.reconcile_finished(ReconcileOutcome::Failure);
        metrics.requeued();
        metrics.operation_waited("insert", Duration::from_secs(12));

        let names: Vec<String> = metrics
            .registry()
            .gather()
            .iter()
            .map(|f| f.get_name().to_string())
            .collect();
        assert!(names.contains(&"civm_workqueue_depth".to_string()));
        assert!(names.contains(&"civm_reconcile_total".to_string()));
        assert!(names.contains(&"civm_operation_wait_seconds".to_string()));
        assert_eq!(metrics.queue_depth.get(), 3);
        assert_eq!(metrics.retries_total.get(), 1);
    }

    #[test]
    fn test_render_metrics_endpoint() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.dropped();

        let ok = PrometheusMetrics::render(metrics.registry(), "/metrics");
        assert_eq!(ok.status(), StatusCode::OK);

        let missing = PrometheusMetrics::render(metrics.registry(), "/other");
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
