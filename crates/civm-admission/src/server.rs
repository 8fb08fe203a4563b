//! Webhook 服务模块
//!
//! 暴露 `/validate` 与 `/mutate` 两个 HTTPS 端点，请求体必须是 JSON 编码的
//! AdmissionReview。

use anyhow::{Context, Result};
use kube::core::{
    admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
    DynamicObject,
};
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use tracing::{error, info, warn};
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::reply::{self, Reply, Response};
use warp::{Filter, Rejection};

use crate::review::{self, Decision, ReviewError};

/// 准入端点类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewKind {
    Validate,
    Mutate,
}

impl ReviewKind {
    fn decide(self, req: &AdmissionRequest<DynamicObject>) -> Result<Decision, ReviewError> {
        match self {
            ReviewKind::Validate => review::validate(req),
            ReviewKind::Mutate => review::mutate(req),
        }
    }
}

fn is_json(content_type: Option<&str>) -> bool {
    content_type
        .and_then(|value| value.split(';').next())
        .map(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
        .unwrap_or(false)
}

/// 处理一次准入请求
pub fn handle(kind: ReviewKind, content_type: Option<String>, body: Bytes) -> Response {
    if !is_json(content_type.as_deref()) {
        error!(
            "请求的 Content-Type 为 {:?}，期望 application/json",
            content_type
        );
        return reply::with_status(warp::reply(), StatusCode::UNSUPPORTED_MEDIA_TYPE).into_response();
    }

    let review: AdmissionReview<DynamicObject> = match serde_json::from_slice(&body) {
        Ok(review) => review,
        Err(e) => {
            error!("解析准入请求失败: {}", e);
            return reply::json(&AdmissionResponse::invalid(e.to_string()).into_review())
                .into_response();
        }
    };
    let req: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!("准入请求无效: {}", e);
            return reply::json(&AdmissionResponse::invalid(e.to_string()).into_review())
                .into_response();
        }
    };

    let decision = kind.decide(&req);
    match &decision {
        Ok(Decision::Allowed) => info!(
            "{:?} 放行 {:?} {}/{}",
            kind, req.operation, req.namespace.as_deref().unwrap_or_default(), req.name
        ),
        Ok(Decision::Patched(_)) => info!(
            "{:?} 为 {}/{} 添加 finalizer",
            kind, req.namespace.as_deref().unwrap_or_default(), req.name
        ),
        Ok(Decision::Denied { message, .. }) => warn!(
            "{:?} 拒绝 {:?} {}/{}: {}",
            kind, req.operation, req.namespace.as_deref().unwrap_or_default(), req.name, message
        ),
        Err(e) => error!("{:?} 处理 {} 失败: {}", kind, req.name, e),
    }

    reply::json(&review::into_response(&req, decision).into_review()).into_response()
}

fn endpoint(
    name: &'static str,
    kind: ReviewKind,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::post()
        .and(warp::path(name))
        .and(warp::path::end())
        .and(warp::header::optional::<String>("content-type"))
        .and(warp::body::bytes())
        .map(move |content_type, body| handle(kind, content_type, body))
}

/// 全部路由
pub fn routes() -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    endpoint("validate", ReviewKind::Validate)
        .or(endpoint("mutate", ReviewKind::Mutate))
        .unify()
        .with(warp::trace::request())
}

/// 以 TLS 启动 Webhook 服务，`shutdown` 完成后优雅退出
pub async fn serve<F>(addr: SocketAddr, cert: &Path, key: &Path, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let cert_pem = std::fs::read(cert)
        .with_context(|| format!("读取证书 {} 失败", cert.display()))?;
    let key_pem = std::fs::read(key)
        .with_context(|| format!("读取私钥 {} 失败", key.display()))?;

    let (bound, server) = warp::serve(routes())
        .tls()
        .cert(cert_pem)
        .key(key_pem)
        .bind_with_graceful_shutdown(addr, shutdown);
    info!("准入 Webhook 监听在 {}", bound);
    server.await;
    info!("准入 Webhook 已停止");
    Ok(())
}
