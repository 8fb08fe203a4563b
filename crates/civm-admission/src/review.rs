//! 准入决策模块
//!
//! `validate` 保证 VirtualMachine 的 spec 在创建后不可修改，`mutate` 保证每个资源都
//! 带有删除 finalizer。两者只产生 [`Decision`]，由 [`into_response`] 转换为
//! 准入响应。

use kube::core::{
    admission::{AdmissionRequest, AdmissionResponse, Operation},
    DynamicObject,
};
use serde_json::json;
use thiserror::Error;

use civm_common::{VirtualMachine, VIRTUAL_MACHINE_FINALIZER};

/// 拒绝原因
pub const FORBIDDEN_REASON: &str = "Forbidden";
/// 修改 spec 时返回的消息
pub const SPEC_UPDATE_FORBIDDEN: &str = "Updates to spec are forbidden for VirtualMachines";

/// 准入请求处理错误
#[derive(Error, Debug)]
pub enum ReviewError {
    /// 请求缺少对象
    #[error("准入请求缺少 {0}")]
    MissingObject(&'static str),

    /// 对象无法解析为 VirtualMachine
    #[error("解析 VirtualMachine 失败: {0}")]
    Decode(#[from] serde_json::Error),
}

/// 准入决策
#[derive(Debug, Clone)]
pub enum Decision {
    /// 放行
    Allowed,
    /// 放行并附带 JSON Patch
    Patched(json_patch::Patch),
    /// 拒绝
    Denied {
        reason: String,
        message: String,
    },
}

fn decode(object: Option<&DynamicObject>, field: &'static str) -> Result<VirtualMachine, ReviewError> {
    let object = object.ok_or(ReviewError::MissingObject(field))?;
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

/// 校验更新请求：只允许通过 status 子资源修改，或 spec 保持不变
pub fn validate(req: &AdmissionRequest<DynamicObject>) -> Result<Decision, ReviewError> {
    if req.sub_resource.as_deref() == Some("status") {
        return Ok(Decision::Allowed);
    }
    if req.operation != Operation::Update {
        return Ok(Decision::Allowed);
    }

    let new_vm = decode(req.object.as_ref(), "object")?;
    let old_vm = decode(req.old_object.as_ref(), "oldObject")?;
    if old_vm.spec == new_vm.spec {
        Ok(Decision::Allowed)
    } else {
        Ok(Decision::Denied {
            reason: FORBIDDEN_REASON.to_string(),
            message: SPEC_UPDATE_FORBIDDEN.to_string(),
        })
    }
}

/// 为缺少删除 finalizer 的资源生成补丁
///
/// 已有 finalizer 或已请求删除时直接放行，删除中的资源不能再添加 finalizer。
pub fn mutate(req: &AdmissionRequest<DynamicObject>) -> Result<Decision, ReviewError> {
    let vm = decode(req.object.as_ref(), "object")?;
    if vm.has_finalizer() || vm.deletion_requested() {
        return Ok(Decision::Allowed);
    }

    let operation = match vm.metadata.finalizers {
        None => json!({
            "op": "add",
            "path": "/metadata/finalizers",
            "value": [VIRTUAL_MACHINE_FINALIZER],
        }),
        Some(mut finalizers) => {
            finalizers.push(VIRTUAL_MACHINE_FINALIZER.to_string());
            json!({
                "op": "replace",
                "path": "/metadata/finalizers",
                "value": finalizers,
            })
        }
    };
    let patch: json_patch::Patch = serde_json::from_value(json!([operation]))?;
    Ok(Decision::Patched(patch))
}

/// 将决策转换为准入响应，出错时以错误信息拒绝
pub fn into_response(
    req: &AdmissionRequest<DynamicObject>,
    decision: Result<Decision, ReviewError>,
) -> AdmissionResponse {
    let response = AdmissionResponse::from(req);
    match decision {
        Ok(Decision::Allowed) => response,
        Ok(Decision::Patched(patch)) => match AdmissionResponse::from(req).with_patch(patch) {
            Ok(patched) => patched,
            Err(e) => response.deny(format!("生成补丁失败: {e}")),
        },
        Ok(Decision::Denied { reason, message }) => {
            let mut denied = response.deny(message);
            denied.result.reason = reason;
            denied.result.code = 403;
            denied
        }
        Err(e) => response.deny(e.to_string()),
    }
}
