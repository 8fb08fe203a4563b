//! 区域操作轮询

use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use civm_common::{Error, Operation, Result};

use super::client::ComputeClient;

/// 等待区域操作结束
///
/// 每轮先检查操作携带的错误，再检查是否完成；两者都不满足时休眠一个轮询间隔后
/// 重新查询。超过 `timeout` 仍未完成则返回 [`Error::OperationTimeout`]。
pub async fn wait_for_operation(
    compute: &dyn ComputeClient,
    project: &str,
    mut operation: Operation,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<Operation> {
    let started = Instant::now();
    let deadline = started + timeout;

    loop {
        let errors = operation.error_messages();
        if !errors.is_empty() {
            return Err(Error::OperationFailed(errors.join("\n")));
        }
        if operation.is_done() {
            debug!(
                "操作 {} 在 {:?} 后完成",
                operation.name,
                started.elapsed()
            );
            return Ok(operation);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::OperationTimeout {
                operation: operation.name,
                elapsed: started.elapsed(),
            });
        }

        tokio::time::sleep(poll_interval.min(deadline - now)).await;
        debug!("查询操作 {} 状态 ({}%)", operation.name, operation.progress);
        operation = compute
            .get_zone_operation(project, operation.zone_name(), &operation.name)
            .await?;
    }
}
