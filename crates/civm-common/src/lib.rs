//! CIVM Common - 跨模块共享的数据模型与错误处理
//!
//! 该模块提供 Operator 与准入控制器共同使用的数据结构：VirtualMachine 自定义资源、
//! 计算引擎 REST 接口的数据模型，以及统一的错误类型。

pub mod models;
pub mod error;

/// 重新导出常用类型，方便使用
pub use error::ComputeError;
pub use error::Error;
pub use error::Result;
pub use models::compute::*;
pub use models::virtual_machine::*;
