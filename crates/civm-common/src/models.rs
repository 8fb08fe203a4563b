//! 数据模型模块
//!
//! 该模块定义了项目中使用的核心数据模型：VirtualMachine 自定义资源，
//! 以及与云厂商计算接口交互时使用的实例、磁盘、异步操作等结构。

pub mod virtual_machine;
pub mod compute;
