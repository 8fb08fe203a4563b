//! CIVM Admission - VirtualMachine 准入 Webhook
//!
//! 该模块在 VirtualMachine 写入存储之前进行拦截：校验 spec 在创建后不被修改，
//! 并为每个资源注入删除 finalizer。

pub mod review;
pub mod server;

pub use review::{into_response, mutate, validate, Decision, ReviewError};
