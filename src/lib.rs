//! PrintGuide - 3D 打印引导对话引擎
//!
//! 模块划分：
//! - **fsm**: 状态转移表（纯数据）与状态机引擎
//! - **router**: 入站事件、意图表、上下文范围与事件路由
//! - **collab**: 外部协作者 trait（分类、通道、附件、切片任务、搜索、文案）及本地 / mock 实现
//! - **dialogs**: 子对话（对象收集、模型搜索、切片、检查清单、教程）
//! - **core**: 错误与恢复、会话监管、状态快照、顶层编排器
//! - **gateway**: 会话数据与会话注册表
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **observability**: 日志初始化

pub mod collab;
pub mod config;
pub mod core;
pub mod dialogs;
pub mod fsm;
pub mod gateway;
pub mod observability;
pub mod router;
