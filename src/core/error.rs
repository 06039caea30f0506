//! 对话错误分类与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 DialogError 决定 Reprompt / NotifyLimit / Apologize / SafeMessage。

use thiserror::Error;

use crate::collab::CollabError;

/// 事件处理路径上可能出现的错误（用户输入、资源限制、外部服务、内部不变量）
#[derive(Error, Debug, Clone)]
pub enum DialogError {
    /// 无法识别的意图、格式错误的数值输入：重新提示，状态不变
    #[error("Unrecognized input: {0}")]
    UserInput(String),

    /// 附件超限：提示用户，状态不变，不调用分类服务
    #[error("Attachment of {size} bytes exceeds limit of {limit} bytes")]
    ResourceLimit { size: u64, limit: u64 },

    /// 分类 / 发送 / 任务服务不可用或报错：道歉，状态保持，下一次输入重试同一步
    #[error("External service error: {0}")]
    ExternalService(#[from] CollabError),

    /// 表中缺少本应存在的转移、未订阅的子对话信号等
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl DialogError {
    pub fn user_input(msg: impl Into<String>) -> Self {
        Self::UserInput(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 重新提示当前步骤
    Reprompt(String),
    /// 资源超限提示
    NotifyLimit(String),
    /// 外部服务故障的通用道歉
    Apologize(String),
    /// 内部错误：只发送安全的通用消息
    SafeMessage(String),
}

impl RecoveryAction {
    /// 发给用户的文本
    pub fn text(&self) -> &str {
        match self {
            RecoveryAction::Reprompt(t)
            | RecoveryAction::NotifyLimit(t)
            | RecoveryAction::Apologize(t)
            | RecoveryAction::SafeMessage(t) => t,
        }
    }
}
