//! 错误恢复引擎
//!
//! 根据 DialogError 类型返回 RecoveryAction；编排器执行该动作（发一条消息），从不因此改变状态。

use crate::core::{DialogError, RecoveryAction};

/// 错误 → 用户可见动作的映射，同时按严重级别记日志
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, session_id: &str, err: &DialogError) -> RecoveryAction {
        match err {
            DialogError::UserInput(detail) => {
                tracing::warn!(session_id, "user input not understood: {}", detail);
                RecoveryAction::Reprompt(
                    "Sorry, I didn't get that. Could you rephrase it?".to_string(),
                )
            }
            DialogError::ResourceLimit { size, limit } => {
                tracing::warn!(session_id, size, limit, "attachment rejected");
                RecoveryAction::NotifyLimit(format!(
                    "That file is too large ({} MB). The limit is {} MB.",
                    size / 1_000_000,
                    limit / 1_000_000
                ))
            }
            DialogError::ExternalService(e) => {
                tracing::warn!(session_id, "external service failed: {}", e);
                RecoveryAction::Apologize(
                    "Sorry, something went wrong on my side. Please try again.".to_string(),
                )
            }
            DialogError::InvariantViolation(detail) => {
                tracing::error!(session_id, "invariant violation: {}", detail);
                RecoveryAction::SafeMessage(
                    "Sorry, I can't do that right now.".to_string(),
                )
            }
        }
    }

    /// 子对话以 Failed 结束：记录原因，只给用户通用道歉
    pub fn dialog_failed(&self, session_id: &str, dialog: &str, reason: &str) -> RecoveryAction {
        tracing::warn!(session_id, dialog, "dialog failed: {}", reason);
        RecoveryAction::Apologize(
            "Sorry, that didn't work out. Let's go back to the menu.".to_string(),
        )
    }
}
