//! 会话监管：取消令牌层级
//!
//! 会话持有根 token；每个子对话实例拿一个子 token，供其定时器、任务回调转发使用。
//! 子对话结束或被取消时只取消子 token；会话被移除时取消根 token，所有子 token 随之失效。

use tokio_util::sync::CancellationToken;

use crate::dialogs::DialogInstanceId;

/// 会话级生命周期管理：根 token + 当前子对话实例 token
#[derive(Debug)]
pub struct SessionSupervisor {
    cancel_token: CancellationToken,
    /// 当前活动子对话实例及其 token
    active: Option<(DialogInstanceId, CancellationToken)>,
}

impl SessionSupervisor {
    pub fn new(cancel_token: CancellationToken) -> Self {
        Self {
            cancel_token,
            active: None,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 会话终止：取消根 token
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 为新子对话实例创建子 token；若仍有旧实例，先撤销它
    pub fn begin_instance(&mut self, instance: DialogInstanceId) -> CancellationToken {
        self.end_instance();
        let token = self.cancel_token.child_token();
        self.active = Some((instance, token.clone()));
        token
    }

    /// 撤销当前子对话实例：其定时器与迟到的回调都将被丢弃
    pub fn end_instance(&mut self) -> Option<DialogInstanceId> {
        self.active.take().map(|(instance, token)| {
            token.cancel();
            instance
        })
    }

    pub fn active_instance(&self) -> Option<DialogInstanceId> {
        self.active.as_ref().map(|(id, _)| *id)
    }

    /// 事件是否属于当前活动实例
    pub fn is_current(&self, instance: DialogInstanceId) -> bool {
        self.active_instance() == Some(instance)
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}
