//! 入站事件：原始事件与分类后的类型化事件

use crate::collab::{AttachmentRef, CollabError, JobCompletion};
use crate::dialogs::DialogInstanceId;

use super::intent::Intent;

/// 进入会话队列的原始事件
///
/// 定时器与任务回调都带着产生它们的子对话实例 id，迟到的事件据此被丢弃。
#[derive(Debug, Clone)]
pub enum RawEvent {
    Text(String),
    Attachment(AttachmentRef),
    Callback(String),
    TimerTick {
        instance: DialogInstanceId,
    },
    JobFinished {
        instance: DialogInstanceId,
        result: Result<JobCompletion, CollabError>,
    },
}

impl RawEvent {
    /// 事件所属的子对话实例（用户输入不属于任何实例）
    pub fn instance(&self) -> Option<DialogInstanceId> {
        match self {
            RawEvent::TimerTick { instance } | RawEvent::JobFinished { instance, .. } => {
                Some(*instance)
            }
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RawEvent::Text(_) => "text",
            RawEvent::Attachment(_) => "attachment",
            RawEvent::Callback(_) => "callback",
            RawEvent::TimerTick { .. } => "timer_tick",
            RawEvent::JobFinished { .. } => "job_finished",
        }
    }
}

/// 分类后的事件
#[derive(Debug, Clone)]
pub enum Event {
    Text { text: String, intent: Intent },
    /// `rejected` 为真表示超过大小上限，未调用分类服务
    Attachment { attachment: AttachmentRef, rejected: bool },
    Callback(String),
    TimerTick,
    AsyncCompletion(Result<JobCompletion, CollabError>),
}

impl Event {
    pub fn intent(&self) -> Option<&Intent> {
        match self {
            Event::Text { intent, .. } => Some(intent),
            _ => None,
        }
    }

    /// 用户是否要求取消（文本意图或 cancel 按钮）
    pub fn is_cancel(&self) -> bool {
        match self {
            Event::Text { intent, .. } => *intent == Intent::Cancel,
            Event::Callback(data) => data == "cancel",
            _ => false,
        }
    }

    /// 肯定回答（文本意图或 yes 按钮）
    pub fn is_affirm(&self) -> bool {
        match self {
            Event::Text { intent, .. } => *intent == Intent::Affirm,
            Event::Callback(data) => data == "yes",
            _ => false,
        }
    }

    /// 否定回答（文本意图或 no 按钮）
    pub fn is_deny(&self) -> bool {
        match self {
            Event::Text { intent, .. } => *intent == Intent::Deny,
            Event::Callback(data) => data == "no",
            _ => false,
        }
    }
}
