//! 会话数据
//!
//! 只由该会话的串行处理路径修改：编排器持有 `Session`，注册表只看得到快照和最后活跃时间。

use chrono::{DateTime, Utc};

use crate::collab::JobCompletion;
use crate::router::ContextScope;

/// 会话 ID（由宿主的通道决定，如聊天 ID）
pub type SessionId = String;

/// 单个会话
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub user_name: Option<String>,
    /// 对象收集对话得到的打印对象描述
    pub pending_print_object: Option<String>,
    /// 下一次模型搜索的初始搜索词
    pub pending_search_term: Option<String>,
    /// 上传或搜索选中的模型（本地路径或下载链接）
    pub selected_model_path: Option<String>,
    pub selected_model_name: Option<String>,
    /// 最近一次切片结果
    pub last_slice: Option<JobCompletion>,
    pub context_scope: ContextScope,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<SessionId>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            user_name: None,
            pending_print_object: None,
            pending_search_term: None,
            selected_model_path: None,
            selected_model_name: None,
            last_slice: None,
            context_scope: ContextScope::new(),
            created_at: now,
            last_activity_at: now,
        }
    }

    /// 更新最后活跃时间
    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    /// 回到主菜单时清掉一次性的任务数据（用户名保留）
    pub fn clear_task(&mut self) {
        self.pending_print_object = None;
        self.pending_search_term = None;
        self.selected_model_path = None;
        self.selected_model_name = None;
    }
}
